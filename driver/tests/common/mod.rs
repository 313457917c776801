//! Recording mocks of the pins, SPI bus, delay and serial link of a BMV31K304 board.
//!
//! All mocks write into one shared [`Hardware`] log so that the order of pin changes, delays and
//! SPI traffic can be checked across peripherals.

#![allow(dead_code)]

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::convert::Infallible;
use std::rc::Rc;

use bmv31k304_driver::{Bmv31k304, Initialized, NotInitialized, Peripherals};
use embedded_hal::delay::DelayNs;
use embedded_hal::digital::{ErrorType, InputPin, OutputPin};
use embedded_hal::spi::SpiBus;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Line {
    Sel,
    Power,
    Data,
    IcpCk,
    IcpDa,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    Level(Line, bool),
    Input(Line),
    Output(Line),
    DelayNs(u32),
}

#[derive(Default)]
pub struct Hardware {
    pub events: Vec<Event>,
    /// MOSI bytes of every chip select frame
    pub transactions: Vec<Vec<u8>>,
    /// MISO bytes, zero once exhausted
    pub miso: VecDeque<u8>,
    /// Scripted input levels, low once exhausted
    pub inputs: HashMap<Line, VecDeque<bool>>,
}

impl Hardware {
    pub fn script_input(&mut self, line: Line, levels: &[bool]) {
        self.inputs.entry(line).or_default().extend(levels);
    }

    /// Chip select frames that carried any data
    pub fn frames(&self) -> Vec<Vec<u8>> {
        self.transactions
            .iter()
            .filter(|frame| !frame.is_empty())
            .cloned()
            .collect()
    }

    /// Frames that start with the given opcode
    pub fn frames_with_opcode(&self, opcode: u8) -> Vec<Vec<u8>> {
        self.frames()
            .into_iter()
            .filter(|frame| frame[0] == opcode)
            .collect()
    }

    pub fn levels(&self, line: Line) -> Vec<bool> {
        self.events
            .iter()
            .filter_map(|event| match event {
                Event::Level(l, level) if *l == line => Some(*level),
                _ => None,
            })
            .collect()
    }

    pub fn elapsed_us(&self) -> u64 {
        self.events
            .iter()
            .map(|event| match event {
                Event::DelayNs(ns) => u64::from(*ns),
                _ => 0,
            })
            .sum::<u64>()
            / 1000
    }

    /// Decode the single-wire bytes sent on DATA from the level/delay trace.
    ///
    /// Each byte is a 5ms low start, 8 bits LSB first where a 1200us high phase is a one, and a 5ms high stop.
    pub fn data_line_bytes(&self) -> Vec<u8> {
        let mut phases = Vec::new();
        let mut level = true;
        for event in &self.events {
            match event {
                Event::Level(Line::Data, l) => level = *l,
                Event::DelayNs(ns) => phases.push((level, ns / 1000)),
                _ => {}
            }
        }

        let mut bytes = Vec::new();
        let mut iter = phases.into_iter();
        while let Some(phase) = iter.next() {
            if phase != (false, 5000) {
                continue;
            }
            let mut byte = 0u8;
            for bit in 0..8 {
                let (_, high) = iter.next().unwrap();
                let _low = iter.next().unwrap();
                if high == 1200 {
                    byte |= 1 << bit;
                }
            }
            assert_eq!(iter.next(), Some((true, 5000)));
            bytes.push(byte);
        }
        bytes
    }
}

pub type Shared = Rc<RefCell<Hardware>>;

pub struct Pin {
    line: Line,
    hw: Shared,
}

impl ErrorType for Pin {
    type Error = Infallible;
}

impl OutputPin for Pin {
    fn set_low(&mut self) -> Result<(), Infallible> {
        let mut hw = self.hw.borrow_mut();
        hw.events.push(Event::Level(self.line, false));
        if self.line == Line::Sel {
            hw.transactions.push(Vec::new());
        }
        Ok(())
    }

    fn set_high(&mut self) -> Result<(), Infallible> {
        self.hw
            .borrow_mut()
            .events
            .push(Event::Level(self.line, true));
        Ok(())
    }
}

impl InputPin for Pin {
    fn is_high(&mut self) -> Result<bool, Infallible> {
        let mut hw = self.hw.borrow_mut();
        Ok(hw
            .inputs
            .get_mut(&self.line)
            .and_then(VecDeque::pop_front)
            .unwrap_or(false))
    }

    fn is_low(&mut self) -> Result<bool, Infallible> {
        self.is_high().map(|high| !high)
    }
}

impl bmv31k304_driver::pac::BidiPin for Pin {
    fn set_to_input(&mut self) {
        self.hw.borrow_mut().events.push(Event::Input(self.line));
    }

    fn set_to_output(&mut self) {
        self.hw.borrow_mut().events.push(Event::Output(self.line));
    }
}

pub struct Spi {
    hw: Shared,
}

impl embedded_hal::spi::ErrorType for Spi {
    type Error = Infallible;
}

impl Spi {
    fn record(&self, words: &[u8]) {
        let mut hw = self.hw.borrow_mut();
        match hw.transactions.last_mut() {
            Some(frame) => frame.extend_from_slice(words),
            None => panic!("SPI traffic without chip select"),
        }
    }

    fn respond(&self, words: &mut [u8]) {
        let mut hw = self.hw.borrow_mut();
        for word in words {
            *word = hw.miso.pop_front().unwrap_or(0);
        }
    }
}

impl SpiBus<u8> for Spi {
    fn read(&mut self, words: &mut [u8]) -> Result<(), Infallible> {
        self.record(&vec![0xFF; words.len()]);
        self.respond(words);
        Ok(())
    }

    fn write(&mut self, words: &[u8]) -> Result<(), Infallible> {
        self.record(words);
        Ok(())
    }

    fn transfer(&mut self, read: &mut [u8], write: &[u8]) -> Result<(), Infallible> {
        self.record(write);
        self.respond(read);
        Ok(())
    }

    fn transfer_in_place(&mut self, words: &mut [u8]) -> Result<(), Infallible> {
        self.record(words);
        self.respond(words);
        Ok(())
    }

    fn flush(&mut self) -> Result<(), Infallible> {
        Ok(())
    }
}

pub struct Delay {
    hw: Shared,
}

impl DelayNs for Delay {
    fn delay_ns(&mut self, ns: u32) {
        self.hw.borrow_mut().events.push(Event::DelayNs(ns));
    }

    fn delay_us(&mut self, us: u32) {
        self.delay_ns(us * 1000);
    }

    fn delay_ms(&mut self, ms: u32) {
        self.delay_ns(ms * 1_000_000);
    }
}

/// A serial port with a fixed script of incoming bytes.
#[derive(Default)]
pub struct Serial {
    pub rx: VecDeque<u8>,
    pub tx: Vec<u8>,
}

impl Serial {
    pub fn with_frames(frames: &[Vec<u8>]) -> Self {
        Self {
            rx: frames.iter().flatten().copied().collect(),
            tx: Vec::new(),
        }
    }
}

impl embedded_io::ErrorType for Serial {
    type Error = Infallible;
}

impl embedded_io::Read for Serial {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, Infallible> {
        let count = buf.len().min(self.rx.len());
        for (slot, byte) in buf.iter_mut().zip(self.rx.drain(..count)) {
            *slot = byte;
        }
        Ok(count)
    }
}

impl embedded_io::ReadReady for Serial {
    fn read_ready(&mut self) -> Result<bool, Infallible> {
        Ok(!self.rx.is_empty())
    }
}

impl embedded_io::Write for Serial {
    fn write(&mut self, buf: &[u8]) -> Result<usize, Infallible> {
        self.tx.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> Result<(), Infallible> {
        Ok(())
    }
}

pub type MockPeripherals = Peripherals<Spi, Pin, Pin, Pin, Pin, Pin>;

/// Build a device on mock hardware without touching any line.
pub fn build() -> (Bmv31k304<NotInitialized, MockPeripherals>, Delay, Shared) {
    let hw = Shared::default();
    let pin = |line| Pin {
        line,
        hw: hw.clone(),
    };

    let dev = Bmv31k304::new(Peripherals {
        spi: Spi { hw: hw.clone() },
        sel: pin(Line::Sel),
        power: pin(Line::Power),
        data: pin(Line::Data),
        icpck: pin(Line::IcpCk),
        icpda: pin(Line::IcpDa),
    });
    let delay = Delay { hw: hw.clone() };
    (dev, delay, hw)
}

/// Build a device on mock hardware and run `begin`. The event log is cleared afterwards.
pub fn setup() -> (Bmv31k304<Initialized, MockPeripherals>, Delay, Shared) {
    let (dev, mut delay, hw) = build();
    let dev = dev.begin(&mut delay).unwrap();

    let mut state = hw.borrow_mut();
    state.events.clear();
    state.transactions.clear();
    drop(state);

    (dev, delay, hw)
}

/// Wrap a payload into a frame with a correct checksum and the ignored tail byte.
pub fn frame(header: [u8; 2], payload: &[u8]) -> Vec<u8> {
    let len = payload.len() as u8;
    let mut frame = vec![header[0], header[1], len];
    frame.extend_from_slice(payload);
    frame.push(bmv31k304_driver::crc::frame_checksum(len, payload));
    frame.push(0x00);
    frame
}

pub fn control(payload: &[u8]) -> Vec<u8> {
    frame(bmv31k304_driver::frame::CONTROL_HEADER, payload)
}

pub fn audio(payload: &[u8]) -> Vec<u8> {
    frame(bmv31k304_driver::frame::AUDIO_HEADER, payload)
}
