//! The single-wire playback command line (DATA pin).
//!
//! Every byte is framed as a 5ms low start signal, 8 bits LSB first, and a 5ms high stop.
//! A bit is one 1600us period whose high/low ratio carries the value: 1200us/400us is a one,
//! 400us/1200us is a zero. Nothing is ever read back.

use embedded_hal::{delay::DelayNs, digital::OutputPin};

/// Line idle time before a command is sent.
pub const COMMAND_GAP_US: u32 = 5000;
/// Duration of the start (low) and stop (high) signals around each byte.
pub const FRAME_EDGE_MS: u32 = 5;
/// The long phase of a bit period
pub const LONG_PHASE_US: u32 = 1200;
/// The short phase of a bit period
pub const SHORT_PHASE_US: u32 = 400;

/// Pulse-width encoder over the DATA pin.
#[derive(Debug)]
pub struct SingleWire<TData> {
    data: TData,
}

impl<TData> SingleWire<TData> {
    /// Create the encoder. The pin may be borrowed.
    pub const fn new(data: TData) -> Self {
        SingleWire { data }
    }

    /// Return the owned pin
    pub fn release(self) -> TData {
        self.data
    }
}

impl<TData: OutputPin> SingleWire<TData> {
    /// Send a command byte, optionally followed by its data byte.
    ///
    /// # Blocking
    ///
    /// Takes about 23ms for a single byte and 41ms with a data byte.
    pub fn send(
        &mut self,
        delay: &mut impl DelayNs,
        command: u8,
        data: Option<u8>,
    ) -> Result<(), TData::Error> {
        delay.delay_us(COMMAND_GAP_US);

        self.send_byte(delay, command)?;
        if let Some(data) = data {
            self.send_byte(delay, data)?;
        }
        Ok(())
    }

    fn send_byte(&mut self, delay: &mut impl DelayNs, mut byte: u8) -> Result<(), TData::Error> {
        self.data.set_low()?;
        delay.delay_ms(FRAME_EDGE_MS);

        for _ in 0..8 {
            let (high, low) = if byte & 1 != 0 {
                (LONG_PHASE_US, SHORT_PHASE_US)
            } else {
                (SHORT_PHASE_US, LONG_PHASE_US)
            };
            self.data.set_high()?;
            delay.delay_us(high);
            self.data.set_low()?;
            delay.delay_us(low);

            byte >>= 1;
        }

        self.data.set_high()?;
        delay.delay_ms(FRAME_EDGE_MS);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::{cell::RefCell, convert::Infallible};
    use std::{rc::Rc, vec::Vec};

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Event {
        Level(bool),
        WaitUs(u32),
    }

    #[derive(Clone, Default)]
    struct Trace(Rc<RefCell<Vec<Event>>>);

    impl embedded_hal::digital::ErrorType for Trace {
        type Error = Infallible;
    }

    impl OutputPin for Trace {
        fn set_low(&mut self) -> Result<(), Infallible> {
            self.0.borrow_mut().push(Event::Level(false));
            Ok(())
        }

        fn set_high(&mut self) -> Result<(), Infallible> {
            self.0.borrow_mut().push(Event::Level(true));
            Ok(())
        }
    }

    impl DelayNs for Trace {
        fn delay_ns(&mut self, ns: u32) {
            self.0.borrow_mut().push(Event::WaitUs(ns / 1000));
        }

        fn delay_us(&mut self, us: u32) {
            self.0.borrow_mut().push(Event::WaitUs(us));
        }

        fn delay_ms(&mut self, ms: u32) {
            self.0.borrow_mut().push(Event::WaitUs(ms * 1000));
        }
    }

    /// Decode (high, low) phase pairs back into bytes
    fn decode(events: &[Event]) -> Vec<u8> {
        let mut phases = Vec::new();
        let mut level = true;
        for event in events {
            match event {
                Event::Level(l) => level = *l,
                Event::WaitUs(us) => phases.push((level, *us)),
            }
        }

        let mut bytes = Vec::new();
        let mut iter = phases.into_iter().skip(1);
        while let Some((false, 5000)) = iter.next() {
            let mut byte = 0u8;
            for bit in 0..8 {
                let (_, high) = iter.next().unwrap();
                let (_, _low) = iter.next().unwrap();
                if high == LONG_PHASE_US {
                    byte |= 1 << bit;
                }
            }
            assert_eq!(iter.next(), Some((true, 5000)));
            bytes.push(byte);
        }
        bytes
    }

    #[test]
    fn one_and_zero_differ_only_in_ratio() {
        let trace = Trace::default();
        let mut wire = SingleWire::new(trace.clone());
        wire.send(&mut trace.clone(), 0x01, None).unwrap();

        let events = trace.0.borrow();
        // gap, start, then the first bit (one) and second bit (zero)
        assert_eq!(events[0], Event::WaitUs(COMMAND_GAP_US));
        assert_eq!(
            events[3..7],
            [
                Event::Level(true),
                Event::WaitUs(1200),
                Event::Level(false),
                Event::WaitUs(400)
            ]
        );
        assert_eq!(
            events[7..11],
            [
                Event::Level(true),
                Event::WaitUs(400),
                Event::Level(false),
                Event::WaitUs(1200)
            ]
        );
    }

    #[test]
    fn command_and_data_are_framed_separately() {
        let trace = Trace::default();
        let mut wire = SingleWire::new(trace.clone());
        wire.send(&mut trace.clone(), 0xFB, Some(72)).unwrap();

        assert_eq!(decode(&trace.0.borrow()), [0xFB, 72]);
    }

    #[test]
    fn line_idles_high() {
        let trace = Trace::default();
        let mut wire = SingleWire::new(trace.clone());
        wire.send(&mut trace.clone(), 0xF8, None).unwrap();

        let events = trace.0.borrow();
        assert_eq!(events[events.len() - 2], Event::Level(true));
    }
}
