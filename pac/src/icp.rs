//! In-circuit programming (ICP) protocol.
//!
//! Two lines are used: ICPCK is the clock, always driven by the host while in ICP mode,
//! and ICPDA carries data in both directions. Data is valid while the clock is high and
//! the target samples on the falling edge.
//!
//! Before talking to the target it has to be put into a known state: power off, both ICP lines low,
//! then power on with ICPCK and ICPDA high. That part involves the power rail and is done by the driver,
//! this module takes over from the READY window onwards.

use embedded_hal::{delay::DelayNs, digital::PinState};

use crate::BidiPin;

/// The fixed upper 9 bits of the match pattern, `0100 1010 1xxx`. The low 3 bits select the mode.
pub const MATCH_PATTERN: u16 = 0x4A8;

/// Number of READY/MATCH/pattern rounds before mode entry gives up.
pub const MAX_ENTRY_ATTEMPTS: u8 = 5;

/// Clock pulses issued after a successful mode entry to flush the target's input state machine.
pub const DUMMY_CLOCKS: u16 = 512;

/// Width of an address word
pub const ADDRESS_BITS: u8 = 12;

/// Width of a data word
pub const DATA_BITS: u8 = 14;

/// tREADY, at least 150us
const READY_US: u32 = 160;
/// tMATCH, at least 60us
const MATCH_US: u32 = 84;
/// Programming time of a single data word
const WRITE_CYCLE_US: u32 = 2000;

#[derive(thiserror::Error, Debug)]
#[cfg_attr(feature = "defmt-03", derive(defmt::Format))]
/// The error type returned by the ICP protocol
pub enum IcpError<ECk, EDa> {
    /// Driving ICPCK failed
    #[error("ICPCK error")]
    Clock(#[source] ECk),
    /// Driving or sampling ICPDA failed
    #[error("ICPDA error")]
    Data(#[source] EDa),
    /// The target never acknowledged the requested mode
    #[error("Mode {mode} not acknowledged after {max} attempts", max = MAX_ENTRY_ATTEMPTS)]
    EntryFailed {
        /// The requested mode
        mode: u8,
    },
}

/// The ICP lines of a BMV31K304.
#[derive(Debug)]
pub struct Icp<TCk, TDa> {
    ck: TCk,
    da: TDa,
}

impl<TCk, TDa> Icp<TCk, TDa> {
    /// Create the protocol driver. The pins may be borrowed.
    pub const fn new(ck: TCk, da: TDa) -> Self {
        Icp { ck, da }
    }

    /// Return the owned pins
    pub fn release(self) -> (TCk, TDa) {
        (self.ck, self.da)
    }
}

impl<TCk, TDa> Icp<TCk, TDa>
where
    TCk: BidiPin,
    TDa: BidiPin,
{
    /// Run the READY/MATCH handshake until the target acknowledges `mode`, then issue the dummy clocks.
    ///
    /// Expects ICPCK and ICPDA to be outputs and high, i.e. right after the power-up sequence.
    ///
    /// Each attempt sends the pattern; the acknowledge is read back for all but the last attempt,
    /// the last one fails with [`IcpError::EntryFailed`] right away.
    ///
    /// # Panics
    ///
    /// Panics if `mode` does not fit in 3 bits.
    pub fn enter_mode(
        &mut self,
        delay: &mut impl DelayNs,
        mode: u8,
    ) -> Result<(), IcpError<TCk::Error, TDa::Error>> {
        assert!(mode <= 0b111, "ICP mode is a 3-bit value");

        let mut attempt = 0;
        loop {
            attempt += 1;

            self.ck.set_low().map_err(IcpError::Clock)?;
            delay.delay_us(READY_US);

            self.ck.set_high().map_err(IcpError::Clock)?;
            delay.delay_us(MATCH_US);

            self.match_pattern(delay, mode)?;

            if attempt == MAX_ENTRY_ATTEMPTS {
                return Err(IcpError::EntryFailed { mode });
            }
            if self.read_ack(delay)? == mode {
                break;
            }
        }

        self.dummy_clocks(delay)
    }

    /// Shift out the 12-bit match pattern with `mode` in the low bits, MSB first.
    pub fn match_pattern(
        &mut self,
        delay: &mut impl DelayNs,
        mode: u8,
    ) -> Result<(), IcpError<TCk::Error, TDa::Error>> {
        let mut bits = (MATCH_PATTERN | u16::from(mode & 0b111)) << 4;
        for _ in 0..12 {
            self.data_out(delay, bits & 0x8000 != 0)?;
            bits <<= 1;
        }
        self.da.set_high().map_err(IcpError::Data)
    }

    /// Clock in the 3-bit mode acknowledge, MSB first.
    pub fn read_ack(
        &mut self,
        delay: &mut impl DelayNs,
    ) -> Result<u8, IcpError<TCk::Error, TDa::Error>> {
        let mut ack = 0;

        self.da.set_to_input();
        self.ck.set_low().map_err(IcpError::Clock)?;
        for i in 0..3 {
            self.ck.set_high().map_err(IcpError::Clock)?;
            self.ck.set_low().map_err(IcpError::Clock)?;
            if self.da.is_high().map_err(IcpError::Data)? {
                ack |= 0x04 >> i;
            }
            delay.delay_us(5);
        }
        self.ck.set_high().map_err(IcpError::Clock)?;
        self.da.set_to_output();

        Ok(ack)
    }

    /// Issue [`DUMMY_CLOCKS`] clock pulses.
    pub fn dummy_clocks(
        &mut self,
        delay: &mut impl DelayNs,
    ) -> Result<(), IcpError<TCk::Error, TDa::Error>> {
        for _ in 0..DUMMY_CLOCKS {
            self.ck.set_low().map_err(IcpError::Clock)?;
            delay.delay_us(1);
            self.ck.set_high().map_err(IcpError::Clock)?;
            delay.delay_us(1);
        }
        Ok(())
    }

    /// Shift out a 12-bit address, LSB first.
    pub fn send_addr(
        &mut self,
        delay: &mut impl DelayNs,
        mut addr: u16,
    ) -> Result<(), IcpError<TCk::Error, TDa::Error>> {
        self.da.set_to_output();
        self.da.set_high().map_err(IcpError::Data)?;

        for _ in 0..ADDRESS_BITS {
            self.addr_out(delay, addr & 1 != 0)?;
            addr >>= 1;
        }
        Ok(())
    }

    /// Shift out a 14-bit data word, LSB first, and wait for it to be programmed.
    pub fn send_data(
        &mut self,
        delay: &mut impl DelayNs,
        mut data: u16,
    ) -> Result<(), IcpError<TCk::Error, TDa::Error>> {
        self.da.set_to_output();

        for _ in 0..DATA_BITS {
            self.data_out(delay, data & 1 != 0)?;
            data >>= 1;
        }

        // 15th and 16th clock, the second one starts the write cycle
        delay.delay_us(1);
        self.clock_pulse(delay)?;
        delay.delay_us(WRITE_CYCLE_US);
        self.clock_pulse(delay)?;
        delay.delay_us(5);
        Ok(())
    }

    /// Clock in a 14-bit data word, LSB first.
    ///
    /// ICPDA is left as an input.
    pub fn read_data(
        &mut self,
        delay: &mut impl DelayNs,
    ) -> Result<u16, IcpError<TCk::Error, TDa::Error>> {
        let mut data = 0;

        self.da.set_to_input();
        self.ck.set_low().map_err(IcpError::Clock)?;
        for i in 0..DATA_BITS {
            self.ck.set_low().map_err(IcpError::Clock)?;
            if self.da.is_high().map_err(IcpError::Data)? {
                data |= 1 << i;
            }
            self.ck.set_high().map_err(IcpError::Clock)?;
            delay.delay_us(2);
        }

        self.ck.set_high().map_err(IcpError::Clock)?;
        delay.delay_us(2);
        self.clock_pulse(delay)?;
        delay.delay_us(WRITE_CYCLE_US);
        self.ck.set_low().map_err(IcpError::Clock)?;
        delay.delay_us(1);
        self.ck.set_high().map_err(IcpError::Clock)?;

        Ok(data)
    }

    fn data_out(
        &mut self,
        delay: &mut impl DelayNs,
        bit: bool,
    ) -> Result<(), IcpError<TCk::Error, TDa::Error>> {
        self.da
            .set_state(PinState::from(bit))
            .map_err(IcpError::Data)?;
        delay.delay_us(1);
        self.ck.set_low().map_err(IcpError::Clock)?;
        // tCKL: 1~15us
        delay.delay_us(1);
        self.ck.set_high().map_err(IcpError::Clock)
    }

    fn addr_out(
        &mut self,
        delay: &mut impl DelayNs,
        bit: bool,
    ) -> Result<(), IcpError<TCk::Error, TDa::Error>> {
        self.da
            .set_state(PinState::from(bit))
            .map_err(IcpError::Data)?;
        self.ck.set_low().map_err(IcpError::Clock)?;
        delay.delay_us(1);
        self.ck.set_high().map_err(IcpError::Clock)?;
        // tCKL + tCKH < 15us while in entry mode
        delay.delay_us(4);
        Ok(())
    }

    fn clock_pulse(
        &mut self,
        delay: &mut impl DelayNs,
    ) -> Result<(), IcpError<TCk::Error, TDa::Error>> {
        self.ck.set_low().map_err(IcpError::Clock)?;
        delay.delay_us(1);
        self.ck.set_high().map_err(IcpError::Clock)
    }
}
