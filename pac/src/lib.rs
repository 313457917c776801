#![no_std]
#![warn(missing_debug_implementations)]
#![warn(missing_docs)]

//! The low-level wire access definitions for the BMV31K304 voice IC.
//!
//! The chip is driven over three different electrical protocols, one per module:
//!
//! - [`single_wire`] - the playback command line (DATA pin), bits encoded as a high/low pulse-width ratio.
//! - [`icp`] - the in-circuit programming protocol (ICPCK + ICPDA pins) used to switch the chip's mode.
//! - [`flash`] - the external SPI NOR flash holding the audio data, reachable once the chip is in
//!   SPI pass-through mode.
//!
//! None of these protocols tolerate preemption in the middle of a transfer. All timing goes through
//! [`embedded_hal::delay::DelayNs`], so the caller must make sure that the delay provider is precise
//! and that nothing stalls the CPU while a sequence is running.

#[cfg(test)]
extern crate std;

pub mod flash;
pub mod icp;
pub mod single_wire;

pub use flash::{FlashInterfaceError, SpiFlash, SpiFlashInterface};
pub use icp::{Icp, IcpError};
pub use single_wire::SingleWire;

/// A GPIO line that can change direction at runtime.
///
/// The ICP protocol uses the same pins for driving and sampling, e.g. the ICPDA line carries the
/// pattern out and the acknowledge bits back, and the ICPCK line doubles as the BUSY input while
/// the chip is playing.
pub trait BidiPin: embedded_hal::digital::OutputPin + embedded_hal::digital::InputPin {
    /// Switch the pin to input mode.
    fn set_to_input(&mut self);
    /// Switch the pin to push-pull output mode.
    fn set_to_output(&mut self);
}

impl<T: BidiPin + ?Sized> BidiPin for &mut T {
    fn set_to_input(&mut self) {
        T::set_to_input(self)
    }

    fn set_to_output(&mut self) {
        T::set_to_output(self)
    }
}
