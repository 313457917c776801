//! Driver for the BMV31K304 voice playback IC.
//!
//! Playback is controlled with single-byte commands over the DATA line, see [`Command`].
//! The audio itself lives in an external SPI NOR flash that can be rewritten from a host PC over a
//! serial link, see [`Bmv31k304::execute_update`] and the [`update`] module.
//!
//! All operations are blocking and timing sensitive, the delay provider must be precise and the
//! calls must not be preempted for long.

#![no_std]
#![warn(missing_debug_implementations)]
#![warn(missing_docs)]

#[cfg(test)]
extern crate std;

#[macro_use]
mod log;

pub mod command;
pub mod crc;
pub mod frame;
pub mod update;

pub use bmv31k304_pac as pac;
pub use command::Command;
pub use update::{UpdateConfig, UpdateError, UpdateOutcome, UpdateProfile, UpdateSession};

use embedded_hal::{
    delay::DelayNs,
    digital::{InputPin as _, OutputPin as _},
};
use pac::BidiPin as _;

/// Time the chip needs after power-up before it accepts commands
const POWER_UP_MS: u32 = 1000;
/// Power off time of a power cycle
const POWER_CYCLE_MS: u32 = 500;

/// ICP mode that enables the SPI pass-through
const SPI_MODE: u8 = 0x02;
/// Config word address written after entering [`SPI_MODE`]
const SPI_MODE_CONFIG_ADDR: u16 = 0x020;
/// Config data words written to [`SPI_MODE_CONFIG_ADDR`]
const SPI_MODE_CONFIG: [u16; 4] = [0x0000, 0x0000, 0x0007, 0x0000];
/// Time all lines are held low before powering up into ICP mode
pub const ICP_POWER_OFF_MS: u32 = 16;
/// Delay between raising ICPCK and ICPDA after power-up
pub const ICP_CK_TO_DA_MS: u32 = 2;
/// Settle time between releasing SEL and the first flash access
const SPI_MODE_SETTLE_MS: u32 = 10;
/// Extra wait before the JEDEC ID read
const SPI_MODE_ID_DELAY_MS: u32 = 100;

/// Contains all peripherals required to interface with the BMV31K304
#[derive(Debug)]
pub struct Peripherals<TSpi, TSel, TPower, TData, TIcpCk, TIcpDa> {
    /// The SPI bus wired to the flash pass-through.
    /// Must not be shared, chip select is driven through `sel`.
    pub spi: TSpi,
    /// The SEL line. Flash chip select while in SPI mode, active low LED otherwise.
    pub sel: TSel,
    /// The power switch of the module
    pub power: TPower,
    /// The single-wire command line
    pub data: TData,
    /// ICP clock, BUSY input while playing
    pub icpck: TIcpCk,
    /// ICP data
    pub icpda: TIcpDa,
}

impl<TSpi, TSel, TPower, TData, TIcpCk, TIcpDa> Bmv31k304Peripherals
    for Peripherals<TSpi, TSel, TPower, TData, TIcpCk, TIcpDa>
where
    TSpi: embedded_hal::spi::SpiBus,
    TSel: embedded_hal::digital::OutputPin,
    TPower: embedded_hal::digital::OutputPin,
    TData: embedded_hal::digital::OutputPin,
    TIcpCk: pac::BidiPin,
    TIcpDa: pac::BidiPin,
{
    type TSpi = TSpi;
    type TSel = TSel;
    type TPower = TPower;
    type TData = TData;
    type TIcpCk = TIcpCk;
    type TIcpDa = TIcpDa;
    type Error = Error<
        TSpi::Error,
        TSel::Error,
        TPower::Error,
        TData::Error,
        TIcpCk::Error,
        TIcpDa::Error,
    >;

    fn take(self) -> Self {
        self
    }
}

/// Helper trait to represent device peripherals.
///
/// This is used in the implementation to reduce the number of generic arguments everywhere.
pub trait Bmv31k304Peripherals {
    /// The type of the flash SPI bus
    type TSpi: embedded_hal::spi::SpiBus;
    /// The type of the SEL output pin
    type TSel: embedded_hal::digital::OutputPin;
    /// The type of the power switch output pin
    type TPower: embedded_hal::digital::OutputPin;
    /// The type of the DATA output pin
    type TData: embedded_hal::digital::OutputPin;
    /// The type of the ICPCK pin
    type TIcpCk: pac::BidiPin;
    /// The type of the ICPDA pin
    type TIcpDa: pac::BidiPin;

    /// The error type that will be returned by the driver
    type Error: core::fmt::Debug
        + core::error::Error
        + From<
            Error<
                <Self::TSpi as embedded_hal::spi::ErrorType>::Error,
                <Self::TSel as embedded_hal::digital::ErrorType>::Error,
                <Self::TPower as embedded_hal::digital::ErrorType>::Error,
                <Self::TData as embedded_hal::digital::ErrorType>::Error,
                <Self::TIcpCk as embedded_hal::digital::ErrorType>::Error,
                <Self::TIcpDa as embedded_hal::digital::ErrorType>::Error,
            >,
        >;

    /// Return the peripheral instances
    fn take(
        self,
    ) -> Peripherals<
        Self::TSpi,
        Self::TSel,
        Self::TPower,
        Self::TData,
        Self::TIcpCk,
        Self::TIcpDa,
    >;
}

#[derive(Debug, thiserror::Error)]
#[cfg_attr(feature = "defmt-03", derive(defmt::Format))]
/// The error enum returned by most of [Bmv31k304] APIs
pub enum Error<ESpi, ESel, EPower, EData, ECk, EDa> {
    /// A transfer on the flash SPI bus failed
    #[error("Failed to communicate over SPI")]
    Spi(ESpi),

    /// Setting SEL state failed
    #[error("Failed to write SEL signal")]
    Sel(ESel),

    /// Setting the power switch failed
    #[error("Failed to switch power")]
    Power(EPower),

    /// Setting DATA state failed
    #[error("Failed to write DATA signal")]
    Data(EData),

    /// Driving or reading ICPCK failed
    #[error("Failed to access ICPCK signal")]
    IcpClock(ECk),

    /// Driving or reading ICPDA failed
    #[error("Failed to access ICPDA signal")]
    IcpData(EDa),

    /// The chip did not acknowledge an ICP mode
    #[error("ICP mode {mode} not acknowledged")]
    ModeEntry {
        /// The requested mode
        mode: u8,
    },
}

impl<ESpi, ESel, EPower, EData, ECk, EDa> From<pac::FlashInterfaceError<ESpi, ESel>>
    for Error<ESpi, ESel, EPower, EData, ECk, EDa>
{
    fn from(value: pac::FlashInterfaceError<ESpi, ESel>) -> Self {
        match value {
            pac::FlashInterfaceError::Spi(err) => Self::Spi(err),
            pac::FlashInterfaceError::Cs(err) => Self::Sel(err),
        }
    }
}

impl<ESpi, ESel, EPower, EData, ECk, EDa> From<pac::IcpError<ECk, EDa>>
    for Error<ESpi, ESel, EPower, EData, ECk, EDa>
{
    fn from(value: pac::IcpError<ECk, EDa>) -> Self {
        match value {
            pac::IcpError::Clock(err) => Self::IcpClock(err),
            pac::IcpError::Data(err) => Self::IcpData(err),
            pac::IcpError::EntryFailed { mode } => Self::ModeEntry { mode },
        }
    }
}

#[derive(thiserror::Error)]
#[cfg_attr(feature = "defmt-03", derive(defmt::Format))]
#[error("Mode change failed: {error}")]
/// The error returned by [Bmv31k304] APIs that change the typestate
pub struct ModeChangeError<T: Bmv31k304Peripherals> {
    /// The actual error
    pub error: T::Error,
    /// The device, so that initialization can be retried
    pub device: Bmv31k304<Errored, T>,
}
impl<T: Bmv31k304Peripherals> core::fmt::Debug for ModeChangeError<T> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_tuple("ModeChangeError").field(&self.error).finish()
    }
}

/// Typestate type for a freshly constructed BMV31K304
#[derive(Debug)]
#[cfg_attr(feature = "defmt-03", derive(defmt::Format))]
#[non_exhaustive]
pub struct NotInitialized {}

/// Typestate type for a BMV31K304 that failed a state change
#[derive(Debug)]
#[cfg_attr(feature = "defmt-03", derive(defmt::Format))]
#[non_exhaustive]
pub struct Errored {}

/// Typestate type for a powered up BMV31K304 with all lines in their idle state
#[derive(Debug)]
#[cfg_attr(feature = "defmt-03", derive(defmt::Format))]
#[non_exhaustive]
pub struct Initialized {}

/// The flash driver borrowed from a [Bmv31k304]
pub type BorrowedFlash<'a, T> = pac::SpiFlash<
    pac::SpiFlashInterface<
        &'a mut <T as Bmv31k304Peripherals>::TSpi,
        &'a mut <T as Bmv31k304Peripherals>::TSel,
    >,
>;

#[derive(Debug)]
#[cfg_attr(feature = "defmt-03", derive(defmt::Format))]
/// High level interface for the BMV31K304 voice IC
pub struct Bmv31k304<State, T: Bmv31k304Peripherals> {
    spi: T::TSpi,
    sel: T::TSel,
    power: T::TPower,
    data: T::TData,
    icpck: T::TIcpCk,
    icpda: T::TIcpDa,
    state: State,
}

impl<T: Bmv31k304Peripherals> Bmv31k304<NotInitialized, T> {
    /// Create the interface
    pub fn new(peripherals: T) -> Self {
        let Peripherals {
            spi,
            sel,
            power,
            data,
            icpck,
            icpda,
        } = peripherals.take();

        Self {
            spi,
            sel,
            power,
            data,
            icpck,
            icpda,
            state: NotInitialized {},
        }
    }
}

impl<State, T: Bmv31k304Peripherals> Bmv31k304<State, T> {
    /// Power the chip up and put every line into its idle state.
    ///
    /// POWER, ICPDA, SEL and DATA are driven high, ICPCK becomes the BUSY input.
    ///
    /// # Blocking
    ///
    /// This method blocks for 1s while the chip boots.
    pub fn begin(
        mut self,
        delay: &mut impl DelayNs,
    ) -> Result<Bmv31k304<Initialized, T>, ModeChangeError<T>> {
        let mut do_begin = |dev: &mut Self| -> Result<(), T::Error> {
            dev.power.set_high().map_err(Error::Power)?;
            dev.icpda.set_to_output();
            dev.icpda.set_high().map_err(Error::IcpData)?;
            dev.sel.set_high().map_err(Error::Sel)?;
            dev.data.set_high().map_err(Error::Data)?;
            dev.icpck.set_to_input();

            delay.delay_ms(POWER_UP_MS);
            Ok(())
        };

        match do_begin(&mut self) {
            Err(error) => Err(ModeChangeError {
                error,
                device: self.change_state(Errored {}),
            }),
            Ok(_) => {
                debug!("BMV31K304 powered up");
                Ok(self.change_state(Initialized {}))
            }
        }
    }

    /// Switch the module power.
    pub fn set_power(&mut self, on: bool) -> Result<(), T::Error> {
        Ok(self
            .power
            .set_state(embedded_hal::digital::PinState::from(on))
            .map_err(Error::Power)?)
    }

    /// Switch the power off for 500ms and back on.
    pub fn power_cycle(&mut self, delay: &mut impl DelayNs) -> Result<(), T::Error> {
        self.power.set_low().map_err(Error::Power)?;
        delay.delay_ms(POWER_CYCLE_MS);
        self.power.set_high().map_err(Error::Power)?;
        Ok(())
    }

    /// Drop the current state, e.g. to retry [Self::begin] after an update session.
    pub fn into_errored_state(self) -> Bmv31k304<Errored, T> {
        self.change_state(Errored {})
    }

    fn change_state<NewState>(self, state: NewState) -> Bmv31k304<NewState, T> {
        Bmv31k304 {
            spi: self.spi,
            sel: self.sel,
            power: self.power,
            data: self.data,
            icpck: self.icpck,
            icpda: self.icpda,
            state,
        }
    }
}

impl<T: Bmv31k304Peripherals> Bmv31k304<Initialized, T> {
    /// Send a single playback command.
    ///
    /// # Blocking
    ///
    /// Takes about 28ms, or 46ms for commands with a data byte.
    ///
    /// # Panics
    ///
    /// Panics if the command arguments are out of range, see [`Command::encode`].
    pub fn send_command(
        &mut self,
        delay: &mut impl DelayNs,
        command: Command,
    ) -> Result<(), T::Error> {
        let (code, data) = command.encode();
        trace!("Sending command {=u8:#x}", code);
        pac::SingleWire::new(&mut self.data)
            .send(delay, code, data)
            .map_err(Error::Data)?;
        Ok(())
    }

    /// Set the volume, 0 mutes and [`command::VOLUME_MAX`] is the loudest.
    ///
    /// # Panics
    ///
    /// Panics if `level` is above [`command::VOLUME_MAX`].
    pub fn set_volume(&mut self, delay: &mut impl DelayNs, level: u8) -> Result<(), T::Error> {
        self.send_command(delay, Command::Volume(level))
    }

    /// Play a voice, optionally looping it.
    pub fn play_voice(
        &mut self,
        delay: &mut impl DelayNs,
        num: u8,
        looped: bool,
    ) -> Result<(), T::Error> {
        self.send_command(delay, Command::Voice(num))?;
        if looped {
            self.repeat(delay)?;
        }
        Ok(())
    }

    /// Play a sentence, optionally looping it.
    ///
    /// # Panics
    ///
    /// Panics if `num` is not below [`command::SENTENCE_COUNT`].
    pub fn play_sentence(
        &mut self,
        delay: &mut impl DelayNs,
        num: u8,
        looped: bool,
    ) -> Result<(), T::Error> {
        self.send_command(delay, Command::Sentence(num))?;
        if looped {
            self.repeat(delay)?;
        }
        Ok(())
    }

    /// Stop playback
    pub fn stop(&mut self, delay: &mut impl DelayNs) -> Result<(), T::Error> {
        self.send_command(delay, Command::Stop)
    }

    /// Pause playback
    pub fn pause(&mut self, delay: &mut impl DelayNs) -> Result<(), T::Error> {
        self.send_command(delay, Command::Pause)
    }

    /// Resume paused playback
    pub fn resume(&mut self, delay: &mut impl DelayNs) -> Result<(), T::Error> {
        self.send_command(delay, Command::Resume)
    }

    /// Loop whatever is playing
    pub fn repeat(&mut self, delay: &mut impl DelayNs) -> Result<(), T::Error> {
        self.send_command(delay, Command::Loop)
    }

    /// Returns true while audio is playing, i.e. the BUSY line (ICPCK) is low.
    pub fn is_playing(&mut self) -> Result<bool, T::Error> {
        Ok(self.icpck.is_low().map_err(Error::IcpClock)?)
    }

    /// Switch the onboard LED. The LED shares the SEL line and is active low.
    pub fn set_led(&mut self, on: bool) -> Result<(), T::Error> {
        Ok(self
            .sel
            .set_state(embedded_hal::digital::PinState::from(!on))
            .map_err(Error::Sel)?)
    }

    /// Prepare for an update session.
    ///
    /// The serial port is owned by the caller and must be configured before, the update tools use
    /// 256000 baud.
    pub fn init_audio_update(&mut self) -> Result<(), T::Error> {
        Ok(self.data.set_high().map_err(Error::Data)?)
    }

    /// Returns true when the host has started talking on the serial link.
    pub fn is_update_requested<S: embedded_io::ReadReady>(
        &mut self,
        serial: &mut S,
    ) -> Result<bool, S::Error> {
        serial.read_ready()
    }

    /// Get the flash driver.
    ///
    /// Only useful while the chip is in SPI pass-through mode, see [Self::switch_to_spi_mode].
    pub fn flash(&mut self) -> BorrowedFlash<'_, T> {
        pac::SpiFlash::new(pac::SpiFlashInterface::new(&mut self.spi, &mut self.sel))
    }

    /// Power the chip up into ICP and request `mode`.
    ///
    /// Returns false if the chip never acknowledged the mode. The chip is left powered with all
    /// lines low in that case.
    ///
    /// # Blocking
    ///
    /// Takes about 20ms.
    ///
    /// # Panics
    ///
    /// Panics if `mode` does not fit in 3 bits.
    pub fn enter_program_mode(
        &mut self,
        delay: &mut impl DelayNs,
        mode: u8,
    ) -> Result<bool, T::Error> {
        self.power.set_low().map_err(Error::Power)?;
        self.data.set_low().map_err(Error::Data)?;
        self.sel.set_low().map_err(Error::Sel)?;
        self.icpck.set_to_output();
        self.icpck.set_low().map_err(Error::IcpClock)?;
        self.icpda.set_to_output();
        self.icpda.set_low().map_err(Error::IcpData)?;
        delay.delay_ms(ICP_POWER_OFF_MS);

        self.power.set_high().map_err(Error::Power)?;
        self.icpck.set_high().map_err(Error::IcpClock)?;
        delay.delay_ms(ICP_CK_TO_DA_MS);
        self.icpda.set_high().map_err(Error::IcpData)?;

        match pac::Icp::new(&mut self.icpck, &mut self.icpda).enter_mode(delay, mode) {
            Ok(()) => Ok(true),
            Err(pac::IcpError::EntryFailed { mode }) => {
                warn!("ICP mode {=u8} not acknowledged", mode);
                Ok(false)
            }
            Err(err) => Err(Error::from(err))?,
        }
    }

    /// Put the chip into SPI pass-through mode and read the flash JEDEC ID.
    ///
    /// Returns `None` if the chip did not enter the mode, see [Self::enter_program_mode].
    ///
    /// # Blocking
    ///
    /// Takes about 150ms.
    pub fn switch_to_spi_mode(
        &mut self,
        delay: &mut impl DelayNs,
    ) -> Result<Option<[u8; 3]>, T::Error> {
        if !self.enter_program_mode(delay, SPI_MODE)? {
            return Ok(None);
        }

        let mut icp = pac::Icp::new(&mut self.icpck, &mut self.icpda);
        icp.send_addr(delay, SPI_MODE_CONFIG_ADDR)
            .map_err(Error::from)?;
        for word in SPI_MODE_CONFIG {
            icp.send_data(delay, word).map_err(Error::from)?;
        }

        self.sel.set_high().map_err(Error::Sel)?;
        delay.delay_ms(SPI_MODE_SETTLE_MS);
        delay.delay_ms(SPI_MODE_ID_DELAY_MS);

        let id = self.flash().jedec_id().read().map_err(Error::from)?;
        let id = [id.manufacturer(), id.memory_type(), id.capacity()];
        info!("SPI pass-through active, flash ID {:02x}", id);
        Ok(Some(id))
    }
}
