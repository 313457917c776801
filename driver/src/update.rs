//! The serial audio update session.
//!
//! The host PC tools stream frames (see [`frame`](crate::frame)) over a serial link. A session is
//! started with [`Bmv31k304::execute_update`] once [`Bmv31k304::is_update_requested`] reports
//! traffic, and runs until the host closes it, resets the chip or goes silent.
//!
//! A typical host session looks like this:
//!
//! 1. `ACOM` handshake
//! 2. `COMSPI`, the reply carries the flash JEDEC ID in the [`UpdateProfile::Workshop`] profile
//! 3. `COMCE` chip erase, the tools send it twice and only the first one erases
//! 4. a stream of audio frames, written back to back from flash address 0
//! 5. `COMORD`

use embedded_hal::{delay::DelayNs, digital::OutputPin as _};
use embedded_io::{Read, ReadExactError, ReadReady, Write};
use fugit::{ExtU32, MicrosDurationU32, MillisDurationU32};

use crate::{
    frame::{
        self, ControlCommand, FrameKind, ACK, HEADER_LEN, MAX_PAYLOAD_LEN, NACK, TRAILER_LEN,
    },
    pac::BidiPin as _,
    Bmv31k304, Bmv31k304Peripherals, Error, Initialized,
};

/// Chip erase requests are honored once per this many requests.
const ERASE_EVERY: u8 = 2;
/// Power off time of the full pin teardown
const TEARDOWN_MS: u32 = 500;
/// Settle time after the session closed
const CLOSE_SETTLE_MS: u32 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt-03", derive(defmt::Format))]
/// The flavor of the host tooling. Both speak the same frames.
pub enum UpdateProfile {
    /// Voice Widget. `COMSPI` is answered with a single byte, closing the session tears all pins down.
    Widget,
    /// Voice MCU Workshop. `COMSPI` is answered with the status byte followed by the flash ID.
    Workshop,
}

impl UpdateProfile {
    /// Select the profile by its numeric id, 0 for [Self::Widget] and 1 for [Self::Workshop].
    pub fn from_mode(mode: u8) -> Option<Self> {
        match mode {
            0 => Some(Self::Widget),
            1 => Some(Self::Workshop),
            _ => None,
        }
    }

    /// Length of the reply to `COMSPI`
    pub const fn ack_len(self) -> usize {
        match self {
            Self::Widget => 1,
            Self::Workshop => 4,
        }
    }

    /// Whether `COMORD` drives every line low before powering the chip back up
    pub const fn full_teardown_on_close(self) -> bool {
        matches!(self, Self::Widget)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt-03", derive(defmt::Format))]
/// Timing of the session loop
pub struct UpdateConfig {
    /// Wait between two checks of the serial link
    pub poll_interval: MicrosDurationU32,
    /// The session ends when nothing arrives for this long
    pub idle_timeout: MillisDurationU32,
}

impl Default for UpdateConfig {
    fn default() -> Self {
        Self {
            poll_interval: 50.micros(),
            idle_timeout: 100.millis(),
        }
    }
}

impl UpdateConfig {
    /// Number of empty polls that make up the idle timeout, at least one.
    pub fn max_idle_polls(&self) -> u32 {
        let interval = self.poll_interval.ticks().max(1);
        self.idle_timeout.to_micros().div_ceil(interval).max(1)
    }
}

/// State of one update session.
///
/// Everything is reset when a session starts, the same instance can be reused for any number of sessions.
#[derive(Debug)]
pub struct UpdateSession {
    config: UpdateConfig,
    flash_addr: u32,
    erase_requests: u8,
    device_id: [u8; 3],
    rx: [u8; MAX_PAYLOAD_LEN + TRAILER_LEN],
}

impl Default for UpdateSession {
    fn default() -> Self {
        Self::new(UpdateConfig::default())
    }
}

impl UpdateSession {
    /// Create the session state
    pub const fn new(config: UpdateConfig) -> Self {
        Self {
            config,
            flash_addr: 0,
            erase_requests: 0,
            device_id: [0; 3],
            rx: [0; MAX_PAYLOAD_LEN + TRAILER_LEN],
        }
    }

    /// The timing in use
    pub fn config(&self) -> &UpdateConfig {
        &self.config
    }

    /// Flash address the next audio frame is written to, also the number of audio bytes received.
    pub fn flash_addr(&self) -> u32 {
        self.flash_addr
    }

    /// JEDEC ID of the flash as read by the last successful `COMSPI`
    pub fn device_id(&self) -> [u8; 3] {
        self.device_id
    }

    /// Forget everything from the previous session
    pub fn reset(&mut self) {
        self.flash_addr = 0;
        self.erase_requests = 0;
        self.device_id = [0; 3];
    }

    /// Count an erase request, returns true if this one should actually erase.
    fn register_erase(&mut self) -> bool {
        self.erase_requests += 1;
        if self.erase_requests < ERASE_EVERY {
            true
        } else {
            self.erase_requests = 0;
            false
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt-03", derive(defmt::Format))]
/// How a session ended
pub enum UpdateOutcome {
    /// The host closed the session with `COMORD`, the new audio is in place.
    Completed,
    /// The host requested a reset. The chip is left powered down.
    Reset,
}

impl UpdateOutcome {
    /// Returns true if the update went through
    pub fn is_completed(self) -> bool {
        self == Self::Completed
    }
}

#[derive(Debug, thiserror::Error)]
#[cfg_attr(feature = "defmt-03", derive(defmt::Format))]
/// The error returned by [Bmv31k304::execute_update]
pub enum UpdateError<EDev, ESerial> {
    /// Talking to the chip or the flash failed
    #[error("Device error")]
    Device(EDev),

    /// The serial link failed
    #[error("Serial link error")]
    Serial(ESerial),

    /// The serial link ended in the middle of a frame
    #[error("Serial link closed mid-frame")]
    UnexpectedEof,

    /// The host announced a frame that does not fit the receive buffer
    #[error("Frame of {0} bytes exceeds the receive buffer")]
    FrameTooLong(u8),

    /// The host went silent
    #[error("No data for {}ms", .0.ticks())]
    Timeout(MillisDurationU32),
}

impl<T: Bmv31k304Peripherals> Bmv31k304<Initialized, T> {
    /// Run an update session until the host closes it.
    ///
    /// Invalid frames and unknown commands are answered with NACK and do not end the session.
    ///
    /// # Blocking
    ///
    /// Blocks for the whole session. A frame header that is not followed by the rest of the frame
    /// blocks for as long as the serial port's `read` does.
    pub fn execute_update<S>(
        &mut self,
        session: &mut UpdateSession,
        serial: &mut S,
        delay: &mut impl DelayNs,
        profile: UpdateProfile,
    ) -> Result<UpdateOutcome, UpdateError<T::Error, S::Error>>
    where
        S: Read + Write + ReadReady,
    {
        session.reset();
        info!("Update session started ({})", profile);

        let max_idle_polls = session.config.max_idle_polls();
        let mut idle_polls = 0;
        loop {
            if serial.read_ready().map_err(UpdateError::Serial)? {
                idle_polls = 0;
                if let Some(outcome) = self.receive_frame(session, serial, delay, profile)? {
                    info!(
                        "Update session ended: {}, {=u32} bytes written",
                        outcome,
                        session.flash_addr
                    );
                    return Ok(outcome);
                }
            }

            idle_polls += 1;
            delay.delay_us(session.config.poll_interval.ticks());
            if idle_polls >= max_idle_polls {
                warn!("Update session timed out");
                return Err(UpdateError::Timeout(session.config.idle_timeout));
            }
        }
    }

    fn receive_frame<S>(
        &mut self,
        session: &mut UpdateSession,
        serial: &mut S,
        delay: &mut impl DelayNs,
        profile: UpdateProfile,
    ) -> Result<Option<UpdateOutcome>, UpdateError<T::Error, S::Error>>
    where
        S: Read + Write,
    {
        let mut header = [0; HEADER_LEN];
        read_exact(serial, &mut header)?;

        let kind = FrameKind::from_header([header[0], header[1]]);
        if kind == FrameKind::Unknown {
            debug!("Dropping unknown header {:02x}", header);
            return Ok(None);
        }

        let len = header[2];
        let payload_len = match frame::check_len(len) {
            Ok(payload_len) => payload_len,
            Err(err) => {
                warn!("Rejecting frame: {}", err);
                respond(serial, &[NACK])?;
                return Err(UpdateError::FrameTooLong(len));
            }
        };

        let rx = &mut session.rx[..payload_len + TRAILER_LEN];
        read_exact(serial, rx)?;
        if let Err(err) = frame::validate(len, &rx[..payload_len], rx[payload_len]) {
            warn!("Rejecting frame: {}", err);
            respond(serial, &[NACK])?;
            return Ok(None);
        }

        match kind {
            FrameKind::Control => {
                let command = ControlCommand::parse(&session.rx[..payload_len]);
                self.dispatch_control(command, session, serial, delay, profile)
            }
            _ => {
                self.write_audio(session, payload_len)
                    .map_err(UpdateError::Device)?;
                respond(serial, &[ACK])?;
                Ok(None)
            }
        }
    }

    fn dispatch_control<S>(
        &mut self,
        command: Option<ControlCommand>,
        session: &mut UpdateSession,
        serial: &mut S,
        delay: &mut impl DelayNs,
        profile: UpdateProfile,
    ) -> Result<Option<UpdateOutcome>, UpdateError<T::Error, S::Error>>
    where
        S: Write,
    {
        let Some(command) = command else {
            warn!("Unknown control command");
            respond(serial, &[NACK])?;
            return Ok(None);
        };
        debug!("Control command {}", command);

        match command {
            ControlCommand::Handshake => respond(serial, &[ACK])?,
            ControlCommand::EnterSpiMode => {
                let switched = self
                    .switch_to_spi_mode(delay)
                    .map_err(UpdateError::Device)?;
                let status = match switched {
                    Some(id) => {
                        session.device_id = id;
                        ACK
                    }
                    None => NACK,
                };

                let [id0, id1, id2] = session.device_id;
                let reply = [status, id0, id1, id2];
                respond(serial, &reply[..profile.ack_len()])?;

                if switched.is_none() {
                    session.flash_addr = 0;
                    self.recover_from_failed_switch(delay)
                        .map_err(UpdateError::Device)?;
                }
            }
            ControlCommand::ChipErase => {
                if session.register_erase() {
                    info!("Erasing flash");
                    self.erase_flash(delay).map_err(UpdateError::Device)?;
                } else {
                    debug!("Skipping repeated erase");
                }
                respond(serial, &[ACK])?;
            }
            ControlCommand::Close => {
                respond(serial, &[ACK])?;
                self.close_session(delay, profile)
                    .map_err(UpdateError::Device)?;
                return Ok(Some(UpdateOutcome::Completed));
            }
            ControlCommand::Reset => {
                respond(serial, &[ACK])?;
                self.reset_after_update(delay)
                    .map_err(UpdateError::Device)?;
                return Ok(Some(UpdateOutcome::Reset));
            }
        }
        Ok(None)
    }

    /// Program a validated audio payload at the cursor and advance it.
    fn write_audio(&mut self, session: &mut UpdateSession, len: usize) -> Result<(), T::Error> {
        let start = session.flash_addr;
        let end = start.wrapping_add(len as u32);
        let data = &session.rx[..len];

        let mut flash = self.flash();
        match frame::page_split(end, len) {
            Some(at) => {
                flash.page_program(start, &data[..at]).map_err(Error::from)?;
                flash
                    .page_program(start.wrapping_add(at as u32), &data[at..])
                    .map_err(Error::from)?;
            }
            None => flash.page_program(start, data).map_err(Error::from)?,
        }

        session.flash_addr = end;
        trace!("Audio chunk {=usize} bytes, cursor {=u32}", len, end);
        Ok(())
    }

    fn erase_flash(&mut self, delay: &mut impl DelayNs) -> Result<(), T::Error> {
        self.flash().erase_chip(delay).map_err(Error::from)?;
        Ok(())
    }

    fn recover_from_failed_switch(&mut self, delay: &mut impl DelayNs) -> Result<(), T::Error> {
        self.power_cycle(delay)?;
        self.data.set_high().map_err(Error::Data)?;
        self.icpda.set_to_output();
        self.icpda.set_high().map_err(Error::IcpData)?;
        self.icpck.set_to_input();
        Ok(())
    }

    fn close_session(
        &mut self,
        delay: &mut impl DelayNs,
        profile: UpdateProfile,
    ) -> Result<(), T::Error> {
        if profile.full_teardown_on_close() {
            self.power.set_low().map_err(Error::Power)?;
            self.data.set_low().map_err(Error::Data)?;
            self.icpda.set_to_output();
            self.icpda.set_low().map_err(Error::IcpData)?;
            self.icpck.set_to_output();
            self.icpck.set_low().map_err(Error::IcpClock)?;
            self.sel.set_low().map_err(Error::Sel)?;
            delay.delay_ms(TEARDOWN_MS);
            self.power.set_high().map_err(Error::Power)?;
        } else {
            self.power_cycle(delay)?;
        }

        self.data.set_high().map_err(Error::Data)?;
        self.icpda.set_to_output();
        self.icpda.set_high().map_err(Error::IcpData)?;
        self.icpck.set_to_input();
        delay.delay_ms(CLOSE_SETTLE_MS);
        Ok(())
    }

    fn reset_after_update(&mut self, delay: &mut impl DelayNs) -> Result<(), T::Error> {
        self.power_cycle(delay)?;
        self.power.set_low().map_err(Error::Power)?;
        self.data.set_high().map_err(Error::Data)?;
        self.icpck.set_to_input();
        Ok(())
    }
}

fn read_exact<S: Read, EDev>(
    serial: &mut S,
    buf: &mut [u8],
) -> Result<(), UpdateError<EDev, S::Error>> {
    serial.read_exact(buf).map_err(|err| match err {
        ReadExactError::UnexpectedEof => UpdateError::UnexpectedEof,
        ReadExactError::Other(err) => UpdateError::Serial(err),
    })
}

fn respond<S: Write, EDev>(
    serial: &mut S,
    bytes: &[u8],
) -> Result<(), UpdateError<EDev, S::Error>> {
    serial.write_all(bytes).map_err(UpdateError::Serial)?;
    serial.flush().map_err(UpdateError::Serial)
}
