//! Framing of the serial update protocol.
//!
//! Every frame is `<header:2> <len:1> <payload:len> <crc:1> <tail:1>`. The checksum covers the length
//! byte and the payload, the tail byte is ignored. Responses are a bare [`ACK`] or [`NACK`] byte,
//! possibly padded depending on the [update profile](crate::update::UpdateProfile).

use crate::crc::frame_checksum;

/// Header of control frames
pub const CONTROL_HEADER: [u8; 2] = [0xAA, 0x23];
/// Header of audio data frames
pub const AUDIO_HEADER: [u8; 2] = [0x55, 0x23];

/// Positive response
pub const ACK: u8 = 0x3E;
/// Negative response
pub const NACK: u8 = 0xE3;

/// Header plus length field
pub const HEADER_LEN: usize = 3;
/// Checksum plus tail byte
pub const TRAILER_LEN: usize = 2;
/// Largest payload a frame may declare. Longer frames are rejected before the payload is read.
pub const MAX_PAYLOAD_LEN: usize = 64;

/// Audio writes are split so that no single page program crosses a multiple of this.
pub const SPLIT_MODULUS: u32 = 64;
/// Remainders above this are treated as not crossing a boundary
const SPLIT_THRESHOLD: usize = 59;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt-03", derive(defmt::Format))]
/// What a frame header announces
pub enum FrameKind {
    /// A command frame, see [`ControlCommand`]
    Control,
    /// Raw audio data destined for the flash
    Audio,
    /// Neither; the three header bytes are dropped
    Unknown,
}

impl FrameKind {
    /// Classify the first two bytes of a frame
    pub fn from_header(header: [u8; 2]) -> Self {
        match header {
            CONTROL_HEADER => FrameKind::Control,
            AUDIO_HEADER => FrameKind::Audio,
            _ => FrameKind::Unknown,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt-03", derive(defmt::Format))]
/// Commands carried by control frames
pub enum ControlCommand {
    /// `"COMSPI"` - put the chip into SPI pass-through mode and report the flash ID
    EnterSpiMode,
    /// `"COMORD"` - the update is done, bring the chip back up
    Close,
    /// `"COMCE"` - erase the flash
    ChipErase,
    /// `"Reset"` - power cycle the chip and abandon the update
    Reset,
    /// `"ACOM"` - handshake
    Handshake,
}

impl ControlCommand {
    /// Match a validated payload against the known commands
    pub fn parse(payload: &[u8]) -> Option<Self> {
        match payload {
            b"COMSPI" => Some(ControlCommand::EnterSpiMode),
            b"COMORD" => Some(ControlCommand::Close),
            b"COMCE" => Some(ControlCommand::ChipErase),
            b"Reset" => Some(ControlCommand::Reset),
            b"ACOM" => Some(ControlCommand::Handshake),
            _ => None,
        }
    }

    /// The payload that encodes this command
    pub const fn as_bytes(self) -> &'static [u8] {
        match self {
            ControlCommand::EnterSpiMode => b"COMSPI",
            ControlCommand::Close => b"COMORD",
            ControlCommand::ChipErase => b"COMCE",
            ControlCommand::Reset => b"Reset",
            ControlCommand::Handshake => b"ACOM",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[cfg_attr(feature = "defmt-03", derive(defmt::Format))]
/// Reasons for rejecting a frame
pub enum FrameError {
    /// The trailing checksum does not match the length and payload
    #[error("Checksum mismatch, computed {computed:#04x}, received {received:#04x}")]
    ChecksumMismatch {
        /// Checksum over the received length and payload
        computed: u8,
        /// Checksum byte found in the frame
        received: u8,
    },
    /// The declared payload does not fit the receive buffer
    #[error("Declared length {len} exceeds {max} bytes", len = .0, max = MAX_PAYLOAD_LEN)]
    TooLong(u8),
}

/// Reject lengths that would overflow the receive buffer
pub fn check_len(len: u8) -> Result<usize, FrameError> {
    let len_usize = usize::from(len);
    if len_usize > MAX_PAYLOAD_LEN {
        return Err(FrameError::TooLong(len));
    }
    Ok(len_usize)
}

/// Verify the trailing checksum byte of a frame
pub fn validate(len: u8, payload: &[u8], received: u8) -> Result<(), FrameError> {
    let computed = frame_checksum(len, payload);
    if computed != received {
        return Err(FrameError::ChecksumMismatch { computed, received });
    }
    Ok(())
}

/// Decide how an audio chunk of `len` bytes ending at flash offset `end` is written.
///
/// Returns `Some(at)` when the chunk is written as two page programs, `[..at]` and `[at..]`,
/// either of which may be empty. `None` means a single page program.
///
/// The boundary is [`SPLIT_MODULUS`], not the flash page size. A chunk whose remainder is in the
/// 60..=63 range is written in one go even if it crosses a boundary.
pub fn page_split(end: u32, len: usize) -> Option<usize> {
    let remainder = (end % SPLIT_MODULUS) as usize;
    if remainder <= SPLIT_THRESHOLD && remainder <= len {
        Some(len - remainder)
    } else {
        None
    }
}
