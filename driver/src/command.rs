//! Playback commands sent over the single-wire DATA line.

/// Loudest volume level, level 0 is mute.
pub const VOLUME_MAX: u8 = 11;

/// Volume level set by the module firmware at power-up.
pub const VOLUME_DEFAULT: u8 = 8;

/// Number of sentences addressable by [`Command::Sentence`].
pub const SENTENCE_COUNT: u8 = 96;

/// Play voice 0..=127, the data byte selects the voice
const PLAY_VOICE_LOW: u8 = 0xFA;
/// Play voice 128..=255, the data byte selects the voice minus 128
const PLAY_VOICE_HIGH: u8 = 0xFB;
const SENTENCE_BASE: u8 = 0x80;
const VOLUME_BASE: u8 = 0xE1;
const PAUSE: u8 = 0xF1;
const RESUME: u8 = 0xF2;
const LOOP: u8 = 0xF4;
const STOP: u8 = 0xF8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt-03", derive(defmt::Format))]
/// A playback control command
pub enum Command {
    /// Play one of the 256 voices
    Voice(u8),
    /// Play one of the [`SENTENCE_COUNT`] sentences
    Sentence(u8),
    /// Set the volume, 0 (mute) to [`VOLUME_MAX`]
    Volume(u8),
    /// Pause the current voice or sentence
    Pause,
    /// Continue after [`Command::Pause`]
    Resume,
    /// Loop the current voice or sentence
    Loop,
    /// Stop the current voice or sentence
    Stop,
}

impl Command {
    /// The command byte and the optional data byte that follows it on the wire.
    ///
    /// # Panics
    ///
    /// Panics if a sentence number or volume level is out of range.
    pub fn encode(self) -> (u8, Option<u8>) {
        match self {
            Command::Voice(num) if num < 128 => (PLAY_VOICE_LOW, Some(num)),
            Command::Voice(num) => (PLAY_VOICE_HIGH, Some(num % 128)),
            Command::Sentence(num) => {
                assert!(num < SENTENCE_COUNT, "Sentence number out of range");
                (SENTENCE_BASE + num, None)
            }
            Command::Volume(level) => {
                assert!(level <= VOLUME_MAX, "Volume level out of range");
                (VOLUME_BASE + level, None)
            }
            Command::Pause => (PAUSE, None),
            Command::Resume => (RESUME, None),
            Command::Loop => (LOOP, None),
            Command::Stop => (STOP, None),
        }
    }
}
