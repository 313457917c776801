//! Frame checksum of the serial update protocol.

use crc::{Algorithm, Crc};

/// CRC-8 over x^8 + x^5 + x^4 + 1, MSB first, zero seed, no final XOR.
///
/// This is the non-reflected sibling of CRC-8/MAXIM-DOW and has no entry in the `crc` catalog.
pub const CRC_8_BMV31K304: Algorithm<u8> = Algorithm {
    width: 8,
    poly: 0x31,
    init: 0x00,
    refin: false,
    refout: false,
    xorout: 0x00,
    check: 0xA2,
    residue: 0x00,
};

const CRC8: Crc<u8> = Crc::<u8>::new(&CRC_8_BMV31K304);

/// Checksum of a contiguous byte sequence.
pub fn crc8(bytes: &[u8]) -> u8 {
    CRC8.checksum(bytes)
}

/// Checksum of a frame: the length field followed by the payload.
pub fn frame_checksum(len: u8, payload: &[u8]) -> u8 {
    let mut digest = CRC8.digest();
    digest.update(&[len]);
    digest.update(payload);
    digest.finalize()
}
