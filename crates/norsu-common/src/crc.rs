use crc::{CRC_32_ISO_HDLC, Crc};

const HASHER_ISO_HDLC: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// A CRC-32 checksum with the ISO-HDLC polynomial.
///
/// This is the polynomial the boot firmware stamps into the metadata tables
/// and signature blocks (equivalent to zlib's `crc32(0, ..)`).
#[derive(Debug, Copy, Clone)]
pub struct Crc32;

impl Crc32 {
    pub fn checksum(data: &[u8]) -> u32 {
        HASHER_ISO_HDLC.checksum(data)
    }
}
