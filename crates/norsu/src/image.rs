//! The bitstream block pipeline.
//!
//! A bitstream is a sequence of sections, each made of 4 KiB blocks. The
//! first block of a section carries the section type in its first 32-bit
//! word, with [`CMF_MAGIC`] denoting a CMF section; the block after a CMF
//! descriptor is a signature block whose tail holds up to four 64-bit
//! pointers to other sections, protected by a CRC over a bit-reversed view
//! of the block.
//!
//! The same state machine drives both programming (pointers relocated in
//! place, CRC restamped) and verification (expected flash bytes rebuilt and
//! compared). CRC work always runs on a scratch copy so the caller's block
//! is never aliased mid-write.

use crate::slot::SlotInfo;
use norsu_common::bits::{swap_bits_into, swap_endian32};
use norsu_common::crc::Crc32;
use thiserror::Error;

/// Bitstream block size.
pub const BLOCK_SIZE: usize = 0x1000;
/// Magic identifying a CMF section descriptor.
pub const CMF_MAGIC: u32 = 0x6229_4895;

const SIG_PTR_OFFSET: usize = 0x0F00;
const SIG_CRC_OFFSET: usize = 0x0FFC;
const MAX_SECTIONS: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BlockType {
    Section,
    Signature,
    Regular,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub(crate) enum ImageError {
    #[error("bad signature block CRC: calculated {calculated:08X}, stored {stored:08X}")]
    BadCrc { calculated: u32, stored: u32 },
    #[error("section pointer not within the slot")]
    PointerOutOfRange,
    #[error("image has too many sections")]
    TooManySections,
    #[error("blocks differ at offset {offset:#010x}")]
    Mismatch { offset: u64 },
}

/// Block state machine, reset once per programmed or verified image.
pub(crate) struct ImageState {
    /// Byte offset of the current block; starts one block before the image.
    offset: i64,
    block_type: BlockType,
    /// Offsets of identified section descriptors, always seeded with zero.
    sections: Vec<u64>,
    absolute: bool,
}

fn ptr_at(block: &[u8; BLOCK_SIZE], index: usize) -> u64 {
    let at = SIG_PTR_OFFSET + 8 + index * 8;
    u64::from_le_bytes(block[at..at + 8].try_into().unwrap())
}

fn set_ptr_at(block: &mut [u8; BLOCK_SIZE], index: usize, value: u64) {
    let at = SIG_PTR_OFFSET + 8 + index * 8;
    block[at..at + 8].copy_from_slice(&value.to_le_bytes());
}

/// CRC over the bit-reversed view of a block, excluding the CRC word.
fn bitrev_crc(block: &[u8; BLOCK_SIZE]) -> (u32, u32) {
    let mut scratch = [0u8; BLOCK_SIZE];
    swap_bits_into(block, &mut scratch);
    let calculated = Crc32::checksum(&scratch[..SIG_CRC_OFFSET]);
    let stored = swap_endian32(u32::from_le_bytes(
        scratch[SIG_CRC_OFFSET..].try_into().unwrap(),
    ));
    (calculated, stored)
}

/// Store `crc` in the last word the way the firmware expects it: byte-swapped
/// in the bit-reversed view of the block.
fn store_bitrev_crc(block: &mut [u8; BLOCK_SIZE], crc: u32) {
    let mut bytes = swap_endian32(crc).to_le_bytes();
    for b in &mut bytes {
        *b = b.reverse_bits();
    }
    block[SIG_CRC_OFFSET..].copy_from_slice(&bytes);
}

impl ImageState {
    pub fn new() -> Self {
        log::debug!("resetting image block state machine");
        Self {
            offset: -(BLOCK_SIZE as i64),
            block_type: BlockType::Regular,
            sections: vec![0],
            absolute: false,
        }
    }

    fn find_section(&self, section: u64) -> bool {
        self.sections.contains(&section)
    }

    fn add_section(&mut self, section: u64) -> Result<(), ImageError> {
        if self.find_section(section) {
            return Ok(());
        }
        if self.sections.len() >= MAX_SECTIONS {
            return Err(ImageError::TooManySections);
        }
        self.sections.push(section);
        Ok(())
    }

    /// Learn the pointer set of a signature block, deciding on the second
    /// block of the image whether its pointers are absolute flash addresses.
    fn sig_block_process(
        &mut self,
        block: &[u8; BLOCK_SIZE],
        info: &SlotInfo,
    ) -> Result<(), ImageError> {
        if self.offset == BLOCK_SIZE as i64 {
            if (0..4).any(|x| ptr_at(block, x) > info.size) {
                self.absolute = true;
                log::info!("identified absolute image");
            }
        }

        for x in 0..4 {
            let ptr = ptr_at(block, x);
            if ptr != 0 {
                let section = if self.absolute {
                    ptr.wrapping_sub(info.offset)
                } else {
                    ptr
                };
                self.add_section(section)?;
            }
        }

        Ok(())
    }

    /// Validate a signature block and, for relocatable images, rebase its
    /// pointers onto the destination slot and restamp the CRC.
    fn sig_block_adjust(
        &self,
        block: &mut [u8; BLOCK_SIZE],
        info: &SlotInfo,
    ) -> Result<(), ImageError> {
        let (calculated, stored) = bitrev_crc(block);
        if stored != calculated {
            log::error!("bad signature CRC: calc {calculated:08X}, from block {stored:08X}");
            return Err(ImageError::BadCrc { calculated, stored });
        }

        for x in 0..4 {
            let mut ptr = ptr_at(block, x) as i64;
            if ptr == 0 {
                continue;
            }
            if self.absolute {
                ptr -= info.offset as i64;
            }
            if ptr > info.size as i64 {
                log::error!("section pointer not within the slot");
                return Err(ImageError::PointerOutOfRange);
            }
        }

        // Absolute images are written as-is.
        if self.absolute {
            return Ok(());
        }

        for x in 0..4 {
            let ptr = ptr_at(block, x);
            if ptr != 0 {
                let adjusted = ptr + info.offset;
                log::debug!("adjusting pointer {ptr:#x} -> {adjusted:#x}");
                set_ptr_at(block, x, adjusted);
            }
        }

        let (calculated, _) = bitrev_crc(block);
        store_bitrev_crc(block, calculated);

        Ok(())
    }

    /// Compare a user signature block against flash, accounting for the
    /// relocation the program path would have applied.
    fn sig_block_compare(
        &self,
        ublock: &[u8; BLOCK_SIZE],
        vblock: &[u8; BLOCK_SIZE],
        info: &SlotInfo,
    ) -> Result<(), ImageError> {
        log::debug!("comparing signature block @{:#010x}", self.offset);

        let mut expected = *ublock;
        if !self.absolute {
            for x in 0..4 {
                let ptr = ptr_at(&expected, x);
                if ptr != 0 {
                    set_ptr_at(&mut expected, x, ptr + info.offset);
                }
            }
            let (calculated, _) = bitrev_crc(&expected);
            store_bitrev_crc(&mut expected, calculated);
        }

        self.block_compare(&expected, vblock)
    }

    fn block_compare(
        &self,
        block: &[u8; BLOCK_SIZE],
        vblock: &[u8; BLOCK_SIZE],
    ) -> Result<(), ImageError> {
        if let Some(x) = (0..BLOCK_SIZE).find(|&x| block[x] != vblock[x]) {
            let offset = self.offset as u64 + x as u64;
            log::error!(
                "expect {:02X}, got {:02X} @{offset:#010x}",
                block[x],
                vblock[x]
            );
            return Err(ImageError::Mismatch { offset });
        }
        Ok(())
    }

    /// Advance the state machine by one block.
    ///
    /// With `vblock` absent the block is being programmed and may be
    /// rewritten in place; with it present the block is compared against the
    /// flash contents instead.
    pub fn process(
        &mut self,
        block: &mut [u8; BLOCK_SIZE],
        vblock: Option<&[u8; BLOCK_SIZE]>,
        info: &SlotInfo,
    ) -> Result<(), ImageError> {
        self.offset += BLOCK_SIZE as i64;

        if self.find_section(self.offset as u64) {
            self.block_type = BlockType::Section;
        }

        match self.block_type {
            BlockType::Section => {
                let magic = u32::from_le_bytes(block[..4].try_into().unwrap());
                if magic == CMF_MAGIC {
                    log::debug!("found CMF section @{:#010x}", self.offset);
                    self.block_type = BlockType::Signature;
                } else {
                    self.block_type = BlockType::Regular;
                }

                if let Some(vblock) = vblock {
                    return self.block_compare(block, vblock);
                }
            }
            BlockType::Signature => {
                log::debug!("found signature block @{:#010x}", self.offset);
                self.sig_block_process(block, info)?;
                self.block_type = BlockType::Regular;

                return match vblock {
                    Some(vblock) => self.sig_block_compare(block, vblock, info),
                    None => self.sig_block_adjust(block, info),
                };
            }
            BlockType::Regular => {}
        }

        if let Some(vblock) = vblock {
            return self.block_compare(block, vblock);
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn slot() -> SlotInfo {
        SlotInfo {
            name: "P1".into(),
            offset: 0x0020_0000,
            size: 0x0010_0000,
            priority: 0,
        }
    }

    /// Build a signature block with the given pointers and a valid CRC.
    fn signature_block(ptrs: [u64; 4]) -> Box<[u8; BLOCK_SIZE]> {
        let mut block: Box<[u8; BLOCK_SIZE]> = vec![0u8; BLOCK_SIZE].try_into().unwrap();
        block[..4].copy_from_slice(&0x1111_2222u32.to_le_bytes());
        for (x, ptr) in ptrs.iter().enumerate() {
            set_ptr_at(&mut block, x, *ptr);
        }
        let (calculated, _) = bitrev_crc(&block);
        store_bitrev_crc(&mut block, calculated);
        block
    }

    fn cmf_descriptor() -> Box<[u8; BLOCK_SIZE]> {
        let mut block: Box<[u8; BLOCK_SIZE]> = vec![0u8; BLOCK_SIZE].try_into().unwrap();
        block[..4].copy_from_slice(&CMF_MAGIC.to_le_bytes());
        block
    }

    #[test]
    fn crc_stamp_roundtrip() {
        let block = signature_block([0x2000, 0, 0, 0]);
        let (calculated, stored) = bitrev_crc(&block);
        assert_eq!(calculated, stored);
    }

    #[test]
    fn relocatable_pointers_rebased() {
        let info = slot();
        let mut state = ImageState::new();

        let mut desc = cmf_descriptor();
        state.process(&mut desc, None, &info).unwrap();

        let mut sig = signature_block([0x2000, 0x4000, 0, 0]);
        state.process(&mut sig, None, &info).unwrap();

        assert!(!state.absolute);
        assert_eq!(ptr_at(&sig, 0), 0x2000 + info.offset);
        assert_eq!(ptr_at(&sig, 1), 0x4000 + info.offset);
        assert_eq!(ptr_at(&sig, 2), 0);
        let (calculated, stored) = bitrev_crc(&sig);
        assert_eq!(calculated, stored);
        // Both referenced sections are now known to the state machine.
        assert!(state.find_section(0x2000));
        assert!(state.find_section(0x4000));
    }

    #[test]
    fn absolute_image_left_untouched() {
        let info = slot();
        let mut state = ImageState::new();

        let mut desc = cmf_descriptor();
        state.process(&mut desc, None, &info).unwrap();

        // A pointer beyond the slot size marks the image as absolute.
        let mut sig = signature_block([info.offset + 0x2000, 0, 0, 0]);
        let original = *sig;
        state.process(&mut sig, None, &info).unwrap();

        assert!(state.absolute);
        assert_eq!(*sig, original);
        assert!(state.find_section(0x2000));
    }

    #[test]
    fn absolute_pointer_outside_slot_rejected() {
        let info = slot();
        let mut state = ImageState::new();

        let mut desc = cmf_descriptor();
        state.process(&mut desc, None, &info).unwrap();

        let mut sig = signature_block([info.offset + info.size + BLOCK_SIZE as u64, 0, 0, 0]);
        assert_eq!(
            state.process(&mut sig, None, &info),
            Err(ImageError::PointerOutOfRange)
        );
    }

    #[test]
    fn corrupted_signature_crc_rejected() {
        let info = slot();
        let mut state = ImageState::new();

        let mut desc = cmf_descriptor();
        state.process(&mut desc, None, &info).unwrap();

        let mut sig = signature_block([0x2000, 0, 0, 0]);
        sig[0x100] ^= 0x01;
        assert!(matches!(
            state.process(&mut sig, None, &info),
            Err(ImageError::BadCrc { .. })
        ));
    }

    #[test]
    fn verify_matches_program_output() {
        let info = slot();

        // Program path: relocate a copy of the signature block.
        let mut programming = ImageState::new();
        let mut desc = cmf_descriptor();
        programming.process(&mut desc, None, &info).unwrap();
        let mut flashed = signature_block([0x2000, 0, 0, 0]);
        programming.process(&mut flashed, None, &info).unwrap();

        // Verify path: the pristine user block must compare equal against
        // the relocated flash contents.
        let mut verifying = ImageState::new();
        let mut desc = cmf_descriptor();
        let vdesc = *desc;
        verifying.process(&mut desc, Some(&vdesc), &info).unwrap();
        let mut user = signature_block([0x2000, 0, 0, 0]);
        verifying.process(&mut user, Some(&*flashed), &info).unwrap();
    }

    #[test]
    fn section_list_is_bounded() {
        let info = slot();
        let mut state = ImageState::new();

        // Chain CMF sections until the section table overflows.
        let mut offset_block = 2u64;
        let mut result = Ok(());
        for _ in 0..70 {
            let mut desc = cmf_descriptor();
            result = state.process(&mut desc, None, &info);
            if result.is_err() {
                break;
            }

            let mut sig = signature_block([offset_block * BLOCK_SIZE as u64, 0, 0, 0]);
            result = state.process(&mut sig, None, &info);
            if result.is_err() {
                break;
            }
            offset_block += 2;
        }
        assert_eq!(result, Err(ImageError::TooManySections));
    }

    #[test]
    fn verify_detects_mismatch() {
        let info = slot();
        let mut state = ImageState::new();

        let mut block = cmf_descriptor();
        let mut vblock = *block;
        vblock[17] ^= 0xFF;
        assert_eq!(
            state.process(&mut block, Some(&vblock), &info),
            Err(ImageError::Mismatch { offset: 17 })
        );
    }

    #[test]
    fn regular_blocks_pass_through() {
        let info = slot();
        let mut state = ImageState::new();

        // Non-CMF first block: the whole stream is regular data.
        let mut block: Box<[u8; BLOCK_SIZE]> = vec![0xA5u8; BLOCK_SIZE].try_into().unwrap();
        state.process(&mut block, None, &info).unwrap();
        assert!(block.iter().all(|&b| b == 0xA5));

        let mut second: Box<[u8; BLOCK_SIZE]> = vec![0x5Au8; BLOCK_SIZE].try_into().unwrap();
        state.process(&mut second, None, &info).unwrap();
        assert!(second.iter().all(|&b| b == 0x5A));
    }
}
