//! The Sub-Partition Table (SPT).
//!
//! A 4 KiB block listing up to 127 named flash regions. Two identical copies
//! live in flash under the reserved partition names `SPT0` and `SPT1`.
//! Version words above [`SPT_BASE_VERSION`] carry a CRC over a bit-reversed
//! view of the whole block.

use bitflags::bitflags;
use norsu_common::bits::{swap_bits, swap_endian32};
use norsu_common::crc::Crc32;
use norsu_common::endian::{Lu32, Lu64};
use thiserror::Error;

pub const SPT_MAGIC: u32 = 0x5771_3427;
/// Last unchecksummed table version; anything above carries a checksum.
pub const SPT_BASE_VERSION: u32 = 0;
pub const SPT_MAX_PARTITIONS: usize = 127;
pub const PARTITION_NAME_LEN: usize = 16;
pub const SPT_SIZE: usize = 4096;

const CHECKSUM_OFFSET: usize = 0x0C;

bitflags! {
    /// Flag word of a partition entry.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PartitionFlags: u32 {
        /// Holds boot-critical data; never exposed as a slot.
        const RESERVED = 0x1;
        /// Not writable through the slot API.
        const READONLY = 0x2;
    }
}

/// One 32-byte partition entry.
#[repr(C)]
#[derive(Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
pub struct RawPartition {
    /// NUL-terminated name, truncated at byte 15 if overlong.
    pub name: [u8; PARTITION_NAME_LEN],
    pub offset: Lu64,
    pub length: Lu32,
    pub flags: Lu32,
}

impl RawPartition {
    pub fn name_str(&self) -> &str {
        let end = self
            .name
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(PARTITION_NAME_LEN);
        core::str::from_utf8(&self.name[..end]).unwrap_or("")
    }

    /// Copy `name` in, truncating to 15 bytes and NUL-filling the rest.
    pub fn set_name(&mut self, name: &str) {
        self.name = [0; PARTITION_NAME_LEN];
        let len = name.len().min(PARTITION_NAME_LEN - 1);
        self.name[..len].copy_from_slice(&name.as_bytes()[..len]);
    }

    pub fn flags(&self) -> PartitionFlags {
        PartitionFlags::from_bits_truncate(self.flags.get())
    }

    /// One past the last byte of the partition.
    pub fn end(&self) -> u64 {
        self.offset.get() + u64::from(self.length.get())
    }
}

impl core::fmt::Debug for RawPartition {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("RawPartition")
            .field("name", &self.name_str())
            .field("offset", &self.offset)
            .field("length", &self.length)
            .field("flags", &self.flags)
            .finish()
    }
}

#[repr(C)]
#[derive(Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
pub struct RawSpt {
    pub magic: Lu32,
    pub version: Lu32,
    pub partitions: Lu32,
    /// Zeroed while the checksum is being computed.
    pub checksum: Lu32,
    pub reserved: [u8; 16],
    pub partition: [RawPartition; SPT_MAX_PARTITIONS],
}

static_assertions::assert_eq_size!(RawSpt, [u8; SPT_SIZE]);
static_assertions::assert_eq_size!(RawPartition, [u8; 32]);

/// Structural problems a table copy can have.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum SptError {
    #[error("bad SPT magic number")]
    BadMagic,
    #[error("bad SPT checksum")]
    BadChecksum,
    #[error("partition count exceeds the table capacity")]
    TooManyPartitions,
    #[error("partition name appears more than once")]
    DuplicateName,
    #[error("partitions overlap")]
    Overlap,
    #[error("missing SPT0/SPT1/CPB0/CPB1 entry")]
    MissingTables,
}

/// An owned, heap-backed SPT block.
#[derive(Clone)]
pub struct Spt {
    raw: Box<RawSpt>,
}

impl Spt {
    /// An empty table with the magic stamped and the given version word.
    pub fn new(version: u32) -> Self {
        let mut raw: Box<RawSpt> = bytemuck::zeroed_box();
        raw.magic.set(SPT_MAGIC);
        raw.version.set(version);
        Self { raw }
    }

    pub fn from_bytes(block: &[u8; SPT_SIZE]) -> Self {
        let mut raw: Box<RawSpt> = bytemuck::zeroed_box();
        bytemuck::bytes_of_mut(raw.as_mut()).copy_from_slice(block);
        Self { raw }
    }

    pub fn as_bytes(&self) -> &[u8] {
        bytemuck::bytes_of(self.raw.as_ref())
    }

    pub fn magic(&self) -> u32 {
        self.raw.magic.get()
    }

    pub fn set_magic(&mut self, magic: u32) {
        self.raw.magic.set(magic);
    }

    pub fn version(&self) -> u32 {
        self.raw.version.get()
    }

    /// Whether this table's version word mandates a checksum.
    pub fn checksummed(&self) -> bool {
        self.version() > SPT_BASE_VERSION
    }

    pub fn partition_count(&self) -> usize {
        self.raw.partitions.get() as usize
    }

    pub fn set_partition_count(&mut self, count: usize) {
        self.raw.partitions.set(count as u32);
    }

    /// The live partition entries.
    pub fn partitions(&self) -> &[RawPartition] {
        &self.raw.partition[..self.partition_count().min(SPT_MAX_PARTITIONS)]
    }

    pub fn partition(&self, index: usize) -> &RawPartition {
        &self.raw.partition[index]
    }

    pub fn partition_mut(&mut self, index: usize) -> &mut RawPartition {
        &mut self.raw.partition[index]
    }

    pub fn find_partition(&self, name: &str) -> Option<usize> {
        self.partitions().iter().position(|p| p.name_str() == name)
    }

    /// Append an entry. The caller is responsible for the uniqueness and
    /// overlap rules; this only guards the table capacity.
    pub fn push_partition(
        &mut self,
        name: &str,
        offset: u64,
        length: u32,
        flags: PartitionFlags,
    ) -> Result<usize, SptError> {
        let index = self.partition_count();
        if index >= SPT_MAX_PARTITIONS {
            return Err(SptError::TooManyPartitions);
        }
        let entry = &mut self.raw.partition[index];
        entry.set_name(name);
        entry.offset.set(offset);
        entry.length.set(length);
        entry.flags.set(flags.bits());
        self.raw.partitions.set(index as u32 + 1);
        Ok(index)
    }

    /// Remove the entry at `index`, shifting the rest down.
    pub fn remove_partition(&mut self, index: usize) {
        let count = self.partition_count();
        for x in index..count.saturating_sub(1) {
            self.raw.partition[x] = self.raw.partition[x + 1];
        }
        self.raw.partitions.set(count as u32 - 1);
    }

    /// The CRC the checksum field should hold, per the firmware convention:
    /// zero the field, mirror the bits of every byte, CRC the whole block,
    /// then byte-swap the result.
    pub fn computed_checksum(&self) -> u32 {
        let mut scratch = [0u8; SPT_SIZE];
        scratch.copy_from_slice(self.as_bytes());
        scratch[CHECKSUM_OFFSET..CHECKSUM_OFFSET + 4].fill(0);
        swap_bits(&mut scratch);
        swap_endian32(Crc32::checksum(&scratch))
    }

    pub fn stamp_checksum(&mut self) {
        let crc = self.computed_checksum();
        self.raw.checksum.set(crc);
    }

    pub fn verify_checksum(&self) -> bool {
        self.raw.checksum.get() == self.computed_checksum()
    }

    /// Full validity check, mirroring what the boot firmware requires.
    ///
    /// NUL-terminates any name that uses all 16 bytes, then checks the
    /// checksum (when applicable), the partition count, name uniqueness,
    /// overlap freedom, and the presence of the four table partitions.
    pub fn validate(&mut self, verify_checksum: bool) -> Result<(), SptError> {
        if self.magic() != SPT_MAGIC {
            return Err(SptError::BadMagic);
        }

        if self.checksummed() && verify_checksum && !self.verify_checksum() {
            return Err(SptError::BadChecksum);
        }

        if self.partition_count() > SPT_MAX_PARTITIONS {
            return Err(SptError::TooManyPartitions);
        }

        let count = self.partition_count();
        for x in 0..count {
            let entry = &mut self.raw.partition[x];
            if !entry.name.contains(&0) {
                entry.name[PARTITION_NAME_LEN - 1] = 0;
            }
        }

        let mut found = [false; 4];
        for x in 0..count {
            let a = self.raw.partition[x];
            for y in 0..count {
                if x == y {
                    continue;
                }
                let b = self.raw.partition[y];
                if a.name == b.name {
                    return Err(SptError::DuplicateName);
                }
                if a.offset.get() < b.end() && a.end() > b.offset.get() {
                    return Err(SptError::Overlap);
                }
            }

            match a.name_str() {
                "SPT0" => found[0] = true,
                "SPT1" => found[1] = true,
                "CPB0" => found[2] = true,
                "CPB1" => found[3] = true,
                _ => {}
            }
        }

        if found.contains(&false) {
            return Err(SptError::MissingTables);
        }

        Ok(())
    }
}

impl core::fmt::Debug for Spt {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Spt")
            .field("version", &self.version())
            .field("partitions", &self.partitions())
            .finish()
    }
}
