//! The Configuration Pointer Block (CPB).
//!
//! A 4 KiB block holding the boot priority chain: an array of 64-bit slot
//! pointers addressed through the header's `image_ptr_offset`. A pointer of
//! all ones marks a free entry, zero a spent one; anything else must equal
//! the flash offset of a non-reserved partition. Two identical copies live
//! under the reserved partition names `CPB0` and `CPB1`.

use norsu_common::endian::Lu32;

pub const CPB_MAGIC: u32 = 0x5778_9609;
pub const CPB_SIZE: usize = 4096;
pub const CPB_HEADER_SIZE: u32 = 24;
pub const CPB_IMAGE_PTR_OFFSET: u32 = 32;
pub const CPB_IMAGE_PTR_SLOTS: u32 = 508;

/// A never-used slot pointer.
pub const ERASED_ENTRY: u64 = u64::MAX;
/// A formerly-used, now invalid slot pointer.
pub const SPENT_ENTRY: u64 = 0;

#[repr(C)]
#[derive(Debug, Clone, Copy, bytemuck::Pod, bytemuck::Zeroable)]
pub struct RawCpbHeader {
    pub magic: Lu32,
    pub header_size: Lu32,
    pub cpb_size: Lu32,
    pub reserved: Lu32,
    pub image_ptr_offset: Lu32,
    pub image_ptr_slots: Lu32,
}

static_assertions::assert_eq_size!(RawCpbHeader, [u8; CPB_HEADER_SIZE as usize]);

/// An owned, heap-backed CPB block.
///
/// Kept as raw bytes because the pointer array is addressed through the
/// header rather than at a fixed struct offset.
#[derive(Clone)]
pub struct Cpb {
    block: Box<[u8; CPB_SIZE]>,
}

impl Cpb {
    /// A freshly formatted block: default header, every slot erased.
    pub fn empty() -> Self {
        let mut block: Box<[u8; CPB_SIZE]> = bytemuck::zeroed_box();
        block.fill(0xFF);

        let header = RawCpbHeader {
            magic: Lu32::new(CPB_MAGIC),
            header_size: Lu32::new(CPB_HEADER_SIZE),
            cpb_size: Lu32::new(CPB_SIZE as u32),
            reserved: Lu32::new(0),
            image_ptr_offset: Lu32::new(CPB_IMAGE_PTR_OFFSET),
            image_ptr_slots: Lu32::new(CPB_IMAGE_PTR_SLOTS),
        };
        block[..CPB_HEADER_SIZE as usize].copy_from_slice(bytemuck::bytes_of(&header));

        Self { block }
    }

    pub fn from_bytes(bytes: &[u8; CPB_SIZE]) -> Self {
        let mut block: Box<[u8; CPB_SIZE]> = bytemuck::zeroed_box();
        block.copy_from_slice(bytes);
        Self { block }
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.block.as_ref()
    }

    pub fn header(&self) -> RawCpbHeader {
        *bytemuck::from_bytes(&self.block[..CPB_HEADER_SIZE as usize])
    }

    pub fn magic(&self) -> u32 {
        self.header().magic.get()
    }

    pub fn set_magic(&mut self, magic: u32) {
        self.block[..4].copy_from_slice(&magic.to_le_bytes());
    }

    /// Whether the header describes a pointer array that fits in the block.
    ///
    /// The firmware trusts these fields; we must not, since they index the
    /// raw block.
    pub fn geometry_ok(&self) -> bool {
        let header = self.header();
        let offset = header.image_ptr_offset.get() as usize;
        let slots = header.image_ptr_slots.get() as usize;
        offset >= CPB_HEADER_SIZE as usize
            && slots
                .checked_mul(8)
                .and_then(|bytes| bytes.checked_add(offset))
                .is_some_and(|end| end <= CPB_SIZE)
    }

    /// Number of pointer slots in the array.
    pub fn slot_count(&self) -> usize {
        self.header().image_ptr_slots.get() as usize
    }

    pub fn slot(&self, index: usize) -> u64 {
        let offset = self.header().image_ptr_offset.get() as usize + index * 8;
        u64::from_le_bytes(self.block[offset..offset + 8].try_into().unwrap())
    }

    pub fn set_slot(&mut self, index: usize, value: u64) {
        let offset = self.header().image_ptr_offset.get() as usize + index * 8;
        self.block[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
    }

    /// Iterate the pointer array.
    pub fn slots(&self) -> impl Iterator<Item = u64> + '_ {
        (0..self.slot_count()).map(move |i| self.slot(i))
    }
}

impl core::fmt::Debug for Cpb {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let used = self
            .slots()
            .filter(|&s| s != ERASED_ENTRY && s != SPENT_ENTRY)
            .count();
        f.debug_struct("Cpb")
            .field("header", &self.header())
            .field("used_slots", &used)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_block_shape() {
        let cpb = Cpb::empty();
        assert_eq!(cpb.magic(), CPB_MAGIC);
        assert_eq!(cpb.slot_count(), CPB_IMAGE_PTR_SLOTS as usize);
        assert!(cpb.geometry_ok());
        assert!(cpb.slots().all(|s| s == ERASED_ENTRY));
    }

    #[test]
    fn slot_accessors() {
        let mut cpb = Cpb::empty();
        cpb.set_slot(0, 0x0020_0000);
        cpb.set_slot(507, SPENT_ENTRY);
        assert_eq!(cpb.slot(0), 0x0020_0000);
        assert_eq!(cpb.slot(1), ERASED_ENTRY);
        assert_eq!(cpb.slot(507), SPENT_ENTRY);
    }

    #[test]
    fn bad_geometry_detected() {
        let mut cpb = Cpb::empty();
        let mut bytes = [0u8; CPB_SIZE];
        bytes.copy_from_slice(cpb.as_bytes());
        // Claim more slots than the block can hold.
        bytes[0x14..0x18].copy_from_slice(&10_000u32.to_le_bytes());
        cpb = Cpb::from_bytes(&bytes);
        assert!(!cpb.geometry_ok());
    }

    #[test]
    fn magic_stamping() {
        let mut cpb = Cpb::empty();
        cpb.set_magic(0xFFFF_FFFF);
        assert_eq!(cpb.magic(), 0xFFFF_FFFF);
        cpb.set_magic(CPB_MAGIC);
        assert_eq!(cpb.magic(), CPB_MAGIC);
    }
}
