//! The metadata database: cached SPT and CPB with their dual-copy engines.
//!
//! Both tables live twice in flash. Loading reads copy 1, then copy 0,
//! validates each, and reconciles: matching pairs are used as-is, a lone
//! good copy restores its twin, and a dead pair raises the corresponding
//! sticky corruption flag. While a flag is set every mutation of that table
//! is refused; the only ways back are the restore operations (and, for the
//! CPB, a rebuild from scratch).
//!
//! Serialization is always write-then-stamp-magic: the block goes out with
//! an all-ones magic and the real magic is written last, so a crash mid-write
//! leaves an invalid copy rather than a plausible one.

use crate::device::Device;
use crate::error::{Error, Result};
use crate::structures::cpb::{
    CPB_HEADER_SIZE, CPB_MAGIC, CPB_SIZE, Cpb, ERASED_ENTRY, SPENT_ENTRY,
};
use crate::structures::spt::{PartitionFlags, SPT_MAGIC, SPT_SIZE, Spt};
use norsu_common::crc::Crc32;
use norsu_hal::{FirmwareInfo, Mailbox, Platform, SptAddresses};

/// Firmware state code: both CPB copies corrupted.
const STATE_CPB0_CPB1_CORRUPTED: u64 = 0xF004_D011;
/// Firmware state code: CPB0 corrupted, CPB1 usable.
const STATE_CPB0_CORRUPTED: u64 = 0xF004_D010;

/// Span erased when restoring an SPT copy from its twin.
const SPT_RESTORE_ERASE_LEN: u64 = 32 * 1024;

pub(crate) const FACTORY_IMAGE_NAME: &str = "FACTORY_IMAGE";

const RESERVED_NAMES: [&str; 8] = [
    "BOOT_INFO",
    "FACTORY_IMAGE",
    "SPT",
    "SPT0",
    "SPT1",
    "CPB",
    "CPB0",
    "CPB1",
];

/// Whether `name` may never be used for a user slot.
pub(crate) fn is_reserved_name(name: &str) -> bool {
    RESERVED_NAMES.contains(&name)
}

pub(crate) struct Database {
    dev: Device,
    pub mailbox: Box<dyn Mailbox + Send>,
    pub firmware: Box<dyn FirmwareInfo + Send>,
    spt_addr: SptAddresses,
    spt: Spt,
    cpb: Cpb,
    cpb0_part: usize,
    cpb1_part: usize,
    spt_corrupted: bool,
    cpb_corrupted: bool,
    cpb_fixed: bool,
    verify_spt_checksum: bool,
}

impl Database {
    /// Bind the collaborators, learn the SPT addresses from the firmware and
    /// load both tables. Corruption does not fail the open; it is recorded
    /// in the sticky flags instead.
    pub fn open(platform: Platform, verify_spt_checksum: bool) -> Result<Self> {
        let Platform {
            flash,
            mut mailbox,
            firmware,
        } = platform;

        let spt_addr = mailbox.spt_addresses().map_err(|err| {
            log::error!("error retrieving the SPT addresses: {err}");
            Error::LowLevel
        })?;
        log::info!("SPT0 address is {:#x}", spt_addr.spt0);
        log::info!("SPT1 address is {:#x}", spt_addr.spt1);

        let mut db = Self {
            dev: Device::new(flash),
            mailbox,
            firmware,
            spt_addr,
            spt: Spt::new(0),
            cpb: Cpb::empty(),
            cpb0_part: usize::MAX,
            cpb1_part: usize::MAX,
            spt_corrupted: false,
            cpb_corrupted: false,
            cpb_fixed: false,
            verify_spt_checksum,
        };

        if let Err(err) = db.load_spt() {
            if !db.spt_corrupted {
                log::error!("bad SPT");
                return Err(err);
            }
        }

        if db.spt_corrupted {
            db.cpb_corrupted = true;
        } else if let Err(err) = db.load_cpb() {
            if !db.cpb_corrupted {
                log::error!("bad CPB");
                return Err(err);
            }
        }

        log::info!("finished reading the flash metadata");
        Ok(db)
    }

    pub fn spt_corrupted(&self) -> bool {
        self.spt_corrupted
    }

    pub fn cpb_corrupted(&self) -> bool {
        self.cpb_corrupted
    }

    pub fn spt(&self) -> &Spt {
        &self.spt
    }

    // ---- partition-relative flash access ----

    fn part_local_offset(&self, part: usize) -> Result<u64> {
        if part >= self.spt.partition_count() {
            return Err(Error::LowLevel);
        }
        self.dev.to_local(self.spt.partition(part).offset.get())
    }

    pub fn read_part(&mut self, part: usize, offset: u64, buf: &mut [u8]) -> Result<()> {
        let local = self.part_local_offset(part)?;
        let length = u64::from(self.spt.partition(part).length.get());
        if offset + buf.len() as u64 > length {
            return Err(Error::LowLevel);
        }
        self.dev.read(local + offset, buf)
    }

    pub fn write_part(&mut self, part: usize, offset: u64, buf: &[u8]) -> Result<()> {
        let local = self.part_local_offset(part)?;
        let length = u64::from(self.spt.partition(part).length.get());
        if offset + buf.len() as u64 > length {
            return Err(Error::LowLevel);
        }
        self.dev.write(local + offset, buf)
    }

    pub fn erase_part(&mut self, part: usize) -> Result<()> {
        let local = self.part_local_offset(part)?;
        let length = u64::from(self.spt.partition(part).length.get());
        self.dev.erase(local, length)
    }

    // ---- SPT engine ----

    /// Derive the device window base from the cached table: zero when the
    /// SPT0 entry sits at the address the firmware reported, otherwise the
    /// entry's own offset.
    fn load_spt0_offset(&mut self) -> Result<()> {
        let x = self.spt.find_partition("SPT0").ok_or(Error::LowLevel)?;
        let offset = self.spt.partition(x).offset.get();
        self.dev.base = if offset == self.spt_addr.spt0 { 0 } else { offset };
        Ok(())
    }

    /// Validate the cached copy and re-derive the window base.
    fn check_spt(&mut self) -> bool {
        if let Err(err) = self.spt.validate(self.verify_spt_checksum) {
            log::error!("SPT validity check failed: {err}");
            return false;
        }
        self.load_spt0_offset().is_ok()
    }

    fn spt_pair_mismatch(&mut self) -> Result<bool> {
        let mut copy0 = [0u8; SPT_SIZE];
        let mut copy1 = [0u8; SPT_SIZE];
        self.dev.read(self.spt_addr.spt0, &mut copy0)?;
        self.dev.read(self.spt_addr.spt1, &mut copy1)?;
        Ok(copy0 != copy1)
    }

    /// Write the cached table over the copy at `address`, magic last.
    fn restore_spt_copy(&mut self, address: u64) -> Result<()> {
        self.dev.erase(address, SPT_RESTORE_ERASE_LEN)?;
        let mut copy = self.spt.clone();
        copy.set_magic(0xFFFF_FFFF);
        self.dev.write(address, copy.as_bytes())?;
        self.dev.write(address, &SPT_MAGIC.to_le_bytes())?;
        Ok(())
    }

    /// Check SPT1 and then SPT0. If both pass, use SPT0. If only one
    /// passes, restore the bad one from it. If both are bad, mark the SPT
    /// corrupted.
    pub fn load_spt(&mut self) -> Result<()> {
        let mut block = [0u8; SPT_SIZE];

        log::info!("reading SPT1");
        self.dev.read(self.spt_addr.spt1, &mut block)?;
        self.spt = Spt::from_bytes(&block);
        let spt1_good = if self.spt.magic() == SPT_MAGIC {
            self.check_spt()
        } else {
            log::error!("bad SPT1 magic number {:#010x}", self.spt.magic());
            false
        };

        log::info!("reading SPT0");
        self.dev.read(self.spt_addr.spt0, &mut block)?;
        self.spt = Spt::from_bytes(&block);
        let spt0_good = if self.spt.magic() == SPT_MAGIC {
            self.check_spt()
        } else {
            log::error!("bad SPT0 magic number {:#010x}", self.spt.magic());
            false
        };

        if spt0_good && spt1_good {
            if self.spt_pair_mismatch()? {
                log::error!("unmatched SPT0/1 data");
                self.spt_corrupted = true;
                return Err(Error::CorruptedSpt);
            }
            return Ok(());
        }

        if spt0_good {
            log::warn!("restoring SPT1");
            return self.restore_spt_copy(self.spt_addr.spt1);
        }

        if spt1_good {
            // The cache currently holds the bad SPT0 bytes; reload SPT1.
            self.dev.read(self.spt_addr.spt1, &mut block)?;
            self.spt = Spt::from_bytes(&block);
            if self.spt.magic() != SPT_MAGIC || !self.check_spt() {
                log::error!("failed to load SPT1");
                return Err(Error::LowLevel);
            }
            log::warn!("restoring SPT0");
            return self.restore_spt_copy(self.spt_addr.spt0);
        }

        self.spt_corrupted = true;
        log::error!("no valid SPT0 or SPT1 found");
        Err(Error::CorruptedSpt)
    }

    fn spt_copy_parts(&self) -> Vec<usize> {
        (0..self.spt.partition_count())
            .filter(|&x| matches!(self.spt.partition(x).name_str(), "SPT0" | "SPT1"))
            .collect()
    }

    fn cpb_copy_parts(&self) -> Vec<usize> {
        (0..self.spt.partition_count())
            .filter(|&x| matches!(self.spt.partition(x).name_str(), "CPB0" | "CPB1"))
            .collect()
    }

    /// Erase and rewrite both SPT copies from the cache, restamping the
    /// checksum on checksummed tables.
    pub fn writeback_spt(&mut self) -> Result<()> {
        let mut updates = 0;
        for x in self.spt_copy_parts() {
            self.erase_part(x)?;

            if self.spt.checksummed() && self.verify_spt_checksum {
                log::debug!("updating the SPT checksum");
                self.spt.stamp_checksum();
            }

            let mut copy = self.spt.clone();
            copy.set_magic(0xFFFF_FFFF);
            self.write_part(x, 0, copy.as_bytes())?;
            self.write_part(x, 0, &SPT_MAGIC.to_le_bytes())?;
            updates += 1;
        }

        if updates != 2 {
            log::error!("did not find two SPTs");
            return Err(Error::LowLevel);
        }
        Ok(())
    }

    // ---- CPB engine ----

    /// Cross-check the cached CPB against the cached SPT: every live
    /// pointer must name a non-reserved partition.
    fn check_cpb(&self) -> Result<()> {
        if self.cpb.header().header_size.get() > CPB_HEADER_SIZE {
            log::warn!("CPB header is larger than expected");
        }

        for x in 0..self.cpb.slot_count() {
            let ptr = self.cpb.slot(x);
            if ptr == ERASED_ENTRY || ptr == SPENT_ENTRY {
                continue;
            }

            let Some(y) = self
                .spt
                .partitions()
                .iter()
                .position(|p| p.offset.get() == ptr)
            else {
                log::error!("CPB pointer {ptr:#018x} is not in the SPT");
                return Err(Error::LowLevel);
            };

            if self
                .spt
                .partition(y)
                .flags()
                .contains(PartitionFlags::RESERVED)
            {
                log::error!("CPB pointer targets a reserved partition");
                return Err(Error::LowLevel);
            }
            log::debug!("cpb_slots[{x}] = {}", self.spt.partition(y).name_str());
        }

        Ok(())
    }

    fn cpb_pair_mismatch(&mut self) -> Result<bool> {
        let mut copy0 = [0u8; CPB_SIZE];
        let mut copy1 = [0u8; CPB_SIZE];
        self.read_part(self.cpb0_part, 0, &mut copy0)?;
        self.read_part(self.cpb1_part, 0, &mut copy1)?;
        Ok(copy0 != copy1)
    }

    fn restore_cpb_copy(&mut self, part: usize) -> Result<()> {
        self.erase_part(part)?;
        let mut copy = self.cpb.clone();
        copy.set_magic(0xFFFF_FFFF);
        self.write_part(part, 0, copy.as_bytes())?;
        self.write_part(part, 0, &CPB_MAGIC.to_le_bytes())?;
        Ok(())
    }

    fn cpb_copy_usable(&mut self, part: usize) -> bool {
        let mut block = [0u8; CPB_SIZE];
        if self.read_part(part, 0, &mut block).is_err() {
            return false;
        }
        self.cpb = Cpb::from_bytes(&block);
        self.cpb.magic() == CPB_MAGIC && self.cpb.geometry_ok() && self.check_cpb().is_ok()
    }

    /// Check CPB1 and then CPB0, honoring what the firmware already knows
    /// about them. Same reconciliation shape as the SPT engine, except that
    /// a mismatched pair is marked corrupted rather than restored.
    pub fn load_cpb(&mut self) -> Result<()> {
        let info = self.mailbox.status().map_err(|err| {
            log::error!("error retrieving the RSU status: {err}");
            Error::LowLevel
        })?;
        log::info!("firmware state {:#010x}", info.state);

        let mut cpb0_corrupted = false;
        if !self.cpb_fixed && info.state == STATE_CPB0_CPB1_CORRUPTED {
            log::error!("firmware detects both CPBs corrupted");
            self.cpb_corrupted = true;
            return Err(Error::CorruptedCpb);
        }
        if !self.cpb_fixed && info.state == STATE_CPB0_CORRUPTED {
            log::error!("firmware detects corrupted CPB0, CPB1 fine");
            cpb0_corrupted = true;
        }

        self.cpb0_part = self.spt.find_partition("CPB0").ok_or_else(|| {
            log::error!("missing CPB0 partition");
            Error::LowLevel
        })?;
        self.cpb1_part = self.spt.find_partition("CPB1").ok_or_else(|| {
            log::error!("missing CPB1 partition");
            Error::LowLevel
        })?;

        let cpb1_good = self.cpb_copy_usable(self.cpb1_part);
        if !cpb1_good {
            log::error!("CPB1 is bad");
        }

        let cpb0_good = if cpb0_corrupted {
            false
        } else {
            let good = self.cpb_copy_usable(self.cpb0_part);
            if !good {
                log::error!("CPB0 is bad");
            }
            good
        };

        if cpb0_good && cpb1_good {
            if self.cpb_pair_mismatch()? {
                log::error!("unmatched CPB0/1 data");
                self.cpb_corrupted = true;
                return Err(Error::CorruptedCpb);
            }
            return Ok(());
        }

        if cpb0_good {
            log::warn!("restoring CPB1");
            return self.restore_cpb_copy(self.cpb1_part);
        }

        if cpb1_good {
            // The cache currently holds the bad CPB0 bytes; reload CPB1.
            let mut block = [0u8; CPB_SIZE];
            self.read_part(self.cpb1_part, 0, &mut block)?;
            self.cpb = Cpb::from_bytes(&block);
            if self.cpb.magic() != CPB_MAGIC {
                log::error!("unable to load CPB1");
                return Err(Error::LowLevel);
            }
            log::warn!("restoring CPB0");
            return self.restore_cpb_copy(self.cpb0_part);
        }

        self.cpb_corrupted = true;
        log::error!("found both CPBs corrupted");
        Err(Error::CorruptedCpb)
    }

    /// Erase and rewrite both CPB copies from the cache, magic last.
    pub fn writeback_cpb(&mut self) -> Result<()> {
        let mut updates = 0;
        for x in self.cpb_copy_parts() {
            self.erase_part(x)?;

            let mut copy = self.cpb.clone();
            copy.set_magic(0xFFFF_FFFF);
            self.write_part(x, 0, copy.as_bytes())?;
            self.write_part(x, 0, &CPB_MAGIC.to_le_bytes())?;
            updates += 1;
        }

        if updates != 2 {
            log::error!("did not find two CPBs");
            return Err(Error::LowLevel);
        }
        Ok(())
    }

    /// Rewrite a single pointer slot in place, in both copies, without an
    /// erase cycle. NOR flash can only clear bits on a plain write, so the
    /// new value must not set any bit the current value has clear.
    fn update_cpb(&mut self, slot: usize, ptr: u64) -> Result<()> {
        log::debug!("updating cpb slot {slot}");

        if slot >= self.cpb.slot_count() {
            return Err(Error::LowLevel);
        }
        if self.cpb.slot(slot) & ptr != ptr {
            return Err(Error::LowLevel);
        }

        self.cpb.set_slot(slot, ptr);

        let mut updates = 0;
        for x in self.cpb_copy_parts() {
            let copy = self.cpb.clone();
            self.write_part(x, 0, copy.as_bytes())?;
            updates += 1;
        }

        if updates != 2 {
            log::error!("did not find two CPBs");
            return Err(Error::LowLevel);
        }
        Ok(())
    }

    // ---- priority model ----

    /// 1-based boot priority of a partition, 0 when it has no CPB entry.
    /// Priority 1 is the highest and belongs to the live pointer closest to
    /// the end of the array.
    pub fn priority_get(&self, part: usize) -> u32 {
        let target = self.spt.partition(part).offset.get();
        let mut priority = 0;

        for x in (0..self.cpb.slot_count()).rev() {
            let ptr = self.cpb.slot(x);
            if ptr != ERASED_ENTRY && ptr != SPENT_ENTRY {
                priority += 1;
                if ptr == target {
                    return priority;
                }
            }
        }

        0
    }

    /// Append the partition to the priority chain, compacting the pointer
    /// array once if no slot is free. Fails when the compacted array is
    /// still full.
    pub fn priority_add(&mut self, part: usize) -> Result<()> {
        let target = self.spt.partition(part).offset.get();

        if let Some(slot) = (0..self.cpb.slot_count()).find(|&x| self.cpb.slot(x) == ERASED_ENTRY)
        {
            if let Err(err) = self.update_cpb(slot, target) {
                log::error!("error updating the cpb");
                let _ = self.load_cpb();
                return Err(err);
            }
            return self.load_cpb();
        }

        log::info!("compacting CPB");

        let live: Vec<u64> = self
            .cpb
            .slots()
            .filter(|&s| s != ERASED_ENTRY && s != SPENT_ENTRY)
            .collect();
        if live.len() >= self.cpb.slot_count() {
            return Err(Error::LowLevel);
        }

        let mut y = 0;
        for ptr in live {
            self.cpb.set_slot(y, ptr);
            y += 1;
        }
        self.cpb.set_slot(y, target);
        y += 1;
        while y < self.cpb.slot_count() {
            self.cpb.set_slot(y, ERASED_ENTRY);
            y += 1;
        }

        self.writeback_cpb()?;
        self.load_cpb()
    }

    /// Mark the partition's pointer spent and reload the cache.
    pub fn priority_remove(&mut self, part: usize) -> Result<()> {
        let target = self.spt.partition(part).offset.get();

        if let Some(slot) = (0..self.cpb.slot_count()).find(|&x| self.cpb.slot(x) == target) {
            if let Err(err) = self.update_cpb(slot, SPENT_ENTRY) {
                let _ = self.load_cpb();
                return Err(err);
            }
        }

        self.load_cpb()
    }

    // ---- partition model ----

    pub fn factory_offset(&self) -> Result<u64> {
        let x = self
            .spt
            .find_partition(FACTORY_IMAGE_NAME)
            .ok_or_else(|| {
                log::error!("could not find the factory image");
                Error::LowLevel
            })?;
        Ok(self.spt.partition(x).offset.get())
    }

    pub fn partition_rename(&mut self, part: usize, name: &str) -> Result<()> {
        if name.len() >= crate::structures::spt::PARTITION_NAME_LEN {
            log::error!("partition name is too long");
            return Err(Error::Name);
        }
        if self.spt.find_partition(name).is_some() {
            log::error!("partition name already in use");
            return Err(Error::Name);
        }

        self.spt.partition_mut(part).set_name(name);
        self.writeback_spt()?;
        self.load_spt()
    }

    pub fn partition_delete(&mut self, part: usize) -> Result<()> {
        if part >= self.spt.partition_count() {
            return Err(Error::LowLevel);
        }

        self.spt.remove_partition(part);
        self.writeback_spt()?;
        self.load_spt()
    }

    pub fn partition_create(&mut self, name: &str, start: u64, size: u32) -> Result<()> {
        if name.len() >= crate::structures::spt::PARTITION_NAME_LEN {
            log::error!("partition name is too long");
            return Err(Error::LowLevel);
        }
        if self.spt.find_partition(name).is_some() {
            log::error!("partition name already in use");
            return Err(Error::LowLevel);
        }

        let end = start + u64::from(size);
        for p in self.spt.partitions() {
            if start < p.end() && end > p.offset.get() {
                log::error!("partition overlap");
                return Err(Error::LowLevel);
            }
        }

        self.spt
            .push_partition(name, start, size, PartitionFlags::empty())
            .map_err(|err| {
                log::error!("{err}");
                Error::LowLevel
            })?;

        self.writeback_spt()?;
        self.load_spt()
    }

    // ---- slot mapping ----

    /// Whether a partition is user-addressable: neither flagged reserved or
    /// read-only, nor carrying a reserved name.
    pub fn is_slot(&self, part: usize) -> bool {
        let p = self.spt.partition(part);
        let flags = p.flags();
        !flags.contains(PartitionFlags::RESERVED)
            && !flags.contains(PartitionFlags::READONLY)
            && !is_reserved_name(p.name_str())
    }

    /// Resolve a user slot index to its partition index. Re-derived on
    /// every call; never cached across mutations.
    pub fn slot_to_part(&self, slot: usize) -> Result<usize> {
        let mut cnt = 0;
        for x in 0..self.spt.partition_count() {
            if self.is_slot(x) {
                if cnt == slot {
                    return Ok(x);
                }
                cnt += 1;
            }
        }
        Err(Error::SlotNum)
    }

    pub fn slot_count(&self) -> usize {
        (0..self.spt.partition_count())
            .filter(|&x| self.is_slot(x))
            .count()
    }

    // ---- save and restore ----

    /// Snapshot the SPT: the raw SPT0 bytes followed by their CRC.
    pub fn save_spt(&mut self) -> Result<Vec<u8>> {
        let mut block = [0u8; SPT_SIZE];
        self.dev.read(self.spt_addr.spt0, &mut block)?;

        let crc = Crc32::checksum(&block);
        log::info!("saved SPT crc is {crc:#010x}");

        let mut out = Vec::with_capacity(SPT_SIZE + 4);
        out.extend_from_slice(&block);
        out.extend_from_slice(&crc.to_ne_bytes());
        Ok(out)
    }

    /// Install a saved SPT snapshot: verify it, adopt it as the cache and
    /// rewrite both copies, then clear the sticky flags and reload the CPB
    /// against the new table.
    pub fn restore_spt(&mut self, data: &[u8]) -> Result<()> {
        if data.len() < SPT_SIZE + 4 {
            log::error!("saved SPT image is too small");
            return Err(Error::Args);
        }

        let crc = Crc32::checksum(&data[..SPT_SIZE]);
        let stored = u32::from_ne_bytes(data[SPT_SIZE..SPT_SIZE + 4].try_into().unwrap());
        if stored != crc {
            log::error!("saved SPT image is corrupted");
            return Err(Error::CorruptedSpt);
        }

        let spt = Spt::from_bytes(data[..SPT_SIZE].try_into().unwrap());
        if spt.magic() != SPT_MAGIC {
            log::error!("saved SPT image has a bad magic number");
            return Err(Error::CorruptedSpt);
        }
        if spt.partition_count() > crate::structures::spt::SPT_MAX_PARTITIONS {
            log::error!("saved SPT image claims too many partitions");
            return Err(Error::CorruptedSpt);
        }

        self.spt = spt;
        if self.load_spt0_offset().is_err() {
            log::error!("failure to determine the SPT0 offset");
            return Err(Error::LowLevel);
        }

        self.writeback_spt()?;
        self.spt_corrupted = false;

        // A new SPT may make the CPB loadable again.
        self.cpb_corrupted = false;
        if self.load_cpb().is_err() && !self.cpb_corrupted {
            log::error!("failed to load the CPB after restoring the SPT");
        }

        Ok(())
    }

    /// Snapshot the CPB: the raw CPB0 bytes followed by their CRC.
    pub fn save_cpb(&mut self) -> Result<Vec<u8>> {
        let mut block = [0u8; CPB_SIZE];
        self.read_part(self.cpb0_part, 0, &mut block)?;

        let crc = Crc32::checksum(&block);
        log::info!("saved CPB crc is {crc:#010x}");

        let mut out = Vec::with_capacity(CPB_SIZE + 4);
        out.extend_from_slice(&block);
        out.extend_from_slice(&crc.to_ne_bytes());
        Ok(out)
    }

    /// Install a saved CPB snapshot and rewrite both copies.
    pub fn restore_cpb(&mut self, data: &[u8]) -> Result<()> {
        if self.spt_corrupted {
            log::error!("corrupted SPT");
            return Err(Error::CorruptedSpt);
        }
        if data.len() < CPB_SIZE + 4 {
            log::error!("saved CPB image is too small");
            return Err(Error::Args);
        }

        let crc = Crc32::checksum(&data[..CPB_SIZE]);
        let stored = u32::from_ne_bytes(data[CPB_SIZE..CPB_SIZE + 4].try_into().unwrap());
        if stored != crc {
            log::error!("saved CPB image is corrupted");
            return Err(Error::CorruptedCpb);
        }

        let cpb = Cpb::from_bytes(data[..CPB_SIZE].try_into().unwrap());
        if cpb.magic() != CPB_MAGIC || !cpb.geometry_ok() {
            log::error!("saved CPB image has a bad header");
            return Err(Error::CorruptedCpb);
        }

        self.cpb = cpb;
        self.writeback_cpb()?;
        self.cpb_corrupted = false;
        self.cpb_fixed = true;
        Ok(())
    }

    /// Rebuild the CPB from scratch: header only, every slot erased.
    pub fn empty_cpb(&mut self) -> Result<()> {
        if self.spt_corrupted {
            log::error!("corrupted SPT");
            return Err(Error::CorruptedSpt);
        }

        self.cpb = Cpb::empty();
        self.writeback_cpb()?;
        self.cpb_corrupted = false;
        self.cpb_fixed = true;
        Ok(())
    }
}
