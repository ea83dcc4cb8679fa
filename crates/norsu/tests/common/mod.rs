//! Shared test fixture: an in-memory flash image with the standard table
//! layout, plus scriptable mailbox and firmware stand-ins.

#![allow(dead_code)]

use norsu::structures::cpb::Cpb;
use norsu::structures::spt::{PartitionFlags, Spt};
use norsu::{Config, Platform, Rsu};
use norsu_common::bits::{swap_bits, swap_endian32};
use norsu_common::crc::Crc32;
use norsu_hal::{FirmwareInfo, FlashDevice, Mailbox, SptAddresses, StatusInfo};
use std::io;
use std::sync::{Arc, Mutex, MutexGuard};

pub const FLASH_SIZE: usize = 0x0080_0000;

pub const SPT0_ADDR: u64 = 0x0010_0000;
pub const SPT1_ADDR: u64 = 0x0010_8000;
pub const CPB0_ADDR: u64 = 0x0011_0000;
pub const CPB1_ADDR: u64 = 0x0011_8000;
pub const FACTORY_ADDR: u64 = 0x0002_0000;

pub const P1_ADDR: u64 = 0x0020_0000;
pub const P2_ADDR: u64 = 0x0030_0000;
pub const P3_ADDR: u64 = 0x0040_0000;
pub const P4_ADDR: u64 = 0x0050_0000;
pub const SLOT_SIZE: u32 = 0x0010_0000;

pub const BLOCK: usize = 4096;

/// Firmware state code for "both CPB copies corrupted".
pub const STATE_CPB0_CPB1_CORRUPTED: u64 = 0xF004_D011;
/// Firmware state code for "CPB0 corrupted".
pub const STATE_CPB0_CORRUPTED: u64 = 0xF004_D010;

/// Sessions are exclusive per process; tests serialize on this.
pub fn session_guard() -> MutexGuard<'static, ()> {
    static LOCK: Mutex<()> = Mutex::new(());
    LOCK.lock().unwrap_or_else(|err| err.into_inner())
}

#[derive(Clone)]
pub struct SharedFlash {
    bytes: Arc<Mutex<Vec<u8>>>,
}

impl SharedFlash {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self {
            bytes: Arc::new(Mutex::new(bytes)),
        }
    }

    pub fn read_at(&self, offset: u64, len: usize) -> Vec<u8> {
        let bytes = self.bytes.lock().unwrap();
        bytes[offset as usize..offset as usize + len].to_vec()
    }

    pub fn write_at(&self, offset: u64, data: &[u8]) {
        let mut bytes = self.bytes.lock().unwrap();
        bytes[offset as usize..offset as usize + data.len()].copy_from_slice(data);
    }

    /// Clobber the magic number of the block at `offset`.
    pub fn corrupt_magic(&self, offset: u64) {
        self.write_at(offset, &[0u8; 4]);
    }
}

impl FlashDevice for SharedFlash {
    fn read(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        let bytes = self.bytes.lock().unwrap();
        let start = offset as usize;
        let end = start + buf.len();
        if end > bytes.len() {
            return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "read past end"));
        }
        buf.copy_from_slice(&bytes[start..end]);
        Ok(())
    }

    fn write(&mut self, offset: u64, buf: &[u8]) -> io::Result<()> {
        let mut bytes = self.bytes.lock().unwrap();
        let start = offset as usize;
        let end = start + buf.len();
        if end > bytes.len() {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "write past end",
            ));
        }
        bytes[start..end].copy_from_slice(buf);
        Ok(())
    }

    fn erase(&mut self, offset: u64, len: u64) -> io::Result<()> {
        let mut bytes = self.bytes.lock().unwrap();
        let start = offset as usize;
        let end = start + len as usize;
        if end > bytes.len() {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "erase past end",
            ));
        }
        bytes[start..end].fill(0xFF);
        Ok(())
    }
}

#[derive(Clone)]
pub struct TestMailbox {
    addresses: SptAddresses,
    pub status: Arc<Mutex<StatusInfo>>,
    pub sent_addresses: Arc<Mutex<Vec<u64>>>,
    pub notifies: Arc<Mutex<Vec<u32>>>,
}

impl TestMailbox {
    pub fn new() -> Self {
        Self {
            addresses: SptAddresses {
                spt0: SPT0_ADDR,
                spt1: SPT1_ADDR,
            },
            status: Arc::new(Mutex::new(StatusInfo {
                // ACMF and DCMF versions present, so the retry counter is
                // trusted.
                version: 0x0101,
                ..Default::default()
            })),
            sent_addresses: Arc::new(Mutex::new(Vec::new())),
            notifies: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn set_state(&self, state: u64) {
        self.status.lock().unwrap().state = state;
    }

    pub fn set_current_image(&self, addr: u64) {
        self.status.lock().unwrap().current_image = addr;
    }
}

impl Mailbox for TestMailbox {
    fn status(&mut self) -> io::Result<StatusInfo> {
        Ok(*self.status.lock().unwrap())
    }

    fn send_update_address(&mut self, addr: u64) -> io::Result<()> {
        self.sent_addresses.lock().unwrap().push(addr);
        Ok(())
    }

    fn spt_addresses(&mut self) -> io::Result<SptAddresses> {
        Ok(self.addresses)
    }

    fn notify(&mut self, value: u32) -> io::Result<()> {
        self.notifies.lock().unwrap().push(value);
        Ok(())
    }
}

pub struct TestFirmware;

impl FirmwareInfo for TestFirmware {
    fn dcmf_status(&mut self) -> io::Result<[i32; 4]> {
        Ok([0, 0, 1, 0])
    }

    fn dcmf_version(&mut self) -> io::Result<[u32; 4]> {
        Ok([0x0102_0300; 4])
    }

    fn max_retry(&mut self) -> io::Result<u8> {
        Ok(3)
    }
}

/// The standard table: the four metadata partitions, boot info, factory
/// image, and user slots P1..P4 of 1 MiB each.
pub fn standard_spt() -> Spt {
    let mut spt = Spt::new(1);
    let reserved = PartitionFlags::RESERVED;
    let readonly = PartitionFlags::READONLY;

    spt.push_partition("BOOT_INFO", 0, 0x2_0000, reserved | readonly)
        .unwrap();
    spt.push_partition("FACTORY_IMAGE", FACTORY_ADDR, 0x8_0000, readonly)
        .unwrap();
    spt.push_partition("SPT0", SPT0_ADDR, 0x8000, reserved).unwrap();
    spt.push_partition("SPT1", SPT1_ADDR, 0x8000, reserved).unwrap();
    spt.push_partition("CPB0", CPB0_ADDR, 0x8000, reserved).unwrap();
    spt.push_partition("CPB1", CPB1_ADDR, 0x8000, reserved).unwrap();
    spt.push_partition("P1", P1_ADDR, SLOT_SIZE, PartitionFlags::empty())
        .unwrap();
    spt.push_partition("P2", P2_ADDR, SLOT_SIZE, PartitionFlags::empty())
        .unwrap();
    spt.push_partition("P3", P3_ADDR, SLOT_SIZE, PartitionFlags::empty())
        .unwrap();
    spt.push_partition("P4", P4_ADDR, SLOT_SIZE, PartitionFlags::empty())
        .unwrap();

    spt.stamp_checksum();
    spt
}

/// Priority chain P1=1, P2=2, P3=3; P4 unassigned.
pub fn standard_cpb() -> Cpb {
    let mut cpb = Cpb::empty();
    cpb.set_slot(0, P3_ADDR);
    cpb.set_slot(1, P2_ADDR);
    cpb.set_slot(2, P1_ADDR);
    cpb
}

pub struct Fixture {
    pub flash: SharedFlash,
    pub mailbox: TestMailbox,
}

impl Fixture {
    pub fn new() -> Self {
        Self::with_tables(&standard_spt(), &standard_cpb())
    }

    pub fn with_tables(spt: &Spt, cpb: &Cpb) -> Self {
        let mut bytes = vec![0xFFu8; FLASH_SIZE];
        for addr in [SPT0_ADDR, SPT1_ADDR] {
            bytes[addr as usize..addr as usize + BLOCK].copy_from_slice(spt.as_bytes());
        }
        for addr in [CPB0_ADDR, CPB1_ADDR] {
            bytes[addr as usize..addr as usize + BLOCK].copy_from_slice(cpb.as_bytes());
        }

        Self {
            flash: SharedFlash::new(bytes),
            mailbox: TestMailbox::new(),
        }
    }

    pub fn platform(&self) -> Platform {
        Platform {
            flash: Box::new(self.flash.clone()),
            mailbox: Box::new(self.mailbox.clone()),
            firmware: Box::new(TestFirmware),
        }
    }

    pub fn open(&self) -> Rsu {
        self.open_with(Config::default())
    }

    pub fn open_with(&self, config: Config) -> Rsu {
        Rsu::open(self.platform(), config).expect("session open failed")
    }
}

/// Stamp a signature block's CRC the way the firmware does: CRC over the
/// bit-reversed view, stored byte-swapped within that view.
pub fn stamp_signature(block: &mut [u8]) {
    let mut scratch = block.to_vec();
    swap_bits(&mut scratch);
    let crc = Crc32::checksum(&scratch[..0xFFC]);
    let mut bytes = swap_endian32(crc).to_le_bytes();
    swap_bits(&mut bytes);
    block[0xFFC..0x1000].copy_from_slice(&bytes);
}

/// A minimal relocatable CMF bitstream: descriptor, signature block with the
/// given pointers, then patterned data blocks.
pub fn cmf_image(ptrs: [u64; 4], total_blocks: usize) -> Vec<u8> {
    assert!(total_blocks >= 2);
    let mut image = vec![0u8; total_blocks * BLOCK];

    image[..4].copy_from_slice(&norsu::CMF_MAGIC.to_le_bytes());
    for (i, chunk) in image[4..BLOCK].chunks_mut(2).enumerate() {
        chunk[0] = (i & 0xFF) as u8;
    }

    {
        let sig = &mut image[BLOCK..2 * BLOCK];
        sig[..4].copy_from_slice(&0x5A5A_0001u32.to_le_bytes());
        for (x, ptr) in ptrs.iter().enumerate() {
            let at = 0xF08 + x * 8;
            sig[at..at + 8].copy_from_slice(&ptr.to_le_bytes());
        }
        stamp_signature(sig);
    }

    for b in 2..total_blocks {
        image[b * BLOCK..(b + 1) * BLOCK].fill(0xC3u8.wrapping_add(b as u8));
    }

    image
}

/// Read the four signature-block pointers of the image stored at `addr`.
pub fn signature_ptrs_at(flash: &SharedFlash, addr: u64) -> [u64; 4] {
    let sig = flash.read_at(addr + BLOCK as u64, BLOCK);
    core::array::from_fn(|x| {
        let at = 0xF08 + x * 8;
        u64::from_le_bytes(sig[at..at + 8].try_into().unwrap())
    })
}
