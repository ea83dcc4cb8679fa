//! Host-side collaborators: a flash image file plus a simulated firmware.
//!
//! The flash device reads and writes a plain file standing in for the QSPI
//! device node. The mailbox answers with the SPT addresses given on the
//! command line and accepts notify/update calls without a real firmware
//! behind them, which is enough to exercise every library path against an
//! image dumped from a board.

use norsu_hal::{FirmwareInfo, FlashDevice, Mailbox, SptAddresses, StatusInfo};
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;

/// Boot retries the simulated platform reports as its limit.
const MAX_RETRY: u8 = 3;

pub struct FileFlash {
    file: File,
}

impl FileFlash {
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        Ok(Self { file })
    }
}

impl FlashDevice for FileFlash {
    fn read(&mut self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.read_exact(buf)
    }

    fn write(&mut self, offset: u64, buf: &[u8]) -> io::Result<()> {
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(buf)
    }

    fn erase(&mut self, offset: u64, len: u64) -> io::Result<()> {
        let fill = vec![0xFFu8; 4096];
        self.file.seek(SeekFrom::Start(offset))?;
        let mut remaining = len;
        while remaining > 0 {
            let chunk = remaining.min(fill.len() as u64) as usize;
            self.file.write_all(&fill[..chunk])?;
            remaining -= chunk as u64;
        }
        Ok(())
    }
}

pub struct SimMailbox {
    addresses: SptAddresses,
    current_image: u64,
}

impl SimMailbox {
    pub fn new(addresses: SptAddresses, current_image: u64) -> Self {
        Self {
            addresses,
            current_image,
        }
    }
}

impl Mailbox for SimMailbox {
    fn status(&mut self) -> io::Result<StatusInfo> {
        Ok(StatusInfo {
            // Report ACMF and DCMF versions so the retry counter is trusted.
            version: 0x0101,
            current_image: self.current_image,
            ..Default::default()
        })
    }

    fn send_update_address(&mut self, addr: u64) -> io::Result<()> {
        log::info!("firmware will boot {addr:#x} after the next reboot");
        Ok(())
    }

    fn spt_addresses(&mut self) -> io::Result<SptAddresses> {
        Ok(self.addresses)
    }

    fn notify(&mut self, value: u32) -> io::Result<()> {
        log::info!("notify {value:#x} sent to the firmware");
        Ok(())
    }
}

pub struct SimFirmware;

impl FirmwareInfo for SimFirmware {
    fn dcmf_status(&mut self) -> io::Result<[i32; 4]> {
        Ok([0; 4])
    }

    fn dcmf_version(&mut self) -> io::Result<[u32; 4]> {
        Ok([0x0101_0000; 4])
    }

    fn max_retry(&mut self) -> io::Result<u8> {
        Ok(MAX_RETRY)
    }
}
