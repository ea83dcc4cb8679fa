//! Offset-based access to the bound flash collaborator.
//!
//! Partition offsets recorded in the SPT are absolute flash addresses, but
//! some platforms expose a window that starts at SPT0 rather than at the
//! beginning of flash. `base` holds the window start so partition addresses
//! can be translated to device-local offsets.

use crate::error::{Error, Result};
use norsu_hal::FlashDevice;

pub(crate) struct Device {
    flash: Box<dyn FlashDevice + Send>,
    /// Flash address the device window starts at; zero when the whole flash
    /// is visible.
    pub base: u64,
}

impl Device {
    pub fn new(flash: Box<dyn FlashDevice + Send>) -> Self {
        Self { flash, base: 0 }
    }

    pub fn read(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        self.flash.read(offset, buf).map_err(|err| {
            log::error!("flash read failed @{offset:#x}: {err}");
            Error::LowLevel
        })
    }

    pub fn write(&mut self, offset: u64, buf: &[u8]) -> Result<()> {
        self.flash.write(offset, buf).map_err(|err| {
            log::error!("flash write failed @{offset:#x}: {err}");
            Error::LowLevel
        })
    }

    pub fn erase(&mut self, offset: u64, len: u64) -> Result<()> {
        self.flash.erase(offset, len).map_err(|err| {
            log::error!("flash erase failed @{offset:#x}+{len:#x}: {err}");
            Error::LowLevel
        })
    }

    /// Translate an absolute flash address into a device-local offset.
    pub fn to_local(&self, flash_offset: u64) -> Result<u64> {
        flash_offset.checked_sub(self.base).ok_or(Error::LowLevel)
    }
}
