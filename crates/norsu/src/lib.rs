//! Remote System Update (RSU) for SoC-FPGA boot stores on NOR/QSPI flash.
//!
//! The boot flash holds a Sub-Partition Table (SPT) naming up to 127
//! regions, a Configuration Pointer Block (CPB) listing which of them are
//! bootable and in what order, and the application images themselves. Both
//! tables are stored twice; this library loads and reconciles the copies,
//! exposes the non-reserved partitions as numbered *slots*, programs and
//! verifies bitstream images (relocating their signature-block pointers
//! onto the destination slot), and hands boot addresses to the platform
//! firmware through a mailbox.
//!
//! Everything platform-specific is reached through the traits in
//! [`norsu_hal`]; a session is opened by binding those collaborators:
//!
//! ```no_run
//! use norsu::{Config, Rsu};
//! use norsu_hal::Platform;
//!
//! # fn collaborators() -> Platform { unimplemented!() }
//! let platform: Platform = collaborators();
//! let config = Config::from_file("/etc/librsu.rc")?;
//! let rsu = Rsu::open(platform, config)?;
//!
//! for slot in 0..rsu.slot_count()? {
//!     let info = rsu.slot_get_info(slot)?;
//!     println!("{}: {:#010x} ({} bytes)", info.name, info.offset, info.size);
//! }
//! # Ok::<(), norsu::Error>(())
//! ```

pub mod config;
pub mod structures;

mod db;
mod device;
mod error;
mod image;
mod session;
mod slot;

pub use config::{Config, DEFAULT_CONFIG_PATH, DeviceNode, LogConfig, LogDest};
pub use error::{Error, Result};
pub use image::{BLOCK_SIZE, CMF_MAGIC};
pub use session::{Rsu, SDM_NOTIFY_OS};
pub use slot::{PullSource, SlotInfo};

pub use norsu_hal as hal;
pub use norsu_hal::{
    FirmwareInfo, FlashDevice, Mailbox, Platform, SptAddresses, StatusInfo,
};

const fn parse_decimal(s: &str) -> u32 {
    let bytes = s.as_bytes();
    let mut value = 0;
    let mut i = 0;
    while i < bytes.len() {
        value = value * 10 + (bytes[i] - b'0') as u32;
        i += 1;
    }
    value
}

/// Library version, encoded as `(major << 16) | minor`.
pub const VERSION: u32 = (parse_decimal(env!("CARGO_PKG_VERSION_MAJOR")) & 0xFFFF) << 16
    | (parse_decimal(env!("CARGO_PKG_VERSION_MINOR")) & 0xFFFF);

/// The library version word; see [`VERSION`].
pub const fn version() -> u32 {
    VERSION
}

/// Major half of a version word.
pub const fn version_major(version: u32) -> u32 {
    (version >> 16) & 0xFFFF
}

/// Minor half of a version word.
pub const fn version_minor(version: u32) -> u32 {
    version & 0xFFFF
}
