//! Configuration file handling.
//!
//! The file is a sequence of whitespace-separated records, one per line:
//!
//! ```text
//! # comment
//! log med stderr
//! root qspi /dev/mtd0
//! rsu-dev /sys/devices/platform/stratix10-rsu.0
//! write-protect 3
//! rsu-spt-checksum 1
//! ```
//!
//! Lines starting with `#`, lines with fewer than two fields, and unknown
//! or malformed records are ignored.

use crate::error::{Error, Result};
use log::LevelFilter;
use std::io::BufRead;
use std::path::{Path, PathBuf};

/// Configuration path used when the caller does not name one.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/librsu.rc";

/// Where log output should go.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogDest {
    Stderr,
    File(PathBuf),
}

/// Logging directive parsed from the configuration.
///
/// The library only emits through the `log` facade; honoring this is up to
/// the application hosting the session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogConfig {
    pub level: LevelFilter,
    pub dest: LogDest,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: LevelFilter::Warn,
            dest: LogDest::Stderr,
        }
    }
}

/// The flash device node named by the configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceNode {
    /// `root qspi <path>`: a character or MTD device exposing the flash.
    Qspi(PathBuf),
    /// `rsu-dev <path>`: a sysfs driver directory exposing the flash.
    Sysfs(PathBuf),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub log: LogConfig,
    pub device: Option<DeviceNode>,
    /// Write-protect bitmap over the first 32 slot indices.
    write_protect: u32,
    /// Whether checksummed SPT versions have their checksum enforced.
    pub spt_checksum: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log: LogConfig::default(),
            device: None,
            write_protect: 0,
            spt_checksum: true,
        }
    }
}

fn parse_level(word: &str) -> Option<LevelFilter> {
    match word {
        "off" => Some(LevelFilter::Off),
        "err" => Some(LevelFilter::Error),
        "low" => Some(LevelFilter::Warn),
        "med" => Some(LevelFilter::Info),
        "high" => Some(LevelFilter::Debug),
        _ => None,
    }
}

impl Config {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = std::fs::File::open(path.as_ref()).map_err(|err| {
            log::error!(
                "error opening configuration file {}: {err}",
                path.as_ref().display()
            );
            Error::Cfg
        })?;
        Self::from_reader(std::io::BufReader::new(file))
    }

    pub fn from_reader(reader: impl BufRead) -> Result<Self> {
        let mut config = Self::default();

        for (linenum, line) in reader.lines().enumerate() {
            let line = line.map_err(|_| Error::Cfg)?;
            config.apply_line(&line, linenum + 1);
        }

        Ok(config)
    }

    /// Parse configuration text, ignoring anything malformed.
    pub fn parse(text: &str) -> Self {
        let mut config = Self::default();
        for (linenum, line) in text.lines().enumerate() {
            config.apply_line(line, linenum + 1);
        }
        config
    }

    fn apply_line(&mut self, line: &str, linenum: usize) {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 2 || fields[0].starts_with('#') {
            return;
        }

        match fields[0] {
            "log" => {
                let Some(level) = parse_level(fields[1]) else {
                    log::warn!("unknown log level {:?} @{linenum}", fields[1]);
                    return;
                };
                self.log.level = level;
                if let Some(&dest) = fields.get(2) {
                    self.log.dest = if dest == "stderr" {
                        LogDest::Stderr
                    } else {
                        LogDest::File(PathBuf::from(dest))
                    };
                }
            }
            "root" => {
                if fields[1] == "qspi" {
                    if let Some(&path) = fields.get(2) {
                        self.device = Some(DeviceNode::Qspi(PathBuf::from(path)));
                    }
                } else {
                    log::warn!("root device is not qspi @{linenum}");
                }
            }
            "rsu-dev" => {
                self.device = Some(DeviceNode::Sysfs(PathBuf::from(fields[1])));
            }
            "write-protect" => match fields[1].parse::<u32>() {
                Ok(slot) if slot <= 31 => self.write_protect |= 1 << slot,
                _ => log::warn!("write protection only works on the first 32 slots @{linenum}"),
            },
            "rsu-spt-checksum" => {
                self.spt_checksum = fields[1].parse::<u32>().map(|v| v != 0).unwrap_or(true);
            }
            _ => {}
        }
    }

    /// Whether the write-protect bitmap covers `slot`.
    pub fn write_protected(&self, slot: usize) -> bool {
        slot <= 31 && self.write_protect & (1 << slot) != 0
    }

    /// Mark a slot write-protected, as the `write-protect` directive would.
    pub fn write_protect_slot(&mut self, slot: usize) {
        if slot <= 31 {
            self.write_protect |= 1 << slot;
        }
    }
}
