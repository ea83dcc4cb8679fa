//! A minimal logger honoring the configuration file's `log` directive.

use log::{Level, LevelFilter, Log, Metadata, Record};
use norsu::{LogConfig, LogDest};
use std::fs::File;
use std::io::Write;
use std::sync::Mutex;

enum Sink {
    Stderr,
    File(Mutex<File>),
}

struct ConfigLogger {
    sink: Sink,
}

impl Log for ConfigLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }

        let tag = match record.level() {
            Level::Error => "err",
            Level::Warn => "wrn",
            Level::Info => "inf",
            Level::Debug | Level::Trace => "dbg",
        };
        let line = format!("rsu[{tag}]: {}\n", record.args());

        match &self.sink {
            Sink::Stderr => {
                let _ = std::io::stderr().write_all(line.as_bytes());
            }
            Sink::File(file) => {
                if let Ok(mut file) = file.lock() {
                    let _ = file.write_all(line.as_bytes());
                }
            }
        }
    }

    fn flush(&self) {
        if let Sink::File(file) = &self.sink {
            if let Ok(mut file) = file.lock() {
                let _ = file.flush();
            }
        }
    }
}

pub fn init(config: &LogConfig, verbose: bool) -> anyhow::Result<()> {
    let sink = match &config.dest {
        LogDest::Stderr => Sink::Stderr,
        LogDest::File(path) => Sink::File(Mutex::new(File::create(path)?)),
    };

    let level = if verbose {
        LevelFilter::Debug
    } else {
        config.level
    };

    log::set_boxed_logger(Box::new(ConfigLogger { sink }))?;
    log::set_max_level(level);
    Ok(())
}
