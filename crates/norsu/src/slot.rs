//! Slot data operations: program, verify and copy-out.
//!
//! All three iterate the slot in 4 KiB blocks. Programming and verification
//! pull their data from any [`Read`] source and run each block through the
//! image pipeline unless the caller asked for raw handling.

use crate::config::Config;
use crate::db::Database;
use crate::error::{Error, Result};
use crate::image::{BLOCK_SIZE, ImageState};
use std::io::{Read, Write};

/// A point-in-time description of a slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotInfo {
    /// Partition name backing the slot.
    pub name: String,
    /// Absolute flash address of the slot.
    pub offset: u64,
    /// Slot capacity in bytes.
    pub size: u64,
    /// Boot priority; 1 is highest, 0 means not in the priority chain.
    pub priority: u32,
}

/// Adapts a pull callback into a [`Read`] source.
///
/// The callback fills the buffer it is given and returns the number of
/// bytes produced, zero at end of stream, or an error to abort.
pub struct PullSource<F>(F);

impl<F> PullSource<F>
where
    F: FnMut(&mut [u8]) -> std::io::Result<usize>,
{
    pub fn new(callback: F) -> Self {
        Self(callback)
    }
}

impl<F> Read for PullSource<F>
where
    F: FnMut(&mut [u8]) -> std::io::Result<usize>,
{
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        (self.0)(buf)
    }
}

pub(crate) fn slot_info(db: &Database, part: usize) -> SlotInfo {
    let p = db.spt().partition(part);
    SlotInfo {
        name: p.name_str().to_owned(),
        offset: p.offset.get(),
        size: u64::from(p.length.get()),
        priority: db.priority_get(part),
    }
}

/// Fill `buf` from `source`, stopping early at end of stream. Returns how
/// many bytes were produced.
fn fill_block(source: &mut dyn Read, buf: &mut [u8]) -> Result<usize> {
    let mut cnt = 0;
    while cnt < buf.len() {
        let c = source.read(&mut buf[cnt..]).map_err(|err| {
            log::error!("image source failed: {err}");
            Error::Callback
        })?;
        if c == 0 {
            break;
        }
        cnt += c;
    }
    Ok(cnt)
}

fn compare_blocks(expect: &[u8], got: &[u8], base: u64) -> Result<()> {
    if let Some(x) = (0..expect.len()).find(|&x| expect[x] != got[x]) {
        log::error!(
            "expect {:02X}, got {:02X} @{:#010x}",
            expect[x],
            got[x],
            base + x as u64
        );
        return Err(Error::Cmp);
    }
    Ok(())
}

/// Program a slot from `source`, verifying every block by read-back.
///
/// Unless `raw`, the blocks run through the image pipeline (which may
/// relocate signature-block pointers) and the slot is appended to the boot
/// priority chain at the end.
pub(crate) fn program_common(
    db: &mut Database,
    config: &Config,
    slot: usize,
    source: &mut dyn Read,
    raw: bool,
) -> Result<()> {
    if config.write_protected(slot) {
        log::error!("trying to program a write protected slot");
        return Err(Error::WrProt);
    }

    let part = db.slot_to_part(slot)?;
    let info = slot_info(db, part);

    if info.priority > 0 {
        log::error!("trying to program a slot already in use");
        return Err(Error::Program);
    }

    let mut state = ImageState::new();
    let mut buf = [0u8; BLOCK_SIZE];
    let mut vbuf = [0u8; BLOCK_SIZE];
    let mut offset: u64 = 0;

    loop {
        let cnt = fill_block(source, &mut buf)?;
        if cnt == 0 {
            break;
        }

        if !raw {
            log::debug!("programming bitstream block");
            state.process(&mut buf, None, &info).map_err(|err| {
                log::error!("{err}");
                Error::Program
            })?;
        }

        if offset + cnt as u64 > info.size {
            log::error!("trying to program too much data into the slot");
            return Err(Error::Size);
        }

        db.write_part(part, offset, &buf[..cnt])?;
        db.read_part(part, offset, &mut vbuf[..cnt])?;
        compare_blocks(&buf[..cnt], &vbuf[..cnt], offset)?;

        offset += cnt as u64;

        if cnt < BLOCK_SIZE {
            break;
        }
    }

    if !raw {
        db.priority_add(part).map_err(|_| Error::LowLevel)?;
    }
    Ok(())
}

/// Compare `source` against the slot contents, block by block.
///
/// Unless `raw`, signature blocks are compared through the pipeline so a
/// relocated image still matches its pristine source; raw verification is a
/// plain byte compare. Non-raw verification refuses erased slots.
pub(crate) fn verify_common(
    db: &mut Database,
    slot: usize,
    source: &mut dyn Read,
    raw: bool,
) -> Result<()> {
    let part = db.slot_to_part(slot)?;
    let info = slot_info(db, part);

    if !raw && info.priority == 0 {
        log::error!("trying to verify a slot not in use");
        return Err(Error::Erase);
    }

    let mut state = ImageState::new();
    let mut buf = [0u8; BLOCK_SIZE];
    let mut vbuf = [0u8; BLOCK_SIZE];
    let mut offset: u64 = 0;

    loop {
        let cnt = fill_block(source, &mut buf)?;
        if cnt == 0 {
            break;
        }

        db.read_part(part, offset, &mut vbuf[..cnt])?;

        if !raw {
            state
                .process(&mut buf, Some(&vbuf), &info)
                .map_err(|err| {
                    log::error!("{err}");
                    Error::Cmp
                })?;
        } else {
            compare_blocks(&buf[..cnt], &vbuf[..cnt], offset)?;
        }

        offset += cnt as u64;

        if cnt < BLOCK_SIZE {
            break;
        }
    }

    Ok(())
}

/// Copy a slot out to `sink`, eliding trailing and interior all-`0xFF`
/// blocks. Skipped interior blocks are back-filled once a later block has
/// real data, so everything written lands at its slot-relative offset; the
/// sink ends at the last block holding data.
pub(crate) fn copy_common(db: &mut Database, slot: usize, sink: &mut dyn Write) -> Result<()> {
    let part = db.slot_to_part(slot)?;

    if db.priority_get(part) == 0 {
        log::error!("trying to read an erased slot");
        return Err(Error::Erase);
    }

    let size = u64::from(db.spt().partition(part).length.get());
    let fill = [0xFFu8; BLOCK_SIZE];
    let mut buf = [0u8; BLOCK_SIZE];
    let mut offset: u64 = 0;
    let mut last_write: u64 = 0;

    while offset < size {
        db.read_part(part, offset, &mut buf)?;

        if buf.iter().any(|&b| b != 0xFF) {
            while last_write < offset {
                sink.write_all(&fill).map_err(|err| {
                    log::error!("unable to write to the sink: {err}");
                    Error::FileIo
                })?;
                last_write += BLOCK_SIZE as u64;
            }

            sink.write_all(&buf).map_err(|err| {
                log::error!("unable to write to the sink: {err}");
                Error::FileIo
            })?;
            last_write += BLOCK_SIZE as u64;
        }

        offset += BLOCK_SIZE as u64;
    }

    Ok(())
}
