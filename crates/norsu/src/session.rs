//! The library session: one-shot open, serialized public operations.
//!
//! At most one session exists per process. Every public operation holds the
//! session mutex for its full duration and re-checks the sticky corruption
//! flags it depends on before touching flash.

use crate::config::Config;
use crate::db::{self, Database};
use crate::error::{Error, Result};
use crate::slot::{self, PullSource, SlotInfo};
use norsu_hal::{Platform, StatusInfo};
use std::io::Read;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

const NOTIFY_RESET_RETRY_COUNTER: u32 = 1 << 16;
const NOTIFY_CLEAR_ERROR_STATUS: u32 = 1 << 17;
const NOTIFY_IGNORE_STAGE: u32 = 1 << 18;
const NOTIFY_VALUE_MASK: u32 = 0xFFFF;

/// Well-known notify value reporting a completed OS boot.
pub const SDM_NOTIFY_OS: u32 = 0x0002;

static SESSION_ACTIVE: AtomicBool = AtomicBool::new(false);

struct Context {
    db: Database,
    config: Config,
}

impl Context {
    fn ensure_spt(&self) -> Result<()> {
        if self.db.spt_corrupted() {
            log::error!("corrupted SPT");
            return Err(Error::CorruptedSpt);
        }
        Ok(())
    }

    fn ensure_cpb(&self) -> Result<()> {
        if self.db.cpb_corrupted() {
            log::error!("corrupted CPB");
            return Err(Error::CorruptedCpb);
        }
        Ok(())
    }

    fn status(&mut self) -> Result<StatusInfo> {
        let mut info = self.db.mailbox.status().map_err(|err| {
            log::error!("error retrieving the RSU status: {err}");
            Error::FileIo
        })?;

        // Old firmware reports no retry counter.
        if info.acmf_version() == 0 || info.dcmf_version() == 0 {
            info.retry_counter = 0;
        }
        Ok(info)
    }
}

/// An open RSU session.
///
/// Obtained from [`Rsu::open`]; dropped to release the collaborators and
/// allow a new session. All methods are serialized by an internal mutex.
pub struct Rsu {
    inner: Mutex<Context>,
}

impl Rsu {
    /// Bind the platform collaborators and load the flash metadata.
    ///
    /// Refused while another session is alive. Metadata corruption does not
    /// fail the open: the corresponding operations report it until one of
    /// the restore paths re-establishes a known-good state.
    pub fn open(platform: Platform, config: Config) -> Result<Self> {
        if SESSION_ACTIVE.swap(true, Ordering::SeqCst) {
            log::error!("library already initialized or initialization ongoing");
            return Err(Error::Lib);
        }

        match Database::open(platform, config.spt_checksum) {
            Ok(db) => {
                log::debug!("session open completed");
                Ok(Self {
                    inner: Mutex::new(Context { db, config }),
                })
            }
            Err(err) => {
                SESSION_ACTIVE.store(false, Ordering::SeqCst);
                log::error!("error loading the flash metadata: {err}");
                Err(Error::Cfg)
            }
        }
    }

    /// [`Rsu::open`] with the configuration loaded from `path`, or from
    /// [`crate::config::DEFAULT_CONFIG_PATH`] when `path` is `None`.
    pub fn open_with_config_file(platform: Platform, path: Option<&Path>) -> Result<Self> {
        let config = match path {
            Some(path) => Config::from_file(path)?,
            None => Config::from_file(crate::config::DEFAULT_CONFIG_PATH)?,
        };
        Self::open(platform, config)
    }

    fn lock(&self) -> MutexGuard<'_, Context> {
        self.inner.lock().unwrap_or_else(|err| err.into_inner())
    }

    // ---- status and firmware ----

    /// Send a notify value to the firmware; only the low 16 bits are used.
    pub fn notify(&self, value: u32) -> Result<()> {
        let mut guard = self.lock();
        guard
            .db
            .mailbox
            .notify(value & NOTIFY_VALUE_MASK)
            .map_err(|_| Error::FileIo)
    }

    /// The firmware status report.
    pub fn status_log(&self) -> Result<StatusInfo> {
        self.lock().status()
    }

    /// Clear the firmware error status.
    pub fn clear_error_status(&self) -> Result<()> {
        let mut guard = self.lock();
        let info = guard.status()?;
        if info.acmf_version() == 0 {
            return Err(Error::FileIo);
        }

        guard
            .db
            .mailbox
            .notify(NOTIFY_IGNORE_STAGE | NOTIFY_CLEAR_ERROR_STATUS)
            .map_err(|_| Error::FileIo)
    }

    /// Reset the firmware boot retry counter.
    pub fn reset_retry_counter(&self) -> Result<()> {
        let mut guard = self.lock();
        let info = guard.status()?;
        if info.acmf_version() == 0 || info.dcmf_version() == 0 {
            return Err(Error::FileIo);
        }

        guard
            .db
            .mailbox
            .notify(NOTIFY_IGNORE_STAGE | NOTIFY_RESET_RETRY_COUNTER)
            .map_err(|_| Error::FileIo)
    }

    /// Whether the currently running image is the factory image.
    pub fn running_factory(&self) -> Result<bool> {
        let mut guard = self.lock();
        guard.ensure_spt()?;

        let factory_offset = guard.db.factory_offset()?;
        let info = guard.status()?;
        log::info!(
            "factory offset is {factory_offset:#010x}, current image is {:#010x}",
            info.current_image
        );
        Ok(factory_offset == info.current_image)
    }

    /// Version words of the four decision-firmware copies.
    pub fn dcmf_version(&self) -> Result<[u32; 4]> {
        let mut guard = self.lock();
        guard.db.firmware.dcmf_version().map_err(|err| {
            log::error!("error while getting the DCMF version: {err}");
            Error::FileIo
        })
    }

    /// Health of the four decision-firmware copies; zero means intact.
    pub fn dcmf_status(&self) -> Result<[i32; 4]> {
        let mut guard = self.lock();
        guard.db.firmware.dcmf_status().map_err(|_| Error::FileIo)
    }

    /// The configured maximum boot retry count.
    pub fn max_retry(&self) -> Result<u8> {
        let mut guard = self.lock();
        guard.db.firmware.max_retry().map_err(|_| Error::FileIo)
    }

    // ---- slot enumeration ----

    /// Number of user-addressable slots.
    pub fn slot_count(&self) -> Result<usize> {
        let guard = self.lock();
        guard.ensure_spt()?;
        Ok(guard.db.slot_count())
    }

    /// Find a slot by partition name.
    pub fn slot_by_name(&self, name: &str) -> Result<usize> {
        let guard = self.lock();
        guard.ensure_spt()?;

        let mut cnt = 0;
        for x in 0..guard.db.spt().partition_count() {
            if guard.db.is_slot(x) {
                if guard.db.spt().partition(x).name_str() == name {
                    return Ok(cnt);
                }
                cnt += 1;
            }
        }
        Err(Error::Name)
    }

    /// Name, flash offset, size and boot priority of a slot.
    pub fn slot_get_info(&self, slot: usize) -> Result<SlotInfo> {
        let guard = self.lock();
        guard.ensure_spt()?;
        guard.ensure_cpb()?;

        let part = guard.db.slot_to_part(slot)?;
        Ok(slot::slot_info(&guard.db, part))
    }

    /// Capacity of a slot in bytes.
    pub fn slot_size(&self, slot: usize) -> Result<u64> {
        let guard = self.lock();
        guard.ensure_spt()?;

        let part = guard.db.slot_to_part(slot)?;
        Ok(u64::from(guard.db.spt().partition(part).length.get()))
    }

    /// Boot priority of a slot; 1 is highest, 0 means not enabled.
    pub fn slot_priority(&self, slot: usize) -> Result<u32> {
        let guard = self.lock();
        guard.ensure_spt()?;
        guard.ensure_cpb()?;

        let part = guard.db.slot_to_part(slot)?;
        Ok(guard.db.priority_get(part))
    }

    // ---- slot lifecycle ----

    /// Create a new slot over unused flash.
    pub fn slot_create(&self, name: &str, address: u64, size: u32) -> Result<()> {
        let mut guard = self.lock();
        guard.ensure_spt()?;

        if db::is_reserved_name(name) {
            log::error!("slot create uses a reserved name");
            return Err(Error::Name);
        }

        guard
            .db
            .partition_create(name, address, size)
            .map_err(|_| Error::LowLevel)
    }

    /// Remove a slot: drop its priority, erase its data, delete the
    /// partition.
    pub fn slot_delete(&self, slot: usize) -> Result<()> {
        let mut guard = self.lock();
        guard.ensure_spt()?;
        guard.ensure_cpb()?;

        if guard.config.write_protected(slot) {
            log::error!("trying to delete a write protected slot");
            return Err(Error::WrProt);
        }

        let part = guard.db.slot_to_part(slot)?;
        guard.db.priority_remove(part).map_err(|_| Error::LowLevel)?;
        guard.db.erase_part(part).map_err(|_| Error::LowLevel)?;
        guard.db.partition_delete(part).map_err(|_| Error::LowLevel)
    }

    /// Rename a slot's backing partition.
    pub fn slot_rename(&self, slot: usize, name: &str) -> Result<()> {
        let mut guard = self.lock();
        guard.ensure_spt()?;

        let part = guard.db.slot_to_part(slot)?;

        if db::is_reserved_name(name) {
            log::error!("slot rename uses a reserved name");
            return Err(Error::Name);
        }

        guard.db.partition_rename(part, name).map_err(|_| Error::Name)
    }

    /// Drop a slot from the priority chain and erase its contents.
    pub fn slot_erase(&self, slot: usize) -> Result<()> {
        let mut guard = self.lock();
        guard.ensure_spt()?;
        guard.ensure_cpb()?;

        if guard.config.write_protected(slot) {
            log::error!("trying to erase a write protected slot");
            return Err(Error::WrProt);
        }

        let part = guard.db.slot_to_part(slot)?;
        guard.db.priority_remove(part).map_err(|_| Error::LowLevel)?;
        guard.db.erase_part(part).map_err(|_| Error::LowLevel)
    }

    /// Set a slot to the highest boot priority.
    pub fn slot_enable(&self, slot: usize) -> Result<()> {
        let mut guard = self.lock();
        guard.ensure_spt()?;
        guard.ensure_cpb()?;

        let part = guard.db.slot_to_part(slot)?;
        guard.db.priority_remove(part).map_err(|_| Error::LowLevel)?;
        guard.db.priority_add(part).map_err(|_| Error::LowLevel)
    }

    /// Drop a slot from the priority chain, keeping its contents.
    pub fn slot_disable(&self, slot: usize) -> Result<()> {
        let mut guard = self.lock();
        guard.ensure_spt()?;
        guard.ensure_cpb()?;

        let part = guard.db.slot_to_part(slot)?;
        guard.db.priority_remove(part).map_err(|_| Error::LowLevel)
    }

    // ---- reboot targeting ----

    /// Ask the firmware to boot this slot after the next reboot.
    pub fn slot_load_after_reboot(&self, slot: usize) -> Result<()> {
        let mut guard = self.lock();
        guard.ensure_spt()?;
        guard.ensure_cpb()?;

        let part = guard.db.slot_to_part(slot)?;
        let offset = guard.db.spt().partition(part).offset.get();
        guard
            .db
            .mailbox
            .send_update_address(offset)
            .map_err(|_| Error::FileIo)
    }

    /// Ask the firmware to boot the factory image after the next reboot.
    pub fn slot_load_factory_after_reboot(&self) -> Result<()> {
        let mut guard = self.lock();
        guard.ensure_spt()?;

        let Some(part) = guard.db.spt().find_partition(db::FACTORY_IMAGE_NAME) else {
            log::error!("no FACTORY_IMAGE partition defined");
            return Err(Error::Format);
        };

        let offset = guard.db.spt().partition(part).offset.get();
        guard
            .db
            .mailbox
            .send_update_address(offset)
            .map_err(|_| Error::FileIo)
    }

    // ---- programming and verification ----

    fn program(&self, slot: usize, source: &mut dyn Read, raw: bool) -> Result<()> {
        let mut guard = self.lock();
        guard.ensure_spt()?;
        if !raw {
            guard.ensure_cpb()?;
        }

        let ctx = &mut *guard;
        slot::program_common(&mut ctx.db, &ctx.config, slot, source, raw)
    }

    fn verify(&self, slot: usize, source: &mut dyn Read, raw: bool) -> Result<()> {
        let mut guard = self.lock();
        guard.ensure_spt()?;
        if !raw {
            guard.ensure_cpb()?;
        }

        slot::verify_common(&mut guard.db, slot, source, raw)
    }

    /// Program a slot from an in-memory image.
    pub fn slot_program_buf(&self, slot: usize, buf: &[u8]) -> Result<()> {
        if buf.is_empty() {
            log::error!("bad buffer argument");
            return Err(Error::Args);
        }
        self.program(slot, &mut &buf[..], false)
    }

    /// Program a slot from an image file.
    pub fn slot_program_file<P: AsRef<Path>>(&self, slot: usize, path: P) -> Result<()> {
        let mut file = open_image(path.as_ref())?;
        self.program(slot, &mut file, false)
    }

    /// Program a slot from a pull callback.
    pub fn slot_program_callback<F>(&self, slot: usize, callback: F) -> Result<()>
    where
        F: FnMut(&mut [u8]) -> std::io::Result<usize>,
    {
        self.program(slot, &mut PullSource::new(callback), false)
    }

    /// Program a slot from an in-memory image, skipping the image pipeline
    /// and the priority append.
    pub fn slot_program_buf_raw(&self, slot: usize, buf: &[u8]) -> Result<()> {
        if buf.is_empty() {
            log::error!("bad buffer argument");
            return Err(Error::Args);
        }
        self.program(slot, &mut &buf[..], true)
    }

    /// Program a slot from an image file, skipping the image pipeline and
    /// the priority append.
    pub fn slot_program_file_raw<P: AsRef<Path>>(&self, slot: usize, path: P) -> Result<()> {
        let mut file = open_image(path.as_ref())?;
        self.program(slot, &mut file, true)
    }

    /// Program a slot from a pull callback, skipping the image pipeline and
    /// the priority append.
    pub fn slot_program_callback_raw<F>(&self, slot: usize, callback: F) -> Result<()>
    where
        F: FnMut(&mut [u8]) -> std::io::Result<usize>,
    {
        self.program(slot, &mut PullSource::new(callback), true)
    }

    /// Program a factory-update image from a buffer. Same handling as
    /// [`Rsu::slot_program_buf`]; the pipeline deals with both regular and
    /// factory update images.
    pub fn slot_program_factory_update_buf(&self, slot: usize, buf: &[u8]) -> Result<()> {
        self.slot_program_buf(slot, buf)
    }

    /// Program a factory-update image from a file. Same handling as
    /// [`Rsu::slot_program_file`].
    pub fn slot_program_factory_update_file<P: AsRef<Path>>(
        &self,
        slot: usize,
        path: P,
    ) -> Result<()> {
        self.slot_program_file(slot, path)
    }

    /// Verify a slot against an in-memory image.
    pub fn slot_verify_buf(&self, slot: usize, buf: &[u8]) -> Result<()> {
        if buf.is_empty() {
            log::error!("bad buffer argument");
            return Err(Error::Args);
        }
        self.verify(slot, &mut &buf[..], false)
    }

    /// Verify a slot against an image file.
    pub fn slot_verify_file<P: AsRef<Path>>(&self, slot: usize, path: P) -> Result<()> {
        let mut file = open_image(path.as_ref())?;
        self.verify(slot, &mut file, false)
    }

    /// Verify a slot against a pull callback.
    pub fn slot_verify_callback<F>(&self, slot: usize, callback: F) -> Result<()>
    where
        F: FnMut(&mut [u8]) -> std::io::Result<usize>,
    {
        self.verify(slot, &mut PullSource::new(callback), false)
    }

    /// Byte-exact verify of a slot against an in-memory image.
    pub fn slot_verify_buf_raw(&self, slot: usize, buf: &[u8]) -> Result<()> {
        if buf.is_empty() {
            log::error!("bad buffer argument");
            return Err(Error::Args);
        }
        self.verify(slot, &mut &buf[..], true)
    }

    /// Byte-exact verify of a slot against an image file.
    pub fn slot_verify_file_raw<P: AsRef<Path>>(&self, slot: usize, path: P) -> Result<()> {
        let mut file = open_image(path.as_ref())?;
        self.verify(slot, &mut file, true)
    }

    /// Byte-exact verify of a slot against a pull callback.
    pub fn slot_verify_callback_raw<F>(&self, slot: usize, callback: F) -> Result<()>
    where
        F: FnMut(&mut [u8]) -> std::io::Result<usize>,
    {
        self.verify(slot, &mut PullSource::new(callback), true)
    }

    // ---- copy out ----

    /// Copy a slot's contents to a file, skipping trailing unwritten
    /// blocks.
    pub fn slot_copy_to_file<P: AsRef<Path>>(&self, slot: usize, path: P) -> Result<()> {
        let mut guard = self.lock();
        guard.ensure_spt()?;
        guard.ensure_cpb()?;

        let mut file = std::fs::File::create(path.as_ref()).map_err(|err| {
            log::error!(
                "unable to open output file {}: {err}",
                path.as_ref().display()
            );
            Error::FileIo
        })?;

        slot::copy_common(&mut guard.db, slot, &mut file)
    }

    /// Copy a slot's contents into `buf`, which must hold the whole slot.
    pub fn slot_copy_to_buf(&self, slot: usize, buf: &mut [u8]) -> Result<()> {
        let mut guard = self.lock();
        guard.ensure_spt()?;
        guard.ensure_cpb()?;

        let part = guard.db.slot_to_part(slot)?;
        let size = guard.db.spt().partition(part).length.get() as usize;
        if buf.len() < size || buf.is_empty() {
            log::error!("buffer size is not adequate");
            return Err(Error::Args);
        }

        if guard.db.priority_get(part) == 0 {
            log::error!("trying to read an erased slot");
            return Err(Error::Erase);
        }

        guard.db.read_part(part, 0, &mut buf[..size])
    }

    // ---- metadata backup and restore ----

    /// Save the SPT to a file (table bytes followed by their CRC).
    pub fn save_spt<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let data = self.save_spt_to_buf()?;
        std::fs::write(path, data).map_err(|err| {
            log::error!("failed to write the SPT snapshot: {err}");
            Error::FileIo
        })
    }

    /// Save the SPT into a byte vector (table bytes followed by their CRC).
    pub fn save_spt_to_buf(&self) -> Result<Vec<u8>> {
        let mut guard = self.lock();
        guard.ensure_spt()?;
        guard.db.save_spt()
    }

    /// Restore the SPT from a file produced by [`Rsu::save_spt`].
    pub fn restore_spt<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let data = std::fs::read(path).map_err(|err| {
            log::error!("failed to read the SPT snapshot: {err}");
            Error::FileIo
        })?;
        self.restore_spt_from_buf(&data)
    }

    /// Restore the SPT from a buffer produced by [`Rsu::save_spt_to_buf`].
    pub fn restore_spt_from_buf(&self, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            return Err(Error::Args);
        }
        self.lock().db.restore_spt(data)
    }

    /// Save the CPB to a file (table bytes followed by their CRC).
    pub fn save_cpb<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let data = self.save_cpb_to_buf()?;
        std::fs::write(path, data).map_err(|err| {
            log::error!("failed to write the CPB snapshot: {err}");
            Error::FileIo
        })
    }

    /// Save the CPB into a byte vector (table bytes followed by their CRC).
    pub fn save_cpb_to_buf(&self) -> Result<Vec<u8>> {
        let mut guard = self.lock();
        guard.ensure_cpb()?;
        guard.db.save_cpb()
    }

    /// Restore the CPB from a file produced by [`Rsu::save_cpb`].
    pub fn restore_cpb<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let data = std::fs::read(path).map_err(|err| {
            log::error!("failed to read the CPB snapshot: {err}");
            Error::FileIo
        })?;
        self.restore_cpb_from_buf(&data)
    }

    /// Restore the CPB from a buffer produced by [`Rsu::save_cpb_to_buf`].
    pub fn restore_cpb_from_buf(&self, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            return Err(Error::Args);
        }
        self.lock().db.restore_cpb(data)
    }

    /// Rebuild an empty CPB: header only, every pointer slot free.
    pub fn create_empty_cpb(&self) -> Result<()> {
        self.lock().db.empty_cpb()
    }
}

impl Drop for Rsu {
    fn drop(&mut self) {
        log::debug!("session closed");
        SESSION_ACTIVE.store(false, Ordering::SeqCst);
    }
}

fn open_image(path: &Path) -> Result<std::fs::File> {
    std::fs::File::open(path).map_err(|err| {
        log::error!("unable to open file {}: {err}", path.display());
        Error::FileIo
    })
}
