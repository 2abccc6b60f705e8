//! Slot Registry and per-user locks.
//!
//! Both are advisory `flock`-style locks on files in well-known
//! directories, so independently-started processes coordinate with no
//! broker. The lock on `slotK` is the authoritative presence signal; the
//! sibling `slotK.owner` JSON record is observational metadata and may lag.
//! Readers trust an owner record only while its PID is alive and the slot
//! is actually locked; anything else is stale and gets swept.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::AppError;
use crate::fsutil;
use crate::procutil;

pub const SLOTS_DIR_NAME: &str = "twitch-record-slots";
pub const USER_LOCKS_DIR_NAME: &str = "twitch-active-users";

/// Interval between rescans while waiting for a slot to free up.
const ACQUIRE_RESCAN: Duration = Duration::from_secs(2);

/// Owner record written next to a held slot lock.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlotOwner {
    pub pid: i32,
    pub username: String,
    pub started_at: DateTime<Utc>,
}

/// A validated owner as seen by readers.
#[derive(Debug, Clone, Serialize)]
pub struct OwnerInfo {
    pub slot: u32,
    #[serde(flatten)]
    pub owner: SlotOwner,
}

/// Preferred runtime directory: the per-user tmpfs, falling back to the
/// world-writable tmp dir when it is missing or not writable.
pub fn default_slots_dir() -> PathBuf {
    let uid = unsafe { libc::getuid() };
    let run_base = PathBuf::from(format!("/run/user/{}", uid));
    if run_base.is_dir() {
        let candidate = run_base.join(SLOTS_DIR_NAME);
        if std::fs::create_dir_all(&candidate).is_ok() {
            return candidate;
        }
    }
    std::env::temp_dir().join(SLOTS_DIR_NAME)
}

pub fn default_user_locks_dir() -> PathBuf {
    std::env::temp_dir().join(USER_LOCKS_DIR_NAME)
}

/// Filesystem-backed allocator for the global concurrent-recording cap.
pub struct SlotRegistry {
    dir: PathBuf,
    limit: u32,
}

/// A held slot. Dropping it releases the slot; [`SlotHandle::release`]
/// does the same explicitly (owner record removed before the lock).
pub struct SlotHandle {
    index: u32,
    file: File,
    owner_path: PathBuf,
    released: bool,
}

impl SlotRegistry {
    pub fn new(limit: u32) -> Result<Self, AppError> {
        Self::with_dir(limit, default_slots_dir())
    }

    pub fn with_dir(limit: u32, dir: PathBuf) -> Result<Self, AppError> {
        if limit == 0 {
            return Err(AppError::Config("record_limit must be >= 1".into()));
        }
        std::fs::create_dir_all(&dir).map_err(|e| AppError::Io(dir.clone(), e))?;
        let registry = Self { dir, limit };
        // Precreate the lock stubs so `status` and `doctor` see them.
        for i in 1..=registry.limit {
            let path = registry.slot_path(i);
            if let Err(e) = OpenOptions::new().append(true).create(true).open(&path) {
                return Err(AppError::Io(path, e));
            }
        }
        Ok(registry)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn limit(&self) -> u32 {
        self.limit
    }

    fn slot_path(&self, index: u32) -> PathBuf {
        self.dir.join(format!("slot{}", index))
    }

    fn owner_path(&self, index: u32) -> PathBuf {
        self.dir.join(format!("slot{}.owner", index))
    }

    /// One non-blocking scan over `slot1..slotN`. Returns the first slot
    /// we could lock, with its owner record already written.
    pub fn try_acquire(&self, username: &str) -> Result<Option<SlotHandle>, AppError> {
        for index in 1..=self.limit {
            // Skip slots whose owner record points at a live process; the
            // lock probe below would say the same thing, but this keeps us
            // from opening files we know are taken.
            if let Ok(owner) = fsutil::read_json::<SlotOwner>(&self.owner_path(index)) {
                if procutil::pid_alive(owner.pid) {
                    continue;
                }
            }

            let path = self.slot_path(index);
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(false)
                .open(&path)
                .map_err(|e| AppError::Io(path.clone(), e))?;

            match file.try_lock_exclusive() {
                Ok(()) => {}
                Err(e) if is_contended(&e) => continue,
                Err(e) => return Err(AppError::Io(path, e)),
            }

            let owner = SlotOwner {
                pid: std::process::id() as i32,
                username: username.to_string(),
                started_at: Utc::now(),
            };
            let owner_path = self.owner_path(index);
            if let Err(e) = fsutil::atomic_write_json(&owner_path, &owner) {
                // Cannot advertise ownership (disk full, most likely):
                // give the slot back and surface the failure.
                let _ = FileExt::unlock(&file);
                return Err(AppError::Internal(format!(
                    "failed to write owner record for slot {}: {}",
                    index, e
                )));
            }

            info!(slot = index, user = username, "acquired recording slot");
            return Ok(Some(SlotHandle {
                index,
                file,
                owner_path,
                released: false,
            }));
        }
        Ok(None)
    }

    /// Acquire a slot, waiting for one to free unless `fail_fast`.
    pub async fn acquire(&self, username: &str, fail_fast: bool) -> Result<SlotHandle, AppError> {
        let mut waited = Duration::ZERO;
        loop {
            if let Some(handle) = self.try_acquire(username)? {
                return Ok(handle);
            }
            if fail_fast {
                return Err(AppError::Busy);
            }
            if waited.as_secs() % 10 == 0 {
                let active: Vec<String> = self
                    .enumerate()
                    .unwrap_or_default()
                    .into_iter()
                    .map(|o| o.owner.username)
                    .collect();
                info!(
                    waited_s = waited.as_secs(),
                    active = ?active,
                    "waiting for a free recording slot"
                );
            }
            self.sweep().ok();
            tokio::time::sleep(ACQUIRE_RESCAN).await;
            waited += ACQUIRE_RESCAN;
        }
    }

    /// All valid owners. Stale records encountered on the way are removed.
    pub fn enumerate(&self) -> Result<Vec<OwnerInfo>, AppError> {
        let mut infos = Vec::new();
        for index in 1..=self.limit {
            let owner_path = self.owner_path(index);
            if !owner_path.exists() {
                continue;
            }
            let owner: SlotOwner = match fsutil::read_json(&owner_path) {
                Ok(owner) => owner,
                Err(_) => {
                    // Torn or foreign content; writers are atomic so this
                    // never belongs to a live holder.
                    let _ = fsutil::remove_if_exists(&owner_path);
                    continue;
                }
            };
            if procutil::pid_alive(owner.pid) && self.slot_is_locked(index) {
                infos.push(OwnerInfo {
                    slot: index,
                    owner,
                });
            } else {
                debug!(slot = index, pid = owner.pid, "removing stale owner record");
                let _ = fsutil::remove_if_exists(&owner_path);
            }
        }
        Ok(infos)
    }

    pub fn active_count(&self) -> usize {
        self.enumerate().map(|v| v.len()).unwrap_or(0)
    }

    /// True iff any slot currently has a live owner. Errors read as "no
    /// recording active" so an unreadable registry cannot wedge the encoder.
    pub fn any_active(&self) -> bool {
        match self.enumerate() {
            Ok(owners) => !owners.is_empty(),
            Err(e) => {
                warn!(error = %e, "failed to enumerate slots; assuming idle");
                false
            }
        }
    }

    /// Remove owner records whose PID is dead or whose slot is unlocked.
    /// Idempotent; returns how many were removed.
    pub fn sweep(&self) -> Result<usize, AppError> {
        let mut removed = 0;
        for index in 1..=self.limit {
            let owner_path = self.owner_path(index);
            if !owner_path.exists() {
                continue;
            }
            let stale = match fsutil::read_json::<SlotOwner>(&owner_path) {
                Ok(owner) => !procutil::pid_alive(owner.pid) || !self.slot_is_locked(index),
                Err(_) => true,
            };
            if stale && fsutil::remove_if_exists(&owner_path).unwrap_or(false) {
                removed += 1;
            }
        }
        if removed > 0 {
            info!(removed, "swept stale slot owner records");
        }
        Ok(removed)
    }

    /// Probe whether some process holds the slot lock. Opens a fresh file
    /// description, so it also reports our own holds correctly.
    fn slot_is_locked(&self, index: u32) -> bool {
        let Ok(file) = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(self.slot_path(index))
        else {
            return false;
        };
        match file.try_lock_exclusive() {
            Ok(()) => {
                let _ = FileExt::unlock(&file);
                false
            }
            Err(_) => true,
        }
    }
}

impl SlotHandle {
    pub fn index(&self) -> u32 {
        self.index
    }

    /// Release the slot: owner record first, lock second, so a crash
    /// between the two leaves only a stale owner for the next sweep.
    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        let _ = fsutil::remove_if_exists(&self.owner_path);
        let _ = FileExt::unlock(&self.file);
        info!(slot = self.index, "released recording slot");
    }
}

impl Drop for SlotHandle {
    fn drop(&mut self) {
        self.release_inner();
    }
}

/// Exclusive per-user lock preventing duplicate recorders for a username.
/// The lock file is kept around after release; its presence alone means
/// nothing, only the flock state does.
pub struct UserLock {
    username: String,
    path: PathBuf,
    file: Option<File>,
}

impl UserLock {
    pub fn new(username: &str) -> Self {
        Self::with_dir(username, default_user_locks_dir())
    }

    pub fn with_dir(username: &str, dir: PathBuf) -> Self {
        Self {
            username: username.to_string(),
            path: dir.join(format!("{}.lock", username)),
            file: None,
        }
    }

    pub fn acquire(&mut self) -> Result<(), AppError> {
        let parent = self
            .path
            .parent()
            .ok_or_else(|| AppError::Internal("user lock path has no parent".into()))?;
        std::fs::create_dir_all(parent).map_err(|e| AppError::Io(parent.to_path_buf(), e))?;

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&self.path)
            .map_err(|e| AppError::Io(self.path.clone(), e))?;
        match file.try_lock_exclusive() {
            Ok(()) => {
                self.file = Some(file);
                Ok(())
            }
            Err(e) if is_contended(&e) => Err(AppError::UserBusy(self.username.clone())),
            Err(e) => Err(AppError::Io(self.path.clone(), e)),
        }
    }

    pub fn release(&mut self) {
        if let Some(file) = self.file.take() {
            let _ = FileExt::unlock(&file);
        }
    }

    /// Non-destructive probe: is some recorder holding this user?
    pub fn is_locked(username: &str) -> bool {
        Self::is_locked_in(&default_user_locks_dir(), username)
    }

    pub fn is_locked_in(dir: &Path, username: &str) -> bool {
        let path = dir.join(format!("{}.lock", username));
        if std::fs::create_dir_all(dir).is_err() {
            return false;
        }
        let Ok(file) = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
        else {
            return false;
        };
        match file.try_lock_exclusive() {
            Ok(()) => {
                let _ = FileExt::unlock(&file);
                false
            }
            Err(_) => true,
        }
    }
}

impl Drop for UserLock {
    fn drop(&mut self) {
        self.release();
    }
}

fn is_contended(e: &std::io::Error) -> bool {
    e.raw_os_error() == fs2::lock_contended_error().raw_os_error()
}
