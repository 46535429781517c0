//! Store directory management.
//!
//! File system layout:
//!
//! ```text
//! <store_path>/
//! ├─ DEVICE       # Device identity and clock state
//! ├─ LOCK         # Advisory lock for single-writer
//! └─ snapshot.json  # Tables, outbox, cursors, tombstones
//! ```
//!
//! The LOCK file ensures only one process opens the store at a time.

use crate::error::{StoreError, StoreResult};
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};

const DEVICE_FILE: &str = "DEVICE";
const LOCK_FILE: &str = "LOCK";
const SNAPSHOT_FILE: &str = "snapshot.json";
const SNAPSHOT_TEMP: &str = "snapshot.json.tmp";

/// Manages the store directory structure and file locking.
///
/// Holds an exclusive lock on the store directory; only one `StoreDir`
/// instance can exist per directory at a time.
#[derive(Debug)]
pub struct StoreDir {
    /// Root directory path.
    path: PathBuf,
    /// Lock file handle, held for exclusive access.
    _lock_file: File,
}

impl StoreDir {
    /// Opens or creates a store directory.
    ///
    /// # Errors
    ///
    /// Returns `DirectoryMissing` if the directory doesn't exist and
    /// `create_if_missing` is false, or `Locked` if another process holds
    /// the lock.
    pub fn open(path: &Path, create_if_missing: bool) -> StoreResult<Self> {
        if !path.exists() {
            if create_if_missing {
                fs::create_dir_all(path)?;
            } else {
                return Err(StoreError::DirectoryMissing {
                    path: path.display().to_string(),
                });
            }
        }

        let lock_path = path.join(LOCK_FILE);
        let lock_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&lock_path)?;

        if lock_file.try_lock_exclusive().is_err() {
            return Err(StoreError::Locked);
        }

        Ok(Self {
            path: path.to_path_buf(),
            _lock_file: lock_file,
        })
    }

    /// Returns the store directory path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the device identity file path.
    #[must_use]
    pub fn device_path(&self) -> PathBuf {
        self.path.join(DEVICE_FILE)
    }

    /// Returns the snapshot file path.
    #[must_use]
    pub fn snapshot_path(&self) -> PathBuf {
        self.path.join(SNAPSHOT_FILE)
    }

    /// Returns true if no snapshot has been written yet.
    #[must_use]
    pub fn is_new_store(&self) -> bool {
        !self.snapshot_path().exists()
    }

    /// Writes `contents` to the snapshot file atomically.
    ///
    /// The bytes land in a temp file first and are renamed over the
    /// snapshot, so readers never observe a half-written file.
    pub fn write_snapshot(&self, contents: &[u8]) -> StoreResult<()> {
        let temp_path = self.path.join(SNAPSHOT_TEMP);
        fs::write(&temp_path, contents)?;
        fs::rename(&temp_path, self.snapshot_path())?;
        Ok(())
    }

    /// Reads the snapshot file, if present.
    pub fn read_snapshot(&self) -> StoreResult<Option<Vec<u8>>> {
        let path = self.snapshot_path();
        if !path.exists() {
            return Ok(None);
        }
        Ok(Some(fs::read(path)?))
    }
}
