//! Durable transfer progress.
//!
//! A checkpoint is one integer per (transfer identity, direction):
//! - sending side: `base`, the count of contiguously acknowledged chunks;
//! - receiving side: the count of chunks contiguously written to the sink.
//!
//! The window managers trust the stored value completely when a session is
//! restarted; the destination file length is never re-checked.  A
//! [`CheckpointStore::write`] must therefore be durable when it returns.

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};

use thiserror::Error;

/// Which pipeline a checkpoint belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Send,
    Receive,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CheckpointKey {
    pub identity: String,
    pub direction: Direction,
}

impl CheckpointKey {
    pub fn send(identity: impl Into<String>) -> Self {
        Self {
            identity: identity.into(),
            direction: Direction::Send,
        }
    }

    pub fn receive(identity: impl Into<String>) -> Self {
        Self {
            identity: identity.into(),
            direction: Direction::Receive,
        }
    }

    /// File name used by [`FileCheckpointStore`], e.g. `report.pdf.send.checkpoint`.
    pub fn file_name(&self) -> String {
        let dir = match self.direction {
            Direction::Send => "send",
            Direction::Receive => "recv",
        };
        format!("{}.{dir}.checkpoint", self.identity)
    }
}

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("checkpoint I/O on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("checkpoint {} holds {content:?}, not a chunk count", path.display())]
    Corrupt { path: PathBuf, content: String },
    #[error("checkpoint store unavailable: {0}")]
    Unavailable(String),
}

/// Durable key → integer storage.
pub trait CheckpointStore: Send + Sync {
    /// Stored value, or `0` when nothing was stored for `key`.
    fn read(&self, key: &CheckpointKey) -> Result<u64, CheckpointError>;

    /// Overwrite the value for `key`.  Durable before returning.
    fn write(&self, key: &CheckpointKey, value: u64) -> Result<(), CheckpointError>;
}

// ---------------------------------------------------------------------------
// FileCheckpointStore
// ---------------------------------------------------------------------------

/// One small text file per key inside a directory.
///
/// Writes go to a `.tmp` sibling that is fsync'd and then renamed over the
/// target, so a crash leaves either the old or the new value, never a torn one.
#[derive(Debug, Clone)]
pub struct FileCheckpointStore {
    dir: PathBuf,
}

impl FileCheckpointStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path(&self, key: &CheckpointKey) -> PathBuf {
        self.dir.join(key.file_name())
    }
}

impl CheckpointStore for FileCheckpointStore {
    fn read(&self, key: &CheckpointKey) -> Result<u64, CheckpointError> {
        let path = self.path(key);
        let content = match fs::read_to_string(&path) {
            Ok(c) => c,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
            Err(source) => return Err(CheckpointError::Io { path, source }),
        };
        content
            .trim()
            .parse::<u64>()
            .map_err(|_| CheckpointError::Corrupt { path, content })
    }

    fn write(&self, key: &CheckpointKey, value: u64) -> Result<(), CheckpointError> {
        let path = self.path(key);
        let tmp_path = path.with_extension("checkpoint.tmp");
        fs::create_dir_all(&self.dir).map_err(io_error(&self.dir))?;

        let write_tmp = || -> io::Result<()> {
            let mut f = File::create(&tmp_path)?;
            f.write_all(value.to_string().as_bytes())?;
            f.sync_all()
        };
        write_tmp().map_err(io_error(&tmp_path))?;

        fs::rename(&tmp_path, &path).map_err(|source| {
            let _ = fs::remove_file(&tmp_path);
            CheckpointError::Io {
                path: path.clone(),
                source,
            }
        })?;

        // Persist the rename itself.
        #[cfg(unix)]
        if let Ok(dir) = File::open(&self.dir) {
            let _ = dir.sync_all();
        }

        Ok(())
    }
}

fn io_error(path: &Path) -> impl FnOnce(io::Error) -> CheckpointError {
    let path = path.to_path_buf();
    move |source| CheckpointError::Io { path, source }
}

// ---------------------------------------------------------------------------
// MemoryCheckpointStore
// ---------------------------------------------------------------------------

/// In-process store that remembers every value written, for tests and
/// simulations.  Writes can be made to fail on demand.
#[derive(Debug, Default)]
pub struct MemoryCheckpointStore {
    history: Mutex<HashMap<CheckpointKey, Vec<u64>>>,
    fail_writes: AtomicBool,
}

impl MemoryCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pre-load a value, as if a previous run had stored it.
    pub fn seed(&self, key: CheckpointKey, value: u64) {
        self.lock().insert(key, vec![value]);
    }

    /// Every value written for `key`, oldest first.
    pub fn history(&self, key: &CheckpointKey) -> Vec<u64> {
        self.lock().get(key).cloned().unwrap_or_default()
    }

    /// Make subsequent writes fail (or succeed again).
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<CheckpointKey, Vec<u64>>> {
        self.history.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl CheckpointStore for MemoryCheckpointStore {
    fn read(&self, key: &CheckpointKey) -> Result<u64, CheckpointError> {
        Ok(self
            .lock()
            .get(key)
            .and_then(|h| h.last().copied())
            .unwrap_or(0))
    }

    fn write(&self, key: &CheckpointKey, value: u64) -> Result<(), CheckpointError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(CheckpointError::Unavailable(format!(
                "write of {} refused",
                key.file_name()
            )));
        }
        self.lock().entry(key.clone()).or_default().push(value);
        Ok(())
    }
}
