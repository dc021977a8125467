//! Exclusive-writer guard over a data directory.
//!
//! One advisory lock file per data root, `<data_dir>/.autocapture.instance.lock`,
//! holding `pid=<pid>` of the current owner. A second writer fails fast with
//! [`LockError::Held`] instead of blocking. When the data directory cannot be
//! written (permission denied), the lock moves to
//! `<tmp>/autocapture/locks/<sha256(data_dir)[:16]>.instance.lock` so two
//! writers on the same root still exclude each other.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use fs2::FileExt;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::hashing::sha256_text;
use crate::retry::{RetryPolicy, with_retry};

pub const LOCK_FILE_NAME: &str = ".autocapture.instance.lock";

// ── Errors ──────────────────────────────────────────────────────────────────

#[derive(Error, Debug)]
pub enum LockError {
    /// Another process owns the data directory.
    #[error("instance lock held (pid: {}, path: {path})", pid.map_or_else(|| "unknown".to_string(), |p| p.to_string()))]
    Held { pid: Option<u32>, path: String },

    #[error("instance lock I/O error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },
}

impl LockError {
    #[must_use]
    pub fn is_held(&self) -> bool {
        matches!(self, Self::Held { .. })
    }
}

// ── Paths ───────────────────────────────────────────────────────────────────

/// Primary lock path inside the data directory.
#[must_use]
pub fn primary_lock_path(data_dir: &Path) -> PathBuf {
    data_dir.join(LOCK_FILE_NAME)
}

/// Fallback lock path under the system temp directory, keyed by a hash of the
/// data directory path.
#[must_use]
pub fn fallback_lock_path(data_dir: &Path) -> PathBuf {
    let key = sha256_text(&normalized_dir(data_dir));
    std::env::temp_dir()
        .join("autocapture")
        .join("locks")
        .join(format!("{}.instance.lock", &key[..16]))
}

fn normalized_dir(data_dir: &Path) -> String {
    fs::canonicalize(data_dir)
        .unwrap_or_else(|_| data_dir.to_path_buf())
        .display()
        .to_string()
}

fn parse_pid(contents: &str) -> Option<u32> {
    contents
        .lines()
        .find_map(|line| line.trim().strip_prefix("pid="))
        .and_then(|pid| pid.trim().parse().ok())
}

// ── Guard ───────────────────────────────────────────────────────────────────

/// An acquired instance lock. Released on drop.
#[derive(Debug)]
pub struct InstanceLock {
    file: File,
    path: PathBuf,
    data_dir: PathBuf,
    fallback: bool,
}

impl InstanceLock {
    /// Acquire the lock without waiting.
    pub fn try_acquire(data_dir: &Path) -> Result<Self, LockError> {
        let primary = primary_lock_path(data_dir);
        match fs::create_dir_all(data_dir).and_then(|()| open_lock_file(&primary)) {
            Ok(file) => Self::lock(file, primary, data_dir, false),
            Err(e) if e.kind() == io::ErrorKind::PermissionDenied => {
                let fallback = fallback_lock_path(data_dir);
                warn!(
                    data_dir = %data_dir.display(),
                    fallback = %fallback.display(),
                    "Data directory not writable, using fallback instance lock"
                );
                if let Some(parent) = fallback.parent() {
                    fs::create_dir_all(parent).map_err(|source| LockError::Io {
                        path: parent.display().to_string(),
                        source,
                    })?;
                }
                let file = open_lock_file(&fallback).map_err(|source| LockError::Io {
                    path: fallback.display().to_string(),
                    source,
                })?;
                Self::lock(file, fallback, data_dir, true)
            }
            Err(source) => Err(LockError::Io {
                path: primary.display().to_string(),
                source,
            }),
        }
    }

    /// Acquire, retrying only while another holder owns the lock.
    pub fn acquire_with_retry(data_dir: &Path, policy: &RetryPolicy) -> Result<Self, LockError> {
        with_retry(policy, LockError::is_held, || Self::try_acquire(data_dir))
    }

    fn lock(mut file: File, path: PathBuf, data_dir: &Path, fallback: bool) -> Result<Self, LockError> {
        match file.try_lock_exclusive() {
            Ok(()) => {
                write_owner(&mut file).map_err(|source| LockError::Io {
                    path: path.display().to_string(),
                    source,
                })?;
                debug!(lock = %path.display(), fallback, "Acquired instance lock");
                Ok(Self {
                    file,
                    path,
                    data_dir: data_dir.to_path_buf(),
                    fallback,
                })
            }
            Err(e) if is_contended(&e) => {
                let mut contents = String::new();
                let pid = file
                    .read_to_string(&mut contents)
                    .ok()
                    .and_then(|_| parse_pid(&contents));
                info!(lock = %path.display(), ?pid, "Instance lock held by another writer");
                Err(LockError::Held {
                    pid,
                    path: path.display().to_string(),
                })
            }
            Err(source) => Err(LockError::Io {
                path: path.display().to_string(),
                source,
            }),
        }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    #[must_use]
    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// Whether the temp-dir fallback path is in use.
    #[must_use]
    pub fn is_fallback(&self) -> bool {
        self.fallback
    }
}

impl Drop for InstanceLock {
    fn drop(&mut self) {
        if let Err(e) = self.file.set_len(0) {
            warn!(lock = %self.path.display(), error = %e, "Failed to clear instance lock owner");
        }
        if let Err(e) = FileExt::unlock(&self.file) {
            warn!(lock = %self.path.display(), error = %e, "Failed to release instance lock");
        }
        debug!(lock = %self.path.display(), "Released instance lock");
    }
}

fn open_lock_file(path: &Path) -> io::Result<File> {
    OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)
}

fn write_owner(file: &mut File) -> io::Result<()> {
    file.set_len(0)?;
    file.seek(SeekFrom::Start(0))?;
    writeln!(file, "pid={}", std::process::id())?;
    file.sync_all()
}

fn is_contended(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::WouldBlock
        || err.raw_os_error() == fs2::lock_contended_error().raw_os_error()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn second_acquire_fails_fast_with_owner_pid() {
        let dir = TempDir::new().unwrap();
        let first = InstanceLock::try_acquire(dir.path()).unwrap();
        assert!(!first.is_fallback());
        assert_eq!(first.path(), primary_lock_path(dir.path()));

        match InstanceLock::try_acquire(dir.path()) {
            Err(LockError::Held { pid, path }) => {
                assert_eq!(pid, Some(std::process::id()));
                assert!(path.ends_with(LOCK_FILE_NAME));
            }
            other => panic!("expected Held, got {other:?}"),
        }
    }

    #[test]
    fn lock_is_released_on_drop() {
        let dir = TempDir::new().unwrap();
        drop(InstanceLock::try_acquire(dir.path()).unwrap());
        InstanceLock::try_acquire(dir.path()).unwrap();
    }

    #[test]
    fn retry_gives_up_with_held() {
        let dir = TempDir::new().unwrap();
        let _held = InstanceLock::try_acquire(dir.path()).unwrap();
        let err = InstanceLock::acquire_with_retry(dir.path(), &RetryPolicy::immediate(2)).unwrap_err();
        assert!(err.is_held());
    }

    #[test]
    fn fallback_path_is_stable_per_directory() {
        let a = fallback_lock_path(Path::new("/data/one"));
        let b = fallback_lock_path(Path::new("/data/one"));
        let c = fallback_lock_path(Path::new("/data/two"));
        assert_eq!(a, b);
        assert_ne!(a, c);
        let name = a.file_name().unwrap().to_string_lossy().to_string();
        assert_eq!(name.len(), 16 + ".instance.lock".len());
        assert!(a.starts_with(std::env::temp_dir().join("autocapture").join("locks")));
    }

    #[test]
    fn pid_parsing_tolerates_noise() {
        assert_eq!(parse_pid("pid=123\n"), Some(123));
        assert_eq!(parse_pid("  pid= 9 \nhost=x"), Some(9));
        assert_eq!(parse_pid(""), None);
        assert_eq!(parse_pid("pid=abc"), None);
    }
}
