//! Media blobs under a data root.
//!
//! Blob paths in records are relative to the data root. Every one is checked
//! before use: absolute paths and `..` components are rejected. Blobs are
//! placed with write-temp, `fsync`, `rename`, then an `fsync` of the parent
//! directory, so a crash never leaves a partial file under its final name.

use std::fs::{self, File};
use std::io;
use std::path::{Component, Path, PathBuf};

use serde::Serialize;
use serde_json::{Value, json};
use thiserror::Error;
use tracing::{debug, warn};

use crate::hashing::{record_id, sha256_file};
use crate::record::INPUT_FILE;

#[derive(Error, Debug)]
pub enum MediaError {
    #[error("unsafe blob path {path:?}: {reason}")]
    UnsafePath { path: String, reason: &'static str },

    #[error("{path}: {source}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("size mismatch after copy to {path}: expected {expected}, got {actual}")]
    SizeMismatch {
        path: String,
        expected: u64,
        actual: u64,
    },
}

fn io_err(path: &Path) -> impl FnOnce(io::Error) -> MediaError + '_ {
    move |source| MediaError::Io {
        path: path.display().to_string(),
        source,
    }
}

/// Validate a record-relative blob path and normalise separators.
pub fn validate_relative_path(raw: &str) -> Result<PathBuf, MediaError> {
    let unsafe_path = |reason| MediaError::UnsafePath {
        path: raw.to_string(),
        reason,
    };
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(unsafe_path("empty"));
    }
    if trimmed.contains('\0') {
        return Err(unsafe_path("contains NUL"));
    }
    let normalised = trimmed.replace('\\', "/");
    if normalised.starts_with('/') || normalised.chars().nth(1) == Some(':') {
        return Err(unsafe_path("absolute paths are not allowed"));
    }
    let mut out = PathBuf::new();
    for component in Path::new(&normalised).components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::CurDir => {}
            Component::ParentDir => return Err(unsafe_path("`..` is not allowed")),
            Component::RootDir | Component::Prefix(_) => {
                return Err(unsafe_path("absolute paths are not allowed"));
            }
        }
    }
    if out.as_os_str().is_empty() {
        return Err(unsafe_path("empty"));
    }
    Ok(out)
}

fn sync_dir(dir: &Path) -> io::Result<()> {
    #[cfg(unix)]
    {
        File::open(dir)?.sync_all()?;
    }
    #[cfg(not(unix))]
    {
        let _ = dir;
    }
    Ok(())
}

/// Copy `src` to `dest` through a temp file in the destination directory and
/// verify the final size. Returns bytes written.
pub fn copy_atomic(src: &Path, dest: &Path) -> Result<u64, MediaError> {
    let parent = dest.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent).map_err(io_err(parent))?;
    let expected = fs::metadata(src).map_err(io_err(src))?.len();

    let mut tmp = tempfile::Builder::new()
        .prefix(".incoming-")
        .tempfile_in(parent)
        .map_err(io_err(parent))?;
    let mut input = File::open(src).map_err(io_err(src))?;
    io::copy(&mut input, tmp.as_file_mut()).map_err(io_err(dest))?;
    tmp.as_file().sync_all().map_err(io_err(dest))?;
    tmp.persist(dest).map_err(|e| MediaError::Io {
        path: dest.display().to_string(),
        source: e.error,
    })?;
    sync_dir(parent).map_err(io_err(parent))?;

    let actual = fs::metadata(dest).map_err(io_err(dest))?.len();
    if actual != expected {
        return Err(MediaError::SizeMismatch {
            path: dest.display().to_string(),
            expected,
            actual,
        });
    }
    Ok(actual)
}

/// How a blob reached its destination.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Placement {
    Copied,
    Linked,
}

/// Hard-link `src` to `dest`, falling back to [`copy_atomic`] when linking
/// fails (cross-device, unsupported filesystem).
pub fn link_or_copy(src: &Path, dest: &Path) -> Result<Placement, MediaError> {
    let parent = dest.parent().unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent).map_err(io_err(parent))?;
    match fs::hard_link(src, dest) {
        Ok(()) => {
            sync_dir(parent).map_err(io_err(parent))?;
            let expected = fs::metadata(src).map_err(io_err(src))?.len();
            let actual = fs::metadata(dest).map_err(io_err(dest))?.len();
            if actual != expected {
                return Err(MediaError::SizeMismatch {
                    path: dest.display().to_string(),
                    expected,
                    actual,
                });
            }
            Ok(Placement::Linked)
        }
        Err(e) => {
            debug!(src = %src.display(), error = %e, "Hard link failed, copying");
            copy_atomic(src, dest)?;
            Ok(Placement::Copied)
        }
    }
}

/// Blob access the retention engine needs.
pub trait MediaStore {
    fn exists(&self, blob_path: &str) -> bool;

    /// Delete a blob. `Ok(false)` when it was already gone.
    fn delete_blob(&self, blob_path: &str) -> Result<bool, MediaError>;
}

/// Result of [`FsMediaStore::ingest_file`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IngestedFile {
    pub input_id: String,
    pub sha256: String,
    pub blob_path: String,
    pub size_bytes: u64,
    pub deduped: bool,
}

impl IngestedFile {
    /// `evidence.input.file` payload describing this blob.
    #[must_use]
    pub fn record_payload(&self, ts_utc: &str) -> Value {
        json!({
            "record_type": INPUT_FILE,
            "ts_utc": ts_utc,
            "content_hash": self.sha256,
            "blob_path": self.blob_path,
            "size_bytes": self.size_bytes,
        })
    }
}

/// Media tree rooted at a data directory.
#[derive(Debug, Clone)]
pub struct FsMediaStore {
    root: PathBuf,
}

impl FsMediaStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Absolute path of a validated relative blob path.
    pub fn resolve(&self, blob_path: &str) -> Result<PathBuf, MediaError> {
        Ok(self.root.join(validate_relative_path(blob_path)?))
    }

    /// Content-addressed ingest. Identical bytes map to the same `input_id`
    /// and blob; the blob is written only the first time.
    pub fn ingest_file(&self, run_id: &str, path: &Path) -> Result<IngestedFile, MediaError> {
        let sha256 = sha256_file(path).map_err(io_err(path))?;
        let blob_path = format!("media/inputs/{}/{sha256}", &sha256[..2]);
        let dest = self.resolve(&blob_path)?;
        let size = fs::metadata(path).map_err(io_err(path))?.len();

        let deduped = match fs::metadata(&dest) {
            Ok(meta) if meta.len() == size => true,
            Ok(_) => {
                warn!(blob = %dest.display(), "Existing blob has wrong size, rewriting");
                false
            }
            Err(_) => false,
        };
        if !deduped {
            copy_atomic(path, &dest)?;
        }
        Ok(IngestedFile {
            input_id: record_id(run_id, INPUT_FILE, &sha256),
            sha256,
            blob_path,
            size_bytes: size,
            deduped,
        })
    }
}

impl MediaStore for FsMediaStore {
    fn exists(&self, blob_path: &str) -> bool {
        self.resolve(blob_path).is_ok_and(|p| p.is_file())
    }

    fn delete_blob(&self, blob_path: &str) -> Result<bool, MediaError> {
        let path = self.resolve(blob_path)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
            Err(source) => Err(MediaError::Io {
                path: path.display().to_string(),
                source,
            }),
        }
    }
}
