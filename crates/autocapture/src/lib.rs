//! Shared plumbing for the autocapture tool binaries.
//!
//! Every tool prints exactly one JSON line to stdout and exits 0 on success,
//! 1 when the tool ran but its verdict is a failure, and 2 on an error. Logs
//! go to stderr.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::Context;
use autocapture_core::audit::{AuditSource, open_audit_source};
use autocapture_core::config::Config;
use autocapture_core::lock::InstanceLock;
use autocapture_core::logging::{LogConfig, LogFormat, init_logging};
use autocapture_core::resilient::ReadOptions;
use autocapture_core::retry::RetryPolicy;
use autocapture_core::store::{SqliteOverlay, open_overlay};
use serde::Serialize;
use serde_json::{Value, json};

pub const EXIT_OK: u8 = 0;
pub const EXIT_FAILED: u8 = 1;
pub const EXIT_ERROR: u8 = 2;

/// Outcome of a tool body: the JSON line plus whether the verdict passed.
pub struct ToolOutput {
    pub value: Value,
    pub ok: bool,
}

impl ToolOutput {
    pub fn ok<T: Serialize>(value: &T) -> anyhow::Result<Self> {
        Self::verdict(value, true)
    }

    pub fn verdict<T: Serialize>(value: &T, ok: bool) -> anyhow::Result<Self> {
        Ok(Self {
            value: serde_json::to_value(value)?,
            ok,
        })
    }
}

/// Log to stderr. `verbose` lowers the default level to debug; `RUST_LOG`
/// still wins.
pub fn init_tool_logging(verbose: bool) {
    let config = LogConfig {
        level: if verbose { "debug" } else { "warn" }.to_string(),
        format: LogFormat::Pretty,
        file: None,
    };
    let _ = init_logging(&config);
}

/// Lift any engine error into the crate-level error so its kind and hint
/// survive into the JSON error line.
pub fn core_err<E: Into<autocapture_core::Error>>(err: E) -> anyhow::Error {
    anyhow::Error::new(err.into())
}

/// Error line: `{ok: false, error, kind, hint}`.
#[must_use]
pub fn error_json(err: &anyhow::Error) -> Value {
    let (kind, hint) = match err.downcast_ref::<autocapture_core::Error>() {
        Some(core) => (core.kind_label(), core.hint()),
        None => ("error", None),
    };
    json!({
        "ok": false,
        "error": format!("{err:#}"),
        "kind": kind,
        "hint": hint,
    })
}

fn emit(value: &Value) {
    let mut stdout = std::io::stdout().lock();
    let _ = writeln!(stdout, "{value}");
    let _ = stdout.flush();
}

/// Write `value` to `path` as pretty JSON, creating parent directories.
pub fn write_output_file(path: &Path, value: &Value) -> anyhow::Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).with_context(|| format!("creating {}", parent.display()))?;
    }
    let body = serde_json::to_vec_pretty(value)?;
    std::fs::write(path, body).with_context(|| format!("writing {}", path.display()))
}

/// Run a tool body and translate its outcome into the output contract.
pub fn run_tool<F>(body: F) -> ExitCode
where
    F: FnOnce() -> anyhow::Result<ToolOutput>,
{
    match body() {
        Ok(ToolOutput { mut value, ok }) => {
            if let Value::Object(map) = &mut value {
                map.entry("ok").or_insert(Value::Bool(ok));
            }
            emit(&value);
            ExitCode::from(if ok { EXIT_OK } else { EXIT_FAILED })
        }
        Err(err) => {
            tracing::error!(error = %format!("{err:#}"), "Tool failed");
            emit(&error_json(&err));
            ExitCode::from(EXIT_ERROR)
        }
    }
}

/// `--derived-db`, or `<db parent>/derived/stage1_derived.db`.
#[must_use]
pub fn resolve_derived_db(db: &Path, derived_db: Option<PathBuf>) -> PathBuf {
    derived_db.unwrap_or_else(|| autocapture_core::config::default_derived_db_path(db_parent(db)))
}

/// Directory holding `db`; the data root for tools that only take `--db`.
#[must_use]
pub fn db_parent(db: &Path) -> &Path {
    db.parent().filter(|p| !p.as_os_str().is_empty()).unwrap_or_else(|| Path::new("."))
}

/// Load and validate a config file.
pub fn load_config(path: &Path) -> anyhow::Result<Config> {
    let config = Config::load_from(path).map_err(core_err)?;
    config.validate().map_err(core_err)?;
    Ok(config)
}

/// Fail with a readable error when a required database is absent.
pub fn require_file(path: &Path, what: &str) -> anyhow::Result<()> {
    if !path.is_file() {
        anyhow::bail!("{what} not found: {}", path.display());
    }
    Ok(())
}

/// A store opened the way a tool needs it: read-only through the resilient
/// reader for dry runs, or writable under the instance lock.
pub enum ToolStore {
    ReadOnly(AuditSource),
    Writable {
        store: SqliteOverlay,
        _lock: InstanceLock,
    },
}

impl ToolStore {
    pub fn open(db: &Path, derived_db: &Path, writable: bool) -> anyhow::Result<Self> {
        require_file(db, "metadata database")?;
        if !writable {
            let source = open_audit_source(db, Some(derived_db), &ReadOptions::default()).map_err(core_err)?;
            return Ok(Self::ReadOnly(source));
        }
        let lock = InstanceLock::acquire_with_retry(db_parent(db), &RetryPolicy::instance_lock()).map_err(core_err)?;
        let store = open_overlay(db, Some(derived_db)).map_err(core_err)?;
        Ok(Self::Writable { store, _lock: lock })
    }

    #[must_use]
    pub fn store(&self) -> &SqliteOverlay {
        match self {
            Self::ReadOnly(source) => &source.store,
            Self::Writable { store, .. } => store,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derived_db_defaults_next_to_metadata() {
        let resolved = resolve_derived_db(Path::new("/data/metadata.db"), None);
        assert_eq!(resolved, PathBuf::from("/data/derived/stage1_derived.db"));
        let explicit = resolve_derived_db(Path::new("/data/metadata.db"), Some(PathBuf::from("/x.db")));
        assert_eq!(explicit, PathBuf::from("/x.db"));
        assert_eq!(db_parent(Path::new("metadata.db")), Path::new("."));
    }

    #[test]
    fn error_json_carries_core_kind_and_hint() {
        let err = core_err(autocapture_core::lock::LockError::Held {
            pid: Some(42),
            path: "/data/.autocapture.instance.lock".to_string(),
        });
        let value = error_json(&err);
        assert_eq!(value["ok"], false);
        assert_eq!(value["kind"], "instance_lock_held");
        assert!(value["hint"].is_string());
    }

    #[test]
    fn plain_errors_use_generic_kind() {
        let value = error_json(&anyhow::anyhow!("boom"));
        assert_eq!(value["kind"], "error");
        assert!(value["hint"].is_null());
    }
}
