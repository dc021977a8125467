//! Configuration management for autocapture
//!
//! Handles loading and validation of `autocapture.toml` files. Every section
//! carries `#[serde(default)]`, so a partial file only overrides the keys it
//! names. Defaults are chosen to be the safe side of every destructive knob:
//! retention runs with `no_deletion_mode = true` and handoff ingest is strict.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::retention::parse_retention_spec;

/// Main configuration structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub processing: ProcessingConfig,
}

/// Log output format
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable output
    #[default]
    Pretty,
    /// One JSON object per line
    Json,
}

impl fmt::Display for LogFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pretty => write!(f, "pretty"),
            Self::Json => write!(f, "json"),
        }
    }
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            _ => Err(format!("unknown log format: {s}. Expected pretty or json")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// trace, debug, info, warn, error. `RUST_LOG` takes precedence.
    pub level: String,
    pub format: LogFormat,
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Pretty,
            file: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Data root holding `metadata.db`, `media/` and `derived/`
    pub data_dir: String,
    /// Directory whose subdirectories are handoff batches
    pub spool_dir: Option<String>,
    pub retention: RetentionConfig,
    pub stage1_derived: Stage1DerivedConfig,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            spool_dir: None,
            retention: RetentionConfig::default(),
            stage1_derived: Stage1DerivedConfig::default(),
        }
    }
}

fn default_data_dir() -> String {
    "~/.local/share/autocapture".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionConfig {
    /// Age spec: `<int><unit>` with unit d/h/m/s, or 0/infinite/off/none/disabled
    pub evidence: String,
    pub max_delete_per_run: usize,
    /// Minimum seconds between retention runs in the idle pass
    pub interval_s: u64,
    /// Kill switch. While set, retention never deletes anything.
    pub no_deletion_mode: bool,
    /// Only delete media whose retention marker is validated and not quarantined
    pub processed_only: bool,
    /// Only delete capture frames, never other evidence types
    pub images_only: bool,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            evidence: "30d".to_string(),
            max_delete_per_run: 500,
            interval_s: 3600,
            no_deletion_mode: true,
            processed_only: true,
            images_only: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Stage1DerivedConfig {
    /// Write derived markers to a separate database file
    pub enabled: bool,
    pub db_path: Option<String>,
}

impl Default for Stage1DerivedConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            db_path: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessingConfig {
    pub idle: IdleConfig,
    pub uia_observation: UiaObservationConfig,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct IdleConfig {
    pub handoff_ingest: HandoffIngestConfig,
    pub repair: IdleRepairConfig,
}

/// How handoff media is placed into the destination tree
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HandoffMode {
    #[default]
    Copy,
    /// Hard-link, falling back to copy when linking fails
    Hardlink,
}

impl fmt::Display for HandoffMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Copy => write!(f, "copy"),
            Self::Hardlink => write!(f, "hardlink"),
        }
    }
}

impl FromStr for HandoffMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "copy" => Ok(Self::Copy),
            "hardlink" | "link" => Ok(Self::Hardlink),
            _ => Err(format!("unknown handoff mode: {s}. Expected copy or hardlink")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HandoffIngestConfig {
    pub enabled: bool,
    pub mode: HandoffMode,
    /// Abort a batch that references missing media
    pub strict: bool,
    /// Re-ingest directories that already carry a reap marker
    pub include_marked: bool,
    /// Stop draining at the first failing directory
    pub fail_fast: bool,
}

impl Default for HandoffIngestConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            mode: HandoffMode::Copy,
            strict: true,
            include_marked: false,
            fail_fast: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IdleRepairConfig {
    pub enabled: bool,
    /// Frames examined per idle pass
    pub limit: usize,
}

impl Default for IdleRepairConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            limit: 200,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UiaObservationConfig {
    /// Consult `uia/latest.snap.json` when the snapshot record is absent
    pub fallback_enabled: bool,
    /// Fallback snapshot must carry the frame's `uia_ref.content_hash`
    pub require_hash_match: bool,
    pub max_focus_nodes: usize,
    pub max_context_nodes: usize,
    pub max_operable_nodes: usize,
}

impl Default for UiaObservationConfig {
    fn default() -> Self {
        Self {
            fallback_enabled: true,
            require_hash_match: true,
            max_focus_nodes: 64,
            max_context_nodes: 96,
            max_operable_nodes: 128,
        }
    }
}

/// Expand a leading `~` to the home directory.
#[must_use]
pub fn expand_tilde(raw: &str) -> PathBuf {
    if raw == "~" {
        if let Some(home) = dirs::home_dir() {
            return home;
        }
    } else if let Some(rest) = raw.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(rest);
        }
    }
    PathBuf::from(raw)
}

impl Config {
    /// Load configuration from a specific path
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.display().to_string()));
        }
        let raw = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadFailed(path.display().to_string(), e.to_string()))?;
        Self::from_toml_str(&raw)
    }

    /// Parse and validate a TOML document
    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        let config: Self =
            toml::from_str(raw).map_err(|e| ConfigError::ParseFailed(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let evidence = &self.storage.retention.evidence;
        if parse_retention_spec(evidence).is_none() {
            return Err(ConfigError::ValidationError(format!(
                "storage.retention.evidence: cannot parse retention spec {evidence:?}"
            )));
        }
        if self.storage.data_dir.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "storage.data_dir must not be empty".to_string(),
            ));
        }
        if self.logging.level.parse::<crate::logging::LogLevel>().is_err() {
            return Err(ConfigError::ValidationError(format!(
                "logging.level: unknown level {:?}",
                self.logging.level
            )));
        }
        Ok(())
    }

    #[must_use]
    pub fn data_dir(&self) -> PathBuf {
        expand_tilde(&self.storage.data_dir)
    }

    #[must_use]
    pub fn spool_dir(&self) -> Option<PathBuf> {
        self.storage.spool_dir.as_deref().map(expand_tilde)
    }

    #[must_use]
    pub fn metadata_db_path(&self) -> PathBuf {
        self.data_dir().join("metadata.db")
    }

    /// Derived marker database. `None` when derived isolation is disabled and
    /// markers go to the metadata database itself.
    #[must_use]
    pub fn derived_db_path(&self) -> Option<PathBuf> {
        let derived = &self.storage.stage1_derived;
        if !derived.enabled {
            return None;
        }
        Some(derived.db_path.as_deref().map_or_else(
            || default_derived_db_path(&self.data_dir()),
            expand_tilde,
        ))
    }

    #[must_use]
    pub fn media_root(&self) -> PathBuf {
        self.data_dir()
    }
}

/// `<data_dir>/derived/stage1_derived.db`
#[must_use]
pub fn default_derived_db_path(data_dir: &Path) -> PathBuf {
    data_dir.join("derived").join("stage1_derived.db")
}
