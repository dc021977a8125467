//! autocapture-core: completion and consistency engine for captured screen
//! evidence.
//!
//! Capture hosts write raw evidence (frames, UI-automation snapshots, input
//! batches) into a SQLite `metadata.db`. This crate turns that raw evidence
//! into a queryable corpus and keeps it honest:
//!
//! ```text
//! metadata.db ──► Stage1 marker ──► UIA observation docs ──► Stage2 projection
//!      │                                     │
//!      └────────── lineage auditor ◄─────────┴──► retention marker ──► retention
//!                        │
//!                        ▼
//!               queryability gate
//! ```
//!
//! # Modules
//!
//! - `hashing`: record ids, canonical JSON, payload hashes
//! - `record`: typed views over stored payloads
//! - `store`: record storage (SQLite, in-memory, overlay)
//! - `resilient`: read-only opens that survive concurrent writers
//! - `lock`: single-writer instance lock
//! - `stage1`, `uia`, `stage2`, `retention`: per-frame completion stages
//! - `pipeline`: drives a frame through every stage
//! - `lineage`, `audit`, `gate`: lineage predicates, audits, pass/fail verdict
//! - `repair`: offline backfill and marker revalidation
//! - `handoff`: merging another host's capture batch
//! - `idle`: periodic maintenance pass
//! - `config`, `logging`, `journal`, `media`, `retry`, `error`: support
//!
//! # Safety
//!
//! This crate forbids unsafe code.

#![forbid(unsafe_code)]

pub mod audit;
pub mod config;
pub mod error;
pub mod gate;
pub mod handoff;
pub mod hashing;
pub mod idle;
pub mod journal;
pub mod lineage;
pub mod lock;
pub mod logging;
pub mod media;
pub mod pipeline;
pub mod record;
pub mod repair;
pub mod resilient;
pub mod retention;
pub mod retry;
pub mod stage1;
pub mod stage2;
pub mod store;
pub mod uia;

pub use error::{Error, Result, StoreError};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
