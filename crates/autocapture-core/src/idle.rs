//! Idle-time maintenance pass.
//!
//! One pass, in order: drain the handoff spool, backfill a bounded number of
//! frames, then run retention if its interval has elapsed. Each step is
//! independent; a failing step is recorded in the report and the pass moves
//! on.
//!
//! The backfill and retention steps write, so each holds the instance lock
//! for its duration. A step that finds the lock held is reported in
//! `skipped` and retried on the next pass. The drain step locks per handoff
//! directory inside [`drain_spool`].

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, warn};

use crate::config::Config;
use crate::handoff::{DrainOptions, DrainResult, HandoffOptions, drain_spool};
use crate::journal;
use crate::lock::InstanceLock;
use crate::media::FsMediaStore;
use crate::pipeline::PipelineContext;
use crate::repair::{self, BackfillResult};
use crate::retention::{self, RetentionResult};
use crate::retry::RetryPolicy;
use crate::store::open_overlay;

/// State carried between passes.
#[derive(Debug, Clone, Default)]
pub struct IdleState {
    pub last_retention: Option<DateTime<Utc>>,
    pub last_drain: Option<DrainResult>,
    pub passes: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IdleReport {
    pub drain: Option<DrainResult>,
    pub repair: Option<BackfillResult>,
    pub retention_due: bool,
    pub retention: Option<RetentionResult>,
    /// Steps not run because another writer held the instance lock
    pub skipped: Vec<String>,
    pub errors: Vec<String>,
}

pub struct IdleWorker {
    config: Config,
    state: IdleState,
    lock_policy: RetryPolicy,
}

impl IdleWorker {
    #[must_use]
    pub fn new(config: Config) -> Self {
        Self {
            config,
            state: IdleState::default(),
            lock_policy: RetryPolicy::instance_lock(),
        }
    }

    #[must_use]
    pub fn with_lock_policy(mut self, policy: RetryPolicy) -> Self {
        self.lock_policy = policy;
        self
    }

    #[must_use]
    pub fn state(&self) -> &IdleState {
        &self.state
    }

    fn drain_options(&self) -> DrainOptions {
        let handoff = &self.config.processing.idle.handoff_ingest;
        DrainOptions {
            handoff: HandoffOptions {
                mode: handoff.mode,
                strict: handoff.strict,
                derived_db: self.config.derived_db_path(),
                uia: self.config.processing.uia_observation.clone(),
                ..HandoffOptions::default()
            },
            include_marked: handoff.include_marked,
            fail_fast: handoff.fail_fast,
        }
    }

    fn lock_for(&self, step: &str, report: &mut IdleReport) -> Option<InstanceLock> {
        match InstanceLock::acquire_with_retry(&self.config.data_dir(), &self.lock_policy) {
            Ok(lock) => Some(lock),
            Err(e) if e.is_held() => {
                info!(step, error = %e, "Idle step skipped, instance lock held");
                report.skipped.push(step.to_string());
                None
            }
            Err(e) => {
                warn!(step, error = %e, "Idle step could not take the instance lock");
                report.errors.push(format!("{step}: {e}"));
                None
            }
        }
    }

    fn drain(&mut self, report: &mut IdleReport) {
        if !self.config.processing.idle.handoff_ingest.enabled {
            return;
        }
        let Some(spool) = self.config.spool_dir().filter(|p| p.is_dir()) else {
            return;
        };
        match drain_spool(&spool, &self.config.data_dir(), &self.drain_options()) {
            Ok(result) => {
                self.state.last_drain = Some(result.clone());
                report.drain = Some(result);
            }
            Err(e) => {
                warn!(error = %e, "Handoff drain failed");
                report.errors.push(format!("drain: {e}"));
            }
        }
    }

    fn repair(&self, report: &mut IdleReport) {
        let repair = &self.config.processing.idle.repair;
        let metadata = self.config.metadata_db_path();
        if !repair.enabled || !metadata.is_file() {
            return;
        }
        let Some(_lock) = self.lock_for("repair", report) else {
            return;
        };
        let derived = self.config.derived_db_path();
        let result = open_overlay(&metadata, derived.as_deref()).and_then(|store| {
            let data_root = self.config.data_dir();
            let ctx = PipelineContext {
                store: &store,
                data_root: Some(&data_root),
                uia: &self.config.processing.uia_observation,
            };
            repair::backfill_frames(&ctx, false, repair.limit)
        });
        match result {
            Ok(backfill) => report.repair = Some(backfill),
            Err(e) => {
                warn!(error = %e, "Idle backfill failed");
                report.errors.push(format!("repair: {e}"));
            }
        }
    }

    fn retention(&mut self, report: &mut IdleReport, now: DateTime<Utc>) {
        let config = &self.config.storage.retention;
        let metadata = self.config.metadata_db_path();
        report.retention_due = retention::is_due(self.state.last_retention, now, config.interval_s);
        if !report.retention_due || !metadata.is_file() {
            return;
        }
        let Some(_lock) = self.lock_for("retention", report) else {
            return;
        };
        let data_dir = self.config.data_dir();
        let media = FsMediaStore::new(self.config.media_root());
        let journal = journal::journal_path(&data_dir);
        let derived = self.config.derived_db_path();
        let result = open_overlay(&metadata, derived.as_deref())
            .and_then(|store| retention::apply_retention(&store, &media, config, false, now, Some(&journal)));
        match result {
            Ok(outcome) => {
                self.state.last_retention = Some(now);
                report.retention = outcome;
            }
            Err(e) => {
                warn!(error = %e, "Idle retention failed");
                report.errors.push(format!("retention: {e}"));
            }
        }
    }

    /// Run one pass at `now`.
    pub fn run_once(&mut self, now: DateTime<Utc>) -> IdleReport {
        let mut report = IdleReport::default();
        self.drain(&mut report);
        self.repair(&mut report);
        self.retention(&mut report, now);
        self.state.passes += 1;
        info!(
            pass = self.state.passes,
            drained = report.drain.as_ref().map_or(0, |d| d.processed),
            repaired = report.repair.as_ref().map_or(0, |r| r.frames_processed),
            retention_ran = report.retention.is_some(),
            errors = report.errors.len(),
            "Idle pass"
        );
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::parse_ts;
    use crate::store::{RecordStore, SqliteStore};
    use tempfile::TempDir;

    fn config_for(dir: &TempDir) -> Config {
        let mut config = Config::default();
        config.storage.data_dir = dir.path().display().to_string();
        config
    }

    #[test]
    fn empty_data_root_is_a_quiet_pass() {
        let dir = TempDir::new().unwrap();
        let mut worker = IdleWorker::new(config_for(&dir));
        let report = worker.run_once(parse_ts("2026-01-01T00:00:00Z").unwrap());
        assert!(report.errors.is_empty());
        assert!(report.drain.is_none());
        assert!(report.repair.is_none());
        assert!(report.retention_due);
        assert_eq!(worker.state().passes, 1);
    }

    #[test]
    fn retention_respects_interval() {
        let dir = TempDir::new().unwrap();
        let mut config = config_for(&dir);
        config.storage.retention.interval_s = 3600;
        let store = SqliteStore::open(&config.metadata_db_path()).unwrap();
        drop(store);
        let mut worker = IdleWorker::new(config);

        let t0 = parse_ts("2026-01-01T00:00:00Z").unwrap();
        let first = worker.run_once(t0);
        assert!(first.retention_due);
        // no_deletion_mode is the default, so the policy refuses to run.
        assert!(first.retention.is_none());
        assert_eq!(worker.state().last_retention, Some(t0));

        let second = worker.run_once(parse_ts("2026-01-01T00:10:00Z").unwrap());
        assert!(!second.retention_due);
        let third = worker.run_once(parse_ts("2026-01-01T01:00:00Z").unwrap());
        assert!(third.retention_due);
    }

    #[test]
    fn repair_runs_against_existing_database() {
        let dir = TempDir::new().unwrap();
        let config = config_for(&dir);
        let store = SqliteStore::open(&config.metadata_db_path()).unwrap();
        store
            .put(
                "run1/evidence.capture.frame/1",
                &serde_json::to_value(crate::stage1::tests::complete_frame()).unwrap(),
            )
            .unwrap();
        drop(store);
        let mut worker = IdleWorker::new(config);
        let report = worker.run_once(parse_ts("2026-01-01T00:00:00Z").unwrap());
        let repair = report.repair.unwrap();
        assert_eq!(repair.frames_scanned, 1);
        assert_eq!(repair.stage1_markers_inserted, 1);
    }

    #[test]
    fn held_lock_skips_writing_steps() {
        let dir = TempDir::new().unwrap();
        let mut config = config_for(&dir);
        config.storage.stage1_derived.enabled = false;
        let frame_id = "run1/evidence.capture.frame/1";
        let store = SqliteStore::open(&config.metadata_db_path()).unwrap();
        store
            .put(frame_id, &serde_json::to_value(crate::stage1::tests::complete_frame()).unwrap())
            .unwrap();
        drop(store);

        let held = InstanceLock::try_acquire(dir.path()).unwrap();
        let mut worker = IdleWorker::new(config.clone()).with_lock_policy(RetryPolicy::immediate(1));
        let report = worker.run_once(parse_ts("2026-01-01T00:00:00Z").unwrap());
        assert!(report.errors.is_empty(), "{:?}", report.errors);
        assert!(report.repair.is_none());
        assert_eq!(report.skipped, vec!["repair".to_string(), "retention".to_string()]);
        assert_eq!(worker.state().last_retention, None);
        let store = SqliteStore::open(&config.metadata_db_path()).unwrap();
        assert!(!store.contains(&crate::stage1::marker_id(frame_id)).unwrap());
        drop(store);

        drop(held);
        let report = worker.run_once(parse_ts("2026-01-01T00:05:00Z").unwrap());
        assert!(report.skipped.is_empty());
        assert_eq!(report.repair.unwrap().stage1_markers_inserted, 1);
    }
}
