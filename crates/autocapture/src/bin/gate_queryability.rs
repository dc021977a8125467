//! Pass/fail queryability gate.
//!
//! Evaluates either a fresh audit of `--db` or a saved audit report
//! (`--audit`). With `--timeout-s`, a full audit that runs too long is
//! abandoned in favour of the SQL estimate, and the verdict says so.
//!
//! Exit code 0 when the gate passes, 1 when it fails, 2 on error.

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use anyhow::Context;
use autocapture::{ToolOutput, core_err, init_tool_logging, require_file, resolve_derived_db, run_tool, write_output_file};
use autocapture_core::audit::{AuditOptions, AuditSummary, estimate_from_paths, run_audit};
use autocapture_core::gate::{DEFAULT_MIN_QUERYABLE_RATIO, evaluate};
use autocapture_core::resilient::ReadOptions;
use clap::Parser;
use tracing::warn;

#[derive(Parser, Debug)]
#[command(about = "Fail closed unless processed frames are queryable")]
struct Args {
    /// Metadata database to audit
    #[arg(long, value_name = "PATH", required_unless_present = "audit")]
    db: Option<PathBuf>,

    /// Derived marker database (default: <db dir>/derived/stage1_derived.db)
    #[arg(long, value_name = "PATH")]
    derived_db: Option<PathBuf>,

    /// Saved audit report to evaluate instead of auditing
    #[arg(long, value_name = "FILE", conflicts_with = "db")]
    audit: Option<PathBuf>,

    #[arg(long, default_value_t = DEFAULT_MIN_QUERYABLE_RATIO)]
    min_queryable_ratio: f64,

    /// Wall-clock budget for the full audit before falling back to an estimate
    #[arg(long)]
    timeout_s: Option<f64>,

    /// Also write the verdict here
    #[arg(long, value_name = "FILE")]
    output: Option<PathBuf>,

    #[arg(short, long)]
    verbose: bool,
}

fn summary_from_file(path: &Path) -> anyhow::Result<AuditSummary> {
    let raw = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_slice(&raw).with_context(|| format!("parsing audit report {}", path.display()))
}

fn audit_with_budget(db: &Path, derived: &Path, timeout_s: Option<f64>) -> anyhow::Result<AuditSummary> {
    let Some(budget) = timeout_s.filter(|s| s.is_finite() && *s > 0.0) else {
        let options = AuditOptions {
            samples: 0,
            ..AuditOptions::default()
        };
        return Ok(run_audit(db, Some(derived), &options).map_err(core_err)?.summary);
    };

    let (tx, rx) = mpsc::channel();
    let (db_owned, derived_owned) = (db.to_path_buf(), derived.to_path_buf());
    thread::spawn(move || {
        let options = AuditOptions {
            samples: 0,
            ..AuditOptions::default()
        };
        let _ = tx.send(run_audit(&db_owned, Some(&derived_owned), &options));
    });
    match rx.recv_timeout(Duration::from_secs_f64(budget)) {
        Ok(result) => Ok(result.map_err(core_err)?.summary),
        Err(_) => {
            warn!(db = %db.display(), budget, "Audit exceeded its budget, using estimate");
            estimate_from_paths(db, Some(derived), &ReadOptions::default()).map_err(core_err)
        }
    }
}

fn main() -> ExitCode {
    let args = Args::parse();
    init_tool_logging(args.verbose);
    run_tool(|| {
        let summary = match (&args.audit, &args.db) {
            (Some(path), _) => summary_from_file(path)?,
            (None, Some(db)) => {
                require_file(db, "metadata database")?;
                let derived = resolve_derived_db(db, args.derived_db.clone());
                audit_with_budget(db, &derived, args.timeout_s)?
            }
            (None, None) => anyhow::bail!("either --db or --audit is required"),
        };
        let verdict = evaluate(&summary, args.min_queryable_ratio);
        let output = ToolOutput::verdict(&verdict, verdict.ok)?;
        if let Some(path) = &args.output {
            write_output_file(path, &output.value)?;
        }
        Ok(output)
    })
}
