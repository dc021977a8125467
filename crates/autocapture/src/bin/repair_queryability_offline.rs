//! Offline queryability repair: audit, backfill, revalidate, audit again.
//!
//! Reads normalized records only and never touches capture media. Exits 1
//! when the gate still fails after the repair.

use std::path::PathBuf;
use std::process::ExitCode;

use autocapture::{ToolOutput, ToolStore, core_err, db_parent, init_tool_logging, resolve_derived_db, run_tool};
use autocapture_core::config::UiaObservationConfig;
use autocapture_core::gate::DEFAULT_MIN_QUERYABLE_RATIO;
use autocapture_core::pipeline::PipelineContext;
use autocapture_core::repair::repair_queryability;
use clap::Parser;

#[derive(Parser, Debug)]
#[command(about = "Backfill missing lineage and revalidate markers without capture media")]
struct Args {
    #[arg(long, value_name = "PATH")]
    db: PathBuf,

    #[arg(long, value_name = "PATH")]
    derived_db: Option<PathBuf>,

    /// Data root holding the fallback UIA snapshot (default: <db dir>)
    #[arg(long, value_name = "DIR")]
    dataroot: Option<PathBuf>,

    #[arg(long, default_value_t = DEFAULT_MIN_QUERYABLE_RATIO)]
    min_queryable_ratio: f64,

    #[arg(long)]
    dry_run: bool,

    /// Frames to backfill
    #[arg(long, default_value_t = 10_000)]
    limit: usize,

    #[arg(short, long)]
    verbose: bool,
}

fn main() -> ExitCode {
    let args = Args::parse();
    init_tool_logging(args.verbose);
    run_tool(|| {
        let derived = resolve_derived_db(&args.db, args.derived_db.clone());
        let data_root = args.dataroot.clone().unwrap_or_else(|| db_parent(&args.db).to_path_buf());
        let opened = ToolStore::open(&args.db, &derived, !args.dry_run)?;
        let uia = UiaObservationConfig::default();
        let ctx = PipelineContext {
            store: opened.store(),
            data_root: Some(&data_root),
            uia: &uia,
        };
        let report = repair_queryability(&ctx, args.min_queryable_ratio, args.dry_run, args.limit).map_err(core_err)?;
        let ok = report.gate.ok;
        ToolOutput::verdict(&report, ok)
    })
}
