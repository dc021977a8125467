//! Merge handoff batches into a data root.
//!
//! Usage:
//!   ingest_handoff --dataroot /data --handoff-dir /spool/host-a-20260301
//!   ingest_handoff --dataroot /data --spool-dir /spool [--include-marked] [--fail-fast]

use std::path::PathBuf;
use std::process::ExitCode;

use autocapture::{ToolOutput, core_err, init_tool_logging, run_tool};
use autocapture_core::config::{HandoffMode, default_derived_db_path};
use autocapture_core::handoff::{DrainOptions, HandoffOptions, drain_spool, ingest_handoff_dir};
use clap::{ArgGroup, Parser};

#[derive(Parser, Debug)]
#[command(about = "Ingest a handoff directory or drain a spool of them")]
#[command(group(ArgGroup::new("source").required(true).args(["handoff_dir", "spool_dir"])))]
struct Args {
    /// Destination data root
    #[arg(long, value_name = "DIR")]
    dataroot: PathBuf,

    /// One handoff directory
    #[arg(long, value_name = "DIR")]
    handoff_dir: Option<PathBuf>,

    /// Directory whose subdirectories are handoff batches
    #[arg(long, value_name = "DIR")]
    spool_dir: Option<PathBuf>,

    /// Derived marker database (default: <dataroot>/derived/stage1_derived.db)
    #[arg(long, value_name = "PATH")]
    derived_db: Option<PathBuf>,

    /// copy or hardlink
    #[arg(long, default_value_t = HandoffMode::Copy)]
    mode: HandoffMode,

    /// Ingest rows even when referenced media is missing
    #[arg(long)]
    no_strict: bool,

    /// Re-ingest directories already marked as drained
    #[arg(long)]
    include_marked: bool,

    /// Stop at the first failing directory
    #[arg(long)]
    fail_fast: bool,

    #[arg(short, long)]
    verbose: bool,
}

fn main() -> ExitCode {
    let args = Args::parse();
    init_tool_logging(args.verbose);
    run_tool(|| {
        let handoff = HandoffOptions {
            mode: args.mode,
            strict: !args.no_strict,
            derived_db: Some(
                args.derived_db
                    .clone()
                    .unwrap_or_else(|| default_derived_db_path(&args.dataroot)),
            ),
            ..HandoffOptions::default()
        };
        if let Some(dir) = &args.handoff_dir {
            let result = ingest_handoff_dir(dir, &args.dataroot, &handoff).map_err(core_err)?;
            return ToolOutput::ok(&result);
        }
        let Some(spool) = &args.spool_dir else {
            anyhow::bail!("either --handoff-dir or --spool-dir is required");
        };
        let options = DrainOptions {
            handoff,
            include_marked: args.include_marked,
            fail_fast: args.fail_fast,
        };
        let result = drain_spool(spool, &args.dataroot, &options).map_err(core_err)?;
        let ok = result.failed == 0;
        ToolOutput::verdict(&result, ok)
    })
}
