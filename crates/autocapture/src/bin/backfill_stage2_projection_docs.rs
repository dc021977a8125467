//! Stage2 projection for frames that have no Stage2 marker yet.
//!
//! `--wait-stable-seconds` waits for the metadata database to stop changing
//! before anything is written.

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use autocapture::{ToolOutput, ToolStore, core_err, init_tool_logging, require_file, resolve_derived_db, run_tool};
use autocapture_core::repair::{backfill_stage2, wait_for_stable};
use clap::Parser;

#[derive(Parser, Debug)]
#[command(about = "Backfill Stage2 projection documents and screen states")]
struct Args {
    #[arg(long, value_name = "PATH")]
    db: PathBuf,

    #[arg(long, value_name = "PATH")]
    derived_db: Option<PathBuf>,

    #[arg(long)]
    dry_run: bool,

    /// Frames to project
    #[arg(long, default_value_t = 1000)]
    limit: usize,

    /// Require the database file to be unchanged for this long first
    #[arg(long)]
    wait_stable_seconds: Option<u64>,

    /// Give up waiting for stability after this long
    #[arg(long, default_value_t = 600)]
    wait_timeout_seconds: u64,

    #[arg(short, long)]
    verbose: bool,
}

fn main() -> ExitCode {
    let args = Args::parse();
    init_tool_logging(args.verbose);
    run_tool(|| {
        require_file(&args.db, "metadata database")?;
        if let Some(seconds) = args.wait_stable_seconds {
            let stable = wait_for_stable(
                &args.db,
                Duration::from_secs(seconds),
                Duration::from_secs(args.wait_timeout_seconds),
            );
            if !stable {
                anyhow::bail!(
                    "{} kept changing for {}s; retry when capture is idle",
                    args.db.display(),
                    args.wait_timeout_seconds
                );
            }
        }
        let derived = resolve_derived_db(&args.db, args.derived_db.clone());
        let opened = ToolStore::open(&args.db, &derived, !args.dry_run)?;
        let result = backfill_stage2(opened.store(), args.dry_run, args.limit).map_err(core_err)?;
        let ok = result.errors.is_empty();
        ToolOutput::verdict(&result, ok)
    })
}
