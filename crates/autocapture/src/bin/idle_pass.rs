//! Run one idle maintenance pass: drain handoffs, backfill lineage, and run
//! retention when due.

use std::path::PathBuf;
use std::process::ExitCode;

use autocapture::{ToolOutput, init_tool_logging, load_config, run_tool};
use autocapture_core::idle::IdleWorker;
use chrono::Utc;
use clap::Parser;

#[derive(Parser, Debug)]
#[command(about = "One idle-time maintenance pass")]
struct Args {
    /// TOML configuration file
    #[arg(long, value_name = "FILE")]
    config: PathBuf,

    #[arg(short, long)]
    verbose: bool,
}

fn main() -> ExitCode {
    let args = Args::parse();
    init_tool_logging(args.verbose);
    run_tool(|| {
        let config = load_config(&args.config)?;
        let mut worker = IdleWorker::new(config);
        let report = worker.run_once(Utc::now());
        let ok = report.errors.is_empty();
        ToolOutput::verdict(&report, ok)
    })
}
