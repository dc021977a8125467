//! Read-only lineage audit of a metadata database and its derived database.
//!
//! Usage:
//!   stage1_completeness_audit --db /data/metadata.db [--derived-db PATH]
//!       [--gap-seconds 120] [--samples 10] [--frame-limit N] [--output FILE]

use std::path::PathBuf;
use std::process::ExitCode;

use autocapture::{ToolOutput, core_err, init_tool_logging, require_file, resolve_derived_db, run_tool, write_output_file};
use autocapture_core::audit::{AuditOptions, DEFAULT_GAP_SECONDS, DEFAULT_SAMPLES, run_audit};
use clap::Parser;

#[derive(Parser, Debug)]
#[command(about = "Audit Stage1, retention and observation lineage for every frame")]
struct Args {
    /// Metadata database
    #[arg(long, value_name = "PATH")]
    db: PathBuf,

    /// Derived marker database (default: <db dir>/derived/stage1_derived.db)
    #[arg(long, value_name = "PATH")]
    derived_db: Option<PathBuf>,

    /// Largest gap between queryable frames inside one window
    #[arg(long, default_value_t = DEFAULT_GAP_SECONDS)]
    gap_seconds: i64,

    /// Non-queryable frames to include in the report
    #[arg(long, default_value_t = DEFAULT_SAMPLES)]
    samples: usize,

    /// Audit only the newest N frames
    #[arg(long)]
    frame_limit: Option<usize>,

    /// Also write the full report here
    #[arg(long, value_name = "FILE")]
    output: Option<PathBuf>,

    #[arg(short, long)]
    verbose: bool,
}

fn main() -> ExitCode {
    let args = Args::parse();
    init_tool_logging(args.verbose);
    run_tool(|| {
        require_file(&args.db, "metadata database")?;
        let derived = resolve_derived_db(&args.db, args.derived_db.clone());
        let options = AuditOptions {
            gap_seconds: args.gap_seconds,
            samples: args.samples,
            frame_limit: args.frame_limit,
            ..AuditOptions::default()
        };
        let report = run_audit(&args.db, Some(&derived), &options).map_err(core_err)?;
        let output = ToolOutput::ok(&report)?;
        if let Some(path) = &args.output {
            write_output_file(path, &output.value)?;
        }
        Ok(output)
    })
}
