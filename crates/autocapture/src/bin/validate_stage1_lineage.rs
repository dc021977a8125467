//! Check every Stage1 marker against its source frame.
//!
//! Read-only. With `--strict`, any invalid marker makes the exit code 1.

use std::path::PathBuf;
use std::process::ExitCode;

use autocapture::{ToolOutput, ToolStore, core_err, init_tool_logging, resolve_derived_db, run_tool};
use autocapture_core::repair::validate_stage1_lineage;
use clap::Parser;

#[derive(Parser, Debug)]
#[command(about = "Validate Stage1 markers against their frames")]
struct Args {
    #[arg(long, value_name = "PATH")]
    db: PathBuf,

    #[arg(long, value_name = "PATH")]
    derived_db: Option<PathBuf>,

    /// Exit non-zero when any marker is invalid
    #[arg(long)]
    strict: bool,

    #[arg(long, default_value_t = 10)]
    samples: usize,

    #[arg(short, long)]
    verbose: bool,
}

fn main() -> ExitCode {
    let args = Args::parse();
    init_tool_logging(args.verbose);
    run_tool(|| {
        let derived = resolve_derived_db(&args.db, args.derived_db.clone());
        let opened = ToolStore::open(&args.db, &derived, false)?;
        let report = validate_stage1_lineage(opened.store(), args.samples).map_err(core_err)?;
        let ok = !args.strict || report.markers_invalid == 0;
        ToolOutput::verdict(&report, ok)
    })
}
