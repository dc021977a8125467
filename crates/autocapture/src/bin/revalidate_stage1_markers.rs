//! Re-derive `stage1_contract_validated` on every frame retention marker and
//! quarantine or upgrade markers whose stored state is stale.

use std::path::PathBuf;
use std::process::ExitCode;

use autocapture::{ToolOutput, ToolStore, core_err, init_tool_logging, resolve_derived_db, run_tool};
use autocapture_core::repair::revalidate_markers;
use clap::Parser;

#[derive(Parser, Debug)]
#[command(about = "Revalidate retention markers against current Stage1 evidence")]
struct Args {
    #[arg(long, value_name = "PATH")]
    db: PathBuf,

    #[arg(long, value_name = "PATH")]
    derived_db: Option<PathBuf>,

    /// Report what would change without writing
    #[arg(long)]
    dry_run: bool,

    /// Markers to examine
    #[arg(long, default_value_t = usize::MAX, hide_default_value = true)]
    limit: usize,

    #[arg(short, long)]
    verbose: bool,
}

fn main() -> ExitCode {
    let args = Args::parse();
    init_tool_logging(args.verbose);
    run_tool(|| {
        let derived = resolve_derived_db(&args.db, args.derived_db.clone());
        let opened = ToolStore::open(&args.db, &derived, !args.dry_run)?;
        let result = revalidate_markers(opened.store(), args.dry_run, args.limit).map_err(core_err)?;
        ToolOutput::ok(&result)
    })
}
