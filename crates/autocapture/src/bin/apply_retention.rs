//! One retention pass under the configured policy.
//!
//! Dry run unless `--execute`. A policy that refuses to run
//! (`no_deletion_mode`, disabled age spec) is reported, not treated as an
//! error.

use std::path::PathBuf;
use std::process::ExitCode;

use autocapture::{ToolOutput, ToolStore, core_err, init_tool_logging, load_config, run_tool};
use autocapture_core::journal;
use autocapture_core::media::FsMediaStore;
use autocapture_core::retention::apply_retention;
use chrono::Utc;
use clap::Parser;
use serde_json::json;

#[derive(Parser, Debug)]
#[command(about = "Delete media for old, fully processed evidence")]
struct Args {
    /// TOML configuration file
    #[arg(long, value_name = "FILE")]
    config: PathBuf,

    /// Actually delete; without this flag only candidates are reported
    #[arg(long)]
    execute: bool,

    #[arg(short, long)]
    verbose: bool,
}

fn main() -> ExitCode {
    let args = Args::parse();
    init_tool_logging(args.verbose);
    run_tool(|| {
        let config = load_config(&args.config)?;
        let metadata = config.metadata_db_path();
        let derived = config
            .derived_db_path()
            .unwrap_or_else(|| metadata.clone());
        let opened = ToolStore::open(&metadata, &derived, args.execute)?;
        let media = FsMediaStore::new(config.media_root());
        let journal = journal::journal_path(&config.data_dir());
        let dry_run = !args.execute;
        let result = apply_retention(
            opened.store(),
            &media,
            &config.storage.retention,
            dry_run,
            Utc::now(),
            Some(&journal),
        )
        .map_err(core_err)?;
        let ran = result.is_some();
        ToolOutput::ok(&json!({
            "dry_run": dry_run,
            "ran": ran,
            "no_deletion_mode": config.storage.retention.no_deletion_mode,
            "result": result,
        }))
    })
}
