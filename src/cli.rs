//! CLI argument definitions using clap derive macros.

use std::path::PathBuf;

use clap::Parser;

/// Keep denylists current from an update server.
///
/// Polls the configured update server, follows chunk redirects, and falls
/// back to backup endpoints when the primary fails.
#[derive(Parser, Debug)]
#[command(name = "listupdate")]
#[command(author, version, about)]
pub struct Args {
    /// Path to the TOML config file
    #[arg(short, long, value_name = "FILE")]
    pub config: PathBuf,

    /// Run a single update immediately and exit (non-zero on failure)
    #[arg(long)]
    pub once: bool,

    /// Extra query appended to every request URL (overrides the config file)
    #[arg(long, value_name = "QUERY")]
    pub additional_query: Option<String>,

    /// Increase output verbosity (-v for debug, -vv for trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Suppress non-error output
    #[arg(short, long)]
    pub quiet: bool,
}
