//! CLI argument definitions

use clap::Parser;
use std::path::PathBuf;

#[derive(Parser)]
pub struct Args {
    /// Path to the observed executable
    #[arg(short, long)]
    pub target: String,

    /// Compiled probe object to load
    #[arg(long, value_name = "OBJECT")]
    pub probes: PathBuf,

    /// Restrict probes to this running process
    #[arg(short, long)]
    pub pid: Option<i32>,

    /// Package whose functions receive per-line delay probes
    #[arg(long, default_value = "main")]
    pub package: String,

    /// Emit probe events as JSON lines instead of human-readable text
    #[arg(long)]
    pub json: bool,

    /// Seconds to observe (0 = until interrupted)
    #[arg(long, default_value = "0")]
    pub duration: u64,
}
