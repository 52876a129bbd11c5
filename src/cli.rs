//! CLI argument definitions

use clap::Parser;
use std::path::PathBuf;

/// miunlock - minute-aligned bootloader unlock authorization watcher
#[derive(Parser, Debug)]
#[command(
    name = "miunlock",
    about = "Polls the Mi community API for a bootloader unlock grant, synchronized to network time",
    version
)]
pub struct Cli {
    /// Path to config file
    #[arg(short, long, help = "Path to config file")]
    pub config: Option<PathBuf>,

    /// Account username (prompted when omitted)
    #[arg(short, long)]
    pub user: Option<String>,

    /// Enable verbose output
    #[arg(short, long, help = "Enable verbose output")]
    pub verbose: bool,
}
