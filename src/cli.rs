//! CLI definitions

use clap::Parser;
use std::path::PathBuf;

/// Luigi - multi-agent coding orchestrator
#[derive(Parser, Debug)]
#[command(
    name = "luigi",
    about = "Drives planner, executor, and reviewer agents over a repository until a change is approved",
    version
)]
pub struct Cli {
    /// Task description, or `.` to ask through the UI/terminal first
    #[arg(value_name = "TASK")]
    pub task: Option<String>,

    /// Target repository
    #[arg(long, default_value = ".")]
    pub repo: PathBuf,

    /// Path to config file
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Resume a persisted run instead of starting a new one
    #[arg(long, value_name = "ID")]
    pub resume_run_id: Option<String>,

    /// Enable verbose output
    #[arg(short, long)]
    pub verbose: bool,
}

/// Exit code for configuration errors
pub const EXIT_CONFIG: i32 = 2;
