use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Configuration file path
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Transcode one or more inputs into one or more outputs
    Run {
        /// Input file, URL, or generator expression (repeatable)
        #[arg(short, long, required = true)]
        input: Vec<String>,

        /// Output destination (repeatable)
        #[arg(short, long, required = true)]
        output: Vec<String>,

        /// Options emitted before the input clauses, e.g. "-ss 30"
        #[arg(long)]
        input_options: Vec<String>,

        /// Options emitted before the output clauses, e.g. "-c:v libx264"
        #[arg(long)]
        output_options: Vec<String>,

        /// Multiplex compatible outputs through one encoding pass
        #[arg(long)]
        tee: bool,

        /// Abort when no progress arrives within this many milliseconds
        #[arg(long)]
        timeout_ms: Option<u64>,

        /// Replace existing output files (true/false)
        #[arg(long)]
        overwrite: Option<bool>,

        /// Working directory for the spawned process
        #[arg(long)]
        cwd: Option<PathBuf>,
    },

    /// Inspect a media file
    Probe {
        /// Media file to inspect
        #[arg(short, long)]
        input: PathBuf,

        /// Print the full report as JSON instead of a summary
        #[arg(long)]
        json: bool,
    },

    /// Show encoder and prober version information
    Info,

    /// Write or show the default configuration
    Config {
        /// Destination path
        #[arg(short, long, default_value = "ffpilot.toml")]
        output: PathBuf,

        /// Print the effective configuration instead of writing a file
        #[arg(long)]
        show: bool,
    },
}
