use analysis_daemon::WorkerKind;
use clap::{Parser as ClapParser, Subcommand};
use std::path::PathBuf;

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start workers (all kinds when none are given), the database driver first
    Start {
        /// Worker kinds: database-driver, file-watcher, indexing, vectorization
        kinds: Vec<WorkerKind>,
    },

    /// Stop workers (all kinds when none are given), the database driver last
    Stop {
        kinds: Vec<WorkerKind>,

        /// Seconds to wait after SIGTERM before escalating to SIGKILL
        #[arg(long)]
        timeout: Option<u64>,
    },

    /// Stop and start workers again with the current configuration
    Restart {
        kinds: Vec<WorkerKind>,

        /// Seconds to wait after SIGTERM before escalating to SIGKILL
        #[arg(long)]
        timeout: Option<u64>,
    },

    /// Show PID files, liveness and driver queue state
    Status {
        /// Output format
        #[arg(short = 'o', long = "format", default_value = "text", value_parser = ["text", "json"])]
        format: String,
    },

    /// Start every worker and keep them running until Ctrl-C
    Serve,

    /// Run one SQL statement through the database driver
    Query {
        sql: String,

        /// Positional parameter; JSON values are passed as-is, anything else as a string
        #[arg(short = 'p', long = "param")]
        params: Vec<String>,
    },

    /// Run the database driver in this process (used by the supervisor)
    #[command(hide = true)]
    Driver {
        #[arg(long = "config-json")]
        config_json: String,
    },

    /// Run a worker in this process (used by the supervisor)
    #[command(hide = true)]
    Worker {
        kind: WorkerKind,

        #[arg(long = "config-json")]
        config_json: String,
    },
}

#[derive(ClapParser, Debug)]
#[command(author, version, about = "Supervisor for the local code analysis server", long_about = None)]
pub struct Args {
    /// Configuration file (default: <project root>/.code-analysis/config.toml)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Project root (default: current directory)
    #[arg(long = "project-root", global = true)]
    pub project_root: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error); RUST_LOG takes precedence
    #[arg(short, long = "log-level", global = true)]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}
