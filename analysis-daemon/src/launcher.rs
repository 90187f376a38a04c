//! Builds the OS command that runs a worker's entry point.

use crate::error::SupervisorError;
use crate::worker::{WorkerConfig, WorkerKind};
use std::path::PathBuf;
use std::process::Stdio;
use tokio::process::Command;
use tracing::debug;

/// Turns a worker configuration into a command for a separate OS process.
pub trait WorkerLauncher: Send + Sync {
    fn command(&self, config: &WorkerConfig) -> Result<Command, SupervisorError>;
}

/// Launches workers by re-invoking an executable that understands the
/// `driver --config-json <json>` and `worker <kind> --config-json <json>`
/// subcommands.
#[derive(Debug, Clone)]
pub struct ExecutableLauncher {
    program: PathBuf,
    base_args: Vec<String>,
    inherit_output: bool,
}

impl ExecutableLauncher {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            base_args: Vec::new(),
            // Surfaces early worker failures (bind, lock) on the supervisor's terminal
            inherit_output: std::env::var("CODE_ANALYSIS_VERBOSE_SPAWN").ok().as_deref()
                == Some("1"),
        }
    }

    /// Launcher for the currently running executable.
    pub fn current_exe() -> Result<Self, SupervisorError> {
        let program = std::env::current_exe()?;
        Ok(Self::new(program))
    }

    /// Arguments placed before the worker subcommand (e.g. `--config <path>`).
    pub fn with_base_args(mut self, args: impl IntoIterator<Item = String>) -> Self {
        self.base_args.extend(args);
        self
    }

    pub fn program(&self) -> &PathBuf {
        &self.program
    }

    /// Arguments for `config`, without the program itself.
    pub fn args_for(&self, config: &WorkerConfig) -> Result<Vec<String>, SupervisorError> {
        let json = serde_json::to_string(config)?;
        let mut args = self.base_args.clone();
        match config.kind() {
            WorkerKind::DatabaseDriver => args.push("driver".to_string()),
            kind => {
                args.push("worker".to_string());
                args.push(kind.as_str().replace('_', "-"));
            }
        }
        args.push("--config-json".to_string());
        args.push(json);
        Ok(args)
    }
}

impl WorkerLauncher for ExecutableLauncher {
    fn command(&self, config: &WorkerConfig) -> Result<Command, SupervisorError> {
        let args = self.args_for(config)?;
        debug!("Launching {:?} with {} args", self.program, args.len());

        let mut cmd = Command::new(&self.program);
        cmd.args(&args).stdin(Stdio::null()).kill_on_drop(false);
        if self.inherit_output {
            cmd.stdout(Stdio::inherit()).stderr(Stdio::inherit());
        } else {
            cmd.stdout(Stdio::null()).stderr(Stdio::null());
        }
        // Own process group: a Ctrl-C aimed at the supervisor must not reach workers
        cmd.process_group(0);
        Ok(cmd)
    }
}
