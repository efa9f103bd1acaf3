//! Launches backend instances from a commands file
//!
//! Each non-empty line of the commands file is a shell command that starts
//! one inference server and carries its listen port as `--port N`. Output of
//! every instance goes to `<output_dir>/llamafile_output_<port>.log`.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::{Child, Command};
use tracing::{info, warn};

use crate::config::LauncherConfig;
use crate::error::{AppError, Result};

/// A command line from the commands file with its parsed port
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchCommand {
    pub command: String,
    pub port: u16,
}

/// A started backend process
#[derive(Debug)]
pub struct LaunchedInstance {
    pub port: u16,
    pub log_file: PathBuf,
    pub child: Child,
}

/// Extract the value of `--port N` or `--port=N` from a command line
pub fn parse_port(command: &str) -> Option<u16> {
    let mut tokens = command.split_whitespace();
    while let Some(token) = tokens.next() {
        if token == "--port" {
            return tokens.next().and_then(|p| p.parse().ok());
        }
        if let Some(value) = token.strip_prefix("--port=") {
            return value.parse().ok();
        }
    }
    None
}

/// Read launch commands, skipping blank lines and lines without a port
pub async fn read_commands<P: AsRef<Path>>(path: P) -> Result<Vec<LaunchCommand>> {
    let contents = tokio::fs::read_to_string(path.as_ref()).await?;

    let commands = contents
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .filter_map(|line| match parse_port(line) {
            Some(port) => Some(LaunchCommand {
                command: line.to_string(),
                port,
            }),
            None => {
                warn!(command = %line, "Skipping command without a --port argument");
                None
            }
        })
        .collect();

    Ok(commands)
}

/// Spawns backend processes described by [`LauncherConfig`]
pub struct Launcher {
    config: LauncherConfig,
}

impl Launcher {
    pub fn new(config: LauncherConfig) -> Self {
        Self { config }
    }

    pub fn log_file_for(&self, port: u16) -> PathBuf {
        Path::new(&self.config.output_dir).join(format!("llamafile_output_{}.log", port))
    }

    /// Start one process with stdout and stderr redirected to its log file
    pub async fn launch(&self, command: &LaunchCommand) -> Result<LaunchedInstance> {
        let log_file = self.log_file_for(command.port);
        let stdout = tokio::fs::File::create(&log_file).await?.into_std().await;
        let stderr = stdout.try_clone()?;

        let child = Command::new("sh")
            .arg("-c")
            .arg(&command.command)
            .stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr))
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| AppError::Launch(format!("port {}: {}", command.port, e)))?;

        info!(
            port = command.port,
            pid = ?child.id(),
            log_file = %log_file.display(),
            "Launched instance"
        );

        Ok(LaunchedInstance {
            port: command.port,
            log_file,
            child,
        })
    }

    /// Start every command in the commands file.
    ///
    /// A command that fails to spawn is logged and skipped; callers decide
    /// whether the remaining pool is usable.
    pub async fn launch_all(&self) -> Result<Vec<LaunchedInstance>> {
        tokio::fs::create_dir_all(&self.config.output_dir).await?;

        let commands = read_commands(&self.config.commands_file).await?;
        let mut launched = Vec::with_capacity(commands.len());

        for command in &commands {
            match self.launch(command).await {
                Ok(instance) => launched.push(instance),
                Err(e) => warn!(port = command.port, error = %e, "Failed to launch instance"),
            }
        }

        let ports: Vec<u16> = launched.iter().map(|i| i.port).collect();
        info!(count = launched.len(), ports = ?ports, "Started instances");

        Ok(launched)
    }

    /// Host the launched instances are reachable on
    pub fn host(&self) -> &str {
        &self.config.host
    }
}
