// SPDX-License-Identifier: CC-BY-NC-ND-4.0

//! Starts the external flashing tool with its output captured in the upload log

use crate::config::FlashCommand;
use crate::error::{Result, UpdateError};
use std::fs::File;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::{Child, Command};

#[derive(Debug, Clone)]
pub struct FlashLauncher {
    command: FlashCommand,
    working_dir: PathBuf,
    log_path: PathBuf,
}

impl FlashLauncher {
    pub fn new(command: FlashCommand, working_dir: &Path, log_path: &Path) -> Self {
        Self {
            command,
            working_dir: working_dir.to_path_buf(),
            log_path: log_path.to_path_buf(),
        }
    }

    /// Spawn the tool as the leader of a new process group with stdout and stderr both
    /// appended to a freshly truncated log file.
    pub fn launch(&self, firmware: &Path, port: &Path) -> Result<FlashProcess> {
        match std::fs::remove_file(&self.log_path) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        if let Some(parent) = self.log_path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let log = File::create(&self.log_path)?;
        let stdout = log.try_clone()?;
        let stderr = log.try_clone()?;

        let args = self.command.render_args(port, firmware);
        tracing::info!(
            "Launching {} {} (log: {})",
            self.command.program,
            args.join(" "),
            self.log_path.display()
        );

        let mut command = Command::new(&self.command.program);
        command
            .args(&args)
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(stderr)
            .process_group(0);
        if self.working_dir.is_dir() {
            command.current_dir(&self.working_dir);
        }

        let child = command
            .spawn()
            .map_err(|e| UpdateError::Launch(format!("{}: {e}", self.command.program)))?;
        let pid = child
            .id()
            .ok_or_else(|| UpdateError::Launch("flashing tool exited before start".to_owned()))?;

        tracing::info!("Flashing tool started with PID: {pid}");

        Ok(FlashProcess {
            child,
            pid,
            collected: false,
            log: Some(log),
        })
    }
}

/// Handle to a running flashing tool. The tool leads its own process group, so
/// the group id equals `pid`.
#[derive(Debug)]
pub struct FlashProcess {
    child: Child,
    pid: u32,
    /// Exit status already reaped; `pid` may belong to another process by now
    collected: bool,
    log: Option<File>,
}

impl FlashProcess {
    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn is_collected(&self) -> bool {
        self.collected
    }

    /// Non-blocking exit check
    pub fn has_exited(&mut self) -> bool {
        match self.child.try_wait() {
            Ok(Some(status)) => {
                if !self.collected {
                    tracing::debug!("Flashing tool exited with {status}");
                }
                self.collected = true;
                true
            }
            Ok(None) => false,
            Err(e) => {
                tracing::warn!("Error checking flashing tool status: {e}");
                true
            }
        }
    }

    /// Make sure the process is gone and collected
    pub async fn reap(&mut self) {
        if !self.has_exited() {
            if let Err(e) = self.child.start_kill() {
                tracing::warn!("Failed to kill flashing tool: {e}");
            }
        }
        match self.child.wait().await {
            Ok(_) => self.collected = true,
            Err(e) => tracing::warn!("Failed to wait for flashing tool: {e}"),
        }
    }

    pub fn close_log(&mut self) {
        self.log.take();
    }
}
