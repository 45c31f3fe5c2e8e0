// SPDX-License-Identifier: CC-BY-NC-ND-4.0

//! Device port discovery and bootloader reset

use crate::error::{Result, UpdateError};
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// The board being flashed, as seen through its serial port.
pub trait TargetPort: Send + Sync + fmt::Debug {
    fn locate(&self) -> Result<PathBuf>;
    fn reset(&self, port: &Path) -> Result<()>;
}

#[derive(Debug, Clone)]
pub struct SerialTarget {
    pattern: String,
    baud_rate: u32,
    pulse: Duration,
}

impl SerialTarget {
    pub fn new(pattern: impl Into<String>, baud_rate: u32, pulse: Duration) -> Self {
        Self {
            pattern: pattern.into(),
            baud_rate,
            pulse,
        }
    }
}

impl TargetPort for SerialTarget {
    /// First device node matching the pattern in lexical order. With several boards
    /// attached there is no way to tell them apart, the first one wins.
    fn locate(&self) -> Result<PathBuf> {
        let entries = glob::glob(&self.pattern)
            .map_err(|e| UpdateError::Config(format!("Invalid port pattern: {e}")))?;

        let mut ports: Vec<PathBuf> = entries.filter_map(std::result::Result::ok).collect();
        ports.sort();

        match ports.into_iter().next() {
            Some(port) => {
                tracing::info!("Using serial port {}", port.display());
                Ok(port)
            }
            None => {
                tracing::warn!("No serial port matches {}", self.pattern);
                Err(UpdateError::NoPortFound)
            }
        }
    }

    /// Pulse DTR low then high, which drops the board into its bootloader.
    fn reset(&self, port: &Path) -> Result<()> {
        let path = port.to_string_lossy();
        let mut serial = serialport::new(path.as_ref(), self.baud_rate)
            .timeout(Duration::from_millis(500))
            .open()
            .map_err(|e| UpdateError::SerialOpenFailed(format!("{path}: {e}")))?;

        serial
            .write_data_terminal_ready(false)
            .map_err(|e| UpdateError::SerialOpenFailed(format!("{path}: {e}")))?;
        std::thread::sleep(self.pulse);
        serial
            .write_data_terminal_ready(true)
            .map_err(|e| UpdateError::SerialOpenFailed(format!("{path}: {e}")))?;

        tracing::debug!("Reset pulse sent on {path}");
        Ok(())
    }
}
