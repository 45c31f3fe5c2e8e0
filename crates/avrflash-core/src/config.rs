// SPDX-License-Identifier: CC-BY-NC-ND-4.0

//! Configuration module for the updater

use crate::error::{Result, UpdateError};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/avrflash/avrflash.toml";

const FIRMWARE_FILE_NAME: &str = "firmware.hex";

fn default_firmware_root() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("/root"))
        .join("Marlin")
}

fn default_port_pattern() -> String {
    "/dev/ttyACM*".to_owned()
}

fn default_baud_rate() -> u32 {
    115_200
}

fn default_reset_pulse_ms() -> u64 {
    100
}

fn default_release_url() -> String {
    "https://api.github.com/repos/Voxel8/Marlin/releases/latest".to_owned()
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdaterConfig {
    /// Device firmware repository; every runtime file lives below it
    #[serde(default = "default_firmware_root")]
    pub firmware_root: PathBuf,

    /// Glob matching candidate serial device nodes
    #[serde(default = "default_port_pattern")]
    pub port_pattern: String,

    /// Baud rate used to open the port for the reset pulse
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,

    /// Delay between the low and high edge of the reset line
    #[serde(default = "default_reset_pulse_ms")]
    pub reset_pulse_ms: u64,

    /// Latest-release endpoint of the firmware release feed
    #[serde(default = "default_release_url")]
    pub release_url: String,

    #[serde(default)]
    pub flash_command: FlashCommand,

    /// How often the upload log is re-read while flashing
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Emit `continue` events on every poll tick
    #[serde(default = "default_true")]
    pub report_progress: bool,

    /// Optional wall-clock ceiling for a single flash run
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub flash_deadline_secs: Option<u64>,

    #[serde(default)]
    pub web: WebSettings,

    /// Host print-management application; without it the device session is detached
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<HostSettings>,
}

/// External flashing tool invocation. `{port}` and `{firmware}` are substituted in `args`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FlashCommand {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
}

impl Default for FlashCommand {
    fn default() -> Self {
        Self {
            program: "avrdude".to_owned(),
            args: [
                "-p",
                "atmega2560",
                "-c",
                "wiring",
                "-P",
                "{port}",
                "-b",
                "115200",
                "-D",
                "-U",
                "flash:w:{firmware}:i",
            ]
            .into_iter()
            .map(ToOwned::to_owned)
            .collect(),
        }
    }
}

impl FlashCommand {
    /// Arguments with placeholders filled in
    pub fn render_args(&self, port: &Path, firmware: &Path) -> Vec<String> {
        let port = port.to_string_lossy();
        let firmware = firmware.to_string_lossy();
        self.args
            .iter()
            .map(|arg| arg.replace("{port}", &port).replace("{firmware}", &firmware))
            .collect()
    }
}

fn default_bind_address() -> String {
    "0.0.0.0".to_owned()
}

fn default_web_port() -> u16 {
    8110
}

fn default_upload_limit_mb() -> usize {
    200
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebSettings {
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    #[serde(default = "default_web_port")]
    pub port: u16,
    /// Request body ceiling for uploads; base64 inflates images by a third
    #[serde(default = "default_upload_limit_mb")]
    pub upload_limit_mb: usize,
}

impl Default for WebSettings {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            port: default_web_port(),
            upload_limit_mb: default_upload_limit_mb(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostSettings {
    pub base_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
}

impl Default for UpdaterConfig {
    fn default() -> Self {
        Self {
            firmware_root: default_firmware_root(),
            port_pattern: default_port_pattern(),
            baud_rate: default_baud_rate(),
            reset_pulse_ms: default_reset_pulse_ms(),
            release_url: default_release_url(),
            flash_command: FlashCommand::default(),
            poll_interval_ms: default_poll_interval_ms(),
            report_progress: true,
            flash_deadline_secs: None,
            web: WebSettings::default(),
            host: None,
        }
    }
}

impl UpdaterConfig {
    /// Load the config file, falling back to defaults when it does not exist
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            tracing::info!("No config at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)
            .map_err(|e| UpdateError::Config(format!("Failed to parse config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.flash_command.program.trim().is_empty() {
            return Err(UpdateError::Config(
                "flash_command.program must not be empty".to_owned(),
            ));
        }
        if self.poll_interval_ms == 0 {
            return Err(UpdateError::Config(
                "poll_interval_ms must be greater than zero".to_owned(),
            ));
        }
        if self.port_pattern.trim().is_empty() {
            return Err(UpdateError::Config("port_pattern must be set".to_owned()));
        }
        Ok(())
    }

    pub fn paths(&self) -> UpdaterPaths {
        UpdaterPaths::new(&self.firmware_root)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn reset_pulse(&self) -> Duration {
        Duration::from_millis(self.reset_pulse_ms)
    }

    pub fn flash_deadline(&self) -> Option<Duration> {
        self.flash_deadline_secs.map(Duration::from_secs)
    }
}

/// Every file location shared between components, derived once from the firmware root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdaterPaths {
    pub root: PathBuf,
    /// Staging directory scanned for `*.hex` images
    pub build_dir: PathBuf,
    /// Deterministic destination for downloaded and uploaded images
    pub firmware_image: PathBuf,
    /// Combined stdout/stderr of the flashing tool
    pub log_file: PathBuf,
    pub version_marker: PathBuf,
    pub settings_file: PathBuf,
}

impl UpdaterPaths {
    pub fn new(root: &Path) -> Self {
        let build_dir = root.join(".build");
        Self {
            root: root.to_path_buf(),
            firmware_image: build_dir.join(FIRMWARE_FILE_NAME),
            build_dir,
            log_file: root.join("upload.log"),
            version_marker: root.join(".firmware-version"),
            settings_file: root.join(".avrflash-settings.json"),
        }
    }

    /// Temporary download target, renamed onto `firmware_image` on success
    pub fn partial_image(&self) -> PathBuf {
        self.firmware_image.with_extension("hex.part")
    }
}
