// SPDX-License-Identifier: CC-BY-NC-ND-4.0

//! Persisted operator settings

use crate::error::{Result, UpdateError};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Settings {
    /// Check the release feed and flash when the service starts
    #[serde(default = "default_true")]
    pub auto_update_on_startup: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            auto_update_on_startup: true,
        }
    }
}

#[derive(Debug)]
pub struct SettingsStore {
    path: PathBuf,
    current: RwLock<Settings>,
}

impl SettingsStore {
    pub fn load(path: &Path) -> Result<Self> {
        let settings = if path.exists() {
            let content = std::fs::read_to_string(path)?;
            serde_json::from_str(&content).map_err(|e| {
                UpdateError::Config(format!("Failed to parse {}: {e}", path.display()))
            })?
        } else {
            Settings::default()
        };

        Ok(Self {
            path: path.to_path_buf(),
            current: RwLock::new(settings),
        })
    }

    pub fn auto_update_on_startup(&self) -> bool {
        self.current.read().auto_update_on_startup
    }

    /// Flip the startup auto-update flag and persist it; returns the new value
    pub fn toggle_auto_update(&self) -> Result<bool> {
        let mut current = self.current.write();
        let mut next = current.clone();
        next.auto_update_on_startup = !next.auto_update_on_startup;
        save_settings(&self.path, &next)?;
        *current = next;
        tracing::info!(
            "Auto-update on startup is now {}",
            current.auto_update_on_startup
        );
        Ok(current.auto_update_on_startup)
    }
}

fn save_settings(path: &Path, settings: &Settings) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let temp_path = path.with_extension("tmp");
    let content = serde_json::to_string_pretty(settings)?;

    // Atomic write
    std::fs::write(&temp_path, content)?;
    std::fs::rename(&temp_path, path)?;

    Ok(())
}
