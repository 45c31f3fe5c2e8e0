// SPDX-License-Identifier: CC-BY-NC-ND-4.0

//! avrflash - firmware update engine for AVR-based motion controllers
//!
//! Acquires a firmware image (staged locally or fetched from a release feed), resets the
//! target board over its serial port, runs the external flashing tool and supervises it
//! until the tool's output reports a terminal outcome.

pub mod acquirer;
pub mod classifier;
pub mod config;
pub mod device;
pub mod error;
pub mod launcher;
pub mod port;
pub mod process_tree;
pub mod release;
pub mod session;
pub mod settings;
pub mod status;
pub mod supervisor;
pub mod updater;
pub mod version_store;

pub use config::{UpdaterConfig, UpdaterPaths};
pub use device::{DetachedSession, DeviceSession, HostSession};
pub use error::{Result, UpdateError};
pub use settings::SettingsStore;
pub use status::{EventBus, StatusEmitter, StatusEvent, UpdateStatus};
pub use updater::{Components, Trigger, UpdateTicket, Updater};
