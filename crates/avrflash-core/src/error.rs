// SPDX-License-Identifier: CC-BY-NC-ND-4.0

//! Error types for the update engine

use thiserror::Error;

#[derive(Debug, Error)]
pub enum UpdateError {
    #[error("device is busy")]
    DeviceBusy,

    #[error("no serial port matches the device pattern")]
    NoPortFound,

    #[error("failed to open serial port: {0}")]
    SerialOpenFailed(String),

    #[error("release provider unavailable: {0}")]
    ProviderUnavailable(String),

    #[error("firmware download failed: {0}")]
    DownloadFailed(String),

    #[error("flashing tool could not find the device")]
    DeviceNotFoundDuringFlash,

    #[error("flashing tool reported a failure")]
    FlashToolFailed,

    #[error("flashing tool timed out talking to the device")]
    FlashTimedOut,

    #[error("flashing tool exited without a recognizable result")]
    UnknownFlashFailure,

    #[error("invalid upload payload: {0}")]
    UploadPayloadInvalid(String),

    #[error("failed to launch flashing tool: {0}")]
    Launch(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

impl UpdateError {
    /// Message shown to the operator in an error status event
    pub fn user_message(&self) -> String {
        match self {
            Self::DeviceBusy => {
                "The printer is busy. Wait for the current job or update to finish.".to_owned()
            }
            Self::NoPortFound => "No ports exist. Is the printer plugged in?".to_owned(),
            Self::DeviceNotFoundDuringFlash => {
                "Device not found. Check the USB cable and power, then try again.".to_owned()
            }
            Self::FlashTimedOut => {
                "Timed out talking to the printer board. Power cycle the printer and try again."
                    .to_owned()
            }
            Self::UnknownFlashFailure => {
                "Unknown error, consult the upload log for details.".to_owned()
            }
            Self::UploadPayloadInvalid(reason) => format!("Invalid firmware upload: {reason}"),
            Self::SerialOpenFailed(_)
            | Self::ProviderUnavailable(_)
            | Self::DownloadFailed(_)
            | Self::FlashToolFailed
            | Self::Launch(_)
            | Self::Config(_)
            | Self::Io(_)
            | Self::Json(_) => {
                format!("Updating the printer firmware failed ({self}).")
            }
        }
    }
}

pub type Result<T> = std::result::Result<T, UpdateError>;
