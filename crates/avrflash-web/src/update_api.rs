// SPDX-License-Identifier: CC-BY-NC-ND-4.0

//! Update, upload, status and settings endpoints

use crate::AppState;
use avrflash_core::status::StatusRecord;
use avrflash_core::{Trigger, UpdateError};
use axum::{
    Json,
    extract::{State, rejection::JsonRejection},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// Error body shared by every endpoint
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

#[derive(Debug)]
pub enum ApiError {
    Update(UpdateError),
    /// Body could not be read as JSON (syntax, content type, size limit)
    Body(JsonRejection),
}

impl From<UpdateError> for ApiError {
    fn from(error: UpdateError) -> Self {
        Self::Update(error)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, error) = match self {
            Self::Update(e) => (update_error_status(&e), e.user_message()),
            Self::Body(rejection) => (rejection.status(), rejection.body_text()),
        };
        (status, Json(ErrorResponse { error })).into_response()
    }
}

fn update_error_status(error: &UpdateError) -> StatusCode {
    match error {
        UpdateError::DeviceBusy => StatusCode::CONFLICT,
        UpdateError::UploadPayloadInvalid(_) => StatusCode::BAD_REQUEST,
        UpdateError::NoPortFound
        | UpdateError::SerialOpenFailed(_)
        | UpdateError::ProviderUnavailable(_)
        | UpdateError::DownloadFailed(_)
        | UpdateError::DeviceNotFoundDuringFlash
        | UpdateError::FlashToolFailed
        | UpdateError::FlashTimedOut
        | UpdateError::UnknownFlashFailure
        | UpdateError::Launch(_)
        | UpdateError::Config(_)
        | UpdateError::Io(_)
        | UpdateError::Json(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Response for POST /api/update and POST /api/upload
#[derive(Debug, Serialize)]
pub struct StartedResponse {
    pub started: bool,
}

/// Request body for POST /api/upload
#[derive(Debug, Deserialize)]
pub struct UploadRequest {
    /// Base64 encoded Intel HEX image
    #[serde(default)]
    pub firmware: Option<String>,
}

/// Response for GET /api/status
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusResponse {
    pub is_updating: bool,
    pub auto_update_on_startup: bool,
    pub last_event: Option<StatusRecord>,
}

/// Response for POST /api/auto-update/toggle
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToggleResponse {
    pub auto_update_on_startup: bool,
}

/// POST /api/update - Start an update with whatever image is available
pub async fn update_handler(
    State(state): State<AppState>,
) -> Result<(StatusCode, Json<StartedResponse>), ApiError> {
    let ticket = state.updater.reserve().await?;
    drop(ticket.start(Trigger::Request));
    info!("Firmware update started on request");

    Ok((StatusCode::ACCEPTED, Json(StartedResponse { started: true })))
}

/// POST /api/upload - Stage the supplied image, then start an update
pub async fn upload_handler(
    State(state): State<AppState>,
    payload: Result<Json<UploadRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<StartedResponse>), ApiError> {
    let Json(request) = payload.map_err(|rejection| {
        warn!("Rejected upload body: {}", rejection.body_text());
        ApiError::Body(rejection)
    })?;

    let encoded = request.firmware.ok_or_else(|| {
        UpdateError::UploadPayloadInvalid("missing firmware field".to_owned())
    })?;
    let image = STANDARD.decode(encoded.trim()).map_err(|e| {
        UpdateError::UploadPayloadInvalid(format!("firmware is not valid base64: {e}"))
    })?;

    let ticket = state.updater.reserve().await?;
    ticket.stage(&image)?;
    drop(ticket.start(Trigger::Upload));
    info!("Firmware update started from upload ({} bytes)", image.len());

    Ok((StatusCode::ACCEPTED, Json(StartedResponse { started: true })))
}

/// GET /api/status - Current update state and settings
pub async fn status_handler(State(state): State<AppState>) -> Json<StatusResponse> {
    Json(StatusResponse {
        is_updating: state.updater.is_updating(),
        auto_update_on_startup: state.settings.auto_update_on_startup(),
        last_event: state.updater.emitter().last_event(),
    })
}

/// POST /api/auto-update/toggle - Flip and persist the startup auto-update setting
pub async fn toggle_auto_update_handler(
    State(state): State<AppState>,
) -> Result<Json<ToggleResponse>, ApiError> {
    let enabled = state.settings.toggle_auto_update()?;
    Ok(Json(ToggleResponse {
        auto_update_on_startup: enabled,
    }))
}
