// SPDX-License-Identifier: CC-BY-NC-ND-4.0

//! Status events and the single point that broadcasts them

use crate::device::DeviceSession;
use crate::error::UpdateError;
use crate::version_store::VersionStore;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::broadcast;
use tracing::{info, warn};

const BUS_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpdateStatus {
    InProgress,
    Completed,
    Error,
    Continue,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusEvent {
    pub is_updating: bool,
    pub status: UpdateStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion_seconds: Option<f64>,
}

impl StatusEvent {
    pub fn in_progress() -> Self {
        Self {
            is_updating: true,
            status: UpdateStatus::InProgress,
            message: None,
            completion_seconds: None,
        }
    }

    pub fn progress() -> Self {
        Self {
            is_updating: true,
            status: UpdateStatus::Continue,
            message: None,
            completion_seconds: None,
        }
    }

    pub fn completed(completion_seconds: Option<f64>) -> Self {
        Self {
            is_updating: false,
            status: UpdateStatus::Completed,
            message: None,
            completion_seconds,
        }
    }

    pub fn failed(error: &UpdateError) -> Self {
        Self {
            is_updating: false,
            status: UpdateStatus::Error,
            message: Some(error.user_message()),
            completion_seconds: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.status, UpdateStatus::Completed | UpdateStatus::Error)
    }
}

/// Fire-and-forget fan-out of status events to external listeners.
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<StatusEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(BUS_CAPACITY);
        Self { sender }
    }

    pub fn publish(&self, event: StatusEvent) {
        // No subscribers is fine
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StatusEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusRecord {
    pub event: StatusEvent,
    pub at: DateTime<Utc>,
}

#[derive(Debug)]
struct EmitterInner {
    session: Arc<dyn DeviceSession>,
    bus: EventBus,
    versions: VersionStore,
    updating: AtomicBool,
    last: Mutex<Option<StatusRecord>>,
}

/// Reports state transitions.
///
/// Side effects, in order:
/// - `isUpdating` false -> true disconnects the device session, true -> false reconnects it
/// - an error status clears the version marker
/// - the event is published on the bus
#[derive(Debug, Clone)]
pub struct StatusEmitter {
    inner: Arc<EmitterInner>,
}

impl StatusEmitter {
    pub fn new(session: Arc<dyn DeviceSession>, bus: EventBus, versions: VersionStore) -> Self {
        Self {
            inner: Arc::new(EmitterInner {
                session,
                bus,
                versions,
                updating: AtomicBool::new(false),
                last: Mutex::new(None),
            }),
        }
    }

    pub async fn report(&self, event: StatusEvent) {
        let was_updating = self
            .inner
            .updating
            .swap(event.is_updating, Ordering::SeqCst);

        match (was_updating, event.is_updating) {
            (false, true) => {
                info!("Disconnecting printer for firmware update");
                if let Err(e) = self.inner.session.disconnect().await {
                    warn!("Failed to disconnect printer: {e:#}");
                }
            }
            (true, false) => {
                info!("Reconnecting printer");
                if let Err(e) = self.inner.session.connect().await {
                    warn!("Failed to reconnect printer: {e:#}");
                }
            }
            (false, false) | (true, true) => {}
        }

        if event.status == UpdateStatus::Error
            && let Err(e) = self.inner.versions.clear()
        {
            warn!("Failed to clear version marker: {e}");
        }

        if event.is_terminal() {
            info!(
                "Update finished: status={:?} message={:?} seconds={:?}",
                event.status, event.message, event.completion_seconds
            );
        }

        *self.inner.last.lock() = Some(StatusRecord {
            event: event.clone(),
            at: Utc::now(),
        });
        self.inner.bus.publish(event);
    }

    pub fn is_updating(&self) -> bool {
        self.inner.updating.load(Ordering::SeqCst)
    }

    pub fn last_event(&self) -> Option<StatusRecord> {
        self.inner.last.lock().clone()
    }

    pub fn bus(&self) -> &EventBus {
        &self.inner.bus
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use tempfile::TempDir;

    #[derive(Debug, Default)]
    struct RecordingSession {
        calls: Mutex<Vec<&'static str>>,
    }

    #[async_trait]
    impl DeviceSession for RecordingSession {
        async fn connect(&self) -> anyhow::Result<()> {
            self.calls.lock().push("connect");
            Ok(())
        }

        async fn disconnect(&self) -> anyhow::Result<()> {
            self.calls.lock().push("disconnect");
            Ok(())
        }

        async fn is_printing(&self) -> anyhow::Result<bool> {
            Ok(false)
        }

        async fn is_paused(&self) -> anyhow::Result<bool> {
            Ok(false)
        }
    }

    fn emitter(dir: &TempDir) -> (StatusEmitter, Arc<RecordingSession>, VersionStore) {
        let session = Arc::new(RecordingSession::default());
        let versions = VersionStore::new(&dir.path().join(".firmware-version"));
        let emitter = StatusEmitter::new(session.clone(), EventBus::new(), versions.clone());
        (emitter, session, versions)
    }

    #[test]
    fn test_event_wire_format() {
        let json = serde_json::to_value(StatusEvent::completed(Some(3.57))).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"isUpdating": false, "status": "completed", "completionSeconds": 3.57})
        );

        let json = serde_json::to_value(StatusEvent::in_progress()).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"isUpdating": true, "status": "inprogress"})
        );
    }

    #[tokio::test]
    async fn test_transitions_toggle_session() {
        let dir = TempDir::new().unwrap();
        let (emitter, session, _) = emitter(&dir);

        emitter.report(StatusEvent::in_progress()).await;
        emitter.report(StatusEvent::progress()).await;
        assert!(emitter.is_updating());
        emitter.report(StatusEvent::completed(None)).await;
        assert!(!emitter.is_updating());

        assert_eq!(*session.calls.lock(), vec!["disconnect", "connect"]);
    }

    #[tokio::test]
    async fn test_error_clears_version_marker() {
        let dir = TempDir::new().unwrap();
        let (emitter, _, versions) = emitter(&dir);
        versions.write("2020-01-01T00:00:00Z").unwrap();

        emitter.report(StatusEvent::in_progress()).await;
        emitter
            .report(StatusEvent::failed(&UpdateError::FlashToolFailed))
            .await;

        assert_eq!(versions.read().unwrap(), None);
    }

    #[tokio::test]
    async fn test_completed_keeps_version_marker() {
        let dir = TempDir::new().unwrap();
        let (emitter, _, versions) = emitter(&dir);
        versions.write("2020-01-01T00:00:00Z").unwrap();

        emitter.report(StatusEvent::completed(Some(1.0))).await;

        assert!(versions.read().unwrap().is_some());
    }

    #[tokio::test]
    async fn test_publishes_to_bus_and_records_last() {
        let dir = TempDir::new().unwrap();
        let (emitter, _, _) = emitter(&dir);
        let mut rx = emitter.bus().subscribe();

        emitter.report(StatusEvent::in_progress()).await;

        assert_eq!(rx.recv().await.unwrap(), StatusEvent::in_progress());
        assert_eq!(
            emitter.last_event().unwrap().event.status,
            UpdateStatus::InProgress
        );
    }
}
