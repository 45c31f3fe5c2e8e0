// SPDX-License-Identifier: CC-BY-NC-ND-4.0

//! End-to-end update runs with `sh` standing in for the flashing tool

use async_trait::async_trait;
use avrflash_core::config::FlashCommand;
use avrflash_core::port::TargetPort;
use avrflash_core::process_tree::{ProcessTree, ProcfsTree};
use avrflash_core::release::{GithubReleaseProvider, ReleaseManifest, ReleaseProvider};
use avrflash_core::{
    Components, DeviceSession, EventBus, StatusEvent, Trigger, UpdateError, UpdateStatus,
    Updater, UpdaterPaths,
};
use parking_lot::Mutex;
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::broadcast;

const SUCCESS_SCRIPT: &str = "test -f '{firmware}' || exit 9; \
    echo 'avrdude: writing flash (1024 bytes):'; \
    echo 'Writing | ################################################## | 100% 2.34s'; \
    echo 'avrdude: reading on-chip flash data:'; \
    echo 'Reading | ################################################## | 100% 1.23s'; \
    echo 'avrdude: 1024 bytes of flash verified'; \
    echo 'avrdude done.  Thank you.'";

/// Board that is always present and resets instantly
#[derive(Debug)]
struct FakeBoard {
    port: PathBuf,
    resets: Mutex<Vec<PathBuf>>,
}

impl TargetPort for FakeBoard {
    fn locate(&self) -> avrflash_core::Result<PathBuf> {
        Ok(self.port.clone())
    }

    fn reset(&self, port: &Path) -> avrflash_core::Result<()> {
        self.resets.lock().push(port.to_path_buf());
        Ok(())
    }
}

#[derive(Debug)]
struct NoBoard;

impl TargetPort for NoBoard {
    fn locate(&self) -> avrflash_core::Result<PathBuf> {
        Err(UpdateError::NoPortFound)
    }

    fn reset(&self, _port: &Path) -> avrflash_core::Result<()> {
        panic!("reset without a port");
    }
}

#[derive(Debug)]
struct NoReleases;

#[async_trait]
impl ReleaseProvider for NoReleases {
    async fn latest(&self) -> avrflash_core::Result<ReleaseManifest> {
        Err(UpdateError::ProviderUnavailable("offline".to_owned()))
    }

    async fn download(
        &self,
        _manifest: &ReleaseManifest,
        _dest: &Path,
    ) -> avrflash_core::Result<()> {
        Err(UpdateError::DownloadFailed("offline".to_owned()))
    }
}

#[derive(Debug, Default)]
struct RecordingPrinter {
    calls: Mutex<Vec<&'static str>>,
}

#[async_trait]
impl DeviceSession for RecordingPrinter {
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

struct Harness {
    dir: TempDir,
    bus: EventBus,
    printer: Arc<RecordingPrinter>,
}

impl Harness {
    fn new() -> Self {
        Self {
            dir: TempDir::new().unwrap(),
            bus: EventBus::new(),
            printer: Arc::default(),
        }
    }

    fn paths(&self) -> UpdaterPaths {
        UpdaterPaths::new(self.dir.path())
    }

    fn board(&self) -> Arc<FakeBoard> {
        Arc::new(FakeBoard {
            port: self.dir.path().join("ttyACM0"),
            resets: Mutex::default(),
        })
    }

    fn stage_image(&self) {
        let paths = self.paths();
        std::fs::create_dir_all(&paths.build_dir).unwrap();
        std::fs::write(paths.build_dir.join("Marlin.hex"), ":00000001FF\n").unwrap();
    }

    fn updater(
        &self,
        script: &str,
        provider: Arc<dyn ReleaseProvider>,
        target: Arc<dyn TargetPort>,
        tree: Arc<dyn ProcessTree>,
    ) -> Updater {
        Updater::new(Components {
            paths: self.paths(),
            flash_command: FlashCommand {
                program: "sh".to_owned(),
                args: vec!["-c".to_owned(), script.to_owned()],
            },
            poll_interval: Duration::from_millis(20),
            flash_deadline: Some(Duration::from_secs(20)),
            report_progress: true,
            provider,
            target,
            tree,
            device: self.printer.clone(),
            bus: self.bus.clone(),
        })
    }
}

fn drain(rx: &mut broadcast::Receiver<StatusEvent>) -> Vec<StatusEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

#[tokio::test]
async fn test_fetch_and_flash_from_release_feed() {
    let harness = Harness::new();
    let mut server = mockito::Server::new_async().await;
    let manifest = server
        .mock("GET", "/releases/latest")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(
            json!({
                "tag_name": "v2.0.0",
                "assets": [{
                    "name": "firmware.hex",
                    "browser_download_url": format!("{}/download/firmware.hex", server.url()),
                    "updated_at": "2020-01-01T00:00:00Z"
                }]
            })
            .to_string(),
        )
        .create_async()
        .await;
    let image = server
        .mock("GET", "/download/firmware.hex")
        .with_status(200)
        .with_body(":100000000C9434000C9446000C9446000C9446006A\n:00000001FF\n")
        .create_async()
        .await;

    let provider =
        GithubReleaseProvider::new(format!("{}/releases/latest", server.url())).unwrap();
    let board = harness.board();
    let updater = harness.updater(
        SUCCESS_SCRIPT,
        Arc::new(provider),
        board.clone(),
        Arc::new(ProcfsTree::default()),
    );
    let mut rx = harness.bus.subscribe();

    updater
        .request_update(Trigger::Request)
        .await
        .unwrap()
        .await
        .unwrap();

    manifest.assert_async().await;
    image.assert_async().await;

    let paths = harness.paths();
    assert_eq!(
        std::fs::read_to_string(&paths.version_marker).unwrap().trim(),
        "2020-01-01T00:00:00Z"
    );
    assert!(!paths.firmware_image.exists());
    assert!(paths.log_file.exists());
    assert_eq!(*board.resets.lock(), vec![board.port.clone()]);

    let events = drain(&mut rx);
    assert_eq!(events.first().unwrap().status, UpdateStatus::InProgress);
    assert_eq!(
        events.last().unwrap(),
        &StatusEvent::completed(Some(3.57))
    );
    assert_eq!(
        events.iter().filter(|e| e.is_terminal()).count(),
        1,
        "exactly one terminal event: {events:?}"
    );
    assert_eq!(*harness.printer.calls.lock(), vec!["disconnect", "connect"]);
    assert!(!updater.is_updating());
}

#[tokio::test]
async fn test_startup_skips_installed_release() {
    let harness = Harness::new();
    let paths = harness.paths();
    std::fs::write(&paths.version_marker, "2020-01-01T00:00:00Z\n").unwrap();
    harness.stage_image();

    let mut server = mockito::Server::new_async().await;
    let manifest = server
        .mock("GET", "/releases/latest")
        .with_status(200)
        .with_body(
            json!({
                "assets": [{
                    "name": "firmware.hex",
                    "browser_download_url": format!("{}/download/firmware.hex", server.url()),
                    "updated_at": "2020-01-01T00:00:00Z"
                }]
            })
            .to_string(),
        )
        .expect(1)
        .create_async()
        .await;
    let image = server
        .mock("GET", "/download/firmware.hex")
        .expect(0)
        .create_async()
        .await;

    let provider =
        GithubReleaseProvider::new(format!("{}/releases/latest", server.url())).unwrap();
    let updater = harness.updater(
        SUCCESS_SCRIPT,
        Arc::new(provider),
        harness.board(),
        Arc::new(ProcfsTree::default()),
    );
    let mut rx = harness.bus.subscribe();

    updater
        .request_update(Trigger::Startup)
        .await
        .unwrap()
        .await
        .unwrap();

    manifest.assert_async().await;
    image.assert_async().await;
    assert!(drain(&mut rx).is_empty());
    assert!(!paths.build_dir.join("Marlin.hex").exists());
    assert!(!paths.log_file.exists());
    assert!(harness.printer.calls.lock().is_empty());
}

#[tokio::test]
async fn test_missing_port_never_launches_tool() {
    let harness = Harness::new();
    harness.stage_image();
    let launched = harness.dir.path().join("launched");
    let script = format!("touch '{}'", launched.display());
    let updater = harness.updater(
        &script,
        Arc::new(NoReleases),
        Arc::new(NoBoard),
        Arc::new(ProcfsTree::default()),
    );
    let mut rx = harness.bus.subscribe();

    updater
        .request_update(Trigger::Request)
        .await
        .unwrap()
        .await
        .unwrap();

    assert!(!launched.exists());
    let last = drain(&mut rx).pop().unwrap();
    assert_eq!(last, StatusEvent::failed(&UpdateError::NoPortFound));
    assert!(!harness.paths().build_dir.join("Marlin.hex").exists());
}

#[tokio::test]
async fn test_failed_update_clears_version_marker() {
    let harness = Harness::new();
    let paths = harness.paths();
    std::fs::write(&paths.version_marker, "2020-01-01T00:00:00Z\n").unwrap();
    harness.stage_image();
    let updater = harness.updater(
        "echo 'avrdude: stk500v2_command(): command failed'; echo 'avrdude: write FAILED'; exit 1",
        Arc::new(NoReleases),
        harness.board(),
        Arc::new(ProcfsTree::default()),
    );
    let mut rx = harness.bus.subscribe();

    updater
        .request_update(Trigger::Request)
        .await
        .unwrap()
        .await
        .unwrap();

    let last = drain(&mut rx).pop().unwrap();
    assert_eq!(last.status, UpdateStatus::Error);
    assert!(!paths.version_marker.exists());
    assert!(
        std::fs::read_to_string(&paths.log_file)
            .unwrap()
            .contains("FAILED")
    );
}

#[tokio::test]
async fn test_concurrent_request_is_rejected() {
    let harness = Harness::new();
    harness.stage_image();
    let script = format!("sleep 0.3; {SUCCESS_SCRIPT}");
    let updater = harness.updater(
        &script,
        Arc::new(NoReleases),
        harness.board(),
        Arc::new(ProcfsTree::default()),
    );

    let running = updater.request_update(Trigger::Request).await.unwrap();
    assert!(matches!(
        updater.request_update(Trigger::Request).await,
        Err(UpdateError::DeviceBusy)
    ));
    running.await.unwrap();

    assert_eq!(
        updater.emitter().last_event().unwrap().event,
        StatusEvent::completed(Some(3.57))
    );
    // Slot is free again; nothing staged so the offline feed fails this one
    updater
        .request_update(Trigger::Request)
        .await
        .unwrap()
        .await
        .unwrap();
    assert_eq!(
        updater.emitter().last_event().unwrap().event.status,
        UpdateStatus::Error
    );
}

/// Kills through `/proc` and notes whether a terminal event was already out
#[derive(Debug)]
struct WatchedTree {
    inner: ProcfsTree,
    events: Mutex<broadcast::Receiver<StatusEvent>>,
    killed: Mutex<Vec<u32>>,
    terminal_before_kill: Mutex<bool>,
}

impl ProcessTree for WatchedTree {
    fn descendants(&self, pid: u32) -> avrflash_core::Result<Vec<u32>> {
        self.inner.descendants(pid)
    }

    fn suspend(&self, pid: u32) -> avrflash_core::Result<()> {
        self.inner.suspend(pid)
    }

    fn terminate(&self, pid: u32) -> avrflash_core::Result<()> {
        self.note_terminal_events();
        self.killed.lock().push(pid);
        self.inner.terminate(pid)
    }

    fn terminate_group(&self, pgid: u32) -> avrflash_core::Result<()> {
        self.note_terminal_events();
        self.inner.terminate_group(pgid)
    }
}

impl WatchedTree {
    fn note_terminal_events(&self) {
        let mut events = self.events.lock();
        while let Ok(event) = events.try_recv() {
            if event.is_terminal() {
                *self.terminal_before_kill.lock() = true;
            }
        }
    }
}

#[cfg(target_os = "linux")]
#[tokio::test]
async fn test_timeout_kills_tool_and_children_first() {
    let harness = Harness::new();
    harness.stage_image();
    let tree = Arc::new(WatchedTree {
        inner: ProcfsTree::default(),
        events: Mutex::new(harness.bus.subscribe()),
        killed: Mutex::default(),
        terminal_before_kill: Mutex::new(false),
    });
    let updater = harness.updater(
        "sleep 30 & sleep 30 & echo 'avrdude: stk500v2_ReceiveMessage(): timeout'; wait",
        Arc::new(NoReleases),
        harness.board(),
        tree.clone(),
    );
    let mut rx = harness.bus.subscribe();

    updater
        .request_update(Trigger::Request)
        .await
        .unwrap()
        .await
        .unwrap();

    assert_eq!(tree.killed.lock().len(), 3);
    assert!(!*tree.terminal_before_kill.lock());
    assert_eq!(
        drain(&mut rx).pop().unwrap(),
        StatusEvent::failed(&UpdateError::FlashTimedOut)
    );
}
