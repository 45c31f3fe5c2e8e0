// SPDX-License-Identifier: CC-BY-NC-ND-4.0

//! Update orchestration: acquire, reset, launch, supervise, report, clean up

use crate::acquirer::{Acquisition, FirmwareAcquirer, hex_files};
use crate::classifier::FlashTimings;
use crate::config::{FlashCommand, UpdaterConfig, UpdaterPaths};
use crate::device::DeviceSession;
use crate::error::{Result, UpdateError};
use crate::launcher::FlashLauncher;
use crate::port::{SerialTarget, TargetPort};
use crate::process_tree::{ProcessTree, ProcfsTree};
use crate::release::{GithubReleaseProvider, ReleaseProvider};
use crate::session::UpdateSession;
use crate::status::{EventBus, StatusEmitter, StatusEvent};
use crate::supervisor::UpdateSupervisor;
use crate::version_store::VersionStore;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// What started an update attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    /// Explicit update command
    Request,
    /// Image supplied by the caller and staged before the run
    Upload,
    /// Automatic check when the service starts
    Startup,
}

impl Trigger {
    fn on_startup(self) -> bool {
        match self {
            Self::Startup => true,
            Self::Request | Self::Upload => false,
        }
    }
}

/// Everything the updater is assembled from
#[derive(Debug)]
pub struct Components {
    pub paths: UpdaterPaths,
    pub flash_command: FlashCommand,
    pub poll_interval: Duration,
    pub flash_deadline: Option<Duration>,
    pub report_progress: bool,
    pub provider: Arc<dyn ReleaseProvider>,
    pub target: Arc<dyn TargetPort>,
    pub tree: Arc<dyn ProcessTree>,
    pub device: Arc<dyn DeviceSession>,
    pub bus: EventBus,
}

#[derive(Debug)]
struct UpdaterInner {
    paths: UpdaterPaths,
    acquirer: FirmwareAcquirer,
    target: Arc<dyn TargetPort>,
    launcher: FlashLauncher,
    supervisor: UpdateSupervisor,
    emitter: StatusEmitter,
    device: Arc<dyn DeviceSession>,
    /// Held by the one live update from reservation until cleanup
    slot: Arc<Mutex<()>>,
}

enum Outcome {
    UpToDate,
    Flashed(FlashTimings),
}

#[derive(Debug, Clone)]
pub struct Updater {
    inner: Arc<UpdaterInner>,
}

impl Updater {
    pub fn new(components: Components) -> Self {
        let Components {
            paths,
            flash_command,
            poll_interval,
            flash_deadline,
            report_progress,
            provider,
            target,
            tree,
            device,
            bus,
        } = components;

        let versions = VersionStore::new(&paths.version_marker);
        let emitter = StatusEmitter::new(device.clone(), bus, versions.clone());
        let acquirer =
            FirmwareAcquirer::new(paths.clone(), versions, provider, emitter.clone());
        let launcher = FlashLauncher::new(flash_command, &paths.root, &paths.log_file);
        let supervisor = UpdateSupervisor::new(poll_interval, tree, emitter.clone())
            .with_deadline(flash_deadline)
            .with_progress_reports(report_progress);

        Self {
            inner: Arc::new(UpdaterInner {
                paths,
                acquirer,
                target,
                launcher,
                supervisor,
                emitter,
                device,
                slot: Arc::new(Mutex::new(())),
            }),
        }
    }

    /// Production wiring: GitHub releases, serial port target, `/proc` process tree
    pub fn from_config(
        config: &UpdaterConfig,
        device: Arc<dyn DeviceSession>,
        bus: EventBus,
    ) -> Result<Self> {
        let provider = GithubReleaseProvider::new(config.release_url.clone())?;
        let target = SerialTarget::new(
            config.port_pattern.clone(),
            config.baud_rate,
            config.reset_pulse(),
        );

        Ok(Self::new(Components {
            paths: config.paths(),
            flash_command: config.flash_command.clone(),
            poll_interval: config.poll_interval(),
            flash_deadline: config.flash_deadline(),
            report_progress: config.report_progress,
            provider: Arc::new(provider),
            target: Arc::new(target),
            tree: Arc::new(ProcfsTree::default()),
            device,
            bus,
        }))
    }

    pub fn paths(&self) -> &UpdaterPaths {
        &self.inner.paths
    }

    pub fn emitter(&self) -> &StatusEmitter {
        &self.inner.emitter
    }

    /// True from reservation until cleanup, and while the last reported event says so
    pub fn is_updating(&self) -> bool {
        self.inner.slot.try_lock().is_err() || self.inner.emitter.is_updating()
    }

    /// Claim the single update slot. Fails immediately with `DeviceBusy` when another
    /// update holds it or the printer is printing or paused.
    pub async fn reserve(&self) -> Result<UpdateTicket> {
        let guard = self
            .inner
            .slot
            .clone()
            .try_lock_owned()
            .map_err(|_| {
                warn!("Update rejected, another update is in progress");
                UpdateError::DeviceBusy
            })?;

        if self.device_busy().await {
            warn!("Update rejected, the printer is busy");
            return Err(UpdateError::DeviceBusy);
        }

        Ok(UpdateTicket {
            updater: self.clone(),
            guard,
        })
    }

    /// Reserve and start in one step
    pub async fn request_update(&self, trigger: Trigger) -> Result<JoinHandle<()>> {
        Ok(self.reserve().await?.start(trigger))
    }

    /// Query failures count as idle; an unreachable host must not block updates
    async fn device_busy(&self) -> bool {
        let device = &self.inner.device;
        let printing = device.is_printing().await.unwrap_or_else(|e| {
            warn!("Failed to query printing state: {e:#}");
            false
        });
        let paused = device.is_paused().await.unwrap_or_else(|e| {
            warn!("Failed to query paused state: {e:#}");
            false
        });
        printing || paused
    }

    async fn run(&self, trigger: Trigger) {
        info!("Firmware update triggered ({trigger:?})");
        let mut session = UpdateSession::new(&self.inner.paths);
        let emitter = &self.inner.emitter;

        match self.execute(trigger, &mut session).await {
            Ok(Outcome::UpToDate) => info!("Firmware is up to date, nothing to flash"),
            Ok(Outcome::Flashed(timings)) => {
                session.record_timings(timings);
                info!("Firmware {}", session.summary());
                emitter
                    .report(StatusEvent::completed(session.completion_seconds))
                    .await;
            }
            Err(e) => {
                error!("Firmware update failed: {e}");
                emitter.report(StatusEvent::failed(&e)).await;
            }
        }

        session.cleanup().await;
    }

    async fn execute(&self, trigger: Trigger, session: &mut UpdateSession) -> Result<Outcome> {
        let inner = &self.inner;

        let firmware = match inner.acquirer.acquire(trigger.on_startup()).await? {
            Acquisition::UpToDate => return Ok(Outcome::UpToDate),
            Acquisition::Image(path) => path,
        };
        session.firmware_path = Some(firmware.clone());

        let port = inner.target.locate()?;
        session.port = Some(port.clone());

        let target = inner.target.clone();
        let reset_port = port.clone();
        tokio::task::spawn_blocking(move || target.reset(&reset_port))
            .await
            .map_err(|e| UpdateError::SerialOpenFailed(format!("reset task failed: {e}")))??;

        let process = session
            .process
            .insert(inner.launcher.launch(&firmware, &port)?);
        let timings = inner.supervisor.supervise(process, &session.log_path).await?;

        Ok(Outcome::Flashed(timings))
    }
}

/// Exclusive right to run the next update. Dropping it without starting releases the slot.
#[derive(Debug)]
pub struct UpdateTicket {
    updater: Updater,
    guard: OwnedMutexGuard<()>,
}

impl UpdateTicket {
    /// Store a caller-supplied Intel HEX image as the only staged image
    pub fn stage(&self, image: &[u8]) -> Result<PathBuf> {
        validate_hex_image(image)?;

        let paths = &self.updater.inner.paths;
        let store = || -> Result<()> {
            std::fs::create_dir_all(&paths.build_dir)?;
            for stale in hex_files(&paths.build_dir)? {
                std::fs::remove_file(stale)?;
            }
            std::fs::write(&paths.firmware_image, image)?;
            Ok(())
        };
        store().map_err(|e| {
            UpdateError::UploadPayloadInvalid(format!("could not store image: {e}"))
        })?;

        info!(
            "Staged uploaded image ({} bytes) at {}",
            image.len(),
            paths.firmware_image.display()
        );
        Ok(paths.firmware_image.clone())
    }

    /// Run the update on a background task; the slot is released after cleanup
    pub fn start(self, trigger: Trigger) -> JoinHandle<()> {
        let Self { updater, guard } = self;
        tokio::spawn(async move {
            updater.run(trigger).await;
            drop(guard);
        })
    }
}

/// Intel HEX records start with `:`
fn validate_hex_image(image: &[u8]) -> Result<()> {
    match image.iter().find(|b| !b.is_ascii_whitespace()) {
        None => Err(UpdateError::UploadPayloadInvalid(
            "image is empty".to_owned(),
        )),
        Some(b':') => Ok(()),
        Some(_) => Err(UpdateError::UploadPayloadInvalid(
            "image is not in Intel HEX format".to_owned(),
        )),
    }
}
