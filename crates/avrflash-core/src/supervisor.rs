// SPDX-License-Identifier: CC-BY-NC-ND-4.0

//! Polls the upload log until the flashing tool reaches a terminal outcome

use crate::classifier::{FlashTimings, Verdict, classify};
use crate::error::{Result, UpdateError};
use crate::launcher::FlashProcess;
use crate::process_tree::{ProcessTree, terminate_tree};
use crate::status::{StatusEmitter, StatusEvent};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct UpdateSupervisor {
    poll_interval: Duration,
    deadline: Option<Duration>,
    report_progress: bool,
    tree: Arc<dyn ProcessTree>,
    emitter: StatusEmitter,
}

impl UpdateSupervisor {
    pub fn new(
        poll_interval: Duration,
        tree: Arc<dyn ProcessTree>,
        emitter: StatusEmitter,
    ) -> Self {
        Self {
            poll_interval,
            deadline: None,
            report_progress: true,
            tree,
            emitter,
        }
    }

    /// Give up after `deadline` even if the tool never prints a timeout
    #[must_use]
    pub fn with_deadline(mut self, deadline: Option<Duration>) -> Self {
        self.deadline = deadline;
        self
    }

    #[must_use]
    pub fn with_progress_reports(mut self, enabled: bool) -> Self {
        self.report_progress = enabled;
        self
    }

    /// Re-read the whole log once per interval and classify it. Returns the timings
    /// printed by the tool on success; every other terminal outcome is an error.
    pub async fn supervise(
        &self,
        process: &mut FlashProcess,
        log_path: &Path,
    ) -> Result<FlashTimings> {
        let started = Instant::now();

        loop {
            // Exit status first: once the process is gone its log is complete
            let exited = process.has_exited();
            let log = read_log(log_path).await;

            match classify(&log, exited) {
                Verdict::Running => {
                    if let Some(deadline) = self.deadline
                        && started.elapsed() >= deadline
                    {
                        warn!("Flashing exceeded {}s, aborting", deadline.as_secs());
                        self.kill(process).await;
                        return Err(UpdateError::FlashTimedOut);
                    }
                    if self.report_progress {
                        self.emitter.report(StatusEvent::progress()).await;
                    }
                    tokio::time::sleep(self.poll_interval).await;
                }
                Verdict::Completed(timings) => {
                    info!("Flashing completed, timings: {timings:?}");
                    process.reap().await;
                    return Ok(timings);
                }
                Verdict::DeviceNotFound => {
                    warn!("Flashing tool could not find the device");
                    process.reap().await;
                    return Err(UpdateError::DeviceNotFoundDuringFlash);
                }
                Verdict::ToolFailed => {
                    warn!("Flashing tool reported failure, see {}", log_path.display());
                    process.reap().await;
                    return Err(UpdateError::FlashToolFailed);
                }
                Verdict::TimedOut => {
                    warn!("Flashing tool timed out talking to the board");
                    self.kill(process).await;
                    return Err(UpdateError::FlashTimedOut);
                }
                Verdict::UnknownFailure => {
                    warn!(
                        "Flashing tool exited without a result, see {}",
                        log_path.display()
                    );
                    process.reap().await;
                    return Err(UpdateError::UnknownFlashFailure);
                }
            }
        }
    }

    async fn kill(&self, process: &mut FlashProcess) {
        terminate_tree(self.tree.as_ref(), process.pid(), !process.is_collected());
        process.reap().await;
    }
}

async fn read_log(path: &Path) -> String {
    match tokio::fs::read(path).await {
        Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
        Err(e) => {
            debug!("Upload log not readable yet: {e}");
            String::new()
        }
    }
}
