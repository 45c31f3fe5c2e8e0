// SPDX-License-Identifier: CC-BY-NC-ND-4.0

//! Decides where the firmware image comes from and materializes it on disk

use crate::config::UpdaterPaths;
use crate::error::{Result, UpdateError};
use crate::release::{ReleaseManifest, ReleaseProvider};
use crate::status::{StatusEmitter, StatusEvent};
use crate::version_store::VersionStore;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::info;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Acquisition {
    Image(PathBuf),
    /// The installed version matches the release feed, nothing to flash
    UpToDate,
}

#[derive(Debug, Clone)]
pub struct FirmwareAcquirer {
    paths: UpdaterPaths,
    versions: VersionStore,
    provider: Arc<dyn ReleaseProvider>,
    emitter: StatusEmitter,
}

impl FirmwareAcquirer {
    pub fn new(
        paths: UpdaterPaths,
        versions: VersionStore,
        provider: Arc<dyn ReleaseProvider>,
        emitter: StatusEmitter,
    ) -> Self {
        Self {
            paths,
            versions,
            provider,
            emitter,
        }
    }

    /// Routine requests use a staged `*.hex` if there is one and fetch otherwise.
    /// Startup discards staged leftovers and fetches only when the release feed
    /// moved past the persisted version marker.
    pub async fn acquire(&self, on_startup: bool) -> Result<Acquisition> {
        if on_startup {
            self.discard_staged_images()?;

            let manifest = self.provider.latest().await?;
            let installed = self.versions.read()?;
            if installed.as_deref() == Some(manifest.version.as_str()) {
                info!("Firmware {} already installed", manifest.version);
                return Ok(Acquisition::UpToDate);
            }

            info!(
                "Release {} differs from installed {:?}, updating",
                manifest.version, installed
            );
            self.emitter.report(StatusEvent::in_progress()).await;
            return self.fetch(&manifest).await.map(Acquisition::Image);
        }

        if let Some(staged) = self.staged_image()? {
            info!("Updating using staged image {}", staged.display());
            self.emitter.report(StatusEvent::in_progress()).await;
            return Ok(Acquisition::Image(staged));
        }

        info!("No staged image, fetching the latest release");
        self.emitter.report(StatusEvent::in_progress()).await;
        let manifest = self.provider.latest().await?;
        self.fetch(&manifest).await.map(Acquisition::Image)
    }

    /// Download into a partial file, move it into place, then persist the version
    async fn fetch(&self, manifest: &ReleaseManifest) -> Result<PathBuf> {
        std::fs::create_dir_all(&self.paths.build_dir)?;
        let partial = self.paths.partial_image();
        let image = &self.paths.firmware_image;

        info!("Downloading {}", manifest.download_url);
        self.provider.download(manifest, &partial).await?;

        if !partial.is_file() {
            return Err(UpdateError::DownloadFailed(
                "release image missing after download".to_owned(),
            ));
        }
        std::fs::rename(&partial, image)?;
        if !image.is_file() {
            return Err(UpdateError::DownloadFailed(format!(
                "{} missing after download",
                image.display()
            )));
        }

        self.versions.write(&manifest.version)?;
        info!("Release {} staged at {}", manifest.version, image.display());
        Ok(image.clone())
    }

    fn staged_image(&self) -> Result<Option<PathBuf>> {
        Ok(hex_files(&self.paths.build_dir)?.into_iter().next())
    }

    fn discard_staged_images(&self) -> Result<()> {
        for path in hex_files(&self.paths.build_dir)?
            .iter()
            .chain(std::iter::once(&self.paths.partial_image()))
        {
            match std::fs::remove_file(path) {
                Ok(()) => info!("Removed stale image {}", path.display()),
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }
}

/// `*.hex` files directly inside `dir`, sorted by name
pub(crate) fn hex_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let mut files = Vec::new();
    for entry in entries {
        let path = entry?.path();
        if path.is_file() && path.extension().is_some_and(|ext| ext == "hex") {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}
