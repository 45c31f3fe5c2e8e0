// SPDX-License-Identifier: CC-BY-NC-ND-4.0

//! Release feed access: latest-release manifest and image download

use crate::error::{Result, UpdateError};
use async_trait::async_trait;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use tokio::io::AsyncWriteExt;

const USER_AGENT: &str = concat!("avrflash/", env!("CARGO_PKG_VERSION"));

/// What the updater needs to know about the newest published firmware.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReleaseManifest {
    pub download_url: String,
    /// Asset's last-updated timestamp, used verbatim as the version identifier
    pub version: String,
}

#[async_trait]
pub trait ReleaseProvider: Send + Sync + fmt::Debug {
    /// Fetch the latest release manifest
    async fn latest(&self) -> Result<ReleaseManifest>;

    /// Download the manifest's image to `dest`; `dest` does not exist on error
    async fn download(&self, manifest: &ReleaseManifest, dest: &Path) -> Result<()>;
}

#[derive(Debug, Deserialize, Serialize)]
struct GithubRelease {
    #[serde(default)]
    tag_name: Option<String>,
    #[serde(default)]
    assets: Vec<GithubAsset>,
}

#[derive(Debug, Deserialize, Serialize)]
struct GithubAsset {
    name: String,
    browser_download_url: String,
    updated_at: String,
}

/// Release provider backed by the GitHub releases API.
#[derive(Debug, Clone)]
pub struct GithubReleaseProvider {
    client: reqwest::Client,
    latest_url: String,
}

impl GithubReleaseProvider {
    pub fn new(latest_url: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| {
                UpdateError::ProviderUnavailable(format!("Failed to build HTTP client: {e}"))
            })?;
        Ok(Self {
            client,
            latest_url: latest_url.into(),
        })
    }

    async fn stream_to_file(&self, url: &str, dest: &Path) -> Result<u64> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| UpdateError::DownloadFailed(format!("Request failed: {e}")))?;

        if !response.status().is_success() {
            return Err(UpdateError::DownloadFailed(format!(
                "Download failed with status: {}",
                response.status()
            )));
        }

        let mut file = tokio::fs::File::create(dest).await?;
        let mut written = 0u64;
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk
                .map_err(|e| UpdateError::DownloadFailed(format!("Failed to read body: {e}")))?;
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        file.flush().await?;

        Ok(written)
    }
}

#[async_trait]
impl ReleaseProvider for GithubReleaseProvider {
    async fn latest(&self) -> Result<ReleaseManifest> {
        let response = self
            .client
            .get(&self.latest_url)
            .header("Accept", "application/vnd.github+json")
            .send()
            .await
            .map_err(|e| UpdateError::ProviderUnavailable(format!("Request failed: {e}")))?;

        if let Some(remaining) = response.headers().get("x-ratelimit-remaining")
            && let Ok(remaining_str) = remaining.to_str()
            && let Ok(remaining_int) = remaining_str.parse::<u32>()
            && remaining_int < 10
        {
            tracing::warn!("GitHub rate limit low: {remaining_int} remaining");
        }

        let status = response.status();
        if status.is_client_error() || status.is_server_error() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Failed to read error body".to_owned());
            return Err(UpdateError::ProviderUnavailable(format!(
                "Release API error {status}: {body}"
            )));
        }

        let release: GithubRelease = response.json().await.map_err(|e| {
            UpdateError::ProviderUnavailable(format!("Failed to parse response: {e}"))
        })?;

        let asset = release
            .assets
            .iter()
            .find(|a| a.name.ends_with(".hex"))
            .or_else(|| release.assets.first())
            .ok_or_else(|| {
                UpdateError::DownloadFailed("Release has no downloadable asset".to_owned())
            })?;

        tracing::debug!(
            "Latest release {} asset {} updated {}",
            release.tag_name.as_deref().unwrap_or("<untagged>"),
            asset.name,
            asset.updated_at
        );

        Ok(ReleaseManifest {
            download_url: asset.browser_download_url.clone(),
            version: asset.updated_at.clone(),
        })
    }

    async fn download(&self, manifest: &ReleaseManifest, dest: &Path) -> Result<()> {
        match self.stream_to_file(&manifest.download_url, dest).await {
            Ok(bytes) => {
                tracing::info!("Downloaded {bytes} bytes to {}", dest.display());
                Ok(())
            }
            Err(e) => {
                if dest.exists() {
                    let _ = std::fs::remove_file(dest);
                }
                Err(e)
            }
        }
    }
}
