// SPDX-License-Identifier: CC-BY-NC-ND-4.0

//! Device session of the host print-management application

use anyhow::{Context, Result, bail};
use async_trait::async_trait;
use serde::Deserialize;
use std::fmt;
use std::time::Duration;

/// The host's connection to the printer. Disconnected while the board is reflashed.
#[async_trait]
pub trait DeviceSession: Send + Sync + fmt::Debug {
    async fn connect(&self) -> Result<()>;
    async fn disconnect(&self) -> Result<()>;
    async fn is_printing(&self) -> Result<bool>;
    async fn is_paused(&self) -> Result<bool>;
}

/// Session used when no host application is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct DetachedSession;

#[async_trait]
impl DeviceSession for DetachedSession {
    async fn connect(&self) -> Result<()> {
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        Ok(())
    }

    async fn is_printing(&self) -> Result<bool> {
        Ok(false)
    }

    async fn is_paused(&self) -> Result<bool> {
        Ok(false)
    }
}

#[derive(Debug, Default, Deserialize)]
struct PrinterResponse {
    #[serde(default)]
    state: PrinterState,
}

#[derive(Debug, Default, Deserialize)]
struct PrinterState {
    #[serde(default)]
    flags: PrinterFlags,
}

#[derive(Debug, Default, Deserialize)]
struct PrinterFlags {
    #[serde(default)]
    printing: bool,
    #[serde(default)]
    paused: bool,
}

/// REST client for the host application's connection and printer endpoints.
#[derive(Debug, Clone)]
pub struct HostSession {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl HostSession {
    pub fn new(base_url: &str, api_key: Option<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_owned(),
            api_key,
        })
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let request = self
            .client
            .request(method, format!("{}{path}", self.base_url));
        match self.api_key {
            Some(ref key) => request.header("X-Api-Key", key),
            None => request,
        }
    }

    async fn connection_command(&self, command: &str) -> Result<()> {
        let response = self
            .request(reqwest::Method::POST, "/api/connection")
            .json(&serde_json::json!({ "command": command }))
            .send()
            .await
            .with_context(|| format!("Connection command '{command}' failed"))?;

        if !response.status().is_success() {
            bail!(
                "Connection command '{command}' rejected with status {}",
                response.status()
            );
        }
        Ok(())
    }

    async fn flags(&self) -> Result<PrinterFlags> {
        let response = self
            .request(reqwest::Method::GET, "/api/printer")
            .send()
            .await
            .context("Printer state request failed")?;

        // 409: the host is not connected to the printer, so nothing is running
        if response.status() == reqwest::StatusCode::CONFLICT {
            return Ok(PrinterFlags::default());
        }
        if !response.status().is_success() {
            bail!("Printer state request returned {}", response.status());
        }

        let printer: PrinterResponse = response
            .json()
            .await
            .context("Failed to parse printer state")?;
        Ok(printer.state.flags)
    }
}

#[async_trait]
impl DeviceSession for HostSession {
    async fn connect(&self) -> Result<()> {
        self.connection_command("connect").await
    }

    async fn disconnect(&self) -> Result<()> {
        self.connection_command("disconnect").await
    }

    async fn is_printing(&self) -> Result<bool> {
        Ok(self.flags().await?.printing)
    }

    async fn is_paused(&self) -> Result<bool> {
        Ok(self.flags().await?.paused)
    }
}
