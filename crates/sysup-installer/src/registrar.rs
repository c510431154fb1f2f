// SPDX-License-Identifier: CC-BY-NC-ND-4.0

//! Registration with the service gateway and the message bus

use crate::error::{InstallerError, Result};
use crate::events::MessageBusClient;
use crate::retry::retry_with_backoff;
use crate::shutdown::CancelToken;
use serde::Serialize;
use std::path::Path;
use std::time::Duration;

pub const MANAGEMENT_URL_FILE: &str = "management.url";
pub const MESSAGE_BUS_URL_FILE: &str = "message-bus.url";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Route {
    pub path: String,
    pub target: String,
}

/// Read a collaborator address advertised in `{runtime_path}/{file}`
pub async fn discover_url(runtime_path: &Path, file: &str) -> Result<String> {
    let path = runtime_path.join(file);
    let content = tokio::fs::read_to_string(&path).await.map_err(|e| {
        InstallerError::Registration(format!("cannot read {}: {e}", path.display()))
    })?;

    let url = content.trim();
    if url.is_empty() {
        return Err(InstallerError::Registration(format!(
            "{} is empty",
            path.display()
        )));
    }

    if url.starts_with("http://") || url.starts_with("https://") {
        Ok(url.to_owned())
    } else {
        Ok(format!("http://{url}"))
    }
}

/// Configured address if any, otherwise the discovery file (re-read on every attempt)
async fn resolve_url(configured: Option<&str>, runtime_path: &Path, file: &str) -> Result<String> {
    match configured {
        Some(url) => Ok(url.trim_end_matches('/').to_owned()),
        None => discover_url(runtime_path, file).await,
    }
}

#[derive(Debug, Clone)]
pub struct Registrar {
    client: reqwest::Client,
    runtime_path: std::path::PathBuf,
    gateway_url: Option<String>,
    message_bus_url: Option<String>,
    interval: Duration,
}

impl Registrar {
    pub fn new(
        runtime_path: impl Into<std::path::PathBuf>,
        gateway_url: Option<String>,
        message_bus_url: Option<String>,
        interval: Duration,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| InstallerError::Registration(format!("Failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            runtime_path: runtime_path.into(),
            gateway_url,
            message_bus_url,
            interval,
        })
    }

    /// Advertise `path` on the gateway, pointing at `target`. Retries until success.
    pub async fn register_gateway(
        &self,
        path: &str,
        target: &str,
        cancel: &CancelToken,
    ) -> Result<()> {
        let route = Route {
            path: path.to_owned(),
            target: target.to_owned(),
        };

        retry_with_backoff("gateway registration", self.interval, None, cancel, || {
            self.post_route(&route)
        })
        .await?;

        tracing::info!("Registered route {path} -> {target} with gateway");
        Ok(())
    }

    async fn post_route(&self, route: &Route) -> Result<()> {
        let base = resolve_url(
            self.gateway_url.as_deref(),
            &self.runtime_path,
            MANAGEMENT_URL_FILE,
        )
        .await?;

        let response = self
            .client
            .post(format!("{base}/v1/gateway/routes"))
            .json(route)
            .send()
            .await
            .map_err(|e| InstallerError::Registration(format!("gateway unreachable: {e}")))?;

        if !response.status().is_success() {
            return Err(InstallerError::Registration(format!(
                "gateway returned {}",
                response.status()
            )));
        }
        Ok(())
    }

    /// Declare event types on the message bus. Retries until success and
    /// returns the client for publishing.
    pub async fn register_message_bus(&self, cancel: &CancelToken) -> Result<MessageBusClient> {
        let client = retry_with_backoff(
            "message bus registration",
            self.interval,
            None,
            cancel,
            || async {
                let base = resolve_url(
                    self.message_bus_url.as_deref(),
                    &self.runtime_path,
                    MESSAGE_BUS_URL_FILE,
                )
                .await?;
                let client = MessageBusClient::new(base)?;
                client.register_event_types().await?;
                Ok(client)
            },
        )
        .await?;

        Ok(client)
    }
}
