// SPDX-License-Identifier: CC-BY-NC-ND-4.0

//! Message bus client used to announce pipeline failures

use crate::error::{InstallerError, Result};
use async_trait::async_trait;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt::Debug;
use std::time::Duration;

pub const SOURCE_ID: &str = "sysup-installer";
pub const MESSAGE_PROPERTY: &str = "message";

pub const CHECK_UPDATE_ERROR: &str = "check-update-error";
pub const DOWNLOAD_UPDATE_ERROR: &str = "download-update-error";
pub const INSTALL_UPDATE_ERROR: &str = "install-update-error";
pub const MIGRATION_ERROR: &str = "migration-error";

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PropertyType {
    pub name: String,
}

/// Event type declaration sent to the bus at startup
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EventType {
    #[serde(rename = "sourceID")]
    pub source_id: String,
    pub name: String,
    #[serde(rename = "propertyTypeList")]
    pub property_type_list: Vec<PropertyType>,
}

impl EventType {
    fn with_message(name: &str) -> Self {
        Self {
            source_id: SOURCE_ID.to_owned(),
            name: name.to_owned(),
            property_type_list: vec![PropertyType {
                name: MESSAGE_PROPERTY.to_owned(),
            }],
        }
    }
}

/// All event types this service may publish
pub fn event_types() -> Vec<EventType> {
    [
        CHECK_UPDATE_ERROR,
        DOWNLOAD_UPDATE_ERROR,
        INSTALL_UPDATE_ERROR,
        MIGRATION_ERROR,
    ]
    .into_iter()
    .map(EventType::with_message)
    .collect()
}

#[async_trait]
pub trait EventPublisher: Send + Sync + Debug {
    async fn publish(&self, name: &str, message: &str) -> Result<()>;
}

#[derive(Debug, Clone)]
pub struct MessageBusClient {
    client: reqwest::Client,
    base_url: String,
}

impl MessageBusClient {
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| InstallerError::Registration(format!("Failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_owned(),
        })
    }

    /// Declare the event types this service publishes
    pub async fn register_event_types(&self) -> Result<()> {
        let url = format!("{}/v2/message_bus/event_type", self.base_url);
        let response = self
            .client
            .post(&url)
            .json(&event_types())
            .send()
            .await
            .map_err(|e| InstallerError::Registration(format!("message bus unreachable: {e}")))?;

        if !response.status().is_success() {
            return Err(InstallerError::Registration(format!(
                "message bus returned {}",
                response.status()
            )));
        }

        tracing::info!("Registered event types with message bus");
        Ok(())
    }
}

#[async_trait]
impl EventPublisher for MessageBusClient {
    async fn publish(&self, name: &str, message: &str) -> Result<()> {
        let url = format!("{}/v2/message_bus/event/{SOURCE_ID}/{name}", self.base_url);
        let properties = HashMap::from([(MESSAGE_PROPERTY, message)]);

        let response = self
            .client
            .post(&url)
            .json(&properties)
            .send()
            .await
            .map_err(|e| InstallerError::Registration(format!("publish {name} failed: {e}")))?;

        if !response.status().is_success() {
            return Err(InstallerError::Registration(format!(
                "publish {name} returned {}",
                response.status()
            )));
        }

        Ok(())
    }
}
