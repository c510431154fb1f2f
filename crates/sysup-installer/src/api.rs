// SPDX-License-Identifier: CC-BY-NC-ND-4.0

//! HTTP API under `/v2/installer`

use crate::error::InstallerError;
use crate::orchestrator::{Dispatch, Orchestrator};
use crate::release::{LATEST, Release};
use crate::shutdown::CancelToken;
use crate::status::InstallStatus;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

pub const API_PATH: &str = "/v2/installer";

#[derive(Debug, Serialize, Deserialize)]
pub struct StatusResponse {
    pub data: InstallStatus,
    /// Package status summary
    pub message: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ReleaseResponse {
    pub data: Release,
    pub upgradable: bool,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct MessageResponse {
    pub message: String,
}

#[derive(Debug, Deserialize)]
pub struct ReleaseQuery {
    pub version: Option<String>,
}

impl ReleaseQuery {
    fn tag(&self) -> &str {
        self.version.as_deref().unwrap_or(LATEST)
    }
}

/// Error response carrying a `{ "message" }` body
#[derive(Debug)]
pub struct ApiError(InstallerError);

impl From<InstallerError> for ApiError {
    fn from(err: InstallerError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match self.0 {
            InstallerError::ReleaseNotFound => StatusCode::NOT_FOUND,
            InstallerError::InstallInProgress | InstallerError::NotUpgradable { .. } => {
                StatusCode::CONFLICT
            }
            InstallerError::Config(_)
            | InstallerError::Io(_)
            | InstallerError::Json(_)
            | InstallerError::Fetch(_)
            | InstallerError::Download(_)
            | InstallerError::ChecksumMismatch { .. }
            | InstallerError::NotCached { .. }
            | InstallerError::Cancelled
            | InstallerError::Extract(_)
            | InstallerError::Install(_)
            | InstallerError::Migration(_)
            | InstallerError::VersionParse(_)
            | InstallerError::InvalidTransition(_)
            | InstallerError::Registration(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = MessageResponse {
            message: self.0.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

pub fn router(orchestrator: Arc<Orchestrator>) -> Router {
    let api = Router::new()
        .route("/status", get(status_handler))
        .route("/release", get(release_handler))
        .route("/release/install", post(install_handler))
        .with_state(orchestrator);

    Router::new()
        .nest(API_PATH, api)
        .layer(TraceLayer::new_for_http())
}

/// Serve the API on an already bound listener until `cancel` fires
pub async fn serve(
    listener: TcpListener,
    orchestrator: Arc<Orchestrator>,
    cancel: CancelToken,
) -> std::io::Result<()> {
    info!("Installer API listening on {}", listener.local_addr()?);
    axum::serve(listener, router(orchestrator))
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await
}

/// GET /status - Current install status
async fn status_handler(State(orchestrator): State<Arc<Orchestrator>>) -> Json<StatusResponse> {
    let (status, package_status) = orchestrator.status().get_status();
    Json(StatusResponse {
        data: status,
        message: package_status.to_string(),
    })
}

/// GET /release - Resolve a release and report whether it is upgradable
async fn release_handler(
    State(orchestrator): State<Arc<Orchestrator>>,
    Query(query): Query<ReleaseQuery>,
) -> Result<Json<ReleaseResponse>, ApiError> {
    debug!("Release requested for {}", query.tag());
    let (release, upgradable) = orchestrator.check_release(query.tag()).await?;
    Ok(Json(ReleaseResponse {
        data: release,
        upgradable,
    }))
}

/// POST /release/install - Start installing a release in the background
async fn install_handler(
    State(orchestrator): State<Arc<Orchestrator>>,
    Query(query): Query<ReleaseQuery>,
) -> Result<Json<MessageResponse>, ApiError> {
    let message = match orchestrator.request_install(query.tag()).await {
        Ok(Dispatch::Started(task)) => {
            info!("Release {} being installed", task.release().version);
            "release being installed asynchronously".to_owned()
        }
        Ok(Dispatch::UpToDate(release)) => format!("{} is up-to-date", release.version),
        Err(e) => {
            warn!("Install request rejected: {e}");
            return Err(e.into());
        }
    };

    Ok(Json(MessageResponse { message }))
}
