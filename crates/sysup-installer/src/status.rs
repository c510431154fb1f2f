// SPDX-License-Identifier: CC-BY-NC-ND-4.0

//! In-memory install status, the single source of truth for "what is the
//! installer doing right now".
//!
//! Pipeline runs never write the status directly. They obtain a
//! [`StatusWriter`] which enforces begin/end pairing for the run and only
//! reaches the shared status while the run owns the tracker. A manual run
//! takes ownership unconditionally; any other run only gets it when the
//! tracker is free, otherwise its writes are dropped.

use crate::error::{InstallerError, Result};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::sync::broadcast;

const EVENT_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Stage {
    Idle,
    FetchUpdateBegin,
    FetchUpdateEnd,
    DownloadBegin,
    DownloadEnd,
    InstallBegin,
    InstallEnd,
}

impl Stage {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::FetchUpdateBegin => "fetch-update-begin",
            Self::FetchUpdateEnd => "fetch-update-end",
            Self::DownloadBegin => "download-begin",
            Self::DownloadEnd => "download-end",
            Self::InstallBegin => "install-begin",
            Self::InstallEnd => "install-end",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A bracketed pipeline stage
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    FetchUpdate,
    Download,
    Install,
}

impl Phase {
    pub fn begin(self) -> Stage {
        match self {
            Self::FetchUpdate => Stage::FetchUpdateBegin,
            Self::Download => Stage::DownloadBegin,
            Self::Install => Stage::InstallBegin,
        }
    }

    pub fn end(self) -> Stage {
        match self {
            Self::FetchUpdate => Stage::FetchUpdateEnd,
            Self::Download => Stage::DownloadEnd,
            Self::Install => Stage::InstallEnd,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PackageStatus {
    UpToDate,
    ReadyToUpdate,
    OutOfDate,
}

impl PackageStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::UpToDate => "up-to-date",
            Self::ReadyToUpdate => "ready-to-update",
            Self::OutOfDate => "out-of-date",
        }
    }
}

impl fmt::Display for PackageStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Who triggered a pipeline run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Origin {
    /// Install requested over the API, takes over the status
    Manual,
    /// Reconciler tick
    Scheduled,
    /// Release lookup requested over the API, never takes over
    Check,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallStatus {
    pub status: Stage,
    pub message: String,
    pub package_status: PackageStatus,
    /// Set when an end stage closes a failed step
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl InstallStatus {
    fn initial() -> Self {
        Self {
            status: Stage::Idle,
            message: PackageStatus::UpToDate.as_str().to_owned(),
            package_status: PackageStatus::UpToDate,
            error: None,
            updated_at: Utc::now(),
        }
    }
}

#[derive(Debug)]
struct TrackerState {
    status: InstallStatus,
    owner: Option<u64>,
    next_run: u64,
}

#[derive(Debug)]
pub struct StatusTracker {
    state: RwLock<TrackerState>,
    events: broadcast::Sender<InstallStatus>,
}

impl StatusTracker {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            state: RwLock::new(TrackerState {
                status: InstallStatus::initial(),
                owner: None,
                next_run: 1,
            }),
            events,
        }
    }

    /// Current status and package status summary
    pub fn get_status(&self) -> (InstallStatus, PackageStatus) {
        let state = self.state.read();
        (state.status.clone(), state.status.package_status)
    }

    /// Every applied transition, in order
    pub fn subscribe(&self) -> broadcast::Receiver<InstallStatus> {
        self.events.subscribe()
    }

    /// Unconditional write, outside of any pipeline run (process start)
    pub fn update_status_with_message(&self, stage: Stage, message: impl Into<String>) {
        let snapshot = {
            let mut state = self.state.write();
            state.status.status = stage;
            state.status.message = message.into();
            state.status.error = None;
            state.status.updated_at = Utc::now();
            state.status.clone()
        };
        let _ = self.events.send(snapshot);
    }

    /// Open a writer for one pipeline run
    pub fn writer(self: &Arc<Self>, origin: Origin) -> StatusWriter {
        let (run, owns) = {
            let mut state = self.state.write();
            let run = state.next_run;
            state.next_run += 1;
            let owns = match origin {
                Origin::Manual => true,
                Origin::Scheduled | Origin::Check => state.owner.is_none(),
            };
            if owns {
                state.owner = Some(run);
            }
            (run, owns)
        };

        if !owns {
            tracing::debug!("Status is owned by another run, {origin:?} run {run} is muted");
        }

        StatusWriter {
            tracker: Arc::clone(self),
            run,
            open: None,
        }
    }

    /// Returns false if the run no longer owns the tracker
    fn apply(
        &self,
        run: u64,
        stage: Stage,
        message: String,
        package_status: Option<PackageStatus>,
        error: Option<String>,
    ) -> bool {
        let snapshot = {
            let mut state = self.state.write();
            if state.owner != Some(run) {
                return false;
            }
            state.status.status = stage;
            state.status.message = message;
            state.status.error = error;
            state.status.updated_at = Utc::now();
            if let Some(package_status) = package_status {
                state.status.package_status = package_status;
            }
            state.status.clone()
        };
        let _ = self.events.send(snapshot);
        true
    }

    fn release(&self, run: u64) {
        let mut state = self.state.write();
        if state.owner == Some(run) {
            state.owner = None;
        }
    }
}

impl Default for StatusTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Status handle for a single pipeline run
#[derive(Debug)]
pub struct StatusWriter {
    tracker: Arc<StatusTracker>,
    run: u64,
    open: Option<Phase>,
}

impl StatusWriter {
    pub fn begin(&mut self, phase: Phase, message: impl Into<String>) -> Result<()> {
        if let Some(open) = self.open {
            return Err(self.invalid(format!(
                "{} while {:?} is still open",
                phase.begin(),
                open
            )));
        }
        self.open = Some(phase);
        self.tracker
            .apply(self.run, phase.begin(), message.into(), None, None);
        Ok(())
    }

    pub fn end(&mut self, phase: Phase, message: impl Into<String>) -> Result<()> {
        self.close(phase, message.into(), None, None)
    }

    /// Close the fetch stage with a fresh package status summary
    pub fn end_fetch(&mut self, package_status: PackageStatus) -> Result<()> {
        self.close(
            Phase::FetchUpdate,
            package_status.as_str().to_owned(),
            Some(package_status),
            None,
        )
    }

    /// Close a stage that failed
    pub fn fail(&mut self, phase: Phase, error: impl Into<String>) -> Result<()> {
        let error = error.into();
        self.close(
            phase,
            format!("{} failed", phase.end()),
            None,
            Some(error),
        )
    }

    fn close(
        &mut self,
        phase: Phase,
        message: String,
        package_status: Option<PackageStatus>,
        error: Option<String>,
    ) -> Result<()> {
        if self.open != Some(phase) {
            return Err(self.invalid(format!(
                "{} without a matching {}",
                phase.end(),
                phase.begin()
            )));
        }
        self.open = None;
        self.tracker
            .apply(self.run, phase.end(), message, package_status, error);
        Ok(())
    }

    fn invalid(&self, detail: String) -> InstallerError {
        tracing::error!("Run {} attempted {detail}", self.run);
        InstallerError::InvalidTransition(detail)
    }
}

impl Drop for StatusWriter {
    fn drop(&mut self) {
        if let Some(phase) = self.open.take() {
            self.tracker.apply(
                self.run,
                phase.end(),
                format!("{} failed", phase.end()),
                None,
                Some("run aborted".to_owned()),
            );
        }
        self.tracker.release(self.run);
    }
}
