// SPDX-License-Identifier: CC-BY-NC-ND-4.0

//! Release lifecycle orchestration
//!
//! Both entry points (HTTP install requests and the reconciler) go through
//! this type: resolve, compare, download/verify, then extract and install.
//! Every stage is bracketed on the status tracker and terminal failures are
//! published on the message bus.

use crate::cache::PackageCache;
use crate::error::{InstallerError, Result};
use crate::events::{self, EventPublisher};
use crate::installer::Installer;
use crate::release::{LATEST, Release, ReleaseResolver};
use crate::shutdown::CancelToken;
use crate::status::{Origin, PackageStatus, Phase, StatusTracker, StatusWriter};
use crate::version::{self, VersionSource};
use parking_lot::Mutex as SyncMutex;
use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio::task::JoinHandle;

/// Collaborators the orchestrator drives
#[derive(Debug)]
pub struct Components {
    pub resolver: Arc<dyn ReleaseResolver>,
    pub versions: Arc<dyn VersionSource>,
    pub cache: PackageCache,
    pub installer: Installer,
    pub sys_root: PathBuf,
}

/// Events raised before the bus is registered are kept up to this many
const EVENT_BACKLOG: usize = 32;

/// Bus client, or the events waiting for it
#[derive(Debug, Default)]
struct EventSink {
    publisher: Option<Arc<dyn EventPublisher>>,
    backlog: VecDeque<(String, String)>,
}

/// Handle to a detached install pipeline
#[derive(Debug)]
pub struct InstallTask {
    release: Release,
    handle: JoinHandle<Result<()>>,
}

impl InstallTask {
    pub fn release(&self) -> &Release {
        &self.release
    }

    /// Wait for the pipeline to finish
    pub async fn wait(self) -> Result<()> {
        self.handle
            .await
            .map_err(|e| InstallerError::Install(format!("install task failed: {e}")))?
    }
}

/// Outcome of an install request
#[derive(Debug)]
pub enum Dispatch {
    /// Pipeline started in the background
    Started(InstallTask),
    /// Running version is already current, nothing to do
    UpToDate(Release),
}

#[derive(Debug)]
pub struct Orchestrator {
    resolver: Arc<dyn ReleaseResolver>,
    versions: Arc<dyn VersionSource>,
    cache: PackageCache,
    installer: Installer,
    sys_root: PathBuf,
    status: Arc<StatusTracker>,
    event_sink: SyncMutex<EventSink>,
    install_gate: Arc<Mutex<()>>,
    cancel: CancelToken,
}

impl Orchestrator {
    pub fn new(components: Components, cancel: CancelToken) -> Self {
        Self {
            resolver: components.resolver,
            versions: components.versions,
            cache: components.cache,
            installer: components.installer,
            sys_root: components.sys_root,
            status: Arc::new(StatusTracker::new()),
            event_sink: SyncMutex::new(EventSink::default()),
            install_gate: Arc::new(Mutex::new(())),
            cancel,
        }
    }

    pub fn status(&self) -> &Arc<StatusTracker> {
        &self.status
    }

    /// Swap in the bus client once registration succeeded and deliver
    /// the events raised before that
    pub async fn set_publisher(&self, publisher: Arc<dyn EventPublisher>) {
        let backlog = {
            let mut sink = self.event_sink.lock();
            sink.publisher = Some(Arc::clone(&publisher));
            std::mem::take(&mut sink.backlog)
        };

        if !backlog.is_empty() {
            tracing::info!("Publishing {} events raised before registration", backlog.len());
        }
        for (event, message) in backlog {
            deliver(publisher.as_ref(), &event, &message).await;
        }
    }

    pub fn install_in_progress(&self) -> bool {
        self.install_gate.try_lock().is_err()
    }

    /// Wait for a running install to release the gate.
    ///
    /// Returns false if it is still running after `timeout`.
    pub async fn wait_idle(&self, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, self.install_gate.lock())
            .await
            .is_ok()
    }

    /// Resolve a release and report whether it can be installed.
    ///
    /// Does not take over the status from a running install.
    pub async fn check_release(&self, tag: &str) -> Result<(Release, bool)> {
        let mut writer = self.status.writer(Origin::Check);
        writer.begin(Phase::FetchUpdate, "checking for updates")?;

        let release = match self.resolver.get_release(tag).await {
            Ok(release) => release,
            Err(e) => {
                return Err(self
                    .abort(&mut writer, Phase::FetchUpdate, events::CHECK_UPDATE_ERROR, e)
                    .await);
            }
        };

        let package_status = version::verdict(&release, self.versions.as_ref());
        writer.end_fetch(package_status)?;

        Ok((release, package_status == PackageStatus::ReadyToUpdate))
    }

    /// Start a manual install of `tag`.
    ///
    /// Rejected with `InstallInProgress` while another install holds the gate.
    /// The pipeline itself runs detached and is only cancelled by shutdown.
    pub async fn request_install(self: &Arc<Self>, tag: &str) -> Result<Dispatch> {
        let gate = Arc::clone(&self.install_gate)
            .try_lock_owned()
            .map_err(|_| InstallerError::InstallInProgress)?;

        let mut writer = self.status.writer(Origin::Manual);
        writer.begin(Phase::FetchUpdate, "install requested")?;

        let release = match self.resolver.get_release(tag).await {
            Ok(release) => release,
            Err(e) => {
                return Err(self
                    .abort(&mut writer, Phase::FetchUpdate, events::CHECK_UPDATE_ERROR, e)
                    .await);
            }
        };

        let package_status = version::verdict(&release, self.versions.as_ref());
        writer.end_fetch(package_status)?;

        match package_status {
            PackageStatus::UpToDate => {
                tracing::info!("Release {} is not newer, nothing to install", release.version);
                Ok(Dispatch::UpToDate(release))
            }
            PackageStatus::OutOfDate => Err(InstallerError::NotUpgradable {
                candidate: release.version,
                running: self
                    .versions
                    .running_version()
                    .unwrap_or_else(|_| "unknown".to_owned()),
            }),
            PackageStatus::ReadyToUpdate => {
                tracing::info!("Installing release {}", release.version);
                let handle = tokio::spawn(Arc::clone(self).run_install(
                    release.clone(),
                    writer,
                    gate,
                ));
                Ok(Dispatch::Started(InstallTask { release, handle }))
            }
        }
    }

    async fn run_install(
        self: Arc<Self>,
        release: Release,
        mut writer: StatusWriter,
        _gate: OwnedMutexGuard<()>,
    ) -> Result<()> {
        writer.begin(Phase::Download, format!("downloading {}", release.version))?;
        let path = match self
            .cache
            .download_release(&release, false, &self.cancel)
            .await
        {
            Ok(path) => path,
            Err(e) => {
                return Err(self
                    .abort(&mut writer, Phase::Download, events::DOWNLOAD_UPDATE_ERROR, e)
                    .await);
            }
        };
        writer.end(Phase::Download, PackageStatus::ReadyToUpdate.as_str())?;

        writer.begin(Phase::Install, format!("installing {}", release.version))?;
        let installed = async {
            self.installer.extract_release(&path, &release).await?;
            self.installer.install(&release, &self.sys_root).await
        }
        .await;
        if let Err(e) = installed {
            return Err(self
                .abort(&mut writer, Phase::Install, events::INSTALL_UPDATE_ERROR, e)
                .await);
        }

        match self.cache.purge_except(&release.version).await {
            Ok(0) => {}
            Ok(removed) => tracing::info!("Purged {removed} outdated cached releases"),
            Err(e) => tracing::warn!("Failed to purge cache: {e}"),
        }

        writer.end(
            Phase::Install,
            format!("{} installed, restart to apply", release.version),
        )?;
        tracing::info!("Release {} installed", release.version);
        Ok(())
    }

    /// Keep the cache warm for the default channel without installing
    pub async fn prewarm(&self) -> Result<PackageStatus> {
        let mut writer = self.status.writer(Origin::Scheduled);
        writer.begin(Phase::FetchUpdate, "scheduled check")?;

        let release = match self.resolver.get_release(LATEST).await {
            Ok(release) => release,
            Err(e) => {
                writer.fail(Phase::FetchUpdate, e.to_string())?;
                return Err(e);
            }
        };

        let package_status = version::verdict(&release, self.versions.as_ref());
        writer.end_fetch(package_status)?;

        if package_status == PackageStatus::UpToDate {
            tracing::info!("No need to upgrade, latest is {}", release.version);
            return Ok(package_status);
        }

        match self.cache.verify_release(&release).await {
            Ok(_) => {
                tracing::debug!("Release {} already cached", release.version);
                return Ok(package_status);
            }
            Err(e) => tracing::info!("Release {} not cached yet: {e}", release.version),
        }

        writer.begin(Phase::Download, format!("background download of {}", release.version))?;
        match self
            .cache
            .download_release(&release, true, &self.cancel)
            .await
        {
            Ok(path) => {
                tracing::info!("Cached release {} at {}", release.version, path.display());
                writer.end(Phase::Download, package_status.as_str())?;
                Ok(package_status)
            }
            Err(e) => {
                writer.fail(Phase::Download, e.to_string())?;
                Err(e)
            }
        }
    }

    /// Complete migrations left pending by a previous install
    pub async fn run_pending_migrations(&self) {
        if let Err(e) = self.installer.migration_in_launch(&self.sys_root).await {
            tracing::error!("Error when trying to start migration: {e}");
            self.publish(events::MIGRATION_ERROR, &e.to_string()).await;
        }
    }

    /// Close the stage as failed and publish the error, then hand it back
    async fn abort(
        &self,
        writer: &mut StatusWriter,
        phase: Phase,
        event: &str,
        error: InstallerError,
    ) -> InstallerError {
        tracing::error!("{} failed: {error}", phase.end());
        if let Err(e) = writer.fail(phase, error.to_string()) {
            tracing::error!("Could not record failure: {e}");
        }
        if !matches!(error, InstallerError::Cancelled) {
            self.publish(event, &error.to_string()).await;
        }
        error
    }

    async fn publish(&self, event: &str, message: &str) {
        let publisher = {
            let mut sink = self.event_sink.lock();
            if sink.publisher.is_none() {
                if sink.backlog.len() == EVENT_BACKLOG {
                    sink.backlog.pop_front();
                }
                sink.backlog.push_back((event.to_owned(), message.to_owned()));
                tracing::debug!("Message bus not registered yet, {event} queued");
            }
            sink.publisher.clone()
        };

        if let Some(publisher) = publisher {
            deliver(publisher.as_ref(), event, message).await;
        }
    }
}

async fn deliver(publisher: &dyn EventPublisher, event: &str, message: &str) {
    if let Err(e) = publisher.publish(event, message).await {
        tracing::warn!("Failed to publish {event}: {e}");
    }
}
