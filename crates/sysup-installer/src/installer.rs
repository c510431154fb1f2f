// SPDX-License-Identifier: CC-BY-NC-ND-4.0

//! Extraction and installation of cached releases
//!
//! The actual system update (partition swap, package manager, ...) is behind
//! [`InstallBackend`]. This module only prepares the payload, calls the
//! backend in order, and keeps track of migrations that must run on the next
//! launch.

use crate::error::{InstallerError, Result};
use crate::release::{MigrationTool, Release};
use async_trait::async_trait;
use flate2::read::GzDecoder;
use serde::{Deserialize, Serialize};
use std::fmt::Debug;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

/// Privileged operations performed against a system root
#[async_trait]
pub trait InstallBackend: Send + Sync + Debug {
    /// Apply the extracted payload to the system root
    async fn install(&self, payload: &Path, sys_root: &Path) -> Result<()>;

    /// Enable a module after a successful install
    async fn enable_module(&self, module: &str, sys_root: &Path) -> Result<()>;

    /// Run a single migration script
    async fn migrate(&self, script: &Path, sys_root: &Path) -> Result<()>;
}

/// Backend that shells out to configured commands.
///
/// Templates are argv lists; `{payload}`, `{sys_root}`, `{module}` and
/// `{script}` are substituted in every argument. An empty template is a no-op.
#[derive(Debug, Clone, Default)]
pub struct CommandBackend {
    pub install_command: Vec<String>,
    pub enable_command: Vec<String>,
    pub migrate_command: Vec<String>,
}

impl CommandBackend {
    async fn run(
        template: &[String],
        vars: &[(&str, &str)],
        fail: fn(String) -> InstallerError,
    ) -> Result<()> {
        let Some((program, args)) = render(template, vars) else {
            return Ok(());
        };

        tracing::info!("Running {program} {}", args.join(" "));
        let output = tokio::process::Command::new(&program)
            .args(&args)
            .output()
            .await
            .map_err(|e| fail(format!("failed to start {program}: {e}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(fail(format!(
                "{program} exited with {}: {}",
                output.status,
                stderr.trim()
            )));
        }

        Ok(())
    }
}

fn render(template: &[String], vars: &[(&str, &str)]) -> Option<(String, Vec<String>)> {
    let mut rendered = template.iter().map(|arg| {
        vars.iter().fold(arg.clone(), |acc, (key, value)| {
            acc.replace(&format!("{{{key}}}"), value)
        })
    });
    let program = rendered.next()?;
    Some((program, rendered.collect()))
}

#[async_trait]
impl InstallBackend for CommandBackend {
    async fn install(&self, payload: &Path, sys_root: &Path) -> Result<()> {
        let payload = payload.to_string_lossy();
        let sys_root = sys_root.to_string_lossy();
        Self::run(
            &self.install_command,
            &[("payload", &payload), ("sys_root", &sys_root)],
            InstallerError::Install,
        )
        .await
    }

    async fn enable_module(&self, module: &str, sys_root: &Path) -> Result<()> {
        let sys_root = sys_root.to_string_lossy();
        Self::run(
            &self.enable_command,
            &[("module", module), ("sys_root", &sys_root)],
            InstallerError::Install,
        )
        .await
    }

    async fn migrate(&self, script: &Path, sys_root: &Path) -> Result<()> {
        let script = script.to_string_lossy();
        let sys_root = sys_root.to_string_lossy();
        Self::run(
            &self.migrate_command,
            &[("script", &script), ("sys_root", &sys_root)],
            InstallerError::Migration,
        )
        .await
    }
}

/// Migrations recorded by an install, run on the next launch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingMigrations {
    pub version: String,
    pub scripts: Vec<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct Installer {
    work_dir: PathBuf,
    pending_file: PathBuf,
    backend: Arc<dyn InstallBackend>,
}

impl Installer {
    /// `pending_file` is relative to the system root passed to each call
    pub fn new(
        work_dir: impl Into<PathBuf>,
        pending_file: impl Into<PathBuf>,
        backend: Arc<dyn InstallBackend>,
    ) -> Self {
        Self {
            work_dir: work_dir.into(),
            pending_file: pending_file.into(),
            backend,
        }
    }

    pub fn payload_dir(&self, release: &Release) -> PathBuf {
        self.work_dir.join(&release.version)
    }

    fn pending_path(&self, sys_root: &Path) -> PathBuf {
        let relative = self
            .pending_file
            .strip_prefix("/")
            .unwrap_or(&self.pending_file);
        sys_root.join(relative)
    }

    /// Unpack every package of a cached release into `{work_dir}/{version}/{module}`
    pub async fn extract_release(&self, path: &Path, release: &Release) -> Result<PathBuf> {
        if let Some(package) = release
            .packages
            .iter()
            .find(|package| !is_module_name(&package.module))
        {
            return Err(InstallerError::Extract(format!(
                "invalid module name {:?} for {}",
                package.module, package.name
            )));
        }

        let target = self.payload_dir(release);
        if tokio::fs::try_exists(&target).await? {
            tokio::fs::remove_dir_all(&target)
                .await
                .map_err(|e| InstallerError::Extract(format!("failed to clean workspace: {e}")))?;
        }

        for package in &release.packages {
            let archive = path.join(&package.name);
            let dest = target.join(&package.module);
            tracing::info!("Extracting {} into {}", archive.display(), dest.display());

            tokio::task::spawn_blocking(move || extract_tar_gz(&archive, &dest))
                .await
                .map_err(|e| InstallerError::Extract(format!("extraction task failed: {e}")))??;
        }

        Ok(target)
    }

    /// Install an extracted release, enable its modules and record migrations
    pub async fn install(&self, release: &Release, sys_root: &Path) -> Result<()> {
        let payload = self.payload_dir(release);
        if !tokio::fs::try_exists(&payload).await? {
            return Err(InstallerError::Install(format!(
                "release {} has not been extracted",
                release.version
            )));
        }

        self.backend.install(&payload, sys_root).await?;

        for module in release.modules() {
            tracing::info!("Enabling module {module}");
            self.backend.enable_module(module, sys_root).await?;
        }

        if !release.migrations.is_empty() {
            let scripts = release
                .migrations
                .iter()
                .map(|tool| migration_script(&payload, release, tool))
                .collect::<Result<Vec<_>>>()?;
            let pending = PendingMigrations {
                version: release.version.clone(),
                scripts,
            };
            self.write_pending(sys_root, &pending).await?;
            tracing::info!(
                "Recorded {} migrations for next launch",
                pending.scripts.len()
            );
        }

        Ok(())
    }

    /// Run migrations left pending by a previous install. No-op when none are pending.
    ///
    /// Completed scripts are dropped from the marker as they finish, so a failed
    /// launch resumes from the failing script.
    pub async fn migration_in_launch(&self, sys_root: &Path) -> Result<()> {
        let marker = self.pending_path(sys_root);
        if !tokio::fs::try_exists(&marker).await? {
            tracing::debug!("No pending migration");
            return Ok(());
        }

        let content = tokio::fs::read_to_string(&marker).await?;
        let mut pending: PendingMigrations = serde_json::from_str(&content)
            .map_err(|e| InstallerError::Migration(format!("unreadable marker: {e}")))?;

        tracing::info!(
            "Running {} pending migrations for {}",
            pending.scripts.len(),
            pending.version
        );

        while let Some(script) = pending.scripts.first().cloned() {
            if let Err(e) = self.backend.migrate(&script, sys_root).await {
                self.write_pending(sys_root, &pending).await?;
                return Err(e);
            }
            pending.scripts.remove(0);
        }

        tokio::fs::remove_file(&marker).await?;
        tracing::info!("Migration to {} complete", pending.version);
        Ok(())
    }

    async fn write_pending(&self, sys_root: &Path, pending: &PendingMigrations) -> Result<()> {
        let marker = self.pending_path(sys_root);
        if let Some(parent) = marker.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        // Atomic write
        let temp_path = marker.with_extension("tmp");
        tokio::fs::write(&temp_path, serde_json::to_string_pretty(pending)?).await?;
        tokio::fs::rename(&temp_path, &marker).await?;
        Ok(())
    }
}

/// Module names come from remote metadata and must map to one directory
fn is_module_name(module: &str) -> bool {
    let mut components = Path::new(module).components();
    matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(_)), None)
    ) && !module.contains('\\')
}

fn migration_script(payload: &Path, release: &Release, tool: &MigrationTool) -> Result<PathBuf> {
    if release.package(&tool.module).is_none() {
        return Err(InstallerError::Install(format!(
            "migration {} refers to unknown module {}",
            tool.path, tool.module
        )));
    }

    let relative = Path::new(&tool.path);
    let escapes = relative
        .components()
        .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
    if escapes || !is_module_name(&tool.module) {
        return Err(InstallerError::Install(format!(
            "invalid migration script path: {}/{}",
            tool.module, tool.path
        )));
    }
    Ok(payload.join(&tool.module).join(relative))
}

fn extract_tar_gz(archive: &Path, dest: &Path) -> Result<()> {
    let file = std::fs::File::open(archive)
        .map_err(|e| InstallerError::Extract(format!("{}: {e}", archive.display())))?;
    std::fs::create_dir_all(dest)
        .map_err(|e| InstallerError::Extract(format!("{}: {e}", dest.display())))?;

    let mut archive_reader = tar::Archive::new(GzDecoder::new(file));
    archive_reader.set_preserve_permissions(true);
    archive_reader
        .unpack(dest)
        .map_err(|e| InstallerError::Extract(format!("{}: {e}", archive.display())))
}
