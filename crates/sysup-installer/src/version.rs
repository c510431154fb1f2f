// SPDX-License-Identifier: CC-BY-NC-ND-4.0

//! Version parsing and upgrade eligibility
//!
//! Decisions here are pure functions of the running version and the candidate
//! release, so they can be called from any task without coordination.

use crate::error::{InstallerError, Result};
use crate::release::Release;
use crate::status::PackageStatus;
use semver::Version;
use std::fmt::Debug;
use std::path::{Path, PathBuf};

/// Parse a semantic version, tolerating a leading "v" (e.g., "v1.2.3")
pub fn parse_version(s: &str) -> Result<Version> {
    let trimmed = s.trim().trim_start_matches('v').trim_start_matches('V');
    Version::parse(trimmed)
        .map_err(|e| InstallerError::VersionParse(format!("invalid version {s:?}: {e}")))
}

/// Returns true if `candidate` is strictly newer than `running`
pub fn is_newer(running: &str, candidate: &str) -> Result<bool> {
    Ok(parse_version(candidate)? > parse_version(running)?)
}

/// Where the currently running system version comes from
pub trait VersionSource: Send + Sync + Debug {
    fn running_version(&self) -> Result<String>;
}

/// A version known up front (embedding, tests)
#[derive(Debug, Clone)]
pub struct FixedVersion(String);

impl FixedVersion {
    pub fn new(version: impl Into<String>) -> Self {
        Self(version.into())
    }
}

impl VersionSource for FixedVersion {
    fn running_version(&self) -> Result<String> {
        Ok(self.0.clone())
    }
}

/// Reads `VERSION_ID` from `<sys_root>/etc/os-release`
#[derive(Debug, Clone)]
pub struct OsRelease {
    path: PathBuf,
}

impl OsRelease {
    pub fn new(sys_root: &Path) -> Self {
        Self {
            path: sys_root.join("etc").join("os-release"),
        }
    }
}

impl VersionSource for OsRelease {
    fn running_version(&self) -> Result<String> {
        let content = std::fs::read_to_string(&self.path)?;
        parse_os_release_version(&content).ok_or_else(|| {
            InstallerError::VersionParse(format!("no VERSION_ID in {}", self.path.display()))
        })
    }
}

fn parse_os_release_version(content: &str) -> Option<String> {
    content.lines().find_map(|line| {
        let value = line.trim().strip_prefix("VERSION_ID=")?;
        let value = value.trim_matches(|c| c == '"' || c == '\'');
        (!value.is_empty()).then(|| value.to_owned())
    })
}

/// True iff the release is strictly newer than the running system
pub fn should_upgrade(release: &Release, source: &dyn VersionSource) -> Result<bool> {
    let running = source.running_version()?;
    is_newer(&running, &release.version)
}

/// True iff the release is newer and reachable by a supported upgrade hop.
///
/// A release may declare `min_upgradable_version`; otherwise the major
/// version may advance by at most one.
pub fn is_upgradable(release: &Release, source: &dyn VersionSource) -> Result<bool> {
    let running = parse_version(&source.running_version()?)?;
    let candidate = parse_version(&release.version)?;

    if candidate <= running {
        return Ok(false);
    }

    if let Some(ref min) = release.min_upgradable_version {
        return Ok(running >= parse_version(min)?);
    }

    Ok(candidate.major <= running.major + 1)
}

/// Package status summary for a release. Fails closed to `UpToDate`.
pub fn verdict(release: &Release, source: &dyn VersionSource) -> PackageStatus {
    match should_upgrade(release, source) {
        Ok(false) => PackageStatus::UpToDate,
        Ok(true) => match is_upgradable(release, source) {
            Ok(true) => PackageStatus::ReadyToUpdate,
            Ok(false) => PackageStatus::OutOfDate,
            Err(e) => {
                tracing::warn!("Upgradability check failed for {}: {e}", release.version);
                PackageStatus::OutOfDate
            }
        },
        Err(e) => {
            tracing::warn!("Version comparison failed for {}: {e}", release.version);
            PackageStatus::UpToDate
        }
    }
}
