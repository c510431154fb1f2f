// SPDX-License-Identifier: CC-BY-NC-ND-4.0

//! Error types for the installer crate

use thiserror::Error;

#[derive(Debug, Error)]
pub enum InstallerError {
    #[error("config error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("release not found")]
    ReleaseNotFound,

    #[error("release fetch failed: {0}")]
    Fetch(String),

    #[error("download failed: {0}")]
    Download(String),

    #[error("checksum mismatch for {name}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        name: String,
        expected: String,
        actual: String,
    },

    #[error("release {version} is not cached: {reason}")]
    NotCached { version: String, reason: String },

    #[error("operation cancelled")]
    Cancelled,

    #[error("extraction failed: {0}")]
    Extract(String),

    #[error("install failed: {0}")]
    Install(String),

    #[error("migration failed: {0}")]
    Migration(String),

    #[error("version parse error: {0}")]
    VersionParse(String),

    #[error("an install is already in progress")]
    InstallInProgress,

    #[error("release {candidate} cannot be installed directly over {running}")]
    NotUpgradable { candidate: String, running: String },

    #[error("invalid status transition: {0}")]
    InvalidTransition(String),

    #[error("registration failed: {0}")]
    Registration(String),
}

impl InstallerError {
    /// Integrity failures are retried once by the cache before giving up.
    pub fn is_integrity(&self) -> bool {
        matches!(self, Self::ChecksumMismatch { .. })
    }
}

pub type Result<T> = std::result::Result<T, InstallerError>;
