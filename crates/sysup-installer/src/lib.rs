// SPDX-License-Identifier: CC-BY-NC-ND-4.0

//! sysup installer - release lifecycle agent
//!
//! Periodically checks the release server for a newer system release, keeps
//! its packages cached and verified, and installs it on request. Status is
//! exposed over a small HTTP API and failures are announced on the message bus.

pub mod api;
pub mod cache;
pub mod config;
pub mod error;
pub mod events;
pub mod installer;
pub mod notify;
pub mod orchestrator;
pub mod reconciler;
pub mod registrar;
pub mod release;
pub mod retry;
pub mod shutdown;
pub mod status;
pub mod version;

pub use config::InstallerConfig;
pub use error::{InstallerError, Result};
pub use orchestrator::{Components, Dispatch, InstallTask, Orchestrator};
pub use release::{Release, ReleaseResolver};
pub use status::{InstallStatus, PackageStatus, Stage, StatusTracker};
pub use version::{is_newer, parse_version};
