// SPDX-License-Identifier: CC-BY-NC-ND-4.0

//! Release metadata and resolution against the release server

use crate::error::{InstallerError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{StatusCode, Url};
use serde::{Deserialize, Serialize};
use std::fmt::Debug;

/// Tag meaning "most recent release on the default channel"
pub const LATEST: &str = "latest";

const USER_AGENT: &str = concat!("sysup-installer/", env!("CARGO_PKG_VERSION"));

/// One installable artifact of a release
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Package {
    /// File name in the cache (e.g., "rootfs-x86_64.tar.gz")
    pub name: String,
    /// Download URL
    pub url: String,
    /// Expected SHA-256 digest, lowercase hex
    pub sha256: String,
    /// Module the package installs
    pub module: String,
}

/// A migration script shipped inside a module payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationTool {
    pub module: String,
    /// Path relative to the extracted module directory
    pub path: String,
}

/// Immutable release descriptor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Release {
    pub version: String,
    #[serde(default)]
    pub channel: String,
    #[serde(default)]
    pub packages: Vec<Package>,
    #[serde(default)]
    pub migrations: Vec<MigrationTool>,
    /// Oldest running version that may install this release directly
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_upgradable_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub release_notes: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub published_at: Option<DateTime<Utc>>,
}

impl Release {
    pub fn new(version: impl Into<String>, channel: impl Into<String>) -> Self {
        Self {
            version: version.into(),
            channel: channel.into(),
            packages: Vec::new(),
            migrations: Vec::new(),
            min_upgradable_version: None,
            release_notes: None,
            published_at: None,
        }
    }

    pub fn with_package(mut self, package: Package) -> Self {
        self.packages.push(package);
        self
    }

    /// Get the package for a module
    pub fn package(&self, module: &str) -> Option<&Package> {
        self.packages.iter().find(|p| p.module == module)
    }

    /// Distinct modules in package order
    pub fn modules(&self) -> Vec<&str> {
        let mut modules: Vec<&str> = Vec::new();
        for package in &self.packages {
            if !modules.contains(&package.module.as_str()) {
                modules.push(&package.module);
            }
        }
        modules
    }
}

/// Resolves a channel or version tag to a release
#[async_trait]
pub trait ReleaseResolver: Send + Sync + Debug {
    /// One attempt, no internal retry
    async fn get_release(&self, tag: &str) -> Result<Release>;
}

/// Release server client: `{base_url}/{tag}/release.json`
#[derive(Debug, Clone)]
pub struct HttpReleaseResolver {
    client: reqwest::Client,
    base_url: Url,
    default_channel: String,
    token: Option<String>,
}

impl HttpReleaseResolver {
    pub fn new(base_url: impl Into<String>, default_channel: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| InstallerError::Fetch(format!("Failed to build HTTP client: {e}")))?;

        let base_url = base_url.into();
        let base_url = Url::parse(&base_url)
            .map_err(|e| InstallerError::Config(format!("invalid metadata url {base_url}: {e}")))?;
        if base_url.cannot_be_a_base() {
            return Err(InstallerError::Config(format!(
                "metadata url {base_url} cannot be a base"
            )));
        }

        Ok(Self {
            client,
            base_url,
            default_channel: default_channel.into(),
            token: None,
        })
    }

    /// Set authentication token for private channels
    pub fn with_token(mut self, token: Option<String>) -> Self {
        self.token = token;
        self
    }

    fn resolve_tag<'a>(&'a self, tag: &'a str) -> &'a str {
        let tag = tag.trim();
        if tag.is_empty() || tag == LATEST {
            &self.default_channel
        } else {
            tag
        }
    }

    /// `{base_url}/{tag}/release.json` with the tag kept as one path segment
    fn release_url(&self, tag: &str) -> Result<Url> {
        if matches!(tag, "." | "..") {
            return Err(InstallerError::ReleaseNotFound);
        }

        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|()| InstallerError::Config(format!("{} cannot be a base", self.base_url)))?
            .pop_if_empty()
            .push(tag)
            .push("release.json");
        Ok(url)
    }
}

#[async_trait]
impl ReleaseResolver for HttpReleaseResolver {
    async fn get_release(&self, tag: &str) -> Result<Release> {
        let tag = self.resolve_tag(tag);
        let url = self.release_url(tag)?;
        tracing::debug!("Fetching release metadata from {url}");

        let mut request = self.client.get(url);
        if let Some(ref token) = self.token {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .map_err(|e| InstallerError::Fetch(format!("Request failed: {e}")))?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Err(InstallerError::ReleaseNotFound);
        }
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Failed to read error body".to_owned());
            return Err(InstallerError::Fetch(format!(
                "Release server error {status}: {body}"
            )));
        }

        let mut release: Release = response
            .json()
            .await
            .map_err(|e| InstallerError::Fetch(format!("Failed to parse release: {e}")))?;

        if release.channel.is_empty() {
            tag.clone_into(&mut release.channel);
        }

        Ok(release)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Server;
    use serde_json::json;

    fn release_body(version: &str) -> String {
        json!({
            "version": version,
            "packages": [{
                "name": "rootfs.tar.gz",
                "url": "https://example.com/rootfs.tar.gz",
                "sha256": "abc123",
                "module": "rootfs"
            }],
            "migrations": [{"module": "rootfs", "path": "migrate.sh"}]
        })
        .to_string()
    }

    #[test]
    fn test_release_modules_dedup() {
        let package = |name: &str, module: &str| Package {
            name: name.to_owned(),
            url: format!("https://example.com/{name}"),
            sha256: String::new(),
            module: module.to_owned(),
        };
        let release = Release::new("1.0.0", "main")
            .with_package(package("a.tar.gz", "core"))
            .with_package(package("b.tar.gz", "ui"))
            .with_package(package("c.tar.gz", "core"));

        assert_eq!(release.modules(), vec!["core", "ui"]);
        assert_eq!(release.package("ui").unwrap().name, "b.tar.gz");
        assert!(release.package("missing").is_none());
    }

    #[tokio::test]
    async fn test_get_release_latest_uses_default_channel() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("GET", "/main/release.json")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(release_body("1.5.0"))
            .create_async()
            .await;

        let resolver = HttpReleaseResolver::new(server.url(), "main").unwrap();
        let release = resolver.get_release(LATEST).await.unwrap();

        assert_eq!(release.version, "1.5.0");
        assert_eq!(release.channel, "main");
        assert_eq!(release.packages.len(), 1);
        assert_eq!(release.migrations[0].path, "migrate.sh");

        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_get_release_explicit_tag() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("GET", "/dev-test/release.json")
            .with_status(200)
            .with_body(release_body("1.6.0-rc.1"))
            .create_async()
            .await;

        let resolver = HttpReleaseResolver::new(format!("{}/", server.url()), "main").unwrap();
        let release = resolver.get_release("dev-test").await.unwrap();
        assert_eq!(release.version, "1.6.0-rc.1");
        assert_eq!(release.channel, "dev-test");

        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_get_release_not_found() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("GET", "/nonexistent-tag/release.json")
            .with_status(404)
            .expect(1)
            .create_async()
            .await;

        let resolver = HttpReleaseResolver::new(server.url(), "main").unwrap();
        let result = resolver.get_release("nonexistent-tag").await;
        assert!(matches!(result, Err(InstallerError::ReleaseNotFound)));

        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_tag_stays_one_path_segment() {
        let mut server = Server::new_async().await;
        let outside = server
            .mock("GET", "/evil/release.json")
            .with_status(200)
            .with_body(release_body("9.9.9"))
            .expect(0)
            .create_async()
            .await;
        let encoded = server
            .mock("GET", "/..%2Fevil/release.json")
            .with_status(404)
            .expect(1)
            .create_async()
            .await;

        let resolver = HttpReleaseResolver::new(format!("{}/main-base", server.url()), "main")
            .unwrap();
        assert_eq!(
            resolver.release_url("../evil").unwrap().path(),
            "/main-base/..%2Fevil/release.json"
        );

        let resolver = HttpReleaseResolver::new(server.url(), "main").unwrap();
        assert!(matches!(
            resolver.get_release("../evil").await,
            Err(InstallerError::ReleaseNotFound)
        ));
        assert!(matches!(
            resolver.get_release("..").await,
            Err(InstallerError::ReleaseNotFound)
        ));

        outside.assert_async().await;
        encoded.assert_async().await;
    }

    #[test]
    fn test_invalid_base_url_rejected() {
        assert!(matches!(
            HttpReleaseResolver::new("not a url", "main"),
            Err(InstallerError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_get_release_server_error_single_attempt() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("GET", "/main/release.json")
            .with_status(503)
            .with_body("maintenance")
            .expect(1)
            .create_async()
            .await;

        let resolver = HttpReleaseResolver::new(server.url(), "main").unwrap();
        let err = resolver.get_release(LATEST).await.unwrap_err();
        assert!(matches!(err, InstallerError::Fetch(_)));
        assert!(err.to_string().contains("maintenance"));

        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_get_release_bad_json() {
        let mut server = Server::new_async().await;
        let _mock = server
            .mock("GET", "/main/release.json")
            .with_status(200)
            .with_body("{not json")
            .create_async()
            .await;

        let resolver = HttpReleaseResolver::new(server.url(), "main").unwrap();
        assert!(matches!(
            resolver.get_release(LATEST).await,
            Err(InstallerError::Fetch(_))
        ));
    }

    #[tokio::test]
    async fn test_get_release_with_token() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("GET", "/staging/release.json")
            .match_header("authorization", "Bearer test-token")
            .with_status(200)
            .with_body(release_body("1.5.0"))
            .create_async()
            .await;

        let resolver = HttpReleaseResolver::new(server.url(), "staging")
            .unwrap()
            .with_token(Some("test-token".to_owned()));
        assert!(resolver.get_release(LATEST).await.is_ok());

        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_get_release_unreachable() {
        let resolver = HttpReleaseResolver::new("http://127.0.0.1:1", "main").unwrap();
        assert!(matches!(
            resolver.get_release(LATEST).await,
            Err(InstallerError::Fetch(_))
        ));
    }
}
