// SPDX-License-Identifier: CC-BY-NC-ND-4.0

//! On-disk package cache with SHA-256 verification
//!
//! Layout: `{cache_dir}/{version}/{package}` plus a `SHA256SUMS` manifest
//! (`<hex>  <name>` per line) written once every package of the version is in
//! place. Packages are streamed to a unique staging file, hashed while
//! writing, and renamed into place only after the digest matches.

use crate::error::{InstallerError, Result};
use crate::release::{Package, Release};
use crate::shutdown::CancelToken;
use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use futures_util::future::try_join_all;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use uuid::Uuid;

pub const CHECKSUMS_FILE: &str = "SHA256SUMS";

/// A mismatching download is fetched once more before giving up
const INTEGRITY_ATTEMPTS: u32 = 2;

const READ_BUFFER: usize = 64 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedPackage {
    pub version: String,
    pub module: String,
    pub path: PathBuf,
    pub sha256: String,
    pub verified_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct CachedRelease {
    pub version: String,
    pub dir: PathBuf,
    pub packages: Vec<CachedPackage>,
}

#[derive(Debug, Clone)]
pub struct PackageCache {
    client: reqwest::Client,
    cache_dir: PathBuf,
}

impl PackageCache {
    pub fn new(cache_dir: impl Into<PathBuf>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("sysup-installer/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| InstallerError::Download(format!("Failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            cache_dir: cache_dir.into(),
        })
    }

    pub fn release_dir(&self, version: &str) -> PathBuf {
        self.cache_dir.join(version)
    }

    /// Check every package of the release against its declared checksum.
    ///
    /// The on-disk file is re-hashed on every call.
    pub async fn verify_release(&self, release: &Release) -> Result<CachedRelease> {
        if release.packages.is_empty() {
            return Err(not_cached(release, "release has no packages"));
        }

        let dir = self.release_dir(&release.version);
        let mut packages = Vec::with_capacity(release.packages.len());
        for package in &release.packages {
            packages.push(self.verify_package(release, package).await?);
        }

        Ok(CachedRelease {
            version: release.version.clone(),
            dir,
            packages,
        })
    }

    async fn verify_package(&self, release: &Release, package: &Package) -> Result<CachedPackage> {
        let path = self.release_dir(&release.version).join(file_name(package)?);
        if !tokio::fs::try_exists(&path).await? {
            return Err(not_cached(release, &format!("{} is missing", package.name)));
        }

        let actual = sha256_file(&path).await?;
        let expected = normalize(&package.sha256);
        if actual != expected {
            tracing::warn!(
                "Cached {} does not match its checksum (expected {expected}, got {actual})",
                path.display()
            );
            return Err(not_cached(
                release,
                &format!("{} checksum mismatch", package.name),
            ));
        }

        Ok(CachedPackage {
            version: release.version.clone(),
            module: package.module.clone(),
            path,
            sha256: actual,
            verified_at: Utc::now(),
        })
    }

    /// Make every package of the release present and verified in the cache.
    ///
    /// Returns the release directory. Already verified packages are not
    /// fetched again. Foreground calls fetch packages concurrently, background
    /// calls one after another.
    pub async fn download_release(
        &self,
        release: &Release,
        background: bool,
        cancel: &CancelToken,
    ) -> Result<PathBuf> {
        if release.packages.is_empty() {
            return Err(InstallerError::Download(format!(
                "release {} has no packages",
                release.version
            )));
        }

        if let Ok(cached) = self.verify_release(release).await {
            tracing::info!("Release {} already cached", release.version);
            return Ok(cached.dir);
        }

        let dir = self.release_dir(&release.version);
        tokio::fs::create_dir_all(&dir).await?;

        let cached = if background {
            let mut cached = Vec::with_capacity(release.packages.len());
            for package in &release.packages {
                cached.push(self.ensure_package(release, package, cancel).await?);
            }
            cached
        } else {
            try_join_all(
                release
                    .packages
                    .iter()
                    .map(|package| self.ensure_package(release, package, cancel)),
            )
            .await?
        };

        write_checksums_manifest(&dir, release, &cached).await?;
        tracing::info!(
            "Release {} cached at {} ({} packages)",
            release.version,
            dir.display(),
            cached.len()
        );

        Ok(dir)
    }

    async fn ensure_package(
        &self,
        release: &Release,
        package: &Package,
        cancel: &CancelToken,
    ) -> Result<CachedPackage> {
        if let Ok(cached) = self.verify_package(release, package).await {
            tracing::debug!("{} already verified", cached.path.display());
            return Ok(cached);
        }

        let mut attempt = 1;
        loop {
            match self.download_package(release, package, cancel).await {
                Ok(cached) => return Ok(cached),
                Err(e) if e.is_integrity() && attempt < INTEGRITY_ATTEMPTS => {
                    tracing::warn!("{e}, downloading {} again", package.name);
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn download_package(
        &self,
        release: &Release,
        package: &Package,
        cancel: &CancelToken,
    ) -> Result<CachedPackage> {
        let dir = self.release_dir(&release.version);
        let name = file_name(package)?;
        let target = dir.join(name);
        let staging = Staging::new(dir.join(format!(".{name}.{}.part", Uuid::new_v4())));

        tracing::info!("Downloading {} from {}", package.name, package.url);

        let actual = self
            .stream_to_file(&package.url, staging.path(), cancel)
            .await?;

        let expected = normalize(&package.sha256);
        if actual != expected {
            return Err(InstallerError::ChecksumMismatch {
                name: package.name.clone(),
                expected,
                actual,
            });
        }

        staging.persist(&target).await?;

        Ok(CachedPackage {
            version: release.version.clone(),
            module: package.module.clone(),
            path: target,
            sha256: actual,
            verified_at: Utc::now(),
        })
    }

    async fn stream_to_file(&self, url: &str, path: &Path, cancel: &CancelToken) -> Result<String> {
        if cancel.is_cancelled() {
            return Err(InstallerError::Cancelled);
        }

        let response = tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(InstallerError::Cancelled),
            response = self.client.get(url).send() => response
                .map_err(|e| InstallerError::Download(format!("Request failed: {e}")))?,
        };

        if !response.status().is_success() {
            return Err(InstallerError::Download(format!(
                "Download of {url} failed with status: {}",
                response.status()
            )));
        }

        let mut file = tokio::fs::File::create(path).await?;
        let mut hasher = Sha256::new();
        let mut stream = response.bytes_stream();

        loop {
            let chunk = tokio::select! {
                biased;
                () = cancel.cancelled() => return Err(InstallerError::Cancelled),
                chunk = stream.next() => chunk,
            };

            match chunk {
                Some(Ok(bytes)) => {
                    hasher.update(&bytes);
                    file.write_all(&bytes).await?;
                }
                Some(Err(e)) => {
                    return Err(InstallerError::Download(format!(
                        "Failed to read body of {url}: {e}"
                    )));
                }
                None => break,
            }
        }

        file.flush().await?;
        file.sync_all().await?;

        Ok(format!("{:x}", hasher.finalize()))
    }

    /// Remove every cached version except `keep`. Returns how many were removed.
    pub async fn purge_except(&self, keep: &str) -> Result<usize> {
        if !tokio::fs::try_exists(&self.cache_dir).await? {
            return Ok(0);
        }

        let mut removed = 0;
        let mut entries = tokio::fs::read_dir(&self.cache_dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_name() == keep || !entry.file_type().await?.is_dir() {
                continue;
            }
            tracing::info!("Removing cached release {}", entry.path().display());
            tokio::fs::remove_dir_all(entry.path()).await?;
            removed += 1;
        }

        Ok(removed)
    }
}

/// SHA-256 of a file, read in chunks
pub async fn sha256_file(path: &Path) -> Result<String> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0_u8; READ_BUFFER];

    loop {
        let read = file.read(&mut buffer).await?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }

    Ok(format!("{:x}", hasher.finalize()))
}

fn normalize(checksum: &str) -> String {
    checksum.trim().to_ascii_lowercase()
}

fn not_cached(release: &Release, reason: &str) -> InstallerError {
    InstallerError::NotCached {
        version: release.version.clone(),
        reason: reason.to_owned(),
    }
}

/// Package names come from remote metadata and must stay inside the cache
fn file_name(package: &Package) -> Result<&str> {
    let name = package.name.as_str();
    let valid = !name.is_empty()
        && name != "."
        && name != ".."
        && name != CHECKSUMS_FILE
        && !name.contains(['/', '\\']);
    if valid {
        Ok(name)
    } else {
        Err(InstallerError::Download(format!(
            "invalid package name: {name:?}"
        )))
    }
}

/// Partial download that is deleted when dropped unless persisted.
///
/// Covers early returns as well as futures dropped mid-stream, e.g. the
/// sibling downloads of a failed `try_join_all`.
#[derive(Debug)]
struct Staging {
    path: PathBuf,
    persisted: bool,
}

impl Staging {
    fn new(path: PathBuf) -> Self {
        Self {
            path,
            persisted: false,
        }
    }

    fn path(&self) -> &Path {
        &self.path
    }

    async fn persist(mut self, target: &Path) -> Result<()> {
        tokio::fs::rename(&self.path, target).await?;
        self.persisted = true;
        Ok(())
    }
}

impl Drop for Staging {
    fn drop(&mut self) {
        if self.persisted {
            return;
        }
        if let Err(e) = std::fs::remove_file(&self.path)
            && e.kind() != std::io::ErrorKind::NotFound
        {
            tracing::warn!("Failed to remove staging file {}: {e}", self.path.display());
        }
    }
}

async fn write_checksums_manifest(
    dir: &Path,
    release: &Release,
    cached: &[CachedPackage],
) -> Result<()> {
    let mut content = String::new();
    for (package, entry) in release.packages.iter().zip(cached) {
        content.push_str(&entry.sha256);
        content.push_str("  ");
        content.push_str(&package.name);
        content.push('\n');
    }

    // Atomic write
    let temp_path = dir.join(format!(".{CHECKSUMS_FILE}.{}.tmp", Uuid::new_v4()));
    tokio::fs::write(&temp_path, content).await?;
    tokio::fs::rename(&temp_path, dir.join(CHECKSUMS_FILE)).await?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shutdown::Shutdown;
    use mockito::Server;
    use std::io::Write;
    use std::time::Duration;
    use tempfile::TempDir;

    const PAYLOAD: &[u8] = b"release payload bytes";

    fn digest(data: &[u8]) -> String {
        format!("{:x}", Sha256::digest(data))
    }

    fn release_for(server_url: &str, checksum: &str) -> Release {
        Release::new("1.5.0", "main").with_package(Package {
            name: "rootfs.tar.gz".to_owned(),
            url: format!("{server_url}/rootfs.tar.gz"),
            sha256: checksum.to_owned(),
            module: "rootfs".to_owned(),
        })
    }

    fn staging_files(dir: &Path) -> Vec<String> {
        std::fs::read_dir(dir)
            .map(|entries| {
                entries
                    .filter_map(std::result::Result::ok)
                    .map(|e| e.file_name().to_string_lossy().into_owned())
                    .filter(|name| name.ends_with(".part"))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Body that sends one chunk and then stalls
    fn stalled_body(
        stall: Duration,
    ) -> impl Fn(&mut dyn std::io::Write) -> std::io::Result<()> + Send + Sync + 'static {
        move |w: &mut dyn std::io::Write| {
            w.write_all(b"first chunk")?;
            std::thread::sleep(stall);
            w.write_all(b" and the rest")
        }
    }

    async fn wait_for_staging(dir: &Path) -> Vec<String> {
        for _ in 0..300 {
            let files = staging_files(dir);
            if !files.is_empty() {
                return files;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("no staging file appeared in {}", dir.display());
    }

    #[tokio::test]
    async fn test_sha256_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("data");
        std::fs::write(&path, b"test data").unwrap();
        assert_eq!(sha256_file(&path).await.unwrap(), digest(b"test data"));
    }

    #[tokio::test]
    async fn test_verify_missing_release() {
        let dir = TempDir::new().unwrap();
        let cache = PackageCache::new(dir.path()).unwrap();
        let release = release_for("http://127.0.0.1:1", &digest(PAYLOAD));

        assert!(matches!(
            cache.verify_release(&release).await,
            Err(InstallerError::NotCached { .. })
        ));
    }

    #[tokio::test]
    async fn test_download_then_verify() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("GET", "/rootfs.tar.gz")
            .with_status(200)
            .with_body(PAYLOAD)
            .expect(1)
            .create_async()
            .await;

        let dir = TempDir::new().unwrap();
        let cache = PackageCache::new(dir.path()).unwrap();
        let release = release_for(&server.url(), &digest(PAYLOAD).to_uppercase());

        let path = cache
            .download_release(&release, false, &CancelToken::never())
            .await
            .unwrap();
        assert_eq!(path, dir.path().join("1.5.0"));
        assert_eq!(std::fs::read(path.join("rootfs.tar.gz")).unwrap(), PAYLOAD);

        let manifest = std::fs::read_to_string(path.join(CHECKSUMS_FILE)).unwrap();
        assert_eq!(manifest, format!("{}  rootfs.tar.gz\n", digest(PAYLOAD)));

        let cached = cache.verify_release(&release).await.unwrap();
        assert_eq!(cached.packages.len(), 1);
        assert_eq!(cached.packages[0].module, "rootfs");
        assert!(staging_files(&path).is_empty());

        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_verify_is_idempotent_and_does_not_download() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("GET", "/rootfs.tar.gz")
            .with_status(200)
            .with_body(PAYLOAD)
            .expect(1)
            .create_async()
            .await;

        let dir = TempDir::new().unwrap();
        let cache = PackageCache::new(dir.path()).unwrap();
        let release = release_for(&server.url(), &digest(PAYLOAD));

        cache
            .download_release(&release, true, &CancelToken::never())
            .await
            .unwrap();

        assert!(cache.verify_release(&release).await.is_ok());
        assert!(cache.verify_release(&release).await.is_ok());

        // re-invoking the download is a no-op
        cache
            .download_release(&release, true, &CancelToken::never())
            .await
            .unwrap();

        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_corrupted_cache_is_repaired() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("GET", "/rootfs.tar.gz")
            .with_status(200)
            .with_body(PAYLOAD)
            .expect(2)
            .create_async()
            .await;

        let dir = TempDir::new().unwrap();
        let cache = PackageCache::new(dir.path()).unwrap();
        let release = release_for(&server.url(), &digest(PAYLOAD));

        let path = cache
            .download_release(&release, false, &CancelToken::never())
            .await
            .unwrap();

        // flip one byte
        let file = path.join("rootfs.tar.gz");
        let mut bytes = std::fs::read(&file).unwrap();
        bytes[0] ^= 0xff;
        std::fs::write(&file, &bytes).unwrap();

        assert!(matches!(
            cache.verify_release(&release).await,
            Err(InstallerError::NotCached { .. })
        ));

        cache
            .download_release(&release, false, &CancelToken::never())
            .await
            .unwrap();
        assert_eq!(std::fs::read(&file).unwrap(), PAYLOAD);
        assert!(cache.verify_release(&release).await.is_ok());

        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_checksum_mismatch_retries_once_then_fails() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("GET", "/rootfs.tar.gz")
            .with_status(200)
            .with_body(b"tampered payload")
            .expect(2)
            .create_async()
            .await;

        let dir = TempDir::new().unwrap();
        let cache = PackageCache::new(dir.path()).unwrap();
        let release = release_for(&server.url(), &digest(PAYLOAD));

        let err = cache
            .download_release(&release, false, &CancelToken::never())
            .await
            .unwrap_err();
        assert!(err.is_integrity());

        let release_dir = dir.path().join("1.5.0");
        assert!(!release_dir.join("rootfs.tar.gz").exists());
        assert!(!release_dir.join(CHECKSUMS_FILE).exists());
        assert!(staging_files(&release_dir).is_empty());

        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_http_error_is_download_error() {
        let mut server = Server::new_async().await;
        let _mock = server
            .mock("GET", "/rootfs.tar.gz")
            .with_status(500)
            .create_async()
            .await;

        let dir = TempDir::new().unwrap();
        let cache = PackageCache::new(dir.path()).unwrap();
        let release = release_for(&server.url(), &digest(PAYLOAD));

        assert!(matches!(
            cache
                .download_release(&release, false, &CancelToken::never())
                .await,
            Err(InstallerError::Download(_))
        ));
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let dir = TempDir::new().unwrap();
        let cache = PackageCache::new(dir.path()).unwrap();
        let release = release_for("http://127.0.0.1:1", &digest(PAYLOAD));

        let shutdown = Shutdown::new();
        let token = shutdown.token();
        shutdown.cancel();

        assert!(matches!(
            cache.download_release(&release, false, &token).await,
            Err(InstallerError::Cancelled)
        ));
    }

    #[tokio::test]
    async fn test_cancel_mid_stream_removes_staging() {
        let mut server = Server::new_async().await;
        let _mock = server
            .mock("GET", "/rootfs.tar.gz")
            .with_status(200)
            .with_chunked_body(stalled_body(Duration::from_secs(2)))
            .create_async()
            .await;

        let dir = TempDir::new().unwrap();
        let cache = PackageCache::new(dir.path()).unwrap();
        let release = release_for(&server.url(), &digest(PAYLOAD));
        let release_dir = dir.path().join("1.5.0");

        let shutdown = Shutdown::new();
        let token = shutdown.token();
        let download = tokio::spawn({
            let cache = cache.clone();
            async move { cache.download_release(&release, false, &token).await }
        });

        assert_eq!(wait_for_staging(&release_dir).await.len(), 1);
        shutdown.cancel();

        assert!(matches!(
            download.await.unwrap(),
            Err(InstallerError::Cancelled)
        ));
        assert!(staging_files(&release_dir).is_empty());
    }

    #[tokio::test]
    async fn test_failed_package_removes_sibling_staging() {
        let mut server = Server::new_async().await;
        let _corrupt = server
            .mock("GET", "/a.bin")
            .with_status(200)
            .with_chunked_body(|w| {
                std::thread::sleep(Duration::from_millis(300));
                w.write_all(b"wrong bytes")
            })
            .create_async()
            .await;
        let _slow = server
            .mock("GET", "/b.bin")
            .with_status(200)
            .with_chunked_body(stalled_body(Duration::from_secs(3)))
            .create_async()
            .await;

        let package = |name: &str, module: &str| Package {
            name: name.to_owned(),
            url: format!("{}/{name}", server.url()),
            sha256: digest(name.as_bytes()),
            module: module.to_owned(),
        };
        let release = Release::new("1.5.0", "main")
            .with_package(package("a.bin", "a"))
            .with_package(package("b.bin", "b"));

        let dir = TempDir::new().unwrap();
        let cache = PackageCache::new(dir.path()).unwrap();

        let err = cache
            .download_release(&release, false, &CancelToken::never())
            .await
            .unwrap_err();
        assert!(err.is_integrity());

        let release_dir = dir.path().join("1.5.0");
        assert!(staging_files(&release_dir).is_empty());
        assert!(!release_dir.join("b.bin").exists());
    }

    #[tokio::test]
    async fn test_concurrent_downloads_of_same_release() {
        let mut server = Server::new_async().await;
        let _mock = server
            .mock("GET", "/rootfs.tar.gz")
            .with_status(200)
            .with_body(PAYLOAD)
            .create_async()
            .await;

        let dir = TempDir::new().unwrap();
        let cache = PackageCache::new(dir.path()).unwrap();
        let release = release_for(&server.url(), &digest(PAYLOAD));
        let token = CancelToken::never();

        let (a, b) = tokio::join!(
            cache.download_release(&release, false, &token),
            cache.download_release(&release, true, &token)
        );
        assert!(a.is_ok());
        assert!(b.is_ok());
        assert!(cache.verify_release(&release).await.is_ok());
        assert!(staging_files(&dir.path().join("1.5.0")).is_empty());
    }

    #[tokio::test]
    async fn test_invalid_package_name_rejected() {
        let dir = TempDir::new().unwrap();
        let cache = PackageCache::new(dir.path()).unwrap();
        let mut release = release_for("http://127.0.0.1:1", &digest(PAYLOAD));
        release.packages[0].name = "../escape".to_owned();

        assert!(matches!(
            cache
                .download_release(&release, false, &CancelToken::never())
                .await,
            Err(InstallerError::Download(_))
        ));
    }

    #[tokio::test]
    async fn test_purge_except() {
        let dir = TempDir::new().unwrap();
        for version in ["1.4.0", "1.5.0", "1.6.0"] {
            std::fs::create_dir_all(dir.path().join(version)).unwrap();
        }
        std::fs::write(dir.path().join("stray-file"), b"x").unwrap();

        let cache = PackageCache::new(dir.path()).unwrap();
        assert_eq!(cache.purge_except("1.6.0").await.unwrap(), 2);
        assert!(dir.path().join("1.6.0").exists());
        assert!(!dir.path().join("1.4.0").exists());
        assert!(dir.path().join("stray-file").exists());
    }
}
