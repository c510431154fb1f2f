// SPDX-License-Identifier: CC-BY-NC-ND-4.0

#![allow(dead_code)]

use flate2::Compression;
use flate2::write::GzEncoder;
use mockito::{Mock, ServerGuard};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use sysup_installer::cache::PackageCache;
use sysup_installer::installer::{CommandBackend, Installer};
use sysup_installer::release::{HttpReleaseResolver, MigrationTool, Package};
use sysup_installer::shutdown::CancelToken;
use sysup_installer::version::FixedVersion;
use sysup_installer::{Components, Orchestrator, Release};

pub fn tar_gz(files: &[(&str, &[u8])]) -> Vec<u8> {
    let mut builder = tar::Builder::new(GzEncoder::new(Vec::new(), Compression::default()));
    for (name, content) in files {
        let mut header = tar::Header::new_gnu();
        header.set_size(content.len() as u64);
        header.set_mode(0o755);
        header.set_cksum();
        builder.append_data(&mut header, name, *content).unwrap();
    }
    builder.into_inner().unwrap().finish().unwrap()
}

pub fn sha256_hex(data: &[u8]) -> String {
    format!("{:x}", Sha256::digest(data))
}

/// Release with one `rootfs` package served from `/pkg/rootfs.tar.gz`
pub fn release(server: &ServerGuard, version: &str, payload: &[u8]) -> Release {
    Release::new(version, "main").with_package(Package {
        name: "rootfs.tar.gz".to_owned(),
        url: format!("{}/pkg/rootfs.tar.gz", server.url()),
        sha256: sha256_hex(payload),
        module: "rootfs".to_owned(),
    })
}

pub fn with_migration(mut release: Release, path: &str) -> Release {
    release.migrations.push(MigrationTool {
        module: "rootfs".to_owned(),
        path: path.to_owned(),
    });
    release
}

pub async fn serve_release(server: &mut ServerGuard, release: &Release) -> Mock {
    server
        .mock("GET", "/main/release.json")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(serde_json::to_string(release).unwrap())
        .create_async()
        .await
}

pub async fn serve_package(server: &mut ServerGuard, payload: Vec<u8>) -> Mock {
    server
        .mock("GET", "/pkg/rootfs.tar.gz")
        .with_status(200)
        .with_body(payload)
        .create_async()
        .await
}

pub struct Paths {
    pub cache: PathBuf,
    pub work: PathBuf,
    pub sys_root: PathBuf,
}

impl Paths {
    pub fn under(root: &Path) -> Self {
        let paths = Self {
            cache: root.join("cache"),
            work: root.join("work"),
            sys_root: root.join("sysroot"),
        };
        std::fs::create_dir_all(&paths.sys_root).unwrap();
        paths
    }
}

pub fn orchestrator(
    server: &ServerGuard,
    paths: &Paths,
    running: &str,
    backend: CommandBackend,
) -> Arc<Orchestrator> {
    let components = Components {
        resolver: Arc::new(HttpReleaseResolver::new(server.url(), "main").unwrap()),
        versions: Arc::new(FixedVersion::new(running)),
        cache: PackageCache::new(&paths.cache).unwrap(),
        installer: Installer::new(
            &paths.work,
            "var/lib/sysup/migration.pending.json",
            Arc::new(backend),
        ),
        sys_root: paths.sys_root.clone(),
    };
    Arc::new(Orchestrator::new(components, CancelToken::never()))
}
