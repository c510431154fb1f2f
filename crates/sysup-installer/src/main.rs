// SPDX-License-Identifier: CC-BY-NC-ND-4.0

//! sysup installer - entry point for the installer service

use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use sysup_installer::api::{self, API_PATH};
use sysup_installer::cache::PackageCache;
use sysup_installer::config::{self, AppConfig, DEFAULT_CONFIG_PATH, InstallerConfig};
use sysup_installer::installer::Installer;
use sysup_installer::notify;
use sysup_installer::reconciler::Reconciler;
use sysup_installer::registrar::Registrar;
use sysup_installer::release::HttpReleaseResolver;
use sysup_installer::shutdown::{CancelToken, Shutdown};
use sysup_installer::status::Stage;
use sysup_installer::version::OsRelease;
use sysup_installer::{Components, Orchestrator};
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Kept below the service manager's default stop timeout
const INSTALL_SHUTDOWN_GRACE: Duration = Duration::from_secs(80);

#[derive(Debug, Parser)]
#[command(name = "sysup-installer", disable_version_flag = true)]
struct Args {
    /// Config file path
    #[arg(short = 'c', long = "config", default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Print version and exit
    #[arg(short = 'v', long = "version")]
    version: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    if args.version {
        println!("v{}", env!("CARGO_PKG_VERSION"));
        return Ok(());
    }

    let config = config::load_or_create(&args.config)
        .with_context(|| format!("failed to load config {}", args.config.display()))?;

    init_logging(&config.app)?;
    info!("Starting sysup installer v{}", env!("CARGO_PKG_VERSION"));

    let shutdown = Shutdown::new();
    let orchestrator = Arc::new(build_orchestrator(&config, shutdown.token())?);
    orchestrator
        .status()
        .update_status_with_message(Stage::Idle, "up-to-date");

    // Finish migrations left by the previous install before anything else
    orchestrator.run_pending_migrations().await;

    let reconciler = Reconciler::new(Arc::clone(&orchestrator), config.update.check_interval())
        .spawn(shutdown.token());

    let listener = TcpListener::bind(&config.server.listen_address)
        .await
        .with_context(|| format!("failed to bind {}", config.server.listen_address))?;
    let address = listener.local_addr()?;

    spawn_registration(&config, address, Arc::clone(&orchestrator), shutdown.token())?;

    match notify::notify_ready() {
        Ok(true) => {
            info!("Notified service manager that installer is ready");
            let _ = notify::notify_status(&format!("listening on {address}"));
        }
        Ok(false) => info!("Not running under a service manager"),
        Err(e) => error!("Failed to notify service manager: {e}"),
    }

    let api_token = shutdown.token();
    tokio::spawn(wait_for_signal(shutdown));

    api::serve(listener, Arc::clone(&orchestrator), api_token)
        .await
        .context("installer API failed")?;

    let _ = notify::notify_stopping();
    if orchestrator.install_in_progress() {
        info!("Waiting for the running install to finish");
        let _ = notify::notify_status("waiting for install to finish");
    }
    if !orchestrator.wait_idle(INSTALL_SHUTDOWN_GRACE).await {
        warn!(
            "Install still running after {}s, exiting anyway",
            INSTALL_SHUTDOWN_GRACE.as_secs()
        );
    }

    if let Err(e) = reconciler.await {
        warn!("Reconciler task ended abnormally: {e}");
    }
    info!("Shutting down");
    Ok(())
}

fn build_orchestrator(config: &InstallerConfig, cancel: CancelToken) -> anyhow::Result<Orchestrator> {
    let update = &config.update;

    let resolver = HttpReleaseResolver::new(&update.metadata_url, &update.channel)?
        .with_token(update.token.clone());
    let cache = PackageCache::new(&update.cache_dir)?;
    let installer = Installer::new(
        &update.work_dir,
        &update.pending_migrations_file,
        Arc::new(config.backend.command_backend()),
    );

    Ok(Orchestrator::new(
        Components {
            resolver: Arc::new(resolver),
            versions: Arc::new(OsRelease::new(&update.sys_root)),
            cache,
            installer,
            sys_root: update.sys_root.clone(),
        },
        cancel,
    ))
}

fn init_logging(app: &AppConfig) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("sysup_installer=debug,info"));

    std::fs::create_dir_all(&app.log_path)
        .with_context(|| format!("failed to create {}", app.log_path.display()))?;
    let log_file = app.log_file();
    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_file)
        .with_context(|| format!("failed to open log file {}", log_file.display()))?;

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::sync::Mutex::new(file))
                .with_ansi(false),
        )
        .init();

    Ok(())
}

/// Gateway and message bus registration run in the background until they succeed
fn spawn_registration(
    config: &InstallerConfig,
    address: std::net::SocketAddr,
    orchestrator: Arc<Orchestrator>,
    cancel: CancelToken,
) -> anyhow::Result<()> {
    let registrar = Registrar::new(
        &config.common.runtime_path,
        config.registration.gateway_url.clone(),
        config.registration.message_bus_url.clone(),
        config.registration.retry_interval(),
    )?;

    let gateway = registrar.clone();
    let gateway_cancel = cancel.clone();
    tokio::spawn(async move {
        let target = format!("http://{address}");
        if let Err(e) = gateway
            .register_gateway(API_PATH, &target, &gateway_cancel)
            .await
        {
            warn!("Gateway registration stopped: {e}");
        }
    });

    tokio::spawn(async move {
        match registrar.register_message_bus(&cancel).await {
            Ok(client) => orchestrator.set_publisher(Arc::new(client)).await,
            Err(e) => warn!("Message bus registration stopped: {e}"),
        }
    });

    Ok(())
}

async fn wait_for_signal(shutdown: Shutdown) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for ctrl-c: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {e}");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("Received ctrl-c"),
        () = terminate => info!("Received SIGTERM"),
    }
    shutdown.cancel();
}
