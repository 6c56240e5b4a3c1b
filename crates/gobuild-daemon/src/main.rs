#![forbid(unsafe_code)]
#![deny(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use gobuild_core::note::{NoteSigner, generate_key};
use gobuild_core::targets::Targets;
use gobuild_daemon::build::Executor;
use gobuild_daemon::config::Config;
use gobuild_daemon::coordinate::{Coordinator, ProductionRunner, Service};
use gobuild_daemon::http::{AppState, admin_router, router};
use gobuild_daemon::recent::RecentBuilds;
use gobuild_daemon::sdk::{HttpCatalog, SdkManager};
use gobuild_daemon::store::ArtifactStore;
use gobuild_daemon::sumlog::SumLog;
use gobuild_daemon::telemetry::Telemetry;

#[derive(Debug, Parser)]
#[command(name = "gobuild-daemon")]
#[command(about = "Reproducible Go build service with a transparency log")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the build service.
    Serve {
        /// Address for the public listener.
        #[arg(long, default_value = "localhost:8000")]
        listen_http: String,

        /// Address for the admin listener (/metrics).
        #[arg(long, default_value = "localhost:8001")]
        listen_admin: String,

        /// Tracing filter.
        #[arg(long, default_value = "info")]
        log: String,

        /// Path to the JSON configuration file; defaults apply
        /// without one.
        config: Option<PathBuf>,
    },
    /// Generate a signer/verifier key pair for the transparency log.
    Genkey {
        /// Key name, typically the service domain.
        name: String,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    match Args::parse().command {
        Command::Genkey { name } => {
            let (signer, verifier) = generate_key(&name)?;
            println!("signer key (keep secret, configure as signer_key):");
            println!("{signer}");
            println!("verifier key (publish, configure as verifier_key):");
            println!("{verifier}");
            Ok(())
        }
        Command::Serve {
            listen_http,
            listen_admin,
            log,
            config,
        } => serve(listen_http, listen_admin, log, config).await,
    }
}

async fn serve(
    listen_http: String,
    listen_admin: String,
    log_filter: String,
    config_path: Option<PathBuf>,
) -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(log_filter))
        .init();

    let config = match config_path {
        Some(path) => Config::load(&path)?,
        None => Config::default(),
    };

    // Builds need a clean absolute home: toolchain output refers to
    // paths under it, and home/tmp must exist and start empty.
    let mut home_dir = config.home_dir.clone();
    if home_dir.is_relative() {
        home_dir = std::env::current_dir()?.join(home_dir);
    }
    fs::create_dir_all(&home_dir)?;
    let home_dir = home_dir.canonicalize()?;
    let empty_dir = home_dir.join("tmp");
    if empty_dir.exists() {
        fs::remove_dir_all(&empty_dir)?;
    }
    fs::create_dir_all(&empty_dir)?;

    let store = ArtifactStore::open(&config.data_dir)?;

    let sum_log_file = if config.log_dir.is_empty() {
        None
    } else {
        fs::create_dir_all(&config.log_dir)?;
        Some(
            fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(PathBuf::from(&config.log_dir).join("sum.log"))?,
        )
    };

    // Startup verification is fatal on any inconsistency; corruption
    // is never silently repaired.
    let log = SumLog::open(&config.data_dir.join("sum"), sum_log_file)?;
    log.verify_startup(&store)?;
    tracing::info!(records = log.tree_size(), "transparency log verified");

    let signer = if config.signer_key.is_empty() {
        tracing::warn!("no signer key configured; /tlog will not be served");
        None
    } else {
        Some(NoteSigner::from_key(&config.signer_key)?)
    };

    let client = reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(30))
        .build()?;
    let sdk = SdkManager::open(
        config.sdk_dir.clone(),
        Box::new(HttpCatalog::new(client.clone())),
    )?;

    let executor = Executor {
        home_dir,
        empty_dir,
        goproxy: config.goproxy.clone(),
        environment: config.environment.clone(),
        run_prefix: config.run.clone(),
        build_gobin: config.build_gobin,
    };

    let max_builds = config.effective_max_builds();
    let service = Arc::new(Service {
        config,
        store,
        log,
        signer,
        sdk,
        targets: Targets::new(),
        recent: RecentBuilds::new(),
        telemetry: Telemetry::new(),
        executor,
        client,
    });
    service.replay_records()?;

    let coordinator = Arc::new(Coordinator::new(
        max_builds,
        Arc::new(ProductionRunner {
            service: service.clone(),
        }),
    ));
    let state = AppState {
        service: service.clone(),
        coordinator,
    };

    // On a termination signal, drain the transparency log writer so
    // the on-disk invariants hold, then exit.
    {
        let service = service.clone();
        tokio::spawn(async move {
            shutdown_signal().await;
            tracing::info!("termination signal received");
            service.log.shutdown();
        });
    }

    let admin_listener = tokio::net::TcpListener::bind(&listen_admin).await?;
    let admin_app = admin_router(state.clone());
    tokio::spawn(async move {
        if let Err(err) = axum::serve(admin_listener, admin_app).await {
            tracing::error!(error = %err, "admin listener failed");
        }
    });

    let listener = tokio::net::TcpListener::bind(&listen_http).await?;
    tracing::info!(http = %listen_http, admin = %listen_admin, max_builds, "listening");
    axum::serve(listener, router(state)).await?;
    Ok(())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        let mut term = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        {
            Ok(term) => term,
            Err(err) => {
                tracing::warn!(error = %err, "failed to install SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
