//! Crawlspace API server binary.
//!
//! Exit codes: 0 on clean shutdown, 1 on fatal initialization failure
//! (metadata store, blob store, coordination store, or container runtime
//! unreachable).

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{info, warn};

use crawlspace_api::{serve, AppState, Config};
use crawlspace_core::{BlobStore, FsBlobStore, MemoryBlobStore, MemoryCoordStore};
use crawlspace_engine::{
    Engine, EngineConfig, MemoryMetaStore, MetaStore, OrchestratorConfig, PostgresMetaStore,
    ProcessRuntime,
};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("crawlspace_api=info".parse().expect("static directive"))
                .add_directive("crawlspace_engine=info".parse().expect("static directive")),
        )
        .init();

    info!("starting crawlspace api");
    let config = Config::from_env().context("configuration error")?;

    let meta: Arc<dyn MetaStore> = match &config.database_url {
        Some(url) => {
            info!("connecting to metadata store");
            Arc::new(
                PostgresMetaStore::connect(url)
                    .await
                    .context("metadata store unreachable")?,
            )
        }
        None => {
            warn!("CRAWLSPACE_DATABASE_URL not set; using in-memory metadata store");
            Arc::new(MemoryMetaStore::new())
        }
    };

    let blob: Arc<dyn BlobStore> = match &config.storage_dir {
        Some(dir) => Arc::new(FsBlobStore::new(dir.clone())),
        None => {
            warn!("CRAWLSPACE_STORAGE_DIR not set; using in-memory blob store");
            Arc::new(MemoryBlobStore::new())
        }
    };

    let coord = Arc::new(MemoryCoordStore::new());
    let runtime = Arc::new(ProcessRuntime::new());

    let engine = Engine::new(
        meta,
        blob,
        coord,
        runtime,
        EngineConfig {
            public_base_url: config.public_base_url.clone(),
            storage_root: config.storage_root.clone(),
            orchestrator: OrchestratorConfig {
                max_concurrent_runs: config.max_concurrent_runs,
                ..OrchestratorConfig::default()
            },
        },
    );
    engine
        .check_ready()
        .await
        .context("dependency check failed")?;

    let orchestrator = engine.start_orchestrator();

    let authenticator = AppState::authenticator_from_config(&config);
    if config.api_keys.is_empty() {
        warn!("no API keys provisioned; every request will be rejected");
    }
    let state = AppState::new(engine, authenticator);

    serve(state, config.http_port, shutdown_signal()).await?;

    info!("http server stopped; draining orchestrator");
    orchestrator.shutdown().await;
    info!("clean shutdown");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };
    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
    info!("shutdown signal received");
}
