use anyhow::{Context, Result};
use axum::Router;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use std::{fs, io::ErrorKind, path::Path, str::FromStr, sync::Arc, time::Duration};
use tokio::{net::TcpListener, sync::watch};
use tracing_subscriber::EnvFilter;

use config::{AppConfig, StorageDriver};
use services::{
    access_token::AccessTokenSigner,
    cluster::{
        LeaseStore, NodeRegistry, PlacementService, RedisLeaseStore, ReplicationPlanner, health,
    },
    delivery::StreamingDelivery,
    metadata::MetadataStore,
    security::UploadLimits,
    storage::{LocalBackend, ObjectStoreBackend, StorageBackend, StorageService},
    upload::UploadService,
};
use state::AppState;

mod config;
mod errors;
mod handlers;
mod models;
mod routes;
mod services;
mod state;

const DEFAULT_S3_REGION: &str = "us-east-1";

#[tokio::main]
async fn main() -> Result<()> {
    // --- Logging setup ---
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // --- Parse config + migrate flag ---
    let (cfg, migrate) = AppConfig::from_env_and_args()?;

    tracing::info!(
        node_id = %cfg.node_id,
        storage_driver = ?cfg.storage_driver,
        cluster_enabled = cfg.cluster_enabled,
        peers = cfg.peers.len(),
        "Starting file-vault"
    );

    // --- Initialize SQLite connection ---
    let db_path = cfg
        .database_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("file:");
    if let Some(parent) = Path::new(db_path).parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            fs::create_dir_all(parent)?;
            tracing::info!("Created missing directory {:?}", parent);
        }
    }

    let options = SqliteConnectOptions::from_str(&cfg.database_url)?.create_if_missing(true);
    let db = Arc::new(
        SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .with_context(|| format!("connecting to {}", cfg.database_url))?,
    );
    let metadata = MetadataStore::new(db);
    metadata.migrate().await?;

    // --- Handle migration mode ---
    if migrate {
        tracing::info!("Database migration complete.");
        return Ok(()); // exit after migration
    }

    // --- Storage backend ---
    let backend = match cfg.storage_driver {
        StorageDriver::Local => {
            if !Path::new(&cfg.storage_dir).exists() {
                fs::create_dir_all(&cfg.storage_dir)?;
                tracing::info!("Created storage directory at {}", cfg.storage_dir);
            }
            StorageBackend::Local(LocalBackend::new(&cfg.storage_dir))
        }
        StorageDriver::S3 => {
            let bucket = cfg
                .s3_bucket
                .as_deref()
                .context("an S3 bucket is required for the s3 driver")?;
            let region = cfg.s3_region.as_deref().unwrap_or(DEFAULT_S3_REGION);
            StorageBackend::ObjectStore(ObjectStoreBackend::s3(bucket, region)?)
        }
    };
    let storage = StorageService::new(backend);

    // --- Cluster membership ---
    let lease: Option<Arc<dyn LeaseStore>> = if cfg.cluster_enabled {
        let url = cfg
            .redis_url
            .as_deref()
            .context("a Redis URL is required when clustering is enabled")?;
        let store: Arc<dyn LeaseStore> = Arc::new(RedisLeaseStore::connect(url).await?);
        Some(store)
    } else {
        None
    };
    let registry = Arc::new(NodeRegistry::new(&cfg.node_id, &cfg.peers, lease));
    let placement = PlacementService::new(registry.clone(), cfg.replication_factor);
    let http = reqwest::Client::new();
    let planner = ReplicationPlanner::new(placement.clone(), http.clone());

    // --- Core services ---
    let limits = UploadLimits {
        max_size_bytes: cfg.max_upload_bytes,
    };
    let uploads = UploadService::new(storage.clone(), metadata.clone(), planner, limits);
    let delivery = StreamingDelivery::new(metadata.clone(), storage.clone());
    let signer = AccessTokenSigner::new(cfg.signing_secret.as_bytes(), cfg.link_ttl_secs)
        .map_err(|e| anyhow::anyhow!("invalid signing secret: {e}"))?;

    let state = AppState {
        metadata,
        storage,
        uploads,
        delivery,
        placement,
        registry: registry.clone(),
        signer,
        public_base_url: cfg.public_base_url.clone(),
    };

    // --- Background loops ---
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let health_task = tokio::spawn(health::run_health_loop(
        registry.clone(),
        http,
        Duration::from_secs(cfg.health_interval_secs),
        shutdown_rx.clone(),
    ));
    let leader_task = registry
        .clustering_enabled()
        .then(|| tokio::spawn(health::run_leader_loop(registry.clone(), shutdown_rx)));

    // --- Build router ---
    let app: Router = routes::routes::routes(cfg.max_upload_bytes).with_state(state);

    // --- Start server ---
    let addr = cfg.addr();
    let listener = match TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(err)
            if err.kind() == ErrorKind::PermissionDenied
                && matches!(cfg.host.as_str(), "0.0.0.0" | "::") =>
        {
            let fallback_addr = format!("127.0.0.1:{}", cfg.port);
            tracing::warn!(
                "Permission denied binding to {} ({}). Falling back to {}",
                addr,
                err,
                fallback_addr
            );
            TcpListener::bind(&fallback_addr).await?
        }
        Err(err) => return Err(err.into()),
    };

    tracing::info!("Server listening on http://{}", listener.local_addr()?);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Stop the loops; the leader loop hands the lease back on its way out.
    let _ = shutdown_tx.send(true);
    let _ = health_task.await;
    if let Some(task) = leader_task {
        let _ = task.await;
    }
    tracing::info!("Shut down cleanly");

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}
