use anyhow::{Context, Result};
use axum::Router;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use std::{future::IntoFuture, io::ErrorKind, path::Path, str::FromStr, sync::Arc};
use tokio::{net::TcpListener, sync::mpsc, task::JoinHandle};
use tracing_subscriber::EnvFilter;

mod config;
mod errors;
mod handlers;
mod models;
mod routes;
mod services;

use config::{AppConfig, MetadataBackend};
use handlers::object_handlers::AppState;
use services::{
    blob_store::{BlobStore, FsBlobStore},
    clock::{Clock, SystemClock},
    error::StoreResult,
    metadata::{
        FileMetadataStore, MemoryMetadataStore, MetadataStore, RedisConfig, RedisMetadataStore,
        SqliteMetadataStore,
    },
    object_service::ObjectService,
    sweeper::Sweeper,
};

#[tokio::main]
async fn main() -> Result<()> {
    // --- Logging setup ---
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // --- Parse config + run mode ---
    let (cfg, mode) = AppConfig::from_env_and_args()?;

    tracing::info!("Starting tempstash with config: {:?}", cfg);

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    // --- Handle migration mode ---
    if mode.migrate {
        let store = connect_sqlite(&cfg, clock.clone()).await?;
        store.migrate().await?;
        tracing::info!("Database migration complete.");
        return Ok(()); // exit after migration
    }

    // --- Initialize backends ---
    let blobs: Arc<dyn BlobStore> = Arc::new(
        FsBlobStore::new(&cfg.storage_dir, clock.clone())
            .await
            .with_context(|| format!("opening storage directory {}", cfg.storage_dir))?,
    );
    let metadata = open_metadata_store(&cfg, clock.clone()).await?;
    tracing::info!(
        backend = metadata.backend_name(),
        "all storage services are operational"
    );

    let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
    let mut sweeper = Sweeper::new(
        blobs.clone(),
        metadata.clone(),
        clock.clone(),
        cfg.sweep_interval,
        shutdown_rx,
    )
    // Every write finishes within the request deadline, so older temp files
    // are abandoned.
    .with_partial_grace(cfg.request_timeout * 2);

    // --- Standalone cleaner mode ---
    if mode.sweep_only {
        let signal_tx = shutdown_tx.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                let _ = signal_tx.send(()).await;
            }
        });
        sweeper.run().await?;
        tracing::info!("sweeper exited");
        return Ok(());
    }

    let sweeper_task: Option<JoinHandle<StoreResult<()>>> = if mode.no_sweeper {
        tracing::info!("in-process sweeper disabled");
        None
    } else {
        Some(tokio::spawn(async move { sweeper.run().await }))
    };

    // --- Build router ---
    let state = AppState {
        service: ObjectService::new(blobs, metadata, clock),
        request_timeout: cfg.request_timeout,
        max_upload_bytes: cfg.max_upload_bytes,
    };
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
    let server = axum::serve(listener, app).with_graceful_shutdown(async {
        let _ = tokio::signal::ctrl_c().await;
        tracing::info!("shutdown signal received");
    });

    match sweeper_task {
        Some(mut task) => {
            tokio::select! {
                served = server.into_future() => {
                    served?;
                    let _ = shutdown_tx.send(()).await;
                    task.await??;
                }
                swept = &mut task => {
                    // The sweeper only returns on its own when enumeration failed.
                    swept??;
                    anyhow::bail!("sweeper stopped unexpectedly");
                }
            }
        }
        None => server.await?,
    }

    Ok(())
}

/// Open the metadata backend selected in the configuration.
async fn open_metadata_store(
    cfg: &AppConfig,
    clock: Arc<dyn Clock>,
) -> Result<Arc<dyn MetadataStore>> {
    let store: Arc<dyn MetadataStore> = match cfg.metadata_backend {
        MetadataBackend::Files => Arc::new(
            FileMetadataStore::new(&cfg.metadata_dir, clock)
                .await
                .with_context(|| format!("opening metadata directory {}", cfg.metadata_dir))?,
        ),
        MetadataBackend::Memory => Arc::new(MemoryMetadataStore::new(clock)),
        MetadataBackend::Sqlite => {
            let store = connect_sqlite(cfg, clock).await?;
            store.migrate().await?;
            Arc::new(store)
        }
        MetadataBackend::Redis => {
            let redis = RedisConfig {
                url: cfg.redis_url.clone(),
                prefix: cfg.redis_prefix.clone(),
                pool_size: cfg.redis_pool_size,
                ..RedisConfig::default()
            };
            let store = RedisMetadataStore::new(&redis, clock)?;
            store
                .health_check()
                .await
                .with_context(|| format!("connecting to redis at {}", cfg.redis_url))?;
            Arc::new(store)
        }
    };
    Ok(store)
}

/// Connect to the SQLite database, creating the file and its directory if needed.
async fn connect_sqlite(cfg: &AppConfig, clock: Arc<dyn Clock>) -> Result<SqliteMetadataStore> {
    let db_url = &cfg.database_url;
    tracing::debug!("Connecting using raw URL => {}", db_url);

    // Extract the local file path SQLx will use
    let db_path = db_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .trim_start_matches("file:");
    if let Some(parent) = Path::new(db_path).parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            std::fs::create_dir_all(parent)?;
            tracing::info!("Created missing directory {:?}", parent);
        }
    }

    let options = SqliteConnectOptions::from_str(db_url)?.create_if_missing(true);
    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await
        .with_context(|| format!("connecting to {}", db_url))?;

    Ok(SqliteMetadataStore::new(Arc::new(pool), clock))
}
