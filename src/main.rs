use anyhow::{Context, Result};
use media_upload::{
    build_router,
    config::{AppConfig, SessionBackend},
    db,
    services::{CompensationPolicy, StorageLocation, UploadService},
    sessions::{MemorySessionStore, SessionStore, SqliteSessionStore},
    store::{DiskObjectStore, ObjectStore},
};
use std::{fs, io::ErrorKind, path::Path, sync::Arc};
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // --- Logging setup ---
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // --- Parse config + migrate flag ---
    let (cfg, migrate) = AppConfig::from_env_and_args()?;

    tracing::info!("Starting media-upload with config: {:?}", cfg);

    // --- Handle migration mode ---
    if migrate {
        let pool = db::connect(&cfg.database_url)
            .await
            .with_context(|| format!("connecting to {}", cfg.database_url))?;
        db::run_migrations(&pool).await?;
        tracing::info!("Database migration complete.");
        return Ok(()); // exit after migration
    }

    // --- Ensure storage directory exists ---
    if !Path::new(&cfg.storage_dir).exists() {
        fs::create_dir_all(&cfg.storage_dir)?;
        tracing::info!("Created storage directory at {}", cfg.storage_dir);
    }

    // --- Session store ---
    let sessions: Arc<dyn SessionStore> = match cfg.session_store {
        SessionBackend::Memory => Arc::new(MemorySessionStore::new()),
        SessionBackend::Sqlite => {
            tracing::debug!("Connecting using raw URL => {}", cfg.database_url);
            let pool = db::connect(&cfg.database_url)
                .await
                .with_context(|| format!("connecting to {}", cfg.database_url))?;
            db::run_migrations(&pool).await?;
            Arc::new(SqliteSessionStore::new(Arc::new(pool)))
        }
    };

    // --- Initialize core service ---
    let store: Arc<dyn ObjectStore> =
        Arc::new(DiskObjectStore::new(cfg.storage_dir.clone(), cfg.bucket.clone()));
    tracing::info!(
        "Using {} object store and {} session store",
        store.backend_tag(),
        sessions.backend_tag()
    );
    let service = UploadService::new(
        store,
        sessions,
        StorageLocation {
            bucket: cfg.bucket.clone(),
            region: cfg.region.clone(),
        },
    )
    .with_session_ttl(cfg.session_ttl)
    .with_compensation(CompensationPolicy {
        attempts: cfg.compensation_attempts,
        ..CompensationPolicy::default()
    });

    // --- Build router ---
    let app = build_router(service);

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
    axum::serve(listener, app).await?;

    Ok(())
}
