use std::sync::Arc;

use tracing::{info, warn};

use super::{MemoryStorage, SqliteStorage, Storage};
use crate::config::{BackendKind, Config, StorageConfig};
use crate::error::{AppResult, StorageError, StorageResult};

/// Build the backend selected by `config`.
///
/// When SQLite fails to open and a different fallback backend is
/// configured, the fallback is built instead; otherwise the failure is
/// returned as [`StorageError::BackendInit`].
pub async fn new_storage(config: &StorageConfig) -> StorageResult<Arc<dyn Storage>> {
    match build(config.backend, config).await {
        Ok(storage) => Ok(storage),
        Err(primary) => match config.fallback {
            Some(fallback) if fallback != config.backend => {
                warn!(
                    backend = %config.backend,
                    fallback = %fallback,
                    error = %primary,
                    "Storage initialization failed, using fallback backend"
                );
                build(fallback, config)
                    .await
                    .map_err(|source| StorageError::BackendInit {
                        backend: fallback,
                        source: Box::new(source),
                    })
            }
            _ => Err(StorageError::BackendInit {
                backend: config.backend,
                source: Box::new(primary),
            }),
        },
    }
}

async fn build(kind: BackendKind, config: &StorageConfig) -> StorageResult<Arc<dyn Storage>> {
    match kind {
        BackendKind::Memory => {
            info!("Using in-memory storage");
            Ok(Arc::new(MemoryStorage::new()))
        }
        BackendKind::Sqlite => {
            info!(path = %config.sqlite_path.display(), "Using SQLite storage");
            Ok(Arc::new(SqliteStorage::new(config).await?))
        }
    }
}

/// Build the backend described by the process environment.
pub async fn new_storage_from_env() -> AppResult<Arc<dyn Storage>> {
    let config = Config::from_env()?;
    Ok(new_storage(&config.storage).await?)
}

/// Close a backend, logging instead of failing.
pub async fn close_storage(storage: &dyn Storage) {
    if let Err(e) = storage.close().await {
        warn!(error = %e, "Failed to close storage");
    }
}
