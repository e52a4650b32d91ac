//! # Unified Thinking Storage
//!
//! Storage engine for a structured-reasoning application. It keeps
//! thoughts, branches, insights, validations and relationships, and serves
//! them back under concurrent load with search, pagination and recency
//! queries.
//!
//! ## Backends
//!
//! - **Memory**: concurrent tables with an inverted content index (LRU
//!   eviction plus a hot-word cache), a mode index and newest-first
//!   projections for deterministic pagination.
//! - **SQLite**: WAL-mode database with an FTS5 index and versioned schema,
//!   fronted by the memory backend as a write-through cache.
//!
//! ## Architecture
//!
//! ```text
//! caller → Arc<dyn Storage> → MemoryStorage
//!                           → SqliteStorage → MemoryStorage (cache)
//!                                           → SQLite (WAL + FTS5)
//! ```
//!
//! ## Example
//!
//! ```no_run
//! use unified_thinking_storage::config::StorageConfig;
//! use unified_thinking_storage::storage::{new_storage, ThinkingMode, Thought};
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let storage = new_storage(&StorageConfig::default()).await?;
//! let id = storage
//!     .store_thought(Thought::new("cats are great", ThinkingMode::Linear))
//!     .await?;
//! let hits = storage.search_thoughts("cats", None, 10, 0).await?;
//! assert_eq!(hits[0].id, id);
//! # Ok(())
//! # }
//! ```

/// Configuration loaded from environment variables.
pub mod config;
/// Error types and result aliases.
pub mod error;
/// Storage backends and the repository contract.
pub mod storage;

pub use config::Config;
pub use error::{AppError, AppResult, StorageError, StorageResult};
pub use storage::{new_storage, MemoryStorage, SqliteStorage, Storage};
