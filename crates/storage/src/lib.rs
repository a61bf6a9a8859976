//! Storage Layer
//!
//! Persistence contracts used by the correlation pipeline, with in-memory
//! backends:
//! - `Cache`: TTL key-value store for deduplication state
//! - `GroupRepository`: alert groups for recurring grouping

mod cache;
mod repository;

pub use cache::{Cache, MemoryCache};
pub use repository::{Group, GroupFilter, GroupRepository, MemoryGroupRepository};

use thiserror::Error;

/// Storage errors
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Backend error: {0}")]
    BackendError(String),
    #[error("Record not found")]
    NotFound,
    #[error("Serialization error: {0}")]
    SerializationError(String),
}
