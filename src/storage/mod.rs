//! Trajectory persistence.
//!
//! The ingestion pipeline only needs two things from a store: the set of
//! known ids (`exists_batch`) and an atomic bulk insert (`insert_batch`).
//! Classification and statistics additionally read trajectories back and
//! keep one live [`ClassificationResult`] per trajectory.
//!
//! # Usage
//!
//! ```rust,ignore
//! use traj_lens::storage::{SqliteTrajectoryStore, TrajectoryStore};
//!
//! let store = SqliteTrajectoryStore::open("data/trajectories.db").await?;
//! let known = store.exists_batch().await?;
//! store.insert_batch(&batch).await?;
//! ```

pub mod database;
pub mod memory;
pub mod schema;

use std::collections::HashSet;

use async_trait::async_trait;
use thiserror::Error;

use crate::trajectory::{ClassificationResult, Trajectory};

pub use database::SqliteTrajectoryStore;
pub use memory::MemoryTrajectoryStore;

/// Errors that can occur during store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A JSON column could not be encoded or decoded.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Connection failed: {0}")]
    Connection(String),

    /// The store rejected a write (used by non-SQL backends).
    #[error("Write rejected: {0}")]
    WriteRejected(String),
}

/// Storage collaborator for trajectories and their classification results.
#[async_trait]
pub trait TrajectoryStore: Send + Sync {
    /// All trajectory ids currently stored.
    async fn exists_batch(&self) -> Result<HashSet<String>, StoreError>;

    /// Inserts every trajectory or none of them.
    async fn insert_batch(&self, batch: &[Trajectory]) -> Result<(), StoreError>;

    async fn get(&self, trajectory_id: &str) -> Result<Option<Trajectory>, StoreError>;

    /// All stored trajectories ordered by `trajectory_id`.
    async fn list_all(&self) -> Result<Vec<Trajectory>, StoreError>;

    async fn count(&self) -> Result<usize, StoreError>;

    /// Stores a classification, replacing any previous one for the trajectory.
    async fn save_analysis(&self, result: &ClassificationResult) -> Result<(), StoreError>;

    async fn get_analysis(
        &self,
        trajectory_id: &str,
    ) -> Result<Option<ClassificationResult>, StoreError>;

    async fn list_analyses(&self) -> Result<Vec<ClassificationResult>, StoreError>;
}
