//! In-memory trajectory store for tests and dry runs.

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use tokio::sync::RwLock;

use super::{StoreError, TrajectoryStore};
use crate::trajectory::{ClassificationResult, Trajectory};

/// Keeps trajectories in ordered maps behind a [`RwLock`].
///
/// `insert_batch` rejects the whole batch when any id already exists, like the
/// SQLite primary key does. Individual insert calls can be made to fail with
/// [`MemoryTrajectoryStore::fail_insert_calls`].
#[derive(Debug, Default)]
pub struct MemoryTrajectoryStore {
    trajectories: RwLock<BTreeMap<String, Trajectory>>,
    analyses: RwLock<BTreeMap<String, ClassificationResult>>,
    insert_calls: AtomicUsize,
    failing_calls: HashSet<usize>,
}

impl MemoryTrajectoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the given 0-based `insert_batch` calls fail.
    pub fn fail_insert_calls(mut self, calls: impl IntoIterator<Item = usize>) -> Self {
        self.failing_calls = calls.into_iter().collect();
        self
    }

    /// Number of `insert_batch` calls made so far.
    pub fn insert_calls(&self) -> usize {
        self.insert_calls.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl TrajectoryStore for MemoryTrajectoryStore {
    async fn exists_batch(&self) -> Result<HashSet<String>, StoreError> {
        Ok(self.trajectories.read().await.keys().cloned().collect())
    }

    async fn insert_batch(&self, batch: &[Trajectory]) -> Result<(), StoreError> {
        let call = self.insert_calls.fetch_add(1, Ordering::Relaxed);
        if self.failing_calls.contains(&call) {
            return Err(StoreError::WriteRejected(format!(
                "insert call {} configured to fail",
                call
            )));
        }

        let mut map = self.trajectories.write().await;
        let mut batch_ids = HashSet::new();
        for t in batch {
            if map.contains_key(&t.trajectory_id) || !batch_ids.insert(t.trajectory_id.as_str()) {
                return Err(StoreError::WriteRejected(format!(
                    "duplicate trajectory_id {}",
                    t.trajectory_id
                )));
            }
        }
        for t in batch {
            map.insert(t.trajectory_id.clone(), t.clone());
        }
        Ok(())
    }

    async fn get(&self, trajectory_id: &str) -> Result<Option<Trajectory>, StoreError> {
        Ok(self.trajectories.read().await.get(trajectory_id).cloned())
    }

    async fn list_all(&self) -> Result<Vec<Trajectory>, StoreError> {
        Ok(self.trajectories.read().await.values().cloned().collect())
    }

    async fn count(&self) -> Result<usize, StoreError> {
        Ok(self.trajectories.read().await.len())
    }

    async fn save_analysis(&self, result: &ClassificationResult) -> Result<(), StoreError> {
        self.analyses
            .write()
            .await
            .insert(result.trajectory_id.clone(), result.clone());
        Ok(())
    }

    async fn get_analysis(
        &self,
        trajectory_id: &str,
    ) -> Result<Option<ClassificationResult>, StoreError> {
        Ok(self.analyses.read().await.get(trajectory_id).cloned())
    }

    async fn list_analyses(&self) -> Result<Vec<ClassificationResult>, StoreError> {
        Ok(self.analyses.read().await.values().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_duplicate_rejects_whole_batch() {
        let store = MemoryTrajectoryStore::new();
        store
            .insert_batch(&[Trajectory::new("a", "q")])
            .await
            .expect("insert");
        let err = store
            .insert_batch(&[Trajectory::new("b", "q"), Trajectory::new("a", "q")])
            .await;
        assert!(err.is_err());
        assert_eq!(store.count().await.expect("count"), 1);
    }

    #[tokio::test]
    async fn test_configured_failures() {
        let store = MemoryTrajectoryStore::new().fail_insert_calls([1]);
        assert!(store.insert_batch(&[Trajectory::new("a", "q")]).await.is_ok());
        assert!(store.insert_batch(&[Trajectory::new("b", "q")]).await.is_err());
        assert!(store.insert_batch(&[Trajectory::new("c", "q")]).await.is_ok());
        assert_eq!(store.insert_calls(), 3);
        assert_eq!(store.count().await.expect("count"), 2);
    }
}
