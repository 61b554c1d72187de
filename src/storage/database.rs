//! SQLite-backed trajectory store.

use std::collections::HashSet;
use std::path::Path;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteRow, SqliteSynchronous,
};
use sqlx::{Row, SqlitePool};

use super::schema::all_schema_statements;
use super::{StoreError, TrajectoryStore};
use crate::trajectory::{ClassificationResult, Trajectory};

const TRAJECTORY_COLUMNS: &str = "trajectory_id, data_id, task, chat_completions, steps, \
     reward, toolcall_reward, res_reward, exec_time, \
     training_id, epoch_id, iteration_id, sample_id, tree_id, \
     agent_name, termination_reason, tags, notes, is_bookmarked, source, \
     created_at, updated_at";

#[derive(Clone)]
pub struct SqliteTrajectoryStore {
    pool: SqlitePool,
}

impl SqliteTrajectoryStore {
    /// Opens (creating if missing) the database at `path` and applies the schema.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| StoreError::Connection(format!("{}: {}", parent.display(), e)))?;
            }
        }

        let opts = SqliteConnectOptions::from_str(&format!("sqlite://{}", path.display()))?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal);

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(opts)
            .await
            .map_err(|e| StoreError::Connection(e.to_string()))?;

        for statement in all_schema_statements() {
            sqlx::query(statement).execute(&pool).await?;
        }

        tracing::info!(path = %path.display(), "Trajectory store opened");
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

fn trajectory_from_row(row: &SqliteRow) -> Result<Trajectory, StoreError> {
    let task: String = row.try_get("task")?;
    let chat_completions: String = row.try_get("chat_completions")?;
    let steps: String = row.try_get("steps")?;
    let tags: String = row.try_get("tags")?;

    Ok(Trajectory {
        trajectory_id: row.try_get("trajectory_id")?,
        data_id: row.try_get("data_id")?,
        task: serde_json::from_str(&task)?,
        chat_completions: serde_json::from_str(&chat_completions)?,
        steps: serde_json::from_str(&steps)?,
        reward: row.try_get("reward")?,
        toolcall_reward: row.try_get("toolcall_reward")?,
        res_reward: row.try_get("res_reward")?,
        exec_time: row.try_get("exec_time")?,
        training_id: row.try_get("training_id")?,
        epoch_id: row.try_get("epoch_id")?,
        iteration_id: row.try_get("iteration_id")?,
        sample_id: row.try_get("sample_id")?,
        tree_id: row.try_get("tree_id")?,
        agent_name: row.try_get("agent_name")?,
        termination_reason: row.try_get("termination_reason")?,
        tags: serde_json::from_str(&tags)?,
        notes: row.try_get("notes")?,
        is_bookmarked: row.try_get("is_bookmarked")?,
        source: row.try_get("source")?,
        created_at: row.try_get::<DateTime<Utc>, _>("created_at")?,
        updated_at: row.try_get::<DateTime<Utc>, _>("updated_at")?,
    })
}

fn analysis_from_row(row: &SqliteRow) -> Result<ClassificationResult, StoreError> {
    Ok(ClassificationResult {
        trajectory_id: row.try_get("trajectory_id")?,
        is_success: row.try_get("is_success")?,
        category: row.try_get("category")?,
        root_cause: row.try_get("root_cause")?,
        suggestion: row.try_get("suggestion")?,
        analyzed_at: row.try_get::<DateTime<Utc>, _>("analyzed_at")?,
    })
}

#[async_trait]
impl TrajectoryStore for SqliteTrajectoryStore {
    async fn exists_batch(&self) -> Result<HashSet<String>, StoreError> {
        let rows = sqlx::query("SELECT trajectory_id FROM trajectories")
            .fetch_all(&self.pool)
            .await?;
        rows.iter()
            .map(|row| row.try_get::<String, _>("trajectory_id").map_err(StoreError::from))
            .collect()
    }

    async fn insert_batch(&self, batch: &[Trajectory]) -> Result<(), StoreError> {
        if batch.is_empty() {
            return Ok(());
        }

        let mut tx = self.pool.begin().await?;
        let sql = format!(
            "INSERT INTO trajectories ({}) VALUES \
             (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20, ?21, ?22)",
            TRAJECTORY_COLUMNS
        );

        for trajectory in batch {
            sqlx::query(&sql)
                .bind(&trajectory.trajectory_id)
                .bind(&trajectory.data_id)
                .bind(serde_json::to_string(&trajectory.task)?)
                .bind(serde_json::to_string(&trajectory.chat_completions)?)
                .bind(serde_json::to_string(&trajectory.steps)?)
                .bind(trajectory.reward)
                .bind(trajectory.toolcall_reward)
                .bind(trajectory.res_reward)
                .bind(trajectory.exec_time)
                .bind(&trajectory.training_id)
                .bind(trajectory.epoch_id)
                .bind(trajectory.iteration_id)
                .bind(trajectory.sample_id)
                .bind(&trajectory.tree_id)
                .bind(&trajectory.agent_name)
                .bind(&trajectory.termination_reason)
                .bind(serde_json::to_string(&trajectory.tags)?)
                .bind(&trajectory.notes)
                .bind(trajectory.is_bookmarked)
                .bind(&trajectory.source)
                .bind(trajectory.created_at)
                .bind(trajectory.updated_at)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit().await?;
        tracing::debug!(count = batch.len(), "Inserted trajectory batch");
        Ok(())
    }

    async fn get(&self, trajectory_id: &str) -> Result<Option<Trajectory>, StoreError> {
        let sql = format!(
            "SELECT {} FROM trajectories WHERE trajectory_id = ?1",
            TRAJECTORY_COLUMNS
        );
        let row = sqlx::query(&sql)
            .bind(trajectory_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(trajectory_from_row).transpose()
    }

    async fn list_all(&self) -> Result<Vec<Trajectory>, StoreError> {
        let sql = format!(
            "SELECT {} FROM trajectories ORDER BY trajectory_id",
            TRAJECTORY_COLUMNS
        );
        let rows = sqlx::query(&sql).fetch_all(&self.pool).await?;
        rows.iter().map(trajectory_from_row).collect()
    }

    async fn count(&self) -> Result<usize, StoreError> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM trajectories")
            .fetch_one(&self.pool)
            .await?;
        let n: i64 = row.try_get("n")?;
        Ok(n.max(0) as usize)
    }

    async fn save_analysis(&self, result: &ClassificationResult) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO analysis_results (
                trajectory_id, is_success, category, root_cause, suggestion, analyzed_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ON CONFLICT (trajectory_id) DO UPDATE SET
                is_success = excluded.is_success,
                category = excluded.category,
                root_cause = excluded.root_cause,
                suggestion = excluded.suggestion,
                analyzed_at = excluded.analyzed_at
            "#,
        )
        .bind(&result.trajectory_id)
        .bind(result.is_success)
        .bind(&result.category)
        .bind(&result.root_cause)
        .bind(&result.suggestion)
        .bind(result.analyzed_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get_analysis(
        &self,
        trajectory_id: &str,
    ) -> Result<Option<ClassificationResult>, StoreError> {
        let row = sqlx::query("SELECT * FROM analysis_results WHERE trajectory_id = ?1")
            .bind(trajectory_id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(analysis_from_row).transpose()
    }

    async fn list_analyses(&self) -> Result<Vec<ClassificationResult>, StoreError> {
        let rows = sqlx::query("SELECT * FROM analysis_results ORDER BY trajectory_id")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(analysis_from_row).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trajectory::{Message, Step};

    async fn temp_store() -> (tempfile::TempDir, SqliteTrajectoryStore) {
        let dir = tempfile::tempdir().expect("temp dir");
        let store = SqliteTrajectoryStore::open(dir.path().join("nested/traj.db"))
            .await
            .expect("open store");
        (dir, store)
    }

    fn sample(id: &str) -> Trajectory {
        let mut t = Trajectory::new(id, "q1")
            .with_reward(1.0)
            .with_transcript(vec![Message::user("2+2?"), Message::assistant("4")])
            .with_steps(vec![Step {
                step_id: 1,
                reward: 0.5,
                observation: Some("ok".to_string()),
                ..Default::default()
            }]);
        t.tree_id = Some("0".to_string());
        t.tags = vec!["math".to_string()];
        t
    }

    #[tokio::test]
    async fn test_insert_and_read_back() {
        let (_dir, store) = temp_store().await;
        store
            .insert_batch(&[sample("q1-a-1-1-0-0"), sample("q1-a-1-1-1-0")])
            .await
            .expect("insert");

        assert_eq!(store.count().await.expect("count"), 2);
        let ids = store.exists_batch().await.expect("ids");
        assert!(ids.contains("q1-a-1-1-0-0"));

        let back = store
            .get("q1-a-1-1-1-0")
            .await
            .expect("get")
            .expect("present");
        assert_eq!(back.chat_completions.len(), 2);
        assert_eq!(back.steps[0].observation.as_deref(), Some("ok"));
        assert_eq!(back.tags, vec!["math".to_string()]);
        assert_eq!(back.tree_id.as_deref(), Some("0"));
    }

    #[tokio::test]
    async fn test_insert_batch_is_atomic() {
        let (_dir, store) = temp_store().await;
        store.insert_batch(&[sample("dup")]).await.expect("first insert");

        let result = store.insert_batch(&[sample("fresh"), sample("dup")]).await;
        assert!(result.is_err());
        assert_eq!(store.count().await.expect("count"), 1);
        assert!(store.get("fresh").await.expect("get").is_none());
    }

    #[tokio::test]
    async fn test_save_analysis_replaces() {
        let (_dir, store) = temp_store().await;
        let mut result = ClassificationResult {
            trajectory_id: "t1".to_string(),
            is_success: false,
            category: "1. Trajectory Anomaly (Loop)".to_string(),
            root_cause: "3.1 Repetitive Output / Repeater".to_string(),
            suggestion: "Add loop detection".to_string(),
            analyzed_at: Utc::now(),
        };
        store.save_analysis(&result).await.expect("save");
        result.category = "4. Model Capability Issue".to_string();
        store.save_analysis(&result).await.expect("replace");

        let all = store.list_analyses().await.expect("list");
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].category, "4. Model Capability Issue");
        assert!(store.get_analysis("missing").await.expect("get").is_none());
    }
}
