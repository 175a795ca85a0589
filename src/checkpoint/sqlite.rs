use async_trait::async_trait;
use breachgraph_common::{RunId, RunState, RunSummary};
use rusqlite::{Connection, OptionalExtension, params};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::CheckpointStore;
use crate::errors::StoreError;

/// SQLite-backed checkpoint store.
///
/// The connection sits behind `Arc<Mutex>` and every statement runs on
/// tokio's blocking pool, so synchronous SQLite I/O never stalls async
/// workers. Version checks are expressed in the write statement itself
/// (`INSERT ... ON CONFLICT DO NOTHING` / `UPDATE ... WHERE version = ?`),
/// which makes them atomic across processes sharing the same file.
#[derive(Clone)]
pub struct SqliteCheckpointStore {
    conn: Arc<Mutex<Connection>>,
}

fn backend(err: rusqlite::Error, what: &'static str) -> StoreError {
    StoreError::Backend(anyhow::Error::new(err).context(what))
}

impl SqliteCheckpointStore {
    /// Open (or create) the database at `path` and ensure the schema exists.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let conn =
            Connection::open(path).map_err(|e| backend(e, "Failed to open checkpoint database"))?;
        Self::init(conn)
    }

    /// In-memory database (for testing).
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()
            .map_err(|e| backend(e, "Failed to open in-memory checkpoint database"))?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.busy_timeout(Duration::from_secs(5))
            .map_err(|e| backend(e, "Failed to set busy timeout"))?;
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS checkpoints (
                run_id TEXT PRIMARY KEY,
                version INTEGER NOT NULL,
                status TEXT NOT NULL,
                current_stage TEXT,
                state_json TEXT NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_checkpoints_updated ON checkpoints(updated_at);
            ",
        )
        .map_err(|e| backend(e, "Failed to create checkpoint tables"))?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run a closure against the connection on a blocking thread.
    async fn call<F, R>(&self, f: F) -> Result<R, StoreError>
    where
        F: FnOnce(&Connection) -> Result<R, StoreError> + Send + 'static,
        R: Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let guard = conn.lock().map_err(|e| {
                StoreError::Backend(anyhow::anyhow!("checkpoint db lock poisoned: {}", e))
            })?;
            f(&guard)
        })
        .await
        .map_err(|e| StoreError::Backend(anyhow::Error::new(e).context("checkpoint db task panicked")))?
    }
}

fn stored_version(conn: &Connection, run_id: &RunId) -> Result<Option<u64>, StoreError> {
    conn.query_row(
        "SELECT version FROM checkpoints WHERE run_id = ?1",
        params![run_id.as_str()],
        |row| row.get::<_, i64>(0),
    )
    .optional()
    .map(|v| v.map(|v| v as u64))
    .map_err(|e| backend(e, "Failed to read checkpoint version"))
}

#[async_trait]
impl CheckpointStore for SqliteCheckpointStore {
    async fn load(&self, run_id: &RunId) -> Result<RunState, StoreError> {
        let run_id = run_id.clone();
        self.call(move |conn| {
            let json: Option<String> = conn
                .query_row(
                    "SELECT state_json FROM checkpoints WHERE run_id = ?1",
                    params![run_id.as_str()],
                    |row| row.get(0),
                )
                .optional()
                .map_err(|e| backend(e, "Failed to load checkpoint"))?;
            match json {
                Some(json) => Ok(serde_json::from_str(&json)?),
                None => Err(StoreError::NotFound { run_id }),
            }
        })
        .await
    }

    async fn save(&self, state: &RunState) -> Result<(), StoreError> {
        let json = serde_json::to_string(state)?;
        let run_id = state.run_id.clone();
        let version = state.version;
        let status = state.status.as_str();
        let current_stage = state.current_stage.clone();
        let created_at = state.created_at.to_rfc3339();
        let updated_at = state.updated_at.to_rfc3339();

        self.call(move |conn| {
            let changed = if version == 1 {
                conn.execute(
                    "INSERT INTO checkpoints
                        (run_id, version, status, current_stage, state_json, created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                     ON CONFLICT(run_id) DO NOTHING",
                    params![
                        run_id.as_str(),
                        version as i64,
                        status,
                        current_stage,
                        json,
                        created_at,
                        updated_at
                    ],
                )
            } else {
                conn.execute(
                    "UPDATE checkpoints
                     SET version = ?2, status = ?3, current_stage = ?4, state_json = ?5,
                         updated_at = ?6
                     WHERE run_id = ?1 AND version = ?7",
                    params![
                        run_id.as_str(),
                        version as i64,
                        status,
                        current_stage,
                        json,
                        updated_at,
                        version.saturating_sub(1) as i64
                    ],
                )
            }
            .map_err(|e| backend(e, "Failed to write checkpoint"))?;

            if changed == 1 {
                return Ok(());
            }
            // Lost the race (or a stale caller): report what is actually stored.
            let stored = stored_version(conn, &run_id)?;
            Err(StoreError::VersionConflict {
                run_id,
                expected: version.saturating_sub(1),
                found: stored.unwrap_or(0),
            })
        })
        .await
    }

    async fn list(&self) -> Result<Vec<RunSummary>, StoreError> {
        self.call(|conn| {
            let mut stmt = conn
                .prepare("SELECT state_json FROM checkpoints ORDER BY updated_at DESC")
                .map_err(|e| backend(e, "Failed to prepare checkpoint listing"))?;
            let rows = stmt
                .query_map([], |row| row.get::<_, String>(0))
                .map_err(|e| backend(e, "Failed to list checkpoints"))?;
            let mut summaries = Vec::new();
            for row in rows {
                let json = row.map_err(|e| backend(e, "Failed to read checkpoint row"))?;
                let state: RunState = serde_json::from_str(&json)?;
                summaries.push(state.summary());
            }
            Ok(summaries)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use breachgraph_common::{Context, RunStatus};
    use serde_json::json;
    use tempfile::tempdir;

    #[tokio::test]
    async fn roundtrip_preserves_full_state() {
        let store = SqliteCheckpointStore::open_in_memory().unwrap();
        let mut ctx = Context::new();
        ctx.insert("question".into(), json!("show internet-reachable hosts"));
        let state = RunState::new("enumerate", ctx);
        store.save(&state).await.unwrap();
        assert_eq!(store.load(&state.run_id).await.unwrap(), state);
    }

    #[tokio::test]
    async fn duplicate_initial_insert_conflicts() {
        let store = SqliteCheckpointStore::open_in_memory().unwrap();
        let state = RunState::new("enumerate", Context::new());
        store.save(&state).await.unwrap();
        let err = store.save(&state).await.unwrap_err();
        assert!(matches!(
            err,
            StoreError::VersionConflict {
                expected: 0,
                found: 1,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn stale_update_never_overwrites_newer_state() {
        let store = SqliteCheckpointStore::open_in_memory().unwrap();
        let mut state = RunState::new("enumerate", Context::new());
        store.save(&state).await.unwrap();

        let mut winner = state.clone();
        winner.bump_version();
        winner.current_stage = Some("ingest".into());
        store.save(&winner).await.unwrap();

        state.bump_version();
        state.current_stage = Some("loser".into());
        let err = store.save(&state).await.unwrap_err();
        assert!(matches!(
            err,
            StoreError::VersionConflict {
                expected: 1,
                found: 2,
                ..
            }
        ));
        let loaded = store.load(&state.run_id).await.unwrap();
        assert_eq!(loaded.version, 2);
        assert_eq!(loaded.current_stage.as_deref(), Some("ingest"));
    }

    #[tokio::test]
    async fn update_of_missing_run_conflicts() {
        let store = SqliteCheckpointStore::open_in_memory().unwrap();
        let mut state = RunState::new("enumerate", Context::new());
        state.bump_version();
        let err = store.save(&state).await.unwrap_err();
        assert!(matches!(err, StoreError::VersionConflict { found: 0, .. }));
    }

    #[tokio::test]
    async fn survives_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("checkpoints.db");
        let mut state = RunState::new("enumerate", Context::new());
        {
            let store = SqliteCheckpointStore::open(&path).unwrap();
            store.save(&state).await.unwrap();
            state.bump_version();
            state.status = RunStatus::Paused;
            store.save(&state).await.unwrap();
        }
        let store = SqliteCheckpointStore::open(&path).unwrap();
        let loaded = store.load(&state.run_id).await.unwrap();
        assert_eq!(loaded.version, 2);
        assert_eq!(loaded.status, RunStatus::Paused);
    }

    #[tokio::test]
    async fn list_orders_by_most_recent_update() {
        let store = SqliteCheckpointStore::open_in_memory().unwrap();
        let first = RunState::new("enumerate", Context::new());
        store.save(&first).await.unwrap();
        let mut second = RunState::new("enumerate", Context::new());
        second.updated_at = first.updated_at + chrono::Duration::seconds(5);
        store.save(&second).await.unwrap();

        let listed = store.list().await.unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].run_id, second.run_id);
        assert_eq!(listed[1].run_id, first.run_id);
    }
}
