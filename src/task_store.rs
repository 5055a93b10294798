use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OpenFlags, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, info};

use crate::error::{OrchestratorError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Queued,
    Downloading,
    Downloaded,
    Uploading,
    Completed,
    Failed,
    Cancelled,
    /// Any string this build doesn't recognize deserializes here instead of
    /// failing, the same fallback the teacher's `ProcessingStatus`/`EventType`
    /// use for forward compatibility across rolling deploys.
    #[serde(other)]
    Unknown,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed | TaskStatus::Cancelled)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Queued => "queued",
            TaskStatus::Downloading => "downloading",
            TaskStatus::Downloaded => "downloaded",
            TaskStatus::Uploading => "uploading",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
            TaskStatus::Cancelled => "cancelled",
            TaskStatus::Unknown => "unknown",
        }
    }

    pub fn from_str_lossy(s: &str) -> Self {
        match s {
            "queued" => TaskStatus::Queued,
            "downloading" => TaskStatus::Downloading,
            "downloaded" => TaskStatus::Downloaded,
            "uploading" => TaskStatus::Uploading,
            "completed" => TaskStatus::Completed,
            "failed" => TaskStatus::Failed,
            "cancelled" => TaskStatus::Cancelled,
            other => {
                tracing::warn!(status = other, "unrecognized task status, mapping to Unknown");
                TaskStatus::Unknown
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub user_id: i64,
    pub chat_id: i64,
    pub msg_id: i64,
    pub source_msg_id: i64,
    pub file_name: String,
    pub file_size: Option<i64>,
    pub status: TaskStatus,
    pub group_id: Option<String>,
    pub claimed_by: Option<String>,
    pub error_msg: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    fn from_row(row: &Row) -> rusqlite::Result<Self> {
        let status_str: String = row.get("status")?;
        Ok(Task {
            id: row.get("id")?,
            user_id: row.get("user_id")?,
            chat_id: row.get("chat_id")?,
            msg_id: row.get("msg_id")?,
            source_msg_id: row.get("source_msg_id")?,
            file_name: row.get("file_name")?,
            file_size: row.get("file_size")?,
            status: TaskStatus::from_str_lossy(&status_str),
            group_id: row.get("group_id")?,
            claimed_by: row.get("claimed_by")?,
            error_msg: row.get("error_msg")?,
            created_at: row.get("created_at")?,
            updated_at: row.get("updated_at")?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct NewTask {
    pub id: String,
    pub user_id: i64,
    pub chat_id: i64,
    pub msg_id: i64,
    pub source_msg_id: i64,
    pub file_name: String,
    pub file_size: Option<i64>,
    pub group_id: Option<String>,
}

/// Durable, transactional store for task rows — the source of truth once a
/// status has reached a terminal state.
#[async_trait]
pub trait TaskStore: Send + Sync {
    async fn insert(&self, task: NewTask) -> Result<Task>;
    async fn insert_batch(&self, tasks: Vec<NewTask>) -> Result<Vec<Task>>;
    async fn get(&self, id: &str) -> Result<Option<Task>>;
    async fn get_group(&self, group_id: &str) -> Result<Vec<Task>>;

    /// Non-terminal status update; a no-op if the row already reached a
    /// terminal state (terminal rows are write-once).
    async fn update_status(&self, id: &str, status: TaskStatus, error_msg: Option<String>) -> Result<()>;

    /// Claim a task for this instance: succeeds only if it is currently
    /// unclaimed or claimed by `instance_id` itself.
    async fn claim(&self, id: &str, instance_id: &str) -> Result<bool>;
    async fn release_claim(&self, id: &str, instance_id: &str) -> Result<()>;

    /// Rows in a non-terminal state whose `updated_at` is older than the given
    /// cutoff — candidates for stalled-task recovery.
    async fn find_stalled(&self, cutoff: DateTime<Utc>) -> Result<Vec<Task>>;
}

struct PooledConnection {
    conn: Connection,
}

pub struct SqliteTaskStore {
    connections: Mutex<Vec<Connection>>,
    semaphore: Arc<Semaphore>,
    db_path: String,
}

const PRAGMAS: &str = "
PRAGMA journal_mode = WAL;
PRAGMA synchronous = NORMAL;
PRAGMA cache_size = -64000;
PRAGMA temp_store = MEMORY;
PRAGMA mmap_size = 268435456;
";

impl SqliteTaskStore {
    pub fn open(path: &Path, max_connections: usize) -> Result<Self> {
        let db_path = path.to_string_lossy().to_string();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let store = Self {
            connections: Mutex::new(Vec::new()),
            semaphore: Arc::new(Semaphore::new(max_connections)),
            db_path,
        };

        let init_conn = store.create_connection()?;
        init_conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS tasks (
                id TEXT PRIMARY KEY,
                user_id INTEGER NOT NULL,
                chat_id INTEGER NOT NULL,
                msg_id INTEGER NOT NULL,
                source_msg_id INTEGER NOT NULL,
                file_name TEXT NOT NULL,
                file_size INTEGER,
                status TEXT NOT NULL,
                group_id TEXT,
                claimed_by TEXT,
                error_msg TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks(status);
            CREATE INDEX IF NOT EXISTS idx_tasks_group_id ON tasks(group_id);
            CREATE INDEX IF NOT EXISTS idx_tasks_updated_at ON tasks(updated_at);",
        )?;

        {
            let mut pool = store.connections.blocking_lock();
            pool.push(init_conn);
            let prefill = 2.min(max_connections.saturating_sub(1));
            for _ in 0..prefill {
                pool.push(store.create_connection()?);
            }
        }

        info!(path = %store.db_path, "task store initialized");
        Ok(store)
    }

    fn create_connection(&self) -> Result<Connection> {
        let conn = Connection::open_with_flags(
            &self.db_path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        conn.execute_batch(PRAGMAS)?;
        Ok(conn)
    }

    async fn with_connection<F, R>(&self, f: F) -> Result<R>
    where
        F: FnOnce(&Connection) -> rusqlite::Result<R> + Send + 'static,
        R: Send + 'static,
    {
        let _permit = self.semaphore.acquire().await.map_err(|_| {
            OrchestratorError::transient("task store semaphore closed")
        })?;

        let conn = {
            let mut pool = self.connections.lock().await;
            match pool.pop() {
                Some(c) => c,
                None => self.create_connection()?,
            }
        };

        let (conn, result) = tokio::task::spawn_blocking(move || {
            let result = f(&conn);
            (conn, result)
        })
        .await
        .map_err(|e| OrchestratorError::transient(format!("blocking task join error: {e}")))?;

        self.connections.lock().await.push(conn);
        Ok(result?)
    }
}

#[async_trait]
impl TaskStore for SqliteTaskStore {
    async fn insert(&self, task: NewTask) -> Result<Task> {
        let now = Utc::now();
        let row = task.clone();
        self.with_connection(move |conn| {
            conn.execute(
                "INSERT INTO tasks (id,user_id,chat_id,msg_id,source_msg_id,file_name,file_size,status,group_id,claimed_by,error_msg,created_at,updated_at)
                 VALUES (?1,?2,?3,?4,?5,?6,?7,'queued',?8,NULL,NULL,?9,?9)",
                rusqlite::params![row.id, row.user_id, row.chat_id, row.msg_id, row.source_msg_id, row.file_name, row.file_size, row.group_id, now],
            )
        })
        .await?;

        Ok(Task {
            id: task.id,
            user_id: task.user_id,
            chat_id: task.chat_id,
            msg_id: task.msg_id,
            source_msg_id: task.source_msg_id,
            file_name: task.file_name,
            file_size: task.file_size,
            status: TaskStatus::Queued,
            group_id: task.group_id,
            claimed_by: None,
            error_msg: None,
            created_at: now,
            updated_at: now,
        })
    }

    async fn insert_batch(&self, tasks: Vec<NewTask>) -> Result<Vec<Task>> {
        let now = Utc::now();
        let rows = tasks.clone();
        self.with_connection(move |conn| {
            let tx = conn.unchecked_transaction()?;
            for row in &rows {
                tx.execute(
                    "INSERT INTO tasks (id,user_id,chat_id,msg_id,source_msg_id,file_name,file_size,status,group_id,claimed_by,error_msg,created_at,updated_at)
                     VALUES (?1,?2,?3,?4,?5,?6,?7,'queued',?8,NULL,NULL,?9,?9)",
                    rusqlite::params![row.id, row.user_id, row.chat_id, row.msg_id, row.source_msg_id, row.file_name, row.file_size, row.group_id, now],
                )?;
            }
            tx.commit()
        })
        .await?;

        Ok(tasks
            .into_iter()
            .map(|task| Task {
                id: task.id,
                user_id: task.user_id,
                chat_id: task.chat_id,
                msg_id: task.msg_id,
                source_msg_id: task.source_msg_id,
                file_name: task.file_name,
                file_size: task.file_size,
                status: TaskStatus::Queued,
                group_id: task.group_id,
                claimed_by: None,
                error_msg: None,
                created_at: now,
                updated_at: now,
            })
            .collect())
    }

    async fn get(&self, id: &str) -> Result<Option<Task>> {
        let id = id.to_string();
        self.with_connection(move |conn| {
            conn.query_row("SELECT * FROM tasks WHERE id = ?1", [&id], Task::from_row)
                .optional()
        })
        .await
    }

    async fn get_group(&self, group_id: &str) -> Result<Vec<Task>> {
        let group_id = group_id.to_string();
        self.with_connection(move |conn| {
            let mut stmt = conn.prepare("SELECT * FROM tasks WHERE group_id = ?1 ORDER BY created_at ASC")?;
            let rows = stmt.query_map([&group_id], Task::from_row)?;
            rows.collect::<rusqlite::Result<Vec<_>>>()
        })
        .await
    }

    async fn update_status(&self, id: &str, status: TaskStatus, error_msg: Option<String>) -> Result<()> {
        let id = id.to_string();
        let status_str = status.as_str().to_string();
        let now = Utc::now();
        self.with_connection(move |conn| {
            conn.execute(
                "UPDATE tasks SET status = ?1, error_msg = ?2, updated_at = ?3
                 WHERE id = ?4 AND status NOT IN ('completed','failed','cancelled')",
                rusqlite::params![status_str, error_msg, now, id],
            )
        })
        .await?;
        debug!(id, status = status.as_str(), "task status updated");
        Ok(())
    }

    async fn claim(&self, id: &str, instance_id: &str) -> Result<bool> {
        let id = id.to_string();
        let instance_id = instance_id.to_string();
        let now = Utc::now();
        let changed = self
            .with_connection(move |conn| {
                conn.execute(
                    "UPDATE tasks SET claimed_by = ?1, updated_at = ?2
                     WHERE id = ?3 AND (claimed_by IS NULL OR claimed_by = ?1)",
                    rusqlite::params![instance_id, now, id],
                )
            })
            .await?;
        Ok(changed > 0)
    }

    async fn release_claim(&self, id: &str, instance_id: &str) -> Result<()> {
        let id = id.to_string();
        let instance_id = instance_id.to_string();
        self.with_connection(move |conn| {
            conn.execute(
                "UPDATE tasks SET claimed_by = NULL WHERE id = ?1 AND claimed_by = ?2",
                rusqlite::params![id, instance_id],
            )
        })
        .await?;
        Ok(())
    }

    async fn find_stalled(&self, cutoff: DateTime<Utc>) -> Result<Vec<Task>> {
        self.with_connection(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT * FROM tasks WHERE status IN ('queued','downloading','downloaded','uploading') AND updated_at < ?1",
            )?;
            let rows = stmt.query_map([cutoff], Task::from_row)?;
            rows.collect::<rusqlite::Result<Vec<_>>>()
        })
        .await
    }
}

pub type SharedTaskStore = Arc<dyn TaskStore>;

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn store() -> SqliteTaskStore {
        let dir = tempdir().unwrap();
        let path = dir.path().join("tasks.sqlite3");
        std::mem::forget(dir);
        SqliteTaskStore::open(&path, 5).unwrap()
    }

    fn new_task(id: &str) -> NewTask {
        NewTask {
            id: id.to_string(),
            user_id: 1,
            chat_id: 123,
            msg_id: 300,
            source_msg_id: 200,
            file_name: "clip.mp4".to_string(),
            file_size: Some(1024),
            group_id: None,
        }
    }

    #[tokio::test]
    async fn test_insert_and_get_roundtrip() {
        let store = store();
        let inserted = store.insert(new_task("t1")).await.unwrap();
        assert_eq!(inserted.status, TaskStatus::Queued);
        let fetched = store.get("t1").await.unwrap().unwrap();
        assert_eq!(fetched.file_name, "clip.mp4");
    }

    #[tokio::test]
    async fn test_terminal_status_is_write_once() {
        let store = store();
        store.insert(new_task("t1")).await.unwrap();
        store.update_status("t1", TaskStatus::Completed, None).await.unwrap();
        store
            .update_status("t1", TaskStatus::Failed, Some("late write".into()))
            .await
            .unwrap();
        let task = store.get("t1").await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
    }

    #[tokio::test]
    async fn test_claim_is_exclusive() {
        let store = store();
        store.insert(new_task("t1")).await.unwrap();
        assert!(store.claim("t1", "inst-a").await.unwrap());
        assert!(!store.claim("t1", "inst-b").await.unwrap());
        assert!(store.claim("t1", "inst-a").await.unwrap());
    }

    #[tokio::test]
    async fn test_find_stalled_only_returns_nonterminal_old_rows() {
        let store = store();
        store.insert(new_task("t1")).await.unwrap();
        store.update_status("t1", TaskStatus::Downloading, None).await.unwrap();
        let future_cutoff = Utc::now() + chrono::Duration::seconds(5);
        let stalled = store.find_stalled(future_cutoff).await.unwrap();
        assert_eq!(stalled.len(), 1);

        store.update_status("t1", TaskStatus::Completed, None).await.unwrap();
        let stalled_after_complete = store.find_stalled(future_cutoff).await.unwrap();
        assert!(stalled_after_complete.is_empty());
    }

    #[tokio::test]
    async fn test_insert_batch_shares_group_id() {
        let store = store();
        let mut a = new_task("b1");
        a.group_id = Some("grp".into());
        let mut b = new_task("b2");
        b.group_id = Some("grp".into());
        store.insert_batch(vec![a, b]).await.unwrap();
        let group = store.get_group("grp").await.unwrap();
        assert_eq!(group.len(), 2);
    }
}
