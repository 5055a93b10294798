use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use orchestrator_core::clock::{ClockSource, SystemClock};
use orchestrator_core::config::SchedulerConfig;
use orchestrator_core::coordinator::InstanceCoordinator;
use orchestrator_core::kv_store::MemoryKVStore;
use orchestrator_core::task_store::{SharedTaskStore, SqliteTaskStore, TaskStatus};
use orchestrator_core::transfer::{
    AuthGuard, MediaReference, ProgressCallback, RemoteFileInfo, TelegramMessageRef, TelegramSource, TransferClient,
    UploadResult,
};
use orchestrator_core::ui_channel::{UIChannel, UiMessage, UiUpdateScheduler};
use orchestrator_core::{Result, Scheduler};

struct RecordingChannel {
    edits: StdMutex<Vec<String>>,
}

#[async_trait]
impl UIChannel for RecordingChannel {
    async fn send(&self, _chat_id: i64, _message: UiMessage) -> Result<i64> {
        Ok(1)
    }

    async fn edit(&self, _chat_id: i64, _msg_id: i64, message: UiMessage) -> Result<()> {
        self.edits.lock().unwrap().push(message.text);
        Ok(())
    }
}

struct WritesFakeBytesTransfer;

#[async_trait]
impl TransferClient for WritesFakeBytesTransfer {
    async fn remote_file_info(&self, _name: &str, _user_id: i64) -> Result<Option<RemoteFileInfo>> {
        Ok(None)
    }

    async fn download(&self, _source_ref: &str, local_path: &Path, progress: ProgressCallback) -> Result<()> {
        progress(0, 10);
        tokio::fs::write(local_path, vec![7u8; 10]).await?;
        progress(10, 10);
        Ok(())
    }

    async fn upload(&self, _local_path: &Path, _name: &str, _user_id: i64) -> Result<UploadResult> {
        Ok(UploadResult { success: true, error: None })
    }

    async fn upload_batch(&self, items: &[(PathBuf, String)], _user_id: i64) -> Result<Vec<UploadResult>> {
        Ok(items.iter().map(|_| UploadResult { success: true, error: None }).collect())
    }
}

struct StaticTelegramSource;

#[async_trait]
impl TelegramSource for StaticTelegramSource {
    async fn get_message(&self, msg: TelegramMessageRef) -> Result<Option<MediaReference>> {
        Ok(Some(MediaReference {
            file_name: "clip.mp4".to_string(),
            file_size: Some(10),
            source_ref: msg.message_id.to_string(),
        }))
    }
}

struct AllowAllAuth;

#[async_trait]
impl AuthGuard for AllowAllAuth {
    async fn can(&self, _user_id: i64, _action: &str) -> Result<bool> {
        Ok(true)
    }
}

fn small_pool_config() -> SchedulerConfig {
    SchedulerConfig {
        download_workers_min: 1,
        download_workers_max: 1,
        upload_workers_min: 1,
        upload_workers_max: 1,
        stalled_threshold_secs: 300,
        upload_batch_max_size: 10,
        upload_batch_max_age_ms: 20,
        max_task_retries: 2,
    }
}

/// End-to-end wiring test that builds a `Scheduler` the way `main.rs` does —
/// real `SqliteTaskStore` on disk, real `InstanceCoordinator` over an
/// in-memory KV store, fake chat/transfer/auth collaborators standing in for
/// the out-of-scope Telegram and drive plugins — and drives a task through
/// the whole download/upload lifecycle via the public API only.
#[tokio::test]
async fn test_task_reaches_completed_through_public_api() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("tasks.sqlite3");
    let download_dir = dir.path().join("downloads");
    std::fs::create_dir_all(&download_dir).unwrap();

    let task_store: SharedTaskStore = Arc::new(SqliteTaskStore::open(&db_path, 5).unwrap());
    let ui_channel: Arc<dyn UIChannel> = Arc::new(RecordingChannel { edits: StdMutex::new(Vec::new()) });
    let ui_scheduler = UiUpdateScheduler::new(ui_channel.clone(), chrono::Duration::milliseconds(1));
    let transfer: Arc<dyn TransferClient> = Arc::new(WritesFakeBytesTransfer);
    let telegram: Arc<dyn TelegramSource> = Arc::new(StaticTelegramSource);
    let auth: Arc<dyn AuthGuard> = Arc::new(AllowAllAuth);
    let coordinator = Arc::new(InstanceCoordinator::new(
        Arc::new(MemoryKVStore::new()),
        "http://localhost:9100",
        chrono::Duration::seconds(10),
        chrono::Duration::seconds(30),
    ));
    let clock: Arc<dyn ClockSource> = Arc::new(SystemClock);

    let scheduler = Scheduler::new(
        small_pool_config(),
        task_store,
        ui_channel,
        ui_scheduler,
        transfer,
        telegram,
        auth,
        coordinator,
        clock,
        download_dir,
    );

    scheduler.init().await.unwrap();
    scheduler.start().await;

    let task_id = scheduler.add_task(42, 100, 7, "clip.mp4").await.unwrap();

    // A second handle onto the same sqlite file observes the worker pool's
    // writes without reaching into the scheduler's private state.
    let observer = SqliteTaskStore::open(&db_path, 2).unwrap();
    let mut final_status = None;
    for _ in 0..100 {
        if let Some(task) = observer.get(&task_id).await.unwrap() {
            if task.status.is_terminal() {
                final_status = Some(task.status);
                break;
            }
        }
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }

    assert_eq!(final_status, Some(TaskStatus::Completed));
}

/// A task cancelled before it starts downloading should land in `Cancelled`,
/// not `Completed`, and a second cancel on the same task is a no-op that
/// still reports success (cancellation is idempotent once terminal).
#[tokio::test]
async fn test_cancel_before_completion_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("tasks.sqlite3");
    let download_dir = dir.path().join("downloads");
    std::fs::create_dir_all(&download_dir).unwrap();

    let task_store: SharedTaskStore = Arc::new(SqliteTaskStore::open(&db_path, 5).unwrap());
    let ui_channel: Arc<dyn UIChannel> = Arc::new(RecordingChannel { edits: StdMutex::new(Vec::new()) });
    let ui_scheduler = UiUpdateScheduler::new(ui_channel.clone(), chrono::Duration::milliseconds(1));
    let transfer: Arc<dyn TransferClient> = Arc::new(WritesFakeBytesTransfer);
    let telegram: Arc<dyn TelegramSource> = Arc::new(StaticTelegramSource);
    let auth: Arc<dyn AuthGuard> = Arc::new(AllowAllAuth);
    let coordinator = Arc::new(InstanceCoordinator::new(
        Arc::new(MemoryKVStore::new()),
        "http://localhost:9101",
        chrono::Duration::seconds(10),
        chrono::Duration::seconds(30),
    ));
    let clock: Arc<dyn ClockSource> = Arc::new(SystemClock);

    let scheduler = Scheduler::new(
        small_pool_config(),
        task_store,
        ui_channel,
        ui_scheduler,
        transfer,
        telegram,
        auth,
        coordinator,
        clock,
        download_dir,
    );

    // Not started: nothing drains the download queue, so the task stays
    // queued until cancelled.
    let task_id = scheduler.add_task(42, 100, 7, "clip.mp4").await.unwrap();

    assert!(scheduler.cancel_task(&task_id, 7).await.unwrap());
    assert!(scheduler.cancel_task(&task_id, 7).await.unwrap());

    let observer = SqliteTaskStore::open(&db_path, 2).unwrap();
    let task = observer.get(&task_id).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Cancelled);
}

/// A user who doesn't own the task and lacks admin rights cannot cancel it.
#[tokio::test]
async fn test_cancel_rejects_unauthorized_requestor() {
    struct DenyAdminAuth;

    #[async_trait]
    impl AuthGuard for DenyAdminAuth {
        async fn can(&self, _user_id: i64, action: &str) -> Result<bool> {
            Ok(action != "admin")
        }
    }

    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("tasks.sqlite3");
    let download_dir = dir.path().join("downloads");
    std::fs::create_dir_all(&download_dir).unwrap();

    let task_store: SharedTaskStore = Arc::new(SqliteTaskStore::open(&db_path, 5).unwrap());
    let ui_channel: Arc<dyn UIChannel> = Arc::new(RecordingChannel { edits: StdMutex::new(Vec::new()) });
    let ui_scheduler = UiUpdateScheduler::new(ui_channel.clone(), chrono::Duration::milliseconds(1));
    let transfer: Arc<dyn TransferClient> = Arc::new(WritesFakeBytesTransfer);
    let telegram: Arc<dyn TelegramSource> = Arc::new(StaticTelegramSource);
    let auth: Arc<dyn AuthGuard> = Arc::new(DenyAdminAuth);
    let coordinator = Arc::new(InstanceCoordinator::new(
        Arc::new(MemoryKVStore::new()),
        "http://localhost:9102",
        chrono::Duration::seconds(10),
        chrono::Duration::seconds(30),
    ));
    let clock: Arc<dyn ClockSource> = Arc::new(SystemClock);

    let scheduler = Scheduler::new(
        small_pool_config(),
        task_store,
        ui_channel,
        ui_scheduler,
        transfer,
        telegram,
        auth,
        coordinator,
        clock,
        download_dir,
    );

    let task_id = scheduler.add_task(42, 100, 7, "clip.mp4").await.unwrap();
    let result = scheduler.cancel_task(&task_id, 999).await;
    assert!(result.is_err());
}
