pub mod batcher;

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::clock::ClockSource;
use crate::config::SchedulerConfig;
use crate::coordinator::InstanceCoordinator;
use crate::error::{OrchestratorError, Result};
use crate::scheduler::batcher::UploadBatcher;
use crate::state_machine::{is_final_state, should_retry, validate_transition};
use crate::task_store::{NewTask, SharedTaskStore, Task, TaskStatus};
use crate::transfer::{AuthGuard, ProgressCallback, TelegramMessageRef, TelegramSource, TransferClient};
use crate::ui_channel::{UIChannel, UiMessage, UiUpdateScheduler};

#[derive(Debug, Clone)]
struct PendingUpdate {
    status: TaskStatus,
    error_msg: Option<String>,
    buffered_at: DateTime<Utc>,
}

/// Top-level orchestration component: owns the lifecycle of every task on this
/// replica, per SPEC_FULL.md §4.1. Grounded in the worker-pool pattern of the
/// teacher's `events::queue_manager::QueueManager` (spawned worker loops
/// polling a shared queue) and the construction/wiring order of the teacher's
/// `main.rs`.
pub struct Scheduler {
    config: SchedulerConfig,
    task_store: SharedTaskStore,
    ui_channel: Arc<dyn UIChannel>,
    ui_scheduler: Arc<UiUpdateScheduler>,
    transfer: Arc<dyn TransferClient>,
    telegram: Arc<dyn TelegramSource>,
    auth: Arc<dyn AuthGuard>,
    coordinator: Arc<InstanceCoordinator>,
    clock: Arc<dyn ClockSource>,
    batcher: Arc<UploadBatcher>,
    download_dir: PathBuf,

    active_workers: Mutex<HashSet<String>>,
    waiting_tasks: Mutex<VecDeque<Task>>,
    waiting_upload_tasks: Mutex<VecDeque<Task>>,
    pending_updates: Mutex<HashMap<String, PendingUpdate>>,
    cancel_flags: Mutex<HashMap<String, Arc<AtomicBool>>>,
    local_paths: Mutex<HashMap<String, PathBuf>>,

    download_tx: mpsc::UnboundedSender<String>,
    download_rx: Mutex<Option<mpsc::UnboundedReceiver<String>>>,
    upload_tx: mpsc::UnboundedSender<String>,
    upload_rx: Mutex<Option<mpsc::UnboundedReceiver<String>>>,
}

#[allow(clippy::too_many_arguments)]
impl Scheduler {
    pub fn new(
        config: SchedulerConfig,
        task_store: SharedTaskStore,
        ui_channel: Arc<dyn UIChannel>,
        ui_scheduler: Arc<UiUpdateScheduler>,
        transfer: Arc<dyn TransferClient>,
        telegram: Arc<dyn TelegramSource>,
        auth: Arc<dyn AuthGuard>,
        coordinator: Arc<InstanceCoordinator>,
        clock: Arc<dyn ClockSource>,
        download_dir: PathBuf,
    ) -> Arc<Self> {
        let batcher = UploadBatcher::new(
            transfer.clone(),
            config.upload_batch_max_size,
            std::time::Duration::from_millis(config.upload_batch_max_age_ms),
        );
        let (download_tx, download_rx) = mpsc::unbounded_channel();
        let (upload_tx, upload_rx) = mpsc::unbounded_channel();

        Arc::new(Self {
            config,
            task_store,
            ui_channel,
            ui_scheduler,
            transfer,
            telegram,
            auth,
            coordinator,
            clock,
            batcher,
            download_dir,
            active_workers: Mutex::new(HashSet::new()),
            waiting_tasks: Mutex::new(VecDeque::new()),
            waiting_upload_tasks: Mutex::new(VecDeque::new()),
            pending_updates: Mutex::new(HashMap::new()),
            cancel_flags: Mutex::new(HashMap::new()),
            local_paths: Mutex::new(HashMap::new()),
            download_tx,
            download_rx: Mutex::new(Some(download_rx)),
            upload_tx,
            upload_rx: Mutex::new(Some(upload_rx)),
        })
    }

    /// Start the worker pools and timers. Call once, after [`Scheduler::init`].
    pub async fn start(self: &Arc<Self>) {
        let download_rx = self.download_rx.lock().await.take().expect("start called twice");
        let upload_rx = self.upload_rx.lock().await.take().expect("start called twice");

        self.spawn_download_workers(download_rx);
        self.spawn_upload_workers(upload_rx);
        self.spawn_pending_update_flush_loop();
        self.spawn_pending_update_sweep_loop();
    }

    fn spawn_download_workers(self: &Arc<Self>, rx: mpsc::UnboundedReceiver<String>) {
        let rx = Arc::new(Mutex::new(rx));
        let worker_count = Arc::new(AtomicUsize::new(0));
        for _ in 0..self.config.download_workers_min {
            self.spawn_one_download_worker(&rx, &worker_count);
        }
        self.spawn_download_autoscaler(rx, worker_count);
    }

    fn spawn_one_download_worker(
        self: &Arc<Self>,
        rx: &Arc<Mutex<mpsc::UnboundedReceiver<String>>>,
        worker_count: &Arc<AtomicUsize>,
    ) {
        let worker_id = worker_count.fetch_add(1, Ordering::SeqCst);
        let this = Arc::clone(self);
        let rx = Arc::clone(rx);
        let worker_count = Arc::clone(worker_count);
        tokio::spawn(async move {
            loop {
                let task_id = {
                    let mut rx = rx.lock().await;
                    rx.recv().await
                };
                match task_id {
                    Some(task_id) => this.process_download(worker_id, task_id).await,
                    None => break,
                }
            }
            worker_count.fetch_sub(1, Ordering::SeqCst);
        });
    }

    /// Watches the download queue depth and spawns additional workers up to
    /// `download_workers_max` when the backlog outgrows the current pool.
    /// Workers never scale back down on their own: an idle worker blocked on
    /// `recv()` costs nothing, so there is no upkeep benefit to killing it,
    /// matching SPEC_FULL.md §7's "CPU work is negligible; suspension is
    /// I/O-bound" observation.
    fn spawn_download_autoscaler(
        self: &Arc<Self>,
        rx: Arc<Mutex<mpsc::UnboundedReceiver<String>>>,
        worker_count: Arc<AtomicUsize>,
    ) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(std::time::Duration::from_secs(5));
            loop {
                ticker.tick().await;
                let backlog = this.waiting_tasks.lock().await.len();
                let current = worker_count.load(Ordering::SeqCst);
                if backlog > current && current < this.config.download_workers_max {
                    info!(backlog, current, "scaling up download worker pool");
                    this.spawn_one_download_worker(&rx, &worker_count);
                }
            }
        });
    }

    fn spawn_upload_workers(self: &Arc<Self>, rx: mpsc::UnboundedReceiver<String>) {
        let rx = Arc::new(Mutex::new(rx));
        let worker_count = Arc::new(AtomicUsize::new(0));
        for _ in 0..self.config.upload_workers_min {
            self.spawn_one_upload_worker(&rx, &worker_count);
        }
        self.spawn_upload_autoscaler(rx, worker_count);
    }

    fn spawn_one_upload_worker(
        self: &Arc<Self>,
        rx: &Arc<Mutex<mpsc::UnboundedReceiver<String>>>,
        worker_count: &Arc<AtomicUsize>,
    ) {
        let worker_id = worker_count.fetch_add(1, Ordering::SeqCst);
        let this = Arc::clone(self);
        let rx = Arc::clone(rx);
        let worker_count = Arc::clone(worker_count);
        tokio::spawn(async move {
            loop {
                let task_id = {
                    let mut rx = rx.lock().await;
                    rx.recv().await
                };
                match task_id {
                    Some(task_id) => this.process_upload(worker_id, task_id).await,
                    None => break,
                }
            }
            worker_count.fetch_sub(1, Ordering::SeqCst);
        });
    }

    fn spawn_upload_autoscaler(
        self: &Arc<Self>,
        rx: Arc<Mutex<mpsc::UnboundedReceiver<String>>>,
        worker_count: Arc<AtomicUsize>,
    ) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(std::time::Duration::from_secs(5));
            loop {
                ticker.tick().await;
                let backlog = this.waiting_upload_tasks.lock().await.len();
                let current = worker_count.load(Ordering::SeqCst);
                if backlog > current && current < this.config.upload_workers_max {
                    info!(backlog, current, "scaling up upload worker pool");
                    this.spawn_one_upload_worker(&rx, &worker_count);
                }
            }
        });
    }

    fn spawn_pending_update_flush_loop(self: &Arc<Self>) {
        let this = Arc::clone(self);
        let interval = std::time::Duration::from_secs(10);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                this.flush_pending_updates().await;
            }
        });
    }

    fn spawn_pending_update_sweep_loop(self: &Arc<Self>) {
        let this = Arc::clone(self);
        let interval = std::time::Duration::from_secs(300);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                this.sweep_stale_pending_updates().await;
            }
        });
    }

    async fn flush_pending_updates(&self) {
        let drained: Vec<(String, PendingUpdate)> = {
            let mut pending = self.pending_updates.lock().await;
            pending.drain().collect()
        };
        for (task_id, update) in drained {
            if let Err(e) = self
                .task_store
                .update_status(&task_id, update.status, update.error_msg)
                .await
            {
                warn!(task_id, error = %e, "failed to flush pending update");
            }
        }
    }

    async fn sweep_stale_pending_updates(&self) {
        let now = Utc::now();
        let mut pending = self.pending_updates.lock().await;
        let before = pending.len();
        pending.retain(|_, update| now - update.buffered_at < chrono::Duration::minutes(30));
        let removed = before - pending.len();
        if removed > 0 {
            warn!(removed, "swept stale pending updates that were never flushed");
        }
    }

    /// Non-terminal updates are coalesced into the pending-update buffer;
    /// terminal updates bypass it and write synchronously, per
    /// SPEC_FULL.md §3/§4.1.
    async fn record_status(&self, task_id: &str, status: TaskStatus, error_msg: Option<String>) -> Result<()> {
        if status.is_terminal() {
            self.pending_updates.lock().await.remove(task_id);
            self.task_store.update_status(task_id, status, error_msg).await?;
        } else {
            self.pending_updates.lock().await.insert(
                task_id.to_string(),
                PendingUpdate {
                    status,
                    error_msg,
                    buffered_at: Utc::now(),
                },
            );
        }
        Ok(())
    }

    async fn try_enter(&self, task_id: &str) -> bool {
        self.active_workers.lock().await.insert(task_id.to_string())
    }

    async fn exit(&self, task_id: &str) {
        self.active_workers.lock().await.remove(task_id);
    }

    async fn is_cancelled(&self, task_id: &str) -> bool {
        self.cancel_flags
            .lock()
            .await
            .get(task_id)
            .map(|f| f.load(Ordering::SeqCst))
            .unwrap_or(false)
    }

    pub async fn add_task(&self, chat_id: i64, source_msg_id: i64, user_id: i64, label: &str) -> Result<String> {
        let msg = UiMessage {
            text: format!("Captured: {label}"),
            buttons: vec![],
        };
        let msg_id = self.ui_channel.send(chat_id, msg).await?;

        let task_id = Uuid::new_v4().to_string();
        let new_task = NewTask {
            id: task_id.clone(),
            user_id,
            chat_id,
            msg_id,
            source_msg_id,
            file_name: label.to_string(),
            file_size: None,
            group_id: None,
        };

        match self.task_store.insert(new_task).await {
            Ok(task) => {
                self.enqueue_download(task).await;
                Ok(task_id)
            }
            Err(e) => {
                let _ = self
                    .ui_channel
                    .edit(
                        chat_id,
                        msg_id,
                        UiMessage {
                            text: "Failed to create task".to_string(),
                            buttons: vec![],
                        },
                    )
                    .await;
                Err(e)
            }
        }
    }

    pub async fn add_batch_tasks(
        &self,
        chat_id: i64,
        user_id: i64,
        items: Vec<(i64, String)>,
    ) -> Result<Vec<String>> {
        let group_id = Uuid::new_v4().to_string();
        let msg = UiMessage {
            text: format!("Batch of {} captured", items.len()),
            buttons: vec![],
        };
        let msg_id = self.ui_channel.send(chat_id, msg).await?;

        let new_tasks: Vec<NewTask> = items
            .into_iter()
            .map(|(source_msg_id, label)| NewTask {
                id: Uuid::new_v4().to_string(),
                user_id,
                chat_id,
                msg_id,
                source_msg_id,
                file_name: label,
                file_size: None,
                group_id: Some(group_id.clone()),
            })
            .collect();

        let tasks = self.task_store.insert_batch(new_tasks).await?;
        let ids: Vec<String> = tasks.iter().map(|t| t.id.clone()).collect();
        for task in tasks {
            self.enqueue_download(task).await;
        }
        Ok(ids)
    }

    pub async fn cancel_task(&self, task_id: &str, requestor_id: i64) -> Result<bool> {
        let Some(task) = self.task_store.get(task_id).await? else {
            return Ok(false);
        };

        if task.user_id != requestor_id && !self.auth.can(requestor_id, "admin").await? {
            return Err(OrchestratorError::validation("not authorized to cancel this task"));
        }

        if is_final_state(task.status) {
            // Already finished: user-visible cancel is idempotent.
            return Ok(true);
        }

        if let Some(flag) = self.cancel_flags.lock().await.get(task_id) {
            flag.store(true, Ordering::SeqCst);
        } else {
            let flag = Arc::new(AtomicBool::new(true));
            self.cancel_flags.lock().await.insert(task_id.to_string(), flag);
        }

        self.record_status(task_id, TaskStatus::Cancelled, None).await?;
        Ok(true)
    }

    /// Startup recovery: re-enqueue non-terminal rows stalled past the
    /// configured threshold. Gated behind a named distributed lock so that
    /// when several replicas start at once, only one of them runs the sweep
    /// and re-enqueues each stalled row (claim() still protects against
    /// double-processing downstream, but without this lock every replica
    /// would redundantly re-enqueue the same rows on every restart).
    pub async fn init(&self) -> Result<()> {
        let lock_ttl = chrono::Duration::seconds(self.config.stalled_threshold_secs.max(30));
        match self.coordinator.acquire_lock("stalled-task-recovery", lock_ttl).await {
            Ok(true) => {}
            Ok(false) => {
                info!("another instance holds the stalled-task recovery lock, skipping sweep this startup");
                return Ok(());
            }
            Err(e) => {
                warn!(error = %e, "failed to acquire stalled-task recovery lock, sweeping anyway");
            }
        }

        let cutoff = Utc::now() - chrono::Duration::seconds(self.config.stalled_threshold_secs);
        let stalled = self.task_store.find_stalled(cutoff).await?;
        for task in stalled {
            let source = self
                .telegram
                .get_message(TelegramMessageRef {
                    chat_id: task.chat_id,
                    message_id: task.source_msg_id,
                })
                .await;

            match source {
                Ok(Some(_)) => {
                    info!(task_id = task.id, "recovering stalled task");
                    self.enqueue_download(task).await;
                }
                Ok(None) => warn!(task_id = task.id, "stalled task's source message no longer exists, skipping"),
                Err(e) => warn!(task_id = task.id, error = %e, "failed to verify stalled task's source, skipping"),
            }
        }

        let _ = self.coordinator.release_lock("stalled-task-recovery").await;
        Ok(())
    }

    /// Routes a progress/terminal UI refresh for `task`: batched across its
    /// `group_id` siblings when it has one, single-task otherwise.
    async fn refresh_ui(&self, task: Task, percentage: u8, action: &str) {
        if let Some(group_id) = task.group_id.clone() {
            match self.task_store.get_group(&group_id).await {
                Ok(group) if !group.is_empty() => {
                    self.ui_scheduler.request_batch_refresh(task.chat_id, task.msg_id, group);
                    return;
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(task_id = task.id, error = %e, "failed to fetch task group, falling back to single refresh");
                }
            }
        }
        self.ui_scheduler.request_single_refresh(task, percentage, action);
    }

    async fn enqueue_download(&self, task: Task) {
        self.waiting_tasks.lock().await.push_back(task.clone());
        if self.download_tx.send(task.id.clone()).is_err() {
            error!(task_id = task.id, "download queue channel closed");
        }
    }

    async fn enqueue_upload(&self, task: Task) {
        self.waiting_upload_tasks.lock().await.push_back(task.clone());
        if self.upload_tx.send(task.id.clone()).is_err() {
            error!(task_id = task.id, "upload queue channel closed");
        }
    }

    fn remove_from_waiting(queue: &mut VecDeque<Task>, task_id: &str) {
        if let Some(pos) = queue.iter().position(|t| t.id == task_id) {
            queue.remove(pos);
        }
    }

    /// A snapshot of the download queue for UI rendering, so a worker claiming
    /// a task mid-iteration can't produce an undefined element read.
    pub async fn waiting_tasks_snapshot(&self) -> Vec<Task> {
        self.waiting_tasks.lock().await.iter().cloned().collect()
    }

    async fn process_download(self: &Arc<Self>, worker_id: usize, task_id: String) {
        if !self.try_enter(&task_id).await {
            debug!(worker_id, task_id, "download worker skipping task already in progress");
            return;
        }

        if !self.acquire_task_claim(&task_id).await {
            debug!(worker_id, task_id, "download worker lost claim to another instance");
            self.exit(&task_id).await;
            return;
        }

        let result = self.download_body(&task_id).await;
        if let Err(e) = result {
            warn!(worker_id, task_id, error = %e, "download worker exited with error");
        }
        self.release_task_claim(&task_id).await;
        self.exit(&task_id).await;
    }

    /// Cross-replica work-claim gate: succeeds only if the task is currently
    /// unclaimed or already claimed by this instance. This is what actually
    /// gives `activeWorkers`'s in-process re-entry guard cross-replica teeth —
    /// two replicas racing to dispatch the same task_id will only have one of
    /// them win the claim.
    async fn acquire_task_claim(&self, task_id: &str) -> bool {
        match self.task_store.claim(task_id, self.coordinator.instance_id()).await {
            Ok(claimed) => claimed,
            Err(e) => {
                warn!(task_id, error = %e, "failed to claim task, treating as lost race");
                false
            }
        }
    }

    async fn release_task_claim(&self, task_id: &str) {
        if let Err(e) = self.task_store.release_claim(task_id, self.coordinator.instance_id()).await {
            warn!(task_id, error = %e, "failed to release task claim");
        }
    }

    async fn download_body(self: &Arc<Self>, task_id: &str) -> Result<()> {
        let Some(task) = self.task_store.get(task_id).await? else {
            return Ok(());
        };
        self.waiting_tasks.lock().await.retain(|t| t.id != task_id);

        if is_final_state(task.status) {
            return Ok(());
        }

        if self.is_cancelled(task_id).await {
            self.record_status(task_id, TaskStatus::Cancelled, None).await?;
            return Ok(());
        }

        // Sec-transfer shortcut: skip the download entirely if the remote
        // already holds an identical object.
        if let Some(size) = task.file_size {
            if let Some(info) = self.transfer.remote_file_info(&task.file_name, task.user_id).await? {
                if info.size == size {
                    self.record_status(task_id, TaskStatus::Completed, None).await?;
                    self.refresh_ui(task, 100, "completed").await;
                    return Ok(());
                }
            }
        }

        // Non-terminal statuses are coalesced into `pendingUpdates` (see
        // `record_status`) rather than written through immediately, so the
        // freshly-read `task.status` here can legitimately lag the in-memory
        // pipeline stage (e.g. a stalled-task recovery re-entering mid-flight).
        // An invalid transition is therefore logged, not treated as fatal.
        if let Err(e) = validate_transition(task.status, TaskStatus::Downloading) {
            warn!(task_id, status = ?task.status, error = %e, "state machine flagged an unexpected transition, proceeding anyway");
        }
        self.record_status(task_id, TaskStatus::Downloading, None).await?;

        let opaque_name = format!("{task_id}.part");
        let local_path = self.download_dir.join(&opaque_name);
        self.local_paths.lock().await.insert(task_id.to_string(), local_path.clone());

        let ui = Arc::clone(&self.ui_scheduler);
        let this = Arc::clone(self);
        let task_for_progress = task.clone();

        let mut attempt: u32 = 0;
        let download_result = loop {
            let ui = ui.clone();
            let this = Arc::clone(&this);
            let task_for_progress = task_for_progress.clone();
            let progress: ProgressCallback = Box::new(move |done, total| {
                let pct = if total > 0 { ((done * 100) / total).min(100) as u8 } else { 0 };
                if task_for_progress.group_id.is_some() {
                    let this = Arc::clone(&this);
                    let task_for_progress = task_for_progress.clone();
                    tokio::spawn(async move {
                        this.refresh_ui(task_for_progress, pct, "downloading").await;
                    });
                } else {
                    ui.request_single_refresh(task_for_progress.clone(), pct, "downloading");
                }
            });

            let result = self.transfer.download(&task.file_name, &local_path, progress).await;
            if result.is_ok() || !should_retry(attempt, self.config.max_task_retries) {
                break result;
            }
            warn!(task_id, attempt, error = ?result.as_ref().err(), "download attempt failed, retrying");
            attempt += 1;
        };

        if self.is_cancelled(task_id).await {
            let _ = tokio::fs::remove_file(&local_path).await;
            self.record_status(task_id, TaskStatus::Cancelled, None).await?;
            return Ok(());
        }

        match download_result {
            Ok(()) => {
                self.record_status(task_id, TaskStatus::Downloaded, None).await?;
                let mut updated = task.clone();
                updated.status = TaskStatus::Downloaded;
                self.enqueue_upload(updated).await;
                Ok(())
            }
            Err(e) => {
                let _ = tokio::fs::remove_file(&local_path).await;
                self.record_status(task_id, TaskStatus::Failed, Some(e.to_string())).await?;
                self.refresh_ui(task, 0, "failed").await;
                Ok(())
            }
        }
    }

    async fn process_upload(self: &Arc<Self>, worker_id: usize, task_id: String) {
        if !self.try_enter(&task_id).await {
            debug!(worker_id, task_id, "upload worker skipping task already in progress");
            return;
        }

        if !self.acquire_task_claim(&task_id).await {
            debug!(worker_id, task_id, "upload worker lost claim to another instance");
            self.exit(&task_id).await;
            return;
        }

        let result = self.upload_body(&task_id).await;
        if let Err(e) = result {
            warn!(worker_id, task_id, error = %e, "upload worker exited with error");
        }
        self.release_task_claim(&task_id).await;
        self.exit(&task_id).await;
    }

    async fn upload_body(self: &Arc<Self>, task_id: &str) -> Result<()> {
        let Some(task) = self.task_store.get(task_id).await? else {
            return Ok(());
        };
        self.waiting_upload_tasks.lock().await.retain(|t| t.id != task_id);

        if is_final_state(task.status) {
            return Ok(());
        }

        let local_path = self.local_paths.lock().await.get(task_id).cloned();
        let Some(local_path) = local_path else {
            self.record_status(task_id, TaskStatus::Failed, Some("missing local file reference".into()))
                .await?;
            return Ok(());
        };

        if self.is_cancelled(task_id).await {
            let _ = tokio::fs::remove_file(&local_path).await;
            self.record_status(task_id, TaskStatus::Cancelled, None).await?;
            return Ok(());
        }

        // See the matching comment in `download_body`: non-terminal writes are
        // buffered, so the freshly-read `task.status` can still show an earlier
        // stage of the pipeline than what's actually in flight.
        if let Err(e) = validate_transition(task.status, TaskStatus::Uploading) {
            warn!(task_id, status = ?task.status, error = %e, "state machine flagged an unexpected transition, proceeding anyway");
        }
        self.record_status(task_id, TaskStatus::Uploading, None).await?;

        let mut attempt: u32 = 0;
        let upload_result = loop {
            let result = self
                .batcher
                .submit(task.user_id, local_path.clone(), task.file_name.clone())
                .await;
            if result.success || !should_retry(attempt, self.config.max_task_retries) {
                break result;
            }
            warn!(task_id, attempt, error = ?result.error, "upload attempt failed, retrying");
            attempt += 1;
        };

        let final_status = if upload_result.success {
            // Verify against the actual on-disk filename, not a freshly
            // regenerated name from media metadata.
            match self.verify_upload(&task, &local_path).await {
                Ok(true) => TaskStatus::Completed,
                Ok(false) => TaskStatus::Failed,
                Err(_) => TaskStatus::Failed,
            }
        } else {
            TaskStatus::Failed
        };

        // The local file is always deleted, even on upload failure.
        if let Err(e) = tokio::fs::remove_file(&local_path).await {
            debug!(task_id, error = %e, "local file cleanup failed, ignoring");
        }

        let error_msg = if final_status == TaskStatus::Failed {
            upload_result.error.or_else(|| Some("upload verification failed".to_string()))
        } else {
            None
        };

        self.record_status(task_id, final_status, error_msg).await?;
        self.refresh_ui(
            task,
            if final_status == TaskStatus::Completed { 100 } else { 0 },
            if final_status == TaskStatus::Completed { "completed" } else { "failed" },
        )
        .await;
        Ok(())
    }

    async fn verify_upload(&self, task: &Task, local_path: &std::path::Path) -> Result<bool> {
        let local_size = tokio::fs::metadata(local_path).await.map(|m| m.len() as i64).unwrap_or(-1);
        match self.transfer.remote_file_info(&task.file_name, task.user_id).await? {
            Some(info) => Ok(info.size == local_size),
            None => Ok(false),
        }
    }

    pub fn clock(&self) -> &Arc<dyn ClockSource> {
        &self.clock
    }

    pub fn coordinator(&self) -> &Arc<InstanceCoordinator> {
        &self.coordinator
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordinator::InstanceCoordinator;
    use crate::kv_store::MemoryKVStore;
    use crate::task_store::SqliteTaskStore;
    use crate::transfer::{MediaReference, RemoteFileInfo, TelegramMessageRef, UploadResult};
    use async_trait::async_trait;
    use std::path::PathBuf;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex as StdMutex;
    use tempfile::tempdir;

    struct FakeUiChannel {
        sent: StdMutex<Vec<(i64, String)>>,
        edits: StdMutex<Vec<(i64, i64, String)>>,
        next_id: AtomicUsize,
    }

    #[async_trait]
    impl UIChannel for FakeUiChannel {
        async fn send(&self, chat_id: i64, message: UiMessage) -> Result<i64> {
            self.sent.lock().unwrap().push((chat_id, message.text));
            Ok(self.next_id.fetch_add(1, Ordering::SeqCst) as i64 + 1)
        }

        async fn edit(&self, chat_id: i64, msg_id: i64, message: UiMessage) -> Result<()> {
            self.edits.lock().unwrap().push((chat_id, msg_id, message.text));
            Ok(())
        }
    }

    struct FakeTransfer {
        remote_has_file: bool,
        remote_size: i64,
    }

    #[async_trait]
    impl TransferClient for FakeTransfer {
        async fn remote_file_info(&self, _name: &str, _user_id: i64) -> Result<Option<RemoteFileInfo>> {
            if self.remote_has_file {
                Ok(Some(RemoteFileInfo { size: self.remote_size }))
            } else {
                Ok(None)
            }
        }

        async fn download(&self, _source_ref: &str, local_path: &std::path::Path, progress: ProgressCallback) -> Result<()> {
            progress(50, 100);
            tokio::fs::write(local_path, vec![0u8; 100]).await?;
            progress(100, 100);
            Ok(())
        }

        async fn upload(&self, _local_path: &std::path::Path, _name: &str, _user_id: i64) -> Result<UploadResult> {
            Ok(UploadResult { success: true, error: None })
        }

        async fn upload_batch(&self, items: &[(PathBuf, String)], _user_id: i64) -> Result<Vec<UploadResult>> {
            Ok(items.iter().map(|_| UploadResult { success: true, error: None }).collect())
        }
    }

    struct FakeTelegram;

    #[async_trait]
    impl TelegramSource for FakeTelegram {
        async fn get_message(&self, msg: TelegramMessageRef) -> Result<Option<MediaReference>> {
            Ok(Some(MediaReference {
                file_name: "clip.mp4".into(),
                file_size: Some(100),
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

    fn test_scheduler(remote_has_file: bool, remote_size: i64) -> Arc<Scheduler> {
        let dir = tempdir().unwrap();
        let db_path = dir.path().join("tasks.sqlite3");
        let download_dir = dir.path().join("downloads");
        std::fs::create_dir_all(&download_dir).unwrap();
        std::mem::forget(dir);

        let task_store: SharedTaskStore = Arc::new(SqliteTaskStore::open(&db_path, 5).unwrap());
        let ui_channel: Arc<dyn UIChannel> = Arc::new(FakeUiChannel {
            sent: StdMutex::new(Vec::new()),
            edits: StdMutex::new(Vec::new()),
            next_id: AtomicUsize::new(0),
        });
        let ui_scheduler = UiUpdateScheduler::new(ui_channel.clone(), chrono::Duration::milliseconds(1));
        let transfer: Arc<dyn TransferClient> = Arc::new(FakeTransfer { remote_has_file, remote_size });
        let telegram: Arc<dyn TelegramSource> = Arc::new(FakeTelegram);
        let auth: Arc<dyn AuthGuard> = Arc::new(AllowAllAuth);
        let coordinator = Arc::new(InstanceCoordinator::new(
            Arc::new(MemoryKVStore::new()),
            "http://localhost",
            chrono::Duration::seconds(10),
            chrono::Duration::seconds(30),
        ));
        let clock: Arc<dyn ClockSource> = Arc::new(crate::clock::SystemClock);

        let config = SchedulerConfig {
            download_workers_min: 1,
            download_workers_max: 1,
            upload_workers_min: 1,
            upload_workers_max: 1,
            stalled_threshold_secs: 300,
            upload_batch_max_size: 10,
            upload_batch_max_age_ms: 50,
            max_task_retries: 0,
        };

        Scheduler::new(config, task_store, ui_channel, ui_scheduler, transfer, telegram, auth, coordinator, clock, download_dir)
    }

    #[tokio::test]
    async fn test_add_task_then_completes_happy_path() {
        let scheduler = test_scheduler(false, 0);
        scheduler.start().await;

        let task_id = scheduler.add_task(123, 200, 1, "Demo").await.unwrap();
        for _ in 0..50 {
            if let Some(task) = scheduler.task_store.get(&task_id).await.unwrap() {
                if task.status == TaskStatus::Completed {
                    break;
                }
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }

        let task = scheduler.task_store.get(&task_id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
    }

    #[tokio::test]
    async fn test_sec_transfer_shortcut_skips_download() {
        let scheduler = test_scheduler(true, 100);
        let mut task = scheduler
            .task_store
            .insert(NewTask {
                id: "t-shortcut".into(),
                user_id: 1,
                chat_id: 123,
                msg_id: 300,
                source_msg_id: 200,
                file_name: "clip.mp4".into(),
                file_size: Some(100),
                group_id: None,
            })
            .await
            .unwrap();
        task.file_size = Some(100);

        scheduler.download_body("t-shortcut").await.unwrap();
        let result = scheduler.task_store.get("t-shortcut").await.unwrap().unwrap();
        assert_eq!(result.status, TaskStatus::Completed);
    }

    #[tokio::test]
    async fn test_cancel_is_idempotent_once_terminal() {
        let scheduler = test_scheduler(false, 0);
        scheduler
            .task_store
            .insert(NewTask {
                id: "t-done".into(),
                user_id: 1,
                chat_id: 123,
                msg_id: 300,
                source_msg_id: 200,
                file_name: "clip.mp4".into(),
                file_size: Some(100),
                group_id: None,
            })
            .await
            .unwrap();
        scheduler.task_store.update_status("t-done", TaskStatus::Completed, None).await.unwrap();

        assert!(scheduler.cancel_task("t-done", 1).await.unwrap());
        let task = scheduler.task_store.get("t-done").await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Completed);
    }

    #[tokio::test]
    async fn test_add_batch_tasks_share_one_progress_message() {
        let scheduler = test_scheduler(false, 0);
        let ids = scheduler
            .add_batch_tasks(123, 1, vec![(201, "a.mp4".into()), (202, "b.mp4".into())])
            .await
            .unwrap();
        assert_eq!(ids.len(), 2);
        let group_id = scheduler.task_store.get(&ids[0]).await.unwrap().unwrap().group_id;
        assert!(group_id.is_some());
        let group = scheduler.task_store.get_group(group_id.as_ref().unwrap()).await.unwrap();
        assert_eq!(group.len(), 2);
        assert_eq!(group[0].msg_id, group[1].msg_id);
    }
}
