use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, warn};

use crate::error::Result;
use crate::task_store::{Task, TaskStatus};

#[derive(Debug, Clone)]
pub struct ActionButton {
    pub text: String,
    pub action: String,
}

#[derive(Debug, Clone)]
pub struct UiMessage {
    pub text: String,
    pub buttons: Vec<ActionButton>,
}

/// Abstract "edit message N in chat C" collaborator. The concrete Telegram
/// implementation lives outside this core; this core only depends on the
/// interface, per SPEC_FULL.md §6.
#[async_trait]
pub trait UIChannel: Send + Sync {
    async fn send(&self, chat_id: i64, message: UiMessage) -> Result<i64>;
    async fn edit(&self, chat_id: i64, msg_id: i64, message: UiMessage) -> Result<()>;
}

fn render_single(task: &Task, percentage: u8, action: &str) -> UiMessage {
    let bar_filled = (percentage / 10) as usize;
    let bar = format!("{}{}", "#".repeat(bar_filled), "-".repeat(10 - bar_filled));
    UiMessage {
        text: format!("{action}: {} [{bar}] {percentage}%", task.file_name),
        buttons: vec![ActionButton {
            text: "Cancel".to_string(),
            action: format!("cancel:{}", task.id),
        }],
    }
}

fn status_icon(status: TaskStatus) -> &'static str {
    match status {
        TaskStatus::Queued => "o",
        TaskStatus::Downloading => ">",
        TaskStatus::Downloaded => "v",
        TaskStatus::Uploading => "^",
        TaskStatus::Completed => "+",
        TaskStatus::Failed => "x",
        TaskStatus::Cancelled => "-",
        TaskStatus::Unknown => "?",
    }
}

fn render_batch(group_id: &str, tasks: &[Task]) -> UiMessage {
    let mut lines = vec![format!("Batch {group_id}:")];
    let mut done = 0;
    for task in tasks {
        if task.status.is_terminal() {
            done += 1;
        }
        lines.push(format!("{} {}", status_icon(task.status), task.file_name));
    }
    lines.push(format!("{done}/{}", tasks.len()));
    UiMessage {
        text: lines.join("\n"),
        buttons: Vec::new(),
    }
}

#[derive(Debug)]
struct RefreshRequest {
    chat_id: i64,
    msg_id: i64,
    task: Task,
    percentage: u8,
    action: String,
    group: Option<Vec<Task>>,
    is_terminal: bool,
}

/// Bounded-rate UI scheduler. Holds a `msg_id -> last refresh timestamp` map
/// (`monitorLocks` in SPEC_FULL.md §4.6) so only one refresh per message is
/// allowed within `min_refresh_interval`, except refreshes carrying a terminal
/// status, which always go through. Uses an unbounded channel to decouple the
/// download/upload progress callbacks (which may fire off a transport thread)
/// from the actual UIChannel call, the same decoupling the teacher's
/// `storage::queue::EventQueue` applies to event dispatch.
pub struct UiUpdateScheduler {
    channel: Arc<dyn UIChannel>,
    min_refresh_interval: chrono::Duration,
    monitor_locks: RwLock<HashMap<i64, DateTime<Utc>>>,
    sender: mpsc::UnboundedSender<RefreshRequest>,
}

impl UiUpdateScheduler {
    pub fn new(channel: Arc<dyn UIChannel>, min_refresh_interval: chrono::Duration) -> Arc<Self> {
        let (sender, receiver) = mpsc::unbounded_channel();
        let scheduler = Arc::new(Self {
            channel,
            min_refresh_interval,
            monitor_locks: RwLock::new(HashMap::new()),
            sender,
        });
        scheduler.clone().spawn_drain_loop(receiver);
        scheduler
    }

    fn spawn_drain_loop(self: Arc<Self>, mut receiver: mpsc::UnboundedReceiver<RefreshRequest>) {
        tokio::spawn(async move {
            while let Some(request) = receiver.recv().await {
                self.handle_request(request).await;
            }
        });
    }

    async fn handle_request(&self, request: RefreshRequest) {
        let now = Utc::now();
        {
            let locks = self.monitor_locks.read().await;
            if let Some(last) = locks.get(&request.msg_id) {
                if !request.is_terminal && now - *last < self.min_refresh_interval {
                    debug!(msg_id = request.msg_id, "ui refresh throttled");
                    return;
                }
            }
        }

        let message = match &request.group {
            Some(tasks) => render_batch(request.task.group_id.as_deref().unwrap_or(""), tasks),
            None => render_single(&request.task, request.percentage, &request.action),
        };

        if let Err(e) = self.channel.edit(request.chat_id, request.msg_id, message).await {
            warn!(error = %e, msg_id = request.msg_id, "ui edit failed, ignoring");
        }

        self.monitor_locks.write().await.insert(request.msg_id, now);
    }

    pub fn request_single_refresh(&self, task: Task, percentage: u8, action: &str) {
        let is_terminal = task.status.is_terminal();
        let request = RefreshRequest {
            chat_id: task.chat_id,
            msg_id: task.msg_id,
            task,
            percentage,
            action: action.to_string(),
            group: None,
            is_terminal,
        };
        if self.sender.send(request).is_err() {
            warn!("ui update scheduler channel closed");
        }
    }

    pub fn request_batch_refresh(&self, chat_id: i64, msg_id: i64, group: Vec<Task>) {
        let is_terminal = group.iter().all(|t| t.status.is_terminal());
        let anchor = match group.first() {
            Some(t) => t.clone(),
            None => return,
        };
        let request = RefreshRequest {
            chat_id,
            msg_id,
            task: anchor,
            percentage: 0,
            action: "batch".to_string(),
            group: Some(group),
            is_terminal,
        };
        if self.sender.send(request).is_err() {
            warn!("ui update scheduler channel closed");
        }
    }

    pub async fn last_refresh(&self, msg_id: i64) -> Option<DateTime<Utc>> {
        self.monitor_locks.read().await.get(&msg_id).copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    struct RecordingChannel {
        edits: StdMutex<Vec<(i64, i64, String)>>,
    }

    #[async_trait]
    impl UIChannel for RecordingChannel {
        async fn send(&self, _chat_id: i64, _message: UiMessage) -> Result<i64> {
            Ok(1)
        }

        async fn edit(&self, chat_id: i64, msg_id: i64, message: UiMessage) -> Result<()> {
            self.edits.lock().unwrap().push((chat_id, msg_id, message.text));
            Ok(())
        }
    }

    fn sample_task(status: TaskStatus) -> Task {
        Task {
            id: "t1".into(),
            user_id: 1,
            chat_id: 123,
            msg_id: 300,
            source_msg_id: 200,
            file_name: "clip.mp4".into(),
            file_size: Some(1024),
            status,
            group_id: None,
            claimed_by: None,
            error_msg: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_throttle_drops_rapid_non_terminal_refreshes() {
        let recorder = Arc::new(RecordingChannel { edits: StdMutex::new(Vec::new()) });
        let scheduler = UiUpdateScheduler::new(recorder.clone(), chrono::Duration::seconds(60));
        scheduler.request_single_refresh(sample_task(TaskStatus::Downloading), 10, "downloading");
        scheduler.request_single_refresh(sample_task(TaskStatus::Downloading), 20, "downloading");
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(recorder.edits.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_terminal_refresh_always_bypasses_throttle() {
        let recorder = Arc::new(RecordingChannel { edits: StdMutex::new(Vec::new()) });
        let scheduler = UiUpdateScheduler::new(recorder.clone(), chrono::Duration::seconds(60));
        scheduler.request_single_refresh(sample_task(TaskStatus::Downloading), 10, "downloading");
        scheduler.request_single_refresh(sample_task(TaskStatus::Completed), 100, "completed");
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(recorder.edits.lock().unwrap().len(), 2);
    }
}
