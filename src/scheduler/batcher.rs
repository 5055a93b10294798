use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::debug;

use crate::error::Result;
use crate::transfer::{TransferClient, UploadResult};

struct PendingUpload {
    local_path: PathBuf,
    name: String,
    responder: oneshot::Sender<UploadResult>,
}

/// Coalesces uploads destined for the same `(user_id, prefix)` within a small
/// time window into one `TransferClient::upload_batch` call, per SPEC_FULL.md
/// §4.5. A batch flushes when it hits `max_size` or `max_age`, whichever comes
/// first; every pending entry's responder resolves exactly once per flush.
pub struct UploadBatcher {
    transfer: Arc<dyn TransferClient>,
    max_size: usize,
    max_age: Duration,
    groups: Mutex<HashMap<(i64, String), Vec<PendingUpload>>>,
}

fn prefix_of(name: &str) -> String {
    match name.rfind('/') {
        Some(idx) => name[..idx].to_string(),
        None => String::new(),
    }
}

impl UploadBatcher {
    pub fn new(transfer: Arc<dyn TransferClient>, max_size: usize, max_age: Duration) -> Arc<Self> {
        Arc::new(Self {
            transfer,
            max_size,
            max_age,
            groups: Mutex::new(HashMap::new()),
        })
    }

    /// Submit one file for upload; resolves once the owning batch flushes
    /// (either because it filled up or its timer fired).
    pub async fn submit(self: &Arc<Self>, user_id: i64, local_path: PathBuf, name: String) -> UploadResult {
        let key = (user_id, prefix_of(&name));
        let (tx, rx) = oneshot::channel();

        let should_flush_now = {
            let mut groups = self.groups.lock().await;
            let entry = groups.entry(key.clone()).or_default();
            entry.push(PendingUpload { local_path, name, responder: tx });
            let is_new_group = entry.len() == 1;
            let full = entry.len() >= self.max_size;

            if is_new_group {
                self.spawn_age_flush(key.clone());
            }
            full
        };

        if should_flush_now {
            self.flush_group(&key).await;
        }

        rx.await.unwrap_or(UploadResult {
            success: false,
            error: Some("batcher responder dropped".to_string()),
        })
    }

    fn spawn_age_flush(self: &Arc<Self>, key: (i64, String)) {
        let this = Arc::clone(self);
        let max_age = self.max_age;
        tokio::spawn(async move {
            tokio::time::sleep(max_age).await;
            this.flush_group(&key).await;
        });
    }

    async fn flush_group(&self, key: &(i64, String)) {
        let pending = {
            let mut groups = self.groups.lock().await;
            match groups.remove(key) {
                Some(p) if !p.is_empty() => p,
                _ => return,
            }
        };

        debug!(user_id = key.0, prefix = %key.1, count = pending.len(), "flushing upload batch");

        let items: Vec<(PathBuf, String)> = pending
            .iter()
            .map(|p| (p.local_path.clone(), p.name.clone()))
            .collect();

        let results = self.transfer.upload_batch(&items, key.0).await;

        match results {
            Ok(results) if results.len() == pending.len() => {
                for (entry, result) in pending.into_iter().zip(results) {
                    let _ = entry.responder.send(result);
                }
            }
            Ok(_) | Err(_) => {
                // Mismatched count or a hard batch-level failure: every pending
                // entry's callback resolves with a failure value so no caller
                // hangs waiting on a result that will never distinguish it from
                // its batch-mates.
                let message = match results {
                    Err(e) => e.to_string(),
                    Ok(_) => "upload batch returned a mismatched result count".to_string(),
                };
                for entry in pending {
                    let _ = entry.responder.send(UploadResult {
                        success: false,
                        error: Some(message.clone()),
                    });
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use crate::transfer::{ProgressCallback, RemoteFileInfo};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FakeTransfer {
        batch_calls: AtomicUsize,
    }

    #[async_trait]
    impl TransferClient for FakeTransfer {
        async fn remote_file_info(&self, _name: &str, _user_id: i64) -> Result<Option<RemoteFileInfo>> {
            Ok(None)
        }

        async fn download(&self, _source_ref: &str, _local_path: &std::path::Path, _progress: ProgressCallback) -> Result<()> {
            Ok(())
        }

        async fn upload(&self, _local_path: &std::path::Path, _name: &str, _user_id: i64) -> Result<UploadResult> {
            Ok(UploadResult { success: true, error: None })
        }

        async fn upload_batch(&self, items: &[(PathBuf, String)], _user_id: i64) -> Result<Vec<UploadResult>> {
            self.batch_calls.fetch_add(1, Ordering::SeqCst);
            Ok(items.iter().map(|_| UploadResult { success: true, error: None }).collect())
        }
    }

    #[tokio::test]
    async fn test_batch_flushes_at_max_size() {
        let transfer = Arc::new(FakeTransfer { batch_calls: AtomicUsize::new(0) });
        let batcher = UploadBatcher::new(transfer.clone(), 2, Duration::from_secs(10));

        let b1 = Arc::clone(&batcher);
        let t1 = tokio::spawn(async move { b1.submit(1, PathBuf::from("/tmp/a"), "dir/a.mp4".into()).await });
        let b2 = Arc::clone(&batcher);
        let t2 = tokio::spawn(async move { b2.submit(1, PathBuf::from("/tmp/b"), "dir/b.mp4".into()).await });

        let (r1, r2) = tokio::join!(t1, t2);
        assert!(r1.unwrap().success);
        assert!(r2.unwrap().success);
        assert_eq!(transfer.batch_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_batch_flushes_on_age_timeout() {
        let transfer = Arc::new(FakeTransfer { batch_calls: AtomicUsize::new(0) });
        let batcher = UploadBatcher::new(transfer.clone(), 10, Duration::from_millis(20));
        let result = batcher.submit(1, PathBuf::from("/tmp/a"), "dir/a.mp4".into()).await;
        assert!(result.success);
        assert_eq!(transfer.batch_calls.load(Ordering::SeqCst), 1);
    }
}
