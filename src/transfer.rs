use async_trait::async_trait;

use crate::error::Result;

#[derive(Debug, Clone)]
pub struct RemoteFileInfo {
    pub size: i64,
}

#[derive(Debug, Clone)]
pub struct UploadResult {
    pub success: bool,
    pub error: Option<String>,
}

/// Progress callback invoked by `TransferClient` during a download/upload.
/// `done`/`total` are bytes; implementors must not block the caller's thread.
pub type ProgressCallback = Box<dyn Fn(u64, u64) + Send + Sync>;

/// Abstract collaborator for moving bytes between the media source and the
/// user's remote drive. The orchestration core depends only on this trait;
/// concrete drive-provider plugins (rclone-style invocation) are out of scope
/// per SPEC_FULL.md §1/§6.
#[async_trait]
pub trait TransferClient: Send + Sync {
    /// Query whether the remote already holds an object with this name for
    /// this user, to support the sec-transfer shortcut (§4.2).
    async fn remote_file_info(&self, name: &str, user_id: i64) -> Result<Option<RemoteFileInfo>>;

    async fn download(
        &self,
        source_ref: &str,
        local_path: &std::path::Path,
        progress: ProgressCallback,
    ) -> Result<()>;

    async fn upload(&self, local_path: &std::path::Path, name: &str, user_id: i64) -> Result<UploadResult>;

    /// Upload several files in one underlying transfer-tool invocation when the
    /// transport supports batching; implementations may fall back to
    /// sequential `upload` calls.
    async fn upload_batch(
        &self,
        items: &[(std::path::PathBuf, String)],
        user_id: i64,
    ) -> Result<Vec<UploadResult>>;
}

#[derive(Debug, Clone)]
pub struct TelegramMessageRef {
    pub chat_id: i64,
    pub message_id: i64,
}

/// Abstract collaborator for the Telegram chat layer (out of scope per
/// SPEC_FULL.md §1): fetching the media reference behind a message, and
/// initiating a download of it.
#[async_trait]
pub trait TelegramSource: Send + Sync {
    async fn get_message(&self, msg: TelegramMessageRef) -> Result<Option<MediaReference>>;
}

#[derive(Debug, Clone)]
pub struct MediaReference {
    pub file_name: String,
    pub file_size: Option<i64>,
    pub source_ref: String,
}

/// Abstract authorization collaborator: whether `user_id` may perform `action`
/// (e.g. `"cancel_task"`, `"admin"`).
#[async_trait]
pub trait AuthGuard: Send + Sync {
    async fn can(&self, user_id: i64, action: &str) -> Result<bool>;
}
