use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::signal;
use tracing::{error, info, warn};

use orchestrator_core::clock::SystemClock;
use orchestrator_core::config::{Config, SharedConfig};
use orchestrator_core::coordinator::InstanceCoordinator;
use orchestrator_core::error::OrchestratorError;
use orchestrator_core::http::{metrics::MetricsServer, webhook};
use orchestrator_core::kv_store::RedisKVStore;
use orchestrator_core::queue_bus::{QueueBus, QueueBusConfig};
use orchestrator_core::queue_bus::circuit_breaker::CircuitBreakerConfig;
use orchestrator_core::queue_bus::retry::RetryConfig;
use orchestrator_core::scheduler::Scheduler;
use orchestrator_core::task_store::SqliteTaskStore;
use orchestrator_core::transfer::{
    AuthGuard, MediaReference, ProgressCallback, RemoteFileInfo, TelegramMessageRef, TelegramSource, TransferClient,
    UploadResult,
};
use orchestrator_core::ui_channel::{UIChannel, UiMessage, UiUpdateScheduler};
use orchestrator_core::utils::PerformanceMonitor;
use orchestrator_core::utils::SecurityManager;

/// Placeholder for the Telegram chat-layer collaborator. Sending/editing
/// messages and resolving media references is out of scope for this core
/// (SPEC_FULL.md §1); a real deployment supplies its own implementation and
/// wires it in here in place of this one.
struct UnconfiguredChatLayer;

#[async_trait]
impl UIChannel for UnconfiguredChatLayer {
    async fn send(&self, _chat_id: i64, _message: UiMessage) -> orchestrator_core::error::Result<i64> {
        Err(OrchestratorError::Collaborator(
            "no chat-layer plugin configured; wire a UIChannel implementation in main.rs".into(),
        ))
    }

    async fn edit(&self, _chat_id: i64, _msg_id: i64, _message: UiMessage) -> orchestrator_core::error::Result<()> {
        Err(OrchestratorError::Collaborator("no chat-layer plugin configured".into()))
    }
}

#[async_trait]
impl TelegramSource for UnconfiguredChatLayer {
    async fn get_message(
        &self,
        _msg: TelegramMessageRef,
    ) -> orchestrator_core::error::Result<Option<MediaReference>> {
        Err(OrchestratorError::Collaborator("no chat-layer plugin configured".into()))
    }
}

/// Placeholder for the remote-drive transfer collaborator (SPEC_FULL.md §6);
/// a real deployment supplies an rclone-backed (or similar) implementation.
struct UnconfiguredTransfer;

#[async_trait]
impl TransferClient for UnconfiguredTransfer {
    async fn remote_file_info(
        &self,
        _name: &str,
        _user_id: i64,
    ) -> orchestrator_core::error::Result<Option<RemoteFileInfo>> {
        Err(OrchestratorError::Collaborator("no transfer plugin configured".into()))
    }

    async fn download(
        &self,
        _source_ref: &str,
        _local_path: &std::path::Path,
        _progress: ProgressCallback,
    ) -> orchestrator_core::error::Result<()> {
        Err(OrchestratorError::Collaborator("no transfer plugin configured".into()))
    }

    async fn upload(
        &self,
        _local_path: &std::path::Path,
        _name: &str,
        _user_id: i64,
    ) -> orchestrator_core::error::Result<UploadResult> {
        Err(OrchestratorError::Collaborator("no transfer plugin configured".into()))
    }

    async fn upload_batch(
        &self,
        items: &[(std::path::PathBuf, String)],
        _user_id: i64,
    ) -> orchestrator_core::error::Result<Vec<UploadResult>> {
        Ok(items
            .iter()
            .map(|_| UploadResult {
                success: false,
                error: Some("no transfer plugin configured".to_string()),
            })
            .collect())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    if let Err(e) = dotenv::dotenv() {
        if !e.to_string().contains("No such file or directory") {
            warn!("Failed to load .env file: {}", e);
        }
    } else {
        info!("Loaded environment variables from .env file");
    }

    orchestrator_core::setup_logging()?;
    info!("Starting task orchestrator core v{}", env!("CARGO_PKG_VERSION"));

    #[cfg(debug_assertions)]
    warn!("Running in DEBUG mode, rebuild with --release for production");

    let config = Config::load().context("failed to load configuration")?;
    info!("Configuration loaded successfully");
    let shared_config = SharedConfig::new(config.clone());

    let performance_monitor = Arc::new(
        PerformanceMonitor::new(config.performance.clone()).context("failed to initialize performance monitor")?,
    );
    let monitor_clone = performance_monitor.clone();
    tokio::spawn(async move {
        if let Err(e) = monitor_clone.start_monitoring_task().await {
            error!(error = %e, "performance monitoring task exited");
        }
    });

    let clock = Arc::new(SystemClock);

    let kv_store = Arc::new(
        RedisKVStore::connect(&config.stores.redis_url)
            .await
            .context("failed to connect to redis for kv store")?,
    );

    let task_store = Arc::new(
        SqliteTaskStore::open(&config.stores.sqlite_path, 8).context("failed to open task store")?,
    );

    let queue_bus = QueueBus::connect(
        QueueBusConfig {
            redis_url: config.stores.redis_url.clone(),
            queue_prefix: "orchestrator:queue".to_string(),
            batch_size: config.queue.batch_size,
            batch_timeout: std::time::Duration::from_millis(config.queue.batch_timeout_ms),
            max_buffer_size: config.queue.max_buffer_size,
            retry: RetryConfig {
                max_attempts: config.queue.max_retry_attempts,
                ..RetryConfig::default()
            },
            circuit_breaker: CircuitBreakerConfig {
                failure_threshold: config.queue.failure_threshold,
                failure_window: std::time::Duration::from_secs(config.queue.failure_window_secs),
                recovery_timeout: std::time::Duration::from_secs(config.queue.recovery_timeout_secs),
                success_threshold: config.queue.success_threshold,
            },
            dedup_window: chrono::Duration::seconds(config.queue.dedup_window_secs as i64),
            dedup_capacity: 10_000,
        },
        "pending".to_string(),
    )
    .await
    .context("failed to connect queue bus")?;
    queue_bus.spawn_flush_loop();

    let chat_layer: Arc<dyn UIChannel> = Arc::new(UnconfiguredChatLayer);
    let telegram: Arc<dyn TelegramSource> = Arc::new(UnconfiguredChatLayer);
    let ui_scheduler = UiUpdateScheduler::new(
        chat_layer.clone(),
        chrono::Duration::milliseconds(config.ui.min_refresh_interval_ms as i64),
    );

    let transfer: Arc<dyn TransferClient> = Arc::new(UnconfiguredTransfer);

    let security = Arc::new(SecurityManager::new(
        config.telegram.allowed_users.clone(),
        config.security.rate_limit_requests,
        config.security.rate_limit_window,
    ));
    let auth: Arc<dyn AuthGuard> = security;

    let coordinator = Arc::new(InstanceCoordinator::new(
        kv_store.clone(),
        format!("http://localhost:{}", config.monitoring.health_check_port),
        chrono::Duration::seconds(config.coordinator.heartbeat_interval_secs as i64),
        chrono::Duration::seconds(config.coordinator.instance_timeout_secs as i64),
    ));
    let coordinator_handle = coordinator.start().await.context("failed to start instance coordinator")?;
    info!(instance_id = coordinator.instance_id(), "instance registered with coordinator");

    let scheduler = Scheduler::new(
        config.scheduler.clone(),
        task_store,
        chat_layer,
        ui_scheduler,
        transfer,
        telegram,
        auth,
        coordinator.clone(),
        clock,
        config.stores.download_dir.clone(),
    );
    let ready = Arc::new(AtomicBool::new(false));

    scheduler.init().await.context("failed to recover stalled tasks on startup")?;
    ready.store(true, Ordering::SeqCst);
    scheduler.start().await;
    info!("scheduler started");

    if config.monitoring.enable_metrics_server {
        let metrics_server = MetricsServer::new(
            performance_monitor,
            coordinator.clone(),
            Some(queue_bus.clone()),
            ready.clone(),
            config.monitoring.health_check_port,
        );
        tokio::spawn(async move {
            if let Err(e) = metrics_server.start().await {
                error!(error = %e, "metrics server exited");
            }
        });
        info!(port = config.monitoring.health_check_port, "metrics server started");
    }

    let webhook_bind = format!("0.0.0.0:{}", config.monitoring.health_check_port.saturating_add(1));
    let webhook_config = shared_config.clone();
    let webhook_queue_bus = queue_bus.clone();
    tokio::spawn(async move {
        if let Err(e) = webhook::run(&webhook_bind, webhook_config, webhook_queue_bus).await {
            error!(error = %e, "webhook server exited");
        }
    });

    info!("task orchestrator core is running, press Ctrl+C to shut down");
    signal::ctrl_c().await.context("failed to listen for shutdown signal")?;
    info!("shutdown signal received, stopping");

    coordinator_handle.abort();
    Ok(())
}
