use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::utils::performance::PerformanceConfig;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub telegram: TelegramConfig,
    pub stores: StoresConfig,
    pub queue: QueueConfig,
    pub coordinator: CoordinatorConfig,
    pub ui: UiConfig,
    pub scheduler: SchedulerConfig,
    pub security: SecurityConfig,
    pub performance: PerformanceConfig,
    pub monitoring: MonitoringConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TelegramConfig {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub bot_token: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub allowed_users: Vec<i64>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StoresConfig {
    pub sqlite_path: PathBuf,
    pub redis_url: String,
    pub download_dir: PathBuf,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct QueueConfig {
    pub batch_size: usize,
    pub batch_timeout_ms: u64,
    pub max_buffer_size: usize,
    pub max_retry_attempts: usize,
    pub failure_threshold: usize,
    pub failure_window_secs: u64,
    pub recovery_timeout_secs: u64,
    pub success_threshold: usize,
    pub dedup_window_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CoordinatorConfig {
    pub heartbeat_interval_secs: u64,
    pub instance_timeout_secs: u64,
    pub default_lock_ttl_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct UiConfig {
    pub min_refresh_interval_ms: u64,
    pub pending_update_flush_secs: u64,
    pub pending_update_sweep_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SchedulerConfig {
    pub download_workers_min: usize,
    pub download_workers_max: usize,
    pub upload_workers_min: usize,
    pub upload_workers_max: usize,
    pub stalled_threshold_secs: i64,
    pub upload_batch_max_size: usize,
    pub upload_batch_max_age_ms: u64,
    /// Worker-body failures below this attempt count are requeued instead of
    /// marked terminally failed (`state_machine::should_retry`).
    pub max_task_retries: u32,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SecurityConfig {
    pub rate_limit_requests: u32,
    pub rate_limit_window: u64,
    pub audit_log: bool,
    /// Current and previous HMAC signing keys for inbound webhooks. Verifying
    /// against both allows rotating the key without rejecting in-flight senders.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub webhook_signing_key_current: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub webhook_signing_key_next: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct MonitoringConfig {
    pub health_check_port: u16,
    pub enable_metrics_server: bool,
    pub metrics_endpoint: String,
    pub health_endpoint: String,
}

/// Config keys that survive a `/api/v2/config/refresh` reload even if the new
/// TOML file on disk omits them, so rotating a file in place can't accidentally
/// wipe credentials that were only ever supplied via environment variables.
const PROTECTED_ENV_KEYS: &[&str] = &[
    "TELEGRAM_BOT_TOKEN",
    "WEBHOOK_SIGNING_KEY_CURRENT",
    "WEBHOOK_SIGNING_KEY_NEXT",
];

impl Default for Config {
    fn default() -> Self {
        let home_dir = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
        let base_dir = home_dir.join(".orchestrator");

        Self {
            telegram: TelegramConfig {
                bot_token: String::new(),
                allowed_users: Vec::new(),
            },
            stores: StoresConfig {
                sqlite_path: base_dir.join("tasks.sqlite3"),
                redis_url: "redis://127.0.0.1:6379".to_string(),
                download_dir: base_dir.join("downloads"),
            },
            queue: QueueConfig {
                batch_size: 25,
                batch_timeout_ms: 500,
                max_buffer_size: 10_000,
                max_retry_attempts: 3,
                failure_threshold: 5,
                failure_window_secs: 60,
                recovery_timeout_secs: 30,
                success_threshold: 3,
                dedup_window_secs: 3600,
            },
            coordinator: CoordinatorConfig {
                heartbeat_interval_secs: 10,
                instance_timeout_secs: 30,
                default_lock_ttl_secs: 30,
            },
            ui: UiConfig {
                min_refresh_interval_ms: 2000,
                pending_update_flush_secs: 10,
                pending_update_sweep_secs: 300,
            },
            scheduler: SchedulerConfig {
                download_workers_min: 2,
                download_workers_max: 8,
                upload_workers_min: 2,
                upload_workers_max: 8,
                stalled_threshold_secs: 300,
                upload_batch_max_size: 10,
                upload_batch_max_age_ms: 2000,
                max_task_retries: 2,
            },
            security: SecurityConfig {
                rate_limit_requests: 30,
                rate_limit_window: 60,
                audit_log: true,
                webhook_signing_key_current: String::new(),
                webhook_signing_key_next: String::new(),
            },
            performance: PerformanceConfig::default(),
            monitoring: MonitoringConfig {
                health_check_port: 8080,
                enable_metrics_server: true,
                metrics_endpoint: "/metrics".to_string(),
                health_endpoint: "/health".to_string(),
            },
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        let config_dir = Self::get_config_dir();
        let config_file = config_dir.join("config.toml");

        fs::create_dir_all(&config_dir)
            .with_context(|| format!("Failed to create config directory: {}", config_dir.display()))?;

        let mut config = if config_file.exists() {
            info!("Loading configuration from: {}", config_file.display());
            let content = fs::read_to_string(&config_file)
                .with_context(|| format!("Failed to read config file: {}", config_file.display()))?;

            toml::from_str(&content)
                .with_context(|| format!("Failed to parse config file: {}", config_file.display()))?
        } else {
            warn!("Config file not found, creating default configuration");
            let default_config = Self::default();
            default_config.save(&config_file)?;
            default_config
        };

        config.load_from_env()?;
        config.validate()?;

        Ok(config)
    }

    /// Re-read the config file and environment, preserving [`PROTECTED_ENV_KEYS`]
    /// even if they were only present via environment on the previous load and
    /// are absent from the refreshed file.
    pub fn reload(&self) -> Result<Self> {
        let mut reloaded = Self::load()?;

        if reloaded.telegram.bot_token.is_empty() && !self.telegram.bot_token.is_empty() {
            reloaded.telegram.bot_token = self.telegram.bot_token.clone();
        }
        if reloaded.security.webhook_signing_key_current.is_empty()
            && !self.security.webhook_signing_key_current.is_empty()
        {
            reloaded.security.webhook_signing_key_current = self.security.webhook_signing_key_current.clone();
        }
        if reloaded.security.webhook_signing_key_next.is_empty()
            && !self.security.webhook_signing_key_next.is_empty()
        {
            reloaded.security.webhook_signing_key_next = self.security.webhook_signing_key_next.clone();
        }

        reloaded.validate()?;
        Ok(reloaded)
    }

    pub fn save(&self, path: &PathBuf) -> Result<()> {
        let mut content = String::new();
        content.push_str("# Task orchestrator configuration\n");
        content.push_str("#\n");
        content.push_str("# Secrets (bot token, webhook signing keys) should be set via environment\n");
        content.push_str("# variables rather than committed to this file:\n");
        content.push_str("#   TELEGRAM_BOT_TOKEN, WEBHOOK_SIGNING_KEY_CURRENT, WEBHOOK_SIGNING_KEY_NEXT\n\n");

        let config_content = toml::to_string_pretty(self).context("Failed to serialize configuration")?;
        content.push_str(&config_content);

        fs::write(path, content).with_context(|| format!("Failed to write config file: {}", path.display()))?;

        info!("Configuration saved to: {}", path.display());
        Ok(())
    }

    fn load_from_env(&mut self) -> Result<()> {
        if let Ok(token) = std::env::var("TELEGRAM_BOT_TOKEN") {
            if !token.is_empty() {
                self.telegram.bot_token = token;
            }
        }

        if let Ok(users_str) = std::env::var("TELEGRAM_ALLOWED_USERS") {
            if !users_str.is_empty() {
                let users: Result<Vec<i64>, _> =
                    users_str.split(',').map(|s| s.trim().parse::<i64>()).collect();
                match users {
                    Ok(user_list) => self.telegram.allowed_users = user_list,
                    Err(e) => warn!("Failed to parse TELEGRAM_ALLOWED_USERS: {}", e),
                }
            }
        }

        if let Ok(url) = std::env::var("ORCHESTRATOR_REDIS_URL") {
            self.stores.redis_url = url;
        }
        if let Ok(path) = std::env::var("ORCHESTRATOR_SQLITE_PATH") {
            self.stores.sqlite_path = PathBuf::from(path);
        }
        if let Ok(dir) = std::env::var("ORCHESTRATOR_DOWNLOAD_DIR") {
            self.stores.download_dir = PathBuf::from(dir);
        }
        if let Ok(key) = std::env::var("WEBHOOK_SIGNING_KEY_CURRENT") {
            self.security.webhook_signing_key_current = key;
        }
        if let Ok(key) = std::env::var("WEBHOOK_SIGNING_KEY_NEXT") {
            self.security.webhook_signing_key_next = key;
        }

        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if self.telegram.bot_token.is_empty() {
            anyhow::bail!(
                "\nTelegram bot token is required.\n\nSet the TELEGRAM_BOT_TOKEN environment variable:\n  export TELEGRAM_BOT_TOKEN=\"your_bot_token_here\""
            );
        }

        if self.telegram.allowed_users.is_empty() {
            anyhow::bail!(
                "\nAt least one allowed user is required.\n\nSet the TELEGRAM_ALLOWED_USERS environment variable:\n  export TELEGRAM_ALLOWED_USERS=\"123456,789012\""
            );
        }

        if !self.stores.download_dir.is_absolute() {
            anyhow::bail!("stores.download_dir must be an absolute path");
        }

        if self.security.webhook_signing_key_current.is_empty() {
            anyhow::bail!(
                "\nA webhook signing key is required.\n\nSet WEBHOOK_SIGNING_KEY_CURRENT (and optionally WEBHOOK_SIGNING_KEY_NEXT during rotation)."
            );
        }

        if self.queue.success_threshold == 0 {
            anyhow::bail!("queue.success_threshold must be >= 1");
        }

        if self.scheduler.download_workers_min == 0 || self.scheduler.upload_workers_min == 0 {
            anyhow::bail!("scheduler worker pool minimums must be >= 1");
        }

        Ok(())
    }

    pub fn get_config_dir() -> PathBuf {
        if let Ok(dir) = std::env::var("ORCHESTRATOR_CONFIG_DIR") {
            return PathBuf::from(dir);
        }
        let home_dir = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
        home_dir.join(".orchestrator")
    }
}

/// Hot-reloadable configuration handle. `POST /api/v2/config/refresh` reloads the
/// file+environment and swaps the snapshot; every reader sees either the old or
/// the new config in full, never a partially-applied mix.
#[derive(Clone)]
pub struct SharedConfig(Arc<ArcSwap<Config>>);

impl SharedConfig {
    pub fn new(config: Config) -> Self {
        Self(Arc::new(ArcSwap::new(Arc::new(config))))
    }

    pub fn load(&self) -> Arc<Config> {
        self.0.load_full()
    }

    pub fn refresh(&self) -> Result<()> {
        let current = self.load();
        let reloaded = current.reload()?;
        self.0.store(Arc::new(reloaded));
        info!("configuration reloaded");
        Ok(())
    }
}

impl std::fmt::Debug for SharedConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedConfig").finish_non_exhaustive()
    }
}
