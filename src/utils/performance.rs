use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use sysinfo::{System, Pid};
use tokio::time::interval;
use tracing::{info, warn, error};
use serde::{Serialize, Deserialize};
use prometheus::{Counter, Histogram, Gauge, Registry, Encoder, TextEncoder};

/// Prometheus-backed metrics collector plus a periodic system-resource sampler,
/// grounded in the teacher's `PerformanceMonitor` (same registry/gauge/counter
/// shape), with the Telegram/file-watcher metric names replaced by the ones
/// this core actually emits: task lifecycle transitions and transfer calls.
#[derive(Debug, Clone)]
pub struct PerformanceMonitor {
    pub task_processing_counter: Counter,
    pub task_processing_duration: Histogram,
    pub transfer_counter: Counter,
    pub transfer_duration: Histogram,
    pub memory_usage_gauge: Gauge,
    pub cpu_usage_gauge: Gauge,
    pub queue_depth_gauge: Gauge,
    pub error_counter: Counter,

    system: Arc<Mutex<System>>,
    metrics_registry: Registry,
    start_time: Instant,
    config: PerformanceConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerformanceConfig {
    pub memory_threshold_mb: u64,
    pub cpu_threshold_percent: f32,
    pub task_processing_threshold_ms: u64,
    pub transfer_response_threshold_ms: u64,
    pub metrics_collection_interval_seconds: u64,
    pub enable_detailed_logging: bool,
}

impl Default for PerformanceConfig {
    fn default() -> Self {
        Self {
            memory_threshold_mb: 256,
            cpu_threshold_percent: 80.0,
            task_processing_threshold_ms: 1000,
            transfer_response_threshold_ms: 30_000,
            metrics_collection_interval_seconds: 30,
            enable_detailed_logging: false,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TaskMetrics {
    pub total_tasks_processed: u64,
    pub average_processing_time_ms: f64,
    pub tasks_per_minute: f64,
    pub error_rate_percent: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct SystemMetrics {
    pub memory_usage_mb: u64,
    pub memory_usage_percent: f32,
    pub cpu_usage_percent: f32,
    pub uptime_seconds: u64,
}

#[derive(Debug, Clone, Serialize)]
pub enum HealthStatus {
    Healthy,
    Warning(String),
    Critical(String),
}

#[derive(Debug, Clone, Serialize)]
pub struct PerformanceReport {
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub health_status: HealthStatus,
    pub system_metrics: SystemMetrics,
    pub task_metrics: TaskMetrics,
    pub transfer_metrics: TransferMetrics,
    pub recommendations: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TransferMetrics {
    pub transfers_completed: u64,
    pub average_duration_ms: f64,
}

impl PerformanceMonitor {
    pub fn new(config: PerformanceConfig) -> anyhow::Result<Self> {
        let registry = Registry::new();

        let task_processing_counter = Counter::new(
            "orchestrator_tasks_processed_total",
            "Total number of tasks that reached a terminal state",
        )?;
        registry.register(Box::new(task_processing_counter.clone()))?;

        let task_processing_duration = Histogram::with_opts(prometheus::HistogramOpts::new(
            "orchestrator_task_processing_duration_seconds",
            "Time spent taking a task from queued to terminal",
        ))?;
        registry.register(Box::new(task_processing_duration.clone()))?;

        let transfer_counter = Counter::new(
            "orchestrator_transfers_total",
            "Total number of download/upload calls completed",
        )?;
        registry.register(Box::new(transfer_counter.clone()))?;

        let transfer_duration = Histogram::with_opts(prometheus::HistogramOpts::new(
            "orchestrator_transfer_duration_seconds",
            "Time spent in a single download or upload call",
        ))?;
        registry.register(Box::new(transfer_duration.clone()))?;

        let memory_usage_gauge = Gauge::new("orchestrator_memory_usage_bytes", "Current process memory usage")?;
        registry.register(Box::new(memory_usage_gauge.clone()))?;

        let cpu_usage_gauge = Gauge::new("orchestrator_cpu_usage_percent", "Current process CPU usage")?;
        registry.register(Box::new(cpu_usage_gauge.clone()))?;

        let queue_depth_gauge = Gauge::new("orchestrator_queue_depth", "Most recently sampled queue bus depth")?;
        registry.register(Box::new(queue_depth_gauge.clone()))?;

        let error_counter = Counter::new("orchestrator_errors_total", "Total number of errors encountered")?;
        registry.register(Box::new(error_counter.clone()))?;

        let mut system = System::new_all();
        system.refresh_all();

        Ok(Self {
            task_processing_counter,
            task_processing_duration,
            transfer_counter,
            transfer_duration,
            memory_usage_gauge,
            cpu_usage_gauge,
            queue_depth_gauge,
            error_counter,
            system: Arc::new(Mutex::new(system)),
            metrics_registry: registry,
            start_time: Instant::now(),
            config,
        })
    }

    pub fn record_task_processed(&self, duration: Duration) {
        self.task_processing_counter.inc();
        self.task_processing_duration.observe(duration.as_secs_f64());

        if duration.as_millis() > self.config.task_processing_threshold_ms as u128 {
            warn!("Slow task processing detected: {}ms", duration.as_millis());
        }
        if self.config.enable_detailed_logging {
            info!("Task processed in {}ms", duration.as_millis());
        }
    }

    pub fn record_transfer(&self, duration: Duration) {
        self.transfer_counter.inc();
        self.transfer_duration.observe(duration.as_secs_f64());

        if duration.as_millis() > self.config.transfer_response_threshold_ms as u128 {
            warn!("Slow transfer call detected: {}ms", duration.as_millis());
        }
    }

    pub fn record_queue_depth(&self, depth: u64) {
        self.queue_depth_gauge.set(depth as f64);
    }

    pub fn record_error(&self, error_type: &str) {
        self.error_counter.inc();
        error!("Error recorded: {}", error_type);
    }

    pub fn update_system_metrics(&self) -> anyhow::Result<SystemMetrics> {
        let mut system = self.system.lock().unwrap();
        system.refresh_all();

        let total_memory = system.total_memory();
        let used_memory = system.used_memory();
        let memory_usage_percent = (used_memory as f32 / total_memory as f32) * 100.0;

        let current_pid = std::process::id();
        let pid = Pid::from_u32(current_pid);

        let (process_memory, cpu_usage) = if let Some(process) = system.process(pid) {
            (process.memory(), process.cpu_usage())
        } else {
            (0, 0.0)
        };

        self.memory_usage_gauge.set(process_memory as f64);
        self.cpu_usage_gauge.set(cpu_usage as f64);

        if process_memory / 1024 / 1024 > self.config.memory_threshold_mb {
            warn!("High memory usage detected: {}MB", process_memory / 1024 / 1024);
        }
        if cpu_usage > self.config.cpu_threshold_percent {
            warn!("High CPU usage detected: {:.1}%", cpu_usage);
        }

        Ok(SystemMetrics {
            memory_usage_mb: process_memory / 1024 / 1024,
            memory_usage_percent,
            cpu_usage_percent: cpu_usage,
            uptime_seconds: self.start_time.elapsed().as_secs(),
        })
    }

    pub fn generate_report(&self) -> anyhow::Result<PerformanceReport> {
        let system_metrics = self.update_system_metrics()?;

        let processed = self.task_processing_counter.get();
        let task_metrics = TaskMetrics {
            total_tasks_processed: processed as u64,
            average_processing_time_ms: safe_avg_ms(
                self.task_processing_duration.get_sample_sum(),
                self.task_processing_duration.get_sample_count(),
            ),
            tasks_per_minute: (processed / self.start_time.elapsed().as_secs().max(1) as f64) * 60.0,
            error_rate_percent: if processed > 0.0 {
                (self.error_counter.get() / processed) * 100.0
            } else {
                0.0
            },
        };

        let transfer_metrics = TransferMetrics {
            transfers_completed: self.transfer_counter.get() as u64,
            average_duration_ms: safe_avg_ms(
                self.transfer_duration.get_sample_sum(),
                self.transfer_duration.get_sample_count(),
            ),
        };

        let (health_status, recommendations) = self.assess_health(&system_metrics, &task_metrics);

        Ok(PerformanceReport {
            timestamp: chrono::Utc::now(),
            health_status,
            system_metrics,
            task_metrics,
            transfer_metrics,
            recommendations,
        })
    }

    fn assess_health(&self, system: &SystemMetrics, tasks: &TaskMetrics) -> (HealthStatus, Vec<String>) {
        let mut recommendations = Vec::new();
        let mut warnings = Vec::new();
        let mut critical_issues = Vec::new();

        if system.memory_usage_mb > self.config.memory_threshold_mb {
            let issue = format!("High memory usage: {}MB", system.memory_usage_mb);
            if system.memory_usage_mb > self.config.memory_threshold_mb * 2 {
                critical_issues.push(issue);
                recommendations.push("Consider restarting the process or raising memory limits".to_string());
            } else {
                warnings.push(issue);
                recommendations.push("Monitor memory usage and review worker pool sizing".to_string());
            }
        }

        if system.cpu_usage_percent > self.config.cpu_threshold_percent {
            let issue = format!("High CPU usage: {:.1}%", system.cpu_usage_percent);
            if system.cpu_usage_percent > 95.0 {
                critical_issues.push(issue);
                recommendations.push("CPU usage is critically high, consider scaling out".to_string());
            } else {
                warnings.push(issue);
                recommendations.push("Monitor CPU usage".to_string());
            }
        }

        if tasks.error_rate_percent > 5.0 {
            let issue = format!("High task error rate: {:.1}%", tasks.error_rate_percent);
            if tasks.error_rate_percent > 15.0 {
                critical_issues.push(issue);
                recommendations.push("Critical task error rate, investigate upstream or transfer failures".to_string());
            } else {
                warnings.push(issue);
                recommendations.push("Monitor task failures".to_string());
            }
        }

        let health_status = if !critical_issues.is_empty() {
            HealthStatus::Critical(critical_issues.join("; "))
        } else if !warnings.is_empty() {
            HealthStatus::Warning(warnings.join("; "))
        } else {
            HealthStatus::Healthy
        };

        (health_status, recommendations)
    }

    pub fn export_prometheus_metrics(&self) -> anyhow::Result<String> {
        let encoder = TextEncoder::new();
        let metric_families = self.metrics_registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }

    pub async fn start_monitoring_task(self: Arc<Self>) -> anyhow::Result<()> {
        let mut ticker = interval(Duration::from_secs(self.config.metrics_collection_interval_seconds));

        loop {
            ticker.tick().await;

            match self.generate_report() {
                Ok(report) => match &report.health_status {
                    HealthStatus::Healthy => {
                        info!(
                            cpu = report.system_metrics.cpu_usage_percent,
                            memory_mb = report.system_metrics.memory_usage_mb,
                            tasks_processed = report.task_metrics.total_tasks_processed,
                            "system healthy"
                        );
                    }
                    HealthStatus::Warning(msg) => {
                        warn!(recommendations = ?report.recommendations, "system warning: {}", msg);
                    }
                    HealthStatus::Critical(msg) => {
                        error!(recommendations = ?report.recommendations, "system critical: {}", msg);
                    }
                },
                Err(e) => {
                    error!(error = %e, "failed to generate performance report");
                    self.record_error("performance_report_generation");
                }
            }
        }
    }
}

fn safe_avg_ms(sum: f64, count: u64) -> f64 {
    if count == 0 {
        0.0
    } else {
        sum / count as f64 * 1000.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_performance_monitor_records_metrics() {
        let monitor = PerformanceMonitor::new(PerformanceConfig::default()).unwrap();

        monitor.record_task_processed(Duration::from_millis(100));
        monitor.record_transfer(Duration::from_millis(500));
        monitor.record_queue_depth(7);
        monitor.record_error("test_error");

        assert_eq!(monitor.task_processing_counter.get(), 1.0);
        assert_eq!(monitor.transfer_counter.get(), 1.0);
        assert_eq!(monitor.queue_depth_gauge.get(), 7.0);
        assert_eq!(monitor.error_counter.get(), 1.0);
    }

    #[tokio::test]
    async fn test_performance_report_is_healthy_by_default() {
        let monitor = PerformanceMonitor::new(PerformanceConfig::default()).unwrap();
        monitor.record_task_processed(Duration::from_millis(200));

        let report = monitor.generate_report().unwrap();
        assert!(matches!(report.health_status, HealthStatus::Healthy));
        assert_eq!(report.task_metrics.total_tasks_processed, 1);
    }

    #[tokio::test]
    async fn test_prometheus_export_contains_renamed_metrics() {
        let monitor = PerformanceMonitor::new(PerformanceConfig::default()).unwrap();
        monitor.record_task_processed(Duration::from_millis(100));

        let metrics = monitor.export_prometheus_metrics().unwrap();
        assert!(metrics.contains("orchestrator_tasks_processed_total"));
        assert!(metrics.contains("orchestrator_task_processing_duration_seconds"));
    }
}
