use std::env;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde_json::json;
use tracing::warn;
use warp::{http::StatusCode, Filter, Rejection, Reply};

use crate::coordinator::InstanceCoordinator;
use crate::queue_bus::QueueBus;
use crate::utils::performance::PerformanceMonitor;

#[derive(Debug)]
struct Unauthorized;
impl warp::reject::Reject for Unauthorized {}

/// Public `/health`/`/healthz` plus bearer-authenticated `/metrics`, grounded
/// in the teacher's `utils::health::TierHealthServer` filter composition
/// (optional auth token read from the environment, health endpoint always
/// public). `/ready` is gated on a flag the caller flips once
/// `Scheduler::init()` and `coordinator.start()` have both succeeded.
pub struct MetricsServer {
    performance_monitor: Arc<PerformanceMonitor>,
    coordinator: Arc<InstanceCoordinator>,
    queue_bus: Option<Arc<QueueBus>>,
    ready: Arc<AtomicBool>,
    port: u16,
}

impl MetricsServer {
    pub fn new(
        performance_monitor: Arc<PerformanceMonitor>,
        coordinator: Arc<InstanceCoordinator>,
        queue_bus: Option<Arc<QueueBus>>,
        ready: Arc<AtomicBool>,
        port: u16,
    ) -> Self {
        Self {
            performance_monitor,
            coordinator,
            queue_bus,
            ready,
            port,
        }
    }

    pub async fn start(self) -> anyhow::Result<()> {
        let auth_token = env::var("ORCHESTRATOR_METRICS_TOKEN").ok();
        if auth_token.is_none() {
            warn!("ORCHESTRATOR_METRICS_TOKEN not set, /metrics will not require authentication");
        }

        let auth = warp::header::optional::<String>("authorization").and_then(move |header: Option<String>| {
            let token = auth_token.clone();
            async move {
                match token {
                    None => Ok::<(), Rejection>(()),
                    Some(expected) => match header {
                        Some(h) if h == format!("Bearer {expected}") => Ok(()),
                        _ => Err(warp::reject::custom(Unauthorized)),
                    },
                }
            }
        });

        let coordinator = self.coordinator.clone();
        let health = warp::path("health").or(warp::path("healthz")).unify().and(warp::get()).and_then(move || {
            let coordinator = coordinator.clone();
            async move { handle_health(coordinator).await }
        });

        let ready_flag = self.ready.clone();
        let readyz = warp::path("ready").and(warp::get()).and_then(move || {
            let ready_flag = ready_flag.clone();
            async move { handle_ready(ready_flag).await }
        });

        let monitor = self.performance_monitor.clone();
        let queue_bus = self.queue_bus.clone();
        let metrics = warp::path("metrics").and(warp::get()).and(auth).and_then(move |_: ()| {
            let monitor = monitor.clone();
            let queue_bus = queue_bus.clone();
            async move { handle_metrics(monitor, queue_bus).await }
        });

        let routes = health.or(readyz).or(metrics).recover(handle_rejection);

        warp::serve(routes).run(([0, 0, 0, 0], self.port)).await;
        Ok(())
    }
}

async fn handle_health(coordinator: Arc<InstanceCoordinator>) -> Result<impl Reply, Rejection> {
    let is_leader = coordinator.is_leader().await.unwrap_or(false);
    let active = coordinator.active_instances().await.unwrap_or_default();
    Ok(warp::reply::json(&json!({
        "status": "ok",
        "instance_id": coordinator.instance_id(),
        "is_leader": is_leader,
        "active_instances": active.len(),
    })))
}

async fn handle_ready(ready: Arc<AtomicBool>) -> Result<impl Reply, Rejection> {
    if ready.load(Ordering::SeqCst) {
        Ok(warp::reply::with_status(warp::reply::json(&json!({"ready": true})), StatusCode::OK))
    } else {
        Ok(warp::reply::with_status(warp::reply::json(&json!({"ready": false})), StatusCode::SERVICE_UNAVAILABLE))
    }
}

async fn handle_metrics(
    monitor: Arc<PerformanceMonitor>,
    queue_bus: Option<Arc<QueueBus>>,
) -> Result<impl Reply, Rejection> {
    if let Some(bus) = queue_bus {
        if let Ok(depth) = bus.queue_depth("tasks").await {
            monitor.record_queue_depth(depth);
        }
    }
    let _ = monitor.update_system_metrics();

    match monitor.export_prometheus_metrics() {
        Ok(body) => Ok(warp::reply::with_status(body, StatusCode::OK)),
        Err(e) => {
            warn!(error = %e, "failed to export prometheus metrics");
            Ok(warp::reply::with_status(String::new(), StatusCode::INTERNAL_SERVER_ERROR))
        }
    }
}

async fn handle_rejection(err: Rejection) -> Result<impl Reply, std::convert::Infallible> {
    if err.find::<Unauthorized>().is_some() {
        Ok(warp::reply::with_status(
            warp::reply::json(&json!({"error": "unauthorized"})),
            StatusCode::UNAUTHORIZED,
        ))
    } else {
        Ok(warp::reply::with_status(
            warp::reply::json(&json!({"error": "not found"})),
            StatusCode::NOT_FOUND,
        ))
    }
}
