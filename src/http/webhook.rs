use actix_web::http::Method;
use actix_web::{web, App, HttpRequest, HttpResponse, HttpServer};
use tracing::{info, warn};

use crate::config::SharedConfig;
use crate::queue_bus::{PublishOptions, Priority, QueueBus};

#[derive(Clone)]
struct WebhookState {
    config: SharedConfig,
    queue_bus: std::sync::Arc<QueueBus>,
}

/// Signed webhook ingress plus the config hot-reload endpoint, grounded in the
/// teacher's `internal_processor::InternalProcessor` App/route/handler idiom
/// (one `App::new().app_data(...).route(...)` per concern, handlers taking
/// `web::Data<T>` + `web::Bytes`/`web::Json`).
pub async fn run(bind_addr: &str, config: SharedConfig, queue_bus: std::sync::Arc<QueueBus>) -> anyhow::Result<()> {
    let state = WebhookState { config, queue_bus };

    info!(bind_addr, "starting webhook server");
    HttpServer::new(move || {
        App::new()
            .app_data(web::Data::new(state.clone()))
            .route("/api/v2/tasks/{topic}", web::post().to(ingest_task))
            .route("/api/v2/config/refresh", web::route().to(config_refresh_route))
    })
    .bind(bind_addr)?
    .run()
    .await?;
    Ok(())
}

/// `POST` reloads the config; any other method falls through to the generic
/// signed-webhook handler instead of 404ing, per SPEC_FULL.md §6.
async fn config_refresh_route(
    req: HttpRequest,
    body: web::Bytes,
    state: web::Data<WebhookState>,
) -> HttpResponse {
    if req.method() == Method::POST {
        refresh_config(state).await
    } else {
        handle_webhook("config-refresh", &body, &req, &state).await
    }
}

async fn ingest_task(
    path: web::Path<String>,
    body: web::Bytes,
    req: HttpRequest,
    state: web::Data<WebhookState>,
) -> HttpResponse {
    let topic = path.into_inner();
    handle_webhook(&topic, &body, &req, &state).await
}

async fn handle_webhook(topic: &str, body: &web::Bytes, req: &HttpRequest, state: &WebhookState) -> HttpResponse {
    let cfg = state.config.load();

    let signature = match req.headers().get("upstash-signature").and_then(|v| v.to_str().ok()) {
        Some(s) => s.to_string(),
        None => return HttpResponse::Unauthorized().body("missing signature"),
    };

    let valid = crate::queue_bus::verify_webhook_signature(
        body,
        &signature,
        &cfg.security.webhook_signing_key_current,
        Some(&cfg.security.webhook_signing_key_next),
    );
    if !valid {
        warn!(topic, "rejected webhook with invalid signature");
        return HttpResponse::Unauthorized().body("invalid signature");
    }

    let payload: serde_json::Value = match serde_json::from_slice(body) {
        Ok(v) => v,
        Err(e) => return HttpResponse::BadRequest().body(format!("invalid json: {e}")),
    };

    let priority = payload
        .get("priority")
        .and_then(|v| v.as_str())
        .map(parse_priority)
        .unwrap_or(Priority::Normal);

    match state
        .queue_bus
        .publish(topic, payload, PublishOptions { priority, force_direct: false })
        .await
    {
        Ok(_outcome) => HttpResponse::Ok().body("OK"),
        Err(e) => {
            warn!(topic, error = %e, "failed to publish webhook payload");
            HttpResponse::ServiceUnavailable().body(e.to_string())
        }
    }
}

fn parse_priority(s: &str) -> Priority {
    match s {
        "critical" => Priority::Critical,
        "high" => Priority::High,
        "low" => Priority::Low,
        _ => Priority::Normal,
    }
}

async fn refresh_config(state: web::Data<WebhookState>) -> HttpResponse {
    match state.config.refresh() {
        Ok(()) => HttpResponse::Ok().json(serde_json::json!({"success": true, "message": "config reloaded"})),
        Err(e) => {
            warn!(error = %e, "config refresh failed");
            HttpResponse::InternalServerError().json(serde_json::json!({"success": false, "message": e.to_string()}))
        }
    }
}
