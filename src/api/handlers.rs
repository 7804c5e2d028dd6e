use crate::api::LivenessState;
use crate::error::AppError;
use crate::messaging::metrics::gather_metrics;
use axum::{
    extract::State,
    http::{header, StatusCode, Uri},
    response::{Html, IntoResponse},
    Json,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt::Write as _;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub timestamp: DateTime<Utc>,
    pub service: String,
    /// Seconds since process start
    pub uptime: f64,
}

/// Liveness check; never consults the broker
pub async fn health_check(State(state): State<LivenessState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        timestamp: Utc::now(),
        service: state.service.clone(),
        uptime: state.uptime().as_secs_f64(),
    })
}

/// Human-readable status page
pub async fn status_page(State(state): State<LivenessState>) -> Html<String> {
    let uptime = state.uptime().as_secs();
    let mut consumers = String::new();

    match &state.orchestrator {
        Some(orchestrator) => {
            let status = orchestrator.status();
            let _ = write!(
                consumers,
                "<p>Consumers: <strong>{}</strong> (broker {})</p><ul>",
                status.state,
                if status.broker_ready { "connected" } else { "disconnected" }
            );
            for kind in &status.registered_kinds {
                let active = status.active_kinds.contains(kind);
                let _ = write!(
                    consumers,
                    "<li>{}: {}</li>",
                    kind,
                    if active { "active" } else { "inactive" }
                );
            }
            consumers.push_str("</ul>");
        }
        None => consumers.push_str("<p>Consumers: not attached</p>"),
    }

    Html(format!(
        r#"<!DOCTYPE html>
<html>
<head>
    <meta charset="UTF-8">
    <title>{service}</title>
</head>
<body>
    <h1>{service}</h1>
    <p>Status: <strong>healthy</strong></p>
    <p>Version: {version}</p>
    <p>Started: {started}</p>
    <p>Uptime: {hours}h {minutes}m {seconds}s</p>
    {consumers}
</body>
</html>
"#,
        service = state.service,
        version = env!("CARGO_PKG_VERSION"),
        started = state.started_at.format("%Y-%m-%d %H:%M:%S UTC"),
        hours = uptime / 3600,
        minutes = (uptime % 3600) / 60,
        seconds = uptime % 60,
        consumers = consumers,
    ))
}

/// 404 for every unknown path
pub async fn not_found(uri: Uri) -> AppError {
    AppError::NotFound(format!("Route {} not found", uri.path()))
}

/// Prometheus text exposition
pub async fn metrics() -> impl IntoResponse {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        gather_metrics(),
    )
}
