use crate::api::{handlers, LivenessState};
use axum::{routing::get, Router};
use tower_http::trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer};

/// Build the liveness router: `/`, `/health`, JSON 404 for anything else
pub fn build_liveness_router(state: LivenessState) -> Router {
    Router::new()
        .route("/", get(handlers::status_page))
        .route("/health", get(handlers::health_check))
        .fallback(handlers::not_found)
        .with_state(state)
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new())
                .on_response(DefaultOnResponse::new()),
        )
}

/// Build the metrics router, served on its own port
pub fn build_metrics_router() -> Router {
    Router::new()
        .route("/metrics", get(handlers::metrics))
        .fallback(handlers::not_found)
        .layer(TraceLayer::new_for_http())
}
