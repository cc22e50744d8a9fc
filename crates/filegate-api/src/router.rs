use std::sync::Arc;

use axum::Router;
use axum::extract::DefaultBodyLimit;
use axum::routing::{delete, get, post};
use filegate_store::stats::StatsCache;
use filegate_store::traits::ObjectStore;
use filegate_upload::UploadCoordinator;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::handlers;

/// Upper bound on any request body, sized for the single-shot upload path.
/// Chunked uploads stay far below this per request.
const MAX_BODY_BYTES: usize = 512 * 1024 * 1024;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn ObjectStore>,
    pub coordinator: Arc<UploadCoordinator>,
    pub stats: Arc<StatsCache>,
}

pub fn api_router(state: AppState) -> Router {
    Router::new()
        .route("/api/health", get(handlers::health::health))
        .route("/api/list", get(handlers::browse::list))
        .route("/api/download/{*path}", get(handlers::browse::download))
        .route("/api/delete/{*path}", delete(handlers::browse::delete))
        .route("/api/stats", get(handlers::stats::stats))
        .route("/api/upload", post(handlers::upload::upload))
        .route("/api/presign", post(handlers::upload::presign))
        .route(
            "/api/multipart/initiate",
            post(handlers::multipart::initiate),
        )
        .route(
            "/api/multipart/upload-chunk",
            post(handlers::multipart::upload_chunk),
        )
        .route("/api/multipart/abort", post(handlers::multipart::abort))
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
