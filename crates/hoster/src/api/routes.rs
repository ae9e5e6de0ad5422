//! API route definitions.

use axum::extract::DefaultBodyLimit;
use axum::{
    Router,
    routing::{get, post},
};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::{DefaultMakeSpan, DefaultOnRequest, DefaultOnResponse, TraceLayer};
use tracing::Level;

use super::handlers;
use super::state::AppState;

/// Multipart framing allowance on top of the configured upload limit.
const MULTIPART_OVERHEAD: u64 = 1024 * 1024;

/// Routes that act on one server instance.
fn instance_routes() -> Router<AppState> {
    Router::new()
        // Process lifecycle
        .route("/start_server", post(handlers::start_server))
        .route("/stop_server", post(handlers::stop_server))
        .route("/restart_server", post(handlers::restart_server))
        .route("/send_command", post(handlers::send_command))
        // Console and status
        .route("/get_console_log", get(handlers::get_console_log))
        .route("/console_stream", get(handlers::console_stream))
        .route("/get_server_status", get(handlers::get_server_status))
        // Files
        .route("/upload_file", post(handlers::upload_file))
        .route("/list_files", get(handlers::list_files))
        .route("/download_file/{*path}", get(handlers::download_file))
        // Backups
        .route("/backup_server", post(handlers::backup_server))
        .route("/list_backups", get(handlers::list_backups))
}

/// Create the application router.
///
/// Instance routes are served unprefixed for the default instance and under
/// `/instances/{instance}` for every configured instance.
pub fn create_router(state: AppState, max_upload_size: u64) -> Router {
    let max_body_size = usize::try_from(max_upload_size.saturating_add(MULTIPART_OVERHEAD))
        .unwrap_or(usize::MAX);

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let trace_layer = TraceLayer::new_for_http()
        .make_span_with(DefaultMakeSpan::new().level(Level::DEBUG))
        .on_request(DefaultOnRequest::new().level(Level::DEBUG))
        .on_response(DefaultOnResponse::new().level(Level::DEBUG));

    Router::new()
        .route("/health", get(handlers::health))
        .route("/instances", get(handlers::list_instances))
        .merge(instance_routes())
        .nest("/instances/{instance}", instance_routes())
        .layer(DefaultBodyLimit::max(max_body_size))
        .layer(cors)
        .layer(trace_layer)
        .with_state(state)
}
