//! Router assembly and shared service state.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{DefaultBodyLimit, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use depot_lock::OpLock;
use tokio::fs;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::config::Config;
use crate::error::ServerResult;
use crate::response::message_response;
use crate::upload::{self, build::BuildOutcome};

/// Shared application state: the configuration and the explicitly owned
/// move/exec coordinator handed to the intake and build handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub lock: OpLock<BuildOutcome>,
}

impl AppState {
    pub fn new(config: Config) -> Self {
        Self {
            config: Arc::new(config),
            lock: OpLock::new(),
        }
    }
}

/// Create the intake directory layout for the enabled repository types.
pub async fn prepare_layout(config: &Config) -> ServerResult<()> {
    fs::create_dir_all(config.paths.tmp_dir()).await?;
    for (enabled, repo) in [
        (config.upload.enabled.deb, "deb"),
        (config.upload.enabled.rpm, "rpm"),
    ] {
        if enabled {
            fs::create_dir_all(config.paths.staging_dir().join(repo)).await?;
            fs::create_dir_all(config.paths.process_dir().join(repo)).await?;
        }
    }
    Ok(())
}

/// Build the service router.
pub fn router(state: AppState) -> Router {
    let upload_routes = Router::new()
        .route("/status", get(api_status))
        .route(
            "/deb/{*path}",
            post(upload::post::deb).put(upload::put::deb),
        )
        .route(
            "/rpm/{*path}",
            post(upload::post::rpm).put(upload::put::rpm),
        )
        .route("/build-repo", post(upload::build::handle))
        .fallback(unknown_upload);

    let api = Router::new()
        .route("/status", get(api_status))
        .nest("/upload", upload_routes)
        .route("/repo/import", post(upload::build::handle))
        .fallback(unknown_api);

    Router::new()
        .route("/status", get(service_status))
        .nest("/api/v1", api)
        .layer(DefaultBodyLimit::disable())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve the router until the process is stopped.
pub async fn serve(state: AppState, bind: &str) -> ServerResult<()> {
    let app = router(state);
    let listener = tokio::net::TcpListener::bind(bind).await?;
    info!(
        "package repository service listening on {}",
        listener.local_addr()?
    );
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;
    Ok(())
}

async fn service_status() -> impl IntoResponse {
    "Package repository service is running.\n"
}

async fn api_status(State(app): State<AppState>) -> Response {
    Json(serde_json::json!({
        "message": "Package repository API is running",
        "api": {
            "deb": { "enabled": app.config.upload.enabled.deb },
            "rpm": { "enabled": app.config.upload.enabled.rpm },
        },
    }))
    .into_response()
}

async fn unknown_upload() -> Response {
    message_response(StatusCode::NOT_FOUND, "Unknown upload path")
}

async fn unknown_api() -> Response {
    message_response(StatusCode::NOT_FOUND, "Unknown API")
}
