//! Repository build trigger.
//!
//! Runs the whole build — staging snapshot plus both orchestrators — as one
//! exec-once operation, so concurrent build requests collapse onto a single
//! build and share its result map. The snapshot is gated on at least one
//! enabled indexer; without a consumer, staged uploads stay in the staging
//! tree instead of being stranded in the processing tree.

use std::collections::BTreeMap;
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::Response;
use tracing::error;

use crate::deb;
use crate::error::ServerError;
use crate::exec::ExecResult;
use crate::fsops;
use crate::response::{message_response, retry_after_response};
use crate::rpm;
use crate::web::AppState;

/// Shared outcome of one coalesced repository build.
pub type BuildOutcome = Result<BTreeMap<String, ExecResult>, Arc<ServerError>>;

pub async fn handle(State(app): State<AppState>) -> Response {
    if !app.config.upload.enabled.any() {
        return retry_after_response(
            StatusCode::SERVICE_UNAVAILABLE,
            "No repository tool available",
            3600,
        );
    }

    let results = match app.lock.exec_once(run_build(app.clone())).await {
        Ok(Ok(results)) => results,
        Ok(Err(err)) => {
            error!("error during repository build: {err}");
            return message_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "An unexpected server error occurred. See server logs for details",
            );
        }
        Err(cancelled) => {
            error!("repository build did not complete: {cancelled}");
            return message_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "An unexpected server error occurred. See server logs for details",
            );
        }
    };

    if results.is_empty() {
        message_response(StatusCode::OK, "No files to process")
    } else if results.values().all(ExecResult::ok) {
        message_response(
            StatusCode::OK,
            "Repository build script executed successfully",
        )
    } else {
        message_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            "Repository build script execution failed. See server logs for details",
        )
    }
}

/// The exec-once body: freeze the staging tree into the processing tree,
/// then run the enabled orchestrators over the snapshot.
async fn run_build(app: AppState) -> BuildOutcome {
    fsops::move_tree(
        &app.config.paths.staging_dir(),
        &app.config.paths.process_dir(),
    )
    .await
    .map_err(Arc::new)?;

    let mut results = BTreeMap::new();
    if app.config.upload.enabled.deb {
        results.extend(deb::process_incoming(&app.config).await.map_err(Arc::new)?);
    }
    if app.config.upload.enabled.rpm {
        results.extend(rpm::process_incoming(&app.config).await.map_err(Arc::new)?);
    }
    Ok(results)
}
