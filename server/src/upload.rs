//! Intake handlers: multipart batch uploads, single-stream PUT uploads, and
//! the repository build trigger.

pub mod build;
pub mod post;
pub mod put;

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use axum::extract::{ConnectInfo, Request};
use axum::http::StatusCode;
use axum::response::Response;
use tracing::error;

use crate::response::retry_after_response;
use crate::validate::RepoType;
use crate::web::AppState;

/// Split a wildcard-captured upload path into its segments. Empty segments
/// (leading, trailing, or doubled slashes) make the path unknown.
pub(crate) fn segments(raw: &str) -> Option<Vec<String>> {
    let parts: Vec<&str> = raw.split('/').collect();
    if parts.iter().any(|part| part.is_empty()) {
        return None;
    }
    Some(parts.into_iter().map(str::to_string).collect())
}

/// Peer address, when the server was started with connect-info.
pub(crate) fn peer_addr(req: &Request) -> Option<SocketAddr> {
    req.extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0)
}

pub(crate) fn enabled_for(app: &AppState, repo: RepoType) -> bool {
    match repo {
        RepoType::Deb => app.config.upload.enabled.deb,
        RepoType::Rpm => app.config.upload.enabled.rpm,
    }
}

pub(crate) fn disabled_response(repo: RepoType) -> Response {
    let message = match repo {
        RepoType::Deb => "The Debian upload functionality is disabled",
        RepoType::Rpm => "The RedHat upload functionality is disabled",
    };
    retry_after_response(StatusCode::SERVICE_UNAVAILABLE, message, 3600)
}

/// Staging directory for a validated upload target.
pub(crate) fn staging_dir_for(app: &AppState, repo: RepoType, coords: &[String]) -> PathBuf {
    let mut dir = app.config.paths.staging_dir().join(repo.as_str());
    for part in coords {
        dir.push(part);
    }
    dir
}

/// Best-effort temp file removal; a missing file is not an error.
pub(crate) async fn remove_quietly(path: &Path) {
    if let Err(err) = tokio::fs::remove_file(path).await {
        if err.kind() != std::io::ErrorKind::NotFound {
            error!(
                "error cleaning up temporary file {}: {err}",
                path.display()
            );
        }
    }
}
