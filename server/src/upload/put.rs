//! Single-stream PUT upload handler.
//!
//! The target path and filename are fully validated before any body byte is
//! read. The body then streams through a counting filter into a private temp
//! file, and the handler resolves exactly one terminal outcome: a completed
//! stream moves the file into the staging tree; an exceeded size limit, a
//! write failure, or a request failure deletes the temp file; a dropped
//! request (client abort) cleans up through the temp-file guard without
//! producing a response.

use std::path::{Path, PathBuf};

use axum::body::Body;
use axum::extract::{Path as UrlPath, Request, State};
use axum::http::StatusCode;
use axum::response::Response;
use futures::StreamExt;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{error, info, warn};

use crate::fsops;
use crate::response::{message_response, upload_response, FileOutcome, FileStatus};
use crate::validate::{validate_distro, validate_filename, RepoType};
use crate::web::AppState;

use super::{disabled_response, enabled_for, peer_addr, segments, staging_dir_for};

pub async fn deb(
    State(app): State<AppState>,
    UrlPath(path): UrlPath<String>,
    req: Request,
) -> Response {
    handle(RepoType::Deb, app, path, req).await
}

pub async fn rpm(
    State(app): State<AppState>,
    UrlPath(path): UrlPath<String>,
    req: Request,
) -> Response {
    handle(RepoType::Rpm, app, path, req).await
}

/// The single terminal event of one upload stream.
enum StreamOutcome {
    /// The request body ended and the temp file is complete.
    Completed,
    /// The counting filter tripped the configured size limit.
    LimitExceeded,
    /// Writing the temp file failed.
    WriteError(std::io::Error),
    /// Reading the request body failed.
    RequestError(axum::Error),
}

async fn handle(repo: RepoType, app: AppState, raw_path: String, req: Request) -> Response {
    let Some(parts) = segments(&raw_path) else {
        return message_response(StatusCode::NOT_FOUND, "Unknown upload path");
    };
    let arity_ok = match repo {
        RepoType::Deb => (4..=5).contains(&parts.len()),
        RepoType::Rpm => parts.len() == 3,
    };
    if !arity_ok {
        return message_response(StatusCode::NOT_FOUND, "Unknown upload path");
    }
    if !enabled_for(&app, repo) {
        return disabled_response(repo);
    }

    let (coords, filename) = match parts.split_last() {
        Some((filename, coords)) => (coords.to_vec(), filename.clone()),
        None => return message_response(StatusCode::NOT_FOUND, "Unknown upload path"),
    };

    if !validate_distro(repo, &coords) {
        warn!("invalid distro: {}", coords.join("/"));
        return message_response(
            StatusCode::BAD_REQUEST,
            &format!("Unknown or invalid distro: {repo}/{}", coords.join("/")),
        );
    }

    let rel_path = format!("{repo}/{}/{filename}", coords.join("/"));
    info!(
        "received PUT upload request for {repo}/{}: {filename}",
        coords.join("/")
    );

    if !validate_filename(repo, &filename) {
        warn!("invalid filename: {filename}");
        return upload_response(
            StatusCode::BAD_REQUEST,
            &format!("Invalid filename: {filename}"),
            &[FileStatus {
                filename,
                path: rel_path,
                status: FileOutcome::Failed,
            }],
        );
    }

    let peer = peer_addr(&req);
    let temp_path = app
        .config
        .paths
        .tmp_dir()
        .join(fsops::temp_name(peer, &filename));
    let mut guard = TempFileGuard::new(temp_path.clone());

    let outcome = stream_to_temp(
        req.into_body(),
        &temp_path,
        app.config.upload.size_limit,
    )
    .await;

    let entry = |status| {
        [FileStatus {
            filename: filename.clone(),
            path: rel_path.clone(),
            status,
        }]
    };

    match outcome {
        StreamOutcome::Completed => {
            let target_dir = staging_dir_for(&app, repo, &coords);
            let target_path = target_dir.join(&filename);
            let moved = app
                .lock
                .with_move(fsops::move_file(&temp_path, &target_dir, &target_path))
                .await;
            match moved {
                Ok(()) => {
                    guard.disarm();
                    upload_response(
                        StatusCode::CREATED,
                        "File uploaded successfully",
                        &entry(FileOutcome::Ok),
                    )
                }
                Err(err) => {
                    error!(
                        "error finalizing PUT upload for {}: {err}",
                        temp_path.display()
                    );
                    guard.cleanup().await;
                    upload_response(
                        StatusCode::INTERNAL_SERVER_ERROR,
                        "Failed to finalize upload",
                        &entry(FileOutcome::Failed),
                    )
                }
            }
        }
        StreamOutcome::LimitExceeded => {
            warn!("PUT upload size limit exceeded");
            guard.cleanup().await;
            upload_response(
                StatusCode::PAYLOAD_TOO_LARGE,
                "File size exceeded",
                &entry(FileOutcome::Failed),
            )
        }
        StreamOutcome::WriteError(err) => {
            error!("write stream error during PUT: {err}");
            guard.cleanup().await;
            upload_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Error writing file during upload",
                &entry(FileOutcome::Failed),
            )
        }
        StreamOutcome::RequestError(err) => {
            error!("request stream error during PUT: {err}");
            guard.cleanup().await;
            upload_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Error receiving file data during upload",
                &entry(FileOutcome::Failed),
            )
        }
    }
}

async fn stream_to_temp(body: Body, temp_path: &Path, limit: Option<u64>) -> StreamOutcome {
    let mut file = match fs::File::create(temp_path).await {
        Ok(file) => file,
        Err(err) => return StreamOutcome::WriteError(err),
    };
    let mut counter = LimitCounter::new(limit);
    let mut stream = body.into_data_stream();
    loop {
        match stream.next().await {
            Some(Ok(chunk)) => {
                // The tripping chunk is not forwarded to the file.
                if counter.exceeds(chunk.len()) {
                    return StreamOutcome::LimitExceeded;
                }
                if let Err(err) = file.write_all(&chunk).await {
                    return StreamOutcome::WriteError(err);
                }
            }
            Some(Err(err)) => return StreamOutcome::RequestError(err),
            None => {
                return match file.flush().await {
                    Ok(()) => StreamOutcome::Completed,
                    Err(err) => StreamOutcome::WriteError(err),
                }
            }
        }
    }
}

/// Counts forwarded bytes against an optional limit.
struct LimitCounter {
    limit: Option<u64>,
    written: u64,
}

impl LimitCounter {
    fn new(limit: Option<u64>) -> Self {
        Self { limit, written: 0 }
    }

    /// Account for a chunk; true once the total passes the limit.
    fn exceeds(&mut self, chunk_len: usize) -> bool {
        let Some(limit) = self.limit else {
            return false;
        };
        self.written += chunk_len as u64;
        self.written > limit
    }
}

/// Deletes the temp file when the upload ends without an explicit outcome —
/// which is exactly the dropped-request (client abort) path.
struct TempFileGuard {
    path: PathBuf,
    armed: bool,
}

impl TempFileGuard {
    fn new(path: PathBuf) -> Self {
        Self { path, armed: true }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }

    async fn cleanup(&mut self) {
        self.armed = false;
        info!("cleaning up temporary file: {}", self.path.display());
        super::remove_quietly(&self.path).await;
    }
}

impl Drop for TempFileGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let path = self.path.clone();
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                let _ = tokio::fs::remove_file(&path).await;
            });
        }
    }
}
