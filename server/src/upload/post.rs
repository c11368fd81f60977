//! Multipart batch upload handler.
//!
//! Every file of the batch is decoded to the private temp area first (with
//! aggregate size accounting), then the shared target path is validated,
//! then each file is validated and moved into the staging tree
//! individually. Invalid filenames fail their own entry and make the whole
//! batch a 400; move failures fail their own entry and make it a 500;
//! everything clean is a 201. The body always lists every file's status.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use axum::extract::multipart::{Field, Multipart};
use axum::extract::{FromRequest, Path as UrlPath, Request, State};
use axum::http::StatusCode;
use axum::response::Response;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, error, info, warn};

use crate::fsops;
use crate::response::{message_response, upload_response, FileOutcome, FileStatus};
use crate::validate::{validate_distro, validate_filename, RepoType};
use crate::web::AppState;

use super::{
    disabled_response, enabled_for, peer_addr, remove_quietly, segments, staging_dir_for,
};

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

struct TempFile {
    original_name: String,
    temp_path: PathBuf,
}

enum BatchFailure {
    /// Aggregate file bytes passed the configured limit.
    TooLarge,
    /// A file arrived under an unexpected field name.
    UnexpectedField(String),
    /// The multipart stream could not be decoded.
    Decode(String),
}

async fn handle(repo: RepoType, app: AppState, raw_path: String, req: Request) -> Response {
    let Some(parts) = segments(&raw_path) else {
        return message_response(StatusCode::NOT_FOUND, "Unknown upload path");
    };
    let arity_ok = match repo {
        RepoType::Deb => (3..=4).contains(&parts.len()),
        RepoType::Rpm => parts.len() == 2,
    };
    if !arity_ok {
        return message_response(StatusCode::NOT_FOUND, "Unknown upload path");
    }
    if !enabled_for(&app, repo) {
        return disabled_response(repo);
    }

    let peer = peer_addr(&req);
    let multipart = match Multipart::from_request(req, &()).await {
        Ok(multipart) => multipart,
        Err(err) => {
            warn!("not a usable multipart request: {err}");
            return message_response(
                StatusCode::BAD_REQUEST,
                "Expected a multipart/form-data upload",
            );
        }
    };

    // Decode to the temp area before validating anything: the decoder owns
    // the request body, and per-file statuses need the full batch.
    let decoded = match decode_batch(&app, peer, multipart).await {
        Ok(decoded) => decoded,
        Err(failure) => return batch_failure_response(&app, failure),
    };

    if decoded.is_empty() {
        return message_response(
            StatusCode::BAD_REQUEST,
            &format!(
                "No files uploaded, expected field name \"{}\"",
                app.config.upload.post_field
            ),
        );
    }
    debug!("processing {} files", decoded.len());

    if !validate_distro(repo, &parts) {
        warn!("invalid distro: {}", parts.join("/"));
        delete_temp_files(&decoded).await;
        return message_response(
            StatusCode::BAD_REQUEST,
            &format!("Unknown or invalid distro: {repo}/{}", parts.join("/")),
        );
    }

    info!(
        "received {} file{} via POST for {repo}/{}: {}",
        decoded.len(),
        if decoded.len() > 1 { "s" } else { "" },
        parts.join("/"),
        decoded
            .iter()
            .map(|file| file.original_name.as_str())
            .collect::<Vec<_>>()
            .join(", ")
    );

    let target_dir = staging_dir_for(&app, repo, &parts);
    let mut files = Vec::new();
    let mut client_error = false;
    let mut server_error = false;

    for file in &decoded {
        let rel_path = format!("{repo}/{}/{}", parts.join("/"), file.original_name);
        if !validate_filename(repo, &file.original_name) {
            warn!("invalid filename: {}", file.original_name);
            client_error = true;
            remove_quietly(&file.temp_path).await;
            files.push(FileStatus {
                filename: file.original_name.clone(),
                path: rel_path,
                status: FileOutcome::Failed,
            });
            continue;
        }

        let target_path = target_dir.join(&file.original_name);
        let moved = app
            .lock
            .with_move(fsops::move_file(&file.temp_path, &target_dir, &target_path))
            .await;
        match moved {
            Ok(()) => files.push(FileStatus {
                filename: file.original_name.clone(),
                path: rel_path,
                status: FileOutcome::Ok,
            }),
            Err(err) => {
                error!("failed to process {}: {err}", file.original_name);
                server_error = true;
                remove_quietly(&file.temp_path).await;
                files.push(FileStatus {
                    filename: file.original_name.clone(),
                    path: rel_path,
                    status: FileOutcome::Failed,
                });
            }
        }
    }

    if client_error {
        upload_response(
            StatusCode::BAD_REQUEST,
            "One or more files failed to upload",
            &files,
        )
    } else if server_error {
        upload_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            "One or more files failed to upload",
            &files,
        )
    } else {
        upload_response(
            StatusCode::CREATED,
            "All files uploaded successfully",
            &files,
        )
    }
}

/// Write every file field to the temp area, counting aggregate file bytes
/// against the configured limit. Any failure deletes everything already
/// written for this batch.
async fn decode_batch(
    app: &AppState,
    peer: Option<SocketAddr>,
    mut multipart: Multipart,
) -> Result<Vec<TempFile>, BatchFailure> {
    let tmp_dir = app.config.paths.tmp_dir();
    let limit = app.config.upload.size_limit;
    let mut total: u64 = 0;
    let mut saved: Vec<TempFile> = Vec::new();

    loop {
        let field = match multipart.next_field().await {
            Ok(Some(field)) => field,
            Ok(None) => break,
            Err(err) => {
                delete_temp_files(&saved).await;
                return Err(BatchFailure::Decode(err.to_string()));
            }
        };
        // Non-file fields are ignored.
        let Some(file_name) = field.file_name().map(str::to_string) else {
            continue;
        };
        let field_name = field.name().unwrap_or_default().to_string();
        if field_name != app.config.upload.post_field {
            delete_temp_files(&saved).await;
            return Err(BatchFailure::UnexpectedField(field_name));
        }

        let original_name = fsops::base_name(&file_name).to_string();
        let temp_path = tmp_dir.join(fsops::temp_name(peer, &fsops::sanitize_filename(&file_name)));
        match save_field(field, &temp_path, limit, &mut total).await {
            Ok(()) => saved.push(TempFile {
                original_name,
                temp_path,
            }),
            Err(failure) => {
                remove_quietly(&temp_path).await;
                delete_temp_files(&saved).await;
                return Err(failure);
            }
        }
    }
    Ok(saved)
}

async fn save_field(
    mut field: Field<'_>,
    temp_path: &Path,
    limit: Option<u64>,
    total: &mut u64,
) -> Result<(), BatchFailure> {
    let mut file = fs::File::create(temp_path)
        .await
        .map_err(|err| BatchFailure::Decode(err.to_string()))?;
    loop {
        let chunk = match field.chunk().await {
            Ok(Some(chunk)) => chunk,
            Ok(None) => break,
            Err(err) => return Err(BatchFailure::Decode(err.to_string())),
        };
        *total += chunk.len() as u64;
        if let Some(limit) = limit {
            if *total > limit {
                return Err(BatchFailure::TooLarge);
            }
        }
        file.write_all(&chunk)
            .await
            .map_err(|err| BatchFailure::Decode(err.to_string()))?;
    }
    file.flush()
        .await
        .map_err(|err| BatchFailure::Decode(err.to_string()))
}

async fn delete_temp_files(files: &[TempFile]) {
    for file in files {
        remove_quietly(&file.temp_path).await;
    }
}

fn batch_failure_response(app: &AppState, failure: BatchFailure) -> Response {
    match failure {
        BatchFailure::TooLarge => {
            warn!("file size limit exceeded");
            message_response(StatusCode::PAYLOAD_TOO_LARGE, "File too large")
        }
        BatchFailure::UnexpectedField(field) => {
            warn!("wrong field \"{field}\" used to upload file");
            message_response(
                StatusCode::BAD_REQUEST,
                &format!(
                    "Wrong field used to upload file, expected field name \"{}\"",
                    app.config.upload.post_field
                ),
            )
        }
        BatchFailure::Decode(err) => {
            error!("multipart upload error: {err}");
            message_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Upload error, see server logs for details",
            )
        }
    }
}
