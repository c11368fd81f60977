//! JSON response envelopes for the upload API.

use axum::http::header::RETRY_AFTER;
use axum::http::{HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

/// Final status of one file within an upload request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FileOutcome {
    Ok,
    Failed,
}

/// Per-file entry of an upload response body.
#[derive(Debug, Clone, Serialize)]
pub struct FileStatus {
    /// Filename as uploaded.
    pub filename: String,
    /// Repository-relative path the file was (or would have been) staged at.
    pub path: String,
    /// Outcome for this file.
    pub status: FileOutcome,
}

#[derive(Serialize)]
struct UploadBody<'a> {
    message: &'a str,
    files: &'a [FileStatus],
}

/// Upload response carrying every file's final status.
pub fn upload_response(status: StatusCode, message: &str, files: &[FileStatus]) -> Response {
    (status, Json(UploadBody { message, files })).into_response()
}

/// Message-only response.
pub fn message_response(status: StatusCode, message: &str) -> Response {
    (status, Json(serde_json::json!({ "message": message }))).into_response()
}

/// Message response with a `Retry-After` header, for temporarily unavailable
/// functionality.
pub fn retry_after_response(status: StatusCode, message: &str, retry_after_secs: u32) -> Response {
    let mut response = message_response(status, message);
    response
        .headers_mut()
        .insert(RETRY_AFTER, HeaderValue::from(retry_after_secs));
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_status_serializes_lowercase() {
        let status = FileStatus {
            filename: "a.deb".to_string(),
            path: "deb/debian/bookworm/main/a.deb".to_string(),
            status: FileOutcome::Ok,
        };
        let value = serde_json::to_value(&status).unwrap();
        assert_eq!(value["status"], "ok");
    }

    #[test]
    fn retry_after_header_is_set() {
        let response = retry_after_response(
            StatusCode::SERVICE_UNAVAILABLE,
            "No repository tool available",
            3600,
        );
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(
            response.headers().get(RETRY_AFTER).unwrap(),
            &HeaderValue::from_static("3600")
        );
    }
}
