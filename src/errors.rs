//! Upload error types.
//!
//! Every failure an upload can hit is a variant of [`UploadError`].  The
//! upload handler turns all of them into a redirect with a flash message,
//! except [`UploadError::PayloadTooLarge`], which is a client error and
//! goes out through the [`IntoResponse`] impl as a 413.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

/// Message shown when the form arrives without a usable file part.
pub const NO_FILE_SELECTED: &str = "No file selected";

/// Everything that can stop an upload.
#[derive(Debug, Error)]
pub enum UploadError {
    /// The `file` part is missing or has an empty filename.
    #[error("No file selected")]
    NoFileSelected,

    /// The file exceeds the configured maximum size.
    #[error("File exceeds the maximum upload size of {limit} bytes")]
    PayloadTooLarge { limit: usize },

    /// The multipart body could not be parsed.
    #[error("Malformed upload: {0}")]
    Multipart(String),

    /// The managed identity token could not be obtained.
    #[error("Authentication failed: {0}")]
    Authentication(#[source] anyhow::Error),

    /// Container creation or blob write failed.
    #[error("Storage request failed: {0}")]
    Storage(#[source] anyhow::Error),
}

impl UploadError {
    /// Short label used for metrics and logs.
    pub fn kind(&self) -> &'static str {
        match self {
            UploadError::NoFileSelected => "validation",
            UploadError::PayloadTooLarge { .. } => "size_limit",
            UploadError::Multipart(_) => "multipart",
            UploadError::Authentication(_) => "authentication",
            UploadError::Storage(_) => "storage",
        }
    }

    /// HTTP status this error maps to when it is not folded into a redirect.
    pub fn status_code(&self) -> StatusCode {
        match self {
            UploadError::NoFileSelected => StatusCode::BAD_REQUEST,
            UploadError::PayloadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            UploadError::Multipart(_) => StatusCode::BAD_REQUEST,
            UploadError::Authentication(_) => StatusCode::BAD_GATEWAY,
            UploadError::Storage(_) => StatusCode::BAD_GATEWAY,
        }
    }

    /// Text for the flash message shown on the form page.
    pub fn user_message(&self) -> String {
        match self {
            UploadError::NoFileSelected => NO_FILE_SELECTED.to_string(),
            other => format!("Error uploading file: {}", other),
        }
    }
}

impl IntoResponse for UploadError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        (
            status,
            [("content-type", "text/plain; charset=utf-8")],
            self.to_string(),
        )
            .into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_file_message() {
        assert_eq!(UploadError::NoFileSelected.user_message(), "No file selected");
        assert_eq!(UploadError::NoFileSelected.kind(), "validation");
    }

    #[test]
    fn test_storage_message_embeds_cause() {
        let err = UploadError::Storage(anyhow::anyhow!("HTTP 403 - AuthorizationFailure"));
        let msg = err.user_message();
        assert!(msg.starts_with("Error uploading file: "));
        assert!(msg.contains("AuthorizationFailure"));
    }

    #[test]
    fn test_too_large_is_client_error() {
        let err = UploadError::PayloadTooLarge { limit: 16 };
        assert_eq!(err.status_code(), StatusCode::PAYLOAD_TOO_LARGE);
        assert!(err.status_code().is_client_error());
        let resp = err.into_response();
        assert_eq!(resp.status(), StatusCode::PAYLOAD_TOO_LARGE);
    }

    #[test]
    fn test_authentication_kind() {
        let err = UploadError::Authentication(anyhow::anyhow!("no identity endpoint"));
        assert_eq!(err.kind(), "authentication");
        assert!(err.to_string().contains("no identity endpoint"));
    }
}
