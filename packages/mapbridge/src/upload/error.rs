use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use mapbridge_proto::{ListError, PathError};
use std::io;

/// Upload error types
#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    #[error("expected multipart/form-data, got {0:?}")]
    InvalidContentType(String),

    #[error("multipart boundary missing")]
    MissingBoundary,

    #[error("malformed multipart stream: {0}")]
    InvalidStream(String),

    #[error("invalid upload descriptor: {0}")]
    InvalidManifest(String),

    #[error("invalid path: {0}")]
    InvalidPath(#[from] PathError),

    #[error("project size {size} bytes exceeds the limit of {limit} bytes")]
    QuotaExceeded { size: u64, limit: u64 },

    #[error("request body exceeds the limit of {limit} bytes")]
    PayloadTooLarge { limit: u64 },

    #[error("upload interrupted: {0}")]
    Transfer(String),

    #[error("failed to decompress {path}: {source}")]
    Decompress {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("storage error: {0}")]
    Storage(#[from] io::Error),

    #[error("failed to list project: {0}")]
    Listing(#[from] ListError),
}

impl UploadError {
    /// Get HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::InvalidContentType(_)
            | Self::MissingBoundary
            | Self::InvalidStream(_)
            | Self::InvalidManifest(_)
            | Self::InvalidPath(_)
            | Self::QuotaExceeded { .. } => StatusCode::BAD_REQUEST,
            Self::PayloadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            Self::Transfer(_) | Self::Decompress { .. } | Self::Storage(_) | Self::Listing(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Stable machine-readable code for the JSON body.
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidContentType(_) => "invalid_content_type",
            Self::MissingBoundary => "missing_boundary",
            Self::InvalidStream(_) => "invalid_stream",
            Self::InvalidManifest(_) => "invalid_manifest",
            Self::InvalidPath(_) => "invalid_path",
            Self::QuotaExceeded { .. } => "quota_exceeded",
            Self::PayloadTooLarge { .. } => "payload_too_large",
            Self::Transfer(_) => "transfer_failed",
            Self::Decompress { .. } => "decompress_failed",
            Self::Storage(_) => "storage_error",
            Self::Listing(_) => "listing_failed",
        }
    }

    /// Refused by policy rather than failed.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            Self::QuotaExceeded { .. } | Self::PayloadTooLarge { .. }
        )
    }
}

impl IntoResponse for UploadError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({
            "error": self.to_string(),
            "code": self.code(),
        });
        (self.status_code(), Json(body)).into_response()
    }
}
