use axum::body::Body;
use axum::http::{Request, StatusCode};
use std::sync::Arc;
use tower::ServiceExt;

use crate::AppState;
use crate::config::{AuthConfig, StorageConfig, UploadConfig, UserEntry};
use crate::metrics::ServerMetrics;
use crate::registry::ConnectionRegistry;

/// Build an `AppState` whose projects live in a fresh temp directory, with
/// auth disabled and a 1 MiB quota.
///
/// Returns `(AppState, TempDir)`; callers **must** hold the `TempDir` for
/// the lifetime of the test.
pub fn test_app_state() -> (AppState, tempfile::TempDir) {
    let tmp = tempfile::tempdir().expect("tempdir");
    let state = AppState {
        registry: Arc::new(ConnectionRegistry::new()),
        storage: Arc::new(StorageConfig {
            projects_dir: tmp.path().join("projects"),
            max_project_size: 1024 * 1024,
        }),
        upload: Arc::new(UploadConfig {
            progress_interval: std::time::Duration::ZERO,
            progress_step: 1024,
        }),
        auth_config: Arc::new(AuthConfig::default()),
        metrics: Arc::new(ServerMetrics::new()),
    };
    (state, tmp)
}

/// Like `test_app_state`, but with token auth enabled for `alice` (regular)
/// and `root` (superuser).
pub fn test_app_state_with_auth() -> (AppState, tempfile::TempDir) {
    let (mut state, tmp) = test_app_state();
    state.auth_config = Arc::new(AuthConfig {
        enabled: true,
        users: vec![
            UserEntry {
                username: "alice".into(),
                token: "alice-token".into(),
                superuser: false,
            },
            UserEntry {
                username: "root".into(),
                token: "root-token".into(),
                superuser: true,
            },
        ],
    });
    (state, tmp)
}

pub fn get(uri: &str) -> Request<Body> {
    Request::builder()
        .uri(uri)
        .body(Body::empty())
        .expect("request")
}

/// Run one request through the full router and decode the JSON body
/// (`Null` when empty).
pub async fn send(state: AppState, request: Request<Body>) -> (StatusCode, serde_json::Value) {
    let response = crate::build_router(state)
        .oneshot(request)
        .await
        .expect("router is infallible");
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("body");
    let body = if bytes.is_empty() {
        serde_json::Value::Null
    } else {
        serde_json::from_slice(&bytes).expect("json body")
    };
    (status, body)
}

pub const BOUNDARY: &str = "mapbridge-test-boundary";

/// Encode `(field name, file name, bytes)` parts as a multipart body using
/// [`BOUNDARY`].
pub fn multipart_body(parts: &[(&str, Option<&str>, &[u8])]) -> Vec<u8> {
    multipart_body_with(BOUNDARY, parts)
}

pub fn multipart_body_with(boundary: &str, parts: &[(&str, Option<&str>, &[u8])]) -> Vec<u8> {
    let mut body = Vec::new();
    for (name, file_name, data) in parts {
        body.extend_from_slice(format!("--{}\r\n", boundary).as_bytes());
        match file_name {
            Some(file_name) => body.extend_from_slice(
                format!(
                    "Content-Disposition: form-data; name=\"{}\"; filename=\"{}\"\r\n\
                     Content-Type: application/octet-stream\r\n\r\n",
                    name, file_name
                )
                .as_bytes(),
            ),
            None => body.extend_from_slice(
                format!("Content-Disposition: form-data; name=\"{}\"\r\n\r\n", name).as_bytes(),
            ),
        }
        body.extend_from_slice(data);
        body.extend_from_slice(b"\r\n");
    }
    body.extend_from_slice(format!("--{}--\r\n", boundary).as_bytes());
    body
}

pub fn upload_request(uri: &str, body: Vec<u8>) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header(
            "content-type",
            format!("multipart/form-data; boundary={}", BOUNDARY),
        )
        .body(Body::from(body))
        .expect("request")
}
