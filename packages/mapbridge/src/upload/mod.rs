//! Streaming project upload: `POST /api/project/upload/{project}`.
//!
//! The body is `multipart/form-data`. The first part, whatever its name, is
//! the JSON upload descriptor; every further part is one file, named by its
//! project-relative path. Parts are written to disk chunk by chunk as they arrive; parts sent
//! gzip-compressed are inflated on the way. Progress per file is batched and
//! pushed to the user's application socket.

mod error;
mod gunzip;
mod notifier;
mod quota;

pub use error::UploadError;

use gunzip::StreamingGunzip;
use notifier::ProgressNotifier;
use quota::check_quota;

use axum::{
    extract::{
        FromRequest, Multipart, Path, Request, State,
        multipart::{Field, MultipartRejection},
    },
    http::{StatusCode, header},
};
use mapbridge_proto::{
    ProgressTracker, UploadManifest, is_compressed_part, resolve_project_file,
};
use std::path::PathBuf;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::AppState;
use crate::auth::AuthUser;
use crate::projects;

/// Upper bound for the descriptor part.
const MAX_MANIFEST_BYTES: usize = 8 * 1024 * 1024;

pub async fn upload_project(
    State(state): State<AppState>,
    user: AuthUser,
    Path(project): Path<String>,
    request: Request,
) -> Result<StatusCode, UploadError> {
    let metrics = state.metrics.clone();
    match receive_upload(state, &user, &project, request).await {
        Ok(bytes) => {
            metrics.upload_completed(bytes);
            info!(user = %user.username, project = %project, bytes, "Upload stored");
            Ok(StatusCode::OK)
        }
        Err(e) => {
            if e.is_rejection() {
                metrics.upload_rejected();
            } else {
                metrics.upload_failed();
            }
            warn!(user = %user.username, project = %project, "Upload failed: {}", e);
            Err(e)
        }
    }
}

/// Returns the number of plaintext bytes written.
async fn receive_upload(
    state: AppState,
    user: &AuthUser,
    project: &str,
    request: Request,
) -> Result<u64, UploadError> {
    check_content_type(request.headers().get(header::CONTENT_TYPE))?;

    let mut multipart = Multipart::from_request(request, &state)
        .await
        .map_err(|e| match e {
            MultipartRejection::InvalidBoundary(_) => UploadError::MissingBoundary,
            other => UploadError::InvalidStream(other.body_text()),
        })?;

    let first = multipart
        .next_field()
        .await
        .map_err(|e| UploadError::InvalidStream(e.body_text()))?
        .ok_or_else(|| UploadError::InvalidManifest("empty upload".into()))?;
    let blob = read_manifest(first).await?;
    let manifest: UploadManifest = serde_json::from_slice(&blob)
        .map_err(|e| UploadError::InvalidManifest(e.to_string()))?;

    let dir = projects::project_dir(&state.storage, &user.username, project)?;
    let limit = state.storage.max_project_size;
    if !user.is_superuser {
        let existing = projects::existing_files(dir.clone()).await?;
        let size = check_quota(&existing, &manifest, limit)?;
        debug!(user = %user.username, project, size, limit, "Quota check passed");
    }
    let body_limit = (!user.is_superuser).then_some(limit);

    let mut notifier = ProgressNotifier::new(
        state.registry.clone(),
        user.username.clone(),
        state.upload.progress_interval,
    );
    let mut received: u64 = blob.len() as u64;
    let mut stored: u64 = 0;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| UploadError::Transfer(e.body_text()))?
    {
        let name = field.name().unwrap_or_default().to_string();
        let compressed = is_compressed_part(&name, field.file_name());
        let dest = resolve_project_file(&dir, &name)?;
        let mut tracker = ProgressTracker::new(
            manifest.declared_size(&name).unwrap_or(0),
            state.upload.progress_step,
        );

        let part = PartSink {
            name: &name,
            dest,
            compressed,
        };
        part.store(
            field,
            &mut tracker,
            &mut notifier,
            &mut received,
            body_limit,
        )
        .await?;

        notifier.record(&name, tracker.percent()).await;
        stored += tracker.bytes_read();
        debug!(path = %name, bytes = tracker.bytes_read(), compressed, "Part stored");
    }

    notifier.flush().await;
    projects::write_changes(&dir, &blob).await?;
    Ok(stored)
}

/// Only the media type is checked here; the boundary parameter is parsed by
/// the `Multipart` extractor.
fn check_content_type(value: Option<&header::HeaderValue>) -> Result<(), UploadError> {
    let content_type = value.and_then(|v| v.to_str().ok()).unwrap_or_default();
    let essence = content_type.split(';').next().unwrap_or_default().trim();
    if !essence.eq_ignore_ascii_case("multipart/form-data") {
        return Err(UploadError::InvalidContentType(content_type.to_string()));
    }
    Ok(())
}

async fn read_manifest(mut field: Field<'_>) -> Result<Vec<u8>, UploadError> {
    let mut blob = Vec::new();
    while let Some(chunk) = field
        .chunk()
        .await
        .map_err(|e| UploadError::InvalidStream(e.body_text()))?
    {
        if blob.len() + chunk.len() > MAX_MANIFEST_BYTES {
            return Err(UploadError::InvalidManifest("descriptor too large".into()));
        }
        blob.extend_from_slice(&chunk);
    }
    Ok(blob)
}

/// Destination of one file part.
struct PartSink<'a> {
    name: &'a str,
    dest: PathBuf,
    compressed: bool,
}

impl PartSink<'_> {
    async fn store(
        self,
        mut field: Field<'_>,
        tracker: &mut ProgressTracker,
        notifier: &mut ProgressNotifier,
        received: &mut u64,
        body_limit: Option<u64>,
    ) -> Result<(), UploadError> {
        if let Some(parent) = self.dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = tokio::fs::File::create(&self.dest).await?;
        let mut gunzip = self.compressed.then(StreamingGunzip::new);

        while let Some(chunk) = field
            .chunk()
            .await
            .map_err(|e| UploadError::Transfer(e.body_text()))?
        {
            *received += chunk.len() as u64;
            if let Some(limit) = body_limit {
                if *received > limit {
                    return Err(UploadError::PayloadTooLarge { limit });
                }
            }

            let written = match gunzip.as_mut() {
                Some(decoder) => {
                    let plain = decoder.feed(&chunk).map_err(|e| self.decompress_error(e))?;
                    file.write_all(&plain).await?;
                    plain.len()
                }
                None => {
                    file.write_all(&chunk).await?;
                    chunk.len()
                }
            };
            if let Some(percent) = tracker.advance(written) {
                notifier.record(self.name, percent).await;
            }
        }

        if let Some(decoder) = gunzip {
            let tail = decoder.finish().map_err(|e| self.decompress_error(e))?;
            file.write_all(&tail).await?;
            tracker.advance(tail.len());
        }
        file.flush().await?;
        Ok(())
    }

    fn decompress_error(&self, source: std::io::Error) -> UploadError {
        UploadError::Decompress {
            path: self.name.to_string(),
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{PeerHandle, Side};
    use crate::test_helpers::{
        multipart_body, multipart_body_with, send, test_app_state, test_app_state_with_auth,
        upload_request,
    };
    use axum::body::Body;
    use axum::extract::ws::Message as WsMessage;
    use axum::http::{HeaderValue, Request};
    use flate2::{Compression, write::GzEncoder};
    use mapbridge_proto::{Message, kinds};
    use std::io::Write;
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;

    fn gzip(data: &[u8]) -> Vec<u8> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(data).unwrap();
        encoder.finish().unwrap()
    }

    fn manifest(files: &[(&str, usize)]) -> Vec<u8> {
        let files: Vec<_> = files
            .iter()
            .map(|(path, size)| serde_json::json!({"path": path, "size": size}))
            .collect();
        serde_json::to_vec(&serde_json::json!({"project": "parks", "files": files})).unwrap()
    }

    #[tokio::test]
    async fn stores_plain_and_compressed_parts() {
        let (state, _tmp) = test_app_state();
        let (tx, mut rx) = mpsc::channel(64);
        state
            .registry
            .set("alice", Side::App, Some(PeerHandle::new(tx, CancellationToken::new())))
            .await;

        let qgs: Vec<u8> = b"<qgis>".iter().cycle().take(10_000).copied().collect();
        let tif = vec![9u8; 3000];
        let changes = manifest(&[("project.qgs", qgs.len()), ("data/dem.tif", tif.len())]);
        let body = multipart_body(&[
            ("changes", None, &changes),
            ("project.qgs", Some("project.qgs.gz"), &gzip(&qgs)),
            ("data/dem.tif", Some("data/dem.tif"), &tif),
        ]);

        let (status, body) = send(
            state.clone(),
            upload_request("/api/project/upload/parks?user=alice", body),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.is_null());

        let dir = state.storage.projects_dir.join("alice").join("parks");
        assert_eq!(std::fs::read(dir.join("project.qgs")).unwrap(), qgs);
        assert_eq!(std::fs::read(dir.join("data").join("dem.tif")).unwrap(), tif);
        let saved = std::fs::read(dir.join(".mapbridge").join("changes.json")).unwrap();
        assert_eq!(saved, changes);

        let mut last: std::collections::HashMap<String, u64> = Default::default();
        while let Ok(frame) = rx.try_recv() {
            let WsMessage::Text(text) = frame else {
                panic!("expected text frame");
            };
            let msg = Message::from_json(text.as_str()).unwrap();
            assert_eq!(msg.kind, kinds::UPLOAD_PROGRESS);
            for (path, percent) in msg.data.unwrap().as_object().unwrap() {
                let percent = percent.as_u64().unwrap();
                let previous = last.insert(path.clone(), percent).unwrap_or(0);
                assert!(percent >= previous, "progress went backwards for {}", path);
            }
        }
        assert_eq!(last.get("project.qgs"), Some(&100));
        assert_eq!(last.get("data/dem.tif"), Some(&100));

        let snapshot = state.metrics.snapshot();
        assert_eq!(snapshot.uploads.completed, 1);
        assert_eq!(snapshot.uploads.bytes_stored, (qgs.len() + tif.len()) as u64);
    }

    #[tokio::test]
    async fn rejects_wrong_content_type() {
        let (state, _tmp) = test_app_state();
        let request = Request::builder()
            .method("POST")
            .uri("/api/project/upload/parks?user=alice")
            .header("content-type", "application/json")
            .body(Body::from("{}"))
            .unwrap();
        let (status, body) = send(state, request).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], "invalid_content_type");
    }

    #[tokio::test]
    async fn rejects_missing_boundary() {
        let (state, _tmp) = test_app_state();
        let request = Request::builder()
            .method("POST")
            .uri("/api/project/upload/parks?user=alice")
            .header("content-type", "multipart/form-data")
            .body(Body::empty())
            .unwrap();
        let (status, body) = send(state, request).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], "missing_boundary");
    }

    #[tokio::test]
    async fn rejects_malformed_descriptor() {
        let (state, _tmp) = test_app_state();
        let body = multipart_body(&[("changes", None, b"{not json")]);
        let (status, body) = send(
            state,
            upload_request("/api/project/upload/parks?user=alice", body),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], "invalid_manifest");
    }

    #[tokio::test]
    async fn rejects_path_traversal_before_writing() {
        let (state, tmp) = test_app_state();
        let changes = manifest(&[("../escape.txt", 3)]);
        let body = multipart_body(&[
            ("changes", None, &changes),
            ("../escape.txt", Some("../escape.txt"), b"abc"),
        ]);
        let (status, body) = send(
            state.clone(),
            upload_request("/api/project/upload/parks?user=alice", body),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], "invalid_path");
        assert!(!state.storage.projects_dir.join("alice").join("escape.txt").exists());
        drop(tmp);
    }

    #[tokio::test]
    async fn quota_counts_replaced_files_once() {
        let (mut state, _tmp) = test_app_state();
        state.storage = std::sync::Arc::new(crate::config::StorageConfig {
            projects_dir: state.storage.projects_dir.clone(),
            max_project_size: 2000,
        });
        let dir = state.storage.projects_dir.join("alice").join("parks");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("a.qgs"), vec![0u8; 1500]).unwrap();

        // Replacing a.qgs: 1800 in total, under the limit.
        let data = vec![1u8; 1800];
        let changes = manifest(&[("a.qgs", data.len())]);
        let body = multipart_body(&[("changes", None, &changes), ("a.qgs", Some("a.qgs"), &data)]);
        let (status, _) = send(
            state.clone(),
            upload_request("/api/project/upload/parks?user=alice", body),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        // A new 1000 byte file on top of 1800: over the limit.
        let changes = manifest(&[("b.qgs", 1000)]);
        let body = multipart_body(&[("changes", None, &changes), ("b.qgs", Some("b.qgs"), &[2u8; 1000])]);
        let (status, body) = send(
            state.clone(),
            upload_request("/api/project/upload/parks?user=alice", body),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], "quota_exceeded");
        assert!(!dir.join("b.qgs").exists());
        assert_eq!(state.metrics.snapshot().uploads.rejected, 1);
    }

    #[tokio::test]
    async fn body_cap_applies_to_regular_users_only() {
        let (mut state, _tmp) = test_app_state_with_auth();
        state.storage = std::sync::Arc::new(crate::config::StorageConfig {
            projects_dir: state.storage.projects_dir.clone(),
            max_project_size: 4096,
        });

        // Declared size passes the quota, the actual body does not.
        let data = vec![7u8; 10_000];
        let changes = manifest(&[("big.tif", 100)]);
        let parts = [("changes", None, changes.as_slice()), ("big.tif", Some("big.tif"), data.as_slice())];

        let (status, body) = send(
            state.clone(),
            upload_request(
                "/api/project/upload/parks?token=alice-token",
                multipart_body(&parts),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
        assert_eq!(body["code"], "payload_too_large");

        let (status, _) = send(
            state.clone(),
            upload_request(
                "/api/project/upload/parks?token=root-token",
                multipart_body(&parts),
            ),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let stored = state.storage.projects_dir.join("root").join("parks").join("big.tif");
        assert_eq!(std::fs::metadata(stored).unwrap().len(), 10_000);
    }

    #[tokio::test]
    async fn descriptor_part_name_is_not_significant() {
        let (state, _tmp) = test_app_state();
        let changes = manifest(&[("a.txt", 3)]);
        let body = multipart_body(&[("meta", None, &changes), ("a.txt", Some("a.txt"), b"abc")]);
        let (status, _) = send(
            state.clone(),
            upload_request("/api/project/upload/parks?user=alice", body),
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let dir = state.storage.projects_dir.join("alice").join("parks");
        assert_eq!(std::fs::read(dir.join("a.txt")).unwrap(), b"abc");
        assert_eq!(
            std::fs::read(dir.join(".mapbridge").join("changes.json")).unwrap(),
            changes
        );
    }

    #[tokio::test]
    async fn metadata_dir_is_not_writable_by_uploads() {
        let (mut state, _tmp) = test_app_state();
        state.storage = std::sync::Arc::new(crate::config::StorageConfig {
            projects_dir: state.storage.projects_dir.clone(),
            max_project_size: 2000,
        });
        let dir = state.storage.projects_dir.join("alice").join("parks");

        for path in [".mapbridge/x1.bin", ".mapbridge/changes.json"] {
            let changes = manifest(&[(path, 1500)]);
            let body = multipart_body(&[("changes", None, &changes), (path, Some(path), &[0u8; 1500])]);
            let (status, body) = send(
                state.clone(),
                upload_request("/api/project/upload/parks?user=alice", body),
            )
            .await;
            assert_eq!(status, StatusCode::BAD_REQUEST);
            assert_eq!(body["code"], "invalid_path");
            assert!(!dir.join(path).exists());
        }

        // Only counted bytes ever reach the disk.
        let changes = manifest(&[("project.qgs", 1500)]);
        let body = multipart_body(&[
            ("changes", None, &changes),
            ("project.qgs", Some("project.qgs"), &[0u8; 1500]),
        ]);
        let (status, _) = send(
            state.clone(),
            upload_request("/api/project/upload/parks?user=alice", body),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        let existing = crate::projects::existing_files(dir.clone()).await.unwrap();
        assert_eq!(existing.iter().map(|f| f.size).sum::<u64>(), 1500);
    }

    #[tokio::test]
    async fn quoted_boundary_is_accepted() {
        let (state, _tmp) = test_app_state();
        let boundary = "mapbridge:quoted=1";
        let changes = manifest(&[("a.txt", 3)]);
        let body = multipart_body_with(
            boundary,
            &[("changes", None, &changes), ("a.txt", Some("a.txt"), b"abc")],
        );
        let request = Request::builder()
            .method("POST")
            .uri("/api/project/upload/parks?user=alice")
            .header(
                "content-type",
                format!("multipart/form-data; charset=utf-8; boundary=\"{}\"", boundary),
            )
            .body(Body::from(body))
            .unwrap();
        let (status, _) = send(state.clone(), request).await;
        assert_eq!(status, StatusCode::OK);
    }

    fn content_type(value: &'static str) -> Result<(), UploadError> {
        check_content_type(Some(&HeaderValue::from_static(value)))
    }

    #[test]
    fn content_type_must_be_multipart() {
        assert!(content_type("multipart/form-data; boundary=abc").is_ok());
        assert!(content_type("Multipart/Form-Data ; boundary=\"a;b\"").is_ok());
        assert!(matches!(
            content_type("application/json"),
            Err(UploadError::InvalidContentType(_))
        ));
        assert!(matches!(
            content_type("multipart/mixed; boundary=abc"),
            Err(UploadError::InvalidContentType(_))
        ));
        assert!(matches!(
            check_content_type(None),
            Err(UploadError::InvalidContentType(_))
        ));
    }
}
