//! Project quota: the size a project would have once an upload lands.

use mapbridge_proto::{FileRecord, UploadManifest};
use std::collections::HashMap;

use super::UploadError;

/// Sum of `existing` overlaid with the manifest's declared sizes. A manifest
/// entry replaces the existing file at the same path.
pub fn project_size_after_upload(existing: &[FileRecord], manifest: &UploadManifest) -> u64 {
    let mut sizes: HashMap<&str, u64> = existing
        .iter()
        .map(|f| (f.path.as_str(), f.size))
        .collect();
    for file in &manifest.files {
        sizes.insert(file.path.as_str(), file.size);
    }
    sizes.values().sum()
}

pub fn check_quota(
    existing: &[FileRecord],
    manifest: &UploadManifest,
    limit: u64,
) -> Result<u64, UploadError> {
    let size = project_size_after_upload(existing, manifest);
    if size > limit {
        return Err(UploadError::QuotaExceeded { size, limit });
    }
    Ok(size)
}
