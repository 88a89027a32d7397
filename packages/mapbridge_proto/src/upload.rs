//! Upload stream conventions shared by the encoder and the decoder.
//!
//! The stream is `multipart/form-data`. The first part is the upload
//! descriptor (the "changes" blob); every following part is one project file
//! named by its relative path. Parts whose file name carries
//! [`COMPRESSED_SUFFIX`] while the field name does not are gzip on the wire.

use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::files::FileRecord;

/// Field name of the leading descriptor part.
pub const CHANGES_FIELD: &str = "changes";

pub const COMPRESSED_SUFFIX: &str = ".gz";

/// Extensions that compress well: project files, markup and small-record
/// databases.
pub const COMPRESSIBLE_EXTENSIONS: &[&str] = &["qgs", "svg", "json", "sqlite", "gpkg", "geojson"];

/// Upload descriptor. Only `project` and `files` are interpreted; any other
/// keys are preserved so the blob can be persisted for later diffing.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UploadManifest {
    #[serde(default)]
    pub project: String,
    pub files: Vec<FileRecord>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl UploadManifest {
    pub fn declared_size(&self, path: &str) -> Option<u64> {
        self.files.iter().find(|f| f.path == path).map(|f| f.size)
    }

    pub fn total_size(&self) -> u64 {
        self.files.iter().map(|f| f.size).sum()
    }
}

pub fn should_compress(path: &str) -> bool {
    Path::new(path)
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| {
            COMPRESSIBLE_EXTENSIONS
                .iter()
                .any(|known| known.eq_ignore_ascii_case(ext))
        })
}

/// Whether a received part must be gunzipped before it is stored.
pub fn is_compressed_part(field_name: &str, file_name: Option<&str>) -> bool {
    file_name.is_some_and(|f| f.ends_with(COMPRESSED_SUFFIX))
        && !field_name.ends_with(COMPRESSED_SUFFIX)
}
