//! # Mapbridge protocol
//!
//! Types and helpers shared by the `mapbridge` relay server and the
//! `mapbridge_plugin` desktop client:
//!
//! - [`Message`]: the `{type, status?, data?}` envelope carried by every
//!   control and status frame
//! - [`FileRecord`] and [`list_dir`]: portable directory listings used for
//!   project file reports and quota accounting
//! - [`ProgressTracker`] / [`ProgressReader`]: stepped percentage observers
//! - [`UploadManifest`] and the compression rule for upload parts
//!
//! ```rust
//! use mapbridge_proto::{Message, kinds};
//!
//! let msg = Message::ok(kinds::PLUGIN_STATUS, serde_json::json!({"client": "qgis"}));
//! assert_eq!(msg.status, Some(200));
//! ```

pub mod files;
pub mod message;
pub mod progress;
pub mod upload;

pub use files::{
    FileRecord, ListError, META_DIR, PathError, list_dir, resolve_project_file, resolve_relative,
};
pub use message::{Message, PeerStatus, STATUS_ERROR, STATUS_OK, is_heartbeat, kinds};
pub use progress::{ProgressReader, ProgressTracker};
pub use upload::{
    CHANGES_FIELD, COMPRESSED_SUFFIX, COMPRESSIBLE_EXTENSIONS, UploadManifest, is_compressed_part,
    should_compress,
};
