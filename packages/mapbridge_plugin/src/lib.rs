//! Desktop-side mapbridge client.
//!
//! [`PluginClient`] keeps the plugin's relay socket, answers the control
//! frames the browser application sends (`PluginStatus`, `ProjectFiles`,
//! `UploadFiles`, `AbortUpload`) and passes everything else to the embedding
//! [`PluginHost`]. Uploads stream the project straight from disk as a
//! multipart body; see [`upload`].

pub mod client;
pub mod error;
pub mod host;
pub mod multipart;
pub mod upload;

pub use client::{ClientConfig, PluginClient};
pub use error::PluginError;
pub use host::{DirectoryHost, PluginHost};
pub use multipart::MultipartWriter;
pub use upload::{UploadJob, UploadOutcome, UploadSlot, encode_upload};
