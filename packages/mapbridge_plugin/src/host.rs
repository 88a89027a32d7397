//! The desktop application embedding the plugin.

use mapbridge_proto::{Message, kinds};
use serde_json::Value;
use std::path::PathBuf;

/// What the plugin needs from its host.
pub trait PluginHost: Send + Sync + 'static {
    /// Directory of the currently open project, if any.
    fn project_directory(&self) -> Option<PathBuf>;

    /// Handle a frame the plugin does not interpret itself. A returned string
    /// is sent back on the same connection.
    fn handle_message(&self, _text: &str) -> Option<String> {
        None
    }
}

/// Host backed by a fixed directory. Answers `ProjectDirectory` queries.
#[derive(Debug, Clone, Default)]
pub struct DirectoryHost {
    dir: Option<PathBuf>,
}

impl DirectoryHost {
    pub fn new(dir: Option<PathBuf>) -> Self {
        Self { dir }
    }
}

impl PluginHost for DirectoryHost {
    fn project_directory(&self) -> Option<PathBuf> {
        self.dir.clone()
    }

    fn handle_message(&self, text: &str) -> Option<String> {
        let msg = Message::from_json(text).ok()?;
        if msg.kind != kinds::PROJECT_DIRECTORY {
            return None;
        }
        let reply = match &self.dir {
            Some(dir) => Message::ok(kinds::PROJECT_DIRECTORY, Value::from(dir.display().to_string())),
            None => Message::error(kinds::PROJECT_DIRECTORY, "no project directory is open"),
        };
        reply.to_json().ok()
    }
}
