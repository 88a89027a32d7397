//! Throttled upload progress, pushed to the user's application socket.

use mapbridge_proto::{Message, kinds};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

use crate::registry::{ConnectionRegistry, Side};

/// Collects `path -> percent` and sends the batch as one `UploadProgress`
/// frame at most once per `interval`. The batch is cleared after each send.
pub struct ProgressNotifier {
    registry: Arc<ConnectionRegistry>,
    user: String,
    interval: Duration,
    last_flush: Instant,
    pending: BTreeMap<String, u8>,
}

impl ProgressNotifier {
    pub fn new(registry: Arc<ConnectionRegistry>, user: impl Into<String>, interval: Duration) -> Self {
        Self {
            registry,
            user: user.into(),
            interval,
            last_flush: Instant::now(),
            pending: BTreeMap::new(),
        }
    }

    pub async fn record(&mut self, path: &str, percent: u8) {
        self.pending.insert(path.to_string(), percent);
        if self.last_flush.elapsed() >= self.interval {
            self.flush().await;
        }
    }

    /// Send whatever is pending, if anything.
    pub async fn flush(&mut self) {
        self.last_flush = Instant::now();
        if self.pending.is_empty() {
            return;
        }
        let batch = std::mem::take(&mut self.pending);
        let Some(app) = self.registry.get(&self.user, Side::App).await else {
            return;
        };
        let data: Map<String, Value> = batch
            .into_iter()
            .map(|(path, percent)| (path, Value::from(percent)))
            .collect();
        let msg = Message::with_data(kinds::UPLOAD_PROGRESS, Value::Object(data));
        if app.send_message(&msg).await.is_err() {
            debug!(user = %self.user, "Application went away during upload");
        }
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }
}
