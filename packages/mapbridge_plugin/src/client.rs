//! Plugin side of the relay: one WebSocket to `/ws/plugin`, control frames
//! handled here, everything else handed to the [`PluginHost`].

use futures_util::{SinkExt, StreamExt};
use mapbridge_proto::{Message, UploadManifest, kinds, list_dir};
use serde_json::json;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::{
    self,
    client::IntoClientRequest,
    http::{HeaderMap, HeaderName, HeaderValue, header},
    protocol::Message as WsMessage,
};
use reqwest::Url;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::PluginError;
use crate::host::PluginHost;
use crate::upload::{self, UploadJob, UploadOutcome, UploadSlot};

pub const USER_HEADER: &str = "x-mapbridge-user";

#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Server base URL, e.g. `http://127.0.0.1:8000`.
    pub server: String,
    /// Bearer token, when the server has auth enabled.
    pub token: Option<String>,
    /// Trusted user name, when it does not.
    pub user: Option<String>,
    /// Sent as User-Agent and reported in `PluginStatus` replies.
    pub client_info: String,
    pub progress_step: u64,
}

impl ClientConfig {
    pub fn new(server: impl Into<String>) -> Self {
        Self {
            server: server.into(),
            token: None,
            user: None,
            client_info: format!("mapbridge-plugin/{}", env!("CARGO_PKG_VERSION")),
            progress_step: 32 * 1024,
        }
    }

    /// `server` with `segments` appended to its path, each percent-encoded.
    fn endpoint(&self, segments: &[&str]) -> Result<Url, PluginError> {
        let mut url = Url::parse(&self.server)
            .map_err(|e| PluginError::Config(format!("invalid server URL {:?}: {}", self.server, e)))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(PluginError::Config(format!(
                "server URL must be http:// or https://: {}",
                self.server
            )));
        }
        url.path_segments_mut()
            .map_err(|_| PluginError::Config(format!("server URL cannot have a path: {}", self.server)))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    pub fn ws_url(&self) -> Result<Url, PluginError> {
        let mut url = self.endpoint(&["ws", "plugin"])?;
        let scheme = if url.scheme() == "https" { "wss" } else { "ws" };
        url.set_scheme(scheme)
            .map_err(|_| PluginError::Config(format!("cannot derive {} URL from {}", scheme, self.server)))?;
        Ok(url)
    }

    pub fn upload_url(&self, project: &str) -> Result<Url, PluginError> {
        self.endpoint(&["api", "project", "upload", project])
    }

    /// Identity headers shared by the socket and the upload requests.
    pub fn headers(&self) -> Result<HeaderMap, PluginError> {
        let mut headers = HeaderMap::new();
        if let Some(token) = &self.token {
            headers.insert(header::AUTHORIZATION, header_value(&format!("Bearer {}", token))?);
        }
        if let Some(user) = &self.user {
            headers.insert(HeaderName::from_static(USER_HEADER), header_value(user)?);
        }
        headers.insert(header::USER_AGENT, header_value(&self.client_info)?);
        Ok(headers)
    }
}

fn header_value(value: &str) -> Result<HeaderValue, PluginError> {
    HeaderValue::from_str(value).map_err(|e| PluginError::Config(e.to_string()))
}

pub struct PluginClient<H> {
    config: Arc<ClientConfig>,
    host: Arc<H>,
    http: reqwest::Client,
    uploads: Arc<UploadSlot>,
}

impl<H: PluginHost> PluginClient<H> {
    pub fn new(config: ClientConfig, host: H) -> Result<Self, PluginError> {
        let mut default_headers = reqwest::header::HeaderMap::new();
        for (name, value) in config.headers()?.iter() {
            let name = reqwest::header::HeaderName::from_bytes(name.as_str().as_bytes())
                .map_err(|e| PluginError::Config(e.to_string()))?;
            let value = reqwest::header::HeaderValue::from_bytes(value.as_bytes())
                .map_err(|e| PluginError::Config(e.to_string()))?;
            default_headers.insert(name, value);
        }
        let http = reqwest::Client::builder()
            .default_headers(default_headers)
            .build()
            .map_err(PluginError::from_reqwest)?;

        Ok(Self {
            config: Arc::new(config),
            host: Arc::new(host),
            http,
            uploads: Arc::new(UploadSlot::new()),
        })
    }

    /// Connect and serve until the server closes the socket or `shutdown`
    /// fires. An in-flight upload is cancelled on the way out.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<(), PluginError> {
        let url = self.config.ws_url()?;
        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(PluginError::from_tungstenite)?;
        request.headers_mut().extend(self.config.headers()?);

        let (socket, _) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(PluginError::from_tungstenite)?;
        info!("Connected to {}", url);

        let (mut ws_sender, mut ws_receiver) = socket.split();
        let (tx, mut rx) = mpsc::channel::<WsMessage>(100);

        let writer = tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                let closing = matches!(frame, WsMessage::Close(_));
                if ws_sender.send(frame).await.is_err() || closing {
                    break;
                }
            }
            let _ = ws_sender.close().await;
        });

        let result = loop {
            let frame = tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Shutting down plugin connection");
                    let _ = tx.send(WsMessage::Close(None)).await;
                    break Ok(());
                }
                frame = ws_receiver.next() => frame,
            };

            match frame {
                Some(Ok(WsMessage::Text(text))) => self.dispatch(text.as_str(), &tx).await,
                Some(Ok(WsMessage::Close(_))) | None => {
                    info!("Server closed the connection");
                    break Ok(());
                }
                Some(Ok(_)) => {}
                Some(Err(tungstenite::Error::ConnectionClosed)) => break Ok(()),
                Some(Err(e)) => break Err(PluginError::from_tungstenite(e)),
            }
        };

        self.uploads.abort().await;
        drop(tx);
        let _ = writer.await;
        result
    }

    async fn dispatch(&self, text: &str, tx: &mpsc::Sender<WsMessage>) {
        let msg = match Message::from_json(text) {
            Ok(msg) => msg,
            Err(_) => {
                self.delegate(text, tx).await;
                return;
            }
        };

        let kind = msg.kind.clone();
        let reply = match kind.as_str() {
            kinds::PLUGIN_STATUS => Some(Message::ok(
                kinds::PLUGIN_STATUS,
                json!({ "client": self.config.client_info }),
            )),
            kinds::APP_STATUS => {
                info!("Application {}", msg.data_str().unwrap_or("status changed"));
                None
            }
            kinds::PROJECT_FILES => Some(match self.project_files().await {
                Ok(data) => Message::ok(kinds::PROJECT_FILES, data),
                Err(e) => Message::error(kinds::PROJECT_FILES, e.to_string()),
            }),
            kinds::ABORT_UPLOAD => {
                if self.uploads.abort().await {
                    info!("Upload aborted");
                }
                None
            }
            kinds::UPLOAD_FILES => match self.start_upload(msg, tx.clone()).await {
                Ok(()) => None,
                Err(e) => Some(Message::error(kinds::UPLOAD_FILES, e.to_string())),
            },
            _ => {
                self.delegate(text, tx).await;
                None
            }
        };

        if let Some(reply) = reply {
            send_message(tx, &reply).await;
        }
    }

    async fn delegate(&self, text: &str, tx: &mpsc::Sender<WsMessage>) {
        if let Some(reply) = self.host.handle_message(text) {
            let _ = tx.send(WsMessage::Text(reply.into())).await;
        }
    }

    async fn project_files(&self) -> Result<serde_json::Value, PluginError> {
        let dir = self.host.project_directory().ok_or(PluginError::NoProject)?;
        let listing_dir = dir.clone();
        let files = tokio::task::spawn_blocking(move || list_dir(&listing_dir, true))
            .await
            .map_err(|e| PluginError::Other(e.into()))?
            .map_err(|e| PluginError::Other(e.into()))?;
        Ok(json!({ "directory": dir.display().to_string(), "files": files }))
    }

    /// Validate an `UploadFiles` request and run it as its own task.
    async fn start_upload(&self, msg: Message, tx: mpsc::Sender<WsMessage>) -> Result<(), PluginError> {
        let data = msg
            .data
            .ok_or_else(|| PluginError::InvalidRequest("missing upload descriptor".into()))?;
        let manifest: UploadManifest = serde_json::from_value(data.clone())
            .map_err(|e| PluginError::InvalidRequest(e.to_string()))?;
        if manifest.project.is_empty() || manifest.project.contains('/') {
            return Err(PluginError::InvalidRequest(format!(
                "invalid project name {:?}",
                manifest.project
            )));
        }
        let directory = self.host.project_directory().ok_or(PluginError::NoProject)?;
        let changes =
            serde_json::to_vec(&data).map_err(|e| PluginError::InvalidRequest(e.to_string()))?;

        let job = UploadJob {
            directory,
            changes,
            files: manifest.files,
            progress_step: self.config.progress_step,
        };
        let url = self.config.upload_url(&manifest.project)?;
        let project = manifest.project;
        let http = self.http.clone();
        let uploads = self.uploads.clone();
        let (id, cancel) = uploads.begin().await;
        info!(project = %project, files = job.files.len(), "Starting upload");

        tokio::spawn(async move {
            let outcome = upload::upload(&http, url, job, cancel).await;
            uploads.finish(id).await;

            let reply = match outcome {
                Ok(UploadOutcome::Completed) => {
                    info!(project = %project, "Upload complete");
                    Message::ok(kinds::UPLOAD_FILES, json!({ "project": project }))
                }
                Ok(UploadOutcome::Cancelled) => {
                    info!(project = %project, "Upload cancelled");
                    return;
                }
                Ok(UploadOutcome::Rejected { status, body }) => {
                    warn!(project = %project, status, "Upload rejected: {}", body);
                    Message::error(kinds::UPLOAD_ERROR, body)
                }
                Err(e) => {
                    warn!(project = %project, "Upload failed: {}", e);
                    Message::error(kinds::UPLOAD_ERROR, e.to_string())
                }
            };
            send_message(&tx, &reply).await;
        });
        Ok(())
    }
}

async fn send_message(tx: &mpsc::Sender<WsMessage>, msg: &Message) {
    match msg.to_json() {
        Ok(json) => {
            if tx.send(WsMessage::Text(json.into())).await.is_err() {
                debug!("Connection closed before {} reply", msg.kind);
            }
        }
        Err(e) => warn!("Failed to serialize {} reply: {}", msg.kind, e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn urls_follow_server_scheme() {
        let config = ClientConfig::new("http://127.0.0.1:8000/");
        assert_eq!(config.ws_url().unwrap().as_str(), "ws://127.0.0.1:8000/ws/plugin");
        assert_eq!(
            config.upload_url("parks").unwrap().as_str(),
            "http://127.0.0.1:8000/api/project/upload/parks"
        );

        let secure = ClientConfig::new("https://maps.example.org/gis");
        assert_eq!(
            secure.ws_url().unwrap().as_str(),
            "wss://maps.example.org/gis/ws/plugin"
        );

        assert!(ClientConfig::new("maps.example.org").ws_url().is_err());
        assert!(ClientConfig::new("ftp://maps.example.org").ws_url().is_err());
    }

    #[test]
    fn project_names_are_percent_encoded() {
        let config = ClientConfig::new("http://localhost:8000");
        let url = config.upload_url("a#b c/d").unwrap();
        assert_eq!(
            url.as_str(),
            "http://localhost:8000/api/project/upload/a%23b%20c%2Fd"
        );
        assert_eq!(url.fragment(), None);
    }

    #[test]
    fn identity_headers() {
        let mut config = ClientConfig::new("http://localhost:8000");
        config.token = Some("s3cret".into());
        config.user = Some("alice".into());
        config.client_info = "QGIS 3.34 / mapbridge".into();

        let headers = config.headers().unwrap();
        assert_eq!(headers[header::AUTHORIZATION], "Bearer s3cret");
        assert_eq!(headers[USER_HEADER], "alice");
        assert_eq!(headers[header::USER_AGENT], "QGIS 3.34 / mapbridge");
    }

    #[test]
    fn header_values_are_validated() {
        let mut config = ClientConfig::new("http://localhost:8000");
        config.user = Some("bad\nname".into());
        assert!(matches!(config.headers(), Err(PluginError::Config(_))));
    }
}
