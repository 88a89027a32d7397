//! Streaming project upload.
//!
//! A blocking producer encodes the multipart body straight from disk into a
//! bounded channel; the HTTP request body drains the same channel. Network
//! backpressure therefore throttles disk reads and gzip, and at most
//! `CHANNEL_DEPTH` chunks are held in memory. Cancellation reaches both ends:
//! the producer stops waiting for channel room and the body stream fails.

use flate2::{Compression, write::GzEncoder};
use futures_util::stream;
use mapbridge_proto::{
    CHANGES_FIELD, COMPRESSED_SUFFIX, FileRecord, ProgressReader, resolve_relative,
    should_compress,
};
use std::fs::File;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::PluginError;
use crate::multipart::MultipartWriter;

/// Chunks in flight between the producer and the request body.
const CHANNEL_DEPTH: usize = 8;
/// Producer chunk size.
const CHUNK_SIZE: usize = 32 * 1024;
/// How long a stopped producer gets to wind down before it is abandoned.
const PRODUCER_GRACE: Duration = Duration::from_secs(5);

/// Everything one upload needs, owned so it can move to the producer thread.
#[derive(Debug, Clone)]
pub struct UploadJob {
    /// Local project directory the manifest paths are relative to.
    pub directory: PathBuf,
    /// Serialized descriptor, sent verbatim as the first part.
    pub changes: Vec<u8>,
    pub files: Vec<FileRecord>,
    /// Bytes between progress log lines.
    pub progress_step: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UploadOutcome {
    Completed,
    /// The server answered with 4xx/5xx.
    Rejected { status: u16, body: String },
    Cancelled,
}

/// Encode `job` as multipart into `writer`: the `changes` field first, then
/// one part per file, gzip-compressed where the extension calls for it.
pub fn encode_upload<W: Write>(
    mut writer: MultipartWriter<W>,
    job: &UploadJob,
) -> io::Result<W> {
    writer.write_field(CHANGES_FIELD, &job.changes)?;

    for file in &job.files {
        let source = open_source(&job.directory, &file.path)?;
        let path = file.path.as_str();
        let mut reader = ProgressReader::new(source, file.size, job.progress_step, |percent| {
            debug!(path, percent, "Encoding");
        });

        if should_compress(path) {
            writer.begin_part(path, &format!("{}{}", path, COMPRESSED_SUFFIX))?;
            let mut encoder = GzEncoder::new(&mut writer, Compression::default());
            io::copy(&mut reader, &mut encoder)?;
            encoder.finish()?;
        } else {
            writer.begin_part(path, path)?;
            io::copy(&mut reader, &mut writer)?;
        }
    }

    writer.finish()
}

fn open_source(directory: &Path, relative: &str) -> io::Result<File> {
    let path = resolve_relative(directory, relative)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
    File::open(&path).map_err(|e| io::Error::new(e.kind(), format!("{}: {}", relative, e)))
}

type Chunk = io::Result<Vec<u8>>;

fn cancelled_error() -> io::Error {
    io::Error::new(io::ErrorKind::ConnectionAborted, "upload cancelled")
}

/// Block until `chunk` is queued, the receiver is gone, or `stop` fires.
fn send_blocking(
    handle: &Handle,
    tx: &mpsc::Sender<Chunk>,
    stop: &CancellationToken,
    chunk: Chunk,
) -> io::Result<()> {
    handle.block_on(async {
        tokio::select! {
            biased;
            _ = stop.cancelled() => Err(cancelled_error()),
            sent = tx.send(chunk) => sent
                .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "upload stream closed")),
        }
    })
}

/// Blocking [`Write`] half of the producer/consumer pair. Must only be used
/// off the async runtime.
pub struct ChannelWriter {
    tx: mpsc::Sender<Chunk>,
    stop: CancellationToken,
    handle: Handle,
    buf: Vec<u8>,
}

impl ChannelWriter {
    pub fn new(tx: mpsc::Sender<Chunk>, stop: CancellationToken, handle: Handle) -> Self {
        Self {
            tx,
            stop,
            handle,
            buf: Vec::with_capacity(CHUNK_SIZE),
        }
    }

    fn send_buffered(&mut self) -> io::Result<()> {
        if self.buf.is_empty() {
            return Ok(());
        }
        let chunk = std::mem::replace(&mut self.buf, Vec::with_capacity(CHUNK_SIZE));
        send_blocking(&self.handle, &self.tx, &self.stop, Ok(chunk))
    }
}

impl Write for ChannelWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let room = CHUNK_SIZE - self.buf.len();
        let n = buf.len().min(room);
        self.buf.extend_from_slice(&buf[..n]);
        if self.buf.len() >= CHUNK_SIZE {
            self.send_buffered()?;
        }
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.send_buffered()
    }
}

/// POST `job` to `url` as a streamed multipart body.
///
/// Cancelling `cancel` drops the request, fails the body stream and stops the
/// producer, even one blocked on a stalled connection. A producer error after
/// a completed response is returned; after a rejection it is only logged,
/// since the server closing early is the usual cause.
pub async fn upload(
    http: &reqwest::Client,
    url: reqwest::Url,
    job: UploadJob,
    cancel: CancellationToken,
) -> Result<UploadOutcome, PluginError> {
    let (tx, rx) = mpsc::channel::<Chunk>(CHANNEL_DEPTH);
    // Fires on cancel, and once a response makes the rest of the body moot.
    let stop = cancel.child_token();
    let handle = Handle::current();
    let sink = ChannelWriter::new(tx.clone(), stop.clone(), handle.clone());
    let writer = MultipartWriter::new(sink);
    let content_type = writer.content_type();

    let producer_stop = stop.clone();
    let producer = tokio::task::spawn_blocking(move || {
        let result = encode_upload(writer, &job).and_then(|mut sink| sink.flush());
        if let Err(e) = &result {
            // Fail the request body instead of ending it cleanly.
            let failure = Err(io::Error::new(e.kind(), e.to_string()));
            let _ = send_blocking(&handle, &tx, &producer_stop, failure);
        }
        result
    });

    let body = stream::unfold(Some((rx, stop.clone())), |state| async move {
        let (mut rx, stop) = state?;
        tokio::select! {
            biased;
            _ = stop.cancelled() => Some((Err(cancelled_error()), None)),
            chunk = rx.recv() => chunk.map(|chunk| (chunk, Some((rx, stop)))),
        }
    });
    let request = http
        .post(url)
        .header(reqwest::header::CONTENT_TYPE, content_type)
        .body(reqwest::Body::wrap_stream(body))
        .send();

    let response = tokio::select! {
        _ = cancel.cancelled() => None,
        response = request => Some(response),
    };
    stop.cancel();

    let outcome = match response {
        None => UploadOutcome::Cancelled,
        Some(Ok(response)) => {
            let status = response.status();
            if status.is_client_error() || status.is_server_error() {
                let body = response.text().await.unwrap_or_default();
                UploadOutcome::Rejected {
                    status: status.as_u16(),
                    body,
                }
            } else {
                UploadOutcome::Completed
            }
        }
        Some(Err(e)) => {
            if let Ok(Ok(Err(produce_err))) = tokio::time::timeout(PRODUCER_GRACE, producer).await {
                debug!("Producer stopped: {}", produce_err);
            }
            return Err(PluginError::from_reqwest(e));
        }
    };

    match tokio::time::timeout(PRODUCER_GRACE, producer).await {
        Ok(Ok(Ok(()))) => {}
        Ok(Ok(Err(e))) if outcome == UploadOutcome::Completed => return Err(e.into()),
        Ok(Ok(Err(e))) => debug!("Producer stopped: {}", e),
        Ok(Err(e)) => warn!("Upload producer panicked: {}", e),
        Err(_) => warn!("Upload producer still busy after {:?}, abandoning it", PRODUCER_GRACE),
    }
    Ok(outcome)
}

/// The plugin's single in-flight upload.
#[derive(Debug, Default)]
pub struct UploadSlot {
    current: Mutex<Option<(u64, CancellationToken)>>,
    next_id: AtomicU64,
}

impl UploadSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the slot for a new upload, cancelling whatever held it.
    pub async fn begin(&self) -> (u64, CancellationToken) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let token = CancellationToken::new();
        let previous = self.current.lock().await.replace((id, token.clone()));
        if let Some((previous_id, previous_token)) = previous {
            debug!(upload = previous_id, "Superseding upload");
            previous_token.cancel();
        }
        (id, token)
    }

    /// Cancel the current upload. Returns whether there was one.
    pub async fn abort(&self) -> bool {
        match self.current.lock().await.take() {
            Some((_, token)) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Release the slot if upload `id` still holds it.
    pub async fn finish(&self, id: u64) {
        let mut current = self.current.lock().await;
        if current.as_ref().is_some_and(|(held, _)| *held == id) {
            *current = None;
        }
    }

    pub async fn is_busy(&self) -> bool {
        self.current.lock().await.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::read::GzDecoder;
    use std::io::Read;

    fn job(dir: &Path, files: &[(&str, &[u8])]) -> UploadJob {
        for (path, data) in files {
            let full = dir.join(path);
            std::fs::create_dir_all(full.parent().unwrap()).unwrap();
            std::fs::write(full, data).unwrap();
        }
        UploadJob {
            directory: dir.to_path_buf(),
            changes: br#"{"project":"parks","files":[]}"#.to_vec(),
            files: files
                .iter()
                .map(|(path, data)| FileRecord {
                    path: path.to_string(),
                    size: data.len() as u64,
                })
                .collect(),
            progress_step: 1024,
        }
    }

    /// Split a body produced with boundary "b" into (headers, payload) pairs.
    fn parts(text: &[u8]) -> Vec<(String, Vec<u8>)> {
        let delimiter = b"--b";
        let mut positions = Vec::new();
        let mut i = 0;
        while i + delimiter.len() <= text.len() {
            let at_line_start = i == 0 || (i >= 2 && &text[i - 2..i] == b"\r\n");
            if &text[i..i + delimiter.len()] == delimiter && at_line_start {
                positions.push(i);
                i += delimiter.len();
            } else {
                i += 1;
            }
        }
        positions
            .windows(2)
            .map(|w| {
                let part = &text[w[0] + delimiter.len() + 2..w[1] - 2];
                let split = part.windows(4).position(|x| x == b"\r\n\r\n").unwrap();
                (
                    String::from_utf8(part[..split].to_vec()).unwrap(),
                    part[split + 4..].to_vec(),
                )
            })
            .collect()
    }

    #[test]
    fn encodes_changes_then_files_with_selective_compression() {
        let tmp = tempfile::tempdir().unwrap();
        let qgs = b"<qgis version=\"3\">layers</qgis>".repeat(50);
        let tif = vec![0xFFu8, 0xD8, 0x00, 0x01];
        let job = job(tmp.path(), &[("project.qgs", &qgs), ("rasters/dem.tif", &tif)]);

        let body = encode_upload(MultipartWriter::with_boundary(Vec::new(), "b"), &job).unwrap();
        let parts = parts(&body);
        assert_eq!(parts.len(), 3);

        assert!(parts[0].0.contains("name=\"changes\""));
        assert_eq!(parts[0].1, job.changes);

        assert!(parts[1].0.contains("name=\"project.qgs\"; filename=\"project.qgs.gz\""));
        assert!(parts[1].0.contains("Content-Type: application/octet-stream"));
        let mut inflated = Vec::new();
        GzDecoder::new(parts[1].1.as_slice())
            .read_to_end(&mut inflated)
            .unwrap();
        assert_eq!(inflated, qgs);

        assert!(parts[2].0.contains("name=\"rasters/dem.tif\"; filename=\"rasters/dem.tif\""));
        assert_eq!(parts[2].1, tif);
    }

    #[test]
    fn missing_source_file_fails() {
        let tmp = tempfile::tempdir().unwrap();
        let mut job = job(tmp.path(), &[]);
        job.files.push(FileRecord {
            path: "gone.qgs".into(),
            size: 1,
        });
        let err = encode_upload(MultipartWriter::new(Vec::new()), &job).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }

    #[test]
    fn escaping_paths_are_refused() {
        let tmp = tempfile::tempdir().unwrap();
        let mut job = job(tmp.path(), &[]);
        job.files.push(FileRecord {
            path: "../secret".into(),
            size: 1,
        });
        let err = encode_upload(MultipartWriter::new(Vec::new()), &job).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }

    #[tokio::test]
    async fn channel_writer_chunks_and_reports_closed_channel() {
        let (tx, mut rx) = mpsc::channel(4);
        let handle = Handle::current();
        let producer = tokio::task::spawn_blocking(move || {
            let mut writer = ChannelWriter::new(tx, CancellationToken::new(), handle);
            writer.write_all(&vec![1u8; CHUNK_SIZE + 10])?;
            writer.flush()
        });

        let first = rx.recv().await.unwrap().unwrap();
        let second = rx.recv().await.unwrap().unwrap();
        assert_eq!(first.len(), CHUNK_SIZE);
        assert_eq!(second.len(), 10);
        producer.await.unwrap().unwrap();
        assert!(rx.recv().await.is_none());

        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let handle = Handle::current();
        let err = tokio::task::spawn_blocking(move || {
            let mut writer = ChannelWriter::new(tx, CancellationToken::new(), handle);
            writer.write_all(b"abc")?;
            writer.flush()
        })
        .await
        .unwrap()
        .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
    }

    #[tokio::test]
    async fn channel_writer_stops_waiting_once_cancelled() {
        let (tx, _rx) = mpsc::channel(1);
        let stop = CancellationToken::new();
        let writer_stop = stop.clone();
        let handle = Handle::current();
        let producer = tokio::task::spawn_blocking(move || {
            let mut writer = ChannelWriter::new(tx, writer_stop, handle);
            // The first chunk fills the channel; nobody ever makes room for the second.
            writer.write_all(&vec![0u8; CHUNK_SIZE * 3])
        });

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!producer.is_finished());
        stop.cancel();

        let err = tokio::time::timeout(Duration::from_secs(5), producer)
            .await
            .expect("writer still blocked after cancel")
            .unwrap()
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionAborted);
    }

    #[tokio::test]
    async fn cancel_returns_promptly_when_server_stops_reading() {
        use tokio::io::AsyncReadExt;

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut head = vec![0u8; 64 * 1024];
            socket.read_exact(&mut head).await.unwrap();
            // Hold the connection open without reading or answering.
            tokio::time::sleep(Duration::from_secs(60)).await;
            drop(socket);
        });

        let tmp = tempfile::tempdir().unwrap();
        let big = vec![7u8; 32 * 1024 * 1024];
        let job = job(tmp.path(), &[("rasters/dem.tif", &big)]);
        let url = reqwest::Url::parse(&format!("http://{}/api/project/upload/parks", addr)).unwrap();

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            trigger.cancel();
        });

        let outcome = tokio::time::timeout(
            Duration::from_secs(3),
            upload(&reqwest::Client::new(), url, job, cancel),
        )
        .await
        .expect("cancelled upload did not return");
        assert_eq!(outcome.unwrap(), UploadOutcome::Cancelled);
        server.abort();
    }

    #[tokio::test]
    async fn slot_keeps_one_upload_and_abort_is_idempotent() {
        let slot = UploadSlot::new();
        let (first_id, first) = slot.begin().await;
        let (second_id, second) = slot.begin().await;
        assert!(first.is_cancelled());
        assert!(!second.is_cancelled());

        // The superseded upload finishing must not release its successor.
        slot.finish(first_id).await;
        assert!(slot.is_busy().await);

        assert!(slot.abort().await);
        assert!(second.is_cancelled());
        assert!(!slot.abort().await);

        slot.finish(second_id).await;
        assert!(!slot.is_busy().await);
    }
}
