//! File Service (component G).
//!
//! Registration copies no bytes: a file record only ever stores a path on
//! the sender's local filesystem. `open_stream` is the sole place content
//! actually moves, and it is wrapped so every 500ms of wall time a
//! `file_transfer` progress event reaches the bus (§4.7).

use std::net::IpAddr;
use std::path::Path;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use bytes::Bytes;
use futures::Stream;
use tokio_util::io::ReaderStream;
use uuid::Uuid;

use crate::db::{Db, FileRow};
use crate::error::CoreResult;
use crate::events::{Event, EventBus, FileTransferStatus};
use crate::peers::unix_now;

pub const PROGRESS_THROTTLE: Duration = Duration::from_millis(500);

pub struct FileService {
    db: Arc<Db>,
    events: Arc<EventBus>,
}

impl FileService {
    pub fn new(db: Arc<Db>, events: Arc<EventBus>) -> Self {
        Self { db, events }
    }

    /// Register an on-disk path as a new file record. The content is never
    /// copied; `path` must exist and be readable at registration time so
    /// `size` can be captured, but nothing stops it from moving later (the
    /// eventual GET would then simply fail).
    pub fn register(
        &self,
        sender_guid: Uuid,
        receiver_guid: Option<Uuid>,
        path: &str,
        filename: Option<String>,
    ) -> CoreResult<FileRow> {
        let meta = std::fs::metadata(path)?;
        let filename = filename.unwrap_or_else(|| {
            Path::new(path)
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_else(|| path.to_string())
        });
        let mime_type = mime_guess::from_path(path).first_or_octet_stream().to_string();
        let row = FileRow {
            file_id: Uuid::new_v4().to_string(),
            sender_guid: sender_guid.to_string(),
            receiver_guid: receiver_guid.map(|g| g.to_string()),
            filename,
            path: path.to_string(),
            size: meta.len() as i64,
            mime_type,
            created_at: unix_now(),
        };
        self.db.insert_file(&row)?;
        Ok(row)
    }

    pub fn list(&self) -> CoreResult<Vec<FileRow>> {
        self.db.list_files()
    }

    pub fn truncate(&self) -> CoreResult<()> {
        self.db.truncate_files()
    }

    pub fn get_record(&self, file_id: &str) -> CoreResult<Option<FileRow>> {
        self.db.get_file(file_id)
    }

    /// Open the file and wrap it in a progress-reporting stream. Possession
    /// of `file_id` is the only authentication (§4.7) — callers are expected
    /// to have already resolved the record via `get_record`.
    pub async fn open_stream(
        &self,
        row: &FileRow,
        client_ip: IpAddr,
    ) -> CoreResult<ProgressStream> {
        let file = tokio::fs::File::open(&row.path).await?;
        Ok(ProgressStream::new(
            ReaderStream::new(file),
            Arc::clone(&self.events),
            row.file_id.clone(),
            row.filename.clone(),
            row.size.max(0) as u64,
            client_ip,
        ))
    }
}

/// Wraps a `ReaderStream<File>`, publishing `file_transfer` events on the
/// bus: one `starting` before the first poll resolves, throttled
/// `transferring` updates, and exactly one terminal `completed`/`failed`.
pub struct ProgressStream {
    inner: ReaderStream<tokio::fs::File>,
    events: Arc<EventBus>,
    file_id: String,
    transfer_id: String,
    filename: String,
    size: u64,
    client_ip: String,
    bytes_read: u64,
    started: Instant,
    last_emit: Instant,
    start_unix: i64,
    emitted_start: bool,
    terminal_emitted: bool,
}

impl ProgressStream {
    fn new(
        inner: ReaderStream<tokio::fs::File>,
        events: Arc<EventBus>,
        file_id: String,
        filename: String,
        size: u64,
        client_ip: IpAddr,
    ) -> Self {
        let now = Instant::now();
        Self {
            inner,
            events,
            file_id,
            transfer_id: Uuid::new_v4().to_string(),
            filename,
            size,
            client_ip: client_ip.to_string(),
            bytes_read: 0,
            started: now,
            last_emit: now,
            start_unix: unix_now(),
            emitted_start: false,
            terminal_emitted: false,
        }
    }

    fn progress_pct(&self) -> f64 {
        if self.size == 0 {
            100.0
        } else {
            (self.bytes_read as f64 / self.size as f64 * 100.0).min(100.0)
        }
    }

    fn instantaneous_speed(&self) -> f64 {
        let elapsed = self.started.elapsed().as_secs_f64();
        if elapsed <= 0.0 {
            0.0
        } else {
            self.bytes_read as f64 / elapsed
        }
    }

    fn base_event(&self, status: FileTransferStatus) -> Event {
        Event::FileTransfer {
            file_id: self.file_id.clone(),
            transfer_id: self.transfer_id.clone(),
            filename: self.filename.clone(),
            size: self.size,
            client_ip: self.client_ip.clone(),
            status,
            progress_pct: self.progress_pct(),
            bytes_read: self.bytes_read,
            instantaneous_speed_bps: self.instantaneous_speed(),
            start_time: self.start_unix,
        }
    }

    fn emit_terminal(&mut self, status: FileTransferStatus) {
        if self.terminal_emitted {
            return;
        }
        self.terminal_emitted = true;
        self.events.publish(self.base_event(status));
    }
}

impl Stream for ProgressStream {
    type Item = std::io::Result<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if !self.emitted_start {
            self.emitted_start = true;
            let ev = self.base_event(FileTransferStatus::Starting);
            self.events.publish(ev);
        }

        match Pin::new(&mut self.inner).poll_next(cx) {
            Poll::Ready(Some(Ok(chunk))) => {
                self.bytes_read += chunk.len() as u64;
                if self.last_emit.elapsed() >= PROGRESS_THROTTLE {
                    self.last_emit = Instant::now();
                    let ev = self.base_event(FileTransferStatus::Transferring);
                    self.events.publish(ev);
                }
                Poll::Ready(Some(Ok(chunk)))
            }
            Poll::Ready(Some(Err(e))) => {
                self.emit_terminal(FileTransferStatus::Failed);
                Poll::Ready(Some(Err(e)))
            }
            Poll::Ready(None) => {
                self.emit_terminal(FileTransferStatus::Completed);
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for ProgressStream {
    /// A client disconnect drops the stream without the poll loop ever
    /// observing `None`/`Err` — make sure the terminal event still fires.
    fn drop(&mut self) {
        self.emit_terminal(FileTransferStatus::Failed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[tokio::test]
    async fn register_and_stream_roundtrip() {
        let db = Arc::new(Db::open_memory().unwrap());
        let events = Arc::new(EventBus::new());
        let svc = FileService::new(Arc::clone(&db), Arc::clone(&events));

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hello.txt");
        std::fs::write(&path, b"hello mesh").unwrap();

        let sender = Uuid::new_v4();
        let row = svc.register(sender, None, path.to_str().unwrap(), None).unwrap();
        assert_eq!(row.size, 10);
        assert_eq!(row.filename, "hello.txt");

        let mut session = events.subscribe();
        let mut stream = svc.open_stream(&row, "127.0.0.1".parse().unwrap()).await.unwrap();
        let mut collected = Vec::new();
        while let Some(chunk) = stream.next().await {
            collected.extend_from_slice(&chunk.unwrap());
        }
        assert_eq!(collected, b"hello mesh");
        drop(stream);

        let mut saw_starting = false;
        let mut saw_completed = false;
        while let Ok(ev) = session.rx.try_recv() {
            if let Event::FileTransfer { status, .. } = ev {
                match status {
                    FileTransferStatus::Starting => saw_starting = true,
                    FileTransferStatus::Completed => saw_completed = true,
                    _ => {}
                }
            }
        }
        assert!(saw_starting);
        assert!(saw_completed);
    }

    #[test]
    fn register_missing_path_fails() {
        let db = Arc::new(Db::open_memory().unwrap());
        let events = Arc::new(EventBus::new());
        let svc = FileService::new(db, events);
        let err = svc.register(Uuid::new_v4(), None, "/no/such/path", None);
        assert!(err.is_err());
    }
}
