//! Allocation snapshot collaborators and streaming.
//!
//! A snapshot is produced by an [`AllocFs`] handle writing chunks into a
//! bounded channel. The handle is owned by the writer task, so it is
//! released when the task ends: on success, on error, or when the reader
//! goes away and the next send fails.

use std::io;
use std::pin::Pin;

use async_trait::async_trait;
use bytes::Bytes;
use futures::Stream;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Chunks buffered between the snapshot writer and the response body.
pub const SNAPSHOT_CHANNEL_DEPTH: usize = 8;

/// Streamed snapshot archive.
pub type SnapshotStream = Pin<Box<dyn Stream<Item = Result<Bytes, io::Error>> + Send>>;

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("allocation {0} is not hosted on this node")]
    UnknownAllocation(String),

    #[error("allocation directory unavailable: {0}")]
    Io(#[from] io::Error),
}

/// Node-local snapshot capabilities.
pub trait SnapshotSource: Send + Sync {
    /// Whether `token` authorizes a snapshot of `alloc_id`.
    fn validate_migrate_token(&self, alloc_id: &str, token: &str) -> bool;

    /// Open a filesystem handle for the allocation.
    fn alloc_fs(&self, alloc_id: &str) -> Result<Box<dyn AllocFs>, SnapshotError>;
}

/// An open allocation filesystem.
#[async_trait]
pub trait AllocFs: Send + Sync {
    /// Write a snapshot archive of the allocation into `sink`.
    async fn snapshot(&self, sink: &SnapshotSink) -> io::Result<()>;
}

/// Write side of a snapshot stream.
pub struct SnapshotSink {
    tx: mpsc::Sender<Result<Bytes, io::Error>>,
}

impl SnapshotSink {
    /// Send one chunk. Fails with `BrokenPipe` once the reader is gone.
    pub async fn send(&self, chunk: Bytes) -> io::Result<()> {
        if chunk.is_empty() {
            return Ok(());
        }
        self.tx
            .send(Ok(chunk))
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "snapshot reader went away"))
    }

    /// A blocking [`io::Write`] over this sink, for archive builders that
    /// run on a blocking thread.
    pub fn writer(&self) -> SinkWriter {
        SinkWriter {
            tx: self.tx.clone(),
            buf: Vec::with_capacity(SINK_WRITER_CHUNK),
        }
    }

    async fn fail(&self, err: io::Error) {
        let _ = self.tx.send(Err(err)).await;
    }
}

/// Bytes buffered by a [`SinkWriter`] before a chunk is sent.
pub const SINK_WRITER_CHUNK: usize = 64 * 1024;

/// Buffers writes into chunks and sends them into a snapshot sink.
///
/// Sends block, so the writer must only be used from a blocking thread
/// (`tokio::task::spawn_blocking`). Call `flush` once writing is done.
pub struct SinkWriter {
    tx: mpsc::Sender<Result<Bytes, io::Error>>,
    buf: Vec<u8>,
}

impl SinkWriter {
    fn send_buffered(&mut self) -> io::Result<()> {
        if self.buf.is_empty() {
            return Ok(());
        }
        let chunk = Bytes::from(std::mem::replace(
            &mut self.buf,
            Vec::with_capacity(SINK_WRITER_CHUNK),
        ));
        self.tx
            .blocking_send(Ok(chunk))
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "snapshot reader went away"))
    }
}

impl io::Write for SinkWriter {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.buf.extend_from_slice(data);
        if self.buf.len() >= SINK_WRITER_CHUNK {
            self.send_buffered()?;
        }
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.send_buffered()
    }
}

/// Outcome of starting a snapshot.
pub enum SnapshotStart {
    /// The writer produced data (or finished cleanly); stream the rest.
    Streaming(SnapshotStream),
    /// The writer failed before producing any data.
    Failed(io::Error),
}

/// Run `fs.snapshot` on a background task and expose it as a stream.
///
/// Waits for the first chunk so that an immediate failure can still be
/// reported as an error instead of a truncated body.
pub async fn start_snapshot(alloc_id: &str, fs: Box<dyn AllocFs>) -> SnapshotStart {
    let (tx, mut rx) = mpsc::channel(SNAPSHOT_CHANNEL_DEPTH);
    let sink = SnapshotSink { tx };
    let task_alloc_id = alloc_id.to_string();

    tokio::spawn(async move {
        let result = fs.snapshot(&sink).await;
        drop(fs);
        match result {
            Ok(()) => debug!(alloc_id = %task_alloc_id, "snapshot complete"),
            Err(e) => {
                warn!(alloc_id = %task_alloc_id, error = %e, "snapshot aborted");
                sink.fail(e).await;
            }
        }
    });

    let first = match rx.recv().await {
        Some(Ok(chunk)) => Some(chunk),
        Some(Err(e)) => return SnapshotStart::Failed(e),
        None => None,
    };

    let head = futures::stream::iter(first.map(Ok));
    let rest = futures::stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|item| (item, rx))
    });
    SnapshotStart::Streaming(Box::pin(futures::StreamExt::chain(head, rest)))
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    /// Counts live handles so tests can assert release.
    #[derive(Clone, Default)]
    pub struct HandleCounter(Arc<AtomicUsize>);

    impl HandleCounter {
        pub fn live(&self) -> usize {
            self.0.load(Ordering::SeqCst)
        }
    }

    /// Emits fixed chunks, optionally failing after them.
    pub struct ChunkFs {
        pub chunks: Vec<&'static str>,
        pub fail_after: bool,
        counter: HandleCounter,
    }

    impl ChunkFs {
        pub fn new(chunks: Vec<&'static str>, fail_after: bool, counter: &HandleCounter) -> Self {
            counter.0.fetch_add(1, Ordering::SeqCst);
            Self {
                chunks,
                fail_after,
                counter: counter.clone(),
            }
        }
    }

    impl Drop for ChunkFs {
        fn drop(&mut self) {
            self.counter.0.fetch_sub(1, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl AllocFs for ChunkFs {
        async fn snapshot(&self, sink: &SnapshotSink) -> io::Result<()> {
            for chunk in &self.chunks {
                sink.send(Bytes::from_static(chunk.as_bytes())).await?;
            }
            if self.fail_after {
                return Err(io::Error::other("disk read failed"));
            }
            Ok(())
        }
    }
}
