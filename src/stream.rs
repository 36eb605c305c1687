//! Streaming delivery of a conversion result.
//!
//! ## Who owns cleanup?
//!
//! A media transcode can be hundreds of MB, so it is streamed from its
//! scratch file instead of being buffered. That means the job is not over
//! when [`crate::ConversionService::convert`] returns: the scratch scope and
//! the queue permit have to live until the caller has read the last byte.
//!
//! [`OutputStream`] owns both. When the stream is exhausted, errors, or is
//! dropped half-way (client disconnect), it releases the output file, drops
//! the scope (which drains every other scratch resource of the job) and gives
//! the permit back.

use crate::error::ConvertError;
use crate::pipeline::queue::Permit;
use crate::pipeline::scratch::{ScratchHandle, ScratchScope};
use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use std::fmt;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio_stream::Stream;
use tokio_util::io::ReaderStream;
use tracing::debug;

enum Body {
    Bytes(Option<Bytes>),
    File {
        reader: ReaderStream<tokio::fs::File>,
        handle: ScratchHandle,
    },
    Done,
}

/// Resources that must stay alive until the output has been consumed.
struct JobGuard {
    scope: Arc<ScratchScope>,
    _permit: Option<Permit>,
}

/// A converted file as a stream of byte chunks.
pub struct OutputStream {
    body: Body,
    guard: Option<JobGuard>,
    len: Option<u64>,
}

impl OutputStream {
    /// A fully buffered output. Nothing to clean up.
    pub fn from_bytes(bytes: Bytes) -> Self {
        let len = Some(bytes.len() as u64);
        Self {
            body: Body::Bytes(Some(bytes)),
            guard: None,
            len,
        }
    }

    /// A buffered output whose job resources are released once it has been read.
    pub(crate) fn buffered(bytes: Bytes, scope: Arc<ScratchScope>, permit: Permit) -> Self {
        let mut s = Self::from_bytes(bytes);
        s.guard = Some(JobGuard {
            scope,
            _permit: Some(permit),
        });
        s
    }

    /// Stream `handle` out of `scope`, releasing it after the last chunk.
    pub(crate) async fn from_scratch_file(
        handle: ScratchHandle,
        scope: Arc<ScratchScope>,
        permit: Option<Permit>,
    ) -> Result<Self, ConvertError> {
        let file = tokio::fs::File::open(handle.path())
            .await
            .map_err(|e| ConvertError::Internal(format!("opening engine output: {e}")))?;
        let len = file.metadata().await.ok().map(|m| m.len());
        Ok(Self {
            body: Body::File {
                reader: ReaderStream::new(file),
                handle,
            },
            guard: Some(JobGuard {
                scope,
                _permit: permit,
            }),
            len,
        })
    }

    /// Total size, when known up front.
    pub fn len(&self) -> Option<u64> {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == Some(0)
    }

    /// Read the whole output into memory.
    pub async fn into_bytes(mut self) -> io::Result<Bytes> {
        if let Body::Bytes(b) = &mut self.body {
            let bytes = b.take().unwrap_or_default();
            self.finish();
            return Ok(bytes);
        }
        let mut buf = BytesMut::with_capacity(self.len.unwrap_or(0).min(64 * 1024 * 1024) as usize);
        while let Some(chunk) = self.next().await {
            buf.extend_from_slice(&chunk?);
        }
        Ok(buf.freeze())
    }

    /// Copy the whole output into `writer`, returning the byte count.
    pub async fn write_to<W>(mut self, writer: &mut W) -> io::Result<u64>
    where
        W: AsyncWrite + Unpin,
    {
        let mut written = 0u64;
        while let Some(chunk) = self.next().await {
            let chunk = chunk?;
            writer.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        writer.flush().await?;
        Ok(written)
    }

    fn finish(&mut self) {
        let body = std::mem::replace(&mut self.body, Body::Done);
        if let Some(guard) = self.guard.take() {
            if let Body::File { reader, handle } = body {
                // Close the file before deleting it.
                drop(reader);
                guard.scope.release(&handle);
            }
            debug!(scope = %guard.scope.path().display(), "Output delivered; releasing job resources");
        }
    }
}

impl Stream for OutputStream {
    type Item = io::Result<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = &mut *self;
        let item = match &mut this.body {
            Body::Bytes(b) => b.take().map(Ok),
            Body::File { reader, .. } => match Pin::new(reader).poll_next(cx) {
                Poll::Ready(item) => item,
                Poll::Pending => return Poll::Pending,
            },
            Body::Done => None,
        };
        if !matches!(item, Some(Ok(_))) {
            this.finish();
        }
        Poll::Ready(item)
    }
}

impl Drop for OutputStream {
    fn drop(&mut self) {
        self.finish();
    }
}

impl fmt::Debug for OutputStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let body = match &self.body {
            Body::Bytes(_) => "bytes",
            Body::File { .. } => "file",
            Body::Done => "done",
        };
        f.debug_struct("OutputStream")
            .field("body", &body)
            .field("len", &self.len)
            .field("holds_job", &self.guard.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::queue::{JobQueue, ResourceClass};
    use crate::pipeline::scratch::ScratchLedger;

    fn scope(root: &tempfile::TempDir, ledger: Arc<ScratchLedger>) -> Arc<ScratchScope> {
        Arc::new(ScratchScope::new(Some(root.path()), ledger).unwrap())
    }

    #[tokio::test]
    async fn bytes_stream_yields_once() {
        let mut s = OutputStream::from_bytes(Bytes::from_static(b"hello"));
        assert_eq!(s.len(), Some(5));
        assert_eq!(s.next().await.unwrap().unwrap(), Bytes::from_static(b"hello"));
        assert!(s.next().await.is_none());
    }

    #[tokio::test]
    async fn file_stream_releases_after_last_chunk() {
        let root = tempfile::tempdir().unwrap();
        let ledger = ScratchLedger::new();
        let queue = JobQueue::new(1, 1);
        let scope = scope(&root, ledger.clone());
        let handle = scope.acquire_from_bytes("mp3", &vec![7u8; 100_000]).await.unwrap();
        let path = handle.path().to_path_buf();
        let permit = queue.admit(ResourceClass::Heavy).unwrap();

        let stream = OutputStream::from_scratch_file(handle, scope, Some(permit))
            .await
            .unwrap();
        assert_eq!(stream.len(), Some(100_000));
        assert_eq!(queue.in_flight(ResourceClass::Heavy), 1);

        let mut sink = Vec::new();
        let n = stream.write_to(&mut sink).await.unwrap();
        assert_eq!(n, 100_000);
        assert_eq!(sink.len(), 100_000);
        assert!(!path.exists());
        assert_eq!(queue.in_flight(ResourceClass::Heavy), 0);
        assert_eq!(ledger.outstanding(), 0);
    }

    #[tokio::test]
    async fn dropping_mid_stream_cleans_up() {
        let root = tempfile::tempdir().unwrap();
        let ledger = ScratchLedger::new();
        let queue = JobQueue::new(1, 1);
        let scope = scope(&root, ledger.clone());
        let scope_dir = scope.path().to_path_buf();
        let handle = scope.acquire_from_bytes("mp4", &vec![1u8; 200_000]).await.unwrap();
        let permit = queue.admit(ResourceClass::Heavy).unwrap();

        let mut stream = OutputStream::from_scratch_file(handle, scope, Some(permit))
            .await
            .unwrap();
        let first = stream.next().await.unwrap().unwrap();
        assert!(!first.is_empty());
        drop(stream);

        assert_eq!(queue.in_flight(ResourceClass::Heavy), 0);
        assert_eq!(ledger.outstanding(), 0);
        assert!(!scope_dir.exists());
    }

    #[tokio::test]
    async fn buffered_into_bytes_releases_job() {
        let root = tempfile::tempdir().unwrap();
        let ledger = ScratchLedger::new();
        let queue = JobQueue::new(1, 1);
        let scope = scope(&root, ledger.clone());
        scope.acquire_from_bytes("png", b"input").await.unwrap();
        let permit = queue.admit(ResourceClass::Light).unwrap();

        let s = OutputStream::buffered(Bytes::from_static(b"out"), scope, permit);
        assert_eq!(s.into_bytes().await.unwrap(), Bytes::from_static(b"out"));
        assert_eq!(queue.in_flight(ResourceClass::Light), 0);
        assert_eq!(ledger.outstanding(), 0);
    }
}
