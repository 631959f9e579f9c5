//! Ownership of packet bodies.
//!
//! A [`PayloadProvider`] is the only way to reach the bytes of a packet. Memory-backed
//! providers hand out independent cursors and may be read concurrently. Stream-backed
//! providers wrap a single-pass source (usually the read half of a socket) and allow
//! exactly one [`PayloadReader`] at a time; the reader is a guard, so dropping it on any
//! path (including task cancellation) releases the provider for the next reader.
//!
//! Replayable streams record bytes as they pass, so a later reader starts from offset 0
//! even after a previous reader was cancelled halfway through.

use std::fmt;
use std::io::{self, Cursor};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{ready, Context, Poll};

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, ReadBuf};
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::{JdwpError, Result};

/// Single-pass byte source backing a streaming payload.
pub type PayloadSource = Box<dyn AsyncRead + Send + Unpin>;

const SCRATCH_LEN: usize = 8 * 1024;

/// Whether a streaming payload can be read more than once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StreamPolicy {
    /// Bytes are recorded as they stream past and replayed to later readers.
    #[default]
    Replayable,
    /// The source is read once; reacquiring after any byte was consumed fails.
    SinglePass,
}

#[derive(Clone)]
pub struct PayloadProvider {
    inner: Arc<Inner>,
}

enum Inner {
    Empty,
    Memory(Bytes),
    Stream(StreamPayload),
}

struct StreamPayload {
    len: u64,
    policy: StreamPolicy,
    state: Arc<Mutex<StreamState>>,
}

struct StreamState {
    source: Option<PayloadSource>,
    recorded: Vec<u8>,
    consumed: u64,
    closed: bool,
}

impl PayloadProvider {
    pub fn empty() -> Self {
        Self {
            inner: Arc::new(Inner::Empty),
        }
    }

    pub fn from_bytes(bytes: impl Into<Bytes>) -> Self {
        let bytes = bytes.into();
        if bytes.is_empty() {
            return Self::empty();
        }
        Self {
            inner: Arc::new(Inner::Memory(bytes)),
        }
    }

    /// Wraps a source that yields exactly `len` bytes of payload.
    pub fn from_stream<S>(source: S, len: u64, policy: StreamPolicy) -> Self
    where
        S: AsyncRead + Send + Unpin + 'static,
    {
        Self {
            inner: Arc::new(Inner::Stream(StreamPayload {
                len,
                policy,
                state: Arc::new(Mutex::new(StreamState {
                    source: Some(Box::new(source)),
                    recorded: Vec::new(),
                    consumed: 0,
                    closed: false,
                })),
            })),
        }
    }

    /// Declared payload size in bytes.
    pub fn len(&self) -> u64 {
        match &*self.inner {
            Inner::Empty => 0,
            Inner::Memory(bytes) => bytes.len() as u64,
            Inner::Stream(stream) => stream.len,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// `true` when readers may run concurrently without any serialization.
    pub fn is_thread_safe_and_immutable(&self) -> bool {
        !matches!(&*self.inner, Inner::Stream(_))
    }

    /// `true` when both handles refer to the same provider instance.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Acquires a reader positioned at the start of the payload.
    ///
    /// For streaming payloads this waits until any other reader has been dropped.
    pub async fn acquire(&self) -> Result<PayloadReader> {
        let inner = match &*self.inner {
            Inner::Empty => ReaderInner::Empty,
            Inner::Memory(bytes) => ReaderInner::Memory(Cursor::new(bytes.clone())),
            Inner::Stream(stream) => {
                let guard = Arc::clone(&stream.state).lock_owned().await;
                if guard.closed {
                    return Err(JdwpError::PayloadUnavailable(
                        "payload provider is closed".to_owned(),
                    ));
                }
                if stream.policy == StreamPolicy::SinglePass && guard.consumed > 0 {
                    return Err(JdwpError::PayloadUnavailable(
                        "single-pass payload stream was already read and cannot be rewound"
                            .to_owned(),
                    ));
                }
                ReaderInner::Stream(StreamReader {
                    guard,
                    len: stream.len,
                    policy: stream.policy,
                    pos: 0,
                    scratch: Vec::new(),
                })
            }
        };
        Ok(PayloadReader { inner })
    }

    /// Reads the whole payload into memory through a scoped acquisition.
    pub async fn read_all(&self) -> Result<Bytes> {
        if let Inner::Memory(bytes) = &*self.inner {
            return Ok(bytes.clone());
        }
        let mut reader = self.acquire().await?;
        let mut out = Vec::with_capacity(usize::try_from(self.len()).unwrap_or(0).min(1 << 20));
        reader.read_to_end(&mut out).await?;
        Ok(Bytes::from(out))
    }

    /// Drains whatever the source has not produced yet and closes the provider for good.
    ///
    /// Safe to call any number of times. Memory-backed providers are unaffected.
    pub async fn shutdown(&self) -> Result<()> {
        let Inner::Stream(stream) = &*self.inner else {
            return Ok(());
        };
        let mut state = stream.state.lock().await;
        if state.closed {
            return Ok(());
        }
        state.closed = true;
        state.recorded = Vec::new();

        let remaining = stream.len.saturating_sub(state.consumed);
        let Some(mut source) = state.source.take() else {
            return Ok(());
        };
        if remaining == 0 {
            return Ok(());
        }

        let drained = tokio::io::copy(&mut (&mut source).take(remaining), &mut tokio::io::sink())
            .await?;
        state.consumed += drained;
        tracing::trace!(target: "adbkit.jdwp", drained, "drained unread payload bytes");
        if drained != remaining {
            return Err(JdwpError::FramingMismatch {
                expected: stream.len,
                actual: state.consumed,
            });
        }
        Ok(())
    }

    /// Returns a provider that no longer depends on any live source.
    ///
    /// Memory-backed providers return themselves. Streaming providers read the rest of
    /// the payload once and return a new memory-backed provider; the original stays
    /// readable when it is replayable.
    pub async fn to_offline(&self) -> Result<PayloadProvider> {
        if self.is_thread_safe_and_immutable() {
            return Ok(self.clone());
        }

        let mut reader = self.acquire().await?;
        let mut bytes = Vec::with_capacity(usize::try_from(self.len()).unwrap_or(0).min(1 << 20));
        reader.read_to_end(&mut bytes).await?;
        Ok(PayloadProvider::from_bytes(bytes))
    }
}

impl Default for PayloadProvider {
    fn default() -> Self {
        Self::empty()
    }
}

impl fmt::Debug for PayloadProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match &*self.inner {
            Inner::Empty => "Empty",
            Inner::Memory(_) => "FromMemory",
            Inner::Stream(_) => "FromStream",
        };
        f.debug_struct("PayloadProvider")
            .field("kind", &kind)
            .field("len", &self.len())
            .finish()
    }
}

/// Scoped access to a payload. Dropping the reader releases the provider.
pub struct PayloadReader {
    inner: ReaderInner,
}

enum ReaderInner {
    Empty,
    Memory(Cursor<Bytes>),
    Stream(StreamReader),
}

struct StreamReader {
    guard: OwnedMutexGuard<StreamState>,
    len: u64,
    policy: StreamPolicy,
    pos: u64,
    scratch: Vec<u8>,
}

impl PayloadReader {
    /// Bytes already handed out by this reader.
    pub fn position(&self) -> u64 {
        match &self.inner {
            ReaderInner::Empty => 0,
            ReaderInner::Memory(cursor) => cursor.position(),
            ReaderInner::Stream(stream) => stream.pos,
        }
    }
}

impl fmt::Debug for PayloadReader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PayloadReader")
            .field("position", &self.position())
            .finish_non_exhaustive()
    }
}

impl AsyncRead for PayloadReader {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match &mut self.get_mut().inner {
            ReaderInner::Empty => Poll::Ready(Ok(())),
            ReaderInner::Memory(cursor) => Pin::new(cursor).poll_read(cx, buf),
            ReaderInner::Stream(stream) => stream.poll_read_stream(cx, buf),
        }
    }
}

impl StreamReader {
    fn poll_read_stream(
        &mut self,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let state = &mut *self.guard;

        let recorded = state.recorded.len() as u64;
        if self.pos < recorded {
            let start = self.pos as usize;
            let n = buf.remaining().min(state.recorded.len() - start);
            buf.put_slice(&state.recorded[start..start + n]);
            self.pos += n as u64;
            return Poll::Ready(Ok(()));
        }

        let remaining = self.len.saturating_sub(state.consumed);
        if remaining == 0 {
            state.source = None;
            return Poll::Ready(Ok(()));
        }
        if buf.remaining() == 0 {
            return Poll::Ready(Ok(()));
        }

        let Some(source) = state.source.as_mut() else {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "payload source is no longer available",
            )));
        };

        let max = (buf.remaining() as u64).min(remaining).min(SCRATCH_LEN as u64) as usize;
        if self.scratch.len() < max {
            self.scratch.resize(max, 0);
        }
        let mut chunk = ReadBuf::new(&mut self.scratch[..max]);
        ready!(Pin::new(source).poll_read(cx, &mut chunk))?;
        let filled = chunk.filled();
        if filled.is_empty() {
            return Poll::Ready(Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!(
                    "payload source ended after {} of {} bytes",
                    state.consumed, self.len
                ),
            )));
        }

        let n = filled.len();
        if self.policy == StreamPolicy::Replayable {
            state.recorded.extend_from_slice(filled);
        }
        buf.put_slice(filled);
        state.consumed += n as u64;
        self.pos += n as u64;
        if state.consumed == self.len {
            state.source = None;
        }
        Poll::Ready(Ok(()))
    }
}
