//! Framing of JDWP packets on a byte channel.

use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::packet::JdwpPacket;
use crate::payload::{PayloadProvider, StreamPolicy};
use crate::{JdwpError, Result, HANDSHAKE, JDWP_HEADER_LEN};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WireConfig {
    /// Packets up to this many bytes (header included) are written with a single write.
    /// Larger packets flush the header first and stream the payload after it.
    pub inline_buffer_threshold: usize,
}

impl Default for WireConfig {
    fn default() -> Self {
        Self {
            inline_buffer_threshold: 8 * 1024,
        }
    }
}

/// Writes `packet` as exactly `header + payload`.
///
/// Fails with [`JdwpError::FramingMismatch`] when the payload provider produces a byte count
/// different from `length - 11`. On the streaming path the check can only happen after
/// the bytes were written, so callers with data-dependent payload sizes should validate
/// their providers up front.
pub async fn write_packet<W>(writer: &mut W, packet: &JdwpPacket, config: &WireConfig) -> Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    let header = packet.header_bytes();
    let expected = packet.payload_len();

    if packet.length() as usize <= config.inline_buffer_threshold {
        let mut reader = packet.payload().acquire().await?;
        let capacity = usize::try_from(expected).unwrap_or(0).min(1 << 20);
        let mut frame = Vec::with_capacity(JDWP_HEADER_LEN + capacity);
        frame.extend_from_slice(&header);
        let read = reader.read_to_end(&mut frame).await;
        let actual = reader.position();
        if let Err(err) = read {
            return Err(short_payload(packet, err, expected, actual));
        }
        if actual != expected {
            return Err(JdwpError::FramingMismatch { expected, actual });
        }
        drop(reader);
        writer.write_all(&frame).await?;
        writer.flush().await?;
        return Ok(());
    }

    writer.write_all(&header).await?;
    writer.flush().await?;

    let mut reader = packet.payload().acquire().await?;
    let copied = tokio::io::copy(&mut (&mut reader).take(expected), writer).await;
    if let Err(err) = copied {
        let actual = reader.position();
        return Err(short_payload(packet, err, expected, actual));
    }
    let mut actual = reader.position();
    if actual == expected {
        tokio::io::copy(&mut reader, &mut tokio::io::sink())
            .await
            .map_err(|err| short_payload(packet, err, expected, expected))?;
        actual = reader.position();
    }
    writer.flush().await?;

    if actual != expected {
        tracing::warn!(
            target: "adbkit.jdwp",
            packet = %packet,
            expected,
            actual,
            "payload provider produced the wrong number of bytes"
        );
        return Err(JdwpError::FramingMismatch { expected, actual });
    }
    Ok(())
}

/// A payload source that ends early is a framing mismatch, not an I/O failure.
fn short_payload(packet: &JdwpPacket, err: io::Error, expected: u64, actual: u64) -> JdwpError {
    if err.kind() != io::ErrorKind::UnexpectedEof {
        return err.into();
    }
    tracing::warn!(
        target: "adbkit.jdwp",
        packet = %packet,
        expected,
        actual,
        "payload source ended early"
    );
    JdwpError::FramingMismatch { expected, actual }
}

/// Encodes `packet` into a freshly allocated buffer.
pub async fn encode_to_vec(packet: &JdwpPacket) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(packet.length() as usize);
    write_packet(&mut out, packet, &WireConfig::default()).await?;
    Ok(out)
}

pub async fn write_handshake<W>(writer: &mut W) -> Result<()>
where
    W: AsyncWrite + Unpin + ?Sized,
{
    writer.write_all(HANDSHAKE).await?;
    writer.flush().await?;
    Ok(())
}

/// Reads exactly the 14 handshake bytes and rejects anything else.
pub async fn read_handshake<R>(reader: &mut R) -> Result<()>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let mut buf = [0u8; HANDSHAKE.len()];
    reader.read_exact(&mut buf).await?;
    if &buf != HANDSHAKE {
        return Err(JdwpError::Protocol(format!(
            "invalid JDWP handshake: {:?}",
            String::from_utf8_lossy(&buf)
        )));
    }
    Ok(())
}

/// Decodes successive packets from one read half.
///
/// Each decoded packet streams its payload straight from the channel, so the channel
/// stays locked by that packet until its payload is consumed, shut down, detached with
/// `to_offline`, or the packet is dropped. Bytes a previous packet left unread are
/// skipped before the next header is read.
pub struct PacketChannel<R> {
    reader: Arc<Mutex<R>>,
    unread: Arc<AtomicU64>,
    policy: StreamPolicy,
}

impl<R> PacketChannel<R>
where
    R: AsyncRead + Send + Unpin + 'static,
{
    pub fn new(reader: R) -> Self {
        Self::with_policy(reader, StreamPolicy::Replayable)
    }

    pub fn with_policy(reader: R, policy: StreamPolicy) -> Self {
        Self {
            reader: Arc::new(Mutex::new(reader)),
            unread: Arc::new(AtomicU64::new(0)),
            policy,
        }
    }

    /// Reads the next header. Returns `Ok(None)` on a clean end of stream between packets.
    pub async fn next_packet(&mut self) -> Result<Option<JdwpPacket>> {
        let mut reader = Arc::clone(&self.reader).lock_owned().await;

        let leftover = self.unread.swap(0, Ordering::AcqRel);
        if leftover > 0 {
            let drained =
                tokio::io::copy(&mut (&mut *reader).take(leftover), &mut tokio::io::sink()).await?;
            tracing::debug!(target: "adbkit.jdwp", drained, "skipped unread payload of previous packet");
            if drained != leftover {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "channel closed inside a packet payload",
                )
                .into());
            }
        }

        let mut header = [0u8; JDWP_HEADER_LEN];
        let mut filled = 0;
        while filled < header.len() {
            let n = reader.read(&mut header[filled..]).await?;
            if n == 0 {
                if filled == 0 {
                    return Ok(None);
                }
                return Err(JdwpError::Protocol(format!(
                    "channel closed after {filled} of {JDWP_HEADER_LEN} header bytes"
                )));
            }
            filled += n;
        }

        let length = u32::from_be_bytes([header[0], header[1], header[2], header[3]]);
        let id = i32::from_be_bytes([header[4], header[5], header[6], header[7]]);
        let flags = header[8];
        if (length as usize) < JDWP_HEADER_LEN {
            return Err(JdwpError::Protocol(format!(
                "malformed JDWP header: length {length} is smaller than the header"
            )));
        }

        let payload_len = u64::from(length) - JDWP_HEADER_LEN as u64;
        let payload = if payload_len == 0 {
            PayloadProvider::empty()
        } else {
            self.unread.store(payload_len, Ordering::Release);
            PayloadProvider::from_stream(
                ChannelSlice {
                    reader,
                    unread: Arc::clone(&self.unread),
                },
                payload_len,
                self.policy,
            )
        };

        let packet = JdwpPacket::from_header(length, id, flags, [header[9], header[10]], payload)?;
        tracing::trace!(target: "adbkit.jdwp", packet = %packet, "decoded packet header");
        Ok(Some(packet))
    }
}

/// The payload window of one packet on a shared channel.
struct ChannelSlice<R> {
    reader: OwnedMutexGuard<R>,
    unread: Arc<AtomicU64>,
}

impl<R: AsyncRead + Unpin> AsyncRead for ChannelSlice<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();
        let poll = Pin::new(&mut *this.reader).poll_read(cx, buf);
        let n = (buf.filled().len() - before) as u64;
        if n > 0 {
            let _ = this
                .unread
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |unread| {
                    Some(unread.saturating_sub(n))
                });
        }
        poll
    }
}
