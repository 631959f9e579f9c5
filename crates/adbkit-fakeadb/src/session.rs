//! JDWP sessions between a debugger and a fake process.

use std::fmt;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use adbkit_jdwp::wire::{read_handshake, write_handshake, write_packet};
use adbkit_jdwp::{DdmsChunk, JdwpPacket, PacketChannel, PayloadProvider, WireConfig};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::device::{ClientState, DeviceState};
use crate::handlers::HandlerTable;
use crate::hub::HandlerResult;
use crate::{FakeAdbError, Result};

/// First id used for packets the fake process originates, away from debugger ids.
const SERVER_PACKET_ID_BASE: i32 = 0x4000_0000;

/// How concurrent `jdwp:<pid>` requests for one process are arbitrated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionPolicy {
    /// Devices at or above this API level queue a second session until the first one
    /// ends. Older devices reject it.
    pub exclusive_session_api_level: u32,
    pub handoff_poll: Duration,
    pub handoff_timeout: Duration,
}

impl Default for SessionPolicy {
    fn default() -> Self {
        Self {
            exclusive_session_api_level: 28,
            handoff_poll: Duration::from_millis(100),
            handoff_timeout: Duration::from_secs(30),
        }
    }
}

/// A claimed session slot, released on drop.
#[derive(Debug)]
pub struct SessionSlot {
    client: Arc<ClientState>,
    handle: CancellationToken,
    claim: u64,
}

impl SessionSlot {
    /// Cancelled when the process stops or the device goes offline.
    pub fn handle(&self) -> &CancellationToken {
        &self.handle
    }
}

impl Drop for SessionSlot {
    fn drop(&mut self) {
        self.client.release_jdwp_session(self.claim);
    }
}

/// Claims the session slot of `client`, waiting for the current owner on recent devices.
pub async fn acquire_session(
    device: &DeviceState,
    client: &Arc<ClientState>,
    policy: &SessionPolicy,
) -> Result<SessionSlot> {
    let started = Instant::now();
    loop {
        let handle = device.scope().child_token();
        if let Some(claim) = client.claim_jdwp_session(handle.clone()) {
            return Ok(SessionSlot {
                client: Arc::clone(client),
                handle,
                claim,
            });
        }
        if device.api_level() < policy.exclusive_session_api_level
            || started.elapsed() >= policy.handoff_timeout
        {
            return Err(FakeAdbError::SessionConflict { pid: client.pid() });
        }
        tracing::trace!(
            target: "adbkit.fakeadb",
            serial = device.serial(),
            pid = client.pid(),
            "waiting for the current JDWP session to end"
        );
        tokio::select! {
            _ = device.scope().cancelled() => {
                return Err(FakeAdbError::Cancelled(format!(
                    "device {} went offline",
                    device.serial()
                )));
            }
            _ = tokio::time::sleep(policy.handoff_poll) => {}
        }
    }
}

pub(crate) type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// What a handler can see and do while serving one packet.
pub struct SessionContext {
    device: Arc<DeviceState>,
    client: Arc<ClientState>,
    writer: Arc<Mutex<BoxedWriter>>,
    wire: WireConfig,
    next_id: AtomicI32,
}

impl SessionContext {
    pub(crate) fn new(
        device: Arc<DeviceState>,
        client: Arc<ClientState>,
        writer: BoxedWriter,
        wire: WireConfig,
    ) -> Self {
        Self {
            device,
            client,
            writer: Arc::new(Mutex::new(writer)),
            wire,
            next_id: AtomicI32::new(SERVER_PACKET_ID_BASE),
        }
    }

    pub fn device(&self) -> &Arc<DeviceState> {
        &self.device
    }

    pub fn client(&self) -> &Arc<ClientState> {
        &self.client
    }

    pub async fn send(&self, packet: &JdwpPacket) -> Result<()> {
        let mut writer = self.writer.lock().await;
        write_packet(&mut *writer, packet, &self.wire).await?;
        Ok(())
    }

    /// Replies to `request` with `error_code` and an in-memory payload.
    pub async fn reply(&self, request: &JdwpPacket, error_code: u16, payload: Vec<u8>) -> Result<()> {
        let reply = JdwpPacket::reply(request.id(), error_code, PayloadProvider::from_bytes(payload))?;
        self.send(&reply).await
    }

    pub async fn reply_chunk(&self, request: &JdwpPacket, chunk: DdmsChunk) -> Result<()> {
        self.send(&chunk.into_reply(request.id())?).await
    }

    /// Sends a chunk the process originates, as a DDMS command.
    pub async fn send_chunk(&self, chunk: DdmsChunk) -> Result<()> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.send(&chunk.into_command(id)?).await
    }
}

impl fmt::Debug for SessionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionContext")
            .field("serial", &self.device.serial())
            .field("pid", &self.client.pid())
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    AwaitingHandshake,
    Dispatching,
    Closed,
}

/// One JDWP connection to a fake process.
///
/// The session first expects the 14-byte handshake and echoes it. Anything else ends the
/// session with [`FakeAdbError::HandshakeRejected`] and nothing is written back.
///
/// After the handshake every packet is dispatched through the [`HandlerTable`] until the
/// peer disconnects, a handler stops the session, or the session handle is cancelled.
pub struct JdwpSession {
    context: SessionContext,
    handlers: Arc<HandlerTable>,
    state: SessionState,
}

impl JdwpSession {
    pub fn new(
        device: Arc<DeviceState>,
        client: Arc<ClientState>,
        handlers: Arc<HandlerTable>,
        writer: impl AsyncWrite + Send + Unpin + 'static,
        wire: WireConfig,
    ) -> Self {
        Self {
            context: SessionContext::new(device, client, Box::new(writer), wire),
            handlers,
            state: SessionState::AwaitingHandshake,
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub async fn run<R>(&mut self, reader: R, cancel: CancellationToken) -> Result<()>
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        let result = self.serve(reader, cancel).await;
        self.state = SessionState::Closed;
        result
    }

    async fn serve<R>(&mut self, mut reader: R, cancel: CancellationToken) -> Result<()>
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        let handshake = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            result = read_handshake(&mut reader) => result,
        };
        if let Err(err) = handshake {
            // Closed without a response; the caller only logs this.
            return Err(FakeAdbError::HandshakeRejected(err.to_string()));
        }
        {
            let mut writer = self.context.writer.lock().await;
            write_handshake(&mut *writer).await?;
        }
        self.state = SessionState::Dispatching;
        tracing::debug!(
            target: "adbkit.fakeadb",
            serial = self.context.device.serial(),
            pid = self.context.client.pid(),
            "JDWP session started"
        );

        let mut channel = PacketChannel::new(reader);
        loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => break,
                next = channel.next_packet() => next,
            };
            let Some(packet) = next? else {
                break;
            };
            if self.dispatch(&packet).await? == HandlerResult::Stop {
                break;
            }
        }
        tracing::debug!(
            target: "adbkit.fakeadb",
            pid = self.context.client.pid(),
            "JDWP session ended"
        );
        Ok(())
    }

    async fn dispatch(&self, packet: &JdwpPacket) -> Result<HandlerResult> {
        self.context.client.record_packet(packet.is_ddms_command());
        tracing::trace!(target: "adbkit.fakeadb", packet = %packet, "dispatching");

        let result = if packet.is_ddms_command() {
            let chunk = DdmsChunk::from_packet(packet).await?;
            self.handlers
                .dispatch_ddms(&self.context, packet, chunk)
                .await?
        } else if packet.is_command() {
            self.handlers.dispatch_jdwp(&self.context, packet).await?
        } else {
            tracing::debug!(target: "adbkit.fakeadb", packet = %packet, "ignoring reply from debugger");
            HandlerResult::Continue
        };

        // Keep the channel aligned whatever the handler consumed.
        packet.shutdown().await?;
        Ok(result)
    }
}

impl fmt::Debug for JdwpSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JdwpSession")
            .field("context", &self.context)
            .field("state", &self.state)
            .finish()
    }
}
