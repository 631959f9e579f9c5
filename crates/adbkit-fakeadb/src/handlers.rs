//! Dispatch tables for packets received on a JDWP session, and the built-in handlers.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use adbkit_jdwp::codec::JdwpWriter;
use adbkit_jdwp::constants::{CMD_SET_VM, CMD_VM_ID_SIZES, CMD_VM_VERSION};
use adbkit_jdwp::{ChunkType, DdmsChunk, JdwpPacket};
use async_trait::async_trait;

use crate::hub::HandlerResult;
use crate::session::SessionContext;
use crate::Result;

/// Version of the DDM protocol announced in `HELO` replies.
const DDM_PROTOCOL_VERSION: u32 = 1;

#[async_trait]
pub trait DdmsChunkHandler: Send + Sync {
    async fn handle(
        &self,
        ctx: &SessionContext,
        packet: &JdwpPacket,
        chunk: DdmsChunk,
    ) -> Result<HandlerResult>;
}

#[async_trait]
pub trait JdwpCommandHandler: Send + Sync {
    async fn handle(&self, ctx: &SessionContext, packet: &JdwpPacket) -> Result<HandlerResult>;
}

/// Handlers keyed by DDMS chunk type and by JDWP `(command set, command)`.
///
/// Packets without a registered handler are logged and skipped.
#[derive(Default, Clone)]
pub struct HandlerTable {
    ddms: HashMap<ChunkType, Arc<dyn DdmsChunkHandler>>,
    jdwp: HashMap<(u8, u8), Arc<dyn JdwpCommandHandler>>,
}

impl HandlerTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// A table answering `HELO`, `FEAT`, `MPRQ`, `REAQ`, `EXIT`, and the VM `Version`
    /// and `IDSizes` commands.
    pub fn with_builtins() -> Self {
        let mut table = Self::new();
        table
            .register_ddms(ChunkType::HELO, Arc::new(HeloHandler))
            .register_ddms(ChunkType::FEAT, Arc::new(FeatHandler))
            .register_ddms(ChunkType::MPRQ, Arc::new(StatusHandler(ChunkType::MPRQ)))
            .register_ddms(ChunkType::REAQ, Arc::new(StatusHandler(ChunkType::REAQ)))
            .register_ddms(ChunkType::EXIT, Arc::new(ExitHandler))
            .register_jdwp(CMD_SET_VM, CMD_VM_VERSION, Arc::new(VersionHandler))
            .register_jdwp(CMD_SET_VM, CMD_VM_ID_SIZES, Arc::new(IdSizesHandler));
        table
    }

    pub fn register_ddms(
        &mut self,
        chunk_type: ChunkType,
        handler: Arc<dyn DdmsChunkHandler>,
    ) -> &mut Self {
        self.ddms.insert(chunk_type, handler);
        self
    }

    pub fn register_jdwp(
        &mut self,
        cmd_set: u8,
        cmd: u8,
        handler: Arc<dyn JdwpCommandHandler>,
    ) -> &mut Self {
        self.jdwp.insert((cmd_set, cmd), handler);
        self
    }

    pub async fn dispatch_ddms(
        &self,
        ctx: &SessionContext,
        packet: &JdwpPacket,
        chunk: DdmsChunk,
    ) -> Result<HandlerResult> {
        match self.ddms.get(&chunk.chunk_type) {
            Some(handler) => handler.handle(ctx, packet, chunk).await,
            None => {
                tracing::debug!(
                    target: "adbkit.fakeadb",
                    chunk = %chunk.chunk_type,
                    pid = ctx.client().pid(),
                    "no handler for DDMS chunk"
                );
                Ok(HandlerResult::Continue)
            }
        }
    }

    pub async fn dispatch_jdwp(
        &self,
        ctx: &SessionContext,
        packet: &JdwpPacket,
    ) -> Result<HandlerResult> {
        let key = (packet.cmd_set()?, packet.cmd()?);
        match self.jdwp.get(&key) {
            Some(handler) => handler.handle(ctx, packet).await,
            None => {
                tracing::debug!(
                    target: "adbkit.fakeadb",
                    packet = %packet,
                    pid = ctx.client().pid(),
                    "no handler for JDWP command"
                );
                Ok(HandlerResult::Continue)
            }
        }
    }
}

impl fmt::Debug for HandlerTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut chunks: Vec<String> = self.ddms.keys().map(ToString::to_string).collect();
        chunks.sort();
        let mut commands: Vec<_> = self.jdwp.keys().copied().collect();
        commands.sort_unstable();
        f.debug_struct("HandlerTable")
            .field("ddms", &chunks)
            .field("jdwp", &commands)
            .finish()
    }
}

/// Answers `HELO` with the process identity, then announces `WAIT` if the process is
/// waiting for a debugger.
struct HeloHandler;

#[async_trait]
impl DdmsChunkHandler for HeloHandler {
    async fn handle(
        &self,
        ctx: &SessionContext,
        packet: &JdwpPacket,
        _chunk: DdmsChunk,
    ) -> Result<HandlerResult> {
        let client = ctx.client();
        let vm_identifier: Vec<u16> = client.vm_identifier().encode_utf16().collect();
        let process_name: Vec<u16> = client.process_name().encode_utf16().collect();

        let mut w = JdwpWriter::new();
        w.write_u32(DDM_PROTOCOL_VERSION);
        w.write_i32(client.pid());
        w.write_u32(vm_identifier.len() as u32);
        w.write_u32(process_name.len() as u32);
        w.write_utf16_units(&vm_identifier);
        w.write_utf16_units(&process_name);
        w.write_i32(client.user_id());
        w.write_utf16_string(client.architecture());
        w.write_utf16_string(client.jvm_flags());
        w.write_bool(client.is_native_debuggable());
        w.write_utf16_string(client.package_name());
        ctx.reply_chunk(packet, DdmsChunk::new(ChunkType::HELO, w.into_vec()))
            .await?;

        if client.is_waiting_for_debugger() {
            let mut w = JdwpWriter::new();
            w.write_u8(0);
            ctx.send_chunk(DdmsChunk::new(ChunkType::WAIT, w.into_vec()))
                .await?;
        }
        Ok(HandlerResult::Continue)
    }
}

struct FeatHandler;

#[async_trait]
impl DdmsChunkHandler for FeatHandler {
    async fn handle(
        &self,
        ctx: &SessionContext,
        packet: &JdwpPacket,
        _chunk: DdmsChunk,
    ) -> Result<HandlerResult> {
        let features = ctx.client().features();
        let mut w = JdwpWriter::new();
        w.write_u32(features.len() as u32);
        for feature in features {
            w.write_utf16_string(feature);
        }
        ctx.reply_chunk(packet, DdmsChunk::new(ChunkType::FEAT, w.into_vec()))
            .await?;
        Ok(HandlerResult::Continue)
    }
}

/// Replies with a single zero status byte: profiling idle, allocation tracking off.
struct StatusHandler(ChunkType);

#[async_trait]
impl DdmsChunkHandler for StatusHandler {
    async fn handle(
        &self,
        ctx: &SessionContext,
        packet: &JdwpPacket,
        _chunk: DdmsChunk,
    ) -> Result<HandlerResult> {
        ctx.reply_chunk(packet, DdmsChunk::new(self.0, vec![0u8]))
            .await?;
        Ok(HandlerResult::Continue)
    }
}

/// The debugger asked the process to exit.
struct ExitHandler;

#[async_trait]
impl DdmsChunkHandler for ExitHandler {
    async fn handle(
        &self,
        ctx: &SessionContext,
        _packet: &JdwpPacket,
        _chunk: DdmsChunk,
    ) -> Result<HandlerResult> {
        ctx.device().stop_client(ctx.client().pid());
        Ok(HandlerResult::Stop)
    }
}

struct VersionHandler;

#[async_trait]
impl JdwpCommandHandler for VersionHandler {
    async fn handle(&self, ctx: &SessionContext, packet: &JdwpPacket) -> Result<HandlerResult> {
        let mut w = JdwpWriter::new();
        w.write_string("Android Runtime 2.1.0");
        w.write_i32(1);
        w.write_i32(6);
        w.write_string("1.8.0");
        w.write_string(ctx.client().vm_identifier());
        ctx.reply(packet, 0, w.into_vec()).await?;
        Ok(HandlerResult::Continue)
    }
}

/// Every id is 8 bytes wide.
struct IdSizesHandler;

#[async_trait]
impl JdwpCommandHandler for IdSizesHandler {
    async fn handle(&self, ctx: &SessionContext, packet: &JdwpPacket) -> Result<HandlerResult> {
        let mut w = JdwpWriter::with_capacity(20);
        // field, method, object, reference type, frame
        for _ in 0..5 {
            w.write_u32(8);
        }
        ctx.reply(packet, 0, w.into_vec()).await?;
        Ok(HandlerResult::Continue)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{ClientSpec, DeviceState};
    use adbkit_jdwp::codec::JdwpReader;
    use adbkit_jdwp::{PacketChannel, PayloadProvider, WireConfig};
    use tokio::io::DuplexStream;
    use tokio_util::sync::CancellationToken;

    fn context(spec: ClientSpec) -> (SessionContext, PacketChannel<DuplexStream>) {
        let device = Arc::new(DeviceState::new("emulator-5554", 30, CancellationToken::new()));
        let client = device.start_client(spec);
        let (near, far) = tokio::io::duplex(64 * 1024);
        let ctx = SessionContext::new(device, client, Box::new(near), WireConfig::default());
        (ctx, PacketChannel::new(far))
    }

    async fn next_chunk(channel: &mut PacketChannel<DuplexStream>) -> (JdwpPacket, DdmsChunk) {
        let packet = channel.next_packet().await.unwrap().expect("packet");
        let packet = packet.to_offline().await.unwrap();
        let chunk = DdmsChunk::from_packet(&packet).await.unwrap();
        (packet, chunk)
    }

    fn helo_request() -> JdwpPacket {
        DdmsChunk::new(ChunkType::HELO, vec![0, 0, 0, 1])
            .into_command(3)
            .unwrap()
    }

    #[tokio::test]
    async fn helo_reply_describes_the_process() {
        let spec = ClientSpec::new(1234, "com.example:svc").package_name("com.example");
        let (ctx, mut channel) = context(spec);
        let table = HandlerTable::with_builtins();
        let request = helo_request();
        let chunk = DdmsChunk::from_packet(&request).await.unwrap();

        let result = table.dispatch_ddms(&ctx, &request, chunk).await.unwrap();
        assert_eq!(result, HandlerResult::Continue);

        let (reply, chunk) = next_chunk(&mut channel).await;
        assert!(reply.is_reply());
        assert_eq!(reply.id(), 3);
        assert_eq!(chunk.chunk_type, ChunkType::HELO);

        let mut r = JdwpReader::new(&chunk.data);
        assert_eq!(r.read_u32().unwrap(), DDM_PROTOCOL_VERSION);
        assert_eq!(r.read_i32().unwrap(), 1234);
        let vm_len = r.read_u32().unwrap() as usize;
        let name_len = r.read_u32().unwrap() as usize;
        assert_eq!(r.read_utf16_units(vm_len).unwrap(), "dalvikvm");
        assert_eq!(r.read_utf16_units(name_len).unwrap(), "com.example:svc");
        assert_eq!(r.read_i32().unwrap(), 0);
        assert_eq!(r.read_utf16_string().unwrap(), "x86_64");
        assert_eq!(r.read_utf16_string().unwrap(), "");
        assert!(!r.read_bool().unwrap());
        assert_eq!(r.read_utf16_string().unwrap(), "com.example");
        assert_eq!(r.remaining(), 0);
    }

    #[tokio::test]
    async fn helo_announces_wait_for_waiting_processes() {
        let (ctx, mut channel) = context(ClientSpec::new(1, "a").waiting_for_debugger(true));
        let table = HandlerTable::with_builtins();
        let request = helo_request();
        let chunk = DdmsChunk::from_packet(&request).await.unwrap();
        table.dispatch_ddms(&ctx, &request, chunk).await.unwrap();

        let (_, helo) = next_chunk(&mut channel).await;
        assert_eq!(helo.chunk_type, ChunkType::HELO);
        let (wait, chunk) = next_chunk(&mut channel).await;
        assert!(wait.is_ddms_command());
        assert_eq!(chunk.chunk_type, ChunkType::WAIT);
        assert_eq!(&chunk.data[..], &[0]);
    }

    #[tokio::test]
    async fn feat_lists_client_features() {
        let (ctx, mut channel) = context(ClientSpec::new(1, "a"));
        let table = HandlerTable::with_builtins();
        let request = DdmsChunk::new(ChunkType::FEAT, Vec::new())
            .into_command(9)
            .unwrap();
        let chunk = DdmsChunk::from_packet(&request).await.unwrap();
        table.dispatch_ddms(&ctx, &request, chunk).await.unwrap();

        let (_, chunk) = next_chunk(&mut channel).await;
        let mut r = JdwpReader::new(&chunk.data);
        let count = r.read_u32().unwrap() as usize;
        let features: Vec<String> = (0..count)
            .map(|_| r.read_utf16_string().unwrap())
            .collect();
        assert_eq!(features, ctx.client().features());
    }

    #[tokio::test]
    async fn id_sizes_are_all_eight() {
        let (ctx, mut channel) = context(ClientSpec::new(1, "a"));
        let table = HandlerTable::with_builtins();
        let request =
            JdwpPacket::command(11, CMD_SET_VM, CMD_VM_ID_SIZES, PayloadProvider::empty()).unwrap();
        table.dispatch_jdwp(&ctx, &request).await.unwrap();

        let reply = channel.next_packet().await.unwrap().expect("reply");
        assert_eq!(reply.error_code().unwrap(), 0);
        let payload = reply.payload().read_all().await.unwrap();
        let mut r = JdwpReader::new(&payload);
        for _ in 0..5 {
            assert_eq!(r.read_u32().unwrap(), 8);
        }
        assert_eq!(r.remaining(), 0);
    }

    #[tokio::test]
    async fn exit_stops_the_client_and_the_session() {
        let (ctx, _channel) = context(ClientSpec::new(77, "a"));
        let table = HandlerTable::with_builtins();
        let request = DdmsChunk::new(ChunkType::EXIT, 0u32.to_be_bytes().to_vec())
            .into_command(1)
            .unwrap();
        let chunk = DdmsChunk::from_packet(&request).await.unwrap();

        let result = table.dispatch_ddms(&ctx, &request, chunk).await.unwrap();
        assert_eq!(result, HandlerResult::Stop);
        assert!(ctx.device().client(77).is_none());
    }

    #[tokio::test]
    async fn unknown_packets_are_skipped() {
        let (ctx, _channel) = context(ClientSpec::new(1, "a"));
        let table = HandlerTable::new();
        let request = DdmsChunk::new(ChunkType::HPIF, Vec::new())
            .into_command(1)
            .unwrap();
        let chunk = DdmsChunk::from_packet(&request).await.unwrap();
        assert_eq!(
            table.dispatch_ddms(&ctx, &request, chunk).await.unwrap(),
            HandlerResult::Continue
        );

        let command = JdwpPacket::command(2, 11, 1, PayloadProvider::empty()).unwrap();
        assert_eq!(
            table.dispatch_jdwp(&ctx, &command).await.unwrap(),
            HandlerResult::Continue
        );
    }
}
