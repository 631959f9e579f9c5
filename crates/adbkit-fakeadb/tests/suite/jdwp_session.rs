use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use adbkit_fakeadb::{
    ClientSpec, DdmsChunkHandler, FakeAdbServer, FakeAdbServerConfig, HandlerResult, HandlerTable,
    SessionContext,
};
use adbkit_jdwp::codec::JdwpReader;
use adbkit_jdwp::constants::{CMD_SET_VM, CMD_VM_ID_SIZES, CMD_VM_VERSION};
use adbkit_jdwp::wire::write_packet;
use adbkit_jdwp::{ChunkType, DdmsChunk, JdwpPacket, PacketChannel, PayloadProvider, WireConfig};
use async_trait::async_trait;
use tokio::io::AsyncWriteExt;

use crate::harness::{
    open_jdwp, read_to_close, request, spawn_server, transport, within, Status,
};

async fn send(stream: &mut tokio::net::TcpStream, packet: &JdwpPacket) {
    write_packet(stream, packet, &WireConfig::default())
        .await
        .expect("write packet");
}

#[tokio::test]
async fn id_sizes_and_version_replies() {
    let server = spawn_server(Duration::from_secs(1)).await;
    server.connect_device_with_clients("emulator-5554", 30, [ClientSpec::new(1234, "com.example")]);

    let stream = open_jdwp(server.addr(), "emulator-5554", 1234).await;
    let (reader, mut writer) = stream.into_split();
    let mut channel = PacketChannel::new(reader);

    let request = JdwpPacket::command(1, CMD_SET_VM, CMD_VM_ID_SIZES, PayloadProvider::empty()).unwrap();
    write_packet(&mut writer, &request, &WireConfig::default()).await.unwrap();
    let reply = within(channel.next_packet()).await.unwrap().expect("IDSizes reply");
    assert_eq!(reply.id(), 1);
    assert_eq!(reply.error_code().unwrap(), 0);
    assert_eq!(reply.payload_len(), 20);
    reply.shutdown().await.unwrap();
    drop(reply);

    let request = JdwpPacket::command(2, CMD_SET_VM, CMD_VM_VERSION, PayloadProvider::empty()).unwrap();
    write_packet(&mut writer, &request, &WireConfig::default()).await.unwrap();
    let reply = within(channel.next_packet()).await.unwrap().expect("Version reply");
    let payload = reply.payload().read_all().await.unwrap();
    let mut r = JdwpReader::new(&payload);
    let _description = r.read_string().unwrap();
    assert_eq!(r.read_i32().unwrap(), 1);
    assert_eq!(r.read_i32().unwrap(), 6);
    let _vm_version = r.read_string().unwrap();
    assert_eq!(r.read_string().unwrap(), "dalvikvm");
}

#[tokio::test]
async fn helo_over_the_wire() {
    let server = spawn_server(Duration::from_secs(1)).await;
    let device = server.connect_device("emulator-5554", 30);
    let client = device.start_client(ClientSpec::new(77, "com.example.helo"));

    let mut stream = open_jdwp(server.addr(), "emulator-5554", 77).await;
    let helo = DdmsChunk::new(ChunkType::HELO, 1u32.to_be_bytes().to_vec())
        .into_command(42)
        .unwrap();
    send(&mut stream, &helo).await;

    let (reader, _writer) = stream.into_split();
    let mut channel = PacketChannel::new(reader);
    let reply = within(channel.next_packet()).await.unwrap().expect("HELO reply");
    assert!(reply.is_reply());
    assert_eq!(reply.id(), 42);
    let chunk = DdmsChunk::from_packet(&reply).await.unwrap();
    assert_eq!(chunk.chunk_type, ChunkType::HELO);
    let mut r = JdwpReader::new(&chunk.data);
    assert_eq!(r.read_u32().unwrap(), 1);
    assert_eq!(r.read_i32().unwrap(), 77);
    assert_eq!(client.ddms_chunks_received(), 1);
}

#[tokio::test]
async fn bad_handshake_closes_the_connection() {
    let server = spawn_server(Duration::from_secs(1)).await;
    server.connect_device_with_clients("emulator-5554", 30, [ClientSpec::new(5, "a")]);

    let mut stream = transport(server.addr(), "emulator-5554").await;
    assert_eq!(request(&mut stream, "jdwp:5").await, Status::Okay);
    stream.write_all(b"JDWP-Handshak!").await.unwrap();
    assert!(read_to_close(&mut stream).await.is_empty());
}

#[tokio::test]
async fn unknown_pid_fails() {
    let server = spawn_server(Duration::from_secs(1)).await;
    server.connect_device("emulator-5554", 30);

    let mut stream = transport(server.addr(), "emulator-5554").await;
    assert_eq!(
        request(&mut stream, "jdwp:999").await,
        Status::Fail("No client exists for pid: 999".to_string())
    );
}

#[tokio::test]
async fn old_devices_reject_a_second_session() {
    let server = spawn_server(Duration::from_secs(1)).await;
    server.connect_device_with_clients("old-device", 27, [ClientSpec::new(10, "a")]);

    let _first = open_jdwp(server.addr(), "old-device", 10).await;
    let mut second = transport(server.addr(), "old-device").await;
    assert_eq!(
        request(&mut second, "jdwp:10").await,
        Status::Fail("JDWP Session already opened for pid: 10".to_string())
    );
}

#[tokio::test]
async fn recent_devices_queue_the_second_session() {
    let server = spawn_server(Duration::from_secs(5)).await;
    let device = server.connect_device_with_clients("new-device", 30, [ClientSpec::new(10, "a")]);

    let first = open_jdwp(server.addr(), "new-device", 10).await;
    let addr = server.addr();
    let second = tokio::spawn(async move { open_jdwp(addr, "new-device", 10).await });

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(!second.is_finished(), "second session must wait for the first");
    drop(first);

    let _second = within(second).await.unwrap();
    assert!(device.client(10).unwrap().has_jdwp_session());
}

#[tokio::test]
async fn queued_session_times_out() {
    let server = spawn_server(Duration::from_millis(100)).await;
    server.connect_device_with_clients("new-device", 30, [ClientSpec::new(10, "a")]);

    let _first = open_jdwp(server.addr(), "new-device", 10).await;
    let mut second = transport(server.addr(), "new-device").await;
    assert_eq!(
        request(&mut second, "jdwp:10").await,
        Status::Fail("JDWP Session already opened for pid: 10".to_string())
    );
}

#[tokio::test]
async fn stopping_the_client_ends_the_session() {
    let server = spawn_server(Duration::from_secs(1)).await;
    let device = server.connect_device_with_clients("emulator-5554", 30, [ClientSpec::new(3, "a")]);

    let mut stream = open_jdwp(server.addr(), "emulator-5554", 3).await;
    device.stop_client(3);
    assert!(read_to_close(&mut stream).await.is_empty());
}

struct CountingHandler(Arc<AtomicUsize>);

#[async_trait]
impl DdmsChunkHandler for CountingHandler {
    async fn handle(
        &self,
        ctx: &SessionContext,
        packet: &JdwpPacket,
        chunk: DdmsChunk,
    ) -> adbkit_fakeadb::Result<HandlerResult> {
        self.0.fetch_add(1, Ordering::SeqCst);
        ctx.reply_chunk(packet, DdmsChunk::new(chunk.chunk_type, chunk.data))
            .await?;
        Ok(HandlerResult::Continue)
    }
}

#[tokio::test]
async fn registered_handlers_take_over_chunks() {
    let hits = Arc::new(AtomicUsize::new(0));
    let mut handlers = HandlerTable::with_builtins();
    handlers.register_ddms(ChunkType::HPIF, Arc::new(CountingHandler(Arc::clone(&hits))));
    let server = FakeAdbServer::spawn_with_handlers(FakeAdbServerConfig::default(), handlers)
        .await
        .unwrap();
    server.connect_device_with_clients("emulator-5554", 30, [ClientSpec::new(8, "a")]);

    let stream = open_jdwp(server.addr(), "emulator-5554", 8).await;
    let (reader, mut writer) = stream.into_split();
    let mut channel = PacketChannel::new(reader);

    // An unhandled chunk first: skipped without a reply.
    let ignored = DdmsChunk::new(ChunkType::MPSS, vec![9; 100]).into_command(1).unwrap();
    write_packet(&mut writer, &ignored, &WireConfig::default()).await.unwrap();
    let echoed = DdmsChunk::new(ChunkType::HPIF, b"ping".to_vec()).into_command(2).unwrap();
    write_packet(&mut writer, &echoed, &WireConfig::default()).await.unwrap();

    let reply = within(channel.next_packet()).await.unwrap().expect("echo");
    assert_eq!(reply.id(), 2);
    let chunk = DdmsChunk::from_packet(&reply).await.unwrap();
    assert_eq!(&chunk.data[..], b"ping");
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}
