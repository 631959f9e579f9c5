//! Client side of the service protocol, for driving a `FakeAdbServer` over TCP.

use std::future::Future;
use std::net::SocketAddr;
use std::time::Duration;

use adbkit_fakeadb::{FakeAdbServer, FakeAdbServerConfig, SessionPolicy};
use adbkit_jdwp::HANDSHAKE;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

pub const TIMEOUT: Duration = Duration::from_secs(10);

/// Server whose session handoff polls quickly and gives up after `handoff_timeout`.
pub async fn spawn_server(handoff_timeout: Duration) -> FakeAdbServer {
    let config = FakeAdbServerConfig {
        session: SessionPolicy {
            handoff_poll: Duration::from_millis(10),
            handoff_timeout,
            ..SessionPolicy::default()
        },
        ..FakeAdbServerConfig::default()
    };
    FakeAdbServer::spawn_with_config(config)
        .await
        .expect("spawn fake adb server")
}

pub async fn within<F: Future>(future: F) -> F::Output {
    tokio::time::timeout(TIMEOUT, future)
        .await
        .expect("operation timed out")
}

#[derive(Debug, PartialEq, Eq)]
pub enum Status {
    Okay,
    Fail(String),
}

pub async fn connect(addr: SocketAddr) -> TcpStream {
    TcpStream::connect(addr).await.expect("connect")
}

pub async fn send_request(stream: &mut TcpStream, request: &str) {
    let message = format!("{:04x}{request}", request.len());
    stream
        .write_all(message.as_bytes())
        .await
        .expect("write request");
}

pub async fn read_status(stream: &mut TcpStream) -> Status {
    let mut status = [0u8; 4];
    within(stream.read_exact(&mut status))
        .await
        .expect("read status");
    match &status {
        b"OKAY" => Status::Okay,
        b"FAIL" => Status::Fail(read_length_prefixed(stream).await),
        other => panic!("unexpected status {:?}", String::from_utf8_lossy(other)),
    }
}

pub async fn request(stream: &mut TcpStream, request: &str) -> Status {
    send_request(stream, request).await;
    read_status(stream).await
}

pub async fn read_length_prefixed(stream: &mut TcpStream) -> String {
    let mut prefix = [0u8; 4];
    within(stream.read_exact(&mut prefix))
        .await
        .expect("read length prefix");
    let len = usize::from_str_radix(std::str::from_utf8(&prefix).expect("ascii"), 16)
        .expect("hex length");
    let mut body = vec![0u8; len];
    within(stream.read_exact(&mut body))
        .await
        .expect("read body");
    String::from_utf8(body).expect("utf-8 body")
}

/// Selects `serial` on a fresh connection.
pub async fn transport(addr: SocketAddr, serial: &str) -> TcpStream {
    let mut stream = connect(addr).await;
    assert_eq!(
        request(&mut stream, &format!("host:transport:{serial}")).await,
        Status::Okay
    );
    stream
}

/// Opens `jdwp:<pid>` on `serial` and completes the handshake.
pub async fn open_jdwp(addr: SocketAddr, serial: &str, pid: i32) -> TcpStream {
    let mut stream = transport(addr, serial).await;
    assert_eq!(request(&mut stream, &format!("jdwp:{pid}")).await, Status::Okay);
    stream.write_all(HANDSHAKE).await.expect("write handshake");
    let mut echo = [0u8; 14];
    within(stream.read_exact(&mut echo))
        .await
        .expect("read handshake echo");
    assert_eq!(&echo, HANDSHAKE);
    stream
}

/// Reads until the peer closes and returns everything received.
pub async fn read_to_close(stream: &mut TcpStream) -> Vec<u8> {
    let mut rest = Vec::new();
    within(stream.read_to_end(&mut rest))
        .await
        .expect("read to close");
    rest
}
