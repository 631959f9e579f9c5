use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};

use crate::harness::{connect, request, spawn_server, transport, within, Status};

#[tokio::test]
async fn unknown_device_fails() {
    let server = spawn_server(Duration::from_secs(1)).await;
    let mut stream = connect(server.addr()).await;
    assert_eq!(
        request(&mut stream, "host:transport:nope").await,
        Status::Fail("device 'nope' not found".to_string())
    );
}

#[tokio::test]
async fn device_services_need_a_transport() {
    let server = spawn_server(Duration::from_secs(1)).await;
    server.connect_device("emulator-5554", 30);
    let mut stream = connect(server.addr()).await;
    assert_eq!(
        request(&mut stream, "track-jdwp").await,
        Status::Fail("no device selected".to_string())
    );
}

#[tokio::test]
async fn unsupported_services_fail() {
    let server = spawn_server(Duration::from_secs(1)).await;
    server.connect_device("emulator-5554", 30);
    let mut stream = transport(server.addr(), "emulator-5554").await;
    assert_eq!(
        request(&mut stream, "shell:getprop").await,
        Status::Fail("unsupported service 'shell:getprop'".to_string())
    );
}

#[tokio::test]
async fn disconnected_devices_are_unknown() {
    let server = spawn_server(Duration::from_secs(1)).await;
    server.connect_device("emulator-5554", 30);
    assert!(server.disconnect_device("emulator-5554"));

    let mut stream = connect(server.addr()).await;
    assert_eq!(
        request(&mut stream, "host:transport:emulator-5554").await,
        Status::Fail("device 'emulator-5554' not found".to_string())
    );
}

#[tokio::test]
async fn logcat_replays_then_follows() {
    let server = spawn_server(Duration::from_secs(1)).await;
    let device = server.connect_device("emulator-5554", 30);
    device.add_logcat_message("I/ActivityManager: Start proc 1234");

    let mut stream = transport(server.addr(), "emulator-5554").await;
    assert_eq!(request(&mut stream, "logcat").await, Status::Okay);
    let mut lines = BufReader::new(stream).lines();

    let first = within(lines.next_line()).await.unwrap();
    assert_eq!(first.as_deref(), Some("I/ActivityManager: Start proc 1234"));

    device.add_logcat_message("D/Example: hello");
    let second = within(lines.next_line()).await.unwrap();
    assert_eq!(second.as_deref(), Some("D/Example: hello"));

    server.disconnect_device("emulator-5554");
    assert_eq!(within(lines.next_line()).await.unwrap(), None);
}
