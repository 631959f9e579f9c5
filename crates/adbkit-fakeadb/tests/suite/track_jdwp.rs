use std::time::Duration;

use adbkit_fakeadb::ClientSpec;

use crate::harness::{read_length_prefixed, read_to_close, request, spawn_server, transport, Status};

#[tokio::test]
async fn track_jdwp_streams_pid_lists() {
    let server = spawn_server(Duration::from_secs(1)).await;
    let device = server.connect_device_with_clients("emulator-5554", 30, [ClientSpec::new(200, "b")]);

    let mut stream = transport(server.addr(), "emulator-5554").await;
    assert_eq!(request(&mut stream, "track-jdwp").await, Status::Okay);
    assert_eq!(read_length_prefixed(&mut stream).await, "200\n");

    device.start_client(ClientSpec::new(100, "a"));
    assert_eq!(read_length_prefixed(&mut stream).await, "100\n200\n");

    device.stop_client(200);
    assert_eq!(read_length_prefixed(&mut stream).await, "100\n");

    device.stop_client(100);
    assert_eq!(read_length_prefixed(&mut stream).await, "");
}

#[tokio::test]
async fn waiting_flag_changes_resend_the_list() {
    let server = spawn_server(Duration::from_secs(1)).await;
    let device = server.connect_device_with_clients("emulator-5554", 30, [ClientSpec::new(7, "a")]);

    let mut stream = transport(server.addr(), "emulator-5554").await;
    assert_eq!(request(&mut stream, "track-jdwp").await, Status::Okay);
    assert_eq!(read_length_prefixed(&mut stream).await, "7\n");

    assert!(device.set_client_waiting(7, true));
    assert_eq!(read_length_prefixed(&mut stream).await, "7\n");
}

#[tokio::test]
async fn track_jdwp_ends_when_the_device_disconnects() {
    let server = spawn_server(Duration::from_secs(1)).await;
    let device = server.connect_device("emulator-5554", 30);

    let mut stream = transport(server.addr(), "emulator-5554").await;
    assert_eq!(request(&mut stream, "track-jdwp").await, Status::Okay);
    assert_eq!(read_length_prefixed(&mut stream).await, "");

    assert!(server.disconnect_device("emulator-5554"));
    assert!(read_to_close(&mut stream).await.is_empty());
    assert_eq!(device.hub().subscriber_count(), 0);
}
