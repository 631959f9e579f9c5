use std::sync::Arc;
use std::time::Duration;

use adbkit_config::AdbkitConfig;
use adbkit_fakeadb::inventory_feed::{spawn_inventory_feed, InventoryPublisher};
use adbkit_fakeadb::ClientSpec;
use adbkit_inventory::{InventoryError, ProcessInventoryClient, ProcessInventoryServer};

use crate::harness::{spawn_server, within};

#[tokio::test]
async fn fake_devices_feed_the_shared_inventory() {
    let server = spawn_server(Duration::from_secs(1)).await;
    let device = server.connect_device_with_clients(
        "emulator-5554",
        30,
        [
            ClientSpec::new(1000, "com.example.app"),
            ClientSpec::new(1001, "com.example.app:remote")
                .package_name("com.example.app")
                .waiting_for_debugger(true),
        ],
    );

    let inventory = ProcessInventoryServer::new();
    let feeder = Arc::new(ProcessInventoryClient::new(Arc::clone(&inventory), "fake-adb"));
    let feed = spawn_inventory_feed(Arc::clone(&device), feeder);

    let ide = ProcessInventoryClient::new(Arc::clone(&inventory), "ide");
    let list = ide
        .with_connection_for_device(device.inventory_handle(), |connection| async move {
            connection
                .process_list()
                .wait_for(|list| list.len() == 2)
                .await
        })
        .await
        .unwrap();
    let remote = list.iter().find(|p| p.pid == 1001).expect("remote process");
    assert_eq!(remote.package_name.as_deref(), Some("com.example.app"));
    assert!(remote.is_waiting_for_debugger);
    assert_eq!(inventory.connected_clients("emulator-5554"), 2);

    // Disconnecting the device cancels both the feed and blocks still running against it.
    let blocked = {
        let handle = device.inventory_handle().clone();
        tokio::spawn(async move {
            ide.with_connection_for_device(&handle, |connection| async move {
                let mut stream = connection.process_list();
                loop {
                    if let Err(err) = stream.next().await {
                        return Err::<(), InventoryError>(err);
                    }
                }
            })
            .await
        })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(server.disconnect_device("emulator-5554"));

    assert!(within(feed).await.unwrap().unwrap_err().is_cancelled());
    assert!(within(blocked).await.unwrap().unwrap_err().is_cancelled());
    assert_eq!(inventory.device_count(), 0);
}

#[tokio::test]
async fn configured_devices_are_published_under_the_configured_client() {
    let config = AdbkitConfig::load_from_str(
        r#"
        [inventory]
        client_description = "studio"

        [[fake_adb.devices]]
        serial = "emulator-5554"
        processes = [
            { pid = 1234, process_name = "com.example" },
            { pid = 1300, process_name = "com.example:remote", package_name = "com.example", architecture = "arm64-v8a" },
        ]
        "#,
    )
    .unwrap();

    let server = spawn_server(Duration::from_secs(1)).await;
    let devices = server.connect_configured_devices(&config.fake_adb.devices);
    assert_eq!(devices.len(), 1);
    let device = &devices[0];
    assert_eq!(device.client_pids(), vec![1234, 1300]);

    let publisher = InventoryPublisher::new(&config.inventory);
    assert_eq!(publisher.client().description(), "studio");
    let feed = publisher.publish(Arc::clone(device));

    let observer = ProcessInventoryClient::new(Arc::clone(publisher.inventory()), "observer");
    let list = within(observer.with_connection_for_device(
        device.inventory_handle(),
        |connection| async move {
            connection
                .process_list()
                .wait_for(|list| list.len() == 2)
                .await
        },
    ))
    .await
    .unwrap();
    let remote = list.iter().find(|p| p.pid == 1300).expect("remote process");
    assert_eq!(remote.package_name.as_deref(), Some("com.example"));
    assert_eq!(remote.abi.as_deref(), Some("arm64-v8a"));
    assert_eq!(publisher.inventory().connected_clients("emulator-5554"), 2);

    assert!(server.disconnect_device("emulator-5554"));
    assert!(within(feed).await.unwrap().unwrap_err().is_cancelled());
}
