//! Publishes a fake device's processes to a process inventory.
//!
//! The feed runs as an inventory client block: it pushes every process currently on the
//! device, then republishes on each process list change and reports processes that went
//! away as exited. It ends with [`InventoryError::Cancelled`] when the device disconnects.

use std::collections::BTreeSet;
use std::sync::{Arc, Weak};

use adbkit_config::InventoryConfig;
use adbkit_inventory::{
    DeviceConnection, InventoryError, ProcessInventoryClient, ProcessInventoryServer,
};
use parking_lot::Mutex;
use tokio::task::JoinHandle;

use crate::device::DeviceState;
use crate::hub::{continue_handler, ChangeHandler, ChangeHandlerFactory, HandlerResult};

/// One inventory client, named by `[inventory] client_description`, feeding any number of
/// devices into a shared inventory.
pub struct InventoryPublisher {
    inventory: Arc<ProcessInventoryServer>,
    client: Arc<ProcessInventoryClient>,
}

impl InventoryPublisher {
    pub fn new(config: &InventoryConfig) -> Self {
        Self::with_inventory(ProcessInventoryServer::new(), config)
    }

    pub fn with_inventory(inventory: Arc<ProcessInventoryServer>, config: &InventoryConfig) -> Self {
        let client = Arc::new(ProcessInventoryClient::new(
            Arc::clone(&inventory),
            config.client_description.clone(),
        ));
        Self { inventory, client }
    }

    pub fn inventory(&self) -> &Arc<ProcessInventoryServer> {
        &self.inventory
    }

    pub fn client(&self) -> &Arc<ProcessInventoryClient> {
        &self.client
    }

    /// Starts feeding `device`. The feed ends with [`InventoryError::Cancelled`] once the
    /// device disconnects.
    pub fn publish(&self, device: Arc<DeviceState>) -> JoinHandle<Result<(), InventoryError>> {
        tracing::debug!(
            target: "adbkit.fakeadb",
            serial = %device.serial(),
            client = %self.client.description(),
            "publishing device processes"
        );
        spawn_inventory_feed(device, Arc::clone(&self.client))
    }
}

pub fn spawn_inventory_feed(
    device: Arc<DeviceState>,
    client: Arc<ProcessInventoryClient>,
) -> JoinHandle<Result<(), InventoryError>> {
    tokio::spawn(async move { run_inventory_feed(device, &client).await })
}

pub async fn run_inventory_feed(
    device: Arc<DeviceState>,
    client: &ProcessInventoryClient,
) -> Result<(), InventoryError> {
    let handle = device.inventory_handle().clone();
    client
        .with_connection_for_device(&handle, |connection| async move {
            let sync = Arc::new(ProcessSync {
                device: Arc::downgrade(&device),
                connection,
                known: Mutex::new(BTreeSet::new()),
            });
            // Subscribe first so no change slips between the initial push and the queue.
            let Some(queue) = device.subscribe(Arc::new(FeedFactory(Arc::clone(&sync)))) else {
                return Err(device.inventory_handle().cancelled_error());
            };
            drop(device);
            sync.sync()?;
            queue.run().await;
            // The queue only ends once the device went offline or a sync failed.
            Err(sync.connection.device().cancelled_error())
        })
        .await
}

struct ProcessSync {
    device: Weak<DeviceState>,
    connection: DeviceConnection,
    known: Mutex<BTreeSet<i32>>,
}

impl ProcessSync {
    fn sync(&self) -> Result<(), InventoryError> {
        let Some(device) = self.device.upgrade() else {
            return Err(self.connection.device().cancelled_error());
        };
        let clients = device.clients();
        drop(device);

        let mut known = self.known.lock();
        let current: BTreeSet<i32> = clients.iter().map(|client| client.pid()).collect();
        for client in &clients {
            self.connection
                .send_process_properties(&client.to_process_properties())?;
        }
        for pid in known.difference(&current) {
            self.connection.notify_process_exit(*pid)?;
        }
        *known = current;
        Ok(())
    }
}

struct FeedFactory(Arc<ProcessSync>);

impl ChangeHandlerFactory for FeedFactory {
    fn client_list_changed(&self) -> ChangeHandler {
        continue_handler()
    }

    fn process_list_changed(&self) -> ChangeHandler {
        let sync = Arc::clone(&self.0);
        Box::pin(async move {
            match sync.sync() {
                Ok(()) => HandlerResult::Continue,
                Err(err) => {
                    tracing::debug!(target: "adbkit.fakeadb", error = %err, "inventory feed stopped");
                    HandlerResult::Stop
                }
            }
        })
    }
}
