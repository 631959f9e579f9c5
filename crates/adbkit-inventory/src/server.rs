use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use indexmap::IndexMap;
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::connection::ConnectedDevice;
use crate::properties::{ProcessList, ProcessProperties, ProcessUpdate};

/// Registry of per-device inventories shared by every [`ProcessInventoryClient`].
///
/// The first client connecting to a device creates its inventory; later clients reuse
/// it. An inventory is removed once its last client lease is released or once its
/// device scope has been cancelled.
///
/// [`ProcessInventoryClient`]: crate::ProcessInventoryClient
#[derive(Debug, Default)]
pub struct ProcessInventoryServer {
    devices: Mutex<HashMap<String, Arc<DeviceInventory>>>,
}

impl ProcessInventoryServer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Number of devices with a live inventory.
    pub fn device_count(&self) -> usize {
        let mut devices = self.devices.lock();
        devices.retain(|_, inventory| !inventory.scope.is_cancelled());
        devices.len()
    }

    /// Number of clients currently holding a connection to `serial`'s inventory.
    pub fn connected_clients(&self, serial: &str) -> usize {
        self.devices
            .lock()
            .get(serial)
            .filter(|inventory| !inventory.scope.is_cancelled())
            .map_or(0, |inventory| inventory.clients.load(Ordering::Acquire))
    }

    pub(crate) fn lease(self: &Arc<Self>, device: &ConnectedDevice) -> ClientLease {
        let serial = device.serial();
        let inventory = {
            let mut devices = self.devices.lock();
            // A reconnected device is a new connection and gets a fresh inventory.
            let reusable = devices
                .get(serial)
                .filter(|existing| {
                    existing.device.is_same_connection(device) && !existing.scope.is_cancelled()
                })
                .cloned();
            let inventory = match reusable {
                Some(existing) => existing,
                None => {
                    tracing::debug!(target: "adbkit.inventory", serial, "creating device inventory");
                    let created = Arc::new(DeviceInventory::new(device));
                    devices.insert(serial.to_owned(), Arc::clone(&created));
                    created
                }
            };
            inventory.clients.fetch_add(1, Ordering::AcqRel);
            inventory
        };
        ClientLease {
            server: Arc::downgrade(self),
            inventory,
        }
    }

    fn release(&self, inventory: &Arc<DeviceInventory>) {
        let mut devices = self.devices.lock();
        if inventory.clients.fetch_sub(1, Ordering::AcqRel) != 1 {
            return;
        }
        if devices
            .get(&inventory.serial)
            .is_some_and(|current| Arc::ptr_eq(current, inventory))
        {
            tracing::debug!(
                target: "adbkit.inventory",
                serial = %inventory.serial,
                "last client disconnected; dropping device inventory"
            );
            devices.remove(&inventory.serial);
        }
    }
}

/// One client's share of a device inventory; released on drop.
#[derive(Debug)]
pub(crate) struct ClientLease {
    server: Weak<ProcessInventoryServer>,
    pub(crate) inventory: Arc<DeviceInventory>,
}

impl Drop for ClientLease {
    fn drop(&mut self) {
        match self.server.upgrade() {
            Some(server) => server.release(&self.inventory),
            None => {
                self.inventory.clients.fetch_sub(1, Ordering::AcqRel);
            }
        }
    }
}

#[derive(Debug)]
pub(crate) struct DeviceInventory {
    pub(crate) serial: String,
    device: ConnectedDevice,
    pub(crate) scope: CancellationToken,
    clients: AtomicUsize,
    processes: Mutex<IndexMap<i32, ProcessProperties>>,
    snapshot: watch::Sender<ProcessList>,
}

impl DeviceInventory {
    fn new(device: &ConnectedDevice) -> Self {
        let (snapshot, _) = watch::channel(ProcessList::default());
        Self {
            serial: device.serial().to_owned(),
            device: device.clone(),
            scope: device.scope().clone(),
            clients: AtomicUsize::new(0),
            processes: Mutex::new(IndexMap::new()),
            snapshot,
        }
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<ProcessList> {
        self.snapshot.subscribe()
    }

    pub(crate) fn current(&self) -> ProcessList {
        self.snapshot.borrow().clone()
    }

    /// Merges `updates` in order and publishes the resulting list.
    pub(crate) fn apply(&self, updates: impl IntoIterator<Item = ProcessUpdate>) {
        let mut processes = self.processes.lock();
        for update in updates {
            match update {
                ProcessUpdate::ProcessInfo(info) => {
                    tracing::trace!(target: "adbkit.inventory", serial = %self.serial, pid = info.pid, "process info update");
                    processes
                        .entry(info.pid)
                        .or_insert_with(|| ProcessProperties::new(info.pid))
                        .merge_process_info(&info);
                }
                ProcessUpdate::DebuggerProxy(info) => {
                    tracing::trace!(target: "adbkit.inventory", serial = %self.serial, pid = info.pid, "debugger proxy update");
                    processes
                        .entry(info.pid)
                        .or_insert_with(|| ProcessProperties::new(info.pid))
                        .merge_debugger_proxy(&info);
                }
                ProcessUpdate::Terminated(pid) => {
                    tracing::debug!(target: "adbkit.inventory", serial = %self.serial, pid, "process exited");
                    processes.shift_remove(&pid);
                }
            }
        }
        let list: Vec<ProcessProperties> = processes.values().cloned().collect();
        self.snapshot.send_replace(Arc::new(list));
    }
}
