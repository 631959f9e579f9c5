use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::properties::{ProcessList, ProcessProperties, ProcessUpdate};
use crate::server::{ClientLease, ProcessInventoryServer};
use crate::InventoryError;

/// One online period of a device.
///
/// Cancelling the scope (see [`ConnectedDevice::disconnect`]) cancels everything that runs
/// against the device through a [`ProcessInventoryClient`]. Two handles are the same
/// connection only if one was cloned from the other.
#[derive(Clone)]
pub struct ConnectedDevice {
    inner: Arc<DeviceInner>,
}

struct DeviceInner {
    serial: String,
    scope: CancellationToken,
}

impl ConnectedDevice {
    pub fn new(serial: impl Into<String>) -> Self {
        Self::with_scope(serial, CancellationToken::new())
    }

    pub fn with_scope(serial: impl Into<String>, scope: CancellationToken) -> Self {
        Self {
            inner: Arc::new(DeviceInner {
                serial: serial.into(),
                scope,
            }),
        }
    }

    pub fn serial(&self) -> &str {
        &self.inner.serial
    }

    pub fn scope(&self) -> &CancellationToken {
        &self.inner.scope
    }

    pub fn is_online(&self) -> bool {
        !self.inner.scope.is_cancelled()
    }

    pub fn disconnect(&self) {
        self.inner.scope.cancel();
    }

    pub fn is_same_connection(&self, other: &ConnectedDevice) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn cancelled_error(&self) -> InventoryError {
        InventoryError::Cancelled(format!("device {} is disconnected", self.serial()))
    }
}

impl fmt::Debug for ConnectedDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectedDevice")
            .field("serial", &self.serial())
            .field("online", &self.is_online())
            .finish()
    }
}

/// A client of the shared inventory, e.g. one debugger front end.
pub struct ProcessInventoryClient {
    server: Arc<ProcessInventoryServer>,
    description: Arc<str>,
    connections: Mutex<HashMap<String, DeviceConnection>>,
    closed: AtomicBool,
}

impl ProcessInventoryClient {
    pub fn new(server: Arc<ProcessInventoryServer>, description: impl Into<String>) -> Self {
        Self {
            server,
            description: Arc::from(description.into()),
            connections: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        }
    }

    pub fn description(&self) -> &str {
        &self.description
    }

    /// Runs `block` against this client's connection to `device`.
    ///
    /// The block is abandoned with [`InventoryError::Cancelled`] as soon as the device is
    /// disconnected. Whatever the block itself returns, including its own errors, is
    /// handed back unchanged.
    pub async fn with_connection_for_device<F, Fut, T, E>(
        &self,
        device: &ConnectedDevice,
        block: F,
    ) -> Result<T, E>
    where
        F: FnOnce(DeviceConnection) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<InventoryError>,
    {
        let connection = self.connection_for_device(device)?;
        let scope = device.scope().clone();
        tokio::select! {
            biased;
            _ = scope.cancelled() => {
                self.forget(device);
                Err(device.cancelled_error().into())
            }
            result = block(connection) => result,
        }
    }

    /// Drops every cached device connection and refuses new ones.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.connections.lock().clear();
    }

    fn connection_for_device(
        &self,
        device: &ConnectedDevice,
    ) -> Result<DeviceConnection, InventoryError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(InventoryError::Closed(self.description.to_string()));
        }
        if !device.is_online() {
            return Err(device.cancelled_error());
        }

        let mut connections = self.connections.lock();
        if let Some(existing) = connections.get(device.serial()) {
            if existing.device().is_same_connection(device) {
                return Ok(existing.clone());
            }
        }

        tracing::debug!(
            target: "adbkit.inventory",
            client = %self.description,
            serial = device.serial(),
            "connecting to device inventory"
        );
        let connection = DeviceConnection {
            inner: Arc::new(ConnectionInner {
                lease: self.server.lease(device),
                device: device.clone(),
                client_description: Arc::clone(&self.description),
            }),
        };
        connections.insert(device.serial().to_owned(), connection.clone());
        Ok(connection)
    }

    fn forget(&self, device: &ConnectedDevice) {
        let mut connections = self.connections.lock();
        if connections
            .get(device.serial())
            .is_some_and(|existing| existing.device().is_same_connection(device))
        {
            connections.remove(device.serial());
        }
    }
}

impl fmt::Debug for ProcessInventoryClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessInventoryClient")
            .field("description", &self.description)
            .finish_non_exhaustive()
    }
}

/// A client's handle on one device inventory.
#[derive(Clone)]
pub struct DeviceConnection {
    inner: Arc<ConnectionInner>,
}

struct ConnectionInner {
    lease: ClientLease,
    device: ConnectedDevice,
    client_description: Arc<str>,
}

impl DeviceConnection {
    pub fn device(&self) -> &ConnectedDevice {
        &self.inner.device
    }

    /// Stream of full process-list snapshots, starting with the current one.
    pub fn process_list(&self) -> ProcessListStream {
        ProcessListStream {
            rx: self.inner.lease.inventory.subscribe(),
            scope: self.inner.device.scope().clone(),
            serial: self.inner.device.serial().to_owned(),
            started: false,
        }
    }

    pub fn current_processes(&self) -> ProcessList {
        self.inner.lease.inventory.current()
    }

    /// Publishes what this client knows about a process.
    pub fn send_process_properties(
        &self,
        properties: &ProcessProperties,
    ) -> Result<(), InventoryError> {
        tracing::debug!(
            target: "adbkit.inventory",
            client = %self.inner.client_description,
            serial = self.inner.device.serial(),
            pid = properties.pid,
            "sending process properties"
        );
        self.send_updates(properties.to_updates())
    }

    pub fn notify_process_exit(&self, pid: i32) -> Result<(), InventoryError> {
        tracing::debug!(
            target: "adbkit.inventory",
            client = %self.inner.client_description,
            serial = self.inner.device.serial(),
            pid,
            "sending process exit"
        );
        self.send_updates([ProcessUpdate::Terminated(pid)])
    }

    /// Applies raw updates in order.
    pub fn send_updates(
        &self,
        updates: impl IntoIterator<Item = ProcessUpdate>,
    ) -> Result<(), InventoryError> {
        if !self.inner.device.is_online() {
            return Err(self.inner.device.cancelled_error());
        }
        self.inner.lease.inventory.apply(updates);
        Ok(())
    }
}

impl fmt::Debug for DeviceConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceConnection")
            .field("client", &self.inner.client_description)
            .field("device", &self.inner.device)
            .finish()
    }
}

/// Consumer side of a device inventory.
///
/// Intermediate snapshots may be skipped when the consumer is slower than the producers;
/// the latest snapshot is never lost.
pub struct ProcessListStream {
    rx: watch::Receiver<ProcessList>,
    scope: CancellationToken,
    serial: String,
    started: bool,
}

impl ProcessListStream {
    /// Latest snapshot, without waiting.
    pub fn current(&self) -> ProcessList {
        self.rx.borrow().clone()
    }

    /// Returns the current snapshot on the first call, then waits for the next change.
    ///
    /// Fails with [`InventoryError::Cancelled`] once the device is disconnected, including
    /// while waiting.
    pub async fn next(&mut self) -> Result<ProcessList, InventoryError> {
        if self.scope.is_cancelled() {
            return Err(self.cancelled());
        }
        if !self.started {
            self.started = true;
            return Ok(self.rx.borrow_and_update().clone());
        }
        tokio::select! {
            biased;
            _ = self.scope.cancelled() => Err(self.cancelled()),
            changed = self.rx.changed() => match changed {
                Ok(()) => Ok(self.rx.borrow_and_update().clone()),
                Err(_) => Err(self.cancelled()),
            },
        }
    }

    /// Waits until a snapshot satisfies `predicate` and returns it.
    pub async fn wait_for<P>(&mut self, mut predicate: P) -> Result<ProcessList, InventoryError>
    where
        P: FnMut(&[ProcessProperties]) -> bool,
    {
        loop {
            let list = self.next().await?;
            if predicate(&list) {
                return Ok(list);
            }
        }
    }

    fn cancelled(&self) -> InventoryError {
        InventoryError::Cancelled(format!("device {} is disconnected", self.serial))
    }
}
