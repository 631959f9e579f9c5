use std::collections::BTreeMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use adbkit_config::{AdbkitConfig, DeviceConfig};
use adbkit_jdwp::WireConfig;
use parking_lot::Mutex;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::device::{ClientSpec, DeviceState};
use crate::handlers::HandlerTable;
use crate::service::handle_connection;
use crate::session::SessionPolicy;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FakeAdbServerConfig {
    pub listen: SocketAddr,
    pub session: SessionPolicy,
    pub wire: WireConfig,
}

impl Default for FakeAdbServerConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from((Ipv4Addr::LOCALHOST, 0)),
            session: SessionPolicy::default(),
            wire: WireConfig::default(),
        }
    }
}

impl From<&AdbkitConfig> for FakeAdbServerConfig {
    fn from(config: &AdbkitConfig) -> Self {
        let fake_adb = &config.fake_adb;
        Self {
            listen: fake_adb.listen,
            session: SessionPolicy {
                exclusive_session_api_level: fake_adb.exclusive_session_api_level,
                handoff_poll: Duration::from_millis(fake_adb.session_handoff_poll_ms),
                handoff_timeout: Duration::from_millis(fake_adb.session_handoff_timeout_ms),
            },
            wire: WireConfig {
                inline_buffer_threshold: config.codec.inline_buffer_threshold,
            },
        }
    }
}

/// State shared by the accept loop and every connection task.
pub(crate) struct ServerShared {
    pub(crate) config: FakeAdbServerConfig,
    pub(crate) handlers: Arc<HandlerTable>,
    devices: Mutex<BTreeMap<String, Arc<DeviceState>>>,
}

impl ServerShared {
    pub(crate) fn device(&self, serial: &str) -> Option<Arc<DeviceState>> {
        self.devices.lock().get(serial).cloned()
    }
}

/// A fake ADB server listening on a local port.
///
/// Dropping the server stops it.
pub struct FakeAdbServer {
    addr: SocketAddr,
    shutdown: CancellationToken,
    shared: Arc<ServerShared>,
}

impl FakeAdbServer {
    pub async fn spawn() -> std::io::Result<Self> {
        Self::spawn_with_config(FakeAdbServerConfig::default()).await
    }

    pub async fn spawn_with_config(config: FakeAdbServerConfig) -> std::io::Result<Self> {
        Self::spawn_with_handlers(config, HandlerTable::with_builtins()).await
    }

    pub async fn spawn_with_handlers(
        config: FakeAdbServerConfig,
        handlers: HandlerTable,
    ) -> std::io::Result<Self> {
        let listener = TcpListener::bind(config.listen).await?;
        let addr = listener.local_addr()?;
        let shutdown = CancellationToken::new();
        let shared = Arc::new(ServerShared {
            config,
            handlers: Arc::new(handlers),
            devices: Mutex::new(BTreeMap::new()),
        });

        let task_shared = Arc::clone(&shared);
        let task_shutdown = shutdown.clone();
        tokio::spawn(async move {
            if let Err(err) = run(listener, task_shared, task_shutdown).await {
                tracing::warn!(target: "adbkit.fakeadb", error = %err, "accept loop failed");
            }
        });
        tracing::info!(target: "adbkit.fakeadb", %addr, "fake adb server listening");

        Ok(Self {
            addr,
            shutdown,
            shared,
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn config(&self) -> &FakeAdbServerConfig {
        &self.shared.config
    }

    /// Connects a device, or returns the one already connected under `serial`.
    pub fn connect_device(&self, serial: impl Into<String>, api_level: u32) -> Arc<DeviceState> {
        let serial = serial.into();
        let mut devices = self.shared.devices.lock();
        if let Some(device) = devices.get(&serial) {
            return Arc::clone(device);
        }
        let device = Arc::new(DeviceState::new(
            serial.clone(),
            api_level,
            self.shutdown.child_token(),
        ));
        devices.insert(serial.clone(), Arc::clone(&device));
        tracing::debug!(target: "adbkit.fakeadb", serial = %serial, api_level, "device connected");
        device
    }

    /// Connects a device and starts `clients` on it.
    pub fn connect_device_with_clients(
        &self,
        serial: impl Into<String>,
        api_level: u32,
        clients: impl IntoIterator<Item = ClientSpec>,
    ) -> Arc<DeviceState> {
        let device = self.connect_device(serial, api_level);
        for spec in clients {
            device.start_client(spec);
        }
        device
    }

    /// Connects every device declared in `[[fake_adb.devices]]` with its processes.
    pub fn connect_configured_devices(&self, devices: &[DeviceConfig]) -> Vec<Arc<DeviceState>> {
        devices
            .iter()
            .map(|device| {
                self.connect_device_with_clients(
                    device.serial.clone(),
                    device.api_level,
                    device.processes.iter().map(ClientSpec::from),
                )
            })
            .collect()
    }

    pub fn device(&self, serial: &str) -> Option<Arc<DeviceState>> {
        self.shared.device(serial)
    }

    pub fn devices(&self) -> Vec<Arc<DeviceState>> {
        self.shared.devices.lock().values().cloned().collect()
    }

    /// Takes the device offline and forgets it. Returns `false` for an unknown serial.
    pub fn disconnect_device(&self, serial: &str) -> bool {
        let Some(device) = self.shared.devices.lock().remove(serial) else {
            return false;
        };
        device.disconnect();
        true
    }

    /// Stops accepting connections and disconnects every device. Idempotent.
    pub fn stop(&self) {
        if self.shutdown.is_cancelled() {
            return;
        }
        self.shutdown.cancel();
        let devices: Vec<_> = std::mem::take(&mut *self.shared.devices.lock())
            .into_values()
            .collect();
        for device in devices {
            device.disconnect();
        }
        tracing::info!(target: "adbkit.fakeadb", addr = %self.addr, "fake adb server stopped");
    }

    pub fn is_stopped(&self) -> bool {
        self.shutdown.is_cancelled()
    }
}

impl Drop for FakeAdbServer {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn run(
    listener: TcpListener,
    shared: Arc<ServerShared>,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    loop {
        let (socket, peer) = tokio::select! {
            _ = shutdown.cancelled() => return Ok(()),
            accept = listener.accept() => accept?,
        };
        tracing::trace!(target: "adbkit.fakeadb", %peer, "accepted connection");
        let shared = Arc::clone(&shared);
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = shutdown.cancelled() => {}
                result = handle_connection(socket, shared) => {
                    if let Err(err) = result {
                        tracing::debug!(target: "adbkit.fakeadb", %peer, error = %err, "connection ended with error");
                    }
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn connect_device_is_idempotent_per_serial() {
        let server = FakeAdbServer::spawn().await.unwrap();
        let a = server.connect_device("emulator-5554", 30);
        let b = server.connect_device("emulator-5554", 21);
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(b.api_level(), 30);
        assert_eq!(server.devices().len(), 1);
    }

    #[tokio::test]
    async fn disconnect_takes_the_device_offline() {
        let server = FakeAdbServer::spawn().await.unwrap();
        let device = server.connect_device("emulator-5554", 30);
        assert!(server.disconnect_device("emulator-5554"));
        assert!(!server.disconnect_device("emulator-5554"));
        assert!(!device.is_online());
        assert!(device.scope().is_cancelled());
        assert!(server.device("emulator-5554").is_none());
    }

    #[tokio::test]
    async fn stop_disconnects_every_device() {
        let server = FakeAdbServer::spawn().await.unwrap();
        let a = server.connect_device("a", 30);
        let b = server.connect_device("b", 27);
        server.stop();
        server.stop();
        assert!(server.is_stopped());
        assert!(!a.is_online());
        assert!(!b.is_online());
        assert!(server.devices().is_empty());
    }

    #[test]
    fn config_conversion_uses_every_section() {
        let mut config = AdbkitConfig::default();
        config.fake_adb.exclusive_session_api_level = 31;
        config.fake_adb.session_handoff_poll_ms = 5;
        config.codec.inline_buffer_threshold = 64;

        let server_config = FakeAdbServerConfig::from(&config);
        assert_eq!(server_config.session.exclusive_session_api_level, 31);
        assert_eq!(server_config.session.handoff_poll, Duration::from_millis(5));
        assert_eq!(server_config.wire.inline_buffer_threshold, 64);
        assert_eq!(server_config.listen, config.fake_adb.listen);
    }
}
