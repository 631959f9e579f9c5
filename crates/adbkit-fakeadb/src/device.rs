//! Emulated device and process state.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use adbkit_config::ProcessConfig;
use adbkit_inventory::{ConnectedDevice, ProcessProperties};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::hub::{ChangeHandlerFactory, ChangeHub, ChangeQueue};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceStatus {
    Online,
    Offline,
}

/// Parameters of a process started on a fake device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientSpec {
    pub pid: i32,
    pub uid: i32,
    pub user_id: i32,
    pub process_name: String,
    pub package_name: String,
    pub architecture: String,
    pub vm_identifier: String,
    pub jvm_flags: String,
    pub native_debuggable: bool,
    pub waiting_for_debugger: bool,
    pub features: Vec<String>,
}

impl ClientSpec {
    pub fn new(pid: i32, process_name: impl Into<String>) -> Self {
        let process_name = process_name.into();
        Self {
            pid,
            uid: 10_000 + pid,
            user_id: 0,
            package_name: process_name.clone(),
            process_name,
            architecture: "x86_64".to_string(),
            vm_identifier: "dalvikvm".to_string(),
            jvm_flags: String::new(),
            native_debuggable: false,
            waiting_for_debugger: false,
            features: vec![
                "method-trace-profiling".to_string(),
                "method-trace-profiling-streaming".to_string(),
                "opengl-tracing".to_string(),
                "view-hierarchy".to_string(),
            ],
        }
    }

    pub fn package_name(mut self, package_name: impl Into<String>) -> Self {
        self.package_name = package_name.into();
        self
    }

    pub fn waiting_for_debugger(mut self, waiting: bool) -> Self {
        self.waiting_for_debugger = waiting;
        self
    }
}

impl From<&ProcessConfig> for ClientSpec {
    fn from(process: &ProcessConfig) -> Self {
        let mut spec = ClientSpec::new(process.pid, process.process_name.clone())
            .waiting_for_debugger(process.waiting_for_debugger);
        if let Some(package_name) = &process.package_name {
            spec = spec.package_name(package_name.clone());
        }
        if let Some(architecture) = &process.architecture {
            spec.architecture = architecture.clone();
        }
        spec
    }
}

/// One debuggable process running on a fake device.
pub struct ClientState {
    spec: ClientSpec,
    waiting: AtomicBool,
    session: Mutex<Option<SessionClaim>>,
    next_claim: AtomicU64,
    packets_received: AtomicU64,
    ddms_chunks_received: AtomicU64,
}

#[derive(Debug)]
struct SessionClaim {
    id: u64,
    handle: CancellationToken,
}

impl ClientState {
    fn new(spec: ClientSpec) -> Self {
        Self {
            waiting: AtomicBool::new(spec.waiting_for_debugger),
            spec,
            session: Mutex::new(None),
            next_claim: AtomicU64::new(1),
            packets_received: AtomicU64::new(0),
            ddms_chunks_received: AtomicU64::new(0),
        }
    }

    pub fn pid(&self) -> i32 {
        self.spec.pid
    }

    pub fn uid(&self) -> i32 {
        self.spec.uid
    }

    pub fn user_id(&self) -> i32 {
        self.spec.user_id
    }

    pub fn process_name(&self) -> &str {
        &self.spec.process_name
    }

    pub fn package_name(&self) -> &str {
        &self.spec.package_name
    }

    pub fn architecture(&self) -> &str {
        &self.spec.architecture
    }

    pub fn vm_identifier(&self) -> &str {
        &self.spec.vm_identifier
    }

    pub fn jvm_flags(&self) -> &str {
        &self.spec.jvm_flags
    }

    pub fn is_native_debuggable(&self) -> bool {
        self.spec.native_debuggable
    }

    pub fn features(&self) -> &[String] {
        &self.spec.features
    }

    pub fn is_waiting_for_debugger(&self) -> bool {
        self.waiting.load(Ordering::Acquire)
    }

    /// Claims the process' single JDWP session slot.
    ///
    /// Returns `false` when another session holds it. `handle` is cancelled if the process
    /// stops while the session is active.
    pub fn start_jdwp_session(&self, handle: CancellationToken) -> bool {
        self.claim_jdwp_session(handle).is_some()
    }

    /// Like `start_jdwp_session`, returning an id that only releases this claim.
    pub(crate) fn claim_jdwp_session(&self, handle: CancellationToken) -> Option<u64> {
        let mut session = self.session.lock();
        if session.is_some() {
            return None;
        }
        let id = self.next_claim.fetch_add(1, Ordering::Relaxed);
        *session = Some(SessionClaim { id, handle });
        Some(id)
    }

    /// Releases the session slot, whoever holds it.
    pub fn stop_jdwp_session(&self) {
        self.session.lock().take();
    }

    /// Releases the slot only if `id` still holds it.
    pub(crate) fn release_jdwp_session(&self, id: u64) {
        let mut session = self.session.lock();
        if session.as_ref().is_some_and(|claim| claim.id == id) {
            *session = None;
        }
    }

    pub fn has_jdwp_session(&self) -> bool {
        self.session.lock().is_some()
    }

    /// Cancels the active session, if any. The session releases its slot when it exits.
    pub fn cancel_jdwp_session(&self) {
        if let Some(claim) = self.session.lock().as_ref() {
            claim.handle.cancel();
        }
    }

    pub fn packets_received(&self) -> u64 {
        self.packets_received.load(Ordering::Relaxed)
    }

    pub fn ddms_chunks_received(&self) -> u64 {
        self.ddms_chunks_received.load(Ordering::Relaxed)
    }

    pub(crate) fn record_packet(&self, is_ddms: bool) {
        self.packets_received.fetch_add(1, Ordering::Relaxed);
        if is_ddms {
            self.ddms_chunks_received.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// The process as seen by a process inventory.
    pub fn to_process_properties(&self) -> ProcessProperties {
        let waiting = self.is_waiting_for_debugger();
        ProcessProperties {
            process_name: Some(self.spec.process_name.clone()),
            package_name: Some(self.spec.package_name.clone()),
            user_id: Some(self.spec.user_id),
            vm_identifier: Some(self.spec.vm_identifier.clone()),
            abi: Some(self.spec.architecture.clone()),
            jvm_flags: Some(self.spec.jvm_flags.clone()),
            is_native_debuggable: self.spec.native_debuggable,
            wait_command_received: waiting,
            is_waiting_for_debugger: waiting,
            features: self.spec.features.clone(),
            completed: true,
            ..ProcessProperties::new(self.spec.pid)
        }
    }
}

impl fmt::Debug for ClientState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientState")
            .field("pid", &self.spec.pid)
            .field("process_name", &self.spec.process_name)
            .field("waiting", &self.is_waiting_for_debugger())
            .field("has_jdwp_session", &self.has_jdwp_session())
            .finish()
    }
}

/// A fake device: its processes, logcat buffer and change notifications.
pub struct DeviceState {
    serial: String,
    api_level: u32,
    status: Mutex<DeviceStatus>,
    clients: Mutex<BTreeMap<i32, Arc<ClientState>>>,
    logcat: Mutex<Vec<String>>,
    hub: ChangeHub,
    handle: ConnectedDevice,
}

impl DeviceState {
    /// Creates an online device. Cancelling `scope` takes it offline for every observer.
    pub fn new(serial: impl Into<String>, api_level: u32, scope: CancellationToken) -> Self {
        let serial = serial.into();
        Self {
            handle: ConnectedDevice::with_scope(serial.clone(), scope),
            serial,
            api_level,
            status: Mutex::new(DeviceStatus::Online),
            clients: Mutex::new(BTreeMap::new()),
            logcat: Mutex::new(Vec::new()),
            hub: ChangeHub::new(),
        }
    }

    pub fn serial(&self) -> &str {
        &self.serial
    }

    pub fn api_level(&self) -> u32 {
        self.api_level
    }

    pub fn status(&self) -> DeviceStatus {
        *self.status.lock()
    }

    pub fn is_online(&self) -> bool {
        self.status() == DeviceStatus::Online
    }

    /// Cancelled when the device goes offline.
    pub fn scope(&self) -> &CancellationToken {
        self.handle.scope()
    }

    /// The device as a process inventory connection identity.
    pub fn inventory_handle(&self) -> &ConnectedDevice {
        &self.handle
    }

    pub fn hub(&self) -> &ChangeHub {
        &self.hub
    }

    pub fn subscribe(&self, factory: Arc<dyn ChangeHandlerFactory>) -> Option<ChangeQueue> {
        self.hub.subscribe(factory)
    }

    /// Starts a process, replacing any process with the same pid.
    pub fn start_client(&self, spec: ClientSpec) -> Arc<ClientState> {
        let client = Arc::new(ClientState::new(spec));
        let previous = self.clients.lock().insert(client.pid(), Arc::clone(&client));
        if let Some(previous) = previous {
            previous.cancel_jdwp_session();
        }
        tracing::debug!(
            target: "adbkit.fakeadb",
            serial = %self.serial,
            pid = client.pid(),
            process = client.process_name(),
            "client started"
        );
        self.publish_client_changes();
        client
    }

    /// Stops a process and ends its JDWP session.
    pub fn stop_client(&self, pid: i32) -> Option<Arc<ClientState>> {
        let client = self.clients.lock().remove(&pid)?;
        client.cancel_jdwp_session();
        tracing::debug!(target: "adbkit.fakeadb", serial = %self.serial, pid, "client stopped");
        self.publish_client_changes();
        Some(client)
    }

    pub fn client(&self, pid: i32) -> Option<Arc<ClientState>> {
        self.clients.lock().get(&pid).cloned()
    }

    /// Processes ordered by pid.
    pub fn clients(&self) -> Vec<Arc<ClientState>> {
        self.clients.lock().values().cloned().collect()
    }

    pub fn client_pids(&self) -> Vec<i32> {
        self.clients.lock().keys().copied().collect()
    }

    /// Updates the waiting-for-debugger flag. Returns `false` for an unknown pid.
    pub fn set_client_waiting(&self, pid: i32, waiting: bool) -> bool {
        let Some(client) = self.client(pid) else {
            return false;
        };
        if client.waiting.swap(waiting, Ordering::AcqRel) != waiting {
            self.publish_client_changes();
        }
        true
    }

    pub fn add_logcat_message(&self, message: impl Into<String>) {
        let message = message.into();
        let mut logcat = self.logcat.lock();
        self.hub.logcat_message_added(&message);
        logcat.push(message);
    }

    /// The buffered log plus a subscription that sees exactly the messages added after it.
    pub fn follow_logcat(
        &self,
        factory: Arc<dyn ChangeHandlerFactory>,
    ) -> (Vec<String>, Option<ChangeQueue>) {
        let logcat = self.logcat.lock();
        let queue = self.hub.subscribe(factory);
        (logcat.clone(), queue)
    }

    pub fn logcat_messages(&self) -> Vec<String> {
        self.logcat.lock().clone()
    }

    /// Takes the device offline: ends every session and subscription scoped to it.
    pub(crate) fn disconnect(&self) {
        {
            let mut status = self.status.lock();
            if *status == DeviceStatus::Offline {
                return;
            }
            *status = DeviceStatus::Offline;
        }
        for client in self.clients() {
            client.cancel_jdwp_session();
        }
        self.hub.stop();
        self.handle.disconnect();
        tracing::debug!(target: "adbkit.fakeadb", serial = %self.serial, "device disconnected");
    }

    fn publish_client_changes(&self) {
        self.hub.client_list_changed();
        self.hub.process_list_changed();
    }
}

impl fmt::Debug for DeviceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceState")
            .field("serial", &self.serial)
            .field("api_level", &self.api_level)
            .field("status", &self.status())
            .field("clients", &self.client_pids())
            .finish()
    }
}
