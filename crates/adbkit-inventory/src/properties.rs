use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

/// Snapshot of every known process of one device, in first-seen order.
pub type ProcessList = Arc<Vec<ProcessProperties>>;

/// Failure reported by the client that collected a process' properties.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteFailure {
    pub class_name: String,
    pub message: String,
}

impl fmt::Display for RemoteFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.class_name, self.message)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProxyStatus {
    /// Local address of the JDWP session proxy, when one is exposed.
    pub socket_address: Option<SocketAddr>,
    pub is_external_debugger_attached: bool,
}

/// Everything known about one process.
///
/// Fields start absent (or `false`) and are filled in as clients learn more.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessProperties {
    pub pid: i32,
    pub process_name: Option<String>,
    pub package_name: Option<String>,
    pub user_id: Option<i32>,
    pub vm_identifier: Option<String>,
    pub abi: Option<String>,
    pub jvm_flags: Option<String>,
    pub is_native_debuggable: bool,
    pub wait_command_received: bool,
    pub is_waiting_for_debugger: bool,
    pub proxy_status: ProxyStatus,
    pub features: Vec<String>,
    /// Property collection for this process has finished (successfully or not).
    pub completed: bool,
    pub exception: Option<RemoteFailure>,
}

impl ProcessProperties {
    pub fn new(pid: i32) -> Self {
        Self {
            pid,
            ..Self::default()
        }
    }

    /// Splits the record into the two partial updates exchanged between clients.
    pub fn to_updates(&self) -> [ProcessUpdate; 2] {
        [
            ProcessUpdate::ProcessInfo(ProcessInfo::from(self)),
            ProcessUpdate::DebuggerProxy(DebuggerProxyInfo::from(self)),
        ]
    }

    pub fn merge_process_info(&mut self, info: &ProcessInfo) {
        fn overlay<T: Clone>(slot: &mut Option<T>, value: &Option<T>) {
            if value.is_some() {
                slot.clone_from(value);
            }
        }

        overlay(&mut self.process_name, &info.process_name);
        overlay(&mut self.package_name, &info.package_name);
        overlay(&mut self.user_id, &info.user_id);
        overlay(&mut self.vm_identifier, &info.vm_identifier);
        overlay(&mut self.abi, &info.abi);
        overlay(&mut self.jvm_flags, &info.jvm_flags);
        overlay(&mut self.exception, &info.exception);
        self.is_native_debuggable |= info.native_debuggable.unwrap_or(false);
        self.wait_command_received |= info.wait_command_received.unwrap_or(false);
        self.completed |= info.completed;
        if let Some(features) = &info.features {
            self.features.clone_from(features);
        }
    }

    /// Applies a debugger proxy update. A missing address keeps the stored one.
    pub fn merge_debugger_proxy(&mut self, info: &DebuggerProxyInfo) {
        if let Some(waiting) = info.waiting_for_debugger {
            self.is_waiting_for_debugger = waiting;
        }
        if let Some(attached) = info.is_external_debugger_attached {
            self.proxy_status.is_external_debugger_attached = attached;
        }
        if let Some(address) = info.socket_address {
            self.proxy_status.socket_address = Some(address);
        }
    }
}

/// Partial process fields; `None` means "not known by the sender".
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessInfo {
    pub pid: i32,
    pub completed: bool,
    pub exception: Option<RemoteFailure>,
    pub process_name: Option<String>,
    pub package_name: Option<String>,
    pub user_id: Option<i32>,
    pub vm_identifier: Option<String>,
    pub abi: Option<String>,
    pub jvm_flags: Option<String>,
    pub native_debuggable: Option<bool>,
    pub wait_command_received: Option<bool>,
    pub features: Option<Vec<String>>,
}

impl From<&ProcessProperties> for ProcessInfo {
    fn from(source: &ProcessProperties) -> Self {
        Self {
            pid: source.pid,
            completed: source.completed,
            exception: source.exception.clone(),
            process_name: source.process_name.clone(),
            package_name: source.package_name.clone(),
            user_id: source.user_id,
            vm_identifier: source.vm_identifier.clone(),
            abi: source.abi.clone(),
            jvm_flags: source.jvm_flags.clone(),
            native_debuggable: Some(source.is_native_debuggable),
            wait_command_received: Some(source.wait_command_received),
            features: (!source.features.is_empty()).then(|| source.features.clone()),
        }
    }
}

/// Debugger-attachment half of a process update.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DebuggerProxyInfo {
    pub pid: i32,
    pub waiting_for_debugger: Option<bool>,
    pub is_external_debugger_attached: Option<bool>,
    pub socket_address: Option<SocketAddr>,
}

impl From<&ProcessProperties> for DebuggerProxyInfo {
    fn from(source: &ProcessProperties) -> Self {
        Self {
            pid: source.pid,
            waiting_for_debugger: Some(source.is_waiting_for_debugger),
            is_external_debugger_attached: Some(source.proxy_status.is_external_debugger_attached),
            // Other clients only need the proxy address to attach to a process parked in WAIT.
            socket_address: source
                .is_waiting_for_debugger
                .then_some(source.proxy_status.socket_address)
                .flatten(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessUpdate {
    ProcessInfo(ProcessInfo),
    DebuggerProxy(DebuggerProxyInfo),
    Terminated(i32),
}

impl ProcessUpdate {
    pub fn pid(&self) -> i32 {
        match self {
            Self::ProcessInfo(info) => info.pid,
            Self::DebuggerProxy(info) => info.pid,
            Self::Terminated(pid) => *pid,
        }
    }
}
