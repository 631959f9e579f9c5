//! Process inventory shared between debugger clients.
//!
//! Several clients (IDE windows, tools) may be attached to the same device at once and
//! each of them discovers a partial view of the device's debuggable processes. The
//! inventory merges those partial views per device and republishes the converged list
//! to every client:
//!
//! ```text
//! client A --send_process_properties--\                    /--> ProcessListStream (A)
//!                                      > DeviceInventory --+
//! client B --notify_process_exit------/   (one per serial)  \--> ProcessListStream (B)
//! ```
//!
//! A per-device inventory lives as long as at least one client holds a connection
//! to it and the device is online. Disconnecting the device cancels every block and
//! stream scoped to it.

mod connection;
mod properties;
mod server;

use thiserror::Error;

pub use connection::{ConnectedDevice, DeviceConnection, ProcessInventoryClient, ProcessListStream};
pub use properties::{
    DebuggerProxyInfo, ProcessInfo, ProcessList, ProcessProperties, ProcessUpdate, ProxyStatus,
    RemoteFailure,
};
pub use server::ProcessInventoryServer;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InventoryError {
    /// The scope the operation ran in was cancelled (typically the device went offline).
    #[error("cancelled: {0}")]
    Cancelled(String),
    /// The client was closed and no longer accepts operations.
    #[error("process inventory client {0} is closed")]
    Closed(String),
}

impl InventoryError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled(_))
    }
}
