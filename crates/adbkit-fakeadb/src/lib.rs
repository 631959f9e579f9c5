//! An in-process fake ADB server.
//!
//! The server emulates devices and their debuggable processes well enough for debugger
//! clients to be exercised end to end:
//!
//! - [`FakeAdbServer`] accepts loopback connections and routes the small set of services
//!   it understands (`host:transport:<serial>`, `jdwp:<pid>`, `track-jdwp`, `logcat`).
//! - [`DeviceState`] / [`ClientState`] hold the emulated device and process state and
//!   publish every change through a [`ChangeHub`].
//! - [`JdwpSession`] runs one JDWP connection: handshake, then a dispatch loop that
//!   routes DDMS chunks and JDWP commands through a [`HandlerTable`].
//! - [`inventory_feed`] mirrors a device's processes into a shared process inventory.

pub mod device;
pub mod handlers;
pub mod hub;
pub mod inventory_feed;
pub mod server;
mod service;
pub mod session;

use std::io;

use adbkit_jdwp::JdwpError;
use thiserror::Error;

pub use device::{ClientSpec, ClientState, DeviceState, DeviceStatus};
pub use handlers::{DdmsChunkHandler, HandlerTable, JdwpCommandHandler};
pub use hub::{ChangeHandler, ChangeHandlerFactory, ChangeHub, ChangeQueue, HandlerResult};
pub use server::{FakeAdbServer, FakeAdbServerConfig};
pub use session::{acquire_session, JdwpSession, SessionContext, SessionPolicy, SessionSlot, SessionState};

#[derive(Debug, Error)]
pub enum FakeAdbError {
    /// Another JDWP session already owns the process.
    #[error("JDWP Session already opened for pid: {pid}")]
    SessionConflict { pid: i32 },
    /// The peer did not open with the exact JDWP handshake.
    #[error("JDWP handshake rejected: {0}")]
    HandshakeRejected(String),
    #[error("device '{0}' not found")]
    UnknownDevice(String),
    #[error("No client exists for pid: {0}")]
    UnknownClient(i32),
    #[error("unsupported service '{0}'")]
    UnsupportedService(String),
    /// The device went offline while the operation waited.
    #[error("operation cancelled: {0}")]
    Cancelled(String),
    #[error(transparent)]
    Jdwp(#[from] JdwpError),
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type Result<T, E = FakeAdbError> = std::result::Result<T, E>;
