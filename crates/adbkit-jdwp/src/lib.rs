//! JDWP packet model for Android debugging over ADB.
//!
//! The crate covers the wire side of a debugger connection:
//!
//! - [`wire`]: the 11-byte header codec, the handshake, and [`wire::PacketChannel`]
//!   which decodes successive packets from a shared read half.
//! - [`payload`]: [`PayloadProvider`], which owns a packet body and arbitrates access
//!   to it (serialized readers, replay after a cancelled read, detaching to memory).
//! - [`packet`]: the immutable [`JdwpPacket`] view and the validating
//!   [`MutableJdwpPacket`] builder.
//! - [`ddms`]: the DDMS chunk envelope carried inside JDWP packets.
//!
//! Payload bytes are never stored inline in a packet; they are always reached through
//! a provider so that large bodies can stream straight off a socket.

pub mod codec;
pub mod constants;
pub mod ddms;
pub mod packet;
pub mod payload;
pub mod wire;

use std::io;

use thiserror::Error;

pub use ddms::{ChunkType, DdmsChunk};
pub use packet::{JdwpPacket, MutableJdwpPacket, PacketKind};
pub use payload::{PayloadProvider, PayloadReader, StreamPolicy};
pub use wire::{PacketChannel, WireConfig};

/// Size of the fixed JDWP header (length, id, flags, cmd_set/cmd or error_code).
pub const JDWP_HEADER_LEN: usize = 11;

/// Bit set in the header flags of reply packets.
pub const FLAG_REPLY: u8 = 0x80;

/// The ASCII handshake exchanged in both directions before any packet.
pub const HANDSHAKE: &[u8; 14] = b"JDWP-Handshake";

#[derive(Debug, Error)]
pub enum JdwpError {
    /// A header field was set to a value outside its wire range.
    #[error("illegal argument: {0}")]
    IllegalArgument(String),
    /// The packet was used in a way that does not match its variant.
    #[error("illegal state: {0}")]
    IllegalState(String),
    /// The payload cannot be acquired (closed provider or exhausted single-pass stream).
    #[error("payload unavailable: {0}")]
    PayloadUnavailable(String),
    /// The bytes produced for a payload did not match the declared packet length.
    #[error("payload framing mismatch: expected {expected} bytes, got {actual}")]
    FramingMismatch { expected: u64, actual: u64 },
    #[error("JDWP protocol error: {0}")]
    Protocol(String),
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl JdwpError {
    /// `true` for the errors that correspond to misuse of a packet or payload handle
    /// rather than a wire or I/O failure.
    pub fn is_illegal_state(&self) -> bool {
        matches!(self, Self::IllegalState(_) | Self::PayloadUnavailable(_))
    }
}

pub type Result<T, E = JdwpError> = std::result::Result<T, E>;
