//! DDMS chunks tunnelled through JDWP packets (`cmd_set = 0xC7`, `cmd = 1`).
//!
//! Each chunk is `type: [u8; 4]`, `length: u32`, followed by `length` bytes of data.

use std::fmt;

use bytes::Bytes;

use crate::codec::{JdwpReader, JdwpWriter};
use crate::constants::{CMD_DDMS_CHUNK, CMD_SET_DDMS};
use crate::packet::JdwpPacket;
use crate::payload::PayloadProvider;
use crate::{JdwpError, Result};

pub const DDMS_CHUNK_HEADER_LEN: usize = 8;

/// Four-character chunk tag.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChunkType([u8; 4]);

impl ChunkType {
    pub const HELO: Self = Self(*b"HELO");
    pub const FEAT: Self = Self(*b"FEAT");
    pub const APNM: Self = Self(*b"APNM");
    pub const WAIT: Self = Self(*b"WAIT");
    pub const REAQ: Self = Self(*b"REAQ");
    pub const MPRQ: Self = Self(*b"MPRQ");
    pub const MPSS: Self = Self(*b"MPSS");
    pub const MPSE: Self = Self(*b"MPSE");
    pub const HPIF: Self = Self(*b"HPIF");
    pub const EXIT: Self = Self(*b"EXIT");
    pub const FAIL: Self = Self(*b"FAIL");

    pub const fn new(tag: [u8; 4]) -> Self {
        Self(tag)
    }

    pub const fn from_u32(value: u32) -> Self {
        Self(value.to_be_bytes())
    }

    pub const fn as_u32(self) -> u32 {
        u32::from_be_bytes(self.0)
    }

    pub const fn as_bytes(&self) -> &[u8; 4] {
        &self.0
    }
}

impl fmt::Display for ChunkType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.iter().all(|b| b.is_ascii_graphic()) {
            self.0.iter().try_for_each(|b| write!(f, "{}", *b as char))
        } else {
            write!(f, "0x{:08x}", self.as_u32())
        }
    }
}

impl fmt::Debug for ChunkType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ChunkType({self})")
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DdmsChunk {
    pub chunk_type: ChunkType,
    pub data: Bytes,
}

impl DdmsChunk {
    pub fn new(chunk_type: ChunkType, data: impl Into<Bytes>) -> Self {
        Self {
            chunk_type,
            data: data.into(),
        }
    }

    /// A `FAIL` chunk: error code followed by a UTF-16 message.
    pub fn failure(code: u32, message: &str) -> Self {
        let mut w = JdwpWriter::new();
        w.write_u32(code);
        w.write_utf16_string(message);
        Self::new(ChunkType::FAIL, w.into_vec())
    }

    /// Parses the first chunk of a payload. Trailing bytes are ignored.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut r = JdwpReader::new(bytes);
        let chunk_type = ChunkType::from_u32(r.read_u32()?);
        let len = r.read_u32()? as usize;
        if len > r.remaining() {
            return Err(JdwpError::Protocol(format!(
                "DDMS chunk {chunk_type} declares {len} bytes, only {} available",
                r.remaining()
            )));
        }
        let data = Bytes::copy_from_slice(r.read_bytes(len)?);
        Ok(Self { chunk_type, data })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut w = JdwpWriter::with_capacity(DDMS_CHUNK_HEADER_LEN + self.data.len());
        w.write_u32(self.chunk_type.as_u32());
        w.write_u32(self.data.len() as u32);
        w.write_bytes(&self.data);
        w.into_vec()
    }

    /// Reads the chunk carried by a DDMS packet, consuming its payload.
    pub async fn from_packet(packet: &JdwpPacket) -> Result<Self> {
        if packet.is_command() && !packet.is_ddms_command() {
            return Err(JdwpError::IllegalArgument(format!(
                "{packet} does not carry a DDMS chunk"
            )));
        }
        let payload = packet.payload().read_all().await?;
        Self::decode(&payload)
    }

    pub fn into_command(self, id: i32) -> Result<JdwpPacket> {
        JdwpPacket::command(
            id,
            CMD_SET_DDMS,
            CMD_DDMS_CHUNK,
            PayloadProvider::from_bytes(self.encode()),
        )
    }

    pub fn into_reply(self, id: i32) -> Result<JdwpPacket> {
        JdwpPacket::reply(id, 0, PayloadProvider::from_bytes(self.encode()))
    }
}
