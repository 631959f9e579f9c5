use std::fmt;

use crate::constants::{command_set_name, error_code_name, CMD_DDMS_CHUNK, CMD_SET_DDMS};
use crate::payload::PayloadProvider;
use crate::{JdwpError, Result, FLAG_REPLY, JDWP_HEADER_LEN};

const MIN_LENGTH: u32 = JDWP_HEADER_LEN as u32;

/// The variant-specific part of a JDWP header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PacketKind {
    Command { cmd_set: u8, cmd: u8 },
    Reply { error_code: u16 },
}

/// An immutable JDWP packet: a validated header plus a payload provider.
///
/// Bytes 9 and 10 of the header are kept packed; whether they mean `cmd_set`/`cmd` or
/// `error_code` is decided by the reply bit of `flags`, and the accessors refuse to read
/// the wrong interpretation.
#[derive(Clone)]
pub struct JdwpPacket {
    length: u32,
    id: i32,
    flags: u8,
    fields: u16,
    payload: PayloadProvider,
}

fn payload_length(payload: &PayloadProvider) -> Result<u32> {
    payload
        .len()
        .checked_add(JDWP_HEADER_LEN as u64)
        .and_then(|len| u32::try_from(len).ok())
        .ok_or_else(|| {
            JdwpError::IllegalArgument(format!(
                "payload of {} bytes does not fit in a JDWP packet",
                payload.len()
            ))
        })
}

impl JdwpPacket {
    /// Builds a command whose length is derived from the payload size.
    pub fn command(id: i32, cmd_set: u8, cmd: u8, payload: PayloadProvider) -> Result<Self> {
        Ok(Self {
            length: payload_length(&payload)?,
            id,
            flags: 0,
            fields: u16::from_be_bytes([cmd_set, cmd]),
            payload,
        })
    }

    /// Builds a reply whose length is derived from the payload size.
    pub fn reply(id: i32, error_code: u16, payload: PayloadProvider) -> Result<Self> {
        Ok(Self {
            length: payload_length(&payload)?,
            id,
            flags: FLAG_REPLY,
            fields: error_code,
            payload,
        })
    }

    /// Builds a packet from raw header fields as they appear on the wire.
    ///
    /// The declared `length` is trusted as-is; a payload that produces a different
    /// number of bytes is only detected when the packet is encoded.
    pub fn from_header(
        length: u32,
        id: i32,
        flags: u8,
        fields: [u8; 2],
        payload: PayloadProvider,
    ) -> Result<Self> {
        if length < MIN_LENGTH {
            return Err(JdwpError::IllegalArgument(format!(
                "packet length {length} is smaller than the {JDWP_HEADER_LEN}-byte header"
            )));
        }
        Ok(Self {
            length,
            id,
            flags,
            fields: u16::from_be_bytes(fields),
            payload,
        })
    }

    pub fn length(&self) -> u32 {
        self.length
    }

    pub fn id(&self) -> i32 {
        self.id
    }

    pub fn flags(&self) -> u8 {
        self.flags
    }

    pub fn is_reply(&self) -> bool {
        self.flags & FLAG_REPLY != 0
    }

    pub fn is_command(&self) -> bool {
        !self.is_reply()
    }

    pub fn cmd_set(&self) -> Result<u8> {
        match self.kind() {
            PacketKind::Command { cmd_set, .. } => Ok(cmd_set),
            PacketKind::Reply { .. } => Err(not_a_command("cmd_set")),
        }
    }

    pub fn cmd(&self) -> Result<u8> {
        match self.kind() {
            PacketKind::Command { cmd, .. } => Ok(cmd),
            PacketKind::Reply { .. } => Err(not_a_command("cmd")),
        }
    }

    pub fn error_code(&self) -> Result<u16> {
        match self.kind() {
            PacketKind::Reply { error_code } => Ok(error_code),
            PacketKind::Command { .. } => Err(JdwpError::IllegalState(
                "error_code is only available on reply packets".to_owned(),
            )),
        }
    }

    pub fn kind(&self) -> PacketKind {
        if self.is_reply() {
            PacketKind::Reply {
                error_code: self.fields,
            }
        } else {
            let [cmd_set, cmd] = self.fields.to_be_bytes();
            PacketKind::Command { cmd_set, cmd }
        }
    }

    /// Bytes 9 and 10 of the header, whatever their interpretation.
    pub(crate) fn raw_fields(&self) -> [u8; 2] {
        self.fields.to_be_bytes()
    }

    pub fn header_bytes(&self) -> [u8; JDWP_HEADER_LEN] {
        let mut out = [0u8; JDWP_HEADER_LEN];
        out[0..4].copy_from_slice(&self.length.to_be_bytes());
        out[4..8].copy_from_slice(&self.id.to_be_bytes());
        out[8] = self.flags;
        out[9..11].copy_from_slice(&self.raw_fields());
        out
    }

    pub fn payload(&self) -> &PayloadProvider {
        &self.payload
    }

    /// Declared payload size (`length - 11`).
    pub fn payload_len(&self) -> u64 {
        u64::from(self.length) - JDWP_HEADER_LEN as u64
    }

    pub fn is_empty(&self) -> bool {
        self.length == MIN_LENGTH
    }

    /// `true` for commands carrying a DDMS chunk.
    pub fn is_ddms_command(&self) -> bool {
        self.kind()
            == PacketKind::Command {
                cmd_set: CMD_SET_DDMS,
                cmd: CMD_DDMS_CHUNK,
            }
    }

    /// `true` when both packets read their payload from the same provider instance.
    pub fn shares_payload_with(&self, other: &JdwpPacket) -> bool {
        self.payload.ptr_eq(&other.payload)
    }

    /// Detaches the payload from any live source.
    ///
    /// Packets whose payload is already in memory come back sharing the same provider.
    pub async fn to_offline(&self) -> Result<JdwpPacket> {
        let payload = self.payload.to_offline().await?;
        Ok(Self {
            payload,
            ..self.clone()
        })
    }

    /// Drains unread payload bytes and closes the payload. Idempotent.
    pub async fn shutdown(&self) -> Result<()> {
        self.payload.shutdown().await
    }
}

fn not_a_command(field: &str) -> JdwpError {
    JdwpError::IllegalState(format!("{field} is only available on command packets"))
}

impl fmt::Debug for JdwpPacket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl fmt::Display for JdwpPacket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "JdwpPacket(id={}, length={}, flags=0x{:02x}, ",
            self.id, self.length, self.flags
        )?;
        match self.kind() {
            PacketKind::Command { cmd_set, cmd } => {
                let name = command_set_name(cmd_set).unwrap_or("Unknown");
                write!(f, "command, cmd_set={name}[{cmd_set}], cmd={cmd})")
            }
            PacketKind::Reply { error_code } => {
                let name = error_code_name(error_code).unwrap_or("UNKNOWN");
                write!(f, "reply, error_code={name}[{error_code}])")
            }
        }
    }
}

/// Validating builder for [`JdwpPacket`] headers.
///
/// Setters take wide integers so that out-of-range values coming from untrusted input
/// are rejected when they are set, not when the packet is serialized.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MutableJdwpPacket {
    length: u32,
    id: i32,
    flags: u8,
    fields: u16,
}

impl Default for MutableJdwpPacket {
    fn default() -> Self {
        Self {
            length: MIN_LENGTH,
            id: 0,
            flags: 0,
            fields: 0,
        }
    }
}

fn check_range<T: TryFrom<i64>>(field: &str, value: i64, max: i64) -> Result<T> {
    T::try_from(value).map_err(|_| {
        JdwpError::IllegalArgument(format!("{field} must be within [0, {max}], got {value}"))
    })
}

impl MutableJdwpPacket {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_packet(packet: &JdwpPacket) -> Self {
        Self {
            length: packet.length,
            id: packet.id,
            flags: packet.flags,
            fields: packet.fields,
        }
    }

    pub fn length(&self) -> u32 {
        self.length
    }

    pub fn set_length(&mut self, length: i64) -> Result<&mut Self> {
        let length: u32 = check_range("length", length, i64::from(u32::MAX))?;
        if length < MIN_LENGTH {
            return Err(JdwpError::IllegalArgument(format!(
                "length must be at least {MIN_LENGTH}, got {length}"
            )));
        }
        self.length = length;
        Ok(self)
    }

    /// Sets `length` to the header size plus `payload_len`.
    pub fn set_payload_len(&mut self, payload_len: u64) -> Result<&mut Self> {
        let length = i64::try_from(payload_len)
            .ok()
            .and_then(|len| len.checked_add(JDWP_HEADER_LEN as i64))
            .unwrap_or(i64::MAX);
        self.set_length(length)
    }

    pub fn id(&self) -> i32 {
        self.id
    }

    pub fn set_id(&mut self, id: i32) -> &mut Self {
        self.id = id;
        self
    }

    pub fn flags(&self) -> u8 {
        self.flags
    }

    pub fn set_flags(&mut self, flags: i64) -> Result<&mut Self> {
        self.flags = check_range("flags", flags, i64::from(u8::MAX))?;
        Ok(self)
    }

    pub fn is_reply(&self) -> bool {
        self.flags & FLAG_REPLY != 0
    }

    pub fn is_command(&self) -> bool {
        !self.is_reply()
    }

    /// Switches between command and reply. Bytes 9 and 10 are reset when the variant changes.
    pub fn set_is_reply(&mut self, reply: bool) -> &mut Self {
        if reply != self.is_reply() {
            self.fields = 0;
        }
        if reply {
            self.flags |= FLAG_REPLY;
        } else {
            self.flags &= !FLAG_REPLY;
        }
        self
    }

    pub fn cmd_set(&self) -> Result<u8> {
        self.require_command("cmd_set")?;
        Ok(self.fields.to_be_bytes()[0])
    }

    pub fn set_cmd_set(&mut self, cmd_set: i64) -> Result<&mut Self> {
        self.require_command("cmd_set")?;
        let cmd_set: u8 = check_range("cmd_set", cmd_set, i64::from(u8::MAX))?;
        let [_, cmd] = self.fields.to_be_bytes();
        self.fields = u16::from_be_bytes([cmd_set, cmd]);
        Ok(self)
    }

    pub fn cmd(&self) -> Result<u8> {
        self.require_command("cmd")?;
        Ok(self.fields.to_be_bytes()[1])
    }

    pub fn set_cmd(&mut self, cmd: i64) -> Result<&mut Self> {
        self.require_command("cmd")?;
        let cmd: u8 = check_range("cmd", cmd, i64::from(u8::MAX))?;
        let [cmd_set, _] = self.fields.to_be_bytes();
        self.fields = u16::from_be_bytes([cmd_set, cmd]);
        Ok(self)
    }

    pub fn error_code(&self) -> Result<u16> {
        self.require_reply()?;
        Ok(self.fields)
    }

    pub fn set_error_code(&mut self, error_code: i64) -> Result<&mut Self> {
        self.require_reply()?;
        self.fields = check_range("error_code", error_code, i64::from(u16::MAX))?;
        Ok(self)
    }

    fn require_command(&self, field: &str) -> Result<()> {
        if self.is_reply() {
            return Err(not_a_command(field));
        }
        Ok(())
    }

    fn require_reply(&self) -> Result<()> {
        if self.is_command() {
            return Err(JdwpError::IllegalState(
                "error_code is only available on reply packets".to_owned(),
            ));
        }
        Ok(())
    }

    /// Freezes the header and attaches `payload`.
    pub fn build(&self, payload: PayloadProvider) -> Result<JdwpPacket> {
        JdwpPacket::from_header(
            self.length,
            self.id,
            self.flags,
            self.fields.to_be_bytes(),
            payload,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn length_below_header_size_is_rejected() {
        let mut builder = MutableJdwpPacket::new();
        for length in [-1, 0, 10] {
            let err = builder.set_length(length).unwrap_err();
            assert!(matches!(err, JdwpError::IllegalArgument(_)), "{err}");
        }
        assert!(matches!(
            JdwpPacket::from_header(10, 1, 0, [1, 1], PayloadProvider::empty()),
            Err(JdwpError::IllegalArgument(_))
        ));
    }

    #[test]
    fn header_only_packet_is_empty() {
        let mut builder = MutableJdwpPacket::new();
        builder.set_length(11).unwrap();
        let packet = builder.build(PayloadProvider::empty()).unwrap();
        assert!(packet.is_empty());
        assert_eq!(packet.payload_len(), 0);
    }

    #[test]
    fn header_fields_are_range_checked() {
        let mut builder = MutableJdwpPacket::new();
        assert!(builder.set_flags(256).is_err());
        assert!(builder.set_flags(-1).is_err());
        assert!(builder.set_cmd_set(256).is_err());
        assert!(builder.set_cmd(-10).is_err());
        builder.set_cmd_set(255).unwrap().set_cmd(0).unwrap();
        assert_eq!(builder.cmd_set().unwrap(), 255);

        builder.set_is_reply(true);
        assert!(builder.set_error_code(65_536).is_err());
        assert!(builder.set_error_code(-1).is_err());
        builder.set_error_code(65_535).unwrap();
        assert_eq!(builder.error_code().unwrap(), 65_535);
        assert!(builder.set_length(i64::from(u32::MAX) + 1).is_err());
    }

    #[test]
    fn command_packets_refuse_error_code() {
        let packet = JdwpPacket::command(10, 11, 1, PayloadProvider::empty()).unwrap();
        assert!(packet.is_command());
        assert_eq!(packet.cmd_set().unwrap(), 11);
        assert_eq!(packet.cmd().unwrap(), 1);
        assert!(matches!(
            packet.error_code(),
            Err(JdwpError::IllegalState(_))
        ));
    }

    #[test]
    fn reply_packets_refuse_command_fields() {
        let packet = JdwpPacket::reply(10, 99, PayloadProvider::empty()).unwrap();
        assert!(packet.is_reply());
        assert_eq!(packet.error_code().unwrap(), 99);
        assert!(matches!(packet.cmd_set(), Err(JdwpError::IllegalState(_))));
        assert!(matches!(packet.cmd(), Err(JdwpError::IllegalState(_))));

        let mut builder = MutableJdwpPacket::from_packet(&packet);
        assert!(matches!(
            builder.set_cmd_set(1),
            Err(JdwpError::IllegalState(_))
        ));
    }

    #[test]
    fn switching_variant_resets_packed_fields() {
        let mut builder = MutableJdwpPacket::new();
        builder.set_cmd_set(0xC7).unwrap().set_cmd(1).unwrap();
        builder.set_is_reply(true);
        assert_eq!(builder.error_code().unwrap(), 0);
        assert_eq!(builder.flags(), FLAG_REPLY);
    }

    #[test]
    fn length_is_derived_from_payload() {
        let packet =
            JdwpPacket::command(1, 1, 7, PayloadProvider::from_bytes(vec![0u8; 5])).unwrap();
        assert_eq!(packet.length(), 16);
        assert_eq!(
            packet.header_bytes(),
            [0, 0, 0, 16, 0, 0, 0, 1, 0, 1, 7]
        );
    }

    #[test]
    fn display_names_command_sets_and_error_codes() {
        let command = JdwpPacket::command(10, 11, 1, PayloadProvider::empty()).unwrap();
        assert_eq!(
            command.to_string(),
            "JdwpPacket(id=10, length=11, flags=0x00, command, cmd_set=ThreadReference[11], cmd=1)"
        );
        let reply = JdwpPacket::reply(10, 112, PayloadProvider::empty()).unwrap();
        assert_eq!(
            reply.to_string(),
            "JdwpPacket(id=10, length=11, flags=0x80, reply, error_code=VM_DEAD[112])"
        );
    }

    #[tokio::test]
    async fn to_offline_keeps_memory_payload_instance() {
        let packet =
            JdwpPacket::command(1, 1, 1, PayloadProvider::from_bytes(vec![1, 2, 3])).unwrap();
        let offline = packet.to_offline().await.unwrap();
        assert!(offline.shares_payload_with(&packet));
        assert_eq!(offline.length(), packet.length());
    }
}
