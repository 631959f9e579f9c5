//! Big-endian cursors for JDWP and DDMS payload bodies.

use crate::{JdwpError, Result};

#[derive(Debug, Default)]
pub struct JdwpWriter {
    buf: Vec<u8>,
}

impl JdwpWriter {
    pub fn new() -> Self {
        Self { buf: Vec::new() }
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: Vec::with_capacity(capacity),
        }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.buf
    }

    pub fn write_u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    pub fn write_bool(&mut self, v: bool) {
        self.buf.push(u8::from(v));
    }

    pub fn write_u16(&mut self, v: u16) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    pub fn write_u32(&mut self, v: u32) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    pub fn write_i32(&mut self, v: i32) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    pub fn write_u64(&mut self, v: u64) {
        self.buf.extend_from_slice(&v.to_be_bytes());
    }

    /// JDWP strings: u32 byte count followed by modified UTF-8 (plain UTF-8 here).
    pub fn write_string(&mut self, s: &str) {
        self.write_u32(s.len() as u32);
        self.buf.extend_from_slice(s.as_bytes());
    }

    /// DDMS strings: u32 UTF-16 code unit count followed by UTF-16BE code units.
    pub fn write_utf16_string(&mut self, s: &str) {
        let units: Vec<u16> = s.encode_utf16().collect();
        self.write_u32(units.len() as u32);
        self.write_utf16_units(&units);
    }

    /// UTF-16BE code units with no length prefix. DDMS HELO sends its lengths up front.
    pub fn write_utf16_units(&mut self, units: &[u16]) {
        for unit in units {
            self.write_u16(*unit);
        }
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }
}

pub struct JdwpReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> JdwpReader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn require(&self, n: usize) -> Result<()> {
        let underflow = || {
            JdwpError::Protocol(format!(
                "buffer underflow: need {n} bytes at {}, have {}",
                self.pos,
                self.buf.len()
            ))
        };
        let end = self.pos.checked_add(n).ok_or_else(underflow)?;
        if end > self.buf.len() {
            return Err(underflow());
        }
        Ok(())
    }

    fn take<const N: usize>(&mut self) -> Result<[u8; N]> {
        self.require(N)?;
        let mut out = [0u8; N];
        out.copy_from_slice(&self.buf[self.pos..self.pos + N]);
        self.pos += N;
        Ok(out)
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.buf.len().saturating_sub(self.pos)
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        Ok(self.take::<1>()?[0])
    }

    pub fn read_bool(&mut self) -> Result<bool> {
        Ok(self.read_u8()? != 0)
    }

    pub fn read_u16(&mut self) -> Result<u16> {
        Ok(u16::from_be_bytes(self.take()?))
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        Ok(u32::from_be_bytes(self.take()?))
    }

    pub fn read_i32(&mut self) -> Result<i32> {
        Ok(i32::from_be_bytes(self.take()?))
    }

    pub fn read_u64(&mut self) -> Result<u64> {
        Ok(u64::from_be_bytes(self.take()?))
    }

    pub fn read_string(&mut self) -> Result<String> {
        let len = self.read_u32()? as usize;
        let bytes = self.read_bytes(len)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|e| JdwpError::Protocol(format!("invalid utf-8 string: {e}")))
    }

    pub fn read_utf16_string(&mut self) -> Result<String> {
        let len = self.read_u32()? as usize;
        self.read_utf16_units(len)
    }

    pub fn read_utf16_units(&mut self, len: usize) -> Result<String> {
        let byte_len = len
            .checked_mul(2)
            .ok_or_else(|| JdwpError::Protocol(format!("utf-16 string too long ({len} units)")))?;
        self.require(byte_len)?;
        let mut units = Vec::with_capacity(len);
        for _ in 0..len {
            units.push(self.read_u16()?);
        }
        String::from_utf16(&units)
            .map_err(|e| JdwpError::Protocol(format!("invalid utf-16 string: {e}")))
    }

    pub fn read_bytes(&mut self, len: usize) -> Result<&'a [u8]> {
        self.require(len)?;
        let bytes = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(bytes)
    }
}
