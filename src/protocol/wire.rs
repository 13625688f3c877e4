//! Field primitives shared by every message layout.
//!
//! Wire format: all multi-byte integers are big-endian.
//! Strings and blobs are length-prefixed (u32 len + bytes).
//! Optional blobs carry a presence byte before the length.

use anyhow::{Context, Result};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use uuid::Uuid;

/// Upper bound for a single string or blob field (64MB)
pub const MAX_FIELD_LEN: usize = 64 * 1024 * 1024;

pub fn put_bool(buf: &mut BytesMut, v: bool) {
    buf.put_u8(u8::from(v));
}

pub fn put_uuid(buf: &mut BytesMut, id: &Uuid) {
    buf.put_slice(id.as_bytes());
}

pub fn put_string(buf: &mut BytesMut, s: &str) {
    put_blob(buf, s.as_bytes());
}

pub fn put_blob(buf: &mut BytesMut, data: &[u8]) {
    buf.put_u32(data.len() as u32);
    buf.put_slice(data);
}

pub fn put_opt_blob(buf: &mut BytesMut, data: Option<&[u8]>) {
    match data {
        Some(d) => {
            buf.put_u8(1);
            put_blob(buf, d);
        }
        None => buf.put_u8(0),
    }
}

/// Sequential field reader over one message payload.
///
/// Every getter checks the remaining length first so a truncated frame
/// surfaces as an error naming the message instead of a panic.
pub struct FieldReader {
    buf: Bytes,
    message: &'static str,
}

impl FieldReader {
    pub fn new(buf: Bytes, message: &'static str) -> Self {
        Self { buf, message }
    }

    fn need(&self, n: usize, field: &str) -> Result<()> {
        if self.buf.remaining() < n {
            anyhow::bail!(
                "{} payload truncated at {}: expected {} bytes, got {}",
                self.message,
                field,
                n,
                self.buf.remaining()
            );
        }
        Ok(())
    }

    /// Names the message being decoded once its schema is known.
    pub fn set_message(&mut self, message: &'static str) {
        self.message = message;
    }

    pub fn remaining(&self) -> usize {
        self.buf.remaining()
    }

    pub fn u8(&mut self, field: &str) -> Result<u8> {
        self.need(1, field)?;
        Ok(self.buf.get_u8())
    }

    pub fn bool(&mut self, field: &str) -> Result<bool> {
        match self.u8(field)? {
            0 => Ok(false),
            1 => Ok(true),
            other => anyhow::bail!("{} has invalid boolean {} in {}", self.message, other, field),
        }
    }

    pub fn u32(&mut self, field: &str) -> Result<u32> {
        self.need(4, field)?;
        Ok(self.buf.get_u32())
    }

    pub fn i32(&mut self, field: &str) -> Result<i32> {
        self.need(4, field)?;
        Ok(self.buf.get_i32())
    }

    pub fn u64(&mut self, field: &str) -> Result<u64> {
        self.need(8, field)?;
        Ok(self.buf.get_u64())
    }

    pub fn i64(&mut self, field: &str) -> Result<i64> {
        self.need(8, field)?;
        Ok(self.buf.get_i64())
    }

    pub fn uuid(&mut self, field: &str) -> Result<Uuid> {
        self.need(16, field)?;
        let mut raw = [0u8; 16];
        self.buf.copy_to_slice(&mut raw);
        Ok(Uuid::from_bytes(raw))
    }

    pub fn blob(&mut self, field: &str) -> Result<Bytes> {
        let len = self.u32(field)? as usize;
        if len > MAX_FIELD_LEN {
            anyhow::bail!(
                "{} field {} length {} exceeds maximum {}",
                self.message,
                field,
                len,
                MAX_FIELD_LEN
            );
        }
        self.need(len, field)?;
        Ok(self.buf.copy_to_bytes(len))
    }

    pub fn opt_blob(&mut self, field: &str) -> Result<Option<Bytes>> {
        match self.u8(field)? {
            0 => Ok(None),
            1 => Ok(Some(self.blob(field)?)),
            other => anyhow::bail!("{} has invalid presence byte {} in {}", self.message, other, field),
        }
    }

    pub fn string(&mut self, field: &str) -> Result<String> {
        let raw = self.blob(field)?;
        String::from_utf8(raw.to_vec())
            .with_context(|| format!("Invalid UTF-8 in {} {}", self.message, field))
    }

    /// Element count for a repeated group, bounded so a corrupt count
    /// cannot trigger a huge allocation.
    pub fn count(&mut self, field: &str, max: usize) -> Result<usize> {
        let n = self.i32(field)?;
        if n < 0 || n as usize > max {
            anyhow::bail!("{} has invalid {} count {}", self.message, field, n);
        }
        Ok(n as usize)
    }
}
