//! Field-tagged payloads.
//!
//! Every field is prefixed with a one-byte *format descriptor* and followed by
//! its value in little-endian order, so a host decoder can walk a payload
//! without knowing the record layout.

/// Format identifier for unsigned 8-bit fields.
pub const FMT_U8: u8 = 0x1;
/// Format identifier for unsigned 16-bit fields.
pub const FMT_U16: u8 = 0x3;
/// Format identifier for unsigned 32-bit fields.
pub const FMT_U32: u8 = 0x5;
/// Format identifier for length-prefixed strings.
pub const FMT_STR: u8 = 0x8;
/// Format identifier for unsigned 64-bit fields.
pub const FMT_U64: u8 = 0xE;

/// Combines a width hint with a base format identifier.
pub fn make_format(width: u8, base: u8) -> u8 {
    ((width & 0x0F) << 4) | (base & 0x0F)
}

/// Incremental payload builder.
#[derive(Debug, Default)]
pub struct PayloadBuilder {
    bytes: Vec<u8>,
}

impl PayloadBuilder {
    pub fn new() -> Self {
        Self { bytes: Vec::new() }
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            bytes: Vec::with_capacity(capacity),
        }
    }

    pub fn push_u8(&mut self, value: u8) -> &mut Self {
        self.bytes.push(make_format(0, FMT_U8));
        self.bytes.push(value);
        self
    }

    pub fn push_u16(&mut self, value: u16) -> &mut Self {
        self.bytes.push(make_format(0, FMT_U16));
        self.bytes.extend_from_slice(&value.to_le_bytes());
        self
    }

    pub fn push_u32(&mut self, value: u32) -> &mut Self {
        self.bytes.push(make_format(0, FMT_U32));
        self.bytes.extend_from_slice(&value.to_le_bytes());
        self
    }

    pub fn push_u64(&mut self, value: u64) -> &mut Self {
        self.bytes.push(make_format(0, FMT_U64));
        self.bytes.extend_from_slice(&value.to_le_bytes());
        self
    }

    /// Adds a string truncated to 255 bytes.
    pub fn push_str(&mut self, value: &str) -> &mut Self {
        let bytes = value.as_bytes();
        let len = bytes.len().min(u8::MAX as usize);
        self.bytes.push(make_format(0, FMT_STR));
        self.bytes.push(len as u8);
        self.bytes.extend_from_slice(&bytes[..len]);
        self
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }

    pub fn finish(self) -> Vec<u8> {
        self.bytes
    }
}
