//! Versioned device snapshot protocol.
//!
//! A snapshot blob is an 8-byte magic, a 4-byte device id, a
//! major/minor version pair, and then tagged fields (`tag u16`,
//! `len u32`, payload). Readers ignore unknown tags and tolerate newer
//! minor versions; a newer major version is refused. Field payloads are
//! built with the [`codec`] primitives so devices can evolve their
//! encodings per tag.

use thiserror::Error;

/// Leading magic of every snapshot blob.
pub const SNAPSHOT_MAGIC: [u8; 8] = *b"VUSBSNAP";

/// Upper bound on a single field payload; a declared length beyond this
/// is treated as corruption rather than an allocation request.
pub const MAX_FIELD_BYTES: usize = 1 << 20;

/// Upper bound on vector element counts inside field payloads.
pub const MAX_VEC_ITEMS: usize = 4096;

const HEADER_LEN: usize = 16;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SnapshotVersion {
    pub major: u16,
    pub minor: u16,
}

impl SnapshotVersion {
    pub const fn new(major: u16, minor: u16) -> Self {
        Self { major, minor }
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum SnapshotError {
    #[error("snapshot ends before the declared data")]
    UnexpectedEof,
    #[error("not a snapshot blob")]
    BadMagic,
    #[error("snapshot was taken from device {found:?}, expected {expected:?}")]
    DeviceIdMismatch { expected: [u8; 4], found: [u8; 4] },
    #[error("snapshot major version {found} is newer than supported {supported}")]
    UnsupportedDeviceMajorVersion { found: u16, supported: u16 },
    #[error("invalid field encoding: {0}")]
    InvalidFieldEncoding(&'static str),
}

/// Device save/restore entry points.
///
/// `save_state` must be deterministic; `load_state` must validate
/// before mutating, so a rejected blob leaves the device untouched.
pub trait IoSnapshot {
    fn save_state(&self) -> Vec<u8>;
    fn load_state(&mut self, bytes: &[u8]) -> Result<(), SnapshotError>;
}

pub struct SnapshotWriter {
    buf: Vec<u8>,
}

impl SnapshotWriter {
    pub fn new(device_id: [u8; 4], version: SnapshotVersion) -> Self {
        let mut buf = Vec::with_capacity(64);
        buf.extend_from_slice(&SNAPSHOT_MAGIC);
        buf.extend_from_slice(&device_id);
        buf.extend_from_slice(&version.major.to_le_bytes());
        buf.extend_from_slice(&version.minor.to_le_bytes());
        Self { buf }
    }

    pub fn field_bytes(&mut self, tag: u16, bytes: Vec<u8>) {
        self.buf.extend_from_slice(&tag.to_le_bytes());
        self.buf.extend_from_slice(&(bytes.len() as u32).to_le_bytes());
        self.buf.extend_from_slice(&bytes);
    }

    pub fn field_u32(&mut self, tag: u16, value: u32) {
        self.field_bytes(tag, value.to_le_bytes().to_vec());
    }

    pub fn field_u64(&mut self, tag: u16, value: u64) {
        self.field_bytes(tag, value.to_le_bytes().to_vec());
    }

    pub fn finish(self) -> Vec<u8> {
        self.buf
    }
}

#[derive(Debug)]
pub struct SnapshotReader<'a> {
    version: SnapshotVersion,
    fields: Vec<(u16, &'a [u8])>,
}

impl<'a> SnapshotReader<'a> {
    /// Parse header and field table; the caller still decides which
    /// versions it accepts (see [`parse_versioned`](Self::parse_versioned)).
    pub fn parse(bytes: &'a [u8], device_id: [u8; 4]) -> Result<Self, SnapshotError> {
        if bytes.len() < HEADER_LEN {
            return Err(SnapshotError::UnexpectedEof);
        }
        if bytes[0..8] != SNAPSHOT_MAGIC {
            return Err(SnapshotError::BadMagic);
        }
        let found: [u8; 4] = bytes[8..12].try_into().unwrap();
        if found != device_id {
            return Err(SnapshotError::DeviceIdMismatch {
                expected: device_id,
                found,
            });
        }
        let version = SnapshotVersion {
            major: u16::from_le_bytes(bytes[12..14].try_into().unwrap()),
            minor: u16::from_le_bytes(bytes[14..16].try_into().unwrap()),
        };

        let mut fields = Vec::new();
        let mut pos = HEADER_LEN;
        while pos < bytes.len() {
            if bytes.len() - pos < 6 {
                return Err(SnapshotError::UnexpectedEof);
            }
            let tag = u16::from_le_bytes(bytes[pos..pos + 2].try_into().unwrap());
            let len =
                u32::from_le_bytes(bytes[pos + 2..pos + 6].try_into().unwrap()) as usize;
            if len > MAX_FIELD_BYTES {
                return Err(SnapshotError::InvalidFieldEncoding("field too large"));
            }
            pos += 6;
            if bytes.len() - pos < len {
                return Err(SnapshotError::UnexpectedEof);
            }
            fields.push((tag, &bytes[pos..pos + len]));
            pos += len;
        }
        Ok(Self { version, fields })
    }

    /// [`parse`](Self::parse) plus the major-version gate: snapshots
    /// from a newer major version are refused, older ones load with
    /// whatever fields they carry.
    pub fn parse_versioned(
        bytes: &'a [u8],
        device_id: [u8; 4],
        supported: SnapshotVersion,
    ) -> Result<Self, SnapshotError> {
        let reader = Self::parse(bytes, device_id)?;
        if reader.version.major > supported.major {
            return Err(SnapshotError::UnsupportedDeviceMajorVersion {
                found: reader.version.major,
                supported: supported.major,
            });
        }
        Ok(reader)
    }

    pub fn version(&self) -> SnapshotVersion {
        self.version
    }

    pub fn bytes(&self, tag: u16) -> Option<&'a [u8]> {
        self.fields
            .iter()
            .find(|(t, _)| *t == tag)
            .map(|(_, bytes)| *bytes)
    }

    pub fn u32(&self, tag: u16) -> Result<Option<u32>, SnapshotError> {
        match self.bytes(tag) {
            None => Ok(None),
            Some(raw) => {
                let raw: [u8; 4] = raw
                    .try_into()
                    .map_err(|_| SnapshotError::InvalidFieldEncoding("u32 field length"))?;
                Ok(Some(u32::from_le_bytes(raw)))
            }
        }
    }

    pub fn u64(&self, tag: u16) -> Result<Option<u64>, SnapshotError> {
        match self.bytes(tag) {
            None => Ok(None),
            Some(raw) => {
                let raw: [u8; 8] = raw
                    .try_into()
                    .map_err(|_| SnapshotError::InvalidFieldEncoding("u64 field length"))?;
                Ok(Some(u64::from_le_bytes(raw)))
            }
        }
    }

    pub fn iter_fields(&self) -> impl Iterator<Item = (u16, &'a [u8])> + '_ {
        self.fields.iter().copied()
    }
}

/// Field payload primitives.
pub mod codec {
    use super::{SnapshotError, MAX_FIELD_BYTES, MAX_VEC_ITEMS};

    /// Little-endian append-only payload builder.
    #[derive(Default)]
    pub struct Encoder {
        buf: Vec<u8>,
    }

    impl Encoder {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn u8(mut self, value: u8) -> Self {
            self.buf.push(value);
            self
        }

        pub fn bool(self, value: bool) -> Self {
            self.u8(u8::from(value))
        }

        pub fn u16(mut self, value: u16) -> Self {
            self.buf.extend_from_slice(&value.to_le_bytes());
            self
        }

        pub fn u32(mut self, value: u32) -> Self {
            self.buf.extend_from_slice(&value.to_le_bytes());
            self
        }

        pub fn u64(mut self, value: u64) -> Self {
            self.buf.extend_from_slice(&value.to_le_bytes());
            self
        }

        pub fn bytes(mut self, value: &[u8]) -> Self {
            self.buf.extend_from_slice(value);
            self
        }

        /// Length-prefixed byte vector.
        pub fn vec_u8(mut self, value: &[u8]) -> Self {
            self.buf.extend_from_slice(&(value.len() as u32).to_le_bytes());
            self.buf.extend_from_slice(value);
            self
        }

        /// Count-prefixed vector of length-prefixed items.
        pub fn vec_bytes(mut self, items: &[Vec<u8>]) -> Self {
            self.buf.extend_from_slice(&(items.len() as u32).to_le_bytes());
            for item in items {
                self.buf.extend_from_slice(&(item.len() as u32).to_le_bytes());
                self.buf.extend_from_slice(item);
            }
            self
        }

        pub fn finish(self) -> Vec<u8> {
            self.buf
        }
    }

    pub struct Decoder<'a> {
        bytes: &'a [u8],
    }

    impl<'a> Decoder<'a> {
        pub fn new(bytes: &'a [u8]) -> Self {
            Self { bytes }
        }

        fn take(&mut self, n: usize) -> Result<&'a [u8], SnapshotError> {
            if self.bytes.len() < n {
                return Err(SnapshotError::UnexpectedEof);
            }
            let (head, rest) = self.bytes.split_at(n);
            self.bytes = rest;
            Ok(head)
        }

        pub fn u8(&mut self) -> Result<u8, SnapshotError> {
            Ok(self.take(1)?[0])
        }

        pub fn bool(&mut self) -> Result<bool, SnapshotError> {
            Ok(self.u8()? != 0)
        }

        pub fn u16(&mut self) -> Result<u16, SnapshotError> {
            Ok(u16::from_le_bytes(self.take(2)?.try_into().unwrap()))
        }

        pub fn u32(&mut self) -> Result<u32, SnapshotError> {
            Ok(u32::from_le_bytes(self.take(4)?.try_into().unwrap()))
        }

        pub fn u64(&mut self) -> Result<u64, SnapshotError> {
            Ok(u64::from_le_bytes(self.take(8)?.try_into().unwrap()))
        }

        pub fn bytes(&mut self, n: usize) -> Result<&'a [u8], SnapshotError> {
            self.take(n)
        }

        pub fn vec_u8(&mut self) -> Result<Vec<u8>, SnapshotError> {
            let len = self.u32()? as usize;
            if len > MAX_FIELD_BYTES {
                return Err(SnapshotError::InvalidFieldEncoding("byte vector too large"));
            }
            Ok(self.take(len)?.to_vec())
        }

        pub fn vec_bytes(&mut self) -> Result<Vec<Vec<u8>>, SnapshotError> {
            let count = self.u32()? as usize;
            if count > MAX_VEC_ITEMS {
                return Err(SnapshotError::InvalidFieldEncoding("vector too long"));
            }
            let mut items = Vec::with_capacity(count);
            for _ in 0..count {
                items.push(self.vec_u8()?);
            }
            Ok(items)
        }

        pub fn is_empty(&self) -> bool {
            self.bytes.is_empty()
        }
    }
}
