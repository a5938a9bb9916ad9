#![forbid(unsafe_code)]
//! Core units and wire-format primitives for the block-layout client.
//!
//! Everything on the wire is big-endian. All "sector" fields are carried as
//! byte values that must be exactly divisible by 512; [`Cursor::read_sector`]
//! enforces that and converts to sector units.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Sector size in bytes. All extent and volume geometry is sector-granular.
pub const SECTOR_SIZE: u64 = 512;
/// Shift to convert between bytes and sectors.
pub const SECTOR_SHIFT: u32 = 9;
/// Low-bit mask a byte value must not intersect to be sector-aligned.
pub const SECTOR_MASK: u64 = SECTOR_SIZE - 1;

/// Size of an opaque device identifier on the wire.
pub const DEVICE_ID_SIZE: usize = 16;

/// Maximum number of components in a disk signature.
pub const SIG_MAX_COMPONENTS: usize = 16;

/// Opaque wire identifier for a volume within one device-list response.
///
/// Child references in slice/concat/stripe records are expressed as the
/// device id of an earlier volume in the same list, not as an index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceId(pub [u8; DEVICE_ID_SIZE]);

impl DeviceId {
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; DEVICE_ID_SIZE] {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

/// Wire decode failure.
///
/// Decoding is all-or-nothing: any variant aborts the entire response being
/// processed and nothing partially built is retained.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// Buffer ended inside a record.
    #[error("truncated buffer: need {needed} bytes at offset {offset}, got {actual}")]
    Truncated {
        needed: usize,
        offset: usize,
        actual: usize,
    },
    /// Volume type tag outside the known set.
    #[error("unknown volume type tag {tag:#x}")]
    UnknownVolumeType { tag: u32 },
    /// A child device id did not match any volume decoded earlier in the list.
    #[error("volume {index} references unresolved or forward device id {device_id}")]
    ForwardOrMissingReference { index: usize, device_id: DeviceId },
    /// A sector-valued field whose byte encoding has the low 9 bits set.
    #[error("misaligned sector field {field}: byte value {value:#x} is not a multiple of 512")]
    MisalignedSector { field: &'static str, value: u64 },
    /// Concat or stripe record with no children.
    #[error("volume {index} has zero children")]
    ZeroChildCount { index: usize },
    /// Stripe record with a zero stripe unit.
    #[error("volume {index} has zero stripe unit")]
    ZeroStripeUnit { index: usize },
    /// Signature component count above [`SIG_MAX_COMPONENTS`].
    #[error("signature has {count} components, maximum is {max}")]
    OversizedSignature { count: u32, max: usize },
    /// Simple volume carrying a signature with no components.
    #[error("volume {index} has an empty signature")]
    EmptySignature { index: usize },
    /// Bytes left over after the last record.
    #[error("{remaining} trailing bytes after final record")]
    TrailingBytes { remaining: usize },
    /// Extent state value outside the known set.
    #[error("invalid extent state {value}")]
    InvalidExtentState { value: u32 },
}

/// Convert a sector count to a byte count, `None` on overflow.
#[must_use]
pub fn sectors_to_bytes(sectors: u64) -> Option<u64> {
    sectors.checked_mul(SECTOR_SIZE)
}

/// First sector containing the given byte offset (rounds down).
#[must_use]
pub fn byte_to_sector(offset: u64) -> u64 {
    offset >> SECTOR_SHIFT
}

/// Number of sectors covering the byte range `[offset, offset + len)`.
///
/// Returns 0 for an empty range and `None` on overflow.
#[must_use]
pub fn covering_sectors(offset: u64, len: u64) -> Option<u64> {
    if len == 0 {
        return Some(0);
    }
    let end = offset.checked_add(len)?;
    let end_sector = end
        .checked_add(SECTOR_MASK)
        .map(|v| v >> SECTOR_SHIFT)?;
    Some(end_sector - byte_to_sector(offset))
}

/// Big-endian read cursor over a wire buffer.
///
/// Every read returns a `Result`; the first failure aborts the decode via
/// early return. After the last record, [`Cursor::finish`] must observe the
/// cursor exactly at the buffer end.
#[derive(Debug)]
pub struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    #[must_use]
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    #[must_use]
    pub fn position(&self) -> usize {
        self.pos
    }

    #[must_use]
    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8], DecodeError> {
        let Some(end) = self.pos.checked_add(len) else {
            return Err(DecodeError::Truncated {
                needed: len,
                offset: self.pos,
                actual: self.remaining(),
            });
        };
        if end > self.data.len() {
            return Err(DecodeError::Truncated {
                needed: len,
                offset: self.pos,
                actual: self.remaining(),
            });
        }
        let slice = &self.data[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    pub fn read_u32(&mut self) -> Result<u32, DecodeError> {
        let bytes = self.take(4)?;
        Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    pub fn read_u64(&mut self) -> Result<u64, DecodeError> {
        let bytes = self.take(8)?;
        Ok(u64::from_be_bytes([
            bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
        ]))
    }

    pub fn read_i64(&mut self) -> Result<i64, DecodeError> {
        let bytes = self.take(8)?;
        Ok(i64::from_be_bytes([
            bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
        ]))
    }

    /// Read a sector-valued field carried as a byte value.
    ///
    /// The low 9 bits of the byte value must be zero; the result is in
    /// sector units.
    pub fn read_sector(&mut self, field: &'static str) -> Result<u64, DecodeError> {
        let value = self.read_u64()?;
        if value & SECTOR_MASK != 0 {
            return Err(DecodeError::MisalignedSector { field, value });
        }
        Ok(value >> SECTOR_SHIFT)
    }

    pub fn read_device_id(&mut self) -> Result<DeviceId, DecodeError> {
        let bytes = self.take(DEVICE_ID_SIZE)?;
        let mut id = [0_u8; DEVICE_ID_SIZE];
        id.copy_from_slice(bytes);
        Ok(DeviceId(id))
    }

    /// Read `len` opaque bytes followed by padding to the next 4-byte
    /// boundary. The padding must be present in the buffer.
    pub fn read_opaque(&mut self, len: usize) -> Result<&'a [u8], DecodeError> {
        let bytes = self.take(len)?;
        let pad = (4 - (len % 4)) % 4;
        if pad > 0 {
            let _ = self.take(pad)?;
        }
        Ok(bytes)
    }

    /// Require the cursor to sit exactly at the buffer end.
    pub fn finish(self) -> Result<(), DecodeError> {
        if self.remaining() > 0 {
            return Err(DecodeError::TrailingBytes {
                remaining: self.remaining(),
            });
        }
        Ok(())
    }
}
