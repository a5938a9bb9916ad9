#![forbid(unsafe_code)]
//! Block-device access for the block-layout client.
//!
//! Provides the [`BlockDevice`] trait with file-backed and in-memory
//! implementations, the unclaimed-device pool with disk-signature matching
//! ([`pool`]), and the host volume-manager collaborator interface
//! ([`volmgr`]).

use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;

pub mod pool;
pub mod volmgr;

pub use pool::{ClaimedDevice, DevicePool, Signature, SignatureComponent};
pub use volmgr::{CompositeHandle, MemVolumeManager, VolumeManager};

/// Device-layer failure.
///
/// Matching and claim failures abort the entire device-list response being
/// processed; the caller decides whether to retry at a higher level.
#[derive(Debug, Error)]
pub enum DeviceError {
    /// Operating system I/O error.
    #[error("device I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Access outside the device's byte range.
    #[error("device access out of bounds: offset={offset} len={len} device_len={device_len}")]
    OutOfBounds {
        offset: u64,
        len: usize,
        device_len: u64,
    },

    /// The whole unclaimed pool was tried and no device matched.
    #[error("no visible device matches the volume signature")]
    NoMatchingSignature,

    /// A device or composite object could not be exclusively claimed.
    #[error("device claim failed: {detail}")]
    ClaimFailed { detail: String },

    /// The host volume manager refused to create the composite object.
    #[error("composite device creation failed: {detail}")]
    CompositeCreateFailed { detail: String },
}

/// Validate a storage block size: power of two in 512..=65536.
fn validate_block_size(block_size: u32) -> Result<(), DeviceError> {
    if !block_size.is_power_of_two() || !(512..=65536).contains(&block_size) {
        return Err(DeviceError::ClaimFailed {
            detail: format!("invalid block_size={block_size} (must be power of two in 512..=65536)"),
        });
    }
    Ok(())
}

/// Byte- and block-addressed access to one physical block device.
///
/// `block_size` is the device's storage block size, used by the signature
/// matcher to translate byte offsets into (block, in-block offset) pairs.
/// All other I/O is byte-addressed with pread/pwrite semantics.
pub trait BlockDevice: Send + Sync {
    /// Total device length in bytes.
    fn len_bytes(&self) -> u64;

    /// Storage block size in bytes.
    fn block_size(&self) -> u32;

    /// Read one whole storage block by index.
    fn read_block(&self, index: u64) -> Result<Vec<u8>, DeviceError>;

    /// Read exactly `buf.len()` bytes from `offset`.
    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<(), DeviceError>;

    /// Write all bytes in `buf` at `offset`.
    fn write_all_at(&self, offset: u64, buf: &[u8]) -> Result<(), DeviceError>;
}

fn check_range(offset: u64, len: usize, device_len: u64) -> Result<(), DeviceError> {
    let end = u64::try_from(len)
        .ok()
        .and_then(|len| offset.checked_add(len))
        .ok_or(DeviceError::OutOfBounds {
            offset,
            len,
            device_len,
        })?;
    if end > device_len {
        return Err(DeviceError::OutOfBounds {
            offset,
            len,
            device_len,
        });
    }
    Ok(())
}

/// File-backed block device using `pread`/`pwrite` style I/O.
///
/// `std::os::unix::fs::FileExt` is thread-safe and does not require a shared
/// seek position.
#[derive(Debug, Clone)]
pub struct FileBlockDevice {
    file: Arc<File>,
    len: u64,
    block_size: u32,
    writable: bool,
}

impl FileBlockDevice {
    /// Open a device node or image file, read-write if possible.
    pub fn open(path: impl AsRef<Path>, block_size: u32) -> Result<Self, DeviceError> {
        validate_block_size(block_size)?;
        let (file, writable) = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path.as_ref())
            .map(|file| (file, true))
            .or_else(|_| {
                OpenOptions::new()
                    .read(true)
                    .open(path.as_ref())
                    .map(|file| (file, false))
            })?;
        let len = file.metadata()?.len();
        Ok(Self {
            file: Arc::new(file),
            len,
            block_size,
            writable,
        })
    }
}

impl BlockDevice for FileBlockDevice {
    fn len_bytes(&self) -> u64 {
        self.len
    }

    fn block_size(&self) -> u32 {
        self.block_size
    }

    fn read_block(&self, index: u64) -> Result<Vec<u8>, DeviceError> {
        let offset = index
            .checked_mul(u64::from(self.block_size))
            .ok_or(DeviceError::OutOfBounds {
                offset: u64::MAX,
                len: self.block_size as usize,
                device_len: self.len,
            })?;
        let mut buf = vec![0_u8; self.block_size as usize];
        self.read_exact_at(offset, &mut buf)?;
        Ok(buf)
    }

    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<(), DeviceError> {
        check_range(offset, buf.len(), self.len)?;
        self.file.read_exact_at(buf, offset)?;
        Ok(())
    }

    fn write_all_at(&self, offset: u64, buf: &[u8]) -> Result<(), DeviceError> {
        if !self.writable {
            return Err(DeviceError::ClaimFailed {
                detail: "device opened read-only".to_owned(),
            });
        }
        check_range(offset, buf.len(), self.len)?;
        self.file.write_all_at(buf, offset)?;
        Ok(())
    }
}

/// In-memory block device.
///
/// Used throughout the workspace's tests and usable as a scratch target; the
/// contents live in a mutex-guarded byte vector.
#[derive(Debug)]
pub struct MemBlockDevice {
    bytes: parking_lot::Mutex<Vec<u8>>,
    block_size: u32,
}

impl MemBlockDevice {
    /// Create a zero-filled device of `len` bytes.
    pub fn new(len: usize, block_size: u32) -> Result<Self, DeviceError> {
        validate_block_size(block_size)?;
        Ok(Self {
            bytes: parking_lot::Mutex::new(vec![0_u8; len]),
            block_size,
        })
    }

    /// Create a device seeded with `bytes`.
    pub fn from_bytes(bytes: Vec<u8>, block_size: u32) -> Result<Self, DeviceError> {
        validate_block_size(block_size)?;
        Ok(Self {
            bytes: parking_lot::Mutex::new(bytes),
            block_size,
        })
    }
}

impl BlockDevice for MemBlockDevice {
    fn len_bytes(&self) -> u64 {
        u64::try_from(self.bytes.lock().len()).unwrap_or(0)
    }

    fn block_size(&self) -> u32 {
        self.block_size
    }

    fn read_block(&self, index: u64) -> Result<Vec<u8>, DeviceError> {
        let offset = index
            .checked_mul(u64::from(self.block_size))
            .ok_or(DeviceError::OutOfBounds {
                offset: u64::MAX,
                len: self.block_size as usize,
                device_len: self.len_bytes(),
            })?;
        let mut buf = vec![0_u8; self.block_size as usize];
        self.read_exact_at(offset, &mut buf)?;
        Ok(buf)
    }

    fn read_exact_at(&self, offset: u64, buf: &mut [u8]) -> Result<(), DeviceError> {
        let bytes = self.bytes.lock();
        check_range(offset, buf.len(), u64::try_from(bytes.len()).unwrap_or(0))?;
        let start = usize::try_from(offset).map_err(|_| DeviceError::OutOfBounds {
            offset,
            len: buf.len(),
            device_len: u64::try_from(bytes.len()).unwrap_or(0),
        })?;
        buf.copy_from_slice(&bytes[start..start + buf.len()]);
        Ok(())
    }

    fn write_all_at(&self, offset: u64, buf: &[u8]) -> Result<(), DeviceError> {
        let mut bytes = self.bytes.lock();
        let device_len = u64::try_from(bytes.len()).unwrap_or(0);
        check_range(offset, buf.len(), device_len)?;
        let start = usize::try_from(offset).map_err(|_| DeviceError::OutOfBounds {
            offset,
            len: buf.len(),
            device_len,
        })?;
        bytes[start..start + buf.len()].copy_from_slice(buf);
        Ok(())
    }
}
