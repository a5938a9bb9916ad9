//! Unclaimed-device pool and disk-signature matching.
//!
//! A signature identifies a physical device by expected byte patterns at
//! known offsets, independent of OS-assigned device naming. Matching claims
//! exactly one device from the pool; the claim is released when the
//! [`ClaimedDevice`] handle is dropped.
//!
//! The pool lock protects only the claim table. Signature reads and
//! comparisons run outside any lock; a candidate that gets claimed
//! concurrently between the snapshot and the claim attempt is skipped.

use crate::{BlockDevice, DeviceError};
use blfs_types::{SECTOR_SHIFT, SIG_MAX_COMPONENTS};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// One expected byte pattern at a byte offset.
///
/// A negative offset is relative to the device end: `-512` addresses the
/// last 512 bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignatureComponent {
    pub offset: i64,
    pub expected: Vec<u8>,
}

/// Ordered set of components; all must match for a device to be accepted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signature {
    pub components: Vec<SignatureComponent>,
}

impl Signature {
    #[must_use]
    pub fn new(components: Vec<SignatureComponent>) -> Self {
        debug_assert!(components.len() <= SIG_MAX_COMPONENTS);
        Self { components }
    }
}

/// Translate a possibly end-relative component offset into an absolute byte
/// offset on a device of `len` bytes. `None` if the offset falls outside the
/// device.
fn resolve_offset(len: u64, offset: i64) -> Option<u64> {
    let abs = if offset < 0 {
        len.checked_sub(offset.unsigned_abs())?
    } else {
        u64::try_from(offset).ok()?
    };
    (abs < len).then_some(abs)
}

/// Compare a signature against one device, reading outside any lock.
///
/// Known limitation, inherited from the wire format and kept as-is: each
/// component is compared only within the single storage block its offset
/// falls in. A component whose byte range straddles a block boundary is
/// compared up to the block end and the remainder is ignored.
pub fn signature_matches(
    device: &dyn BlockDevice,
    signature: &Signature,
) -> Result<bool, DeviceError> {
    let len = device.len_bytes();
    let block_size = u64::from(device.block_size());

    for component in &signature.components {
        let Some(abs) = resolve_offset(len, component.offset) else {
            return Ok(false);
        };
        let block_index = abs / block_size;
        let in_block = usize::try_from(abs % block_size).map_err(|_| DeviceError::OutOfBounds {
            offset: abs,
            len: component.expected.len(),
            device_len: len,
        })?;

        let block = device.read_block(block_index)?;
        let avail = component.expected.len().min(block.len() - in_block);
        if block[in_block..in_block + avail] != component.expected[..avail] {
            return Ok(false);
        }
    }
    Ok(true)
}

struct PoolEntry {
    device: Arc<dyn BlockDevice>,
    claimed: bool,
}

/// Pool of currently visible, unclaimed local block devices.
///
/// Cheaply cloneable; clones share the claim table.
#[derive(Clone)]
pub struct DevicePool {
    inner: Arc<Mutex<Vec<PoolEntry>>>,
}

impl fmt::Debug for DevicePool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let entries = self.inner.lock();
        f.debug_struct("DevicePool")
            .field("devices", &entries.len())
            .field(
                "claimed",
                &entries.iter().filter(|entry| entry.claimed).count(),
            )
            .finish()
    }
}

impl DevicePool {
    /// Build a pool from the enumerator's device list; all start unclaimed.
    #[must_use]
    pub fn new(devices: Vec<Arc<dyn BlockDevice>>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(
                devices
                    .into_iter()
                    .map(|device| PoolEntry {
                        device,
                        claimed: false,
                    })
                    .collect(),
            )),
        }
    }

    /// Number of devices not currently claimed.
    #[must_use]
    pub fn unclaimed_len(&self) -> usize {
        self.inner
            .lock()
            .iter()
            .filter(|entry| !entry.claimed)
            .count()
    }

    /// Claim the first unclaimed device matching `signature`, in pool order.
    ///
    /// Devices that fail a component, or fail to read during the probe, are
    /// left available and the next candidate is tried. Exhausting the pool
    /// is `NoMatchingSignature`.
    pub fn claim_matching(&self, signature: &Signature) -> Result<ClaimedDevice, DeviceError> {
        let candidates: Vec<(usize, Arc<dyn BlockDevice>)> = {
            let entries = self.inner.lock();
            entries
                .iter()
                .enumerate()
                .filter(|(_, entry)| !entry.claimed)
                .map(|(slot, entry)| (slot, Arc::clone(&entry.device)))
                .collect()
        };

        for (slot, device) in candidates {
            let matched = match signature_matches(device.as_ref(), signature) {
                Ok(matched) => matched,
                Err(err) => {
                    tracing::warn!(slot, error = %err, "device read failed during signature probe");
                    false
                }
            };
            if !matched {
                continue;
            }

            let mut entries = self.inner.lock();
            if entries[slot].claimed {
                // Lost a race with another claimant; keep scanning.
                continue;
            }
            entries[slot].claimed = true;
            drop(entries);

            let size_sectors = device.len_bytes() >> SECTOR_SHIFT;
            tracing::debug!(slot, size_sectors, "claimed device for simple volume");
            return Ok(ClaimedDevice {
                slot,
                size_sectors,
                device,
                pool: self.clone(),
            });
        }

        Err(DeviceError::NoMatchingSignature)
    }

    fn release(&self, slot: usize) {
        let mut entries = self.inner.lock();
        if let Some(entry) = entries.get_mut(slot) {
            entry.claimed = false;
        }
    }
}

/// Exclusive claim on one pool device.
///
/// Dropping the handle returns the device to the unclaimed pool, so a
/// partially resolved topology cannot leak claims on its failure path.
pub struct ClaimedDevice {
    slot: usize,
    size_sectors: u64,
    device: Arc<dyn BlockDevice>,
    pool: DevicePool,
}

impl ClaimedDevice {
    #[must_use]
    pub fn slot(&self) -> usize {
        self.slot
    }

    /// Device size in whole sectors.
    #[must_use]
    pub fn size_sectors(&self) -> u64 {
        self.size_sectors
    }

    #[must_use]
    pub fn device(&self) -> &Arc<dyn BlockDevice> {
        &self.device
    }
}

impl fmt::Debug for ClaimedDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClaimedDevice")
            .field("slot", &self.slot)
            .field("size_sectors", &self.size_sectors)
            .finish_non_exhaustive()
    }
}

impl Drop for ClaimedDevice {
    fn drop(&mut self) {
        self.pool.release(self.slot);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemBlockDevice;

    fn device_with_magic(magic: &[u8], at: usize, len: usize) -> Arc<dyn BlockDevice> {
        let mut bytes = vec![0_u8; len];
        bytes[at..at + magic.len()].copy_from_slice(magic);
        Arc::new(MemBlockDevice::from_bytes(bytes, 512).expect("device"))
    }

    fn magic_signature(magic: &[u8], offset: i64) -> Signature {
        Signature::new(vec![SignatureComponent {
            offset,
            expected: magic.to_vec(),
        }])
    }

    #[test]
    fn matching_claims_exactly_one_device() {
        let pool = DevicePool::new(vec![
            device_with_magic(b"other", 0, 4096),
            device_with_magic(b"BLFSv1", 512, 4096),
            device_with_magic(b"third", 0, 4096),
        ]);

        let signature = magic_signature(b"BLFSv1", 512);
        let claimed = pool.claim_matching(&signature).expect("one match");
        assert_eq!(claimed.slot(), 1);
        assert_eq!(claimed.size_sectors(), 8);
        assert_eq!(pool.unclaimed_len(), 2);

        // The pool is depleted for this signature now.
        assert!(matches!(
            pool.claim_matching(&signature),
            Err(DeviceError::NoMatchingSignature)
        ));
    }

    #[test]
    fn dropping_claim_returns_device_to_pool() {
        let pool = DevicePool::new(vec![device_with_magic(b"BLFSv1", 0, 2048)]);
        let signature = magic_signature(b"BLFSv1", 0);

        let claimed = pool.claim_matching(&signature).expect("match");
        assert_eq!(pool.unclaimed_len(), 0);
        drop(claimed);
        assert_eq!(pool.unclaimed_len(), 1);
        assert!(pool.claim_matching(&signature).is_ok());
    }

    #[test]
    fn end_relative_offsets_match_device_tail() {
        let pool = DevicePool::new(vec![device_with_magic(b"TAIL", 4096 - 512, 4096)]);
        let signature = magic_signature(b"TAIL", -512);
        let claimed = pool.claim_matching(&signature).expect("tail match");
        assert_eq!(claimed.slot(), 0);
    }

    #[test]
    fn offset_past_device_end_is_a_non_match() {
        let pool = DevicePool::new(vec![device_with_magic(b"X", 0, 1024)]);
        assert!(matches!(
            pool.claim_matching(&magic_signature(b"X", 8192)),
            Err(DeviceError::NoMatchingSignature)
        ));
        assert!(matches!(
            pool.claim_matching(&magic_signature(b"X", -8192)),
            Err(DeviceError::NoMatchingSignature)
        ));
        // The failed probes left the device available.
        assert_eq!(pool.unclaimed_len(), 1);
    }

    #[test]
    fn all_components_must_match() {
        let mut bytes = vec![0_u8; 4096];
        bytes[0..4].copy_from_slice(b"HEAD");
        let device: Arc<dyn BlockDevice> =
            Arc::new(MemBlockDevice::from_bytes(bytes, 512).expect("device"));
        let pool = DevicePool::new(vec![device]);

        let signature = Signature::new(vec![
            SignatureComponent {
                offset: 0,
                expected: b"HEAD".to_vec(),
            },
            SignatureComponent {
                offset: 2048,
                expected: b"MISSING".to_vec(),
            },
        ]);
        assert!(matches!(
            pool.claim_matching(&signature),
            Err(DeviceError::NoMatchingSignature)
        ));
    }

    #[test]
    fn straddling_component_compares_in_block_prefix_only() {
        // Component starts 2 bytes before a block boundary; only those two
        // bytes participate in the comparison.
        let mut bytes = vec![0_u8; 4096];
        bytes[510] = b'A';
        bytes[511] = b'B';
        // Bytes 512.. deliberately do NOT contain the component tail.
        let device: Arc<dyn BlockDevice> =
            Arc::new(MemBlockDevice::from_bytes(bytes, 512).expect("device"));

        let matched = signature_matches(
            device.as_ref(),
            &Signature::new(vec![SignatureComponent {
                offset: 510,
                expected: b"ABCD".to_vec(),
            }]),
        )
        .expect("probe");
        assert!(matched, "comparison is truncated at the block boundary");
    }
}
