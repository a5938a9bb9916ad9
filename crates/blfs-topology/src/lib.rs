#![forbid(unsafe_code)]
//! Volume-topology decoding and resolution.
//!
//! Parses the wire-encoded volume list into an ordered array of resolved
//! [`Volume`] records, binding simple leaves to physical devices through the
//! signature matcher, and flattens the result into a single addressable
//! [`MetaDevice`].
//!
//! Child references in the wire format may only point at volumes decoded
//! earlier in the same list, so the structure is acyclic and resolvable in
//! one left-to-right pass. Decoding is all-or-nothing: any failure releases
//! every device claimed so far and discards the partial array.

use blfs_device::{ClaimedDevice, DeviceError, DevicePool, Signature, SignatureComponent};
use blfs_types::{Cursor, DEVICE_ID_SIZE, DecodeError, DeviceId, SIG_MAX_COMPONENTS};
use serde::{Deserialize, Serialize};
use thiserror::Error;

mod meta;

pub use meta::{MetaDevice, Segment};

/// Wire type tag: simple volume bound to one physical device.
pub const VOLUME_SIMPLE: u32 = 0;
/// Wire type tag: byte-range slice of another volume.
pub const VOLUME_SLICE: u32 = 1;
/// Wire type tag: concatenation of volumes.
pub const VOLUME_CONCAT: u32 = 2;
/// Wire type tag: striping across volumes.
pub const VOLUME_STRIPE: u32 = 3;

/// Topology-resolution failure: either the response bytes are malformed or
/// a device-layer step (signature match, claim) failed.
#[derive(Debug, Error)]
pub enum TopologyError {
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error(transparent)]
    Device(#[from] DeviceError),
}

/// One resolved volume record. All sizes, offsets, and lengths are in
/// sectors; child references are indices into the same volume array,
/// strictly less than the referencing volume's own index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Volume {
    /// Leaf bound to a claimed physical device. `leaf` indexes the
    /// [`VolumeSet`]'s claimed-device list.
    Simple { leaf: usize, size: u64 },
    /// Window of `length` sectors starting `offset` sectors into `parent`.
    Slice {
        parent: usize,
        offset: u64,
        length: u64,
    },
    /// Children laid out end to end.
    Concat { children: Vec<usize>, size: u64 },
    /// Round-robin striping over children in units of `unit` sectors.
    Stripe {
        children: Vec<usize>,
        unit: u64,
        size: u64,
    },
}

impl Volume {
    /// Addressable size of this volume in sectors.
    #[must_use]
    pub fn size_sectors(&self) -> u64 {
        match self {
            Self::Simple { size, .. } | Self::Concat { size, .. } | Self::Stripe { size, .. } => {
                *size
            }
            Self::Slice { length, .. } => *length,
        }
    }
}

/// The resolved volume array plus the devices its simple leaves claimed.
///
/// Dropping the set releases every claim.
#[derive(Debug)]
pub struct VolumeSet {
    volumes: Vec<Volume>,
    leaves: Vec<ClaimedDevice>,
}

impl VolumeSet {
    #[must_use]
    pub fn volumes(&self) -> &[Volume] {
        &self.volumes
    }

    #[must_use]
    pub fn leaves(&self) -> &[ClaimedDevice] {
        &self.leaves
    }

    /// Index of the topology root: the last volume in the list.
    #[must_use]
    pub fn root_index(&self) -> Option<usize> {
        self.volumes.len().checked_sub(1)
    }
}

/// Resolve a child device id against the volumes decoded so far.
///
/// Linear backward scan; a miss means the record references a volume that
/// either does not exist or appears later in the list.
fn resolve_child(
    ids: &[DeviceId],
    child: DeviceId,
    index: usize,
) -> Result<usize, DecodeError> {
    ids.iter()
        .rposition(|id| *id == child)
        .ok_or(DecodeError::ForwardOrMissingReference {
            index,
            device_id: child,
        })
}

fn decode_signature(cursor: &mut Cursor<'_>, index: usize) -> Result<Signature, DecodeError> {
    let count = cursor.read_u32()?;
    if count == 0 {
        return Err(DecodeError::EmptySignature { index });
    }
    if count as usize > SIG_MAX_COMPONENTS {
        return Err(DecodeError::OversizedSignature {
            count,
            max: SIG_MAX_COMPONENTS,
        });
    }

    let mut components = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let offset = cursor.read_i64()?;
        let length = cursor.read_u32()?;
        let expected = cursor.read_opaque(length as usize)?.to_vec();
        components.push(SignatureComponent { offset, expected });
    }
    Ok(Signature::new(components))
}

/// Decode a device-list response and resolve it against the device pool.
///
/// Simple leaves claim their matching devices as they are decoded. On any
/// error the partially built set is dropped, which releases those claims;
/// nothing is retained.
pub fn decode_device_list(
    data: &[u8],
    pool: &DevicePool,
) -> Result<VolumeSet, TopologyError> {
    let mut cursor = Cursor::new(data);
    let num_volumes = cursor.read_u32()?;

    let mut volumes: Vec<Volume> = Vec::new();
    let mut ids: Vec<DeviceId> = Vec::new();
    let mut leaves: Vec<ClaimedDevice> = Vec::new();

    for index in 0..num_volumes as usize {
        let tag = cursor.read_u32()?;
        let id = cursor.read_device_id()?;

        let volume = match tag {
            VOLUME_SIMPLE => {
                let signature = decode_signature(&mut cursor, index)?;
                let claimed = pool.claim_matching(&signature)?;
                let size = claimed.size_sectors();
                leaves.push(claimed);
                Volume::Simple {
                    leaf: leaves.len() - 1,
                    size,
                }
            }
            VOLUME_SLICE => {
                let offset = cursor.read_sector("slice.offset")?;
                let length = cursor.read_sector("slice.length")?;
                let child = cursor.read_device_id()?;
                let parent = resolve_child(&ids, child, index)?;
                Volume::Slice {
                    parent,
                    offset,
                    length,
                }
            }
            VOLUME_CONCAT => {
                let children = decode_children(&mut cursor, &ids, index)?;
                let size = children
                    .iter()
                    .map(|child| volumes[*child].size_sectors())
                    .fold(0_u64, u64::saturating_add);
                Volume::Concat { children, size }
            }
            VOLUME_STRIPE => {
                let unit = cursor.read_sector("stripe.unit")?;
                if unit == 0 {
                    return Err(DecodeError::ZeroStripeUnit { index }.into());
                }
                let children = decode_children(&mut cursor, &ids, index)?;
                let size = children
                    .iter()
                    .map(|child| volumes[*child].size_sectors())
                    .fold(0_u64, u64::saturating_add);
                Volume::Stripe {
                    children,
                    unit,
                    size,
                }
            }
            tag => return Err(DecodeError::UnknownVolumeType { tag }.into()),
        };

        ids.push(id);
        volumes.push(volume);
    }

    cursor.finish()?;

    tracing::debug!(
        volumes = volumes.len(),
        leaves = leaves.len(),
        "decoded volume topology"
    );
    Ok(VolumeSet { volumes, leaves })
}

fn decode_children(
    cursor: &mut Cursor<'_>,
    ids: &[DeviceId],
    index: usize,
) -> Result<Vec<usize>, DecodeError> {
    let count = cursor.read_u32()?;
    if count == 0 {
        return Err(DecodeError::ZeroChildCount { index });
    }

    // The count is wire data; cap the reservation by what the buffer can
    // still hold so a forged count cannot drive a huge allocation.
    let mut children =
        Vec::with_capacity((count as usize).min(cursor.remaining() / DEVICE_ID_SIZE));
    for _ in 0..count {
        let child = cursor.read_device_id()?;
        children.push(resolve_child(ids, child, index)?);
    }
    Ok(children)
}
