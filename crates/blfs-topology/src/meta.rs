//! Meta-device: the flattened, linearly addressable view of a resolved
//! volume topology.
//!
//! Maps any root-relative sector to a specific leaf device and device
//! sector by iterative descent through the volume array. Construction
//! creates a uniquely named composite object through the host volume
//! manager and holds it for the life of the mount; dropping the meta-device
//! removes the composite object and releases every physical device claim.

use crate::{TopologyError, Volume, VolumeSet};
use blfs_device::{BlockDevice, CompositeHandle, DeviceError, VolumeManager};
use std::fmt;
use std::sync::Arc;

/// A contiguous run of sectors on one leaf device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment {
    /// Index into the claimed-device list.
    pub leaf: usize,
    /// First sector on the leaf device.
    pub device_sector: u64,
    /// Run length in sectors.
    pub sectors: u64,
}

/// One flattened block-storage object per mount.
pub struct MetaDevice {
    set: VolumeSet,
    root: usize,
    composite: Option<CompositeHandle>,
    manager: Arc<dyn VolumeManager>,
}

impl fmt::Debug for MetaDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MetaDevice")
            .field("volumes", &self.set.volumes().len())
            .field("root", &self.root)
            .field("size_sectors", &self.size_sectors())
            .field("composite", &self.composite)
            .finish_non_exhaustive()
    }
}

impl MetaDevice {
    /// Flatten a resolved volume set into a meta-device.
    ///
    /// Consumes the set; on failure it is dropped, which releases every
    /// device claim made during decoding.
    pub fn build(
        set: VolumeSet,
        manager: Arc<dyn VolumeManager>,
        name: &str,
    ) -> Result<Self, TopologyError> {
        let Some(root) = set.root_index() else {
            return Err(DeviceError::CompositeCreateFailed {
                detail: "empty volume topology".to_owned(),
            }
            .into());
        };

        let composite = manager.create(name)?;
        tracing::info!(
            name,
            volumes = set.volumes().len(),
            size_sectors = set.volumes()[root].size_sectors(),
            "built meta-device"
        );

        Ok(Self {
            set,
            root,
            composite: Some(composite),
            manager,
        })
    }

    /// Aggregate addressable size in sectors.
    #[must_use]
    pub fn size_sectors(&self) -> u64 {
        self.set.volumes()[self.root].size_sectors()
    }

    /// Device backing the given leaf index.
    #[must_use]
    pub fn leaf_device(&self, leaf: usize) -> &Arc<dyn BlockDevice> {
        self.set.leaves()[leaf].device()
    }

    /// Map one root-relative sector to its leaf device, returning the run of
    /// contiguously mapped sectors starting there. `None` if the sector is
    /// outside the meta-device.
    #[must_use]
    pub fn map_run(&self, sector: u64) -> Option<Segment> {
        let volumes = self.set.volumes();
        let mut index = self.root;
        let mut offset = sector;
        let mut contig = u64::MAX;

        loop {
            match &volumes[index] {
                Volume::Simple { leaf, size } => {
                    if offset >= *size {
                        return None;
                    }
                    return Some(Segment {
                        leaf: *leaf,
                        device_sector: offset,
                        sectors: contig.min(size - offset),
                    });
                }
                Volume::Slice {
                    parent,
                    offset: slice_offset,
                    length,
                } => {
                    if offset >= *length {
                        return None;
                    }
                    contig = contig.min(length - offset);
                    offset = offset.checked_add(*slice_offset)?;
                    index = *parent;
                }
                Volume::Concat { children, .. } => {
                    let mut found = None;
                    for child in children {
                        let child_size = volumes[*child].size_sectors();
                        if offset < child_size {
                            contig = contig.min(child_size - offset);
                            found = Some(*child);
                            break;
                        }
                        offset -= child_size;
                    }
                    index = found?;
                }
                Volume::Stripe {
                    children,
                    unit,
                    size,
                } => {
                    if offset >= *size {
                        return None;
                    }
                    let stripe_no = offset / unit;
                    let in_unit = offset % unit;
                    let n = children.len() as u64;
                    contig = contig.min(unit - in_unit);
                    index = children[usize::try_from(stripe_no % n).ok()?];
                    offset = (stripe_no / n).checked_mul(*unit)?.checked_add(in_unit)?;
                }
            }
        }
    }

    /// Map a sector range to per-leaf segments, merging adjacent runs that
    /// land contiguously on the same leaf. `None` if any part of the range
    /// is unmappable.
    #[must_use]
    pub fn map_segments(&self, start_sector: u64, sectors: u64) -> Option<Vec<Segment>> {
        let mut segments: Vec<Segment> = Vec::new();
        let mut cursor = start_sector;
        let mut remaining = sectors;

        while remaining > 0 {
            let run = self.map_run(cursor)?;
            let take = run.sectors.min(remaining);

            match segments.last_mut() {
                Some(last)
                    if last.leaf == run.leaf
                        && last.device_sector + last.sectors == run.device_sector =>
                {
                    last.sectors += take;
                }
                _ => segments.push(Segment {
                    leaf: run.leaf,
                    device_sector: run.device_sector,
                    sectors: take,
                }),
            }

            cursor += take;
            remaining -= take;
        }
        Some(segments)
    }
}

impl Drop for MetaDevice {
    fn drop(&mut self) {
        if let Some(handle) = self.composite.take() {
            if let Err(err) = self.manager.remove(&handle) {
                tracing::warn!(name = handle.name(), error = %err, "failed to remove composite object");
            }
        }
    }
}
