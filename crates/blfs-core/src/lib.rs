#![forbid(unsafe_code)]
//! Mount context and layout lifecycle for the block-layout client.
//!
//! This crate ties the workspace together: it resolves a device-list
//! response into a live [`MountContext`], tracks per-file layout segments
//! and their extent maps, routes page-list I/O through the dispatcher, and
//! converts every crate-local error into the unified [`BlfsError`] at this
//! boundary.
//!
//! The surrounding filesystem client owns the protocol; this crate only
//! answers "can this request be serviced against local storage, and if so,
//! do it". Anything it cannot service comes back as a fallback disposition,
//! never an error.

use blfs_device::{DeviceError, DevicePool, VolumeManager};
use blfs_error::BlfsError;
use blfs_extent::{ExtentError, ExtentMap, decode_layout_extents};
use blfs_io::Dispatcher;
use blfs_topology::{MetaDevice, TopologyError, decode_device_list};
use blfs_types::DecodeError;
use parking_lot::Mutex;
use std::sync::Arc;

pub use blfs_error::Result;
pub use blfs_io::{
    DispatchStats, ReadCompletion, ReadDisposition, WriteCompletion, WriteDisposition,
};

// ── error boundary ──────────────────────────────────────────────────────────

/// Convert a wire decode failure into the unified error.
///
/// Every decode variant collapses to `Decode`; the variant message is
/// preserved in the detail string. This is the crate-boundary conversion
/// described in the `blfs-error` taxonomy.
#[must_use]
pub fn decode_error_to_blfs(err: &DecodeError) -> BlfsError {
    BlfsError::Decode(err.to_string())
}

/// Convert a device-layer failure into the unified error.
#[must_use]
pub fn device_error_to_blfs(err: DeviceError) -> BlfsError {
    match err {
        DeviceError::Io(io) => BlfsError::Io(io),
        DeviceError::NoMatchingSignature => BlfsError::NoMatchingSignature,
        DeviceError::ClaimFailed { detail } => BlfsError::ClaimFailed(detail),
        DeviceError::CompositeCreateFailed { detail } => BlfsError::CompositeCreateFailed(detail),
        err @ DeviceError::OutOfBounds { .. } => {
            BlfsError::Io(std::io::Error::other(err.to_string()))
        }
    }
}

/// Convert a topology-resolution failure into the unified error.
#[must_use]
pub fn topology_error_to_blfs(err: TopologyError) -> BlfsError {
    match err {
        TopologyError::Decode(err) => decode_error_to_blfs(&err),
        TopologyError::Device(err) => device_error_to_blfs(err),
    }
}

/// Convert an extent-layer failure into the unified error.
#[must_use]
pub fn extent_error_to_blfs(err: ExtentError) -> BlfsError {
    match err {
        ExtentError::Decode(err) => decode_error_to_blfs(&err),
        ExtentError::InvalidOverlap { sector } => BlfsError::InvalidOverlap { sector },
    }
}

// ── layout lifecycle ────────────────────────────────────────────────────────

/// One granted layout segment: a decoded batch of extents over the
/// meta-device.
///
/// Allocation decodes a layout-extent response into a fresh map; freeing
/// clears the map, though extents pinned by in-flight I/O survive until
/// their completions run.
#[derive(Debug)]
pub struct LayoutSegment {
    root_id: u32,
    map: ExtentMap,
}

impl LayoutSegment {
    /// Decode a layout-extent response into a new segment. All-or-nothing:
    /// a malformed response yields an error and no segment.
    pub fn from_wire(data: &[u8]) -> Result<Self> {
        let (root_id, extents) = decode_layout_extents(data).map_err(extent_error_to_blfs)?;
        let map = ExtentMap::new();
        for extent in extents {
            map.insert(extent);
        }
        tracing::debug!(root_id, extents = map.len(), "allocated layout segment");
        Ok(Self { root_id, map })
    }

    /// Root device id this segment's extents are expressed against.
    #[must_use]
    pub fn root_id(&self) -> u32 {
        self.root_id
    }

    #[must_use]
    pub fn map(&self) -> &ExtentMap {
        &self.map
    }

    #[must_use]
    pub fn extent_count(&self) -> usize {
        self.map.len()
    }

    /// Release every extent in this segment. Subsequent lookups miss and
    /// the dispatcher falls back.
    pub fn free(&self) {
        self.map.clear();
    }
}

/// Per-file collection of layout segments.
#[derive(Debug, Default)]
pub struct LayoutFile {
    segments: Mutex<Vec<Arc<LayoutSegment>>>,
}

impl LayoutFile {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Decode and attach a layout-extent response as a new segment.
    pub fn add_segment(&self, data: &[u8]) -> Result<Arc<LayoutSegment>> {
        let segment = Arc::new(LayoutSegment::from_wire(data)?);
        self.segments.lock().push(Arc::clone(&segment));
        Ok(segment)
    }

    #[must_use]
    pub fn segments(&self) -> Vec<Arc<LayoutSegment>> {
        self.segments.lock().clone()
    }

    /// Free and detach every segment.
    pub fn free_all(&self) {
        let detached: Vec<Arc<LayoutSegment>> = {
            let mut segments = self.segments.lock();
            segments.drain(..).collect()
        };
        for segment in &detached {
            segment.free();
        }
    }
}

/// Outcome of a commit request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitDisposition {
    /// Commit travels the normal protocol path.
    Fallback,
}

// ── mount context ───────────────────────────────────────────────────────────

/// Per-mount block-layout state: the resolved meta-device and the I/O
/// dispatcher over it.
///
/// Dropping the context tears the mount down: the composite storage object
/// is removed and every physical device claim is released.
#[derive(Debug)]
pub struct MountContext {
    meta: Arc<MetaDevice>,
    dispatcher: Dispatcher,
}

impl MountContext {
    /// Resolve a device-list response against the local device pool and
    /// bring up the meta-device.
    ///
    /// All-or-nothing: on any failure every device claimed during decoding
    /// is released and no context exists. A `NoMatchingSignature` error
    /// means the storage is simply not visible from this client; the caller
    /// proceeds without layout acceleration.
    pub fn initialize(
        device_list: &[u8],
        pool: &DevicePool,
        manager: Arc<dyn VolumeManager>,
        composite_name: &str,
    ) -> Result<Self> {
        let set = decode_device_list(device_list, pool).map_err(topology_error_to_blfs)?;
        let meta = Arc::new(
            MetaDevice::build(set, manager, composite_name).map_err(topology_error_to_blfs)?,
        );
        tracing::info!(
            composite_name,
            size_sectors = meta.size_sectors(),
            "block-layout mount initialized"
        );
        Ok(Self {
            dispatcher: Dispatcher::new(Arc::clone(&meta)),
            meta,
        })
    }

    #[must_use]
    pub fn meta(&self) -> &Arc<MetaDevice> {
        &self.meta
    }

    #[must_use]
    pub fn size_sectors(&self) -> u64 {
        self.meta.size_sectors()
    }

    #[must_use]
    pub fn stats(&self) -> DispatchStats {
        self.dispatcher.stats()
    }

    /// Service a read against a segment's extents, or hand it back for the
    /// protocol path.
    pub fn read_pagelist(
        &self,
        segment: &LayoutSegment,
        offset: u64,
        len: usize,
        completion: ReadCompletion,
    ) -> ReadDisposition {
        self.dispatcher
            .read_pagelist(segment.map(), offset, len, completion)
    }

    /// Service a write against a segment's extents, or hand it back for the
    /// protocol path.
    pub fn write_pagelist(
        &self,
        segment: &LayoutSegment,
        offset: u64,
        data: &[u8],
        completion: WriteCompletion,
    ) -> WriteDisposition {
        self.dispatcher
            .write_pagelist(segment.map(), offset, data, completion)
    }

    /// Commit dirty layout state. Always the protocol path in this design:
    /// the client never writes layout metadata to the storage directly.
    #[must_use]
    pub fn commit(&self, _segment: &LayoutSegment) -> CommitDisposition {
        CommitDisposition::Fallback
    }
}
