#![forbid(unsafe_code)]
//! Extent-aware I/O dispatch.
//!
//! Given a requested file byte range, consults the segment's extent map and
//! either services the request against the meta-device (direct device I/O,
//! or synthesized zeros for unbacked reads) or hands the request back for
//! the normal protocol path.
//!
//! Fallback is not an error: a miss, a range spanning more than one extent,
//! and a request whose device mapping would exceed the transfer-descriptor
//! budget are all expected, silently handled signals. Completion callbacks
//! run exactly once per handled request and are returned un-invoked on
//! fallback; the extents pinned for a request are released when its
//! completion finishes.

use blfs_device::{BlockDevice, DeviceError};
use blfs_extent::{ExtentHit, ExtentMap, ExtentState};
use blfs_topology::MetaDevice;
use blfs_types::{SECTOR_MASK, byte_to_sector, covering_sectors, sectors_to_bytes};
use parking_lot::Mutex;
use std::ops::Range;
use std::sync::Arc;

/// Maximum per-request device segments; beyond this the request falls back
/// rather than failing.
pub const MAX_IO_SEGMENTS: usize = 16;

/// Completion callback for a read; receives the filled buffer.
pub type ReadCompletion = Box<dyn FnOnce(Result<Vec<u8>, DeviceError>) + Send>;
/// Completion callback for a write; receives the byte count written.
pub type WriteCompletion = Box<dyn FnOnce(Result<u64, DeviceError>) + Send>;

/// Outcome of dispatching a read.
pub enum ReadDisposition {
    /// Serviced locally; the completion has run exactly once.
    Handled,
    /// Use the normal protocol path. The completion is handed back
    /// un-invoked for the caller to re-drive.
    Fallback(ReadCompletion),
}

/// Outcome of dispatching a write.
pub enum WriteDisposition {
    Handled,
    Fallback(WriteCompletion),
}

/// Dispatch counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchStats {
    pub reads: u64,
    pub writes: u64,
    pub zero_fills: u64,
    pub fallbacks: u64,
    pub bytes_read: u64,
    pub bytes_written: u64,
}

/// Per-mount I/O dispatcher over one meta-device.
#[derive(Debug)]
pub struct Dispatcher {
    meta: Arc<MetaDevice>,
    stats: Mutex<DispatchStats>,
}

/// Where a redirected request lands on the meta-device.
struct Redirect {
    /// First meta-device sector backing the request.
    meta_sector: u64,
    /// Byte offset of the request within its first sector.
    sub_sector: u64,
    /// Sectors covering the request.
    sectors: u64,
}

enum Decision {
    Redirect(Redirect),
    ZeroFill,
    Fallback,
}

impl Dispatcher {
    #[must_use]
    pub fn new(meta: Arc<MetaDevice>) -> Self {
        Self {
            meta,
            stats: Mutex::new(DispatchStats::default()),
        }
    }

    #[must_use]
    pub fn stats(&self) -> DispatchStats {
        *self.stats.lock()
    }

    fn note_fallback(&self, op: &'static str, offset: u64, len: u64) {
        self.stats.lock().fallbacks += 1;
        tracing::debug!(op, offset, len, "falling back to the protocol path");
    }

    /// Apply the decision table to one request. The caller keeps `hit`
    /// alive until the I/O completes; its `Arc`s are the extent pins.
    fn decide(hit: &ExtentHit, start_sector: u64, sectors: u64, is_write: bool) -> Decision {
        let end_sector = start_sector.saturating_add(sectors);

        // Splitting a request across extents is not implemented.
        if hit.primary.end() < end_sector {
            return Decision::Fallback;
        }

        let target = match hit.primary.state {
            ExtentState::ReadWrite => &hit.primary,
            // ReadOnly holds the still-valid old copy; writes must not
            // touch it.
            ExtentState::ReadOnly => {
                if is_write {
                    return Decision::Fallback;
                }
                &hit.primary
            }
            ExtentState::Invalid | ExtentState::None => {
                if is_write {
                    return Decision::Fallback;
                }
                match &hit.shadow {
                    // Serve old data from under the pending allocation.
                    Some(shadow) if shadow.end() >= end_sector => shadow,
                    Some(_) => return Decision::Fallback,
                    None => return Decision::ZeroFill,
                }
            }
        };

        let delta = start_sector - target.file_offset;
        let Some(meta_sector) = target.volume_offset.checked_add(delta) else {
            return Decision::Fallback;
        };
        Decision::Redirect(Redirect {
            meta_sector,
            sub_sector: 0,
            sectors,
        })
    }

    fn lookup(&self, map: &ExtentMap, start_sector: u64) -> Option<ExtentHit> {
        match map.find(start_sector) {
            Ok(hit) => hit,
            Err(err) => {
                // A malformed overlap disables acceleration for this
                // request only.
                tracing::warn!(start_sector, error = %err, "extent lookup failed");
                None
            }
        }
    }

    /// Dispatch a read of `len` bytes at file byte `offset`.
    pub fn read_pagelist(
        &self,
        map: &ExtentMap,
        offset: u64,
        len: usize,
        completion: ReadCompletion,
    ) -> ReadDisposition {
        let Some(sectors) = covering_sectors(offset, len as u64) else {
            self.note_fallback("read", offset, len as u64);
            return ReadDisposition::Fallback(completion);
        };
        if sectors == 0 {
            completion(Ok(Vec::new()));
            return ReadDisposition::Handled;
        }

        let start_sector = byte_to_sector(offset);
        let Some(hit) = self.lookup(map, start_sector) else {
            self.note_fallback("read", offset, len as u64);
            return ReadDisposition::Fallback(completion);
        };

        match Self::decide(&hit, start_sector, sectors, false) {
            Decision::Fallback => {
                self.note_fallback("read", offset, len as u64);
                ReadDisposition::Fallback(completion)
            }
            Decision::ZeroFill => {
                // Unbacked read: synthesize zeros, no device I/O.
                let mut stats = self.stats.lock();
                stats.reads += 1;
                stats.zero_fills += 1;
                stats.bytes_read += len as u64;
                drop(stats);
                completion(Ok(vec![0_u8; len]));
                ReadDisposition::Handled
            }
            Decision::Redirect(mut redirect) => {
                redirect.sub_sector = offset & SECTOR_MASK;
                let Some(ops) = self.plan(&redirect, len as u64) else {
                    self.note_fallback("read", offset, len as u64);
                    return ReadDisposition::Fallback(completion);
                };

                let result = self.run_read(len, &ops);
                if result.is_ok() {
                    let mut stats = self.stats.lock();
                    stats.reads += 1;
                    stats.bytes_read += len as u64;
                }
                completion(result);
                // Pins released after the completion has run.
                drop(hit);
                ReadDisposition::Handled
            }
        }
    }

    /// Dispatch a write of `data` at file byte `offset`.
    pub fn write_pagelist(
        &self,
        map: &ExtentMap,
        offset: u64,
        data: &[u8],
        completion: WriteCompletion,
    ) -> WriteDisposition {
        let len = data.len() as u64;
        let Some(sectors) = covering_sectors(offset, len) else {
            self.note_fallback("write", offset, len);
            return WriteDisposition::Fallback(completion);
        };
        if sectors == 0 {
            completion(Ok(0));
            return WriteDisposition::Handled;
        }

        let start_sector = byte_to_sector(offset);
        let Some(hit) = self.lookup(map, start_sector) else {
            self.note_fallback("write", offset, len);
            return WriteDisposition::Fallback(completion);
        };

        match Self::decide(&hit, start_sector, sectors, true) {
            Decision::Fallback | Decision::ZeroFill => {
                self.note_fallback("write", offset, len);
                WriteDisposition::Fallback(completion)
            }
            Decision::Redirect(mut redirect) => {
                redirect.sub_sector = offset & SECTOR_MASK;
                let Some(ops) = self.plan(&redirect, len) else {
                    self.note_fallback("write", offset, len);
                    return WriteDisposition::Fallback(completion);
                };

                let result = self.run_write(data, &ops);
                if result.is_ok() {
                    let mut stats = self.stats.lock();
                    stats.writes += 1;
                    stats.bytes_written += len;
                }
                completion(result);
                drop(hit);
                WriteDisposition::Handled
            }
        }
    }

    /// Translate a redirect into per-leaf byte ranges.
    ///
    /// `None` is a request-construction failure (unmappable range or too
    /// many segments) and means fallback, not error.
    fn plan(&self, redirect: &Redirect, len: u64) -> Option<Vec<LeafOp>> {
        let segments = self.meta.map_segments(redirect.meta_sector, redirect.sectors)?;
        if segments.len() > MAX_IO_SEGMENTS {
            return None;
        }

        // The request occupies [sub_sector, sub_sector + len) within the
        // sector-aligned device window.
        let window_start = redirect.sub_sector;
        let window_end = window_start.checked_add(len)?;

        let mut ops = Vec::with_capacity(segments.len());
        let mut pos = 0_u64;
        for segment in segments {
            let seg_bytes = sectors_to_bytes(segment.sectors)?;
            let seg_start = pos;
            let seg_end = pos.checked_add(seg_bytes)?;
            pos = seg_end;

            let overlap_start = seg_start.max(window_start);
            let overlap_end = seg_end.min(window_end);
            if overlap_start >= overlap_end {
                continue;
            }

            let device_offset = sectors_to_bytes(segment.device_sector)?
                .checked_add(overlap_start - seg_start)?;
            ops.push(LeafOp {
                leaf: segment.leaf,
                device_offset,
                buf_offset: overlap_start - window_start,
                len: overlap_end - overlap_start,
            });
        }
        Some(ops)
    }

    /// Index range of one op within the request buffer, with the op's real
    /// device offset and length in the error if it does not fit.
    fn buf_range(&self, op: &LeafOp, buf_len: usize) -> Result<Range<usize>, DeviceError> {
        let start = usize::try_from(op.buf_offset).ok();
        let end = op
            .buf_offset
            .checked_add(op.len)
            .and_then(|end| usize::try_from(end).ok());
        match (start, end) {
            (Some(start), Some(end)) if end <= buf_len => Ok(start..end),
            _ => Err(DeviceError::OutOfBounds {
                offset: op.device_offset,
                len: usize::try_from(op.len).unwrap_or(usize::MAX),
                device_len: self.meta.leaf_device(op.leaf).len_bytes(),
            }),
        }
    }

    fn run_read(&self, len: usize, ops: &[LeafOp]) -> Result<Vec<u8>, DeviceError> {
        let mut out = vec![0_u8; len];
        for op in ops {
            let range = self.buf_range(op, out.len())?;
            self.meta
                .leaf_device(op.leaf)
                .read_exact_at(op.device_offset, &mut out[range])?;
        }
        Ok(out)
    }

    fn run_write(&self, data: &[u8], ops: &[LeafOp]) -> Result<u64, DeviceError> {
        for op in ops {
            let range = self.buf_range(op, data.len())?;
            self.meta
                .leaf_device(op.leaf)
                .write_all_at(op.device_offset, &data[range])?;
        }
        Ok(data.len() as u64)
    }
}

/// One device I/O against a single leaf.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct LeafOp {
    leaf: usize,
    device_offset: u64,
    /// Offset of this piece within the request buffer.
    buf_offset: u64,
    len: u64,
}
