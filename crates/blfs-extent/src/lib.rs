#![forbid(unsafe_code)]
//! Per-layout extent map: which byte ranges of a file are backed by real
//! data on the meta-device, are holes, or must be read from an older copy.
//!
//! The map is consulted concurrently by layout-response handlers inserting
//! extents, I/O dispatch reading it, and segment teardown clearing it. The
//! lock is short-held and never held across device I/O; returned extents
//! are pinned by `Arc` clone, so an extent referenced by an in-flight I/O
//! survives a concurrent `clear` until the completion drops its pin.

use blfs_types::{Cursor, DecodeError};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;

/// Extent-layer failure.
#[derive(Debug, Error)]
pub enum ExtentError {
    #[error(transparent)]
    Decode(#[from] DecodeError),

    /// More than two extents cover one sector, or two cover it without
    /// exactly one being `ReadOnly`. Not expected from well-formed input;
    /// rejected rather than guessing server intent.
    #[error("invalid extent overlap at sector {sector}")]
    InvalidOverlap { sector: u64 },
}

/// Data-validity state of an extent, as carried on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExtentState {
    /// Mapped and valid for reads and writes.
    ReadWrite,
    /// Mapped, valid for reads only; the COW shadow under a newer
    /// allocation.
    ReadOnly,
    /// Mapped but not yet containing valid data.
    Invalid,
    /// Unmapped hole.
    None,
}

impl ExtentState {
    pub fn from_wire(value: u32) -> Result<Self, DecodeError> {
        match value {
            0 => Ok(Self::ReadWrite),
            1 => Ok(Self::ReadOnly),
            2 => Ok(Self::Invalid),
            3 => Ok(Self::None),
            value => Err(DecodeError::InvalidExtentState { value }),
        }
    }

    #[must_use]
    pub fn to_wire(self) -> u32 {
        match self {
            Self::ReadWrite => 0,
            Self::ReadOnly => 1,
            Self::Invalid => 2,
            Self::None => 3,
        }
    }
}

/// One contiguous mapping from file sectors to meta-device sectors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Extent {
    /// First file sector covered.
    pub file_offset: u64,
    /// Length in sectors.
    pub length: u64,
    /// First meta-device sector backing the range.
    pub volume_offset: u64,
    pub state: ExtentState,
}

impl Extent {
    /// One past the last file sector covered.
    #[must_use]
    pub fn end(&self) -> u64 {
        self.file_offset.saturating_add(self.length)
    }

    #[must_use]
    pub fn contains(&self, sector: u64) -> bool {
        sector >= self.file_offset && sector < self.end()
    }
}

/// Lookup result: at most one primary and at most one `ReadOnly` shadow.
///
/// The contained `Arc`s are the pins; dropping them releases the extents.
#[derive(Debug, Clone)]
pub struct ExtentHit {
    pub primary: Arc<Extent>,
    pub shadow: Option<Arc<Extent>>,
}

/// Ordered collection of extents for one open layout segment.
#[derive(Debug, Default)]
pub struct ExtentMap {
    inner: Mutex<Vec<Arc<Extent>>>,
}

impl ExtentMap {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    /// Insert an extent, keeping the list ordered by `file_offset`
    /// (insertion order breaks ties arbitrarily).
    ///
    /// Overlap beyond the two-extent-per-byte invariant is not checked
    /// here; input comes from a validated wire decode and the invariant is
    /// enforced at `find` time.
    pub fn insert(&self, extent: Extent) {
        let mut extents = self.inner.lock();
        let at = extents.partition_point(|existing| existing.file_offset <= extent.file_offset);
        extents.insert(at, Arc::new(extent));
    }

    /// Find the extents covering `sector`, pinning them before the lock is
    /// released.
    ///
    /// Among up to two candidates the non-`ReadOnly` one is the primary;
    /// a second, `ReadOnly` candidate is the shadow. Three candidates, or
    /// two with the wrong state mix, violate the map invariant.
    pub fn find(&self, sector: u64) -> Result<Option<ExtentHit>, ExtentError> {
        let extents = self.inner.lock();
        let mut covering: Vec<&Arc<Extent>> = Vec::with_capacity(2);
        for extent in extents.iter() {
            if extent.file_offset > sector {
                break;
            }
            if extent.contains(sector) {
                covering.push(extent);
            }
        }

        match covering.as_slice() {
            [] => Ok(None),
            [only] => Ok(Some(ExtentHit {
                primary: Arc::clone(only),
                shadow: None,
            })),
            [first, second] => {
                let (primary, shadow) = match (first.state, second.state) {
                    (ExtentState::ReadOnly, other) if other != ExtentState::ReadOnly => {
                        (second, first)
                    }
                    (other, ExtentState::ReadOnly) if other != ExtentState::ReadOnly => {
                        (first, second)
                    }
                    _ => return Err(ExtentError::InvalidOverlap { sector }),
                };
                Ok(Some(ExtentHit {
                    primary: Arc::clone(primary),
                    shadow: Some(Arc::clone(shadow)),
                }))
            }
            _ => Err(ExtentError::InvalidOverlap { sector }),
        }
    }

    /// Unlink and release every extent. Extents pinned by in-flight I/O
    /// survive until those pins drop.
    pub fn clear(&self) {
        let drained: Vec<Arc<Extent>> = {
            let mut extents = self.inner.lock();
            extents.drain(..).collect()
        };
        tracing::debug!(extents = drained.len(), "cleared extent map");
        drop(drained);
    }
}

/// Decode a layout-extent response: `[root_id][count]` then fixed records.
///
/// All-or-nothing: any malformed field discards every extent from the
/// response. Sector alignment is re-checked per field.
pub fn decode_layout_extents(data: &[u8]) -> Result<(u32, Vec<Extent>), ExtentError> {
    let mut cursor = Cursor::new(data);
    let root_id = cursor.read_u32()?;
    let count = cursor.read_u32()?;

    let mut extents = Vec::new();
    for _ in 0..count {
        let file_offset = cursor.read_sector("extent.file_offset")?;
        let length = cursor.read_sector("extent.length")?;
        let volume_offset = cursor.read_sector("extent.volume_offset")?;
        let state = ExtentState::from_wire(cursor.read_u32()?)?;
        extents.push(Extent {
            file_offset,
            length,
            volume_offset,
            state,
        });
    }
    cursor.finish()?;

    Ok((root_id, extents))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn extent(file_offset: u64, length: u64, volume_offset: u64, state: ExtentState) -> Extent {
        Extent {
            file_offset,
            length,
            volume_offset,
            state,
        }
    }

    fn encode(root_id: u32, records: &[(u64, u64, u64, u32)]) -> Vec<u8> {
        let mut out = Vec::new();
        out.extend_from_slice(&root_id.to_be_bytes());
        out.extend_from_slice(&(u32::try_from(records.len()).expect("count")).to_be_bytes());
        for (file_offset, length, volume_offset, state) in records {
            out.extend_from_slice(&file_offset.to_be_bytes());
            out.extend_from_slice(&length.to_be_bytes());
            out.extend_from_slice(&volume_offset.to_be_bytes());
            out.extend_from_slice(&state.to_be_bytes());
        }
        out
    }

    #[test]
    fn find_single_extent() {
        let map = ExtentMap::new();
        map.insert(extent(0, 8, 100, ExtentState::ReadWrite));
        map.insert(extent(16, 8, 200, ExtentState::ReadWrite));

        let hit = map.find(3).expect("no overlap").expect("covered");
        assert_eq!(hit.primary.volume_offset, 100);
        assert!(hit.shadow.is_none());

        assert!(map.find(8).expect("no overlap").is_none(), "gap is a miss");
        assert!(map.find(100).expect("no overlap").is_none());
    }

    #[test]
    fn shadow_is_always_read_only() {
        let map = ExtentMap::new();
        // Older, still-valid data underneath a not-yet-filled allocation.
        map.insert(extent(0, 8, 100, ExtentState::ReadOnly));
        map.insert(extent(0, 8, 300, ExtentState::Invalid));

        let hit = map.find(2).expect("valid overlap").expect("covered");
        assert_eq!(hit.primary.state, ExtentState::Invalid);
        assert_eq!(hit.primary.volume_offset, 300);
        let shadow = hit.shadow.expect("shadow present");
        assert_eq!(shadow.state, ExtentState::ReadOnly);
        assert_eq!(shadow.volume_offset, 100);
    }

    #[test]
    fn insertion_order_does_not_matter_for_shadow_pairing() {
        let map = ExtentMap::new();
        map.insert(extent(0, 8, 300, ExtentState::Invalid));
        map.insert(extent(0, 8, 100, ExtentState::ReadOnly));

        let hit = map.find(7).expect("valid overlap").expect("covered");
        assert_eq!(hit.primary.state, ExtentState::Invalid);
        assert_eq!(
            hit.shadow.expect("shadow").state,
            ExtentState::ReadOnly
        );
    }

    #[test]
    fn two_non_read_only_extents_are_rejected() {
        let map = ExtentMap::new();
        map.insert(extent(0, 8, 100, ExtentState::ReadWrite));
        map.insert(extent(4, 8, 200, ExtentState::ReadWrite));

        assert!(matches!(
            map.find(5),
            Err(ExtentError::InvalidOverlap { sector: 5 })
        ));
    }

    #[test]
    fn third_overlapping_extent_is_rejected() {
        let map = ExtentMap::new();
        map.insert(extent(0, 8, 100, ExtentState::ReadOnly));
        map.insert(extent(0, 8, 200, ExtentState::Invalid));
        map.insert(extent(0, 8, 300, ExtentState::ReadWrite));

        assert!(matches!(
            map.find(0),
            Err(ExtentError::InvalidOverlap { sector: 0 })
        ));
    }

    #[test]
    fn pinned_extent_survives_clear() {
        let map = ExtentMap::new();
        map.insert(extent(0, 8, 100, ExtentState::ReadWrite));

        let hit = map.find(0).expect("find").expect("covered");
        map.clear();
        assert!(map.is_empty());
        // The pin still holds the extent's storage.
        assert_eq!(hit.primary.volume_offset, 100);
        assert_eq!(Arc::strong_count(&hit.primary), 1);
    }

    #[test]
    fn decode_round_trip_populates_map() {
        let bytes = encode(
            7,
            &[
                (0, 8 * 512, 100 * 512, 0),
                (8 * 512, 8 * 512, 200 * 512, 3),
            ],
        );
        let (root_id, extents) = decode_layout_extents(&bytes).expect("decode");
        assert_eq!(root_id, 7);
        assert_eq!(extents.len(), 2);
        assert_eq!(extents[0].file_offset, 0);
        assert_eq!(extents[0].length, 8);
        assert_eq!(extents[0].volume_offset, 100);
        assert_eq!(extents[0].state, ExtentState::ReadWrite);
        assert_eq!(extents[1].state, ExtentState::None);

        let map = ExtentMap::new();
        for extent in extents {
            map.insert(extent);
        }
        assert_eq!(map.len(), 2);
    }

    #[test]
    fn misaligned_file_offset_discards_whole_response() {
        // Low 9 bits set on the second record's file_offset.
        let bytes = encode(
            7,
            &[(0, 8 * 512, 100 * 512, 0), (0x1FF, 8 * 512, 200 * 512, 0)],
        );
        let err = decode_layout_extents(&bytes).expect_err("misaligned");
        assert!(matches!(
            err,
            ExtentError::Decode(DecodeError::MisalignedSector {
                field: "extent.file_offset",
                value: 0x1FF,
            })
        ));
    }

    #[test]
    fn invalid_state_discards_whole_response() {
        let bytes = encode(7, &[(0, 8 * 512, 100 * 512, 9)]);
        assert!(matches!(
            decode_layout_extents(&bytes),
            Err(ExtentError::Decode(DecodeError::InvalidExtentState {
                value: 9
            }))
        ));
    }

    #[test]
    fn truncated_extent_list_fails() {
        let bytes = encode(7, &[(0, 8 * 512, 100 * 512, 0)]);
        for cut in 0..bytes.len() {
            assert!(
                decode_layout_extents(&bytes[..cut]).is_err(),
                "prefix of {cut} bytes decoded"
            );
        }
    }

    #[test]
    fn trailing_bytes_fail() {
        let mut bytes = encode(7, &[(0, 8 * 512, 100 * 512, 0)]);
        bytes.extend_from_slice(&[0, 0]);
        assert!(matches!(
            decode_layout_extents(&bytes),
            Err(ExtentError::Decode(DecodeError::TrailingBytes {
                remaining: 2
            }))
        ));
    }
}
