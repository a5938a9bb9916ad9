#![forbid(unsafe_code)]
//! End-to-end mount and I/O scenarios over in-memory devices.

use anyhow::{Context, Result, bail};
use blfs_core::{
    CommitDisposition, LayoutFile, MountContext, ReadCompletion, ReadDisposition,
    WriteCompletion, WriteDisposition,
};
use blfs_device::{BlockDevice, DevicePool, MemBlockDevice, MemVolumeManager, VolumeManager};
use blfs_error::BlfsError;
use parking_lot::Mutex;
use std::sync::Arc;

const SECTOR: u64 = 512;

// ── wire builders ───────────────────────────────────────────────────────────

fn pool_device(magic: &[u8], sectors: u64) -> Arc<dyn BlockDevice> {
    let mut bytes = vec![0_u8; usize::try_from(sectors * SECTOR).expect("size")];
    bytes[..magic.len()].copy_from_slice(magic);
    Arc::new(MemBlockDevice::from_bytes(bytes, 512).expect("device"))
}

fn id(seed: u8) -> [u8; 16] {
    [seed; 16]
}

fn simple_record(out: &mut Vec<u8>, id: [u8; 16], magic: &[u8]) {
    out.extend_from_slice(&0_u32.to_be_bytes());
    out.extend_from_slice(&id);
    out.extend_from_slice(&1_u32.to_be_bytes());
    out.extend_from_slice(&0_i64.to_be_bytes());
    out.extend_from_slice(&(u32::try_from(magic.len()).expect("len")).to_be_bytes());
    out.extend_from_slice(magic);
    out.resize(out.len() + (4 - magic.len() % 4) % 4, 0);
}

fn concat_record(out: &mut Vec<u8>, id: [u8; 16], children: &[[u8; 16]]) {
    out.extend_from_slice(&2_u32.to_be_bytes());
    out.extend_from_slice(&id);
    out.extend_from_slice(&(u32::try_from(children.len()).expect("len")).to_be_bytes());
    for child in children {
        out.extend_from_slice(child);
    }
}

/// Device list: two simple volumes concatenated, B then C.
fn concat_device_list() -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&3_u32.to_be_bytes());
    simple_record(&mut out, id(1), b"DISKB");
    simple_record(&mut out, id(2), b"DISKC");
    concat_record(&mut out, id(3), &[id(1), id(2)]);
    out
}

fn layout_bytes(root_id: u32, extents: &[(u64, u64, u64, u32)]) -> Vec<u8> {
    let mut out = Vec::new();
    out.extend_from_slice(&root_id.to_be_bytes());
    out.extend_from_slice(&(u32::try_from(extents.len()).expect("count")).to_be_bytes());
    for (file_offset, length, volume_offset, state) in extents {
        out.extend_from_slice(&(file_offset * SECTOR).to_be_bytes());
        out.extend_from_slice(&(length * SECTOR).to_be_bytes());
        out.extend_from_slice(&(volume_offset * SECTOR).to_be_bytes());
        out.extend_from_slice(&state.to_be_bytes());
    }
    out
}

// ── completion helpers ──────────────────────────────────────────────────────

fn must_read(mount: &MountContext, segment: &blfs_core::LayoutSegment, offset: u64, len: usize) -> Result<Vec<u8>> {
    let out: Arc<Mutex<Option<Vec<u8>>>> = Arc::new(Mutex::new(None));
    let sink = Arc::clone(&out);
    let completion: ReadCompletion = Box::new(move |result| {
        *sink.lock() = Some(result.expect("read completion"));
    });
    match mount.read_pagelist(segment, offset, len, completion) {
        ReadDisposition::Handled => {}
        ReadDisposition::Fallback(_) => bail!("read at {offset} fell back"),
    }
    let value = out.lock().take();
    value.context("completion never ran")
}

fn must_write(
    mount: &MountContext,
    segment: &blfs_core::LayoutSegment,
    offset: u64,
    data: &[u8],
) -> Result<u64> {
    let out: Arc<Mutex<Option<u64>>> = Arc::new(Mutex::new(None));
    let sink = Arc::clone(&out);
    let completion: WriteCompletion = Box::new(move |result| {
        *sink.lock() = Some(result.expect("write completion"));
    });
    match mount.write_pagelist(segment, offset, data, completion) {
        WriteDisposition::Handled => {}
        WriteDisposition::Fallback(_) => bail!("write at {offset} fell back"),
    }
    let value = out.lock().take();
    value.context("completion never ran")
}

fn read_falls_back(mount: &MountContext, segment: &blfs_core::LayoutSegment, offset: u64, len: usize) -> bool {
    let completion: ReadCompletion = Box::new(|_| panic!("must not complete"));
    matches!(
        mount.read_pagelist(segment, offset, len, completion),
        ReadDisposition::Fallback(_)
    )
}

// ── scenarios ───────────────────────────────────────────────────────────────

#[test]
fn concat_mount_round_trips_across_the_leaf_boundary() -> Result<()> {
    let pool = DevicePool::new(vec![
        pool_device(b"DISKB", 64),
        pool_device(b"DISKC", 64),
    ]);
    let manager = Arc::new(MemVolumeManager::new());
    let mount = MountContext::initialize(
        &concat_device_list(),
        &pool,
        Arc::clone(&manager) as Arc<dyn VolumeManager>,
        "blfs-meta-0",
    )?;
    assert_eq!(mount.size_sectors(), 128);

    let file = LayoutFile::new();
    let segment = file.add_segment(&layout_bytes(3, &[(0, 128, 0, 0)]))?;

    // Spans the last sector of leaf B and the first of leaf C.
    let pattern: Vec<u8> = (0..1024_usize).map(|i| i as u8).collect();
    let wrote = must_write(&mount, &segment, 63 * SECTOR, &pattern)?;
    assert_eq!(wrote, 1024);
    let data = must_read(&mount, &segment, 63 * SECTOR, 1024)?;
    assert_eq!(data, pattern);

    let stats = mount.stats();
    assert_eq!(stats.reads, 1);
    assert_eq!(stats.writes, 1);
    assert_eq!(stats.fallbacks, 0);
    Ok(())
}

#[test]
fn unbacked_ranges_zero_fill_and_misses_fall_back() -> Result<()> {
    let pool = DevicePool::new(vec![
        pool_device(b"DISKB", 64),
        pool_device(b"DISKC", 64),
    ]);
    let manager = Arc::new(MemVolumeManager::new());
    let mount = MountContext::initialize(
        &concat_device_list(),
        &pool,
        manager as Arc<dyn VolumeManager>,
        "blfs-meta-0",
    )?;

    let file = LayoutFile::new();
    // Sectors 0..8 backed, 8..16 a hole, nothing beyond.
    let segment = file.add_segment(&layout_bytes(3, &[(0, 8, 0, 0), (8, 8, 0, 3)]))?;

    let zeros = must_read(&mount, &segment, 8 * SECTOR, 2048)?;
    assert_eq!(zeros, vec![0_u8; 2048]);
    assert!(read_falls_back(&mount, &segment, 40 * SECTOR, 512));
    assert_eq!(mount.commit(&segment), CommitDisposition::Fallback);

    let stats = mount.stats();
    assert_eq!(stats.zero_fills, 1);
    assert_eq!(stats.fallbacks, 1);
    Ok(())
}

#[test]
fn freeing_a_segment_disables_acceleration() -> Result<()> {
    let pool = DevicePool::new(vec![
        pool_device(b"DISKB", 64),
        pool_device(b"DISKC", 64),
    ]);
    let manager = Arc::new(MemVolumeManager::new());
    let mount = MountContext::initialize(
        &concat_device_list(),
        &pool,
        manager as Arc<dyn VolumeManager>,
        "blfs-meta-0",
    )?;

    let file = LayoutFile::new();
    let segment = file.add_segment(&layout_bytes(3, &[(0, 128, 0, 0)]))?;
    assert!(must_read(&mount, &segment, 0, 512).is_ok());

    file.free_all();
    assert!(read_falls_back(&mount, &segment, 0, 512));
    Ok(())
}

#[test]
fn unmatched_signature_leaves_the_pool_untouched() {
    // Only one of the two signatures is visible locally.
    let pool = DevicePool::new(vec![pool_device(b"DISKB", 64)]);
    let manager = Arc::new(MemVolumeManager::new());
    let err = MountContext::initialize(
        &concat_device_list(),
        &pool,
        Arc::clone(&manager) as Arc<dyn VolumeManager>,
        "blfs-meta-0",
    )
    .expect_err("missing DISKC");

    assert!(matches!(err, BlfsError::NoMatchingSignature));
    assert_eq!(err.to_errno(), libc::ENODEV);
    assert_eq!(pool.unclaimed_len(), 1, "claim rolled back");
    assert_eq!(manager.active_len(), 0, "no composite object created");
}

#[test]
fn dropping_the_mount_releases_everything() -> Result<()> {
    let pool = DevicePool::new(vec![
        pool_device(b"DISKB", 64),
        pool_device(b"DISKC", 64),
    ]);
    let manager = Arc::new(MemVolumeManager::new());
    let mount = MountContext::initialize(
        &concat_device_list(),
        &pool,
        Arc::clone(&manager) as Arc<dyn VolumeManager>,
        "blfs-meta-0",
    )?;

    assert_eq!(pool.unclaimed_len(), 0);
    assert_eq!(manager.active_len(), 1);
    drop(mount);
    assert_eq!(pool.unclaimed_len(), 2);
    assert_eq!(manager.active_len(), 0);

    // The composite name is reusable after teardown.
    let remount = MountContext::initialize(
        &concat_device_list(),
        &pool,
        manager as Arc<dyn VolumeManager>,
        "blfs-meta-0",
    )?;
    assert_eq!(remount.size_sectors(), 128);
    Ok(())
}
