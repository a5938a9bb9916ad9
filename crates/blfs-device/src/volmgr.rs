//! Host volume-manager collaborator interface.
//!
//! Flattening a resolved topology creates a uniquely named composite
//! storage object through the host's volume-management facility. This
//! module specifies that plug point and provides an in-memory
//! implementation used by tests across the workspace.

use crate::DeviceError;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// Handle to a created composite storage object.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompositeHandle {
    name: String,
    token: u64,
}

impl CompositeHandle {
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }
}

/// Create/remove named composite block-storage objects.
///
/// A name collision or creation failure is fatal to mount-time storage
/// resolution; the caller must release all partially claimed devices.
pub trait VolumeManager: Send + Sync {
    /// Create and exclusively claim a composite object named `name`.
    fn create(&self, name: &str) -> Result<CompositeHandle, DeviceError>;

    /// Release the claim and remove the composite object.
    fn remove(&self, handle: &CompositeHandle) -> Result<(), DeviceError>;
}

/// In-memory volume manager.
#[derive(Debug, Default)]
pub struct MemVolumeManager {
    active: Mutex<HashMap<String, u64>>,
    next_token: AtomicU64,
}

impl MemVolumeManager {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of composite objects currently alive.
    #[must_use]
    pub fn active_len(&self) -> usize {
        self.active.lock().len()
    }
}

impl VolumeManager for MemVolumeManager {
    fn create(&self, name: &str) -> Result<CompositeHandle, DeviceError> {
        let mut active = self.active.lock();
        if active.contains_key(name) {
            return Err(DeviceError::CompositeCreateFailed {
                detail: format!("composite object {name:?} already exists"),
            });
        }
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        active.insert(name.to_owned(), token);
        Ok(CompositeHandle {
            name: name.to_owned(),
            token,
        })
    }

    fn remove(&self, handle: &CompositeHandle) -> Result<(), DeviceError> {
        let mut active = self.active.lock();
        match active.get(&handle.name) {
            Some(token) if *token == handle.token => {
                active.remove(&handle.name);
                Ok(())
            }
            _ => Err(DeviceError::ClaimFailed {
                detail: format!("composite object {:?} is not held by this handle", handle.name),
            }),
        }
    }
}
