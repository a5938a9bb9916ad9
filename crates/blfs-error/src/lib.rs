#![forbid(unsafe_code)]
//! Error types for the block-layout client.
//!
//! # Error Taxonomy
//!
//! blfs uses a two-layer error model:
//!
//! | Layer | Type | Crate | Purpose |
//! |-------|------|-------|---------|
//! | Decode | `DecodeError` | `blfs-types` | Wire-format violations in device-list and layout-extent responses |
//! | Device | `DeviceError` | `blfs-device` | Signature matching, device claims, composite creation, raw I/O |
//! | Topology | `TopologyError` | `blfs-topology` | Decode + device failures during topology resolution |
//! | Extent | `ExtentError` | `blfs-extent` | Layout decode failures and overlap-invariant violations |
//! | Unified | `BlfsError` | `blfs-error` (this crate) | User-facing errors for the surrounding filesystem client |
//!
//! `blfs-error` is intentionally independent of the other workspace crates to
//! avoid cyclic dependencies. The conversions into `BlfsError` are implemented
//! in `blfs-core`, which depends on everything.
//!
//! ## Mapping Policy
//!
//! | Source | BlfsError Variant | Rationale |
//! |--------|-------------------|-----------|
//! | `DecodeError::*` | `Decode(detail)` | Any malformed response aborts the whole decode; the detail string preserves the variant message |
//! | `DeviceError::NoMatchingSignature` | `NoMatchingSignature` | Distinct variant so the caller can tell "no such disk here" from "broken response" |
//! | `DeviceError::ClaimFailed` | `ClaimFailed(detail)` | Claim conflicts are transient environment state, not corruption |
//! | `DeviceError::CompositeCreateFailed` | `CompositeCreateFailed(detail)` | Host volume-manager failure at mount time |
//! | `DeviceError::Io` | `Io` | Raw device I/O failure |
//! | `ExtentError::InvalidOverlap` | `InvalidOverlap` | The overlap invariant does not hold; the layout cannot be trusted |
//!
//! An extent-map miss is **not** an error anywhere in this workspace: it is
//! the expected signal to take the normal (non-accelerated) protocol path,
//! and the dispatcher handles it locally as a fallback outcome.
//!
//! ## errno Mapping
//!
//! Every variant maps to exactly one POSIX errno via [`BlfsError::to_errno`].
//! The mapping is exhaustive (no wildcard arms) so adding a new variant is a
//! compile error until its errno is assigned.
//!
//! | Variant | errno |
//! |---------|-------|
//! | `Io` | raw OS errno, `EIO` fallback |
//! | `Decode` | `EINVAL` |
//! | `NoMatchingSignature` | `ENODEV` |
//! | `ClaimFailed` | `EBUSY` |
//! | `CompositeCreateFailed` | `EIO` |
//! | `InvalidOverlap` | `EIO` |

use thiserror::Error;

/// Unified error type for all block-layout operations.
///
/// This is the canonical error type surfaced to the surrounding filesystem
/// client. Crate-local errors convert into `BlfsError` at the `blfs-core`
/// boundary; the caller decides whether to retry the response or give up on
/// layout acceleration for the mount.
#[derive(Debug, Error)]
pub enum BlfsError {
    /// Operating system I/O error (wraps `std::io::Error`).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed device-list or layout-extent response.
    ///
    /// The entire response was discarded; nothing partially decoded is
    /// retained. The detail string carries the `DecodeError` message.
    #[error("decode error: {0}")]
    Decode(String),

    /// No visible unclaimed device matched a simple volume's signature.
    #[error("no visible device matches the volume signature")]
    NoMatchingSignature,

    /// A device or composite object could not be exclusively claimed.
    #[error("device claim failed: {0}")]
    ClaimFailed(String),

    /// The host volume manager could not create the composite storage object.
    #[error("composite device creation failed: {0}")]
    CompositeCreateFailed(String),

    /// More than two extents cover one sector, or two extents cover it with
    /// the wrong state mix. Well-formed servers never produce this.
    #[error("invalid extent overlap at sector {sector}")]
    InvalidOverlap { sector: u64 },
}

impl BlfsError {
    /// Convert this error into a POSIX errno for the filesystem client.
    ///
    /// Policy notes:
    /// - `NoMatchingSignature` → `ENODEV`: the storage simply is not visible
    ///   from this client; the caller falls back to the protocol path.
    /// - `ClaimFailed` → `EBUSY`: another consumer holds the device.
    /// - `Decode` → `EINVAL`: the server sent a malformed response.
    #[must_use]
    pub fn to_errno(&self) -> libc::c_int {
        match self {
            Self::Io(err) => err.raw_os_error().unwrap_or(libc::EIO),
            Self::Decode(_) => libc::EINVAL,
            Self::NoMatchingSignature => libc::ENODEV,
            Self::ClaimFailed(_) => libc::EBUSY,
            Self::CompositeCreateFailed(_) | Self::InvalidOverlap { .. } => libc::EIO,
        }
    }
}

/// Result alias using `BlfsError`.
pub type Result<T> = std::result::Result<T, BlfsError>;
