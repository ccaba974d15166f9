//! Error types for the toasting core.
//!
//! Query failures are recoverable and expected to be retried on the next
//! refresh trigger; toast failures are terminal for their session and are
//! surfaced exactly once, never retried automatically.

use std::io;
use std::path::PathBuf;
use std::process::ExitStatus;

use thiserror::Error;

use crate::device::Descriptor;

/// Why a block-device snapshot could not be taken.
///
/// On any of these the caller keeps its previous inventory; the next
/// hotplug event or poll tick retries the query.
#[derive(Error, Debug)]
pub enum DeviceQueryError {
    /// The lsblk binary could not be executed at all.
    #[error("failed to run lsblk: {0}")]
    Spawn(#[source] io::Error),

    /// lsblk ran but exited nonzero.
    #[error("lsblk exited with {status}: {stderr}")]
    Failed { status: ExitStatus, stderr: String },

    /// lsblk produced output that is not the expected JSON document.
    #[error("unparseable lsblk output: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Returned by [`crate::tracker::ToastTracker::begin_toast`] when the
/// descriptor already holds an active lease. No state changes.
#[derive(Error, Debug)]
#[error("device is already being toasted: {0}")]
pub struct AlreadyBusy(pub Descriptor);

/// Terminal failure reasons for a toasting session.
///
/// Exactly one of these (or success) arrives as the session's terminal
/// event. A session that fails after bytes were written leaves the device
/// in a partial state that is never cleaned up: there is no safe way to
/// unwrite a raw block device.
#[derive(Error, Debug)]
pub enum ToastError {
    /// The source image does not exist. Reported before the target device
    /// is ever opened.
    #[error("source image not found: {}", .0.display())]
    SourceNotFound(PathBuf),

    /// Opening the target failed with a permission error even after the
    /// one-shot escalation retry.
    #[error("permission denied opening {}", path.display())]
    PermissionDenied {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// I/O failed while preparing or copying the image. `bytes_written`
    /// bytes had already reached the device and stay there.
    #[error("write failed after {bytes_written} bytes")]
    Write {
        bytes_written: u64,
        #[source]
        source: io::Error,
    },

    /// The session was cancelled at a chunk boundary.
    #[error("toasting cancelled")]
    Cancelled,

    /// The target device disappeared from the inventory mid-session and
    /// its lease was revoked.
    #[error("target device no longer attached")]
    DeviceLost,

    /// The verification pass read back data that does not match the image.
    #[error("verification failed: device contents do not match the image")]
    VerifyMismatch,
}
