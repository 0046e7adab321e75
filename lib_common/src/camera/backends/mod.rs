//! Camera backend abstraction.
//!
//! A backend wraps one camera integration (a vendor CLI stack or a
//! synthetic source). [`CameraSource`](super::CameraSource) holds an ordered
//! list of them and keeps the first one that initializes.

pub mod legacy;
pub mod mjpeg;
pub mod process;
pub mod rpicam;
pub mod test_pattern;

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use image::RgbImage;
use thiserror::Error;

use super::{CameraError, Resolution};

pub use legacy::LegacyBackend;
pub use rpicam::RpicamBackend;
pub use test_pattern::TestPatternBackend;

pub type BackendResult<T> = Result<T, BackendError>;

/// Raw backend failures. Converted to [`CameraError`] before leaving the camera module.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("camera not detected: {0}")]
    NotDetected(String),

    #[error("{what} timed out after {after:?}")]
    Timeout { what: String, after: Duration },

    #[error("capture produced no data")]
    EmptyOutput,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{program} exited with status {status}: {stderr}")]
    Process {
        program: String,
        status: i32,
        stderr: String,
    },

    #[error("failed to decode frame: {0}")]
    Decode(String),

    #[error("backend is not initialized")]
    NotInitialized,
}

impl From<BackendError> for CameraError {
    fn from(err: BackendError) -> Self {
        match err {
            BackendError::NotDetected(msg) => CameraError::HardwareUnavailable(msg),
            BackendError::NotInitialized => CameraError::HardwareUnavailable("backend not initialized".to_string()),
            BackendError::Timeout { .. } => CameraError::CaptureTimeout,
            BackendError::EmptyOutput => CameraError::CaptureEmpty,
            other => CameraError::BackendUnknown(other.to_string()),
        }
    }
}

impl From<image::ImageError> for BackendError {
    fn from(err: image::ImageError) -> Self {
        BackendError::Decode(err.to_string())
    }
}

/// How a backend's still captures are driven by the source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StillStrategy {
    /// One capture into the staging file.
    Staged,
    /// Empty output is a known transient; retry up to `attempts` times.
    RetryOnEmpty { attempts: u32, spacing: Duration },
}

/// Common interface of every camera integration.
#[async_trait]
pub trait CameraBackend: Send {
    /// Short name for logs.
    fn name(&self) -> &'static str;

    fn still_strategy(&self) -> StillStrategy {
        StillStrategy::Staged
    }

    /// Detects the hardware and prepares the backend. May retry detection internally.
    async fn initialize(&mut self) -> BackendResult<()>;

    /// Writes one JPEG still at `resolution` to `dest`, overwriting it.
    async fn capture_still(&mut self, resolution: Resolution, dest: &Path) -> BackendResult<()>;

    /// Captures one in-memory frame. Reconfigures only when `resolution` changed.
    async fn capture_frame(&mut self, resolution: Resolution) -> BackendResult<RgbImage>;

    /// Releases streaming resources while staying initialized.
    async fn suspend(&mut self) {}

    /// Releases every resource. `initialize` must be called again before use.
    async fn shutdown(&mut self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backend_errors_map_onto_camera_taxonomy() {
        assert_eq!(
            CameraError::from(BackendError::NotDetected("no cam".into())),
            CameraError::HardwareUnavailable("no cam".into())
        );
        assert_eq!(
            CameraError::from(BackendError::Timeout {
                what: "rpicam-still".into(),
                after: Duration::from_secs(10)
            }),
            CameraError::CaptureTimeout
        );
        assert_eq!(CameraError::from(BackendError::EmptyOutput), CameraError::CaptureEmpty);
        assert!(matches!(
            CameraError::from(BackendError::Decode("bad".into())),
            CameraError::BackendUnknown(_)
        ));
    }
}
