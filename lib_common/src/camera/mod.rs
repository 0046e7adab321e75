//! # Camera Module
//!
//! Hardware abstraction for still captures and live frames.
//!
//! ```text
//! SharedCamera (async mutex gate, one capture in flight)
//!      │
//!      ▼
//! CameraSource (state machine, bounded initialize, recovery, scratch files)
//!      │
//!      ▼
//! [Box<dyn CameraBackend>]  rpicam → legacy → test pattern
//! ```
//!
//! Backend failures are converted to [`CameraError`] at the `CameraSource`
//! boundary; nothing above it sees a raw backend error.

#![forbid(unsafe_code)]
#![warn(rust_2018_idioms, unused_qualifications)]

pub mod backends;
pub mod encoding;
pub mod source;

use std::fmt;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use image::RgbImage;
use thiserror::Error;

pub use backends::{BackendError, CameraBackend, StillStrategy};
pub use source::{CameraSource, SharedCamera};

/// The only camera failures visible outside this module.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CameraError {
    /// No usable camera: not detected, not initialized, or disabled.
    #[error("camera hardware unavailable: {0}")]
    HardwareUnavailable(String),

    /// The backend did not deliver within its time budget.
    #[error("camera capture timed out")]
    CaptureTimeout,

    /// The backend reported success but produced no data.
    #[error("camera capture produced no data")]
    CaptureEmpty,

    /// Any other backend failure.
    #[error("camera backend failure: {0}")]
    BackendUnknown(String),
}

impl CameraError {
    /// Whether retrying the same capture later can reasonably succeed.
    pub fn is_transient(&self) -> bool {
        !matches!(self, CameraError::HardwareUnavailable(_))
    }
}

/// Capture resolution in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    /// Resolution used by health probes.
    pub const PROBE: Resolution = Resolution { width: 640, height: 480 };

    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Lifecycle of a [`CameraSource`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CameraState {
    Uninitialized,
    Initializing,
    Ready,
    /// Repeated capture failures; a reinitialize is in progress or pending.
    Degraded,
}

/// One in-memory raster, alive for a single stream iteration.
#[derive(Debug, Clone)]
pub struct Frame {
    pub image: RgbImage,
    pub captured_at: DateTime<Utc>,
}

/// A published still capture.
///
/// The file at `path` is removed when the value is dropped, so it is deleted
/// whether or not the bytes were transmitted.
#[derive(Debug)]
pub struct CapturedImage {
    path: PathBuf,
    bytes: Vec<u8>,
    captured_at: DateTime<Utc>,
}

impl CapturedImage {
    pub(crate) fn new(path: PathBuf, bytes: Vec<u8>, captured_at: DateTime<Utc>) -> Self {
        Self { path, bytes, captured_at }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn captured_at(&self) -> DateTime<Utc> {
        self.captured_at
    }
}

impl Drop for CapturedImage {
    fn drop(&mut self) {
        match std::fs::remove_file(&self.path) {
            Ok(()) => log::debug!("Removed capture {}", self.path.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => log::warn!("Failed to remove capture {}: {}", self.path.display(), e),
        }
    }
}
