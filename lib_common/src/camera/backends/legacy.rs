//! Legacy firmware camera stack driven through `raspistill`.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use image::RgbImage;

use super::process::{self, args};
use super::{BackendError, BackendResult, CameraBackend, StillStrategy};
use crate::camera::encoding::decode_jpeg;
use crate::camera::Resolution;

const DETECT_TIMEOUT: Duration = Duration::from_secs(5);
const CAPTURE_TIMEOUT: Duration = Duration::from_secs(15);

pub struct LegacyBackend {
    initialized: bool,
}

impl Default for LegacyBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl LegacyBackend {
    pub fn new() -> Self {
        Self { initialized: false }
    }

    fn capture_args(resolution: Resolution, warmup_ms: u32, output: &str) -> Vec<String> {
        let mut v = args(["-n", "-e", "jpg", "-q", "90"]);
        v.extend([
            "-t".to_string(),
            warmup_ms.to_string(),
            "-w".to_string(),
            resolution.width.to_string(),
            "-h".to_string(),
            resolution.height.to_string(),
            "-o".to_string(),
            output.to_string(),
        ]);
        v
    }
}

/// Parses `vcgencmd get_camera` output, e.g. `supported=1 detected=1, libcamera interfaces=0`.
fn camera_detected(report: &str) -> bool {
    report
        .split(|c: char| c.is_whitespace() || c == ',')
        .any(|field| field == "detected=1")
}

#[async_trait]
impl CameraBackend for LegacyBackend {
    fn name(&self) -> &'static str {
        "legacy"
    }

    fn still_strategy(&self) -> StillStrategy {
        StillStrategy::RetryOnEmpty {
            attempts: 3,
            spacing: Duration::from_secs(1),
        }
    }

    async fn initialize(&mut self) -> BackendResult<()> {
        let report = process::run_text("vcgencmd", &args(["get_camera"]), DETECT_TIMEOUT).await?;
        if !camera_detected(&report) {
            self.initialized = false;
            return Err(BackendError::NotDetected(format!(
                "vcgencmd reports no camera: {}",
                report.trim()
            )));
        }
        log::info!("Camera detected via vcgencmd ({})", report.trim());
        self.initialized = true;
        Ok(())
    }

    async fn capture_still(&mut self, resolution: Resolution, dest: &Path) -> BackendResult<()> {
        if !self.initialized {
            return Err(BackendError::NotInitialized);
        }
        let still_args = Self::capture_args(resolution, 1000, &dest.to_string_lossy());
        process::run("raspistill", &still_args, CAPTURE_TIMEOUT).await?;
        Ok(())
    }

    async fn capture_frame(&mut self, resolution: Resolution) -> BackendResult<RgbImage> {
        if !self.initialized {
            return Err(BackendError::NotInitialized);
        }
        let frame_args = Self::capture_args(resolution, 1, "-");
        let jpeg = process::run("raspistill", &frame_args, CAPTURE_TIMEOUT).await?;
        if jpeg.is_empty() {
            return Err(BackendError::EmptyOutput);
        }

        tokio::task::spawn_blocking(move || decode_jpeg(&jpeg))
            .await
            .map_err(|e| BackendError::Decode(e.to_string()))?
            .map_err(BackendError::from)
    }

    async fn shutdown(&mut self) {
        self.initialized = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_vcgencmd_report() {
        assert!(camera_detected("supported=1 detected=1, libcamera interfaces=0"));
        assert!(!camera_detected("supported=1 detected=0, libcamera interfaces=0"));
        assert!(!camera_detected("supported=1 detected=10"));
        assert!(!camera_detected(""));
    }

    #[test]
    fn builds_raspistill_arguments() {
        let a = LegacyBackend::capture_args(Resolution::new(640, 480), 1, "-");
        assert!(a.windows(2).any(|w| w == ["-w", "640"]));
        assert!(a.windows(2).any(|w| w == ["-h", "480"]));
        assert_eq!(a.last().map(String::as_str), Some("-"));
    }
}
