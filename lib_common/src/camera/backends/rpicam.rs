//! libcamera stack: `rpicam-still` for stills and a long-running
//! `rpicam-vid --codec mjpeg` pipeline for frames.

use std::path::Path;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use image::RgbImage;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::mjpeg::MjpegSplitter;
use super::process::{self, args};
use super::{BackendError, BackendResult, CameraBackend};
use crate::camera::encoding::decode_jpeg;
use crate::camera::Resolution;

/// Binary prefixes, newest naming first. Older images ship `libcamera-*`.
const PREFIXES: [&str; 2] = ["rpicam", "libcamera"];

const DETECT_ATTEMPTS: u32 = 2;
const DETECT_SPACING: Duration = Duration::from_secs(1);
const DETECT_TIMEOUT: Duration = Duration::from_secs(10);
const STILL_TIMEOUT: Duration = Duration::from_secs(15);
const FRAME_TIMEOUT: Duration = Duration::from_secs(5);
/// Pause after (re)starting the video pipeline.
const PIPELINE_SETTLE: Duration = Duration::from_millis(100);

type LatestFrame = Option<Arc<Vec<u8>>>;

struct VideoPipeline {
    resolution: Resolution,
    child: Child,
    reader: JoinHandle<()>,
    frames: watch::Receiver<LatestFrame>,
}

impl VideoPipeline {
    fn spawn(program: &str, resolution: Resolution) -> BackendResult<Self> {
        let mut child = Command::new(program)
            .args(args(["--nopreview", "-t", "0", "--codec", "mjpeg", "--flush", "-o", "-"]))
            .args(["--width".to_string(), resolution.width.to_string()])
            .args(["--height".to_string(), resolution.height.to_string()])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()?;

        let mut stdout = child
            .stdout
            .take()
            .ok_or_else(|| BackendError::Decode(format!("{} has no stdout", program)))?;

        let (tx, rx) = watch::channel::<LatestFrame>(None);
        let name = program.to_string();
        let reader = tokio::spawn(async move {
            let mut splitter = MjpegSplitter::new();
            let mut chunk = vec![0u8; 64 * 1024];
            loop {
                match stdout.read(&mut chunk).await {
                    Ok(0) => {
                        log::warn!("{} closed its output", name);
                        break;
                    }
                    Ok(n) => {
                        if let Some(latest) = splitter.push(&chunk[..n]).pop() {
                            if tx.send(Some(Arc::new(latest))).is_err() {
                                break;
                            }
                        }
                    }
                    Err(e) => {
                        log::warn!("Reading {} output failed: {}", name, e);
                        break;
                    }
                }
            }
        });

        Ok(Self {
            resolution,
            child,
            reader,
            frames: rx,
        })
    }

    /// Waits for a frame newer than the last one returned.
    async fn next_jpeg(&mut self) -> BackendResult<Arc<Vec<u8>>> {
        match tokio::time::timeout(FRAME_TIMEOUT, self.frames.changed()).await {
            Err(_) => Err(BackendError::Timeout {
                what: "rpicam-vid frame".to_string(),
                after: FRAME_TIMEOUT,
            }),
            Ok(Err(_)) => Err(BackendError::Process {
                program: "rpicam-vid".to_string(),
                status: -1,
                stderr: "video pipeline exited".to_string(),
            }),
            Ok(Ok(())) => self.frames.borrow_and_update().clone().ok_or(BackendError::EmptyOutput),
        }
    }

    async fn stop(mut self) {
        self.reader.abort();
        if let Err(e) = self.child.kill().await {
            log::debug!("Video pipeline already gone: {}", e);
        }
    }
}

/// Camera Module driven through the libcamera CLI apps.
pub struct RpicamBackend {
    prefix: Option<&'static str>,
    pipeline: Option<VideoPipeline>,
}

impl Default for RpicamBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl RpicamBackend {
    pub fn new() -> Self {
        Self {
            prefix: None,
            pipeline: None,
        }
    }

    fn program(&self, app: &str) -> BackendResult<String> {
        self.prefix
            .map(|prefix| format!("{}-{}", prefix, app))
            .ok_or(BackendError::NotInitialized)
    }

    async fn detect(prefix: &'static str) -> BackendResult<()> {
        let program = format!("{}-still", prefix);
        let mut last_err = BackendError::NotDetected(format!("{} found no camera", program));

        for attempt in 1..=DETECT_ATTEMPTS {
            match process::run_text(&program, &args(["--list-cameras"]), DETECT_TIMEOUT).await {
                Ok(listing) if listing.contains("Available cameras") => return Ok(()),
                Ok(_) => {
                    last_err = BackendError::NotDetected(format!("{} lists no cameras", program));
                }
                // No point retrying a binary that is not installed.
                Err(e @ BackendError::NotDetected(_)) => return Err(e),
                Err(e) => last_err = e,
            }
            if attempt < DETECT_ATTEMPTS {
                log::debug!("{} detection attempt {} failed, retrying", program, attempt);
                tokio::time::sleep(DETECT_SPACING).await;
            }
        }

        Err(last_err)
    }

    async fn stop_pipeline(&mut self) {
        if let Some(pipeline) = self.pipeline.take() {
            log::debug!("Stopping video pipeline at {}", pipeline.resolution);
            pipeline.stop().await;
        }
    }
}

#[async_trait]
impl CameraBackend for RpicamBackend {
    fn name(&self) -> &'static str {
        "rpicam"
    }

    async fn initialize(&mut self) -> BackendResult<()> {
        self.stop_pipeline().await;
        let mut last_err = BackendError::NotDetected("no libcamera apps installed".to_string());

        for prefix in PREFIXES {
            match Self::detect(prefix).await {
                Ok(()) => {
                    log::info!("Camera detected via {}-still", prefix);
                    self.prefix = Some(prefix);
                    return Ok(());
                }
                Err(e) => {
                    log::debug!("{} stack unavailable: {}", prefix, e);
                    last_err = e;
                }
            }
        }

        self.prefix = None;
        Err(last_err)
    }

    async fn capture_still(&mut self, resolution: Resolution, dest: &Path) -> BackendResult<()> {
        let program = self.program("still")?;
        // The video pipeline holds the sensor; release it for the still.
        self.stop_pipeline().await;

        let mut still_args = args(["--nopreview", "--immediate", "-t", "1", "-e", "jpg"]);
        still_args.extend([
            "--width".to_string(),
            resolution.width.to_string(),
            "--height".to_string(),
            resolution.height.to_string(),
            "-o".to_string(),
            dest.to_string_lossy().into_owned(),
        ]);

        process::run(&program, &still_args, STILL_TIMEOUT).await?;
        Ok(())
    }

    async fn capture_frame(&mut self, resolution: Resolution) -> BackendResult<RgbImage> {
        let program = self.program("vid")?;

        let reconfigure = self.pipeline.as_ref().map_or(true, |p| p.resolution != resolution);
        if reconfigure {
            self.stop_pipeline().await;
            log::info!("Starting {} at {}", program, resolution);
            self.pipeline = Some(VideoPipeline::spawn(&program, resolution)?);
            tokio::time::sleep(PIPELINE_SETTLE).await;
        }

        let Some(pipeline) = self.pipeline.as_mut() else {
            return Err(BackendError::NotInitialized);
        };
        let jpeg = match pipeline.next_jpeg().await {
            Ok(jpeg) => jpeg,
            Err(e) => {
                // Restart on the next call.
                self.stop_pipeline().await;
                return Err(e);
            }
        };

        tokio::task::spawn_blocking(move || decode_jpeg(&jpeg))
            .await
            .map_err(|e| BackendError::Decode(e.to_string()))?
            .map_err(BackendError::from)
    }

    async fn suspend(&mut self) {
        self.stop_pipeline().await;
    }

    async fn shutdown(&mut self) {
        self.stop_pipeline().await;
        self.prefix = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn capture_before_initialize_is_rejected() {
        let mut backend = RpicamBackend::new();
        let err = backend.capture_frame(Resolution::new(640, 480)).await.unwrap_err();
        assert!(matches!(err, BackendError::NotInitialized));
    }
}
