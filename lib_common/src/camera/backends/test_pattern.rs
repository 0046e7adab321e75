//! Synthetic camera producing a moving gradient, for development hosts and tests.

use std::path::Path;

use async_trait::async_trait;
use image::{Rgb, RgbImage};

use super::{BackendError, BackendResult, CameraBackend};
use crate::camera::encoding::encode_jpeg;
use crate::camera::Resolution;

#[derive(Debug, Default)]
pub struct TestPatternBackend {
    initialized: bool,
    tick: u32,
}

impl TestPatternBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn render(resolution: Resolution, tick: u32) -> RgbImage {
        let Resolution { width, height } = resolution;
        let bar = (tick.wrapping_mul(8)) % width.max(1);
        RgbImage::from_fn(width, height, |x, y| {
            if x.abs_diff(bar) < 4 {
                Rgb([255, 255, 255])
            } else {
                let r = (x * 255 / width.max(1)) as u8;
                let g = (y * 255 / height.max(1)) as u8;
                Rgb([r, g, (tick % 256) as u8])
            }
        })
    }

    fn next_image(&mut self, resolution: Resolution) -> BackendResult<RgbImage> {
        if !self.initialized {
            return Err(BackendError::NotInitialized);
        }
        self.tick = self.tick.wrapping_add(1);
        Ok(Self::render(resolution, self.tick))
    }
}

#[async_trait]
impl CameraBackend for TestPatternBackend {
    fn name(&self) -> &'static str {
        "test"
    }

    async fn initialize(&mut self) -> BackendResult<()> {
        self.initialized = true;
        Ok(())
    }

    async fn capture_still(&mut self, resolution: Resolution, dest: &Path) -> BackendResult<()> {
        let image = self.next_image(resolution)?;
        let jpeg = tokio::task::spawn_blocking(move || encode_jpeg(&image, 90))
            .await
            .map_err(|e| BackendError::Decode(e.to_string()))?
            .map_err(|e| BackendError::Decode(e.to_string()))?;
        tokio::fs::write(dest, jpeg).await?;
        Ok(())
    }

    async fn capture_frame(&mut self, resolution: Resolution) -> BackendResult<RgbImage> {
        self.next_image(resolution)
    }

    async fn shutdown(&mut self) {
        self.initialized = false;
    }
}
