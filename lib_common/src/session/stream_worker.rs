//! Paced capture → encode → send loop for one viewer.

use std::sync::Arc;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use tokio::time::{sleep, sleep_until, Instant};

use super::connection::ConnectionHandle;
use super::context::SessionContext;
use super::envelope::Outbound;
use super::registry::StreamLease;
use super::SessionError;
use crate::camera::encoding::encode_jpeg_blocking;

/// Why a worker stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamExit {
    StopRequested,
    ConnectionClosed,
    CameraUnavailable,
    /// The cohort was cancelled.
    Cancelled,
}

pub struct StreamWorker {
    ctx: SessionContext,
    conn: Arc<ConnectionHandle>,
    lease: StreamLease,
}

impl StreamWorker {
    pub fn new(ctx: SessionContext, conn: Arc<ConnectionHandle>, lease: StreamLease) -> Self {
        Self {
            ctx,
            conn,
            lease,
        }
    }

    /// Streams until stopped. The registry entry is released when this returns.
    pub async fn run(self) -> StreamExit {
        let viewer = self.lease.viewer().to_string();
        let resolution = self.ctx.stream_resolution();
        let interval = self.ctx.config.frame_interval();
        log::info!("Starting video stream for {} at {} / {:?}", viewer, resolution, interval);

        let mut next_due = Instant::now();
        let mut frames_sent: u64 = 0;

        let exit = loop {
            if let Some(exit) = self.should_exit() {
                break exit;
            }

            tokio::select! {
                _ = self.lease.token().cancelled() => {
                    break self.cancel_reason();
                }
                _ = sleep_until(next_due) => {}
            }
            let started = Instant::now();
            next_due = started + interval;

            let frame = match self.ctx.camera.capture_frame(resolution).await {
                Ok(frame) => frame,
                Err(e) if !e.is_transient() => {
                    log::error!("Stream for {} cannot capture: {}", viewer, e);
                    break StreamExit::CameraUnavailable;
                }
                Err(e) => {
                    log::warn!("Failed to capture frame for {}: {}. Retrying", viewer, e);
                    if self.pause_after_failure().await {
                        break self.cancel_reason();
                    }
                    continue;
                }
            };

            let captured_at = frame.captured_at;
            let jpeg = match encode_jpeg_blocking(frame.image, self.ctx.config.stream_quality).await {
                Ok(jpeg) => jpeg,
                Err(e) => {
                    log::warn!("Failed to encode frame for {}: {}", viewer, e);
                    if self.pause_after_failure().await {
                        break self.cancel_reason();
                    }
                    continue;
                }
            };

            // A stop may have arrived while capturing.
            if let Some(exit) = self.should_exit() {
                break exit;
            }

            let envelope = Outbound::Frame {
                device_id: self.ctx.device_id().to_string(),
                image: STANDARD.encode(&jpeg),
                timestamp: captured_at.timestamp(),
                client_id: viewer.clone(),
                battery: self.ctx.telemetry.battery(),
            };
            let sent = tokio::select! {
                biased;
                _ = self.lease.token().cancelled() => break self.cancel_reason(),
                sent = self.conn.send(&envelope) => sent,
            };
            match sent {
                Ok(()) => frames_sent += 1,
                Err(SessionError::ConnectionClosed(reason)) => {
                    log::warn!("Connection closed during stream for {}: {}", viewer, reason);
                    break StreamExit::ConnectionClosed;
                }
                Err(e) => {
                    log::warn!("Failed to send frame for {}: {}", viewer, e);
                    if self.pause_after_failure().await {
                        break self.cancel_reason();
                    }
                }
            }
        };

        log::info!("Video stream ended for {} ({:?}, {} frames)", viewer, exit, frames_sent);
        exit
    }

    fn should_exit(&self) -> Option<StreamExit> {
        if self.lease.stop_requested() {
            Some(StreamExit::StopRequested)
        } else if !self.conn.is_open() {
            Some(StreamExit::ConnectionClosed)
        } else if self.lease.token().is_cancelled() {
            Some(StreamExit::Cancelled)
        } else {
            None
        }
    }

    fn cancel_reason(&self) -> StreamExit {
        if self.lease.stop_requested() {
            StreamExit::StopRequested
        } else {
            StreamExit::Cancelled
        }
    }

    /// Waits the transient-failure delay. Returns `true` if cancelled meanwhile.
    async fn pause_after_failure(&self) -> bool {
        tokio::select! {
            _ = self.lease.token().cancelled() => true,
            _ = sleep(self.ctx.config.frame_retry_delay) => false,
        }
    }
}
