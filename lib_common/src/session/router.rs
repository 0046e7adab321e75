//! Inbound dispatch loop: one envelope at a time, bounded waits.

use std::sync::Arc;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use super::connection::{ConnectionHandle, Incoming};
use super::context::SessionContext;
use super::envelope::{unix_timestamp, Inbound, Outbound};
use super::registry::StreamRegistry;
use super::stream_worker::StreamWorker;
use super::SessionError;

/// Why the router stopped reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouterExit {
    Closed,
    /// No inbound envelope within the idle limit.
    IdleTimeout,
    Cancelled,
}

pub struct MessageRouter {
    ctx: SessionContext,
    conn: Arc<ConnectionHandle>,
    registry: StreamRegistry,
    tracker: TaskTracker,
    token: CancellationToken,
}

impl MessageRouter {
    /// `tracker` and `token` belong to the session cohort; stream workers join both.
    pub fn new(
        ctx: SessionContext,
        conn: Arc<ConnectionHandle>,
        registry: StreamRegistry,
        tracker: TaskTracker,
        token: CancellationToken,
    ) -> Self {
        Self {
            ctx,
            conn,
            registry,
            tracker,
            token,
        }
    }

    pub async fn run(self) -> RouterExit {
        let receive_timeout = self.ctx.config.receive_timeout;
        let idle_timeout = self.ctx.config.idle_timeout;
        let mut last_activity = Instant::now();

        loop {
            let incoming = tokio::select! {
                biased;
                _ = self.token.cancelled() => return RouterExit::Cancelled,
                incoming = self.conn.receive(receive_timeout) => incoming,
            };

            match incoming {
                Ok(Incoming::Envelope(envelope)) => {
                    last_activity = Instant::now();
                    tokio::select! {
                        biased;
                        _ = self.token.cancelled() => return RouterExit::Cancelled,
                        _ = self.dispatch(envelope) => {}
                    }
                }
                Ok(Incoming::Timeout) => {
                    if last_activity.elapsed() >= idle_timeout {
                        log::warn!("No message from server for {:?}, assuming the connection is dead", idle_timeout);
                        return RouterExit::IdleTimeout;
                    }
                }
                Ok(Incoming::Closed) => {
                    log::warn!("Connection closed, router stopping");
                    return RouterExit::Closed;
                }
                Err(SessionError::ProtocolViolation(detail)) => {
                    last_activity = Instant::now();
                    log::warn!("Ignoring malformed message: {}", detail);
                }
                Err(e) => {
                    log::error!("Receive failed: {}", e);
                    return RouterExit::Closed;
                }
            }
        }
    }

    async fn dispatch(&self, envelope: Inbound) {
        match envelope {
            Inbound::CaptureRequest { client_id } => {
                log::info!("Capture request received for {}", client_id.as_deref().unwrap_or("<server>"));
                self.handle_capture(client_id).await;
            }
            Inbound::StreamRequest { client_id: Some(viewer) } => self.start_stream(&viewer),
            Inbound::StreamRequest { client_id: None } => log::error!("Stream request missing client_id"),
            Inbound::StopStream { client_id: Some(viewer) } => {
                if self.registry.request_stop(&viewer) {
                    log::info!("Stopping stream for {}", viewer);
                } else {
                    log::debug!("Stop for {} ignored, no running stream", viewer);
                }
            }
            Inbound::StopStream { client_id: None } => log::debug!("Stop request missing client_id"),
            Inbound::Pong {} => log::debug!("Received pong from server"),
            Inbound::Error { message } => {
                log::error!("Server error: {}", message.as_deref().unwrap_or("<no message>"));
            }
            Inbound::Connected { .. } => log::debug!("Ignoring repeated connected message"),
            Inbound::Unknown => log::debug!("Ignoring message of unknown type"),
        }
    }

    fn start_stream(&self, viewer: &str) {
        let Some(lease) = self.registry.try_start(viewer, &self.token) else {
            log::info!("Stream for {} already active, ignoring request", viewer);
            return;
        };
        let worker = StreamWorker::new(self.ctx.clone(), self.conn.clone(), lease);
        self.tracker.spawn(worker.run());
    }

    /// Captures a still and sends it. Failures are logged; nothing is sent.
    async fn handle_capture(&self, requesting_client_id: Option<String>) {
        let image = match self.ctx.camera.capture_still(self.ctx.still_resolution()).await {
            Ok(image) => image,
            Err(e) => {
                log::error!("Failed to capture image: {}", e);
                return;
            }
        };

        let envelope = Outbound::Image {
            device_id: self.ctx.device_id().to_string(),
            image: STANDARD.encode(image.bytes()),
            timestamp: unix_timestamp(),
            requesting_client_id: requesting_client_id.clone(),
            battery: self.ctx.telemetry.battery(),
        };
        // `image` is dropped at the end of this scope, removing the file either way.
        match self.conn.send(&envelope).await {
            Ok(()) => log::info!(
                "Image sent ({} bytes){}",
                image.bytes().len(),
                requesting_client_id.map(|c| format!(" for {}", c)).unwrap_or_default()
            ),
            Err(e) => log::error!("Failed to send image: {}", e),
        }
    }
}
