//! Periodic cohort loops: keepalive ping, status report and camera health probe.
//!
//! Each loop ticks on a `tokio::time::interval`, skips the tick while the
//! connection is not open, and returns when the cohort token is cancelled or
//! the connection refuses a send.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use super::connection::ConnectionHandle;
use super::context::SessionContext;
use super::envelope::{unix_timestamp, Outbound};
use super::registry::StreamRegistry;
use super::SessionError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopExit {
    Cancelled,
    ConnectionLost,
}

/// Sends `ping` right away and then every `ping_interval`.
pub async fn ping_loop(ctx: SessionContext, conn: Arc<ConnectionHandle>, token: CancellationToken) -> LoopExit {
    let period = ctx.config.ping_interval;
    periodic_send(&conn, &token, Instant::now(), period, "ping", || Outbound::Ping {
        device_id: ctx.device_id().to_string(),
        timestamp: unix_timestamp(),
    })
    .await
}

/// Sends `status_update` right away and then every `status_interval`.
pub async fn status_loop(ctx: SessionContext, conn: Arc<ConnectionHandle>, token: CancellationToken) -> LoopExit {
    let period = ctx.config.status_interval;
    periodic_send(&conn, &token, Instant::now(), period, "status_update", || Outbound::StatusUpdate {
        device_id: ctx.device_id().to_string(),
        battery: ctx.telemetry.battery(),
        uptime: ctx.telemetry.uptime_secs(),
        timestamp: unix_timestamp(),
    })
    .await
}

async fn periodic_send(
    conn: &ConnectionHandle,
    token: &CancellationToken,
    start: Instant,
    period: Duration,
    what: &str,
    mut build: impl FnMut() -> Outbound,
) -> LoopExit {
    let mut ticker = interval_at(start, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = token.cancelled() => return LoopExit::Cancelled,
            _ = ticker.tick() => {}
        }

        if !conn.is_open() {
            log::debug!("Skipping {}, connection not open", what);
            continue;
        }

        let envelope = build();
        let sent = tokio::select! {
            biased;
            _ = token.cancelled() => return LoopExit::Cancelled,
            sent = conn.send(&envelope) => sent,
        };
        match sent {
            Ok(()) => log::debug!("Sent {}", what),
            Err(SessionError::ConnectionClosed(reason)) => {
                log::warn!("Connection closed while sending {}: {}", what, reason);
                return LoopExit::ConnectionLost;
            }
            Err(e) => log::error!("Error sending {}: {}", what, e),
        }
    }
}

/// Probes the camera every `interval` while no stream is active.
pub async fn camera_health_loop(
    ctx: SessionContext,
    registry: StreamRegistry,
    interval: Duration,
    token: CancellationToken,
) -> LoopExit {
    let mut ticker = interval_at(Instant::now() + interval, interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = token.cancelled() => return LoopExit::Cancelled,
            _ = ticker.tick() => {}
        }

        if !registry.is_empty() {
            log::debug!("Skipping camera health check, {} streams active", registry.len());
            continue;
        }

        let mut camera = ctx.camera.lock().await;
        if camera.is_disabled() {
            continue;
        }
        if camera.health_check().await {
            log::debug!("Camera health check passed");
        } else {
            log::warn!("Camera health check failed; camera is now {:?}", camera.state());
        }
    }
}
