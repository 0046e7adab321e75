//! # Session Supervisor
//!
//! Top-level orchestration of one device session at a time:
//!
//! `Idle → Registering → Connecting → Serving → Draining → Idle → …`
//!
//! with `ShuttingDown` reachable from any state once the external shutdown
//! token fires. While `Serving`, the router, the keepalive loops and every
//! stream worker run as one cohort (a `TaskTracker` plus a child
//! `CancellationToken`). When the router or a keepalive loop exits, or the
//! connection closes, the whole cohort is cancelled and awaited before the
//! supervisor drains and reconnects after a fixed delay.
//!
//! The session token obtained at registration is cached and reused across
//! reconnects; only a failed registration clears it.

use std::sync::Arc;

use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use super::connection::ConnectionHandle;
use super::context::SessionContext;
use super::keepalive::{camera_health_loop, ping_loop, status_loop, LoopExit};
use super::registration::{ControlPlane, DeviceMetadata, Registration};
use super::registry::StreamRegistry;
use super::router::{MessageRouter, RouterExit};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    Idle,
    Registering,
    Connecting,
    Serving,
    Draining,
    ShuttingDown,
}

/// Which cohort member ended the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MemberExit {
    Router(RouterExit),
    Ping(LoopExit),
    Status(LoopExit),
    HealthMonitor(LoopExit),
    ConnectionLost,
}

enum CohortOutcome {
    /// External shutdown requested.
    Shutdown,
    Ended(MemberExit),
}

pub struct SessionSupervisor {
    ctx: SessionContext,
    control: Arc<dyn ControlPlane>,
    shutdown: CancellationToken,
    state: watch::Sender<SupervisorState>,
    registration: Option<Registration>,
}

impl SessionSupervisor {
    pub fn new(ctx: SessionContext, control: Arc<dyn ControlPlane>, shutdown: CancellationToken) -> Self {
        let (state, _) = watch::channel(SupervisorState::Idle);
        Self {
            ctx,
            control,
            shutdown,
            state,
            registration: None,
        }
    }

    /// Observes state transitions.
    pub fn subscribe(&self) -> watch::Receiver<SupervisorState> {
        self.state.subscribe()
    }

    fn set_state(&self, next: SupervisorState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            log::debug!("Supervisor {:?} -> {:?}", previous, next);
        }
    }

    /// Runs sessions until the shutdown token is cancelled, then tears everything down.
    pub async fn run(mut self) {
        log::info!("Session supervisor started for device {}", self.ctx.device_id());

        while !self.shutdown.is_cancelled() {
            self.set_state(SupervisorState::Registering);
            let Some(registration) = self.registration().await else {
                if !self.pause().await {
                    break;
                }
                continue;
            };

            self.prepare_camera().await;

            self.set_state(SupervisorState::Connecting);
            let connected = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                connected = self.control.connect(&registration) => connected,
            };
            let conn = match connected {
                Ok(conn) => Arc::new(conn),
                Err(e) => {
                    log::error!("Connection failed: {}. Retrying in {:?}", e, self.ctx.config.reconnect_delay);
                    if !self.pause().await {
                        break;
                    }
                    continue;
                }
            };

            self.set_state(SupervisorState::Serving);
            log::info!("Session established, serving");
            let outcome = self.serve(conn.clone()).await;
            conn.close().await;

            match outcome {
                CohortOutcome::Shutdown => break,
                CohortOutcome::Ended(reason) => {
                    self.set_state(SupervisorState::Draining);
                    log::warn!(
                        "Session ended ({:?}). Reconnecting in {:?}",
                        reason,
                        self.ctx.config.reconnect_delay
                    );
                    self.ctx.camera.lock().await.suspend().await;
                    if !self.pause().await {
                        break;
                    }
                    self.set_state(SupervisorState::Idle);
                }
            }
        }

        self.set_state(SupervisorState::ShuttingDown);
        log::info!("Shutting down session supervisor");
        self.ctx.camera.lock().await.shutdown(true).await;
        log::info!("Session supervisor stopped");
    }

    /// Cached registration, or a fresh one. `None` after a failed attempt.
    async fn registration(&mut self) -> Option<Registration> {
        if let Some(cached) = &self.registration {
            log::debug!("Reusing cached session token");
            return Some(cached.clone());
        }

        let metadata = DeviceMetadata::collect(&self.ctx.config, self.ctx.telemetry.as_ref());
        let result = tokio::select! {
            _ = self.shutdown.cancelled() => return None,
            result = self.control.register(&metadata) => result,
        };

        match result {
            Ok(registration) => {
                self.registration = Some(registration.clone());
                Some(registration)
            }
            Err(e) => {
                log::error!("{}. Retrying in {:?}", e, self.ctx.config.reconnect_delay);
                self.registration = None;
                None
            }
        }
    }

    /// Initializes the camera if it is enabled but not ready. Failure leaves
    /// the session camera-less.
    async fn prepare_camera(&self) {
        let mut camera = self.ctx.camera.lock().await;
        if camera.is_disabled() || camera.is_ready() {
            return;
        }
        if let Err(e) = camera.initialize().await {
            log::warn!("Continuing without camera: {}", e);
        }
    }

    /// Waits the reconnect delay. Returns `false` if shutdown was requested meanwhile.
    async fn pause(&self) -> bool {
        tokio::select! {
            _ = self.shutdown.cancelled() => false,
            _ = tokio::time::sleep(self.ctx.config.reconnect_delay) => true,
        }
    }

    async fn serve(&self, conn: Arc<ConnectionHandle>) -> CohortOutcome {
        let cohort = self.shutdown.child_token();
        let tracker = TaskTracker::new();
        let registry = StreamRegistry::new();
        let (exit_tx, mut exit_rx) = mpsc::channel::<MemberExit>(8);

        let router = MessageRouter::new(
            self.ctx.clone(),
            conn.clone(),
            registry.clone(),
            tracker.clone(),
            cohort.clone(),
        );
        spawn_member(&tracker, &exit_tx, MemberExit::Router, router.run());
        spawn_member(
            &tracker,
            &exit_tx,
            MemberExit::Ping,
            ping_loop(self.ctx.clone(), conn.clone(), cohort.clone()),
        );
        spawn_member(
            &tracker,
            &exit_tx,
            MemberExit::Status,
            status_loop(self.ctx.clone(), conn.clone(), cohort.clone()),
        );
        if let Some(interval) = self.ctx.config.camera_health_interval {
            spawn_member(
                &tracker,
                &exit_tx,
                MemberExit::HealthMonitor,
                camera_health_loop(self.ctx.clone(), registry.clone(), interval, cohort.clone()),
            );
        }
        drop(exit_tx);

        let outcome = tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => CohortOutcome::Shutdown,
            Some(exit) = exit_rx.recv() => CohortOutcome::Ended(exit),
            _ = conn.closed() => CohortOutcome::Ended(MemberExit::ConnectionLost),
        };

        cohort.cancel();
        tracker.close();
        tracker.wait().await;
        log::debug!("Cohort stopped, {} streams left in registry", registry.len());

        outcome
    }
}

fn spawn_member<F, T>(
    tracker: &TaskTracker,
    exit_tx: &mpsc::Sender<MemberExit>,
    wrap: fn(T) -> MemberExit,
    member: F,
) where
    F: std::future::Future<Output = T> + Send + 'static,
    T: Send + 'static,
{
    let exit_tx = exit_tx.clone();
    tracker.spawn(async move {
        let exit = wrap(member.await);
        // The receiver is gone once the cohort is already tearing down.
        let _ = exit_tx.send(exit).await;
    });
}
