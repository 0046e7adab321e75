//! # Edge Camera Agent
//!
//! Registers the device with the control plane, keeps a WebSocket session
//! open and serves still captures and per-viewer video streams from the
//! local camera until SIGINT / SIGTERM.
//!
//! Configuration comes from CLI flags, the environment (including `.env`)
//! and an optional JSON file, in that order of precedence. See
//! `lib_common::configs::agent_config` for every key.

use std::sync::Arc;

use anyhow::Result;
use tokio::signal;
use tokio_util::sync::CancellationToken;

use lib_common::camera::backends::{LegacyBackend, RpicamBackend, TestPatternBackend};
use lib_common::camera::{CameraBackend, CameraSource, SharedCamera};
use lib_common::configs::{load_config, BackendKind};
use lib_common::loggers::setup_logging;
use lib_common::session::{HttpControlPlane, SessionContext, SessionSupervisor};
use lib_common::utils::misc::sys_info::HostTelemetry;

/// Builds backends in the configured preference order.
fn build_backends(kinds: &[BackendKind]) -> Vec<Box<dyn CameraBackend>> {
    kinds
        .iter()
        .map(|kind| -> Box<dyn CameraBackend> {
            match kind {
                BackendKind::Rpicam => Box::new(RpicamBackend::new()),
                BackendKind::Legacy => Box::new(LegacyBackend::new()),
                BackendKind::Test => Box::new(TestPatternBackend::new()),
            }
        })
        .collect()
}

#[tokio::main]
async fn main() -> Result<()> {
    // Explicitly install the default crypto provider for rustls
    let _ = rustls::crypto::ring::default_provider().install_default();

    let config = load_config()?;
    setup_logging(&config.log_dir, config.debug)?;
    log::info!("Starting edge agent\n{}", config);

    let shutdown = CancellationToken::new();

    let camera = if config.no_camera {
        log::warn!("Camera disabled by configuration");
        CameraSource::disabled(&config.temp_image_dir)
    } else {
        CameraSource::new(build_backends(&config.camera_backends), &config.temp_image_dir)
            .with_cancellation(shutdown.clone())
    };

    let control = Arc::new(HttpControlPlane::new(&config)?);
    let ctx = SessionContext::new(config, SharedCamera::new(camera), Arc::new(HostTelemetry::new()));
    let supervisor = SessionSupervisor::new(ctx, control, shutdown.clone());
    let supervisor_handle = tokio::spawn(supervisor.run());

    shutdown_signal().await;
    shutdown.cancel();

    if let Err(e) = supervisor_handle.await {
        log::error!("Supervisor task failed: {}", e);
    }

    log::info!("Shutdown complete.");
    Ok(())
}

/// Resolves on `CTRL+C` or, on unix, `SIGTERM`.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            log::error!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
        log::info!("Ctrl-C received, initiating shutdown.");
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut term_signal) => {
                term_signal.recv().await;
                log::info!("SIGTERM received, initiating shutdown.");
            }
            Err(e) => {
                log::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
