//! In-memory transport and fixtures for session tests.

use std::sync::Arc;
use std::time::Duration;

use futures_channel::mpsc::{unbounded, UnboundedReceiver, UnboundedSender};
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::tungstenite::Error as WsError;

use super::connection::ConnectionHandle;
use super::context::SessionContext;
use crate::camera::backends::TestPatternBackend;
use crate::camera::{CameraSource, SharedCamera};
use crate::configs::AgentConfig;
use crate::utils::misc::sys_info::{SystemInfo, TelemetryProvider};

/// The server side of an in-memory connection.
pub(crate) struct ServerEnd {
    tx: UnboundedSender<Message>,
    rx: UnboundedReceiver<Message>,
}

impl ServerEnd {
    pub fn send_json(&self, value: Value) {
        self.send_text(&value.to_string());
    }

    pub fn send_text(&self, text: &str) {
        // The client may already be gone; tests assert on effects instead.
        let _ = self.tx.unbounded_send(Message::Text(text.to_string().into()));
    }

    /// Next text message decoded as JSON, `None` once the client hung up.
    pub async fn next_json(&mut self) -> Option<Value> {
        loop {
            match self.rx.next().await? {
                Message::Text(text) => return serde_json::from_str(text.as_str()).ok(),
                _ => continue,
            }
        }
    }

    /// Like [`next_json`](Self::next_json) but gives up after `timeout`.
    pub async fn next_json_within(&mut self, timeout: Duration) -> Option<Value> {
        tokio::time::timeout(timeout, self.next_json()).await.ok().flatten()
    }

    /// Collects every message that arrives within `window`.
    pub async fn collect_for(&mut self, window: Duration) -> Vec<Value> {
        let deadline = tokio::time::Instant::now() + window;
        let mut out = Vec::new();
        while let Ok(Some(value)) = tokio::time::timeout_at(deadline, self.next_json()).await {
            out.push(value);
        }
        out
    }
}

/// A connected client handle and the server end feeding it.
pub(crate) fn connection_pair() -> (ConnectionHandle, ServerEnd) {
    let (client_tx, server_rx) = unbounded::<Message>();
    let (server_tx, client_rx) = unbounded::<Message>();

    let sink = client_tx.sink_map_err(|_| WsError::ConnectionClosed);
    let stream = client_rx.map(Ok::<Message, WsError>);
    let handle = ConnectionHandle::from_parts(Box::pin(sink), Box::pin(stream));

    (
        handle,
        ServerEnd {
            tx: server_tx,
            rx: server_rx,
        },
    )
}

pub(crate) struct FixedTelemetry;

impl TelemetryProvider for FixedTelemetry {
    fn battery(&self) -> Option<u8> {
        Some(77)
    }

    fn uptime_secs(&self) -> u64 {
        1234
    }

    fn hardware_model(&self) -> String {
        "Test Board".to_string()
    }

    fn system_info(&self) -> SystemInfo {
        SystemInfo {
            os: "linux".to_string(),
            arch: "aarch64".to_string(),
            hostname: "test-host".to_string(),
            local_ip: None,
            agent_version: "0.0.0".to_string(),
        }
    }
}

/// Small, fast settings for tests.
pub(crate) fn test_config(scratch: &std::path::Path) -> AgentConfig {
    AgentConfig {
        device_id: "pi-test".to_string(),
        stream_width: 32,
        stream_height: 24,
        still_width: 64,
        still_height: 48,
        stream_fps: 20,
        temp_image_dir: scratch.to_path_buf(),
        receive_timeout: Duration::from_millis(50),
        frame_retry_delay: Duration::from_millis(20),
        ..AgentConfig::default()
    }
}

/// A context over an initialized test-pattern camera.
pub(crate) async fn test_context(config: AgentConfig) -> SessionContext {
    let mut source = CameraSource::new(vec![Box::new(TestPatternBackend::new())], &config.temp_image_dir);
    source
        .initialize()
        .await
        .expect("test pattern backend always initializes");
    SessionContext::new(config, SharedCamera::new(source), Arc::new(FixedTelemetry))
}
