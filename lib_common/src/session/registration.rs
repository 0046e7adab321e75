//! Device registration and connection establishment against the control plane.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Method;
use serde::{Deserialize, Serialize};
use tokio_tungstenite::connect_async;
use url::Url;

use super::connection::ConnectionHandle;
use super::SessionError;
use crate::configs::AgentConfig;
use crate::retrieve::ky_http::{ApiClient, ApiResponse};
use crate::utils::misc::sys_info::{SystemInfo, TelemetryProvider};

const REGISTER_PATH: &str = "api/register-device";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HardwareInfo {
    pub model: String,
    pub system_info: SystemInfo,
}

/// Body of the registration call.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceMetadata {
    pub device_id: String,
    pub device_type: String,
    pub camera_module: String,
    pub hardware_info: HardwareInfo,
}

impl DeviceMetadata {
    pub fn collect(config: &AgentConfig, telemetry: &dyn TelemetryProvider) -> Self {
        Self {
            device_id: config.device_id.clone(),
            device_type: config.device_type.clone(),
            camera_module: config.camera_module.clone(),
            hardware_info: HardwareInfo {
                model: telemetry.hardware_model(),
                system_info: telemetry.system_info(),
            },
        }
    }
}

#[derive(Debug, Deserialize)]
struct RegisterResponse {
    #[serde(default)]
    token: Option<String>,
    #[serde(default)]
    websocket_url: Option<String>,
}

/// A session token and the endpoint it is valid for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registration {
    pub token: String,
    pub endpoint: String,
}

impl Registration {
    /// `endpoint?token=<token>`, keeping any query the endpoint already has.
    pub fn connect_url(&self) -> Result<Url, SessionError> {
        let mut url = Url::parse(&self.endpoint)
            .map_err(|e| SessionError::ConnectionClosed(format!("invalid endpoint {}: {}", self.endpoint, e)))?;
        url.query_pairs_mut().append_pair("token", &self.token);
        Ok(url)
    }
}

/// The server side of the session: hands out tokens and connections.
#[async_trait]
pub trait ControlPlane: Send + Sync {
    /// One-shot registration. Never retried internally.
    async fn register(&self, metadata: &DeviceMetadata) -> Result<Registration, SessionError>;

    /// Opens a confirmed connection for `registration`.
    async fn connect(&self, registration: &Registration) -> Result<ConnectionHandle, SessionError>;
}

/// Control plane reached over HTTP (registration) and WebSocket (session).
pub struct HttpControlPlane {
    api: ApiClient,
    fallback_endpoint: String,
    connect_timeout: Duration,
    send_timeout: Duration,
}

impl HttpControlPlane {
    pub fn new(config: &AgentConfig) -> anyhow::Result<Self> {
        // Registration is one-shot; the supervisor owns the retry cadence.
        let api = ApiClient::new(
            &config.api_server,
            Some(config.api_key.clone()),
            0,
            config.registration_timeout,
        )?;
        Ok(Self {
            api,
            fallback_endpoint: config.websocket_server.clone(),
            connect_timeout: config.connect_timeout,
            send_timeout: config.send_timeout,
        })
    }
}

#[async_trait]
impl ControlPlane for HttpControlPlane {
    async fn register(&self, metadata: &DeviceMetadata) -> Result<Registration, SessionError> {
        log::info!("Registering device {} with {}", metadata.device_id, self.api.base_url());

        let response = self
            .api
            .request::<RegisterResponse, _>(Method::POST, REGISTER_PATH, Some(metadata))
            .await
            .map_err(|e| SessionError::RegistrationFailed(format!("{:#}", e)))?;

        let body = match response {
            ApiResponse::Success { data, .. } => data,
            ApiResponse::Failure { status, body } => {
                return Err(SessionError::RegistrationFailed(format!(
                    "HTTP {}: {}",
                    status,
                    body.unwrap_or_default()
                )));
            }
        };
        let token = body
            .token
            .filter(|t| !t.is_empty())
            .ok_or_else(|| SessionError::RegistrationFailed("response carries no token".to_string()))?;
        let endpoint = body
            .websocket_url
            .filter(|u| !u.is_empty())
            .unwrap_or_else(|| self.fallback_endpoint.clone());

        log::info!("Device registered, session endpoint {}", endpoint);
        Ok(Registration { token, endpoint })
    }

    async fn connect(&self, registration: &Registration) -> Result<ConnectionHandle, SessionError> {
        let url = registration.connect_url()?;
        log::info!("Connecting to {}", registration.endpoint);

        let ws = match tokio::time::timeout(self.connect_timeout, connect_async(url.as_str())).await {
            Err(_) => return Err(SessionError::ConnectTimeout),
            Ok(Err(e)) => return Err(SessionError::ConnectionClosed(e.to_string())),
            Ok(Ok((ws, _response))) => ws,
        };

        let handle = ConnectionHandle::from_websocket(ws).with_send_timeout(self.send_timeout);
        if let Err(e) = handle.await_confirmation(self.connect_timeout).await {
            handle.close().await;
            return Err(e);
        }
        Ok(handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::testing::FixedTelemetry;
    use serde_json::json;

    #[test]
    fn connect_url_appends_token() {
        let reg = Registration {
            token: "abc def".into(),
            endpoint: "ws://localhost:5001".into(),
        };
        assert_eq!(reg.connect_url().unwrap().as_str(), "ws://localhost:5001/?token=abc+def");

        let reg = Registration {
            token: "t".into(),
            endpoint: "wss://example.com/ws?region=eu".into(),
        };
        assert_eq!(reg.connect_url().unwrap().as_str(), "wss://example.com/ws?region=eu&token=t");
    }

    #[test]
    fn invalid_endpoint_is_a_connection_error() {
        let reg = Registration {
            token: "t".into(),
            endpoint: "not a url".into(),
        };
        assert!(matches!(reg.connect_url(), Err(SessionError::ConnectionClosed(_))));
    }

    #[test]
    fn metadata_matches_registration_body() {
        let config = AgentConfig {
            device_id: "pi-0badf00d".into(),
            ..AgentConfig::default()
        };
        let body = serde_json::to_value(DeviceMetadata::collect(&config, &FixedTelemetry)).unwrap();

        assert_eq!(body["device_id"], "pi-0badf00d");
        assert_eq!(body["device_type"], "raspberry_pi");
        assert_eq!(body["camera_module"], "Camera Module 3");
        assert_eq!(body["hardware_info"]["model"], "Test Board");
        assert_eq!(body["hardware_info"]["system_info"]["hostname"], json!("test-host"));
    }

    #[tokio::test]
    async fn unreachable_api_is_a_registration_failure() {
        let config = AgentConfig {
            api_server: "http://127.0.0.1:9".into(),
            registration_timeout: Duration::from_secs(2),
            ..AgentConfig::default()
        };
        let control = HttpControlPlane::new(&config).unwrap();
        let metadata = DeviceMetadata::collect(&config, &FixedTelemetry);

        assert!(matches!(
            control.register(&metadata).await,
            Err(SessionError::RegistrationFailed(_))
        ));
    }
}
