//! # Agent Configuration
//!
//! Resolves the agent's settings with the following precedence, lowest first:
//! built-in defaults, an optional JSON file (`edge_agent.conf` or
//! `AGENT_CONFIG_PATH`), then environment variables and command-line flags.
//! A `.env` file in the working directory is loaded into the environment
//! before anything is parsed.

use std::fmt;
use std::fs;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use clap::builder::BoolishValueParser;
use clap::Parser;
use serde::{Deserialize, Serialize};
use thiserror::Error;

const DEFAULT_CONFIG_FILE: &str = "edge_agent.conf";

/// Errors raised while loading or validating the agent configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid JSON in {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Invalid value for {key}: {reason}")]
    Invalid { key: &'static str, reason: String },

    #[error("Argument error: {0}")]
    Args(#[from] clap::Error),
}

/// A camera backend integration, in the order the agent should try them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// libcamera stack (`rpicam-still` / `rpicam-vid`).
    Rpicam,
    /// Legacy firmware stack (`raspistill`).
    Legacy,
    /// Synthetic test pattern, no hardware required.
    Test,
}

impl FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "rpicam" | "libcamera" | "picamera2" => Ok(Self::Rpicam),
            "legacy" | "raspistill" | "picamera" => Ok(Self::Legacy),
            "test" | "test-pattern" => Ok(Self::Test),
            other => Err(format!("unknown camera backend '{}'", other)),
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Rpicam => "rpicam",
            Self::Legacy => "legacy",
            Self::Test => "test",
        };
        f.write_str(name)
    }
}

/// Raw, partially-specified settings as they come from one source.
///
/// Every field is optional so that sources can be layered with [`AgentArgs::merge`].
#[derive(Parser, Deserialize, Serialize, Debug, Clone, Default)]
#[clap(about = "Edge camera agent: registers the device and serves captures and live streams", version)]
#[serde(rename_all = "camelCase")]
pub struct AgentArgs {
    #[clap(long, env = "AGENT_CONFIG_PATH", help = "Path to the JSON configuration file.")]
    pub config_path: Option<PathBuf>,

    #[clap(long, env = "DEVICE_ID", help = "Stable identifier of this device.")]
    pub device_id: Option<String>,

    #[clap(long, env = "API_SERVER", help = "Base URL of the registration API.")]
    pub api_server: Option<String>,

    #[clap(long, env = "WEBSOCKET_SERVER", help = "WebSocket endpoint used when registration returns none.")]
    pub websocket_server: Option<String>,

    #[clap(long, env = "API_KEY", help = "Bearer credential presented to the registration API.")]
    pub api_key: Option<String>,

    #[clap(long, env = "DEVICE_TYPE", help = "Device type reported at registration.")]
    pub device_type: Option<String>,

    #[clap(long, env = "CAMERA_MODULE", help = "Camera module name reported at registration.")]
    pub camera_module: Option<String>,

    #[clap(long, env = "STREAM_RESOLUTION_WIDTH", help = "Width of streamed frames.")]
    pub stream_width: Option<u32>,

    #[clap(long, env = "STREAM_RESOLUTION_HEIGHT", help = "Height of streamed frames.")]
    pub stream_height: Option<u32>,

    #[clap(long, env = "STILL_RESOLUTION_WIDTH", help = "Width of still captures.")]
    pub still_width: Option<u32>,

    #[clap(long, env = "STILL_RESOLUTION_HEIGHT", help = "Height of still captures.")]
    pub still_height: Option<u32>,

    #[clap(long, env = "STREAM_QUALITY", help = "JPEG quality of streamed frames (0-100).")]
    pub stream_quality: Option<u8>,

    #[clap(long, env = "STREAM_FPS", help = "Target frames per second per stream.")]
    pub stream_fps: Option<u32>,

    #[clap(long, env = "NO_CAMERA", value_parser = BoolishValueParser::new(), help = "Run without a camera (1/0).")]
    pub no_camera: Option<bool>,

    #[clap(long, env = "TEMP_IMAGE_DIR", help = "Scratch directory for still captures.")]
    pub temp_image_dir: Option<PathBuf>,

    #[clap(long, env = "CAMERA_BACKENDS", value_delimiter = ',', help = "Ordered camera backends to try (rpicam,legacy,test).")]
    pub camera_backends: Option<Vec<BackendKind>>,

    #[clap(long, env = "RECONNECT_DELAY_SECS", help = "Fixed delay before reconnecting after a session ends.")]
    pub reconnect_delay_secs: Option<u64>,

    #[clap(long, env = "PING_INTERVAL_SECS", help = "Interval between keepalive pings.")]
    pub ping_interval_secs: Option<u64>,

    #[clap(long, env = "STATUS_INTERVAL_SECS", help = "Interval between status updates.")]
    pub status_interval_secs: Option<u64>,

    #[clap(long, env = "IDLE_TIMEOUT_SECS", help = "Seconds without inbound messages before the session is considered dead.")]
    pub idle_timeout_secs: Option<u64>,

    #[clap(long, env = "CAMERA_HEALTH_INTERVAL_SECS", help = "Interval between camera health probes (0 disables).")]
    pub camera_health_interval_secs: Option<u64>,

    #[clap(long, env = "DEBUG", value_parser = BoolishValueParser::new(), help = "Enable debug logging (true/false).")]
    pub debug: Option<bool>,

    #[clap(long, env = "LOG_DIR", help = "Directory for log files.")]
    pub log_dir: Option<PathBuf>,
}

impl AgentArgs {
    /// Merges two sources; `Some` values in `other` win.
    pub fn merge(self, other: AgentArgs) -> AgentArgs {
        AgentArgs {
            config_path: other.config_path.or(self.config_path),
            device_id: other.device_id.or(self.device_id),
            api_server: other.api_server.or(self.api_server),
            websocket_server: other.websocket_server.or(self.websocket_server),
            api_key: other.api_key.or(self.api_key),
            device_type: other.device_type.or(self.device_type),
            camera_module: other.camera_module.or(self.camera_module),
            stream_width: other.stream_width.or(self.stream_width),
            stream_height: other.stream_height.or(self.stream_height),
            still_width: other.still_width.or(self.still_width),
            still_height: other.still_height.or(self.still_height),
            stream_quality: other.stream_quality.or(self.stream_quality),
            stream_fps: other.stream_fps.or(self.stream_fps),
            no_camera: other.no_camera.or(self.no_camera),
            temp_image_dir: other.temp_image_dir.or(self.temp_image_dir),
            camera_backends: other.camera_backends.or(self.camera_backends),
            reconnect_delay_secs: other.reconnect_delay_secs.or(self.reconnect_delay_secs),
            ping_interval_secs: other.ping_interval_secs.or(self.ping_interval_secs),
            status_interval_secs: other.status_interval_secs.or(self.status_interval_secs),
            idle_timeout_secs: other.idle_timeout_secs.or(self.idle_timeout_secs),
            camera_health_interval_secs: other
                .camera_health_interval_secs
                .or(self.camera_health_interval_secs),
            debug: other.debug.or(self.debug),
            log_dir: other.log_dir.or(self.log_dir),
        }
    }

    /// Built-in defaults. The device ID is generated once per call.
    pub fn defaults() -> AgentArgs {
        AgentArgs {
            config_path: None,
            device_id: Some(generate_device_id()),
            api_server: Some("http://localhost:4000".to_string()),
            websocket_server: Some("ws://localhost:5001".to_string()),
            api_key: Some("default-api-key".to_string()),
            device_type: Some("raspberry_pi".to_string()),
            camera_module: Some("Camera Module 3".to_string()),
            stream_width: Some(640),
            stream_height: Some(480),
            still_width: Some(1920),
            still_height: Some(1080),
            stream_quality: Some(70),
            stream_fps: Some(10),
            no_camera: Some(false),
            temp_image_dir: Some(PathBuf::from("temp_images")),
            camera_backends: Some(vec![BackendKind::Rpicam, BackendKind::Legacy]),
            reconnect_delay_secs: Some(5),
            ping_interval_secs: Some(30),
            status_interval_secs: Some(60),
            idle_timeout_secs: Some(120),
            camera_health_interval_secs: Some(300),
            debug: Some(false),
            log_dir: Some(PathBuf::from("./logs")),
        }
    }

    /// Validates a fully merged set of arguments into an [`AgentConfig`].
    pub fn resolve(self) -> Result<AgentConfig, ConfigError> {
        let base = AgentArgs::defaults().merge(self);
        let defaults = AgentConfig::default();

        let stream_quality = base.stream_quality.unwrap_or(defaults.stream_quality);
        if stream_quality > 100 {
            return Err(ConfigError::Invalid {
                key: "STREAM_QUALITY",
                reason: format!("{} is outside 0-100", stream_quality),
            });
        }

        let stream_fps = base.stream_fps.unwrap_or(defaults.stream_fps);
        if stream_fps == 0 {
            return Err(ConfigError::Invalid {
                key: "STREAM_FPS",
                reason: "must be greater than zero".to_string(),
            });
        }

        let dims = [
            ("STREAM_RESOLUTION_WIDTH", base.stream_width.unwrap_or(defaults.stream_width)),
            ("STREAM_RESOLUTION_HEIGHT", base.stream_height.unwrap_or(defaults.stream_height)),
            ("STILL_RESOLUTION_WIDTH", base.still_width.unwrap_or(defaults.still_width)),
            ("STILL_RESOLUTION_HEIGHT", base.still_height.unwrap_or(defaults.still_height)),
        ];
        for (key, value) in dims {
            if value == 0 {
                return Err(ConfigError::Invalid {
                    key,
                    reason: "must be greater than zero".to_string(),
                });
            }
        }

        let device_id = base.device_id.unwrap_or(defaults.device_id);
        if device_id.trim().is_empty() {
            return Err(ConfigError::Invalid {
                key: "DEVICE_ID",
                reason: "must not be empty".to_string(),
            });
        }

        let camera_backends = base.camera_backends.unwrap_or(defaults.camera_backends);
        if camera_backends.is_empty() {
            return Err(ConfigError::Invalid {
                key: "CAMERA_BACKENDS",
                reason: "at least one backend is required".to_string(),
            });
        }

        let health_secs = base.camera_health_interval_secs.unwrap_or(300);

        Ok(AgentConfig {
            device_id,
            api_server: base.api_server.unwrap_or(defaults.api_server),
            websocket_server: base.websocket_server.unwrap_or(defaults.websocket_server),
            api_key: base.api_key.unwrap_or(defaults.api_key),
            device_type: base.device_type.unwrap_or(defaults.device_type),
            camera_module: base.camera_module.unwrap_or(defaults.camera_module),
            stream_width: dims[0].1,
            stream_height: dims[1].1,
            still_width: dims[2].1,
            still_height: dims[3].1,
            stream_quality,
            stream_fps,
            no_camera: base.no_camera.unwrap_or(false),
            temp_image_dir: base.temp_image_dir.unwrap_or(defaults.temp_image_dir),
            camera_backends,
            reconnect_delay: secs_or(base.reconnect_delay_secs, defaults.reconnect_delay),
            ping_interval: nonzero_secs(base.ping_interval_secs, "PING_INTERVAL_SECS")?
                .unwrap_or(defaults.ping_interval),
            status_interval: nonzero_secs(base.status_interval_secs, "STATUS_INTERVAL_SECS")?
                .unwrap_or(defaults.status_interval),
            idle_timeout: nonzero_secs(base.idle_timeout_secs, "IDLE_TIMEOUT_SECS")?
                .unwrap_or(defaults.idle_timeout),
            camera_health_interval: (health_secs > 0).then(|| Duration::from_secs(health_secs)),
            debug: base.debug.unwrap_or(false),
            log_dir: base.log_dir.unwrap_or(defaults.log_dir),
            ..defaults
        })
    }
}

fn secs_or(value: Option<u64>, fallback: Duration) -> Duration {
    value.map(Duration::from_secs).unwrap_or(fallback)
}

fn nonzero_secs(value: Option<u64>, key: &'static str) -> Result<Option<Duration>, ConfigError> {
    match value {
        Some(0) => Err(ConfigError::Invalid {
            key,
            reason: "must be greater than zero".to_string(),
        }),
        other => Ok(other.map(Duration::from_secs)),
    }
}

/// `pi-` followed by eight hex characters, matching the IDs issued to devices
/// that have no `DEVICE_ID` configured.
pub fn generate_device_id() -> String {
    let simple = uuid::Uuid::new_v4().simple().to_string();
    format!("pi-{}", &simple[..8])
}

/// Fully resolved, immutable agent settings.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub device_id: String,
    pub api_server: String,
    pub websocket_server: String,
    pub api_key: String,
    pub device_type: String,
    pub camera_module: String,
    pub stream_width: u32,
    pub stream_height: u32,
    pub still_width: u32,
    pub still_height: u32,
    pub stream_quality: u8,
    pub stream_fps: u32,
    pub no_camera: bool,
    pub temp_image_dir: PathBuf,
    pub camera_backends: Vec<BackendKind>,
    pub reconnect_delay: Duration,
    pub ping_interval: Duration,
    pub status_interval: Duration,
    pub idle_timeout: Duration,
    pub camera_health_interval: Option<Duration>,
    /// Bounded wait per inbound receive.
    pub receive_timeout: Duration,
    /// Wait for the `connected` confirmation after opening the socket.
    pub connect_timeout: Duration,
    /// Network timeout of the registration call.
    pub registration_timeout: Duration,
    /// Pause after a transient frame capture failure.
    pub frame_retry_delay: Duration,
    /// Longest a single outbound message may wait on the transport.
    pub send_timeout: Duration,
    pub debug: bool,
    pub log_dir: PathBuf,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            device_id: generate_device_id(),
            api_server: "http://localhost:4000".to_string(),
            websocket_server: "ws://localhost:5001".to_string(),
            api_key: "default-api-key".to_string(),
            device_type: "raspberry_pi".to_string(),
            camera_module: "Camera Module 3".to_string(),
            stream_width: 640,
            stream_height: 480,
            still_width: 1920,
            still_height: 1080,
            stream_quality: 70,
            stream_fps: 10,
            no_camera: false,
            temp_image_dir: PathBuf::from("temp_images"),
            camera_backends: vec![BackendKind::Rpicam, BackendKind::Legacy],
            reconnect_delay: Duration::from_secs(5),
            ping_interval: Duration::from_secs(30),
            status_interval: Duration::from_secs(60),
            idle_timeout: Duration::from_secs(120),
            camera_health_interval: Some(Duration::from_secs(300)),
            receive_timeout: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(10),
            registration_timeout: Duration::from_secs(30),
            frame_retry_delay: Duration::from_millis(500),
            send_timeout: Duration::from_secs(10),
            debug: false,
            log_dir: PathBuf::from("./logs"),
        }
    }
}

impl AgentConfig {
    /// Time budget of one frame at the target rate.
    pub fn frame_interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / f64::from(self.stream_fps.max(1)))
    }
}

impl fmt::Display for AgentConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let backends: Vec<String> = self.camera_backends.iter().map(|b| b.to_string()).collect();
        write!(
            f,
            "AgentConfig
    Device id: {},
    API server: {},
    WebSocket server: {},
    Stream: {}x{} @ {}fps q{},
    Still: {}x{},
    Camera: {} [{}],
    Scratch dir: {},
    Reconnect delay: {}s
",
            self.device_id,
            self.api_server,
            self.websocket_server,
            self.stream_width,
            self.stream_height,
            self.stream_fps,
            self.stream_quality,
            self.still_width,
            self.still_height,
            if self.no_camera { "disabled" } else { "enabled" },
            backends.join(","),
            self.temp_image_dir.display(),
            self.reconnect_delay.as_secs(),
        )
    }
}

/// Reads a JSON settings file. A missing file is not an error.
pub fn read_config_file(path: &PathBuf) -> Result<Option<AgentArgs>, ConfigError> {
    if !path.exists() {
        log::info!("Config file not found at {}. Using defaults and environment/CLI values.", path.display());
        return Ok(None);
    }
    let raw = fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.clone(),
        source,
    })?;
    let parsed = serde_json::from_str::<AgentArgs>(&raw).map_err(|source| ConfigError::Json {
        path: path.clone(),
        source,
    })?;
    Ok(Some(parsed))
}

/// Layers file settings under the already parsed CLI/env arguments and resolves them.
pub fn load_config_from(cli: AgentArgs) -> Result<AgentConfig, ConfigError> {
    let path = cli
        .config_path
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_FILE));

    let mut merged = AgentArgs::default();
    if let Some(file_args) = read_config_file(&path)? {
        merged = merged.merge(file_args);
    }
    merged.merge(cli).resolve()
}

/// Loads `.env`, parses the process arguments and environment, and resolves the result.
pub fn load_config() -> Result<AgentConfig, ConfigError> {
    // A missing .env is normal on deployed devices.
    let _ = dotenvy::dotenv();
    let cli = AgentArgs::try_parse()?;
    load_config_from(cli)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_resolve_to_documented_values() {
        let cfg = AgentArgs::default().resolve().expect("defaults are valid");
        assert!(cfg.device_id.starts_with("pi-"));
        assert_eq!(cfg.device_id.len(), 11);
        assert_eq!((cfg.stream_width, cfg.stream_height), (640, 480));
        assert_eq!(cfg.stream_quality, 70);
        assert_eq!(cfg.frame_interval(), Duration::from_millis(100));
        assert_eq!(cfg.camera_backends, vec![BackendKind::Rpicam, BackendKind::Legacy]);
        assert_eq!(cfg.reconnect_delay, Duration::from_secs(5));
        assert_eq!(cfg.connect_timeout, Duration::from_secs(10));
        assert_eq!(cfg.receive_timeout, Duration::from_secs(5));
        assert_eq!(cfg.send_timeout, Duration::from_secs(10));
    }

    #[test]
    fn later_sources_override_earlier_ones() {
        let file = AgentArgs {
            device_id: Some("from-file".into()),
            stream_fps: Some(5),
            ..Default::default()
        };
        let cli = AgentArgs {
            stream_fps: Some(20),
            ..Default::default()
        };
        let cfg = file.merge(cli).resolve().unwrap();
        assert_eq!(cfg.device_id, "from-file");
        assert_eq!(cfg.stream_fps, 20);
    }

    #[test]
    fn rejects_out_of_range_quality_and_zero_fps() {
        let bad_quality = AgentArgs {
            stream_quality: Some(101),
            ..Default::default()
        };
        assert!(matches!(
            bad_quality.resolve(),
            Err(ConfigError::Invalid { key: "STREAM_QUALITY", .. })
        ));

        let bad_fps = AgentArgs {
            stream_fps: Some(0),
            ..Default::default()
        };
        assert!(matches!(bad_fps.resolve(), Err(ConfigError::Invalid { key: "STREAM_FPS", .. })));
    }

    #[test]
    fn zero_health_interval_disables_probe() {
        let args = AgentArgs {
            camera_health_interval_secs: Some(0),
            ..Default::default()
        };
        assert!(args.resolve().unwrap().camera_health_interval.is_none());
    }

    #[test]
    fn parses_flags_and_backend_list() {
        let args = AgentArgs::try_parse_from([
            "edge_agent",
            "--no-camera",
            "1",
            "--camera-backends",
            "legacy,test",
        ])
        .unwrap();
        assert_eq!(args.no_camera, Some(true));
        assert_eq!(args.camera_backends, Some(vec![BackendKind::Legacy, BackendKind::Test]));
    }

    #[test]
    fn reads_camel_case_json_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("edge_agent.conf");
        fs::write(&path, r#"{"deviceId":"cam-7","streamQuality":55,"cameraBackends":["test"]}"#).unwrap();

        let cli = AgentArgs {
            config_path: Some(path),
            ..Default::default()
        };
        let cfg = load_config_from(cli).unwrap();
        assert_eq!(cfg.device_id, "cam-7");
        assert_eq!(cfg.stream_quality, 55);
        assert_eq!(cfg.camera_backends, vec![BackendKind::Test]);
    }

    #[test]
    fn missing_file_is_not_an_error() {
        let cli = AgentArgs {
            config_path: Some(PathBuf::from("/nonexistent/edge_agent.conf")),
            ..Default::default()
        };
        assert!(load_config_from(cli).is_ok());
    }
}
