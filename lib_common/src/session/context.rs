use std::sync::Arc;

use crate::camera::{Resolution, SharedCamera};
use crate::configs::AgentConfig;
use crate::utils::misc::sys_info::TelemetryProvider;

/// Handles shared by every task of a session. Cheap to clone.
#[derive(Clone)]
pub struct SessionContext {
    pub config: Arc<AgentConfig>,
    pub camera: SharedCamera,
    pub telemetry: Arc<dyn TelemetryProvider>,
}

impl SessionContext {
    pub fn new(config: AgentConfig, camera: SharedCamera, telemetry: Arc<dyn TelemetryProvider>) -> Self {
        Self {
            config: Arc::new(config),
            camera,
            telemetry,
        }
    }

    pub fn device_id(&self) -> &str {
        &self.config.device_id
    }

    pub fn stream_resolution(&self) -> Resolution {
        Resolution::new(self.config.stream_width, self.config.stream_height)
    }

    pub fn still_resolution(&self) -> Resolution {
        Resolution::new(self.config.still_width, self.config.still_height)
    }
}
