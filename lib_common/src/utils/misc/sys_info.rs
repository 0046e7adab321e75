//! Host telemetry for registration metadata and periodic status updates.
//!
//! Every reading is best effort: a value that cannot be read degrades to a
//! documented fallback instead of failing the caller.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;

use hostname::get;
use local_ip_address::local_ip;
use serde::{Deserialize, Serialize};

/// Fallback board model when the device tree is not readable.
pub const UNKNOWN_MODEL: &str = "Unknown Raspberry Pi";

/// # System Information
///
/// Host description sent inside `hardware_info.system_info` at registration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemInfo {
    /// Operating system family (`linux`, `macos`, ...).
    pub os: String,
    /// CPU architecture (`aarch64`, `arm`, `x86_64`, ...).
    pub arch: String,
    /// Hostname, or `unknown` when it cannot be read.
    pub hostname: String,
    /// First non-loopback local IP address, when one exists.
    pub local_ip: Option<String>,
    /// Version of the running agent.
    pub agent_version: String,
}

impl fmt::Display for SystemInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "SystemInfo
    OS: {} ({}),
    Host: {},
    Host ip: {},
    Agent version: {}
",
            self.os,
            self.arch,
            self.hostname,
            self.local_ip.as_deref().unwrap_or("-"),
            self.agent_version,
        )
    }
}

/// Source of device telemetry consumed by the session layer.
pub trait TelemetryProvider: Send + Sync {
    /// Battery charge in percent, `None` when the device has no readable battery.
    fn battery(&self) -> Option<u8>;

    /// Seconds since boot.
    fn uptime_secs(&self) -> u64;

    /// Board model string.
    fn hardware_model(&self) -> String;

    /// Host description.
    fn system_info(&self) -> SystemInfo;
}

/// # Host Telemetry
///
/// Reads the Linux `sysfs`/`procfs` files of the host the agent runs on.
#[derive(Debug, Clone)]
pub struct HostTelemetry {
    power_supply_dir: PathBuf,
    proc_dir: PathBuf,
    device_tree_model: PathBuf,
    started: Instant,
}

impl Default for HostTelemetry {
    fn default() -> Self {
        Self::new()
    }
}

impl HostTelemetry {
    /// Telemetry backed by the real `/sys` and `/proc`.
    pub fn new() -> Self {
        Self::with_roots("/sys/class/power_supply", "/proc")
    }

    /// Telemetry reading from alternative roots, e.g. a fixture directory.
    pub fn with_roots(power_supply_dir: impl Into<PathBuf>, proc_dir: impl Into<PathBuf>) -> Self {
        let proc_dir = proc_dir.into();
        Self {
            power_supply_dir: power_supply_dir.into(),
            device_tree_model: proc_dir.join("device-tree").join("model"),
            proc_dir,
            started: Instant::now(),
        }
    }

    fn read_capacity(dir: &Path) -> Option<u8> {
        let mut supplies: Vec<PathBuf> = fs::read_dir(dir)
            .ok()?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .collect();
        supplies.sort();

        supplies.iter().find_map(|supply| {
            let raw = fs::read_to_string(supply.join("capacity")).ok()?;
            let pct = raw.trim().parse::<u16>().ok()?;
            Some(pct.min(100) as u8)
        })
    }
}

impl TelemetryProvider for HostTelemetry {
    fn battery(&self) -> Option<u8> {
        Self::read_capacity(&self.power_supply_dir)
    }

    fn uptime_secs(&self) -> u64 {
        fs::read_to_string(self.proc_dir.join("uptime"))
            .ok()
            .and_then(|raw| raw.split_whitespace().next()?.parse::<f64>().ok())
            .map(|secs| secs as u64)
            .unwrap_or_else(|| self.started.elapsed().as_secs())
    }

    fn hardware_model(&self) -> String {
        fs::read_to_string(&self.device_tree_model)
            .ok()
            // The device tree string is NUL-terminated.
            .map(|raw| raw.trim_matches(|c: char| c == '\0' || c.is_whitespace()).to_string())
            .filter(|model| !model.is_empty())
            .unwrap_or_else(|| UNKNOWN_MODEL.to_string())
    }

    fn system_info(&self) -> SystemInfo {
        let hostname = match get() {
            Ok(name) => name.to_string_lossy().into_owned(),
            Err(e) => {
                log::debug!("Hostname unavailable: {}", e);
                "unknown".to_string()
            }
        };
        let local_ip = match local_ip() {
            Ok(ip) => Some(ip.to_string()),
            Err(e) => {
                log::debug!("Local IP unavailable: {}", e);
                None
            }
        };

        SystemInfo {
            os: std::env::consts::OS.to_string(),
            arch: std::env::consts::ARCH.to_string(),
            hostname,
            local_ip,
            agent_version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}
