//! Subsystem settings.
//!
//! Settings are read from an optional JSON file (camelCase keys, every field
//! optional) and then overridden from `PVSTREAM_*` environment variables:
//!
//! | variable | field |
//! |---|---|
//! | `PVSTREAM_CONFIG` | path of the JSON file |
//! | `PVSTREAM_SIM_MODE` | `true`/`1`/`yes`/empty = simulated, anything else = live |
//! | `PVSTREAM_LIVE_ADDR` | `liveAddr` |
//! | `PVSTREAM_WS_ADDR` | `wsAddr` |
//! | `PVSTREAM_HTTP_ADDR` | `httpAddr` |
//! | `PVSTREAM_MAX_RAW_POINTS` | `maxRawPoints` |
//! | `PVSTREAM_PUT_TIMEOUT_MS` | `putTimeoutMs` |
//! | `PVSTREAM_PRUNE_IDLE_MINUTES` | `pruneIdleMinutes` |

use std::net::SocketAddr;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::history::DEFAULT_MAX_RAW_POINTS;

/// Errors that can occur while loading settings.
#[derive(Debug)]
pub enum ConfigError {
    /// The settings file does not exist.
    NotFound(String),
    /// Failed to read the settings file.
    ReadError(String),
    /// Settings data is invalid.
    InvalidData(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::NotFound(path) => write!(f, "Configuration not found: {}", path),
            ConfigError::ReadError(msg) => write!(f, "Read error: {}", msg),
            ConfigError::InvalidData(msg) => write!(f, "Invalid data: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

/// Which value source variant the process runs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceMode {
    #[default]
    Simulated,
    Live,
}

impl SourceMode {
    /// Interpret a `PVSTREAM_SIM_MODE` value.
    pub fn from_sim_flag(flag: &str) -> Self {
        match flag.trim().to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" | "" => SourceMode::Simulated,
            _ => SourceMode::Live,
        }
    }
}

/// Settings for the acquisition, caching and fan-out subsystem.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Settings {
    /// WebSocket stream bind address.
    pub ws_addr: SocketAddr,

    /// HTTP API bind address.
    pub http_addr: SocketAddr,

    /// Source variant to start.
    pub mode: SourceMode,

    /// Address of the live line-JSON gateway.
    pub live_addr: String,

    /// Raw sample bound per history buffer.
    pub max_raw_points: usize,

    /// Base tick period of simulated variables (jittered ±50 %).
    pub tick_interval_ms: u64,

    /// Simulated motor speed in units per second.
    pub motor_speed: f64,

    /// Simulated motor time-step.
    pub motor_step_ms: u64,

    /// Live put and discovery timeout.
    pub put_timeout_ms: u64,

    /// Outbound message queue per client connection.
    pub client_queue_capacity: usize,

    /// Queue between the live client's threads and the dispatcher.
    pub live_queue_capacity: usize,

    /// Prune idle last-value entries after this many minutes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prune_idle_minutes: Option<u32>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            ws_addr: SocketAddr::from(([0, 0, 0, 0], 3000)),
            http_addr: SocketAddr::from(([0, 0, 0, 0], 3001)),
            mode: SourceMode::Simulated,
            live_addr: "127.0.0.1:5064".to_string(),
            max_raw_points: DEFAULT_MAX_RAW_POINTS,
            tick_interval_ms: 500,
            motor_speed: 5.0,
            motor_step_ms: 50,
            put_timeout_ms: 5_000,
            client_queue_capacity: 1_024,
            live_queue_capacity: 4_096,
            prune_idle_minutes: None,
        }
    }
}

impl Settings {
    /// Parse settings from JSON text. Missing fields take their defaults.
    pub fn from_json(text: &str) -> Result<Self, ConfigError> {
        serde_json::from_str(text).map_err(|e| ConfigError::InvalidData(e.to_string()))
    }

    /// Load settings from a JSON file, or defaults when no path is given.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let text = std::fs::read_to_string(path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => ConfigError::NotFound(path.display().to_string()),
            _ => ConfigError::ReadError(e.to_string()),
        })?;
        Self::from_json(&text)
    }

    /// Load from `PVSTREAM_CONFIG` (if set) and apply environment overrides.
    pub fn from_env() -> Result<Self, ConfigError> {
        let path = std::env::var("PVSTREAM_CONFIG").ok();
        let mut settings = Self::load(path.as_deref().map(Path::new))?;
        settings.apply_env(|key| std::env::var(key).ok())?;
        Ok(settings)
    }

    /// Apply `PVSTREAM_*` overrides using the given variable lookup.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(flag) = lookup("PVSTREAM_SIM_MODE") {
            self.mode = SourceMode::from_sim_flag(&flag);
        }
        if let Some(addr) = lookup("PVSTREAM_LIVE_ADDR") {
            self.live_addr = addr;
        }
        if let Some(addr) = lookup("PVSTREAM_WS_ADDR") {
            self.ws_addr = parse_var("PVSTREAM_WS_ADDR", &addr)?;
        }
        if let Some(addr) = lookup("PVSTREAM_HTTP_ADDR") {
            self.http_addr = parse_var("PVSTREAM_HTTP_ADDR", &addr)?;
        }
        if let Some(n) = lookup("PVSTREAM_MAX_RAW_POINTS") {
            self.max_raw_points = parse_var("PVSTREAM_MAX_RAW_POINTS", &n)?;
        }
        if let Some(ms) = lookup("PVSTREAM_PUT_TIMEOUT_MS") {
            self.put_timeout_ms = parse_var("PVSTREAM_PUT_TIMEOUT_MS", &ms)?;
        }
        if let Some(minutes) = lookup("PVSTREAM_PRUNE_IDLE_MINUTES") {
            self.prune_idle_minutes = Some(parse_var("PVSTREAM_PRUNE_IDLE_MINUTES", &minutes)?);
        }
        Ok(())
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms.max(1))
    }

    pub fn motor_step(&self) -> Duration {
        Duration::from_millis(self.motor_step_ms.max(1))
    }

    pub fn put_timeout(&self) -> Duration {
        Duration::from_millis(self.put_timeout_ms)
    }

    pub fn prune_idle(&self) -> Option<Duration> {
        self.prune_idle_minutes
            .map(|m| Duration::from_secs(u64::from(m) * 60))
    }
}

fn parse_var<T: FromStr>(key: &str, raw: &str) -> Result<T, ConfigError> {
    raw.trim()
        .parse()
        .map_err(|_| ConfigError::InvalidData(format!("{key}: cannot parse {raw:?}")))
}
