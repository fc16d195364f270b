//! Router configuration.
//!
//! Loaded from a TOML file: a `[general]` table and an `[[endpoint]]`
//! array. Endpoint kinds `nmea0183` and `nmea0183hs` are serial presets
//! (4800 and 38400 Bd); `serial` takes explicit parameters. Each endpoint
//! carries a route list binding sentence prefixes to target endpoints.

use crate::error::{Result, RouterError};
use crate::route;
use serde::Deserialize;
use std::collections::hash_map::DefaultHasher;
use std::collections::HashSet;
use std::hash::{Hash, Hasher};
use std::path::Path;
use tokio::fs;

#[derive(Debug, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub endpoint: Vec<EndpointConfig>,
    /// Digest of the raw config text, for invalidating persisted port
    /// bindings when the file changes. Filled in by the loader.
    #[serde(skip)]
    pub digest: String,
}

#[derive(Debug, Deserialize)]
pub struct GeneralConfig {
    /// Window an unresolved serial endpoint gets per port trial.
    #[serde(default = "default_resolv_timeout_ms")]
    pub resolv_timeout_ms: u64,
    /// Operator console listener; disabled when absent.
    pub ctrl_port: Option<u16>,
    #[serde(default = "default_state_file")]
    pub state_file: String,
    /// Per-endpoint writer queue depth.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            resolv_timeout_ms: default_resolv_timeout_ms(),
            ctrl_port: None,
            state_file: default_state_file(),
            queue_capacity: default_queue_capacity(),
        }
    }
}

fn default_resolv_timeout_ms() -> u64 {
    2000
}
fn default_state_file() -> String {
    "nmea-router-state.toml".to_string()
}
fn default_queue_capacity() -> usize {
    64
}
fn default_expire_ms() -> u64 {
    route::DEFAULT_EXPIRE_MS
}
fn default_speed() -> u32 {
    4800
}
fn default_bits() -> u8 {
    8
}
fn default_stops() -> u8 {
    1
}
fn default_nmea_port() -> u16 {
    10110
}

#[derive(Debug, Deserialize, Clone)]
pub struct RouteConfig {
    pub prefix: String,
    #[serde(default)]
    pub target: Vec<String>,
    #[serde(default)]
    pub backup: bool,
    #[serde(default = "default_expire_ms")]
    pub expire_ms: u64,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum ParityConfig {
    #[default]
    None,
    Odd,
    Even,
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum FlowControlConfig {
    #[default]
    None,
    Software,
    Hardware,
}

/// Explicit serial line parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SerialSettings {
    pub speed: u32,
    pub bits: u8,
    pub parity: ParityConfig,
    pub stops: u8,
    pub flow_control: FlowControlConfig,
}

impl SerialSettings {
    fn preset(speed: u32) -> Self {
        Self {
            speed,
            bits: 8,
            parity: ParityConfig::None,
            stops: 1,
            flow_control: FlowControlConfig::None,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(tag = "type")]
#[serde(rename_all = "snake_case")]
pub enum EndpointConfig {
    /// Serial endpoint with explicit line parameters.
    Serial {
        name: String,
        #[serde(default = "default_speed")]
        speed: u32,
        #[serde(default = "default_bits")]
        bits: u8,
        #[serde(default)]
        parity: ParityConfig,
        #[serde(default = "default_stops")]
        stops: u8,
        #[serde(default)]
        flow_control: FlowControlConfig,
        #[serde(default)]
        route: Vec<RouteConfig>,
        script: Option<String>,
    },
    /// Standard NMEA 0183 talker, 4800 Bd 8N1.
    Nmea0183 {
        name: String,
        #[serde(default)]
        route: Vec<RouteConfig>,
        script: Option<String>,
    },
    /// High-speed NMEA 0183 (AIS receivers), 38400 Bd 8N1.
    #[serde(rename = "nmea0183hs")]
    Nmea0183Hs {
        name: String,
        #[serde(default)]
        route: Vec<RouteConfig>,
        script: Option<String>,
    },
    /// UDP endpoint bound to `port`, sending to `address:port`.
    Datagram {
        name: String,
        address: String,
        #[serde(default = "default_nmea_port")]
        port: u16,
        #[serde(default)]
        route: Vec<RouteConfig>,
        script: Option<String>,
    },
    /// UDP broadcast on the standard NMEA port (or an explicit one).
    Broadcast {
        name: String,
        #[serde(default = "default_nmea_port")]
        port: u16,
        #[serde(default)]
        route: Vec<RouteConfig>,
        script: Option<String>,
    },
    /// TCP listener; connected clients receive the routed stream and their
    /// input is matched with the listener's routes.
    TcpListener {
        name: String,
        port: u16,
        #[serde(default)]
        route: Vec<RouteConfig>,
    },
}

impl EndpointConfig {
    pub fn name(&self) -> &str {
        match self {
            EndpointConfig::Serial { name, .. }
            | EndpointConfig::Nmea0183 { name, .. }
            | EndpointConfig::Nmea0183Hs { name, .. }
            | EndpointConfig::Datagram { name, .. }
            | EndpointConfig::Broadcast { name, .. }
            | EndpointConfig::TcpListener { name, .. } => name,
        }
    }

    pub fn routes(&self) -> &[RouteConfig] {
        match self {
            EndpointConfig::Serial { route, .. }
            | EndpointConfig::Nmea0183 { route, .. }
            | EndpointConfig::Nmea0183Hs { route, .. }
            | EndpointConfig::Datagram { route, .. }
            | EndpointConfig::Broadcast { route, .. }
            | EndpointConfig::TcpListener { route, .. } => route,
        }
    }

    pub fn script(&self) -> Option<&str> {
        match self {
            EndpointConfig::Serial { script, .. }
            | EndpointConfig::Nmea0183 { script, .. }
            | EndpointConfig::Nmea0183Hs { script, .. }
            | EndpointConfig::Datagram { script, .. }
            | EndpointConfig::Broadcast { script, .. } => script.as_deref(),
            EndpointConfig::TcpListener { .. } => None,
        }
    }

    /// Serial line parameters for the resolution engine, `None` for
    /// non-serial endpoints.
    pub fn serial_settings(&self) -> Option<SerialSettings> {
        match self {
            EndpointConfig::Serial {
                speed,
                bits,
                parity,
                stops,
                flow_control,
                ..
            } => Some(SerialSettings {
                speed: *speed,
                bits: *bits,
                parity: *parity,
                stops: *stops,
                flow_control: *flow_control,
            }),
            EndpointConfig::Nmea0183 { .. } => Some(SerialSettings::preset(4800)),
            EndpointConfig::Nmea0183Hs { .. } => Some(SerialSettings::preset(38400)),
            _ => None,
        }
    }

    pub fn is_serial(&self) -> bool {
        self.serial_settings().is_some()
    }
}

impl Config {
    pub async fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = fs::read_to_string(path.as_ref())
            .await
            .map_err(|e| RouterError::config(format!("cannot read config file: {e}")))?;
        Self::from_str(&text)
    }

    pub fn from_str(text: &str) -> Result<Self> {
        let mut config: Config = toml::from_str(text)
            .map_err(|e| RouterError::config(format!("cannot parse config file: {e}")))?;
        config.digest = digest(text);
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.general.queue_capacity < 8 {
            return Err(RouterError::config(format!(
                "queue_capacity too small: {}",
                self.general.queue_capacity
            )));
        }

        let mut names = HashSet::new();
        for ep in &self.endpoint {
            let name = ep.name();
            if name.is_empty() {
                return Err(RouterError::config("endpoint with empty name"));
            }
            if !names.insert(name) {
                return Err(RouterError::config(format!(
                    "duplicate endpoint name '{name}'"
                )));
            }
        }

        let mut tcp_ports = HashSet::new();
        if let Some(port) = self.general.ctrl_port {
            tcp_ports.insert(port);
        }

        for ep in &self.endpoint {
            let name = ep.name();
            if ep.is_serial() && ep.routes().is_empty() {
                return Err(RouterError::config(format!(
                    "serial endpoint '{name}' declares no routes and could never resolve"
                )));
            }
            if let Some(settings) = ep.serial_settings() {
                if !(5..=8).contains(&settings.bits) {
                    return Err(RouterError::config(format!(
                        "endpoint '{name}': unsupported data bits {}",
                        settings.bits
                    )));
                }
                if !(1..=2).contains(&settings.stops) {
                    return Err(RouterError::config(format!(
                        "endpoint '{name}': unsupported stop bits {}",
                        settings.stops
                    )));
                }
            }
            if let EndpointConfig::TcpListener { port, .. } = ep {
                if !tcp_ports.insert(*port) {
                    return Err(RouterError::config(format!(
                        "duplicate TCP port {port} on endpoint '{name}'"
                    )));
                }
            }
            for route in ep.routes() {
                if route.prefix.is_empty() {
                    return Err(RouterError::config(format!(
                        "empty route prefix on endpoint '{name}'"
                    )));
                }
                if !route.prefix.bytes().all(|b| (0x20..0x7f).contains(&b)) {
                    return Err(RouterError::config(format!(
                        "non-printable route prefix on endpoint '{name}'"
                    )));
                }
                for target in &route.target {
                    if !names.contains(target.as_str()) {
                        return Err(RouterError::config(format!(
                            "route target '{target}' on endpoint '{name}' is not a configured endpoint"
                        )));
                    }
                }
            }
            if let Some(script) = ep.script() {
                crate::script::parse(script).map_err(|e| {
                    RouterError::config(format!("script on endpoint '{name}': {e}"))
                })?;
            }
        }
        Ok(())
    }
}

fn digest(text: &str) -> String {
    let mut hasher = DefaultHasher::new();
    text.hash(&mut hasher);
    format!("{:016x}", hasher.finish())
}
