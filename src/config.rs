//! Runtime configuration from environment variables
//!
//! Read once at startup; nothing here is hot reloaded.

use crate::pipeline::actuation::ActuationConfig;
use crate::pipeline::direction::{parse_port_range, ZoneMap};
use crate::pipeline::lane::{parse_lanes, Lane};
use crate::reader::backoff::ReconnectPolicy;
use crate::reader::types::AntennaConfig;
use std::env;
use std::ops::RangeInclusive;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug)]
pub enum ConfigError {
    MissingVariable(String),
    InvalidValue(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::MissingVariable(var) => write!(f, "Missing environment variable: {}", var),
            ConfigError::InvalidValue(msg) => write!(f, "Invalid configuration value: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

/// Known checkpoint installations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointLayout {
    /// One 13-port reader across a dock door
    DockDoor,
    /// One 4-port reader serving two shipping lanes
    Lane,
}

impl FromStr for CheckpointLayout {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "dock-door" | "dock_door" => Ok(CheckpointLayout::DockDoor),
            "lane" => Ok(CheckpointLayout::Lane),
            other => Err(ConfigError::InvalidValue(format!(
                "CHECKPOINT_LAYOUT '{}' must be 'dock-door' or 'lane'",
                other
            ))),
        }
    }
}

impl From<CheckpointLayout> for &'static str {
    fn from(layout: CheckpointLayout) -> &'static str {
        match layout {
            CheckpointLayout::DockDoor => "dock-door",
            CheckpointLayout::Lane => "lane",
        }
    }
}

/// Radio settings for a range of ports, overriding the uniform defaults
#[derive(Debug, Clone, PartialEq)]
pub struct PortOverride {
    pub ports: RangeInclusive<u16>,
    pub tx_power_dbm: f64,
    pub rx_sensitivity_dbm: f64,
}

/// Parse `"1-2:20:-75,3-4:20:-45"` (ports:tx:rx)
pub fn parse_port_overrides(raw: &str) -> Result<Vec<PortOverride>, String> {
    raw.split(',')
        .map(str::trim)
        .filter(|e| !e.is_empty())
        .map(|entry| {
            let parts: Vec<&str> = entry.split(':').map(str::trim).collect();
            let [range, tx, rx] = parts.as_slice() else {
                return Err(format!("port setting '{}' must be RANGE:TX:RX", entry));
            };
            let number = |v: &str| v.parse::<f64>().map_err(|_| format!("invalid dBm value '{}'", v));

            Ok(PortOverride {
                ports: parse_port_range(range)?,
                tx_power_dbm: number(*tx)?,
                rx_sensitivity_dbm: number(*rx)?,
            })
        })
        .collect()
}

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub reader_address: String,
    pub layout: CheckpointLayout,
    pub zones: ZoneMap,
    pub lanes: Vec<Lane>,
    pub antenna_ports: RangeInclusive<u16>,
    pub tx_power_dbm: f64,
    pub rx_sensitivity_dbm: f64,
    pub port_overrides: Vec<PortOverride>,
    pub quiescence: Duration,
    pub liveness_interval: Duration,
    pub reconnect: ReconnectPolicy,
    pub notify_channel: String,
    pub actuation: ActuationConfig,
    pub output_jsonl_path: Option<String>,
    pub output_max_size_mb: u64,
    pub output_max_rotations: u32,
    pub rust_log: String,
}

impl RuntimeConfig {
    /// Preset values of a known installation
    pub fn for_layout(reader_address: impl Into<String>, layout: CheckpointLayout) -> Self {
        let base = Self {
            reader_address: reader_address.into(),
            layout,
            zones: ZoneMap::dock_door(),
            lanes: Vec::new(),
            antenna_ports: 1..=13,
            tx_power_dbm: 30.0,
            rx_sensitivity_dbm: -80.0,
            port_overrides: Vec::new(),
            quiescence: Duration::from_secs(5),
            liveness_interval: Duration::from_secs(30),
            reconnect: ReconnectPolicy::default(),
            notify_channel: "EntradaPT".to_string(),
            actuation: ActuationConfig::default(),
            output_jsonl_path: None,
            output_max_size_mb: 100,
            output_max_rotations: 10,
            rust_log: "info".to_string(),
        };

        match layout {
            CheckpointLayout::DockDoor => base,
            CheckpointLayout::Lane => Self {
                zones: ZoneMap::lane(),
                lanes: vec![Lane::new("Carril2", 1..=2), Lane::new("Carril3", 3..=4)],
                antenna_ports: 1..=4,
                tx_power_dbm: 20.0,
                rx_sensitivity_dbm: -45.0,
                port_overrides: vec![PortOverride {
                    ports: 1..=2,
                    tx_power_dbm: 20.0,
                    rx_sensitivity_dbm: -75.0,
                }],
                notify_channel: "Embarque".to_string(),
                ..base
            },
        }
    }

    /// Load configuration from environment variables
    ///
    /// `READER_ADDRESS` is required. Everything else starts from the
    /// `CHECKPOINT_LAYOUT` preset (default `dock-door`) and is overridden by
    /// whichever of these are set: `ZONE_MAP`, `LANES`, `ANTENNA_PORTS`,
    /// `TX_POWER_DBM`, `RX_SENSITIVITY_DBM`, `PORT_SETTINGS`, `QUIESCENCE_MS`,
    /// `LIVENESS_INTERVAL_MS`, `MAX_RECONNECT_ATTEMPTS`, `RETRY_DELAY_MS`,
    /// `NOTIFY_CHANNEL`, `PRIMARY_OUTPUT_PORT`, `SECONDARY_OUTPUT_PORT`,
    /// `OUTPUT_PORT_COUNT`, `VALID_PULSE_MS`, `INVALID_PULSE_MS`,
    /// `OUTPUT_JSONL_PATH`, `OUTPUT_MAX_SIZE_MB`, `OUTPUT_MAX_ROTATIONS`,
    /// `RUST_LOG`.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Same as [`from_env`](Self::from_env) with a custom variable source
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let reader_address = lookup("READER_ADDRESS")
            .filter(|s| !s.trim().is_empty())
            .ok_or_else(|| ConfigError::MissingVariable("READER_ADDRESS".to_string()))?;

        let layout = match lookup("CHECKPOINT_LAYOUT") {
            Some(s) => s.parse()?,
            None => CheckpointLayout::DockDoor,
        };

        let mut config = Self::for_layout(reader_address.trim(), layout);
        let invalid = |var: &str, msg: String| ConfigError::InvalidValue(format!("{}: {}", var, msg));

        if let Some(s) = lookup("ZONE_MAP") {
            config.zones = ZoneMap::parse(&s).map_err(|e| invalid("ZONE_MAP", e))?;
        }
        if let Some(s) = lookup("LANES") {
            config.lanes = parse_lanes(&s).map_err(|e| invalid("LANES", e))?;
        }
        if let Some(s) = lookup("ANTENNA_PORTS") {
            config.antenna_ports = parse_port_range(&s).map_err(|e| invalid("ANTENNA_PORTS", e))?;
        }
        if let Some(s) = lookup("PORT_SETTINGS") {
            config.port_overrides = parse_port_overrides(&s).map_err(|e| invalid("PORT_SETTINGS", e))?;
        }

        config.tx_power_dbm = parse_var(&lookup, "TX_POWER_DBM", config.tx_power_dbm)?;
        config.rx_sensitivity_dbm = parse_var(&lookup, "RX_SENSITIVITY_DBM", config.rx_sensitivity_dbm)?;
        config.quiescence = parse_millis(&lookup, "QUIESCENCE_MS", config.quiescence)?;
        config.liveness_interval = parse_millis(&lookup, "LIVENESS_INTERVAL_MS", config.liveness_interval)?;
        config.reconnect.max_attempts = parse_var(&lookup, "MAX_RECONNECT_ATTEMPTS", config.reconnect.max_attempts)?;
        config.reconnect.retry_delay = parse_millis(&lookup, "RETRY_DELAY_MS", config.reconnect.retry_delay)?;
        config.actuation.primary_port = parse_var(&lookup, "PRIMARY_OUTPUT_PORT", config.actuation.primary_port)?;
        config.actuation.secondary_port = parse_var(&lookup, "SECONDARY_OUTPUT_PORT", config.actuation.secondary_port)?;
        config.actuation.port_count = parse_var(&lookup, "OUTPUT_PORT_COUNT", config.actuation.port_count)?;
        config.actuation.valid_pulse = parse_millis(&lookup, "VALID_PULSE_MS", config.actuation.valid_pulse)?;
        config.actuation.invalid_pulse = parse_millis(&lookup, "INVALID_PULSE_MS", config.actuation.invalid_pulse)?;
        config.output_max_size_mb = parse_var(&lookup, "OUTPUT_MAX_SIZE_MB", config.output_max_size_mb)?;
        config.output_max_rotations = parse_var(&lookup, "OUTPUT_MAX_ROTATIONS", config.output_max_rotations)?;

        if let Some(channel) = lookup("NOTIFY_CHANNEL").filter(|s| !s.trim().is_empty()) {
            config.notify_channel = channel.trim().to_string();
        }
        config.output_jsonl_path = lookup("OUTPUT_JSONL_PATH").filter(|s| !s.trim().is_empty());
        if let Some(level) = lookup("RUST_LOG") {
            config.rust_log = level;
        }

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.reconnect.max_attempts == 0 {
            return Err(ConfigError::InvalidValue(
                "MAX_RECONNECT_ATTEMPTS must be at least 1".to_string(),
            ));
        }
        if self.quiescence.is_zero() || self.liveness_interval.is_zero() {
            return Err(ConfigError::InvalidValue(
                "QUIESCENCE_MS and LIVENESS_INTERVAL_MS must be positive".to_string(),
            ));
        }

        for lane in &self.lanes {
            if !self.antenna_ports.contains(lane.ports.start()) || !self.antenna_ports.contains(lane.ports.end()) {
                return Err(ConfigError::InvalidValue(format!(
                    "lane '{}' ports {:?} outside ANTENNA_PORTS {:?}",
                    lane.name, lane.ports, self.antenna_ports
                )));
            }
        }

        let outputs = 1..=self.actuation.port_count;
        if !outputs.contains(&self.actuation.primary_port) || !outputs.contains(&self.actuation.secondary_port) {
            return Err(ConfigError::InvalidValue(format!(
                "output ports {} and {} must be within 1..={}",
                self.actuation.primary_port, self.actuation.secondary_port, self.actuation.port_count
            )));
        }

        Ok(())
    }

    pub fn lane(&self, name: &str) -> Option<&Lane> {
        self.lanes.iter().find(|l| l.name.eq_ignore_ascii_case(name))
    }

    /// Antenna settings to push on session start
    ///
    /// With a lane, every port stays listed but only the lane's ports are
    /// enabled.
    pub fn antenna_config(&self, lane: Option<&Lane>) -> AntennaConfig {
        let mut config = AntennaConfig::uniform(self.antenna_ports.clone(), self.tx_power_dbm, self.rx_sensitivity_dbm);

        for antenna in config.antennas.iter_mut() {
            if let Some(o) = self.port_overrides.iter().find(|o| o.ports.contains(&antenna.port)) {
                antenna.tx_power_dbm = o.tx_power_dbm;
                antenna.rx_sensitivity_dbm = o.rx_sensitivity_dbm;
            }
        }

        match lane {
            Some(lane) => config.restrict_to(|port| lane.covers(port)),
            None => config,
        }
    }

    pub fn log_summary(&self) {
        log::info!("⚙️  Checkpoint configuration");
        log::info!("   ├─ Reader: {}", self.reader_address);
        log::info!("   ├─ Layout: {}", <&str>::from(self.layout));
        log::info!(
            "   ├─ Antennas: {:?} (tx {} dBm, rx {} dBm, {} overrides)",
            self.antenna_ports,
            self.tx_power_dbm,
            self.rx_sensitivity_dbm,
            self.port_overrides.len()
        );
        for zone in self.zones.zones() {
            log::info!("   ├─ Zone {}: ports {:?} ({:?})", zone.name, zone.ports, zone.side);
        }
        for lane in &self.lanes {
            log::info!("   ├─ Lane {}: ports {:?} → '{}'", lane.name, lane.ports, lane.channel);
        }
        log::info!("   ├─ Quiescence: {}ms", self.quiescence.as_millis());
        log::info!("   ├─ Liveness interval: {}ms", self.liveness_interval.as_millis());
        log::info!(
            "   ├─ Reconnect: {} attempts, {}ms apart",
            self.reconnect.max_attempts,
            self.reconnect.retry_delay.as_millis()
        );
        log::info!(
            "   ├─ Outputs: primary {}, secondary {} of {}",
            self.actuation.primary_port,
            self.actuation.secondary_port,
            self.actuation.port_count
        );
        log::info!("   └─ Channel: {}", self.notify_channel);
    }
}

/// Traffic settings for the simulated reader used by the runtime binary
#[derive(Debug, Clone, PartialEq)]
pub struct SimulationConfig {
    pub tag_interval: Duration,
    pub tag_population: usize,
}

impl SimulationConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| env::var(var).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let config = Self {
            tag_interval: parse_millis(&lookup, "SIM_TAG_INTERVAL_MS", Duration::from_millis(250))?,
            tag_population: parse_var(&lookup, "SIM_TAG_POPULATION", 40)?,
        };

        if config.tag_interval.is_zero() {
            return Err(ConfigError::InvalidValue("SIM_TAG_INTERVAL_MS must be positive".to_string()));
        }
        if config.tag_population == 0 {
            return Err(ConfigError::InvalidValue("SIM_TAG_POPULATION must be positive".to_string()));
        }

        Ok(config)
    }
}

fn parse_var<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, var: &str, default: T) -> Result<T, ConfigError> {
    match lookup(var) {
        Some(s) => s
            .trim()
            .parse::<T>()
            .map_err(|_| ConfigError::InvalidValue(format!("{}: cannot parse '{}'", var, s))),
        None => Ok(default),
    }
}

fn parse_millis(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &str,
    default: Duration,
) -> Result<Duration, ConfigError> {
    let millis = parse_var(lookup, var, default.as_millis() as u64)?;
    Ok(Duration::from_millis(millis))
}
