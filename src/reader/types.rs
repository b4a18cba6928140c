use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A single tag read as reported by the reader
///
/// Built once by the hardware layer; fields are read-only afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TagDetection {
    epc: String,
    antenna_port: u16,
    peak_rssi_dbm: f64,
    first_seen: DateTime<Utc>,
    last_seen: DateTime<Utc>,
}

impl TagDetection {
    pub fn new(epc: impl Into<String>, antenna_port: u16, peak_rssi_dbm: f64, seen_at: DateTime<Utc>) -> Self {
        Self {
            epc: epc.into(),
            antenna_port,
            peak_rssi_dbm,
            first_seen: seen_at,
            last_seen: seen_at,
        }
    }

    pub fn epc(&self) -> &str {
        &self.epc
    }

    pub fn antenna_port(&self) -> u16 {
        self.antenna_port
    }

    pub fn peak_rssi_dbm(&self) -> f64 {
        self.peak_rssi_dbm
    }

    pub fn first_seen(&self) -> DateTime<Utc> {
        self.first_seen
    }

    pub fn last_seen(&self) -> DateTime<Utc> {
        self.last_seen
    }
}

/// One callback's worth of detections from the reader event source
pub type TagReport = Vec<TagDetection>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OutputLevel {
    Low,
    High,
}

impl From<OutputLevel> for &'static str {
    fn from(level: OutputLevel) -> &'static str {
        match level {
            OutputLevel::Low => "LOW",
            OutputLevel::High => "HIGH",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AntennaSettings {
    pub port: u16,
    pub enabled: bool,
    pub tx_power_dbm: f64,
    pub rx_sensitivity_dbm: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReportMode {
    /// Every tag is reported on its own as soon as it is singulated
    Individual,
    /// Tags are accumulated on the reader and reported on stop
    BatchAfterStop,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReportSettings {
    pub include_antenna_port: bool,
    pub include_first_seen: bool,
    pub include_last_seen: bool,
    pub include_peak_rssi: bool,
    pub mode: ReportMode,
}

impl Default for ReportSettings {
    fn default() -> Self {
        Self {
            include_antenna_port: true,
            include_first_seen: true,
            include_last_seen: true,
            include_peak_rssi: true,
            mode: ReportMode::Individual,
        }
    }
}

/// Per-port radio settings plus report options pushed to the reader on start
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AntennaConfig {
    pub antennas: Vec<AntennaSettings>,
    pub report: ReportSettings,
}

impl AntennaConfig {
    /// Same power and sensitivity on every listed port, all enabled
    pub fn uniform(ports: impl IntoIterator<Item = u16>, tx_power_dbm: f64, rx_sensitivity_dbm: f64) -> Self {
        let antennas = ports
            .into_iter()
            .map(|port| AntennaSettings {
                port,
                enabled: true,
                tx_power_dbm,
                rx_sensitivity_dbm,
            })
            .collect();

        Self {
            antennas,
            report: ReportSettings::default(),
        }
    }

    /// Keep every port in the config but disable the ones outside `keep`
    pub fn restrict_to(mut self, keep: impl Fn(u16) -> bool) -> Self {
        for antenna in self.antennas.iter_mut() {
            if !keep(antenna.port) {
                antenna.enabled = false;
            }
        }
        self
    }

    pub fn settings(&self, port: u16) -> Option<&AntennaSettings> {
        self.antennas.iter().find(|a| a.port == port)
    }

    pub fn is_enabled(&self, port: u16) -> bool {
        self.settings(port).map(|a| a.enabled).unwrap_or(false)
    }

    pub fn enabled_ports(&self) -> Vec<u16> {
        self.antennas
            .iter()
            .filter(|a| a.enabled)
            .map(|a| a.port)
            .collect()
    }
}
