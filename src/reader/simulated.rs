//! In-process reader used by the runtime binary and the test suite
//!
//! Behaves like a fixed reader with `max_port` antennas: it validates
//! antenna settings, only reports tags while started and only on enabled
//! ports, and records every output write. Failures can be scripted to
//! exercise the reconnection path.

use crate::reader::hardware::{ReaderError, ReaderHardware};
use crate::reader::types::{AntennaConfig, OutputLevel, TagDetection, TagReport};
use async_trait::async_trait;
use rand::Rng;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

const TX_POWER_RANGE_DBM: (f64, f64) = (10.0, 33.0);
const RX_SENSITIVITY_RANGE_DBM: (f64, f64) = (-93.0, -30.0);
/// General-purpose outputs on the simulated reader
const OUTPUT_PORTS: u16 = 4;

#[derive(Debug, Clone, PartialEq)]
pub struct OutputWrite {
    pub port: u16,
    pub level: OutputLevel,
    pub at: tokio::time::Instant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnectFailures {
    None,
    Next(u32),
    Always,
}

struct SimState {
    max_port: u16,
    connected: bool,
    reading: bool,
    config: AntennaConfig,
    connect_attempts: u32,
    connect_failures: ConnectFailures,
    query_failures: u32,
    reject_config: Option<String>,
    outputs: Vec<OutputWrite>,
    subscriber: Option<mpsc::Sender<TagReport>>,
    subscribe_calls: u32,
}

#[derive(Clone)]
pub struct SimulatedReader {
    inner: Arc<Mutex<SimState>>,
}

impl SimulatedReader {
    pub fn new(max_port: u16) -> Self {
        Self {
            inner: Arc::new(Mutex::new(SimState {
                max_port,
                connected: false,
                reading: false,
                config: AntennaConfig::uniform(1..=max_port, 30.0, -70.0),
                connect_attempts: 0,
                connect_failures: ConnectFailures::None,
                query_failures: 0,
                reject_config: None,
                outputs: Vec::new(),
                subscriber: None,
                subscribe_calls: 0,
            })),
        }
    }

    fn state(&self) -> MutexGuard<'_, SimState> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn fail_next_connects(&self, count: u32) {
        self.state().connect_failures = ConnectFailures::Next(count);
    }

    pub fn fail_all_connects(&self, fail: bool) {
        self.state().connect_failures = if fail {
            ConnectFailures::Always
        } else {
            ConnectFailures::None
        };
    }

    /// Make the next `count` keep-alive queries fail
    pub fn fail_next_queries(&self, count: u32) {
        self.state().query_failures = count;
    }

    /// Reject the next configuration push with `reason`
    pub fn reject_next_config(&self, reason: impl Into<String>) {
        self.state().reject_config = Some(reason.into());
    }

    /// Drop the link without telling anyone, like a pulled network cable
    pub fn sever(&self) {
        let mut state = self.state();
        state.connected = false;
        state.reading = false;
    }

    pub fn connect_attempts(&self) -> u32 {
        self.state().connect_attempts
    }

    pub fn subscribe_calls(&self) -> u32 {
        self.state().subscribe_calls
    }

    pub fn is_connected(&self) -> bool {
        self.state().connected
    }

    pub fn is_reading(&self) -> bool {
        self.state().reading
    }

    pub fn output_log(&self) -> Vec<OutputWrite> {
        self.state().outputs.clone()
    }

    pub fn active_config(&self) -> AntennaConfig {
        self.state().config.clone()
    }

    /// Deliver a report to the subscriber as the reader would
    ///
    /// Detections on disabled ports are dropped. Returns how many
    /// detections were handed to the subscriber.
    pub fn inject(&self, report: TagReport) -> usize {
        let state = self.state();
        if !state.connected || !state.reading {
            return 0;
        }

        let Some(subscriber) = state.subscriber.as_ref() else {
            return 0;
        };

        let visible: TagReport = report
            .into_iter()
            .filter(|d| state.config.is_enabled(d.antenna_port()))
            .collect();
        let count = visible.len();
        if count == 0 {
            return 0;
        }

        match subscriber.try_send(visible) {
            Ok(()) => count,
            Err(e) => {
                log::warn!("⚠️  Simulated reader dropped report: {}", e);
                0
            }
        }
    }

    /// Generate random tag traffic until the returned task is aborted
    ///
    /// Roughly one in ten generated EPCs is malformed so both actuation
    /// branches get exercised.
    pub fn spawn_traffic(&self, every: Duration, population: usize) -> JoinHandle<()> {
        let reader = self.clone();
        let population = population.max(1);

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            loop {
                ticker.tick().await;

                let report = {
                    let mut rng = rand::thread_rng();
                    let max_port = reader.state().max_port;
                    let reads = rng.gen_range(1..=4);
                    (0..reads)
                        .map(|_| {
                            let tag = rng.gen_range(0..population);
                            let epc = if tag % 10 == 9 {
                                format!("ZZ{:02X} 0000 0000 {:04X}", tag % 256, tag)
                            } else {
                                format!("E280 1160 6000 {:04X}", tag)
                            };
                            TagDetection::new(
                                epc,
                                rng.gen_range(1..=max_port),
                                rng.gen_range(-75.0..-35.0),
                                chrono::Utc::now(),
                            )
                        })
                        .collect::<TagReport>()
                };

                let delivered = reader.inject(report);
                log::trace!("Simulated reader delivered {} detections", delivered);
            }
        })
    }

    fn validate(state: &SimState, config: &AntennaConfig) -> Result<(), ReaderError> {
        if config.enabled_ports().is_empty() {
            return Err(ReaderError::Configuration("no antenna port enabled".to_string()));
        }

        for antenna in &config.antennas {
            if antenna.port == 0 || antenna.port > state.max_port {
                return Err(ReaderError::Configuration(format!(
                    "antenna port {} outside 1..={}",
                    antenna.port, state.max_port
                )));
            }
            if antenna.tx_power_dbm < TX_POWER_RANGE_DBM.0 || antenna.tx_power_dbm > TX_POWER_RANGE_DBM.1 {
                return Err(ReaderError::Configuration(format!(
                    "tx power {} dBm on port {} outside {}..={}",
                    antenna.tx_power_dbm, antenna.port, TX_POWER_RANGE_DBM.0, TX_POWER_RANGE_DBM.1
                )));
            }
            if antenna.rx_sensitivity_dbm < RX_SENSITIVITY_RANGE_DBM.0
                || antenna.rx_sensitivity_dbm > RX_SENSITIVITY_RANGE_DBM.1
            {
                return Err(ReaderError::Configuration(format!(
                    "rx sensitivity {} dBm on port {} outside {}..={}",
                    antenna.rx_sensitivity_dbm, antenna.port, RX_SENSITIVITY_RANGE_DBM.0, RX_SENSITIVITY_RANGE_DBM.1
                )));
            }
        }

        Ok(())
    }
}

#[async_trait]
impl ReaderHardware for SimulatedReader {
    async fn connect(&mut self, address: &str) -> Result<(), ReaderError> {
        let mut state = self.state();
        state.connect_attempts += 1;

        let failures = state.connect_failures;
        match failures {
            ConnectFailures::Always => {
                return Err(ReaderError::Connection(format!("{} unreachable", address)));
            }
            ConnectFailures::Next(n) if n > 0 => {
                state.connect_failures = if n == 1 {
                    ConnectFailures::None
                } else {
                    ConnectFailures::Next(n - 1)
                };
                return Err(ReaderError::Connection(format!("{} refused connection", address)));
            }
            _ => {}
        }

        state.connected = true;
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<(), ReaderError> {
        let mut state = self.state();
        state.connected = false;
        state.reading = false;
        Ok(())
    }

    async fn apply_config(&mut self, config: &AntennaConfig) -> Result<(), ReaderError> {
        let mut state = self.state();
        if !state.connected {
            return Err(ReaderError::NotConnected);
        }
        if let Some(reason) = state.reject_config.take() {
            return Err(ReaderError::Configuration(reason));
        }

        Self::validate(&state, config)?;
        state.config = config.clone();
        Ok(())
    }

    async fn query_config(&mut self) -> Result<AntennaConfig, ReaderError> {
        let mut state = self.state();
        if !state.connected {
            return Err(ReaderError::NotConnected);
        }
        if state.query_failures > 0 {
            state.query_failures -= 1;
            return Err(ReaderError::Query("keep-alive timed out".to_string()));
        }
        Ok(state.config.clone())
    }

    async fn start(&mut self) -> Result<(), ReaderError> {
        let mut state = self.state();
        if !state.connected {
            return Err(ReaderError::NotConnected);
        }
        state.reading = true;
        Ok(())
    }

    async fn stop(&mut self) -> Result<(), ReaderError> {
        let mut state = self.state();
        if !state.connected {
            return Err(ReaderError::NotConnected);
        }
        state.reading = false;
        Ok(())
    }

    async fn set_output(&mut self, port: u16, level: OutputLevel) -> Result<(), ReaderError> {
        let mut state = self.state();
        if !state.connected {
            return Err(ReaderError::NotConnected);
        }
        if port == 0 || port > OUTPUT_PORTS {
            return Err(ReaderError::Output(format!("output port {} outside 1..={}", port, OUTPUT_PORTS)));
        }
        state.outputs.push(OutputWrite {
            port,
            level,
            at: tokio::time::Instant::now(),
        });
        Ok(())
    }

    fn subscribe(&mut self, sink: mpsc::Sender<TagReport>) {
        let mut state = self.state();
        state.subscriber = Some(sink);
        state.subscribe_calls += 1;
    }

    fn unsubscribe(&mut self) {
        self.state().subscriber = None;
    }

    fn backend_type(&self) -> &'static str {
        "SIMULATED"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reader::types::AntennaConfig;

    #[tokio::test]
    async fn test_rejects_out_of_range_settings() {
        let mut reader = SimulatedReader::new(4);
        reader.connect("sim").await.unwrap();

        let err = reader
            .apply_config(&AntennaConfig::uniform(1..=4, 40.0, -55.0))
            .await
            .unwrap_err();
        assert!(matches!(err, ReaderError::Configuration(_)));

        let err = reader
            .apply_config(&AntennaConfig::uniform(1..=13, 30.0, -55.0))
            .await
            .unwrap_err();
        assert!(matches!(err, ReaderError::Configuration(_)));

        reader
            .apply_config(&AntennaConfig::uniform(1..=4, 30.0, -55.0))
            .await
            .unwrap();
        assert_eq!(reader.active_config().settings(2).unwrap().tx_power_dbm, 30.0);
    }

    #[tokio::test]
    async fn test_output_port_out_of_range_is_rejected() {
        let mut reader = SimulatedReader::new(4);
        reader.connect("sim").await.unwrap();

        let err = reader.set_output(5, OutputLevel::High).await.unwrap_err();
        assert!(matches!(err, ReaderError::Output(_)));
        assert!(matches!(
            reader.set_output(0, OutputLevel::Low).await,
            Err(ReaderError::Output(_))
        ));

        reader.set_output(4, OutputLevel::High).await.unwrap();
        assert_eq!(reader.output_log().len(), 1);
    }

    #[tokio::test]
    async fn test_inject_only_while_reading_on_enabled_ports() {
        let mut reader = SimulatedReader::new(4);
        let (tx, mut rx) = mpsc::channel(8);
        reader.subscribe(tx);
        reader.connect("sim").await.unwrap();
        reader
            .apply_config(&AntennaConfig::uniform(1..=4, 20.0, -45.0).restrict_to(|p| p <= 2))
            .await
            .unwrap();

        let now = chrono::Utc::now();
        let report = vec![
            TagDetection::new("AAAA 0000 0000 0001", 1, -40.0, now),
            TagDetection::new("AAAA 0000 0000 0002", 4, -40.0, now),
        ];

        assert_eq!(reader.inject(report.clone()), 0);

        reader.start().await.unwrap();
        assert_eq!(reader.inject(report), 1);

        let received = rx.recv().await.unwrap();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].antenna_port(), 1);
    }

    #[tokio::test]
    async fn test_sever_drops_link() {
        let mut reader = SimulatedReader::new(4);
        reader.connect("sim").await.unwrap();
        reader.start().await.unwrap();

        reader.sever();

        assert!(!reader.is_connected());
        assert_eq!(reader.query_config().await, Err(ReaderError::NotConnected));
    }
}
