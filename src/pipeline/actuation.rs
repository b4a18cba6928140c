//! Output actuation: which indicators to drive for a detected EPC
//!
//! Deciding is pure. Executing a plan takes seconds of output timing, so
//! plans are queued to a dedicated [`OutputActuator`] task that runs them one
//! at a time; intake never waits on an output pulse.

use crate::reader::supervisor::ConnectionSupervisor;
use crate::reader::types::OutputLevel;
use regex::Regex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

/// Four groups of four hex digits separated by single spaces
pub const EPC_PATTERN: &str = r"^[0-9A-Fa-f]{4} [0-9A-Fa-f]{4} [0-9A-Fa-f]{4} [0-9A-Fa-f]{4}$";

#[derive(Debug, Clone)]
pub struct EpcValidator {
    pattern: Regex,
}

impl EpcValidator {
    pub fn new(pattern: &str) -> Result<Self, regex::Error> {
        Ok(Self {
            pattern: Regex::new(pattern)?,
        })
    }

    pub fn is_valid(&self, epc: &str) -> bool {
        self.pattern.is_match(epc)
    }
}

impl Default for EpcValidator {
    fn default() -> Self {
        Self {
            pattern: Regex::new(EPC_PATTERN).expect("EPC_PATTERN is a valid regex"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ActuationConfig {
    /// Semaphore output
    pub primary_port: u16,
    /// Siren output
    pub secondary_port: u16,
    /// Outputs `1..=port_count` are driven low by [`deactivate_all`]
    pub port_count: u16,
    pub valid_pulse: Duration,
    pub invalid_pulse: Duration,
}

impl Default for ActuationConfig {
    fn default() -> Self {
        Self {
            primary_port: 1,
            secondary_port: 3,
            port_count: 3,
            valid_pulse: Duration::from_millis(1500),
            invalid_pulse: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Valid,
    Invalid,
}

/// Outputs to assert together, held for `hold`, then de-asserted together
#[derive(Debug, Clone, PartialEq)]
pub struct ActuationPlan {
    pub epc: String,
    pub verdict: Verdict,
    pub assert_ports: Vec<u16>,
    pub hold: Duration,
}

pub struct ActuationDecider {
    validator: EpcValidator,
    config: ActuationConfig,
}

impl ActuationDecider {
    pub fn new(validator: EpcValidator, config: ActuationConfig) -> Self {
        Self { validator, config }
    }

    /// Valid EPC pulses the siren alone; anything else raises semaphore and siren
    pub fn decide(&self, epc: &str) -> ActuationPlan {
        if self.validator.is_valid(epc) {
            ActuationPlan {
                epc: epc.to_string(),
                verdict: Verdict::Valid,
                assert_ports: vec![self.config.secondary_port],
                hold: self.config.valid_pulse,
            }
        } else {
            ActuationPlan {
                epc: epc.to_string(),
                verdict: Verdict::Invalid,
                assert_ports: vec![self.config.primary_port, self.config.secondary_port],
                hold: self.config.invalid_pulse,
            }
        }
    }

    pub fn config(&self) -> &ActuationConfig {
        &self.config
    }
}

/// Cloneable handle for queueing plans from the intake path
#[derive(Clone)]
pub struct PlanQueue {
    tx: mpsc::UnboundedSender<ActuationPlan>,
}

impl PlanQueue {
    /// Queue a plan without waiting for outputs
    pub fn enqueue(&self, plan: ActuationPlan) {
        if self.tx.send(plan).is_err() {
            log::warn!("⚠️  Output actuator gone, plan dropped");
        }
    }
}

/// Runs queued plans sequentially against the reader outputs
pub struct OutputActuator {
    plan_tx: mpsc::UnboundedSender<ActuationPlan>,
    shutdown_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl OutputActuator {
    pub fn spawn(supervisor: Arc<ConnectionSupervisor>, config: ActuationConfig) -> Self {
        let (plan_tx, mut plan_rx) = mpsc::unbounded_channel::<ActuationPlan>();
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

        let handle = tokio::spawn(async move {
            log::info!("🚦 Output actuator started");

            loop {
                tokio::select! {
                    biased;
                    _ = shutdown_rx.changed() => break,
                    plan = plan_rx.recv() => match plan {
                        Some(plan) => execute(&supervisor, &plan).await,
                        None => break,
                    },
                }
            }

            let mut dropped = 0;
            while plan_rx.try_recv().is_ok() {
                dropped += 1;
            }
            if dropped > 0 {
                log::warn!("⚠️  Output actuator stopping, {} queued plans discarded", dropped);
            }

            deactivate_all(&supervisor, &config).await;
            log::info!("🚦 Output actuator stopped");
        });

        Self {
            plan_tx,
            shutdown_tx,
            handle,
        }
    }

    pub fn queue(&self) -> PlanQueue {
        PlanQueue {
            tx: self.plan_tx.clone(),
        }
    }

    pub fn enqueue(&self, plan: ActuationPlan) {
        self.queue().enqueue(plan);
    }

    /// Finish the plan in progress, discard the rest, drive outputs low
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        if let Err(e) = self.handle.await {
            log::error!("❌ Output actuator task failed: {}", e);
        }
    }
}

async fn drive(supervisor: &ConnectionSupervisor, ports: &[u16], level: OutputLevel) {
    for &port in ports {
        if let Err(e) = supervisor.set_output(port, level).await {
            log::error!("❌ Failed to set output {} {}: {}", port, <&str>::from(level), e);
        }
    }
}

/// Assert, hold, de-assert; failures are logged and the plan still completes
pub async fn execute(supervisor: &ConnectionSupervisor, plan: &ActuationPlan) {
    match plan.verdict {
        Verdict::Valid => log::info!("🟢 EPC {} valid, pulsing outputs {:?}", plan.epc, plan.assert_ports),
        Verdict::Invalid => log::warn!("🔴 EPC {} invalid, raising outputs {:?}", plan.epc, plan.assert_ports),
    }

    drive(supervisor, &plan.assert_ports, OutputLevel::High).await;
    tokio::time::sleep(plan.hold).await;
    drive(supervisor, &plan.assert_ports, OutputLevel::Low).await;
}

/// Drive every configured output low
pub async fn deactivate_all(supervisor: &ConnectionSupervisor, config: &ActuationConfig) {
    if !supervisor.is_connected() {
        log::debug!("Reader not connected, outputs left as they are");
        return;
    }

    let ports: Vec<u16> = (1..=config.port_count).collect();
    drive(supervisor, &ports, OutputLevel::Low).await;
    log::info!("All outputs 1..={} set LOW", config.port_count);
}
