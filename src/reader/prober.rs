//! Periodic keep-alive against the reader
//!
//! Silent link failures (a reader that stops answering without closing the
//! socket) only show up when something is asked of the reader, so the prober
//! issues a cheap settings query on every tick and routes any failure into
//! the supervisor's reconnection path.

use crate::reader::hardware::ReaderError;
use crate::reader::supervisor::{ConnectionSupervisor, SupervisorError};
use crate::reader::types::AntennaConfig;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};

#[derive(Debug, Clone, PartialEq)]
pub enum ProbeOutcome {
    Healthy,
    Recovered,
    Failed(SupervisorError),
}

pub struct LivenessProber {
    shutdown_tx: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl LivenessProber {
    /// Start probing every `every`, first probe immediately
    ///
    /// When `resume` is set, a successful reconnect re-applies that antenna
    /// configuration and restarts reading so the session picks up where it
    /// left off.
    pub fn spawn(supervisor: Arc<ConnectionSupervisor>, every: Duration, resume: Option<AntennaConfig>) -> Self {
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

        let handle = tokio::spawn(async move {
            log::info!("💓 Liveness prober started (interval: {}ms)", every.as_millis());

            let mut timer = interval(every);
            timer.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    biased;
                    _ = shutdown_rx.changed() => break,
                    _ = timer.tick() => {
                        probe_once(&supervisor, resume.as_ref()).await;
                    }
                }
            }

            log::info!("💓 Liveness prober stopped");
        });

        Self { shutdown_tx, handle }
    }

    /// Stop the timer and wait for an in-flight probe to finish
    ///
    /// Waiting (instead of aborting) keeps the connection state consistent
    /// when a reconnect is in progress.
    pub async fn stop(self) {
        let _ = self.shutdown_tx.send(true);
        if let Err(e) = self.handle.await {
            log::error!("❌ Liveness prober task failed: {}", e);
        }
    }
}

/// One keep-alive round
pub async fn probe_once(supervisor: &ConnectionSupervisor, resume: Option<&AntennaConfig>) -> ProbeOutcome {
    if supervisor.is_connected() {
        match supervisor.query_config().await {
            Ok(_) => {
                log::debug!("💓 Keep-alive sent: settings queried on {}", supervisor.address());
                return ProbeOutcome::Healthy;
            }
            Err(e) => {
                log::warn!("⚠️  Keep-alive failed on {}: {}", supervisor.address(), e);
                // Tear down whatever is left of the link before redialing
                let _ = supervisor.disconnect().await;
            }
        }
    } else {
        log::warn!("⚠️  Reader {} disconnected, attempting to reconnect...", supervisor.address());
    }

    if let Err(e) = supervisor.reconnect_with_backoff().await {
        return ProbeOutcome::Failed(e);
    }

    if let Some(config) = resume {
        let resumed: Result<(), ReaderError> = async {
            supervisor.apply_config(config).await?;
            supervisor.start_reading().await
        }
        .await;

        if let Err(e) = resumed {
            log::error!("❌ Failed to resume reading on {}: {}", supervisor.address(), e);
            return ProbeOutcome::Failed(SupervisorError::Connection(e));
        }
        log::info!("▶️  Reading resumed on {}", supervisor.address());
    }

    ProbeOutcome::Recovered
}
