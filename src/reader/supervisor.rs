//! Lifecycle of the single physical reader connection
//!
//! The supervisor is the only writer of [`ConnectionState`]. Every other
//! component reads it through [`ConnectionSupervisor::state`] or a
//! [`watch`] subscription. Hardware calls go through the supervisor so they
//! are serialized on the shared reader handle.

use crate::reader::backoff::{FixedBackoff, ReconnectPolicy, ReconnectionExhausted};
use crate::reader::hardware::{ReaderError, SharedReader};
use crate::reader::types::{AntennaConfig, OutputLevel, TagReport};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use tokio::sync::{mpsc, watch, Mutex};

/// Buffer between the reader event source and the intake task (reports)
const REPORT_CHANNEL_BUFFER: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connected,
    Reconnecting,
}

impl From<ConnectionState> for &'static str {
    fn from(state: ConnectionState) -> &'static str {
        match state {
            ConnectionState::Disconnected => "DISCONNECTED",
            ConnectionState::Connected => "CONNECTED",
            ConnectionState::Reconnecting => "RECONNECTING",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SupervisorError {
    Connection(ReaderError),
    ReconnectionExhausted { attempts: u32 },
}

impl From<ReaderError> for SupervisorError {
    fn from(err: ReaderError) -> Self {
        SupervisorError::Connection(err)
    }
}

impl From<ReconnectionExhausted> for SupervisorError {
    fn from(err: ReconnectionExhausted) -> Self {
        SupervisorError::ReconnectionExhausted { attempts: err.attempts }
    }
}

impl std::fmt::Display for SupervisorError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SupervisorError::Connection(e) => write!(f, "{}", e),
            SupervisorError::ReconnectionExhausted { attempts } => write!(
                f,
                "Maximum reconnection attempts reached ({}), manual intervention required",
                attempts
            ),
        }
    }
}

impl std::error::Error for SupervisorError {}

pub struct ConnectionSupervisor {
    reader: SharedReader,
    address: String,
    policy: ReconnectPolicy,
    state_tx: watch::Sender<ConnectionState>,
    attempts: AtomicU32,
    subscribed: AtomicBool,
    reconnect_guard: Mutex<()>,
}

impl ConnectionSupervisor {
    pub fn new(reader: SharedReader, address: impl Into<String>, policy: ReconnectPolicy) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);

        Self {
            reader,
            address: address.into(),
            policy,
            state_tx,
            attempts: AtomicU32::new(0),
            subscribed: AtomicBool::new(false),
            reconnect_guard: Mutex::new(()),
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Observe state transitions
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    /// Failed reconnection attempts since the last successful connect
    pub fn reconnect_attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }

    fn transition(&self, next: ConnectionState) {
        let address = &self.address;
        self.state_tx.send_if_modified(|state| {
            if *state == next {
                return false;
            }
            log::info!(
                "🔌 Reader {}: {} → {}",
                address,
                <&str>::from(*state),
                <&str>::from(next)
            );
            *state = next;
            true
        });
    }

    /// Single connect attempt; leaves the state untouched on failure
    async fn attempt_connect(&self) -> Result<(), ReaderError> {
        let mut reader = self.reader.lock().await;
        reader.connect(&self.address).await?;
        log::debug!("Reader {} backend: {}", self.address, reader.backend_type());
        self.transition(ConnectionState::Connected);
        self.attempts.store(0, Ordering::SeqCst);
        Ok(())
    }

    pub async fn connect(&self) -> Result<(), SupervisorError> {
        if self.is_connected() {
            return Ok(());
        }

        match self.attempt_connect().await {
            Ok(()) => {
                log::info!("✅ Connected to reader {}", self.address);
                Ok(())
            }
            Err(e) => {
                log::error!("❌ Connection to {} failed: {}", self.address, e);
                self.transition(ConnectionState::Disconnected);
                Err(SupervisorError::Connection(e))
            }
        }
    }

    pub async fn disconnect(&self) -> Result<(), SupervisorError> {
        if self.state() == ConnectionState::Disconnected {
            log::debug!("Reader {} already disconnected", self.address);
            return Ok(());
        }

        let result = self.reader.lock().await.disconnect().await;
        // The link is considered gone even if the goodbye failed
        self.transition(ConnectionState::Disconnected);

        if let Err(e) = result {
            log::warn!("⚠️  Disconnect from {} reported: {}", self.address, e);
            return Err(SupervisorError::Connection(e));
        }

        log::info!("Reader {} disconnected", self.address);
        Ok(())
    }

    /// Retry connecting with a fixed delay until connected or out of attempts
    ///
    /// Concurrent callers are serialized; the second one observes the
    /// outcome of the first. Once the ceiling is hit, later calls fail fast
    /// until an explicit [`connect`](Self::connect) succeeds.
    pub async fn reconnect_with_backoff(&self) -> Result<(), SupervisorError> {
        let _guard = self.reconnect_guard.lock().await;

        if self.is_connected() {
            return Ok(());
        }

        let mut backoff = FixedBackoff::resume(self.policy, self.reconnect_attempts());
        if backoff.is_exhausted() {
            log::error!(
                "🛑 Reconnection to {} already exhausted ({} attempts), waiting for operator",
                self.address,
                backoff.attempts()
            );
            return Err(SupervisorError::ReconnectionExhausted {
                attempts: backoff.attempts(),
            });
        }

        self.transition(ConnectionState::Reconnecting);

        loop {
            match self.attempt_connect().await {
                Ok(()) => {
                    log::info!("✅ Reconnected to reader {}", self.address);
                    return Ok(());
                }
                Err(e) => {
                    let recorded = backoff.record_failure();
                    self.attempts.store(backoff.attempts(), Ordering::SeqCst);
                    log::error!(
                        "❌ Reconnect to {} failed: {}. Attempt {}/{}",
                        self.address,
                        e,
                        backoff.attempts(),
                        backoff.max_attempts()
                    );

                    if let Err(exhausted) = recorded {
                        self.transition(ConnectionState::Disconnected);
                        log::error!(
                            "🛑 Maximum reconnection attempts reached for {}, manual intervention required",
                            self.address
                        );
                        return Err(exhausted.into());
                    }

                    backoff.sleep().await;
                }
            }
        }
    }

    fn ensure_connected(&self) -> Result<(), ReaderError> {
        if self.is_connected() {
            Ok(())
        } else {
            Err(ReaderError::NotConnected)
        }
    }

    pub async fn apply_config(&self, config: &AntennaConfig) -> Result<(), ReaderError> {
        self.ensure_connected()?;
        self.reader.lock().await.apply_config(config).await
    }

    pub async fn query_config(&self) -> Result<AntennaConfig, ReaderError> {
        self.ensure_connected()?;
        self.reader.lock().await.query_config().await
    }

    pub async fn start_reading(&self) -> Result<(), ReaderError> {
        self.ensure_connected()?;
        self.reader.lock().await.start().await
    }

    pub async fn stop_reading(&self) -> Result<(), ReaderError> {
        self.ensure_connected()?;
        self.reader.lock().await.stop().await
    }

    pub async fn set_output(&self, port: u16, level: OutputLevel) -> Result<(), ReaderError> {
        self.ensure_connected()?;
        self.reader.lock().await.set_output(port, level).await
    }

    /// Install the one live report subscription
    ///
    /// Calling it again replaces the previous channel instead of adding a
    /// second handler, so reconnects never double-deliver reports.
    pub async fn subscribe(&self) -> mpsc::Receiver<TagReport> {
        let (tx, rx) = mpsc::channel(REPORT_CHANNEL_BUFFER);
        self.reader.lock().await.subscribe(tx);

        if self.subscribed.swap(true, Ordering::SeqCst) {
            log::debug!("Replaced existing report subscription on {}", self.address);
        }
        rx
    }

    pub async fn unsubscribe(&self) {
        if self.subscribed.swap(false, Ordering::SeqCst) {
            self.reader.lock().await.unsubscribe();
            log::debug!("Report subscription on {} removed", self.address);
        }
    }

    pub fn is_subscribed(&self) -> bool {
        self.subscribed.load(Ordering::SeqCst)
    }
}
