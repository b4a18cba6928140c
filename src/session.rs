//! Reader session: the operational entry points of a checkpoint
//!
//! A session owns everything that runs while the reader is reading:
//!
//! - intake task: reader reports → dedup window, first sighting → actuation queue
//! - batch processor: window flushes → direction classifier → emitter
//! - output actuator: runs actuation plans one at a time
//! - liveness prober: keep-alive and reconnection
//!
//! The connection and the last-port table outlive sessions; ending a session
//! only pauses reading.

use crate::config::RuntimeConfig;
use crate::pipeline::actuation::{deactivate_all, ActuationDecider, EpcValidator, OutputActuator, PlanQueue};
use crate::pipeline::direction::DirectionClassifier;
use crate::pipeline::emitter::{NotificationEmitter, NotificationSink};
use crate::pipeline::lane::Lane;
use crate::pipeline::window::{DedupWindow, WindowMessage};
use crate::reader::hardware::{ReaderError, SharedReader};
use crate::reader::prober::LivenessProber;
use crate::reader::supervisor::{ConnectionState, ConnectionSupervisor, SupervisorError};
use crate::reader::types::{AntennaConfig, TagReport};
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

#[derive(Debug, Clone, PartialEq)]
pub enum SessionError {
    Connection(ReaderError),
    Configuration(String),
    ReconnectionExhausted { attempts: u32 },
    UnknownLane(String),
    NotConnected,
}

impl From<ReaderError> for SessionError {
    fn from(err: ReaderError) -> Self {
        match err {
            ReaderError::Configuration(msg) => SessionError::Configuration(msg),
            ReaderError::NotConnected => SessionError::NotConnected,
            other => SessionError::Connection(other),
        }
    }
}

impl From<SupervisorError> for SessionError {
    fn from(err: SupervisorError) -> Self {
        match err {
            SupervisorError::Connection(e) => e.into(),
            SupervisorError::ReconnectionExhausted { attempts } => SessionError::ReconnectionExhausted { attempts },
        }
    }
}

impl std::fmt::Display for SessionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionError::Connection(e) => write!(f, "{}", e),
            SessionError::Configuration(msg) => write!(f, "Antenna configuration rejected: {}", msg),
            SessionError::ReconnectionExhausted { attempts } => write!(
                f,
                "Maximum reconnection attempts reached ({}), manual intervention required",
                attempts
            ),
            SessionError::UnknownLane(name) => write!(f, "Unknown lane: {}", name),
            SessionError::NotConnected => write!(f, "Reader is not connected"),
        }
    }
}

impl std::error::Error for SessionError {}

/// What `force_disconnect` ended up doing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectOutcome {
    Disconnected,
    /// The reader was already disconnected, so a reconnect was attempted instead
    Reconnected,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SessionStats {
    pub active: bool,
    pub lane: Option<String>,
    pub elapsed: Duration,
    /// Distinct EPCs seen since the session began
    pub unique_tags: usize,
    /// Tags waiting in the current window epoch
    pub pending_tags: usize,
    pub batches_emitted: u64,
    pub connection_state: ConnectionState,
    pub reconnect_attempts: u32,
}

impl SessionStats {
    pub fn log(&self) {
        log::info!("📊 Session stats{}", if self.active { "" } else { " (ended)" });
        if let Some(lane) = &self.lane {
            log::info!("   ├─ Lane: {}", lane);
        }
        log::info!("   ├─ Elapsed: {:.1}s", self.elapsed.as_secs_f64());
        log::info!("   ├─ Unique tags: {}", self.unique_tags);
        log::info!("   ├─ Pending tags: {}", self.pending_tags);
        log::info!("   ├─ Batches emitted: {}", self.batches_emitted);
        log::info!(
            "   └─ Connection: {} ({} failed reconnects)",
            <&str>::from(self.connection_state),
            self.reconnect_attempts
        );
    }
}

/// First-sighting set for the life of one session
type SeenSet = Arc<Mutex<HashSet<String>>>;

fn lock_seen(seen: &SeenSet) -> MutexGuard<'_, HashSet<String>> {
    seen.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

struct ActiveSession {
    lane: Option<Lane>,
    started_at: Instant,
    window: DedupWindow,
    seen: SeenSet,
    intake_shutdown: watch::Sender<bool>,
    intake: JoinHandle<()>,
    processor: JoinHandle<()>,
    actuator: OutputActuator,
    prober: LivenessProber,
}

struct EndedSession {
    lane: Option<Lane>,
    elapsed: Duration,
    unique_tags: usize,
}

pub struct ReaderSession {
    config: RuntimeConfig,
    supervisor: Arc<ConnectionSupervisor>,
    sink: Arc<dyn NotificationSink>,
    validator: EpcValidator,
    classifier: Arc<DirectionClassifier>,
    batches_emitted: Arc<AtomicU64>,
    active: tokio::sync::Mutex<Option<ActiveSession>>,
    last: Mutex<Option<EndedSession>>,
}

impl ReaderSession {
    pub fn new(config: RuntimeConfig, reader: SharedReader, sink: Arc<dyn NotificationSink>) -> Self {
        let supervisor = Arc::new(ConnectionSupervisor::new(
            reader,
            config.reader_address.clone(),
            config.reconnect,
        ));
        let classifier = Arc::new(DirectionClassifier::new(config.zones.clone()));

        Self {
            config,
            supervisor,
            sink,
            validator: EpcValidator::default(),
            classifier,
            batches_emitted: Arc::new(AtomicU64::new(0)),
            active: tokio::sync::Mutex::new(None),
            last: Mutex::new(None),
        }
    }

    /// Replace the EPC format check used for actuation
    pub fn with_validator(mut self, validator: EpcValidator) -> Self {
        self.validator = validator;
        self
    }

    pub fn supervisor(&self) -> &Arc<ConnectionSupervisor> {
        &self.supervisor
    }

    pub fn classifier(&self) -> &Arc<DirectionClassifier> {
        &self.classifier
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub async fn is_active(&self) -> bool {
        self.active.lock().await.is_some()
    }

    /// Start reading on every configured port, or only on `lane`'s ports
    ///
    /// A rejected antenna configuration fails the start without retrying.
    /// Calling this on an active session does nothing.
    pub async fn begin(&self, lane: Option<&str>) -> Result<(), SessionError> {
        let mut active = self.active.lock().await;
        if active.is_some() {
            log::info!("Session already active on {}", self.config.reader_address);
            return Ok(());
        }

        let lane = match lane {
            Some(name) => Some(
                self.config
                    .lane(name)
                    .cloned()
                    .ok_or_else(|| SessionError::UnknownLane(name.to_string()))?,
            ),
            None => None,
        };

        self.supervisor.connect().await?;

        let antenna_config = self.config.antenna_config(lane.as_ref());
        if let Err(e) = self.supervisor.apply_config(&antenna_config).await {
            log::error!("❌ Antenna configuration rejected by {}: {}", self.config.reader_address, e);
            return Err(e.into());
        }

        let reports = self.supervisor.subscribe().await;
        if let Err(e) = self.supervisor.start_reading().await {
            self.supervisor.unsubscribe().await;
            return Err(e.into());
        }

        let (window, batches) = DedupWindow::new(self.config.quiescence);
        let seen: SeenSet = Arc::new(Mutex::new(HashSet::new()));

        let actuator = OutputActuator::spawn(self.supervisor.clone(), self.config.actuation.clone());
        let decider = ActuationDecider::new(self.validator.clone(), self.config.actuation.clone());

        let (intake_shutdown, intake_shutdown_rx) = watch::channel(false);
        let intake = tokio::spawn(run_intake(
            reports,
            intake_shutdown_rx,
            window.clone(),
            seen.clone(),
            decider,
            actuator.queue(),
        ));

        let emitter = NotificationEmitter::new(
            self.sink.clone(),
            self.config.notify_channel.clone(),
            self.config.reader_address.clone(),
            self.config.lanes.clone(),
        );
        let processor = tokio::spawn(run_batch_processor(
            batches,
            self.classifier.clone(),
            emitter,
            self.batches_emitted.clone(),
        ));

        let prober = LivenessProber::spawn(
            self.supervisor.clone(),
            self.config.liveness_interval,
            Some(antenna_config.clone()),
        );

        log::info!("▶️  Session started on {}", self.config.reader_address);
        log::info!(
            "   ├─ Lane: {}",
            lane.as_ref().map(|l| l.name.as_str()).unwrap_or("all")
        );
        log::info!("   ├─ Enabled ports: {:?}", antenna_config.enabled_ports());
        log::info!("   └─ Sink: {}", self.sink.sink_type());

        *active = Some(ActiveSession {
            lane,
            started_at: Instant::now(),
            window,
            seen,
            intake_shutdown,
            intake,
            processor,
            actuator,
            prober,
        });

        Ok(())
    }

    /// Pause reading; the connection stays up
    ///
    /// The pending window is flushed and emitted exactly once before this
    /// returns. Returns `None` when no session was active.
    pub async fn end(&self) -> Option<SessionStats> {
        let session = self.active.lock().await.take()?;

        session.prober.stop().await;

        if self.supervisor.is_connected() {
            if let Err(e) = self.supervisor.stop_reading().await {
                log::warn!("⚠️  Failed to stop reading on {}: {}", self.config.reader_address, e);
            }
        }
        self.supervisor.unsubscribe().await;

        let _ = session.intake_shutdown.send(true);
        if let Err(e) = session.intake.await {
            log::error!("❌ Intake task failed: {}", e);
        }

        session.window.close();
        if let Err(e) = session.processor.await {
            log::error!("❌ Batch processor task failed: {}", e);
        }

        session.actuator.shutdown().await;

        let ended = EndedSession {
            lane: session.lane,
            elapsed: session.started_at.elapsed(),
            unique_tags: lock_seen(&session.seen).len(),
        };
        log::info!(
            "⏹️  Session ended on {} ({:.1}s, {} unique tags)",
            self.config.reader_address,
            ended.elapsed.as_secs_f64(),
            ended.unique_tags
        );

        let stats = self.ended_stats(&ended);
        *self.last.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(ended);
        Some(stats)
    }

    /// End the session and drop the connection
    ///
    /// When the reader is already disconnected and no session runs, this
    /// tries to bring the link back instead.
    pub async fn force_disconnect(&self) -> Result<DisconnectOutcome, SessionError> {
        if !self.is_active().await && self.supervisor.state() == ConnectionState::Disconnected {
            log::warn!(
                "⚠️  Reader {} already disconnected, attempting to reconnect...",
                self.config.reader_address
            );
            self.supervisor.reconnect_with_backoff().await?;
            return Ok(DisconnectOutcome::Reconnected);
        }

        self.end().await;
        self.supervisor.disconnect().await?;
        log::info!("🔌 Session on {} forcibly disconnected", self.config.reader_address);
        Ok(DisconnectOutcome::Disconnected)
    }

    /// Settings currently active on the reader, connecting first if needed
    pub async fn antenna_config(&self) -> Result<AntennaConfig, SessionError> {
        self.supervisor.connect().await?;
        Ok(self.supervisor.query_config().await?)
    }

    /// Drive every configured output low
    pub async fn deactivate_outputs(&self) -> Result<(), SessionError> {
        if !self.supervisor.is_connected() {
            return Err(SessionError::NotConnected);
        }
        deactivate_all(&self.supervisor, &self.config.actuation).await;
        Ok(())
    }

    /// Figures for the running session, or the last ended one
    pub async fn stats(&self) -> SessionStats {
        if let Some(session) = self.active.lock().await.as_ref() {
            return SessionStats {
                active: true,
                lane: session.lane.as_ref().map(|l| l.name.clone()),
                elapsed: session.started_at.elapsed(),
                unique_tags: lock_seen(&session.seen).len(),
                pending_tags: session.window.pending(),
                batches_emitted: self.batches_emitted.load(Ordering::SeqCst),
                connection_state: self.supervisor.state(),
                reconnect_attempts: self.supervisor.reconnect_attempts(),
            };
        }

        let last = self.last.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        match last.as_ref() {
            Some(ended) => self.ended_stats(ended),
            None => SessionStats {
                active: false,
                lane: None,
                elapsed: Duration::ZERO,
                unique_tags: 0,
                pending_tags: 0,
                batches_emitted: self.batches_emitted.load(Ordering::SeqCst),
                connection_state: self.supervisor.state(),
                reconnect_attempts: self.supervisor.reconnect_attempts(),
            },
        }
    }

    fn ended_stats(&self, ended: &EndedSession) -> SessionStats {
        SessionStats {
            active: false,
            lane: ended.lane.as_ref().map(|l| l.name.clone()),
            elapsed: ended.elapsed,
            unique_tags: ended.unique_tags,
            pending_tags: 0,
            batches_emitted: self.batches_emitted.load(Ordering::SeqCst),
            connection_state: self.supervisor.state(),
            reconnect_attempts: self.supervisor.reconnect_attempts(),
        }
    }
}

/// Feed reader reports into the window and the actuation queue
///
/// On shutdown, reports already buffered are still processed.
async fn run_intake(
    mut reports: mpsc::Receiver<TagReport>,
    mut shutdown: watch::Receiver<bool>,
    window: DedupWindow,
    seen: SeenSet,
    decider: ActuationDecider,
    actuation: PlanQueue,
) {
    let handle = |report: TagReport| {
        for detection in report {
            // Lock once per detection, released before the window call
            let first_sighting = lock_seen(&seen).insert(detection.epc().to_string());
            if first_sighting {
                actuation.enqueue(decider.decide(detection.epc()));
            }
            window.on_detection(detection);
        }
    };

    loop {
        tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            report = reports.recv() => match report {
                Some(report) => handle(report),
                None => break,
            },
        }
    }

    while let Ok(report) = reports.try_recv() {
        handle(report);
    }
    log::debug!("Intake task stopped");
}

/// Classify and emit flushed batches in flush order
async fn run_batch_processor(
    mut batches: mpsc::UnboundedReceiver<WindowMessage>,
    classifier: Arc<DirectionClassifier>,
    emitter: NotificationEmitter,
    batches_emitted: Arc<AtomicU64>,
) {
    while let Some(message) = batches.recv().await {
        match message {
            WindowMessage::Batch(batch) => {
                let directions = classifier.classify_batch(&batch);
                if emitter.emit(&batch, &directions).await > 0 {
                    batches_emitted.fetch_add(1, Ordering::SeqCst);
                }
            }
            WindowMessage::Shutdown => break,
        }
    }
    log::debug!("Batch processor stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CheckpointLayout;
    use crate::pipeline::sinks::LogSink;
    use crate::reader::hardware::shared;
    use crate::reader::simulated::SimulatedReader;

    fn session_with(reader: &SimulatedReader, layout: CheckpointLayout) -> ReaderSession {
        ReaderSession::new(
            RuntimeConfig::for_layout("10.0.0.80", layout),
            shared(reader.clone()),
            Arc::new(LogSink),
        )
    }

    #[test]
    fn test_reader_errors_map_to_session_errors() {
        assert_eq!(
            SessionError::from(ReaderError::Configuration("tx".to_string())),
            SessionError::Configuration("tx".to_string())
        );
        assert_eq!(SessionError::from(ReaderError::NotConnected), SessionError::NotConnected);
        assert_eq!(
            SessionError::from(SupervisorError::ReconnectionExhausted { attempts: 5 }),
            SessionError::ReconnectionExhausted { attempts: 5 }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_custom_validator_changes_actuation() {
        use crate::reader::types::{OutputLevel, TagDetection};

        let reader = SimulatedReader::new(13);
        let session = session_with(&reader, CheckpointLayout::DockDoor)
            .with_validator(EpcValidator::new(r"^ZZZZ( [0-9A-F]{4}){3}$").unwrap());
        session.begin(None).await.unwrap();

        reader.inject(vec![TagDetection::new("ZZZZ 1234 EF01 5678", 2, -50.0, chrono::Utc::now())]);
        tokio::time::sleep(Duration::from_secs(2)).await;

        let levels: Vec<_> = reader.output_log().iter().map(|w| (w.port, w.level)).collect();
        assert_eq!(levels, vec![(3, OutputLevel::High), (3, OutputLevel::Low)]);

        session.end().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn test_begin_twice_is_noop() {
        let reader = SimulatedReader::new(13);
        let session = session_with(&reader, CheckpointLayout::DockDoor);

        session.begin(None).await.unwrap();
        session.begin(None).await.unwrap();

        assert_eq!(reader.connect_attempts(), 1);
        assert_eq!(reader.subscribe_calls(), 1);
        assert!(session.is_active().await);

        session.end().await.unwrap();
        assert!(session.end().await.is_none());
        assert!(!reader.is_reading());
        assert!(reader.is_connected());
    }

    #[tokio::test]
    async fn test_unknown_lane_rejected_before_connecting() {
        let reader = SimulatedReader::new(4);
        let session = session_with(&reader, CheckpointLayout::Lane);

        let err = session.begin(Some("Carril7")).await.unwrap_err();

        assert_eq!(err, SessionError::UnknownLane("Carril7".to_string()));
        assert_eq!(reader.connect_attempts(), 0);
    }

    #[tokio::test]
    async fn test_rejected_configuration_is_fatal() {
        let reader = SimulatedReader::new(13);
        reader.reject_next_config("tx power out of range");
        let session = session_with(&reader, CheckpointLayout::DockDoor);

        let err = session.begin(None).await.unwrap_err();

        assert_eq!(err, SessionError::Configuration("tx power out of range".to_string()));
        assert!(!session.is_active().await);
        assert!(!reader.is_reading());
        assert_eq!(reader.subscribe_calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_force_disconnect_when_disconnected_reconnects() {
        let reader = SimulatedReader::new(13);
        let session = session_with(&reader, CheckpointLayout::DockDoor);

        assert_eq!(session.force_disconnect().await.unwrap(), DisconnectOutcome::Reconnected);
        assert_eq!(session.supervisor().state(), ConnectionState::Connected);

        assert_eq!(session.force_disconnect().await.unwrap(), DisconnectOutcome::Disconnected);
        assert_eq!(session.supervisor().state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_antenna_config_connects_then_queries() {
        let reader = SimulatedReader::new(13);
        let session = session_with(&reader, CheckpointLayout::DockDoor);

        let config = session.antenna_config().await.unwrap();

        assert_eq!(reader.connect_attempts(), 1);
        assert_eq!(config, reader.active_config());
    }

    #[tokio::test]
    async fn test_deactivate_outputs_requires_connection() {
        let reader = SimulatedReader::new(13);
        let session = session_with(&reader, CheckpointLayout::DockDoor);

        assert_eq!(session.deactivate_outputs().await, Err(SessionError::NotConnected));

        session.supervisor().connect().await.unwrap();
        session.deactivate_outputs().await.unwrap();
        assert_eq!(reader.output_log().len(), 3);
    }
}
