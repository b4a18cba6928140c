//! Connection resilience of a running session

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tagflow::pipeline::sinks::BroadcastSink;
use tagflow::reader::types::TagDetection;
use tagflow::reader::{shared, ConnectionState, ConnectionSupervisor, ReconnectPolicy, SimulatedReader};
use tagflow::{CheckpointLayout, DisconnectOutcome, ReaderSession, RuntimeConfig, SessionError};
use tokio::time::{sleep, Instant};

fn session_with(reader: &SimulatedReader) -> (ReaderSession, BroadcastSink) {
    let sink = BroadcastSink::new(64);
    let session = ReaderSession::new(
        RuntimeConfig::for_layout("192.168.1.40", CheckpointLayout::DockDoor),
        shared(reader.clone()),
        Arc::new(sink.clone()),
    );
    (session, sink)
}

#[tokio::test(start_paused = true)]
async fn test_severed_link_recovers_on_next_keepalive() {
    let reader = SimulatedReader::new(13);
    let (session, sink) = session_with(&reader);
    let mut feed = sink.subscribe();
    session.begin(None).await.unwrap();

    sleep(Duration::from_secs(1)).await;
    reader.sever();
    assert_eq!(reader.inject(vec![TagDetection::new("ABCD 1234 EF01 5678", 2, -50.0, Utc::now())]), 0);

    // Keep-alive at 30s finds the dead link, redials and resumes reading
    sleep(Duration::from_secs(30)).await;
    assert_eq!(session.supervisor().state(), ConnectionState::Connected);
    assert_eq!(reader.connect_attempts(), 2);
    assert!(reader.is_reading());
    assert_eq!(reader.subscribe_calls(), 1);

    let delivered = reader.inject(vec![TagDetection::new("ABCD 1234 EF01 5678", 2, -50.0, Utc::now())]);
    assert_eq!(delivered, 1);
    let batch = feed.recv().await.unwrap();
    assert_eq!(batch.tag_count, 1);

    session.end().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_exhausted_reconnect_waits_for_operator() {
    let reader = SimulatedReader::new(13);
    let (session, _sink) = session_with(&reader);
    session.begin(None).await.unwrap();

    sleep(Duration::from_secs(1)).await;
    reader.sever();
    reader.fail_all_connects(true);

    // Probe at 30s: five attempts 5s apart, exhausted at 50s
    sleep(Duration::from_secs(50)).await;
    assert_eq!(session.supervisor().state(), ConnectionState::Disconnected);
    assert_eq!(reader.connect_attempts(), 6);

    // The 60s probe fails fast without touching the hardware
    sleep(Duration::from_secs(30)).await;
    assert_eq!(reader.connect_attempts(), 6);

    let stats = session.stats().await;
    assert!(stats.active);
    assert_eq!(stats.connection_state, ConnectionState::Disconnected);
    assert_eq!(stats.reconnect_attempts, 5);

    session.end().await.unwrap();
    assert_eq!(
        session.force_disconnect().await,
        Err(SessionError::ReconnectionExhausted { attempts: 5 })
    );
    assert_eq!(reader.connect_attempts(), 6);

    // Explicit start by the operator connects again and resets the counter
    reader.fail_all_connects(false);
    session.begin(None).await.unwrap();
    assert_eq!(session.supervisor().state(), ConnectionState::Connected);
    assert_eq!(session.supervisor().reconnect_attempts(), 0);
    session.end().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_force_disconnect_ends_session() {
    let reader = SimulatedReader::new(13);
    let (session, _sink) = session_with(&reader);
    session.begin(None).await.unwrap();

    let outcome = session.force_disconnect().await.unwrap();

    assert_eq!(outcome, DisconnectOutcome::Disconnected);
    assert!(!session.is_active().await);
    assert!(!reader.is_connected());
    assert_eq!(session.supervisor().state(), ConnectionState::Disconnected);

    // Nothing keeps probing once the session is gone
    sleep(Duration::from_secs(120)).await;
    assert_eq!(reader.connect_attempts(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_supervisor_attempts_are_spaced_by_retry_delay() {
    let reader = SimulatedReader::new(4);
    reader.fail_all_connects(true);
    let supervisor = ConnectionSupervisor::new(
        shared(reader.clone()),
        "10.0.0.5",
        ReconnectPolicy {
            max_attempts: 5,
            retry_delay: Duration::from_secs(5),
        },
    );
    let mut states = supervisor.watch_state();
    let start = Instant::now();

    let result = supervisor.reconnect_with_backoff().await;

    assert!(result.is_err());
    assert_eq!(reader.connect_attempts(), 5);
    assert_eq!(start.elapsed(), Duration::from_secs(20));
    assert_eq!(*states.borrow_and_update(), ConnectionState::Disconnected);

    supervisor.disconnect().await.unwrap();
    supervisor.disconnect().await.unwrap();
    assert_eq!(supervisor.state(), ConnectionState::Disconnected);
}
