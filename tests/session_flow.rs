//! End-to-end session behaviour against the simulated reader
//!
//! All tests run on paused Tokio time, so window flushes, output pulses and
//! keep-alive ticks happen at exact virtual instants.

use async_trait::async_trait;
use chrono::Utc;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tagflow::pipeline::direction::Direction;
use tagflow::pipeline::emitter::{BatchNotification, NotificationSink, PublishError};
use tagflow::pipeline::sinks::BroadcastSink;
use tagflow::reader::types::{OutputLevel, TagDetection};
use tagflow::reader::{shared, SimulatedReader};
use tagflow::{CheckpointLayout, ReaderSession, RuntimeConfig};
use tokio::time::{sleep, Instant};

const VALID_EPC: &str = "ABCD 1234 EF01 5678";
const INVALID_EPC: &str = "ZZZZ 1234 EF01 5678";

#[derive(Default)]
struct RecordingSink {
    published: Mutex<Vec<(String, BatchNotification)>>,
}

impl RecordingSink {
    fn published(&self) -> Vec<(String, BatchNotification)> {
        self.published.lock().unwrap().clone()
    }
}

#[async_trait]
impl NotificationSink for RecordingSink {
    async fn publish(&self, channel: &str, payload: &BatchNotification) -> Result<(), PublishError> {
        self.published.lock().unwrap().push((channel.to_string(), payload.clone()));
        Ok(())
    }

    fn sink_type(&self) -> &'static str {
        "RECORDING"
    }
}

fn read(epc: &str, port: u16, rssi: f64) -> TagDetection {
    TagDetection::new(epc, port, rssi, Utc::now())
}

fn dock_door(reader: &SimulatedReader) -> (ReaderSession, Arc<RecordingSink>) {
    let sink = Arc::new(RecordingSink::default());
    let session = ReaderSession::new(
        RuntimeConfig::for_layout("192.168.1.40", CheckpointLayout::DockDoor),
        shared(reader.clone()),
        sink.clone(),
    );
    (session, sink)
}

#[tokio::test(start_paused = true)]
async fn test_repeated_epcs_flush_once_with_first_read() {
    let reader = SimulatedReader::new(13);
    let (session, sink) = dock_door(&reader);
    session.begin(None).await.unwrap();

    reader.inject(vec![
        read(VALID_EPC, 1, -40.0),
        read(VALID_EPC, 9, -20.0),
        read("ABCD 1234 EF01 0002", 2, -60.0),
    ]);
    sleep(Duration::from_secs(1)).await;
    reader.inject(vec![read(VALID_EPC, 5, -10.0)]);
    sleep(Duration::from_secs(5)).await;

    let published = sink.published();
    assert_eq!(published.len(), 1);

    let (channel, batch) = &published[0];
    assert_eq!(channel, "EntradaPT");
    assert_eq!(batch.tag_count, 2);
    assert_eq!(batch.tags[0].epc, VALID_EPC);
    assert_eq!(batch.tags[0].antenna_port, 1);
    assert_eq!(batch.tags[0].rssi, "-40 dBm");
    assert_eq!(batch.tags[1].epc, "ABCD 1234 EF01 0002");
    assert_eq!(batch.reader_address, "192.168.1.40");

    session.end().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_direction_follows_port_history_across_batches() {
    let reader = SimulatedReader::new(13);
    let (session, sink) = dock_door(&reader);
    session.begin(None).await.unwrap();

    for port in [3, 10, 3, 5] {
        reader.inject(vec![read(VALID_EPC, port, -50.0)]);
        sleep(Duration::from_secs(6)).await;
    }

    let directions: Vec<Direction> = sink
        .published()
        .iter()
        .map(|(_, batch)| batch.tags[0].direction)
        .collect();
    assert_eq!(
        directions,
        vec![Direction::Indeterminate, Direction::Entry, Direction::Exit, Direction::Static]
    );
    assert_eq!(session.classifier().last_port(VALID_EPC), Some(5));

    let stats = session.end().await.unwrap();
    assert_eq!(stats.unique_tags, 1);
    assert_eq!(stats.batches_emitted, 4);
}

#[tokio::test(start_paused = true)]
async fn test_valid_and_invalid_epcs_drive_different_outputs() {
    let reader = SimulatedReader::new(13);
    let (session, _sink) = dock_door(&reader);
    let start = Instant::now();
    session.begin(None).await.unwrap();

    reader.inject(vec![read(VALID_EPC, 4, -50.0), read(INVALID_EPC, 4, -50.0)]);
    sleep(Duration::from_secs(10)).await;
    // A later epoch does not actuate the same EPC again
    reader.inject(vec![read(VALID_EPC, 8, -50.0)]);
    sleep(Duration::from_secs(10)).await;

    let writes: Vec<_> = reader
        .output_log()
        .iter()
        .map(|w| (w.port, w.level, w.at - start))
        .collect();
    assert_eq!(
        writes,
        vec![
            (3, OutputLevel::High, Duration::ZERO),
            (3, OutputLevel::Low, Duration::from_millis(1500)),
            (1, OutputLevel::High, Duration::from_millis(1500)),
            (3, OutputLevel::High, Duration::from_millis(1500)),
            (1, OutputLevel::Low, Duration::from_millis(6500)),
            (3, OutputLevel::Low, Duration::from_millis(6500)),
        ]
    );

    session.end().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_end_flushes_pending_batch_exactly_once() {
    let reader = SimulatedReader::new(13);
    let (session, sink) = dock_door(&reader);
    session.begin(None).await.unwrap();

    reader.inject(vec![read(VALID_EPC, 2, -50.0)]);
    sleep(Duration::from_secs(1)).await;
    assert_eq!(session.stats().await.pending_tags, 1);

    let stats = session.end().await.unwrap();
    assert_eq!(sink.published().len(), 1);
    assert_eq!(stats.batches_emitted, 1);
    assert!(!stats.active);

    // The cancelled timer must not flush again
    sleep(Duration::from_secs(30)).await;
    assert_eq!(sink.published().len(), 1);
    assert!(!reader.is_reading());
    assert!(reader.is_connected());
    assert!(!session.supervisor().is_subscribed());
}

#[tokio::test(start_paused = true)]
async fn test_quiet_session_publishes_nothing() {
    let reader = SimulatedReader::new(13);
    let (session, sink) = dock_door(&reader);
    session.begin(None).await.unwrap();

    sleep(Duration::from_secs(60)).await;
    let stats = session.end().await.unwrap();

    assert!(sink.published().is_empty());
    assert_eq!(stats.batches_emitted, 0);
    assert_eq!(stats.unique_tags, 0);
    assert_eq!(stats.elapsed, Duration::from_secs(60));
}

#[tokio::test(start_paused = true)]
async fn test_lane_session_reads_only_its_ports() {
    let reader = SimulatedReader::new(4);
    let sink = BroadcastSink::new(16);
    let mut lane3 = sink.subscribe_to("Carril3");
    let session = ReaderSession::new(
        RuntimeConfig::for_layout("172.16.100.199", CheckpointLayout::Lane),
        shared(reader.clone()),
        Arc::new(sink.clone()),
    );

    session.begin(Some("Carril3")).await.unwrap();
    assert_eq!(reader.active_config().enabled_ports(), vec![3, 4]);

    let delivered = reader.inject(vec![
        read("AAAA 0000 0000 0001", 1, -50.0),
        read("AAAA 0000 0000 0002", 4, -50.0),
    ]);
    assert_eq!(delivered, 1);

    let batch = lane3.recv().await.unwrap();
    assert_eq!(batch.channel, "Carril3");
    assert_eq!(batch.tag_count, 1);
    assert_eq!(batch.tags[0].epc, "AAAA 0000 0000 0002");
    assert_eq!(batch.tags[0].lane.as_deref(), Some("Carril3"));

    let stats = session.stats().await;
    assert_eq!(stats.lane.as_deref(), Some("Carril3"));
    session.end().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_many_concurrent_reports_each_epc_once() {
    let reader = SimulatedReader::new(13);
    let (session, sink) = dock_door(&reader);
    session.begin(None).await.unwrap();

    for i in 0..100u16 {
        let epc = format!("E280 1160 6000 {:04X}", i);
        reader.inject(vec![read(&epc, i % 13 + 1, -50.0), read(&epc, 1, -30.0)]);
    }
    sleep(Duration::from_secs(6)).await;

    let published = sink.published();
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].1.tag_count, 100);
    assert_eq!(session.stats().await.unique_tags, 100);

    session.end().await.unwrap();
}
