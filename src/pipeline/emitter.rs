//! Turns flushed batches into outward notifications
//!
//! Delivery is at-most-once: a batch that fails to publish is logged and
//! dropped, never re-queued into the window.

use crate::pipeline::direction::Direction;
use crate::pipeline::lane::{lane_for, Lane};
use crate::pipeline::window::DetectionBatch;
use crate::reader::types::TagDetection;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Fixed, sortable timestamp format used in every payload
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.format(TIMESTAMP_FORMAT).to_string()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TagNotification {
    pub epc: String,
    pub antenna_port: u16,
    pub peak_rssi_dbm: f64,
    /// Display form of the signal strength, e.g. `"-55 dBm"`
    pub rssi: String,
    pub first_seen: String,
    pub last_seen: String,
    pub direction: Direction,
    pub reader_address: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub lane: Option<String>,
}

impl TagNotification {
    pub fn from_detection(
        detection: &TagDetection,
        direction: Direction,
        reader_address: &str,
        lane: Option<&Lane>,
    ) -> Self {
        Self {
            epc: detection.epc().to_string(),
            antenna_port: detection.antenna_port(),
            peak_rssi_dbm: detection.peak_rssi_dbm(),
            rssi: format!("{} dBm", detection.peak_rssi_dbm()),
            first_seen: format_timestamp(&detection.first_seen()),
            last_seen: format_timestamp(&detection.last_seen()),
            direction,
            reader_address: reader_address.to_string(),
            lane: lane.map(|l| l.name.clone()),
        }
    }
}

/// One outward message per flushed batch and channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchNotification {
    pub channel: String,
    pub reader_address: String,
    pub epoch: u64,
    pub flushed_at: String,
    pub tag_count: usize,
    pub tags: Vec<TagNotification>,
}

#[derive(Debug)]
pub enum PublishError {
    /// The transport has no receivers left
    Closed(String),
    Io(std::io::Error),
    Serialization(serde_json::Error),
    Rejected(String),
}

impl From<std::io::Error> for PublishError {
    fn from(err: std::io::Error) -> Self {
        PublishError::Io(err)
    }
}

impl From<serde_json::Error> for PublishError {
    fn from(err: serde_json::Error) -> Self {
        PublishError::Serialization(err)
    }
}

impl std::fmt::Display for PublishError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PublishError::Closed(channel) => write!(f, "Channel closed: {}", channel),
            PublishError::Io(e) => write!(f, "IO error: {}", e),
            PublishError::Serialization(e) => write!(f, "Serialization error: {}", e),
            PublishError::Rejected(reason) => write!(f, "Publish rejected: {}", reason),
        }
    }
}

impl std::error::Error for PublishError {}

#[async_trait]
pub trait NotificationSink: Send + Sync {
    /// Publish one batch notification to a named logical channel
    async fn publish(&self, channel: &str, payload: &BatchNotification) -> Result<(), PublishError>;

    /// Get sink type for logging
    fn sink_type(&self) -> &'static str;
}

pub struct NotificationEmitter {
    sink: Arc<dyn NotificationSink>,
    default_channel: String,
    reader_address: String,
    lanes: Vec<Lane>,
}

impl NotificationEmitter {
    pub fn new(
        sink: Arc<dyn NotificationSink>,
        default_channel: impl Into<String>,
        reader_address: impl Into<String>,
        lanes: Vec<Lane>,
    ) -> Self {
        Self {
            sink,
            default_channel: default_channel.into(),
            reader_address: reader_address.into(),
            lanes,
        }
    }

    /// Build the notifications for a batch, one per channel it touches
    ///
    /// Tags on lane ports go to their lane's channel, the rest to the
    /// default channel. Channels appear in order of their first tag.
    pub fn build(&self, batch: &DetectionBatch, directions: &[Direction]) -> Vec<BatchNotification> {
        let flushed_at = format_timestamp(&batch.flushed_at);
        let mut messages: Vec<BatchNotification> = Vec::new();

        for (i, detection) in batch.detections.iter().enumerate() {
            let direction = directions.get(i).copied().unwrap_or(Direction::Indeterminate);
            let lane = lane_for(&self.lanes, detection.antenna_port());
            let channel = lane.map(|l| l.channel.as_str()).unwrap_or(self.default_channel.as_str());
            let tag = TagNotification::from_detection(detection, direction, &self.reader_address, lane);

            match messages.iter_mut().find(|m| m.channel == channel) {
                Some(message) => message.tags.push(tag),
                None => messages.push(BatchNotification {
                    channel: channel.to_string(),
                    reader_address: self.reader_address.clone(),
                    epoch: batch.epoch,
                    flushed_at: flushed_at.clone(),
                    tag_count: 0,
                    tags: vec![tag],
                }),
            }
        }

        for message in messages.iter_mut() {
            message.tag_count = message.tags.len();
        }
        messages
    }

    /// Publish a flushed batch; returns how many messages were delivered
    ///
    /// An empty batch publishes nothing. Failures are logged, not retried.
    pub async fn emit(&self, batch: &DetectionBatch, directions: &[Direction]) -> usize {
        if batch.is_empty() {
            return 0;
        }

        let mut delivered = 0;
        for message in self.build(batch, directions) {
            match self.sink.publish(&message.channel, &message).await {
                Ok(()) => {
                    delivered += 1;
                    log::info!(
                        "📤 Batch {} published to '{}' via {} ({} tags)",
                        message.epoch,
                        message.channel,
                        self.sink.sink_type(),
                        message.tag_count
                    );
                }
                Err(e) => {
                    log::error!(
                        "❌ PublishFailure: batch {} to '{}' via {}: {}",
                        message.epoch,
                        message.channel,
                        self.sink.sink_type(),
                        e
                    );
                }
            }
        }
        delivered
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::sync::Mutex;

    #[derive(Default)]
    struct RecordingSink {
        published: Mutex<Vec<BatchNotification>>,
        fail: bool,
    }

    #[async_trait]
    impl NotificationSink for RecordingSink {
        async fn publish(&self, _channel: &str, payload: &BatchNotification) -> Result<(), PublishError> {
            if self.fail {
                return Err(PublishError::Rejected("hub offline".to_string()));
            }
            self.published.lock().unwrap().push(payload.clone());
            Ok(())
        }

        fn sink_type(&self) -> &'static str {
            "RECORDING"
        }
    }

    fn batch(detections: Vec<TagDetection>) -> DetectionBatch {
        DetectionBatch {
            epoch: 7,
            flushed_at: Utc.with_ymd_and_hms(2024, 3, 9, 14, 5, 0).unwrap(),
            detections,
        }
    }

    fn seen_at() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 9, 14, 4, 57).unwrap()
    }

    #[tokio::test]
    async fn test_single_channel_payload() {
        let sink = Arc::new(RecordingSink::default());
        let emitter = NotificationEmitter::new(sink.clone(), "EntradaPT", "192.168.1.40", vec![]);
        let batch = batch(vec![
            TagDetection::new("ABCD 1234 EF01 5678", 3, -55.0, seen_at()),
            TagDetection::new("ABCD 1234 EF01 9999", 10, -61.5, seen_at()),
        ]);

        let delivered = emitter.emit(&batch, &[Direction::Entry, Direction::Static]).await;

        assert_eq!(delivered, 1);
        let published = sink.published.lock().unwrap();
        let message = &published[0];
        assert_eq!(message.channel, "EntradaPT");
        assert_eq!(message.tag_count, 2);
        assert_eq!(message.flushed_at, "2024-03-09 14:05:00");
        assert_eq!(message.tags[0].rssi, "-55 dBm");
        assert_eq!(message.tags[0].first_seen, "2024-03-09 14:04:57");
        assert_eq!(message.tags[0].direction, Direction::Entry);
        assert_eq!(message.tags[1].rssi, "-61.5 dBm");
        assert_eq!(message.tags[1].reader_address, "192.168.1.40");
        assert!(message.tags[1].lane.is_none());
    }

    #[tokio::test]
    async fn test_lane_ports_route_to_lane_channels() {
        let sink = Arc::new(RecordingSink::default());
        let lanes = vec![Lane::new("Carril2", 1..=2), Lane::new("Carril3", 3..=4)];
        let emitter = NotificationEmitter::new(sink.clone(), "Embarque", "10.0.0.7", lanes);
        let batch = batch(vec![
            TagDetection::new("AAAA 0000 0000 0001", 3, -50.0, seen_at()),
            TagDetection::new("AAAA 0000 0000 0002", 1, -50.0, seen_at()),
            TagDetection::new("AAAA 0000 0000 0003", 4, -50.0, seen_at()),
        ]);

        let delivered = emitter.emit(&batch, &[Direction::Indeterminate; 3]).await;

        assert_eq!(delivered, 2);
        let published = sink.published.lock().unwrap();
        assert_eq!(published[0].channel, "Carril3");
        assert_eq!(published[0].tag_count, 2);
        assert_eq!(published[0].tags[1].lane.as_deref(), Some("Carril3"));
        assert_eq!(published[1].channel, "Carril2");
        assert_eq!(published[1].tags[0].epc, "AAAA 0000 0000 0002");
    }

    #[tokio::test]
    async fn test_empty_batch_publishes_nothing() {
        let sink = Arc::new(RecordingSink::default());
        let emitter = NotificationEmitter::new(sink.clone(), "EntradaPT", "10.0.0.7", vec![]);

        assert_eq!(emitter.emit(&batch(vec![]), &[]).await, 0);
        assert!(sink.published.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_publish_failure_is_swallowed() {
        let sink = Arc::new(RecordingSink {
            fail: true,
            ..Default::default()
        });
        let emitter = NotificationEmitter::new(sink, "EntradaPT", "10.0.0.7", vec![]);
        let batch = batch(vec![TagDetection::new("AAAA 0000 0000 0001", 1, -50.0, seen_at())]);

        assert_eq!(emitter.emit(&batch, &[Direction::Indeterminate]).await, 0);
    }

    #[test]
    fn test_payload_serializes_direction_uppercase() {
        let tag = TagNotification::from_detection(
            &TagDetection::new("AAAA 0000 0000 0001", 8, -40.0, seen_at()),
            Direction::Exit,
            "10.0.0.7",
            None,
        );
        let json = serde_json::to_value(&tag).unwrap();

        assert_eq!(json["direction"], "EXIT");
        assert_eq!(json["antenna_port"], 8);
        assert!(json.get("lane").is_none());
    }
}
