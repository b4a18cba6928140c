//! Notification sink backends

use crate::pipeline::emitter::{BatchNotification, NotificationSink, PublishError};
use async_trait::async_trait;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use tokio::sync::{broadcast, Mutex};

/// Writes every notification to the log and nowhere else
pub struct LogSink;

#[async_trait]
impl NotificationSink for LogSink {
    async fn publish(&self, channel: &str, payload: &BatchNotification) -> Result<(), PublishError> {
        log::info!("📡 [{}] batch {} ({} tags)", channel, payload.epoch, payload.tag_count);
        for (i, tag) in payload.tags.iter().enumerate() {
            let branch = if i + 1 == payload.tags.len() { "└─" } else { "├─" };
            log::info!(
                "   {} {} port {} {} {}",
                branch,
                tag.epc,
                tag.antenna_port,
                tag.rssi,
                <&str>::from(tag.direction)
            );
        }
        Ok(())
    }

    fn sink_type(&self) -> &'static str {
        "LOG"
    }
}

/// In-process pub/sub; every subscriber sees every channel and filters
#[derive(Clone)]
pub struct BroadcastSink {
    tx: broadcast::Sender<(String, BatchNotification)>,
}

impl BroadcastSink {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> ChannelSubscriber {
        ChannelSubscriber {
            rx: self.tx.subscribe(),
            channel: None,
        }
    }

    /// Subscribe to a single named channel
    pub fn subscribe_to(&self, channel: impl Into<String>) -> ChannelSubscriber {
        ChannelSubscriber {
            rx: self.tx.subscribe(),
            channel: Some(channel.into()),
        }
    }
}

#[async_trait]
impl NotificationSink for BroadcastSink {
    async fn publish(&self, channel: &str, payload: &BatchNotification) -> Result<(), PublishError> {
        self.tx
            .send((channel.to_string(), payload.clone()))
            .map(|_| ())
            .map_err(|_| PublishError::Closed(channel.to_string()))
    }

    fn sink_type(&self) -> &'static str {
        "BROADCAST"
    }
}

pub struct ChannelSubscriber {
    rx: broadcast::Receiver<(String, BatchNotification)>,
    channel: Option<String>,
}

impl ChannelSubscriber {
    /// Next notification on the subscribed channel, `None` once the sink is gone
    ///
    /// A lagging subscriber skips what it missed and keeps going.
    pub async fn recv(&mut self) -> Option<BatchNotification> {
        loop {
            match self.rx.recv().await {
                Ok((channel, payload)) => {
                    if self.channel.as_deref().map_or(true, |c| c == channel) {
                        return Some(payload);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    log::warn!("⚠️  Notification subscriber lagged, {} messages skipped", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

struct JsonlFile {
    file: BufWriter<File>,
    current_size: u64,
    max_size: u64,
    base_path: PathBuf,
    rotation_count: u32,
    max_rotations: u32,
}

impl JsonlFile {
    fn write_line(&mut self, line: &str) -> Result<(), PublishError> {
        writeln!(self.file, "{}", line)?;
        self.file.flush()?;

        self.current_size += (line.len() + 1) as u64;

        if self.current_size >= self.max_size {
            self.rotate()?;
        }

        Ok(())
    }

    fn rotated_path(&self, index: u32) -> PathBuf {
        self.base_path.with_extension(format!("jsonl.{}", index))
    }

    fn rotate(&mut self) -> Result<(), PublishError> {
        self.file.flush()?;

        let oldest = self.rotated_path(self.max_rotations);
        if oldest.exists() {
            std::fs::remove_file(&oldest)?;
        }

        for i in (1..self.max_rotations).rev() {
            let old_path = self.rotated_path(i);
            if old_path.exists() {
                std::fs::rename(&old_path, self.rotated_path(i + 1))?;
            }
        }

        if self.max_rotations > 0 && self.base_path.exists() {
            std::fs::rename(&self.base_path, self.rotated_path(1))?;
        }

        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&self.base_path)?;

        self.file = BufWriter::new(file);
        self.current_size = 0;
        self.rotation_count += 1;

        log::info!("📄 Rotated notification file (rotation #{})", self.rotation_count);

        Ok(())
    }
}

/// Append-only JSON lines feed with size-based rotation
///
/// Each line is one [`BatchNotification`]. When the file reaches
/// `max_size_mb` it becomes `<name>.jsonl.1`, older rotations shift up and
/// anything past `max_rotations` is deleted.
pub struct JsonlSink {
    inner: Mutex<JsonlFile>,
}

impl JsonlSink {
    pub fn new(path: impl AsRef<Path>, max_size_mb: u64, max_rotations: u32) -> Result<Self, PublishError> {
        Self::with_max_bytes(path, max_size_mb * 1024 * 1024, max_rotations)
    }

    pub fn with_max_bytes(path: impl AsRef<Path>, max_size: u64, max_rotations: u32) -> Result<Self, PublishError> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let current_size = file.metadata()?.len();

        Ok(Self {
            inner: Mutex::new(JsonlFile {
                file: BufWriter::new(file),
                current_size,
                max_size: max_size.max(1),
                base_path: path.to_path_buf(),
                rotation_count: 0,
                max_rotations,
            }),
        })
    }

    pub async fn rotations(&self) -> u32 {
        self.inner.lock().await.rotation_count
    }
}

#[async_trait]
impl NotificationSink for JsonlSink {
    async fn publish(&self, _channel: &str, payload: &BatchNotification) -> Result<(), PublishError> {
        let json = serde_json::to_string(payload)?;
        self.inner.lock().await.write_line(&json)
    }

    fn sink_type(&self) -> &'static str {
        "JSONL"
    }
}
