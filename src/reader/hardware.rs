use crate::reader::types::{AntennaConfig, OutputLevel, TagReport};
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};

#[derive(Debug, Clone, PartialEq)]
pub enum ReaderError {
    Connection(String),
    Configuration(String),
    Query(String),
    Output(String),
    NotConnected,
}

impl std::fmt::Display for ReaderError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReaderError::Connection(msg) => write!(f, "Connection error: {}", msg),
            ReaderError::Configuration(msg) => write!(f, "Configuration error: {}", msg),
            ReaderError::Query(msg) => write!(f, "Query error: {}", msg),
            ReaderError::Output(msg) => write!(f, "Output error: {}", msg),
            ReaderError::NotConnected => write!(f, "Reader is not connected"),
        }
    }
}

impl std::error::Error for ReaderError {}

/// Control surface of a fixed RFID reader
///
/// Implementations wrap a vendor SDK handle. Calls are serialized by the
/// caller (see [`SharedReader`]), so implementations do not need to be
/// re-entrant.
#[async_trait]
pub trait ReaderHardware: Send {
    async fn connect(&mut self, address: &str) -> Result<(), ReaderError>;

    async fn disconnect(&mut self) -> Result<(), ReaderError>;

    /// Push per-port radio settings and report options
    async fn apply_config(&mut self, config: &AntennaConfig) -> Result<(), ReaderError>;

    /// Read back the settings currently active on the reader
    ///
    /// Cheap and idempotent, which also makes it the keep-alive query.
    async fn query_config(&mut self) -> Result<AntennaConfig, ReaderError>;

    async fn start(&mut self) -> Result<(), ReaderError>;

    async fn stop(&mut self) -> Result<(), ReaderError>;

    async fn set_output(&mut self, port: u16, level: OutputLevel) -> Result<(), ReaderError>;

    /// Route tag reports into `sink`, replacing any previous subscriber
    fn subscribe(&mut self, sink: mpsc::Sender<TagReport>);

    /// Drop the current subscriber, if any
    fn unsubscribe(&mut self);

    /// Get backend type for logging
    fn backend_type(&self) -> &'static str;
}

pub type SharedReader = Arc<Mutex<Box<dyn ReaderHardware>>>;

pub fn shared(reader: impl ReaderHardware + 'static) -> SharedReader {
    Arc::new(Mutex::new(Box::new(reader)))
}
