//! # tagflow
//!
//! Tag-event aggregation, direction inference and connection resilience for
//! fixed RFID readers at a checkpoint (dock door, shipping lane).
//!
//! ## Module Organization
//!
//! - `reader` - Hardware trait, connection supervisor, liveness prober, simulated reader
//! - `pipeline` - Dedup window, direction classifier, notifications, output actuation
//! - `session` - Begin/end/force-disconnect entry points tying it all together
//! - `config` - Environment configuration and installation presets

pub mod config;
pub mod pipeline;
pub mod reader;
pub mod session;

pub use config::{CheckpointLayout, ConfigError, RuntimeConfig, SimulationConfig};
pub use session::{DisconnectOutcome, ReaderSession, SessionError, SessionStats};
