pub mod backoff;
pub mod hardware;
pub mod prober;
pub mod simulated;
pub mod supervisor;
pub mod types;

pub use backoff::{ReconnectPolicy, ReconnectionExhausted};
pub use hardware::{shared, ReaderError, ReaderHardware, SharedReader};
pub use prober::{LivenessProber, ProbeOutcome};
pub use simulated::SimulatedReader;
pub use supervisor::{ConnectionState, ConnectionSupervisor, SupervisorError};
pub use types::{AntennaConfig, AntennaSettings, OutputLevel, TagDetection, TagReport};
