//! Checkpoint Runtime
//!
//! Runs one reader session against the simulated reader:
//! - Loads configuration from the environment (`.env` supported)
//! - Generates random tag traffic on the configured antenna ports
//! - Emits batch notifications to the log, or to a JSONL feed
//! - Pulses the simulated outputs per detected EPC
//!
//! Usage:
//!   cargo run --release --bin checkpoint_runtime [-- --lane Carril3]
//!
//! Environment variables:
//!   READER_ADDRESS - Reader host (required)
//!   CHECKPOINT_LAYOUT - dock-door | lane (default: dock-door)
//!   OUTPUT_JSONL_PATH - Write notifications here instead of the log
//!   SIM_TAG_INTERVAL_MS - Simulated report interval (default: 250)
//!   SIM_TAG_POPULATION - Distinct simulated tags (default: 40)

use dotenv::dotenv;
use log::{error, info, warn};
use std::env;
use std::sync::Arc;
use tagflow::pipeline::emitter::NotificationSink;
use tagflow::pipeline::sinks::{JsonlSink, LogSink};
use tagflow::reader::{shared, SimulatedReader};
use tagflow::{ReaderSession, RuntimeConfig, SimulationConfig};

fn parse_lane_from_args() -> Option<String> {
    let args: Vec<String> = env::args().collect();
    args.iter()
        .position(|a| a == "--lane")
        .and_then(|idx| args.get(idx + 1))
        .cloned()
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();

    let config = RuntimeConfig::from_env()?;
    let simulation = SimulationConfig::from_env()?;
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(config.rust_log.as_str())).init();

    info!("🚀 Checkpoint Runtime");
    info!("   ├─ Version: {}", env!("CARGO_PKG_VERSION"));
    info!("   └─ Reader backend: SIMULATED");
    config.log_summary();

    let sink: Arc<dyn NotificationSink> = match &config.output_jsonl_path {
        Some(path) => {
            info!("📄 Writing notifications to {}", path);
            Arc::new(JsonlSink::new(path, config.output_max_size_mb, config.output_max_rotations)?)
        }
        None => Arc::new(LogSink),
    };

    let max_port = *config.antenna_ports.end();
    let reader = SimulatedReader::new(max_port);
    let session = ReaderSession::new(config, shared(reader.clone()), sink);

    let lane = parse_lane_from_args();
    session.begin(lane.as_deref()).await?;

    let traffic = reader.spawn_traffic(simulation.tag_interval, simulation.tag_population);

    info!("🔄 Press CTRL+C to shutdown gracefully");

    match tokio::signal::ctrl_c().await {
        Ok(()) => {
            info!("");
            info!("⚠️  Received CTRL+C, shutting down...");
        }
        Err(err) => {
            error!("❌ Failed to listen for CTRL+C: {}", err);
        }
    }

    traffic.abort();

    match session.end().await {
        Some(stats) => stats.log(),
        None => warn!("⚠️  No session was active"),
    }

    if let Err(e) = session.supervisor().disconnect().await {
        warn!("⚠️  Disconnect reported: {}", e);
    }

    info!("✅ Checkpoint runtime stopped");
    Ok(())
}
