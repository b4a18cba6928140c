//! # Tag-event pipeline
//!
//! ```text
//! reader reports ─► window (dedup per epoch) ──flush──► direction ─► emitter ─► sink
//!        │
//!        └──► actuation decision ─► output actuator task ─► reader outputs
//! ```
//!
//! ## Module Organization
//!
//! - `window` - Dedup & batch window with a one-shot quiescence timer
//! - `direction` - Zone map and entry/exit classification
//! - `lane` - Named port groups with their own notification channel
//! - `emitter` - Batch → notification payloads, `NotificationSink` trait
//! - `sinks` - Log, broadcast and JSONL sink backends
//! - `actuation` - EPC validation, output plans and the actuator task

pub mod actuation;
pub mod direction;
pub mod emitter;
pub mod lane;
pub mod sinks;
pub mod window;

pub use actuation::{ActuationConfig, ActuationDecider, ActuationPlan, EpcValidator, OutputActuator, PlanQueue, Verdict};
pub use direction::{Direction, DirectionClassifier, Side, Zone, ZoneMap};
pub use emitter::{BatchNotification, NotificationEmitter, NotificationSink, PublishError, TagNotification};
pub use lane::Lane;
pub use sinks::{BroadcastSink, JsonlSink, LogSink};
pub use window::{DedupWindow, DetectionBatch, WindowMessage};
