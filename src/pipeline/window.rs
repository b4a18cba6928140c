//! Dedup & batch window over incoming tag detections
//!
//! ```text
//!            on_detection (first in epoch)
//!   Idle ─────────────────────────────────► Collecting (flush timer armed)
//!    ▲                                           │
//!    └──────────── flush: swap epoch ◄───────────┘
//! ```
//!
//! The timer is armed by the first detection of an epoch and is never
//! pushed back by later ones, so a steady stream still flushes every
//! `quiescence`. Flushed batches travel over an ordered channel to the
//! batch processor. Batches are queued while the lock is still held, so
//! their channel order matches flush order and nothing can follow
//! `Shutdown`; emitting downstream never runs under the lock.

use crate::reader::types::TagDetection;
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

#[derive(Debug, Clone)]
pub struct DetectionBatch {
    /// Sequence number of the epoch this batch closes, starting at 1
    pub epoch: u64,
    pub flushed_at: DateTime<Utc>,
    /// First detection per EPC, in arrival order
    pub detections: Vec<TagDetection>,
}

impl DetectionBatch {
    pub fn len(&self) -> usize {
        self.detections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.detections.is_empty()
    }
}

/// Message sent from the window to the batch processor
#[derive(Debug)]
pub enum WindowMessage {
    Batch(DetectionBatch),
    Shutdown,
}

#[derive(Debug, Default)]
struct DedupEpoch {
    seen: HashSet<String>,
    detections: Vec<TagDetection>,
}

impl DedupEpoch {
    fn contains(&self, epc: &str) -> bool {
        self.seen.contains(epc)
    }

    fn insert(&mut self, detection: TagDetection) {
        self.seen.insert(detection.epc().to_string());
        self.detections.push(detection);
    }
}

#[derive(Debug, Default)]
struct WindowState {
    epoch: DedupEpoch,
    epoch_number: u64,
    unique_seen: u64,
    timer: Option<JoinHandle<()>>,
    closed: bool,
}

impl WindowState {
    /// Swap the epoch out and go back to Idle
    fn take_batch(&mut self) -> Option<DetectionBatch> {
        self.timer = None;
        let epoch = std::mem::take(&mut self.epoch);
        if epoch.detections.is_empty() {
            return None;
        }

        Some(DetectionBatch {
            epoch: self.epoch_number,
            flushed_at: Utc::now(),
            detections: epoch.detections,
        })
    }
}

struct Shared {
    state: Mutex<WindowState>,
    quiescence: Duration,
    batch_tx: mpsc::UnboundedSender<WindowMessage>,
}

#[derive(Clone)]
pub struct DedupWindow {
    shared: Arc<Shared>,
}

impl DedupWindow {
    pub fn new(quiescence: Duration) -> (Self, mpsc::UnboundedReceiver<WindowMessage>) {
        let (batch_tx, batch_rx) = mpsc::unbounded_channel();

        let window = Self {
            shared: Arc::new(Shared {
                state: Mutex::new(WindowState::default()),
                quiescence,
                batch_tx,
            }),
        };

        (window, batch_rx)
    }

    fn lock(&self) -> MutexGuard<'_, WindowState> {
        self.shared.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Record a detection; returns false if the EPC is already in this epoch
    ///
    /// Must be called from within a Tokio runtime (the flush timer is a task).
    pub fn on_detection(&self, detection: TagDetection) -> bool {
        let mut state = self.lock();

        if state.closed {
            log::debug!("Window closed, EPC {} dropped", detection.epc());
            return false;
        }

        if state.epoch.contains(detection.epc()) {
            log::trace!(
                "Duplicate EPC {} on port {} ignored (epoch {})",
                detection.epc(),
                detection.antenna_port(),
                state.epoch_number
            );
            return false;
        }

        state.epoch.insert(detection);
        state.unique_seen += 1;

        if state.timer.is_none() {
            state.epoch_number += 1;
            let epoch_number = state.epoch_number;
            let window = self.clone();
            let quiescence = self.shared.quiescence;

            state.timer = Some(tokio::spawn(async move {
                tokio::time::sleep(quiescence).await;
                window.flush_on_timer(epoch_number);
            }));
        }

        true
    }

    fn flush_on_timer(&self, epoch_number: u64) {
        let mut state = self.lock();
        // A stale timer must not flush the epoch that replaced its own
        if state.epoch_number != epoch_number || state.timer.is_none() {
            return;
        }

        if let Some(batch) = state.take_batch() {
            log::debug!("⏱️  Window flushed epoch {} ({} tags)", batch.epoch, batch.len());
            self.send(WindowMessage::Batch(batch));
        }
    }

    /// Queue a message for the processor; callers hold the state lock
    fn send(&self, message: WindowMessage) {
        if self.shared.batch_tx.send(message).is_err() {
            log::warn!("⚠️  Batch processor gone, flushed batch dropped");
        }
    }

    fn cancel_timer(state: &mut WindowState) {
        if let Some(timer) = state.timer.take() {
            timer.abort();
        }
    }

    /// Flush immediately, cancelling the pending timer
    ///
    /// Returns the batch to the caller instead of the processor channel.
    /// An empty epoch yields `None`.
    pub fn flush(&self) -> Option<DetectionBatch> {
        let mut state = self.lock();
        Self::cancel_timer(&mut state);
        state.take_batch()
    }

    fn disarm_locked(&self, state: &mut WindowState) -> bool {
        Self::cancel_timer(state);
        match state.take_batch() {
            Some(batch) => {
                log::debug!("Window disarmed, epoch {} flushed early ({} tags)", batch.epoch, batch.len());
                self.send(WindowMessage::Batch(batch));
                true
            }
            None => false,
        }
    }

    /// Cancel the pending timer and hand its batch to the processor, once
    pub fn disarm(&self) -> bool {
        let mut state = self.lock();
        self.disarm_locked(&mut state)
    }

    /// Disarm, then tell the processor no more batches follow
    ///
    /// Later detections are refused. Closing twice sends one `Shutdown`.
    pub fn close(&self) {
        let mut state = self.lock();
        if state.closed {
            return;
        }
        self.disarm_locked(&mut state);
        state.closed = true;
        self.send(WindowMessage::Shutdown);
    }

    pub fn is_collecting(&self) -> bool {
        self.lock().timer.is_some()
    }

    /// Tags waiting in the current epoch
    pub fn pending(&self) -> usize {
        self.lock().epoch.detections.len()
    }

    /// Identifiers inserted across all epochs of this window
    ///
    /// An EPC seen in two epochs counts twice; dedup is per epoch only.
    pub fn unique_seen(&self) -> u64 {
        self.lock().unique_seen
    }
}
