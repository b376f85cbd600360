//! State shared by the pipeline threads and their consumers.
//!
//! One mutex per concern; every accessor copies or clones an `Arc` out and drops
//! the guard before returning, so no caller ever holds two locks or blocks a
//! writer for longer than a pointer swap.

use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use crate::detect::Detection;
use crate::frame::Frame;
use crate::ingest::InterruptHandle;

/// Everything one inference cycle published.
#[derive(Clone, Debug)]
pub struct DetectionSnapshot {
    pub cycle: u64,
    /// Sequence number of the frame the cycle ran on (0 before the first cycle).
    pub frame_seq: u64,
    pub primary: Option<Detection>,
    pub candidates: Vec<Detection>,
    pub published_at: Instant,
}

impl DetectionSnapshot {
    pub fn empty() -> Self {
        Self {
            cycle: 0,
            frame_seq: 0,
            primary: None,
            candidates: Vec::new(),
            published_at: Instant::now(),
        }
    }

    pub fn with_primary(cycle: u64, primary: Option<Detection>) -> Self {
        Self {
            cycle,
            candidates: primary.iter().cloned().collect(),
            primary,
            ..Self::empty()
        }
    }
}

/// Presentation-layer view of the latest detections.
#[derive(Clone, Debug, Serialize)]
#[serde(tag = "status", content = "data", rename_all = "snake_case")]
pub enum DetectionQuery {
    Found(Vec<Detection>),
    Searching,
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct PipelineStats {
    pub frames_captured: u64,
    pub read_failures: u64,
    pub device_opens: u64,
    pub watchdog_trips: u64,
    pub inference_cycles: u64,
    pub active_device: Option<String>,
}

struct FrameSlot {
    latest: Option<Arc<Frame>>,
    fresh_at: Instant,
}

/// Shared pipeline state, injected into every thread that needs it.
pub struct SharedState {
    frame: Mutex<FrameSlot>,
    detections: Mutex<Arc<DetectionSnapshot>>,
    display: Mutex<Option<Arc<Vec<u8>>>>,
    device: Mutex<Option<InterruptHandle>>,
    stats: Mutex<PipelineStats>,
}

fn guard<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    // Slots only ever hold whole values, so a poisoned guard still holds a valid one.
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl SharedState {
    pub fn new() -> Self {
        Self {
            frame: Mutex::new(FrameSlot {
                latest: None,
                fresh_at: Instant::now(),
            }),
            detections: Mutex::new(Arc::new(DetectionSnapshot::empty())),
            display: Mutex::new(None),
            device: Mutex::new(None),
            stats: Mutex::new(PipelineStats::default()),
        }
    }

    // -- frame -------------------------------------------------------------

    pub fn publish_frame(&self, frame: Arc<Frame>) {
        {
            let mut slot = guard(&self.frame);
            slot.latest = Some(frame);
            slot.fresh_at = Instant::now();
        }
        guard(&self.stats).frames_captured += 1;
    }

    pub fn latest_frame(&self) -> Option<Arc<Frame>> {
        guard(&self.frame).latest.clone()
    }

    /// Restart the freshness clock without publishing a frame (device just opened).
    pub fn mark_fresh(&self) {
        guard(&self.frame).fresh_at = Instant::now();
    }

    pub fn freshness_age(&self) -> Duration {
        guard(&self.frame).fresh_at.elapsed()
    }

    // -- detections --------------------------------------------------------

    pub fn publish_detections(&self, snapshot: DetectionSnapshot) {
        *guard(&self.detections) = Arc::new(snapshot);
        guard(&self.stats).inference_cycles += 1;
    }

    pub fn latest_detections(&self) -> Arc<DetectionSnapshot> {
        guard(&self.detections).clone()
    }

    pub fn detection_query(&self) -> DetectionQuery {
        let snapshot = self.latest_detections();
        if snapshot.candidates.is_empty() {
            match &snapshot.primary {
                Some(primary) => DetectionQuery::Found(vec![primary.clone()]),
                None => DetectionQuery::Searching,
            }
        } else {
            DetectionQuery::Found(snapshot.candidates.clone())
        }
    }

    // -- display -----------------------------------------------------------

    pub fn publish_display(&self, jpeg: Vec<u8>) {
        *guard(&self.display) = Some(Arc::new(jpeg));
    }

    pub fn latest_display(&self) -> Option<Arc<Vec<u8>>> {
        guard(&self.display).clone()
    }

    // -- device ------------------------------------------------------------

    pub fn set_device(&self, name: &str, interrupt: InterruptHandle) {
        *guard(&self.device) = Some(interrupt);
        let mut stats = guard(&self.stats);
        stats.device_opens += 1;
        stats.active_device = Some(name.to_string());
    }

    pub fn clear_device(&self) {
        *guard(&self.device) = None;
        guard(&self.stats).active_device = None;
    }

    /// Interrupt the current device's read. Returns false when no device is open.
    pub fn interrupt_device(&self) -> bool {
        match guard(&self.device).as_ref() {
            Some(handle) => {
                handle.trigger();
                true
            }
            None => false,
        }
    }

    // -- stats -------------------------------------------------------------

    pub fn record_read_failure(&self) {
        guard(&self.stats).read_failures += 1;
    }

    pub fn record_watchdog_trip(&self) {
        guard(&self.stats).watchdog_trips += 1;
    }

    pub fn stats(&self) -> PipelineStats {
        guard(&self.stats).clone()
    }
}

impl Default for SharedState {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::{BBox, Candidate, DetectionSource};
    use anyhow::Result;

    #[test]
    fn query_reports_searching_until_something_is_found() {
        let shared = SharedState::new();
        assert!(matches!(shared.detection_query(), DetectionQuery::Searching));

        let detection = Detection::from_candidate(
            &Candidate::object("cup", 0.9, BBox::new(0.0, 0.0, 5.0, 5.0)),
            10,
            10,
            None,
            DetectionSource::Detector,
        );
        shared.publish_detections(DetectionSnapshot::with_primary(1, Some(detection)));
        match shared.detection_query() {
            DetectionQuery::Found(list) => assert_eq!(list.len(), 1),
            DetectionQuery::Searching => panic!("expected a detection"),
        }
        let json = serde_json::to_value(shared.detection_query()).unwrap_or_default();
        assert_eq!(json["status"], "found");
        assert_eq!(json["data"][0]["label"], "cup");
    }

    #[test]
    fn publishing_a_frame_refreshes_freshness() -> Result<()> {
        let shared = SharedState::new();
        std::thread::sleep(Duration::from_millis(20));
        assert!(shared.freshness_age() >= Duration::from_millis(20));
        shared.publish_frame(Arc::new(Frame::filled(2, 2, [0, 0, 0])?));
        assert!(shared.freshness_age() < Duration::from_millis(20));
        assert_eq!(shared.stats().frames_captured, 1);
        Ok(())
    }

    #[test]
    fn interrupt_reaches_the_registered_device() {
        let shared = SharedState::new();
        assert!(!shared.interrupt_device());
        let handle = InterruptHandle::new();
        shared.set_device("stub://x", handle.clone());
        assert!(shared.interrupt_device());
        assert!(handle.is_triggered());
    }
}
