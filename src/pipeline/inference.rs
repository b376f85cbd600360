use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, TryRecvError};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::detect::HybridPerception;
use crate::frame::Frame;

use super::shared::{DetectionSnapshot, SharedState};
use super::PipelineCommand;

/// Runs perception on the newest frame at its own cadence.
///
/// Mode changes arrive as [`PipelineCommand`]s and are applied at the top of
/// each iteration, so a cycle never observes a half-applied target change.
pub(crate) struct InferenceLoop {
    pub perception: HybridPerception,
    pub commands: Receiver<PipelineCommand>,
    pub shared: Arc<SharedState>,
    pub shutdown: Arc<AtomicBool>,
    pub interval: Duration,
}

impl InferenceLoop {
    pub fn run(mut self) {
        let mut paused = false;
        let mut last: Option<Arc<Frame>> = None;
        let mut cycle = 0u64;

        while !self.shutdown.load(Ordering::SeqCst) {
            let started = Instant::now();
            if !self.drain_commands(&mut paused, &mut last) {
                break;
            }

            if !paused {
                if let Some(frame) = self.shared.latest_frame() {
                    let seen = last.as_ref().is_some_and(|prev| Arc::ptr_eq(prev, &frame));
                    if !seen {
                        last = Some(frame.clone());
                        cycle += 1;
                        let outcome = self.perception.process(&frame);
                        self.shared.publish_detections(DetectionSnapshot {
                            cycle,
                            frame_seq: frame.seq,
                            primary: outcome.primary,
                            candidates: outcome.candidates,
                            published_at: Instant::now(),
                        });
                    }
                }
            }

            let spent = started.elapsed();
            if spent < self.interval {
                std::thread::sleep(self.interval - spent);
            }
        }
        log::info!("InferenceLoop: stopped after {} cycles", cycle);
    }

    /// Apply every pending command. Returns false once all senders are gone.
    fn drain_commands(&mut self, paused: &mut bool, last: &mut Option<Arc<Frame>>) -> bool {
        loop {
            match self.commands.try_recv() {
                Ok(PipelineCommand::SetTarget(target)) => {
                    log::info!("InferenceLoop: target filter -> {:?}", target);
                    self.perception.set_target(target);
                    // Results for the previous target must not leak to readers.
                    self.shared.publish_detections(DetectionSnapshot::empty());
                    *last = None;
                }
                Ok(PipelineCommand::SetPaused(value)) => {
                    log::info!("InferenceLoop: paused = {}", value);
                    *paused = value;
                }
                Err(TryRecvError::Empty) => return true,
                Err(TryRecvError::Disconnected) => return false,
            }
        }
    }
}
