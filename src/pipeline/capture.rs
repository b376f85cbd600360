use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::display;
use crate::frame::Frame;
use crate::ingest::{open_first_available, FrameSource, SourceFactory};

use super::shared::SharedState;
use super::PipelineSettings;

/// Owns the camera. Reads frames, publishes them with a fresh timestamp, and
/// renders the display frame from whatever detection was last published.
pub(crate) struct CaptureLoop {
    pub factory: Box<dyn SourceFactory>,
    pub devices: Vec<String>,
    pub settings: PipelineSettings,
    pub shared: Arc<SharedState>,
    pub shutdown: Arc<AtomicBool>,
}

impl CaptureLoop {
    pub fn run(self) {
        let mut source: Option<Box<dyn FrameSource>> = None;
        let mut device_index = 0usize;
        let mut consecutive_failures = 0u32;
        let mut backoff = self.settings.reopen_backoff();

        while !self.shutdown.load(Ordering::SeqCst) {
            let Some(active) = source.as_mut() else {
                match open_first_available(self.factory.as_ref(), &self.devices, device_index) {
                    Ok((index, opened)) => {
                        device_index = index;
                        self.shared.set_device(opened.name(), opened.interrupt_handle());
                        self.shared.mark_fresh();
                        backoff = self.settings.reopen_backoff();
                        source = Some(opened);
                    }
                    Err(err) => {
                        log::warn!("CaptureLoop: {:#}; retrying in {:?}", err, backoff);
                        self.sleep(backoff);
                        backoff = (backoff * 2).min(self.settings.reopen_backoff_max());
                    }
                }
                continue;
            };

            match active.read_frame() {
                Ok(frame) => {
                    consecutive_failures = 0;
                    self.publish(frame);
                }
                Err(err) => {
                    consecutive_failures += 1;
                    self.shared.record_read_failure();
                    let interrupted = active.interrupt_handle().is_triggered();
                    if self.shutdown.load(Ordering::SeqCst) {
                        break;
                    }
                    if interrupted || consecutive_failures >= self.settings.reopen_failure_threshold {
                        log::warn!(
                            "CaptureLoop: reopening after {} consecutive failures on {} (interrupted: {}): {:#}",
                            consecutive_failures,
                            active.name(),
                            interrupted,
                            err
                        );
                        active.release();
                        self.shared.clear_device();
                        source = None;
                        consecutive_failures = 0;
                        // Start the next round at the following candidate.
                        device_index = (device_index + 1) % self.devices.len().max(1);
                        self.sleep(backoff);
                    } else {
                        log::debug!(
                            "CaptureLoop: read failure {} on {}: {:#}",
                            consecutive_failures,
                            active.name(),
                            err
                        );
                        self.sleep(self.settings.read_retry());
                    }
                }
            }
        }

        if let Some(mut active) = source {
            active.release();
        }
        self.shared.clear_device();
        log::info!("CaptureLoop: stopped");
    }

    fn publish(&self, frame: Frame) {
        let frame = Arc::new(frame);
        self.shared.publish_frame(frame.clone());
        if !self.settings.render_display {
            return;
        }
        let snapshot = self.shared.latest_detections();
        match display::render_jpeg(&frame, snapshot.primary.as_ref(), self.settings.jpeg_quality) {
            Ok(jpeg) => self.shared.publish_display(jpeg),
            Err(err) => log::debug!("CaptureLoop: display render failed: {:#}", err),
        }
    }

    fn sleep(&self, duration: Duration) {
        let deadline = Instant::now() + duration;
        while !self.shutdown.load(Ordering::SeqCst) {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            std::thread::sleep((deadline - now).min(Duration::from_millis(10)));
        }
    }
}
