//! Concurrent capture pipeline.
//!
//! Three threads share one [`SharedState`]:
//! - capture owns the camera and publishes frames plus the display JPEG,
//! - inference runs perception on the newest frame at its own cadence,
//! - the watchdog force-releases a device whose frames stopped arriving.
//!
//! Consumers (the servoing controller, the API) only ever read snapshots.

mod capture;
mod inference;
mod shared;
mod watchdog;

use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Sender};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crate::detect::HybridPerception;
use crate::ingest::SourceFactory;

pub use shared::{DetectionQuery, DetectionSnapshot, PipelineStats, SharedState};
pub use watchdog::StalenessMonitor;

#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PipelineSettings {
    /// Consecutive read failures before the device is released and reopened.
    pub reopen_failure_threshold: u32,
    pub reopen_backoff_ms: u64,
    pub reopen_backoff_max_ms: u64,
    /// Pause between reads after a single failure.
    pub read_retry_ms: u64,
    pub inference_interval_ms: u64,
    pub watchdog_stale_ms: u64,
    pub watchdog_poll_ms: u64,
    pub render_display: bool,
    pub jpeg_quality: u8,
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            reopen_failure_threshold: 5,
            reopen_backoff_ms: 200,
            reopen_backoff_max_ms: 5_000,
            read_retry_ms: 10,
            inference_interval_ms: 50,
            watchdog_stale_ms: 5_000,
            watchdog_poll_ms: 250,
            render_display: true,
            jpeg_quality: 80,
        }
    }
}

impl PipelineSettings {
    pub fn reopen_backoff(&self) -> Duration {
        Duration::from_millis(self.reopen_backoff_ms)
    }

    pub fn reopen_backoff_max(&self) -> Duration {
        Duration::from_millis(self.reopen_backoff_max_ms.max(self.reopen_backoff_ms))
    }

    pub fn read_retry(&self) -> Duration {
        Duration::from_millis(self.read_retry_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.reopen_failure_threshold == 0 {
            return Err(anyhow!("pipeline.reopen_failure_threshold must be at least 1"));
        }
        if self.watchdog_stale_ms == 0 || self.watchdog_poll_ms == 0 {
            return Err(anyhow!("pipeline watchdog intervals must be non-zero"));
        }
        if self.inference_interval_ms == 0 {
            return Err(anyhow!("pipeline.inference_interval_ms must be non-zero"));
        }
        if !(1..=100).contains(&self.jpeg_quality) {
            return Err(anyhow!("pipeline.jpeg_quality must be within 1..=100"));
        }
        Ok(())
    }
}

/// Mode changes for the inference loop.
#[derive(Clone, Debug, PartialEq)]
pub enum PipelineCommand {
    SetTarget(Option<String>),
    SetPaused(bool),
}

/// Cloneable sender for [`PipelineCommand`]s.
#[derive(Clone, Debug)]
pub struct PipelineControl {
    tx: Sender<PipelineCommand>,
}

impl PipelineControl {
    pub fn send(&self, command: PipelineCommand) -> Result<()> {
        self.tx
            .send(command)
            .map_err(|_| anyhow!("inference loop is not running"))
    }

    pub fn set_target(&self, target: Option<&str>) -> Result<()> {
        self.send(PipelineCommand::SetTarget(target.map(str::to_string)))
    }

    pub fn set_paused(&self, paused: bool) -> Result<()> {
        self.send(PipelineCommand::SetPaused(paused))
    }
}

/// Where the servoing controller reads detections from.
pub trait DetectionFeed: Send {
    fn latest(&mut self) -> Arc<DetectionSnapshot>;

    /// Ask perception to focus on `target` (None clears the filter).
    fn request_target(&mut self, target: Option<&str>);
}

/// [`DetectionFeed`] backed by a running pipeline.
pub struct PipelineFeed {
    shared: Arc<SharedState>,
    control: PipelineControl,
}

impl PipelineFeed {
    pub fn new(shared: Arc<SharedState>, control: PipelineControl) -> Self {
        Self { shared, control }
    }
}

impl DetectionFeed for PipelineFeed {
    fn latest(&mut self) -> Arc<DetectionSnapshot> {
        self.shared.latest_detections()
    }

    fn request_target(&mut self, target: Option<&str>) {
        if let Err(err) = self.control.set_target(target) {
            log::warn!("PipelineFeed: cannot change target to {:?}: {:#}", target, err);
        }
    }
}

pub struct CapturePipeline;

impl CapturePipeline {
    pub fn spawn(
        settings: PipelineSettings,
        devices: Vec<String>,
        factory: Box<dyn SourceFactory>,
        perception: HybridPerception,
        shared: Arc<SharedState>,
    ) -> Result<PipelineHandle> {
        settings.validate()?;
        if devices.is_empty() {
            return Err(anyhow!("pipeline needs at least one camera device"));
        }
        let shutdown = Arc::new(AtomicBool::new(false));
        let (tx, rx) = mpsc::channel();

        let capture = capture::CaptureLoop {
            factory,
            devices,
            settings: settings.clone(),
            shared: shared.clone(),
            shutdown: shutdown.clone(),
        };
        let inference = inference::InferenceLoop {
            perception,
            commands: rx,
            shared: shared.clone(),
            shutdown: shutdown.clone(),
            interval: Duration::from_millis(settings.inference_interval_ms),
        };

        let mut threads = Vec::new();
        threads.push(
            std::thread::Builder::new()
                .name("capture".into())
                .spawn(move || capture.run())?,
        );
        threads.push(
            std::thread::Builder::new()
                .name("inference".into())
                .spawn(move || inference.run())?,
        );
        let watchdog_shared = shared.clone();
        let watchdog_shutdown = shutdown.clone();
        let stale = Duration::from_millis(settings.watchdog_stale_ms);
        let poll = Duration::from_millis(settings.watchdog_poll_ms);
        threads.push(
            std::thread::Builder::new()
                .name("watchdog".into())
                .spawn(move || {
                    watchdog::run_watchdog(watchdog_shared, stale, poll, watchdog_shutdown)
                })?,
        );
        log::info!("CapturePipeline: started");

        Ok(PipelineHandle {
            shared,
            control: PipelineControl { tx },
            shutdown,
            threads,
        })
    }
}

pub struct PipelineHandle {
    shared: Arc<SharedState>,
    control: PipelineControl,
    shutdown: Arc<AtomicBool>,
    threads: Vec<JoinHandle<()>>,
}

impl PipelineHandle {
    pub fn shared(&self) -> Arc<SharedState> {
        self.shared.clone()
    }

    pub fn control(&self) -> PipelineControl {
        self.control.clone()
    }

    pub fn feed(&self) -> PipelineFeed {
        PipelineFeed::new(self.shared(), self.control())
    }

    /// Stop all three threads. Safe to call more than once.
    pub fn stop(&mut self) -> Result<()> {
        self.shutdown.store(true, Ordering::SeqCst);
        // A capture thread blocked in a read only notices shutdown once interrupted.
        self.shared.interrupt_device();
        let mut panicked = Vec::new();
        for join in self.threads.drain(..) {
            let name = join.thread().name().unwrap_or("pipeline").to_string();
            if join.join().is_err() {
                panicked.push(name);
            }
        }
        if panicked.is_empty() {
            Ok(())
        } else {
            Err(anyhow!("pipeline threads panicked: {}", panicked.join(", ")))
        }
    }
}

impl Drop for PipelineHandle {
    fn drop(&mut self) {
        if let Err(err) = self.stop() {
            log::error!("CapturePipeline: {:#}", err);
        }
    }
}
