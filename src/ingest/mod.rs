//! Camera frame sources.
//!
//! This module provides the sources the capture loop can own:
//! - Synthetic scenes (`stub://...`) for simulation and tests
//! - USB/V4L2 devices (feature: camera-v4l2)
//!
//! Every source exposes an [`InterruptHandle`]. Triggering it makes the current or
//! next `read_frame` fail fast so the owner takes its reopen path; the watchdog uses
//! this to break out of a stuck read without touching the device itself.

#[cfg(feature = "camera-v4l2")]
mod normalize;
pub mod synthetic;
#[cfg(feature = "camera-v4l2")]
pub mod v4l2;

use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::frame::Frame;

pub use synthetic::{SyntheticConfig, SyntheticSource};
#[cfg(feature = "camera-v4l2")]
pub use v4l2::V4l2Source;

/// A camera the capture loop can read from.
pub trait FrameSource: Send {
    /// Device identifier used in logs.
    fn name(&self) -> &str;

    /// Acquire the device. Calling `open` on an open source reopens it.
    fn open(&mut self) -> Result<()>;

    /// Block until the next frame is available.
    fn read_frame(&mut self) -> Result<Frame>;

    /// Drop the device handle. Safe to call more than once.
    fn release(&mut self);

    /// Handle that interrupts reads on this source.
    fn interrupt_handle(&self) -> InterruptHandle;
}

/// Shared flag used to break a source out of a blocking read.
#[derive(Clone, Debug, Default)]
pub struct InterruptHandle(Arc<AtomicBool>);

impl InterruptHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_triggered(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn clear(&self) {
        self.0.store(false, Ordering::SeqCst);
    }

    /// Run one device read that gives up after a bounded wait.
    ///
    /// A triggered handle fails the read without touching the device, and a read
    /// that returns while the handle was raised is discarded. A read that times
    /// out triggers the handle itself, so the owner takes its reopen path.
    pub fn bounded_read<T>(
        &self,
        device: &str,
        read: impl FnOnce() -> io::Result<T>,
    ) -> Result<T> {
        if self.is_triggered() {
            return Err(anyhow!("read interrupted on {}", device));
        }
        match read() {
            Ok(_) if self.is_triggered() => Err(anyhow!("read interrupted on {}", device)),
            Ok(value) => Ok(value),
            Err(err) if err.kind() == io::ErrorKind::TimedOut => {
                self.trigger();
                Err(anyhow!("no frame from {} within the read timeout", device))
            }
            Err(err) => Err(anyhow::Error::new(err).context(format!("read from {}", device))),
        }
    }
}

/// Capture geometry requested from every source.
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct CameraSettings {
    /// Candidate devices, tried in order on every reopen.
    pub devices: Vec<String>,
    pub width: u32,
    pub height: u32,
    pub target_fps: u32,
    /// Longest a hardware read may block before the source releases the device.
    pub read_timeout_ms: u64,
}

impl Default for CameraSettings {
    fn default() -> Self {
        Self {
            devices: vec!["stub://camera".to_string()],
            width: 640,
            height: 480,
            target_fps: 30,
            read_timeout_ms: 1_000,
        }
    }
}

/// Constructs and opens sources by device string.
pub trait SourceFactory: Send {
    fn open(&self, device: &str) -> Result<Box<dyn FrameSource>>;
}

/// Maps `stub://` devices to [`SyntheticSource`] and device paths to V4L2.
#[derive(Clone, Debug)]
pub struct DefaultSourceFactory {
    settings: CameraSettings,
}

impl DefaultSourceFactory {
    pub fn new(settings: CameraSettings) -> Self {
        Self { settings }
    }
}

impl SourceFactory for DefaultSourceFactory {
    fn open(&self, device: &str) -> Result<Box<dyn FrameSource>> {
        let mut source: Box<dyn FrameSource> = if device.starts_with("stub://") {
            Box::new(SyntheticSource::new(SyntheticConfig::from_device(
                device,
                &self.settings,
            )?))
        } else {
            open_device_source(device, &self.settings)?
        };
        source.open()?;
        Ok(source)
    }
}

#[cfg(feature = "camera-v4l2")]
fn open_device_source(device: &str, settings: &CameraSettings) -> Result<Box<dyn FrameSource>> {
    Ok(Box::new(V4l2Source::new(v4l2::V4l2Config {
        device: device.to_string(),
        target_fps: settings.target_fps,
        width: settings.width,
        height: settings.height,
        read_timeout: std::time::Duration::from_millis(settings.read_timeout_ms),
    })))
}

#[cfg(not(feature = "camera-v4l2"))]
fn open_device_source(device: &str, _settings: &CameraSettings) -> Result<Box<dyn FrameSource>> {
    Err(anyhow!(
        "device {} requires the camera-v4l2 feature",
        device
    ))
}

/// Try each device starting at `start` (wrapping) and return the first that opens.
pub fn open_first_available(
    factory: &dyn SourceFactory,
    devices: &[String],
    start: usize,
) -> Result<(usize, Box<dyn FrameSource>)> {
    if devices.is_empty() {
        return Err(anyhow!("no camera devices configured"));
    }
    let mut errors = Vec::new();
    for offset in 0..devices.len() {
        let index = (start + offset) % devices.len();
        let device = &devices[index];
        match factory.open(device) {
            Ok(source) => return Ok((index, source)),
            Err(err) => {
                log::warn!("camera: failed to open {}: {:#}", device, err);
                errors.push(format!("{}: {}", device, err));
            }
        }
    }
    Err(anyhow!(
        "no camera device could be opened ({})",
        errors.join("; ")
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn factory() -> DefaultSourceFactory {
        DefaultSourceFactory::new(CameraSettings {
            width: 64,
            height: 48,
            target_fps: 0,
            ..CameraSettings::default()
        })
    }

    #[test]
    fn falls_through_to_next_device() -> Result<()> {
        let devices = vec![
            "stub://dead?fail_open=1".to_string(),
            "stub://alive".to_string(),
        ];
        let (index, mut source) = open_first_available(&factory(), &devices, 0)?;
        assert_eq!(index, 1);
        assert_eq!(source.name(), "stub://alive");
        let frame = source.read_frame()?;
        assert_eq!((frame.width, frame.height), (64, 48));
        Ok(())
    }

    #[test]
    fn reports_error_when_nothing_opens() {
        let devices = vec!["stub://a?fail_open=1".to_string()];
        assert!(open_first_available(&factory(), &devices, 3).is_err());
        assert!(open_first_available(&factory(), &[], 0).is_err());
    }

    #[test]
    fn timed_out_read_raises_the_interrupt() {
        let handle = InterruptHandle::new();
        let result: Result<u8> =
            handle.bounded_read("cam", || Err(io::Error::new(io::ErrorKind::TimedOut, "poll")));
        assert!(result.is_err());
        assert!(handle.is_triggered());

        let mut touched = false;
        let result = handle.bounded_read("cam", || {
            touched = true;
            Ok(1u8)
        });
        assert!(result.is_err());
        assert!(!touched);
    }

    #[test]
    fn bounded_read_passes_frames_and_other_errors_through() -> Result<()> {
        let handle = InterruptHandle::new();
        assert_eq!(handle.bounded_read("cam", || Ok(7u8))?, 7);

        let result: Result<u8> =
            handle.bounded_read("cam", || Err(io::Error::new(io::ErrorKind::Other, "EIO")));
        assert!(result.is_err());
        assert!(!handle.is_triggered());

        let raised = handle.clone();
        let result = handle.bounded_read("cam", || {
            raised.trigger();
            Ok(7u8)
        });
        assert!(result.is_err());
        Ok(())
    }

    #[test]
    fn interrupt_handle_is_shared() {
        let handle = InterruptHandle::new();
        let clone = handle.clone();
        clone.trigger();
        assert!(handle.is_triggered());
        handle.clear();
        assert!(!clone.is_triggered());
    }
}
