//! V4L2 camera source.
//!
//! Requests RGB3 from the driver and falls back to YUYV or NV12 with in-process
//! conversion when the device refuses RGB. Every dequeue is bounded by a poll
//! timeout, so a stalled device or a raised interrupt releases the stream within
//! `read_timeout` and the capture loop reopens it.

use anyhow::{anyhow, Context, Result};
use ouroboros::self_referencing;
use std::time::Duration;

use super::normalize::{normalize_to_rgb, PixelFormat};
use super::{FrameSource, InterruptHandle};
use crate::frame::Frame;

/// Configuration for a V4L2 source.
#[derive(Clone, Debug)]
pub struct V4l2Config {
    /// Device path (e.g., "/dev/video0")
    pub device: String,
    pub target_fps: u32,
    pub width: u32,
    pub height: u32,
    /// Longest a single dequeue may block.
    pub read_timeout: Duration,
}

pub struct V4l2Source {
    config: V4l2Config,
    state: Option<DeviceState>,
    interrupt: InterruptHandle,
    format: PixelFormat,
    active_width: u32,
    active_height: u32,
    frame_count: u64,
}

#[self_referencing]
struct DeviceState {
    device: v4l::Device,
    #[borrows(mut device)]
    #[covariant]
    stream: v4l::prelude::MmapStream<'this, v4l::Device>,
}

impl V4l2Source {
    pub fn new(config: V4l2Config) -> Self {
        Self {
            active_width: config.width,
            active_height: config.height,
            config,
            state: None,
            interrupt: InterruptHandle::new(),
            format: PixelFormat::Rgb24,
            frame_count: 0,
        }
    }
}

impl FrameSource for V4l2Source {
    fn name(&self) -> &str {
        &self.config.device
    }

    fn open(&mut self) -> Result<()> {
        use v4l::buffer::Type;
        use v4l::video::Capture;

        self.release();
        let mut device = v4l::Device::with_path(&self.config.device)
            .with_context(|| format!("open v4l2 device {}", self.config.device))?;
        let mut format = device.format().context("read v4l2 format")?;
        format.width = self.config.width;
        format.height = self.config.height;
        format.fourcc = v4l::FourCC::new(b"RGB3");

        let format = match device.set_format(&format) {
            Ok(format) => format,
            Err(err) => {
                log::warn!(
                    "V4l2Source: failed to set RGB3 on {}: {}",
                    self.config.device,
                    err
                );
                device
                    .format()
                    .context("read v4l2 format after set failure")?
            }
        };
        self.format = match &format.fourcc.repr {
            b"RGB3" => PixelFormat::Rgb24,
            b"YUYV" => PixelFormat::Yuyv,
            b"NV12" => PixelFormat::Nv12,
            other => {
                return Err(anyhow!(
                    "v4l2 device {} negotiated unsupported format {}",
                    self.config.device,
                    String::from_utf8_lossy(other)
                ))
            }
        };

        if self.config.target_fps > 0 {
            let params = v4l::video::capture::Parameters::with_fps(self.config.target_fps);
            if let Err(err) = device.set_params(&params) {
                log::warn!(
                    "V4l2Source: failed to set fps on {}: {}",
                    self.config.device,
                    err
                );
            }
        }

        self.active_width = format.width;
        self.active_height = format.height;
        let read_timeout = self.config.read_timeout;

        let state = DeviceStateBuilder {
            device,
            stream_builder: |device| {
                let mut stream =
                    v4l::prelude::MmapStream::with_buffers(device, Type::VideoCapture, 4)
                        .context("create v4l2 buffer stream")?;
                stream.set_timeout(read_timeout);
                Ok(stream)
            },
        }
        .try_build()?;
        self.state = Some(state);
        self.interrupt.clear();

        log::info!(
            "V4l2Source: opened {} ({}x{} {:?})",
            self.config.device,
            self.active_width,
            self.active_height,
            self.format
        );
        Ok(())
    }

    fn read_frame(&mut self) -> Result<Frame> {
        use v4l::io::traits::CaptureStream;

        let state = self.state.as_mut().context("v4l2 device not open")?;
        let read = self.interrupt.bounded_read(&self.config.device, || {
            state.with_mut(|fields| fields.stream.next().map(|(buf, _meta)| buf.to_vec()))
        });
        let raw = match read {
            Ok(raw) => raw,
            Err(err) => {
                // A timed-out dequeue leaves its buffer queued; the stream is only
                // usable again after a reopen.
                if self.interrupt.is_triggered() {
                    self.release();
                }
                return Err(err);
            }
        };

        let rgb = normalize_to_rgb(&raw, self.active_width, self.active_height, self.format)?;
        self.frame_count += 1;
        Frame::new(rgb, self.active_width, self.active_height, self.frame_count)
    }

    fn release(&mut self) {
        if self.state.take().is_some() {
            log::info!("V4l2Source: released {}", self.config.device);
        }
    }

    fn interrupt_handle(&self) -> InterruptHandle {
        self.interrupt.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_device_fails_to_open() {
        let mut source = V4l2Source::new(V4l2Config {
            device: "/dev/video-does-not-exist".to_string(),
            target_fps: 10,
            width: 640,
            height: 480,
            read_timeout: Duration::from_millis(500),
        });
        assert!(source.open().is_err());
        assert!(source.read_frame().is_err());
    }
}
