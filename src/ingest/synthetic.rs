//! Synthetic camera (`stub://name?key=value`).
//!
//! Renders a noisy gray background with a solid colored square drifting left and
//! right, which is enough for the color detector and the tracker to lock on.
//!
//! Query keys:
//! - `color=red|green|blue|yellow` target color (default red)
//! - `size=<px>` square edge length
//! - `stall_after=<n>` block forever after `n` frames until interrupted
//! - `fail_open=1` refuse to open

use anyhow::{anyhow, Result};
use rand::Rng;
use std::time::{Duration, Instant};

use super::{CameraSettings, FrameSource, InterruptHandle};
use crate::frame::Frame;

const POLL_SLICE: Duration = Duration::from_millis(5);

#[derive(Clone, Debug)]
pub struct SyntheticConfig {
    pub device: String,
    pub width: u32,
    pub height: u32,
    pub target_fps: u32,
    pub target_rgb: [u8; 3],
    pub square_px: u32,
    pub stall_after: Option<u64>,
    pub fail_open: bool,
}

impl SyntheticConfig {
    pub fn new(device: &str, width: u32, height: u32) -> Self {
        Self {
            device: device.to_string(),
            width,
            height,
            target_fps: 0,
            target_rgb: [220, 30, 30],
            square_px: (width.min(height) / 6).max(4),
            stall_after: None,
            fail_open: false,
        }
    }

    /// Parse a `stub://` device string on top of the camera geometry.
    pub fn from_device(device: &str, settings: &CameraSettings) -> Result<Self> {
        let mut cfg = Self::new(device, settings.width, settings.height);
        cfg.target_fps = settings.target_fps;
        let Some((_, query)) = device.split_once('?') else {
            return Ok(cfg);
        };
        for pair in query.split('&').filter(|p| !p.is_empty()) {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            match key {
                "color" => {
                    cfg.target_rgb = match value {
                        "red" => [220, 30, 30],
                        "green" => [40, 200, 60],
                        "blue" => [30, 60, 220],
                        "yellow" => [230, 220, 40],
                        other => return Err(anyhow!("unknown synthetic color '{}'", other)),
                    }
                }
                "size" => cfg.square_px = parse_query_number(key, value)? as u32,
                "stall_after" => cfg.stall_after = Some(parse_query_number(key, value)?),
                "fail_open" => cfg.fail_open = value == "1" || value == "true",
                other => return Err(anyhow!("unknown synthetic option '{}'", other)),
            }
        }
        Ok(cfg)
    }
}

fn parse_query_number(key: &str, value: &str) -> Result<u64> {
    value
        .parse()
        .map_err(|_| anyhow!("synthetic option '{}' must be an integer", key))
}

/// Deterministic synthetic scene with a moving colored square.
pub struct SyntheticSource {
    config: SyntheticConfig,
    interrupt: InterruptHandle,
    opened: bool,
    frame_count: u64,
    last_frame_at: Option<Instant>,
}

impl SyntheticSource {
    pub fn new(config: SyntheticConfig) -> Self {
        Self {
            config,
            interrupt: InterruptHandle::new(),
            opened: false,
            frame_count: 0,
            last_frame_at: None,
        }
    }

    /// Center of the target square for frame `n`.
    pub fn target_center(&self, n: u64) -> (f32, f32) {
        let w = self.config.width as f32;
        let h = self.config.height as f32;
        let amplitude = w / 8.0;
        (w / 2.0 + amplitude * (n as f32 * 0.05).sin(), h / 2.0)
    }

    fn render(&self, n: u64) -> Vec<u8> {
        let w = self.config.width as usize;
        let h = self.config.height as usize;
        let mut rng = rand::thread_rng();
        let mut pixels = Vec::with_capacity(w * h * 3);
        for _ in 0..(w * h) {
            let base: u8 = 110u8.saturating_add(rng.gen_range(0..8));
            pixels.extend_from_slice(&[base, base, base]);
        }

        let (cx, cy) = self.target_center(n);
        let half = self.config.square_px as f32 / 2.0;
        let x0 = (cx - half).max(0.0) as usize;
        let y0 = (cy - half).max(0.0) as usize;
        let x1 = ((cx + half) as usize).min(w);
        let y1 = ((cy + half) as usize).min(h);
        for y in y0..y1 {
            for x in x0..x1 {
                let idx = (y * w + x) * 3;
                pixels[idx..idx + 3].copy_from_slice(&self.config.target_rgb);
            }
        }
        pixels
    }

    /// Sleep for `duration` in small slices, failing as soon as the interrupt fires.
    /// A duration too large to represent waits until interrupted.
    fn wait_interruptible(&self, duration: Duration) -> Result<()> {
        let deadline = Instant::now().checked_add(duration);
        loop {
            if self.interrupt.is_triggered() {
                return Err(anyhow!("read interrupted on {}", self.config.device));
            }
            let now = Instant::now();
            let slice = match deadline {
                Some(deadline) if now >= deadline => return Ok(()),
                Some(deadline) => POLL_SLICE.min(deadline - now),
                None => POLL_SLICE,
            };
            std::thread::sleep(slice);
        }
    }

    fn frame_interval(&self) -> Duration {
        if self.config.target_fps == 0 {
            Duration::ZERO
        } else {
            Duration::from_millis(1000 / self.config.target_fps as u64)
        }
    }
}

impl FrameSource for SyntheticSource {
    fn name(&self) -> &str {
        self.config.device.split('?').next().unwrap_or(&self.config.device)
    }

    fn open(&mut self) -> Result<()> {
        if self.config.fail_open {
            return Err(anyhow!("synthetic device {} refused to open", self.name()));
        }
        self.opened = true;
        self.interrupt.clear();
        log::info!(
            "SyntheticSource: opened {} ({}x{})",
            self.name(),
            self.config.width,
            self.config.height
        );
        Ok(())
    }

    fn read_frame(&mut self) -> Result<Frame> {
        if !self.opened {
            return Err(anyhow!("synthetic device {} not open", self.name()));
        }
        if self.interrupt.is_triggered() {
            return Err(anyhow!("read interrupted on {}", self.name()));
        }
        if let Some(limit) = self.config.stall_after {
            if self.frame_count >= limit {
                // Simulates a driver read that never returns.
                self.wait_interruptible(Duration::MAX)?;
            }
        }
        if let Some(last) = self.last_frame_at {
            let interval = self.frame_interval();
            let elapsed = last.elapsed();
            if elapsed < interval {
                self.wait_interruptible(interval - elapsed)?;
            }
        }

        self.frame_count += 1;
        self.last_frame_at = Some(Instant::now());
        let pixels = self.render(self.frame_count);
        Frame::new(
            pixels,
            self.config.width,
            self.config.height,
            self.frame_count,
        )
    }

    fn release(&mut self) {
        if self.opened {
            log::info!("SyntheticSource: released {}", self.name());
        }
        self.opened = false;
    }

    fn interrupt_handle(&self) -> InterruptHandle {
        self.interrupt.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_target_square() -> Result<()> {
        let mut source = SyntheticSource::new(SyntheticConfig::new("stub://t", 120, 90));
        source.open()?;
        let frame = source.read_frame()?;
        let (cx, cy) = source.target_center(frame.seq);
        assert_eq!(frame.rgb_at(cx as i64, cy as i64), [220, 30, 30]);
        assert_ne!(frame.rgb_at(2, 2), [220, 30, 30]);
        Ok(())
    }

    #[test]
    fn stalled_read_returns_once_interrupted() -> Result<()> {
        let mut cfg = SyntheticConfig::new("stub://stall", 32, 24);
        cfg.stall_after = Some(1);
        let mut source = SyntheticSource::new(cfg);
        source.open()?;
        source.read_frame()?;

        let handle = source.interrupt_handle();
        let trigger = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(30));
            handle.trigger();
        });
        let started = Instant::now();
        assert!(source.read_frame().is_err());
        assert!(started.elapsed() >= Duration::from_millis(20));
        trigger.join().map_err(|_| anyhow!("trigger thread panicked"))?;
        Ok(())
    }

    #[test]
    fn parses_device_options() -> Result<()> {
        let settings = CameraSettings::default();
        let cfg = SyntheticConfig::from_device("stub://cam?color=blue&stall_after=7", &settings)?;
        assert_eq!(cfg.target_rgb, [30, 60, 220]);
        assert_eq!(cfg.stall_after, Some(7));
        assert!(SyntheticConfig::from_device("stub://cam?bogus=1", &settings).is_err());
        Ok(())
    }
}
