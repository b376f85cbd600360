//! Frame snapshots.
//!
//! A `Frame` is immutable once constructed. The capture loop wraps each frame in an
//! `Arc` before publishing it, so readers hold their own reference and never observe
//! a buffer that is being written.

use anyhow::{anyhow, Result};
use std::time::{Duration, Instant};

/// RGB24 frame with a monotonic capture timestamp.
#[derive(Clone)]
pub struct Frame {
    data: Vec<u8>,
    pub width: u32,
    pub height: u32,
    /// Per-source sequence number, starting at 1.
    pub seq: u64,
    pub captured_at: Instant,
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("seq", &self.seq)
            .finish()
    }
}

impl Frame {
    /// Build a frame captured now. Fails when the buffer is not `width * height * 3` bytes.
    pub fn new(data: Vec<u8>, width: u32, height: u32, seq: u64) -> Result<Self> {
        Self::captured(data, width, height, seq, Instant::now())
    }

    pub fn captured(
        data: Vec<u8>,
        width: u32,
        height: u32,
        seq: u64,
        captured_at: Instant,
    ) -> Result<Self> {
        let expected = rgb_len(width, height)?;
        if data.len() != expected {
            return Err(anyhow!(
                "RGB frame length mismatch: expected {}, got {}",
                expected,
                data.len()
            ));
        }
        Ok(Self {
            data,
            width,
            height,
            seq,
            captured_at,
        })
    }

    /// Solid-color frame, mostly for tests and placeholders.
    pub fn filled(width: u32, height: u32, rgb: [u8; 3]) -> Result<Self> {
        let len = rgb_len(width, height)?;
        let mut data = Vec::with_capacity(len);
        for _ in 0..(len / 3) {
            data.extend_from_slice(&rgb);
        }
        Self::new(data, width, height, 0)
    }

    pub fn pixels(&self) -> &[u8] {
        &self.data
    }

    /// RGB triple at (x, y). Coordinates outside the frame are clamped to the edge.
    pub fn rgb_at(&self, x: i64, y: i64) -> [u8; 3] {
        let x = x.clamp(0, self.width as i64 - 1) as usize;
        let y = y.clamp(0, self.height as i64 - 1) as usize;
        let idx = (y * self.width as usize + x) * 3;
        [self.data[idx], self.data[idx + 1], self.data[idx + 2]]
    }

    /// Luma at (x, y) using BT.601 weights.
    pub fn luma_at(&self, x: i64, y: i64) -> f32 {
        let [r, g, b] = self.rgb_at(x, y);
        0.299 * r as f32 + 0.587 * g as f32 + 0.114 * b as f32
    }

    pub fn age(&self) -> Duration {
        self.captured_at.elapsed()
    }

    pub fn into_pixels(self) -> Vec<u8> {
        self.data
    }
}

pub(crate) fn rgb_len(width: u32, height: u32) -> Result<usize> {
    if width == 0 || height == 0 {
        return Err(anyhow!("frame dimensions must be non-zero"));
    }
    width
        .checked_mul(height)
        .and_then(|v| v.checked_mul(3))
        .map(|v| v as usize)
        .ok_or_else(|| anyhow!("frame dimensions overflow"))
}
