//! Time utilities for the update loops

use std::time::Instant;

/// Snapshot rate used when nothing is configured
pub const DEFAULT_UPDATE_FPS: u32 = 30;
/// Fixed simulation rate used when nothing is configured
pub const DEFAULT_PHYSICS_FPS: u32 = 60;

/// Seconds per frame at `fps`
pub fn interval_for(fps: u32) -> f32 {
    1.0 / fps.max(1) as f32
}

/// Fixed-interval trigger fed with variable frame times.
///
/// The accumulator keeps the remainder (fmod) when it fires instead of
/// resetting, so the long-run rate matches the interval.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct UpdateTimer {
    interval: f32,
    accumulator: f32,
}

impl UpdateTimer {
    pub fn new(interval: f32) -> Self {
        Self {
            interval,
            accumulator: 0.0,
        }
    }

    pub fn from_fps(fps: u32) -> Self {
        Self::new(interval_for(fps))
    }

    /// Adds `dt` seconds and reports whether the interval elapsed
    pub fn advance(&mut self, dt: f32) -> bool {
        if self.interval <= 0.0 {
            return true;
        }
        self.accumulator += dt;
        if self.accumulator >= self.interval {
            self.accumulator %= self.interval;
            true
        } else {
            false
        }
    }

    pub fn interval(&self) -> f32 {
        self.interval
    }

    pub fn accumulator(&self) -> f32 {
        self.accumulator
    }
}

/// A simple timer for measuring durations
#[derive(Debug, Clone)]
pub struct Timer {
    start: Instant,
}

impl Timer {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    pub fn elapsed_ms(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }
}

impl Default for Timer {
    fn default() -> Self {
        Self::new()
    }
}
