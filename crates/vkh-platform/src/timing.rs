//! Monotonic clock and frame time averaging.

use std::time::Instant;

/// Frames averaged per report.
pub const FRAME_HISTORY: u32 = 1000;

/// Milliseconds since construction.
#[derive(Debug, Clone, Copy)]
pub struct Clock {
    start: Instant,
}

impl Default for Clock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock {
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    pub fn elapsed_ms(&self) -> f64 {
        self.start.elapsed().as_secs_f64() * 1000.0
    }
}

/// Accumulates frame times and yields the mean once per window.
#[derive(Debug, Clone)]
pub struct FrameTimer {
    clock: Clock,
    frame_start: f64,
    total_ms: f64,
    samples: u32,
    window: u32,
}

impl Default for FrameTimer {
    fn default() -> Self {
        Self::with_window(FRAME_HISTORY)
    }
}

impl FrameTimer {
    /// A timer reporting every `window` frames (at least one).
    pub fn with_window(window: u32) -> Self {
        Self {
            clock: Clock::new(),
            frame_start: 0.0,
            total_ms: 0.0,
            samples: 0,
            window: window.max(1),
        }
    }

    pub fn begin_frame(&mut self) {
        self.frame_start = self.clock.elapsed_ms();
    }

    /// Close the current frame. Returns `(frame_ms, Some(average_ms))` when
    /// this frame completes a window.
    pub fn end_frame(&mut self) -> (f64, Option<f64>) {
        let frame_ms = self.clock.elapsed_ms() - self.frame_start;
        (frame_ms, self.record(frame_ms))
    }

    /// Add one sample. The accumulator resets after each reported window.
    pub fn record(&mut self, frame_ms: f64) -> Option<f64> {
        self.samples += 1;
        self.total_ms += frame_ms;

        if self.samples < self.window {
            return None;
        }

        let average = self.total_ms / f64::from(self.samples);
        self.samples = 0;
        self.total_ms = 0.0;
        Some(average)
    }

    /// Samples collected toward the next report.
    pub fn pending_samples(&self) -> u32 {
        self.samples
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn reports_once_per_window() {
        let mut timer = FrameTimer::default();
        for _ in 0..FRAME_HISTORY - 1 {
            assert_eq!(timer.record(16.0), None);
        }
        let average = timer.record(16.0).unwrap();
        assert_relative_eq!(average, 16.0);
        assert_eq!(timer.pending_samples(), 0);
    }

    #[test]
    fn average_resets_between_windows() {
        let mut timer = FrameTimer::with_window(4);
        for ms in [10.0, 20.0, 30.0] {
            assert!(timer.record(ms).is_none());
        }
        assert_relative_eq!(timer.record(40.0).unwrap(), 25.0);

        for _ in 0..3 {
            timer.record(2.0);
        }
        assert_relative_eq!(timer.record(2.0).unwrap(), 2.0);
    }

    #[test]
    fn zero_window_reports_every_frame() {
        let mut timer = FrameTimer::with_window(0);
        assert_relative_eq!(timer.record(5.0).unwrap(), 5.0);
    }

    #[test]
    fn clock_is_monotonic() {
        let clock = Clock::new();
        let a = clock.elapsed_ms();
        let b = clock.elapsed_ms();
        assert!(b >= a);
        assert!(a >= 0.0);
    }

    #[test]
    fn measured_frame_is_non_negative() {
        let mut timer = FrameTimer::with_window(1);
        timer.begin_frame();
        let (frame_ms, average) = timer.end_frame();
        assert!(frame_ms >= 0.0);
        assert_eq!(average, Some(frame_ms));
    }
}
