//! Allocation-free frame-rate pacer (spec §4.7).
//!
//! `RateTimer` anchors to a steady clock at construction and computes each
//! deadline from a frame counter rather than by repeatedly adding an
//! interval, so rounding error never accumulates drift across a long-running
//! capture session.

use std::time::{Duration, Instant};

use crate::rational::Rational;

/// Paces calls to one-per-frame-interval without drifting.
pub struct RateTimer {
    origin: Instant,
    fps: Rational,
    frames_elapsed: u64,
}

impl RateTimer {
    /// `fps` must be positive; callers validate this at config load time
    /// (see [`crate::error::ConfigError`]).
    pub fn new(fps: Rational) -> Self {
        debug_assert!(fps.as_f64() > 0.0, "RateTimer fps must be positive");
        RateTimer { origin: Instant::now(), fps, frames_elapsed: 0 }
    }

    fn deadline_for(&self, frame_index: u64) -> Instant {
        let secs = frame_index as f64 * self.fps.den() as f64 / self.fps.num() as f64;
        self.origin + Duration::from_secs_f64(secs.max(0.0))
    }

    /// Blocks the calling thread until the next frame's deadline, then
    /// advances the internal counter. Intended for a `spawn_blocking` worker,
    /// not an async task (spec §5 concurrency notes).
    pub fn wait_for_next_frame(&mut self) {
        let deadline = self.deadline_for(self.frames_elapsed);
        let now = Instant::now();
        if deadline > now {
            std::thread::sleep(deadline - now);
        }
        self.frames_elapsed += 1;
    }

    pub fn fps(&self) -> Rational {
        self.fps
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deadlines_advance_by_exact_interval_without_drift() {
        let timer = RateTimer::new(Rational::new(100, 1));
        let d0 = timer.deadline_for(0);
        let d1 = timer.deadline_for(1);
        let d100 = timer.deadline_for(100);
        // 100fps -> 10ms per frame; 100 frames later should be exactly 1s
        // after origin, not 100 accumulated roundings off.
        assert_eq!(d1.duration_since(d0), Duration::from_millis(10));
        assert_eq!(d100.duration_since(d0), Duration::from_secs(1));
    }

    #[test]
    fn wait_for_next_frame_advances_counter() {
        let mut timer = RateTimer::new(Rational::new(1000, 1));
        assert_eq!(timer.frames_elapsed, 0);
        timer.wait_for_next_frame();
        assert_eq!(timer.frames_elapsed, 1);
        timer.wait_for_next_frame();
        assert_eq!(timer.frames_elapsed, 2);
    }
}
