//! Speed-sample ring, ETA estimation, and adaptive buffer sizing.
//!
//! New state per `SPEC_FULL.md` §4.6, built as a small fixed-window
//! `VecDeque` the way the teacher keeps small bounded state
//! (`SessionRecorder::entries`) behind a lock rather than reaching for an
//! external metrics crate.

use std::collections::VecDeque;
use std::time::Duration;

use super::{
    ADAPTIVE_BUFFER_FACTOR, ADAPTIVE_BUFFER_MAX, ADAPTIVE_BUFFER_MIN,
    ADAPTIVE_BUFFER_THRESHOLD_BYTES_PER_SEC,
};

/// One (wall-clock time, cumulative bytes) observation, per distilled §3
/// glossary "Speed sample".
#[derive(Debug, Clone, Copy)]
struct Sample {
    elapsed: Duration,
    bytes: u64,
}

/// Ring of samples bounded to the last 10s of a file's transfer, per
/// distilled §4.6 "Speed/ETA".
pub struct SpeedRing {
    window: Duration,
    samples: VecDeque<Sample>,
}

impl SpeedRing {
    pub fn new() -> Self {
        Self {
            window: Duration::from_secs(10),
            samples: VecDeque::new(),
        }
    }

    /// Records a new (elapsed, cumulative bytes) sample and evicts entries
    /// older than the 10s window.
    pub fn record(&mut self, elapsed: Duration, bytes: u64) {
        self.samples.push_back(Sample { elapsed, bytes });
        while let Some(front) = self.samples.front() {
            if elapsed.saturating_sub(front.elapsed) > self.window {
                self.samples.pop_front();
            } else {
                break;
            }
        }
    }

    /// `speed = (latest.bytes - earliest.bytes) / deltaT`, bytes/sec.
    pub fn speed_bytes_per_sec(&self) -> f64 {
        let (Some(first), Some(last)) = (self.samples.front(), self.samples.back()) else {
            return 0.0;
        };
        let delta_t = last.elapsed.saturating_sub(first.elapsed).as_secs_f64();
        if delta_t <= 0.0 {
            return 0.0;
        }
        (last.bytes.saturating_sub(first.bytes)) as f64 / delta_t
    }

    /// `ETA = remaining / speed`, `None` if speed is zero (can't estimate).
    pub fn eta_seconds(&self, remaining: u64) -> Option<f64> {
        let speed = self.speed_bytes_per_sec();
        if speed <= 0.0 {
            None
        } else {
            Some(remaining as f64 / speed)
        }
    }
}

impl Default for SpeedRing {
    fn default() -> Self {
        Self::new()
    }
}

/// Adaptive buffer sizing for downloads, per distilled §4.6: measured every
/// 1s from an instantaneous speed estimate; above threshold grows the chunk
/// size by `factor` (capped), below `threshold/2` shrinks it (floored).
pub struct AdaptiveBuffer {
    current: usize,
}

impl AdaptiveBuffer {
    pub fn new(initial: usize) -> Self {
        Self {
            current: initial.clamp(ADAPTIVE_BUFFER_MIN, ADAPTIVE_BUFFER_MAX),
        }
    }

    pub fn current(&self) -> usize {
        self.current
    }

    /// `bytes_since_last` measured over `elapsed` (nominally ~1s).
    pub fn adjust(&mut self, bytes_since_last: u64, elapsed: Duration) -> usize {
        let secs = elapsed.as_secs_f64().max(f64::EPSILON);
        let instantaneous_speed = bytes_since_last as f64 / secs;

        if instantaneous_speed > ADAPTIVE_BUFFER_THRESHOLD_BYTES_PER_SEC {
            let grown = (self.current as f64 * ADAPTIVE_BUFFER_FACTOR) as usize;
            self.current = grown.min(ADAPTIVE_BUFFER_MAX);
        } else if instantaneous_speed < ADAPTIVE_BUFFER_THRESHOLD_BYTES_PER_SEC / 2.0 {
            let shrunk = (self.current as f64 / ADAPTIVE_BUFFER_FACTOR) as usize;
            self.current = shrunk.max(ADAPTIVE_BUFFER_MIN);
        }
        self.current
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn speed_ring_computes_throughput_across_samples() {
        let mut ring = SpeedRing::new();
        ring.record(Duration::from_secs(0), 0);
        ring.record(Duration::from_secs(2), 2_000_000);
        assert!((ring.speed_bytes_per_sec() - 1_000_000.0).abs() < 1.0);
    }

    #[test]
    fn speed_ring_evicts_samples_outside_window() {
        let mut ring = SpeedRing::new();
        ring.record(Duration::from_secs(0), 0);
        ring.record(Duration::from_secs(15), 15_000_000);
        // The t=0 sample should have been evicted (15s > 10s window), so
        // this is the only sample left and speed is 0 (no delta).
        assert_eq!(ring.speed_bytes_per_sec(), 0.0);
    }

    #[test]
    fn eta_is_none_without_progress() {
        let ring = SpeedRing::new();
        assert_eq!(ring.eta_seconds(1000), None);
    }

    #[test]
    fn adaptive_buffer_grows_above_threshold() {
        let mut buf = AdaptiveBuffer::new(1024 * 1024);
        let size = buf.adjust(2 * 1024 * 1024, Duration::from_secs(1));
        assert!(size > 1024 * 1024);
    }

    #[test]
    fn adaptive_buffer_shrinks_below_half_threshold() {
        let mut buf = AdaptiveBuffer::new(1024 * 1024);
        let size = buf.adjust(100_000, Duration::from_secs(1));
        assert!(size < 1024 * 1024);
    }

    #[test]
    fn adaptive_buffer_respects_bounds() {
        let mut buf = AdaptiveBuffer::new(ADAPTIVE_BUFFER_MAX);
        buf.adjust(10 * 1024 * 1024, Duration::from_secs(1));
        assert_eq!(buf.current(), ADAPTIVE_BUFFER_MAX);

        let mut buf = AdaptiveBuffer::new(ADAPTIVE_BUFFER_MIN);
        buf.adjust(1, Duration::from_secs(1));
        assert_eq!(buf.current(), ADAPTIVE_BUFFER_MIN);
    }
}
