//! Color conversion and tick detection.
//!
//! `TickDetector` compares each converted frame with the one before it. The
//! mean absolute per-channel difference drives a `Hysteresis` state machine;
//! when a moving scene settles, the frame held from before the settling
//! comparison is the tick and is marked selected.

mod convert;
mod hysteresis;

pub use convert::{yuv_to_rgb, yuyv_to_rgb};
pub use hysteresis::{Hysteresis, Mode, DEFAULT_MOVING_THRESHOLD, DEFAULT_STILL_THRESHOLD};

use std::fmt;
use std::time::Instant;

use crate::pool::PooledBuffer;

/// Detection failures. All of them are fatal to a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DetectError {
    /// Frame byte count differs from the size fixed by the first frame.
    FrameSizeMismatch { expected: usize, actual: usize },
    /// Conversion target smaller than the converted frame.
    OutputTooSmall { needed: usize, available: usize },
    /// A zero-length frame cannot seed the detector.
    EmptyFrame,
}

impl fmt::Display for DetectError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DetectError::FrameSizeMismatch { expected, actual } => write!(
                f,
                "expected image size and actual image size don't match ({} != {})",
                expected, actual
            ),
            DetectError::OutputTooSmall { needed, available } => write!(
                f,
                "conversion buffer too small: need {} bytes, have {}",
                needed, available
            ),
            DetectError::EmptyFrame => f.write_str("empty frame"),
        }
    }
}

impl std::error::Error for DetectError {}

/// Sum of absolute per-byte differences.
pub fn diff_sum(current: &[u8], previous: &[u8]) -> u64 {
    current
        .iter()
        .zip(previous)
        .map(|(&a, &b)| u64::from(a.abs_diff(b)))
        .sum()
}

/// Per-run detector state.
pub struct TickDetector {
    hysteresis: Hysteresis,
    previous: Option<PooledBuffer>,
    expected_len: usize,
    max_diff: u64,
    frames: u64,
    ticks: u64,
    last_percent_diff: Option<f64>,
    started: Option<Instant>,
}

impl TickDetector {
    pub fn new(hysteresis: Hysteresis) -> Self {
        Self {
            hysteresis,
            previous: None,
            expected_len: 0,
            max_diff: 0,
            frames: 0,
            ticks: 0,
            last_percent_diff: None,
            started: None,
        }
    }

    /// Feed the next converted frame.
    ///
    /// Returns the frame it displaces as "previous", tagged selected when it
    /// is a tick. Nothing is displaced by the seeding frame. The caller
    /// forwards or releases the displaced frame.
    pub fn process(&mut self, current: PooledBuffer) -> Result<Option<PooledBuffer>, DetectError> {
        let Some(previous) = self.previous.as_ref() else {
            if current.is_empty() {
                return Err(DetectError::EmptyFrame);
            }
            self.expected_len = current.len();
            self.max_diff = current.len() as u64 * 255;
            self.frames = 1;
            self.started = Some(Instant::now());
            self.previous = Some(current);
            return Ok(None);
        };

        if current.len() != self.expected_len {
            return Err(DetectError::FrameSizeMismatch {
                expected: self.expected_len,
                actual: current.len(),
            });
        }

        self.frames += 1;
        let sum = diff_sum(current.as_slice(), previous.as_slice());
        let percent_diff = sum as f64 / self.max_diff as f64;
        self.last_percent_diff = Some(percent_diff);
        log::debug!(
            "TickDetector: time {:.3}, percent diff {:.6}, cnt {}",
            self.started.map_or(0.0, |t| t.elapsed().as_secs_f64()),
            percent_diff,
            self.frames
        );

        let tick = self.hysteresis.step(percent_diff);
        let mut displaced = self.previous.replace(current);
        if tick {
            self.ticks += 1;
            if let Some(frame) = displaced.as_mut() {
                frame.set_selected(true);
            }
        }
        Ok(displaced)
    }

    pub fn mode(&self) -> Mode {
        self.hysteresis.mode()
    }

    /// Frames processed, including the seeding frame.
    pub fn frames(&self) -> u64 {
        self.frames
    }

    pub fn ticks(&self) -> u64 {
        self.ticks
    }

    pub fn last_percent_diff(&self) -> Option<f64> {
        self.last_percent_diff
    }

    /// Byte count fixed by the first frame, if seen.
    pub fn expected_len(&self) -> Option<usize> {
        self.previous.as_ref().map(|_| self.expected_len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::BufferPool;

    fn frame(pool: &BufferPool, fill: &[u8]) -> PooledBuffer {
        let mut buf = pool.acquire().expect("pool exhausted");
        buf.as_mut_slice()[..fill.len()].copy_from_slice(fill);
        buf.set_len(fill.len());
        buf
    }

    #[test]
    fn first_frame_seeds_without_comparison() -> Result<(), DetectError> {
        let pool = BufferPool::new(3, 4);
        let mut det = TickDetector::new(Hysteresis::default());
        assert!(det.process(frame(&pool, &[1, 2, 3, 4]))?.is_none());
        assert_eq!(det.frames(), 1);
        assert_eq!(det.expected_len(), Some(4));
        assert_eq!(det.last_percent_diff(), None);
        assert_eq!(pool.outstanding(), 1);
        Ok(())
    }

    #[test]
    fn tick_returns_the_frame_held_before_settling() -> Result<(), DetectError> {
        let pool = BufferPool::new(4, 4);
        let mut det = TickDetector::new(Hysteresis::default());
        det.process(frame(&pool, &[0, 0, 0, 0]))?;
        let seed = det.process(frame(&pool, &[255, 255, 255, 255]))?;
        assert!(seed.is_some_and(|f| !f.selected()));
        assert_eq!(det.mode(), Mode::Moving);
        let moving = det.process(frame(&pool, &[0, 255, 0, 255]))?;
        assert!(moving.is_some_and(|f| !f.selected()));
        assert_eq!(det.mode(), Mode::Moving);

        let tick = det
            .process(frame(&pool, &[0, 255, 0, 255]))?
            .expect("displaced frame");
        assert!(tick.selected());
        assert_eq!(tick.as_slice(), &[0, 255, 0, 255]);
        assert_eq!(det.mode(), Mode::Still);
        assert_eq!(det.ticks(), 1);
        assert_eq!(det.frames(), 4);
        // Held previous frame plus the tick.
        assert_eq!(pool.outstanding(), 2);
        Ok(())
    }

    #[test]
    fn steady_scene_never_selects() -> Result<(), DetectError> {
        let pool = BufferPool::new(2, 2);
        let mut det = TickDetector::new(Hysteresis::default());
        assert!(det.process(frame(&pool, &[9, 9]))?.is_none());
        for _ in 0..10 {
            let displaced = det.process(frame(&pool, &[9, 9]))?.expect("displaced frame");
            assert!(!displaced.selected());
            drop(displaced);
            assert_eq!(pool.outstanding(), 1);
        }
        assert_eq!(det.ticks(), 0);
        assert_eq!(det.last_percent_diff(), Some(0.0));
        Ok(())
    }

    #[test]
    fn size_drift_is_rejected() -> Result<(), DetectError> {
        let pool = BufferPool::new(3, 8);
        let mut det = TickDetector::new(Hysteresis::default());
        det.process(frame(&pool, &[1; 6]))?;
        let err = det.process(frame(&pool, &[1; 8])).unwrap_err();
        assert_eq!(
            err,
            DetectError::FrameSizeMismatch {
                expected: 6,
                actual: 8
            }
        );
        assert_eq!(pool.outstanding(), 1);
        Ok(())
    }

    #[test]
    fn empty_first_frame_is_rejected() {
        let pool = BufferPool::new(1, 4);
        let mut det = TickDetector::new(Hysteresis::default());
        let buf = pool.acquire().expect("pool exhausted");
        assert_eq!(det.process(buf).unwrap_err(), DetectError::EmptyFrame);
    }

    #[test]
    fn diff_sum_is_symmetric() {
        assert_eq!(diff_sum(&[0, 10, 255], &[5, 0, 0]), 5 + 10 + 255);
        assert_eq!(diff_sum(&[5, 0, 0], &[0, 10, 255]), 270);
    }
}
