use anyhow::{anyhow, Result};
use std::fmt;

/// Default threshold below which a moving scene counts as still again.
pub const DEFAULT_STILL_THRESHOLD: f64 = 0.0022;
/// Default threshold above which a still scene counts as moving.
pub const DEFAULT_MOVING_THRESHOLD: f64 = 0.0023;

/// Scene mode tracked by the detector.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Mode {
    #[default]
    Still,
    Moving,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mode::Still => f.write_str("still"),
            Mode::Moving => f.write_str("moving"),
        }
    }
}

/// Two-threshold Still/Moving state machine.
///
/// A tick fires on the Moving to Still transition only. Values between the
/// two thresholds never change the mode.
#[derive(Clone, Debug)]
pub struct Hysteresis {
    still_threshold: f64,
    moving_threshold: f64,
    mode: Mode,
}

impl Hysteresis {
    pub fn new(still_threshold: f64, moving_threshold: f64) -> Result<Self> {
        if !still_threshold.is_finite() || !moving_threshold.is_finite() {
            return Err(anyhow!("thresholds must be finite"));
        }
        if still_threshold < 0.0 || still_threshold >= moving_threshold {
            return Err(anyhow!(
                "thresholds must satisfy 0 <= still < moving (still {}, moving {})",
                still_threshold,
                moving_threshold
            ));
        }
        Ok(Self {
            still_threshold,
            moving_threshold,
            mode: Mode::Still,
        })
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn still_threshold(&self) -> f64 {
        self.still_threshold
    }

    pub fn moving_threshold(&self) -> f64 {
        self.moving_threshold
    }

    /// Feed one difference fraction. Returns `true` when a tick fires.
    pub fn step(&mut self, percent_diff: f64) -> bool {
        match self.mode {
            Mode::Still if percent_diff > self.moving_threshold => {
                self.mode = Mode::Moving;
                false
            }
            Mode::Moving if percent_diff < self.still_threshold => {
                self.mode = Mode::Still;
                true
            }
            _ => false,
        }
    }
}

impl Default for Hysteresis {
    fn default() -> Self {
        Self {
            still_threshold: DEFAULT_STILL_THRESHOLD,
            moving_threshold: DEFAULT_MOVING_THRESHOLD,
            mode: Mode::Still,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    #[test]
    fn settle_after_motion_ticks_once() {
        let mut h = Hysteresis::default();
        let mut modes = Vec::new();
        let mut ticks = Vec::new();
        for (i, diff) in [0.0, 0.003, 0.004, 0.001].into_iter().enumerate() {
            if h.step(diff) {
                ticks.push(i + 1);
            }
            modes.push(h.mode());
        }
        assert_eq!(modes, vec![Mode::Still, Mode::Moving, Mode::Moving, Mode::Still]);
        assert_eq!(ticks, vec![4]);
    }

    #[test]
    fn values_between_thresholds_never_change_mode() {
        let mut still = Hysteresis::default();
        let mut moving = Hysteresis::default();
        assert!(!moving.step(0.01));
        assert_eq!(moving.mode(), Mode::Moving);

        for diff in [0.0022, 0.00225, 0.0023, 0.00222, 0.00229] {
            assert!(!still.step(diff));
            assert!(!moving.step(diff));
        }
        assert_eq!(still.mode(), Mode::Still);
        assert_eq!(moving.mode(), Mode::Moving);
    }

    #[test]
    fn tick_iff_moving_episode_then_settle() {
        let mut rng = StdRng::seed_from_u64(2022);
        for _ in 0..200 {
            let mut h = Hysteresis::default();
            let mut in_motion = false;
            for _ in 0..50 {
                let diff = match rng.gen_range(0..3) {
                    0 => rng.gen_range(0.0..0.0022),
                    1 => rng.gen_range(0.0022..=0.0023),
                    _ => rng.gen_range(0.00231..0.05),
                };
                let expected_tick = in_motion && diff < 0.0022;
                if diff > 0.0023 {
                    in_motion = true;
                }
                if expected_tick {
                    in_motion = false;
                }
                assert_eq!(h.step(diff), expected_tick);
            }
        }
    }

    #[test]
    fn rejects_inverted_thresholds() {
        assert!(Hysteresis::new(0.003, 0.002).is_err());
        assert!(Hysteresis::new(0.002, 0.002).is_err());
        assert!(Hysteresis::new(-0.1, 0.002).is_err());
        assert!(Hysteresis::new(0.001, f64::NAN).is_err());
        assert!(Hysteresis::new(0.0, 0.002).is_ok());
    }
}
