//! Composers answer the structural questions the resolver cannot decide on
//! its own: which meter comes next and how finely each level is split.

use crate::config::{Config, WeightedRange};
use crate::time::Meter;
use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::warn;

/// Source of meters and branching factors.
///
/// Answers may change from call to call; the resolver freezes the first
/// answer for every position in its branching cache.
pub trait Composer {
    /// Proposes a meter.
    ///
    /// # Arguments
    ///
    /// * `want_new` - Ask for a fresh meter even if it falls outside the
    ///   composer's usual ratio window
    /// * `is_secondary` - The meter is for a secondary (polyrhythmic) layer
    fn get_meter(&mut self, want_new: bool, is_secondary: bool) -> Meter;

    /// Divisions per beat.
    fn get_divisions(&mut self) -> u32;

    /// Subdivisions per division.
    fn get_subdivisions(&mut self) -> u32;

    /// Sub-subdivisions per subdivision.
    fn get_subsubdivisions(&mut self) -> u32;
}

/// Composer with constant answers. Counts how often it is asked.
#[derive(Debug, Clone)]
pub struct FixedComposer {
    meter: Meter,
    secondary_meter: Meter,
    divisions: u32,
    subdivisions: u32,
    subsubdivisions: u32,
    meter_requests: usize,
    branch_requests: usize,
}

impl FixedComposer {
    /// A composer answering `meter` for both layers and 1 for every split.
    pub fn new(meter: Meter) -> Self {
        Self {
            meter,
            secondary_meter: meter,
            divisions: 1,
            subdivisions: 1,
            subsubdivisions: 1,
            meter_requests: 0,
            branch_requests: 0,
        }
    }

    pub fn with_secondary_meter(mut self, meter: Meter) -> Self {
        self.secondary_meter = meter;
        self
    }

    pub fn with_divisions(mut self, divisions: u32) -> Self {
        self.divisions = divisions;
        self
    }

    pub fn with_subdivisions(mut self, subdivisions: u32) -> Self {
        self.subdivisions = subdivisions;
        self
    }

    pub fn with_subsubdivisions(mut self, subsubdivisions: u32) -> Self {
        self.subsubdivisions = subsubdivisions;
        self
    }

    pub fn meter_requests(&self) -> usize {
        self.meter_requests
    }

    /// Number of branching-factor questions answered.
    pub fn branch_requests(&self) -> usize {
        self.branch_requests
    }
}

impl Composer for FixedComposer {
    fn get_meter(&mut self, _want_new: bool, is_secondary: bool) -> Meter {
        self.meter_requests += 1;
        if is_secondary {
            self.secondary_meter
        } else {
            self.meter
        }
    }

    fn get_divisions(&mut self) -> u32 {
        self.branch_requests += 1;
        self.divisions
    }

    fn get_subdivisions(&mut self) -> u32 {
        self.branch_requests += 1;
        self.subdivisions
    }

    fn get_subsubdivisions(&mut self) -> u32 {
        self.branch_requests += 1;
        self.subsubdivisions
    }
}

/// Meters whose ratio leaves this window are redrawn.
pub const METER_RATIO_RANGE: (f64, f64) = (0.25, 4.0);

/// Smallest log2 distance between consecutive meter ratios.
pub const MIN_LOG_STEPS: f64 = 0.5;

const MAX_METER_ATTEMPTS: usize = 200;

/// Composer drawing from weighted ranges with a seeded generator.
///
/// Consecutive meters are kept musically related: each new ratio must be
/// between half an octave and two octaves (four for secondary meters) away
/// from the previous one in log2 terms.
#[derive(Debug, Clone)]
pub struct RandomComposer {
    rng: StdRng,
    numerator: WeightedRange,
    denominator: WeightedRange,
    divisions: WeightedRange,
    subdivisions: WeightedRange,
    subsubdivisions: WeightedRange,
    last_meter: Option<Meter>,
}

impl RandomComposer {
    /// Builds a composer from the configured ranges.
    pub fn from_config(config: &Config, seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
            numerator: config.numerator.clone(),
            denominator: config.denominator.clone(),
            divisions: config.divisions.clone(),
            subdivisions: config.subdivisions.clone(),
            subsubdivisions: config.subsubdivisions.clone(),
            last_meter: None,
        }
    }
}

impl Composer for RandomComposer {
    fn get_meter(&mut self, want_new: bool, is_secondary: bool) -> Meter {
        let max_log_steps = if is_secondary { 4.0 } else { 2.0 };
        let (min_ratio, max_ratio) = METER_RATIO_RANGE;

        for _ in 0..MAX_METER_ATTEMPTS {
            let numerator = self.numerator.sample(&mut self.rng);
            let denominator = self.denominator.sample(&mut self.rng);
            let Ok(meter) = Meter::try_new(numerator, denominator) else {
                continue;
            };
            let ratio = meter.ratio();
            if !want_new && !(min_ratio..=max_ratio).contains(&ratio) {
                continue;
            }
            if let Some(last) = self.last_meter {
                let steps = (ratio / last.ratio()).log2().abs();
                if !(MIN_LOG_STEPS..=max_log_steps).contains(&steps) {
                    continue;
                }
            }
            self.last_meter = Some(meter);
            return meter;
        }

        warn!(
            attempts = MAX_METER_ATTEMPTS,
            is_secondary, "No meter satisfied the ratio constraints, using 4/4"
        );
        self.last_meter = Some(Meter::COMMON_TIME);
        Meter::COMMON_TIME
    }

    fn get_divisions(&mut self) -> u32 {
        self.divisions.sample(&mut self.rng)
    }

    fn get_subdivisions(&mut self) -> u32 {
        self.subdivisions.sample(&mut self.rng)
    }

    fn get_subsubdivisions(&mut self) -> u32 {
        self.subsubdivisions.sample(&mut self.rng)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_composer_answers() {
        let mut composer = FixedComposer::new(Meter::new(4, 4))
            .with_secondary_meter(Meter::new(3, 4))
            .with_divisions(2)
            .with_subdivisions(3);
        assert_eq!(composer.get_meter(false, false), Meter::new(4, 4));
        assert_eq!(composer.get_meter(true, true), Meter::new(3, 4));
        assert_eq!(composer.get_divisions(), 2);
        assert_eq!(composer.get_subdivisions(), 3);
        assert_eq!(composer.get_subsubdivisions(), 1);
        assert_eq!(composer.meter_requests(), 2);
        assert_eq!(composer.branch_requests(), 3);
    }

    #[test]
    fn test_random_meters_respect_steps() {
        let mut composer = RandomComposer::from_config(&Config::default(), 42);
        let mut previous = composer.get_meter(false, false);
        for _ in 0..50 {
            let meter = composer.get_meter(false, false);
            assert!(meter.numerator > 0 && meter.denominator > 0);
            if meter != Meter::COMMON_TIME {
                let ratio = meter.ratio();
                assert!((0.25..=4.0).contains(&ratio));
                let steps = (ratio / previous.ratio()).log2().abs();
                assert!((0.5..=2.0).contains(&steps), "{previous} -> {meter}");
            }
            previous = meter;
        }
    }

    #[test]
    fn test_same_seed_same_answers() {
        let config = Config::default();
        let mut a = RandomComposer::from_config(&config, 9);
        let mut b = RandomComposer::from_config(&config, 9);
        for _ in 0..20 {
            assert_eq!(a.get_meter(false, false), b.get_meter(false, false));
            assert_eq!(a.get_divisions(), b.get_divisions());
            assert_eq!(a.get_subsubdivisions(), b.get_subsubdivisions());
        }
    }
}
