//! Phrase alignment between a primary and a secondary meter.
//!
//! Two layers in different meters line up when some number of primary
//! measures lasts exactly as long as some number of secondary measures. With
//! a shared tempo that is a question about meter ratios only: 3 bars of 4/4
//! and 4 bars of 3/4 are both three whole notes long.

use super::meter::Meter;
use crate::composer::Composer;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Largest measure count tried on either side.
pub const MAX_ALIGNMENT_MEASURES: u32 = 5;

/// Composer retries before giving up on a secondary meter.
pub const MAX_ALIGNMENT_ATTEMPTS: u32 = 100;

const RATIO_TOLERANCE: f64 = 1e-8;

/// Measure counts that make both layers' phrases last equally long.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolyAlignment {
    pub primary_meter: Meter,
    pub secondary_meter: Meter,
    pub primary_measures: u32,
    pub secondary_measures: u32,
}

impl PolyAlignment {
    /// One measure against one measure of the same meter.
    pub fn unison(primary_meter: Meter) -> Self {
        Self {
            primary_meter,
            secondary_meter: primary_meter,
            primary_measures: 1,
            secondary_measures: 1,
        }
    }

    pub fn total_measures(&self) -> u32 {
        self.primary_measures + self.secondary_measures
    }

    /// Whether this is a real polyrhythm rather than a degenerate match.
    pub fn is_valid(&self) -> bool {
        self.total_measures() > 2
            && (self.primary_measures > 1 || self.secondary_measures > 1)
            && self.primary_meter != self.secondary_meter
    }
}

/// Finds the smallest pair of measure counts that align two meters.
///
/// Returns `None` when nothing within [`MAX_ALIGNMENT_MEASURES`] aligns, or
/// when the best match is degenerate (1:1, a total of two measures, or the
/// same meter twice).
pub fn find_alignment(primary: Meter, secondary: Meter) -> Option<PolyAlignment> {
    if primary.validate().is_err() || secondary.validate().is_err() {
        return None;
    }
    let (primary_ratio, secondary_ratio) = (primary.ratio(), secondary.ratio());
    let mut best: Option<PolyAlignment> = None;

    for primary_measures in 1..=MAX_ALIGNMENT_MEASURES {
        for secondary_measures in 1..=MAX_ALIGNMENT_MEASURES {
            let difference = (primary_measures as f64 * primary_ratio
                - secondary_measures as f64 * secondary_ratio)
                .abs();
            if difference >= RATIO_TOLERANCE {
                continue;
            }
            let total = primary_measures + secondary_measures;
            if best.map_or(true, |b| total < b.total_measures()) {
                best = Some(PolyAlignment {
                    primary_meter: primary,
                    secondary_meter: secondary,
                    primary_measures,
                    secondary_measures,
                });
            }
        }
    }

    best.filter(PolyAlignment::is_valid)
}

/// Asks `composer` for secondary meters until one aligns with `primary`.
///
/// Falls back to [`PolyAlignment::unison`] after [`MAX_ALIGNMENT_ATTEMPTS`]
/// misses, so both layers still share phrase boundaries.
pub fn align_with_composer(primary: Meter, composer: &mut dyn Composer) -> PolyAlignment {
    for attempt in 1..=MAX_ALIGNMENT_ATTEMPTS {
        let candidate = composer.get_meter(true, true);
        if let Some(alignment) = find_alignment(primary, candidate) {
            debug!(
                %primary,
                secondary = %candidate,
                attempt,
                primary_measures = alignment.primary_measures,
                secondary_measures = alignment.secondary_measures,
                "Aligned polyrhythm"
            );
            return alignment;
        }
    }
    warn!(
        %primary,
        attempts = MAX_ALIGNMENT_ATTEMPTS,
        "No secondary meter aligned, falling back to unison"
    );
    PolyAlignment::unison(primary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::composer::FixedComposer;

    #[test]
    fn test_four_four_against_three_four() {
        let alignment = find_alignment(Meter::new(4, 4), Meter::new(3, 4)).unwrap();
        assert_eq!(alignment.primary_measures, 3);
        assert_eq!(alignment.secondary_measures, 4);

        // Both phrases last three whole notes
        let primary = alignment.primary_measures as f64 * Meter::new(4, 4).ratio();
        let secondary = alignment.secondary_measures as f64 * Meter::new(3, 4).ratio();
        assert!((primary - secondary).abs() < 1e-12);
    }

    #[test]
    fn test_degenerate_matches_rejected() {
        // Same meter
        assert!(find_alignment(Meter::new(4, 4), Meter::new(4, 4)).is_none());
        // Equal ratio aligns 1:1
        assert!(find_alignment(Meter::new(4, 4), Meter::new(8, 8)).is_none());
        // Nothing within five measures
        assert!(find_alignment(Meter::new(4, 4), Meter::new(7, 8)).is_none());
        // 6/8 against 5/8 would need five against six
        assert!(find_alignment(Meter::new(6, 8), Meter::new(5, 8)).is_none());
        let five = find_alignment(Meter::new(5, 4), Meter::new(6, 8)).unwrap();
        assert_eq!((five.primary_measures, five.secondary_measures), (3, 5));
        // One against two is a valid three-measure cycle
        let half = find_alignment(Meter::new(4, 4), Meter::new(2, 4)).unwrap();
        assert_eq!((half.primary_measures, half.secondary_measures), (1, 2));
    }

    #[test]
    fn test_composer_retries_then_falls_back() {
        let mut composer =
            FixedComposer::new(Meter::new(4, 4)).with_secondary_meter(Meter::new(3, 4));
        let alignment = align_with_composer(Meter::new(4, 4), &mut composer);
        assert_eq!(alignment.secondary_meter, Meter::new(3, 4));

        // 5/4 against 7/8 needs seven measures
        let mut stubborn = FixedComposer::new(Meter::new(7, 8));
        let fallback = align_with_composer(Meter::new(5, 4), &mut stubborn);
        assert_eq!(fallback, PolyAlignment::unison(Meter::new(5, 4)));
        assert_eq!(stubborn.meter_requests(), MAX_ALIGNMENT_ATTEMPTS as usize);
    }
}
