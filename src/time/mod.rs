//! Timing primitives for hierarchical musical time.
//!
//! This module holds the meter arithmetic, the per-layer timing contexts, the
//! branching-factor cache, the unit ledger and the cascading resolver that ties
//! them together. Ticks are kept as `f64` throughout because spoofed meters and
//! nested branching routinely land between integer ticks; serializers round.

pub mod cache;
pub mod context;
pub mod layer;
pub mod ledger;
pub mod meter;
pub mod polyrhythm;
pub mod resolver;
pub mod sink;
pub mod unit;

pub use cache::{BranchKey, BranchKind, BranchingCache};
pub use context::{ContextOverrides, Frame, RhythmCounters, RunTotals, TimingContext};
pub use layer::{ActivationSnapshot, AdvanceKind, Layer, LayerManager};
pub use ledger::{UnitLedger, UnitRecord};
pub use meter::{Meter, MeterSync};
pub use polyrhythm::PolyAlignment;
pub use resolver::{Resolver, ResolverSettings};
pub use sink::{EventBuffer, TimedEvent, TimingEvent};
pub use unit::{Span, UnitIndices, UnitTotals, UnitType};

/// Default pulses per quarter note.
pub const DEFAULT_PPQ: u32 = 480;

/// Default tempo in beats per minute.
pub const DEFAULT_TEMPO: f64 = 120.0;

/// Span differences below this many ticks are floating point noise.
pub const TICK_EPSILON: f64 = 1e-6;

/// Converts ticks to seconds for a layer running at `ticks_per_second`.
///
/// # Arguments
///
/// * `ticks` - Absolute or relative tick count
/// * `ticks_per_second` - The layer's current tick rate
///
/// # Returns
///
/// Duration in seconds, or 0.0 when the rate is not usable
pub fn ticks_to_seconds(ticks: f64, ticks_per_second: f64) -> f64 {
    if ticks_per_second > 0.0 && ticks_per_second.is_finite() {
        ticks / ticks_per_second
    } else {
        0.0
    }
}

/// Formats a duration in seconds as `M:SS.ssss`.
///
/// # Examples
///
/// ```
/// use tactus::time::format_time;
///
/// assert_eq!(format_time(62.5), "1:02.5000");
/// assert_eq!(format_time(0.0), "0:00.0000");
/// ```
pub fn format_time(seconds: f64) -> String {
    let seconds = if seconds.is_finite() { seconds.max(0.0) } else { 0.0 };
    let minutes = (seconds / 60.0).floor();
    let remainder = seconds - minutes * 60.0;
    // 59.99996 would otherwise print as "0:60.0000"
    let (minutes, remainder) = if format!("{remainder:.4}").starts_with("60") {
        (minutes + 1.0, 0.0)
    } else {
        (minutes, remainder)
    };
    format!("{}:{:07.4}", minutes as u64, remainder)
}
