//! Per-layer timing state and the shared working set.
//!
//! Every layer owns a [`TimingContext`]: its meter, tempo, and the running
//! anchors (section start, phrase start, measure start) that move forward as
//! the composition advances. Exactly one layer is active at a time; its
//! context is copied into the [`Frame`], mutated there while units are
//! resolved, and copied back when the layer advances.

use super::meter::{Meter, MeterSync};
use super::unit::{Span, UnitIndices, UnitType};
use super::{DEFAULT_PPQ, DEFAULT_TEMPO};
use crate::error::Result;
use serde::{Deserialize, Serialize};

/// Timing state of one layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimingContext {
    /// Quarter notes per minute.
    tempo: f64,
    /// Pulses per quarter note.
    ppq: u32,
    /// Meter plus everything derived from it.
    sync: MeterSync,

    /// Number of measures in each phrase.
    pub measures_per_phrase: u32,

    /// Tick where the current section starts.
    pub section_start: f64,
    /// Time in seconds where the current section starts.
    pub section_start_time: f64,
    /// End tick of the last completed section.
    pub section_end: f64,
    /// Tick where the current phrase starts.
    pub phrase_start: f64,
    pub phrase_start_time: f64,
    /// Tick where the most recently resolved measure starts.
    pub measure_start: f64,
    pub measure_start_time: f64,

    /// Ticks accumulated by the phrases completed in the current section.
    pub ticks_per_section: f64,
    /// Seconds accumulated by the phrases completed in the current section.
    pub seconds_per_section: f64,
    /// Phrases completed in the current section.
    pub phrases_in_section: u32,
}

impl Default for TimingContext {
    fn default() -> Self {
        // 4/4 at a positive tempo and resolution is always valid
        let sync = MeterSync::compute(Meter::COMMON_TIME, DEFAULT_TEMPO, DEFAULT_PPQ)
            .unwrap_or(MeterSync {
                meter: Meter::COMMON_TIME,
                midi_meter: Meter::COMMON_TIME,
                sync_factor: 1.0,
                midi_tempo: DEFAULT_TEMPO,
                ticks_per_second: DEFAULT_TEMPO * DEFAULT_PPQ as f64 / 60.0,
                ticks_per_measure: DEFAULT_PPQ as f64 * 4.0,
                seconds_per_measure: 240.0 / DEFAULT_TEMPO,
            });
        Self {
            tempo: DEFAULT_TEMPO,
            ppq: DEFAULT_PPQ,
            sync,
            measures_per_phrase: 1,
            section_start: 0.0,
            section_start_time: 0.0,
            section_end: 0.0,
            phrase_start: 0.0,
            phrase_start_time: 0.0,
            measure_start: 0.0,
            measure_start_time: 0.0,
            ticks_per_section: 0.0,
            seconds_per_section: 0.0,
            phrases_in_section: 0,
        }
    }
}

/// Initial values a caller may set when registering a layer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContextOverrides {
    pub meter: Option<Meter>,
    pub tempo: Option<f64>,
    pub ppq: Option<u32>,
    pub measures_per_phrase: Option<u32>,
    pub section_start: Option<f64>,
    pub section_start_time: Option<f64>,
}

impl TimingContext {
    /// Builds a context from the defaults merged with `overrides`.
    ///
    /// # Errors
    ///
    /// Propagates meter, tempo and resolution validation failures.
    pub fn new(overrides: &ContextOverrides) -> Result<Self> {
        let mut context = Self::default();
        context.tempo = overrides.tempo.unwrap_or(DEFAULT_TEMPO);
        context.ppq = overrides.ppq.unwrap_or(DEFAULT_PPQ);
        context.sync = MeterSync::compute(
            overrides.meter.unwrap_or(Meter::COMMON_TIME),
            context.tempo,
            context.ppq,
        )?;
        if let Some(measures) = overrides.measures_per_phrase {
            context.measures_per_phrase = measures;
        }
        let start = overrides.section_start.unwrap_or(0.0);
        let start_time = overrides.section_start_time.unwrap_or(0.0);
        context.section_start = start;
        context.section_end = start;
        context.phrase_start = start;
        context.measure_start = start;
        context.section_start_time = start_time;
        context.phrase_start_time = start_time;
        context.measure_start_time = start_time;
        Ok(context)
    }

    pub fn meter(&self) -> Meter {
        self.sync.meter
    }

    pub fn sync(&self) -> &MeterSync {
        &self.sync
    }

    pub fn tempo(&self) -> f64 {
        self.tempo
    }

    pub fn ppq(&self) -> u32 {
        self.ppq
    }

    /// Replaces the meter and recomputes the derived timing.
    ///
    /// The context is left untouched if the new meter is rejected.
    pub fn set_meter(&mut self, meter: Meter) -> Result<()> {
        self.sync = MeterSync::compute(meter, self.tempo, self.ppq)?;
        Ok(())
    }

    pub fn ticks_per_measure(&self) -> f64 {
        self.sync.ticks_per_measure
    }

    pub fn ticks_per_phrase(&self) -> f64 {
        self.sync.ticks_per_measure * self.measures_per_phrase as f64
    }

    /// Seconds per phrase, derived from ticks so both domains stay in step.
    pub fn seconds_per_phrase(&self) -> f64 {
        self.ticks_per_phrase() / self.sync.ticks_per_second
    }

    /// Moves the phrase anchor past the phrase that just finished.
    pub fn advance_phrase(&mut self) {
        let ticks = self.ticks_per_phrase();
        let seconds = self.seconds_per_phrase();
        self.phrase_start += ticks;
        self.phrase_start_time += seconds;
        self.ticks_per_section += ticks;
        self.seconds_per_section += seconds;
        self.phrases_in_section += 1;
    }

    /// Moves the section anchor past the accumulated phrases and resets the
    /// accumulators.
    pub fn advance_section(&mut self) {
        self.section_start += self.ticks_per_section;
        self.section_start_time += self.seconds_per_section;
        self.section_end += self.ticks_per_section;
        self.phrase_start = self.section_start;
        self.phrase_start_time = self.section_start_time;
        self.ticks_per_section = 0.0;
        self.seconds_per_section = 0.0;
        self.phrases_in_section = 0;
    }
}

/// Rhythm-level position counters reset whenever a layer advances.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RhythmCounters {
    pub beat: u32,
    pub division: u32,
    pub subdivision: u32,
    pub subsubdivision: u32,
}

impl RhythmCounters {
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Composition-wide counts that no single layer owns.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunTotals {
    pub sections: Option<u32>,
    pub phrases_per_section: Option<u32>,
}

/// The shared working set the resolver reads and writes.
#[derive(Debug, Clone, Default)]
pub struct Frame {
    layer: Option<String>,
    /// Copy of the active layer's context.
    pub timing: TimingContext,
    /// Position of the unit most recently resolved.
    pub indices: UnitIndices,
    pub totals: RunTotals,
    pub rhythm: RhythmCounters,
    spans: [Option<(UnitIndices, Span)>; 7],
}

impl Frame {
    pub fn new() -> Self {
        Self::default()
    }

    /// Name of the layer whose context is loaded.
    pub fn layer(&self) -> Option<&str> {
        self.layer.as_deref()
    }

    /// Loads `context` as the working set for `layer`.
    ///
    /// Remembered spans belong to the previous layer and are dropped.
    pub fn load(&mut self, layer: &str, context: &TimingContext) {
        self.layer = Some(layer.to_string());
        self.timing = context.clone();
        self.spans = Default::default();
    }

    /// The last span recorded for `unit`, if it was recorded at `indices`.
    pub fn span(&self, unit: UnitType, indices: &UnitIndices) -> Option<Span> {
        match &self.spans[unit.depth()] {
            Some((at, span)) if at == &indices.truncated(unit) => Some(*span),
            _ => None,
        }
    }

    pub fn remember_span(&mut self, unit: UnitType, indices: &UnitIndices, span: Span) {
        self.spans[unit.depth()] = Some((indices.truncated(unit), span));
    }

    pub fn forget_spans(&mut self) {
        self.spans = Default::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let context = TimingContext::default();
        assert_eq!(context.meter(), Meter::COMMON_TIME);
        assert_eq!(context.measures_per_phrase, 1);
        assert!((context.ticks_per_measure() - 1920.0).abs() < 1e-9);
        assert!((context.sync().ticks_per_second - 960.0).abs() < 1e-9);
    }

    #[test]
    fn test_overrides_merge() {
        let overrides = ContextOverrides {
            meter: Some(Meter::new(3, 4)),
            tempo: Some(90.0),
            measures_per_phrase: Some(4),
            section_start: Some(1000.0),
            ..ContextOverrides::default()
        };
        let context = TimingContext::new(&overrides).unwrap();
        assert_eq!(context.meter(), Meter::new(3, 4));
        assert_eq!(context.ppq(), DEFAULT_PPQ);
        assert_eq!(context.phrase_start, 1000.0);
        assert!((context.ticks_per_phrase() - 1440.0 * 4.0).abs() < 1e-9);

        let bad = ContextOverrides {
            tempo: Some(-1.0),
            ..ContextOverrides::default()
        };
        assert!(TimingContext::new(&bad).is_err());
    }

    #[test]
    fn test_rejected_meter_leaves_context() {
        let mut context = TimingContext::default();
        assert!(context.set_meter(Meter::new(3, 0)).is_err());
        assert_eq!(context.meter(), Meter::COMMON_TIME);
    }

    #[test]
    fn test_advance_phrase_then_section() {
        let mut context = TimingContext::default();
        context.measures_per_phrase = 2;
        context.advance_phrase();
        context.advance_phrase();
        assert!((context.phrase_start - 7680.0).abs() < 1e-9);
        assert!((context.ticks_per_section - 7680.0).abs() < 1e-9);
        assert!((context.seconds_per_section - 8.0).abs() < 1e-9);
        assert_eq!(context.phrases_in_section, 2);

        context.advance_section();
        assert!((context.section_start - 7680.0).abs() < 1e-9);
        assert!((context.section_start_time - 8.0).abs() < 1e-9);
        assert!((context.section_end - 7680.0).abs() < 1e-9);
        assert_eq!(context.ticks_per_section, 0.0);
        assert_eq!(context.phrases_in_section, 0);
        assert_eq!(context.phrase_start, context.section_start);
    }

    #[test]
    fn test_frame_spans_match_indices() {
        let mut frame = Frame::new();
        let at = UnitIndices::phrase(0, 1);
        let span = Span::from_start(0.0, 1920.0, 0.0, 2.0);
        frame.remember_span(UnitType::Phrase, &at, span);
        assert_eq!(frame.span(UnitType::Phrase, &at), Some(span));
        // Deeper levels do not matter for the lookup
        assert_eq!(
            frame.span(UnitType::Phrase, &at.with(UnitType::Measure, 3)),
            Some(span)
        );
        assert_eq!(frame.span(UnitType::Phrase, &UnitIndices::phrase(0, 2)), None);

        frame.load("primary", &TimingContext::default());
        assert_eq!(frame.layer(), Some("primary"));
        assert_eq!(frame.span(UnitType::Phrase, &at), None);
    }
}
