//! Per-layer buffers of timing events bound for a MIDI file.

use super::format_time;
use super::meter::Meter;
use super::unit::{Span, UnitIndices, UnitTotals, UnitType};
use serde::{Deserialize, Serialize};

/// Priority of tempo events at a shared tick (lower sorts first).
pub const PRIORITY_TEMPO: u8 = 1;
/// Priority of time-signature events at a shared tick.
pub const PRIORITY_METER: u8 = 2;
/// Priority of marker events at a shared tick.
pub const PRIORITY_MARKER: u8 = 3;

/// A timing-related meta event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TimingEvent {
    /// Written tempo in quarter notes per minute.
    Tempo { bpm: f64 },
    /// Written (MIDI-compatible) time signature.
    Meter { numerator: u32, denominator: u32 },
    /// Free-text marker.
    Marker { text: String },
}

/// A timing event at an absolute tick.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimedEvent {
    pub tick: f64,
    /// Orders events that share a tick.
    pub priority: u8,
    pub event: TimingEvent,
}

impl TimedEvent {
    pub fn new(tick: f64, event: TimingEvent, priority: u8) -> Self {
        Self {
            tick,
            priority,
            event,
        }
    }
}

/// Output sink bound to a layer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EventBuffer {
    pub name: String,
    events: Vec<TimedEvent>,
}

impl EventBuffer {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            events: Vec::new(),
        }
    }

    pub fn push(&mut self, event: TimedEvent) {
        self.events.push(event);
    }

    /// Writes the tempo and meter a measure starts with.
    pub fn push_measure_timing(&mut self, tick: f64, midi_tempo: f64, midi_meter: Meter) {
        self.push(TimedEvent::new(
            tick,
            TimingEvent::Tempo { bpm: midi_tempo },
            PRIORITY_TEMPO,
        ));
        self.push(TimedEvent::new(
            tick,
            TimingEvent::Meter {
                numerator: midi_meter.numerator,
                denominator: midi_meter.denominator,
            },
            PRIORITY_METER,
        ));
    }

    pub fn push_marker(&mut self, tick: f64, text: String) {
        self.push(TimedEvent::new(
            tick,
            TimingEvent::Marker { text },
            PRIORITY_MARKER,
        ));
    }

    pub fn events(&self) -> &[TimedEvent] {
        &self.events
    }

    /// Events ordered by tick, then priority, then insertion.
    pub fn sorted_events(&self) -> Vec<TimedEvent> {
        let mut events = self.events.clone();
        events.sort_by(|a, b| {
            a.tick
                .total_cmp(&b.tick)
                .then(a.priority.cmp(&b.priority))
        });
        events
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

/// Marker text for a resolved unit.
///
/// Looks like `Measure 2/4 Length: 0:02.0000 (0:02.0000 - 0:04.0000) endTick: 3840`.
/// Sections, phrases and measures in a spoofed meter also name both meters.
pub fn unit_marker(
    unit: UnitType,
    indices: &UnitIndices,
    totals: &UnitTotals,
    span: &Span,
    meter: Meter,
    midi_meter: Meter,
) -> String {
    let position = indices.get(unit) + 1;
    let count = match totals.get(unit) {
        Some(total) => format!("{position}/{total}"),
        None => position.to_string(),
    };
    let mut text = format!(
        "{} {} Length: {} ({} - {}) endTick: {}",
        unit.label(),
        count,
        format_time(span.seconds()),
        format_time(span.start_time),
        format_time(span.end_time),
        span.end_tick.round() as u64
    );
    if unit <= UnitType::Measure && meter != midi_meter {
        text.push_str(&format!(" meter: {meter} (written {midi_meter})"));
    }
    text
}
