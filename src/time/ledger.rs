//! Append-only record of every resolved unit.

use super::meter::Meter;
use super::unit::{Span, UnitIndices, UnitTotals, UnitType};
use super::TICK_EPSILON;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A resolved unit as it was committed to a layer's ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnitRecord {
    pub layer: String,
    pub unit: UnitType,
    pub indices: UnitIndices,
    pub totals: UnitTotals,
    pub span: Span,
    /// Meter in force when the unit was resolved.
    pub meter: Meter,
    /// Meter written to MIDI for that meter.
    pub midi_meter: Meter,
    pub ticks_per_second: f64,
}

fn parent_position(unit: UnitType, indices: &UnitIndices) -> UnitIndices {
    match unit.parent() {
        Some(parent) => indices.truncated(parent),
        None => UnitIndices::default(),
    }
}

/// Per-layer ledger of resolved units.
///
/// Records are kept in resolution order. Two side indexes keep the overlap
/// check proportional to the number of siblings rather than the whole run.
#[derive(Debug, Clone, Default)]
pub struct UnitLedger {
    records: Vec<UnitRecord>,
    by_position: HashMap<(UnitType, UnitIndices), usize>,
    by_parent: HashMap<(UnitType, UnitIndices), Vec<usize>>,
}

impl UnitLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a record and returns its position in the ledger.
    pub fn append(&mut self, record: UnitRecord) -> usize {
        let index = self.records.len();
        let position = record.indices.truncated(record.unit);
        self.by_position.insert((record.unit, position), index);
        self.by_parent
            .entry((record.unit, parent_position(record.unit, &position)))
            .or_default()
            .push(index);
        self.records.push(record);
        index
    }

    /// The most recent record for `unit` at `indices`.
    pub fn find(&self, unit: UnitType, indices: &UnitIndices) -> Option<&UnitRecord> {
        self.by_position
            .get(&(unit, indices.truncated(unit)))
            .map(|&i| &self.records[i])
    }

    /// Siblings of `unit` at `indices` whose tick span overlaps `span`.
    ///
    /// Only units of the same type under the same parent are considered;
    /// touching endpoints and float noise do not count as overlap.
    pub fn find_overlapping(
        &self,
        unit: UnitType,
        indices: &UnitIndices,
        span: &Span,
    ) -> Vec<&UnitRecord> {
        let key = (unit, parent_position(unit, indices));
        self.by_parent
            .get(&key)
            .map(|siblings| {
                siblings
                    .iter()
                    .map(|&i| &self.records[i])
                    .filter(|record| record.span.overlap_ticks(span) > TICK_EPSILON)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// The innermost unit containing `tick`.
    ///
    /// Prefers the smallest span; equal spans go to the deeper unit type and
    /// then to the later record.
    pub fn find_containing(&self, tick: f64) -> Option<&UnitRecord> {
        let mut best: Option<&UnitRecord> = None;
        for record in self.records.iter().filter(|r| r.span.contains_tick(tick)) {
            best = match best {
                None => Some(record),
                Some(current) => {
                    let (len, current_len) = (record.span.ticks(), current.span.ticks());
                    if len < current_len - TICK_EPSILON
                        || ((len - current_len).abs() <= TICK_EPSILON
                            && record.unit >= current.unit)
                    {
                        Some(record)
                    } else {
                        Some(current)
                    }
                }
            };
        }
        best
    }

    /// Moves the end of a recorded unit and returns its previous span.
    pub fn extend_end(
        &mut self,
        unit: UnitType,
        indices: &UnitIndices,
        end_tick: f64,
        end_time: f64,
    ) -> Option<Span> {
        let index = *self.by_position.get(&(unit, indices.truncated(unit)))?;
        let record = &mut self.records[index];
        let previous = record.span;
        record.span.end_tick = record.span.end_tick.max(end_tick);
        record.span.end_time = record.span.end_time.max(end_time);
        Some(previous)
    }

    /// The last `count` records, oldest first.
    pub fn recent(&self, count: usize) -> &[UnitRecord] {
        let start = self.records.len().saturating_sub(count);
        &self.records[start..]
    }

    pub fn records(&self) -> &[UnitRecord] {
        &self.records
    }

    pub fn iter(&self) -> impl Iterator<Item = &UnitRecord> {
        self.records.iter()
    }

    /// Records of a single unit type in resolution order.
    pub fn of_type(&self, unit: UnitType) -> impl Iterator<Item = &UnitRecord> {
        self.records.iter().filter(move |r| r.unit == unit)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn clear(&mut self) {
        self.records.clear();
        self.by_position.clear();
        self.by_parent.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(unit: UnitType, indices: UnitIndices, start: f64, ticks: f64) -> UnitRecord {
        UnitRecord {
            layer: "primary".to_string(),
            unit,
            indices,
            totals: UnitTotals::default(),
            span: Span::from_start(start, ticks, start / 960.0, ticks / 960.0),
            meter: Meter::COMMON_TIME,
            midi_meter: Meter::COMMON_TIME,
            ticks_per_second: 960.0,
        }
    }

    #[test]
    fn test_overlap_limited_to_same_parent() {
        let mut ledger = UnitLedger::new();
        let phrase0 = UnitIndices::phrase(0, 0);
        let phrase1 = UnitIndices::phrase(0, 1);
        ledger.append(record(UnitType::Measure, phrase0.with(UnitType::Measure, 0), 0.0, 1920.0));
        ledger.append(record(UnitType::Measure, phrase1.with(UnitType::Measure, 0), 0.0, 1920.0));

        let probe = Span::from_start(960.0, 1920.0, 1.0, 2.0);
        let hits = ledger.find_overlapping(UnitType::Measure, &phrase0.with(UnitType::Measure, 1), &probe);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].indices.phrase, 0);

        // Beats never collide with measures
        let beats = ledger.find_overlapping(UnitType::Beat, &phrase0.with(UnitType::Beat, 0), &probe);
        assert!(beats.is_empty());
    }

    #[test]
    fn test_touching_spans_do_not_overlap() {
        let mut ledger = UnitLedger::new();
        let phrase = UnitIndices::phrase(0, 0);
        ledger.append(record(UnitType::Measure, phrase.with(UnitType::Measure, 0), 0.0, 1920.0));
        let next = Span::from_start(1920.0 - 1e-9, 1920.0, 2.0, 2.0);
        assert!(ledger
            .find_overlapping(UnitType::Measure, &phrase.with(UnitType::Measure, 1), &next)
            .is_empty());
    }

    #[test]
    fn test_find_containing_prefers_smallest() {
        let mut ledger = UnitLedger::new();
        let phrase = UnitIndices::phrase(0, 0);
        let measure = phrase.with(UnitType::Measure, 0);
        ledger.append(record(UnitType::Phrase, phrase, 0.0, 3840.0));
        ledger.append(record(UnitType::Measure, measure, 0.0, 1920.0));
        ledger.append(record(UnitType::Beat, measure.with(UnitType::Beat, 1), 480.0, 480.0));
        // A single-division beat has the same span as its division
        ledger.append(record(
            UnitType::Division,
            measure.with(UnitType::Beat, 1).with(UnitType::Division, 0),
            480.0,
            480.0,
        ));

        assert_eq!(ledger.find_containing(600.0).map(|r| r.unit), Some(UnitType::Division));
        assert_eq!(ledger.find_containing(100.0).map(|r| r.unit), Some(UnitType::Measure));
        assert_eq!(ledger.find_containing(3000.0).map(|r| r.unit), Some(UnitType::Phrase));
        assert!(ledger.find_containing(4000.0).is_none());
    }

    #[test]
    fn test_extend_end_and_recent() {
        let mut ledger = UnitLedger::new();
        let section = UnitIndices::section(0);
        ledger.append(record(UnitType::Section, section, 0.0, 3840.0));
        ledger.append(record(UnitType::Phrase, UnitIndices::phrase(0, 0), 0.0, 1920.0));

        let previous = ledger
            .extend_end(UnitType::Section, &section, 5760.0, 6.0)
            .unwrap();
        assert_eq!(previous.end_tick, 3840.0);
        assert_eq!(ledger.find(UnitType::Section, &section).unwrap().span.end_tick, 5760.0);
        assert!(ledger
            .extend_end(UnitType::Section, &UnitIndices::section(3), 1.0, 1.0)
            .is_none());

        assert_eq!(ledger.recent(1)[0].unit, UnitType::Phrase);
        assert_eq!(ledger.recent(10).len(), 2);
    }
}
