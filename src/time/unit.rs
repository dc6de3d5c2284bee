//! Unit types, hierarchical positions and resolved spans.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// One level of the timing hierarchy, outermost first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnitType {
    Section,
    Phrase,
    Measure,
    Beat,
    Division,
    Subdivision,
    Subsubdivision,
}

impl UnitType {
    /// All unit types in hierarchy order.
    pub const ALL: [UnitType; 7] = [
        UnitType::Section,
        UnitType::Phrase,
        UnitType::Measure,
        UnitType::Beat,
        UnitType::Division,
        UnitType::Subdivision,
        UnitType::Subsubdivision,
    ];

    /// Zero-based depth in the hierarchy (section = 0).
    pub fn depth(self) -> usize {
        self as usize
    }

    /// The enclosing unit type, or `None` for sections.
    pub fn parent(self) -> Option<UnitType> {
        match self {
            UnitType::Section => None,
            other => Some(UnitType::ALL[other.depth() - 1]),
        }
    }

    /// Whether this unit's length is a projection that may grow when its
    /// last child turns out longer than expected.
    pub fn is_dynamically_sized(self) -> bool {
        matches!(self, UnitType::Section | UnitType::Phrase)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            UnitType::Section => "section",
            UnitType::Phrase => "phrase",
            UnitType::Measure => "measure",
            UnitType::Beat => "beat",
            UnitType::Division => "division",
            UnitType::Subdivision => "subdivision",
            UnitType::Subsubdivision => "subsubdivision",
        }
    }

    /// Capitalized label used in marker text.
    pub fn label(self) -> &'static str {
        match self {
            UnitType::Section => "Section",
            UnitType::Phrase => "Phrase",
            UnitType::Measure => "Measure",
            UnitType::Beat => "Beat",
            UnitType::Division => "Division",
            UnitType::Subdivision => "Subdivision",
            UnitType::Subsubdivision => "Subsubdivision",
        }
    }
}

impl fmt::Display for UnitType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for UnitType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lowered = s.trim().to_ascii_lowercase();
        UnitType::ALL
            .iter()
            .copied()
            .find(|unit| unit.as_str() == lowered)
            .ok_or_else(|| format!("unknown unit type: {s}"))
    }
}

/// Zero-based position of a unit at every level of the hierarchy.
///
/// Levels deeper than the unit being described are kept at zero so that two
/// positions of the same unit type compare equal exactly when they name the
/// same unit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UnitIndices {
    pub section: u32,
    pub phrase: u32,
    pub measure: u32,
    pub beat: u32,
    pub division: u32,
    pub subdivision: u32,
    pub subsubdivision: u32,
}

impl UnitIndices {
    /// Position of a section.
    pub fn section(section: u32) -> Self {
        Self {
            section,
            ..Self::default()
        }
    }

    /// Position of a phrase within a section.
    pub fn phrase(section: u32, phrase: u32) -> Self {
        Self {
            section,
            phrase,
            ..Self::default()
        }
    }

    /// Returns the index stored for `unit`.
    pub fn get(&self, unit: UnitType) -> u32 {
        match unit {
            UnitType::Section => self.section,
            UnitType::Phrase => self.phrase,
            UnitType::Measure => self.measure,
            UnitType::Beat => self.beat,
            UnitType::Division => self.division,
            UnitType::Subdivision => self.subdivision,
            UnitType::Subsubdivision => self.subsubdivision,
        }
    }

    /// Sets the index for `unit`.
    pub fn set(&mut self, unit: UnitType, index: u32) {
        match unit {
            UnitType::Section => self.section = index,
            UnitType::Phrase => self.phrase = index,
            UnitType::Measure => self.measure = index,
            UnitType::Beat => self.beat = index,
            UnitType::Division => self.division = index,
            UnitType::Subdivision => self.subdivision = index,
            UnitType::Subsubdivision => self.subsubdivision = index,
        }
    }

    /// Copy with `unit` set to `index` and every deeper level zeroed.
    pub fn with(&self, unit: UnitType, index: u32) -> Self {
        let mut next = self.truncated(unit);
        next.set(unit, index);
        next
    }

    /// Copy with every level deeper than `unit` zeroed.
    pub fn truncated(&self, unit: UnitType) -> Self {
        let mut next = *self;
        for deeper in UnitType::ALL.iter().skip(unit.depth() + 1) {
            next.set(*deeper, 0);
        }
        next
    }
}

impl fmt::Display for UnitIndices {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "s{}/p{}/m{}/b{}/d{}/sd{}/ssd{}",
            self.section,
            self.phrase,
            self.measure,
            self.beat,
            self.division,
            self.subdivision,
            self.subsubdivision
        )
    }
}

/// Sibling counts at each level, filled down to the level of the unit that
/// carries them.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitTotals {
    pub sections: Option<u32>,
    pub phrases: Option<u32>,
    pub measures: Option<u32>,
    pub beats: Option<u32>,
    pub divisions: Option<u32>,
    pub subdivisions: Option<u32>,
    pub subsubdivisions: Option<u32>,
}

impl UnitTotals {
    /// Number of siblings a unit of type `unit` has, if known.
    pub fn get(&self, unit: UnitType) -> Option<u32> {
        match unit {
            UnitType::Section => self.sections,
            UnitType::Phrase => self.phrases,
            UnitType::Measure => self.measures,
            UnitType::Beat => self.beats,
            UnitType::Division => self.divisions,
            UnitType::Subdivision => self.subdivisions,
            UnitType::Subsubdivision => self.subsubdivisions,
        }
    }

    pub fn set(&mut self, unit: UnitType, total: u32) {
        let slot = match unit {
            UnitType::Section => &mut self.sections,
            UnitType::Phrase => &mut self.phrases,
            UnitType::Measure => &mut self.measures,
            UnitType::Beat => &mut self.beats,
            UnitType::Division => &mut self.divisions,
            UnitType::Subdivision => &mut self.subdivisions,
            UnitType::Subsubdivision => &mut self.subsubdivisions,
        };
        *slot = Some(total);
    }

    /// Whether `indices` names the last of its siblings at `unit`.
    pub fn is_last(&self, unit: UnitType, indices: &UnitIndices) -> bool {
        self.get(unit)
            .is_some_and(|total| indices.get(unit) + 1 == total)
    }
}

/// Absolute tick and time interval of a unit.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Span {
    pub start_tick: f64,
    pub end_tick: f64,
    pub start_time: f64,
    pub end_time: f64,
}

impl Span {
    /// Builds a span from a start point and a length in both domains.
    pub fn from_start(start_tick: f64, ticks: f64, start_time: f64, seconds: f64) -> Self {
        Self {
            start_tick,
            end_tick: start_tick + ticks,
            start_time,
            end_time: start_time + seconds,
        }
    }

    pub fn ticks(&self) -> f64 {
        self.end_tick - self.start_tick
    }

    pub fn seconds(&self) -> f64 {
        self.end_time - self.start_time
    }

    /// Length of the tick interval shared with `other` (0 when disjoint).
    pub fn overlap_ticks(&self, other: &Span) -> f64 {
        (self.end_tick.min(other.end_tick) - self.start_tick.max(other.start_tick)).max(0.0)
    }

    /// Whether both tick bounds match within `epsilon`.
    pub fn same_ticks(&self, other: &Span, epsilon: f64) -> bool {
        (self.start_tick - other.start_tick).abs() <= epsilon
            && (self.end_tick - other.end_tick).abs() <= epsilon
    }

    pub fn contains_tick(&self, tick: f64) -> bool {
        tick >= self.start_tick && tick < self.end_tick
    }
}

impl fmt::Display for Span {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{:.3}, {:.3})", self.start_tick, self.end_tick)
    }
}
