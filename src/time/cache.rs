//! Write-once cache of branching factors.
//!
//! Composers are free to answer "how many divisions does this beat have?"
//! differently every time they are asked. The resolver asks several times for
//! the same parent (once to size the children, again for every child), so the
//! first answer for a position is frozen here and every later lookup sees it.

use super::unit::{UnitIndices, UnitType};
use crate::error::{Result, TimingError};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Largest number of divisions per beat.
pub const MAX_DIVISIONS: u32 = 8;
/// Largest number of subdivisions per division.
pub const MAX_SUBDIVISIONS: u32 = 8;
/// Largest number of sub-subdivisions per subdivision.
pub const MAX_SUBSUBDIVISIONS: u32 = 4;

/// Which branching factor a cache entry holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BranchKind {
    /// Divisions per beat.
    Divisions,
    /// Subdivisions per division.
    Subdivisions,
    /// Sub-subdivisions per subdivision.
    Subsubdivisions,
}

impl BranchKind {
    /// The unit whose children this factor counts.
    pub fn owner(self) -> UnitType {
        match self {
            BranchKind::Divisions => UnitType::Beat,
            BranchKind::Subdivisions => UnitType::Division,
            BranchKind::Subsubdivisions => UnitType::Subdivision,
        }
    }

    /// The factor counting the children of `unit`, if it has branched children.
    pub fn owned_by(unit: UnitType) -> Option<BranchKind> {
        match unit {
            UnitType::Beat => Some(BranchKind::Divisions),
            UnitType::Division => Some(BranchKind::Subdivisions),
            UnitType::Subdivision => Some(BranchKind::Subsubdivisions),
            _ => None,
        }
    }

    /// The factor that counts units of type `unit`, if it is branched.
    pub fn counting(unit: UnitType) -> Option<BranchKind> {
        match unit {
            UnitType::Division => Some(BranchKind::Divisions),
            UnitType::Subdivision => Some(BranchKind::Subdivisions),
            UnitType::Subsubdivision => Some(BranchKind::Subsubdivisions),
            _ => None,
        }
    }

    /// Upper clamp applied to composer answers.
    pub fn ceiling(self) -> u32 {
        match self {
            BranchKind::Divisions => MAX_DIVISIONS,
            BranchKind::Subdivisions => MAX_SUBDIVISIONS,
            BranchKind::Subsubdivisions => MAX_SUBSUBDIVISIONS,
        }
    }

    /// Clamps a raw composer answer into `1..=ceiling`.
    pub fn clamp(self, raw: u32) -> u32 {
        raw.clamp(1, self.ceiling())
    }
}

impl fmt::Display for BranchKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            BranchKind::Divisions => "divisions",
            BranchKind::Subdivisions => "subdivisions",
            BranchKind::Subsubdivisions => "subsubdivisions",
        })
    }
}

/// Identity of a branching question: the kind plus the full position of the
/// unit being split.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BranchKey {
    pub kind: BranchKind,
    pub position: UnitIndices,
}

impl BranchKey {
    /// Key for `kind` at `indices`, keeping only the levels down to the owner.
    pub fn new(kind: BranchKind, indices: &UnitIndices) -> Self {
        Self {
            kind,
            position: indices.truncated(kind.owner()),
        }
    }
}

impl fmt::Display for BranchKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} of {} {}", self.kind, self.kind.owner(), self.position)
    }
}

/// Outcome of a cache lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheLookup {
    /// The frozen, clamped factor.
    pub value: u32,
    /// What the supplier returned when this lookup populated the entry.
    pub raw: Option<u32>,
    /// Whether this lookup created the entry.
    pub populated: bool,
}

/// Write-once map from branch key to branching factor.
#[derive(Debug, Clone, Default)]
pub struct BranchingCache {
    entries: HashMap<BranchKey, u32>,
}

impl BranchingCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the cached factor for `key`, asking `supplier` only if there is
    /// none yet.
    ///
    /// The supplier returns `None` when no composer is attached. Divisions
    /// then default to a single division per beat; any other kind fails.
    ///
    /// # Errors
    ///
    /// `MissingBranchingFactor` if nothing is cached, the supplier has no
    /// answer, and the key is not a beat-level divisions key.
    pub fn get_or_compute<F>(&mut self, key: BranchKey, supplier: F) -> Result<CacheLookup>
    where
        F: FnOnce() -> Option<u32>,
    {
        if let Some(&value) = self.entries.get(&key) {
            return Ok(CacheLookup {
                value,
                raw: None,
                populated: false,
            });
        }

        let raw = supplier();
        let value = match (raw, key.kind) {
            (Some(raw), kind) => kind.clamp(raw),
            (None, BranchKind::Divisions) => 1,
            (None, _) => return Err(TimingError::MissingBranchingFactor { key }),
        };
        self.entries.insert(key, value);
        Ok(CacheLookup {
            value,
            raw,
            populated: true,
        })
    }

    /// Cached factor for `key` without populating.
    pub fn peek(&self, key: &BranchKey) -> Option<u32> {
        self.entries.get(key).copied()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn beat_key() -> BranchKey {
        let indices = UnitIndices::phrase(0, 1)
            .with(UnitType::Measure, 2)
            .with(UnitType::Beat, 3);
        BranchKey::new(BranchKind::Divisions, &indices)
    }

    #[test]
    fn test_first_answer_is_frozen() {
        let mut cache = BranchingCache::new();
        let key = beat_key();
        let mut answers = [3u32, 5, 2].into_iter();

        let first = cache
            .get_or_compute(key, || answers.next())
            .unwrap();
        assert!(first.populated);
        assert_eq!(first.value, 3);

        for _ in 0..2 {
            let again = cache.get_or_compute(key, || answers.next()).unwrap();
            assert!(!again.populated);
            assert_eq!(again.value, 3);
        }
        // The supplier was consulted exactly once
        assert_eq!(answers.next(), Some(5));
    }

    #[test]
    fn test_clamps_raw_answers() {
        let mut cache = BranchingCache::new();
        let key = beat_key();
        let zero = cache.get_or_compute(key, || Some(0)).unwrap();
        assert_eq!(zero.value, 1);
        assert_eq!(zero.raw, Some(0));

        let sub = BranchKey::new(BranchKind::Subsubdivisions, &key.position);
        assert_eq!(cache.get_or_compute(sub, || Some(40)).unwrap().value, 4);
        let div = BranchKey::new(BranchKind::Subdivisions, &key.position);
        assert_eq!(cache.get_or_compute(div, || Some(40)).unwrap().value, 8);
    }

    #[test]
    fn test_missing_supplier() {
        let mut cache = BranchingCache::new();
        let key = beat_key();
        // Beat-level divisions fall back to one division
        assert_eq!(cache.get_or_compute(key, || None).unwrap().value, 1);

        let sub = BranchKey::new(BranchKind::Subdivisions, &key.position);
        let err = cache.get_or_compute(sub, || None).unwrap_err();
        assert!(matches!(err, TimingError::MissingBranchingFactor { .. }));
        assert!(cache.peek(&sub).is_none());
    }

    #[test]
    fn test_keys_include_phrase_position() {
        let a = UnitIndices::phrase(0, 0).with(UnitType::Measure, 1);
        let b = UnitIndices::phrase(0, 1).with(UnitType::Measure, 1);
        let key_a = BranchKey::new(BranchKind::Divisions, &a);
        let key_b = BranchKey::new(BranchKind::Divisions, &b);
        assert_ne!(key_a, key_b);

        // Levels below the owner do not split keys
        let deep = a.with(UnitType::Beat, 0).with(UnitType::Division, 2);
        assert_eq!(BranchKey::new(BranchKind::Divisions, &deep), key_a);

        let mut cache = BranchingCache::new();
        cache.get_or_compute(key_a, || Some(2)).unwrap();
        cache.clear();
        assert!(cache.is_empty());
    }
}
