//! Append-only diagnostic records.
//!
//! Entries describe what the resolver did (units resolved, parents
//! reconstructed or extended, overlaps tolerated) in a form that can be
//! written out and inspected after a run. Nothing reads them back to make
//! decisions.

use crate::time::cache::BranchKey;
use crate::time::unit::{Span, UnitIndices, UnitType};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::Path;
use tracing::{debug, trace, warn};

/// Diagnostic stream an entry belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiagnosticCategory {
    /// Per-unit resolution traces.
    IndexTrace,
    /// Branching factors as they are frozen, parent reconstruction,
    /// reconciliation and anchor drift.
    BoundaryDebug,
    /// Tolerated overlaps and suppressed duplicates.
    OverlapDiagnostic,
}

impl DiagnosticCategory {
    pub const ALL: [DiagnosticCategory; 3] = [
        DiagnosticCategory::IndexTrace,
        DiagnosticCategory::BoundaryDebug,
        DiagnosticCategory::OverlapDiagnostic,
    ];

    /// Categories recorded unless configured otherwise.
    pub const DEFAULT: [DiagnosticCategory; 2] = [
        DiagnosticCategory::BoundaryDebug,
        DiagnosticCategory::OverlapDiagnostic,
    ];

    /// NDJSON file the category is written to.
    pub fn file_name(self) -> &'static str {
        match self {
            DiagnosticCategory::IndexTrace => "index-traces.ndjson",
            DiagnosticCategory::BoundaryDebug => "boundary-debug.ndjson",
            DiagnosticCategory::OverlapDiagnostic => "overlap-diagnostics.ndjson",
        }
    }
}

/// What happened.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum DiagnosticEvent {
    UnitResolved {
        span: Span,
    },
    CachePopulated {
        key: BranchKey,
        raw: Option<u32>,
        value: u32,
    },
    /// A parent span was missing and had to be derived from anchors.
    ParentReconstructed {
        parent: UnitType,
        span: Span,
    },
    /// A dynamically sized parent grew to fit its last child.
    ParentExtended {
        parent: UnitType,
        parent_indices: UnitIndices,
        previous_end_tick: f64,
        end_tick: f64,
    },
    /// The phrase anchor disagrees with `index * ticks_per_phrase`.
    PhraseAnchorDrift {
        anchor_tick: f64,
        uniform_tick: f64,
    },
    OverlapTolerated {
        other: UnitIndices,
        overlap_ticks: f64,
    },
    DuplicateSuppressed {
        span: Span,
    },
}

impl DiagnosticEvent {
    pub fn category(&self) -> DiagnosticCategory {
        match self {
            DiagnosticEvent::UnitResolved { .. } => DiagnosticCategory::IndexTrace,
            DiagnosticEvent::CachePopulated { .. }
            | DiagnosticEvent::ParentReconstructed { .. }
            | DiagnosticEvent::ParentExtended { .. }
            | DiagnosticEvent::PhraseAnchorDrift { .. } => DiagnosticCategory::BoundaryDebug,
            DiagnosticEvent::OverlapTolerated { .. }
            | DiagnosticEvent::DuplicateSuppressed { .. } => DiagnosticCategory::OverlapDiagnostic,
        }
    }
}

/// One diagnostic record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiagnosticEntry {
    /// Position in the log, across all categories.
    pub seq: u64,
    pub category: DiagnosticCategory,
    pub layer: String,
    pub unit: UnitType,
    pub indices: UnitIndices,
    #[serde(flatten)]
    pub event: DiagnosticEvent,
}

/// Append-only log gated by category.
#[derive(Debug, Clone)]
pub struct DiagnosticLog {
    enabled: BTreeSet<DiagnosticCategory>,
    entries: Vec<DiagnosticEntry>,
    next_seq: u64,
}

impl Default for DiagnosticLog {
    fn default() -> Self {
        Self::with_categories(DiagnosticCategory::DEFAULT)
    }
}

impl DiagnosticLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// A log recording only `categories`.
    pub fn with_categories(categories: impl IntoIterator<Item = DiagnosticCategory>) -> Self {
        Self {
            enabled: categories.into_iter().collect(),
            entries: Vec::new(),
            next_seq: 0,
        }
    }

    pub fn is_enabled(&self, category: DiagnosticCategory) -> bool {
        self.enabled.contains(&category)
    }

    /// Records an event and mirrors it to `tracing`.
    ///
    /// Events in disabled categories are still traced but not stored.
    pub fn record(&mut self, layer: &str, unit: UnitType, indices: UnitIndices, event: DiagnosticEvent) {
        let category = event.category();
        match &event {
            DiagnosticEvent::ParentExtended {
                parent,
                previous_end_tick,
                end_tick,
                ..
            } => warn!(
                layer,
                %unit,
                %indices,
                %parent,
                previous_end_tick,
                end_tick,
                "Extended parent to fit last child"
            ),
            DiagnosticEvent::OverlapTolerated { overlap_ticks, .. } => warn!(
                layer,
                %unit,
                %indices,
                overlap_ticks,
                "Tolerated overlap"
            ),
            DiagnosticEvent::UnitResolved { .. } => {
                trace!(layer, %unit, %indices, ?event, "Index trace")
            }
            other => debug!(layer, %unit, %indices, event = ?other, "Boundary diagnostic"),
        }

        if !self.is_enabled(category) {
            return;
        }
        self.entries.push(DiagnosticEntry {
            seq: self.next_seq,
            category,
            layer: layer.to_string(),
            unit,
            indices,
            event,
        });
        self.next_seq += 1;
    }

    pub fn entries(&self) -> &[DiagnosticEntry] {
        &self.entries
    }

    pub fn by_category(&self, category: DiagnosticCategory) -> impl Iterator<Item = &DiagnosticEntry> {
        self.entries.iter().filter(move |e| e.category == category)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Writes one NDJSON file per enabled category into `dir`.
    ///
    /// # Errors
    ///
    /// Returns error if the directory cannot be created or a file cannot be
    /// written.
    pub fn write_ndjson<P: AsRef<Path>>(&self, dir: P) -> std::io::Result<()> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir)?;
        for category in &self.enabled {
            let file = File::create(dir.join(category.file_name()))?;
            let mut writer = BufWriter::new(file);
            for entry in self.by_category(*category) {
                serde_json::to_writer(&mut writer, entry)
                    .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
                writer.write_all(b"\n")?;
            }
            writer.flush()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::cache::BranchKind;

    fn extended() -> DiagnosticEvent {
        DiagnosticEvent::ParentExtended {
            parent: UnitType::Section,
            parent_indices: UnitIndices::section(0),
            previous_end_tick: 3840.0,
            end_tick: 5760.0,
        }
    }

    #[test]
    fn test_gating() {
        let mut log = DiagnosticLog::new();
        let span = Span::from_start(0.0, 480.0, 0.0, 0.5);
        log.record("primary", UnitType::Beat, UnitIndices::default(), DiagnosticEvent::UnitResolved { span });
        log.record("primary", UnitType::Phrase, UnitIndices::phrase(0, 1), extended());
        assert_eq!(log.len(), 1);
        assert_eq!(log.entries()[0].category, DiagnosticCategory::BoundaryDebug);

        // Frozen branching factors are kept by default
        let key = BranchKey::new(BranchKind::Divisions, &UnitIndices::default());
        log.record(
            "primary",
            UnitType::Beat,
            UnitIndices::default(),
            DiagnosticEvent::CachePopulated { key, raw: Some(3), value: 3 },
        );
        assert_eq!(log.len(), 2);
        assert_eq!(log.entries()[1].category, DiagnosticCategory::BoundaryDebug);

        let mut everything = DiagnosticLog::with_categories(DiagnosticCategory::ALL);
        everything.record("primary", UnitType::Beat, UnitIndices::default(), DiagnosticEvent::UnitResolved { span });
        assert_eq!(everything.by_category(DiagnosticCategory::IndexTrace).count(), 1);
    }

    #[test]
    fn test_write_ndjson() {
        let dir = tempfile::tempdir().unwrap();
        let mut log = DiagnosticLog::new();
        log.record("poly", UnitType::Phrase, UnitIndices::phrase(0, 1), extended());
        log.record(
            "poly",
            UnitType::Measure,
            UnitIndices::phrase(0, 1).with(UnitType::Measure, 1),
            DiagnosticEvent::OverlapTolerated {
                other: UnitIndices::phrase(0, 1),
                overlap_ticks: 0.5,
            },
        );
        log.write_ndjson(dir.path()).unwrap();

        let boundary = fs::read_to_string(dir.path().join("boundary-debug.ndjson")).unwrap();
        let lines: Vec<&str> = boundary.lines().collect();
        assert_eq!(lines.len(), 1);
        let entry: DiagnosticEntry = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(entry.layer, "poly");
        assert_eq!(entry.event, extended());

        let overlaps = fs::read_to_string(dir.path().join("overlap-diagnostics.ndjson")).unwrap();
        assert!(overlaps.contains("\"event\":\"overlap_tolerated\""));
        assert!(!dir.path().join("index-traces.ndjson").exists());
    }
}
