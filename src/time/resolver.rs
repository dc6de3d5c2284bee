//! Cascading unit-timing resolver.
//!
//! Resolving a unit turns a hierarchical position (section 2, phrase 1,
//! measure 3, beat 0, ...) into an absolute tick and time span for the active
//! layer. Every unit is placed relative to its parent's span, checked for
//! containment within that parent and for overlap with its siblings, and then
//! committed to the layer's ledger.
//!
//! Parent spans are looked up in three places, in order: the frame's last
//! resolved span for that level, the layer's ledger, and finally a top-down
//! derivation from the context anchors when neither has it. Derived spans are
//! never remembered, since the anchors they come from keep moving.

use super::cache::{BranchKey, BranchKind};
use super::context::Frame;
use super::layer::Layer;
use super::ledger::UnitRecord;
use super::sink::unit_marker;
use super::unit::{Span, UnitIndices, UnitTotals, UnitType};
use super::{ticks_to_seconds, TICK_EPSILON};
use crate::composer::Composer;
use crate::diagnostics::{DiagnosticEvent, DiagnosticLog};
use crate::error::{ErrorContext, Result, TimingError};
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Ledger entries attached to a failure payload.
const RECENT_ENTRIES: usize = 8;

/// Knobs for boundary checking and output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolverSettings {
    /// Containment slack and largest overlap tolerated between siblings.
    pub tolerance_ticks: f64,
    /// A sub-subdivision fails when it is not this many times shorter than
    /// both its subdivision and the measure. `None` disables the check.
    pub overlong_ratio: Option<f64>,
    /// Substitute 1 for missing totals instead of failing.
    pub bounded: bool,
    /// Unit types that write a marker at their end tick.
    pub marker_units: Vec<UnitType>,
}

impl Default for ResolverSettings {
    fn default() -> Self {
        Self {
            tolerance_ticks: 1.0,
            overlong_ratio: Some(1.5),
            bounded: false,
            marker_units: vec![UnitType::Section, UnitType::Phrase, UnitType::Measure],
        }
    }
}

/// A single resolution pass over the active layer.
pub struct Resolver<'a> {
    frame: &'a mut Frame,
    layer: &'a mut Layer,
    composer: Option<&'a mut dyn Composer>,
    diagnostics: &'a mut DiagnosticLog,
    settings: &'a ResolverSettings,
}

impl<'a> Resolver<'a> {
    pub fn new(
        frame: &'a mut Frame,
        layer: &'a mut Layer,
        composer: Option<&'a mut dyn Composer>,
        diagnostics: &'a mut DiagnosticLog,
        settings: &'a ResolverSettings,
    ) -> Self {
        Self {
            frame,
            layer,
            composer,
            diagnostics,
            settings,
        }
    }

    /// Resolves `unit` at `indices` and commits it to the layer's ledger.
    ///
    /// Re-resolving a unit that is already recorded with the same span returns
    /// the existing record without appending or emitting events again.
    ///
    /// # Errors
    ///
    /// Any failure is returned as [`TimingError::Resolution`] carrying the
    /// layer, position, timing snapshot and recent ledger entries.
    pub fn resolve(&mut self, unit: UnitType, indices: UnitIndices) -> Result<UnitRecord> {
        self.frame.indices = indices.truncated(unit);
        match self.resolve_unit(unit) {
            Ok(record) => Ok(record),
            Err(err) => Err(err.with_context(self.error_context(unit))),
        }
    }

    fn resolve_unit(&mut self, unit: UnitType) -> Result<UnitRecord> {
        let indices = self.frame.indices;
        let ticks_per_second = self.frame.timing.sync().ticks_per_second;
        if !ticks_per_second.is_finite() || ticks_per_second <= 0.0 {
            return Err(TimingError::InvalidTempo {
                tempo: self.frame.timing.tempo(),
            });
        }
        if self.frame.timing.measures_per_phrase == 0 {
            if !self.settings.bounded {
                return Err(TimingError::MissingTotal {
                    unit,
                    total: "measures per phrase",
                });
            }
            debug!(%unit, "Bounded mode: using one measure per phrase");
            self.frame.timing.measures_per_phrase = 1;
        }

        let totals = self.totals_for(unit, &indices)?;
        let parent = match unit.parent() {
            Some(parent_unit) => Some((parent_unit, self.parent_span(parent_unit, &indices)?)),
            None => None,
        };
        let span = match parent {
            Some((_, parent_span)) => self.child_span(unit, &indices, parent_span)?,
            None => self.section_span()?,
        };

        if unit == UnitType::Phrase {
            self.check_phrase_anchor(&indices, &span);
        }
        if let Some((parent_unit, parent_span)) = parent {
            self.check_containment(unit, &indices, &totals, &span, parent_unit, parent_span)?;
            if unit == UnitType::Subsubdivision {
                self.check_overlong(&span, &parent_span)?;
            }
        }

        let existing = self.check_overlap(unit, &indices, &span)?;
        // Nothing is committed until the next level's branching factor is known
        if let Some(kind) = BranchKind::owned_by(unit) {
            self.branching_factor(kind, &indices)?;
        }
        if let Some(existing) = existing {
            self.note(unit, indices, DiagnosticEvent::DuplicateSuppressed { span });
            self.after_commit(&existing, false);
            return Ok(existing);
        }

        let sync = self.frame.timing.sync();
        let record = UnitRecord {
            layer: self.layer.name.clone(),
            unit,
            indices,
            totals,
            span,
            meter: sync.meter,
            midi_meter: sync.midi_meter,
            ticks_per_second,
        };
        self.layer.ledger.append(record.clone());
        self.note(unit, indices, DiagnosticEvent::UnitResolved { span });
        self.after_commit(&record, true);
        Ok(record)
    }

    /// Sibling counts from the section level down to `unit`.
    fn totals_for(&mut self, unit: UnitType, indices: &UnitIndices) -> Result<UnitTotals> {
        let mut totals = UnitTotals::default();
        for level in UnitType::ALL.iter().take(unit.depth() + 1).copied() {
            let total = match level {
                UnitType::Section => self.required(unit, self.frame.totals.sections, "sections")?,
                UnitType::Phrase => self.required(
                    unit,
                    self.frame.totals.phrases_per_section,
                    "phrases per section",
                )?,
                UnitType::Measure => self.frame.timing.measures_per_phrase,
                UnitType::Beat => self.frame.timing.meter().numerator,
                other => match BranchKind::counting(other) {
                    Some(kind) => self.branching_factor(kind, indices)?,
                    None => 1,
                },
            };
            totals.set(level, total);
        }
        Ok(totals)
    }

    fn required(&self, unit: UnitType, value: Option<u32>, total: &'static str) -> Result<u32> {
        match value {
            Some(value) if value > 0 => Ok(value),
            _ if self.settings.bounded => Ok(1),
            _ => Err(TimingError::MissingTotal { unit, total }),
        }
    }

    /// Frozen branching factor for `kind` at `indices`, asking the composer
    /// the first time.
    fn branching_factor(&mut self, kind: BranchKind, indices: &UnitIndices) -> Result<u32> {
        let key = BranchKey::new(kind, indices);
        let composer = self.composer.as_deref_mut();
        let lookup = self.layer.cache.get_or_compute(key, || {
            composer.map(|composer| match kind {
                BranchKind::Divisions => composer.get_divisions(),
                BranchKind::Subdivisions => composer.get_subdivisions(),
                BranchKind::Subsubdivisions => composer.get_subsubdivisions(),
            })
        })?;
        if lookup.populated {
            self.note(
                kind.owner(),
                key.position,
                DiagnosticEvent::CachePopulated {
                    key,
                    raw: lookup.raw,
                    value: lookup.value,
                },
            );
        }
        Ok(lookup.value)
    }

    /// Span of the parent level, from the frame, the ledger, or derived.
    fn parent_span(&mut self, parent: UnitType, indices: &UnitIndices) -> Result<Span> {
        if let Some(span) = self.frame.span(parent, indices) {
            return Ok(span);
        }
        if let Some(record) = self.layer.ledger.find(parent, indices) {
            let span = record.span;
            self.frame.remember_span(parent, indices, span);
            return Ok(span);
        }

        let span = match parent.parent() {
            Some(grandparent) => {
                let outer = self.parent_span(grandparent, indices)?;
                self.child_span(parent, indices, outer)?
            }
            None => self.section_span()?,
        };
        self.note(
            parent,
            indices.truncated(parent),
            DiagnosticEvent::ParentReconstructed { parent, span },
        );
        Ok(span)
    }

    /// Current section: its accumulated phrases plus the phrases still to
    /// come at the current phrase length.
    fn section_span(&self) -> Result<Span> {
        let timing = &self.frame.timing;
        let phrases = self.required(
            UnitType::Section,
            self.frame.totals.phrases_per_section,
            "phrases per section",
        )?;
        let remaining = phrases.saturating_sub(timing.phrases_in_section) as f64;
        Ok(Span::from_start(
            timing.section_start,
            timing.ticks_per_section + remaining * timing.ticks_per_phrase(),
            timing.section_start_time,
            timing.seconds_per_section + remaining * timing.seconds_per_phrase(),
        ))
    }

    /// Span of a phrase or finer unit placed inside `parent`.
    fn child_span(&mut self, unit: UnitType, indices: &UnitIndices, parent: Span) -> Result<Span> {
        let timing = &self.frame.timing;
        let ticks_per_second = timing.sync().ticks_per_second;
        if unit == UnitType::Phrase {
            return Ok(Span::from_start(
                timing.phrase_start,
                timing.ticks_per_phrase(),
                timing.phrase_start_time,
                timing.seconds_per_phrase(),
            ));
        }

        let ticks = self.unit_ticks(unit, indices)?;
        let offset = indices.get(unit) as f64 * ticks;
        Ok(Span::from_start(
            parent.start_tick + offset,
            ticks,
            parent.start_time + ticks_to_seconds(offset, ticks_per_second),
            ticks_to_seconds(ticks, ticks_per_second),
        ))
    }

    /// Nominal length of one unit at `indices`.
    fn unit_ticks(&mut self, unit: UnitType, indices: &UnitIndices) -> Result<f64> {
        let timing = &self.frame.timing;
        match unit {
            UnitType::Section | UnitType::Phrase => Ok(timing.ticks_per_phrase()),
            UnitType::Measure => Ok(timing.ticks_per_measure()),
            UnitType::Beat => Ok(timing.ticks_per_measure() / timing.meter().numerator as f64),
            UnitType::Division => {
                let count = self.branching_factor(BranchKind::Divisions, indices)?;
                Ok(self.unit_ticks(UnitType::Beat, indices)? / count as f64)
            }
            UnitType::Subdivision => {
                let count = self.branching_factor(BranchKind::Subdivisions, indices)?;
                Ok(self.unit_ticks(UnitType::Division, indices)? / count as f64)
            }
            UnitType::Subsubdivision => {
                let count = self.branching_factor(BranchKind::Subsubdivisions, indices)?;
                Ok(self.unit_ticks(UnitType::Subdivision, indices)? / count as f64)
            }
        }
    }

    fn check_phrase_anchor(&mut self, indices: &UnitIndices, span: &Span) {
        let timing = &self.frame.timing;
        let uniform_tick = timing.section_start + indices.phrase as f64 * timing.ticks_per_phrase();
        if (uniform_tick - span.start_tick).abs() > TICK_EPSILON {
            let anchor_tick = span.start_tick;
            self.note(
                UnitType::Phrase,
                *indices,
                DiagnosticEvent::PhraseAnchorDrift {
                    anchor_tick,
                    uniform_tick,
                },
            );
        }
    }

    /// Ensures the child lies inside its parent. The last child of a
    /// dynamically sized parent may push the parent's end out instead.
    fn check_containment(
        &mut self,
        unit: UnitType,
        indices: &UnitIndices,
        totals: &UnitTotals,
        span: &Span,
        parent_unit: UnitType,
        parent: Span,
    ) -> Result<()> {
        let tolerance = self.settings.tolerance_ticks;
        let starts_inside = span.start_tick >= parent.start_tick - tolerance;
        let ends_inside = span.end_tick <= parent.end_tick + tolerance;
        if starts_inside && ends_inside {
            return Ok(());
        }

        let is_last = totals.is_last(unit, indices);
        if !(starts_inside && is_last && parent_unit.is_dynamically_sized()) {
            return Err(TimingError::BoundaryViolation {
                unit,
                child: *span,
                parent_unit,
                parent,
            });
        }

        let parent_indices = indices.truncated(parent_unit);
        let extended = Span {
            end_tick: span.end_tick,
            end_time: parent.end_time.max(span.end_time),
            ..parent
        };
        self.layer
            .ledger
            .extend_end(parent_unit, &parent_indices, extended.end_tick, extended.end_time);
        if self.frame.span(parent_unit, &parent_indices).is_some() {
            self.frame.remember_span(parent_unit, &parent_indices, extended);
        }
        self.note(
            unit,
            *indices,
            DiagnosticEvent::ParentExtended {
                parent: parent_unit,
                parent_indices,
                previous_end_tick: parent.end_tick,
                end_tick: extended.end_tick,
            },
        );
        Ok(())
    }

    fn check_overlong(&self, span: &Span, parent: &Span) -> Result<()> {
        let Some(ratio) = self.settings.overlong_ratio else {
            return Ok(());
        };
        let unit_ticks = span.ticks();
        let parent_ticks = parent.ticks();
        let measure_ticks = self.frame.timing.ticks_per_measure();
        if unit_ticks * ratio >= parent_ticks && unit_ticks * ratio >= measure_ticks {
            return Err(TimingError::OverlongUnit {
                unit_ticks,
                parent_ticks,
                measure_ticks,
            });
        }
        Ok(())
    }

    /// Checks siblings for overlap. Returns the existing record when the unit
    /// is an exact duplicate of one already committed.
    fn check_overlap(
        &mut self,
        unit: UnitType,
        indices: &UnitIndices,
        span: &Span,
    ) -> Result<Option<UnitRecord>> {
        let tolerance = self.settings.tolerance_ticks;
        let mut tolerated = Vec::new();
        for other in self.layer.ledger.find_overlapping(unit, indices, span) {
            if other.indices == *indices && other.span.same_ticks(span, TICK_EPSILON) {
                return Ok(Some(other.clone()));
            }
            let overlap_ticks = other.span.overlap_ticks(span);
            if overlap_ticks > tolerance {
                return Err(TimingError::OverlapDetected {
                    unit,
                    span: *span,
                    existing_indices: other.indices,
                    existing: Box::new(other.clone()),
                    overlap_ticks,
                });
            }
            tolerated.push((other.indices, overlap_ticks));
        }
        for (other, overlap_ticks) in tolerated {
            self.note(
                unit,
                *indices,
                DiagnosticEvent::OverlapTolerated {
                    other,
                    overlap_ticks,
                },
            );
        }
        Ok(None)
    }

    /// Frame bookkeeping after a unit is placed, plus sink events for units
    /// appended for the first time.
    fn after_commit(&mut self, record: &UnitRecord, emit: bool) {
        let (unit, indices, span) = (record.unit, record.indices, record.span);
        self.frame.remember_span(unit, &indices, span);
        let index = indices.get(unit);

        match unit {
            UnitType::Measure => {
                self.frame.timing.measure_start = span.start_tick;
                self.frame.timing.measure_start_time = span.start_time;
                if emit {
                    let sync = self.frame.timing.sync();
                    self.layer
                        .sink
                        .push_measure_timing(span.start_tick, sync.midi_tempo, sync.midi_meter);
                }
            }
            UnitType::Beat => self.frame.rhythm.beat = index,
            UnitType::Division => self.frame.rhythm.division = index,
            UnitType::Subdivision => self.frame.rhythm.subdivision = index,
            UnitType::Subsubdivision => self.frame.rhythm.subsubdivision = index,
            UnitType::Section | UnitType::Phrase => {}
        }

        if emit && self.settings.marker_units.contains(&unit) {
            let text = unit_marker(
                unit,
                &indices,
                &record.totals,
                &span,
                record.meter,
                record.midi_meter,
            );
            self.layer.sink.push_marker(span.end_tick, text);
        }
    }

    fn note(&mut self, unit: UnitType, indices: UnitIndices, event: DiagnosticEvent) {
        self.diagnostics.record(&self.layer.name, unit, indices, event);
    }

    fn error_context(&self, unit: UnitType) -> ErrorContext {
        ErrorContext {
            layer: self.layer.name.clone(),
            unit,
            indices: self.frame.indices,
            timing: self.frame.timing.clone(),
            recent: self.layer.ledger.recent(RECENT_ENTRIES).to_vec(),
        }
    }
}
