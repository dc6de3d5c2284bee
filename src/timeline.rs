//! The public entry point for driving timing resolution.
//!
//! A [`Timeline`] owns the layers, the shared frame, the diagnostic log and
//! (optionally) a composer, and hands the right borrows to the resolver for
//! each call.

use crate::composer::Composer;
use crate::diagnostics::DiagnosticLog;
use crate::error::{Result, TimingError};
use crate::time::cache::{BranchKey, BranchKind};
use crate::time::context::{ContextOverrides, Frame, RunTotals, TimingContext};
use crate::time::layer::{ActivationSnapshot, AdvanceKind, Layer, LayerManager};
use crate::time::ledger::{UnitLedger, UnitRecord};
use crate::time::meter::Meter;
use crate::time::polyrhythm::PolyAlignment;
use crate::time::resolver::{Resolver, ResolverSettings};
use crate::time::sink::EventBuffer;
use crate::time::unit::{UnitIndices, UnitType};

/// Layers, working set, composer and diagnostics for one composition.
pub struct Timeline {
    layers: LayerManager,
    frame: Frame,
    diagnostics: DiagnosticLog,
    settings: ResolverSettings,
    composer: Option<Box<dyn Composer>>,
}

impl Timeline {
    pub fn new(settings: ResolverSettings) -> Self {
        Self {
            layers: LayerManager::new(),
            frame: Frame::new(),
            diagnostics: DiagnosticLog::new(),
            settings,
            composer: None,
        }
    }

    pub fn with_composer(mut self, composer: Box<dyn Composer>) -> Self {
        self.composer = Some(composer);
        self
    }

    pub fn with_diagnostics(mut self, diagnostics: DiagnosticLog) -> Self {
        self.diagnostics = diagnostics;
        self
    }

    /// Registers a layer with an empty sink named after it.
    pub fn register_layer(&mut self, name: &str, overrides: &ContextOverrides) -> Result<&TimingContext> {
        self.register_layer_with_sink(name, EventBuffer::new(name), overrides)
    }

    /// Registers a layer bound to `sink`. Re-registering the loaded layer
    /// also drops the frame's remembered spans.
    pub fn register_layer_with_sink(
        &mut self,
        name: &str,
        sink: EventBuffer,
        overrides: &ContextOverrides,
    ) -> Result<&TimingContext> {
        if self.frame.layer() == Some(name) {
            self.frame.forget_spans();
        }
        self.layers.register(name, sink, overrides)
    }

    /// Loads a layer into the frame; see [`LayerManager::activate`].
    pub fn activate(&mut self, name: &str, is_secondary: bool) -> Result<ActivationSnapshot> {
        let composer = self.composer.as_mut().map(|c| c.as_mut() as &mut dyn Composer);
        self.layers.activate(name, is_secondary, &mut self.frame, composer)
    }

    /// Moves a layer's phrase or section anchor; unknown layers are ignored.
    pub fn advance(&mut self, name: &str, kind: AdvanceKind) {
        self.layers.advance(name, kind, &mut self.frame);
    }

    pub fn set_meter(&mut self, name: &str, meter: Meter) -> Result<()> {
        self.layers.set_meter(name, meter, &mut self.frame)
    }

    pub fn set_measures_per_phrase(&mut self, name: &str, measures: u32) -> Result<()> {
        self.layers
            .set_measures_per_phrase(name, measures, &mut self.frame)
    }

    pub fn set_secondary_meter(&mut self, meter: Meter) -> Result<PolyAlignment> {
        self.layers.set_secondary_meter(meter)
    }

    /// Runs the composer-driven alignment search; `None` without a composer.
    pub fn align_polyrhythm(&mut self) -> Option<PolyAlignment> {
        let composer = self.composer.as_mut()?;
        Some(self.layers.align_polyrhythm(composer.as_mut()))
    }

    /// Asks the composer for a meter; `None` without a composer.
    pub fn request_meter(&mut self, want_new: bool, is_secondary: bool) -> Option<Meter> {
        self.composer
            .as_mut()
            .map(|composer| composer.get_meter(want_new, is_secondary))
    }

    pub fn set_totals(&mut self, totals: RunTotals) {
        self.frame.totals = totals;
    }

    /// Resolves a unit on the active layer.
    ///
    /// # Errors
    ///
    /// `NoActiveLayer` before any activation; otherwise any resolver failure.
    pub fn resolve(&mut self, unit: UnitType, indices: UnitIndices) -> Result<UnitRecord> {
        let layer = self.layers.active_mut()?;
        let composer = self.composer.as_mut().map(|c| c.as_mut() as &mut dyn Composer);
        Resolver::new(
            &mut self.frame,
            layer,
            composer,
            &mut self.diagnostics,
            &self.settings,
        )
        .resolve(unit, indices)
    }

    /// Frozen branching factor for the active layer, if already decided.
    pub fn branching_factor(&self, kind: BranchKind, indices: &UnitIndices) -> Option<u32> {
        let name = self.layers.active_name()?;
        self.layers
            .get(name)?
            .cache
            .peek(&BranchKey::new(kind, indices))
    }

    /// Frozen branching factor, failing like the resolver would when absent.
    pub fn require_branching_factor(&self, kind: BranchKind, indices: &UnitIndices) -> Result<u32> {
        self.branching_factor(kind, indices)
            .ok_or(TimingError::MissingBranchingFactor {
                key: BranchKey::new(kind, indices),
            })
    }

    pub fn frame(&self) -> &Frame {
        &self.frame
    }

    pub fn layers(&self) -> &LayerManager {
        &self.layers
    }

    pub fn layer(&self, name: &str) -> Option<&Layer> {
        self.layers.get(name)
    }

    pub fn ledger(&self, name: &str) -> Option<&UnitLedger> {
        self.layers.get(name).map(|layer| &layer.ledger)
    }

    pub fn diagnostics(&self) -> &DiagnosticLog {
        &self.diagnostics
    }

    pub fn settings(&self) -> &ResolverSettings {
        &self.settings
    }

    /// Consumes the timeline into its layers and diagnostic log.
    pub fn into_parts(self) -> (Vec<Layer>, DiagnosticLog) {
        (self.layers.into_layers(), self.diagnostics)
    }
}

impl Default for Timeline {
    fn default() -> Self {
        Self::new(ResolverSettings::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::composer::FixedComposer;

    #[test]
    fn test_resolve_requires_active_layer() {
        let mut timeline = Timeline::default();
        timeline
            .register_layer("primary", &ContextOverrides::default())
            .unwrap();
        let err = timeline
            .resolve(UnitType::Phrase, UnitIndices::phrase(0, 0))
            .unwrap_err();
        assert!(matches!(err, TimingError::NoActiveLayer));
    }

    #[test]
    fn test_reregister_clears_layer_state() {
        let mut timeline = Timeline::default()
            .with_composer(Box::new(FixedComposer::new(Meter::COMMON_TIME).with_divisions(3)));
        timeline
            .register_layer("primary", &ContextOverrides::default())
            .unwrap();
        timeline.set_totals(RunTotals {
            sections: Some(1),
            phrases_per_section: Some(1),
        });
        timeline.activate("primary", false).unwrap();
        let beat = UnitIndices::phrase(0, 0)
            .with(UnitType::Measure, 0)
            .with(UnitType::Beat, 0);
        timeline.resolve(UnitType::Beat, beat).unwrap();
        assert_eq!(timeline.branching_factor(BranchKind::Divisions, &beat), Some(3));
        assert_eq!(timeline.ledger("primary").map(UnitLedger::len), Some(1));

        timeline
            .register_layer("primary", &ContextOverrides::default())
            .unwrap();
        assert_eq!(timeline.branching_factor(BranchKind::Divisions, &beat), None);
        assert_eq!(timeline.ledger("primary").map(UnitLedger::len), Some(0));
        assert!(timeline
            .require_branching_factor(BranchKind::Divisions, &beat)
            .is_err());
    }

    #[test]
    fn test_request_meter_without_composer() {
        let mut timeline = Timeline::default();
        assert_eq!(timeline.request_meter(false, false), None);
        assert_eq!(timeline.align_polyrhythm(), None);
    }
}
