//! Named timing layers and the activate/advance protocol.
//!
//! A layer is an independent timeline (its own meter, anchors, ledger and
//! event sink) that shares the composition's tempo. Layers take turns: the
//! active layer's context is loaded into the shared [`Frame`], units are
//! resolved against it, and [`LayerManager::advance`] writes the moved anchors
//! back. The first registered layer is the primary; any other layer activated
//! as secondary runs in a meter aligned against the primary's.

use super::cache::BranchingCache;
use super::context::{ContextOverrides, Frame, TimingContext};
use super::ledger::UnitLedger;
use super::meter::Meter;
use super::polyrhythm::{align_with_composer, find_alignment, PolyAlignment};
use super::sink::EventBuffer;
use crate::composer::Composer;
use crate::error::{Result, TimingError};
use serde::Serialize;
use std::collections::HashMap;
use tracing::{debug, info, warn};

/// Which anchor an advance moves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdvanceKind {
    Phrase,
    Section,
}

/// A registered layer.
#[derive(Debug, Clone)]
pub struct Layer {
    pub name: String,
    pub context: TimingContext,
    pub ledger: UnitLedger,
    pub cache: BranchingCache,
    pub sink: EventBuffer,
}

/// Layer timing as seen right after activation.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ActivationSnapshot {
    pub meter: Meter,
    pub midi_meter: Meter,
    pub measures_per_phrase: u32,
    pub ticks_per_second: f64,
    pub phrase_start: f64,
    pub phrase_start_time: f64,
    pub section_start: f64,
    pub section_start_time: f64,
    pub section_end: f64,
    pub ticks_per_section: f64,
    pub seconds_per_section: f64,
}

impl ActivationSnapshot {
    fn of(context: &TimingContext) -> Self {
        Self {
            meter: context.meter(),
            midi_meter: context.sync().midi_meter,
            measures_per_phrase: context.measures_per_phrase,
            ticks_per_second: context.sync().ticks_per_second,
            phrase_start: context.phrase_start,
            phrase_start_time: context.phrase_start_time,
            section_start: context.section_start,
            section_start_time: context.section_start_time,
            section_end: context.section_end,
            ticks_per_section: context.ticks_per_section,
            seconds_per_section: context.seconds_per_section,
        }
    }
}

/// Owns every layer and tracks which one is loaded into the frame.
#[derive(Debug, Default)]
pub struct LayerManager {
    layers: HashMap<String, Layer>,
    order: Vec<String>,
    active: Option<String>,
    alignment: Option<PolyAlignment>,
}

impl LayerManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers (or re-registers) a layer.
    ///
    /// Re-registering replaces the layer's context and empties its ledger,
    /// branching cache and sink.
    ///
    /// # Arguments
    ///
    /// * `name` - Layer name
    /// * `sink` - Event buffer the layer writes to
    /// * `overrides` - Initial values merged over the context defaults
    ///
    /// # Errors
    ///
    /// Propagates validation failures from the overridden meter, tempo or
    /// resolution.
    pub fn register(
        &mut self,
        name: &str,
        sink: EventBuffer,
        overrides: &ContextOverrides,
    ) -> Result<&TimingContext> {
        let context = TimingContext::new(overrides)?;
        if !self.layers.contains_key(name) {
            self.order.push(name.to_string());
        }
        info!(
            layer = name,
            meter = %context.meter(),
            tempo = context.tempo(),
            "Registered layer"
        );
        let layer = Layer {
            name: name.to_string(),
            context,
            ledger: UnitLedger::new(),
            cache: BranchingCache::new(),
            sink,
        };
        self.layers.insert(name.to_string(), layer);
        Ok(&self.layers[name].context)
    }

    /// Loads a layer into the frame.
    ///
    /// Activating a secondary layer applies the stored polyrhythm alignment,
    /// running the composer-driven search first if none is stored. The
    /// primary layer receives its side of the same alignment.
    ///
    /// # Errors
    ///
    /// `UnknownLayer` if `name` was never registered.
    pub fn activate(
        &mut self,
        name: &str,
        is_secondary: bool,
        frame: &mut Frame,
        composer: Option<&mut dyn Composer>,
    ) -> Result<ActivationSnapshot> {
        if !self.layers.contains_key(name) {
            return Err(TimingError::UnknownLayer {
                name: name.to_string(),
            });
        }

        if is_secondary && self.alignment.is_none() {
            if let Some(composer) = composer {
                self.align_polyrhythm(composer);
            } else {
                warn!(layer = name, "Secondary layer activated without a composer or meter");
            }
        }

        let is_primary = self.primary_name() == Some(name);
        let alignment = self.alignment;
        let layer = self.layer_mut(name)?;
        match alignment {
            Some(alignment) if is_secondary => {
                layer.context.set_meter(alignment.secondary_meter)?;
                layer.context.measures_per_phrase = alignment.secondary_measures;
            }
            Some(alignment) if is_primary => {
                layer.context.measures_per_phrase = alignment.primary_measures;
            }
            _ => {}
        }

        frame.load(name, &layer.context);
        let snapshot = ActivationSnapshot::of(&layer.context);
        self.active = Some(name.to_string());
        debug!(
            layer = name,
            is_secondary,
            meter = %snapshot.meter,
            measures = snapshot.measures_per_phrase,
            "Activated layer"
        );
        Ok(snapshot)
    }

    /// Moves a layer's phrase or section anchor forward.
    ///
    /// When the layer is the one loaded in the frame, the frame's working
    /// context is saved into the layer first and the advanced context is
    /// loaded back afterwards. Unknown layers are ignored.
    pub fn advance(&mut self, name: &str, kind: AdvanceKind, frame: &mut Frame) {
        let loaded = frame.layer() == Some(name);
        let Some(layer) = self.layers.get_mut(name) else {
            debug!(layer = name, ?kind, "Ignoring advance for unknown layer");
            return;
        };

        frame.rhythm.reset();
        if loaded {
            layer.context = frame.timing.clone();
        }
        match kind {
            AdvanceKind::Phrase => layer.context.advance_phrase(),
            AdvanceKind::Section => layer.context.advance_section(),
        }
        if loaded {
            frame.timing = layer.context.clone();
        }
    }

    /// Sets a layer's meter. Changing the primary meter drops any stored
    /// polyrhythm alignment, since it was computed against the old meter.
    pub fn set_meter(&mut self, name: &str, meter: Meter, frame: &mut Frame) -> Result<()> {
        let is_primary = self.primary_name() == Some(name);
        let layer = self.layer_mut(name)?;
        layer.context.set_meter(meter)?;
        if frame.layer() == Some(name) {
            frame.timing.set_meter(meter)?;
        }
        if is_primary {
            self.clear_alignment();
        }
        Ok(())
    }

    pub fn set_measures_per_phrase(&mut self, name: &str, measures: u32, frame: &mut Frame) -> Result<()> {
        let layer = self.layer_mut(name)?;
        layer.context.measures_per_phrase = measures;
        if frame.layer() == Some(name) {
            frame.timing.measures_per_phrase = measures;
        }
        Ok(())
    }

    /// Pins the secondary meter without consulting a composer.
    ///
    /// The measure counts come from [`find_alignment`]; a meter that does not
    /// align within five measures runs 1:1 against the primary.
    pub fn set_secondary_meter(&mut self, meter: Meter) -> Result<PolyAlignment> {
        meter.validate()?;
        let primary = self.primary_meter();
        let alignment = find_alignment(primary, meter).unwrap_or_else(|| {
            warn!(%primary, secondary = %meter, "Secondary meter does not align, running 1:1");
            PolyAlignment {
                primary_meter: primary,
                secondary_meter: meter,
                primary_measures: 1,
                secondary_measures: 1,
            }
        });
        self.alignment = Some(alignment);
        Ok(alignment)
    }

    /// Searches composer meters for an alignment with the primary meter and
    /// stores the result.
    pub fn align_polyrhythm(&mut self, composer: &mut dyn Composer) -> PolyAlignment {
        let alignment = align_with_composer(self.primary_meter(), composer);
        self.alignment = Some(alignment);
        alignment
    }

    pub fn clear_alignment(&mut self) {
        self.alignment = None;
    }

    pub fn alignment(&self) -> Option<PolyAlignment> {
        self.alignment
    }

    /// Name of the layer currently loaded into the frame.
    pub fn active_name(&self) -> Option<&str> {
        self.active.as_deref()
    }

    pub fn primary_name(&self) -> Option<&str> {
        self.order.first().map(String::as_str)
    }

    fn primary_meter(&self) -> Meter {
        self.primary_name()
            .and_then(|name| self.layers.get(name))
            .map(|layer| layer.context.meter())
            .unwrap_or_default()
    }

    pub fn get(&self, name: &str) -> Option<&Layer> {
        self.layers.get(name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut Layer> {
        self.layers.get_mut(name)
    }

    fn layer_mut(&mut self, name: &str) -> Result<&mut Layer> {
        self.layers
            .get_mut(name)
            .ok_or_else(|| TimingError::UnknownLayer {
                name: name.to_string(),
            })
    }

    /// The layer loaded into the frame.
    ///
    /// # Errors
    ///
    /// `NoActiveLayer` before the first activation.
    pub fn active_mut(&mut self) -> Result<&mut Layer> {
        let name = self.active.clone().ok_or(TimingError::NoActiveLayer)?;
        self.layer_mut(&name)
    }

    /// Layers in registration order.
    pub fn iter(&self) -> impl Iterator<Item = &Layer> {
        self.order.iter().filter_map(|name| self.layers.get(name))
    }

    /// Consumes the manager, yielding layers in registration order.
    pub fn into_layers(mut self) -> Vec<Layer> {
        self.order
            .iter()
            .filter_map(|name| self.layers.remove(name))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.layers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::composer::FixedComposer;

    fn manager() -> (LayerManager, Frame) {
        let mut layers = LayerManager::new();
        layers
            .register("primary", EventBuffer::new("primary"), &ContextOverrides::default())
            .unwrap();
        layers
            .register("poly", EventBuffer::new("poly"), &ContextOverrides::default())
            .unwrap();
        (layers, Frame::new())
    }

    #[test]
    fn test_register_defaults() {
        let (layers, _) = manager();
        let primary = layers.get("primary").unwrap();
        assert_eq!(primary.context.meter(), Meter::COMMON_TIME);
        assert_eq!(primary.context.measures_per_phrase, 1);
        assert!((primary.context.ticks_per_measure() - 1920.0).abs() < 1e-9);
        assert_eq!(layers.primary_name(), Some("primary"));
    }

    #[test]
    fn test_unknown_layer() {
        let (mut layers, mut frame) = manager();
        let err = layers.activate("missing", false, &mut frame, None).unwrap_err();
        assert!(matches!(err, TimingError::UnknownLayer { .. }));

        // Advancing an unknown layer is a no-op
        layers.advance("missing", AdvanceKind::Phrase, &mut frame);
        assert_eq!(frame.layer(), None);
    }

    #[test]
    fn test_secondary_activation_aligns() {
        let (mut layers, mut frame) = manager();
        let mut composer =
            FixedComposer::new(Meter::new(4, 4)).with_secondary_meter(Meter::new(3, 4));

        let poly = layers
            .activate("poly", true, &mut frame, Some(&mut composer))
            .unwrap();
        assert_eq!(poly.meter, Meter::new(3, 4));
        assert_eq!(poly.measures_per_phrase, 4);

        let primary = layers.activate("primary", false, &mut frame, None).unwrap();
        assert_eq!(primary.meter, Meter::new(4, 4));
        assert_eq!(primary.measures_per_phrase, 3);
        assert_eq!(frame.timing.meter(), Meter::new(4, 4));

        // Alignment persists across activations
        let again = layers
            .activate("poly", true, &mut frame, Some(&mut composer))
            .unwrap();
        assert_eq!(again.meter, Meter::new(3, 4));
        assert_eq!(composer.meter_requests(), 1);
    }

    #[test]
    fn test_primary_meter_change_clears_alignment() {
        let (mut layers, mut frame) = manager();
        layers.set_secondary_meter(Meter::new(3, 4)).unwrap();
        assert!(layers.alignment().is_some());
        layers.set_meter("poly", Meter::new(5, 8), &mut frame).unwrap();
        assert!(layers.alignment().is_some());
        layers.set_meter("primary", Meter::new(6, 8), &mut frame).unwrap();
        assert!(layers.alignment().is_none());
    }

    #[test]
    fn test_advance_round_trips_frame() {
        let (mut layers, mut frame) = manager();
        layers.activate("primary", false, &mut frame, None).unwrap();
        frame.timing.measure_start = 960.0;
        frame.rhythm.beat = 3;

        layers.advance("primary", AdvanceKind::Phrase, &mut frame);
        assert_eq!(frame.rhythm.beat, 0);
        assert!((frame.timing.phrase_start - 1920.0).abs() < 1e-9);
        // Working values were saved into the layer before advancing
        let stored = &layers.get("primary").unwrap().context;
        assert_eq!(stored.measure_start, 960.0);
        assert!((stored.phrase_start - 1920.0).abs() < 1e-9);

        // Advancing another layer leaves the frame alone
        layers.advance("poly", AdvanceKind::Phrase, &mut frame);
        assert!((frame.timing.phrase_start - 1920.0).abs() < 1e-9);
        assert!((layers.get("poly").unwrap().context.phrase_start - 1920.0).abs() < 1e-9);

        layers.advance("primary", AdvanceKind::Section, &mut frame);
        assert!((frame.timing.section_start - 1920.0).abs() < 1e-9);
        assert_eq!(frame.timing.phrases_in_section, 0);
    }

    #[test]
    fn test_activation_does_not_leak_meter() {
        let (mut layers, mut frame) = manager();
        layers.set_meter("poly", Meter::new(7, 9), &mut frame).unwrap();
        layers.activate("poly", false, &mut frame, None).unwrap();
        assert_eq!(frame.timing.meter(), Meter::new(7, 9));
        layers.activate("primary", false, &mut frame, None).unwrap();
        assert_eq!(frame.timing.meter(), Meter::COMMON_TIME);
        assert!((frame.timing.sync().ticks_per_second - 960.0).abs() < 1e-9);
    }
}
