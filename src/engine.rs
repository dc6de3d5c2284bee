//! Batch composition driver.
//!
//! Walks the whole hierarchy for a primary and a secondary layer: sections,
//! phrases (with a fresh primary meter and polyrhythm alignment each),
//! measures, beats and every level of subdivision. The section unit is
//! resolved when the section ends, once its phrases have fixed its length.

use crate::composer::{Composer, RandomComposer};
use crate::config::Config;
use crate::diagnostics::DiagnosticLog;
use crate::error::Result;
use crate::time::cache::BranchKind;
use crate::time::context::{ContextOverrides, RunTotals, TimingContext};
use crate::time::layer::{AdvanceKind, Layer};
use crate::time::ledger::UnitLedger;
use crate::time::sink::EventBuffer;
use crate::time::unit::{UnitIndices, UnitType};
use crate::timeline::Timeline;
use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::{debug, info};

/// Name of the layer that drives the meter.
pub const PRIMARY_LAYER: &str = "primary";
/// Name of the polyrhythmic layer.
pub const SECONDARY_LAYER: &str = "poly";

const LAYERS: [(&str, bool); 2] = [(PRIMARY_LAYER, false), (SECONDARY_LAYER, true)];

/// Everything a finished run produced for one layer.
#[derive(Debug, Clone)]
pub struct LayerOutput {
    pub name: String,
    pub ledger: UnitLedger,
    pub sink: EventBuffer,
    /// Context as the layer ended the run.
    pub context: TimingContext,
}

impl From<Layer> for LayerOutput {
    fn from(layer: Layer) -> Self {
        Self {
            name: layer.name,
            ledger: layer.ledger,
            sink: layer.sink,
            context: layer.context,
        }
    }
}

/// Result of a full composition run.
#[derive(Debug, Clone)]
pub struct Composition {
    pub seed: u64,
    pub sections: u32,
    pub ppq: u32,
    pub layers: Vec<LayerOutput>,
    pub diagnostics: DiagnosticLog,
}

impl Composition {
    pub fn layer(&self, name: &str) -> Option<&LayerOutput> {
        self.layers.iter().find(|layer| layer.name == name)
    }

    /// Total number of resolved units across layers.
    pub fn unit_count(&self) -> usize {
        self.layers.iter().map(|layer| layer.ledger.len()).sum()
    }

    /// Length of the run in seconds, taken from the primary layer.
    pub fn duration_seconds(&self) -> f64 {
        self.layers
            .first()
            .map(|layer| layer.context.section_start_time)
            .unwrap_or(0.0)
    }
}

/// Runs a composition with a seeded [`RandomComposer`].
///
/// # Errors
///
/// The first timing error aborts the run.
pub fn compose(config: &Config) -> Result<Composition> {
    let seed = config.seed.unwrap_or_else(rand::random);
    let composer = RandomComposer::from_config(config, seed);
    compose_with(config, seed, Box::new(composer))
}

/// Runs a composition with an explicit composer.
///
/// `seed` drives the structural draws (section and phrase counts) only.
pub fn compose_with(
    config: &Config,
    seed: u64,
    composer: Box<dyn Composer>,
) -> Result<Composition> {
    let mut rng = StdRng::seed_from_u64(seed);
    let diagnostics = DiagnosticLog::with_categories(config.diagnostics.iter().copied());
    let mut timeline = Timeline::new(config.resolver_settings())
        .with_composer(composer)
        .with_diagnostics(diagnostics);

    let overrides = ContextOverrides {
        tempo: Some(config.bpm),
        ppq: Some(config.ppq),
        ..ContextOverrides::default()
    };
    for (name, _) in LAYERS {
        timeline.register_layer(name, &overrides)?;
    }

    let sections = config.sections.sample(&mut rng);
    info!(seed, sections, bpm = config.bpm, "Starting composition");

    for section in 0..sections {
        let phrases = config.phrases_per_section.sample(&mut rng);
        timeline.set_totals(RunTotals {
            sections: Some(sections),
            phrases_per_section: Some(phrases),
        });

        for phrase in 0..phrases {
            if let Some(meter) = timeline.request_meter(false, false) {
                timeline.set_meter(PRIMARY_LAYER, meter)?;
            }
            timeline.align_polyrhythm();

            for (name, is_secondary) in LAYERS {
                let snapshot = timeline.activate(name, is_secondary)?;
                debug!(
                    layer = name,
                    section,
                    phrase,
                    meter = %snapshot.meter,
                    measures = snapshot.measures_per_phrase,
                    "Composing phrase"
                );
                compose_phrase(&mut timeline, UnitIndices::phrase(section, phrase))?;
                timeline.advance(name, AdvanceKind::Phrase);
            }
        }

        for (name, is_secondary) in LAYERS {
            timeline.activate(name, is_secondary)?;
            timeline.resolve(UnitType::Section, UnitIndices::section(section))?;
            timeline.advance(name, AdvanceKind::Section);
        }
    }

    let (layers, diagnostics) = timeline.into_parts();
    let composition = Composition {
        seed,
        sections,
        ppq: config.ppq,
        layers: layers.into_iter().map(LayerOutput::from).collect(),
        diagnostics,
    };
    info!(
        units = composition.unit_count(),
        seconds = composition.duration_seconds(),
        "Composition finished"
    );
    Ok(composition)
}

/// Resolves one phrase of the active layer, down to sub-subdivisions.
fn compose_phrase(timeline: &mut Timeline, phrase: UnitIndices) -> Result<()> {
    timeline.resolve(UnitType::Phrase, phrase)?;
    let measures = timeline.frame().timing.measures_per_phrase;
    let beats = timeline.frame().timing.meter().numerator;

    for measure in 0..measures {
        let measure = phrase.with(UnitType::Measure, measure);
        timeline.resolve(UnitType::Measure, measure)?;

        for beat in 0..beats {
            let beat = measure.with(UnitType::Beat, beat);
            timeline.resolve(UnitType::Beat, beat)?;
            let divisions = timeline.require_branching_factor(BranchKind::Divisions, &beat)?;

            for division in 0..divisions {
                let division = beat.with(UnitType::Division, division);
                timeline.resolve(UnitType::Division, division)?;
                let subdivisions =
                    timeline.require_branching_factor(BranchKind::Subdivisions, &division)?;

                for subdivision in 0..subdivisions {
                    let subdivision = division.with(UnitType::Subdivision, subdivision);
                    timeline.resolve(UnitType::Subdivision, subdivision)?;
                    let subsubdivisions = timeline
                        .require_branching_factor(BranchKind::Subsubdivisions, &subdivision)?;

                    for subsubdivision in 0..subsubdivisions {
                        let leaf = subdivision.with(UnitType::Subsubdivision, subsubdivision);
                        timeline.resolve(UnitType::Subsubdivision, leaf)?;
                    }
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::composer::FixedComposer;
    use crate::config::CountRange;
    use crate::time::Meter;

    fn small_config() -> Config {
        Config {
            sections: CountRange::new(2, 2),
            phrases_per_section: CountRange::new(2, 2),
            bpm: 120.0,
            ..Config::default()
        }
    }

    #[test]
    fn test_fixed_run_structure() {
        let composer = FixedComposer::new(Meter::new(4, 4))
            .with_secondary_meter(Meter::new(3, 4))
            .with_divisions(2)
            .with_subdivisions(2)
            .with_subsubdivisions(2);
        let composition = compose_with(&small_config(), 1, Box::new(composer)).unwrap();
        assert_eq!(composition.sections, 2);

        let primary = composition.layer(PRIMARY_LAYER).unwrap();
        let poly = composition.layer(SECONDARY_LAYER).unwrap();
        // 4 phrases of 3 bars of 4/4 against 4 bars of 3/4
        assert_eq!(primary.ledger.of_type(UnitType::Measure).count(), 12);
        assert_eq!(poly.ledger.of_type(UnitType::Measure).count(), 16);
        assert_eq!(primary.ledger.of_type(UnitType::Section).count(), 2);
        assert_eq!(
            primary.ledger.of_type(UnitType::Subsubdivision).count(),
            12 * 4 * 8
        );

        // Both layers end at the same moment: 4 phrases of 6 seconds
        assert!((primary.context.section_start_time - 24.0).abs() < 1e-9);
        assert!((poly.context.section_start_time - 24.0).abs() < 1e-9);
        assert!((composition.duration_seconds() - 24.0).abs() < 1e-9);
    }

    #[test]
    fn test_random_run_is_reproducible() {
        let config = Config {
            seed: Some(5),
            sections: CountRange::new(1, 1),
            phrases_per_section: CountRange::new(1, 2),
            ..Config::default()
        };
        let a = compose(&config).unwrap();
        let b = compose(&config).unwrap();
        assert_eq!(a.unit_count(), b.unit_count());
        assert_eq!(a.layers[0].ledger.records(), b.layers[0].ledger.records());
    }
}
