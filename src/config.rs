//! Run configuration.
//!
//! Persisted as pretty JSON. Every field has a default so a config file only
//! needs to name what it changes.

use crate::diagnostics::DiagnosticCategory;
use crate::time::resolver::ResolverSettings;
use crate::time::UnitType;
use rand::distributions::{Distribution, WeightedIndex};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use thiserror::Error;

/// Errors raised while loading or validating a configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("config parse error: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid config: {}", .0.join("; "))]
    Invalid(Vec<String>),
}

/// Inclusive integer range drawn uniformly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CountRange {
    pub min: u32,
    pub max: u32,
}

impl CountRange {
    pub const fn new(min: u32, max: u32) -> Self {
        Self { min, max }
    }

    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> u32 {
        if self.max <= self.min {
            self.min
        } else {
            rng.gen_range(self.min..=self.max)
        }
    }
}

/// Inclusive integer range drawn with per-value weights.
///
/// When `weights` is shorter or longer than the range it is stretched over
/// the range, so a short curve still shapes a wide range.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WeightedRange {
    pub min: u32,
    pub max: u32,
    #[serde(default)]
    pub weights: Vec<u32>,
}

impl WeightedRange {
    pub fn new(min: u32, max: u32, weights: &[u32]) -> Self {
        Self {
            min,
            max,
            weights: weights.to_vec(),
        }
    }

    pub fn size(&self) -> usize {
        (self.max.saturating_sub(self.min) + 1) as usize
    }

    /// Weight of every value in the range, in order.
    pub fn stretched_weights(&self) -> Vec<u32> {
        let size = self.size();
        if self.weights.is_empty() {
            return vec![1; size];
        }
        if self.weights.len() == size {
            return self.weights.clone();
        }
        (0..size)
            .map(|i| self.weights[i * self.weights.len() / size])
            .collect()
    }

    /// Draws a value. Degenerate weights fall back to a uniform draw.
    pub fn sample<R: Rng + ?Sized>(&self, rng: &mut R) -> u32 {
        if self.max <= self.min {
            return self.min;
        }
        match WeightedIndex::new(self.stretched_weights()) {
            Ok(index) => self.min + index.sample(rng) as u32,
            Err(_) => rng.gen_range(self.min..=self.max),
        }
    }
}

/// Configuration for a composition run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Pulses per quarter note.
    pub ppq: u32,
    /// Tempo in quarter notes per minute.
    pub bpm: f64,
    pub sections: CountRange,
    pub phrases_per_section: CountRange,
    pub numerator: WeightedRange,
    pub denominator: WeightedRange,
    pub divisions: WeightedRange,
    pub subdivisions: WeightedRange,
    pub subsubdivisions: WeightedRange,
    /// Unit types that write a marker event at their end.
    pub marker_units: Vec<UnitType>,
    /// Overlap and containment tolerance in ticks.
    pub tolerance_ticks: f64,
    /// Sub-subdivision length guard; `None` disables it.
    pub overlong_ratio: Option<f64>,
    /// Substitute 1 for missing totals instead of failing.
    pub bounded: bool,
    /// Seed for structure and composer draws; random when absent.
    pub seed: Option<u64>,
    /// Diagnostic categories to record.
    pub diagnostics: Vec<DiagnosticCategory>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            ppq: 480,
            bpm: 72.0,
            sections: CountRange::new(6, 9),
            phrases_per_section: CountRange::new(2, 4),
            numerator: WeightedRange::new(2, 20, &[10, 20, 30, 40, 20, 10, 5, 1]),
            denominator: WeightedRange::new(3, 20, &[10, 20, 30, 40, 20, 10, 5, 1]),
            divisions: WeightedRange::new(0, 10, &[1, 15, 20, 25, 20, 10, 10, 7, 2, 2, 1]),
            subdivisions: WeightedRange::new(0, 10, &[5, 10, 20, 15, 20, 10, 20, 4, 2, 1]),
            subsubdivisions: WeightedRange::new(0, 5, &[5, 20, 30, 20, 10, 5]),
            marker_units: vec![UnitType::Section, UnitType::Phrase, UnitType::Measure],
            tolerance_ticks: 1.0,
            overlong_ratio: Some(1.5),
            bounded: false,
            seed: None,
            diagnostics: DiagnosticCategory::DEFAULT.to_vec(),
        }
    }
}

impl Config {
    /// Checks value ranges and returns every problem found.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if !(100..=32767).contains(&self.ppq) {
            errors.push(format!("ppq must be between 100 and 32767, got {}", self.ppq));
        }
        if !self.bpm.is_finite() || !(20.0..=300.0).contains(&self.bpm) {
            errors.push(format!("bpm must be between 20 and 300, got {}", self.bpm));
        }

        for (name, range) in [
            ("sections", &self.sections),
            ("phrases_per_section", &self.phrases_per_section),
        ] {
            if range.min == 0 {
                errors.push(format!("{name}.min must be at least 1"));
            }
            if range.min > range.max {
                errors.push(format!("{name}.min ({}) exceeds max ({})", range.min, range.max));
            }
        }

        for (name, range) in [
            ("numerator", &self.numerator),
            ("denominator", &self.denominator),
            ("divisions", &self.divisions),
            ("subdivisions", &self.subdivisions),
            ("subsubdivisions", &self.subsubdivisions),
        ] {
            if range.min > range.max {
                errors.push(format!("{name}.min ({}) exceeds max ({})", range.min, range.max));
            }
            if !range.weights.is_empty() && range.weights.iter().all(|w| *w == 0) {
                errors.push(format!("{name}.weights must not all be zero"));
            }
        }
        if self.numerator.max == 0 || self.denominator.max == 0 {
            errors.push("meter ranges must allow a non-zero value".to_string());
        }

        if !self.tolerance_ticks.is_finite() || self.tolerance_ticks < 0.0 {
            errors.push(format!(
                "tolerance_ticks must be finite and non-negative, got {}",
                self.tolerance_ticks
            ));
        }
        if let Some(ratio) = self.overlong_ratio {
            if !ratio.is_finite() || ratio <= 1.0 {
                errors.push(format!("overlong_ratio must be greater than 1, got {ratio}"));
            }
        }

        errors
    }

    /// Resolver settings derived from this configuration.
    pub fn resolver_settings(&self) -> ResolverSettings {
        ResolverSettings {
            tolerance_ticks: self.tolerance_ticks,
            overlong_ratio: self.overlong_ratio,
            bounded: self.bounded,
            marker_units: self.marker_units.clone(),
        }
    }

    /// Saves the configuration as pretty JSON.
    ///
    /// # Errors
    ///
    /// Returns error if serialization or file writing fails
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)?;
        Ok(())
    }

    /// Loads and validates a configuration from a JSON file.
    ///
    /// # Arguments
    ///
    /// * `path` - Path to the config file
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be read or parsed, or if it fails
    /// [`Config::validate`].
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let json = fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&json)?;
        let errors = config.validate();
        if errors.is_empty() {
            Ok(config)
        } else {
            Err(ConfigError::Invalid(errors))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_default_is_valid() {
        assert!(Config::default().validate().is_empty());
    }

    #[test]
    fn test_validate_reports_every_problem() {
        let config = Config {
            ppq: 50,
            bpm: 500.0,
            sections: CountRange::new(4, 2),
            tolerance_ticks: -1.0,
            overlong_ratio: Some(0.5),
            ..Config::default()
        };
        let errors = config.validate();
        assert_eq!(errors.len(), 5, "{errors:?}");
        assert!(errors[0].contains("ppq"));
    }

    #[test]
    fn test_weights_stretch_over_range() {
        let range = WeightedRange::new(2, 5, &[1, 3]);
        assert_eq!(range.stretched_weights(), vec![1, 1, 3, 3]);

        let uniform = WeightedRange::new(1, 3, &[]);
        assert_eq!(uniform.stretched_weights(), vec![1, 1, 1]);
    }

    #[test]
    fn test_samples_stay_in_range() {
        let mut rng = StdRng::seed_from_u64(7);
        let range = WeightedRange::new(0, 10, &[1, 15, 20, 25, 20, 10, 10, 7, 2, 2, 1]);
        for _ in 0..500 {
            let value = range.sample(&mut rng);
            assert!(value <= 10);
        }
        // Only one possible value
        assert_eq!(WeightedRange::new(3, 3, &[0]).sample(&mut rng), 3);
        assert_eq!(CountRange::new(2, 2).sample(&mut rng), 2);
    }

    #[test]
    fn test_partial_file_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tactus.json");
        fs::write(&path, r#"{ "bpm": 96, "seed": 11, "marker_units": ["phrase"] }"#).unwrap();

        let config = Config::load_from_file(&path).unwrap();
        assert_eq!(config.bpm, 96.0);
        assert_eq!(config.seed, Some(11));
        assert_eq!(config.marker_units, vec![UnitType::Phrase]);
        assert_eq!(config.ppq, 480);

        config.save_to_file(&path).unwrap();
        assert_eq!(Config::load_from_file(&path).unwrap(), config);
    }

    #[test]
    fn test_invalid_file_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.json");
        fs::write(&path, r#"{ "ppq": 12 }"#).unwrap();
        assert!(matches!(
            Config::load_from_file(&path),
            Err(ConfigError::Invalid(_))
        ));

        fs::write(&path, "not json").unwrap();
        assert!(matches!(
            Config::load_from_file(&path),
            Err(ConfigError::Parse(_))
        ));
    }
}
