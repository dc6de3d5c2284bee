//! Error types for timing resolution.

use crate::time::cache::BranchKey;
use crate::time::context::TimingContext;
use crate::time::ledger::UnitRecord;
use crate::time::unit::{Span, UnitIndices, UnitType};
use std::fmt;
use thiserror::Error;

/// Failures raised while computing meters, managing layers or resolving units.
#[derive(Error, Debug)]
pub enum TimingError {
    #[error("invalid meter {numerator}/{denominator}")]
    InvalidMeter { numerator: u32, denominator: u32 },

    #[error("invalid tempo: {tempo}")]
    InvalidTempo { tempo: f64 },

    #[error("invalid resolution: {ppq} pulses per quarter note")]
    InvalidResolution { ppq: u32 },

    #[error("missing {total} total required to resolve a {unit}")]
    MissingTotal { unit: UnitType, total: &'static str },

    #[error("no branching factor cached for {key} and no composer to ask")]
    MissingBranchingFactor { key: BranchKey },

    #[error("{unit} {child} escapes its {parent_unit} {parent}")]
    BoundaryViolation {
        unit: UnitType,
        child: Span,
        parent_unit: UnitType,
        parent: Span,
    },

    #[error("{unit} {span} overlaps {existing_indices} by {overlap_ticks:.3} ticks")]
    OverlapDetected {
        unit: UnitType,
        span: Span,
        existing_indices: UnitIndices,
        existing: Box<UnitRecord>,
        overlap_ticks: f64,
    },

    #[error(
        "subsubdivision spans {unit_ticks:.3} ticks inside a {parent_ticks:.3}-tick subdivision \
         of a {measure_ticks:.3}-tick measure"
    )]
    OverlongUnit {
        unit_ticks: f64,
        parent_ticks: f64,
        measure_ticks: f64,
    },

    #[error("unknown layer: {name}")]
    UnknownLayer { name: String },

    #[error("no layer is active")]
    NoActiveLayer,

    #[error("{source} ({context})")]
    Resolution {
        #[source]
        source: Box<TimingError>,
        context: Box<ErrorContext>,
    },
}

impl TimingError {
    /// The underlying failure with any resolution payload stripped.
    pub fn root(&self) -> &TimingError {
        match self {
            TimingError::Resolution { source, .. } => source.root(),
            other => other,
        }
    }

    /// The structured payload attached by the resolver, if any.
    pub fn context(&self) -> Option<&ErrorContext> {
        match self {
            TimingError::Resolution { context, .. } => Some(context),
            _ => None,
        }
    }

    /// Attaches `context` unless a payload is already present.
    pub fn with_context(self, context: ErrorContext) -> TimingError {
        match self {
            already @ TimingError::Resolution { .. } => already,
            other => TimingError::Resolution {
                source: Box::new(other),
                context: Box::new(context),
            },
        }
    }
}

/// Snapshot of resolver state at the moment a resolution failed.
#[derive(Debug, Clone)]
pub struct ErrorContext {
    /// Active layer name.
    pub layer: String,
    /// Unit type being resolved.
    pub unit: UnitType,
    /// Position of the unit being resolved.
    pub indices: UnitIndices,
    /// Copy of the active timing context.
    pub timing: TimingContext,
    /// Most recent ledger entries of the active layer, oldest first.
    pub recent: Vec<UnitRecord>,
}

impl fmt::Display for ErrorContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "layer {} resolving {} at {}; meter {} at {} tps, phrase start {:.3}, {} recent units",
            self.layer,
            self.unit,
            self.indices,
            self.timing.meter(),
            self.timing.sync().ticks_per_second,
            self.timing.phrase_start,
            self.recent.len()
        )
    }
}

/// Result type for timing operations.
pub type Result<T> = std::result::Result<T, TimingError>;
