//! tactus - Hierarchical musical timing resolver.
//!
//! Resolves sections, phrases, measures, beats and three levels of
//! subdivision into absolute tick and time spans, across several polymeter
//! layers that share a tempo. Meters with non power-of-two denominators are
//! written to MIDI as the nearest compatible meter with a compensating tempo.

pub mod composer;
pub mod config;
pub mod diagnostics;
pub mod engine;
pub mod error;
pub mod export;
pub mod time;
pub mod timeline;

// Re-export commonly used types
pub use composer::{Composer, FixedComposer, RandomComposer};
pub use config::{Config, ConfigError};
pub use diagnostics::{DiagnosticCategory, DiagnosticEvent, DiagnosticLog};
pub use engine::{compose, compose_with, Composition};
pub use error::{ErrorContext, Result, TimingError};
pub use time::{Meter, MeterSync, Span, UnitIndices, UnitRecord, UnitType};
pub use timeline::Timeline;
