//! Writing a finished composition to disk.
//!
//! - [`midi`]: per-layer Standard MIDI Files holding the tempo map and markers
//! - [`unit_map`]: JSON listing of every resolved unit with its span

pub mod midi;
pub mod unit_map;

pub use midi::{read_timing_map, write_timing_map, TimingMap};
pub use unit_map::{unit_key, write_unit_map, UnitMapEntry};

use thiserror::Error;

/// Errors raised while writing or reading exported files.
#[derive(Error, Debug)]
pub enum ExportError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("MIDI parse error: {0}")]
    Parse(String),

    #[error("unsupported MIDI file: {0}")]
    Unsupported(String),
}
