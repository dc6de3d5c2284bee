//! JSON listing of resolved units.
//!
//! Every record becomes an entry keyed by its position in the hierarchy,
//! e.g. `section1/3|phrase2/4|measure1/2`. Positions are one-based; the total
//! is omitted where it was never known.

use super::ExportError;
use crate::time::ledger::UnitRecord;
use crate::time::meter::Meter;
use crate::time::unit::{Span, UnitType};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

/// One resolved unit in the map.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnitMapEntry {
    pub key: String,
    pub layer: String,
    pub unit: UnitType,
    #[serde(flatten)]
    pub span: Span,
    pub meter: Meter,
    pub midi_meter: Meter,
}

impl From<&UnitRecord> for UnitMapEntry {
    fn from(record: &UnitRecord) -> Self {
        Self {
            key: unit_key(record),
            layer: record.layer.clone(),
            unit: record.unit,
            span: record.span,
            meter: record.meter,
            midi_meter: record.midi_meter,
        }
    }
}

/// Hierarchical key of a record, from its section down to its own level.
pub fn unit_key(record: &UnitRecord) -> String {
    UnitType::ALL[..=record.unit.depth()]
        .iter()
        .map(|level| {
            let position = record.indices.get(*level) + 1;
            match record.totals.get(*level) {
                Some(total) => format!("{}{position}/{total}", level.as_str()),
                None => format!("{}{position}", level.as_str()),
            }
        })
        .collect::<Vec<_>>()
        .join("|")
}

/// Writes `records` as a pretty JSON array and returns how many were written.
///
/// # Errors
///
/// Returns error if the file cannot be created or serialization fails
pub fn write_unit_map<'a, I, P>(records: I, path: P) -> Result<usize, ExportError>
where
    I: IntoIterator<Item = &'a UnitRecord>,
    P: AsRef<Path>,
{
    let entries: Vec<UnitMapEntry> = records.into_iter().map(UnitMapEntry::from).collect();
    let file = File::create(path)?;
    let mut writer = BufWriter::new(file);
    serde_json::to_writer_pretty(&mut writer, &entries)?;
    writer.write_all(b"\n")?;
    writer.flush()?;
    Ok(entries.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::unit::{UnitIndices, UnitTotals};
    use std::fs;

    fn measure_record() -> UnitRecord {
        UnitRecord {
            layer: "primary".to_string(),
            unit: UnitType::Measure,
            indices: UnitIndices::phrase(0, 1).with(UnitType::Measure, 0),
            totals: UnitTotals {
                sections: Some(3),
                phrases: Some(4),
                measures: Some(2),
                ..UnitTotals::default()
            },
            span: Span::from_start(1920.0, 1920.0, 2.0, 2.0),
            meter: Meter::new(4, 4),
            midi_meter: Meter::new(4, 4),
            ticks_per_second: 960.0,
        }
    }

    #[test]
    fn test_unit_key() {
        assert_eq!(unit_key(&measure_record()), "section1/3|phrase2/4|measure1/2");

        let mut unknown = measure_record();
        unknown.totals.phrases = None;
        assert_eq!(unit_key(&unknown), "section1/3|phrase2|measure1/2");
    }

    #[test]
    fn test_write_unit_map() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("units.json");
        let record = measure_record();
        assert_eq!(write_unit_map([&record], &path).unwrap(), 1);

        let entries: Vec<UnitMapEntry> =
            serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].key, "section1/3|phrase2/4|measure1/2");
        assert_eq!(entries[0].span.end_tick, 3840.0);
        assert_eq!(entries[0].unit, UnitType::Measure);
    }
}
