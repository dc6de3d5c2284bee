//! Standard MIDI File (SMF) output for timing layers.
//!
//! Each layer is written to its own Format 1 file:
//! - Track 0: tempo and time signature meta events (the tempo map)
//! - Track 1: marker meta events
//!
//! Ticks are the layer's own ticks rounded to the nearest integer. Meters
//! that were spoofed are written in their MIDI-compatible form; the tempo
//! events already carry the compensating tempo, so playback durations match
//! the played meter.

use super::ExportError;
use crate::time::meter::denominator_to_power;
use crate::time::sink::{EventBuffer, TimingEvent};
use midly::{Format, MetaMessage, Smf, Timing, TrackEventKind};
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::Path;

/// Largest value a tempo meta event can hold.
const MAX_TEMPO_MICROSECONDS: u32 = 0x00FF_FFFF;

/// Writes a variable-length quantity (VLQ) used for delta times in MIDI.
///
/// VLQ encodes values using 7 bits per byte, with the MSB set on every byte
/// but the last.
fn write_vlq(value: u32, buffer: &mut Vec<u8>) {
    let mut bytes = [0u8; 5];
    let mut count = 0;
    let mut rest = value;
    loop {
        bytes[count] = (rest & 0x7F) as u8;
        count += 1;
        rest >>= 7;
        if rest == 0 {
            break;
        }
    }
    for i in (0..count).rev() {
        if i > 0 {
            buffer.push(bytes[i] | 0x80);
        } else {
            buffer.push(bytes[i]);
        }
    }
}

/// Meta events written by the timing map.
enum MetaEvent {
    TrackName { name: String },
    /// Microseconds per quarter note.
    SetTempo { microseconds: u32 },
    TimeSignature { numerator: u8, denominator_power: u8 },
    Marker { text: String },
    EndOfTrack,
}

struct SmfEvent {
    tick: u32,
    priority: u8,
    event: MetaEvent,
}

fn write_text_meta(kind: u8, text: &str, buffer: &mut Vec<u8>) {
    buffer.push(0xFF);
    buffer.push(kind);
    let bytes = text.as_bytes();
    write_vlq(bytes.len() as u32, buffer);
    buffer.extend_from_slice(bytes);
}

/// Writes a single meta event to the buffer (without delta time).
fn write_event(event: &MetaEvent, buffer: &mut Vec<u8>) {
    match event {
        MetaEvent::TrackName { name } => write_text_meta(0x03, name, buffer),
        MetaEvent::Marker { text } => write_text_meta(0x06, text, buffer),
        MetaEvent::SetTempo { microseconds } => {
            // FF 51 03 tt tt tt
            buffer.extend_from_slice(&[0xFF, 0x51, 0x03]);
            buffer.extend_from_slice(&microseconds.to_be_bytes()[1..]);
        }
        MetaEvent::TimeSignature {
            numerator,
            denominator_power,
        } => {
            // FF 58 04 nn dd cc bb, 24 clocks per click, 8 32nds per quarter
            buffer.extend_from_slice(&[0xFF, 0x58, 0x04, *numerator, *denominator_power, 24, 8]);
        }
        MetaEvent::EndOfTrack => buffer.extend_from_slice(&[0xFF, 0x2F, 0x00]),
    }
}

/// Builds track chunk data, converting absolute ticks to delta times.
fn build_track_data(events: &mut [SmfEvent]) -> Vec<u8> {
    let mut buffer = Vec::new();
    events.sort_by(|a, b| a.tick.cmp(&b.tick).then(a.priority.cmp(&b.priority)));

    let mut last_tick = 0u32;
    for event in events.iter() {
        write_vlq(event.tick.saturating_sub(last_tick), &mut buffer);
        write_event(&event.event, &mut buffer);
        last_tick = event.tick;
    }
    buffer
}

fn write_track_chunk<W: Write>(writer: &mut W, track_data: &[u8]) -> std::io::Result<()> {
    writer.write_all(b"MTrk")?;
    writer.write_all(&(track_data.len() as u32).to_be_bytes())?;
    writer.write_all(track_data)?;
    Ok(())
}

/// Rounds a fractional tick to a file tick.
fn file_tick(tick: f64) -> u32 {
    if tick.is_finite() && tick > 0.0 {
        tick.round().min(f64::from(u32::MAX)) as u32
    } else {
        0
    }
}

/// Microseconds per quarter note for a tempo, clamped to what SMF can hold.
fn microseconds_per_quarter(bpm: f64) -> u32 {
    if !bpm.is_finite() || bpm <= 0.0 {
        return MAX_TEMPO_MICROSECONDS;
    }
    (60_000_000.0 / bpm)
        .round()
        .clamp(1.0, f64::from(MAX_TEMPO_MICROSECONDS)) as u32
}

/// Exports a layer's event buffer as a Standard MIDI File.
///
/// # Arguments
///
/// * `sink` - The layer's event buffer; its name becomes the track name
/// * `ppq` - Pulses per quarter note written to the header
/// * `path` - Output file path
///
/// # Errors
///
/// Returns error if file creation or writing fails
pub fn write_timing_map<P: AsRef<Path>>(
    sink: &EventBuffer,
    ppq: u32,
    path: P,
) -> Result<(), ExportError> {
    let file = File::create(path)?;
    let mut writer = BufWriter::new(file);

    writer.write_all(b"MThd")?;
    writer.write_all(&6u32.to_be_bytes())?;
    writer.write_all(&1u16.to_be_bytes())?; // Format 1
    writer.write_all(&2u16.to_be_bytes())?;
    writer.write_all(&(ppq.min(0x7FFF) as u16).to_be_bytes())?;

    let mut tempo_track = vec![SmfEvent {
        tick: 0,
        priority: 0,
        event: MetaEvent::TrackName {
            name: sink.name.clone(),
        },
    }];
    let mut marker_track = vec![SmfEvent {
        tick: 0,
        priority: 0,
        event: MetaEvent::TrackName {
            name: format!("{} markers", sink.name),
        },
    }];

    let mut end_tick = 0u32;
    for timed in sink.events() {
        let tick = file_tick(timed.tick);
        end_tick = end_tick.max(tick);
        match &timed.event {
            TimingEvent::Tempo { bpm } => tempo_track.push(SmfEvent {
                tick,
                priority: timed.priority,
                event: MetaEvent::SetTempo {
                    microseconds: microseconds_per_quarter(*bpm),
                },
            }),
            TimingEvent::Meter {
                numerator,
                denominator,
            } => tempo_track.push(SmfEvent {
                tick,
                priority: timed.priority,
                event: MetaEvent::TimeSignature {
                    numerator: (*numerator).min(255) as u8,
                    denominator_power: denominator_to_power(*denominator),
                },
            }),
            TimingEvent::Marker { text } => marker_track.push(SmfEvent {
                tick,
                priority: timed.priority,
                event: MetaEvent::Marker { text: text.clone() },
            }),
        }
    }

    for mut events in [tempo_track, marker_track] {
        events.push(SmfEvent {
            tick: end_tick,
            priority: u8::MAX,
            event: MetaEvent::EndOfTrack,
        });
        let track_data = build_track_data(&mut events);
        write_track_chunk(&mut writer, &track_data)?;
    }

    writer.flush()?;
    Ok(())
}

/// Timing content read back from a MIDI file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TimingMap {
    pub ppq: u16,
    pub track_names: Vec<String>,
    /// (tick, microseconds per quarter note)
    pub tempos: Vec<(u32, u32)>,
    /// (tick, numerator, denominator)
    pub meters: Vec<(u32, u8, u32)>,
    /// (tick, text)
    pub markers: Vec<(u32, String)>,
}

impl TimingMap {
    /// Quarter notes per minute of each tempo event.
    pub fn bpms(&self) -> Vec<f64> {
        self.tempos
            .iter()
            .map(|(_, us)| 60_000_000.0 / f64::from(*us))
            .collect()
    }
}

/// Reads the tempo, time signature and marker events of a MIDI file.
///
/// # Errors
///
/// Returns error if the file cannot be read or parsed, or uses timecode
/// timing.
pub fn read_timing_map<P: AsRef<Path>>(path: P) -> Result<TimingMap, ExportError> {
    let data = fs::read(path)?;
    let smf = Smf::parse(&data).map_err(|e| ExportError::Parse(e.to_string()))?;

    let ppq = match smf.header.timing {
        Timing::Metrical(tpb) => tpb.as_int(),
        Timing::Timecode(_, _) => {
            return Err(ExportError::Unsupported(
                "SMPTE timecode timing not supported".to_string(),
            ))
        }
    };
    if smf.header.format == Format::Sequential {
        return Err(ExportError::Unsupported(
            "Format 2 (sequential) MIDI files not supported".to_string(),
        ));
    }

    let mut map = TimingMap {
        ppq,
        ..TimingMap::default()
    };
    for track in &smf.tracks {
        let mut tick = 0u32;
        for event in track {
            tick = tick.saturating_add(event.delta.as_int());
            let TrackEventKind::Meta(meta) = event.kind else {
                continue;
            };
            match meta {
                MetaMessage::TrackName(bytes) => {
                    map.track_names
                        .push(String::from_utf8_lossy(bytes).into_owned());
                }
                MetaMessage::Tempo(us) => map.tempos.push((tick, us.as_int())),
                MetaMessage::TimeSignature(numerator, power, _, _) => {
                    map.meters.push((tick, numerator, 1u32 << power.min(31)));
                }
                MetaMessage::Marker(bytes) => {
                    map.markers
                        .push((tick, String::from_utf8_lossy(bytes).into_owned()));
                }
                _ => {}
            }
        }
    }
    Ok(map)
}
