//! Meters and the MIDI meter-spoofing calculator.
//!
//! Standard MIDI files can only express time signatures whose denominator is a
//! power of two. A meter such as 7/9 is therefore written as the nearest
//! MIDI-legal meter (7/8) and the written tempo is scaled by the ratio between
//! the two so that a measure still lasts exactly as long as the real meter
//! says it should.

use crate::error::{Result, TimingError};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A time signature.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Meter {
    pub numerator: u32,
    pub denominator: u32,
}

impl Meter {
    pub const COMMON_TIME: Meter = Meter {
        numerator: 4,
        denominator: 4,
    };

    pub fn new(numerator: u32, denominator: u32) -> Self {
        Self {
            numerator,
            denominator,
        }
    }

    /// Checked constructor.
    ///
    /// # Errors
    ///
    /// Returns `InvalidMeter` if either part is zero.
    pub fn try_new(numerator: u32, denominator: u32) -> Result<Self> {
        let meter = Self::new(numerator, denominator);
        meter.validate()?;
        Ok(meter)
    }

    pub fn validate(&self) -> Result<()> {
        if self.numerator == 0 || self.denominator == 0 {
            return Err(TimingError::InvalidMeter {
                numerator: self.numerator,
                denominator: self.denominator,
            });
        }
        Ok(())
    }

    /// Measure length in whole notes.
    pub fn ratio(&self) -> f64 {
        self.numerator as f64 / self.denominator as f64
    }

    /// Whether the denominator can be written to a MIDI file as is.
    pub fn is_midi_compatible(&self) -> bool {
        self.denominator.is_power_of_two()
    }

    /// The MIDI-legal meter closest to this one by measure length.
    ///
    /// Power-of-two denominators pass through untouched. Otherwise the two
    /// bracketing powers of two are compared by how far their ratio lands from
    /// the real ratio; the upper one wins only when it is strictly closer.
    pub fn midi_compatible(&self) -> Meter {
        if self.is_midi_compatible() {
            return *self;
        }
        let high = self.denominator.next_power_of_two();
        let low = high / 2;
        let target = self.ratio();
        let numerator = self.numerator as f64;
        let high_error = (target - numerator / high as f64).abs();
        let low_error = (target - numerator / low as f64).abs();
        let denominator = if high_error < low_error { high } else { low };
        Meter::new(self.numerator, denominator)
    }
}

impl Default for Meter {
    fn default() -> Self {
        Meter::COMMON_TIME
    }
}

impl fmt::Display for Meter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.numerator, self.denominator)
    }
}

/// Everything derived from a meter, a tempo and a resolution.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MeterSync {
    /// The meter as it is actually played.
    pub meter: Meter,
    /// The meter as it is written to MIDI.
    pub midi_meter: Meter,
    /// `midi_meter.ratio() / meter.ratio()`.
    pub sync_factor: f64,
    /// Tempo written to MIDI so that measures keep their real duration.
    pub midi_tempo: f64,
    pub ticks_per_second: f64,
    pub ticks_per_measure: f64,
    pub seconds_per_measure: f64,
}

impl MeterSync {
    /// Computes the spoofed meter and the timing constants that go with it.
    ///
    /// # Arguments
    ///
    /// * `meter` - The real meter
    /// * `tempo` - Quarter notes per minute
    /// * `ppq` - Pulses per quarter note
    ///
    /// # Errors
    ///
    /// `InvalidMeter` for a zero numerator or denominator, `InvalidTempo` for a
    /// tempo that is not finite and positive, `InvalidResolution` for `ppq == 0`.
    pub fn compute(meter: Meter, tempo: f64, ppq: u32) -> Result<Self> {
        meter.validate()?;
        if !tempo.is_finite() || tempo <= 0.0 {
            return Err(TimingError::InvalidTempo { tempo });
        }
        if ppq == 0 {
            return Err(TimingError::InvalidResolution { ppq });
        }

        let midi_meter = meter.midi_compatible();
        let meter_ratio = meter.ratio();
        let midi_ratio = midi_meter.ratio();
        let sync_factor = midi_ratio / meter_ratio;
        let midi_tempo = tempo * sync_factor;
        let ppq = ppq as f64;

        Ok(Self {
            meter,
            midi_meter,
            sync_factor,
            midi_tempo,
            ticks_per_second: midi_tempo * ppq / 60.0,
            ticks_per_measure: ppq * 4.0 * midi_ratio,
            seconds_per_measure: (60.0 / tempo) * 4.0 * meter_ratio,
        })
    }

    /// Whether the written meter differs from the played one.
    pub fn is_spoofed(&self) -> bool {
        self.meter != self.midi_meter
    }
}

/// Power of two of a MIDI-compatible denominator, as written in the time
/// signature meta event (4 -> 2, 8 -> 3).
pub fn denominator_to_power(denominator: u32) -> u8 {
    if denominator.is_power_of_two() {
        denominator.trailing_zeros() as u8
    } else {
        2
    }
}
