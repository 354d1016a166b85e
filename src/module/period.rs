//! The Amiga period table and period/frequency conversions.
//!
//! Pitch is expressed as an Amiga *period*: the number of clock ticks
//! between consecutive sample fetches, so a lower period means a higher
//! pitch. MOD cells carry periods directly; S3M cells carry an octave and a
//! semitone that are resolved through [`period`].
use lazy_static::lazy_static;

/// Amiga (NTSC) clock constant used for MOD playback rates.
pub const AMIGA_CLOCK: f64 = 7_159_090.5;
/// Clock constant used for S3M playback rates.
pub const S3M_CLOCK: f64 = 14_317_056.0;
/// The sample rate an instrument plays at on its middle-C reference note.
pub const MIDDLE_C_RATE: f64 = 8363.0;

pub const SEMITONES_PER_OCTAVE: usize = 12;
pub const OCTAVES: usize = 8;

// Periods of the lowest table octave, C through B.
const BASE_PERIODS: [f64; SEMITONES_PER_OCTAVE] = [
    1712.0, 1616.0, 1525.0, 1440.0, 1357.0, 1281.0,
    1209.0, 1141.0, 1077.0, 1017.0, 961.0, 907.0,
];

lazy_static! {
    static ref PERIODS: [[f64; SEMITONES_PER_OCTAVE]; OCTAVES] = {
        let mut table = [[0.0; SEMITONES_PER_OCTAVE]; OCTAVES];
        for (octave, row) in table.iter_mut().enumerate() {
            for (semitone, period) in row.iter_mut().enumerate() {
                *period = BASE_PERIODS[semitone] * 16.0 / (1u32 << octave) as f64;
            }
        }
        table
    };
}

/// Returns the period of the given note, or `None` when the octave or
/// semitone falls outside the table.
pub fn period(octave: u8, semitone: u8) -> Option<f64> {
    PERIODS.get(octave as usize)?.get(semitone as usize).copied()
}

/// Playback frequency in Hz of an Amiga period (MOD).
pub fn amiga_frequency(period: f64) -> f64 {
    AMIGA_CLOCK / (period * 2.0)
}

/// Playback frequency in Hz of an S3M period, for an instrument with the
/// given middle-C reference rate.
pub fn s3m_frequency(period: f64, middle_c: f64) -> f64 {
    let effective = MIDDLE_C_RATE * period / middle_c;
    S3M_CLOCK / effective
}

/// Shifts a period by a number of semitones; a positive shift raises the
/// pitch.
pub fn shift_semitones(period: f64, semitones: f64) -> f64 {
    period / (semitones / SEMITONES_PER_OCTAVE as f64).exp2()
}
