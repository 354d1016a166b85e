//! Per-channel effect state machines.
//!
//! Each effect family keeps its own small state struct on the channel:
//! the vibrato and tremolo share the [`Oscillator`], tone portamento walks a
//! recorded target, volume slides remember their nibbles, and the retrigger
//! counts ticks against its interval. Oscillator and arpeggio output is
//! transient: it shapes the effective period or volume of a single tick and
//! never touches the stored value.
use lazy_static::lazy_static;

use crate::module::NotePitch;

const SINE_PERIOD: usize = 64;

lazy_static! {
    // one cycle of the vibrato/tremolo waveform
    static ref SINE: [f64; SINE_PERIOD] = {
        use core::f64::consts::PI;
        let mut table = [0.0; SINE_PERIOD];
        for (n, p) in table.iter_mut().enumerate() {
            *p = (2.0 * PI * n as f64 / SINE_PERIOD as f64).sin();
        }
        table
    };
}

/// A sine oscillator with a period of 64 ticks.
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct Oscillator {
    position: u8,
    speed: u8,
    depth: u8,
}

impl Oscillator {
    /// Updates speed and depth, retaining the previous value for any zero
    /// nibble.
    pub fn configure(&mut self, speed: u8, depth: u8) {
        if speed != 0 {
            self.speed = speed;
        }
        if depth != 0 {
            self.depth = depth;
        }
    }

    pub fn reset(&mut self) {
        self.position = 0;
    }

    pub fn advance(&mut self, ticks: u32) {
        let step = self.speed as u32 * ticks;
        self.position = ((self.position as u32 + step) % SINE_PERIOD as u32) as u8;
    }

    pub fn depth(&self) -> u8 {
        self.depth
    }

    /// The current waveform value scaled by `scale`.
    pub fn offset(&self, scale: f64) -> f64 {
        scale * SINE[self.position as usize]
    }
}

/// Tone-portamento target and per-tick rate.
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct TonePortamento {
    target: f64,
    rate: f64,
}

impl TonePortamento {
    pub fn retarget(&mut self, target: f64) {
        self.target = target;
    }

    /// Updates the rate, retaining the previous one when zero (effect
    /// memory).
    pub fn set_rate(&mut self, rate: f64) {
        if rate > 0.0 {
            self.rate = rate;
        }
    }

    pub fn is_active(&self) -> bool {
        self.target > 0.0
    }

    /// Walks `period` toward the target, clamping exactly at the target.
    pub fn step(&self, period: f64, ticks: u32) -> f64 {
        if !self.is_active() || period <= 0.0 {
            return period;
        }
        let delta = self.rate * ticks as f64;
        if period > self.target {
            (period - delta).max(self.target)
        } else {
            (period + delta).min(self.target)
        }
    }
}

/// Volume-slide nibbles, in volume units per tick.
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct VolumeSlide {
    up: u8,
    down: u8,
}

impl VolumeSlide {
    /// Overwrites both nibbles unconditionally (MOD).
    pub fn assign(&mut self, up: u8, down: u8) {
        self.up = up;
        self.down = down;
    }

    /// Updates the nibbles, retaining the previous pair when both are zero
    /// (S3M effect memory).
    pub fn remember(&mut self, up: u8, down: u8) {
        if up != 0 || down != 0 {
            self.assign(up, down);
        }
    }

    pub fn apply(&self, volume: f64, ticks: u32) -> f64 {
        let step = (self.up as f64 - self.down as f64) * ticks as f64;
        (volume + step).clamp(0.0, 64.0)
    }
}

/// Retrigger interval and volume rule (S3M Qxy).
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct Retrigger {
    interval: u8,
    rule: u8,
    counter: u8,
}

impl Retrigger {
    /// Updates interval and rule, retaining previous nonzero values, and
    /// restarts the tick counter.
    pub fn configure(&mut self, interval: u8, rule: u8) {
        if interval != 0 {
            self.interval = interval;
        }
        if rule != 0 {
            self.rule = rule;
        }
        self.counter = 0;
    }

    /// Counts one tick; `true` when the sample should restart.
    pub fn tick(&mut self) -> bool {
        if self.interval == 0 {
            return false;
        }
        self.counter += 1;
        if self.counter >= self.interval {
            self.counter = 0;
            true
        } else {
            false
        }
    }

    /// The volume after one retrigger, per the 16-entry rule table.
    pub fn adjust(&self, volume: f64) -> f64 {
        let adjusted = match self.rule {
            0x1 => volume - 1.0,
            0x2 => volume - 2.0,
            0x3 => volume - 4.0,
            0x4 => volume - 8.0,
            0x5 => volume - 16.0,
            0x6 => volume * 2.0 / 3.0,
            0x7 => volume * 0.5,
            0x9 => volume + 1.0,
            0xa => volume + 2.0,
            0xb => volume + 4.0,
            0xc => volume + 8.0,
            0xd => volume + 16.0,
            0xe => volume * 1.5,
            0xf => volume * 2.0,
            // 0 and 8 leave the volume unchanged
            _ => volume,
        };
        adjusted.clamp(0.0, 64.0)
    }
}

/// A note cell deferred by a note-delay effect, applied by the tick handler
/// once `ticks` ticks of the row have elapsed.
#[derive(Debug, Clone, Copy)]
pub(crate) struct PendingNote {
    pub ticks: u8,
    pub pitch: NotePitch,
    pub instrument: u8,
    pub volume: Option<u8>,
}
