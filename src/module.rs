//! The format-neutral in-memory song model.
//!
//! A [`Module`] bundles digitized [`Instrument`] samples, a table of
//! [`Pattern`]s (64 rows of [`Note`] cells, one per channel) and the order
//! list that sequences the patterns into a song. After loading, nothing in
//! the model depends on which file format it came from except the
//! [`ModuleFormat`] tag, which selects the period/frequency conversion and a
//! few effect-rate rules during playback.
use core::fmt;

use arrayvec::ArrayVec;
use log::warn;

pub mod flags;
pub mod period;
mod parse;

use flags::PAN_CENTER;

/// Number of rows in every pattern.
pub const ROWS_PER_PATTERN: usize = 64;
/// Highest number of channel slots a module can address.
pub const MAX_CHANNELS: usize = 32;

/// The file format a module was loaded from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModuleFormat {
    /// Amiga ProTracker.
    Mod,
    /// Scream Tracker 3.
    S3m,
}

impl fmt::Display for ModuleFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModuleFormat::Mod => "MOD",
            ModuleFormat::S3m => "S3M",
        }.fmt(f)
    }
}

/// A tracker song.
#[derive(Debug, Clone)]
pub struct Module {
    pub format: ModuleFormat,
    /// Song name from the file header.
    pub name: String,
    /// Pattern indices in playing order.
    pub orders: Box<[u8]>,
    pub patterns: Box<[Pattern]>,
    pub instruments: Box<[Instrument]>,
    /// Default panning per playing channel, 0 (left) to 15 (right).
    pub channel_pans: ArrayVec<u8, MAX_CHANNELS>,
    /// Ticks per row the song starts with.
    pub initial_speed: u8,
    /// Tempo in BPM the song starts with.
    pub initial_tempo: u8,
    /// Song-wide volume, 0..=64.
    pub global_volume: u8,
    /// Whether channels produce stereo sample pairs.
    pub stereo: bool,
    /// Sparse channel slot -> playing channel index (S3M headers address 32
    /// slots of which only some are enabled).
    channel_map: [Option<u8>; MAX_CHANNELS],
}

impl Module {
    /// Creates a module with `channels` playing channels, no patterns and no
    /// instruments. Channel slots map onto playing channels one to one.
    pub fn empty(format: ModuleFormat, channels: usize) -> Module {
        let channels = channels.min(MAX_CHANNELS);
        let mut channel_map = [None; MAX_CHANNELS];
        for (slot, index) in channel_map.iter_mut().take(channels).enumerate() {
            *index = Some(slot as u8);
        }
        Module {
            format,
            name: String::new(),
            orders: Box::new([]),
            patterns: Box::new([]),
            instruments: Box::new([]),
            channel_pans: (0..channels).map(|_| PAN_CENTER).collect(),
            initial_speed: 6,
            initial_tempo: 125,
            global_volume: 64,
            stereo: false,
            channel_map,
        }
    }

    /// The number of orders in the song.
    pub fn song_length(&self) -> usize {
        self.orders.len()
    }

    /// The number of playing channels.
    pub fn channel_count(&self) -> usize {
        self.channel_pans.len()
    }

    /// The pattern index played at the given order.
    pub fn pattern_index(&self, order: usize) -> usize {
        self.orders.get(order).copied().unwrap_or(0) as usize
    }

    /// The pattern played at the given order, if it exists.
    pub fn pattern_at_order(&self, order: usize) -> Option<&Pattern> {
        self.patterns.get(self.pattern_index(order))
    }

    /// The note cell at the given position, or an empty cell when any index
    /// is out of range.
    pub fn note_at(&self, order: usize, row: usize, channel: usize) -> Note {
        self.pattern_at_order(order)
            .and_then(|pattern| pattern.rows.get(row))
            .and_then(|row| row.notes.get(channel))
            .copied()
            .unwrap_or_default()
    }

    /// Looks up an instrument by its 1-based cell number.
    pub fn instrument(&self, number: u8) -> Option<&Instrument> {
        let index = (number as usize).checked_sub(1)?;
        self.instruments.get(index)
    }

    /// The playing channel behind a sparse channel slot, if the slot is
    /// enabled.
    pub fn channel_index(&self, slot: u8) -> Option<usize> {
        (*self.channel_map.get(slot as usize)?).map(usize::from)
    }

    pub(crate) fn set_channel_map(&mut self, channel_map: [Option<u8>; MAX_CHANNELS]) {
        self.channel_map = channel_map;
    }
}

/// A 64-row grid of note cells, one column per playing channel.
#[derive(Debug, Clone)]
pub struct Pattern {
    pub rows: Box<[Row]>,
}

impl Pattern {
    /// Creates a pattern of 64 empty rows.
    pub fn empty(channels: usize) -> Pattern {
        let rows = (0..ROWS_PER_PATTERN).map(|_| Row::empty(channels)).collect();
        Pattern { rows }
    }
}

/// One horizontal slice of a pattern, played at a single time step.
#[derive(Debug, Clone)]
pub struct Row {
    pub notes: Box<[Note]>,
}

impl Row {
    pub fn empty(channels: usize) -> Row {
        Row { notes: vec![Note::default(); channels].into_boxed_slice() }
    }
}

/// The pitch command of a note cell.
#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub enum NotePitch {
    /// The cell leaves the channel's pitch alone.
    #[default]
    None,
    /// Stop the playing sample.
    KeyOff,
    /// Play at the given period.
    Period(f64),
}

/// One cell of a pattern row.
///
/// Every field is independently optional and a missing field is distinct
/// from a zero value: an absent instrument number reuses the channel's
/// current instrument, an absent volume leaves the channel volume alone.
#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub struct Note {
    pub pitch: NotePitch,
    /// Instrument number, 1-based; 0 when the cell carries none.
    pub instrument: u8,
    /// Volume column, 0..=64.
    pub volume: Option<u8>,
    pub effect: Effect,
}

impl Note {
    pub fn is_empty(&self) -> bool {
        *self == Note::default()
    }
}

/// A decoded note-cell effect command.
///
/// Parameters are stored pre-split the way the effect consumes them, so the
/// playback code can match exhaustively instead of re-deriving nibbles from
/// a raw code/parameter pair.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum Effect {
    #[default]
    None,
    /// Cycle the pitch between the base note and two semitone offsets.
    Arpeggio { first: u8, second: u8 },
    /// Slide the period down (pitch up) every tick.
    PortamentoUp(u8),
    /// Slide the period up (pitch down) every tick.
    PortamentoDown(u8),
    /// One-shot period decrease applied at the row.
    FinePortamentoUp(u8),
    /// One-shot period increase applied at the row.
    FinePortamentoDown(u8),
    /// Glide toward the period of the cell's note instead of triggering it.
    TonePortamento(u8),
    Vibrato { speed: u8, depth: u8 },
    Tremolo { speed: u8, depth: u8 },
    SetVolume(u8),
    VolumeSlide { up: u8, down: u8 },
    /// One-shot volume slide applied at the row.
    FineVolumeSlide { up: u8, down: u8 },
    TonePortamentoVolumeSlide { up: u8, down: u8 },
    VibratoVolumeSlide { up: u8, down: u8 },
    /// Start sample playback at `parameter * 256`.
    SampleOffset(u8),
    /// Continue at the given order once the current row finishes.
    PositionJump(u8),
    /// Advance to the next order once the current row finishes, starting at
    /// the given row.
    PatternBreak(u8),
    SetSpeed(u8),
    SetTempo(u8),
    /// Restart the sample every `ticks` ticks, adjusting the volume by the
    /// 16-entry retrigger rule table.
    Retrigger { ticks: u8, volume: u8 },
    SetGlobalVolume(u8),
    /// Trigger the cell's note only after the given number of ticks.
    NoteDelay(u8),
    /// Silence the channel at the given tick.
    NoteCut(u8),
    /// Set channel panning, 0..=15.
    SetPanning(u8),
}

/// A digitized instrument sample.
#[derive(Debug, Clone)]
pub struct Instrument {
    pub name: String,
    /// PCM data in [-1, +1]. Not scaled by the default volume.
    pub data: Box<[f32]>,
    /// Sample rate in Hz this instrument plays at on its middle-C reference
    /// note.
    pub middle_c: f64,
    /// Default volume, 0..=64, applied when a cell triggers the instrument.
    pub volume: u8,
    pub looped: bool,
    pub loop_start: usize,
    /// Exclusive; `loop_start < loop_end <= len()` whenever `looped`.
    pub loop_end: usize,
}

impl Default for Instrument {
    fn default() -> Instrument {
        Instrument {
            name: String::new(),
            data: Box::new([]),
            middle_c: period::MIDDLE_C_RATE,
            volume: 64,
            looped: false,
            loop_start: 0,
            loop_end: 0,
        }
    }
}

impl Instrument {
    /// Length of the sample data in samples.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Forces the loop bounds and reference rate into range, dropping
    /// degenerate loops.
    pub(crate) fn sanitize(&mut self) {
        if !(self.middle_c > 0.0) {
            warn!("instrument {:?} has no reference rate, assuming {}", self.name, period::MIDDLE_C_RATE);
            self.middle_c = period::MIDDLE_C_RATE;
        }
        if self.looped {
            self.loop_end = self.loop_end.min(self.len());
            if self.loop_start >= self.loop_end {
                warn!("instrument {:?} has a degenerate loop {}..{}", self.name, self.loop_start, self.loop_end);
                self.looped = false;
                self.loop_start = 0;
                self.loop_end = 0;
            }
        }
        self.volume = self.volume.min(64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_module_maps_channels_one_to_one() {
        let module = Module::empty(ModuleFormat::Mod, 4);
        assert_eq!(module.channel_count(), 4);
        assert_eq!(module.channel_index(0), Some(0));
        assert_eq!(module.channel_index(3), Some(3));
        assert_eq!(module.channel_index(4), None);
    }

    #[test]
    fn note_lookup_is_total() {
        let mut module = Module::empty(ModuleFormat::Mod, 4);
        module.orders = Box::new([0]);
        module.patterns = Box::new([Pattern::empty(4)]);
        assert!(module.note_at(0, 0, 0).is_empty());
        // out-of-range positions read as empty cells instead of panicking
        assert!(module.note_at(7, 70, 9).is_empty());
    }

    #[test]
    fn instrument_numbers_are_one_based() {
        let mut module = Module::empty(ModuleFormat::Mod, 4);
        module.instruments = Box::new([Instrument { name: "kick".into(), ..Instrument::default() }]);
        assert!(module.instrument(0).is_none());
        assert_eq!(module.instrument(1).map(|i| i.name.as_str()), Some("kick"));
        assert!(module.instrument(2).is_none());
    }

    #[test]
    fn degenerate_loops_are_dropped() {
        let mut instrument = Instrument {
            data: vec![0.0; 8].into_boxed_slice(),
            looped: true,
            loop_start: 6,
            loop_end: 4,
            ..Instrument::default()
        };
        instrument.sanitize();
        assert!(!instrument.looped);

        let mut instrument = Instrument {
            data: vec![0.0; 8].into_boxed_slice(),
            looped: true,
            loop_start: 2,
            loop_end: 100,
            ..Instrument::default()
        };
        instrument.sanitize();
        assert!(instrument.looped);
        assert_eq!(instrument.loop_end, 8);
    }
}
