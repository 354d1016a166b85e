//! The per-channel playback voice.
//!
//! A channel is a state machine with two clocks. The row clock fires when
//! the sequencer enters a new row: the channel snapshots its note cell,
//! triggers notes and instruments and latches the row's effect. The tick
//! clock fires once per tick inside the row and runs the continuous part of
//! the latched effect. Between clock events the channel resamples its
//! active instrument into a private ring buffer that the host's audio sink
//! drains through [`ChannelReader`].
use std::io::{self, Read};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use log::debug;

use crate::buffer::{AudioBuffer, OverflowPolicy};
use crate::module::{Effect, Instrument, Module, ModuleFormat, Note, NotePitch};
use crate::module::flags::PAN_CENTER;
use crate::module::period;
use super::Sequencer;
use super::effects::{Oscillator, PendingNote, Retrigger, TonePortamento, VolumeSlide};

const MIN_PERIOD: f64 = 1.0;
const MAX_PERIOD: f64 = 2000.0;

// scope buffers hold a fifth of a second, enough for any visualization frame
const SCOPE_FRACTION: usize = 5;

pub(crate) struct Channel {
    number: usize,
    stereo: bool,
    format: ModuleFormat,
    buffer: Arc<AudioBuffer>,
    scope: Arc<AudioBuffer>,
    muted: Arc<AtomicBool>,

    instrument: Option<usize>,
    sample_position: f64,
    period: f64,
    volume: f64,
    panning: u8,
    pub(crate) current_row: i64,
    row_tick: u32,

    effect: Effect,
    vibrato: Oscillator,
    tremolo: Oscillator,
    tone_portamento: TonePortamento,
    volume_slide: VolumeSlide,
    retrigger: Retrigger,
    pending: Option<PendingNote>,
    cut_at: Option<u8>,
    porta_memory: u8,
    offset_memory: u8,
}

impl Channel {
    pub fn new(number: usize, module: &Module, sample_rate: u32) -> Channel {
        let samples = sample_rate as usize;
        Channel {
            number,
            stereo: module.stereo,
            format: module.format,
            // two seconds of buffering tolerates sequencer-thread jitter
            buffer: Arc::new(AudioBuffer::new(samples * 2, OverflowPolicy::DropNewest)),
            scope: Arc::new(AudioBuffer::new(samples / SCOPE_FRACTION, OverflowPolicy::OverwriteOldest)),
            muted: Arc::new(AtomicBool::new(false)),
            instrument: None,
            sample_position: 0.0,
            period: 0.0,
            volume: 0.0,
            panning: module.channel_pans.get(number).copied().unwrap_or(PAN_CENTER),
            current_row: -1,
            row_tick: 0,
            effect: Effect::None,
            vibrato: Oscillator::default(),
            tremolo: Oscillator::default(),
            tone_portamento: TonePortamento::default(),
            volume_slide: VolumeSlide::default(),
            retrigger: Retrigger::default(),
            pending: None,
            cut_at: None,
            porta_memory: 0,
            offset_memory: 0,
        }
    }

    pub fn number(&self) -> usize {
        self.number
    }

    #[cfg(test)]
    pub fn period(&self) -> f64 {
        self.period
    }

    #[cfg(test)]
    pub fn volume(&self) -> f64 {
        self.volume
    }

    #[cfg(test)]
    pub fn sample_position(&self) -> f64 {
        self.sample_position
    }

    /// Snapshots and applies the note cell of a freshly entered row.
    pub fn update_row(&mut self, row: i64, note: &Note, module: &Module, seq: &mut Sequencer) {
        self.current_row = row;
        self.row_tick = 0;
        self.effect = Effect::None;
        self.cut_at = None;
        // a delayed note that never came due is abandoned
        self.pending = None;

        if let Effect::NoteDelay(ticks) = note.effect {
            if ticks > 0 {
                self.pending = Some(PendingNote {
                    ticks,
                    pitch: note.pitch,
                    instrument: note.instrument,
                    volume: note.volume,
                });
                self.effect = note.effect;
                return;
            }
        }

        self.apply_cell(note, module);
        self.apply_row_effect(note, module, seq);
    }

    /// Applies the pitch, instrument and volume columns of a cell.
    fn apply_cell(&mut self, note: &Note, module: &Module) {
        let tone_portamento = matches!(
            note.effect,
            Effect::TonePortamento(_) | Effect::TonePortamentoVolumeSlide { .. }
        );

        if note.instrument != 0 {
            match module.instrument(note.instrument) {
                Some(instrument) => {
                    self.instrument = Some(note.instrument as usize - 1);
                    self.volume = instrument.volume as f64;
                }
                None => {
                    debug!("channel {}: no instrument {}", self.number, note.instrument);
                    self.instrument = None;
                }
            }
        }

        match note.pitch {
            NotePitch::None => {}
            NotePitch::KeyOff => {
                self.instrument = None;
            }
            NotePitch::Period(target) => {
                if tone_portamento {
                    // glide from the current pitch instead of triggering
                    self.tone_portamento.retarget(target);
                } else {
                    self.period = target;
                    self.sample_position = 0.0;
                    self.vibrato.reset();
                    self.tremolo.reset();
                }
            }
        }

        if let Some(volume) = note.volume {
            self.volume = volume.min(64) as f64;
        }
    }

    /// Latches the row effect and runs its one-shot part.
    fn apply_row_effect(&mut self, note: &Note, module: &Module, seq: &mut Sequencer) {
        self.effect = note.effect;
        match note.effect {
            Effect::None | Effect::Arpeggio { .. } | Effect::NoteDelay(_) => {}
            Effect::PortamentoUp(parameter) | Effect::PortamentoDown(parameter) => {
                self.remember_porta(parameter);
            }
            Effect::FinePortamentoUp(value) => {
                let value = self.remember_porta(value);
                let rate = self.slide_rate(value);
                self.period = (self.period - rate).max(MIN_PERIOD);
            }
            Effect::FinePortamentoDown(value) => {
                let value = self.remember_porta(value);
                let rate = self.slide_rate(value);
                self.period = (self.period + rate).min(self.period.max(MAX_PERIOD));
            }
            Effect::TonePortamento(parameter) => {
                let rate = self.slide_rate(parameter);
                self.tone_portamento.set_rate(rate);
            }
            Effect::Vibrato { speed, depth } => {
                self.vibrato.configure(speed, depth);
            }
            Effect::Tremolo { speed, depth } => {
                self.tremolo.configure(speed, depth);
            }
            Effect::SetVolume(volume) => {
                self.volume = volume.min(64) as f64;
            }
            Effect::VolumeSlide { up, down }
            | Effect::TonePortamentoVolumeSlide { up, down }
            | Effect::VibratoVolumeSlide { up, down } => {
                match self.format {
                    ModuleFormat::Mod => self.volume_slide.assign(up, down),
                    ModuleFormat::S3m => self.volume_slide.remember(up, down),
                }
            }
            Effect::FineVolumeSlide { up, down } => {
                self.volume = (self.volume + up as f64 - down as f64).clamp(0.0, 64.0);
            }
            Effect::SampleOffset(parameter) => {
                if parameter != 0 {
                    self.offset_memory = parameter;
                }
                self.sample_position = self.offset_memory as f64 * 256.0;
                if let Some(instrument) = self.instrument.and_then(|i| module.instruments.get(i)) {
                    self.sample_position = self.sample_position.min(instrument.len() as f64);
                }
            }
            Effect::PositionJump(order) => seq.schedule_jump(order),
            Effect::PatternBreak(row) => seq.schedule_break(row),
            Effect::SetSpeed(speed) => seq.set_speed(speed),
            Effect::SetTempo(tempo) => seq.set_tempo(tempo),
            Effect::Retrigger { ticks, volume } => self.retrigger.configure(ticks, volume),
            Effect::SetGlobalVolume(volume) => seq.set_global_volume(volume),
            Effect::NoteCut(tick) if tick == 0 => self.volume = 0.0,
            Effect::NoteCut(tick) => self.cut_at = Some(tick),
            Effect::SetPanning(pan) => self.panning = pan.min(15),
        }
    }

    /// Runs the continuous part of the latched effect for `ticks` elapsed
    /// ticks. `change_row` marks the tick that entered the row, whose values
    /// the row apply already produced.
    pub fn update_tick(&mut self, change_row: bool, ticks: u32, module: &Module) {
        if change_row {
            return;
        }
        self.row_tick += ticks;

        if let Some(pending) = self.pending {
            if self.row_tick >= pending.ticks as u32 {
                self.pending = None;
                let cell = Note {
                    pitch: pending.pitch,
                    instrument: pending.instrument,
                    volume: pending.volume,
                    effect: Effect::None,
                };
                self.apply_cell(&cell, module);
            }
            return;
        }

        match self.effect {
            Effect::PortamentoUp(_) => {
                let rate = self.slide_rate(self.porta_memory);
                self.period = (self.period - rate * ticks as f64).max(MIN_PERIOD);
            }
            Effect::PortamentoDown(_) => {
                let rate = self.slide_rate(self.porta_memory);
                self.period = (self.period + rate * ticks as f64).min(self.period.max(MAX_PERIOD));
            }
            Effect::TonePortamento(_) => {
                self.period = self.tone_portamento.step(self.period, ticks);
            }
            Effect::TonePortamentoVolumeSlide { .. } => {
                self.period = self.tone_portamento.step(self.period, ticks);
                self.volume = self.volume_slide.apply(self.volume, ticks);
            }
            Effect::Vibrato { .. } => self.vibrato.advance(ticks),
            Effect::VibratoVolumeSlide { .. } => {
                self.vibrato.advance(ticks);
                self.volume = self.volume_slide.apply(self.volume, ticks);
            }
            Effect::Tremolo { .. } => self.tremolo.advance(ticks),
            Effect::VolumeSlide { .. } => {
                self.volume = self.volume_slide.apply(self.volume, ticks);
            }
            Effect::Retrigger { .. } => {
                for _ in 0..ticks {
                    if self.retrigger.tick() {
                        self.sample_position = 0.0;
                        self.volume = self.retrigger.adjust(self.volume);
                    }
                }
            }
            _ => {}
        }

        if let Some(cut) = self.cut_at {
            if self.row_tick >= cut as u32 {
                self.volume = 0.0;
                self.cut_at = None;
            }
        }
    }

    fn remember_porta(&mut self, parameter: u8) -> u8 {
        if parameter != 0 {
            self.porta_memory = parameter;
        }
        self.porta_memory
    }

    // period units a slide parameter is worth per tick
    fn slide_rate(&self, parameter: u8) -> f64 {
        match self.format {
            ModuleFormat::Mod => parameter as f64,
            ModuleFormat::S3m => parameter as f64 * 4.0,
        }
    }

    /// The period shaped by transient pitch effects for this tick.
    fn effective_period(&self) -> f64 {
        match self.effect {
            Effect::Arpeggio { first, second } => {
                let shift = match self.row_tick % 3 {
                    1 => first,
                    2 => second,
                    _ => 0,
                };
                if shift == 0 {
                    self.period
                } else {
                    period::shift_semitones(self.period, shift as f64)
                }
            }
            Effect::Vibrato { .. } | Effect::VibratoVolumeSlide { .. } => {
                let scale = match self.format {
                    ModuleFormat::Mod => self.vibrato.depth() as f64 * 2.0,
                    ModuleFormat::S3m => self.vibrato.depth() as f64 * 6.0,
                };
                (self.period + self.vibrato.offset(scale)).max(MIN_PERIOD)
            }
            _ => self.period,
        }
    }

    /// The volume shaped by transient volume effects for this tick.
    fn effective_volume(&self) -> f64 {
        match self.effect {
            Effect::Tremolo { .. } => {
                let offset = self.tremolo.offset(self.tremolo.depth() as f64 / 16.0);
                (self.volume / 64.0 + offset).clamp(0.0, 1.0) * 64.0
            }
            _ => self.volume,
        }
    }

    fn frequency(&self, instrument: &Instrument) -> f64 {
        let period = self.effective_period();
        if period <= 0.0 {
            return 0.0;
        }
        match self.format {
            ModuleFormat::Mod => {
                period::amiga_frequency(period) * instrument.middle_c / period::MIDDLE_C_RATE
            }
            ModuleFormat::S3m => period::s3m_frequency(period, instrument.middle_c),
        }
    }

    /// Resamples the active instrument for `delta` seconds of output into
    /// the channel's ring buffer, padding with silence where the sample runs
    /// out. Stereo channels write interleaved left/right pairs.
    pub fn generate(&mut self, delta: f64, module: &Module, sample_rate: u32, global_volume: f64) {
        let samples = (delta * sample_rate as f64).round() as usize;
        if samples == 0 {
            return;
        }

        let mut out = self.buffer.writer();
        let mut scope = self.scope.writer();
        let mut written = 0;

        // a pending delayed note keeps the channel silent for now
        let index = if self.pending.is_none() { self.instrument } else { None };
        if let Some(instrument) = index.and_then(|i| module.instruments.get(i)) {
            let frequency = self.frequency(instrument);
            if frequency > 0.0 && !instrument.is_empty() {
                let increment = frequency / sample_rate as f64;
                let amplitude = ((self.effective_volume() / 64.0) * (global_volume / 64.0)) as f32;
                let (left, right) = pan_weights(self.panning);
                let end = if instrument.looped {
                    instrument.loop_end
                } else {
                    instrument.len()
                };

                while written < samples {
                    let mut position = self.sample_position as usize;
                    if position >= end {
                        if instrument.looped {
                            self.sample_position = instrument.loop_start as f64;
                            position = instrument.loop_start;
                        } else {
                            self.sample_position = instrument.len() as f64;
                            break;
                        }
                    }
                    let value = instrument.data[position] * amplitude;
                    if self.stereo {
                        out.push(value * left);
                        out.push(value * right);
                    } else {
                        out.push(value);
                    }
                    scope.push(value);
                    self.sample_position += increment;
                    written += 1;
                }
            }
        }

        for _ in written..samples {
            out.push(0.0);
            if self.stereo {
                out.push(0.0);
            }
            scope.push(0.0);
        }
    }

    /// Hands out a detached reader draining this channel's ring buffer.
    pub fn reader(&self) -> ChannelReader {
        ChannelReader {
            buffer: Arc::clone(&self.buffer),
            muted: Arc::clone(&self.muted),
            scratch: vec![0.0; 4096],
            duplicate: !self.stereo,
        }
    }

    /// Drains queued samples for the offline mixer.
    pub fn drain(&self, data: &mut [f32]) -> usize {
        if self.muted.load(Ordering::Relaxed) {
            self.buffer.clear();
            return 0;
        }
        self.buffer.read(data)
    }

    pub fn peek_scope(&self, data: &mut [f32]) -> usize {
        self.scope.peek(data)
    }

    pub fn is_muted(&self) -> bool {
        self.muted.load(Ordering::Relaxed)
    }

    pub fn set_muted(&self, muted: bool) {
        self.muted.store(muted, Ordering::Relaxed);
    }

    /// Rewinds the voice for a transport jump: playback state is dropped,
    /// buffered audio is discarded, effect memory survives.
    pub fn rewind(&mut self) {
        self.instrument = None;
        self.sample_position = 0.0;
        self.period = 0.0;
        self.volume = 0.0;
        self.current_row = -1;
        self.row_tick = 0;
        self.effect = Effect::None;
        self.pending = None;
        self.cut_at = None;
        self.buffer.clear();
        self.scope.clear();
    }
}

fn pan_weights(pan: u8) -> (f32, f32) {
    let pan = pan.min(15) as f32;
    ((15.0 - pan) / 15.0, pan / 15.0)
}

/// Drains a channel's ring buffer as little-endian `f32` PCM bytes.
///
/// MOD channels are mono and every sample is written twice so the stream is
/// always a stereo pair sequence. An empty buffer reads as `Ok(0)` without
/// blocking; hosts that insist on non-empty reads (browser audio) should
/// zero-pad themselves.
pub struct ChannelReader {
    buffer: Arc<AudioBuffer>,
    muted: Arc<AtomicBool>,
    scratch: Vec<f32>,
    duplicate: bool,
}

impl Read for ChannelReader {
    fn read(&mut self, data: &mut [u8]) -> io::Result<usize> {
        if self.muted.load(Ordering::Relaxed) {
            // muted channels emit silence and discard whatever was queued
            self.buffer.clear();
            data.fill(0);
            return Ok(data.len());
        }
        let frame = if self.duplicate { 8 } else { 4 };
        let wanted = (data.len() / frame).min(self.scratch.len());
        let got = self.buffer.read(&mut self.scratch[..wanted]);
        let mut cursor = 0;
        for &value in &self.scratch[..got] {
            let bits = value.to_le_bytes();
            data[cursor..cursor + 4].copy_from_slice(&bits);
            cursor += 4;
            if self.duplicate {
                data[cursor..cursor + 4].copy_from_slice(&bits);
                cursor += 4;
            }
        }
        Ok(cursor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::module::Pattern;

    fn square_module() -> Module {
        let mut module = Module::empty(ModuleFormat::Mod, 4);
        module.orders = Box::new([0]);
        module.patterns = Box::new([Pattern::empty(4)]);
        module.instruments = Box::new([Instrument {
            data: vec![1.0, -1.0].into_boxed_slice(),
            looped: true,
            loop_start: 0,
            loop_end: 2,
            ..Instrument::default()
        }]);
        module
    }

    fn play_note(channel: &mut Channel, module: &Module, period: f64) {
        let mut seq = Sequencer::new(module);
        let note = Note {
            pitch: NotePitch::Period(period),
            instrument: 1,
            ..Note::default()
        };
        channel.update_row(0, &note, module, &mut seq);
    }

    #[test]
    fn triggered_note_fills_the_buffer() {
        let module = square_module();
        let mut channel = Channel::new(0, &module, 44100);
        play_note(&mut channel, &module, 428.0);
        channel.generate(0.01, &module, 44100, 64.0);

        let mut data = [0.0f32; 441];
        assert_eq!(channel.drain(&mut data), 441);
        assert!(data.iter().any(|&v| v > 0.5));
        assert!(data.iter().any(|&v| v < -0.5));
    }

    #[test]
    fn untriggered_channel_emits_silence() {
        let module = square_module();
        let mut channel = Channel::new(1, &module, 44100);
        let mut seq = Sequencer::new(&module);
        channel.update_row(0, &Note::default(), &module, &mut seq);
        channel.generate(0.01, &module, 44100, 64.0);

        let mut data = [1.0f32; 441];
        assert_eq!(channel.drain(&mut data), 441);
        assert!(data.iter().all(|&v| v == 0.0));
    }

    #[test]
    fn sample_position_stays_in_bounds() {
        let mut module = square_module();
        module.instruments[0].looped = false;
        let mut channel = Channel::new(0, &module, 44100);
        play_note(&mut channel, &module, 428.0);
        channel.generate(0.5, &module, 44100, 64.0);
        let length = module.instruments[0].len() as f64;
        assert!(channel.sample_position() >= 0.0);
        assert!(channel.sample_position() <= length);
    }

    #[test]
    fn key_off_stops_the_sample() {
        let module = square_module();
        let mut channel = Channel::new(0, &module, 44100);
        play_note(&mut channel, &module, 428.0);

        let mut seq = Sequencer::new(&module);
        let off = Note { pitch: NotePitch::KeyOff, ..Note::default() };
        channel.update_row(1, &off, &module, &mut seq);
        channel.generate(0.01, &module, 44100, 64.0);

        let mut data = [1.0f32; 441];
        assert_eq!(channel.drain(&mut data), 441);
        assert!(data.iter().all(|&v| v == 0.0));
    }

    #[test]
    fn note_delay_defers_the_trigger() {
        let module = square_module();
        let mut channel = Channel::new(0, &module, 44100);
        let mut seq = Sequencer::new(&module);
        let note = Note {
            pitch: NotePitch::Period(428.0),
            instrument: 1,
            effect: Effect::NoteDelay(2),
            ..Note::default()
        };
        channel.update_row(0, &note, &module, &mut seq);

        // tick 1: still waiting
        channel.update_tick(false, 1, &module);
        channel.generate(0.01, &module, 44100, 64.0);
        let mut data = [1.0f32; 441];
        channel.drain(&mut data);
        assert!(data.iter().all(|&v| v == 0.0));

        // tick 2: the snapshot applies
        channel.update_tick(false, 1, &module);
        channel.generate(0.01, &module, 44100, 64.0);
        channel.drain(&mut data);
        assert!(data.iter().any(|&v| v != 0.0));
    }

    #[test]
    fn note_cut_silences_at_its_tick() {
        let module = square_module();
        let mut channel = Channel::new(0, &module, 44100);
        let mut seq = Sequencer::new(&module);
        let note = Note {
            pitch: NotePitch::Period(428.0),
            instrument: 1,
            effect: Effect::NoteCut(3),
            ..Note::default()
        };
        channel.update_row(0, &note, &module, &mut seq);
        channel.update_tick(false, 2, &module);
        assert_eq!(channel.volume(), 64.0);
        channel.update_tick(false, 1, &module);
        assert_eq!(channel.volume(), 0.0);
    }

    #[test]
    fn muted_reader_emits_zero_bytes() {
        let module = square_module();
        let mut channel = Channel::new(0, &module, 44100);
        play_note(&mut channel, &module, 428.0);
        channel.generate(0.01, &module, 44100, 64.0);
        channel.set_muted(true);

        let mut reader = channel.reader();
        let mut bytes = [1u8; 64];
        assert_eq!(reader.read(&mut bytes).unwrap(), 64);
        assert!(bytes.iter().all(|&b| b == 0));
    }

    #[test]
    fn mono_reader_duplicates_into_stereo_pairs() {
        let module = square_module();
        let mut channel = Channel::new(0, &module, 44100);
        play_note(&mut channel, &module, 428.0);
        channel.generate(0.01, &module, 44100, 64.0);

        let mut reader = channel.reader();
        let mut bytes = [0u8; 16];
        assert_eq!(reader.read(&mut bytes).unwrap(), 16);
        assert_eq!(bytes[0..4], bytes[4..8]);
        assert_eq!(bytes[8..12], bytes[12..16]);
        let first = f32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        assert_eq!(first, 1.0);
    }

    #[test]
    fn stereo_channel_writes_panned_pairs() {
        let mut module = square_module();
        module.format = ModuleFormat::S3m;
        module.stereo = true;
        module.channel_pans[0] = 0; // hard left
        module.instruments[0].data = vec![1.0; 16].into_boxed_slice();
        module.instruments[0].loop_end = 16;
        let mut channel = Channel::new(0, &module, 44100);
        play_note(&mut channel, &module, 1712.0);
        channel.generate(0.01, &module, 44100, 64.0);

        let mut data = [0.0f32; 32];
        assert_eq!(channel.drain(&mut data), 32);
        for pair in data.chunks(2) {
            assert_eq!(pair[0], 1.0);
            assert_eq!(pair[1], 0.0);
        }
    }
}
