//! The playback engine.
//!
//! A [`Player`] owns one [`Channel`](channel) voice per module channel and a
//! sequencer that converts wall-clock time into musical time: the host calls
//! [`Player::update`] at a regular rate (100 Hz works well) and the
//! sequencer advances `tempo * 2/5` ticks per second, one row every `speed`
//! ticks. Row and tick boundaries drive the per-channel effect state
//! machines, after which every channel resamples its instrument into its
//! ring buffer.
//!
//! Audio leaves the engine in one of two ways: per-channel
//! [`ChannelReader`]s for a live sink, or the offline [`PcmRender`] stream
//! that mixes all channels into stereo PCM and ends with the song.
use std::sync::Arc;

use log::debug;

use crate::module::{Module, ModuleFormat, ROWS_PER_PATTERN};

mod channel;
mod effects;
mod mixer;

pub use channel::ChannelReader;
pub use mixer::{write_wav, PcmRender};

use channel::Channel;

/// Playback configuration fixed at player creation.
#[derive(Debug, Clone, Copy)]
pub struct PlayerConfig {
    /// Output sample rate in Hz.
    pub sample_rate: u32,
    /// Restart from the first order when the song ends.
    pub loop_song: bool,
    /// Scale every channel by 1/channel-count in the offline mix, trading
    /// headroom for clipping. MOD songs want this; S3M songs rely on
    /// clipping instead.
    pub normalize_mix: bool,
}

impl PlayerConfig {
    /// The default configuration for a module at the given sample rate.
    pub fn for_module(module: &Module, sample_rate: u32) -> PlayerConfig {
        PlayerConfig {
            sample_rate,
            loop_song: true,
            normalize_mix: module.format == ModuleFormat::Mod,
        }
    }
}

/// Sequencer state plus the control surface row effects act on.
pub(crate) struct Sequencer {
    speed: u32,
    tempo: u32,
    global_volume: f64,
    ticks: f64,
    current_order: usize,
    current_row: i64,
    orders_played: usize,
    pending_jump: Option<u8>,
    pending_break: Option<u8>,
    speed_changed: bool,
    finished: bool,
}

impl Sequencer {
    pub(crate) fn new(module: &Module) -> Sequencer {
        Sequencer {
            speed: module.initial_speed.clamp(1, 31) as u32,
            tempo: (module.initial_tempo as u32).max(32),
            global_volume: module.global_volume.min(64) as f64,
            ticks: 0.0,
            current_order: 0,
            current_row: -1,
            orders_played: 0,
            pending_jump: None,
            pending_break: None,
            speed_changed: false,
            finished: false,
        }
    }

    /// Latches a position jump, consumed when the current row finishes.
    pub(crate) fn schedule_jump(&mut self, order: u8) {
        self.pending_jump = Some(order);
    }

    /// Latches a pattern break, consumed when the current row finishes.
    pub(crate) fn schedule_break(&mut self, row: u8) {
        self.pending_break = Some(row.min(ROWS_PER_PATTERN as u8 - 1));
    }

    pub(crate) fn set_speed(&mut self, speed: u8) {
        if speed == 0 || speed > 0x1f {
            return;
        }
        self.speed = speed as u32;
        self.speed_changed = true;
    }

    pub(crate) fn set_tempo(&mut self, tempo: u8) {
        self.tempo = (tempo as u32).max(32);
        self.speed_changed = true;
    }

    pub(crate) fn set_global_volume(&mut self, volume: u8) {
        self.global_volume = volume.min(64) as f64;
    }
}

/// Handle returned from an observer registration, used to deregister.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenerId(usize);

struct Listeners<F: ?Sized> {
    next_id: usize,
    entries: Vec<(usize, Box<F>)>,
}

impl<F: ?Sized> Listeners<F> {
    fn new() -> Listeners<F> {
        Listeners { next_id: 0, entries: Vec::new() }
    }

    fn add(&mut self, listener: Box<F>) -> ListenerId {
        let id = self.next_id;
        self.next_id += 1;
        self.entries.push((id, listener));
        ListenerId(id)
    }

    fn remove(&mut self, id: ListenerId) -> bool {
        let before = self.entries.len();
        self.entries.retain(|(entry, _)| *entry != id.0);
        self.entries.len() != before
    }
}

/// Plays a [`Module`], one voice per channel.
pub struct Player {
    module: Arc<Module>,
    config: PlayerConfig,
    seq: Sequencer,
    channels: Vec<Channel>,
    on_row: Listeners<dyn FnMut(usize)>,
    on_order: Listeners<dyn FnMut(usize, usize)>,
    on_speed: Listeners<dyn FnMut(u8, u8)>,
}

impl Player {
    pub fn new(module: Module, config: PlayerConfig) -> Player {
        let module = Arc::new(module);
        let channels = (0..module.channel_count())
            .map(|number| Channel::new(number, &module, config.sample_rate))
            .collect();
        Player {
            seq: Sequencer::new(&module),
            module,
            config,
            channels,
            on_row: Listeners::new(),
            on_order: Listeners::new(),
            on_speed: Listeners::new(),
        }
    }

    /// Creates a player with the default configuration for the module.
    pub fn with_sample_rate(module: Module, sample_rate: u32) -> Player {
        let config = PlayerConfig::for_module(&module, sample_rate);
        Player::new(module, config)
    }

    /// Advances the song by `delta` seconds of wall-clock time, running row
    /// and tick transitions and generating `delta` seconds of audio into
    /// every channel's ring buffer. A zero or negative delta is a no-op.
    pub fn update(&mut self, delta: f64) {
        if delta <= 0.0 || self.seq.finished {
            return;
        }
        let Player { module, config, seq, channels, on_row, on_order, on_speed } = self;

        // entering the song applies the first row at tick zero
        let starting = seq.current_row < 0;
        if starting {
            seq.current_row = 0;
        }
        let old_row = seq.current_row;

        let old_ticks = seq.ticks as i64;
        seq.ticks += delta * seq.tempo as f64 * 2.0 / 5.0;
        let new_ticks = seq.ticks as i64;

        let mut order_changed = false;
        if seq.ticks >= seq.speed as f64 {
            seq.ticks -= seq.speed as f64;

            if let Some(order) = seq.pending_jump.take() {
                let row = seq.pending_break.take().unwrap_or(0);
                seq.current_order = order as usize % module.song_length();
                seq.current_row = row as i64;
                seq.orders_played += 1;
                order_changed = true;
            } else if let Some(row) = seq.pending_break.take() {
                seq.current_order += 1;
                seq.current_row = row as i64;
                seq.orders_played += 1;
                order_changed = true;
            } else {
                seq.current_row += 1;
            }

            if seq.current_row >= ROWS_PER_PATTERN as i64 {
                seq.current_row = 0;
                seq.current_order += 1;
                seq.orders_played += 1;
                order_changed = true;
            }
            if seq.current_order >= module.song_length() {
                seq.current_order = 0;
            }

            if order_changed {
                debug!("order {} pattern {}", seq.current_order, module.pattern_index(seq.current_order));
            }

            if seq.orders_played >= module.song_length() && !config.loop_song {
                seq.finished = true;
                return;
            }
        }

        for channel in channels.iter_mut() {
            // an order change re-applies the row even when the row index is
            // unchanged (a position jump can land on the row it left)
            let change_row = order_changed || channel.current_row != seq.current_row;
            if change_row {
                let note = module.note_at(
                    seq.current_order,
                    seq.current_row as usize,
                    channel.number(),
                );
                channel.update_row(seq.current_row, &note, module, seq);
            }
            if new_ticks != old_ticks {
                // the tick that crosses into a fresh row is that row's tick
                // zero, which the row apply already produced
                let row_entry = change_row && !starting;
                channel.update_tick(row_entry, (new_ticks - old_ticks) as u32, module);
            }
            channel.generate(delta, module, config.sample_rate, seq.global_volume);
        }

        if seq.current_row != old_row {
            for (_, listener) in on_row.entries.iter_mut() {
                listener(seq.current_row as usize);
            }
        }
        if order_changed {
            let pattern = module.pattern_index(seq.current_order);
            for (_, listener) in on_order.entries.iter_mut() {
                listener(seq.current_order, pattern);
            }
        }
        if seq.speed_changed {
            seq.speed_changed = false;
            for (_, listener) in on_speed.entries.iter_mut() {
                listener(seq.speed as u8, seq.tempo as u8);
            }
        }
    }

    /// The module being played.
    pub fn module(&self) -> &Module {
        &self.module
    }

    pub fn name(&self) -> &str {
        &self.module.name
    }

    /// Ticks per row.
    pub fn speed(&self) -> u8 {
        self.seq.speed as u8
    }

    /// Beats per minute.
    pub fn tempo(&self) -> u8 {
        self.seq.tempo as u8
    }

    pub fn current_order(&self) -> usize {
        self.seq.current_order
    }

    pub fn current_row(&self) -> usize {
        self.seq.current_row.max(0) as usize
    }

    /// The pattern index at the current order.
    pub fn current_pattern(&self) -> usize {
        self.module.pattern_index(self.seq.current_order)
    }

    pub fn song_length(&self) -> usize {
        self.module.song_length()
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    pub fn is_stereo(&self) -> bool {
        self.module.stereo
    }

    /// Whether a non-looping player has reached the end of the song.
    pub fn finished(&self) -> bool {
        self.seq.finished
    }

    /// Jumps to the start of the next order.
    pub fn next_order(&mut self) {
        self.seq.current_order = (self.seq.current_order + 1) % self.module.song_length();
        self.rewind_row();
    }

    /// Jumps to the start of the previous order.
    pub fn previous_order(&mut self) {
        let length = self.module.song_length();
        self.seq.current_order = (self.seq.current_order + length - 1) % length;
        self.rewind_row();
    }

    /// Restarts the current order from row zero.
    pub fn reset_row(&mut self) {
        self.rewind_row();
    }

    fn rewind_row(&mut self) {
        self.seq.current_row = -1;
        self.seq.ticks = 0.0;
        self.seq.pending_jump = None;
        self.seq.pending_break = None;
        for channel in &mut self.channels {
            channel.rewind();
        }
    }

    /// Toggles a channel's mute flag; returns the new state.
    pub fn toggle_mute(&mut self, channel: usize) -> bool {
        match self.channels.get(channel) {
            Some(channel) => {
                let muted = !channel.is_muted();
                channel.set_muted(muted);
                muted
            }
            None => false,
        }
    }

    pub fn is_muted(&self, channel: usize) -> bool {
        self.channels.get(channel).is_some_and(Channel::is_muted)
    }

    /// A detached reader draining the given channel's PCM as float32 LE
    /// bytes; mono channels are duplicated into stereo pairs.
    pub fn channel_reader(&self, channel: usize) -> Option<ChannelReader> {
        self.channels.get(channel).map(Channel::reader)
    }

    /// Copies the freshest generated samples of a channel for visualization
    /// without consuming them. Returns the number of samples copied.
    pub fn peek_scope(&self, channel: usize, data: &mut [f32]) -> usize {
        self.channels.get(channel).map_or(0, |channel| channel.peek_scope(data))
    }

    /// Consumes the player and renders the whole song to a stereo PCM
    /// stream. The stream is single use; render again with a new player.
    pub fn render_to_pcm(self) -> PcmRender {
        PcmRender::new(self)
    }

    /// Registers an observer fired after the sequencer enters a new row.
    pub fn on_row_change<F: FnMut(usize) + 'static>(&mut self, listener: F) -> ListenerId {
        self.on_row.add(Box::new(listener))
    }

    /// Registers an observer fired after the sequencer enters a new order;
    /// called with the order and its pattern index.
    pub fn on_order_change<F: FnMut(usize, usize) + 'static>(&mut self, listener: F) -> ListenerId {
        self.on_order.add(Box::new(listener))
    }

    /// Registers an observer fired after an effect changes speed or tempo;
    /// called with the new speed and tempo.
    pub fn on_speed_change<F: FnMut(u8, u8) + 'static>(&mut self, listener: F) -> ListenerId {
        self.on_speed.add(Box::new(listener))
    }

    pub fn remove_row_listener(&mut self, id: ListenerId) -> bool {
        self.on_row.remove(id)
    }

    pub fn remove_order_listener(&mut self, id: ListenerId) -> bool {
        self.on_order.remove(id)
    }

    pub fn remove_speed_listener(&mut self, id: ListenerId) -> bool {
        self.on_speed.remove(id)
    }

    pub(crate) fn drain_channel(&self, channel: usize, data: &mut [f32]) -> usize {
        self.channels.get(channel).map_or(0, |channel| channel.drain(data))
    }

    #[cfg(test)]
    pub(crate) fn channel_period(&self, channel: usize) -> f64 {
        self.channels[channel].period()
    }

    #[cfg(test)]
    pub(crate) fn channel_volume(&self, channel: usize) -> f64 {
        self.channels[channel].volume()
    }
}
