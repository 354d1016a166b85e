//! MOD/S3M module parser and player.
//!
//! Tracker modules bundle digitized instrument samples, a grid of patterns
//! (64 rows of note cells per channel) and an order list sequencing the
//! patterns into a song. This library parses the [ProTracker] MOD and
//! [Scream Tracker 3] S3M flavors of the format and plays them back.
//!
//! The playback engine is a tick-driven sequencer: the host calls
//! [`Player::update`] with elapsed wall-clock time, the sequencer advances
//! rows and ticks in musical time, per-channel effect state machines run the
//! tracker effects (portamento, vibrato, volume slides, retriggers, pattern
//! jumps and friends) and every channel resamples its instrument into a ring
//! buffer. The host drains those buffers from its audio callback through
//! [`Player::channel_reader`], or renders the song offline with
//! [`Player::render_to_pcm`] and [`player::write_wav`].
//!
//! [ProTracker]: https://en.wikipedia.org/wiki/ProTracker
//! [Scream Tracker 3]: https://en.wikipedia.org/wiki/Scream_Tracker
use std::{fs, io, path::Path};

pub mod buffer;
pub mod module;
pub mod player;

pub use module::{Module, ModuleFormat};
pub use player::{Player, PlayerConfig};

/// Attempts to parse a module from an in-memory file image, auto-detecting
/// S3M then MOD.
///
/// Returns an instance of `Module` on success.
pub fn load_module(bytes: &[u8]) -> io::Result<Module> {
    Module::parse(io::Cursor::new(bytes))
}

/// Attempts to parse a module file from the given file `path`.
///
/// Returns an instance of `Module` on success.
pub fn load_file<P: AsRef<Path>>(path: P) -> io::Result<Module> {
    let bytes = fs::read(path.as_ref())?;
    load_module(&bytes)
}
