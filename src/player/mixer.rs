//! Offline rendering of a whole song to a stereo PCM stream.
use std::io::{self, Read, Seek, SeekFrom, Write};

use super::Player;

/// Mix frames per second of the offline renderer.
const MIX_RATE: u32 = 100;

/// Streams a song as interleaved stereo float32 little-endian PCM.
///
/// The reader drives the player itself: every 10 ms mix frame advances the
/// sequencer, drains each channel's ring buffer, sums the channels, clips
/// the result to [-1, +1] and serializes it. The stream ends once every
/// order has been played. It is single use; render a song again by creating
/// a new player.
pub struct PcmRender {
    player: Player,
    scratch: Vec<f32>,
    mix: Vec<f32>,
    frame: Vec<u8>,
    cursor: usize,
}

impl PcmRender {
    pub(crate) fn new(mut player: Player) -> PcmRender {
        player.config.loop_song = false;
        let frames = (player.config.sample_rate / MIX_RATE) as usize;
        PcmRender {
            scratch: vec![0.0; frames * 2],
            mix: vec![0.0; frames * 2],
            frame: Vec::with_capacity(frames * 2 * 4),
            cursor: 0,
            player,
        }
    }

    /// The sample rate of the stream.
    pub fn sample_rate(&self) -> u32 {
        self.player.config.sample_rate
    }

    /// Renders one mix frame into the byte queue; `false` at song end.
    fn fill(&mut self) -> bool {
        if self.player.finished() {
            return false;
        }
        self.player.update(1.0 / MIX_RATE as f64);

        let frames = (self.player.config.sample_rate / MIX_RATE) as usize;
        let stereo = self.player.is_stereo();
        let scale = if self.player.config.normalize_mix {
            1.0 / self.player.channel_count().max(1) as f32
        } else {
            1.0
        };

        self.mix.iter_mut().for_each(|value| *value = 0.0);
        for channel in 0..self.player.channel_count() {
            let wanted = if stereo { frames * 2 } else { frames };
            let got = self.player.drain_channel(channel, &mut self.scratch[..wanted]);
            if stereo {
                for (mixed, &sample) in self.mix.iter_mut().zip(&self.scratch[..got]) {
                    *mixed += sample * scale;
                }
            } else {
                for (pair, &sample) in self.mix.chunks_mut(2).zip(&self.scratch[..got]) {
                    pair[0] += sample * scale;
                    pair[1] += sample * scale;
                }
            }
        }

        self.frame.clear();
        self.cursor = 0;
        for &value in self.mix.iter() {
            self.frame.extend_from_slice(&value.clamp(-1.0, 1.0).to_le_bytes());
        }
        true
    }
}

impl Read for PcmRender {
    fn read(&mut self, data: &mut [u8]) -> io::Result<usize> {
        let mut total = 0;
        while total < data.len() {
            if self.cursor == self.frame.len() && !self.fill() {
                break;
            }
            let count = (data.len() - total).min(self.frame.len() - self.cursor);
            data[total..total + count].copy_from_slice(&self.frame[self.cursor..self.cursor + count]);
            self.cursor += count;
            total += count;
        }
        Ok(total)
    }
}

/// Streams an offline render into a RIFF/WAVE container: 32-bit IEEE float,
/// two channels. The RIFF and data chunk lengths are patched by seeking
/// once the stream ends. Returns the number of PCM bytes written.
pub fn write_wav<W: Write + Seek>(mut render: PcmRender, mut out: W) -> io::Result<u64> {
    let sample_rate = render.sample_rate();
    let channels = 2u16;
    let bits = 32u16;
    let block_align = channels * bits / 8;
    let byte_rate = sample_rate * block_align as u32;

    out.write_all(b"RIFF")?;
    out.write_all(&0u32.to_le_bytes())?;
    out.write_all(b"WAVE")?;
    out.write_all(b"fmt ")?;
    out.write_all(&16u32.to_le_bytes())?;
    out.write_all(&3u16.to_le_bytes())?; // IEEE float
    out.write_all(&channels.to_le_bytes())?;
    out.write_all(&sample_rate.to_le_bytes())?;
    out.write_all(&byte_rate.to_le_bytes())?;
    out.write_all(&block_align.to_le_bytes())?;
    out.write_all(&bits.to_le_bytes())?;
    out.write_all(b"data")?;
    out.write_all(&0u32.to_le_bytes())?;

    let mut data_length = 0u64;
    let mut buffer = [0u8; 8192];
    loop {
        let count = render.read(&mut buffer)?;
        if count == 0 {
            break;
        }
        out.write_all(&buffer[..count])?;
        data_length += count as u64;
    }

    out.seek(SeekFrom::Start(4))?;
    out.write_all(&((36 + data_length) as u32).to_le_bytes())?;
    out.seek(SeekFrom::Start(40))?;
    out.write_all(&(data_length as u32).to_le_bytes())?;
    out.flush()?;
    Ok(data_length)
}
