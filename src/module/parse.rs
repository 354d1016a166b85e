use std::io::{self, Read, Seek, SeekFrom};

use arrayvec::ArrayVec;
use log::{debug, warn};

use super::*;
use super::flags::{default_pan, SampleFlags, SongFlags, PAN_CENTER};

const MOD_INSTRUMENTS: usize = 31;
const MOD_ORDER_TABLE: usize = 128;
const MOD_MAGIC_OFFSET: u64 = 0x438;
const S3M_MAGIC_OFFSET: u64 = 0x2c;

// S3M's own limit on a single sample.
const MAX_SAMPLE_LENGTH: u32 = 1 << 17;

impl Module {
    /// Attempts to parse a module from the given stream, auto-detecting the
    /// format: S3M is tried first (its signature sits at a fixed offset),
    /// then MOD.
    ///
    /// Returns an instance of `Module` on success.
    pub fn parse<R: Read + Seek>(mut rd: R) -> io::Result<Module> {
        if looks_like_s3m(&mut rd)? {
            Module::parse_s3m(rd)
        } else {
            Module::parse_mod(rd)
        }
    }

    /// Attempts to parse an Amiga ProTracker module from the given stream.
    pub fn parse_mod<R: Read + Seek>(mut rd: R) -> io::Result<Module> {
        rd.seek(SeekFrom::Start(MOD_MAGIC_OFFSET))?;
        let mut magic = [0u8; 4];
        rd.read_exact(&mut magic)?;
        let channels = match &magic {
            b"M.K." | b"M!K!" | b"FLT4" => 4,
            b"6CHN" => 6,
            b"8CHN" | b"OCTA" => 8,
            _ => {
                return Err(io::Error::new(io::ErrorKind::InvalidData, "unrecognized MOD signature"))
            }
        };
        debug!("detected {} channel MOD", channels);

        rd.seek(SeekFrom::Start(0))?;
        let name = read_string(&mut rd, 20)?;

        let mut headers = Vec::with_capacity(MOD_INSTRUMENTS);
        for _ in 0..MOD_INSTRUMENTS {
            let sample_name = read_string(&mut rd, 22)?;
            // lengths and loop bounds are stored in 16-bit words
            let length = read_word_be(&mut rd)? as usize * 2;
            let finetune = read_byte(&mut rd)?;
            let volume = read_byte(&mut rd)?;
            let loop_start = read_word_be(&mut rd)? as usize * 2;
            let loop_length = read_word_be(&mut rd)? as usize * 2;
            headers.push((sample_name, length, finetune, volume, loop_start, loop_length));
        }

        let song_length = read_byte(&mut rd)? as usize;
        let _restart = read_byte(&mut rd)?;
        let mut order_table = [0u8; MOD_ORDER_TABLE];
        rd.read_exact(&mut order_table)?;
        if song_length == 0 {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "empty order list"));
        }
        let song_length = if song_length > MOD_ORDER_TABLE {
            warn!("song length {} exceeds the order table, clamping", song_length);
            MOD_ORDER_TABLE
        } else {
            song_length
        };

        // every pattern the order table can reach is stored in the file,
        // whether or not the song plays it
        let pattern_count = order_table.iter().copied().max().unwrap_or(0) as usize + 1;

        rd.seek(SeekFrom::Start(MOD_MAGIC_OFFSET + 4))?;
        let mut patterns = Vec::with_capacity(pattern_count);
        for _ in 0..pattern_count {
            let mut rows = Vec::with_capacity(ROWS_PER_PATTERN);
            for _ in 0..ROWS_PER_PATTERN {
                let mut notes = Vec::with_capacity(channels);
                for _ in 0..channels {
                    let mut cell = [0u8; 4];
                    rd.read_exact(&mut cell)?;
                    notes.push(decode_mod_cell(cell));
                }
                rows.push(Row { notes: notes.into_boxed_slice() });
            }
            patterns.push(Pattern { rows: rows.into_boxed_slice() });
        }

        let mut instruments = Vec::with_capacity(MOD_INSTRUMENTS);
        for (sample_name, length, finetune, volume, loop_start, loop_length) in headers {
            let mut pcm = vec![0u8; length];
            let got = read_up_to(&mut rd, &mut pcm)?;
            if got < length {
                warn!("sample {:?} truncated: {} of {} bytes", sample_name, got, length);
                pcm.truncate(got);
            }
            // signed 8-bit; the default volume stays out of the PCM data and
            // is applied when a cell triggers the instrument
            let data = pcm.iter().map(|&b| b as i8 as f32 / 128.0).collect();
            let mut instrument = Instrument {
                name: sample_name,
                data,
                middle_c: finetune_rate(finetune),
                volume,
                looped: loop_length > 2,
                loop_start,
                loop_end: loop_start + loop_length,
            };
            instrument.sanitize();
            instruments.push(instrument);
        }

        let mut module = Module::empty(ModuleFormat::Mod, channels);
        module.name = name;
        module.orders = order_table[..song_length].to_vec().into_boxed_slice();
        module.patterns = patterns.into_boxed_slice();
        module.instruments = instruments.into_boxed_slice();
        Ok(module)
    }

    /// Attempts to parse a Scream Tracker 3 module from the given stream.
    pub fn parse_s3m<R: Read + Seek>(mut rd: R) -> io::Result<Module> {
        rd.seek(SeekFrom::Start(0))?;
        let name = read_string(&mut rd, 28)?;
        let _eof_byte = read_byte(&mut rd)?;
        let filetype = read_byte(&mut rd)?;
        if filetype != 16 {
            debug!("unexpected S3M file type {}", filetype);
        }
        skip(&mut rd, 2)?;
        let song_length = read_word_le(&mut rd)? as usize;
        let instrument_count = read_word_le(&mut rd)? as usize;
        let pattern_count = read_word_le(&mut rd)? as usize;
        let song_flags = SongFlags::from_bits_truncate(read_word_le(&mut rd)?);
        let _tracker_version = read_word_le(&mut rd)?;
        let sample_format = read_word_le(&mut rd)?;
        if sample_format == 1 {
            debug!("header declares signed samples, decoding as unsigned");
        }
        let mut magic = [0u8; 4];
        rd.read_exact(&mut magic)?;
        if &magic != b"SCRM" {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "missing SCRM signature"));
        }
        debug!("song flags: {:?}", song_flags);

        let global_volume = read_byte(&mut rd)?.min(64);
        let initial_speed = read_byte(&mut rd)?;
        let initial_tempo = read_byte(&mut rd)?;
        let master_volume = read_byte(&mut rd)?;
        let _ultraclick = read_byte(&mut rd)?;
        let default_pan_flag = read_byte(&mut rd)?;
        skip(&mut rd, 8)?;
        let _special = read_word_le(&mut rd)?;
        let mut channel_settings = [0u8; MAX_CHANNELS];
        rd.read_exact(&mut channel_settings)?;

        let stereo = master_volume & 0x80 != 0;

        // map the sparse channel slots onto dense playing channels
        let mut channel_map = [None; MAX_CHANNELS];
        let mut pans: ArrayVec<u8, MAX_CHANNELS> = ArrayVec::new();
        for (slot, &setting) in channel_settings.iter().enumerate() {
            if let Some(pan) = default_pan(setting) {
                channel_map[slot] = Some(pans.len() as u8);
                pans.push(if stereo { pan } else { PAN_CENTER });
            }
        }
        debug!("{} of {} channel slots enabled", pans.len(), MAX_CHANNELS);
        if pans.is_empty() {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "no enabled channels"));
        }

        let mut orders = Vec::with_capacity(song_length);
        for _ in 0..song_length {
            let order = read_byte(&mut rd)?;
            // 0xfe is a marker and 0xff ends the song; both are dropped
            if order >= 0xfe {
                continue;
            }
            orders.push(order);
        }
        if orders.is_empty() {
            return Err(io::Error::new(io::ErrorKind::InvalidData, "empty order list"));
        }

        let mut instrument_offsets = Vec::with_capacity(instrument_count);
        for _ in 0..instrument_count {
            instrument_offsets.push(read_word_le(&mut rd)? as u64 * 16);
        }
        let mut pattern_offsets = Vec::with_capacity(pattern_count);
        for _ in 0..pattern_count {
            pattern_offsets.push(read_word_le(&mut rd)? as u64 * 16);
        }

        if default_pan_flag == 0xfc {
            let mut pan_data = [0u8; MAX_CHANNELS];
            rd.read_exact(&mut pan_data)?;
            if stereo {
                for (slot, &value) in pan_data.iter().enumerate() {
                    if let Some(index) = channel_map[slot] {
                        pans[index as usize] = value & 0x0f;
                    }
                }
            }
        }

        let mut instruments = Vec::with_capacity(instrument_count);
        for (index, &offset) in instrument_offsets.iter().enumerate() {
            instruments.push(read_s3m_instrument(&mut rd, offset, index)?);
        }

        let mut patterns = Vec::with_capacity(pattern_count);
        for &offset in pattern_offsets.iter() {
            patterns.push(read_s3m_pattern(&mut rd, offset, &channel_map, pans.len())?);
        }

        let mut module = Module::empty(ModuleFormat::S3m, pans.len());
        module.name = name;
        module.orders = orders.into_boxed_slice();
        module.patterns = patterns.into_boxed_slice();
        module.instruments = instruments.into_boxed_slice();
        module.channel_pans = pans;
        module.initial_speed = if initial_speed == 0 || initial_speed > 0x1f {
            warn!("implausible initial speed {}, using 6", initial_speed);
            6
        } else {
            initial_speed
        };
        module.initial_tempo = initial_tempo.max(32);
        module.global_volume = global_volume;
        module.stereo = stereo;
        module.set_channel_map(channel_map);
        Ok(module)
    }
}

fn looks_like_s3m<R: Read + Seek>(rd: &mut R) -> io::Result<bool> {
    if rd.seek(SeekFrom::End(0))? < S3M_MAGIC_OFFSET + 4 {
        return Ok(false);
    }
    rd.seek(SeekFrom::Start(S3M_MAGIC_OFFSET))?;
    let mut magic = [0u8; 4];
    rd.read_exact(&mut magic)?;
    Ok(&magic == b"SCRM")
}

fn decode_mod_cell(cell: [u8; 4]) -> Note {
    let period = u16::from(cell[0] & 0x0f) << 8 | u16::from(cell[1]);
    let instrument = (cell[0] & 0xf0) | (cell[2] >> 4);
    Note {
        pitch: if period != 0 {
            NotePitch::Period(period as f64)
        } else {
            NotePitch::None
        },
        instrument,
        volume: None,
        effect: decode_mod_effect(cell[2] & 0x0f, cell[3]),
    }
}

fn decode_mod_effect(effect: u8, parameter: u8) -> Effect {
    let (hi, lo) = (parameter >> 4, parameter & 0x0f);
    match effect {
        0x0 if parameter == 0 => Effect::None,
        0x0 => Effect::Arpeggio { first: hi, second: lo },
        0x1 => Effect::PortamentoUp(parameter),
        0x2 => Effect::PortamentoDown(parameter),
        0x3 => Effect::TonePortamento(parameter),
        0x4 => Effect::Vibrato { speed: hi, depth: lo },
        0x5 => Effect::TonePortamentoVolumeSlide { up: hi, down: lo },
        0x6 => Effect::VibratoVolumeSlide { up: hi, down: lo },
        0x7 => Effect::Tremolo { speed: hi, depth: lo },
        0x9 => Effect::SampleOffset(parameter),
        0xa => Effect::VolumeSlide { up: hi, down: lo },
        0xb => Effect::PositionJump(parameter),
        0xc => Effect::SetVolume(parameter.min(64)),
        // the row digits are decimal
        0xd => Effect::PatternBreak((hi * 10 + lo).min(63)),
        0xe => decode_mod_extended(hi, lo),
        0xf if parameter <= 0x1f => Effect::SetSpeed(parameter),
        0xf => Effect::SetTempo(parameter),
        _ => {
            debug!("ignoring MOD effect {:x} parameter {:#04x}", effect, parameter);
            Effect::None
        }
    }
}

fn decode_mod_extended(sub: u8, value: u8) -> Effect {
    match sub {
        0x1 => Effect::FinePortamentoUp(value),
        0x2 => Effect::FinePortamentoDown(value),
        0x9 => Effect::Retrigger { ticks: value, volume: 0 },
        0xa => Effect::FineVolumeSlide { up: value, down: 0 },
        0xb => Effect::FineVolumeSlide { up: 0, down: value },
        0xc => Effect::NoteCut(value),
        0xd => Effect::NoteDelay(value),
        _ => {
            debug!("ignoring MOD effect e{:x}{:x}", sub, value);
            Effect::None
        }
    }
}

fn read_s3m_instrument<R: Read + Seek>(rd: &mut R, offset: u64, index: usize) -> io::Result<Instrument> {
    rd.seek(SeekFrom::Start(offset))?;
    let kind = read_byte(&mut *rd)?;
    let _filename = read_string(&mut *rd, 12)?;
    if kind != 1 {
        // adlib and empty slots carry no digital sample
        debug!("instrument {} has type {}, leaving it silent", index, kind);
        return Ok(Instrument::default());
    }

    let memseg_high = read_byte(&mut *rd)?;
    let memseg_low = read_word_le(&mut *rd)?;
    let data_offset = ((memseg_high as u64) << 16 | memseg_low as u64) * 16;
    let length = read_dword_le(&mut *rd)?;
    if length > MAX_SAMPLE_LENGTH {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "sample length out of range"));
    }
    let loop_start = read_word_le(&mut *rd)? as usize;
    skip(&mut *rd, 2)?;
    let loop_end = read_word_le(&mut *rd)? as usize;
    skip(&mut *rd, 2)?;
    let volume = read_byte(&mut *rd)?;
    let _reserved = read_byte(&mut *rd)?;
    let packing = read_byte(&mut *rd)?;
    if packing != 0 {
        warn!("instrument {} uses packing {}, decoding as raw", index, packing);
    }
    let sample_flags = SampleFlags::from_bits_truncate(read_byte(&mut *rd)?);
    let middle_c = read_dword_le(&mut *rd)? as f64;
    skip(&mut *rd, 12)?;
    let sample_name = read_string(&mut *rd, 28)?;
    let mut magic = [0u8; 4];
    rd.read_exact(&mut magic)?;
    if &magic != b"SCRS" {
        return Err(io::Error::new(io::ErrorKind::InvalidData, "missing SCRS signature"));
    }
    if sample_flags.is_stereo() {
        warn!("instrument {} is stereo, playing the left frames only", index);
    }

    rd.seek(SeekFrom::Start(data_offset))?;
    let data = if sample_flags.is_16bit() {
        let mut pcm = vec![0u8; length as usize * 2];
        rd.read_exact(&mut pcm)?;
        pcm.chunks_exact(2)
           .map(|pair| (u16::from_le_bytes([pair[0], pair[1]]) as f32 - 32768.0) / 32768.0)
           .collect()
    } else {
        let mut pcm = vec![0u8; length as usize];
        rd.read_exact(&mut pcm)?;
        pcm.iter().map(|&b| (b as f32 - 128.0) / 128.0).collect()
    };

    let mut instrument = Instrument {
        name: sample_name,
        data,
        middle_c,
        volume,
        looped: sample_flags.is_looped(),
        loop_start,
        loop_end,
    };
    instrument.sanitize();
    Ok(instrument)
}

fn read_s3m_pattern<R: Read + Seek>(
        rd: &mut R,
        offset: u64,
        channel_map: &[Option<u8>; MAX_CHANNELS],
        channels: usize,
    ) -> io::Result<Pattern>
{
    let mut pattern = Pattern::empty(channels);
    // a zero parapointer is an empty pattern
    if offset == 0 {
        return Ok(pattern);
    }
    rd.seek(SeekFrom::Start(offset))?;
    let _packed_length = read_word_le(&mut *rd)?;

    let mut row = 0;
    while row < ROWS_PER_PATTERN {
        let what = read_byte(&mut *rd)?;
        if what == 0 {
            row += 1;
            continue;
        }
        let slot = what & 0x1f;
        let mut note = Note::default();
        if what & 0x20 != 0 {
            let key = read_byte(&mut *rd)?;
            note.instrument = read_byte(&mut *rd)?;
            note.pitch = decode_s3m_key(key);
        }
        if what & 0x40 != 0 {
            note.volume = Some(read_byte(&mut *rd)?.min(64));
        }
        if what & 0x80 != 0 {
            let effect = read_byte(&mut *rd)?;
            let parameter = read_byte(&mut *rd)?;
            note.effect = decode_s3m_effect(effect, parameter);
        }
        // tokens for disabled channel slots are consumed and dropped
        if let Some(index) = channel_map[slot as usize] {
            pattern.rows[row].notes[index as usize] = note;
        }
    }
    Ok(pattern)
}

fn decode_s3m_key(key: u8) -> NotePitch {
    match key {
        255 => NotePitch::None,
        254 => NotePitch::KeyOff,
        key => match period::period(key >> 4, key & 0x0f) {
            Some(period) => NotePitch::Period(period),
            None => {
                debug!("ignoring out-of-range note {:#04x}", key);
                NotePitch::None
            }
        }
    }
}

fn decode_s3m_effect(effect: u8, parameter: u8) -> Effect {
    let (hi, lo) = (parameter >> 4, parameter & 0x0f);
    match effect {
        0x01 => Effect::SetSpeed(parameter),
        0x02 => Effect::PositionJump(parameter),
        0x03 => Effect::PatternBreak(parameter.min(63)),
        0x04 => match (hi, lo) {
            (0x0f, down) if down > 0 => Effect::FineVolumeSlide { up: 0, down },
            (up, 0x0f) if up > 0 => Effect::FineVolumeSlide { up, down: 0 },
            (up, down) => Effect::VolumeSlide { up, down },
        },
        0x05 if hi == 0x0f => Effect::FinePortamentoDown(lo),
        0x05 => Effect::PortamentoDown(parameter),
        0x06 if hi == 0x0f => Effect::FinePortamentoUp(lo),
        0x06 => Effect::PortamentoUp(parameter),
        0x07 => Effect::TonePortamento(parameter),
        0x08 => Effect::Vibrato { speed: hi, depth: lo },
        0x0a => Effect::Arpeggio { first: hi, second: lo },
        0x0b => Effect::VibratoVolumeSlide { up: hi, down: lo },
        0x0c => Effect::TonePortamentoVolumeSlide { up: hi, down: lo },
        0x0f => Effect::SampleOffset(parameter),
        0x11 => Effect::Retrigger { ticks: lo, volume: hi },
        0x12 => Effect::Tremolo { speed: hi, depth: lo },
        0x13 => decode_s3m_special(hi, lo),
        0x14 => Effect::SetTempo(parameter.max(32)),
        0x16 => Effect::SetGlobalVolume(parameter & 0x3f),
        _ => {
            if (1..=26).contains(&effect) {
                debug!("ignoring S3M effect {}{:02x}", (b'@' + effect) as char, parameter);
            } else {
                debug!("ignoring S3M effect {:#04x} parameter {:#04x}", effect, parameter);
            }
            Effect::None
        }
    }
}

fn decode_s3m_special(sub: u8, value: u8) -> Effect {
    match sub {
        0x8 => Effect::SetPanning(value),
        0xc => Effect::NoteCut(value),
        0xd => Effect::NoteDelay(value),
        _ => {
            debug!("ignoring S3M effect s{:x}{:x}", sub, value);
            Effect::None
        }
    }
}

// the fine-tune nibble detunes the reference rate in 1/8 semitone steps
fn finetune_rate(finetune: u8) -> f64 {
    let mut steps = (finetune & 0x0f) as i8;
    if steps > 7 {
        steps -= 16;
    }
    period::MIDDLE_C_RATE * (steps as f64 / 96.0).exp2()
}

fn read_byte<R: Read>(mut rd: R) -> io::Result<u8> {
    let mut byte = [0u8; 1];
    rd.read_exact(&mut byte)?;
    Ok(byte[0])
}

fn read_word_be<R: Read>(mut rd: R) -> io::Result<u16> {
    let mut word = [0u8; 2];
    rd.read_exact(&mut word)?;
    Ok(u16::from_be_bytes(word))
}

fn read_word_le<R: Read>(mut rd: R) -> io::Result<u16> {
    let mut word = [0u8; 2];
    rd.read_exact(&mut word)?;
    Ok(u16::from_le_bytes(word))
}

fn read_dword_le<R: Read>(mut rd: R) -> io::Result<u32> {
    let mut dword = [0u8; 4];
    rd.read_exact(&mut dword)?;
    Ok(u32::from_le_bytes(dword))
}

fn read_string<R: Read>(mut rd: R, length: usize) -> io::Result<String> {
    let mut bytes = vec![0u8; length];
    rd.read_exact(&mut bytes)?;
    while bytes.last() == Some(&0) {
        bytes.pop();
    }
    Ok(String::from_utf8_lossy(&bytes).into_owned())
}

fn skip<R: Read>(mut rd: R, count: u64) -> io::Result<()> {
    if io::copy(&mut rd.by_ref().take(count), &mut io::sink())? < count {
        return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "file ended prematurely"));
    }
    Ok(())
}

fn read_up_to<R: Read>(rd: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut total = 0;
    while total < buf.len() {
        match rd.read(&mut buf[total..])? {
            0 => break,
            n => total += n,
        }
    }
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn build_mod() -> Vec<u8> {
        let mut bytes = vec![0u8; 0x43c];
        bytes[..8].copy_from_slice(b"test mod");
        // sample 1: 1 word of data, volume 64, no loop
        bytes[20..26].copy_from_slice(b"square");
        bytes[42..44].copy_from_slice(&1u16.to_be_bytes());
        bytes[45] = 64;
        bytes[48..50].copy_from_slice(&1u16.to_be_bytes());
        bytes[950] = 2;
        bytes[952] = 0;
        bytes[953] = 1;
        bytes[0x438..0x43c].copy_from_slice(b"M.K.");

        let mut patterns = vec![0u8; 2 * ROWS_PER_PATTERN * 4 * 4];
        // pattern 0, row 0, channel 0: C-4 with instrument 1 and effect C20
        patterns[0] = 0x01;
        patterns[1] = 0xac;
        patterns[2] = 0x1c;
        patterns[3] = 0x20;
        // pattern 1, row 0, channel 1: effect D05
        let base = ROWS_PER_PATTERN * 4 * 4 + 4;
        patterns[base + 2] = 0x0d;
        patterns[base + 3] = 0x05;
        bytes.extend_from_slice(&patterns);

        bytes.push(0x7f);
        bytes.push(0x80);
        bytes
    }

    fn pad_to_paragraph(bytes: &mut Vec<u8>) {
        while bytes.len() % 16 != 0 {
            bytes.push(0);
        }
    }

    fn build_s3m() -> Vec<u8> {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(b"s3m song");
        bytes.resize(28, 0);
        bytes.push(0x1a);
        bytes.push(16);
        bytes.extend_from_slice(&[0, 0]);
        bytes.extend_from_slice(&2u16.to_le_bytes());      // song length
        bytes.extend_from_slice(&1u16.to_le_bytes());      // instruments
        bytes.extend_from_slice(&1u16.to_le_bytes());      // patterns
        bytes.extend_from_slice(&0u16.to_le_bytes());      // flags
        bytes.extend_from_slice(&0x1320u16.to_le_bytes()); // tracker version
        bytes.extend_from_slice(&2u16.to_le_bytes());      // unsigned samples
        bytes.extend_from_slice(b"SCRM");
        bytes.push(48);                                    // global volume
        bytes.push(12);                                    // initial speed
        bytes.push(150);                                   // initial tempo
        bytes.push(0xb0);                                  // master volume, stereo
        bytes.push(0);
        bytes.push(0);                                     // default panning flag
        bytes.resize(bytes.len() + 8, 0);
        bytes.extend_from_slice(&0u16.to_le_bytes());      // special
        let mut settings = [255u8; 32];
        settings[0] = 0;
        settings[1] = 8;
        bytes.extend_from_slice(&settings);
        assert_eq!(bytes.len(), 96);

        bytes.push(0);
        bytes.push(0xff);
        let instrument_pp_at = bytes.len();
        bytes.extend_from_slice(&0u16.to_le_bytes());
        let pattern_pp_at = bytes.len();
        bytes.extend_from_slice(&0u16.to_le_bytes());

        pad_to_paragraph(&mut bytes);
        let instrument_at = bytes.len();
        let pp = ((instrument_at / 16) as u16).to_le_bytes();
        bytes[instrument_pp_at..instrument_pp_at + 2].copy_from_slice(&pp);
        bytes.push(1);                                     // digital sample
        bytes.resize(bytes.len() + 12, 0);                 // filename
        let memseg_at = bytes.len();
        bytes.extend_from_slice(&[0, 0, 0]);
        bytes.extend_from_slice(&4u32.to_le_bytes());      // length
        bytes.extend_from_slice(&0u16.to_le_bytes());      // loop begin
        bytes.extend_from_slice(&[0, 0]);
        bytes.extend_from_slice(&4u16.to_le_bytes());      // loop end
        bytes.extend_from_slice(&[0, 0]);
        bytes.push(40);                                    // volume
        bytes.push(0);
        bytes.push(0);                                     // packing
        bytes.push(1);                                     // flags: looped
        bytes.extend_from_slice(&8363u32.to_le_bytes());
        bytes.resize(bytes.len() + 12, 0);
        bytes.extend_from_slice(b"square");
        bytes.resize(instrument_at + 76, 0);               // rest of the name
        bytes.extend_from_slice(b"SCRS");

        pad_to_paragraph(&mut bytes);
        let data_at = bytes.len();
        let memseg = (data_at / 16) as u32;
        bytes[memseg_at] = (memseg >> 16) as u8;
        bytes[memseg_at + 1..memseg_at + 3].copy_from_slice(&(memseg as u16).to_le_bytes());
        bytes.extend_from_slice(&[255, 0, 255, 0]);

        pad_to_paragraph(&mut bytes);
        let pattern_at = bytes.len();
        let pp = ((pattern_at / 16) as u16).to_le_bytes();
        bytes[pattern_pp_at..pattern_pp_at + 2].copy_from_slice(&pp);
        let mut packed = Vec::new();
        packed.push(0x20 | 0x40 | 0x80);                   // slot 0: note, volume, effect
        packed.push(0x40);                                 // C, octave 4
        packed.push(1);
        packed.push(64);
        packed.push(0x11);                                 // Q24
        packed.push(0x24);
        packed.push(0x20 | 0x02);                          // slot 2 is disabled
        packed.push(0x40);
        packed.push(1);
        packed.push(0);                                    // end of row 0
        packed.resize(packed.len() + 63, 0);               // remaining rows
        bytes.extend_from_slice(&((packed.len() + 2) as u16).to_le_bytes());
        bytes.extend_from_slice(&packed);
        bytes
    }

    #[test]
    fn parses_a_mod_image() {
        let module = Module::parse_mod(Cursor::new(build_mod())).unwrap();
        assert_eq!(module.format, ModuleFormat::Mod);
        assert_eq!(module.name, "test mod");
        assert_eq!(module.channel_count(), 4);
        assert_eq!(&*module.orders, &[0, 1]);
        assert_eq!(module.patterns.len(), 2);
        assert_eq!(module.instruments.len(), MOD_INSTRUMENTS);
        assert!(!module.stereo);

        let instrument = module.instrument(1).unwrap();
        assert_eq!(instrument.name, "square");
        assert_eq!(instrument.len(), 2);
        assert_eq!(instrument.volume, 64);
        assert!(!instrument.looped);
        assert_eq!(instrument.data[0], 127.0 / 128.0);
        assert_eq!(instrument.data[1], -1.0);
        assert_eq!(instrument.middle_c, period::MIDDLE_C_RATE);

        let note = module.note_at(0, 0, 0);
        assert_eq!(note.pitch, NotePitch::Period(428.0));
        assert_eq!(note.instrument, 1);
        assert_eq!(note.effect, Effect::SetVolume(32));

        let note = module.note_at(1, 0, 1);
        assert_eq!(note.pitch, NotePitch::None);
        assert_eq!(note.effect, Effect::PatternBreak(5));
    }

    #[test]
    fn parses_an_s3m_image() {
        let module = Module::parse_s3m(Cursor::new(build_s3m())).unwrap();
        assert_eq!(module.format, ModuleFormat::S3m);
        assert_eq!(module.name, "s3m song");
        assert_eq!(module.channel_count(), 2);
        assert_eq!(&module.channel_pans[..], &[3, 12]);
        assert_eq!(&*module.orders, &[0]);
        assert_eq!(module.initial_speed, 12);
        assert_eq!(module.initial_tempo, 150);
        assert_eq!(module.global_volume, 48);
        assert!(module.stereo);
        assert_eq!(module.channel_index(1), Some(1));
        assert_eq!(module.channel_index(2), None);

        let instrument = module.instrument(1).unwrap();
        assert_eq!(instrument.name, "square");
        assert_eq!(instrument.volume, 40);
        assert!(instrument.looped);
        assert_eq!(instrument.loop_start, 0);
        assert_eq!(instrument.loop_end, 4);
        assert_eq!(instrument.middle_c, period::MIDDLE_C_RATE);
        assert_eq!(instrument.data[0], 127.0 / 128.0);
        assert_eq!(instrument.data[1], -1.0);

        let note = module.note_at(0, 0, 0);
        assert_eq!(note.pitch, NotePitch::Period(1712.0));
        assert_eq!(note.instrument, 1);
        assert_eq!(note.volume, Some(64));
        assert_eq!(note.effect, Effect::Retrigger { ticks: 4, volume: 2 });

        // the token on the disabled slot was dropped
        assert!(module.note_at(0, 0, 1).is_empty());
    }

    #[test]
    fn auto_detection_dispatches_on_the_magic() {
        assert_eq!(Module::parse(Cursor::new(build_s3m())).unwrap().format, ModuleFormat::S3m);
        assert_eq!(Module::parse(Cursor::new(build_mod())).unwrap().format, ModuleFormat::Mod);
        let err = Module::parse(Cursor::new(vec![0u8; 4096])).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn truncated_patterns_are_an_error() {
        let mut bytes = build_mod();
        bytes.truncate(0x43c + 100);
        let err = Module::parse_mod(Cursor::new(bytes)).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn mod_effect_decoding() {
        assert_eq!(decode_mod_effect(0x0, 0x00), Effect::None);
        assert_eq!(decode_mod_effect(0x0, 0x37), Effect::Arpeggio { first: 3, second: 7 });
        assert_eq!(decode_mod_effect(0x3, 0x04), Effect::TonePortamento(4));
        assert_eq!(decode_mod_effect(0xa, 0x40), Effect::VolumeSlide { up: 4, down: 0 });
        assert_eq!(decode_mod_effect(0xd, 0x15), Effect::PatternBreak(15));
        assert_eq!(decode_mod_effect(0xe, 0xd3), Effect::NoteDelay(3));
        assert_eq!(decode_mod_effect(0xf, 0x06), Effect::SetSpeed(6));
        assert_eq!(decode_mod_effect(0xf, 0x7d), Effect::SetTempo(125));
    }

    #[test]
    fn s3m_effect_decoding() {
        assert_eq!(decode_s3m_effect(0x01, 0x06), Effect::SetSpeed(6));
        assert_eq!(decode_s3m_effect(0x03, 0x05), Effect::PatternBreak(5));
        assert_eq!(decode_s3m_effect(0x04, 0x40), Effect::VolumeSlide { up: 4, down: 0 });
        assert_eq!(decode_s3m_effect(0x04, 0x4f), Effect::FineVolumeSlide { up: 4, down: 0 });
        assert_eq!(decode_s3m_effect(0x04, 0xf4), Effect::FineVolumeSlide { up: 0, down: 4 });
        assert_eq!(decode_s3m_effect(0x13, 0x87), Effect::SetPanning(7));
        assert_eq!(decode_s3m_effect(0x13, 0xd2), Effect::NoteDelay(2));
        assert_eq!(decode_s3m_effect(0x14, 0x10), Effect::SetTempo(32));
        assert_eq!(decode_s3m_effect(0x16, 0x7f), Effect::SetGlobalVolume(63));
        assert_eq!(decode_s3m_effect(0x19, 0x12), Effect::None);
    }

    #[test]
    fn finetune_detunes_in_eighth_semitones() {
        assert_eq!(finetune_rate(0), period::MIDDLE_C_RATE);
        assert!(finetune_rate(7) > period::MIDDLE_C_RATE);
        assert!(finetune_rate(0x0f) < period::MIDDLE_C_RATE); // -1
        let up_octave = finetune_rate(7) / period::MIDDLE_C_RATE;
        assert!((up_octave - (7.0f64 / 96.0).exp2()).abs() < 1e-12);
    }
}
