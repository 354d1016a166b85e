//! S3M header and instrument flags.
use bitflags::bitflags;

/// Center pan position; the only position a MOD channel ever has.
pub const PAN_CENTER: u8 = 8;
/// Default pan of an S3M channel from the left bank.
pub(crate) const PAN_LEFT: u8 = 3;
/// Default pan of an S3M channel from the right bank.
pub(crate) const PAN_RIGHT: u8 = 12;

bitflags! {
    /// Song flags from the S3M header.
    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
    pub struct SongFlags: u16 {
        const ST2_VIBRATO        = 0x0001;
        const ST2_TEMPO          = 0x0002;
        const AMIGA_SLIDES       = 0x0004;
        const ZERO_VOLUME_OPT    = 0x0008;
        const AMIGA_LIMITS       = 0x0010;
        const FILTER_SFX         = 0x0020;
        const FAST_VOLUME_SLIDES = 0x0040;
    }
}

bitflags! {
    /// Flags of an S3M digital-sample instrument.
    #[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
    pub struct SampleFlags: u8 {
        const LOOPED      = 0x01;
        const STEREO      = 0x04;
        const SIXTEEN_BIT = 0x08;
    }
}

impl SampleFlags {
    pub fn is_looped(self) -> bool {
        self.intersects(SampleFlags::LOOPED)
    }

    pub fn is_stereo(self) -> bool {
        self.intersects(SampleFlags::STEREO)
    }

    pub fn is_16bit(self) -> bool {
        self.intersects(SampleFlags::SIXTEEN_BIT)
    }
}

/// Interprets an S3M channel-settings byte: the default pan of an enabled
/// channel slot, or `None` when the slot is disabled. Values 0-7 are the
/// left speaker bank, 8-15 the right.
pub(crate) fn default_pan(setting: u8) -> Option<u8> {
    match setting {
        0..=7 => Some(PAN_LEFT),
        8..=15 => Some(PAN_RIGHT),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn channel_settings_split_into_banks() {
        assert_eq!(default_pan(0), Some(PAN_LEFT));
        assert_eq!(default_pan(7), Some(PAN_LEFT));
        assert_eq!(default_pan(8), Some(PAN_RIGHT));
        assert_eq!(default_pan(15), Some(PAN_RIGHT));
        assert_eq!(default_pan(16), None);
        assert_eq!(default_pan(255), None);
    }

    #[test]
    fn sample_flags_decode() {
        let flags = SampleFlags::from_bits_truncate(0x09);
        assert!(flags.is_looped());
        assert!(flags.is_16bit());
        assert!(!flags.is_stereo());
    }
}
