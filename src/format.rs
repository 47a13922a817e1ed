//! Legacy wave-format descriptors and scalar parameter conversions.
//!
//! The legacy API describes sample data with a `WAVEFORMATEX`-shaped record
//! and expresses volume/pan in hundredths of a decibel (millibels). This
//! module validates those descriptors up front (nothing downstream re-checks
//! them) and converts legacy scalars into the linear gain / pitch-ratio /
//! unit-pan values the streaming backend consumes.

use crate::error::{DsError, Result};

/// Smallest byte length a sample buffer may have.
pub const MIN_BUFFER_BYTES: u32 = 4;
/// Largest byte length a sample buffer may have.
pub const MAX_BUFFER_BYTES: u32 = 0x0FFF_FFFF;

pub const VOLUME_MAX_MB: i32 = 0;
pub const VOLUME_MIN_MB: i32 = -10_000;
pub const PAN_LEFT_MB: i32 = -10_000;
pub const PAN_RIGHT_MB: i32 = 10_000;
pub const FREQUENCY_MIN_HZ: u32 = 100;
pub const FREQUENCY_MAX_HZ: u32 = 200_000;
/// Frequency override value meaning "play at the format's own rate".
pub const FREQUENCY_ORIGINAL: u32 = 0;

const SAMPLE_RATE_MIN: u32 = 100;
const SAMPLE_RATE_MAX: u32 = 200_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FormatTag {
    Pcm,
    IeeeFloat,
    /// Extensible container; the effective encoding is in [`WaveFormat::sub_format`].
    Extensible,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubFormat {
    Pcm,
    IeeeFloat,
}

/// Decoded legacy format descriptor.
///
/// `channel_mask` and `sub_format` are only meaningful for
/// [`FormatTag::Extensible`]; plain PCM/float descriptors leave them at their
/// defaults.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaveFormat {
    pub tag: FormatTag,
    pub channels: u16,
    pub samples_per_sec: u32,
    pub avg_bytes_per_sec: u32,
    pub block_align: u16,
    pub bits_per_sample: u16,
    pub channel_mask: u32,
    pub sub_format: SubFormat,
}

impl WaveFormat {
    pub fn pcm(channels: u16, samples_per_sec: u32, bits_per_sample: u16) -> Self {
        // Wide multiply: an absurd channel count must yield a descriptor that
        // fails validation, not an overflow panic here.
        let block_align = u32::from(channels) * u32::from(bits_per_sample / 8);
        Self {
            tag: FormatTag::Pcm,
            channels,
            samples_per_sec,
            avg_bytes_per_sec: samples_per_sec.saturating_mul(block_align),
            block_align: block_align.try_into().unwrap_or(u16::MAX),
            bits_per_sample,
            channel_mask: 0,
            sub_format: SubFormat::Pcm,
        }
    }

    /// Effective sample encoding, resolving the extensible indirection.
    pub fn encoding(&self) -> SubFormat {
        match self.tag {
            FormatTag::Pcm => SubFormat::Pcm,
            FormatTag::IeeeFloat => SubFormat::IeeeFloat,
            FormatTag::Extensible => self.sub_format,
        }
    }

    /// Validate the descriptor and return a normalized copy.
    ///
    /// Some legacy callers pass `avg_bytes_per_sec == 0` even though the field
    /// is nominally required. Policy here: zero is accepted and recomputed as
    /// `samples_per_sec * block_align`; any other value that disagrees with
    /// that product is rejected. One rule, applied everywhere.
    pub fn validated(mut self) -> Result<Self> {
        if self.channels == 0 {
            return Err(DsError::BadFormat("zero channels"));
        }
        if !(SAMPLE_RATE_MIN..=SAMPLE_RATE_MAX).contains(&self.samples_per_sec) {
            return Err(DsError::BadFormat("sample rate out of range"));
        }
        match (self.encoding(), self.bits_per_sample) {
            (SubFormat::Pcm, 8 | 16 | 24 | 32) => {}
            (SubFormat::IeeeFloat, 32) => {}
            _ => return Err(DsError::BadFormat("unsupported bits per sample")),
        }
        let expected_align = u32::from(self.channels) * u32::from(self.bits_per_sample / 8);
        if u32::from(self.block_align) != expected_align {
            return Err(DsError::BadFormat("block alignment does not match frame size"));
        }
        if self.tag == FormatTag::Extensible
            && self.channel_mask != 0
            && self.channel_mask.count_ones() != u32::from(self.channels)
        {
            return Err(DsError::BadFormat("channel mask does not match channel count"));
        }

        let expected_rate = u64::from(self.samples_per_sec) * u64::from(self.block_align);
        let expected_rate = u32::try_from(expected_rate)
            .map_err(|_| DsError::BadFormat("byte rate overflows"))?;
        if self.avg_bytes_per_sec == 0 {
            self.avg_bytes_per_sec = expected_rate;
        } else if self.avg_bytes_per_sec != expected_rate {
            return Err(DsError::BadFormat("avg bytes per second disagrees with rate"));
        }
        Ok(self)
    }

    /// Round a requested byte length up to whole blocks and check the legacy
    /// size bounds.
    pub fn rounded_buffer_len(&self, requested: u32) -> Result<u32> {
        if !(MIN_BUFFER_BYTES..=MAX_BUFFER_BYTES).contains(&requested) {
            return Err(DsError::InvalidParam("buffer length out of bounds"));
        }
        let align = u32::from(self.block_align);
        let rounded = requested
            .checked_add(align - 1)
            .ok_or(DsError::InvalidParam("buffer length overflow"))?
            / align
            * align;
        if rounded > MAX_BUFFER_BYTES {
            return Err(DsError::InvalidParam("buffer length out of bounds"));
        }
        Ok(rounded)
    }

    /// Snap a byte offset down to the nearest whole-block boundary.
    pub fn snap_to_block(&self, offset: u32) -> u32 {
        offset - offset % u32::from(self.block_align)
    }
}

/// Millibel attenuation to linear gain. `0` mB is unity, `-10_000` mB is
/// treated as silence.
pub fn millibels_to_gain(mb: i32) -> f32 {
    if mb <= VOLUME_MIN_MB {
        0.0
    } else {
        10f32.powf(mb as f32 / 2_000.0)
    }
}

/// Millibel pan to a signed unit position (-1 full left .. +1 full right).
pub fn pan_to_unit(mb: i32) -> f32 {
    (mb as f32 / PAN_RIGHT_MB as f32).clamp(-1.0, 1.0)
}

pub fn validate_volume_mb(mb: i32) -> Result<i32> {
    if (VOLUME_MIN_MB..=VOLUME_MAX_MB).contains(&mb) {
        Ok(mb)
    } else {
        Err(DsError::InvalidParam("volume out of range"))
    }
}

pub fn validate_pan_mb(mb: i32) -> Result<i32> {
    if (PAN_LEFT_MB..=PAN_RIGHT_MB).contains(&mb) {
        Ok(mb)
    } else {
        Err(DsError::InvalidParam("pan out of range"))
    }
}

pub fn validate_frequency_hz(hz: u32) -> Result<u32> {
    if hz == FREQUENCY_ORIGINAL || (FREQUENCY_MIN_HZ..=FREQUENCY_MAX_HZ).contains(&hz) {
        Ok(hz)
    } else {
        Err(DsError::InvalidParam("frequency out of range"))
    }
}
