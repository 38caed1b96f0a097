use std::fmt::{Display, Formatter};

use bytes::Bytes;

/// Kind of media carried by a logical stream. Discriminants follow libav's
/// `AVMediaType` so they can travel on the wire unchanged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum MediaKind {
    #[default]
    Unknown,
    Video,
    Audio,
    Data,
    Subtitle,
}

impl MediaKind {
    pub fn tag(self) -> i32 {
        match self {
            MediaKind::Unknown => -1,
            MediaKind::Video => 0,
            MediaKind::Audio => 1,
            MediaKind::Data => 2,
            MediaKind::Subtitle => 3,
        }
    }

    /// Unrecognised tags map to `Unknown` rather than failing; the kind is
    /// informational on the receiving side.
    pub fn from_tag(tag: i32) -> Self {
        match tag {
            0 => MediaKind::Video,
            1 => MediaKind::Audio,
            2 => MediaKind::Data,
            3 => MediaKind::Subtitle,
            _ => MediaKind::Unknown,
        }
    }

    pub fn is_video(self) -> bool {
        self == MediaKind::Video
    }

    pub fn is_audio(self) -> bool {
        self == MediaKind::Audio
    }
}

impl Display for MediaKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            MediaKind::Unknown => "unknown",
            MediaKind::Video => "video",
            MediaKind::Audio => "audio",
            MediaKind::Data => "data",
            MediaKind::Subtitle => "subtitle",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Rational {
    pub num: i32,
    pub den: i32,
}

impl Rational {
    pub const MICROS: Rational = Rational::new(1, 1_000_000);

    pub const fn new(num: i32, den: i32) -> Self {
        Self { num, den }
    }

    pub fn is_valid(&self) -> bool {
        self.num > 0 && self.den > 0
    }

    /// Rescales `value` expressed in `from` units into `to` units, rounding to
    /// the nearest integer. Returns `None` when either base is unusable.
    pub fn rescale(value: i64, from: Rational, to: Rational) -> Option<i64> {
        if !from.is_valid() || !to.is_valid() {
            return None;
        }
        let numer = value as i128 * from.num as i128 * to.den as i128;
        let denom = from.den as i128 * to.num as i128;
        let half = denom / 2;
        let rounded = if numer >= 0 {
            (numer + half) / denom
        } else {
            (numer - half) / denom
        };
        i64::try_from(rounded).ok()
    }
}

impl Display for Rational {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.num, self.den)
    }
}

/// Snapshot of the codec parameters needed to open a decoder for a stream.
///
/// Field set and order mirror libav's `AVCodecParameters`; the wire codec
/// serializes them in exactly this order.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct CodecParameters {
    pub media_kind: MediaKind,
    /// Backend codec identifier (libav `AVCodecID` numbering).
    pub codec_id: u32,
    pub codec_tag: u32,
    pub extradata: Bytes,
    /// Pixel format for video, sample format for audio.
    pub format: i32,
    pub bit_rate: i64,
    pub bits_per_coded_sample: i32,
    pub bits_per_raw_sample: i32,
    pub profile: i32,
    pub level: i32,
    pub width: i32,
    pub height: i32,
    pub sample_aspect_ratio: Rational,
    pub field_order: i32,
    pub color_range: i32,
    pub color_primaries: i32,
    pub color_trc: i32,
    pub color_space: i32,
    pub chroma_location: i32,
    pub video_delay: i32,
    pub channel_layout: u64,
    pub channels: i32,
    pub sample_rate: i32,
    pub block_align: i32,
    pub frame_size: i32,
    pub initial_padding: i32,
    pub trailing_padding: i32,
    pub seek_preroll: i32,
}

impl CodecParameters {
    pub fn video(codec_id: u32, width: i32, height: i32) -> Self {
        Self {
            media_kind: MediaKind::Video,
            codec_id,
            width,
            height,
            ..Default::default()
        }
    }

    pub fn audio(codec_id: u32, sample_rate: i32, channels: i32) -> Self {
        Self {
            media_kind: MediaKind::Audio,
            codec_id,
            sample_rate,
            channels,
            ..Default::default()
        }
    }
}
