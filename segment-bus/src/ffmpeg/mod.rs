//! Codec backend built on libav through `ffmpeg-next`.
//!
//! Covers demuxing, audio and video decoding, video encoding, muxing and
//! picture scaling. Audio resampling kernels are not provided.

mod decode;
mod encode;
mod frame;
mod input;
mod output;
mod params;
mod scale;

use std::str::FromStr;

use anyhow::anyhow;

pub use decode::FfmpegDecoder;
pub use encode::FfmpegEncoder;
pub use frame::{Picture, Samples};
pub use input::FfmpegSource;
pub use output::FfmpegOutput;
pub use scale::FfmpegScaler;

use crate::backend::{
    CodecBackend, DecodeContext, EncodeContext, EncoderSettings, FrameTransform, MediaSource,
    MuxOutput,
};
use crate::codec::{CodecParameters, Rational};

#[derive(Debug, Default, Clone, Copy)]
pub struct FfmpegBackend;

impl FfmpegBackend {
    pub fn new() -> Self {
        Self
    }

    /// Picture scaler to `width`x`height` in `pixel_format` (libav name,
    /// `yuv420p` when `None`).
    pub fn scaler(
        &self,
        width: u32,
        height: u32,
        pixel_format: Option<&str>,
    ) -> anyhow::Result<Box<dyn FrameTransform>> {
        let format = match pixel_format {
            Some(name) => ffmpeg_next::format::Pixel::from_str(name)
                .map_err(|_| anyhow!("unknown pixel format: {name}"))?,
            None => ffmpeg_next::format::Pixel::YUV420P,
        };
        Ok(Box::new(FfmpegScaler::new(width, height, format)))
    }
}

impl CodecBackend for FfmpegBackend {
    fn open_source(&self, url: &str) -> anyhow::Result<Box<dyn MediaSource>> {
        Ok(Box::new(FfmpegSource::open(url)?))
    }

    fn open_decoder(
        &self,
        parameters: &CodecParameters,
        time_base: Rational,
    ) -> anyhow::Result<Box<dyn DecodeContext>> {
        Ok(Box::new(FfmpegDecoder::open(parameters, time_base)?))
    }

    fn open_encoder(
        &self,
        settings: &EncoderSettings,
        input: &CodecParameters,
        time_base: Rational,
    ) -> anyhow::Result<Box<dyn EncodeContext>> {
        Ok(Box::new(FfmpegEncoder::open(settings, input, time_base)?))
    }

    fn open_output(&self, url: &str, format: Option<&str>) -> anyhow::Result<Box<dyn MuxOutput>> {
        Ok(Box::new(FfmpegOutput::create(url, format)?))
    }
}
