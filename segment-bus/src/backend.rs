//! Capabilities the pipeline needs from a codec/container engine.
//!
//! The core never implements codec algorithms or container formats. It calls
//! into a [`CodecBackend`] for probing, decoding, encoding and muxing, and
//! only orchestrates ownership, ordering and transport around those calls.
//! Backend methods report failures with `anyhow`, like the rest of the
//! libav-facing code.

use crate::codec::{CodecParameters, Rational};
use crate::frame::Frame;
use crate::packet::Packet;

/// A logical stream discovered while probing a source.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamInfo {
    pub index: usize,
    pub parameters: CodecParameters,
    pub time_base: Rational,
    pub frame_rate: Rational,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOutcome {
    /// The working packet was filled.
    Packet,
    Eof,
}

pub trait MediaSource: Send {
    fn url(&self) -> &str;

    fn streams(&self) -> Vec<StreamInfo>;

    /// Reads the next packet into `packet`, overwriting its previous contents.
    /// `Err` means the source failed mid-stream; end of input is
    /// `Ok(ReadOutcome::Eof)`.
    fn read(&mut self, packet: &mut Packet) -> anyhow::Result<ReadOutcome>;
}

pub type FrameEmitter<'a> = &'a mut dyn FnMut(&Frame) -> anyhow::Result<()>;
pub type PacketEmitter<'a> = &'a mut dyn FnMut(&Packet) -> anyhow::Result<()>;

pub trait DecodeContext: Send {
    /// Feeds one packet and emits every frame the decoder produces for it.
    fn decode(&mut self, packet: &Packet, emit: FrameEmitter<'_>) -> anyhow::Result<()>;

    /// Drains frames buffered inside the decoder.
    fn flush(&mut self, emit: FrameEmitter<'_>) -> anyhow::Result<()>;
}

pub trait EncodeContext: Send {
    /// Parameters of the encoded output stream.
    fn parameters(&self) -> CodecParameters;

    fn time_base(&self) -> Rational;

    fn encode(&mut self, frame: &Frame, emit: PacketEmitter<'_>) -> anyhow::Result<()>;

    fn flush(&mut self, emit: PacketEmitter<'_>) -> anyhow::Result<()>;
}

/// Pixel or sample conversion kernel (scaler, resampler).
pub trait FrameTransform: Send {
    fn transform(&mut self, frame: &Frame, emit: FrameEmitter<'_>) -> anyhow::Result<()>;

    /// Parameters of the converted stream given the upstream parameters.
    fn output_parameters(&self, input: &CodecParameters) -> CodecParameters {
        input.clone()
    }
}

pub trait MuxOutput: Send {
    /// Opens the underlying I/O.
    fn open(&mut self) -> anyhow::Result<()>;

    /// Adds an output stream. Only legal before the header is written.
    fn add_stream(
        &mut self,
        parameters: &CodecParameters,
        time_base: Rational,
    ) -> anyhow::Result<usize>;

    fn write_header(&mut self) -> anyhow::Result<()>;

    /// Time base chosen by the container for an output stream. Only final
    /// once the header has been written.
    fn stream_time_base(&self, index: usize) -> Option<Rational>;

    fn write(&mut self, packet: &Packet) -> anyhow::Result<()>;

    fn write_trailer(&mut self) -> anyhow::Result<()>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct EncoderSettings {
    /// Encoder name, e.g. `libx264`. `None` picks the backend default for the
    /// upstream codec.
    pub codec: Option<String>,
    /// `None` keeps the upstream dimension.
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub keyframe_interval: u32,
    pub pixel_format: Option<String>,
    pub bit_rate: Option<i64>,
}

impl Default for EncoderSettings {
    fn default() -> Self {
        Self {
            codec: Some("libx264".to_string()),
            width: None,
            height: None,
            keyframe_interval: 25,
            pixel_format: None,
            bit_rate: None,
        }
    }
}

pub trait CodecBackend: Send + Sync {
    fn open_source(&self, url: &str) -> anyhow::Result<Box<dyn MediaSource>>;

    /// Opens a decoder. Fails when no decoder exists for the codec id.
    fn open_decoder(
        &self,
        parameters: &CodecParameters,
        time_base: Rational,
    ) -> anyhow::Result<Box<dyn DecodeContext>>;

    fn open_encoder(
        &self,
        settings: &EncoderSettings,
        input: &CodecParameters,
        time_base: Rational,
    ) -> anyhow::Result<Box<dyn EncodeContext>>;

    fn open_output(&self, url: &str, format: Option<&str>) -> anyhow::Result<Box<dyn MuxOutput>>;
}
