use std::str::FromStr;

use anyhow::{anyhow, bail};
use ffmpeg_next::codec::Parameters;
use ffmpeg_next::format::Pixel;
use ffmpeg_next::software::scaling;
use ffmpeg_next::{Dictionary, ffi};

use crate::backend::{EncodeContext, EncoderSettings, PacketEmitter};
use crate::codec::{CodecParameters, MediaKind, Rational};
use crate::frame::Frame;
use crate::packet::Packet;

use super::frame::Picture;
use super::params::{from_av, packet_from_av, rational_into};

/// Video encoder. Pictures that do not match the configured size or pixel
/// format are converted first.
pub struct FfmpegEncoder {
    encoder: ffmpeg_next::codec::encoder::Video,
    time_base: Rational,
    parameters: CodecParameters,
    scaler: Option<scaling::Context>,
    converted: ffmpeg_next::frame::Video,
    av_packet: ffmpeg_next::Packet,
    packet: Packet,
}

unsafe impl Send for FfmpegEncoder {}

impl FfmpegEncoder {
    pub fn open(
        settings: &EncoderSettings,
        input: &CodecParameters,
        time_base: Rational,
    ) -> anyhow::Result<Self> {
        if input.media_kind != MediaKind::Video {
            bail!("only video encoding is supported, got {}", input.media_kind);
        }
        let codec = match settings.codec.as_deref() {
            Some(name) => ffmpeg_next::encoder::find_by_name(name)
                .ok_or_else(|| anyhow!("codec not found: {name}"))?,
            None => ffmpeg_next::encoder::find(ffmpeg_next::codec::Id::H264)
                .ok_or_else(|| anyhow!("no default h264 encoder"))?,
        };
        let pixel_format = match settings.pixel_format.as_deref() {
            Some(name) => {
                Pixel::from_str(name).map_err(|_| anyhow!("unknown pixel format: {name}"))?
            }
            None => Pixel::YUV420P,
        };
        let width = settings.width.unwrap_or(input.width.max(0) as u32);
        let height = settings.height.unwrap_or(input.height.max(0) as u32);
        if width == 0 || height == 0 {
            bail!("invalid output size {width}x{height}");
        }

        let mut encoder = ffmpeg_next::codec::Context::new_with_codec(codec)
            .encoder()
            .video()?;
        encoder.set_width(width);
        encoder.set_height(height);
        encoder.set_format(pixel_format);
        encoder.set_time_base(rational_into(time_base));
        encoder.set_gop(settings.keyframe_interval);
        if let Some(bit_rate) = settings.bit_rate {
            encoder.set_bit_rate(bit_rate.max(0) as usize);
        }
        let mut options = Dictionary::new();
        options.set("preset", "ultrafast");
        options.set("tune", "zerolatency");
        let encoder = encoder.open_with(options)?;
        log::info!(
            "encoder opened: {} {width}x{height} {pixel_format:?}",
            codec.name()
        );

        let mut parameters = Parameters::new();
        let ret = unsafe {
            ffi::avcodec_parameters_from_context(parameters.as_mut_ptr(), encoder.as_ptr())
        };
        if ret < 0 {
            return Err(ffmpeg_next::Error::from(ret).into());
        }
        let time_base = unsafe { (*encoder.as_ptr()).time_base };

        Ok(Self {
            parameters: from_av(&parameters),
            time_base: Rational::new(time_base.num, time_base.den),
            encoder,
            scaler: None,
            converted: ffmpeg_next::frame::Video::empty(),
            av_packet: ffmpeg_next::Packet::empty(),
            packet: Packet::empty(),
        })
    }

    fn drain(&mut self, emit: PacketEmitter<'_>) -> anyhow::Result<()> {
        loop {
            match self.encoder.receive_packet(&mut self.av_packet) {
                Ok(()) => {
                    packet_from_av(&self.av_packet, &mut self.packet);
                    emit(&self.packet)?;
                }
                Err(ffmpeg_next::Error::Other { errno })
                    if errno == ffmpeg_next::util::error::EAGAIN =>
                {
                    return Ok(());
                }
                Err(ffmpeg_next::Error::Eof) => return Ok(()),
                Err(err) => return Err(err.into()),
            }
        }
    }
}

impl EncodeContext for FfmpegEncoder {
    fn parameters(&self) -> CodecParameters {
        self.parameters.clone()
    }

    fn time_base(&self) -> Rational {
        self.time_base
    }

    fn encode(&mut self, frame: &Frame, emit: PacketEmitter<'_>) -> anyhow::Result<()> {
        let picture = frame
            .downcast_ref::<Picture>()
            .ok_or_else(|| anyhow!("frame does not hold a libav picture"))?;
        let picture = &picture.0;
        let matches = picture.format() == self.encoder.format()
            && picture.width() == self.encoder.width()
            && picture.height() == self.encoder.height();
        if matches {
            self.converted.clone_from(picture);
        } else {
            if self.scaler.is_none() {
                self.scaler = Some(scaling::Context::get(
                    picture.format(),
                    picture.width(),
                    picture.height(),
                    self.encoder.format(),
                    self.encoder.width(),
                    self.encoder.height(),
                    scaling::flag::Flags::BILINEAR,
                )?);
            }
            if let Some(scaler) = self.scaler.as_mut() {
                scaler.run(picture, &mut self.converted)?;
            }
        }
        self.converted.set_pts(frame.pts);
        self.encoder.send_frame(&self.converted)?;
        self.drain(emit)
    }

    fn flush(&mut self, emit: PacketEmitter<'_>) -> anyhow::Result<()> {
        self.encoder.send_eof()?;
        self.drain(emit)
    }
}
