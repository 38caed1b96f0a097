use anyhow::bail;
use ffmpeg_next::ffi;

use crate::backend::{DecodeContext, FrameEmitter};
use crate::codec::{CodecParameters, MediaKind, Rational};
use crate::frame::Frame;
use crate::packet::Packet;

use super::frame::{Picture, Samples};
use super::params::{packet_into_av, rational_from, rational_into, to_av};

enum Inner {
    Video(ffmpeg_next::codec::decoder::Video),
    Audio(ffmpeg_next::codec::decoder::Audio),
}

impl Inner {
    fn send_packet(&mut self, packet: &ffmpeg_next::Packet) -> anyhow::Result<()> {
        match self {
            Inner::Video(decoder) => decoder.send_packet(packet)?,
            Inner::Audio(decoder) => decoder.send_packet(packet)?,
        }
        Ok(())
    }

    fn send_eof(&mut self) -> anyhow::Result<()> {
        match self {
            Inner::Video(decoder) => decoder.send_eof()?,
            Inner::Audio(decoder) => decoder.send_eof()?,
        }
        Ok(())
    }

    /// Pulls one frame into `frame`. `false` when the decoder needs more
    /// input or is drained.
    fn receive_frame(&mut self, frame: &mut Frame) -> anyhow::Result<bool> {
        let received = match self {
            Inner::Video(decoder) => match frame.downcast_mut::<Picture>() {
                Some(picture) => decoder.receive_frame(&mut picture.0),
                None => bail!("working frame does not hold a picture"),
            },
            Inner::Audio(decoder) => match frame.downcast_mut::<Samples>() {
                Some(samples) => decoder.receive_frame(&mut samples.0),
                None => bail!("working frame does not hold samples"),
            },
        };
        match received {
            Ok(()) => Ok(true),
            Err(ffmpeg_next::Error::Eof) => Ok(false),
            Err(ffmpeg_next::Error::Other { errno })
                if errno == ffmpeg_next::util::error::EAGAIN =>
            {
                Ok(false)
            }
            Err(err) => Err(err.into()),
        }
    }
}

pub struct FfmpegDecoder {
    inner: Inner,
    stream_time_base: Rational,
    decoder_time_base: Rational,
    frame: Frame,
}

unsafe impl Send for FfmpegDecoder {}

impl FfmpegDecoder {
    pub fn open(parameters: &CodecParameters, time_base: Rational) -> anyhow::Result<Self> {
        let mut context = ffmpeg_next::codec::Context::new();
        unsafe {
            (*context.as_mut_ptr()).time_base = rational_into(time_base).into();
        }
        context.set_parameters(to_av(parameters)?)?;

        let (inner, frame, decoder_time_base) = match parameters.media_kind {
            MediaKind::Video => {
                let decoder = context.decoder().video()?;
                if decoder.width() == 0 || decoder.height() == 0 {
                    bail!("missing codec parameters");
                }
                let decoder_time_base = rational_from(decoder.time_base());
                let frame =
                    Frame::with_data(Box::new(Picture(ffmpeg_next::frame::Video::empty())));
                (Inner::Video(decoder), frame, decoder_time_base)
            }
            MediaKind::Audio => {
                let decoder = context.decoder().audio()?;
                let decoder_time_base = rational_from(decoder.time_base());
                let frame =
                    Frame::with_data(Box::new(Samples(ffmpeg_next::frame::Audio::empty())));
                (Inner::Audio(decoder), frame, decoder_time_base)
            }
            other => bail!("unsupported stream type {other}"),
        };

        Ok(Self {
            inner,
            stream_time_base: time_base,
            decoder_time_base,
            frame,
        })
    }

    /// Frames come back in the stream's time base.
    fn drain(&mut self, emit: FrameEmitter<'_>) -> anyhow::Result<()> {
        while self.inner.receive_frame(&mut self.frame)? {
            self.describe();
            emit(&self.frame)?;
        }
        Ok(())
    }

    fn describe(&mut self) {
        let (pts, key) = match &self.inner {
            Inner::Video(_) => {
                let Some(picture) = self.frame.downcast_ref::<Picture>() else {
                    return;
                };
                let picture = &picture.0;
                let (pts, key) = (picture.pts(), picture.is_key());
                let (width, height) = (picture.width(), picture.height());
                let format = ffi::AVPixelFormat::from(picture.format()) as i32;
                self.frame.kind = MediaKind::Video;
                self.frame.width = width;
                self.frame.height = height;
                self.frame.format = format;
                (pts, key)
            }
            Inner::Audio(_) => {
                let Some(samples) = self.frame.downcast_ref::<Samples>() else {
                    return;
                };
                let samples = &samples.0;
                let pts = samples.pts();
                let (nb_samples, rate) = (samples.samples(), samples.rate());
                let channels = unsafe { (*samples.as_ptr()).ch_layout.nb_channels.max(0) as u16 };
                let format = ffi::AVSampleFormat::from(samples.format()) as i32;
                self.frame.kind = MediaKind::Audio;
                self.frame.nb_samples = nb_samples;
                self.frame.sample_rate = rate;
                self.frame.channels = channels;
                self.frame.format = format;
                (pts, true)
            }
        };
        self.frame.key = key;
        self.frame.pts = match pts {
            Some(pts) if self.decoder_time_base != self.stream_time_base => {
                Rational::rescale(pts, self.decoder_time_base, self.stream_time_base).or(Some(pts))
            }
            other => other,
        };
    }
}

impl DecodeContext for FfmpegDecoder {
    fn decode(&mut self, packet: &Packet, emit: FrameEmitter<'_>) -> anyhow::Result<()> {
        let mut av = packet_into_av(packet);
        if self.decoder_time_base.is_valid() && self.decoder_time_base != self.stream_time_base {
            av.rescale_ts(
                rational_into(self.stream_time_base),
                rational_into(self.decoder_time_base),
            );
        }
        self.frame.stream_index = packet.stream_index();
        self.inner.send_packet(&av)?;
        self.drain(emit)
    }

    fn flush(&mut self, emit: FrameEmitter<'_>) -> anyhow::Result<()> {
        self.inner.send_eof()?;
        self.drain(emit)
    }
}
