use std::path::Path;

use crate::backend::{MediaSource, ReadOutcome, StreamInfo};
use crate::packet::Packet;

use super::params::{from_av, packet_from_av, rational_from};

/// Demuxer over a file, device or network url.
pub struct FfmpegSource {
    url: String,
    inner: ffmpeg_next::format::context::Input,
    streams: Vec<StreamInfo>,
    packet: ffmpeg_next::Packet,
}

unsafe impl Send for FfmpegSource {}

impl FfmpegSource {
    pub fn open(url: &str) -> anyhow::Result<Self> {
        let inner = ffmpeg_next::format::input(Path::new(url))?;
        let streams = inner
            .streams()
            .map(|stream| StreamInfo {
                index: stream.index(),
                parameters: from_av(&stream.parameters()),
                time_base: rational_from(stream.time_base()),
                frame_rate: rational_from(stream.avg_frame_rate()),
            })
            .collect();
        Ok(Self {
            url: url.to_string(),
            inner,
            streams,
            packet: ffmpeg_next::Packet::empty(),
        })
    }
}

impl MediaSource for FfmpegSource {
    fn url(&self) -> &str {
        &self.url
    }

    fn streams(&self) -> Vec<StreamInfo> {
        self.streams.clone()
    }

    fn read(&mut self, packet: &mut Packet) -> anyhow::Result<ReadOutcome> {
        loop {
            match self.packet.read(&mut self.inner) {
                Ok(()) => {
                    packet_from_av(&self.packet, packet);
                    return Ok(ReadOutcome::Packet);
                }
                Err(ffmpeg_next::Error::Eof) => return Ok(ReadOutcome::Eof),
                Err(ffmpeg_next::Error::Other { errno })
                    if errno == ffmpeg_next::util::error::EAGAIN =>
                {
                    continue;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}
