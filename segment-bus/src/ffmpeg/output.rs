use anyhow::anyhow;

use crate::backend::MuxOutput;
use crate::codec::{CodecParameters, Rational};
use crate::packet::Packet;

use super::params::{packet_into_av, rational_from, rational_into, to_av};

/// Container writer. libav opens the file or network target when the context
/// is created, so [`MuxOutput::open`] only checks that it happened.
pub struct FfmpegOutput {
    url: String,
    inner: ffmpeg_next::format::context::Output,
    have_written_header: bool,
    have_written_trailer: bool,
}

unsafe impl Send for FfmpegOutput {}

impl FfmpegOutput {
    pub fn create(url: &str, format: Option<&str>) -> anyhow::Result<Self> {
        let inner = match format {
            Some(format) => ffmpeg_next::format::output_as(&url, format)?,
            None => ffmpeg_next::format::output(&url)?,
        };
        Ok(Self {
            url: url.to_string(),
            inner,
            have_written_header: false,
            have_written_trailer: false,
        })
    }
}

impl MuxOutput for FfmpegOutput {
    fn open(&mut self) -> anyhow::Result<()> {
        let pb = unsafe { (*self.inner.as_ptr()).pb };
        let needs_file = unsafe {
            let format = (*self.inner.as_ptr()).oformat;
            !format.is_null() && (*format).flags & ffmpeg_next::ffi::AVFMT_NOFILE as i32 == 0
        };
        if needs_file && pb.is_null() {
            return Err(anyhow!("{} is not open for writing", self.url));
        }
        Ok(())
    }

    fn add_stream(
        &mut self,
        parameters: &CodecParameters,
        time_base: Rational,
    ) -> anyhow::Result<usize> {
        let parameters = to_av(parameters)?;
        let mut stream = self
            .inner
            .add_stream(ffmpeg_next::encoder::find(parameters.id()))?;
        stream.set_parameters(parameters);
        stream.set_time_base(rational_into(time_base));
        // let the container pick its own tag
        unsafe {
            (*(*stream.as_mut_ptr()).codecpar).codec_tag = 0;
        }
        Ok(stream.index())
    }

    fn write_header(&mut self) -> anyhow::Result<()> {
        if !self.have_written_header {
            self.inner.write_header()?;
            self.have_written_header = true;
        }
        Ok(())
    }

    fn stream_time_base(&self, index: usize) -> Option<Rational> {
        self.inner
            .stream(index)
            .map(|stream| rational_from(stream.time_base()))
    }

    fn write(&mut self, packet: &Packet) -> anyhow::Result<()> {
        let mut av = packet_into_av(packet);
        av.set_position(-1);
        av.write(&mut self.inner)?;
        Ok(())
    }

    fn write_trailer(&mut self) -> anyhow::Result<()> {
        if self.have_written_header && !self.have_written_trailer {
            self.have_written_trailer = true;
            self.inner.write_trailer()?;
        }
        Ok(())
    }
}
