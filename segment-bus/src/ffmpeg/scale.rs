use anyhow::anyhow;
use ffmpeg_next::ffi;
use ffmpeg_next::format::Pixel;
use ffmpeg_next::software::scaling;

use crate::backend::{FrameEmitter, FrameTransform};
use crate::codec::CodecParameters;
use crate::frame::Frame;

use super::frame::Picture;

/// Converts pictures to a fixed size and pixel format. The conversion context
/// is built from the first picture and rebuilt when the input changes shape.
pub struct FfmpegScaler {
    width: u32,
    height: u32,
    format: Pixel,
    context: Option<(scaling::Context, (Pixel, u32, u32))>,
    frame: Frame,
}

unsafe impl Send for FfmpegScaler {}

impl FfmpegScaler {
    pub fn new(width: u32, height: u32, format: Pixel) -> Self {
        Self {
            width,
            height,
            format,
            context: None,
            frame: Frame::video(
                width,
                height,
                ffi::AVPixelFormat::from(format) as i32,
                Box::new(Picture(ffmpeg_next::frame::Video::empty())),
            ),
        }
    }
}

impl FrameTransform for FfmpegScaler {
    fn transform(&mut self, frame: &Frame, emit: FrameEmitter<'_>) -> anyhow::Result<()> {
        let picture = &frame
            .downcast_ref::<Picture>()
            .ok_or_else(|| anyhow!("frame does not hold a libav picture"))?
            .0;
        let shape = (picture.format(), picture.width(), picture.height());
        let rebuild = !matches!(&self.context, Some((_, current)) if *current == shape);
        if rebuild {
            let context = scaling::Context::get(
                shape.0,
                shape.1,
                shape.2,
                self.format,
                self.width,
                self.height,
                scaling::flag::Flags::BILINEAR,
            )?;
            self.context = Some((context, shape));
        }
        let (context, _) = self
            .context
            .as_mut()
            .ok_or_else(|| anyhow!("scaler context missing"))?;
        let out = self
            .frame
            .downcast_mut::<Picture>()
            .ok_or_else(|| anyhow!("working frame does not hold a picture"))?;
        context.run(picture, &mut out.0)?;
        out.0.set_pts(frame.pts);

        self.frame.pts = frame.pts;
        self.frame.key = frame.key;
        self.frame.stream_index = frame.stream_index;
        emit(&self.frame)
    }

    fn output_parameters(&self, input: &CodecParameters) -> CodecParameters {
        CodecParameters {
            width: self.width as i32,
            height: self.height as i32,
            format: ffi::AVPixelFormat::from(self.format) as i32,
            ..input.clone()
        }
    }
}
