use std::any::Any;
use std::fmt::{Debug, Formatter};

use crate::frame::FrameData;

/// Decoded picture kept in libav's own frame.
pub struct Picture(pub ffmpeg_next::frame::Video);

/// Decoded audio kept in libav's own frame.
pub struct Samples(pub ffmpeg_next::frame::Audio);

unsafe impl Send for Picture {}
unsafe impl Sync for Picture {}
unsafe impl Send for Samples {}
unsafe impl Sync for Samples {}

impl Debug for Picture {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Picture")
            .field("width", &self.0.width())
            .field("height", &self.0.height())
            .field("format", &self.0.format())
            .field("pts", &self.0.pts())
            .finish()
    }
}

impl Debug for Samples {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Samples")
            .field("samples", &self.0.samples())
            .field("rate", &self.0.rate())
            .field("format", &self.0.format())
            .field("pts", &self.0.pts())
            .finish()
    }
}

impl FrameData for Picture {
    fn copy(&self) -> Box<dyn FrameData> {
        Box::new(Picture(self.0.clone()))
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

impl FrameData for Samples {
    fn copy(&self) -> Box<dyn FrameData> {
        Box::new(Samples(self.0.clone()))
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}
