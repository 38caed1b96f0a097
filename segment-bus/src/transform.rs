//! Pixel and sample conversion stages.

use std::sync::Arc;

use crate::backend::FrameTransform;
use crate::codec::MediaKind;
use crate::error::{Error, Result};
use crate::frame::Frame;
use crate::source::Sink;
use crate::stream::{Stream, StreamDescriptor};

/// Runs a conversion kernel over every frame of one stream of `kind`.
struct Converter {
    kind: MediaKind,
    kernel: Box<dyn FrameTransform>,
    output: Option<Arc<Stream<Frame>>>,
}

impl Converter {
    fn new(kind: MediaKind, kernel: Box<dyn FrameTransform>) -> Self {
        Self {
            kind,
            kernel,
            output: None,
        }
    }

    fn attach(&mut self, stream: &Arc<StreamDescriptor>) -> Result<()> {
        if stream.media_kind() != self.kind {
            return Err(Error::config(format!(
                "{} converter cannot take {} stream {} of {}",
                self.kind,
                stream.media_kind(),
                stream.index(),
                stream.origin()
            )));
        }
        let parameters = stream
            .parameters()
            .map(|p| self.kernel.output_parameters(p));
        let descriptor = StreamDescriptor::new(
            stream.index(),
            stream.origin(),
            parameters,
            stream.time_base(),
        )
        .with_frame_rate(stream.frame_rate());
        self.output = Some(Arc::new(Stream::new(Arc::new(descriptor))));
        Ok(())
    }

    fn convert(&mut self, frame: &Frame) -> Result<()> {
        let output = self
            .output
            .as_ref()
            .ok_or_else(|| Error::config(format!("{} converter is not subscribed", self.kind)))?;
        self.kernel
            .transform(frame, &mut |converted| Ok(output.forward(converted)?))
            .map_err(Error::from_backend)
    }
}

/// Video stage rescaling or reformatting every picture.
pub struct Scaler(Converter);

impl Scaler {
    pub fn new(kernel: Box<dyn FrameTransform>) -> Self {
        Self(Converter::new(MediaKind::Video, kernel))
    }

    pub fn output(&self) -> Option<Arc<Stream<Frame>>> {
        self.0.output.clone()
    }
}

impl Sink<Frame> for Scaler {
    fn process(&mut self, frame: &Frame, _stream: &Arc<StreamDescriptor>) -> Result<()> {
        self.0.convert(frame)
    }

    fn on_subscribe(&mut self, stream: &Arc<StreamDescriptor>) -> Result<()> {
        self.0.attach(stream)
    }
}

/// Audio stage converting sample format, rate or layout.
pub struct Resampler(Converter);

impl Resampler {
    pub fn new(kernel: Box<dyn FrameTransform>) -> Self {
        Self(Converter::new(MediaKind::Audio, kernel))
    }

    pub fn output(&self) -> Option<Arc<Stream<Frame>>> {
        self.0.output.clone()
    }
}

impl Sink<Frame> for Resampler {
    fn process(&mut self, frame: &Frame, _stream: &Arc<StreamDescriptor>) -> Result<()> {
        self.0.convert(frame)
    }

    fn on_subscribe(&mut self, stream: &Arc<StreamDescriptor>) -> Result<()> {
        self.0.attach(stream)
    }
}
