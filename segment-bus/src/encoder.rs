use std::sync::Arc;

use crate::backend::{CodecBackend, EncodeContext, EncoderSettings};
use crate::error::{Error, Result};
use crate::frame::Frame;
use crate::packet::Packet;
use crate::source::Sink;
use crate::stream::{Stream, StreamDescriptor};

/// Encodes the frames of one stream and republishes the packets.
///
/// The encode context is opened on subscribe, from the upstream parameters
/// and time base, so the output stream carries the encoder's parameters
/// before the first frame arrives.
pub struct Encoder {
    backend: Arc<dyn CodecBackend>,
    settings: EncoderSettings,
    context: Option<Box<dyn EncodeContext>>,
    output: Option<Arc<Stream<Packet>>>,
}

impl Encoder {
    pub fn new(backend: Arc<dyn CodecBackend>, settings: EncoderSettings) -> Self {
        Self {
            backend,
            settings,
            context: None,
            output: None,
        }
    }

    pub fn settings(&self) -> &EncoderSettings {
        &self.settings
    }

    pub fn output(&self) -> Option<Arc<Stream<Packet>>> {
        self.output.clone()
    }

    /// Drains packets still buffered in the encoder.
    pub fn flush(&mut self) -> Result<()> {
        let (Some(context), Some(output)) = (self.context.as_mut(), self.output.as_ref()) else {
            return Ok(());
        };
        context
            .flush(&mut |packet| Ok(output.forward(packet)?))
            .map_err(Error::from_backend)
    }
}

impl Sink<Frame> for Encoder {
    fn process(&mut self, frame: &Frame, _stream: &Arc<StreamDescriptor>) -> Result<()> {
        let (Some(context), Some(output)) = (self.context.as_mut(), self.output.as_ref()) else {
            return Err(Error::config("encoder is not subscribed to a stream"));
        };
        context
            .encode(frame, &mut |packet| Ok(output.forward(packet)?))
            .map_err(Error::from_backend)
    }

    fn on_subscribe(&mut self, stream: &Arc<StreamDescriptor>) -> Result<()> {
        let parameters = stream.parameters().ok_or_else(|| {
            Error::config(format!(
                "stream {} of {} has no codec parameters",
                stream.index(),
                stream.origin()
            ))
        })?;
        let context = self
            .backend
            .open_encoder(&self.settings, parameters, stream.time_base())
            .map_err(|e| Error::resource(format!("open encoder: {e}")))?;
        let descriptor = StreamDescriptor::new(
            stream.index(),
            stream.origin(),
            Some(context.parameters()),
            context.time_base(),
        )
        .with_frame_rate(stream.frame_rate());
        log::info!(
            "encoder for stream {} of {}: codec {:?}, time base {}",
            stream.index(),
            stream.origin(),
            self.settings.codec,
            context.time_base()
        );
        self.output = Some(Arc::new(Stream::new(Arc::new(descriptor))));
        self.context = Some(context);
        Ok(())
    }
}
