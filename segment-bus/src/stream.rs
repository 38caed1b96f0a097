use std::sync::{Arc, Mutex};

use crate::backend::{DecodeContext, StreamInfo};
use crate::codec::{CodecParameters, MediaKind, Rational};
use crate::error::{Error, Result, lock};
use crate::source::{Source, Subscription};

/// Per-stream metadata shared by every sink attached to one logical stream.
///
/// The decode context is owned here and nowhere else. Only the single thread
/// producing the stream's packets drives it, through [`StreamDescriptor::decode_with`].
pub struct StreamDescriptor {
    index: usize,
    origin: String,
    parameters: Option<CodecParameters>,
    time_base: Rational,
    frame_rate: Rational,
    decoder: Mutex<Option<Box<dyn DecodeContext>>>,
}

impl StreamDescriptor {
    pub fn new(
        index: usize,
        origin: impl Into<String>,
        parameters: Option<CodecParameters>,
        time_base: Rational,
    ) -> Self {
        Self {
            index,
            origin: origin.into(),
            parameters,
            time_base,
            frame_rate: Rational::default(),
            decoder: Mutex::new(None),
        }
    }

    pub fn from_info(info: &StreamInfo, origin: impl Into<String>) -> Self {
        Self::new(info.index, origin, Some(info.parameters.clone()), info.time_base)
            .with_frame_rate(info.frame_rate)
    }

    pub fn with_frame_rate(mut self, frame_rate: Rational) -> Self {
        self.frame_rate = frame_rate;
        self
    }

    pub fn with_decoder(self, decoder: Box<dyn DecodeContext>) -> Self {
        *lock(&self.decoder) = Some(decoder);
        self
    }

    pub fn index(&self) -> usize {
        self.index
    }

    /// Filename of the source, or the job id for reassembled streams.
    pub fn origin(&self) -> &str {
        &self.origin
    }

    pub fn parameters(&self) -> Option<&CodecParameters> {
        self.parameters.as_ref()
    }

    pub fn time_base(&self) -> Rational {
        self.time_base
    }

    pub fn frame_rate(&self) -> Rational {
        self.frame_rate
    }

    pub fn media_kind(&self) -> MediaKind {
        self.parameters
            .as_ref()
            .map(|p| p.media_kind)
            .unwrap_or(MediaKind::Unknown)
    }

    pub fn is_video(&self) -> bool {
        self.media_kind().is_video()
    }

    pub fn is_audio(&self) -> bool {
        self.media_kind().is_audio()
    }

    pub fn has_decoder(&self) -> bool {
        lock(&self.decoder).is_some()
    }

    /// Runs `f` against the decode context. Fails with a configuration error
    /// when the stream has none.
    pub fn decode_with<R>(
        &self,
        f: impl FnOnce(&mut dyn DecodeContext) -> anyhow::Result<R>,
    ) -> Result<R> {
        let mut decoder = lock(&self.decoder);
        let decoder = decoder.as_deref_mut().ok_or_else(|| {
            Error::config(format!(
                "stream {} of {} has no decoder",
                self.index, self.origin
            ))
        })?;
        f(decoder).map_err(Error::from_backend)
    }

    /// Releases the decode context.
    pub fn close_decoder(&self) {
        lock(&self.decoder).take();
    }
}

impl std::fmt::Debug for StreamDescriptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamDescriptor")
            .field("index", &self.index)
            .field("origin", &self.origin)
            .field("kind", &self.media_kind())
            .field("time_base", &self.time_base)
            .field("decoder", &self.has_decoder())
            .finish()
    }
}

/// A logical channel of buffers: descriptor plus fan-out point.
pub struct Stream<T> {
    descriptor: Arc<StreamDescriptor>,
    source: Source<T>,
}

impl<T: 'static> Stream<T> {
    pub fn new(descriptor: Arc<StreamDescriptor>) -> Self {
        Self {
            descriptor,
            source: Source::new(),
        }
    }

    pub fn index(&self) -> usize {
        self.descriptor.index()
    }

    pub fn descriptor(&self) -> &Arc<StreamDescriptor> {
        &self.descriptor
    }

    pub fn source(&self) -> &Source<T> {
        &self.source
    }

    /// Pushes one buffer to every subscriber of this stream.
    pub fn forward(&self, item: &T) -> Result<()> {
        self.source.forward(item, &self.descriptor)
    }

    #[must_use = "dropping the subscription detaches the callback"]
    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&T, &Arc<StreamDescriptor>) -> Result<()> + Send + Sync + 'static,
    {
        self.source.subscribe(callback)
    }
}

impl<T> std::fmt::Debug for Stream<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stream")
            .field("descriptor", &self.descriptor)
            .finish()
    }
}
