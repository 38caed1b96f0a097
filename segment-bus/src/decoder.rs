use std::sync::Arc;

use crate::error::{Error, Result};
use crate::frame::Frame;
use crate::packet::Packet;
use crate::source::Sink;
use crate::stream::{Stream, StreamDescriptor};

/// Decodes packets of one stream with the decode context owned by the
/// stream's descriptor and republishes the frames.
#[derive(Default)]
pub struct Decoder {
    output: Option<Arc<Stream<Frame>>>,
}

impl Decoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Frame stream, available once the decoder is subscribed.
    pub fn output(&self) -> Option<Arc<Stream<Frame>>> {
        self.output.clone()
    }

    /// Drains frames still buffered in the decode context.
    pub fn flush(&mut self) -> Result<()> {
        let Some(output) = &self.output else {
            return Ok(());
        };
        output
            .descriptor()
            .decode_with(|ctx| ctx.flush(&mut |frame| Ok(output.forward(frame)?)))
    }
}

impl Sink<Packet> for Decoder {
    fn process(&mut self, packet: &Packet, stream: &Arc<StreamDescriptor>) -> Result<()> {
        let output = self
            .output
            .as_ref()
            .ok_or_else(|| Error::config("decoder is not subscribed to a stream"))?;
        stream.decode_with(|ctx| ctx.decode(packet, &mut |frame| Ok(output.forward(frame)?)))
    }

    fn on_subscribe(&mut self, stream: &Arc<StreamDescriptor>) -> Result<()> {
        if !stream.has_decoder() {
            return Err(Error::config(format!(
                "stream {} of {} has no decoder",
                stream.index(),
                stream.origin()
            )));
        }
        self.output = Some(Arc::new(Stream::new(stream.clone())));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::codec::MediaKind;
    use crate::frame::Planes;
    use crate::source::SinkHandle;
    use crate::testing::{self, TestBackend};
    use crate::backend::CodecBackend;

    fn decodable(info: crate::backend::StreamInfo) -> Stream<Packet> {
        let backend = TestBackend::new();
        let decoder = backend
            .open_decoder(&info.parameters, info.time_base)
            .unwrap();
        Stream::new(Arc::new(
            StreamDescriptor::from_info(&info, "test.mp4").with_decoder(decoder),
        ))
    }

    #[test]
    fn test_frames_follow_packets() {
        let stream = decodable(testing::video_info(0));
        let decoder = SinkHandle::new(Decoder::new());
        decoder.subscribe(&stream).unwrap();
        let frames = decoder.with(|d| d.output()).unwrap();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let _sub = {
            let seen = seen.clone();
            frames.subscribe(move |frame: &Frame, _| {
                let planes = frame.downcast_ref::<Planes>().unwrap();
                seen.lock()
                    .unwrap()
                    .push((frame.kind, frame.pts, planes.planes[0].to_vec()));
                Ok(())
            })
        };

        for packet in testing::video_packets(0, 3, 3) {
            stream.forward(&packet).unwrap();
        }
        decoder.with(|d| d.flush()).unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 3);
        assert_eq!(seen[1], (MediaKind::Video, Some(3600), b"0:3600".to_vec()));
    }

    #[test]
    fn test_requires_decode_context() {
        let stream = Stream::<Packet>::new(testing::video_descriptor());
        let decoder = SinkHandle::new(Decoder::new());
        assert!(matches!(decoder.subscribe(&stream), Err(Error::Config(_))));
        assert!(decoder.with(|d| d.output()).is_none());
    }

    #[test]
    fn test_downstream_error_reaches_upstream() {
        let stream = decodable(testing::audio_info(1));
        let decoder = SinkHandle::new(Decoder::new());
        decoder.subscribe(&stream).unwrap();
        let frames = decoder.with(|d| d.output()).unwrap();
        let _sub = frames.subscribe(|_, _| Err(Error::protocol("downstream")));
        let err = stream.forward(&testing::packet(1, 0, true)).unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
    }
}
