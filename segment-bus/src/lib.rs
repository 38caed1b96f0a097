//! Media pipeline core: packet and frame buffers, fan-out streams, the reader
//! state machine, transform stages and a muxer, plus the segment transport
//! that rebuilds a live stream on a remote host.

pub mod backend;
pub mod cache;
pub mod codec;
pub mod decoder;
pub mod encoder;
pub mod error;
#[cfg(feature = "ffmpeg")]
pub mod ffmpeg;
pub mod frame;
pub mod muxer;
pub mod packet;
pub mod reader;
pub mod segment;
pub mod segmenter;
pub mod source;
mod state;
pub mod stream;
mod task;
#[cfg(test)]
mod testing;
pub mod transform;
pub mod transport;
pub mod unpacker;
pub mod wire;

pub use backend::{
    CodecBackend, DecodeContext, EncodeContext, EncoderSettings, FrameTransform, MediaSource,
    MuxOutput, ReadOutcome, StreamInfo,
};
pub use cache::{DescriptorLookup, StreamCache, StreamCacheConfig};
pub use codec::{CodecParameters, MediaKind, Rational};
pub use decoder::Decoder;
pub use encoder::Encoder;
pub use error::{Error, Result};
pub use frame::{Frame, FrameData, Planes};
pub use muxer::{Muxer, MuxerConfig, MuxerState};
pub use packet::{Packet, PacketFlags, SideData};
pub use reader::Reader;
pub use segment::{JobId, Segment};
pub use segmenter::{Segmenter, SegmenterConfig};
pub use source::{Sink, SinkHandle, Source, Subscription};
pub use state::{ReaderEvent, ReaderState};
pub use stream::{Stream, StreamDescriptor};
pub use transform::{Resampler, Scaler};
pub use transport::{Publisher, Subscriber, SubscriberConfig};
pub use unpacker::{SegmentUnpacker, UnpackerConfig};
pub use wire::{Envelope, EnvelopeCodec, decode_segment, encode_segment};

/// Registers the codec backend's components. Call once at startup before
/// opening any source. A no-op without a compiled-in backend.
pub fn init() -> anyhow::Result<()> {
    #[cfg(feature = "ffmpeg")]
    ffmpeg_next::init().map_err(|e| anyhow::anyhow!("ffmpeg_next init: {}", e))?;
    Ok(())
}
