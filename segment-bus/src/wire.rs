//! Segment wire format.
//!
//! Every message is one length-delimited frame:
//!
//! ```text
//! [16 job id][4 media kind][4 width][4 height][segment payload]
//! ```
//!
//! The payload starts with a format version byte followed by the segment
//! fields in fixed order, all integers big-endian. Field order is part of
//! the protocol; bump [`FORMAT_VERSION`] when it changes.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};
use uuid::Uuid;

use crate::codec::{CodecParameters, MediaKind, Rational};
use crate::error::{Error, Result};
use crate::packet::{Packet, PacketFlags};
use crate::segment::{JobId, Segment};

pub const FORMAT_VERSION: u8 = 1;
pub const ENVELOPE_HEADER_LEN: usize = 28;
pub const MAX_MESSAGE_LEN: usize = 64 * 1024 * 1024;

const NO_TIMESTAMP: i64 = i64::MIN;
// pts, dts, size, stream index, flags, side data count, duration, position
const MIN_PACKET_LEN: usize = 48;

/// Routing header plus an opaque serialized segment.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub job_id: JobId,
    pub kind: MediaKind,
    pub width: u32,
    pub height: u32,
    pub payload: Bytes,
}

impl Envelope {
    pub fn for_segment(segment: &Segment) -> Self {
        let parameters = segment.parameters();
        Self {
            job_id: segment.job_id(),
            kind: parameters.media_kind,
            width: parameters.width.max(0) as u32,
            height: parameters.height.max(0) as u32,
            payload: encode_segment(segment),
        }
    }

    pub fn segment(&self) -> Result<Segment> {
        decode_segment(self.payload.clone())
    }
}

/// Frames [`Envelope`]s over a byte stream.
#[derive(Debug)]
pub struct EnvelopeCodec {
    frames: LengthDelimitedCodec,
}

impl Default for EnvelopeCodec {
    fn default() -> Self {
        Self {
            frames: LengthDelimitedCodec::builder()
                .max_frame_length(MAX_MESSAGE_LEN)
                .new_codec(),
        }
    }
}

impl Encoder<Envelope> for EnvelopeCodec {
    type Error = Error;

    fn encode(&mut self, item: Envelope, dst: &mut BytesMut) -> Result<()> {
        let mut frame = BytesMut::with_capacity(ENVELOPE_HEADER_LEN + item.payload.len());
        frame.put_slice(item.job_id.as_bytes());
        frame.put_i32(item.kind.tag());
        frame.put_u32(item.width);
        frame.put_u32(item.height);
        frame.put_slice(&item.payload);
        self.frames.encode(frame.freeze(), dst)?;
        Ok(())
    }
}

impl Decoder for EnvelopeCodec {
    type Item = Envelope;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Envelope>> {
        let Some(mut frame) = self.frames.decode(src)? else {
            return Ok(None);
        };
        if frame.len() < ENVELOPE_HEADER_LEN {
            return Err(Error::protocol(format!(
                "envelope of {} bytes is shorter than its header",
                frame.len()
            )));
        }
        let job_id = get_uuid(&mut frame)?;
        let kind = MediaKind::from_tag(frame.get_i32());
        let width = frame.get_u32();
        let height = frame.get_u32();
        Ok(Some(Envelope {
            job_id,
            kind,
            width,
            height,
            payload: frame.freeze(),
        }))
    }
}

pub fn encode_segment(segment: &Segment) -> Bytes {
    let payload_len: usize = segment.packets().iter().map(|p| p.size() + 64).sum();
    let mut buf = BytesMut::with_capacity(256 + payload_len);
    buf.put_u8(FORMAT_VERSION);
    buf.put_slice(segment.job_id().as_bytes());
    put_timestamp(&mut buf, segment.pts());
    put_timestamp(&mut buf, segment.dts());
    put_rational(&mut buf, segment.time_base());
    put_parameters(&mut buf, segment.parameters());
    buf.put_u32(segment.len() as u32);
    for packet in segment.packets() {
        put_packet(&mut buf, packet);
    }
    buf.freeze()
}

pub fn decode_segment(mut buf: Bytes) -> Result<Segment> {
    let version = Checked::u8(&mut buf)?;
    if version != FORMAT_VERSION {
        return Err(Error::protocol(format!(
            "unsupported segment format version {version}"
        )));
    }
    let job_id = get_uuid(&mut buf)?;
    let pts = get_timestamp(&mut buf)?;
    let dts = get_timestamp(&mut buf)?;
    let time_base = get_rational(&mut buf)?;
    let parameters = get_parameters(&mut buf)?;
    let count = Checked::u32(&mut buf)? as usize;
    if count > buf.remaining() / MIN_PACKET_LEN {
        return Err(Error::protocol(format!(
            "segment claims {count} packets in {} bytes",
            buf.remaining()
        )));
    }
    let mut packets = Vec::with_capacity(count);
    for _ in 0..count {
        packets.push(get_packet(&mut buf)?);
    }
    if buf.has_remaining() {
        return Err(Error::protocol(format!(
            "{} trailing bytes after segment",
            buf.remaining()
        )));
    }
    Ok(Segment::from_parts(
        job_id, pts, dts, time_base, parameters, packets,
    ))
}

fn put_timestamp(buf: &mut BytesMut, ts: Option<i64>) {
    buf.put_i64(ts.unwrap_or(NO_TIMESTAMP));
}

fn put_rational(buf: &mut BytesMut, r: Rational) {
    buf.put_i32(r.num);
    buf.put_i32(r.den);
}

fn put_bytes(buf: &mut BytesMut, bytes: &[u8]) {
    buf.put_u32(bytes.len() as u32);
    buf.put_slice(bytes);
}

fn put_parameters(buf: &mut BytesMut, p: &CodecParameters) {
    buf.put_i32(p.media_kind.tag());
    buf.put_u32(p.codec_id);
    buf.put_u32(p.codec_tag);
    put_bytes(buf, &p.extradata);
    buf.put_i32(p.format);
    buf.put_i64(p.bit_rate);
    buf.put_i32(p.bits_per_coded_sample);
    buf.put_i32(p.bits_per_raw_sample);
    buf.put_i32(p.profile);
    buf.put_i32(p.level);
    buf.put_i32(p.width);
    buf.put_i32(p.height);
    put_rational(buf, p.sample_aspect_ratio);
    buf.put_i32(p.field_order);
    buf.put_i32(p.color_range);
    buf.put_i32(p.color_primaries);
    buf.put_i32(p.color_trc);
    buf.put_i32(p.color_space);
    buf.put_i32(p.chroma_location);
    buf.put_i32(p.video_delay);
    buf.put_u64(p.channel_layout);
    buf.put_i32(p.channels);
    buf.put_i32(p.sample_rate);
    buf.put_i32(p.block_align);
    buf.put_i32(p.frame_size);
    buf.put_i32(p.initial_padding);
    buf.put_i32(p.trailing_padding);
    buf.put_i32(p.seek_preroll);
}

fn put_packet(buf: &mut BytesMut, packet: &Packet) {
    put_timestamp(buf, packet.pts());
    put_timestamp(buf, packet.dts());
    put_bytes(buf, packet.data());
    buf.put_u32(packet.stream_index() as u32);
    buf.put_u32(packet.flags().bits());
    buf.put_u32(packet.side_data().len() as u32);
    for side in packet.side_data() {
        buf.put_i32(side.kind);
        put_bytes(buf, &side.data);
    }
    buf.put_i64(packet.duration());
    buf.put_i64(packet.position());
}

/// Bounds-checked reads; `Buf` getters panic on short input.
struct Checked;

impl Checked {
    fn need(buf: &Bytes, len: usize) -> Result<()> {
        if buf.remaining() < len {
            return Err(Error::protocol(format!(
                "truncated segment: need {len} bytes, have {}",
                buf.remaining()
            )));
        }
        Ok(())
    }

    fn u8(buf: &mut Bytes) -> Result<u8> {
        Self::need(buf, 1)?;
        Ok(buf.get_u8())
    }

    fn u32(buf: &mut Bytes) -> Result<u32> {
        Self::need(buf, 4)?;
        Ok(buf.get_u32())
    }

    fn i32(buf: &mut Bytes) -> Result<i32> {
        Self::need(buf, 4)?;
        Ok(buf.get_i32())
    }

    fn u64(buf: &mut Bytes) -> Result<u64> {
        Self::need(buf, 8)?;
        Ok(buf.get_u64())
    }

    fn i64(buf: &mut Bytes) -> Result<i64> {
        Self::need(buf, 8)?;
        Ok(buf.get_i64())
    }

    fn bytes(buf: &mut Bytes) -> Result<Bytes> {
        let len = Self::u32(buf)? as usize;
        Self::need(buf, len)?;
        Ok(buf.split_to(len))
    }
}

fn get_uuid<B: Buf>(buf: &mut B) -> Result<Uuid> {
    if buf.remaining() < 16 {
        return Err(Error::protocol("truncated job id"));
    }
    let mut id = [0u8; 16];
    buf.copy_to_slice(&mut id);
    Ok(Uuid::from_bytes(id))
}

fn get_timestamp(buf: &mut Bytes) -> Result<Option<i64>> {
    let ts = Checked::i64(buf)?;
    Ok((ts != NO_TIMESTAMP).then_some(ts))
}

fn get_rational(buf: &mut Bytes) -> Result<Rational> {
    Ok(Rational::new(Checked::i32(buf)?, Checked::i32(buf)?))
}

fn get_parameters(buf: &mut Bytes) -> Result<CodecParameters> {
    Ok(CodecParameters {
        media_kind: MediaKind::from_tag(Checked::i32(buf)?),
        codec_id: Checked::u32(buf)?,
        codec_tag: Checked::u32(buf)?,
        extradata: Checked::bytes(buf)?,
        format: Checked::i32(buf)?,
        bit_rate: Checked::i64(buf)?,
        bits_per_coded_sample: Checked::i32(buf)?,
        bits_per_raw_sample: Checked::i32(buf)?,
        profile: Checked::i32(buf)?,
        level: Checked::i32(buf)?,
        width: Checked::i32(buf)?,
        height: Checked::i32(buf)?,
        sample_aspect_ratio: get_rational(buf)?,
        field_order: Checked::i32(buf)?,
        color_range: Checked::i32(buf)?,
        color_primaries: Checked::i32(buf)?,
        color_trc: Checked::i32(buf)?,
        color_space: Checked::i32(buf)?,
        chroma_location: Checked::i32(buf)?,
        video_delay: Checked::i32(buf)?,
        channel_layout: Checked::u64(buf)?,
        channels: Checked::i32(buf)?,
        sample_rate: Checked::i32(buf)?,
        block_align: Checked::i32(buf)?,
        frame_size: Checked::i32(buf)?,
        initial_padding: Checked::i32(buf)?,
        trailing_padding: Checked::i32(buf)?,
        seek_preroll: Checked::i32(buf)?,
    })
}

fn get_packet(buf: &mut Bytes) -> Result<Packet> {
    let mut packet = Packet::empty();
    packet.set_pts(get_timestamp(buf)?);
    packet.set_dts(get_timestamp(buf)?);
    packet.set_data(&Checked::bytes(buf)?);
    packet.set_stream_index(Checked::u32(buf)? as usize);
    packet.set_flags(PacketFlags::from_bits(Checked::u32(buf)?));
    let side_count = Checked::u32(buf)?;
    for _ in 0..side_count {
        let kind = Checked::i32(buf)?;
        packet.add_side_data(kind, Checked::bytes(buf)?);
    }
    packet.set_duration(Checked::i64(buf)?);
    packet.set_position(Checked::i64(buf)?);
    Ok(packet)
}

#[cfg(test)]
#[path = "wire_test.rs"]
mod wire_test;
