//! Conversions between the pipeline's plain types and libav structs.

use anyhow::{anyhow, bail};
use bytes::Bytes;
use ffmpeg_next::codec::Parameters;
use ffmpeg_next::ffi;

use crate::codec::{CodecParameters, MediaKind, Rational};
use crate::packet::{Packet, PacketFlags};

pub(crate) fn rational_from(r: ffmpeg_next::Rational) -> Rational {
    Rational::new(r.numerator(), r.denominator())
}

pub(crate) fn rational_into(r: Rational) -> ffmpeg_next::Rational {
    ffmpeg_next::Rational::new(r.num, r.den)
}

pub(crate) fn media_kind(medium: ffmpeg_next::media::Type) -> MediaKind {
    match medium {
        ffmpeg_next::media::Type::Video => MediaKind::Video,
        ffmpeg_next::media::Type::Audio => MediaKind::Audio,
        ffmpeg_next::media::Type::Data => MediaKind::Data,
        ffmpeg_next::media::Type::Subtitle => MediaKind::Subtitle,
        _ => MediaKind::Unknown,
    }
}

fn media_type(kind: MediaKind) -> ffmpeg_next::media::Type {
    match kind {
        MediaKind::Video => ffmpeg_next::media::Type::Video,
        MediaKind::Audio => ffmpeg_next::media::Type::Audio,
        MediaKind::Data => ffmpeg_next::media::Type::Data,
        MediaKind::Subtitle => ffmpeg_next::media::Type::Subtitle,
        MediaKind::Unknown => ffmpeg_next::media::Type::Unknown,
    }
}

/// Looks `id` up in libav's codec descriptor table.
fn codec_id(id: u32) -> Option<ffi::AVCodecID> {
    let mut descriptor: *const ffi::AVCodecDescriptor = std::ptr::null();
    loop {
        descriptor = unsafe { ffi::avcodec_descriptor_next(descriptor) };
        if descriptor.is_null() {
            return None;
        }
        let found = unsafe { (*descriptor).id };
        if found as u32 == id {
            return Some(found);
        }
    }
}

/// Snapshot of an `AVCodecParameters`.
pub(crate) fn from_av(parameters: &Parameters) -> CodecParameters {
    unsafe {
        let p = parameters.as_ptr() as *const ffi::AVCodecParameters;
        let extradata = if (*p).extradata.is_null() || (*p).extradata_size <= 0 {
            Bytes::new()
        } else {
            Bytes::copy_from_slice(std::slice::from_raw_parts(
                (*p).extradata,
                (*p).extradata_size as usize,
            ))
        };
        let layout = &(*p).ch_layout;
        let channel_layout = if layout.order == ffi::AVChannelOrder::AV_CHANNEL_ORDER_NATIVE {
            layout.u.mask
        } else {
            0
        };
        CodecParameters {
            media_kind: media_kind(parameters.medium()),
            codec_id: (*p).codec_id as u32,
            codec_tag: (*p).codec_tag,
            extradata,
            format: (*p).format,
            bit_rate: (*p).bit_rate,
            bits_per_coded_sample: (*p).bits_per_coded_sample,
            bits_per_raw_sample: (*p).bits_per_raw_sample,
            profile: (*p).profile,
            level: (*p).level,
            width: (*p).width,
            height: (*p).height,
            sample_aspect_ratio: Rational::new(
                (*p).sample_aspect_ratio.num,
                (*p).sample_aspect_ratio.den,
            ),
            field_order: (*p).field_order as i32,
            color_range: (*p).color_range as i32,
            color_primaries: (*p).color_primaries as i32,
            color_trc: (*p).color_trc as i32,
            color_space: (*p).color_space as i32,
            chroma_location: (*p).chroma_location as i32,
            video_delay: (*p).video_delay,
            channel_layout,
            channels: layout.nb_channels,
            sample_rate: (*p).sample_rate,
            block_align: (*p).block_align,
            frame_size: (*p).frame_size,
            initial_padding: (*p).initial_padding,
            trailing_padding: (*p).trailing_padding,
            seek_preroll: (*p).seek_preroll,
        }
    }
}

/// Rebuilds an `AVCodecParameters`. Fails when libav does not know the codec
/// id.
///
/// Color and field-order metadata are left unspecified: they are enum-typed on
/// the libav side and decoders recover them from the bitstream.
pub(crate) fn to_av(parameters: &CodecParameters) -> anyhow::Result<Parameters> {
    let id = codec_id(parameters.codec_id)
        .ok_or_else(|| anyhow!("unknown codec id {}", parameters.codec_id))?;
    let mut out = Parameters::new();
    unsafe {
        let p = out.as_mut_ptr();
        (*p).codec_type = media_type(parameters.media_kind).into();
        (*p).codec_id = id;
        (*p).codec_tag = parameters.codec_tag;
        (*p).format = parameters.format;
        (*p).bit_rate = parameters.bit_rate;
        (*p).bits_per_coded_sample = parameters.bits_per_coded_sample;
        (*p).bits_per_raw_sample = parameters.bits_per_raw_sample;
        (*p).profile = parameters.profile;
        (*p).level = parameters.level;
        (*p).width = parameters.width;
        (*p).height = parameters.height;
        (*p).sample_aspect_ratio = ffi::AVRational {
            num: parameters.sample_aspect_ratio.num,
            den: parameters.sample_aspect_ratio.den,
        };
        (*p).video_delay = parameters.video_delay;
        (*p).sample_rate = parameters.sample_rate;
        (*p).block_align = parameters.block_align;
        (*p).frame_size = parameters.frame_size;
        (*p).initial_padding = parameters.initial_padding;
        (*p).trailing_padding = parameters.trailing_padding;
        (*p).seek_preroll = parameters.seek_preroll;

        if !parameters.extradata.is_empty() {
            let size = parameters.extradata.len();
            let buf = ffi::av_mallocz(size + ffi::AV_INPUT_BUFFER_PADDING_SIZE as usize) as *mut u8;
            if buf.is_null() {
                bail!("cannot allocate {size} bytes of extradata");
            }
            std::ptr::copy_nonoverlapping(parameters.extradata.as_ptr(), buf, size);
            (*p).extradata = buf;
            (*p).extradata_size = size as i32;
        }

        if parameters.channels > 0 {
            let from_mask = parameters.channel_layout != 0
                && ffi::av_channel_layout_from_mask(&mut (*p).ch_layout, parameters.channel_layout)
                    >= 0
                && (*p).ch_layout.nb_channels == parameters.channels;
            if !from_mask {
                ffi::av_channel_layout_uninit(&mut (*p).ch_layout);
                ffi::av_channel_layout_default(&mut (*p).ch_layout, parameters.channels);
            }
        }
    }
    Ok(out)
}

pub(crate) fn packet_into_av(packet: &Packet) -> ffmpeg_next::Packet {
    let mut out = ffmpeg_next::Packet::copy(packet.data());
    out.set_pts(packet.pts());
    out.set_dts(packet.dts());
    out.set_duration(packet.duration());
    out.set_position(packet.position() as isize);
    out.set_stream(packet.stream_index());
    out.set_flags(ffmpeg_next::packet::Flags::from_bits_truncate(
        packet.flags().bits() as i32,
    ));
    for side in packet.side_data() {
        if side.kind < 0 || side.kind >= ffi::AVPacketSideDataType::AV_PKT_DATA_NB as i32 {
            log::trace!("skipping side data of unknown type {}", side.kind);
            continue;
        }
        unsafe {
            let kind: ffi::AVPacketSideDataType = std::mem::transmute(side.kind);
            let dst = ffi::av_packet_new_side_data(out.as_mut_ptr(), kind, side.data.len());
            if dst.is_null() {
                log::warn!("cannot allocate side data of type {}", side.kind);
                continue;
            }
            std::ptr::copy_nonoverlapping(side.data.as_ptr(), dst, side.data.len());
        }
    }
    out
}

/// Overwrites `dst` with the contents of a libav packet.
pub(crate) fn packet_from_av(src: &ffmpeg_next::Packet, dst: &mut Packet) {
    dst.clear();
    dst.set_data(src.data().unwrap_or(&[]));
    dst.set_pts(src.pts());
    dst.set_dts(src.dts());
    dst.set_duration(src.duration());
    dst.set_position(src.position() as i64);
    dst.set_stream_index(src.stream());
    dst.set_flags(PacketFlags::from_bits(src.flags().bits() as u32));
    for side in src.side_data() {
        let kind: ffi::AVPacketSideDataType = side.kind().into();
        dst.add_side_data(kind as i32, Bytes::copy_from_slice(side.data()));
    }
}
