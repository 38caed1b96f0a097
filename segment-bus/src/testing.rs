//! In-memory backend used by the unit tests.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, bail};
use bytes::BytesMut;

use crate::backend::{
    CodecBackend, DecodeContext, EncodeContext, EncoderSettings, FrameEmitter, MediaSource,
    MuxOutput, PacketEmitter, ReadOutcome, StreamInfo,
};
use crate::codec::{CodecParameters, MediaKind, Rational};
use crate::frame::{Frame, Planes};
use crate::packet::Packet;
use crate::stream::StreamDescriptor;

pub const H264: u32 = 27;
pub const AAC: u32 = 86018;
pub const UNKNOWN_CODEC: u32 = 0x7fff_0000;

pub const VIDEO_TB: Rational = Rational::new(1, 90_000);
pub const AUDIO_TB: Rational = Rational::new(1, 48_000);

pub fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn video_info(index: usize) -> StreamInfo {
    StreamInfo {
        index,
        parameters: CodecParameters::video(H264, 320, 240),
        time_base: VIDEO_TB,
        frame_rate: Rational::new(25, 1),
    }
}

pub fn audio_info(index: usize) -> StreamInfo {
    StreamInfo {
        index,
        parameters: CodecParameters::audio(AAC, 48_000, 2),
        time_base: AUDIO_TB,
        frame_rate: Rational::default(),
    }
}

pub fn video_descriptor() -> Arc<StreamDescriptor> {
    Arc::new(StreamDescriptor::from_info(&video_info(0), "test.mp4"))
}

pub fn audio_descriptor() -> Arc<StreamDescriptor> {
    Arc::new(StreamDescriptor::from_info(&audio_info(1), "test.mp4"))
}

pub fn packet(stream_index: usize, dts: i64, key: bool) -> Packet {
    let mut packet = Packet::with_data(format!("{stream_index}:{dts}").as_bytes());
    packet.set_stream_index(stream_index);
    packet.set_pts(Some(dts));
    packet.set_dts(Some(dts));
    packet.set_duration(1);
    packet.set_key(key);
    packet
}

/// Video packets 3600 ticks apart with a key frame every `gop` packets.
pub fn video_packets(stream_index: usize, count: usize, gop: usize) -> Vec<Packet> {
    (0..count)
        .map(|i| packet(stream_index, i as i64 * 3600, i % gop == 0))
        .collect()
}

pub fn audio_packets(stream_index: usize, count: usize) -> Vec<Packet> {
    (0..count)
        .map(|i| packet(stream_index, i as i64 * 1024, true))
        .collect()
}

pub enum Step {
    Packet(Packet),
    Fail(String),
}

/// Replays a fixed list of packets, then reports end of input.
pub struct ScriptedSource {
    url: String,
    streams: Vec<StreamInfo>,
    script: VecDeque<Step>,
    delay: Duration,
}

impl MediaSource for ScriptedSource {
    fn url(&self) -> &str {
        &self.url
    }

    fn streams(&self) -> Vec<StreamInfo> {
        self.streams.clone()
    }

    fn read(&mut self, packet: &mut Packet) -> anyhow::Result<ReadOutcome> {
        if !self.delay.is_zero() {
            std::thread::sleep(self.delay);
        }
        match self.script.pop_front() {
            Some(Step::Packet(next)) => {
                packet.clear();
                packet.set_data(next.data());
                packet.set_pts(next.pts());
                packet.set_dts(next.dts());
                packet.set_duration(next.duration());
                packet.set_stream_index(next.stream_index());
                packet.set_flags(next.flags());
                Ok(ReadOutcome::Packet)
            }
            Some(Step::Fail(msg)) => bail!(msg),
            None => Ok(ReadOutcome::Eof),
        }
    }
}

/// Emits one frame per packet carrying the packet payload.
struct PassThroughDecoder {
    kind: MediaKind,
    frame: Frame,
}

impl DecodeContext for PassThroughDecoder {
    fn decode(&mut self, packet: &Packet, emit: FrameEmitter<'_>) -> anyhow::Result<()> {
        self.frame.kind = self.kind;
        self.frame.pts = packet.pts();
        self.frame.key = packet.is_key();
        self.frame.stream_index = packet.stream_index();
        let planes = self
            .frame
            .downcast_mut::<Planes>()
            .ok_or_else(|| anyhow!("unexpected frame storage"))?;
        planes.planes.clear();
        planes.planes.push(BytesMut::from(packet.data()));
        emit(&self.frame)
    }

    fn flush(&mut self, _emit: FrameEmitter<'_>) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Emits one packet per frame carrying the first plane.
struct PassThroughEncoder {
    parameters: CodecParameters,
    time_base: Rational,
    packet: Packet,
    flushed: Arc<Mutex<bool>>,
}

impl EncodeContext for PassThroughEncoder {
    fn parameters(&self) -> CodecParameters {
        self.parameters.clone()
    }

    fn time_base(&self) -> Rational {
        self.time_base
    }

    fn encode(&mut self, frame: &Frame, emit: PacketEmitter<'_>) -> anyhow::Result<()> {
        let planes = frame
            .downcast_ref::<Planes>()
            .ok_or_else(|| anyhow!("unexpected frame storage"))?;
        self.packet.clear();
        if let Some(plane) = planes.planes.first() {
            self.packet.set_data(plane);
        }
        self.packet.set_pts(frame.pts);
        self.packet.set_dts(frame.pts);
        self.packet.set_key(frame.key);
        emit(&self.packet)
    }

    fn flush(&mut self, _emit: PacketEmitter<'_>) -> anyhow::Result<()> {
        *self.flushed.lock().unwrap() = true;
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct MuxRecord {
    pub url: String,
    pub opened: bool,
    pub streams: Vec<(CodecParameters, Rational)>,
    pub header_written: bool,
    /// (output stream index, dts, pts) per written packet.
    pub written: Vec<(usize, Option<i64>, Option<i64>)>,
    pub trailer_written: bool,
    pub fail_open: bool,
    pub fail_writes: bool,
}

pub struct RecordingOutput {
    record: Arc<Mutex<MuxRecord>>,
    /// Time base the container assigns to every stream, if it overrides.
    container_time_base: Option<Rational>,
}

impl RecordingOutput {
    pub fn new() -> (Self, Arc<Mutex<MuxRecord>>) {
        let record = Arc::new(Mutex::new(MuxRecord::default()));
        (
            Self {
                record: record.clone(),
                container_time_base: None,
            },
            record,
        )
    }

    pub fn with_container_time_base(mut self, time_base: Rational) -> Self {
        self.container_time_base = Some(time_base);
        self
    }
}

impl MuxOutput for RecordingOutput {
    fn open(&mut self) -> anyhow::Result<()> {
        let mut record = self.record.lock().unwrap();
        if record.fail_open {
            bail!("permission denied");
        }
        record.opened = true;
        Ok(())
    }

    fn add_stream(
        &mut self,
        parameters: &CodecParameters,
        time_base: Rational,
    ) -> anyhow::Result<usize> {
        let mut record = self.record.lock().unwrap();
        if record.header_written {
            bail!("header already written");
        }
        record.streams.push((parameters.clone(), time_base));
        Ok(record.streams.len() - 1)
    }

    fn write_header(&mut self) -> anyhow::Result<()> {
        self.record.lock().unwrap().header_written = true;
        Ok(())
    }

    fn stream_time_base(&self, index: usize) -> Option<Rational> {
        let record = self.record.lock().unwrap();
        let (_, time_base) = record.streams.get(index)?;
        Some(self.container_time_base.unwrap_or(*time_base))
    }

    fn write(&mut self, packet: &Packet) -> anyhow::Result<()> {
        let mut record = self.record.lock().unwrap();
        if record.fail_writes {
            bail!("disk full");
        }
        record
            .written
            .push((packet.stream_index(), packet.dts(), packet.pts()));
        Ok(())
    }

    fn write_trailer(&mut self) -> anyhow::Result<()> {
        self.record.lock().unwrap().trailer_written = true;
        Ok(())
    }
}

/// Scripted backend: known codecs decode by pass-through, sources come from
/// registered scripts, outputs record what was written.
#[derive(Default)]
pub struct TestBackend {
    scripts: Mutex<HashMap<String, (Vec<StreamInfo>, Vec<Step>, Duration)>>,
    outputs: Mutex<HashMap<String, Arc<Mutex<MuxRecord>>>>,
    pub decoders_opened: Mutex<usize>,
    pub encoder_flushed: Arc<Mutex<bool>>,
}

impl TestBackend {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn add_source(&self, url: &str, streams: Vec<StreamInfo>, steps: Vec<Step>) {
        self.add_slow_source(url, streams, steps, Duration::ZERO);
    }

    pub fn add_slow_source(
        &self,
        url: &str,
        streams: Vec<StreamInfo>,
        steps: Vec<Step>,
        delay: Duration,
    ) {
        self.scripts
            .lock()
            .unwrap()
            .insert(url.to_string(), (streams, steps, delay));
    }

    pub fn output(&self, url: &str) -> Option<Arc<Mutex<MuxRecord>>> {
        self.outputs.lock().unwrap().get(url).cloned()
    }
}

impl CodecBackend for TestBackend {
    fn open_source(&self, url: &str) -> anyhow::Result<Box<dyn MediaSource>> {
        let (streams, steps, delay) = self
            .scripts
            .lock()
            .unwrap()
            .remove(url)
            .ok_or_else(|| anyhow!("No such file or directory: {url}"))?;
        Ok(Box::new(ScriptedSource {
            url: url.to_string(),
            streams,
            script: steps.into(),
            delay,
        }))
    }

    fn open_decoder(
        &self,
        parameters: &CodecParameters,
        _time_base: Rational,
    ) -> anyhow::Result<Box<dyn DecodeContext>> {
        if parameters.codec_id != H264 && parameters.codec_id != AAC {
            bail!("decoder not found for codec id {}", parameters.codec_id);
        }
        *self.decoders_opened.lock().unwrap() += 1;
        Ok(Box::new(PassThroughDecoder {
            kind: parameters.media_kind,
            frame: Frame::empty(),
        }))
    }

    fn open_encoder(
        &self,
        settings: &EncoderSettings,
        input: &CodecParameters,
        time_base: Rational,
    ) -> anyhow::Result<Box<dyn EncodeContext>> {
        let mut parameters = input.clone();
        if let Some(width) = settings.width {
            parameters.width = width as i32;
        }
        if let Some(height) = settings.height {
            parameters.height = height as i32;
        }
        Ok(Box::new(PassThroughEncoder {
            parameters,
            time_base,
            packet: Packet::empty(),
            flushed: self.encoder_flushed.clone(),
        }))
    }

    fn open_output(&self, url: &str, _format: Option<&str>) -> anyhow::Result<Box<dyn MuxOutput>> {
        let (output, record) = RecordingOutput::new();
        record.lock().unwrap().url = url.to_string();
        self.outputs
            .lock()
            .unwrap()
            .insert(url.to_string(), record);
        Ok(Box::new(output))
    }
}

/// Polls `cond` until it holds or `timeout` elapses.
pub fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = std::time::Instant::now() + timeout;
    while std::time::Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    cond()
}
