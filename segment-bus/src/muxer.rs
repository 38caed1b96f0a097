//! Terminal stage interleaving several packet streams into one container.
//!
//! Packets from every input land in one reorder window sorted by decode time.
//! The window holds at most `buffer_max` packets; each packet beyond that
//! pushes the oldest one out to the container. `flush` and `close` drain what
//! is left.

use std::collections::VecDeque;
use std::fmt::{Display, Formatter};
use std::sync::{Arc, Mutex};

use crate::backend::{CodecBackend, MuxOutput};
use crate::codec::Rational;
use crate::error::{Error, Result, lock};
use crate::packet::Packet;
use crate::source::{Sink, SinkHandle};
use crate::stream::{Stream, StreamDescriptor};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MuxerConfig {
    /// Reorder window size in packets. Zero writes every packet immediately.
    pub buffer_max: usize,
    /// Container short name (`matroska`, `mp4`, ...). `None` guesses from the url.
    pub format: Option<String>,
}

impl Default for MuxerConfig {
    fn default() -> Self {
        Self {
            buffer_max: 300,
            format: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MuxerState {
    /// Accepting inputs; nothing written yet.
    Ready,
    /// Header written.
    Open,
    /// Trailer written.
    Closed,
    /// Opening the output failed. Absorbing.
    Error,
}

impl Display for MuxerState {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            MuxerState::Ready => "ready",
            MuxerState::Open => "open",
            MuxerState::Closed => "closed",
            MuxerState::Error => "error",
        };
        f.write_str(name)
    }
}

struct Pending {
    /// Decode time in microseconds.
    key: i64,
    packet: Packet,
}

struct Core {
    url: String,
    state: MuxerState,
    output: Box<dyn MuxOutput>,
    buffer_max: usize,
    window: VecDeque<Pending>,
    last_key: i64,
    written: u64,
}

impl Core {
    fn add_input(&mut self, stream: &StreamDescriptor) -> Result<usize> {
        if self.state != MuxerState::Ready {
            return Err(Error::config(format!(
                "cannot add stream {} of {} to {}: muxer is {}",
                stream.index(),
                stream.origin(),
                self.url,
                self.state
            )));
        }
        let parameters = stream.parameters().ok_or_else(|| {
            Error::config(format!(
                "stream {} of {} has no codec parameters",
                stream.index(),
                stream.origin()
            ))
        })?;
        let index = self
            .output
            .add_stream(parameters, stream.time_base())
            .map_err(|e| Error::resource(format!("add stream to {}: {e}", self.url)))?;
        log::debug!(
            "{}: {} stream {} of {} mapped to output stream {index}",
            self.url,
            stream.media_kind(),
            stream.index(),
            stream.origin()
        );
        Ok(index)
    }

    fn start(&mut self) -> Result<()> {
        let opened = self
            .output
            .open()
            .and_then(|()| self.output.write_header());
        match opened {
            Ok(()) => {
                self.state = MuxerState::Open;
                log::info!("{}: header written", self.url);
                Ok(())
            }
            Err(e) => {
                self.state = MuxerState::Error;
                log::error!("{}: cannot open output: {e}", self.url);
                Err(Error::resource(format!("open {}: {e}", self.url)))
            }
        }
    }

    fn push(&mut self, packet: &Packet, index: usize, time_base: Rational) -> Result<()> {
        match self.state {
            MuxerState::Ready => self.start()?,
            MuxerState::Open => {}
            MuxerState::Closed | MuxerState::Error => return Err(Error::Closed),
        }

        let key = packet
            .dts()
            .or(packet.pts())
            .and_then(|ts| Rational::rescale(ts, time_base, Rational::MICROS))
            .unwrap_or(self.last_key);
        self.last_key = key;

        let mut packet = packet.copy();
        packet.set_stream_index(index);
        packet.set_position(-1);
        self.retime(&mut packet, time_base);

        // equal keys keep arrival order
        let at = self.window.partition_point(|p| p.key <= key);
        self.window.insert(at, Pending { key, packet });
        while self.window.len() > self.buffer_max {
            self.write_oldest();
        }
        Ok(())
    }

    /// Moves timestamps from the input time base to the one the container
    /// picked. Leaves the packet untouched when that is not possible.
    fn retime(&self, packet: &mut Packet, from: Rational) {
        let Some(to) = self.output.stream_time_base(packet.stream_index()) else {
            log::warn!(
                "{}: no time base for output stream {}, timestamps kept",
                self.url,
                packet.stream_index()
            );
            return;
        };
        if from == to {
            return;
        }
        let rescale = |ts: Option<i64>| match ts {
            Some(ts) => Rational::rescale(ts, from, to).map(Some),
            None => Some(None),
        };
        match (
            rescale(packet.pts()),
            rescale(packet.dts()),
            Rational::rescale(packet.duration(), from, to),
        ) {
            (Some(pts), Some(dts), Some(duration)) => {
                packet.set_pts(pts);
                packet.set_dts(dts);
                packet.set_duration(duration);
            }
            _ => log::warn!(
                "{}: cannot rescale packet on output stream {} from {from} to {to}, timestamps kept",
                self.url,
                packet.stream_index()
            ),
        }
    }

    fn write_oldest(&mut self) {
        let Some(pending) = self.window.pop_front() else {
            return;
        };
        match self.output.write(&pending.packet) {
            Ok(()) => self.written += 1,
            Err(e) => log::warn!(
                "{}: dropped packet on output stream {}: {e}",
                self.url,
                pending.packet.stream_index()
            ),
        }
    }

    fn flush(&mut self) {
        while !self.window.is_empty() {
            self.write_oldest();
        }
    }

    fn close(&mut self) -> Result<()> {
        match self.state {
            MuxerState::Open => {}
            MuxerState::Ready => {
                self.state = MuxerState::Closed;
                return Ok(());
            }
            MuxerState::Closed | MuxerState::Error => return Ok(()),
        }
        self.flush();
        self.state = MuxerState::Closed;
        self.output
            .write_trailer()
            .map_err(|e| Error::resource(format!("write trailer to {}: {e}", self.url)))?;
        log::info!("{}: trailer written after {} packets", self.url, self.written);
        Ok(())
    }
}

/// One upstream subscription of a muxer.
struct MuxInput {
    core: Arc<Mutex<Core>>,
    index: usize,
    time_base: Rational,
}

impl Sink<Packet> for MuxInput {
    fn process(&mut self, packet: &Packet, _stream: &Arc<StreamDescriptor>) -> Result<()> {
        lock(&self.core).push(packet, self.index, self.time_base)
    }

    fn on_subscribe(&mut self, stream: &Arc<StreamDescriptor>) -> Result<()> {
        self.index = lock(&self.core).add_input(stream)?;
        self.time_base = stream.time_base();
        Ok(())
    }
}

pub struct Muxer {
    url: String,
    core: Arc<Mutex<Core>>,
    inputs: Mutex<Vec<SinkHandle<MuxInput>>>,
}

impl Muxer {
    /// Creates the container for `url`. Nothing is written until the first
    /// packet arrives.
    pub fn new(
        backend: &dyn CodecBackend,
        url: impl Into<String>,
        config: MuxerConfig,
    ) -> Result<Self> {
        let url = url.into();
        let output = backend
            .open_output(&url, config.format.as_deref())
            .map_err(|e| Error::resource(format!("create output {url}: {e}")))?;
        Ok(Self::with_output(url, output, config))
    }

    pub fn with_output(
        url: impl Into<String>,
        output: Box<dyn MuxOutput>,
        config: MuxerConfig,
    ) -> Self {
        let url = url.into();
        Self {
            core: Arc::new(Mutex::new(Core {
                url: url.clone(),
                state: MuxerState::Ready,
                output,
                buffer_max: config.buffer_max,
                window: VecDeque::new(),
                last_key: i64::MIN,
                written: 0,
            })),
            url,
            inputs: Mutex::new(Vec::new()),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn state(&self) -> MuxerState {
        lock(&self.core).state
    }

    /// Adds `stream` as a new output stream. Only legal before the first
    /// packet has been written.
    pub fn subscribe(&self, stream: &Stream<Packet>) -> Result<()> {
        let input = SinkHandle::new(MuxInput {
            core: self.core.clone(),
            index: 0,
            time_base: Rational::default(),
        });
        input.subscribe(stream)?;
        lock(&self.inputs).push(input);
        Ok(())
    }

    /// Number of packets waiting in the reorder window.
    pub fn buffered(&self) -> usize {
        lock(&self.core).window.len()
    }

    /// Writes every buffered packet in order without closing the container.
    pub fn flush(&self) {
        lock(&self.core).flush();
    }

    /// Drains the window, writes the trailer and detaches from every input.
    /// Safe to call repeatedly.
    pub fn close(&self) -> Result<()> {
        let closed = lock(&self.core).close();
        lock(&self.inputs).clear();
        closed
    }
}

impl Drop for Muxer {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            log::warn!("{}: {e}", self.url);
        }
    }
}

#[cfg(test)]
#[path = "muxer_test.rs"]
mod muxer_test;
