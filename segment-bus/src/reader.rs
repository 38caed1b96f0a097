//! Media source reader.
//!
//! A [`Reader`] opens a source through the codec backend, exposes one
//! [`Stream`] per discovered logical stream and pumps packets into them from
//! a single background thread. Every sink callback runs on that thread, so a
//! slow sink throttles reading.

use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::JoinHandle;

use tokio_util::sync::CancellationToken;

use crate::backend::{CodecBackend, MediaSource, ReadOutcome};
use crate::error::{Error, Result, lock};
use crate::packet::Packet;
use crate::source::{Handlers, Subscription};
use crate::state::{self, Action, ReaderEvent, ReaderState, Trigger};
use crate::stream::{Stream, StreamDescriptor};

type EventCallback = dyn Fn(&ReaderEvent) + Send + Sync;

struct Machine {
    state: ReaderState,
    /// Bumped on every open so a pump left over from a previous run stops
    /// touching the machine.
    generation: u64,
    source: Option<Box<dyn MediaSource>>,
    streams: Vec<Arc<Stream<Packet>>>,
}

struct Inner {
    backend: Arc<dyn CodecBackend>,
    url: String,
    machine: Mutex<Machine>,
    wake: Condvar,
    events: Handlers<EventCallback>,
    token: CancellationToken,
}

pub struct Reader {
    inner: Arc<Inner>,
    pump: Mutex<Option<JoinHandle<()>>>,
}

impl Reader {
    pub fn new(backend: Arc<dyn CodecBackend>, url: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(Inner {
                backend,
                url: url.into(),
                machine: Mutex::new(Machine {
                    state: ReaderState::Ready,
                    generation: 0,
                    source: None,
                    streams: Vec::new(),
                }),
                wake: Condvar::new(),
                events: Handlers::new(),
                token: CancellationToken::new(),
            }),
            pump: Mutex::new(None),
        }
    }

    pub fn url(&self) -> &str {
        &self.inner.url
    }

    pub fn state(&self) -> ReaderState {
        lock(&self.inner.machine).state
    }

    /// Registers an observer for error, end of stream, reset and shutdown
    /// notifications.
    #[must_use = "dropping the subscription detaches the callback"]
    pub fn subscribe_events<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&ReaderEvent) + Send + Sync + 'static,
    {
        self.inner.events.add(Arc::new(callback))
    }

    /// Opens the source and probes its streams. Legal from `ready` and
    /// `done`. Failure is terminal for this reader.
    pub fn open(&self) -> Result<()> {
        self.inner.fire(None, Trigger::Open)?;
        match self.inner.probe() {
            Ok((source, streams)) => {
                {
                    let mut machine = lock(&self.inner.machine);
                    machine.generation += 1;
                    machine.source = Some(source);
                    machine.streams = streams;
                }
                self.inner.fire(None, Trigger::OpenSuccess).map(|_| ())
            }
            Err(e) => {
                self.inner.fire(None, Trigger::OpenError(e.to_string()))?;
                Err(e)
            }
        }
    }

    /// Starts the pump, or resumes it when paused.
    pub fn play(&self) -> Result<()> {
        if let Some(start) = self.inner.fire(None, Trigger::Play)? {
            self.spawn_pump(start)?;
        }
        Ok(())
    }

    /// The pump parks before its next read. Pausing twice is a no-op.
    pub fn pause(&self) -> Result<()> {
        self.inner.fire(None, Trigger::Pause).map(|_| ())
    }

    /// Closes the source and drops every stream. The reader can be opened
    /// again afterwards.
    pub fn reset(&self) -> Result<()> {
        self.inner.fire(None, Trigger::Reset).map(|_| ())
    }

    /// Blocks until the pump thread exits. Returns immediately when no pump
    /// is running or when called from the pump itself.
    pub fn join(&self) {
        let handle = lock(&self.pump).take();
        if let Some(handle) = handle {
            if handle.thread().id() == std::thread::current().id() {
                return;
            }
            if handle.join().is_err() {
                log::error!("reader pump for {} panicked", self.inner.url);
            }
        }
    }

    /// Stops the pump after the packet in flight and waits for it.
    pub fn close(&self) {
        if !self.inner.token.is_cancelled() {
            self.inner.token.cancel();
            {
                let _machine = lock(&self.inner.machine);
                self.inner.wake.notify_all();
            }
            self.inner.notify(&ReaderEvent::Shutdown);
        }
        self.join();
    }

    /// Every stream found by the last successful open.
    pub fn streams(&self) -> Vec<Arc<Stream<Packet>>> {
        lock(&self.inner.machine).streams.clone()
    }

    pub fn video_streams(&self) -> Vec<Arc<Stream<Packet>>> {
        self.streams_where(|d| d.is_video())
    }

    pub fn audio_streams(&self) -> Vec<Arc<Stream<Packet>>> {
        self.streams_where(|d| d.is_audio())
    }

    fn streams_where(&self, f: impl Fn(&StreamDescriptor) -> bool) -> Vec<Arc<Stream<Packet>>> {
        lock(&self.inner.machine)
            .streams
            .iter()
            .filter(|s| f(s.descriptor()))
            .cloned()
            .collect()
    }

    fn spawn_pump(&self, start: PumpStart) -> Result<()> {
        // a pump from a previous run has already been told to stop
        self.join();
        let inner = self.inner.clone();
        let handle = std::thread::Builder::new()
            .name("reader-pump".to_string())
            .spawn(move || inner.pump(start))
            .map_err(|e| Error::resource(format!("spawn reader pump: {e}")))?;
        *lock(&self.pump) = Some(handle);
        Ok(())
    }
}

impl Drop for Reader {
    fn drop(&mut self) {
        self.close();
    }
}

/// What a freshly started pump takes ownership of.
struct PumpStart {
    generation: u64,
    source: Box<dyn MediaSource>,
    streams: Vec<Arc<Stream<Packet>>>,
}

impl Inner {
    /// Applies one event. `generation` restricts pump-originated events to
    /// the run that produced them.
    fn fire(&self, generation: Option<u64>, trigger: Trigger) -> Result<Option<PumpStart>> {
        let mut machine = lock(&self.machine);
        if generation.is_some_and(|g| g != machine.generation) {
            return Ok(None);
        }
        let from = machine.state;
        let Some((to, action)) = state::next(from, &trigger) else {
            return Err(Error::config(format!(
                "reader for {}: {trigger:?} is not accepted while {from}",
                self.url
            )));
        };
        machine.state = to;
        log::debug!("reader {}: {from} --{trigger:?}--> {to}", self.url);

        match action {
            Action::None => Ok(None),
            Action::Start => {
                let source = machine
                    .source
                    .take()
                    .ok_or_else(|| Error::resource(format!("{} is not open", self.url)))?;
                Ok(Some(PumpStart {
                    generation: machine.generation,
                    source,
                    streams: machine.streams.clone(),
                }))
            }
            Action::Resume => {
                self.wake.notify_all();
                Ok(None)
            }
            Action::Teardown(event) => {
                machine.source = None;
                machine.streams.clear();
                self.wake.notify_all();
                drop(machine);
                self.notify(&event);
                Ok(None)
            }
            Action::Halt(msg) => {
                machine.source = None;
                machine.streams.clear();
                drop(machine);
                log::error!("failed to open {}: {msg}", self.url);
                self.notify(&ReaderEvent::Error(msg));
                Ok(None)
            }
        }
    }

    fn notify(&self, event: &ReaderEvent) {
        for callback in self.events.snapshot() {
            callback(event);
        }
    }

    fn probe(&self) -> Result<(Box<dyn MediaSource>, Vec<Arc<Stream<Packet>>>)> {
        let source = self
            .backend
            .open_source(&self.url)
            .map_err(|e| Error::resource(format!("open {}: {e}", self.url)))?;
        let mut streams = Vec::new();
        let mut decodable = 0;
        for info in source.streams() {
            let mut descriptor = StreamDescriptor::from_info(&info, self.url.clone());
            match self.backend.open_decoder(&info.parameters, info.time_base) {
                Ok(decoder) => {
                    descriptor = descriptor.with_decoder(decoder);
                    decodable += 1;
                }
                Err(e) => log::warn!(
                    "{} stream {} of {}: no decoder, stream is skipped: {e}",
                    info.parameters.media_kind,
                    info.index,
                    self.url
                ),
            }
            log::info!(
                "{} stream {}: codec id {}, time base {}",
                info.parameters.media_kind,
                info.index,
                info.parameters.codec_id,
                info.time_base
            );
            streams.push(Arc::new(Stream::new(Arc::new(descriptor))));
        }
        if decodable == 0 {
            return Err(Error::resource(format!(
                "{} has no stream that can be decoded",
                self.url
            )));
        }
        Ok((source, streams))
    }

    /// Blocks while paused. Returns false once this run is over.
    fn wait_playing(&self, generation: u64) -> bool {
        let mut machine: MutexGuard<'_, Machine> = lock(&self.machine);
        loop {
            if self.token.is_cancelled() || machine.generation != generation {
                return false;
            }
            match machine.state {
                ReaderState::Playing => return true,
                ReaderState::Paused => {
                    machine = self
                        .wake
                        .wait(machine)
                        .unwrap_or_else(std::sync::PoisonError::into_inner);
                }
                _ => return false,
            }
        }
    }

    fn pump(&self, start: PumpStart) {
        let PumpStart {
            generation,
            mut source,
            streams,
        } = start;
        let mut packet = Packet::empty();
        log::debug!("reader pump for {} started", self.url);
        while self.wait_playing(generation) {
            let trigger = match source.read(&mut packet) {
                Ok(ReadOutcome::Packet) => {
                    let Some(stream) = streams
                        .iter()
                        .find(|s| s.index() == packet.stream_index())
                    else {
                        continue;
                    };
                    if !stream.descriptor().has_decoder() {
                        continue;
                    }
                    match stream.forward(&packet) {
                        Ok(()) => continue,
                        Err(e) => {
                            log::error!(
                                "sink failed on stream {} of {}: {e}",
                                stream.index(),
                                self.url
                            );
                            Trigger::ReadError(e.to_string())
                        }
                    }
                }
                Ok(ReadOutcome::Eof) => {
                    log::info!("end of {}", self.url);
                    Trigger::Eof
                }
                Err(e) => {
                    log::error!("read from {} failed: {e}", self.url);
                    Trigger::ReadError(e.to_string())
                }
            };
            if let Err(e) = self.fire(Some(generation), trigger) {
                log::debug!("{e}");
            }
            break;
        }
        log::debug!("reader pump for {} stopped", self.url);
    }
}

#[cfg(test)]
#[path = "reader_test.rs"]
mod reader_test;
