use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use bytes::Bytes;

use crate::backend::CodecBackend;
use crate::cache::{StreamCache, StreamCacheConfig};
use crate::error::{Error, Result, lock};
use crate::packet::Packet;
use crate::segment::{JobId, Segment};
use crate::source::Subscription;
use crate::stream::Stream;
use crate::task::{TaskGroup, wait_cancelled};
use crate::transport::Subscriber;
use crate::wire::{Envelope, decode_segment};

#[derive(Debug, Clone, PartialEq)]
pub struct UnpackerConfig {
    /// Size of the worker pool. Only a single worker keeps segments of one
    /// job in arrival order.
    pub workers: usize,
    /// How long an idle worker sleeps before polling the queue again.
    pub idle_sleep: Duration,
}

impl Default for UnpackerConfig {
    fn default() -> Self {
        Self {
            workers: 1,
            idle_sleep: Duration::from_millis(200),
        }
    }
}

enum Work {
    Payload { payload: Bytes, job_id: Option<JobId> },
    Segment(Segment),
}

type StreamHook = dyn Fn(&Arc<Stream<Packet>>) -> Result<()> + Send + Sync;

struct Shared {
    queue: Mutex<VecDeque<Work>>,
    accepting: AtomicBool,
    cache: Mutex<Option<Arc<StreamCache>>>,
    on_new_stream: Mutex<Option<Arc<StreamHook>>>,
}

impl Shared {
    fn push(&self, work: Work) -> Result<()> {
        let mut queue = lock(&self.queue);
        if !self.accepting.load(Ordering::Acquire) {
            return Err(Error::Closed);
        }
        queue.push_back(work);
        Ok(())
    }

    fn process(&self, work: Work) -> Result<()> {
        let segment = match work {
            Work::Payload { payload, job_id } => {
                let mut segment = decode_segment(payload)?;
                if let Some(job_id) = job_id {
                    segment.set_job_id(job_id);
                }
                segment
            }
            Work::Segment(segment) => segment,
        };
        let cache = lock(&self.cache).clone().ok_or(Error::Closed)?;
        let hook = lock(&self.on_new_stream).clone();
        let (stream, _) = cache.entry(&segment, |stream| {
            log::info!(
                "new {} stream for job {}",
                stream.descriptor().media_kind(),
                segment.job_id()
            );
            match &hook {
                Some(hook) => hook(stream),
                None => Ok(()),
            }
        })?;
        for packet in segment.packets() {
            stream.forward(packet)?;
        }
        log::trace!(
            "unpacked {} packets for job {}",
            segment.len(),
            segment.job_id()
        );
        Ok(())
    }
}

/// Worker pool turning inbound segments back into packet delivery on their
/// job's stream.
///
/// Packets of one segment are always forwarded in stored order. Segments are
/// only forwarded in arrival order with a single worker.
pub struct SegmentUnpacker {
    shared: Arc<Shared>,
    workers: Mutex<TaskGroup>,
    subscription: Mutex<Option<Subscription>>,
}

impl SegmentUnpacker {
    pub fn new(cache: Arc<StreamCache>, config: UnpackerConfig) -> Result<Self> {
        let shared = Arc::new(Shared {
            queue: Mutex::new(VecDeque::new()),
            accepting: AtomicBool::new(true),
            cache: Mutex::new(Some(cache)),
            on_new_stream: Mutex::new(None),
        });
        let mut workers = TaskGroup::new("unpacker");
        for _ in 0..config.workers.max(1) {
            let shared = shared.clone();
            let idle_sleep = config.idle_sleep;
            workers.spawn(move |token| work(&shared, &token, idle_sleep))?;
        }
        Ok(Self {
            shared,
            workers: Mutex::new(workers),
            subscription: Mutex::new(None),
        })
    }

    /// Pool with a cache of its own.
    pub fn with_backend(
        backend: Arc<dyn CodecBackend>,
        cache_config: StreamCacheConfig,
        config: UnpackerConfig,
    ) -> Result<Self> {
        Self::new(Arc::new(StreamCache::new(backend, cache_config)?), config)
    }

    /// Hook run when a job's stream is first created, before any of its
    /// packets are forwarded. Attach downstream sinks here.
    ///
    /// The stream is only cached once the hook succeeds, so other workers
    /// never see a stream without its sinks. After a failure the job's next
    /// segment runs the hook again. The hook must not call back into the
    /// cache.
    pub fn on_new_stream<F>(&self, hook: F)
    where
        F: Fn(&Arc<Stream<Packet>>) -> Result<()> + Send + Sync + 'static,
    {
        *lock(&self.shared.on_new_stream) = Some(Arc::new(hook));
    }

    pub fn cache(&self) -> Option<Arc<StreamCache>> {
        lock(&self.shared.cache).clone()
    }

    /// Queues a serialized segment payload.
    pub fn receive(&self, payload: Bytes) -> Result<()> {
        self.shared.push(Work::Payload {
            payload,
            job_id: None,
        })
    }

    /// Queues the segment carried by an envelope, keyed by the envelope's
    /// job id.
    pub fn receive_envelope(&self, envelope: &Envelope) -> Result<()> {
        self.shared.push(Work::Payload {
            payload: envelope.payload.clone(),
            job_id: Some(envelope.job_id),
        })
    }

    pub fn receive_segment(&self, segment: Segment) -> Result<()> {
        self.shared.push(Work::Segment(segment))
    }

    /// Feeds every envelope the subscriber receives into the pool. Replaces
    /// any previous subscription.
    pub fn subscribe(&self, subscriber: &Subscriber) {
        let shared: Weak<Shared> = Arc::downgrade(&self.shared);
        let subscription = subscriber.subscribe(move |envelope| match shared.upgrade() {
            Some(shared) => shared.push(Work::Payload {
                payload: envelope.payload.clone(),
                job_id: Some(envelope.job_id),
            }),
            None => Err(Error::Closed),
        });
        *lock(&self.subscription) = Some(subscription);
    }

    pub fn unsubscribe(&self) {
        lock(&self.subscription).take();
    }

    /// Work items queued and not yet picked up by a worker.
    pub fn pending(&self) -> usize {
        lock(&self.shared.queue).len()
    }

    /// Stops accepting work, processes everything already queued, joins the
    /// workers and releases the cache. Safe to call more than once.
    pub fn close(&self) {
        self.unsubscribe();
        {
            let _queue = lock(&self.shared.queue);
            self.shared.accepting.store(false, Ordering::Release);
        }
        lock(&self.workers).shutdown();
        if let Some(cache) = lock(&self.shared.cache).take() {
            log::debug!("unpacker closed with {} cached streams", cache.len());
        }
    }
}

impl Drop for SegmentUnpacker {
    fn drop(&mut self) {
        self.close();
    }
}

fn work(shared: &Shared, token: &tokio_util::sync::CancellationToken, idle_sleep: Duration) {
    loop {
        let next = lock(&shared.queue).pop_front();
        match next {
            Some(work) => {
                if let Err(e) = shared.process(work) {
                    log::error!("unpacker worker failed: {e}");
                }
            }
            // queue is drained before a cancelled worker exits
            None if token.is_cancelled() => break,
            None => {
                wait_cancelled(token, idle_sleep);
            }
        }
    }
}

#[cfg(test)]
#[path = "unpacker_test.rs"]
mod unpacker_test;
