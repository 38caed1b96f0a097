//! TCP transport for segment envelopes.
//!
//! Publishers connect to a subscriber and push one length-delimited envelope
//! per segment: at most once, no acknowledgement, no retry. A subscriber
//! accepts any number of publishers and hands every decoded envelope to its
//! callbacks on its own receive thread.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::runtime::Runtime;
use tokio_util::codec::{Framed, FramedRead};
use tokio_util::sync::CancellationToken;

use crate::codec::MediaKind;
use crate::error::{Error, Result, lock};
use crate::segment::{JobId, Segment};
use crate::segmenter::Segmenter;
use crate::source::{Handlers, Subscription};
use crate::task::TaskGroup;
use crate::wire::{Envelope, EnvelopeCodec};

fn current_thread_runtime() -> Result<Runtime> {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(Error::from)
}

/// Sends segments to one subscriber endpoint.
pub struct Publisher {
    address: String,
    job_id: Option<JobId>,
    runtime: Runtime,
    connection: Mutex<Option<Framed<TcpStream, EnvelopeCodec>>>,
}

impl Publisher {
    /// Connects to `address`. A connection lost later is re-established on
    /// the next publish.
    pub fn connect(address: impl Into<String>) -> Result<Self> {
        let address = address.into();
        let runtime = current_thread_runtime()?;
        let stream = runtime
            .block_on(TcpStream::connect(&address))
            .map_err(|e| Error::resource(format!("connect to {address}: {e}")))?;
        stream.set_nodelay(true)?;
        log::info!("publisher connected to {address}");
        Ok(Self {
            address,
            job_id: None,
            runtime,
            connection: Mutex::new(Some(Framed::new(stream, EnvelopeCodec::default()))),
        })
    }

    /// Stamps every outgoing envelope with `job_id` instead of the segment's
    /// own identity.
    pub fn with_job_id(mut self, job_id: JobId) -> Self {
        self.job_id = Some(job_id);
        self
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn publish(&self, segment: &Segment) -> Result<()> {
        self.send(Envelope::for_segment(segment))
    }

    /// Ships an already serialized segment payload.
    pub fn publish_raw(
        &self,
        job_id: JobId,
        kind: MediaKind,
        width: u32,
        height: u32,
        payload: Bytes,
    ) -> Result<()> {
        self.send(Envelope {
            job_id,
            kind,
            width,
            height,
            payload,
        })
    }

    /// Publishes every segment the segmenter produces. Send failures are
    /// logged and the segment is dropped.
    #[must_use = "dropping the subscription detaches the callback"]
    pub fn subscribe(self: &Arc<Self>, segmenter: &Segmenter) -> Subscription {
        let publisher = Arc::downgrade(self);
        segmenter.subscribe(move |segment, _| {
            if let Some(publisher) = publisher.upgrade() {
                if let Err(e) = publisher.publish(segment) {
                    log::debug!("segment of job {} dropped: {e}", segment.job_id());
                }
            }
            Ok(())
        })
    }

    fn send(&self, mut envelope: Envelope) -> Result<()> {
        if let Some(job_id) = self.job_id {
            envelope.job_id = job_id;
        }
        let job_id = envelope.job_id;
        let mut connection = lock(&self.connection);
        let result = self
            .runtime
            .block_on(deliver(&self.address, &mut connection, envelope));
        if let Err(e) = &result {
            log::warn!("publish {job_id} to {} failed: {e}", self.address);
            *connection = None;
        }
        result
    }
}

async fn deliver(
    address: &str,
    connection: &mut Option<Framed<TcpStream, EnvelopeCodec>>,
    envelope: Envelope,
) -> Result<()> {
    if connection.is_none() {
        let stream = TcpStream::connect(address).await?;
        stream.set_nodelay(true)?;
        *connection = Some(Framed::new(stream, EnvelopeCodec::default()));
    }
    match connection.as_mut() {
        Some(framed) => framed.send(envelope).await,
        None => Err(Error::Closed),
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SubscriberConfig {
    /// Upper bound on how long the receive loop waits before re-checking for
    /// shutdown.
    pub poll_timeout: Duration,
}

impl Default for SubscriberConfig {
    fn default() -> Self {
        Self {
            poll_timeout: Duration::from_millis(250),
        }
    }
}

type EnvelopeCallback = dyn Fn(&Envelope) -> Result<()> + Send + Sync;

/// Receives envelopes from any number of publishers.
pub struct Subscriber {
    local_addr: SocketAddr,
    handlers: Handlers<EnvelopeCallback>,
    task: Mutex<TaskGroup>,
}

impl Subscriber {
    pub fn bind(address: &str, config: SubscriberConfig) -> Result<Self> {
        let listener = std::net::TcpListener::bind(address)
            .map_err(|e| Error::resource(format!("bind {address}: {e}")))?;
        listener.set_nonblocking(true)?;
        let local_addr = listener.local_addr()?;
        let handlers = Handlers::new();

        let mut task = TaskGroup::new("subscriber");
        let dispatch = handlers.clone();
        task.spawn(move |token| {
            let runtime = match current_thread_runtime() {
                Ok(runtime) => runtime,
                Err(e) => {
                    log::error!("subscriber on {local_addr} failed to start: {e}");
                    return;
                }
            };
            let served = runtime.block_on(serve(listener, dispatch, token, config.poll_timeout));
            if let Err(e) = served {
                log::error!("subscriber on {local_addr} stopped: {e}");
            }
        })?;
        log::info!("subscriber listening on {local_addr}");

        Ok(Self {
            local_addr,
            handlers,
            task: Mutex::new(task),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Registers a callback run on the receive thread for every envelope.
    #[must_use = "dropping the subscription detaches the callback"]
    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&Envelope) -> Result<()> + Send + Sync + 'static,
    {
        self.handlers.add(Arc::new(callback))
    }

    /// Stops receiving and joins the receive thread. Bounded by the poll
    /// timeout.
    pub fn close(&self) {
        lock(&self.task).shutdown();
    }
}

impl Drop for Subscriber {
    fn drop(&mut self) {
        self.close();
    }
}

async fn serve(
    listener: std::net::TcpListener,
    handlers: Handlers<EnvelopeCallback>,
    token: CancellationToken,
    poll_timeout: Duration,
) -> Result<()> {
    let listener = TcpListener::from_std(listener)?;
    while !token.is_cancelled() {
        let (stream, peer) = match tokio::time::timeout(poll_timeout, listener.accept()).await {
            Err(_elapsed) => continue,
            Ok(Err(e)) => {
                log::warn!("accept failed: {e}");
                continue;
            }
            Ok(Ok(accepted)) => accepted,
        };
        log::debug!("publisher {peer} connected");
        tokio::spawn(receive(stream, peer, handlers.clone(), token.clone()));
    }
    Ok(())
}

async fn receive(
    stream: TcpStream,
    peer: SocketAddr,
    handlers: Handlers<EnvelopeCallback>,
    token: CancellationToken,
) {
    let mut frames = FramedRead::new(stream, EnvelopeCodec::default());
    loop {
        let next = tokio::select! {
            _ = token.cancelled() => break,
            next = frames.next() => next,
        };
        match next {
            Some(Ok(envelope)) => {
                for callback in handlers.snapshot() {
                    if let Err(e) = callback(&envelope) {
                        log::warn!("envelope {} from {peer} rejected: {e}", envelope.job_id);
                    }
                }
            }
            Some(Err(e)) => {
                // the byte stream can no longer be trusted to be framed
                log::warn!("dropping publisher {peer}: {e}");
                break;
            }
            None => {
                log::debug!("publisher {peer} disconnected");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use uuid::Uuid;

    use super::*;
    use crate::codec::{CodecParameters, Rational};
    use crate::testing::{self, wait_until};

    fn segment(job_id: JobId, first_dts: i64) -> Segment {
        let mut segment = Segment::new(
            job_id,
            CodecParameters::video(testing::H264, 64, 48),
            Rational::new(1, 90000),
        );
        segment.append(&testing::packet(0, first_dts, true));
        segment.append(&testing::packet(0, first_dts + 3600, false));
        segment
    }

    fn collecting(subscriber: &Subscriber) -> (Arc<Mutex<Vec<Envelope>>>, Subscription) {
        let received = Arc::new(Mutex::new(Vec::new()));
        let sub = {
            let received = received.clone();
            subscriber.subscribe(move |envelope| {
                received.lock().unwrap().push(envelope.clone());
                Ok(())
            })
        };
        (received, sub)
    }

    #[test]
    fn test_publish_and_receive() {
        testing::init_logger();
        let subscriber = Subscriber::bind("127.0.0.1:0", SubscriberConfig::default()).unwrap();
        let (received, _sub) = collecting(&subscriber);

        let publisher = Publisher::connect(subscriber.local_addr().to_string()).unwrap();
        let job_id = Uuid::new_v4();
        publisher.publish(&segment(job_id, 0)).unwrap();
        publisher.publish(&segment(job_id, 7200)).unwrap();

        assert!(wait_until(Duration::from_secs(5), || received.lock().unwrap().len() == 2));
        let received = received.lock().unwrap();
        assert_eq!(received[0].job_id, job_id);
        assert_eq!(received[0].kind, MediaKind::Video);
        assert_eq!((received[0].width, received[0].height), (64, 48));
        assert_eq!(received[1].segment().unwrap().dts(), Some(7200));
    }

    #[test]
    fn test_job_id_override_and_raw_publish() {
        let subscriber = Subscriber::bind("127.0.0.1:0", SubscriberConfig::default()).unwrap();
        let (received, _sub) = collecting(&subscriber);

        let renamed = Uuid::new_v4();
        let publisher = Publisher::connect(subscriber.local_addr().to_string())
            .unwrap()
            .with_job_id(renamed);
        publisher.publish(&segment(Uuid::new_v4(), 0)).unwrap();
        publisher
            .publish_raw(Uuid::nil(), MediaKind::Audio, 0, 0, Bytes::from_static(b"raw"))
            .unwrap();

        assert!(wait_until(Duration::from_secs(5), || received.lock().unwrap().len() == 2));
        let received = received.lock().unwrap();
        assert!(received.iter().all(|e| e.job_id == renamed));
        assert_eq!(received[1].payload.as_ref(), b"raw");
    }

    #[test]
    fn test_multiple_publishers_and_callbacks() {
        let subscriber = Subscriber::bind("127.0.0.1:0", SubscriberConfig::default()).unwrap();
        let (first, _first_sub) = collecting(&subscriber);
        let (second, _second_sub) = collecting(&subscriber);

        let a = Publisher::connect(subscriber.local_addr().to_string()).unwrap();
        let b = Publisher::connect(subscriber.local_addr().to_string()).unwrap();
        a.publish(&segment(Uuid::new_v4(), 0)).unwrap();
        b.publish(&segment(Uuid::new_v4(), 0)).unwrap();

        assert!(wait_until(Duration::from_secs(5), || first.lock().unwrap().len() == 2));
        assert!(wait_until(Duration::from_secs(5), || second.lock().unwrap().len() == 2));
    }

    #[test]
    fn test_close_is_bounded_and_idempotent() {
        let subscriber = Subscriber::bind(
            "127.0.0.1:0",
            SubscriberConfig {
                poll_timeout: Duration::from_millis(20),
            },
        )
        .unwrap();
        let start = std::time::Instant::now();
        subscriber.close();
        subscriber.close();
        assert!(start.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn test_connect_refused_is_resource_error() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let address = listener.local_addr().unwrap().to_string();
        drop(listener);
        assert!(matches!(
            Publisher::connect(address),
            Err(Error::Resource(_))
        ));
    }

    #[test]
    fn test_publisher_follows_segmenter() {
        use crate::segmenter::SegmenterConfig;
        use crate::source::Sink;

        let subscriber = Subscriber::bind("127.0.0.1:0", SubscriberConfig::default()).unwrap();
        let (received, _sub) = collecting(&subscriber);
        let publisher = Arc::new(Publisher::connect(subscriber.local_addr().to_string()).unwrap());

        let mut segmenter = Segmenter::new(SegmenterConfig::default());
        let _link = publisher.subscribe(&segmenter);
        let descriptor = testing::video_descriptor();
        for packet in testing::video_packets(0, 6, 3) {
            segmenter.process(&packet, &descriptor).unwrap();
        }
        segmenter.flush().unwrap();

        assert!(wait_until(Duration::from_secs(5), || received.lock().unwrap().len() == 2));
        assert!(
            received
                .lock()
                .unwrap()
                .iter()
                .all(|e| e.job_id == segmenter.job_id())
        );
    }
}
