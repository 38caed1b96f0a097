use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::backend::{CodecBackend, StreamInfo};
use crate::error::{Error, Result, lock};
use crate::packet::Packet;
use crate::segment::{JobId, Segment};
use crate::stream::{Stream, StreamDescriptor};
use crate::task::{TaskGroup, wait_cancelled};

/// Job registry consulted before falling back to the parameters a segment
/// carries.
pub trait DescriptorLookup: Send + Sync {
    /// `Ok(None)` when the job is unknown.
    fn lookup(&self, job_id: &JobId) -> anyhow::Result<Option<StreamInfo>>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct StreamCacheConfig {
    pub ttl: Duration,
    pub sweep_interval: Duration,
}

impl Default for StreamCacheConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(600),
            sweep_interval: Duration::from_secs(10),
        }
    }
}

struct Record {
    stream: Arc<Stream<Packet>>,
    expires: Instant,
}

type Entries = Arc<Mutex<HashMap<JobId, Record>>>;

/// Reassembled streams keyed by job id, expiring after a period without
/// hits.
pub struct StreamCache {
    backend: Arc<dyn CodecBackend>,
    lookup: Option<Arc<dyn DescriptorLookup>>,
    ttl: Duration,
    entries: Entries,
    sweeper: Mutex<TaskGroup>,
}

impl StreamCache {
    pub fn new(backend: Arc<dyn CodecBackend>, config: StreamCacheConfig) -> Result<Self> {
        let entries: Entries = Arc::new(Mutex::new(HashMap::new()));
        let mut sweeper = TaskGroup::new("stream-cache");
        let swept = entries.clone();
        let interval = config.sweep_interval;
        sweeper.spawn(move |token| {
            while !wait_cancelled(&token, interval) {
                sweep(&swept, Instant::now());
            }
        })?;
        Ok(Self {
            backend,
            lookup: None,
            ttl: config.ttl,
            entries,
            sweeper: Mutex::new(sweeper),
        })
    }

    pub fn with_lookup(mut self, lookup: Arc<dyn DescriptorLookup>) -> Self {
        self.lookup = Some(lookup);
        self
    }

    /// Looks up a stream, refreshing its expiry on a hit.
    pub fn get(&self, job_id: &JobId) -> Option<Arc<Stream<Packet>>> {
        let mut entries = lock(&self.entries);
        let record = entries.get_mut(job_id)?;
        record.expires = Instant::now() + self.ttl;
        Some(record.stream.clone())
    }

    /// Looks up the segment's stream, creating it from the segment's codec
    /// parameters on a miss. Nothing is cached when no decoder can be opened.
    pub fn get_or_create(&self, segment: &Segment) -> Result<Arc<Stream<Packet>>> {
        self.entry(segment, |_| Ok(())).map(|(stream, _)| stream)
    }

    /// Like [`StreamCache::get_or_create`], also reporting whether the stream
    /// was created by this call. `setup` runs on a freshly created stream
    /// under the cache lock, before any other caller can see it. If it fails
    /// nothing is cached.
    pub(crate) fn entry<F>(&self, segment: &Segment, setup: F) -> Result<(Arc<Stream<Packet>>, bool)>
    where
        F: FnOnce(&Arc<Stream<Packet>>) -> Result<()>,
    {
        let job_id = segment.job_id();
        let mut entries = lock(&self.entries);
        let expires = Instant::now() + self.ttl;
        if let Some(record) = entries.get_mut(&job_id) {
            record.expires = expires;
            return Ok((record.stream.clone(), false));
        }
        let stream = Arc::new(Stream::new(Arc::new(self.describe(segment)?)));
        setup(&stream)?;
        log::debug!(
            "cached {} stream for job {job_id}",
            stream.descriptor().media_kind()
        );
        entries.insert(
            job_id,
            Record {
                stream: stream.clone(),
                expires,
            },
        );
        Ok((stream, true))
    }

    fn describe(&self, segment: &Segment) -> Result<StreamDescriptor> {
        let job_id = segment.job_id();
        let index = segment
            .packets()
            .first()
            .map(Packet::stream_index)
            .unwrap_or_default();
        let info = self
            .lookup_info(&job_id)
            .unwrap_or_else(|| StreamInfo {
                index,
                parameters: segment.parameters().clone(),
                time_base: segment.time_base(),
                frame_rate: Default::default(),
            });
        let decoder = self
            .backend
            .open_decoder(&info.parameters, info.time_base)
            .map_err(|e| {
                Error::resource(format!(
                    "no decoder for job {job_id} (codec id {}): {e}",
                    info.parameters.codec_id
                ))
            })?;
        Ok(StreamDescriptor::from_info(&info, job_id.to_string()).with_decoder(decoder))
    }

    fn lookup_info(&self, job_id: &JobId) -> Option<StreamInfo> {
        let lookup = self.lookup.as_ref()?;
        match lookup.lookup(job_id) {
            Ok(info) => info,
            Err(e) => {
                log::warn!("descriptor lookup for job {job_id} failed, using segment parameters: {e}");
                None
            }
        }
    }

    /// Removes every expired entry. Normally run by the sweep
    /// thread.
    pub fn sweep(&self) {
        sweep(&self.entries, Instant::now());
    }

    pub fn len(&self) -> usize {
        lock(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        lock(&self.entries).is_empty()
    }

    /// Stops the sweep thread and drops every cached stream.
    pub fn close(&self) {
        lock(&self.sweeper).shutdown();
        lock(&self.entries).clear();
    }
}

impl Drop for StreamCache {
    fn drop(&mut self) {
        self.close();
    }
}

fn sweep(entries: &Mutex<HashMap<JobId, Record>>, now: Instant) {
    lock(entries).retain(|job_id, record| {
        let keep = record.expires > now;
        if !keep {
            log::info!("job {job_id} expired from stream cache");
        }
        keep
    });
}

#[cfg(test)]
mod tests {
    use uuid::Uuid;

    use super::*;
    use crate::codec::{CodecParameters, MediaKind};
    use crate::testing::{self, TestBackend, wait_until};

    fn segment(job_id: JobId, codec_id: u32) -> Segment {
        let mut segment = Segment::new(
            job_id,
            CodecParameters::video(codec_id, 320, 240),
            testing::VIDEO_TB,
        );
        segment.append(&testing::packet(4, 0, true));
        segment
    }

    fn cache(ttl: Duration, sweep_interval: Duration) -> StreamCache {
        StreamCache::new(TestBackend::new(), StreamCacheConfig { ttl, sweep_interval }).unwrap()
    }

    #[test]
    fn test_get_or_create_then_hit() {
        let cache = cache(Duration::from_secs(60), Duration::from_secs(60));
        let job_id = Uuid::new_v4();
        assert!(cache.get(&job_id).is_none());

        let created = cache.get_or_create(&segment(job_id, testing::H264)).unwrap();
        assert_eq!(created.descriptor().origin(), job_id.to_string());
        assert_eq!(created.index(), 4);
        assert!(created.descriptor().has_decoder());
        assert_eq!(cache.len(), 1);

        // parameters of later segments are ignored on a hit
        let (again, fresh) = cache
            .entry(&segment(job_id, testing::AAC), |_| panic!("stream exists"))
            .unwrap();
        assert!(!fresh);
        assert!(Arc::ptr_eq(&created, &again));
        assert!(Arc::ptr_eq(&created, &cache.get(&job_id).unwrap()));
    }

    #[test]
    fn test_unknown_codec_caches_nothing() {
        let cache = cache(Duration::from_secs(60), Duration::from_secs(60));
        let job_id = Uuid::new_v4();
        let err = cache
            .get_or_create(&segment(job_id, testing::UNKNOWN_CODEC))
            .unwrap_err();
        assert!(matches!(err, Error::Resource(_)));
        assert!(cache.is_empty());
        assert!(cache.get(&job_id).is_none());
    }

    #[test]
    fn test_unrefreshed_entry_expires() {
        let cache = cache(Duration::from_millis(50), Duration::from_millis(10));
        let job_id = Uuid::new_v4();
        cache.get_or_create(&segment(job_id, testing::H264)).unwrap();
        // `get` refreshes the expiry, so only watch the size
        assert!(wait_until(Duration::from_secs(5), || cache.is_empty()));
        assert!(cache.get(&job_id).is_none());
    }

    #[test]
    fn test_failed_setup_caches_nothing() {
        let cache = cache(Duration::from_secs(60), Duration::from_secs(60));
        let job_id = Uuid::new_v4();
        let err = cache
            .entry(&segment(job_id, testing::H264), |_| {
                Err(Error::resource("no output"))
            })
            .unwrap_err();
        assert!(matches!(err, Error::Resource(_)));
        assert!(cache.is_empty());

        let (_, created) = cache.entry(&segment(job_id, testing::H264), |_| Ok(())).unwrap();
        assert!(created);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_refreshed_entry_survives() {
        let cache = cache(Duration::from_millis(200), Duration::from_millis(10));
        let job_id = Uuid::new_v4();
        cache.get_or_create(&segment(job_id, testing::H264)).unwrap();
        let start = Instant::now();
        while start.elapsed() < Duration::from_millis(500) {
            assert!(cache.get(&job_id).is_some());
            std::thread::sleep(Duration::from_millis(20));
        }
    }

    #[test]
    fn test_manual_sweep_and_close() {
        let cache = cache(Duration::ZERO, Duration::from_secs(3600));
        cache.get_or_create(&segment(Uuid::new_v4(), testing::H264)).unwrap();
        std::thread::sleep(Duration::from_millis(2));
        cache.sweep();
        assert!(cache.is_empty());

        cache.get_or_create(&segment(Uuid::new_v4(), testing::H264)).unwrap();
        cache.close();
        cache.close();
        assert!(cache.is_empty());
    }

    struct Registry(Option<StreamInfo>, bool);

    impl DescriptorLookup for Registry {
        fn lookup(&self, _job_id: &JobId) -> anyhow::Result<Option<StreamInfo>> {
            if self.1 {
                anyhow::bail!("registry unavailable");
            }
            Ok(self.0.clone())
        }
    }

    #[test]
    fn test_lookup_takes_precedence() {
        let cache = cache(Duration::from_secs(60), Duration::from_secs(60))
            .with_lookup(Arc::new(Registry(Some(testing::audio_info(7)), false)));
        let stream = cache
            .get_or_create(&segment(Uuid::new_v4(), testing::H264))
            .unwrap();
        assert_eq!(stream.descriptor().media_kind(), MediaKind::Audio);
        assert_eq!(stream.index(), 7);
    }

    #[test]
    fn test_lookup_failure_falls_back_to_segment() {
        for registry in [Registry(None, false), Registry(None, true)] {
            let cache = cache(Duration::from_secs(60), Duration::from_secs(60))
                .with_lookup(Arc::new(registry));
            let stream = cache
                .get_or_create(&segment(Uuid::new_v4(), testing::H264))
                .unwrap();
            assert_eq!(stream.descriptor().media_kind(), MediaKind::Video);
        }
    }
}
