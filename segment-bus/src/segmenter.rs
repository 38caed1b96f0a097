use std::sync::Arc;

use uuid::Uuid;

use crate::error::{Error, Result};
use crate::packet::Packet;
use crate::segment::{JobId, Segment};
use crate::source::{Sink, Source, Subscription};
use crate::stream::StreamDescriptor;

#[derive(Debug, Clone, PartialEq)]
pub struct SegmenterConfig {
    /// Packets per segment for streams that are not video.
    pub frames_per_segment: usize,
    /// Identity stamped on every segment. A random one is generated when unset.
    pub job_id: Option<JobId>,
}

impl Default for SegmenterConfig {
    fn default() -> Self {
        Self {
            frames_per_segment: 250,
            job_id: None,
        }
    }
}

/// Groups the packets of one stream into segments.
///
/// Video segments are cut on every key frame, everything else every
/// `frames_per_segment` packets. Feed it exactly one stream.
pub struct Segmenter {
    job_id: JobId,
    frames_per_segment: usize,
    current: Option<Segment>,
    count: usize,
    descriptor: Option<Arc<StreamDescriptor>>,
    segments: Source<Segment>,
}

impl Segmenter {
    pub fn new(config: SegmenterConfig) -> Self {
        Self {
            job_id: config.job_id.unwrap_or_else(Uuid::new_v4),
            frames_per_segment: config.frames_per_segment.max(1),
            current: None,
            count: 0,
            descriptor: None,
            segments: Source::new(),
        }
    }

    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    /// Where finished segments are published.
    pub fn segments(&self) -> Source<Segment> {
        self.segments.clone()
    }

    #[must_use = "dropping the subscription detaches the callback"]
    pub fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(&Segment, &Arc<StreamDescriptor>) -> Result<()> + Send + Sync + 'static,
    {
        self.segments.subscribe(callback)
    }

    /// Publishes the segment being accumulated, even when empty, and starts
    /// a new one. Does nothing before the first packet.
    pub fn flush(&mut self) -> Result<()> {
        let (Some(current), Some(descriptor)) = (self.current.take(), self.descriptor.clone())
        else {
            return Ok(());
        };
        self.current = Some(current.next());
        self.count = 0;
        self.publish(&current, &descriptor)
    }

    fn publish(&self, segment: &Segment, descriptor: &Arc<StreamDescriptor>) -> Result<()> {
        log::debug!(
            "segment {} published: {} packets, dts {:?}",
            segment.job_id(),
            segment.len(),
            segment.dts()
        );
        self.segments.forward(segment, descriptor)
    }

    fn start(&mut self, packet: &Packet, descriptor: &Arc<StreamDescriptor>) -> Result<Segment> {
        let parameters = descriptor.parameters().ok_or_else(|| {
            Error::config(format!(
                "stream {} of {} has no codec parameters",
                descriptor.index(),
                descriptor.origin()
            ))
        })?;
        if descriptor.is_video() && !packet.is_key() {
            return Err(Error::config(format!(
                "first packet in video stream {} of {} is not a key frame",
                descriptor.index(),
                descriptor.origin()
            )));
        }
        log::info!(
            "segmenting {} stream {} of {} as job {}",
            descriptor.media_kind(),
            descriptor.index(),
            descriptor.origin(),
            self.job_id
        );
        Ok(Segment::new(
            self.job_id,
            parameters.clone(),
            descriptor.time_base(),
        ))
    }

    fn is_boundary(&self, packet: &Packet, descriptor: &StreamDescriptor) -> bool {
        if descriptor.is_video() {
            packet.is_key()
        } else {
            self.count >= self.frames_per_segment
        }
    }
}

impl Sink<Packet> for Segmenter {
    fn process(&mut self, packet: &Packet, descriptor: &Arc<StreamDescriptor>) -> Result<()> {
        match self.current.take() {
            None => {
                let mut segment = self.start(packet, descriptor)?;
                self.descriptor = Some(descriptor.clone());
                segment.append(packet);
                self.current = Some(segment);
                self.count = 1;
            }
            Some(current) if self.is_boundary(packet, descriptor) => {
                let mut next = current.next();
                next.append(packet);
                self.current = Some(next);
                self.count = 1;
                self.publish(&current, descriptor)?;
            }
            Some(mut current) => {
                current.append(packet);
                self.current = Some(current);
                self.count += 1;
            }
        }
        Ok(())
    }

    fn on_subscribe(&mut self, descriptor: &Arc<StreamDescriptor>) -> Result<()> {
        self.descriptor = Some(descriptor.clone());
        Ok(())
    }
}

impl Drop for Segmenter {
    /// Publishes a partial tail segment. An empty one is dropped.
    fn drop(&mut self) {
        if self.current.as_ref().is_some_and(|s| !s.is_empty()) {
            if let Err(e) = self.flush() {
                log::warn!("job {}: last segment lost: {e}", self.job_id);
            }
        }
    }
}

#[cfg(test)]
#[path = "segmenter_test.rs"]
mod segmenter_test;
