use std::sync::Arc;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::time::Duration;

use anyhow::{Context, Result};
use segment_bus::{
    CodecBackend, Publisher, Reader, ReaderEvent, Segmenter, SegmenterConfig, SinkHandle,
};
use tokio_util::sync::CancellationToken;

use crate::config::RelayConfig;

/// Reads `input` and publishes every stream as segments until the source
/// ends or `cancel` fires. Blocks the calling thread.
pub fn run(
    backend: Arc<dyn CodecBackend>,
    config: &RelayConfig,
    input: &str,
    cancel: CancellationToken,
) -> Result<()> {
    let mut publisher = Publisher::connect(config.segment_address())
        .with_context(|| format!("connecting to {}", config.segment_address()))?;
    if let Some(job_id) = config.job_id() {
        publisher = publisher.with_job_id(job_id);
    }
    let publisher = Arc::new(publisher);

    let reader = Reader::new(backend, input);
    let (events_tx, events) = mpsc::channel();
    let _events = reader.subscribe_events(move |event| {
        let _ = events_tx.send(event.clone());
    });
    reader.open().with_context(|| format!("opening {input}"))?;

    let mut segmenters = Vec::new();
    let mut publications = Vec::new();
    for stream in reader
        .streams()
        .into_iter()
        .filter(|s| s.descriptor().has_decoder())
    {
        let segmenter = SinkHandle::new(Segmenter::new(SegmenterConfig {
            frames_per_segment: config.segment_frames(),
            job_id: None,
        }));
        publications.push(segmenter.with(|s| publisher.subscribe(s)));
        segmenter
            .subscribe(&stream)
            .with_context(|| format!("segmenting stream {}", stream.index()))?;
        log::info!(
            "stream {} ({}) of {input} published as job {}",
            stream.index(),
            stream.descriptor().media_kind(),
            segmenter.with(|s| s.job_id())
        );
        segmenters.push(segmenter);
    }
    if segmenters.is_empty() {
        anyhow::bail!("{input} has no streams to publish");
    }

    reader.play()?;
    let outcome = loop {
        if cancel.is_cancelled() {
            log::info!("stopping reader for {input}");
            break Ok(());
        }
        match events.recv_timeout(Duration::from_millis(200)) {
            Ok(ReaderEvent::Eof) => {
                log::info!("{input} finished");
                break Ok(());
            }
            Ok(ReaderEvent::Error(message)) => break Err(anyhow::anyhow!(message)),
            Ok(ReaderEvent::Shutdown) | Err(RecvTimeoutError::Disconnected) => break Ok(()),
            Ok(ReaderEvent::Reset) | Err(RecvTimeoutError::Timeout) => {}
        }
    };
    reader.close();

    for segmenter in &segmenters {
        if let Err(e) = segmenter.with(|s| s.flush()) {
            log::warn!("flushing last segment failed: {e}");
        }
    }
    drop(publications);
    outcome.with_context(|| format!("reading {input}"))
}
