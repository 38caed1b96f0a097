use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use segment_bus::{
    CodecBackend, Muxer, MuxerConfig, Packet, SegmentUnpacker, Stream, StreamCache,
    StreamCacheConfig, Subscriber, SubscriberConfig, UnpackerConfig,
};
use tokio_util::sync::CancellationToken;

use crate::config::RelayConfig;

/// Receives segments and writes every job to its own file in `output_dir`
/// until `cancel` fires. Blocks the calling thread.
pub fn run(
    backend: Arc<dyn CodecBackend>,
    config: &RelayConfig,
    output_dir: &Path,
    cancel: CancellationToken,
) -> Result<()> {
    std::fs::create_dir_all(output_dir)
        .with_context(|| format!("creating {}", output_dir.display()))?;

    let cache = StreamCache::new(
        backend.clone(),
        StreamCacheConfig {
            ttl: config.cache_ttl(),
            sweep_interval: config.cache_sweep(),
        },
    )?;
    let unpacker = SegmentUnpacker::new(
        Arc::new(cache),
        UnpackerConfig {
            workers: config.unpacker_workers(),
            ..Default::default()
        },
    )?;

    let recorder = Arc::new(Mutex::new(Recorder::new(
        backend,
        output_dir,
        config.output_format(),
    )));
    {
        let recorder = recorder.clone();
        unpacker.on_new_stream(move |stream| {
            recorder
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .record(stream)
        });
    }

    let subscriber = Subscriber::bind(config.listen_address(), SubscriberConfig::default())
        .with_context(|| format!("binding {}", config.listen_address()))?;
    unpacker.subscribe(&subscriber);
    log::info!("listening for segments on {}", subscriber.local_addr());

    while !cancel.is_cancelled() {
        std::thread::sleep(Duration::from_millis(200));
    }

    subscriber.close();
    unpacker.close();
    recorder.lock().unwrap_or_else(|e| e.into_inner()).close();
    Ok(())
}

/// One muxer per job. A job that comes back after its stream expired gets a
/// new file, the previous one is closed first.
struct Recorder {
    backend: Arc<dyn CodecBackend>,
    output_dir: PathBuf,
    format: String,
    jobs: HashMap<String, Recording>,
}

struct Recording {
    muxer: Muxer,
    files: usize,
}

impl Recorder {
    fn new(backend: Arc<dyn CodecBackend>, output_dir: &Path, format: &str) -> Self {
        Self {
            backend,
            output_dir: output_dir.to_path_buf(),
            format: format.to_string(),
            jobs: HashMap::new(),
        }
    }

    fn record(&mut self, stream: &Arc<Stream<Packet>>) -> segment_bus::Result<()> {
        let job = stream.descriptor().origin().to_string();
        let files = match self.jobs.remove(&job) {
            Some(previous) => {
                if let Err(e) = previous.muxer.close() {
                    log::warn!("closing {}: {e}", previous.muxer.url());
                }
                previous.files
            }
            None => 0,
        };
        let name = match files {
            0 => job.clone(),
            n => format!("{job}-{n}"),
        };
        let path = output_path(&self.output_dir, &name, &self.format);
        let muxer = Muxer::new(
            self.backend.as_ref(),
            path.to_string_lossy(),
            MuxerConfig {
                format: Some(self.format.clone()),
                ..Default::default()
            },
        )?;
        muxer.subscribe(stream)?;
        log::info!("job {job} recorded to {}", path.display());
        self.jobs.insert(
            job,
            Recording {
                muxer,
                files: files + 1,
            },
        );
        Ok(())
    }

    fn close(&mut self) {
        for (_, recording) in self.jobs.drain() {
            if let Err(e) = recording.muxer.close() {
                log::warn!("closing {}: {e}", recording.muxer.url());
            }
        }
    }
}

/// `<dir>/<job>.<ext>`, the extension following the container name.
fn output_path(dir: &Path, job: &str, format: &str) -> PathBuf {
    let extension = match format {
        "matroska" => "mkv",
        "mpegts" => "ts",
        "flv" => "flv",
        "mp4" | "mov" => format,
        other => other.split(',').next().unwrap_or(other),
    };
    dir.join(format!("{job}.{extension}"))
}
