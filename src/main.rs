use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use segment_bus::CodecBackend;
use tokio_util::sync::CancellationToken;

mod config;
mod recv;
mod send;

use config::Role;

#[derive(Parser, Debug)]
#[command(version, about = "Relays media streams as segments over TCP")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Read a media source and publish its streams to RELAY_SEGMENT_ADDRESS.
    Send {
        /// File path or network URL.
        input: String,
    },
    /// Accept segments on RELAY_LISTEN_ADDRESS and record every job to a file.
    Recv {
        output_dir: PathBuf,
    },
}

fn init_logging() {
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .filter_module("segment_bus", log::LevelFilter::Debug)
        .init();
}

#[cfg(feature = "ffmpeg")]
fn backend() -> Result<Arc<dyn CodecBackend>> {
    segment_bus::init()?;
    Ok(Arc::new(segment_bus::ffmpeg::FfmpegBackend::new()))
}

#[cfg(not(feature = "ffmpeg"))]
fn backend() -> Result<Arc<dyn CodecBackend>> {
    anyhow::bail!("no codec backend compiled in, rebuild with --features ffmpeg")
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();
    let cli = Cli::parse();

    let role = match cli.command {
        Command::Send { .. } => Role::Send,
        Command::Recv { .. } => Role::Recv,
    };
    config::load(role)?;
    let config = config::config()?;
    let backend = backend()?;

    let cancel = CancellationToken::new();
    let worker_cancel = cancel.clone();
    let mut worker = tokio::task::spawn_blocking(move || match cli.command {
        Command::Send { input } => send::run(backend, config, &input, worker_cancel),
        Command::Recv { output_dir } => recv::run(backend, config, &output_dir, worker_cancel),
    });

    let result = tokio::select! {
        result = &mut worker => result,
        _ = tokio::signal::ctrl_c() => {
            log::info!("interrupted, shutting down");
            cancel.cancel();
            worker.await
        }
    };
    result.context("relay worker panicked")?
}
