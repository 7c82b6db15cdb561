use anyhow::{Context, Result};
use clap::Parser;
use gatewatch_core::{AlertThrottle, Gallery};
use gatewatch_journal::Journal;
use gatewatch_vision::{
    gallery_from_images, CommandExtractor, DirectorySource, DiskSnapshotWriter, FrameSource, MotionGate,
    V4l2Source,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

mod config;
mod notify;
mod pipeline;
mod stream;

use config::{Config, SourceKind, StreamConfig};
use notify::FanoutSink;
use pipeline::{Orchestrator, PipelineSettings, Shared};
use stream::{prune_throttle, run_stream, Capture};

#[derive(Parser)]
#[command(name = "gatewatchd", about = "Gatewatch camera watch daemon", version)]
struct Args {
    /// TOML config file; GATEWATCH_* variables override it
    #[arg(short, long, env = "GATEWATCH_CONFIG")]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    tracing::info!(version = env!("CARGO_PKG_VERSION"), "gatewatchd starting");

    let config = Config::load(args.config.as_deref()).context("invalid configuration")?;
    tracing::info!(
        streams = config.streams.len(),
        db = %config.db_path.display(),
        metric = ?config.metric,
        match_tolerance = config.match_tolerance,
        cluster_tolerance = config.cluster_tolerance,
        cooldown_secs = config.alert_cooldown_secs,
        extract_timeout_secs = config.extract_timeout_secs,
        "configuration loaded"
    );

    let gallery = load_gallery(&config)?;
    let journal = Journal::open(&config.db_path)
        .await
        .with_context(|| format!("failed to open journal {}", config.db_path.display()))?;

    let snapshots = DiskSnapshotWriter::new(&config.snapshot_dir);
    tracing::info!(dir = %snapshots.dir().display(), "snapshots directory");
    let sink = FanoutSink::from_config(&config, tokio::runtime::Handle::current())
        .context("failed to set up alert delivery")?;
    tracing::info!(sinks = ?sink.names(), "alert delivery ready");

    let shared = Arc::new(Shared {
        gallery,
        throttle: AlertThrottle::from_secs_f64(config.alert_cooldown_secs),
        journal,
        snapshots: Arc::new(snapshots),
        sink: Arc::new(sink),
        settings: PipelineSettings::from(&config),
    });

    let cancel = CancellationToken::new();
    let retry_delay = Duration::from_secs(config.frame_retry_secs);
    let mut streams = JoinSet::new();
    for stream in &config.streams {
        let source = open_source(stream)?;
        let gate = MotionGate::new(config.motion_pixel_threshold, config.motion_min_pixels);
        let capture = Capture::new(source, gate, Box::new(extractor(&config)?));
        let orchestrator = Orchestrator::new(stream.name.clone(), Arc::clone(&shared));
        streams.spawn(run_stream(capture, orchestrator, cancel.clone(), retry_delay));
    }

    let pruner = (config.throttle_prune_secs > 0).then(|| {
        tokio::spawn(prune_throttle(
            Arc::clone(&shared),
            Duration::from_secs(config.throttle_prune_secs),
            cancel.clone(),
        ))
    });

    tracing::info!("gatewatchd ready");

    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c(), if !cancel.is_cancelled() => {
                if let Err(e) = signal {
                    tracing::warn!(error = %e, "failed to listen for ctrl-c");
                }
                tracing::info!("gatewatchd shutting down");
                cancel.cancel();
            }
            joined = streams.join_next() => match joined {
                Some(Ok(summary)) => tracing::info!(
                    stream = %summary.stream,
                    frames = summary.frames,
                    alerts = summary.alerts,
                    dropped_writes = summary.dropped_writes,
                    "stream finished"
                ),
                Some(Err(e)) => tracing::error!(error = %e, "stream task failed"),
                None => break,
            },
        }
    }

    cancel.cancel();
    if let Some(pruner) = pruner {
        if let Err(e) = pruner.await {
            tracing::warn!(error = %e, "throttle pruner failed");
        }
    }

    tracing::info!("gatewatchd stopped");
    Ok(())
}

fn open_source(stream: &StreamConfig) -> Result<Box<dyn FrameSource>> {
    match stream.source_kind()? {
        SourceKind::Directory(dir) => {
            let source = DirectorySource::open(&dir)
                .with_context(|| format!("stream '{}': cannot open {}", stream.name, dir.display()))?;
            Ok(Box::new(source))
        }
        // Opened on the first frame; a missing camera is retried.
        SourceKind::V4l2(device) => Ok(Box::new(V4l2Source::new(device))),
    }
}

fn extractor(config: &Config) -> Result<CommandExtractor> {
    let extractor = config
        .extractor_command
        .as_deref()
        .and_then(CommandExtractor::from_command_line)
        .context("no embedding extractor configured")?;
    Ok(extractor.with_timeout(config.extract_timeout()))
}

/// A directory is treated as reference photos, anything else as a JSON
/// gallery. A missing path gives an empty gallery.
fn load_gallery(config: &Config) -> Result<Gallery> {
    let path = &config.gallery_path;
    let gallery = if path.is_dir() {
        let mut extractor = extractor(config)?;
        gallery_from_images(path, &mut extractor, config.embedding_dim)
            .with_context(|| format!("failed to build gallery from {}", path.display()))?
    } else if path.exists() {
        Gallery::load_json(path, config.embedding_dim)?
    } else {
        tracing::warn!(path = %path.display(), "gallery not found; every face will be unknown");
        Gallery::new(Vec::new(), config.embedding_dim)?
    };

    if gallery.is_empty() {
        tracing::warn!("gallery is empty");
    } else {
        tracing::info!(identities = gallery.len(), "gallery loaded");
    }
    Ok(gallery)
}
