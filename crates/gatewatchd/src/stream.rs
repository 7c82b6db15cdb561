use crate::pipeline::{Orchestrator, Shared};
use chrono::Local;
use gatewatch_core::Detection;
use gatewatch_vision::{
    EmbeddingExtractor, ExtractError, Frame, FrameError, FrameSource, MotionGate, SourceError,
};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// The blocking half of a stream: source, motion gate and extractor. Moved
/// onto the blocking pool for each frame and handed back afterwards, so one
/// stream never has two frames in flight.
pub struct Capture {
    source: Box<dyn FrameSource>,
    gate: MotionGate,
    extractor: Box<dyn EmbeddingExtractor>,
}

enum Step {
    Exhausted,
    Still,
    Unavailable(SourceError),
    Failed(SourceError),
    Rejected(FrameError),
    ExtractFailed(ExtractError),
    Motion {
        frame: Frame,
        detections: Vec<Detection>,
    },
}

impl Capture {
    pub fn new(
        source: Box<dyn FrameSource>,
        gate: MotionGate,
        extractor: Box<dyn EmbeddingExtractor>,
    ) -> Self {
        Self {
            source,
            gate,
            extractor,
        }
    }

    fn step(&mut self) -> Step {
        let frame = match self.source.next_frame() {
            Ok(Some(frame)) => frame,
            Ok(None) => return Step::Exhausted,
            Err(e) if e.is_transient() => return Step::Unavailable(e),
            Err(e) => return Step::Failed(e),
        };
        match self.gate.detect(&frame) {
            Ok(false) => Step::Still,
            Ok(true) => match self.extractor.extract(&frame) {
                Ok(detections) => Step::Motion { frame, detections },
                Err(e) => Step::ExtractFailed(e),
            },
            Err(e) => Step::Rejected(e),
        }
    }
}

/// Counters for one stream's lifetime.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct StreamSummary {
    pub stream: String,
    pub frames: u64,
    pub motion_frames: u64,
    pub unavailable: u64,
    pub alerts: u64,
    pub dropped_writes: u64,
}

/// Drive one stream until its source is exhausted, fails, or `cancel` fires.
///
/// Cancellation is observed between frames and during the retry wait; a
/// frame already being processed runs to completion.
pub async fn run_stream(
    mut capture: Capture,
    mut orchestrator: Orchestrator,
    cancel: CancellationToken,
    retry_delay: Duration,
) -> StreamSummary {
    let mut summary = StreamSummary {
        stream: orchestrator.stream().to_string(),
        ..Default::default()
    };
    tracing::info!(stream = %summary.stream, source = %capture.source.describe(), "stream started");

    while !cancel.is_cancelled() {
        let joined = tokio::task::spawn_blocking(move || {
            let step = capture.step();
            (capture, step)
        })
        .await;
        let step = match joined {
            Ok((returned, step)) => {
                capture = returned;
                step
            }
            Err(e) => {
                tracing::error!(stream = %summary.stream, error = %e, "capture worker failed; stopping stream");
                break;
            }
        };

        match step {
            Step::Exhausted => {
                tracing::info!(stream = %summary.stream, "source exhausted");
                break;
            }
            Step::Failed(e) => {
                tracing::error!(stream = %summary.stream, error = %e, "source failed; stopping stream");
                break;
            }
            Step::Unavailable(e) => {
                summary.unavailable += 1;
                tracing::warn!(
                    stream = %summary.stream,
                    error = %e,
                    retry_in = ?retry_delay,
                    "frame unavailable"
                );
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(retry_delay) => {}
                }
            }
            Step::Rejected(e) => {
                summary.frames += 1;
                tracing::warn!(stream = %summary.stream, error = %e, "skipping malformed frame");
            }
            Step::ExtractFailed(e) => {
                summary.frames += 1;
                summary.motion_frames += 1;
                tracing::warn!(stream = %summary.stream, error = %e, "embedding extraction failed");
            }
            Step::Still => {
                summary.frames += 1;
            }
            Step::Motion { frame, detections } => {
                summary.frames += 1;
                summary.motion_frames += 1;
                tracing::debug!(
                    stream = %summary.stream,
                    sequence = frame.sequence,
                    faces = detections.len(),
                    "motion"
                );
                let report = orchestrator.process(&frame, &detections).await;
                tracing::debug!(
                    stream = %summary.stream,
                    known = report.known.len(),
                    unknown = report.unknown.len(),
                    rejected = report.rejected,
                    events = report.events.len(),
                    "frame resolved"
                );
                summary.alerts += report.alerts as u64;
                summary.dropped_writes += report.dropped_writes as u64;
            }
        }
    }

    tracing::info!(
        stream = %summary.stream,
        frames = summary.frames,
        motion_frames = summary.motion_frames,
        unavailable = summary.unavailable,
        alerts = summary.alerts,
        unknown_clusters = orchestrator.clusterer().len(),
        "stream stopped"
    );
    summary
}

/// Periodically drop throttle keys whose cooldown has passed.
pub async fn prune_throttle(shared: Arc<Shared>, every: Duration, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(every);
    // The first tick completes immediately.
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let dropped = shared.throttle.prune(Local::now().naive_local());
                if dropped > 0 {
                    tracing::debug!(dropped, remaining = shared.throttle.len(), "pruned throttle keys");
                }
            }
        }
    }
}
