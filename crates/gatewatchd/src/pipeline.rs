use crate::config::Config;
use crate::notify::{alert_message, Alert, NotificationSink, NotifyError};
use chrono::NaiveDateTime;
use gatewatch_core::{
    AlertThrottle, Assignment, Detection, Gallery, Matcher, Metric, NearestMatcher,
    RepresentativePolicy, UnknownClusterer,
};
use gatewatch_journal::schema::TIMESTAMP_FORMAT;
use gatewatch_journal::{Event, Journal, JournalError};
use gatewatch_vision::{snapshot_filename, Frame, SnapshotError, SnapshotWriter};
use image::RgbImage;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("snapshot error: {0}")]
    Snapshot(#[from] SnapshotError),
    #[error("journal error: {0}")]
    Journal(#[from] JournalError),
    #[error("notification error: {0}")]
    Notify(#[from] NotifyError),
    #[error("worker task failed: {0}")]
    Worker(#[from] tokio::task::JoinError),
}

/// Decision parameters shared by every stream.
#[derive(Debug, Clone, Copy)]
pub struct PipelineSettings {
    pub metric: Metric,
    pub match_tolerance: f32,
    pub cluster_tolerance: f32,
    pub representative: RepresentativePolicy,
    pub alert_on_known: bool,
}

impl From<&Config> for PipelineSettings {
    fn from(config: &Config) -> Self {
        Self {
            metric: config.metric,
            match_tolerance: config.match_tolerance,
            cluster_tolerance: config.cluster_tolerance,
            representative: config.representative,
            alert_on_known: config.alert_on_known,
        }
    }
}

/// State shared across streams: the read-only gallery, the throttle, the
/// journal and the outbound boundaries.
pub struct Shared {
    pub gallery: Gallery,
    pub throttle: AlertThrottle,
    pub journal: Journal,
    pub snapshots: Arc<dyn SnapshotWriter>,
    pub sink: Arc<dyn NotificationSink>,
    pub settings: PipelineSettings,
}

/// What happened to one frame's detections.
#[derive(Debug, Default)]
pub struct FrameReport {
    /// Gallery names matched, in detection order.
    pub known: Vec<String>,
    /// Cluster assignments for unmatched detections.
    pub unknown: Vec<Assignment>,
    /// Detections dropped for a wrong dimension or NaN/infinite components.
    pub rejected: usize,
    /// Alerts that passed the throttle.
    pub alerts: usize,
    /// Events durably recorded for those alerts.
    pub events: Vec<Event>,
    /// Journal writes that failed and were dropped.
    pub dropped_writes: usize,
}

/// Per-stream decision pipeline. Owns the stream's clusterer; everything
/// else comes from [`Shared`].
pub struct Orchestrator {
    stream: String,
    shared: Arc<Shared>,
    matcher: NearestMatcher,
    clusterer: UnknownClusterer,
}

impl Orchestrator {
    pub fn new(stream: impl Into<String>, shared: Arc<Shared>) -> Self {
        let settings = shared.settings;
        Self {
            stream: stream.into(),
            matcher: NearestMatcher::new(settings.metric),
            clusterer: UnknownClusterer::new(settings.metric, settings.representative),
            shared,
        }
    }

    pub fn stream(&self) -> &str {
        &self.stream
    }

    pub fn clusterer(&self) -> &UnknownClusterer {
        &self.clusterer
    }

    /// Resolve every detection of a frame that passed the motion gate.
    ///
    /// Never fails: journal, snapshot and notification errors are logged and
    /// counted in the report so the stream keeps running.
    pub async fn process(&mut self, frame: &Frame, detections: &[Detection]) -> FrameReport {
        let now = frame.captured_at;
        let shared = Arc::clone(&self.shared);
        let settings = shared.settings;
        let mut report = FrameReport::default();
        let mut evidence: Option<Arc<RgbImage>> = None;

        for detection in detections {
            if !shared.gallery.accepts(&detection.embedding) {
                tracing::warn!(
                    stream = %self.stream,
                    expected = shared.gallery.dim(),
                    actual = detection.embedding.dim(),
                    finite = detection.embedding.is_finite(),
                    "rejecting detection with unusable embedding"
                );
                report.rejected += 1;
                continue;
            }

            let matched = self
                .matcher
                .find(
                    &detection.embedding,
                    shared.gallery.identities(),
                    settings.match_tolerance,
                )
                .map(|m| (m.identity.name.clone(), m.distance));

            if let Some((name, distance)) = matched {
                tracing::debug!(stream = %self.stream, identity = %name, distance, "known identity");
                if let Err(e) = shared.journal.touch_attendance(&name, now).await {
                    tracing::warn!(identity = %name, error = %e, "attendance write failed; dropping");
                    report.dropped_writes += 1;
                }
                if settings.alert_on_known && shared.throttle.should_alert(&name, now) {
                    self.raise(&name, frame, detections, &mut evidence, &mut report)
                        .await;
                }
                report.known.push(name);
                continue;
            }

            let assignment =
                self.clusterer
                    .assign(&detection.embedding, settings.cluster_tolerance, now);
            let label = assignment.id.label();
            if assignment.is_new {
                tracing::info!(stream = %self.stream, label = %label, "new unknown identity");
            }
            report.unknown.push(assignment);

            // Cluster ids are per stream, so their throttle keys are too.
            let key = format!("{}/{}", self.stream, label);
            if shared.throttle.should_alert(&key, now) {
                self.raise(&label, frame, detections, &mut evidence, &mut report)
                    .await;
            } else {
                tracing::debug!(stream = %self.stream, label = %label, "alert suppressed by cooldown");
            }
        }

        report
    }

    /// Snapshot, journal and notify for one alert that passed the throttle.
    async fn raise(
        &self,
        label: &str,
        frame: &Frame,
        detections: &[Detection],
        evidence: &mut Option<Arc<RgbImage>>,
        report: &mut FrameReport,
    ) {
        let now = frame.captured_at;
        report.alerts += 1;

        let image = Arc::clone(
            evidence.get_or_insert_with(|| Arc::new(frame.annotated(detections.iter().map(|d| &d.bbox)))),
        );
        let filename = format!("{}/{}", self.stream, snapshot_filename(label, now, frame.sequence));
        let evidence_path = match self.write_snapshot(image, filename).await {
            Ok(path) => path.display().to_string(),
            Err(e) => {
                tracing::warn!(label, error = %e, "snapshot failed; recording event without evidence");
                String::new()
            }
        };

        match self.record_event(label, now, &evidence_path).await {
            Ok(event) => {
                tracing::info!(stream = %self.stream, id = event.id, label, "event recorded");
                report.events.push(event);
            }
            Err(e) => {
                tracing::error!(label, error = %e, "event write failed twice; dropping");
                report.dropped_writes += 1;
            }
        }

        let alert = Alert {
            label: label.to_string(),
            message: alert_message(
                label,
                &now.format(TIMESTAMP_FORMAT).to_string(),
                &evidence_path,
            ),
            evidence_path,
        };
        if let Err(e) = self.deliver(alert).await {
            tracing::warn!(label, error = %e, "notification failed");
        }
    }

    async fn write_snapshot(&self, image: Arc<RgbImage>, filename: String) -> Result<PathBuf, PipelineError> {
        let writer = Arc::clone(&self.shared.snapshots);
        let path = tokio::task::spawn_blocking(move || writer.write(&image, &filename)).await??;
        Ok(path)
    }

    async fn record_event(
        &self,
        label: &str,
        now: NaiveDateTime,
        evidence_path: &str,
    ) -> Result<Event, PipelineError> {
        let journal = &self.shared.journal;
        match journal.record_unknown(label, now, evidence_path).await {
            Ok(event) => Ok(event),
            Err(e) => {
                tracing::warn!(label, error = %e, "event write failed; retrying once");
                Ok(journal.record_unknown(label, now, evidence_path).await?)
            }
        }
    }

    async fn deliver(&self, alert: Alert) -> Result<(), PipelineError> {
        let sink = Arc::clone(&self.shared.sink);
        tokio::task::spawn_blocking(move || sink.notify(&alert)).await??;
        Ok(())
    }
}
