use gatewatch_core::{Metric, RepresentativePolicy, MIN_COOLDOWN_MS};
use gatewatch_vision::DEFAULT_EXTRACT_TIMEOUT;
use serde::Deserialize;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("malformed config {path}: {source}")]
    Parse {
        path: String,
        source: toml::de::Error,
    },
    #[error("{key}={value:?}: {reason}")]
    InvalidValue {
        key: &'static str,
        value: String,
        reason: String,
    },
    #[error("no video source configured (set GATEWATCH_SOURCE or add a [[streams]] entry)")]
    MissingSource,
    #[error("no embedding extractor configured (set GATEWATCH_EXTRACTOR)")]
    MissingExtractor,
    #[error("duplicate stream name '{0}'")]
    DuplicateStream(String),
    #[error("stream '{name}': unsupported source '{uri}' (expected a frame directory or v4l2:/dev/videoN)")]
    UnsupportedSource { name: String, uri: String },
}

/// One camera stream: a name for logs and the frame source behind it.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct StreamConfig {
    pub name: String,
    pub source: String,
}

/// Where a stream's frames come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceKind {
    /// Replay still images from a directory.
    Directory(PathBuf),
    /// Live capture from a V4L2 device node.
    V4l2(PathBuf),
}

impl StreamConfig {
    /// Parse `source`: `v4l2:/dev/videoN`, `dir:PATH` or a bare directory path.
    pub fn source_kind(&self) -> Result<SourceKind, ConfigError> {
        let raw = self.source.trim();
        let unsupported = || ConfigError::UnsupportedSource {
            name: self.name.clone(),
            uri: self.source.clone(),
        };
        if let Some(device) = raw.strip_prefix("v4l2:") {
            let device = device.trim();
            if device.is_empty() || device.contains("://") {
                return Err(unsupported());
            }
            return Ok(SourceKind::V4l2(PathBuf::from(device)));
        }
        let path = raw.strip_prefix("dir:").unwrap_or(raw);
        if path.contains("://") {
            return Err(unsupported());
        }
        Ok(SourceKind::Directory(PathBuf::from(path)))
    }
}

/// Daemon configuration: TOML file, then `GATEWATCH_*` environment overrides.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub streams: Vec<StreamConfig>,
    /// JSON gallery file or a directory of reference photos.
    pub gallery_path: PathBuf,
    /// Path to the SQLite journal.
    pub db_path: PathBuf,
    /// Where alert snapshots are written.
    pub snapshot_dir: PathBuf,
    /// External embedding extractor command line.
    pub extractor_command: Option<String>,
    pub embedding_dim: usize,
    pub metric: Metric,
    /// Maximum distance for a gallery match (strictly below).
    pub match_tolerance: f32,
    /// Maximum distance for joining an unknown cluster (strictly below).
    pub cluster_tolerance: f32,
    /// Minimum time between two alerts for the same identity.
    pub alert_cooldown_secs: f64,
    pub motion_pixel_threshold: u8,
    pub motion_min_pixels: usize,
    pub representative: RepresentativePolicy,
    /// Also alert (throttled) when a known identity is seen.
    pub alert_on_known: bool,
    /// Delay before retrying after a frame could not be read.
    pub frame_retry_secs: u64,
    /// How often stale throttle keys are dropped; 0 disables.
    pub throttle_prune_secs: u64,
    /// An extractor run still going after this long is killed.
    pub extract_timeout_secs: f64,
    /// Telegram bot delivery; enabled when both are set.
    pub telegram_bot_token: Option<String>,
    pub telegram_chat_id: Option<String>,
    /// SMTP delivery; enabled when `smtp_host` is set.
    pub smtp_host: Option<String>,
    pub smtp_port: u16,
    pub smtp_username: Option<String>,
    pub smtp_password: Option<String>,
    /// Sender address; defaults to `smtp_username`.
    pub smtp_from: Option<String>,
    pub smtp_to: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            streams: Vec::new(),
            gallery_path: PathBuf::from("known_faces"),
            db_path: PathBuf::from("alerts.db"),
            snapshot_dir: PathBuf::from("snapshots"),
            extractor_command: None,
            embedding_dim: 128,
            metric: Metric::Euclidean,
            match_tolerance: 0.6,
            cluster_tolerance: 0.6,
            alert_cooldown_secs: 300.0,
            motion_pixel_threshold: 25,
            motion_min_pixels: 1,
            representative: RepresentativePolicy::Fixed,
            alert_on_known: false,
            frame_retry_secs: 3,
            throttle_prune_secs: 3600,
            extract_timeout_secs: DEFAULT_EXTRACT_TIMEOUT.as_secs_f64(),
            telegram_bot_token: None,
            telegram_chat_id: None,
            smtp_host: None,
            smtp_port: 587,
            smtp_username: None,
            smtp_password: None,
            smtp_from: None,
            smtp_to: Vec::new(),
        }
    }
}

impl Config {
    /// Load from an optional TOML file, apply environment overrides, validate.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        toml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })
    }

    /// Apply `GATEWATCH_*` overrides from `lookup`. A variable that is set but
    /// does not parse is an error; it never falls back to the default.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<(), ConfigError> {
        if let Some(source) = lookup("GATEWATCH_SOURCE") {
            self.streams = vec![StreamConfig {
                name: "main".into(),
                source,
            }];
        }
        if let Some(v) = lookup("GATEWATCH_GALLERY") {
            self.gallery_path = PathBuf::from(v);
        }
        if let Some(v) = lookup("GATEWATCH_DB_PATH") {
            self.db_path = PathBuf::from(v);
        }
        if let Some(v) = lookup("GATEWATCH_SNAPSHOT_DIR") {
            self.snapshot_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("GATEWATCH_EXTRACTOR") {
            self.extractor_command = Some(v);
        }
        if let Some(v) = lookup("GATEWATCH_TELEGRAM_BOT_TOKEN") {
            self.telegram_bot_token = Some(v);
        }
        if let Some(v) = lookup("GATEWATCH_TELEGRAM_CHAT_ID") {
            self.telegram_chat_id = Some(v);
        }
        if let Some(v) = lookup("GATEWATCH_SMTP_HOST") {
            self.smtp_host = Some(v);
        }
        if let Some(v) = lookup("GATEWATCH_SMTP_USERNAME") {
            self.smtp_username = Some(v);
        }
        if let Some(v) = lookup("GATEWATCH_SMTP_PASSWORD") {
            self.smtp_password = Some(v);
        }
        if let Some(v) = lookup("GATEWATCH_SMTP_FROM") {
            self.smtp_from = Some(v);
        }
        if let Some(v) = lookup("GATEWATCH_SMTP_TO") {
            self.smtp_to = v
                .split(',')
                .map(str::trim)
                .filter(|addr| !addr.is_empty())
                .map(str::to_owned)
                .collect();
        }

        override_parsed(&lookup, "GATEWATCH_EMBEDDING_DIM", &mut self.embedding_dim)?;
        override_parsed(&lookup, "GATEWATCH_METRIC", &mut self.metric)?;
        override_parsed(&lookup, "GATEWATCH_MATCH_TOLERANCE", &mut self.match_tolerance)?;
        override_parsed(&lookup, "GATEWATCH_CLUSTER_TOLERANCE", &mut self.cluster_tolerance)?;
        // Legacy name first so the explicit one wins.
        override_parsed(&lookup, "ALERT_INTERVAL", &mut self.alert_cooldown_secs)?;
        override_parsed(&lookup, "GATEWATCH_ALERT_COOLDOWN_SECS", &mut self.alert_cooldown_secs)?;
        override_parsed(&lookup, "GATEWATCH_MOTION_PIXEL_THRESHOLD", &mut self.motion_pixel_threshold)?;
        override_parsed(&lookup, "GATEWATCH_MOTION_MIN_PIXELS", &mut self.motion_min_pixels)?;
        override_parsed(&lookup, "GATEWATCH_REPRESENTATIVE", &mut self.representative)?;
        override_parsed(&lookup, "GATEWATCH_FRAME_RETRY_SECS", &mut self.frame_retry_secs)?;
        override_parsed(&lookup, "GATEWATCH_THROTTLE_PRUNE_SECS", &mut self.throttle_prune_secs)?;
        override_parsed(&lookup, "GATEWATCH_EXTRACT_TIMEOUT_SECS", &mut self.extract_timeout_secs)?;
        override_parsed(&lookup, "GATEWATCH_SMTP_PORT", &mut self.smtp_port)?;

        if let Some(v) = lookup("GATEWATCH_ALERT_ON_KNOWN") {
            self.alert_on_known = match v.trim() {
                "1" | "true" | "yes" => true,
                "0" | "false" | "no" => false,
                _ => {
                    return Err(ConfigError::InvalidValue {
                        key: "GATEWATCH_ALERT_ON_KNOWN",
                        value: v,
                        reason: "expected true or false".into(),
                    })
                }
            };
        }
        Ok(())
    }

    /// Reject anything the pipeline can't run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.streams.is_empty() {
            return Err(ConfigError::MissingSource);
        }
        let mut names = HashSet::new();
        for stream in &self.streams {
            if stream.source.trim().is_empty() {
                return Err(ConfigError::MissingSource);
            }
            // Names become snapshot subdirectories.
            let name_ok = !stream.name.is_empty()
                && stream
                    .name
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
            if !name_ok {
                return Err(invalid("streams.name", &stream.name, "use letters, digits, '-' or '_'"));
            }
            if !names.insert(stream.name.as_str()) {
                return Err(ConfigError::DuplicateStream(stream.name.clone()));
            }
            stream.source_kind()?;
        }
        if self
            .extractor_command
            .as_deref()
            .map_or(true, |c| c.trim().is_empty())
        {
            return Err(ConfigError::MissingExtractor);
        }

        ensure_positive("match_tolerance", self.match_tolerance as f64)?;
        ensure_positive("cluster_tolerance", self.cluster_tolerance as f64)?;
        ensure_positive("alert_cooldown_secs", self.alert_cooldown_secs)?;
        let min_cooldown = MIN_COOLDOWN_MS as f64 / 1000.0;
        if self.alert_cooldown_secs < min_cooldown {
            return Err(invalid(
                "alert_cooldown_secs",
                &self.alert_cooldown_secs,
                &format!("must be at least {min_cooldown} seconds"),
            ));
        }
        ensure_positive("extract_timeout_secs", self.extract_timeout_secs)?;
        if Duration::try_from_secs_f64(self.extract_timeout_secs).is_err() {
            return Err(invalid("extract_timeout_secs", &self.extract_timeout_secs, "out of range"));
        }
        if self.embedding_dim == 0 {
            return Err(invalid("embedding_dim", &self.embedding_dim, "must be greater than zero"));
        }
        if self.motion_pixel_threshold == 0 {
            return Err(invalid("motion_pixel_threshold", &self.motion_pixel_threshold, "must be 1..=255"));
        }
        if self.motion_min_pixels == 0 {
            return Err(invalid("motion_min_pixels", &self.motion_min_pixels, "must be greater than zero"));
        }

        if self.telegram_bot_token.is_some() != self.telegram_chat_id.is_some() {
            return Err(ConfigError::InvalidValue {
                key: "telegram_chat_id",
                value: self.telegram_chat_id.clone().unwrap_or_default(),
                reason: "telegram_bot_token and telegram_chat_id must be set together".into(),
            });
        }
        if self.smtp_host.is_some() {
            if self.smtp_to.is_empty() {
                return Err(invalid("smtp_to", &"", "at least one recipient is required with smtp_host"));
            }
            if self.smtp_sender().is_none() {
                return Err(invalid("smtp_from", &"", "set smtp_from or smtp_username"));
            }
            if self.smtp_username.is_some() != self.smtp_password.is_some() {
                return Err(invalid(
                    "smtp_password",
                    &"<redacted>",
                    "smtp_username and smtp_password must be set together",
                ));
            }
        }
        Ok(())
    }

    pub fn extract_timeout(&self) -> Duration {
        Duration::try_from_secs_f64(self.extract_timeout_secs).unwrap_or(DEFAULT_EXTRACT_TIMEOUT)
    }

    /// Envelope sender for SMTP alerts.
    pub fn smtp_sender(&self) -> Option<&str> {
        self.smtp_from.as_deref().or(self.smtp_username.as_deref())
    }
}

fn override_parsed<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    slot: &mut T,
) -> Result<(), ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    if let Some(raw) = lookup(key) {
        *slot = raw.trim().parse().map_err(|e: T::Err| ConfigError::InvalidValue {
            key,
            value: raw.clone(),
            reason: e.to_string(),
        })?;
    }
    Ok(())
}

fn ensure_positive(key: &'static str, value: f64) -> Result<(), ConfigError> {
    if value.is_finite() && value > 0.0 {
        Ok(())
    } else {
        Err(invalid(key, &value, "must be a positive number"))
    }
}

fn invalid(key: &'static str, value: &dyn std::fmt::Display, reason: &str) -> ConfigError {
    ConfigError::InvalidValue {
        key,
        value: value.to_string(),
        reason: reason.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    fn minimal() -> Config {
        let mut config = Config::default();
        config
            .apply_overrides(env(&[
                ("GATEWATCH_SOURCE", "/var/lib/gatewatch/frames"),
                ("GATEWATCH_EXTRACTOR", "embed-faces --json"),
            ]))
            .unwrap();
        config
    }

    #[test]
    fn test_defaults_with_required_values() {
        let config = minimal();
        config.validate().unwrap();
        assert_eq!(config.streams[0].name, "main");
        assert_eq!(config.match_tolerance, 0.6);
        assert_eq!(config.alert_cooldown_secs, 300.0);
        assert_eq!(config.metric, Metric::Euclidean);
    }

    #[test]
    fn test_missing_source_is_fatal() {
        let mut config = Config::default();
        config
            .apply_overrides(env(&[("GATEWATCH_EXTRACTOR", "embed")]))
            .unwrap();
        assert!(matches!(config.validate(), Err(ConfigError::MissingSource)));
    }

    #[test]
    fn test_missing_extractor_is_fatal() {
        let mut config = Config::default();
        config
            .apply_overrides(env(&[("GATEWATCH_SOURCE", "frames")]))
            .unwrap();
        assert!(matches!(config.validate(), Err(ConfigError::MissingExtractor)));
    }

    #[test]
    fn test_malformed_tolerance_is_error_not_default() {
        let mut config = Config::default();
        let err = config
            .apply_overrides(env(&[("GATEWATCH_MATCH_TOLERANCE", "abc")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { key: "GATEWATCH_MATCH_TOLERANCE", .. }));
    }

    #[test]
    fn test_non_positive_values_rejected() {
        for (key, value) in [
            ("GATEWATCH_MATCH_TOLERANCE", "0"),
            ("GATEWATCH_CLUSTER_TOLERANCE", "-0.5"),
            ("GATEWATCH_ALERT_COOLDOWN_SECS", "NaN"),
            ("GATEWATCH_MOTION_PIXEL_THRESHOLD", "0"),
        ] {
            let mut config = minimal();
            config.apply_overrides(env(&[(key, value)])).unwrap();
            assert!(config.validate().is_err(), "{key}={value} should be rejected");
        }
    }

    #[test]
    fn test_legacy_alert_interval() {
        let mut config = minimal();
        config.apply_overrides(env(&[("ALERT_INTERVAL", "60")])).unwrap();
        assert_eq!(config.alert_cooldown_secs, 60.0);

        config
            .apply_overrides(env(&[("ALERT_INTERVAL", "60"), ("GATEWATCH_ALERT_COOLDOWN_SECS", "90")]))
            .unwrap();
        assert_eq!(config.alert_cooldown_secs, 90.0);
    }

    #[test]
    fn test_metric_and_policy_overrides() {
        let mut config = minimal();
        config
            .apply_overrides(env(&[
                ("GATEWATCH_METRIC", "cosine"),
                ("GATEWATCH_REPRESENTATIVE", "centroid"),
                ("GATEWATCH_ALERT_ON_KNOWN", "true"),
            ]))
            .unwrap();
        assert_eq!(config.metric, Metric::Cosine);
        assert_eq!(config.representative, RepresentativePolicy::Centroid);
        assert!(config.alert_on_known);
    }

    #[test]
    fn test_toml_file_with_streams() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gatewatch.toml");
        std::fs::write(
            &path,
            r#"
extractor_command = "embed-faces"
metric = "cosine"
cluster_tolerance = 0.35

[[streams]]
name = "lobby"
source = "dir:/srv/frames/lobby"

[[streams]]
name = "dock"
source = "/srv/frames/dock"
"#,
        )
        .unwrap();

        let config = Config::from_file(&path).unwrap();
        config.validate().unwrap();
        assert_eq!(config.streams.len(), 2);
        assert_eq!(
            config.streams[0].source_kind().unwrap(),
            SourceKind::Directory(PathBuf::from("/srv/frames/lobby"))
        );
        assert_eq!(config.cluster_tolerance, 0.35);
        assert_eq!(config.metric, Metric::Cosine);
        // Untouched keys keep defaults.
        assert_eq!(config.match_tolerance, 0.6);
    }

    #[test]
    fn test_duplicate_stream_names() {
        let mut config = minimal();
        config.streams.push(config.streams[0].clone());
        assert!(matches!(config.validate(), Err(ConfigError::DuplicateStream(_))));
    }

    #[test]
    fn test_stream_name_must_be_path_safe() {
        let mut config = minimal();
        config.streams[0].name = "../lobby".into();
        assert!(matches!(config.validate(), Err(ConfigError::InvalidValue { key: "streams.name", .. })));
    }

    #[test]
    fn test_network_source_unsupported() {
        let mut config = minimal();
        config.streams[0].source = "rtsp://camera.local/stream".into();
        assert!(matches!(config.validate(), Err(ConfigError::UnsupportedSource { .. })));
    }

    #[test]
    fn test_v4l2_source() {
        let mut config = minimal();
        config.streams[0].source = "v4l2:/dev/video2".into();
        config.validate().unwrap();
        assert_eq!(
            config.streams[0].source_kind().unwrap(),
            SourceKind::V4l2(PathBuf::from("/dev/video2"))
        );

        config.streams[0].source = "v4l2:".into();
        assert!(matches!(config.validate(), Err(ConfigError::UnsupportedSource { .. })));
    }

    #[test]
    fn test_sub_millisecond_cooldown_rejected() {
        let mut config = minimal();
        config
            .apply_overrides(env(&[("GATEWATCH_ALERT_COOLDOWN_SECS", "0.0004")]))
            .unwrap();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { key: "alert_cooldown_secs", .. })
        ));

        config
            .apply_overrides(env(&[("GATEWATCH_ALERT_COOLDOWN_SECS", "0.001")]))
            .unwrap();
        config.validate().unwrap();
    }

    #[test]
    fn test_extract_timeout() {
        let mut config = minimal();
        assert_eq!(config.extract_timeout(), DEFAULT_EXTRACT_TIMEOUT);
        config
            .apply_overrides(env(&[("GATEWATCH_EXTRACT_TIMEOUT_SECS", "2.5")]))
            .unwrap();
        config.validate().unwrap();
        assert_eq!(config.extract_timeout(), Duration::from_millis(2500));

        for bad in ["0", "-1", "1e300"] {
            config
                .apply_overrides(env(&[("GATEWATCH_EXTRACT_TIMEOUT_SECS", bad)]))
                .unwrap();
            assert!(config.validate().is_err(), "extract timeout {bad} should be rejected");
        }
    }

    #[test]
    fn test_notification_transports() {
        let mut config = minimal();
        config
            .apply_overrides(env(&[
                ("GATEWATCH_TELEGRAM_BOT_TOKEN", "123:abc"),
                ("GATEWATCH_TELEGRAM_CHAT_ID", "-100200"),
                ("GATEWATCH_SMTP_HOST", "smtp.example.com"),
                ("GATEWATCH_SMTP_PORT", "2525"),
                ("GATEWATCH_SMTP_USERNAME", "gate@example.com"),
                ("GATEWATCH_SMTP_PASSWORD", "hunter2"),
                ("GATEWATCH_SMTP_TO", "ops@example.com, guard@example.com,"),
            ]))
            .unwrap();
        config.validate().unwrap();
        assert_eq!(config.smtp_port, 2525);
        assert_eq!(config.smtp_to, vec!["ops@example.com", "guard@example.com"]);
        assert_eq!(config.smtp_sender(), Some("gate@example.com"));
    }

    #[test]
    fn test_incomplete_transports_rejected() {
        let mut config = minimal();
        config.telegram_bot_token = Some("123:abc".into());
        assert!(config.validate().is_err());

        let mut config = minimal();
        config.smtp_host = Some("smtp.example.com".into());
        config.smtp_from = Some("gate@example.com".into());
        assert!(matches!(config.validate(), Err(ConfigError::InvalidValue { key: "smtp_to", .. })));
        config.smtp_to = vec!["ops@example.com".into()];
        config.validate().unwrap();
    }
}
