use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use crate::api::ApiConfig;
use crate::frame::rgb_buffer_len;
use crate::ingest::{CaptureSettings, SourceDescriptor};
use crate::notify::{parse_mqtt_endpoint, MqttSettings};
use crate::push::{PushSettings, PushTransport};
use crate::worker::WorkerSettings;

const DEFAULT_ANNOTATOR: &str = "motion";

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct RelayConfigFile {
    api: Option<ApiConfig>,
    mqtt: Option<MqttSettings>,
    worker: Option<WorkerConfig>,
    capture: Option<CaptureConfig>,
    push: Option<PushSettings>,
    annotator: Option<String>,
    cameras: Option<Vec<CameraSettings>>,
}

/// Worker timing, in milliseconds on the wire.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct WorkerConfig {
    pub backoff_initial_ms: u64,
    pub backoff_max_ms: u64,
    pub max_consecutive_read_failures: u32,
    pub open_timeout_ms: u64,
    pub stop_grace_ms: u64,
    pub health_log_interval_ms: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        let defaults = WorkerSettings::default();
        Self {
            backoff_initial_ms: defaults.backoff_initial.as_millis() as u64,
            backoff_max_ms: defaults.backoff_max.as_millis() as u64,
            max_consecutive_read_failures: defaults.max_consecutive_read_failures,
            open_timeout_ms: defaults.open_timeout.as_millis() as u64,
            stop_grace_ms: defaults.stop_grace.as_millis() as u64,
            health_log_interval_ms: defaults.health_log_interval.as_millis() as u64,
        }
    }
}

impl WorkerConfig {
    pub fn to_settings(&self) -> WorkerSettings {
        WorkerSettings {
            backoff_initial: Duration::from_millis(self.backoff_initial_ms),
            backoff_max: Duration::from_millis(self.backoff_max_ms),
            max_consecutive_read_failures: self.max_consecutive_read_failures,
            open_timeout: Duration::from_millis(self.open_timeout_ms),
            stop_grace: Duration::from_millis(self.stop_grace_ms),
            health_log_interval: Duration::from_millis(self.health_log_interval_ms),
        }
    }
}

/// Defaults for built-in capture sources.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct CaptureConfig {
    pub width: u32,
    pub height: u32,
    pub target_fps: u32,
    pub read_timeout_ms: u64,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        let defaults = CaptureSettings::default();
        Self {
            width: defaults.width,
            height: defaults.height,
            target_fps: defaults.target_fps,
            read_timeout_ms: defaults.read_timeout.as_millis() as u64,
        }
    }
}

impl CaptureConfig {
    pub fn to_settings(&self) -> CaptureSettings {
        CaptureSettings {
            width: self.width,
            height: self.height,
            target_fps: self.target_fps,
            read_timeout: Duration::from_millis(self.read_timeout_ms),
        }
    }
}

/// A camera started when the daemon comes up.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct CameraSettings {
    pub id: String,
    #[serde(alias = "url")]
    pub source: SourceDescriptor,
}

#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub api: ApiConfig,
    /// `None` publishes events to the log only.
    pub mqtt: Option<MqttSettings>,
    pub worker: WorkerConfig,
    pub capture: CaptureConfig,
    pub push: PushSettings,
    pub annotator: String,
    pub cameras: Vec<CameraSettings>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            api: ApiConfig::default(),
            mqtt: None,
            worker: WorkerConfig::default(),
            capture: CaptureConfig::default(),
            push: PushSettings::default(),
            annotator: DEFAULT_ANNOTATOR.to_string(),
            cameras: Vec::new(),
        }
    }
}

impl RelayConfig {
    /// File named by `RELAY_CONFIG` (if set), then `RELAY_*` overrides.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("RELAY_CONFIG").ok();
        Self::load_from(config_path.as_deref().map(Path::new))
    }

    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let file_cfg = match path {
            Some(path) => read_config_file(path)?,
            None => RelayConfigFile::default(),
        };
        let mut cfg = Self::from_file(file_cfg);
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: RelayConfigFile) -> Self {
        Self {
            api: file.api.unwrap_or_default(),
            mqtt: file.mqtt,
            worker: file.worker.unwrap_or_default(),
            capture: file.capture.unwrap_or_default(),
            push: file.push.unwrap_or_default(),
            annotator: file
                .annotator
                .unwrap_or_else(|| DEFAULT_ANNOTATOR.to_string()),
            cameras: file.cameras.unwrap_or_default(),
        }
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(addr) = std::env::var("RELAY_API_ADDR") {
            if !addr.trim().is_empty() {
                self.api.addr = addr.trim().to_string();
            }
        }
        if let Ok(broker) = std::env::var("RELAY_MQTT_BROKER") {
            if !broker.trim().is_empty() {
                self.mqtt.get_or_insert_with(MqttSettings::default).broker =
                    broker.trim().to_string();
            }
        }
        if let Ok(prefix) = std::env::var("RELAY_MQTT_TOPIC_PREFIX") {
            // Only meaningful once a broker is configured.
            if let Some(mqtt) = self.mqtt.as_mut().filter(|_| !prefix.trim().is_empty()) {
                mqtt.topic_prefix = prefix.trim().to_string();
            }
        }
        if let Ok(annotator) = std::env::var("RELAY_ANNOTATOR") {
            if !annotator.trim().is_empty() {
                self.annotator = annotator.trim().to_string();
            }
        }
        if let Ok(ceiling) = std::env::var("RELAY_MAX_READ_FAILURES") {
            self.worker.max_consecutive_read_failures = ceiling
                .trim()
                .parse()
                .map_err(|_| anyhow!("RELAY_MAX_READ_FAILURES must be a positive integer"))?;
        }
        if let Ok(grace) = std::env::var("RELAY_STOP_GRACE_MS") {
            self.worker.stop_grace_ms = grace.trim().parse().map_err(|_| {
                anyhow!("RELAY_STOP_GRACE_MS must be an integer number of milliseconds")
            })?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        self.api
            .addr
            .parse::<SocketAddr>()
            .map_err(|e| anyhow!("invalid api addr '{}': {}", self.api.addr, e))?;
        if !(1..=100).contains(&self.api.jpeg_quality) {
            return Err(anyhow!("api.jpeg_quality must be between 1 and 100"));
        }
        if let Some(mqtt) = &self.mqtt {
            parse_mqtt_endpoint(&mqtt.broker, mqtt.use_tls)?;
            if mqtt.topic_prefix.trim().is_empty() {
                return Err(anyhow!("mqtt.topic_prefix must not be empty"));
            }
        }

        let worker = &self.worker;
        if worker.max_consecutive_read_failures == 0 {
            return Err(anyhow!("max_consecutive_read_failures must be greater than zero"));
        }
        if worker.backoff_initial_ms == 0 || worker.backoff_max_ms < worker.backoff_initial_ms {
            return Err(anyhow!(
                "backoff must satisfy 0 < backoff_initial_ms <= backoff_max_ms"
            ));
        }
        if worker.open_timeout_ms == 0 {
            return Err(anyhow!("open_timeout_ms must be greater than zero"));
        }
        if self.capture.width == 0 || self.capture.height == 0 {
            return Err(anyhow!("capture width and height must be greater than zero"));
        }
        rgb_buffer_len(self.capture.width, self.capture.height)
            .map_err(|e| anyhow!("capture size: {}", e))?;
        if self.push.enabled && self.push.fps == 0 {
            return Err(anyhow!("push.fps must be greater than zero"));
        }
        if self.push.enabled && self.push.transport == PushTransport::Rtsp {
            if self.push.rtsp_port == 0 {
                return Err(anyhow!("push.rtsp_port must be greater than zero"));
            }
            if !self.push.mount_prefix.starts_with('/') {
                return Err(anyhow!("push.mount_prefix must start with '/'"));
            }
        }
        if self.annotator.trim().is_empty() {
            return Err(anyhow!("annotator must not be empty"));
        }

        let mut seen = HashSet::new();
        for camera in &self.cameras {
            crate::validate_camera_id(&camera.id)?;
            if !seen.insert(camera.id.as_str()) {
                return Err(anyhow!("camera '{}' is configured twice", camera.id));
            }
        }
        Ok(())
    }
}

fn read_config_file(path: &Path) -> Result<RelayConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let is_toml = path
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("toml"));
    let cfg: RelayConfigFile = if is_toml {
        toml::from_str(&raw).map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    } else {
        serde_json::from_str(&raw)
            .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?
    };
    Ok(cfg)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn worker_defaults_round_to_settings() {
        let settings = WorkerConfig::default().to_settings();
        assert_eq!(settings.backoff_initial, Duration::from_millis(10));
        assert_eq!(settings.backoff_max, Duration::from_millis(250));
        assert_eq!(settings.max_consecutive_read_failures, 50);
    }

    #[test]
    fn file_sections_are_optional() -> Result<()> {
        let file: RelayConfigFile =
            serde_json::from_str(r#"{"cameras":[{"id":"cam1","url":0}]}"#)?;
        let cfg = RelayConfig::from_file(file);
        cfg.validate()?;
        assert_eq!(cfg.annotator, "motion");
        assert_eq!(cfg.cameras[0].source, SourceDescriptor::Device(0));
        assert!(cfg.mqtt.is_none());
        Ok(())
    }

    #[test]
    fn validation_rejects_bad_values() {
        let mut cfg = RelayConfig::default();
        cfg.worker.backoff_max_ms = 1;
        assert!(cfg.validate().is_err());

        let mut cfg = RelayConfig::default();
        cfg.cameras = vec![
            CameraSettings {
                id: "a".into(),
                source: SourceDescriptor::Device(0),
            },
            CameraSettings {
                id: "a".into(),
                source: SourceDescriptor::Device(1),
            },
        ];
        assert!(cfg.validate().is_err());

        let mut cfg = RelayConfig::default();
        cfg.api.addr = "nowhere".into();
        assert!(cfg.validate().is_err());

        let mut cfg = RelayConfig::default();
        cfg.capture.width = 100_000;
        assert!(cfg.validate().is_err());

        let mut cfg = RelayConfig::default();
        cfg.push.enabled = true;
        cfg.push.rtsp_port = 0;
        assert!(cfg.validate().is_err());
        cfg.push.transport = PushTransport::Udp;
        assert!(cfg.validate().is_ok());
    }
}
