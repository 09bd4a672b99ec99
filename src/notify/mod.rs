//! Detection event notification.
//!
//! Every processed frame produces one `DetectionEvent`. Delivery is
//! best-effort: a notifier must return promptly, and an error is only ever
//! logged by the worker, never allowed to stop capture.

mod mqtt;
mod tls;

use anyhow::Result;

use crate::frame::DetectionEvent;

pub use mqtt::{MqttNotifier, MqttSettings};
pub use tls::{parse_mqtt_endpoint, MqttEndpoint, TlsMaterials};

/// Default topic prefix; events land on `<prefix>/<camera_id>/person`.
pub const DEFAULT_TOPIC_PREFIX: &str = "events";

/// Fire-and-forget event sink.
pub trait EventNotifier: Send + Sync {
    /// Publish one event without blocking on the transport.
    fn publish(&self, event: &DetectionEvent) -> Result<()>;
}

/// Topic for a camera's events.
pub fn event_topic(prefix: &str, camera_id: &str) -> String {
    format!("{}/{}/person", prefix.trim_end_matches('/'), camera_id)
}

/// Notifier that only writes a debug log record.
#[derive(Clone, Debug, Default)]
pub struct LogNotifier {
    topic_prefix: String,
}

impl LogNotifier {
    pub fn new(topic_prefix: &str) -> Self {
        Self {
            topic_prefix: topic_prefix.to_string(),
        }
    }
}

impl EventNotifier for LogNotifier {
    fn publish(&self, event: &DetectionEvent) -> Result<()> {
        log::debug!(
            "event {} count={} ts={}",
            event_topic(&self.topic_prefix, &event.camera_id),
            event.count,
            event.timestamp_ms
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topic_layout() {
        assert_eq!(event_topic("events", "cam1"), "events/cam1/person");
        assert_eq!(event_topic("site/a/", "cam1"), "site/a/cam1/person");
    }

    #[test]
    fn log_notifier_never_fails() {
        let notifier = LogNotifier::new(DEFAULT_TOPIC_PREFIX);
        assert!(notifier.publish(&DetectionEvent::new("cam1", 2)).is_ok());
    }
}
