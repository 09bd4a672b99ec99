use anyhow::{anyhow, Context, Result};
use rumqttc::v5::{mqttbytes::QoS, Client, Connection, Event, MqttOptions};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;

use super::tls::{parse_mqtt_endpoint, TlsMaterials};
use super::{event_topic, EventNotifier, DEFAULT_TOPIC_PREFIX};
use crate::frame::DetectionEvent;

const RECONNECT_PAUSE: Duration = Duration::from_secs(1);
const REQUEST_CAPACITY: usize = 64;

/// Broker connection settings.
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct MqttSettings {
    /// `host:port` or a `mqtt://` / `mqtts://` address.
    pub broker: String,
    pub topic_prefix: String,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub use_tls: bool,
    pub ca_path: Option<PathBuf>,
    pub client_cert_path: Option<PathBuf>,
    pub client_key_path: Option<PathBuf>,
    pub keep_alive_secs: u64,
}

impl Default for MqttSettings {
    fn default() -> Self {
        Self {
            broker: "127.0.0.1:1883".to_string(),
            topic_prefix: DEFAULT_TOPIC_PREFIX.to_string(),
            client_id: "frame-relay".to_string(),
            username: None,
            password: None,
            use_tls: false,
            ca_path: None,
            client_cert_path: None,
            client_key_path: None,
            keep_alive_secs: 30,
        }
    }
}

/// Publishes `{"count":N}` at QoS 0 to `<prefix>/<camera_id>/person`.
///
/// Publishing never blocks: when the request queue is full the event is
/// dropped with an error. A driver thread owns the connection and keeps
/// reconnecting until `disconnect`.
pub struct MqttNotifier {
    client: Client,
    topic_prefix: String,
    shutdown: Arc<AtomicBool>,
    driver: Mutex<Option<JoinHandle<()>>>,
}

impl MqttNotifier {
    pub fn connect(settings: &MqttSettings) -> Result<Self> {
        let endpoint = parse_mqtt_endpoint(&settings.broker, settings.use_tls)?;
        let tls = TlsMaterials::load(
            settings.ca_path.as_deref(),
            settings.client_cert_path.as_deref(),
            settings.client_key_path.as_deref(),
        )?;

        let mut options = MqttOptions::new(&settings.client_id, &endpoint.host, endpoint.port);
        options.set_keep_alive(Duration::from_secs(settings.keep_alive_secs.max(5)));
        options.set_clean_start(true);
        if let Some(user) = settings.username.as_deref() {
            options.set_credentials(user, settings.password.as_deref().unwrap_or_default());
        }
        options.set_transport(tls.build_transport(&endpoint)?);

        let (client, connection) = Client::new(options, REQUEST_CAPACITY);
        let shutdown = Arc::new(AtomicBool::new(false));
        let driver = spawn_driver(connection, Arc::clone(&shutdown))?;
        log::info!(
            "MQTT notifier for {}:{} (TLS: {}, auth: {})",
            endpoint.host,
            endpoint.port,
            endpoint.use_tls,
            settings.username.is_some()
        );

        Ok(Self {
            client,
            topic_prefix: settings.topic_prefix.clone(),
            shutdown,
            driver: Mutex::new(Some(driver)),
        })
    }

    /// Disconnect from the broker and join the driver thread.
    pub fn disconnect(&self) -> Result<()> {
        self.shutdown.store(true, Ordering::SeqCst);
        let result = self.client.disconnect();
        let handle = self
            .driver
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
        result.map_err(|e| anyhow!("MQTT disconnect failed: {}", e))
    }
}

impl EventNotifier for MqttNotifier {
    fn publish(&self, event: &DetectionEvent) -> Result<()> {
        let topic = event_topic(&self.topic_prefix, &event.camera_id);
        let payload = event.payload_json()?;
        self.client
            .try_publish(topic.as_str(), QoS::AtMostOnce, false, payload)
            .with_context(|| format!("MQTT publish to {} failed", topic))
    }
}

impl Drop for MqttNotifier {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }
}

fn spawn_driver(mut connection: Connection, shutdown: Arc<AtomicBool>) -> Result<JoinHandle<()>> {
    std::thread::Builder::new()
        .name("mqtt-driver".into())
        .spawn(move || {
            for event in connection.iter() {
                if shutdown.load(Ordering::SeqCst) {
                    break;
                }
                match event {
                    Ok(Event::Incoming(_)) | Ok(Event::Outgoing(_)) => {}
                    Err(e) => {
                        log::warn!("MQTT connection error: {}", e);
                        std::thread::sleep(RECONNECT_PAUSE);
                    }
                }
            }
            log::debug!("MQTT driver stopped");
        })
        .context("failed to spawn MQTT driver thread")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn settings_defaults() {
        let settings = MqttSettings::default();
        assert_eq!(settings.topic_prefix, "events");
        assert!(!settings.use_tls);
    }

    #[test]
    fn settings_reject_unknown_fields() {
        let parsed: Result<MqttSettings, _> = serde_json::from_str(r#"{"brokr":"x:1"}"#);
        assert!(parsed.is_err());
        let parsed: MqttSettings =
            serde_json::from_str(r#"{"broker":"mqtts://b:8883"}"#).unwrap();
        assert_eq!(parsed.broker, "mqtts://b:8883");
        assert_eq!(parsed.client_id, "frame-relay");
    }

    #[test]
    fn connect_rejects_bad_broker() {
        let settings = MqttSettings {
            broker: "no-port".into(),
            ..MqttSettings::default()
        };
        assert!(MqttNotifier::connect(&settings).is_err());
    }

    #[test]
    fn publish_queues_without_broker() -> Result<()> {
        // Nothing listens on port 1; the request still queues.
        let settings = MqttSettings {
            broker: "127.0.0.1:1".into(),
            ..MqttSettings::default()
        };
        let notifier = MqttNotifier::connect(&settings)?;
        notifier.publish(&DetectionEvent::new("cam1", 1))?;
        let _ = notifier.disconnect();
        Ok(())
    }
}
