//! relay_events - follow a camera's detection events
//!
//! Optionally asks a running relayd to start the camera, then subscribes to
//! `<prefix>/<camera>/person` and logs every count received.

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use rumqttc::v5::{mqttbytes::QoS, Client, Event, Incoming, MqttOptions};
use serde::Deserialize;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::path::PathBuf;
use std::time::Duration;

use frame_relay::notify::{event_topic, parse_mqtt_endpoint, TlsMaterials, DEFAULT_TOPIC_PREFIX};
use frame_relay::SourceDescriptor;

#[derive(Parser, Debug)]
#[command(author, version, about = "Subscribe to a camera's detection events")]
struct Args {
    /// Camera id.
    #[arg(long, default_value = "cam1")]
    camera: String,

    /// Source to start the camera with (device index or URL). When absent
    /// the camera is assumed to be running already.
    #[arg(long)]
    source: Option<String>,

    /// relayd HTTP address.
    #[arg(long, env = "RELAY_API_ADDR", default_value = "127.0.0.1:8000")]
    api_addr: String,

    /// MQTT broker address.
    #[arg(long, env = "RELAY_MQTT_BROKER", default_value = "127.0.0.1:1883")]
    mqtt_broker: String,

    #[arg(long, env = "RELAY_MQTT_TOPIC_PREFIX", default_value = DEFAULT_TOPIC_PREFIX)]
    topic_prefix: String,

    #[arg(long, env = "MQTT_USERNAME")]
    mqtt_username: Option<String>,

    #[arg(long, env = "MQTT_PASSWORD")]
    mqtt_password: Option<String>,

    #[arg(long, env = "MQTT_USE_TLS")]
    mqtt_use_tls: bool,

    #[arg(long, env = "MQTT_TLS_CA_PATH")]
    mqtt_tls_ca_path: Option<PathBuf>,
}

#[derive(Debug, Deserialize)]
struct CountPayload {
    count: u32,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();
    frame_relay::validate_camera_id(&args.camera)?;

    if let Some(source) = &args.source {
        let addr: SocketAddr = args
            .api_addr
            .parse()
            .with_context(|| format!("invalid api address '{}'", args.api_addr))?;
        let body = serde_json::json!({
            "id": args.camera,
            "url": SourceDescriptor::parse(source),
        });
        match post_json(addr, "/stream/start", &body) {
            Ok(reply) => log::info!("[API] {}", reply),
            Err(e) => log::error!("could not start stream via API: {:#}", e),
        }
    }

    let endpoint = parse_mqtt_endpoint(&args.mqtt_broker, args.mqtt_use_tls)?;
    let tls = TlsMaterials::load(args.mqtt_tls_ca_path.as_deref(), None, None)?;
    let client_id = format!("relay-events-{:08x}", rand::random::<u32>());
    let topic = event_topic(&args.topic_prefix, &args.camera);

    loop {
        let mut options = MqttOptions::new(&client_id, &endpoint.host, endpoint.port);
        options.set_keep_alive(Duration::from_secs(60));
        options.set_clean_start(true);
        if let Some(user) = args.mqtt_username.as_deref() {
            options.set_credentials(user, args.mqtt_password.as_deref().unwrap_or_default());
        }
        options.set_transport(tls.build_transport(&endpoint)?);

        let (client, mut connection) = Client::new(options, 10);
        client.subscribe(topic.as_str(), QoS::AtMostOnce)?;
        log::info!("[MQTT] subscribed to {}", topic);

        for event in connection.iter() {
            match event {
                Ok(Event::Incoming(Incoming::Publish(publish))) => {
                    let topic = String::from_utf8_lossy(&publish.topic);
                    match serde_json::from_slice::<CountPayload>(&publish.payload) {
                        Ok(payload) => log::info!("[MQTT] {} -> count={}", topic, payload.count),
                        Err(e) => log::warn!("[MQTT] {} -> unreadable payload: {}", topic, e),
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    log::error!("MQTT connection error: {}. Reconnecting...", e);
                    break;
                }
            }
        }
        std::thread::sleep(Duration::from_secs(5));
    }
}

fn post_json(addr: SocketAddr, path: &str, body: &serde_json::Value) -> Result<String> {
    let payload = serde_json::to_vec(body)?;
    let mut stream = TcpStream::connect_timeout(&addr, Duration::from_secs(5))?;
    // Opening a source can take a while.
    stream.set_read_timeout(Some(Duration::from_secs(30)))?;

    let request = format!(
        "POST {path} HTTP/1.1\r\nHost: {host}\r\nContent-Type: application/json\r\nContent-Length: {len}\r\nConnection: close\r\n\r\n",
        path = path,
        host = addr,
        len = payload.len()
    );
    stream.write_all(request.as_bytes())?;
    stream.write_all(&payload)?;

    let mut response = Vec::new();
    stream.read_to_end(&mut response)?;
    let header_end = response
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .ok_or_else(|| anyhow!("invalid http response"))?;
    let (header, body) = response.split_at(header_end + 4);
    let header_text = String::from_utf8_lossy(header);
    let status_code = header_text
        .lines()
        .next()
        .and_then(|line| line.split_whitespace().nth(1))
        .ok_or_else(|| anyhow!("missing status code"))?;
    if status_code != "200" {
        return Err(anyhow!(
            "relay api returned status {}: {}",
            status_code,
            String::from_utf8_lossy(body)
        ));
    }
    Ok(String::from_utf8_lossy(body).into_owned())
}
