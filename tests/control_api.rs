use anyhow::{anyhow, Result};
use serde_json::Value;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::Arc;
use std::time::Duration;

use frame_relay::api::{ApiConfig, ApiHandle, ApiServer};
use frame_relay::ingest::CaptureSettings;
use frame_relay::{
    AnnotatorRegistry, Collaborators, DefaultSourceOpener, LogNotifier, StreamRegistry,
    WorkerSettings,
};

struct TestApi {
    registry: StreamRegistry,
    handle: Option<ApiHandle>,
}

impl TestApi {
    fn new() -> Result<Self> {
        let capture = CaptureSettings {
            width: 32,
            height: 24,
            target_fps: 50,
            ..CaptureSettings::default()
        };
        let collaborators = Collaborators::new(
            Arc::new(DefaultSourceOpener::new(capture)),
            AnnotatorRegistry::with_builtin().factory("passthrough")?,
            Arc::new(LogNotifier::new("events")),
        );
        let settings = WorkerSettings {
            open_timeout: Duration::from_secs(2),
            stop_grace: Duration::from_millis(500),
            ..WorkerSettings::default()
        };
        let registry = StreamRegistry::new(collaborators, settings);
        let api_config = ApiConfig {
            addr: "127.0.0.1:0".to_string(),
            snapshot_wait_ms: 2_000,
            poll_interval_ms: 10,
            ..ApiConfig::default()
        };
        let handle = ApiServer::new(api_config, registry.clone()).spawn()?;
        Ok(Self {
            registry,
            handle: Some(handle),
        })
    }

    fn addr(&self) -> Result<SocketAddr> {
        self.handle
            .as_ref()
            .map(|handle| handle.addr)
            .ok_or_else(|| anyhow!("api stopped"))
    }

    fn request(&self, method: &str, path: &str, body: Option<&str>) -> Result<Response> {
        let mut stream = TcpStream::connect(self.addr()?)?;
        stream.set_read_timeout(Some(Duration::from_secs(5)))?;
        let body = body.unwrap_or("");
        let request = format!(
            "{method} {path} HTTP/1.1\r\nHost: localhost\r\nContent-Type: application/json\r\nContent-Length: {len}\r\n\r\n{body}",
            len = body.len()
        );
        stream.write_all(request.as_bytes())?;
        read_response(&mut stream)
    }
}

impl Drop for TestApi {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            let _ = handle.stop();
        }
        self.registry.shutdown();
    }
}

struct Response {
    status: u16,
    headers: String,
    body: Vec<u8>,
}

impl Response {
    fn json(&self) -> Result<Value> {
        Ok(serde_json::from_slice(&self.body)?)
    }
}

fn read_response(stream: &mut TcpStream) -> Result<Response> {
    let mut raw = Vec::new();
    stream.read_to_end(&mut raw)?;
    let split = raw
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .ok_or_else(|| anyhow!("no header terminator"))?;
    let headers = String::from_utf8_lossy(&raw[..split]).into_owned();
    let status = headers
        .split_whitespace()
        .nth(1)
        .ok_or_else(|| anyhow!("no status"))?
        .parse()?;
    Ok(Response {
        status,
        headers,
        body: raw[split + 4..].to_vec(),
    })
}

#[test]
fn health_and_empty_status() -> Result<()> {
    let api = TestApi::new()?;
    let health = api.request("GET", "/health", None)?;
    assert_eq!(health.status, 200);
    assert_eq!(health.json()?["status"], "ok");

    let status = api.request("GET", "/status", None)?;
    assert_eq!(status.status, 200);
    assert_eq!(status.json()?["active_streams"], serde_json::json!([]));
    Ok(())
}

#[test]
fn start_snapshot_and_stop() -> Result<()> {
    let api = TestApi::new()?;

    let started = api.request(
        "POST",
        "/stream/start",
        Some(r#"{"id":"cam1","url":"stub://lobby"}"#),
    )?;
    assert_eq!(started.status, 200);
    let body = started.json()?;
    assert_eq!(body["status"], "started");
    assert_eq!(body["id"], "cam1");

    let again = api.request(
        "POST",
        "/stream/start",
        Some(r#"{"id":"cam1","url":"stub://lobby"}"#),
    )?;
    assert_eq!(again.json()?["status"], "already_running");

    let status = api.request("GET", "/status", None)?.json()?;
    assert_eq!(status["active_streams"], serde_json::json!(["cam1"]));
    assert_eq!(status["streams"][0]["id"], "cam1");
    assert_eq!(status["streams"][0]["worker"], "running");

    let snapshot = api.request("GET", "/snapshot/cam1", None)?;
    assert_eq!(snapshot.status, 200);
    assert!(snapshot.headers.contains("image/jpeg"));
    assert_eq!(&snapshot.body[..2], &[0xFF, 0xD8]);

    let stopped = api.request("POST", "/stream/stop", Some(r#"{"id":"cam1"}"#))?;
    assert_eq!(stopped.json()?["status"], "stopped");
    let stopped_again = api.request("POST", "/stream/stop", Some(r#"{"id":"cam1"}"#))?;
    assert_eq!(stopped_again.json()?["status"], "not_running");
    Ok(())
}

#[test]
fn unavailable_source_is_reported() -> Result<()> {
    let api = TestApi::new()?;
    let response = api.request(
        "POST",
        "/stream/start",
        Some(r#"{"id":"cam2","url":"bad://source"}"#),
    )?;
    assert_eq!(response.status, 200);
    assert_eq!(response.json()?["status"], "source_unavailable");

    let status = api.request("GET", "/status", None)?.json()?;
    assert_eq!(status["active_streams"], serde_json::json!([]));
    Ok(())
}

#[test]
fn oversized_stub_is_unavailable_and_id_stays_free() -> Result<()> {
    let api = TestApi::new()?;
    let response = api.request(
        "POST",
        "/stream/start",
        Some(r#"{"id":"cam3","url":"stub://x?width=4294967295&height=4294967295&fps=0"}"#),
    )?;
    assert_eq!(response.status, 200);
    let body = response.json()?;
    assert_eq!(body["status"], "source_unavailable");

    let retried = api.request(
        "POST",
        "/stream/start",
        Some(r#"{"id":"cam3","url":"stub://ok"}"#),
    )?;
    assert_eq!(retried.json()?["status"], "started");
    Ok(())
}

#[test]
fn video_stream_sends_multipart_jpeg() -> Result<()> {
    let api = TestApi::new()?;
    api.request(
        "POST",
        "/stream/start",
        Some(r#"{"id":"cam1","url":"stub://yard"}"#),
    )?;

    let mut stream = TcpStream::connect(api.addr()?)?;
    stream.set_read_timeout(Some(Duration::from_secs(5)))?;
    stream.write_all(b"GET /video/cam1 HTTP/1.1\r\nHost: localhost\r\n\r\n")?;

    let mut received = Vec::new();
    let mut buf = [0u8; 4096];
    while !String::from_utf8_lossy(&received).contains("Content-Type: image/jpeg") {
        let n = stream.read(&mut buf)?;
        assert!(n > 0, "stream closed early");
        received.extend_from_slice(&buf[..n]);
    }
    let text = String::from_utf8_lossy(&received);
    assert!(text.starts_with("HTTP/1.1 200"));
    assert!(text.contains("multipart/x-mixed-replace; boundary=frame"));
    assert!(text.contains("--frame\r\n"));
    Ok(())
}

#[test]
fn unknown_camera_snapshot_is_404() -> Result<()> {
    let api = TestApi::new()?;
    let response = api.request("GET", "/snapshot/ghost", None)?;
    assert_eq!(response.status, 404);
    assert_eq!(response.json()?["error"], "no_frame");
    Ok(())
}

#[test]
fn rejects_malformed_requests() -> Result<()> {
    let api = TestApi::new()?;

    let wrong_method = api.request("GET", "/stream/start", None)?;
    assert_eq!(wrong_method.status, 405);

    let unknown = api.request("GET", "/nowhere", None)?;
    assert_eq!(unknown.status, 404);

    let bad_json = api.request("POST", "/stream/start", Some("{not json"))?;
    assert_eq!(bad_json.status, 400);
    assert_eq!(bad_json.json()?["error"], "bad_request");

    let bad_id = api.request(
        "POST",
        "/stream/start",
        Some(r#"{"id":"a b","url":"stub://x"}"#),
    )?;
    assert_eq!(bad_id.status, 400);
    assert_eq!(bad_id.json()?["error"], "invalid_id");

    let mut stream = TcpStream::connect(api.addr()?)?;
    stream.set_read_timeout(Some(Duration::from_secs(5)))?;
    stream.write_all(
        b"POST /stream/start HTTP/1.1\r\nHost: localhost\r\nContent-Length: 100000\r\n\r\n",
    )?;
    let too_large = read_response(&mut stream)?;
    assert_eq!(too_large.status, 413);
    Ok(())
}
