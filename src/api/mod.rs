//! Loopback HTTP control surface and pull transport.
//!
//! Routes:
//! - `GET /health`
//! - `GET /status`: running ids plus per-stream counters
//! - `GET /video/{id}`: MJPEG stream from the pull sink
//! - `GET /snapshot/{id}`: one JPEG
//! - `POST /stream/start` with `{"id": .., "url": ..}`
//! - `POST /stream/stop` with `{"id": ..}`

pub mod http;
pub mod mjpeg;

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use self::http::{read_request, write_error, write_json, write_response, HttpRequest, Incoming};
use crate::frame::AnnotatedFrame;
use crate::ingest::SourceDescriptor;
use crate::registry::StreamRegistry;
use crate::validate_camera_id;

const ACCEPT_POLL: Duration = Duration::from_millis(50);
const PEEK_TIMEOUT: Duration = Duration::from_millis(1);

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct ApiConfig {
    pub addr: String,
    pub jpeg_quality: u8,
    /// How long `/snapshot` waits for a first frame.
    pub snapshot_wait_ms: u64,
    /// Pull sink polling period for `/video` and `/snapshot`.
    pub poll_interval_ms: u64,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            addr: "127.0.0.1:8000".to_string(),
            jpeg_quality: mjpeg::DEFAULT_JPEG_QUALITY,
            snapshot_wait_ms: 2_000,
            poll_interval_ms: 50,
        }
    }
}

impl ApiConfig {
    fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }
}

#[derive(Debug)]
pub struct ApiHandle {
    pub addr: SocketAddr,
    shutdown: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl ApiHandle {
    pub fn stop(mut self) -> Result<()> {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(join) = self.join.take() {
            join.join()
                .map_err(|_| anyhow!("api server thread panicked"))?;
        }
        Ok(())
    }
}

pub struct ApiServer {
    cfg: ApiConfig,
    registry: StreamRegistry,
}

struct ServerContext {
    cfg: ApiConfig,
    registry: StreamRegistry,
    shutdown: Arc<AtomicBool>,
}

impl ApiServer {
    pub fn new(cfg: ApiConfig, registry: StreamRegistry) -> Self {
        Self { cfg, registry }
    }

    pub fn spawn(self) -> Result<ApiHandle> {
        let configured_addr: SocketAddr = self.cfg.addr.parse()?;
        let listener = TcpListener::bind(configured_addr)?;
        let addr = listener.local_addr()?;
        if configured_addr.ip().is_loopback() && !addr.ip().is_loopback() {
            return Err(anyhow!(
                "api configured for loopback address '{}', but bound to non-loopback address '{}'",
                configured_addr,
                addr
            ));
        }
        listener.set_nonblocking(true)?;

        let shutdown = Arc::new(AtomicBool::new(false));
        let ctx = Arc::new(ServerContext {
            cfg: self.cfg,
            registry: self.registry,
            shutdown: Arc::clone(&shutdown),
        });
        let join = std::thread::Builder::new()
            .name("relay-api".into())
            .spawn(move || {
                if let Err(err) = run_api(listener, ctx) {
                    log::error!("relay api stopped: {}", err);
                }
            })?;
        log::info!("relay api listening on http://{}", addr);

        Ok(ApiHandle {
            addr,
            shutdown,
            join: Some(join),
        })
    }
}

fn run_api(listener: TcpListener, ctx: Arc<ServerContext>) -> Result<()> {
    loop {
        if ctx.shutdown.load(Ordering::SeqCst) {
            break;
        }
        match listener.accept() {
            Ok((stream, _)) => {
                let conn_ctx = Arc::clone(&ctx);
                let spawned = std::thread::Builder::new()
                    .name("relay-api-conn".into())
                    .spawn(move || {
                        if let Err(err) = handle_connection(stream, &conn_ctx) {
                            log::warn!("relay api request rejected: {}", err);
                        }
                    });
                if let Err(err) = spawned {
                    log::warn!("relay api connection dropped: {}", err);
                }
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(ACCEPT_POLL);
                continue;
            }
            Err(err) => return Err(err.into()),
        }
    }
    Ok(())
}

fn handle_connection(mut stream: TcpStream, ctx: &ServerContext) -> Result<()> {
    stream.set_nonblocking(false)?;
    let peer = stream.peer_addr()?;
    let local = stream.local_addr()?;
    if local.ip().is_loopback() && !peer.ip().is_loopback() {
        write_error(&mut stream, 403, "forbidden")?;
        return Ok(());
    }

    stream.set_read_timeout(Some(http::READ_TIMEOUT))?;
    let request = match read_request(&mut stream)? {
        Incoming::Request(request) => request,
        Incoming::TooLarge => {
            write_error(&mut stream, 413, "request_too_large")?;
            return Ok(());
        }
    };
    log::debug!("relay api {} {}", request.method, request.path);

    let segments: Vec<&str> = request
        .path
        .trim_start_matches('/')
        .trim_end_matches('/')
        .split('/')
        .collect();
    match segments.as_slice() {
        ["health"] => {
            if allow(&mut stream, &request, "GET")? {
                write_json(&mut stream, 200, &serde_json::json!({ "status": "ok" }))?;
            }
        }
        ["status"] => {
            if allow(&mut stream, &request, "GET")? {
                let body = serde_json::json!({
                    "active_streams": ctx.registry.list(),
                    "streams": ctx.registry.statuses(),
                });
                write_json(&mut stream, 200, &body)?;
            }
        }
        ["video", id] => {
            if allow(&mut stream, &request, "GET")? && valid_id(&mut stream, id)? {
                serve_video(&mut stream, ctx, id)?;
            }
        }
        ["snapshot", id] => {
            if allow(&mut stream, &request, "GET")? && valid_id(&mut stream, id)? {
                serve_snapshot(&mut stream, ctx, id)?;
            }
        }
        ["stream", "start"] => {
            if allow(&mut stream, &request, "POST")? {
                handle_start(&mut stream, ctx, &request)?;
            }
        }
        ["stream", "stop"] => {
            if allow(&mut stream, &request, "POST")? {
                handle_stop(&mut stream, ctx, &request)?;
            }
        }
        _ => write_error(&mut stream, 404, "not_found")?,
    }
    Ok(())
}

fn allow(stream: &mut TcpStream, request: &HttpRequest, method: &str) -> Result<bool> {
    if request.method != method {
        write_error(stream, 405, "method_not_allowed")?;
        return Ok(false);
    }
    Ok(true)
}

fn valid_id(stream: &mut TcpStream, id: &str) -> Result<bool> {
    if validate_camera_id(id).is_err() {
        write_error(stream, 400, "invalid_id")?;
        return Ok(false);
    }
    Ok(true)
}

#[derive(Debug, Deserialize)]
struct StartRequest {
    id: String,
    #[serde(alias = "source")]
    url: SourceDescriptor,
}

#[derive(Debug, Deserialize)]
struct StopRequest {
    id: String,
}

fn handle_start(stream: &mut TcpStream, ctx: &ServerContext, request: &HttpRequest) -> Result<()> {
    let body: StartRequest = match serde_json::from_slice(&request.body) {
        Ok(body) => body,
        Err(_) => return write_error(stream, 400, "bad_request"),
    };
    if !valid_id(stream, &body.id)? {
        return Ok(());
    }
    match ctx.registry.start(&body.id, body.url) {
        Ok(outcome) => write_json(
            stream,
            200,
            &serde_json::json!({ "status": outcome.as_str(), "id": body.id }),
        ),
        Err(err) => {
            log::warn!("[{}] start failed: {:#}", body.id, err);
            write_error(stream, 500, "internal_error")
        }
    }
}

fn handle_stop(stream: &mut TcpStream, ctx: &ServerContext, request: &HttpRequest) -> Result<()> {
    let body: StopRequest = match serde_json::from_slice(&request.body) {
        Ok(body) => body,
        Err(_) => return write_error(stream, 400, "bad_request"),
    };
    if !valid_id(stream, &body.id)? {
        return Ok(());
    }
    let outcome = ctx.registry.stop(&body.id);
    write_json(
        stream,
        200,
        &serde_json::json!({ "status": outcome.as_str(), "id": body.id }),
    )
}

fn serve_snapshot(stream: &mut TcpStream, ctx: &ServerContext, id: &str) -> Result<()> {
    let pull = ctx.registry.pull_sink();
    let deadline = Instant::now() + Duration::from_millis(ctx.cfg.snapshot_wait_ms);
    loop {
        if let Some(frame) = pull.read(id) {
            let jpeg = mjpeg::encode_jpeg(&frame, ctx.cfg.jpeg_quality)?;
            return write_response(stream, 200, "image/jpeg", &jpeg);
        }
        if Instant::now() >= deadline || ctx.shutdown.load(Ordering::SeqCst) {
            return write_error(stream, 404, "no_frame");
        }
        std::thread::sleep(ctx.cfg.poll_interval());
    }
}

/// Streams until the client disconnects or the server shuts down.
fn serve_video(stream: &mut TcpStream, ctx: &ServerContext, id: &str) -> Result<()> {
    let pull = ctx.registry.pull_sink();
    mjpeg::write_stream_header(stream)?;
    stream.set_read_timeout(Some(PEEK_TIMEOUT))?;

    let mut last: Option<Arc<AnnotatedFrame>> = None;
    let mut parts = 0u64;
    while !ctx.shutdown.load(Ordering::SeqCst) {
        match pull.read(id) {
            Some(frame) if !last.as_ref().is_some_and(|prev| Arc::ptr_eq(prev, &frame)) => {
                let jpeg = mjpeg::encode_jpeg(&frame, ctx.cfg.jpeg_quality)?;
                if mjpeg::write_part(stream, &jpeg).is_err() {
                    break;
                }
                parts += 1;
                last = Some(frame);
            }
            _ => {
                if client_gone(stream) {
                    break;
                }
            }
        }
        std::thread::sleep(ctx.cfg.poll_interval());
    }
    log::debug!("[{}] mjpeg client left after {} frames", id, parts);
    Ok(())
}

fn client_gone(stream: &TcpStream) -> bool {
    let mut peeked = [0u8; 1];
    match stream.peek(&mut peeked) {
        Ok(0) => true,
        Ok(_) => false,
        Err(err) => !matches!(
            err.kind(),
            std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
        ),
    }
}
