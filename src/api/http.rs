//! Minimal HTTP/1.1 request reader and response writers.

use anyhow::{anyhow, Context, Result};
use serde::Serialize;
use std::collections::HashMap;
use std::io::{Read, Write};
use std::time::Duration;

/// Upper bound on request line, headers and body together.
pub const MAX_REQUEST_BYTES: usize = 8192;

pub const READ_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug)]
pub struct HttpRequest {
    pub method: String,
    pub path: String,
    pub query: Option<String>,
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
}

#[derive(Debug)]
pub enum Incoming {
    Request(HttpRequest),
    TooLarge,
}

/// Read one request. Oversized requests are reported, not errors, so the
/// caller can still answer 413.
pub fn read_request<S: Read>(stream: &mut S) -> Result<Incoming> {
    let mut buf = [0u8; 1024];
    let mut data = Vec::new();
    let header_end = loop {
        if let Some(pos) = find_header_end(&data) {
            break pos;
        }
        if data.len() > MAX_REQUEST_BYTES {
            return Ok(Incoming::TooLarge);
        }
        let n = stream.read(&mut buf).context("read request")?;
        if n == 0 {
            return Err(anyhow!("connection closed before request headers"));
        }
        data.extend_from_slice(&buf[..n]);
    };

    let head = String::from_utf8_lossy(&data[..header_end]).into_owned();
    let mut lines = head.split("\r\n");
    let request_line = lines.next().ok_or_else(|| anyhow!("empty request"))?;
    let mut parts = request_line.split_whitespace();
    let method = parts.next().ok_or_else(|| anyhow!("missing method"))?;
    let raw_path = parts.next().ok_or_else(|| anyhow!("missing path"))?;
    let mut headers = HashMap::new();
    for line in lines {
        if let Some((k, v)) = line.split_once(':') {
            headers.insert(k.trim().to_lowercase(), v.trim().to_string());
        }
    }

    let body_start = header_end + 4;
    let content_length = match headers.get("content-length") {
        Some(value) => value
            .parse::<usize>()
            .map_err(|_| anyhow!("invalid content-length '{}'", value))?,
        None => 0,
    };
    if body_start + content_length > MAX_REQUEST_BYTES {
        return Ok(Incoming::TooLarge);
    }
    while data.len() < body_start + content_length {
        let n = stream.read(&mut buf).context("read request body")?;
        if n == 0 {
            return Err(anyhow!("connection closed inside request body"));
        }
        data.extend_from_slice(&buf[..n]);
    }
    let body = data[body_start..body_start + content_length].to_vec();

    let (path, query) = match raw_path.split_once('?') {
        Some((path, query)) => (path.to_string(), Some(query.to_string())),
        None => (raw_path.to_string(), None),
    };
    Ok(Incoming::Request(HttpRequest {
        method: method.to_string(),
        path,
        query,
        headers,
        body,
    }))
}

fn find_header_end(data: &[u8]) -> Option<usize> {
    data.windows(4).position(|w| w == b"\r\n\r\n")
}

fn status_line(status: u16) -> &'static str {
    match status {
        200 => "HTTP/1.1 200 OK",
        400 => "HTTP/1.1 400 Bad Request",
        403 => "HTTP/1.1 403 Forbidden",
        404 => "HTTP/1.1 404 Not Found",
        405 => "HTTP/1.1 405 Method Not Allowed",
        413 => "HTTP/1.1 413 Payload Too Large",
        503 => "HTTP/1.1 503 Service Unavailable",
        _ => "HTTP/1.1 500 Internal Server Error",
    }
}

pub fn write_response<W: Write>(
    stream: &mut W,
    status: u16,
    content_type: &str,
    body: &[u8],
) -> Result<()> {
    let header = format!(
        "{status_line}\r\nContent-Type: {content_type}\r\nContent-Length: {len}\r\nCache-Control: no-store\r\nConnection: close\r\n\r\n",
        status_line = status_line(status),
        content_type = content_type,
        len = body.len()
    );
    stream.write_all(header.as_bytes())?;
    stream.write_all(body)?;
    stream.flush()?;
    Ok(())
}

pub fn write_json<W: Write, T: Serialize>(stream: &mut W, status: u16, value: &T) -> Result<()> {
    let payload = serde_json::to_vec(value)?;
    write_response(stream, status, "application/json", &payload)
}

pub fn write_error<W: Write>(stream: &mut W, status: u16, error: &str) -> Result<()> {
    write_json(stream, status, &serde_json::json!({ "error": error }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn parse(raw: &[u8]) -> Result<Incoming> {
        read_request(&mut Cursor::new(raw.to_vec()))
    }

    #[test]
    fn reads_body_by_content_length() -> Result<()> {
        let raw = b"POST /stream/stop?x=1 HTTP/1.1\r\nHost: a\r\nContent-Length: 11\r\n\r\n{\"id\":\"c\"}\n";
        let Incoming::Request(req) = parse(raw)? else {
            panic!("expected request");
        };
        assert_eq!(req.method, "POST");
        assert_eq!(req.path, "/stream/stop");
        assert_eq!(req.query.as_deref(), Some("x=1"));
        assert_eq!(req.headers.get("host").map(String::as_str), Some("a"));
        assert_eq!(req.body, b"{\"id\":\"c\"}\n");
        Ok(())
    }

    #[test]
    fn oversized_requests_are_flagged() -> Result<()> {
        let raw = format!(
            "POST /stream/start HTTP/1.1\r\nContent-Length: {}\r\n\r\n",
            MAX_REQUEST_BYTES
        );
        assert!(matches!(parse(raw.as_bytes())?, Incoming::TooLarge));

        let mut huge = b"GET / HTTP/1.1\r\nX-Pad: ".to_vec();
        huge.extend(std::iter::repeat(b'a').take(MAX_REQUEST_BYTES + 10));
        assert!(matches!(parse(&huge)?, Incoming::TooLarge));
        Ok(())
    }

    #[test]
    fn truncated_requests_fail() {
        assert!(parse(b"GET / HTTP/1.1\r\n").is_err());
        assert!(parse(b"POST / HTTP/1.1\r\nContent-Length: 5\r\n\r\nab").is_err());
        assert!(parse(b"POST / HTTP/1.1\r\nContent-Length: x\r\n\r\n").is_err());
    }

    #[test]
    fn response_carries_length_and_status() -> Result<()> {
        let mut out = Vec::new();
        write_error(&mut out, 404, "not_found")?;
        let text = String::from_utf8(out)?;
        assert!(text.starts_with("HTTP/1.1 404 Not Found\r\n"));
        assert!(text.contains("Content-Length: 21\r\n"));
        assert!(text.ends_with("{\"error\":\"not_found\"}"));
        Ok(())
    }
}
