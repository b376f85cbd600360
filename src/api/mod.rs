//! Loopback-only control surface.
//!
//! Routes:
//! - `GET /health`
//! - `GET /detections` latest detections, or `searching`
//! - `GET /status` servoing status plus pipeline counters
//! - `GET /frame.jpg` latest annotated frame
//! - `GET /video_feed` multipart MJPEG stream, one thread per client
//! - `POST /servo/start?target=<label>`
//! - `POST /servo/stop`

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crate::pipeline::{PipelineStats, SharedState};
use crate::servo::{ServoControl, ServoStatus};

const MAX_REQUEST_BYTES: usize = 8192;
const STREAM_BOUNDARY: &str = "frame";
const STREAM_INTERVAL: Duration = Duration::from_millis(33);
const KNOWN_ROUTES: [&str; 7] = [
    "/health",
    "/detections",
    "/status",
    "/frame.jpg",
    "/video_feed",
    "/servo/start",
    "/servo/stop",
];

#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ApiConfig {
    pub addr: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            addr: "127.0.0.1:8799".to_string(),
        }
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

#[derive(Serialize)]
struct StatusBody {
    servo: ServoStatus,
    pipeline: PipelineStats,
}

pub struct ApiServer {
    cfg: ApiConfig,
    shared: Arc<SharedState>,
    servo: Arc<dyn ServoControl>,
}

impl ApiServer {
    pub fn new(cfg: ApiConfig, shared: Arc<SharedState>, servo: Arc<dyn ServoControl>) -> Self {
        Self { cfg, shared, servo }
    }

    pub fn spawn(self) -> Result<ApiHandle> {
        let configured_addr: SocketAddr = self.cfg.addr.parse()?;
        if !configured_addr.ip().is_loopback() {
            return Err(anyhow!(
                "api address '{}' is not loopback; the control surface moves hardware",
                configured_addr
            ));
        }
        let listener = TcpListener::bind(configured_addr)?;
        let addr = listener.local_addr()?;
        if !addr.ip().is_loopback() {
            return Err(anyhow!(
                "api configured for loopback address '{}', but bound to non-loopback address '{}'",
                configured_addr,
                addr
            ));
        }
        listener.set_nonblocking(true)?;

        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_thread = shutdown.clone();
        let join = std::thread::Builder::new()
            .name("api".into())
            .spawn(move || {
                if let Err(err) = run_api(listener, &self, shutdown_thread) {
                    log::error!("control api stopped: {}", err);
                }
            })?;
        log::info!("control api listening on http://{}", addr);

        Ok(ApiHandle {
            addr,
            shutdown,
            join: Some(join),
        })
    }
}

fn run_api(listener: TcpListener, server: &ApiServer, shutdown: Arc<AtomicBool>) -> Result<()> {
    let mut streams: Vec<JoinHandle<()>> = Vec::new();
    loop {
        if shutdown.load(Ordering::SeqCst) {
            break;
        }
        match listener.accept() {
            Ok((stream, _)) => {
                streams.retain(|handle| !handle.is_finished());
                match handle_connection(stream, server, &shutdown) {
                    Ok(Some(handle)) => streams.push(handle),
                    Ok(None) => {}
                    Err(err) => log::warn!("control api request rejected: {}", err),
                }
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(Duration::from_millis(50));
                continue;
            }
            Err(err) => return Err(err.into()),
        }
    }
    for handle in streams {
        let _ = handle.join();
    }
    Ok(())
}

/// Serve one request. Returns the stream thread for `/video_feed`.
fn handle_connection(
    mut stream: TcpStream,
    server: &ApiServer,
    shutdown: &Arc<AtomicBool>,
) -> Result<Option<JoinHandle<()>>> {
    stream.set_nonblocking(false)?;
    let peer = stream.peer_addr()?;
    if !peer.ip().is_loopback() {
        write_json_response(&mut stream, 403, r#"{"error":"forbidden"}"#)?;
        return Ok(None);
    }

    let request = read_request(&mut stream)?;
    match (request.method.as_str(), request.path.as_str()) {
        ("GET", "/health") => write_json_response(&mut stream, 200, r#"{"status":"ok"}"#)?,
        ("GET", "/detections") => {
            let payload = serde_json::to_vec(&server.shared.detection_query())?;
            write_response(&mut stream, 200, "application/json", &payload)?;
        }
        ("GET", "/status") => {
            let body = StatusBody {
                servo: server.servo.status(),
                pipeline: server.shared.stats(),
            };
            let payload = serde_json::to_vec(&body)?;
            write_response(&mut stream, 200, "application/json", &payload)?;
        }
        ("GET", "/frame.jpg") => match server.shared.latest_display() {
            Some(jpeg) => write_response(&mut stream, 200, "image/jpeg", &jpeg)?,
            None => write_json_response(&mut stream, 404, r#"{"error":"no_frame"}"#)?,
        },
        ("GET", "/video_feed") => {
            let shared = server.shared.clone();
            let shutdown = shutdown.clone();
            let handle = std::thread::Builder::new()
                .name("video-feed".into())
                .spawn(move || {
                    if let Err(err) = stream_mjpeg(stream, &shared, &shutdown) {
                        log::debug!("video feed client {} left: {}", peer, err);
                    }
                })?;
            return Ok(Some(handle));
        }
        ("POST", "/servo/start") => match request.query.get("target") {
            Some(target) if !target.trim().is_empty() => match server.servo.start(target) {
                Ok(()) => {
                    let body = serde_json::json!({ "status": "started", "target": target });
                    write_response(&mut stream, 200, "application/json", body.to_string().as_bytes())?;
                }
                Err(err) => {
                    let body = serde_json::json!({ "error": format!("{:#}", err) });
                    write_response(&mut stream, 409, "application/json", body.to_string().as_bytes())?;
                }
            },
            _ => write_json_response(&mut stream, 400, r#"{"error":"missing_target"}"#)?,
        },
        ("POST", "/servo/stop") => match server.servo.stop() {
            Ok(()) => write_json_response(&mut stream, 200, r#"{"status":"stopped"}"#)?,
            Err(err) => {
                log::error!("control api: servo stop failed: {:#}", err);
                let body = serde_json::json!({ "error": format!("{:#}", err) });
                write_response(&mut stream, 500, "application/json", body.to_string().as_bytes())?;
            }
        },
        (_, path) if KNOWN_ROUTES.contains(&path) => {
            write_json_response(&mut stream, 405, r#"{"error":"method_not_allowed"}"#)?
        }
        _ => write_json_response(&mut stream, 404, r#"{"error":"not_found"}"#)?,
    }
    Ok(None)
}

fn stream_mjpeg(mut stream: TcpStream, shared: &SharedState, shutdown: &AtomicBool) -> Result<()> {
    let header = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: multipart/x-mixed-replace; boundary={}\r\nCache-Control: no-store\r\nConnection: close\r\n\r\n",
        STREAM_BOUNDARY
    );
    stream.write_all(header.as_bytes())?;
    let mut last: Option<Arc<Vec<u8>>> = None;
    while !shutdown.load(Ordering::SeqCst) {
        if let Some(jpeg) = shared.latest_display() {
            let fresh = last.as_ref().map_or(true, |prev| !Arc::ptr_eq(prev, &jpeg));
            if fresh {
                let part = format!(
                    "--{}\r\nContent-Type: image/jpeg\r\nContent-Length: {}\r\n\r\n",
                    STREAM_BOUNDARY,
                    jpeg.len()
                );
                stream.write_all(part.as_bytes())?;
                stream.write_all(&jpeg)?;
                stream.write_all(b"\r\n")?;
                last = Some(jpeg);
            }
        }
        std::thread::sleep(STREAM_INTERVAL);
    }
    Ok(())
}

fn read_request(stream: &mut TcpStream) -> Result<HttpRequest> {
    stream.set_read_timeout(Some(Duration::from_secs(2)))?;
    let mut buf = [0u8; 1024];
    let mut data = Vec::new();
    loop {
        let n = stream.read(&mut buf)?;
        if n == 0 {
            break;
        }
        data.extend_from_slice(&buf[..n]);
        if data.len() > MAX_REQUEST_BYTES {
            return Err(anyhow!("request too large"));
        }
        if data.windows(4).any(|w| w == b"\r\n\r\n") {
            break;
        }
    }
    let text = String::from_utf8_lossy(&data);
    let request_line = text
        .split("\r\n")
        .next()
        .ok_or_else(|| anyhow!("empty request"))?;
    let mut parts = request_line.split_whitespace();
    let method = parts.next().ok_or_else(|| anyhow!("missing method"))?;
    let raw_path = parts.next().ok_or_else(|| anyhow!("missing path"))?;
    let (path, query) = match raw_path.split_once('?') {
        Some((path, query)) => (path, parse_query(query)),
        None => (raw_path, HashMap::new()),
    };
    Ok(HttpRequest {
        method: method.to_string(),
        path: path.to_string(),
        query,
    })
}

fn parse_query(query: &str) -> HashMap<String, String> {
    query
        .split('&')
        .filter_map(|pair| {
            let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
            (!key.is_empty()).then(|| (percent_decode(key), percent_decode(value)))
        })
        .collect()
}

fn percent_decode(value: &str) -> String {
    let bytes = value.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'+' => out.push(b' '),
            b'%' if i + 2 < bytes.len() => {
                let hex = std::str::from_utf8(&bytes[i + 1..i + 3]).ok();
                match hex.and_then(|h| u8::from_str_radix(h, 16).ok()) {
                    Some(byte) => {
                        out.push(byte);
                        i += 3;
                        continue;
                    }
                    None => out.push(b'%'),
                }
            }
            other => out.push(other),
        }
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn write_json_response(stream: &mut TcpStream, status: u16, body: &str) -> Result<()> {
    write_response(stream, status, "application/json", body.as_bytes())
}

fn write_response(
    stream: &mut TcpStream,
    status: u16,
    content_type: &str,
    body: &[u8],
) -> Result<()> {
    let status_line = match status {
        200 => "HTTP/1.1 200 OK",
        400 => "HTTP/1.1 400 Bad Request",
        403 => "HTTP/1.1 403 Forbidden",
        404 => "HTTP/1.1 404 Not Found",
        405 => "HTTP/1.1 405 Method Not Allowed",
        409 => "HTTP/1.1 409 Conflict",
        _ => "HTTP/1.1 500 Internal Server Error",
    };
    let header = format!(
        "{status_line}\r\nContent-Type: {content_type}\r\nContent-Length: {len}\r\nCache-Control: no-store\r\nConnection: close\r\n\r\n",
        status_line = status_line,
        content_type = content_type,
        len = body.len()
    );
    stream.write_all(header.as_bytes())?;
    stream.write_all(body)?;
    Ok(())
}

#[derive(Debug)]
struct HttpRequest {
    method: String,
    path: String,
    query: HashMap<String, String>,
}
