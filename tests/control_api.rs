use anyhow::{anyhow, Result};
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use visual_grasp::api::{ApiConfig, ApiServer};
use visual_grasp::pipeline::DetectionSnapshot;
use visual_grasp::servo::Phase;
use visual_grasp::{
    BBox, Candidate, Detection, DetectionSource, ServoControl, ServoStatus, SharedState,
};

#[derive(Default)]
struct RecordingServo {
    calls: Mutex<Vec<String>>,
    running: Mutex<bool>,
    stop_fails: bool,
}

impl ServoControl for RecordingServo {
    fn start(&self, target: &str) -> Result<()> {
        self.calls.lock().unwrap().push(format!("start:{}", target));
        let mut running = self.running.lock().unwrap();
        if *running {
            return Err(anyhow!("servoing already running"));
        }
        *running = true;
        Ok(())
    }

    fn stop(&self) -> Result<()> {
        self.calls.lock().unwrap().push("stop".to_string());
        if self.stop_fails {
            return Err(anyhow!("servo thread panicked"));
        }
        *self.running.lock().unwrap() = false;
        Ok(())
    }

    fn status(&self) -> ServoStatus {
        ServoStatus {
            phase: Phase::Aligning,
            running: *self.running.lock().unwrap(),
            ..ServoStatus::idle()
        }
    }
}

fn request(addr: SocketAddr, method: &str, path: &str) -> Result<(u16, String)> {
    let mut stream = TcpStream::connect(addr)?;
    stream.set_read_timeout(Some(Duration::from_secs(5)))?;
    write!(stream, "{} {} HTTP/1.1\r\nHost: localhost\r\n\r\n", method, path)?;
    let mut raw = Vec::new();
    stream.read_to_end(&mut raw)?;
    let text = String::from_utf8_lossy(&raw).into_owned();
    let status = text
        .split_whitespace()
        .nth(1)
        .and_then(|code| code.parse().ok())
        .ok_or_else(|| anyhow!("no status line in {:?}", text))?;
    let body = text
        .split_once("\r\n\r\n")
        .map(|(_, body)| body.to_string())
        .unwrap_or_default();
    Ok((status, body))
}

type Server = (visual_grasp::api::ApiHandle, Arc<SharedState>, Arc<RecordingServo>);

fn server() -> Result<Server> {
    serve(RecordingServo::default())
}

fn serve(servo: RecordingServo) -> Result<Server> {
    let shared = Arc::new(SharedState::new());
    let servo = Arc::new(servo);
    let handle = ApiServer::new(
        ApiConfig {
            addr: "127.0.0.1:0".to_string(),
        },
        shared.clone(),
        servo.clone(),
    )
    .spawn()?;
    Ok((handle, shared, servo))
}

#[test]
fn health_and_detection_routes() -> Result<()> {
    let (handle, shared, _) = server()?;

    let (status, body) = request(handle.addr, "GET", "/health")?;
    assert_eq!((status, body.as_str()), (200, r#"{"status":"ok"}"#));

    let (status, body) = request(handle.addr, "GET", "/detections")?;
    assert_eq!(status, 200);
    let value: serde_json::Value = serde_json::from_str(&body)?;
    assert_eq!(value["status"], "searching");

    let candidate = Candidate::object("cube", 0.8, BBox::centered(400.0, 200.0, 50.0, 50.0));
    let detection =
        Detection::from_candidate(&candidate, 640, 480, Some(21.0), DetectionSource::Detector);
    shared.publish_detections(DetectionSnapshot::with_primary(1, Some(detection)));

    let (_, body) = request(handle.addr, "GET", "/detections")?;
    let value: serde_json::Value = serde_json::from_str(&body)?;
    assert_eq!(value["status"], "found");
    assert_eq!(value["data"][0]["label"], "cube");
    assert_eq!(value["data"][0]["pixel_error"]["x"], 80.0);

    let (status, _) = request(handle.addr, "GET", "/frame.jpg")?;
    assert_eq!(status, 404);
    let (status, _) = request(handle.addr, "GET", "/nope")?;
    assert_eq!(status, 404);

    handle.stop()
}

#[test]
fn servo_routes_drive_the_controller() -> Result<()> {
    let (handle, _, servo) = server()?;

    let (status, body) = request(handle.addr, "POST", "/servo/start?target=cell+phone")?;
    assert_eq!(status, 200);
    assert!(body.contains("cell phone"));

    let (status, _) = request(handle.addr, "POST", "/servo/start?target=cube")?;
    assert_eq!(status, 409);

    let (status, _) = request(handle.addr, "POST", "/servo/start")?;
    assert_eq!(status, 400);

    let (status, _) = request(handle.addr, "GET", "/servo/start?target=cube")?;
    assert_eq!(status, 405);

    let (status, body) = request(handle.addr, "GET", "/status")?;
    assert_eq!(status, 200);
    let value: serde_json::Value = serde_json::from_str(&body)?;
    assert_eq!(value["servo"]["phase"], "ALIGNING");
    assert_eq!(value["servo"]["running"], true);
    assert_eq!(value["pipeline"]["frames_captured"], 0);

    let (status, _) = request(handle.addr, "POST", "/servo/stop")?;
    assert_eq!(status, 200);

    assert_eq!(
        *servo.calls.lock().unwrap(),
        vec!["start:cell phone", "start:cube", "stop"]
    );
    handle.stop()
}

#[test]
fn failed_stop_is_reported_as_server_error() -> Result<()> {
    let (handle, _, servo) = serve(RecordingServo {
        stop_fails: true,
        ..RecordingServo::default()
    })?;

    let (status, body) = request(handle.addr, "POST", "/servo/stop")?;
    assert_eq!(status, 500);
    let value: serde_json::Value = serde_json::from_str(&body)?;
    assert_eq!(value["error"], "servo thread panicked");
    assert_eq!(*servo.calls.lock().unwrap(), vec!["stop"]);

    handle.stop()
}

#[test]
fn video_feed_streams_latest_jpeg() -> Result<()> {
    let (handle, shared, _) = server()?;
    shared.publish_display(vec![0xFF, 0xD8, 0xFF, 0xD9]);

    let mut stream = TcpStream::connect(handle.addr)?;
    stream.set_read_timeout(Some(Duration::from_secs(5)))?;
    write!(stream, "GET /video_feed HTTP/1.1\r\nHost: localhost\r\n\r\n")?;
    let mut received = Vec::new();
    let mut buf = [0u8; 512];
    while !received.windows(2).any(|w| w == [0xFF, 0xD9]) {
        let n = stream.read(&mut buf)?;
        if n == 0 {
            break;
        }
        received.extend_from_slice(&buf[..n]);
    }
    let text = String::from_utf8_lossy(&received);
    assert!(text.contains("multipart/x-mixed-replace; boundary=frame"));
    assert!(text.contains("--frame\r\nContent-Type: image/jpeg\r\nContent-Length: 4"));
    drop(stream);

    handle.stop()
}

#[test]
fn non_loopback_bind_is_refused() {
    let result = ApiServer::new(
        ApiConfig {
            addr: "0.0.0.0:0".to_string(),
        },
        Arc::new(SharedState::new()),
        Arc::new(RecordingServo::default()),
    )
    .spawn();
    assert!(result.is_err());
}
