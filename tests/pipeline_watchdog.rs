use anyhow::Result;
use std::sync::Arc;
use std::time::{Duration, Instant};

use visual_grasp::detect::{build_detector, PerceptionSettings, TemplateTracker};
use visual_grasp::ingest::{CameraSettings, DefaultSourceFactory};
use visual_grasp::pipeline::{
    DetectionFeed, DetectionQuery, PipelineHandle, PipelineSettings, StalenessMonitor,
};
use visual_grasp::{CapturePipeline, HybridPerception, SharedState};

fn camera() -> CameraSettings {
    CameraSettings {
        devices: Vec::new(),
        width: 160,
        height: 120,
        target_fps: 100,
        read_timeout_ms: 1_000,
    }
}

fn perception() -> Result<HybridPerception> {
    let settings = PerceptionSettings {
        color_min_area_px: 100,
        ..PerceptionSettings::default()
    };
    let detector = build_detector(&settings)?;
    Ok(HybridPerception::new(
        detector,
        Box::new(TemplateTracker::default()),
        &settings,
    ))
}

fn spawn(devices: &[&str], settings: PipelineSettings) -> Result<PipelineHandle> {
    let devices: Vec<String> = devices.iter().map(|d| d.to_string()).collect();
    CapturePipeline::spawn(
        settings,
        devices,
        Box::new(DefaultSourceFactory::new(camera())),
        perception()?,
        Arc::new(SharedState::new()),
    )
}

fn wait_until(timeout: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if check() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    check()
}

#[test]
fn staleness_trips_once_per_episode_and_reopens() -> Result<()> {
    let settings = PipelineSettings {
        watchdog_stale_ms: 100,
        watchdog_poll_ms: 10,
        reopen_backoff_ms: 10,
        render_display: false,
        ..PipelineSettings::default()
    };
    let mut pipeline = spawn(&["stub://camera?stall_after=3"], settings)?;
    let shared = pipeline.shared();

    assert!(wait_until(Duration::from_secs(5), || shared.stats().watchdog_trips >= 2));
    pipeline.stop()?;

    let stats = shared.stats();
    // Each trip releases the stalled device; every reopen follows a trip.
    assert!(stats.device_opens >= stats.watchdog_trips, "{:?}", stats);
    assert!(stats.device_opens <= stats.watchdog_trips + 1, "{:?}", stats);
    assert!(stats.frames_captured >= 3 * stats.watchdog_trips, "{:?}", stats);
    assert_eq!(stats.active_device, None);
    Ok(())
}

#[test]
fn unavailable_devices_are_skipped() -> Result<()> {
    let mut pipeline = spawn(
        &["stub://broken?fail_open=1", "stub://camera?color=red"],
        PipelineSettings::default(),
    )?;
    let shared = pipeline.shared();

    assert!(wait_until(Duration::from_secs(5), || shared
        .latest_frame()
        .is_some()));
    assert_eq!(shared.stats().active_device.as_deref(), Some("stub://camera"));
    assert!(wait_until(Duration::from_secs(5), || shared
        .latest_display()
        .is_some()));
    pipeline.stop()?;
    pipeline.stop()?;
    Ok(())
}

#[test]
fn target_filter_reaches_inference() -> Result<()> {
    let settings = PipelineSettings {
        inference_interval_ms: 10,
        ..PipelineSettings::default()
    };
    let mut pipeline = spawn(&["stub://camera?color=red"], settings)?;
    let shared = pipeline.shared();
    let mut feed = pipeline.feed();

    feed.request_target(Some("red"));
    assert!(wait_until(Duration::from_secs(5), || matches!(
        shared.detection_query(),
        DetectionQuery::Found(_)
    )));
    let snapshot = feed.latest();
    let primary = snapshot.primary.as_ref().map(|d| d.label().to_string());
    assert_eq!(primary.as_deref(), Some("red"));

    feed.request_target(Some("blue"));
    assert!(wait_until(Duration::from_secs(5), || matches!(
        shared.detection_query(),
        DetectionQuery::Searching
    )));
    pipeline.stop()?;
    Ok(())
}

#[test]
fn monitor_counts_episodes_not_polls() {
    let mut monitor = StalenessMonitor::new(Duration::from_millis(100));
    let trips = (0..50)
        .filter(|_| monitor.observe(Duration::from_millis(250)))
        .count();
    assert_eq!(trips, 1);
    assert!(!monitor.observe(Duration::from_millis(5)));
    assert!(monitor.observe(Duration::from_millis(101)));
    assert_eq!(monitor.trips(), 2);
}
