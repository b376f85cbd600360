//! graspd - camera-guided grasping daemon
//!
//! This daemon:
//! 1. Opens the first available camera and runs capture, inference and the
//!    staleness watchdog on their own threads
//! 2. Connects to the servo controller (or drives a simulated arm)
//! 3. Serves the loopback control API and MJPEG stream
//! 4. Runs one servoing session at a time on request
//! 5. Stops every thread cleanly on Ctrl-C

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use visual_grasp::{
    api::ApiServer,
    config::GraspdConfig,
    detect::{build_detector, TemplateTracker},
    ingest::DefaultSourceFactory,
    pipeline::{DetectionFeed, PipelineFeed},
    servo::{FeedFactory, ServoRig, ServoSettings},
    load_predictor, Actuator, CapturePipeline, HybridPerception, ServoControl, ServoingService,
    SharedArm, SharedState,
};

#[derive(Parser, Debug)]
#[command(author, version, about = "Camera-guided grasping daemon")]
struct Args {
    /// Config file (.json, otherwise parsed as TOML).
    #[arg(long, env = "GRASP_CONFIG")]
    config: Option<PathBuf>,

    /// Start servoing toward this label as soon as everything is up.
    #[arg(long)]
    target: Option<String>,

    /// Drive a simulated arm instead of opening the serial port.
    #[arg(long)]
    simulate: bool,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let mut cfg = GraspdConfig::load_from(args.config.as_deref())?;
    if args.simulate {
        cfg.serial.simulate = true;
    }

    let shared = Arc::new(SharedState::new());
    let detector = build_detector(&cfg.perception)?;
    let tracker = Box::new(TemplateTracker::new(cfg.perception.tracker.clone()));
    let perception = HybridPerception::new(detector, tracker, &cfg.perception);
    let mut pipeline = CapturePipeline::spawn(
        cfg.pipeline.clone(),
        cfg.camera.devices.clone(),
        Box::new(DefaultSourceFactory::new(cfg.camera.clone())),
        perception,
        shared.clone(),
    )?;

    let profile = cfg.arm.build_profile()?;
    let actuator = Actuator::connect_or_simulate(profile, &cfg.serial)
        .with_sequenced_settle(Duration::from_millis(cfg.arm.sequenced_settle_ms));
    log::info!(
        "arm link: {}{}",
        actuator.describe(),
        if actuator.is_simulated() { " (simulated)" } else { "" }
    );
    let arm: SharedArm = Arc::new(Mutex::new(actuator));

    let rig = ServoRig {
        arm,
        kinematics: Arc::new(cfg.kinematics.clone()),
        predictor_x: load_predictor(&cfg.predictor_x),
        predictor_y: load_predictor(&cfg.predictor_y),
    };
    let feed_shared = shared.clone();
    let control = pipeline.control();
    let feeds: FeedFactory = Arc::new(move || {
        Box::new(PipelineFeed::new(feed_shared.clone(), control.clone())) as Box<dyn DetectionFeed>
    });
    let servo_settings: ServoSettings = cfg.servo.clone();
    let servo = Arc::new(
        ServoingService::new(servo_settings, rig, feeds)
            .with_completion_hook(Arc::new(|| log::info!("graspd: grasp complete"))),
    );

    let api_handle = ApiServer::new(cfg.api.clone(), shared.clone(), servo.clone()).spawn()?;

    if let Some(target) = args.target.as_deref() {
        servo.start(target)?;
    }

    let (tx, rx) = std::sync::mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })
    .expect("error setting Ctrl-C handler");

    log::info!("graspd running; Ctrl-C to stop");
    let _ = rx.recv();
    log::info!("shutdown signal received, stopping...");

    servo.stop()?;
    api_handle.stop()?;
    pipeline.stop()?;
    log::info!("graspd stopped (stats: {:?})", shared.stats());
    Ok(())
}
