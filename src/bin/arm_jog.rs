//! arm_jog - send one manual pose to the arm.
//!
//! The pose is validated and clamped before anything is written; a malformed
//! pose never reaches the serial port.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;

use visual_grasp::actuator::protocol::parse_channels;
use visual_grasp::config::GraspdConfig;
use visual_grasp::{Actuator, ArmDriver, Pose};

#[derive(Parser, Debug)]
#[command(author, version, about = "Send one pose to the servo controller")]
struct Args {
    /// Comma-separated channel angles in degrees, gripper last (e.g. "90,100,140,90,12,155").
    pose: String,

    /// Commit one channel at a time in the profile's sequencing order.
    #[arg(long)]
    sequenced: bool,

    /// Config file (.json, otherwise parsed as TOML).
    #[arg(long, env = "GRASP_CONFIG")]
    config: Option<PathBuf>,

    /// Serial port override.
    #[arg(long, env = "GRASP_SERIAL_PORT")]
    port: Option<String>,

    /// Print the clamped pose without opening the port.
    #[arg(long)]
    dry_run: bool,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let mut cfg = GraspdConfig::load_from(args.config.as_deref())?;
    if let Some(port) = args.port {
        cfg.serial.port = port;
    }
    let profile = cfg.arm.build_profile()?;

    let channels = parse_channels(&args.pose).context("invalid pose")?;
    let pose = Pose::from_channels(&channels)?;
    profile.validate(&pose)?;
    let clamped = profile.clamp(&pose);
    if clamped != pose {
        log::warn!(
            "arm_jog: requested {:?} clamped to {:?}",
            pose.channels(),
            clamped.channels()
        );
    }
    if args.dry_run {
        println!("{:?}", clamped.channels());
        return Ok(());
    }

    let mut actuator = Actuator::connect(profile, &cfg.serial)
        .with_context(|| format!("opening {}", cfg.serial.port))?
        .with_sequenced_settle(Duration::from_millis(cfg.arm.sequenced_settle_ms));
    let reached = if args.sequenced {
        actuator.move_to_sequenced(&pose)?
    } else {
        actuator.move_to(&pose)?
    };
    println!("{:?}", reached.channels());
    Ok(())
}
