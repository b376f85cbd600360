use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;

use tempfile::NamedTempFile;

use visual_grasp::config::GraspdConfig;
use visual_grasp::predictor::PredictorStrategy;

static ENV_LOCK: Mutex<()> = Mutex::new(());

fn clear_env() {
    for key in [
        "GRASP_CONFIG",
        "GRASP_API_ADDR",
        "GRASP_CAMERA_DEVICES",
        "GRASP_SERIAL_PORT",
        "GRASP_SERIAL_BAUD",
        "GRASP_PREDICTOR_X",
        "GRASP_PREDICTOR_Y",
        "GRASP_SIMULATE",
    ] {
        std::env::remove_var(key);
    }
}

fn config_file(suffix: &str, body: &str) -> NamedTempFile {
    let mut file = tempfile::Builder::new()
        .suffix(suffix)
        .tempfile()
        .expect("temp config");
    file.write_all(body.as_bytes()).expect("write config");
    file
}

#[test]
fn loads_json_config_and_env_overrides() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let file = config_file(
        ".json",
        r#"{
            "api": { "addr": "127.0.0.1:9100" },
            "camera": { "devices": ["/dev/video2"], "width": 800, "height": 600, "target_fps": 15 },
            "serial": { "port": "/dev/ttyACM0", "baud": 57600 },
            "servo": { "deadzone_px": 12.0, "blind_zone_cm": 4.0 },
            "predictor_x": { "strategy": "proportional", "gain": 0.02 }
        }"#,
    );

    std::env::set_var("GRASP_CONFIG", file.path());
    std::env::set_var("GRASP_CAMERA_DEVICES", "/dev/video0, stub://camera");
    std::env::set_var("GRASP_SERIAL_BAUD", "115200");
    std::env::set_var("GRASP_PREDICTOR_Y", "/opt/models/y.json");
    std::env::set_var("GRASP_SIMULATE", "true");

    let cfg = GraspdConfig::load().expect("load config");

    assert_eq!(cfg.api.addr, "127.0.0.1:9100");
    assert_eq!(cfg.camera.devices, vec!["/dev/video0", "stub://camera"]);
    assert_eq!((cfg.camera.width, cfg.camera.height, cfg.camera.target_fps), (800, 600, 15));
    assert_eq!(cfg.serial.port, "/dev/ttyACM0");
    assert_eq!(cfg.serial.baud, 115200);
    assert!(cfg.serial.simulate);
    assert_eq!(cfg.servo.deadzone_px, 12.0);
    assert_eq!(cfg.servo.blind_zone_cm, 4.0);
    assert_eq!(cfg.servo.near_threshold_cm, 15.0);
    assert_eq!(cfg.predictor_x.strategy, PredictorStrategy::Proportional);
    assert_eq!(cfg.predictor_x.gain, 0.02);
    assert_eq!(cfg.predictor_y.strategy, PredictorStrategy::Learned);
    assert_eq!(
        cfg.predictor_y.artifact,
        Some(PathBuf::from("/opt/models/y.json"))
    );

    clear_env();
}

#[test]
fn loads_toml_config() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let file = config_file(
        ".toml",
        r#"
            [pipeline]
            watchdog_stale_ms = 2500

            [arm]
            profile = "uniform"
            channels = 4

            [kinematics]
            upper_arm_cm = 12.0
            forearm_cm = 10.0
        "#,
    );

    let cfg = GraspdConfig::load_from(Some(file.path())).expect("load config");

    assert_eq!(cfg.pipeline.watchdog_stale_ms, 2500);
    assert_eq!(cfg.arm.build_profile().unwrap().channel_count(), 4);
    assert_eq!(cfg.kinematics.upper_arm_cm, 12.0);
    assert_eq!(cfg.camera.devices, vec!["stub://camera"]);

    clear_env();
}

#[test]
fn rejects_invalid_values() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let blind = config_file(".json", r#"{ "servo": { "blind_zone_cm": 20.0 } }"#);
    assert!(GraspdConfig::load_from(Some(blind.path())).is_err());

    let unknown = config_file(".json", r#"{ "servo": { "dead_zone": 3 } }"#);
    assert!(GraspdConfig::load_from(Some(unknown.path())).is_err());

    let fps = config_file(".toml", "[camera]\ntarget_fps = 0\n");
    assert!(GraspdConfig::load_from(Some(fps.path())).is_err());

    let split_zone = config_file(
        ".toml",
        "[servo]\nnear_threshold_cm = 20.0\n\n[perception]\nnear_threshold_cm = 15.0\n",
    );
    assert!(GraspdConfig::load_from(Some(split_zone.path())).is_err());

    let short_home = config_file(
        ".json",
        r#"{ "arm": { "custom": {
            "joints": [
                { "name": "base", "range": { "min": 0.0, "max": 180.0 } },
                { "name": "shoulder", "range": { "min": 0.0, "max": 180.0 } },
                { "name": "elbow", "range": { "min": 0.0, "max": 180.0 } }
            ],
            "gripper": { "name": "gripper", "range": { "min": 0.0, "max": 180.0 } },
            "home": { "joints": [90.0, 90.0], "gripper": 90.0 }
        } } }"#,
    );
    let err = GraspdConfig::load_from(Some(short_home.path()))
        .err()
        .map(|e| format!("{:#}", e));
    assert!(err.unwrap_or_default().contains("home pose has 3 channels"));

    std::env::set_var("GRASP_SERIAL_BAUD", "fast");
    assert!(GraspdConfig::load_from(None).is_err());
    clear_env();

    std::env::set_var("GRASP_SIMULATE", "sometimes");
    assert!(GraspdConfig::load_from(None).is_err());
    clear_env();
}

#[test]
fn defaults_without_config_file() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let cfg = GraspdConfig::load().expect("defaults");
    assert_eq!(cfg.api.addr, "127.0.0.1:8799");
    assert_eq!(cfg.pipeline.watchdog_stale_ms, 5000);
    assert_eq!(cfg.servo.required_centered_frames, 3);
    assert!(!cfg.serial.simulate);
}
