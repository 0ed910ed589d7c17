use assert_cmd::prelude::*;
use image::{Rgb, RgbImage};
use predicates::prelude::*;
use rstest::rstest;
use std::fs;
use std::path::PathBuf;
use std::process::Command;
use tempfile::{TempDir, tempdir};

// Small sim camera and fast loops so runs finish quickly
const FAST_SIM: &str = r#"
[camera]
backend = "sim"
width = 160
height = 120
sim_bubbles = 6
max_retries = 2
retry_backoff_ms = 10

[sense]
rate_hz = 20.0

[control]
rate_hz = 10.0
manual_duty = 30.0

[safety]
watchdog_timeout_ms = 2000
"#;

fn write_config(dir: &TempDir, text: &str) -> PathBuf {
    let path = dir.path().join("froth.toml");
    fs::write(&path, text).unwrap();
    path
}

fn froth(cfg: &PathBuf) -> Command {
    let mut cmd = Command::cargo_bin("froth").unwrap();
    cmd.arg("--config").arg(cfg).arg("--log-level").arg("warn");
    cmd.env_remove("RUST_LOG");
    cmd
}

/// Four dark discs on a bright background.
fn write_froth_png(dir: &TempDir) -> PathBuf {
    let discs = [(50i64, 50i64), (150, 50), (50, 150), (150, 150)];
    let img = RgbImage::from_fn(200, 200, |x, y| {
        let (x, y) = (i64::from(x), i64::from(y));
        if discs
            .iter()
            .any(|&(cx, cy)| (x - cx).pow(2) + (y - cy).pow(2) <= 225)
        {
            Rgb([45, 45, 45])
        } else {
            Rgb([205, 205, 205])
        }
    });
    let path = dir.path().join("froth.png");
    img.save(&path).unwrap();
    path
}

#[rstest]
#[case(&["--help"], 0, "Usage:", "stdout")]
#[case(&["self-check"], 0, "ok: camera 160x120", "stdout")]
#[case(&["run", "--mode", "turbo"], 2, "invalid value", "stderr")]
#[case(&["analyze"], 2, "--image", "stderr")]
#[case(&["run", "--duration-s", "0", "--setpoint", "900"], 3, "setpoint = 900", "stderr")]
fn cli_table_cases(
    #[case] args: &[&str],
    #[case] exit_code: i32,
    #[case] needle: &str,
    #[case] stream: &str,
) {
    let dir = tempdir().unwrap();
    let cfg = write_config(&dir, FAST_SIM);

    let assert = froth(&cfg).args(args).assert().code(exit_code);

    match stream {
        "stdout" => {
            assert.stdout(predicate::str::contains(needle));
        }
        "stderr" => {
            assert.stderr(predicate::str::contains(needle));
        }
        other => panic!("unknown stream: {other}"),
    }
}

#[rstest]
#[case("[control]\nkp = 50.0\n", "control.kp")]
#[case("[camera]\nbackend = \"file\"\n", "camera.path")]
#[case("[preprocess]\nmorph_kernel = 4\n", "preprocess.morph_kernel")]
#[case("[control]\nmode = \"sideways\"\n", "mode")]
fn invalid_config_names_the_key(#[case] toml: &str, #[case] key: &str) {
    let dir = tempdir().unwrap();
    let cfg = write_config(&dir, toml);
    froth(&cfg)
        .arg("self-check")
        .assert()
        .code(3)
        .stderr(predicate::str::contains("Configuration is invalid"))
        .stderr(predicate::str::contains(key));
}

#[test]
fn missing_config_file_is_reported() {
    let dir = tempdir().unwrap();
    let missing = dir.path().join("nope.toml");
    froth(&missing)
        .arg("self-check")
        .assert()
        .code(1)
        .stderr(predicate::str::contains("read config"));
}

#[test]
fn camera_that_never_opens_fails_self_check() {
    let dir = tempdir().unwrap();
    let cfg = write_config(&dir, FAST_SIM);
    froth(&cfg)
        .env("FROTH_TEST_SIM_CAMERA_FAIL", "1")
        .arg("self-check")
        .assert()
        .code(4)
        .stderr(predicate::str::contains("Camera failed to open after 2 attempt(s)"));
}

#[test]
fn camera_failure_is_structured_in_json_mode() {
    let dir = tempdir().unwrap();
    let cfg = write_config(&dir, FAST_SIM);
    let out = froth(&cfg)
        .env("FROTH_TEST_SIM_CAMERA_FAIL", "1")
        .arg("--json")
        .arg("run")
        .arg("--duration-s")
        .arg("1")
        .output()
        .unwrap();
    assert_eq!(out.status.code(), Some(4));
    let stderr = String::from_utf8(out.stderr).unwrap();
    let line = stderr
        .lines()
        .find(|l| l.contains("\"reason\":\"Acquisition\""))
        .unwrap_or_else(|| panic!("no error object in: {stderr}"));
    let v: serde_json::Value = serde_json::from_str(line).unwrap();
    assert_eq!(v["details"]["attempts"], 2);
    assert!(v["message"].as_str().unwrap().contains("Camera failed to open"));
}

#[test]
fn analyze_counts_bubbles_in_a_still_image() {
    let dir = tempdir().unwrap();
    let cfg = write_config(&dir, FAST_SIM);
    let png = write_froth_png(&dir);
    froth(&cfg)
        .arg("analyze")
        .arg("--image")
        .arg(&png)
        .assert()
        .success()
        .stdout(predicate::str::contains("bubbles: 4"))
        .stdout(predicate::str::contains("coverage:"));
}

#[test]
fn analyze_json_is_one_metrics_object() {
    let dir = tempdir().unwrap();
    let cfg = write_config(&dir, FAST_SIM);
    let png = write_froth_png(&dir);
    let out = froth(&cfg)
        .arg("--json")
        .arg("analyze")
        .arg("--image")
        .arg(&png)
        .output()
        .unwrap();
    assert!(out.status.success());
    let v: serde_json::Value = serde_json::from_slice(&out.stdout).unwrap();
    assert_eq!(v["bubble_count"], 4);
    let coverage = v["coverage_ratio"].as_f64().unwrap();
    assert!(coverage > 0.0 && coverage < 0.2);
    assert_eq!(v["anomaly_detected"], false);
}

#[test]
fn analyze_reports_unreadable_images() {
    let dir = tempdir().unwrap();
    let cfg = write_config(&dir, FAST_SIM);
    let bogus = dir.path().join("not-an-image.png");
    fs::write(&bogus, b"definitely not a png").unwrap();
    froth(&cfg)
        .arg("analyze")
        .arg("--image")
        .arg(&bogus)
        .assert()
        .code(1)
        .stderr(predicate::str::contains("Could not load image"));
}

#[test]
fn timed_run_prints_final_snapshot() {
    let dir = tempdir().unwrap();
    let cfg = write_config(&dir, FAST_SIM);
    froth(&cfg)
        .arg("run")
        .arg("--duration-s")
        .arg("1")
        .assert()
        .success()
        .stdout(predicate::str::contains("control: AUTO"))
        .stdout(predicate::str::contains("run complete"));
}

#[test]
fn timed_run_json_snapshot() {
    let dir = tempdir().unwrap();
    let cfg = write_config(&dir, FAST_SIM);
    let out = froth(&cfg)
        .arg("--json")
        .arg("run")
        .arg("--duration-s")
        .arg("1")
        .arg("--mode")
        .arg("manual")
        .arg("--setpoint")
        .arg("40")
        .output()
        .unwrap();
    assert!(
        out.status.success(),
        "stderr: {}",
        String::from_utf8_lossy(&out.stderr)
    );
    let v: serde_json::Value = serde_json::from_slice(&out.stdout).unwrap();
    assert_eq!(v["control"]["mode"], "MANUAL");
    assert_eq!(v["control"]["setpoint"], 40.0);
    assert_eq!(v["control"]["manual_duty_cycle"], 30.0);
    assert_eq!(v["safety"]["estop_active"], false);
    // every channel is back at 0 after shutdown
    let devices = v["devices"].as_object().unwrap();
    assert_eq!(devices.len(), 4);
    assert!(devices.values().all(|d| d.as_f64() == Some(0.0)));
    assert_eq!(v["sense_healthy"], false);
}

#[test]
fn log_file_receives_json_lines() {
    let dir = tempdir().unwrap();
    let log = dir.path().join("froth.log");
    let text = format!(
        "{FAST_SIM}\n[logging]\nfile = \"{}\"\nlevel = \"info\"\n",
        log.display()
    );
    let cfg = write_config(&dir, &text);
    froth(&cfg).arg("self-check").assert().success();
    let contents = fs::read_to_string(&log).unwrap();
    assert!(!contents.is_empty());
    for line in contents.lines() {
        let v: serde_json::Value = serde_json::from_str(line).unwrap();
        assert!(v.get("level").is_some());
    }
}

#[cfg(not(all(feature = "v4l2", target_os = "linux")))]
#[test]
fn device_camera_without_capture_support_is_a_config_error() {
    let dir = tempdir().unwrap();
    let cfg = write_config(&dir, "[camera]\nbackend = \"device\"\n");
    let out = froth(&cfg).arg("--json").arg("self-check").output().unwrap();
    assert_eq!(out.status.code(), Some(3));
    let stderr = String::from_utf8(out.stderr).unwrap();
    let line = stderr
        .lines()
        .find(|l| l.contains("\"reason\":\"Unsupported\""))
        .unwrap_or_else(|| panic!("no error object in: {stderr}"));
    let v: serde_json::Value = serde_json::from_str(line).unwrap();
    assert_eq!(v["details"]["feature"], "v4l2");
    assert!(v["message"].as_str().unwrap().contains("--features v4l2"));
}
