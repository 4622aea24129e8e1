use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::{SystemTime, UNIX_EPOCH};

fn unique_temp_dir(label: &str) -> PathBuf {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("clock")
        .as_nanos();
    let dir =
        std::env::temp_dir().join(format!("nox_cli_{label}_{}_{}", std::process::id(), nanos));
    fs::create_dir_all(&dir).expect("create temp dir");
    dir
}

/// Little-endian PFM with `channels` of 1 (`Pf`) or 3 (`PF`).
fn write_pfm(path: &Path, channels: usize, width: u32, height: u32, values: &[f32]) {
    let magic = if channels == 1 { "Pf" } else { "PF" };
    let mut bytes = format!("{magic}\n{width} {height}\n-1.0\n").into_bytes();
    for v in values {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    fs::write(path, bytes).expect("write pfm");
}

fn assert_schema_version(value: &serde_json::Value) {
    assert_eq!(
        value.get("schema_version").and_then(|v| v.as_u64()),
        Some(1),
        "missing schema_version=1 field"
    );
}

fn ramp(len: usize) -> Vec<f32> {
    (0..len).map(|v| v as f32 * 0.125).collect()
}

#[test]
fn help_lists_subcommands() {
    let output = Command::new(env!("CARGO_BIN_EXE_nox"))
        .arg("help")
        .output()
        .expect("run nox help");

    assert!(
        output.status.success(),
        "nox help failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("denoise"), "missing denoise in help output");
    assert!(stdout.contains("probe"), "missing probe in help output");
}

#[test]
fn denoise_help_lists_guides_and_temporal_inputs() {
    let output = Command::new(env!("CARGO_BIN_EXE_nox"))
        .args(["denoise", "--help"])
        .output()
        .expect("run nox denoise --help");

    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    for flag in ["--albedo", "--normals", "--flow", "--previous", "--json"] {
        assert!(stdout.contains(flag), "missing {flag} in denoise help");
    }
}

#[test]
fn dry_run_denoise_json_round_trips_the_image() {
    let dir = unique_temp_dir("denoise_dry_run");
    let input = dir.join("noisy.pfm");
    let albedo = dir.join("albedo.pfm");
    let output_path = dir.join("clean.pfm");
    write_pfm(&input, 3, 4, 2, &ramp(24));
    write_pfm(&albedo, 3, 4, 2, &[0.5; 24]);

    let output = Command::new(env!("CARGO_BIN_EXE_nox"))
        .args([
            "denoise",
            "-i",
            input.to_str().expect("utf8"),
            "-o",
            output_path.to_str().expect("utf8"),
            "--albedo",
            albedo.to_str().expect("utf8"),
            "--dry-run",
            "--json",
        ])
        .output()
        .expect("run nox denoise --dry-run --json");

    assert!(
        output.status.success(),
        "dry run failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    let value: serde_json::Value = serde_json::from_slice(&output.stdout)
        .unwrap_or_else(|e| panic!("denoise --json stdout is not JSON: {e}"));
    assert_schema_version(&value);
    assert_eq!(value.get("command").and_then(|v| v.as_str()), Some("denoise"));
    assert_eq!(value.get("ok").and_then(|v| v.as_bool()), Some(true));
    assert_eq!(value.get("width").and_then(|v| v.as_u64()), Some(4));
    assert_eq!(value.get("height").and_then(|v| v.as_u64()), Some(2));
    assert_eq!(value.get("guide_albedo").and_then(|v| v.as_bool()), Some(true));
    assert_eq!(value.get("guide_normal").and_then(|v| v.as_bool()), Some(false));

    assert_eq!(
        fs::read(&output_path).expect("read output"),
        fs::read(&input).expect("read input"),
        "passthrough output must equal the input file"
    );
    fs::remove_dir_all(&dir).ok();
}

#[test]
fn dry_run_temporal_denoise_succeeds() {
    let dir = unique_temp_dir("denoise_temporal");
    let input = dir.join("frame.pfm");
    let flow = dir.join("flow.pfm");
    let previous = dir.join("previous.pfm");
    let output_path = dir.join("out.pfm");
    write_pfm(&input, 3, 3, 3, &ramp(27));
    write_pfm(&flow, 3, 3, 3, &[0.0; 27]);
    write_pfm(&previous, 3, 3, 3, &[0.25; 27]);

    let output = Command::new(env!("CARGO_BIN_EXE_nox"))
        .args([
            "denoise",
            "-i",
            input.to_str().expect("utf8"),
            "-o",
            output_path.to_str().expect("utf8"),
            "--flow",
            flow.to_str().expect("utf8"),
            "--previous",
            previous.to_str().expect("utf8"),
            "--dry-run",
            "--json",
        ])
        .output()
        .expect("run temporal dry run");

    assert!(
        output.status.success(),
        "temporal dry run failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    let value: serde_json::Value = serde_json::from_slice(&output.stdout).expect("json stdout");
    assert_eq!(value.get("temporal").and_then(|v| v.as_bool()), Some(true));
    assert!(output_path.exists());
    fs::remove_dir_all(&dir).ok();
}

#[test]
fn flow_without_previous_is_rejected_by_argument_parsing() {
    let dir = unique_temp_dir("flow_alone");
    let output = Command::new(env!("CARGO_BIN_EXE_nox"))
        .args([
            "denoise",
            "-i",
            dir.join("in.pfm").to_str().expect("utf8"),
            "-o",
            dir.join("out.pfm").to_str().expect("utf8"),
            "--flow",
            dir.join("flow.pfm").to_str().expect("utf8"),
        ])
        .output()
        .expect("run nox denoise --flow");
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("--previous"));
    fs::remove_dir_all(&dir).ok();
}

#[test]
fn mismatched_previous_frame_fails_with_structured_error() {
    let dir = unique_temp_dir("previous_mismatch");
    let input = dir.join("frame.pfm");
    let flow = dir.join("flow.pfm");
    let previous = dir.join("previous.pfm");
    write_pfm(&input, 3, 4, 4, &ramp(48));
    write_pfm(&flow, 3, 4, 4, &[0.0; 48]);
    write_pfm(&previous, 3, 2, 2, &[0.0; 12]);

    let output = Command::new(env!("CARGO_BIN_EXE_nox"))
        .args([
            "denoise",
            "-i",
            input.to_str().expect("utf8"),
            "-o",
            dir.join("out.pfm").to_str().expect("utf8"),
            "--flow",
            flow.to_str().expect("utf8"),
            "--previous",
            previous.to_str().expect("utf8"),
            "--dry-run",
            "--json",
        ])
        .output()
        .expect("run mismatched temporal dry run");

    assert!(!output.status.success());
    let value: serde_json::Value = serde_json::from_slice(&output.stdout).expect("json stdout");
    assert_eq!(value.get("ok").and_then(|v| v.as_bool()), Some(false));
    let error = value.get("error").and_then(|v| v.as_str()).expect("error");
    assert!(
        error.contains("previous output image is 2x2"),
        "unexpected error: {error}"
    );
    fs::remove_dir_all(&dir).ok();
}

#[test]
fn denoise_json_mode_emits_structured_error_on_missing_input() {
    let dir = unique_temp_dir("denoise_json_error");
    let output = Command::new(env!("CARGO_BIN_EXE_nox"))
        .args([
            "denoise",
            "-i",
            dir.join("missing.pfm").to_str().expect("utf8"),
            "-o",
            dir.join("out.pfm").to_str().expect("utf8"),
            "--dry-run",
            "--json",
        ])
        .output()
        .expect("run nox denoise with missing input");

    assert!(!output.status.success(), "missing input must fail");
    let value: serde_json::Value = serde_json::from_slice(&output.stdout)
        .unwrap_or_else(|e| panic!("denoise error stdout is not JSON: {e}"));
    assert_schema_version(&value);
    assert_eq!(value.get("command").and_then(|v| v.as_str()), Some("denoise"));
    assert_eq!(value.get("ok").and_then(|v| v.as_bool()), Some(false));
    assert!(value.get("error").and_then(|v| v.as_str()).is_some());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(
        !stderr.contains("Command failed"),
        "json mode should not emit default error line on stderr: {stderr}"
    );
    fs::remove_dir_all(&dir).ok();
}

#[test]
fn config_with_unknown_field_is_rejected() {
    let dir = unique_temp_dir("bad_config");
    let config = dir.join("nox.json");
    fs::write(&config, r#"{"device": 0, "denoise_alpha": true}"#).expect("write config");

    let output = Command::new(env!("CARGO_BIN_EXE_nox"))
        .args([
            "probe",
            "--config",
            config.to_str().expect("utf8"),
            "--dry-run",
            "--json",
        ])
        .output()
        .expect("run nox probe with bad config");

    assert!(!output.status.success());
    let value: serde_json::Value = serde_json::from_slice(&output.stdout).expect("json stdout");
    let error = value.get("error").and_then(|v| v.as_str()).expect("error");
    assert!(error.contains("denoise_alpha"), "unexpected error: {error}");
    fs::remove_dir_all(&dir).ok();
}

#[test]
fn dry_run_probe_emits_schema_and_command_fields() {
    let output = Command::new(env!("CARGO_BIN_EXE_nox"))
        .args(["probe", "--dry-run", "--json"])
        .output()
        .expect("run nox probe --dry-run --json");

    assert!(output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(
        !stderr.contains("\u{1b}["),
        "stderr should not include ANSI escapes when not a TTY: {stderr}"
    );
    let value: serde_json::Value = serde_json::from_slice(&output.stdout)
        .unwrap_or_else(|e| panic!("probe --json stdout is not JSON: {e}"));
    assert_schema_version(&value);
    assert_eq!(value.get("command").and_then(|v| v.as_str()), Some("probe"));
    assert_eq!(value.get("backend").and_then(|v| v.as_str()), Some("passthrough"));
}
