//! Exit codes and output of the `cta` binary.

use std::path::Path;
use std::process::{Command, Output};

fn cta(args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_cta"))
        .args(args)
        .env_remove("RUST_LOG")
        .output()
        .unwrap()
}

fn path(p: &Path) -> &str {
    p.to_str().unwrap()
}

fn simulate(dir: &Path, name: &str, extra: &[&str]) -> std::path::PathBuf {
    let file = dir.join(name);
    let mut args = vec!["simulate", "-o", path(&file)];
    args.extend_from_slice(extra);
    let out = cta(&args);
    assert!(out.status.success(), "{}", String::from_utf8_lossy(&out.stderr));
    file
}

#[test]
fn test_process_success() {
    let dir = tempfile::tempdir().unwrap();
    let input = simulate(dir.path(), "run1.simtel", &["--events", "5"]);
    let output = dir.path().join("run1.dl2");
    let out = cta(&["process", "-i", path(&input), "-o", path(&output)]);
    assert_eq!(out.status.code(), Some(0), "{}", String::from_utf8_lossy(&out.stderr));
    assert!(output.join("metadata.json").is_file());
}

#[test]
fn test_failed_events_exit_with_warning_code() {
    let dir = tempfile::tempdir().unwrap();
    let input = simulate(dir.path(), "run1.simtel", &["--corrupt", "1,2"]);
    let output = dir.path().join("run1.dl2");
    let out = cta(&["process", "-v", "-i", path(&input), "-o", path(&output)]);
    assert_eq!(out.status.code(), Some(3));
    assert!(output.is_dir());
}

#[test]
fn test_configuration_error_exit_code() {
    let dir = tempfile::tempdir().unwrap();
    let input = simulate(dir.path(), "run1.simtel", &[]);
    let out = cta(&["process", "-i", path(&input), "calibrator.window_widht=3"]);
    assert_eq!(out.status.code(), Some(2));
    assert!(String::from_utf8_lossy(&out.stderr).contains("process.calibrator.window_widht"));

    let out = cta(&["process"]);
    assert_eq!(out.status.code(), Some(2));
}

#[test]
fn test_existing_output_is_fatal_without_overwrite() {
    let dir = tempfile::tempdir().unwrap();
    let input = simulate(dir.path(), "run1.simtel", &["--events", "3"]);
    let output = dir.path().join("run1.dl2");
    let args = ["process", "-i", path(&input), "-o", path(&output)];
    assert_eq!(cta(&args).status.code(), Some(0));
    assert_eq!(cta(&args).status.code(), Some(1));

    let mut again = args.to_vec();
    again.push("--overwrite");
    assert_eq!(cta(&again).status.code(), Some(0));
}

#[test]
fn test_config_prints_resolved_tree() {
    let out = cta(&[
        "config",
        "process",
        "-i",
        "run.simtel",
        "--format",
        "json",
        "image_processor.tailcuts.picture_threshold_pe=8",
    ]);
    assert!(out.status.success(), "{}", String::from_utf8_lossy(&out.stderr));
    let doc: serde_json::Value = serde_json::from_slice(&out.stdout).unwrap();
    assert_eq!(doc["process"]["input"], "run.simtel");
    assert_eq!(
        doc["process"]["image_processor"]["tailcuts"]["picture_threshold_pe"],
        8.0
    );

    let out = cta(&["config", "process", "-i", "run.simtel"]);
    let toml = String::from_utf8_lossy(&out.stdout);
    assert!(toml.contains("[process.calibrator]"));
    assert!(toml.contains("[process.shower_processor.energy_regressor]"));
}

#[test]
fn test_sources_lists_backends() {
    let out = cta(&["sources"]);
    assert!(out.status.success());
    let text = String::from_utf8_lossy(&out.stdout);
    for name in ["block_stream", "columnar", "calibrator", "shower_processor"] {
        assert!(text.contains(name), "{name} missing from\n{text}");
    }
}

#[test]
fn test_merge_command() {
    let dir = tempfile::tempdir().unwrap();
    let mut outputs = Vec::new();
    for obs_id in ["1", "2"] {
        let input = simulate(
            dir.path(),
            &format!("run{obs_id}.simtel"),
            &["--obs-id", obs_id, "--events", "3"],
        );
        let output = dir.path().join(format!("run{obs_id}.dl2"));
        let out = cta(&["process", "-i", path(&input), "-o", path(&output)]);
        assert_eq!(out.status.code(), Some(0));
        outputs.push(output);
    }
    let merged = dir.path().join("all.dl2");
    let out = cta(&[
        "merge",
        "-i",
        path(&outputs[0]),
        "-i",
        path(&outputs[1]),
        "-o",
        path(&merged),
    ]);
    assert_eq!(out.status.code(), Some(0), "{}", String::from_utf8_lossy(&out.stderr));
    assert!(merged.join("metadata.json").is_file());

    // same inputs twice: duplicate events, nothing written
    let again = dir.path().join("dup.dl2");
    let out = cta(&[
        "merge",
        "-i",
        path(&outputs[0]),
        "-i",
        path(&outputs[0]),
        "-o",
        path(&again),
    ]);
    assert_eq!(out.status.code(), Some(1));
    assert!(!again.exists());
}
