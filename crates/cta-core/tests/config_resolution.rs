//! Layered configuration resolution against files on disk.

use std::io::Write;

use cta_core::config::{
    resolve, ComponentConfig, ComponentSchema, ConfigSources, ParamSpec, ParamType,
};
use cta_core::ConfigurationError;
use serde::Deserialize;
use serde_json::json;

fn tool_schema() -> ComponentSchema {
    ComponentSchema::new("process", "Process events")
        .param(ParamSpec::new("input", ParamType::Path).help("Input file"))
        .param(ParamSpec::new("max_events", ParamType::Int).optional().range(Some(0.0), None))
        .param(
            ParamSpec::new("stages", ParamType::StrList)
                .default(json!(["calibrator", "image_processor"])),
        )
        .child(
            ComponentSchema::new("calibrator", "Calibration")
                .param(
                    ParamSpec::new("image_extractor_type", ParamType::Str)
                        .default("local_peak_window_sum")
                        .choices(["full_waveform_sum", "local_peak_window_sum"]),
                )
                .child(
                    ComponentSchema::new("local_peak_window_sum", "")
                        .param(ParamSpec::new("window_width", ParamType::Int).default(7))
                        .param(ParamSpec::new("window_shift", ParamType::Int).default(3)),
                ),
        )
        .child(
            ComponentSchema::new("image_processor", "Cleaning")
                .param(ParamSpec::new("picture_threshold", ParamType::Float).default(10.0))
                .param(ParamSpec::new("window_width", ParamType::Int).default(1)),
        )
}

fn write_file(suffix: &str, content: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::Builder::new().suffix(suffix).tempfile().unwrap();
    file.write_all(content.as_bytes()).unwrap();
    file
}

#[test]
fn test_file_overrides_defaults_and_cli_overrides_file() {
    let file = write_file(
        ".toml",
        r#"
[process]
input = "run.simtel"
max_events = 100

[process.calibrator.local_peak_window_sum]
window_width = 5
window_shift = 2
"#,
    );
    let sources = ConfigSources::default()
        .with_file(file.path())
        .set("process.calibrator.local_peak_window_sum.window_width", 9);
    let config = resolve(&tool_schema(), &sources).unwrap();

    assert_eq!(config.get("input"), Some(&json!("run.simtel")));
    assert_eq!(config.get("max_events"), Some(&json!(100)));
    let window = config
        .child("calibrator")
        .and_then(|c| c.child("local_peak_window_sum"))
        .unwrap();
    assert_eq!(window.get("window_width"), Some(&json!(9)));
    assert_eq!(window.get("window_shift"), Some(&json!(2)));
    assert_eq!(window.path(), "process.calibrator.local_peak_window_sum");
    // same-named parameter in another section keeps its own default
    assert_eq!(
        config.child("image_processor").unwrap().get("window_width"),
        Some(&json!(1))
    );
}

#[test]
fn test_unknown_key_in_file_names_path_and_file() {
    let file = write_file(
        ".toml",
        r#"
[process]
input = "x"

[process.image_processor]
picture_treshold = 5.0
"#,
    );
    let sources = ConfigSources::default().with_file(file.path());
    let err = resolve(&tool_schema(), &sources).unwrap_err();
    match err {
        ConfigurationError::UnknownKey { key, origin } => {
            assert_eq!(key, "process.image_processor.picture_treshold");
            assert!(origin.ends_with(".toml"));
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[test]
fn test_unknown_top_level_section() {
    let file = write_file(".json", r#"{"proces": {"input": "x"}}"#);
    let sources = ConfigSources::default().with_file(file.path());
    let err = resolve(&tool_schema(), &sources).unwrap_err();
    assert!(matches!(err, ConfigurationError::UnknownKey { key, .. } if key == "proces"));
}

#[test]
fn test_yaml_file_with_invalid_choice() {
    let file = write_file(
        ".yaml",
        "process:\n  input: a.simtel\n  calibrator:\n    image_extractor_type: neural_net\n",
    );
    let sources = ConfigSources::default().with_file(file.path());
    let err = resolve(&tool_schema(), &sources).unwrap_err();
    match err {
        ConfigurationError::InvalidValue { key, expected, .. } => {
            assert_eq!(key, "process.calibrator.image_extractor_type");
            assert!(expected.contains("local_peak_window_sum"));
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[test]
fn test_missing_required_parameter() {
    let err = resolve(&tool_schema(), &ConfigSources::default()).unwrap_err();
    assert_eq!(
        err,
        ConfigurationError::MissingValue {
            key: "process.input".into()
        }
    );
}

#[test]
fn test_missing_file_is_a_configuration_error() {
    let sources = ConfigSources::default().with_file("/nonexistent/config.toml");
    assert!(matches!(
        resolve(&tool_schema(), &sources),
        Err(ConfigurationError::File { .. })
    ));
}

#[test]
fn test_extract_parameter_struct_and_provenance_tree() {
    #[derive(Deserialize)]
    struct Params {
        input: String,
        max_events: Option<u64>,
        stages: Vec<String>,
    }

    let sources = ConfigSources::default()
        .set("input", "a.simtel")
        .set("stages", "calibrator");
    let config: ComponentConfig = resolve(&tool_schema(), &sources).unwrap();
    let params: Params = config.extract().unwrap();
    assert_eq!(params.input, "a.simtel");
    assert_eq!(params.max_events, None);
    assert_eq!(params.stages, vec!["calibrator".to_string()]);

    let tree = config.to_json();
    assert_eq!(tree["calibrator"]["local_peak_window_sum"]["window_shift"], 3);
    assert_eq!(tree["image_processor"]["picture_threshold"], 10.0);
}
