//! Merging datasets produced by independent runs.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use cta_core::containers::{HillasParameters, ImageParameters, ReconstructedEnergy};
use cta_core::{ArrayEvent, DataField, EventIndex, MergeError, RunContext};
use cta_io::merge::{merge, MergeOptions};
use cta_io::source::ColumnarSource;
use cta_io::{
    DataWriter, DataWriterConfig, DatasetMetadata, EventSource, SourceConfig, SourceRegistry,
    Table, ToySimulation, ToySimulationConfig,
};

/// Simulate a run and store it as a dataset with images, parameters and
/// energies.
fn dataset(dir: &Path, config: ToySimulationConfig, name: &str) -> PathBuf {
    let raw = dir.join(format!("{name}.simtel"));
    ToySimulation::new(config).write_file(&raw).unwrap();
    let mut source = SourceRegistry::builtin()
        .open(&raw, &SourceConfig::default())
        .unwrap();

    let output = dir.join(format!("{name}.dl2"));
    let available: BTreeSet<DataField> =
        [DataField::Raw, DataField::Dl1Image, DataField::Dl1Parameters, DataField::Dl2Energy]
            .into();
    let mut writer = DataWriter::create(
        &output,
        &DataWriterConfig::default(),
        source.subarray().clone(),
        source.is_simulation(),
        &available,
    )
    .unwrap();
    let provenance = vec![serde_json::json!({ "activity_name": format!("process {name}") })];
    while let Some(mut event) = source.next_event().unwrap() {
        for (&tel_id, tel) in event.tel.iter_mut() {
            let n_pixels = tel.raw.as_ref().map_or(0, |raw| raw.n_pixels);
            tel.dl1.image = Some(vec![1.0; n_pixels]);
            tel.dl1.peak_time = Some((0..n_pixels).map(|p| p as f32).collect());
            tel.selected_gain_channel = Some(vec![0; n_pixels]);
            tel.dl1.parameters = Some(ImageParameters {
                hillas: HillasParameters {
                    intensity: Some(n_pixels as f64),
                    psi: Some(f64::from(tel_id)),
                    ..Default::default()
                },
                ..Default::default()
            });
        }
        event.dl2.energy = Some(ReconstructedEnergy {
            energy: Some(1.0),
            ..Default::default()
        });
        writer.write_event(&event).unwrap();
    }
    writer.finish(None, provenance).unwrap()
}

fn run(obs_id: u32) -> ToySimulationConfig {
    ToySimulationConfig {
        obs_id,
        n_events: 5,
        seed: u64::from(obs_id),
        ..Default::default()
    }
}

fn indices(path: &Path) -> Vec<EventIndex> {
    let mut source = ColumnarSource::open(path, &SourceConfig::default()).unwrap();
    let mut out = Vec::new();
    while let Some(event) = source.next_event().unwrap() {
        out.push(event.index);
    }
    out
}

fn events(path: &Path) -> Vec<ArrayEvent> {
    let mut source = ColumnarSource::open(path, &SourceConfig::default()).unwrap();
    let mut out = Vec::new();
    while let Some(event) = source.next_event().unwrap() {
        out.push(event);
    }
    out
}

#[test]
fn test_merge_concatenates_in_input_order() {
    let dir = tempfile::tempdir().unwrap();
    let a = dataset(dir.path(), run(1), "a");
    let b = dataset(dir.path(), run(2), "b");
    let output = dir.path().join("merged.dl2");

    let mut ctx = RunContext::new(false);
    let inputs = [a.clone(), b.clone()];
    let summary = merge(&inputs, &output, &MergeOptions::default(), &mut ctx).unwrap();
    assert_eq!(summary.n_inputs, 2);
    assert_eq!(summary.n_events, 10);
    assert_eq!(summary.output, output);

    let mut expected = indices(&a);
    expected.extend(indices(&b));
    assert_eq!(indices(&output), expected);

    let metadata = DatasetMetadata::read(&output).unwrap();
    assert_eq!(metadata.obs_ids, vec![1, 2]);
    assert_eq!(metadata.n_events, 10);
    let names: Vec<&str> = metadata
        .provenance
        .iter()
        .filter_map(|a| a["activity_name"].as_str())
        .collect();
    assert_eq!(names, vec!["merge", "process a", "process b"]);

    let activity = &ctx.provenance.finished()[0];
    assert_eq!(activity.activity_name, "merge");
    assert_eq!(activity.input.len(), 2);
}

#[test]
fn test_single_input_merge_is_equivalent() {
    let dir = tempfile::tempdir().unwrap();
    let a = dataset(dir.path(), run(1), "a");
    let output = dir.path().join("copy.dl2");
    merge(&[a.clone()], &output, &MergeOptions::default(), &mut RunContext::new(false)).unwrap();

    let original = events(&a);
    let copy = events(&output);
    assert_eq!(original.len(), copy.len());
    for (x, y) in original.iter().zip(&copy) {
        assert_eq!(x.index, y.index);
        assert_eq!(x.trigger, y.trigger);
        assert_eq!(x.simulation, y.simulation);
        assert_eq!(x.dl2, y.dl2);
        assert_eq!(x.tel_ids(), y.tel_ids());
        for (tel_id, tel) in &x.tel {
            assert_eq!(tel.dl1, y.tel[tel_id].dl1);
            assert_eq!(tel.selected_gain_channel, y.tel[tel_id].selected_gain_channel);
        }
    }
    assert!(original.iter().any(|e| !e.tel.is_empty()));
}

#[test]
fn test_duplicate_events_abort_before_writing() {
    let dir = tempfile::tempdir().unwrap();
    let a = dataset(dir.path(), run(1), "a");
    let b = dataset(dir.path(), run(1), "b");
    let output = dir.path().join("merged.dl2");

    let mut ctx = RunContext::new(false);
    let inputs = [a.clone(), b.clone()];
    let err = merge(&inputs, &output, &MergeOptions::default(), &mut ctx).unwrap_err();
    match err {
        MergeError::DuplicateEvent {
            index,
            file,
            first_file,
        } => {
            assert_eq!(index, EventIndex::new(1, 1));
            assert_eq!(file, b);
            assert_eq!(first_file, a);
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(!output.exists());
    assert!(!dir.path().join("merged.dl2.partial").exists());
    assert_eq!(
        ctx.provenance.finished()[0].status,
        cta_core::provenance::ActivityStatus::Failed
    );
}

#[test]
fn test_subarray_mismatch_names_the_field() {
    let dir = tempfile::tempdir().unwrap();
    let a = dataset(dir.path(), run(1), "a");
    let b = dataset(
        dir.path(),
        ToySimulationConfig {
            n_tels: 3,
            ..run(2)
        },
        "b",
    );
    let output = dir.path().join("merged.dl2");

    let err = merge(&[a, b.clone()], &output, &MergeOptions::default(), &mut RunContext::new(false))
        .unwrap_err();
    match err {
        MergeError::SubarrayMismatch { file, field } => {
            assert_eq!(file, b);
            assert_eq!(field, "n_telescopes");
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(!output.exists());
}

#[test]
fn test_dropping_images_keeps_everything_else() {
    let dir = tempfile::tempdir().unwrap();
    let a = dataset(dir.path(), run(1), "a");
    let b = dataset(dir.path(), run(2), "b");
    let output = dir.path().join("slim.dl2");
    let options = MergeOptions {
        include_dl1_images: false,
        ..Default::default()
    };

    let summary = merge(&[a, b], &output, &options, &mut RunContext::new(false)).unwrap();
    assert!(!summary.tables.contains(&Table::Images));
    assert!(summary.tables.contains(&Table::Energy));
    assert!(!Table::Images.file_path(&output).exists());

    let merged = events(&output);
    assert_eq!(merged.len(), 10);
    assert!(merged.iter().all(|e| e.dl2.energy.is_some()));
    for tel in merged.iter().flat_map(|e| e.tel.values()) {
        assert!(tel.dl1.image.is_none());
        assert!(tel.dl1.parameters.is_some());
    }
}

#[test]
fn test_existing_output_needs_overwrite() {
    let dir = tempfile::tempdir().unwrap();
    let a = dataset(dir.path(), run(1), "a");
    let output = dir.path().join("merged.dl2");
    std::fs::create_dir(&output).unwrap();

    let err = merge(&[a.clone()], &output, &MergeOptions::default(), &mut RunContext::new(false))
        .unwrap_err();
    assert!(matches!(err, MergeError::OutputExists { .. }));

    let mut ctx = RunContext::new(false);
    let err = merge(&[a.clone()], &a, &MergeOptions::default(), &mut ctx).unwrap_err();
    assert!(matches!(err, MergeError::OutputExists { .. }));

    let options = MergeOptions {
        overwrite: true,
        ..Default::default()
    };
    merge(&[a], &output, &options, &mut RunContext::new(false)).unwrap();
    assert!(DatasetMetadata::read(&output).is_ok());
}

#[test]
fn test_no_inputs() {
    let dir = tempfile::tempdir().unwrap();
    let err = merge(
        &[],
        &dir.path().join("out.dl2"),
        &MergeOptions::default(),
        &mut RunContext::new(false),
    )
    .unwrap_err();
    assert!(matches!(err, MergeError::NoInputs));
}
