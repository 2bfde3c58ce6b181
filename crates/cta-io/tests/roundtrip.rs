//! Block stream → dataset → columnar source.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use cta_core::containers::{
    HillasParameters, ImageParameters, LeakageParameters, MorphologyParameters,
    ParticleClassification, ReconstructedEnergy, ReconstructedGeometry,
};
use cta_core::{ArrayEvent, DataField, EventIndex};
use cta_io::source::ColumnarSource;
use cta_io::{
    DataWriter, DataWriterConfig, EventSource, SourceConfig, SourceRegistry, ToySimulation,
    ToySimulationConfig,
};

const AVAILABLE: [DataField; 6] = [
    DataField::Raw,
    DataField::Dl1Image,
    DataField::Dl1Parameters,
    DataField::Dl2Geometry,
    DataField::Dl2Energy,
    DataField::Dl2Classification,
];

fn simulate(dir: &Path, config: ToySimulationConfig) -> PathBuf {
    let path = dir.join(format!("run{}.simtel", config.obs_id));
    ToySimulation::new(config).write_file(&path).unwrap();
    path
}

/// Stand-in for the processing stages: pixel charge is the high-gain trace
/// sum, every other DL1 and DL2 field gets a value derived from the event.
fn fake_dl1(event: &mut ArrayEvent) {
    let event_id = event.index.event_id as f64;
    for (&tel_id, tel) in event.tel.iter_mut() {
        let Some(raw) = &tel.raw else { continue };
        let n_pixels = raw.n_pixels;
        let image: Vec<f32> = (0..n_pixels)
            .map(|pixel| {
                let sum: f32 = raw.trace(0, pixel).iter().map(|&s| f32::from(s)).sum();
                sum / 1000.0
            })
            .collect();
        tel.selected_gain_channel = Some((0..n_pixels).map(|p| (p % 2) as u8).collect());
        tel.dl1.peak_time = Some((0..n_pixels).map(|p| p as f32 * 0.25 + 3.0).collect());
        tel.dl1.image_mask = Some(image.iter().map(|&q| q > 2.5).collect());
        tel.dl1.image = Some(image);
        tel.dl1.parameters = Some(ImageParameters {
            hillas: HillasParameters {
                intensity: Some(100.0 + event_id),
                x: Some(0.125),
                y: Some(-0.2),
                r: Some(0.236),
                phi: Some(-58.0),
                length: Some(0.05),
                width: Some(0.01),
                psi: Some(f64::from(tel_id) * 10.0),
                skewness: Some(0.3),
                kurtosis: None,
            },
            leakage: LeakageParameters {
                pixels_width_1: Some(0.0),
                pixels_width_2: Some(0.1),
                intensity_width_1: Some(0.0),
                intensity_width_2: Some(0.25),
            },
            morphology: MorphologyParameters {
                n_pixels: Some(12),
                n_islands: Some(1),
            },
        });
    }
    if event.decode_error.is_none() {
        event.dl2.geometry = Some(ReconstructedGeometry {
            alt: Some(70.0 + event_id / 100.0),
            alt_uncert: None,
            az: Some(180.5),
            az_uncert: None,
            core_x: Some(-12.5),
            core_y: Some(40.0),
            n_tels: Some(event.tel.len() as i64),
            is_valid: Some(true),
        });
        event.dl2.energy = Some(ReconstructedEnergy {
            energy: event.simulation.as_ref().and_then(|s| s.energy),
            energy_uncert: None,
            is_valid: Some(true),
        });
        event.dl2.classification = Some(ParticleClassification {
            score: Some(0.875),
            score_uncert: Some(0.05),
            is_valid: Some(true),
        });
    }
}

fn read_all(source: &mut dyn EventSource) -> Vec<ArrayEvent> {
    let mut events = Vec::new();
    while let Some(event) = source.next_event().unwrap() {
        events.push(event);
    }
    events
}

/// Write every event of `input` (with fake DL1/DL2) into `output`.
fn convert(input: &Path, output: &Path) -> Vec<ArrayEvent> {
    let mut source = SourceRegistry::builtin()
        .open(input, &SourceConfig::default())
        .unwrap();
    let available: BTreeSet<DataField> = AVAILABLE.into();
    let mut writer = DataWriter::create(
        output,
        &DataWriterConfig::default(),
        source.subarray().clone(),
        source.is_simulation(),
        &available,
    )
    .unwrap();

    let mut written = Vec::new();
    for mut event in read_all(&mut source) {
        fake_dl1(&mut event);
        writer.write_event(&event).unwrap();
        written.push(event);
    }
    writer.finish(None, Vec::new()).unwrap();
    written
}

#[test]
fn test_written_events_read_back_equal() {
    let dir = tempfile::tempdir().unwrap();
    let input = simulate(dir.path(), ToySimulationConfig::default());
    let output = dir.path().join("run1.dl1");
    let written = convert(&input, &output);

    let mut source = SourceRegistry::builtin()
        .open(&output, &SourceConfig::default())
        .unwrap();
    assert_eq!(source.name(), "columnar");
    assert_eq!(source.obs_ids(), &[1]);
    assert!(source.is_simulation());
    assert_eq!(source.n_events_hint(), Some(10));
    assert_eq!(source.datalevels(), &AVAILABLE[1..]);
    assert_eq!(**source.subarray(), *written[0].subarray);

    let read = read_all(&mut source);
    assert_eq!(read.len(), written.len());
    for (a, b) in written.iter().zip(&read) {
        assert_eq!(a.index, b.index);
        assert_eq!(a.trigger, b.trigger);
        assert_eq!(a.pointing, b.pointing);
        assert_eq!(a.simulation, b.simulation);
        assert_eq!(a.dl2, b.dl2);
        assert_eq!(a.tel_ids(), b.tel_ids());
        for (tel_id, tel) in &a.tel {
            let other = &b.tel[tel_id];
            assert_eq!(tel.dl1, other.dl1);
            assert_eq!(tel.selected_gain_channel, other.selected_gain_channel);
            assert!(tel.dl1.parameters.is_some());
            assert!(other.raw.is_none());
        }
    }
}

#[test]
fn test_decode_error_survives_the_dataset() {
    let dir = tempfile::tempdir().unwrap();
    let input = simulate(
        dir.path(),
        ToySimulationConfig {
            corrupt_events: vec![3],
            ..Default::default()
        },
    );
    let output = dir.path().join("run1.dl1");
    let written = convert(&input, &output);
    assert!(written[3].decode_error.is_some());

    let mut source = ColumnarSource::open(&output, &SourceConfig::default()).unwrap();
    let read = read_all(&mut source);
    let failed: Vec<u64> = read
        .iter()
        .filter(|e| e.decode_error.is_some())
        .map(|e| e.count)
        .collect();
    assert_eq!(failed, vec![3]);
    assert!(read[3].tel.is_empty());
    assert!(read[3].dl2.energy.is_none());
    assert!(read[3].dl2.geometry.is_none());
    assert_eq!(
        read[3].decode_error.as_ref().map(|e| e.message.clone()),
        written[3].decode_error.as_ref().map(|e| e.message.clone())
    );
}

#[test]
fn test_columnar_source_caps_and_filters() {
    let dir = tempfile::tempdir().unwrap();
    let input = simulate(dir.path(), ToySimulationConfig::default());
    let output = dir.path().join("run1.dl1");
    convert(&input, &output);

    let config = SourceConfig {
        allowed_tels: Some(vec![2, 3]),
        max_events: Some(4),
        ..Default::default()
    };
    let mut source = ColumnarSource::open(&output, &config).unwrap();
    assert_eq!(source.n_events_hint(), Some(4));
    assert_eq!(source.subarray().tel_ids(), vec![2, 3]);

    let read = read_all(&mut source);
    assert_eq!(read.len(), 4);
    assert_eq!(source.events_read(), 4);
    for event in &read {
        assert!(event.tel.keys().all(|id| [2, 3].contains(id)));
        assert!(event
            .trigger
            .tels_with_trigger
            .iter()
            .all(|id| [2, 3].contains(id)));
    }
}

#[test]
fn test_seek_skips_forward_only() {
    let dir = tempfile::tempdir().unwrap();
    let input = simulate(dir.path(), ToySimulationConfig::default());
    let output = dir.path().join("run1.dl1");
    convert(&input, &output);

    let mut source = ColumnarSource::open(&output, &SourceConfig::default()).unwrap();
    source.seek(6).unwrap();
    let event = source.next_event().unwrap().unwrap();
    assert_eq!(event.count, 6);
    assert_eq!(event.index.event_id, 7);
    assert!(source.seek(2).is_err());
}

#[test]
fn test_repeated_event_index_is_a_write_error() {
    let dir = tempfile::tempdir().unwrap();
    let input = simulate(dir.path(), ToySimulationConfig::default());
    let output = dir.path().join("run1.dl1");
    let mut source = SourceRegistry::builtin()
        .open(&input, &SourceConfig::default())
        .unwrap();
    let available: BTreeSet<DataField> = AVAILABLE.into();
    let mut writer = DataWriter::create(
        &output,
        &DataWriterConfig::default(),
        source.subarray().clone(),
        source.is_simulation(),
        &available,
    )
    .unwrap();

    let mut event = source.next_event().unwrap().unwrap();
    fake_dl1(&mut event);
    writer.write_event(&event).unwrap();
    let err = writer.write_event(&event).unwrap_err();
    assert!(err.to_string().contains("already written"), "{err}");
    assert_eq!(writer.events_written(), 1);

    let mut next = source.next_event().unwrap().unwrap();
    fake_dl1(&mut next);
    writer.write_event(&next).unwrap();
    writer.finish(None, Vec::new()).unwrap();

    let read = read_all(&mut ColumnarSource::open(&output, &SourceConfig::default()).unwrap());
    let indices: Vec<EventIndex> = read.iter().map(|e| e.index).collect();
    assert_eq!(indices, vec![event.index, next.index]);
}
