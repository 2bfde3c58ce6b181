//! Processing stage abstraction.
//!
//! A [`Stage`] advances an [`ArrayEvent`] by one step of the event state
//! machine. It declares the field groups it reads and writes; the pipeline
//! uses the declarations to check the composition at setup and to clear the
//! right fields when a stage fails on an event.
//!
//! # Registry
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────┐
//! │                  StageRegistry::builtin()                  │
//! │  calibrator        Raw           ──▶ Dl1Image              │
//! │  image_processor   Dl1Image      ──▶ Dl1Parameters         │
//! │  shower_processor  Dl1Parameters ──▶ Dl2Geometry/Energy/   │
//! │                                      Classification        │
//! └────────────────────────────────────────────────────────────┘
//!            │ build(["calibrator", ...], tool config, subarray)
//!            ▼
//!   Vec<Box<dyn Stage>>  in the order given by `stages`
//! ```
//!
//! Each factory contributes its [`ComponentSchema`] to the tool schema, so a
//! stage's parameters live under `<tool>.<stage name>`.

use std::collections::BTreeSet;
use std::sync::Arc;

use cta_core::config::{ComponentConfig, ComponentSchema};
use cta_core::{
    ArrayEvent, ConfigurationError, DataField, RunContext, StageComputationError,
    SubarrayDescription,
};
use tracing::debug;

use crate::calib::CalibratorFactory;
use crate::image::ImageProcessorFactory;
use crate::reco::ShowerProcessorFactory;

/// One configurable processing step.
pub trait Stage {
    /// Stage name, equal to its configuration section key.
    fn name(&self) -> &'static str;

    /// Field groups the stage reads.
    fn reads(&self) -> &'static [DataField];

    /// Field groups the stage writes.
    fn writes(&self) -> &'static [DataField];

    /// Advance one event in place. On error the pipeline clears everything
    /// this stage and later stages write.
    fn process(
        &mut self,
        event: &mut ArrayEvent,
        ctx: &RunContext,
    ) -> Result<(), StageComputationError>;

    /// Called once after the last event, to report stage counters.
    fn finish(&mut self, _ctx: &mut RunContext) {}
}

/// Constructor of one stage type.
pub trait StageFactory: Send + Sync {
    /// Stage name used in the `stages` list.
    fn name(&self) -> &'static str;

    /// One-line description.
    fn description(&self) -> &'static str;

    /// Declared parameters, keyed by [`StageFactory::name`].
    fn schema(&self) -> ComponentSchema;

    /// Build the stage from its resolved section. The subarray is the one of
    /// the source the stage will see events from.
    fn build(
        &self,
        config: &ComponentConfig,
        subarray: &Arc<SubarrayDescription>,
    ) -> Result<Box<dyn Stage>, ConfigurationError>;
}

/// Known stage types.
#[derive(Default)]
pub struct StageRegistry {
    factories: Vec<Box<dyn StageFactory>>,
}

impl std::fmt::Debug for StageRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StageRegistry")
            .field("factories", &self.names())
            .finish()
    }
}

impl StageRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the calibrator, image processor and shower processor.
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        registry.register(CalibratorFactory);
        registry.register(ImageProcessorFactory);
        registry.register(ShowerProcessorFactory);
        registry
    }

    /// Add a stage type.
    pub fn register(&mut self, factory: impl StageFactory + 'static) {
        self.factories.push(Box::new(factory));
    }

    /// Registered stage names.
    pub fn names(&self) -> Vec<&'static str> {
        self.factories.iter().map(|f| f.name()).collect()
    }

    /// `(name, description)` of every stage type.
    pub fn describe(&self) -> Vec<(&'static str, &'static str)> {
        self.factories
            .iter()
            .map(|f| (f.name(), f.description()))
            .collect()
    }

    /// Schemas of every stage type, to be nested below a tool section.
    pub fn schemas(&self) -> Vec<ComponentSchema> {
        self.factories.iter().map(|f| f.schema()).collect()
    }

    /// Build the named stages, in order, from their sections below `tool`.
    ///
    /// `stages_key` is the dotted key of the stage list, used in errors.
    pub fn build(
        &self,
        names: &[String],
        tool: &ComponentConfig,
        stages_key: &str,
        subarray: &Arc<SubarrayDescription>,
    ) -> Result<Vec<Box<dyn Stage>>, ConfigurationError> {
        let mut stages = Vec::with_capacity(names.len());
        let mut seen = BTreeSet::new();
        for name in names {
            let factory = self
                .factories
                .iter()
                .find(|f| f.name() == name)
                .ok_or_else(|| {
                    ConfigurationError::invalid(
                        stages_key,
                        name,
                        format!("stage names among {}", self.names().join(", ")),
                    )
                })?;
            if !seen.insert(name.as_str()) {
                return Err(ConfigurationError::invalid(
                    stages_key,
                    name,
                    "each stage at most once",
                ));
            }
            let stage = factory.build(tool.child(factory.name())?, subarray)?;
            debug!(stage = stage.name(), "Stage built");
            stages.push(stage);
        }
        Ok(stages)
    }
}

/// Check that every stage can run on what the source provides plus what
/// earlier stages write, and return the field groups available at the end.
///
/// A stage can run when everything it reads is available, or when
/// everything it writes already is (it then passes events through).
pub fn check_chain(
    stages: &[Box<dyn Stage>],
    datalevels: &[DataField],
) -> Result<BTreeSet<DataField>, ConfigurationError> {
    let mut available: BTreeSet<DataField> = datalevels.iter().copied().collect();
    for stage in stages {
        let reads_ok = stage.reads().iter().all(|f| available.contains(f));
        let writes_present = stage.writes().iter().all(|f| available.contains(f));
        if !reads_ok && !writes_present {
            let missing: Vec<&str> = stage
                .reads()
                .iter()
                .filter(|f| !available.contains(f))
                .map(|f| f.name())
                .collect();
            return Err(ConfigurationError::Setup(format!(
                "stage '{}' needs {} which neither the source nor an earlier stage provides",
                stage.name(),
                missing.join(", ")
            )));
        }
        available.extend(stage.writes().iter().copied());
    }
    Ok(available)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fake {
        name: &'static str,
        reads: &'static [DataField],
        writes: &'static [DataField],
    }

    impl Stage for Fake {
        fn name(&self) -> &'static str {
            self.name
        }
        fn reads(&self) -> &'static [DataField] {
            self.reads
        }
        fn writes(&self) -> &'static [DataField] {
            self.writes
        }
        fn process(
            &mut self,
            _: &mut ArrayEvent,
            _: &RunContext,
        ) -> Result<(), StageComputationError> {
            Ok(())
        }
    }

    fn fake(
        name: &'static str,
        reads: &'static [DataField],
        writes: &'static [DataField],
    ) -> Box<dyn Stage> {
        Box::new(Fake { name, reads, writes })
    }

    #[test]
    fn test_chain_accumulates_outputs() {
        let stages = vec![
            fake("a", &[DataField::Raw], &[DataField::Dl1Image]),
            fake("b", &[DataField::Dl1Image], &[DataField::Dl1Parameters]),
        ];
        let available = check_chain(&stages, &[DataField::Raw]).unwrap();
        assert!(available.contains(&DataField::Dl1Parameters));
    }

    #[test]
    fn test_chain_rejects_missing_input() {
        let stages = vec![fake("b", &[DataField::Dl1Image], &[DataField::Dl1Parameters])];
        let err = check_chain(&stages, &[DataField::Raw]).unwrap_err();
        assert!(err.to_string().contains("dl1.image"));
    }

    #[test]
    fn test_chain_accepts_pass_through() {
        let stages = vec![fake("a", &[DataField::Raw], &[DataField::Dl1Image])];
        assert!(check_chain(&stages, &[DataField::Dl1Image]).is_ok());
    }

    #[test]
    fn test_builtin_names() {
        assert_eq!(
            StageRegistry::builtin().names(),
            vec!["calibrator", "image_processor", "shower_processor"]
        );
    }
}
