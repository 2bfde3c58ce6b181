//! `merge`: concatenate datasets of independent runs.

use std::path::PathBuf;

use cta_core::config::{
    resolve, Component, ComponentConfig, ComponentSchema, ConfigSources, ParamSpec, ParamType,
};
use cta_core::{ConfigurationError, CtaError, RunContext};
use cta_io::{merge, MergeOptions, MergeSummary};
use serde::Deserialize;
use tracing::info;

#[derive(Debug, Clone, Deserialize)]
struct MergeParams {
    inputs: Vec<PathBuf>,
    output: PathBuf,
}

/// The merge tool.
#[derive(Debug, Clone)]
pub struct MergeTool {
    params: MergeParams,
    options: MergeOptions,
}

impl Component for MergeTool {
    const NAME: &'static str = "merge";

    fn schema() -> ComponentSchema {
        ComponentSchema::new(Self::NAME, "Merge datasets into one")
            .param(
                ParamSpec::new("inputs", ParamType::StrList)
                    .help("Datasets to merge, in output order"),
            )
            .param(ParamSpec::new("output", ParamType::Path).help("Merged dataset"))
            .child(MergeOptions::schema())
    }

    fn from_config(config: &ComponentConfig) -> Result<Self, ConfigurationError> {
        Ok(Self {
            params: config.extract()?,
            options: MergeOptions::from_config(config.child(MergeOptions::NAME)?)?,
        })
    }
}

impl MergeTool {
    /// Resolve the tool schema from `sources` and build the tool.
    pub fn from_sources(sources: &ConfigSources) -> Result<Self, ConfigurationError> {
        Self::from_config(&resolve(&Self::schema(), sources)?)
    }

    /// Validate and merge. Nothing is written when validation fails.
    pub fn run(&self, ctx: &mut RunContext) -> Result<MergeSummary, CtaError> {
        info!(
            inputs = self.params.inputs.len(),
            output = %self.params.output.display(),
            "Merging datasets"
        );
        Ok(merge(&self.params.inputs, &self.params.output, &self.options, ctx)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inputs_from_comma_list() {
        let tool = MergeTool::from_sources(
            &ConfigSources::default()
                .set("inputs", "a.dl1,b.dl1")
                .set("output", "all.dl1")
                .set("options.include_dl1_images", false),
        )
        .unwrap();
        assert_eq!(tool.params.inputs, vec![PathBuf::from("a.dl1"), PathBuf::from("b.dl1")]);
        assert!(!tool.options.include_dl1_images);
        assert!(tool.options.include_dl2);
    }

    #[test]
    fn test_output_is_required() {
        let err = MergeTool::from_sources(&ConfigSources::default().set("inputs", "a.dl1"))
            .unwrap_err();
        assert!(err.to_string().contains("merge.output"));
    }
}
