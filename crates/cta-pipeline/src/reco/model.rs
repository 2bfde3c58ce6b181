//! Regression and classification models used by the shower processor.
//!
//! A [`Model`] maps a batch of feature rows to one [`Prediction`] per row.
//! Training happens elsewhere; a trained model is handed over as a JSON file
//! tagged with its `kind`:
//!
//! ```json
//! { "kind": "linear", "features": ["hillas_intensity"], "coefficients": [1.0],
//!   "intercept": -2.7, "log10_features": true, "log10_target": true,
//!   "uncertainty": 0.1 }
//! ```
//!
//! Without a file, the parameters of the configuration section define the
//! model inline.

use std::path::{Path, PathBuf};

use cta_core::config::{ComponentConfig, ComponentSchema, ParamSpec, ParamType};
use cta_core::containers::ImageParameters;
use cta_core::ConfigurationError;
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;

/// Model loading and evaluation failures.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ModelError {
    /// The feature columns handed to the model are not the ones it expects.
    #[error("model expects features {expected:?}, got {got:?}")]
    FeatureMismatch {
        /// Columns of the model.
        expected: Vec<String>,
        /// Columns supplied.
        got: Vec<String>,
    },

    /// A model file could not be read or parsed.
    #[error("cannot load model {}: {message}", .path.display())]
    Load {
        /// Model file.
        path: PathBuf,
        /// I/O or parser message.
        message: String,
    },

    /// The model definition or an input row is unusable.
    #[error("invalid model input: {0}")]
    Invalid(String),
}

/// Feature rows with named columns.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FeatureMatrix {
    /// Column names, in row order.
    pub columns: Vec<String>,
    /// One row per telescope.
    pub rows: Vec<Vec<f64>>,
}

impl FeatureMatrix {
    /// Empty matrix with the given columns.
    pub fn new(columns: Vec<String>) -> Self {
        Self {
            columns,
            rows: Vec::new(),
        }
    }

    /// Number of rows.
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// True without rows.
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// One model output.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Prediction {
    /// Predicted value (energy in TeV, or gammaness).
    pub value: f64,
    /// One-sigma uncertainty in the same unit.
    pub uncertainty: f64,
}

/// A trained model.
pub trait Model: std::fmt::Debug + Send {
    /// Model family, e.g. `"linear"`.
    fn kind(&self) -> &'static str;

    /// Feature columns the model reads, in order.
    fn features(&self) -> &[String];

    /// Predict every row of `features`.
    fn predict(&self, features: &FeatureMatrix) -> Result<Vec<Prediction>, ModelError>;
}

fn check_columns(model: &dyn Model, features: &FeatureMatrix) -> Result<(), ModelError> {
    if features.columns != model.features() {
        return Err(ModelError::FeatureMismatch {
            expected: model.features().to_vec(),
            got: features.columns.clone(),
        });
    }
    Ok(())
}

fn linear_term(
    columns: &[String],
    coefficients: &[f64],
    row: &[f64],
    log10: bool,
) -> Result<f64, ModelError> {
    let mut sum = 0.0;
    for ((column, &c), &v) in columns.iter().zip(coefficients).zip(row) {
        let x = if log10 { v.log10() } else { v };
        if !x.is_finite() {
            return Err(ModelError::Invalid(format!(
                "feature '{column}' = {v} is not usable"
            )));
        }
        sum += c * x;
    }
    Ok(sum)
}

/// Linear regression, optionally in log10 space.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinearModel {
    /// Feature columns.
    pub features: Vec<String>,
    /// One coefficient per feature.
    pub coefficients: Vec<f64>,
    /// Constant term.
    pub intercept: f64,
    /// Take log10 of every feature first.
    #[serde(default)]
    pub log10_features: bool,
    /// The linear combination predicts log10 of the target.
    #[serde(default)]
    pub log10_target: bool,
    /// Uncertainty of the linear combination (in log10 units when
    /// `log10_target` is set).
    #[serde(default)]
    pub uncertainty: f64,
}

impl Model for LinearModel {
    fn kind(&self) -> &'static str {
        "linear"
    }

    fn features(&self) -> &[String] {
        &self.features
    }

    fn predict(&self, features: &FeatureMatrix) -> Result<Vec<Prediction>, ModelError> {
        check_columns(self, features)?;
        features
            .rows
            .iter()
            .map(|row| {
                let y = self.intercept
                    + linear_term(&self.features, &self.coefficients, row, self.log10_features)?;
                Ok(if self.log10_target {
                    let value = 10f64.powf(y);
                    Prediction {
                        value,
                        uncertainty: value * std::f64::consts::LN_10 * self.uncertainty,
                    }
                } else {
                    Prediction {
                        value: y,
                        uncertainty: self.uncertainty,
                    }
                })
            })
            .collect()
    }
}

/// Logistic classifier returning the gamma probability.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogisticModel {
    /// Feature columns.
    pub features: Vec<String>,
    /// One coefficient per feature.
    pub coefficients: Vec<f64>,
    /// Constant term.
    pub intercept: f64,
}

impl Model for LogisticModel {
    fn kind(&self) -> &'static str {
        "logistic"
    }

    fn features(&self) -> &[String] {
        &self.features
    }

    fn predict(&self, features: &FeatureMatrix) -> Result<Vec<Prediction>, ModelError> {
        check_columns(self, features)?;
        features
            .rows
            .iter()
            .map(|row| {
                let z = self.intercept
                    + linear_term(&self.features, &self.coefficients, row, false)?;
                let p = 1.0 / (1.0 + (-z).exp());
                Ok(Prediction {
                    value: p,
                    uncertainty: (p * (1.0 - p)).sqrt(),
                })
            })
            .collect()
    }
}

/// Serialised model of any supported kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ModelSpec {
    /// [`LinearModel`].
    Linear(LinearModel),
    /// [`LogisticModel`].
    Logistic(LogisticModel),
}

impl ModelSpec {
    /// Read a model file.
    pub fn load(path: &Path) -> Result<Self, ModelError> {
        let load_error = |message: String| ModelError::Load {
            path: path.to_path_buf(),
            message,
        };
        let text = std::fs::read_to_string(path).map_err(|e| load_error(e.to_string()))?;
        serde_json::from_str(&text).map_err(|e| load_error(e.to_string()))
    }

    /// Check shapes and hand out the model.
    pub fn into_model(self) -> Result<Box<dyn Model>, ModelError> {
        let (features, coefficients) = match &self {
            ModelSpec::Linear(m) => (&m.features, &m.coefficients),
            ModelSpec::Logistic(m) => (&m.features, &m.coefficients),
        };
        if features.is_empty() || features.len() != coefficients.len() {
            return Err(ModelError::Invalid(format!(
                "{} features but {} coefficients",
                features.len(),
                coefficients.len()
            )));
        }
        Ok(match self {
            ModelSpec::Linear(m) => Box::new(m),
            ModelSpec::Logistic(m) => Box::new(m),
        })
    }
}

fn model_path_param() -> ParamSpec {
    ParamSpec::new("model_path", ParamType::Path)
        .optional()
        .help("Trained model file (JSON); overrides the inline parameters")
}

/// Section of the energy regressor. Inline parameters describe a
/// [`LinearModel`].
pub fn regressor_schema(key: &str) -> ComponentSchema {
    ComponentSchema::new(key, "Per-telescope energy regressor")
        .param(model_path_param())
        .param(
            ParamSpec::new("features", ParamType::StrList)
                .default(json!(["hillas_intensity"]))
                .help("Image parameter columns fed to the model"),
        )
        .param(
            ParamSpec::new("coefficients", ParamType::FloatList)
                .default(json!([1.0]))
                .help("One coefficient per feature"),
        )
        .param(ParamSpec::new("intercept", ParamType::Float).default(-2.7))
        .param(
            ParamSpec::new("log10_features", ParamType::Bool)
                .default(true)
                .help("Take log10 of the features"),
        )
        .param(
            ParamSpec::new("log10_target", ParamType::Bool)
                .default(true)
                .help("The model predicts log10(energy / TeV)"),
        )
        .param(
            ParamSpec::new("uncertainty", ParamType::Float)
                .default(0.1)
                .range(Some(0.0), None)
                .help("Per-telescope uncertainty of the linear combination"),
        )
}

/// Section of the particle classifier. Inline parameters describe a
/// [`LogisticModel`].
pub fn classifier_schema(key: &str) -> ComponentSchema {
    ComponentSchema::new(key, "Per-telescope gamma/hadron classifier")
        .param(model_path_param())
        .param(
            ParamSpec::new("features", ParamType::StrList)
                .default(json!(["hillas_width", "hillas_length"]))
                .help("Image parameter columns fed to the model"),
        )
        .param(
            ParamSpec::new("coefficients", ParamType::FloatList)
                .default(json!([-60.0, -10.0]))
                .help("One coefficient per feature"),
        )
        .param(ParamSpec::new("intercept", ParamType::Float).default(3.0))
}

/// Build the model of a regressor or classifier section.
///
/// A set `model_path` wins over the inline parameters, which are read as
/// `inline_kind`. Feature columns must be image parameter columns.
pub fn build_model(
    config: &ComponentConfig,
    inline_kind: &str,
) -> Result<Box<dyn Model>, ConfigurationError> {
    let spec = match config.get_str("model_path") {
        Some(path) => ModelSpec::load(Path::new(path))
            .map_err(|e| {
                ConfigurationError::invalid(
                    config.key("model_path"),
                    path,
                    format!("a readable model file ({e})"),
                )
            })?,
        None => {
            let mut inline = config.to_json();
            if let Some(map) = inline.as_object_mut() {
                map.remove("model_path");
                map.insert("kind".into(), inline_kind.into());
            }
            serde_json::from_value(inline).map_err(|e| {
                ConfigurationError::Setup(format!("section '{}': {e}", config.path()))
            })?
        }
    };
    let model = spec
        .into_model()
        .map_err(|e| ConfigurationError::Setup(format!("section '{}': {e}", config.path())))?;

    let columns = ImageParameters::column_names();
    if let Some(bad) = model.features().iter().find(|f| !columns.contains(f)) {
        return Err(ConfigurationError::invalid(
            config.key("features"),
            bad,
            "image parameter columns such as hillas_intensity",
        ));
    }
    Ok(model)
}

#[cfg(test)]
mod tests {
    use super::*;
    use cta_core::config::{resolve, ConfigSources};

    fn energy_model() -> LinearModel {
        LinearModel {
            features: vec!["hillas_intensity".into()],
            coefficients: vec![1.0],
            intercept: -2.0,
            log10_features: true,
            log10_target: true,
            uncertainty: 0.0,
        }
    }

    #[test]
    fn test_linear_log_model() {
        let mut features = FeatureMatrix::new(vec!["hillas_intensity".into()]);
        features.rows.push(vec![1000.0]);
        features.rows.push(vec![100.0]);
        let predictions = energy_model().predict(&features).unwrap();
        assert!((predictions[0].value - 10.0).abs() < 1e-9);
        assert!((predictions[1].value - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_non_positive_log_feature_is_rejected() {
        let mut features = FeatureMatrix::new(vec!["hillas_intensity".into()]);
        features.rows.push(vec![0.0]);
        assert!(matches!(
            energy_model().predict(&features),
            Err(ModelError::Invalid(_))
        ));
    }

    #[test]
    fn test_feature_mismatch() {
        let features = FeatureMatrix::new(vec!["hillas_width".into()]);
        assert!(matches!(
            energy_model().predict(&features),
            Err(ModelError::FeatureMismatch { .. })
        ));
    }

    #[test]
    fn test_logistic_midpoint() {
        let model = LogisticModel {
            features: vec!["hillas_width".into()],
            coefficients: vec![-100.0],
            intercept: 2.0,
        };
        let mut features = FeatureMatrix::new(vec!["hillas_width".into()]);
        features.rows.push(vec![0.02]);
        let p = model.predict(&features).unwrap()[0];
        assert!((p.value - 0.5).abs() < 1e-12);
        assert!((p.uncertainty - 0.5).abs() < 1e-12);
    }

    #[test]
    fn test_inline_and_file_models() {
        let schema = regressor_schema("energy_regressor");
        let config = resolve(&schema, &ConfigSources::default()).unwrap();
        let model = build_model(&config, "linear").unwrap();
        assert_eq!(model.kind(), "linear");
        assert_eq!(model.features(), ["hillas_intensity".to_string()]);

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gh.json");
        let spec = ModelSpec::Logistic(LogisticModel {
            features: vec!["hillas_length".into()],
            coefficients: vec![-5.0],
            intercept: 1.0,
        });
        std::fs::write(&path, serde_json::to_string(&spec).unwrap()).unwrap();
        let sources = ConfigSources::default().set("model_path", path.display());
        let config = resolve(&classifier_schema("particle_classifier"), &sources).unwrap();
        let model = build_model(&config, "logistic").unwrap();
        assert_eq!(model.features(), ["hillas_length".to_string()]);
    }

    #[test]
    fn test_bad_model_sections() {
        let sources = ConfigSources::default().set("features", "hillas_size");
        let config = resolve(&regressor_schema("energy_regressor"), &sources).unwrap();
        let err = build_model(&config, "linear").unwrap_err();
        assert!(err.to_string().contains("energy_regressor.features"));

        let sources = ConfigSources::default().set("coefficients", "1.0,2.0");
        let config = resolve(&regressor_schema("energy_regressor"), &sources).unwrap();
        assert!(build_model(&config, "linear").is_err());

        let sources = ConfigSources::default().set("model_path", "/nonexistent/model.json");
        let config = resolve(&classifier_schema("particle_classifier"), &sources).unwrap();
        let err = build_model(&config, "logistic").unwrap_err();
        assert!(err.to_string().contains("model_path"));
    }
}
