//! Declared, introspectable configuration.
//!
//! Every configurable component publishes a [`ComponentSchema`]: a named
//! section holding typed [`ParamSpec`]s and nested child sections. A tool's
//! schema is the root of a tree, for example:
//!
//! ```text
//! process
//! ├── input, output, max_events, stages, ...
//! ├── source
//! │   └── allowed_tels, source_type, ...
//! ├── calibrator
//! │   ├── image_extractor_type
//! │   ├── full_waveform_sum
//! │   └── local_peak_window_sum
//! │       └── window_width, window_shift
//! └── writer
//!     └── write_dl1_images, overwrite, ...
//! ```
//!
//! Keys are scoped by their dotted path (`process.calibrator.local_peak_window_sum.window_width`),
//! so parameters with the same name in different sections never collide.
//! [`resolve`] merges defaults, an optional file, and command-line overrides
//! and checks the result strictly against the tree.

mod resolve;

pub use resolve::{resolve, render_toml, ComponentConfig, ConfigSources};

use regex::Regex;
use serde_json::Value;

use crate::error::ConfigurationError;

/// Type of a configuration parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamType {
    /// `true` / `false`.
    Bool,
    /// Signed integer.
    Int,
    /// Float (integers are accepted and widened).
    Float,
    /// Free text.
    Str,
    /// Filesystem path.
    Path,
    /// List of integers.
    IntList,
    /// List of floats.
    FloatList,
    /// List of strings.
    StrList,
    /// List of `[name, value]` string pairs.
    StrPairList,
}

impl ParamType {
    /// Label used in help text and error messages.
    pub fn label(self) -> &'static str {
        match self {
            ParamType::Bool => "bool",
            ParamType::Int => "int",
            ParamType::Float => "float",
            ParamType::Str => "str",
            ParamType::Path => "path",
            ParamType::IntList => "list of int",
            ParamType::FloatList => "list of float",
            ParamType::StrList => "list of str",
            ParamType::StrPairList => "list of [str, str]",
        }
    }
}

/// Extra constraint on a parameter value. Applied to every element of a
/// list parameter.
#[derive(Debug, Clone)]
pub enum Validator {
    /// Inclusive numeric bounds.
    Range {
        /// Lower bound.
        min: Option<f64>,
        /// Upper bound.
        max: Option<f64>,
    },
    /// Allowed string values.
    Choices(Vec<String>),
    /// Strings must match the pattern.
    Regex(Regex),
}

impl Validator {
    /// Human-readable description of what passes.
    pub fn describe(&self) -> String {
        match self {
            Validator::Range { min, max } => match (min, max) {
                (Some(lo), Some(hi)) => format!("value in [{lo}, {hi}]"),
                (Some(lo), None) => format!("value >= {lo}"),
                (None, Some(hi)) => format!("value <= {hi}"),
                (None, None) => "any value".into(),
            },
            Validator::Choices(choices) => format!("one of {}", choices.join(", ")),
            Validator::Regex(re) => format!("text matching /{}/", re.as_str()),
        }
    }

    fn accepts(&self, value: &Value) -> bool {
        match self {
            Validator::Range { min, max } => match value.as_f64() {
                Some(v) => min.map_or(true, |lo| v >= lo) && max.map_or(true, |hi| v <= hi),
                None => false,
            },
            Validator::Choices(choices) => value
                .as_str()
                .map_or(false, |s| choices.iter().any(|c| c == s)),
            Validator::Regex(re) => value.as_str().map_or(false, |s| re.is_match(s)),
        }
    }
}

/// Declaration of one parameter.
#[derive(Debug, Clone)]
pub struct ParamSpec {
    /// Key within the section.
    pub name: String,
    /// Expected type.
    pub ty: ParamType,
    /// Default value; `None` means the parameter must be supplied unless
    /// nullable.
    pub default: Option<Value>,
    /// Whether `null` (unset) is an accepted value.
    pub nullable: bool,
    /// Optional constraint.
    pub validator: Option<Validator>,
    /// Help text.
    pub help: String,
}

impl ParamSpec {
    /// New required parameter.
    pub fn new(name: impl Into<String>, ty: ParamType) -> Self {
        Self {
            name: name.into(),
            ty,
            default: None,
            nullable: false,
            validator: None,
            help: String::new(),
        }
    }

    /// Set the default value.
    pub fn default(mut self, value: impl Into<Value>) -> Self {
        self.default = Some(value.into());
        self
    }

    /// Accept `null` and default to it.
    pub fn optional(mut self) -> Self {
        self.nullable = true;
        self.default = Some(Value::Null);
        self
    }

    /// Restrict numbers to a range.
    pub fn range(mut self, min: Option<f64>, max: Option<f64>) -> Self {
        self.validator = Some(Validator::Range { min, max });
        self
    }

    /// Restrict strings to a set of values.
    pub fn choices<I, S>(mut self, choices: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.validator = Some(Validator::Choices(
            choices.into_iter().map(Into::into).collect(),
        ));
        self
    }

    /// Restrict strings to a pattern.
    pub fn pattern(mut self, regex: Regex) -> Self {
        self.validator = Some(Validator::Regex(regex));
        self
    }

    /// Set the help text.
    pub fn help(mut self, help: impl Into<String>) -> Self {
        self.help = help.into();
        self
    }

    /// Whether the parameter has neither default nor null allowed.
    pub fn is_required(&self) -> bool {
        self.default.is_none() && !self.nullable
    }

    /// One-line summary for introspection output.
    pub fn describe(&self) -> String {
        let mut text = self.ty.label().to_string();
        if self.nullable {
            text.push_str(", optional");
        }
        if self.is_required() {
            text.push_str(", required");
        }
        if let Some(v) = &self.validator {
            text.push_str(", ");
            text.push_str(&v.describe());
        }
        if self.help.is_empty() {
            text
        } else {
            format!("{} ({})", self.help, text)
        }
    }

    /// Coerce and check a value against this declaration.
    ///
    /// Integers are widened for float parameters. Returns the normalised
    /// value or a description of what was expected.
    pub fn check(&self, value: &Value) -> Result<Value, String> {
        if value.is_null() {
            return if self.nullable {
                Ok(Value::Null)
            } else {
                Err(format!("{} (null not allowed)", self.ty.label()))
            };
        }

        let expected = || match &self.validator {
            Some(v) => format!("{}, {}", self.ty.label(), v.describe()),
            None => self.ty.label().to_string(),
        };

        let typed = match self.ty {
            ParamType::Bool => value.as_bool().map(Value::Bool),
            ParamType::Int => value.as_i64().map(Value::from),
            ParamType::Float => value.as_f64().map(Value::from),
            ParamType::Str | ParamType::Path => value.as_str().map(Value::from),
            ParamType::IntList => list_of(value, |v| v.as_i64().map(Value::from)),
            ParamType::FloatList => list_of(value, |v| v.as_f64().map(Value::from)),
            ParamType::StrList => list_of(value, |v| v.as_str().map(Value::from)),
            ParamType::StrPairList => list_of(value, |v| {
                let pair = v.as_array()?;
                match pair.as_slice() {
                    [Value::String(a), Value::String(b)] => {
                        Some(Value::Array(vec![a.clone().into(), b.clone().into()]))
                    }
                    _ => None,
                }
            }),
        }
        .ok_or_else(expected)?;

        if let Some(validator) = &self.validator {
            let ok = match &typed {
                Value::Array(items) => items.iter().all(|v| validator.accepts(v)),
                v => validator.accepts(v),
            };
            if !ok {
                return Err(expected());
            }
        }
        Ok(typed)
    }

    /// Parse a command-line string into a value of this type.
    ///
    /// Lists accept a JSON array or comma separated items; `null` or `none`
    /// unsets nullable parameters.
    pub fn parse_cli(&self, raw: &str) -> Result<Value, String> {
        let trimmed = raw.trim();
        if self.nullable && matches!(trimmed.to_ascii_lowercase().as_str(), "null" | "none") {
            return Ok(Value::Null);
        }
        let parsed = match self.ty {
            ParamType::Bool => match trimmed.to_ascii_lowercase().as_str() {
                "true" | "yes" | "1" => Value::Bool(true),
                "false" | "no" | "0" => Value::Bool(false),
                _ => return Err(self.ty.label().to_string()),
            },
            ParamType::Int => trimmed
                .parse::<i64>()
                .map(Value::from)
                .map_err(|_| self.ty.label().to_string())?,
            ParamType::Float => trimmed
                .parse::<f64>()
                .map(Value::from)
                .map_err(|_| self.ty.label().to_string())?,
            ParamType::Str | ParamType::Path => Value::from(raw),
            ParamType::IntList | ParamType::FloatList | ParamType::StrList
                if !trimmed.starts_with('[') =>
            {
                let items = trimmed
                    .split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty());
                let values: Option<Vec<Value>> = match self.ty {
                    ParamType::IntList => items
                        .map(|s| s.parse::<i64>().ok().map(Value::from))
                        .collect(),
                    ParamType::FloatList => items
                        .map(|s| s.parse::<f64>().ok().map(Value::from))
                        .collect(),
                    _ => items.map(|s| Some(Value::from(s))).collect(),
                };
                Value::Array(values.ok_or_else(|| self.ty.label().to_string())?)
            }
            _ => serde_json::from_str(trimmed).map_err(|_| self.ty.label().to_string())?,
        };
        self.check(&parsed)
    }
}

fn list_of(value: &Value, item: impl Fn(&Value) -> Option<Value>) -> Option<Value> {
    let items = value.as_array()?;
    items
        .iter()
        .map(item)
        .collect::<Option<Vec<_>>>()
        .map(Value::Array)
}

/// Parameter declarations of one component section.
#[derive(Debug, Clone)]
pub struct ComponentSchema {
    /// Section key.
    pub key: String,
    /// Help text.
    pub help: String,
    /// Parameters of this section.
    pub params: Vec<ParamSpec>,
    /// Nested sections.
    pub children: Vec<ComponentSchema>,
}

impl ComponentSchema {
    /// Empty section.
    pub fn new(key: impl Into<String>, help: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            help: help.into(),
            params: Vec::new(),
            children: Vec::new(),
        }
    }

    /// Add a parameter.
    pub fn param(mut self, spec: ParamSpec) -> Self {
        self.params.push(spec);
        self
    }

    /// Add a nested section.
    pub fn child(mut self, schema: ComponentSchema) -> Self {
        self.children.push(schema);
        self
    }

    /// Parameter by name.
    pub fn find_param(&self, name: &str) -> Option<&ParamSpec> {
        self.params.iter().find(|p| p.name == name)
    }

    /// Nested section by key.
    pub fn find_child(&self, key: &str) -> Option<&ComponentSchema> {
        self.children.iter().find(|c| c.key == key)
    }

    /// Parameter declaration at a dotted path relative to this section.
    pub fn lookup(&self, path: &[&str]) -> Option<&ParamSpec> {
        match path {
            [] => None,
            [name] => self.find_param(name),
            [section, rest @ ..] => self.find_child(section)?.lookup(rest),
        }
    }

    /// Defaults of this section and its children as a nested JSON object.
    /// Required parameters are left out.
    pub fn defaults(&self) -> Value {
        let mut map = serde_json::Map::new();
        for p in &self.params {
            if let Some(default) = &p.default {
                map.insert(p.name.clone(), default.clone());
            }
        }
        for c in &self.children {
            map.insert(c.key.clone(), c.defaults());
        }
        Value::Object(map)
    }
}

/// A configurable component with a declared schema.
///
/// Instances are built once per run from their resolved section and never
/// change their parameters afterwards.
pub trait Component: Sized {
    /// Section key of the component.
    const NAME: &'static str;

    /// Declared parameters, keyed by [`Component::NAME`].
    fn schema() -> ComponentSchema;

    /// Build from a resolved section.
    fn from_config(config: &ComponentConfig) -> Result<Self, ConfigurationError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_float_accepts_integer() {
        let spec = ParamSpec::new("threshold", ParamType::Float).default(5.0);
        assert_eq!(spec.check(&json!(7)), Ok(json!(7.0)));
        assert!(spec.check(&json!("7")).is_err());
    }

    #[test]
    fn test_range_applies_to_list_items() {
        let spec = ParamSpec::new("tels", ParamType::IntList)
            .default(json!([]))
            .range(Some(1.0), None);
        assert!(spec.check(&json!([1, 2, 3])).is_ok());
        assert!(spec.check(&json!([1, 0])).is_err());
    }

    #[test]
    fn test_choices_and_pattern() {
        let spec = ParamSpec::new("method", ParamType::Str).choices(["a", "b"]);
        assert!(spec.check(&json!("a")).is_ok());
        let err = spec.check(&json!("c")).unwrap_err();
        assert!(err.contains("one of a, b"));

        let re = Regex::new(r"^[a-z_]+$").unwrap();
        let spec = ParamSpec::new("name", ParamType::Str).pattern(re);
        assert!(spec.check(&json!("ok_name")).is_ok());
        assert!(spec.check(&json!("Bad Name")).is_err());
    }

    #[test]
    fn test_parse_cli_lists() {
        let spec = ParamSpec::new("tels", ParamType::IntList).default(json!([]));
        assert_eq!(spec.parse_cli("1, 2,3"), Ok(json!([1, 2, 3])));
        assert_eq!(spec.parse_cli("[4,5]"), Ok(json!([4, 5])));
        assert!(spec.parse_cli("1,x").is_err());

        let pairs = ParamSpec::new("criteria", ParamType::StrPairList).default(json!([]));
        assert_eq!(
            pairs.parse_cli(r#"[["size", "hillas_intensity > 50"]]"#),
            Ok(json!([["size", "hillas_intensity > 50"]]))
        );
    }

    #[test]
    fn test_nullable() {
        let spec = ParamSpec::new("max_events", ParamType::Int).optional();
        assert_eq!(spec.parse_cli("none"), Ok(Value::Null));
        assert!(!spec.is_required());
        assert!(ParamSpec::new("input", ParamType::Path).is_required());
        assert!(ParamSpec::new("input", ParamType::Path).check(&Value::Null).is_err());
    }

    #[test]
    fn test_defaults_tree() {
        let schema = ComponentSchema::new("tool", "")
            .param(ParamSpec::new("input", ParamType::Path))
            .param(ParamSpec::new("verbose", ParamType::Bool).default(false))
            .child(
                ComponentSchema::new("stage", "")
                    .param(ParamSpec::new("k", ParamType::Int).default(3)),
            );
        assert_eq!(schema.defaults(), json!({"verbose": false, "stage": {"k": 3}}));
        assert!(schema.lookup(&["stage", "k"]).is_some());
        assert!(schema.lookup(&["stage", "missing"]).is_none());
    }
}
