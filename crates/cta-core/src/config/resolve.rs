//! Layered resolution of a component tree.
//!
//! Order of precedence, lowest first:
//!
//! 1. declared defaults ([`ComponentSchema::defaults`])
//! 2. the configuration file (TOML, JSON, or YAML by extension)
//! 3. command-line overrides (`dotted.key=value`)
//!
//! Layers are merged with figment. Keys supplied by the file or the command
//! line are checked against the schema before merging, so an unknown key is
//! reported together with the provider that supplied it.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use figment::providers::{Format, Json, Serialized, Toml, Yaml};
use figment::Figment;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use tracing::debug;

use super::ComponentSchema;
use crate::error::ConfigurationError;

/// Where configuration values come from, besides the declared defaults.
#[derive(Debug, Clone, Default)]
pub struct ConfigSources {
    /// Optional configuration file.
    pub file: Option<PathBuf>,
    /// `KEY=VALUE` overrides; keys are dotted paths, with or without the
    /// root section prefix.
    pub overrides: Vec<String>,
}

impl ConfigSources {
    /// Sources with only a file.
    pub fn with_file(mut self, file: impl Into<PathBuf>) -> Self {
        self.file = Some(file.into());
        self
    }

    /// Add one override.
    pub fn set(mut self, key: &str, value: impl std::fmt::Display) -> Self {
        self.overrides.push(format!("{key}={value}"));
        self
    }
}

/// Resolved, validated values of one component section.
#[derive(Debug, Clone, PartialEq)]
pub struct ComponentConfig {
    path: String,
    values: Map<String, Value>,
    children: BTreeMap<String, ComponentConfig>,
}

impl ComponentConfig {
    /// Dotted path of the section.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Dotted path of a parameter in this section.
    pub fn key(&self, name: &str) -> String {
        format!("{}.{}", self.path, name)
    }

    /// Resolved value of a parameter.
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.values.get(name)
    }

    /// Resolved string parameter.
    pub fn get_str(&self, name: &str) -> Option<&str> {
        self.get(name).and_then(Value::as_str)
    }

    /// Deserialize this section's parameters (not its children) into a
    /// parameter struct.
    pub fn extract<T: DeserializeOwned>(&self) -> Result<T, ConfigurationError> {
        serde_json::from_value(Value::Object(self.values.clone())).map_err(|e| {
            ConfigurationError::Setup(format!("cannot read section '{}': {e}", self.path))
        })
    }

    /// Nested section by key.
    pub fn child(&self, key: &str) -> Result<&ComponentConfig, ConfigurationError> {
        self.children.get(key).ok_or_else(|| {
            ConfigurationError::Setup(format!("section '{}' has no child '{key}'", self.path))
        })
    }

    /// The section and its children as nested JSON, for provenance.
    pub fn to_json(&self) -> Value {
        let mut map = self.values.clone();
        for (key, child) in &self.children {
            map.insert(key.clone(), child.to_json());
        }
        Value::Object(map)
    }
}

/// Resolve `schema` from its defaults and the given sources.
///
/// Fails with [`ConfigurationError`] naming the offending key when a key is
/// unknown, a value does not type-check or validate, a required parameter is
/// missing, or the file cannot be read.
pub fn resolve(
    schema: &ComponentSchema,
    sources: &ConfigSources,
) -> Result<ComponentConfig, ConfigurationError> {
    let root = schema.key.as_str();
    let mut defaults = Map::new();
    defaults.insert(root.to_string(), schema.defaults());
    let mut figment = Figment::new().merge(Serialized::defaults(Value::Object(defaults)));

    if let Some(path) = &sources.file {
        let file_figment = file_provider(path)?;
        let tree: Value = file_figment.extract().map_err(|e| ConfigurationError::File {
            path: path.clone(),
            message: e.to_string(),
        })?;
        check_file_keys(schema, &tree, &path.display().to_string())?;
        debug!(file = %path.display(), "Loaded configuration file");
        figment = figment.merge(file_figment);
    }

    let mut nulls = Vec::new();
    for raw in &sources.overrides {
        let (key, value) = parse_override(schema, raw)?;
        nulls.retain(|k| k != &key);
        if value.is_null() {
            nulls.push(key);
        } else {
            figment = figment.merge(Serialized::default(&key, value));
        }
    }

    let mut merged: Value = figment
        .extract()
        .map_err(|e| ConfigurationError::Setup(format!("cannot merge configuration: {e}")))?;
    for key in nulls {
        set_path(&mut merged, &key, Value::Null);
    }

    let section = merged.get(root).cloned().unwrap_or(Value::Object(Map::new()));
    build(schema, &section, root)
}

fn file_provider(path: &Path) -> Result<Figment, ConfigurationError> {
    if !path.is_file() {
        return Err(ConfigurationError::File {
            path: path.to_path_buf(),
            message: "file not found".into(),
        });
    }
    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase);
    let figment = match extension.as_deref() {
        Some("toml") => Figment::from(Toml::file(path)),
        Some("json") => Figment::from(Json::file(path)),
        Some("yaml") | Some("yml") => Figment::from(Yaml::file(path)),
        _ => {
            return Err(ConfigurationError::File {
                path: path.to_path_buf(),
                message: "unsupported extension (expected .toml, .json, .yaml or .yml)".into(),
            })
        }
    };
    Ok(figment)
}

fn check_file_keys(
    schema: &ComponentSchema,
    tree: &Value,
    origin: &str,
) -> Result<(), ConfigurationError> {
    let Some(top) = tree.as_object() else {
        return Ok(());
    };
    for (key, value) in top {
        if key != &schema.key {
            return Err(ConfigurationError::UnknownKey {
                key: key.clone(),
                origin: origin.to_string(),
            });
        }
        check_section_keys(schema, value, &schema.key, origin)?;
    }
    Ok(())
}

fn check_section_keys(
    schema: &ComponentSchema,
    value: &Value,
    path: &str,
    origin: &str,
) -> Result<(), ConfigurationError> {
    let Some(section) = value.as_object() else {
        return Err(ConfigurationError::invalid(path, value, "a table of parameters"));
    };
    for (key, value) in section {
        let key_path = format!("{path}.{key}");
        if schema.find_param(key).is_some() {
            continue;
        }
        match schema.find_child(key) {
            Some(child) => check_section_keys(child, value, &key_path, origin)?,
            None => {
                return Err(ConfigurationError::UnknownKey {
                    key: key_path,
                    origin: origin.to_string(),
                })
            }
        }
    }
    Ok(())
}

fn parse_override(
    schema: &ComponentSchema,
    raw: &str,
) -> Result<(String, Value), ConfigurationError> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| ConfigurationError::MalformedOverride(raw.to_string()))?;
    let key = key.trim();
    if key.is_empty() {
        return Err(ConfigurationError::MalformedOverride(raw.to_string()));
    }
    let prefix = format!("{}.", schema.key);
    let key = if key.starts_with(&prefix) {
        key.to_string()
    } else {
        format!("{prefix}{key}")
    };

    let segments: Vec<&str> = key.split('.').skip(1).collect();
    let spec = schema
        .lookup(&segments)
        .ok_or_else(|| ConfigurationError::UnknownKey {
            key: key.clone(),
            origin: "command line".into(),
        })?;
    let value = spec
        .parse_cli(value)
        .map_err(|expected| ConfigurationError::invalid(&key, value, expected))?;
    Ok((key, value))
}

fn set_path(tree: &mut Value, dotted: &str, value: Value) {
    let mut node = tree;
    let mut segments = dotted.split('.').peekable();
    while let Some(segment) = segments.next() {
        let Some(map) = node.as_object_mut() else {
            return;
        };
        if segments.peek().is_none() {
            map.insert(segment.to_string(), value);
            return;
        }
        node = map
            .entry(segment.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
    }
}

fn build(
    schema: &ComponentSchema,
    section: &Value,
    path: &str,
) -> Result<ComponentConfig, ConfigurationError> {
    let empty = Map::new();
    let supplied = section.as_object().unwrap_or(&empty);

    if let Some(unknown) = supplied
        .keys()
        .find(|k| schema.find_param(k).is_none() && schema.find_child(k).is_none())
    {
        return Err(ConfigurationError::UnknownKey {
            key: format!("{path}.{unknown}"),
            origin: "configuration".into(),
        });
    }

    let mut values = Map::new();
    for spec in &schema.params {
        let key = format!("{path}.{}", spec.name);
        let value = match supplied.get(&spec.name) {
            Some(v) => v.clone(),
            None if spec.nullable => Value::Null,
            None => match &spec.default {
                Some(d) => d.clone(),
                None => return Err(ConfigurationError::MissingValue { key }),
            },
        };
        let value = spec
            .check(&value)
            .map_err(|expected| ConfigurationError::invalid(&key, &value, expected))?;
        values.insert(spec.name.clone(), value);
    }

    let mut children = BTreeMap::new();
    for child in &schema.children {
        let child_section = supplied
            .get(&child.key)
            .cloned()
            .unwrap_or(Value::Object(Map::new()));
        let child_path = format!("{path}.{}", child.key);
        children.insert(child.key.clone(), build(child, &child_section, &child_path)?);
    }

    Ok(ComponentConfig {
        path: path.to_string(),
        values,
        children,
    })
}

/// Render a resolved tree as an annotated TOML document.
///
/// Every parameter is preceded by its help text; unset optional parameters
/// appear commented out.
pub fn render_toml(schema: &ComponentSchema, config: &ComponentConfig) -> String {
    let mut out = String::new();
    render_section(schema, config, &mut out);
    out
}

fn render_section(schema: &ComponentSchema, config: &ComponentConfig, out: &mut String) {
    if !schema.help.is_empty() {
        out.push_str(&format!("# {}\n", schema.help));
    }
    out.push_str(&format!("[{}]\n", config.path()));
    for spec in &schema.params {
        out.push_str(&format!("# {}\n", spec.describe()));
        let rendered = config
            .get(&spec.name)
            .filter(|v| !v.is_null())
            .and_then(|v| toml::Value::try_from(v).ok());
        match rendered {
            Some(v) => out.push_str(&format!("{} = {}\n", spec.name, v)),
            None => out.push_str(&format!("# {} =\n", spec.name)),
        }
    }
    out.push('\n');
    for child_schema in &schema.children {
        if let Ok(child) = config.child(&child_schema.key) {
            render_section(child_schema, child, out);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ParamSpec, ParamType};
    use serde_json::json;

    fn schema() -> ComponentSchema {
        ComponentSchema::new("tool", "A tool")
            .param(ParamSpec::new("count", ParamType::Int).default(3).range(Some(0.0), None))
            .param(ParamSpec::new("label", ParamType::Str).optional())
            .child(
                ComponentSchema::new("stage", "A stage")
                    .param(ParamSpec::new("count", ParamType::Int).default(10)),
            )
    }

    #[test]
    fn test_defaults_only() {
        let config = resolve(&schema(), &ConfigSources::default()).unwrap();
        assert_eq!(config.get("count"), Some(&json!(3)));
        assert_eq!(config.get("label"), Some(&Value::Null));
        assert_eq!(config.child("stage").unwrap().get("count"), Some(&json!(10)));
    }

    #[test]
    fn test_same_name_scoped_by_section() {
        let sources = ConfigSources::default().set("stage.count", 7);
        let config = resolve(&schema(), &sources).unwrap();
        assert_eq!(config.get("count"), Some(&json!(3)));
        assert_eq!(config.child("stage").unwrap().get("count"), Some(&json!(7)));
    }

    #[test]
    fn test_override_unknown_key() {
        let sources = ConfigSources::default().set("stage.cuont", 7);
        let err = resolve(&schema(), &sources).unwrap_err();
        assert_eq!(
            err,
            ConfigurationError::UnknownKey {
                key: "tool.stage.cuont".into(),
                origin: "command line".into(),
            }
        );
    }

    #[test]
    fn test_override_out_of_range() {
        let sources = ConfigSources::default().set("tool.count", -1);
        match resolve(&schema(), &sources).unwrap_err() {
            ConfigurationError::InvalidValue { key, value, .. } => {
                assert_eq!(key, "tool.count");
                assert_eq!(value, "-1");
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn test_malformed_override() {
        let sources = ConfigSources {
            overrides: vec!["count".into()],
            ..Default::default()
        };
        assert!(matches!(
            resolve(&schema(), &sources),
            Err(ConfigurationError::MalformedOverride(_))
        ));
    }

    #[test]
    fn test_null_override_unsets_optional() {
        let sources = ConfigSources::default().set("label", "x").set("label", "none");
        let config = resolve(&schema(), &sources).unwrap();
        assert_eq!(config.get("label"), Some(&Value::Null));
    }

    #[test]
    fn test_render_toml_contains_help_and_values() {
        let config = resolve(&schema(), &ConfigSources::default()).unwrap();
        let text = render_toml(&schema(), &config);
        assert!(text.contains("[tool]"));
        assert!(text.contains("count = 3"));
        assert!(text.contains("# label ="));
        assert!(text.contains("[tool.stage]"));
        let parsed: toml::Value = toml::from_str(&text).unwrap();
        assert_eq!(parsed["tool"]["stage"]["count"].as_integer(), Some(10));
    }
}
