//! Event source abstraction.
//!
//! An [`EventSource`] turns one input file into a lazy, finite, single-pass
//! sequence of [`ArrayEvent`]s in file order. Whatever the backend, every
//! event references the same [`SubarrayDescription`], decoded once at open.
//!
//! # Backend Dispatch
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                    SourceRegistry::builtin()                 │
//! │  register(BlockStreamFactory)    probe: leading sync marker  │
//! │  register(ColumnarFactory)       probe: dir + metadata.json  │
//! └──────────────────────────────────────────────────────────────┘
//!                               │ open(path, config)
//!                               ▼
//!        source_type == "auto" ? first factory whose probe() accepts
//!                              : factory with that name
//!                               │
//!                               ▼
//!                   Box<dyn EventSource>  (or UnsupportedFormatError)
//! ```
//!
//! New formats register a factory; the dispatcher never changes.
//!
//! # Error Policy
//!
//! File-level problems (bad header, unreadable stream) fail at open. A
//! corrupt payload of a single event does not stop iteration: the event is
//! yielded with its raw fields missing and
//! [`ArrayEvent::decode_error`] set.

mod block_stream;
mod columnar;

pub use block_stream::{BlockStreamFactory, BlockStreamSource};
pub use columnar::{compatible_version, ColumnarFactory, ColumnarSource};

use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;

use cta_core::config::{Component, ComponentConfig, ComponentSchema, ParamSpec, ParamType};
use cta_core::{
    ArrayEvent, ConfigurationError, DataField, SourceError, SubarrayDescription, TelId,
    UnsupportedFormatError,
};
use serde::Deserialize;
use tracing::{debug, info};

/// Common interface of all event sources.
pub trait EventSource {
    /// Backend name, as registered.
    fn name(&self) -> &'static str;

    /// File or directory being read.
    fn input_path(&self) -> &Path;

    /// Instrument description, restricted to the allowed telescopes.
    fn subarray(&self) -> &Arc<SubarrayDescription>;

    /// Observation blocks in the input.
    fn obs_ids(&self) -> &[u64];

    /// Whether the input carries simulation truth.
    fn is_simulation(&self) -> bool;

    /// Event field groups the source fills.
    fn datalevels(&self) -> &[DataField];

    /// Maximum number of events to yield, if capped.
    fn max_events(&self) -> Option<u64>;

    /// Telescopes allowed to populate per-telescope data, if restricted.
    fn allowed_tels(&self) -> Option<&BTreeSet<TelId>>;

    /// Number of events the source expects to yield, when known.
    fn n_events_hint(&self) -> Option<u64> {
        None
    }

    /// Events yielded so far.
    fn events_read(&self) -> u64;

    /// Provenance activities recorded in the input, newest first. Empty for
    /// inputs that carry none.
    fn provenance_chain(&self) -> Vec<serde_json::Value> {
        Vec::new()
    }

    /// Produce the next event, or `None` at the end of the input or once
    /// `max_events` were yielded.
    fn next_event(&mut self) -> Result<Option<ArrayEvent>, SourceError>;

    /// Skip forward so that the next event yielded has position `position`.
    ///
    /// Sources only read forward; a position before the current one fails
    /// with [`SourceError::BackwardSeek`].
    fn seek(&mut self, position: u64) -> Result<(), SourceError> {
        let current = self.events_read();
        if position < current {
            return Err(SourceError::BackwardSeek {
                requested: position,
                position: current,
            });
        }
        for _ in current..position {
            if self.next_event()?.is_none() {
                break;
            }
        }
        Ok(())
    }

    /// Borrow the source as an iterator.
    fn events(&mut self) -> Events<'_, Self>
    where
        Self: Sized,
    {
        Events { source: self }
    }
}

impl<S: EventSource + ?Sized> EventSource for Box<S> {
    fn name(&self) -> &'static str {
        (**self).name()
    }
    fn input_path(&self) -> &Path {
        (**self).input_path()
    }
    fn subarray(&self) -> &Arc<SubarrayDescription> {
        (**self).subarray()
    }
    fn obs_ids(&self) -> &[u64] {
        (**self).obs_ids()
    }
    fn is_simulation(&self) -> bool {
        (**self).is_simulation()
    }
    fn datalevels(&self) -> &[DataField] {
        (**self).datalevels()
    }
    fn max_events(&self) -> Option<u64> {
        (**self).max_events()
    }
    fn allowed_tels(&self) -> Option<&BTreeSet<TelId>> {
        (**self).allowed_tels()
    }
    fn n_events_hint(&self) -> Option<u64> {
        (**self).n_events_hint()
    }
    fn events_read(&self) -> u64 {
        (**self).events_read()
    }
    fn provenance_chain(&self) -> Vec<serde_json::Value> {
        (**self).provenance_chain()
    }
    fn next_event(&mut self) -> Result<Option<ArrayEvent>, SourceError> {
        (**self).next_event()
    }
    fn seek(&mut self, position: u64) -> Result<(), SourceError> {
        (**self).seek(position)
    }
}

/// Iterator over the events of a source.
#[derive(Debug)]
pub struct Events<'a, S: ?Sized> {
    source: &'a mut S,
}

impl<S: EventSource + ?Sized> Iterator for Events<'_, S> {
    type Item = Result<ArrayEvent, SourceError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.source.next_event().transpose()
    }
}

/// Source parameters shared by every backend.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct SourceConfig {
    /// Telescopes to keep; `None` keeps all.
    pub allowed_tels: Option<Vec<TelId>>,
    /// Cap on the number of events.
    pub max_events: Option<u64>,
    /// Backend name, or `auto` to probe.
    pub source_type: String,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            allowed_tels: None,
            max_events: None,
            source_type: "auto".into(),
        }
    }
}

impl SourceConfig {
    /// Allowed telescopes as a set.
    pub fn allowed_set(&self) -> Option<BTreeSet<TelId>> {
        self.allowed_tels
            .as_ref()
            .map(|tels| tels.iter().copied().collect())
    }

    /// Restrict a full subarray to the allowed telescopes.
    pub fn restrict(&self, subarray: SubarrayDescription) -> SubarrayDescription {
        match &self.allowed_tels {
            Some(tels) => subarray.select(tels),
            None => subarray,
        }
    }
}

impl Component for SourceConfig {
    const NAME: &'static str = "source";

    fn schema() -> ComponentSchema {
        let mut backends = vec!["auto".to_string()];
        backends.extend(SourceRegistry::builtin().names().into_iter().map(String::from));
        ComponentSchema::new(Self::NAME, "Event source selection and filtering")
            .param(
                ParamSpec::new("allowed_tels", ParamType::IntList)
                    .optional()
                    .range(Some(1.0), Some(f64::from(TelId::MAX)))
                    .help("Telescope ids to keep; unset keeps all"),
            )
            .param(
                ParamSpec::new("max_events", ParamType::Int)
                    .optional()
                    .range(Some(0.0), None)
                    .help("Maximum number of events to read"),
            )
            .param(
                ParamSpec::new("source_type", ParamType::Str)
                    .default("auto")
                    .choices(backends)
                    .help("Backend to use; auto probes the input"),
            )
    }

    fn from_config(config: &ComponentConfig) -> Result<Self, ConfigurationError> {
        config.extract()
    }
}

/// Capability-checked constructor of one source backend.
pub trait EventSourceFactory: Send + Sync {
    /// Backend name used by `source_type`.
    fn name(&self) -> &'static str;

    /// One-line description for listings.
    fn description(&self) -> &'static str;

    /// Cheap check whether this backend can read `path`.
    fn probe(&self, path: &Path) -> bool;

    /// Open `path`. File-level errors surface here.
    fn open(&self, path: &Path, config: &SourceConfig)
        -> Result<Box<dyn EventSource>, SourceError>;
}

/// Ordered list of source backends.
#[derive(Default)]
pub struct SourceRegistry {
    factories: Vec<Box<dyn EventSourceFactory>>,
}

impl std::fmt::Debug for SourceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SourceRegistry")
            .field("factories", &self.names())
            .finish()
    }
}

impl SourceRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the block-stream and columnar backends, in that order.
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        registry.register(BlockStreamFactory);
        registry.register(ColumnarFactory);
        registry
    }

    /// Append a backend. Probing follows registration order.
    pub fn register(&mut self, factory: impl EventSourceFactory + 'static) {
        self.factories.push(Box::new(factory));
    }

    /// Registered backend names.
    pub fn names(&self) -> Vec<&'static str> {
        self.factories.iter().map(|f| f.name()).collect()
    }

    /// `(name, description)` of every backend.
    pub fn describe(&self) -> Vec<(&'static str, &'static str)> {
        self.factories
            .iter()
            .map(|f| (f.name(), f.description()))
            .collect()
    }

    /// Open `path` with the configured or the first accepting backend.
    pub fn open(
        &self,
        path: &Path,
        config: &SourceConfig,
    ) -> Result<Box<dyn EventSource>, SourceError> {
        if !path.exists() {
            return Err(SourceError::Io {
                path: path.to_path_buf(),
                source: std::io::Error::new(std::io::ErrorKind::NotFound, "no such file"),
            });
        }

        if config.source_type != "auto" {
            let factory = self
                .factories
                .iter()
                .find(|f| f.name() == config.source_type)
                .ok_or_else(|| UnsupportedFormatError {
                    path: path.to_path_buf(),
                    tried: vec![config.source_type.clone()],
                })?;
            debug!(backend = factory.name(), "Using configured event source");
            return factory.open(path, config);
        }

        for factory in &self.factories {
            if factory.probe(path) {
                info!(backend = factory.name(), input = %path.display(), "Opening event source");
                return factory.open(path, config);
            }
            debug!(backend = factory.name(), "Backend declined input");
        }
        Err(UnsupportedFormatError {
            path: path.to_path_buf(),
            tried: self.names().into_iter().map(String::from).collect(),
        }
        .into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use cta_core::config::{resolve, ConfigSources};

    #[test]
    fn test_builtin_order() {
        assert_eq!(SourceRegistry::builtin().names(), vec!["block_stream", "columnar"]);
    }

    #[test]
    fn test_unsupported_file_lists_backends() {
        let file = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(file.path(), b"plain text, not events").unwrap();
        let err = SourceRegistry::builtin()
            .open(file.path(), &SourceConfig::default())
            .err().unwrap();
        match err {
            SourceError::Unsupported(e) => assert_eq!(e.tried, vec!["block_stream", "columnar"]),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_missing_file() {
        let err = SourceRegistry::builtin()
            .open(Path::new("/nonexistent/run.simtel"), &SourceConfig::default())
            .err().unwrap();
        assert!(matches!(err, SourceError::Io { .. }));
    }

    #[test]
    fn test_source_config_resolves() {
        let sources = ConfigSources::default()
            .set("allowed_tels", "1,3")
            .set("max_events", 5);
        let resolved = resolve(&SourceConfig::schema(), &sources).unwrap();
        let config = SourceConfig::from_config(&resolved).unwrap();
        assert_eq!(config.allowed_tels, Some(vec![1, 3]));
        assert_eq!(config.max_events, Some(5));
        assert_eq!(config.source_type, "auto");

        let bad = ConfigSources::default().set("source_type", "hdf5");
        assert!(resolve(&SourceConfig::schema(), &bad).is_err());
    }
}
