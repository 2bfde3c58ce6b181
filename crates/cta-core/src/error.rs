//! Error types for the processing pipeline.
//!
//! The taxonomy follows how an error is allowed to affect a run:
//!
//! - **Fatal before processing**: [`ConfigurationError`] and
//!   [`UnsupportedFormatError`] surface immediately with the offending key or
//!   file, before a single event is read.
//! - **Per-event, recoverable**: [`RecoverableDecodeError`] (one event's payload
//!   is corrupt) and [`StageComputationError`] (one stage failed on one event).
//!   Both are counted per stage and kind and summarised at the end of a run.
//! - **Fatal during processing**: [`WriteError`] (persisted state may be
//!   inconsistent) and [`MergeError`] (validation failed, nothing written).
//!
//! [`CtaError`] consolidates everything a caller may receive from a tool, with
//! `#[from]` conversions so `?` works across crate boundaries.

use std::path::PathBuf;

use thiserror::Error;

use crate::containers::EventIndex;

/// Convenience alias for results using the consolidated error type.
pub type CtaResult<T> = std::result::Result<T, CtaError>;

// =============================================================================
// Configuration
// =============================================================================

/// Bad, unknown, or out-of-range configuration.
///
/// Always fatal and always raised before event processing starts. Every
/// variant names the dotted key (`process.calibrator.window_width`) or file
/// that caused it.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigurationError {
    /// A key was supplied that no component declares.
    #[error("unknown configuration key '{key}' (supplied by {origin})")]
    UnknownKey {
        /// Dotted path of the key.
        key: String,
        /// Provider that supplied the key (file name or command line).
        origin: String,
    },

    /// A value failed its type check or validator.
    #[error("invalid value {value} for '{key}': expected {expected}")]
    InvalidValue {
        /// Dotted path of the key.
        key: String,
        /// Offending value, rendered as JSON.
        value: String,
        /// What the declaration accepts.
        expected: String,
    },

    /// A required parameter has no default and was not supplied.
    #[error("missing required parameter '{key}'")]
    MissingValue {
        /// Dotted path of the key.
        key: String,
    },

    /// A command-line override was not of the form `KEY=VALUE`.
    #[error("malformed override '{0}': expected KEY=VALUE")]
    MalformedOverride(String),

    /// The configuration file could not be read or parsed.
    #[error("cannot load configuration file {}: {message}", .path.display())]
    File {
        /// Path of the configuration file.
        path: PathBuf,
        /// Parser or I/O message.
        message: String,
    },

    /// The components resolved but cannot be composed into a run.
    #[error("invalid pipeline setup: {0}")]
    Setup(String),
}

impl ConfigurationError {
    /// Shorthand for [`ConfigurationError::InvalidValue`].
    pub fn invalid(
        key: impl Into<String>,
        value: impl std::fmt::Display,
        expected: impl Into<String>,
    ) -> Self {
        Self::InvalidValue {
            key: key.into(),
            value: value.to_string(),
            expected: expected.into(),
        }
    }
}

// =============================================================================
// Sources
// =============================================================================

/// No registered source backend accepts a file. Fatal at open.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("no event source can read {} (tried: {})", .path.display(), .tried.join(", "))]
pub struct UnsupportedFormatError {
    /// Input that was probed.
    pub path: PathBuf,
    /// Names of the backends that declined it, in probe order.
    pub tried: Vec<String>,
}

/// A single event's payload is corrupt or truncated.
///
/// Sources attach this to the event they yield instead of aborting the
/// iteration; the raw fields of that event stay missing.
#[derive(Error, Debug, Clone, PartialEq)]
#[error(
    "cannot decode event {}: {message}",
    .index.map(|i| i.to_string()).unwrap_or_else(|| "<unknown>".into())
)]
pub struct RecoverableDecodeError {
    /// Identity of the event when the header was readable.
    pub index: Option<EventIndex>,
    /// What went wrong.
    pub message: String,
}

impl RecoverableDecodeError {
    /// Create a decode error for a known event.
    pub fn new(index: Option<EventIndex>, message: impl Into<String>) -> Self {
        Self {
            index,
            message: message.into(),
        }
    }
}

/// Errors raised by event sources.
#[derive(Error, Debug)]
pub enum SourceError {
    /// No backend accepted the input.
    #[error(transparent)]
    Unsupported(#[from] UnsupportedFormatError),

    /// The input is not a well-formed file of the backend's format.
    #[error("cannot open {}: {message}", .path.display())]
    Open {
        /// Input path.
        path: PathBuf,
        /// What was wrong with it.
        message: String,
    },

    /// The stream became unreadable after open (not a single-event problem).
    #[error("unreadable stream {}: {message}", .path.display())]
    Stream {
        /// Input path.
        path: PathBuf,
        /// What failed.
        message: String,
    },

    /// Sources are forward-only; a seek before the current position fails.
    #[error("cannot seek backwards to event position {requested} (current position {position})")]
    BackwardSeek {
        /// Requested event position.
        requested: u64,
        /// Position the source is at.
        position: u64,
    },

    /// Underlying I/O failure.
    #[error("I/O error on {}: {source}", .path.display())]
    Io {
        /// Input path.
        path: PathBuf,
        /// The I/O error.
        #[source]
        source: std::io::Error,
    },
}

// =============================================================================
// Stages
// =============================================================================

/// A processing stage failed on one event.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("stage '{stage}' failed: {message}")]
pub struct StageComputationError {
    /// Name of the failing stage.
    pub stage: String,
    /// What went wrong.
    pub message: String,
}

impl StageComputationError {
    /// Create a computation error for `stage`.
    pub fn new(stage: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            stage: stage.into(),
            message: message.into(),
        }
    }
}

/// Category of a per-event failure, used for end-of-run accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// The source could not decode the event.
    Decode,
    /// A stage failed on the event.
    Computation,
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            FailureKind::Decode => "decode",
            FailureKind::Computation => "computation",
        };
        write!(f, "{}", label)
    }
}

// =============================================================================
// Output
// =============================================================================

/// Persisting output failed. Always fatal.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("write to {} failed: {message}", .path.display())]
pub struct WriteError {
    /// File or dataset being written.
    pub path: PathBuf,
    /// What failed.
    pub message: String,
}

impl WriteError {
    /// Create a write error for `path`.
    pub fn new(path: impl Into<PathBuf>, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            message: message.into(),
        }
    }
}

/// Merge validation or execution failed. Nothing is written when this is
/// raised during validation.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum MergeError {
    /// No input files were given.
    #[error("no input files to merge")]
    NoInputs,

    /// An input could not be opened as a dataset.
    #[error("cannot read merge input {}: {message}", .file.display())]
    Unreadable {
        /// Offending input.
        file: PathBuf,
        /// Why it could not be read.
        message: String,
    },

    /// Subarray of an input differs from the first input.
    #[error("subarray of {} differs from the first input in field '{field}'", .file.display())]
    SubarrayMismatch {
        /// Offending input.
        file: PathBuf,
        /// First mismatching field path.
        field: String,
    },

    /// Format, schema version, or table layout differs from the first input.
    #[error("schema of {} is incompatible in '{field}': {detail}", .file.display())]
    SchemaMismatch {
        /// Offending input.
        file: PathBuf,
        /// Table or metadata field that differs.
        field: String,
        /// Human readable difference.
        detail: String,
    },

    /// Two inputs (or one input twice) contain the same event.
    #[error("event {index} of {} already present in {}", .file.display(), .first_file.display())]
    DuplicateEvent {
        /// Colliding event.
        index: EventIndex,
        /// Input containing the second occurrence.
        file: PathBuf,
        /// Input containing the first occurrence.
        first_file: PathBuf,
    },

    /// The output exists and overwriting was not requested.
    #[error("output {} already exists (use overwrite to replace it)", .path.display())]
    OutputExists {
        /// Output path.
        path: PathBuf,
    },

    /// Writing the merged output failed.
    #[error(transparent)]
    Write(#[from] WriteError),
}

// =============================================================================
// Consolidated
// =============================================================================

/// Every error a tool run can end with.
#[derive(Error, Debug)]
pub enum CtaError {
    /// Bad configuration.
    #[error("configuration error: {0}")]
    Configuration(#[from] ConfigurationError),

    /// Source failure (including unsupported formats).
    #[error("event source error: {0}")]
    Source(#[from] SourceError),

    /// Output failure.
    #[error("write error: {0}")]
    Write(#[from] WriteError),

    /// Merge failure.
    #[error("merge error: {0}")]
    Merge(#[from] MergeError),

    /// The per-event failure threshold was exceeded.
    #[error("aborting: {failures} of {processed} events failed, exceeding {limit}")]
    TooManyFailures {
        /// Failed events so far.
        failures: u64,
        /// Processed events so far.
        processed: u64,
        /// The limit that was crossed, rendered for humans.
        limit: String,
    },

    /// Plain I/O failure outside a source or writer.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<UnsupportedFormatError> for CtaError {
    fn from(err: UnsupportedFormatError) -> Self {
        CtaError::Source(SourceError::Unsupported(err))
    }
}
