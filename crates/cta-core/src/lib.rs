//! `cta-core`
//!
//! Core types for the Cherenkov telescope array event pipeline.
//!
//! This crate holds everything the readers, stages, and tools share without
//! depending on any storage format:
//!
//! - [`containers`]: the fixed-shape per-event record ([`ArrayEvent`]) and the
//!   scalar parameter containers with per-field unit and description metadata.
//! - [`subarray`]: instrument geometry, shared read-only by every event of a
//!   source through an `Arc`.
//! - [`config`]: declared parameter schemas and the layered resolver
//!   (defaults, then file, then command line) with strict key checking.
//! - [`provenance`] and [`run`]: the explicit run context handed to every
//!   component, including the provenance activity log and the stop flag.
//! - [`error`]: the error taxonomy.
//!
//! ## Event Lifecycle
//!
//! ```text
//! Raw ──▶ Calibrated ──▶ Cleaned/Parameterized ──▶ Reconstructed ──▶ Written
//!  │          │                   │                      │
//!  raw     dl1.image        dl1.parameters          dl2.geometry
//!                                                   dl2.energy
//!                                                   dl2.classification
//! ```
//!
//! Every field starts out missing (`None`) and is filled in place as the event
//! passes through stages. The set of fields never changes.

pub mod config;
pub mod containers;
pub mod error;
pub mod provenance;
pub mod run;
pub mod subarray;

pub use containers::{ArrayEvent, DataField, EventIndex, TelId, TelescopeEvent};
pub use error::{
    ConfigurationError, CtaError, CtaResult, FailureKind, MergeError, RecoverableDecodeError,
    SourceError, StageComputationError, UnsupportedFormatError, WriteError,
};
pub use run::{RunContext, StopHandle};
pub use subarray::SubarrayDescription;

/// Version of the columnar data schema written and accepted by this build.
///
/// Bumped whenever a table or column changes meaning. Merge refuses inputs
/// with a different version.
pub const DATA_SCHEMA_VERSION: &str = "1.0.0";

/// Software version recorded in provenance.
pub const SOFTWARE_VERSION: &str = env!("CARGO_PKG_VERSION");
