//! `cta-pipeline`
//!
//! Processing stages and the tools that drive them.
//!
//! - [`stage`]: the [`Stage`] contract and the registry that builds stages
//!   by name from a tool's configuration.
//! - [`calib`]: raw waveforms to calibrated images.
//! - [`image`]: cleaning and image parameters.
//! - [`reco`]: stereo geometry, energy and particle type.
//! - [`quality`]: named threshold criteria on parameter columns.
//! - [`orchestrator`]: the per-event loop with failure isolation, the
//!   failure policy and the run summary.
//! - [`tools`]: `process` and `merge`.
//!
//! ## Processing Flow
//!
//! ```text
//!            ProcessTool::run
//!                  │
//!   SourceRegistry::open ──▶ StageRegistry::build ──▶ check_chain
//!                  │
//!                  ▼
//!   ┌───────────── Pipeline::run ─────────────┐
//!   │ next_event ─▶ stages ─▶ DataWriter      │  per event
//!   │ FailurePolicy::check, progress          │
//!   └─────────────────────────────────────────┘
//!                  │
//!   provenance activity ──▶ DataWriter::finish
//! ```

pub mod calib;
pub mod image;
pub mod orchestrator;
pub mod progress;
pub mod quality;
pub mod reco;
pub mod stage;
pub mod tools;

pub use calib::CameraCalibrator;
pub use image::ImageProcessor;
pub use orchestrator::{FailurePolicy, Pipeline, RunStatus, RunSummary};
pub use quality::QualityQuery;
pub use reco::ShowerProcessor;
pub use stage::{check_chain, Stage, StageFactory, StageRegistry};
pub use tools::{MergeTool, ProcessOutcome, ProcessTool};
