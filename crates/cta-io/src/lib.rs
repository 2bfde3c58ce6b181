//! `cta-io`
//!
//! Everything that touches bytes on disk:
//!
//! - [`eventio`]: codec of the block-structured raw event stream, plus a
//!   writer used by the toy simulation and by tests.
//! - [`toy`]: a seeded toy array simulation producing block-stream files.
//! - [`source`]: the [`EventSource`] abstraction and its registry of
//!   backends (block stream, columnar dataset).
//! - [`table`] and [`dataset`]: the columnar dataset layout. A dataset is a
//!   directory of Parquet tables next to a `metadata.json` document holding
//!   the subarray, observation ids and provenance chain.
//! - [`writer`]: chunked event writer producing a dataset.
//! - [`merge`]: validated concatenation of datasets.
//!
//! ## Dataset Layout
//!
//! ```text
//! run.dl2/
//! ├── metadata.json                               written last; its presence
//! │                                               marks a complete dataset
//! ├── dl1/event/subarray/trigger.parquet          one row per event
//! ├── dl1/event/telescope/images.parquet          one row per telescope event
//! ├── dl1/event/telescope/parameters.parquet
//! ├── dl2/event/subarray/{geometry,energy,classification}.parquet
//! └── simulation/event/subarray/shower.parquet
//! ```
//!
//! Writers fill `<output>.partial` and rename it into place on success, so a
//! failed run never leaves something that looks like a finished dataset.

pub mod dataset;
pub mod eventio;
pub mod merge;
pub mod source;
pub mod table;
pub mod toy;
pub mod writer;

pub use dataset::{is_dataset, DatasetMetadata, TableCompression};
pub use merge::{merge, MergeOptions, MergeSummary};
pub use source::{EventSource, EventSourceFactory, SourceConfig, SourceRegistry};
pub use table::Table;
pub use toy::{ToySimulation, ToySimulationConfig};
pub use writer::{DataWriter, DataWriterConfig};
