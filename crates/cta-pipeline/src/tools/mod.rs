//! Runnable tools. Each tool is a [`Component`](cta_core::config::Component)
//! whose schema is the root of its configuration tree.

pub mod merge;
pub mod process;

pub use merge::MergeTool;
pub use process::{ProcessOutcome, ProcessTool};
