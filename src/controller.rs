//! Pipeline orchestration.
//!
//! Re-exports:
//! - [`Controller`]: opens the capture and drives the flow table.
//! - [`ReaderGroup`]: the supervised per-flow reader tasks.

pub mod controller_handler;
pub mod reader_group;

pub use controller_handler::{CaptureStats, Controller, PipelineSummary};
pub use reader_group::{ReaderGroup, ReaderTally};
