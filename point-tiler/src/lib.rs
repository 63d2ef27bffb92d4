//! Parallel octree tiler for large point clouds.
//!
//! Streams decoded point batches into an implicit octree, samples each
//! node down to its level-of-detail budget, and persists node payloads
//! into a directory a web renderer can stream from. See `driver` for the
//! full orchestration and `tiler` for the scheduling core.

pub mod cache;
pub mod config;
pub mod driver;
pub mod error;
pub mod execution;
pub mod manifest;
pub mod persistence;
pub mod progress;
pub mod sampling;
pub mod sources;
pub mod tiler;
pub mod transform;

pub use config::{ConverterConfig, OutputFormat, SamplingStrategy, SpacingSpec, StoreOption};
pub use driver::{ConversionSummary, Converter};
pub use error::{Result, TilerError};
pub use progress::ProgressReporter;
pub use tiler::CancellationToken;
