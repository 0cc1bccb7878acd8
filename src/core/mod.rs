pub mod aligner;
pub mod classifier;
pub mod engine;
pub mod fetch;
pub mod pipeline;
pub mod report;
pub mod validation;

pub use crate::domain::model::{AlignedRecord, RawDataValue, RunReport};
pub use crate::domain::ports::{DataPublisher, FetchAdapter, ProgressSink, ReconPipeline, Storage};
pub use crate::utils::error::Result;
