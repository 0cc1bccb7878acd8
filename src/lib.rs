pub mod adapters;
pub mod config;
pub mod core;
pub mod domain;
pub mod utils;

#[cfg(feature = "cli")]
pub use config::CliConfig;

pub use adapters::{Dhis2Client, LocalStorage, ReportWriter};
pub use config::RunConfig;
pub use core::{engine::ReconEngine, pipeline::ComparisonPipeline};
pub use utils::error::{ReconError, Result};
