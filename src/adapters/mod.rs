// Adapters layer: concrete implementations of the domain ports
// (DHIS2 HTTP, local storage, report output)

pub mod dhis2;
pub mod report_writer;
pub mod storage;

pub use dhis2::Dhis2Client;
pub use report_writer::{load_history, OutputFormat, ReportWriter};
pub use storage::LocalStorage;
