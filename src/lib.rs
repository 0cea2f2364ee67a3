//! gsc-backup – pulls Search Console reports and appends them to one workbook per site.

pub mod api;
pub mod auth;
pub mod config;
pub mod error;
pub mod pipeline;
pub mod report;
#[cfg(test)]
mod test;

pub use api::{AnalyticsSource, SearchConsole};
pub use config::{Config, DateWindow};
pub use error::BackupError;
pub use pipeline::{Pipeline, RunSummary};
pub use report::{ReportDataset, ReportKind};
