//! Long-running services built on top of the store.

pub mod count_report;

pub use count_report::{CountReport, CountReporter, ReportWindow};
