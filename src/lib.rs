//! Run PLAST-style bank-to-bank comparisons and aggregate the streamed
//! engine results into a single BLAST-like report.

pub mod aggregator;
pub mod coords;
pub mod engine;
pub mod error;
pub mod report;
pub mod runner;
pub mod utils;
pub mod writer;

pub use aggregator::{JobStats, ReportAggregator, ResultAggregator};
pub use error::{AggregatorError, JobState, PlastError};
pub use runner::{run_job, JobConfig, JobReport};
