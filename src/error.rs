//! Error types for plast jobs.
//!
//! Configuration problems are detected before the engine is touched;
//! everything else is reported after the aggregator has been detached.

use std::fmt;

/// Lifecycle state of a [`crate::aggregator::ReportAggregator`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Idle,
    Started,
    Running,
    Finished,
    Cancelled,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Finished | JobState::Cancelled)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let description = match self {
            JobState::Idle => "idle",
            JobState::Started => "started",
            JobState::Running => "running",
            JobState::Finished => "finished",
            JobState::Cancelled => "cancelled",
        };
        write!(f, "{}", description)
    }
}

/// Internal errors raised while turning engine events into a report.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AggregatorError {
    /// `started` received while not idle.
    AlreadyStarted { state: JobState },
    /// Any mutating event received after `finished` or `cancelled`.
    AlreadyTerminated { event: &'static str, state: JobState },
}

impl fmt::Display for AggregatorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AggregatorError::AlreadyStarted { state } => {
                write!(f, "job start announced while aggregator is {}", state)
            }
            AggregatorError::AlreadyTerminated { event, state } => {
                write!(f, "'{}' event received after job was {}", event, state)
            }
        }
    }
}

impl std::error::Error for AggregatorError {}

#[derive(Debug)]
pub enum PlastError {
    /// Bad user input, detected before job submission.
    Config(String),
    /// The engine failed while executing the job.
    Engine(String),
    /// The aggregator rejected an event; the report is not trustworthy.
    Aggregator(AggregatorError),
    /// The engine cancelled the job (or the deadline expired).
    Cancelled,
    /// The report could not be written.
    Serialization(String),
    Io(std::io::Error),
}

impl From<std::io::Error> for PlastError {
    fn from(err: std::io::Error) -> Self {
        PlastError::Io(err)
    }
}

impl From<AggregatorError> for PlastError {
    fn from(err: AggregatorError) -> Self {
        PlastError::Aggregator(err)
    }
}

impl fmt::Display for PlastError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PlastError::Config(e) => write!(f, "Configuration error: {}", e),
            PlastError::Engine(e) => write!(f, "Engine execution error: {}", e),
            PlastError::Aggregator(e) => write!(f, "Result aggregation error: {}", e),
            PlastError::Cancelled => write!(f, "Job was cancelled"),
            PlastError::Serialization(e) => write!(f, "Unable to write report: {}", e),
            PlastError::Io(e) => write!(f, "IO error: {}", e),
        }
    }
}

impl std::error::Error for PlastError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            PlastError::Aggregator(e) => Some(e),
            PlastError::Io(e) => Some(e),
            _ => None,
        }
    }
}
