use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ScenarioError {
    #[error("Scenario '{scenario}' was not set up before running.")]
    NotSetUp { scenario: String },
    #[error("Scenario results directory '{path}' already exists.")]
    ResultsCollision { path: PathBuf },
    #[error("Scenario '{scenario}' was interrupted.")]
    Interrupted { scenario: String },
    #[error("Execution {execution} failed on client '{client}'.")]
    ExecutionFailed { execution: usize, client: String },
    #[error("Execution {execution} was used before its {what} was resolved.")]
    Unresolved {
        execution: usize,
        what: &'static str,
    },
    #[error("Execution {execution} has no dedicated connections yet.")]
    ConnectionsMissing { execution: usize },
    #[error("{failed} of {total} scenarios failed.")]
    ScenariosFailed { failed: usize, total: usize },
    #[error("{failed} of {total} campaign file(s) failed.")]
    CampaignsFailed { failed: usize, total: usize },
    #[cfg(test)]
    #[error("Test expectation failed: {message}")]
    TestExpectation { message: &'static str },
    #[cfg(test)]
    #[error("Test expectation failed: {message}: {value}")]
    TestExpectationValue {
        message: &'static str,
        value: String,
    },
}
