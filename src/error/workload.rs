use thiserror::Error;

#[derive(Debug, Error)]
pub enum WorkloadError {
    #[error("Workload '{workload}' applies to unknown client '{client}'.")]
    UnknownClient { workload: String, client: String },
    #[error("Workload '{workload}' needs an interval or a duration.")]
    MissingSpread { workload: String },
    #[error("Workload '{workload}' matched no executions.")]
    NoExecutions { workload: String },
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
