use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Refusing to overwrite '{path}'.")]
    OutputExists { path: PathBuf },
    #[error("Failed to read log '{path}': {source}")]
    ReadLog {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to write '{path}': {source}")]
    WriteData {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("'{path}' is not a scenario result directory: {reason}.")]
    NotReparseable { path: PathBuf, reason: &'static str },
    #[error("Execution directory '{path}' is missing.")]
    MissingExecutionDir { path: PathBuf },
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
