use thiserror::Error;

#[derive(Debug, Error)]
pub enum ValidationError {
    #[error(
        "Invalid name '{value}'. Names start with a letter and may contain letters, digits, \
'_', '.' and '-'."
    )]
    InvalidName { value: String },
    #[error("Value must not be empty.")]
    ValueEmpty,
    #[error("Invalid value: {source}")]
    InvalidNumber {
        #[source]
        source: std::num::ParseIntError,
    },
    #[error("Invalid value: {source}")]
    InvalidFloat {
        #[source]
        source: std::num::ParseFloatError,
    },
    #[error("Value must be >= {min}.")]
    ValueTooSmall { min: u64 },
    #[error("Value must be positive.")]
    ValueZero,
    #[error("Value must be >= 0.")]
    ValueNegative,
    #[error("Failed to build runtime: {source}")]
    RuntimeBuildFailed {
        #[source]
        source: std::io::Error,
    },
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
