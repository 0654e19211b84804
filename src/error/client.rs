use thiserror::Error;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("Client '{client}' on host '{host}' did not report a PID: {output}")]
    PidUnparsable {
        client: String,
        host: String,
        output: String,
    },
    #[error("Client '{client}' on host '{host}' gave an unreadable status: {output}")]
    StatusUnparsable {
        client: String,
        host: String,
        output: String,
    },
    #[error("Client '{client}' on host '{host}' is still running after the kill sequence.")]
    StillRunning { client: String, host: String },
    #[error("Client '{client}' has no binary at '{path}'.")]
    BinaryMissing { client: String, path: String },
    #[error("Client '{client}' was not prepared before use.")]
    NotPrepared { client: String },
    #[error("Execution {execution} is already running client '{client}'.")]
    AlreadyStarted { execution: usize, client: String },
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
