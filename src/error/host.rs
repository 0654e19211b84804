use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum HostError {
    #[error("Failed to connect to host '{name}': {source}")]
    Connect {
        name: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to launch shell for host '{name}': {source}")]
    Spawn {
        name: String,
        #[source]
        source: std::io::Error,
    },
    #[error("Connection to host '{name}' is closed.")]
    Closed { name: String },
    #[error("Connection to host '{name}' was used without being reserved.")]
    NotReserved { name: String },
    #[error("Connection to host '{name}' has an asynchronous command in progress.")]
    AsyncBusy { name: String },
    #[error("Connection to host '{name}' has no asynchronous command in progress.")]
    NoAsyncInProgress { name: String },
    #[error("Host '{name}' has no connections left.")]
    NoConnection { name: String },
    #[error("Could not create a temporary directory on host '{name}': {output}")]
    TempDirFailed { name: String, output: String },
    #[error("Directory '{path}' disappeared on host '{name}'.")]
    RemoteDirMissing { name: String, path: String },
    #[error("Failed to upload '{path}' to host '{name}': {detail}")]
    UploadFailed {
        name: String,
        path: PathBuf,
        detail: String,
    },
    #[error("Failed to download '{path}' from host '{name}': {detail}")]
    DownloadFailed {
        name: String,
        path: String,
        detail: String,
    },
    #[error("Shell pipe to host '{name}' is gone.")]
    PipeClosed { name: String },
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
