use thiserror::Error;

use super::{
    ClientError, ConfigError, HostError, MetaError, MuxError, PipelineError, ScenarioError,
    StageError, TcError, ValidationError, WorkloadError,
};

#[derive(Debug, Error)]
pub enum AppError {
    #[error("I/O error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },
    #[error("CLI error: {source}")]
    Clap {
        #[from]
        source: clap::Error,
    },
    #[error("JSON error: {source}")]
    Json {
        #[from]
        source: serde_json::Error,
    },
    #[error("Join error: {source}")]
    Join {
        #[from]
        source: tokio::task::JoinError,
    },
    #[error("Parse error: {source}")]
    ParseInt {
        #[from]
        source: std::num::ParseIntError,
    },
    #[error("Parse error: {source}")]
    ParseFloat {
        #[from]
        source: std::num::ParseFloatError,
    },
    #[error("UTF-8 error: {source}")]
    Utf8 {
        #[from]
        source: std::str::Utf8Error,
    },
    #[error("Format error: {source}")]
    Fmt {
        #[from]
        source: std::fmt::Error,
    },
    #[error("Time error: {source}")]
    SystemTime {
        #[from]
        source: std::time::SystemTimeError,
    },
    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
    #[error("Mux error: {0}")]
    Mux(#[from] MuxError),
    #[error("Host error: {0}")]
    Host(#[from] HostError),
    #[error("Client error: {0}")]
    Client(#[from] ClientError),
    #[error("Staging error: {0}")]
    Stage(#[from] StageError),
    #[error("Traffic control error: {0}")]
    Tc(#[from] TcError),
    #[error("Workload error: {0}")]
    Workload(#[from] WorkloadError),
    #[error("Scenario error: {0}")]
    Scenario(#[from] ScenarioError),
    #[error("Pipeline error: {0}")]
    Pipeline(#[from] PipelineError),
    #[error("Meta error: {0}")]
    Meta(#[from] MetaError),
}

pub type AppResult<T> = Result<T, AppError>;

impl AppError {
    pub fn validation<E>(error: E) -> Self
    where
        E: Into<ValidationError>,
    {
        error.into().into()
    }

    pub fn config<E>(error: E) -> Self
    where
        E: Into<ConfigError>,
    {
        error.into().into()
    }

    pub fn mux<E>(error: E) -> Self
    where
        E: Into<MuxError>,
    {
        error.into().into()
    }

    pub fn host<E>(error: E) -> Self
    where
        E: Into<HostError>,
    {
        error.into().into()
    }

    pub fn client<E>(error: E) -> Self
    where
        E: Into<ClientError>,
    {
        error.into().into()
    }

    pub fn stage<E>(error: E) -> Self
    where
        E: Into<StageError>,
    {
        error.into().into()
    }

    pub fn tc<E>(error: E) -> Self
    where
        E: Into<TcError>,
    {
        error.into().into()
    }

    pub fn workload<E>(error: E) -> Self
    where
        E: Into<WorkloadError>,
    {
        error.into().into()
    }

    pub fn scenario<E>(error: E) -> Self
    where
        E: Into<ScenarioError>,
    {
        error.into().into()
    }

    pub fn pipeline<E>(error: E) -> Self
    where
        E: Into<PipelineError>,
    {
        error.into().into()
    }

    pub fn meta<E>(error: E) -> Self
    where
        E: Into<MetaError>,
    {
        error.into().into()
    }
}
