mod app;
mod client;
mod config;
mod host;
mod meta;
mod mux;
mod pipeline;
mod scenario;
mod stage;
mod tc;
mod validation;
mod workload;

#[cfg(test)]
mod test_support;

pub use app::{AppError, AppResult};
pub use client::ClientError;
pub use config::ConfigError;
pub use host::HostError;
pub use meta::MetaError;
pub use mux::MuxError;
pub use pipeline::PipelineError;
pub use scenario::ScenarioError;
pub use stage::StageError;
pub use tc::TcError;
pub use validation::ValidationError;
pub use workload::WorkloadError;
