//! Core library for the `campaigner` CLI.
//!
//! This crate provides the internal building blocks used by the binary: CLI
//! argument types, campaign and scenario configuration, the mux transport for
//! remote hosts, client and file staging, traffic control, workloads, and the
//! parse/process/view pipeline over harvested logs. The primary user-facing
//! interface is the `campaigner` command-line application; library APIs may
//! evolve as the CLI grows.
pub mod args;
pub mod artifact;
pub mod campaign;
pub mod client;
pub mod config;
pub mod entry;
pub mod error;
pub mod host;
pub mod logger;
pub mod meta;
pub mod mux;
pub mod pipeline;
pub mod report;
pub mod runtime;
pub mod scenario;
pub mod shutdown;
pub mod tc;
pub mod workload;
