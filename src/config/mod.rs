//! Scenario configuration: sectioned `key=value` files, the module
//! registry that instantiates their sections, and the reader that
//! turns them into a resolved [`Scenario`](crate::scenario::Scenario).

pub mod reader;
pub mod registry;
pub mod syntax;

pub use crate::error::ConfigError;
pub use registry::ModuleRegistry;
