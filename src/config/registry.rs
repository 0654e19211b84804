//! Compile-time module registry.
//!
//! The dynamic plug-in loading of older testbeds becomes a table of factory
//! functions keyed by `(kind, subtype)`. Every entry declares the module API
//! version it was written against; lookup rejects entries whose version does
//! not match the running core.

use crate::artifact::{BuilderDriver, FilePlugin, SourceDriver};
use crate::client::ClientPlugin;
use crate::config::ConfigError;
use crate::host::HostDriver;
use crate::pipeline::{LogParser, LogProcessor, LogViewer};
use crate::tc::TrafficShaper;
use crate::workload::WorkloadGenerator;

/// Module API version implemented by this core.
pub const API_VERSION: &str = "2.4.0";

type HostFactory = fn() -> Box<dyn HostDriver>;
type ClientFactory = fn() -> Box<dyn ClientPlugin>;
type FileFactory = fn() -> Box<dyn FilePlugin>;
type ParserFactory = fn() -> Box<dyn LogParser>;
type ProcessorFactory = fn() -> Box<dyn LogProcessor>;
type ViewerFactory = fn() -> Box<dyn LogViewer>;
type WorkloadFactory = fn() -> Box<dyn WorkloadGenerator>;
type ShaperFactory = fn() -> Box<dyn TrafficShaper>;
type SourceFactory = fn() -> Box<dyn SourceDriver>;
type BuilderFactory = fn() -> Box<dyn BuilderDriver>;

struct ModuleEntry<F> {
    subtype: &'static str,
    api_version: &'static str,
    factory: F,
}

fn find<'a, F>(
    entries: &'a [ModuleEntry<F>],
    kind: &str,
    subtype: &str,
) -> Result<&'a F, ConfigError> {
    let entry = entries
        .iter()
        .find(|entry| entry.subtype == subtype)
        .ok_or_else(|| ConfigError::UnknownObjectType {
            kind: kind.to_owned(),
            subtype: subtype.to_owned(),
        })?;
    if entry.api_version != API_VERSION {
        return Err(ConfigError::ApiVersionMismatch {
            kind: kind.to_owned(),
            subtype: subtype.to_owned(),
            declared: entry.api_version.to_owned(),
            supported: API_VERSION,
        });
    }
    Ok(&entry.factory)
}

/// All known module implementations, by kind and subtype.
pub struct ModuleRegistry {
    hosts: Vec<ModuleEntry<HostFactory>>,
    clients: Vec<ModuleEntry<ClientFactory>>,
    files: Vec<ModuleEntry<FileFactory>>,
    parsers: Vec<ModuleEntry<ParserFactory>>,
    processors: Vec<ModuleEntry<ProcessorFactory>>,
    viewers: Vec<ModuleEntry<ViewerFactory>>,
    workloads: Vec<ModuleEntry<WorkloadFactory>>,
    shapers: Vec<ModuleEntry<ShaperFactory>>,
    sources: Vec<ModuleEntry<SourceFactory>>,
    builders: Vec<ModuleEntry<BuilderFactory>>,
}

macro_rules! registry_kind {
    ($register:ident, $lookup:ident, $field:ident, $kind:literal, $trait_object:ty) => {
        pub fn $register(
            &mut self,
            subtype: &'static str,
            api_version: &'static str,
            factory: fn() -> Box<$trait_object>,
        ) {
            self.$field.push(ModuleEntry {
                subtype,
                api_version,
                factory,
            });
        }

        /// Instantiate the module registered for this subtype.
        ///
        /// # Errors
        ///
        /// Returns [`ConfigError::UnknownObjectType`] for unregistered
        /// subtypes and [`ConfigError::ApiVersionMismatch`] for entries
        /// built against another API version.
        pub fn $lookup(&self, subtype: &str) -> Result<Box<$trait_object>, ConfigError> {
            let factory = find(&self.$field, $kind, subtype)?;
            Ok(factory())
        }
    };
}

impl ModuleRegistry {
    /// An empty registry; mostly useful in tests.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            hosts: Vec::new(),
            clients: Vec::new(),
            files: Vec::new(),
            parsers: Vec::new(),
            processors: Vec::new(),
            viewers: Vec::new(),
            workloads: Vec::new(),
            shapers: Vec::new(),
            sources: Vec::new(),
            builders: Vec::new(),
        }
    }

    /// The registry with every built-in module.
    #[must_use]
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register_host("local", API_VERSION, crate::host::local::factory);
        registry.register_host("ssh", API_VERSION, crate::host::ssh::factory);
        registry.register_host("test__", API_VERSION, crate::host::test_double::factory);
        registry.register_client("cmd", API_VERSION, crate::client::cmd::factory);
        registry.register_client("test__", API_VERSION, crate::client::test_double::factory);
        registry.register_file("none", API_VERSION, crate::artifact::none_factory);
        registry.register_file("local", API_VERSION, crate::artifact::local_factory);
        registry.register_file("fakedata", API_VERSION, crate::artifact::fakedata::factory);
        registry.register_parser("cpulog", API_VERSION, crate::pipeline::cpulog::factory);
        registry.register_processor(
            "savehostname",
            API_VERSION,
            crate::pipeline::sidecars::hostname_factory,
        );
        registry.register_processor(
            "savetimeout",
            API_VERSION,
            crate::pipeline::sidecars::timeout_factory,
        );
        registry.register_processor(
            "saveisseeder",
            API_VERSION,
            crate::pipeline::sidecars::seeder_factory,
        );
        registry.register_processor(
            "statistics",
            API_VERSION,
            crate::pipeline::statistics::factory,
        );
        registry.register_viewer(
            "htmlcollection",
            API_VERSION,
            crate::pipeline::htmlcollection::factory,
        );
        registry.register_workload("linear", API_VERSION, crate::workload::linear::factory);
        registry.register_workload("poisson", API_VERSION, crate::workload::poisson::factory);
        registry.register_shaper("netem", API_VERSION, crate::tc::netem::factory);
        registry.register_source("directory", API_VERSION, crate::artifact::source::directory_factory);
        registry.register_source("local", API_VERSION, crate::artifact::source::local_factory);
        registry.register_source("git", API_VERSION, crate::artifact::source::git_factory);
        registry.register_builder("none", API_VERSION, crate::artifact::builder::none_factory);
        registry.register_builder("make", API_VERSION, crate::artifact::builder::make_factory);
        registry
    }

    registry_kind!(register_host, host, hosts, "host", dyn HostDriver);
    registry_kind!(register_client, client, clients, "client", dyn ClientPlugin);
    registry_kind!(register_file, file, files, "file", dyn FilePlugin);
    registry_kind!(register_parser, parser, parsers, "parser", dyn LogParser);
    registry_kind!(
        register_processor,
        processor,
        processors,
        "processor",
        dyn LogProcessor
    );
    registry_kind!(register_viewer, viewer, viewers, "viewer", dyn LogViewer);
    registry_kind!(
        register_workload,
        workload,
        workloads,
        "workload",
        dyn WorkloadGenerator
    );
    registry_kind!(register_shaper, shaper, shapers, "tc", dyn TrafficShaper);
    registry_kind!(register_source, source, sources, "source", dyn SourceDriver);
    registry_kind!(
        register_builder,
        builder,
        builders,
        "builder",
        dyn BuilderDriver
    );
}
