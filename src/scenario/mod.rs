//! Scenario model: the object graph of one experiment and the run
//! logic that drives it through its lifecycle.
//!
//! A scenario is assembled by the config reader from sectioned
//! scenario files and then either checked ([`Scenario::test`]) or run
//! ([`Scenario::run`]); both live in [`runner`]. This module holds the
//! graph itself and the placement queries the phases work from.

pub mod execution;
pub mod runner;

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::artifact::FileObject;
use crate::client::Client;
use crate::error::AppResult;
use crate::host::Host;
use crate::pipeline::{ExecutionView, LogProcessor, LogViewer, Parser, ScenarioView};
use crate::tc::TrafficShaper;
use execution::Execution;

/// Every object a scenario owns, resolved and ready to use.
#[derive(Default)]
pub struct ScenarioObjects {
    pub hosts: Vec<Arc<Host>>,
    pub clients: Vec<Arc<Client>>,
    pub files: Vec<Arc<FileObject>>,
    pub executions: Vec<Arc<Execution>>,
    pub parsers: Vec<Arc<Parser>>,
    pub processors: Vec<Box<dyn LogProcessor>>,
    pub viewers: Vec<Box<dyn LogViewer>>,
    /// One shaper per host that asked for traffic control.
    pub shapers: Vec<(Arc<Host>, Arc<dyn TrafficShaper>)>,
}

/// One experiment: a named object graph with a time limit and a
/// results directory of its own.
pub struct Scenario {
    name: String,
    parallel: bool,
    time_limit: Duration,
    results_dir: PathBuf,
    objects: ScenarioObjects,
}

impl Scenario {
    #[must_use]
    pub const fn new(
        name: String,
        parallel: bool,
        time_limit: Duration,
        results_dir: PathBuf,
        objects: ScenarioObjects,
    ) -> Self {
        Self {
            name,
            parallel,
            time_limit,
            results_dir,
            objects,
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether clients are started and torn down concurrently.
    #[must_use]
    pub const fn parallel(&self) -> bool {
        self.parallel
    }

    /// Hard bound on how long the clients may run.
    #[must_use]
    pub const fn time_limit(&self) -> Duration {
        self.time_limit
    }

    /// The directory all results of this scenario end up under.
    #[must_use]
    pub fn results_dir(&self) -> &Path {
        &self.results_dir
    }

    #[must_use]
    pub fn hosts(&self) -> &[Arc<Host>] {
        &self.objects.hosts
    }

    #[must_use]
    pub fn clients(&self) -> &[Arc<Client>] {
        &self.objects.clients
    }

    #[must_use]
    pub fn files(&self) -> &[Arc<FileObject>] {
        &self.objects.files
    }

    #[must_use]
    pub fn executions(&self) -> &[Arc<Execution>] {
        &self.objects.executions
    }

    #[must_use]
    pub fn parsers(&self) -> &[Arc<Parser>] {
        &self.objects.parsers
    }

    #[must_use]
    pub fn processors(&self) -> &[Box<dyn LogProcessor>] {
        &self.objects.processors
    }

    #[must_use]
    pub fn viewers(&self) -> &[Box<dyn LogViewer>] {
        &self.objects.viewers
    }

    #[must_use]
    pub fn shapers(&self) -> &[(Arc<Host>, Arc<dyn TrafficShaper>)] {
        &self.objects.shapers
    }

    /// The hosts at least one execution runs on, each once. Hosts that
    /// are declared but never referenced are not prepared, only
    /// cleaned.
    ///
    /// # Errors
    ///
    /// Fails when an execution was never resolved.
    pub fn execution_hosts(&self) -> AppResult<Vec<Arc<Host>>> {
        let mut seen = BTreeSet::new();
        let mut hosts = Vec::new();
        for execution in &self.objects.executions {
            let host = execution.host()?;
            if seen.insert(host.name().to_owned()) {
                hosts.push(host);
            }
        }
        Ok(hosts)
    }

    /// Unique host and client pairings over all executions, in order
    /// of first appearance.
    ///
    /// # Errors
    ///
    /// Fails when an execution was never resolved.
    pub fn clients_on_hosts(&self) -> AppResult<Vec<(Arc<Host>, Arc<Client>)>> {
        let mut seen = BTreeSet::new();
        let mut pairs = Vec::new();
        for execution in &self.objects.executions {
            let host = execution.host()?;
            let client = execution.client()?;
            if seen.insert((host.name().to_owned(), client.name().to_owned())) {
                pairs.push((host, client));
            }
        }
        Ok(pairs)
    }

    /// Unique host and file pairings over all executions. Every such
    /// pair gets the file's meta data staged.
    ///
    /// # Errors
    ///
    /// Fails when an execution was never resolved.
    pub fn files_on_hosts(&self) -> AppResult<Vec<(Arc<Host>, Arc<FileObject>)>> {
        self.file_placements(|_| true)
    }

    /// Unique host and file pairings over the seeder executions. Every
    /// such pair gets the file's data staged as well.
    ///
    /// # Errors
    ///
    /// Fails when an execution was never resolved.
    pub fn files_on_seeding_hosts(&self) -> AppResult<Vec<(Arc<Host>, Arc<FileObject>)>> {
        self.file_placements(Execution::is_seeder)
    }

    fn file_placements(
        &self,
        relevant: impl Fn(&Execution) -> bool,
    ) -> AppResult<Vec<(Arc<Host>, Arc<FileObject>)>> {
        let mut seen = BTreeSet::new();
        let mut pairs = Vec::new();
        for execution in &self.objects.executions {
            if !relevant(execution.as_ref()) {
                continue;
            }
            let host = execution.host()?;
            for file in execution.files() {
                if seen.insert((host.name().to_owned(), file.name().to_owned())) {
                    pairs.push((Arc::clone(&host), Arc::clone(file)));
                }
            }
        }
        Ok(pairs)
    }

    /// The slice of one execution the pipeline stages see.
    ///
    /// # Errors
    ///
    /// Fails when the execution was never resolved.
    pub fn execution_view(execution: &Execution) -> AppResult<ExecutionView> {
        let host = execution.host()?;
        let client = execution.client()?;
        Ok(ExecutionView::new(
            execution.number(),
            host.name().to_owned(),
            execution.is_seeder(),
            client.is_side_service(),
            execution.timeout(),
        ))
    }

    /// A live view over the whole scenario for processors and viewers.
    ///
    /// # Errors
    ///
    /// Fails when an execution was never resolved.
    pub fn view(&self) -> AppResult<ScenarioView> {
        let mut views = Vec::with_capacity(self.objects.executions.len());
        for execution in &self.objects.executions {
            views.push(Self::execution_view(execution)?);
        }
        Ok(ScenarioView::live(self.name.clone(), views))
    }
}
