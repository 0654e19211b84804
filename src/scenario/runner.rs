//! The scenario run lifecycle: setup, client execution, log
//! collection and teardown.
//!
//! A real run walks all phases and ends in processed results; a check
//! run stops after setup and discards everything. Teardown is
//! best-effort in both: every failure past the point of no return is
//! reported and swallowed so later steps still get their chance.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::error::{AppError, AppResult, ConfigError, PipelineError, ScenarioError};
use crate::host::{Connection, Host, Reuse};
use crate::pipeline::{EXECUTIONS_DIR, PROCESSED_DIR, VIEWS_DIR, parsed_log_dir, raw_log_dir};
use crate::runtime::RunContext;
use crate::shutdown::{ShutdownReceiver, ShutdownSender, shutdown_channel};
use crate::tc::{TcPlan, TrafficShaper, negotiate, plan_restrictions};

use super::Scenario;
use super::execution::Execution;

/// Pause between liveness sweeps while the clients run.
const RUN_POLL_INTERVAL: Duration = Duration::from_secs(5);
/// How long a phase task may take to come home before a warning.
const SOFT_JOIN_TIMEOUT: Duration = Duration::from_secs(60);

/// A negotiated traffic control plan bound to its host and shaper.
struct TcBinding {
    host: Arc<Host>,
    shaper: Arc<dyn TrafficShaper>,
    plan: TcPlan,
}

/// What one run accumulates. Kept outside [`Scenario`] so the teardown
/// can see exactly how far the run got.
struct RunState {
    tc: Vec<TcBinding>,
    starters: Vec<(usize, JoinHandle<()>)>,
    latch: ShutdownSender,
}

impl RunState {
    fn new() -> Self {
        let (latch, _) = shutdown_channel();
        Self {
            tc: Vec::new(),
            starters: Vec::new(),
            latch,
        }
    }
}

impl Scenario {
    /// Run the scenario for real: prepare everything, let the clients
    /// run out, collect and process the logs, tear everything down.
    ///
    /// When a phase fails, whatever logs exist are salvaged and
    /// processed before the teardown, and the failure is returned
    /// after it.
    ///
    /// # Errors
    ///
    /// Fails when any phase up to log parsing fails, when the run is
    /// interrupted, or when processing the results fails.
    pub async fn run(&self, ctx: &Arc<RunContext>) -> AppResult<()> {
        tracing::info!("=== Running scenario {} ===", self.name());
        self.results_dir_guard()?;
        let mut state = RunState::new();
        let outcome = self.run_to_parsed(ctx, &mut state).await;
        if outcome.is_err() {
            self.salvage_logs(ctx).await;
            if let Err(error) = self.process_logs() {
                ctx.report_warning(
                    self.name(),
                    &format!("Failed to process salvaged logs: {error}"),
                );
            }
        }
        self.clean_up(ctx, &mut state).await;
        outcome?;
        self.process_logs()?;
        tracing::info!("=== Scenario {} completed ===", self.name());
        Ok(())
    }

    /// Check the scenario without running clients: prepare the hosts,
    /// probe traffic control, then tear down and discard the results
    /// directory.
    ///
    /// # Errors
    ///
    /// Fails when setup fails or the run is interrupted.
    pub async fn test(&self, ctx: &Arc<RunContext>) -> AppResult<()> {
        tracing::info!("=== Checking scenario {} ===", self.name());
        self.results_dir_guard()?;
        let mut state = RunState::new();
        let outcome = self.set_up(ctx, &mut state, true).await;
        self.clean_up(ctx, &mut state).await;
        if let Err(error) = fs::remove_dir_all(self.results_dir()) {
            ctx.report_warning(
                self.name(),
                &format!("Could not discard check-run results: {error}"),
            );
        }
        outcome?;
        tracing::info!("=== Scenario {} checked ===", self.name());
        Ok(())
    }

    async fn run_to_parsed(&self, ctx: &Arc<RunContext>, state: &mut RunState) -> AppResult<()> {
        self.set_up(ctx, state, false).await?;
        self.execute_run(ctx, state).await?;
        self.parse_logs(ctx).await
    }

    /// The results directory is created when the scenario is read; a
    /// missing one means this object never went through the reader.
    fn results_dir_guard(&self) -> AppResult<()> {
        if self.results_dir().is_dir() {
            return Ok(());
        }
        Err(AppError::scenario(ScenarioError::NotSetUp {
            scenario: self.name().to_owned(),
        }))
    }

    fn interrupted(&self) -> AppError {
        AppError::scenario(ScenarioError::Interrupted {
            scenario: self.name().to_owned(),
        })
    }

    fn interrupt_guard(&self, ctx: &RunContext) -> AppResult<()> {
        if ctx.is_interrupted() {
            return Err(self.interrupted());
        }
        Ok(())
    }

    /// Prepare hosts, clients and files, then plan traffic control.
    /// A check run skips everything that would leave data on a host.
    async fn set_up(
        &self,
        ctx: &Arc<RunContext>,
        state: &mut RunState,
        check_run: bool,
    ) -> AppResult<()> {
        tracing::info!("Preparing the objects of scenario {}", self.name());
        let executions_dir = self.results_dir().join(EXECUTIONS_DIR);
        fs::create_dir_all(&executions_dir).map_err(|source| {
            AppError::config(ConfigError::CreateDir {
                path: executions_dir,
                source,
            })
        })?;
        for host in self.execution_hosts()? {
            self.interrupt_guard(ctx)?;
            host.prepare().await?;
        }
        for client in self.clients() {
            self.interrupt_guard(ctx)?;
            client.prepare().await?;
        }
        if !check_run {
            for (host, client) in self.clients_on_hosts()? {
                self.interrupt_guard(ctx)?;
                client.prepare_host(&host).await?;
            }
            for (host, file) in self.files_on_hosts()? {
                self.interrupt_guard(ctx)?;
                file.stage_host(&host).await?;
            }
            for (host, file) in self.files_on_seeding_hosts()? {
                self.interrupt_guard(ctx)?;
                file.stage_seeding_host(&host).await?;
            }
        }
        self.interrupt_guard(ctx)?;
        self.plan_traffic_control(state).await
    }

    /// Negotiate a plan for every shaped host that actually runs an
    /// execution. Probing is read-only, so check runs do it too.
    async fn plan_traffic_control(&self, state: &mut RunState) -> AppResult<()> {
        let pairs = self.clients_on_hosts()?;
        let used = self.execution_hosts()?;
        for (host, shaper) in self.shapers() {
            if !used.iter().any(|candidate| candidate.name() == host.name()) {
                continue;
            }
            let traffic: Vec<_> = pairs
                .iter()
                .filter(|(placed, _)| placed.name() == host.name())
                .map(|(_, client)| client.traffic())
                .collect();
            let subnet = host.subnet();
            let Some(plan) = plan_restrictions(host.tc_settings(), host.name(), &subnet, &traffic)?
            else {
                continue;
            };
            let plan = negotiate(shaper.as_ref(), host, plan).await?;
            state.tc.push(TcBinding {
                host: Arc::clone(host),
                shaper: Arc::clone(shaper),
                plan,
            });
        }
        Ok(())
    }

    /// Let the clients run. Traffic control always comes off again,
    /// whether the run succeeded or not.
    async fn execute_run(&self, ctx: &Arc<RunContext>, state: &mut RunState) -> AppResult<()> {
        let outcome = self.drive_clients(ctx, state).await;
        for binding in &state.tc {
            binding.shaper.remove(&binding.host).await;
        }
        outcome
    }

    async fn drive_clients(&self, ctx: &Arc<RunContext>, state: &mut RunState) -> AppResult<()> {
        self.interrupt_guard(ctx)?;
        self.install_traffic_control(state).await?;
        for execution in self.executions() {
            self.interrupt_guard(ctx)?;
            execution.client()?.prepare_execution(execution).await?;
        }
        tracing::info!("Creating the connections the clients will run over");
        for execution in self.executions() {
            self.interrupt_guard(ctx)?;
            execution.create_runner_connections().await?;
        }
        let base = Instant::now();
        let end_at = base.checked_add(self.time_limit()).unwrap_or(base);
        if self.parallel() {
            tracing::info!("Starting all clients; not every client may be running on return");
            for execution in self.executions() {
                let start_at = base.checked_add(execution.timeout()).unwrap_or(end_at);
                let task_ctx = Arc::clone(ctx);
                let task_execution = Arc::clone(execution);
                let mut latch = state.latch.subscribe();
                let handle = tokio::spawn(async move {
                    start_one(&task_ctx, &task_execution, start_at, end_at, &mut latch).await;
                });
                state.starters.push((execution.number(), handle));
            }
        } else {
            tracing::info!("Starting all clients in order; this takes until the last start");
            let mut order: Vec<Arc<Execution>> = self.executions().to_vec();
            order.sort_by_key(|execution| execution.timeout());
            let mut latch = state.latch.subscribe();
            for execution in &order {
                self.interrupt_guard(ctx)?;
                let start_at = base.checked_add(execution.timeout()).unwrap_or(end_at);
                start_one(ctx, execution, start_at, end_at, &mut latch).await;
            }
        }
        tracing::info!("Running...");
        self.poll_clients(ctx, end_at).await?;
        self.collect_starters(ctx, state).await;
        self.kill_clients(ctx).await
    }

    /// Install the negotiated plans. Whole-subnet restrictions need to
    /// know the subnets of the other hosts in the run.
    async fn install_traffic_control(&self, state: &RunState) -> AppResult<()> {
        if state.tc.is_empty() {
            return Ok(());
        }
        let hosts = self.execution_hosts()?;
        for binding in &state.tc {
            let other_subnets: Vec<String> = hosts
                .iter()
                .filter(|host| host.name() != binding.host.name())
                .map(|host| host.subnet())
                .collect::<BTreeSet<_>>()
                .into_iter()
                .collect();
            binding
                .shaper
                .install(&binding.host, &binding.plan, &other_subnets)
                .await?;
        }
        Ok(())
    }

    /// Sleep-and-sweep until the time limit or until every relevant
    /// client is done. Side services never count; seeders only count
    /// when they keep seeding.
    async fn poll_clients(&self, ctx: &Arc<RunContext>, end_at: Instant) -> AppResult<()> {
        let mut shutdown = ctx.subscribe_shutdown();
        loop {
            if ctx.is_interrupted() {
                return Err(self.interrupted());
            }
            let now = Instant::now();
            if now >= end_at {
                tracing::info!("Time limit of scenario {} reached", self.name());
                return Ok(());
            }
            let wake = now.checked_add(RUN_POLL_INTERVAL).unwrap_or(end_at).min(end_at);
            tokio::select! {
                () = tokio::time::sleep_until(wake) => {}
                _ = shutdown.recv() => {
                    ctx.interrupt();
                    return Err(self.interrupted());
                }
            }
            if self.clients_finished().await? {
                tracing::info!("All clients of scenario {} have finished", self.name());
                return Ok(());
            }
        }
    }

    async fn clients_finished(&self) -> AppResult<bool> {
        for execution in self.executions() {
            let client = execution.client()?;
            if client.is_side_service() {
                continue;
            }
            if execution.is_seeder() && !execution.keeps_seeding() {
                continue;
            }
            if !client.has_started(execution) {
                return Ok(false);
            }
            if client.is_stopped(execution) {
                continue;
            }
            if client.is_running(execution).await? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Wake pending start tasks and wait for all of them to come home.
    async fn collect_starters(&self, ctx: &RunContext, state: &mut RunState) {
        if state.starters.is_empty() {
            return;
        }
        drop(state.latch.send(()));
        for (number, handle) in state.starters.drain(..) {
            match tokio::time::timeout(SOFT_JOIN_TIMEOUT, handle).await {
                Ok(Ok(())) => {}
                Ok(Err(join_error)) => ctx.report_warning(
                    self.name(),
                    &format!("The start task of execution {number} crashed: {join_error}"),
                ),
                Err(_) => ctx.report_warning(
                    self.name(),
                    &format!(
                        "The start task of execution {number} was still busy after {} seconds",
                        SOFT_JOIN_TIMEOUT.as_secs()
                    ),
                ),
            }
        }
    }

    /// Stop every client that started and was not seen stopping.
    async fn kill_clients(&self, ctx: &Arc<RunContext>) -> AppResult<()> {
        tracing::info!("All clients should be done now; checking and killing where needed");
        let mut targets = Vec::new();
        for execution in self.executions() {
            let client = execution.client()?;
            if client.has_started(execution) && !client.is_stopped(execution) {
                let label = format!("{} on host {}", client.name(), execution.host()?.name());
                targets.push((Arc::clone(execution), label));
            }
        }
        if self.parallel() {
            let mut waits = Vec::new();
            for (execution, label) in targets {
                let task_ctx = Arc::clone(ctx);
                let handle = tokio::spawn(async move {
                    kill_one(&task_ctx, &execution).await;
                });
                waits.push((label, handle));
            }
            for (label, handle) in waits {
                if tokio::time::timeout(SOFT_JOIN_TIMEOUT, handle).await.is_err() {
                    ctx.report_warning(
                        self.name(),
                        &format!(
                            "A client was not killed after {} seconds: {label}",
                            SOFT_JOIN_TIMEOUT.as_secs()
                        ),
                    );
                }
            }
        } else {
            for (execution, _) in &targets {
                kill_one(ctx, execution).await;
            }
        }
        Ok(())
    }

    /// Pull every execution's logs home and run its parsers. Failures
    /// are reported per execution; the first one fails the phase once
    /// all executions had their chance.
    async fn parse_logs(&self, ctx: &Arc<RunContext>) -> AppResult<()> {
        self.interrupt_guard(ctx)?;
        tracing::info!("Retrieving and parsing the logs of scenario {}", self.name());
        let base = self.results_dir().join(EXECUTIONS_DIR);
        let mut work = Vec::new();
        for execution in self.executions() {
            for dir in [
                raw_log_dir(&base, execution.number()),
                parsed_log_dir(&base, execution.number()),
            ] {
                fs::create_dir_all(&dir).map_err(|source| {
                    AppError::config(ConfigError::CreateDir { path: dir, source })
                })?;
            }
            let client = execution.client()?;
            if client.is_side_service() {
                continue;
            }
            work.push((Arc::clone(execution), client.name().to_owned()));
        }
        let mut failures: Vec<(usize, String)> = Vec::new();
        if self.parallel() {
            let mut waits = Vec::new();
            for (execution, client_name) in work {
                let number = execution.number();
                let task_base = base.clone();
                let handle: JoinHandle<AppResult<()>> =
                    tokio::spawn(
                        async move { retrieve_and_parse(&execution, &task_base).await },
                    );
                waits.push((number, client_name, handle));
            }
            for (number, client_name, handle) in waits {
                match tokio::time::timeout(SOFT_JOIN_TIMEOUT, handle).await {
                    Ok(Ok(Ok(()))) => {}
                    Ok(Ok(Err(error))) => {
                        ctx.report_error(&format!("execution {number}"), &error);
                        failures.push((number, client_name));
                    }
                    Ok(Err(join_error)) => {
                        ctx.report_warning(
                            &format!("execution {number}"),
                            &format!("The log task crashed: {join_error}"),
                        );
                        failures.push((number, client_name));
                    }
                    Err(_) => {
                        ctx.report_warning(
                            self.name(),
                            &format!(
                                "A log task was not done after {} seconds: {client_name}",
                                SOFT_JOIN_TIMEOUT.as_secs()
                            ),
                        );
                        failures.push((number, client_name));
                    }
                }
            }
        } else {
            for (execution, client_name) in work {
                if let Err(error) = retrieve_and_parse(&execution, &base).await {
                    ctx.report_error(&format!("execution {}", execution.number()), &error);
                    failures.push((execution.number(), client_name));
                }
            }
        }
        if let Some((execution, client)) = failures.into_iter().next() {
            return Err(AppError::scenario(ScenarioError::ExecutionFailed {
                execution,
                client,
            }));
        }
        Ok(())
    }

    /// Best-effort log retrieval after a failed run. Everything that
    /// can be pulled is pulled; nothing raises.
    async fn salvage_logs(&self, ctx: &Arc<RunContext>) {
        tracing::info!("Salvaging the logs of scenario {}", self.name());
        let base = self.results_dir().join(EXECUTIONS_DIR);
        for execution in self.executions() {
            let scope = format!("execution {}", execution.number());
            let raw = raw_log_dir(&base, execution.number());
            let parsed = parsed_log_dir(&base, execution.number());
            if let Err(error) =
                fs::create_dir_all(&raw).and_then(|()| fs::create_dir_all(&parsed))
            {
                ctx.report_warning(&scope, &format!("Could not create log directories: {error}"));
                continue;
            }
            let client = match execution.client() {
                Ok(client) => client,
                Err(error) => {
                    ctx.report_error(&scope, &error);
                    continue;
                }
            };
            if client.is_side_service() {
                continue;
            }
            if let Err(error) = client.retrieve_logs(execution, &raw).await {
                ctx.report_warning(&scope, &format!("Could not salvage logs: {error}"));
            }
            match Self::execution_view(execution) {
                Ok(view) => {
                    for parser in execution.parsers() {
                        if let Err(error) = parser.parse_logs(&view, &raw, &parsed) {
                            ctx.report_warning(
                                &scope,
                                &format!("Could not parse salvaged logs: {error}"),
                            );
                        }
                    }
                }
                Err(error) => ctx.report_error(&scope, &error),
            }
        }
    }

    /// Run the processors over the executions directory, then the
    /// viewers over the processed output. Both output directories must
    /// be fresh.
    fn process_logs(&self) -> AppResult<()> {
        tracing::info!("Processing the logs of scenario {}", self.name());
        let executions_dir = self.results_dir().join(EXECUTIONS_DIR);
        let processed_dir = self.results_dir().join(PROCESSED_DIR);
        if processed_dir.exists() {
            return Err(AppError::pipeline(PipelineError::OutputExists {
                path: processed_dir,
            }));
        }
        fs::create_dir_all(&processed_dir).map_err(|source| {
            AppError::config(ConfigError::CreateDir {
                path: processed_dir.clone(),
                source,
            })
        })?;
        let view = self.view()?;
        for processor in self.processors() {
            processor.process_logs(&view, &executions_dir, &processed_dir)?;
        }
        let views_dir = self.results_dir().join(VIEWS_DIR);
        if views_dir.exists() {
            return Err(AppError::pipeline(PipelineError::OutputExists {
                path: views_dir,
            }));
        }
        fs::create_dir_all(&views_dir).map_err(|source| {
            AppError::config(ConfigError::CreateDir {
                path: views_dir.clone(),
                source,
            })
        })?;
        for viewer in self.viewers() {
            viewer.create_view(&view, &processed_dir, &views_dir)?;
        }
        Ok(())
    }

    /// Tear the scenario down. Every step is reported-and-continue:
    /// outstanding tasks, stray processes, files, clients, traffic
    /// control, hosts.
    async fn clean_up(&self, ctx: &Arc<RunContext>, state: &mut RunState) {
        tracing::info!("Cleaning up scenario {}", self.name());
        self.collect_starters(ctx, state).await;
        // Fresh connections for the kill sweep; the run's own may be
        // wedged mid-command.
        let mut sweepers: BTreeMap<String, Arc<Connection>> = BTreeMap::new();
        for host in self.hosts() {
            match host.create_connection().await {
                Ok(connection) => {
                    sweepers.insert(host.name().to_owned(), connection);
                }
                Err(error) => ctx.report_warning(
                    host.name(),
                    &format!("No cleanup connection; parts of the cleanup may fail: {error}"),
                ),
            }
        }
        for execution in self.executions() {
            let Ok(client) = execution.client() else {
                continue;
            };
            let Ok(host) = execution.host() else {
                continue;
            };
            if !client.has_started(execution) || client.is_stopped(execution) {
                continue;
            }
            let scope = format!("execution {}", execution.number());
            let connection = sweepers.get(host.name());
            let probed = match connection {
                Some(connection) => client.is_running_via(execution, connection).await,
                None => client.is_running(execution).await,
            };
            match probed {
                Ok(true) => {
                    let killed = match connection {
                        Some(connection) => client.kill_via(execution, connection).await,
                        None => client.kill(execution).await,
                    };
                    if let Err(error) = killed {
                        ctx.report_warning(&scope, &format!("Discarding cleanup failure: {error}"));
                    }
                }
                Ok(false) => {}
                Err(error) => {
                    ctx.report_warning(&scope, &format!("Discarding cleanup failure: {error}"));
                }
            }
        }
        for execution in self.executions() {
            execution.close_connections().await;
        }
        for file in self.files() {
            file.cleanup().await;
        }
        if let Ok(pairs) = self.clients_on_hosts() {
            for (host, client) in pairs {
                let reuse = sweepers
                    .get(host.name())
                    .map_or(Reuse::Default, |connection| {
                        Reuse::Specific(Arc::clone(connection))
                    });
                if let Err(error) = client.cleanup_host(&host, &reuse).await {
                    ctx.report_warning(
                        client.name(),
                        &format!("Discarding cleanup failure: {error}"),
                    );
                }
            }
        }
        for client in self.clients() {
            client.cleanup().await;
        }
        for binding in &state.tc {
            binding.shaper.remove(&binding.host).await;
        }
        // Host cleanup closes every pooled connection, the sweepers
        // included.
        for host in self.hosts() {
            host.cleanup().await;
        }
    }
}

/// Wait out the execution's start offset, then start its client. The
/// wait ends early when the run latch fires, the campaign shuts down,
/// or the time limit passes first; the client then never starts.
/// Start failures are reported, not raised: the execution simply never
/// shows up as started.
async fn start_one(
    ctx: &RunContext,
    execution: &Arc<Execution>,
    start_at: Instant,
    end_at: Instant,
    latch: &mut ShutdownReceiver,
) {
    let mut shutdown = ctx.subscribe_shutdown();
    let proceed = tokio::select! {
        () = tokio::time::sleep_until(start_at) => true,
        () = tokio::time::sleep_until(end_at), if end_at < start_at => false,
        _ = latch.recv() => false,
        _ = shutdown.recv() => false,
    };
    if !proceed {
        tracing::debug!("Not starting execution {}: the run is over", execution.number());
        return;
    }
    let scope = format!("execution {}", execution.number());
    let client = match execution.client() {
        Ok(client) => client,
        Err(error) => {
            ctx.report_error(&scope, &error);
            return;
        }
    };
    if let Err(error) = client.start(execution).await {
        ctx.report_error(&scope, &error);
    }
}

/// Kill the execution's process if it still runs. Errors are reported
/// and swallowed; the teardown gets another attempt later.
async fn kill_one(ctx: &RunContext, execution: &Arc<Execution>) {
    let scope = format!("execution {}", execution.number());
    let client = match execution.client() {
        Ok(client) => client,
        Err(error) => {
            ctx.report_error(&scope, &error);
            return;
        }
    };
    match client.is_running(execution).await {
        Ok(true) => {
            if let Err(error) = client.kill(execution).await {
                ctx.report_error(&scope, &error);
            }
        }
        Ok(false) => {}
        Err(error) => ctx.report_error(&scope, &error),
    }
}

async fn retrieve_and_parse(execution: &Arc<Execution>, base: &Path) -> AppResult<()> {
    let raw = raw_log_dir(base, execution.number());
    let parsed = parsed_log_dir(base, execution.number());
    let client = execution.client()?;
    client.retrieve_logs(execution, &raw).await?;
    let view = Scenario::execution_view(execution)?;
    for parser in execution.parsers() {
        parser.parse_logs(&view, &raw, &parsed)?;
    }
    Ok(())
}
