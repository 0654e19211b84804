//! Campaign files and the campaign run loop.
//!
//! A campaign file is a list of `[scenario]` sections, each naming one
//! scenario and the files it is read from. Running a campaign creates
//! a timestamped results directory, reads every scenario into it and
//! then checks or runs them in order. A failing scenario is recorded
//! in `err.log` and does not stop the others; the campaign reports the
//! tally as its own result.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::config::reader;
use crate::config::registry::ModuleRegistry;
use crate::config::syntax::{ConfigLine, classify_line, parse_positive_u64, validate_name};
use crate::error::{AppError, AppResult, ConfigError, ScenarioError};
use crate::report::{CampaignSummary, ScenarioOutcome, write_summary};
use crate::runtime::{self, RunContext};
use crate::shutdown::ShutdownSender;

/// Scenario time limit when a `[scenario]` section does not set one.
const DEFAULT_TIME_LIMIT: Duration = Duration::from_secs(300);

/// How the campaign treats its scenarios.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunMode {
    /// Set everything up and tear it down again without starting
    /// clients.
    Check,
    /// The full run.
    Real,
}

/// One `[scenario]` section, ready to be read.
struct ScenarioEntry {
    name: String,
    files: Vec<PathBuf>,
    parallel: bool,
    time_limit: Duration,
}

/// A `[scenario]` section still being collected.
struct OpenEntry {
    name: Option<String>,
    files: Vec<PathBuf>,
    parallel: bool,
    time_limit: Duration,
}

impl OpenEntry {
    const fn start() -> Self {
        Self {
            name: None,
            files: Vec::new(),
            parallel: true,
            time_limit: DEFAULT_TIME_LIMIT,
        }
    }

    /// Apply one `key=value` line.
    ///
    /// Accepting a `name` claims the scenario's results directory
    /// under `scenarios_dir` right away, which also catches two
    /// scenarios using the same name.
    fn apply(&mut self, key: &str, value: &str, scenarios_dir: &Path) -> AppResult<()> {
        match key {
            "name" => {
                if self.name.is_some() {
                    return Err(AppError::config(ConfigError::DuplicateParameter {
                        section: "scenario".to_owned(),
                        key: key.to_owned(),
                    }));
                }
                validate_name(value).map_err(|source| {
                    AppError::config(ConfigError::InvalidValue {
                        key: key.to_owned(),
                        source,
                    })
                })?;
                let results_dir = scenarios_dir.join(value);
                if results_dir.exists() {
                    return Err(AppError::scenario(ScenarioError::ResultsCollision {
                        path: results_dir,
                    }));
                }
                fs::create_dir_all(&results_dir).map_err(|source| {
                    AppError::config(ConfigError::CreateDir {
                        path: results_dir,
                        source,
                    })
                })?;
                self.name = Some(value.to_owned());
                Ok(())
            }
            "file" => {
                let file = PathBuf::from(value);
                if !file.is_file() {
                    return Err(AppError::config(ConfigError::ScenarioFileMissing {
                        path: file,
                    }));
                }
                self.files.push(file);
                Ok(())
            }
            "parallel" => {
                self.parallel = value != "no";
                Ok(())
            }
            "timelimit" | "timeout" => {
                let seconds = parse_positive_u64(value).map_err(|source| {
                    AppError::config(ConfigError::InvalidValue {
                        key: key.to_owned(),
                        source,
                    })
                })?;
                self.time_limit = Duration::from_secs(seconds);
                Ok(())
            }
            _ => Err(AppError::config(ConfigError::UnknownParameter {
                section: "scenario".to_owned(),
                key: key.to_owned(),
            })),
        }
    }

    fn finish(self) -> AppResult<ScenarioEntry> {
        let Some(name) = self.name else {
            return Err(AppError::config(ConfigError::MissingParameter {
                section: "scenario".to_owned(),
                key: "name",
            }));
        };
        if self.files.is_empty() {
            return Err(AppError::config(ConfigError::MissingParameter {
                section: "scenario".to_owned(),
                key: "file",
            }));
        }
        Ok(ScenarioEntry {
            name,
            files: self.files,
            parallel: self.parallel,
            time_limit: self.time_limit,
        })
    }
}

/// Parse one campaign file, claiming scenario results directories
/// under `scenarios_dir` as names are accepted.
fn parse_campaign_file(path: &Path, scenarios_dir: &Path) -> AppResult<Vec<ScenarioEntry>> {
    let content = fs::read_to_string(path).map_err(|source| {
        AppError::config(ConfigError::ReadFile {
            path: path.to_path_buf(),
            source,
        })
    })?;
    let mut entries = Vec::new();
    let mut open: Option<OpenEntry> = None;
    for raw in content.lines() {
        match classify_line(raw).map_err(AppError::config)? {
            ConfigLine::Skip => {}
            ConfigLine::Section { kind, subtype } => {
                if kind != "scenario" || !subtype.is_empty() {
                    let found = if subtype.is_empty() {
                        kind
                    } else {
                        format!("{kind}:{subtype}")
                    };
                    return Err(AppError::config(ConfigError::UnknownSection { kind: found }));
                }
                if let Some(entry) = open.take() {
                    entries.push(entry.finish()?);
                }
                open = Some(OpenEntry::start());
            }
            ConfigLine::Assignment { key, value } => {
                let Some(entry) = open.as_mut() else {
                    return Err(AppError::config(ConfigError::KeyOutsideSection { key }));
                };
                entry.apply(&key, &value, scenarios_dir)?;
            }
        }
    }
    if let Some(entry) = open.take() {
        entries.push(entry.finish()?);
    }
    if entries.is_empty() {
        return Err(AppError::config(ConfigError::NoScenarios {
            path: path.to_path_buf(),
        }));
    }
    Ok(entries)
}

fn campaign_stem(path: &Path) -> String {
    path.file_stem()
        .and_then(|stem| stem.to_str())
        .map_or_else(|| "campaign".to_owned(), str::to_owned)
}

/// Run every scenario declared in one campaign file.
///
/// The campaign is named after the file plus a timestamp and gets a
/// fresh results directory under `results_root`. Scenario failures,
/// including scenarios that do not read, are reported and counted
/// rather than aborting the campaign.
///
/// # Errors
///
/// Fails when the campaign file is missing or malformed, the results
/// directory cannot be created, or any scenario failed.
pub async fn run_campaign_file(
    path: &Path,
    results_root: &Path,
    mode: RunMode,
    shutdown: &ShutdownSender,
) -> AppResult<()> {
    if !path.is_file() {
        return Err(AppError::config(ConfigError::ScenarioFileMissing {
            path: path.to_path_buf(),
        }));
    }
    let campaign_name = format!("{}-{}", campaign_stem(path), runtime::campaign_id());
    let ctx = Arc::new(RunContext::new(
        &campaign_name,
        results_root,
        shutdown.clone(),
    )?);
    tracing::info!(
        "Campaign '{}' stores results in {}",
        ctx.campaign_name(),
        ctx.results_dir().display()
    );
    let mut receiver = ctx.subscribe_shutdown();
    let latch = Arc::clone(&ctx);
    let watcher = tokio::spawn(async move {
        if receiver.recv().await.is_ok() {
            latch.interrupt();
        }
    });
    let outcome = drive_campaign(path, &ctx, mode).await;
    watcher.abort();
    if outcome.is_ok() {
        tracing::info!("Campaign '{}' finished", ctx.campaign_name());
    }
    outcome
}

async fn drive_campaign(path: &Path, ctx: &Arc<RunContext>, mode: RunMode) -> AppResult<()> {
    let entries = parse_campaign_file(path, &ctx.scenarios_dir())?;
    let registry = ModuleRegistry::with_builtins();
    let total = entries.len();
    let mut summary = CampaignSummary::new(ctx.campaign_name(), mode);
    let mut scenarios = Vec::with_capacity(total);
    tracing::info!("Reading {} scenario(s)", total);
    for entry in entries {
        let results_dir = ctx.scenarios_dir().join(&entry.name);
        match reader::read_scenario(
            &entry.name,
            &entry.files,
            entry.parallel,
            entry.time_limit,
            results_dir,
            &registry,
        ) {
            Ok(scenario) => scenarios.push(scenario),
            Err(error) => {
                ctx.report_error(&entry.name, &error);
                summary.record(ScenarioOutcome::failed(entry.name, 0, error.to_string()));
            }
        }
    }
    match mode {
        RunMode::Check => tracing::info!("Checking scenarios"),
        RunMode::Real => tracing::info!("Running scenarios"),
    }
    for scenario in &scenarios {
        let executions = scenario.executions().len();
        if ctx.is_interrupted() {
            let error = AppError::scenario(ScenarioError::Interrupted {
                scenario: scenario.name().to_owned(),
            });
            ctx.report_error(scenario.name(), &error);
            summary.record(ScenarioOutcome::failed(
                scenario.name().to_owned(),
                executions,
                error.to_string(),
            ));
            continue;
        }
        let outcome = match mode {
            RunMode::Check => scenario.test(ctx).await,
            RunMode::Real => scenario.run(ctx).await,
        };
        match outcome {
            Ok(()) => {
                summary.record(ScenarioOutcome::passed(scenario.name().to_owned(), executions));
            }
            Err(error) => {
                ctx.report_error(scenario.name(), &error);
                summary.record(ScenarioOutcome::failed(
                    scenario.name().to_owned(),
                    executions,
                    error.to_string(),
                ));
            }
        }
    }
    if let Err(error) = write_summary(ctx.results_dir(), &summary).await {
        ctx.report_warning(
            ctx.campaign_name(),
            &format!("Could not write the campaign summary: {error}"),
        );
    }
    if summary.failed_count() > 0 {
        return Err(AppError::scenario(ScenarioError::ScenariosFailed {
            failed: summary.failed_count(),
            total,
        }));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::future::Future;

    use crate::shutdown::shutdown_channel;

    fn run_async_test<F>(future: F) -> AppResult<()>
    where
        F: Future<Output = AppResult<()>>,
    {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|err| AppError::validation(format!("Failed to build runtime: {}", err)))?;
        runtime.block_on(future)
    }

    #[test]
    fn campaign_sections_parse_with_defaults() -> AppResult<()> {
        let dir = tempfile::tempdir()?;
        let scenario_file = dir.path().join("swarm.conf");
        fs::write(&scenario_file, "[host:test__]\nname=node1\n")?;
        let campaign = dir.path().join("demo.conf");
        fs::write(
            &campaign,
            format!(
                "# demo campaign\n\
                 [scenario]\nname=first\nfile={0}\n\
                 [scenario]\nname=second\nfile={0}\nparallel=no\ntimelimit=60\n\
                 [scenario]\nname=third\nfile={0}\ntimeout=45\n",
                scenario_file.display()
            ),
        )?;
        let scenarios_dir = dir.path().join("scenarios");
        let entries = parse_campaign_file(&campaign, &scenarios_dir)?;
        if entries.len() != 3 {
            return Err(AppError::config(format!(
                "Expected three entries, found {}",
                entries.len()
            )));
        }
        let first = entries
            .first()
            .ok_or_else(|| AppError::config("First entry missing"))?;
        if first.name != "first" || !first.parallel || first.time_limit != DEFAULT_TIME_LIMIT {
            return Err(AppError::config("First entry lost its defaults"));
        }
        if first.files.len() != 1 {
            return Err(AppError::config("First entry lost its file"));
        }
        let second = entries
            .get(1)
            .ok_or_else(|| AppError::config("Second entry missing"))?;
        if second.parallel || second.time_limit != Duration::from_secs(60) {
            return Err(AppError::config("Second entry ignored its settings"));
        }
        let third = entries
            .get(2)
            .ok_or_else(|| AppError::config("Third entry missing"))?;
        if third.time_limit != Duration::from_secs(45) {
            return Err(AppError::config("The timeout alias was ignored"));
        }
        if !scenarios_dir.join("first").is_dir() || !scenarios_dir.join("third").is_dir() {
            return Err(AppError::config("Results directories were not claimed"));
        }
        Ok(())
    }

    #[test]
    fn non_scenario_sections_are_rejected() -> AppResult<()> {
        let dir = tempfile::tempdir()?;
        let campaign = dir.path().join("demo.conf");
        fs::write(&campaign, "[host:test__]\nname=node1\n")?;
        let outcome = parse_campaign_file(&campaign, &dir.path().join("scenarios"));
        match outcome {
            Err(AppError::Config(ConfigError::UnknownSection { kind })) => {
                if kind == "host:test__" {
                    Ok(())
                } else {
                    Err(AppError::config(format!("Wrong section reported: {kind}")))
                }
            }
            Err(other) => Err(AppError::config(format!("Wrong error: {other}"))),
            Ok(_) => Err(AppError::config("A host section was accepted")),
        }
    }

    #[test]
    fn settings_before_any_section_are_rejected() -> AppResult<()> {
        let dir = tempfile::tempdir()?;
        let campaign = dir.path().join("demo.conf");
        fs::write(&campaign, "name=first\n")?;
        let outcome = parse_campaign_file(&campaign, &dir.path().join("scenarios"));
        match outcome {
            Err(AppError::Config(ConfigError::KeyOutsideSection { .. })) => Ok(()),
            Err(other) => Err(AppError::config(format!("Wrong error: {other}"))),
            Ok(_) => Err(AppError::config("A stray setting was accepted")),
        }
    }

    #[test]
    fn a_scenario_needs_a_name_and_a_file() -> AppResult<()> {
        let dir = tempfile::tempdir()?;
        let scenario_file = dir.path().join("swarm.conf");
        fs::write(&scenario_file, "[host:test__]\nname=node1\n")?;
        let nameless = dir.path().join("nameless.conf");
        fs::write(
            &nameless,
            format!("[scenario]\nfile={}\n", scenario_file.display()),
        )?;
        match parse_campaign_file(&nameless, &dir.path().join("scenarios")) {
            Err(AppError::Config(ConfigError::MissingParameter { key: "name", .. })) => {}
            Err(other) => return Err(AppError::config(format!("Wrong error: {other}"))),
            Ok(_) => return Err(AppError::config("A nameless scenario was accepted")),
        }
        let fileless = dir.path().join("fileless.conf");
        fs::write(&fileless, "[scenario]\nname=first\n")?;
        match parse_campaign_file(&fileless, &dir.path().join("scenarios")) {
            Err(AppError::Config(ConfigError::MissingParameter { key: "file", .. })) => Ok(()),
            Err(other) => Err(AppError::config(format!("Wrong error: {other}"))),
            Ok(_) => Err(AppError::config("A fileless scenario was accepted")),
        }
    }

    #[test]
    fn a_second_name_in_one_section_is_rejected() -> AppResult<()> {
        let dir = tempfile::tempdir()?;
        let campaign = dir.path().join("demo.conf");
        fs::write(&campaign, "[scenario]\nname=first\nname=other\n")?;
        let outcome = parse_campaign_file(&campaign, &dir.path().join("scenarios"));
        match outcome {
            Err(AppError::Config(ConfigError::DuplicateParameter { .. })) => Ok(()),
            Err(other) => Err(AppError::config(format!("Wrong error: {other}"))),
            Ok(_) => Err(AppError::config("A renamed scenario was accepted")),
        }
    }

    #[test]
    fn colliding_scenario_names_are_rejected() -> AppResult<()> {
        let dir = tempfile::tempdir()?;
        let scenario_file = dir.path().join("swarm.conf");
        fs::write(&scenario_file, "[host:test__]\nname=node1\n")?;
        let campaign = dir.path().join("demo.conf");
        fs::write(
            &campaign,
            format!(
                "[scenario]\nname=twin\nfile={0}\n[scenario]\nname=twin\nfile={0}\n",
                scenario_file.display()
            ),
        )?;
        let outcome = parse_campaign_file(&campaign, &dir.path().join("scenarios"));
        match outcome {
            Err(AppError::Scenario(ScenarioError::ResultsCollision { .. })) => Ok(()),
            Err(other) => Err(AppError::config(format!("Wrong error: {other}"))),
            Ok(_) => Err(AppError::config("Twin scenarios were accepted")),
        }
    }

    #[test]
    fn missing_scenario_files_are_rejected() -> AppResult<()> {
        let dir = tempfile::tempdir()?;
        let campaign = dir.path().join("demo.conf");
        let ghost = dir.path().join("ghost.conf");
        fs::write(
            &campaign,
            format!("[scenario]\nname=first\nfile={}\n", ghost.display()),
        )?;
        let outcome = parse_campaign_file(&campaign, &dir.path().join("scenarios"));
        match outcome {
            Err(AppError::Config(ConfigError::ScenarioFileMissing { .. })) => Ok(()),
            Err(other) => Err(AppError::config(format!("Wrong error: {other}"))),
            Ok(_) => Err(AppError::config("A ghost scenario file was accepted")),
        }
    }

    #[test]
    fn an_empty_campaign_is_rejected() -> AppResult<()> {
        let dir = tempfile::tempdir()?;
        let campaign = dir.path().join("demo.conf");
        fs::write(&campaign, "# nothing here\n")?;
        let outcome = parse_campaign_file(&campaign, &dir.path().join("scenarios"));
        match outcome {
            Err(AppError::Config(ConfigError::NoScenarios { .. })) => Ok(()),
            Err(other) => Err(AppError::config(format!("Wrong error: {other}"))),
            Ok(_) => Err(AppError::config("An empty campaign was accepted")),
        }
    }

    #[test]
    fn a_check_campaign_probes_and_discards_scenario_results() -> AppResult<()> {
        run_async_test(async {
            let dir = tempfile::tempdir()?;
            let transcript = dir.path().join("transcript.txt");
            let scenario_file = dir.path().join("swarm.conf");
            fs::write(
                &scenario_file,
                format!(
                    "[host:test__]\nname=node1\nbehavior=immediate\ntranscript={}\n\
                     [client:test__]\nname=seed\n\
                     [file:none]\nname=payload\n\
                     [execution]\nhost=node1\nclient=seed\nfile=payload\nseeder=yes\n",
                    transcript.display()
                ),
            )?;
            let campaign = dir.path().join("demo.conf");
            fs::write(
                &campaign,
                format!("[scenario]\nname=smoke\nfile={}\n", scenario_file.display()),
            )?;
            let results_root = dir.path().join("Results");
            fs::create_dir_all(&results_root)?;
            let (shutdown, _keep) = shutdown_channel();
            run_campaign_file(&campaign, &results_root, RunMode::Check, &shutdown).await?;
            let entry = fs::read_dir(&results_root)?
                .next()
                .ok_or_else(|| AppError::config("No campaign directory was created"))??;
            let name = entry.file_name().to_string_lossy().into_owned();
            if !name.starts_with("demo-") {
                return Err(AppError::config(format!("Unexpected campaign dir: {name}")));
            }
            if !entry.path().join("err.log").is_file() {
                return Err(AppError::config("err.log is missing"));
            }
            if !entry.path().join("scenarios").is_dir() {
                return Err(AppError::config("The scenarios directory is missing"));
            }
            // A check run verifies the scenario and discards its results.
            if entry.path().join("scenarios").join("smoke").exists() {
                return Err(AppError::config("Check-run scenario results were kept"));
            }
            let recorded = fs::read_to_string(&transcript)?;
            if !recorded.contains("mktemp -d") {
                return Err(AppError::config("The host was never probed"));
            }
            Ok(())
        })
    }

    #[test]
    fn failing_scenarios_are_counted_not_fatal() -> AppResult<()> {
        run_async_test(async {
            let dir = tempfile::tempdir()?;
            let scenario_file = dir.path().join("empty.conf");
            fs::write(&scenario_file, "[host:test__]\nname=node1\n")?;
            let campaign = dir.path().join("demo.conf");
            fs::write(
                &campaign,
                format!("[scenario]\nname=broken\nfile={}\n", scenario_file.display()),
            )?;
            let results_root = dir.path().join("Results");
            fs::create_dir_all(&results_root)?;
            let (shutdown, _keep) = shutdown_channel();
            let outcome =
                run_campaign_file(&campaign, &results_root, RunMode::Check, &shutdown).await;
            match outcome {
                Err(AppError::Scenario(ScenarioError::ScenariosFailed {
                    failed: 1,
                    total: 1,
                })) => {}
                Err(other) => return Err(AppError::config(format!("Wrong error: {other}"))),
                Ok(()) => return Err(AppError::config("A broken scenario passed")),
            }
            let entry = fs::read_dir(&results_root)?
                .next()
                .ok_or_else(|| AppError::config("No campaign directory was created"))??;
            let err_log = fs::read_to_string(entry.path().join("err.log"))?;
            if !err_log.contains("declares no executions") {
                return Err(AppError::config(format!(
                    "err.log does not explain the failure: {err_log}"
                )));
            }
            let summary = fs::read_to_string(entry.path().join("summary.json"))?;
            if !summary.contains("\"failed\": 1") || !summary.contains("declares no executions") {
                return Err(AppError::config(format!(
                    "summary.json does not record the failure: {summary}"
                )));
            }
            Ok(())
        })
    }
}
