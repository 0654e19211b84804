//! Re-runs the parse/process/view pipeline over stored results.
//!
//! A results directory written by an earlier campaign carries enough
//! sidecar facts (`hostname_<n>`, `isSeeder_<n>`, `timeout_<n>`) to
//! rebuild an execution view per stored execution, so the pipeline
//! can run again with different modules without any live hosts.
//!
//! Building the requested modules is fatal on error; everything per
//! directory is not. A directory that turns out not to be a results
//! tree is logged and skipped so a batch over many directories still
//! finishes.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::config::registry::ModuleRegistry;
use crate::config::syntax::parse_seconds;
use crate::error::{AppError, AppResult, ConfigError, PipelineError};

use super::{
    execution_dir, parsed_log_dir, raw_log_dir, ExecutionView, LogProcessor, LogViewer, Parser,
    ScenarioView, EXECUTIONS_DIR, PROCESSED_DIR, VIEWS_DIR,
};

/// Host name for executions whose `hostname_<n>` sidecar is missing.
const REPARSE_HOST: &str = "__reparse__";

/// Which stored executions the parse stage runs over.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RoleFilter {
    Everyone,
    Seeders,
    Leechers,
}

/// One requested pipeline module with its settings.
#[derive(Clone, Debug)]
pub struct ObjectRequest {
    pub subtype: String,
    pub arguments: Vec<(String, String)>,
}

pub struct ReparseRequest {
    pub filter: RoleFilter,
    pub parsers: Vec<ObjectRequest>,
    pub processors: Vec<ObjectRequest>,
    pub viewers: Vec<ObjectRequest>,
    pub directories: Vec<PathBuf>,
}

/// Runs the requested modules over every given results directory.
///
/// # Errors
///
/// Returns an error when a requested module cannot be built: unknown
/// subtype, rejected setting or failed settings check. Per-directory
/// problems are logged and skipped instead.
pub fn run(request: &ReparseRequest, registry: &ModuleRegistry) -> AppResult<()> {
    let parsers = build_parsers(&request.parsers, registry)?;
    let processors = build_processors(&request.processors, registry)?;
    let viewers = build_viewers(&request.viewers, registry)?;
    let mut seen = BTreeSet::new();
    for directory in &request.directories {
        if !seen.insert(directory.clone()) {
            tracing::warn!(directory = %directory.display(), "Duplicate directory ignored");
            continue;
        }
        if let Err(error) = reparse_directory(
            directory,
            request.filter,
            &parsers,
            &processors,
            &viewers,
        ) {
            tracing::warn!(directory = %directory.display(), error = %error, "Skipping directory");
        }
    }
    Ok(())
}

fn build_parsers(
    requests: &[ObjectRequest],
    registry: &ModuleRegistry,
) -> AppResult<Vec<Parser>> {
    let mut parsers = Vec::with_capacity(requests.len());
    for request in requests {
        let mut parser = Parser::new(registry.parser(&request.subtype)?);
        for (key, value) in &request.arguments {
            parser.parse_setting(key, value)?;
        }
        parser.check_settings()?;
        parsers.push(parser);
    }
    Ok(parsers)
}

fn build_processors(
    requests: &[ObjectRequest],
    registry: &ModuleRegistry,
) -> AppResult<Vec<Box<dyn LogProcessor>>> {
    let mut processors: Vec<Box<dyn LogProcessor>> = Vec::with_capacity(requests.len());
    for request in requests {
        let mut processor = registry.processor(&request.subtype)?;
        for (key, value) in &request.arguments {
            if !processor.parse_setting(key, value)? {
                return Err(AppError::config(ConfigError::UnknownParameter {
                    section: format!("processor:{}", processor.kind()),
                    key: key.clone(),
                }));
            }
        }
        processor.check_settings()?;
        processors.push(processor);
    }
    Ok(processors)
}

fn build_viewers(
    requests: &[ObjectRequest],
    registry: &ModuleRegistry,
) -> AppResult<Vec<Box<dyn LogViewer>>> {
    let mut viewers: Vec<Box<dyn LogViewer>> = Vec::with_capacity(requests.len());
    for request in requests {
        let mut viewer = registry.viewer(&request.subtype)?;
        for (key, value) in &request.arguments {
            if !viewer.parse_setting(key, value)? {
                return Err(AppError::config(ConfigError::UnknownParameter {
                    section: format!("viewer:{}", viewer.kind()),
                    key: key.clone(),
                }));
            }
        }
        viewer.check_settings()?;
        viewers.push(viewer);
    }
    Ok(viewers)
}

fn not_reparseable(path: &Path, reason: &'static str) -> AppError {
    AppError::pipeline(PipelineError::NotReparseable {
        path: path.to_path_buf(),
        reason,
    })
}

fn read_error(path: PathBuf, source: std::io::Error) -> AppError {
    AppError::pipeline(PipelineError::ReadLog { path, source })
}

fn reparse_directory(
    directory: &Path,
    filter: RoleFilter,
    parsers: &[Parser],
    processors: &[Box<dyn LogProcessor>],
    viewers: &[Box<dyn LogViewer>],
) -> AppResult<()> {
    if !directory.is_dir() {
        return Err(not_reparseable(directory, "it does not exist"));
    }
    let executions_dir = directory.join(EXECUTIONS_DIR);
    let processed_dir = directory.join(PROCESSED_DIR);
    let views_dir = directory.join(VIEWS_DIR);
    if !executions_dir.is_dir() {
        return Err(not_reparseable(directory, "the executions directory is missing"));
    }
    if !processed_dir.is_dir() {
        return Err(not_reparseable(directory, "the processed directory is missing"));
    }
    if !views_dir.is_dir() {
        return Err(not_reparseable(directory, "the views directory is missing"));
    }
    tracing::info!(directory = %directory.display(), "Reparsing");

    let (selected, extra) = match filter {
        RoleFilter::Everyone => (all_execution_numbers(&executions_dir)?, Vec::new()),
        RoleFilter::Seeders => filtered_execution_numbers(&executions_dir, &processed_dir, true)?,
        RoleFilter::Leechers => {
            filtered_execution_numbers(&executions_dir, &processed_dir, false)?
        }
    };

    let mut views: Vec<ExecutionView> = Vec::new();
    let mut targets: Vec<ExecutionView> = Vec::new();
    for &number in &selected {
        let Some(view) = execution_view(&executions_dir, &processed_dir, number) else {
            continue;
        };
        if !view.is_side_service() {
            targets.push(view.clone());
        }
        views.push(view);
    }
    for &number in &extra {
        if let Some(view) = execution_view(&executions_dir, &processed_dir, number) {
            views.push(view);
        }
    }
    let name = directory.file_name().map_or_else(
        || directory.display().to_string(),
        |name| name.to_string_lossy().into_owned(),
    );
    let scenario = ScenarioView::reconstructed(name, views);

    for execution in &targets {
        let raw = raw_log_dir(&executions_dir, execution.number());
        let parsed = parsed_log_dir(&executions_dir, execution.number());
        for parser in parsers {
            if let Err(error) = parser.parse_logs(execution, &raw, &parsed) {
                tracing::warn!(
                    execution = execution.number(),
                    parser = parser.name(),
                    error = %error,
                    "Parser failed"
                );
            }
        }
    }
    for processor in processors {
        if let Err(error) = processor.process_logs(&scenario, &executions_dir, &processed_dir) {
            tracing::warn!(processor = processor.kind(), error = %error, "Processor failed");
        }
    }
    for viewer in viewers {
        if let Err(error) = viewer.create_view(&scenario, &processed_dir, &views_dir) {
            tracing::warn!(viewer = viewer.kind(), error = %error, "Viewer failed");
        }
    }
    Ok(())
}

/// Every `exec_<n>` under the executions directory, sorted. Entries
/// with any other name poison the whole directory.
fn all_execution_numbers(executions_dir: &Path) -> AppResult<Vec<usize>> {
    let mut numbers = Vec::new();
    let entries = fs::read_dir(executions_dir)
        .map_err(|source| read_error(executions_dir.to_path_buf(), source))?;
    for entry in entries {
        let entry = entry.map_err(|source| read_error(executions_dir.to_path_buf(), source))?;
        let name = entry.file_name().to_string_lossy().into_owned();
        let Some(number) = name
            .strip_prefix("exec_")
            .and_then(|rest| rest.parse::<usize>().ok())
        else {
            tracing::warn!(entry = %name, "Not an execution directory");
            return Err(not_reparseable(
                executions_dir,
                "it contains entries that are not executions",
            ));
        };
        numbers.push(number);
    }
    if numbers.is_empty() {
        return Err(not_reparseable(executions_dir, "no executions were found"));
    }
    numbers.sort_unstable();
    Ok(numbers)
}

/// Partitions stored executions by their `isSeeder_<n>` sidecars into
/// the ones matching the requested role and the rest. Sidecar
/// anomalies poison the whole directory.
fn filtered_execution_numbers(
    executions_dir: &Path,
    processed_dir: &Path,
    want_seeders: bool,
) -> AppResult<(Vec<usize>, Vec<usize>)> {
    let mut selected = Vec::new();
    let mut extra = Vec::new();
    let mut seen = BTreeSet::new();
    let entries = fs::read_dir(processed_dir)
        .map_err(|source| read_error(processed_dir.to_path_buf(), source))?;
    for entry in entries {
        let entry = entry.map_err(|source| read_error(processed_dir.to_path_buf(), source))?;
        let name = entry.file_name().to_string_lossy().into_owned();
        let Some(rest) = name.strip_prefix("isSeeder_") else {
            continue;
        };
        let Ok(number) = rest.parse::<usize>() else {
            return Err(not_reparseable(
                processed_dir,
                "a seeder sidecar has a malformed number",
            ));
        };
        if !seen.insert(number) {
            return Err(not_reparseable(processed_dir, "duplicate seeder sidecars"));
        }
        let path = entry.path();
        let content = fs::read_to_string(&path).map_err(|source| read_error(path, source))?;
        let seeder = if content == "YES" {
            true
        } else if content == "NO" {
            false
        } else {
            return Err(not_reparseable(
                processed_dir,
                "a seeder sidecar is neither YES nor NO",
            ));
        };
        let exec_dir = execution_dir(executions_dir, number);
        if !exec_dir.is_dir() {
            return Err(AppError::pipeline(PipelineError::MissingExecutionDir {
                path: exec_dir,
            }));
        }
        if seeder == want_seeders {
            selected.push(number);
        } else {
            extra.push(number);
        }
    }
    if selected.is_empty() {
        return Err(not_reparseable(
            processed_dir,
            "no executions match the requested role",
        ));
    }
    selected.sort_unstable();
    extra.sort_unstable();
    Ok((selected, extra))
}

/// Rebuilds one execution view from its directories and sidecars.
/// Missing log directories disqualify the execution, nothing more.
fn execution_view(
    executions_dir: &Path,
    processed_dir: &Path,
    number: usize,
) -> Option<ExecutionView> {
    let raw = raw_log_dir(executions_dir, number);
    let parsed = parsed_log_dir(executions_dir, number);
    if !raw.is_dir() || !parsed.is_dir() {
        tracing::warn!(execution = number, "Execution lacks its log directories");
        return None;
    }
    let side_service = fs::read_dir(&raw).map_or(true, |mut entries| entries.next().is_none());
    let timeout = fs::read_to_string(processed_dir.join(format!("timeout_{number}")))
        .ok()
        .and_then(|content| parse_seconds(content.trim()).ok())
        .unwrap_or(Duration::ZERO);
    let seeder = fs::read_to_string(processed_dir.join(format!("isSeeder_{number}")))
        .is_ok_and(|content| content == "YES");
    let host_name = fs::read_to_string(processed_dir.join(format!("hostname_{number}")))
        .unwrap_or_else(|_| REPARSE_HOST.to_owned());
    Some(ExecutionView::new(
        number,
        host_name,
        seeder,
        side_service,
        timeout,
    ))
}
