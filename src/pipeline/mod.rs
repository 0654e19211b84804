//! The post-run log pipeline: parsers, processors and viewers.
//!
//! After a scenario's raw logs have been pulled to the local results
//! directory, three stages refine them. [`LogParser`]s turn one
//! execution's raw logs into tabular data, [`LogProcessor`]s combine
//! the parsed data of the whole scenario, and [`LogViewer`]s render
//! the processed output into something human-readable.
//!
//! The pipeline never talks to hosts. It works on a [`ScenarioView`]:
//! the few facts about a scenario and its executions the stages need.
//! A live run builds the view from the real objects; [`reparse`]
//! reconstructs it from sidecar files written by earlier processors,
//! so the pipeline can be re-run long after the hosts are gone.

pub mod cpulog;
pub mod htmlcollection;
pub mod reparse;
pub mod sidecars;
pub mod statistics;

use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{AppError, AppResult, ConfigError};

/// Scenario results subdirectory with one `exec_<n>` tree per execution.
pub const EXECUTIONS_DIR: &str = "executions";
/// Scenario results subdirectory written by processors.
pub const PROCESSED_DIR: &str = "processed";
/// Scenario results subdirectory written by viewers.
pub const VIEWS_DIR: &str = "views";

/// Per-execution results tree under the executions directory.
#[must_use]
pub fn execution_dir(base: &Path, number: usize) -> PathBuf {
    base.join(format!("exec_{number}"))
}

/// Directory holding the raw logs pulled from the host.
#[must_use]
pub fn raw_log_dir(base: &Path, number: usize) -> PathBuf {
    execution_dir(base, number).join("logs")
}

/// Directory holding the parser output for one execution.
#[must_use]
pub fn parsed_log_dir(base: &Path, number: usize) -> PathBuf {
    execution_dir(base, number).join("parsedLogs")
}

/// What the pipeline knows about one execution.
///
/// Mirrors the sidecar files written by the save-processors, so a
/// reconstructed view carries exactly the facts a live one does.
#[derive(Clone, Debug)]
pub struct ExecutionView {
    number: usize,
    host_name: String,
    seeder: bool,
    side_service: bool,
    timeout: Duration,
}

impl ExecutionView {
    #[must_use]
    pub const fn new(
        number: usize,
        host_name: String,
        seeder: bool,
        side_service: bool,
        timeout: Duration,
    ) -> Self {
        Self {
            number,
            host_name,
            seeder,
            side_service,
            timeout,
        }
    }

    #[must_use]
    pub const fn number(&self) -> usize {
        self.number
    }

    /// Name of the host the execution ran on, or `__reparse__` when the
    /// view was reconstructed without hostname sidecars.
    #[must_use]
    pub fn host_name(&self) -> &str {
        &self.host_name
    }

    #[must_use]
    pub const fn is_seeder(&self) -> bool {
        self.seeder
    }

    /// Side services are support processes; they are excluded from
    /// statistics and per-execution view tables.
    #[must_use]
    pub const fn is_side_service(&self) -> bool {
        self.side_service
    }

    #[must_use]
    pub const fn timeout(&self) -> Duration {
        self.timeout
    }
}

/// The slice of a scenario the pipeline stages see.
#[derive(Debug)]
pub struct ScenarioView {
    name: String,
    reconstructed: bool,
    executions: Vec<ExecutionView>,
}

impl ScenarioView {
    /// View over a scenario that just ran.
    #[must_use]
    pub const fn live(name: String, executions: Vec<ExecutionView>) -> Self {
        Self {
            name,
            reconstructed: false,
            executions,
        }
    }

    /// View rebuilt from sidecar files of an earlier run. Processors
    /// may overwrite their own previous output in this mode.
    #[must_use]
    pub const fn reconstructed(name: String, executions: Vec<ExecutionView>) -> Self {
        Self {
            name,
            reconstructed: true,
            executions,
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub const fn is_reconstructed(&self) -> bool {
        self.reconstructed
    }

    #[must_use]
    pub fn executions(&self) -> &[ExecutionView] {
        &self.executions
    }
}

/// Behavior of one parser subtype: raw logs in, tabular data out.
pub trait LogParser: Send + Sync {
    /// The subtype name as used in scenario files.
    fn kind(&self) -> &'static str;

    /// Parse one subtype-specific setting. Returns false when the key
    /// is not one of this parser's.
    ///
    /// # Errors
    ///
    /// Fails when the key is recognized but the value is not usable.
    fn parse_setting(&mut self, key: &str, value: &str) -> AppResult<bool>;

    /// Validate the collected settings.
    ///
    /// # Errors
    ///
    /// Fails when a required setting is missing or inconsistent.
    fn check_settings(&mut self) -> AppResult<()>;

    /// Parse the raw logs of one execution into `output_dir`. Missing
    /// input logs are not an error; existing output is.
    ///
    /// # Errors
    ///
    /// Fails when output already exists or files cannot be read or
    /// written.
    fn parse_logs(
        &self,
        execution: &ExecutionView,
        log_dir: &Path,
        output_dir: &Path,
    ) -> AppResult<()>;
}

/// Behavior of one processor subtype: scenario-wide data reduction.
pub trait LogProcessor: Send + Sync {
    /// The subtype name as used in scenario files.
    fn kind(&self) -> &'static str;

    /// Parse one subtype-specific setting. Returns false when the key
    /// is not one of this processor's.
    ///
    /// # Errors
    ///
    /// Fails when the key is recognized but the value is not usable.
    fn parse_setting(&mut self, key: &str, value: &str) -> AppResult<bool>;

    /// Validate the collected settings.
    ///
    /// # Errors
    ///
    /// Fails when a required setting is missing or inconsistent.
    fn check_settings(&mut self) -> AppResult<()>;

    /// Combine the per-execution data under `base_dir` (the executions
    /// directory) into files in `output_dir`.
    ///
    /// # Errors
    ///
    /// Fails when output would be overwritten outside a reconstructed
    /// view or files cannot be read or written.
    fn process_logs(
        &self,
        scenario: &ScenarioView,
        base_dir: &Path,
        output_dir: &Path,
    ) -> AppResult<()>;
}

/// Behavior of one viewer subtype: processed data to presentation.
pub trait LogViewer: Send + Sync {
    /// The subtype name as used in scenario files.
    fn kind(&self) -> &'static str;

    /// Parse one subtype-specific setting. Returns false when the key
    /// is not one of this viewer's.
    ///
    /// # Errors
    ///
    /// Fails when the key is recognized but the value is not usable.
    fn parse_setting(&mut self, key: &str, value: &str) -> AppResult<bool>;

    /// Validate the collected settings.
    ///
    /// # Errors
    ///
    /// Fails when a required setting is missing or inconsistent.
    fn check_settings(&mut self) -> AppResult<()>;

    /// Render the processed data into `view_dir`.
    ///
    /// # Errors
    ///
    /// Fails when files cannot be read or written.
    fn create_view(
        &self,
        scenario: &ScenarioView,
        processed_dir: &Path,
        view_dir: &Path,
    ) -> AppResult<()>;
}

/// A named parser object from a scenario file.
///
/// Executions reference parsers by name; a parser section without a
/// `name` key answers to its subtype name.
pub struct Parser {
    name: Option<String>,
    plugin: Box<dyn LogParser>,
}

impl Parser {
    #[must_use]
    pub const fn new(plugin: Box<dyn LogParser>) -> Self {
        Self { name: None, plugin }
    }

    /// Parse one `key=value` setting from a parser section.
    ///
    /// # Errors
    ///
    /// Fails on unknown keys, duplicates and unusable values.
    pub fn parse_setting(&mut self, key: &str, value: &str) -> AppResult<()> {
        if self.plugin.parse_setting(key, value)? {
            return Ok(());
        }
        match key {
            "name" => {
                if self.name.is_some() {
                    return Err(AppError::config(ConfigError::DuplicateParameter {
                        section: self.section_label(),
                        key: key.to_owned(),
                    }));
                }
                crate::config::syntax::validate_name(value).map_err(|source| {
                    AppError::config(ConfigError::InvalidValue {
                        key: key.to_owned(),
                        source,
                    })
                })?;
                self.name = Some(value.to_owned());
                Ok(())
            }
            _ => Err(AppError::config(ConfigError::UnknownParameter {
                section: self.section_label(),
                key: key.to_owned(),
            })),
        }
    }

    /// Validate the collected settings.
    ///
    /// # Errors
    ///
    /// Fails when a required setting is missing or inconsistent.
    pub fn check_settings(&mut self) -> AppResult<()> {
        self.plugin.check_settings()
    }

    fn section_label(&self) -> String {
        format!("parser:{}", self.plugin.kind())
    }

    /// The name executions use to reference this parser.
    #[must_use]
    pub fn name(&self) -> &str {
        self.name.as_deref().unwrap_or_else(|| self.plugin.kind())
    }

    #[must_use]
    pub fn kind(&self) -> &'static str {
        self.plugin.kind()
    }

    /// Parse the raw logs of one execution into `output_dir`.
    ///
    /// # Errors
    ///
    /// Fails when output already exists or files cannot be read or
    /// written.
    pub fn parse_logs(
        &self,
        execution: &ExecutionView,
        log_dir: &Path,
        output_dir: &Path,
    ) -> AppResult<()> {
        self.plugin.parse_logs(execution, log_dir, output_dir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parsers_answer_to_their_subtype_by_default() -> AppResult<()> {
        let parser = Parser::new(cpulog::factory());
        if parser.name() != "cpulog" {
            return Err(AppError::config(format!(
                "Default parser name was {}",
                parser.name()
            )));
        }
        let mut named = Parser::new(cpulog::factory());
        named.parse_setting("name", "cpu-main")?;
        named.check_settings()?;
        if named.name() != "cpu-main" {
            return Err(AppError::config("Explicit parser name was not kept"));
        }
        Ok(())
    }

    #[test]
    fn parser_sections_reject_stray_keys() -> Result<(), String> {
        let mut parser = Parser::new(cpulog::factory());
        match parser.parse_setting("logfile", "cpu.log") {
            Err(AppError::Config(ConfigError::UnknownParameter { key, .. })) => {
                if key == "logfile" {
                    Ok(())
                } else {
                    Err(format!("Wrong key reported: {}", key))
                }
            }
            Err(_) | Ok(()) => Err("Unknown parser key was accepted".to_owned()),
        }
    }

    #[test]
    fn log_directories_follow_the_execution_number() {
        let base = Path::new("/tmp/results/executions");
        assert_eq!(
            raw_log_dir(base, 3),
            Path::new("/tmp/results/executions/exec_3/logs")
        );
        assert_eq!(
            parsed_log_dir(base, 3),
            Path::new("/tmp/results/executions/exec_3/parsedLogs")
        );
    }
}
