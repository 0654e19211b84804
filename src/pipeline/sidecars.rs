//! Processors that save per-execution facts as sidecar files.
//!
//! `hostname_<n>`, `timeout_<n>` and `isSeeder_<n>` carry the facts
//! [`reparse`](super::reparse) needs to rebuild execution views after
//! the scenario objects are gone. The files hold the bare value with
//! no trailing newline and are overwritten freely: re-running the
//! pipeline refreshes them.

use std::fs;
use std::path::Path;

use crate::config::syntax::format_seconds;
use crate::error::{AppError, AppResult, PipelineError};

use super::{LogProcessor, ScenarioView};

pub struct SaveHostname;
pub struct SaveTimeout;
pub struct SaveSeederFlag;

#[must_use]
pub fn hostname_factory() -> Box<dyn LogProcessor> {
    Box::new(SaveHostname)
}

#[must_use]
pub fn timeout_factory() -> Box<dyn LogProcessor> {
    Box::new(SaveTimeout)
}

#[must_use]
pub fn seeder_factory() -> Box<dyn LogProcessor> {
    Box::new(SaveSeederFlag)
}

fn write_sidecar(output_dir: &Path, name: String, content: &str) -> AppResult<()> {
    let path = output_dir.join(name);
    fs::write(&path, content)
        .map_err(|source| AppError::pipeline(PipelineError::WriteData { path, source }))
}

impl LogProcessor for SaveHostname {
    fn kind(&self) -> &'static str {
        "savehostname"
    }

    fn parse_setting(&mut self, _key: &str, _value: &str) -> AppResult<bool> {
        Ok(false)
    }

    fn check_settings(&mut self) -> AppResult<()> {
        Ok(())
    }

    fn process_logs(
        &self,
        scenario: &ScenarioView,
        _base_dir: &Path,
        output_dir: &Path,
    ) -> AppResult<()> {
        for execution in scenario.executions() {
            write_sidecar(
                output_dir,
                format!("hostname_{}", execution.number()),
                execution.host_name(),
            )?;
        }
        Ok(())
    }
}

impl LogProcessor for SaveTimeout {
    fn kind(&self) -> &'static str {
        "savetimeout"
    }

    fn parse_setting(&mut self, _key: &str, _value: &str) -> AppResult<bool> {
        Ok(false)
    }

    fn check_settings(&mut self) -> AppResult<()> {
        Ok(())
    }

    fn process_logs(
        &self,
        scenario: &ScenarioView,
        _base_dir: &Path,
        output_dir: &Path,
    ) -> AppResult<()> {
        for execution in scenario.executions() {
            write_sidecar(
                output_dir,
                format!("timeout_{}", execution.number()),
                &format_seconds(execution.timeout()),
            )?;
        }
        Ok(())
    }
}

impl LogProcessor for SaveSeederFlag {
    fn kind(&self) -> &'static str {
        "saveisseeder"
    }

    fn parse_setting(&mut self, _key: &str, _value: &str) -> AppResult<bool> {
        Ok(false)
    }

    fn check_settings(&mut self) -> AppResult<()> {
        Ok(())
    }

    fn process_logs(
        &self,
        scenario: &ScenarioView,
        _base_dir: &Path,
        output_dir: &Path,
    ) -> AppResult<()> {
        for execution in scenario.executions() {
            let flag = if execution.is_seeder() { "YES" } else { "NO" };
            write_sidecar(
                output_dir,
                format!("isSeeder_{}", execution.number()),
                flag,
            )?;
        }
        Ok(())
    }
}
