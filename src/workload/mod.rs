//! Arrival schedules for executions.
//!
//! A workload turns "start all clients" into "start each client at its
//! own offset". Generators compute the offsets; the wrapper here owns
//! the targeting: which clients the schedule applies to, whether seeder
//! executions are included, and a base offset added to every slot. The
//! computed offset lands in the execution's `timeout` field, which the
//! scenario runtime sleeps on before starting the client.

pub mod linear;
pub mod poisson;

use std::time::Duration;

use crate::config::syntax::{parse_seconds, validate_name};
use crate::error::{AppError, AppResult, ConfigError, WorkloadError};
use crate::scenario::execution::Execution;

/// Computes start offsets for a number of slots.
///
/// Implementations parse their own spread parameters (`duration`,
/// `interval`, `rate`) and turn a slot count into that many offsets,
/// each already shifted by the caller's base offset.
pub trait WorkloadGenerator: Send + Sync {
    fn kind(&self) -> &'static str;

    /// Parse a subtype setting. `Ok(false)` means the key is not one
    /// of the generator's own and should be tried as a common key.
    ///
    /// # Errors
    ///
    /// Fails on malformed or conflicting values.
    fn parse_setting(&mut self, key: &str, value: &str) -> AppResult<bool>;

    /// # Errors
    ///
    /// Fails when the spread parameters are incomplete.
    fn check_settings(&mut self) -> AppResult<()>;

    /// Offsets for `slots` executions, low to high, each including
    /// `offset`.
    ///
    /// # Errors
    ///
    /// Fails when the generator cannot produce a schedule.
    fn schedule(&self, offset: Duration, slots: usize) -> AppResult<Vec<Duration>>;
}

/// A generator plus its targeting settings.
pub struct Workload {
    apply_list: Vec<String>,
    apply_seeders: bool,
    offset: Option<Duration>,
    plugin: Box<dyn WorkloadGenerator>,
}

impl Workload {
    #[must_use]
    pub fn new(plugin: Box<dyn WorkloadGenerator>) -> Self {
        Self {
            apply_list: Vec::new(),
            apply_seeders: false,
            offset: None,
            plugin,
        }
    }

    #[must_use]
    pub fn kind(&self) -> &'static str {
        self.plugin.kind()
    }

    fn section_label(&self) -> String {
        format!("workload:{}", self.plugin.kind())
    }

    /// Parse one `key=value` setting, subtype keys first.
    ///
    /// # Errors
    ///
    /// Fails on unknown keys and malformed values.
    pub fn parse_setting(&mut self, key: &str, value: &str) -> AppResult<()> {
        if self.plugin.parse_setting(key, value)? {
            return Ok(());
        }
        match key {
            "apply" => {
                validate_name(value).map_err(|source| {
                    AppError::config(ConfigError::InvalidValue {
                        key: key.to_owned(),
                        source,
                    })
                })?;
                self.apply_list.push(value.to_owned());
            }
            "offset" => {
                if self.offset.is_some() {
                    return Err(AppError::config(ConfigError::DuplicateParameter {
                        section: self.section_label(),
                        key: key.to_owned(),
                    }));
                }
                let offset = parse_seconds(value).map_err(|source| {
                    AppError::config(ConfigError::InvalidValue {
                        key: key.to_owned(),
                        source,
                    })
                })?;
                self.offset = Some(offset);
            }
            "applyToSeeders" => {
                if value == "yes" {
                    self.apply_seeders = true;
                }
            }
            _ => {
                return Err(AppError::config(ConfigError::UnknownParameter {
                    section: self.section_label(),
                    key: key.to_owned(),
                }));
            }
        }
        Ok(())
    }

    /// # Errors
    ///
    /// Fails when the generator's settings are incomplete.
    pub fn check_settings(&mut self) -> AppResult<()> {
        self.plugin.check_settings()
    }

    #[must_use]
    pub fn offset(&self) -> Duration {
        self.offset.unwrap_or(Duration::ZERO)
    }

    /// Write start offsets into the matching executions.
    ///
    /// Targets are the executions whose client is in the apply list
    /// (all clients when the list is empty), skipping seeders unless
    /// `applyToSeeders` was set. A nonzero timeout that is about to be
    /// overwritten is logged; a schedule that matches nothing is an
    /// error.
    ///
    /// # Errors
    ///
    /// Fails on unknown client names in the apply list and when no
    /// execution matches.
    pub fn apply(&mut self, executions: &mut [Execution], clients: &[String]) -> AppResult<()> {
        if self.apply_list.is_empty() {
            self.apply_list = clients.to_vec();
        } else {
            self.apply_list.sort_unstable();
            self.apply_list.dedup();
            for name in &self.apply_list {
                if !clients.contains(name) {
                    return Err(AppError::workload(WorkloadError::UnknownClient {
                        workload: self.plugin.kind().to_owned(),
                        client: name.clone(),
                    }));
                }
            }
        }
        let targets: Vec<usize> = executions
            .iter()
            .enumerate()
            .filter(|(_, execution)| {
                let client_matches = execution
                    .client_name()
                    .is_some_and(|name| self.apply_list.iter().any(|listed| listed == name));
                client_matches && (self.apply_seeders || !execution.is_seeder())
            })
            .map(|(index, _)| index)
            .collect();
        if targets.is_empty() {
            return Err(AppError::workload(WorkloadError::NoExecutions {
                workload: self.plugin.kind().to_owned(),
            }));
        }
        let offsets = self.plugin.schedule(self.offset(), targets.len())?;
        for (&index, offset) in targets.iter().zip(offsets) {
            if let Some(execution) = executions.get_mut(index) {
                if execution.has_timeout() {
                    tracing::warn!(
                        "Overwriting the timeout of execution {} with the {} schedule.",
                        execution.number(),
                        self.plugin.kind()
                    );
                }
                execution.set_timeout(offset);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn execution_for(number: usize, client: &str, seeder: bool) -> AppResult<Execution> {
        let mut execution = Execution::new(number);
        execution.parse_setting("host", "node1")?;
        execution.parse_setting("client", client)?;
        execution.parse_setting("file", "payload")?;
        if seeder {
            execution.parse_setting("seeder", "yes")?;
        }
        execution.check_settings()?;
        Ok(execution)
    }

    fn linear_over(duration: &str) -> AppResult<Workload> {
        let mut workload = Workload::new(linear::factory());
        workload.parse_setting("duration", duration)?;
        workload.check_settings()?;
        Ok(workload)
    }

    #[test]
    fn applies_to_every_client_by_default() -> AppResult<()> {
        let mut executions = vec![
            execution_for(0, "alpha", false)?,
            execution_for(1, "beta", false)?,
            execution_for(2, "alpha", false)?,
        ];
        let mut workload = linear_over("6")?;
        workload.apply(&mut executions, &["alpha".to_owned(), "beta".to_owned()])?;
        let offsets: Vec<Duration> = executions.iter().map(Execution::timeout).collect();
        if offsets
            != [
                Duration::ZERO,
                Duration::from_secs(3),
                Duration::from_secs(6),
            ]
        {
            return Err(AppError::workload(WorkloadError::TestExpectationValue {
                message: "Wrong offsets",
                value: format!("{offsets:?}"),
            }));
        }
        Ok(())
    }

    #[test]
    fn seeders_are_skipped_unless_requested() -> AppResult<()> {
        let mut executions = vec![
            execution_for(0, "alpha", true)?,
            execution_for(1, "alpha", false)?,
        ];
        let mut workload = linear_over("6")?;
        workload.apply(&mut executions, &["alpha".to_owned()])?;
        let seeder_timeout = executions.first().map(Execution::timeout);
        if seeder_timeout != Some(Duration::ZERO) {
            return Err(AppError::workload("Seeder was scheduled"));
        }

        let mut all = vec![
            execution_for(0, "alpha", true)?,
            execution_for(1, "alpha", false)?,
        ];
        let mut inclusive = linear_over("6")?;
        inclusive.parse_setting("applyToSeeders", "yes")?;
        inclusive.apply(&mut all, &["alpha".to_owned()])?;
        let scheduled: Vec<Duration> = all.iter().map(Execution::timeout).collect();
        if scheduled != [Duration::ZERO, Duration::from_secs(6)] {
            return Err(AppError::workload("Seeder not included on request"));
        }
        Ok(())
    }

    #[test]
    fn unknown_apply_targets_are_fatal() -> AppResult<()> {
        let mut executions = vec![execution_for(0, "alpha", false)?];
        let mut workload = linear_over("6")?;
        workload.parse_setting("apply", "ghost")?;
        match workload.apply(&mut executions, &["alpha".to_owned()]) {
            Err(AppError::Workload(WorkloadError::UnknownClient { client, .. }))
                if client == "ghost" =>
            {
                Ok(())
            }
            Err(_) | Ok(()) => Err(AppError::workload("Unknown apply target accepted")),
        }
    }

    #[test]
    fn matching_nothing_is_fatal() -> AppResult<()> {
        let mut executions = vec![execution_for(0, "alpha", true)?];
        let mut workload = linear_over("6")?;
        match workload.apply(&mut executions, &["alpha".to_owned()]) {
            Err(AppError::Workload(WorkloadError::NoExecutions { .. })) => Ok(()),
            Err(_) | Ok(()) => Err(AppError::workload("Seeder-only population accepted")),
        }
    }

    #[test]
    fn base_offset_shifts_the_whole_schedule() -> AppResult<()> {
        let mut executions = vec![
            execution_for(0, "alpha", false)?,
            execution_for(1, "alpha", false)?,
        ];
        let mut workload = linear_over("4")?;
        workload.parse_setting("offset", "1.5")?;
        workload.apply(&mut executions, &["alpha".to_owned()])?;
        let offsets: Vec<Duration> = executions.iter().map(Execution::timeout).collect();
        if offsets != [Duration::from_millis(1_500), Duration::from_millis(5_500)] {
            return Err(AppError::workload(WorkloadError::TestExpectationValue {
                message: "Offset not applied",
                value: format!("{offsets:?}"),
            }));
        }
        Ok(())
    }

    #[test]
    fn existing_timeouts_are_overwritten() -> AppResult<()> {
        let mut execution = execution_for(0, "alpha", false)?;
        execution.set_timeout(Duration::from_secs(42));
        let mut executions = vec![execution];
        let mut workload = linear_over("6")?;
        workload.apply(&mut executions, &["alpha".to_owned()])?;
        let timeout = executions.first().map(Execution::timeout);
        if timeout != Some(Duration::ZERO) {
            return Err(AppError::workload("Manual timeout survived the schedule"));
        }
        Ok(())
    }
}
