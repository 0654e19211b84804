//! Machine-readable campaign summaries.
//!
//! Next to `err.log`, every campaign writes a `summary.json` recording
//! how each scenario fared and what stopped the ones that failed.
//! Follow-up tooling reads that file instead of scraping the console
//! output.

use std::path::{Path, PathBuf};

use serde::Serialize;
use tokio::io::{AsyncWriteExt, BufWriter};

use crate::campaign::RunMode;
use crate::error::{AppError, AppResult, ConfigError};

/// Summary file name inside the campaign results directory.
pub const SUMMARY_FILE_NAME: &str = "summary.json";

/// How one scenario of the campaign ended.
#[derive(Serialize)]
pub struct ScenarioOutcome {
    name: String,
    executions: usize,
    ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl ScenarioOutcome {
    #[must_use]
    pub const fn passed(name: String, executions: usize) -> Self {
        Self {
            name,
            executions,
            ok: true,
            error: None,
        }
    }

    #[must_use]
    pub const fn failed(name: String, executions: usize, error: String) -> Self {
        Self {
            name,
            executions,
            ok: false,
            error: Some(error),
        }
    }

    #[must_use]
    pub const fn is_ok(&self) -> bool {
        self.ok
    }
}

/// The whole campaign, one outcome per declared scenario.
#[derive(Serialize)]
pub struct CampaignSummary {
    campaign: String,
    mode: &'static str,
    scenarios: Vec<ScenarioOutcome>,
    total: usize,
    failed: usize,
}

impl CampaignSummary {
    #[must_use]
    pub fn new(campaign: &str, mode: RunMode) -> Self {
        let mode = match mode {
            RunMode::Check => "check",
            RunMode::Real => "run",
        };
        Self {
            campaign: campaign.to_owned(),
            mode,
            scenarios: Vec::new(),
            total: 0,
            failed: 0,
        }
    }

    pub fn record(&mut self, outcome: ScenarioOutcome) {
        self.total = self.total.saturating_add(1);
        if !outcome.is_ok() {
            self.failed = self.failed.saturating_add(1);
        }
        self.scenarios.push(outcome);
    }

    #[must_use]
    pub const fn failed_count(&self) -> usize {
        self.failed
    }

    #[must_use]
    pub const fn total_count(&self) -> usize {
        self.total
    }
}

/// Write the summary as pretty-printed JSON into `results_dir`.
///
/// # Errors
///
/// Fails when the summary cannot be serialized or the file cannot be
/// written.
pub async fn write_summary(results_dir: &Path, summary: &CampaignSummary) -> AppResult<PathBuf> {
    let path = results_dir.join(SUMMARY_FILE_NAME);
    let json = serde_json::to_vec_pretty(summary)?;
    let file = tokio::fs::File::create(&path).await.map_err(|source| {
        AppError::config(ConfigError::WriteFile {
            path: path.clone(),
            source,
        })
    })?;
    let mut writer = BufWriter::new(file);
    writer.write_all(&json).await.map_err(|source| {
        AppError::config(ConfigError::WriteFile {
            path: path.clone(),
            source,
        })
    })?;
    writer.write_all(b"\n").await.map_err(|source| {
        AppError::config(ConfigError::WriteFile {
            path: path.clone(),
            source,
        })
    })?;
    writer.flush().await.map_err(|source| {
        AppError::config(ConfigError::WriteFile {
            path: path.clone(),
            source,
        })
    })?;
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tally() -> CampaignSummary {
        let mut summary = CampaignSummary::new("demo-2026.08.29-12.00.00", RunMode::Real);
        summary.record(ScenarioOutcome::passed("short".to_owned(), 2));
        summary.record(ScenarioOutcome::failed(
            "broken".to_owned(),
            0,
            "Scenario 'broken' declares no executions.".to_owned(),
        ));
        summary
    }

    #[test]
    fn outcomes_are_tallied() {
        let summary = tally();
        assert_eq!(summary.total_count(), 2);
        assert_eq!(summary.failed_count(), 1);
    }

    fn field<'json>(
        value: &'json serde_json::Value,
        key: &str,
    ) -> AppResult<&'json serde_json::Value> {
        value
            .get(key)
            .ok_or_else(|| AppError::config(format!("Field '{key}' is missing")))
    }

    #[test]
    fn summary_round_trips_through_json() -> AppResult<()> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        runtime.block_on(async {
            let dir = tempfile::tempdir()?;
            let path = write_summary(dir.path(), &tally()).await?;
            let raw = tokio::fs::read(&path).await?;
            let value: serde_json::Value = serde_json::from_slice(&raw)?;
            if field(&value, "campaign")? != "demo-2026.08.29-12.00.00"
                || field(&value, "mode")? != "run"
            {
                return Err(AppError::config(format!("Wrong header: {value}")));
            }
            if field(&value, "total")? != 2 || field(&value, "failed")? != 1 {
                return Err(AppError::config(format!("Wrong tally: {value}")));
            }
            let scenarios = field(&value, "scenarios")?
                .as_array()
                .ok_or_else(|| AppError::config("Scenarios are not a list"))?;
            let passing = scenarios
                .first()
                .ok_or_else(|| AppError::config("Passing scenario is missing"))?;
            if field(passing, "ok")? != true || passing.get("error").is_some() {
                return Err(AppError::config(format!(
                    "Passing scenario has an error field: {value}"
                )));
            }
            let failing = scenarios
                .get(1)
                .ok_or_else(|| AppError::config("Failing scenario is missing"))?;
            if field(failing, "ok")? != false
                || field(failing, "error")? != "Scenario 'broken' declares no executions."
            {
                return Err(AppError::config(format!(
                    "Failing scenario lost its error: {value}"
                )));
            }
            Ok(())
        })
    }
}
