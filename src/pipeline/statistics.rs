//! Scenario-wide completion, cpu and memory statistics.
//!
//! Reduces the parsed `log.data` (download progress) and `peak.data`
//! (cumulative cpu time, peak resident and virtual memory) of every
//! execution into one line per role: `stats.leecher` and
//! `stats.seeder`. Executions whose parsed logs are missing simply
//! contribute nothing, which skews the averages.
//!
//! `stats.leecher` fields: leecher count, max and average peak
//! resident memory, average cpu time, completed count, average
//! download time, average completion percentage, max and average peak
//! virtual memory. `stats.seeder` drops the completion fields.

use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::config::syntax::parse_seconds;
use crate::error::{AppError, AppResult, PipelineError};

use super::{LogProcessor, ScenarioView};

/// Completion at or above this many milli-percent counts as done.
const COMPLETE_MILLI_PERCENT: u64 = 100_000;

pub struct Statistics;

#[must_use]
pub fn factory() -> Box<dyn LogProcessor> {
    Box::new(Statistics)
}

#[derive(Default)]
struct RoleStats {
    count: u64,
    total_cpu_millis: u64,
    total_mem: u64,
    max_mem: u64,
    total_virt: u64,
    max_virt: u64,
}

impl RoleStats {
    /// First data row of `peak.data`: cpu time, peak resident memory,
    /// peak virtual memory.
    fn absorb_peak(&mut self, path: &Path) -> AppResult<()> {
        if !path.exists() {
            return Ok(());
        }
        let content = fs::read_to_string(path).map_err(|source| {
            AppError::pipeline(PipelineError::ReadLog {
                path: path.to_path_buf(),
                source,
            })
        })?;
        for line in content.lines() {
            if line.starts_with("cputime") {
                continue;
            }
            let mut fields = line.splitn(3, ' ');
            let (Some(cpu_text), Some(mem_text), Some(rest)) =
                (fields.next(), fields.next(), fields.next())
            else {
                continue;
            };
            let Ok(cpu) = parse_seconds(cpu_text) else {
                continue;
            };
            let virt_text = rest.split(' ').next().unwrap_or("");
            let (Ok(mem), Ok(virt)) = (mem_text.parse::<u64>(), virt_text.parse::<u64>()) else {
                continue;
            };
            self.total_cpu_millis = self.total_cpu_millis.saturating_add(to_millis(cpu));
            self.total_mem = self.total_mem.saturating_add(mem);
            self.max_mem = self.max_mem.max(mem);
            self.total_virt = self.total_virt.saturating_add(virt);
            self.max_virt = self.max_virt.max(virt);
            break;
        }
        Ok(())
    }

    fn average_mem(&self) -> u64 {
        self.total_mem.checked_div(self.count).unwrap_or(0)
    }

    fn average_virt(&self) -> u64 {
        self.total_virt.checked_div(self.count).unwrap_or(0)
    }

    fn average_cpu_millis(&self) -> u64 {
        self.total_cpu_millis.checked_div(self.count).unwrap_or(0)
    }
}

#[derive(Default)]
struct DownloadStats {
    total_completion_milli: u64,
    completed: u64,
    total_download_millis: u64,
}

impl DownloadStats {
    /// Walk `log.data` rows of one leecher. Completion tracks the
    /// last row seen; the first row at 100% fixes the download time.
    fn absorb_progress(&mut self, path: &Path) -> AppResult<()> {
        if !path.exists() {
            return Ok(());
        }
        let content = fs::read_to_string(path).map_err(|source| {
            AppError::pipeline(PipelineError::ReadLog {
                path: path.to_path_buf(),
                source,
            })
        })?;
        let mut completion_milli: u64 = 0;
        let mut download_millis: Option<u64> = None;
        for line in content.lines() {
            if line.starts_with("time") {
                continue;
            }
            let mut fields = line.splitn(3, ' ');
            let (Some(time_text), Some(completion_text), Some(_rest)) =
                (fields.next(), fields.next(), fields.next())
            else {
                continue;
            };
            let Ok(completion) = parse_seconds(completion_text) else {
                continue;
            };
            completion_milli = to_millis(completion);
            if completion_milli >= COMPLETE_MILLI_PERCENT {
                completion_milli = COMPLETE_MILLI_PERCENT;
                if let Ok(time) = parse_seconds(time_text) {
                    download_millis = Some(to_millis(time));
                }
                break;
            }
        }
        self.total_completion_milli = self.total_completion_milli.saturating_add(completion_milli);
        if let Some(millis) = download_millis {
            self.completed = self.completed.saturating_add(1);
            self.total_download_millis = self.total_download_millis.saturating_add(millis);
        }
        Ok(())
    }

    fn average_download_millis(&self) -> u64 {
        self.total_download_millis
            .checked_div(self.completed)
            .unwrap_or(0)
    }

    fn average_completion_milli(&self, leecher_count: u64) -> u64 {
        self.total_completion_milli
            .checked_div(leecher_count)
            .unwrap_or(0)
    }
}

fn to_millis(value: Duration) -> u64 {
    u64::try_from(value.as_millis()).unwrap_or(u64::MAX)
}

/// Milli-units rendered as a decimal, e.g. `2.500`.
fn decimal(units: u64) -> String {
    format!("{}.{:03}", units / 1_000, units % 1_000)
}

impl LogProcessor for Statistics {
    fn kind(&self) -> &'static str {
        "statistics"
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
        base_dir: &Path,
        output_dir: &Path,
    ) -> AppResult<()> {
        let leecher_path = output_dir.join("stats.leecher");
        let seeder_path = output_dir.join("stats.seeder");
        if !scenario.is_reconstructed() {
            for path in [&leecher_path, &seeder_path] {
                if path.exists() {
                    return Err(AppError::pipeline(PipelineError::OutputExists {
                        path: path.clone(),
                    }));
                }
            }
        }
        let mut leechers = RoleStats::default();
        let mut seeders = RoleStats::default();
        let mut downloads = DownloadStats::default();
        for execution in scenario.executions() {
            if execution.is_side_service() {
                continue;
            }
            let parsed = super::parsed_log_dir(base_dir, execution.number());
            let role = if execution.is_seeder() {
                &mut seeders
            } else {
                downloads.absorb_progress(&parsed.join("log.data"))?;
                &mut leechers
            };
            role.absorb_peak(&parsed.join("peak.data"))?;
            role.count = role.count.saturating_add(1);
        }
        let leecher_line = format!(
            "{} {} {} {} {} {} {} {} {}\n",
            leechers.count,
            leechers.max_mem,
            leechers.average_mem(),
            decimal(leechers.average_cpu_millis()),
            downloads.completed,
            decimal(downloads.average_download_millis()),
            decimal(downloads.average_completion_milli(leechers.count)),
            leechers.max_virt,
            leechers.average_virt(),
        );
        fs::write(&leecher_path, leecher_line).map_err(|source| {
            AppError::pipeline(PipelineError::WriteData {
                path: leecher_path,
                source,
            })
        })?;
        let seeder_line = format!(
            "{} {} {} {} {} {}\n",
            seeders.count,
            seeders.max_mem,
            seeders.average_mem(),
            decimal(seeders.average_cpu_millis()),
            seeders.max_virt,
            seeders.average_virt(),
        );
        fs::write(&seeder_path, seeder_line).map_err(|source| {
            AppError::pipeline(PipelineError::WriteData {
                path: seeder_path,
                source,
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AppResult;
    use crate::pipeline::{ExecutionView, parsed_log_dir};

    fn member(number: usize, seeder: bool, side_service: bool) -> ExecutionView {
        ExecutionView::new(
            number,
            "node".to_owned(),
            seeder,
            side_service,
            Duration::ZERO,
        )
    }

    fn seed_parsed(base: &Path, number: usize, name: &str, content: &str) -> AppResult<()> {
        let dir = parsed_log_dir(base, number);
        fs::create_dir_all(&dir)?;
        fs::write(dir.join(name), content)?;
        Ok(())
    }

    #[test]
    fn roles_are_reduced_separately() -> AppResult<()> {
        let root = tempfile::tempdir()?;
        let base = root.path().join("executions");
        let output = root.path().join("processed");
        fs::create_dir_all(&output)?;
        seed_parsed(
            &base,
            0,
            "log.data",
            "time completion size\n0.0 0.0 10\n5.0 50.0 15\n10.0 100.0 20\n",
        )?;
        seed_parsed(&base, 0, "peak.data", "cputime mem vmem\n2.500 3000 9000\n")?;
        seed_parsed(&base, 1, "log.data", "time completion size\n8.0 50.0 20\n")?;
        seed_parsed(&base, 1, "peak.data", "cputime mem vmem\n1.500 1000 5000\n")?;
        seed_parsed(&base, 2, "peak.data", "cputime mem vmem\n4.000 6000 12000\n")?;
        seed_parsed(
            &base,
            3,
            "peak.data",
            "cputime mem vmem\n99.000 99999 99999\n",
        )?;
        let scenario = ScenarioView::live(
            "stats-test".to_owned(),
            vec![
                member(0, false, false),
                member(1, false, false),
                member(2, true, false),
                member(3, false, true),
            ],
        );
        Statistics.process_logs(&scenario, &base, &output)?;
        let leecher = fs::read_to_string(output.join("stats.leecher"))?;
        if leecher != "2 3000 2000 2.000 1 10.000 75.000 9000 7000\n" {
            return Err(AppError::pipeline(format!(
                "Unexpected stats.leecher: {}",
                leecher
            )));
        }
        let seeder = fs::read_to_string(output.join("stats.seeder"))?;
        if seeder != "1 6000 6000 4.000 12000 12000\n" {
            return Err(AppError::pipeline(format!(
                "Unexpected stats.seeder: {}",
                seeder
            )));
        }
        Ok(())
    }

    #[test]
    fn executions_without_parsed_logs_still_count() -> AppResult<()> {
        let root = tempfile::tempdir()?;
        let base = root.path().join("executions");
        let output = root.path().join("processed");
        fs::create_dir_all(&output)?;
        let scenario =
            ScenarioView::live("stats-empty".to_owned(), vec![member(0, false, false)]);
        Statistics.process_logs(&scenario, &base, &output)?;
        let leecher = fs::read_to_string(output.join("stats.leecher"))?;
        if leecher != "1 0 0 0.000 0 0.000 0.000 0 0\n" {
            return Err(AppError::pipeline(format!(
                "Unexpected stats.leecher: {}",
                leecher
            )));
        }
        Ok(())
    }

    #[test]
    fn only_reconstructed_views_may_overwrite() -> AppResult<()> {
        let root = tempfile::tempdir()?;
        let base = root.path().join("executions");
        let output = root.path().join("processed");
        fs::create_dir_all(&output)?;
        fs::write(output.join("stats.leecher"), "stale\n")?;
        let live = ScenarioView::live("stats-guard".to_owned(), Vec::new());
        match Statistics.process_logs(&live, &base, &output) {
            Err(AppError::Pipeline(PipelineError::OutputExists { path })) => {
                if !path.ends_with("stats.leecher") {
                    return Err(AppError::pipeline("Wrong path refused"));
                }
            }
            Err(_) | Ok(()) => {
                return Err(AppError::pipeline("Stale stats were overwritten live"));
            }
        }
        let again = ScenarioView::reconstructed("stats-guard".to_owned(), Vec::new());
        Statistics.process_logs(&again, &base, &output)?;
        let leecher = fs::read_to_string(output.join("stats.leecher"))?;
        if leecher != "0 0 0 0.000 0 0.000 0.000 0 0\n" {
            return Err(AppError::pipeline(format!(
                "Reconstruction left stale stats: {}",
                leecher
            )));
        }
        Ok(())
    }
}
