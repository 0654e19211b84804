//! Poisson-like arrivals.
//!
//! Sorted uniform samples, rescaled so the first lands on the offset
//! and the last on offset plus duration. Sampling and arithmetic are
//! integral, in microsample units and milliseconds.

use std::time::Duration;

use rand::Rng;

use crate::error::{AppError, AppResult, ConfigError, WorkloadError};
use crate::workload::WorkloadGenerator;
use crate::workload::linear::positive_seconds;

/// Resolution of the raw uniform samples before rescaling.
const SAMPLE_SPAN: u64 = 1_000_000;

/// `duration` or `rate`; with only a rate the window is rate times the
/// number of slots.
pub struct PoissonWorkload {
    duration: Option<Duration>,
    rate: Option<Duration>,
}

#[must_use]
pub fn factory() -> Box<dyn WorkloadGenerator> {
    Box::new(PoissonWorkload {
        duration: None,
        rate: None,
    })
}

impl PoissonWorkload {
    fn spread_conflict(&self) -> Option<AppError> {
        let key = if self.duration.is_some() {
            "duration"
        } else if self.rate.is_some() {
            "rate"
        } else {
            return None;
        };
        Some(AppError::config(ConfigError::DuplicateParameter {
            section: "workload:poisson".to_owned(),
            key: key.to_owned(),
        }))
    }

    fn window(&self, slots: usize) -> AppResult<Duration> {
        match (self.duration, self.rate) {
            (Some(duration), _) => Ok(duration),
            (None, Some(rate)) => {
                let count = u32::try_from(slots).unwrap_or(u32::MAX);
                Ok(rate.saturating_mul(count))
            }
            (None, None) => Err(AppError::workload(WorkloadError::MissingSpread {
                workload: "poisson".to_owned(),
            })),
        }
    }
}

impl WorkloadGenerator for PoissonWorkload {
    fn kind(&self) -> &'static str {
        "poisson"
    }

    fn parse_setting(&mut self, key: &str, value: &str) -> AppResult<bool> {
        match key {
            "duration" => {
                if let Some(error) = self.spread_conflict() {
                    return Err(error);
                }
                self.duration = Some(positive_seconds(key, value)?);
                Ok(true)
            }
            "rate" => {
                if let Some(error) = self.spread_conflict() {
                    return Err(error);
                }
                self.rate = Some(positive_seconds(key, value)?);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn check_settings(&mut self) -> AppResult<()> {
        if self.duration.is_none() && self.rate.is_none() {
            return Err(AppError::workload(WorkloadError::MissingSpread {
                workload: "poisson".to_owned(),
            }));
        }
        Ok(())
    }

    fn schedule(&self, offset: Duration, slots: usize) -> AppResult<Vec<Duration>> {
        let window = self.window(slots)?;
        if slots == 0 {
            return Ok(Vec::new());
        }
        let mut rng = rand::thread_rng();
        let mut samples: Vec<u64> = (0..slots).map(|_| rng.gen_range(0..=SAMPLE_SPAN)).collect();
        samples.sort_unstable();
        let first = samples.first().copied().unwrap_or(0);
        let last = samples.last().copied().unwrap_or(0);
        let span = last.saturating_sub(first);
        let window_millis = u64::try_from(window.as_millis()).unwrap_or(u64::MAX);
        let offsets = samples
            .iter()
            .map(|&sample| {
                let scaled = if span == 0 {
                    0
                } else {
                    let stretched = u128::from(sample.saturating_sub(first))
                        .saturating_mul(u128::from(window_millis))
                        .checked_div(u128::from(span))
                        .unwrap_or(0);
                    u64::try_from(stretched).unwrap_or(u64::MAX)
                };
                offset.saturating_add(Duration::from_millis(scaled))
            })
            .collect();
        Ok(offsets)
    }
}
