//! Evenly spread arrivals.

use std::time::Duration;

use crate::error::{AppError, AppResult, ConfigError, ValidationError, WorkloadError};
use crate::workload::WorkloadGenerator;

/// `duration`, `interval` and `rate` all describe the same spread;
/// exactly one may be given. `rate` is arrivals per second and is
/// stored as its inverse.
pub struct LinearWorkload {
    duration: Option<Duration>,
    interval: Option<Duration>,
}

#[must_use]
pub fn factory() -> Box<dyn WorkloadGenerator> {
    Box::new(LinearWorkload {
        duration: None,
        interval: None,
    })
}

impl LinearWorkload {
    fn spread_conflict(&self) -> Option<AppError> {
        let key = if self.duration.is_some() {
            "duration"
        } else if self.interval.is_some() {
            "interval"
        } else {
            return None;
        };
        Some(AppError::config(ConfigError::DuplicateParameter {
            section: "workload:linear".to_owned(),
            key: key.to_owned(),
        }))
    }
}

impl WorkloadGenerator for LinearWorkload {
    fn kind(&self) -> &'static str {
        "linear"
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
            "interval" => {
                if let Some(error) = self.spread_conflict() {
                    return Err(error);
                }
                self.interval = Some(positive_seconds(key, value)?);
                Ok(true)
            }
            "rate" => {
                if let Some(error) = self.spread_conflict() {
                    return Err(error);
                }
                self.interval = Some(invert_rate(key, value)?);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn check_settings(&mut self) -> AppResult<()> {
        if self.duration.is_none() && self.interval.is_none() {
            return Err(AppError::workload(WorkloadError::MissingSpread {
                workload: "linear".to_owned(),
            }));
        }
        Ok(())
    }

    fn schedule(&self, offset: Duration, slots: usize) -> AppResult<Vec<Duration>> {
        let interval = match (self.interval, self.duration) {
            (Some(interval), _) => interval,
            (None, Some(duration)) => {
                if slots > 1 {
                    let divisor = u32::try_from(slots.saturating_sub(1)).unwrap_or(u32::MAX);
                    duration.checked_div(divisor).unwrap_or(duration)
                } else {
                    duration
                }
            }
            (None, None) => {
                return Err(AppError::workload(WorkloadError::MissingSpread {
                    workload: "linear".to_owned(),
                }));
            }
        };
        let mut offsets = Vec::with_capacity(slots);
        let mut current = offset;
        for _ in 0..slots {
            offsets.push(current);
            current = current.saturating_add(interval);
        }
        Ok(offsets)
    }
}

/// Parse a strictly positive decimal-seconds value.
pub(super) fn positive_seconds(key: &str, value: &str) -> AppResult<Duration> {
    let parsed = crate::config::syntax::parse_seconds(value).map_err(|source| {
        AppError::config(ConfigError::InvalidValue {
            key: key.to_owned(),
            source,
        })
    })?;
    if parsed.is_zero() {
        return Err(AppError::config(ConfigError::InvalidValue {
            key: key.to_owned(),
            source: ValidationError::ValueZero,
        }));
    }
    Ok(parsed)
}

/// Turn an arrivals-per-second rate into the interval between two
/// arrivals, with millisecond precision.
fn invert_rate(key: &str, value: &str) -> AppResult<Duration> {
    let rate = positive_seconds(key, value)?;
    let rate_millis = u64::try_from(rate.as_millis()).unwrap_or(u64::MAX);
    let interval_millis = 1_000_000_u64.checked_div(rate_millis).unwrap_or(0);
    Ok(Duration::from_millis(interval_millis))
}
