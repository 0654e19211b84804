//! Parser for the `cpu.log` written by profiled clients.
//!
//! The profiling loop on a host alternates a timestamp line with a
//! `ps` sample of cpu percentage and resident memory. Timestamps
//! normally carry a fractional-seconds suffix; a `date` without `%N`
//! support leaves the literal `.%N` instead, in which case times are
//! kept at whole-second precision. Output is `cpu.data`: one
//! `relative-time cpu% mem` row per sample.

use std::fmt::Write as _;
use std::fs;
use std::path::Path;

use crate::error::{AppError, AppResult, PipelineError};

use super::{ExecutionView, LogParser};

/// Milliseconds per day, for runs that cross midnight.
const DAY_MILLIS: u64 = 24 * 3600 * 1000;

pub struct CpuLogParser;

#[must_use]
pub fn factory() -> Box<dyn LogParser> {
    Box::new(CpuLogParser)
}

struct Start {
    date: String,
    millis: u64,
    broken: bool,
}

impl LogParser for CpuLogParser {
    fn kind(&self) -> &'static str {
        "cpulog"
    }

    fn parse_setting(&mut self, _key: &str, _value: &str) -> AppResult<bool> {
        Ok(false)
    }

    fn check_settings(&mut self) -> AppResult<()> {
        Ok(())
    }

    fn parse_logs(
        &self,
        execution: &ExecutionView,
        log_dir: &Path,
        output_dir: &Path,
    ) -> AppResult<()> {
        let log_file = log_dir.join("cpu.log");
        let data_file = output_dir.join("cpu.data");
        if !log_file.is_file() {
            tracing::debug!(execution = execution.number(), "No cpu.log to parse");
            return Ok(());
        }
        if data_file.exists() {
            return Err(AppError::pipeline(PipelineError::OutputExists {
                path: data_file,
            }));
        }
        let content = fs::read_to_string(&log_file).map_err(|source| {
            AppError::pipeline(PipelineError::ReadLog {
                path: log_file,
                source,
            })
        })?;
        let mut output = String::from("time cpu% mem\n0 0 0\n");
        let mut start: Option<Start> = None;
        let mut rel_millis: u64 = 0;
        for line in content.lines() {
            match &start {
                None => {
                    // Samples before the first timestamp have no usable clock.
                    if let Some((date, millis)) = parse_full_stamp(line) {
                        start = Some(Start {
                            date: date.to_owned(),
                            millis,
                            broken: false,
                        });
                    } else if let Some((date, millis)) = parse_broken_stamp(line) {
                        start = Some(Start {
                            date: date.to_owned(),
                            millis,
                            broken: true,
                        });
                    }
                }
                Some(from) => {
                    let stamp = if from.broken {
                        parse_broken_stamp(line)
                    } else {
                        parse_full_stamp(line)
                    };
                    if let Some((date, millis)) = stamp {
                        let mut total = millis;
                        if date != from.date {
                            total = total.saturating_add(DAY_MILLIS);
                        }
                        rel_millis = total.saturating_sub(from.millis);
                    } else if let Some((cpu, mem)) = parse_sample(line) {
                        writeln!(output, "{} {} {}", rel_text(rel_millis, from.broken), cpu, mem)?;
                    }
                }
            }
        }
        fs::write(&data_file, output).map_err(|source| {
            AppError::pipeline(PipelineError::WriteData {
                path: data_file,
                source,
            })
        })
    }
}

/// `12-03-15 12:22:12.386824326`; fractional digits beyond
/// milliseconds are dropped.
fn parse_full_stamp(line: &str) -> Option<(&str, u64)> {
    let (date, clock) = line.split_once(' ')?;
    if !is_date(date) {
        return None;
    }
    let (whole, fraction) = clock.split_once('.')?;
    if fraction.is_empty() || !fraction.bytes().all(|byte| byte.is_ascii_digit()) {
        return None;
    }
    let seconds = clock_seconds(whole)?;
    Some((
        date,
        seconds
            .saturating_mul(1_000)
            .saturating_add(fraction_millis(fraction)),
    ))
}

/// `12-03-15 12:22:12.%N`, from a `date` without nanosecond support.
fn parse_broken_stamp(line: &str) -> Option<(&str, u64)> {
    let (date, clock) = line.split_once(' ')?;
    if !is_date(date) {
        return None;
    }
    let whole = clock.strip_suffix(".%N")?;
    let seconds = clock_seconds(whole)?;
    Some((date, seconds.saturating_mul(1_000)))
}

fn is_date(text: &str) -> bool {
    text.bytes().filter(|byte| *byte == b'-').count() == 2
        && text
            .bytes()
            .all(|byte| byte.is_ascii_digit() || byte == b'-')
}

fn clock_seconds(text: &str) -> Option<u64> {
    let mut parts = text.splitn(3, ':');
    let hours: u64 = parts.next()?.parse().ok()?;
    let minutes: u64 = parts.next()?.parse().ok()?;
    let seconds: u64 = parts.next()?.parse().ok()?;
    Some(
        hours
            .saturating_mul(3_600)
            .saturating_add(minutes.saturating_mul(60))
            .saturating_add(seconds),
    )
}

fn fraction_millis(fraction: &str) -> u64 {
    let mut digits: String = fraction.chars().take(3).collect();
    while digits.len() < 3 {
        digits.push('0');
    }
    digits.parse().unwrap_or(0)
}

/// A `ps` sample row: cpu percentage then resident memory, separated
/// by spaces or tabs.
fn parse_sample(line: &str) -> Option<(&str, &str)> {
    let rest = line.trim_start_matches([' ', '\t']);
    let split = rest.find([' ', '\t'])?;
    let cpu = rest.get(..split)?;
    let mem = rest.get(split..)?.trim_start_matches([' ', '\t']);
    if cpu.is_empty() || mem.is_empty() {
        return None;
    }
    if !is_decimal(cpu) || !mem.bytes().all(|byte| byte.is_ascii_digit()) {
        return None;
    }
    Some((cpu, mem))
}

fn is_decimal(text: &str) -> bool {
    let mut seen_dot = false;
    text.chars().all(|c| {
        if c == '.' {
            if seen_dot {
                return false;
            }
            seen_dot = true;
            true
        } else {
            c.is_ascii_digit()
        }
    })
}

fn rel_text(millis: u64, whole_seconds_only: bool) -> String {
    if whole_seconds_only {
        (millis / 1_000).to_string()
    } else {
        format!("{}.{:03}", millis / 1_000, millis % 1_000)
    }
}
