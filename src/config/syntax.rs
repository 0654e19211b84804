//! Line-level syntax shared by campaign and scenario files.
//!
//! Both file kinds are sectioned `key=value` text: `[kind]` or
//! `[kind:subtype]` headers open an object block, `#` starts a comment,
//! blank lines are ignored. Everything here is pure string work; the
//! meaning of sections and keys lives in the readers.

use std::time::Duration;

use crate::error::{ConfigError, ValidationError};

/// Milliseconds per second, for decimal-seconds parsing.
const MILLIS_PER_SECOND: u64 = 1_000;
/// Number of fractional digits kept when parsing decimal seconds.
const SECONDS_FRACTION_DIGITS: usize = 3;

/// One classified line of a sectioned config file.
#[derive(Debug, PartialEq, Eq)]
pub enum ConfigLine {
    /// Blank line or `#` comment.
    Skip,
    /// `[kind]` or `[kind:subtype]`.
    Section { kind: String, subtype: String },
    /// `key=value`.
    Assignment { key: String, value: String },
}

/// Classify a single raw line.
///
/// # Errors
///
/// Returns [`ConfigError::MalformedSectionHeader`] or
/// [`ConfigError::MalformedLine`] on syntax errors.
pub fn classify_line(raw: &str) -> Result<ConfigLine, ConfigError> {
    let line = raw.trim();
    if line.is_empty() || line.starts_with('#') {
        return Ok(ConfigLine::Skip);
    }
    if line.starts_with('[') {
        let inner = line
            .strip_prefix('[')
            .and_then(|rest| rest.strip_suffix(']'))
            .ok_or_else(|| ConfigError::MalformedSectionHeader {
                line: line.to_owned(),
            })?;
        let (kind, subtype) = match inner.split_once(':') {
            Some((kind, subtype)) => (kind.trim(), subtype.trim()),
            None => (inner.trim(), ""),
        };
        if kind.is_empty() || (inner.contains(':') && subtype.is_empty()) {
            return Err(ConfigError::MalformedSectionHeader {
                line: line.to_owned(),
            });
        }
        return Ok(ConfigLine::Section {
            kind: kind.to_owned(),
            subtype: subtype.to_owned(),
        });
    }
    let (key, value) = line
        .split_once('=')
        .ok_or_else(|| ConfigError::MalformedLine {
            line: line.to_owned(),
        })?;
    let key = key.trim();
    if key.is_empty() {
        return Err(ConfigError::MalformedLine {
            line: line.to_owned(),
        });
    }
    Ok(ConfigLine::Assignment {
        key: key.to_owned(),
        value: value.trim().to_owned(),
    })
}

/// Check an object name: a letter followed by letters, digits, `_`, `.` or `-`.
///
/// # Errors
///
/// Returns [`ValidationError::InvalidName`] when the name does not match.
pub fn validate_name(value: &str) -> Result<(), ValidationError> {
    let mut chars = value.chars();
    let valid = match chars.next() {
        Some(first) if first.is_ascii_alphabetic() => {
            chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.' || c == '-')
        }
        Some(_) | None => false,
    };
    if valid {
        Ok(())
    } else {
        Err(ValidationError::InvalidName {
            value: value.to_owned(),
        })
    }
}

/// Split an object reference of the form `name@argument`.
///
/// The argument part is `None` when no `@` is present; it may be empty
/// (`name@`), which callers treat like a missing argument.
#[must_use]
pub fn split_reference(value: &str) -> (&str, Option<&str>) {
    match value.split_once('@') {
        Some((name, argument)) => (name, Some(argument)),
        None => (value, None),
    }
}

/// Parse a strictly positive integer, used for whole-second limits.
///
/// # Errors
///
/// Returns [`ValidationError::InvalidNumber`] on syntax errors and
/// [`ValidationError::ValueTooSmall`] for zero.
pub fn parse_positive_u64(value: &str) -> Result<u64, ValidationError> {
    let number: u64 = value
        .trim()
        .parse()
        .map_err(|source| ValidationError::InvalidNumber { source })?;
    if number == 0 {
        return Err(ValidationError::ValueTooSmall { min: 1 });
    }
    Ok(number)
}

/// Parse a non-negative decimal seconds value (`"0"`, `"2"`, `"2.5"`)
/// into a [`Duration`] with millisecond precision.
///
/// # Errors
///
/// Returns [`ValidationError::InvalidFloat`] on syntax errors and
/// [`ValidationError::ValueNegative`] for negative values.
pub fn parse_seconds(value: &str) -> Result<Duration, ValidationError> {
    let text = value.trim();
    let number: f64 = text
        .parse()
        .map_err(|source| ValidationError::InvalidFloat { source })?;
    if number.is_sign_negative() {
        return Err(ValidationError::ValueNegative);
    }
    let (whole_text, fraction_text) = match text.split_once('.') {
        Some((whole, fraction)) => (whole, fraction),
        None => (text, ""),
    };
    let whole: u64 = if whole_text.is_empty() {
        0
    } else {
        whole_text
            .parse()
            .map_err(|source| ValidationError::InvalidNumber { source })?
    };
    let mut fraction_digits: String = fraction_text
        .chars()
        .take(SECONDS_FRACTION_DIGITS)
        .collect();
    while fraction_digits.len() < SECONDS_FRACTION_DIGITS {
        fraction_digits.push('0');
    }
    let fraction: u64 = fraction_digits
        .parse()
        .map_err(|source| ValidationError::InvalidNumber { source })?;
    let total = u128::from(whole)
        .checked_mul(u128::from(MILLIS_PER_SECOND))
        .and_then(|millis| millis.checked_add(u128::from(fraction)))
        .unwrap_or(u128::from(u64::MAX));
    Ok(Duration::from_millis(
        u64::try_from(total).unwrap_or(u64::MAX),
    ))
}

/// Render a [`Duration`] as decimal seconds with millisecond precision,
/// e.g. `3.000`. The inverse of [`parse_seconds`] for values it produced.
#[must_use]
pub fn format_seconds(value: Duration) -> String {
    let millis = value.as_millis();
    let whole = millis
        .checked_div(u128::from(MILLIS_PER_SECOND))
        .unwrap_or(0);
    let fraction = millis
        .checked_rem(u128::from(MILLIS_PER_SECOND))
        .unwrap_or(0);
    format!("{}.{:03}", whole, fraction)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{AppError, AppResult};

    #[test]
    fn classifies_sections_and_assignments() -> AppResult<()> {
        match classify_line("[host:ssh]")? {
            ConfigLine::Section { kind, subtype } => {
                if kind != "host" || subtype != "ssh" {
                    return Err(AppError::config("Wrong section parts"));
                }
            }
            ConfigLine::Skip | ConfigLine::Assignment { .. } => {
                return Err(AppError::config("Expected a section"));
            }
        }
        match classify_line("  [execution]  ")? {
            ConfigLine::Section { kind, subtype } => {
                if kind != "execution" || !subtype.is_empty() {
                    return Err(AppError::config("Wrong bare section parts"));
                }
            }
            ConfigLine::Skip | ConfigLine::Assignment { .. } => {
                return Err(AppError::config("Expected a bare section"));
            }
        }
        match classify_line("name = node1 ")? {
            ConfigLine::Assignment { key, value } => {
                if key != "name" || value != "node1" {
                    return Err(AppError::config("Wrong assignment parts"));
                }
            }
            ConfigLine::Skip | ConfigLine::Section { .. } => {
                return Err(AppError::config("Expected an assignment"));
            }
        }
        Ok(())
    }

    #[test]
    fn skips_blanks_and_comments() -> AppResult<()> {
        if classify_line("")? != ConfigLine::Skip {
            return Err(AppError::config("Blank line should be skipped"));
        }
        if classify_line("   # /path/to/provenance")? != ConfigLine::Skip {
            return Err(AppError::config("Comment line should be skipped"));
        }
        Ok(())
    }

    #[test]
    fn rejects_malformed_lines() {
        assert!(classify_line("[host:ssh").is_err());
        assert!(classify_line("[:ssh]").is_err());
        assert!(classify_line("[host:]").is_err());
        assert!(classify_line("no equals sign").is_err());
        assert!(classify_line("=value").is_err());
    }

    #[test]
    fn keeps_brackets_inside_keys() -> AppResult<()> {
        match classify_line("rootHash[1K]=da39a3ee")? {
            ConfigLine::Assignment { key, .. } => {
                if key != "rootHash[1K]" {
                    return Err(AppError::config("Key with brackets mangled"));
                }
                Ok(())
            }
            ConfigLine::Skip | ConfigLine::Section { .. } => {
                Err(AppError::config("Expected an assignment"))
            }
        }
    }

    #[test]
    fn validates_names() {
        assert!(validate_name("node1").is_ok());
        assert!(validate_name("a_b-c.d").is_ok());
        assert!(validate_name("test__").is_ok());
        assert!(validate_name("").is_err());
        assert!(validate_name("1abc").is_err());
        assert!(validate_name("with space").is_err());
        assert!(validate_name("emoji\u{1F980}").is_err());
    }

    #[test]
    fn splits_references() {
        assert_eq!(split_reference("file"), ("file", None));
        assert_eq!(split_reference("file@2"), ("file", Some("2")));
        assert_eq!(split_reference("file@"), ("file", Some("")));
        assert_eq!(split_reference("file@?"), ("file", Some("?")));
    }

    #[test]
    fn parses_positive_integers() {
        assert!(matches!(parse_positive_u64("300"), Ok(300)));
        assert!(parse_positive_u64("0").is_err());
        assert!(parse_positive_u64("-3").is_err());
        assert!(parse_positive_u64("ten").is_err());
    }

    #[test]
    fn parses_decimal_seconds() -> AppResult<()> {
        if parse_seconds("2")? != Duration::from_millis(2_000) {
            return Err(AppError::validation("Whole seconds wrong"));
        }
        if parse_seconds("2.5")? != Duration::from_millis(2_500) {
            return Err(AppError::validation("Fractional seconds wrong"));
        }
        if parse_seconds("0.0015")? != Duration::from_millis(1) {
            return Err(AppError::validation("Extra digits should truncate"));
        }
        if parse_seconds(".25")? != Duration::from_millis(250) {
            return Err(AppError::validation("Leading dot should parse"));
        }
        assert!(parse_seconds("-1").is_err());
        assert!(parse_seconds("soon").is_err());
        Ok(())
    }

    #[test]
    fn formats_seconds_round_trip() -> AppResult<()> {
        for text in ["0.000", "3.000", "2.500", "6.125"] {
            let formatted = format_seconds(parse_seconds(text)?);
            if formatted != text {
                return Err(AppError::validation(format!(
                    "Round trip changed {} into {}",
                    text, formatted
                )));
            }
        }
        Ok(())
    }
}
