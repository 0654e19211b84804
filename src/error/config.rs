use super::ValidationError;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read '{path}': {source}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to write '{path}': {source}")]
    WriteFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to create directory '{path}': {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Malformed section header '{line}'.")]
    MalformedSectionHeader { line: String },
    #[error("Malformed line '{line}'. Expected 'key=value'.")]
    MalformedLine { line: String },
    #[error("Parameter '{key}' appears before any section.")]
    KeyOutsideSection { key: String },
    #[error("Campaign files only take [scenario] sections, found '[{kind}]'.")]
    UnknownSection { kind: String },
    #[error("No module provides '{kind}:{subtype}'.")]
    UnknownObjectType { kind: String, subtype: String },
    #[error("Module '{kind}:{subtype}' declares API {declared}, this build supports {supported}.")]
    ApiVersionMismatch {
        kind: String,
        subtype: String,
        declared: String,
        supported: &'static str,
    },
    #[error("Unknown parameter '{key}' in [{section}].")]
    UnknownParameter { section: String, key: String },
    #[error("[{section}] is missing required parameter '{key}'.")]
    MissingParameter {
        section: String,
        key: &'static str,
    },
    #[error("Parameter '{key}' was already set in [{section}].")]
    DuplicateParameter { section: String, key: String },
    #[error("The name '{name}' is used by more than one {kind} object.")]
    DuplicateName { kind: &'static str, name: String },
    #[error("Invalid value for '{key}': {source}")]
    InvalidValue {
        key: String,
        #[source]
        source: ValidationError,
    },
    #[error("Scenario file '{path}' does not exist.")]
    ScenarioFileMissing { path: PathBuf },
    #[error("Campaign file '{path}' declares no scenarios.")]
    NoScenarios { path: PathBuf },
    #[error("Scenario '{scenario}' declares no executions.")]
    NoExecutions { scenario: String },
    #[error("[{section}] refers to unknown {kind} '{name}'.")]
    UnknownName {
        section: String,
        kind: &'static str,
        name: String,
    },
    #[error("'{name}' is a {kind} and does not support '@' argument selection.")]
    SelectionUnsupported { kind: &'static str, name: String },
    #[error("'{name}@{argument}' is out of range: {count} variant(s) available.")]
    SelectionOutOfRange {
        name: String,
        argument: String,
        count: usize,
    },
    #[error("'{name}@{argument}' is not a variant index or '?'.")]
    SelectionSyntax { name: String, argument: String },
    #[error("'--arg={argument}' appears before any --parser, --processor or --viewer.")]
    ArgumentWithoutObject { argument: String },
    #[error("Results directory '{path}' is not a usable directory.")]
    ResultsDirUnusable { path: PathBuf },
    #[cfg(test)]
    #[error("Test expectation failed: {message}")]
    TestExpectation { message: &'static str },
    #[cfg(test)]
    #[error("Test expectation failed: {message}: {value}")]
    TestExpectationValue {
        message: &'static str,
        value: String,
    },
}
