use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StageError {
    #[error("File '{path}' does not exist.")]
    FileMissing { path: PathBuf },
    #[error("'{path}' is not a directory.")]
    NotADirectory { path: PathBuf },
    #[error("Meta file '{path}' does not exist.")]
    MetaFileMissing { path: PathBuf },
    #[error("Root hash '{value}' is not 40 hexadecimal digits.")]
    RootHashSyntax { value: String },
    #[error("Root hash needs an explicit chunk size, use 'rootHash[chunksize]={value}'.")]
    RootHashChunkSize { value: String },
    #[error("Invalid chunk size '{value}' in '{key}'.")]
    RootHashChunkSizeSyntax { key: String, value: String },
    #[error("Fake data size {ksize} kB is not a multiple of 4.")]
    FakedataSize { ksize: u64 },
    #[error("Could not build the fake data generator on host '{host}': {output}")]
    FakedataBuildFailed { host: String, output: String },
    #[error("Fake data generation failed on host '{host}': {output}")]
    FakedataGenerationFailed { host: String, output: String },
    #[error("Fake data binary '{binary}' is not executable on host '{host}'.")]
    FakedataBinaryMissing { binary: String, host: String },
    #[error("File '{name}' requests meta file generation but one was already given.")]
    GeneratedMetaConflict { name: String },
    #[error("File '{name}' already has a root hash for chunk size {chunk_size}.")]
    GeneratedHashConflict { name: String, chunk_size: u64 },
    #[error("File '{name}' cannot generate a root hash for directory '{path}'.")]
    RootHashOnDirectory { name: String, path: PathBuf },
    #[error("File '{name}' cannot rename directory '{path}' on upload.")]
    RenameDirectory { name: String, path: PathBuf },
    #[error("File '{name}' cannot both rename the upload and generate a torrent for it.")]
    RenameWithTorrent { name: String },
    #[error("{subtype} source '{location}' does not exist.")]
    SourceMissing {
        subtype: &'static str,
        location: String,
    },
    #[error("The {subtype} source was already prepared, expected exactly one local preparation.")]
    SourcePrepareTwice { subtype: &'static str },
    #[error("Preparing {subtype} source '{location}' failed: {output}")]
    SourcePrepareFailed {
        subtype: &'static str,
        location: String,
        output: String,
    },
    #[error("Building client '{client}' in '{location}' failed: {output}")]
    BuildFailed {
        client: String,
        location: String,
        output: String,
    },
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
