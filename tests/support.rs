use std::ffi::OsStr;
use std::fs;
use std::path::Path;
use std::process::{Command, Output};

/// Run the `campaigner` binary in `work_dir` and capture its output.
///
/// The environment is pinned so results land where the test says and
/// logging stays quiet.
///
/// # Errors
///
/// Returns an error if the binary cannot be executed.
pub fn run_campaigner<I, S>(args: I, work_dir: &Path) -> Result<Output, String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let bin = campaigner_bin()?;
    Command::new(bin)
        .args(args)
        .current_dir(work_dir)
        .env("RUST_LOG", "error")
        .env_remove("CAMPAIGNER_LOG")
        .env_remove("RESULTS_DIR")
        .output()
        .map_err(|err| format!("run campaigner failed: {}", err))
}

pub fn campaigner_bin() -> Result<String, String> {
    option_env!("CARGO_BIN_EXE_campaigner").map_or_else(
        || Err("CARGO_BIN_EXE_campaigner missing at compile time.".to_owned()),
        |path| Ok(path.to_owned()),
    )
}

/// Write a test input file, creating parent directories as needed.
///
/// # Errors
///
/// Returns an error when the directory or the file cannot be written.
pub fn write_file(path: &Path, content: &str) -> Result<(), String> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .map_err(|err| format!("create {} failed: {}", parent.display(), err))?;
    }
    fs::write(path, content).map_err(|err| format!("write {} failed: {}", path.display(), err))
}
