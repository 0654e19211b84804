//! Host driver for the commanding machine itself.
//!
//! Connections are plain `bash` subprocesses and file transfers are
//! local `cp` calls. Useful for single-machine scenarios and for
//! trying out a scenario file without any remote hosts.

use std::path::Path;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout};

use crate::error::{AppError, AppResult, HostError};
use crate::host::{CommandChannel, HostDriver};

/// A command channel backed by a piped child process. Shared between
/// the local driver (`bash`) and the ssh driver (`ssh ... bash`).
pub(super) struct SubprocessChannel {
    child: Child,
    stdin: ChildStdin,
    reader: BufReader<ChildStdout>,
}

impl SubprocessChannel {
    pub(super) fn spawn(name: &str, program: &str, args: &[String]) -> AppResult<Self> {
        let mut child = tokio::process::Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| {
                AppError::host(HostError::Spawn {
                    name: name.to_owned(),
                    source,
                })
            })?;
        let stdin = child.stdin.take().ok_or_else(|| {
            AppError::host(HostError::PipeClosed {
                name: name.to_owned(),
            })
        })?;
        let stdout = child.stdout.take().ok_or_else(|| {
            AppError::host(HostError::PipeClosed {
                name: name.to_owned(),
            })
        })?;
        Ok(Self {
            child,
            stdin,
            reader: BufReader::new(stdout),
        })
    }
}

#[async_trait]
impl CommandChannel for SubprocessChannel {
    async fn write_text(&mut self, text: &str) -> AppResult<()> {
        self.stdin.write_all(text.as_bytes()).await?;
        self.stdin.flush().await?;
        Ok(())
    }

    async fn read_line(&mut self) -> AppResult<Option<String>> {
        let mut line = String::new();
        let count = self.reader.read_line(&mut line).await?;
        if count == 0 {
            return Ok(None);
        }
        while line.ends_with('\n') || line.ends_with('\r') {
            line.pop();
        }
        Ok(Some(line))
    }

    async fn close(&mut self) -> AppResult<()> {
        drop(self.child.start_kill());
        Ok(())
    }
}

/// Run a local file copy and surface its output on failure.
pub(super) async fn run_copy(from: &str, to: &str) -> Result<(), String> {
    copy_command("cp", &[from.to_owned(), to.to_owned()]).await
}

pub(super) async fn copy_command(program: &str, args: &[String]) -> Result<(), String> {
    let output = tokio::process::Command::new(program)
        .args(args)
        .output()
        .await
        .map_err(|err| err.to_string())?;
    if output.status.success() {
        return Ok(());
    }
    let mut detail = String::from_utf8_lossy(&output.stdout).into_owned();
    detail.push_str(&String::from_utf8_lossy(&output.stderr));
    Err(detail.trim().to_owned())
}

pub struct LocalDriver;

#[must_use]
pub fn factory() -> Box<dyn HostDriver> {
    Box::new(LocalDriver)
}

#[async_trait]
impl HostDriver for LocalDriver {
    fn kind(&self) -> &'static str {
        "local"
    }

    fn parse_setting(&mut self, _key: &str, _value: &str) -> AppResult<bool> {
        Ok(false)
    }

    fn check_settings(&mut self, _name: &str) -> AppResult<()> {
        Ok(())
    }

    async fn open_channel(&self, name: &str) -> AppResult<Box<dyn CommandChannel>> {
        Ok(Box::new(SubprocessChannel::spawn(name, "bash", &[])?))
    }

    async fn push_file(&self, name: &str, local: &Path, remote: &str) -> AppResult<()> {
        run_copy(&local.to_string_lossy(), remote)
            .await
            .map_err(|detail| {
                AppError::host(HostError::UploadFailed {
                    name: name.to_owned(),
                    path: local.to_path_buf(),
                    detail,
                })
            })
    }

    async fn pull_file(&self, name: &str, remote: &str, local: &Path) -> AppResult<()> {
        run_copy(remote, &local.to_string_lossy())
            .await
            .map_err(|detail| {
                AppError::host(HostError::DownloadFailed {
                    name: name.to_owned(),
                    path: remote.to_owned(),
                    detail,
                })
            })
    }

    fn subnet(&self) -> String {
        "127.0.0.1".to_owned()
    }

    fn address(&self) -> String {
        "127.0.0.1".to_owned()
    }
}
