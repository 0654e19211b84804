//! Where client programs come from.
//!
//! A [`SourceDriver`] puts a client's source tree in place, on the
//! commanding machine for local builds or on a host for remote ones.
//! `directory` uses a tree that is already there, `local` works on a
//! scratch copy so builds never touch the original, and `git` clones
//! a repository.

use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::client::Client;
use crate::error::{AppError, AppResult, StageError};
use crate::host::{Host, Reuse};

/// Behavior of one source subtype.
#[async_trait]
pub trait SourceDriver: Send + Sync {
    /// The subtype name as used in scenario files.
    fn kind(&self) -> &'static str;

    /// Put the source tree in place on the commanding machine.
    ///
    /// # Errors
    ///
    /// Fails when the source does not exist or cannot be fetched.
    async fn prepare_local(&self, client: &Client) -> AppResult<()>;

    /// Put the source tree in place on `host` for a remote build.
    ///
    /// # Errors
    ///
    /// Fails when the source cannot be fetched on the host.
    async fn prepare_remote(&self, client: &Client, host: &Host) -> AppResult<()>;

    /// The source tree on the commanding machine. Local builds run
    /// here and layout uploads read from here.
    fn local_location(&self, client: &Client) -> String;

    /// The source tree on `host`. Remote builds run here.
    ///
    /// # Errors
    ///
    /// Fails when the host has no usable client directory yet.
    fn remote_location(&self, client: &Client, host: &Host) -> AppResult<String> {
        Ok(format!("{}/source", client.client_dir(host)?))
    }

    /// Remove local scratch data. Failures are logged, never raised.
    async fn cleanup(&self) {}
}

/// The scratch directory sources that fetch use for one client.
fn scratch_dir(client: &Client) -> PathBuf {
    std::env::temp_dir().join(format!(
        "campaigner_source_{}_{}",
        std::process::id(),
        client.name()
    ))
}

/// One owned scratch directory, reserved once and removed once.
struct Scratch {
    subtype: &'static str,
    directory: Mutex<Option<PathBuf>>,
}

impl Scratch {
    const fn new(subtype: &'static str) -> Self {
        Self {
            subtype,
            directory: Mutex::new(None),
        }
    }

    fn reserve(&self, directory: PathBuf) -> AppResult<()> {
        let Ok(mut guard) = self.directory.lock() else {
            return Err(AppError::stage(StageError::SourcePrepareTwice {
                subtype: self.subtype,
            }));
        };
        if guard.is_some() {
            return Err(AppError::stage(StageError::SourcePrepareTwice {
                subtype: self.subtype,
            }));
        }
        *guard = Some(directory);
        Ok(())
    }

    fn remove(&self) {
        let taken = match self.directory.lock() {
            Ok(mut guard) => guard.take(),
            Err(_) => None,
        };
        if let Some(directory) = taken {
            if std::fs::remove_dir_all(&directory).is_err() {
                tracing::debug!("Source scratch {} was already gone", directory.display());
            }
        }
    }
}

/// Run a shell command in `directory` and surface its output on
/// failure.
pub(super) async fn run_local(command: &str, directory: &Path) -> Result<(), String> {
    let output = tokio::process::Command::new("bash")
        .arg("-c")
        .arg(command)
        .current_dir(directory)
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

/// Recursively copy the contents of `from` into the existing
/// directory `to`.
fn copy_tree(from: &Path, to: &Path) -> AppResult<()> {
    let mut entries: Vec<PathBuf> = std::fs::read_dir(from)?
        .collect::<Result<Vec<_>, _>>()?
        .into_iter()
        .map(|entry| entry.path())
        .collect();
    entries.sort();
    for path in entries {
        let Some(name) = path.file_name() else {
            continue;
        };
        let target = to.join(name);
        if path.is_dir() {
            std::fs::create_dir_all(&target)?;
            copy_tree(&path, &target)?;
        } else {
            std::fs::copy(&path, &target)?;
        }
    }
    Ok(())
}

fn checked_location(subtype: &'static str, client: &Client) -> AppResult<PathBuf> {
    let location = PathBuf::from(client.location());
    if !location.exists() {
        return Err(AppError::stage(StageError::SourceMissing {
            subtype,
            location: client.location().to_owned(),
        }));
    }
    if !location.is_dir() {
        return Err(AppError::stage(StageError::NotADirectory { path: location }));
    }
    Ok(location)
}

/// A source tree that already sits at the client's location, used in
/// place.
pub struct DirectorySource;

#[must_use]
pub fn directory_factory() -> Box<dyn SourceDriver> {
    Box::new(DirectorySource)
}

#[async_trait]
impl SourceDriver for DirectorySource {
    fn kind(&self) -> &'static str {
        "directory"
    }

    async fn prepare_local(&self, client: &Client) -> AppResult<()> {
        checked_location("directory", client)?;
        Ok(())
    }

    async fn prepare_remote(&self, client: &Client, host: &Host) -> AppResult<()> {
        let location = client.location();
        let reply = host
            .send_command(
                &format!(
                    "[ -e \"{location}\" -a -d \"{location}\" ] && echo -n \"OK\" || echo -n \"E\""
                ),
                &Reuse::Default,
            )
            .await?;
        if !reply.starts_with("OK") {
            return Err(AppError::stage(StageError::SourceMissing {
                subtype: "directory",
                location: location.to_owned(),
            }));
        }
        Ok(())
    }

    fn local_location(&self, client: &Client) -> String {
        client.location().to_owned()
    }

    fn remote_location(&self, client: &Client, _host: &Host) -> AppResult<String> {
        Ok(client.location().to_owned())
    }
}

/// A scratch copy of a local source tree.
pub struct LocalSource {
    scratch: Scratch,
}

#[must_use]
pub fn local_factory() -> Box<dyn SourceDriver> {
    Box::new(LocalSource {
        scratch: Scratch::new("local"),
    })
}

#[async_trait]
impl SourceDriver for LocalSource {
    fn kind(&self) -> &'static str {
        "local"
    }

    async fn prepare_local(&self, client: &Client) -> AppResult<()> {
        let location = checked_location("local", client)?;
        let scratch = scratch_dir(client);
        self.scratch.reserve(scratch.clone())?;
        std::fs::create_dir_all(&scratch)?;
        copy_tree(&location, &scratch)
    }

    async fn prepare_remote(&self, client: &Client, host: &Host) -> AppResult<()> {
        let location = checked_location("local", client)?;
        let remote = self.remote_location(client, host)?;
        host.send_command(&format!("mkdir -p \"{remote}\""), &Reuse::Default)
            .await?;
        host.send_files(&location, &remote).await
    }

    fn local_location(&self, client: &Client) -> String {
        scratch_dir(client).to_string_lossy().into_owned()
    }

    async fn cleanup(&self) {
        self.scratch.remove();
    }
}

/// A fresh clone of a git repository.
pub struct GitSource {
    scratch: Scratch,
}

#[must_use]
pub fn git_factory() -> Box<dyn SourceDriver> {
    Box::new(GitSource {
        scratch: Scratch::new("git"),
    })
}

#[async_trait]
impl SourceDriver for GitSource {
    fn kind(&self) -> &'static str {
        "git"
    }

    async fn prepare_local(&self, client: &Client) -> AppResult<()> {
        let scratch = scratch_dir(client);
        self.scratch.reserve(scratch.clone())?;
        std::fs::create_dir_all(&scratch)?;
        run_local(&format!("git clone \"{}\" .", client.location()), &scratch)
            .await
            .map_err(|output| {
                AppError::stage(StageError::SourcePrepareFailed {
                    subtype: "git",
                    location: client.location().to_owned(),
                    output,
                })
            })
    }

    async fn prepare_remote(&self, client: &Client, host: &Host) -> AppResult<()> {
        let remote = self.remote_location(client, host)?;
        host.send_command(&format!("mkdir -p \"{remote}\""), &Reuse::Default)
            .await?;
        let location = client.location();
        let reply = host
            .send_command(
                &format!("( cd \"{remote}\"; git clone \"{location}\" . && echo && echo \"OK\" )"),
                &Reuse::Default,
            )
            .await?;
        if !reply.ends_with("OK") {
            return Err(AppError::stage(StageError::SourcePrepareFailed {
                subtype: "git",
                location: location.to_owned(),
                output: reply,
            }));
        }
        Ok(())
    }

    fn local_location(&self, client: &Client) -> String {
        scratch_dir(client).to_string_lossy().into_owned()
    }

    async fn cleanup(&self) {
        self.scratch.remove();
    }
}
