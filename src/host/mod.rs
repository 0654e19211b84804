//! Hosts taking part in a scenario.
//!
//! A [`Host`] is a machine commands can be sent to and files moved to
//! and from. The mechanics of reaching the machine live in a
//! [`HostDriver`] (a local shell, ssh, or a test double); everything
//! above that — connection bookkeeping, the temporary directory on the
//! far side, traffic control settings — is shared and lives here.

pub mod connection;
pub mod local;
pub mod ssh;
pub mod test_double;

use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use std::sync::Arc;

use crate::error::{AppError, AppResult, ConfigError, HostError};
use crate::tc::TcSettings;

pub use connection::{CommandChannel, Connection, Reuse};

/// Transport mechanics for one host subtype.
#[async_trait]
pub trait HostDriver: Send + Sync {
    /// The subtype name as used in scenario files.
    fn kind(&self) -> &'static str;

    /// Parse one subtype-specific setting. Returns false when the key
    /// is not one of this driver's.
    ///
    /// # Errors
    ///
    /// Fails when the key is recognized but the value is not usable.
    fn parse_setting(&mut self, key: &str, value: &str) -> AppResult<bool>;

    /// Validate the collected settings and apply defaults.
    ///
    /// # Errors
    ///
    /// Fails when a required setting is missing or inconsistent.
    fn check_settings(&mut self, name: &str) -> AppResult<()>;

    /// Open a fresh command channel to the host.
    async fn open_channel(&self, name: &str) -> AppResult<Box<dyn CommandChannel>>;

    /// Copy a local file onto the host.
    async fn push_file(&self, name: &str, local: &Path, remote: &str) -> AppResult<()>;

    /// Copy a file from the host into a local path.
    async fn pull_file(&self, name: &str, remote: &str, local: &Path) -> AppResult<()>;

    /// The subnet the host's traffic comes from, for traffic control
    /// on other hosts.
    fn subnet(&self) -> String;

    /// The address of the host, or empty when it has none.
    fn address(&self) -> String;
}

/// One machine taking part in scenarios.
pub struct Host {
    name: String,
    driver: Box<dyn HostDriver>,
    remote_directory: Option<String>,
    temp_directory: Mutex<Option<String>>,
    tc: TcSettings,
    connections: Mutex<Vec<Arc<Connection>>>,
    next_connection: AtomicU32,
}

impl Host {
    #[must_use]
    pub fn new(driver: Box<dyn HostDriver>) -> Self {
        Self {
            name: String::new(),
            driver,
            remote_directory: None,
            temp_directory: Mutex::new(None),
            tc: TcSettings::new(),
            connections: Mutex::new(Vec::new()),
            next_connection: AtomicU32::new(0),
        }
    }

    /// Parse one `key=value` setting from a host section.
    ///
    /// # Errors
    ///
    /// Fails on unknown keys, duplicates and unusable values.
    pub fn parse_setting(&mut self, key: &str, value: &str) -> AppResult<()> {
        if self.driver.parse_setting(key, value)? {
            return Ok(());
        }
        match key {
            "name" => {
                if !self.name.is_empty() {
                    return Err(AppError::config(ConfigError::DuplicateParameter {
                        section: self.section_label(),
                        key: key.to_owned(),
                    }));
                }
                crate::config::syntax::validate_name(value).map_err(|source| {
                    AppError::config(ConfigError::InvalidValue {
                        key: key.to_owned(),
                        source,
                    })
                })?;
                self.name = value.to_owned();
                Ok(())
            }
            "remoteFolder" | "remoteDirectory" => {
                if self.remote_directory.is_some() {
                    return Err(AppError::config(ConfigError::DuplicateParameter {
                        section: self.section_label(),
                        key: key.to_owned(),
                    }));
                }
                if !value.is_empty() {
                    self.remote_directory = Some(value.to_owned());
                }
                Ok(())
            }
            _ => {
                if self.tc.parse_setting(key, value)? {
                    return Ok(());
                }
                Err(AppError::config(ConfigError::UnknownParameter {
                    section: self.section_label(),
                    key: key.to_owned(),
                }))
            }
        }
    }

    /// Validate the collected settings and apply defaults.
    ///
    /// # Errors
    ///
    /// Fails when a required setting is missing or inconsistent.
    pub fn check_settings(&mut self) -> AppResult<()> {
        if self.name.is_empty() {
            return Err(AppError::config(ConfigError::MissingParameter {
                section: self.section_label(),
                key: "name",
            }));
        }
        self.driver.check_settings(&self.name)?;
        self.tc.check(&self.name)?;
        Ok(())
    }

    fn section_label(&self) -> String {
        format!("host:{}", self.driver.kind())
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn kind(&self) -> &'static str {
        self.driver.kind()
    }

    #[must_use]
    pub const fn tc_settings(&self) -> &TcSettings {
        &self.tc
    }

    #[must_use]
    pub fn subnet(&self) -> String {
        self.driver.subnet()
    }

    #[must_use]
    pub fn address(&self) -> String {
        self.driver.address()
    }

    /// The directory on the host where scenario data lives. Only
    /// available once [`prepare`] has run (or a remote directory was
    /// configured).
    ///
    /// [`prepare`]: Host::prepare
    ///
    /// # Errors
    ///
    /// Fails when the host has no reserved directory.
    pub fn test_dir(&self) -> AppResult<String> {
        if let Some(dir) = &self.remote_directory {
            return Ok(dir.clone());
        }
        let reserved = match self.temp_directory.lock() {
            Ok(guard) => guard.clone(),
            Err(_) => None,
        };
        reserved.ok_or_else(|| {
            AppError::host(HostError::NotReserved {
                name: self.name.clone(),
            })
        })
    }

    /// The directory on the host where data that must survive the
    /// scenario lives. The same as [`test_dir`] unless a driver keeps
    /// them apart.
    ///
    /// [`test_dir`]: Host::test_dir
    ///
    /// # Errors
    ///
    /// Fails when the host has no reserved directory.
    pub fn persistent_test_dir(&self) -> AppResult<String> {
        self.test_dir()
    }

    /// Open a new connection to the host and add it to the pool.
    ///
    /// # Errors
    ///
    /// Fails when the channel cannot be opened.
    pub async fn create_connection(&self) -> AppResult<Arc<Connection>> {
        let number = self.next_connection.fetch_add(1, Ordering::SeqCst);
        let link = self.driver.open_channel(&self.name).await?;
        let connection = Connection::new(number, &self.name, link);
        if let Ok(mut pool) = self.connections.lock() {
            pool.push(Arc::clone(&connection));
        }
        let ready = connection.send("echo \"READY\"").await?;
        tracing::trace!("Host {}: connection {} ready: {}", self.name, number, ready);
        Ok(connection)
    }

    /// Close a connection and drop it from the pool.
    pub async fn close_connection(&self, connection: &Arc<Connection>) {
        connection.close().await;
        if let Ok(mut pool) = self.connections.lock() {
            pool.retain(|held| !Arc::ptr_eq(held, connection));
        }
    }

    fn default_connection(&self) -> AppResult<Arc<Connection>> {
        let pool = self.connections.lock().map_err(|_| {
            AppError::host(HostError::NoConnection {
                name: self.name.clone(),
            })
        })?;
        pool.first().cloned().ok_or_else(|| {
            AppError::host(HostError::NoConnection {
                name: self.name.clone(),
            })
        })
    }

    async fn connection_for(&self, reuse: &Reuse) -> AppResult<(Arc<Connection>, bool)> {
        match reuse {
            Reuse::Default => Ok((self.default_connection()?, false)),
            Reuse::New => Ok((self.create_connection().await?, true)),
            Reuse::Specific(connection) => Ok((Arc::clone(connection), false)),
        }
    }

    /// Run a shell command on the host and return its trimmed output.
    ///
    /// # Errors
    ///
    /// Fails when no connection can be used or the channel breaks.
    pub async fn send_command(&self, command: &str, reuse: &Reuse) -> AppResult<String> {
        let (connection, temporary) = self.connection_for(reuse).await?;
        let result = connection.send(command).await;
        if temporary {
            self.close_connection(&connection).await;
        }
        result
    }

    /// Copy a local file onto the host.
    ///
    /// # Errors
    ///
    /// Fails when the source is not a file, the destination exists and
    /// `overwrite` is false, or the transfer itself fails.
    pub async fn send_file(&self, local: &Path, remote: &str, overwrite: bool) -> AppResult<()> {
        if !local.is_file() {
            return Err(AppError::host(HostError::UploadFailed {
                name: self.name.clone(),
                path: local.to_path_buf(),
                detail: "local source is not a file".to_owned(),
            }));
        }
        if !overwrite {
            let exists = self
                .send_command(&format!("[ -e \"{remote}\" ] && echo \"E\""), &Reuse::Default)
                .await?;
            if exists == "E" {
                return Err(AppError::host(HostError::UploadFailed {
                    name: self.name.clone(),
                    path: local.to_path_buf(),
                    detail: format!("destination {remote} already exists"),
                }));
            }
        }
        let target_is_dir = self
            .send_command(&format!("[ -d \"{remote}\" ] && echo \"D\""), &Reuse::Default)
            .await?;
        if target_is_dir == "D" {
            return Err(AppError::host(HostError::UploadFailed {
                name: self.name.clone(),
                path: local.to_path_buf(),
                detail: format!("destination {remote} is a directory"),
            }));
        }
        self.driver.push_file(&self.name, local, remote).await
    }

    /// Recursively copy a local directory onto the host, overwriting
    /// existing files.
    ///
    /// # Errors
    ///
    /// Fails when the source is not a directory, a destination
    /// collides with a remote file, or a transfer fails.
    pub async fn send_files(&self, local_dir: &Path, remote_dir: &str) -> AppResult<()> {
        if !local_dir.is_dir() {
            return Err(AppError::host(HostError::UploadFailed {
                name: self.name.clone(),
                path: local_dir.to_path_buf(),
                detail: "local source is not a directory".to_owned(),
            }));
        }
        let mut work: Vec<(PathBuf, String)> =
            vec![(local_dir.to_path_buf(), remote_dir.to_owned())];
        while let Some((directory, remote)) = work.pop() {
            let collision = self
                .send_command(&format!("[ -f \"{remote}\" ] && echo \"E\""), &Reuse::Default)
                .await?;
            if collision == "E" {
                return Err(AppError::host(HostError::UploadFailed {
                    name: self.name.clone(),
                    path: directory,
                    detail: format!("remote destination {remote} is a file"),
                }));
            }
            self.send_command(&format!("mkdir -p \"{remote}\""), &Reuse::Default)
                .await?;
            let mut entries: Vec<PathBuf> = std::fs::read_dir(&directory)?
                .collect::<Result<Vec<_>, _>>()?
                .into_iter()
                .map(|entry| entry.path())
                .collect();
            entries.sort();
            for path in entries {
                let Some(file_name) = path.file_name().map(|name| name.to_string_lossy().into_owned())
                else {
                    continue;
                };
                let child_remote = format!("{remote}/{file_name}");
                if path.is_dir() {
                    work.push((path, child_remote));
                } else {
                    self.send_file(&path, &child_remote, true).await?;
                }
            }
        }
        Ok(())
    }

    /// Copy a file from the host into a local path.
    ///
    /// # Errors
    ///
    /// Fails when the remote source is not a file, the local
    /// destination exists and `overwrite` is false, or the transfer
    /// fails.
    pub async fn get_file(&self, remote: &str, local: &Path, overwrite: bool) -> AppResult<()> {
        let is_file = self
            .send_command(&format!("[ -f \"{remote}\" ] && echo \"F\""), &Reuse::Default)
            .await?;
        if is_file != "F" {
            return Err(AppError::host(HostError::DownloadFailed {
                name: self.name.clone(),
                path: remote.to_owned(),
                detail: "remote source is not a file".to_owned(),
            }));
        }
        if !overwrite && local.exists() {
            return Err(AppError::host(HostError::DownloadFailed {
                name: self.name.clone(),
                path: remote.to_owned(),
                detail: format!("local destination {} already exists", local.display()),
            }));
        }
        if local.is_dir() {
            return Err(AppError::host(HostError::DownloadFailed {
                name: self.name.clone(),
                path: remote.to_owned(),
                detail: format!("local destination {} is a directory", local.display()),
            }));
        }
        self.driver.pull_file(&self.name, remote, local).await
    }

    /// Reserve the host for a scenario: open the default connection
    /// and make sure a usable data directory exists on it.
    ///
    /// # Errors
    ///
    /// Fails when the host cannot be reached or no temporary directory
    /// can be created.
    pub async fn prepare(&self) -> AppResult<()> {
        let has_connection = match self.connections.lock() {
            Ok(pool) => !pool.is_empty(),
            Err(_) => false,
        };
        if !has_connection {
            self.create_connection().await?;
        }
        if self.remote_directory.is_none() {
            let created = self.send_command("mktemp -d", &Reuse::Default).await?;
            let verify = self
                .send_command(&format!("[ -d \"{created}\" ] || echo \"E\""), &Reuse::Default)
                .await?;
            if created.is_empty() || verify == "E" {
                return Err(AppError::host(HostError::TempDirFailed {
                    name: self.name.clone(),
                    output: created,
                }));
            }
            if let Ok(mut guard) = self.temp_directory.lock() {
                *guard = Some(created);
            }
        }
        Ok(())
    }

    /// Release the host: remove the temporary directory and close all
    /// connections. Failures are logged, never raised.
    pub async fn cleanup(&self) {
        let reserved = match self.temp_directory.lock() {
            Ok(mut guard) => guard.take(),
            Err(_) => None,
        };
        if let Some(directory) = reserved {
            let removed = self
                .send_command(&format!("rm -rf \"{directory}\""), &Reuse::Default)
                .await;
            let verified = match removed {
                Ok(_) => {
                    self.send_command(
                        &format!("[ -d \"{directory}\" ] || echo \"E\""),
                        &Reuse::Default,
                    )
                    .await
                }
                Err(err) => Err(err),
            };
            match verified {
                Ok(gone) if gone == "E" => {}
                Ok(_) | Err(_) => {
                    tracing::warn!(
                        "Could not remove temporary directory {} from host {} during cleanup",
                        directory,
                        self.name
                    );
                }
            }
        }
        let all = match self.connections.lock() {
            Ok(mut pool) => std::mem::take(&mut *pool),
            Err(_) => Vec::new(),
        };
        for connection in all {
            connection.close().await;
        }
    }
}
