//! Host driver for machines reached over ssh.
//!
//! Authentication must work without interaction (an agent or
//! unencrypted keys): every channel is an `ssh ... bash` child in
//! batch mode and file transfers go through `scp`. Hosts that sit
//! behind a bastion set `muxHost`; their channels are then multiplexed
//! over a single pipe to a demultiplexer started on that gateway, and
//! file transfers jump through it with scp's `ProxyJump`.

use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::error::{AppError, AppResult, ConfigError, HostError, ValidationError};
use crate::host::local::{SubprocessChannel, copy_command};
use crate::host::{CommandChannel, HostDriver};
use crate::mux::MuxTransport;

pub struct SshDriver {
    hostname: Option<String>,
    port: Option<u16>,
    user: Option<String>,
    mux_host: Option<String>,
    subnet: Option<String>,
    transport: Mutex<Option<Arc<MuxTransport>>>,
}

#[must_use]
pub fn factory() -> Box<dyn HostDriver> {
    Box::new(SshDriver {
        hostname: None,
        port: None,
        user: None,
        mux_host: None,
        subnet: None,
        transport: Mutex::new(None),
    })
}

impl SshDriver {
    fn duplicate(key: &str) -> AppError {
        AppError::config(ConfigError::DuplicateParameter {
            section: "host:ssh".to_owned(),
            key: key.to_owned(),
        })
    }

    /// `user@hostname`, or just the hostname.
    fn target(&self) -> String {
        let hostname = self.hostname.as_deref().unwrap_or_default();
        match &self.user {
            Some(user) => format!("{user}@{hostname}"),
            None => hostname.to_owned(),
        }
    }

    /// Target in URI form so a non-default port survives being passed
    /// as a single ssh argument (as the gateway demultiplexer does).
    fn uri_target(&self) -> String {
        match self.port {
            Some(port) if port != 22 => format!("ssh://{}:{}", self.target(), port),
            _ => self.target(),
        }
    }

    fn scp_args(&self, from: String, to: String) -> Vec<String> {
        let mut args = vec!["-o".to_owned(), "BatchMode=yes".to_owned(), "-q".to_owned()];
        if let Some(port) = self.port {
            if port != 22 {
                args.push("-P".to_owned());
                args.push(port.to_string());
            }
        }
        if let Some(gateway) = &self.mux_host {
            args.push("-o".to_owned());
            args.push(format!("ProxyJump={gateway}"));
        }
        args.push(from);
        args.push(to);
        args
    }

    fn gateway_transport(&self, gateway: &str) -> AppResult<Arc<MuxTransport>> {
        let mut guard = self.transport.lock().map_err(|_| {
            AppError::host(HostError::Connect {
                name: gateway.to_owned(),
                source: std::io::Error::other("transport registry poisoned"),
            })
        })?;
        if let Some(transport) = guard.as_ref() {
            if !transport.is_dead() {
                return Ok(Arc::clone(transport));
            }
        }
        let transport = MuxTransport::over_ssh(gateway)?;
        *guard = Some(Arc::clone(&transport));
        Ok(transport)
    }
}

#[async_trait]
impl HostDriver for SshDriver {
    fn kind(&self) -> &'static str {
        "ssh"
    }

    fn parse_setting(&mut self, key: &str, value: &str) -> AppResult<bool> {
        match key {
            "hostname" => {
                if self.hostname.is_some() {
                    return Err(Self::duplicate(key));
                }
                if value.is_empty() || value.contains(char::is_whitespace) {
                    return Err(AppError::config(ConfigError::InvalidValue {
                        key: key.to_owned(),
                        source: ValidationError::InvalidName {
                            value: value.to_owned(),
                        },
                    }));
                }
                self.hostname = Some(value.to_owned());
            }
            "port" => {
                if self.port.is_some() {
                    return Err(Self::duplicate(key));
                }
                let port: u16 = value.parse().map_err(|source| {
                    AppError::config(ConfigError::InvalidValue {
                        key: key.to_owned(),
                        source: ValidationError::InvalidNumber { source },
                    })
                })?;
                if port == 0 {
                    return Err(AppError::config(ConfigError::InvalidValue {
                        key: key.to_owned(),
                        source: ValidationError::ValueTooSmall { min: 1 },
                    }));
                }
                self.port = Some(port);
            }
            "user" => {
                if self.user.is_some() {
                    return Err(Self::duplicate(key));
                }
                self.user = Some(value.to_owned());
            }
            "muxHost" => {
                if self.mux_host.is_some() {
                    return Err(Self::duplicate(key));
                }
                if value.is_empty() || value.contains(char::is_whitespace) {
                    return Err(AppError::config(ConfigError::InvalidValue {
                        key: key.to_owned(),
                        source: ValidationError::InvalidName {
                            value: value.to_owned(),
                        },
                    }));
                }
                self.mux_host = Some(value.to_owned());
            }
            "subnet" => {
                if self.subnet.is_some() {
                    return Err(Self::duplicate(key));
                }
                if value.is_empty() {
                    return Err(AppError::config(ConfigError::InvalidValue {
                        key: key.to_owned(),
                        source: ValidationError::ValueEmpty,
                    }));
                }
                self.subnet = Some(value.to_owned());
            }
            _ => return Ok(false),
        }
        Ok(true)
    }

    fn check_settings(&mut self, _name: &str) -> AppResult<()> {
        if self.hostname.is_none() {
            return Err(AppError::config(ConfigError::MissingParameter {
                section: "host:ssh".to_owned(),
                key: "hostname",
            }));
        }
        if self.port.is_none() {
            self.port = Some(22);
        }
        Ok(())
    }

    async fn open_channel(&self, name: &str) -> AppResult<Box<dyn CommandChannel>> {
        if let Some(gateway) = self.mux_host.clone() {
            let transport = self.gateway_transport(&gateway)?;
            let channel = transport.open(&self.uri_target(), "bash").await?;
            return Ok(Box::new(channel));
        }
        let mut args = vec!["-o".to_owned(), "BatchMode=yes".to_owned()];
        if let Some(port) = self.port {
            if port != 22 {
                args.push("-p".to_owned());
                args.push(port.to_string());
            }
        }
        args.push(self.target());
        args.push("bash".to_owned());
        Ok(Box::new(SubprocessChannel::spawn(name, "ssh", &args)?))
    }

    async fn push_file(&self, name: &str, local: &Path, remote: &str) -> AppResult<()> {
        let args = self.scp_args(
            local.to_string_lossy().into_owned(),
            format!("{}:{}", self.target(), remote),
        );
        copy_command("scp", &args).await.map_err(|detail| {
            AppError::host(HostError::UploadFailed {
                name: name.to_owned(),
                path: local.to_path_buf(),
                detail,
            })
        })
    }

    async fn pull_file(&self, name: &str, remote: &str, local: &Path) -> AppResult<()> {
        let args = self.scp_args(
            format!("{}:{}", self.target(), remote),
            local.to_string_lossy().into_owned(),
        );
        copy_command("scp", &args).await.map_err(|detail| {
            AppError::host(HostError::DownloadFailed {
                name: name.to_owned(),
                path: remote.to_owned(),
                detail,
            })
        })
    }

    fn subnet(&self) -> String {
        self.subnet
            .clone()
            .or_else(|| self.hostname.clone())
            .unwrap_or_default()
    }

    fn address(&self) -> String {
        self.hostname.clone().unwrap_or_default()
    }
}
