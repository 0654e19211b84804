//! Clients run by scenario executions.
//!
//! A [`Client`] is a program started on hosts. The shared machinery —
//! settings, directories on the host, the runner script, pid tracking,
//! the kill ladder, log retrieval — lives here; what to actually run
//! and which files it needs is answered by a [`ClientPlugin`]. Sources
//! and builders are attached per client and do the fetching and
//! compiling of the program itself.

pub mod cmd;
pub mod process;
pub mod test_double;

use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::artifact::{BuilderDriver, SourceDriver};
use crate::config::registry::ModuleRegistry;
use crate::error::{AppError, AppResult, ClientError, ConfigError};
use crate::host::{Connection, Host, Reuse};
use crate::scenario::execution::Execution;
use crate::tc::ClientTraffic;

pub use process::{ProcessTable, RemoteProcess, Sig};

/// How the client's command is embedded in the runner script.
pub enum CommandLine {
    /// A single command, backgrounded as `command &`.
    Simple(String),
    /// A compound command, backgrounded as `( command ) &`.
    Complex(String),
}

/// Behavior of one client subtype.
///
/// The plugin sees the owning [`Client`] for settings and directory
/// lookups; everything it does on a host goes through that client's
/// accessors so all subtypes share one directory scheme.
#[async_trait]
pub trait ClientPlugin: Send + Sync {
    /// The subtype name as used in scenario files.
    fn kind(&self) -> &'static str;

    /// Parse one subtype-specific setting. Returns false when the key
    /// is not one of this plugin's.
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

    /// Parser subtype to fall back on when neither the execution nor
    /// the client names one.
    fn default_parser(&self) -> &'static str {
        self.kind()
    }

    /// The protocol the client talks, for restricted traffic control.
    /// Empty means unknown, which forces unrestricted control.
    fn traffic_protocol(&self) -> String {
        String::new()
    }

    /// Ports all incoming traffic arrives on. Empty forces unrestricted
    /// inbound control.
    fn traffic_inbound_ports(&self) -> Vec<u16> {
        Vec::new()
    }

    /// Ports all outgoing traffic leaves from. Empty forces
    /// unrestricted outbound control.
    fn traffic_outbound_ports(&self) -> Vec<u16> {
        Vec::new()
    }

    /// Whether seeded data must be hard-linked into the execution's
    /// client directory before the client starts.
    fn links_data_in(&self) -> bool {
        false
    }

    /// Everything the client needs below its client directory. Entries
    /// ending in `/` are directories. `None` means the plugin manages
    /// its own files in [`prepare_host`].
    ///
    /// [`prepare_host`]: ClientPlugin::prepare_host
    fn binary_layout(&self) -> Option<Vec<String>> {
        None
    }

    /// Pairs of (path under the built source tree, path under the
    /// client directory) to upload. `None` when there is no layout.
    fn source_layout(&self) -> Option<Vec<(String, String)>> {
        None
    }

    /// Pairs of (local path, path under the client directory) uploaded
    /// on top of the binary layout. An empty local path with a remote
    /// path ending in `/` creates a directory.
    fn extra_upload_layout(&self) -> Option<Vec<(String, String)>> {
        None
    }

    /// The command the runner script should background for this
    /// execution.
    ///
    /// # Errors
    ///
    /// Fails when required directories are not available yet.
    fn command_line(&self, client: &Client, execution: &Execution) -> AppResult<CommandLine>;

    /// Subtype hook run at the end of the per-host preparation.
    ///
    /// # Errors
    ///
    /// Fails when the host cannot be set up for this client.
    async fn prepare_host(&self, client: &Client, host: &Host) -> AppResult<()> {
        let _ = (client, host);
        Ok(())
    }

    /// Subtype hook fetching logs beyond the shared cpu and start-time
    /// logs.
    ///
    /// # Errors
    ///
    /// Fails when a log cannot be retrieved.
    async fn retrieve_logs(
        &self,
        client: &Client,
        execution: &Execution,
        local_dir: &Path,
    ) -> AppResult<()> {
        let _ = (client, execution, local_dir);
        Ok(())
    }
}

/// One client taking part in scenarios.
pub struct Client {
    name: String,
    plugin: Box<dyn ClientPlugin>,
    extra_parameters: String,
    location: String,
    parser_names: Vec<String>,
    source_name: Option<String>,
    builder_name: Option<String>,
    remote_client: bool,
    profile: bool,
    log_start: bool,
    side_service: bool,
    source: Option<Box<dyn SourceDriver>>,
    builder: Option<Box<dyn BuilderDriver>>,
    processes: ProcessTable,
    temp_files: Mutex<Vec<PathBuf>>,
}

impl Client {
    #[must_use]
    pub fn new(plugin: Box<dyn ClientPlugin>) -> Self {
        Self {
            name: String::new(),
            plugin,
            extra_parameters: String::new(),
            location: String::new(),
            parser_names: Vec::new(),
            source_name: None,
            builder_name: None,
            remote_client: false,
            profile: false,
            log_start: false,
            side_service: false,
            source: None,
            builder: None,
            processes: ProcessTable::new(),
            temp_files: Mutex::new(Vec::new()),
        }
    }

    /// Parse one `key=value` setting from a client section.
    ///
    /// # Errors
    ///
    /// Fails on unknown keys, duplicates and unusable values.
    pub fn parse_setting(&mut self, key: &str, value: &str) -> AppResult<()> {
        if self.plugin.parse_setting(key, value)? {
            return Ok(());
        }
        match key {
            "name" => {
                if !self.name.is_empty() {
                    return Err(self.duplicate(key));
                }
                crate::config::syntax::validate_name(value).map_err(|source| {
                    AppError::config(ConfigError::InvalidValue {
                        key: key.to_owned(),
                        source,
                    })
                })?;
                self.name = value.to_owned();
            }
            "params" | "extraParameters" => {
                if !self.extra_parameters.is_empty() {
                    return Err(self.duplicate(key));
                }
                self.extra_parameters = value.to_owned();
            }
            "location" => {
                if !self.location.is_empty() {
                    return Err(self.duplicate(key));
                }
                self.location = value.to_owned();
            }
            "parser" => {
                crate::config::syntax::validate_name(value).map_err(|source| {
                    AppError::config(ConfigError::InvalidValue {
                        key: key.to_owned(),
                        source,
                    })
                })?;
                self.parser_names.push(value.to_owned());
            }
            "source" => {
                if self.source_name.is_some() {
                    return Err(self.duplicate(key));
                }
                self.source_name = Some(value.to_owned());
            }
            "builder" => {
                if self.builder_name.is_some() {
                    return Err(self.duplicate(key));
                }
                self.builder_name = Some(value.to_owned());
            }
            "remoteClient" => {
                self.remote_client = !value.is_empty();
            }
            "profile" => {
                self.profile = !value.is_empty();
            }
            "logStart" => {
                self.log_start = !value.is_empty();
            }
            "sideService" => {
                self.side_service = !value.is_empty();
            }
            _ => {
                return Err(AppError::config(ConfigError::UnknownParameter {
                    section: self.section_label(),
                    key: key.to_owned(),
                }));
            }
        }
        Ok(())
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
        if self.source_name.is_none() {
            self.source_name = Some("directory".to_owned());
        }
        if self.builder_name.is_none() {
            self.builder_name = Some("none".to_owned());
        }
        let name = self.name.clone();
        self.plugin.check_settings(&name)?;
        Ok(())
    }

    /// Instantiate the source and builder drivers named in the
    /// settings.
    ///
    /// # Errors
    ///
    /// Fails when either names an unknown module.
    pub fn resolve(&mut self, registry: &ModuleRegistry) -> AppResult<()> {
        if let Some(subtype) = &self.source_name {
            self.source = Some(registry.source(subtype)?);
        }
        if let Some(subtype) = &self.builder_name {
            self.builder = Some(registry.builder(subtype)?);
        }
        Ok(())
    }

    fn duplicate(&self, key: &str) -> AppError {
        AppError::config(ConfigError::DuplicateParameter {
            section: self.section_label(),
            key: key.to_owned(),
        })
    }

    fn section_label(&self) -> String {
        format!("client:{}", self.plugin.kind())
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn kind(&self) -> &'static str {
        self.plugin.kind()
    }

    #[must_use]
    pub fn location(&self) -> &str {
        &self.location
    }

    #[must_use]
    pub fn extra_parameters(&self) -> &str {
        &self.extra_parameters
    }

    #[must_use]
    pub fn parser_names(&self) -> &[String] {
        &self.parser_names
    }

    /// Parser subtype used when no parser is declared anywhere for an
    /// execution of this client.
    #[must_use]
    pub fn default_parser(&self) -> &'static str {
        self.plugin.default_parser()
    }

    #[must_use]
    pub const fn is_remote(&self) -> bool {
        self.remote_client
    }

    #[must_use]
    pub const fn is_profiled(&self) -> bool {
        self.profile
    }

    #[must_use]
    pub const fn is_side_service(&self) -> bool {
        self.side_service
    }

    /// The traffic shape of this client, for the traffic control
    /// planner.
    #[must_use]
    pub fn traffic(&self) -> ClientTraffic {
        ClientTraffic {
            client: self.name.clone(),
            protocol: self.plugin.traffic_protocol(),
            inbound_ports: self.plugin.traffic_inbound_ports(),
            outbound_ports: self.plugin.traffic_outbound_ports(),
        }
    }

    /// The directory on `host` holding this client's program and
    /// working files.
    ///
    /// # Errors
    ///
    /// Fails when the host has no reserved directory.
    pub fn client_dir(&self, host: &Host) -> AppResult<String> {
        Ok(format!("{}/clients/{}", host.test_dir()?, self.name))
    }

    /// The directory on `host` where this client's logs accumulate.
    ///
    /// # Errors
    ///
    /// Fails when the host has no reserved directory.
    pub fn log_dir(&self, host: &Host) -> AppResult<String> {
        Ok(format!("{}/logs/{}", host.persistent_test_dir()?, self.name))
    }

    /// The per-execution working directory below [`client_dir`].
    ///
    /// [`client_dir`]: Client::client_dir
    ///
    /// # Errors
    ///
    /// Fails when the execution is unresolved or the host unprepared.
    pub fn execution_client_dir(&self, execution: &Execution) -> AppResult<String> {
        let host = execution.host()?;
        Ok(format!(
            "{}/exec_{}",
            self.client_dir(&host)?,
            execution.number()
        ))
    }

    /// The per-execution log directory below [`log_dir`].
    ///
    /// [`log_dir`]: Client::log_dir
    ///
    /// # Errors
    ///
    /// Fails when the execution is unresolved or the host unprepared.
    pub fn execution_log_dir(&self, execution: &Execution) -> AppResult<String> {
        let host = execution.host()?;
        Ok(format!("{}/exec_{}", self.log_dir(&host)?, execution.number()))
    }

    /// Preparation independent of hosts: fetch and build the program
    /// locally, unless the client runs from remote sources.
    ///
    /// # Errors
    ///
    /// Fails when the source cannot be staged or the build fails.
    pub async fn prepare(&self) -> AppResult<()> {
        if self.remote_client {
            return Ok(());
        }
        if let Some(source) = &self.source {
            source.prepare_local(self).await?;
            if let Some(builder) = &self.builder {
                builder.build_local(self, source.as_ref()).await?;
            }
        }
        Ok(())
    }

    /// Per-host preparation: create the client directories, build
    /// remotely where requested, upload the declared layouts and
    /// verify every file landed.
    ///
    /// # Errors
    ///
    /// Fails when a command or upload fails or a layout entry is
    /// missing afterwards.
    pub async fn prepare_host(&self, host: &Host) -> AppResult<()> {
        let client_dir = self.client_dir(host)?;
        let log_dir = self.log_dir(host)?;
        host.send_command(
            &format!("mkdir -p \"{client_dir}\" \"{log_dir}\""),
            &Reuse::Default,
        )
        .await?;
        if self.remote_client {
            if let Some(source) = &self.source {
                source.prepare_remote(self, host).await?;
                if let Some(builder) = &self.builder {
                    builder.build_remote(self, host, source.as_ref()).await?;
                }
            }
        } else {
            self.upload_layout(host, &client_dir).await?;
        }
        if let Some(extra) = self.plugin.extra_upload_layout() {
            for (local, remote) in &extra {
                if local.is_empty() {
                    let dir = remote.trim_end_matches('/');
                    host.send_command(
                        &format!("mkdir -p \"{client_dir}/{dir}\""),
                        &Reuse::Default,
                    )
                    .await?;
                } else {
                    host.send_file(Path::new(local), &format!("{client_dir}/{remote}"), true)
                        .await?;
                }
            }
        }
        self.plugin.prepare_host(self, host).await
    }

    async fn upload_layout(&self, host: &Host, client_dir: &str) -> AppResult<()> {
        let Some(layout) = self.plugin.binary_layout() else {
            return Ok(());
        };
        for entry in &layout {
            if entry.ends_with('/') {
                let dir = entry.trim_end_matches('/');
                host.send_command(&format!("mkdir -p \"{client_dir}/{dir}\""), &Reuse::Default)
                    .await?;
            }
        }
        let source_root = self
            .source
            .as_ref()
            .map(|source| source.local_location(self))
            .unwrap_or_default();
        for (source_path, binary_path) in self.plugin.source_layout().unwrap_or_default() {
            let local = Path::new(&source_root).join(source_path);
            host.send_file(&local, &format!("{client_dir}/{binary_path}"), true)
                .await?;
        }
        for entry in &layout {
            if entry.ends_with('/') {
                continue;
            }
            let path = format!("{client_dir}/{entry}");
            let present = host
                .send_command(&format!("[ -f \"{path}\" ] && echo \"F\""), &Reuse::Default)
                .await?;
            if present != "F" {
                return Err(AppError::client(ClientError::BinaryMissing {
                    client: self.name.clone(),
                    path,
                }));
            }
        }
        Ok(())
    }

    /// Per-execution preparation: create the execution directories and
    /// put the runner script in place.
    ///
    /// # Errors
    ///
    /// Fails when directories cannot be created or the script cannot
    /// be written or uploaded.
    pub async fn prepare_execution(&self, execution: &Execution) -> AppResult<()> {
        let host = execution.host()?;
        let exec_client_dir = self.execution_client_dir(execution)?;
        let exec_log_dir = self.execution_log_dir(execution)?;
        host.send_command(
            &format!("mkdir -p \"{exec_client_dir}\" \"{exec_log_dir}\""),
            &Reuse::Default,
        )
        .await?;
        let script = self.runner_script(execution)?;
        let local = std::env::temp_dir().join(format!(
            "campaigner_runner_{}_{}_{}.sh",
            std::process::id(),
            self.name,
            execution.number()
        ));
        std::fs::write(&local, script)?;
        if let Ok(mut held) = self.temp_files.lock() {
            held.push(local.clone());
        }
        let remote = format!("{exec_client_dir}/runner.sh");
        host.send_file(&local, &remote, true).await?;
        host.send_command(&format!("chmod +x \"{remote}\""), &Reuse::Default)
            .await?;
        Ok(())
    }

    /// The script that starts the client and reports its pid.
    ///
    /// # Errors
    ///
    /// Fails when the execution is unresolved or the plugin cannot
    /// produce a command line.
    fn runner_script(&self, execution: &Execution) -> AppResult<String> {
        let host = execution.host()?;
        let client_dir = self.client_dir(&host)?;
        let exec_log_dir = self.execution_log_dir(execution)?;
        let mut script = String::from("#!/bin/bash\n");
        writeln!(script, "cd \"{client_dir}\"")?;
        if self.log_start {
            writeln!(script, "date '+%s.%N' > \"{exec_log_dir}/starttime.log\"")?;
        }
        for command in self.data_link_commands(execution)? {
            script.push_str(&command);
            script.push('\n');
        }
        match self.plugin.command_line(self, execution)? {
            CommandLine::Simple(command) => writeln!(script, "{command} &")?,
            CommandLine::Complex(command) => writeln!(script, "( {command} ) &")?,
        }
        script.push_str("pid=$!\necho $pid\n");
        if self.profile {
            write!(
                script,
                "while kill -0 $pid > /dev/null 2> /dev/null; do\n  date '+%y-%m-%d %H:%M:%S.%N' >> \"{exec_log_dir}/cpu.log\"\n  ps -p $pid -o %cpu=,rss= >> \"{exec_log_dir}/cpu.log\"\n  sleep 1\ndone &\n"
            )?;
        }
        Ok(script)
    }

    /// Commands reconstructing the seeded file tree inside the
    /// execution's client directory with hard links.
    fn data_link_commands(&self, execution: &Execution) -> AppResult<Vec<String>> {
        let mut commands = Vec::new();
        if !execution.is_seeder() || !self.plugin.links_data_in() {
            return Ok(commands);
        }
        let host = execution.host()?;
        let exec_dir = self.execution_client_dir(execution)?;
        let file = execution.file()?;
        let Some(root) = file.remote_data_path(&host)? else {
            return Ok(commands);
        };
        let base = root.rsplit('/').next().unwrap_or(&root).to_owned();
        let entries = file.data_entries();
        if entries.is_empty() {
            commands.push(format!("ln \"{root}\" \"{exec_dir}/{base}\""));
        } else {
            commands.push(format!("mkdir -p \"{exec_dir}/{base}\""));
            for entry in entries {
                if let Some(dir) = entry.strip_suffix('/') {
                    commands.push(format!("mkdir -p \"{exec_dir}/{base}/{dir}\""));
                } else {
                    commands.push(format!(
                        "ln \"{root}/{entry}\" \"{exec_dir}/{base}/{entry}\""
                    ));
                }
            }
        }
        Ok(commands)
    }

    /// First half of starting the client: send the runner script on
    /// the execution's dedicated connection without collecting output.
    ///
    /// # Errors
    ///
    /// Fails when the connection is missing or sending fails.
    pub async fn start_send(&self, execution: &Execution) -> AppResult<()> {
        let exec_client_dir = self.execution_client_dir(execution)?;
        let connection = execution.execution_connection()?;
        connection
            .start_send(&format!("\"{exec_client_dir}/runner.sh\""))
            .await
    }

    /// Second half of starting the client: collect the runner output,
    /// parse the pid and record the running process.
    ///
    /// # Errors
    ///
    /// Fails when no pid can be parsed or the execution already has a
    /// process.
    pub async fn start_ack(&self, execution: &Execution) -> AppResult<()> {
        let host = execution.host()?;
        let connection = execution.execution_connection()?;
        let output = connection.finish_send().await?;
        let digits: String = output
            .lines()
            .next()
            .unwrap_or("")
            .chars()
            .take_while(char::is_ascii_digit)
            .collect();
        if digits.is_empty() {
            return Err(AppError::client(ClientError::PidUnparsable {
                client: self.name.clone(),
                host: host.name().to_owned(),
                output,
            }));
        }
        let pid: u32 = digits.parse()?;
        let process = RemoteProcess::new(
            pid,
            &self.name,
            host.name(),
            execution.runner_connection()?,
        );
        self.processes.register(execution.number(), Arc::new(process))
    }

    /// Start the client and wait for its pid in one call.
    ///
    /// # Errors
    ///
    /// Fails when either half of the start fails.
    pub async fn start(&self, execution: &Execution) -> AppResult<()> {
        self.start_send(execution).await?;
        self.start_ack(execution).await
    }

    #[must_use]
    pub fn has_started(&self, execution: &Execution) -> bool {
        self.processes.has_started(execution.number())
    }

    #[must_use]
    pub fn is_stopped(&self, execution: &Execution) -> bool {
        self.processes.is_stopped(execution.number())
    }

    /// Whether the execution's process is still alive, probed over its
    /// runner connection.
    ///
    /// # Errors
    ///
    /// Fails when the probe cannot be run or gives unreadable output.
    pub async fn is_running(&self, execution: &Execution) -> AppResult<bool> {
        match self.processes.running(execution.number()) {
            Some(process) => process.is_alive().await,
            None => Ok(false),
        }
    }

    /// Like [`is_running`], probing over a caller-supplied connection.
    ///
    /// [`is_running`]: Client::is_running
    ///
    /// # Errors
    ///
    /// Fails when the probe cannot be run or gives unreadable output.
    pub async fn is_running_via(
        &self,
        execution: &Execution,
        connection: &Arc<Connection>,
    ) -> AppResult<bool> {
        match self.processes.running(execution.number()) {
            Some(process) => process.is_alive_via(connection).await,
            None => Ok(false),
        }
    }

    /// Walk the kill ladder for the execution's process. A process
    /// that survives the whole ladder is logged, not raised.
    ///
    /// # Errors
    ///
    /// Fails when signals or probes cannot be sent at all.
    pub async fn kill(&self, execution: &Execution) -> AppResult<()> {
        let Some(process) = self.processes.running(execution.number()) else {
            return Ok(());
        };
        if process.terminate().await? {
            self.processes.mark_stopped(execution.number());
        } else {
            tracing::warn!(
                "Client {} on host {} may still be running after the kill sequence",
                self.name,
                process.host()
            );
        }
        Ok(())
    }

    /// Like [`kill`], signalling over a caller-supplied connection.
    ///
    /// [`kill`]: Client::kill
    ///
    /// # Errors
    ///
    /// Fails when signals or probes cannot be sent at all.
    pub async fn kill_via(
        &self,
        execution: &Execution,
        connection: &Arc<Connection>,
    ) -> AppResult<()> {
        let Some(process) = self.processes.running(execution.number()) else {
            return Ok(());
        };
        if process.terminate_via(connection).await? {
            self.processes.mark_stopped(execution.number());
        } else {
            tracing::warn!(
                "Client {} on host {} may still be running after the kill sequence",
                self.name,
                process.host()
            );
        }
        Ok(())
    }

    /// Fetch the logs of one execution into `local_dir`: the shared
    /// cpu and start-time logs plus whatever the subtype collects.
    ///
    /// # Errors
    ///
    /// Fails when a present log cannot be transferred.
    pub async fn retrieve_logs(&self, execution: &Execution, local_dir: &Path) -> AppResult<()> {
        let host = execution.host()?;
        let exec_log_dir = self.execution_log_dir(execution)?;
        if self.profile {
            self.fetch_if_present(&host, &format!("{exec_log_dir}/cpu.log"), &local_dir.join("cpu.log"))
                .await?;
        }
        if self.log_start {
            self.fetch_if_present(
                &host,
                &format!("{exec_log_dir}/starttime.log"),
                &local_dir.join("starttime.log"),
            )
            .await?;
        }
        self.plugin.retrieve_logs(self, execution, local_dir).await
    }

    /// Download a remote file when it exists; absence is not an error.
    ///
    /// # Errors
    ///
    /// Fails when the probe or the transfer itself fails.
    pub async fn fetch_if_present(
        &self,
        host: &Host,
        remote: &str,
        local: &Path,
    ) -> AppResult<()> {
        let present = host
            .send_command(&format!("[ -f \"{remote}\" ] && echo \"F\""), &Reuse::Default)
            .await?;
        if present == "F" {
            host.get_file(remote, local, false).await?;
        }
        Ok(())
    }

    /// Remove this client's directories from a host.
    ///
    /// # Errors
    ///
    /// Fails when the removal command cannot be sent.
    pub async fn cleanup_host(&self, host: &Host, reuse: &Reuse) -> AppResult<()> {
        let Ok(client_dir) = self.client_dir(host) else {
            return Ok(());
        };
        let Ok(log_dir) = self.log_dir(host) else {
            return Ok(());
        };
        host.send_command(&format!("rm -rf \"{client_dir}\" \"{log_dir}\""), reuse)
            .await?;
        Ok(())
    }

    /// Host-independent cleanup: drop staged sources and the local
    /// runner scripts. Failures are logged, never raised.
    pub async fn cleanup(&self) {
        if let Some(source) = &self.source {
            source.cleanup().await;
        }
        let files = match self.temp_files.lock() {
            Ok(mut held) => std::mem::take(&mut *held),
            Err(_) => Vec::new(),
        };
        for file in files {
            if let Err(err) = std::fs::remove_file(&file) {
                tracing::warn!(
                    "Could not remove runner script {}: {}",
                    file.display(),
                    err
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::FileObject;
    use crate::error::ConfigError;
    use crate::host;
    use std::future::Future;

    fn run_async_test<F>(future: F) -> AppResult<()>
    where
        F: Future<Output = AppResult<()>>,
    {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|err| AppError::validation(format!("Failed to build runtime: {}", err)))?;
        runtime.block_on(future)
    }

    fn cmd_client(command: &str) -> AppResult<Client> {
        let mut client = Client::new(cmd::factory());
        client.parse_setting("name", "leech")?;
        client.parse_setting("command", command)?;
        client.check_settings()?;
        client.resolve(&ModuleRegistry::with_builtins())?;
        Ok(client)
    }

    async fn prepared_host() -> AppResult<Arc<Host>> {
        behaved_host("immediate").await
    }

    async fn behaved_host(behavior: &str) -> AppResult<Arc<Host>> {
        let mut raw = Host::new(host::test_double::factory());
        raw.parse_setting("name", "node1")?;
        raw.parse_setting("behavior", behavior)?;
        raw.check_settings()?;
        raw.prepare().await?;
        Ok(Arc::new(raw))
    }

    fn resolved_execution(
        host: &Arc<Host>,
        client: &Arc<Client>,
        file: &Arc<FileObject>,
    ) -> AppResult<Execution> {
        let mut execution = Execution::new(0);
        execution.parse_setting("host", "node1")?;
        execution.parse_setting("client", "leech")?;
        execution.parse_setting("file", "payload")?;
        execution.check_settings()?;
        execution.resolve(
            Arc::clone(host),
            Arc::clone(client),
            Arc::clone(file),
            Vec::new(),
        );
        Ok(execution)
    }

    fn none_file() -> AppResult<Arc<FileObject>> {
        let mut file = FileObject::new(crate::artifact::none_factory());
        file.parse_setting("name", "payload")?;
        file.check_settings()?;
        Ok(Arc::new(file))
    }

    #[test]
    fn settings_get_defaults_and_reject_duplicates() -> AppResult<()> {
        let mut client = Client::new(cmd::factory());
        client.parse_setting("name", "leech")?;
        client.parse_setting("command", "sleep 1")?;
        client.parse_setting("profile", "yes")?;
        client.parse_setting("sideService", "x")?;
        client.check_settings()?;
        if client.source_name.as_deref() != Some("directory")
            || client.builder_name.as_deref() != Some("none")
        {
            return Err(AppError::client("Defaults not applied"));
        }
        if !client.is_profiled() || !client.is_side_service() || client.is_remote() {
            return Err(AppError::client("Flags not parsed"));
        }
        match client.parse_setting("name", "other") {
            Err(AppError::Config(ConfigError::DuplicateParameter { .. })) => Ok(()),
            Err(_) | Ok(()) => Err(AppError::client("Second name accepted")),
        }
    }

    #[test]
    fn unnamed_client_is_rejected() {
        let mut client = Client::new(cmd::factory());
        assert!(client.parse_setting("command", "sleep 1").is_ok());
        assert!(client.check_settings().is_err());
    }

    #[test]
    fn runner_script_backgrounds_and_reports_the_pid() -> AppResult<()> {
        run_async_test(async {
            let host = prepared_host().await?;
            let client = Arc::new(cmd_client("sleep 2")?);
            let file = none_file()?;
            let execution = resolved_execution(&host, &client, &file)?;
            let script = client.runner_script(&execution)?;
            if !script.starts_with("#!/bin/bash\n") {
                return Err(AppError::client("Missing shebang"));
            }
            let client_dir = client.client_dir(&host)?;
            if !script.contains(&format!("cd \"{client_dir}\"")) {
                return Err(AppError::client("Missing cd to the client directory"));
            }
            if !script.contains(" &\npid=$!\necho $pid\n") {
                return Err(AppError::client(format!("No pid capture in: {script}")));
            }
            if script.contains("starttime.log") || script.contains("cpu.log") {
                return Err(AppError::client("Unrequested logging in script"));
            }
            Ok(())
        })
    }

    #[test]
    fn profiling_and_start_logging_are_opt_in() -> AppResult<()> {
        run_async_test(async {
            let host = prepared_host().await?;
            let mut bare = Client::new(cmd::factory());
            bare.parse_setting("name", "leech")?;
            bare.parse_setting("command", "sleep 2")?;
            bare.parse_setting("profile", "yes")?;
            bare.parse_setting("logStart", "yes")?;
            bare.check_settings()?;
            let client = Arc::new(bare);
            let file = none_file()?;
            let execution = resolved_execution(&host, &client, &file)?;
            let script = client.runner_script(&execution)?;
            let log_dir = client.execution_log_dir(&execution)?;
            if !script.contains(&format!("date '+%s.%N' > \"{log_dir}/starttime.log\"")) {
                return Err(AppError::client(format!("Missing start-time log in: {script}")));
            }
            if !script.contains("while kill -0 $pid > /dev/null 2> /dev/null; do") {
                return Err(AppError::client(format!("Missing profiler loop in: {script}")));
            }
            if !script.contains("ps -p $pid -o %cpu=,rss=") {
                return Err(AppError::client(format!("Missing cpu sampling in: {script}")));
            }
            Ok(())
        })
    }

    #[test]
    fn start_records_the_pid_and_liveness_follows() -> AppResult<()> {
        run_async_test(async {
            let host = behaved_host("lives:600").await?;
            let client = Arc::new(cmd_client("sleep 2")?);
            let file = none_file()?;
            let execution = resolved_execution(&host, &client, &file)?;
            execution.create_runner_connections().await?;
            client.prepare_host(&host).await?;
            client.prepare_execution(&execution).await?;
            client.start(&execution).await?;
            if !client.has_started(&execution) {
                return Err(AppError::client("Start not recorded"));
            }
            if !client.is_running(&execution).await? {
                return Err(AppError::client("Fresh process should be running"));
            }
            client.cleanup().await;
            Ok(())
        })
    }

    #[test]
    fn second_start_is_rejected() -> AppResult<()> {
        run_async_test(async {
            let host = prepared_host().await?;
            let client = Arc::new(cmd_client("sleep 2")?);
            let file = none_file()?;
            let execution = resolved_execution(&host, &client, &file)?;
            execution.create_runner_connections().await?;
            client.prepare_host(&host).await?;
            client.prepare_execution(&execution).await?;
            client.start(&execution).await?;
            match client.start(&execution).await {
                Err(AppError::Client(ClientError::AlreadyStarted { execution: 0, .. })) => {
                    client.cleanup().await;
                    Ok(())
                }
                Err(_) | Ok(()) => Err(AppError::client("Second start accepted")),
            }
        })
    }

    #[test]
    fn kill_marks_the_execution_stopped() -> AppResult<()> {
        run_async_test(async {
            let host = behaved_host("on-term").await?;
            let client = Arc::new(cmd_client("sleep 600")?);
            let file = none_file()?;
            let execution = resolved_execution(&host, &client, &file)?;
            execution.create_runner_connections().await?;
            client.prepare_host(&host).await?;
            client.prepare_execution(&execution).await?;
            client.start(&execution).await?;
            client.kill(&execution).await?;
            if !client.is_stopped(&execution) {
                return Err(AppError::client("Kill did not mark the execution stopped"));
            }
            if client.is_running(&execution).await? {
                return Err(AppError::client("Dead process reported running"));
            }
            client.cleanup().await;
            Ok(())
        })
    }
}
