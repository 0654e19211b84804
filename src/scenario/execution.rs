//! One scheduled client run.
//!
//! An execution ties a client to a host and a set of files: the client
//! runs once on that host to move those files. Executions are declared
//! with object names; the config reader resolves the names into shared
//! objects after every section has been parsed. Each execution gets two
//! dedicated connections at runtime, one that blocks on the runner
//! script and one for liveness probes and signals while the first is
//! busy.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::artifact::FileObject;
use crate::client::Client;
use crate::config::syntax::{parse_seconds, split_reference, validate_name};
use crate::error::{AppError, AppResult, ConfigError, ScenarioError};
use crate::host::{Connection, Host};
use crate::pipeline::Parser;

/// Section label for error messages.
const SECTION: &str = "execution";

#[derive(Default)]
struct Resolved {
    host: Option<Arc<Host>>,
    client: Option<Arc<Client>>,
    files: Vec<Arc<FileObject>>,
    parsers: Vec<Arc<Parser>>,
}

#[derive(Default)]
struct Channels {
    execution: Option<Arc<Connection>>,
    runner: Option<Arc<Connection>>,
}

pub struct Execution {
    number: usize,
    host_name: Option<String>,
    client_name: Option<String>,
    file_refs: Vec<String>,
    parser_names: Vec<String>,
    seeder: bool,
    keep_seeding: bool,
    timeout: Option<Duration>,
    multiply: Option<usize>,
    resolved: Resolved,
    channels: Mutex<Channels>,
}

impl Execution {
    #[must_use]
    pub fn new(number: usize) -> Self {
        Self {
            number,
            host_name: None,
            client_name: None,
            file_refs: Vec::new(),
            parser_names: Vec::new(),
            seeder: false,
            keep_seeding: false,
            timeout: None,
            multiply: None,
            resolved: Resolved::default(),
            channels: Mutex::new(Channels::default()),
        }
    }

    /// Parse one `key=value` setting.
    ///
    /// # Errors
    ///
    /// Fails on unknown keys, duplicates of single-valued keys and
    /// malformed values.
    pub fn parse_setting(&mut self, key: &str, value: &str) -> AppResult<()> {
        match key {
            "host" => {
                if self.host_name.is_some() {
                    return Err(duplicate(key));
                }
                validate_name(value).map_err(|source| invalid(key, source))?;
                self.host_name = Some(value.to_owned());
            }
            "client" => {
                if self.client_name.is_some() {
                    return Err(duplicate(key));
                }
                validate_name(value).map_err(|source| invalid(key, source))?;
                self.client_name = Some(value.to_owned());
            }
            "file" => {
                let (name, _) = split_reference(value);
                validate_name(name).map_err(|source| invalid(key, source))?;
                self.file_refs.push(value.to_owned());
            }
            "parser" => {
                validate_name(value).map_err(|source| invalid(key, source))?;
                self.parser_names.push(value.to_owned());
            }
            "seeder" => {
                if !value.is_empty() {
                    self.seeder = true;
                }
            }
            "timeout" => {
                if self.timeout.is_some() {
                    return Err(duplicate(key));
                }
                let timeout = parse_seconds(value).map_err(|source| invalid(key, source))?;
                self.timeout = Some(timeout);
            }
            "keepSeeding" => {
                if !value.is_empty() {
                    self.keep_seeding = true;
                }
            }
            "multiply" => {
                if self.multiply.is_some() {
                    return Err(duplicate(key));
                }
                let count =
                    crate::config::syntax::parse_positive_u64(value).map_err(|source| {
                        invalid(key, source)
                    })?;
                self.multiply = Some(usize::try_from(count).unwrap_or(usize::MAX));
            }
            _ => {
                return Err(AppError::config(ConfigError::UnknownParameter {
                    section: SECTION.to_owned(),
                    key: key.to_owned(),
                }));
            }
        }
        Ok(())
    }

    /// Validate completeness after all settings were parsed.
    ///
    /// # Errors
    ///
    /// Fails when host, client or file is missing.
    pub fn check_settings(&mut self) -> AppResult<()> {
        if self.host_name.is_none() {
            return Err(missing("host"));
        }
        if self.client_name.is_none() {
            return Err(missing("client"));
        }
        if self.file_refs.is_empty() {
            return Err(missing("file"));
        }
        if self.keep_seeding && !self.seeder {
            tracing::warn!(
                "Execution {} wants to keep seeding but is not a seeder.",
                self.number
            );
        }
        Ok(())
    }

    /// Attach the resolved objects. Called once by the config reader
    /// with the first file; further files come in through
    /// [`Self::attach_file`].
    pub fn resolve(
        &mut self,
        host: Arc<Host>,
        client: Arc<Client>,
        file: Arc<FileObject>,
        parsers: Vec<Arc<Parser>>,
    ) {
        self.resolved.host = Some(host);
        self.resolved.client = Some(client);
        self.resolved.files.push(file);
        self.resolved.parsers = parsers;
    }

    pub fn attach_file(&mut self, file: Arc<FileObject>) {
        self.resolved.files.push(file);
    }

    /// A copy with a fresh number, sharing all parsed settings but no
    /// resolved objects or connections. Used for `multiply` expansion.
    #[must_use]
    pub fn duplicate(&self, number: usize) -> Self {
        Self {
            number,
            host_name: self.host_name.clone(),
            client_name: self.client_name.clone(),
            file_refs: self.file_refs.clone(),
            parser_names: self.parser_names.clone(),
            seeder: self.seeder,
            keep_seeding: self.keep_seeding,
            timeout: self.timeout,
            multiply: None,
            resolved: Resolved::default(),
            channels: Mutex::new(Channels::default()),
        }
    }

    #[must_use]
    pub const fn number(&self) -> usize {
        self.number
    }

    #[must_use]
    pub const fn is_seeder(&self) -> bool {
        self.seeder
    }

    #[must_use]
    pub const fn keeps_seeding(&self) -> bool {
        self.keep_seeding
    }

    #[must_use]
    pub fn timeout(&self) -> Duration {
        self.timeout.unwrap_or(Duration::ZERO)
    }

    #[must_use]
    pub fn has_timeout(&self) -> bool {
        self.timeout.is_some_and(|timeout| !timeout.is_zero())
    }

    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = Some(timeout);
    }

    /// How many executions this declaration expands into.
    #[must_use]
    pub fn multiply(&self) -> usize {
        self.multiply.unwrap_or(1)
    }

    #[must_use]
    pub fn host_name(&self) -> Option<&str> {
        self.host_name.as_deref()
    }

    #[must_use]
    pub fn client_name(&self) -> Option<&str> {
        self.client_name.as_deref()
    }

    /// The declared file references, `@` selection arguments included.
    #[must_use]
    pub fn file_refs(&self) -> &[String] {
        &self.file_refs
    }

    #[must_use]
    pub fn parser_names(&self) -> &[String] {
        &self.parser_names
    }

    /// # Errors
    ///
    /// Fails when the execution was never resolved.
    pub fn host(&self) -> AppResult<Arc<Host>> {
        self.resolved
            .host
            .clone()
            .ok_or_else(|| self.unresolved("host"))
    }

    /// # Errors
    ///
    /// Fails when the execution was never resolved.
    pub fn client(&self) -> AppResult<Arc<Client>> {
        self.resolved
            .client
            .clone()
            .ok_or_else(|| self.unresolved("client"))
    }

    /// The first declared file.
    ///
    /// # Errors
    ///
    /// Fails when the execution was never resolved.
    pub fn file(&self) -> AppResult<Arc<FileObject>> {
        self.resolved
            .files
            .first()
            .cloned()
            .ok_or_else(|| self.unresolved("file"))
    }

    #[must_use]
    pub fn files(&self) -> &[Arc<FileObject>] {
        &self.resolved.files
    }

    #[must_use]
    pub fn parsers(&self) -> &[Arc<Parser>] {
        &self.resolved.parsers
    }

    /// Open the two dedicated connections on the resolved host.
    ///
    /// # Errors
    ///
    /// Fails when the host is unresolved or refuses connections.
    pub async fn create_runner_connections(&self) -> AppResult<()> {
        let host = self.host()?;
        let execution = host.create_connection().await?;
        let runner = host.create_connection().await?;
        let mut channels = lock_channels(&self.channels);
        channels.execution = Some(execution);
        channels.runner = Some(runner);
        Ok(())
    }

    /// The connection that blocks on the runner script.
    ///
    /// # Errors
    ///
    /// Fails when no connections were created yet.
    pub fn execution_connection(&self) -> AppResult<Arc<Connection>> {
        lock_channels(&self.channels)
            .execution
            .clone()
            .ok_or_else(|| self.no_connections())
    }

    /// The connection for probes and signals.
    ///
    /// # Errors
    ///
    /// Fails when no connections were created yet.
    pub fn runner_connection(&self) -> AppResult<Arc<Connection>> {
        lock_channels(&self.channels)
            .runner
            .clone()
            .ok_or_else(|| self.no_connections())
    }

    /// Close and drop the dedicated connections.
    pub async fn close_connections(&self) {
        let (execution, runner) = {
            let mut channels = lock_channels(&self.channels);
            (channels.execution.take(), channels.runner.take())
        };
        if let Ok(host) = self.host() {
            if let Some(connection) = execution {
                host.close_connection(&connection).await;
            }
            if let Some(connection) = runner {
                host.close_connection(&connection).await;
            }
        }
    }

    fn unresolved(&self, what: &'static str) -> AppError {
        AppError::scenario(ScenarioError::Unresolved {
            execution: self.number,
            what,
        })
    }

    fn no_connections(&self) -> AppError {
        AppError::scenario(ScenarioError::ConnectionsMissing {
            execution: self.number,
        })
    }
}

fn lock_channels(channels: &Mutex<Channels>) -> std::sync::MutexGuard<'_, Channels> {
    match channels.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn duplicate(key: &str) -> AppError {
    AppError::config(ConfigError::DuplicateParameter {
        section: SECTION.to_owned(),
        key: key.to_owned(),
    })
}

fn missing(key: &'static str) -> AppError {
    AppError::config(ConfigError::MissingParameter {
        section: SECTION.to_owned(),
        key,
    })
}

fn invalid(key: &str, source: crate::error::ValidationError) -> AppError {
    AppError::config(ConfigError::InvalidValue {
        key: key.to_owned(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::test_double;
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

    fn parsed_execution() -> AppResult<Execution> {
        let mut execution = Execution::new(7);
        execution.parse_setting("host", "node1")?;
        execution.parse_setting("client", "leech")?;
        execution.parse_setting("file", "payload@2")?;
        execution.parse_setting("file", "extra")?;
        execution.parse_setting("parser", "cpulog")?;
        execution.parse_setting("seeder", "yes")?;
        execution.parse_setting("keepSeeding", "x")?;
        execution.parse_setting("timeout", "2.5")?;
        execution.check_settings()?;
        Ok(execution)
    }

    #[test]
    fn settings_parse_with_references_intact() -> AppResult<()> {
        let execution = parsed_execution()?;
        if execution.file_refs() != ["payload@2", "extra"] {
            return Err(AppError::scenario("File references mangled"));
        }
        if !execution.is_seeder() || !execution.keeps_seeding() {
            return Err(AppError::scenario("Flags not parsed"));
        }
        if execution.timeout() != Duration::from_millis(2_500) {
            return Err(AppError::scenario("Timeout not parsed"));
        }
        if execution.parser_names() != ["cpulog"] {
            return Err(AppError::scenario("Parser names mangled"));
        }
        Ok(())
    }

    #[test]
    fn single_valued_keys_reject_duplicates() -> AppResult<()> {
        let mut execution = parsed_execution()?;
        for (key, value) in [("host", "other"), ("client", "other"), ("timeout", "1")] {
            match execution.parse_setting(key, value) {
                Err(AppError::Config(ConfigError::DuplicateParameter { .. })) => {}
                Err(_) | Ok(()) => {
                    return Err(AppError::scenario(ScenarioError::TestExpectationValue {
                        message: "Duplicate key accepted",
                        value: key.to_owned(),
                    }));
                }
            }
        }
        Ok(())
    }

    #[test]
    fn host_client_and_file_are_required() -> AppResult<()> {
        let mut execution = Execution::new(0);
        execution.parse_setting("host", "node1")?;
        execution.parse_setting("client", "leech")?;
        match execution.check_settings() {
            Err(AppError::Config(ConfigError::MissingParameter { key: "file", .. })) => Ok(()),
            Err(_) | Ok(()) => Err(AppError::scenario("File-less execution accepted")),
        }
    }

    #[test]
    fn multiply_defaults_to_one() -> AppResult<()> {
        let mut execution = Execution::new(0);
        if execution.multiply() != 1 {
            return Err(AppError::scenario("Default multiply is off"));
        }
        execution.parse_setting("multiply", "4")?;
        if execution.multiply() != 4 {
            return Err(AppError::scenario("Multiply not parsed"));
        }
        match execution.parse_setting("multiply", "2") {
            Err(AppError::Config(ConfigError::DuplicateParameter { .. })) => Ok(()),
            Err(_) | Ok(()) => Err(AppError::scenario("Second multiply accepted")),
        }
    }

    #[test]
    fn duplicates_share_settings_but_not_state() -> AppResult<()> {
        let execution = parsed_execution()?;
        let copy = execution.duplicate(12);
        if copy.number() != 12 {
            return Err(AppError::scenario("Copy kept the old number"));
        }
        if copy.host_name() != execution.host_name()
            || copy.file_refs() != execution.file_refs()
            || copy.timeout() != execution.timeout()
        {
            return Err(AppError::scenario("Copy lost settings"));
        }
        if copy.multiply() != 1 {
            return Err(AppError::scenario("Copy kept the multiply factor"));
        }
        match copy.host() {
            Err(AppError::Scenario(ScenarioError::Unresolved { .. })) => Ok(()),
            Err(_) | Ok(_) => Err(AppError::scenario("Copy kept resolved objects")),
        }
    }

    #[test]
    fn connections_live_on_the_resolved_host() -> AppResult<()> {
        run_async_test(async {
            let mut raw = Host::new(test_double::factory());
            raw.parse_setting("name", "node1")?;
            raw.check_settings()?;
            raw.prepare().await?;
            let host = Arc::new(raw);

            let mut client_raw = Client::new(crate::client::cmd::factory());
            client_raw.parse_setting("name", "leech")?;
            client_raw.parse_setting("command", "sleep 1")?;
            client_raw.check_settings()?;
            let client = Arc::new(client_raw);

            let mut file_raw = FileObject::new(crate::artifact::none_factory());
            file_raw.parse_setting("name", "payload")?;
            file_raw.check_settings()?;
            let file = Arc::new(file_raw);

            let mut execution = Execution::new(0);
            execution.parse_setting("host", "node1")?;
            execution.parse_setting("client", "leech")?;
            execution.parse_setting("file", "payload")?;
            execution.check_settings()?;

            match execution.execution_connection() {
                Err(AppError::Scenario(ScenarioError::ConnectionsMissing { .. })) => {}
                Err(_) | Ok(_) => {
                    return Err(AppError::scenario("Connection handed out before creation"));
                }
            }

            execution.resolve(Arc::clone(&host), client, file, Vec::new());
            execution.create_runner_connections().await?;
            let probe = execution.runner_connection()?;
            let reply = probe.send("echo \"ping\"").await?;
            if reply != "ping" {
                return Err(AppError::scenario(ScenarioError::TestExpectationValue {
                    message: "Probe connection dead",
                    value: reply,
                }));
            }
            execution.close_connections().await;
            match execution.runner_connection() {
                Err(AppError::Scenario(ScenarioError::ConnectionsMissing { .. })) => {}
                Err(_) | Ok(_) => {
                    return Err(AppError::scenario("Connections survive closing"));
                }
            }
            host.cleanup().await;
            Ok(())
        })
    }
}
