//! A client around an arbitrary shell command.
//!
//! Declared as `[client:cmd]`. The command runs from the client
//! directory with stdout and stderr captured into the execution's log
//! directory, so any program can take part in a scenario without a
//! dedicated subtype.

use std::path::Path;

use async_trait::async_trait;

use crate::client::{Client, ClientPlugin, CommandLine};
use crate::error::{AppError, AppResult, ConfigError, ValidationError};
use crate::scenario::execution::Execution;

pub struct CmdClient {
    command: String,
    link_data_in: bool,
}

#[must_use]
pub fn factory() -> Box<dyn ClientPlugin> {
    Box::new(CmdClient {
        command: String::new(),
        link_data_in: false,
    })
}

#[async_trait]
impl ClientPlugin for CmdClient {
    fn kind(&self) -> &'static str {
        "cmd"
    }

    fn parse_setting(&mut self, key: &str, value: &str) -> AppResult<bool> {
        match key {
            "command" => {
                if !self.command.is_empty() {
                    return Err(AppError::config(ConfigError::DuplicateParameter {
                        section: "client:cmd".to_owned(),
                        key: key.to_owned(),
                    }));
                }
                if value.is_empty() {
                    return Err(AppError::config(ConfigError::InvalidValue {
                        key: key.to_owned(),
                        source: ValidationError::ValueEmpty,
                    }));
                }
                self.command = value.to_owned();
            }
            "linkDataIn" => {
                self.link_data_in = !value.is_empty();
            }
            _ => return Ok(false),
        }
        Ok(true)
    }

    fn check_settings(&mut self, _name: &str) -> AppResult<()> {
        if self.command.is_empty() {
            return Err(AppError::config(ConfigError::MissingParameter {
                section: "client:cmd".to_owned(),
                key: "command",
            }));
        }
        Ok(())
    }

    /// An arbitrary command has no dedicated parser, but its profiling
    /// log is always worth a pass.
    fn default_parser(&self) -> &'static str {
        "cpulog"
    }

    fn links_data_in(&self) -> bool {
        self.link_data_in
    }

    fn command_line(&self, client: &Client, execution: &Execution) -> AppResult<CommandLine> {
        let log_dir = client.execution_log_dir(execution)?;
        let mut command = self.command.clone();
        if !client.extra_parameters().is_empty() {
            command.push(' ');
            command.push_str(client.extra_parameters());
        }
        Ok(CommandLine::Complex(format!(
            "{command} > \"{log_dir}/log.log\" 2> \"{log_dir}/err.log\""
        )))
    }

    async fn retrieve_logs(
        &self,
        client: &Client,
        execution: &Execution,
        local_dir: &Path,
    ) -> AppResult<()> {
        let host = execution.host()?;
        let log_dir = client.execution_log_dir(execution)?;
        client
            .fetch_if_present(&host, &format!("{log_dir}/log.log"), &local_dir.join("log.log"))
            .await?;
        client
            .fetch_if_present(&host, &format!("{log_dir}/err.log"), &local_dir.join("err.log"))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::FileObject;
    use crate::config::registry::ModuleRegistry;
    use crate::host::{self, Host};
    use std::future::Future;
    use std::sync::Arc;

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

    #[test]
    fn command_is_required() {
        let mut client = Client::new(factory());
        assert!(client.parse_setting("name", "leech").is_ok());
        assert!(client.check_settings().is_err());
    }

    #[test]
    fn duplicate_command_is_rejected() -> AppResult<()> {
        let mut client = Client::new(factory());
        client.parse_setting("command", "sleep 1")?;
        match client.parse_setting("command", "sleep 2") {
            Err(AppError::Config(ConfigError::DuplicateParameter { .. })) => Ok(()),
            Err(_) | Ok(()) => Err(AppError::client("Second command accepted")),
        }
    }

    #[test]
    fn command_line_captures_output_and_appends_params() -> AppResult<()> {
        run_async_test(async {
            let mut raw = Host::new(host::test_double::factory());
            raw.parse_setting("name", "node1")?;
            raw.check_settings()?;
            raw.prepare().await?;
            let node = Arc::new(raw);

            let mut bare = Client::new(factory());
            bare.parse_setting("name", "leech")?;
            bare.parse_setting("command", "./peer --join")?;
            bare.parse_setting("params", "--fast")?;
            bare.parse_setting("linkDataIn", "yes")?;
            bare.check_settings()?;
            bare.resolve(&ModuleRegistry::with_builtins())?;
            let client = Arc::new(bare);

            let mut file = FileObject::new(crate::artifact::none_factory());
            file.parse_setting("name", "payload")?;
            file.check_settings()?;
            let file = Arc::new(file);

            let mut execution = Execution::new(0);
            execution.parse_setting("host", "node1")?;
            execution.parse_setting("client", "leech")?;
            execution.parse_setting("file", "payload")?;
            execution.check_settings()?;
            execution.resolve(Arc::clone(&node), Arc::clone(&client), file, Vec::new());

            let log_dir = client.execution_log_dir(&execution)?;
            match client.plugin.command_line(&client, &execution)? {
                CommandLine::Complex(line) => {
                    let wanted = format!(
                        "./peer --join --fast > \"{log_dir}/log.log\" 2> \"{log_dir}/err.log\""
                    );
                    if line != wanted {
                        return Err(AppError::client(format!("Unexpected command line: {line}")));
                    }
                }
                CommandLine::Simple(_) => {
                    return Err(AppError::client("Compound command expected"));
                }
            }
            Ok(())
        })
    }
}
