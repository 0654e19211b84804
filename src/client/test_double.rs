//! An in-process client double for tests.
//!
//! Declared as `[client:test__]` in a scenario file. Instead of
//! shipping a program it assembles a tiny script on the host that
//! prints a banner and sleeps for `testTime` seconds, so whole
//! scenarios can run against hosts that are doubles themselves.

use std::path::Path;

use async_trait::async_trait;

use crate::client::{Client, ClientPlugin, CommandLine};
use crate::error::{AppError, AppResult, ConfigError};
use crate::host::{Host, Reuse};
use crate::scenario::execution::Execution;

pub struct TestClient {
    test_time: Option<u64>,
}

#[must_use]
pub fn factory() -> Box<dyn ClientPlugin> {
    Box::new(TestClient { test_time: None })
}

impl TestClient {
    fn test_time(&self) -> u64 {
        self.test_time.unwrap_or(1)
    }
}

#[async_trait]
impl ClientPlugin for TestClient {
    fn kind(&self) -> &'static str {
        "test__"
    }

    fn parse_setting(&mut self, key: &str, value: &str) -> AppResult<bool> {
        if key == "testTime" {
            let seconds = crate::config::syntax::parse_positive_u64(value).map_err(|source| {
                AppError::config(ConfigError::InvalidValue {
                    key: key.to_owned(),
                    source,
                })
            })?;
            self.test_time = Some(seconds);
            return Ok(true);
        }
        Ok(false)
    }

    fn check_settings(&mut self, _name: &str) -> AppResult<()> {
        Ok(())
    }

    /// The double only ever produces the shared profiling log, so that
    /// is what gets parsed when nothing else is declared.
    fn default_parser(&self) -> &'static str {
        "cpulog"
    }

    fn command_line(&self, client: &Client, execution: &Execution) -> AppResult<CommandLine> {
        let log_dir = client.execution_log_dir(execution)?;
        Ok(CommandLine::Simple(format!(
            "./client_bin > \"{log_dir}/log.log\""
        )))
    }

    /// Assembles `client_bin` in the client directory line by line, so
    /// no file transfer is needed for the double to run.
    async fn prepare_host(&self, client: &Client, host: &Host) -> AppResult<()> {
        let path = format!("{}/client_bin", client.client_dir(host)?);
        let lines = [
            "#!/bin/bash".to_owned(),
            "cat <<232EOF454".to_owned(),
            format!("test client {}", client.name()),
            format!("test time: {}", self.test_time()),
            "232EOF454".to_owned(),
            format!("sleep {}", self.test_time()),
        ];
        host.send_command(&format!("touch \"{path}\""), &Reuse::Default)
            .await?;
        let mut redirect = ">";
        for line in lines {
            host.send_command(&format!("echo '{line}' {redirect} \"{path}\""), &Reuse::Default)
                .await?;
            redirect = ">>";
        }
        host.send_command(&format!("chmod +x \"{path}\""), &Reuse::Default)
            .await?;
        Ok(())
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
            .await
    }
}
