//! How client programs get compiled.
//!
//! A [`BuilderDriver`] contributes a build command; running it in the
//! right source tree, locally or on a host, is shared here. `none`
//! skips the build for prebuilt programs, `make` runs plain `make`.

use std::path::Path;

use async_trait::async_trait;

use crate::artifact::SourceDriver;
use crate::artifact::source::run_local;
use crate::client::Client;
use crate::error::{AppError, AppResult, StageError};
use crate::host::{Host, Reuse};

/// Behavior of one builder subtype.
#[async_trait]
pub trait BuilderDriver: Send + Sync {
    /// The subtype name as used in scenario files.
    fn kind(&self) -> &'static str;

    /// The build command, or `None` when nothing needs compiling.
    fn build_command(&self, client: &Client) -> Option<String>;

    /// Build in the local source tree.
    ///
    /// # Errors
    ///
    /// Fails when the build command exits nonzero.
    async fn build_local(&self, client: &Client, source: &dyn SourceDriver) -> AppResult<()> {
        let Some(command) = self.build_command(client) else {
            return Ok(());
        };
        let location = source.local_location(client);
        run_local(&command, Path::new(&location))
            .await
            .map_err(|output| {
                AppError::stage(StageError::BuildFailed {
                    client: client.name().to_owned(),
                    location,
                    output,
                })
            })
    }

    /// Build in the host's source tree.
    ///
    /// # Errors
    ///
    /// Fails when the build command does not acknowledge success on
    /// the host.
    async fn build_remote(
        &self,
        client: &Client,
        host: &Host,
        source: &dyn SourceDriver,
    ) -> AppResult<()> {
        let Some(command) = self.build_command(client) else {
            return Ok(());
        };
        let location = source.remote_location(client, host)?;
        let reply = host
            .send_command(
                &format!("( cd \"{location}\"; {command} && echo && echo \"OK\" )"),
                &Reuse::Default,
            )
            .await?;
        if !reply.ends_with("OK") {
            return Err(AppError::stage(StageError::BuildFailed {
                client: client.name().to_owned(),
                location,
                output: reply,
            }));
        }
        Ok(())
    }
}

/// No build step; the source tree is used as delivered.
pub struct NoneBuilder;

#[must_use]
pub fn none_factory() -> Box<dyn BuilderDriver> {
    Box::new(NoneBuilder)
}

#[async_trait]
impl BuilderDriver for NoneBuilder {
    fn kind(&self) -> &'static str {
        "none"
    }

    fn build_command(&self, _client: &Client) -> Option<String> {
        None
    }
}

/// A plain `make` in the source tree.
pub struct MakeBuilder;

#[must_use]
pub fn make_factory() -> Box<dyn BuilderDriver> {
    Box::new(MakeBuilder)
}

#[async_trait]
impl BuilderDriver for MakeBuilder {
    fn kind(&self) -> &'static str {
        "make"
    }

    fn build_command(&self, _client: &Client) -> Option<String> {
        Some("make".to_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifact::source::DirectorySource;
    use crate::client::cmd;
    use crate::config::registry::ModuleRegistry;
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

    struct ShellBuilder(&'static str);

    #[async_trait]
    impl BuilderDriver for ShellBuilder {
        fn kind(&self) -> &'static str {
            "test__"
        }

        fn build_command(&self, _client: &Client) -> Option<String> {
            Some(self.0.to_owned())
        }
    }

    fn located_client(location: &str) -> AppResult<Client> {
        let mut client = Client::new(cmd::factory());
        client.parse_setting("name", "leech")?;
        client.parse_setting("command", "sleep 1")?;
        client.parse_setting("location", location)?;
        client.check_settings()?;
        client.resolve(&ModuleRegistry::with_builtins())?;
        Ok(client)
    }

    #[test]
    fn none_builder_skips_the_build() -> AppResult<()> {
        run_async_test(async {
            let builder = NoneBuilder;
            let client = located_client("/definitely/not/here")?;
            // No command, so the missing location is never touched.
            builder.build_local(&client, &DirectorySource).await
        })
    }

    #[test]
    fn make_builder_acknowledges_on_the_host() -> AppResult<()> {
        run_async_test(async {
            let scratch = tempfile::tempdir()?;
            let transcript = scratch.path().join("transcript.log");
            let mut host = Host::new(test_double::factory());
            host.parse_setting("name", "node1")?;
            host.parse_setting("transcript", &transcript.to_string_lossy())?;
            host.check_settings()?;
            host.prepare().await?;
            let client = located_client("/srv/build")?;
            let builder = MakeBuilder;
            builder.build_remote(&client, &host, &DirectorySource).await?;
            host.cleanup().await;
            let log = std::fs::read_to_string(&transcript)?;
            if !log.contains("( cd \"/srv/build\"; make && echo && echo \"OK\" )") {
                return Err(AppError::stage(StageError::TestExpectationValue {
                    message: "Build command not sent",
                    value: log,
                }));
            }
            Ok(())
        })
    }

    #[test]
    fn failed_builds_surface_their_output() -> AppResult<()> {
        run_async_test(async {
            let scratch = tempfile::tempdir()?;
            let client = located_client(&scratch.path().to_string_lossy())?;
            let builder = ShellBuilder("echo broken >&2; exit 2");
            match builder.build_local(&client, &DirectorySource).await {
                Err(AppError::Stage(StageError::BuildFailed { output, .. }))
                    if output.contains("broken") =>
                {
                    Ok(())
                }
                Err(_) | Ok(()) => Err(AppError::stage("Build failure not surfaced")),
            }
        })
    }
}
