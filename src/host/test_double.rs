//! An in-process host double for tests.
//!
//! Declared as `[host:test__]` in a scenario file. No channel leaves
//! the process: a small reply engine answers the command patterns the
//! framework sends (directory reservation, process starts, liveness
//! probes, signals) from bookkeeping kept in memory. Every command is
//! recorded, and optionally appended to a transcript file so end to
//! end tests can assert on what would have reached a real host.
//!
//! How synthetic processes respond to signals is configurable with the
//! `behavior` setting:
//!
//! * `immediate` — dead by the time it is first probed (default)
//! * `lives:N` — dies on its own after N seconds
//! * `on-term` — survives until a TERM arrives
//! * `on-int` — ignores TERM, dies on INT
//! * `immortal` — survives everything, even KILL

use std::collections::{HashMap, VecDeque};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;

use crate::error::{AppError, AppResult, ConfigError, ValidationError};
use crate::host::connection::COMMAND_BOUNDARY;
use crate::host::{CommandChannel, HostDriver};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Behavior {
    Immediate,
    LivesFor(u64),
    DiesOnTerm,
    DiesOnInt,
    Immortal,
}

struct SyntheticProcess {
    spawned: Instant,
    term_seen: bool,
    int_seen: bool,
    kill_seen: bool,
}

struct EngineState {
    processes: HashMap<u32, SyntheticProcess>,
    removed_dirs: Vec<String>,
    transcript: Vec<String>,
}

struct Engine {
    behavior: Behavior,
    transcript_path: Option<PathBuf>,
    next_pid: AtomicU32,
    next_dir: AtomicU32,
    state: Mutex<EngineState>,
}

impl Engine {
    fn new(behavior: Behavior, transcript_path: Option<PathBuf>) -> Self {
        Self {
            behavior,
            transcript_path,
            next_pid: AtomicU32::new(10_000),
            next_dir: AtomicU32::new(0),
            state: Mutex::new(EngineState {
                processes: HashMap::new(),
                removed_dirs: Vec::new(),
                transcript: Vec::new(),
            }),
        }
    }

    fn record(&self, entry: &str) {
        if let Ok(mut state) = self.state.lock() {
            state.transcript.push(entry.to_owned());
        }
        if let Some(path) = &self.transcript_path {
            let opened = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path);
            if let Ok(mut file) = opened {
                drop(writeln!(file, "{entry}"));
            }
        }
    }

    fn alive(&self, pid: u32) -> bool {
        let Ok(state) = self.state.lock() else {
            return false;
        };
        let Some(process) = state.processes.get(&pid) else {
            return false;
        };
        if process.kill_seen && self.behavior != Behavior::Immortal {
            return false;
        }
        match self.behavior {
            Behavior::Immediate => false,
            Behavior::LivesFor(seconds) => {
                process.spawned.elapsed() < Duration::from_secs(seconds)
            }
            Behavior::DiesOnTerm => !process.term_seen,
            Behavior::DiesOnInt => !process.int_seen,
            Behavior::Immortal => true,
        }
    }

    fn signal(&self, pid: u32, signal: &str) {
        let Ok(mut state) = self.state.lock() else {
            return;
        };
        if let Some(process) = state.processes.get_mut(&pid) {
            match signal {
                "TERM" => process.term_seen = true,
                "INT" => process.int_seen = true,
                "KILL" => process.kill_seen = true,
                _ => {}
            }
        }
    }

    fn quoted_path(command: &str) -> Option<&str> {
        let (_, rest) = command.split_once('"')?;
        let (path, _) = rest.split_once('"')?;
        Some(path)
    }

    fn pid_after(command: &str, prefix: &str) -> Option<u32> {
        command
            .strip_prefix(prefix)?
            .split_whitespace()
            .next()?
            .parse()
            .ok()
    }

    /// Answer one command block with output lines.
    fn respond(&self, command: &str) -> Vec<String> {
        self.record(command);
        let trimmed = command.trim();
        if trimmed == "mktemp -d" {
            let number = self.next_dir.fetch_add(1, Ordering::SeqCst);
            return vec![format!("/tmp/campaigner-double-{number}")];
        }
        if let Some(rest) = trimmed.strip_prefix("rm -rf ") {
            let victim = rest.trim_matches('"').to_owned();
            if let Ok(mut state) = self.state.lock() {
                state.removed_dirs.push(victim);
            }
            return Vec::new();
        }
        if trimmed.starts_with("[ -d ") {
            let path = Self::quoted_path(trimmed).unwrap_or_default();
            if trimmed.contains("|| echo") {
                let removed = match self.state.lock() {
                    Ok(state) => state.removed_dirs.iter().any(|gone| gone == path),
                    Err(_) => false,
                };
                return if removed {
                    vec!["E".to_owned()]
                } else {
                    Vec::new()
                };
            }
            // `[ -d x ] && echo ...`: nothing is ever a directory here.
            return Vec::new();
        }
        if trimmed.starts_with("[ -f ") {
            if trimmed.contains("&& echo \"F\"") {
                return vec!["F".to_owned()];
            }
            return Vec::new();
        }
        if trimmed.starts_with("[ -e ") {
            return Vec::new();
        }
        if let Some(pid) = Self::pid_after(trimmed, "kill -0 ") {
            return if self.alive(pid) {
                vec!["Y".to_owned()]
            } else {
                vec!["N".to_owned()]
            };
        }
        for signal in ["TERM", "INT", "KILL"] {
            if let Some(pid) = Self::pid_after(trimmed, &format!("kill -{signal} ")) {
                self.signal(pid, signal);
                return Vec::new();
            }
        }
        if trimmed.contains("echo $!")
            || (trimmed.starts_with('"') && trimmed.ends_with("/runner.sh\""))
        {
            let pid = self.next_pid.fetch_add(1, Ordering::SeqCst);
            if let Ok(mut state) = self.state.lock() {
                state.processes.insert(
                    pid,
                    SyntheticProcess {
                        spawned: Instant::now(),
                        term_seen: false,
                        int_seen: false,
                        kill_seen: false,
                    },
                );
            }
            return vec![pid.to_string()];
        }
        if trimmed.contains("&& echo \"OK\" || echo \"NO\"") || trimmed.starts_with("( dbgfile=") {
            return vec!["OK".to_owned()];
        }
        if trimmed.ends_with("&& echo && echo \"OK\"") || trimmed.ends_with("&& echo && echo \"OK\" )")
        {
            return vec![String::new(), "OK".to_owned()];
        }
        if trimmed.starts_with("date '+%s") {
            let now = std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default();
            return vec![format!("{}.{:09}", now.as_secs(), now.subsec_nanos())];
        }
        if let Some(text) = trimmed.strip_prefix("echo ") {
            return vec![text.trim_matches('"').to_owned()];
        }
        Vec::new()
    }
}

struct TestChannel {
    engine: Arc<Engine>,
    inbox: VecDeque<String>,
}

#[async_trait]
impl CommandChannel for TestChannel {
    async fn write_text(&mut self, text: &str) -> AppResult<()> {
        let tail = format!("\n# `\n# '\n# \"\necho \"\n{COMMAND_BOUNDARY}\"\n");
        let (command, framed) = match text.strip_suffix(&tail) {
            Some(command) => (command, true),
            None => (text, false),
        };
        let output = self.engine.respond(command);
        self.inbox.extend(output);
        if framed {
            self.inbox.push_back(COMMAND_BOUNDARY.to_owned());
        }
        Ok(())
    }

    async fn read_line(&mut self) -> AppResult<Option<String>> {
        Ok(self.inbox.pop_front())
    }

    async fn close(&mut self) -> AppResult<()> {
        Ok(())
    }
}

pub struct TestHostDriver {
    behavior: Behavior,
    transcript_path: Option<PathBuf>,
    subnet: String,
    address: String,
    engine: Mutex<Option<Arc<Engine>>>,
}

#[must_use]
pub fn factory() -> Box<dyn HostDriver> {
    Box::new(TestHostDriver {
        behavior: Behavior::Immediate,
        transcript_path: None,
        subnet: "10.99.0.0/24".to_owned(),
        address: "10.99.0.1".to_owned(),
        engine: Mutex::new(None),
    })
}

impl TestHostDriver {
    fn engine(&self) -> Arc<Engine> {
        let mut guard = match self.engine.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(engine) = guard.as_ref() {
            return Arc::clone(engine);
        }
        let engine = Arc::new(Engine::new(self.behavior, self.transcript_path.clone()));
        *guard = Some(Arc::clone(&engine));
        engine
    }
}

#[async_trait]
impl HostDriver for TestHostDriver {
    fn kind(&self) -> &'static str {
        "test__"
    }

    fn parse_setting(&mut self, key: &str, value: &str) -> AppResult<bool> {
        match key {
            "behavior" => {
                self.behavior = if value == "immediate" {
                    Behavior::Immediate
                } else if value == "on-term" {
                    Behavior::DiesOnTerm
                } else if value == "on-int" {
                    Behavior::DiesOnInt
                } else if value == "immortal" {
                    Behavior::Immortal
                } else if let Some(seconds) = value.strip_prefix("lives:") {
                    let lifetime =
                        crate::config::syntax::parse_positive_u64(seconds).map_err(|source| {
                            AppError::config(ConfigError::InvalidValue {
                                key: key.to_owned(),
                                source,
                            })
                        })?;
                    Behavior::LivesFor(lifetime)
                } else {
                    return Err(AppError::config(ConfigError::InvalidValue {
                        key: key.to_owned(),
                        source: ValidationError::InvalidName {
                            value: value.to_owned(),
                        },
                    }));
                };
            }
            "transcript" => {
                if value.is_empty() {
                    return Err(AppError::config(ConfigError::InvalidValue {
                        key: key.to_owned(),
                        source: ValidationError::ValueEmpty,
                    }));
                }
                self.transcript_path = Some(PathBuf::from(value));
            }
            "subnet" => self.subnet = value.to_owned(),
            "address" => self.address = value.to_owned(),
            _ => return Ok(false),
        }
        Ok(true)
    }

    fn check_settings(&mut self, _name: &str) -> AppResult<()> {
        Ok(())
    }

    async fn open_channel(&self, _name: &str) -> AppResult<Box<dyn CommandChannel>> {
        Ok(Box::new(TestChannel {
            engine: self.engine(),
            inbox: VecDeque::new(),
        }))
    }

    async fn push_file(&self, _name: &str, local: &Path, remote: &str) -> AppResult<()> {
        self.engine()
            .record(&format!("PUSH {} {}", local.display(), remote));
        Ok(())
    }

    async fn pull_file(&self, _name: &str, remote: &str, local: &Path) -> AppResult<()> {
        let engine = self.engine();
        engine.record(&format!("PULL {} {}", remote, local.display()));
        // Logs and other retrieved files come back empty.
        std::fs::write(local, b"")?;
        Ok(())
    }

    fn subnet(&self) -> String {
        self.subnet.clone()
    }

    fn address(&self) -> String {
        self.address.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::Host;
    use crate::host::connection::Connection;
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

    async fn double_connection(behavior: &str) -> AppResult<Arc<Connection>> {
        let mut driver = factory();
        if !driver.parse_setting("behavior", behavior)? {
            return Err(AppError::host("Behavior setting not recognized"));
        }
        driver.check_settings("double")?;
        let link = driver.open_channel("double").await?;
        Ok(Connection::new(0, "double", link))
    }

    #[test]
    fn directory_dance_tracks_removal() -> AppResult<()> {
        run_async_test(async {
            let connection = double_connection("immediate").await?;
            let dir = connection.send("mktemp -d").await?;
            if !dir.starts_with("/tmp/campaigner-double-") {
                return Err(AppError::host("Unexpected temp directory"));
            }
            let before = connection
                .send(&format!("[ -d \"{dir}\" ] || echo \"E\""))
                .await?;
            if before == "E" {
                return Err(AppError::host("Fresh directory reported missing"));
            }
            connection.send(&format!("rm -rf \"{dir}\"")).await?;
            let after = connection
                .send(&format!("[ -d \"{dir}\" ] || echo \"E\""))
                .await?;
            if after != "E" {
                return Err(AppError::host("Removed directory reported present"));
            }
            Ok(())
        })
    }

    #[test]
    fn processes_follow_their_behavior() -> AppResult<()> {
        run_async_test(async {
            let connection = double_connection("on-term").await?;
            let pid = connection.send("cd /tmp\nsleep 100 &\necho $!").await?;
            let probe = format!("kill -0 {pid} > /dev/null 2> /dev/null && echo \"Y\" || echo \"N\"");
            if connection.send(&probe).await? != "Y" {
                return Err(AppError::host("Fresh process should be running"));
            }
            connection
                .send(&format!("kill -TERM {pid} > /dev/null 2> /dev/null"))
                .await?;
            if connection.send(&probe).await? != "N" {
                return Err(AppError::host("TERM should have killed it"));
            }
            Ok(())
        })
    }

    #[test]
    fn immortal_processes_survive_kill() -> AppResult<()> {
        run_async_test(async {
            let connection = double_connection("immortal").await?;
            let pid = connection.send("run &\necho $!").await?;
            connection
                .send(&format!("kill -KILL {pid} > /dev/null 2> /dev/null"))
                .await?;
            let probe = format!("kill -0 {pid} > /dev/null 2> /dev/null && echo \"Y\" || echo \"N\"");
            if connection.send(&probe).await? != "Y" {
                return Err(AppError::host("Immortal process died"));
            }
            Ok(())
        })
    }
}
