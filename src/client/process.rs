//! Remote client processes and the signal ladder that ends them.
//!
//! A started execution is represented by a [`RemoteProcess`]: the pid
//! the runner script echoed plus the connection liveness probes go
//! over. Per client, a [`ProcessTable`] tracks every execution's
//! process through not-started, running and stopped.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::error::{AppError, AppResult, ClientError};
use crate::host::Connection;

/// Signals used when ending a client.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Sig {
    Term,
    Int,
    Kill,
}

impl Sig {
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Term => "TERM",
            Self::Int => "INT",
            Self::Kill => "KILL",
        }
    }
}

/// The escalation ladder: each step optionally sends a signal, then
/// waits the given seconds before probing liveness again. Totals 40
/// seconds for a process that never dies.
const KILL_LADDER: &[(Option<Sig>, u64)] = &[
    (Some(Sig::Term), 1),
    (None, 1),
    (None, 1),
    (None, 2),
    (None, 5),
    (None, 5),
    (None, 5),
    (None, 5),
    (Some(Sig::Int), 5),
    (Some(Sig::Int), 5),
    (Some(Sig::Kill), 5),
];

/// A running client process on a host.
pub struct RemoteProcess {
    pid: u32,
    client: String,
    host: String,
    probe: Arc<Connection>,
}

impl RemoteProcess {
    #[must_use]
    pub fn new(pid: u32, client: &str, host: &str, probe: Arc<Connection>) -> Self {
        Self {
            pid,
            client: client.to_owned(),
            host: host.to_owned(),
            probe,
        }
    }

    #[must_use]
    pub const fn pid(&self) -> u32 {
        self.pid
    }

    #[must_use]
    pub fn client(&self) -> &str {
        &self.client
    }

    #[must_use]
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Probe liveness over the connection the process was started
    /// through.
    ///
    /// # Errors
    ///
    /// Fails when the connection breaks or answers gibberish.
    pub async fn is_alive(&self) -> AppResult<bool> {
        self.is_alive_via(&self.probe).await
    }

    /// Probe liveness over a caller-provided connection, for cleanup
    /// paths that no longer trust the original one.
    ///
    /// # Errors
    ///
    /// Fails when the connection breaks or answers gibberish.
    pub async fn is_alive_via(&self, connection: &Arc<Connection>) -> AppResult<bool> {
        let command = format!(
            "kill -0 {} > /dev/null 2> /dev/null && echo \"Y\" || echo \"N\"",
            self.pid
        );
        let reply = connection.send(&command).await?;
        match reply.as_str() {
            "Y" => Ok(true),
            "N" => Ok(false),
            _ => Err(AppError::client(ClientError::StatusUnparsable {
                client: self.client.clone(),
                host: self.host.clone(),
                output: reply,
            })),
        }
    }

    /// Send one signal. Delivery failures are invisible: the command
    /// discards the shell's output.
    ///
    /// # Errors
    ///
    /// Fails when the connection breaks.
    pub async fn signal(&self, signal: Sig) -> AppResult<()> {
        self.signal_via(&self.probe, signal).await
    }

    /// Send one signal over a caller-provided connection.
    ///
    /// # Errors
    ///
    /// Fails when the connection breaks.
    pub async fn signal_via(&self, connection: &Arc<Connection>, signal: Sig) -> AppResult<()> {
        let command = format!(
            "kill -{} {} > /dev/null 2> /dev/null",
            signal.name(),
            self.pid
        );
        connection.send(&command).await?;
        Ok(())
    }

    /// Walk the signal ladder until the process dies. Returns whether
    /// it did; a survivor is the caller's problem to report.
    ///
    /// # Errors
    ///
    /// Fails when the connection breaks mid-ladder.
    pub async fn terminate(&self) -> AppResult<bool> {
        self.terminate_via(&self.probe).await
    }

    /// Walk the signal ladder over a caller-provided connection.
    ///
    /// # Errors
    ///
    /// Fails when the connection breaks mid-ladder.
    pub async fn terminate_via(&self, connection: &Arc<Connection>) -> AppResult<bool> {
        self.walk_ladder(connection, KILL_LADDER).await
    }

    async fn walk_ladder(
        &self,
        connection: &Arc<Connection>,
        ladder: &[(Option<Sig>, u64)],
    ) -> AppResult<bool> {
        for (signal, wait) in ladder {
            if let Some(signal) = signal {
                self.signal_via(connection, *signal).await?;
            }
            tokio::time::sleep(Duration::from_secs(*wait)).await;
            if !self.is_alive_via(connection).await? {
                return Ok(true);
            }
        }
        Ok(false)
    }
}

enum Entry {
    Running(Arc<RemoteProcess>),
    Stopped,
}

/// Per-client book of processes, keyed by execution number.
pub struct ProcessTable {
    entries: Mutex<HashMap<usize, Entry>>,
}

impl Default for ProcessTable {
    fn default() -> Self {
        Self::new()
    }
}

impl ProcessTable {
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<usize, Entry>> {
        match self.entries.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Record a freshly started process for an execution.
    ///
    /// # Errors
    ///
    /// Fails when the execution already has a process, started or
    /// stopped; starts are at most once.
    pub fn register(&self, execution: usize, process: Arc<RemoteProcess>) -> AppResult<()> {
        let mut entries = self.lock();
        if entries.contains_key(&execution) {
            return Err(AppError::client(ClientError::AlreadyStarted {
                execution,
                client: process.client().to_owned(),
            }));
        }
        entries.insert(execution, Entry::Running(process));
        Ok(())
    }

    /// The running process for an execution, if any.
    #[must_use]
    pub fn running(&self, execution: usize) -> Option<Arc<RemoteProcess>> {
        match self.lock().get(&execution) {
            Some(Entry::Running(process)) => Some(Arc::clone(process)),
            Some(Entry::Stopped) | None => None,
        }
    }

    /// Whether a start was ever recorded for the execution.
    #[must_use]
    pub fn has_started(&self, execution: usize) -> bool {
        self.lock().contains_key(&execution)
    }

    /// Whether the execution's process was confirmed dead.
    #[must_use]
    pub fn is_stopped(&self, execution: usize) -> bool {
        matches!(self.lock().get(&execution), Some(Entry::Stopped))
    }

    /// Mark the execution's process as confirmed dead.
    pub fn mark_stopped(&self, execution: usize) {
        self.lock().insert(execution, Entry::Stopped);
    }
}
