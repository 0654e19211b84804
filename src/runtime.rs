//! Shared state for one campaign run.
//!
//! Every component receives an explicit [`RunContext`] instead of reaching
//! for globals: it carries the campaign identity, the results directory,
//! the `err.log` sink and the interrupt latch that polling loops check.

use std::fs::{File, OpenOptions};
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::Local;

use crate::error::{AppError, AppResult, ConfigError};
use crate::shutdown::{ShutdownReceiver, ShutdownSender};

/// Timestamp format for campaign identifiers, e.g. `2026.08.25-14.03.59`.
const CAMPAIGN_ID_FORMAT: &str = "%Y.%m.%d-%H.%M.%S";
/// Timestamp format for `err.log` entries.
const ERR_LOG_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";
/// Error log file name inside the campaign results directory.
const ERR_LOG_NAME: &str = "err.log";
/// Subdirectory of the campaign results directory holding per-scenario results.
const SCENARIOS_DIR_NAME: &str = "scenarios";

/// Produce a fresh campaign identifier from the wall clock.
#[must_use]
pub fn campaign_id() -> String {
    Local::now().format(CAMPAIGN_ID_FORMAT).to_string()
}

/// Context shared by everything that runs under one campaign.
pub struct RunContext {
    campaign_name: String,
    results_dir: PathBuf,
    err_log: Mutex<Option<File>>,
    shutdown: ShutdownSender,
    interrupted: AtomicBool,
}

impl RunContext {
    /// Create the campaign results directory and open its `err.log`.
    ///
    /// # Errors
    ///
    /// Fails when the directory already exists or cannot be created.
    pub fn new(
        campaign_name: &str,
        results_root: &Path,
        shutdown: ShutdownSender,
    ) -> AppResult<Self> {
        let results_dir = results_root.join(campaign_name);
        if results_dir.exists() {
            return Err(AppError::config(ConfigError::ResultsDirUnusable {
                path: results_dir,
            }));
        }
        std::fs::create_dir_all(&results_dir).map_err(|source| {
            AppError::config(ConfigError::CreateDir {
                path: results_dir.clone(),
                source,
            })
        })?;
        let err_path = results_dir.join(ERR_LOG_NAME);
        let err_log = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&err_path)
            .map_err(|source| {
                AppError::config(ConfigError::WriteFile {
                    path: err_path,
                    source,
                })
            })?;
        Ok(Self {
            campaign_name: campaign_name.to_owned(),
            results_dir,
            err_log: Mutex::new(Some(err_log)),
            shutdown,
            interrupted: AtomicBool::new(false),
        })
    }

    /// A context without a results directory, for runs that only salvage
    /// existing results. Errors go to the console only.
    #[must_use]
    pub fn detached(campaign_name: &str, shutdown: ShutdownSender) -> Self {
        Self {
            campaign_name: campaign_name.to_owned(),
            results_dir: PathBuf::new(),
            err_log: Mutex::new(None),
            shutdown,
            interrupted: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub fn campaign_name(&self) -> &str {
        &self.campaign_name
    }

    #[must_use]
    pub fn results_dir(&self) -> &Path {
        &self.results_dir
    }

    #[must_use]
    pub fn scenarios_dir(&self) -> PathBuf {
        self.results_dir.join(SCENARIOS_DIR_NAME)
    }

    #[must_use]
    pub fn err_log_path(&self) -> PathBuf {
        self.results_dir.join(ERR_LOG_NAME)
    }

    /// Record an error against a source identifier (host name, execution
    /// number, ...). Written to `err.log` and the console; never fails.
    pub fn report_error(&self, scope: &str, error: &AppError) {
        tracing::error!("{}: {}", scope, error);
        self.append_err_line(scope, &error.to_string());
    }

    /// Record a cleanup or salvage warning. Same sinks as [`Self::report_error`].
    pub fn report_warning(&self, scope: &str, message: &str) {
        tracing::warn!("{}: {}", scope, message);
        self.append_err_line(scope, message);
    }

    fn append_err_line(&self, scope: &str, message: &str) {
        let Ok(mut guard) = self.err_log.lock() else {
            return;
        };
        if let Some(file) = guard.as_mut() {
            let stamp = Local::now().format(ERR_LOG_TIME_FORMAT);
            let line = format!("[{}] {}: {}\n", stamp, scope, message);
            if let Err(err) = file.write_all(line.as_bytes()) {
                tracing::warn!("Could not append to err.log: {}", err);
            }
        }
    }

    /// Latch the interrupt flag and wake sleepers.
    pub fn interrupt(&self) {
        self.interrupted.store(true, Ordering::SeqCst);
        drop(self.shutdown.send(()));
    }

    #[must_use]
    pub fn is_interrupted(&self) -> bool {
        self.interrupted.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn subscribe_shutdown(&self) -> ShutdownReceiver {
        self.shutdown.subscribe()
    }
}
