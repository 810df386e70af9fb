//! Periodic CSV logger.
//!
//! While a script runs, a [`PeriodicLogger`] samples every signal of the
//! frozen [`LogSet`] once per period and appends one row to a CSV file:
//!
//! ```text
//! Timestamp,"Galil RBV","ION Power"
//! 2024-05-02T14:03:11.000125,-0.200000,4012.338811
//! ```
//!
//! The header is written only when the file did not exist before the tick.
//! The file is opened in append mode for every row; no handle is held between
//! ticks. Write failures are reported with `error!` and the logger carries on
//! with the next tick. Stopping takes effect even while a row is being
//! sampled; that row is abandoned.

use anyhow::Context;
use chrono::Local;
use csv::{QuoteStyle, Terminator, WriterBuilder};
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info};

use crate::error::{AppResult, DaqError};
use crate::hardware::{Signal, SignalValue};

/// Timestamp column format (local time, microseconds).
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.6f";

// =============================================================================
// LogSet
// =============================================================================

/// Ordered set of signals to sample, keyed by display name.
#[derive(Clone, Default)]
pub struct LogSet {
    entries: Vec<(String, Arc<dyn Signal>)>,
}

impl LogSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `signal` under `name`. Returns `false` (and keeps the original
    /// position) if the name is already registered.
    pub fn insert(&mut self, name: impl Into<String>, signal: Arc<dyn Signal>) -> bool {
        let name = name.into();
        if self.contains(&name) {
            return false;
        }
        self.entries.push((name, signal));
        true
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.iter().any(|(n, _)| n == name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(name, _)| name.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Arc<dyn Signal>)> {
        self.entries.iter().map(|(name, signal)| (name.as_str(), signal))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl std::fmt::Debug for LogSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}

// =============================================================================
// Row formatting
// =============================================================================

fn header_line(log_set: &LogSet) -> String {
    let mut header = String::from("Timestamp");
    for name in log_set.names() {
        header.push_str(",\"");
        header.push_str(&name.replace('"', "\"\""));
        header.push('"');
    }
    header.push('\n');
    header
}

fn format_value(value: &SignalValue) -> String {
    match value {
        SignalValue::Float(v) => format!("{:.6}", v),
        other => other.to_string(),
    }
}

fn format_row(timestamp: &str, values: &[String]) -> io::Result<Vec<u8>> {
    let mut writer = WriterBuilder::new()
        .quote_style(QuoteStyle::Necessary)
        .terminator(Terminator::Any(b'\n'))
        .from_writer(Vec::new());
    writer
        .write_record(std::iter::once(timestamp).chain(values.iter().map(String::as_str)))
        .map_err(io::Error::from)?;
    writer.into_inner().map_err(|e| e.into_error())
}

// =============================================================================
// PeriodicLogger
// =============================================================================

/// Samples a [`LogSet`] into a CSV file on a fixed period.
#[derive(Debug, Clone)]
pub struct PeriodicLogger {
    log_set: Arc<LogSet>,
    path: PathBuf,
    period: Duration,
}

impl PeriodicLogger {
    /// A zero period is rejected.
    pub fn new(log_set: Arc<LogSet>, path: impl Into<PathBuf>, period: Duration) -> AppResult<Self> {
        if period.is_zero() {
            return Err(DaqError::Configuration(
                "logger period must be greater than zero".to_string(),
            ));
        }
        Ok(Self {
            log_set,
            path: path.into(),
            period,
        })
    }

    /// Append one row (preceded by the header if the file is new).
    pub async fn write_sample(&self) -> AppResult<()> {
        let timestamp = Local::now().format(TIMESTAMP_FORMAT).to_string();

        let mut values = Vec::with_capacity(self.log_set.len());
        for (name, signal) in self.log_set.iter() {
            let value = signal
                .read()
                .await
                .with_context(|| format!("reading '{}' for the log", name))?;
            values.push(format_value(&value));
        }

        let owes_header = !tokio::fs::try_exists(&self.path).await?;
        if owes_header {
            if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let mut buffer = Vec::new();
        if owes_header {
            buffer.extend_from_slice(header_line(&self.log_set).as_bytes());
        }
        buffer.extend(format_row(&timestamp, &values)?);

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(&buffer).await?;
        file.flush().await?;
        Ok(())
    }

    /// Spawn the sampling task. The first row is written immediately.
    pub fn start(self) -> LoggerHandle {
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();

        let task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!(
                path = %self.path.display(),
                period = ?self.period,
                signals = self.log_set.len(),
                "periodic logger started"
            );

            let mut rows = 0u64;
            loop {
                tokio::select! {
                    _ = &mut shutdown_rx => break,
                    _ = interval.tick() => {
                        tokio::select! {
                            _ = &mut shutdown_rx => break,
                            result = self.write_sample() => match result {
                                Ok(()) => {
                                    rows += 1;
                                    debug!(rows, "log row written");
                                }
                                Err(e) => error!(path = %self.path.display(), error = %e, "failed to write log row"),
                            },
                        }
                    }
                }
            }

            info!(path = %self.path.display(), rows, "periodic logger stopped");
            rows
        });

        LoggerHandle {
            shutdown: Some(shutdown_tx),
            task: Some(task),
        }
    }
}

/// Running logger. Dropping the handle aborts the task.
#[derive(Debug)]
pub struct LoggerHandle {
    shutdown: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<u64>>,
}

impl LoggerHandle {
    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }

    /// Stop the task and return the number of rows written. A row still being
    /// sampled is abandoned rather than waited for.
    pub async fn stop(mut self) -> AppResult<u64> {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        match self.task.take() {
            Some(task) => task
                .await
                .map_err(|e| DaqError::Instrument(format!("logger task failed: {}", e))),
            None => Ok(0),
        }
    }
}

impl Drop for LoggerHandle {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}
