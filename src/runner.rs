//! Script run lifecycle.
//!
//! [`ScriptRunner`] wraps an [`Interpreter`] with everything around a run:
//!
//! 1. pre-scan the whole script (parse errors and unknown `log` names fail
//!    here, before the logger or any hardware is touched);
//! 2. freeze the log set and start the [`PeriodicLogger`];
//! 3. remember the motor velocity;
//! 4. execute the run pass, racing it against an optional cancel future;
//! 5. on every exit path stop the logger and restore the velocity.

use futures::future;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

use crate::error::{AppResult, DaqError};
use crate::logger::PeriodicLogger;
use crate::script::{Checkpoint, Interpreter, Mode, Script};

/// Summary of a completed run.
#[derive(Debug, Clone, PartialEq)]
pub struct RunReport {
    /// Display names sampled by the logger, in column order.
    pub logged_signals: Vec<String>,
    pub rows_logged: u64,
    /// Last `bg` checkpoint, if any.
    pub checkpoint: Option<Checkpoint>,
    pub elapsed: Duration,
}

/// Runs scripts with a periodic logger scoped to each run.
#[derive(Debug)]
pub struct ScriptRunner {
    interpreter: Interpreter,
    log_path: PathBuf,
    period: Duration,
}

impl ScriptRunner {
    pub fn new(interpreter: Interpreter, log_path: impl Into<PathBuf>, period: Duration) -> Self {
        Self {
            interpreter,
            log_path: log_path.into(),
            period,
        }
    }

    pub fn interpreter(&self) -> &Interpreter {
        &self.interpreter
    }

    /// Run `script` to completion.
    pub async fn run(&mut self, script: &Script) -> AppResult<RunReport> {
        self.run_until(script, future::pending::<()>()).await
    }

    /// Run `script`, aborting with [`DaqError::Cancelled`] if `cancel`
    /// completes first.
    pub async fn run_until<F>(&mut self, script: &Script, cancel: F) -> AppResult<RunReport>
    where
        F: Future<Output = ()>,
    {
        self.execute(script, false, cancel).await
    }

    /// Re-run `script` from the last checkpoint (see [`Interpreter::resume`]).
    pub async fn resume<F>(&mut self, script: &Script, cancel: F) -> AppResult<RunReport>
    where
        F: Future<Output = ()>,
    {
        self.execute(script, true, cancel).await
    }

    async fn execute<F>(&mut self, script: &Script, resume: bool, cancel: F) -> AppResult<RunReport>
    where
        F: Future<Output = ()>,
    {
        let started = Instant::now();

        self.interpreter.execute(script, Mode::Prescan).await?;
        let log_set = Arc::new(self.interpreter.take_log_set());
        let logged_signals: Vec<String> = log_set.names().map(str::to_string).collect();
        let logger = PeriodicLogger::new(Arc::clone(&log_set), &self.log_path, self.period)?;

        let motor = self.interpreter.motor();
        let saved_velocity = match motor.velocity().await {
            Ok(velocity) => Some(velocity),
            Err(e) => {
                warn!(motor = motor.name(), error = %e, "could not read velocity; it will not be restored");
                None
            }
        };

        let handle = logger.start();
        info!(
            lines = script.len(),
            logged = ?logged_signals,
            resume,
            "script run started"
        );

        let result = {
            let interpreter = &mut self.interpreter;
            let run = async move {
                if resume {
                    interpreter.resume(script).await
                } else {
                    interpreter.execute(script, Mode::Run).await
                }
            };
            tokio::select! {
                result = run => result,
                _ = cancel => {
                    warn!("script run cancelled");
                    Err(DaqError::Cancelled)
                }
            }
        };

        let rows_logged = match handle.stop().await {
            Ok(rows) => rows,
            Err(e) => {
                error!(error = %e, "periodic logger did not shut down cleanly");
                0
            }
        };

        if let Some(velocity) = saved_velocity {
            if let Err(e) = motor.set_velocity(velocity).await {
                warn!(motor = motor.name(), velocity, error = %e, "failed to restore velocity");
            }
        }

        match &result {
            Ok(()) => info!(rows_logged, elapsed = ?started.elapsed(), "script run finished"),
            Err(e) => error!(rows_logged, error = %e, "script run aborted"),
        }
        result?;

        Ok(RunReport {
            logged_signals,
            rows_logged,
            checkpoint: self.interpreter.checkpoint(),
            elapsed: started.elapsed(),
        })
    }
}
