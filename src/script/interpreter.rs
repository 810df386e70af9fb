//! Script interpreter.
//!
//! Walks parsed instructions in order against a [`DeviceSet`]. The interpreter
//! owns the staged motion state (`sp`/`pa`/`pr` only stage values, `bg`
//! commits them), the device registry and the log set discovered by the
//! pre-scan pass.
//!
//! Positions, speeds and wait targets in scripts are fixed-point integers;
//! they are divided by [`SCALE`] before reaching the hardware.

use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::condition::{
    ConditionOutcome, ConditionProgress, ConditionRequest, ConditionWatcher, Operator,
};
use crate::error::{AppResult, DaqError};
use crate::hardware::{DeviceSet, MotionControl, SignalValue};
use crate::logger::LogSet;
use crate::script::instruction::Instruction;
use crate::script::registry::{DeviceRegistry, DeviceTable};
use crate::script::Script;

/// Fixed-point scale between script integers and physical units.
pub const SCALE: f64 = 1_000_000.0;

/// Top-level devices every interpreter needs.
pub const REQUIRED_DEVICES: [&str; 4] = ["galil", "galil_val", "galil_rbv", "ION_Pump_PS"];

/// Name of the motor driven by `bg`, `st` and `hm`.
pub const MOTOR_DEVICE: &str = "galil";

/// Execution pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Parse everything, register `log` names, touch no hardware.
    Prescan,
    /// Execute every instruction; `log` is a no-op.
    Run,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PositionMode {
    #[default]
    Absolute,
    Relative,
}

/// Values staged by `sp`, `pa` and `pr`, committed by `bg`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MotionState {
    pub position_mode: PositionMode,
    pub pending_position: i64,
    /// Defaults to one physical unit per second.
    pub pending_speed: u64,
}

impl Default for MotionState {
    fn default() -> Self {
        Self {
            position_mode: PositionMode::Absolute,
            pending_position: 0,
            pending_speed: 1_000_000,
        }
    }
}

/// Restart point recorded by every `bg`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Zero-based line index of the `bg` instruction.
    pub line: usize,
    pub motion: MotionState,
}

/// Settling delays around motor commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MotionTiming {
    /// Before and after confirming a stop.
    pub settle: Duration,
    /// After triggering homing, before watching the homing monitor.
    pub home_settle: Duration,
    /// Upper bound on the best-effort stop confirmation.
    pub stop_confirm_timeout: Duration,
}

impl Default for MotionTiming {
    fn default() -> Self {
        Self {
            settle: Duration::from_millis(200),
            home_settle: Duration::from_secs(1),
            stop_confirm_timeout: Duration::from_secs(5),
        }
    }
}

/// Executes scripts against one set of devices.
pub struct Interpreter {
    registry: DeviceRegistry,
    motor: Arc<dyn MotionControl>,
    motion: MotionState,
    log_set: LogSet,
    checkpoint: Option<Checkpoint>,
    timing: MotionTiming,
    watcher: ConditionWatcher,
}

impl Interpreter {
    /// Check the required devices and resolve the device table.
    pub fn new(devices: &DeviceSet, table: &DeviceTable) -> AppResult<Self> {
        if let Some(missing) = REQUIRED_DEVICES.iter().find(|name| !devices.contains(name)) {
            return Err(DaqError::MissingDevice((*missing).to_string()));
        }
        let motor = devices
            .motor(MOTOR_DEVICE)
            .map_err(|e| DaqError::Configuration(e.to_string()))?;
        let registry = DeviceRegistry::build(table, devices)?;

        Ok(Self {
            registry,
            motor,
            motion: MotionState::default(),
            log_set: LogSet::default(),
            checkpoint: None,
            timing: MotionTiming::default(),
            watcher: ConditionWatcher::new(),
        })
    }

    pub fn with_timing(mut self, timing: MotionTiming) -> Self {
        self.timing = timing;
        self
    }

    /// Forward condition-wait progress to `observer`.
    pub fn with_progress(mut self, observer: mpsc::UnboundedSender<ConditionProgress>) -> Self {
        self.watcher = ConditionWatcher::new().with_progress(observer);
        self
    }

    pub fn motion(&self) -> &MotionState {
        &self.motion
    }

    pub fn log_set(&self) -> &LogSet {
        &self.log_set
    }

    /// Hand the pre-scanned log set over to the logger, leaving an empty one.
    pub fn take_log_set(&mut self) -> LogSet {
        std::mem::take(&mut self.log_set)
    }

    pub fn checkpoint(&self) -> Option<Checkpoint> {
        self.checkpoint
    }

    pub fn motor(&self) -> Arc<dyn MotionControl> {
        Arc::clone(&self.motor)
    }

    /// Execute a whole script in `mode`.
    pub async fn execute(&mut self, script: &Script, mode: Mode) -> AppResult<()> {
        self.execute_from(script, 0, mode).await
    }

    /// Execute a script starting at line index `start`.
    ///
    /// Every line is parsed up front, so a malformed line anywhere fails the
    /// call before the first instruction runs.
    pub async fn execute_from(&mut self, script: &Script, start: usize, mode: Mode) -> AppResult<()> {
        let instructions = script.parse()?;
        for (index, instruction) in instructions.iter().enumerate().skip(start) {
            match mode {
                Mode::Prescan => self.prescan(instruction)?,
                Mode::Run => {
                    if *instruction != Instruction::Empty {
                        info!(line = index + 1, %instruction, "executing");
                    }
                    self.dispatch(index, instruction).await?;
                }
            }
        }
        Ok(())
    }

    /// Run again from the last checkpoint with its motion state restored, or
    /// from the top if no `bg` has run yet.
    pub async fn resume(&mut self, script: &Script) -> AppResult<()> {
        let start = match self.checkpoint {
            Some(checkpoint) => {
                info!(line = checkpoint.line + 1, "resuming from checkpoint");
                self.motion = checkpoint.motion;
                checkpoint.line
            }
            None => 0,
        };
        self.execute_from(script, start, Mode::Run).await
    }

    fn prescan(&mut self, instruction: &Instruction) -> AppResult<()> {
        if let Instruction::Log { name } = instruction {
            let signal = self.registry.resolve(name)?;
            if self.log_set.insert(name.clone(), signal) {
                debug!(name = %name, "registered for logging");
            }
        }
        Ok(())
    }

    async fn dispatch(&mut self, index: usize, instruction: &Instruction) -> AppResult<()> {
        match instruction {
            Instruction::Pause { seconds } => sleep(Duration::from_secs(*seconds)).await,
            Instruction::SetSpeed { speed } => self.motion.pending_speed = *speed,
            Instruction::SetAbsolutePosition { position } => {
                self.motion.position_mode = PositionMode::Absolute;
                self.motion.pending_position = *position;
            }
            Instruction::SetRelativePosition { position } => {
                self.motion.position_mode = PositionMode::Relative;
                self.motion.pending_position = *position;
            }
            Instruction::Begin => self.begin(index).await?,
            Instruction::Stop => self.stop_motion().await?,
            Instruction::Home => self.home().await?,
            Instruction::SetOutput { name, value } => self.set_output(name, value).await?,
            Instruction::WaitAnalog {
                source,
                operator,
                value,
                tolerance,
                timeout,
            } => {
                let tolerance = tolerance.unwrap_or(0.0) / SCALE;
                self.wait(source, *operator, value / SCALE, tolerance, *timeout)
                    .await?
            }
            Instruction::WaitDigital {
                source,
                value,
                timeout,
            } => {
                self.wait(source, Operator::Equal, *value as f64 / SCALE, 0.0, *timeout)
                    .await?
            }
            Instruction::Log { .. } | Instruction::Empty => {}
        }
        Ok(())
    }

    async fn begin(&mut self, index: usize) -> AppResult<()> {
        let velocity = self.motion.pending_speed as f64 / SCALE;
        self.motor
            .set_velocity(velocity)
            .await
            .with_context(|| format!("setting velocity to {}", velocity))?;
        self.checkpoint = Some(Checkpoint {
            line: index,
            motion: self.motion,
        });

        self.motor.enable_channel().await.context("enabling channel")?;
        self.stop_motion().await?;

        let target = self.motion.pending_position as f64 / SCALE;
        match self.motion.position_mode {
            PositionMode::Absolute => self
                .motor
                .move_absolute(target)
                .await
                .with_context(|| format!("absolute move to {}", target))?,
            PositionMode::Relative => self
                .motor
                .move_relative(target)
                .await
                .with_context(|| format!("relative move by {}", target))?,
        }
        debug!(motor = self.motor.name(), target, velocity, mode = ?self.motion.position_mode, "move issued");
        Ok(())
    }

    async fn stop_motion(&mut self) -> AppResult<()> {
        self.motor.stop().await.context("stopping motor")?;
        sleep(self.timing.settle).await;

        let request = ConditionRequest::new(self.motor.done_moving(), 1.0, Operator::Equal)
            .with_timeout(Some(self.timing.stop_confirm_timeout));
        match self.watcher.watch(&request).await {
            Ok(ConditionOutcome::Satisfied) => {}
            Ok(ConditionOutcome::TimedOut) => warn!(
                motor = self.motor.name(),
                timeout = ?self.timing.stop_confirm_timeout,
                "motor did not report done moving after stop"
            ),
            Err(e) => warn!(motor = self.motor.name(), error = %e, "could not confirm motor stop"),
        }

        sleep(self.timing.settle).await;
        Ok(())
    }

    async fn home(&mut self) -> AppResult<()> {
        self.motor.enable_channel().await.context("enabling channel")?;
        self.stop_motion().await?;
        self.motor.home_reverse().await.context("starting homing")?;
        sleep(self.timing.home_settle).await;

        let request = ConditionRequest::new(self.motor.homing_monitor(), 0.0, Operator::Equal);
        self.watcher.watch(&request).await?;
        info!(motor = self.motor.name(), "homing complete");
        Ok(())
    }

    async fn set_output(&self, name: &str, value: &str) -> AppResult<()> {
        let signal = self.registry.resolve(name)?;
        let value = match value.parse::<i64>() {
            Ok(number) => SignalValue::Int(number),
            Err(_) => SignalValue::Str(value.to_string()),
        };
        signal
            .write(value.clone())
            .await
            .with_context(|| format!("writing {} to '{}'", value, name))?;
        Ok(())
    }

    async fn wait(
        &self,
        source: &str,
        operator: Operator,
        target: f64,
        tolerance: f64,
        timeout: Option<f64>,
    ) -> AppResult<()> {
        let signal = self.registry.resolve(source)?;
        let timeout = timeout
            .map(Duration::try_from_secs_f64)
            .transpose()
            .map_err(|e| DaqError::Configuration(format!("invalid wait timeout: {}", e)))?;
        let request = ConditionRequest::new(signal, target, operator)
            .with_tolerance(tolerance)
            .with_timeout(timeout);

        match self.watcher.watch(&request).await? {
            ConditionOutcome::Satisfied => Ok(()),
            ConditionOutcome::TimedOut => Err(DaqError::ConditionTimeout {
                signal: source.to_string(),
                timeout: timeout.unwrap_or_default(),
            }),
        }
    }
}

impl std::fmt::Debug for Interpreter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Interpreter")
            .field("motor", &self.motor.name())
            .field("motion", &self.motion)
            .field("log_set", &self.log_set)
            .field("checkpoint", &self.checkpoint)
            .finish()
    }
}
