//! Simulated Hardware
//!
//! Provides simulated devices for running scripts without the beamline.
//! All simulated devices use async-safe operations (tokio::time::sleep, not
//! std::thread::sleep).
//!
//! # Available Simulations
//!
//! - `SimMotor` - Galil-style motor record (RBV/VAL, done-move, homing monitor,
//!   channel enable) moving at the commanded velocity
//! - `IonPumpSupply` - Ion pump power supply with read-only measurements and an
//!   output enable command
//! - `SimBench` - The two wired together under the attribute names scripts expect
//!
//! # Performance Characteristics
//!
//! - SimMotor: readback published every 20ms while moving
//! - IonPumpSupply: measurements refreshed once per scan period (1s by default)

use anyhow::{bail, Result};
use async_trait::async_trait;
use rand::Rng;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::{sleep, Duration};
use tracing::debug;

use crate::hardware::capabilities::{Device, DeviceNode, DeviceSet, MotionControl, Signal};
use crate::hardware::observable::{Observable, SignalValue};

// =============================================================================
// SimMotor - Simulated Motor Record
// =============================================================================

/// Operations received by a [`SimMotor`], in order.
#[derive(Debug, Clone, PartialEq)]
pub enum MotorCommand {
    SetVelocity(f64),
    EnableChannel,
    MoveAbsolute(f64),
    MoveRelative(f64),
    Stop,
    HomeReverse,
}

/// Simulated motor record.
///
/// Simulates a Galil axis with:
/// - motion at the configured velocity (units/sec), readback updates every tick
/// - `done_moving` monitor: 0 while moving, 1 when stopped
/// - `homing_monitor`: 1 while homing, 0 once the home position is reached
/// - moves refused until the channel is enabled
/// - [`SimMotor::hold_done_move`] to model a controller that never reports
///   the end of a move
///
/// # Example
///
/// ```rust,ignore
/// let motor = SimMotor::new("galil");
/// motor.enable_channel().await?;
/// motor.set_velocity(0.5).await?;
/// motor.move_absolute(1.0).await?; // returns immediately, motion takes ~2s
/// ```
pub struct SimMotor {
    name: String,
    readback: Observable<SignalValue>,
    setpoint: Observable<SignalValue>,
    done_move: Observable<SignalValue>,
    done_move_held: Arc<AtomicBool>,
    homing: Observable<SignalValue>,
    velocity: RwLock<f64>,
    channel_enabled: RwLock<bool>,
    motion: Mutex<Option<JoinHandle<()>>>,
    commands: Mutex<Vec<MotorCommand>>,
    tick: Duration,
}

impl SimMotor {
    /// Create a simulated motor at position 0.0, velocity 1.0 units/sec,
    /// channel disabled.
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            readback: Observable::new(format!("{}_user_readback", name), SignalValue::Float(0.0))
                .read_only(),
            setpoint: Observable::new(format!("{}_user_setpoint", name), SignalValue::Float(0.0)),
            done_move: Observable::new(format!("{}_motor_done_move", name), SignalValue::Int(1))
                .read_only(),
            done_move_held: Arc::new(AtomicBool::new(false)),
            homing: Observable::new(format!("{}_homing_monitor", name), SignalValue::Int(0))
                .read_only(),
            velocity: RwLock::new(1.0),
            channel_enabled: RwLock::new(false),
            motion: Mutex::new(None),
            commands: Mutex::new(Vec::new()),
            tick: Duration::from_millis(20),
            name,
        }
    }

    /// User readback (RBV) as a signal handle.
    pub fn readback(&self) -> Arc<dyn Signal> {
        Arc::new(self.readback.clone())
    }

    /// User setpoint (VAL) as a signal handle.
    pub fn setpoint(&self) -> Arc<dyn Signal> {
        Arc::new(self.setpoint.clone())
    }

    /// Current readback position.
    pub fn position(&self) -> f64 {
        self.readback.get().as_f64().unwrap_or(0.0)
    }

    /// Every operation received so far.
    pub async fn commands(&self) -> Vec<MotorCommand> {
        self.commands.lock().await.clone()
    }

    pub async fn is_channel_enabled(&self) -> bool {
        *self.channel_enabled.read().await
    }

    /// While held, the done-move monitor reads 0 and neither `stop` nor the
    /// end of a trajectory sets it back to 1.
    pub fn hold_done_move(&self, hold: bool) {
        self.done_move_held.store(hold, Ordering::SeqCst);
        if hold {
            self.done_move.publish(SignalValue::Int(0));
        }
    }

    fn release_done_move(&self) {
        if !self.done_move_held.load(Ordering::SeqCst) {
            self.done_move.publish(SignalValue::Int(1));
        }
    }

    async fn record(&self, command: MotorCommand) {
        self.commands.lock().await.push(command);
    }

    async fn ensure_enabled(&self, operation: &str) -> Result<()> {
        if !*self.channel_enabled.read().await {
            bail!("{}: cannot {} - channel disabled", self.name, operation);
        }
        Ok(())
    }

    /// Replace any motion in progress with a new trajectory towards `target`.
    async fn start_motion(&self, target: f64, homing: bool) {
        let velocity = *self.velocity.read().await;
        let readback = self.readback.clone();
        let done = self.done_move.clone();
        let held = Arc::clone(&self.done_move_held);
        let homing_monitor = self.homing.clone();
        let tick = self.tick;
        let from = self.position();

        let mut motion = self.motion.lock().await;
        if let Some(previous) = motion.take() {
            previous.abort();
        }

        self.setpoint.publish(SignalValue::Float(target));
        done.publish(SignalValue::Int(0));
        if homing {
            homing_monitor.publish(SignalValue::Int(1));
        }
        debug!(motor = %self.name, from, target, velocity, "motion started");

        *motion = Some(tokio::spawn(async move {
            let step = velocity * tick.as_secs_f64();
            let mut position = from;
            while position != target {
                let remaining = target - position;
                if velocity <= 0.0 || remaining.abs() <= step {
                    position = target;
                } else {
                    position += step.copysign(remaining);
                }
                sleep(tick).await;
                readback.publish(SignalValue::Float(position));
            }
            if homing {
                homing_monitor.publish(SignalValue::Int(0));
            }
            if !held.load(Ordering::SeqCst) {
                done.publish(SignalValue::Int(1));
            }
        }));
    }
}

#[async_trait]
impl MotionControl for SimMotor {
    fn name(&self) -> &str {
        &self.name
    }

    async fn velocity(&self) -> Result<f64> {
        Ok(*self.velocity.read().await)
    }

    async fn set_velocity(&self, velocity: f64) -> Result<()> {
        self.record(MotorCommand::SetVelocity(velocity)).await;
        *self.velocity.write().await = velocity;
        Ok(())
    }

    async fn enable_channel(&self) -> Result<()> {
        self.record(MotorCommand::EnableChannel).await;
        *self.channel_enabled.write().await = true;
        Ok(())
    }

    async fn move_absolute(&self, position: f64) -> Result<()> {
        self.record(MotorCommand::MoveAbsolute(position)).await;
        self.ensure_enabled("move").await?;
        self.start_motion(position, false).await;
        Ok(())
    }

    async fn move_relative(&self, distance: f64) -> Result<()> {
        self.record(MotorCommand::MoveRelative(distance)).await;
        self.ensure_enabled("move").await?;
        let target = self.position() + distance;
        self.start_motion(target, false).await;
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.record(MotorCommand::Stop).await;
        if let Some(motion) = self.motion.lock().await.take() {
            motion.abort();
        }
        self.release_done_move();
        Ok(())
    }

    async fn home_reverse(&self) -> Result<()> {
        self.record(MotorCommand::HomeReverse).await;
        self.ensure_enabled("home").await?;
        self.start_motion(0.0, true).await;
        Ok(())
    }

    fn done_moving(&self) -> Arc<dyn Signal> {
        Arc::new(self.done_move.clone())
    }

    fn homing_monitor(&self) -> Arc<dyn Signal> {
        Arc::new(self.homing.clone())
    }
}

// =============================================================================
// IonPumpSupply - Simulated Ion Pump Power Supply
// =============================================================================

/// Simulated ion pump power supply.
///
/// Components (attribute names as used in device paths):
/// `Pwr_I`, `I_I`, `E_I`, `Rate_Arc_I`, `Cnt_Target_KwHr_RB` (read-only floats)
/// and `Enbl_Out_Cmd` (writable, "Enable" / "Disable").
pub struct IonPumpSupply {
    name: String,
    pwr_i: Observable<SignalValue>,
    i_i: Observable<SignalValue>,
    e_i: Observable<SignalValue>,
    rate_arc_i: Observable<SignalValue>,
    cnt_target_kwhr_rb: Observable<SignalValue>,
    enbl_out_cmd: Observable<SignalValue>,
}

impl IonPumpSupply {
    pub fn new(name: impl Into<String>) -> Self {
        let measurement = |attr: &str, units: &str| {
            Observable::new(attr, SignalValue::Float(0.0))
                .with_units(units)
                .read_only()
        };
        Self {
            name: name.into(),
            pwr_i: measurement("Pwr_I", "W").with_description("ION Power"),
            i_i: measurement("I_I", "mA").with_description("ION Current"),
            e_i: measurement("E_I", "V").with_description("ION Voltage"),
            rate_arc_i: measurement("Rate_Arc_I", "1/s").with_description("ION Arc Rate"),
            cnt_target_kwhr_rb: measurement("Cnt_Target_KwHr_RB", "kWh")
                .with_description("ION KWH Count"),
            enbl_out_cmd: Observable::new("Enbl_Out_Cmd", SignalValue::from("Enable"))
                .with_description("ION Output Enable"),
        }
    }

    /// Concrete observable for a component, for tests and simulation drivers.
    pub fn observable(&self, attr: &str) -> Option<&Observable<SignalValue>> {
        match attr {
            "Pwr_I" => Some(&self.pwr_i),
            "I_I" => Some(&self.i_i),
            "E_I" => Some(&self.e_i),
            "Rate_Arc_I" => Some(&self.rate_arc_i),
            "Cnt_Target_KwHr_RB" => Some(&self.cnt_target_kwhr_rb),
            "Enbl_Out_Cmd" => Some(&self.enbl_out_cmd),
            _ => None,
        }
    }

    pub fn output_enabled(&self) -> bool {
        matches!(self.enbl_out_cmd.get(), SignalValue::Str(ref s) if s == "Enable")
            || self.enbl_out_cmd.get() == SignalValue::Int(0)
    }

    /// One simulation step: with the output enabled the supply draws ~10 mA at
    /// ~400 V and the kWh counter advances by 0.01; disabled, everything reads 0.
    pub fn scan_once(&self) {
        let enabled = self.output_enabled();
        let mut rng = rand::thread_rng();
        let mut noisy = |mean: f64, spread: f64| {
            if enabled {
                mean + rng.gen_range(-spread..=spread)
            } else {
                0.0
            }
        };

        let current = noisy(10.0, 1.0);
        let voltage = noisy(400.0, 1.0);
        let arc_rate = noisy(10.0, 1.0);
        let kwh = self.cnt_target_kwhr_rb.get().as_f64().unwrap_or(0.0)
            + if enabled { 0.01 } else { 0.0 };

        self.i_i.publish(SignalValue::Float(current));
        self.e_i.publish(SignalValue::Float(voltage));
        self.pwr_i.publish(SignalValue::Float(current * voltage));
        self.rate_arc_i.publish(SignalValue::Float(arc_rate));
        self.cnt_target_kwhr_rb.publish(SignalValue::Float(kwh));
    }

    /// Run [`IonPumpSupply::scan_once`] every `period` until the handle is aborted.
    pub fn start_scan(self: &Arc<Self>, period: Duration) -> JoinHandle<()> {
        let supply = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                supply.scan_once();
            }
        })
    }
}

impl Device for IonPumpSupply {
    fn name(&self) -> &str {
        &self.name
    }

    fn component(&self, name: &str) -> Option<DeviceNode> {
        self.observable(name)
            .map(|obs| DeviceNode::Signal(Arc::new(obs.clone()) as Arc<dyn Signal>))
    }
}

// =============================================================================
// SimBench - wired simulation
// =============================================================================

/// A simulated stage and ion pump supply registered under the names the
/// default device table refers to.
#[derive(Clone)]
pub struct SimBench {
    pub motor: Arc<SimMotor>,
    pub ion_pump: Arc<IonPumpSupply>,
}

impl SimBench {
    pub fn new() -> Self {
        Self {
            motor: Arc::new(SimMotor::new("galil")),
            ion_pump: Arc::new(IonPumpSupply::new("ION_Pump_PS")),
        }
    }

    /// `galil`, `galil_val`, `galil_rbv` and `ION_Pump_PS`.
    pub fn devices(&self) -> DeviceSet {
        let mut devices = DeviceSet::new();
        devices
            .insert_motor("galil", self.motor.clone())
            .insert_signal("galil_val", self.motor.setpoint())
            .insert_signal("galil_rbv", self.motor.readback())
            .insert_device("ION_Pump_PS", self.ion_pump.clone());
        devices
    }
}

impl Default for SimBench {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_motor_refuses_move_when_disabled() {
        let motor = SimMotor::new("galil");
        let result = motor.move_absolute(1.0).await;
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("channel disabled"));
    }

    #[tokio::test]
    async fn test_motor_absolute_move_reaches_target() {
        let motor = SimMotor::new("galil");
        motor.enable_channel().await.unwrap();
        motor.set_velocity(10.0).await.unwrap();

        let mut done = motor.done_moving().subscribe();
        assert_eq!(done.recv().await.unwrap(), SignalValue::Int(1));
        motor.move_absolute(0.5).await.unwrap();
        assert_eq!(done.recv().await.unwrap(), SignalValue::Int(0));

        assert_eq!(done.recv().await.unwrap(), SignalValue::Int(1));
        assert_eq!(motor.position(), 0.5);
    }

    #[tokio::test]
    async fn test_motor_relative_move_and_stop() {
        let motor = SimMotor::new("galil");
        motor.enable_channel().await.unwrap();
        motor.set_velocity(0.1).await.unwrap();

        motor.move_relative(5.0).await.unwrap();
        sleep(Duration::from_millis(60)).await;
        motor.stop().await.unwrap();

        let stopped_at = motor.position();
        assert!(stopped_at > 0.0 && stopped_at < 5.0);
        sleep(Duration::from_millis(60)).await;
        assert_eq!(motor.position(), stopped_at);
        assert_eq!(
            motor.done_moving().read().await.unwrap(),
            SignalValue::Int(1)
        );
    }

    #[tokio::test]
    async fn test_motor_homing_clears_monitor() {
        let motor = SimMotor::new("galil");
        motor.enable_channel().await.unwrap();
        motor.set_velocity(100.0).await.unwrap();
        motor.move_absolute(1.0).await.unwrap();
        sleep(Duration::from_millis(60)).await;

        let mut homing = motor.homing_monitor().subscribe();
        assert_eq!(homing.recv().await.unwrap(), SignalValue::Int(0));
        motor.home_reverse().await.unwrap();
        assert_eq!(homing.recv().await.unwrap(), SignalValue::Int(1));
        assert_eq!(homing.recv().await.unwrap(), SignalValue::Int(0));
        assert_eq!(motor.position(), 0.0);
    }

    #[tokio::test]
    async fn test_held_done_move_survives_stop() {
        let motor = SimMotor::new("galil");
        motor.enable_channel().await.unwrap();
        motor.set_velocity(100.0).await.unwrap();
        motor.hold_done_move(true);

        motor.move_absolute(0.2).await.unwrap();
        sleep(Duration::from_millis(60)).await;
        assert_eq!(motor.position(), 0.2);
        motor.stop().await.unwrap();
        assert_eq!(motor.done_moving().read().await.unwrap(), SignalValue::Int(0));

        motor.hold_done_move(false);
        motor.stop().await.unwrap();
        assert_eq!(motor.done_moving().read().await.unwrap(), SignalValue::Int(1));
    }

    #[tokio::test]
    async fn test_motor_records_commands() {
        let motor = SimMotor::new("galil");
        motor.set_velocity(0.5).await.unwrap();
        assert!(!motor.is_channel_enabled().await);
        motor.enable_channel().await.unwrap();
        assert!(motor.is_channel_enabled().await);
        motor.stop().await.unwrap();

        assert_eq!(
            motor.commands().await,
            vec![
                MotorCommand::SetVelocity(0.5),
                MotorCommand::EnableChannel,
                MotorCommand::Stop
            ]
        );
    }

    #[test]
    fn test_ion_pump_scan_when_enabled() {
        let supply = IonPumpSupply::new("ION_Pump_PS");
        supply.scan_once();

        let current = supply.observable("I_I").unwrap().get().as_f64().unwrap();
        let voltage = supply.observable("E_I").unwrap().get().as_f64().unwrap();
        assert!((9.0..=11.0).contains(&current));
        assert!((399.0..=401.0).contains(&voltage));
        assert_eq!(
            supply.observable("Cnt_Target_KwHr_RB").unwrap().get(),
            SignalValue::Float(0.01)
        );
    }

    #[tokio::test]
    async fn test_ion_pump_disable_zeroes_measurements() {
        let supply = IonPumpSupply::new("ION_Pump_PS");
        let enable = supply.component("Enbl_Out_Cmd").unwrap();
        let DeviceNode::Signal(enable) = enable else {
            panic!("expected a signal");
        };
        enable.write(SignalValue::from("Disable")).await.unwrap();
        supply.scan_once();

        assert_eq!(supply.observable("Pwr_I").unwrap().get(), SignalValue::Float(0.0));
        assert!(supply.component("Missing").is_none());
    }

    #[test]
    fn test_bench_registers_required_devices() {
        let bench = SimBench::new();
        let devices = bench.devices();
        for name in ["galil", "galil_val", "galil_rbv", "ION_Pump_PS"] {
            assert!(devices.contains(name), "missing {name}");
        }
        assert!(devices.motor("galil").is_ok());
        assert!(devices.motor("galil_rbv").is_err());
    }
}
