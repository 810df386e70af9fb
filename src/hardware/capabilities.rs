//! Capability traits the script engine drives.
//!
//! The engine never talks to a control system directly. It sees three seams:
//!
//! - [`Signal`]: a single process variable that can be read, subscribed to and
//!   (when writable) written.
//! - [`Device`]: a named group of sub-components, walked by the device registry
//!   to resolve dotted paths such as `ION_Pump_PS.Pwr_I`.
//! - [`MotionControl`]: a motor record with velocity, enable, move, stop and
//!   homing operations plus its done-move and homing monitors.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use crate::hardware::observable::{SignalValue, Subscription};

/// A single readable/subscribable process variable.
#[async_trait]
pub trait Signal: Send + Sync {
    fn name(&self) -> &str;

    /// Current value.
    async fn read(&self) -> Result<SignalValue>;

    /// Push-based update stream: the current value, then every update in
    /// order. Dropping it unsubscribes.
    fn subscribe(&self) -> Subscription<SignalValue>;

    async fn write(&self, value: SignalValue) -> Result<()>;
}

/// A device made of named sub-components.
pub trait Device: Send + Sync {
    fn name(&self) -> &str;

    /// Sub-component lookup by attribute name.
    fn component(&self, name: &str) -> Option<DeviceNode>;
}

/// Motor record operations used by `bg`, `st` and `hm`.
///
/// Positions and velocities are in physical units; the script layer does the
/// fixed-point scaling before calling in.
#[async_trait]
pub trait MotionControl: Send + Sync {
    fn name(&self) -> &str;

    async fn velocity(&self) -> Result<f64>;
    async fn set_velocity(&self, velocity: f64) -> Result<()>;

    /// Enable the controller channel; moves are refused while disabled.
    async fn enable_channel(&self) -> Result<()>;

    /// Start an absolute move. Returns once the move is issued, not when it
    /// completes.
    async fn move_absolute(&self, position: f64) -> Result<()>;
    /// Start a relative move. Returns once the move is issued.
    async fn move_relative(&self, distance: f64) -> Result<()>;

    async fn stop(&self) -> Result<()>;

    /// Trigger homing towards the reverse limit.
    async fn home_reverse(&self) -> Result<()>;

    /// Reads 1 when the motor is not moving.
    fn done_moving(&self) -> Arc<dyn Signal>;

    /// Reads 0 once homing has completed.
    fn homing_monitor(&self) -> Arc<dyn Signal>;
}

/// Anything the device map or a device's component lookup can hand back.
#[derive(Clone)]
pub enum DeviceNode {
    Signal(Arc<dyn Signal>),
    Device(Arc<dyn Device>),
    Motor(Arc<dyn MotionControl>),
}

impl DeviceNode {
    pub fn kind(&self) -> &'static str {
        match self {
            DeviceNode::Signal(_) => "signal",
            DeviceNode::Device(_) => "device",
            DeviceNode::Motor(_) => "motor",
        }
    }
}

impl std::fmt::Debug for DeviceNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            DeviceNode::Signal(s) => s.name(),
            DeviceNode::Device(d) => d.name(),
            DeviceNode::Motor(m) => m.name(),
        };
        write!(f, "DeviceNode::{}({})", self.kind(), name)
    }
}

/// The top-level devices handed to the interpreter, keyed by attribute name
/// (`galil`, `galil_rbv`, `ION_Pump_PS`, ...).
#[derive(Clone, Default, Debug)]
pub struct DeviceSet {
    devices: HashMap<String, DeviceNode>,
}

impl DeviceSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, node: DeviceNode) -> &mut Self {
        self.devices.insert(name.into(), node);
        self
    }

    pub fn insert_signal(&mut self, name: impl Into<String>, signal: Arc<dyn Signal>) -> &mut Self {
        self.insert(name, DeviceNode::Signal(signal))
    }

    pub fn insert_device(&mut self, name: impl Into<String>, device: Arc<dyn Device>) -> &mut Self {
        self.insert(name, DeviceNode::Device(device))
    }

    pub fn insert_motor(
        &mut self,
        name: impl Into<String>,
        motor: Arc<dyn MotionControl>,
    ) -> &mut Self {
        self.insert(name, DeviceNode::Motor(motor))
    }

    pub fn get(&self, name: &str) -> Option<&DeviceNode> {
        self.devices.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.devices.contains_key(name)
    }

    /// Look up a motor by name.
    pub fn motor(&self, name: &str) -> Result<Arc<dyn MotionControl>> {
        match self.devices.get(name) {
            Some(DeviceNode::Motor(motor)) => Ok(motor.clone()),
            Some(other) => Err(anyhow!("'{}' is a {}, not a motor", name, other.kind())),
            None => Err(anyhow!("No device named '{}'", name)),
        }
    }
}
