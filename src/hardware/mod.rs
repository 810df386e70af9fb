//! Hardware capability layer.
//!
//! The script engine drives hardware only through the traits in
//! [`capabilities`]. [`observable`] provides the watch-channel backed signal
//! type and [`mock`] the simulated stage and ion pump supply used by tests and
//! by the `megatron` binary.

pub mod capabilities;
pub mod mock;
pub mod observable;

pub use capabilities::{Device, DeviceNode, DeviceSet, MotionControl, Signal};
pub use observable::{Observable, SignalValue, Subscription};
