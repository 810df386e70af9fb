//! Observable signals
//!
//! Reactive values built on `tokio::sync::watch` and `tokio::sync::broadcast`
//! for multi-subscriber notifications. Every simulated process variable is an
//! `Observable`: the device side publishes new readings, scripts read or
//! subscribe to them.
//!
//! [`Observable::subscribe`] hands out a watch receiver holding only the
//! latest value. [`Observable::updates`] hands out a [`Subscription`] that
//! yields every published value in order; the condition watcher uses it.
//!
//! Dropping a receiver or subscription is the unsubscribe:
//! [`Observable::subscriber_count`] reflects live subscriptions only.
//!
//! # Example
//!
//! ```rust,ignore
//! let current = Observable::new("I_I", SignalValue::Float(0.0))
//!     .with_units("mA")
//!     .read_only();
//!
//! let mut rx = current.subscribe();
//! tokio::spawn(async move {
//!     while rx.changed().await.is_ok() {
//!         println!("I_I changed to: {}", *rx.borrow());
//!     }
//! });
//!
//! // Device-side update (bypasses the read-only flag)
//! current.publish(SignalValue::Float(10.2));
//! ```

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::watch;

use crate::hardware::capabilities::Signal;

// =============================================================================
// SignalValue
// =============================================================================

/// Value carried by a process variable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SignalValue {
    Float(f64),
    Int(i64),
    Str(String),
}

impl SignalValue {
    /// Numeric view used by comparisons. Strings that spell a number count.
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            SignalValue::Float(v) => Some(*v),
            SignalValue::Int(v) => Some(*v as f64),
            SignalValue::Str(s) => s.trim().parse().ok(),
        }
    }
}

impl fmt::Display for SignalValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SignalValue::Float(v) => write!(f, "{}", v),
            SignalValue::Int(v) => write!(f, "{}", v),
            SignalValue::Str(s) => f.write_str(s),
        }
    }
}

impl From<f64> for SignalValue {
    fn from(value: f64) -> Self {
        SignalValue::Float(value)
    }
}

impl From<i64> for SignalValue {
    fn from(value: i64) -> Self {
        SignalValue::Int(value)
    }
}

impl From<&str> for SignalValue {
    fn from(value: &str) -> Self {
        SignalValue::Str(value.to_string())
    }
}

// =============================================================================
// Subscription
// =============================================================================

/// Buffered updates kept per subscription before it starts lagging.
pub const UPDATE_CAPACITY: usize = 1024;

/// Every value of a signal, starting with the value current at subscription
/// time and followed by each publish in order.
#[derive(Debug)]
pub struct Subscription<T: Clone> {
    pending: Option<T>,
    updates: broadcast::Receiver<T>,
}

impl<T: Clone> Subscription<T> {
    pub fn new(current: T, updates: broadcast::Receiver<T>) -> Self {
        Self {
            pending: Some(current),
            updates,
        }
    }

    /// Next value.
    ///
    /// Fails with [`RecvError::Lagged`] if more than [`UPDATE_CAPACITY`]
    /// values were published since the last call, and with
    /// [`RecvError::Closed`] once the signal is gone.
    pub async fn recv(&mut self) -> Result<T, RecvError> {
        if let Some(current) = self.pending.take() {
            return Ok(current);
        }
        self.updates.recv().await
    }
}

// =============================================================================
// Observable<T>
// =============================================================================

/// A thread-safe, observable value with change notifications.
///
/// Uses `tokio::sync::watch` internally for efficient multi-subscriber broadcast.
/// Subscribers can wait for changes asynchronously without polling.
pub struct Observable<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// The watch channel sender (holds current value)
    sender: watch::Sender<T>,
    /// Every published value, for subscribers that must not skip any
    updates: broadcast::Sender<T>,
    metadata: ObservableMetadata,
}

impl<T: Clone + Send + Sync + 'static> fmt::Debug for Observable<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Observable")
            .field("metadata", &self.metadata)
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

impl<T: Clone + Send + Sync + 'static> Clone for Observable<T> {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(), // shares the same watch channel
            updates: self.updates.clone(),
            metadata: self.metadata.clone(),
        }
    }
}

/// Metadata for an observable signal
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObservableMetadata {
    /// Signal name (unique within its device)
    pub name: String,
    /// Human-readable description
    pub description: Option<String>,
    /// Engineering units (e.g., "mA", "V", "mm")
    pub units: Option<String>,
    /// Whether scripts may write this signal
    pub read_only: bool,
}

impl<T> Observable<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Create a new observable with an initial value.
    pub fn new(name: impl Into<String>, initial_value: T) -> Self {
        let (sender, _) = watch::channel(initial_value);
        let (updates, _) = broadcast::channel(UPDATE_CAPACITY);
        Self {
            sender,
            updates,
            metadata: ObservableMetadata {
                name: name.into(),
                description: None,
                units: None,
                read_only: false,
            },
        }
    }

    /// Add a description to this observable.
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.metadata.description = Some(description.into());
        self
    }

    /// Add units to this observable.
    pub fn with_units(mut self, units: impl Into<String>) -> Self {
        self.metadata.units = Some(units.into());
        self
    }

    /// Mark this observable as read-only for writers outside the device.
    pub fn read_only(mut self) -> Self {
        self.metadata.read_only = true;
        self
    }

    /// Get the current value (clone).
    pub fn get(&self) -> T {
        self.sender.borrow().clone()
    }

    /// Get the signal name.
    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    /// Get the metadata.
    pub fn metadata(&self) -> &ObservableMetadata {
        &self.metadata
    }

    /// Set a new value, notifying all subscribers.
    ///
    /// Returns an error if the observable is read-only.
    pub fn set(&self, value: T) -> Result<()> {
        if self.metadata.read_only {
            return Err(anyhow!("Signal '{}' is read-only", self.metadata.name));
        }
        self.publish(value);
        Ok(())
    }

    /// Device-side update: always succeeds and notifies subscribers, even when
    /// the value did not change (monitor semantics).
    pub fn publish(&self, value: T) {
        self.sender.send_replace(value.clone());
        // no live subscription is not an error
        let _ = self.updates.send(value);
    }

    /// Subscribe to the latest value. Drop the receiver to unsubscribe.
    pub fn subscribe(&self) -> watch::Receiver<T> {
        self.sender.subscribe()
    }

    /// Subscribe to every update, starting with the current value.
    pub fn updates(&self) -> Subscription<T> {
        // join the stream first so nothing published after `get` is missed
        let updates = self.updates.subscribe();
        Subscription::new(self.get(), updates)
    }

    /// Check if there are any active subscribers.
    pub fn has_subscribers(&self) -> bool {
        self.subscriber_count() > 0
    }

    /// Get the number of active subscribers.
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count() + self.updates.receiver_count()
    }
}

#[async_trait]
impl Signal for Observable<SignalValue> {
    fn name(&self) -> &str {
        &self.metadata.name
    }

    async fn read(&self) -> Result<SignalValue> {
        Ok(self.get())
    }

    fn subscribe(&self) -> Subscription<SignalValue> {
        self.updates()
    }

    async fn write(&self, value: SignalValue) -> Result<()> {
        self.set(value)
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_observable_basic() {
        let obs = Observable::new("Pwr_I", SignalValue::Float(0.0));
        assert_eq!(obs.get(), SignalValue::Float(0.0));
        assert_eq!(obs.name(), "Pwr_I");

        obs.set(SignalValue::Float(4.2)).unwrap();
        assert_eq!(obs.get(), SignalValue::Float(4.2));
    }

    #[test]
    fn test_observable_read_only_allows_publish() {
        let obs = Observable::new("E_I", SignalValue::Float(0.0)).read_only();

        assert!(obs.set(SignalValue::Float(400.0)).is_err());
        obs.publish(SignalValue::Float(400.0));
        assert_eq!(obs.get(), SignalValue::Float(400.0));
    }

    #[tokio::test]
    async fn test_observable_subscription_and_drop() {
        let obs = Observable::new("RBV", SignalValue::Int(0));
        let mut rx = obs.subscribe();
        assert_eq!(obs.subscriber_count(), 1);

        obs.publish(SignalValue::Int(42));
        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), SignalValue::Int(42));

        drop(rx);
        assert!(!obs.has_subscribers());
    }

    #[tokio::test]
    async fn test_publish_same_value_still_notifies() {
        let obs = Observable::new("DMOV", SignalValue::Int(1));
        let mut rx = obs.subscribe();
        obs.publish(SignalValue::Int(1));
        assert!(rx.has_changed().unwrap());
    }

    #[tokio::test]
    async fn test_updates_keep_every_value() {
        let obs = Observable::new("Pwr_I", SignalValue::Float(0.0));
        let mut updates = obs.updates();
        assert_eq!(obs.subscriber_count(), 1);

        for v in [3.0, 6.0, 3.0] {
            obs.publish(SignalValue::Float(v));
        }
        let mut seen = Vec::new();
        for _ in 0..4 {
            seen.push(updates.recv().await.unwrap());
        }
        assert_eq!(
            seen,
            vec![
                SignalValue::Float(0.0),
                SignalValue::Float(3.0),
                SignalValue::Float(6.0),
                SignalValue::Float(3.0),
            ]
        );

        drop(updates);
        assert!(!obs.has_subscribers());
    }

    #[tokio::test]
    async fn test_updates_report_lag() {
        let obs = Observable::new("I_I", SignalValue::Int(0));
        let mut updates = obs.updates();
        for i in 0..=UPDATE_CAPACITY as i64 {
            obs.publish(SignalValue::Int(i));
        }
        assert_eq!(updates.recv().await.unwrap(), SignalValue::Int(0));
        assert!(matches!(updates.recv().await, Err(RecvError::Lagged(_))));
    }

    #[test]
    fn test_signal_value_numeric_view() {
        assert_eq!(SignalValue::Int(3).as_f64(), Some(3.0));
        assert_eq!(SignalValue::from("2.5").as_f64(), Some(2.5));
        assert_eq!(SignalValue::from("Enable").as_f64(), None);
        assert_eq!(SignalValue::from("Enable").to_string(), "Enable");
    }
}
