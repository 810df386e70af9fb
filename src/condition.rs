//! Condition watcher for `waitai` / `waitdi`.
//!
//! A [`ConditionRequest`] names a signal, a target, a comparison operator, a
//! tolerance and an optional timeout. [`ConditionWatcher::watch`] subscribes to
//! the signal's update stream and evaluates every update in order, resolving
//! on the first one that satisfies the predicate, or with
//! [`ConditionOutcome::TimedOut`] once the timeout elapses. Subscribing
//! delivers the current value first, like a channel monitor, so a condition
//! that already holds resolves immediately.
//!
//! The subscription is owned by the wait future: it is
//! dropped on resolution, on timeout and when the future itself is dropped
//! (cancellation), so nothing keeps listening after the wait is over.
//!
//! # Example
//!
//! ```rust,ignore
//! let request = ConditionRequest::new(signal, 5.0, Operator::GreaterEqual)
//!     .with_tolerance(0.1)
//!     .with_timeout(Some(Duration::from_secs(30)));
//!
//! match ConditionWatcher::new().watch(&request).await? {
//!     ConditionOutcome::Satisfied => println!("reached"),
//!     ConditionOutcome::TimedOut => println!("gave up"),
//! }
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::error::{AppResult, DaqError};
use crate::hardware::{Signal, SignalValue};

// =============================================================================
// Operator
// =============================================================================

/// Comparison operators accepted by wait instructions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operator {
    Less,
    LessEqual,
    Greater,
    GreaterEqual,
    Equal,
    NotEqual,
}

impl Operator {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operator::Less => "<",
            Operator::LessEqual => "<=",
            Operator::Greater => ">",
            Operator::GreaterEqual => ">=",
            Operator::Equal => "==",
            Operator::NotEqual => "!=",
        }
    }

    /// Evaluate `value <op> target` with a symmetric tolerance band.
    ///
    /// Ordering operators widen towards the satisfied side by `tolerance`;
    /// `==` accepts the closed band `[target - tol, target + tol]` and `!=`
    /// everything strictly outside it.
    pub fn evaluate(&self, value: f64, target: f64, tolerance: f64) -> bool {
        match self {
            Operator::Less => value < target + tolerance,
            Operator::LessEqual => value <= target + tolerance,
            Operator::Greater => value > target - tolerance,
            Operator::GreaterEqual => value >= target - tolerance,
            Operator::Equal => target - tolerance <= value && value <= target + tolerance,
            Operator::NotEqual => value < target - tolerance || value > target + tolerance,
        }
    }
}

impl FromStr for Operator {
    type Err = DaqError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "<" => Ok(Operator::Less),
            "<=" => Ok(Operator::LessEqual),
            ">" => Ok(Operator::Greater),
            ">=" => Ok(Operator::GreaterEqual),
            "==" | "=" => Ok(Operator::Equal),
            "!=" => Ok(Operator::NotEqual),
            other => Err(DaqError::InvalidOperator(other.to_string())),
        }
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Request / outcome / progress
// =============================================================================

/// One wait: lives until the watcher resolves it.
#[derive(Clone)]
pub struct ConditionRequest {
    signal: Arc<dyn Signal>,
    target: f64,
    operator: Operator,
    tolerance: f64,
    timeout: Option<Duration>,
}

impl ConditionRequest {
    pub fn new(signal: Arc<dyn Signal>, target: f64, operator: Operator) -> Self {
        Self {
            signal,
            target,
            operator,
            tolerance: 0.0,
            timeout: None,
        }
    }

    /// Negative (and NaN) tolerances are clamped to zero.
    pub fn with_tolerance(mut self, tolerance: f64) -> Self {
        self.tolerance = if tolerance > 0.0 { tolerance } else { 0.0 };
        self
    }

    /// `None` waits indefinitely.
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn signal_name(&self) -> &str {
        self.signal.name()
    }

    pub fn target(&self) -> f64 {
        self.target
    }

    pub fn operator(&self) -> Operator {
        self.operator
    }

    pub fn tolerance(&self) -> f64 {
        self.tolerance
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Non-numeric values never satisfy a condition.
    pub fn is_satisfied(&self, value: &SignalValue) -> bool {
        value
            .as_f64()
            .is_some_and(|v| self.operator.evaluate(v, self.target, self.tolerance))
    }
}

impl fmt::Debug for ConditionRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConditionRequest")
            .field("signal", &self.signal.name())
            .field("target", &self.target)
            .field("operator", &self.operator)
            .field("tolerance", &self.tolerance)
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// How a wait ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConditionOutcome {
    Satisfied,
    TimedOut,
}

/// Progress snapshot emitted on every update while a wait is pending.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConditionProgress {
    pub name: String,
    pub current: Option<f64>,
    pub initial: Option<f64>,
    pub target: f64,
    /// `None` when unavailable (zero distance at start, non-numeric values).
    pub fraction: Option<f64>,
    pub elapsed: Duration,
}

/// `clamp(|target - current| / |initial - target|, 0, 1)`, or `None` when the
/// denominator is zero or the result is not a number.
pub fn progress_fraction(initial: f64, current: f64, target: f64) -> Option<f64> {
    let denominator = (initial - target).abs();
    if denominator == 0.0 {
        return None;
    }
    let fraction = (target - current).abs() / denominator;
    if fraction.is_nan() {
        None
    } else {
        Some(fraction.clamp(0.0, 1.0))
    }
}

// =============================================================================
// ConditionWatcher
// =============================================================================

/// Resolves condition requests against live signal updates.
#[derive(Debug, Clone, Default)]
pub struct ConditionWatcher {
    progress: Option<mpsc::UnboundedSender<ConditionProgress>>,
}

impl ConditionWatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Send a [`ConditionProgress`] snapshot for every update seen while waiting.
    pub fn with_progress(mut self, observer: mpsc::UnboundedSender<ConditionProgress>) -> Self {
        self.progress = Some(observer);
        self
    }

    /// Wait for `request` to be satisfied or to time out.
    ///
    /// Exactly one outcome is produced. An error is returned if the signal's
    /// update stream closes while the wait is pending, or if the wait fell so
    /// far behind that updates were dropped before being evaluated.
    pub async fn watch(&self, request: &ConditionRequest) -> AppResult<ConditionOutcome> {
        let mut updates = request.signal.subscribe();
        let started = Instant::now();
        debug!(
            signal = request.signal_name(),
            operator = %request.operator,
            target = request.target,
            tolerance = request.tolerance,
            timeout = ?request.timeout,
            "waiting for condition"
        );

        let wait = async move {
            let mut initial = None;
            loop {
                let value = match updates.recv().await {
                    Ok(value) => value,
                    Err(RecvError::Lagged(missed)) => {
                        return Err(DaqError::Instrument(format!(
                            "missed {} update(s) of '{}' while a condition was pending",
                            missed,
                            request.signal_name()
                        )))
                    }
                    Err(RecvError::Closed) => {
                        return Err(DaqError::Instrument(format!(
                            "signal '{}' stopped publishing while a condition was pending",
                            request.signal_name()
                        )))
                    }
                };
                trace!(signal = request.signal_name(), %value, "condition update");
                let initial = *initial.get_or_insert(value.as_f64());
                self.report(request, initial, &value, started);
                if request.is_satisfied(&value) {
                    return Ok(ConditionOutcome::Satisfied);
                }
            }
        };

        let outcome = match request.timeout {
            Some(timeout) => match tokio::time::timeout(timeout, wait).await {
                Ok(result) => result?,
                Err(_) => ConditionOutcome::TimedOut,
            },
            None => wait.await?,
        };
        debug!(
            signal = request.signal_name(),
            ?outcome,
            elapsed = ?started.elapsed(),
            "condition resolved"
        );
        Ok(outcome)
    }

    fn report(
        &self,
        request: &ConditionRequest,
        initial: Option<f64>,
        value: &SignalValue,
        started: Instant,
    ) {
        let Some(progress) = &self.progress else {
            return;
        };
        let current = value.as_f64();
        let fraction = match (initial, current) {
            (Some(initial), Some(current)) => progress_fraction(initial, current, request.target),
            _ => None,
        };
        // A closed observer only means nobody is watching progress anymore.
        let _ = progress.send(ConditionProgress {
            name: request.signal_name().to_string(),
            current,
            initial,
            target: request.target,
            fraction,
            elapsed: started.elapsed(),
        });
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::Observable;
    use tokio::time::sleep;

    fn signal(initial: f64) -> (Observable<SignalValue>, Arc<dyn Signal>) {
        let obs = Observable::new("test_signal", SignalValue::Float(initial));
        let handle: Arc<dyn Signal> = Arc::new(obs.clone());
        (obs, handle)
    }

    #[test]
    fn test_operator_parsing() {
        assert_eq!("<".parse::<Operator>().unwrap(), Operator::Less);
        assert_eq!("=".parse::<Operator>().unwrap(), Operator::Equal);
        assert_eq!("==".parse::<Operator>().unwrap(), Operator::Equal);
        assert_eq!(">=".parse::<Operator>().unwrap(), Operator::GreaterEqual);
        assert!(matches!(
            "=>".parse::<Operator>(),
            Err(DaqError::InvalidOperator(op)) if op == "=>"
        ));
    }

    #[test]
    fn test_equality_with_tolerance() {
        assert!(Operator::Equal.evaluate(10.4, 10.0, 0.5));
        assert!(!Operator::Equal.evaluate(10.6, 10.0, 0.5));
        assert!(Operator::Equal.evaluate(9.5, 10.0, 0.5));
        assert!(!Operator::NotEqual.evaluate(10.4, 10.0, 0.5));
        assert!(Operator::NotEqual.evaluate(10.6, 10.0, 0.5));
        assert!(!Operator::NotEqual.evaluate(10.0, 10.0, 0.0));
    }

    #[test]
    fn test_ordering_operators_without_tolerance() {
        assert!(Operator::Less.evaluate(4.9, 5.0, 0.0));
        assert!(!Operator::Less.evaluate(5.0, 5.0, 0.0));
        assert!(Operator::LessEqual.evaluate(5.0, 5.0, 0.0));
        assert!(!Operator::Greater.evaluate(5.0, 5.0, 0.0));
        assert!(Operator::GreaterEqual.evaluate(5.0, 5.0, 0.0));
        assert!(Operator::Greater.evaluate(4.95, 5.0, 0.1));
    }

    #[test]
    fn test_negative_tolerance_is_clamped() {
        let (_obs, handle) = signal(0.0);
        let request = ConditionRequest::new(handle, 1.0, Operator::Equal).with_tolerance(-3.0);
        assert_eq!(request.tolerance(), 0.0);
    }

    #[test]
    fn test_progress_fraction() {
        assert_eq!(progress_fraction(0.0, 5.0, 10.0), Some(0.5));
        assert_eq!(progress_fraction(0.0, 20.0, 10.0), Some(1.0));
        assert_eq!(progress_fraction(10.0, 3.0, 10.0), None);
        assert_eq!(progress_fraction(f64::NAN, 3.0, 10.0), None);
    }

    #[tokio::test]
    async fn test_resolves_at_third_update() {
        let (obs, handle) = signal(0.0);
        let request = ConditionRequest::new(handle, 5.0, Operator::GreaterEqual);
        let task = tokio::spawn(async move { ConditionWatcher::new().watch(&request).await });

        sleep(Duration::from_millis(20)).await;
        assert_eq!(obs.subscriber_count(), 1);

        obs.publish(SignalValue::Float(3.0));
        sleep(Duration::from_millis(20)).await;
        assert!(!task.is_finished());

        obs.publish(SignalValue::Float(4.0));
        sleep(Duration::from_millis(20)).await;
        assert!(!task.is_finished());

        obs.publish(SignalValue::Float(5.0));
        let outcome = task.await.unwrap().unwrap();
        assert_eq!(outcome, ConditionOutcome::Satisfied);
        assert_eq!(obs.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_brief_excursion_is_not_missed() {
        let (obs, handle) = signal(0.0);
        let request = ConditionRequest::new(handle, 5.0, Operator::GreaterEqual)
            .with_timeout(Some(Duration::from_millis(200)));
        let task = tokio::spawn(async move { ConditionWatcher::new().watch(&request).await });

        sleep(Duration::from_millis(20)).await;
        for v in [3.0, 6.0, 3.0] {
            obs.publish(SignalValue::Float(v));
        }

        assert_eq!(task.await.unwrap().unwrap(), ConditionOutcome::Satisfied);
        assert_eq!(obs.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_lagging_wait_is_an_error() {
        let (obs, handle) = signal(0.0);
        let request = ConditionRequest::new(handle, 1e9, Operator::GreaterEqual);
        let watcher = ConditionWatcher::new();

        // publish a full buffer before the wait gets to run
        let wait = watcher.watch(&request);
        tokio::pin!(wait);
        assert!(futures::poll!(wait.as_mut()).is_pending());
        for i in 0..=crate::hardware::observable::UPDATE_CAPACITY {
            obs.publish(SignalValue::Float(i as f64));
        }

        assert!(matches!(wait.await, Err(DaqError::Instrument(msg)) if msg.contains("missed")));
        assert_eq!(obs.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_already_satisfied_resolves_immediately() {
        let (_obs, handle) = signal(7.0);
        let request = ConditionRequest::new(handle, 5.0, Operator::Greater)
            .with_timeout(Some(Duration::from_millis(10)));
        let outcome = ConditionWatcher::new().watch(&request).await.unwrap();
        assert_eq!(outcome, ConditionOutcome::Satisfied);
    }

    #[tokio::test]
    async fn test_timeout_leaves_no_subscription() {
        let (obs, handle) = signal(0.0);
        let request = ConditionRequest::new(handle, 100.0, Operator::Greater)
            .with_timeout(Some(Duration::from_millis(100)));

        let feeder = {
            let obs = obs.clone();
            tokio::spawn(async move {
                for i in 0..5 {
                    obs.publish(SignalValue::Float(i as f64));
                    sleep(Duration::from_millis(10)).await;
                }
            })
        };

        let started = Instant::now();
        let outcome = ConditionWatcher::new().watch(&request).await.unwrap();
        assert_eq!(outcome, ConditionOutcome::TimedOut);
        assert!(started.elapsed() >= Duration::from_millis(100));
        assert_eq!(obs.subscriber_count(), 0);

        feeder.await.unwrap();
        obs.publish(SignalValue::Float(1000.0));
        assert!(!obs.has_subscribers());
    }

    #[tokio::test]
    async fn test_non_numeric_values_never_satisfy() {
        let obs = Observable::new("Enbl_Out_Cmd", SignalValue::from("Enable"));
        let handle: Arc<dyn Signal> = Arc::new(obs.clone());
        let request = ConditionRequest::new(handle, 0.0, Operator::Equal)
            .with_timeout(Some(Duration::from_millis(30)));
        let outcome = ConditionWatcher::new().watch(&request).await.unwrap();
        assert_eq!(outcome, ConditionOutcome::TimedOut);
    }

    #[tokio::test]
    async fn test_dropping_wait_unsubscribes() {
        let (obs, handle) = signal(0.0);
        let request = ConditionRequest::new(handle, 1.0, Operator::Equal);
        let task = tokio::spawn(async move { ConditionWatcher::new().watch(&request).await });

        sleep(Duration::from_millis(20)).await;
        assert_eq!(obs.subscriber_count(), 1);
        task.abort();
        let _ = task.await;
        assert_eq!(obs.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_progress_snapshots() {
        let (obs, handle) = signal(0.0);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let request = ConditionRequest::new(handle, 10.0, Operator::GreaterEqual);
        let watcher = ConditionWatcher::new().with_progress(tx);
        let task = tokio::spawn(async move { watcher.watch(&request).await });

        let first = rx.recv().await.unwrap();
        assert_eq!(first.initial, Some(0.0));
        assert_eq!(first.fraction, Some(1.0));

        obs.publish(SignalValue::Float(5.0));
        let second = rx.recv().await.unwrap();
        assert_eq!(second.current, Some(5.0));
        assert_eq!(second.fraction, Some(0.5));

        obs.publish(SignalValue::Float(10.0));
        assert_eq!(task.await.unwrap().unwrap(), ConditionOutcome::Satisfied);
        let last = rx.recv().await.unwrap();
        assert_eq!(last.fraction, Some(0.0));
    }
}
