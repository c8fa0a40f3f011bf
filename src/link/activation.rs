//! Connection activation with bounded retries
//!
//! [`ActivationController`] owns one [`LinkClient`] and drives it through
//! activate/deactivate cycles:
//!
//! - attempts are sequential, never concurrent, with exponential backoff
//!   between them
//! - the first successful attempt runs the `on_connected` hook exactly once
//! - running out of attempts is reported as [`Activation::Exhausted`], not as
//!   an error
//! - deactivation is idempotent and never fails
//! - one cycle at a time; concurrent requests queue on the cycle lock
//!
//! Every attempt and every backoff sleep races the controller's
//! [`CancellationToken`].

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::error::{LightwaveError, Result};
use crate::link::LinkClient;

/// Retry and backoff settings for activation.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts including the first one. Zero is treated as one.
    pub max_attempts: u32,
    /// Delay before the second attempt.
    pub initial_backoff: Duration,
    /// Upper bound for any delay.
    pub max_backoff: Duration,
    /// Growth factor between consecutive delays.
    pub multiplier: f64,
    /// Deadline for a single `connect` call.
    pub attempt_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::production()
    }
}

impl RetryPolicy {
    /// Policy for validating credentials while a user waits: three attempts,
    /// no delay.
    pub fn interactive() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
            multiplier: 1.0,
            attempt_timeout: Duration::from_secs(30),
        }
    }

    /// Policy for installation setup: six attempts, 1 s doubling to 30 s.
    pub fn production() -> Self {
        Self {
            max_attempts: 6,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
            multiplier: 2.0,
            attempt_timeout: Duration::from_secs(30),
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Delay to wait before attempt number `attempt` (1-based).
    ///
    /// # Examples
    ///
    /// ```
    /// use std::time::Duration;
    /// use lightwave_smart::link::activation::RetryPolicy;
    ///
    /// let policy = RetryPolicy::production();
    /// assert_eq!(policy.backoff_before(1), Duration::ZERO);
    /// assert_eq!(policy.backoff_before(2), Duration::from_secs(1));
    /// assert_eq!(policy.backoff_before(3), Duration::from_secs(2));
    /// assert_eq!(policy.backoff_before(10), Duration::from_secs(30));
    /// ```
    pub fn backoff_before(&self, attempt: u32) -> Duration {
        if attempt <= 1 || self.initial_backoff.is_zero() {
            return Duration::ZERO;
        }
        let factor = self.multiplier.max(1.0).powi(attempt as i32 - 2);
        let millis = self.initial_backoff.as_millis() as f64 * factor;
        let capped = millis.min(self.max_backoff.as_millis() as f64);
        Duration::from_millis(capped as u64)
    }

    fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }
}

/// Outcome of [`ActivationController::activate`].
#[derive(Debug)]
pub enum Activation<T> {
    /// Connected; carries the `on_connected` result.
    Connected(T),
    /// Every attempt failed.
    Exhausted {
        attempts: u32,
        /// Error from the last attempt. `None` when the backend refused
        /// without an error.
        last_error: Option<anyhow::Error>,
    },
}

impl<T> Activation<T> {
    pub fn is_connected(&self) -> bool {
        matches!(self, Activation::Connected(_))
    }
}

/// Drives one link through activate/deactivate cycles.
#[derive(Debug)]
pub struct ActivationController {
    link: Arc<dyn LinkClient>,
    connected: AtomicBool,
    cycle: Mutex<()>,
    cancel: CancellationToken,
}

impl ActivationController {
    pub fn new(link: Arc<dyn LinkClient>, cancel: CancellationToken) -> Self {
        Self {
            link,
            connected: AtomicBool::new(false),
            cycle: Mutex::new(()),
            cancel,
        }
    }

    pub fn link(&self) -> &Arc<dyn LinkClient> {
        &self.link
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Connects the link and runs `on_connected` once.
    ///
    /// An already-connected link skips straight to `on_connected`. A
    /// credential rejection reported as
    /// [`LightwaveError::InvalidAuth`] stops retrying early.
    ///
    /// # Errors
    ///
    /// Returns [`LightwaveError::Cancelled`] if the controller's token fires,
    /// [`LightwaveError::CannotConnect`] if `on_connected` outlives the
    /// policy's attempt timeout, or the error of `on_connected`. Connection
    /// failures are not errors; see [`Activation::Exhausted`].
    pub async fn activate<T, F, Fut>(
        &self,
        policy: &RetryPolicy,
        on_connected: F,
    ) -> Result<Activation<T>>
    where
        F: FnOnce(Arc<dyn LinkClient>) -> Fut + Send,
        Fut: Future<Output = Result<T>> + Send,
        T: Send,
    {
        let _cycle = self.cycle.lock().await;

        if self.is_connected() {
            tracing::debug!("Link already connected, skipping connect");
            return Ok(Activation::Connected(
                self.bounded(
                    "post-connect work",
                    policy.attempt_timeout,
                    on_connected(Arc::clone(&self.link)),
                )
                .await?,
            ));
        }

        let max_attempts = policy.attempts();
        let mut last_error = None;

        for attempt in 1..=max_attempts {
            let backoff = policy.backoff_before(attempt);
            if !backoff.is_zero() {
                tracing::debug!("Waiting {:?} before connect attempt {}", backoff, attempt);
                tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => return Err(LightwaveError::Cancelled.into()),
                    _ = tokio::time::sleep(backoff) => {}
                }
            }

            let outcome = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(LightwaveError::Cancelled.into()),
                outcome = tokio::time::timeout(policy.attempt_timeout, self.link.connect()) => outcome,
            };

            match outcome {
                Ok(Ok(true)) => {
                    self.connected.store(true, Ordering::SeqCst);
                    if attempt > 1 {
                        tracing::info!("Connected after {} attempts", attempt);
                    } else {
                        tracing::debug!("Connected");
                    }
                    return Ok(Activation::Connected(
                        self.bounded(
                            "post-connect work",
                            policy.attempt_timeout,
                            on_connected(Arc::clone(&self.link)),
                        )
                        .await?,
                    ));
                }
                Ok(Ok(false)) => {
                    tracing::warn!("Connect attempt {}/{} refused", attempt, max_attempts);
                    last_error = None;
                }
                Ok(Err(e)) => {
                    tracing::warn!(
                        "Connect attempt {}/{} failed: {}",
                        attempt,
                        max_attempts,
                        e
                    );
                    let permanent = matches!(
                        e.downcast_ref::<LightwaveError>(),
                        Some(LightwaveError::InvalidAuth(_))
                    );
                    last_error = Some(e);
                    if permanent {
                        return Ok(Activation::Exhausted {
                            attempts: attempt,
                            last_error,
                        });
                    }
                }
                Err(_) => {
                    tracing::warn!(
                        "Connect attempt {}/{} timed out after {:?}",
                        attempt,
                        max_attempts,
                        policy.attempt_timeout
                    );
                    last_error = Some(
                        LightwaveError::CannotConnect(format!(
                            "connect timed out after {:?}",
                            policy.attempt_timeout
                        ))
                        .into(),
                    );
                }
            }
        }

        tracing::warn!("Giving up after {} connect attempts", max_attempts);
        Ok(Activation::Exhausted {
            attempts: max_attempts,
            last_error,
        })
    }

    /// Runs `operation` against the connected link, giving up after `limit`
    /// or as soon as the controller's token fires.
    ///
    /// # Errors
    ///
    /// Returns [`LightwaveError::Cancelled`] on cancellation,
    /// [`LightwaveError::CannotConnect`] on timeout, or the error of
    /// `operation`.
    pub async fn bounded<T, Fut>(&self, what: &str, limit: Duration, operation: Fut) -> Result<T>
    where
        Fut: Future<Output = Result<T>>,
    {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(LightwaveError::Cancelled.into()),
            outcome = tokio::time::timeout(limit, operation) => match outcome {
                Ok(result) => result,
                Err(_) => {
                    tracing::warn!("{} timed out after {:?}", what, limit);
                    Err(LightwaveError::CannotConnect(format!(
                        "{} timed out after {:?}",
                        what, limit
                    ))
                    .into())
                }
            },
        }
    }

    /// Closes the link.
    ///
    /// The controller records itself as disconnected before the transport is
    /// closed. Close failures are logged and swallowed. Calling this on a
    /// controller that is not connected does nothing.
    pub async fn deactivate(&self, reason: &str) {
        let _cycle = self.cycle.lock().await;

        if !self.connected.swap(false, Ordering::SeqCst) {
            tracing::debug!("Link not connected, nothing to deactivate");
            return;
        }

        tracing::debug!("Deactivating link: {}", reason);
        if let Err(e) = self.link.disconnect(reason).await {
            tracing::warn!("Error while closing link ({}): {}", reason, e);
        }
    }

    /// Closes the transport whether or not an attempt completed.
    ///
    /// Used for transient links, where a failed or panicked attempt may have
    /// left a half-open socket behind. Close failures are logged and
    /// swallowed.
    pub async fn close(&self, reason: &str) {
        let _cycle = self.cycle.lock().await;
        self.connected.store(false, Ordering::SeqCst);

        tracing::debug!("Closing link: {}", reason);
        if let Err(e) = self.link.disconnect(reason).await {
            tracing::warn!("Error while closing link ({}): {}", reason, e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::fake::{ConnectOutcome, FakeLink};

    fn controller(link: &Arc<FakeLink>) -> ActivationController {
        ActivationController::new(link.clone(), CancellationToken::new())
    }

    #[test]
    fn test_interactive_policy_has_no_backoff() {
        let policy = RetryPolicy::interactive();
        assert_eq!(policy.max_attempts, 3);
        for attempt in 1..=3 {
            assert_eq!(policy.backoff_before(attempt), Duration::ZERO);
        }
    }

    #[test]
    fn test_zero_attempts_means_one() {
        assert_eq!(RetryPolicy::interactive().with_max_attempts(0).attempts(), 1);
    }

    #[tokio::test]
    async fn test_stops_early_on_invalid_auth() {
        let link = Arc::new(FakeLink::new());
        link.script_connect([
            ConnectOutcome::AuthError("bad password".to_string()),
            ConnectOutcome::Connected,
        ]);
        let controller = controller(&link);

        let result = controller
            .activate(&RetryPolicy::interactive(), |_| async { Ok(()) })
            .await
            .unwrap();

        assert!(matches!(result, Activation::Exhausted { attempts: 1, .. }));
        assert_eq!(link.connect_calls(), 1);
    }

    #[tokio::test]
    async fn test_refusals_exhaust_without_error() {
        let link = Arc::new(FakeLink::new());
        link.script_connect([
            ConnectOutcome::Refused,
            ConnectOutcome::Refused,
            ConnectOutcome::Refused,
        ]);
        let controller = controller(&link);

        let result = controller
            .activate(&RetryPolicy::interactive(), |_| async { Ok(()) })
            .await
            .unwrap();

        match result {
            Activation::Exhausted {
                attempts,
                last_error,
            } => {
                assert_eq!(attempts, 3);
                assert!(last_error.is_none());
            }
            Activation::Connected(_) => panic!("expected exhaustion"),
        }
        assert!(!controller.is_connected());
    }

    #[tokio::test]
    async fn test_activate_when_connected_skips_connect() {
        let link = Arc::new(FakeLink::new());
        let controller = controller(&link);

        controller
            .activate(&RetryPolicy::interactive(), |_| async { Ok(()) })
            .await
            .unwrap();
        controller
            .activate(&RetryPolicy::interactive(), |_| async { Ok(()) })
            .await
            .unwrap();

        assert_eq!(link.connect_calls(), 1);
    }

    #[tokio::test]
    async fn test_deactivate_twice_closes_once() {
        let link = Arc::new(FakeLink::new());
        let controller = controller(&link);
        controller
            .activate(&RetryPolicy::interactive(), |_| async { Ok(()) })
            .await
            .unwrap();

        controller.deactivate("test").await;
        controller.deactivate("test").await;

        assert_eq!(link.disconnect_calls(), 1);
        assert!(!controller.is_connected());
    }

    #[tokio::test]
    async fn test_deactivate_swallows_close_error() {
        let link = Arc::new(FakeLink::new());
        link.fail_disconnect(true);
        let controller = controller(&link);
        controller
            .activate(&RetryPolicy::interactive(), |_| async { Ok(()) })
            .await
            .unwrap();

        controller.deactivate("test").await;
        assert!(!controller.is_connected());
    }

    #[tokio::test]
    async fn test_cancelled_before_first_attempt() {
        let link = Arc::new(FakeLink::new());
        link.script_connect([ConnectOutcome::Fail("down".to_string())]);
        let cancel = CancellationToken::new();
        let controller = ActivationController::new(link.clone(), cancel.clone());

        let policy = RetryPolicy {
            initial_backoff: Duration::from_secs(60),
            max_backoff: Duration::from_secs(60),
            ..RetryPolicy::production()
        };

        cancel.cancel();
        let err = controller
            .activate(&policy, |_| async { Ok(()) })
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<LightwaveError>(),
            Some(LightwaveError::Cancelled)
        ));
    }
}
