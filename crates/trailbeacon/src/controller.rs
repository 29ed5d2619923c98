//! Retry/backoff controller.
//!
//! The controller is the only component that sends samples. It walks the
//! durable queue head-first, one attempt at a time:
//!
//! ```text
//!   Idle ──queue non-empty──▶ Attempting ──success──▶ Idle
//!                                 │
//!                              failure
//!                                 ▼
//!                            BackingOff ──delay elapsed──▶ Attempting
//! ```
//!
//! A failed entry stays at the head of the queue, so newer samples never
//! overtake older ones. The controller exclusively owns the [`FailureStreak`];
//! everyone else sees it through [`ControllerSnapshot`]s published on a watch
//! channel.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{broadcast, watch, Notify};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::Result;
use crate::notify::FallbackNotifier;
use crate::pipeline::PipelineEvent;
use crate::queue::DurableQueue;
use crate::sample::LocationSample;
use crate::transmit::{Ack, Transmit, TransmitError};

/// Default first retry delay.
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_secs(5);
/// Default ceiling on the retry delay.
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(600);
/// Default number of consecutive failures that triggers the fallback.
pub const DEFAULT_FAILURE_THRESHOLD: u32 = 3;

/// Consecutive delivery failures since the last success.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FailureStreak {
    consecutive_failures: u32,
    threshold_reached: bool,
}

impl FailureStreak {
    /// A streak with no failures.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            consecutive_failures: 0,
            threshold_reached: false,
        }
    }

    /// Failures since the last success.
    #[must_use]
    pub const fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// Whether the fallback threshold has been crossed during this streak.
    #[must_use]
    pub const fn threshold_reached(&self) -> bool {
        self.threshold_reached
    }

    /// Count one failure. Returns `true` only on the failure that first
    /// reaches `threshold`.
    pub fn record_failure(&mut self, threshold: u32) -> bool {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        if !self.threshold_reached && self.consecutive_failures >= threshold {
            self.threshold_reached = true;
            return true;
        }
        false
    }

    /// Clear the streak after a successful delivery.
    pub fn reset(&mut self) {
        *self = Self::new();
    }
}

/// Exponential backoff with a ceiling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    /// Delay after the first failure.
    pub base: Duration,
    /// Upper bound on any delay.
    pub max: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: DEFAULT_BASE_DELAY,
            max: DEFAULT_MAX_DELAY,
        }
    }
}

impl BackoffPolicy {
    /// Delay before the next attempt after `failures` consecutive failures.
    ///
    /// The first failure waits `base`, each further failure doubles it, and
    /// nothing waits longer than `max`.
    #[must_use]
    pub fn delay_for(&self, failures: u32) -> Duration {
        if failures == 0 {
            return Duration::ZERO;
        }
        let exponent = (failures - 1).min(31);
        self.base
            .checked_mul(1u32 << exponent)
            .map_or(self.max, |d| d.min(self.max))
    }
}

/// Where the controller is in its attempt cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ControllerState {
    /// Nothing to send.
    #[default]
    Idle,
    /// A send for this entry is in flight.
    Attempting {
        /// Entry being sent.
        sequence_id: i64,
    },
    /// Waiting before retrying the queue head.
    BackingOff {
        /// How long the wait is.
        delay: Duration,
    },
}

/// Point-in-time view of the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ControllerSnapshot {
    /// Current state.
    pub state: ControllerState,
    /// Current failure streak.
    pub streak: FailureStreak,
    /// When a sample was last delivered.
    pub last_success_at: Option<DateTime<Utc>>,
}

/// Result of one pass of [`RetryController::attempt_next`].
#[derive(Debug, Clone, PartialEq)]
pub enum AttemptOutcome {
    /// The queue was empty.
    Empty,
    /// The head entry was delivered and removed.
    Delivered {
        /// Delivered entry.
        sequence_id: i64,
        /// Collector acknowledgement.
        ack: Ack,
    },
    /// The head entry could not be delivered and stays queued.
    Failed {
        /// Entry that failed.
        sequence_id: i64,
        /// Backoff before the next attempt.
        delay: Duration,
        /// Why it failed.
        error: TransmitError,
    },
}

/// Drives delivery of queued samples.
pub struct RetryController {
    queue: DurableQueue,
    transmitter: Arc<dyn Transmit>,
    notifier: FallbackNotifier,
    policy: BackoffPolicy,
    failure_threshold: u32,
    streak: FailureStreak,
    state: ControllerState,
    last_success_at: Option<DateTime<Utc>>,
    /// When the current backoff started: the moment the last failure was seen.
    failed_at: Instant,
    snapshots: watch::Sender<ControllerSnapshot>,
    events: broadcast::Sender<PipelineEvent>,
}

impl std::fmt::Debug for RetryController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryController")
            .field("policy", &self.policy)
            .field("failure_threshold", &self.failure_threshold)
            .field("streak", &self.streak)
            .field("state", &self.state)
            .field("last_success_at", &self.last_success_at)
            .finish_non_exhaustive()
    }
}

impl RetryController {
    /// Create a controller. The last success time is restored from storage.
    ///
    /// A `failure_threshold` of zero is treated as one.
    #[must_use]
    pub fn new(
        queue: DurableQueue,
        transmitter: Arc<dyn Transmit>,
        notifier: FallbackNotifier,
        policy: BackoffPolicy,
        failure_threshold: u32,
        events: broadcast::Sender<PipelineEvent>,
    ) -> Self {
        let last_success_at = queue.storage().last_success_at().unwrap_or_else(|e| {
            warn!(error = %e, "Could not read last success time");
            None
        });
        let (snapshots, _) = watch::channel(ControllerSnapshot {
            last_success_at,
            ..ControllerSnapshot::default()
        });

        Self {
            queue,
            transmitter,
            notifier,
            policy,
            failure_threshold: failure_threshold.max(1),
            streak: FailureStreak::new(),
            state: ControllerState::Idle,
            last_success_at,
            failed_at: Instant::now(),
            snapshots,
            events,
        }
    }

    /// Watch the controller's state.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<ControllerSnapshot> {
        self.snapshots.subscribe()
    }

    /// Current state.
    #[must_use]
    pub fn state(&self) -> ControllerState {
        self.state
    }

    /// Current failure streak.
    #[must_use]
    pub fn streak(&self) -> FailureStreak {
        self.streak
    }

    /// When a sample was last delivered.
    #[must_use]
    pub fn last_success_at(&self) -> Option<DateTime<Utc>> {
        self.last_success_at
    }

    fn set_state(&mut self, state: ControllerState) {
        self.state = state;
        self.snapshots.send_replace(ControllerSnapshot {
            state,
            streak: self.streak,
            last_success_at: self.last_success_at,
        });
    }

    fn emit(&self, event: PipelineEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    /// Make one delivery attempt for the queue head.
    ///
    /// # Errors
    ///
    /// Returns an error only if the queue cannot be read. Delivery failures
    /// are reported through [`AttemptOutcome::Failed`].
    pub async fn attempt_next(&mut self) -> Result<AttemptOutcome> {
        let entry = match self.queue.peek_oldest() {
            Ok(Some(entry)) => entry,
            Ok(None) => {
                self.set_state(ControllerState::Idle);
                return Ok(AttemptOutcome::Empty);
            }
            Err(e) => {
                self.set_state(ControllerState::Idle);
                return Err(e);
            }
        };

        let sequence_id = entry.sequence_id;
        self.set_state(ControllerState::Attempting { sequence_id });
        debug!(sequence_id, attempts = entry.attempts, "Attempting delivery");

        match self.transmitter.send(&entry.sample).await {
            Ok(ack) => {
                self.on_success(sequence_id);
                self.emit(PipelineEvent::Delivered {
                    sequence_id,
                    ack: ack.clone(),
                });
                Ok(AttemptOutcome::Delivered { sequence_id, ack })
            }
            Err(error) => {
                let delay = self.on_failure(sequence_id, &entry.sample, &error).await;
                Ok(AttemptOutcome::Failed {
                    sequence_id,
                    delay,
                    error,
                })
            }
        }
    }

    fn on_success(&mut self, sequence_id: i64) {
        if let Err(e) = self.queue.acknowledge(sequence_id) {
            // The entry will be sent again; the collector tolerates duplicates.
            warn!(sequence_id, error = %e, "Delivered but could not acknowledge");
        }

        let now = Utc::now();
        if let Err(e) = self.queue.storage().set_last_success_at(now) {
            warn!(error = %e, "Could not persist last success time");
        }
        self.streak.reset();
        self.last_success_at = Some(now);
        self.set_state(ControllerState::Idle);
        info!(sequence_id, "Sample delivered");
    }

    async fn on_failure(
        &mut self,
        sequence_id: i64,
        sample: &LocationSample,
        error: &TransmitError,
    ) -> Duration {
        if let Err(e) = self.queue.record_attempt(sequence_id) {
            warn!(sequence_id, error = %e, "Could not record delivery attempt");
        }

        self.failed_at = Instant::now();
        let crossed = self.streak.record_failure(self.failure_threshold);
        let failures = self.streak.consecutive_failures();
        let delay = self.policy.delay_for(failures);
        self.set_state(ControllerState::BackingOff { delay });

        warn!(
            sequence_id,
            consecutive_failures = failures,
            retry_in = ?delay,
            error = %error,
            "Delivery failed"
        );
        self.emit(PipelineEvent::DeliveryFailed {
            sequence_id,
            error: error.clone(),
            consecutive_failures: failures,
            retry_in: delay,
        });

        if crossed {
            error!(
                consecutive_failures = failures,
                threshold = self.failure_threshold,
                "Delivery failure threshold reached, sending emergency message"
            );
            self.fire_fallback(sample).await;
        }

        delay
    }

    async fn fire_fallback(&self, sample: &LocationSample) {
        match self.notifier.notify(sample).await {
            Ok(()) => self.emit(PipelineEvent::FallbackNotified {
                sample: sample.clone(),
            }),
            Err(e) => {
                error!(error = %e, "Emergency message failed");
                self.emit(PipelineEvent::FallbackFailed { error: e });
            }
        }
    }

    /// Deliver queued samples until `cancel` fires.
    ///
    /// `wake` is signalled whenever a sample is enqueued. Cancellation is only
    /// observed between attempts, so an in-flight send always finishes or
    /// times out first.
    ///
    /// The backoff delay is measured from the failure, so time spent sending
    /// the emergency message counts towards it.
    pub async fn run(mut self, wake: Arc<Notify>, cancel: CancellationToken) {
        info!(
            base_delay = ?self.policy.base,
            max_delay = ?self.policy.max,
            threshold = self.failure_threshold,
            "Retry controller started"
        );

        while !cancel.is_cancelled() {
            let resume_at = match self.attempt_next().await {
                Ok(AttemptOutcome::Delivered { .. }) => continue,
                Ok(AttemptOutcome::Empty) => None,
                Ok(AttemptOutcome::Failed { delay, .. }) => Some(self.failed_at + delay),
                Err(e) => {
                    warn!(error = %e, "Could not read queue");
                    Some(Instant::now() + self.policy.base)
                }
            };

            match resume_at {
                None => {
                    tokio::select! {
                        () = cancel.cancelled() => break,
                        () = wake.notified() => {}
                    }
                }
                Some(deadline) => {
                    tokio::select! {
                        () = cancel.cancelled() => break,
                        () = tokio::time::sleep_until(deadline) => {}
                    }
                }
            }
        }

        self.set_state(ControllerState::Idle);
        info!("Retry controller stopped");
    }
}
