//! The subscription aggregate: validation pipeline, eviction evaluation,
//! and timeout orchestration.
//!
//! A subscription is owned by a registry that serializes all access to it.
//! The one asynchronous element is the timeout timer, which runs on its own
//! thread and only ever posts a [`TimerEvent`]; the owner applies the event
//! on the serialized path after a generation check, so a timer that lost a
//! race against cancellation or an accepted reading is ignored.

use crate::error::{RelayError, Result};
use crate::policy::{
    effective_eviction_set, EvictionCondition, EvictionContext, FilterConfig, TimeoutPolicy,
};
use crate::types::{
    AuthorizationStatus, DeliveryOutcome, DiscardReason, FailureCause, Reading, SubscriptionId,
    SubscriptionMode,
};
use crossbeam_channel::{bounded, RecvTimeoutError, Sender};
use std::thread;
use tracing::{debug, trace};

/// Default listener channel capacity.
const DEFAULT_BUFFER_SIZE: usize = 64;

/// Caller-facing configuration for one subscription.
///
/// The eviction set given here is the *configured* set; the subscription
/// derives its effective set from it based on `mode`
/// (see [`effective_eviction_set`]).
#[derive(Clone, Debug)]
pub struct SubscriptionConfig {
    /// Optional human-readable name.
    pub name: Option<String>,

    /// Disabled subscriptions discard every reading with
    /// `RequestNotEnabled`.
    pub enabled: bool,

    /// Single-shot or continuous delivery.
    pub mode: SubscriptionMode,

    /// Accuracy/distance/interval thresholds.
    pub filter: FilterConfig,

    /// Timeout policy. `None` means "never times out automatically".
    pub timeout: Option<TimeoutPolicy>,

    /// Configured eviction conditions (OR-combined).
    pub eviction: Vec<EvictionCondition>,

    /// Max buffered outcome events per listener.
    pub buffer_size: usize,
}

impl Default for SubscriptionConfig {
    fn default() -> Self {
        Self {
            name: None,
            enabled: true,
            mode: SubscriptionMode::Continuous,
            filter: FilterConfig::default(),
            timeout: None,
            eviction: Vec::new(),
            buffer_size: DEFAULT_BUFFER_SIZE,
        }
    }
}

/// Posted by a timer thread when a timeout countdown elapses.
///
/// Carries the generation the timer was armed with; the owning subscription
/// ignores events whose generation no longer matches its live timer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TimerEvent {
    pub subscription: SubscriptionId,
    pub generation: u64,
}

/// Handle to a live single-shot timer.
struct TimerHandle {
    generation: u64,
    cancel: Sender<()>,
}

/// Live configuration and state tracking one listener's interest in a
/// stream of readings.
pub struct Subscription {
    id: SubscriptionId,
    name: Option<String>,
    enabled: bool,
    mode: SubscriptionMode,
    filter: FilterConfig,
    timeout: Option<TimeoutPolicy>,
    /// Effective eviction set, derived from the configured set and `mode`.
    eviction: Vec<EvictionCondition>,
    accepted_count: u64,
    error_occurred: bool,
    last_accepted: Option<Reading>,
    last_outcome: Option<DeliveryOutcome>,
    timer: Option<TimerHandle>,
    /// Monotonic token; bumped each time a timer is armed.
    timer_generation: u64,
}

impl Subscription {
    /// Build a subscription from its configuration.
    ///
    /// Fails with `InvalidConfig` on any violated invariant (negative
    /// threshold, zero timeout, zero receive count); a subscription with
    /// undefined behavior is never constructed.
    pub fn new(id: SubscriptionId, config: SubscriptionConfig) -> Result<Self> {
        config.filter.validate()?;
        if let Some(timeout) = &config.timeout {
            timeout.validate()?;
        }
        for condition in &config.eviction {
            condition.validate()?;
        }
        if config.buffer_size == 0 {
            // bounded(0) is a rendezvous channel; every try_send to the
            // listener would fail.
            return Err(RelayError::InvalidConfig(
                "buffer_size must be at least 1".to_string(),
            ));
        }

        let eviction = effective_eviction_set(config.mode, config.eviction);

        Ok(Self {
            id,
            name: config.name,
            enabled: config.enabled,
            mode: config.mode,
            filter: config.filter,
            timeout: config.timeout,
            eviction,
            accepted_count: 0,
            error_occurred: false,
            last_accepted: None,
            last_outcome: None,
            timer: None,
            timer_generation: 0,
        })
    }

    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        self.enabled = enabled;
    }

    pub fn mode(&self) -> SubscriptionMode {
        self.mode
    }

    pub fn filter(&self) -> &FilterConfig {
        &self.filter
    }

    pub fn timeout(&self) -> Option<&TimeoutPolicy> {
        self.timeout.as_ref()
    }

    /// The effective eviction set (post mode derivation).
    pub fn eviction_set(&self) -> &[EvictionCondition] {
        &self.eviction
    }

    pub fn accepted_count(&self) -> u64 {
        self.accepted_count
    }

    pub fn last_accepted(&self) -> Option<&Reading> {
        self.last_accepted.as_ref()
    }

    pub fn last_outcome(&self) -> Option<&DeliveryOutcome> {
        self.last_outcome.as_ref()
    }

    /// Whether a timer is currently armed.
    pub fn timer_running(&self) -> bool {
        self.timer.is_some()
    }

    /// Run one raw reading through the validation pipeline.
    ///
    /// Checks are strictly sequential and short-circuit at the first
    /// failure: enabled, accuracy, then (only when a baseline exists)
    /// distance and interval. The first-ever reading that clears the
    /// accuracy check becomes the baseline unconditionally.
    pub fn validate(&mut self, reading: &Reading) -> DeliveryOutcome {
        let outcome = self.run_checks(reading);

        if let DeliveryOutcome::Accepted { reading } = &outcome {
            self.last_accepted = Some(*reading);
            self.accepted_count += 1;
            trace!(
                subscription = %self.id,
                accepted = self.accepted_count,
                "reading accepted"
            );
        }
        self.last_outcome = Some(outcome.clone());
        outcome
    }

    fn run_checks(&self, reading: &Reading) -> DeliveryOutcome {
        if !self.enabled {
            return DeliveryOutcome::Discarded {
                reason: DiscardReason::RequestNotEnabled,
            };
        }

        if let Some(min_accuracy) = self.filter.min_accuracy {
            // Larger accuracy figure means worse.
            if reading.accuracy > min_accuracy {
                return DeliveryOutcome::Discarded {
                    reason: DiscardReason::NotMinAccuracy,
                };
            }
        }

        if let Some(last) = &self.last_accepted {
            if self.filter.distance_filter_enabled()
                && last.position.distance_to(&reading.position) < self.filter.min_distance_delta
            {
                return DeliveryOutcome::Discarded {
                    reason: DiscardReason::NotMinDistance,
                };
            }

            if let Some(interval) = self.filter.min_time_interval {
                if last.timestamp.elapsed() <= interval {
                    return DeliveryOutcome::Discarded {
                        reason: DiscardReason::NotMinInterval,
                    };
                }
            }
        }

        DeliveryOutcome::Accepted { reading: *reading }
    }

    /// Record a terminal failure (upstream acquisition error, permission
    /// denial). Cancels any live timer; the failure, not the timeout,
    /// decides this subscription's fate.
    pub fn record_failure(&mut self, cause: FailureCause) -> DeliveryOutcome {
        self.cancel_timer();
        self.error_occurred = true;
        let outcome = DeliveryOutcome::Failed { cause };
        self.last_outcome = Some(outcome.clone());
        outcome
    }

    /// OR of all eviction conditions against current state. Recomputed on
    /// every access; the registry consults this after each delivery
    /// outcome.
    pub fn is_evicted(&self) -> bool {
        let ctx = EvictionContext {
            accepted_count: self.accepted_count,
            error_occurred: self.error_occurred,
        };
        self.eviction.iter().any(|c| c.is_satisfied(&ctx))
    }

    /// Arm the timeout timer if the policy allows it.
    ///
    /// No-op without a timeout policy, while a timer is already armed, or
    /// while the policy's start predicate is false; calling this again
    /// with no state change in between starts at most one timer.
    pub fn start_timeout_if_needed(
        &mut self,
        status: AuthorizationStatus,
        timer_tx: &Sender<TimerEvent>,
    ) {
        let Some(policy) = self.timeout else {
            return;
        };
        if self.timer.is_some() || !policy.may_start_now(status) {
            return;
        }

        self.timer_generation += 1;
        let generation = self.timer_generation;
        let duration = policy.duration();
        let (cancel_tx, cancel_rx) = bounded::<()>(1);
        let events = timer_tx.clone();
        let id = self.id;

        thread::spawn(move || {
            // A cancel message or a dropped sender both end the wait early.
            if let Err(RecvTimeoutError::Timeout) = cancel_rx.recv_timeout(duration) {
                let _ = events.send(TimerEvent {
                    subscription: id,
                    generation,
                });
            }
        });

        self.timer = Some(TimerHandle {
            generation,
            cancel: cancel_tx,
        });
        debug!(
            subscription = %self.id,
            ?duration,
            generation,
            "timeout timer armed"
        );
    }

    /// Apply a fired timer event.
    ///
    /// Returns `None` when the event is stale: the generation does not
    /// match the live timer, or no timer is armed (cancelled, or already
    /// decided by a racing reading). Otherwise invalidates the timer and
    /// produces the synthetic `Failed(Timeout)` outcome, which participates
    /// in `OnError` eviction identically to a real acquisition failure.
    pub fn handle_timer_fired(&mut self, generation: u64) -> Option<DeliveryOutcome> {
        match &self.timer {
            Some(timer) if timer.generation == generation => {}
            _ => return None,
        }
        self.timer = None;
        debug!(subscription = %self.id, generation, "timeout elapsed");
        Some(self.record_failure(FailureCause::Timeout))
    }

    /// Manual stop: invalidate any live timer before the registry drops
    /// this subscription, so a late firing cannot act on it.
    pub fn stop(&mut self) {
        self.cancel_timer();
        trace!(subscription = %self.id, "subscription stopped");
    }

    fn cancel_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            let _ = timer.cancel.try_send(());
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel_timer();
    }
}
