//! Filter, timeout, and eviction policies for a single subscription.

use crate::error::{RelayError, Result};
use crate::types::{AuthorizationStatus, ReferenceOrientation, SubscriptionMode};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Immutable filter thresholds applied to every incoming reading.
#[derive(Clone, Debug, PartialEq)]
pub struct FilterConfig {
    /// Worst acceptable horizontal accuracy. `None` disables the check.
    pub min_accuracy: Option<f64>,

    /// Minimum geometric distance from the last accepted reading.
    /// `0.0` disables the check.
    pub min_distance_delta: f64,

    /// Minimum wall-clock time since the last accepted reading's own
    /// timestamp. `None` disables the check.
    pub min_time_interval: Option<Duration>,

    /// Orientation tag passed through to the acquisition collaborator.
    pub reference_orientation: ReferenceOrientation,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            min_accuracy: None,
            min_distance_delta: 0.0,
            min_time_interval: None,
            reference_orientation: ReferenceOrientation::Unknown,
        }
    }
}

impl FilterConfig {
    /// Check construction-time invariants: all thresholds non-negative.
    pub fn validate(&self) -> Result<()> {
        if let Some(accuracy) = self.min_accuracy {
            if accuracy.is_nan() || accuracy < 0.0 {
                return Err(RelayError::InvalidConfig(format!(
                    "min_accuracy must be non-negative, got {accuracy}"
                )));
            }
        }
        if self.min_distance_delta.is_nan() || self.min_distance_delta < 0.0 {
            return Err(RelayError::InvalidConfig(format!(
                "min_distance_delta must be non-negative, got {}",
                self.min_distance_delta
            )));
        }
        Ok(())
    }

    /// Whether the distance filter is active (zero means disabled).
    pub fn distance_filter_enabled(&self) -> bool {
        self.min_distance_delta > 0.0
    }
}

/// When a subscription's timeout countdown may begin.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TimeoutPolicy {
    /// Countdown eligible as soon as the subscription is activated,
    /// independent of authorization state.
    Immediate(Duration),
    /// Countdown eligible only once the authorization status reports
    /// `Authorized`.
    Delayed(Duration),
}

impl TimeoutPolicy {
    pub fn duration(&self) -> Duration {
        match self {
            TimeoutPolicy::Immediate(d) | TimeoutPolicy::Delayed(d) => *d,
        }
    }

    pub fn as_tag(&self) -> &'static str {
        match self {
            TimeoutPolicy::Immediate(_) => "immediate",
            TimeoutPolicy::Delayed(_) => "delayed",
        }
    }

    /// Whether the countdown may start under the given authorization status.
    ///
    /// Re-evaluated on every `start_timeout_if_needed` call, so a `Delayed`
    /// subscription's timer starts on the first opportunity after a grant
    /// and never before.
    pub fn may_start_now(&self, status: AuthorizationStatus) -> bool {
        match self {
            TimeoutPolicy::Immediate(_) => true,
            TimeoutPolicy::Delayed(_) => status == AuthorizationStatus::Authorized,
        }
    }

    /// Check construction-time invariants: the duration must be positive.
    pub fn validate(&self) -> Result<()> {
        if self.duration().is_zero() {
            return Err(RelayError::InvalidConfig(
                "timeout duration must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// State visible to eviction conditions.
#[derive(Clone, Copy, Debug)]
pub struct EvictionContext {
    /// Number of readings accepted so far.
    pub accepted_count: u64,
    /// Whether any failed delivery outcome has occurred.
    pub error_occurred: bool,
}

/// Opaque custom eviction predicate.
pub type EvictionPredicate = Arc<dyn Fn(&EvictionContext) -> bool + Send + Sync>;

/// One independently testable removal condition. Conditions in a
/// subscription's eviction set are OR-combined.
#[derive(Clone)]
pub enum EvictionCondition {
    /// Evict after any failed delivery outcome. Filter discards are
    /// transient and do not count.
    OnError,
    /// Evict once the subscription has accepted at least `count` readings.
    OnReceiveData { count: u64 },
    /// Opaque predicate evaluated against the same context. Labeled for
    /// diagnostics; predicates are code, not data, and are excluded from
    /// serialized snapshots.
    Custom {
        label: String,
        predicate: EvictionPredicate,
    },
}

impl EvictionCondition {
    /// Evaluate this condition against current subscription state.
    pub fn is_satisfied(&self, ctx: &EvictionContext) -> bool {
        match self {
            EvictionCondition::OnError => ctx.error_occurred,
            EvictionCondition::OnReceiveData { count } => ctx.accepted_count >= *count,
            EvictionCondition::Custom { predicate, .. } => predicate(ctx),
        }
    }

    /// Check construction-time invariants: a data-count threshold of zero
    /// would evict before the first delivery.
    pub fn validate(&self) -> Result<()> {
        if let EvictionCondition::OnReceiveData { count: 0 } = self {
            return Err(RelayError::InvalidConfig(
                "on_receive_data count must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

impl fmt::Debug for EvictionCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EvictionCondition::OnError => write!(f, "OnError"),
            EvictionCondition::OnReceiveData { count } => {
                write!(f, "OnReceiveData({count})")
            }
            EvictionCondition::Custom { label, .. } => write!(f, "Custom({label})"),
        }
    }
}

impl PartialEq for EvictionCondition {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (EvictionCondition::OnError, EvictionCondition::OnError) => true,
            (
                EvictionCondition::OnReceiveData { count: a },
                EvictionCondition::OnReceiveData { count: b },
            ) => a == b,
            (
                EvictionCondition::Custom { label: a, .. },
                EvictionCondition::Custom { label: b, .. },
            ) => a == b,
            _ => false,
        }
    }
}

/// Derive the effective eviction set for a subscription.
///
/// `Single` mode forces the set regardless of what the caller configured:
/// every `OnReceiveData` is stripped and replaced with exactly
/// `OnReceiveData { count: 1 }`, and `OnError` is inserted if missing: a
/// single subscription's contract is "resolve once, then disappear", on its
/// first error exactly as on its first success. `Continuous` mode uses the
/// caller's set verbatim; an empty set means "never auto-evict".
pub fn effective_eviction_set(
    mode: SubscriptionMode,
    configured: Vec<EvictionCondition>,
) -> Vec<EvictionCondition> {
    match mode {
        SubscriptionMode::Continuous => configured,
        SubscriptionMode::Single => {
            let mut derived: Vec<EvictionCondition> = configured
                .into_iter()
                .filter(|c| !matches!(c, EvictionCondition::OnReceiveData { .. }))
                .collect();
            if !derived.contains(&EvictionCondition::OnError) {
                derived.push(EvictionCondition::OnError);
            }
            derived.push(EvictionCondition::OnReceiveData { count: 1 });
            derived
        }
    }
}
