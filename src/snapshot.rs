//! Serializable snapshots of subscription configuration.
//!
//! The byte format is JSON with explicit string discriminants for every
//! tagged value, so an external store can persist and restore a
//! subscription's configuration losslessly. Decoding is forgiving where it
//! is safe (unknown orientation tags become `Unknown`, unknown timeout
//! kinds fall back to `Delayed`, which never starts a countdown before
//! authorization) and fails with a typed error where a default would change
//! semantics (unknown mode or eviction discriminants, negative thresholds,
//! zero durations).

use crate::error::{RelayError, Result};
use crate::policy::{EvictionCondition, FilterConfig, TimeoutPolicy};
use crate::subscription::{Subscription, SubscriptionConfig};
use crate::types::{ReferenceOrientation, SubscriptionMode};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Persistent form of a subscription's configuration.
///
/// Captures the *effective* eviction set (post mode derivation), so a
/// restored single-mode subscription carries the same forced set it ran
/// with. Custom eviction predicates are code, not data, and are not
/// captured.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionSnapshot {
    pub name: Option<String>,
    pub enabled: bool,
    pub mode: String,
    pub filter: FilterSnapshot,
    pub timeout: Option<TimeoutSnapshot>,
    pub eviction: Vec<EvictionSnapshot>,
}

/// Wire form of [`FilterConfig`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FilterSnapshot {
    pub min_accuracy: Option<f64>,
    pub min_distance_delta: f64,
    /// Microseconds, the crate's native time resolution.
    pub min_time_interval_us: Option<u64>,
    pub reference_orientation: String,
}

/// Wire form of [`TimeoutPolicy`], with an explicit kind discriminant.
/// Durations are microseconds so that any valid policy survives a
/// round-trip unchanged.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TimeoutSnapshot {
    pub kind: String,
    pub duration_us: u64,
}

/// Wire form of an [`EvictionCondition`]. An unrecognized `kind` fails the
/// decode; silently dropping a removal condition would change lifecycle
/// semantics.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EvictionSnapshot {
    OnError,
    OnReceiveData { count: u64 },
}

impl SubscriptionSnapshot {
    /// Capture the configuration of a live subscription.
    pub fn capture(subscription: &Subscription) -> Self {
        let filter = subscription.filter();
        Self {
            name: subscription.name().map(str::to_string),
            enabled: subscription.enabled(),
            mode: subscription.mode().as_tag().to_string(),
            filter: FilterSnapshot {
                min_accuracy: filter.min_accuracy,
                min_distance_delta: filter.min_distance_delta,
                min_time_interval_us: filter
                    .min_time_interval
                    .map(|d| d.as_micros() as u64),
                reference_orientation: filter.reference_orientation.as_tag().to_string(),
            },
            timeout: subscription.timeout().map(|t| TimeoutSnapshot {
                kind: t.as_tag().to_string(),
                duration_us: t.duration().as_micros() as u64,
            }),
            eviction: subscription
                .eviction_set()
                .iter()
                .filter_map(|c| match c {
                    EvictionCondition::OnError => Some(EvictionSnapshot::OnError),
                    EvictionCondition::OnReceiveData { count } => {
                        Some(EvictionSnapshot::OnReceiveData { count: *count })
                    }
                    EvictionCondition::Custom { .. } => None,
                })
                .collect(),
        }
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Rebuild a [`SubscriptionConfig`] from this snapshot.
    ///
    /// Validates every decoded invariant here rather than deferring to
    /// construction, so a malformed snapshot is rejected at the decode
    /// boundary.
    pub fn into_config(self) -> Result<SubscriptionConfig> {
        let mode = match self.mode.as_str() {
            "single" => SubscriptionMode::Single,
            "continuous" => SubscriptionMode::Continuous,
            other => {
                return Err(RelayError::Decode(format!(
                    "unrecognized subscription mode: {other}"
                )))
            }
        };

        let filter = FilterConfig {
            min_accuracy: self.filter.min_accuracy,
            min_distance_delta: self.filter.min_distance_delta,
            min_time_interval: self.filter.min_time_interval_us.map(Duration::from_micros),
            reference_orientation: ReferenceOrientation::from_tag(
                &self.filter.reference_orientation,
            ),
        };
        filter.validate()?;

        let timeout = match self.timeout {
            None => None,
            Some(snapshot) => {
                let duration = Duration::from_micros(snapshot.duration_us);
                let policy = match snapshot.kind.as_str() {
                    "immediate" => TimeoutPolicy::Immediate(duration),
                    // Legacy or unknown kinds fall back to the conservative
                    // variant that never starts before authorization.
                    _ => TimeoutPolicy::Delayed(duration),
                };
                policy.validate()?;
                Some(policy)
            }
        };

        let eviction = self
            .eviction
            .into_iter()
            .map(|c| match c {
                EvictionSnapshot::OnError => Ok(EvictionCondition::OnError),
                EvictionSnapshot::OnReceiveData { count } => {
                    let condition = EvictionCondition::OnReceiveData { count };
                    condition.validate()?;
                    Ok(condition)
                }
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(SubscriptionConfig {
            name: self.name,
            enabled: self.enabled,
            mode,
            filter,
            timeout,
            eviction,
            ..Default::default()
        })
    }
}
