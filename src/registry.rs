//! Registry holding the active subscription set.
//!
//! The registry is the single owner of every subscription: reading
//! delivery, timer events, and authorization changes all funnel through its
//! write lock, which provides the serialization the subscription state
//! machine assumes. Listeners observe outcomes over a bounded channel.

use crate::error::{RelayError, Result};
use crate::snapshot::SubscriptionSnapshot;
use crate::subscription::{Subscription, SubscriptionConfig, TimerEvent};
use crate::types::{AuthorizationStatus, DeliveryOutcome, FailureCause, Reading, SubscriptionId};
use crossbeam_channel::{bounded, unbounded, Receiver, Sender};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, warn};

/// Why a subscription left the active set.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RemovalReason {
    /// An eviction condition was satisfied.
    Evicted,
    /// Explicit manual stop.
    Stopped,
}

/// Events delivered to a subscription's listener.
#[derive(Clone, Debug, PartialEq)]
pub enum SubscriptionEvent {
    /// One validation/timeout/failure outcome.
    Outcome(DeliveryOutcome),
    /// The subscription was removed from the active set. Always the last
    /// event; listeners never need to poll for eviction.
    Removed { reason: RemovalReason },
}

/// Handle to observe a subscription.
pub struct SubscriptionHandle {
    pub id: SubscriptionId,
    /// Channel to receive outcome and lifecycle events.
    pub receiver: Receiver<SubscriptionEvent>,
}

impl SubscriptionHandle {
    /// Receive the next event (blocking).
    pub fn recv(&self) -> std::result::Result<SubscriptionEvent, crossbeam_channel::RecvError> {
        self.receiver.recv()
    }

    /// Try to receive an event (non-blocking).
    pub fn try_recv(
        &self,
    ) -> std::result::Result<SubscriptionEvent, crossbeam_channel::TryRecvError> {
        self.receiver.try_recv()
    }

    /// Receive with timeout.
    pub fn recv_timeout(
        &self,
        timeout: std::time::Duration,
    ) -> std::result::Result<SubscriptionEvent, crossbeam_channel::RecvTimeoutError> {
        self.receiver.recv_timeout(timeout)
    }
}

/// A subscription plus its listener channel.
struct RegisteredSubscription {
    subscription: Subscription,
    sender: Sender<SubscriptionEvent>,
}

impl RegisteredSubscription {
    /// Best-effort send. Overflowing a listener's buffer drops the event,
    /// never blocks delivery to other subscriptions.
    fn send(&self, event: SubscriptionEvent) {
        if self.sender.try_send(event).is_err() {
            warn!(
                subscription = %self.subscription.id(),
                "listener buffer full, dropping event"
            );
        }
    }
}

/// Holds the active subscriptions and routes readings, failures, timer
/// firings, and authorization changes to them.
pub struct SubscriptionRegistry {
    /// Active subscriptions by ID.
    subscriptions: RwLock<HashMap<SubscriptionId, RegisteredSubscription>>,
    /// Counter for generating subscription IDs.
    next_id: AtomicU64,
    /// Last authorization status reported by the external service.
    authorization: RwLock<AuthorizationStatus>,
    /// Fired timers post here; drained by `process_timer_events`.
    timer_tx: Sender<TimerEvent>,
    timer_rx: Receiver<TimerEvent>,
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        let (timer_tx, timer_rx) = unbounded();
        Self {
            subscriptions: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            authorization: RwLock::new(AuthorizationStatus::Unknown),
            timer_tx,
            timer_rx,
        }
    }

    /// Register a new subscription.
    ///
    /// Validates the configuration, derives the effective eviction set, and
    /// arms the timeout if its policy allows starting under the current
    /// authorization status (activation counts as the first
    /// `start_timeout_if_needed` opportunity).
    pub fn subscribe(&self, config: SubscriptionConfig) -> Result<SubscriptionHandle> {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::SeqCst));
        let (sender, receiver) = bounded(config.buffer_size);

        let subscription = Subscription::new(id, config)?;
        let status = *self.authorization.read();

        // Insert before arming: a timer that fires instantly must find its
        // subscription in the map when the event is drained.
        let mut subs = self.subscriptions.write();
        let entry = subs.entry(id).or_insert(RegisteredSubscription {
            subscription,
            sender,
        });
        entry
            .subscription
            .start_timeout_if_needed(status, &self.timer_tx);
        drop(subs);
        debug!(subscription = %id, "subscription registered");

        Ok(SubscriptionHandle { id, receiver })
    }

    /// Manually stop and remove a subscription. Invalidates any live timer
    /// before removal.
    pub fn stop(&self, id: SubscriptionId) -> Result<()> {
        let mut subs = self.subscriptions.write();
        let mut entry = subs
            .remove(&id)
            .ok_or(RelayError::SubscriptionNotFound(id))?;
        entry.subscription.stop();
        entry.send(SubscriptionEvent::Removed {
            reason: RemovalReason::Stopped,
        });
        Ok(())
    }

    /// Enable or disable a subscription in place.
    pub fn set_enabled(&self, id: SubscriptionId, enabled: bool) -> Result<()> {
        let mut subs = self.subscriptions.write();
        let entry = subs
            .get_mut(&id)
            .ok_or(RelayError::SubscriptionNotFound(id))?;
        entry.subscription.set_enabled(enabled);
        Ok(())
    }

    /// Number of active subscriptions.
    pub fn subscription_count(&self) -> usize {
        self.subscriptions.read().len()
    }

    /// Current authorization status as last reported.
    pub fn authorization(&self) -> AuthorizationStatus {
        *self.authorization.read()
    }

    /// Configuration snapshot of an active subscription.
    pub fn snapshot(&self, id: SubscriptionId) -> Option<SubscriptionSnapshot> {
        self.subscriptions
            .read()
            .get(&id)
            .map(|entry| SubscriptionSnapshot::capture(&entry.subscription))
    }

    /// Fan a raw reading out to every active subscription.
    ///
    /// Each subscription's outcome is emitted to its listener; any
    /// subscription whose eviction set became satisfied is removed before
    /// this call returns.
    pub fn deliver(&self, reading: &Reading) {
        let mut subs = self.subscriptions.write();
        let mut evicted = Vec::new();

        for (id, entry) in subs.iter_mut() {
            let outcome = entry.subscription.validate(reading);
            entry.send(SubscriptionEvent::Outcome(outcome));
            if entry.subscription.is_evicted() {
                evicted.push(*id);
            }
        }

        Self::remove_evicted(&mut subs, evicted);
    }

    /// Surface an upstream acquisition failure to one subscription.
    pub fn fail(&self, id: SubscriptionId, cause: FailureCause) -> Result<()> {
        let mut subs = self.subscriptions.write();
        let entry = subs
            .get_mut(&id)
            .ok_or(RelayError::SubscriptionNotFound(id))?;

        let outcome = entry.subscription.record_failure(cause);
        entry.send(SubscriptionEvent::Outcome(outcome));
        if entry.subscription.is_evicted() {
            Self::remove_evicted(&mut subs, vec![id]);
        }
        Ok(())
    }

    /// Record a new authorization status and give every subscription a
    /// fresh chance to arm its timeout (the grant-notification path for
    /// `Delayed` policies).
    pub fn set_authorization(&self, status: AuthorizationStatus) {
        *self.authorization.write() = status;
        debug!(?status, "authorization status changed");

        let mut subs = self.subscriptions.write();
        for entry in subs.values_mut() {
            entry
                .subscription
                .start_timeout_if_needed(status, &self.timer_tx);
        }
    }

    /// Drain fired timers and apply them.
    ///
    /// Stale events (generation mismatch, or the subscription already
    /// removed) are discarded; a timeout that lost its race leaves no
    /// trace.
    pub fn process_timer_events(&self) {
        let events: Vec<TimerEvent> = self.timer_rx.try_iter().collect();
        if events.is_empty() {
            return;
        }

        let mut subs = self.subscriptions.write();
        for event in events {
            let Some(entry) = subs.get_mut(&event.subscription) else {
                continue;
            };
            let Some(outcome) = entry.subscription.handle_timer_fired(event.generation) else {
                continue;
            };
            entry.send(SubscriptionEvent::Outcome(outcome));
            if entry.subscription.is_evicted() {
                Self::remove_evicted(&mut subs, vec![event.subscription]);
            }
        }
    }

    fn remove_evicted(
        subs: &mut HashMap<SubscriptionId, RegisteredSubscription>,
        ids: Vec<SubscriptionId>,
    ) {
        for id in ids {
            if let Some(mut entry) = subs.remove(&id) {
                entry.subscription.stop();
                entry.send(SubscriptionEvent::Removed {
                    reason: RemovalReason::Evicted,
                });
                debug!(subscription = %id, "subscription evicted");
            }
        }
    }
}

impl Default for SubscriptionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::{EvictionCondition, FilterConfig, TimeoutPolicy};
    use crate::types::{DiscardReason, Position, SubscriptionMode};
    use std::time::Duration;

    fn reading(x: f64, y: f64, accuracy: f64) -> Reading {
        Reading::new(Position::new(x, y), accuracy)
    }

    #[test]
    fn test_subscribe_and_stop() {
        let registry = SubscriptionRegistry::new();

        let handle = registry.subscribe(SubscriptionConfig::default()).unwrap();
        assert_eq!(registry.subscription_count(), 1);

        registry.stop(handle.id).unwrap();
        assert_eq!(registry.subscription_count(), 0);
        assert_eq!(
            handle.recv_timeout(Duration::from_millis(100)).unwrap(),
            SubscriptionEvent::Removed {
                reason: RemovalReason::Stopped
            }
        );
    }

    #[test]
    fn test_stop_unknown_subscription() {
        let registry = SubscriptionRegistry::new();
        assert!(matches!(
            registry.stop(SubscriptionId(42)),
            Err(RelayError::SubscriptionNotFound(_))
        ));
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let registry = SubscriptionRegistry::new();
        let config = SubscriptionConfig {
            filter: FilterConfig {
                min_distance_delta: -1.0,
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(registry.subscribe(config).is_err());
        assert_eq!(registry.subscription_count(), 0);
    }

    #[test]
    fn test_deliver_broadcasts_outcomes() {
        let registry = SubscriptionRegistry::new();
        let strict = registry
            .subscribe(SubscriptionConfig {
                filter: FilterConfig {
                    min_accuracy: Some(10.0),
                    ..Default::default()
                },
                ..Default::default()
            })
            .unwrap();
        let lax = registry.subscribe(SubscriptionConfig::default()).unwrap();

        registry.deliver(&reading(0.0, 0.0, 25.0));

        assert_eq!(
            strict.recv_timeout(Duration::from_millis(100)).unwrap(),
            SubscriptionEvent::Outcome(DeliveryOutcome::Discarded {
                reason: DiscardReason::NotMinAccuracy
            })
        );
        match lax.recv_timeout(Duration::from_millis(100)).unwrap() {
            SubscriptionEvent::Outcome(outcome) => assert!(outcome.is_accepted()),
            other => panic!("expected outcome, got {other:?}"),
        }
    }

    #[test]
    fn test_single_mode_removed_after_first_accept() {
        let registry = SubscriptionRegistry::new();
        let handle = registry
            .subscribe(SubscriptionConfig {
                mode: SubscriptionMode::Single,
                ..Default::default()
            })
            .unwrap();

        registry.deliver(&reading(0.0, 0.0, 5.0));
        assert_eq!(registry.subscription_count(), 0);

        match handle.recv_timeout(Duration::from_millis(100)).unwrap() {
            SubscriptionEvent::Outcome(outcome) => assert!(outcome.is_accepted()),
            other => panic!("expected outcome, got {other:?}"),
        }
        assert_eq!(
            handle.recv_timeout(Duration::from_millis(100)).unwrap(),
            SubscriptionEvent::Removed {
                reason: RemovalReason::Evicted
            }
        );

        // Later readings are not observed by the removed subscription.
        registry.deliver(&reading(1.0, 1.0, 5.0));
        assert!(handle.recv_timeout(Duration::from_millis(50)).is_err());
    }

    #[test]
    fn test_upstream_failure_evicts_on_error() {
        let registry = SubscriptionRegistry::new();
        let handle = registry
            .subscribe(SubscriptionConfig {
                eviction: vec![EvictionCondition::OnError],
                ..Default::default()
            })
            .unwrap();

        registry
            .fail(handle.id, FailureCause::Acquisition("sensor offline".into()))
            .unwrap();

        assert_eq!(
            handle.recv_timeout(Duration::from_millis(100)).unwrap(),
            SubscriptionEvent::Outcome(DeliveryOutcome::Failed {
                cause: FailureCause::Acquisition("sensor offline".into())
            })
        );
        assert_eq!(
            handle.recv_timeout(Duration::from_millis(100)).unwrap(),
            SubscriptionEvent::Removed {
                reason: RemovalReason::Evicted
            }
        );
        assert_eq!(registry.subscription_count(), 0);
    }

    #[test]
    fn test_failure_without_on_error_keeps_subscription() {
        let registry = SubscriptionRegistry::new();
        let handle = registry.subscribe(SubscriptionConfig::default()).unwrap();

        registry
            .fail(handle.id, FailureCause::PermissionDenied)
            .unwrap();

        assert!(matches!(
            handle.recv_timeout(Duration::from_millis(100)).unwrap(),
            SubscriptionEvent::Outcome(DeliveryOutcome::Failed { .. })
        ));
        assert_eq!(registry.subscription_count(), 1);
    }

    #[test]
    fn test_set_enabled_gates_delivery() {
        let registry = SubscriptionRegistry::new();
        let handle = registry.subscribe(SubscriptionConfig::default()).unwrap();

        registry.set_enabled(handle.id, false).unwrap();
        registry.deliver(&reading(0.0, 0.0, 5.0));
        assert_eq!(
            handle.recv_timeout(Duration::from_millis(100)).unwrap(),
            SubscriptionEvent::Outcome(DeliveryOutcome::Discarded {
                reason: DiscardReason::RequestNotEnabled
            })
        );

        registry.set_enabled(handle.id, true).unwrap();
        registry.deliver(&reading(0.0, 0.0, 5.0));
        match handle.recv_timeout(Duration::from_millis(100)).unwrap() {
            SubscriptionEvent::Outcome(outcome) => assert!(outcome.is_accepted()),
            other => panic!("expected outcome, got {other:?}"),
        }
    }

    #[test]
    fn test_timeout_fires_through_registry() {
        let registry = SubscriptionRegistry::new();
        let handle = registry
            .subscribe(SubscriptionConfig {
                timeout: Some(TimeoutPolicy::Immediate(Duration::from_millis(30))),
                eviction: vec![EvictionCondition::OnError],
                ..Default::default()
            })
            .unwrap();

        std::thread::sleep(Duration::from_millis(100));
        registry.process_timer_events();

        assert_eq!(
            handle.recv_timeout(Duration::from_millis(100)).unwrap(),
            SubscriptionEvent::Outcome(DeliveryOutcome::Failed {
                cause: FailureCause::Timeout
            })
        );
        assert_eq!(
            handle.recv_timeout(Duration::from_millis(100)).unwrap(),
            SubscriptionEvent::Removed {
                reason: RemovalReason::Evicted
            }
        );
        assert_eq!(registry.subscription_count(), 0);
    }

    #[test]
    fn test_timer_event_survives_concurrent_draining() {
        let registry = SubscriptionRegistry::new();
        let done = std::sync::atomic::AtomicBool::new(false);

        std::thread::scope(|s| {
            // Drain continuously so an instantly firing timer is processed
            // in the registration window.
            s.spawn(|| {
                while !done.load(Ordering::Relaxed) {
                    registry.process_timer_events();
                    std::thread::yield_now();
                }
            });

            let handle = registry
                .subscribe(SubscriptionConfig {
                    timeout: Some(TimeoutPolicy::Immediate(Duration::from_micros(100))),
                    eviction: vec![EvictionCondition::OnError],
                    ..Default::default()
                })
                .unwrap();

            assert_eq!(
                handle.recv_timeout(Duration::from_millis(500)).unwrap(),
                SubscriptionEvent::Outcome(DeliveryOutcome::Failed {
                    cause: FailureCause::Timeout
                })
            );
            done.store(true, Ordering::Relaxed);
        });
        assert_eq!(registry.subscription_count(), 0);
    }

    #[test]
    fn test_accepted_reading_wins_race_against_timeout() {
        let registry = SubscriptionRegistry::new();
        let handle = registry
            .subscribe(SubscriptionConfig {
                mode: SubscriptionMode::Single,
                timeout: Some(TimeoutPolicy::Immediate(Duration::from_millis(30))),
                ..Default::default()
            })
            .unwrap();

        // Reading arrives first; the subscription is evicted and its timer
        // cancelled.
        registry.deliver(&reading(0.0, 0.0, 5.0));
        assert_eq!(registry.subscription_count(), 0);

        // A late firing, if any, is ignored against the removed
        // subscription.
        std::thread::sleep(Duration::from_millis(100));
        registry.process_timer_events();

        match handle.recv_timeout(Duration::from_millis(100)).unwrap() {
            SubscriptionEvent::Outcome(outcome) => assert!(outcome.is_accepted()),
            other => panic!("expected outcome, got {other:?}"),
        }
        assert_eq!(
            handle.recv_timeout(Duration::from_millis(100)).unwrap(),
            SubscriptionEvent::Removed {
                reason: RemovalReason::Evicted
            }
        );
        assert!(handle.try_recv().is_err());
    }

    #[test]
    fn test_delayed_timer_arms_on_grant() {
        let registry = SubscriptionRegistry::new();
        registry.set_authorization(AuthorizationStatus::Denied);

        let handle = registry
            .subscribe(SubscriptionConfig {
                timeout: Some(TimeoutPolicy::Delayed(Duration::from_millis(30))),
                eviction: vec![EvictionCondition::OnError],
                ..Default::default()
            })
            .unwrap();

        // Denied: nothing fires.
        std::thread::sleep(Duration::from_millis(80));
        registry.process_timer_events();
        assert!(handle.try_recv().is_err());

        // Grant: the countdown starts and runs out.
        registry.set_authorization(AuthorizationStatus::Authorized);
        std::thread::sleep(Duration::from_millis(100));
        registry.process_timer_events();

        assert_eq!(
            handle.recv_timeout(Duration::from_millis(100)).unwrap(),
            SubscriptionEvent::Outcome(DeliveryOutcome::Failed {
                cause: FailureCause::Timeout
            })
        );
        assert_eq!(registry.subscription_count(), 0);
    }

    #[test]
    fn test_snapshot_of_active_subscription() {
        let registry = SubscriptionRegistry::new();
        let handle = registry
            .subscribe(SubscriptionConfig {
                name: Some("walker".to_string()),
                mode: SubscriptionMode::Single,
                ..Default::default()
            })
            .unwrap();

        let snapshot = registry.snapshot(handle.id).unwrap();
        assert_eq!(snapshot.name.as_deref(), Some("walker"));
        assert_eq!(snapshot.mode, "single");

        assert!(registry.snapshot(SubscriptionId(999)).is_none());
    }
}
