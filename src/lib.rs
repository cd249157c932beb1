//! # Sensor Relay
//!
//! A subscription-lifecycle engine for delivering filtered, rate-limited
//! sensor readings to interested listeners, with automatic self-termination
//! ("eviction") and timeout handling.
//!
//! ## Core Concepts
//!
//! - **Readings**: Timestamped measurements with an accuracy figure and a
//!   position used for distance comparison
//! - **Subscriptions**: Live configuration + state tracking one listener's
//!   interest in a stream of readings
//! - **Eviction**: Automatic removal from the active set once a policy
//!   condition (error, accepted-reading count, custom predicate) is met
//! - **Timeouts**: Single-shot countdowns, optionally gated on an external
//!   authorization grant, that fail a subscription that never receives data
//!
//! ## Example
//!
//! ```
//! use sensor_relay::{
//!     FilterConfig, Position, Reading, SubscriptionConfig, SubscriptionMode,
//!     SubscriptionRegistry,
//! };
//!
//! let registry = SubscriptionRegistry::new();
//!
//! // One accurate fix, then the subscription removes itself.
//! let handle = registry
//!     .subscribe(SubscriptionConfig {
//!         mode: SubscriptionMode::Single,
//!         filter: FilterConfig {
//!             min_accuracy: Some(50.0),
//!             ..Default::default()
//!         },
//!         ..Default::default()
//!     })
//!     .unwrap();
//!
//! registry.deliver(&Reading::new(Position::new(2.0, 3.0), 8.0));
//! assert_eq!(registry.subscription_count(), 0);
//! # drop(handle);
//! ```

pub mod error;
pub mod policy;
pub mod registry;
pub mod snapshot;
pub mod subscription;
pub mod types;

// Re-exports
pub use error::{RelayError, Result};
pub use policy::{
    effective_eviction_set, EvictionCondition, EvictionContext, EvictionPredicate, FilterConfig,
    TimeoutPolicy,
};
pub use registry::{
    RemovalReason, SubscriptionEvent, SubscriptionHandle, SubscriptionRegistry,
};
pub use snapshot::{
    EvictionSnapshot, FilterSnapshot, SubscriptionSnapshot, TimeoutSnapshot,
};
pub use subscription::{Subscription, SubscriptionConfig, TimerEvent};
pub use types::*;
