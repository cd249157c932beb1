//! Core types for the subscription engine.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Unique identifier for a subscription.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubscriptionId(pub u64);

impl fmt::Debug for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SubscriptionId({})", self.0)
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Microseconds since Unix epoch.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Timestamp(pub i64);

impl Timestamp {
    /// Current time.
    pub fn now() -> Self {
        let duration = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("Time went backwards");
        Timestamp(duration.as_micros() as i64)
    }

    /// Wall-clock time elapsed since this timestamp. Saturates at zero
    /// for timestamps in the future.
    pub fn elapsed(&self) -> Duration {
        let now = Timestamp::now();
        Duration::from_micros(now.0.saturating_sub(self.0).max(0) as u64)
    }
}

impl fmt::Debug for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Timestamp({})", self.0)
    }
}

/// A point in the reading's coordinate plane.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
}

impl Position {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    /// Euclidean distance to another position.
    pub fn distance_to(&self, other: &Position) -> f64 {
        let dx = self.x - other.x;
        let dy = self.y - other.y;
        (dx * dx + dy * dy).sqrt()
    }
}

/// A timestamped sensor measurement.
///
/// `accuracy` is a horizontal error radius: numerically larger means worse.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    /// When the measurement was taken.
    pub timestamp: Timestamp,
    /// Measured position, used for distance filtering.
    pub position: Position,
    /// Horizontal accuracy of the measurement.
    pub accuracy: f64,
}

impl Reading {
    /// Create a reading stamped with the current time.
    pub fn new(position: Position, accuracy: f64) -> Self {
        Self {
            timestamp: Timestamp::now(),
            position,
            accuracy,
        }
    }
}

/// Current status of the external authorization subsystem.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthorizationStatus {
    Unknown,
    Authorized,
    Denied,
    Restricted,
}

/// Device orientation tag passed through to the acquisition collaborator.
///
/// Not interpreted by this crate beyond being a recognized value; unknown
/// encodings decode to [`ReferenceOrientation::Unknown`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum ReferenceOrientation {
    #[default]
    Unknown,
    Portrait,
    PortraitUpsideDown,
    LandscapeLeft,
    LandscapeRight,
    FaceUp,
    FaceDown,
}

impl ReferenceOrientation {
    /// Stable string discriminant for serialized forms.
    pub fn as_tag(&self) -> &'static str {
        match self {
            ReferenceOrientation::Unknown => "unknown",
            ReferenceOrientation::Portrait => "portrait",
            ReferenceOrientation::PortraitUpsideDown => "portrait_upside_down",
            ReferenceOrientation::LandscapeLeft => "landscape_left",
            ReferenceOrientation::LandscapeRight => "landscape_right",
            ReferenceOrientation::FaceUp => "face_up",
            ReferenceOrientation::FaceDown => "face_down",
        }
    }

    /// Decode a string discriminant. Unrecognized or legacy tags map to
    /// `Unknown` rather than failing the whole decode.
    pub fn from_tag(tag: &str) -> Self {
        match tag {
            "portrait" => ReferenceOrientation::Portrait,
            "portrait_upside_down" => ReferenceOrientation::PortraitUpsideDown,
            "landscape_left" => ReferenceOrientation::LandscapeLeft,
            "landscape_right" => ReferenceOrientation::LandscapeRight,
            "face_up" => ReferenceOrientation::FaceUp,
            "face_down" => ReferenceOrientation::FaceDown,
            _ => ReferenceOrientation::Unknown,
        }
    }
}

/// Whether a subscription resolves once or streams until stopped.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum SubscriptionMode {
    /// Deliver at most one accepted reading, then self-evict.
    Single,
    /// Deliver indefinitely until explicitly stopped or evicted by policy.
    #[default]
    Continuous,
}

impl SubscriptionMode {
    pub fn as_tag(&self) -> &'static str {
        match self {
            SubscriptionMode::Single => "single",
            SubscriptionMode::Continuous => "continuous",
        }
    }
}

/// Why a reading was discarded without being delivered.
///
/// A discard is not an error: it is expected, recoverable, and never by
/// itself terminates the subscription.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscardReason {
    /// The subscription is disabled.
    RequestNotEnabled,
    /// Reading accuracy was worse than the configured minimum.
    NotMinAccuracy,
    /// Reading was closer to the last accepted reading than the minimum
    /// distance delta.
    NotMinDistance,
    /// Reading arrived within the minimum time interval of the last
    /// accepted reading.
    NotMinInterval,
}

/// Terminal failure signals. These participate in `OnError` eviction.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureCause {
    /// The timeout countdown elapsed with no accepted reading.
    Timeout,
    /// The authorization subsystem denied access.
    PermissionDenied,
    /// An upstream acquisition error, with its description.
    Acquisition(String),
}

/// Result of presenting one raw reading to a subscription, or of a
/// synthetic event (timeout, upstream failure).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DeliveryOutcome {
    /// The reading passed every filter and was delivered.
    Accepted { reading: Reading },
    /// The reading failed a filter check.
    Discarded { reason: DiscardReason },
    /// A terminal failure occurred.
    Failed { cause: FailureCause },
}

impl DeliveryOutcome {
    /// True for `Failed` outcomes only; discards are not errors.
    pub fn is_failure(&self) -> bool {
        matches!(self, DeliveryOutcome::Failed { .. })
    }

    pub fn is_accepted(&self) -> bool {
        matches!(self, DeliveryOutcome::Accepted { .. })
    }
}
