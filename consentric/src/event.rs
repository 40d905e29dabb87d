//! Module `event` contains types and abstractions helpful for working
//! with Domain Events.

use std::fmt::Debug;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::Version;

/// Correlation metadata carried by every recorded event.
///
/// `correlation_id` links all events produced by one business transaction;
/// `causation_id` points at the command or event that directly caused this
/// one.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Serialize, Deserialize)]
pub struct EventMetadata {
    pub correlation_id: Uuid,
    pub causation_id: Uuid,
}

impl EventMetadata {
    /// Metadata for the first event of a transaction: it is its own cause.
    #[must_use]
    pub fn root(correlation_id: Uuid) -> Self {
        Self {
            correlation_id,
            causation_id: correlation_id,
        }
    }

    /// Metadata for an event caused by an earlier event in the same
    /// transaction.
    #[must_use]
    pub fn caused_by(&self, causation_id: Uuid) -> Self {
        Self {
            correlation_id: self.correlation_id,
            causation_id,
        }
    }
}

/// A domain event.
///
/// Event kinds form a closed set: every variant carries a stable type name
/// that is persisted next to the payload, and decoding an unknown name is a
/// typed error rather than a runtime lookup.
pub trait DomainEvent: Send + Sync + Clone + Debug + Eq + PartialEq {
    /// Unique id of this event, used for causation tracking and audit.
    fn event_id(&self) -> Uuid;

    /// Stable type name persisted next to the payload.
    fn event_type(&self) -> &'static str;

    /// Whether the payload must be encrypted before it reaches storage.
    fn is_sensitive(&self) -> bool {
        false
    }
}

/// An [`DomainEvent`] that will be / has been persisted to the Event Store,
/// together with its position in the aggregate's stream.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct RecordedEvent<Evt> {
    /// Position in the aggregate's stream; sequences start at 1 and are
    /// gapless.
    pub sequence: Version,

    /// When the event was recorded.
    pub occurred_at: DateTime<Utc>,

    /// Correlation metadata.
    pub metadata: EventMetadata,

    /// The actual Domain Event.
    pub event: Evt,
}
