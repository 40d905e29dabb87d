//! At-least-once event publication.
//!
//! The bus decouples the command path from projection updates: events are
//! published after they are durable, and consumers may see them late, twice,
//! or out of order. Revocations travel on a dedicated high-priority lane so
//! they propagate ahead of ordinary traffic.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::consent::ConsentEvent;
use crate::event::{DomainEvent, EventMetadata, RecordedEvent};
use crate::participant::ParticipantEvent;
use crate::Version;

/// Delivery priority of a published event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Priority {
    Normal,
    High,
}

/// The closed registry of event kinds that can cross the bus.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "aggregate", content = "event")]
pub enum EventPayload {
    Consent(ConsentEvent),
    Participant(ParticipantEvent),
}

impl EventPayload {
    #[must_use]
    pub fn event_type(&self) -> &'static str {
        match self {
            EventPayload::Consent(event) => event.event_type(),
            EventPayload::Participant(event) => event.event_type(),
        }
    }

    #[must_use]
    pub fn event_id(&self) -> Uuid {
        match self {
            EventPayload::Consent(event) => event.event_id(),
            EventPayload::Participant(event) => event.event_id(),
        }
    }
}

impl From<ConsentEvent> for EventPayload {
    fn from(event: ConsentEvent) -> Self {
        EventPayload::Consent(event)
    }
}

impl From<ParticipantEvent> for EventPayload {
    fn from(event: ParticipantEvent) -> Self {
        EventPayload::Participant(event)
    }
}

/// Envelope for an event travelling from the command path to consumers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishedEvent {
    pub aggregate_id: Uuid,
    pub aggregate_type: String,
    pub sequence: Version,
    pub occurred_at: DateTime<Utc>,
    pub metadata: EventMetadata,
    pub payload: EventPayload,
}

impl PublishedEvent {
    /// Wraps a freshly recorded event for publication.
    pub fn from_recorded<E>(
        aggregate_type: &'static str,
        aggregate_id: Uuid,
        recorded: &RecordedEvent<E>,
    ) -> Self
    where
        E: DomainEvent + Into<EventPayload>,
    {
        Self {
            aggregate_id,
            aggregate_type: aggregate_type.to_owned(),
            sequence: recorded.sequence,
            occurred_at: recorded.occurred_at,
            metadata: recorded.metadata,
            payload: recorded.event.clone().into(),
        }
    }

    #[must_use]
    pub fn event_type(&self) -> &'static str {
        self.payload.event_type()
    }
}

/// List of possible errors that can be returned when publishing.
#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    #[error("event bus unavailable: {0}")]
    Unavailable(String),
}

/// At-least-once event publication port.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publishes one event. Delivery is at-least-once; consumers must
    /// tolerate redelivery.
    async fn publish(&self, event: PublishedEvent, priority: Priority)
        -> Result<(), PublishError>;
}

/// In-process [`EventPublisher`] built on broadcast channels, with a
/// dedicated lane for high-priority traffic.
///
/// Suitable for tests, demos and single-process deployments; a brokered bus
/// takes its place in production without touching the command path.
#[derive(Debug)]
pub struct InMemoryBus {
    high: broadcast::Sender<PublishedEvent>,
    normal: broadcast::Sender<PublishedEvent>,
    published: AtomicU64,
}

impl InMemoryBus {
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(1024)
    }

    /// `capacity` bounds each lane; the oldest messages are dropped past it.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        let (high, _) = broadcast::channel(capacity);
        let (normal, _) = broadcast::channel(capacity);
        Self {
            high,
            normal,
            published: AtomicU64::new(0),
        }
    }

    /// Opens a subscription over both lanes.
    #[must_use]
    pub fn subscribe(&self) -> BusSubscription {
        BusSubscription {
            high: self.high.subscribe(),
            normal: self.normal.subscribe(),
        }
    }

    /// Number of events published so far, for catch-up checks in tests and
    /// the consistency validator.
    #[must_use]
    pub fn published_count(&self) -> u64 {
        self.published.load(Ordering::SeqCst)
    }
}

impl Default for InMemoryBus {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EventPublisher for InMemoryBus {
    async fn publish(
        &self,
        event: PublishedEvent,
        priority: Priority,
    ) -> Result<(), PublishError> {
        let lane = match priority {
            Priority::High => &self.high,
            Priority::Normal => &self.normal,
        };

        // A send error only means no subscriber is currently attached;
        // the event is still counted as published.
        let _ = lane.send(event);
        self.published.fetch_add(1, Ordering::SeqCst);

        Ok(())
    }
}

/// Receiving half of an [`InMemoryBus`] subscription. The high-priority lane
/// is always drained before the normal lane.
pub struct BusSubscription {
    high: broadcast::Receiver<PublishedEvent>,
    normal: broadcast::Receiver<PublishedEvent>,
}

impl BusSubscription {
    /// Adapts the subscription into a stream, for consumers that prefer
    /// combinators over a receive loop.
    #[must_use]
    pub fn into_stream(self) -> futures::stream::BoxStream<'static, PublishedEvent> {
        use futures::StreamExt;

        futures::stream::unfold(self, |mut subscription| async move {
            subscription
                .recv()
                .await
                .map(|event| (event, subscription))
        })
        .boxed()
    }

    /// Receives the next event, or `None` once the bus is gone.
    pub async fn recv(&mut self) -> Option<PublishedEvent> {
        use broadcast::error::{RecvError, TryRecvError};

        loop {
            match self.high.try_recv() {
                Ok(event) => return Some(event),
                Err(TryRecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "high-priority lane lagged");
                    continue;
                }
                Err(TryRecvError::Empty | TryRecvError::Closed) => {}
            }

            match self.normal.try_recv() {
                Ok(event) => return Some(event),
                Err(TryRecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "normal lane lagged");
                    continue;
                }
                Err(TryRecvError::Empty | TryRecvError::Closed) => {}
            }

            tokio::select! {
                biased;
                result = self.high.recv() => match result {
                    Ok(event) => return Some(event),
                    Err(RecvError::Lagged(_)) => continue,
                    Err(RecvError::Closed) => return None,
                },
                result = self.normal.recv() => match result {
                    Ok(event) => return Some(event),
                    Err(RecvError::Lagged(_)) => continue,
                    Err(RecvError::Closed) => return None,
                },
            }
        }
    }
}

/// How announce-phase operations and projection updates are retried.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    /// Doubles on each retry, up to `max_backoff`.
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: Duration::from_millis(50),
            max_backoff: Duration::from_secs(5),
        }
    }
}

/// Retries a fallible async operation with exponential backoff.
pub(crate) async fn retry_with_backoff<F, Fut, T, E>(
    operation: F,
    policy: &RetryPolicy,
    context: &'static str,
) -> Result<T, E>
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut attempt = 0;
    let mut backoff = policy.initial_backoff;

    loop {
        attempt += 1;

        match operation().await {
            Ok(result) => {
                if attempt > 1 {
                    tracing::debug!(context, attempt, "operation succeeded after retry");
                }
                return Ok(result);
            }
            Err(error) => {
                if attempt >= policy.max_attempts {
                    tracing::warn!(context, attempt, %error, "operation failed after max retries");
                    return Err(error);
                }

                tracing::debug!(
                    context,
                    attempt,
                    backoff_ms = backoff.as_millis() as u64,
                    %error,
                    "operation failed, retrying"
                );
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(policy.max_backoff);
            }
        }
    }
}
