use chrono::{DateTime, Utc};

use crate::aggregate::Aggregate;
use crate::event::{EventMetadata, RecordedEvent};
use crate::Version;

/// A context object that should be used by the Aggregate [Root] methods to
/// access the [Aggregate] state and to record new Domain Events.
#[derive(Debug, Clone)]
#[must_use]
pub struct Context<T>
where
    T: Aggregate,
{
    aggregate: T,
    version: Version,
    uncommitted_events: Vec<RecordedEvent<T::DomainEvent>>,
}

impl<T> Context<T>
where
    T: Aggregate,
{
    /// Returns the identifier of the event stream backing this Aggregate
    /// instance.
    pub fn stream_id(&self) -> uuid::Uuid {
        self.aggregate.stream_id()
    }

    /// Returns the current version for the [Aggregate], equal to the number
    /// of events applied to it.
    pub fn version(&self) -> Version {
        self.version
    }

    /// Returns the current snapshot schema version of the [Aggregate].
    pub fn snapshot_version(&self) -> u32 {
        T::SNAPSHOT_VERSION
    }

    /// Returns read access to the [Aggregate] state.
    pub fn state(&self) -> &T {
        &self.aggregate
    }

    /// Returns the uncommitted, recorded Domain Events in this [Context].
    pub fn uncommitted_events(&self) -> &[RecordedEvent<T::DomainEvent>] {
        &self.uncommitted_events
    }

    /// Returns the list of uncommitted, recorded Domain Events from the
    /// [Context] and resets the internal list to its default value.
    #[doc(hidden)]
    pub fn take_uncommitted_events(&mut self) -> Vec<RecordedEvent<T::DomainEvent>> {
        std::mem::take(&mut self.uncommitted_events)
    }

    /// Creates a new [Context] by applying the specified Domain Event as the
    /// first event of a fresh stream.
    ///
    /// # Errors
    ///
    /// The method can return an error if the event to apply is unexpected
    /// given the current state of the Aggregate.
    pub fn record_new(
        event: T::DomainEvent,
        occurred_at: DateTime<Utc>,
        metadata: EventMetadata,
    ) -> Result<Context<T>, T::ApplyError> {
        let aggregate = T::apply_new(&event)?;

        Ok(Context {
            aggregate,
            version: 1,
            uncommitted_events: vec![RecordedEvent {
                sequence: 1,
                occurred_at,
                metadata,
                event,
            }],
        })
    }

    /// Records a change to the [Aggregate] [Root], expressed by the specified
    /// Domain Event.
    ///
    /// # Errors
    ///
    /// The method can return an error if the event to apply is unexpected
    /// given the current state of the Aggregate.
    pub fn record_that(
        &mut self,
        event: T::DomainEvent,
        occurred_at: DateTime<Utc>,
        metadata: EventMetadata,
    ) -> Result<(), T::ApplyError> {
        self.aggregate.apply(&event)?;
        self.version += 1;

        self.uncommitted_events.push(RecordedEvent {
            sequence: self.version,
            occurred_at,
            metadata,
            event,
        });

        Ok(())
    }

    /// Creates a new [Context] instance from a Domain Event while
    /// rehydrating an [Aggregate] from its event stream.
    ///
    /// # Errors
    ///
    /// The method can return an error if the event to apply is unexpected
    /// given the current state of the Aggregate.
    #[doc(hidden)]
    pub fn rehydrate_from(
        event: &RecordedEvent<T::DomainEvent>,
    ) -> Result<Context<T>, T::ApplyError> {
        debug_assert!(event.sequence == 1);

        Ok(Context {
            aggregate: T::apply_new(&event.event)?,
            version: event.sequence,
            uncommitted_events: Vec::default(),
        })
    }

    /// Applies a historical Domain Event to the [Context] while rehydrating
    /// an [Aggregate].
    ///
    /// # Errors
    ///
    /// The method can return an error if the event to apply is unexpected
    /// given the current state of the Aggregate.
    #[doc(hidden)]
    pub fn apply_rehydrated_event(
        mut self,
        event: &RecordedEvent<T::DomainEvent>,
    ) -> Result<Context<T>, T::ApplyError> {
        self.aggregate.apply(&event.event)?;
        self.version += 1;
        debug_assert!(self.version == event.sequence);

        Ok(self)
    }

    /// Restores a [Context] from previously materialized state, e.g. a
    /// snapshot or a cache entry. The caller is responsible for `version`
    /// matching the number of events folded into `aggregate`.
    #[must_use]
    pub fn restore(aggregate: T, version: Version) -> Context<T> {
        Context {
            aggregate,
            version,
            uncommitted_events: Vec::default(),
        }
    }
}

/// Marker trait providing the `record_new` entry point for all Aggregates.
pub trait Root<T>
where
    T: Aggregate,
{
    /// Creates a new [Aggregate] [Root] instance by applying the specified
    /// Domain Event.
    ///
    /// # Errors
    ///
    /// The method can return an error if the event to apply is unexpected
    /// given the current state of the Aggregate.
    fn record_new(
        event: T::DomainEvent,
        occurred_at: DateTime<Utc>,
        metadata: EventMetadata,
    ) -> Result<Context<T>, T::ApplyError> {
        Context::record_new(event, occurred_at, metadata)
    }
}

impl<T> Root<T> for T where T: Aggregate {}
