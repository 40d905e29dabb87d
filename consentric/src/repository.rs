//! Event-sourced repository: loads Aggregates by replaying their streams and
//! saves them by appending the uncommitted events under an expected version.

use std::marker::PhantomData;
use std::sync::Arc;

use chrono::Utc;
use serde::{de::DeserializeOwned, Serialize};
use uuid::Uuid;

use crate::aggregate::{Aggregate, Context};
use crate::event::{DomainEvent, RecordedEvent};
use crate::store::{
    CryptoError, EventCrypto, EventStore, SnapshotPolicy, StoreError, StoredEvent, StoredSnapshot,
};
use crate::Version;

/// List of possible errors that can be returned by [`Repository::load`].
#[derive(Debug, thiserror::Error)]
pub enum RepositoryError<E> {
    /// The desired Aggregate could not be found in the data store.
    #[error("aggregate was not found")]
    AggregateNotFound,

    /// The Aggregate returned an error while applying a Domain Event from
    /// its own history. This usually implies the stream contains corrupted
    /// or invalid data.
    #[error("failed to apply event {0} to aggregate: {1:?}")]
    Apply(Uuid, E),

    /// A persisted event could not be decoded into a known event kind.
    /// Unknown kinds are a fatal decode error, never a silent skip.
    #[error("failed to decode stored event {event_id} of type {event_type}: {message}")]
    Decode {
        event_id: Uuid,
        event_type: String,
        message: String,
    },

    /// The encryption collaborator failed while decrypting a payload.
    #[error(transparent)]
    Crypto(#[from] CryptoError),

    /// The event store failed.
    #[error("event store failed: {0}")]
    Store(#[from] StoreError),
}

/// List of possible errors that can be returned by [`Repository::save`].
#[derive(Debug, thiserror::Error)]
pub enum SaveError {
    /// The event store rejected or failed the append. A
    /// [`StoreError::VersionConflict`] here means another writer won the
    /// optimistic-concurrency race; reload and retry or surface the conflict.
    #[error("event store failed: {0}")]
    Store(#[from] StoreError),

    /// An event payload could not be serialized.
    #[error("failed to serialize event payload: {0}")]
    Encode(#[from] serde_json::Error),

    /// The encryption collaborator failed while encrypting a payload.
    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

impl SaveError {
    /// Whether this error is an optimistic-concurrency loss.
    #[must_use]
    pub fn is_version_conflict(&self) -> bool {
        matches!(self, SaveError::Store(StoreError::VersionConflict { .. }))
    }
}

/// A Repository loads and saves one kind of [`Aggregate`] from and to an
/// [`EventStore`], translating between typed Domain Events and their
/// persisted (possibly encrypted) form.
pub struct Repository<T> {
    store: Arc<dyn EventStore>,
    crypto: Arc<dyn EventCrypto>,
    snapshot_policy: SnapshotPolicy,
    _aggregate: PhantomData<fn() -> T>,
}

impl<T> Clone for Repository<T> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            crypto: Arc::clone(&self.crypto),
            snapshot_policy: self.snapshot_policy,
            _aggregate: PhantomData,
        }
    }
}

impl<T> Repository<T>
where
    T: Aggregate + Serialize + DeserializeOwned,
    T::DomainEvent: Serialize + DeserializeOwned,
{
    #[must_use]
    pub fn new(store: Arc<dyn EventStore>, crypto: Arc<dyn EventCrypto>) -> Self {
        Self {
            store,
            crypto,
            snapshot_policy: SnapshotPolicy::default(),
            _aggregate: PhantomData,
        }
    }

    #[must_use]
    pub fn with_snapshot_policy(mut self, policy: SnapshotPolicy) -> Self {
        self.snapshot_policy = policy;
        self
    }

    /// Returns the shared event store handle.
    #[must_use]
    pub fn store(&self) -> Arc<dyn EventStore> {
        Arc::clone(&self.store)
    }

    /// Loads an Aggregate Root instance from the data store, referenced by
    /// the id of its event stream.
    ///
    /// Replay starts from the nearest usable snapshot; snapshots with a
    /// stale schema version or undecodable state are ignored and the full
    /// stream is folded instead.
    ///
    /// # Errors
    ///
    /// Fails with [`RepositoryError::AggregateNotFound`] when the stream has
    /// no events, and with [`RepositoryError::Decode`] /
    /// [`RepositoryError::Apply`] when the stream cannot be folded back into
    /// a valid state.
    pub async fn load(
        &self,
        stream_id: Uuid,
    ) -> Result<Context<T>, RepositoryError<T::ApplyError>> {
        let snapshot = match self.store.snapshot(stream_id).await {
            Ok(snapshot) => snapshot,
            Err(error) => {
                tracing::warn!(%stream_id, %error, "failed to read snapshot, replaying full stream");
                None
            }
        };

        let (mut context, from_version) = match snapshot {
            Some(snapshot) if snapshot.snapshot_version == T::SNAPSHOT_VERSION => {
                match serde_json::from_value::<T>(snapshot.state.clone()) {
                    Ok(aggregate) => {
                        let version = snapshot.sequence;
                        (Some(Context::restore(aggregate, version)), version + 1)
                    }
                    Err(error) => {
                        tracing::warn!(%stream_id, %error, "undecodable snapshot ignored");
                        (None, 1)
                    }
                }
            }
            _ => (None, 1),
        };

        for stored in self.store.load(stream_id, from_version).await? {
            let event_id = stored.event_id;
            let recorded = self.decode(stored)?;

            let next = match context.take() {
                None => Context::rehydrate_from(&recorded),
                Some(context) => context.apply_rehydrated_event(&recorded),
            };

            context = Some(next.map_err(|e| RepositoryError::Apply(event_id, e))?);
        }

        context.ok_or(RepositoryError::AggregateNotFound)
    }

    /// Stores the uncommitted events of an Aggregate Root instance.
    ///
    /// The append is atomic and carries the expected version implied by the
    /// first uncommitted event; everything after it (the snapshot write) is
    /// a replay-cost optimization whose failure is logged and swallowed.
    ///
    /// # Errors
    ///
    /// Fails with a version conflict inside [`SaveError::Store`] when
    /// another writer appended to the stream first.
    pub async fn save(&self, root: &mut Context<T>) -> Result<(), SaveError> {
        let events_to_commit = root.take_uncommitted_events();

        let Some(first) = events_to_commit.first() else {
            return Ok(());
        };
        let expected_version = first.sequence - 1;

        let stream_id = root.stream_id();
        let rows = events_to_commit
            .iter()
            .map(|recorded| self.encode(stream_id, recorded))
            .collect::<Result<Vec<_>, SaveError>>()?;

        let new_version = self.store.append(stream_id, rows, expected_version).await?;

        self.maybe_snapshot(stream_id, root.state(), new_version)
            .await;

        Ok(())
    }

    /// Read-only helper for pre-flight optimistic checks.
    pub async fn current_version(&self, stream_id: Uuid) -> Result<Version, StoreError> {
        self.store.current_version(stream_id).await
    }

    /// Read-only helper for pre-flight existence checks.
    pub async fn exists(&self, stream_id: Uuid) -> Result<bool, StoreError> {
        self.store.exists(stream_id).await
    }

    fn encode(
        &self,
        stream_id: Uuid,
        recorded: &RecordedEvent<T::DomainEvent>,
    ) -> Result<StoredEvent, SaveError> {
        let plaintext = serde_json::to_string(&recorded.event)?;
        let (payload, encrypted) = if recorded.event.is_sensitive() {
            (self.crypto.encrypt(&plaintext)?, true)
        } else {
            (plaintext, false)
        };

        Ok(StoredEvent {
            event_id: recorded.event.event_id(),
            aggregate_id: stream_id,
            aggregate_type: T::AGGREGATE_TYPE.to_owned(),
            sequence: recorded.sequence,
            event_type: recorded.event.event_type().to_owned(),
            payload,
            encrypted,
            metadata: recorded.metadata,
            occurred_at: recorded.occurred_at,
        })
    }

    fn decode(
        &self,
        stored: StoredEvent,
    ) -> Result<RecordedEvent<T::DomainEvent>, RepositoryError<T::ApplyError>> {
        let payload = if stored.encrypted {
            self.crypto.decrypt(&stored.payload)?
        } else {
            stored.payload
        };

        let event =
            serde_json::from_str::<T::DomainEvent>(&payload).map_err(|e| {
                RepositoryError::Decode {
                    event_id: stored.event_id,
                    event_type: stored.event_type.clone(),
                    message: e.to_string(),
                }
            })?;

        Ok(RecordedEvent {
            sequence: stored.sequence,
            occurred_at: stored.occurred_at,
            metadata: stored.metadata,
            event,
        })
    }

    async fn maybe_snapshot(&self, stream_id: Uuid, state: &T, version: Version) {
        let last_snapshot = match self.store.snapshot(stream_id).await {
            Ok(snapshot) => snapshot.map(|s| s.sequence),
            Err(error) => {
                tracing::warn!(%stream_id, %error, "failed to read snapshot state");
                return;
            }
        };

        if !self.snapshot_policy.is_due(version, last_snapshot) {
            return;
        }

        let state = match serde_json::to_value(state) {
            Ok(state) => state,
            Err(error) => {
                tracing::warn!(%stream_id, %error, "failed to serialize snapshot");
                return;
            }
        };

        let snapshot = StoredSnapshot {
            aggregate_id: stream_id,
            sequence: version,
            snapshot_version: T::SNAPSHOT_VERSION,
            state,
            created_at: Utc::now(),
        };

        if let Err(error) = self.store.store_snapshot(snapshot).await {
            tracing::warn!(%stream_id, %error, "failed to store snapshot");
        }
    }
}
