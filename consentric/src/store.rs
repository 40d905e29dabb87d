//! Event store ports and records.
//!
//! The event store is the only system of record: a durable, append-only,
//! per-aggregate ordered log guarded by optimistic concurrency. Everything
//! else (cache, read models) is derived and disposable.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::event::EventMetadata;
use crate::Version;

/// The persisted form of a domain event.
///
/// `payload` is either plain JSON or opaque ciphertext; `encrypted` tells the
/// two apart. The store never looks inside the payload.
#[derive(Debug, Clone, Eq, PartialEq, Serialize, Deserialize)]
pub struct StoredEvent {
    pub event_id: Uuid,
    pub aggregate_id: Uuid,
    pub aggregate_type: String,
    /// Position in the stream; unique per (aggregate_id, sequence).
    pub sequence: Version,
    pub event_type: String,
    pub payload: String,
    pub encrypted: bool,
    pub metadata: EventMetadata,
    pub occurred_at: DateTime<Utc>,
}

/// A materialized aggregate state stored next to the stream, at most one per
/// aggregate. Snapshots only reduce replay cost; losing one never loses data.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredSnapshot {
    pub aggregate_id: Uuid,
    /// Sequence of the last event folded into `state`.
    pub sequence: Version,
    /// Schema version of `state`; stale snapshots are ignored on load.
    pub snapshot_version: u32,
    pub state: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

/// List of possible errors that can be returned by an [`EventStore`].
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The optimistic-concurrency check failed: another writer appended to
    /// the stream first. Retryable after reloading the aggregate.
    #[error(
        "version conflict on aggregate {aggregate_id}: expected {expected}, actual {actual}"
    )]
    VersionConflict {
        aggregate_id: Uuid,
        expected: Version,
        actual: Version,
    },

    /// The storage backend failed.
    #[error("event store backend error: {0}")]
    Backend(String),
}

/// Durable, append-only, per-aggregate ordered event log.
#[async_trait]
pub trait EventStore: Send + Sync {
    /// Appends `events` to the stream of `aggregate_id`.
    ///
    /// The whole batch is persisted atomically with sequences
    /// `expected_version + 1..`, or nothing is persisted at all. This
    /// expected-version check is the system's sole concurrency-control
    /// mechanism.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::VersionConflict`] when the persisted version of
    /// the stream differs from `expected_version`.
    async fn append(
        &self,
        aggregate_id: Uuid,
        events: Vec<StoredEvent>,
        expected_version: Version,
    ) -> Result<Version, StoreError>;

    /// Returns the ordered slice of the stream starting at `from_version`
    /// (inclusive). Sequences start at 1; pass 1 for the full stream.
    async fn load(
        &self,
        aggregate_id: Uuid,
        from_version: Version,
    ) -> Result<Vec<StoredEvent>, StoreError>;

    /// Returns the persisted version of the stream, 0 if it does not exist.
    /// Used by orchestration for pre-flight optimistic checks.
    async fn current_version(&self, aggregate_id: Uuid) -> Result<Version, StoreError>;

    /// Returns whether any event exists for `aggregate_id`.
    async fn exists(&self, aggregate_id: Uuid) -> Result<bool, StoreError>;

    /// Returns the ids of all streams of the given aggregate type, for
    /// rebuilds and consistency scans.
    async fn aggregate_ids(&self, aggregate_type: &str) -> Result<Vec<Uuid>, StoreError>;

    /// Returns the snapshot for `aggregate_id`, if one exists.
    async fn snapshot(&self, aggregate_id: Uuid) -> Result<Option<StoredSnapshot>, StoreError>;

    /// Stores `snapshot`, replacing any previous one for the same aggregate.
    async fn store_snapshot(&self, snapshot: StoredSnapshot) -> Result<(), StoreError>;
}

/// When to materialize a snapshot for a stream.
#[derive(Debug, Clone, Copy)]
pub struct SnapshotPolicy {
    /// Snapshot once this many events accumulated since the last one.
    pub frequency: Version,
    /// Always snapshot once the stream grows past this length.
    pub max_events_without_snapshot: Version,
}

impl Default for SnapshotPolicy {
    fn default() -> Self {
        Self {
            frequency: 10,
            max_events_without_snapshot: 100,
        }
    }
}

impl SnapshotPolicy {
    /// Decides whether a stream at `version` with a previous snapshot at
    /// `last_snapshot` (if any) is due for a new snapshot.
    #[must_use]
    pub fn is_due(&self, version: Version, last_snapshot: Option<Version>) -> bool {
        if version < self.frequency {
            return false;
        }

        match last_snapshot {
            None => version >= self.frequency,
            Some(at) => {
                version.saturating_sub(at) >= self.frequency
                    || version >= self.max_events_without_snapshot
            }
        }
    }
}

/// Error returned by the external encryption collaborator.
#[derive(Debug, thiserror::Error)]
#[error("encryption service failed: {0}")]
pub struct CryptoError(pub String);

/// External encryption collaborator for sensitive event payloads.
///
/// The store only ever holds the opaque output of `encrypt`; the
/// cryptographic internals live outside this crate.
pub trait EventCrypto: Send + Sync {
    /// Encrypts a serialized payload.
    fn encrypt(&self, plaintext: &str) -> Result<String, CryptoError>;

    /// Decrypts an encrypted payload.
    fn decrypt(&self, ciphertext: &str) -> Result<String, CryptoError>;

    /// Whether `payload` looks like output of this service's `encrypt`.
    fn is_encrypted(&self, payload: &str) -> bool;
}

/// Pass-through [`EventCrypto`] for deployments without payload encryption.
#[derive(Debug, Clone, Copy, Default)]
pub struct PlaintextCrypto;

impl EventCrypto for PlaintextCrypto {
    fn encrypt(&self, plaintext: &str) -> Result<String, CryptoError> {
        Ok(plaintext.to_owned())
    }

    fn decrypt(&self, ciphertext: &str) -> Result<String, CryptoError> {
        Ok(ciphertext.to_owned())
    }

    fn is_encrypted(&self, _payload: &str) -> bool {
        false
    }
}

#[derive(Debug, Default)]
struct InMemoryState {
    streams: HashMap<Uuid, Vec<StoredEvent>>,
    snapshots: HashMap<Uuid, StoredSnapshot>,
}

/// In-process [`EventStore`] used by tests, demos and local development.
///
/// Appends for one aggregate serialize on the internal lock, which gives the
/// same atomicity and conflict semantics as the database-backed store.
#[derive(Debug, Default)]
pub struct InMemoryEventStore {
    inner: Mutex<InMemoryState>,
}

impl InMemoryEventStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, InMemoryState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Removes the snapshot for `aggregate_id`, if any. Replay must not
    /// depend on snapshots being present.
    pub fn drop_snapshot(&self, aggregate_id: Uuid) {
        self.lock().snapshots.remove(&aggregate_id);
    }
}

#[async_trait]
impl EventStore for InMemoryEventStore {
    async fn append(
        &self,
        aggregate_id: Uuid,
        events: Vec<StoredEvent>,
        expected_version: Version,
    ) -> Result<Version, StoreError> {
        if events.is_empty() {
            return self.current_version(aggregate_id).await;
        }

        let mut state = self.lock();
        let stream = state.streams.entry(aggregate_id).or_default();

        let actual = stream.len() as Version;
        if actual != expected_version {
            return Err(StoreError::VersionConflict {
                aggregate_id,
                expected: expected_version,
                actual,
            });
        }

        let mut sequence = expected_version;
        for mut event in events {
            sequence += 1;
            event.sequence = sequence;
            event.aggregate_id = aggregate_id;
            stream.push(event);
        }

        tracing::debug!(%aggregate_id, version = sequence, "events appended");
        Ok(sequence)
    }

    async fn load(
        &self,
        aggregate_id: Uuid,
        from_version: Version,
    ) -> Result<Vec<StoredEvent>, StoreError> {
        let state = self.lock();
        let events = state
            .streams
            .get(&aggregate_id)
            .map(|stream| {
                stream
                    .iter()
                    .filter(|event| event.sequence >= from_version)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();

        Ok(events)
    }

    async fn current_version(&self, aggregate_id: Uuid) -> Result<Version, StoreError> {
        let state = self.lock();
        Ok(state
            .streams
            .get(&aggregate_id)
            .map_or(0, |stream| stream.len() as Version))
    }

    async fn exists(&self, aggregate_id: Uuid) -> Result<bool, StoreError> {
        let state = self.lock();
        Ok(state
            .streams
            .get(&aggregate_id)
            .is_some_and(|stream| !stream.is_empty()))
    }

    async fn aggregate_ids(&self, aggregate_type: &str) -> Result<Vec<Uuid>, StoreError> {
        let state = self.lock();
        let mut ids: Vec<Uuid> = state
            .streams
            .iter()
            .filter(|(_, stream)| {
                stream
                    .first()
                    .is_some_and(|event| event.aggregate_type == aggregate_type)
            })
            .map(|(id, _)| *id)
            .collect();
        ids.sort();

        Ok(ids)
    }

    async fn snapshot(&self, aggregate_id: Uuid) -> Result<Option<StoredSnapshot>, StoreError> {
        Ok(self.lock().snapshots.get(&aggregate_id).cloned())
    }

    async fn store_snapshot(&self, snapshot: StoredSnapshot) -> Result<(), StoreError> {
        self.lock()
            .snapshots
            .insert(snapshot.aggregate_id, snapshot);
        Ok(())
    }
}
