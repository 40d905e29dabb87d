//! Write-through consent cache.
//!
//! Pure performance layer, never the system of record: every entry can be
//! rebuilt by replaying the event stream, so cache failures are swallowed
//! and never fail the triggering command. A revoked consent must never be
//! served stale, which is why revocation invalidates synchronously.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tokio::sync::RwLock;

use crate::clock::Clock;
use crate::consent::{Consent, ConsentId};
use crate::Version;

/// A cached consent with the version it was materialized at.
#[derive(Debug, Clone)]
pub struct CachedConsent {
    pub consent: Consent,
    pub version: Version,
}

/// Disposable acceleration layer over the consent aggregate.
///
/// The surface is infallible on purpose: implementations swallow backend
/// failures internally, so callers cannot accidentally fail a command on a
/// cache error.
#[async_trait]
pub trait ConsentCache: Send + Sync {
    /// Returns the cached consent, if present and still fresh.
    async fn get(&self, id: ConsentId) -> Option<CachedConsent>;

    /// Caches a consent at the given version.
    async fn put(&self, consent: &Consent, version: Version);

    /// Drops the entry for `id` immediately.
    async fn invalidate(&self, id: ConsentId);
}

#[derive(Debug, Clone)]
struct CacheEntry {
    consent: Consent,
    version: Version,
    fresh_until: DateTime<Utc>,
}

/// In-process [`ConsentCache`] with a TTL derived from the consent's
/// remaining validity.
pub struct InMemoryConsentCache {
    entries: RwLock<HashMap<ConsentId, CacheEntry>>,
    clock: Arc<dyn Clock>,
    default_ttl: Duration,
}

impl InMemoryConsentCache {
    #[must_use]
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            clock,
            default_ttl: Duration::minutes(30),
        }
    }

    #[must_use]
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.default_ttl = ttl;
        self
    }

    /// Number of live entries, for observability in tests and demos.
    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.entries.read().await.is_empty()
    }

    fn ttl_for(&self, consent: &Consent, now: DateTime<Utc>) -> Duration {
        let remaining_validity = consent.expires_at() - now;
        self.default_ttl.min(remaining_validity)
    }
}

#[async_trait]
impl ConsentCache for InMemoryConsentCache {
    async fn get(&self, id: ConsentId) -> Option<CachedConsent> {
        let now = self.clock.now();
        let entries = self.entries.read().await;
        let entry = entries.get(&id)?;

        if now >= entry.fresh_until {
            return None;
        }

        // A terminal consent is never served from cache; the authoritative
        // stream answers those reads.
        if entry.consent.status().is_terminal() {
            return None;
        }

        Some(CachedConsent {
            consent: entry.consent.clone(),
            version: entry.version,
        })
    }

    async fn put(&self, consent: &Consent, version: Version) {
        let now = self.clock.now();
        let ttl = self.ttl_for(consent, now);
        if ttl <= Duration::zero() {
            return;
        }

        let entry = CacheEntry {
            consent: consent.clone(),
            version,
            fresh_until: now + ttl,
        };

        self.entries.write().await.insert(consent.id(), entry);
        tracing::debug!(consent_id = %consent.id(), version, "consent cached");
    }

    async fn invalidate(&self, id: ConsentId) {
        self.entries.write().await.remove(&id);
        tracing::debug!(consent_id = %id, "cache entry invalidated");
    }
}
