//! Cleanup sweeper: drives overdue consents through the normal expiry event
//! path, coordinated across replicas by a cluster-wide lease.
//!
//! The sweeper never edits read models directly; it finds candidates in the
//! (possibly lagging) read models and each expiry is re-validated against
//! event-derived state by the orchestrator. Without the lease the sweep
//! degrades to a no-op — a skipped sweep is recoverable, duplicate expiry
//! events are not.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::clock::Clock;
use crate::consent::ConsentStatus;
use crate::metrics::MetricsSink;
use crate::projection::ConsentViewStore;
use crate::saga::{CommandError, ConsentOrchestrator};

/// Errors returned by lease backends.
#[derive(Debug, thiserror::Error)]
pub enum LeaseError {
    #[error("lease backend unavailable: {0}")]
    Unavailable(String),
}

/// Cluster-wide mutual-exclusion primitive: a single named lease holding an
/// owner and an expiry, updated conditionally.
#[async_trait]
pub trait LeaseStore: Send + Sync {
    /// Attempts to take or renew the named lease for `ttl`. Returns `false`
    /// when another live owner holds it.
    async fn acquire(
        &self,
        name: &str,
        owner: &str,
        ttl: chrono::Duration,
    ) -> Result<bool, LeaseError>;

    /// Releases the lease if `owner` still holds it.
    async fn release(&self, name: &str, owner: &str) -> Result<(), LeaseError>;
}

#[derive(Debug, Clone)]
struct LeaseRow {
    owner: String,
    expires_at: DateTime<Utc>,
}

/// In-process [`LeaseStore`] for tests, demos and single-node deployments.
pub struct InMemoryLeaseStore {
    leases: Mutex<HashMap<String, LeaseRow>>,
    clock: Arc<dyn Clock>,
}

impl InMemoryLeaseStore {
    #[must_use]
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            leases: Mutex::new(HashMap::new()),
            clock,
        }
    }
}

#[async_trait]
impl LeaseStore for InMemoryLeaseStore {
    async fn acquire(
        &self,
        name: &str,
        owner: &str,
        ttl: chrono::Duration,
    ) -> Result<bool, LeaseError> {
        let now = self.clock.now();
        let mut leases = self.leases.lock().unwrap_or_else(PoisonError::into_inner);

        match leases.get(name) {
            Some(row) if row.owner != owner && row.expires_at > now => Ok(false),
            _ => {
                leases.insert(
                    name.to_owned(),
                    LeaseRow {
                        owner: owner.to_owned(),
                        expires_at: now + ttl,
                    },
                );
                Ok(true)
            }
        }
    }

    async fn release(&self, name: &str, owner: &str) -> Result<(), LeaseError> {
        let mut leases = self.leases.lock().unwrap_or_else(PoisonError::into_inner);
        if leases.get(name).is_some_and(|row| row.owner == owner) {
            leases.remove(name);
        }
        Ok(())
    }
}

/// Sweeper tuning knobs.
#[derive(Debug, Clone)]
pub struct SweeperConfig {
    /// How often a replica attempts a sweep.
    pub interval: Duration,
    pub lease_name: String,
    /// Identity of this replica in the lease row.
    pub owner: String,
    pub lease_ttl: chrono::Duration,
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            lease_name: "consent-cleanup".to_owned(),
            owner: Uuid::new_v4().to_string(),
            lease_ttl: chrono::Duration::minutes(2),
        }
    }
}

/// Outcome of one sweep attempt.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepReport {
    /// The lease was not held, so the sweep did nothing.
    pub skipped: bool,
    pub expired: usize,
    pub failed: usize,
}

/// Periodically expires overdue consents through the orchestrator.
pub struct CleanupSweeper {
    orchestrator: Arc<ConsentOrchestrator>,
    views: Arc<dyn ConsentViewStore>,
    lease: Arc<dyn LeaseStore>,
    clock: Arc<dyn Clock>,
    metrics: Arc<dyn MetricsSink>,
    config: SweeperConfig,
}

impl CleanupSweeper {
    pub fn new(
        orchestrator: Arc<ConsentOrchestrator>,
        views: Arc<dyn ConsentViewStore>,
        lease: Arc<dyn LeaseStore>,
        clock: Arc<dyn Clock>,
        metrics: Arc<dyn MetricsSink>,
        config: SweeperConfig,
    ) -> Self {
        Self {
            orchestrator,
            views,
            lease,
            clock,
            metrics,
            config,
        }
    }

    /// Runs sweeps forever. Spawn as a background task.
    pub async fn run(self: Arc<Self>) {
        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            ticker.tick().await;
            let report = self.run_once().await;
            if !report.skipped {
                tracing::debug!(
                    expired = report.expired,
                    failed = report.failed,
                    "sweep finished"
                );
            }
        }
    }

    /// Performs one sweep attempt.
    pub async fn run_once(&self) -> SweepReport {
        match self
            .lease
            .acquire(
                &self.config.lease_name,
                &self.config.owner,
                self.config.lease_ttl,
            )
            .await
        {
            Ok(true) => {}
            Ok(false) => {
                tracing::debug!(lease = %self.config.lease_name, "another replica holds the sweep lease");
                return SweepReport {
                    skipped: true,
                    ..SweepReport::default()
                };
            }
            Err(error) => {
                tracing::warn!(%error, "lease backend unavailable, skipping sweep");
                return SweepReport {
                    skipped: true,
                    ..SweepReport::default()
                };
            }
        }

        let report = self.sweep().await;

        if let Err(error) = self
            .lease
            .release(&self.config.lease_name, &self.config.owner)
            .await
        {
            tracing::debug!(%error, "failed to release sweep lease, it will expire on its own");
        }

        report
    }

    async fn sweep(&self) -> SweepReport {
        let now = self.clock.now();
        let mut report = SweepReport::default();

        let mut candidates = Vec::new();
        for status in [ConsentStatus::Pending, ConsentStatus::Authorized] {
            match self.views.by_status(status).await {
                Ok(views) => candidates.extend(views),
                Err(error) => {
                    tracing::warn!(%error, %status, "failed to scan read models for overdue consents");
                }
            }
        }

        for view in candidates {
            if view.expires_at > now {
                continue;
            }

            match self.orchestrator.expire(view.consent_id).await {
                Ok(_) => {
                    report.expired += 1;
                    self.metrics.increment("consent_swept");
                }
                // Another replica or a direct revocation got there first, or
                // the read model lagged behind a terminal transition.
                Err(CommandError::Consent(_) | CommandError::Validation(_)) => {}
                Err(CommandError::VersionConflict { .. } | CommandError::NotFound(_)) => {}
                Err(error) => {
                    report.failed += 1;
                    tracing::warn!(consent_id = %view.consent_id, %error, "expiry sweep failed for consent");
                }
            }
        }

        report
    }
}
