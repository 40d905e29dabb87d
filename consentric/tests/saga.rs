mod common;

use std::sync::Arc;
use std::time::Duration;

use common::helpers::{
    auth_context, DirectoryMode, FailingPublisher, Harness, HarnessOptions,
};

use consentric::cache::ConsentCache;
use consentric::consent::{ConsentId, ConsentStatus};
use consentric::saga::{AuthorizeConsent, CommandError, RevokeConsent, SagaConfig};
use consentric::store::EventStore;

#[tokio::test]
pub async fn directory_rejection_aborts_before_any_persistence() {
    // Arrange
    let harness = Harness::new();
    harness
        .directory
        .set_mode(DirectoryMode::Invalid("participant suspended".to_owned()));

    // Act
    let err = harness
        .orchestrator
        .create(harness.create_command())
        .await
        .expect_err("Creation must fail when the directory rejects");

    // Assert: failure before step 4 needs no compensation, nothing exists.
    assert!(matches!(err, CommandError::ParticipantValidation(_)));
    assert!(err.to_string().contains("participant suspended"));

    for aggregate_type in ["consent", "participant"] {
        let streams = harness
            .store
            .aggregate_ids(aggregate_type)
            .await
            .expect("Failed to list streams");
        assert!(streams.is_empty());
    }
    assert_eq!(harness.metrics.count("consent_created"), 0);
}

#[tokio::test]
pub async fn directory_outage_is_a_retryable_failure() {
    // Arrange
    let harness = Harness::new();
    harness
        .directory
        .set_mode(DirectoryMode::Unavailable("connection refused".to_owned()));

    // Act
    let err = harness
        .orchestrator
        .create(harness.create_command())
        .await
        .expect_err("Creation must fail when the directory is down");

    // Assert
    assert!(matches!(err, CommandError::ParticipantValidation(_)));

    // The same request succeeds once the directory recovers.
    harness.directory.set_mode(DirectoryMode::Valid);
    let receipt = harness
        .orchestrator
        .create(harness.create_command())
        .await
        .expect("Failed to create consent after recovery");
    assert_eq!(receipt.status, ConsentStatus::Pending);
}

#[tokio::test]
pub async fn directory_timeout_resolves_to_a_creation_failure() {
    // Arrange: a directory that never answers and a tight timeout.
    let mut options = HarnessOptions::default();
    options.config = SagaConfig {
        directory_timeout: Duration::from_millis(50),
        ..SagaConfig::default()
    };
    let harness = Harness::with_options(options);
    harness.directory.set_mode(DirectoryMode::Hang);

    // Act
    let started = std::time::Instant::now();
    let err = harness
        .orchestrator
        .create(harness.create_command())
        .await
        .expect_err("Creation must fail instead of blocking");

    // Assert
    assert!(matches!(err, CommandError::ParticipantValidation(_)));
    assert!(err.to_string().contains("timed out"));
    assert!(started.elapsed() < Duration::from_secs(5));
}

#[tokio::test]
pub async fn publication_failures_never_unseat_a_committed_creation() {
    // Arrange: the bus is down for the announce phase.
    let options = HarnessOptions {
        publisher: Some(Arc::new(FailingPublisher)),
        ..HarnessOptions::default()
    };
    let harness = Harness::with_options(options);

    // Act
    let receipt = harness
        .orchestrator
        .create(harness.create_command())
        .await
        .expect("Creation must succeed despite the failing publisher");

    // Assert: the consent is durable and the creation metric was emitted.
    let version = harness
        .store
        .current_version(receipt.consent_id.as_uuid())
        .await
        .expect("Failed to read stream version");
    assert_eq!(version, 1);
    assert_eq!(harness.metrics.count("consent_created"), 1);

    // The write-through cache was still updated in the announce phase.
    let cached = harness
        .cache
        .get(receipt.consent_id)
        .await
        .expect("Consent should be cached");
    assert_eq!(cached.version, 1);
}

#[tokio::test]
pub async fn revocation_evicts_the_cache_even_when_notification_fails() {
    // Arrange
    let harness = Harness::new();
    harness.directory.fail_notifications();

    let receipt = harness
        .orchestrator
        .create(harness.create_command())
        .await
        .expect("Failed to create consent");
    harness
        .orchestrator
        .authorize(AuthorizeConsent {
            consent_id: receipt.consent_id,
            context: auth_context(),
            correlation_id: None,
        })
        .await
        .expect("Failed to authorize consent");
    assert!(harness.cache.get(receipt.consent_id).await.is_some());

    // Act
    harness
        .orchestrator
        .revoke(RevokeConsent {
            consent_id: receipt.consent_id,
            reason: "customer request".to_owned(),
            correlation_id: None,
        })
        .await
        .expect("Revocation must succeed despite the failing notification");

    // Assert
    assert!(
        harness.cache.get(receipt.consent_id).await.is_none(),
        "a revoked consent must never be served from cache"
    );
    assert!(harness.directory.notification_attempts() >= 1);

    // Reads fall back to replay and see the revocation immediately.
    let read = harness
        .orchestrator
        .get(receipt.consent_id)
        .await
        .expect("Failed to read consent");
    assert_eq!(read.consent.status(), ConsentStatus::Revoked);
}

#[tokio::test]
pub async fn reads_are_served_through_the_write_through_cache() {
    // Arrange
    let harness = Harness::new();
    let receipt = harness
        .orchestrator
        .create(harness.create_command())
        .await
        .expect("Failed to create consent");

    // Assert: create already cached the aggregate.
    let cached = harness
        .cache
        .get(receipt.consent_id)
        .await
        .expect("Consent should be cached after create");
    assert_eq!(cached.version, 1);
    assert_eq!(cached.consent.status(), ConsentStatus::Pending);

    // A cold read repopulates the cache from the event store.
    harness.cache.invalidate(receipt.consent_id).await;
    let read = harness
        .orchestrator
        .get(receipt.consent_id)
        .await
        .expect("Failed to read consent");
    assert_eq!(read.version, 1);
    assert!(harness.cache.get(receipt.consent_id).await.is_some());
}

#[tokio::test]
pub async fn unknown_consents_surface_not_found() {
    // Arrange
    let harness = Harness::new();
    let missing = ConsentId::generate();

    // Act & Assert
    let err = harness
        .orchestrator
        .authorize(AuthorizeConsent {
            consent_id: missing,
            context: auth_context(),
            correlation_id: None,
        })
        .await
        .expect_err("Authorizing a missing consent must fail");
    assert!(matches!(err, CommandError::NotFound(id) if id == missing));
}
