mod common;

use common::helpers::{auth_context, usage_context, ConsentBuilder, Harness};

use consentric::clock::Clock;
use consentric::consent::{ConsentError, ConsentStatus};
use consentric::saga::{AuthorizeConsent, CommandError, RecordUsage, RevokeConsent};
use consentric::store::{EventStore, SnapshotPolicy};

#[tokio::test]
pub async fn creating_a_consent_yields_pending_at_version_one() {
    // Arrange
    let harness = Harness::new();
    let now = harness.clock.now();

    // Act
    let receipt = harness
        .orchestrator
        .create(harness.create_command())
        .await
        .expect("Failed to create consent");

    // Assert
    assert_eq!(receipt.status, ConsentStatus::Pending);
    assert_eq!(receipt.version, 1);
    assert_eq!(receipt.expires_at, now + chrono::Duration::days(30));
    assert!(receipt.expires_at > now);

    let stored_version = harness
        .store
        .current_version(receipt.consent_id.as_uuid())
        .await
        .expect("Failed to read stream version");
    assert_eq!(stored_version, 1);
}

#[tokio::test]
pub async fn authorizing_a_pending_consent_sets_status_and_timestamp() {
    // Arrange
    let harness = Harness::new();
    let receipt = harness
        .orchestrator
        .create(harness.create_command())
        .await
        .expect("Failed to create consent");

    // Act
    let receipt = harness
        .orchestrator
        .authorize(AuthorizeConsent {
            consent_id: receipt.consent_id,
            context: auth_context(),
            correlation_id: None,
        })
        .await
        .expect("Failed to authorize consent");

    // Assert
    assert_eq!(receipt.status, ConsentStatus::Authorized);
    assert_eq!(receipt.version, 2);

    let loaded = harness
        .consents()
        .load(receipt.consent_id.as_uuid())
        .await
        .expect("Failed to load consent");
    assert_eq!(loaded.state().authorized_at(), Some(harness.clock.now()));
}

#[tokio::test]
pub async fn revoking_blocks_further_usage() {
    // Arrange
    let harness = Harness::new();
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

    // Act
    let revoked = harness
        .orchestrator
        .revoke(RevokeConsent {
            consent_id: receipt.consent_id,
            reason: "customer request".to_owned(),
            correlation_id: None,
        })
        .await
        .expect("Failed to revoke consent");

    // Assert
    assert_eq!(revoked.status, ConsentStatus::Revoked);
    assert_eq!(revoked.version, 3);

    let loaded = harness
        .consents()
        .load(receipt.consent_id.as_uuid())
        .await
        .expect("Failed to load consent");
    assert_eq!(loaded.state().revocation_reason(), Some("customer request"));

    let err = harness
        .orchestrator
        .record_usage(RecordUsage {
            consent_id: receipt.consent_id,
            context: usage_context(),
            correlation_id: None,
        })
        .await
        .expect_err("Usage against a revoked consent must fail");
    assert!(matches!(
        err,
        CommandError::Consent(ConsentError::ConsentNotActive { .. })
    ));
}

#[tokio::test]
pub async fn revocation_is_one_way() {
    // Arrange
    let harness = Harness::new();
    let receipt = harness
        .orchestrator
        .create(harness.create_command())
        .await
        .expect("Failed to create consent");
    harness
        .orchestrator
        .revoke(RevokeConsent {
            consent_id: receipt.consent_id,
            reason: "first revocation".to_owned(),
            correlation_id: None,
        })
        .await
        .expect("Failed to revoke consent");

    // Act & Assert
    let err = harness
        .orchestrator
        .revoke(RevokeConsent {
            consent_id: receipt.consent_id,
            reason: "second revocation".to_owned(),
            correlation_id: None,
        })
        .await
        .expect_err("Second revocation must fail");
    assert!(matches!(
        err,
        CommandError::Consent(ConsentError::AlreadyRevoked)
    ));

    let err = harness
        .orchestrator
        .authorize(AuthorizeConsent {
            consent_id: receipt.consent_id,
            context: auth_context(),
            correlation_id: None,
        })
        .await
        .expect_err("Authorizing a revoked consent must fail");
    assert!(matches!(
        err,
        CommandError::Consent(ConsentError::InvalidStateTransition { .. })
    ));
}

#[tokio::test]
pub async fn usage_requires_an_authorized_unexpired_consent() {
    // Arrange
    let harness = Harness::new();
    let receipt = harness
        .orchestrator
        .create(harness.create_command())
        .await
        .expect("Failed to create consent");

    // Pending consents cannot be used.
    let err = harness
        .orchestrator
        .record_usage(RecordUsage {
            consent_id: receipt.consent_id,
            context: usage_context(),
            correlation_id: None,
        })
        .await
        .expect_err("Usage against a pending consent must fail");
    assert!(matches!(
        err,
        CommandError::Consent(ConsentError::ConsentNotActive { .. })
    ));

    harness
        .orchestrator
        .authorize(AuthorizeConsent {
            consent_id: receipt.consent_id,
            context: auth_context(),
            correlation_id: None,
        })
        .await
        .expect("Failed to authorize consent");

    // Each successful usage increments the counter by exactly 1.
    let first = harness
        .orchestrator
        .record_usage(RecordUsage {
            consent_id: receipt.consent_id,
            context: usage_context(),
            correlation_id: None,
        })
        .await
        .expect("Failed to record usage");
    assert_eq!(first.usage_count, 1);

    let second = harness
        .orchestrator
        .record_usage(RecordUsage {
            consent_id: receipt.consent_id,
            context: usage_context(),
            correlation_id: None,
        })
        .await
        .expect("Failed to record usage");
    assert_eq!(second.usage_count, 2);

    // Past the validity window the consent is no longer active.
    harness.clock.advance(chrono::Duration::days(31));
    let err = harness
        .orchestrator
        .record_usage(RecordUsage {
            consent_id: receipt.consent_id,
            context: usage_context(),
            correlation_id: None,
        })
        .await
        .expect_err("Usage against an expired consent must fail");
    assert!(matches!(
        err,
        CommandError::Consent(ConsentError::ConsentNotActive { .. })
    ));
}

#[tokio::test]
pub async fn rejected_input_leaves_no_trace() {
    // Arrange
    let harness = Harness::new();
    let mut command = harness.create_command();
    command.scopes.clear();

    // Act
    let err = harness
        .orchestrator
        .create(command)
        .await
        .expect_err("Empty scopes must be rejected");

    // Assert
    assert!(matches!(err, CommandError::Validation(_)));
    let consent_streams = harness
        .store
        .aggregate_ids("consent")
        .await
        .expect("Failed to list streams");
    assert!(consent_streams.is_empty());
    let participant_streams = harness
        .store
        .aggregate_ids("participant")
        .await
        .expect("Failed to list streams");
    assert!(participant_streams.is_empty());
}

#[tokio::test]
pub async fn replaying_the_stream_reproduces_the_exact_state() {
    // Arrange
    let harness = Harness::new();
    let repository = harness.consents();
    let saved = ConsentBuilder::new(harness.clock.now())
        .authorized()
        .with_usages(3)
        .save(&repository)
        .await;

    // Act: two independent replays of the same stream.
    let first = repository
        .load(saved.stream_id())
        .await
        .expect("Failed to load consent");
    let second = repository
        .load(saved.stream_id())
        .await
        .expect("Failed to load consent");

    // Assert: determinism, and version equals the number of applied events.
    assert_eq!(first.state(), second.state());
    assert_eq!(first.version(), second.version());
    assert_eq!(first.version(), 5);
    assert_eq!(first.state(), saved.state());
    assert_eq!(first.state().usage_count(), 3);
}

#[tokio::test]
pub async fn snapshots_only_change_replay_cost_never_state() {
    // Arrange: a snapshot policy that triggers on this stream length.
    let harness = Harness::new();
    let repository = harness
        .consents()
        .with_snapshot_policy(SnapshotPolicy {
            frequency: 2,
            max_events_without_snapshot: 10,
        });
    let saved = ConsentBuilder::new(harness.clock.now())
        .authorized()
        .with_usages(4)
        .save(&repository)
        .await;
    let stream_id = saved.stream_id();

    let snapshot = harness
        .store
        .snapshot(stream_id)
        .await
        .expect("Failed to read snapshot");
    assert!(snapshot.is_some(), "snapshot should have been written");

    // Act
    let from_snapshot = repository
        .load(stream_id)
        .await
        .expect("Failed to load consent from snapshot");

    harness.store.drop_snapshot(stream_id);
    let from_full_replay = repository
        .load(stream_id)
        .await
        .expect("Failed to load consent without snapshot");

    // Assert
    assert_eq!(from_snapshot.state(), from_full_replay.state());
    assert_eq!(from_snapshot.version(), from_full_replay.version());
    assert_eq!(from_full_replay.state(), saved.state());
}
