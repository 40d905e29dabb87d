mod common;

use common::helpers::{usage_context, ConsentBuilder, Harness};

use consentric::clock::Clock;
use consentric::consent::ConsentStatus;
use consentric::saga::RecordUsage;
use consentric::store::{EventStore, StoreError};

#[tokio::test]
pub async fn two_appends_with_the_same_expected_version_admit_exactly_one() {
    // Arrange: an authorized consent at version 2, loaded by two writers.
    let harness = Harness::new();
    let repository = harness.consents();
    let saved = ConsentBuilder::new(harness.clock.now())
        .authorized()
        .save(&repository)
        .await;
    let stream_id = saved.stream_id();
    let now = harness.clock.now();
    let metadata = consentric::event::EventMetadata::root(uuid::Uuid::new_v4());

    let mut first_writer = repository
        .load(stream_id)
        .await
        .expect("Failed to load consent");
    let mut second_writer = repository
        .load(stream_id)
        .await
        .expect("Failed to load consent");
    assert_eq!(first_writer.version(), 2);
    assert_eq!(second_writer.version(), 2);

    let event = first_writer
        .state()
        .revoke("customer request", now)
        .expect("Failed to build revocation");
    first_writer
        .record_that(event, now, metadata)
        .expect("Failed to record revocation");

    let event = second_writer
        .state()
        .revoke("fraud review", now)
        .expect("Failed to build revocation");
    second_writer
        .record_that(event, now, metadata)
        .expect("Failed to record revocation");

    // Act: both writers race the store at expected version 2.
    let first_result = repository.save(&mut first_writer).await;
    let second_result = repository.save(&mut second_writer).await;

    // Assert: exactly one reaches version 3, the other loses the race.
    assert!(first_result.is_ok());
    let err = second_result.expect_err("Second writer must lose the race");
    assert!(err.is_version_conflict());

    let reloaded = repository
        .load(stream_id)
        .await
        .expect("Failed to reload consent");
    assert_eq!(reloaded.version(), 3);
    assert_eq!(reloaded.state().status(), ConsentStatus::Revoked);
    assert_eq!(reloaded.state().revocation_reason(), Some("customer request"));
}

#[tokio::test]
pub async fn store_level_race_is_decided_by_the_version_check() {
    // Arrange
    let harness = Harness::new();
    let repository = harness.consents();
    let saved = ConsentBuilder::new(harness.clock.now())
        .save(&repository)
        .await;
    let stream_id = saved.stream_id();

    let stored = harness
        .store
        .load(stream_id, 1)
        .await
        .expect("Failed to load raw events");
    let template = stored.first().expect("Stream should have events").clone();

    // Act: two concurrent appends claim the same expected version.
    let (left, right) = tokio::join!(
        harness.store.append(stream_id, vec![template.clone()], 1),
        harness.store.append(stream_id, vec![template.clone()], 1),
    );

    // Assert
    let successes = [&left, &right].iter().filter(|r| r.is_ok()).count();
    assert_eq!(successes, 1, "exactly one append may win");

    let conflict = if left.is_err() { left } else { right };
    assert!(matches!(
        conflict,
        Err(StoreError::VersionConflict {
            expected: 1,
            actual: 2,
            ..
        })
    ));
}

#[tokio::test]
pub async fn simultaneous_usage_commands_are_admitted_one_at_a_time() {
    // Arrange
    let harness = Harness::new();
    let receipt = harness
        .orchestrator
        .create(harness.create_command())
        .await
        .expect("Failed to create consent");
    harness
        .orchestrator
        .authorize(consentric::saga::AuthorizeConsent {
            consent_id: receipt.consent_id,
            context: common::helpers::auth_context(),
            correlation_id: None,
        })
        .await
        .expect("Failed to authorize consent");

    // Act: ten usage submissions arrive at once.
    let mut tasks = tokio::task::JoinSet::new();
    for _ in 0..10 {
        let orchestrator = harness.orchestrator.clone();
        let consent_id = receipt.consent_id;
        tasks.spawn(async move {
            orchestrator
                .record_usage(RecordUsage {
                    consent_id,
                    context: usage_context(),
                    correlation_id: None,
                })
                .await
        });
    }

    let mut successes = 0;
    while let Some(result) = tasks.join_next().await {
        let outcome = result.expect("Usage task panicked");
        outcome.expect("Usage under the command lock must not conflict");
        successes += 1;
    }

    // Assert: every submission was admitted, each incrementing by exactly 1.
    assert_eq!(successes, 10);
    let loaded = harness
        .consents()
        .load(receipt.consent_id.as_uuid())
        .await
        .expect("Failed to load consent");
    assert_eq!(loaded.state().usage_count(), 10);
    assert_eq!(loaded.version(), 12);
}

#[tokio::test]
pub async fn commands_for_different_aggregates_proceed_in_parallel() {
    // Arrange
    let harness = Harness::new();

    // Act
    let (first, second) = tokio::join!(
        harness.orchestrator.create(harness.create_command()),
        harness.orchestrator.create(harness.create_command()),
    );

    // Assert
    let first = first.expect("Failed to create first consent");
    let second = second.expect("Failed to create second consent");
    assert_ne!(first.consent_id, second.consent_id);
    assert_eq!(first.version, 1);
    assert_eq!(second.version, 1);
}
