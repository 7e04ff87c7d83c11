//! Behavior under concurrent callers

use std::sync::Arc;
use std::time::Duration;

use super::helpers::*;
use crate::coinjoin::{CoordinatorError, RoundPhase, RoundStatus};
use crate::node::InMemoryNode;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_failures_report_once() {
    let dir = tempfile::tempdir().unwrap();
    let coordinator = start(settings(&dir), Arc::new(InMemoryNode::new())).await;
    coordinator.ensure_two_running_rounds().await;
    let round = coordinator.current_round().await.unwrap();

    let mut handles = Vec::new();
    for _ in 0..16 {
        let round = round.clone();
        handles.push(tokio::spawn(async move { round.fail() }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    wait_until(|| async { coordinator.registry().running_count().await == 2 }).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    // One failure, one replacement
    assert_eq!(coordinator.registry().len().await, 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_registration_of_one_input() {
    let dir = tempfile::tempdir().unwrap();
    let mut settings = settings(&dir);
    settings.round.anonymity_set = 50;
    let coordinator = start(settings, Arc::new(InMemoryNode::new())).await;
    coordinator.ensure_two_running_rounds().await;

    let mut handles = Vec::new();
    for _ in 0..8 {
        let coordinator = coordinator.clone();
        handles.push(tokio::spawn(async move {
            coordinator
                .register_input(alice(1), &blinded(&script(1)))
                .await
        }));
    }

    let mut accepted = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => accepted += 1,
            Err(CoordinatorError::InputAlreadyMixing(_)) => {}
            Err(e) => panic!("unexpected error: {e}"),
        }
    }

    assert_eq!(accepted, 1);
    assert_eq!(
        coordinator
            .any_running_round_contains_input(&outpoint(1))
            .await
            .len(),
        1
    );
}

/// A one-alice round closes on its first registration while the next round
/// is still open, so a late duplicate must not land in the next round.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_registration_across_rounds() {
    let dir = tempfile::tempdir().unwrap();
    let mut settings = settings(&dir);
    settings.round.anonymity_set = 1;
    settings.round.min_anonymity_set = 1;
    let coordinator = start(settings, Arc::new(InMemoryNode::new())).await;
    coordinator.ensure_two_running_rounds().await;

    let mut handles = Vec::new();
    for _ in 0..8 {
        let coordinator = coordinator.clone();
        handles.push(tokio::spawn(async move {
            coordinator
                .register_input(alice(1), &blinded(&script(1)))
                .await
        }));
    }

    let mut accepted = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(_) => accepted += 1,
            Err(CoordinatorError::InputAlreadyMixing(_)) => {}
            Err(e) => panic!("unexpected error: {e}"),
        }
    }

    assert_eq!(accepted, 1);
    let running = coordinator.registry().running_rounds().await;
    assert_eq!(running[0].phase(), RoundPhase::ConnectionConfirmation);
    assert_eq!(running[1].phase(), RoundPhase::InputRegistration);
    assert_eq!(running[1].alice_count(), 0);
    assert_eq!(
        coordinator
            .any_running_round_contains_input(&outpoint(1))
            .await
            .len(),
        1
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_distinct_registrations() {
    let dir = tempfile::tempdir().unwrap();
    let mut settings = settings(&dir);
    settings.round.anonymity_set = 50;
    let coordinator = start(settings, Arc::new(InMemoryNode::new())).await;
    coordinator.ensure_two_running_rounds().await;

    let mut handles = Vec::new();
    for n in 1..=20u8 {
        let coordinator = coordinator.clone();
        handles.push(tokio::spawn(async move {
            coordinator.register_input(alice(n), &blinded(&script(n))).await
        }));
    }
    for handle in handles {
        handle.await.unwrap().unwrap();
    }

    let round = coordinator.current_round().await.unwrap();
    assert_eq!(round.alice_count(), 20);
    assert_eq!(round.status(), RoundStatus::Running);
}
