use std::sync::Arc;

use bitcoin::Txid;

use super::helpers::*;
use crate::blinding::BlindingKeyError;
use crate::coinjoin::{CoordinatorError, RoundConfig, RoundPhase, RoundStatus};
use crate::node::InMemoryNode;

#[tokio::test]
async fn test_start_loads_existing_key() {
    let dir = tempfile::tempdir().unwrap();
    let coordinator = start(settings(&dir), Arc::new(InMemoryNode::new())).await;

    assert_eq!(
        coordinator.blinding_key().public_key(),
        test_key().public_key()
    );
    assert!(coordinator.registry().is_empty().await);
}

#[tokio::test]
async fn test_ensure_two_running_rounds() {
    let dir = tempfile::tempdir().unwrap();
    let coordinator = start(settings(&dir), Arc::new(InMemoryNode::new())).await;

    assert_eq!(coordinator.ensure_two_running_rounds().await, 2);
    assert_eq!(coordinator.ensure_two_running_rounds().await, 0);

    let current = coordinator.current_round().await.unwrap();
    let next = coordinator.next_round().await.unwrap();
    assert_ne!(current.id(), next.id());
    assert!(coordinator.last_round().await.is_none());
}

#[tokio::test]
async fn test_current_round_before_any_round_exists() {
    let dir = tempfile::tempdir().unwrap();
    let coordinator = start(settings(&dir), Arc::new(InMemoryNode::new())).await;

    assert!(matches!(
        coordinator.current_round().await,
        Err(CoordinatorError::Registry(_))
    ));
}

#[tokio::test]
async fn test_successful_round_is_recorded_and_replaced() {
    let dir = tempfile::tempdir().unwrap();
    let coordinator = start(settings(&dir), Arc::new(InMemoryNode::new())).await;
    coordinator.ensure_two_running_rounds().await;

    let round = run_successful_round(&coordinator, 1).await;
    assert_eq!(round.status(), RoundStatus::Succeeded);
    let txid = round.coinjoin_txid().unwrap();

    wait_until(|| async { coordinator.contains_coinjoin(&txid).await }).await;
    wait_until(|| async { coordinator.registry().running_count().await == 2 }).await;

    assert_eq!(
        coordinator.last_successful_round().await.unwrap().id(),
        round.id()
    );
    assert_eq!(coordinator.last_round().await.unwrap().id(), round.id());

    let file = std::fs::read_to_string(coordinator.ledger().path()).unwrap();
    assert_eq!(file, format!("{txid}\n"));
}

#[tokio::test]
async fn test_failed_round_is_replaced_without_ledger_entry() {
    let dir = tempfile::tempdir().unwrap();
    let coordinator = start(settings(&dir), Arc::new(InMemoryNode::new())).await;
    coordinator.ensure_two_running_rounds().await;

    let round = coordinator.current_round().await.unwrap();
    round.fail();

    wait_until(|| async { coordinator.registry().running_count().await == 2 }).await;
    assert_eq!(coordinator.registry().len().await, 3);
    assert_eq!(coordinator.last_failed_round().await.unwrap().id(), round.id());
    assert!(coordinator.ledger().snapshot().await.all.is_empty());
}

#[tokio::test]
async fn test_fail_all_rounds_in_input_registration() {
    let dir = tempfile::tempdir().unwrap();
    let coordinator = start(settings(&dir), Arc::new(InMemoryNode::new())).await;
    coordinator.ensure_two_running_rounds().await;

    let busy = coordinator.current_round().await.unwrap();
    busy.register_alice(alice(1)).unwrap();
    busy.register_alice(alice(2)).unwrap();
    assert_eq!(busy.phase(), RoundPhase::ConnectionConfirmation);

    coordinator.fail_all_rounds_in_input_registration().await;

    assert_eq!(busy.status(), RoundStatus::Running);
    // One survivor, so a single replacement tops it back up to two
    wait_until(|| async { coordinator.registry().running_count().await == 2 }).await;
    let registerable = coordinator.current_input_registerable_round().await.unwrap();
    assert_eq!(registerable.phase(), RoundPhase::InputRegistration);
}

#[tokio::test]
async fn test_fail_all_running_rounds_replenishes() {
    let dir = tempfile::tempdir().unwrap();
    let coordinator = start(settings(&dir), Arc::new(InMemoryNode::new())).await;
    coordinator.ensure_two_running_rounds().await;

    coordinator.fail_all_running_rounds().await;

    wait_until(|| async { coordinator.registry().running_count().await == 2 }).await;
    assert_eq!(coordinator.registry().len().await, 4);
}

#[tokio::test]
async fn test_input_cannot_join_twice() {
    let dir = tempfile::tempdir().unwrap();
    let coordinator = start(settings(&dir), Arc::new(InMemoryNode::new())).await;
    coordinator.ensure_two_running_rounds().await;

    coordinator
        .register_input(alice(1), &blinded(&script(1)))
        .await
        .unwrap();
    let err = coordinator
        .register_input(alice(1), &blinded(&script(1)))
        .await
        .unwrap_err();
    assert!(matches!(err, CoordinatorError::InputAlreadyMixing(input) if input == outpoint(1)));

    let found = coordinator.any_running_round_contains_input(&outpoint(1)).await;
    assert_eq!(found.len(), 1);
}

#[tokio::test]
async fn test_unsignable_blinded_output_registers_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let coordinator = start(settings(&dir), Arc::new(InMemoryNode::new())).await;
    coordinator.ensure_two_running_rounds().await;

    let err = coordinator
        .register_input(alice(1), &[0xff; 256])
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        CoordinatorError::BlindingKey(BlindingKeyError::MessageOutOfRange)
    ));
    assert!(
        coordinator
            .any_running_round_contains_input(&outpoint(1))
            .await
            .is_empty()
    );

    coordinator
        .register_input(alice(1), &blinded(&script(1)))
        .await
        .unwrap();
}

#[tokio::test]
async fn test_output_with_bad_signature_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let coordinator = start(settings(&dir), Arc::new(InMemoryNode::new())).await;
    coordinator.ensure_two_running_rounds().await;

    let (round_id, a, sig) = coordinator
        .register_input(alice(1), &blinded(&script(1)))
        .await
        .unwrap();
    let (_, b, _) = coordinator
        .register_input(alice(2), &blinded(&script(2)))
        .await
        .unwrap();
    let round = coordinator.round(round_id).await.unwrap();
    round.confirm_connection(a).unwrap();
    round.confirm_connection(b).unwrap();

    // Signature for script 1 presented with script 2
    let err = coordinator
        .register_output(&round, script(2), &sig)
        .unwrap_err();
    assert!(matches!(err, CoordinatorError::InvalidOutputSignature));
    assert_eq!(round.output_count(), 0);
}

#[tokio::test]
async fn test_unconfirmed_limit() {
    let dir = tempfile::tempdir().unwrap();
    let node = Arc::new(InMemoryNode::new());
    let coordinator = start(settings(&dir), node.clone()).await;
    coordinator.ensure_two_running_rounds().await;

    let mut txids: Vec<Txid> = Vec::new();
    for first in [1, 3] {
        let round = run_successful_round(&coordinator, first).await;
        let txid = round.coinjoin_txid().unwrap();
        node.set_confirmations(txid, 0);
        wait_until(|| async { coordinator.contains_coinjoin(&txid).await }).await;
        wait_until(|| async { coordinator.registry().running_count().await == 2 }).await;
        txids.push(txid);
    }

    assert!(coordinator.is_unconfirmed_coinjoin_limit_reached().await);

    node.set_confirmations(txids[0], 1);
    assert!(!coordinator.is_unconfirmed_coinjoin_limit_reached().await);
    assert!(coordinator.contains_coinjoin(&txids[0]).await);

    node.reset_query_count();
    assert!(!coordinator.is_unconfirmed_coinjoin_limit_reached().await);
    assert_eq!(node.query_count(), 0);
}

#[tokio::test]
async fn test_ledger_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let node = Arc::new(InMemoryNode::new());

    let txid = {
        let coordinator = start(settings(&dir), node.clone()).await;
        coordinator.ensure_two_running_rounds().await;
        let round = run_successful_round(&coordinator, 1).await;
        let txid = round.coinjoin_txid().unwrap();
        wait_until(|| async { coordinator.contains_coinjoin(&txid).await }).await;
        coordinator.shutdown().await;
        txid
    };

    node.set_confirmations(txid, 3);
    let coordinator = start(settings(&dir), node).await;
    assert!(coordinator.contains_coinjoin(&txid).await);
    assert_eq!(coordinator.ledger().unconfirmed_count().await, 0);
}

#[tokio::test]
async fn test_round_config_update_applies_to_new_rounds_only() {
    let dir = tempfile::tempdir().unwrap();
    let coordinator = start(settings(&dir), Arc::new(InMemoryNode::new())).await;
    coordinator.ensure_two_running_rounds().await;
    let old = coordinator.current_round().await.unwrap();

    coordinator.update_round_config(RoundConfig {
        anonymity_set: 5,
        ..RoundConfig::default()
    });
    old.fail();

    wait_until(|| async { coordinator.registry().running_count().await == 2 }).await;
    let newest = coordinator.next_round().await.unwrap();
    assert_eq!(newest.config().anonymity_set, 5);
    assert_eq!(coordinator.current_round().await.unwrap().config().anonymity_set, 2);
}

#[tokio::test]
async fn test_shutdown_detaches_without_failing() {
    let dir = tempfile::tempdir().unwrap();
    let coordinator = start(settings(&dir), Arc::new(InMemoryNode::new())).await;
    coordinator.ensure_two_running_rounds().await;
    let rounds = coordinator.registry().running_rounds().await;

    coordinator.shutdown().await;
    assert!(rounds.iter().all(|r| r.status() == RoundStatus::Running));

    rounds[0].fail();
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    assert_eq!(coordinator.registry().len().await, 2);
}
