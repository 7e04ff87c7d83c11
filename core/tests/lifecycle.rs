//! End-to-end round lifecycle through the public API

use std::sync::Arc;
use std::time::Duration;

use bitcoin::hashes::Hash;
use bitcoin::{Amount, Network, OutPoint, ScriptBuf, Txid, Witness};
use coinjoin_coordinator::{
    Alice, BlindingRsaKey, Coordinator, CoordinatorSettings, InMemoryNode, RoundPhase, RoundStatus,
};
use sha2::{Digest, Sha256};

fn outpoint(n: u8) -> OutPoint {
    OutPoint {
        txid: Txid::from_byte_array([n; 32]),
        vout: 0,
    }
}

fn script(n: u8) -> ScriptBuf {
    let mut bytes = vec![0x00, 0x14];
    bytes.extend_from_slice(&[n; 20]);
    ScriptBuf::from_bytes(bytes)
}

async fn eventually<F, Fut>(mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..500 {
        if condition().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}

#[tokio::test]
async fn full_round_produces_recorded_coinjoin() {
    let dir = tempfile::tempdir().unwrap();
    let mut settings = CoordinatorSettings::new(Network::Regtest, dir.path());
    settings.round.anonymity_set = 3;
    settings.round.min_anonymity_set = 2;
    settings.key_bits = 1024;
    std::fs::write(
        settings.key_path(),
        BlindingRsaKey::generate(1024).unwrap().to_json().unwrap(),
    )
    .unwrap();

    let node = Arc::new(InMemoryNode::new());
    let coordinator = Coordinator::start(settings, node.clone()).await.unwrap();
    assert_eq!(coordinator.ensure_two_running_rounds().await, 2);

    // Input registration
    let mut alices = Vec::new();
    for n in 1..=3u8 {
        let digest = Sha256::digest(script(n).as_bytes());
        let alice = Alice::new(outpoint(n), Amount::from_sat(15_000_000), Some(script(100 + n)));
        let (round_id, alice_id, signature) = coordinator
            .register_input(alice, digest.as_slice())
            .await
            .unwrap();
        alices.push((round_id, alice_id, signature));
    }
    let round = coordinator.round(alices[0].0).await.unwrap();
    assert!(alices.iter().all(|(id, _, _)| *id == round.id()));
    assert_eq!(round.phase(), RoundPhase::ConnectionConfirmation);

    // The full round no longer takes inputs; the other one does
    let registerable = coordinator.current_input_registerable_round().await.unwrap();
    assert_ne!(registerable.id(), round.id());

    // Connection confirmation
    for (_, alice_id, _) in &alices {
        round.confirm_connection(*alice_id).unwrap();
    }
    assert_eq!(round.phase(), RoundPhase::OutputRegistration);

    // Output registration
    for (n, (_, _, signature)) in (1..=3u8).zip(&alices) {
        coordinator
            .register_output(&round, script(n), signature)
            .unwrap();
    }
    assert_eq!(round.phase(), RoundPhase::Signing);

    let unsigned = round.unsigned_coinjoin().unwrap();
    assert_eq!(unsigned.input.len(), 3);
    // Three mixed outputs and three change outputs
    assert_eq!(unsigned.output.len(), 6);

    // Signing
    for n in 1..=3u8 {
        round
            .sign_input(
                &outpoint(n),
                Witness::from_slice(&[vec![0x30; 71], vec![0x02; 33]]),
            )
            .unwrap();
    }
    assert_eq!(round.status(), RoundStatus::Succeeded);
    let txid = round.coinjoin_txid().unwrap();
    assert_eq!(txid, unsigned.compute_txid());

    // Recorded and replaced
    eventually(|| async { coordinator.contains_coinjoin(&txid).await }).await;
    eventually(|| async { coordinator.registry().running_count().await == 2 }).await;
    assert!(coordinator.any_running_round_contains_input(&outpoint(1)).await.is_empty());

    coordinator.shutdown().await;
}
