use std::future::Future;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use bitcoin::hashes::Hash;
use bitcoin::{Amount, Network, OutPoint, ScriptBuf, Txid, Witness};
use sha2::{Digest, Sha256};
use tempfile::TempDir;

use crate::blinding::BlindingRsaKey;
use crate::coinjoin::{Alice, Coordinator, Round};
use crate::config::CoordinatorSettings;
use crate::node::InMemoryNode;

/// Key generation is slow; every test shares one key
pub fn test_key() -> &'static BlindingRsaKey {
    static KEY: OnceLock<BlindingRsaKey> = OnceLock::new();
    KEY.get_or_init(|| BlindingRsaKey::generate(1024).unwrap())
}

/// Settings for a two-alice round under `dir`, with the shared key in place
pub fn settings(dir: &TempDir) -> CoordinatorSettings {
    let mut settings = CoordinatorSettings::new(Network::Regtest, dir.path());
    settings.round.anonymity_set = 2;
    settings.round.min_anonymity_set = 2;
    settings.max_unconfirmed = 2;
    settings.key_bits = 1024;
    std::fs::write(settings.key_path(), test_key().to_json().unwrap()).unwrap();
    settings
}

pub async fn start(settings: CoordinatorSettings, node: Arc<InMemoryNode>) -> Arc<Coordinator> {
    Coordinator::start(settings, node).await.unwrap()
}

pub fn outpoint(n: u8) -> OutPoint {
    OutPoint {
        txid: Txid::from_byte_array([n; 32]),
        vout: u32::from(n),
    }
}

pub fn script(n: u8) -> ScriptBuf {
    let mut bytes = vec![0x00, 0x14];
    bytes.extend_from_slice(&[n; 20]);
    ScriptBuf::from_bytes(bytes)
}

pub fn witness() -> Witness {
    Witness::from_slice(&[vec![0x30; 71], vec![0x02; 33]])
}

pub fn alice(n: u8) -> Alice {
    Alice::new(outpoint(n), Amount::from_sat(20_000_000), Some(script(200 - n)))
}

/// Output script digest, "blinded" with r = 1 so the blind signature is
/// also the unblinded one
pub fn blinded(script: &ScriptBuf) -> Vec<u8> {
    Sha256::digest(script.as_bytes()).to_vec()
}

/// Take the current input-registerable round through every phase with two
/// alices numbered `first` and `first + 1`.
pub async fn run_successful_round(coordinator: &Coordinator, first: u8) -> Arc<Round> {
    let ids = [first, first + 1];
    let mut registered = Vec::new();
    for n in ids {
        let (round_id, alice_id, signature) = coordinator
            .register_input(alice(n), &blinded(&script(n)))
            .await
            .unwrap();
        registered.push((round_id, alice_id, signature));
    }

    let round = coordinator.round(registered[0].0).await.unwrap();
    for (_, alice_id, _) in &registered {
        round.confirm_connection(*alice_id).unwrap();
    }
    for (n, (_, _, signature)) in ids.iter().zip(&registered) {
        coordinator
            .register_output(&round, script(*n), signature)
            .unwrap();
    }
    for n in ids {
        round.sign_input(&outpoint(n), witness()).unwrap();
    }
    round
}

/// Poll `condition` until it holds, panicking after a few seconds
pub async fn wait_until<F, Fut>(mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..500 {
        if condition().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}
