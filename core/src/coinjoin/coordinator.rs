//! Coordinator
//!
//! Owns the round registry, the coinjoin ledger and the blinding key, and
//! keeps at least two rounds running.
//!
//! ```text
//!   Round ──RoundEvent──▶ event loop ──▶ CoinJoinLedger::record_success
//!     ▲                       │
//!     │                       └──────▶ RoundRegistry::ensure_two_running_rounds
//!     │
//!   RoundRegistry (lock A)          CoinJoinLedger (lock B, held across node I/O)
//! ```
//!
//! The two locks are never held together. A round event always writes the
//! ledger before replenishing the registry.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};

use bitcoin::{Network, OutPoint, ScriptBuf, Txid};
use thiserror::Error;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::alice::{Alice, AliceId};
use super::ledger::{CoinJoinLedger, LedgerError};
use super::registry::{RegistryError, RoundRegistry};
use super::round::{Round, RoundConfig, RoundError, RoundEvent, RoundId, RoundOutcome};
use crate::blinding::{BlindingKeyError, BlindingRsaKey};
use crate::config::CoordinatorSettings;
use crate::node::BlockchainNode;

#[derive(Error, Debug)]
pub enum CoordinatorError {
    #[error("failed to create data directory {}: {source}", .path.display())]
    DataDir { path: PathBuf, source: io::Error },

    #[error("blinding key: {0}")]
    BlindingKey(#[from] BlindingKeyError),

    #[error("blinding key task failed: {0}")]
    KeyTask(String),

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Round(#[from] RoundError),

    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error("input {0} is already registered in a running round")]
    InputAlreadyMixing(OutPoint),

    #[error("output signature does not verify")]
    InvalidOutputSignature,
}

/// Round policy shared between the coordinator and its event loop
type SharedRoundConfig = Arc<RwLock<Arc<RoundConfig>>>;

fn read_config(config: &SharedRoundConfig) -> Arc<RoundConfig> {
    config
        .read()
        .unwrap_or_else(PoisonError::into_inner)
        .clone()
}

pub struct Coordinator {
    network: Network,
    data_dir: PathBuf,
    max_unconfirmed: usize,
    blinding_key: Arc<BlindingRsaKey>,
    round_config: SharedRoundConfig,
    registry: Arc<RoundRegistry>,
    ledger: Arc<CoinJoinLedger>,
    shutdown: CancellationToken,
    event_loop: Mutex<Option<JoinHandle<()>>>,
}

impl Coordinator {
    /// Create the data directory, load or create the blinding key, reconcile
    /// the ledger against `node` and start listening for round events.
    ///
    /// No round exists yet; call [`Coordinator::ensure_two_running_rounds`].
    pub async fn start(
        settings: CoordinatorSettings,
        node: Arc<dyn BlockchainNode>,
    ) -> Result<Arc<Self>, CoordinatorError> {
        tokio::fs::create_dir_all(&settings.data_dir)
            .await
            .map_err(|source| CoordinatorError::DataDir {
                path: settings.data_dir.clone(),
                source,
            })?;

        let key_path = settings.key_path();
        let key_bits = settings.key_bits;
        let blinding_key =
            tokio::task::spawn_blocking(move || BlindingRsaKey::load_or_create(&key_path, key_bits))
                .await
                .map_err(|e| CoordinatorError::KeyTask(e.to_string()))??;

        let ledger = Arc::new(CoinJoinLedger::load(settings.ledger_path(), node).await);

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let registry = Arc::new(RoundRegistry::new(events_tx));
        let round_config: SharedRoundConfig = Arc::new(RwLock::new(Arc::new(settings.round)));
        let shutdown = CancellationToken::new();

        let handle = tokio::spawn(run_event_loop(
            events_rx,
            registry.clone(),
            ledger.clone(),
            round_config.clone(),
            shutdown.clone(),
        ));

        info!(
            network = %settings.network,
            data_dir = %settings.data_dir.display(),
            "Coordinator started"
        );

        Ok(Arc::new(Self {
            network: settings.network,
            data_dir: settings.data_dir,
            max_unconfirmed: settings.max_unconfirmed,
            blinding_key: Arc::new(blinding_key),
            round_config,
            registry,
            ledger,
            shutdown,
            event_loop: Mutex::new(Some(handle)),
        }))
    }

    pub fn network(&self) -> Network {
        self.network
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn blinding_key(&self) -> &BlindingRsaKey {
        &self.blinding_key
    }

    pub fn registry(&self) -> &RoundRegistry {
        &self.registry
    }

    pub fn ledger(&self) -> &CoinJoinLedger {
        &self.ledger
    }

    pub fn round_config(&self) -> Arc<RoundConfig> {
        read_config(&self.round_config)
    }

    /// Replace the policy for rounds created from now on. Existing rounds
    /// keep theirs.
    pub fn update_round_config(&self, config: RoundConfig) {
        *self
            .round_config
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Arc::new(config);
        info!("Round config updated");
    }

    pub async fn ensure_two_running_rounds(&self) -> usize {
        self.registry
            .ensure_two_running_rounds(self.round_config())
            .await
    }

    pub async fn fail_all_running_rounds(&self) {
        self.registry.fail_all_running().await;
    }

    pub async fn fail_all_rounds_in_input_registration(&self) {
        self.registry.fail_all_running_in_input_registration().await;
    }

    pub async fn current_round(&self) -> Result<Arc<Round>, CoordinatorError> {
        Ok(self.registry.current_round().await?)
    }

    pub async fn current_input_registerable_round(&self) -> Result<Arc<Round>, CoordinatorError> {
        Ok(self.registry.current_input_registerable_round().await?)
    }

    pub async fn next_round(&self) -> Option<Arc<Round>> {
        self.registry.next_round().await
    }

    pub async fn round(&self, id: RoundId) -> Option<Arc<Round>> {
        self.registry.get(id).await
    }

    pub async fn last_successful_round(&self) -> Option<Arc<Round>> {
        self.registry.last_successful().await
    }

    pub async fn last_failed_round(&self) -> Option<Arc<Round>> {
        self.registry.last_failed().await
    }

    /// Newest round that has finished, successfully or not
    pub async fn last_round(&self) -> Option<Arc<Round>> {
        self.registry.last_terminal().await
    }

    pub async fn any_running_round_contains_input(&self, input: &OutPoint) -> Vec<Alice> {
        self.registry.any_running_contains_input(input).await
    }

    pub async fn contains_coinjoin(&self, txid: &Txid) -> bool {
        self.ledger.contains(txid).await
    }

    /// May query the node for every unconfirmed coinjoin
    pub async fn is_unconfirmed_coinjoin_limit_reached(&self) -> bool {
        self.ledger
            .enforce_unconfirmed_limit(self.max_unconfirmed)
            .await
    }

    /// Register `alice` in the current input-registerable round and sign her
    /// blinded output script. Nothing is signed for a rejected input.
    pub async fn register_input(
        &self,
        alice: Alice,
        blinded_output: &[u8],
    ) -> Result<(RoundId, AliceId, Vec<u8>), CoordinatorError> {
        self.blinding_key.check_blinded(blinded_output)?;

        let (round, alice_id) =
            self.registry
                .register_input(alice)
                .await
                .map_err(|e| match e {
                    RegistryError::InputAlreadyMixing(input) => {
                        CoordinatorError::InputAlreadyMixing(input)
                    }
                    RegistryError::Round(e) => CoordinatorError::Round(e),
                    e => CoordinatorError::Registry(e),
                })?;

        match self.blinding_key.sign_blinded(blinded_output) {
            Ok(signature) => Ok((round.id(), alice_id, signature)),
            Err(e) => {
                if let Err(remove) = round.remove_alice(alice_id) {
                    warn!(round_id = %round.id(), %alice_id, error = %remove, "Could not withdraw unsigned alice");
                }
                Err(e.into())
            }
        }
    }

    /// Register an output after checking its unblinded signature
    pub fn register_output(
        &self,
        round: &Round,
        script: ScriptBuf,
        signature: &[u8],
    ) -> Result<(), CoordinatorError> {
        if !self
            .blinding_key
            .verify_output(script.as_bytes(), signature)
        {
            return Err(CoordinatorError::InvalidOutputSignature);
        }
        Ok(round.register_output(script)?)
    }

    /// Stop handling round events and detach every round. Rounds keep their
    /// status; nothing is failed.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        self.registry.detach_all().await;

        if let Some(handle) = self.event_loop.lock().await.take() {
            if let Err(e) = handle.await {
                warn!(error = %e, "Round event loop ended abnormally");
            }
        }
        info!("Coordinator shut down");
    }
}

impl Drop for Coordinator {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn run_event_loop(
    mut events: mpsc::UnboundedReceiver<RoundEvent>,
    registry: Arc<RoundRegistry>,
    ledger: Arc<CoinJoinLedger>,
    round_config: SharedRoundConfig,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                debug!("Round event loop stopping");
                break;
            }
            event = events.recv() => {
                let Some(event) = event else { break };
                handle_round_event(event, &registry, &ledger, &round_config).await;
            }
        }
    }
}

async fn handle_round_event(
    event: RoundEvent,
    registry: &RoundRegistry,
    ledger: &CoinJoinLedger,
    round_config: &SharedRoundConfig,
) {
    match event.outcome {
        RoundOutcome::Succeeded { coinjoin } => {
            let txid = coinjoin.compute_txid();
            info!(round_id = %event.round_id, %txid, "Round succeeded");
            if let Err(e) = ledger.record_success(txid).await {
                error!(round_id = %event.round_id, %txid, error = %e, "Failed to record coinjoin");
            }
        }
        RoundOutcome::Failed => {
            info!(round_id = %event.round_id, "Round failed");
        }
    }

    let created = registry
        .ensure_two_running_rounds(read_config(round_config))
        .await;
    if created > 0 {
        debug!(created, "Replenished running rounds");
    }
}
