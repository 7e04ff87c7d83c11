//! Round registry
//!
//! Ordered list of every round the coordinator created, oldest first.
//! Terminal rounds stay listed for the `last_*` lookups. All creation,
//! lookup and bulk failure happens under one lock that is never held across
//! I/O.

use std::sync::Arc;

use bitcoin::OutPoint;
use thiserror::Error;
use tokio::sync::{Mutex, mpsc};
use tracing::info;

use super::alice::{Alice, AliceId};
use super::round::{Round, RoundConfig, RoundError, RoundEvent, RoundId, RoundPhase, RoundStatus};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    /// The coordinator keeps at least one round running at all times, so
    /// this means replenishment was skipped somewhere.
    #[error("no running round")]
    NoRunningRound,

    #[error("no running round in input registration")]
    NoInputRegisterableRound,

    #[error("input {0} is already registered in a running round")]
    InputAlreadyMixing(OutPoint),

    #[error(transparent)]
    Round(#[from] RoundError),
}

pub struct RoundRegistry {
    rounds: Mutex<Vec<Arc<Round>>>,
    events: mpsc::UnboundedSender<RoundEvent>,
}

impl RoundRegistry {
    /// New rounds report their terminal transition on `events`.
    pub fn new(events: mpsc::UnboundedSender<RoundEvent>) -> Self {
        Self {
            rounds: Mutex::new(Vec::new()),
            events,
        }
    }

    /// Top the registry up to two running rounds. Creates two when none are
    /// running, one when one is, and nothing otherwise. Returns how many
    /// rounds were created.
    pub async fn ensure_two_running_rounds(&self, config: Arc<RoundConfig>) -> usize {
        let mut rounds = self.rounds.lock().await;
        let running = rounds.iter().filter(|r| r.is_running()).count();
        let missing = 2usize.saturating_sub(running);

        for _ in 0..missing {
            let round = Arc::new(Round::new(config.clone(), self.events.clone()));
            info!(round_id = %round.id(), "Round created");
            rounds.push(round);
        }
        missing
    }

    pub async fn fail_all_running(&self) {
        let rounds = self.rounds.lock().await;
        for round in rounds.iter().filter(|r| r.is_running()) {
            round.fail();
        }
    }

    pub async fn fail_all_running_in_input_registration(&self) {
        let rounds = self.rounds.lock().await;
        for round in rounds
            .iter()
            .filter(|r| r.is_running() && r.phase() == RoundPhase::InputRegistration)
        {
            round.fail();
        }
    }

    /// Oldest running round
    pub async fn current_round(&self) -> Result<Arc<Round>, RegistryError> {
        let rounds = self.rounds.lock().await;
        rounds
            .iter()
            .find(|r| r.is_running())
            .cloned()
            .ok_or(RegistryError::NoRunningRound)
    }

    /// Oldest running round still accepting inputs
    pub async fn current_input_registerable_round(&self) -> Result<Arc<Round>, RegistryError> {
        let rounds = self.rounds.lock().await;
        rounds
            .iter()
            .find(|r| r.is_running() && r.phase() == RoundPhase::InputRegistration)
            .cloned()
            .ok_or(RegistryError::NoInputRegisterableRound)
    }

    /// Newest running round
    pub async fn next_round(&self) -> Option<Arc<Round>> {
        self.last_where(|r| r.is_running()).await
    }

    pub async fn last_successful(&self) -> Option<Arc<Round>> {
        self.last_where(|r| r.status() == RoundStatus::Succeeded).await
    }

    pub async fn last_failed(&self) -> Option<Arc<Round>> {
        self.last_where(|r| r.status() == RoundStatus::Failed).await
    }

    /// Newest round that has finished, either way
    pub async fn last_terminal(&self) -> Option<Arc<Round>> {
        self.last_where(|r| r.status().is_terminal()).await
    }

    async fn last_where(&self, predicate: impl Fn(&Round) -> bool) -> Option<Arc<Round>> {
        let rounds = self.rounds.lock().await;
        rounds.iter().rev().find(|r| predicate(r)).cloned()
    }

    /// Every alice in any running round that registered `input`, in round
    /// order. Empty means the input is free.
    pub async fn any_running_contains_input(&self, input: &OutPoint) -> Vec<Alice> {
        let rounds = self.rounds.lock().await;
        rounds
            .iter()
            .filter(|r| r.is_running())
            .flat_map(|r| r.contains_input(input))
            .collect()
    }

    /// Register `alice` in the oldest round still accepting inputs, unless
    /// her input is already in a running round. The check and the
    /// registration happen under the same lock.
    pub async fn register_input(
        &self,
        alice: Alice,
    ) -> Result<(Arc<Round>, AliceId), RegistryError> {
        let rounds = self.rounds.lock().await;
        let input = alice.input;
        if rounds
            .iter()
            .filter(|r| r.is_running())
            .any(|r| !r.contains_input(&input).is_empty())
        {
            return Err(RegistryError::InputAlreadyMixing(input));
        }

        let round = rounds
            .iter()
            .find(|r| r.is_running() && r.phase() == RoundPhase::InputRegistration)
            .cloned()
            .ok_or(RegistryError::NoInputRegisterableRound)?;
        let alice_id = round.register_alice(alice)?;
        Ok((round, alice_id))
    }

    pub async fn get(&self, id: RoundId) -> Option<Arc<Round>> {
        let rounds = self.rounds.lock().await;
        rounds.iter().find(|r| r.id() == id).cloned()
    }

    pub async fn running_rounds(&self) -> Vec<Arc<Round>> {
        let rounds = self.rounds.lock().await;
        rounds.iter().filter(|r| r.is_running()).cloned().collect()
    }

    pub async fn running_count(&self) -> usize {
        let rounds = self.rounds.lock().await;
        rounds.iter().filter(|r| r.is_running()).count()
    }

    pub async fn len(&self) -> usize {
        self.rounds.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.rounds.lock().await.is_empty()
    }

    /// Stop every round from reporting. Used on shutdown; rounds keep their
    /// status.
    pub async fn detach_all(&self) {
        let rounds = self.rounds.lock().await;
        for round in rounds.iter() {
            round.detach();
        }
    }
}
