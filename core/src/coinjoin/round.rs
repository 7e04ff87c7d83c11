//! Round
//!
//! One Chaumian CoinJoin mixing session.
//!
//! ```text
//!  InputRegistration ──▶ ConnectionConfirmation ──▶ OutputRegistration ──▶ Signing
//!         │                       │                        │                 │
//!         └───────────────────────┴──── fail() ────────────┴─────────────────┤
//!                                                                            ▼
//!                                        Failed ◀── (any phase)        Succeeded
//! ```
//!
//! Phase only moves forward and only while the round is `Running`. Both
//! terminal statuses are final: the round keeps its data for audit but
//! rejects every further operation.
//!
//! Terminal transitions are reported to the coordinator as a [`RoundEvent`]
//! on the channel handed in at construction. The sender is taken out of the
//! round when the event is sent, so a round can never report twice.

use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use bitcoin::absolute::LockTime;
use bitcoin::transaction::Version;
use bitcoin::{Amount, OutPoint, ScriptBuf, Sequence, Transaction, TxIn, TxOut, Txid, Witness};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::alice::{Alice, AliceId};

// ============================================================================
// Configuration
// ============================================================================

/// Policy a round is created with. Later policy updates never reach rounds
/// that already exist.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoundConfig {
    /// Value of every mixed output
    pub denomination: Amount,
    /// Alices needed before input registration closes on its own
    pub anonymity_set: usize,
    /// Alices needed for a timed out input registration to proceed anyway
    pub min_anonymity_set: usize,
    pub fee_per_input: Amount,
    pub fee_per_output: Amount,
    /// Change at or below this value is left to the miners
    pub dust_threshold: Amount,
    pub input_registration_timeout: Duration,
    pub connection_confirmation_timeout: Duration,
    pub output_registration_timeout: Duration,
    pub signing_timeout: Duration,
}

impl Default for RoundConfig {
    fn default() -> Self {
        Self {
            denomination: Amount::from_sat(10_000_000),
            anonymity_set: 21,
            min_anonymity_set: 2,
            fee_per_input: Amount::from_sat(3_000),
            fee_per_output: Amount::from_sat(1_500),
            dust_threshold: Amount::from_sat(5_000),
            input_registration_timeout: Duration::from_secs(3_600),
            connection_confirmation_timeout: Duration::from_secs(60),
            output_registration_timeout: Duration::from_secs(60),
            signing_timeout: Duration::from_secs(60),
        }
    }
}

impl RoundConfig {
    /// Smallest input that pays for the denomination, its own input and the
    /// mixed output. `None` if the policy overflows.
    pub fn required_amount(&self) -> Option<Amount> {
        self.denomination
            .checked_add(self.fee_per_input)?
            .checked_add(self.fee_per_output)
    }

    /// Change owed for an input of `amount`, after paying for the change
    /// output itself. `None` when nothing above dust remains.
    pub fn change_for(&self, amount: Amount) -> Option<Amount> {
        let surplus = amount.checked_sub(self.required_amount()?)?;
        let change = surplus.checked_sub(self.fee_per_output)?;
        (change > self.dust_threshold).then_some(change)
    }

    pub fn phase_timeout(&self, phase: RoundPhase) -> Duration {
        match phase {
            RoundPhase::InputRegistration => self.input_registration_timeout,
            RoundPhase::ConnectionConfirmation => self.connection_confirmation_timeout,
            RoundPhase::OutputRegistration => self.output_registration_timeout,
            RoundPhase::Signing => self.signing_timeout,
        }
    }
}

// ============================================================================
// Phase / Status
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum RoundPhase {
    InputRegistration,
    ConnectionConfirmation,
    OutputRegistration,
    Signing,
}

impl RoundPhase {
    pub fn next(self) -> Option<RoundPhase> {
        match self {
            RoundPhase::InputRegistration => Some(RoundPhase::ConnectionConfirmation),
            RoundPhase::ConnectionConfirmation => Some(RoundPhase::OutputRegistration),
            RoundPhase::OutputRegistration => Some(RoundPhase::Signing),
            RoundPhase::Signing => None,
        }
    }
}

impl fmt::Display for RoundPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RoundPhase::InputRegistration => "input_registration",
            RoundPhase::ConnectionConfirmation => "connection_confirmation",
            RoundPhase::OutputRegistration => "output_registration",
            RoundPhase::Signing => "signing",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RoundStatus {
    Running,
    Succeeded,
    Failed,
}

impl RoundStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, RoundStatus::Running)
    }
}

impl fmt::Display for RoundStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RoundStatus::Running => "running",
            RoundStatus::Succeeded => "succeeded",
            RoundStatus::Failed => "failed",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RoundId(Uuid);

impl RoundId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RoundId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RoundId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

// ============================================================================
// Events
// ============================================================================

/// How a round ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoundOutcome {
    Succeeded { coinjoin: Transaction },
    Failed,
}

/// Sent exactly once per round, on its transition into a terminal status
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoundEvent {
    pub round_id: RoundId,
    pub outcome: RoundOutcome,
}

// ============================================================================
// Errors
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RoundError {
    #[error("round is not running (status: {0})")]
    NotRunning(RoundStatus),

    #[error("operation requires phase {expected}, round is in {actual}")]
    WrongPhase {
        expected: RoundPhase,
        actual: RoundPhase,
    },

    #[error("cannot move round from {from} to {to}")]
    InvalidPhaseTransition { from: RoundPhase, to: RoundPhase },

    #[error("input {0} is already registered in this round")]
    InputAlreadyRegistered(OutPoint),

    #[error("input amount {provided} is below the required {required}")]
    InsufficientAmount { required: Amount, provided: Amount },

    #[error("unknown alice: {0}")]
    UnknownAlice(AliceId),

    #[error("no alice confirmed her connection")]
    NoParticipants,

    #[error("output script is already registered")]
    DuplicateOutput,

    #[error("all {0} outputs are already registered")]
    OutputsFull(usize),

    #[error("{registered} of {expected} outputs registered")]
    OutputsIncomplete { registered: usize, expected: usize },

    #[error("input {0} is not part of the coinjoin")]
    UnknownInput(OutPoint),

    #[error("input {0} is already signed")]
    AlreadySigned(OutPoint),

    #[error("empty witness for input {0}")]
    EmptyWitness(OutPoint),

    #[error("round policy overflows: {0}")]
    InvalidPolicy(&'static str),
}

// ============================================================================
// Round
// ============================================================================

struct RoundState {
    phase: RoundPhase,
    status: RoundStatus,
    phase_started_at: Instant,
    alices: Vec<Alice>,
    outputs: Vec<TxOut>,
    /// Assembled on entering Signing; fully witnessed once Succeeded
    coinjoin: Option<Transaction>,
    events: Option<mpsc::UnboundedSender<RoundEvent>>,
}

impl RoundState {
    fn ensure_running(&self) -> Result<(), RoundError> {
        if self.status.is_terminal() {
            return Err(RoundError::NotRunning(self.status));
        }
        Ok(())
    }

    fn ensure_phase(&self, expected: RoundPhase) -> Result<(), RoundError> {
        self.ensure_running()?;
        if self.phase != expected {
            return Err(RoundError::WrongPhase {
                expected,
                actual: self.phase,
            });
        }
        Ok(())
    }

    /// Move to `to`, which must be the phase right after the current one.
    fn enter(
        &mut self,
        round_id: RoundId,
        config: &RoundConfig,
        to: RoundPhase,
    ) -> Result<(), RoundError> {
        self.ensure_running()?;
        if self.phase.next() != Some(to) {
            return Err(RoundError::InvalidPhaseTransition {
                from: self.phase,
                to,
            });
        }

        match to {
            RoundPhase::OutputRegistration => {
                if !self.alices.iter().any(|a| a.connection_confirmed) {
                    return Err(RoundError::NoParticipants);
                }
                let before = self.alices.len();
                self.alices.retain(|a| a.connection_confirmed);
                let dropped = before - self.alices.len();
                if dropped > 0 {
                    warn!(round_id = %round_id, dropped, "Dropped unconfirmed alices");
                }
            }
            RoundPhase::Signing => {
                if self.outputs.len() != self.alices.len() {
                    return Err(RoundError::OutputsIncomplete {
                        registered: self.outputs.len(),
                        expected: self.alices.len(),
                    });
                }
                self.coinjoin = Some(assemble_coinjoin(config, &self.alices, &self.outputs));
            }
            RoundPhase::InputRegistration | RoundPhase::ConnectionConfirmation => {}
        }

        self.phase = to;
        self.phase_started_at = Instant::now();
        info!(round_id = %round_id, phase = %to, alices = self.alices.len(), "Round phase advanced");
        Ok(())
    }

    /// Move into a terminal status and report it. The caller has checked
    /// the round is still running.
    fn terminate(&mut self, round_id: RoundId, outcome: RoundOutcome) {
        self.status = match outcome {
            RoundOutcome::Succeeded { .. } => RoundStatus::Succeeded,
            RoundOutcome::Failed => RoundStatus::Failed,
        };
        info!(round_id = %round_id, status = %self.status, phase = %self.phase, "Round finished");

        if let Some(events) = self.events.take() {
            if events.send(RoundEvent { round_id, outcome }).is_err() {
                debug!(round_id = %round_id, "Coordinator no longer listening for round events");
            }
        }
    }
}

/// One mixing session. Shared as `Arc<Round>` between the registry and the
/// protocol handlers; every method takes `&self`.
pub struct Round {
    id: RoundId,
    config: Arc<RoundConfig>,
    created_at: Instant,
    state: Mutex<RoundState>,
}

impl fmt::Debug for Round {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state();
        f.debug_struct("Round")
            .field("id", &self.id)
            .field("phase", &state.phase)
            .field("status", &state.status)
            .field("alices", &state.alices.len())
            .field("outputs", &state.outputs.len())
            .finish_non_exhaustive()
    }
}

impl Round {
    /// Create a round in InputRegistration / Running that reports its end on
    /// `events`.
    pub fn new(config: Arc<RoundConfig>, events: mpsc::UnboundedSender<RoundEvent>) -> Self {
        let now = Instant::now();
        Self {
            id: RoundId::new(),
            config,
            created_at: now,
            state: Mutex::new(RoundState {
                phase: RoundPhase::InputRegistration,
                status: RoundStatus::Running,
                phase_started_at: now,
                alices: Vec::new(),
                outputs: Vec::new(),
                coinjoin: None,
                events: Some(events),
            }),
        }
    }

    // A panic while holding the lock cannot leave RoundState half-written:
    // every mutation validates first and writes last.
    fn state(&self) -> MutexGuard<'_, RoundState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn id(&self) -> RoundId {
        self.id
    }

    pub fn config(&self) -> &RoundConfig {
        &self.config
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn phase(&self) -> RoundPhase {
        self.state().phase
    }

    pub fn status(&self) -> RoundStatus {
        self.state().status
    }

    pub fn is_running(&self) -> bool {
        self.status() == RoundStatus::Running
    }

    pub fn alices(&self) -> Vec<Alice> {
        self.state().alices.clone()
    }

    pub fn alice_count(&self) -> usize {
        self.state().alices.len()
    }

    pub fn output_count(&self) -> usize {
        self.state().outputs.len()
    }

    /// Time spent in the current phase
    pub fn phase_elapsed(&self) -> Duration {
        self.state().phase_started_at.elapsed()
    }

    /// Whether the current phase has outlived its configured timeout at `now`
    pub fn is_phase_expired(&self, now: Instant) -> bool {
        let state = self.state();
        now.saturating_duration_since(state.phase_started_at)
            >= self.config.phase_timeout(state.phase)
    }

    /// Alices in this round that registered `input`. Empty means absent.
    pub fn contains_input(&self, input: &OutPoint) -> Vec<Alice> {
        self.state()
            .alices
            .iter()
            .filter(|a| a.input == *input)
            .cloned()
            .collect()
    }

    /// The coinjoin being signed. Only available in Signing.
    pub fn unsigned_coinjoin(&self) -> Option<Transaction> {
        let state = self.state();
        match (state.status, state.phase) {
            (RoundStatus::Running, RoundPhase::Signing) => state.coinjoin.clone(),
            _ => None,
        }
    }

    /// The fully signed coinjoin. Only available once Succeeded.
    pub fn signed_coinjoin(&self) -> Option<Transaction> {
        let state = self.state();
        match state.status {
            RoundStatus::Succeeded => state.coinjoin.clone(),
            _ => None,
        }
    }

    pub fn coinjoin_txid(&self) -> Option<Txid> {
        self.signed_coinjoin().map(|tx| tx.compute_txid())
    }

    /// Move forward by exactly one phase.
    pub fn advance_phase(&self, to: RoundPhase) -> Result<(), RoundError> {
        self.state().enter(self.id, &self.config, to)
    }

    /// Start the current phase's timeout over, e.g. when input registration
    /// is still waiting for participants.
    pub fn restart_phase_timer(&self) {
        let mut state = self.state();
        if !state.status.is_terminal() {
            state.phase_started_at = Instant::now();
        }
    }

    /// Register a participant's input. Closes input registration once the
    /// anonymity set is reached.
    pub fn register_alice(&self, alice: Alice) -> Result<AliceId, RoundError> {
        let mut state = self.state();
        state.ensure_phase(RoundPhase::InputRegistration)?;

        if state.alices.iter().any(|a| a.input == alice.input) {
            return Err(RoundError::InputAlreadyRegistered(alice.input));
        }

        let required = self
            .config
            .required_amount()
            .ok_or(RoundError::InvalidPolicy("required amount"))?;
        if alice.amount < required {
            return Err(RoundError::InsufficientAmount {
                required,
                provided: alice.amount,
            });
        }

        let id = alice.id;
        debug!(round_id = %self.id, alice_id = %id, input = %alice.input, "Alice registered");
        state.alices.push(alice);

        if state.alices.len() >= self.config.anonymity_set {
            state.enter(self.id, &self.config, RoundPhase::ConnectionConfirmation)?;
        }

        Ok(id)
    }

    /// Withdraw a registration. Only possible before input registration ends.
    pub fn remove_alice(&self, id: AliceId) -> Result<Alice, RoundError> {
        let mut state = self.state();
        state.ensure_phase(RoundPhase::InputRegistration)?;

        let index = state
            .alices
            .iter()
            .position(|a| a.id == id)
            .ok_or(RoundError::UnknownAlice(id))?;
        Ok(state.alices.remove(index))
    }

    /// Mark an alice as still present. Opens output registration once every
    /// alice has confirmed.
    pub fn confirm_connection(&self, id: AliceId) -> Result<(), RoundError> {
        let mut state = self.state();
        state.ensure_phase(RoundPhase::ConnectionConfirmation)?;

        let alice = state
            .alices
            .iter_mut()
            .find(|a| a.id == id)
            .ok_or(RoundError::UnknownAlice(id))?;
        alice.connection_confirmed = true;

        if state.alices.iter().all(|a| a.connection_confirmed) {
            state.enter(self.id, &self.config, RoundPhase::OutputRegistration)?;
        }
        Ok(())
    }

    /// Register one mixed output paying the denomination to `script`. The
    /// caller has already checked the unblinded signature. Assembles the
    /// coinjoin and opens signing once every alice has an output.
    pub fn register_output(&self, script: ScriptBuf) -> Result<(), RoundError> {
        let mut state = self.state();
        state.ensure_phase(RoundPhase::OutputRegistration)?;

        if state.outputs.len() >= state.alices.len() {
            return Err(RoundError::OutputsFull(state.alices.len()));
        }
        if state.outputs.iter().any(|o| o.script_pubkey == script) {
            return Err(RoundError::DuplicateOutput);
        }

        state.outputs.push(TxOut {
            value: self.config.denomination,
            script_pubkey: script,
        });

        if state.outputs.len() == state.alices.len() {
            state.enter(self.id, &self.config, RoundPhase::Signing)?;
        }
        Ok(())
    }

    /// Attach the witness for one input. The round succeeds when the last
    /// input is signed.
    ///
    /// Only emptiness is checked here. The protocol handler verifies the
    /// witness against the spent output before calling this.
    pub fn sign_input(&self, input: &OutPoint, witness: Witness) -> Result<(), RoundError> {
        let mut state = self.state();
        state.ensure_phase(RoundPhase::Signing)?;

        if witness.is_empty() {
            return Err(RoundError::EmptyWitness(*input));
        }

        let Some(coinjoin) = state.coinjoin.as_mut() else {
            return Err(RoundError::UnknownInput(*input));
        };
        let txin = coinjoin
            .input
            .iter_mut()
            .find(|txin| txin.previous_output == *input)
            .ok_or(RoundError::UnknownInput(*input))?;
        if !txin.witness.is_empty() {
            return Err(RoundError::AlreadySigned(*input));
        }
        txin.witness = witness;

        if coinjoin.input.iter().all(|txin| !txin.witness.is_empty()) {
            let coinjoin = coinjoin.clone();
            state.terminate(self.id, RoundOutcome::Succeeded { coinjoin });
        }
        Ok(())
    }

    /// Fail the round from whatever phase it is in. Idempotent; a round that
    /// already finished is left untouched.
    pub fn fail(&self) {
        let mut state = self.state();
        if state.status.is_terminal() {
            return;
        }
        state.terminate(self.id, RoundOutcome::Failed);
    }

    /// Stop reporting to the coordinator.
    pub fn detach(&self) {
        self.state().events = None;
    }
}

/// Build the unsigned coinjoin: one input per alice, the mixed outputs and
/// any change, each list sorted so positions say nothing about who is who.
fn assemble_coinjoin(config: &RoundConfig, alices: &[Alice], outputs: &[TxOut]) -> Transaction {
    let mut input: Vec<TxIn> = alices
        .iter()
        .map(|alice| TxIn {
            previous_output: alice.input,
            script_sig: ScriptBuf::new(),
            sequence: Sequence::MAX,
            witness: Witness::new(),
        })
        .collect();
    input.sort_by(|a, b| a.previous_output.cmp(&b.previous_output));

    let change = alices.iter().filter_map(|alice| {
        let script = alice.change_script.clone()?;
        let value = config.change_for(alice.amount)?;
        Some(TxOut {
            value,
            script_pubkey: script,
        })
    });

    let mut output: Vec<TxOut> = outputs.iter().cloned().chain(change).collect();
    output.sort_by(|a, b| {
        a.value
            .cmp(&b.value)
            .then_with(|| a.script_pubkey.as_bytes().cmp(b.script_pubkey.as_bytes()))
    });

    Transaction {
        version: Version::TWO,
        lock_time: LockTime::ZERO,
        input,
        output,
    }
}
