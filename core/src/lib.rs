//! # CoinJoin Coordinator
//!
//! Server side of a Chaumian CoinJoin: runs mixing rounds, records the
//! coinjoins they produce and throttles admission while too many of those
//! are still unconfirmed.
//!
//! ## Architecture
//!
//! ```text
//!   protocol handlers (external)
//!        │ register input / confirm / register output / sign
//!        ▼
//!   ┌──────────────────────────────────────────────────────────┐
//!   │ Coordinator                                              │
//!   │                                                          │
//!   │   RoundRegistry ──▶ Round, Round, ... (state machines)   │
//!   │        ▲                 │                               │
//!   │        │ replenish       │ RoundEvent (once per round)   │
//!   │        └──── event loop ◀┘                               │
//!   │                   │                                      │
//!   │                   ▼                                      │
//!   │             CoinJoinLedger ──▶ CoinJoins{Network}.txt    │
//!   │                   │                                      │
//!   │   BlindingRsaKey  │            RsaKey.json               │
//!   └───────────────────┼──────────────────────────────────────┘
//!                       ▼
//!                BlockchainNode (bitcoind JSON-RPC)
//! ```

pub mod blinding;
pub mod coinjoin;
pub mod config;
pub mod node;

pub use blinding::{BlindingKeyError, BlindingRsaKey};
pub use coinjoin::{
    Alice, AliceId, CoinJoinLedger, Coordinator, CoordinatorError, Round, RoundConfig, RoundError,
    RoundEvent, RoundId, RoundOutcome, RoundPhase, RoundStatus,
};
pub use config::CoordinatorSettings;
pub use node::{BlockchainNode, FallbackSwitch, InMemoryNode, NodeError, RpcNodeClient};
