//! Blockchain node access
//!
//! The coordinator only ever asks the node one question: what does it know
//! about a transaction id. [`BlockchainNode`] is that seam; production uses
//! [`RpcNodeClient`] against bitcoind, tests use [`InMemoryNode`].

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use bitcoin::Txid;
use thiserror::Error;

pub mod memory;
pub mod rpc_client;

pub use memory::InMemoryNode;
pub use rpc_client::{RpcNodeClient, RpcNodeConfig};

/// What the node reports for a transaction it knows
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawTransactionInfo {
    /// Zero while the transaction sits in the mempool
    pub confirmations: u32,
}

impl RawTransactionInfo {
    pub fn is_confirmed(&self) -> bool {
        self.confirmations > 0
    }
}

#[derive(Error, Debug)]
pub enum NodeError {
    #[error("node transport error: {0}")]
    Transport(String),

    #[error("node returned HTTP {status}")]
    Http { status: u16 },

    #[error("node RPC error {code}: {message}")]
    Rpc { code: i64, message: String },

    #[error("malformed node response: {0}")]
    Malformed(String),

    #[error("node unreachable")]
    Unreachable,
}

#[async_trait]
pub trait BlockchainNode: Send + Sync {
    /// Look a transaction up. `Ok(None)` means the node does not know it.
    async fn get_raw_transaction(&self, txid: &Txid)
    -> Result<Option<RawTransactionInfo>, NodeError>;
}

/// Shared flag selecting the fallback node endpoint. Cloned into every
/// client that should follow it and re-read on each request.
#[derive(Debug, Clone, Default)]
pub struct FallbackSwitch(Arc<AtomicBool>);

impl FallbackSwitch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_engaged(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    /// Returns true if this call flipped the switch
    pub fn engage(&self) -> bool {
        !self.0.swap(true, Ordering::AcqRel)
    }

    pub fn release(&self) {
        self.0.store(false, Ordering::Release);
    }
}
