use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use bitcoin::Txid;

use super::{BlockchainNode, NodeError, RawTransactionInfo};

/// Node double backed by a map of txid to confirmation count. Counts every
/// lookup so callers can assert whether the node was consulted at all.
#[derive(Debug, Default)]
pub struct InMemoryNode {
    transactions: Mutex<HashMap<Txid, u32>>,
    unreachable: AtomicBool,
    queries: AtomicUsize,
}

impl InMemoryNode {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_transactions(entries: impl IntoIterator<Item = (Txid, u32)>) -> Self {
        let node = Self::new();
        for (txid, confirmations) in entries {
            node.set_confirmations(txid, confirmations);
        }
        node
    }

    /// Make `txid` known with the given confirmation count
    pub fn set_confirmations(&self, txid: Txid, confirmations: u32) {
        if let Ok(mut txs) = self.transactions.lock() {
            txs.insert(txid, confirmations);
        }
    }

    pub fn remove(&self, txid: &Txid) {
        if let Ok(mut txs) = self.transactions.lock() {
            txs.remove(txid);
        }
    }

    /// While set, every lookup fails with [`NodeError::Unreachable`]
    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::Relaxed);
    }

    pub fn query_count(&self) -> usize {
        self.queries.load(Ordering::Relaxed)
    }

    pub fn reset_query_count(&self) {
        self.queries.store(0, Ordering::Relaxed);
    }
}

#[async_trait]
impl BlockchainNode for InMemoryNode {
    async fn get_raw_transaction(
        &self,
        txid: &Txid,
    ) -> Result<Option<RawTransactionInfo>, NodeError> {
        self.queries.fetch_add(1, Ordering::Relaxed);
        if self.unreachable.load(Ordering::Relaxed) {
            return Err(NodeError::Unreachable);
        }
        let txs = self
            .transactions
            .lock()
            .map_err(|_| NodeError::Transport("in-memory node lock poisoned".to_string()))?;
        Ok(txs
            .get(txid)
            .map(|&confirmations| RawTransactionInfo { confirmations }))
    }
}
