//! CoinJoin ledger
//!
//! Durable record of every coinjoin a successful round produced, and the
//! subset still waiting for its first confirmation.
//!
//! ```text
//!   All          every recorded txid, one per line in CoinJoins{Network}.txt
//!   Unconfirmed  ⊆ All, ids the node last reported with 0 confirmations
//! ```
//!
//! The file is appended to on every success and only rewritten when ids are
//! pruned. It is reconciled against the node on load; an unreadable or
//! malformed file is discarded and the ledger starts empty.
//!
//! The ledger has its own lock, independent of the round registry, and holds
//! it across node queries.

use std::io;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use bitcoin::{Network, Txid};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::node::BlockchainNode;

#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("ledger file I/O failed: {0}")]
    Io(#[from] io::Error),

    #[error("line {line} is not a transaction id: {value:?}")]
    InvalidTxid { line: usize, value: String },
}

/// `CoinJoinsMain.txt`, `CoinJoinsTestNet.txt`, ...
pub fn ledger_file_name(network: Network) -> String {
    let label = match network {
        Network::Bitcoin => "Main".to_string(),
        Network::Testnet => "TestNet".to_string(),
        Network::Signet => "Signet".to_string(),
        Network::Regtest => "RegTest".to_string(),
        other => other.to_string(),
    };
    format!("CoinJoins{label}.txt")
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct LedgerSnapshot {
    pub all: Vec<Txid>,
    pub unconfirmed: Vec<Txid>,
}

#[derive(Debug, Default)]
struct LedgerState {
    all: Vec<Txid>,
    unconfirmed: Vec<Txid>,
}

impl LedgerState {
    fn forget(&mut self, txid: &Txid) {
        self.all.retain(|id| id != txid);
        self.unconfirmed.retain(|id| id != txid);
    }
}

pub struct CoinJoinLedger {
    path: PathBuf,
    node: Arc<dyn BlockchainNode>,
    state: Mutex<LedgerState>,
}

impl CoinJoinLedger {
    /// Rebuild the ledger from `path`, keeping only ids the node still knows.
    /// Never fails: a bad file is deleted and the ledger starts empty.
    pub async fn load(path: PathBuf, node: Arc<dyn BlockchainNode>) -> Self {
        let state = match Self::reconcile(&path, node.as_ref()).await {
            Ok(state) => state,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "CoinJoins file is corrupted, deleting it");
                if let Err(e) = fs::remove_file(&path).await {
                    if e.kind() != io::ErrorKind::NotFound {
                        warn!(path = %path.display(), error = %e, "Failed to delete CoinJoins file");
                    }
                }
                LedgerState::default()
            }
        };

        info!(
            path = %path.display(),
            coinjoins = state.all.len(),
            unconfirmed = state.unconfirmed.len(),
            "CoinJoin ledger loaded"
        );

        Self {
            path,
            node,
            state: Mutex::new(state),
        }
    }

    async fn reconcile(
        path: &Path,
        node: &dyn BlockchainNode,
    ) -> Result<LedgerState, LedgerError> {
        let contents = match fs::read_to_string(path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(LedgerState::default()),
            Err(e) => return Err(e.into()),
        };

        let mut txids = Vec::new();
        for (index, line) in contents.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let txid = Txid::from_str(line).map_err(|_| LedgerError::InvalidTxid {
                line: index + 1,
                value: line.to_string(),
            })?;
            txids.push(txid);
        }

        let mut state = LedgerState::default();
        let mut pruned = 0usize;
        for txid in txids {
            match node.get_raw_transaction(&txid).await {
                Ok(Some(info)) => {
                    state.all.push(txid);
                    if !info.is_confirmed() {
                        state.unconfirmed.push(txid);
                    }
                }
                Ok(None) => pruned += 1,
                Err(e) => {
                    debug!(%txid, error = %e, "Node lookup failed, dropping coinjoin");
                    pruned += 1;
                }
            }
        }

        if pruned > 0 {
            info!(pruned, "Pruning coinjoins unknown to the node");
            rewrite(path, &state.all).await?;
        }
        Ok(state)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Record the coinjoin of a successful round. A fresh coinjoin has no
    /// confirmations yet, so it joins both sets. Recording twice is a no-op.
    ///
    /// The id is only added in memory once it is on disk, so a failed call
    /// can be retried.
    pub async fn record_success(&self, txid: Txid) -> Result<(), LedgerError> {
        let mut state = self.state.lock().await;
        if state.all.contains(&txid) {
            return Ok(());
        }

        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(format!("{txid}\n").as_bytes()).await?;
        file.flush().await?;

        state.all.push(txid);
        state.unconfirmed.push(txid);
        info!(%txid, unconfirmed = state.unconfirmed.len(), "CoinJoin recorded");
        Ok(())
    }

    pub async fn contains(&self, txid: &Txid) -> bool {
        self.state.lock().await.all.contains(txid)
    }

    pub async fn unconfirmed_count(&self) -> usize {
        self.state.lock().await.unconfirmed.len()
    }

    pub async fn snapshot(&self) -> LedgerSnapshot {
        let state = self.state.lock().await;
        LedgerSnapshot {
            all: state.all.clone(),
            unconfirmed: state.unconfirmed.clone(),
        }
    }

    /// Whether `max_unconfirmed` or more coinjoins are still unconfirmed.
    ///
    /// Below the limit this answers `false` without touching the node. At or
    /// above it, every unconfirmed id is re-checked first: confirmed ids
    /// leave Unconfirmed, ids the node no longer knows (or cannot be asked
    /// about) leave both sets. The answer is the count after that sweep.
    pub async fn enforce_unconfirmed_limit(&self, max_unconfirmed: usize) -> bool {
        let mut state = self.state.lock().await;
        if state.unconfirmed.len() < max_unconfirmed {
            return false;
        }

        let mut pruned = false;
        for txid in state.unconfirmed.clone() {
            match self.node.get_raw_transaction(&txid).await {
                Ok(Some(info)) if info.is_confirmed() => {
                    debug!(%txid, confirmations = info.confirmations, "CoinJoin confirmed");
                    state.unconfirmed.retain(|id| *id != txid);
                }
                Ok(Some(_)) => {}
                Ok(None) => {
                    warn!(%txid, "CoinJoin vanished from the node, forgetting it");
                    state.forget(&txid);
                    pruned = true;
                }
                Err(e) => {
                    warn!(%txid, error = %e, "Node lookup failed, forgetting coinjoin");
                    state.forget(&txid);
                    pruned = true;
                }
            }
        }

        if pruned {
            if let Err(e) = rewrite(&self.path, &state.all).await {
                warn!(path = %self.path.display(), error = %e, "Failed to rewrite CoinJoins file");
            }
        }

        let reached = state.unconfirmed.len() >= max_unconfirmed;
        if reached {
            warn!(
                unconfirmed = state.unconfirmed.len(),
                max_unconfirmed, "Unconfirmed coinjoin limit reached"
            );
        }
        reached
    }
}

/// Replace the file with `txids`, one per line, via a temp file and rename.
async fn rewrite(path: &Path, txids: &[Txid]) -> io::Result<()> {
    let mut contents = String::with_capacity(txids.len() * 65);
    for txid in txids {
        contents.push_str(&txid.to_string());
        contents.push('\n');
    }

    let tmp = path.with_extension("txt.tmp");
    fs::write(&tmp, contents).await?;
    fs::rename(&tmp, path).await
}
