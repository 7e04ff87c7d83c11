//! Bitcoin Core JSON-RPC client
//!
//! Speaks JSON-RPC 1.0 over HTTP with optional basic auth. Only
//! `getrawtransaction` is needed by the coordinator.
//!
//! ```text
//!  CoinJoinLedger ──▶ RpcNodeClient ──POST──▶ primary bitcoind
//!                          │
//!                          └──(FallbackSwitch engaged)──▶ fallback bitcoind
//! ```
//!
//! A transport failure against the primary engages the [`FallbackSwitch`]
//! and the request is retried once against the fallback endpoint, if one is
//! configured. The switch stays engaged until someone releases it.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bitcoin::Txid;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use super::{BlockchainNode, FallbackSwitch, NodeError, RawTransactionInfo};

/// `RPC_INVALID_ADDRESS_OR_KEY`: bitcoind's answer for an unknown txid
const RPC_NOT_FOUND: i64 = -5;

// ============================================================================
// Configuration
// ============================================================================

#[derive(Debug, Clone)]
pub struct RpcNodeConfig {
    /// e.g. "http://127.0.0.1:18443"
    pub url: String,
    pub fallback_url: Option<String>,
    pub user: Option<String>,
    pub password: Option<String>,
    pub request_timeout: Duration,
}

impl Default for RpcNodeConfig {
    fn default() -> Self {
        Self {
            url: "http://127.0.0.1:18443".to_string(),
            fallback_url: None,
            user: None,
            password: None,
            request_timeout: Duration::from_secs(30),
        }
    }
}

// ============================================================================
// Wire types
// ============================================================================

#[derive(Debug, Serialize)]
struct RpcRequest<'a> {
    jsonrpc: &'static str,
    id: u64,
    method: &'a str,
    params: Value,
}

#[derive(Debug, Deserialize)]
struct RpcResponse {
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<RpcErrorObject>,
}

#[derive(Debug, Deserialize)]
struct RpcErrorObject {
    code: i64,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
struct VerboseTransaction {
    /// Absent for mempool transactions
    #[serde(default)]
    confirmations: Option<i64>,
}

/// Interpret a `getrawtransaction <txid> true` reply. bitcoind reports RPC
/// errors with a non-2xx status, so the body is inspected first.
fn parse_raw_transaction_response(
    status: u16,
    body: &str,
) -> Result<Option<RawTransactionInfo>, NodeError> {
    let response: RpcResponse = match serde_json::from_str(body) {
        Ok(response) => response,
        Err(e) if (200..300).contains(&status) => {
            return Err(NodeError::Malformed(e.to_string()));
        }
        Err(_) => return Err(NodeError::Http { status }),
    };

    if let Some(error) = response.error {
        if error.code == RPC_NOT_FOUND {
            return Ok(None);
        }
        return Err(NodeError::Rpc {
            code: error.code,
            message: error.message,
        });
    }

    let result = match response.result {
        Some(Value::Null) | None => return Ok(None),
        Some(result) => result,
    };
    let tx: VerboseTransaction =
        serde_json::from_value(result).map_err(|e| NodeError::Malformed(e.to_string()))?;

    let confirmations = tx.confirmations.unwrap_or(0).clamp(0, u32::MAX as i64) as u32;
    Ok(Some(RawTransactionInfo { confirmations }))
}

// ============================================================================
// Client
// ============================================================================

pub struct RpcNodeClient {
    config: RpcNodeConfig,
    client: reqwest::Client,
    fallback: FallbackSwitch,
    next_id: AtomicU64,
}

impl RpcNodeClient {
    pub fn new(config: RpcNodeConfig, fallback: FallbackSwitch) -> Result<Self, NodeError> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| NodeError::Transport(e.to_string()))?;

        Ok(Self {
            config,
            client,
            fallback,
            next_id: AtomicU64::new(1),
        })
    }

    pub fn fallback_switch(&self) -> &FallbackSwitch {
        &self.fallback
    }

    /// Endpoint the next request goes to
    pub fn endpoint(&self) -> &str {
        match (&self.config.fallback_url, self.fallback.is_engaged()) {
            (Some(fallback), true) => fallback,
            _ => &self.config.url,
        }
    }

    async fn post(&self, url: &str, request: &RpcRequest<'_>) -> Result<(u16, String), reqwest::Error> {
        let mut builder = self.client.post(url).json(request);
        if let Some(user) = &self.config.user {
            builder = builder.basic_auth(user, self.config.password.as_ref());
        }
        let response = builder.send().await?;
        let status = response.status().as_u16();
        let body = response.text().await?;
        Ok((status, body))
    }

    async fn call(&self, method: &str, params: Value) -> Result<(u16, String), NodeError> {
        let request = RpcRequest {
            jsonrpc: "1.0",
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            method,
            params,
        };

        let url = self.endpoint().to_string();
        match self.post(&url, &request).await {
            Ok(reply) => Ok(reply),
            Err(e) => {
                let Some(fallback_url) = self.config.fallback_url.as_deref() else {
                    return Err(NodeError::Transport(e.to_string()));
                };
                if url == fallback_url {
                    return Err(NodeError::Transport(e.to_string()));
                }

                if self.fallback.engage() {
                    warn!(primary = %url, fallback = %fallback_url, error = %e, "Node unreachable, switching to fallback endpoint");
                }
                self.post(fallback_url, &request)
                    .await
                    .map_err(|e| NodeError::Transport(e.to_string()))
            }
        }
    }
}

#[async_trait]
impl BlockchainNode for RpcNodeClient {
    async fn get_raw_transaction(
        &self,
        txid: &Txid,
    ) -> Result<Option<RawTransactionInfo>, NodeError> {
        let params = serde_json::json!([txid.to_string(), true]);
        let (status, body) = self.call("getrawtransaction", params).await?;
        let info = parse_raw_transaction_response(status, &body)?;
        debug!(%txid, ?info, "getrawtransaction");
        Ok(info)
    }
}
