//! JSON-RPC client for the spawned wallet service
//!
//! The coordinator consumes the service through the [`WalletRpc`]
//! trait so the fusion coordinator and manager are testable against
//! stubs; [`JsonRpcClient`] is the production implementation.

use crate::events::{Balance, TransactionEntry};
use crate::{Error, Result, ServiceConfig, Timings};
use async_trait::async_trait;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::json;
use std::time::Duration;

/// Result of an `estimateFusion` call.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FusionEstimate {
    /// Number of outputs ready to be fused at the queried threshold
    pub fusion_ready_count: u64,
    /// Total outputs considered
    #[serde(default)]
    pub total_outputs_count: u64,
}

/// Result of a `getStatus` call.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeStatus {
    /// Height the wallet has scanned to
    pub block_count: u64,
    /// Height the node reports
    pub known_block_count: u64,
    /// Connected peer count
    #[serde(default)]
    pub peer_count: u64,
}

/// Secret keys returned by `getBackupKeys`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupKeys {
    /// Private view key
    pub view_secret_key: String,
    /// Private spend key
    #[serde(default)]
    pub spend_secret_key: Option<String>,
    /// Mnemonic seed, when the keys are deterministic
    #[serde(default)]
    pub mnemonic_seed: Option<String>,
}

/// One destination of an outgoing transfer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transfer {
    /// Destination address
    pub address: String,
    /// Amount in atomic units
    pub amount: u64,
}

/// Parameters for `sendTransaction`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferRequest {
    /// Destinations
    pub transfers: Vec<Transfer>,
    /// Network fee, atomic units
    pub fee: u64,
    /// Anonymity set size
    pub anonymity: u64,
    /// Optional payment id
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payment_id: Option<String>,
}

/// Request/response API of the external wallet service.
#[async_trait]
pub trait WalletRpc: Send + Sync {
    /// Persist the wallet container to disk.
    async fn save(&self) -> Result<()>;
    /// Wipe scan state and rescan from `scan_height`.
    async fn reset(&self, scan_height: Option<u64>) -> Result<()>;
    /// Count outputs fusable below `threshold`.
    async fn estimate_fusion(&self, threshold: u64) -> Result<FusionEstimate>;
    /// Issue one consolidation transaction at `threshold`, returning
    /// its hash.
    async fn send_fusion_transaction(&self, threshold: u64) -> Result<String>;
    /// Create an integrated address from an address and payment id.
    async fn create_integrated_address(&self, address: &str, payment_id: &str) -> Result<String>;
    /// Fetch the secret keys backing `address`.
    async fn get_backup_keys(&self, address: &str) -> Result<BackupKeys>;
    /// Send a normal transfer, returning the transaction hash.
    async fn send_transaction(&self, request: &TransferRequest) -> Result<String>;
    /// Current sync status.
    async fn get_status(&self) -> Result<NodeStatus>;
    /// Current balance.
    async fn get_balance(&self) -> Result<Balance>;
    /// Transactions in `[first_block_index, first_block_index + block_count)`.
    async fn get_transactions(
        &self,
        first_block_index: u64,
        block_count: u64,
    ) -> Result<Vec<TransactionEntry>>;
}

/// JSON-RPC 2.0 client over HTTP for the service's `/json_rpc`
/// endpoint.
pub struct JsonRpcClient {
    endpoint: String,
    password: String,
    client: reqwest::Client,
}

#[derive(Deserialize)]
struct RpcError {
    message: String,
}

#[derive(Deserialize)]
struct RpcEnvelope<R> {
    result: Option<R>,
    error: Option<RpcError>,
}

impl JsonRpcClient {
    /// Create a client for the given service configuration.
    pub fn new(config: &ServiceConfig, timings: &Timings) -> Result<Self> {
        Self::with_endpoint(config.rpc_url(), config.password.clone(), timings.rpc_timeout)
    }

    /// Create a client for an explicit endpoint URL.
    pub fn with_endpoint(endpoint: String, password: String, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Rpc(format!("HTTP client setup failed: {}", e)))?;
        Ok(Self {
            endpoint,
            password,
            client,
        })
    }

    async fn call<P: Serialize, R: DeserializeOwned>(&self, method: &str, params: P) -> Result<R> {
        let request = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "password": self.password,
            "method": method,
            "params": params,
        });

        let response = self
            .client
            .post(&self.endpoint)
            .json(&request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() || e.is_connect() {
                    Error::RpcTimeout(format!("{}: {}", method, e))
                } else {
                    Error::Rpc(format!("{}: {}", method, e))
                }
            })?;

        if !response.status().is_success() {
            return Err(Error::Rpc(format!("{}: HTTP {}", method, response.status())));
        }

        let envelope: RpcEnvelope<R> = response
            .json()
            .await
            .map_err(|e| Error::Rpc(format!("{}: JSON decode error: {}", method, e)))?;

        if let Some(err) = envelope.error {
            return Err(Error::Rpc(err.message));
        }
        envelope
            .result
            .ok_or_else(|| Error::Rpc(format!("{}: empty result", method)))
    }
}

#[async_trait]
impl WalletRpc for JsonRpcClient {
    async fn save(&self) -> Result<()> {
        #[derive(Deserialize)]
        struct Empty {}
        let _: Empty = self.call("save", json!({})).await?;
        Ok(())
    }

    async fn reset(&self, scan_height: Option<u64>) -> Result<()> {
        #[derive(Deserialize)]
        struct Empty {}
        let params = match scan_height {
            Some(height) => json!({ "scanHeight": height }),
            None => json!({}),
        };
        let _: Empty = self.call("reset", params).await?;
        Ok(())
    }

    async fn estimate_fusion(&self, threshold: u64) -> Result<FusionEstimate> {
        self.call("estimateFusion", json!({ "threshold": threshold }))
            .await
    }

    async fn send_fusion_transaction(&self, threshold: u64) -> Result<String> {
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct FusionTx {
            transaction_hash: String,
        }
        let resp: FusionTx = self
            .call("sendFusionTransaction", json!({ "threshold": threshold }))
            .await?;
        Ok(resp.transaction_hash)
    }

    async fn create_integrated_address(&self, address: &str, payment_id: &str) -> Result<String> {
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct Integrated {
            integrated_address: String,
        }
        let resp: Integrated = self
            .call(
                "createIntegratedAddress",
                json!({ "address": address, "paymentId": payment_id }),
            )
            .await?;
        Ok(resp.integrated_address)
    }

    async fn get_backup_keys(&self, address: &str) -> Result<BackupKeys> {
        self.call("getBackupKeys", json!({ "address": address }))
            .await
    }

    async fn send_transaction(&self, request: &TransferRequest) -> Result<String> {
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct Sent {
            transaction_hash: String,
        }
        let resp: Sent = self.call("sendTransaction", request).await?;
        Ok(resp.transaction_hash)
    }

    async fn get_status(&self) -> Result<NodeStatus> {
        self.call("getStatus", json!({})).await
    }

    async fn get_balance(&self) -> Result<Balance> {
        self.call("getBalance", json!({})).await
    }

    async fn get_transactions(
        &self,
        first_block_index: u64,
        block_count: u64,
    ) -> Result<Vec<TransactionEntry>> {
        #[derive(Deserialize)]
        struct Block {
            transactions: Vec<TransactionEntry>,
        }
        #[derive(Deserialize)]
        struct Items {
            items: Vec<Block>,
        }
        let resp: Items = self
            .call(
                "getTransactions",
                json!({
                    "firstBlockIndex": first_block_index,
                    "blockCount": block_count,
                }),
            )
            .await?;
        Ok(resp
            .items
            .into_iter()
            .flat_map(|block| block.transactions)
            .collect())
    }
}
