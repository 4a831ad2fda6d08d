// Bitcoin node boundary for DMPool
// Everything the reward engine needs from bitcoind, behind one trait

mod client;

pub use client::BitcoinRpcClient;

use async_trait::async_trait;
use bitcoin::Amount;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// RPC error code bitcoind returns for an unknown transaction or block
pub const RPC_INVALID_ADDRESS_OR_KEY: i32 = -5;
/// RPC error code for a transaction that is already in the chain
pub const RPC_VERIFY_ALREADY_IN_CHAIN: i32 = -27;
/// RPC error code while the node is still loading (block index, wallet)
pub const RPC_IN_WARMUP: i32 = -28;

/// Error type for node RPC calls
#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    /// The request never reached the node
    #[error("Connection to bitcoin node failed: {0}")]
    Connect(String),
    /// The request may have reached the node but no response arrived in time
    #[error("Bitcoin node request timed out after {0:?}")]
    Timeout(Duration),
    #[error("Transport error talking to bitcoin node: {0}")]
    Transport(String),
    #[error("HTTP error {status_code}: {message}")]
    Http { status_code: u16, message: String },
    #[error("RPC error {code}: {message}")]
    Rpc { code: i32, message: String },
    #[error("Parse error: {0}")]
    Parse(String),
}

impl RpcError {
    /// The node could not be reached, did not answer or is still starting;
    /// retry on the next poll
    pub fn is_unavailable(&self) -> bool {
        matches!(
            self,
            RpcError::Connect(_)
                | RpcError::Timeout(_)
                | RpcError::Transport(_)
                | RpcError::Http { .. }
                | RpcError::Rpc {
                    code: RPC_IN_WARMUP,
                    ..
                }
        )
    }

    /// For state-changing calls: the node may have applied the request
    pub fn is_unknown_outcome(&self) -> bool {
        matches!(self, RpcError::Timeout(_) | RpcError::Transport(_))
    }

    pub fn rpc_code(&self) -> Option<i32> {
        match self {
            RpcError::Rpc { code, .. } => Some(*code),
            _ => None,
        }
    }
}

/// Blockchain info
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BlockchainInfo {
    pub chain: String,
    pub blocks: u64,
    pub headers: u64,
    #[serde(rename = "bestblockhash")]
    pub best_block_hash: String,
    #[serde(rename = "initialblockdownload", default)]
    pub initial_block_download: bool,
}

/// Coinbase output of a block
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoinbaseOutput {
    pub value: Amount,
    pub address: Option<String>,
}

/// The parts of a block the distributor looks at
#[derive(Debug, Clone)]
pub struct BlockSummary {
    pub hash: String,
    pub height: u64,
    /// Block header time, unix seconds
    pub time: i64,
    pub coinbase_outputs: Vec<CoinbaseOutput>,
}

impl BlockSummary {
    /// Sum of coinbase outputs paying any of `addresses`
    pub fn reward_to(&self, addresses: &[String]) -> Amount {
        self.coinbase_outputs
            .iter()
            .filter(|output| {
                output
                    .address
                    .as_ref()
                    .is_some_and(|address| addresses.iter().any(|a| a == address))
            })
            .map(|output| output.value)
            .sum()
    }
}

/// Unspent output from the node's wallet
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq)]
pub struct UnspentOutput {
    pub txid: String,
    pub vout: u32,
    #[serde(default)]
    pub address: Option<String>,
    #[serde(with = "bitcoin::amount::serde::as_btc")]
    pub amount: Amount,
    pub confirmations: u32,
    #[serde(default = "default_spendable")]
    pub spendable: bool,
}

fn default_spendable() -> bool {
    true
}

impl UnspentOutput {
    pub fn outpoint(&self) -> OutPointRef {
        OutPointRef {
            txid: self.txid.clone(),
            vout: self.vout,
        }
    }
}

/// Transaction outpoint as the node reports it
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OutPointRef {
    pub txid: String,
    pub vout: u32,
}

/// Transaction output for creating transactions
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxOutput {
    pub address: String,
    pub amount: Amount,
}

/// What the wallet knows about one of its own transactions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WalletTxStatus {
    /// Depth in the active chain, zero while unconfirmed
    Confirmations(u32),
    /// A conflicting transaction spending the same inputs is in the chain
    Conflicted,
    /// The wallet has no record of the transaction
    Unknown,
}

/// Signed transaction
#[derive(Debug, Clone, Deserialize)]
pub struct SignedTransaction {
    pub hex: String,
    pub complete: bool,
}

/// Operations the reward engine needs from bitcoind
#[async_trait]
pub trait NodeRpc: Send + Sync {
    async fn get_blockchain_info(&self) -> Result<BlockchainInfo, RpcError>;

    async fn get_block_count(&self) -> Result<u64, RpcError>;

    async fn get_block_hash(&self, height: u64) -> Result<String, RpcError>;

    async fn get_block(&self, hash: &str) -> Result<BlockSummary, RpcError>;

    async fn list_unspent(&self, min_confirmations: u32) -> Result<Vec<UnspentOutput>, RpcError>;

    async fn create_raw_transaction(
        &self,
        inputs: &[OutPointRef],
        outputs: &[TxOutput],
    ) -> Result<String, RpcError>;

    async fn sign_raw_transaction_with_wallet(
        &self,
        hex: &str,
    ) -> Result<SignedTransaction, RpcError>;

    /// Never retried by implementations; a timeout means the outcome is unknown
    async fn send_raw_transaction(&self, hex: &str) -> Result<String, RpcError>;

    /// Status of a wallet transaction (`gettransaction`). Works for mined
    /// transactions without `-txindex`.
    async fn get_wallet_transaction(&self, txid: &str) -> Result<WalletTxStatus, RpcError>;

    /// Fee rate estimate in sat/vB, `None` if the node has no estimate
    async fn estimate_smart_fee(&self, conf_target: u32) -> Result<Option<u64>, RpcError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reward_to_sums_pool_outputs_only() {
        let block = BlockSummary {
            hash: "00".repeat(32),
            height: 100,
            time: 1_700_000_000,
            coinbase_outputs: vec![
                CoinbaseOutput {
                    value: Amount::from_sat(600_000_000),
                    address: Some("pool1".to_string()),
                },
                CoinbaseOutput {
                    value: Amount::from_sat(25_000_000),
                    address: Some("pool2".to_string()),
                },
                CoinbaseOutput {
                    value: Amount::from_sat(1_000),
                    address: Some("someone-else".to_string()),
                },
                CoinbaseOutput {
                    value: Amount::ZERO,
                    address: None,
                },
            ],
        };

        let pool = vec!["pool1".to_string(), "pool2".to_string()];
        assert_eq!(block.reward_to(&pool), Amount::from_sat(625_000_000));
        assert_eq!(block.reward_to(&[]), Amount::ZERO);
    }

    #[test]
    fn test_error_classification() {
        assert!(RpcError::Connect("refused".into()).is_unavailable());
        assert!(!RpcError::Connect("refused".into()).is_unknown_outcome());
        assert!(RpcError::Timeout(Duration::from_secs(30)).is_unknown_outcome());
        let rejected = RpcError::Rpc {
            code: -26,
            message: "bad-txns".into(),
        };
        assert!(!rejected.is_unavailable());
        assert!(!rejected.is_unknown_outcome());
        assert_eq!(rejected.rpc_code(), Some(-26));

        let warmup = RpcError::Rpc {
            code: RPC_IN_WARMUP,
            message: "Loading block index...".into(),
        };
        assert!(warmup.is_unavailable());
        assert!(!warmup.is_unknown_outcome());
    }

    #[test]
    fn test_unspent_output_parses_btc_amount() {
        let json = serde_json::json!({
            "txid": "aa".repeat(32),
            "vout": 1,
            "address": "bcrt1qf063yte5g42v2w7796ace54hu0gkqzkkf9pxha",
            "amount": 0.0003,
            "confirmations": 12
        });
        let utxo: UnspentOutput = serde_json::from_value(json).unwrap();
        assert_eq!(utxo.amount, Amount::from_sat(30_000));
        assert!(utxo.spendable);
    }
}
