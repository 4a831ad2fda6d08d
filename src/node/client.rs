// JSON-RPC client for bitcoind

use super::{
    BlockSummary, BlockchainInfo, CoinbaseOutput, NodeRpc, OutPointRef, RPC_INVALID_ADDRESS_OR_KEY,
    RpcError, SignedTransaction, TxOutput, UnspentOutput, WalletTxStatus,
};
use crate::config::BitcoinRpcConfig;
use async_trait::async_trait;
use base64::{Engine, engine::general_purpose::STANDARD};
use bitcoin::Amount;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, error};

const INITIAL_BACKOFF_MS: u64 = 100;
const MAX_BACKOFF_MS: u64 = 2_000;

/// JSON-RPC 1.0 request structure (Bitcoin Core format)
#[derive(Serialize)]
struct JsonRpcRequest<'a> {
    method: &'a str,
    params: &'a [serde_json::Value],
    id: u64,
}

/// JSON-RPC 1.0 response structure. Both fields are always present, one of them null.
#[derive(Deserialize, Debug)]
struct JsonRpcResponse<T> {
    result: Option<T>,
    error: Option<JsonRpcError>,
}

#[derive(Deserialize, Debug)]
struct JsonRpcError {
    code: i32,
    message: String,
}

#[derive(Deserialize)]
struct RawBlock {
    hash: String,
    height: u64,
    time: i64,
    tx: Vec<RawTransaction>,
}

#[derive(Deserialize)]
struct RawTransaction {
    vout: Vec<RawOutput>,
}

#[derive(Deserialize)]
struct RawOutput {
    #[serde(with = "bitcoin::amount::serde::as_btc")]
    value: Amount,
    #[serde(rename = "scriptPubKey")]
    script_pub_key: RawScriptPubKey,
}

#[derive(Deserialize)]
struct RawScriptPubKey {
    address: Option<String>,
    /// Pre-v22 nodes report a list instead
    addresses: Option<Vec<String>>,
}

#[derive(Deserialize)]
struct WalletTransaction {
    /// Negative when a conflicting transaction is in the chain
    confirmations: i64,
}

#[derive(Deserialize)]
struct SmartFee {
    /// BTC per kvB
    feerate: Option<f64>,
}

#[derive(Debug, Clone)]
pub struct BitcoinRpcClient {
    client: reqwest::Client,
    url: String,
    timeout: Duration,
    max_retries: u32,
    request_id: Arc<AtomicU64>,
}

impl BitcoinRpcClient {
    pub fn new(config: &BitcoinRpcConfig) -> Result<Self, RpcError> {
        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert(
            reqwest::header::AUTHORIZATION,
            format!(
                "Basic {}",
                STANDARD.encode(format!("{}:{}", config.username, config.password))
            )
            .parse()
            .map_err(|e| RpcError::Parse(format!("Invalid header: {e}")))?,
        );

        let timeout = Duration::from_secs(config.timeout_secs);
        let client = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(timeout)
            .build()
            .map_err(|e| RpcError::Transport(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            client,
            url: config.url.clone(),
            timeout,
            max_retries: config.max_retries,
            request_id: Arc::new(AtomicU64::new(0)),
        })
    }

    /// Single JSON-RPC request, no retries
    pub async fn request<T: serde::de::DeserializeOwned>(
        &self,
        method: &str,
        params: &[serde_json::Value],
    ) -> Result<T, RpcError> {
        let id = self.request_id.fetch_add(1, Ordering::SeqCst);
        let request = JsonRpcRequest { method, params, id };

        let response = self
            .client
            .post(&self.url)
            .json(&request)
            .send()
            .await
            .map_err(|e| self.classify(e))?;

        let status = response.status();
        let body = response.text().await.map_err(|e| self.classify(e))?;

        // bitcoind answers RPC errors with HTTP 500 and a JSON body, so parse before judging status
        let parsed = serde_json::from_str::<JsonRpcResponse<T>>(&body);
        if let Ok(JsonRpcResponse {
            error: Some(error), ..
        }) = &parsed
        {
            return Err(RpcError::Rpc {
                code: error.code,
                message: error.message.clone(),
            });
        }

        if !status.is_success() {
            error!(
                "Error reaching bitcoin node with status={:?}. Message={:?}",
                status.as_u16(),
                body
            );
            return Err(RpcError::Http {
                status_code: status.as_u16(),
                message: body,
            });
        }

        match parsed {
            Ok(JsonRpcResponse {
                result: Some(value),
                ..
            }) => Ok(value),
            // null is a valid result for void methods, let T decide
            Ok(JsonRpcResponse { result: None, .. }) => {
                serde_json::from_value(serde_json::Value::Null)
                    .map_err(|e| RpcError::Parse(format!("{method} returned null: {e}")))
            }
            Err(e) => Err(RpcError::Parse(format!(
                "Failed to parse {method} response: {e}"
            ))),
        }
    }

    /// Request for read-only methods, retried with exponential backoff when the node is unavailable
    async fn read<T: serde::de::DeserializeOwned>(
        &self,
        method: &str,
        params: &[serde_json::Value],
    ) -> Result<T, RpcError> {
        let mut attempt = 0;
        let mut backoff_ms = INITIAL_BACKOFF_MS;

        loop {
            match self.request(method, params).await {
                Ok(result) => return Ok(result),
                Err(e) if e.is_unavailable() && attempt < self.max_retries => {
                    attempt += 1;
                    debug!(
                        "{} attempt {} failed ({}), retrying in {}ms",
                        method, attempt, e, backoff_ms
                    );
                    tokio::time::sleep(Duration::from_millis(backoff_ms)).await;
                    backoff_ms = std::cmp::min(backoff_ms * 2, MAX_BACKOFF_MS);
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn classify(&self, e: reqwest::Error) -> RpcError {
        if e.is_timeout() {
            RpcError::Timeout(self.timeout)
        } else if e.is_connect() {
            RpcError::Connect(e.to_string())
        } else {
            RpcError::Transport(e.to_string())
        }
    }
}

#[async_trait]
impl NodeRpc for BitcoinRpcClient {
    async fn get_blockchain_info(&self) -> Result<BlockchainInfo, RpcError> {
        self.read("getblockchaininfo", &[]).await
    }

    async fn get_block_count(&self) -> Result<u64, RpcError> {
        self.read("getblockcount", &[]).await
    }

    async fn get_block_hash(&self, height: u64) -> Result<String, RpcError> {
        self.read("getblockhash", &[json!(height)]).await
    }

    async fn get_block(&self, hash: &str) -> Result<BlockSummary, RpcError> {
        let block: RawBlock = self.read("getblock", &[json!(hash), json!(2)]).await?;
        let coinbase = block
            .tx
            .into_iter()
            .next()
            .ok_or_else(|| RpcError::Parse(format!("Block {hash} has no transactions")))?;

        let coinbase_outputs = coinbase
            .vout
            .into_iter()
            .map(|output| CoinbaseOutput {
                value: output.value,
                address: output.script_pub_key.address.or_else(|| {
                    output
                        .script_pub_key
                        .addresses
                        .and_then(|addresses| addresses.into_iter().next())
                }),
            })
            .collect();

        Ok(BlockSummary {
            hash: block.hash,
            height: block.height,
            time: block.time,
            coinbase_outputs,
        })
    }

    async fn list_unspent(&self, min_confirmations: u32) -> Result<Vec<UnspentOutput>, RpcError> {
        self.read("listunspent", &[json!(min_confirmations), json!(9_999_999)])
            .await
    }

    async fn create_raw_transaction(
        &self,
        inputs: &[OutPointRef],
        outputs: &[TxOutput],
    ) -> Result<String, RpcError> {
        let inputs: Vec<serde_json::Value> = inputs
            .iter()
            .map(|input| json!({ "txid": input.txid, "vout": input.vout }))
            .collect();
        let outputs: Vec<serde_json::Value> = outputs
            .iter()
            .map(|output| json!({ output.address.clone(): output.amount.to_btc() }))
            .collect();
        self.request("createrawtransaction", &[json!(inputs), json!(outputs)])
            .await
    }

    async fn sign_raw_transaction_with_wallet(
        &self,
        hex: &str,
    ) -> Result<SignedTransaction, RpcError> {
        self.request("signrawtransactionwithwallet", &[json!(hex)])
            .await
    }

    async fn send_raw_transaction(&self, hex: &str) -> Result<String, RpcError> {
        self.request("sendrawtransaction", &[json!(hex)]).await
    }

    async fn get_wallet_transaction(&self, txid: &str) -> Result<WalletTxStatus, RpcError> {
        match self
            .read::<WalletTransaction>("gettransaction", &[json!(txid)])
            .await
        {
            Ok(tx) if tx.confirmations < 0 => Ok(WalletTxStatus::Conflicted),
            Ok(tx) => Ok(WalletTxStatus::Confirmations(
                u32::try_from(tx.confirmations).unwrap_or(u32::MAX),
            )),
            Err(RpcError::Rpc { code, .. }) if code == RPC_INVALID_ADDRESS_OR_KEY => {
                Ok(WalletTxStatus::Unknown)
            }
            Err(e) => Err(e),
        }
    }

    async fn estimate_smart_fee(&self, conf_target: u32) -> Result<Option<u64>, RpcError> {
        let estimate: SmartFee = self.read("estimatesmartfee", &[json!(conf_target)]).await?;
        let Some(feerate) = estimate.feerate else {
            return Ok(None);
        };
        let per_kvb = Amount::from_btc(feerate)
            .map_err(|e| RpcError::Parse(format!("Invalid feerate {feerate}: {e}")))?;
        Ok(Some(per_kvb.to_sat().div_ceil(1000).max(1)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::{
        Mock, MockServer, ResponseTemplate,
        matchers::{body_json, body_partial_json, header, method, path},
    };

    fn config(url: &str) -> BitcoinRpcConfig {
        BitcoinRpcConfig {
            url: url.to_string(),
            username: "dmpool".to_string(),
            password: "dmpool".to_string(),
            timeout_secs: 5,
            max_retries: 2,
        }
    }

    fn auth_header() -> String {
        format!("Basic {}", STANDARD.encode("dmpool:dmpool"))
    }

    #[tokio::test]
    async fn test_get_block_count_sends_authenticated_request() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(path("/"))
            .and(header("Authorization", auth_header().as_str()))
            .and(body_json(json!({
                "method": "getblockcount",
                "params": [],
                "id": 0
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "result": 850_000,
                "error": null,
                "id": 0
            })))
            .mount(&mock_server)
            .await;

        let client = BitcoinRpcClient::new(&config(&mock_server.uri())).unwrap();
        assert_eq!(client.get_block_count().await.unwrap(), 850_000);
    }

    #[tokio::test]
    async fn test_unknown_wallet_transaction() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500).set_body_json(json!({
                "result": null,
                "error": {
                    "code": -5,
                    "message": "Invalid or non-wallet transaction id"
                },
                "id": 0
            })))
            .mount(&mock_server)
            .await;

        let client = BitcoinRpcClient::new(&config(&mock_server.uri())).unwrap();
        let status = client
            .get_wallet_transaction(&"ab".repeat(32))
            .await
            .unwrap();
        assert_eq!(status, WalletTxStatus::Unknown);
    }

    #[tokio::test]
    async fn test_mined_transaction_found_without_txindex() {
        let mock_server = MockServer::start().await;
        let txid = "ab".repeat(32);

        // getrawtransaction needs -txindex once a transaction leaves the mempool
        Mock::given(method("POST"))
            .and(body_partial_json(json!({ "method": "getrawtransaction" })))
            .respond_with(ResponseTemplate::new(500).set_body_json(json!({
                "result": null,
                "error": {
                    "code": -5,
                    "message": "No such mempool transaction. Use -txindex or provide a block hash"
                },
                "id": 0
            })))
            .mount(&mock_server)
            .await;
        Mock::given(method("POST"))
            .and(body_json(json!({
                "method": "gettransaction",
                "params": [txid],
                "id": 0
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "result": {
                    "amount": 0.0,
                    "fee": -0.00000418,
                    "confirmations": 3,
                    "blockhash": "11".repeat(32),
                    "blockheight": 900_000,
                    "txid": txid,
                    "walletconflicts": [],
                    "hex": "00"
                },
                "error": null,
                "id": 0
            })))
            .expect(1)
            .mount(&mock_server)
            .await;

        let client = BitcoinRpcClient::new(&config(&mock_server.uri())).unwrap();
        let status = client.get_wallet_transaction(&txid).await.unwrap();
        assert_eq!(status, WalletTxStatus::Confirmations(3));
    }

    #[tokio::test]
    async fn test_mempool_transaction_has_zero_confirmations() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "result": { "txid": "ab".repeat(32), "confirmations": 0, "trusted": true },
                "error": null,
                "id": 0
            })))
            .mount(&mock_server)
            .await;

        let client = BitcoinRpcClient::new(&config(&mock_server.uri())).unwrap();
        let status = client
            .get_wallet_transaction(&"ab".repeat(32))
            .await
            .unwrap();
        assert_eq!(status, WalletTxStatus::Confirmations(0));
    }

    #[tokio::test]
    async fn test_negative_confirmations_mean_conflicted() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "result": {
                    "txid": "ab".repeat(32),
                    "confirmations": -2,
                    "walletconflicts": ["cd".repeat(32)]
                },
                "error": null,
                "id": 0
            })))
            .mount(&mock_server)
            .await;

        let client = BitcoinRpcClient::new(&config(&mock_server.uri())).unwrap();
        let status = client
            .get_wallet_transaction(&"ab".repeat(32))
            .await
            .unwrap();
        assert_eq!(status, WalletTxStatus::Conflicted);
    }

    #[tokio::test]
    async fn test_warmup_error_is_unavailable() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500).set_body_json(json!({
                "result": null,
                "error": { "code": -28, "message": "Loading block index..." },
                "id": 0
            })))
            .mount(&mock_server)
            .await;

        let client = BitcoinRpcClient::new(&BitcoinRpcConfig {
            max_retries: 0,
            ..config(&mock_server.uri())
        })
        .unwrap();
        let err = client
            .get_wallet_transaction(&"ab".repeat(32))
            .await
            .unwrap_err();
        assert!(err.is_unavailable());
        assert_eq!(err.rpc_code(), Some(-28));
    }

    #[tokio::test]
    async fn test_send_raw_transaction_is_not_retried() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503).set_body_string("Service Unavailable"))
            .expect(1)
            .mount(&mock_server)
            .await;

        let client = BitcoinRpcClient::new(&config(&mock_server.uri())).unwrap();
        let result = client.send_raw_transaction("0200").await;

        match result {
            Err(RpcError::Http { status_code, .. }) => assert_eq!(status_code, 503),
            other => panic!("Expected HTTP error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_read_calls_retry_until_success() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .and(body_json(json!({ "method": "getblockcount", "params": [], "id": 0 })))
            .respond_with(ResponseTemplate::new(503).set_body_string("warming up"))
            .expect(1)
            .mount(&mock_server)
            .await;
        Mock::given(method("POST"))
            .and(body_json(json!({ "method": "getblockcount", "params": [], "id": 1 })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "result": 42,
                "error": null,
                "id": 1
            })))
            .expect(1)
            .mount(&mock_server)
            .await;

        let client = BitcoinRpcClient::new(&config(&mock_server.uri())).unwrap();
        assert_eq!(client.get_block_count().await.unwrap(), 42);
    }

    #[tokio::test]
    async fn test_get_block_extracts_coinbase_outputs() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "result": {
                    "hash": "11".repeat(32),
                    "height": 900_000,
                    "time": 1_750_000_000,
                    "tx": [
                        {
                            "txid": "22".repeat(32),
                            "vout": [
                                {
                                    "value": 3.125,
                                    "n": 0,
                                    "scriptPubKey": { "address": "bcrt1qpool", "hex": "0014" }
                                },
                                {
                                    "value": 0.0,
                                    "n": 1,
                                    "scriptPubKey": { "hex": "6a24aa21a9ed" }
                                }
                            ]
                        },
                        { "txid": "33".repeat(32), "vout": [] }
                    ]
                },
                "error": null,
                "id": 0
            })))
            .mount(&mock_server)
            .await;

        let client = BitcoinRpcClient::new(&config(&mock_server.uri())).unwrap();
        let block = client.get_block(&"11".repeat(32)).await.unwrap();

        assert_eq!(block.height, 900_000);
        assert_eq!(block.time, 1_750_000_000);
        assert_eq!(block.coinbase_outputs.len(), 2);
        assert_eq!(
            block.reward_to(&["bcrt1qpool".to_string()]),
            Amount::from_sat(312_500_000)
        );
    }

    #[tokio::test]
    async fn test_estimate_smart_fee_converts_to_sat_per_vbyte() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "result": { "feerate": 0.00012345, "blocks": 6 },
                "error": null,
                "id": 0
            })))
            .mount(&mock_server)
            .await;

        let client = BitcoinRpcClient::new(&config(&mock_server.uri())).unwrap();
        // 12345 sat/kvB rounds up to 13 sat/vB
        assert_eq!(client.estimate_smart_fee(6).await.unwrap(), Some(13));
    }

    #[tokio::test]
    async fn test_estimate_smart_fee_without_estimate() {
        let mock_server = MockServer::start().await;

        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "result": { "errors": ["Insufficient data or no feerate found"], "blocks": 0 },
                "error": null,
                "id": 0
            })))
            .mount(&mock_server)
            .await;

        let client = BitcoinRpcClient::new(&config(&mock_server.uri())).unwrap();
        assert_eq!(client.estimate_smart_fee(6).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_connection_refused_is_unavailable() {
        // Nothing listens on port 9 locally
        let client = BitcoinRpcClient::new(&BitcoinRpcConfig {
            max_retries: 0,
            ..config("http://127.0.0.1:9")
        })
        .unwrap();
        let err = client.get_block_count().await.unwrap_err();
        assert!(err.is_unavailable());
        assert!(!err.is_unknown_outcome());
    }
}
