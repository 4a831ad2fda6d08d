// In-memory bitcoin node for DMPool tests
// Builds and tracks real regtest transactions without a running bitcoind

use crate::node::{
    BlockSummary, BlockchainInfo, CoinbaseOutput, NodeRpc, OutPointRef, RpcError,
    SignedTransaction, TxOutput, UnspentOutput, WalletTxStatus,
};
use async_trait::async_trait;
use bitcoin::absolute::LockTime;
use bitcoin::address::NetworkUnchecked;
use bitcoin::consensus::encode::{deserialize_hex, serialize_hex};
use bitcoin::transaction::Version;
use bitcoin::{
    Address, Amount, Network, OutPoint, ScriptBuf, Sequence, Transaction, TxIn, TxOut, Txid,
    Witness,
};
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

pub const POOL_ADDRESS: &str = "bcrt1qf063yte5g42v2w7796ace54hu0gkqzkkf9pxha";
pub const CHANGE_ADDRESS: &str = "bcrt1qm0qmfjgqlljg646mtkjuvwqyqyjlvhdsee0ajh";
pub const MINER_ADDRESSES: [&str; 3] = [
    "bcrt1qpp876z9e0zh56lgedf6yd2rttqqfucmtyyuhdx",
    "bcrt1qu5kec5yv2q35wdzd3sr6mywt6crg4lr4ktg0zu",
    "bcrt1quaae4xhfuv9sm0dk75g2ye80nhncz5qa7anql0",
];

/// How the fake node answers `sendrawtransaction`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendBehavior {
    Accept,
    /// Accepts the transaction but the response is lost
    AcceptThenTimeout,
    /// Times out without ever seeing the transaction
    Timeout,
    Reject { code: i32, message: String },
}

struct FakeChain {
    blocks: Vec<BlockSummary>,
    wallet: Vec<UnspentOutput>,
    mempool: BTreeMap<String, Transaction>,
    /// Mined transactions and their depth
    confirmed: HashMap<String, u32>,
    /// Wallet UTXOs each accepted transaction spent
    spent: HashMap<String, Vec<UnspentOutput>>,
    conflicted: HashSet<String>,
    /// Error returned by `gettransaction` while set
    lookup_error: Option<(i32, String)>,
    unavailable: bool,
    send_behavior: SendBehavior,
    fee_rate: Option<u64>,
    sign_complete: bool,
    send_calls: usize,
    next_funding: u64,
}

fn sha256_hex(data: &[u8]) -> String {
    format!("{:x}", Sha256::digest(data))
}

fn rpc_error(code: i32, message: impl Into<String>) -> RpcError {
    RpcError::Rpc {
        code,
        message: message.into(),
    }
}

fn parse_regtest(address: &str) -> Result<Address, RpcError> {
    Address::<NetworkUnchecked>::from_str(address)
        .map_err(|e| rpc_error(-5, format!("Invalid address {address}: {e}")))?
        .require_network(Network::Regtest)
        .map_err(|e| rpc_error(-5, format!("Wrong network for {address}: {e}")))
}

/// Regtest node with a single wallet paying change to `CHANGE_ADDRESS`
pub struct FakeNode {
    chain: Mutex<FakeChain>,
}

impl Default for FakeNode {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeNode {
    pub fn new() -> Self {
        Self {
            chain: Mutex::new(FakeChain {
                blocks: Vec::new(),
                wallet: Vec::new(),
                mempool: BTreeMap::new(),
                confirmed: HashMap::new(),
                spent: HashMap::new(),
                conflicted: HashSet::new(),
                lookup_error: None,
                unavailable: false,
                send_behavior: SendBehavior::Accept,
                fee_rate: Some(2),
                sign_complete: true,
                send_calls: 0,
                next_funding: 0,
            }),
        }
    }

    fn chain(&self) -> MutexGuard<'_, FakeChain> {
        self.chain.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append a block, optionally with a coinbase output. Mempool
    /// transactions are mined into it.
    pub fn mine_block(&self, coinbase: Option<(&str, Amount)>, time: DateTime<Utc>) -> String {
        let mut chain = self.chain();
        let height = chain.blocks.len() as u64;
        let hash = sha256_hex(format!("block-{height}").as_bytes());
        let coinbase_outputs = coinbase
            .map(|(address, value)| {
                vec![CoinbaseOutput {
                    value,
                    address: Some(address.to_string()),
                }]
            })
            .unwrap_or_default();
        chain.blocks.push(BlockSummary {
            hash: hash.clone(),
            height,
            time: time.timestamp(),
            coinbase_outputs,
        });

        for depth in chain.confirmed.values_mut() {
            *depth += 1;
        }
        let mined: Vec<String> = chain.mempool.keys().cloned().collect();
        for txid in mined {
            chain.mempool.remove(&txid);
            chain.confirmed.insert(txid, 1);
        }
        for utxo in chain.wallet.iter_mut() {
            utxo.confirmations += 1;
        }
        hash
    }

    pub fn mine_blocks(&self, count: usize) {
        for _ in 0..count {
            self.mine_block(None, Utc::now());
        }
    }

    /// Add a confirmed wallet UTXO
    pub fn fund_wallet(&self, amount: Amount) -> OutPointRef {
        let mut chain = self.chain();
        chain.next_funding += 1;
        let txid = sha256_hex(format!("funding-{}", chain.next_funding).as_bytes());
        let utxo = UnspentOutput {
            txid,
            vout: 0,
            address: Some(CHANGE_ADDRESS.to_string()),
            amount,
            confirmations: 6,
            spendable: true,
        };
        let outpoint = utxo.outpoint();
        chain.wallet.push(utxo);
        outpoint
    }

    pub fn wallet_balance(&self) -> Amount {
        self.chain().wallet.iter().map(|u| u.amount).sum()
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.chain().unavailable = unavailable;
    }

    pub fn set_send_behavior(&self, behavior: SendBehavior) {
        self.chain().send_behavior = behavior;
    }

    pub fn set_fee_rate(&self, sat_per_vb: Option<u64>) {
        self.chain().fee_rate = sat_per_vb;
    }

    pub fn set_sign_complete(&self, complete: bool) {
        self.chain().sign_complete = complete;
    }

    pub fn send_calls(&self) -> usize {
        self.chain().send_calls
    }

    pub fn in_mempool(&self, txid: &str) -> bool {
        self.chain().mempool.contains_key(txid)
    }

    /// Forget a transaction, as after a reorg or mempool eviction. Its
    /// inputs become spendable again and its change disappears.
    pub fn drop_transaction(&self, txid: &str) {
        let mut chain = self.chain();
        chain.mempool.remove(txid);
        chain.confirmed.remove(txid);
        chain.wallet.retain(|u| u.txid != txid);
        if let Some(inputs) = chain.spent.remove(txid) {
            chain.wallet.extend(inputs);
        }
    }

    /// A conflicting transaction spending the same inputs was mined
    pub fn conflict_transaction(&self, txid: &str) {
        let mut chain = self.chain();
        chain.mempool.remove(txid);
        chain.confirmed.remove(txid);
        chain.wallet.retain(|u| u.txid != txid);
        chain.spent.remove(txid);
        chain.conflicted.insert(txid.to_string());
    }

    /// Put a previously dropped transaction back into the mempool
    pub fn reinsert_transaction(&self, hex: &str) {
        if let Ok(tx) = deserialize_hex::<Transaction>(hex) {
            let mut chain = self.chain();
            let _ = Self::accept(&mut chain, tx);
        }
    }

    /// Make `gettransaction` fail with an RPC error until cleared
    pub fn set_lookup_error(&self, error: Option<(i32, &str)>) {
        self.chain().lookup_error = error.map(|(code, message)| (code, message.to_string()));
    }

    /// Transactions in the mempool that spend `outpoint`
    pub fn spenders_of(&self, outpoint: &OutPointRef) -> Vec<String> {
        self.chain()
            .mempool
            .iter()
            .filter(|(_, tx)| {
                tx.input.iter().any(|input| {
                    input.previous_output.txid.to_string() == outpoint.txid
                        && input.previous_output.vout == outpoint.vout
                })
            })
            .map(|(txid, _)| txid.clone())
            .collect()
    }

    fn check_available(chain: &FakeChain) -> Result<(), RpcError> {
        if chain.unavailable {
            Err(RpcError::Connect("connection refused".to_string()))
        } else {
            Ok(())
        }
    }

    fn accept(chain: &mut FakeChain, tx: Transaction) -> Result<String, RpcError> {
        for input in &tx.input {
            let txid = input.previous_output.txid.to_string();
            let vout = input.previous_output.vout;
            if !chain
                .wallet
                .iter()
                .any(|u| u.txid == txid && u.vout == vout)
            {
                return Err(rpc_error(-25, "bad-txns-inputs-missingorspent"));
            }
        }
        let txid = tx.compute_txid().to_string();
        let mut spent = Vec::with_capacity(tx.input.len());
        for input in &tx.input {
            let prev_txid = input.previous_output.txid.to_string();
            let vout = input.previous_output.vout;
            chain.wallet.retain(|u| {
                let spends = u.txid == prev_txid && u.vout == vout;
                if spends {
                    spent.push(u.clone());
                }
                !spends
            });
        }
        chain.spent.insert(txid.clone(), spent);

        let change_script = parse_regtest(CHANGE_ADDRESS)?.script_pubkey();
        for (vout, output) in tx.output.iter().enumerate() {
            if output.script_pubkey == change_script {
                chain.wallet.push(UnspentOutput {
                    txid: txid.clone(),
                    vout: vout as u32,
                    address: Some(CHANGE_ADDRESS.to_string()),
                    amount: output.value,
                    confirmations: 0,
                    spendable: true,
                });
            }
        }
        chain.mempool.insert(txid.clone(), tx);
        Ok(txid)
    }
}

#[async_trait]
impl NodeRpc for FakeNode {
    async fn get_blockchain_info(&self) -> Result<BlockchainInfo, RpcError> {
        let chain = self.chain();
        Self::check_available(&chain)?;
        let blocks = chain.blocks.len().saturating_sub(1) as u64;
        Ok(BlockchainInfo {
            chain: "regtest".to_string(),
            blocks,
            headers: blocks,
            best_block_hash: chain
                .blocks
                .last()
                .map(|b| b.hash.clone())
                .unwrap_or_default(),
            initial_block_download: false,
        })
    }

    async fn get_block_count(&self) -> Result<u64, RpcError> {
        let chain = self.chain();
        Self::check_available(&chain)?;
        Ok(chain.blocks.len().saturating_sub(1) as u64)
    }

    async fn get_block_hash(&self, height: u64) -> Result<String, RpcError> {
        let chain = self.chain();
        Self::check_available(&chain)?;
        chain
            .blocks
            .get(height as usize)
            .map(|b| b.hash.clone())
            .ok_or_else(|| rpc_error(-8, "Block height out of range"))
    }

    async fn get_block(&self, hash: &str) -> Result<BlockSummary, RpcError> {
        let chain = self.chain();
        Self::check_available(&chain)?;
        chain
            .blocks
            .iter()
            .find(|b| b.hash == hash)
            .cloned()
            .ok_or_else(|| rpc_error(-5, "Block not found"))
    }

    async fn list_unspent(&self, min_confirmations: u32) -> Result<Vec<UnspentOutput>, RpcError> {
        let chain = self.chain();
        Self::check_available(&chain)?;
        Ok(chain
            .wallet
            .iter()
            .filter(|u| u.confirmations >= min_confirmations)
            .cloned()
            .collect())
    }

    async fn create_raw_transaction(
        &self,
        inputs: &[OutPointRef],
        outputs: &[TxOutput],
    ) -> Result<String, RpcError> {
        Self::check_available(&self.chain())?;
        let input = inputs
            .iter()
            .map(|input| {
                let txid = Txid::from_str(&input.txid)
                    .map_err(|e| rpc_error(-8, format!("Invalid txid: {e}")))?;
                Ok(TxIn {
                    previous_output: OutPoint::new(txid, input.vout),
                    script_sig: ScriptBuf::new(),
                    sequence: Sequence::ENABLE_RBF_NO_LOCKTIME,
                    witness: Witness::new(),
                })
            })
            .collect::<Result<Vec<_>, RpcError>>()?;
        let output = outputs
            .iter()
            .map(|output| {
                Ok(TxOut {
                    value: output.amount,
                    script_pubkey: parse_regtest(&output.address)?.script_pubkey(),
                })
            })
            .collect::<Result<Vec<_>, RpcError>>()?;

        let tx = Transaction {
            version: Version::TWO,
            lock_time: LockTime::ZERO,
            input,
            output,
        };
        Ok(serialize_hex(&tx))
    }

    async fn sign_raw_transaction_with_wallet(
        &self,
        hex: &str,
    ) -> Result<SignedTransaction, RpcError> {
        let complete = {
            let chain = self.chain();
            Self::check_available(&chain)?;
            chain.sign_complete
        };
        let mut tx: Transaction =
            deserialize_hex(hex).map_err(|e| rpc_error(-22, format!("TX decode failed: {e}")))?;
        if complete {
            for input in tx.input.iter_mut() {
                input.witness = Witness::from_slice(&[vec![0x30; 71], vec![0x02; 33]]);
            }
        }
        Ok(SignedTransaction {
            hex: serialize_hex(&tx),
            complete,
        })
    }

    async fn send_raw_transaction(&self, hex: &str) -> Result<String, RpcError> {
        let mut chain = self.chain();
        Self::check_available(&chain)?;
        chain.send_calls += 1;

        let tx: Transaction =
            deserialize_hex(hex).map_err(|e| rpc_error(-22, format!("TX decode failed: {e}")))?;
        let txid = tx.compute_txid().to_string();
        if chain.confirmed.contains_key(&txid) {
            return Err(rpc_error(-27, "Transaction already in block chain"));
        }
        if chain.mempool.contains_key(&txid) {
            return Ok(txid);
        }

        match chain.send_behavior.clone() {
            SendBehavior::Accept => Self::accept(&mut chain, tx),
            SendBehavior::AcceptThenTimeout => {
                Self::accept(&mut chain, tx)?;
                Err(RpcError::Timeout(Duration::from_secs(30)))
            }
            SendBehavior::Timeout => Err(RpcError::Timeout(Duration::from_secs(30))),
            SendBehavior::Reject { code, message } => Err(rpc_error(code, message)),
        }
    }

    async fn get_wallet_transaction(&self, txid: &str) -> Result<WalletTxStatus, RpcError> {
        let chain = self.chain();
        Self::check_available(&chain)?;
        if let Some((code, message)) = &chain.lookup_error {
            return Err(rpc_error(*code, message.clone()));
        }
        if chain.mempool.contains_key(txid) {
            return Ok(WalletTxStatus::Confirmations(0));
        }
        if chain.conflicted.contains(txid) {
            return Ok(WalletTxStatus::Conflicted);
        }
        Ok(chain
            .confirmed
            .get(txid)
            .map(|depth| WalletTxStatus::Confirmations(*depth))
            .unwrap_or(WalletTxStatus::Unknown))
    }

    async fn estimate_smart_fee(&self, _conf_target: u32) -> Result<Option<u64>, RpcError> {
        let chain = self.chain();
        Self::check_available(&chain)?;
        Ok(chain.fee_rate)
    }
}
