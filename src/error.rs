// Error taxonomy for DMPool
// Typed errors for the ledger, payout and distribution paths

use crate::node::RpcError;
use crate::payout::PayoutStatus;
use crate::shares::ShareStoreError;
use crate::store::StoreError;
use uuid::Uuid;

/// Balance ledger errors
#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    /// A debit larger than the tracked balance. Never permitted.
    #[error("Insufficient balance for {address}: balance {balance} sat, requested {requested} sat")]
    InsufficientBalance {
        address: String,
        balance: u64,
        requested: u64,
    },
    #[error("Balance arithmetic overflow for {0}")]
    Overflow(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Payout errors
#[derive(Debug, thiserror::Error)]
pub enum PayoutError {
    /// Wallet UTXOs cannot cover amount plus fee; retried once funds accrue
    #[error("Insufficient funds: need {required} sat, wallet has {available} sat spendable")]
    InsufficientFunds { required: u64, available: u64 },
    #[error(transparent)]
    InsufficientBalance(LedgerError),
    /// Node unreachable; retried on the next run
    #[error("Bitcoin node unavailable: {0}")]
    RpcUnavailable(RpcError),
    /// The node may have accepted the transaction; reconcile before any resend
    #[error("Broadcast outcome unknown for {txid}: {reason}")]
    BroadcastUnknown { txid: String, reason: String },
    /// `sendrawtransaction` refused the candidate
    #[error("Node rejected transaction: {0}")]
    Rejected(RpcError),
    /// A transaction spending the candidate's inputs is in the chain
    #[error("Transaction {0} conflicts with a transaction in the chain")]
    Conflicted(String),
    #[error("Bitcoin node error: {0}")]
    Rpc(RpcError),
    /// A broadcast payout vanished from the node's view
    #[error("Payout {0} transaction no longer known to the node")]
    ReorgDetected(Uuid),
    #[error("Payout not found: {0}")]
    NotFound(Uuid),
    #[error("Payout {id} is {status}, cannot {action}")]
    InvalidTransition {
        id: Uuid,
        status: PayoutStatus,
        action: &'static str,
    },
    #[error("Invalid payout address '{0}'")]
    InvalidAddress(String),
    #[error("Invalid payout amount: {0}")]
    InvalidAmount(u64),
    #[error("Fee {fee} sat exceeds configured maximum {max} sat")]
    FeeTooHigh { fee: u64, max: u64 },
    #[error("Wallet returned an incompletely signed transaction")]
    SigningIncomplete,
    #[error("Invalid transaction from node: {0}")]
    InvalidTransaction(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl From<LedgerError> for PayoutError {
    fn from(e: LedgerError) -> Self {
        match e {
            LedgerError::Store(e) => PayoutError::Store(e),
            other => PayoutError::InsufficientBalance(other),
        }
    }
}

impl From<RpcError> for PayoutError {
    fn from(e: RpcError) -> Self {
        if e.is_unavailable() {
            PayoutError::RpcUnavailable(e)
        } else {
            PayoutError::Rpc(e)
        }
    }
}

/// Reward distributor errors
#[derive(Debug, thiserror::Error)]
pub enum DistributorError {
    #[error("Bitcoin node error: {0}")]
    Rpc(#[from] RpcError),
    #[error("Share store error: {0}")]
    Shares(#[from] ShareStoreError),
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("Pool fee {0} bps exceeds 100%")]
    InvalidFee(u16),
    #[error("Inconsistent PPLNS window: {0}")]
    InvalidWindow(String),
}
