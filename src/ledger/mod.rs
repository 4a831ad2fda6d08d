// Balance ledger for DMPool
// Authoritative per-miner unpaid balances in satoshis

use crate::error::LedgerError;
use crate::store::{LedgerState, LedgerStore};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

/// Unpaid balance of one miner
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MinerBalance {
    pub address: String,
    pub balance_satoshis: u64,
    pub total_earned_satoshis: u64,
    /// Sum of confirmed payouts
    pub total_paid_satoshis: u64,
    pub updated_at: DateTime<Utc>,
}

impl MinerBalance {
    fn new(address: &str, now: DateTime<Utc>) -> Self {
        Self {
            address: address.to_string(),
            balance_satoshis: 0,
            total_earned_satoshis: 0,
            total_paid_satoshis: 0,
            updated_at: now,
        }
    }

    fn touch(&mut self, now: DateTime<Utc>) {
        self.updated_at = self.updated_at.max(now);
    }
}

/// Pool revenue accrued from fees and rounding remainders
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolAccount {
    pub fee_accrued_satoshis: u64,
    pub remainder_accrued_satoshis: u64,
}

/// Balance mutations. Only callable inside a store transaction.
impl LedgerState {
    /// Add earnings to a miner's balance
    pub fn credit_balance(
        &mut self,
        address: &str,
        amount: u64,
        now: DateTime<Utc>,
    ) -> Result<(), LedgerError> {
        let entry = self
            .balances
            .entry(address.to_string())
            .or_insert_with(|| MinerBalance::new(address, now));
        entry.balance_satoshis = entry
            .balance_satoshis
            .checked_add(amount)
            .ok_or_else(|| LedgerError::Overflow(address.to_string()))?;
        entry.total_earned_satoshis = entry
            .total_earned_satoshis
            .checked_add(amount)
            .ok_or_else(|| LedgerError::Overflow(address.to_string()))?;
        entry.touch(now);
        Ok(())
    }

    /// Credit for one block, applied at most once per (height, address)
    pub fn apply_block_credit(
        &mut self,
        height: u64,
        address: &str,
        amount: u64,
        now: DateTime<Utc>,
    ) -> Result<bool, LedgerError> {
        if self
            .applied_credits
            .contains(&(height, address.to_string()))
        {
            return Ok(false);
        }
        self.credit_balance(address, amount, now)?;
        self.applied_credits.insert((height, address.to_string()));
        Ok(true)
    }

    /// Remove funds from a miner's balance, failing rather than going negative
    pub fn debit_balance(
        &mut self,
        address: &str,
        amount: u64,
        now: DateTime<Utc>,
    ) -> Result<(), LedgerError> {
        let balance = self
            .balances
            .get(address)
            .map(|b| b.balance_satoshis)
            .unwrap_or(0);
        let remaining =
            balance
                .checked_sub(amount)
                .ok_or_else(|| LedgerError::InsufficientBalance {
                    address: address.to_string(),
                    balance,
                    requested: amount,
                })?;
        if let Some(entry) = self.balances.get_mut(address) {
            entry.balance_satoshis = remaining;
            entry.touch(now);
        }
        Ok(())
    }

    /// Give back a debit whose payout failed. Earnings are not counted again.
    pub fn restore_balance(
        &mut self,
        address: &str,
        amount: u64,
        now: DateTime<Utc>,
    ) -> Result<(), LedgerError> {
        let entry = self
            .balances
            .entry(address.to_string())
            .or_insert_with(|| MinerBalance::new(address, now));
        entry.balance_satoshis = entry
            .balance_satoshis
            .checked_add(amount)
            .ok_or_else(|| LedgerError::Overflow(address.to_string()))?;
        entry.touch(now);
        Ok(())
    }

    /// Record a confirmed payout against the miner's lifetime totals
    pub fn record_paid(
        &mut self,
        address: &str,
        amount: u64,
        now: DateTime<Utc>,
    ) -> Result<(), LedgerError> {
        let entry = self
            .balances
            .entry(address.to_string())
            .or_insert_with(|| MinerBalance::new(address, now));
        entry.total_paid_satoshis = entry
            .total_paid_satoshis
            .checked_add(amount)
            .ok_or_else(|| LedgerError::Overflow(address.to_string()))?;
        entry.touch(now);
        Ok(())
    }

    pub fn accrue_pool(&mut self, fee: u64, remainder: u64) -> Result<(), LedgerError> {
        self.pool.fee_accrued_satoshis = self
            .pool
            .fee_accrued_satoshis
            .checked_add(fee)
            .ok_or_else(|| LedgerError::Overflow("pool fee".to_string()))?;
        self.pool.remainder_accrued_satoshis = self
            .pool
            .remainder_accrued_satoshis
            .checked_add(remainder)
            .ok_or_else(|| LedgerError::Overflow("pool remainder".to_string()))?;
        Ok(())
    }

    pub fn balance_of(&self, address: &str) -> u64 {
        self.balances
            .get(address)
            .map(|b| b.balance_satoshis)
            .unwrap_or(0)
    }
}

/// Handle for balance reads and standalone credit/debit
#[derive(Clone)]
pub struct Ledger {
    store: Arc<LedgerStore>,
}

impl Ledger {
    pub fn new(store: Arc<LedgerStore>) -> Self {
        Self { store }
    }

    pub async fn credit(&self, address: &str, amount: u64) -> Result<(), LedgerError> {
        self.store
            .transact(|state| state.credit_balance(address, amount, Utc::now()))
            .await?;
        debug!("Credited {} sat to {}", amount, address);
        Ok(())
    }

    pub async fn debit(&self, address: &str, amount: u64) -> Result<(), LedgerError> {
        self.store
            .transact(|state| state.debit_balance(address, amount, Utc::now()))
            .await?;
        debug!("Debited {} sat from {}", amount, address);
        Ok(())
    }

    pub async fn get_balance(&self, address: &str) -> Option<MinerBalance> {
        self.store
            .read(|state| state.balances.get(address).cloned())
            .await
    }

    /// All balances, largest first
    pub async fn list_balances(&self) -> Vec<MinerBalance> {
        let mut balances = self
            .store
            .read(|state| state.balances.values().cloned().collect::<Vec<_>>())
            .await;
        balances.sort_by(|a, b| {
            b.balance_satoshis
                .cmp(&a.balance_satoshis)
                .then_with(|| a.address.cmp(&b.address))
        });
        balances
    }

    pub async fn pool_account(&self) -> PoolAccount {
        self.store.read(|state| state.pool.clone()).await
    }
}
