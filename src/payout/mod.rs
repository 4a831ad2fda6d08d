// Payout manager for DMPool
// Turns eligible balances into on-chain payouts built from pool wallet UTXOs

pub mod selection;

use crate::alert::{Alert, AlertLevel, AlertManager};
use crate::auth::AdminCapability;
use crate::config::{Config, parse_address};
use crate::error::PayoutError;
use crate::node::{
    NodeRpc, OutPointRef, RPC_VERIFY_ALREADY_IN_CHAIN, TxOutput, UnspentOutput, WalletTxStatus,
};
use crate::store::{LedgerState, LedgerStore};
use bitcoin::consensus::encode::deserialize_hex;
use bitcoin::{Amount, Network, Transaction};
use chrono::{DateTime, TimeDelta, Utc};
use selection::select_spending;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

const DEFAULT_LIST_LIMIT: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PayoutStatus {
    Pending,
    Broadcast,
    Confirmed,
    Failed,
}

impl std::fmt::Display for PayoutStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            PayoutStatus::Pending => "pending",
            PayoutStatus::Broadcast => "broadcast",
            PayoutStatus::Confirmed => "confirmed",
            PayoutStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

impl FromStr for PayoutStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pending" => Ok(PayoutStatus::Pending),
            "broadcast" => Ok(PayoutStatus::Broadcast),
            "confirmed" => Ok(PayoutStatus::Confirmed),
            "failed" => Ok(PayoutStatus::Failed),
            other => Err(format!("unknown payout status '{other}'")),
        }
    }
}

/// One payout to one miner
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Payout {
    pub id: Uuid,
    pub address: String,
    pub amount_satoshis: u64,
    /// Network fee, paid by the pool
    pub fee_satoshis: u64,
    pub status: PayoutStatus,
    /// While Pending: txid of the signed candidate kept for reconciliation
    pub txid: Option<String>,
    pub raw_tx: Option<String>,
    /// Wallet outpoints the candidate spends
    pub inputs: Vec<OutPointRef>,
    /// Inputs of dropped candidates. A rebuild spends one of them if it is
    /// still unspent, so at most one version can confirm.
    #[serde(default)]
    pub superseded_inputs: Vec<OutPointRef>,
    pub created_at: DateTime<Utc>,
    pub broadcast_at: Option<DateTime<Utc>>,
    pub confirmed_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
    pub confirmations: u32,
    /// Failed broadcast attempts
    pub attempts: u32,
    pub last_error: Option<String>,
    pub last_attempt_at: Option<DateTime<Utc>>,
    /// Reported to the alert sink once; cleared by an admin reset
    pub escalated: bool,
    /// Consecutive checks the node did not know the broadcast transaction
    pub missing_checks: u32,
    /// The debit was given back after failure
    pub reversed: bool,
}

impl Payout {
    fn new(address: &str, amount_satoshis: u64, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            address: address.to_string(),
            amount_satoshis,
            fee_satoshis: 0,
            status: PayoutStatus::Pending,
            txid: None,
            raw_tx: None,
            inputs: Vec::new(),
            superseded_inputs: Vec::new(),
            created_at: now,
            broadcast_at: None,
            confirmed_at: None,
            failed_at: None,
            confirmations: 0,
            attempts: 0,
            last_error: None,
            last_attempt_at: None,
            escalated: false,
            missing_checks: 0,
            reversed: false,
        }
    }

    fn clear_candidate(&mut self) {
        self.txid = None;
        self.raw_tx = None;
        for input in self.inputs.drain(..) {
            if !self.superseded_inputs.contains(&input) {
                self.superseded_inputs.push(input);
            }
        }
    }
}

/// Payout bookkeeping inside store transactions
impl LedgerState {
    pub fn payout_mut(&mut self, id: Uuid) -> Result<&mut Payout, PayoutError> {
        self.payouts.get_mut(&id).ok_or(PayoutError::NotFound(id))
    }

    /// Outpoints held by Pending candidates other than `except`
    pub fn reserved_inputs(&self, except: Uuid) -> BTreeSet<OutPointRef> {
        self.payouts
            .values()
            .filter(|p| p.status == PayoutStatus::Pending && p.id != except)
            .flat_map(|p| p.inputs.iter().cloned())
            .collect()
    }

    /// Outpoints an earlier signed transaction paying `payout.address`
    /// spent: dropped candidates of this payout and reversed failed payouts
    pub fn previous_inputs(&self, payout: &Payout) -> Vec<OutPointRef> {
        let failed = self
            .payouts
            .values()
            .filter(|p| {
                p.address == payout.address && p.status == PayoutStatus::Failed && p.reversed
            })
            .flat_map(|p| p.inputs.iter());
        let mut previous: Vec<OutPointRef> = Vec::new();
        for input in payout.superseded_inputs.iter().chain(failed) {
            if !previous.contains(input) {
                previous.push(input.clone());
            }
        }
        previous
    }

    pub fn has_pending_payout(&self, address: &str) -> bool {
        self.payouts
            .values()
            .any(|p| p.status == PayoutStatus::Pending && p.address == address)
    }
}

/// Filter for payout history reads
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PayoutQuery {
    pub address: Option<String>,
    pub status: Option<PayoutStatus>,
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PayoutRunReport {
    pub reconciled: usize,
    pub created: usize,
    pub broadcast: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PayoutStats {
    pub pending: usize,
    pub broadcast: usize,
    pub confirmed: usize,
    pub failed: usize,
    pub escalated: usize,
    pub in_flight_satoshis: u64,
    pub confirmed_satoshis: u64,
    pub fees_paid_satoshis: u64,
    pub outstanding_balance_satoshis: u64,
}

#[derive(Debug, Clone)]
pub struct PayoutSettings {
    pub network: Network,
    pub min_payout_satoshis: u64,
    pub change_address: String,
    pub min_utxo_confirmations: u32,
    pub fee_conf_target: u32,
    pub fallback_fee_sat_per_vb: u64,
    pub max_fee_satoshis: u64,
    pub max_broadcast_attempts: u32,
}

impl From<&Config> for PayoutSettings {
    fn from(config: &Config) -> Self {
        Self {
            network: config.network,
            min_payout_satoshis: config.payout.min_payout_satoshis,
            change_address: config.payout.change_address.clone(),
            min_utxo_confirmations: config.payout.min_utxo_confirmations,
            fee_conf_target: config.payout.fee_conf_target,
            fallback_fee_sat_per_vb: config.payout.fallback_fee_sat_per_vb,
            max_fee_satoshis: config.payout.max_fee_satoshis,
            max_broadcast_attempts: config.payout.max_broadcast_attempts,
        }
    }
}

pub struct PayoutManager {
    store: Arc<LedgerStore>,
    node: Arc<dyn NodeRpc>,
    alerts: Arc<AlertManager>,
    settings: PayoutSettings,
    /// Serializes every broadcast so UTXO selection never races
    broadcast_lock: Mutex<()>,
    run_lock: Mutex<()>,
}

impl PayoutManager {
    pub fn new(
        store: Arc<LedgerStore>,
        node: Arc<dyn NodeRpc>,
        alerts: Arc<AlertManager>,
        settings: PayoutSettings,
    ) -> Self {
        Self {
            store,
            node,
            alerts,
            settings,
            broadcast_lock: Mutex::new(()),
            run_lock: Mutex::new(()),
        }
    }

    pub fn settings(&self) -> &PayoutSettings {
        &self.settings
    }

    /// Addresses whose balance reaches their threshold (per-miner override,
    /// else `threshold`) and that have no outstanding Pending payout
    pub async fn select_eligible(&self, threshold: u64) -> Vec<String> {
        self.store
            .read(|state| {
                state
                    .balances
                    .values()
                    .filter(|b| b.balance_satoshis > 0)
                    .filter(|b| {
                        let required = state
                            .threshold_overrides
                            .get(&b.address)
                            .copied()
                            .unwrap_or(threshold);
                        b.balance_satoshis >= required
                    })
                    .filter(|b| !state.has_pending_payout(&b.address))
                    .map(|b| b.address.clone())
                    .collect()
            })
            .await
    }

    /// Debit the balance and record a Pending payout as one unit
    pub async fn create_payout(&self, address: &str, amount: u64) -> Result<Payout, PayoutError> {
        if amount == 0 {
            return Err(PayoutError::InvalidAmount(amount));
        }
        parse_address(address, self.settings.network)
            .map_err(|_| PayoutError::InvalidAddress(address.to_string()))?;

        let payout = self
            .store
            .transact(|state| {
                let now = Utc::now();
                state.debit_balance(address, amount, now)?;
                let payout = Payout::new(address, amount, now);
                state.payouts.insert(payout.id, payout.clone());
                Ok::<_, PayoutError>(payout)
            })
            .await?;
        info!(
            "Created payout {} of {} sat to {}",
            payout.id, amount, address
        );
        Ok(payout)
    }

    /// Drive a Pending payout to Broadcast. An existing candidate is
    /// reconciled against the node before anything is resent.
    pub async fn broadcast(&self, id: Uuid) -> Result<Payout, PayoutError> {
        let _guard = self.broadcast_lock.lock().await;
        let payout = self.get_payout(id).await.ok_or(PayoutError::NotFound(id))?;
        if payout.status != PayoutStatus::Pending {
            return Err(PayoutError::InvalidTransition {
                id,
                status: payout.status,
                action: "broadcast",
            });
        }

        let result = match (&payout.txid, &payout.raw_tx) {
            (Some(txid), Some(raw_tx)) => self.reconcile_candidate(id, txid, raw_tx).await,
            _ => self.build_and_send(&payout).await,
        };

        match result {
            Ok(payout) => Ok(payout),
            Err(e) => {
                self.record_failure(id, &e).await?;
                Err(e)
            }
        }
    }

    async fn reconcile_candidate(
        &self,
        id: Uuid,
        txid: &str,
        raw_tx: &str,
    ) -> Result<Payout, PayoutError> {
        // A failed lookup is no verdict; the candidate stays as it is
        match self.node.get_wallet_transaction(txid).await? {
            WalletTxStatus::Confirmations(confirmations) => {
                info!(
                    "Payout {} transaction {} already known to node ({} confirmations)",
                    id, txid, confirmations
                );
                self.mark_broadcast(id, confirmations).await
            }
            WalletTxStatus::Conflicted => Err(PayoutError::Conflicted(txid.to_string())),
            WalletTxStatus::Unknown => {
                debug!("Payout {} candidate {} unknown to node, resending", id, txid);
                self.send(id, txid, raw_tx).await
            }
        }
    }

    async fn build_and_send(&self, payout: &Payout) -> Result<Payout, PayoutError> {
        let utxos = self
            .node
            .list_unspent(self.settings.min_utxo_confirmations)
            .await?;
        let reserved = self
            .store
            .read(|state| state.reserved_inputs(payout.id))
            .await;
        let spendable: Vec<UnspentOutput> = utxos
            .into_iter()
            .filter(|u| u.spendable && !reserved.contains(&u.outpoint()))
            .collect();

        let fee_rate = match self
            .node
            .estimate_smart_fee(self.settings.fee_conf_target)
            .await?
        {
            Some(rate) => rate,
            None => {
                debug!(
                    "No fee estimate, using fallback {} sat/vB",
                    self.settings.fallback_fee_sat_per_vb
                );
                self.settings.fallback_fee_sat_per_vb
            }
        };

        let previous = self
            .store
            .read(|state| state.previous_inputs(payout))
            .await;
        let must_spend = previous
            .iter()
            .find(|outpoint| spendable.iter().any(|u| u.outpoint() == **outpoint));
        if let Some(outpoint) = must_spend {
            debug!(
                "Payout {} rebuilds over previous input {}:{}",
                payout.id, outpoint.txid, outpoint.vout
            );
        }

        let selection =
            select_spending(&spendable, must_spend, payout.amount_satoshis, fee_rate)?;
        if selection.fee_satoshis > self.settings.max_fee_satoshis {
            return Err(PayoutError::FeeTooHigh {
                fee: selection.fee_satoshis,
                max: self.settings.max_fee_satoshis,
            });
        }

        let mut outputs = vec![TxOutput {
            address: payout.address.clone(),
            amount: Amount::from_sat(payout.amount_satoshis),
        }];
        if selection.change_satoshis > 0 {
            outputs.push(TxOutput {
                address: self.settings.change_address.clone(),
                amount: Amount::from_sat(selection.change_satoshis),
            });
        }
        let inputs: Vec<OutPointRef> = selection.inputs.iter().map(|u| u.outpoint()).collect();

        let unsigned = self.node.create_raw_transaction(&inputs, &outputs).await?;
        let signed = self.node.sign_raw_transaction_with_wallet(&unsigned).await?;
        if !signed.complete {
            return Err(PayoutError::SigningIncomplete);
        }
        let tx: Transaction = deserialize_hex(&signed.hex)
            .map_err(|e| PayoutError::InvalidTransaction(e.to_string()))?;
        let txid = tx.compute_txid().to_string();

        // Persist the candidate before the node can see it
        let id = payout.id;
        let fee = selection.fee_satoshis;
        let raw_tx = signed.hex;
        self.store
            .transact(|state| {
                let payout = state.payout_mut(id)?;
                payout.txid = Some(txid.clone());
                payout.raw_tx = Some(raw_tx.clone());
                payout.inputs = inputs;
                payout.fee_satoshis = fee;
                Ok::<_, PayoutError>(())
            })
            .await?;
        info!(
            "Payout {} signed as {} ({} inputs, fee {} sat, change {} sat)",
            id,
            txid,
            selection.inputs.len(),
            fee,
            selection.change_satoshis
        );

        self.send(id, &txid, &raw_tx).await
    }

    async fn send(&self, id: Uuid, txid: &str, raw_tx: &str) -> Result<Payout, PayoutError> {
        match self.node.send_raw_transaction(raw_tx).await {
            Ok(node_txid) => {
                if node_txid != txid {
                    warn!(
                        "Node reported txid {} for payout {}, expected {}",
                        node_txid, id, txid
                    );
                }
                self.mark_broadcast(id, 0).await
            }
            Err(e) if e.rpc_code() == Some(RPC_VERIFY_ALREADY_IN_CHAIN) => {
                info!("Payout {} transaction {} already in chain", id, txid);
                self.mark_broadcast(id, 0).await
            }
            Err(e) if e.is_unknown_outcome() => Err(PayoutError::BroadcastUnknown {
                txid: txid.to_string(),
                reason: e.to_string(),
            }),
            Err(e) if e.is_unavailable() => Err(PayoutError::RpcUnavailable(e)),
            Err(e) => Err(PayoutError::Rejected(e)),
        }
    }

    async fn mark_broadcast(&self, id: Uuid, confirmations: u32) -> Result<Payout, PayoutError> {
        let payout = self
            .store
            .transact(|state| {
                let payout = state.payout_mut(id)?;
                if payout.status != PayoutStatus::Pending {
                    return Err(PayoutError::InvalidTransition {
                        id,
                        status: payout.status,
                        action: "mark broadcast",
                    });
                }
                payout.status = PayoutStatus::Broadcast;
                payout.broadcast_at = Some(Utc::now());
                payout.confirmations = confirmations;
                payout.last_error = None;
                Ok(payout.clone())
            })
            .await?;
        info!(
            "Payout {} broadcast: {} sat to {} in {}",
            id,
            payout.amount_satoshis,
            payout.address,
            payout.txid.as_deref().unwrap_or("-")
        );
        Ok(payout)
    }

    /// Count a failed attempt; the payout stays Pending. Only a node
    /// verdict on the candidate itself drops it so the next attempt rebuilds.
    async fn record_failure(&self, id: Uuid, failure: &PayoutError) -> Result<(), PayoutError> {
        let clear = matches!(
            failure,
            PayoutError::Rejected(_) | PayoutError::Conflicted(_)
        );
        let max_attempts = self.settings.max_broadcast_attempts;
        let message = failure.to_string();

        let (payout, escalate) = self
            .store
            .transact(|state| {
                let payout = state.payout_mut(id)?;
                payout.attempts = payout.attempts.saturating_add(1);
                payout.last_error = Some(message.clone());
                payout.last_attempt_at = Some(Utc::now());
                if clear {
                    payout.clear_candidate();
                }
                let escalate = payout.attempts >= max_attempts && !payout.escalated;
                if escalate {
                    payout.escalated = true;
                }
                Ok::<_, PayoutError>((payout.clone(), escalate))
            })
            .await?;

        warn!(
            "Payout {} attempt {} failed: {}",
            id, payout.attempts, message
        );
        if escalate {
            error!(
                "Payout {} failed {} times, escalating; retries continue",
                id, payout.attempts
            );
            self.alerts
                .raise(
                    Alert::new(
                        AlertLevel::Critical,
                        "Payout broadcast failing",
                        format!(
                            "Payout {} of {} sat to {} failed {} attempts: {}",
                            id, payout.amount_satoshis, payout.address, payout.attempts, message
                        ),
                    )
                    .for_payout(id),
                )
                .await;
        }
        Ok(())
    }

    /// Reconcile or retry outstanding Pending payouts, oldest first
    pub async fn reconcile_pending(&self) -> PayoutRunReport {
        let mut report = PayoutRunReport::default();
        let pending = self
            .store
            .read(|state| {
                let mut pending: Vec<Payout> = state
                    .payouts
                    .values()
                    .filter(|p| p.status == PayoutStatus::Pending)
                    .cloned()
                    .collect();
                pending.sort_by_key(|p| p.created_at);
                pending
            })
            .await;

        for payout in pending {
            match self.broadcast(payout.id).await {
                Ok(_) => report.reconciled += 1,
                Err(e) => {
                    debug!("Pending payout {} still outstanding: {}", payout.id, e);
                    report.failed += 1;
                }
            }
        }
        report
    }

    /// Scheduled run: settle outstanding payouts, then pay every eligible balance in full
    pub async fn run_payouts(&self) -> PayoutRunReport {
        let _run = self.run_lock.lock().await;
        let mut report = self.reconcile_pending().await;

        for address in self.select_eligible(self.settings.min_payout_satoshis).await {
            let amount = self.store.read(|state| state.balance_of(&address)).await;
            let payout = match self.create_payout(&address, amount).await {
                Ok(payout) => payout,
                Err(e) => {
                    warn!("Could not create payout for {}: {}", address, e);
                    report.failed += 1;
                    continue;
                }
            };
            report.created += 1;
            match self.broadcast(payout.id).await {
                Ok(_) => report.broadcast += 1,
                Err(e) => {
                    warn!("Payout {} not broadcast: {}", payout.id, e);
                    report.failed += 1;
                }
            }
        }

        info!(
            "Payout run: {} reconciled, {} created, {} broadcast, {} failed",
            report.reconciled, report.created, report.broadcast, report.failed
        );
        report
    }

    /// Manual trigger
    pub async fn run_now(&self, capability: &AdminCapability) -> PayoutRunReport {
        info!("Manual payout run requested by {}", capability.subject());
        self.run_payouts().await
    }

    /// Set or clear a per-miner minimum payout threshold
    pub async fn set_threshold_override(
        &self,
        capability: &AdminCapability,
        address: &str,
        threshold_satoshis: Option<u64>,
    ) -> Result<(), PayoutError> {
        parse_address(address, self.settings.network)
            .map_err(|_| PayoutError::InvalidAddress(address.to_string()))?;
        self.store
            .transact(|state| {
                match threshold_satoshis {
                    Some(threshold) => {
                        state
                            .threshold_overrides
                            .insert(address.to_string(), threshold);
                    }
                    None => {
                        state.threshold_overrides.remove(address);
                    }
                }
                Ok::<_, PayoutError>(())
            })
            .await?;
        info!(
            "{} set payout threshold for {} to {:?}",
            capability.subject(),
            address,
            threshold_satoshis
        );
        Ok(())
    }

    /// Acknowledge an escalated Pending payout: clear its failure count so a
    /// further failure streak alerts again
    pub async fn reset_retries(
        &self,
        capability: &AdminCapability,
        id: Uuid,
    ) -> Result<Payout, PayoutError> {
        let payout = self
            .store
            .transact(|state| {
                let payout = state.payout_mut(id)?;
                if payout.status != PayoutStatus::Pending {
                    return Err(PayoutError::InvalidTransition {
                        id,
                        status: payout.status,
                        action: "reset retries",
                    });
                }
                payout.attempts = 0;
                payout.escalated = false;
                Ok(payout.clone())
            })
            .await?;
        info!("{} reset retries of payout {}", capability.subject(), id);
        Ok(payout)
    }

    pub async fn get_payout(&self, id: Uuid) -> Option<Payout> {
        self.store.read(|state| state.payouts.get(&id).cloned()).await
    }

    /// Newest first
    pub async fn list_payouts(&self, query: &PayoutQuery) -> Vec<Payout> {
        let limit = query.limit.unwrap_or(DEFAULT_LIST_LIMIT);
        self.store
            .read(|state| {
                let mut payouts: Vec<Payout> = state
                    .payouts
                    .values()
                    .filter(|p| query.address.as_ref().is_none_or(|a| *a == p.address))
                    .filter(|p| query.status.is_none_or(|s| s == p.status))
                    .cloned()
                    .collect();
                payouts.sort_by(|a, b| b.created_at.cmp(&a.created_at));
                payouts.truncate(limit);
                payouts
            })
            .await
    }

    /// Pending payouts older than `grace`, oldest first
    pub async fn stuck_payouts(&self, grace: TimeDelta) -> Vec<Payout> {
        let cutoff = Utc::now() - grace;
        self.store
            .read(|state| {
                let mut stuck: Vec<Payout> = state
                    .payouts
                    .values()
                    .filter(|p| p.status == PayoutStatus::Pending && p.created_at <= cutoff)
                    .cloned()
                    .collect();
                stuck.sort_by_key(|p| p.created_at);
                stuck
            })
            .await
    }

    pub async fn stats(&self) -> PayoutStats {
        self.store
            .read(|state| {
                let mut stats = PayoutStats::default();
                for payout in state.payouts.values() {
                    match payout.status {
                        PayoutStatus::Pending => {
                            stats.pending += 1;
                            stats.in_flight_satoshis += payout.amount_satoshis;
                        }
                        PayoutStatus::Broadcast => {
                            stats.broadcast += 1;
                            stats.in_flight_satoshis += payout.amount_satoshis;
                            stats.fees_paid_satoshis += payout.fee_satoshis;
                        }
                        PayoutStatus::Confirmed => {
                            stats.confirmed += 1;
                            stats.confirmed_satoshis += payout.amount_satoshis;
                            stats.fees_paid_satoshis += payout.fee_satoshis;
                        }
                        PayoutStatus::Failed => stats.failed += 1,
                    }
                    if payout.escalated {
                        stats.escalated += 1;
                    }
                }
                stats.outstanding_balance_satoshis =
                    state.balances.values().map(|b| b.balance_satoshis).sum();
                stats
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alert::LogAlertSink;
    use crate::auth::{ADMIN_ROLE, Authorizer};
    use crate::test_utils::{CHANGE_ADDRESS, FakeNode, MINER_ADDRESSES, SendBehavior};

    const SECRET: &str = "0123456789abcdef0123456789abcdef";

    struct Fixture {
        node: Arc<FakeNode>,
        store: Arc<LedgerStore>,
        alerts: Arc<AlertManager>,
        manager: PayoutManager,
    }

    fn settings() -> PayoutSettings {
        PayoutSettings {
            network: Network::Regtest,
            min_payout_satoshis: 10_000,
            change_address: CHANGE_ADDRESS.to_string(),
            min_utxo_confirmations: 1,
            fee_conf_target: 6,
            fallback_fee_sat_per_vb: 1,
            max_fee_satoshis: 100_000,
            max_broadcast_attempts: 3,
        }
    }

    fn fixture() -> Fixture {
        let node = Arc::new(FakeNode::new());
        let store = Arc::new(LedgerStore::in_memory());
        let alerts = Arc::new(AlertManager::new(Arc::new(LogAlertSink)));
        let manager = PayoutManager::new(store.clone(), node.clone(), alerts.clone(), settings());
        Fixture {
            node,
            store,
            alerts,
            manager,
        }
    }

    async fn credit(store: &LedgerStore, address: &str, amount: u64) {
        store
            .transact(|state| state.credit_balance(address, amount, Utc::now()))
            .await
            .unwrap();
    }

    fn admin() -> AdminCapability {
        let auth = Authorizer::new(SECRET);
        let token = auth
            .issue_token("operator", ADMIN_ROLE, TimeDelta::hours(1))
            .unwrap();
        auth.authorize(&token).unwrap()
    }

    #[tokio::test]
    async fn test_create_payout_debits_balance_atomically() {
        let f = fixture();
        let miner = MINER_ADDRESSES[0];
        credit(&f.store, miner, 60_000).await;

        let payout = f.manager.create_payout(miner, 50_000).await.unwrap();
        assert_eq!(payout.status, PayoutStatus::Pending);
        assert_eq!(f.store.read(|s| s.balance_of(miner)).await, 10_000);

        let err = f.manager.create_payout(miner, 50_000).await.unwrap_err();
        assert!(matches!(err, PayoutError::InsufficientBalance(_)));
        assert_eq!(f.store.read(|s| s.payouts.len()).await, 1);
        assert_eq!(f.store.read(|s| s.balance_of(miner)).await, 10_000);
    }

    #[tokio::test]
    async fn test_create_payout_rejects_foreign_network_address() {
        let f = fixture();
        let err = f
            .manager
            .create_payout("bc1qw508d6qejxtdg4y5r3zarvary0c5xw7kv8f3t4", 1)
            .await
            .unwrap_err();
        assert!(matches!(err, PayoutError::InvalidAddress(_)));
    }

    #[tokio::test]
    async fn test_broadcast_spends_wallet_and_persists_txid() {
        let f = fixture();
        let miner = MINER_ADDRESSES[0];
        credit(&f.store, miner, 50_000).await;
        f.node.fund_wallet(Amount::from_sat(30_000));
        f.node.fund_wallet(Amount::from_sat(40_000));

        let payout = f.manager.create_payout(miner, 50_000).await.unwrap();
        let broadcast = f.manager.broadcast(payout.id).await.unwrap();

        assert_eq!(broadcast.status, PayoutStatus::Broadcast);
        assert!(broadcast.broadcast_at.is_some());
        assert_eq!(broadcast.inputs.len(), 2);
        let txid = broadcast.txid.clone().unwrap();
        assert!(f.node.in_mempool(&txid));
        // 2 inputs, 2 outputs at 2 sat/vB
        assert_eq!(broadcast.fee_satoshis, 418);
        assert_eq!(
            f.node.wallet_balance(),
            Amount::from_sat(70_000 - 50_000 - 418)
        );
    }

    #[tokio::test]
    async fn test_insufficient_funds_leaves_ledger_untouched() {
        let f = fixture();
        let miner = MINER_ADDRESSES[0];
        credit(&f.store, miner, 50_000).await;
        f.node.fund_wallet(Amount::from_sat(10_000));

        let payout = f.manager.create_payout(miner, 50_000).await.unwrap();
        let before = f.store.read(|s| s.balances[miner].clone()).await;

        let err = f.manager.broadcast(payout.id).await.unwrap_err();
        assert!(matches!(err, PayoutError::InsufficientFunds { .. }));

        let after = f.store.read(|s| s.balances[miner].clone()).await;
        assert_eq!(before, after);
        let payout = f.manager.get_payout(payout.id).await.unwrap();
        assert_eq!(payout.status, PayoutStatus::Pending);
        assert_eq!(payout.attempts, 1);
        assert!(payout.txid.is_none());
        assert_eq!(f.node.send_calls(), 0);
    }

    #[tokio::test]
    async fn test_lost_response_is_reconciled_without_resend() {
        let f = fixture();
        let miner = MINER_ADDRESSES[0];
        credit(&f.store, miner, 50_000).await;
        f.node.fund_wallet(Amount::from_sat(100_000));
        f.node.set_send_behavior(SendBehavior::AcceptThenTimeout);

        let payout = f.manager.create_payout(miner, 50_000).await.unwrap();
        let err = f.manager.broadcast(payout.id).await.unwrap_err();
        assert!(matches!(err, PayoutError::BroadcastUnknown { .. }));

        let pending = f.manager.get_payout(payout.id).await.unwrap();
        assert_eq!(pending.status, PayoutStatus::Pending);
        let txid = pending.txid.clone().unwrap();
        assert!(f.node.in_mempool(&txid));

        f.node.set_send_behavior(SendBehavior::Accept);
        let reconciled = f.manager.broadcast(payout.id).await.unwrap();
        assert_eq!(reconciled.status, PayoutStatus::Broadcast);
        assert_eq!(reconciled.txid.as_deref(), Some(txid.as_str()));
        assert_eq!(f.node.send_calls(), 1);
    }

    #[tokio::test]
    async fn test_unseen_candidate_resent_with_same_bytes() {
        let f = fixture();
        let miner = MINER_ADDRESSES[0];
        credit(&f.store, miner, 50_000).await;
        f.node.fund_wallet(Amount::from_sat(100_000));
        f.node.set_send_behavior(SendBehavior::Timeout);

        let payout = f.manager.create_payout(miner, 50_000).await.unwrap();
        assert!(f.manager.broadcast(payout.id).await.is_err());
        let candidate = f.manager.get_payout(payout.id).await.unwrap();

        f.node.set_send_behavior(SendBehavior::Accept);
        let broadcast = f.manager.broadcast(payout.id).await.unwrap();
        assert_eq!(broadcast.txid, candidate.txid);
        assert_eq!(broadcast.raw_tx, candidate.raw_tx);
        assert_eq!(f.node.send_calls(), 2);
    }

    #[tokio::test]
    async fn test_pending_candidate_inputs_are_reserved() {
        let f = fixture();
        credit(&f.store, MINER_ADDRESSES[0], 50_000).await;
        credit(&f.store, MINER_ADDRESSES[1], 50_000).await;
        f.node.fund_wallet(Amount::from_sat(100_000));
        f.node.fund_wallet(Amount::from_sat(100_000));

        f.node.set_send_behavior(SendBehavior::Timeout);
        let first = f
            .manager
            .create_payout(MINER_ADDRESSES[0], 50_000)
            .await
            .unwrap();
        assert!(f.manager.broadcast(first.id).await.is_err());

        f.node.set_send_behavior(SendBehavior::Accept);
        let second = f
            .manager
            .create_payout(MINER_ADDRESSES[1], 50_000)
            .await
            .unwrap();
        let second = f.manager.broadcast(second.id).await.unwrap();

        let first = f.manager.get_payout(first.id).await.unwrap();
        assert_eq!(first.inputs.len(), 1);
        assert_eq!(second.inputs.len(), 1);
        assert_ne!(first.inputs, second.inputs);
    }

    #[tokio::test]
    async fn test_rejections_escalate_once_and_retries_continue() {
        let f = fixture();
        let miner = MINER_ADDRESSES[0];
        credit(&f.store, miner, 50_000).await;
        f.node.fund_wallet(Amount::from_sat(100_000));
        f.node.set_send_behavior(SendBehavior::Reject {
            code: -26,
            message: "min relay fee not met".to_string(),
        });

        let payout = f.manager.create_payout(miner, 50_000).await.unwrap();
        for _ in 0..3 {
            let err = f.manager.broadcast(payout.id).await.unwrap_err();
            assert!(matches!(err, PayoutError::Rejected(_)));
        }
        let failed = f.manager.get_payout(payout.id).await.unwrap();
        assert!(failed.escalated);
        assert_eq!(failed.attempts, 3);
        assert!(failed.txid.is_none());
        assert!(failed.last_error.unwrap().contains("min relay fee"));
        assert_eq!(f.alerts.recent(10).await.len(), 1);

        // Scheduled runs keep trying without alerting again
        let report = f.manager.run_payouts().await;
        assert_eq!(report.failed, 1);
        assert_eq!(f.alerts.recent(10).await.len(), 1);
        assert_eq!(f.manager.get_payout(payout.id).await.unwrap().attempts, 4);

        let reset = f.manager.reset_retries(&admin(), payout.id).await.unwrap();
        assert_eq!(reset.attempts, 0);
        assert!(!reset.escalated);

        f.node.set_send_behavior(SendBehavior::Accept);
        let report = f.manager.run_payouts().await;
        assert_eq!(report.reconciled, 1);
        assert_eq!(
            f.manager.get_payout(payout.id).await.unwrap().status,
            PayoutStatus::Broadcast
        );
    }

    #[tokio::test]
    async fn test_escalated_payout_paid_once_node_recovers() {
        let f = fixture();
        let miner = MINER_ADDRESSES[0];
        credit(&f.store, miner, 50_000).await;
        f.node.fund_wallet(Amount::from_sat(100_000));
        f.node.set_unavailable(true);

        for _ in 0..4 {
            f.manager.run_payouts().await;
        }
        let payouts = f.manager.list_payouts(&PayoutQuery::default()).await;
        assert_eq!(payouts.len(), 1);
        assert!(payouts[0].escalated);
        assert_eq!(payouts[0].attempts, 4);
        assert_eq!(f.alerts.recent(10).await.len(), 1);

        f.node.set_unavailable(false);
        let report = f.manager.run_payouts().await;
        assert_eq!(report.reconciled, 1);
        assert_eq!(report.created, 0);
        let payout = f.manager.get_payout(payouts[0].id).await.unwrap();
        assert_eq!(payout.status, PayoutStatus::Broadcast);
        assert_eq!(f.node.send_calls(), 1);
    }

    #[tokio::test]
    async fn test_failed_lookup_keeps_candidate() {
        let f = fixture();
        let miner = MINER_ADDRESSES[0];
        credit(&f.store, miner, 50_000).await;
        f.node.fund_wallet(Amount::from_sat(100_000));
        f.node.set_send_behavior(SendBehavior::AcceptThenTimeout);

        let payout = f.manager.create_payout(miner, 50_000).await.unwrap();
        assert!(matches!(
            f.manager.broadcast(payout.id).await,
            Err(PayoutError::BroadcastUnknown { .. })
        ));
        let candidate = f.manager.get_payout(payout.id).await.unwrap();
        let txid = candidate.txid.clone().unwrap();

        // Node restarting
        f.node.set_lookup_error(Some((-28, "Loading block index...")));
        assert!(matches!(
            f.manager.broadcast(payout.id).await,
            Err(PayoutError::RpcUnavailable(_))
        ));
        f.node.set_lookup_error(Some((-1, "unexpected internal error")));
        assert!(matches!(
            f.manager.broadcast(payout.id).await,
            Err(PayoutError::Rpc(_))
        ));
        let kept = f.manager.get_payout(payout.id).await.unwrap();
        assert_eq!(kept.txid, candidate.txid);
        assert_eq!(kept.raw_tx, candidate.raw_tx);
        assert_eq!(kept.inputs, candidate.inputs);

        f.node.set_lookup_error(None);
        f.node.set_send_behavior(SendBehavior::Accept);
        let broadcast = f.manager.broadcast(payout.id).await.unwrap();
        assert_eq!(broadcast.status, PayoutStatus::Broadcast);
        assert_eq!(broadcast.txid.as_deref(), Some(txid.as_str()));
        assert_eq!(f.node.send_calls(), 1);
        assert_eq!(f.node.spenders_of(&candidate.inputs[0]), vec![txid]);
    }

    #[tokio::test]
    async fn test_rebuild_after_rejection_spends_previous_input() {
        let f = fixture();
        let miner = MINER_ADDRESSES[0];
        credit(&f.store, miner, 50_000).await;
        let first_input = f.node.fund_wallet(Amount::from_sat(100_000));
        f.node.set_send_behavior(SendBehavior::Reject {
            code: -26,
            message: "mempool min fee not met".to_string(),
        });

        let payout = f.manager.create_payout(miner, 50_000).await.unwrap();
        assert!(f.manager.broadcast(payout.id).await.is_err());
        let rejected = f.manager.get_payout(payout.id).await.unwrap();
        assert!(rejected.txid.is_none());
        assert_eq!(rejected.superseded_inputs, vec![first_input.clone()]);

        // A larger UTXO would win largest-first selection
        f.node.fund_wallet(Amount::from_sat(5_000_000));
        f.node.set_send_behavior(SendBehavior::Accept);
        let rebuilt = f.manager.broadcast(payout.id).await.unwrap();
        assert_eq!(rebuilt.inputs[0], first_input);
    }

    #[tokio::test]
    async fn test_select_eligible_uses_overrides_and_skips_pending() {
        let f = fixture();
        let [a, b, c] = MINER_ADDRESSES;
        credit(&f.store, a, 10_000).await;
        credit(&f.store, b, 9_999).await;
        credit(&f.store, c, 5_000).await;

        let mut eligible = f.manager.select_eligible(10_000).await;
        eligible.sort();
        assert_eq!(eligible, vec![a.to_string()]);

        f.manager
            .set_threshold_override(&admin(), c, Some(5_000))
            .await
            .unwrap();
        f.manager
            .set_threshold_override(&admin(), a, Some(20_000))
            .await
            .unwrap();
        assert_eq!(f.manager.select_eligible(10_000).await, vec![c.to_string()]);

        f.manager.create_payout(c, 1_000).await.unwrap();
        assert!(f.manager.select_eligible(10_000).await.is_empty());
    }

    #[tokio::test]
    async fn test_run_payouts_pays_full_balance() {
        let f = fixture();
        let miner = MINER_ADDRESSES[0];
        credit(&f.store, miner, 25_000).await;
        credit(&f.store, MINER_ADDRESSES[1], 500).await;
        f.node.fund_wallet(Amount::from_sat(1_000_000));

        let report = f.manager.run_payouts().await;
        assert_eq!(report.created, 1);
        assert_eq!(report.broadcast, 1);

        let payouts = f
            .manager
            .list_payouts(&PayoutQuery {
                address: Some(miner.to_string()),
                ..Default::default()
            })
            .await;
        assert_eq!(payouts.len(), 1);
        assert_eq!(payouts[0].amount_satoshis, 25_000);
        assert_eq!(f.store.read(|s| s.balance_of(miner)).await, 0);
    }

    #[tokio::test]
    async fn test_signing_incomplete_is_a_failure() {
        let f = fixture();
        let miner = MINER_ADDRESSES[0];
        credit(&f.store, miner, 50_000).await;
        f.node.fund_wallet(Amount::from_sat(100_000));
        f.node.set_sign_complete(false);

        let payout = f.manager.create_payout(miner, 50_000).await.unwrap();
        assert!(matches!(
            f.manager.broadcast(payout.id).await,
            Err(PayoutError::SigningIncomplete)
        ));
        assert_eq!(f.node.send_calls(), 0);
    }

    #[tokio::test]
    async fn test_stuck_payouts_reported_after_grace() {
        let f = fixture();
        let miner = MINER_ADDRESSES[0];
        credit(&f.store, miner, 50_000).await;
        let payout = f.manager.create_payout(miner, 50_000).await.unwrap();
        // No wallet funds
        let _ = f.manager.broadcast(payout.id).await;

        assert!(f.manager.stuck_payouts(TimeDelta::hours(1)).await.is_empty());
        let stuck = f.manager.stuck_payouts(TimeDelta::zero()).await;
        assert_eq!(stuck.len(), 1);
        assert_eq!(stuck[0].attempts, 1);
        assert!(stuck[0].last_error.is_some());
    }

    #[tokio::test]
    async fn test_broadcast_requires_pending() {
        let f = fixture();
        let miner = MINER_ADDRESSES[0];
        credit(&f.store, miner, 50_000).await;
        f.node.fund_wallet(Amount::from_sat(100_000));
        let payout = f.manager.create_payout(miner, 50_000).await.unwrap();
        f.manager.broadcast(payout.id).await.unwrap();

        assert!(matches!(
            f.manager.broadcast(payout.id).await,
            Err(PayoutError::InvalidTransition { .. })
        ));
        assert!(matches!(
            f.manager.broadcast(Uuid::new_v4()).await,
            Err(PayoutError::NotFound(_))
        ));
    }

    #[test]
    fn test_status_parsing() {
        assert_eq!("Broadcast".parse::<PayoutStatus>(), Ok(PayoutStatus::Broadcast));
        assert!("sent".parse::<PayoutStatus>().is_err());
        assert_eq!(PayoutStatus::Confirmed.to_string(), "confirmed");
    }
}
