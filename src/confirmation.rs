// Confirmation tracker for DMPool
// Follows broadcast payouts to finality, or back to the miner's balance after a reorg

use crate::alert::{Alert, AlertLevel, AlertManager};
use crate::config::Config;
use crate::error::PayoutError;
use crate::node::{NodeRpc, WalletTxStatus};
use crate::payout::{Payout, PayoutStatus};
use crate::store::LedgerStore;
use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ConfirmationOutcome {
    Waiting { id: Uuid, confirmations: u32 },
    Confirmed { id: Uuid, confirmations: u32 },
    /// The wallet did not know the transaction, or a conflicting one is in the chain
    Missing { id: Uuid, checks: u32 },
    /// Payout failed and its debit was given back. The next payout to the
    /// address spends one of its inputs if they are still unspent.
    Reorged { id: Uuid },
    /// RPC failure; retried next poll
    Skipped { id: Uuid, error: String },
}

#[derive(Debug, Clone)]
pub struct ConfirmationSettings {
    pub threshold: u32,
    pub missing_checks_before_failure: u32,
}

impl From<&Config> for ConfirmationSettings {
    fn from(config: &Config) -> Self {
        Self {
            threshold: config.confirmation.threshold,
            missing_checks_before_failure: config.confirmation.missing_checks_before_failure,
        }
    }
}

pub struct ConfirmationTracker {
    store: Arc<LedgerStore>,
    node: Arc<dyn NodeRpc>,
    alerts: Arc<AlertManager>,
    settings: ConfirmationSettings,
}

impl ConfirmationTracker {
    pub fn new(
        store: Arc<LedgerStore>,
        node: Arc<dyn NodeRpc>,
        alerts: Arc<AlertManager>,
        settings: ConfirmationSettings,
    ) -> Self {
        Self {
            store,
            node,
            alerts,
            settings,
        }
    }

    /// Check every Broadcast payout once. A failure on one payout does not affect the others.
    pub async fn run_once(&self) -> Vec<ConfirmationOutcome> {
        let broadcast: Vec<Payout> = self
            .store
            .read(|state| {
                state
                    .payouts
                    .values()
                    .filter(|p| p.status == PayoutStatus::Broadcast)
                    .cloned()
                    .collect()
            })
            .await;

        let mut outcomes = Vec::with_capacity(broadcast.len());
        for payout in broadcast {
            let outcome = match self.check_payout(&payout).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    warn!("Confirmation check for payout {} failed: {}", payout.id, e);
                    ConfirmationOutcome::Skipped {
                        id: payout.id,
                        error: e.to_string(),
                    }
                }
            };
            outcomes.push(outcome);
        }
        outcomes
    }

    async fn check_payout(&self, payout: &Payout) -> Result<ConfirmationOutcome, PayoutError> {
        let Some(txid) = payout.txid.as_deref() else {
            return Err(PayoutError::InvalidTransaction(format!(
                "broadcast payout {} has no txid",
                payout.id
            )));
        };
        match self.node.get_wallet_transaction(txid).await? {
            WalletTxStatus::Confirmations(confirmations)
                if confirmations >= self.settings.threshold =>
            {
                self.confirm(payout.id, confirmations).await
            }
            WalletTxStatus::Confirmations(confirmations) => {
                self.record_depth(payout.id, confirmations).await
            }
            WalletTxStatus::Conflicted | WalletTxStatus::Unknown => {
                self.record_missing(payout.id).await
            }
        }
    }

    async fn record_depth(
        &self,
        id: Uuid,
        confirmations: u32,
    ) -> Result<ConfirmationOutcome, PayoutError> {
        self.store
            .transact(|state| {
                let payout = state.payout_mut(id)?;
                payout.confirmations = confirmations;
                payout.missing_checks = 0;
                Ok::<_, PayoutError>(())
            })
            .await?;
        debug!("Payout {} at {} confirmations", id, confirmations);
        Ok(ConfirmationOutcome::Waiting { id, confirmations })
    }

    async fn confirm(
        &self,
        id: Uuid,
        confirmations: u32,
    ) -> Result<ConfirmationOutcome, PayoutError> {
        let payout = self
            .store
            .transact(|state| {
                let now = Utc::now();
                let payout = state.payout_mut(id)?;
                if payout.status != PayoutStatus::Broadcast {
                    return Err(PayoutError::InvalidTransition {
                        id,
                        status: payout.status,
                        action: "confirm",
                    });
                }
                payout.status = PayoutStatus::Confirmed;
                payout.confirmations = confirmations;
                payout.confirmed_at = Some(now);
                payout.missing_checks = 0;
                let payout = payout.clone();
                state.record_paid(&payout.address, payout.amount_satoshis, now)?;
                Ok(payout)
            })
            .await?;
        info!(
            "Payout {} confirmed: {} sat to {} ({} confirmations)",
            id, payout.amount_satoshis, payout.address, confirmations
        );
        Ok(ConfirmationOutcome::Confirmed { id, confirmations })
    }

    async fn record_missing(&self, id: Uuid) -> Result<ConfirmationOutcome, PayoutError> {
        let checks = self
            .store
            .transact(|state| {
                let payout = state.payout_mut(id)?;
                payout.missing_checks = payout.missing_checks.saturating_add(1);
                Ok::<_, PayoutError>(payout.missing_checks)
            })
            .await?;

        if checks < self.settings.missing_checks_before_failure {
            warn!(
                "Payout {} transaction unknown to wallet or conflicted ({}/{})",
                id, checks, self.settings.missing_checks_before_failure
            );
            return Ok(ConfirmationOutcome::Missing { id, checks });
        }

        let reorg = PayoutError::ReorgDetected(id);
        warn!("{}", reorg);
        if self.fail_and_reverse(id).await? {
            self.alerts
                .raise(
                    Alert::new(
                        AlertLevel::Warning,
                        "Payout reversed",
                        format!("{reorg}; balance restored to the miner"),
                    )
                    .for_payout(id),
                )
                .await;
        }
        Ok(ConfirmationOutcome::Reorged { id })
    }

    /// Mark the payout Failed and give the debit back, at most once.
    /// Returns whether the balance was restored by this call.
    pub async fn fail_and_reverse(&self, id: Uuid) -> Result<bool, PayoutError> {
        let reversed = self
            .store
            .transact(|state| {
                let now = Utc::now();
                let payout = state.payout_mut(id)?;
                if payout.reversed {
                    return Ok::<_, PayoutError>(None);
                }
                if payout.status != PayoutStatus::Broadcast {
                    return Err(PayoutError::InvalidTransition {
                        id,
                        status: payout.status,
                        action: "reverse",
                    });
                }
                payout.status = PayoutStatus::Failed;
                payout.failed_at = Some(now);
                payout.reversed = true;
                let (address, amount) = (payout.address.clone(), payout.amount_satoshis);
                state.restore_balance(&address, amount, now)?;
                Ok(Some((address, amount)))
            })
            .await?;

        match reversed {
            Some((address, amount)) => {
                info!(
                    "Payout {} failed, restored {} sat to {}",
                    id, amount, address
                );
                Ok(true)
            }
            None => Ok(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alert::LogAlertSink;
    use crate::payout::{PayoutManager, PayoutSettings};
    use crate::test_utils::{CHANGE_ADDRESS, FakeNode, MINER_ADDRESSES};
    use bitcoin::{Amount, Network};

    struct Fixture {
        node: Arc<FakeNode>,
        store: Arc<LedgerStore>,
        alerts: Arc<AlertManager>,
        payouts: PayoutManager,
        tracker: ConfirmationTracker,
    }

    fn fixture() -> Fixture {
        let node = Arc::new(FakeNode::new());
        let store = Arc::new(LedgerStore::in_memory());
        let alerts = Arc::new(AlertManager::new(Arc::new(LogAlertSink)));
        let payouts = PayoutManager::new(
            store.clone(),
            node.clone(),
            alerts.clone(),
            PayoutSettings {
                network: Network::Regtest,
                min_payout_satoshis: 10_000,
                change_address: CHANGE_ADDRESS.to_string(),
                min_utxo_confirmations: 1,
                fee_conf_target: 6,
                fallback_fee_sat_per_vb: 1,
                max_fee_satoshis: 100_000,
                max_broadcast_attempts: 3,
            },
        );
        let tracker = ConfirmationTracker::new(
            store.clone(),
            node.clone(),
            alerts.clone(),
            ConfirmationSettings {
                threshold: 6,
                missing_checks_before_failure: 3,
            },
        );
        Fixture {
            node,
            store,
            alerts,
            payouts,
            tracker,
        }
    }

    async fn broadcast_payout(f: &Fixture, amount: u64) -> Payout {
        let miner = MINER_ADDRESSES[0];
        f.store
            .transact(|state| state.credit_balance(miner, amount, Utc::now()))
            .await
            .unwrap();
        f.node.fund_wallet(Amount::from_sat(amount * 2));
        let payout = f.payouts.create_payout(miner, amount).await.unwrap();
        f.payouts.broadcast(payout.id).await.unwrap()
    }

    #[tokio::test]
    async fn test_confirms_at_threshold() {
        let f = fixture();
        let payout = broadcast_payout(&f, 50_000).await;

        f.node.mine_blocks(5);
        let outcomes = f.tracker.run_once().await;
        assert_eq!(
            outcomes,
            vec![ConfirmationOutcome::Waiting {
                id: payout.id,
                confirmations: 5
            }]
        );

        f.node.mine_blocks(1);
        f.tracker.run_once().await;
        let confirmed = f.payouts.get_payout(payout.id).await.unwrap();
        assert_eq!(confirmed.status, PayoutStatus::Confirmed);
        assert!(confirmed.confirmed_at.is_some());

        let balance = f
            .store
            .read(|s| s.balances[MINER_ADDRESSES[0]].clone())
            .await;
        assert_eq!(balance.total_paid_satoshis, 50_000);
        assert_eq!(balance.balance_satoshis, 0);

        // Confirmed payouts are no longer tracked
        assert!(f.tracker.run_once().await.is_empty());
    }

    #[tokio::test]
    async fn test_vanished_transaction_reversed_exactly_once() {
        let f = fixture();
        let payout = broadcast_payout(&f, 50_000).await;
        f.node.drop_transaction(payout.txid.as_deref().unwrap());

        for checks in 1..3 {
            assert_eq!(
                f.tracker.run_once().await,
                vec![ConfirmationOutcome::Missing {
                    id: payout.id,
                    checks
                }]
            );
        }
        assert_eq!(
            f.tracker.run_once().await,
            vec![ConfirmationOutcome::Reorged { id: payout.id }]
        );

        let failed = f.payouts.get_payout(payout.id).await.unwrap();
        assert_eq!(failed.status, PayoutStatus::Failed);
        assert!(failed.reversed);
        let restored = f.store.read(|s| s.balance_of(MINER_ADDRESSES[0])).await;
        assert_eq!(restored, 50_000);

        // Repeating the reversal is a no-op
        assert!(!f.tracker.fail_and_reverse(payout.id).await.unwrap());
        assert!(f.tracker.run_once().await.is_empty());
        assert_eq!(
            f.store.read(|s| s.balance_of(MINER_ADDRESSES[0])).await,
            50_000
        );
        assert_eq!(f.alerts.recent(10).await.len(), 1);
    }

    #[tokio::test]
    async fn test_reappearing_transaction_resets_missing_count() {
        let f = fixture();
        let payout = broadcast_payout(&f, 50_000).await;
        let txid = payout.txid.clone().unwrap();

        f.node.drop_transaction(&txid);
        f.tracker.run_once().await;
        f.tracker.run_once().await;

        // Wallet rebroadcast puts it back
        f.node.reinsert_transaction(payout.raw_tx.as_deref().unwrap());
        assert_eq!(
            f.tracker.run_once().await,
            vec![ConfirmationOutcome::Waiting {
                id: payout.id,
                confirmations: 0
            }]
        );
        let tracked = f.payouts.get_payout(payout.id).await.unwrap();
        assert_eq!(tracked.missing_checks, 0);
        assert_eq!(tracked.status, PayoutStatus::Broadcast);
        assert_eq!(f.store.read(|s| s.balance_of(MINER_ADDRESSES[0])).await, 0);
    }

    #[tokio::test]
    async fn test_conflicted_transaction_reversed() {
        let f = fixture();
        let payout = broadcast_payout(&f, 50_000).await;
        f.node.mine_blocks(1);
        f.node.conflict_transaction(payout.txid.as_deref().unwrap());

        for _ in 0..2 {
            f.tracker.run_once().await;
        }
        assert_eq!(
            f.tracker.run_once().await,
            vec![ConfirmationOutcome::Reorged { id: payout.id }]
        );
        assert_eq!(
            f.store.read(|s| s.balance_of(MINER_ADDRESSES[0])).await,
            50_000
        );
    }

    #[tokio::test]
    async fn test_repayout_spends_reversed_payout_input() {
        let f = fixture();
        let payout = broadcast_payout(&f, 50_000).await;
        let old_input = payout.inputs[0].clone();
        let old_txid = payout.txid.clone().unwrap();
        let old_raw = payout.raw_tx.clone().unwrap();

        // Evicted: its input is spendable again and the signed bytes still valid
        f.node.drop_transaction(&old_txid);
        f.node.fund_wallet(Amount::from_sat(10_000_000));
        for _ in 0..3 {
            f.tracker.run_once().await;
        }
        assert!(f.payouts.get_payout(payout.id).await.unwrap().reversed);

        let report = f.payouts.run_payouts().await;
        assert_eq!(report.broadcast, 1);
        let repaid = f
            .payouts
            .list_payouts(&crate::payout::PayoutQuery {
                status: Some(PayoutStatus::Broadcast),
                ..Default::default()
            })
            .await
            .remove(0);
        assert_eq!(repaid.inputs[0], old_input);
        assert_eq!(
            f.node.spenders_of(&old_input),
            vec![repaid.txid.clone().unwrap()]
        );

        // The old transaction can no longer enter the mempool
        f.node.reinsert_transaction(&old_raw);
        assert!(!f.node.in_mempool(&old_txid));
    }

    #[tokio::test]
    async fn test_rpc_failure_skips_payout() {
        let f = fixture();
        let payout = broadcast_payout(&f, 50_000).await;
        f.node.set_unavailable(true);

        let outcomes = f.tracker.run_once().await;
        assert!(matches!(
            outcomes.as_slice(),
            [ConfirmationOutcome::Skipped { id, .. }] if *id == payout.id
        ));
        let unchanged = f.payouts.get_payout(payout.id).await.unwrap();
        assert_eq!(unchanged.status, PayoutStatus::Broadcast);
        assert_eq!(unchanged.missing_checks, 0);
    }
}
