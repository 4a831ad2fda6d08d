// Background tasks for DMPool
// Distributor, payout runner, confirmation tracker and backups on independent intervals

use crate::backup::BackupManager;
use crate::confirmation::ConfirmationTracker;
use crate::distributor::RewardDistributor;
use crate::payout::PayoutManager;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info};

/// Intervals for the periodic tasks
#[derive(Debug, Clone)]
pub struct Schedule {
    pub distributor: Duration,
    pub payouts: Option<Duration>,
    pub confirmations: Duration,
    pub backups: Option<Duration>,
}

/// Run `task` every `period` until shutdown is signalled. The first run is immediate.
pub fn spawn_periodic<F, Fut>(
    name: &'static str,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
    mut task: F,
) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send,
{
    tokio::spawn(async move {
        info!("Starting {} task (every {:?})", name, period);
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    debug!("Running {} task", name);
                    task().await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("{} task stopped", name);
    })
}

/// Spawn every background task
pub fn spawn_all(
    schedule: &Schedule,
    distributor: Arc<RewardDistributor>,
    payouts: Arc<PayoutManager>,
    tracker: Arc<ConfirmationTracker>,
    backups: Option<Arc<BackupManager>>,
    shutdown: watch::Receiver<bool>,
) -> Vec<JoinHandle<()>> {
    let mut handles = Vec::new();

    handles.push(spawn_periodic(
        "distributor",
        schedule.distributor,
        shutdown.clone(),
        move || {
            let distributor = distributor.clone();
            async move {
                if let Err(e) = distributor.run_once().await {
                    error!("Distributor run failed: {}", e);
                }
            }
        },
    ));

    match schedule.payouts {
        Some(period) => handles.push(spawn_periodic(
            "payouts",
            period,
            shutdown.clone(),
            move || {
                let payouts = payouts.clone();
                async move {
                    payouts.run_payouts().await;
                }
            },
        )),
        None => {
            info!("Automatic payouts disabled, reconciling pending payouts once");
            let mut shutdown = shutdown.clone();
            handles.push(tokio::spawn(async move {
                tokio::select! {
                    report = payouts.reconcile_pending() => {
                        info!("Reconciled {} pending payout(s)", report.reconciled);
                    }
                    _ = shutdown.changed() => {}
                }
            }));
        }
    }

    handles.push(spawn_periodic(
        "confirmations",
        schedule.confirmations,
        shutdown.clone(),
        move || {
            let tracker = tracker.clone();
            async move {
                tracker.run_once().await;
            }
        },
    ));

    if let (Some(period), Some(backups)) = (schedule.backups, backups) {
        handles.push(spawn_periodic("backups", period, shutdown, move || {
            let backups = backups.clone();
            async move {
                if let Err(e) = backups.backup().await {
                    error!("Scheduled backup failed: {:#}", e);
                }
            }
        }));
    }

    handles
}
