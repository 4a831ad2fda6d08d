// DMPool Library
//
// PPLNS reward accounting and payout engine for the DMPool Bitcoin mining
// pool, a derivative of Hydrapool by 256 Foundation.

pub mod alert;
pub mod api;
pub mod auth;
pub mod backup;
pub mod config;
pub mod confirmation;
pub mod distributor;
pub mod error;
pub mod health;
pub mod ledger;
pub mod logging;
pub mod node;
pub mod payout;
pub mod scheduler;
pub mod shares;
pub mod store;
pub mod test_utils;

pub use health::{ComponentStatus, HealthChecker, HealthStatus};
