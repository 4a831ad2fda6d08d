use super::{Share, ShareFilter, ShareStore, ShareStoreError};
use crate::config::SharesConfig;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use deadpool_postgres::{Manager, ManagerConfig, Pool, RecyclingMethod};
use std::collections::BTreeMap;
use tokio_postgres::types::FromSql;
use tokio_postgres::{NoTls, Row};
use tracing::info;

// Fixed statements; every filter value is a bound parameter.
const SELECT_SHARES: &str = "SELECT miner_address, worker_name, difficulty, created_at \
     FROM shares \
     WHERE created_at >= $1 AND created_at <= $2 \
       AND ($3::TEXT IS NULL OR miner_address = $3) \
     ORDER BY created_at";

const AGGREGATE_SHARES: &str = "SELECT miner_address, SUM(difficulty)::BIGINT AS total_difficulty \
     FROM shares \
     WHERE created_at >= $1 AND created_at <= $2 \
       AND ($3::TEXT IS NULL OR miner_address = $3) \
     GROUP BY miner_address";

/// Shares table written by the stratum server
pub struct PgShareStore {
    pool: Pool,
}

impl PgShareStore {
    pub fn connect(config: &SharesConfig) -> Result<Self, ShareStoreError> {
        let pg_config: tokio_postgres::Config = config
            .database_url
            .parse()
            .map_err(|e: tokio_postgres::Error| ShareStoreError::Database(e.to_string()))?;
        let manager = Manager::from_config(
            pg_config,
            NoTls,
            ManagerConfig {
                recycling_method: RecyclingMethod::Fast,
            },
        );
        let pool = Pool::builder(manager)
            .max_size(config.pool_size)
            .build()
            .map_err(|e| ShareStoreError::Pool(e.to_string()))?;
        info!("Share store pool created (max {} connections)", config.pool_size);
        Ok(Self { pool })
    }

    async fn client(&self) -> Result<deadpool_postgres::Object, ShareStoreError> {
        self.pool
            .get()
            .await
            .map_err(|e| ShareStoreError::Pool(e.to_string()))
    }
}

fn to_u64(value: i64, column: &str) -> Result<u64, ShareStoreError> {
    u64::try_from(value)
        .map_err(|_| ShareStoreError::InvalidRow(format!("negative {column}: {value}")))
}

fn column<'a, T: FromSql<'a>>(row: &'a Row, name: &str) -> Result<T, ShareStoreError> {
    row.try_get(name)
        .map_err(|e| ShareStoreError::InvalidRow(format!("column {name}: {e}")))
}

/// `worker_name` is nullable in the stratum schema
fn share_from_columns(
    miner_address: String,
    worker_name: Option<String>,
    difficulty: i64,
    timestamp: DateTime<Utc>,
) -> Result<Share, ShareStoreError> {
    Ok(Share {
        miner_address,
        worker_name: worker_name.unwrap_or_default(),
        difficulty: to_u64(difficulty, "difficulty")?,
        timestamp,
    })
}

#[async_trait]
impl ShareStore for PgShareStore {
    async fn shares(&self, filter: &ShareFilter) -> Result<Vec<Share>, ShareStoreError> {
        let client = self.client().await?;
        let rows = client
            .query(SELECT_SHARES, &[&filter.since, &filter.until, &filter.miner])
            .await
            .map_err(|e| ShareStoreError::Database(e.to_string()))?;

        rows.iter()
            .map(|row| {
                share_from_columns(
                    column(row, "miner_address")?,
                    column(row, "worker_name")?,
                    column(row, "difficulty")?,
                    column(row, "created_at")?,
                )
            })
            .collect()
    }

    async fn aggregate(
        &self,
        filter: &ShareFilter,
    ) -> Result<BTreeMap<String, u64>, ShareStoreError> {
        let client = self.client().await?;
        let rows = client
            .query(
                AGGREGATE_SHARES,
                &[&filter.since, &filter.until, &filter.miner],
            )
            .await
            .map_err(|e| ShareStoreError::Database(e.to_string()))?;

        rows.iter()
            .map(|row| {
                let miner: String = column(row, "miner_address")?;
                // SUM over no rows is NULL
                let total: Option<i64> = column(row, "total_difficulty")?;
                Ok((miner, to_u64(total.unwrap_or(0), "difficulty sum")?))
            })
            .collect()
    }
}
