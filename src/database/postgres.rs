//! `tokio-postgres` implementation of the database seams.
//!
//! Connections come from a `deadpool-postgres` pool. A request holds its
//! pooled client until the last `Arc` of its `PgConnection` is dropped, which
//! is after commit or rollback; the client then goes back to the pool.
//! Recycling issues a `ROLLBACK` so a client never re-enters the pool inside a
//! stale transaction.

use std::any::Any;
use std::sync::Arc;

use async_trait::async_trait;
use deadpool_postgres::{Manager, ManagerConfig, Object, Pool, RecyclingMethod};
use tokio_postgres::{Client, Config, NoTls};
use tracing::debug;

use super::{Connection, Database, DbError};

/// Pool size used when none is configured.
pub const DEFAULT_POOL_SIZE: usize = 16;

pub struct PgDatabase {
    pool: Pool,
}

impl PgDatabase {
    /// Parse `url` and build the pool. No connection is opened until first use.
    pub fn new(url: &str, max_size: usize) -> Result<Self, DbError> {
        let config = url.parse::<Config>().map_err(|e| DbError::Connect(e.to_string()))?;
        let manager = Manager::from_config(
            config,
            NoTls,
            ManagerConfig { recycling_method: RecyclingMethod::Custom("ROLLBACK".to_string()) },
        );
        let pool = Pool::builder(manager).max_size(max_size).build().map_err(|e| DbError::Connect(e.to_string()))?;
        Ok(Self { pool })
    }

    async fn checkout(&self) -> Result<PgConnection, DbError> {
        let client = self.pool.get().await.map_err(|e| DbError::Connect(e.to_string()))?;
        let status = self.pool.status();
        debug!(target: "database", "checked out connection: size={}, available={}", status.size, status.available);
        Ok(PgConnection { client })
    }
}

#[async_trait]
impl Database for PgDatabase {
    async fn begin(&self) -> Result<Arc<dyn Connection>, DbError> {
        let conn = self.checkout().await?;
        conn.client.batch_execute("BEGIN").await.map_err(|e| DbError::Begin(e.to_string()))?;
        Ok(Arc::new(conn))
    }

    async fn connect(&self) -> Result<Arc<dyn Connection>, DbError> {
        Ok(Arc::new(self.checkout().await?))
    }

    async fn ping(&self) -> Result<(), DbError> {
        let conn = self.checkout().await?;
        conn.client.simple_query("SELECT 1").await.map_err(|e| DbError::Query(e.to_string()))?;
        debug!(target: "database", "ping ok");
        Ok(())
    }
}

/// A pooled client, returned to the pool on drop.
pub struct PgConnection {
    client: Object,
}

impl PgConnection {
    pub fn client(&self) -> &Client { &self.client }
}

#[async_trait]
impl Connection for PgConnection {
    async fn commit(&self) -> Result<(), DbError> {
        self.client.batch_execute("COMMIT").await.map_err(|e| DbError::Commit(e.to_string()))
    }

    async fn rollback(&self) -> Result<(), DbError> {
        self.client.batch_execute("ROLLBACK").await.map_err(|e| DbError::Rollback(e.to_string()))
    }

    fn as_any(&self) -> &dyn Any { self }
}
