//! Opaque transactional resource seams.
//!
//! The core never issues SQL itself. It only needs to begin, commit and roll
//! back, and to hand a connection to request code, which downcasts it to the
//! concrete type it was built for (e.g. [`postgres::PgConnection`]).

use std::any::Any;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;

pub mod postgres;
mod transaction;

pub use transaction::{TransactionManager, TxError};

#[derive(Debug, Error)]
pub enum DbError {
    #[error("unable to connect: {0}")]
    Connect(String),
    #[error("unable to begin transaction: {0}")]
    Begin(String),
    #[error("unable to commit transaction: {0}")]
    Commit(String),
    #[error("unable to roll back transaction: {0}")]
    Rollback(String),
    #[error("query failed: {0}")]
    Query(String),
}

/// A connection handed out by a [`Database`]. Owned by exactly one request at a time.
#[async_trait]
pub trait Connection: Send + Sync + 'static {
    async fn commit(&self) -> Result<(), DbError>;
    async fn rollback(&self) -> Result<(), DbError>;
    fn as_any(&self) -> &dyn Any;
}

#[async_trait]
pub trait Database: Send + Sync + 'static {
    /// Start a transaction on a connection reserved for the caller.
    async fn begin(&self) -> Result<Arc<dyn Connection>, DbError>;
    /// A connection in autocommit mode.
    async fn connect(&self) -> Result<Arc<dyn Connection>, DbError>;
    async fn ping(&self) -> Result<(), DbError>;
}

/// The connection currently installed in a request, plus whether it carries a transaction.
#[derive(Clone)]
pub struct TransactionHandle {
    conn: Arc<dyn Connection>,
    transactional: bool,
}

impl TransactionHandle {
    pub fn new(conn: Arc<dyn Connection>, transactional: bool) -> Self {
        Self { conn, transactional }
    }

    pub fn connection(&self) -> &Arc<dyn Connection> { &self.conn }

    pub fn is_transactional(&self) -> bool { self.transactional }

    pub fn downcast_ref<T: 'static>(&self) -> Option<&T> {
        self.conn.as_any().downcast_ref::<T>()
    }
}

impl std::fmt::Debug for TransactionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionHandle").field("transactional", &self.transactional).finish_non_exhaustive()
    }
}
