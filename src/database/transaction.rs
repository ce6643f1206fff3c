use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use futures_util::FutureExt; // for catch_unwind on async blocks
use thiserror::Error;
use tracing::{debug, error, info, warn};

use super::{Connection, Database, DbError, TransactionHandle};
use crate::identity::RequestContext;

#[derive(Debug, Error)]
pub enum TxError<T, E> {
    #[error(transparent)]
    Begin(DbError),
    #[error(transparent)]
    Body(E),
    /// The body succeeded but the commit did not; the body's value is handed back anyway.
    #[error("{source}")]
    Commit { value: T, source: DbError },
}

impl<T, E> TxError<T, E> {
    pub fn body(&self) -> Option<&E> {
        match self {
            TxError::Body(e) => Some(e),
            _ => None,
        }
    }
}

/// Binds database transactions to request contexts.
#[derive(Clone)]
pub struct TransactionManager {
    db: Arc<dyn Database>,
    // nesting depth, only used in debug logs
    depth: Arc<AtomicI64>,
}

impl TransactionManager {
    pub fn new(db: Arc<dyn Database>) -> Self {
        Self { db, depth: Arc::new(AtomicI64::new(0)) }
    }

    pub fn database(&self) -> &Arc<dyn Database> { &self.db }

    /// Run `body` inside a fresh transaction installed into `ctx`.
    ///
    /// Exactly one of commit or rollback runs per call:
    /// - `body` panics: rollback, then the panic continues with its original payload.
    /// - `ctx` was marked rollback-only: rollback, `body`'s result is returned as is.
    /// - `body` returns `Err`: rollback, the error is returned.
    /// - otherwise: commit; a failed commit still hands back the value in [`TxError::Commit`].
    ///
    /// If the returned future is dropped before finishing, the transaction is rolled
    /// back on the runtime in the background.
    pub async fn run_in_transaction<T, E, F, Fut>(&self, ctx: &RequestContext, body: F) -> Result<T, TxError<T, E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let conn = self.db.begin().await.map_err(TxError::Begin)?;
        let depth = self.depth.fetch_add(1, Ordering::SeqCst) + 1;
        debug!(target: "database", "XTX >>>>> begin tx {} (ctx {})", depth, ctx.id());
        let guard = TxGuard { conn: conn.clone(), armed: true, depth: self.depth.clone() };

        let saved = ctx.swap_slot(Some(TransactionHandle::new(conn, true)));
        let outcome = AssertUnwindSafe(async { body().await }).catch_unwind().await;
        let rollback_only = ctx.is_rollback_only();
        ctx.restore_slot(saved);

        match outcome {
            Err(panic) => {
                warn!(target: "database", "rolling back tx {} because the request panicked", depth);
                guard.rollback().await;
                std::panic::resume_unwind(panic)
            }
            Ok(result) if rollback_only => {
                info!(target: "database", "rolling back tx {} because the context is marked rollback-only", depth);
                guard.rollback().await;
                result.map_err(TxError::Body)
            }
            Ok(Err(e)) => {
                info!(target: "database", "rolling back tx {} because the body returned an error", depth);
                guard.rollback().await;
                Err(TxError::Body(e))
            }
            Ok(Ok(value)) => match guard.commit().await {
                Ok(()) => {
                    debug!(target: "database", "committed tx {}", depth);
                    Ok(value)
                }
                Err(source) => {
                    error!(target: "database", "unable to commit tx {}: {}", depth, source);
                    Err(TxError::Commit { value, source })
                }
            },
        }
    }

    /// Install an autocommit connection into `ctx`.
    pub async fn non_transactional(&self, ctx: &RequestContext) -> Result<(), DbError> {
        let conn = self.db.connect().await?;
        ctx.set_transactional_handle(conn, false);
        Ok(())
    }
}

/// Ensures a begun transaction is finished exactly once, even when the owning future is dropped.
struct TxGuard {
    conn: Arc<dyn Connection>,
    armed: bool,
    depth: Arc<AtomicI64>,
}

impl TxGuard {
    fn disarm(&mut self) {
        self.armed = false;
        self.depth.fetch_sub(1, Ordering::SeqCst);
    }

    async fn commit(mut self) -> Result<(), DbError> {
        self.disarm();
        self.conn.commit().await
    }

    /// Rollback failures are logged, never returned, so they cannot mask the error being handled.
    async fn rollback(mut self) {
        self.disarm();
        if let Err(e) = self.conn.rollback().await {
            error!(target: "database", "unable to rollback transaction while handling an error: {}", e);
        }
    }
}

impl Drop for TxGuard {
    fn drop(&mut self) {
        if !self.armed { return; }
        self.disarm();
        warn!(target: "database", "transaction abandoned before commit or rollback; rolling back");
        let conn = self.conn.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(rt) => {
                rt.spawn(async move {
                    if let Err(e) = conn.rollback().await {
                        error!(target: "database", "unable to rollback abandoned transaction: {}", e);
                    }
                });
            }
            Err(_) => error!(target: "database", "no runtime available to roll back abandoned transaction"),
        }
    }
}
