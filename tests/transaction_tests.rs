//! TransactionManager: exactly one of commit/rollback per boundary, across
//! success, errors, rollback-only, panics and cancellation.

mod common;

use std::panic::AssertUnwindSafe;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Result};
use futures_util::FutureExt;

use common::{FakeConnection, FakeDatabase};
use gatehouse::database::{TransactionManager, TxError};
use gatehouse::identity::RequestContext;

fn setup() -> (FakeDatabase, TransactionManager, RequestContext) {
    let db = FakeDatabase::new();
    let tm = TransactionManager::new(Arc::new(db.clone()));
    let ctx = RequestContext::background("job", "1", ["service"]);
    (db, tm, ctx)
}

#[tokio::test]
async fn successful_body_commits_once() -> Result<()> {
    let (db, tm, ctx) = setup();
    let v = tm
        .run_in_transaction(&ctx, || async {
            assert!(ctx.transactional_handle().is_transactional());
            Ok::<_, anyhow::Error>(42)
        })
        .await
        .map_err(|e| anyhow!("{e}"))?;
    assert_eq!(v, 42);
    assert_eq!((db.counters.commits(), db.counters.rollbacks()), (1, 0));
    // the boundary does not leak its handle
    assert!(!ctx.has_transactional_handle());
    Ok(())
}

#[tokio::test]
async fn failing_body_rolls_back_once() -> Result<()> {
    let (db, tm, ctx) = setup();
    let res = tm.run_in_transaction(&ctx, || async { Err::<u32, _>(anyhow!("nope")) }).await;
    let Err(TxError::Body(e)) = res else { panic!("expected body error") };
    assert_eq!(e.to_string(), "nope");
    assert_eq!((db.counters.commits(), db.counters.rollbacks()), (0, 1));
    Ok(())
}

#[tokio::test]
async fn rollback_only_with_error_rolls_back_once_and_keeps_the_error() -> Result<()> {
    let (db, tm, ctx) = setup();
    let res = tm
        .run_in_transaction(&ctx, || async {
            ctx.mark_rollback_only();
            ctx.mark_rollback_only();
            Err::<u32, _>(anyhow!("original"))
        })
        .await;
    let Err(TxError::Body(e)) = res else { panic!("expected body error") };
    assert_eq!(e.to_string(), "original");
    assert_eq!((db.counters.commits(), db.counters.rollbacks()), (0, 1));
    Ok(())
}

#[tokio::test]
async fn rollback_only_with_value_still_returns_the_value() -> Result<()> {
    let (db, tm, ctx) = setup();
    let res = tm
        .run_in_transaction(&ctx, || async {
            ctx.mark_rollback_only();
            Ok::<_, anyhow::Error>("kept")
        })
        .await;
    assert!(matches!(res, Ok("kept")));
    assert_eq!((db.counters.commits(), db.counters.rollbacks()), (0, 1));
    // the flag belongs to the boundary that set it
    assert!(!ctx.is_rollback_only());
    Ok(())
}

#[tokio::test]
async fn panic_rolls_back_then_continues_unchanged() -> Result<()> {
    let (db, tm, ctx) = setup();
    let fut = tm.run_in_transaction(&ctx, || async {
        if db.counters.begins() > 0 {
            panic!("boom");
        }
        Ok::<u32, anyhow::Error>(1)
    });
    let payload = AssertUnwindSafe(fut).catch_unwind().await.expect_err("panic must propagate");
    assert_eq!(payload.downcast_ref::<&str>(), Some(&"boom"));
    assert_eq!((db.counters.commits(), db.counters.rollbacks()), (0, 1));
    Ok(())
}

#[tokio::test]
async fn cancelled_boundary_is_rolled_back() -> Result<()> {
    let (db, tm, ctx) = setup();
    let (entered_tx, entered_rx) = tokio::sync::oneshot::channel::<()>();
    {
        let fut = tm.run_in_transaction(&ctx, || async move {
            let _ = entered_tx.send(());
            std::future::pending::<()>().await;
            Ok::<(), anyhow::Error>(())
        });
        tokio::select! {
            _ = fut => panic!("body never finishes"),
            _ = entered_rx => {}
        }
    }
    for _ in 0..100 {
        if db.counters.rollbacks() == 1 { break; }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!((db.counters.commits(), db.counters.rollbacks()), (0, 1));
    Ok(())
}

#[tokio::test]
async fn begin_failure_skips_the_body() -> Result<()> {
    let (db, tm, ctx) = setup();
    db.counters.fail_begin.store(true, Ordering::SeqCst);
    let mut called = false;
    let res = tm
        .run_in_transaction(&ctx, || {
            called = true;
            async { Ok::<_, anyhow::Error>(()) }
        })
        .await;
    assert!(matches!(res, Err(TxError::Begin(_))));
    assert!(!called);
    assert_eq!((db.counters.commits(), db.counters.rollbacks()), (0, 0));
    Ok(())
}

#[tokio::test]
async fn commit_failure_hands_back_the_value() -> Result<()> {
    let (db, tm, ctx) = setup();
    db.counters.fail_commit.store(true, Ordering::SeqCst);
    let res = tm.run_in_transaction(&ctx, || async { Ok::<_, anyhow::Error>(7) }).await;
    let Err(TxError::Commit { value, source }) = res else { panic!("expected commit error") };
    assert_eq!(value, 7);
    assert!(source.to_string().contains("disk full"));
    assert_eq!((db.counters.commits(), db.counters.rollbacks()), (1, 0));
    Ok(())
}

#[tokio::test]
async fn nested_boundary_restores_the_outer_handle() -> Result<()> {
    let (db, tm, ctx) = setup();
    let res = tm
        .run_in_transaction(&ctx, || async {
            let outer = ctx.transactional_handle();
            let outer_ptr = outer.downcast_ref::<FakeConnection>().map(|c| c as *const FakeConnection);
            let inner_ptr = tm
                .run_in_transaction(&ctx, || async {
                    let inner = ctx.transactional_handle();
                    Ok::<_, anyhow::Error>(inner.downcast_ref::<FakeConnection>().map(|c| c as *const FakeConnection))
                })
                .await
                .map_err(|e| anyhow!("{e}"))?;
            assert_ne!(outer_ptr, inner_ptr);
            let after = ctx.transactional_handle();
            assert_eq!(after.downcast_ref::<FakeConnection>().map(|c| c as *const FakeConnection), outer_ptr);
            Ok::<_, anyhow::Error>(())
        })
        .await;
    assert!(res.is_ok());
    assert_eq!((db.counters.begins(), db.counters.commits(), db.counters.rollbacks()), (2, 2, 0));
    Ok(())
}

#[tokio::test]
async fn non_transactional_handle_cannot_be_marked() -> Result<()> {
    let (db, tm, ctx) = setup();
    // no handle yet: no-op
    ctx.mark_rollback_only();
    assert!(!ctx.is_rollback_only());

    tm.non_transactional(&ctx).await?;
    assert_eq!(db.counters.connects(), 1);
    assert!(!ctx.transactional_handle().is_transactional());
    let res = std::panic::catch_unwind(AssertUnwindSafe(|| ctx.mark_rollback_only()));
    assert!(res.is_err());
    Ok(())
}

#[test]
#[should_panic(expected = "no database handle")]
fn handle_must_be_installed_before_use() {
    let ctx = RequestContext::background("job", "1", ["service"]);
    let _ = ctx.transactional_handle();
}

#[tokio::test]
async fn handle_error_marks_only_transactional_handles() -> Result<()> {
    let (db, tm, ctx) = setup();
    let res = tm
        .run_in_transaction(&ctx, || async {
            let err = ctx.handle_error(&"constraint violated", "saving order failed");
            assert_eq!(err.http_status(), 500);
            assert!(err.correlation_id().is_some());
            assert!(!err.message().contains("constraint"));
            Ok::<_, anyhow::Error>(())
        })
        .await;
    assert!(res.is_ok());
    assert_eq!((db.counters.commits(), db.counters.rollbacks()), (0, 1));

    tm.non_transactional(&ctx).await?;
    let _ = ctx.handle_error(&"x", "y");
    assert!(!ctx.is_rollback_only());
    Ok(())
}
