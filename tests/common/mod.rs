//! Shared fixtures for integration tests: a counting fake database and
//! helpers to run axum apps on ephemeral ports.
#![allow(dead_code)]

use std::any::Any;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use axum::Router;

use gatehouse::database::{Connection, Database, DbError};

#[derive(Default)]
pub struct Counters {
    pub begins: AtomicUsize,
    pub connects: AtomicUsize,
    pub commits: AtomicUsize,
    pub rollbacks: AtomicUsize,
    pub fail_begin: AtomicBool,
    pub fail_commit: AtomicBool,
    pub fail_connect: AtomicBool,
    pub fail_ping: AtomicBool,
}

impl Counters {
    pub fn commits(&self) -> usize { self.commits.load(Ordering::SeqCst) }
    pub fn rollbacks(&self) -> usize { self.rollbacks.load(Ordering::SeqCst) }
    pub fn begins(&self) -> usize { self.begins.load(Ordering::SeqCst) }
    pub fn connects(&self) -> usize { self.connects.load(Ordering::SeqCst) }
}

/// A database that only counts what happens to it.
#[derive(Clone, Default)]
pub struct FakeDatabase {
    pub counters: Arc<Counters>,
}

impl FakeDatabase {
    pub fn new() -> Self { Self::default() }
}

pub struct FakeConnection {
    pub transactional: bool,
    counters: Arc<Counters>,
}

#[async_trait]
impl Connection for FakeConnection {
    async fn commit(&self) -> Result<(), DbError> {
        self.counters.commits.fetch_add(1, Ordering::SeqCst);
        if self.counters.fail_commit.load(Ordering::SeqCst) {
            return Err(DbError::Commit("disk full".into()));
        }
        Ok(())
    }

    async fn rollback(&self) -> Result<(), DbError> {
        self.counters.rollbacks.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn as_any(&self) -> &dyn Any { self }
}

#[async_trait]
impl Database for FakeDatabase {
    async fn begin(&self) -> Result<Arc<dyn Connection>, DbError> {
        if self.counters.fail_begin.load(Ordering::SeqCst) {
            return Err(DbError::Begin("no connections left".into()));
        }
        self.counters.begins.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(FakeConnection { transactional: true, counters: self.counters.clone() }))
    }

    async fn connect(&self) -> Result<Arc<dyn Connection>, DbError> {
        self.counters.connects.fetch_add(1, Ordering::SeqCst);
        if self.counters.fail_connect.load(Ordering::SeqCst) {
            return Err(DbError::Connect("connection refused".into()));
        }
        Ok(Arc::new(FakeConnection { transactional: false, counters: self.counters.clone() }))
    }

    async fn ping(&self) -> Result<(), DbError> {
        if self.counters.fail_ping.load(Ordering::SeqCst) {
            return Err(DbError::Query("connection refused".into()));
        }
        Ok(())
    }
}

/// Serve `app` on 127.0.0.1 with an ephemeral port.
pub async fn spawn_app(app: Router) -> anyhow::Result<SocketAddr> {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            eprintln!("test server error: {e:?}");
        }
    });
    Ok(addr)
}

/// A client that never follows redirects, so tests can inspect them.
pub fn client() -> reqwest::Client {
    reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .build()
        .expect("reqwest client")
}
