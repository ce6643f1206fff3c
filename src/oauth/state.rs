use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::debug;

/// How long an issued state waits for its callback.
pub const STATE_TTL: Duration = Duration::from_secs(30);

/// Server-side record of one outbound authorization redirect.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AuthState {
    pub state_id: String,
    pub verifier: String,
    pub target_url: String,
    pub context: HashMap<String, String>,
}

impl AuthState {
    pub fn new(verifier: impl Into<String>, target_url: impl Into<String>) -> Self {
        Self {
            state_id: uuid::Uuid::new_v4().to_string(),
            verifier: verifier.into(),
            target_url: target_url.into(),
            context: HashMap::new(),
        }
    }
}

/// Pending authorization states keyed by state id. Cloning shares the map.
///
/// Every insert schedules its own removal after the ttl; a state is also
/// removed the first time it is taken, so a callback can never be replayed.
#[derive(Debug, Clone)]
pub struct StateStore {
    inner: Arc<Mutex<HashMap<String, AuthState>>>,
    ttl: Duration,
}

impl Default for StateStore {
    fn default() -> Self { Self::new() }
}

impl StateStore {
    pub fn new() -> Self { Self::with_ttl(STATE_TTL) }

    pub fn with_ttl(ttl: Duration) -> Self {
        Self { inner: Arc::new(Mutex::new(HashMap::new())), ttl }
    }

    /// Store `state` and schedule its expiry. Must be called inside a tokio runtime.
    pub fn insert(&self, state: AuthState) {
        let id = state.state_id.clone();
        self.inner.lock().insert(id.clone(), state);
        let map = self.inner.clone();
        let ttl = self.ttl;
        tokio::spawn(async move {
            tokio::time::sleep(ttl).await;
            if map.lock().remove(&id).is_some() {
                debug!(target: "oauth", "state {} expired unused", id);
            }
        });
    }

    /// Remove and return the state. A second take of the same id yields `None`.
    pub fn take(&self, state_id: &str) -> Option<AuthState> {
        self.inner.lock().remove(state_id)
    }

    pub fn contains(&self, state_id: &str) -> bool {
        self.inner.lock().contains_key(state_id)
    }

    pub fn len(&self) -> usize { self.inner.lock().len() }

    pub fn is_empty(&self) -> bool { self.len() == 0 }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn state_expires_after_ttl() {
        let store = StateStore::new();
        let s = AuthState::new("v", "/");
        let id = s.state_id.clone();
        store.insert(s);
        tokio::time::sleep(Duration::from_secs(29)).await;
        assert!(store.contains(&id));
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(!store.contains(&id));
        assert!(store.take(&id).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn take_is_single_use_and_expiry_after_take_is_a_noop() {
        let store = StateStore::new();
        let s = AuthState::new("v", "/target");
        let id = s.state_id.clone();
        store.insert(s);
        let got = store.take(&id).unwrap();
        assert_eq!(got.target_url, "/target");
        assert!(store.take(&id).is_none());
        tokio::time::sleep(Duration::from_secs(31)).await;
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn clones_share_entries() {
        let a = StateStore::new();
        let b = a.clone();
        let s = AuthState::new("v", "/");
        let id = s.state_id.clone();
        a.insert(s);
        assert!(b.take(&id).is_some());
        assert!(a.is_empty());
    }
}
