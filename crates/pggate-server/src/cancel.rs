use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use rand::Rng;
use tokio::sync::Notify;

/// Per-session cancellation token handed to Queryer/Execer implementations
/// through the query context. Tripping it is non-blocking; the running
/// query is expected to observe it and return an error promptly.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    inner: Arc<TokenInner>,
}

#[derive(Debug, Default)]
struct TokenInner {
    cancelled: AtomicBool,
    notify: Notify,
}

impl CancelToken {
    pub fn new() -> Self {
        CancelToken::default()
    }

    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Resolves once the token is tripped.
    pub async fn cancelled(&self) {
        loop {
            let notified = self.inner.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

struct Registration {
    secret: i32,
    token: CancelToken,
}

/// The map behind CancelRequest: pid to the session's secret and cancel
/// hook. Shared by every session of a server; the only cross-session state
/// in the core.
#[derive(Default)]
pub struct CancelRegistry {
    sessions: DashMap<i32, Registration>,
}

impl CancelRegistry {
    pub fn new() -> Self {
        CancelRegistry::default()
    }

    /// Registers a session under a fresh random 31-bit pid. Collisions are
    /// rare but re-drawn, so a CancelRequest can never target a stale
    /// session.
    pub fn register(&self, secret: i32, token: CancelToken) -> i32 {
        loop {
            let pid = rand::thread_rng().gen_range(1..i32::MAX);
            match self.sessions.entry(pid) {
                Entry::Vacant(slot) => {
                    slot.insert(Registration { secret, token });
                    return pid;
                }
                Entry::Occupied(_) => continue,
            }
        }
    }

    pub fn deregister(&self, pid: i32) {
        self.sessions.remove(&pid);
    }

    /// Trips the session's token when both pid and secret match. Unknown
    /// pids and wrong secrets are ignored; nothing is ever reported back
    /// to the requesting client.
    pub fn cancel(&self, pid: i32, secret: i32) {
        if let Some(registration) = self.sessions.get(&pid) {
            if registration.secret == secret {
                registration.token.cancel();
            }
        }
    }

    pub fn contains(&self, pid: i32) -> bool {
        self.sessions.contains_key(&pid)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
