//! Per-runner serialization (§5: "For a given runner id, all state mutations
//! are serialized"). The store's `conditional_update` already makes any
//! single write race-safe, but a multi-step pipeline (termination's
//! stop→close→terminate chain) needs the *whole* chain to run once even
//! when several callers invoke it concurrently for the same runner — e.g.
//! three concurrent `TerminateRunner` calls must produce exactly one
//! `terminate_instance` call, not just one winning write. A keyed async
//! mutex gives each runner id its own critical section without blocking
//! unrelated runners.

use std::collections::HashMap;
use std::sync::Arc;

use runnerctl_domain::RunnerId;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};

#[derive(Default, Clone)]
pub struct RunnerLocks {
    inner: Arc<RwLock<HashMap<RunnerId, Arc<Mutex<()>>>>>,
}

impl RunnerLocks {
    pub fn new() -> Self {
        Self::default()
    }

    async fn lock_for(&self, id: &RunnerId) -> Arc<Mutex<()>> {
        if let Some(lock) = self.inner.read().await.get(id) {
            return lock.clone();
        }
        let mut guard = self.inner.write().await;
        guard.entry(id.clone()).or_insert_with(|| Arc::new(Mutex::new(()))).clone()
    }

    /// Acquires the per-runner lock. Holding the returned guard serializes
    /// with every other `acquire` for the same runner id.
    pub async fn acquire(&self, id: &RunnerId) -> OwnedMutexGuard<()> {
        let lock = self.lock_for(id).await;
        lock.lock_owned().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn locks_are_per_runner_independent() {
        let locks = RunnerLocks::new();
        let a = RunnerId::new("r1");
        let b = RunnerId::new("r2");
        let _ga = locks.acquire(&a).await;
        // Different runner id must not block.
        let _gb = tokio::time::timeout(std::time::Duration::from_millis(200), locks.acquire(&b))
            .await
            .expect("lock for a different runner must not contend");
    }
}
