//! Per-thread mutual exclusion
//!
//! At most one transition runs per `(tenant, family, thread)` key. Entries
//! are created on demand and dropped once nobody holds or waits on them.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

type LockMap = HashMap<String, Arc<AsyncMutex<()>>>;

#[derive(Clone, Default)]
pub struct ThreadLocks {
    entries: Arc<Mutex<LockMap>>,
}

/// Held for the duration of one transition
pub struct ThreadToken {
    key: String,
    entries: Arc<Mutex<LockMap>>,
    guard: Option<OwnedMutexGuard<()>>,
}

impl ThreadLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn key(tenant_id: &str, scope: &str, thread_id: &str) -> String {
        format!("{}\u{1f}{}\u{1f}{}", tenant_id, scope, thread_id)
    }

    pub async fn acquire(&self, key: String) -> ThreadToken {
        let lock = {
            let mut entries = self.entries.lock().unwrap_or_else(|p| p.into_inner());
            entries.entry(key.clone()).or_default().clone()
        };
        let guard = lock.lock_owned().await;
        ThreadToken { key, entries: self.entries.clone(), guard: Some(guard) }
    }

    /// Number of live entries
    pub fn len(&self) -> usize {
        self.entries.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Drop for ThreadToken {
    fn drop(&mut self) {
        let mut entries = self.entries.lock().unwrap_or_else(|p| p.into_inner());
        self.guard.take();
        // Only the map still references the lock once our guard is gone
        if entries.get(&self.key).is_some_and(|lock| Arc::strong_count(lock) == 1) {
            entries.remove(&self.key);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn test_entries_released_when_idle() {
        let locks = ThreadLocks::new();
        {
            let _a = locks.acquire(ThreadLocks::key("t", "connection", "1")).await;
            let _b = locks.acquire(ThreadLocks::key("t", "connection", "2")).await;
            assert_eq!(locks.len(), 2);
        }
        assert!(locks.is_empty());
    }

    #[tokio::test]
    async fn test_same_key_is_exclusive() {
        let locks = ThreadLocks::new();
        let active = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let locks = locks.clone();
            let active = active.clone();
            let peak = peak.clone();
            handles.push(tokio::spawn(async move {
                let _token = locks.acquire(ThreadLocks::key("t", "x", "same")).await;
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(2)).await;
                active.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(peak.load(Ordering::SeqCst), 1);
        assert!(locks.is_empty());
    }

    #[tokio::test]
    async fn test_different_tenants_do_not_contend() {
        let locks = ThreadLocks::new();
        let _a = locks.acquire(ThreadLocks::key("alice", "x", "T")).await;
        let b = tokio::time::timeout(
            Duration::from_millis(100),
            locks.acquire(ThreadLocks::key("bob", "x", "T")),
        )
        .await;
        assert!(b.is_ok());
    }
}
