//! Storage backend that fails on demand

use crate::core_wallet::{MemoryStore, StorageBackend, StorageRecord, TagFilter, WalletError, WalletResult, WriteOp};
use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};

/// [`MemoryStore`] whose next batch commits can be made to fail
#[derive(Default)]
pub struct FailingStore {
    inner: MemoryStore,
    failing_commits: AtomicUsize,
}

impl FailingStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `count` commits with a permanent storage error
    pub fn fail_commits(&self, count: usize) {
        self.failing_commits.store(count, Ordering::SeqCst);
    }

    fn take_failure(&self) -> bool {
        self.failing_commits
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl StorageBackend for FailingStore {
    async fn insert(&self, scope: &str, record: StorageRecord) -> WalletResult<()> {
        self.inner.insert(scope, record).await
    }

    async fn fetch(&self, scope: &str, record_type: &str, id: &str) -> WalletResult<StorageRecord> {
        self.inner.fetch(scope, record_type, id).await
    }

    async fn scan(
        &self,
        scope: &str,
        record_type: &str,
        filter: &TagFilter,
        offset: usize,
        limit: usize,
    ) -> WalletResult<Vec<StorageRecord>> {
        self.inner.scan(scope, record_type, filter, offset, limit).await
    }

    async fn replace(&self, scope: &str, record: StorageRecord) -> WalletResult<()> {
        self.inner.replace(scope, record).await
    }

    async fn delete(&self, scope: &str, record_type: &str, id: &str) -> WalletResult<()> {
        self.inner.delete(scope, record_type, id).await
    }

    async fn commit(&self, scope: &str, ops: Vec<WriteOp>) -> WalletResult<()> {
        if self.take_failure() {
            return Err(WalletError::storage("disk I/O error"));
        }
        self.inner.commit(scope, ops).await
    }

    async fn purge(&self, scope: &str) -> WalletResult<usize> {
        self.inner.purge(scope).await
    }
}
