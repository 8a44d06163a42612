//! Storage backend abstraction
//!
//! A backend stores records partitioned by scope. Per-tenant deployments
//! give every tenant its own backend; single-wallet deployments share one
//! backend and use the tenant id as the scope.

use super::errors::WalletResult;
use super::record::{StorageRecord, TagFilter, WriteOp};
use async_trait::async_trait;

#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Fails with `DuplicateRecord` when (type, id) exists in the scope
    async fn insert(&self, scope: &str, record: StorageRecord) -> WalletResult<()>;

    async fn fetch(&self, scope: &str, record_type: &str, id: &str) -> WalletResult<StorageRecord>;

    /// Page of matching records, ordered by id
    async fn scan(
        &self,
        scope: &str,
        record_type: &str,
        filter: &TagFilter,
        offset: usize,
        limit: usize,
    ) -> WalletResult<Vec<StorageRecord>>;

    async fn replace(&self, scope: &str, record: StorageRecord) -> WalletResult<()>;

    async fn delete(&self, scope: &str, record_type: &str, id: &str) -> WalletResult<()>;

    /// Apply all operations or none
    async fn commit(&self, scope: &str, ops: Vec<WriteOp>) -> WalletResult<()>;

    /// Drop every record in the scope, returning how many were removed
    async fn purge(&self, scope: &str) -> WalletResult<usize>;
}
