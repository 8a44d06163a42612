//! In-memory storage backend

use super::backend::StorageBackend;
use super::errors::{WalletError, WalletResult};
use super::record::{StorageRecord, TagFilter, WriteOp};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tokio::sync::RwLock;

type RecordKey = (String, String);
type Scope = BTreeMap<RecordKey, StorageRecord>;

#[derive(Clone, Default)]
pub struct MemoryStore {
    scopes: Arc<RwLock<HashMap<String, Scope>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn scope_len(&self, scope: &str) -> usize {
        self.scopes.read().await.get(scope).map_or(0, BTreeMap::len)
    }
}

fn key_of(record: &StorageRecord) -> RecordKey {
    (record.record_type.clone(), record.id.clone())
}

fn op_key(op: &WriteOp) -> RecordKey {
    match op {
        WriteOp::Insert(record) | WriteOp::Replace(record) | WriteOp::Upsert(record) => key_of(record),
        WriteOp::Delete { record_type, id } => (record_type.clone(), id.clone()),
    }
}

fn not_found(record_type: &str, id: &str) -> WalletError {
    WalletError::NotFound(format!("{}/{}", record_type, id))
}

fn apply_op(scope: &mut Scope, op: WriteOp) -> WalletResult<()> {
    match op {
        WriteOp::Insert(record) => {
            let key = key_of(&record);
            if scope.contains_key(&key) {
                return Err(WalletError::DuplicateRecord { record_type: key.0, id: key.1 });
            }
            scope.insert(key, record);
        }
        WriteOp::Replace(record) => {
            let key = key_of(&record);
            match scope.get_mut(&key) {
                Some(existing) => *existing = record,
                None => return Err(not_found(&key.0, &key.1)),
            }
        }
        WriteOp::Upsert(record) => {
            scope.insert(key_of(&record), record);
        }
        WriteOp::Delete { record_type, id } => {
            if scope.remove(&(record_type.clone(), id.clone())).is_none() {
                return Err(not_found(&record_type, &id));
            }
        }
    }
    Ok(())
}

#[async_trait]
impl StorageBackend for MemoryStore {
    async fn insert(&self, scope: &str, record: StorageRecord) -> WalletResult<()> {
        let mut scopes = self.scopes.write().await;
        apply_op(scopes.entry(scope.to_string()).or_default(), WriteOp::Insert(record))
    }

    async fn fetch(&self, scope: &str, record_type: &str, id: &str) -> WalletResult<StorageRecord> {
        let scopes = self.scopes.read().await;
        scopes
            .get(scope)
            .and_then(|s| s.get(&(record_type.to_string(), id.to_string())))
            .cloned()
            .ok_or_else(|| not_found(record_type, id))
    }

    async fn scan(
        &self,
        scope: &str,
        record_type: &str,
        filter: &TagFilter,
        offset: usize,
        limit: usize,
    ) -> WalletResult<Vec<StorageRecord>> {
        let scopes = self.scopes.read().await;
        let Some(records) = scopes.get(scope) else {
            return Ok(Vec::new());
        };
        Ok(records
            .values()
            .filter(|r| r.record_type == record_type && filter.matches(&r.tags))
            .skip(offset)
            .take(limit)
            .cloned()
            .collect())
    }

    async fn replace(&self, scope: &str, record: StorageRecord) -> WalletResult<()> {
        let mut scopes = self.scopes.write().await;
        apply_op(scopes.entry(scope.to_string()).or_default(), WriteOp::Replace(record))
    }

    async fn delete(&self, scope: &str, record_type: &str, id: &str) -> WalletResult<()> {
        let mut scopes = self.scopes.write().await;
        let records = scopes.get_mut(scope).ok_or_else(|| not_found(record_type, id))?;
        apply_op(records, WriteOp::Delete { record_type: record_type.to_string(), id: id.to_string() })
    }

    async fn commit(&self, scope: &str, ops: Vec<WriteOp>) -> WalletResult<()> {
        let mut scopes = self.scopes.write().await;
        let current = scopes.entry(scope.to_string()).or_default();

        // Prior value of each touched key, replayed in reverse on failure
        let mut undo: Vec<(RecordKey, Option<StorageRecord>)> = Vec::with_capacity(ops.len());
        for op in ops {
            let key = op_key(&op);
            let previous = current.get(&key).cloned();
            if let Err(e) = apply_op(current, op) {
                for (key, previous) in undo.into_iter().rev() {
                    match previous {
                        Some(record) => current.insert(key, record),
                        None => current.remove(&key),
                    };
                }
                return Err(e);
            }
            undo.push((key, previous));
        }
        Ok(())
    }

    async fn purge(&self, scope: &str) -> WalletResult<usize> {
        let mut scopes = self.scopes.write().await;
        Ok(scopes.remove(scope).map_or(0, |s| s.len()))
    }
}
