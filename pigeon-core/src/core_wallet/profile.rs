//! Tenant-scoped view over a storage backend
//!
//! Every operation is confined to the owning tenant: writes are stamped with
//! the tenant tag, queries are narrowed to it and anything read back that
//! carries another tenant's tag is refused.

use super::backend::StorageBackend;
use super::errors::{WalletError, WalletResult};
use super::keystore::{WalletKey, KEY_RECORD_TYPE};
use super::record::{StorageRecord, TagFilter, Tags, WriteOp, TENANT_TAG};
use super::search::RecordSearch;
use super::tenant::KeyIndex;
use crate::core_envelope::{KeyPair, KeyResolver};
use async_trait::async_trait;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Open,
    Closing,
    Closed,
}

#[derive(Debug)]
struct Activity {
    in_flight: watch::Sender<usize>,
    lifecycle: Mutex<Lifecycle>,
}

impl Activity {
    fn lifecycle(&self) -> std::sync::MutexGuard<'_, Lifecycle> {
        self.lifecycle.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Marks an operation as in flight until dropped
#[derive(Debug)]
pub struct ActivityGuard {
    activity: Arc<Activity>,
}

impl Drop for ActivityGuard {
    fn drop(&mut self) {
        self.activity.in_flight.send_modify(|n| *n = n.saturating_sub(1));
    }
}

struct ProfileInner {
    tenant_id: String,
    settings: super::ProfileSettings,
    backend: Arc<dyn StorageBackend>,
    wallet_key: WalletKey,
    keys: Arc<KeyIndex>,
    activity: Arc<Activity>,
}

/// Handle to one tenant's records and keys; clones share state
#[derive(Clone)]
pub struct Profile {
    inner: Arc<ProfileInner>,
}

impl fmt::Debug for Profile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Profile").field("tenant_id", &self.inner.tenant_id).finish_non_exhaustive()
    }
}

/// Run `op`, retrying once if the backend reports a transient failure
async fn retry_transient<T, F, Fut>(operation: &str, tenant_id: &str, mut op: F) -> WalletResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = WalletResult<T>>,
{
    match op().await {
        Err(e) if e.is_transient() => {
            warn!(tenant = tenant_id, operation, error = %e, "transient storage failure, retrying");
            op().await
        }
        other => other,
    }
}

impl Profile {
    pub(crate) fn new(
        tenant_id: String,
        settings: super::ProfileSettings,
        backend: Arc<dyn StorageBackend>,
        wallet_key: WalletKey,
        keys: Arc<KeyIndex>,
    ) -> Self {
        let (in_flight, _) = watch::channel(0);
        let activity = Arc::new(Activity { in_flight, lifecycle: Mutex::new(Lifecycle::Open) });
        Self {
            inner: Arc::new(ProfileInner { tenant_id, settings, backend, wallet_key, keys, activity }),
        }
    }

    pub fn tenant_id(&self) -> &str {
        &self.inner.tenant_id
    }

    pub fn settings(&self) -> &super::ProfileSettings {
        &self.inner.settings
    }

    pub fn is_open(&self) -> bool {
        *self.inner.activity.lifecycle() != Lifecycle::Closed
    }

    pub fn same_profile(&self, other: &Profile) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Register an in-flight operation; removal waits for it to finish
    pub fn enter(&self) -> WalletResult<ActivityGuard> {
        let lifecycle = self.inner.activity.lifecycle();
        match *lifecycle {
            Lifecycle::Open => {
                self.inner.activity.in_flight.send_modify(|n| *n += 1);
                Ok(ActivityGuard { activity: self.inner.activity.clone() })
            }
            Lifecycle::Closing => Err(WalletError::ProfileBusy(self.inner.tenant_id.clone())),
            Lifecycle::Closed => Err(self.closed_error()),
        }
    }

    pub fn in_flight(&self) -> usize {
        *self.inner.activity.in_flight.borrow()
    }

    /// Stop admitting work and wait for in-flight operations to drain
    pub(crate) async fn fence(&self, timeout: Duration) -> WalletResult<()> {
        {
            let mut lifecycle = self.inner.activity.lifecycle();
            match *lifecycle {
                Lifecycle::Open => *lifecycle = Lifecycle::Closing,
                Lifecycle::Closing => {
                    return Err(WalletError::ProfileBusy(self.inner.tenant_id.clone()))
                }
                Lifecycle::Closed => return Err(self.closed_error()),
            }
        }

        let mut in_flight = self.inner.activity.in_flight.subscribe();
        let result = match tokio::time::timeout(timeout, in_flight.wait_for(|n| *n == 0)).await {
            Ok(Ok(_)) => Ok(()),
            _ => {
                self.reopen();
                Err(WalletError::ProfileBusy(self.inner.tenant_id.clone()))
            }
        };
        result
    }

    pub(crate) fn reopen(&self) {
        *self.inner.activity.lifecycle() = Lifecycle::Open;
    }

    pub(crate) fn mark_closed(&self) {
        *self.inner.activity.lifecycle() = Lifecycle::Closed;
    }

    fn closed_error(&self) -> WalletError {
        WalletError::NotFound(format!("profile {} has been removed", self.inner.tenant_id))
    }

    fn check_open(&self) -> WalletResult<()> {
        if self.is_open() {
            Ok(())
        } else {
            Err(self.closed_error())
        }
    }

    fn scope(&self) -> &str {
        &self.inner.tenant_id
    }

    fn stamp(&self, mut record: StorageRecord) -> WalletResult<StorageRecord> {
        match record.tags.get(TENANT_TAG) {
            Some(owner) if owner != self.tenant_id() => {
                return Err(WalletError::ScopeViolation(format!(
                    "record {}/{} is tagged for tenant {}",
                    record.record_type, record.id, owner
                )))
            }
            _ => {}
        }
        record.tags.insert(TENANT_TAG.to_string(), self.tenant_id().to_string());
        Ok(record)
    }

    fn unstamp(&self, mut record: StorageRecord) -> WalletResult<StorageRecord> {
        match record.tags.remove(TENANT_TAG) {
            Some(owner) if owner == self.tenant_id() => Ok(record),
            owner => Err(WalletError::ScopeViolation(format!(
                "record {}/{} belongs to {:?}",
                record.record_type, record.id, owner
            ))),
        }
    }

    fn scoped_filter(&self, filter: TagFilter) -> WalletResult<TagFilter> {
        for (name, value) in filter.constraints() {
            if name == TENANT_TAG && value != self.tenant_id() {
                return Err(WalletError::ScopeViolation(format!(
                    "query names tenant {} from tenant {}",
                    value,
                    self.tenant_id()
                )));
            }
        }
        Ok(filter.and(TagFilter::eq(TENANT_TAG, self.tenant_id())))
    }

    pub async fn add(&self, record: StorageRecord) -> WalletResult<()> {
        self.check_open()?;
        let record = self.stamp(record)?;
        retry_transient("add", self.scope(), || {
            self.inner.backend.insert(self.scope(), record.clone())
        })
        .await
    }

    pub async fn get(&self, record_type: &str, id: &str) -> WalletResult<StorageRecord> {
        self.check_open()?;
        let record = retry_transient("get", self.scope(), || {
            self.inner.backend.fetch(self.scope(), record_type, id)
        })
        .await?;
        self.unstamp(record)
    }

    /// Lazily paged search; the cursor is forward-only
    pub fn search(&self, record_type: &str, filter: TagFilter) -> WalletResult<RecordSearch> {
        self.check_open()?;
        Ok(RecordSearch::new(self.clone(), record_type.to_string(), self.scoped_filter(filter)?))
    }

    pub async fn find_all(&self, record_type: &str, filter: TagFilter) -> WalletResult<Vec<StorageRecord>> {
        self.search(record_type, filter)?.fetch_all().await
    }

    pub async fn find_one(&self, record_type: &str, filter: TagFilter) -> WalletResult<Option<StorageRecord>> {
        self.search(record_type, filter)?.next().await
    }

    /// One page of an already scoped search
    pub(crate) async fn scan_page(
        &self,
        record_type: &str,
        filter: &TagFilter,
        offset: usize,
        limit: usize,
    ) -> WalletResult<Vec<StorageRecord>> {
        self.check_open()?;
        let page = retry_transient("search", self.scope(), || {
            self.inner.backend.scan(self.scope(), record_type, filter, offset, limit)
        })
        .await?;
        page.into_iter().map(|r| self.unstamp(r)).collect()
    }

    pub async fn replace(&self, record: StorageRecord) -> WalletResult<()> {
        self.check_open()?;
        let record = self.stamp(record)?;
        retry_transient("replace", self.scope(), || {
            self.inner.backend.replace(self.scope(), record.clone())
        })
        .await
    }

    /// Replace the tag set of a record, keeping its value
    pub async fn update_tags(&self, record_type: &str, id: &str, tags: Tags) -> WalletResult<StorageRecord> {
        let mut record = self.get(record_type, id).await?;
        record.tags = tags;
        self.replace(record.clone()).await?;
        Ok(record)
    }

    pub async fn remove(&self, record_type: &str, id: &str) -> WalletResult<()> {
        // Existence check also rejects ids owned by another tenant
        self.get(record_type, id).await?;
        retry_transient("remove", self.scope(), || {
            self.inner.backend.delete(self.scope(), record_type, id)
        })
        .await
    }

    /// Apply a batch atomically
    pub async fn commit(&self, ops: Vec<WriteOp>) -> WalletResult<()> {
        self.check_open()?;
        let mut stamped = Vec::with_capacity(ops.len());
        for mut op in ops {
            if let Some(record) = op.record_mut() {
                *record = self.stamp(record.clone())?;
            }
            stamped.push(op);
        }
        retry_transient("commit", self.scope(), || {
            self.inner.backend.commit(self.scope(), stamped.clone())
        })
        .await
    }

    /// Generate and persist a new key, making it routable to this tenant
    pub async fn create_key(&self) -> WalletResult<KeyPair> {
        self.store_key(KeyPair::generate()).await
    }

    /// Deterministic variant of [`Profile::create_key`]; reusing a seed
    /// fails with `DuplicateRecord`
    pub async fn create_key_from_seed(&self, seed: &[u8; 32]) -> WalletResult<KeyPair> {
        self.store_key(KeyPair::from_seed(seed)).await
    }

    async fn store_key(&self, key: KeyPair) -> WalletResult<KeyPair> {
        let record = self.inner.wallet_key.key_record(&key)?;
        let claimed = self.claim_keys(&[key.verkey()]).await?;
        if let Err(e) = self.add(record).await {
            self.release_keys(&claimed).await;
            return Err(e);
        }
        Ok(key)
    }

    /// Key insert for inclusion in a larger atomic batch; claim the verkey
    /// with [`Profile::claim_keys`] before committing the batch
    pub fn stage_key(&self, key: &KeyPair) -> WalletResult<WriteOp> {
        Ok(WriteOp::Insert(self.inner.wallet_key.key_record(key)?))
    }

    /// Route `verkeys` to this tenant, all or none
    ///
    /// Returns the keys this call newly claimed, for [`Profile::release_keys`]
    /// if the records they belong to are never written. Keys another tenant
    /// holds fail with `KeyOwned`.
    pub async fn claim_keys(&self, verkeys: &[String]) -> WalletResult<Vec<String>> {
        self.check_open()?;
        let mut claimed = Vec::new();
        for verkey in verkeys {
            match self.inner.keys.register(verkey, self.tenant_id()).await {
                Ok(true) => claimed.push(verkey.clone()),
                Ok(false) => {}
                Err(e) => {
                    self.release_keys(&claimed).await;
                    return Err(e);
                }
            }
        }
        Ok(claimed)
    }

    pub async fn release_keys(&self, verkeys: &[String]) {
        for verkey in verkeys {
            if let Err(e) = self.inner.keys.release(verkey, self.tenant_id()).await {
                warn!(tenant = self.tenant_id(), verkey = %verkey, error = %e, "key claim not released");
            }
        }
    }

    pub async fn fetch_key(&self, verkey: &str) -> WalletResult<Option<KeyPair>> {
        match self.get(KEY_RECORD_TYPE, verkey).await {
            Ok(record) => self.inner.wallet_key.key_from_record(&record).map(Some),
            Err(WalletError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub(crate) async fn purge(&self) -> WalletResult<usize> {
        retry_transient("purge", self.scope(), || self.inner.backend.purge(self.scope())).await
    }
}

#[async_trait]
impl KeyResolver for Profile {
    async fn resolve_key(&self, verkey: &str) -> Option<KeyPair> {
        match self.fetch_key(verkey).await {
            Ok(key) => key,
            Err(e) => {
                warn!(tenant = self.tenant_id(), verkey, error = %e, "key lookup failed");
                None
            }
        }
    }
}
