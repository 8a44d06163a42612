//! Multi-tenant profile manager
//!
//! Keeps the tenant registry, hands out [`Profile`]s and maps verkeys to the
//! tenant that owns them so inbound envelopes can be routed to a profile.

use super::backend::StorageBackend;
use super::errors::{WalletError, WalletResult};
use super::keystore::{random_salt, WalletKey};
use super::memory_store::MemoryStore;
use super::profile::Profile;
use super::record::{current_timestamp_ms, StorageRecord, TagFilter, WriteOp};
use super::settings::ProfileSettings;
use super::sql_store::SqlStore;
use crate::config::{BackendKind, WalletConfig, WalletMode};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info};

const REGISTRY_SCOPE: &str = "registry";
const TENANT_RECORD: &str = "tenant";
const TENANT_KEY_RECORD: &str = "tenant_key";
const MAX_TENANT_ID_LEN: usize = 64;
const REGISTRY_PAGE: usize = 256;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct TenantEntry {
    tenant_id: String,
    settings: ProfileSettings,
    salt: String,
    created_at: i64,
}

/// Verkey to tenant index, persisted in the registry
pub(crate) struct KeyIndex {
    registry: Arc<dyn StorageBackend>,
    cache: RwLock<HashMap<String, String>>,
}

impl KeyIndex {
    pub(crate) fn new(registry: Arc<dyn StorageBackend>) -> Self {
        Self { registry, cache: RwLock::new(HashMap::new()) }
    }

    /// Route `verkey` to `tenant_id`
    ///
    /// Returns `false` when the tenant already held the key; a key held by
    /// another tenant fails with `KeyOwned`.
    pub(crate) async fn register(&self, verkey: &str, tenant_id: &str) -> WalletResult<bool> {
        if let Some(owner) = self.lookup(verkey).await? {
            return owned_by(verkey, tenant_id, owner).map(|_| false);
        }
        let record = StorageRecord::from_value(TENANT_KEY_RECORD, verkey, &tenant_id)?
            .with_tag("tenant_id", tenant_id);
        match self.registry.insert(REGISTRY_SCOPE, record).await {
            Ok(()) => {}
            Err(WalletError::DuplicateRecord { .. }) => {
                // Another registration won the insert
                let owner = self
                    .lookup(verkey)
                    .await?
                    .ok_or_else(|| WalletError::storage(format!("key {} vanished during registration", verkey)))?;
                return owned_by(verkey, tenant_id, owner).map(|_| false);
            }
            Err(e) => return Err(e),
        }
        self.cache.write().await.insert(verkey.to_string(), tenant_id.to_string());
        Ok(true)
    }

    /// Drop a registration held by `tenant_id`; other owners are left alone
    pub(crate) async fn release(&self, verkey: &str, tenant_id: &str) -> WalletResult<()> {
        if self.lookup(verkey).await?.as_deref() != Some(tenant_id) {
            return Ok(());
        }
        match self.registry.delete(REGISTRY_SCOPE, TENANT_KEY_RECORD, verkey).await {
            Ok(()) | Err(WalletError::NotFound(_)) => {}
            Err(e) => return Err(e),
        }
        self.cache.write().await.remove(verkey);
        Ok(())
    }

    pub(crate) async fn lookup(&self, verkey: &str) -> WalletResult<Option<String>> {
        if let Some(tenant) = self.cache.read().await.get(verkey) {
            return Ok(Some(tenant.clone()));
        }
        match self.registry.fetch(REGISTRY_SCOPE, TENANT_KEY_RECORD, verkey).await {
            Ok(record) => {
                let tenant: String = record.value_as()?;
                self.cache.write().await.insert(verkey.to_string(), tenant.clone());
                Ok(Some(tenant))
            }
            Err(WalletError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn remove_tenant(&self, tenant_id: &str) -> WalletResult<()> {
        let filter = TagFilter::eq("tenant_id", tenant_id);
        let owned = self
            .registry
            .scan(REGISTRY_SCOPE, TENANT_KEY_RECORD, &filter, 0, usize::MAX)
            .await?;
        let ops = owned
            .iter()
            .map(|r| WriteOp::Delete { record_type: TENANT_KEY_RECORD.to_string(), id: r.id.clone() })
            .collect();
        self.registry.commit(REGISTRY_SCOPE, ops).await?;
        self.cache.write().await.retain(|_, owner| owner != tenant_id);
        Ok(())
    }
}

fn owned_by(verkey: &str, tenant_id: &str, owner: String) -> WalletResult<()> {
    if owner == tenant_id {
        Ok(())
    } else {
        Err(WalletError::KeyOwned { verkey: verkey.to_string(), owner })
    }
}

/// Opens the backend that holds a tenant's records
struct BackendFactory {
    kind: BackendKind,
    data_dir: PathBuf,
    shared: Option<Arc<dyn StorageBackend>>,
    opened: Mutex<HashMap<String, Arc<dyn StorageBackend>>>,
}

impl BackendFactory {
    fn tenant_db_path(&self, tenant_id: &str) -> PathBuf {
        self.data_dir.join(format!("tenant-{}.db", tenant_id))
    }

    fn open(&self, tenant_id: &str) -> WalletResult<Arc<dyn StorageBackend>> {
        if let Some(shared) = &self.shared {
            return Ok(shared.clone());
        }
        let mut opened = self.opened.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(backend) = opened.get(tenant_id) {
            return Ok(backend.clone());
        }
        let backend: Arc<dyn StorageBackend> = match self.kind {
            BackendKind::Memory => Arc::new(MemoryStore::new()),
            BackendKind::Sqlite => Arc::new(SqlStore::open(self.tenant_db_path(tenant_id))?),
        };
        opened.insert(tenant_id.to_string(), backend.clone());
        Ok(backend)
    }

    fn destroy(&self, tenant_id: &str) -> WalletResult<()> {
        if self.shared.is_some() {
            return Ok(());
        }
        self.opened.lock().unwrap_or_else(|p| p.into_inner()).remove(tenant_id);
        if self.kind == BackendKind::Sqlite {
            let path = self.tenant_db_path(tenant_id);
            if path.exists() {
                std::fs::remove_file(&path).map_err(|e| {
                    WalletError::storage(format!("Failed to delete {}: {}", path.display(), e))
                })?;
            }
        }
        Ok(())
    }
}

pub struct TenantManager {
    mode: WalletMode,
    backends: BackendFactory,
    registry: Arc<dyn StorageBackend>,
    profiles: tokio::sync::Mutex<HashMap<String, Profile>>,
    keys: Arc<KeyIndex>,
    remove_timeout: Duration,
}

fn validate_tenant_id(tenant_id: &str) -> WalletResult<()> {
    let valid = !tenant_id.is_empty()
        && tenant_id.len() <= MAX_TENANT_ID_LEN
        && !tenant_id.starts_with('.')
        && tenant_id.chars().all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if valid {
        Ok(())
    } else {
        Err(WalletError::InvalidInput(format!("invalid tenant id '{}'", tenant_id)))
    }
}

impl TenantManager {
    pub fn new(config: &WalletConfig) -> WalletResult<Self> {
        let (registry, shared): (Arc<dyn StorageBackend>, Option<Arc<dyn StorageBackend>>) =
            match config.backend {
                BackendKind::Memory => {
                    let shared = (config.mode == WalletMode::SingleWallet)
                        .then(|| Arc::new(MemoryStore::new()) as Arc<dyn StorageBackend>);
                    (Arc::new(MemoryStore::new()), shared)
                }
                BackendKind::Sqlite => {
                    std::fs::create_dir_all(&config.data_dir).map_err(|e| {
                        WalletError::storage(format!(
                            "Failed to create {}: {}",
                            config.data_dir.display(),
                            e
                        ))
                    })?;
                    let registry = Arc::new(SqlStore::open(config.data_dir.join("registry.db"))?);
                    let shared = match config.mode {
                        WalletMode::SingleWallet => Some(Arc::new(SqlStore::open(
                            config.data_dir.join("wallet.db"),
                        )?) as Arc<dyn StorageBackend>),
                        WalletMode::PerTenant => None,
                    };
                    (registry, shared)
                }
            };

        info!(mode = ?config.mode, backend = ?config.backend, "tenant manager ready");
        Ok(Self {
            mode: config.mode,
            backends: BackendFactory {
                kind: config.backend,
                data_dir: config.data_dir.clone(),
                shared,
                opened: Mutex::new(HashMap::new()),
            },
            keys: Arc::new(KeyIndex::new(registry.clone())),
            registry,
            profiles: tokio::sync::Mutex::new(HashMap::new()),
            remove_timeout: config.remove_timeout,
        })
    }

    /// Per-tenant in-memory backends
    pub fn in_memory() -> Self {
        Self::in_memory_with_mode(WalletMode::PerTenant)
    }

    pub fn in_memory_with_mode(mode: WalletMode) -> Self {
        let registry: Arc<dyn StorageBackend> = Arc::new(MemoryStore::new());
        Self {
            mode,
            backends: BackendFactory {
                kind: BackendKind::Memory,
                data_dir: PathBuf::new(),
                shared: (mode == WalletMode::SingleWallet)
                    .then(|| Arc::new(MemoryStore::new()) as Arc<dyn StorageBackend>),
                opened: Mutex::new(HashMap::new()),
            },
            keys: Arc::new(KeyIndex::new(registry.clone())),
            registry,
            profiles: tokio::sync::Mutex::new(HashMap::new()),
            remove_timeout: WalletConfig::default().remove_timeout,
        }
    }

    /// Single wallet over `backend`, with an in-memory registry
    pub fn with_shared_backend(backend: Arc<dyn StorageBackend>) -> Self {
        let mut tenants = Self::in_memory_with_mode(WalletMode::SingleWallet);
        tenants.backends.shared = Some(backend);
        tenants
    }

    pub fn with_remove_timeout(mut self, timeout: Duration) -> Self {
        self.remove_timeout = timeout;
        self
    }

    pub fn mode(&self) -> WalletMode {
        self.mode
    }

    fn build_profile(&self, entry: TenantEntry) -> WalletResult<Profile> {
        let wallet_key = WalletKey::derive(&entry.settings, &entry.salt)?;
        let backend = self.backends.open(&entry.tenant_id)?;
        Ok(Profile::new(entry.tenant_id, entry.settings, backend, wallet_key, self.keys.clone()))
    }

    async fn registry_entry(&self, tenant_id: &str) -> WalletResult<Option<TenantEntry>> {
        match self.registry.fetch(REGISTRY_SCOPE, TENANT_RECORD, tenant_id).await {
            Ok(record) => Ok(Some(record.value_as()?)),
            Err(WalletError::NotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub async fn create_profile(&self, tenant_id: &str, settings: ProfileSettings) -> WalletResult<Profile> {
        validate_tenant_id(tenant_id)?;
        let mut profiles = self.profiles.lock().await;
        if profiles.contains_key(tenant_id) || self.registry_entry(tenant_id).await?.is_some() {
            return Err(WalletError::DuplicateTenant(tenant_id.to_string()));
        }

        let entry = TenantEntry {
            tenant_id: tenant_id.to_string(),
            settings,
            salt: random_salt(),
            created_at: current_timestamp_ms(),
        };
        let profile = self.build_profile(entry.clone())?;
        let record = StorageRecord::from_value(TENANT_RECORD, tenant_id, &entry)?;
        self.registry.insert(REGISTRY_SCOPE, record).await.map_err(|e| match e {
            WalletError::DuplicateRecord { .. } => WalletError::DuplicateTenant(tenant_id.to_string()),
            other => other,
        })?;

        profiles.insert(tenant_id.to_string(), profile.clone());
        info!(tenant = tenant_id, "profile created");
        Ok(profile)
    }

    pub async fn open_profile(&self, tenant_id: &str) -> WalletResult<Profile> {
        let mut profiles = self.profiles.lock().await;
        if let Some(profile) = profiles.get(tenant_id) {
            return Ok(profile.clone());
        }
        let entry = self
            .registry_entry(tenant_id)
            .await?
            .ok_or_else(|| WalletError::NotFound(format!("tenant {}", tenant_id)))?;

        let profile = self.build_profile(entry)?;
        profiles.insert(tenant_id.to_string(), profile.clone());
        debug!(tenant = tenant_id, "profile opened");
        Ok(profile)
    }

    /// Open a tenant, creating it with `settings` when it does not exist yet
    pub async fn open_or_create(&self, tenant_id: &str, settings: ProfileSettings) -> WalletResult<Profile> {
        match self.open_profile(tenant_id).await {
            Err(WalletError::NotFound(_)) => self.create_profile(tenant_id, settings).await,
            other => other,
        }
    }

    /// Delete a tenant and everything it owns
    ///
    /// In-flight operations are given the configured removal timeout to
    /// finish; otherwise the call fails with `ProfileBusy` and the profile
    /// stays usable.
    pub async fn remove_profile(&self, profile: &Profile) -> WalletResult<()> {
        let tenant_id = profile.tenant_id().to_string();
        profile.fence(self.remove_timeout).await?;

        let removal = async {
            let purged = profile.purge().await?;
            self.keys.remove_tenant(&tenant_id).await?;
            self.registry.delete(REGISTRY_SCOPE, TENANT_RECORD, &tenant_id).await?;
            self.backends.destroy(&tenant_id)?;
            Ok::<_, WalletError>(purged)
        };

        match removal.await {
            Ok(purged) => {
                profile.mark_closed();
                self.profiles.lock().await.remove(&tenant_id);
                info!(tenant = %tenant_id, records = purged, "profile removed");
                Ok(())
            }
            Err(e) => {
                profile.reopen();
                Err(e)
            }
        }
    }

    pub async fn tenant_for_key(&self, verkey: &str) -> WalletResult<Option<String>> {
        self.keys.lookup(verkey).await
    }

    /// Profile of the tenant holding `verkey`
    pub async fn profile_for_key(&self, verkey: &str) -> WalletResult<Option<Profile>> {
        match self.keys.lookup(verkey).await? {
            Some(tenant_id) => match self.open_profile(&tenant_id).await {
                Ok(profile) => Ok(Some(profile)),
                Err(WalletError::NotFound(_)) => Ok(None),
                Err(e) => Err(e),
            },
            None => Ok(None),
        }
    }

    pub async fn list_tenants(&self) -> WalletResult<Vec<String>> {
        let mut tenants = Vec::new();
        let mut offset = 0;
        loop {
            let page = self
                .registry
                .scan(REGISTRY_SCOPE, TENANT_RECORD, &TagFilter::All, offset, REGISTRY_PAGE)
                .await?;
            offset += page.len();
            let last = page.len() < REGISTRY_PAGE;
            tenants.extend(page.into_iter().map(|r| r.id));
            if last {
                return Ok(tenants);
            }
        }
    }
}
