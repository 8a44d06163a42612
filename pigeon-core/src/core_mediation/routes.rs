//! Mediator keylist: which connection each recipient key belongs to

use super::errors::{RoutingError, RoutingResult};
use super::messages::{KeylistAction, KeylistResult, KeylistUpdateItem, KeylistUpdated};
use crate::core_envelope::decode_verkey;
use crate::core_wallet::{current_timestamp_ms, Profile, StorageRecord, TagFilter, WalletError, WriteOp};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use uuid::Uuid;

pub const ROUTE_RECORD: &str = "route";

/// Stored under the recipient key, so a key has at most one owner
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteRecord {
    pub route_id: String,
    pub recipient_key: String,
    pub connection_id: String,
    pub created_at: i64,
}

impl RouteRecord {
    fn to_storage(&self) -> RoutingResult<StorageRecord> {
        Ok(StorageRecord::from_value(ROUTE_RECORD, &self.recipient_key, self)?
            .with_tag("connection_id", &self.connection_id))
    }
}

pub struct Routes<'a> {
    profile: &'a Profile,
}

impl<'a> Routes<'a> {
    pub fn new(profile: &'a Profile) -> Self {
        Self { profile }
    }

    async fn owner(&self, key: &str) -> RoutingResult<Option<RouteRecord>> {
        match self.profile.get(ROUTE_RECORD, key).await {
            Ok(record) => Ok(Some(record.value_as()?)),
            Err(WalletError::NotFound(_)) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Route `keys` to `connection_id`
    ///
    /// Keys already routed to the same connection are left alone. If any key
    /// belongs to another connection nothing is written.
    pub async fn create_routes(&self, connection_id: &str, keys: &[String]) -> RoutingResult<Vec<RouteRecord>> {
        let mut created = Vec::new();
        for key in keys {
            match self.owner(key).await? {
                Some(route) if route.connection_id == connection_id => continue,
                Some(route) => {
                    return Err(RoutingError::RouteConflict { key: key.clone(), owner: route.connection_id })
                }
                None if created.iter().any(|r: &RouteRecord| &r.recipient_key == key) => continue,
                None => created.push(RouteRecord {
                    route_id: Uuid::new_v4().to_string(),
                    recipient_key: key.clone(),
                    connection_id: connection_id.to_string(),
                    created_at: current_timestamp_ms(),
                }),
            }
        }

        let ops = created.iter().map(|r| r.to_storage().map(WriteOp::Insert)).collect::<RoutingResult<Vec<_>>>()?;
        if !ops.is_empty() {
            self.profile.commit(ops).await.map_err(|e| match e {
                // Lost a race with another connection registering the key
                WalletError::DuplicateRecord { id, .. } => {
                    RoutingError::RouteConflict { key: id, owner: "another connection".to_string() }
                }
                other => other.into(),
            })?;
        }
        debug!(tenant = self.profile.tenant_id(), connection = connection_id, added = created.len(), "routes created");
        Ok(created)
    }

    /// Remove routes for `keys`; unknown keys are ignored. Returns the keys removed.
    pub async fn delete_routes(&self, keys: &[String]) -> RoutingResult<Vec<String>> {
        let mut ops = Vec::new();
        let mut removed = Vec::new();
        for key in keys {
            if self.owner(key).await?.is_some() && !removed.contains(key) {
                ops.push(WriteOp::Delete { record_type: ROUTE_RECORD.to_string(), id: key.clone() });
                removed.push(key.clone());
            }
        }
        if !ops.is_empty() {
            self.profile.commit(ops).await?;
        }
        Ok(removed)
    }

    /// Connection that registered `key`
    pub async fn get_recipient(&self, key: &str) -> RoutingResult<String> {
        self.owner(key)
            .await?
            .map(|route| route.connection_id)
            .ok_or_else(|| RoutingError::NotFound(key.to_string()))
    }

    pub async fn get_routes(&self, connection_id: &str) -> RoutingResult<Vec<String>> {
        let records = self.profile.find_all(ROUTE_RECORD, TagFilter::eq("connection_id", connection_id)).await?;
        records
            .iter()
            .map(|r| r.value_as::<RouteRecord>().map(|route| route.recipient_key).map_err(RoutingError::from))
            .collect()
    }

    /// Apply a keylist update from `connection_id`, one result per item
    pub async fn apply_keylist_update(&self, connection_id: &str, updates: &[KeylistUpdateItem]) -> Vec<KeylistUpdated> {
        let mut results = Vec::with_capacity(updates.len());
        for update in updates {
            let result = match self.apply_one(connection_id, update).await {
                Ok(result) => result,
                Err(e) => {
                    warn!(
                        tenant = self.profile.tenant_id(),
                        connection = connection_id,
                        key = %update.recipient_key,
                        error = %e,
                        "keylist update failed"
                    );
                    KeylistResult::ServerError
                }
            };
            results.push(KeylistUpdated {
                recipient_key: update.recipient_key.clone(),
                action: update.action,
                result,
            });
        }
        results
    }

    async fn apply_one(&self, connection_id: &str, update: &KeylistUpdateItem) -> RoutingResult<KeylistResult> {
        let key = std::slice::from_ref(&update.recipient_key);
        match update.action {
            KeylistAction::Add => {
                decode_verkey(&update.recipient_key)
                    .map_err(|_| RoutingError::NotFound(format!("invalid key {}", update.recipient_key)))?;
                let created = self.create_routes(connection_id, key).await?;
                Ok(if created.is_empty() { KeylistResult::NoChange } else { KeylistResult::Success })
            }
            KeylistAction::Remove => match self.owner(&update.recipient_key).await? {
                None => Ok(KeylistResult::NoChange),
                Some(route) if route.connection_id != connection_id => Err(RoutingError::RouteConflict {
                    key: update.recipient_key.clone(),
                    owner: route.connection_id,
                }),
                Some(_) => {
                    self.delete_routes(key).await?;
                    Ok(KeylistResult::Success)
                }
            },
        }
    }
}
