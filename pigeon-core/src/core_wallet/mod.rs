//! Wallet: tenant-scoped record and key storage

pub mod backend;
pub mod errors;
pub mod keystore;
pub mod memory_store;
pub mod profile;
pub mod record;
pub mod search;
pub mod settings;
pub mod sql_store;
pub mod tenant;

pub use backend::StorageBackend;
pub use errors::{WalletError, WalletResult};
pub use memory_store::MemoryStore;
pub use profile::{ActivityGuard, Profile};
pub use record::{current_timestamp_ms, StorageRecord, TagFilter, Tags, WriteOp, TENANT_TAG};
pub use search::RecordSearch;
pub use settings::{KeyDerivation, ProfileSettings};
pub use sql_store::SqlStore;
pub use tenant::TenantManager;
