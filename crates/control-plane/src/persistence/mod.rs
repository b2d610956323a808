//! Durable state on top of a single-key store.
//!
//! Every record lives under its own key; there are no multi-key transactions. Multi-step updates
//! go through revision-checked compare-and-swap on one key at a time.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Serialize, de::DeserializeOwned};
use sqlx::{FromRow, SqlitePool};

use crate::Result;

pub mod deploys;
pub mod hosts;
pub mod index;
pub mod memory;
pub mod migrations;
pub mod plans;
pub mod profiles;
pub mod sqlite;
pub mod subscriptions;

pub type Db = SqlitePool;

pub use hosts::{HostRecord, Mutation};
pub use memory::MemoryKv;
pub use migrations::{MigrationRunOutcome, MigrationSnapshot};
pub use sqlite::SqliteKv;

#[derive(Debug, Clone, PartialEq, Eq, FromRow)]
pub struct KvEntry {
    pub key: String,
    pub value: String,
    pub revision: i64,
    pub updated_at: DateTime<Utc>,
}

#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<KvEntry>>;

    /// Unconditional write; returns the new revision.
    async fn put(&self, key: &str, value: &str) -> Result<i64>;

    /// Writes only when the stored revision equals `expected`; `None` means the key must be absent.
    async fn compare_and_swap(&self, key: &str, expected: Option<i64>, value: &str)
    -> Result<bool>;

    async fn delete(&self, key: &str) -> Result<bool>;

    /// Entries whose key starts with `prefix`, ordered by key.
    async fn list_prefix(&self, prefix: &str) -> Result<Vec<KvEntry>>;
}

pub type KvRef = Arc<dyn KvStore>;

/// A decoded value plus the revision it was read at.
#[derive(Debug, Clone)]
pub struct Versioned<T> {
    pub value: T,
    pub revision: i64,
}

pub async fn get_json<T: DeserializeOwned>(kv: &dyn KvStore, key: &str) -> Result<Option<Versioned<T>>> {
    let Some(entry) = kv.get(key).await? else {
        return Ok(None);
    };
    let value = serde_json::from_str(&entry.value)
        .map_err(|err| anyhow::anyhow!("decode {key}: {err}"))?;
    Ok(Some(Versioned {
        value,
        revision: entry.revision,
    }))
}

pub async fn put_json<T: Serialize + ?Sized>(kv: &dyn KvStore, key: &str, value: &T) -> Result<i64> {
    let encoded = serde_json::to_string(value)?;
    kv.put(key, &encoded).await
}

pub async fn cas_json<T: Serialize + ?Sized>(
    kv: &dyn KvStore,
    key: &str,
    expected: Option<i64>,
    value: &T,
) -> Result<bool> {
    let encoded = serde_json::to_string(value)?;
    kv.compare_and_swap(key, expected, &encoded).await
}

pub mod keys {
    use uuid::Uuid;

    pub const HOSTS_INDEX: &str = "idx:hosts";
    pub const PROFILES_INDEX: &str = "idx:profiles";
    pub const DEPLOYS_INDEX: &str = "idx:deploys";
    pub const SUBSCRIPTIONS_INDEX: &str = "idx:subs";

    pub fn host(id: Uuid) -> String {
        format!("host:{id}")
    }

    pub fn plan(host_id: Uuid, version: u64) -> String {
        format!("plan:{host_id}:{version}")
    }

    pub fn plan_prefix(host_id: Uuid) -> String {
        format!("plan:{host_id}:")
    }

    pub fn profile(id: &str) -> String {
        format!("profile:{id}")
    }

    pub fn profile_override(id: &str) -> String {
        format!("profile_override:{id}")
    }

    pub fn deploy(id: Uuid) -> String {
        format!("deploy:{id}")
    }

    pub fn subscription(token: &str) -> String {
        format!("sub:{token}")
    }
}
