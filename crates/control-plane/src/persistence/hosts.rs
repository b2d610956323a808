use chrono::{DateTime, Duration, Utc};
use common::api::{ApplyStatus, CapabilitySet, HostArchetype};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{KvStore, cas_json, get_json, index, keys};
use crate::Result;
use crate::history::ApplyHistory;
use crate::resolver::ResolveContext;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HostRecord {
    pub id: Uuid,
    pub name: String,
    pub archetype: HostArchetype,
    pub token_hash: String,
    #[serde(default)]
    pub capabilities: Option<CapabilitySet>,
    #[serde(default)]
    pub entry_domain: Option<String>,
    #[serde(default)]
    pub entry_domain_direct: Option<String>,
    #[serde(default)]
    pub entry_ip: Option<String>,
    #[serde(default)]
    pub region: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub desired_version: u64,
    #[serde(default)]
    pub applied_version: u64,
    /// Highest version ever written for this host.
    #[serde(default)]
    pub latest_version: u64,
    #[serde(default)]
    pub last_seen: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_apply_status: Option<ApplyStatus>,
    #[serde(default)]
    pub last_apply_message: Option<String>,
    #[serde(default)]
    pub last_apply_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub consecutive_failures: u32,
    #[serde(default)]
    pub history: ApplyHistory,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl HostRecord {
    pub fn new(name: impl Into<String>, archetype: HostArchetype, token_hash: String) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            archetype,
            token_hash,
            capabilities: None,
            entry_domain: None,
            entry_domain_direct: None,
            entry_ip: None,
            region: None,
            tags: Vec::new(),
            desired_version: 0,
            applied_version: 0,
            latest_version: 0,
            last_seen: None,
            last_apply_status: None,
            last_apply_message: None,
            last_apply_at: None,
            consecutive_failures: 0,
            history: ApplyHistory::default(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn resolve_context(&self) -> ResolveContext<'_> {
        ResolveContext {
            archetype: self.archetype,
            entry_domain: self.entry_domain.as_deref(),
            entry_domain_direct: self.entry_domain_direct.as_deref(),
        }
    }

    pub fn is_online(&self, now: DateTime<Utc>, threshold: Duration) -> bool {
        self.last_seen
            .is_some_and(|seen| now.signed_duration_since(seen) <= threshold)
    }
}

/// What a read-modify-write closure decided.
pub enum Mutation<T> {
    /// Persist the mutated record.
    Write(T),
    /// Leave the stored record untouched.
    Skip(T),
}

#[derive(Debug, Clone)]
pub struct Updated<T> {
    pub host: HostRecord,
    pub output: T,
    pub written: bool,
}

pub async fn get_host(kv: &dyn KvStore, id: Uuid) -> Result<Option<HostRecord>> {
    Ok(get_json::<HostRecord>(kv, &keys::host(id))
        .await?
        .map(|versioned| versioned.value))
}

pub async fn create_host(kv: &dyn KvStore, host: &HostRecord) -> Result<()> {
    if !cas_json(kv, &keys::host(host.id), None, host).await? {
        anyhow::bail!("host {} already exists", host.id);
    }
    index::add_id(kv, keys::HOSTS_INDEX, &host.id.to_string()).await
}

/// Hosts named by the index, oldest first. Ids whose record is gone or not yet visible are skipped.
pub async fn list_hosts(kv: &dyn KvStore) -> Result<Vec<HostRecord>> {
    let ids = index::read_index::<String>(kv, keys::HOSTS_INDEX).await?;
    let mut hosts = Vec::with_capacity(ids.len());
    for id in ids {
        let Ok(id) = id.parse::<Uuid>() else {
            continue;
        };
        if let Some(host) = get_host(kv, id).await? {
            hosts.push(host);
        }
    }
    hosts.sort_by_key(|host| (host.created_at, host.id));
    Ok(hosts)
}

/// Removes the record, its index entry, and every stored plan.
pub async fn delete_host(kv: &dyn KvStore, id: Uuid) -> Result<bool> {
    let existed = kv.delete(&keys::host(id)).await?;
    index::remove_id(kv, keys::HOSTS_INDEX, &id.to_string()).await?;
    for entry in kv.list_prefix(&keys::plan_prefix(id)).await? {
        kv.delete(&entry.key).await?;
    }
    Ok(existed)
}

/// Read-modify-write on one host record.
///
/// Each attempt re-reads the record, applies `mutate`, and writes back only if the revision is
/// unchanged, so a concurrent writer never has its fields silently overwritten. Returns
/// `Ok(None)` when the host does not exist.
pub async fn update_host<T, E, F>(
    kv: &dyn KvStore,
    id: Uuid,
    attempts: usize,
    mut mutate: F,
) -> std::result::Result<Option<Updated<T>>, E>
where
    E: From<anyhow::Error>,
    F: FnMut(&mut HostRecord) -> std::result::Result<Mutation<T>, E>,
{
    let key = keys::host(id);
    for _ in 0..attempts.max(1) {
        let Some(current) = get_json::<HostRecord>(kv, &key).await? else {
            return Ok(None);
        };
        let mut host = current.value.clone();
        match mutate(&mut host)? {
            Mutation::Skip(output) => {
                return Ok(Some(Updated {
                    host: current.value,
                    output,
                    written: false,
                }));
            }
            Mutation::Write(output) => {
                host.updated_at = Utc::now();
                if cas_json(kv, &key, Some(current.revision), &host).await? {
                    return Ok(Some(Updated {
                        host,
                        output,
                        written: true,
                    }));
                }
                tracing::debug!(host_id = %id, "host record changed underneath update; retrying");
            }
        }
    }
    Err(anyhow::anyhow!("host {id} update lost {attempts} consecutive races").into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::{MemoryKv, put_json};

    fn host() -> HostRecord {
        HostRecord::new("edge-1", HostArchetype::Edge, "hash".into())
    }

    #[tokio::test]
    async fn create_list_delete_round_trip() {
        let kv = MemoryKv::new();
        let first = host();
        let second = HostRecord::new("full-1", HostArchetype::Full, "hash".into());
        create_host(&kv, &first).await.unwrap();
        create_host(&kv, &second).await.unwrap();
        assert!(create_host(&kv, &first).await.is_err());

        put_json(&kv, &keys::plan(first.id, 1), &serde_json::json!({})).await.unwrap();

        let names: Vec<_> = list_hosts(&kv).await.unwrap().into_iter().map(|h| h.name).collect();
        assert_eq!(names.len(), 2);

        assert!(delete_host(&kv, first.id).await.unwrap());
        assert!(kv.list_prefix(&keys::plan_prefix(first.id)).await.unwrap().is_empty());
        assert_eq!(list_hosts(&kv).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn update_skips_write_when_closure_declines() {
        let kv = MemoryKv::new();
        let record = host();
        create_host(&kv, &record).await.unwrap();

        let updated = update_host::<_, anyhow::Error, _>(&kv, record.id, 3, |_| Ok(Mutation::Skip(7)))
            .await
            .unwrap()
            .unwrap();
        assert!(!updated.written);
        assert_eq!(updated.output, 7);
        assert_eq!(kv.get(&keys::host(record.id)).await.unwrap().unwrap().revision, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn update_retries_after_concurrent_write() {
        let kv = MemoryKv::new();
        let record = host();
        create_host(&kv, &record).await.unwrap();

        let mut interfered = false;
        let updated = update_host::<_, anyhow::Error, _>(&kv, record.id, 3, |host| {
            if !interfered {
                interfered = true;
                // a heartbeat lands between read and write
                let mut other = host.clone();
                other.last_seen = Some(Utc::now());
                block_on(put_json(&kv, &keys::host(other.id), &other)).unwrap();
            }
            host.desired_version = 4;
            Ok(Mutation::Write(()))
        })
        .await
        .unwrap()
        .unwrap();

        assert!(updated.written);
        let stored = get_host(&kv, record.id).await.unwrap().unwrap();
        assert_eq!(stored.desired_version, 4);
        assert!(stored.last_seen.is_some(), "concurrent field must survive");
    }

    fn block_on<F: std::future::Future>(future: F) -> F::Output {
        tokio::task::block_in_place(|| tokio::runtime::Handle::current().block_on(future))
    }

    #[tokio::test]
    async fn missing_host_yields_none() {
        let kv = MemoryKv::new();
        let result = update_host::<(), anyhow::Error, _>(&kv, Uuid::new_v4(), 3, |_| {
            Ok(Mutation::Write(()))
        })
        .await
        .unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn update_converges_once_new_record_is_visible() {
        let kv = MemoryKv::with_visibility_lag(1);
        let record = host();
        create_host(&kv, &record).await.unwrap();

        let bump = |host: &mut HostRecord| -> anyhow::Result<Mutation<()>> {
            host.desired_version = host.desired_version.max(1);
            Ok(Mutation::Write(()))
        };
        assert!(update_host(&kv, record.id, 3, bump).await.unwrap().is_none());
        assert_eq!(kv.get(&keys::host(record.id)).await.unwrap().unwrap().revision, 1);

        let updated = update_host(&kv, record.id, 3, bump).await.unwrap().unwrap();
        assert!(updated.written);
        let stored = get_host(&kv, record.id).await.unwrap().unwrap();
        assert_eq!(stored.desired_version, 1);
    }

    #[test]
    fn online_threshold_is_inclusive() {
        let mut record = host();
        let now = Utc::now();
        assert!(!record.is_online(now, Duration::seconds(300)));
        record.last_seen = Some(now - Duration::seconds(300));
        assert!(record.is_online(now, Duration::seconds(300)));
        record.last_seen = Some(now - Duration::seconds(301));
        assert!(!record.is_online(now, Duration::seconds(300)));
    }
}
