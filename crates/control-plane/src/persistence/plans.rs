use common::api::Plan;
use uuid::Uuid;

use super::{KvStore, cas_json, get_json, keys};
use crate::Result;

/// Writes a new plan version. Returns false when the slot is already taken; an existing plan is
/// never overwritten.
pub async fn create_plan(kv: &dyn KvStore, plan: &Plan) -> Result<bool> {
    cas_json(kv, &keys::plan(plan.host_id(), plan.version()), None, plan).await
}

pub async fn get_plan(kv: &dyn KvStore, host_id: Uuid, version: u64) -> Result<Option<Plan>> {
    Ok(get_json::<Plan>(kv, &keys::plan(host_id, version))
        .await?
        .map(|versioned| versioned.value))
}

pub async fn plan_exists(kv: &dyn KvStore, host_id: Uuid, version: u64) -> Result<bool> {
    Ok(kv.get(&keys::plan(host_id, version)).await?.is_some())
}

pub async fn delete_plan(kv: &dyn KvStore, host_id: Uuid, version: u64) -> Result<bool> {
    kv.delete(&keys::plan(host_id, version)).await
}

/// Stored versions for a host, ascending.
pub async fn list_plan_versions(kv: &dyn KvStore, host_id: Uuid) -> Result<Vec<u64>> {
    let prefix = keys::plan_prefix(host_id);
    let mut versions: Vec<u64> = kv
        .list_prefix(&prefix)
        .await?
        .into_iter()
        .filter_map(|entry| entry.key.strip_prefix(&prefix)?.parse().ok())
        .collect();
    versions.sort_unstable();
    Ok(versions)
}
