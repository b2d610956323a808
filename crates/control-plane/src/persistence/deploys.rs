use common::api::{DeployOutcome, DeployRecord, DeploySummary};
use uuid::Uuid;

use super::{KvStore, cas_json, get_json, index, keys};
use crate::Result;

/// Summaries kept in the deploy index; older records stay readable by id.
const INDEX_CAPACITY: usize = 500;

pub fn summarize(record: &DeployRecord) -> DeploySummary {
    let count = |outcome: DeployOutcome| {
        record
            .results
            .iter()
            .filter(|result| result.status == outcome)
            .count()
    };
    DeploySummary {
        id: record.id,
        created_at: record.created_at,
        profile_ids: record.profile_ids.clone(),
        host_count: record.host_ids.len(),
        deployed: count(DeployOutcome::Deployed),
        skipped: count(DeployOutcome::Skipped),
        errors: count(DeployOutcome::Error),
        version_min: record.version_min,
        version_max: record.version_max,
    }
}

pub async fn create_deploy(kv: &dyn KvStore, record: &DeployRecord) -> Result<()> {
    if !cas_json(kv, &keys::deploy(record.id), None, record).await? {
        anyhow::bail!("deploy {} already exists", record.id);
    }
    let summary = summarize(record);
    index::modify_index::<DeploySummary, _>(kv, keys::DEPLOYS_INDEX, |entries| {
        if entries.iter().any(|entry| entry.id == summary.id) {
            return false;
        }
        entries.push(summary.clone());
        if entries.len() > INDEX_CAPACITY {
            entries.sort_by_key(|entry| entry.created_at);
            let excess = entries.len() - INDEX_CAPACITY;
            entries.drain(..excess);
        }
        true
    })
    .await
}

pub async fn get_deploy(kv: &dyn KvStore, id: Uuid) -> Result<Option<DeployRecord>> {
    Ok(get_json::<DeployRecord>(kv, &keys::deploy(id))
        .await?
        .map(|versioned| versioned.value))
}

/// Newest `limit` summaries by creation time.
pub async fn list_deploys(kv: &dyn KvStore, limit: usize) -> Result<Vec<DeploySummary>> {
    let mut entries = index::read_index::<DeploySummary>(kv, keys::DEPLOYS_INDEX).await?;
    entries.sort_by(|a, b| b.created_at.cmp(&a.created_at));
    entries.truncate(limit);
    Ok(entries)
}
