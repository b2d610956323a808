//! JSON list indices kept under their own keys.
//!
//! An index is updated separately from the records it points at, so readers must tolerate ids
//! whose record is missing or not yet visible.

use serde::{Serialize, de::DeserializeOwned};

use super::{KvStore, cas_json, get_json};
use crate::Result;

const INDEX_RETRIES: usize = 8;

pub async fn read_index<T: DeserializeOwned>(kv: &dyn KvStore, key: &str) -> Result<Vec<T>> {
    Ok(get_json::<Vec<T>>(kv, key)
        .await?
        .map(|versioned| versioned.value)
        .unwrap_or_default())
}

/// Applies `change` to the list and writes it back under compare-and-swap, re-reading on
/// conflict. `change` returns false when nothing needs writing.
pub async fn modify_index<T, F>(kv: &dyn KvStore, key: &str, mut change: F) -> Result<()>
where
    T: Serialize + DeserializeOwned,
    F: FnMut(&mut Vec<T>) -> bool,
{
    for _ in 0..INDEX_RETRIES {
        let (mut items, revision) = match get_json::<Vec<T>>(kv, key).await? {
            Some(versioned) => (versioned.value, Some(versioned.revision)),
            None => (Vec::new(), None),
        };
        if !change(&mut items) {
            return Ok(());
        }
        if cas_json(kv, key, revision, &items).await? {
            return Ok(());
        }
    }
    anyhow::bail!("index {key} lost {INDEX_RETRIES} consecutive update races")
}

pub async fn add_id(kv: &dyn KvStore, key: &str, id: &str) -> Result<()> {
    modify_index::<String, _>(kv, key, |ids| {
        if ids.iter().any(|existing| existing == id) {
            return false;
        }
        ids.push(id.to_string());
        true
    })
    .await
}

pub async fn remove_id(kv: &dyn KvStore, key: &str, id: &str) -> Result<()> {
    modify_index::<String, _>(kv, key, |ids| {
        let before = ids.len();
        ids.retain(|existing| existing != id);
        ids.len() != before
    })
    .await
}
