use chrono::{DateTime, Utc};
use common::api::Settings;
use serde::{Deserialize, Serialize};

use super::{KvStore, cas_json, get_json, index, keys, put_json};
use crate::Result;
use crate::registry::Template;

/// Operator patch layered over an immutable built-in template.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProfileOverride {
    #[serde(default)]
    pub defaults: Settings,
    #[serde(default)]
    pub description: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl ProfileOverride {
    /// Built-in template with override defaults merged key by key.
    pub fn apply(&self, template: &Template) -> Template {
        let mut merged = template.clone();
        for (key, value) in &self.defaults {
            merged.defaults.insert(key.clone(), value.clone());
        }
        if let Some(description) = &self.description {
            merged.description = description.clone();
        }
        merged.updated_at = Some(self.updated_at);
        merged
    }
}

pub async fn get_override(kv: &dyn KvStore, id: &str) -> Result<Option<ProfileOverride>> {
    Ok(get_json::<ProfileOverride>(kv, &keys::profile_override(id))
        .await?
        .map(|versioned| versioned.value))
}

pub async fn put_override(kv: &dyn KvStore, id: &str, patch: &ProfileOverride) -> Result<()> {
    put_json(kv, &keys::profile_override(id), patch).await?;
    Ok(())
}

pub async fn delete_override(kv: &dyn KvStore, id: &str) -> Result<bool> {
    kv.delete(&keys::profile_override(id)).await
}

pub async fn get_custom(kv: &dyn KvStore, id: &str) -> Result<Option<Template>> {
    Ok(get_json::<Template>(kv, &keys::profile(id))
        .await?
        .map(|versioned| versioned.value))
}

/// Returns false when a custom profile with the same id already exists.
pub async fn create_custom(kv: &dyn KvStore, template: &Template) -> Result<bool> {
    if !cas_json(kv, &keys::profile(&template.id), None, template).await? {
        return Ok(false);
    }
    index::add_id(kv, keys::PROFILES_INDEX, &template.id).await?;
    Ok(true)
}

pub async fn save_custom(kv: &dyn KvStore, template: &Template) -> Result<()> {
    put_json(kv, &keys::profile(&template.id), template).await?;
    Ok(())
}

pub async fn delete_custom(kv: &dyn KvStore, id: &str) -> Result<bool> {
    let existed = kv.delete(&keys::profile(id)).await?;
    index::remove_id(kv, keys::PROFILES_INDEX, id).await?;
    Ok(existed)
}

/// Custom profiles in creation order.
pub async fn list_customs(kv: &dyn KvStore) -> Result<Vec<Template>> {
    let ids = index::read_index::<String>(kv, keys::PROFILES_INDEX).await?;
    let mut templates = Vec::with_capacity(ids.len());
    for id in ids {
        if let Some(template) = get_custom(kv, &id).await? {
            templates.push(template);
        }
    }
    Ok(templates)
}
