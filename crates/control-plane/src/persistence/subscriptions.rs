use common::api::SubscriptionView;

use super::{KvStore, cas_json, get_json, index, keys, put_json};
use crate::Result;

pub async fn get_subscription(kv: &dyn KvStore, token: &str) -> Result<Option<SubscriptionView>> {
    Ok(get_json::<SubscriptionView>(kv, &keys::subscription(token))
        .await?
        .map(|versioned| versioned.value))
}

pub async fn create_subscription(kv: &dyn KvStore, subscription: &SubscriptionView) -> Result<()> {
    if !cas_json(kv, &keys::subscription(&subscription.token), None, subscription).await? {
        anyhow::bail!("subscription token collision");
    }
    index::add_id(kv, keys::SUBSCRIPTIONS_INDEX, &subscription.token).await
}

pub async fn save_subscription(kv: &dyn KvStore, subscription: &SubscriptionView) -> Result<()> {
    put_json(kv, &keys::subscription(&subscription.token), subscription).await?;
    Ok(())
}

pub async fn delete_subscription(kv: &dyn KvStore, token: &str) -> Result<bool> {
    let existed = kv.delete(&keys::subscription(token)).await?;
    index::remove_id(kv, keys::SUBSCRIPTIONS_INDEX, token).await?;
    Ok(existed)
}

pub async fn list_subscriptions(kv: &dyn KvStore) -> Result<Vec<SubscriptionView>> {
    let tokens = index::read_index::<String>(kv, keys::SUBSCRIPTIONS_INDEX).await?;
    let mut subscriptions = Vec::with_capacity(tokens.len());
    for token in tokens {
        if let Some(subscription) = get_subscription(kv, &token).await? {
            subscriptions.push(subscription);
        }
    }
    subscriptions.sort_by_key(|subscription| subscription.created_at);
    Ok(subscriptions)
}
