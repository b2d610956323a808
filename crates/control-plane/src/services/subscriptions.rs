use chrono::Utc;
use common::api::{
    ExportFormat, SubscriptionCreateRequest, SubscriptionUpdateRequest, SubscriptionView,
};
use tracing::{debug, info};
use uuid::Uuid;

use crate::app_state::AppState;
use crate::error::{ApiResult, AppError};
use crate::export;
use crate::persistence::{HostRecord, hosts, plans, subscriptions};
use crate::tokens::generate_token;
use crate::validation;

fn normalize_profile_ids(ids: Vec<String>) -> Vec<String> {
    let mut out: Vec<String> = Vec::with_capacity(ids.len());
    for id in ids {
        let id = id.trim().to_string();
        if !id.is_empty() && !out.contains(&id) {
            out.push(id);
        }
    }
    out
}

fn normalize_host_ids(ids: Vec<Uuid>) -> Vec<Uuid> {
    let mut out: Vec<Uuid> = Vec::with_capacity(ids.len());
    for id in ids {
        if !out.contains(&id) {
            out.push(id);
        }
    }
    out
}

pub async fn list_subscriptions(state: &AppState) -> ApiResult<Vec<SubscriptionView>> {
    Ok(subscriptions::list_subscriptions(state.kv.as_ref()).await?)
}

pub async fn get_subscription(state: &AppState, token: &str) -> ApiResult<SubscriptionView> {
    subscriptions::get_subscription(state.kv.as_ref(), token)
        .await?
        .ok_or_else(|| AppError::subscription_not_found("subscription not found"))
}

pub async fn create_subscription(
    state: &AppState,
    req: SubscriptionCreateRequest,
) -> ApiResult<SubscriptionView> {
    let name = validation::normalize_name("name", &req.name, &state.limits)?;
    let remark = validation::normalize_opt("remark", req.remark, state.limits.max_field_len)?
        .unwrap_or_default();

    let now = Utc::now();
    let subscription = SubscriptionView {
        token: generate_token(),
        name,
        enabled: req.enabled.unwrap_or(true),
        visible_host_ids: normalize_host_ids(req.visible_host_ids),
        visible_profile_ids: normalize_profile_ids(req.visible_profile_ids),
        remark,
        created_at: now,
        updated_at: now,
    };
    subscriptions::create_subscription(state.kv.as_ref(), &subscription).await?;
    info!(
        name = %subscription.name,
        hosts = subscription.visible_host_ids.len(),
        profiles = subscription.visible_profile_ids.len(),
        "subscription created"
    );
    Ok(subscription)
}

pub async fn update_subscription(
    state: &AppState,
    token: &str,
    req: SubscriptionUpdateRequest,
) -> ApiResult<SubscriptionView> {
    let mut subscription = get_subscription(state, token).await?;

    if let Some(name) = &req.name {
        subscription.name = validation::normalize_name("name", name, &state.limits)?;
    }
    if let Some(enabled) = req.enabled {
        subscription.enabled = enabled;
    }
    if let Some(ids) = req.visible_host_ids {
        subscription.visible_host_ids = normalize_host_ids(ids);
    }
    if let Some(ids) = req.visible_profile_ids {
        subscription.visible_profile_ids = normalize_profile_ids(ids);
    }
    if let Some(remark) = req.remark {
        subscription.remark =
            validation::normalize_opt("remark", Some(remark), state.limits.max_field_len)?
                .unwrap_or_default();
    }
    subscription.updated_at = Utc::now();

    subscriptions::save_subscription(state.kv.as_ref(), &subscription).await?;
    info!(name = %subscription.name, enabled = subscription.enabled, "subscription updated");
    Ok(subscription)
}

pub async fn delete_subscription(state: &AppState, token: &str) -> ApiResult<()> {
    if !subscriptions::delete_subscription(state.kv.as_ref(), token).await? {
        return Err(AppError::subscription_not_found("subscription not found"));
    }
    info!("subscription deleted");
    Ok(())
}

async fn visible_hosts(state: &AppState, subscription: &SubscriptionView) -> ApiResult<Vec<HostRecord>> {
    let kv = state.kv.as_ref();
    if subscription.visible_host_ids.is_empty() {
        return Ok(hosts::list_hosts(kv).await?);
    }
    let mut out = Vec::with_capacity(subscription.visible_host_ids.len());
    for id in &subscription.visible_host_ids {
        if let Some(host) = hosts::get_host(kv, *id).await? {
            out.push(host);
        }
    }
    Ok(out)
}

/// Renders the export for a subscription token from every visible host's applied plan.
pub async fn render(state: &AppState, token: &str, format: ExportFormat) -> ApiResult<String> {
    let subscription = get_subscription(state, token).await?;
    if !subscription.enabled {
        return Err(AppError::subscription_disabled("subscription is disabled"));
    }

    let server_side = state.registry.server_side_names();
    let mut records = Vec::new();
    for host in visible_hosts(state, &subscription).await? {
        if host.applied_version == 0 {
            continue;
        }
        let Some(plan) =
            plans::get_plan(state.kv.as_ref(), host.id, host.applied_version).await?
        else {
            debug!(host_id = %host.id, version = host.applied_version, "applied plan missing, host skipped");
            continue;
        };
        records.extend(export::collect_records(
            &host,
            &plan,
            &subscription.visible_profile_ids,
            &server_side,
        ));
    }
    export::dedupe_names(&mut records);

    let body = export::render(format, &records)?;
    crate::metrics::record_subscription_render(format);
    debug!(format = format.as_str(), records = records.len(), "subscription rendered");
    Ok(body)
}
