use chrono::{DateTime, Utc};
use common::api::{
    CapabilitySet, HostArchetype, HostCreateRequest, HostCreateResponse, HostDiagnosis,
    HostUpdateRequest, HostUpdateResponse, HostView, ManagerConnection, Plan, TemplateSync,
};
use tracing::info;
use uuid::Uuid;

use crate::app_state::AppState;
use crate::error::{ApiResult, AppError};
use crate::persistence::{HostRecord, Mutation, hosts, plans};
use crate::tokens::{generate_token, hash_token, verify_token};
use crate::validation;

pub fn host_view(state: &AppState, host: &HostRecord, now: DateTime<Utc>) -> HostView {
    HostView {
        id: host.id,
        name: host.name.clone(),
        archetype: host.archetype,
        entry_domain: host.entry_domain.clone(),
        entry_domain_direct: host.entry_domain_direct.clone(),
        entry_ip: host.entry_ip.clone(),
        region: host.region.clone(),
        tags: host.tags.clone(),
        capabilities: host.capabilities.clone(),
        effective_capabilities: state
            .registry
            .effective_capabilities(host.archetype, host.capabilities.as_ref()),
        desired_version: host.desired_version,
        applied_version: host.applied_version,
        latest_version: host.latest_version,
        last_seen: host.last_seen,
        is_online: host.is_online(now, state.distribution.online_threshold()),
        last_apply_status: host.last_apply_status,
        last_apply_message: host.last_apply_message.clone(),
        last_apply_at: host.last_apply_at,
        consecutive_failures: host.consecutive_failures,
        created_at: host.created_at,
    }
}

fn validate_capabilities(
    state: &AppState,
    archetype: HostArchetype,
    capabilities: Option<CapabilitySet>,
) -> ApiResult<Option<CapabilitySet>> {
    let Some(caps) = capabilities else {
        return Ok(None);
    };
    let superset = state.registry.default_capabilities(archetype);
    if !caps.is_subset_of(&superset) {
        return Err(AppError::validation(format!(
            "capabilities exceed what a {archetype} host supports"
        )));
    }
    Ok(Some(caps))
}

pub async fn list_hosts(state: &AppState) -> ApiResult<Vec<HostView>> {
    let now = Utc::now();
    let hosts = hosts::list_hosts(state.kv.as_ref()).await?;
    Ok(hosts.iter().map(|host| host_view(state, host, now)).collect())
}

pub async fn load_host(state: &AppState, host_id: Uuid) -> ApiResult<HostRecord> {
    hosts::get_host(state.kv.as_ref(), host_id)
        .await?
        .ok_or_else(|| AppError::host_not_found(format!("host {host_id} not found")))
}

pub async fn get_host(state: &AppState, host_id: Uuid) -> ApiResult<HostView> {
    let host = load_host(state, host_id).await?;
    Ok(host_view(state, &host, Utc::now()))
}

pub async fn create_host(state: &AppState, req: HostCreateRequest) -> ApiResult<HostCreateResponse> {
    let limits = &state.limits;
    let name = validation::normalize_name("name", &req.name, limits)?;
    let archetype = validation::parse_archetype(&req.archetype)?;
    let capabilities = validate_capabilities(state, archetype, req.capabilities)?;

    let token = generate_token();
    let token_hash = hash_token(&token, &state.token_pepper)?;

    let mut host = HostRecord::new(name, archetype, token_hash);
    host.entry_domain = validation::normalize_opt("entry_domain", req.entry_domain, limits.max_field_len)?;
    host.entry_domain_direct = validation::normalize_opt(
        "entry_domain_direct",
        req.entry_domain_direct,
        limits.max_field_len,
    )?;
    host.entry_ip = validation::normalize_opt("entry_ip", req.entry_ip, limits.max_field_len)?;
    host.region = validation::normalize_opt("region", req.region, limits.max_field_len)?;
    host.tags = validation::normalize_tags(req.tags, limits)?;
    host.capabilities = capabilities;

    hosts::create_host(state.kv.as_ref(), &host).await?;
    info!(host_id = %host.id, archetype = %host.archetype, "host created");

    Ok(HostCreateResponse {
        host: host_view(state, &host, Utc::now()),
        host_token: token,
    })
}

pub async fn update_host(
    state: &AppState,
    host_id: Uuid,
    req: HostUpdateRequest,
) -> ApiResult<HostUpdateResponse> {
    let limits = &state.limits;
    let max_len = limits.max_field_len;
    let name = req
        .name
        .as_deref()
        .map(|name| validation::normalize_name("name", name, limits))
        .transpose()?;
    let entry_domain = req
        .entry_domain
        .map(|value| validation::normalize_opt("entry_domain", value, max_len))
        .transpose()?;
    let entry_domain_direct = req
        .entry_domain_direct
        .map(|value| validation::normalize_opt("entry_domain_direct", value, max_len))
        .transpose()?;
    let entry_ip = req
        .entry_ip
        .map(|value| validation::normalize_opt("entry_ip", value, max_len))
        .transpose()?;
    let region = req
        .region
        .map(|value| validation::normalize_opt("region", value, max_len))
        .transpose()?;
    let tags = req
        .tags
        .map(|tags| validation::normalize_tags(tags, limits))
        .transpose()?;

    let rotated = if req.rotate_token {
        let token = generate_token();
        let hash = hash_token(&token, &state.token_pepper)?;
        Some((token, hash))
    } else {
        None
    };

    let updated = hosts::update_host(
        state.kv.as_ref(),
        host_id,
        state.distribution.update_retries,
        |host| -> ApiResult<Mutation<()>> {
            if let Some(caps) = &req.capabilities {
                host.capabilities = validate_capabilities(state, host.archetype, caps.clone())?;
            }
            if let Some(name) = &name {
                host.name = name.clone();
            }
            if let Some(value) = &entry_domain {
                host.entry_domain = value.clone();
            }
            if let Some(value) = &entry_domain_direct {
                host.entry_domain_direct = value.clone();
            }
            if let Some(value) = &entry_ip {
                host.entry_ip = value.clone();
            }
            if let Some(value) = &region {
                host.region = value.clone();
            }
            if let Some(tags) = &tags {
                host.tags = tags.clone();
            }
            if let Some((_, hash)) = &rotated {
                host.token_hash = hash.clone();
            }
            Ok(Mutation::Write(()))
        },
    )
    .await?
    .ok_or_else(|| AppError::host_not_found(format!("host {host_id} not found")))?;

    if rotated.is_some() {
        info!(%host_id, "host token rotated");
    }

    Ok(HostUpdateResponse {
        host: host_view(state, &updated.host, Utc::now()),
        host_token: rotated.map(|(token, _)| token),
    })
}

pub async fn delete_host(state: &AppState, host_id: Uuid) -> ApiResult<()> {
    if !hosts::delete_host(state.kv.as_ref(), host_id).await? {
        return Err(AppError::host_not_found(format!("host {host_id} not found")));
    }
    info!(%host_id, "host deleted");
    Ok(())
}

pub async fn diagnose_host(state: &AppState, host_id: Uuid) -> ApiResult<HostDiagnosis> {
    let host = load_host(state, host_id).await?;
    let now = Utc::now();

    Ok(HostDiagnosis {
        host_id: host.id,
        manager_connection: ManagerConnection {
            is_online: host.is_online(now, state.distribution.online_threshold()),
            last_seen: host.last_seen,
            lag_secs: host
                .last_seen
                .map(|seen| now.signed_duration_since(seen).num_seconds().max(0)),
        },
        template_sync: TemplateSync {
            target_version: host.desired_version,
            applied_version: host.applied_version,
            in_sync: host.desired_version == host.applied_version,
            last_status: host.last_apply_status,
            last_message: host.last_apply_message.clone(),
            last_apply_at: host.last_apply_at,
            consecutive_failures: host.consecutive_failures,
        },
        runtime_errors: host.history.failures(),
        apply_history: host.history.newest_first(),
    })
}

pub async fn get_host_plan(state: &AppState, host_id: Uuid, version: u64) -> ApiResult<Plan> {
    load_host(state, host_id).await?;
    plans::get_plan(state.kv.as_ref(), host_id, version)
        .await?
        .ok_or_else(|| {
            AppError::plan_not_found(format!("plan {version} not found for host {host_id}"))
        })
}

/// Resolves the calling host from its bearer token.
pub async fn authenticate_host(
    state: &AppState,
    host_id: Uuid,
    token: Option<&str>,
) -> ApiResult<HostRecord> {
    let token = token.ok_or_else(|| AppError::missing_token("missing host bearer token"))?;
    let host = load_host(state, host_id).await?;
    if !verify_token(token, &host.token_hash, &state.token_pepper) {
        return Err(AppError::invalid_token("invalid host token"));
    }
    Ok(host)
}
