use chrono::Utc;
use common::api::{
    DeployHostResult, DeployOutcome, DeployRecord, DeployRequest, DeploySummary, HostArchetype,
    HostVersion, RollbackHostResult, RollbackRequest, RollbackResponse, RollbackStatus, Settings,
    TlsMode,
};
use serde_json::Value;
use tracing::{info, warn};
use uuid::Uuid;

use crate::app_state::AppState;
use crate::error::{ApiResult, AppError};
use crate::persistence::{HostRecord, Mutation, deploys, hosts, plans};
use crate::planner;
use crate::reality;
use crate::registry::Template;
use crate::resolver::RandomSecrets;
use crate::services::profiles;

/// Parameter names replaced by a digest in stored deploy records.
const REDACTED_PARAMS: [&str; 3] = ["private_key", "reality_private_key", "password"];

fn redact_params(params: &Settings) -> Settings {
    params
        .iter()
        .map(|(key, value)| {
            let value = match value {
                Value::String(secret) if REDACTED_PARAMS.contains(&key.as_str()) => {
                    Value::String(crate::tokens::redact(secret))
                }
                other => other.clone(),
            };
            (key.clone(), value)
        })
        .collect()
}

fn dedupe<T: PartialEq + Clone>(items: &[T]) -> Vec<T> {
    let mut unique: Vec<T> = Vec::with_capacity(items.len());
    for item in items {
        if !unique.contains(item) {
            unique.push(item.clone());
        }
    }
    unique
}

fn skipped(host_id: Uuid, host_name: Option<String>, reason: impl Into<String>) -> DeployHostResult {
    DeployHostResult {
        host_id,
        host_name,
        status: DeployOutcome::Skipped,
        version: None,
        reason: Some(reason.into()),
    }
}

fn failed(host: &HostRecord, reason: impl Into<String>) -> DeployHostResult {
    DeployHostResult {
        host_id: host.id,
        host_name: Some(host.name.clone()),
        status: DeployOutcome::Error,
        version: None,
        reason: Some(reason.into()),
    }
}

/// Synthesizes and publishes a plan for every targeted host.
///
/// Hosts are independent: one host being skipped or failing never aborts the others.
pub async fn deploy(state: &AppState, req: DeployRequest) -> ApiResult<DeployRecord> {
    let host_ids = dedupe(&req.host_ids);
    let profile_ids = dedupe(&req.profile_ids);
    if host_ids.is_empty() {
        return Err(AppError::validation("host_ids cannot be empty"));
    }
    if profile_ids.is_empty() {
        return Err(AppError::validation("profile_ids cannot be empty"));
    }
    let templates = profiles::load_templates(state, &profile_ids).await?;

    let mut results = Vec::with_capacity(host_ids.len());
    for host_id in &host_ids {
        let result = deploy_host(state, *host_id, &templates, &req.params).await;
        crate::metrics::record_deploy_outcome(result.status);
        results.push(result);
    }

    let host_versions: Vec<HostVersion> = results
        .iter()
        .filter_map(|result| {
            Some(HostVersion {
                host_id: result.host_id,
                host_name: result.host_name.clone()?,
                version: result.version?,
            })
        })
        .collect();
    let version_min = host_versions.iter().map(|hv| hv.version).min();
    let version_max = host_versions.iter().map(|hv| hv.version).max();
    let version = if version_min.is_some() && version_min == version_max {
        version_min
    } else {
        None
    };

    let record = DeployRecord {
        id: Uuid::new_v4(),
        created_at: Utc::now(),
        host_ids,
        profile_ids,
        config_names: templates.iter().map(|t| t.name.clone()).collect(),
        params_snapshot: redact_params(&req.params),
        host_versions,
        results,
        version,
        version_min,
        version_max,
    };
    deploys::create_deploy(state.kv.as_ref(), &record).await?;

    let summary = deploys::summarize(&record);
    info!(
        deploy_id = %record.id,
        deployed = summary.deployed,
        skipped = summary.skipped,
        errors = summary.errors,
        "deploy recorded"
    );
    Ok(record)
}

/// What is known about a host while its plan is being published.
#[derive(Debug, Default)]
struct HostProgress {
    host_name: Option<String>,
    claimed_version: Option<u64>,
}

/// Never fails: a store error becomes this host's `error` outcome and the plan it claimed, if
/// any, is removed again so no unreferenced version is left behind.
async fn deploy_host(
    state: &AppState,
    host_id: Uuid,
    templates: &[Template],
    params: &Settings,
) -> DeployHostResult {
    let mut progress = HostProgress::default();
    match publish_host(state, host_id, templates, params, &mut progress).await {
        Ok(result) => result,
        Err(err) => {
            crate::telemetry::record_internal_error_metrics(&err);
            warn!(%host_id, error = ?err, "deploy failed for host");
            if let Some(version) = progress.claimed_version {
                discard_plan(state, host_id, version).await;
            }
            DeployHostResult {
                host_id,
                host_name: progress.host_name,
                status: DeployOutcome::Error,
                version: None,
                reason: Some(format!("storage error: {err}")),
            }
        }
    }
}

async fn discard_plan(state: &AppState, host_id: Uuid, version: u64) {
    if let Err(err) = plans::delete_plan(state.kv.as_ref(), host_id, version).await {
        warn!(%host_id, version, error = %err, "unreferenced plan could not be removed");
    }
}

/// Host-specific problems come back as `Ok` outcomes; `Err` is reserved for store failures.
async fn publish_host(
    state: &AppState,
    host_id: Uuid,
    templates: &[Template],
    params: &Settings,
    progress: &mut HostProgress,
) -> crate::Result<DeployHostResult> {
    let kv = state.kv.as_ref();
    let Some(host) = hosts::get_host(kv, host_id).await? else {
        return Ok(skipped(host_id, None, "host not found"));
    };
    progress.host_name = Some(host.name.clone());

    let compatible = planner::compatible_templates(&state.registry, &host, templates);
    if compatible.is_empty() {
        return Ok(skipped(
            host.id,
            Some(host.name.clone()),
            format!("no requested profile is compatible with {} host", host.archetype),
        ));
    }

    let mut params = params.clone();
    if state.distribution.auto_reality_keys
        && host.archetype == HostArchetype::Full
        && compatible.iter().any(|t| t.tls_mode == TlsMode::Reality)
        && reality::provision(&mut params)
    {
        info!(host_id = %host.id, "generated reality key pair");
    }

    // Numbers handed out once are never reused, even after a rollback lowered `desired_version`.
    let mut version = host
        .desired_version
        .max(host.applied_version)
        .max(host.latest_version)
        + 1;
    let mut written = None;
    for _ in 0..state.distribution.update_retries.max(1) {
        // A slot can be occupied by a plan written before a crash lost its pointer update.
        while plans::plan_exists(kv, host.id, version).await? {
            version += 1;
        }
        let plan = match planner::synthesize(
            &state.registry,
            &host,
            templates,
            &params,
            version,
            &RandomSecrets,
        ) {
            Ok(plan) => plan,
            Err(err) => {
                warn!(host_id = %host.id, error = %err, "plan synthesis failed");
                return Ok(failed(&host, err.to_string()));
            }
        };
        if plans::create_plan(kv, &plan).await? {
            progress.claimed_version = Some(version);
            written = Some(plan);
            break;
        }
        version += 1;
    }
    let Some(plan) = written else {
        return Ok(failed(&host, "could not claim a plan version"));
    };
    crate::metrics::record_plan_written();

    let updated = hosts::update_host(
        kv,
        host.id,
        state.distribution.update_retries,
        |record| -> crate::Result<Mutation<()>> {
            record.desired_version = record.desired_version.max(version);
            record.latest_version = record.latest_version.max(version);
            Ok(Mutation::Write(()))
        },
    )
    .await?;
    let Some(updated) = updated else {
        discard_plan(state, host.id, version).await;
        return Ok(failed(&host, "host was deleted during deploy"));
    };
    info!(
        host_id = %host.id,
        version,
        profiles = plan.meta().profile_count,
        "plan written"
    );

    prune_old_plan(state, &updated.host, version).await;

    Ok(DeployHostResult {
        host_id: host.id,
        host_name: Some(updated.host.name.clone()),
        status: DeployOutcome::Deployed,
        version: Some(version),
        reason: None,
    })
}

/// Drops the plan that fell out of the retention window. Plans the host still points at are kept.
async fn prune_old_plan(state: &AppState, host: &HostRecord, version: u64) {
    let retention = state.distribution.plan_retention_count;
    let Some(stale) = version.checked_sub(retention + 1).filter(|v| *v > 0) else {
        return;
    };
    if stale == host.applied_version || stale == host.desired_version {
        return;
    }
    if let Err(err) = plans::delete_plan(state.kv.as_ref(), host.id, stale).await {
        crate::metrics::record_prune_failure();
        warn!(host_id = %host.id, version = stale, error = %err, "plan prune failed");
    }
}

pub async fn list_deploys(state: &AppState) -> ApiResult<Vec<DeploySummary>> {
    Ok(deploys::list_deploys(state.kv.as_ref(), state.distribution.deploy_history_limit).await?)
}

pub async fn get_deploy(state: &AppState, id: Uuid) -> ApiResult<DeployRecord> {
    deploys::get_deploy(state.kv.as_ref(), id)
        .await?
        .ok_or_else(|| AppError::deploy_not_found(format!("deploy {id} not found")))
}

/// Repoints each host's desired version at an existing plan; no synthesis happens.
pub async fn rollback(state: &AppState, req: RollbackRequest) -> ApiResult<RollbackResponse> {
    let target = req.target_version;
    if target < 1 {
        return Err(AppError::validation("target_version must be >= 1"));
    }
    let host_ids = dedupe(&req.host_ids);
    if host_ids.is_empty() {
        return Err(AppError::validation("host_ids cannot be empty"));
    }

    let kv = state.kv.as_ref();
    let mut results = Vec::with_capacity(host_ids.len());
    for host_id in host_ids {
        let result = if !plans::plan_exists(kv, host_id, target).await? {
            let reason = if hosts::get_host(kv, host_id).await?.is_none() {
                None
            } else {
                Some(format!("plan {target} not found (pruned or never written)"))
            };
            match reason {
                None => RollbackHostResult {
                    host_id,
                    status: RollbackStatus::Skipped,
                    previous_version: None,
                    reason: Some("host not found".into()),
                },
                Some(reason) => RollbackHostResult {
                    host_id,
                    status: RollbackStatus::Failed,
                    previous_version: None,
                    reason: Some(reason),
                },
            }
        } else {
            let updated = hosts::update_host(
                kv,
                host_id,
                state.distribution.update_retries,
                |record| -> crate::Result<Mutation<u64>> {
                    let previous = record.desired_version;
                    record.desired_version = target;
                    Ok(Mutation::Write(previous))
                },
            )
            .await?;
            match updated {
                Some(updated) => {
                    info!(%host_id, from = updated.output, to = target, "host rolled back");
                    RollbackHostResult {
                        host_id,
                        status: RollbackStatus::RolledBack,
                        previous_version: Some(updated.output),
                        reason: None,
                    }
                }
                None => RollbackHostResult {
                    host_id,
                    status: RollbackStatus::Skipped,
                    previous_version: None,
                    reason: Some("host not found".into()),
                },
            }
        };
        crate::metrics::record_rollback(result.status);
        results.push(result);
    }

    Ok(RollbackResponse {
        target_version: target,
        results,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DistributionConfig;
    use crate::services::test_support::{create_host, setup_state, setup_state_with};
    use crate::persistence::{KvEntry, KvRef, KvStore, keys};
    use async_trait::async_trait;
    use common::api::{Plan, error_codes};
    use serde_json::json;
    use std::sync::Arc;

    /// Store whose compare-and-swap on one key always errors.
    struct BrokenKey {
        inner: KvRef,
        key: String,
    }

    #[async_trait]
    impl KvStore for BrokenKey {
        async fn get(&self, key: &str) -> crate::Result<Option<KvEntry>> {
            self.inner.get(key).await
        }

        async fn put(&self, key: &str, value: &str) -> crate::Result<i64> {
            self.inner.put(key, value).await
        }

        async fn compare_and_swap(
            &self,
            key: &str,
            expected: Option<i64>,
            value: &str,
        ) -> crate::Result<bool> {
            if key == self.key {
                anyhow::bail!("disk I/O error writing {key}");
            }
            self.inner.compare_and_swap(key, expected, value).await
        }

        async fn delete(&self, key: &str) -> crate::Result<bool> {
            self.inner.delete(key).await
        }

        async fn list_prefix(&self, prefix: &str) -> crate::Result<Vec<KvEntry>> {
            self.inner.list_prefix(prefix).await
        }
    }

    fn request(host_ids: Vec<Uuid>, profile_ids: &[&str], params: Value) -> DeployRequest {
        DeployRequest {
            host_ids,
            profile_ids: profile_ids.iter().map(|id| id.to_string()).collect(),
            params: params.as_object().cloned().unwrap_or_default(),
        }
    }

    fn no_auto_keys() -> DistributionConfig {
        DistributionConfig {
            auto_reality_keys: false,
            ..DistributionConfig::default()
        }
    }

    #[tokio::test]
    async fn reality_without_key_fails_and_writes_nothing() {
        let state = setup_state_with(no_auto_keys()).await;
        let (host_id, _) = create_host(&state, "full-1", HostArchetype::Full, None).await;

        let record = deploy(&state, request(vec![host_id], &["vless-reality-tcp"], json!({})))
            .await
            .unwrap();
        assert_eq!(record.results.len(), 1);
        let result = &record.results[0];
        assert_eq!(result.status, DeployOutcome::Error);
        let reason = result.reason.as_deref().unwrap();
        assert!(reason.contains("private_key"), "{reason}");
        assert!(record.version.is_none());

        let kv = state.kv.as_ref();
        assert!(plans::list_plan_versions(kv, host_id).await.unwrap().is_empty());
        let host = hosts::get_host(kv, host_id).await.unwrap().unwrap();
        assert_eq!(host.desired_version, 0);
    }

    #[tokio::test]
    async fn reality_keys_are_provisioned_when_enabled() {
        let state = setup_state().await;
        let (host_id, _) = create_host(&state, "full-1", HostArchetype::Full, None).await;

        let record = deploy(
            &state,
            request(vec![host_id], &["vless-reality-tcp"], json!({"listen_port": 8443})),
        )
        .await
        .unwrap();
        assert_eq!(record.results[0].status, DeployOutcome::Deployed);
        assert_eq!(record.version, Some(1));

        let plan = plans::get_plan(state.kv.as_ref(), host_id, 1).await.unwrap().unwrap();
        let Plan::Full(full) = plan else {
            panic!("expected full plan");
        };
        assert_eq!(full.routing.listen_port, 8443);
        let settings = &full.inbounds[0].settings;
        assert!(!settings["private_key"].as_str().unwrap().is_empty());
        assert!(!settings["public_key"].as_str().unwrap().is_empty());
        assert!(!record.params_snapshot.contains_key("private_key"));
    }

    #[tokio::test]
    async fn mixed_fleet_skips_incompatible_host_only() {
        let state = setup_state().await;
        let (full_a, _) = create_host(&state, "full-a", HostArchetype::Full, None).await;
        let (full_b, _) = create_host(&state, "full-b", HostArchetype::Full, None).await;
        let (edge, _) = create_host(&state, "edge", HostArchetype::Edge, Some("cdn.example.com")).await;

        let record = deploy(
            &state,
            request(vec![full_a, edge, full_b], &["trojan-tcp-tls"], json!({})),
        )
        .await
        .unwrap();

        let statuses: Vec<_> = record.results.iter().map(|r| r.status).collect();
        assert_eq!(
            statuses,
            vec![DeployOutcome::Deployed, DeployOutcome::Skipped, DeployOutcome::Deployed]
        );
        assert_eq!(record.results[1].host_id, edge);
        assert_eq!(record.host_versions.len(), 2);
        assert_eq!(record.version, Some(1));

        let listed = list_deploys(&state).await.unwrap();
        assert_eq!(listed[0].id, record.id);
        assert_eq!(listed[0].skipped, 1);
        assert_eq!(get_deploy(&state, record.id).await.unwrap(), record);
    }

    #[tokio::test]
    async fn unknown_hosts_are_skipped_and_unknown_profiles_rejected() {
        let state = setup_state().await;
        let missing = Uuid::new_v4();
        let record = deploy(&state, request(vec![missing], &["vless-ws-tls"], json!({})))
            .await
            .unwrap();
        assert_eq!(record.results[0].status, DeployOutcome::Skipped);
        assert!(record.results[0].host_name.is_none());

        let err = deploy(&state, request(vec![missing], &["nope"], json!({})))
            .await
            .unwrap_err();
        assert_eq!(err.code, error_codes::PROFILE_NOT_FOUND);
    }

    #[tokio::test]
    async fn sequential_deploys_then_rollback_keeps_newer_plan() {
        let state = setup_state().await;
        let (host_id, _) = create_host(&state, "edge", HostArchetype::Edge, Some("cdn.example.com")).await;

        let first = deploy(&state, request(vec![host_id], &["vless-ws-tls"], json!({})))
            .await
            .unwrap();
        let second = deploy(&state, request(vec![host_id], &["vless-ws-tls"], json!({})))
            .await
            .unwrap();
        assert_eq!(first.version, Some(1));
        assert_eq!(second.version, Some(2));

        let resp = rollback(
            &state,
            RollbackRequest {
                host_ids: vec![host_id],
                target_version: 1,
            },
        )
        .await
        .unwrap();
        assert_eq!(resp.results[0].status, RollbackStatus::RolledBack);
        assert_eq!(resp.results[0].previous_version, Some(2));

        let kv = state.kv.as_ref();
        let host = hosts::get_host(kv, host_id).await.unwrap().unwrap();
        assert_eq!(host.desired_version, 1);
        assert_eq!(host.latest_version, 2);
        assert!(plans::plan_exists(kv, host_id, 2).await.unwrap());
    }

    #[tokio::test]
    async fn rollback_reports_missing_plan_and_missing_host() {
        let state = setup_state().await;
        let (host_id, _) = create_host(&state, "edge", HostArchetype::Edge, None).await;
        let ghost = Uuid::new_v4();

        let resp = rollback(
            &state,
            RollbackRequest {
                host_ids: vec![host_id, ghost],
                target_version: 4,
            },
        )
        .await
        .unwrap();
        assert_eq!(resp.results[0].status, RollbackStatus::Failed);
        assert_eq!(resp.results[1].status, RollbackStatus::Skipped);

        let err = rollback(
            &state,
            RollbackRequest {
                host_ids: vec![host_id],
                target_version: 0,
            },
        )
        .await
        .unwrap_err();
        assert_eq!(err.code, error_codes::VALIDATION);
    }

    #[tokio::test]
    async fn occupied_version_slot_is_skipped() {
        let state = setup_state().await;
        let (host_id, _) = create_host(&state, "edge", HostArchetype::Edge, None).await;
        deploy(&state, request(vec![host_id], &["vless-ws-tls"], json!({})))
            .await
            .unwrap();

        // Simulate a crash that wrote plan 1 but never recorded the pointer.
        hosts::update_host(state.kv.as_ref(), host_id, 3, |host| -> crate::Result<_> {
            host.desired_version = 0;
            Ok(Mutation::Write(()))
        })
        .await
        .unwrap();

        let record = deploy(&state, request(vec![host_id], &["vless-ws-tls"], json!({})))
            .await
            .unwrap();
        assert_eq!(record.version, Some(2));
    }

    #[tokio::test]
    async fn old_plans_are_pruned_past_retention() {
        let state = setup_state_with(DistributionConfig {
            plan_retention_count: 2,
            ..DistributionConfig::default()
        })
        .await;
        let (host_id, _) = create_host(&state, "edge", HostArchetype::Edge, None).await;
        for _ in 0..4 {
            deploy(&state, request(vec![host_id], &["vless-ws-tls"], json!({})))
                .await
                .unwrap();
        }
        let versions = plans::list_plan_versions(state.kv.as_ref(), host_id).await.unwrap();
        assert_eq!(versions, vec![2, 3, 4]);
    }

    #[tokio::test]
    async fn store_failure_on_one_host_leaves_the_others_deployed() {
        let mut state = setup_state().await;
        let (a, _) = create_host(&state, "a", HostArchetype::Full, None).await;
        let (b, _) = create_host(&state, "b", HostArchetype::Full, None).await;
        let (c, _) = create_host(&state, "c", HostArchetype::Full, None).await;
        state.kv = Arc::new(BrokenKey {
            inner: state.kv.clone(),
            key: keys::host(b),
        });

        let record = deploy(&state, request(vec![a, b, c], &["trojan-tcp-tls"], json!({})))
            .await
            .unwrap();

        let statuses: Vec<_> = record.results.iter().map(|r| r.status).collect();
        assert_eq!(
            statuses,
            vec![DeployOutcome::Deployed, DeployOutcome::Error, DeployOutcome::Deployed]
        );
        let broken = &record.results[1];
        assert_eq!(broken.host_name.as_deref(), Some("b"));
        assert!(broken.reason.as_deref().unwrap().contains("storage error"));
        assert!(broken.version.is_none());
        assert_eq!(record.host_versions.len(), 2);

        let kv = state.kv.as_ref();
        assert!(plans::plan_exists(kv, a, 1).await.unwrap());
        assert!(plans::plan_exists(kv, c, 1).await.unwrap());
        assert!(plans::list_plan_versions(kv, b).await.unwrap().is_empty());
        assert_eq!(hosts::get_host(kv, b).await.unwrap().unwrap().desired_version, 0);
        assert_eq!(get_deploy(&state, record.id).await.unwrap().results.len(), 3);
    }

    #[tokio::test]
    async fn deploy_after_rollback_uses_a_fresh_version() {
        let state = setup_state().await;
        let (host_id, _) = create_host(&state, "edge", HostArchetype::Edge, None).await;
        for _ in 0..2 {
            deploy(&state, request(vec![host_id], &["vless-ws-tls"], json!({})))
                .await
                .unwrap();
        }
        rollback(
            &state,
            RollbackRequest {
                host_ids: vec![host_id],
                target_version: 1,
            },
        )
        .await
        .unwrap();

        let record = deploy(&state, request(vec![host_id], &["vless-ws-tls"], json!({})))
            .await
            .unwrap();
        assert_eq!(record.version, Some(3));

        let host = hosts::get_host(state.kv.as_ref(), host_id).await.unwrap().unwrap();
        assert_eq!(host.desired_version, 3);
        assert_eq!(host.latest_version, 3);
        assert!(plans::plan_exists(state.kv.as_ref(), host_id, 2).await.unwrap());
    }

    #[test]
    fn secrets_are_redacted_in_snapshot() {
        let params = json!({"password": "hunter2", "private_key": "pk", "path": "/ws"});
        let redacted = redact_params(params.as_object().unwrap());
        assert_ne!(redacted["password"], json!("hunter2"));
        assert!(redacted["password"].as_str().unwrap().starts_with("redacted:"));
        assert_ne!(redacted["private_key"], json!("pk"));
        assert_eq!(redacted["path"], json!("/ws"));
    }
}
