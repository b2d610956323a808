//! Host side of plan distribution: version polls, plan fetches, and apply reports.
//!
//! Version pointers (`applied_version`, failure streak, history) are written through
//! revision-checked retries and never lost to a race. The heartbeat timestamp is soft state: it
//! gets a single attempt and a lost race or store error is ignored.

use chrono::Utc;
use common::api::{
    ApplyHistoryEntry, ApplyReportRequest, ApplyReportResponse, ApplyStatus, Plan,
    VersionPollResponse,
};
use tracing::{debug, info, warn};

use crate::app_state::AppState;
use crate::error::{ApiResult, AppError};
use crate::persistence::{HostRecord, Mutation, hosts, plans};

pub fn needs_update(target_version: u64, current_version: u64) -> bool {
    target_version != 0 && target_version != current_version
}

pub async fn poll(
    state: &AppState,
    host: &HostRecord,
    current_version: u64,
) -> ApiResult<VersionPollResponse> {
    record_heartbeat(state, host).await;

    let target_version = host.desired_version;
    Ok(VersionPollResponse {
        host_id: host.id,
        current_version,
        target_version,
        needs_update: needs_update(target_version, current_version),
    })
}

/// Rewrites `last_seen` only once it is older than the configured interval.
async fn record_heartbeat(state: &AppState, host: &HostRecord) {
    let now = Utc::now();
    let interval = state.distribution.heartbeat_write_interval();
    let is_stale = |last_seen: Option<chrono::DateTime<Utc>>| {
        last_seen.is_none_or(|seen| now.signed_duration_since(seen) > interval)
    };
    if !is_stale(host.last_seen) {
        return;
    }

    let result = hosts::update_host(
        state.kv.as_ref(),
        host.id,
        1,
        |record| -> crate::Result<Mutation<()>> {
            if is_stale(record.last_seen) {
                record.last_seen = Some(now);
                Ok(Mutation::Write(()))
            } else {
                Ok(Mutation::Skip(()))
            }
        },
    )
    .await;
    match result {
        Ok(Some(updated)) if updated.written => debug!(host_id = %host.id, "heartbeat recorded"),
        Ok(_) => {}
        Err(err) => debug!(host_id = %host.id, error = %err, "heartbeat write dropped"),
    }
}

pub async fn fetch_plan(state: &AppState, host: &HostRecord, version: u64) -> ApiResult<Plan> {
    plans::get_plan(state.kv.as_ref(), host.id, version)
        .await?
        .ok_or_else(|| {
            AppError::plan_not_found(format!("plan {version} not found for host {}", host.id))
        })
}

pub async fn report(
    state: &AppState,
    host: &HostRecord,
    req: ApplyReportRequest,
) -> ApiResult<ApplyReportResponse> {
    let version = req
        .version
        .ok_or_else(|| AppError::missing_param("version is required"))?;
    let status = req
        .status
        .ok_or_else(|| AppError::missing_param("status is required"))?;
    if version == 0 {
        return Err(AppError::validation("version must be >= 1"));
    }

    let now = Utc::now();
    let capacity = state.distribution.max_history;
    let entry = ApplyHistoryEntry {
        version,
        status,
        message: req.message,
        protocols: req.protocols,
        at: now,
    };

    let updated = hosts::update_host(
        state.kv.as_ref(),
        host.id,
        state.distribution.update_retries,
        |record| -> ApiResult<Mutation<bool>> {
            if status == ApplyStatus::Success && version > record.latest_version {
                return Err(AppError::validation(format!(
                    "version {version} was never published (latest is {})",
                    record.latest_version
                )));
            }
            if !record.history.upsert(entry.clone(), capacity).recorded() {
                return Ok(Mutation::Skip(false));
            }

            match status {
                ApplyStatus::Success => {
                    if version > record.applied_version || version == record.desired_version {
                        record.applied_version = version;
                    }
                    record.consecutive_failures = 0;
                }
                ApplyStatus::Failed => {
                    record.consecutive_failures = record.consecutive_failures.saturating_add(1);
                }
            }
            record.last_apply_status = Some(status);
            record.last_apply_message = Some(entry.message.clone());
            record.last_apply_at = Some(now);
            record.last_seen = Some(now);
            Ok(Mutation::Write(true))
        },
    )
    .await?
    .ok_or_else(|| AppError::host_not_found(format!("host {} not found", host.id)))?;

    let recorded = updated.output;
    crate::metrics::record_apply_report(status, recorded);
    if recorded {
        match status {
            ApplyStatus::Success => info!(
                host_id = %host.id,
                version,
                applied_version = updated.host.applied_version,
                "apply succeeded"
            ),
            ApplyStatus::Failed => warn!(
                host_id = %host.id,
                version,
                consecutive_failures = updated.host.consecutive_failures,
                message = %entry.message,
                "apply failed"
            ),
        }
    } else {
        debug!(host_id = %host.id, version, "duplicate apply report ignored");
    }

    Ok(ApplyReportResponse {
        recorded,
        version,
        status,
        applied_version: updated.host.applied_version,
        consecutive_failures: updated.host.consecutive_failures,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DistributionConfig;
    use crate::services::deploys;
    use crate::services::test_support::{create_host, setup_state, setup_state_with};
    use crate::persistence::MemoryKv;
    use common::api::{
        DeployOutcome, DeployRequest, HostArchetype, Protocol, RollbackRequest, error_codes,
    };
    use std::sync::Arc;
    use uuid::Uuid;

    async fn deploy_edge(state: &AppState, host_id: Uuid) -> u64 {
        let record = deploys::deploy(
            state,
            DeployRequest {
                host_ids: vec![host_id],
                profile_ids: vec!["vless-ws-tls".into()],
                params: Default::default(),
            },
        )
        .await
        .unwrap();
        record.version.unwrap()
    }

    async fn load(state: &AppState, host_id: Uuid) -> HostRecord {
        hosts::get_host(state.kv.as_ref(), host_id).await.unwrap().unwrap()
    }

    fn success(version: u64, message: &str) -> ApplyReportRequest {
        ApplyReportRequest {
            version: Some(version),
            status: Some(ApplyStatus::Success),
            message: message.into(),
            protocols: vec![Protocol::Vless],
        }
    }

    #[test]
    fn needs_update_rules() {
        assert!(!needs_update(0, 0));
        assert!(!needs_update(0, 3));
        assert!(needs_update(2, 1));
        assert!(needs_update(1, 2));
        assert!(!needs_update(2, 2));
    }

    #[tokio::test]
    async fn poll_reports_target_and_throttles_heartbeat() {
        let state = setup_state().await;
        let (host_id, _) = create_host(&state, "edge", HostArchetype::Edge, None).await;

        let host = load(&state, host_id).await;
        let resp = poll(&state, &host, 0).await.unwrap();
        assert_eq!(resp.target_version, 0);
        assert!(!resp.needs_update);

        let first_seen = load(&state, host_id).await.last_seen.expect("heartbeat written");
        let version = deploy_edge(&state, host_id).await;

        let host = load(&state, host_id).await;
        let resp = poll(&state, &host, 0).await.unwrap();
        assert_eq!(resp.target_version, version);
        assert!(resp.needs_update);
        assert_eq!(load(&state, host_id).await.last_seen, Some(first_seen));
        assert_eq!(load(&state, host_id).await.applied_version, 0);
    }

    #[tokio::test]
    async fn fetch_missing_plan_is_not_found() {
        let state = setup_state().await;
        let (host_id, _) = create_host(&state, "edge", HostArchetype::Edge, None).await;
        let host = load(&state, host_id).await;
        let err = fetch_plan(&state, &host, 1).await.unwrap_err();
        assert_eq!(err.code, error_codes::PLAN_NOT_FOUND);

        let version = deploy_edge(&state, host_id).await;
        let plan = fetch_plan(&state, &host, version).await.unwrap();
        assert_eq!(plan.version(), version);
    }

    #[tokio::test]
    async fn duplicate_reports_are_idempotent() {
        let state = setup_state().await;
        let (host_id, _) = create_host(&state, "edge", HostArchetype::Edge, None).await;
        let version = deploy_edge(&state, host_id).await;
        let host = load(&state, host_id).await;

        let first = report(&state, &host, success(version, "ok")).await.unwrap();
        assert!(first.recorded);
        assert_eq!(first.applied_version, version);

        let second = report(&state, &host, success(version, "ok")).await.unwrap();
        assert!(!second.recorded);
        assert_eq!(second.applied_version, version);
        assert_eq!(second.consecutive_failures, 0);

        let stored = load(&state, host_id).await;
        assert_eq!(stored.history.len(), 1);
    }

    #[tokio::test]
    async fn failures_count_and_leave_applied_untouched() {
        let state = setup_state().await;
        let (host_id, _) = create_host(&state, "edge", HostArchetype::Edge, None).await;
        let v1 = deploy_edge(&state, host_id).await;
        let host = load(&state, host_id).await;
        report(&state, &host, success(v1, "ok")).await.unwrap();

        let v2 = deploy_edge(&state, host_id).await;
        let failed = ApplyReportRequest {
            version: Some(v2),
            status: Some(ApplyStatus::Failed),
            message: "bind: address in use".into(),
            protocols: vec![],
        };
        let resp = report(&state, &host, failed.clone()).await.unwrap();
        assert_eq!(resp.applied_version, v1);
        assert_eq!(resp.consecutive_failures, 1);

        let retry = ApplyReportRequest {
            message: "bind: permission denied".into(),
            ..failed
        };
        let resp = report(&state, &host, retry).await.unwrap();
        assert!(resp.recorded);
        assert_eq!(resp.consecutive_failures, 2);

        let stored = load(&state, host_id).await;
        assert_eq!(stored.history.len(), 2);
        assert_eq!(stored.history.failures().len(), 1);

        let resp = report(&state, &host, success(v2, "ok")).await.unwrap();
        assert_eq!(resp.applied_version, v2);
        assert_eq!(resp.consecutive_failures, 0);
    }

    #[tokio::test]
    async fn success_for_unpublished_version_is_rejected() {
        let state = setup_state().await;
        let (host_id, _) = create_host(&state, "edge", HostArchetype::Edge, None).await;
        let host = load(&state, host_id).await;

        let err = report(&state, &host, success(3, "ok")).await.unwrap_err();
        assert_eq!(err.code, error_codes::VALIDATION);

        let err = report(&state, &host, ApplyReportRequest::default())
            .await
            .unwrap_err();
        assert_eq!(err.code, error_codes::MISSING_PARAM);
    }

    #[tokio::test]
    async fn rollback_target_can_be_applied_below_current() {
        let state = setup_state().await;
        let (host_id, _) = create_host(&state, "edge", HostArchetype::Edge, None).await;
        let v1 = deploy_edge(&state, host_id).await;
        let v2 = deploy_edge(&state, host_id).await;
        let host = load(&state, host_id).await;
        report(&state, &host, success(v2, "ok")).await.unwrap();

        // A late report for an older version that is not the target never regresses the pointer.
        let late = report(&state, &host, success(v1, "late")).await.unwrap();
        assert!(late.recorded);
        assert_eq!(late.applied_version, v2);

        deploys::rollback(
            &state,
            RollbackRequest {
                host_ids: vec![host_id],
                target_version: v1,
            },
        )
        .await
        .unwrap();

        let host = load(&state, host_id).await;
        let resp = poll(&state, &host, v2).await.unwrap();
        assert!(resp.needs_update);
        assert_eq!(resp.target_version, v1);

        let resp = report(&state, &host, success(v1, "rolled back")).await.unwrap();
        assert!(resp.recorded);
        assert_eq!(resp.applied_version, v1);
    }

    #[tokio::test]
    async fn history_is_bounded() {
        let state = setup_state_with(DistributionConfig {
            max_history: 2,
            ..DistributionConfig::default()
        })
        .await;
        let (host_id, _) = create_host(&state, "edge", HostArchetype::Edge, None).await;
        for _ in 0..3 {
            let version = deploy_edge(&state, host_id).await;
            let host = load(&state, host_id).await;
            report(&state, &host, success(version, "ok")).await.unwrap();
        }
        let stored = load(&state, host_id).await;
        assert_eq!(stored.history.len(), 2);
        assert!(stored.history.get(1).is_none());
        assert_eq!(stored.applied_version, 3);
    }

    #[tokio::test]
    async fn stale_heartbeat_is_rewritten_on_poll() {
        let state = setup_state().await;
        let (host_id, _) = create_host(&state, "edge", HostArchetype::Edge, None).await;

        let interval = state.distribution.heartbeat_write_interval();
        let backdated = Utc::now() - interval - chrono::Duration::seconds(5);
        hosts::update_host(state.kv.as_ref(), host_id, 3, |record| -> crate::Result<_> {
            record.last_seen = Some(backdated);
            Ok(Mutation::Write(()))
        })
        .await
        .unwrap();

        let host = load(&state, host_id).await;
        poll(&state, &host, 0).await.unwrap();

        let refreshed = load(&state, host_id).await.last_seen.unwrap();
        assert!(refreshed > backdated);
        assert!(Utc::now().signed_duration_since(refreshed) < interval);
    }

    #[tokio::test]
    async fn plan_not_yet_visible_is_not_found_until_it_appears() {
        let mut state = setup_state().await;
        state.kv = Arc::new(MemoryKv::with_visibility_lag(1));
        let (host_id, _) = create_host(&state, "edge", HostArchetype::Edge, None).await;

        // The fresh host record is not readable yet, so the first deploy cannot see it.
        let record = deploys::deploy(
            &state,
            DeployRequest {
                host_ids: vec![host_id],
                profile_ids: vec!["vless-ws-tls".into()],
                params: Default::default(),
            },
        )
        .await
        .unwrap();
        assert_eq!(record.results[0].status, DeployOutcome::Skipped);

        let version = deploy_edge(&state, host_id).await;
        let host = load(&state, host_id).await;
        assert_eq!(host.desired_version, version);

        let err = fetch_plan(&state, &host, version).await.unwrap_err();
        assert_eq!(err.code, error_codes::PLAN_NOT_FOUND);
        let unchanged = load(&state, host_id).await;
        assert_eq!(unchanged.applied_version, 0);
        assert_eq!(unchanged.desired_version, version);
        assert!(unchanged.history.is_empty());

        let plan = fetch_plan(&state, &host, version).await.unwrap();
        assert_eq!(plan.version(), version);
        let resp = report(&state, &host, success(version, "ok")).await.unwrap();
        assert!(resp.recorded);
        assert_eq!(resp.applied_version, version);
    }
}
