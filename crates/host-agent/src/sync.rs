//! One poll, fetch, apply and report pass against the control plane.

use tracing::{info, warn};

use crate::{
    api::{ApplyReportRequest, ApplyStatus, Plan},
    apply, config,
    cp_client::{ControlPlaneClient, CpError, PlanFetch},
    state::{self, SyncState},
    telemetry,
};

/// What a single cycle did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CycleOutcome {
    /// Nothing to do; the applied version matches the target (or nothing was deployed).
    UpToDate { version: u64 },
    /// The target plan was written, applied, and reported.
    Applied { version: u64 },
    /// Applying the target failed; the failure was reported.
    Failed { version: u64 },
    /// The target plan is not readable yet; retried next tick without a report.
    NotYetVisible { version: u64 },
    /// The target already failed on this host; waiting for a new target.
    Suppressed { version: u64 },
}

pub async fn sync_once(
    cfg: &config::AppConfig,
    client: &ControlPlaneClient,
    sync: &mut SyncState,
) -> anyhow::Result<CycleOutcome> {
    flush_pending_report(client, sync).await?;

    let polled = match client.poll_version(sync.applied_version).await {
        Ok(polled) => polled,
        Err(err) => {
            telemetry::record_poll_result("error");
            return Err(err);
        }
    };
    let target = polled.target_version;
    if sync.failed_version.is_some_and(|failed| failed != target) {
        sync.failed_version = None;
    }

    if !polled.needs_update {
        telemetry::record_poll_result("current");
        return Ok(CycleOutcome::UpToDate { version: target });
    }
    telemetry::record_poll_result("update");

    if sync.failed_version == Some(target) {
        return Ok(CycleOutcome::Suppressed { version: target });
    }

    let plan = match client.fetch_plan(target).await? {
        PlanFetch::Found(plan) => plan,
        PlanFetch::NotFound => {
            info!(
                request_id = client.request_id(),
                version = target,
                "target plan not visible yet; retrying next tick"
            );
            telemetry::record_apply_result("not_visible");
            return Ok(CycleOutcome::NotYetVisible { version: target });
        }
    };

    let report = match apply_plan(cfg, &plan, target).await {
        Ok(message) => {
            state::store_applied_version(&cfg.applied_version_path(), target)?;
            sync.applied_version = target;
            sync.failed_version = None;
            telemetry::record_apply_result("success");
            telemetry::record_applied_version(target);
            info!(version = target, "plan applied");
            ApplyReportRequest {
                version: Some(target),
                status: Some(ApplyStatus::Success),
                message,
                protocols: plan.protocols(),
            }
        }
        Err(err) => {
            sync.failed_version = Some(target);
            telemetry::record_apply_result("failed");
            warn!(version = target, error = %err, "plan apply failed");
            ApplyReportRequest {
                version: Some(target),
                status: Some(ApplyStatus::Failed),
                message: format!("{err:#}"),
                protocols: plan.protocols(),
            }
        }
    };
    let applied = report.status == Some(ApplyStatus::Success);

    sync.pending_report = Some(report);
    flush_pending_report(client, sync).await?;

    Ok(if applied {
        CycleOutcome::Applied { version: target }
    } else {
        CycleOutcome::Failed { version: target }
    })
}

async fn apply_plan(cfg: &config::AppConfig, plan: &Plan, target: u64) -> anyhow::Result<String> {
    if plan.version() != target {
        anyhow::bail!(
            "control plane returned plan version {} for target {}",
            plan.version(),
            target
        );
    }
    if plan.host_id() != cfg.host_id {
        anyhow::bail!("plan {} belongs to host {}", target, plan.host_id());
    }

    apply::write_plan(&cfg.plan_path, plan)?;

    match cfg.apply_command.as_deref().map(str::trim) {
        Some(command) if !command.is_empty() => {
            let output = apply::run_apply_command(command, &cfg.plan_path).await?;
            Ok(if output.is_empty() {
                format!("applied version {target}")
            } else {
                output
            })
        }
        _ => Ok(format!("wrote version {target} to {}", cfg.plan_path.display())),
    }
}

/// Sends a report left over from an earlier cycle; it is dropped once acknowledged or once the
/// control plane rejects it in a way a resend cannot change.
async fn flush_pending_report(
    client: &ControlPlaneClient,
    sync: &mut SyncState,
) -> anyhow::Result<()> {
    let Some(report) = sync.pending_report.as_ref() else {
        return Ok(());
    };
    let ack = match client.report_apply(report).await {
        Ok(ack) => ack,
        Err(err) => {
            if let Some(rejected) = err
                .downcast_ref::<CpError>()
                .filter(|rejected| rejected.is_permanent_rejection())
            {
                warn!(
                    request_id = client.request_id(),
                    version = ?report.version,
                    status = %rejected.status,
                    code = ?rejected.code,
                    "apply report rejected permanently; dropping it"
                );
                sync.pending_report = None;
                return Ok(());
            }
            return Err(err);
        }
    };
    info!(
        request_id = client.request_id(),
        version = ack.version,
        status = ack.status.as_str(),
        recorded = ack.recorded,
        applied_version = ack.applied_version,
        consecutive_failures = ack.consecutive_failures,
        "apply result reported"
    );
    sync.pending_report = None;
    Ok(())
}
