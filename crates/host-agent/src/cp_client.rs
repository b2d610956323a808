use reqwest::{Response, StatusCode};
use tracing::warn;
use uuid::Uuid;

use crate::{
    REQUEST_ID_HEADER,
    api::{
        ApplyReportRequest, ApplyReportResponse, ErrorBody, Plan, VersionPollResponse, error_codes,
    },
    config,
};

/// Non-success answer from the control plane.
#[derive(Debug, thiserror::Error)]
#[error("{operation} failed: status {status}, body: {body}")]
pub struct CpError {
    pub operation: &'static str,
    pub status: StatusCode,
    /// Machine-readable code when the body was a structured error.
    pub code: Option<String>,
    pub body: String,
}

impl CpError {
    async fn from_response(operation: &'static str, res: Response) -> Self {
        let status = res.status();
        let body = res.text().await.unwrap_or_default();
        let code = serde_json::from_str::<ErrorBody>(&body)
            .ok()
            .map(|parsed| parsed.code);
        Self {
            operation,
            status,
            code,
            body,
        }
    }

    /// Token or identity problems that retrying will not fix.
    pub fn is_credential_failure(&self) -> bool {
        matches!(
            self.code.as_deref(),
            Some(error_codes::MISSING_TOKEN | error_codes::INVALID_TOKEN | error_codes::HOST_NOT_FOUND)
        )
    }

    /// A 4xx the control plane will answer identically on every resend.
    pub fn is_permanent_rejection(&self) -> bool {
        self.status.is_client_error()
            && !matches!(
                self.status,
                StatusCode::REQUEST_TIMEOUT | StatusCode::TOO_MANY_REQUESTS
            )
            && !self.is_credential_failure()
    }
}

/// Result of fetching one plan version.
#[derive(Debug)]
pub enum PlanFetch {
    Found(Box<Plan>),
    /// The version is not (yet) readable; the caller retries on a later tick.
    NotFound,
}

#[derive(Clone)]
pub struct ControlPlaneClient {
    cfg: config::AppConfig,
    client: reqwest::Client,
    request_id: String,
}

impl ControlPlaneClient {
    /// Client for one sync cycle; every cycle gets a fresh request id.
    pub fn new(cfg: &config::AppConfig, client: reqwest::Client) -> Self {
        Self::with_request_id(cfg, client, Uuid::new_v4().to_string())
    }

    pub fn with_request_id(
        cfg: &config::AppConfig,
        client: reqwest::Client,
        request_id: String,
    ) -> Self {
        Self {
            cfg: cfg.clone(),
            client,
            request_id,
        }
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    pub async fn poll_version(&self, current_version: u64) -> anyhow::Result<VersionPollResponse> {
        let res = self
            .client
            .get(version_url(&self.cfg))
            .query(&[("current_version", current_version)])
            .bearer_auth(&self.cfg.host_token)
            .header(REQUEST_ID_HEADER, &self.request_id)
            .send()
            .await
            .map_err(|err| {
                warn!(request_id = %self.request_id, ?err, "version poll request failed");
                err
            })?;

        if !res.status().is_success() {
            let err = CpError::from_response("version poll", res).await;
            warn!(request_id = %self.request_id, status = %err.status, code = ?err.code, "version poll rejected");
            return Err(err.into());
        }

        Ok(res.json::<VersionPollResponse>().await?)
    }

    pub async fn fetch_plan(&self, version: u64) -> anyhow::Result<PlanFetch> {
        let res = self
            .client
            .get(plan_url(&self.cfg, version))
            .bearer_auth(&self.cfg.host_token)
            .header(REQUEST_ID_HEADER, &self.request_id)
            .send()
            .await
            .map_err(|err| {
                warn!(request_id = %self.request_id, ?err, "plan request failed");
                err
            })?;

        if !res.status().is_success() {
            let err = CpError::from_response("plan fetch", res).await;
            if err.code.as_deref() == Some(error_codes::PLAN_NOT_FOUND) {
                return Ok(PlanFetch::NotFound);
            }
            warn!(request_id = %self.request_id, version, status = %err.status, code = ?err.code, "plan fetch rejected");
            return Err(err.into());
        }

        let plan = res.json::<Plan>().await?;
        Ok(PlanFetch::Found(Box::new(plan)))
    }

    pub async fn report_apply(
        &self,
        report: &ApplyReportRequest,
    ) -> anyhow::Result<ApplyReportResponse> {
        let res = self
            .client
            .post(report_url(&self.cfg))
            .bearer_auth(&self.cfg.host_token)
            .header(REQUEST_ID_HEADER, &self.request_id)
            .json(report)
            .send()
            .await
            .map_err(|err| {
                warn!(request_id = %self.request_id, ?err, "apply report request failed");
                err
            })?;

        if !res.status().is_success() {
            let err = CpError::from_response("apply report", res).await;
            warn!(request_id = %self.request_id, status = %err.status, code = ?err.code, "apply report rejected");
            return Err(err.into());
        }

        Ok(res.json::<ApplyReportResponse>().await?)
    }
}

fn agent_base(cfg: &config::AppConfig) -> String {
    let base = cfg.control_plane_url.trim_end_matches('/');
    format!("{}/api/v1/agent/{}", base, cfg.host_id)
}

pub(crate) fn version_url(cfg: &config::AppConfig) -> String {
    format!("{}/version", agent_base(cfg))
}

pub(crate) fn plan_url(cfg: &config::AppConfig, version: u64) -> String {
    format!("{}/plans/{}", agent_base(cfg), version)
}

pub(crate) fn report_url(cfg: &config::AppConfig) -> String {
    format!("{}/apply-result", agent_base(cfg))
}
