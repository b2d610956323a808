use std::time::Duration;

use anyhow::Context;
use reqwest::header::{HeaderMap, HeaderValue};
use tracing::warn;

pub mod api;
pub mod apply;
pub mod config;
pub mod cp_client;
pub mod runner;
pub mod state;
pub mod sync;
pub mod telemetry;
pub mod version;

pub const REQUEST_ID_HEADER: &str = "x-request-id";
pub const AGENT_VERSION_HEADER: &str = "x-agent-version";
pub const AGENT_BUILD_HEADER: &str = "x-agent-build";

pub fn validate_control_plane_url(cfg: &config::AppConfig) -> anyhow::Result<()> {
    let url = reqwest::Url::parse(&cfg.control_plane_url)?;
    match url.scheme() {
        "https" => Ok(()),
        "http" if cfg.allow_insecure_http => {
            warn!(
                cp = %cfg.control_plane_url,
                "insecure HTTP control-plane URL in use; host token travels unencrypted"
            );
            Ok(())
        }
        "http" => anyhow::bail!(
            "insecure control-plane URL not allowed: {}; set allow_insecure_http=true to override",
            cfg.control_plane_url
        ),
        other => anyhow::bail!("unsupported URL scheme: {}", other),
    }
}

pub fn build_client(cfg: &config::AppConfig) -> anyhow::Result<reqwest::Client> {
    let mut builder = reqwest::Client::builder()
        .default_headers(build_agent_headers()?)
        .timeout(Duration::from_secs(cfg.request_timeout_secs));

    if let Some(ca_path) = cfg.ca_cert_path.as_ref() {
        let pem = std::fs::read(ca_path)
            .map_err(|err| anyhow::anyhow!("failed to read ca_cert_path {}: {}", ca_path, err))?;
        let cert = reqwest::Certificate::from_pem(&pem)
            .map_err(|err| anyhow::anyhow!("invalid certificate in {}: {}", ca_path, err))?;
        builder = builder.add_root_certificate(cert);
    }

    if cfg.tls_insecure_skip_verify {
        warn!("TLS certificate verification is disabled; use only for development");
        builder = builder.danger_accept_invalid_certs(true);
    }

    builder.build().map_err(Into::into)
}

fn build_agent_headers() -> anyhow::Result<HeaderMap> {
    if version::VERSION.trim().is_empty() {
        anyhow::bail!("agent version metadata missing; refusing to start");
    }

    let mut headers = HeaderMap::new();
    headers.insert(
        AGENT_VERSION_HEADER,
        HeaderValue::from_str(version::VERSION).context("invalid agent version header value")?,
    );
    headers.insert(
        AGENT_BUILD_HEADER,
        HeaderValue::from_str(version::GIT_LABEL).context("invalid agent build header value")?,
    );

    Ok(headers)
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::path::Path;

    use chrono::Utc;
    use common::api::{EdgeBinding, EdgeConfig, EdgePlan, EdgeRuntime, PlanMeta, Settings};
    use uuid::Uuid;

    use crate::api::{Plan, Protocol, TlsMode, Transport};
    use crate::config::AppConfig;

    pub fn base_config(dir: &Path) -> AppConfig {
        AppConfig {
            control_plane_url: "http://127.0.0.1:1".into(),
            host_id: Uuid::new_v4(),
            host_token: "host-token".into(),
            poll_interval_secs: 1,
            request_timeout_secs: 2,
            backoff_ms: 10,
            backoff_max_ms: 40,
            plan_path: dir.join("plan.json"),
            state_dir: dir.join("state"),
            apply_command: None,
            allow_insecure_http: true,
            tls_insecure_skip_verify: false,
            ca_cert_path: None,
            metrics_host: "127.0.0.1".into(),
            metrics_port: 0,
        }
    }

    pub fn edge_plan(host_id: Uuid, version: u64) -> Plan {
        Plan::Edge(EdgePlan {
            version,
            host_id,
            created_at: Utc::now(),
            edge: EdgeBinding {
                port: 443,
                is_https: true,
                proxyip: String::new(),
                nat64: false,
            },
            runtime: EdgeRuntime {
                configs: vec![EdgeConfig {
                    profile_id: "vless-ws-tls".into(),
                    protocol: Protocol::Vless,
                    transport: Transport::Ws,
                    tls_mode: TlsMode::Tls,
                    settings: Settings::new(),
                }],
                listen_port: 443,
            },
            meta: PlanMeta {
                profile_count: 1,
                profile_ids: vec!["vless-ws-tls".into()],
            },
        })
    }
}
