use serde::Deserialize;
use std::env;
use std::path::PathBuf;
use uuid::Uuid;

pub const ENV_PREFIX: &str = "EDGEFLEET_AGENT";

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub control_plane_url: String,
    pub host_id: Uuid,
    pub host_token: String,
    pub poll_interval_secs: u64,
    pub request_timeout_secs: u64,
    pub backoff_ms: u64,
    pub backoff_max_ms: u64,
    /// File the fetched plan is written to; the local proxy runtime reads it from here.
    pub plan_path: PathBuf,
    /// Directory holding the agent's own bookkeeping (`applied_version`).
    pub state_dir: PathBuf,
    /// Program run after each plan write with the plan path as its only argument.
    #[serde(default)]
    pub apply_command: Option<String>,
    pub allow_insecure_http: bool,
    pub tls_insecure_skip_verify: bool,
    pub ca_cert_path: Option<String>,
    pub metrics_host: String,
    pub metrics_port: u16,
}

impl AppConfig {
    pub fn applied_version_path(&self) -> PathBuf {
        self.state_dir.join("applied_version")
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.host_token.trim().is_empty() {
            anyhow::bail!("host_token cannot be empty");
        }
        if self.poll_interval_secs == 0 {
            anyhow::bail!("poll_interval_secs must be > 0");
        }
        if self.request_timeout_secs == 0 {
            anyhow::bail!("request_timeout_secs must be > 0");
        }
        if self.backoff_ms == 0 {
            anyhow::bail!("backoff_ms must be > 0");
        }
        if self.backoff_max_ms < self.backoff_ms {
            anyhow::bail!("backoff_max_ms must be >= backoff_ms");
        }
        if self.plan_path.as_os_str().is_empty() {
            anyhow::bail!("plan_path cannot be empty");
        }
        if self.state_dir.as_os_str().is_empty() {
            anyhow::bail!("state_dir cannot be empty");
        }
        Ok(())
    }
}

// (ENV_NAME, config_key)
const ENV_OVERRIDES: &[(&str, &str)] = &[
    ("EDGEFLEET_AGENT_CONTROL_PLANE_URL", "control_plane_url"),
    ("EDGEFLEET_AGENT_HOST_ID", "host_id"),
    ("EDGEFLEET_AGENT_HOST_TOKEN", "host_token"),
    ("EDGEFLEET_AGENT_POLL_INTERVAL_SECS", "poll_interval_secs"),
    ("EDGEFLEET_AGENT_REQUEST_TIMEOUT_SECS", "request_timeout_secs"),
    ("EDGEFLEET_AGENT_BACKOFF_MS", "backoff_ms"),
    ("EDGEFLEET_AGENT_BACKOFF_MAX_MS", "backoff_max_ms"),
    ("EDGEFLEET_AGENT_PLAN_PATH", "plan_path"),
    ("EDGEFLEET_AGENT_STATE_DIR", "state_dir"),
    ("EDGEFLEET_AGENT_APPLY_COMMAND", "apply_command"),
    ("EDGEFLEET_AGENT_ALLOW_INSECURE_HTTP", "allow_insecure_http"),
    (
        "EDGEFLEET_AGENT_TLS_INSECURE_SKIP_VERIFY",
        "tls_insecure_skip_verify",
    ),
    ("EDGEFLEET_AGENT_CA_CERT_PATH", "ca_cert_path"),
    ("EDGEFLEET_AGENT_METRICS_HOST", "metrics_host"),
    ("EDGEFLEET_AGENT_METRICS_PORT", "metrics_port"),
];

pub fn load() -> anyhow::Result<AppConfig> {
    let mut builder = config::Config::builder()
        .add_source(config::File::with_name("host-agent").required(false))
        .set_default("control_plane_url", "https://127.0.0.1:8080")?
        .set_default("poll_interval_secs", 15)?
        .set_default("request_timeout_secs", 10)?
        .set_default("backoff_ms", 500)?
        .set_default("backoff_max_ms", 30_000)?
        .set_default("plan_path", "/var/lib/edgefleet/plan.json")?
        .set_default("state_dir", "/var/lib/edgefleet")?
        .set_default("apply_command", Option::<String>::None)?
        .set_default("allow_insecure_http", false)?
        .set_default("tls_insecure_skip_verify", false)?
        .set_default("ca_cert_path", Option::<String>::None)?
        .set_default("metrics_host", "127.0.0.1")?
        .set_default("metrics_port", 9191)?;

    // Override with single-underscore environment variables.
    for (env_key, cfg_key) in ENV_OVERRIDES {
        if let Ok(value) = env::var(env_key) {
            let value = value.trim();
            if value.is_empty() {
                continue;
            }
            builder = builder.set_override(*cfg_key, value)?;
        }
    }

    let app: AppConfig = builder.build()?.try_deserialize()?;
    app.validate()?;
    Ok(app)
}
