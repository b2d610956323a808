use serde::{Deserialize, Deserializer};

pub const ENV_PREFIX: &str = "EDGEFLEET_CP";

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub metrics: MetricsConfig,
    pub database: DatabaseConfig,
    pub operator: OperatorAuthConfig,
    pub tokens: TokenConfig,
    pub limits: LimitsConfig,
    pub distribution: DistributionConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

/// Dedicated unauthenticated listener for Prometheus scrapes.
#[derive(Debug, Clone, Deserialize)]
pub struct MetricsConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OperatorAuthConfig {
    #[serde(deserialize_with = "deserialize_string_or_vec")]
    pub tokens: Vec<String>,
    pub header_name: String,
}

fn deserialize_string_or_vec<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum StringOrVec {
        String(String),
        Vec(Vec<String>),
    }

    match StringOrVec::deserialize(deserializer)? {
        StringOrVec::String(value) => Ok(value.split(',').map(|s| s.to_string()).collect()),
        StringOrVec::Vec(values) => Ok(values),
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TokenConfig {
    pub pepper: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LimitsConfig {
    pub deploy_body_bytes: u64,
    pub report_body_bytes: u64,
    pub max_field_len: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DistributionConfig {
    /// Plans older than this many versions behind the newest are pruned on deploy.
    pub plan_retention_count: u64,
    /// Capacity of each host's apply-history ring.
    pub max_history: usize,
    pub heartbeat_write_interval_secs: u64,
    pub online_threshold_secs: u64,
    pub deploy_history_limit: usize,
    /// Compare-and-swap attempts for version pointer writes.
    pub update_retries: usize,
    #[serde(default = "default_true")]
    pub auto_reality_keys: bool,
}

fn default_true() -> bool {
    true
}

impl DistributionConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.plan_retention_count == 0 {
            anyhow::bail!("distribution.plan_retention_count must be > 0");
        }
        if self.max_history == 0 {
            anyhow::bail!("distribution.max_history must be > 0");
        }
        if self.heartbeat_write_interval_secs == 0 {
            anyhow::bail!("distribution.heartbeat_write_interval_secs must be > 0");
        }
        if self.online_threshold_secs == 0 {
            anyhow::bail!("distribution.online_threshold_secs must be > 0");
        }
        if self.deploy_history_limit == 0 {
            anyhow::bail!("distribution.deploy_history_limit must be > 0");
        }
        if self.update_retries == 0 {
            anyhow::bail!("distribution.update_retries must be > 0");
        }
        Ok(())
    }

    pub fn heartbeat_write_interval(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.heartbeat_write_interval_secs as i64)
    }

    pub fn online_threshold(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.online_threshold_secs as i64)
    }
}

impl Default for DistributionConfig {
    fn default() -> Self {
        Self {
            plan_retention_count: 10,
            max_history: 20,
            heartbeat_write_interval_secs: 600,
            online_threshold_secs: 300,
            deploy_history_limit: 20,
            update_retries: 5,
            auto_reality_keys: true,
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            deploy_body_bytes: 256 * 1024,
            report_body_bytes: 16 * 1024,
            max_field_len: 255,
        }
    }
}

pub fn load() -> anyhow::Result<AppConfig> {
    let env = config::Environment::with_prefix(ENV_PREFIX)
        .separator("__")
        // Keep try_parsing disabled so numeric token strings are not coerced.
        .try_parsing(false);

    let distribution = DistributionConfig::default();
    let limits = LimitsConfig::default();

    let builder = config::Config::builder()
        .add_source(config::File::with_name("config").required(false))
        .add_source(env)
        .set_default("server.host", "0.0.0.0")?
        .set_default("server.port", 8080)?
        .set_default("metrics.host", "127.0.0.1")?
        .set_default("metrics.port", 9090)?
        .set_default("database.url", "sqlite://data/control-plane.db")?
        .set_default("operator.tokens", vec!["dev-operator-token"])?
        .set_default("operator.header_name", "authorization")?
        .set_default("tokens.pepper", "dev-token-pepper")?
        .set_default("limits.deploy_body_bytes", limits.deploy_body_bytes)?
        .set_default("limits.report_body_bytes", limits.report_body_bytes)?
        .set_default("limits.max_field_len", limits.max_field_len as u64)?
        .set_default(
            "distribution.plan_retention_count",
            distribution.plan_retention_count,
        )?
        .set_default("distribution.max_history", distribution.max_history as u64)?
        .set_default(
            "distribution.heartbeat_write_interval_secs",
            distribution.heartbeat_write_interval_secs,
        )?
        .set_default(
            "distribution.online_threshold_secs",
            distribution.online_threshold_secs,
        )?
        .set_default(
            "distribution.deploy_history_limit",
            distribution.deploy_history_limit as u64,
        )?
        .set_default(
            "distribution.update_retries",
            distribution.update_retries as u64,
        )?
        .set_default("distribution.auto_reality_keys", distribution.auto_reality_keys)?;

    let cfg = builder.build()?;
    let mut app: AppConfig = cfg.try_deserialize()?;
    app.operator.header_name = app.operator.header_name.trim().to_ascii_lowercase();
    if app.operator.header_name.is_empty() {
        anyhow::bail!("operator.header_name cannot be empty");
    }
    app.distribution.validate()?;
    Ok(app)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{env, panic, sync::Mutex};

    static ENV_LOCK: Mutex<()> = Mutex::new(());

    fn with_control_plane_env(vars: &[(&str, &str)], test: impl FnOnce() + panic::UnwindSafe) {
        let _guard = ENV_LOCK.lock().expect("env mutex poisoned");
        let prefix = format!("{}__", ENV_PREFIX);

        let existing: Vec<(String, String)> = env::vars()
            .filter(|(key, _)| key.starts_with(&prefix))
            .collect();

        unsafe {
            for (key, _) in &existing {
                env::remove_var(key);
            }
            for (key, value) in vars {
                env::set_var(key, value);
            }
        }

        let result = panic::catch_unwind(test);

        unsafe {
            for (key, _) in vars {
                env::remove_var(key);
            }
            for (key, value) in existing {
                env::set_var(key, value);
            }
        }

        result.unwrap();
    }

    #[test]
    fn defaults_load() {
        with_control_plane_env(&[], || {
            let cfg = load().expect("config loads");
            assert_eq!(cfg.server.port, 8080);
            assert_eq!(cfg.metrics.port, 9090);
            assert_eq!(cfg.distribution.plan_retention_count, 10);
            assert_eq!(cfg.distribution.max_history, 20);
            assert_eq!(cfg.distribution.heartbeat_write_interval_secs, 600);
            assert_eq!(cfg.distribution.online_threshold_secs, 300);
            assert_eq!(cfg.distribution.deploy_history_limit, 20);
            assert!(cfg.distribution.auto_reality_keys);
        });
    }

    #[test]
    fn numeric_tokens_remain_strings() {
        with_control_plane_env(
            &[
                ("EDGEFLEET_CP__OPERATOR__TOKENS", "1111,2222"),
                ("EDGEFLEET_CP__TOKENS__PEPPER", "9999"),
            ],
            || {
                let cfg = load().expect("config loads");
                assert_eq!(
                    cfg.operator.tokens,
                    vec!["1111".to_string(), "2222".to_string()]
                );
                assert_eq!(cfg.tokens.pepper, "9999");
            },
        );
    }

    #[test]
    fn numeric_and_bool_env_values_still_parse() {
        with_control_plane_env(
            &[
                ("EDGEFLEET_CP__SERVER__PORT", "9091"),
                ("EDGEFLEET_CP__LIMITS__MAX_FIELD_LEN", "512"),
                ("EDGEFLEET_CP__DISTRIBUTION__PLAN_RETENTION_COUNT", "3"),
                ("EDGEFLEET_CP__DISTRIBUTION__AUTO_REALITY_KEYS", "false"),
            ],
            || {
                let cfg = load().expect("config loads");
                assert_eq!(cfg.server.port, 9091);
                assert_eq!(cfg.limits.max_field_len, 512);
                assert_eq!(cfg.distribution.plan_retention_count, 3);
                assert!(!cfg.distribution.auto_reality_keys);
            },
        );
    }

    #[test]
    fn zero_counts_are_rejected() {
        with_control_plane_env(
            &[("EDGEFLEET_CP__DISTRIBUTION__MAX_HISTORY", "0")],
            || {
                let err = load().expect_err("zero history rejected");
                assert!(err.to_string().contains("max_history"));
            },
        );
        with_control_plane_env(
            &[("EDGEFLEET_CP__DISTRIBUTION__ONLINE_THRESHOLD_SECS", "0")],
            || {
                assert!(load().is_err());
            },
        );
    }
}
