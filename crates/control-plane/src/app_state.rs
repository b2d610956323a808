use std::sync::Arc;

use axum::http::HeaderName;
use metrics_exporter_prometheus::PrometheusHandle;
use subtle::ConstantTimeEq;

use crate::{
    config::{DistributionConfig, LimitsConfig},
    persistence,
    registry::Registry,
};

/// Shared application state passed into handlers.
#[derive(Clone)]
pub struct AppState {
    pub db: persistence::Db,
    pub kv: persistence::KvRef,
    /// Capability tables; injected so tests can substitute fixtures.
    pub registry: Arc<Registry>,
    pub operator_auth: OperatorAuth,
    pub token_pepper: String,
    pub limits: LimitsConfig,
    pub distribution: DistributionConfig,
    pub metrics_handle: PrometheusHandle,
    pub schema: persistence::MigrationSnapshot,
}

/// Operator authentication configuration.
#[derive(Clone)]
pub struct OperatorAuth {
    pub tokens: Vec<String>,
    pub header_name: HeaderName,
}

impl OperatorAuth {
    pub fn is_env_token(&self, candidate: &str) -> bool {
        self.tokens.iter().any(|token| {
            if token.len() != candidate.len() {
                return false;
            }
            token.as_bytes().ct_eq(candidate.as_bytes()).into()
        })
    }
}

#[allow(dead_code)]
fn _assert_app_state_bounds() {
    fn assert_bounds<T: Clone + Send + Sync + 'static>() {}
    assert_bounds::<AppState>();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn operator_auth_checks_exact_tokens() {
        let auth = OperatorAuth {
            tokens: vec!["secret-token".to_string()],
            header_name: HeaderName::from_static("authorization"),
        };

        assert!(auth.is_env_token("secret-token"));
        assert!(!auth.is_env_token("secret-token-2"));
        assert!(!auth.is_env_token("SECRET-TOKEN"));
        assert!(!auth.is_env_token(""));
    }
}
