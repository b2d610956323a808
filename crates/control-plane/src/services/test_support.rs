use std::sync::Arc;

use axum::http::HeaderName;
use common::api::{HostArchetype, HostCreateRequest};

use crate::app_state::{AppState, OperatorAuth};
use crate::config::{DistributionConfig, LimitsConfig};
use crate::persistence::{KvRef, SqliteKv};
use crate::registry::Registry;

pub(crate) const TEST_PEPPER: &str = "pepper";

pub(crate) async fn setup_state() -> AppState {
    setup_state_with(DistributionConfig::default()).await
}

pub(crate) async fn setup_state_with(distribution: DistributionConfig) -> AppState {
    let db = crate::persistence::migrations::init_pool("sqlite::memory:")
        .await
        .expect("pool");
    let migration_outcome = crate::persistence::migrations::run_migrations(&db)
        .await
        .expect("migrations");
    let metrics_handle = crate::metrics::init_metrics_recorder();
    crate::metrics::record_build_info(&migration_outcome.snapshot);
    let kv: KvRef = Arc::new(SqliteKv::new(db.clone()));

    AppState {
        db,
        kv,
        registry: Arc::new(Registry::builtin()),
        operator_auth: OperatorAuth {
            tokens: vec!["op-token".into()],
            header_name: HeaderName::from_static("authorization"),
        },
        token_pepper: TEST_PEPPER.into(),
        limits: LimitsConfig::default(),
        distribution,
        metrics_handle,
        schema: migration_outcome.snapshot,
    }
}

/// Creates a host through the service layer; returns its id and plaintext token.
pub(crate) async fn create_host(
    state: &AppState,
    name: &str,
    archetype: HostArchetype,
    entry_domain: Option<&str>,
) -> (uuid::Uuid, String) {
    let created = crate::services::hosts::create_host(
        state,
        HostCreateRequest {
            name: name.into(),
            archetype: archetype.as_str().into(),
            entry_domain: entry_domain.map(str::to_string),
            entry_domain_direct: None,
            entry_ip: None,
            region: None,
            tags: Vec::new(),
            capabilities: None,
        },
    )
    .await
    .expect("create host");
    (created.host.id, created.host_token)
}
