use crate::{
    app_state::AppState,
    auth::require_operator_auth,
    error::{ApiResult, AppError},
    metrics::HttpMetricsLayer,
    services,
};
use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::{HeaderMap, HeaderValue, Request, StatusCode, header::CONTENT_LENGTH},
    middleware::{self, Next},
    response::{IntoResponse, Response},
};
use common::api;
use serde::{Deserialize, Serialize};
use tower::ServiceBuilder;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use utoipa::{
    Modify, OpenApi,
    openapi::security::{HttpAuthScheme, HttpBuilder, SecurityScheme},
};
use uuid::Uuid;

mod agents;
mod deploys;
mod error_mapper;
mod hosts;
mod profiles;
mod registry;
mod subscriptions;
mod system;

const REQUEST_ID_HEADER: &str = "x-request-id";

#[derive(Debug, Serialize, Deserialize, utoipa::ToSchema)]
pub(crate) struct ErrorResponse {
    pub error: String,
    pub code: String,
}

pub fn build_router(state: AppState) -> Router<AppState> {
    let request_id = axum::http::HeaderName::from_static(REQUEST_ID_HEADER);
    let middleware_stack = ServiceBuilder::new()
        .layer(SetRequestIdLayer::new(request_id.clone(), MakeRequestUuid))
        .layer(PropagateRequestIdLayer::new(request_id))
        .layer(HttpMetricsLayer);
    Router::<AppState>::new()
        .merge(system::api_router(state.clone()))
        .merge(agents::router(state.clone()))
        .merge(registry::router(state.clone()))
        .merge(profiles::router(state.clone()))
        .merge(hosts::router(state.clone()))
        .merge(deploys::router(state.clone()))
        .merge(subscriptions::router(state.clone()))
        .merge(subscriptions::public_router())
        .layer(middleware_stack)
}

/// Router for the dedicated metrics listener; unauthenticated.
pub fn build_metrics_router() -> Router<AppState> {
    system::metrics_router()
}

/// Rejects requests whose declared body length exceeds `limit` with a typed error.
///
/// Bodies without a length header are still capped by the `RequestBodyLimitLayer` on the route.
async fn reject_oversized_body(
    State(limit): State<u64>,
    req: Request<axum::body::Body>,
    next: Next,
) -> ApiResult<Response> {
    let declared = req
        .headers()
        .get(CONTENT_LENGTH)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.parse::<u64>().ok());
    if let Some(length) = declared
        && length > limit
    {
        return Err(AppError::payload_too_large(format!(
            "request body exceeds {limit} bytes limit"
        )));
    }
    Ok(next.run(req).await)
}

#[derive(OpenApi)]
#[openapi(
    paths(
        system::healthz,
        system::metrics,
        agents::poll_version,
        agents::fetch_plan,
        agents::report_apply,
        registry::get_registry,
        profiles::list_profiles,
        profiles::create_profile,
        profiles::get_profile,
        profiles::update_profile,
        profiles::delete_profile,
        hosts::list_hosts,
        hosts::create_host,
        hosts::get_host,
        hosts::update_host,
        hosts::delete_host,
        hosts::diagnose_host,
        hosts::get_host_plan,
        deploys::create_deploy,
        deploys::list_deploys,
        deploys::get_deploy,
        deploys::rollback,
        subscriptions::list_subscriptions,
        subscriptions::create_subscription,
        subscriptions::get_subscription,
        subscriptions::update_subscription,
        subscriptions::delete_subscription,
        subscriptions::export_subscription,
    ),
    components(schemas(
        api::Protocol,
        api::Transport,
        api::TlsMode,
        api::HostArchetype,
        api::CapabilitySet,
        api::FieldKind,
        api::ResolutionHint,
        api::FieldVisibility,
        api::FieldDescriptor,
        api::Plan,
        api::FullPlan,
        api::Inbound,
        api::Routing,
        api::PlanMeta,
        api::EdgePlan,
        api::EdgeBinding,
        api::EdgeRuntime,
        api::EdgeConfig,
        api::ApplyStatus,
        api::VersionPollResponse,
        api::ApplyReportRequest,
        api::ApplyReportResponse,
        api::ApplyHistoryEntry,
        api::HostView,
        api::HostCreateRequest,
        api::HostCreateResponse,
        api::HostUpdateRequest,
        api::HostUpdateResponse,
        api::ManagerConnection,
        api::TemplateSync,
        api::HostDiagnosis,
        api::ProfileView,
        api::ProfileDetail,
        api::ProfileCreateRequest,
        api::ProfileUpdateRequest,
        api::ProfileDeleteResponse,
        api::ProtocolEntry,
        api::TransportEntry,
        api::TlsEntry,
        api::ArchetypeEntry,
        api::RegistryView,
        api::DeployRequest,
        api::DeployOutcome,
        api::DeployHostResult,
        api::HostVersion,
        api::DeployRecord,
        api::DeploySummary,
        api::RollbackRequest,
        api::RollbackStatus,
        api::RollbackHostResult,
        api::RollbackResponse,
        api::SubscriptionView,
        api::SubscriptionCreateRequest,
        api::SubscriptionUpdateRequest,
        api::ExportFormat,
        system::HealthResponse,
        agents::VersionQuery,
        subscriptions::ExportQuery,
        ErrorResponse,
    )),
    tags(
        (name = "system", description = "Health and metrics"),
        (name = "agent", description = "Host poll, plan fetch and apply reports"),
        (name = "registry", description = "Capability tables"),
        (name = "profiles", description = "Built-in and custom profile templates"),
        (name = "hosts", description = "Host inventory and diagnosis"),
        (name = "deploys", description = "Plan synthesis and rollback"),
        (name = "subscriptions", description = "Client export subscriptions"),
    ),
    modifiers(&SecurityAddon)
)]
pub struct ApiDoc;

struct SecurityAddon;

impl Modify for SecurityAddon {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        openapi.info.title = "EdgeFleet Control Plane API".to_string();
        openapi.info.version = crate::version::FULL_VERSION.to_string();

        let components = openapi.components.get_or_insert_with(Default::default);
        components.add_security_schemes_from_iter([
            (
                "hostBearer",
                SecurityScheme::Http(
                    HttpBuilder::new()
                        .scheme(HttpAuthScheme::Bearer)
                        .bearer_format("opaque")
                        .description(Some(
                            "Per-host bearer token issued at host creation or rotation.",
                        ))
                        .build(),
                ),
            ),
            (
                "operatorBearer",
                SecurityScheme::Http(
                    HttpBuilder::new()
                        .scheme(HttpAuthScheme::Bearer)
                        .bearer_format("opaque")
                        .description(Some(
                            "Bearer operator token for operator APIs (header name configurable).",
                        ))
                        .build(),
                ),
            ),
        ]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::test_support::setup_state;
    use axum::body::Body;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    #[test]
    fn openapi_lists_both_security_schemes() {
        let doc = ApiDoc::openapi();
        let schemes = doc
            .components
            .as_ref()
            .map(|components| components.security_schemes.clone())
            .unwrap_or_default();
        assert!(schemes.contains_key("hostBearer"));
        assert!(schemes.contains_key("operatorBearer"));
        assert!(doc.paths.paths.contains_key("/api/v1/agent/{host_id}/version"));
        assert!(doc.paths.paths.contains_key("/sub/{token}"));
    }

    #[tokio::test]
    async fn request_id_is_generated_and_propagated() {
        let state = setup_state().await;
        let app = build_router(state.clone()).with_state(state);

        let response = app
            .clone()
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().contains_key(REQUEST_ID_HEADER));

        let response = app
            .oneshot(
                Request::get("/health")
                    .header(REQUEST_ID_HEADER, "req-123")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.headers()[REQUEST_ID_HEADER], "req-123");
    }

    #[tokio::test]
    async fn declared_oversized_body_is_rejected_with_code() {
        let state = setup_state().await;
        let limit = state.limits.deploy_body_bytes;
        let app = build_router(state.clone()).with_state(state);

        let response = app
            .oneshot(
                Request::post("/api/v1/deploys")
                    .header("authorization", "Bearer op-token")
                    .header("content-type", "application/json")
                    .header(CONTENT_LENGTH, (limit + 1).to_string())
                    .body(Body::from(vec![b' '; limit as usize + 1]))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["code"], "payload_too_large");
    }
}
