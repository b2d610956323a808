use super::*;
use axum::routing::{get, post};
use tower_http::limit::RequestBodyLimitLayer;

pub fn router(state: AppState) -> Router<AppState> {
    let report_limit = state.limits.report_body_bytes;

    Router::<AppState>::new()
        .route("/api/v1/agent/{host_id}/version", get(poll_version))
        .route("/api/v1/agent/{host_id}/plans/{version}", get(fetch_plan))
        .route(
            "/api/v1/agent/{host_id}/apply-result",
            post(report_apply)
                .layer(RequestBodyLimitLayer::new(report_limit as usize))
                .layer(middleware::from_fn_with_state(
                    report_limit,
                    reject_oversized_body,
                )),
        )
}

#[derive(Debug, Deserialize, utoipa::IntoParams, utoipa::ToSchema)]
pub(crate) struct VersionQuery {
    /// Version the host currently runs; 0 when nothing was applied yet.
    #[serde(default)]
    pub current_version: Option<u64>,
}

async fn authenticate(
    state: &AppState,
    headers: &HeaderMap,
    host_id: Uuid,
) -> ApiResult<crate::persistence::HostRecord> {
    let token = crate::auth::bearer_token(headers);
    services::hosts::authenticate_host(state, host_id, token.as_deref()).await
}

#[utoipa::path(
    get,
    path = "/api/v1/agent/{host_id}/version",
    params(
        ("host_id" = Uuid, Path, description = "Host identifier"),
        VersionQuery
    ),
    responses(
        (status = 200, description = "Target version for the host", body = api::VersionPollResponse),
        (status = 401, description = "Missing or invalid host token", body = ErrorResponse),
        (status = 404, description = "Host not found", body = ErrorResponse)
    ),
    security(("hostBearer" = [])),
    tag = "agent"
)]
pub(crate) async fn poll_version(
    State(state): State<AppState>,
    Path(host_id): Path<Uuid>,
    Query(query): Query<VersionQuery>,
    headers: HeaderMap,
) -> ApiResult<Json<api::VersionPollResponse>> {
    let host = authenticate(&state, &headers, host_id).await?;
    let response =
        services::distribution::poll(&state, &host, query.current_version.unwrap_or(0)).await?;
    Ok(Json(response))
}

#[utoipa::path(
    get,
    path = "/api/v1/agent/{host_id}/plans/{version}",
    params(
        ("host_id" = Uuid, Path, description = "Host identifier"),
        ("version" = u64, Path, description = "Plan version")
    ),
    responses(
        (status = 200, description = "Immutable plan document", body = api::Plan),
        (status = 401, description = "Missing or invalid host token", body = ErrorResponse),
        (status = 404, description = "Host or plan not found", body = ErrorResponse)
    ),
    security(("hostBearer" = [])),
    tag = "agent"
)]
pub(crate) async fn fetch_plan(
    State(state): State<AppState>,
    Path((host_id, version)): Path<(Uuid, u64)>,
    headers: HeaderMap,
) -> ApiResult<Json<api::Plan>> {
    let host = authenticate(&state, &headers, host_id).await?;
    let plan = services::distribution::fetch_plan(&state, &host, version).await?;
    Ok(Json(plan))
}

#[utoipa::path(
    post,
    path = "/api/v1/agent/{host_id}/apply-result",
    params(
        ("host_id" = Uuid, Path, description = "Host identifier")
    ),
    request_body = api::ApplyReportRequest,
    responses(
        (status = 200, description = "Report acknowledged", body = api::ApplyReportResponse),
        (status = 400, description = "Missing version or status, or unpublished version", body = ErrorResponse),
        (status = 401, description = "Missing or invalid host token", body = ErrorResponse),
        (status = 404, description = "Host not found", body = ErrorResponse),
        (status = 413, description = "Report body too large", body = ErrorResponse)
    ),
    security(("hostBearer" = [])),
    tag = "agent"
)]
pub(crate) async fn report_apply(
    State(state): State<AppState>,
    Path(host_id): Path<Uuid>,
    headers: HeaderMap,
    Json(payload): Json<api::ApplyReportRequest>,
) -> ApiResult<Json<api::ApplyReportResponse>> {
    let host = authenticate(&state, &headers, host_id).await?;
    let response = services::distribution::report(&state, &host, payload).await?;
    Ok(Json(response))
}
