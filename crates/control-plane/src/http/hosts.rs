use super::*;
use axum::routing::get;

pub fn router(state: AppState) -> Router<AppState> {
    Router::<AppState>::new()
        .route("/api/v1/hosts", get(list_hosts).post(create_host))
        .route(
            "/api/v1/hosts/{host_id}",
            get(get_host).patch(update_host).delete(delete_host),
        )
        .route("/api/v1/hosts/{host_id}/diagnosis", get(diagnose_host))
        .route("/api/v1/hosts/{host_id}/plans/{version}", get(get_host_plan))
        .route_layer(middleware::from_fn_with_state(state, require_operator_auth))
}

#[utoipa::path(
    get,
    path = "/api/v1/hosts",
    responses((status = 200, description = "Hosts with online state", body = [api::HostView])),
    security(("operatorBearer" = [])),
    tag = "hosts"
)]
pub(crate) async fn list_hosts(State(state): State<AppState>) -> ApiResult<Json<Vec<api::HostView>>> {
    Ok(Json(services::hosts::list_hosts(&state).await?))
}

#[utoipa::path(
    post,
    path = "/api/v1/hosts",
    request_body = api::HostCreateRequest,
    responses(
        (status = 201, description = "Host created; the token is only returned here", body = api::HostCreateResponse),
        (status = 400, description = "Invalid host fields or capabilities", body = ErrorResponse)
    ),
    security(("operatorBearer" = [])),
    tag = "hosts"
)]
pub(crate) async fn create_host(
    State(state): State<AppState>,
    Json(payload): Json<api::HostCreateRequest>,
) -> ApiResult<(StatusCode, Json<api::HostCreateResponse>)> {
    let created = services::hosts::create_host(&state, payload).await?;
    Ok((StatusCode::CREATED, Json(created)))
}

#[utoipa::path(
    get,
    path = "/api/v1/hosts/{host_id}",
    params(("host_id" = Uuid, Path, description = "Host identifier")),
    responses(
        (status = 200, description = "Host", body = api::HostView),
        (status = 404, description = "Host not found", body = ErrorResponse)
    ),
    security(("operatorBearer" = [])),
    tag = "hosts"
)]
pub(crate) async fn get_host(
    State(state): State<AppState>,
    Path(host_id): Path<Uuid>,
) -> ApiResult<Json<api::HostView>> {
    Ok(Json(services::hosts::get_host(&state, host_id).await?))
}

#[utoipa::path(
    patch,
    path = "/api/v1/hosts/{host_id}",
    params(("host_id" = Uuid, Path, description = "Host identifier")),
    request_body = api::HostUpdateRequest,
    responses(
        (status = 200, description = "Host updated; carries a new token when rotated", body = api::HostUpdateResponse),
        (status = 400, description = "Invalid host fields or capabilities", body = ErrorResponse),
        (status = 404, description = "Host not found", body = ErrorResponse)
    ),
    security(("operatorBearer" = [])),
    tag = "hosts"
)]
pub(crate) async fn update_host(
    State(state): State<AppState>,
    Path(host_id): Path<Uuid>,
    Json(payload): Json<api::HostUpdateRequest>,
) -> ApiResult<Json<api::HostUpdateResponse>> {
    Ok(Json(
        services::hosts::update_host(&state, host_id, payload).await?,
    ))
}

#[utoipa::path(
    delete,
    path = "/api/v1/hosts/{host_id}",
    params(("host_id" = Uuid, Path, description = "Host identifier")),
    responses(
        (status = 204, description = "Host deleted"),
        (status = 404, description = "Host not found", body = ErrorResponse)
    ),
    security(("operatorBearer" = [])),
    tag = "hosts"
)]
pub(crate) async fn delete_host(
    State(state): State<AppState>,
    Path(host_id): Path<Uuid>,
) -> ApiResult<StatusCode> {
    services::hosts::delete_host(&state, host_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[utoipa::path(
    get,
    path = "/api/v1/hosts/{host_id}/diagnosis",
    params(("host_id" = Uuid, Path, description = "Host identifier")),
    responses(
        (status = 200, description = "Connection, sync state, error diary and apply history", body = api::HostDiagnosis),
        (status = 404, description = "Host not found", body = ErrorResponse)
    ),
    security(("operatorBearer" = [])),
    tag = "hosts"
)]
pub(crate) async fn diagnose_host(
    State(state): State<AppState>,
    Path(host_id): Path<Uuid>,
) -> ApiResult<Json<api::HostDiagnosis>> {
    Ok(Json(services::hosts::diagnose_host(&state, host_id).await?))
}

#[utoipa::path(
    get,
    path = "/api/v1/hosts/{host_id}/plans/{version}",
    params(
        ("host_id" = Uuid, Path, description = "Host identifier"),
        ("version" = u64, Path, description = "Plan version")
    ),
    responses(
        (status = 200, description = "Stored plan", body = api::Plan),
        (status = 404, description = "Host or plan not found", body = ErrorResponse)
    ),
    security(("operatorBearer" = [])),
    tag = "hosts"
)]
pub(crate) async fn get_host_plan(
    State(state): State<AppState>,
    Path((host_id, version)): Path<(Uuid, u64)>,
) -> ApiResult<Json<api::Plan>> {
    Ok(Json(
        services::hosts::get_host_plan(&state, host_id, version).await?,
    ))
}
