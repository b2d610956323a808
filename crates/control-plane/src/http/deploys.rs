use super::*;
use axum::routing::{get, post};
use tower_http::limit::RequestBodyLimitLayer;

pub fn router(state: AppState) -> Router<AppState> {
    let deploy_limit = state.limits.deploy_body_bytes;

    Router::<AppState>::new()
        .route(
            "/api/v1/deploys",
            get(list_deploys).post(create_deploy).layer(
                ServiceBuilder::new()
                    .layer(middleware::from_fn_with_state(
                        deploy_limit,
                        reject_oversized_body,
                    ))
                    .layer(RequestBodyLimitLayer::new(deploy_limit as usize)),
            ),
        )
        .route("/api/v1/deploys/{deploy_id}", get(get_deploy))
        .route("/api/v1/rollback", post(rollback))
        .route_layer(middleware::from_fn_with_state(state, require_operator_auth))
}

#[utoipa::path(
    post,
    path = "/api/v1/deploys",
    request_body = api::DeployRequest,
    responses(
        (status = 200, description = "Per-host outcomes; a deploy never fails as a whole once validated", body = api::DeployRecord),
        (status = 400, description = "Empty host or profile list", body = ErrorResponse),
        (status = 404, description = "Unknown profile", body = ErrorResponse),
        (status = 413, description = "Request body too large", body = ErrorResponse)
    ),
    security(("operatorBearer" = [])),
    tag = "deploys"
)]
pub(crate) async fn create_deploy(
    State(state): State<AppState>,
    Json(payload): Json<api::DeployRequest>,
) -> ApiResult<Json<api::DeployRecord>> {
    Ok(Json(services::deploys::deploy(&state, payload).await?))
}

#[utoipa::path(
    get,
    path = "/api/v1/deploys",
    responses((status = 200, description = "Most recent deploys, newest first", body = [api::DeploySummary])),
    security(("operatorBearer" = [])),
    tag = "deploys"
)]
pub(crate) async fn list_deploys(
    State(state): State<AppState>,
) -> ApiResult<Json<Vec<api::DeploySummary>>> {
    Ok(Json(services::deploys::list_deploys(&state).await?))
}

#[utoipa::path(
    get,
    path = "/api/v1/deploys/{deploy_id}",
    params(("deploy_id" = Uuid, Path, description = "Deploy identifier")),
    responses(
        (status = 200, description = "Deploy record", body = api::DeployRecord),
        (status = 404, description = "Deploy not found", body = ErrorResponse)
    ),
    security(("operatorBearer" = [])),
    tag = "deploys"
)]
pub(crate) async fn get_deploy(
    State(state): State<AppState>,
    Path(deploy_id): Path<Uuid>,
) -> ApiResult<Json<api::DeployRecord>> {
    Ok(Json(services::deploys::get_deploy(&state, deploy_id).await?))
}

#[utoipa::path(
    post,
    path = "/api/v1/rollback",
    request_body = api::RollbackRequest,
    responses(
        (status = 200, description = "Per-host rollback results", body = api::RollbackResponse),
        (status = 400, description = "Invalid target version or empty host list", body = ErrorResponse)
    ),
    security(("operatorBearer" = [])),
    tag = "deploys"
)]
pub(crate) async fn rollback(
    State(state): State<AppState>,
    Json(payload): Json<api::RollbackRequest>,
) -> ApiResult<Json<api::RollbackResponse>> {
    Ok(Json(services::deploys::rollback(&state, payload).await?))
}
