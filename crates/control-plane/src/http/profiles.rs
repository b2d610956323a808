use super::*;
use axum::routing::get;

pub fn router(state: AppState) -> Router<AppState> {
    Router::<AppState>::new()
        .route("/api/v1/profiles", get(list_profiles).post(create_profile))
        .route(
            "/api/v1/profiles/{id}",
            get(get_profile)
                .patch(update_profile)
                .delete(delete_profile),
        )
        .route_layer(middleware::from_fn_with_state(state, require_operator_auth))
}

#[utoipa::path(
    get,
    path = "/api/v1/profiles",
    responses((status = 200, description = "Built-in profiles followed by custom ones", body = [api::ProfileView])),
    security(("operatorBearer" = [])),
    tag = "profiles"
)]
pub(crate) async fn list_profiles(
    State(state): State<AppState>,
) -> ApiResult<Json<Vec<api::ProfileView>>> {
    Ok(Json(services::profiles::list_profiles(&state).await?))
}

#[utoipa::path(
    post,
    path = "/api/v1/profiles",
    request_body = api::ProfileCreateRequest,
    responses(
        (status = 201, description = "Profile created", body = api::ProfileView),
        (status = 400, description = "Invalid id, name or combination", body = ErrorResponse)
    ),
    security(("operatorBearer" = [])),
    tag = "profiles"
)]
pub(crate) async fn create_profile(
    State(state): State<AppState>,
    Json(payload): Json<api::ProfileCreateRequest>,
) -> ApiResult<(StatusCode, Json<api::ProfileView>)> {
    let view = services::profiles::create_profile(&state, payload).await?;
    Ok((StatusCode::CREATED, Json(view)))
}

#[utoipa::path(
    get,
    path = "/api/v1/profiles/{id}",
    params(("id" = String, Path, description = "Profile identifier")),
    responses(
        (status = 200, description = "Profile with its resolved field schema", body = api::ProfileDetail),
        (status = 404, description = "Profile not found", body = ErrorResponse)
    ),
    security(("operatorBearer" = [])),
    tag = "profiles"
)]
pub(crate) async fn get_profile(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<api::ProfileDetail>> {
    Ok(Json(services::profiles::get_profile(&state, &id).await?))
}

#[utoipa::path(
    patch,
    path = "/api/v1/profiles/{id}",
    params(("id" = String, Path, description = "Profile identifier")),
    request_body = api::ProfileUpdateRequest,
    responses(
        (status = 200, description = "Profile updated", body = api::ProfileView),
        (status = 400, description = "Invalid combination", body = ErrorResponse),
        (status = 404, description = "Profile not found", body = ErrorResponse),
        (status = 409, description = "Field is immutable on a built-in profile", body = ErrorResponse)
    ),
    security(("operatorBearer" = [])),
    tag = "profiles"
)]
pub(crate) async fn update_profile(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(payload): Json<api::ProfileUpdateRequest>,
) -> ApiResult<Json<api::ProfileView>> {
    Ok(Json(
        services::profiles::update_profile(&state, &id, payload).await?,
    ))
}

#[utoipa::path(
    delete,
    path = "/api/v1/profiles/{id}",
    params(("id" = String, Path, description = "Profile identifier")),
    responses(
        (status = 200, description = "Custom profile deleted or built-in override reset", body = api::ProfileDeleteResponse),
        (status = 404, description = "Profile not found", body = ErrorResponse)
    ),
    security(("operatorBearer" = [])),
    tag = "profiles"
)]
pub(crate) async fn delete_profile(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Json<api::ProfileDeleteResponse>> {
    Ok(Json(services::profiles::delete_profile(&state, &id).await?))
}
