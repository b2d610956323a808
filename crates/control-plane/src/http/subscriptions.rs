use super::*;
use axum::{
    http::header::{CONTENT_DISPOSITION, CONTENT_TYPE},
    routing::get,
};

pub fn router(state: AppState) -> Router<AppState> {
    Router::<AppState>::new()
        .route(
            "/api/v1/subscriptions",
            get(list_subscriptions).post(create_subscription),
        )
        .route(
            "/api/v1/subscriptions/{token}",
            get(get_subscription)
                .patch(update_subscription)
                .delete(delete_subscription),
        )
        .route_layer(middleware::from_fn_with_state(state, require_operator_auth))
}

/// Export endpoint; the token in the path is the only credential.
pub fn public_router() -> Router<AppState> {
    Router::<AppState>::new().route("/sub/{token}", get(export_subscription))
}

#[derive(Debug, Deserialize, utoipa::IntoParams, utoipa::ToSchema)]
pub(crate) struct ExportQuery {
    /// `v2ray` (default), `clash` or `singbox`; anything else falls back to `v2ray`.
    #[serde(default)]
    pub format: Option<String>,
}

#[utoipa::path(
    get,
    path = "/api/v1/subscriptions",
    responses((status = 200, description = "Subscriptions", body = [api::SubscriptionView])),
    security(("operatorBearer" = [])),
    tag = "subscriptions"
)]
pub(crate) async fn list_subscriptions(
    State(state): State<AppState>,
) -> ApiResult<Json<Vec<api::SubscriptionView>>> {
    Ok(Json(
        services::subscriptions::list_subscriptions(&state).await?,
    ))
}

#[utoipa::path(
    post,
    path = "/api/v1/subscriptions",
    request_body = api::SubscriptionCreateRequest,
    responses(
        (status = 201, description = "Subscription created", body = api::SubscriptionView),
        (status = 400, description = "Invalid name or remark", body = ErrorResponse)
    ),
    security(("operatorBearer" = [])),
    tag = "subscriptions"
)]
pub(crate) async fn create_subscription(
    State(state): State<AppState>,
    Json(payload): Json<api::SubscriptionCreateRequest>,
) -> ApiResult<(StatusCode, Json<api::SubscriptionView>)> {
    let created = services::subscriptions::create_subscription(&state, payload).await?;
    Ok((StatusCode::CREATED, Json(created)))
}

#[utoipa::path(
    get,
    path = "/api/v1/subscriptions/{token}",
    params(("token" = String, Path, description = "Subscription token")),
    responses(
        (status = 200, description = "Subscription", body = api::SubscriptionView),
        (status = 404, description = "Subscription not found", body = ErrorResponse)
    ),
    security(("operatorBearer" = [])),
    tag = "subscriptions"
)]
pub(crate) async fn get_subscription(
    State(state): State<AppState>,
    Path(token): Path<String>,
) -> ApiResult<Json<api::SubscriptionView>> {
    Ok(Json(
        services::subscriptions::get_subscription(&state, &token).await?,
    ))
}

#[utoipa::path(
    patch,
    path = "/api/v1/subscriptions/{token}",
    params(("token" = String, Path, description = "Subscription token")),
    request_body = api::SubscriptionUpdateRequest,
    responses(
        (status = 200, description = "Subscription updated", body = api::SubscriptionView),
        (status = 404, description = "Subscription not found", body = ErrorResponse)
    ),
    security(("operatorBearer" = [])),
    tag = "subscriptions"
)]
pub(crate) async fn update_subscription(
    State(state): State<AppState>,
    Path(token): Path<String>,
    Json(payload): Json<api::SubscriptionUpdateRequest>,
) -> ApiResult<Json<api::SubscriptionView>> {
    Ok(Json(
        services::subscriptions::update_subscription(&state, &token, payload).await?,
    ))
}

#[utoipa::path(
    delete,
    path = "/api/v1/subscriptions/{token}",
    params(("token" = String, Path, description = "Subscription token")),
    responses(
        (status = 204, description = "Subscription deleted"),
        (status = 404, description = "Subscription not found", body = ErrorResponse)
    ),
    security(("operatorBearer" = [])),
    tag = "subscriptions"
)]
pub(crate) async fn delete_subscription(
    State(state): State<AppState>,
    Path(token): Path<String>,
) -> ApiResult<StatusCode> {
    services::subscriptions::delete_subscription(&state, &token).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[utoipa::path(
    get,
    path = "/sub/{token}",
    params(
        ("token" = String, Path, description = "Subscription token"),
        ExportQuery
    ),
    responses(
        (status = 200, description = "Rendered client export", content_type = "text/plain"),
        (status = 403, description = "Subscription disabled", body = ErrorResponse),
        (status = 404, description = "Subscription not found", body = ErrorResponse)
    ),
    tag = "subscriptions"
)]
pub(crate) async fn export_subscription(
    State(state): State<AppState>,
    Path(token): Path<String>,
    Query(query): Query<ExportQuery>,
) -> ApiResult<Response> {
    let format = api::ExportFormat::from_query(query.format.as_deref());
    let body = services::subscriptions::render(&state, &token, format).await?;

    let disposition = HeaderValue::from_str(&format!(
        "attachment; filename=\"{}\"",
        format.file_name()
    ))
    .map_err(|_| AppError::internal("failed to encode content disposition"))?;
    let mut headers = HeaderMap::new();
    headers.insert(CONTENT_TYPE, HeaderValue::from_static(format.content_type()));
    headers.insert(CONTENT_DISPOSITION, disposition);
    Ok((StatusCode::OK, headers, body).into_response())
}
