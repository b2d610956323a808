use super::*;
use axum::routing::get;

pub fn router(state: AppState) -> Router<AppState> {
    Router::<AppState>::new()
        .route("/api/v1/registry", get(get_registry))
        .route_layer(middleware::from_fn_with_state(state, require_operator_auth))
}

#[utoipa::path(
    get,
    path = "/api/v1/registry",
    responses((status = 200, description = "Protocol, transport, TLS and archetype tables", body = api::RegistryView)),
    security(("operatorBearer" = [])),
    tag = "registry"
)]
pub(crate) async fn get_registry(State(state): State<AppState>) -> Json<api::RegistryView> {
    Json(state.registry.view())
}
