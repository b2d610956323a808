use chrono::Utc;
use common::api::{
    ProfileCreateRequest, ProfileDeleteResponse, ProfileDetail, ProfileUpdateRequest, ProfileView,
};
use tracing::info;

use crate::app_state::AppState;
use crate::error::{ApiResult, AppError};
use crate::persistence::profiles::{self, ProfileOverride};
use crate::registry::Template;
use crate::validation;

/// A template as currently effective, with its override flag.
pub struct LoadedTemplate {
    pub template: Template,
    pub has_override: bool,
}

pub async fn load_template(state: &AppState, id: &str) -> ApiResult<LoadedTemplate> {
    let kv = state.kv.as_ref();
    if let Some(builtin) = state.registry.builtin_template(id) {
        let patch = profiles::get_override(kv, id).await?;
        return Ok(match patch {
            Some(patch) => LoadedTemplate {
                template: patch.apply(builtin),
                has_override: true,
            },
            None => LoadedTemplate {
                template: builtin.clone(),
                has_override: false,
            },
        });
    }

    profiles::get_custom(kv, id)
        .await?
        .map(|template| LoadedTemplate {
            template,
            has_override: false,
        })
        .ok_or_else(|| AppError::profile_not_found(format!("profile {id} not found")))
}

/// Templates in request order; any unknown id fails the whole lookup.
pub async fn load_templates(state: &AppState, ids: &[String]) -> ApiResult<Vec<Template>> {
    let mut templates = Vec::with_capacity(ids.len());
    for id in ids {
        if templates.iter().any(|t: &Template| &t.id == id) {
            continue;
        }
        templates.push(load_template(state, id).await?.template);
    }
    Ok(templates)
}

pub async fn list_profiles(state: &AppState) -> ApiResult<Vec<ProfileView>> {
    let kv = state.kv.as_ref();
    let mut views = Vec::new();
    for builtin in state.registry.builtin_templates() {
        let view = match profiles::get_override(kv, &builtin.id).await? {
            Some(patch) => patch.apply(builtin).to_view(true),
            None => builtin.to_view(false),
        };
        views.push(view);
    }
    views.extend(
        profiles::list_customs(kv)
            .await?
            .iter()
            .map(|template| template.to_view(false)),
    );
    Ok(views)
}

pub async fn get_profile(state: &AppState, id: &str) -> ApiResult<ProfileDetail> {
    let loaded = load_template(state, id).await?;
    let (protocol, transport, tls_mode) = loaded.template.triple();
    Ok(ProfileDetail {
        profile: loaded.template.to_view(loaded.has_override),
        schema: state.registry.schema_for(protocol, transport, tls_mode),
    })
}

pub async fn create_profile(state: &AppState, req: ProfileCreateRequest) -> ApiResult<ProfileView> {
    let id = req.id.trim().to_string();
    validation::validate_profile_id(&id, &state.limits)?;
    let name = validation::normalize_name("name", &req.name, &state.limits)?;
    let (protocol, transport, tls_mode) =
        validation::parse_triple(&state.registry, &req.protocol, &req.transport, &req.tls_mode)?;
    if state.registry.builtin_template(&id).is_some() {
        return Err(AppError::validation(format!(
            "profile {id} is a built-in profile"
        )));
    }

    let archetypes = match &req.archetypes {
        Some(values) => validation::parse_archetypes(values)?,
        None => state
            .registry
            .default_whitelist(protocol, transport, tls_mode),
    };

    let now = Utc::now();
    let template = Template {
        id: id.clone(),
        name,
        protocol,
        transport,
        tls_mode,
        defaults: req.defaults,
        archetypes,
        description: req.description.unwrap_or_default(),
        builtin: false,
        created_at: Some(now),
        updated_at: Some(now),
    };

    if !profiles::create_custom(state.kv.as_ref(), &template).await? {
        return Err(AppError::validation(format!("profile {id} already exists")));
    }
    info!(profile_id = %id, %protocol, %transport, %tls_mode, "profile created");
    Ok(template.to_view(false))
}

pub async fn update_profile(
    state: &AppState,
    id: &str,
    req: ProfileUpdateRequest,
) -> ApiResult<ProfileView> {
    let kv = state.kv.as_ref();
    let now = Utc::now();

    if let Some(builtin) = state.registry.builtin_template(id) {
        if req.name.is_some()
            || req.protocol.is_some()
            || req.transport.is_some()
            || req.tls_mode.is_some()
            || req.archetypes.is_some()
        {
            return Err(AppError::immutable(
                "built-in profiles only accept defaults and description changes",
            ));
        }
        let mut patch = profiles::get_override(kv, id)
            .await?
            .unwrap_or_else(|| ProfileOverride {
                defaults: Default::default(),
                description: None,
                updated_at: now,
            });
        if let Some(defaults) = req.defaults {
            patch.defaults.extend(defaults);
        }
        if let Some(description) = req.description {
            patch.description = Some(description);
        }
        patch.updated_at = now;
        profiles::put_override(kv, id, &patch).await?;
        info!(profile_id = %id, "built-in profile override saved");
        return Ok(patch.apply(builtin).to_view(true));
    }

    let mut template = profiles::get_custom(kv, id)
        .await?
        .ok_or_else(|| AppError::profile_not_found(format!("profile {id} not found")))?;

    if let Some(name) = &req.name {
        template.name = validation::normalize_name("name", name, &state.limits)?;
    }
    let protocol = req.protocol.as_deref().unwrap_or(template.protocol.as_str());
    let transport = req
        .transport
        .as_deref()
        .unwrap_or(template.transport.as_str());
    let tls_mode = req.tls_mode.as_deref().unwrap_or(template.tls_mode.as_str());
    let (protocol, transport, tls_mode) =
        validation::parse_triple(&state.registry, protocol, transport, tls_mode)?;
    template.protocol = protocol;
    template.transport = transport;
    template.tls_mode = tls_mode;
    if let Some(defaults) = req.defaults {
        template.defaults = defaults;
    }
    if let Some(values) = &req.archetypes {
        template.archetypes = validation::parse_archetypes(values)?;
    }
    if let Some(description) = req.description {
        template.description = description;
    }
    template.updated_at = Some(now);

    profiles::save_custom(kv, &template).await?;
    info!(profile_id = %id, "profile updated");
    Ok(template.to_view(false))
}

pub async fn delete_profile(state: &AppState, id: &str) -> ApiResult<ProfileDeleteResponse> {
    let kv = state.kv.as_ref();
    if state.registry.builtin_template(id).is_some() {
        profiles::delete_override(kv, id).await?;
        info!(profile_id = %id, "built-in profile override reset");
        return Ok(ProfileDeleteResponse {
            id: id.to_string(),
            action: "reset".into(),
        });
    }

    if !profiles::delete_custom(kv, id).await? {
        return Err(AppError::profile_not_found(format!("profile {id} not found")));
    }
    info!(profile_id = %id, "profile deleted");
    Ok(ProfileDeleteResponse {
        id: id.to_string(),
        action: "deleted".into(),
    })
}
