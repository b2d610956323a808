//! Plan synthesis.
//!
//! A plan is computed entirely in memory; callers persist it only after [`synthesize`] returns
//! `Ok`, so a failed synthesis never leaves a partial plan behind.

use chrono::Utc;
use common::api::{
    EdgeBinding, EdgeConfig, EdgePlan, EdgeRuntime, FullPlan, HostArchetype, Inbound, Plan, PlanMeta, Protocol,
    Routing, Settings, TlsMode,
};
use serde_json::Value;
use uuid::Uuid;

use crate::persistence::HostRecord;
use crate::registry::{PORT_FIELD, Registry, Template, is_plaintext_port};
use crate::resolver::{self, ResolveError, SecretSource};

pub const ROUTING_STRATEGY: &str = "unified_port";
/// Early-data budget advertised in every edge websocket path.
pub const EDGE_EARLY_DATA: &str = "2560";

const REALITY_REQUIRED: [&str; 3] = ["private_key", "public_key", "sni"];

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SynthesisError {
    #[error("no requested profile is compatible with {archetype} host {host_id}")]
    NoCompatibleTemplates {
        host_id: Uuid,
        archetype: HostArchetype,
    },
    #[error("reality inbound {tag} is missing {}", missing.join(", "))]
    RealityIncomplete { tag: String, missing: Vec<String> },
    #[error("profile {profile_id}: {source}")]
    ResolveProfile {
        profile_id: String,
        #[source]
        source: ResolveError,
    },
    #[error(transparent)]
    HostParams(#[from] ResolveError),
}

/// Templates the host can run, in the order given.
pub fn compatible_templates<'a>(
    registry: &Registry,
    host: &HostRecord,
    templates: &'a [Template],
) -> Vec<&'a Template> {
    templates
        .iter()
        .filter(|template| {
            registry.is_template_compatible(template, host.archetype, host.capabilities.as_ref())
        })
        .collect()
}

pub fn synthesize(
    registry: &Registry,
    host: &HostRecord,
    templates: &[Template],
    params: &Settings,
    version: u64,
    secrets: &dyn SecretSource,
) -> Result<Plan, SynthesisError> {
    let compatible = compatible_templates(registry, host, templates);
    if compatible.is_empty() {
        return Err(SynthesisError::NoCompatibleTemplates {
            host_id: host.id,
            archetype: host.archetype,
        });
    }
    let meta = PlanMeta {
        profile_count: compatible.len(),
        profile_ids: compatible.iter().map(|t| t.id.clone()).collect(),
    };

    match host.archetype {
        HostArchetype::Full => {
            synthesize_full(registry, host, &compatible, params, version, secrets, meta)
        }
        HostArchetype::Edge => {
            synthesize_edge(registry, host, &compatible, params, version, secrets, meta)
        }
    }
}

fn resolve_template(
    registry: &Registry,
    host: &HostRecord,
    template: &Template,
    params: &Settings,
    secrets: &dyn SecretSource,
) -> Result<Settings, SynthesisError> {
    resolver::resolve(registry, template, params, &host.resolve_context(), secrets)
        .map(|resolved| resolved.settings)
        .map_err(|source| SynthesisError::ResolveProfile {
            profile_id: template.id.clone(),
            source,
        })
}

fn synthesize_full(
    registry: &Registry,
    host: &HostRecord,
    templates: &[&Template],
    params: &Settings,
    version: u64,
    secrets: &dyn SecretSource,
    meta: PlanMeta,
) -> Result<Plan, SynthesisError> {
    let listen_port = resolver::primary_port(registry, HostArchetype::Full, params)?;

    let mut inbounds = Vec::with_capacity(templates.len());
    for template in templates {
        let settings = resolve_template(registry, host, template, params, secrets)?;
        let tag = format!("inbound-{}", template.id);
        if template.tls_mode == TlsMode::Reality {
            check_reality(&tag, &settings)?;
        }
        inbounds.push(Inbound {
            tag,
            profile_id: template.id.clone(),
            protocol: template.protocol,
            transport: template.transport,
            tls_mode: template.tls_mode,
            settings,
        });
    }

    Ok(Plan::Full(FullPlan {
        version,
        host_id: host.id,
        created_at: Utc::now(),
        inbounds,
        routing: Routing {
            strategy: ROUTING_STRATEGY.to_string(),
            listen_port,
        },
        meta,
    }))
}

fn check_reality(tag: &str, settings: &Settings) -> Result<(), SynthesisError> {
    let missing: Vec<String> = REALITY_REQUIRED
        .iter()
        .filter(|name| {
            settings
                .get(**name)
                .and_then(Value::as_str)
                .is_none_or(|value| value.trim().is_empty())
        })
        .map(|name| name.to_string())
        .collect();
    if missing.is_empty() {
        Ok(())
    } else {
        Err(SynthesisError::RealityIncomplete {
            tag: tag.to_string(),
            missing,
        })
    }
}

fn synthesize_edge(
    registry: &Registry,
    host: &HostRecord,
    templates: &[&Template],
    params: &Settings,
    version: u64,
    secrets: &dyn SecretSource,
    meta: PlanMeta,
) -> Result<Plan, SynthesisError> {
    let port = resolver::primary_port(registry, HostArchetype::Edge, params)?;
    let is_https = !is_plaintext_port(port);
    let tls_mode = if is_https { TlsMode::Tls } else { TlsMode::None };

    let archetype_fields = resolver::resolve_archetype_fields(registry, HostArchetype::Edge, params)?;
    let proxyip = archetype_fields
        .get("proxyip")
        .and_then(Value::as_str)
        .map(str::trim)
        .unwrap_or_default()
        .to_string();
    let nat64 = archetype_fields
        .get("nat64")
        .and_then(Value::as_bool)
        .unwrap_or(false);

    let mut configs = Vec::with_capacity(templates.len());
    for template in templates {
        let mut settings = resolve_template(registry, host, template, params, secrets)?;
        settings.insert(PORT_FIELD.to_string(), Value::from(port));
        let base = settings.get("path").and_then(Value::as_str).unwrap_or("/");
        let path = edge_path(base, template.protocol, &proxyip, nat64);
        settings.insert("path".to_string(), Value::String(path));

        configs.push(EdgeConfig {
            profile_id: template.id.clone(),
            protocol: template.protocol,
            transport: template.transport,
            tls_mode,
            settings,
        });
    }

    Ok(Plan::Edge(EdgePlan {
        version,
        host_id: host.id,
        created_at: Utc::now(),
        edge: EdgeBinding {
            port,
            is_https,
            proxyip,
            nat64,
        },
        runtime: EdgeRuntime {
            configs,
            listen_port: port,
        },
        meta,
    }))
}

/// Websocket path understood by the edge runtime: the configured base plus the routing query.
pub fn edge_path(base: &str, protocol: Protocol, proxyip: &str, nat64: bool) -> String {
    let base = base.split('?').next().unwrap_or_default().trim();
    let base = if base.is_empty() { "/" } else { base };

    let mut query = url::form_urlencoded::Serializer::new(String::new());
    query.append_pair("ed", EDGE_EARLY_DATA);
    query.append_pair("PROT_TYPE", protocol.as_str());
    if !proxyip.is_empty() {
        query.append_pair("PADDR", proxyip);
    }
    if nat64 {
        query.append_pair("P64", "true");
    }
    format!("{base}?{}", query.finish())
}
