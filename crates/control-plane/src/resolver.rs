//! Parameter resolution: turns a template plus operator parameters into concrete settings.
//!
//! Every schema field is filled by the first source that yields a value:
//! explicit parameter, host entry address, generated secret, template default, schema default.

use common::api::{FieldDescriptor, FieldKind, FieldVisibility, HostArchetype, ResolutionHint, Settings};
use serde_json::{Number, Value};
use uuid::Uuid;

use crate::registry::{PORT_FIELD, Registry, SERVER_SIDE_PASSTHROUGH, Template, is_cdn_port};

/// Length of generated passwords.
pub const SECRET_LEN: usize = 24;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ResolveError {
    #[error("invalid port for {field}: {value}")]
    InvalidPort { field: String, value: String },
    #[error("port {port} is not a CDN port")]
    NonCdnPort { port: u16 },
    #[error("invalid value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },
    #[error("missing required field {field}")]
    MissingRequired { field: String },
}

/// Source of fresh identifiers and passwords.
pub trait SecretSource: Send + Sync {
    fn uuid(&self) -> String;
    fn secret(&self) -> String;
}

/// Fresh randomness for every call.
#[derive(Debug, Clone, Copy, Default)]
pub struct RandomSecrets;

impl SecretSource for RandomSecrets {
    fn uuid(&self) -> String {
        Uuid::new_v4().to_string()
    }

    fn secret(&self) -> String {
        crate::tokens::random_alphanumeric(SECRET_LEN)
    }
}

/// Host attributes the resolver may read.
#[derive(Debug, Clone, Copy)]
pub struct ResolveContext<'a> {
    pub archetype: HostArchetype,
    pub entry_domain: Option<&'a str>,
    pub entry_domain_direct: Option<&'a str>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Resolved {
    pub settings: Settings,
    pub port: u16,
}

pub fn resolve(
    registry: &Registry,
    template: &Template,
    params: &Settings,
    ctx: &ResolveContext<'_>,
    secrets: &dyn SecretSource,
) -> Result<Resolved, ResolveError> {
    let (protocol, transport, tls_mode) = template.triple();
    let schema = registry.schema_for(protocol, transport, tls_mode);
    let keep_server_side = ctx.archetype == HostArchetype::Full;
    let host_source = host_source(registry, template, ctx);

    let mut settings = Settings::new();
    for field in schema.iter().filter(|field| field.name != PORT_FIELD) {
        let server_side = field.visibility == FieldVisibility::ServerSide;
        if server_side && !keep_server_side {
            continue;
        }

        let raw = explicit_value(params, field)
            .cloned()
            .or_else(|| fallback_value(field, template, params, host_source.as_deref(), secrets));
        let Some(raw) = raw else {
            if field.required {
                return Err(ResolveError::MissingRequired {
                    field: field.name.clone(),
                });
            }
            continue;
        };

        let value = coerce(field, raw)?;
        if field.required && is_blank(&value) {
            return Err(ResolveError::MissingRequired {
                field: field.name.clone(),
            });
        }
        if server_side {
            for alias in &field.aliases {
                settings.insert(alias.clone(), value.clone());
            }
        }
        settings.insert(field.name.clone(), value);
    }

    let port = template_port(registry, template, params, ctx.archetype)?;
    settings.insert(PORT_FIELD.to_string(), Value::from(port));

    if keep_server_side {
        for name in SERVER_SIDE_PASSTHROUGH {
            if let Some(value) = params.get(name)
                && !is_blank(value)
            {
                settings.insert(name.to_string(), value.clone());
            }
        }
    }

    Ok(Resolved { settings, port })
}

/// Host-level primary port: archetype port parameter, then `port`, then the archetype default.
pub fn primary_port(
    registry: &Registry,
    archetype: HostArchetype,
    params: &Settings,
) -> Result<u16, ResolveError> {
    let param = Registry::port_param(archetype);
    let default = registry
        .archetype_field(archetype, param)
        .and_then(|field| field.default.as_ref());

    let (field, raw) = [(param, params.get(param)), (PORT_FIELD, params.get(PORT_FIELD))]
        .into_iter()
        .find_map(|(name, value)| present(value).map(|v| (name, v)))
        .or_else(|| default.map(|v| (param, v)))
        .ok_or_else(|| ResolveError::MissingRequired {
            field: param.to_string(),
        })?;

    checked_port(archetype, field, raw)
}

/// Archetype-specific fields (for example `proxyip` and `nat64` on edge hosts).
pub fn resolve_archetype_fields(
    registry: &Registry,
    archetype: HostArchetype,
    params: &Settings,
) -> Result<Settings, ResolveError> {
    let mut settings = Settings::new();
    for field in registry.archetype_fields(archetype) {
        let raw = explicit_value(params, field).or(field.default.as_ref());
        if let Some(raw) = raw {
            settings.insert(field.name.clone(), coerce(field, raw.clone())?);
        }
    }
    Ok(settings)
}

/// Strips an http(s) scheme and trailing slashes; empty input yields `None`.
pub fn clean_domain(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    let lower = trimmed.to_ascii_lowercase();
    let without_scheme = if lower.starts_with("https://") {
        &trimmed[8..]
    } else if lower.starts_with("http://") {
        &trimmed[7..]
    } else {
        trimmed
    };
    let cleaned = without_scheme.trim_end_matches('/');
    if cleaned.is_empty() {
        None
    } else {
        Some(cleaned.to_string())
    }
}

fn host_source(registry: &Registry, template: &Template, ctx: &ResolveContext<'_>) -> Option<String> {
    let cdn = ctx.entry_domain.and_then(clean_domain);
    if registry.is_cdn_compatible(template) {
        return cdn;
    }
    ctx.entry_domain_direct.and_then(clean_domain).or(cdn)
}

fn template_port(
    registry: &Registry,
    template: &Template,
    params: &Settings,
    archetype: HostArchetype,
) -> Result<u16, ResolveError> {
    let param = Registry::port_param(archetype);
    let explicit = [
        (param, params.get(param)),
        (PORT_FIELD, params.get(PORT_FIELD)),
        (PORT_FIELD, template.defaults.get(PORT_FIELD)),
    ]
    .into_iter()
    .find_map(|(name, value)| present(value).map(|v| (name, v)));

    match explicit {
        Some((field, raw)) => checked_port(archetype, field, raw),
        None => primary_port(registry, archetype, params),
    }
}

fn checked_port(archetype: HostArchetype, field: &str, raw: &Value) -> Result<u16, ResolveError> {
    let port = parse_port(field, raw)?;
    if archetype == HostArchetype::Edge && !is_cdn_port(port) {
        return Err(ResolveError::NonCdnPort { port });
    }
    Ok(port)
}

fn parse_port(field: &str, raw: &Value) -> Result<u16, ResolveError> {
    let parsed = match raw {
        Value::Number(n) => n.as_u64(),
        Value::String(s) => s.trim().parse::<u64>().ok(),
        _ => None,
    };
    parsed
        .filter(|port| (1..=65535).contains(port))
        .and_then(|port| u16::try_from(port).ok())
        .ok_or_else(|| ResolveError::InvalidPort {
            field: field.to_string(),
            value: display_raw(raw),
        })
}

fn present(value: Option<&Value>) -> Option<&Value> {
    value.filter(|v| !v.is_null())
}

fn explicit_value<'a>(params: &'a Settings, field: &FieldDescriptor) -> Option<&'a Value> {
    let generated = field.hint != ResolutionHint::None;
    std::iter::once(&field.name)
        .chain(field.aliases.iter())
        .filter_map(|name| present(params.get(name)))
        // An empty string does not pin a generated or host-derived value.
        .find(|value| !(generated && is_blank(value)))
}

fn fallback_value(
    field: &FieldDescriptor,
    template: &Template,
    params: &Settings,
    host_source: Option<&str>,
    secrets: &dyn SecretSource,
) -> Option<Value> {
    match field.hint {
        ResolutionHint::HostDerived => {
            if let Some(host) = host_source {
                return Some(Value::String(host.to_string()));
            }
        }
        ResolutionHint::AutoUuid => {
            return Some(Value::String(
                shared_param(params, "uuid").unwrap_or_else(|| secrets.uuid()),
            ));
        }
        ResolutionHint::AutoSecret => {
            return Some(Value::String(
                shared_param(params, "password").unwrap_or_else(|| secrets.secret()),
            ));
        }
        ResolutionHint::None => {}
    }

    present(template.defaults.get(&field.name))
        .or(field.default.as_ref())
        .cloned()
}

fn shared_param(params: &Settings, name: &str) -> Option<String> {
    match params.get(name) {
        Some(Value::String(s)) if !s.trim().is_empty() => Some(s.trim().to_string()),
        _ => None,
    }
}

fn is_blank(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.trim().is_empty(),
        _ => false,
    }
}

fn display_raw(raw: &Value) -> String {
    match raw {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn invalid(field: &FieldDescriptor, reason: impl Into<String>) -> ResolveError {
    ResolveError::InvalidValue {
        field: field.name.clone(),
        reason: reason.into(),
    }
}

fn coerce(field: &FieldDescriptor, raw: Value) -> Result<Value, ResolveError> {
    match field.kind {
        FieldKind::String => match raw {
            Value::String(_) => Ok(raw),
            Value::Number(n) => Ok(Value::String(n.to_string())),
            Value::Bool(b) => Ok(Value::String(b.to_string())),
            _ => Err(invalid(field, "expected a string")),
        },
        FieldKind::Number => match raw {
            Value::Number(_) => Ok(raw),
            Value::String(ref s) => parse_number(s.trim())
                .map(Value::Number)
                .ok_or_else(|| invalid(field, format!("'{s}' is not a number"))),
            _ => Err(invalid(field, "expected a number")),
        },
        FieldKind::Boolean => match raw {
            Value::Bool(_) => Ok(raw),
            Value::String(ref s) if s.trim().eq_ignore_ascii_case("true") => Ok(Value::Bool(true)),
            Value::String(ref s) if s.trim().eq_ignore_ascii_case("false") => {
                Ok(Value::Bool(false))
            }
            _ => Err(invalid(field, "expected true or false")),
        },
        FieldKind::Port => {
            let port = parse_port(&field.name, &raw)?;
            if !field.options.is_empty() && !field.options.contains(&port.to_string()) {
                return Err(invalid(field, format!("port {port} is not allowed")));
            }
            Ok(Value::from(port))
        }
        FieldKind::Enum => {
            let value = match raw {
                Value::String(s) => s,
                Value::Number(n) => n.to_string(),
                _ => return Err(invalid(field, "expected a string")),
            };
            if !field.options.is_empty() && !field.options.contains(&value) {
                return Err(invalid(
                    field,
                    format!("'{value}' must be one of [{}]", field.options.join(", ")),
                ));
            }
            Ok(Value::String(value))
        }
        FieldKind::MultiEnum => {
            let items: Vec<String> = match raw {
                Value::String(s) => s
                    .split(',')
                    .map(str::trim)
                    .filter(|item| !item.is_empty())
                    .map(str::to_string)
                    .collect(),
                Value::Array(values) => values
                    .into_iter()
                    .map(|item| match item {
                        Value::String(s) => Ok(s),
                        _ => Err(invalid(field, "expected a list of strings")),
                    })
                    .collect::<Result<_, _>>()?,
                _ => return Err(invalid(field, "expected a list")),
            };
            if let Some(unknown) = items
                .iter()
                .find(|item| !field.options.is_empty() && !field.options.contains(item))
            {
                return Err(invalid(field, format!("'{unknown}' is not a known option")));
            }
            Ok(Value::Array(items.into_iter().map(Value::String).collect()))
        }
    }
}

fn parse_number(raw: &str) -> Option<Number> {
    if let Ok(int) = raw.parse::<i64>() {
        return Some(Number::from(int));
    }
    raw.parse::<f64>().ok().and_then(Number::from_f64)
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use common::api::{Protocol, TlsMode, Transport};
    use serde_json::json;

    use super::*;

    #[derive(Default)]
    struct CountingSecrets {
        calls: AtomicUsize,
    }

    impl SecretSource for CountingSecrets {
        fn uuid(&self) -> String {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            format!("00000000-0000-4000-8000-{n:012}")
        }

        fn secret(&self) -> String {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            format!("secret-{n:017}")
        }
    }

    fn params(value: Value) -> Settings {
        match value {
            Value::Object(map) => map,
            _ => Settings::new(),
        }
    }

    fn full_ctx() -> ResolveContext<'static> {
        ResolveContext {
            archetype: HostArchetype::Full,
            entry_domain: Some("https://cdn.example.com/"),
            entry_domain_direct: Some("direct.example.com"),
        }
    }

    fn edge_ctx() -> ResolveContext<'static> {
        ResolveContext {
            archetype: HostArchetype::Edge,
            entry_domain: Some("edge.example.com"),
            entry_domain_direct: None,
        }
    }

    fn builtin(registry: &Registry, id: &str) -> Template {
        registry.builtin_template(id).unwrap().clone()
    }

    #[test]
    fn explicit_params_win_over_every_other_source() {
        let registry = Registry::builtin();
        let template = builtin(&registry, "vless-ws-tls");
        let resolved = resolve(
            &registry,
            &template,
            &params(json!({"uuid": "fixed", "host": "override.example.com", "path": "/custom"})),
            &full_ctx(),
            &CountingSecrets::default(),
        )
        .unwrap();

        assert_eq!(resolved.settings["uuid"], "fixed");
        assert_eq!(resolved.settings["host"], "override.example.com");
        assert_eq!(resolved.settings["path"], "/custom");
        assert_eq!(resolved.settings["fingerprint"], "randomized");
        assert_eq!(resolved.settings["max_early_data"], 2560);
        assert_eq!(resolved.port, 443);
        assert_eq!(resolved.settings["port"], 443);
    }

    #[test]
    fn cdn_templates_use_cdn_entry_and_others_prefer_direct() {
        let registry = Registry::builtin();
        let secrets = CountingSecrets::default();

        let cdn = resolve(
            &registry,
            &builtin(&registry, "trojan-ws-tls"),
            &Settings::new(),
            &full_ctx(),
            &secrets,
        )
        .unwrap();
        assert_eq!(cdn.settings["host"], "cdn.example.com");
        assert_eq!(cdn.settings["sni"], "cdn.example.com");

        let direct = resolve(
            &registry,
            &builtin(&registry, "vless-grpc-tls"),
            &Settings::new(),
            &full_ctx(),
            &secrets,
        )
        .unwrap();
        assert_eq!(direct.settings["sni"], "direct.example.com");

        let fallback_ctx = ResolveContext {
            entry_domain_direct: None,
            ..full_ctx()
        };
        let fallback = resolve(
            &registry,
            &builtin(&registry, "vless-grpc-tls"),
            &Settings::new(),
            &fallback_ctx,
            &secrets,
        )
        .unwrap();
        assert_eq!(fallback.settings["sni"], "cdn.example.com");
    }

    #[test]
    fn shared_uuid_and_password_override_generation() {
        let registry = Registry::builtin();
        let secrets = CountingSecrets::default();
        let shared = params(json!({"uuid": "shared-uuid", "password": "shared-pass"}));

        let vmess = resolve(&registry, &builtin(&registry, "vmess-ws-tls"), &shared, &full_ctx(), &secrets).unwrap();
        let ss = resolve(&registry, &builtin(&registry, "ss-2022"), &shared, &full_ctx(), &secrets).unwrap();
        assert_eq!(vmess.settings["uuid"], "shared-uuid");
        assert_eq!(ss.settings["password"], "shared-pass");
        assert_eq!(secrets.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn secrets_are_generated_fresh_per_resolution() {
        let registry = Registry::builtin();
        let template = builtin(&registry, "trojan-tcp-tls");
        let first = resolve(&registry, &template, &Settings::new(), &full_ctx(), &RandomSecrets).unwrap();
        let second = resolve(&registry, &template, &Settings::new(), &full_ctx(), &RandomSecrets).unwrap();

        let password = first.settings["password"].as_str().unwrap();
        assert_eq!(password.len(), SECRET_LEN);
        assert_ne!(first.settings["password"], second.settings["password"]);
    }

    #[test]
    fn string_inputs_are_coerced_to_descriptor_kinds() {
        let registry = Registry::builtin();
        let resolved = resolve(
            &registry,
            &builtin(&registry, "vless-ws-tls"),
            &params(json!({
                "max_early_data": "4096",
                "allow_insecure": "true",
                "alpn": "h2",
                "listen_port": "8443",
            })),
            &full_ctx(),
            &CountingSecrets::default(),
        )
        .unwrap();

        assert_eq!(resolved.settings["max_early_data"], 4096);
        assert_eq!(resolved.settings["allow_insecure"], true);
        assert_eq!(resolved.settings["alpn"], json!(["h2"]));
        assert_eq!(resolved.port, 8443);
    }

    #[test]
    fn enum_values_outside_options_are_rejected() {
        let registry = Registry::builtin();
        let err = resolve(
            &registry,
            &builtin(&registry, "vless-ws-tls"),
            &params(json!({"fingerprint": "netscape"})),
            &full_ctx(),
            &CountingSecrets::default(),
        )
        .unwrap_err();
        assert!(matches!(err, ResolveError::InvalidValue { ref field, .. } if field == "fingerprint"));
    }

    #[test]
    fn invalid_ports_fail_loudly() {
        let registry = Registry::builtin();
        let template = builtin(&registry, "trojan-tcp-tls");
        for bad in [json!(0), json!(70000), json!("http"), json!(-1)] {
            let err = resolve(
                &registry,
                &template,
                &params(json!({"listen_port": bad})),
                &full_ctx(),
                &CountingSecrets::default(),
            )
            .unwrap_err();
            assert!(matches!(err, ResolveError::InvalidPort { .. }), "{err}");
        }
    }

    #[test]
    fn edge_ports_must_be_cdn_ports() {
        let registry = Registry::builtin();
        let template = builtin(&registry, "vless-ws-tls");
        let err = resolve(
            &registry,
            &template,
            &params(json!({"cf_port": 9000})),
            &edge_ctx(),
            &CountingSecrets::default(),
        )
        .unwrap_err();
        assert_eq!(err, ResolveError::NonCdnPort { port: 9000 });

        let ok = resolve(
            &registry,
            &template,
            &params(json!({"cf_port": 8080})),
            &edge_ctx(),
            &CountingSecrets::default(),
        )
        .unwrap();
        assert_eq!(ok.port, 8080);
    }

    #[test]
    fn server_side_fields_stay_on_full_hosts_only() {
        let registry = Registry::builtin();
        let mut template = builtin(&registry, "vless-ws-tls");
        template.tls_mode = TlsMode::Reality;
        let input = params(json!({
            "private_key": "priv",
            "public_key": "pub",
            "tls_cert_file": "/etc/cert.pem",
        }));

        let full = resolve(&registry, &template, &input, &full_ctx(), &CountingSecrets::default()).unwrap();
        assert_eq!(full.settings["private_key"], "priv");
        assert_eq!(full.settings["reality_private_key"], "priv");
        assert_eq!(full.settings["tls_cert_file"], "/etc/cert.pem");

        let edge_template = builtin(&registry, "vless-ws-tls");
        let edge = resolve(&registry, &edge_template, &input, &edge_ctx(), &CountingSecrets::default()).unwrap();
        assert!(!edge.settings.contains_key("private_key"));
        assert!(!edge.settings.contains_key("tls_cert_file"));
    }

    #[test]
    fn alias_supplies_server_side_value() {
        let registry = Registry::builtin();
        let resolved = resolve(
            &registry,
            &builtin(&registry, "vless-reality-tcp"),
            &params(json!({"reality_private_key": "from-alias", "public_key": "pub"})),
            &full_ctx(),
            &CountingSecrets::default(),
        )
        .unwrap();
        assert_eq!(resolved.settings["private_key"], "from-alias");
        assert_eq!(resolved.settings["sni"], "www.microsoft.com");
    }

    #[test]
    fn resolution_is_idempotent_when_output_is_fed_back() {
        let registry = Registry::builtin();
        for template in registry.builtin_templates() {
            let ctx = if template.allows_archetype(HostArchetype::Full) {
                full_ctx()
            } else {
                edge_ctx()
            };
            let first = resolve(&registry, template, &Settings::new(), &ctx, &CountingSecrets::default())
                .unwrap();
            let second = resolve(&registry, template, &first.settings, &ctx, &CountingSecrets::default())
                .unwrap();
            assert_eq!(first, second, "{} is not idempotent", template.id);
        }
    }

    #[test]
    fn primary_port_uses_archetype_default_without_params() {
        let registry = Registry::builtin();
        assert_eq!(primary_port(&registry, HostArchetype::Full, &Settings::new()).unwrap(), 443);
        assert_eq!(
            primary_port(&registry, HostArchetype::Full, &params(json!({"port": 2443}))).unwrap(),
            2443
        );

        let mut stripped = registry.clone();
        stripped
            .archetypes
            .get_mut(&HostArchetype::Full)
            .unwrap()
            .fields
            .clear();
        let err = primary_port(&stripped, HostArchetype::Full, &Settings::new()).unwrap_err();
        assert!(matches!(err, ResolveError::MissingRequired { .. }));
    }

    #[test]
    fn archetype_fields_resolve_with_defaults() {
        let registry = Registry::builtin();
        let fields = resolve_archetype_fields(
            &registry,
            HostArchetype::Edge,
            &params(json!({"proxyip": "relay.example.com", "nat64": "true"})),
        )
        .unwrap();
        assert_eq!(fields["proxyip"], "relay.example.com");
        assert_eq!(fields["nat64"], true);
        assert_eq!(fields["cf_port"], 443);
    }

    #[test]
    fn clean_domain_strips_scheme_and_slashes() {
        assert_eq!(clean_domain("HTTPS://Example.com//").as_deref(), Some("Example.com"));
        assert_eq!(clean_domain("http://a.b/").as_deref(), Some("a.b"));
        assert_eq!(clean_domain(" plain.host "), Some("plain.host".to_string()));
        assert_eq!(clean_domain("https://"), None);
        assert_eq!(clean_domain(""), None);
    }

    #[test]
    fn hysteria2_schema_carries_obfs_fields() {
        let registry = Registry::builtin();
        let schema = registry.schema_for(Protocol::Hysteria2, Transport::Udp, TlsMode::Tls);
        assert!(schema.iter().any(|f| f.name == "obfs_type"));
    }
}
