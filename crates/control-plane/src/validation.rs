use std::collections::BTreeSet;
use std::str::FromStr;

use common::api::{HostArchetype, Protocol, TlsMode, Transport};

use crate::config::LimitsConfig;
use crate::error::{ApiResult, AppError};
use crate::registry::Registry;

pub fn validate_required_str(field: &str, value: &str, max_len: usize) -> ApiResult<()> {
    validate_opt_str(field, Some(value), max_len)
}

pub fn validate_opt_str(field: &str, value: Option<&str>, max_len: usize) -> ApiResult<()> {
    if let Some(val) = value {
        if val.trim().is_empty() {
            return Err(AppError::validation(format!("{field} cannot be empty")));
        }
        if val.len() > max_len {
            return Err(AppError::validation(format!("{field} too long")));
        }
    }
    Ok(())
}

/// Trims the value; blank input clears it.
pub fn normalize_opt(
    field: &str,
    value: Option<String>,
    max_len: usize,
) -> ApiResult<Option<String>> {
    let value = value
        .map(|val| val.trim().to_string())
        .filter(|val| !val.is_empty());
    validate_opt_str(field, value.as_deref(), max_len)?;
    Ok(value)
}

pub fn normalize_name(field: &str, value: &str, limits: &LimitsConfig) -> ApiResult<String> {
    let trimmed = value.trim();
    validate_required_str(field, trimmed, limits.max_field_len)?;
    Ok(trimmed.to_string())
}

/// Trimmed, deduplicated tags in first-seen order.
pub fn normalize_tags(tags: Vec<String>, limits: &LimitsConfig) -> ApiResult<Vec<String>> {
    let mut seen = BTreeSet::new();
    let mut normalized = Vec::with_capacity(tags.len());
    for tag in tags {
        let tag = tag.trim().to_string();
        validate_required_str("tag", &tag, limits.max_field_len)?;
        if seen.insert(tag.clone()) {
            normalized.push(tag);
        }
    }
    Ok(normalized)
}

/// Profile ids are lowercase ASCII letters, digits, `-` and `_`.
pub fn validate_profile_id(id: &str, limits: &LimitsConfig) -> ApiResult<()> {
    validate_required_str("id", id, limits.max_field_len)?;
    let valid = id
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '_');
    if !valid {
        return Err(AppError::validation(
            "id may only contain lowercase letters, digits, '-' and '_'",
        ));
    }
    Ok(())
}

fn parse_wire<T: FromStr>(value: &str) -> ApiResult<T>
where
    T::Err: std::fmt::Display,
{
    T::from_str(value).map_err(|err| AppError::validation(err.to_string()))
}

pub fn parse_archetype(value: &str) -> ApiResult<HostArchetype> {
    parse_wire(value)
}

pub fn parse_archetypes(values: &[String]) -> ApiResult<Vec<HostArchetype>> {
    let mut archetypes: Vec<HostArchetype> = values
        .iter()
        .map(|value| parse_archetype(value))
        .collect::<ApiResult<_>>()?;
    archetypes.sort();
    archetypes.dedup();
    Ok(archetypes)
}

/// Parses the triple and rejects combinations the registry does not allow.
pub fn parse_triple(
    registry: &Registry,
    protocol: &str,
    transport: &str,
    tls_mode: &str,
) -> ApiResult<(Protocol, Transport, TlsMode)> {
    let protocol: Protocol = parse_wire(protocol)?;
    let transport: Transport = parse_wire(transport)?;
    let tls_mode: TlsMode = parse_wire(tls_mode)?;
    validate_triple(registry, protocol, transport, tls_mode)?;
    Ok((protocol, transport, tls_mode))
}

pub fn validate_triple(
    registry: &Registry,
    protocol: Protocol,
    transport: Transport,
    tls_mode: TlsMode,
) -> ApiResult<()> {
    if !registry.is_valid_combination(protocol, transport, tls_mode) {
        return Err(AppError::validation(format!(
            "invalid combination: {protocol} does not support {transport}/{tls_mode}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limits() -> LimitsConfig {
        LimitsConfig {
            deploy_body_bytes: 0,
            report_body_bytes: 0,
            max_field_len: 16,
        }
    }

    #[test]
    fn normalize_opt_trims_and_clears_blank() {
        assert_eq!(
            normalize_opt("region", Some("  eu-1 ".into()), 16).unwrap(),
            Some("eu-1".to_string())
        );
        assert_eq!(normalize_opt("region", Some("   ".into()), 16).unwrap(), None);
        assert!(normalize_opt("region", Some("x".repeat(17)), 16).is_err());
    }

    #[test]
    fn tags_are_deduplicated_in_order() {
        let tags = normalize_tags(vec!["b".into(), " a ".into(), "b".into()], &limits()).unwrap();
        assert_eq!(tags, vec!["b".to_string(), "a".to_string()]);
        assert!(normalize_tags(vec![" ".into()], &limits()).is_err());
    }

    #[test]
    fn profile_ids_are_restricted() {
        assert!(validate_profile_id("my-ws_1", &limits()).is_ok());
        assert!(validate_profile_id("My-WS", &limits()).is_err());
        assert!(validate_profile_id("a b", &limits()).is_err());
        assert!(validate_profile_id("", &limits()).is_err());
    }

    #[test]
    fn parse_triple_rejects_unknown_and_invalid() {
        let registry = Registry::builtin();
        assert_eq!(
            parse_triple(&registry, "vless", "ws", "tls").unwrap(),
            (Protocol::Vless, Transport::Ws, TlsMode::Tls)
        );
        let unknown = parse_triple(&registry, "wireguard", "ws", "tls").unwrap_err();
        assert!(unknown.message.contains("wireguard"));
        let invalid = parse_triple(&registry, "trojan", "ws", "none").unwrap_err();
        assert!(invalid.message.contains("invalid combination"));
    }

    #[test]
    fn archetype_aliases_parse() {
        assert_eq!(
            parse_archetypes(&["cf_worker".into(), "vps".into(), "edge".into()]).unwrap(),
            vec![HostArchetype::Full, HostArchetype::Edge]
        );
        assert!(parse_archetype("router").is_err());
    }
}
