//! Client export rendering.
//!
//! A plan is first flattened into [`ExportRecord`]s; each encoder consumes only those records and
//! never reads plan fields directly.

use std::collections::{BTreeSet, HashSet};

use common::api::{ExportFormat, Plan, Protocol, Settings, TlsMode, Transport};
use serde_json::Value;

use crate::persistence::HostRecord;
use crate::registry::{PORT_FIELD, is_plaintext_port};

pub mod clash;
pub mod singbox;
pub mod v2ray;

/// Name of the selector group every encoder emits.
pub const GROUP_NAME: &str = "EdgeFleet";
const FALLBACK_ADDRESS: &str = "127.0.0.1";

/// One client-visible listener, with server-side fields removed and TLS reclassified by port.
#[derive(Debug, Clone, PartialEq)]
pub struct ExportRecord {
    pub name: String,
    pub profile_id: String,
    pub protocol: Protocol,
    pub transport: Transport,
    pub tls_mode: TlsMode,
    pub address: String,
    pub port: u16,
    pub settings: Settings,
}

impl ExportRecord {
    /// Non-empty string setting.
    pub fn text(&self, key: &str) -> Option<&str> {
        self.settings
            .get(key)
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|value| !value.is_empty())
    }

    pub fn number(&self, key: &str) -> Option<i64> {
        match self.settings.get(key)? {
            Value::Number(n) => n.as_i64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    pub fn flag(&self, key: &str) -> bool {
        match self.settings.get(key) {
            Some(Value::Bool(b)) => *b,
            Some(Value::String(s)) => s.trim().eq_ignore_ascii_case("true"),
            _ => false,
        }
    }

    /// List setting; accepts an array or a comma-separated string.
    pub fn list(&self, key: &str) -> Vec<String> {
        match self.settings.get(key) {
            Some(Value::Array(items)) => items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect(),
            Some(Value::String(s)) => s
                .split(',')
                .map(str::trim)
                .filter(|item| !item.is_empty())
                .map(str::to_string)
                .collect(),
            _ => Vec::new(),
        }
    }

    /// Host header for HTTP-based transports, falling back to the SNI and the address.
    pub fn host_header(&self) -> &str {
        self.text("host")
            .or_else(|| self.text("sni"))
            .unwrap_or(&self.address)
    }

    pub fn server_name(&self) -> &str {
        self.text("sni")
            .or_else(|| self.text("host"))
            .unwrap_or(&self.address)
    }

    pub fn path(&self) -> &str {
        self.text("path").unwrap_or("/")
    }
}

struct Listener<'a> {
    profile_id: &'a str,
    protocol: Protocol,
    transport: Transport,
    tls_mode: TlsMode,
    settings: &'a Settings,
}

fn listeners(plan: &Plan) -> Vec<Listener<'_>> {
    match plan {
        Plan::Full(full) => full
            .inbounds
            .iter()
            .map(|inbound| Listener {
                profile_id: &inbound.profile_id,
                protocol: inbound.protocol,
                transport: inbound.transport,
                tls_mode: inbound.tls_mode,
                settings: &inbound.settings,
            })
            .collect(),
        Plan::Edge(edge) => edge
            .runtime
            .configs
            .iter()
            .map(|config| Listener {
                profile_id: &config.profile_id,
                protocol: config.protocol,
                transport: config.transport,
                tls_mode: config.tls_mode,
                settings: &config.settings,
            })
            .collect(),
    }
}

fn first_non_empty<'a>(candidates: impl IntoIterator<Item = Option<&'a str>>) -> Option<&'a str> {
    candidates
        .into_iter()
        .flatten()
        .map(str::trim)
        .find(|value| !value.is_empty())
}

/// Flattens a plan into export records.
///
/// `visible_profiles` filters by profile id when non-empty. `server_side` names settings that
/// must not reach a client.
pub fn collect_records(
    host: &HostRecord,
    plan: &Plan,
    visible_profiles: &[String],
    server_side: &BTreeSet<String>,
) -> Vec<ExportRecord> {
    let primary_port = plan.primary_port();
    let mut records = Vec::new();

    for listener in listeners(plan) {
        if !visible_profiles.is_empty()
            && !visible_profiles.iter().any(|id| id == listener.profile_id)
        {
            continue;
        }

        let address = first_non_empty([
            listener.settings.get("entry_domain").and_then(Value::as_str),
            host.entry_domain.as_deref(),
            host.entry_domain_direct.as_deref(),
            host.entry_ip.as_deref(),
        ])
        .map(|raw| crate::resolver::clean_domain(raw).unwrap_or_else(|| raw.to_string()))
        .unwrap_or_else(|| FALLBACK_ADDRESS.to_string());

        let port = listener
            .settings
            .get(PORT_FIELD)
            .and_then(|value| match value {
                Value::Number(n) => n.as_u64(),
                Value::String(s) => s.trim().parse().ok(),
                _ => None,
            })
            .and_then(|port| u16::try_from(port).ok())
            .filter(|port| *port > 0)
            .unwrap_or(primary_port);

        // QUIC cannot run without TLS, so Hysteria2 keeps it on any port.
        let tls_mode = if listener.protocol == Protocol::Hysteria2 {
            TlsMode::Tls
        } else if is_plaintext_port(port) {
            TlsMode::None
        } else {
            listener.tls_mode
        };

        let settings = listener
            .settings
            .iter()
            .filter(|(key, _)| !server_side.contains(key.as_str()))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();

        records.push(ExportRecord {
            name: format!("{}-{}", host.name, listener.protocol),
            profile_id: listener.profile_id.to_string(),
            protocol: listener.protocol,
            transport: listener.transport,
            tls_mode,
            address,
            port,
            settings,
        });
    }
    records
}

/// Suffixes repeated names so selector groups never reference an ambiguous entry.
///
/// A generated name never takes one that some record already carries.
pub fn dedupe_names(records: &mut [ExportRecord]) {
    let given: HashSet<String> = records.iter().map(|record| record.name.clone()).collect();
    let mut used: HashSet<String> = HashSet::with_capacity(records.len());
    for record in records.iter_mut() {
        if used.insert(record.name.clone()) {
            continue;
        }
        let mut suffix = 2;
        let name = loop {
            let candidate = format!("{}-{suffix}", record.name);
            if !given.contains(&candidate) && !used.contains(&candidate) {
                break candidate;
            }
            suffix += 1;
        };
        used.insert(name.clone());
        record.name = name;
    }
}

pub fn render(format: ExportFormat, records: &[ExportRecord]) -> crate::Result<String> {
    match format {
        ExportFormat::V2ray => Ok(v2ray::encode(records)),
        ExportFormat::Clash => clash::encode(records),
        ExportFormat::Singbox => singbox::encode(records),
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;
    use serde_json::json;

    pub fn record(protocol: Protocol, transport: Transport, tls_mode: TlsMode, settings: Value) -> ExportRecord {
        let settings = match settings {
            Value::Object(map) => map,
            _ => Settings::new(),
        };
        ExportRecord {
            name: format!("node-{protocol}"),
            profile_id: format!("{protocol}-{transport}-{tls_mode}"),
            protocol,
            transport,
            tls_mode,
            address: "edge.example.com".into(),
            port: 443,
            settings,
        }
    }

    pub fn vless_ws_tls() -> ExportRecord {
        record(
            Protocol::Vless,
            Transport::Ws,
            TlsMode::Tls,
            json!({
                "uuid": "11111111-2222-3333-4444-555555555555",
                "path": "/?ed=2560",
                "host": "edge.example.com",
                "sni": "edge.example.com",
                "fingerprint": "chrome",
                "alpn": ["h2", "http/1.1"],
            }),
        )
    }
}
