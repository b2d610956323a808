//! Capability registry: which protocol/transport/TLS triples exist, which host archetypes may run
//! them, and the field schema each triple resolves against.
//!
//! The registry is plain data built once at startup and shared behind an `Arc`. Tests build their
//! own instances by editing the public tables of [`Registry::builtin`].

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use common::api::{
    ArchetypeEntry, CapabilitySet, FieldDescriptor, FieldVisibility, HostArchetype, Protocol,
    ProtocolEntry, ProfileView, RegistryView, Settings, TlsEntry, TlsMode, Transport,
    TransportEntry,
};
use serde::{Deserialize, Serialize};

mod builtin;
pub mod schema;

pub use schema::PORT_FIELD;

/// CDN ports on which the edge terminates TLS.
pub const CDN_TLS_PORTS: [u16; 6] = [443, 8443, 2053, 2096, 2087, 2083];
/// CDN ports that only carry plaintext HTTP.
pub const CDN_PLAINTEXT_PORTS: [u16; 7] = [80, 8080, 8880, 2052, 2082, 2086, 2095];

/// Parameters kept verbatim in a full host's plan and never exported.
pub const SERVER_SIDE_PASSTHROUGH: [&str; 2] = ["tls_cert_file", "tls_key_file"];

pub fn is_plaintext_port(port: u16) -> bool {
    CDN_PLAINTEXT_PORTS.contains(&port)
}

pub fn is_cdn_port(port: u16) -> bool {
    CDN_TLS_PORTS.contains(&port) || CDN_PLAINTEXT_PORTS.contains(&port)
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProtocolSpec {
    pub transports: Vec<Transport>,
    pub tls_modes: Vec<TlsMode>,
    pub fields: Vec<FieldDescriptor>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ArchetypeSpec {
    /// Default capability superset; host overrides may only narrow it.
    pub capabilities: CapabilitySet,
    pub fields: Vec<FieldDescriptor>,
}

/// A reusable protocol/transport/TLS triple with default field values.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Template {
    pub id: String,
    pub name: String,
    pub protocol: Protocol,
    pub transport: Transport,
    pub tls_mode: TlsMode,
    #[serde(default)]
    pub defaults: Settings,
    /// Archetype whitelist; empty admits every archetype.
    #[serde(default)]
    pub archetypes: Vec<HostArchetype>,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub builtin: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

impl Template {
    pub fn triple(&self) -> (Protocol, Transport, TlsMode) {
        (self.protocol, self.transport, self.tls_mode)
    }

    pub fn allows_archetype(&self, archetype: HostArchetype) -> bool {
        self.archetypes.is_empty() || self.archetypes.contains(&archetype)
    }

    pub fn to_view(&self, has_override: bool) -> ProfileView {
        ProfileView {
            id: self.id.clone(),
            name: self.name.clone(),
            protocol: self.protocol,
            transport: self.transport,
            tls_mode: self.tls_mode,
            defaults: self.defaults.clone(),
            archetypes: self.archetypes.clone(),
            description: self.description.clone(),
            builtin: self.builtin,
            has_override,
            updated_at: self.updated_at,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Registry {
    pub protocols: BTreeMap<Protocol, ProtocolSpec>,
    pub transports: BTreeMap<Transport, Vec<FieldDescriptor>>,
    pub tls_modes: BTreeMap<TlsMode, Vec<FieldDescriptor>>,
    pub archetypes: BTreeMap<HostArchetype, ArchetypeSpec>,
    pub templates: Vec<Template>,
    /// Common port field appended to every triple schema.
    pub port_field: FieldDescriptor,
}

impl Registry {
    pub fn builtin() -> Self {
        Self {
            protocols: builtin::protocols(),
            transports: builtin::transports(),
            tls_modes: builtin::tls_modes(),
            archetypes: builtin::archetypes(),
            templates: builtin::templates(),
            port_field: schema::port(PORT_FIELD, 443),
        }
    }

    /// True iff both the transport and the TLS mode are allowed for the protocol.
    pub fn is_valid_combination(
        &self,
        protocol: Protocol,
        transport: Transport,
        tls_mode: TlsMode,
    ) -> bool {
        self.protocols.get(&protocol).is_some_and(|spec| {
            spec.transports.contains(&transport) && spec.tls_modes.contains(&tls_mode)
        })
    }

    pub fn default_capabilities(&self, archetype: HostArchetype) -> CapabilitySet {
        self.archetypes
            .get(&archetype)
            .map(|spec| spec.capabilities.clone())
            .unwrap_or_default()
    }

    /// The host override when present, otherwise the archetype default.
    pub fn effective_capabilities(
        &self,
        archetype: HostArchetype,
        host_override: Option<&CapabilitySet>,
    ) -> CapabilitySet {
        match host_override {
            Some(caps) => caps.clone(),
            None => self.default_capabilities(archetype),
        }
    }

    pub fn is_template_compatible(
        &self,
        template: &Template,
        archetype: HostArchetype,
        host_override: Option<&CapabilitySet>,
    ) -> bool {
        if !template.allows_archetype(archetype) {
            return false;
        }
        let (protocol, transport, tls_mode) = template.triple();
        self.effective_capabilities(archetype, host_override)
            .admits(protocol, transport, tls_mode)
    }

    /// Archetypes whose default capability set admits the triple.
    pub fn default_whitelist(
        &self,
        protocol: Protocol,
        transport: Transport,
        tls_mode: TlsMode,
    ) -> Vec<HostArchetype> {
        self.archetypes
            .iter()
            .filter(|(_, spec)| spec.capabilities.admits(protocol, transport, tls_mode))
            .map(|(archetype, _)| *archetype)
            .collect()
    }

    /// Templates an edge host could carry take their host/SNI from the CDN-facing entry name.
    pub fn is_cdn_compatible(&self, template: &Template) -> bool {
        self.is_template_compatible(template, HostArchetype::Edge, None)
    }

    /// Union of protocol, transport, and TLS fields, followed by the common port field.
    pub fn schema_for(
        &self,
        protocol: Protocol,
        transport: Transport,
        tls_mode: TlsMode,
    ) -> Vec<FieldDescriptor> {
        let empty: &[FieldDescriptor] = &[];
        let protocol_fields = self
            .protocols
            .get(&protocol)
            .map(|spec| spec.fields.as_slice())
            .unwrap_or(empty);
        let transport_fields = self
            .transports
            .get(&transport)
            .map(Vec::as_slice)
            .unwrap_or(empty);
        let tls_fields = self
            .tls_modes
            .get(&tls_mode)
            .map(Vec::as_slice)
            .unwrap_or(empty);

        schema::merge_fields([
            protocol_fields,
            transport_fields,
            tls_fields,
            std::slice::from_ref(&self.port_field),
        ])
    }

    pub fn archetype_fields(&self, archetype: HostArchetype) -> &[FieldDescriptor] {
        self.archetypes
            .get(&archetype)
            .map(|spec| spec.fields.as_slice())
            .unwrap_or(&[])
    }

    pub fn archetype_field(&self, archetype: HostArchetype, name: &str) -> Option<&FieldDescriptor> {
        self.archetype_fields(archetype)
            .iter()
            .find(|field| field.name == name)
    }

    /// Name of the archetype field that selects the listener port.
    pub fn port_param(archetype: HostArchetype) -> &'static str {
        match archetype {
            HostArchetype::Full => "listen_port",
            HostArchetype::Edge => "cf_port",
        }
    }

    /// Every settings key that must never leave the control plane in an export.
    pub fn server_side_names(&self) -> BTreeSet<String> {
        let protocol_fields = self.protocols.values().flat_map(|spec| spec.fields.iter());
        let transport_fields = self.transports.values().flatten();
        let tls_fields = self.tls_modes.values().flatten();

        let mut names: BTreeSet<String> = protocol_fields
            .chain(transport_fields)
            .chain(tls_fields)
            .filter(|field| field.visibility == FieldVisibility::ServerSide)
            .flat_map(|field| std::iter::once(field.name.clone()).chain(field.aliases.clone()))
            .collect();
        names.extend(SERVER_SIDE_PASSTHROUGH.iter().map(|name| name.to_string()));
        names
    }

    pub fn builtin_templates(&self) -> &[Template] {
        &self.templates
    }

    pub fn builtin_template(&self, id: &str) -> Option<&Template> {
        self.templates.iter().find(|template| template.id == id)
    }

    pub fn view(&self) -> RegistryView {
        RegistryView {
            protocols: self
                .protocols
                .iter()
                .map(|(id, spec)| ProtocolEntry {
                    id: *id,
                    transports: spec.transports.clone(),
                    tls_modes: spec.tls_modes.clone(),
                    fields: spec.fields.clone(),
                })
                .collect(),
            transports: self
                .transports
                .iter()
                .map(|(id, fields)| TransportEntry {
                    id: *id,
                    fields: fields.clone(),
                })
                .collect(),
            tls_modes: self
                .tls_modes
                .iter()
                .map(|(id, fields)| TlsEntry {
                    id: *id,
                    fields: fields.clone(),
                })
                .collect(),
            archetypes: self
                .archetypes
                .iter()
                .map(|(id, spec)| ArchetypeEntry {
                    id: *id,
                    capabilities: spec.capabilities.clone(),
                    fields: spec.fields.clone(),
                })
                .collect(),
        }
    }
}
