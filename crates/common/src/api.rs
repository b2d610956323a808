//! Shared API DTOs used across control-plane, host-agent, and operator clients.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

/// Resolved field values keyed by field name.
pub type Settings = serde_json::Map<String, serde_json::Value>;

/// Machine-readable error codes carried in the `code` field of error bodies.
pub mod error_codes {
    /// Missing operator credentials.
    pub const UNAUTHORIZED: &str = "unauthorized";
    /// Operator credentials were presented but rejected.
    pub const FORBIDDEN: &str = "forbidden";
    /// Request payload failed validation.
    pub const VALIDATION: &str = "validation";
    /// A required host-protocol parameter was absent.
    pub const MISSING_PARAM: &str = "missing_param";
    /// Host request carried no bearer token.
    pub const MISSING_TOKEN: &str = "missing_token";
    /// Host bearer token did not match.
    pub const INVALID_TOKEN: &str = "invalid_token";
    /// Unknown host id.
    pub const HOST_NOT_FOUND: &str = "host_not_found";
    /// Plan version was pruned or never written.
    pub const PLAN_NOT_FOUND: &str = "plan_not_found";
    /// Unknown profile id.
    pub const PROFILE_NOT_FOUND: &str = "profile_not_found";
    /// Unknown deploy id.
    pub const DEPLOY_NOT_FOUND: &str = "deploy_not_found";
    /// Attempted to change an immutable attribute.
    pub const IMMUTABLE: &str = "immutable";
    /// Unknown subscription token.
    pub const SUBSCRIPTION_NOT_FOUND: &str = "subscription_not_found";
    /// Subscription exists but is disabled.
    pub const SUBSCRIPTION_DISABLED: &str = "subscription_disabled";
    /// Request body exceeded the configured limit.
    pub const PAYLOAD_TOO_LARGE: &str = "payload_too_large";
    /// Backing store is temporarily unavailable.
    pub const SERVICE_UNAVAILABLE: &str = "service_unavailable";
    /// Unexpected server failure.
    pub const INTERNAL_ERROR: &str = "internal_error";
}

/// Returned when a wire identifier does not name a known variant.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown {kind} '{value}'")]
pub struct UnknownVariant {
    /// Vocabulary the value was parsed against.
    pub kind: &'static str,
    /// Offending input.
    pub value: String,
}

/// Encrypted-tunnel protocol family.
#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash, ToSchema,
)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    /// VLESS.
    Vless,
    /// Trojan.
    Trojan,
    /// VMess.
    Vmess,
    /// Shadowsocks (including 2022 ciphers).
    Shadowsocks,
    /// Hysteria2 over QUIC.
    Hysteria2,
}

impl Protocol {
    /// Every protocol in registry order.
    pub const ALL: [Protocol; 5] = [
        Protocol::Vless,
        Protocol::Trojan,
        Protocol::Vmess,
        Protocol::Shadowsocks,
        Protocol::Hysteria2,
    ];

    /// Returns the canonical lowercase representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Vless => "vless",
            Protocol::Trojan => "trojan",
            Protocol::Vmess => "vmess",
            Protocol::Shadowsocks => "shadowsocks",
            Protocol::Hysteria2 => "hysteria2",
        }
    }
}

/// Stream transport carrying a protocol.
#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash, ToSchema,
)]
#[serde(rename_all = "lowercase")]
pub enum Transport {
    /// Raw TCP.
    Tcp,
    /// WebSocket.
    Ws,
    /// gRPC.
    Grpc,
    /// HTTP upgrade.
    Httpupgrade,
    /// Split HTTP.
    Splithttp,
    /// HTTP/2.
    H2,
    /// UDP (QUIC based protocols).
    Udp,
}

impl Transport {
    /// Every transport in registry order.
    pub const ALL: [Transport; 7] = [
        Transport::Tcp,
        Transport::Ws,
        Transport::Grpc,
        Transport::Httpupgrade,
        Transport::Splithttp,
        Transport::H2,
        Transport::Udp,
    ];

    /// Returns the canonical lowercase representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            Transport::Tcp => "tcp",
            Transport::Ws => "ws",
            Transport::Grpc => "grpc",
            Transport::Httpupgrade => "httpupgrade",
            Transport::Splithttp => "splithttp",
            Transport::H2 => "h2",
            Transport::Udp => "udp",
        }
    }
}

/// TLS mode of a listener.
#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash, ToSchema,
)]
#[serde(rename_all = "lowercase")]
pub enum TlsMode {
    /// Plaintext.
    None,
    /// Standard TLS.
    Tls,
    /// Reality (borrowed-handshake TLS with an X25519 key pair).
    Reality,
}

impl TlsMode {
    /// Every TLS mode in registry order.
    pub const ALL: [TlsMode; 3] = [TlsMode::None, TlsMode::Tls, TlsMode::Reality];

    /// Returns the canonical lowercase representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            TlsMode::None => "none",
            TlsMode::Tls => "tls",
            TlsMode::Reality => "reality",
        }
    }
}

/// Deployment shape of a managed host.
#[derive(
    Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash, ToSchema,
)]
#[serde(rename_all = "lowercase")]
pub enum HostArchetype {
    /// Full-capability host running its own proxy runtime on arbitrary ports.
    #[serde(alias = "vps")]
    Full,
    /// CDN-constrained edge host with a single negotiated port/TLS state.
    #[serde(alias = "cf_worker")]
    Edge,
}

impl HostArchetype {
    /// Every archetype.
    pub const ALL: [HostArchetype; 2] = [HostArchetype::Full, HostArchetype::Edge];

    /// Returns the canonical lowercase representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            HostArchetype::Full => "full",
            HostArchetype::Edge => "edge",
        }
    }
}

macro_rules! wire_vocabulary {
    ($($ty:ident => $kind:literal),* $(,)?) => {
        $(
            impl fmt::Display for $ty {
                fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                    f.write_str(self.as_str())
                }
            }

            impl FromStr for $ty {
                type Err = UnknownVariant;

                fn from_str(value: &str) -> Result<Self, Self::Err> {
                    let trimmed = value.trim();
                    $ty::ALL
                        .iter()
                        .copied()
                        .find(|candidate| candidate.as_str().eq_ignore_ascii_case(trimmed))
                        .or_else(|| $ty::alias(trimmed))
                        .ok_or_else(|| UnknownVariant {
                            kind: $kind,
                            value: value.to_string(),
                        })
                }
            }
        )*
    };
}

wire_vocabulary!(
    Protocol => "protocol",
    Transport => "transport",
    TlsMode => "tls mode",
    HostArchetype => "archetype",
);

impl Protocol {
    fn alias(value: &str) -> Option<Self> {
        match value {
            "ss" => Some(Protocol::Shadowsocks),
            "hy2" => Some(Protocol::Hysteria2),
            _ => None,
        }
    }
}

impl Transport {
    fn alias(_value: &str) -> Option<Self> {
        None
    }
}

impl TlsMode {
    fn alias(_value: &str) -> Option<Self> {
        None
    }
}

impl HostArchetype {
    fn alias(value: &str) -> Option<Self> {
        match value {
            "vps" => Some(HostArchetype::Full),
            "cf_worker" => Some(HostArchetype::Edge),
            _ => None,
        }
    }
}

/// Protocols, transports, and TLS modes a host may run.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default, ToSchema)]
pub struct CapabilitySet {
    /// Allowed protocols.
    pub protocols: BTreeSet<Protocol>,
    /// Allowed transports.
    pub transports: BTreeSet<Transport>,
    /// Allowed TLS modes.
    pub tls_modes: BTreeSet<TlsMode>,
}

impl CapabilitySet {
    /// Builds a set from slices.
    pub fn from_parts(protocols: &[Protocol], transports: &[Transport], tls: &[TlsMode]) -> Self {
        Self {
            protocols: protocols.iter().copied().collect(),
            transports: transports.iter().copied().collect(),
            tls_modes: tls.iter().copied().collect(),
        }
    }

    /// True when each member of the triple is allowed.
    pub fn admits(&self, protocol: Protocol, transport: Transport, tls_mode: TlsMode) -> bool {
        self.protocols.contains(&protocol)
            && self.transports.contains(&transport)
            && self.tls_modes.contains(&tls_mode)
    }

    /// True when every member of `self` also appears in `other`.
    pub fn is_subset_of(&self, other: &CapabilitySet) -> bool {
        self.protocols.is_subset(&other.protocols)
            && self.transports.is_subset(&other.transports)
            && self.tls_modes.is_subset(&other.tls_modes)
    }
}

/// Value type of a schema field.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum FieldKind {
    /// Free-form string.
    String,
    /// Integer or float.
    Number,
    /// true/false.
    Boolean,
    /// Integer in [1, 65535].
    Port,
    /// One of `options`.
    Enum,
    /// Any subset of `options`.
    MultiEnum,
}

/// Where a field's value comes from when the operator leaves it out.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionHint {
    /// Template or schema default only.
    None,
    /// Fresh random UUID.
    AutoUuid,
    /// Fresh 24-character random secret.
    AutoSecret,
    /// Derived from the host's entry address.
    HostDerived,
}

/// Who may see a resolved field.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum FieldVisibility {
    /// Exported to clients.
    Client,
    /// Retained only in a full host's own plan.
    ServerSide,
}

/// One field of a protocol, transport, TLS, or archetype schema.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, ToSchema)]
pub struct FieldDescriptor {
    /// Field name as it appears in settings.
    pub name: String,
    /// Value type.
    pub kind: FieldKind,
    /// Allowed values for enum kinds.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<String>,
    /// Resolution hint.
    pub hint: ResolutionHint,
    /// Visibility.
    pub visibility: FieldVisibility,
    /// Built-in default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schema(value_type = Option<Object>)]
    pub default: Option<serde_json::Value>,
    /// Resolution must produce a non-empty value.
    #[serde(default)]
    pub required: bool,
    /// Alternate names that mirror this field.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub aliases: Vec<String>,
}

/// Immutable, versioned configuration artifact for one host.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, ToSchema)]
#[serde(tag = "archetype", rename_all = "lowercase")]
pub enum Plan {
    /// Multi-listener plan for a full-capability host.
    Full(FullPlan),
    /// Single-listener plan for a CDN-constrained host.
    Edge(EdgePlan),
}

/// Plan body for full-capability hosts.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, ToSchema)]
pub struct FullPlan {
    /// Plan version.
    pub version: u64,
    /// Owning host.
    pub host_id: Uuid,
    /// Synthesis time.
    pub created_at: DateTime<Utc>,
    /// Ordered listener list.
    pub inbounds: Vec<Inbound>,
    /// Primary port selection.
    pub routing: Routing,
    /// Profile bookkeeping.
    pub meta: PlanMeta,
}

/// One independent listener on a full host.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, ToSchema)]
pub struct Inbound {
    /// Unique tag, `inbound-{profile_id}`.
    pub tag: String,
    /// Source profile.
    pub profile_id: String,
    /// Protocol.
    pub protocol: Protocol,
    /// Transport.
    pub transport: Transport,
    /// TLS mode.
    pub tls_mode: TlsMode,
    /// Resolved settings, server-side fields included.
    #[schema(value_type = Object)]
    pub settings: Settings,
}

/// Routing block of a full plan.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, ToSchema)]
pub struct Routing {
    /// Routing strategy label.
    pub strategy: String,
    /// Validated primary listen port.
    pub listen_port: u16,
}

/// Profile bookkeeping carried by every plan.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default, ToSchema)]
pub struct PlanMeta {
    /// Number of profiles synthesized into the plan.
    pub profile_count: usize,
    /// Profile ids in synthesis order.
    pub profile_ids: Vec<String>,
}

/// Plan body for CDN-constrained hosts.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, ToSchema)]
pub struct EdgePlan {
    /// Plan version.
    pub version: u64,
    /// Owning host.
    pub host_id: Uuid,
    /// Synthesis time.
    pub created_at: DateTime<Utc>,
    /// Externally visible port and TLS classification.
    pub edge: EdgeBinding,
    /// Protocol configs multiplexed through the single listener.
    pub runtime: EdgeRuntime,
    /// Profile bookkeeping.
    pub meta: PlanMeta,
}

/// Externally visible listener of an edge host.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, ToSchema)]
pub struct EdgeBinding {
    /// CDN-facing port.
    pub port: u16,
    /// Whether the CDN terminates TLS on `port`.
    pub is_https: bool,
    /// Optional upstream relay address.
    #[serde(default)]
    pub proxyip: String,
    /// Whether NAT64 fallback is enabled.
    #[serde(default)]
    pub nat64: bool,
}

/// Runtime block of an edge plan.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, ToSchema)]
pub struct EdgeRuntime {
    /// Per-protocol configs.
    pub configs: Vec<EdgeConfig>,
    /// Listener port; equal to `EdgeBinding::port`.
    pub listen_port: u16,
}

/// One protocol config sharing the edge listener.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, ToSchema)]
pub struct EdgeConfig {
    /// Source profile.
    pub profile_id: String,
    /// Protocol.
    pub protocol: Protocol,
    /// Transport.
    pub transport: Transport,
    /// Effective TLS mode, forced to the port classification.
    pub tls_mode: TlsMode,
    /// Resolved client-visible settings.
    #[schema(value_type = Object)]
    pub settings: Settings,
}

impl Plan {
    /// Plan version.
    pub fn version(&self) -> u64 {
        match self {
            Plan::Full(plan) => plan.version,
            Plan::Edge(plan) => plan.version,
        }
    }

    /// Owning host.
    pub fn host_id(&self) -> Uuid {
        match self {
            Plan::Full(plan) => plan.host_id,
            Plan::Edge(plan) => plan.host_id,
        }
    }

    /// Synthesis time.
    pub fn created_at(&self) -> DateTime<Utc> {
        match self {
            Plan::Full(plan) => plan.created_at,
            Plan::Edge(plan) => plan.created_at,
        }
    }

    /// Archetype the plan was synthesized for.
    pub fn archetype(&self) -> HostArchetype {
        match self {
            Plan::Full(_) => HostArchetype::Full,
            Plan::Edge(_) => HostArchetype::Edge,
        }
    }

    /// Primary listen port.
    pub fn primary_port(&self) -> u16 {
        match self {
            Plan::Full(plan) => plan.routing.listen_port,
            Plan::Edge(plan) => plan.edge.port,
        }
    }

    /// Profile bookkeeping.
    pub fn meta(&self) -> &PlanMeta {
        match self {
            Plan::Full(plan) => &plan.meta,
            Plan::Edge(plan) => &plan.meta,
        }
    }

    /// Distinct protocols carried by the plan, sorted.
    pub fn protocols(&self) -> Vec<Protocol> {
        let set: BTreeSet<Protocol> = match self {
            Plan::Full(plan) => plan.inbounds.iter().map(|i| i.protocol).collect(),
            Plan::Edge(plan) => plan.runtime.configs.iter().map(|c| c.protocol).collect(),
        };
        set.into_iter().collect()
    }
}

/// Outcome a host reports for one plan version.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum ApplyStatus {
    /// Plan applied.
    Success,
    /// Plan could not be applied.
    Failed,
}

impl ApplyStatus {
    /// Returns the canonical lowercase representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            ApplyStatus::Success => "success",
            ApplyStatus::Failed => "failed",
        }
    }
}

/// Response to a host version poll.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
pub struct VersionPollResponse {
    /// Polling host.
    pub host_id: Uuid,
    /// Version the host reported as applied.
    pub current_version: u64,
    /// Version the control plane wants applied (0 when nothing was deployed).
    pub target_version: u64,
    /// True when the host should fetch `target_version`.
    pub needs_update: bool,
}

/// Apply outcome reported by a host.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default, ToSchema)]
pub struct ApplyReportRequest {
    /// Version that was applied.
    #[serde(default)]
    pub version: Option<u64>,
    /// Outcome.
    #[serde(default)]
    pub status: Option<ApplyStatus>,
    /// Free-text detail.
    #[serde(default)]
    pub message: String,
    /// Protocols carried by the applied plan.
    #[serde(default)]
    pub protocols: Vec<Protocol>,
}

/// Acknowledgement of an apply report.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
pub struct ApplyReportResponse {
    /// False when the report duplicated the latest recorded entry.
    pub recorded: bool,
    /// Reported version.
    pub version: u64,
    /// Reported status.
    pub status: ApplyStatus,
    /// Currently recorded applied version.
    pub applied_version: u64,
    /// Current failure streak.
    pub consecutive_failures: u32,
}

/// One entry of a host's bounded apply history.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
pub struct ApplyHistoryEntry {
    /// Plan version.
    pub version: u64,
    /// Outcome.
    pub status: ApplyStatus,
    /// Free-text detail.
    #[serde(default)]
    pub message: String,
    /// Protocols carried by the plan.
    #[serde(default)]
    pub protocols: Vec<Protocol>,
    /// When the outcome was recorded.
    pub at: DateTime<Utc>,
}

/// Host as returned to operators.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, ToSchema)]
pub struct HostView {
    /// Host identifier.
    pub id: Uuid,
    /// Display name.
    pub name: String,
    /// Deployment shape.
    pub archetype: HostArchetype,
    /// CDN-facing entry name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entry_domain: Option<String>,
    /// Direct entry name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entry_domain_direct: Option<String>,
    /// Entry IP address.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entry_ip: Option<String>,
    /// Free-form region label.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    /// Free-form tags.
    #[serde(default)]
    pub tags: Vec<String>,
    /// Capability override; absent means the archetype default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capabilities: Option<CapabilitySet>,
    /// Override or archetype default.
    pub effective_capabilities: CapabilitySet,
    /// Version the control plane wants applied.
    pub desired_version: u64,
    /// Last version the host confirmed.
    pub applied_version: u64,
    /// Highest version ever written for the host.
    pub latest_version: u64,
    /// Last recorded contact.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_seen: Option<DateTime<Utc>>,
    /// Whether `last_seen` is within the online threshold.
    pub is_online: bool,
    /// Last reported apply status.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_apply_status: Option<ApplyStatus>,
    /// Last reported apply message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_apply_message: Option<String>,
    /// Time of the last apply report.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_apply_at: Option<DateTime<Utc>>,
    /// Current failure streak.
    pub consecutive_failures: u32,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

/// Host creation payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, ToSchema)]
pub struct HostCreateRequest {
    /// Display name.
    pub name: String,
    /// Deployment shape (`full`/`vps` or `edge`/`cf_worker`).
    pub archetype: String,
    /// CDN-facing entry name.
    #[serde(default)]
    pub entry_domain: Option<String>,
    /// Direct entry name.
    #[serde(default)]
    pub entry_domain_direct: Option<String>,
    /// Entry IP address.
    #[serde(default)]
    pub entry_ip: Option<String>,
    /// Region label.
    #[serde(default)]
    pub region: Option<String>,
    /// Tags.
    #[serde(default)]
    pub tags: Vec<String>,
    /// Optional capability narrowing.
    #[serde(default)]
    pub capabilities: Option<CapabilitySet>,
}

/// Host creation result; the token is shown once.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, ToSchema)]
pub struct HostCreateResponse {
    /// Created host.
    pub host: HostView,
    /// Plaintext bearer token for the host agent.
    pub host_token: String,
}

/// Partial host update.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default, ToSchema)]
pub struct HostUpdateRequest {
    /// New display name.
    #[serde(default)]
    pub name: Option<String>,
    /// Replace the CDN-facing entry name (null clears it).
    #[serde(default, deserialize_with = "deserialize_nullable")]
    #[schema(value_type = Option<String>)]
    pub entry_domain: Option<Option<String>>,
    /// Replace the direct entry name (null clears it).
    #[serde(default, deserialize_with = "deserialize_nullable")]
    #[schema(value_type = Option<String>)]
    pub entry_domain_direct: Option<Option<String>>,
    /// Replace the entry IP (null clears it).
    #[serde(default, deserialize_with = "deserialize_nullable")]
    #[schema(value_type = Option<String>)]
    pub entry_ip: Option<Option<String>>,
    /// Replace the region (null clears it).
    #[serde(default, deserialize_with = "deserialize_nullable")]
    #[schema(value_type = Option<String>)]
    pub region: Option<Option<String>>,
    /// Replace tags.
    #[serde(default)]
    pub tags: Option<Vec<String>>,
    /// Replace the capability override (null restores the archetype default).
    #[serde(default, deserialize_with = "deserialize_nullable")]
    #[schema(value_type = Option<CapabilitySet>)]
    pub capabilities: Option<Option<CapabilitySet>>,
    /// Issue a fresh host token.
    #[serde(default)]
    pub rotate_token: bool,
}

/// Host update result.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, ToSchema)]
pub struct HostUpdateResponse {
    /// Updated host.
    pub host: HostView,
    /// New plaintext token when `rotate_token` was set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_token: Option<String>,
}

/// Manager connection section of a diagnosis.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, ToSchema)]
pub struct ManagerConnection {
    /// Whether the host is within the online threshold.
    pub is_online: bool,
    /// Last recorded contact.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_seen: Option<DateTime<Utc>>,
    /// Seconds since the last recorded contact.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lag_secs: Option<i64>,
}

/// Template sync section of a diagnosis.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, ToSchema)]
pub struct TemplateSync {
    /// Desired version.
    pub target_version: u64,
    /// Applied version.
    pub applied_version: u64,
    /// True when target and applied agree.
    pub in_sync: bool,
    /// Last reported status.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_status: Option<ApplyStatus>,
    /// Last reported message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_message: Option<String>,
    /// Time of the last report.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_apply_at: Option<DateTime<Utc>>,
    /// Current failure streak.
    pub consecutive_failures: u32,
}

/// Operator diagnosis of a host.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, ToSchema)]
pub struct HostDiagnosis {
    /// Host identifier.
    pub host_id: Uuid,
    /// Connectivity.
    pub manager_connection: ManagerConnection,
    /// Version sync.
    pub template_sync: TemplateSync,
    /// Failed history entries, newest first.
    pub runtime_errors: Vec<ApplyHistoryEntry>,
    /// Full history, newest first.
    pub apply_history: Vec<ApplyHistoryEntry>,
}

/// Configuration template as returned to operators.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, ToSchema)]
pub struct ProfileView {
    /// Profile id.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Protocol.
    pub protocol: Protocol,
    /// Transport.
    pub transport: Transport,
    /// TLS mode.
    pub tls_mode: TlsMode,
    /// Default field values (override merged in for built-ins).
    #[schema(value_type = Object)]
    pub defaults: Settings,
    /// Archetypes the profile may be deployed to.
    pub archetypes: Vec<HostArchetype>,
    /// Description.
    #[serde(default)]
    pub description: String,
    /// Whether the profile ships with the control plane.
    pub builtin: bool,
    /// Whether a built-in carries an override record.
    #[serde(default)]
    pub has_override: bool,
    /// Last modification of the custom profile or override.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

/// Profile plus its resolved field schema.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, ToSchema)]
pub struct ProfileDetail {
    /// Profile.
    #[serde(flatten)]
    pub profile: ProfileView,
    /// Union of protocol, transport, and TLS fields.
    pub schema: Vec<FieldDescriptor>,
}

/// Custom profile creation payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, ToSchema)]
pub struct ProfileCreateRequest {
    /// Profile id (lowercase letters, digits, `-`, `_`).
    pub id: String,
    /// Display name.
    pub name: String,
    /// Protocol id.
    pub protocol: String,
    /// Transport id.
    pub transport: String,
    /// TLS mode id.
    pub tls_mode: String,
    /// Default field values.
    #[serde(default)]
    #[schema(value_type = Object)]
    pub defaults: Settings,
    /// Archetype whitelist; defaults to every archetype able to run the triple.
    #[serde(default)]
    pub archetypes: Option<Vec<String>>,
    /// Description.
    #[serde(default)]
    pub description: Option<String>,
}

/// Partial profile update.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default, ToSchema)]
pub struct ProfileUpdateRequest {
    /// New display name (custom only).
    #[serde(default)]
    pub name: Option<String>,
    /// New protocol id (custom only).
    #[serde(default)]
    pub protocol: Option<String>,
    /// New transport id (custom only).
    #[serde(default)]
    pub transport: Option<String>,
    /// New TLS mode id (custom only).
    #[serde(default)]
    pub tls_mode: Option<String>,
    /// Defaults merged into the existing defaults.
    #[serde(default)]
    #[schema(value_type = Option<Object>)]
    pub defaults: Option<Settings>,
    /// New archetype whitelist (custom only).
    #[serde(default)]
    pub archetypes: Option<Vec<String>>,
    /// New description.
    #[serde(default)]
    pub description: Option<String>,
}

/// Result of deleting a profile or resetting a built-in override.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
pub struct ProfileDeleteResponse {
    /// Profile id.
    pub id: String,
    /// `deleted` for custom profiles, `reset` for built-ins.
    pub action: String,
}

/// Protocol row of the registry view.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, ToSchema)]
pub struct ProtocolEntry {
    /// Protocol.
    pub id: Protocol,
    /// Allowed transports.
    pub transports: Vec<Transport>,
    /// Allowed TLS modes.
    pub tls_modes: Vec<TlsMode>,
    /// Protocol fields.
    pub fields: Vec<FieldDescriptor>,
}

/// Transport row of the registry view.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, ToSchema)]
pub struct TransportEntry {
    /// Transport.
    pub id: Transport,
    /// Transport fields.
    pub fields: Vec<FieldDescriptor>,
}

/// TLS row of the registry view.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, ToSchema)]
pub struct TlsEntry {
    /// TLS mode.
    pub id: TlsMode,
    /// TLS fields.
    pub fields: Vec<FieldDescriptor>,
}

/// Archetype row of the registry view.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, ToSchema)]
pub struct ArchetypeEntry {
    /// Archetype.
    pub id: HostArchetype,
    /// Default capability superset.
    pub capabilities: CapabilitySet,
    /// Archetype-specific fields.
    pub fields: Vec<FieldDescriptor>,
}

/// Static capability registry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, ToSchema)]
pub struct RegistryView {
    /// Protocol table.
    pub protocols: Vec<ProtocolEntry>,
    /// Transport table.
    pub transports: Vec<TransportEntry>,
    /// TLS table.
    pub tls_modes: Vec<TlsEntry>,
    /// Archetype table.
    pub archetypes: Vec<ArchetypeEntry>,
}

/// Deploy request: targets plus a uniform parameter override map.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default, ToSchema)]
pub struct DeployRequest {
    /// Target hosts.
    #[serde(default)]
    pub host_ids: Vec<Uuid>,
    /// Candidate profiles.
    #[serde(default)]
    pub profile_ids: Vec<String>,
    /// Parameter overrides applied before per-host resolution.
    #[serde(default)]
    #[schema(value_type = Object)]
    pub params: Settings,
}

/// Per-host deploy outcome.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum DeployOutcome {
    /// A new plan was written and pointed to.
    Deployed,
    /// No requested profile is compatible with the host (or the host is unknown).
    Skipped,
    /// Synthesis or persistence failed for this host.
    Error,
}

impl DeployOutcome {
    /// Returns the canonical lowercase representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            DeployOutcome::Deployed => "deployed",
            DeployOutcome::Skipped => "skipped",
            DeployOutcome::Error => "error",
        }
    }
}

/// Outcome of one host in a deploy.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
pub struct DeployHostResult {
    /// Host identifier.
    pub host_id: Uuid,
    /// Host name when the host exists.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_name: Option<String>,
    /// Outcome.
    pub status: DeployOutcome,
    /// Assigned version for deployed hosts.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<u64>,
    /// Reason for skipped or errored hosts.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Version assignment of a deployed host.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
pub struct HostVersion {
    /// Host identifier.
    pub host_id: Uuid,
    /// Host name.
    pub host_name: String,
    /// Assigned version.
    pub version: u64,
}

/// Immutable audit record of one deploy request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, ToSchema)]
pub struct DeployRecord {
    /// Deploy identifier.
    pub id: Uuid,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Requested hosts.
    pub host_ids: Vec<Uuid>,
    /// Requested profiles.
    pub profile_ids: Vec<String>,
    /// Names of the resolved profiles.
    pub config_names: Vec<String>,
    /// Parameters used, secrets redacted.
    #[schema(value_type = Object)]
    pub params_snapshot: Settings,
    /// Version assignments.
    pub host_versions: Vec<HostVersion>,
    /// Per-host outcomes in request order.
    pub results: Vec<DeployHostResult>,
    /// Shared version when every deployed host got the same one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<u64>,
    /// Lowest assigned version.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version_min: Option<u64>,
    /// Highest assigned version.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version_max: Option<u64>,
}

/// Deploy index entry.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, ToSchema)]
pub struct DeploySummary {
    /// Deploy identifier.
    pub id: Uuid,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Requested profiles.
    pub profile_ids: Vec<String>,
    /// Number of requested hosts.
    pub host_count: usize,
    /// Hosts deployed.
    pub deployed: usize,
    /// Hosts skipped.
    pub skipped: usize,
    /// Hosts errored.
    pub errors: usize,
    /// Lowest assigned version.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version_min: Option<u64>,
    /// Highest assigned version.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version_max: Option<u64>,
}

/// Rollback request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default, ToSchema)]
pub struct RollbackRequest {
    /// Target hosts.
    #[serde(default)]
    pub host_ids: Vec<Uuid>,
    /// Version to repoint to (>= 1).
    #[serde(default)]
    pub target_version: u64,
}

/// Per-host rollback status.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum RollbackStatus {
    /// Desired version repointed.
    RolledBack,
    /// Host does not exist.
    Skipped,
    /// Plan for the target version is gone.
    Failed,
}

impl RollbackStatus {
    /// Returns the canonical snake_case representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            RollbackStatus::RolledBack => "rolled_back",
            RollbackStatus::Skipped => "skipped",
            RollbackStatus::Failed => "failed",
        }
    }
}

/// Outcome of one host in a rollback.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
pub struct RollbackHostResult {
    /// Host identifier.
    pub host_id: Uuid,
    /// Outcome.
    pub status: RollbackStatus,
    /// Desired version before the rollback.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_version: Option<u64>,
    /// Reason for skipped or failed hosts.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Rollback result.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
pub struct RollbackResponse {
    /// Requested version.
    pub target_version: u64,
    /// Per-host outcomes in request order.
    pub results: Vec<RollbackHostResult>,
}

/// Subscription as returned to operators.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
pub struct SubscriptionView {
    /// Export token; doubles as the capability to read the export.
    pub token: String,
    /// Display name.
    pub name: String,
    /// Disabled subscriptions answer 403.
    pub enabled: bool,
    /// Hosts included; empty means every host.
    #[serde(default)]
    pub visible_host_ids: Vec<Uuid>,
    /// Profiles included; empty means every profile.
    #[serde(default)]
    pub visible_profile_ids: Vec<String>,
    /// Operator note.
    #[serde(default)]
    pub remark: String,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// Last modification.
    pub updated_at: DateTime<Utc>,
}

/// Subscription creation payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default, ToSchema)]
pub struct SubscriptionCreateRequest {
    /// Display name.
    pub name: String,
    /// Defaults to true.
    #[serde(default)]
    pub enabled: Option<bool>,
    /// Hosts included.
    #[serde(default)]
    pub visible_host_ids: Vec<Uuid>,
    /// Profiles included.
    #[serde(default)]
    pub visible_profile_ids: Vec<String>,
    /// Operator note.
    #[serde(default)]
    pub remark: Option<String>,
}

/// Partial subscription update.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default, ToSchema)]
pub struct SubscriptionUpdateRequest {
    /// New name.
    #[serde(default)]
    pub name: Option<String>,
    /// Enable or disable.
    #[serde(default)]
    pub enabled: Option<bool>,
    /// Replace host visibility.
    #[serde(default)]
    pub visible_host_ids: Option<Vec<Uuid>>,
    /// Replace profile visibility.
    #[serde(default)]
    pub visible_profile_ids: Option<Vec<String>>,
    /// Replace the note.
    #[serde(default)]
    pub remark: Option<String>,
}

/// Client export encoding.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum ExportFormat {
    /// Base64-wrapped URI list.
    V2ray,
    /// Clash/Mihomo YAML.
    Clash,
    /// sing-box JSON.
    Singbox,
}

impl ExportFormat {
    /// Parses a query value, falling back to [`ExportFormat::V2ray`].
    pub fn from_query(value: Option<&str>) -> Self {
        match value.map(|v| v.trim().to_ascii_lowercase()).as_deref() {
            Some("clash") => ExportFormat::Clash,
            Some("singbox") | Some("sing-box") => ExportFormat::Singbox,
            _ => ExportFormat::V2ray,
        }
    }

    /// Returns the canonical lowercase representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            ExportFormat::V2ray => "v2ray",
            ExportFormat::Clash => "clash",
            ExportFormat::Singbox => "singbox",
        }
    }

    /// Response content type.
    pub fn content_type(&self) -> &'static str {
        match self {
            ExportFormat::V2ray => "text/plain; charset=utf-8",
            ExportFormat::Clash => "text/yaml; charset=utf-8",
            ExportFormat::Singbox => "application/json",
        }
    }

    /// Attachment file name.
    pub fn file_name(&self) -> &'static str {
        match self {
            ExportFormat::V2ray => "edgefleet.txt",
            ExportFormat::Clash => "edgefleet.yaml",
            ExportFormat::Singbox => "edgefleet.json",
        }
    }
}

/// Error body emitted by every failing endpoint.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, ToSchema)]
pub struct ErrorBody {
    /// Human-readable message.
    pub error: String,
    /// Machine-readable code from [`error_codes`].
    pub code: String,
}

fn deserialize_nullable<'de, D, T>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Option::<T>::deserialize(deserializer).map(Some)
}
