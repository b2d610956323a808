use std::collections::BTreeMap;

use common::api::{
    CapabilitySet, FieldDescriptor, HostArchetype, Protocol, ResolutionHint, Settings, TlsMode,
    Transport,
};
use serde_json::{Value, json};

use super::schema::{
    FieldDescriptorExt, boolean, choice, multi_choice, number, port, string,
};
use super::{ArchetypeSpec, CDN_PLAINTEXT_PORTS, CDN_TLS_PORTS, ProtocolSpec, Template};

const FINGERPRINTS: &[&str] = &[
    "chrome",
    "firefox",
    "safari",
    "edge",
    "ios",
    "android",
    "random",
    "randomized",
];

const SS_METHODS: &[&str] = &[
    "2022-blake3-aes-128-gcm",
    "2022-blake3-aes-256-gcm",
    "2022-blake3-chacha20-poly1305",
    "aes-256-gcm",
    "aes-128-gcm",
    "chacha20-ietf-poly1305",
    "xchacha20-ietf-poly1305",
];

const ALPN: &[&str] = &["h2", "http/1.1"];

fn uuid_field() -> FieldDescriptor {
    string("uuid", "")
        .with_hint(ResolutionHint::AutoUuid)
        .required()
}

fn password_field() -> FieldDescriptor {
    string("password", "")
        .with_hint(ResolutionHint::AutoSecret)
        .required()
}

fn host_field() -> FieldDescriptor {
    string("host", "").with_hint(ResolutionHint::HostDerived)
}

pub(crate) fn protocols() -> BTreeMap<Protocol, ProtocolSpec> {
    use Transport::*;

    BTreeMap::from([
        (
            Protocol::Vless,
            ProtocolSpec {
                transports: vec![Tcp, Ws, Grpc, Httpupgrade, Splithttp, H2],
                tls_modes: vec![TlsMode::None, TlsMode::Tls, TlsMode::Reality],
                fields: vec![
                    uuid_field(),
                    choice("encryption", &["none"], "none"),
                    choice("flow", &["", "xtls-rprx-vision"], ""),
                ],
            },
        ),
        (
            Protocol::Trojan,
            ProtocolSpec {
                transports: vec![Tcp, Ws, Grpc, H2],
                tls_modes: vec![TlsMode::Tls],
                fields: vec![password_field()],
            },
        ),
        (
            Protocol::Vmess,
            ProtocolSpec {
                transports: vec![Tcp, Ws, Grpc, H2, Httpupgrade],
                tls_modes: vec![TlsMode::None, TlsMode::Tls],
                fields: vec![
                    uuid_field(),
                    number("alter_id", 0),
                    choice(
                        "encryption",
                        &["auto", "aes-128-gcm", "chacha20-poly1305", "none"],
                        "auto",
                    ),
                ],
            },
        ),
        (
            Protocol::Shadowsocks,
            ProtocolSpec {
                transports: vec![Tcp],
                tls_modes: vec![TlsMode::None, TlsMode::Tls],
                fields: vec![
                    password_field(),
                    choice("method", SS_METHODS, "2022-blake3-aes-128-gcm"),
                ],
            },
        ),
        (
            Protocol::Hysteria2,
            ProtocolSpec {
                transports: vec![Udp],
                tls_modes: vec![TlsMode::Tls],
                fields: vec![
                    password_field(),
                    number("up_mbps", 100),
                    number("down_mbps", 100),
                    choice("obfs_type", &["", "salamander"], ""),
                    string("obfs_password", ""),
                ],
            },
        ),
    ])
}

pub(crate) fn transports() -> BTreeMap<Transport, Vec<FieldDescriptor>> {
    let path_and_host = || vec![string("path", "/"), host_field()];

    BTreeMap::from([
        (
            Transport::Tcp,
            vec![choice("header_type", &["none", "http"], "none")],
        ),
        (
            Transport::Ws,
            vec![
                string("path", "/"),
                host_field(),
                number("max_early_data", 2560),
                string("early_data_header", "Sec-WebSocket-Protocol"),
            ],
        ),
        (
            Transport::Grpc,
            vec![
                string("service_name", "grpc"),
                boolean("multi_mode", false),
            ],
        ),
        (Transport::Httpupgrade, path_and_host()),
        (Transport::Splithttp, path_and_host()),
        (Transport::H2, path_and_host()),
        (Transport::Udp, Vec::new()),
    ])
}

pub(crate) fn tls_modes() -> BTreeMap<TlsMode, Vec<FieldDescriptor>> {
    BTreeMap::from([
        (TlsMode::None, Vec::new()),
        (
            TlsMode::Tls,
            vec![
                string("sni", "").with_hint(ResolutionHint::HostDerived),
                choice("fingerprint", FINGERPRINTS, "chrome"),
                multi_choice("alpn", ALPN, ALPN),
                boolean("allow_insecure", false),
            ],
        ),
        (
            TlsMode::Reality,
            vec![
                // Disguise name; never derived from the host entry.
                string("sni", "www.microsoft.com"),
                string("public_key", ""),
                string("private_key", "")
                    .server_side()
                    .alias("reality_private_key"),
                string("short_id", ""),
                choice("fingerprint", FINGERPRINTS, "chrome"),
                string("spider_x", "/"),
            ],
        ),
    ])
}

pub(crate) fn archetypes() -> BTreeMap<HostArchetype, ArchetypeSpec> {
    let cdn_ports: Vec<String> = CDN_TLS_PORTS
        .iter()
        .chain(CDN_PLAINTEXT_PORTS.iter())
        .map(|p| p.to_string())
        .collect();
    let cdn_port_refs: Vec<&str> = cdn_ports.iter().map(String::as_str).collect();

    BTreeMap::from([
        (
            HostArchetype::Full,
            ArchetypeSpec {
                capabilities: CapabilitySet::from_parts(
                    &Protocol::ALL,
                    &Transport::ALL,
                    &TlsMode::ALL,
                ),
                fields: vec![port("listen_port", 443)],
            },
        ),
        (
            HostArchetype::Edge,
            ArchetypeSpec {
                capabilities: CapabilitySet::from_parts(
                    &[Protocol::Vless, Protocol::Trojan],
                    &[Transport::Ws],
                    &[TlsMode::Tls, TlsMode::None],
                ),
                fields: vec![
                    port("cf_port", 443).with_options(&cdn_port_refs),
                    string("proxyip", ""),
                    boolean("nat64", false),
                ],
            },
        ),
    ])
}

fn defaults(value: Value) -> Settings {
    match value {
        Value::Object(map) => map,
        _ => Settings::new(),
    }
}

fn template(
    id: &str,
    name: &str,
    triple: (Protocol, Transport, TlsMode),
    archetypes: &[HostArchetype],
    description: &str,
    values: Value,
) -> Template {
    let (protocol, transport, tls_mode) = triple;
    Template {
        id: id.to_string(),
        name: name.to_string(),
        protocol,
        transport,
        tls_mode,
        defaults: defaults(values),
        archetypes: archetypes.to_vec(),
        description: description.to_string(),
        builtin: true,
        created_at: None,
        updated_at: None,
    }
}

pub(crate) fn templates() -> Vec<Template> {
    use HostArchetype::{Edge, Full};
    use Protocol::*;

    vec![
        template(
            "vless-ws-tls",
            "VLESS+WS+TLS",
            (Vless, Transport::Ws, TlsMode::Tls),
            &[Full, Edge],
            "VLESS over WebSocket with TLS; CDN friendly",
            json!({"path": "/?ed=2560", "fingerprint": "randomized", "alpn": ["h2", "http/1.1"]}),
        ),
        template(
            "vless-ws-none",
            "VLESS+WS",
            (Vless, Transport::Ws, TlsMode::None),
            &[Edge],
            "VLESS over WebSocket without TLS for plaintext CDN ports",
            json!({"path": "/?ed=2560"}),
        ),
        template(
            "vless-reality-tcp",
            "VLESS+Reality+TCP",
            (Vless, Transport::Tcp, TlsMode::Reality),
            &[Full],
            "VLESS with Reality over direct TCP",
            json!({"sni": "www.microsoft.com", "fingerprint": "chrome", "flow": "xtls-rprx-vision"}),
        ),
        template(
            "vless-grpc-tls",
            "VLESS+gRPC+TLS",
            (Vless, Transport::Grpc, TlsMode::Tls),
            &[Full],
            "VLESS over gRPC with TLS",
            json!({"service_name": "grpc", "fingerprint": "chrome"}),
        ),
        template(
            "trojan-ws-tls",
            "Trojan+WS+TLS",
            (Trojan, Transport::Ws, TlsMode::Tls),
            &[Full, Edge],
            "Trojan over WebSocket with TLS; CDN friendly",
            json!({"path": "/trojan-ws", "fingerprint": "chrome"}),
        ),
        template(
            "trojan-tcp-tls",
            "Trojan+TCP+TLS",
            (Trojan, Transport::Tcp, TlsMode::Tls),
            &[Full],
            "Trojan over plain TCP with TLS",
            json!({"fingerprint": "chrome"}),
        ),
        template(
            "vmess-ws-tls",
            "VMess+WS+TLS",
            (Vmess, Transport::Ws, TlsMode::Tls),
            &[Full],
            "VMess over WebSocket with TLS",
            json!({"path": "/vmess-ws", "alter_id": 0, "encryption": "auto", "fingerprint": "chrome"}),
        ),
        template(
            "ss-2022",
            "Shadowsocks 2022",
            (Shadowsocks, Transport::Tcp, TlsMode::None),
            &[Full],
            "Shadowsocks with 2022 ciphers",
            json!({"method": "2022-blake3-aes-128-gcm"}),
        ),
        template(
            "hysteria2",
            "Hysteria2",
            (Hysteria2, Transport::Udp, TlsMode::Tls),
            &[Full],
            "Hysteria2 over QUIC",
            json!({"up_mbps": 100, "down_mbps": 100, "fingerprint": "chrome"}),
        ),
    ]
}
