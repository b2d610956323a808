//! Clash/Mihomo proxy document.

use std::collections::BTreeMap;

use common::api::{Protocol, TlsMode, Transport};
use serde::Serialize;

use super::{ExportRecord, GROUP_NAME};
use crate::Result;

#[derive(Debug, Serialize)]
struct Document {
    proxies: Vec<Proxy>,
    #[serde(rename = "proxy-groups")]
    proxy_groups: Vec<ProxyGroup>,
}

#[derive(Debug, Serialize)]
struct ProxyGroup {
    name: String,
    #[serde(rename = "type")]
    kind: String,
    proxies: Vec<String>,
}

#[derive(Debug, Default, Serialize)]
#[serde(rename_all = "kebab-case")]
struct Proxy {
    name: String,
    #[serde(rename = "type")]
    kind: String,
    server: String,
    port: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    uuid: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    password: Option<String>,
    #[serde(rename = "alterId", skip_serializing_if = "Option::is_none")]
    alter_id: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    cipher: Option<String>,
    udp: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    tls: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    servername: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    sni: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    alpn: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    client_fingerprint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    skip_cert_verify: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    flow: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    network: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    ws_opts: Option<WsOpts>,
    #[serde(skip_serializing_if = "Option::is_none")]
    grpc_opts: Option<GrpcOpts>,
    #[serde(skip_serializing_if = "Option::is_none")]
    h2_opts: Option<H2Opts>,
    #[serde(skip_serializing_if = "Option::is_none")]
    reality_opts: Option<RealityOpts>,
    #[serde(skip_serializing_if = "Option::is_none")]
    up: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    down: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    obfs: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    obfs_password: Option<String>,
}

#[derive(Debug, Serialize)]
struct WsOpts {
    path: String,
    headers: BTreeMap<String, String>,
}

#[derive(Debug, Serialize)]
struct GrpcOpts {
    #[serde(rename = "grpc-service-name")]
    grpc_service_name: String,
}

#[derive(Debug, Serialize)]
struct H2Opts {
    host: Vec<String>,
    path: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "kebab-case")]
struct RealityOpts {
    public_key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    short_id: Option<String>,
}

fn owned(value: Option<&str>) -> Option<String> {
    value.map(str::to_string)
}

fn proxy(record: &ExportRecord) -> Proxy {
    let mut proxy = Proxy {
        name: record.name.clone(),
        server: record.address.clone(),
        port: record.port,
        udp: true,
        ..Proxy::default()
    };

    match record.protocol {
        Protocol::Vless => {
            proxy.kind = "vless".into();
            proxy.uuid = owned(record.text("uuid"));
            proxy.flow = owned(record.text("flow"));
        }
        Protocol::Trojan => {
            proxy.kind = "trojan".into();
            proxy.password = owned(record.text("password"));
        }
        Protocol::Vmess => {
            proxy.kind = "vmess".into();
            proxy.uuid = owned(record.text("uuid"));
            proxy.alter_id = Some(record.number("alter_id").unwrap_or(0));
            proxy.cipher = Some(record.text("encryption").unwrap_or("auto").to_string());
        }
        Protocol::Shadowsocks => {
            proxy.kind = "ss".into();
            proxy.cipher = owned(record.text("method"));
            proxy.password = owned(record.text("password"));
        }
        Protocol::Hysteria2 => {
            proxy.kind = "hysteria2".into();
            proxy.password = owned(record.text("password"));
            proxy.sni = Some(record.server_name().to_string());
            proxy.up = record.number("up_mbps").map(|n| format!("{n} Mbps"));
            proxy.down = record.number("down_mbps").map(|n| format!("{n} Mbps"));
            proxy.obfs = owned(record.text("obfs_type"));
            if proxy.obfs.is_some() {
                proxy.obfs_password = owned(record.text("obfs_password"));
            }
            proxy.skip_cert_verify = Some(record.flag("allow_insecure"));
            return proxy;
        }
    }

    apply_transport(&mut proxy, record);
    apply_tls(&mut proxy, record);
    proxy
}

fn apply_transport(proxy: &mut Proxy, record: &ExportRecord) {
    match record.transport {
        Transport::Ws | Transport::Httpupgrade => {
            proxy.network = Some("ws".into());
            let mut headers = BTreeMap::new();
            headers.insert("Host".to_string(), record.host_header().to_string());
            proxy.ws_opts = Some(WsOpts {
                path: record.path().to_string(),
                headers,
            });
        }
        Transport::Grpc => {
            proxy.network = Some("grpc".into());
            proxy.grpc_opts = Some(GrpcOpts {
                grpc_service_name: record.text("service_name").unwrap_or("grpc").to_string(),
            });
        }
        Transport::H2 | Transport::Splithttp => {
            proxy.network = Some("h2".into());
            proxy.h2_opts = Some(H2Opts {
                host: vec![record.host_header().to_string()],
                path: record.path().to_string(),
            });
        }
        Transport::Tcp | Transport::Udp => {}
    }
}

fn apply_tls(proxy: &mut Proxy, record: &ExportRecord) {
    match record.tls_mode {
        TlsMode::None => {
            if record.protocol != Protocol::Shadowsocks {
                proxy.tls = Some(false);
            }
        }
        TlsMode::Tls => {
            proxy.tls = Some(true);
            let name = record.server_name().to_string();
            if record.protocol == Protocol::Trojan {
                proxy.sni = Some(name);
            } else {
                proxy.servername = Some(name);
            }
            proxy.alpn = record.list("alpn");
            proxy.client_fingerprint = owned(record.text("fingerprint"));
            proxy.skip_cert_verify = Some(record.flag("allow_insecure"));
        }
        TlsMode::Reality => {
            proxy.tls = Some(true);
            proxy.servername = owned(record.text("sni"));
            proxy.client_fingerprint = Some(record.text("fingerprint").unwrap_or("chrome").to_string());
            proxy.reality_opts = Some(RealityOpts {
                public_key: record.text("public_key").unwrap_or_default().to_string(),
                short_id: owned(record.text("short_id")),
            });
        }
    }
}

pub fn encode(records: &[ExportRecord]) -> Result<String> {
    let proxies: Vec<Proxy> = records.iter().map(proxy).collect();
    let document = Document {
        proxy_groups: vec![ProxyGroup {
            name: GROUP_NAME.to_string(),
            kind: "select".to_string(),
            proxies: proxies.iter().map(|p| p.name.clone()).collect(),
        }],
        proxies,
    };
    Ok(serde_yaml::to_string(&document)?)
}
