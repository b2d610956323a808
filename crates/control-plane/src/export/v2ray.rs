//! Share-link list, one URI per record, base64-wrapped as a whole.

use base64::{Engine as _, engine::general_purpose::STANDARD};
use common::api::{Protocol, TlsMode, Transport};
use serde_json::json;

use super::ExportRecord;

pub fn encode(records: &[ExportRecord]) -> String {
    let links: Vec<String> = records.iter().map(link).collect();
    STANDARD.encode(links.join("\n"))
}

pub fn link(record: &ExportRecord) -> String {
    match record.protocol {
        Protocol::Vless => {
            let user = record.text("uuid").unwrap_or_default();
            url_link("vless", user, record, true)
        }
        Protocol::Trojan => {
            let user = record.text("password").unwrap_or_default();
            url_link("trojan", user, record, false)
        }
        Protocol::Vmess => vmess_link(record),
        Protocol::Shadowsocks => shadowsocks_link(record),
        Protocol::Hysteria2 => hysteria2_link(record),
    }
}

fn authority(record: &ExportRecord) -> String {
    if record.address.contains(':') {
        format!("[{}]:{}", record.address, record.port)
    } else {
        format!("{}:{}", record.address, record.port)
    }
}

fn fragment(record: &ExportRecord) -> String {
    urlencoding::encode(&record.name).into_owned()
}

fn network(transport: Transport) -> &'static str {
    match transport {
        Transport::H2 => "http",
        other => other.as_str(),
    }
}

fn security(tls_mode: TlsMode) -> &'static str {
    match tls_mode {
        TlsMode::None => "none",
        TlsMode::Tls => "tls",
        TlsMode::Reality => "reality",
    }
}

fn url_link(scheme: &str, user: &str, record: &ExportRecord, vless: bool) -> String {
    let mut query = url::form_urlencoded::Serializer::new(String::new());
    query.append_pair("type", network(record.transport));
    query.append_pair("security", security(record.tls_mode));
    if vless {
        query.append_pair("encryption", "none");
    }

    match record.transport {
        Transport::Grpc => {
            query.append_pair("serviceName", record.text("service_name").unwrap_or("grpc"));
            let mode = if record.flag("multi_mode") { "multi" } else { "gun" };
            query.append_pair("mode", mode);
        }
        Transport::Ws | Transport::Httpupgrade | Transport::Splithttp | Transport::H2 => {
            query.append_pair("host", record.host_header());
            query.append_pair("path", record.path());
        }
        Transport::Tcp => {
            if record.text("header_type") == Some("http") {
                query.append_pair("headerType", "http");
            }
        }
        Transport::Udp => {}
    }

    match record.tls_mode {
        TlsMode::Tls => {
            query.append_pair("sni", record.server_name());
            if let Some(fp) = record.text("fingerprint") {
                query.append_pair("fp", fp);
            }
            let alpn = record.list("alpn");
            if !alpn.is_empty() {
                query.append_pair("alpn", &alpn.join(","));
            }
            if record.flag("allow_insecure") {
                query.append_pair("allowInsecure", "1");
            }
        }
        TlsMode::Reality => {
            query.append_pair("sni", record.text("sni").unwrap_or_default());
            query.append_pair("fp", record.text("fingerprint").unwrap_or("chrome"));
            query.append_pair("pbk", record.text("public_key").unwrap_or_default());
            if let Some(sid) = record.text("short_id") {
                query.append_pair("sid", sid);
            }
            if let Some(spx) = record.text("spider_x") {
                query.append_pair("spx", spx);
            }
        }
        TlsMode::None => {}
    }

    if vless && let Some(flow) = record.text("flow") {
        query.append_pair("flow", flow);
    }

    format!(
        "{scheme}://{}@{}?{}#{}",
        urlencoding::encode(user),
        authority(record),
        query.finish(),
        fragment(record)
    )
}

fn vmess_link(record: &ExportRecord) -> String {
    let grpc = record.transport == Transport::Grpc;
    let path = if grpc {
        record.text("service_name").unwrap_or("grpc")
    } else {
        record.path()
    };
    let tls = record.tls_mode != TlsMode::None;
    let body = json!({
        "v": "2",
        "ps": record.name,
        "add": record.address,
        "port": record.port.to_string(),
        "id": record.text("uuid").unwrap_or_default(),
        "aid": record.number("alter_id").unwrap_or(0).to_string(),
        "scy": record.text("encryption").unwrap_or("auto"),
        "net": network(record.transport),
        "type": if grpc { "gun" } else { "none" },
        "host": if grpc { "" } else { record.host_header() },
        "path": path,
        "tls": if tls { "tls" } else { "" },
        "sni": if tls { record.server_name() } else { "" },
        "fp": record.text("fingerprint").unwrap_or_default(),
        "alpn": record.list("alpn").join(","),
    });
    format!("vmess://{}", STANDARD.encode(body.to_string()))
}

fn shadowsocks_link(record: &ExportRecord) -> String {
    let method = record.text("method").unwrap_or("2022-blake3-aes-128-gcm");
    let password = record.text("password").unwrap_or_default();
    let userinfo = STANDARD.encode(format!("{method}:{password}"));
    format!("ss://{userinfo}@{}#{}", authority(record), fragment(record))
}

fn hysteria2_link(record: &ExportRecord) -> String {
    let mut query = url::form_urlencoded::Serializer::new(String::new());
    query.append_pair("sni", record.server_name());
    if let Some(obfs) = record.text("obfs_type") {
        query.append_pair("obfs", obfs);
        query.append_pair("obfs-password", record.text("obfs_password").unwrap_or_default());
    }
    if record.flag("allow_insecure") {
        query.append_pair("insecure", "1");
    }
    format!(
        "hysteria2://{}@{}?{}#{}",
        urlencoding::encode(record.text("password").unwrap_or_default()),
        authority(record),
        query.finish(),
        fragment(record)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::export::fixtures::{record, vless_ws_tls};

    #[test]
    fn vless_ws_link_carries_transport_and_tls() {
        let link = link(&vless_ws_tls());
        assert!(link.starts_with("vless://11111111-2222-3333-4444-555555555555@edge.example.com:443?"));
        assert!(link.contains("type=ws"));
        assert!(link.contains("security=tls"));
        assert!(link.contains("encryption=none"));
        assert!(link.contains("path=%2F%3Fed%3D2560"));
        assert!(link.contains("sni=edge.example.com"));
        assert!(link.contains("alpn=h2%2Chttp%2F1.1"));
        assert!(link.ends_with("#node-vless"));
    }

    #[test]
    fn plaintext_record_has_no_sni() {
        let mut plain = vless_ws_tls();
        plain.tls_mode = TlsMode::None;
        let link = link(&plain);
        assert!(link.contains("security=none"));
        assert!(!link.contains("sni="));
    }

    #[test]
    fn reality_link_carries_public_key_only() {
        let reality = record(
            Protocol::Vless,
            Transport::Tcp,
            TlsMode::Reality,
            json!({
                "uuid": "u-1",
                "sni": "www.microsoft.com",
                "public_key": "PUBKEY",
                "short_id": "ab12",
                "flow": "xtls-rprx-vision",
            }),
        );
        let link = link(&reality);
        assert!(link.contains("security=reality"));
        assert!(link.contains("pbk=PUBKEY"));
        assert!(link.contains("sid=ab12"));
        assert!(link.contains("flow=xtls-rprx-vision"));
    }

    #[test]
    fn vmess_grpc_uses_service_name_as_path() {
        let vmess = record(
            Protocol::Vmess,
            Transport::Grpc,
            TlsMode::Tls,
            json!({"uuid": "u-2", "service_name": "svc", "alter_id": 0}),
        );
        let link = link(&vmess);
        let encoded = link.strip_prefix("vmess://").unwrap();
        let decoded: serde_json::Value =
            serde_json::from_slice(&STANDARD.decode(encoded).unwrap()).unwrap();
        assert_eq!(decoded["path"], "svc");
        assert_eq!(decoded["type"], "gun");
        assert_eq!(decoded["net"], "grpc");
        assert_eq!(decoded["tls"], "tls");
        assert_eq!(decoded["port"], "443");
    }

    #[test]
    fn shadowsocks_and_hysteria2_links() {
        let ss = record(
            Protocol::Shadowsocks,
            Transport::Tcp,
            TlsMode::None,
            json!({"method": "aes-256-gcm", "password": "pw"}),
        );
        assert_eq!(
            link(&ss),
            "ss://YWVzLTI1Ni1nY206cHc=@edge.example.com:443#node-shadowsocks"
        );

        let hy2 = record(
            Protocol::Hysteria2,
            Transport::Udp,
            TlsMode::Tls,
            json!({"password": "pw", "sni": "hy.example.com", "obfs_type": "salamander", "obfs_password": "ob"}),
        );
        let link = link(&hy2);
        assert!(link.starts_with("hysteria2://pw@edge.example.com:443?sni=hy.example.com"));
        assert!(link.contains("obfs=salamander&obfs-password=ob"));
    }

    #[test]
    fn batch_is_base64_of_newline_joined_links() {
        let records = vec![vless_ws_tls(), vless_ws_tls()];
        let decoded = String::from_utf8(STANDARD.decode(encode(&records)).unwrap()).unwrap();
        assert_eq!(decoded.lines().count(), 2);
    }
}
