//! sing-box outbound document.

use common::api::{Protocol, TlsMode, Transport};
use serde_json::{Map, Value, json};

use super::{ExportRecord, GROUP_NAME};
use crate::Result;

const DIRECT_TAG: &str = "direct";

pub fn encode(records: &[ExportRecord]) -> Result<String> {
    let tags: Vec<&str> = records.iter().map(|record| record.name.as_str()).collect();
    let mut outbounds = vec![json!({
        "tag": GROUP_NAME,
        "type": "selector",
        "outbounds": tags,
    })];
    outbounds.extend(records.iter().map(outbound));
    outbounds.push(json!({ "tag": DIRECT_TAG, "type": DIRECT_TAG }));

    Ok(serde_json::to_string_pretty(&json!({ "outbounds": outbounds }))?)
}

fn outbound(record: &ExportRecord) -> Value {
    let mut out = Map::new();
    out.insert("tag".into(), json!(record.name));
    out.insert("server".into(), json!(record.address));
    out.insert("server_port".into(), json!(record.port));

    match record.protocol {
        Protocol::Vless => {
            out.insert("type".into(), json!("vless"));
            out.insert("uuid".into(), json!(record.text("uuid").unwrap_or_default()));
            if let Some(flow) = record.text("flow") {
                out.insert("flow".into(), json!(flow));
            }
        }
        Protocol::Trojan => {
            out.insert("type".into(), json!("trojan"));
            out.insert("password".into(), json!(record.text("password").unwrap_or_default()));
        }
        Protocol::Vmess => {
            out.insert("type".into(), json!("vmess"));
            out.insert("uuid".into(), json!(record.text("uuid").unwrap_or_default()));
            out.insert("alter_id".into(), json!(record.number("alter_id").unwrap_or(0)));
            out.insert("security".into(), json!(record.text("encryption").unwrap_or("auto")));
        }
        Protocol::Shadowsocks => {
            out.insert("type".into(), json!("shadowsocks"));
            out.insert("method".into(), json!(record.text("method").unwrap_or_default()));
            out.insert("password".into(), json!(record.text("password").unwrap_or_default()));
        }
        Protocol::Hysteria2 => {
            out.insert("type".into(), json!("hysteria2"));
            out.insert("password".into(), json!(record.text("password").unwrap_or_default()));
            if let Some(up) = record.number("up_mbps") {
                out.insert("up_mbps".into(), json!(up));
            }
            if let Some(down) = record.number("down_mbps") {
                out.insert("down_mbps".into(), json!(down));
            }
            if let Some(kind) = record.text("obfs_type") {
                out.insert(
                    "obfs".into(),
                    json!({
                        "type": kind,
                        "password": record.text("obfs_password").unwrap_or_default(),
                    }),
                );
            }
        }
    }

    if let Some(tls) = tls_block(record) {
        out.insert("tls".into(), tls);
    }
    if let Some(transport) = transport_block(record) {
        out.insert("transport".into(), transport);
    }
    Value::Object(out)
}

fn tls_block(record: &ExportRecord) -> Option<Value> {
    let mode = match (record.protocol, record.tls_mode) {
        (Protocol::Hysteria2, TlsMode::None) => TlsMode::Tls,
        (_, mode) => mode,
    };
    match mode {
        TlsMode::None => None,
        TlsMode::Tls => {
            let mut tls = json!({
                "enabled": true,
                "server_name": record.server_name(),
                "insecure": record.flag("allow_insecure"),
            });
            if let Some(fingerprint) = record.text("fingerprint") {
                tls["utls"] = json!({ "enabled": true, "fingerprint": fingerprint });
            }
            let alpn = record.list("alpn");
            if !alpn.is_empty() {
                tls["alpn"] = json!(alpn);
            }
            Some(tls)
        }
        TlsMode::Reality => Some(json!({
            "enabled": true,
            "server_name": record.text("sni").unwrap_or_default(),
            "utls": {
                "enabled": true,
                "fingerprint": record.text("fingerprint").unwrap_or("chrome"),
            },
            "reality": {
                "enabled": true,
                "public_key": record.text("public_key").unwrap_or_default(),
                "short_id": record.text("short_id").unwrap_or_default(),
            },
        })),
    }
}

fn transport_block(record: &ExportRecord) -> Option<Value> {
    let path = record.path();
    let host = record.host_header();
    match record.transport {
        Transport::Ws => {
            let early_data = record.number("max_early_data").unwrap_or(0);
            let mut ws = json!({
                "type": "ws",
                "path": path,
                "headers": { "Host": host },
            });
            if early_data > 0 {
                ws["max_early_data"] = json!(early_data);
                ws["early_data_header_name"] = json!(
                    record
                        .text("early_data_header")
                        .unwrap_or("Sec-WebSocket-Protocol")
                );
            }
            Some(ws)
        }
        Transport::Grpc => Some(json!({
            "type": "grpc",
            "service_name": record.text("service_name").unwrap_or("grpc"),
        })),
        Transport::H2 | Transport::Splithttp => Some(json!({
            "type": "http",
            "host": [host],
            "path": path,
        })),
        Transport::Httpupgrade => Some(json!({
            "type": "httpupgrade",
            "host": host,
            "path": path,
        })),
        Transport::Tcp | Transport::Udp => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::export::fixtures::{record, vless_ws_tls};

    fn parse(records: &[ExportRecord]) -> Value {
        serde_json::from_str(&encode(records).unwrap()).unwrap()
    }

    #[test]
    fn selector_first_direct_last() {
        let doc = parse(&[vless_ws_tls()]);
        let outbounds = doc["outbounds"].as_array().unwrap();
        assert_eq!(outbounds.len(), 3);
        assert_eq!(outbounds[0]["type"], "selector");
        assert_eq!(outbounds[0]["tag"], GROUP_NAME);
        assert_eq!(outbounds[0]["outbounds"], json!(["node-vless"]));
        assert_eq!(outbounds[2], json!({"tag": "direct", "type": "direct"}));
    }

    #[test]
    fn ws_tls_outbound_shape() {
        let mut vless = vless_ws_tls();
        vless.settings.insert("max_early_data".into(), json!(2560));
        let doc = parse(&[vless]);
        let out = &doc["outbounds"][1];
        assert_eq!(out["server_port"], 443);
        assert_eq!(out["tls"]["enabled"], true);
        assert_eq!(out["tls"]["server_name"], "edge.example.com");
        assert_eq!(out["tls"]["utls"]["fingerprint"], "chrome");
        assert_eq!(out["tls"]["alpn"], json!(["h2", "http/1.1"]));
        assert_eq!(out["transport"]["type"], "ws");
        assert_eq!(out["transport"]["headers"]["Host"], "edge.example.com");
        assert_eq!(out["transport"]["max_early_data"], 2560);
        assert_eq!(out["transport"]["early_data_header_name"], "Sec-WebSocket-Protocol");
    }

    #[test]
    fn plaintext_record_has_no_tls_block() {
        let mut vless = vless_ws_tls();
        vless.tls_mode = TlsMode::None;
        let doc = parse(&[vless]);
        assert!(doc["outbounds"][1].get("tls").is_none());
    }

    #[test]
    fn reality_h2_and_hysteria2() {
        let reality = record(
            Protocol::Vless,
            Transport::H2,
            TlsMode::Reality,
            json!({"uuid": "u", "public_key": "PK", "short_id": "ff", "sni": "www.microsoft.com", "path": "/h2"}),
        );
        let hy2 = record(
            Protocol::Hysteria2,
            Transport::Udp,
            TlsMode::Tls,
            json!({"password": "pw", "up_mbps": 10, "down_mbps": 20, "obfs_type": "salamander", "obfs_password": "o"}),
        );
        let doc = parse(&[reality, hy2]);
        let reality = &doc["outbounds"][1];
        assert_eq!(reality["tls"]["reality"]["public_key"], "PK");
        assert_eq!(reality["transport"], json!({"type": "http", "host": ["www.microsoft.com"], "path": "/h2"}));

        let hy2 = &doc["outbounds"][2];
        assert_eq!(hy2["up_mbps"], 10);
        assert_eq!(hy2["obfs"], json!({"type": "salamander", "password": "o"}));
        assert!(hy2.get("transport").is_none());
        assert_eq!(hy2["tls"]["enabled"], true);
    }

    #[test]
    fn hysteria2_always_carries_tls() {
        let hy2 = record(
            Protocol::Hysteria2,
            Transport::Udp,
            TlsMode::None,
            json!({"password": "pw", "sni": "hy.example.com"}),
        );
        let doc = parse(&[hy2]);
        assert_eq!(doc["outbounds"][1]["tls"]["enabled"], true);
    }
}
