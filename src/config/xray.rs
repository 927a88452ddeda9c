//! Xray proxy config rewriting.
//!
//! Only the designated outbound is touched: the element tagged `proxy`, or failing
//! that the first `vless` outbound. Everything else in the document is preserved
//! (key order included, via serde_json's `preserve_order`).

use std::path::{Path, PathBuf};

use serde_json::{json, Map, Value};
use tracing::{debug, info};

use crate::common::error::AgentError;
use crate::common::fs::write_atomic;
use crate::config::subscription::Server;

pub const PROXY_TAG: &str = "proxy";

/// What the designated outbound currently points at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundIdentity {
    pub address: String,
    pub port: u16,
    pub uuid: Option<String>,
}

impl OutboundIdentity {
    pub fn matches(&self, server: &Server) -> bool {
        self.address.eq_ignore_ascii_case(&server.address) && self.port == server.port
    }
}

/// Reads and rewrites the proxy config file at a fixed path.
#[derive(Debug, Clone)]
pub struct XrayConfigWriter {
    path: PathBuf,
}

impl XrayConfigWriter {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current file bytes, used as the rollback snapshot.
    pub fn read_raw(&self) -> Result<Vec<u8>, AgentError> {
        std::fs::read(&self.path).map_err(|e| {
            AgentError::ConfigWriteFailed(format!("cannot read {}: {}", self.path.display(), e))
        })
    }

    /// Rewrite the designated outbound from `server` and write the file atomically.
    pub fn apply(&self, server: &Server) -> Result<(), AgentError> {
        let raw = self.read_raw()?;
        let updated = render_with_server(&raw, server)?;
        write_atomic(&self.path, &updated).map_err(|e| {
            AgentError::ConfigWriteFailed(format!("cannot write {}: {}", self.path.display(), e))
        })?;
        info!(
            path = %self.path.display(),
            server = %server.id,
            endpoint = %server.endpoint(),
            "proxy outbound rewritten"
        );
        Ok(())
    }

    /// Put previously captured bytes back.
    pub fn restore(&self, snapshot: &[u8]) -> std::io::Result<()> {
        write_atomic(&self.path, snapshot)?;
        debug!(path = %self.path.display(), "proxy config restored from snapshot");
        Ok(())
    }

    /// Endpoint of the designated outbound, if the file has one.
    pub fn current_endpoint(&self) -> Result<Option<OutboundIdentity>, AgentError> {
        let raw = self.read_raw()?;
        let doc: Value = serde_json::from_slice(&raw)
            .map_err(|e| AgentError::ConfigWriteFailed(format!("malformed JSON: {}", e)))?;
        Ok(outbound_endpoint(&doc))
    }
}

/// Pure transformation: old file bytes + server → new file bytes.
pub fn render_with_server(raw: &[u8], server: &Server) -> Result<Vec<u8>, AgentError> {
    let mut doc: Value = serde_json::from_slice(raw)
        .map_err(|e| AgentError::ConfigWriteFailed(format!("malformed JSON: {}", e)))?;
    rewrite_outbound(&mut doc, server).map_err(AgentError::ConfigWriteFailed)?;
    let mut out = serde_json::to_vec_pretty(&doc)
        .map_err(|e| AgentError::ConfigWriteFailed(format!("serialize failed: {}", e)))?;
    out.push(b'\n');
    Ok(out)
}

/// Index of the outbound to rewrite.
pub fn find_proxy_outbound(doc: &Value) -> Option<usize> {
    let outbounds = doc.get("outbounds")?.as_array()?;
    outbounds
        .iter()
        .position(|ob| ob.get("tag").and_then(Value::as_str) == Some(PROXY_TAG))
        .or_else(|| {
            outbounds
                .iter()
                .position(|ob| ob.get("protocol").and_then(Value::as_str) == Some("vless"))
        })
}

pub fn outbound_endpoint(doc: &Value) -> Option<OutboundIdentity> {
    let idx = find_proxy_outbound(doc)?;
    let vnext = doc["outbounds"][idx]
        .get("settings")?
        .get("vnext")?
        .get(0)?;
    let address = vnext.get("address")?.as_str()?.to_string();
    let port = vnext.get("port")?.as_u64().and_then(|p| u16::try_from(p).ok())?;
    let uuid = vnext
        .get("users")
        .and_then(|u| u.get(0))
        .and_then(|u| u.get("id"))
        .and_then(Value::as_str)
        .map(str::to_string);
    Some(OutboundIdentity { address, port, uuid })
}

pub fn rewrite_outbound(doc: &mut Value, server: &Server) -> Result<(), String> {
    if doc.get("outbounds").and_then(Value::as_array).is_none() {
        return Err("config has no outbounds array".to_string());
    }
    let idx = find_proxy_outbound(doc)
        .ok_or_else(|| format!("no outbound tagged '{}' and no vless outbound", PROXY_TAG))?;

    let outbound = doc["outbounds"][idx]
        .as_object_mut()
        .ok_or_else(|| "proxy outbound is not an object".to_string())?;
    outbound.insert("protocol".to_string(), json!("vless"));

    let settings = object_entry(outbound, "settings")?;
    let vnext = array_entry(settings, "vnext")?;
    let target = first_object(vnext)?;
    target.insert("address".to_string(), json!(server.address));
    target.insert("port".to_string(), json!(server.port));

    let users = array_entry(target, "users")?;
    let user = first_object(users)?;
    user.insert("id".to_string(), json!(server.uuid));
    let encryption = server
        .transport
        .encryption
        .as_deref()
        .filter(|s| !s.is_empty())
        .unwrap_or("none");
    user.insert("encryption".to_string(), json!(encryption));
    match server.transport.flow.as_deref().filter(|s| !s.is_empty()) {
        Some(flow) => {
            user.insert("flow".to_string(), json!(flow));
        }
        None => {
            user.remove("flow");
        }
    }

    // sockopt 属于路由器本地设置（mark、interface），保留
    let sockopt = outbound
        .get("streamSettings")
        .and_then(|s| s.get("sockopt"))
        .cloned();
    let mut stream = build_stream_settings(server);
    if let (Some(sockopt), Some(obj)) = (sockopt, stream.as_object_mut()) {
        obj.insert("sockopt".to_string(), sockopt);
    }
    outbound.insert("streamSettings".to_string(), stream);

    Ok(())
}

fn object_entry<'a>(
    parent: &'a mut Map<String, Value>,
    key: &str,
) -> Result<&'a mut Map<String, Value>, String> {
    let slot = parent
        .entry(key.to_string())
        .or_insert_with(|| Value::Object(Map::new()));
    if !slot.is_object() {
        *slot = Value::Object(Map::new());
    }
    slot.as_object_mut()
        .ok_or_else(|| format!("'{}' is not an object", key))
}

fn array_entry<'a>(
    parent: &'a mut Map<String, Value>,
    key: &str,
) -> Result<&'a mut Vec<Value>, String> {
    let slot = parent
        .entry(key.to_string())
        .or_insert_with(|| Value::Array(Vec::new()));
    if !slot.is_array() {
        *slot = Value::Array(Vec::new());
    }
    slot.as_array_mut()
        .ok_or_else(|| format!("'{}' is not an array", key))
}

fn first_object(items: &mut Vec<Value>) -> Result<&mut Map<String, Value>, String> {
    if items.is_empty() {
        items.push(Value::Object(Map::new()));
    }
    if !items[0].is_object() {
        items[0] = Value::Object(Map::new());
    }
    items[0]
        .as_object_mut()
        .ok_or_else(|| "first element is not an object".to_string())
}

/// `streamSettings` for a server: network, security and the matching sub-objects.
pub fn build_stream_settings(server: &Server) -> Value {
    let t = &server.transport;
    let network = t.network_or_default();
    let security = t.security_or_default();

    let mut stream = Map::new();
    stream.insert("network".to_string(), json!(network));
    stream.insert("security".to_string(), json!(security));

    match security {
        "reality" => {
            let mut reality = Map::new();
            reality.insert("serverName".to_string(), json!(t.sni.clone().unwrap_or_default()));
            reality.insert(
                "fingerprint".to_string(),
                json!(t.fingerprint.clone().unwrap_or_else(|| "chrome".to_string())),
            );
            reality.insert(
                "publicKey".to_string(),
                json!(t.public_key.clone().unwrap_or_default()),
            );
            reality.insert(
                "shortId".to_string(),
                json!(t.short_id.clone().unwrap_or_default()),
            );
            if let Some(spx) = t.extra.get("spx") {
                reality.insert("spiderX".to_string(), json!(spx));
            }
            stream.insert("realitySettings".to_string(), Value::Object(reality));
        }
        "tls" => {
            let mut tls = Map::new();
            let server_name = t
                .sni
                .clone()
                .or_else(|| t.host.clone())
                .unwrap_or_else(|| server.address.clone());
            tls.insert("serverName".to_string(), json!(server_name));
            if let Some(fp) = t.fingerprint.as_deref().filter(|s| !s.is_empty()) {
                tls.insert("fingerprint".to_string(), json!(fp));
            }
            if let Some(alpn) = t.alpn.as_deref().filter(|s| !s.is_empty()) {
                let list: Vec<&str> = alpn.split(',').map(str::trim).collect();
                tls.insert("alpn".to_string(), json!(list));
            }
            tls.insert("allowInsecure".to_string(), json!(false));
            stream.insert("tlsSettings".to_string(), Value::Object(tls));
        }
        _ => {}
    }

    let path = t.path.clone().filter(|s| !s.is_empty());
    let host = t.host.clone().filter(|s| !s.is_empty());

    match network {
        "tcp" | "raw" => {
            if t.header_type.as_deref() == Some("http") {
                let mut request = Map::new();
                request.insert(
                    "path".to_string(),
                    json!([path.clone().unwrap_or_else(|| "/".to_string())]),
                );
                if let Some(h) = &host {
                    let hosts: Vec<&str> = h.split(',').map(str::trim).collect();
                    request.insert("headers".to_string(), json!({ "Host": hosts }));
                }
                stream.insert(
                    "tcpSettings".to_string(),
                    json!({ "header": { "type": "http", "request": Value::Object(request) } }),
                );
            }
        }
        "ws" => {
            let mut ws = Map::new();
            ws.insert(
                "path".to_string(),
                json!(path.unwrap_or_else(|| "/".to_string())),
            );
            if let Some(h) = host {
                ws.insert("headers".to_string(), json!({ "Host": h }));
            }
            stream.insert("wsSettings".to_string(), Value::Object(ws));
        }
        "grpc" => {
            let service = t
                .extra
                .get("serviceName")
                .cloned()
                .or(path)
                .unwrap_or_default();
            let multi = t.extra.get("mode").map(String::as_str) == Some("multi");
            stream.insert(
                "grpcSettings".to_string(),
                json!({ "serviceName": service, "multiMode": multi }),
            );
        }
        "h2" | "http" => {
            let mut http = Map::new();
            http.insert(
                "path".to_string(),
                json!(path.unwrap_or_else(|| "/".to_string())),
            );
            if let Some(h) = host {
                let hosts: Vec<&str> = h.split(',').map(str::trim).collect();
                http.insert("host".to_string(), json!(hosts));
            }
            stream.insert("httpSettings".to_string(), Value::Object(http));
        }
        "xhttp" | "splithttp" => {
            let mut xhttp = Map::new();
            xhttp.insert(
                "path".to_string(),
                json!(path.unwrap_or_else(|| "/".to_string())),
            );
            if let Some(h) = host {
                xhttp.insert("host".to_string(), json!(h));
            }
            xhttp.insert(
                "mode".to_string(),
                json!(t.extra.get("mode").cloned().unwrap_or_else(|| "auto".to_string())),
            );
            stream.insert("xhttpSettings".to_string(), Value::Object(xhttp));
        }
        "httpupgrade" => {
            let mut upgrade = Map::new();
            upgrade.insert(
                "path".to_string(),
                json!(path.unwrap_or_else(|| "/".to_string())),
            );
            if let Some(h) = host {
                upgrade.insert("host".to_string(), json!(h));
            }
            stream.insert("httpupgradeSettings".to_string(), Value::Object(upgrade));
        }
        "kcp" | "mkcp" => {
            let mut kcp = Map::new();
            kcp.insert(
                "header".to_string(),
                json!({ "type": t.header_type.clone().unwrap_or_else(|| "none".to_string()) }),
            );
            if let Some(seed) = t.extra.get("seed") {
                kcp.insert("seed".to_string(), json!(seed));
            }
            stream.insert("kcpSettings".to_string(), Value::Object(kcp));
        }
        _ => {}
    }

    Value::Object(stream)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::subscription::parse_vless_uri;

    const REALITY: &str = "vless://ec82bca8-1072-4682-822f-30306af408ea@1.2.3.4:443?type=tcp&security=reality&sni=example.com&pbk=k&sid=s&fp=chrome&flow=xtls-rprx-vision#Test%20Server";

    fn sample_config() -> Value {
        json!({
            "log": { "loglevel": "warning" },
            "outbounds": [
                { "tag": "direct", "protocol": "freedom" },
                {
                    "tag": "proxy",
                    "protocol": "vless",
                    "settings": {
                        "vnext": [{
                            "address": "9.9.9.9",
                            "port": 8443,
                            "users": [{ "id": "00000000-0000-0000-0000-000000000000", "encryption": "none", "flow": "old" }]
                        }]
                    },
                    "streamSettings": { "network": "ws", "sockopt": { "mark": 255 } }
                },
                { "tag": "block", "protocol": "blackhole" }
            ]
        })
    }

    #[test]
    fn rewrites_tagged_outbound() {
        let server = parse_vless_uri(REALITY).unwrap();
        let mut doc = sample_config();
        rewrite_outbound(&mut doc, &server).unwrap();

        let vnext = &doc["outbounds"][1]["settings"]["vnext"][0];
        assert_eq!(vnext["address"], "1.2.3.4");
        assert_eq!(vnext["port"], 443);
        assert_eq!(vnext["users"][0]["id"], "ec82bca8-1072-4682-822f-30306af408ea");
        assert_eq!(vnext["users"][0]["flow"], "xtls-rprx-vision");

        let stream = &doc["outbounds"][1]["streamSettings"];
        assert_eq!(stream["network"], "tcp");
        assert_eq!(stream["security"], "reality");
        assert_eq!(stream["realitySettings"]["serverName"], "example.com");
        assert_eq!(stream["realitySettings"]["publicKey"], "k");
        assert_eq!(stream["realitySettings"]["shortId"], "s");
        assert_eq!(stream["realitySettings"]["fingerprint"], "chrome");
        assert_eq!(stream["sockopt"]["mark"], 255);
        assert!(stream.get("wsSettings").is_none());

        // untouched neighbours
        assert_eq!(doc["outbounds"][0], json!({ "tag": "direct", "protocol": "freedom" }));
        assert_eq!(doc["outbounds"][2]["tag"], "block");
        assert_eq!(doc["log"]["loglevel"], "warning");
    }

    #[test]
    fn falls_back_to_first_vless_outbound() {
        let mut doc = json!({
            "outbounds": [
                { "tag": "direct", "protocol": "freedom" },
                { "tag": "vless-reality", "protocol": "vless", "settings": {} }
            ]
        });
        assert_eq!(find_proxy_outbound(&doc), Some(1));
        let server = parse_vless_uri(REALITY).unwrap();
        rewrite_outbound(&mut doc, &server).unwrap();
        let identity = outbound_endpoint(&doc).unwrap();
        assert_eq!((identity.address.as_str(), identity.port), ("1.2.3.4", 443));
        assert!(identity.matches(&server));
    }

    #[test]
    fn missing_outbound_is_error() {
        let server = parse_vless_uri(REALITY).unwrap();
        let mut doc = json!({ "outbounds": [{ "tag": "direct", "protocol": "freedom" }] });
        assert!(rewrite_outbound(&mut doc, &server).is_err());

        let mut doc = json!({ "inbounds": [] });
        assert!(rewrite_outbound(&mut doc, &server).is_err());
    }

    #[test]
    fn flow_removed_when_absent() {
        let server = parse_vless_uri(
            "vless://ec82bca8-1072-4682-822f-30306af408ea@5.6.7.8:443?type=ws&security=tls&sni=cdn.example.com&path=%2Fray&host=cdn.example.com&alpn=h2%2Chttp%2F1.1#ws",
        )
        .unwrap();
        let mut doc = sample_config();
        rewrite_outbound(&mut doc, &server).unwrap();

        let user = &doc["outbounds"][1]["settings"]["vnext"][0]["users"][0];
        assert!(user.get("flow").is_none());

        let stream = &doc["outbounds"][1]["streamSettings"];
        assert_eq!(stream["security"], "tls");
        assert_eq!(stream["tlsSettings"]["serverName"], "cdn.example.com");
        assert_eq!(stream["tlsSettings"]["alpn"], json!(["h2", "http/1.1"]));
        assert_eq!(stream["wsSettings"]["path"], "/ray");
        assert_eq!(stream["wsSettings"]["headers"]["Host"], "cdn.example.com");
    }

    #[test]
    fn security_none_has_no_sub_object() {
        let server = parse_vless_uri(
            "vless://ec82bca8-1072-4682-822f-30306af408ea@5.6.7.8:80?type=grpc&serviceName=svc#g",
        )
        .unwrap();
        let stream = build_stream_settings(&server);
        assert_eq!(stream["security"], "none");
        assert!(stream.get("tlsSettings").is_none());
        assert!(stream.get("realitySettings").is_none());
        assert_eq!(stream["grpcSettings"]["serviceName"], "svc");
    }

    #[test]
    fn tcp_http_header() {
        let server = parse_vless_uri(
            "vless://ec82bca8-1072-4682-822f-30306af408ea@5.6.7.8:80?type=tcp&headerType=http&host=a.com%2Cb.com&path=%2Findex#h",
        )
        .unwrap();
        let stream = build_stream_settings(&server);
        let request = &stream["tcpSettings"]["header"]["request"];
        assert_eq!(request["path"], json!(["/index"]));
        assert_eq!(request["headers"]["Host"], json!(["a.com", "b.com"]));
    }

    #[test]
    fn writer_apply_and_restore() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("04_outbounds.json");
        let original = serde_json::to_vec_pretty(&sample_config()).unwrap();
        std::fs::write(&path, &original).unwrap();

        let writer = XrayConfigWriter::new(&path);
        let before = writer.current_endpoint().unwrap().unwrap();
        assert_eq!((before.address.as_str(), before.port), ("9.9.9.9", 8443));
        assert_eq!(
            before.uuid.as_deref(),
            Some("00000000-0000-0000-0000-000000000000")
        );

        let snapshot = writer.read_raw().unwrap();
        writer.apply(&parse_vless_uri(REALITY).unwrap()).unwrap();
        let after = writer.current_endpoint().unwrap().unwrap();
        assert_eq!((after.address.as_str(), after.port), ("1.2.3.4", 443));

        writer.restore(&snapshot).unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), original);
    }

    #[test]
    fn apply_on_malformed_file_leaves_it_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, b"{ broken").unwrap();

        let writer = XrayConfigWriter::new(&path);
        let err = writer.apply(&parse_vless_uri(REALITY).unwrap()).unwrap_err();
        assert!(matches!(err, AgentError::ConfigWriteFailed(_)));
        assert_eq!(std::fs::read(&path).unwrap(), b"{ broken");
    }

    #[test]
    fn key_order_preserved() {
        let raw = br#"{"zeta":1,"outbounds":[{"tag":"proxy","protocol":"vless","settings":{}}],"alpha":2}"#;
        let server = parse_vless_uri(REALITY).unwrap();
        let out = String::from_utf8(render_with_server(raw, &server).unwrap()).unwrap();
        let zeta = out.find("\"zeta\"").unwrap();
        let outbounds = out.find("\"outbounds\"").unwrap();
        let alpha = out.find("\"alpha\"").unwrap();
        assert!(zeta < outbounds && outbounds < alpha);
    }
}
