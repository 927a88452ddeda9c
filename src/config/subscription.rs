//! 订阅解析
//!
//! Subscription body → base64 decode → one URI per line → [`Server`].
//! Only `vless://` descriptors are accepted; anything else is dropped with a warning.

use std::collections::{BTreeMap, HashSet};
use std::fmt::Write as _;
use std::net::{Ipv4Addr, Ipv6Addr};

use base64::alphabet;
use base64::engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig};
use base64::Engine;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, warn};

use crate::common::error::AgentError;

const VLESS_SCHEME: &str = "vless://";

/// One proxy endpoint decoded from a subscription line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Server {
    pub id: String,
    pub name: String,
    pub address: String,
    pub port: u16,
    pub uuid: String,
    #[serde(default)]
    pub transport: Transport,
    pub raw_uri: String,
}

/// Opaque transport attributes, copied through to the proxy config.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transport {
    /// `type` query key: tcp, ws, grpc, xhttp, ...
    pub network: Option<String>,
    /// `headerType` query key (tcp header obfuscation / kcp header).
    pub header_type: Option<String>,
    pub security: Option<String>,
    pub sni: Option<String>,
    pub alpn: Option<String>,
    pub fingerprint: Option<String>,
    pub path: Option<String>,
    pub host: Option<String>,
    pub flow: Option<String>,
    pub public_key: Option<String>,
    pub short_id: Option<String>,
    pub encryption: Option<String>,
    /// Unrecognised query keys, preserved but unused.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, String>,
}

impl Transport {
    fn set(&mut self, key: &str, value: String) {
        let slot = match key {
            "type" => &mut self.network,
            "headerType" => &mut self.header_type,
            "security" => &mut self.security,
            "sni" => &mut self.sni,
            "alpn" => &mut self.alpn,
            "fp" => &mut self.fingerprint,
            "path" => &mut self.path,
            "host" => &mut self.host,
            "flow" => &mut self.flow,
            "pbk" => &mut self.public_key,
            "sid" => &mut self.short_id,
            "encryption" => &mut self.encryption,
            _ => {
                self.extra.insert(key.to_string(), value);
                return;
            }
        };
        *slot = Some(value);
    }

    /// Known attributes as `(query key, value)` pairs, in a fixed order.
    pub fn query_pairs(&self) -> Vec<(&'static str, &str)> {
        let fields: [(&'static str, &Option<String>); 12] = [
            ("type", &self.network),
            ("security", &self.security),
            ("sni", &self.sni),
            ("alpn", &self.alpn),
            ("fp", &self.fingerprint),
            ("flow", &self.flow),
            ("path", &self.path),
            ("host", &self.host),
            ("pbk", &self.public_key),
            ("sid", &self.short_id),
            ("encryption", &self.encryption),
            ("headerType", &self.header_type),
        ];
        fields
            .into_iter()
            .filter_map(|(k, v)| v.as_deref().map(|v| (k, v)))
            .collect()
    }

    pub fn network_or_default(&self) -> &str {
        self.network.as_deref().filter(|s| !s.is_empty()).unwrap_or("tcp")
    }

    pub fn security_or_default(&self) -> &str {
        self.security.as_deref().filter(|s| !s.is_empty()).unwrap_or("none")
    }
}

impl Server {
    /// `host:port`, with brackets around IPv6 literals.
    pub fn endpoint(&self) -> String {
        format_endpoint(&self.address, self.port)
    }

    /// Re-serialise into a `vless://` URI. Unknown query keys are appended after the known ones.
    pub fn to_uri(&self) -> String {
        let mut uri = String::from(VLESS_SCHEME);
        uri.push_str(&percent_encode(&self.uuid));
        uri.push('@');
        uri.push_str(&self.endpoint());

        let mut pairs: Vec<(String, String)> = self
            .transport
            .query_pairs()
            .into_iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        pairs.extend(
            self.transport
                .extra
                .iter()
                .map(|(k, v)| (k.clone(), v.clone())),
        );
        if !pairs.is_empty() {
            uri.push('?');
            let query: Vec<String> = pairs
                .iter()
                .map(|(k, v)| format!("{}={}", percent_encode(k), percent_encode(v)))
                .collect();
            uri.push_str(&query.join("&"));
        }

        uri.push('#');
        uri.push_str(&percent_encode(&self.name));
        uri
    }
}

/// Deterministic short id: first 12 hex chars of SHA-256 over `address|port|uuid`.
pub fn server_id(address: &str, port: u16, uuid: &str) -> String {
    let digest = Sha256::digest(format!("{}|{}|{}", address, port, uuid).as_bytes());
    let mut hex = String::with_capacity(12);
    for byte in digest.iter().take(6) {
        let _ = write!(hex, "{:02x}", byte);
    }
    hex
}

/// Per-line rejection reason.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum UriError {
    #[error("unsupported scheme")]
    UnsupportedScheme,
    #[error("missing user info (uuid@)")]
    MissingUuid,
    #[error("invalid uuid: {0}")]
    InvalidUuid(String),
    #[error("missing host")]
    MissingHost,
    #[error("invalid host: {0}")]
    InvalidHost(String),
    #[error("invalid port: {0}")]
    InvalidPort(String),
}

/// Parse a single `vless://uuid@host:port?query#fragment` descriptor.
pub fn parse_vless_uri(line: &str) -> Result<Server, UriError> {
    let raw = line.trim();
    let rest = strip_scheme(raw).ok_or(UriError::UnsupportedScheme)?;

    let (main_part, fragment) = match rest.split_once('#') {
        Some((main, frag)) => (main, Some(frag)),
        None => (rest, None),
    };
    let (authority, query) = match main_part.split_once('?') {
        Some((auth, q)) => (auth, Some(q)),
        None => (main_part, None),
    };
    let authority = authority.trim_end_matches('/');

    let (user, host_port) = authority.rsplit_once('@').ok_or(UriError::MissingUuid)?;
    let uuid = percent_decode(user);
    if uuid.is_empty() {
        return Err(UriError::MissingUuid);
    }
    if !is_valid_uuid(&uuid) {
        return Err(UriError::InvalidUuid(uuid));
    }

    let (address, port) = parse_host_port(host_port)?;

    let mut transport = Transport::default();
    if let Some(q) = query {
        for pair in q.split('&').filter(|p| !p.is_empty()) {
            let (k, v) = pair.split_once('=').unwrap_or((pair, ""));
            transport.set(&percent_decode(k), percent_decode(v));
        }
    }

    let name = fragment
        .map(|f| percent_decode(f).trim().to_string())
        .filter(|n| !n.is_empty())
        .unwrap_or_else(|| format_endpoint(&address, port));

    Ok(Server {
        id: server_id(&address, port, &uuid),
        name,
        address,
        port,
        uuid,
        transport,
        raw_uri: raw.to_string(),
    })
}

fn strip_scheme(s: &str) -> Option<&str> {
    let head = s.get(..VLESS_SCHEME.len())?;
    if head.eq_ignore_ascii_case(VLESS_SCHEME) {
        s.get(VLESS_SCHEME.len()..)
    } else {
        None
    }
}

/// Canonical hyphenated form only (8-4-4-4-12 hex), case-insensitive.
pub fn is_valid_uuid(s: &str) -> bool {
    s.len() == uuid::fmt::Hyphenated::LENGTH && uuid::Uuid::parse_str(s).is_ok()
}

fn parse_host_port(s: &str) -> Result<(String, u16), UriError> {
    if s.is_empty() {
        return Err(UriError::MissingHost);
    }

    // IPv6: [::1]:port
    let (host, port_str) = if let Some(inner) = s.strip_prefix('[') {
        let (host, after) = inner
            .split_once(']')
            .ok_or_else(|| UriError::InvalidHost(s.to_string()))?;
        let port_str = after
            .strip_prefix(':')
            .ok_or_else(|| UriError::InvalidPort(String::new()))?;
        if host.parse::<Ipv6Addr>().is_err() {
            return Err(UriError::InvalidHost(host.to_string()));
        }
        (host, port_str)
    } else {
        let (host, port_str) = s
            .rsplit_once(':')
            .ok_or_else(|| UriError::InvalidPort(String::new()))?;
        if host.is_empty() {
            return Err(UriError::MissingHost);
        }
        if host.parse::<Ipv4Addr>().is_err() && !is_dns_name(host) {
            return Err(UriError::InvalidHost(host.to_string()));
        }
        (host, port_str)
    };

    if port_str.is_empty() || !port_str.chars().all(|c| c.is_ascii_digit()) {
        return Err(UriError::InvalidPort(port_str.to_string()));
    }
    let port: u16 = port_str
        .parse()
        .map_err(|_| UriError::InvalidPort(port_str.to_string()))?;
    if port == 0 {
        return Err(UriError::InvalidPort(port_str.to_string()));
    }

    Ok((host.to_string(), port))
}

fn is_dns_name(host: &str) -> bool {
    host.len() <= 253
        && host.split('.').all(|label| {
            !label.is_empty()
                && label.len() <= 63
                && label
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        })
}

fn format_endpoint(address: &str, port: u16) -> String {
    if address.contains(':') {
        format!("[{}]:{}", address, port)
    } else {
        format!("{}:{}", address, port)
    }
}

/// Percent-decode into UTF-8; invalid sequences are kept verbatim.
pub fn percent_decode(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            if let (Some(hi), Some(lo)) = (hex_value(bytes[i + 1]), hex_value(bytes[i + 2])) {
                out.push(hi << 4 | lo);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn hex_value(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}

fn percent_encode(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for byte in s.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' | b'/' | b',' => {
                out.push(byte as char)
            }
            _ => {
                let _ = write!(out, "%{:02X}", byte);
            }
        }
    }
    out
}

fn subscription_engine() -> GeneralPurpose {
    GeneralPurpose::new(
        &alphabet::STANDARD,
        GeneralPurposeConfig::new().with_decode_padding_mode(DecodePaddingMode::Indifferent),
    )
}

/// Base64-decode a subscription body (standard alphabet, padding optional, whitespace ignored).
pub fn decode_payload(body: &str) -> Result<String, AgentError> {
    let compact: String = body.chars().filter(|c| !c.is_whitespace()).collect();
    if compact.is_empty() {
        return Ok(String::new());
    }
    let bytes = subscription_engine()
        .decode(compact.as_bytes())
        .map_err(|e| AgentError::DecodeFailed(e.to_string()))?;
    String::from_utf8(bytes).map_err(|e| AgentError::DecodeFailed(format!("not UTF-8: {}", e)))
}

/// Result of parsing a decoded subscription payload.
#[derive(Debug, Clone, Default)]
pub struct ParseOutcome {
    pub servers: Vec<Server>,
    /// (1-based line number, reason)
    pub rejected: Vec<(usize, UriError)>,
    pub duplicates: usize,
}

/// Parse every non-empty line; keep the first occurrence of each id.
pub fn parse_lines(decoded: &str) -> ParseOutcome {
    let mut outcome = ParseOutcome::default();
    let mut seen = HashSet::new();

    for (idx, line) in decoded.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match parse_vless_uri(line) {
            Ok(server) => {
                if seen.insert(server.id.clone()) {
                    outcome.servers.push(server);
                } else {
                    outcome.duplicates += 1;
                }
            }
            Err(e) => outcome.rejected.push((idx + 1, e)),
        }
    }
    outcome
}

/// Full pipeline for one fetched body. An empty result is [`AgentError::NoServers`].
pub fn servers_from_body(body: &str) -> Result<(String, Vec<Server>), AgentError> {
    let decoded = decode_payload(body)?;
    let outcome = parse_lines(&decoded);

    for (line_no, reason) in &outcome.rejected {
        warn!(line = line_no, reason = %reason, "subscription line dropped");
    }
    if outcome.duplicates > 0 {
        debug!(count = outcome.duplicates, "duplicate servers dropped");
    }
    if outcome.servers.is_empty() {
        return Err(AgentError::NoServers);
    }
    Ok((decoded, outcome.servers))
}
