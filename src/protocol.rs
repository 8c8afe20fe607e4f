use std::collections::HashMap;
use std::time::{Duration, Instant};

use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine;
use bytes::BytesMut;
use sha1::{Digest, Sha1};

use crate::errors::WsError;
use crate::stream::{SliceRead, Transport};

const GUID: &[u8] = b"258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// reject a response header block that never terminates
const MAX_RESPONSE_HEADER_SIZE: usize = 32 * 1024;

/// how long a single bounded read may wait while collecting the response
const RESPONSE_READ_SLICE: Duration = Duration::from_millis(200);

/// cleartext or tls websocket scheme
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// `ws://`, default port 80
    WS,
    /// `wss://`, default port 443
    WSS,
}

impl Mode {
    /// port implied when the url does not carry one
    pub fn default_port(&self) -> u16 {
        match self {
            Mode::WS => 80,
            Mode::WSS => 443,
        }
    }

    /// whether the transport must be wrapped in tls
    pub fn is_secure(&self) -> bool {
        matches!(self, Mode::WSS)
    }
}

/// parsed `ws[s]://host[:port][/path][?query]` url
///
/// the parser is strict and does not percent-decode
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    /// scheme, decides whether tls is required
    pub mode: Mode,
    /// peer host, never empty
    pub host: String,
    /// peer port, explicit or the scheme default
    pub port: u16,
    /// request path including the leading `/`
    pub path: String,
    /// query string without the leading `?`, empty when absent
    pub query: String,
}

impl Endpoint {
    /// decompose and validate a websocket url
    pub fn parse(url: &str) -> Result<Self, WsError> {
        let (scheme, rest) = url
            .split_once("://")
            .ok_or_else(|| WsError::InvalidUrl(format!("missing scheme in `{url}`")))?;
        let mode = match scheme.to_ascii_lowercase().as_str() {
            "ws" => Mode::WS,
            "wss" => Mode::WSS,
            s => return Err(WsError::InvalidUrl(format!("unknown scheme `{s}`"))),
        };
        let (authority, path_and_query) = match rest.find('/') {
            Some(idx) => (&rest[..idx], &rest[idx..]),
            None => (rest, "/"),
        };
        let (host, port) = match authority.split_once(':') {
            Some((host, port)) => {
                if port.is_empty() || !port.bytes().all(|b| b.is_ascii_digit()) {
                    return Err(WsError::InvalidUrl(format!("invalid port `{port}`")));
                }
                let port: u32 = port
                    .parse()
                    .map_err(|_| WsError::InvalidUrl(format!("invalid port `{port}`")))?;
                if port == 0 || port > u16::MAX as u32 {
                    return Err(WsError::InvalidUrl(format!("port {port} out of range")));
                }
                (host, port as u16)
            }
            None => (authority, mode.default_port()),
        };
        if host.is_empty() {
            return Err(WsError::InvalidUrl(format!("empty host in `{url}`")));
        }
        let (path, query) = match path_and_query.split_once('?') {
            Some((path, query)) => (path.to_string(), query.to_string()),
            None => (path_and_query.to_string(), String::new()),
        };
        Ok(Self {
            mode,
            host: host.to_string(),
            port,
            path,
            query,
        })
    }

    /// path plus query as it appears on the request line
    pub fn request_path(&self) -> String {
        if self.query.is_empty() {
            self.path.clone()
        } else {
            format!("{}?{}", self.path, self.query)
        }
    }

    /// `Host` header value, port appended only when non-default
    pub fn host_header(&self) -> String {
        if self.port == self.mode.default_port() {
            self.host.clone()
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

fn gen_key() -> String {
    let nonce: [u8; 16] = rand::random();
    B64.encode(nonce)
}

/// accept proof bound to the client nonce: `base64(sha1(key64 || guid))`
pub fn cal_accept_key(source: &str) -> String {
    let mut sha1 = Sha1::new();
    sha1.update(source.as_bytes());
    sha1.update(GUID);
    B64.encode(sha1.finalize())
}

pub(crate) fn build_request(
    endpoint: &Endpoint,
    headers: &HashMap<String, String>,
    extensions: &[(String, String)],
    key: &str,
) -> String {
    let mut lines = vec![
        format!("GET {} HTTP/1.1", endpoint.request_path()),
        format!("Host: {}", endpoint.host_header()),
        "Upgrade: websocket".to_string(),
        "Connection: Upgrade".to_string(),
        format!("Sec-WebSocket-Key: {key}"),
        "Sec-WebSocket-Version: 13".to_string(),
    ];
    for (name, value) in headers {
        lines.push(format!("{name}: {value}"));
    }
    if !extensions.is_empty() {
        let listed = extensions
            .iter()
            .map(|(name, params)| {
                if params.is_empty() {
                    name.clone()
                } else {
                    format!("{name}; {params}")
                }
            })
            .collect::<Vec<String>>()
            .join(", ");
        lines.push(format!("Sec-WebSocket-Extensions: {listed}"));
    }
    lines.push("\r\n".to_string());
    lines.join("\r\n")
}

/// perform the http upgrade over an established transport
///
/// returns the validated response and any bytes the peer pipelined behind
/// the header terminator; the caller seeds its frame buffer with them
pub(crate) fn perform_handshake(
    transport: &Transport,
    endpoint: &Endpoint,
    headers: &HashMap<String, String>,
    extensions: &[(String, String)],
    deadline: Instant,
) -> Result<(http::Response<()>, BytesMut), WsError> {
    let key = gen_key();
    let request = build_request(endpoint, headers, extensions, &key);
    transport.send_all(request.as_bytes())?;

    let mut read_bytes = BytesMut::with_capacity(1024);
    let mut tmp = [0u8; 1024];
    let terminator = loop {
        if let Some(idx) = read_bytes.windows(4).position(|w| w == b"\r\n\r\n") {
            break idx;
        }
        if read_bytes.len() > MAX_RESPONSE_HEADER_SIZE {
            return Err(WsError::HandshakeFailed(
                "response header block exceeds 32 KiB without terminator".into(),
            ));
        }
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(WsError::Timeout("websocket handshake".into()));
        }
        match transport.recv_some(&mut tmp, remaining.min(RESPONSE_READ_SLICE))? {
            SliceRead::Data(n) => read_bytes.extend_from_slice(&tmp[..n]),
            SliceRead::Idle => continue,
            SliceRead::Eof => {
                return Err(WsError::HandshakeFailed(
                    "connection closed before handshake completed".into(),
                ));
            }
        }
    };
    let head = read_bytes.split_to(terminator + 4);
    let remain = read_bytes;

    let mut header_buf = [httparse::EMPTY_HEADER; 64];
    let mut parsed = httparse::Response::new(&mut header_buf);
    let status = parsed
        .parse(&head)
        .map_err(|_| WsError::HandshakeFailed("invalid http response".into()))?;
    if status.is_partial() {
        return Err(WsError::HandshakeFailed("truncated http response".into()));
    }
    if parsed.version != Some(1) {
        return Err(WsError::HandshakeFailed(
            "expect HTTP/1.1 status line".into(),
        ));
    }
    let mut builder = http::Response::builder()
        .status(parsed.code.unwrap_or_default())
        .version(http::Version::HTTP_11);
    for header in parsed.headers.iter() {
        builder = builder.header(header.name, header.value);
    }
    let resp = builder
        .body(())
        .map_err(|e| WsError::HandshakeFailed(format!("malformed response: {e}")))?;
    standard_handshake_resp_check(key.as_bytes(), &resp)?;
    tracing::debug!("protocol handshake complete");
    Ok((resp, remain))
}

fn header_contains_token(resp: &http::Response<()>, name: &str, token: &str) -> bool {
    resp.headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.split(',').any(|t| t.trim().eq_ignore_ascii_case(token)))
        .unwrap_or(false)
}

/// check the upgrade response the way rfc 6455 requires
///
/// `key` is the base64 nonce the request carried; the response must echo
/// `101`, the upgrade/connection tokens and the exact accept proof
pub fn standard_handshake_resp_check(key: &[u8], resp: &http::Response<()>) -> Result<(), WsError> {
    if resp.status() != http::StatusCode::SWITCHING_PROTOCOLS {
        return Err(WsError::HandshakeFailed(format!(
            "expect 101 switching protocols, got {}",
            resp.status()
        )));
    }
    if !header_contains_token(resp, "Upgrade", "websocket") {
        return Err(WsError::HandshakeFailed(
            "missing or invalid `Upgrade` header".into(),
        ));
    }
    if !header_contains_token(resp, "Connection", "upgrade") {
        return Err(WsError::HandshakeFailed(
            "missing or invalid `Connection` header".into(),
        ));
    }
    let key = std::str::from_utf8(key)
        .map_err(|_| WsError::HandshakeFailed("invalid handshake key".into()))?;
    let expected = cal_accept_key(key);
    let accept = resp
        .headers()
        .get("Sec-WebSocket-Accept")
        .ok_or_else(|| WsError::HandshakeFailed("missing `Sec-WebSocket-Accept` header".into()))?;
    let accept = accept
        .to_str()
        .map_err(|_| WsError::HandshakeFailed("malformed `Sec-WebSocket-Accept` header".into()))?;
    if accept.trim() != expected {
        return Err(WsError::HandshakeFailed(format!(
            "mismatch accept key, expect {expected}, got {accept}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn accept_key_known_vector() {
        // the worked example from rfc 6455 section 1.3
        assert_eq!(
            cal_accept_key("dGhlIHNhbXBsZSBub25jZQ=="),
            "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
        );
    }

    #[test]
    fn generated_key_is_16_random_bytes() {
        let key = gen_key();
        let raw = B64.decode(&key).unwrap();
        assert_eq!(raw.len(), 16);
        assert_ne!(gen_key(), key);
    }

    #[test]
    fn parse_defaults() {
        let ep = Endpoint::parse("ws://example.com").unwrap();
        assert_eq!(ep.mode, Mode::WS);
        assert_eq!(ep.host, "example.com");
        assert_eq!(ep.port, 80);
        assert_eq!(ep.path, "/");
        assert_eq!(ep.query, "");
        assert_eq!(Endpoint::parse("wss://example.com").unwrap().port, 443);
    }

    #[test]
    fn parse_full_url() {
        let ep = Endpoint::parse("wss://example.com:8443/chat/room?token=abc&x=1").unwrap();
        assert_eq!(ep.mode, Mode::WSS);
        assert_eq!(ep.host, "example.com");
        assert_eq!(ep.port, 8443);
        assert_eq!(ep.path, "/chat/room");
        assert_eq!(ep.query, "token=abc&x=1");
        assert_eq!(ep.request_path(), "/chat/room?token=abc&x=1");
    }

    #[test]
    fn parse_field_round_trip() {
        for (mode, scheme) in [(Mode::WS, "ws"), (Mode::WSS, "wss")] {
            for port in [1u16, 80, 443, 8080, 65535] {
                let url = format!("{scheme}://h.example:{port}/p");
                let ep = Endpoint::parse(&url).unwrap();
                assert_eq!(ep.mode, mode);
                assert_eq!(ep.host, "h.example");
                assert_eq!(ep.port, port);
                assert_eq!(ep.path, "/p");
            }
        }
    }

    #[test]
    fn parse_rejects_bad_urls() {
        for url in [
            "http://example.com/",
            "ftp://example.com",
            "example.com",
            "ws://",
            "ws://:8080/",
            "ws://example.com:0/",
            "ws://example.com:65536/",
            "ws://example.com:abc/",
            "ws://example.com:/",
            "ws://example.com:9999999999/",
        ] {
            assert!(
                matches!(Endpoint::parse(url), Err(WsError::InvalidUrl(_))),
                "{url} should be rejected"
            );
        }
    }

    #[test]
    fn host_header_omits_default_port() {
        assert_eq!(
            Endpoint::parse("ws://example.com/").unwrap().host_header(),
            "example.com"
        );
        assert_eq!(
            Endpoint::parse("wss://example.com/").unwrap().host_header(),
            "example.com"
        );
        assert_eq!(
            Endpoint::parse("ws://example.com:9001/")
                .unwrap()
                .host_header(),
            "example.com:9001"
        );
    }

    #[test]
    fn request_carries_required_headers() {
        let ep = Endpoint::parse("ws://example.com:9001/chat?a=1").unwrap();
        let mut headers = HashMap::new();
        headers.insert("Authorization".to_string(), "Bearer tok".to_string());
        let extensions = vec![
            ("permessage-foo".to_string(), "bits=7".to_string()),
            ("x-bare".to_string(), String::new()),
        ];
        let req = build_request(&ep, &headers, &extensions, "a2V5a2V5a2V5a2V5a2V5a2U=");
        assert!(req.starts_with("GET /chat?a=1 HTTP/1.1\r\n"));
        assert!(req.contains("Host: example.com:9001\r\n"));
        assert!(req.contains("Upgrade: websocket\r\n"));
        assert!(req.contains("Connection: Upgrade\r\n"));
        assert!(req.contains("Sec-WebSocket-Key: a2V5a2V5a2V5a2V5a2V5a2U=\r\n"));
        assert!(req.contains("Sec-WebSocket-Version: 13\r\n"));
        assert!(req.contains("Authorization: Bearer tok\r\n"));
        assert!(req.contains("Sec-WebSocket-Extensions: permessage-foo; bits=7, x-bare\r\n"));
        assert!(req.ends_with("\r\n\r\n"));
    }

    fn resp_with_accept(accept: &str) -> http::Response<()> {
        http::Response::builder()
            .status(101)
            .header("Upgrade", "websocket")
            .header("Connection", "keep-alive, Upgrade")
            .header("Sec-WebSocket-Accept", accept)
            .body(())
            .unwrap()
    }

    #[test]
    fn resp_check_accepts_exact_proof() {
        let key = "dGhlIHNhbXBsZSBub25jZQ==";
        let resp = resp_with_accept("s3pPLMBiTxaQ9kYGzzhZRbK+xOo=");
        standard_handshake_resp_check(key.as_bytes(), &resp).unwrap();
    }

    #[test]
    fn resp_check_rejects_any_perturbation() {
        let key = "dGhlIHNhbXBsZSBub25jZQ==";
        let good = "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=";
        for idx in 0..good.len() {
            let mut bad = good.as_bytes().to_vec();
            bad[idx] ^= 0x01;
            let Ok(bad) = String::from_utf8(bad) else {
                continue;
            };
            let resp = resp_with_accept(&bad);
            assert!(
                standard_handshake_resp_check(key.as_bytes(), &resp).is_err(),
                "perturbed byte {idx} must be rejected"
            );
        }
    }

    #[test]
    fn resp_check_requires_upgrade_tokens() {
        let key = "dGhlIHNhbXBsZSBub25jZQ==";
        let resp = http::Response::builder()
            .status(101)
            .header("Sec-WebSocket-Accept", "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=")
            .body(())
            .unwrap();
        let err = standard_handshake_resp_check(key.as_bytes(), &resp).unwrap_err();
        assert!(matches!(err, WsError::HandshakeFailed(msg) if msg.contains("Upgrade")));

        let resp = http::Response::builder()
            .status(200)
            .body(())
            .unwrap();
        let err = standard_handshake_resp_check(key.as_bytes(), &resp).unwrap_err();
        assert!(matches!(err, WsError::HandshakeFailed(msg) if msg.contains("101")));
    }
}
