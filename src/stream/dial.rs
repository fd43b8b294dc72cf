//! Websocket dialing with bearer-token refresh.
//!
//! A dial attaches `Origin` and `Authorization` headers, honours the
//! configured TLS settings and proxy resolver, and reports the handshake to
//! the debug printer. A `401` answer triggers exactly one retry with a token
//! fetched from the installed [`TokenRefresher`].

use std::net::IpAddr;
use std::sync::{Arc, PoisonError, RwLock};

use base64::{engine::general_purpose::STANDARD as BASE64_STANDARD, Engine as _};
use rustls::ClientConfig;
use secrecy::{ExposeSecret, SecretString};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::client::{Request, Response};
use tokio_tungstenite::tungstenite::http::header::{AUTHORIZATION, ORIGIN};
use tokio_tungstenite::tungstenite::http::{HeaderMap, HeaderValue, StatusCode};
use tokio_tungstenite::tungstenite::Error as WsError;
use tokio_tungstenite::{client_async_tls_with_config, connect_async_tls_with_config, Connector};
use tracing::{debug, info};
use url::Url;

use crate::auth::TokenRefresher;
use crate::debug::{DebugPrinter, NullDebugPrinter};
use crate::errors::ConsumerError;
use crate::retry::ConnectHook;
use crate::stream::connection::WsStream;

/// Resolves the proxy to tunnel through for a target URL, if any.
pub type ProxyResolver = Arc<dyn Fn(&Url) -> Option<Url> + Send + Sync>;

const REDACTED: &str = "[PRIVATE DATA HIDDEN]";
const MAX_PROXY_RESPONSE_BYTES: usize = 8 * 1024;

/// Dialer configuration shared by every stream of a consumer.
pub(crate) struct Dialer {
    endpoint: String,
    tls: Option<Arc<ClientConfig>>,
    proxy: ProxyResolver,
    debug_printer: RwLock<Arc<dyn DebugPrinter>>,
    token_refresher: RwLock<Option<Arc<dyn TokenRefresher>>>,
}

impl Dialer {
    pub(crate) fn new(
        endpoint: String,
        tls: Option<Arc<ClientConfig>>,
        proxy: ProxyResolver,
    ) -> Self {
        Self {
            endpoint,
            tls,
            proxy,
            debug_printer: RwLock::new(Arc::new(NullDebugPrinter)),
            token_refresher: RwLock::new(None),
        }
    }

    pub(crate) fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub(crate) fn set_debug_printer(&self, printer: Arc<dyn DebugPrinter>) {
        *self
            .debug_printer
            .write()
            .unwrap_or_else(PoisonError::into_inner) = printer;
    }

    pub(crate) fn set_token_refresher(&self, refresher: Arc<dyn TokenRefresher>) {
        *self
            .token_refresher
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Some(refresher);
    }

    fn refresher(&self) -> Option<Arc<dyn TokenRefresher>> {
        self.token_refresher
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn debug_printer(&self) -> Arc<dyn DebugPrinter> {
        Arc::clone(&self.debug_printer.read().unwrap_or_else(PoisonError::into_inner))
    }

    /// Opens a websocket to `endpoint + path`, refreshing the token once on
    /// `401`, and fires `on_connect` after a successful handshake.
    pub(crate) async fn establish_websocket_connection(
        &self,
        path: &str,
        auth_token: &SecretString,
        on_connect: &ConnectHook,
    ) -> Result<WsStream, ConsumerError> {
        let refresher = self.refresher();

        let fetched;
        let token = match refresher.as_ref() {
            Some(refresher) if auth_token.expose_secret().is_empty() => {
                fetched = fetch_token(refresher.as_ref()).await?;
                &fetched
            }
            _ => auth_token,
        };

        let socket = match self.try_websocket_connection(path, token).await {
            Err(ConsumerError::Unauthorized { body }) => match refresher.as_ref() {
                Some(refresher) => {
                    debug!(event = "websocket_unauthorized_refreshing", path);
                    let token = fetch_token(refresher.as_ref()).await?;
                    self.try_websocket_connection(path, &token).await?
                }
                None => return Err(ConsumerError::Unauthorized { body }),
            },
            other => other?,
        };

        on_connect.fire();
        Ok(socket)
    }

    async fn try_websocket_connection(
        &self,
        path: &str,
        token: &SecretString,
    ) -> Result<WsStream, ConsumerError> {
        let url = build_url(&self.endpoint, path)?;
        let request = self.build_request(&url, token)?;
        self.debug_printer()
            .print("WEBSOCKET REQUEST:", &dump_request(&request));

        debug!(event = "websocket_dial", url = %url);
        let connector = self.tls.clone().map(Connector::Rustls);
        let result = match (self.proxy)(&url) {
            Some(proxy) => {
                debug!(event = "websocket_dial_via_proxy", proxy = %redact_proxy(&proxy));
                let tunnel = connect_via_proxy(&proxy, &url).await?;
                client_async_tls_with_config(request, tunnel, None, connector).await
            }
            None => connect_async_tls_with_config(request, None, false, connector).await,
        };

        match result {
            Ok((socket, response)) => {
                self.debug_printer()
                    .print("WEBSOCKET RESPONSE:", &dump_response(&response));
                info!(event = "websocket_connected", url = %url);
                Ok(socket)
            }
            Err(WsError::Http(response)) => {
                let body = response
                    .body()
                    .as_deref()
                    .map(|body| String::from_utf8_lossy(body).into_owned())
                    .unwrap_or_default();
                let status = response.status();
                self.debug_printer().print(
                    "WEBSOCKET RESPONSE:",
                    &dump_status(status, response.headers(), &body),
                );
                if status == StatusCode::UNAUTHORIZED {
                    Err(ConsumerError::Unauthorized { body })
                } else {
                    Err(ConsumerError::HttpStatus { status, body })
                }
            }
            Err(source) => Err(ConsumerError::Dial {
                endpoint: self.endpoint.clone(),
                source,
            }),
        }
    }

    fn build_request(&self, url: &Url, token: &SecretString) -> Result<Request, ConsumerError> {
        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|source| ConsumerError::Dial {
                endpoint: self.endpoint.clone(),
                source,
            })?;

        let origin = HeaderValue::from_str(&self.endpoint)?;
        let mut authorization = HeaderValue::from_str(token.expose_secret())?;
        authorization.set_sensitive(true);

        let headers = request.headers_mut();
        headers.insert(ORIGIN, origin);
        headers.insert(AUTHORIZATION, authorization);
        Ok(request)
    }
}

async fn fetch_token(refresher: &dyn TokenRefresher) -> Result<SecretString, ConsumerError> {
    refresher
        .refresh_auth_token()
        .await
        .map_err(ConsumerError::TokenRefresh)
}

/// Joins endpoint and path and rejects anything but `ws`/`wss`.
pub(crate) fn build_url(endpoint: &str, path: &str) -> Result<Url, ConsumerError> {
    let raw = format!("{endpoint}{path}");
    let url = Url::parse(&raw).map_err(|source| ConsumerError::InvalidUrl { url: raw, source })?;
    match url.scheme() {
        "ws" | "wss" => Ok(url),
        other => Err(ConsumerError::InvalidScheme(other.to_string())),
    }
}

/// Proxy resolver reading the conventional environment variables.
///
/// `wss` targets use `HTTPS_PROXY`, `ws` targets use `HTTP_PROXY` (either
/// case). Hosts matched by `NO_PROXY` bypass the proxy.
///
/// `NO_PROXY` entries are `*`, host names (matching the host and its
/// subdomains, with or without a leading dot) or IP literals, optionally
/// followed by a port which is ignored. IPv6 entries may be bracketed
/// (`[::1]:8080`) or bare (`::1`). IP literals only match exactly; CIDR
/// ranges such as `10.0.0.0/8` are not supported.
pub fn proxy_from_environment(target: &Url) -> Option<Url> {
    proxy_for(target, |key| std::env::var(key).ok())
}

fn proxy_for(target: &Url, lookup: impl Fn(&str) -> Option<String>) -> Option<Url> {
    let lookup_any = |keys: &[&str]| {
        keys.iter()
            .filter_map(|key| lookup(*key))
            .find(|value| !value.trim().is_empty())
    };

    let keys: &[&str] = match target.scheme() {
        "wss" | "https" => &["HTTPS_PROXY", "https_proxy"],
        _ => &["HTTP_PROXY", "http_proxy"],
    };
    let proxy = lookup_any(keys)?;

    let host = target.host_str()?;
    if let Some(no_proxy) = lookup_any(&["NO_PROXY", "no_proxy"]) {
        if bypasses_proxy(host, &no_proxy) {
            return None;
        }
    }

    let proxy = proxy.trim();
    if proxy.contains("://") {
        Url::parse(proxy).ok()
    } else {
        Url::parse(&format!("http://{proxy}")).ok()
    }
}

fn bypasses_proxy(host: &str, no_proxy: &str) -> bool {
    let host = host
        .trim_start_matches('[')
        .trim_end_matches(']')
        .to_ascii_lowercase();
    let host_is_ip = host.parse::<IpAddr>().is_ok();

    no_proxy.split(',').map(str::trim).any(|entry| {
        if entry == "*" {
            return true;
        }
        let entry = no_proxy_host(entry).to_ascii_lowercase();
        let entry = entry.trim_start_matches('.');
        !entry.is_empty()
            && (host == entry || (!host_is_ip && host.ends_with(&format!(".{entry}"))))
    })
}

/// Host part of a `NO_PROXY` entry with any port removed.
fn no_proxy_host(entry: &str) -> &str {
    if let Some(rest) = entry.strip_prefix('[') {
        return rest.split(']').next().unwrap_or_default();
    }
    match entry.rsplit_once(':') {
        // More than one colon without brackets is a bare IPv6 literal.
        Some((host, _port)) if !host.contains(':') => host,
        _ => entry,
    }
}

/// Opens a TCP tunnel to `target` through an HTTP `CONNECT` proxy.
async fn connect_via_proxy(proxy: &Url, target: &Url) -> Result<TcpStream, ConsumerError> {
    let proxy_host = proxy
        .host_str()
        .ok_or_else(|| ConsumerError::Proxy("proxy url has no host".to_string()))?;
    let proxy_port = proxy.port_or_known_default().unwrap_or(80);
    let target_host = target
        .host_str()
        .ok_or_else(|| ConsumerError::Proxy("target url has no host".to_string()))?;
    let target_port = target
        .port_or_known_default()
        .ok_or_else(|| ConsumerError::Proxy("target url has no port".to_string()))?;

    let mut stream = TcpStream::connect((proxy_host, proxy_port))
        .await
        .map_err(|err| ConsumerError::Proxy(format!("connect {proxy_host}:{proxy_port}: {err}")))?;

    let authority = format!("{target_host}:{target_port}");
    let mut head = format!("CONNECT {authority} HTTP/1.1\r\nHost: {authority}\r\n");
    if !proxy.username().is_empty() {
        let credentials = format!("{}:{}", proxy.username(), proxy.password().unwrap_or(""));
        head.push_str(&format!(
            "Proxy-Authorization: Basic {}\r\n",
            BASE64_STANDARD.encode(credentials)
        ));
    }
    head.push_str("\r\n");

    stream
        .write_all(head.as_bytes())
        .await
        .map_err(|err| ConsumerError::Proxy(format!("send CONNECT: {err}")))?;

    let status = read_connect_status(&mut stream).await?;
    if status != StatusCode::OK {
        return Err(ConsumerError::Proxy(format!(
            "CONNECT {authority} answered {status}"
        )));
    }
    Ok(stream)
}

/// Reads the proxy's response head byte by byte so no tunnelled data is
/// consumed, and returns its status code.
async fn read_connect_status(stream: &mut TcpStream) -> Result<StatusCode, ConsumerError> {
    let mut head = Vec::with_capacity(256);
    while !head.ends_with(b"\r\n\r\n") {
        if head.len() >= MAX_PROXY_RESPONSE_BYTES {
            return Err(ConsumerError::Proxy("CONNECT response too large".to_string()));
        }
        let byte = stream
            .read_u8()
            .await
            .map_err(|err| ConsumerError::Proxy(format!("read CONNECT response: {err}")))?;
        head.push(byte);
    }

    let head = String::from_utf8_lossy(&head);
    let status_line = head.lines().next().unwrap_or_default();
    status_line
        .split_whitespace()
        .nth(1)
        .and_then(|code| code.parse::<u16>().ok())
        .and_then(|code| StatusCode::from_u16(code).ok())
        .ok_or_else(|| ConsumerError::Proxy(format!("malformed CONNECT response: {status_line}")))
}

fn redact_proxy(proxy: &Url) -> String {
    let mut shown = proxy.clone();
    if shown.password().is_some() {
        let _ = shown.set_password(Some("***"));
    }
    shown.to_string()
}

fn dump_headers(out: &mut String, headers: &HeaderMap) {
    for (name, value) in headers {
        let value = if name == AUTHORIZATION {
            REDACTED.to_string()
        } else {
            String::from_utf8_lossy(value.as_bytes()).into_owned()
        };
        out.push_str(&format!("{name}: {value}\n"));
    }
}

fn dump_request(request: &Request) -> String {
    let mut out = format!("{} {} HTTP/1.1\n", request.method(), request.uri());
    dump_headers(&mut out, request.headers());
    out
}

fn dump_response(response: &Response) -> String {
    dump_status(response.status(), response.headers(), "")
}

fn dump_status(status: StatusCode, headers: &HeaderMap, body: &str) -> String {
    let mut out = format!("HTTP/1.1 {status}\n");
    dump_headers(&mut out, headers);
    if !body.is_empty() {
        out.push('\n');
        out.push_str(body);
        out.push('\n');
    }
    out
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::{Arc, Mutex};

    use secrecy::SecretString;
    use url::Url;

    use super::{build_url, bypasses_proxy, dump_request, proxy_for, Dialer, ProxyResolver};
    use crate::debug::DebugPrinter;
    use crate::errors::ConsumerError;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect();
        move |key: &str| map.get(key).cloned()
    }

    fn no_proxy() -> ProxyResolver {
        Arc::new(|_: &Url| None)
    }

    #[derive(Default)]
    struct Recorder(Mutex<Vec<(String, String)>>);

    impl DebugPrinter for Recorder {
        fn print(&self, title: &str, dump: &str) {
            self.0
                .lock()
                .unwrap()
                .push((title.to_string(), dump.to_string()));
        }
    }

    #[test]
    fn build_url_accepts_websocket_schemes() {
        let url = build_url("wss://doppler.example.com:443", "/apps/abc/stream").expect("url");
        assert_eq!(url.as_str(), "wss://doppler.example.com/apps/abc/stream");
        assert!(build_url("ws://localhost:8081", "/firehose/sub?").is_ok());
    }

    #[test]
    fn build_url_rejects_other_schemes_as_non_retryable() {
        let err = build_url("https://doppler.example.com", "/apps/abc/stream").unwrap_err();
        assert!(matches!(&err, ConsumerError::InvalidScheme(scheme) if scheme == "https"));
        assert!(err.is_non_retryable());

        let err = build_url("not a url", "/apps/abc/stream").unwrap_err();
        assert!(matches!(err, ConsumerError::InvalidUrl { .. }));
        assert!(err.is_non_retryable());
    }

    #[test]
    fn proxy_follows_target_scheme() {
        let lookup = env(&[
            ("HTTPS_PROXY", "secure-proxy:3128"),
            ("http_proxy", "http://plain-proxy:8080"),
        ]);
        let secure = Url::parse("wss://doppler.example.com/firehose/x").unwrap();
        let plain = Url::parse("ws://doppler.example.com/firehose/x").unwrap();

        assert_eq!(
            proxy_for(&secure, &lookup).map(|url| url.to_string()),
            Some("http://secure-proxy:3128/".to_string())
        );
        assert_eq!(
            proxy_for(&plain, &lookup).map(|url| url.to_string()),
            Some("http://plain-proxy:8080/".to_string())
        );
    }

    #[test]
    fn no_proxy_bypasses_matching_hosts() {
        let lookup = env(&[
            ("HTTPS_PROXY", "proxy:3128"),
            ("NO_PROXY", "localhost, .internal.example.com"),
        ]);
        let internal = Url::parse("wss://doppler.internal.example.com/x").unwrap();
        let external = Url::parse("wss://doppler.example.org/x").unwrap();
        assert!(proxy_for(&internal, &lookup).is_none());
        assert!(proxy_for(&external, &lookup).is_some());

        assert!(bypasses_proxy("anything", "*"));
        assert!(bypasses_proxy("localhost", "localhost:8080"));
        assert!(!bypasses_proxy("notlocalhost", "localhost"));
    }

    #[test]
    fn no_proxy_handles_ip_literals() {
        assert!(bypasses_proxy("[::1]", "[::1]:8080"));
        assert!(bypasses_proxy("[::1]", "::1"));
        assert!(bypasses_proxy("[fe80::1]", "example.com, [FE80::1]"));
        assert!(!bypasses_proxy("[::2]", "[::1]"));
        assert!(bypasses_proxy("10.0.0.1", "10.0.0.1:443"));
        assert!(!bypasses_proxy("10.0.0.1", "0.1"));
        // CIDR ranges are not interpreted.
        assert!(!bypasses_proxy("10.0.0.1", "10.0.0.0/8"));
    }

    #[test]
    fn request_dump_hides_authorization() {
        let dialer = Dialer::new("ws://localhost:8081".to_string(), None, no_proxy());
        let url = build_url(dialer.endpoint(), "/apps/abc/stream").unwrap();
        let request = dialer
            .build_request(&url, &SecretString::new("bearer secret".to_string()))
            .expect("request");

        assert_eq!(request.headers()["origin"], "ws://localhost:8081");
        assert_eq!(request.headers()["authorization"], "bearer secret");

        let dump = dump_request(&request);
        assert!(dump.starts_with("GET ws://localhost:8081/apps/abc/stream HTTP/1.1\n"));
        assert!(dump.contains("authorization: [PRIVATE DATA HIDDEN]"));
        assert!(!dump.contains("bearer secret"));
    }

    #[test]
    fn token_with_newline_is_a_header_error() {
        let dialer = Dialer::new("ws://localhost:8081".to_string(), None, no_proxy());
        let url = build_url(dialer.endpoint(), "/apps/abc/stream").unwrap();
        let err = dialer
            .build_request(&url, &SecretString::new("bad\ntoken".to_string()))
            .unwrap_err();
        assert!(matches!(err, ConsumerError::InvalidAuthHeader(_)));
    }

    #[tokio::test]
    async fn failed_dial_names_endpoint_and_prints_request() {
        // Nothing listens on port 1.
        let dialer = Dialer::new("ws://127.0.0.1:1".to_string(), None, no_proxy());
        let recorder = Arc::new(Recorder::default());
        dialer.set_debug_printer(recorder.clone());

        let err = dialer
            .try_websocket_connection("/apps/abc/stream", &SecretString::new("t".to_string()))
            .await
            .unwrap_err();
        assert!(matches!(err, ConsumerError::Dial { .. }));
        assert!(err.to_string().contains("ws://127.0.0.1:1"));
        assert!(!err.is_non_retryable());

        let printed = recorder.0.lock().unwrap();
        assert_eq!(printed.len(), 1);
        assert_eq!(printed[0].0, "WEBSOCKET REQUEST:");
    }
}
