//! Per-host reverse proxy handlers
//!
//! A [`BackendProxy`] forwards requests arriving for one virtual host to one
//! backend URL. Method, path, query and body pass through untouched; the
//! outbound `Host` becomes the backend authority and the original virtual
//! hostname travels in `X-Origin-Host`.

use crate::error::{json_error_response, ProxyConfigError, ProxyErrorCode};
use crate::pool::ConnectionPool;
use http_body_util::combinators::BoxBody;
use hyper::body::{Bytes, Incoming};
use hyper::header::{HeaderMap, HeaderName, HeaderValue};
use hyper::http::uri::{Authority, PathAndQuery, Scheme};
use hyper::{Request, Response, StatusCode, Uri};
use hyper_util::rt::TokioIo;
use parking_lot::Mutex;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{debug, error, warn};

/// Original virtual hostname, for backends serving several names
pub const X_ORIGIN_HOST: &str = "x-origin-host";
const X_FORWARDED_HOST: &str = "x-forwarded-host";
const X_FORWARDED_FOR: &str = "x-forwarded-for";
const X_FORWARDED_PROTO: &str = "x-forwarded-proto";

/// Headers that only apply to a single connection (RFC 9110, section 7.6.1)
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "proxy-connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Upgraded connections that outlive the HTTP exchange that opened them.
///
/// Each listener owns one set, so draining the listener ends its tunnels too.
#[derive(Debug, Clone, Default)]
pub struct Tunnels {
    tasks: Arc<Mutex<JoinSet<()>>>,
}

impl Tunnels {
    pub fn spawn<F>(&self, tunnel: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut tasks = self.tasks.lock();
        while tasks.try_join_next().is_some() {}
        tasks.spawn(tunnel);
    }

    /// Tunnels still open
    pub fn len(&self) -> usize {
        let mut tasks = self.tasks.lock();
        while tasks.try_join_next().is_some() {}
        tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Move every open tunnel out, leaving an empty set behind
    pub fn take(&self) -> JoinSet<()> {
        std::mem::take(&mut *self.tasks.lock())
    }
}

/// Forwarding handler bound to a single virtual host and backend
#[derive(Clone)]
pub struct BackendProxy {
    virtual_host: String,
    backend: String,
    scheme: Scheme,
    authority: Authority,
    base_path: String,
    base_query: Option<String>,
    pool: Arc<ConnectionPool>,
}

impl std::fmt::Debug for BackendProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendProxy")
            .field("virtual_host", &self.virtual_host)
            .field("backend", &self.backend)
            .finish()
    }
}

impl BackendProxy {
    /// Validate `backend` and build a handler for `virtual_host`.
    ///
    /// The backend must be an absolute `http` or `https` URL with an
    /// authority. A path on the backend URL becomes a prefix for every
    /// forwarded path.
    pub fn new(
        virtual_host: &str,
        backend: &str,
        pool: Arc<ConnectionPool>,
    ) -> Result<Self, ProxyConfigError> {
        let invalid = |reason: &str| ProxyConfigError {
            hostname: virtual_host.to_string(),
            backend: backend.to_string(),
            reason: reason.to_string(),
        };

        let uri: Uri = backend
            .trim()
            .parse()
            .map_err(|e: hyper::http::uri::InvalidUri| invalid(&e.to_string()))?;

        let scheme = match uri.scheme_str() {
            Some("http") => Scheme::HTTP,
            Some("https") => Scheme::HTTPS,
            Some(other) => return Err(invalid(&format!("unsupported scheme '{}'", other))),
            None => return Err(invalid("backend must be an absolute http or https URL")),
        };

        let authority = uri
            .authority()
            .cloned()
            .ok_or_else(|| invalid("backend URL has no host"))?;
        if authority.host().is_empty() {
            return Err(invalid("backend URL has no host"));
        }

        let base_path = uri.path().trim_end_matches('/').to_string();
        let base_query = uri.query().filter(|q| !q.is_empty()).map(String::from);

        Ok(Self {
            virtual_host: virtual_host.to_string(),
            backend: backend.to_string(),
            scheme,
            authority,
            base_path,
            base_query,
            pool,
        })
    }

    pub fn virtual_host(&self) -> &str {
        &self.virtual_host
    }

    pub fn backend(&self) -> &str {
        &self.backend
    }

    /// Backend host without port, as sent in `X-Forwarded-Host`
    pub fn backend_host(&self) -> &str {
        self.authority.host()
    }

    /// Absolute outbound URI for an inbound request URI
    pub fn target_uri(&self, inbound: &Uri) -> Result<Uri, hyper::http::Error> {
        let path = join_paths(&self.base_path, inbound.path());
        let query = match (self.base_query.as_deref(), inbound.query()) {
            (Some(base), Some(q)) if !q.is_empty() => Some(format!("{}&{}", base, q)),
            (Some(base), _) => Some(base.to_string()),
            (None, Some(q)) => Some(q.to_string()),
            (None, None) => None,
        };

        let path_and_query: PathAndQuery = match query {
            Some(q) => format!("{}?{}", path, q).parse()?,
            None => path.parse()?,
        };

        Uri::builder()
            .scheme(self.scheme.clone())
            .authority(self.authority.clone())
            .path_and_query(path_and_query)
            .build()
    }

    /// Rewrite an inbound request in place so it can be sent to the backend
    pub fn prepare<B>(
        &self,
        req: &mut Request<B>,
        client_addr: SocketAddr,
        is_tls: bool,
    ) -> Result<(), hyper::http::Error> {
        *req.uri_mut() = self.target_uri(req.uri())?;
        *req.version_mut() = hyper::Version::HTTP_11;

        let upgrade = upgrade_protocol(req.headers());
        strip_hop_by_hop(req.headers_mut());
        let headers = req.headers_mut();

        if let Some(protocol) = upgrade {
            headers.insert(hyper::header::CONNECTION, HeaderValue::from_static("upgrade"));
            headers.insert(hyper::header::UPGRADE, protocol);
        }

        headers.insert(hyper::header::HOST, HeaderValue::from_str(self.authority.as_str())?);
        headers.insert(X_FORWARDED_HOST, HeaderValue::from_str(self.backend_host())?);
        headers.insert(X_ORIGIN_HOST, HeaderValue::from_str(&self.virtual_host)?);

        // Overwritten, not appended: this gateway is the first trusted hop
        headers.insert(
            X_FORWARDED_FOR,
            HeaderValue::from_str(&client_addr.ip().to_string())?,
        );
        headers.insert(
            X_FORWARDED_PROTO,
            HeaderValue::from_static(if is_tls { "https" } else { "http" }),
        );

        Ok(())
    }

    /// Forward a request and return the backend's response.
    ///
    /// Transport failures become `502 CONNECTION_FAILED`. Protocol upgrades
    /// (WebSocket) are spliced once both sides have switched; the splice runs
    /// in `tunnels`.
    pub async fn forward(
        &self,
        mut req: Request<Incoming>,
        client_addr: SocketAddr,
        is_tls: bool,
        tunnels: &Tunnels,
    ) -> Response<BoxBody<Bytes, hyper::Error>> {
        if let Err(e) = self.prepare(&mut req, client_addr, is_tls) {
            error!(hostname = %self.virtual_host, error = %e, "Failed to rewrite request");
            return json_error_response(ProxyErrorCode::InternalError, "Failed to build backend request");
        }

        let client_upgrade = upgrade_protocol(req.headers())
            .is_some()
            .then(|| hyper::upgrade::on(&mut req));

        let mut response = match self.pool.send_request(req).await {
            Ok(response) => response,
            Err(e) => {
                // Detailed error stays in the log
                error!(
                    hostname = %self.virtual_host,
                    backend = %self.backend,
                    error = %e,
                    "Failed to forward request"
                );
                return json_error_response(
                    ProxyErrorCode::ConnectionFailed,
                    "Failed to connect to backend",
                );
            }
        };

        if response.status() == StatusCode::SWITCHING_PROTOCOLS {
            match client_upgrade {
                Some(client_upgrade) => {
                    let backend_upgrade = hyper::upgrade::on(&mut response);
                    let hostname = self.virtual_host.clone();
                    tunnels.spawn(async move {
                        splice_upgraded(client_upgrade, backend_upgrade, &hostname).await;
                    });
                }
                None => {
                    warn!(hostname = %self.virtual_host, "Backend switched protocols without an upgrade request");
                    return json_error_response(
                        ProxyErrorCode::ConnectionFailed,
                        "Unexpected protocol switch from backend",
                    );
                }
            }
        } else {
            strip_hop_by_hop(response.headers_mut());
        }

        response
    }
}

/// Join the backend base path and the request path with exactly one slash
fn join_paths(base: &str, path: &str) -> String {
    if base.is_empty() {
        return if path.is_empty() { "/".to_string() } else { path.to_string() };
    }
    let path = path.trim_start_matches('/');
    if path.is_empty() {
        format!("{}/", base)
    } else {
        format!("{}/{}", base, path)
    }
}

/// The requested upgrade protocol, if the request asks for one
fn upgrade_protocol(headers: &HeaderMap) -> Option<HeaderValue> {
    let wants_upgrade = headers
        .get_all(hyper::header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|token| token.trim().eq_ignore_ascii_case("upgrade"));

    if wants_upgrade {
        headers.get(hyper::header::UPGRADE).cloned()
    } else {
        None
    }
}

fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let listed: Vec<HeaderName> = headers
        .get_all(hyper::header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .filter_map(|name| HeaderName::from_bytes(name.trim().as_bytes()).ok())
        .collect();

    for name in listed {
        headers.remove(name);
    }
    for name in HOP_BY_HOP {
        headers.remove(*name);
    }
}

async fn splice_upgraded(
    client: hyper::upgrade::OnUpgrade,
    backend: hyper::upgrade::OnUpgrade,
    hostname: &str,
) {
    let (client, backend) = match tokio::try_join!(client, backend) {
        Ok(pair) => pair,
        Err(e) => {
            error!(hostname, error = %e, "Protocol upgrade failed");
            return;
        }
    };

    let mut client = TokioIo::new(client);
    let mut backend = TokioIo::new(backend);
    match tokio::io::copy_bidirectional(&mut client, &mut backend).await {
        Ok((to_backend, to_client)) => {
            debug!(hostname, to_backend, to_client, "Upgraded connection closed");
        }
        Err(e) => {
            debug!(hostname, error = %e, "Upgraded connection closed with error");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn proxy(backend: &str) -> BackendProxy {
        BackendProxy::new("app.example.com", backend, Arc::new(ConnectionPool::default())).unwrap()
    }

    fn client() -> SocketAddr {
        "203.0.113.7:50000".parse().unwrap()
    }

    #[tokio::test]
    async fn test_rejects_malformed_backends() {
        let pool = Arc::new(ConnectionPool::default());
        for backend in ["not-a-url", "ftp://files.internal", "/relative/path", "http://", ""] {
            let err = BackendProxy::new("bad.example.com", backend, Arc::clone(&pool)).unwrap_err();
            assert_eq!(err.hostname, "bad.example.com");
            assert_eq!(err.backend, backend);
        }
    }

    #[tokio::test]
    async fn test_target_uri_preserves_path_and_query() {
        let proxy = proxy("http://127.0.0.1:9000");
        let uri = proxy.target_uri(&"/foo/bar?x=1&y=2".parse().unwrap()).unwrap();
        assert_eq!(uri.to_string(), "http://127.0.0.1:9000/foo/bar?x=1&y=2");

        let uri = proxy.target_uri(&"/".parse().unwrap()).unwrap();
        assert_eq!(uri.to_string(), "http://127.0.0.1:9000/");
    }

    #[tokio::test]
    async fn test_target_uri_with_base_path() {
        let proxy = proxy("https://backend.internal/api/?v=2");
        let uri = proxy.target_uri(&"/users?id=3".parse().unwrap()).unwrap();
        assert_eq!(uri.to_string(), "https://backend.internal/api/users?v=2&id=3");

        let uri = proxy.target_uri(&"/".parse().unwrap()).unwrap();
        assert_eq!(uri.to_string(), "https://backend.internal/api/?v=2");
    }

    #[tokio::test]
    async fn test_prepare_rewrites_headers() {
        let proxy = proxy("http://127.0.0.1:9000");
        let mut req = Request::builder()
            .method("POST")
            .uri("/foo?q=1")
            .header("host", "app.example.com")
            .header("x-forwarded-for", "10.0.0.1")
            .header("x-origin-host", "spoofed.example.com")
            .header("connection", "keep-alive, x-private")
            .header("x-private", "secret")
            .header("keep-alive", "timeout=5")
            .header("authorization", "Bearer abc")
            .body(())
            .unwrap();

        proxy.prepare(&mut req, client(), true).unwrap();

        assert_eq!(req.method(), "POST");
        assert_eq!(req.uri().to_string(), "http://127.0.0.1:9000/foo?q=1");
        let headers = req.headers();
        assert_eq!(headers["host"], "127.0.0.1:9000");
        assert_eq!(headers[X_FORWARDED_HOST], "127.0.0.1");
        assert_eq!(headers[X_ORIGIN_HOST], "app.example.com");
        assert_eq!(headers[X_FORWARDED_FOR], "203.0.113.7");
        assert_eq!(headers[X_FORWARDED_PROTO], "https");
        assert_eq!(headers["authorization"], "Bearer abc");
        assert!(headers.get("connection").is_none());
        assert!(headers.get("keep-alive").is_none());
        assert!(headers.get("x-private").is_none());
    }

    #[tokio::test]
    async fn test_prepare_keeps_upgrade() {
        let proxy = proxy("http://127.0.0.1:9000");
        let mut req = Request::builder()
            .uri("/ws")
            .header("host", "app.example.com")
            .header("connection", "Upgrade")
            .header("upgrade", "websocket")
            .body(())
            .unwrap();

        proxy.prepare(&mut req, client(), false).unwrap();

        assert_eq!(req.headers()["connection"], "upgrade");
        assert_eq!(req.headers()["upgrade"], "websocket");
        assert_eq!(req.headers()[X_FORWARDED_PROTO], "http");
    }

    #[tokio::test]
    async fn test_tunnels_reap_finished_tasks() {
        let tunnels = Tunnels::default();
        assert!(tunnels.is_empty());

        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
        tunnels.spawn(async move {
            let _ = release_rx.await;
        });
        tunnels.spawn(async {});
        tokio::task::yield_now().await;
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert_eq!(tunnels.len(), 1);

        let mut taken = tunnels.take();
        assert!(tunnels.is_empty());
        release_tx.send(()).unwrap();
        assert!(taken.join_next().await.unwrap().is_ok());
    }

    #[test]
    fn test_join_paths() {
        assert_eq!(join_paths("", "/foo"), "/foo");
        assert_eq!(join_paths("", ""), "/");
        assert_eq!(join_paths("/api", "/foo"), "/api/foo");
        assert_eq!(join_paths("/api", "/"), "/api/");
    }
}
