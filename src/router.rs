//! Routing table construction and inbound host matching

use crate::error::{json_error_response, ProxyErrorCode, RouteBuildError};
use crate::pool::ConnectionPool;
use crate::proxy::BackendProxy;
use crate::registry::{normalize_hostname, Host, HostType};
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Method, Request, Response, StatusCode};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, error};

/// Maximum hostname length per DNS specification
const MAX_HOSTNAME_LEN: usize = 253;

/// Immutable hostname → proxy map plus the certificate domain list it implies
#[derive(Debug)]
pub struct RoutingTable {
    routes: HashMap<String, Arc<BackendProxy>>,
    management_host: String,
    domains: Vec<String>,
}

/// Where an inbound request goes
#[derive(Debug)]
pub enum Route<'a> {
    Backend(&'a Arc<BackendProxy>),
    Management,
    Unknown,
}

impl RoutingTable {
    /// Build a table from a registry snapshot.
    ///
    /// An `http` host whose backend does not parse is logged and left out;
    /// every other host still gets routed. A host with any other type aborts
    /// the whole build. The management hostname is always the last domain and
    /// never listed twice.
    pub fn build(
        hosts: &[Host],
        management_host: &str,
        pool: &Arc<ConnectionPool>,
    ) -> Result<Self, RouteBuildError> {
        let management_host = normalize_hostname(management_host);
        let mut routes = HashMap::with_capacity(hosts.len());
        let mut domains = Vec::with_capacity(hosts.len() + 1);

        for host in hosts {
            if let HostType::Unsupported(other) = &host.host_type {
                return Err(RouteBuildError::UnsupportedType {
                    hostname: host.hostname.clone(),
                    host_type: other.clone(),
                });
            }

            let hostname = normalize_hostname(&host.hostname);
            match BackendProxy::new(&hostname, &host.backend, Arc::clone(pool)) {
                Ok(proxy) => {
                    debug!(hostname, backend = %host.backend, "Routing host");
                    if routes.insert(hostname.clone(), Arc::new(proxy)).is_none() {
                        domains.push(hostname);
                    }
                }
                Err(e) => {
                    error!(hostname, error = %e, "Excluding host with invalid backend");
                }
            }
        }

        if !domains.contains(&management_host) {
            domains.push(management_host.clone());
        }

        Ok(Self {
            routes,
            management_host,
            domains,
        })
    }

    /// Resolve an already normalized hostname. Registered hosts win over the
    /// management hostname.
    pub fn route(&self, hostname: &str) -> Route<'_> {
        if let Some(proxy) = self.routes.get(hostname) {
            Route::Backend(proxy)
        } else if hostname == self.management_host {
            Route::Management
        } else {
            Route::Unknown
        }
    }

    /// Every hostname a certificate is needed for
    pub fn domains(&self) -> &[String] {
        &self.domains
    }

    pub fn management_host(&self) -> &str {
        &self.management_host
    }

    /// Routed hostnames, sorted
    pub fn hosts(&self) -> Vec<String> {
        let mut hosts: Vec<String> = self.routes.keys().cloned().collect();
        hosts.sort();
        hosts
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

/// Hostname an inbound request is addressed to, without port, lowercased.
///
/// HTTP/2 requests carry it in the URI authority instead of a Host header.
pub fn request_hostname<B>(req: &Request<B>) -> Option<String> {
    let raw = req
        .headers()
        .get(hyper::header::HOST)
        .and_then(|h| h.to_str().ok())
        .or_else(|| req.uri().host())?;

    // Strip port if present
    let hostname = raw.split(':').next()?;
    let hostname = hostname.trim_end_matches('.');

    if hostname.is_empty() || hostname.len() > MAX_HOSTNAME_LEN {
        return None;
    }

    // Alphanumeric, hyphen and dot only; keeps junk out of logs and lookups
    if !hostname
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.')
    {
        return None;
    }

    Some(hostname.to_ascii_lowercase())
}

/// Responses for the management hostname's own surface
pub fn management_response<B>(req: &Request<B>) -> Response<BoxBody<Bytes, hyper::Error>> {
    match (req.method(), req.uri().path()) {
        (&Method::GET, "/healthz") => json_ok(r#"{"status":"ok"}"#.to_string()),
        (&Method::GET, "/version") => json_ok(
            serde_json::json!({
                "name": env!("CARGO_PKG_NAME"),
                "version": env!("CARGO_PKG_VERSION"),
            })
            .to_string(),
        ),
        _ => json_error_response(ProxyErrorCode::NotFound, "Not found"),
    }
}

fn json_ok(body: String) -> Response<BoxBody<Bytes, hyper::Error>> {
    Response::builder()
        .status(StatusCode::OK)
        .header("Content-Type", "application/json")
        .body(Full::new(Bytes::from(body)).map_err(|e| match e {}).boxed())
        .expect("valid response with static status and headers")
}

#[cfg(test)]
mod tests {
    use super::*;

    const MANAGEMENT: &str = "gate.example.com";

    fn pool() -> Arc<ConnectionPool> {
        Arc::new(ConnectionPool::default())
    }

    #[tokio::test]
    async fn test_domains_are_hosts_plus_management() {
        let hosts: Vec<Host> = (0..4)
            .map(|i| Host::http(format!("app{}.example.com", i), format!("http://127.0.0.1:{}", 9000 + i)))
            .collect();

        let table = RoutingTable::build(&hosts, MANAGEMENT, &pool()).unwrap();

        assert_eq!(table.len(), 4);
        assert_eq!(table.domains().len(), 5);
        assert_eq!(table.domains().last().map(String::as_str), Some(MANAGEMENT));
    }

    #[tokio::test]
    async fn test_empty_registry_still_lists_management_host() {
        let table = RoutingTable::build(&[], MANAGEMENT, &pool()).unwrap();
        assert!(table.is_empty());
        assert_eq!(table.domains(), [MANAGEMENT.to_string()]);
    }

    #[tokio::test]
    async fn test_management_host_not_duplicated() {
        let hosts = vec![
            Host::http("a.example.com", "http://127.0.0.1:9000"),
            Host::http(MANAGEMENT, "http://127.0.0.1:9001"),
        ];

        let table = RoutingTable::build(&hosts, "Gate.Example.com.", &pool()).unwrap();

        assert_eq!(table.domains().len(), 2);
        assert_eq!(
            table.domains().iter().filter(|d| d.as_str() == MANAGEMENT).count(),
            1
        );
        // A registered host shadows the management surface
        assert!(matches!(table.route(MANAGEMENT), Route::Backend(_)));
    }

    #[tokio::test]
    async fn test_malformed_backend_excluded() {
        let hosts = vec![
            Host::http("good.example.com", "http://127.0.0.1:9000"),
            Host::http("bad.example.com", "not-a-url"),
        ];

        let table = RoutingTable::build(&hosts, MANAGEMENT, &pool()).unwrap();

        assert!(matches!(table.route("good.example.com"), Route::Backend(p) if p.backend() == "http://127.0.0.1:9000"));
        assert!(matches!(table.route("bad.example.com"), Route::Unknown));
        assert_eq!(table.hosts(), vec!["good.example.com".to_string()]);
        assert!(!table.domains().contains(&"bad.example.com".to_string()));
    }

    #[tokio::test]
    async fn test_unsupported_type_aborts_build() {
        let hosts = vec![
            Host::http("good.example.com", "http://127.0.0.1:9000"),
            Host {
                hostname: "tcp.example.com".to_string(),
                backend: "127.0.0.1:5432".to_string(),
                host_type: HostType::Unsupported("tcp".to_string()),
            },
        ];

        let err = RoutingTable::build(&hosts, MANAGEMENT, &pool()).unwrap_err();
        match err {
            RouteBuildError::UnsupportedType { hostname, host_type } => {
                assert_eq!(hostname, "tcp.example.com");
                assert_eq!(host_type, "tcp");
            }
        }
    }

    #[tokio::test]
    async fn test_route_lookup() {
        let hosts = vec![Host::http("app.example.com", "http://127.0.0.1:9000")];
        let table = RoutingTable::build(&hosts, MANAGEMENT, &pool()).unwrap();

        assert!(matches!(table.route("app.example.com"), Route::Backend(_)));
        assert!(matches!(table.route(MANAGEMENT), Route::Management));
        assert!(matches!(table.route("other.example.com"), Route::Unknown));
        // Exact match only
        assert!(matches!(table.route("sub.app.example.com"), Route::Unknown));
    }

    #[test]
    fn test_request_hostname() {
        let req = Request::builder()
            .uri("/")
            .header("host", "App.Example.com:8443")
            .body(())
            .unwrap();
        assert_eq!(request_hostname(&req), Some("app.example.com".to_string()));

        let req = Request::builder()
            .uri("https://h2.example.com/path")
            .body(())
            .unwrap();
        assert_eq!(request_hostname(&req), Some("h2.example.com".to_string()));

        let req = Request::builder().uri("/").body(()).unwrap();
        assert_eq!(request_hostname(&req), None);

        let req = Request::builder()
            .uri("/")
            .header("host", "evil\r\nhost")
            .body(());
        // Header construction itself may refuse the value
        if let Ok(req) = req {
            assert_eq!(request_hostname(&req), None);
        }

        let req = Request::builder()
            .uri("/")
            .header("host", "a".repeat(300))
            .body(())
            .unwrap();
        assert_eq!(request_hostname(&req), None);
    }

    #[test]
    fn test_management_response() {
        let req = Request::builder().uri("/healthz").body(()).unwrap();
        assert_eq!(management_response(&req).status(), StatusCode::OK);

        let req = Request::builder().uri("/version").body(()).unwrap();
        assert_eq!(management_response(&req).status(), StatusCode::OK);

        let req = Request::builder().uri("/admin").body(()).unwrap();
        let response = management_response(&req);
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(response.headers().get("X-Proxy-Error").unwrap(), "NOT_FOUND");
    }
}
