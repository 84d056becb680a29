//! Control interface: host management over JSON/HTTP
//!
//! The endpoint performs no authentication. Keep it on loopback or a
//! private network.

use crate::error::RegistryError;
use crate::registry::{Host, HostRegistry};
use crate::reload::ReloadHandle;
use http_body_util::{BodyExt, Full, Limited};
use hyper::body::{Bytes, Incoming};
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Version information for the gateway
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");

/// Largest accepted request body
const MAX_BODY_BYTES: usize = 64 * 1024;

/// Host management operations. Mutations schedule a reload once they are
/// durable; the call does not wait for it.
pub struct ControlService {
    registry: Arc<HostRegistry>,
    reload: ReloadHandle,
}

impl ControlService {
    pub fn new(registry: Arc<HostRegistry>, reload: ReloadHandle) -> Self {
        Self { registry, reload }
    }

    pub fn add_host(&self, host: &Host) -> Result<Host, RegistryError> {
        let host = self.registry.add(host)?;
        info!(hostname = %host.hostname, backend = %host.backend, "Host added");
        self.reload.schedule();
        Ok(host)
    }

    pub fn get_host(&self, hostname: &str) -> Result<Host, RegistryError> {
        self.registry.get(hostname)
    }

    pub fn list_hosts(&self) -> Result<Vec<Host>, RegistryError> {
        self.registry.list()
    }

    pub fn delete_host(&self, hostname: &str) -> Result<(), RegistryError> {
        self.registry.delete(hostname)?;
        info!(hostname, "Host deleted");
        self.reload.schedule();
        Ok(())
    }

    pub fn reload_handle(&self) -> &ReloadHandle {
        &self.reload
    }
}

/// Error body returned by the control endpoint
#[derive(Debug, Serialize)]
struct ControlError<'a> {
    error: &'a str,
    message: String,
}

/// Helper to create a JSON response
fn json_response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(Full::new(body.into()))
        .expect("valid response with StatusCode enum and static header")
}

fn json_body<T: Serialize>(status: StatusCode, value: &T) -> Response<Full<Bytes>> {
    match serde_json::to_vec(value) {
        Ok(body) => json_response(status, body),
        Err(e) => error_response(StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR", e.to_string()),
    }
}

fn error_response(status: StatusCode, code: &str, message: impl Into<String>) -> Response<Full<Bytes>> {
    let body = ControlError {
        error: code,
        message: message.into(),
    };
    let body = serde_json::to_vec(&body).unwrap_or_else(|_| b"{}".to_vec());
    json_response(status, body)
}

fn registry_error(err: &RegistryError) -> Response<Full<Bytes>> {
    if matches!(err, RegistryError::PersistenceFailure(_)) {
        error!(error = %err, "Registry operation failed");
    }
    error_response(err.status_code(), err.code(), err.to_string())
}

/// Control endpoints
#[derive(Debug, PartialEq, Eq)]
enum Endpoint<'a> {
    Health,
    Version,
    Status,
    ListHosts,
    AddHost,
    GetHost(&'a str),
    DeleteHost(&'a str),
    MethodNotAllowed,
    NotFound,
}

fn endpoint<'a>(method: &Method, path: &'a str) -> Endpoint<'a> {
    match (method, path.trim_end_matches('/')) {
        (&Method::GET, "/health") => Endpoint::Health,
        (&Method::GET, "/version") => Endpoint::Version,
        (&Method::GET, "/status") => Endpoint::Status,
        (&Method::GET, "/hosts") => Endpoint::ListHosts,
        (&Method::POST, "/hosts") => Endpoint::AddHost,
        (_, "/hosts") => Endpoint::MethodNotAllowed,
        (method, path) => match path.strip_prefix("/hosts/") {
            Some(hostname) if !hostname.is_empty() && !hostname.contains('/') => match *method {
                Method::GET => Endpoint::GetHost(hostname),
                Method::DELETE => Endpoint::DeleteHost(hostname),
                _ => Endpoint::MethodNotAllowed,
            },
            _ => Endpoint::NotFound,
        },
    }
}

/// HTTP transport for [`ControlService`]
pub struct ControlServer {
    bind_addr: SocketAddr,
    service: Arc<ControlService>,
    shutdown_rx: watch::Receiver<bool>,
}

impl ControlServer {
    pub fn new(
        bind_addr: SocketAddr,
        service: Arc<ControlService>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> Self {
        Self {
            bind_addr,
            service,
            shutdown_rx,
        }
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        self.serve(listener).await
    }

    /// Serve on an already bound listener
    pub async fn serve(self, listener: TcpListener) -> anyhow::Result<()> {
        let addr = listener.local_addr()?;
        if !addr.ip().is_loopback() {
            warn!(
                addr = %addr,
                "Control endpoint is not on loopback; it has no authentication, restrict access by network"
            );
        }
        info!(addr = %addr, "Control server listening");

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, addr)) => {
                            let service = Arc::clone(&self.service);
                            tokio::spawn(async move {
                                if let Err(e) = serve_control_connection(stream, service).await {
                                    debug!(addr = %addr, error = %e, "Control connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept control connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Control server shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn serve_control_connection(
    stream: TcpStream,
    service: Arc<ControlService>,
) -> anyhow::Result<()> {
    let io = TokioIo::new(stream);
    let service = service_fn(move |req| {
        let service = Arc::clone(&service);
        async move { handle_control_request(req, service).await }
    });

    AutoBuilder::new(TokioExecutor::new())
        .serve_connection(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Control connection error: {}", e))?;

    Ok(())
}

async fn handle_control_request(
    req: Request<Incoming>,
    service: Arc<ControlService>,
) -> Result<Response<Full<Bytes>>, hyper::Error> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();

    debug!(%method, %path, "Control request");

    let response = match endpoint(&method, &path) {
        Endpoint::Health => Response::new(Full::new(Bytes::from_static(b"ok"))),

        Endpoint::Version => json_body(
            StatusCode::OK,
            &serde_json::json!({ "name": PKG_NAME, "version": VERSION }),
        ),

        Endpoint::Status => {
            let reload = service.reload_handle();
            let body = match reload.current() {
                Some(snapshot) => serde_json::json!({
                    "state": reload.state(),
                    "server": snapshot.as_ref(),
                }),
                None => serde_json::json!({ "state": reload.state(), "server": null }),
            };
            json_body(StatusCode::OK, &body)
        }

        Endpoint::ListHosts => match service.list_hosts() {
            Ok(hosts) => json_body(
                StatusCode::OK,
                &serde_json::json!({ "count": hosts.len(), "hosts": hosts }),
            ),
            Err(e) => registry_error(&e),
        },

        Endpoint::AddHost => {
            let body = match Limited::new(req.into_body(), MAX_BODY_BYTES).collect().await {
                Ok(collected) => collected.to_bytes(),
                Err(e) => {
                    return Ok(error_response(
                        StatusCode::BAD_REQUEST,
                        "BAD_REQUEST",
                        format!("failed to read body: {}", e),
                    ))
                }
            };

            match serde_json::from_slice::<Host>(&body) {
                Ok(host) => match service.add_host(&host) {
                    Ok(host) => json_body(StatusCode::CREATED, &host),
                    Err(e) => registry_error(&e),
                },
                Err(e) => error_response(
                    StatusCode::BAD_REQUEST,
                    "BAD_REQUEST",
                    format!("invalid host: {}", e),
                ),
            }
        }

        Endpoint::GetHost(hostname) => match service.get_host(hostname) {
            Ok(host) => json_body(StatusCode::OK, &host),
            Err(e) => registry_error(&e),
        },

        Endpoint::DeleteHost(hostname) => match service.delete_host(hostname) {
            Ok(()) => {
                let mut response = Response::new(Full::new(Bytes::new()));
                *response.status_mut() = StatusCode::NO_CONTENT;
                response
            }
            Err(e) => registry_error(&e),
        },

        Endpoint::MethodNotAllowed => error_response(
            StatusCode::METHOD_NOT_ALLOWED,
            "METHOD_NOT_ALLOWED",
            format!("{} not allowed on {}", method, path),
        ),

        Endpoint::NotFound => error_response(StatusCode::NOT_FOUND, "NOT_FOUND", "no such endpoint"),
    };

    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::AllowAll;
    use crate::config::ReloadFailurePolicy;
    use crate::pool::ConnectionPool;
    use crate::reload::{ReloadController, ReloadSettings};
    use crate::tls::Plaintext;
    use std::time::Duration;

    fn service() -> (ControlService, ReloadController) {
        let registry = Arc::new(HostRegistry::open_in_memory().unwrap());
        let controller = ReloadController::new(
            Arc::clone(&registry),
            Arc::new(Plaintext),
            Arc::new(AllowAll),
            Arc::new(ConnectionPool::default()),
            ReloadSettings {
                listen: "127.0.0.1:0".parse().unwrap(),
                management_host: "gate.example.com".to_string(),
                drain_timeout: Duration::from_secs(1),
                on_failure: ReloadFailurePolicy::Abort,
            },
        );
        (ControlService::new(registry, controller.handle()), controller)
    }

    #[test]
    fn test_endpoint_routing() {
        assert_eq!(endpoint(&Method::GET, "/health"), Endpoint::Health);
        assert_eq!(endpoint(&Method::GET, "/hosts"), Endpoint::ListHosts);
        assert_eq!(endpoint(&Method::GET, "/hosts/"), Endpoint::ListHosts);
        assert_eq!(endpoint(&Method::POST, "/hosts"), Endpoint::AddHost);
        assert_eq!(endpoint(&Method::PUT, "/hosts"), Endpoint::MethodNotAllowed);
        assert_eq!(
            endpoint(&Method::GET, "/hosts/app.example.com"),
            Endpoint::GetHost("app.example.com")
        );
        assert_eq!(
            endpoint(&Method::DELETE, "/hosts/app.example.com"),
            Endpoint::DeleteHost("app.example.com")
        );
        assert_eq!(
            endpoint(&Method::PATCH, "/hosts/app.example.com"),
            Endpoint::MethodNotAllowed
        );
        assert_eq!(endpoint(&Method::GET, "/hosts/a/b"), Endpoint::NotFound);
        assert_eq!(endpoint(&Method::GET, "/admin"), Endpoint::NotFound);
    }

    #[test]
    fn test_mutations_schedule_reload() {
        let (service, _controller) = service();
        let host = Host::http("App.Example.com", "http://127.0.0.1:9000");

        let stored = service.add_host(&host).unwrap();
        assert_eq!(stored.hostname, "app.example.com");
        // The add queued a reload, so this one coalesces
        assert!(!service.reload_handle().schedule());
    }

    #[test]
    fn test_failed_mutation_does_not_schedule() {
        let (service, _controller) = service();

        assert!(matches!(
            service.delete_host("missing.example.com"),
            Err(RegistryError::NotFound(_))
        ));
        assert!(service.reload_handle().schedule());
    }

    #[test]
    fn test_registry_errors_pass_through() {
        let (service, _controller) = service();
        let host = Host::http("app.example.com", "http://127.0.0.1:9000");
        service.add_host(&host).unwrap();

        let err = service.add_host(&host).unwrap_err();
        assert!(matches!(err, RegistryError::DuplicateKey(_)));
        assert_eq!(service.get_host("app.example.com").unwrap(), host);
        assert_eq!(service.list_hosts().unwrap().len(), 1);
    }

    #[test]
    fn test_error_response_shape() {
        let response = registry_error(&RegistryError::DuplicateKey("a.example.com".into()));
        assert_eq!(response.status(), StatusCode::CONFLICT);
        assert_eq!(
            response.headers().get("content-type").unwrap(),
            "application/json"
        );
    }
}
