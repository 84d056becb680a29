//! Shared transport for backend HTTP connections
//!
//! Every proxy in every routing table goes through one pooled client, so
//! idle connections survive reloads. Backends may be plain HTTP or HTTPS.

use http_body_util::{combinators::BoxBody, BodyExt};
use hyper::body::{Bytes, Incoming};
use hyper::rt::{Read, ReadBufCursor, Write};
use hyper::{Request, Response, Uri};
use hyper_util::client::legacy::connect::{Connected, Connection, HttpConnector};
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioIo};
use rustls::pki_types::ServerName;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;
use tower_service::Service;
use tracing::debug;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Fixed transport settings shared by all backends
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum idle connections kept per backend
    pub max_idle_per_host: usize,
    /// Idle connections are evicted after this long
    pub idle_timeout: Duration,
    /// Upper bound for establishing the TCP connection
    pub connect_timeout: Duration,
    /// TCP keepalive interval on backend sockets
    pub keepalive: Duration,
    /// Upper bound for the TLS handshake with https backends
    pub tls_handshake_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_idle_per_host: 100,
            idle_timeout: Duration::from_secs(90),
            connect_timeout: Duration::from_secs(600),
            keepalive: Duration::from_secs(300),
            tls_handshake_timeout: Duration::from_secs(10),
        }
    }
}

/// Dials backends, adding TLS for `https` URIs
#[derive(Clone)]
pub struct BackendConnector {
    http: HttpConnector,
    tls: TlsConnector,
    handshake_timeout: Duration,
}

impl BackendConnector {
    pub fn new(config: &PoolConfig) -> Self {
        let mut http = HttpConnector::new();
        http.enforce_http(false);
        http.set_nodelay(true);
        http.set_connect_timeout(Some(config.connect_timeout));
        http.set_keepalive(Some(config.keepalive));

        let mut roots = rustls::RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

        let tls_config = rustls::ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();

        Self {
            http,
            tls: TlsConnector::from(Arc::new(tls_config)),
            handshake_timeout: config.tls_handshake_timeout,
        }
    }
}

impl Service<Uri> for BackendConnector {
    type Response = BackendIo;
    type Error = BoxError;
    type Future = Pin<Box<dyn Future<Output = Result<BackendIo, BoxError>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.http.poll_ready(cx).map_err(Into::into)
    }

    fn call(&mut self, uri: Uri) -> Self::Future {
        let mut http = self.http.clone();
        let tls = self.tls.clone();
        let handshake_timeout = self.handshake_timeout;

        Box::pin(async move {
            let secure = uri.scheme_str() == Some("https");
            let host = uri
                .host()
                .ok_or("backend URI has no host")?
                .trim_start_matches('[')
                .trim_end_matches(']')
                .to_string();

            let tcp = http.call(uri).await?;
            if !secure {
                return Ok(BackendIo::Plain(tcp));
            }

            let server_name = ServerName::try_from(host)?;
            let stream = tokio::time::timeout(
                handshake_timeout,
                tls.connect(server_name, tcp.into_inner()),
            )
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "TLS handshake timed out"))??;

            Ok(BackendIo::Tls(TokioIo::new(stream)))
        })
    }
}

/// A backend connection, plain or TLS
pub enum BackendIo {
    Plain(TokioIo<TcpStream>),
    Tls(TokioIo<TlsStream<TcpStream>>),
}

impl Connection for BackendIo {
    fn connected(&self) -> Connected {
        Connected::new()
    }
}

impl Read for BackendIo {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: ReadBufCursor<'_>,
    ) -> Poll<io::Result<()>> {
        match self.get_mut() {
            BackendIo::Plain(io) => Pin::new(io).poll_read(cx, buf),
            BackendIo::Tls(io) => Pin::new(io).poll_read(cx, buf),
        }
    }
}

impl Write for BackendIo {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match self.get_mut() {
            BackendIo::Plain(io) => Pin::new(io).poll_write(cx, buf),
            BackendIo::Tls(io) => Pin::new(io).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            BackendIo::Plain(io) => Pin::new(io).poll_flush(cx),
            BackendIo::Tls(io) => Pin::new(io).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match self.get_mut() {
            BackendIo::Plain(io) => Pin::new(io).poll_shutdown(cx),
            BackendIo::Tls(io) => Pin::new(io).poll_shutdown(cx),
        }
    }
}

/// Error type for connection pool operations
#[derive(Debug)]
pub enum PoolError {
    /// Error from the HTTP client
    Client(hyper_util::client::legacy::Error),
    /// Error building a request
    RequestBuild(String),
}

impl std::fmt::Display for PoolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PoolError::Client(e) => write!(f, "Client error: {}", e),
            PoolError::RequestBuild(s) => write!(f, "Request build error: {}", s),
        }
    }
}

impl std::error::Error for PoolError {}

impl From<hyper_util::client::legacy::Error> for PoolError {
    fn from(err: hyper_util::client::legacy::Error) -> Self {
        PoolError::Client(err)
    }
}

/// Pooled HTTP client used by every backend proxy
pub struct ConnectionPool {
    client: Client<BackendConnector, Incoming>,
    config: PoolConfig,
}

impl ConnectionPool {
    pub fn new(config: PoolConfig) -> Self {
        let client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(config.max_idle_per_host)
            .pool_idle_timeout(config.idle_timeout)
            .build(BackendConnector::new(&config));

        debug!(
            max_idle = config.max_idle_per_host,
            idle_timeout_secs = config.idle_timeout.as_secs(),
            connect_timeout_secs = config.connect_timeout.as_secs(),
            "Backend transport initialized"
        );

        Self { client, config }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Send an already rewritten request (absolute URI) to its backend
    pub async fn send_request(
        &self,
        req: Request<Incoming>,
    ) -> Result<Response<BoxBody<Bytes, hyper::Error>>, PoolError> {
        if req.uri().authority().is_none() {
            return Err(PoolError::RequestBuild(format!(
                "request URI {} has no authority",
                req.uri()
            )));
        }

        let response = self.client.request(req).await?;
        let (parts, body) = response.into_parts();
        Ok(Response::from_parts(parts, body.boxed()))
    }
}

impl Default for ConnectionPool {
    fn default() -> Self {
        Self::new(PoolConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_config_default() {
        let config = PoolConfig::default();
        assert_eq!(config.max_idle_per_host, 100);
        assert_eq!(config.idle_timeout, Duration::from_secs(90));
        assert_eq!(config.tls_handshake_timeout, Duration::from_secs(10));
        assert_eq!(config.keepalive, Duration::from_secs(300));
    }

    #[tokio::test]
    async fn test_pool_creation() {
        let config = PoolConfig {
            max_idle_per_host: 5,
            idle_timeout: Duration::from_secs(30),
            ..PoolConfig::default()
        };

        let pool = ConnectionPool::new(config);
        assert_eq!(pool.config().max_idle_per_host, 5);
        assert_eq!(pool.config().idle_timeout, Duration::from_secs(30));
    }

    #[tokio::test]
    async fn test_connector_refuses_closed_port() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let mut connector = BackendConnector::new(&PoolConfig::default());
        let uri: Uri = format!("http://127.0.0.1:{}/", port).parse().unwrap();
        assert!(connector.call(uri).await.is_err());
    }
}
