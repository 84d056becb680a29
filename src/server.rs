//! The live public listener
//!
//! A [`LiveServer`] owns one bound socket, the routing table it was built
//! with and every connection it accepted. Draining stops the accept loop,
//! asks open connections to finish gracefully and aborts whatever is still
//! running when the grace period ends, upgraded tunnels included.

use crate::access::{AccessPolicy, AccessRequest, Verdict};
use crate::error::{json_error_response, ProxyErrorCode, ReloadError};
use crate::proxy::Tunnels;
use crate::router::{management_response, request_hostname, Route, RoutingTable};
use http_body_util::combinators::BoxBody;
use hyper::body::{Bytes, Incoming};
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::{TokioExecutor, TokioIo, TokioTimer};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use rustls::ServerConfig;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};

/// Bound on reading a request head
const HEADER_READ_TIMEOUT: Duration = Duration::from_secs(15);

/// Bound on the TLS handshake of inbound connections
const TLS_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Everything a connection needs to answer requests
struct Handler {
    table: Arc<RoutingTable>,
    access: Arc<dyn AccessPolicy>,
    tunnels: Tunnels,
    is_tls: bool,
}

/// A bound, accepting listener and its connections
pub struct LiveServer {
    addr: SocketAddr,
    table: Arc<RoutingTable>,
    tls: Option<Arc<ServerConfig>>,
    tunnels: Tunnels,
    shutdown_tx: watch::Sender<bool>,
    accept_task: JoinHandle<JoinSet<()>>,
}

impl LiveServer {
    /// Bind `addr` and start accepting. Returns once the socket is listening.
    pub async fn bind(
        addr: SocketAddr,
        table: Arc<RoutingTable>,
        tls: Option<Arc<ServerConfig>>,
        access: Arc<dyn AccessPolicy>,
    ) -> Result<Self, ReloadError> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| ReloadError::Bind { addr, source })?;
        let local_addr = listener
            .local_addr()
            .map_err(|source| ReloadError::Bind { addr, source })?;

        let protocol = if tls.is_some() { "HTTPS" } else { "HTTP" };
        info!(
            addr = %local_addr,
            protocol,
            hosts = table.len(),
            "Gateway listening (HTTP/1.1 and HTTP/2)"
        );

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let tunnels = Tunnels::default();
        let handler = Arc::new(Handler {
            table: Arc::clone(&table),
            access,
            tunnels: tunnels.clone(),
            is_tls: tls.is_some(),
        });
        let acceptor = tls.clone().map(TlsAcceptor::from);
        let accept_task = tokio::spawn(accept_loop(listener, acceptor, handler, shutdown_rx));

        Ok(Self {
            addr: local_addr,
            table,
            tls,
            tunnels,
            shutdown_tx,
            accept_task,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn table(&self) -> &Arc<RoutingTable> {
        &self.table
    }

    pub fn tls(&self) -> Option<&Arc<ServerConfig>> {
        self.tls.as_ref()
    }

    /// Upgraded connections currently spliced through this server
    pub fn open_tunnels(&self) -> usize {
        self.tunnels.len()
    }

    /// Stop accepting and wait up to `grace` for open connections and
    /// tunnels. Returns the number that had to be aborted.
    pub async fn drain(self, grace: Duration) -> usize {
        let deadline = tokio::time::Instant::now() + grace;
        let _ = self.shutdown_tx.send(true);

        let mut connections = match self.accept_task.await {
            Ok(connections) => connections,
            Err(e) => {
                error!(addr = %self.addr, error = %e, "Accept loop ended abnormally");
                JoinSet::new()
            }
        };

        info!(
            addr = %self.addr,
            in_flight = connections.len(),
            tunnels = self.tunnels.len(),
            "Draining server"
        );

        let mut aborted = 0;
        let finished = tokio::time::timeout_at(deadline, async {
            while connections.join_next().await.is_some() {}
        })
        .await;
        if finished.is_err() {
            aborted += connections.len();
            connections.shutdown().await;
        }

        // Every connection is gone, so no new tunnel can appear
        let mut tunnels = self.tunnels.take();
        let finished = tokio::time::timeout_at(deadline, async {
            while tunnels.join_next().await.is_some() {}
        })
        .await;
        if finished.is_err() {
            aborted += tunnels.len();
            tunnels.shutdown().await;
        }

        if aborted == 0 {
            info!(addr = %self.addr, "Server drained");
        } else {
            warn!(
                addr = %self.addr,
                aborted,
                grace_ms = grace.as_millis() as u64,
                "Drain grace period expired, aborted remaining connections"
            );
        }
        aborted
    }
}

async fn accept_loop(
    listener: TcpListener,
    acceptor: Option<TlsAcceptor>,
    handler: Arc<Handler>,
    mut shutdown_rx: watch::Receiver<bool>,
) -> JoinSet<()> {
    let mut connections = JoinSet::new();

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, addr)) => {
                        connections.spawn(accept_connection(
                            stream,
                            addr,
                            acceptor.clone(),
                            Arc::clone(&handler),
                            shutdown_rx.clone(),
                        ));
                    }
                    Err(e) => {
                        error!(error = %e, "Failed to accept connection");
                    }
                }
            }
            // Reap finished connections so the set only holds live ones
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
            _ = shutdown_rx.changed() => {
                debug!("Accept loop stopping");
                break;
            }
        }
    }

    connections
}

async fn accept_connection(
    stream: TcpStream,
    addr: SocketAddr,
    acceptor: Option<TlsAcceptor>,
    handler: Arc<Handler>,
    shutdown_rx: watch::Receiver<bool>,
) {
    let Some(acceptor) = acceptor else {
        if let Err(e) = serve_connection(stream, addr, handler, shutdown_rx).await {
            debug!(addr = %addr, error = %e, "Connection error");
        }
        return;
    };

    match tokio::time::timeout(TLS_HANDSHAKE_TIMEOUT, acceptor.accept(stream)).await {
        Ok(Ok(tls_stream)) => {
            if let Err(e) = serve_connection(tls_stream, addr, handler, shutdown_rx).await {
                debug!(addr = %addr, error = %e, "TLS connection error");
            }
        }
        Ok(Err(e)) => debug!(addr = %addr, error = %e, "TLS handshake failed"),
        Err(_) => debug!(addr = %addr, "TLS handshake timed out"),
    }
}

async fn serve_connection<S>(
    stream: S,
    addr: SocketAddr,
    handler: Arc<Handler>,
    mut shutdown_rx: watch::Receiver<bool>,
) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let io = TokioIo::new(stream);

    let service = service_fn(move |req: Request<Incoming>| {
        let handler = Arc::clone(&handler);
        async move { Ok::<_, Infallible>(handle_request(req, &handler, addr).await) }
    });

    let mut builder = AutoBuilder::new(TokioExecutor::new());
    builder
        .http1()
        .timer(TokioTimer::new())
        .header_read_timeout(HEADER_READ_TIMEOUT)
        .preserve_header_case(true);
    builder.http2().max_concurrent_streams(250);

    let conn = builder.serve_connection_with_upgrades(io, service);
    tokio::pin!(conn);

    tokio::select! {
        result = conn.as_mut() => {
            result.map_err(|e| anyhow::anyhow!("Connection error: {}", e))?;
        }
        _ = shutdown_rx.changed() => {
            conn.as_mut().graceful_shutdown();
            conn.await
                .map_err(|e| anyhow::anyhow!("Connection error during drain: {}", e))?;
        }
    }

    Ok(())
}

async fn handle_request(
    req: Request<Incoming>,
    handler: &Handler,
    client_addr: SocketAddr,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    let started = Instant::now();
    let method = req.method().clone();
    let path = req.uri().path().to_string();

    let Some(hostname) = request_hostname(&req) else {
        return json_error_response(
            ProxyErrorCode::MissingHostHeader,
            "Missing or invalid Host header",
        );
    };

    let response = match handler.table.route(&hostname) {
        Route::Backend(proxy) => {
            let verdict = handler.access.check(&AccessRequest {
                hostname: &hostname,
                method: req.method(),
                uri: req.uri(),
                headers: req.headers(),
                client_addr,
            });

            match verdict {
                Verdict::Allow => {
                    proxy
                        .forward(req, client_addr, handler.is_tls, &handler.tunnels)
                        .await
                }
                Verdict::Deny(reason) => {
                    debug!(hostname, client = %client_addr, reason, "Access denied");
                    json_error_response(ProxyErrorCode::AccessDenied, "Access denied")
                }
            }
        }
        Route::Management => management_response(&req),
        // Don't reveal which hosts exist
        Route::Unknown => json_error_response(ProxyErrorCode::UnknownHost, "Unknown or unconfigured host"),
    };

    debug!(
        method = %method,
        hostname,
        path,
        status = response.status().as_u16(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        client = %client_addr,
        "Request"
    );

    response
}
