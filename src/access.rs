//! Per-request access decision seam

use crate::config::SessionSettings;
use hyper::{HeaderMap, Method, Uri};
use std::net::SocketAddr;
use std::time::Duration;

/// What the gateway knows about a request when asking for a verdict
#[derive(Debug)]
pub struct AccessRequest<'a> {
    pub hostname: &'a str,
    pub method: &'a Method,
    pub uri: &'a Uri,
    pub headers: &'a HeaderMap,
    pub client_addr: SocketAddr,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Allow,
    Deny(String),
}

/// Decides whether a request may reach its backend.
///
/// Consulted for every proxied request, after host matching and before
/// forwarding. Denied requests get `403 ACCESS_DENIED`.
pub trait AccessPolicy: Send + Sync + 'static {
    fn check(&self, request: &AccessRequest<'_>) -> Verdict;
}

/// Lets every request through
#[derive(Debug, Default, Clone, Copy)]
pub struct AllowAll;

impl AccessPolicy for AllowAll {
    fn check(&self, _request: &AccessRequest<'_>) -> Verdict {
        Verdict::Allow
    }
}

/// Policy of a configured gateway: admits every request and carries the
/// session signing key and lifetimes derived at boot
#[derive(Debug, Clone)]
pub struct OpenAccess {
    sessions: SessionSettings,
}

impl OpenAccess {
    pub fn new(sessions: SessionSettings) -> Self {
        Self { sessions }
    }

    pub fn sessions(&self) -> &SessionSettings {
        &self.sessions
    }

    /// Lifetime granted to a session asking for `requested`
    pub fn session_lifetime(&self, requested: Option<Duration>) -> Duration {
        self.sessions.lifetime(requested)
    }
}

impl AccessPolicy for OpenAccess {
    fn check(&self, _request: &AccessRequest<'_>) -> Verdict {
        Verdict::Allow
    }
}

impl<F> AccessPolicy for F
where
    F: Fn(&AccessRequest<'_>) -> Verdict + Send + Sync + 'static,
{
    fn check(&self, request: &AccessRequest<'_>) -> Verdict {
        self(request)
    }
}
