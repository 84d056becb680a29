//! Hostgate - A TLS-terminating virtual host gateway
//!
//! This library provides a gateway that:
//! - Routes HTTP and WebSocket traffic by Host header to registered backends
//! - Keeps the host registry in SQLite so it survives restarts
//! - Rebuilds its routing table and restarts its listener when hosts change
//! - Drains in-flight connections gracefully before each restart
//! - Supports automatic TLS via ACME/Let's Encrypt (TLS-ALPN-01)
//! - Exposes a JSON control interface for managing hosts

pub mod access;
pub mod acme;
pub mod config;
pub mod control;
pub mod error;
pub mod pool;
pub mod proxy;
pub mod registry;
pub mod reload;
pub mod router;
pub mod server;
pub mod tls;
