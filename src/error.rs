//! Error types and JSON error responses for the gateway

use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use serde::Serialize;
use std::net::SocketAddr;
use thiserror::Error;

/// Errors returned by the host registry
#[derive(Debug, Error)]
pub enum RegistryError {
    /// A host with the same hostname is already registered
    #[error("host already registered: {0}")]
    DuplicateKey(String),
    /// No host with this hostname is registered
    #[error("host not found: {0}")]
    NotFound(String),
    /// The host record itself is unusable (e.g. empty hostname)
    #[error("invalid host: {0}")]
    InvalidHost(String),
    /// The storage engine failed; the registry is unchanged
    #[error("persistence failure: {0}")]
    PersistenceFailure(#[from] rusqlite::Error),
}

impl RegistryError {
    /// Stable error code used on the control channel
    pub fn code(&self) -> &'static str {
        match self {
            RegistryError::DuplicateKey(_) => "DUPLICATE_KEY",
            RegistryError::NotFound(_) => "NOT_FOUND",
            RegistryError::InvalidHost(_) => "INVALID_HOST",
            RegistryError::PersistenceFailure(_) => "PERSISTENCE_FAILURE",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            RegistryError::DuplicateKey(_) => StatusCode::CONFLICT,
            RegistryError::NotFound(_) => StatusCode::NOT_FOUND,
            RegistryError::InvalidHost(_) => StatusCode::BAD_REQUEST,
            RegistryError::PersistenceFailure(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Boot-time configuration errors. Always fatal.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("configuration errors:\n  - {}", .0.join("\n  - "))]
    Invalid(Vec<String>),
    #[error("failed to derive signing key: {0}")]
    KeyDerivation(String),
}

/// A single host's backend could not be turned into a proxy.
/// The host is excluded from the routing table; the build continues.
#[derive(Debug, Error)]
#[error("invalid backend '{backend}' for host {hostname}: {reason}")]
pub struct ProxyConfigError {
    pub hostname: String,
    pub backend: String,
    pub reason: String,
}

/// Failures while obtaining TLS material for the live server
#[derive(Debug, Error)]
pub enum CertificateError {
    #[error("certificate cache error: {0}")]
    Cache(String),
    #[error("ACME error: {0}")]
    Acme(String),
    #[error("certificate generation failed: {0}")]
    Generate(String),
    #[error("TLS configuration error: {0}")]
    Tls(#[from] rustls::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Failures that abort a whole routing table build
#[derive(Debug, Error)]
pub enum RouteBuildError {
    #[error("host {hostname} has unsupported type '{host_type}', only http is supported")]
    UnsupportedType { hostname: String, host_type: String },
}

/// Failures of a reload cycle's Starting phase
#[derive(Debug, Error)]
pub enum ReloadError {
    #[error("failed to load hosts: {0}")]
    Registry(#[from] RegistryError),
    #[error("failed to build routing table: {0}")]
    Routing(#[from] RouteBuildError),
    #[error("failed to obtain certificates: {0}")]
    Certificate(#[from] CertificateError),
    #[error("failed to bind listener on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
}

/// Error codes for responses generated by the gateway itself
#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProxyErrorCode {
    /// Missing Host header in request
    MissingHostHeader,
    /// Unknown or unconfigured host
    UnknownHost,
    /// The access decision rejected the request
    AccessDenied,
    /// Path not served by the management surface
    NotFound,
    /// Failed to connect to backend
    ConnectionFailed,
    /// Internal gateway error
    InternalError,
}

impl ProxyErrorCode {
    /// Get the default HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            ProxyErrorCode::MissingHostHeader => StatusCode::BAD_REQUEST,
            ProxyErrorCode::UnknownHost => StatusCode::NOT_FOUND,
            ProxyErrorCode::AccessDenied => StatusCode::FORBIDDEN,
            ProxyErrorCode::NotFound => StatusCode::NOT_FOUND,
            ProxyErrorCode::ConnectionFailed => StatusCode::BAD_GATEWAY,
            ProxyErrorCode::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Get the error code as a string for the X-Proxy-Error header
    pub fn as_header_value(&self) -> &'static str {
        match self {
            ProxyErrorCode::MissingHostHeader => "MISSING_HOST_HEADER",
            ProxyErrorCode::UnknownHost => "UNKNOWN_HOST",
            ProxyErrorCode::AccessDenied => "ACCESS_DENIED",
            ProxyErrorCode::NotFound => "NOT_FOUND",
            ProxyErrorCode::ConnectionFailed => "CONNECTION_FAILED",
            ProxyErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }
}

/// JSON error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub code: ProxyErrorCode,
    pub message: String,
    pub status: u16,
}

impl ErrorResponse {
    pub fn new(code: ProxyErrorCode, message: impl Into<String>) -> Self {
        Self {
            status: code.status_code().as_u16(),
            code,
            message: message.into(),
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(
                r#"{{"code":"{}","message":"{}","status":{}}}"#,
                self.code.as_header_value(),
                self.message.replace('\"', "\\\""),
                self.status
            )
        })
    }
}

/// Create a JSON error response with X-Proxy-Error header
pub fn json_error_response(
    code: ProxyErrorCode,
    message: impl Into<String>,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    let error = ErrorResponse::new(code, message);
    let body = error.to_json();

    Response::builder()
        .status(code.status_code())
        .header("Content-Type", "application/json")
        .header("X-Proxy-Error", code.as_header_value())
        .body(Full::new(Bytes::from(body)).map_err(|e| match e {}).boxed())
        .expect("valid response with StatusCode enum and static headers")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_status_codes() {
        assert_eq!(
            ProxyErrorCode::MissingHostHeader.status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(ProxyErrorCode::UnknownHost.status_code(), StatusCode::NOT_FOUND);
        assert_eq!(ProxyErrorCode::AccessDenied.status_code(), StatusCode::FORBIDDEN);
        assert_eq!(
            ProxyErrorCode::ConnectionFailed.status_code(),
            StatusCode::BAD_GATEWAY
        );
    }

    #[test]
    fn test_access_denied_body() {
        let error = ErrorResponse::new(ProxyErrorCode::AccessDenied, "session \"abc\" expired");
        let body: serde_json::Value = serde_json::from_str(&error.to_json()).unwrap();

        assert_eq!(body["code"], "ACCESS_DENIED");
        assert_eq!(body["status"], 403);
        assert_eq!(body["message"], "session \"abc\" expired");
    }

    #[test]
    fn test_json_error_response_headers() {
        let response = json_error_response(ProxyErrorCode::ConnectionFailed, "backend down");

        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        assert_eq!(
            response.headers().get("Content-Type").unwrap(),
            "application/json"
        );
        assert_eq!(
            response.headers().get("X-Proxy-Error").unwrap(),
            "CONNECTION_FAILED"
        );
    }

    #[test]
    fn test_registry_error_codes() {
        assert_eq!(RegistryError::DuplicateKey("a".into()).code(), "DUPLICATE_KEY");
        assert_eq!(
            RegistryError::NotFound("a".into()).status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            RegistryError::DuplicateKey("a".into()).status_code(),
            StatusCode::CONFLICT
        );
    }

    #[test]
    fn test_config_error_lists_all_problems() {
        let err = ConfigError::Invalid(vec!["first".into(), "second".into()]);
        let msg = err.to_string();
        assert!(msg.contains("- first"));
        assert!(msg.contains("- second"));
    }
}
