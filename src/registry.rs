//! Durable registry of virtual hosts
//!
//! Every host is one row keyed by its hostname. All operations go through a
//! single connection guarded by a mutex, so mutations are serialized against
//! each other and readers only ever observe fully-applied states.

use crate::error::RegistryError;
use parking_lot::Mutex;
use rusqlite::{params, Connection, ErrorCode, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use tracing::{debug, info};

/// Current schema version for migrations
const SCHEMA_VERSION: i32 = 1;

/// Kind of backend a host forwards to
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum HostType {
    /// Plain HTTP(S) reverse proxying
    #[default]
    Http,
    /// Anything else. Kept verbatim so the routing build can reject it.
    Unsupported(String),
}

impl From<String> for HostType {
    fn from(value: String) -> Self {
        if value.trim().eq_ignore_ascii_case("http") {
            HostType::Http
        } else {
            HostType::Unsupported(value)
        }
    }
}

impl From<HostType> for String {
    fn from(value: HostType) -> Self {
        value.to_string()
    }
}

impl fmt::Display for HostType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HostType::Http => f.write_str("http"),
            HostType::Unsupported(other) => f.write_str(other),
        }
    }
}

/// A virtual host definition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Host {
    /// DNS name the host is served under (primary key)
    pub hostname: String,
    /// Target URL, scheme and authority (e.g. `http://127.0.0.1:9000`)
    pub backend: String,
    #[serde(rename = "type", default)]
    pub host_type: HostType,
}

impl Host {
    /// Create an `http` host
    pub fn http(hostname: impl Into<String>, backend: impl Into<String>) -> Self {
        Self {
            hostname: hostname.into(),
            backend: backend.into(),
            host_type: HostType::Http,
        }
    }

    fn normalized(&self) -> Result<Self, RegistryError> {
        let hostname = normalize_hostname(&self.hostname);
        if hostname.is_empty() {
            return Err(RegistryError::InvalidHost("hostname must not be empty".to_string()));
        }
        Ok(Self {
            hostname,
            backend: self.backend.trim().to_string(),
            host_type: self.host_type.clone(),
        })
    }
}

/// Lowercase, trim whitespace and a trailing dot
pub fn normalize_hostname(hostname: &str) -> String {
    hostname.trim().trim_end_matches('.').to_ascii_lowercase()
}

/// SQLite-backed host registry
pub struct HostRegistry {
    conn: Mutex<Connection>,
}

impl HostRegistry {
    /// Open or create a registry at the given path
    pub fn open(path: impl AsRef<Path>) -> Result<Self, RegistryError> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|_| {
                    RegistryError::PersistenceFailure(rusqlite::Error::InvalidPath(
                        path.to_path_buf(),
                    ))
                })?;
            }
        }

        let conn = Connection::open(path)?;

        // FULL sync: a committed write is on disk before the call returns
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=FULL;")?;

        let registry = Self {
            conn: Mutex::new(conn),
        };
        registry.run_migrations()?;

        info!(path = %path.display(), "Host registry opened");
        Ok(registry)
    }

    /// Open an in-memory registry (for testing)
    pub fn open_in_memory() -> Result<Self, RegistryError> {
        let conn = Connection::open_in_memory()?;
        let registry = Self {
            conn: Mutex::new(conn),
        };
        registry.run_migrations()?;
        Ok(registry)
    }

    fn run_migrations(&self) -> Result<(), RegistryError> {
        let conn = self.conn.lock();

        conn.execute(
            "CREATE TABLE IF NOT EXISTS schema_migrations (
                version INTEGER PRIMARY KEY,
                applied_at TEXT NOT NULL DEFAULT (datetime('now'))
            )",
            [],
        )?;

        let current_version: i32 = conn
            .query_row(
                "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
                [],
                |row| row.get(0),
            )
            .unwrap_or(0);

        if current_version < 1 {
            debug!("Applying migration v1: hosts table");
            conn.execute_batch(
                r#"
                CREATE TABLE IF NOT EXISTS hosts (
                    hostname TEXT PRIMARY KEY,
                    backend TEXT NOT NULL,
                    type TEXT NOT NULL DEFAULT 'http',
                    created_at TEXT NOT NULL DEFAULT (datetime('now'))
                );
                INSERT INTO schema_migrations (version) VALUES (1);
                "#,
            )?;
        }

        debug!(version = SCHEMA_VERSION, "Registry schema up to date");
        Ok(())
    }

    /// Register a new host and return the stored record.
    /// Fails with `DuplicateKey` if the hostname exists.
    ///
    /// The record is stored in canonical form: the hostname trimmed,
    /// lowercased and without a trailing dot, the backend trimmed. `get`
    /// returns exactly what `add` returned, which equals the input when the
    /// input was already canonical.
    pub fn add(&self, host: &Host) -> Result<Host, RegistryError> {
        let host = host.normalized()?;
        let conn = self.conn.lock();

        match conn.execute(
            "INSERT INTO hosts (hostname, backend, type) VALUES (?1, ?2, ?3)",
            params![host.hostname, host.backend, host.host_type.to_string()],
        ) {
            Ok(_) => {
                debug!(hostname = %host.hostname, backend = %host.backend, "Host added");
                Ok(host)
            }
            Err(rusqlite::Error::SqliteFailure(err, _))
                if err.code == ErrorCode::ConstraintViolation =>
            {
                Err(RegistryError::DuplicateKey(host.hostname))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Look up a host by hostname
    pub fn get(&self, hostname: &str) -> Result<Host, RegistryError> {
        let hostname = normalize_hostname(hostname);
        let conn = self.conn.lock();

        conn.query_row(
            "SELECT hostname, backend, type FROM hosts WHERE hostname = ?1",
            params![hostname],
            |row| {
                Ok(Host {
                    hostname: row.get(0)?,
                    backend: row.get(1)?,
                    host_type: HostType::from(row.get::<_, String>(2)?),
                })
            },
        )
        .optional()?
        .ok_or(RegistryError::NotFound(hostname))
    }

    /// All registered hosts, read under the registry lock
    pub fn list(&self) -> Result<Vec<Host>, RegistryError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT hostname, backend, type FROM hosts ORDER BY hostname")?;

        let hosts = stmt
            .query_map([], |row| {
                Ok(Host {
                    hostname: row.get(0)?,
                    backend: row.get(1)?,
                    host_type: HostType::from(row.get::<_, String>(2)?),
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(hosts)
    }

    /// Remove a host. Fails with `NotFound` if it is not registered.
    pub fn delete(&self, hostname: &str) -> Result<(), RegistryError> {
        let hostname = normalize_hostname(hostname);
        let conn = self.conn.lock();

        let affected = conn.execute("DELETE FROM hosts WHERE hostname = ?1", params![hostname])?;
        if affected == 0 {
            return Err(RegistryError::NotFound(hostname));
        }

        debug!(hostname = %hostname, "Host deleted");
        Ok(())
    }
}
