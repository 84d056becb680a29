//! ACME (Let's Encrypt) certificates via TLS-ALPN-01
//!
//! One certificate per domain, cached on disk as
//! `<cache_dir>/<domain>/{cert,key}.pem`. Domains without a usable
//! certificate are issued before a server configuration is handed out,
//! while a temporary listener on the public address answers validation.
//! Renewals run in the background; the SNI resolver is shared by every
//! listener the reload controller creates, so renewed certificates take
//! effect without another reload.
//!
//! # Key Storage
//! The ACME account key and certificate private keys are stored unencrypted
//! in the cache directory (keys with mode 0600 on Unix). Restrict the
//! directory to the service user and back it up securely.

use crate::error::CertificateError;
use crate::tls::{certified_key, parse_certs, parse_private_key, CertificateClient, ALPN_PROTOCOLS};
use async_trait::async_trait;
use instant_acme::{
    Account, AccountCredentials, AuthorizationStatus, ChallengeType, Identifier, LetsEncrypt,
    NewAccount, NewOrder, OrderStatus,
};
use parking_lot::RwLock;
use rcgen::{CertificateParams, CustomExtension, DistinguishedName, DnType, KeyPair, PKCS_ECDSA_P256_SHA256};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use rustls::ServerConfig;
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{watch, Mutex};
use tokio::task::{JoinHandle, JoinSet};
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};

const ACME_TLS_ALPN_NAME: &[u8] = b"acme-tls/1";

/// Renew certificates with fewer days left than this
const RENEW_BEFORE_DAYS: u64 = 30;

/// How often cached certificates are checked for renewal
const RENEWAL_INTERVAL: Duration = Duration::from_secs(12 * 60 * 60);

/// Attempts while polling authorizations and orders
const MAX_POLL_ATTEMPTS: u32 = 30;
const POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Bound on issuing every missing certificate of one domain list
const ISSUANCE_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// Bound on a validator's handshake with the challenge listener
const CHALLENGE_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Hands out per-domain certificates by SNI, and challenge certificates to
/// ACME validators negotiating `acme-tls/1`
#[derive(Default)]
pub struct SniResolver {
    certs: RwLock<HashMap<String, Arc<CertifiedKey>>>,
    challenges: RwLock<HashMap<String, Arc<CertifiedKey>>>,
}

impl std::fmt::Debug for SniResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SniResolver")
            .field("domains", &self.certs.read().keys().collect::<Vec<_>>())
            .field("challenges", &self.challenges.read().len())
            .finish()
    }
}

impl SniResolver {
    pub fn set_cert(&self, domain: &str, cert: Arc<CertifiedKey>) {
        self.certs.write().insert(domain.to_string(), cert);
    }

    pub fn cert(&self, domain: &str) -> Option<Arc<CertifiedKey>> {
        self.certs.read().get(domain).cloned()
    }

    pub fn has_cert(&self, domain: &str) -> bool {
        self.certs.read().contains_key(domain)
    }

    fn set_challenge_cert(&self, domain: &str, cert: Arc<CertifiedKey>) {
        self.challenges.write().insert(domain.to_string(), cert);
    }

    fn remove_challenge_cert(&self, domain: &str) {
        self.challenges.write().remove(domain);
    }
}

impl ResolvesServerCert for SniResolver {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        let sni = client_hello.server_name()?.to_ascii_lowercase();

        let is_acme_challenge = client_hello
            .alpn()
            .map(|mut alpn| alpn.any(|p| p == ACME_TLS_ALPN_NAME))
            .unwrap_or(false);

        if is_acme_challenge {
            return self.challenges.read().get(&sni).cloned();
        }

        self.cert(&sni)
    }
}

/// Certificate client backed by an ACME directory
#[derive(Clone)]
pub struct AcmeCertificates {
    inner: Arc<AcmeState>,
    /// Where validators connect while the public listener is down
    challenge_addr: Option<SocketAddr>,
}

struct AcmeState {
    email: String,
    directory_url: String,
    cache_dir: PathBuf,
    resolver: Arc<SniResolver>,
    account: Mutex<Option<Arc<Account>>>,
    /// Domains with an issuance task in flight
    pending: parking_lot::Mutex<HashSet<String>>,
    /// Domain list of the most recent reload, swept for renewals
    domains: RwLock<Vec<String>>,
}

impl AcmeCertificates {
    pub fn new(email: &str, staging: bool, cache_dir: &str) -> Result<Self, CertificateError> {
        let directory_url = if staging {
            LetsEncrypt::Staging.url()
        } else {
            LetsEncrypt::Production.url()
        };
        Self::with_directory(email, directory_url, cache_dir)
    }

    /// Use an arbitrary ACME directory
    pub fn with_directory(
        email: &str,
        directory_url: &str,
        cache_dir: &str,
    ) -> Result<Self, CertificateError> {
        let cache_dir = validate_cache_dir(cache_dir)?;
        std::fs::create_dir_all(&cache_dir)?;

        info!(
            email,
            directory = directory_url,
            cache_dir = %cache_dir.display(),
            "ACME certificate provisioning enabled (TLS-ALPN-01)"
        );

        Ok(Self {
            inner: Arc::new(AcmeState {
                email: email.to_string(),
                directory_url: directory_url.to_string(),
                cache_dir,
                resolver: Arc::new(SniResolver::default()),
                account: Mutex::new(None),
                pending: parking_lot::Mutex::new(HashSet::new()),
                domains: RwLock::new(Vec::new()),
            }),
            challenge_addr: None,
        })
    }

    /// Answer TLS-ALPN-01 validation on `addr` while issuing. This must be
    /// the public listener's address, which is free while a reload issues.
    pub fn with_challenge_listener(mut self, addr: SocketAddr) -> Self {
        self.challenge_addr = Some(addr);
        self
    }

    pub fn resolver(&self) -> Arc<SniResolver> {
        Arc::clone(&self.inner.resolver)
    }

    /// Periodically renew certificates of the current domain list
    pub fn spawn_renewal(&self, mut shutdown_rx: watch::Receiver<bool>) -> JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(RENEWAL_INTERVAL) => {
                        let domains = this.inner.domains.read().clone();
                        debug!(count = domains.len(), "Checking certificates for renewal");
                        for domain in domains {
                            let due = this
                                .inner
                                .resolver
                                .cert(&domain)
                                .and_then(|ck| ck.cert.first().cloned())
                                .map(|leaf| !is_cert_valid_for_days(&leaf, RENEW_BEFORE_DAYS))
                                .unwrap_or(true);
                            if due {
                                this.spawn_issuance(domain);
                            }
                        }
                    }
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            debug!("Certificate renewal task shutting down");
                            break;
                        }
                    }
                }
            }
        })
    }

    /// Install a usable certificate for `domain` from memory or the cache.
    /// Returns `false` when one has to be issued.
    fn ensure(&self, domain: &str) -> bool {
        let installed = self
            .inner
            .resolver
            .cert(domain)
            .and_then(|ck| ck.cert.first().cloned())
            .map(|leaf| is_cert_valid_for_days(&leaf, RENEW_BEFORE_DAYS))
            .unwrap_or(false);
        if installed {
            return true;
        }

        match self.load_cached(domain) {
            Ok(Some(cert)) => {
                self.inner.resolver.set_cert(domain, cert);
                debug!(domain, "Installed cached certificate");
                true
            }
            Ok(None) => false,
            Err(e) => {
                warn!(domain, error = %e, "Unreadable cached certificate, reissuing");
                false
            }
        }
    }

    /// Issue certificates for `domains` one after another, answering
    /// validation on the challenge address meanwhile
    async fn issue_missing(&self, domains: &[String]) -> Result<(), CertificateError> {
        let listener = match self.challenge_addr {
            Some(addr) => {
                let listener = ChallengeListener::bind(addr, self.resolver())
                    .await
                    .map_err(|e| {
                        CertificateError::Acme(format!("challenge listener on {}: {}", addr, e))
                    })?;
                Some(listener)
            }
            None => None,
        };

        let issued = tokio::time::timeout(ISSUANCE_TIMEOUT, async {
            for domain in domains {
                self.issue(domain)
                    .await
                    .map_err(|e| CertificateError::Acme(format!("{}: {:#}", domain, e)))?;
                info!(domain = %domain, "Certificate issued");
            }
            Ok::<(), CertificateError>(())
        })
        .await
        .unwrap_or_else(|_| {
            Err(CertificateError::Acme(format!(
                "issuance did not finish within {}s",
                ISSUANCE_TIMEOUT.as_secs()
            )))
        });

        if let Some(listener) = listener {
            listener.stop().await;
        }
        issued
    }

    fn spawn_issuance(&self, domain: String) {
        if !self.inner.pending.lock().insert(domain.clone()) {
            return;
        }

        let this = self.clone();
        tokio::spawn(async move {
            match this.issue(&domain).await {
                Ok(()) => info!(domain = %domain, "Certificate issued"),
                Err(e) => error!(domain = %domain, error = %e, "Certificate issuance failed"),
            }
            this.inner.pending.lock().remove(&domain);
        });
    }

    fn domain_dir(&self, domain: &str) -> Result<PathBuf, CertificateError> {
        let valid = !domain.is_empty()
            && !domain.starts_with('.')
            && domain
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.');
        if !valid {
            return Err(CertificateError::Cache(format!(
                "refusing to cache certificate for domain '{}'",
                domain
            )));
        }
        Ok(self.inner.cache_dir.join(domain))
    }

    /// Cached certificate for `domain`, if present and not due for renewal
    fn load_cached(&self, domain: &str) -> Result<Option<Arc<CertifiedKey>>, CertificateError> {
        let dir = self.domain_dir(domain)?;
        let cert_path = dir.join("cert.pem");
        let key_path = dir.join("key.pem");

        if !cert_path.exists() || !key_path.exists() {
            return Ok(None);
        }

        let certs = parse_certs(&std::fs::read(&cert_path)?)?;
        let key = parse_private_key(&std::fs::read(&key_path)?)?;

        if !certs
            .first()
            .map(|leaf| is_cert_valid_for_days(leaf, RENEW_BEFORE_DAYS))
            .unwrap_or(false)
        {
            info!(domain, "Cached certificate expires within 30 days, will renew");
            return Ok(None);
        }

        Ok(Some(certified_key(certs, &key)?))
    }

    /// Save a certificate chain and key with restricted permissions
    fn save_cert(&self, domain: &str, cert_chain_pem: &str, private_key_pem: &str) -> Result<(), CertificateError> {
        let dir = self.domain_dir(domain)?;
        std::fs::create_dir_all(&dir)?;

        // Certificate can be world-readable
        std::fs::write(dir.join("cert.pem"), cert_chain_pem)?;
        write_private(&dir.join("key.pem"), private_key_pem.as_bytes())?;

        debug!(domain, path = %dir.display(), "Certificate saved to cache");
        Ok(())
    }

    async fn account(&self) -> anyhow::Result<Arc<Account>> {
        let mut slot = self.inner.account.lock().await;
        if let Some(account) = slot.as_ref() {
            return Ok(Arc::clone(account));
        }

        let account_path = self.inner.cache_dir.join("account.json");
        let account = if account_path.exists() {
            debug!(path = %account_path.display(), "Loading existing ACME account");
            let data = std::fs::read_to_string(&account_path)?;
            let credentials: AccountCredentials = serde_json::from_str(&data)?;
            Account::from_credentials(credentials).await?
        } else {
            info!("Creating new ACME account");
            let (account, credentials) = Account::create(
                &NewAccount {
                    contact: &[&format!("mailto:{}", self.inner.email)],
                    terms_of_service_agreed: true,
                    only_return_existing: false,
                },
                &self.inner.directory_url,
                None,
            )
            .await?;

            let data = serde_json::to_string_pretty(&credentials)?;
            write_private(&account_path, data.as_bytes())?;
            info!(path = %account_path.display(), "ACME account credentials saved");
            account
        };

        let account = Arc::new(account);
        *slot = Some(Arc::clone(&account));
        Ok(account)
    }

    /// Run one TLS-ALPN-01 order for `domain` and install the result
    async fn issue(&self, domain: &str) -> anyhow::Result<()> {
        let account = self.account().await?;
        info!(domain, "Requesting new certificate");

        let identifiers = [Identifier::Dns(domain.to_string())];
        let mut order = account
            .new_order(&NewOrder {
                identifiers: &identifiers,
            })
            .await?;

        for authz in order.authorizations().await? {
            if authz.status == AuthorizationStatus::Valid {
                continue;
            }

            let identifier = match &authz.identifier {
                Identifier::Dns(domain) => domain.clone(),
            };

            let challenge = authz
                .challenges
                .iter()
                .find(|c| c.r#type == ChallengeType::TlsAlpn01)
                .ok_or_else(|| anyhow::anyhow!("TLS-ALPN-01 not offered for {}", identifier))?;

            let key_auth = order.key_authorization(challenge);
            let digest: Vec<u8> = key_auth.digest().as_ref().to_vec();

            debug!(domain = %identifier, "Setting up TLS-ALPN-01 challenge");
            let challenge_cert = create_tls_alpn01_cert(&identifier, &digest)?;
            self.inner.resolver.set_challenge_cert(&identifier, challenge_cert);

            order.set_challenge_ready(&challenge.url).await?;
            let outcome = self.wait_for_authorization(&mut order, &identifier).await;
            self.inner.resolver.remove_challenge_cert(&identifier);
            outcome?;
        }

        let mut attempts = 0;
        loop {
            match order.state().status {
                OrderStatus::Ready | OrderStatus::Valid => break,
                OrderStatus::Invalid => anyhow::bail!("Order invalid for {}", domain),
                OrderStatus::Pending | OrderStatus::Processing => {
                    attempts += 1;
                    if attempts > MAX_POLL_ATTEMPTS {
                        anyhow::bail!("Order timeout for {}", domain);
                    }
                    tokio::time::sleep(POLL_INTERVAL).await;
                    order.refresh().await?;
                }
            }
        }

        let mut params = CertificateParams::new(vec![domain.to_string()])?;
        params.distinguished_name = DistinguishedName::new();
        params.distinguished_name.push(DnType::CommonName, domain.to_string());

        let private_key = KeyPair::generate_for(&PKCS_ECDSA_P256_SHA256)?;
        let csr = params.serialize_request(&private_key)?;
        order.finalize(csr.der()).await?;

        let mut attempts = 0;
        let cert_chain_pem: String = loop {
            order.refresh().await?;
            match order.state().status {
                OrderStatus::Valid => {
                    if let Some(cert) = order.certificate().await? {
                        break cert;
                    }
                    anyhow::bail!("Order valid but no certificate returned");
                }
                OrderStatus::Processing => {
                    attempts += 1;
                    if attempts > MAX_POLL_ATTEMPTS {
                        anyhow::bail!("Certificate timeout for {}", domain);
                    }
                    tokio::time::sleep(POLL_INTERVAL).await;
                }
                _ => anyhow::bail!("Unexpected order status: {:?}", order.state().status),
            }
        };

        let private_key_pem = private_key.serialize_pem();
        let certs = parse_certs(cert_chain_pem.as_bytes())?;
        let key = PrivateKeyDer::try_from(private_key.serialize_der())
            .map_err(|e| anyhow::anyhow!("Failed to parse private key: {}", e))?;

        self.save_cert(domain, &cert_chain_pem, &private_key_pem)?;
        self.inner.resolver.set_cert(domain, certified_key(certs, &key)?);
        Ok(())
    }

    async fn wait_for_authorization(
        &self,
        order: &mut instant_acme::Order,
        identifier: &str,
    ) -> anyhow::Result<()> {
        let mut attempts = 0;
        loop {
            tokio::time::sleep(POLL_INTERVAL).await;

            order.refresh().await?;
            let auths = order.authorizations().await?;
            let current = auths
                .iter()
                .find(|a| matches!(&a.identifier, Identifier::Dns(d) if d == identifier));

            match current.map(|a| &a.status) {
                Some(AuthorizationStatus::Valid) => {
                    info!(domain = %identifier, "Authorization valid");
                    return Ok(());
                }
                Some(AuthorizationStatus::Pending) => {
                    attempts += 1;
                    if attempts > MAX_POLL_ATTEMPTS {
                        anyhow::bail!("Authorization timeout for {}", identifier);
                    }
                    debug!(domain = %identifier, attempt = attempts, "Waiting for authorization");
                }
                Some(AuthorizationStatus::Invalid) => {
                    anyhow::bail!("Authorization failed for {}", identifier);
                }
                Some(status) => {
                    debug!(domain = %identifier, status = ?status, "Authorization status");
                }
                None => {
                    anyhow::bail!("Authorization not found for {}", identifier);
                }
            }
        }
    }
}

#[async_trait]
impl CertificateClient for AcmeCertificates {
    /// Install cached certificates, issue the missing ones, and return a
    /// configuration that resolves by SNI. Fails if any issuance fails.
    async fn server_config(
        &self,
        domains: &[String],
    ) -> Result<Option<Arc<ServerConfig>>, CertificateError> {
        let mut valid = Vec::with_capacity(domains.len());
        let mut missing = Vec::new();
        for domain in domains {
            if self.domain_dir(domain).is_err() {
                warn!(domain = %domain, "Skipping certificate for invalid domain name");
                continue;
            }
            if !self.ensure(domain) {
                missing.push(domain.clone());
            }
            valid.push(domain.clone());
        }

        if !missing.is_empty() {
            info!(domains = ?missing, "Issuing missing certificates");
            self.issue_missing(&missing).await?;
        }
        *self.inner.domains.write() = valid;

        let mut config = ServerConfig::builder()
            .with_no_client_auth()
            .with_cert_resolver(self.resolver());
        config.alpn_protocols = ALPN_PROTOCOLS
            .iter()
            .map(|p| p.to_vec())
            .chain(std::iter::once(ACME_TLS_ALPN_NAME.to_vec()))
            .collect();

        Ok(Some(Arc::new(config)))
    }
}

/// Temporary listener that only completes TLS-ALPN-01 handshakes
struct ChallengeListener {
    addr: SocketAddr,
    task: JoinHandle<()>,
}

impl ChallengeListener {
    async fn bind(addr: SocketAddr, resolver: Arc<SniResolver>) -> std::io::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let addr = listener.local_addr()?;

        let mut config = ServerConfig::builder()
            .with_no_client_auth()
            .with_cert_resolver(resolver);
        config.alpn_protocols = vec![ACME_TLS_ALPN_NAME.to_vec()];
        let acceptor = TlsAcceptor::from(Arc::new(config));

        debug!(addr = %addr, "Challenge listener started");
        let task = tokio::spawn(serve_challenges(listener, acceptor));
        Ok(Self { addr, task })
    }

    /// Close the socket; returns once the address is free again
    async fn stop(self) {
        self.task.abort();
        let _ = self.task.await;
        debug!(addr = %self.addr, "Challenge listener stopped");
    }
}

async fn serve_challenges(listener: TcpListener, acceptor: TlsAcceptor) {
    let mut handshakes = JoinSet::new();
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, peer) = match accepted {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        warn!(error = %e, "Challenge listener failed to accept");
                        continue;
                    }
                };
                let acceptor = acceptor.clone();
                handshakes.spawn(async move {
                    let handshake = acceptor.accept(stream);
                    match tokio::time::timeout(CHALLENGE_HANDSHAKE_TIMEOUT, handshake).await {
                        Ok(Ok(_)) => debug!(peer = %peer, "Answered TLS-ALPN-01 validation"),
                        Ok(Err(e)) => debug!(peer = %peer, error = %e, "Challenge handshake failed"),
                        Err(_) => debug!(peer = %peer, "Challenge handshake timed out"),
                    }
                });
            }
            Some(_) = handshakes.join_next(), if !handshakes.is_empty() => {}
        }
    }
}

/// Write a secret file readable by the owner only
fn write_private(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        let mut file = std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(path)?;
        std::io::Write::write_all(&mut file, contents)
    }
    #[cfg(not(unix))]
    {
        std::fs::write(path, contents)
    }
}

/// Create a TLS-ALPN-01 challenge certificate (RFC 8737)
fn create_tls_alpn01_cert(domain: &str, digest: &[u8]) -> anyhow::Result<Arc<CertifiedKey>> {
    let mut params = CertificateParams::new(vec![domain.to_string()])?;
    params
        .custom_extensions
        .push(CustomExtension::new_acme_identifier(digest));

    let key_pair = KeyPair::generate_for(&PKCS_ECDSA_P256_SHA256)?;
    let cert = params.self_signed(&key_pair)?;

    let cert_der = CertificateDer::from(cert.der().to_vec());
    let key_der = PrivateKeyDer::try_from(key_pair.serialize_der())
        .map_err(|e| anyhow::anyhow!("Failed to serialize private key: {}", e))?;

    Ok(certified_key(vec![cert_der], &key_der)?)
}

fn is_cert_valid_for_days(cert: &CertificateDer<'_>, days: u64) -> bool {
    use x509_parser::prelude::*;

    let (_, parsed) = match X509Certificate::from_der(cert.as_ref()) {
        Ok(result) => result,
        Err(e) => {
            error!(error = %e, "Failed to parse X.509 certificate");
            return false;
        }
    };

    let expiry = parsed.validity().not_after.timestamp();
    let now = chrono::Utc::now().timestamp();

    let remaining_secs = expiry - now;
    if remaining_secs < 0 {
        return false;
    }

    let remaining_days = remaining_secs as u64 / (24 * 60 * 60);
    if remaining_days < days {
        debug!(remaining_days, required_days = days, "Certificate expires soon");
        return false;
    }

    true
}

/// Validate and canonicalize the certificate cache directory path
fn validate_cache_dir(path: &str) -> Result<PathBuf, CertificateError> {
    if path.contains("..") {
        return Err(CertificateError::Cache(
            "cache directory path must not contain '..'".to_string(),
        ));
    }

    let path_buf = PathBuf::from(path);

    if path_buf.exists() {
        let canonical = path_buf.canonicalize()?;
        if !canonical.is_dir() {
            return Err(CertificateError::Cache(format!(
                "cache path '{}' exists but is not a directory",
                path
            )));
        }
        return Ok(canonical);
    }

    Ok(path_buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rcgen::date_time_ymd;

    fn write_cert(dir: &Path, domain: &str, expired: bool) {
        let mut params = CertificateParams::new(vec![domain.to_string()]).unwrap();
        if expired {
            params.not_before = date_time_ymd(1999, 1, 1);
            params.not_after = date_time_ymd(2000, 1, 1);
        }
        let key = KeyPair::generate_for(&PKCS_ECDSA_P256_SHA256).unwrap();
        let cert = params.self_signed(&key).unwrap();

        let domain_dir = dir.join(domain);
        std::fs::create_dir_all(&domain_dir).unwrap();
        std::fs::write(domain_dir.join("cert.pem"), cert.pem()).unwrap();
        std::fs::write(domain_dir.join("key.pem"), key.serialize_pem()).unwrap();
    }

    fn manager(dir: &Path) -> AcmeCertificates {
        AcmeCertificates::new("ops@example.com", true, dir.to_str().unwrap()).unwrap()
    }

    #[tokio::test]
    async fn test_cached_certificate_installed() {
        let dir = tempfile::tempdir().unwrap();
        write_cert(dir.path(), "app.example.com", false);

        let acme = manager(dir.path());
        let config = acme
            .server_config(&["app.example.com".to_string()])
            .await
            .unwrap()
            .unwrap();

        assert!(acme.resolver().has_cert("app.example.com"));
        assert!(config.alpn_protocols.contains(&ACME_TLS_ALPN_NAME.to_vec()));
        assert!(acme.inner.pending.lock().is_empty());
    }

    #[tokio::test]
    async fn test_expired_cache_is_not_used() {
        let dir = tempfile::tempdir().unwrap();
        write_cert(dir.path(), "old.example.com", true);

        let acme = manager(dir.path());
        assert!(acme.load_cached("old.example.com").unwrap().is_none());
        assert!(acme.load_cached("missing.example.com").unwrap().is_none());
    }

    #[test]
    fn test_domain_dir_rejects_traversal() {
        let dir = tempfile::tempdir().unwrap();
        let acme = manager(dir.path());

        assert!(acme.domain_dir("app.example.com").is_ok());
        assert!(acme.domain_dir("../etc").is_err());
        assert!(acme.domain_dir("a/b").is_err());
        assert!(acme.domain_dir("").is_err());
    }

    #[test]
    fn test_save_cert_restricts_key() {
        let dir = tempfile::tempdir().unwrap();
        let acme = manager(dir.path());
        acme.save_cert("app.example.com", "CERT", "KEY").unwrap();

        let key_path = dir.path().join("app.example.com").join("key.pem");
        assert_eq!(std::fs::read_to_string(&key_path).unwrap(), "KEY");

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&key_path).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }

    #[tokio::test]
    async fn test_failed_issuance_fails_server_config() {
        let _ = rustls::crypto::ring::default_provider().install_default();
        let dir = tempfile::tempdir().unwrap();
        write_cert(dir.path(), "cached.example.com", false);

        // Nothing listens on the directory address
        let acme = AcmeCertificates::with_directory(
            "ops@example.com",
            "http://127.0.0.1:1/directory",
            dir.path().to_str().unwrap(),
        )
        .unwrap()
        .with_challenge_listener("127.0.0.1:0".parse().unwrap());

        let domains = ["cached.example.com".to_string(), "new.example.com".to_string()];
        let err = tokio::time::timeout(Duration::from_secs(30), acme.server_config(&domains))
            .await
            .expect("issuance gave up in time")
            .unwrap_err();

        match err {
            CertificateError::Acme(message) => {
                assert!(message.contains("new.example.com"), "{}", message)
            }
            other => panic!("unexpected error {:?}", other),
        }
        assert!(acme.resolver().has_cert("cached.example.com"));
        assert!(!acme.resolver().has_cert("new.example.com"));
    }

    #[tokio::test]
    async fn test_challenge_listener_releases_address() {
        let dir = tempfile::tempdir().unwrap();
        let acme = manager(dir.path());

        let listener = ChallengeListener::bind("127.0.0.1:0".parse().unwrap(), acme.resolver())
            .await
            .unwrap();
        let addr = listener.addr;
        assert!(tokio::net::TcpStream::connect(addr).await.is_ok());

        listener.stop().await;
        assert!(TcpListener::bind(addr).await.is_ok());
    }

    #[test]
    fn test_challenge_cert_builds() {
        let cert = create_tls_alpn01_cert("app.example.com", &[7u8; 32]).unwrap();
        assert_eq!(cert.cert.len(), 1);
    }

    #[test]
    fn test_validate_cache_dir() {
        assert!(validate_cache_dir("../etc/passwd").is_err());
        assert!(validate_cache_dir("/tmp/../etc").is_err());
        assert!(validate_cache_dir("./acme_cache").is_ok());
        assert!(validate_cache_dir("acme_cache").is_ok());
    }
}
