//! ACME (Let's Encrypt) certificate provider.
//!
//! Issues certificates on demand per subject using the HTTP-01 challenge,
//! served by the dispatcher at /.well-known/acme-challenge/. Account
//! credentials and issued certificates are cached on disk; private keys
//! are written with 0600 permissions but stored unencrypted, so the cache
//! directory should live on a protected filesystem.

use dashmap::DashMap;
use futures::future::BoxFuture;
use instant_acme::{
    Account, AccountCredentials, AuthorizationStatus, ChallengeType, Identifier, LetsEncrypt,
    NewAccount, NewOrder, OrderStatus,
};
use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair, PKCS_ECDSA_P256_SHA256};
use rustls::pki_types::CertificateDer;
use std::io::BufReader;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, error, info};

use crate::cert::{CertBundle, CertificateProvider, ChallengeKind};
use crate::config::TlsConfig;

/// Renew anything expiring within this many days.
const RENEWAL_MARGIN_DAYS: u64 = 30;
const AUTHORIZATION_POLL_LIMIT: u32 = 30;
const AUTHORIZATION_POLL_INTERVAL: Duration = Duration::from_secs(2);

pub struct AcmeProvider {
    email: String,
    directory_url: Option<String>,
    cache_dir: PathBuf,
    account: Mutex<Option<Account>>,
    /// Pending HTTP-01 tokens and their key authorizations
    challenges: DashMap<String, String>,
    /// Subject name to its altnames, as registered
    subjects: DashMap<String, Vec<String>>,
    /// Any covered name back to its subject
    aliases: DashMap<String, String>,
    /// Orders run one at a time; parallel orders for one subject would
    /// race on challenge tokens and waste rate limit budget.
    order_lock: Mutex<()>,
}

impl AcmeProvider {
    pub fn new(config: &TlsConfig) -> anyhow::Result<Self> {
        let email = config
            .email
            .clone()
            .filter(|e| !e.is_empty())
            .ok_or_else(|| anyhow::anyhow!("ACME requires a contact email"))?;
        let cache_dir = validate_cache_dir(&config.cache_dir)?;
        Ok(Self {
            email,
            directory_url: config.directory_url.clone(),
            cache_dir,
            account: Mutex::new(None),
            challenges: DashMap::new(),
            subjects: DashMap::new(),
            aliases: DashMap::new(),
            order_lock: Mutex::new(()),
        })
    }

    /// Load or create the ACME account, caching credentials on disk.
    async fn account(&self) -> anyhow::Result<Account> {
        let mut guard = self.account.lock().await;
        if let Some(account) = guard.as_ref() {
            return Ok(account.clone());
        }

        let account_path = self.cache_dir.join("account.json");
        if account_path.exists() {
            debug!(path = %account_path.display(), "loading existing ACME account");
            let data = std::fs::read_to_string(&account_path)?;
            let credentials: AccountCredentials = serde_json::from_str(&data)?;
            let account = Account::from_credentials(credentials).await?;
            *guard = Some(account.clone());
            return Ok(account);
        }

        info!("creating new ACME account");
        let directory_url = self
            .directory_url
            .as_deref()
            .unwrap_or(LetsEncrypt::Production.url());

        let (account, credentials) = Account::create(
            &NewAccount {
                contact: &[&format!("mailto:{}", self.email)],
                terms_of_service_agreed: true,
                only_return_existing: false,
            },
            directory_url,
            None,
        )
        .await?;

        std::fs::create_dir_all(&self.cache_dir)?;
        let data = serde_json::to_string_pretty(&credentials)?;
        std::fs::write(&account_path, data)?;
        info!(path = %account_path.display(), "ACME account credentials saved");

        *guard = Some(account.clone());
        Ok(account)
    }

    fn subject_for(&self, servername: &str) -> String {
        self.aliases
            .get(servername)
            .map(|s| s.value().clone())
            .unwrap_or_else(|| servername.to_string())
    }

    fn names_for(&self, subject: &str) -> Vec<String> {
        let mut names = vec![subject.to_string()];
        if let Some(altnames) = self.subjects.get(subject) {
            for name in altnames.value() {
                if !names.contains(name) {
                    names.push(name.clone());
                }
            }
        }
        names
    }

    fn cert_path(&self, subject: &str) -> PathBuf {
        self.cache_dir.join(format!("{subject}.cert.pem"))
    }

    fn key_path(&self, subject: &str) -> PathBuf {
        self.cache_dir.join(format!("{subject}.key.pem"))
    }

    /// Disk-cached bundle for a subject, if present and not near expiry.
    fn load_cached(&self, subject: &str) -> Option<CertBundle> {
        let cert_pem = std::fs::read_to_string(self.cert_path(subject)).ok()?;
        let key_pem = std::fs::read_to_string(self.key_path(subject)).ok()?;

        let certs: Vec<CertificateDer<'static>> =
            rustls_pemfile::certs(&mut BufReader::new(cert_pem.as_bytes()))
                .filter_map(|c| c.ok())
                .collect();
        let leaf = certs.first()?;
        if !is_cert_valid_for_days(leaf, RENEWAL_MARGIN_DAYS) {
            info!(subject, "cached certificate near expiry, will reissue");
            return None;
        }

        let altnames = san_names(leaf);
        debug!(subject, "using disk-cached certificate");
        Some(CertBundle {
            cert_pem,
            key_pem,
            altnames,
        })
    }

    fn save_cert(&self, subject: &str, cert_pem: &str, key_pem: &str) -> anyhow::Result<()> {
        std::fs::create_dir_all(&self.cache_dir)?;
        std::fs::write(self.cert_path(subject), cert_pem)?;

        let key_path = self.key_path(subject);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            let mut file = std::fs::OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .mode(0o600)
                .open(&key_path)?;
            std::io::Write::write_all(&mut file, key_pem.as_bytes())?;
        }
        #[cfg(not(unix))]
        {
            std::fs::write(&key_path, key_pem)?;
        }

        info!(subject, "certificate saved to cache");
        Ok(())
    }

    /// Run one ACME order for a subject and its altnames, HTTP-01 only.
    async fn order_certificate(&self, subject: &str) -> anyhow::Result<CertBundle> {
        let account = self.account().await?;
        let names = self.names_for(subject);
        let identifiers: Vec<Identifier> =
            names.iter().map(|d| Identifier::Dns(d.clone())).collect();

        info!(subject, names = ?names, "requesting certificate");

        let mut order = account
            .new_order(&NewOrder {
                identifiers: &identifiers,
            })
            .await?;

        let authorizations = order.authorizations().await?;
        for authz in authorizations {
            if authz.status == AuthorizationStatus::Valid {
                continue;
            }

            let identifier = match &authz.identifier {
                Identifier::Dns(domain) => domain.clone(),
            };

            let challenge = authz
                .challenges
                .iter()
                .find(|c| c.r#type == ChallengeType::Http01)
                .ok_or_else(|| {
                    anyhow::anyhow!("HTTP-01 challenge not offered for {identifier}")
                })?;

            let key_auth = order.key_authorization(challenge);
            debug!(domain = %identifier, token = %challenge.token, "publishing HTTP-01 challenge");
            self.challenges
                .insert(challenge.token.clone(), key_auth.as_str().to_string());

            order.set_challenge_ready(&challenge.url).await?;

            let mut attempts = 0;
            let result = loop {
                tokio::time::sleep(AUTHORIZATION_POLL_INTERVAL).await;

                order.refresh().await?;
                let auths = order.authorizations().await?;
                let current = auths
                    .iter()
                    .find(|a| matches!(&a.identifier, Identifier::Dns(d) if d == &identifier));

                match current.map(|a| &a.status) {
                    Some(AuthorizationStatus::Valid) => {
                        info!(domain = %identifier, "authorization valid");
                        break Ok(());
                    }
                    Some(AuthorizationStatus::Pending) => {
                        attempts += 1;
                        if attempts > AUTHORIZATION_POLL_LIMIT {
                            break Err(anyhow::anyhow!("authorization timeout for {identifier}"));
                        }
                        debug!(domain = %identifier, attempt = attempts, "waiting for authorization");
                    }
                    Some(AuthorizationStatus::Invalid) => {
                        break Err(anyhow::anyhow!("authorization failed for {identifier}"));
                    }
                    Some(status) => {
                        debug!(domain = %identifier, status = ?status, "authorization status");
                    }
                    None => {
                        break Err(anyhow::anyhow!("authorization not found for {identifier}"));
                    }
                }
            };

            self.challenges.remove(&challenge.token);
            result?;
        }

        let mut attempts = 0;
        loop {
            match order.state().status {
                OrderStatus::Ready | OrderStatus::Valid => break,
                OrderStatus::Pending | OrderStatus::Processing => {
                    attempts += 1;
                    if attempts > AUTHORIZATION_POLL_LIMIT {
                        anyhow::bail!("order timeout for {subject}");
                    }
                    tokio::time::sleep(AUTHORIZATION_POLL_INTERVAL).await;
                    order.refresh().await?;
                }
                OrderStatus::Invalid => anyhow::bail!("order invalid for {subject}"),
            }
        }

        let mut params = CertificateParams::new(names.clone())?;
        params.distinguished_name = DistinguishedName::new();
        params
            .distinguished_name
            .push(DnType::CommonName, subject.to_string());

        let private_key = KeyPair::generate_for(&PKCS_ECDSA_P256_SHA256)?;
        let csr = params.serialize_request(&private_key)?;
        order.finalize(csr.der()).await?;

        let mut attempts = 0;
        let cert_pem: String = loop {
            order.refresh().await?;
            match order.state().status {
                OrderStatus::Valid => {
                    if let Some(cert) = order.certificate().await? {
                        break cert;
                    }
                    anyhow::bail!("order valid but no certificate returned");
                }
                OrderStatus::Processing => {
                    attempts += 1;
                    if attempts > AUTHORIZATION_POLL_LIMIT {
                        anyhow::bail!("certificate timeout for {subject}");
                    }
                    tokio::time::sleep(AUTHORIZATION_POLL_INTERVAL).await;
                }
                status => anyhow::bail!("unexpected order status: {status:?}"),
            }
        };

        let key_pem = private_key.serialize_pem();
        self.save_cert(subject, &cert_pem, &key_pem)?;

        info!(subject, "certificate obtained");
        let altnames = names.into_iter().filter(|n| n != subject).collect();
        Ok(CertBundle {
            cert_pem,
            key_pem,
            altnames,
        })
    }
}

impl CertificateProvider for AcmeProvider {
    fn register_domain<'a>(
        &'a self,
        subject: &'a str,
        altnames: &'a [String],
        _contact_email: &'a str,
    ) -> BoxFuture<'a, anyhow::Result<()>> {
        Box::pin(async move {
            let subject = subject.to_ascii_lowercase();
            // A bare re-registration must not clobber an existing
            // subject's altname list.
            if altnames.is_empty() && self.aliases.contains_key(&subject) {
                return Ok(());
            }
            self.aliases.insert(subject.clone(), subject.clone());
            for name in altnames {
                self.aliases
                    .insert(name.to_ascii_lowercase(), subject.clone());
            }
            self.subjects.insert(
                subject,
                altnames.iter().map(|n| n.to_ascii_lowercase()).collect(),
            );
            Ok(())
        })
    }

    fn get_certificate<'a>(
        &'a self,
        servername: &'a str,
    ) -> BoxFuture<'a, anyhow::Result<CertBundle>> {
        Box::pin(async move {
            let subject = self.subject_for(servername);

            if let Some(bundle) = self.load_cached(&subject) {
                return Ok(bundle);
            }

            let _serialized = self.order_lock.lock().await;
            // Another order may have issued this subject while we waited.
            if let Some(bundle) = self.load_cached(&subject) {
                return Ok(bundle);
            }
            self.order_certificate(&subject).await
        })
    }

    fn challenge_response(
        &self,
        kind: ChallengeKind,
        _servername: &str,
        token: &str,
    ) -> Option<String> {
        match kind {
            ChallengeKind::Http01 => self.challenges.get(token).map(|e| e.value().clone()),
        }
    }
}

/// Subject alternative names out of a DER certificate.
fn san_names(cert: &CertificateDer<'_>) -> Vec<String> {
    use x509_parser::prelude::*;

    let Ok((_, parsed)) = X509Certificate::from_der(cert.as_ref()) else {
        return Vec::new();
    };
    let Ok(Some(san)) = parsed.subject_alternative_name() else {
        return Vec::new();
    };
    san.value
        .general_names
        .iter()
        .filter_map(|name| match name {
            GeneralName::DNSName(dns) => Some(dns.to_string()),
            _ => None,
        })
        .collect()
}

fn is_cert_valid_for_days(cert: &CertificateDer<'_>, days: u64) -> bool {
    use x509_parser::prelude::*;

    let (_, parsed) = match X509Certificate::from_der(cert.as_ref()) {
        Ok(result) => result,
        Err(e) => {
            error!(error = %e, "failed to parse X.509 certificate");
            return false;
        }
    };

    let not_after = parsed.validity().not_after;
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0);

    let remaining_secs = not_after.timestamp() - now;
    if remaining_secs < 0 {
        return false;
    }
    remaining_secs as u64 / (24 * 60 * 60) >= days
}

/// Reject traversal in the cache directory path and canonicalize it.
fn validate_cache_dir(path: &str) -> anyhow::Result<PathBuf> {
    if path.contains("..") {
        anyhow::bail!("certificate cache directory must not contain '..'");
    }

    let path_buf = PathBuf::from(path);
    if path_buf.exists() {
        let canonical = path_buf
            .canonicalize()
            .map_err(|e| anyhow::anyhow!("failed to canonicalize cache directory '{path}': {e}"))?;
        if !canonical.is_dir() {
            anyhow::bail!("certificate cache path '{path}' is not a directory");
        }
        return Ok(canonical);
    }
    Ok(path_buf)
}
