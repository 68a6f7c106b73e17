//! SNI certificate cache.
//!
//! Certificates come from a [`CertificateProvider`] (ACME in production,
//! fixtures in tests) and are cached per servername as ready-to-use
//! [`CertifiedKey`]s. A cached entry past its refresh deadline is still
//! served while a background task fetches a replacement, so handshakes
//! never wait on renewal.

use dashmap::DashMap;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use rand::Rng;
use rustls::pki_types::PrivateKeyDer;
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use std::io::BufReader;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Base refresh interval, jittered per entry so renewals spread out.
const REFRESH_INTERVAL: Duration = Duration::from_secs(22_500);
const REFRESH_JITTER: Duration = Duration::from_secs(900);
/// Minimum spacing between background refresh starts.
const REFRESH_STAGGER: Duration = Duration::from_secs(30);

const MAX_SERVERNAME_LEN: usize = 253;

/// PEM material for one certificate, covering the subject plus altnames.
#[derive(Debug, Clone)]
pub struct CertBundle {
    pub cert_pem: String,
    pub key_pem: String,
    pub altnames: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChallengeKind {
    Http01,
}

/// Source of certificates. Issuance may take a while, hence boxed futures;
/// challenge lookup happens on the request path and must be synchronous.
pub trait CertificateProvider: Send + Sync {
    /// Ensure the provider can issue for this subject (and altnames).
    fn register_domain<'a>(
        &'a self,
        subject: &'a str,
        altnames: &'a [String],
        contact_email: &'a str,
    ) -> BoxFuture<'a, anyhow::Result<()>>;

    /// Fetch (or issue) the certificate covering this servername.
    fn get_certificate<'a>(&'a self, servername: &'a str)
        -> BoxFuture<'a, anyhow::Result<CertBundle>>;

    /// Key authorization for a pending challenge token, if any.
    fn challenge_response(
        &self,
        kind: ChallengeKind,
        servername: &str,
        token: &str,
    ) -> Option<String>;
}

struct CachedCert {
    key: Arc<CertifiedKey>,
    refresh_at: Instant,
}

/// Per-servername certificate cache in front of a provider.
pub struct CertStore {
    provider: Arc<dyn CertificateProvider>,
    contact_email: String,
    entries: DashMap<String, CachedCert>,
    /// Names already registered with the provider
    registered: DashMap<String, ()>,
    /// Servernames with a refresh already in flight
    refreshing: DashMap<String, ()>,
    last_refresh_start: Mutex<Option<Instant>>,
}

impl CertStore {
    pub fn new(provider: Arc<dyn CertificateProvider>, contact_email: String) -> Arc<Self> {
        Arc::new(Self {
            provider,
            contact_email,
            entries: DashMap::new(),
            registered: DashMap::new(),
            refreshing: DashMap::new(),
            last_refresh_start: Mutex::new(None),
        })
    }

    pub fn provider(&self) -> Arc<dyn CertificateProvider> {
        self.provider.clone()
    }

    pub fn cached_count(&self) -> usize {
        self.entries.len()
    }

    /// Resolve the certificate for a TLS handshake. Cache hits return
    /// immediately even when stale; misses fetch inline.
    pub async fn certified_key(self: &Arc<Self>, servername: &str) -> Option<Arc<CertifiedKey>> {
        if !is_valid_servername(servername) {
            debug!(servername, "rejecting invalid SNI servername");
            return None;
        }
        let servername = servername.to_ascii_lowercase();

        if let Some(entry) = self.entries.get(&servername) {
            let key = entry.key.clone();
            let due = entry.refresh_at <= Instant::now();
            drop(entry);
            if due {
                self.schedule_refresh(&servername);
            }
            return Some(key);
        }

        match self.fetch_and_cache(&servername).await {
            Ok(key) => Some(key),
            Err(err) => {
                warn!(servername, error = %err, "certificate fetch failed");
                None
            }
        }
    }

    /// Spawn a background refresh unless one is already running for this
    /// name. Starts are spaced out so a burst of stale entries does not
    /// hammer the provider.
    fn schedule_refresh(self: &Arc<Self>, servername: &str) {
        if self
            .refreshing
            .insert(servername.to_string(), ())
            .is_some()
        {
            return;
        }

        let delay = {
            let mut last = self.last_refresh_start.lock();
            let now = Instant::now();
            let start = match *last {
                Some(previous) if previous + REFRESH_STAGGER > now => previous + REFRESH_STAGGER,
                _ => now,
            };
            *last = Some(start);
            start.saturating_duration_since(now)
        };

        let store = self.clone();
        let servername = servername.to_string();
        tokio::spawn(async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            debug!(servername = %servername, "refreshing certificate");
            if let Err(err) = store.fetch_and_cache(&servername).await {
                warn!(servername = %servername, error = %err, "certificate refresh failed");
            }
            store.refreshing.remove(&servername);
        });
    }

    /// Fetch from the provider and cache the result under the subject and
    /// every altname, so sibling names hit without their own fetch.
    async fn fetch_and_cache(&self, servername: &str) -> anyhow::Result<Arc<CertifiedKey>> {
        if !self.registered.contains_key(servername) {
            self.provider
                .register_domain(servername, &[], &self.contact_email)
                .await?;
            self.registered.insert(servername.to_string(), ());
        }
        let bundle = self.provider.get_certificate(servername).await?;
        let key = Arc::new(certified_key_from_pem(&bundle.cert_pem, &bundle.key_pem)?);

        let refresh_at = Instant::now() + jittered_refresh_interval();
        self.entries.insert(
            servername.to_string(),
            CachedCert {
                key: key.clone(),
                refresh_at,
            },
        );
        for altname in &bundle.altnames {
            let altname = altname.to_ascii_lowercase();
            if altname != servername {
                self.entries.insert(
                    altname,
                    CachedCert {
                        key: key.clone(),
                        refresh_at,
                    },
                );
            }
        }

        info!(servername, altnames = bundle.altnames.len(), "certificate cached");
        Ok(key)
    }

    pub async fn register_domains(&self, subject: &str, altnames: &[String]) {
        match self
            .provider
            .register_domain(subject, altnames, &self.contact_email)
            .await
        {
            Ok(()) => {
                self.registered.insert(subject.to_ascii_lowercase(), ());
                for altname in altnames {
                    self.registered.insert(altname.to_ascii_lowercase(), ());
                }
            }
            Err(err) => warn!(subject, error = %err, "domain registration failed"),
        }
    }
}

fn jittered_refresh_interval() -> Duration {
    let jitter = rand::thread_rng().gen_range(0..=2 * REFRESH_JITTER.as_secs());
    REFRESH_INTERVAL - REFRESH_JITTER + Duration::from_secs(jitter)
}

/// SNI names arrive from untrusted peers before any HTTP parsing; the
/// same charset rules as the Host header apply.
pub fn is_valid_servername(name: &str) -> bool {
    !name.is_empty()
        && name.len() <= MAX_SERVERNAME_LEN
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.')
}

/// Parse PEM cert chain and key into a rustls [`CertifiedKey`].
pub fn certified_key_from_pem(cert_pem: &str, key_pem: &str) -> anyhow::Result<CertifiedKey> {
    let certs: Vec<_> = rustls_pemfile::certs(&mut BufReader::new(cert_pem.as_bytes()))
        .collect::<Result<_, _>>()?;
    if certs.is_empty() {
        anyhow::bail!("no certificates in PEM data");
    }

    let key = load_private_key(key_pem.as_bytes())
        .ok_or_else(|| anyhow::anyhow!("no private key in PEM data"))?;
    let signing_key = rustls::crypto::ring::sign::any_supported_type(&key)
        .map_err(|e| anyhow::anyhow!("unsupported private key: {e}"))?;

    Ok(CertifiedKey::new(certs, signing_key))
}

fn load_private_key(data: &[u8]) -> Option<PrivateKeyDer<'static>> {
    let mut reader = BufReader::new(data);
    loop {
        match rustls_pemfile::read_one(&mut reader) {
            Ok(Some(rustls_pemfile::Item::Pkcs1Key(key))) => return Some(key.into()),
            Ok(Some(rustls_pemfile::Item::Pkcs8Key(key))) => return Some(key.into()),
            Ok(Some(rustls_pemfile::Item::Sec1Key(key))) => return Some(key.into()),
            Ok(None) => return None,
            Ok(_) => continue,
            Err(_) => return None,
        }
    }
}

/// Hands a single pre-resolved key to rustls for one handshake.
#[derive(Debug)]
pub struct SingleCertResolver(pub Arc<CertifiedKey>);

impl ResolvesServerCert for SingleCertResolver {
    fn resolve(&self, _client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        Some(self.0.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct SelfSignedProvider {
        fetches: AtomicUsize,
        altnames: Vec<String>,
    }

    impl SelfSignedProvider {
        fn new(altnames: Vec<&str>) -> Self {
            Self {
                fetches: AtomicUsize::new(0),
                altnames: altnames.into_iter().map(String::from).collect(),
            }
        }
    }

    impl CertificateProvider for SelfSignedProvider {
        fn register_domain<'a>(
            &'a self,
            _subject: &'a str,
            _altnames: &'a [String],
            _contact_email: &'a str,
        ) -> BoxFuture<'a, anyhow::Result<()>> {
            Box::pin(async { Ok(()) })
        }

        fn get_certificate<'a>(
            &'a self,
            servername: &'a str,
        ) -> BoxFuture<'a, anyhow::Result<CertBundle>> {
            Box::pin(async move {
                self.fetches.fetch_add(1, Ordering::SeqCst);
                let mut names = vec![servername.to_string()];
                names.extend(self.altnames.clone());
                let key_pair = rcgen::KeyPair::generate_for(&rcgen::PKCS_ECDSA_P256_SHA256)?;
                let cert = rcgen::CertificateParams::new(names)?.self_signed(&key_pair)?;
                Ok(CertBundle {
                    cert_pem: cert.pem(),
                    key_pem: key_pair.serialize_pem(),
                    altnames: self.altnames.clone(),
                })
            })
        }

        fn challenge_response(
            &self,
            _kind: ChallengeKind,
            _servername: &str,
            _token: &str,
        ) -> Option<String> {
            None
        }
    }

    #[test]
    fn test_is_valid_servername() {
        assert!(is_valid_servername("example.com"));
        assert!(is_valid_servername("sub-domain.example.com"));
        assert!(!is_valid_servername(""));
        assert!(!is_valid_servername("exa mple.com"));
        assert!(!is_valid_servername("evil\u{0}.com"));
        assert!(!is_valid_servername(&"a".repeat(300)));
    }

    #[test]
    fn test_jittered_refresh_interval_bounds() {
        for _ in 0..100 {
            let interval = jittered_refresh_interval();
            assert!(interval >= REFRESH_INTERVAL - REFRESH_JITTER);
            assert!(interval <= REFRESH_INTERVAL + REFRESH_JITTER);
        }
    }

    #[tokio::test]
    async fn test_fetch_caches_under_altnames() {
        let provider = Arc::new(SelfSignedProvider::new(vec!["www.example.com"]));
        let store = CertStore::new(provider.clone(), "admin@example.com".to_string());

        let key = store.certified_key("example.com").await.unwrap();
        assert_eq!(provider.fetches.load(Ordering::SeqCst), 1);

        // Altname hits the cache, no second fetch.
        let alt = store.certified_key("www.example.com").await.unwrap();
        assert!(Arc::ptr_eq(&key, &alt));
        assert_eq!(provider.fetches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_stale_entry_served_while_refreshing() {
        let provider = Arc::new(SelfSignedProvider::new(vec![]));
        let store = CertStore::new(provider.clone(), "admin@example.com".to_string());

        let key = store.certified_key("example.com").await.unwrap();
        store.entries.get_mut("example.com").unwrap().refresh_at =
            Instant::now() - Duration::from_secs(1);

        // Stale entry comes back immediately.
        let again = store.certified_key("example.com").await.unwrap();
        assert!(Arc::ptr_eq(&key, &again));

        // Background refresh eventually replaces it.
        let deadline = Instant::now() + Duration::from_secs(5);
        loop {
            if provider.fetches.load(Ordering::SeqCst) >= 2 {
                break;
            }
            assert!(Instant::now() < deadline, "refresh never ran");
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    #[tokio::test]
    async fn test_invalid_servername_rejected() {
        let provider = Arc::new(SelfSignedProvider::new(vec![]));
        let store = CertStore::new(provider.clone(), "admin@example.com".to_string());
        assert!(store.certified_key("bad name").await.is_none());
        assert_eq!(provider.fetches.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_certified_key_from_pem_rejects_garbage() {
        assert!(certified_key_from_pem("not pem", "not pem").is_err());
    }
}
