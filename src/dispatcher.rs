//! Central router: site indices, port/socket allocation, and the request
//! pipeline (loop detection, resolution, auth, forwarding with retries,
//! WebSocket upgrades).

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use dashmap::DashMap;
use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::header::{HeaderName, HeaderValue};
use hyper::{HeaderMap, Request, Response, StatusCode};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioIo};
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, Ipv6Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::cert::{CertificateProvider, ChallengeKind};
use crate::config::Config;
use crate::error::{full_body, json_error_response, ErrorPages, GateBody, GateErrorCode};
use crate::reputation::ReputationTracker;
use crate::site::{DomainMatch, Site, SiteKind, SiteRecord, SiteSettings};
use crate::stats::{Activity, ActivityKind};
use crate::supervisor::{PoolSettings, SitePool};
use crate::worker::{fingerprint, ProcessSpawner};

const ACME_CHALLENGE_PREFIX: &str = "/.well-known/acme-challenge/";

const X_FORWARDED_FOR: &str = "x-forwarded-for";
const X_FORWARDED_HOST: &str = "x-forwarded-host";
const X_FORWARDED_PROTO: &str = "x-forwarded-proto";

/// Retries after the initial forwarding attempt
const MAX_FORWARD_RETRIES: usize = 4;
const FORWARD_RETRY_DELAY: Duration = Duration::from_millis(100);

/// How many ports are probed before giving up on allocation
const PORT_PROBE_LIMIT: u16 = 1000;

/// Maximum hostname length per DNS specification
const MAX_HOSTNAME_LEN: usize = 253;

/// Owns worker bind targets: probed TCP ports and generated socket paths.
pub struct BindAllocator {
    base_port: u16,
    skip_ports: Vec<u16>,
    allocated: DashMap<u16, ()>,
    socket_dir: PathBuf,
}

impl BindAllocator {
    pub fn new(base_port: u16, skip_ports: Vec<u16>, socket_dir: impl AsRef<Path>) -> Self {
        Self {
            base_port,
            skip_ports,
            allocated: DashMap::new(),
            socket_dir: socket_dir.as_ref().to_path_buf(),
        }
    }

    /// Probe ports sequentially from the base: bind a throwaway listener on
    /// the dual-stack wildcard, release it, and reserve the port until the
    /// worker exits.
    pub fn allocate_port(&self) -> anyhow::Result<u16> {
        for offset in 0..PORT_PROBE_LIMIT {
            let Some(port) = self.base_port.checked_add(offset) else {
                break;
            };
            if self.skip_ports.contains(&port) || self.allocated.contains_key(&port) {
                continue;
            }
            match std::net::TcpListener::bind((Ipv6Addr::UNSPECIFIED, port)) {
                Ok(listener) => {
                    drop(listener);
                    self.allocated.insert(port, ());
                    return Ok(port);
                }
                Err(_) => continue,
            }
        }
        anyhow::bail!(
            "no free worker port within {} probes from {}",
            PORT_PROBE_LIMIT,
            self.base_port
        )
    }

    pub fn release_port(&self, port: u16) {
        self.allocated.remove(&port);
    }

    pub fn reserved_ports(&self) -> usize {
        self.allocated.len()
    }

    /// Unique socket path from site id, timestamp, and a random suffix.
    /// Collisions are treated as negligible; no pre-existence check.
    pub fn socket_file(&self, site_id: &str) -> anyhow::Result<PathBuf> {
        std::fs::create_dir_all(&self.socket_dir)?;
        let name = format!(
            "{}-{}-{:04x}.sock",
            site_id,
            chrono::Utc::now().timestamp_millis(),
            rand::random::<u16>()
        );
        Ok(self.socket_dir.join(name))
    }
}

/// Result of resolving a request to a site.
pub struct RouteMatch {
    pub site: Arc<Site>,
    pub domain: DomainMatch,
}

enum BackendTarget {
    Tcp(String),
    Unix(PathBuf),
}

fn parse_backend_target(addr: &str) -> BackendTarget {
    if addr.starts_with('/') {
        return BackendTarget::Unix(PathBuf::from(addr));
    }
    let authority = addr
        .strip_prefix("http://")
        .or_else(|| addr.strip_prefix("https://"))
        .unwrap_or(addr);
    BackendTarget::Tcp(authority.trim_end_matches('/').to_string())
}

/// The site dispatcher: owns the id/domain/name indices, the bind
/// allocator, the reputation map, and the request pipeline.
pub struct Dispatcher {
    config: Arc<Config>,
    ids: DashMap<String, Arc<Site>>,
    domains: DashMap<String, Arc<Site>>,
    names: DashMap<String, Arc<Site>>,
    /// Sites in registration order, scanned for wildcard/regex matches
    order: RwLock<Vec<Arc<Site>>>,
    pub allocator: Arc<BindAllocator>,
    pub reputation: ReputationTracker,
    error_pages: ErrorPages,
    client: Client<HttpConnector, Full<Bytes>>,
    marker_header: HeaderName,
    hit_ids: AtomicU64,
    connection_ids: AtomicU64,
    spawner: Arc<dyn ProcessSpawner>,
    activities: mpsc::UnboundedSender<Activity>,
    certs: RwLock<Option<Arc<dyn CertificateProvider>>>,
}

impl Dispatcher {
    pub fn new(
        config: Arc<Config>,
        spawner: Arc<dyn ProcessSpawner>,
        activities: mpsc::UnboundedSender<Activity>,
    ) -> anyhow::Result<Arc<Self>> {
        let mut skip_ports = vec![config.server.port];
        if config.tls.enabled() {
            skip_ports.push(config.server.https_port());
        }
        let allocator = Arc::new(BindAllocator::new(
            config.server.worker_port_base,
            skip_ports,
            &config.server.socket_dir,
        ));

        let mut connector = HttpConnector::new();
        connector.set_nodelay(true);
        connector.enforce_http(true);
        let client = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(config.server.pool_max_idle_per_host)
            .pool_idle_timeout(Duration::from_secs(config.server.pool_idle_timeout_secs))
            .build(connector);

        let marker_header = HeaderName::from_bytes(config.server.marker_header.as_bytes())
            .map_err(|_| {
                anyhow::anyhow!(
                    "invalid marker header name: {}",
                    config.server.marker_header
                )
            })?;

        Ok(Arc::new(Self {
            config,
            ids: DashMap::new(),
            domains: DashMap::new(),
            names: DashMap::new(),
            order: RwLock::new(Vec::new()),
            allocator,
            reputation: ReputationTracker::new(),
            error_pages: ErrorPages::new(),
            client,
            marker_header,
            hit_ids: AtomicU64::new(0),
            connection_ids: AtomicU64::new(0),
            spawner,
            activities,
            certs: RwLock::new(None),
        }))
    }

    pub fn set_certificate_provider(&self, provider: Arc<dyn CertificateProvider>) {
        *self.certs.write() = Some(provider);
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// One id per accepted socket, shared by keep-alive requests on it.
    pub fn next_connection_id(&self) -> u64 {
        self.connection_ids.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn hit_count(&self) -> u64 {
        self.hit_ids.load(Ordering::Relaxed)
    }

    pub fn connection_count(&self) -> u64 {
        self.connection_ids.load(Ordering::Relaxed)
    }

    pub fn active_sites(&self) -> usize {
        self.ids.len()
    }

    pub fn sites(&self) -> Vec<Arc<Site>> {
        self.order.read().clone()
    }

    pub fn site_by_id(&self, id: &str) -> Option<Arc<Site>> {
        self.ids.get(id).map(|e| e.value().clone())
    }

    pub fn site_by_name(&self, name: &str) -> Option<Arc<Site>> {
        self.names.get(name).map(|e| e.value().clone())
    }

    pub fn total_workers(&self) -> usize {
        self.sites()
            .iter()
            .map(|site| match site.kind().as_ref() {
                SiteKind::Node(pool) => pool.running_count(),
                _ => 0,
            })
            .sum()
    }

    fn emit(&self, site: &Arc<Site>, kind: ActivityKind, detail: impl Into<String>) {
        let _ = self
            .activities
            .send(Activity::new(&site.id, &site.name(), kind, detail));
    }

    // ---- index maintenance -------------------------------------------------

    fn index_site(&self, site: &Arc<Site>) {
        self.ids.insert(site.id.clone(), site.clone());
        self.names.insert(site.name(), site.clone());
        for hostname in site.indexed_hostnames() {
            self.domains.insert(hostname, site.clone());
        }
        let mut order = self.order.write();
        if !order.iter().any(|s| s.id == site.id) {
            order.push(site.clone());
        }
    }

    /// Removal never errors, even for a site that was never indexed.
    fn unindex_site(&self, site: &Arc<Site>) {
        self.ids.remove(&site.id);
        self.names.retain(|_, s| s.id != site.id);
        self.domains.retain(|_, s| s.id != site.id);
        self.order.write().retain(|s| s.id != site.id);
    }

    fn build_kind(&self, record: &SiteRecord) -> SiteKind {
        use crate::site::BackendRecord;
        match PoolSettings::resolve(&self.config.pools, &record.backend) {
            Some(settings) => {
                let pool = SitePool::new(
                    record.id.clone(),
                    record.name.clone(),
                    settings,
                    self.spawner.clone(),
                    self.allocator.clone(),
                    self.activities.clone(),
                );
                pool.spawn_monitor();
                SiteKind::Node(pool)
            }
            None => match &record.backend {
                BackendRecord::Proxy { target } => SiteKind::Proxy {
                    target: target.clone(),
                },
                BackendRecord::Static { root } => SiteKind::Static { root: root.clone() },
                BackendRecord::Redirect { target, permanent } => SiteKind::Redirect {
                    target: target.clone(),
                    permanent: *permanent,
                },
                BackendRecord::Node { .. } => {
                    unreachable!("node backends always resolve to pool settings")
                }
            },
        }
    }

    pub fn register_record(&self, record: &SiteRecord) -> Arc<Site> {
        let kind = self.build_kind(record);
        let site = Arc::new(Site::new(record, kind));
        self.index_site(&site);
        info!(site = %site.name(), id = %site.id, "site registered");
        self.emit(&site, ActivityKind::SiteRegistered, site.name());

        if let SiteKind::Node(pool) = site.kind().as_ref() {
            let pool = pool.clone();
            tokio::spawn(async move {
                pool.enforce_minimum().await;
            });
        }
        site
    }

    pub async fn remove_site(&self, site: &Arc<Site>) {
        self.unindex_site(site);
        if let SiteKind::Node(pool) = site.kind().as_ref() {
            pool.shutdown().await;
        }
        info!(site = %site.name(), id = %site.id, "site removed");
        self.emit(site, ActivityKind::SiteRemoved, site.name());
    }

    /// Mutate a site in place from a new record: drop it from all indices,
    /// recompile its rules, refresh its serving strategy, and reindex.
    pub fn update_site(&self, site: &Arc<Site>, record: &SiteRecord) {
        use crate::site::BackendRecord;

        self.unindex_site(site);
        site.apply_record(record);

        let kind = site.kind();
        match (kind.as_ref(), &record.backend) {
            (SiteKind::Node(pool), backend @ BackendRecord::Node { .. }) => {
                if let Some(settings) = PoolSettings::resolve(&self.config.pools, backend) {
                    pool.apply_settings(settings);
                }
                let pool = pool.clone();
                tokio::spawn(async move {
                    pool.enforce_minimum().await;
                });
            }
            _ => {
                if let SiteKind::Node(pool) = kind.as_ref() {
                    let pool = pool.clone();
                    tokio::spawn(async move {
                        pool.shutdown().await;
                    });
                }
                site.replace_kind(self.build_kind(record));
            }
        }

        self.index_site(site);
        debug!(site = %site.name(), id = %site.id, "site updated");
    }

    /// Config sync: diff the replacement snapshot against the registry by
    /// id key, then create, update, and remove accordingly.
    pub async fn apply_records(&self, records: Vec<SiteRecord>) {
        let new_ids: HashSet<&str> = records.iter().map(|r| r.id.as_str()).collect();

        let removed: Vec<Arc<Site>> = self
            .ids
            .iter()
            .filter(|entry| !new_ids.contains(entry.key().as_str()))
            .map(|entry| entry.value().clone())
            .collect();
        for site in &removed {
            self.remove_site(site).await;
        }

        for record in &records {
            match self.site_by_id(&record.id) {
                Some(site) => self.update_site(&site, record),
                None => {
                    self.register_record(record);
                }
            }
        }

        // Rendered error pages may embed stale configuration.
        self.error_pages.invalidate();
        info!(
            sites = records.len(),
            removed = removed.len(),
            "site records applied"
        );
    }

    /// Stop every supervised worker pool. Called once at shutdown.
    pub async fn shutdown_pools(&self) {
        for site in self.sites() {
            if let SiteKind::Node(pool) = &*site.kind() {
                pool.shutdown().await;
            }
        }
    }

    // ---- resolution --------------------------------------------------------

    /// Match a hostname (and the local address the connection arrived on)
    /// to a site: exact hostname index first, then a registration-order
    /// scan for wildcard/regex rules.
    pub fn resolve(&self, hostname: &str, ip: Option<IpAddr>) -> Option<RouteMatch> {
        let hostname = hostname.to_ascii_lowercase();
        if let Some(site) = self.domains.get(&hostname).map(|e| e.value().clone()) {
            if let Some(domain) = site.matches(&hostname, ip) {
                return Some(RouteMatch { site, domain });
            }
        }
        for site in self.order.read().iter() {
            if let Some(domain) = site.matches(&hostname, ip) {
                return Some(RouteMatch {
                    site: site.clone(),
                    domain,
                });
            }
        }
        None
    }

    // ---- request pipeline --------------------------------------------------

    pub async fn handle_request(
        self: &Arc<Self>,
        req: Request<Incoming>,
        remote: SocketAddr,
        local: SocketAddr,
        is_tls: bool,
        connection_id: u64,
    ) -> Result<Response<GateBody>, hyper::Error> {
        // ACME HTTP-01 challenges are served before anything else.
        if !is_tls {
            if let Some(token) = req.uri().path().strip_prefix(ACME_CHALLENGE_PREFIX) {
                let servername = extract_hostname(&req).unwrap_or_default();
                let key_auth = self.certs.read().as_ref().and_then(|p| {
                    p.challenge_response(ChallengeKind::Http01, &servername, token)
                });
                if let Some(key_auth) = key_auth {
                    debug!(token, "responding to ACME HTTP-01 challenge");
                    return Ok(Response::builder()
                        .status(StatusCode::OK)
                        .header(hyper::header::CONTENT_TYPE, "text/plain")
                        .body(full_body(key_auth))
                        .expect("valid response builder"));
                }
            }
        }

        // A request carrying our own forwarding marker went through this
        // proxy already; single-hop detection, no loop-depth counting.
        if req.headers().contains_key(&self.marker_header) {
            warn!(remote = %remote.ip(), "forwarding loop detected");
            return Ok(json_error_response(
                GateErrorCode::LoopDetected,
                "Request already passed through this proxy",
            ));
        }

        let hit_id = self.hit_ids.fetch_add(1, Ordering::Relaxed) + 1;

        let Some(hostname) = extract_hostname(&req) else {
            return Ok(json_error_response(
                GateErrorCode::MissingHostHeader,
                "Missing or invalid Host header",
            ));
        };

        debug!(
            hostname,
            hit_id,
            connection_id,
            method = %req.method(),
            uri = %req.uri(),
            "incoming request"
        );

        let Some(route) = self.resolve(&hostname, Some(local.ip())) else {
            return self.handle_miss(req, remote, &hostname).await;
        };
        self.reputation.register_hit(remote.ip());

        let site = route.site.clone();
        let settings = site.settings();
        let upgrade = is_upgrade_request(&req);

        // Plaintext upgrades are accepted only while no HTTPS listener is
        // configured; an upgrade cannot be redirected mid-handshake, so it
        // is refused outright.
        if !is_tls && upgrade && self.config.tls.enabled() {
            warn!(remote = %remote.ip(), site = %site.name(), "refusing insecure upgrade");
            return Ok(json_error_response(
                GateErrorCode::InsecureUpgradeRefused,
                "Upgrade requests must use the HTTPS listener",
            ));
        }

        // HTTP to HTTPS redirect, global or per-site, never for upgrades or
        // already-encrypted connections.
        if !is_tls
            && !upgrade
            && self.config.tls.enabled()
            && settings.force_https.unwrap_or(self.config.server.force_https)
        {
            return Ok(build_https_redirect(&req, self.config.server.https_port()));
        }

        // Registered once here; forwarding retries below never re-count.
        site.counters.register_hit();

        if let Some(denied) = self.check_basic_auth(req.headers(), &settings) {
            return Ok(denied);
        }

        let fp = fingerprint(
            &remote.ip().to_string(),
            header_str(req.headers(), hyper::header::USER_AGENT),
            header_str(req.headers(), hyper::header::ACCEPT_LANGUAGE),
        );

        let mut response = match site.kind().as_ref() {
            SiteKind::Node(pool) => {
                let address = match pool.get_address(Some(fp)).await {
                    Ok(address) => address,
                    Err(err) => {
                        error!(site = %site.name(), error = %err, "no backend address");
                        return Ok(json_error_response(
                            GateErrorCode::WorkerStartFailed,
                            "Backend unavailable",
                        ));
                    }
                };
                self.dispatch_to_backend(req, &site, &address, remote, is_tls, upgrade)
                    .await?
            }
            SiteKind::Proxy { target } => {
                let address = substitute_captures(target, &route.domain.captures);
                self.dispatch_to_backend(req, &site, &address, remote, is_tls, upgrade)
                    .await?
            }
            SiteKind::Static { root } => {
                let path = req.uri().path().to_string();
                let response = serve_static(root, &path).await;
                let outgoing = content_length(response.headers());
                site.counters.record_bytes(&path, 0, outgoing);
                response
            }
            SiteKind::Redirect { target, permanent } => {
                redirect_response(target, *permanent, &route.domain.captures)
            }
        };

        for (name, value) in &route.domain.headers {
            if let (Ok(name), Ok(value)) = (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(value),
            ) {
                response.headers_mut().insert(name, value);
            }
        }
        Ok(response)
    }

    /// No site matched: track the miss, then either forward to the
    /// configured fallback or serve the cached not-found page.
    async fn handle_miss(
        self: &Arc<Self>,
        req: Request<Incoming>,
        remote: SocketAddr,
        hostname: &str,
    ) -> Result<Response<GateBody>, hyper::Error> {
        let negative = self.reputation.register_miss(remote.ip(), hostname);
        if negative {
            warn!(
                remote = %remote.ip(),
                hostname,
                "address repeatedly probing unknown hostnames"
            );
            return Ok(self.error_pages.not_found());
        }

        if let Some(fallback) = self.config.server.fallback_address.clone() {
            debug!(hostname, fallback, "forwarding unmatched request");
            let target = parse_backend_target(&fallback);
            let (mut parts, body) = req.into_parts();
            let body = body.collect().await?.to_bytes();
            self.set_forward_headers(&mut parts.headers, remote, false);
            return Ok(self.forward(&target, &parts, body, hostname).await);
        }

        Ok(self.error_pages.not_found())
    }

    async fn dispatch_to_backend(
        self: &Arc<Self>,
        req: Request<Incoming>,
        site: &Arc<Site>,
        address: &str,
        remote: SocketAddr,
        is_tls: bool,
        upgrade: bool,
    ) -> Result<Response<GateBody>, hyper::Error> {
        let target = parse_backend_target(address);

        if upgrade {
            return self.handle_upgrade(req, site, target, remote).await;
        }

        let path = req.uri().path().to_string();
        let (mut parts, body) = req.into_parts();
        let body = body.collect().await?.to_bytes();
        self.set_forward_headers(&mut parts.headers, remote, is_tls);

        let incoming = body.len() as u64;
        let response = self.forward(&target, &parts, body, &site.name()).await;
        let outgoing = content_length(response.headers());
        site.counters.record_bytes(&path, incoming, outgoing);
        Ok(response)
    }

    /// X-Forwarded-* headers are overwritten, never appended: this proxy is
    /// the first trusted hop and client-supplied values are spoofable.
    fn set_forward_headers(&self, headers: &mut HeaderMap, remote: SocketAddr, is_tls: bool) {
        if let Ok(value) = HeaderValue::from_str(&remote.ip().to_string()) {
            headers.insert(X_FORWARDED_FOR, value);
        }
        if let Some(host) = headers.get(hyper::header::HOST).cloned() {
            headers.insert(X_FORWARDED_HOST, host);
        }
        let proto = if is_tls { "https" } else { "http" };
        headers.insert(X_FORWARDED_PROTO, HeaderValue::from_static(proto));
    }

    /// Forward with a bounded retry budget; exceeding it yields the cached
    /// bad-gateway page rather than an error.
    async fn forward(
        &self,
        target: &BackendTarget,
        parts: &hyper::http::request::Parts,
        body: Bytes,
        site_name: &str,
    ) -> Response<GateBody> {
        for attempt in 0..=MAX_FORWARD_RETRIES {
            if attempt > 0 {
                tokio::time::sleep(FORWARD_RETRY_DELAY).await;
            }

            let request = match self.build_backend_request(target, parts, body.clone()) {
                Ok(request) => request,
                Err(err) => {
                    error!(site = site_name, error = %err, "failed to build backend request");
                    return json_error_response(
                        GateErrorCode::InternalError,
                        "Failed to build backend request",
                    );
                }
            };

            let result = match target {
                BackendTarget::Tcp(_) => self
                    .client
                    .request(request)
                    .await
                    .map_err(anyhow::Error::from),
                BackendTarget::Unix(path) => send_unix(path, request).await,
            };

            match result {
                Ok(response) => {
                    let (parts, body) = response.into_parts();
                    return Response::from_parts(parts, body.boxed());
                }
                Err(err) => {
                    warn!(site = site_name, attempt, error = %err, "backend request failed");
                }
            }
        }

        error!(site = site_name, "backend unreachable after retries");
        self.error_pages.unreachable()
    }

    fn build_backend_request(
        &self,
        target: &BackendTarget,
        parts: &hyper::http::request::Parts,
        body: Bytes,
    ) -> anyhow::Result<Request<Full<Bytes>>> {
        let path_and_query = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        let uri = match target {
            BackendTarget::Tcp(authority) => format!("http://{authority}{path_and_query}"),
            BackendTarget::Unix(_) => path_and_query.to_string(),
        };

        let mut builder = Request::builder().method(parts.method.clone()).uri(uri);
        for (name, value) in parts.headers.iter() {
            builder = builder.header(name, value);
        }
        builder = builder.header(&self.marker_header, "1");

        Ok(builder.body(Full::new(body))?)
    }

    /// Basic-auth gate: enabled only when the site configures at least one
    /// non-empty "user:pass" entry. Comparison is fixed-work over every
    /// configured entry.
    fn check_basic_auth(
        &self,
        headers: &HeaderMap,
        settings: &SiteSettings,
    ) -> Option<Response<GateBody>> {
        let entries: Vec<&str> = settings
            .basic_auth
            .iter()
            .map(String::as_str)
            .filter(|entry| !entry.is_empty())
            .collect();
        if entries.is_empty() {
            return None;
        }

        let supplied = headers
            .get(hyper::header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Basic "))
            .and_then(|encoded| BASE64.decode(encoded.trim()).ok());

        let authorized = match &supplied {
            Some(credentials) => entries
                .iter()
                .fold(false, |ok, entry| ok | fixed_eq(credentials, entry.as_bytes())),
            None => false,
        };
        if authorized {
            return None;
        }

        let mut response =
            json_error_response(GateErrorCode::Unauthorized, "Authentication required");
        response.headers_mut().insert(
            hyper::header::WWW_AUTHENTICATE,
            HeaderValue::from_static("Basic realm=\"restricted\""),
        );
        Some(response)
    }

    /// WebSocket/HTTP upgrade: send the raw upgrade request to the backend,
    /// relay its 101 handshake, then splice bytes in both directions.
    async fn handle_upgrade(
        self: &Arc<Self>,
        req: Request<Incoming>,
        site: &Arc<Site>,
        target: BackendTarget,
        remote: SocketAddr,
    ) -> Result<Response<GateBody>, hyper::Error> {
        let site_name = site.name();
        debug!(site = %site_name, remote = %remote.ip(), "handling upgrade request");

        let backend_host = match &target {
            BackendTarget::Tcp(authority) => authority.clone(),
            BackendTarget::Unix(path) => path.display().to_string(),
        };
        let raw_request = build_upgrade_request(&req, &backend_host, &self.marker_header);

        let mut backend = match connect_backend(&target).await {
            Ok(stream) => stream,
            Err(err) => {
                error!(site = %site_name, error = %err, "failed to connect backend for upgrade");
                return Ok(json_error_response(
                    GateErrorCode::BackendUnreachable,
                    "Failed to connect to backend",
                ));
            }
        };

        if let Err(err) = backend.write_all(&raw_request).await {
            error!(site = %site_name, error = %err, "failed to send upgrade request");
            return Ok(json_error_response(
                GateErrorCode::BackendUnreachable,
                "Failed to send upgrade request",
            ));
        }

        let mut response_buf = vec![0u8; 4096];
        let n = match backend.read(&mut response_buf).await {
            Ok(n) if n > 0 => n,
            Ok(_) | Err(_) => {
                error!(site = %site_name, "backend closed connection during upgrade");
                return Ok(json_error_response(
                    GateErrorCode::BackendUnreachable,
                    "Backend closed connection",
                ));
            }
        };

        let Some((status, response_headers)) = parse_upgrade_response(&response_buf[..n]) else {
            error!(site = %site_name, "invalid upgrade response from backend");
            return Ok(json_error_response(
                GateErrorCode::BackendUnreachable,
                "Invalid upgrade response from backend",
            ));
        };

        let mut builder = Response::builder().status(status);
        for (name, value) in &response_headers {
            let lower = name.to_lowercase();
            if status == StatusCode::SWITCHING_PROTOCOLS
                && (lower == "content-length" || lower == "transfer-encoding")
            {
                continue;
            }
            if let Ok(value) = HeaderValue::from_str(value) {
                builder = builder.header(name.as_str(), value);
            }
        }
        let response = builder
            .body(full_body(Bytes::new()))
            .expect("valid response builder");

        if status != StatusCode::SWITCHING_PROTOCOLS {
            warn!(site = %site_name, %status, "backend rejected upgrade");
            return Ok(response);
        }

        info!(site = %site_name, "upgrade handshake complete");
        tokio::spawn(async move {
            match hyper::upgrade::on(req).await {
                Ok(upgraded) => {
                    let mut client_io = TokioIo::new(upgraded);
                    match tokio::io::copy_bidirectional(&mut client_io, &mut backend).await {
                        Ok((to_backend, to_client)) => {
                            debug!(
                                site = %site_name,
                                to_backend,
                                to_client,
                                "upgraded connection closed"
                            );
                        }
                        Err(err) => {
                            debug!(site = %site_name, error = %err, "upgraded connection error");
                        }
                    }
                }
                Err(err) => {
                    error!(site = %site_name, error = %err, "client upgrade failed");
                }
            }
        });

        Ok(response)
    }
}

trait BackendStream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> BackendStream for T {}

async fn connect_backend(target: &BackendTarget) -> std::io::Result<Box<dyn BackendStream>> {
    match target {
        BackendTarget::Tcp(authority) => {
            let stream = tokio::net::TcpStream::connect(authority).await?;
            Ok(Box::new(stream))
        }
        BackendTarget::Unix(path) => {
            let stream = tokio::net::UnixStream::connect(path).await?;
            Ok(Box::new(stream))
        }
    }
}

async fn send_unix(
    path: &Path,
    req: Request<Full<Bytes>>,
) -> anyhow::Result<Response<Incoming>> {
    let stream = tokio::net::UnixStream::connect(path).await?;
    let io = TokioIo::new(stream);
    let (mut sender, conn) = hyper::client::conn::http1::handshake(io).await?;
    tokio::spawn(async move {
        if let Err(err) = conn.await {
            debug!(error = %err, "backend connection ended");
        }
    });
    Ok(sender.send_request(req).await?)
}

pub fn extract_hostname<B>(req: &Request<B>) -> Option<String> {
    req.headers()
        .get(hyper::header::HOST)
        .and_then(|h| h.to_str().ok())
        .and_then(|h| {
            let hostname = h.split(':').next()?;
            if hostname.is_empty() || hostname.len() > MAX_HOSTNAME_LEN {
                return None;
            }
            // Alphanumeric, hyphen, and dot only; rejects log injection.
            if !hostname
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '.')
            {
                return None;
            }
            Some(hostname.to_lowercase())
        })
}

pub fn is_upgrade_request<B>(req: &Request<B>) -> bool {
    let has_upgrade_connection = req
        .headers()
        .get(hyper::header::CONNECTION)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_lowercase().contains("upgrade"))
        .unwrap_or(false);
    has_upgrade_connection && req.headers().contains_key(hyper::header::UPGRADE)
}

fn header_str(headers: &HeaderMap, name: hyper::header::HeaderName) -> &str {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
}

fn content_length(headers: &HeaderMap) -> u64 {
    headers
        .get(hyper::header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
        .unwrap_or(0)
}

/// Length-insensitive byte comparison without early exit.
fn fixed_eq(a: &[u8], b: &[u8]) -> bool {
    let mut diff = a.len() ^ b.len();
    for i in 0..a.len().max(b.len()) {
        let x = a.get(i).copied().unwrap_or(0);
        let y = b.get(i).copied().unwrap_or(0);
        diff |= (x ^ y) as usize;
    }
    diff == 0
}

/// Replace `{name}` placeholders with captured route parameters.
fn substitute_captures(template: &str, captures: &HashMap<String, String>) -> String {
    let mut out = template.to_string();
    for (name, value) in captures {
        out = out.replace(&format!("{{{name}}}"), value);
    }
    out
}

fn build_https_redirect<B>(req: &Request<B>, https_port: u16) -> Response<GateBody> {
    let host = req
        .headers()
        .get(hyper::header::HOST)
        .and_then(|h| h.to_str().ok())
        .map(|h| h.split(':').next().unwrap_or(h))
        .unwrap_or("localhost");
    let path = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");

    let location = if https_port == 443 {
        format!("https://{host}{path}")
    } else {
        format!("https://{host}:{https_port}{path}")
    };

    Response::builder()
        .status(StatusCode::MOVED_PERMANENTLY)
        .header(hyper::header::LOCATION, location)
        .header(hyper::header::CONTENT_TYPE, "text/plain")
        .body(full_body("Redirecting to HTTPS"))
        .expect("valid response builder")
}

fn redirect_response(
    target: &str,
    permanent: bool,
    captures: &HashMap<String, String>,
) -> Response<GateBody> {
    let location = substitute_captures(target, captures);
    let status = if permanent {
        StatusCode::MOVED_PERMANENTLY
    } else {
        StatusCode::FOUND
    };
    Response::builder()
        .status(status)
        .header(hyper::header::LOCATION, location)
        .body(full_body(Bytes::new()))
        .expect("valid response builder")
}

/// Map a request path onto the static root, rejecting traversal segments.
fn resolve_static_path(root: &Path, uri_path: &str) -> Option<PathBuf> {
    let rel = uri_path.trim_start_matches('/');
    if rel
        .split('/')
        .any(|seg| seg == ".." || seg.contains('\\') || seg.contains('\0'))
    {
        return None;
    }
    let mut path = root.join(rel);
    if rel.is_empty() || uri_path.ends_with('/') {
        path = path.join("index.html");
    }
    Some(path)
}

fn content_type_for(path: &Path) -> &'static str {
    match path.extension().and_then(|e| e.to_str()) {
        Some("html") | Some("htm") => "text/html; charset=utf-8",
        Some("css") => "text/css",
        Some("js") => "application/javascript",
        Some("json") => "application/json",
        Some("png") => "image/png",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        Some("gif") => "image/gif",
        Some("svg") => "image/svg+xml",
        Some("ico") => "image/x-icon",
        Some("txt") => "text/plain; charset=utf-8",
        Some("wasm") => "application/wasm",
        _ => "application/octet-stream",
    }
}

async fn serve_static(root: &Path, uri_path: &str) -> Response<GateBody> {
    let Some(path) = resolve_static_path(root, uri_path) else {
        return json_error_response(GateErrorCode::FileNotFound, "File not found");
    };
    match tokio::fs::read(&path).await {
        Ok(data) => Response::builder()
            .status(StatusCode::OK)
            .header(hyper::header::CONTENT_TYPE, content_type_for(&path))
            .header(hyper::header::CONTENT_LENGTH, data.len())
            .body(full_body(data))
            .expect("valid response builder"),
        Err(_) => json_error_response(GateErrorCode::FileNotFound, "File not found"),
    }
}

/// Raw HTTP/1.1 request bytes for the backend side of an upgrade.
fn build_upgrade_request<B>(
    req: &Request<B>,
    backend_host: &str,
    marker_header: &HeaderName,
) -> Vec<u8> {
    let path = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let mut out = format!("{} {} HTTP/1.1\r\n", req.method(), path);

    for (name, value) in req.headers() {
        if name == hyper::header::HOST {
            continue;
        }
        if let Ok(value) = value.to_str() {
            out.push_str(&format!("{name}: {value}\r\n"));
        }
    }
    out.push_str(&format!("Host: {backend_host}\r\n"));
    out.push_str(&format!("{marker_header}: 1\r\n"));
    out.push_str("\r\n");
    out.into_bytes()
}

/// Parse the backend's raw HTTP response head, looking for 101.
fn parse_upgrade_response(data: &[u8]) -> Option<(StatusCode, Vec<(String, String)>)> {
    let text = std::str::from_utf8(data).ok()?;
    let mut lines = text.lines();

    let status_line = lines.next()?;
    let mut parts = status_line.splitn(3, ' ');
    parts.next()?;
    let status = StatusCode::from_u16(parts.next()?.parse().ok()?).ok()?;

    let mut headers = Vec::new();
    for line in lines {
        if line.is_empty() {
            break;
        }
        if let Some((name, value)) = line.split_once(':') {
            headers.push((name.trim().to_string(), value.trim().to_string()));
        }
    }
    Some((status, headers))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::site::{BackendRecord, DomainRecord};
    use crate::worker::{ProcessHandle, SpawnSpec};

    struct FailingSpawner;

    impl ProcessSpawner for FailingSpawner {
        fn spawn(&self, _spec: &SpawnSpec) -> anyhow::Result<ProcessHandle> {
            anyhow::bail!("spawning disabled in this test")
        }
    }

    fn test_dispatcher() -> Arc<Dispatcher> {
        let (activity_tx, mut activity_rx) = mpsc::unbounded_channel();
        tokio::spawn(async move { while activity_rx.recv().await.is_some() {} });
        Dispatcher::new(
            Arc::new(Config::default()),
            Arc::new(FailingSpawner),
            activity_tx,
        )
        .unwrap()
    }

    fn proxy_record(id: &str, name: &str, hostnames: Vec<&str>) -> SiteRecord {
        SiteRecord {
            id: id.into(),
            name: name.into(),
            domains: vec![DomainRecord {
                hostnames: hostnames.into_iter().map(String::from).collect(),
                ..Default::default()
            }],
            backend: BackendRecord::Proxy {
                target: "http://127.0.0.1:9000".into(),
            },
            settings: Default::default(),
        }
    }

    #[test]
    fn test_bind_allocator_reserves_until_released() {
        let dir = tempfile::tempdir().unwrap();
        let allocator = BindAllocator::new(47310, vec![], dir.path());

        let a = allocator.allocate_port().unwrap();
        let b = allocator.allocate_port().unwrap();
        assert_ne!(a, b);
        assert_eq!(allocator.reserved_ports(), 2);

        allocator.release_port(a);
        let c = allocator.allocate_port().unwrap();
        assert_eq!(c, a);
    }

    #[test]
    fn test_bind_allocator_skips_own_ports() {
        let dir = tempfile::tempdir().unwrap();
        let allocator = BindAllocator::new(47400, vec![47400, 47401], dir.path());
        let port = allocator.allocate_port().unwrap();
        assert!(port >= 47402);
    }

    #[test]
    fn test_socket_file_unique_paths() {
        let dir = tempfile::tempdir().unwrap();
        let allocator = BindAllocator::new(47500, vec![], dir.path());
        let a = allocator.socket_file("site-1").unwrap();
        let b = allocator.socket_file("site-1").unwrap();
        assert_ne!(a, b);
        assert!(a.starts_with(dir.path()));
        assert!(a.file_name().unwrap().to_str().unwrap().starts_with("site-1-"));
    }

    #[tokio::test]
    async fn test_resolve_prefers_exact_index_then_patterns() {
        let dispatcher = test_dispatcher();
        dispatcher.register_record(&proxy_record("s1", "api", vec!["api.test"]));

        let mut wildcard = proxy_record("s2", "apps", vec![]);
        wildcard.domains = vec![DomainRecord {
            patterns: vec!["*.apps.test".into()],
            ..Default::default()
        }];
        dispatcher.register_record(&wildcard);

        assert_eq!(dispatcher.resolve("api.test", None).unwrap().site.id, "s1");
        assert_eq!(
            dispatcher.resolve("x.apps.test", None).unwrap().site.id,
            "s2"
        );
        assert!(dispatcher.resolve("nope.test", None).is_none());
    }

    #[tokio::test]
    async fn test_apply_records_diffs_by_id() {
        let dispatcher = test_dispatcher();
        dispatcher.register_record(&proxy_record("s1", "api", vec!["api.test"]));
        dispatcher.register_record(&proxy_record("s2", "web", vec!["web.test"]));
        assert_eq!(dispatcher.active_sites(), 2);

        let s1_site = dispatcher.site_by_id("s1").unwrap();
        s1_site.counters.register_hit();

        // s2 disappears, s1 changes hostname, s3 appears.
        dispatcher
            .apply_records(vec![
                proxy_record("s1", "api", vec!["api2.test"]),
                proxy_record("s3", "docs", vec!["docs.test"]),
            ])
            .await;

        assert_eq!(dispatcher.active_sites(), 2);
        assert!(dispatcher.resolve("web.test", None).is_none());
        assert!(dispatcher.resolve("api.test", None).is_none());
        assert!(dispatcher.resolve("api2.test", None).is_some());
        assert!(dispatcher.resolve("docs.test", None).is_some());

        // The updated site is the same instance: counters survived.
        let updated = dispatcher.site_by_id("s1").unwrap();
        assert!(Arc::ptr_eq(&s1_site, &updated));
        assert_eq!(updated.counters.snapshot().hits, 1);
    }

    #[tokio::test]
    async fn test_update_is_idempotent_for_unindexed_site() {
        let dispatcher = test_dispatcher();
        let record = proxy_record("s1", "api", vec!["api.test"]);
        let site = Arc::new(Site::new(
            &record,
            SiteKind::Proxy {
                target: "http://127.0.0.1:9000".into(),
            },
        ));
        // Never registered; removal must not panic or error.
        dispatcher.remove_site(&site).await;
        assert_eq!(dispatcher.active_sites(), 0);
    }

    #[test]
    fn test_extract_hostname_validates() {
        let req = Request::builder()
            .header("host", "Api.Test:8443")
            .body(())
            .unwrap();
        assert_eq!(extract_hostname(&req).as_deref(), Some("api.test"));

        let bad = Request::builder()
            .header("host", "evil host\u{7f}")
            .body(())
            .unwrap();
        assert_eq!(extract_hostname(&bad), None);

        let empty = Request::builder().body(()).unwrap();
        assert_eq!(extract_hostname(&empty), None);
    }

    #[test]
    fn test_fixed_eq() {
        assert!(fixed_eq(b"user:pass", b"user:pass"));
        assert!(!fixed_eq(b"user:pass", b"user:PASS"));
        assert!(!fixed_eq(b"short", b"longer-value"));
        assert!(fixed_eq(b"", b""));
    }

    #[test]
    fn test_substitute_captures() {
        let mut captures = HashMap::new();
        captures.insert("project".to_string(), "blog".to_string());
        assert_eq!(
            substitute_captures("/var/run/{project}.sock", &captures),
            "/var/run/blog.sock"
        );
        assert_eq!(substitute_captures("no-placeholders", &captures), "no-placeholders");
    }

    #[test]
    fn test_parse_backend_target() {
        assert!(matches!(
            parse_backend_target("/tmp/tg/a.sock"),
            BackendTarget::Unix(_)
        ));
        match parse_backend_target("http://127.0.0.1:9000/") {
            BackendTarget::Tcp(authority) => assert_eq!(authority, "127.0.0.1:9000"),
            _ => panic!("expected tcp target"),
        }
        match parse_backend_target("127.0.0.1:9000") {
            BackendTarget::Tcp(authority) => assert_eq!(authority, "127.0.0.1:9000"),
            _ => panic!("expected tcp target"),
        }
    }

    #[test]
    fn test_resolve_static_path_rejects_traversal() {
        let root = Path::new("/srv/site");
        assert!(resolve_static_path(root, "/../etc/passwd").is_none());
        assert!(resolve_static_path(root, "/a/../../etc/passwd").is_none());
        assert_eq!(
            resolve_static_path(root, "/css/app.css").unwrap(),
            root.join("css/app.css")
        );
        assert_eq!(
            resolve_static_path(root, "/").unwrap(),
            root.join("index.html")
        );
        assert_eq!(
            resolve_static_path(root, "/docs/").unwrap(),
            root.join("docs/index.html")
        );
    }

    #[test]
    fn test_parse_upgrade_response() {
        let raw = b"HTTP/1.1 101 Switching Protocols\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\r\n";
        let (status, headers) = parse_upgrade_response(raw).unwrap();
        assert_eq!(status, StatusCode::SWITCHING_PROTOCOLS);
        assert!(headers
            .iter()
            .any(|(name, value)| name == "Upgrade" && value == "websocket"));

        assert!(parse_upgrade_response(b"garbage").is_none());
    }

    #[test]
    fn test_is_upgrade_request() {
        let upgrade = Request::builder()
            .header("connection", "keep-alive, Upgrade")
            .header("upgrade", "websocket")
            .body(())
            .unwrap();
        assert!(is_upgrade_request(&upgrade));

        let plain = Request::builder().header("connection", "keep-alive").body(()).unwrap();
        assert!(!is_upgrade_request(&plain));
    }
}
