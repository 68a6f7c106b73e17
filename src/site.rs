//! Site registry entities: routing predicates plus a serving strategy.
//!
//! A `Site` is mutated in place by `apply_record` so that references held by
//! in-flight requests and the stats collector stay valid across config syncs.
//! The dispatcher owns the id/domain/name indices; this module only knows how
//! to match a hostname/IP against its own rules.

use dashmap::DashMap;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::supervisor::SitePool;

/// Persisted site record, the unit of config sync.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SiteRecord {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub domains: Vec<DomainRecord>,
    pub backend: BackendRecord,
    #[serde(default)]
    pub settings: SiteSettings,
}

/// One routing entry: literals, wildcard patterns, raw regexes, and filters.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DomainRecord {
    /// Exact hostnames, matched before any pattern
    #[serde(default)]
    pub hostnames: Vec<String>,

    /// Wildcard patterns using `*` and `?`, compiled to anchored regexes
    #[serde(default)]
    pub patterns: Vec<String>,

    /// Raw regexes; named capture groups become route parameters
    #[serde(default)]
    pub regexes: Vec<String>,

    /// IP allow-list; empty means unrestricted, "any" always passes
    #[serde(default)]
    pub listen_on: Vec<String>,

    /// Extra response headers applied when this entry matched
    #[serde(default)]
    pub headers: HashMap<String, String>,
}

/// Serving strategy stored in the record.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum BackendRecord {
    Node {
        script: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        env: HashMap<String, String>,
        #[serde(default)]
        minimum_processes: Option<usize>,
        #[serde(default)]
        maximum_processes: Option<usize>,
        #[serde(default)]
        wait_for_ready: Option<bool>,
        /// Bind workers to unix sockets instead of TCP ports
        #[serde(default)]
        use_socket: bool,
        #[serde(default)]
        runtime: Option<String>,
    },
    Proxy {
        target: String,
    },
    Static {
        root: PathBuf,
    },
    Redirect {
        target: String,
        #[serde(default)]
        permanent: bool,
    },
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SiteSettings {
    /// Per-site HTTP→HTTPS redirect override; None inherits the global flag
    #[serde(default)]
    pub force_https: Option<bool>,

    /// Basic-auth allow-list of "user:pass" entries; empty disables the gate
    #[serde(default)]
    pub basic_auth: Vec<String>,
}

/// How a matched site serves traffic.
pub enum SiteKind {
    Node(Arc<SitePool>),
    Proxy { target: String },
    Static { root: PathBuf },
    Redirect { target: String, permanent: bool },
}

impl SiteKind {
    pub fn label(&self) -> &'static str {
        match self {
            SiteKind::Node(_) => "node",
            SiteKind::Proxy { .. } => "proxy",
            SiteKind::Static { .. } => "static",
            SiteKind::Redirect { .. } => "redirect",
        }
    }
}

/// Outcome of a successful domain match.
#[derive(Debug, Clone, Default)]
pub struct DomainMatch {
    /// Named capture groups extracted from a regex rule
    pub captures: HashMap<String, String>,
    /// Extra headers configured on the matched domain entry
    pub headers: HashMap<String, String>,
}

#[derive(Debug)]
enum HostPattern {
    /// Wildcard or raw regex, anchored at compile time
    Regex(Regex),
}

#[derive(Debug)]
struct CompiledDomain {
    hostnames: Vec<String>,
    patterns: Vec<HostPattern>,
    any_ip: bool,
    listen_on: Vec<IpAddr>,
    headers: HashMap<String, String>,
}

impl CompiledDomain {
    fn compile(record: &DomainRecord) -> Self {
        let mut patterns = Vec::new();
        for pat in &record.patterns {
            match Regex::new(&wildcard_to_regex(pat)) {
                Ok(re) => patterns.push(HostPattern::Regex(re)),
                Err(err) => {
                    tracing::warn!(pattern = %pat, error = %err, "skipping invalid wildcard pattern")
                }
            }
        }
        for raw in &record.regexes {
            let anchored = anchor_regex(raw);
            match Regex::new(&anchored) {
                Ok(re) => patterns.push(HostPattern::Regex(re)),
                Err(err) => {
                    tracing::warn!(regex = %raw, error = %err, "skipping invalid domain regex")
                }
            }
        }

        let mut any_ip = false;
        let mut listen_on = Vec::new();
        for entry in &record.listen_on {
            if entry.eq_ignore_ascii_case("any") {
                any_ip = true;
            } else if let Ok(ip) = entry.parse::<IpAddr>() {
                listen_on.push(ip);
            } else {
                tracing::warn!(entry = %entry, "skipping unparseable listen_on entry");
            }
        }

        Self {
            hostnames: record
                .hostnames
                .iter()
                .map(|h| h.to_ascii_lowercase())
                .collect(),
            patterns,
            any_ip,
            listen_on,
            headers: record.headers.clone(),
        }
    }

    /// Whether this entry accepts connections arriving on `ip`.
    fn accepts_ip(&self, ip: Option<IpAddr>) -> bool {
        if self.listen_on.is_empty() && !self.any_ip {
            return true;
        }
        if self.any_ip {
            return true;
        }
        let Some(ip) = ip else {
            // No probe IP supplied means the caller doesn't care about the
            // restriction (e.g. index rebuilds), so a restricted entry passes.
            return true;
        };
        self.listen_on
            .iter()
            .any(|allowed| ip_equivalent(*allowed, ip))
    }

    fn match_hostname(&self, hostname: &str) -> Option<DomainMatch> {
        if self.hostnames.iter().any(|h| h == hostname) {
            return Some(DomainMatch {
                captures: HashMap::new(),
                headers: self.headers.clone(),
            });
        }

        for HostPattern::Regex(re) in &self.patterns {
            if let Some(caps) = re.captures(hostname) {
                let mut captures = HashMap::new();
                for name in re.capture_names().flatten() {
                    if let Some(value) = caps.name(name) {
                        captures.insert(name.to_string(), value.as_str().to_string());
                    }
                }
                // A project capture containing a dot smuggles a subdomain
                // into the backend path; treat it as a non-match.
                if captures.get("project").is_some_and(|p| p.contains('.')) {
                    continue;
                }
                return Some(DomainMatch {
                    captures,
                    headers: self.headers.clone(),
                });
            }
        }
        None
    }
}

/// Two IPs are equivalent when equal or IPv4-mapped forms of each other.
fn ip_equivalent(a: IpAddr, b: IpAddr) -> bool {
    if a == b {
        return true;
    }
    match (a, b) {
        (IpAddr::V4(v4), IpAddr::V6(v6)) | (IpAddr::V6(v6), IpAddr::V4(v4)) => {
            v6.to_ipv4_mapped() == Some(v4)
        }
        _ => false,
    }
}

/// Compile a `*`/`?` wildcard into an anchored regex source string.
fn wildcard_to_regex(pattern: &str) -> String {
    let mut out = String::with_capacity(pattern.len() + 8);
    out.push('^');
    for ch in pattern.chars() {
        match ch {
            '*' => out.push_str(".*"),
            '?' => out.push('.'),
            c => out.push_str(&regex::escape(&c.to_string())),
        }
    }
    out.push('$');
    out
}

fn anchor_regex(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len() + 2);
    if !raw.starts_with('^') {
        out.push('^');
    }
    out.push_str(raw);
    if !raw.ends_with('$') {
        out.push('$');
    }
    out
}

#[derive(Debug, Default)]
struct PathCounter {
    incoming: AtomicU64,
    outgoing: AtomicU64,
}

/// Monotonic traffic counters, reset only on process restart.
#[derive(Debug, Default)]
pub struct SiteCounters {
    pub incoming_bytes: AtomicU64,
    pub outgoing_bytes: AtomicU64,
    pub hit_counter: AtomicU64,
    path_counters: DashMap<String, PathCounter>,
}

/// Point-in-time view of a site's counters.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct CounterSnapshot {
    pub incoming_bytes: u64,
    pub outgoing_bytes: u64,
    pub hits: u64,
}

impl SiteCounters {
    pub fn register_hit(&self) {
        self.hit_counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_bytes(&self, path: &str, incoming: u64, outgoing: u64) {
        self.incoming_bytes.fetch_add(incoming, Ordering::Relaxed);
        self.outgoing_bytes.fetch_add(outgoing, Ordering::Relaxed);
        let entry = self.path_counters.entry(path.to_string()).or_default();
        entry.incoming.fetch_add(incoming, Ordering::Relaxed);
        entry.outgoing.fetch_add(outgoing, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> CounterSnapshot {
        CounterSnapshot {
            incoming_bytes: self.incoming_bytes.load(Ordering::Relaxed),
            outgoing_bytes: self.outgoing_bytes.load(Ordering::Relaxed),
            hits: self.hit_counter.load(Ordering::Relaxed),
        }
    }

    pub fn path_totals(&self) -> HashMap<String, (u64, u64)> {
        self.path_counters
            .iter()
            .map(|entry| {
                (
                    entry.key().clone(),
                    (
                        entry.incoming.load(Ordering::Relaxed),
                        entry.outgoing.load(Ordering::Relaxed),
                    ),
                )
            })
            .collect()
    }
}

struct SiteRouting {
    name: String,
    domains: Vec<CompiledDomain>,
    /// Hostnames the dispatcher indexes this site under
    indexed_hostnames: Vec<String>,
    settings: SiteSettings,
}

/// A configured routing + backend unit.
pub struct Site {
    pub id: String,
    routing: RwLock<SiteRouting>,
    kind: RwLock<Arc<SiteKind>>,
    pub counters: SiteCounters,
}

impl Site {
    pub fn new(record: &SiteRecord, kind: SiteKind) -> Self {
        Self {
            id: record.id.clone(),
            routing: RwLock::new(Self::compile_routing(record)),
            kind: RwLock::new(Arc::new(kind)),
            counters: SiteCounters::default(),
        }
    }

    fn compile_routing(record: &SiteRecord) -> SiteRouting {
        let domains: Vec<CompiledDomain> =
            record.domains.iter().map(CompiledDomain::compile).collect();
        let indexed_hostnames = domains
            .iter()
            .flat_map(|d| d.hostnames.iter().cloned())
            .collect();
        SiteRouting {
            name: record.name.clone(),
            domains,
            indexed_hostnames,
            settings: record.settings.clone(),
        }
    }

    pub fn name(&self) -> String {
        self.routing.read().name.clone()
    }

    pub fn settings(&self) -> SiteSettings {
        self.routing.read().settings.clone()
    }

    pub fn kind(&self) -> Arc<SiteKind> {
        self.kind.read().clone()
    }

    /// Hostnames under which the dispatcher indexes this site.
    pub fn indexed_hostnames(&self) -> Vec<String> {
        self.routing.read().indexed_hostnames.clone()
    }

    /// Whether any domain entry uses a wildcard or regex rule. Such sites
    /// cannot be resolved from the hostname index alone.
    pub fn has_patterns(&self) -> bool {
        self.routing
            .read()
            .domains
            .iter()
            .any(|d| !d.patterns.is_empty())
    }

    /// Match a request hostname (and optionally the local IP the connection
    /// arrived on) against this site's domain entries, in registration order.
    pub fn matches(&self, hostname: &str, ip: Option<IpAddr>) -> Option<DomainMatch> {
        let hostname = hostname.to_ascii_lowercase();
        let routing = self.routing.read();
        for domain in &routing.domains {
            if !domain.accepts_ip(ip) {
                continue;
            }
            if let Some(m) = domain.match_hostname(&hostname) {
                return Some(m);
            }
        }
        None
    }

    /// Replace routing rules and settings in place. Counters survive; the
    /// caller reindexes and swaps the serving strategy if it changed.
    pub fn apply_record(&self, record: &SiteRecord) {
        *self.routing.write() = Self::compile_routing(record);
    }

    pub fn replace_kind(&self, kind: SiteKind) {
        *self.kind.write() = Arc::new(kind);
    }
}
