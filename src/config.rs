use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// Global configuration for the proxy host
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// Listener configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Worker-pool defaults and spawn settings
    #[serde(default)]
    pub pools: PoolDefaults,

    /// Stats collection and retention
    #[serde(default)]
    pub stats: StatsConfig,

    /// TLS / certificate provisioning
    #[serde(default)]
    pub tls: TlsConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// HTTP port (default: 80, set to 0 to disable)
    #[serde(default = "default_http_port")]
    pub port: u16,

    /// HTTPS port (default: 443 when TLS enabled, set to 0 to disable)
    pub tls_port: Option<u16>,

    /// Bind address (default: 0.0.0.0)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// Force redirect from HTTP to HTTPS for all sites (default: false);
    /// individual sites may override this in their settings
    #[serde(default)]
    pub force_https: bool,

    /// Where unmatched requests are forwarded instead of the rendered
    /// not-found page (host:port), if set
    pub fallback_address: Option<String>,

    /// Header used to mark requests this proxy already forwarded once
    #[serde(default = "default_marker_header")]
    pub marker_header: String,

    /// First port probed when allocating worker bind ports
    #[serde(default = "default_port_base")]
    pub worker_port_base: u16,

    /// Directory for worker unix socket files
    #[serde(default = "default_socket_dir")]
    pub socket_dir: String,

    /// Path to the site/stats database
    #[serde(default = "default_db_path")]
    pub db_path: String,

    /// PID file path, locked exclusively while running (optional)
    pub pid_file: Option<String>,

    /// Maximum idle proxied connections per backend (default: 10)
    #[serde(default = "default_pool_max_idle_per_host")]
    pub pool_max_idle_per_host: usize,

    /// Idle proxied-connection timeout in seconds (default: 90)
    #[serde(default = "default_pool_idle_timeout")]
    pub pool_idle_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_http_port(),
            tls_port: None,
            bind: default_bind_address(),
            force_https: false,
            fallback_address: None,
            marker_header: default_marker_header(),
            worker_port_base: default_port_base(),
            socket_dir: default_socket_dir(),
            db_path: default_db_path(),
            pid_file: None,
            pool_max_idle_per_host: default_pool_max_idle_per_host(),
            pool_idle_timeout_secs: default_pool_idle_timeout(),
        }
    }
}

impl ServerConfig {
    pub fn https_port(&self) -> u16 {
        self.tls_port.unwrap_or(443)
    }
}

/// Defaults applied to every site's worker pool; site settings override these.
#[derive(Debug, Deserialize, Clone)]
pub struct PoolDefaults {
    /// Workers kept running per node site (default: 1)
    #[serde(default = "default_minimum_processes")]
    pub minimum_processes: usize,

    /// Hard ceiling on workers per node site, 0 = unlimited (default: 0)
    #[serde(default)]
    pub maximum_processes: usize,

    /// Runtime used to execute site scripts (default: "node")
    #[serde(default = "default_runtime")]
    pub runtime: String,

    /// Wait for the worker's ready control message before routing (default: true)
    #[serde(default = "default_true")]
    pub wait_for_ready: bool,

    /// Health probe interval in milliseconds (default: 4000)
    #[serde(default = "default_probe_interval")]
    pub probe_interval_ms: u64,

    /// CPU% above which a worker counts as overloaded (default: 50)
    #[serde(default = "default_overload_cpu")]
    pub overload_cpu_percent: f32,

    /// Sustained overload duration before spawning an extra worker, seconds
    #[serde(default = "default_overload_secs")]
    pub overload_after_secs: u64,

    /// Sustained zero-CPU duration before reclaiming a surplus worker, seconds
    #[serde(default = "default_idle_secs")]
    pub idle_after_secs: u64,

    /// CPU% above which a worker is skipped during load balancing (default: 92)
    #[serde(default = "default_busy_cpu")]
    pub busy_cpu_percent: f32,

    /// Sticky fingerprint idle eviction, seconds (default: 3600)
    #[serde(default = "default_fingerprint_ttl")]
    pub fingerprint_ttl_secs: u64,

    /// Grace period between SIGTERM and SIGKILL, seconds (default: 10)
    #[serde(default = "default_grace_period")]
    pub shutdown_grace_period_secs: u64,
}

impl Default for PoolDefaults {
    fn default() -> Self {
        Self {
            minimum_processes: default_minimum_processes(),
            maximum_processes: 0,
            runtime: default_runtime(),
            wait_for_ready: default_true(),
            probe_interval_ms: default_probe_interval(),
            overload_cpu_percent: default_overload_cpu(),
            overload_after_secs: default_overload_secs(),
            idle_after_secs: default_idle_secs(),
            busy_cpu_percent: default_busy_cpu(),
            fingerprint_ttl_secs: default_fingerprint_ttl(),
            shutdown_grace_period_secs: default_grace_period(),
        }
    }
}

impl PoolDefaults {
    pub fn probe_interval(&self) -> Duration {
        Duration::from_millis(self.probe_interval_ms)
    }

    pub fn overload_after(&self) -> Duration {
        Duration::from_secs(self.overload_after_secs)
    }

    pub fn idle_after(&self) -> Duration {
        Duration::from_secs(self.idle_after_secs)
    }

    pub fn fingerprint_ttl(&self) -> Duration {
        Duration::from_secs(self.fingerprint_ttl_secs)
    }

    pub fn shutdown_grace_period(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_period_secs)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct StatsConfig {
    /// Sampling tick in milliseconds (default: 2000)
    #[serde(default = "default_sample_interval")]
    pub sample_interval_ms: u64,

    /// Persistence tick in seconds (default: 60)
    #[serde(default = "default_persist_interval")]
    pub persist_interval_secs: u64,

    /// Samples kept per ring buffer (default: 300, i.e. 10 minutes at 2s)
    #[serde(default = "default_sample_history")]
    pub sample_history: usize,

    /// Activity feed length (default: 50)
    #[serde(default = "default_activity_history")]
    pub activity_history: usize,

    /// Retention for minute-grain aggregates, days (default: 1)
    #[serde(default = "default_minute_retention")]
    pub minute_retention_days: u32,

    /// Retention for hour-grain aggregates, days (default: 30)
    #[serde(default = "default_hour_retention")]
    pub hour_retention_days: u32,

    /// Retention for day-grain aggregates, days (default: 365)
    #[serde(default = "default_day_retention")]
    pub day_retention_days: u32,
}

impl Default for StatsConfig {
    fn default() -> Self {
        Self {
            sample_interval_ms: default_sample_interval(),
            persist_interval_secs: default_persist_interval(),
            sample_history: default_sample_history(),
            activity_history: default_activity_history(),
            minute_retention_days: default_minute_retention(),
            hour_retention_days: default_hour_retention(),
            day_retention_days: default_day_retention(),
        }
    }
}

impl StatsConfig {
    pub fn sample_interval(&self) -> Duration {
        Duration::from_millis(self.sample_interval_ms)
    }

    pub fn persist_interval(&self) -> Duration {
        Duration::from_secs(self.persist_interval_secs)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct TlsConfig {
    /// Contact email for certificate registration. TLS provisioning is
    /// disabled entirely when unset; the HTTP listener still runs.
    pub email: Option<String>,

    /// ACME directory URL (defaults to Let's Encrypt production)
    pub directory_url: Option<String>,

    /// Local directory for account and certificate cache
    #[serde(default = "default_cert_cache_dir")]
    pub cache_dir: String,
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            email: None,
            directory_url: None,
            cache_dir: default_cert_cache_dir(),
        }
    }
}

impl TlsConfig {
    pub fn enabled(&self) -> bool {
        self.email.as_deref().map(|e| !e.is_empty()).unwrap_or(false)
    }
}

// Default value functions

fn default_http_port() -> u16 {
    80
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_marker_header() -> String {
    "x-tenantgate-forwarded".to_string()
}

fn default_port_base() -> u16 {
    4701
}

fn default_socket_dir() -> String {
    "/tmp/tenantgate".to_string()
}

fn default_db_path() -> String {
    "./tenantgate.db".to_string()
}

fn default_pool_max_idle_per_host() -> usize {
    10
}

fn default_pool_idle_timeout() -> u64 {
    90
}

fn default_minimum_processes() -> usize {
    1
}

fn default_runtime() -> String {
    "node".to_string()
}

fn default_true() -> bool {
    true
}

fn default_probe_interval() -> u64 {
    4000
}

fn default_overload_cpu() -> f32 {
    50.0
}

fn default_overload_secs() -> u64 {
    15
}

fn default_idle_secs() -> u64 {
    180
}

fn default_busy_cpu() -> f32 {
    92.0
}

fn default_fingerprint_ttl() -> u64 {
    3600
}

fn default_grace_period() -> u64 {
    10
}

fn default_sample_interval() -> u64 {
    2000
}

fn default_persist_interval() -> u64 {
    60
}

fn default_sample_history() -> usize {
    300
}

fn default_activity_history() -> usize {
    50
}

fn default_minute_retention() -> u32 {
    1
}

fn default_hour_retention() -> u32 {
    30
}

fn default_day_retention() -> u32 {
    365
}

fn default_cert_cache_dir() -> String {
    "./cert_cache".to_string()
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.pools.minimum_processes == 0 {
            anyhow::bail!("pools.minimum_processes must be at least 1");
        }
        if self.pools.maximum_processes != 0
            && self.pools.maximum_processes < self.pools.minimum_processes
        {
            anyhow::bail!("pools.maximum_processes must be >= minimum_processes");
        }
        if self.stats.sample_interval_ms == 0 {
            anyhow::bail!("stats.sample_interval_ms must be non-zero");
        }
        if self.stats.sample_history == 0 {
            anyhow::bail!("stats.sample_history must be at least 1");
        }
        if self.stats.activity_history == 0 {
            anyhow::bail!("stats.activity_history must be at least 1");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.server.port, 80);
        assert_eq!(config.server.bind, "0.0.0.0");
        assert_eq!(config.server.marker_header, "x-tenantgate-forwarded");
        assert_eq!(config.pools.minimum_processes, 1);
        assert_eq!(config.pools.maximum_processes, 0);
        assert_eq!(config.stats.sample_interval_ms, 2000);
        assert!(!config.tls.enabled());
    }

    #[test]
    fn test_parse_config() {
        let toml = r#"
[server]
port = 8080
bind = "127.0.0.1"
force_https = true
fallback_address = "127.0.0.1:9000"

[pools]
minimum_processes = 2
maximum_processes = 5
runtime = "node"

[stats]
sample_interval_ms = 1000
persist_interval_secs = 30

[tls]
email = "ops@example.com"
"#;
        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.server.port, 8080);
        assert!(config.server.force_https);
        assert_eq!(
            config.server.fallback_address.as_deref(),
            Some("127.0.0.1:9000")
        );
        assert_eq!(config.pools.minimum_processes, 2);
        assert_eq!(config.pools.maximum_processes, 5);
        assert_eq!(config.stats.persist_interval(), Duration::from_secs(30));
        assert!(config.tls.enabled());
    }

    #[test]
    fn test_validate_rejects_zero_minimum() {
        let config: Config = toml::from_str("[pools]\nminimum_processes = 0\n").unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_max_below_min() {
        let config: Config =
            toml::from_str("[pools]\nminimum_processes = 3\nmaximum_processes = 2\n").unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_empty_histories() {
        let config: Config = toml::from_str("[stats]\nsample_history = 0\n").unwrap();
        assert!(config.validate().is_err());

        let config: Config = toml::from_str("[stats]\nactivity_history = 0\n").unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_tls_disabled_without_email() {
        let config: Config = toml::from_str("[tls]\ncache_dir = \"/tmp/x\"\n").unwrap();
        assert!(!config.tls.enabled());

        let config: Config = toml::from_str("[tls]\nemail = \"\"\n").unwrap();
        assert!(!config.tls.enabled());
    }
}
