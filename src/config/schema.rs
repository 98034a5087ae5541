//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the proxy.
//! All types derive Serde traits for deserialization from config files.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Root configuration for the reverse proxy.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ProxyConfig {
    /// Listener configuration (bind address, TLS).
    pub listener: ListenerConfig,

    /// Rate-limit zones, each with the request rules that select it.
    pub zones: Vec<ZoneConfig>,

    /// Global rate limiting settings.
    pub rate_limit: RateLimitConfig,

    /// The socket-activated backend process.
    pub backend: BackendConfig,

    /// Health check settings.
    pub health_check: HealthCheckConfig,

    /// Restart backoff for crashed backends.
    pub restart: RestartConfig,

    /// Timeout configuration.
    pub timeouts: TimeoutConfig,

    /// Streaming buffer sizes.
    pub buffers: BufferConfig,

    /// Request line and header limits.
    pub limits: LimitsConfig,

    /// Security response headers.
    pub security: SecurityConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,

    /// Admin API.
    pub admin: AdminConfig,

    /// Reload triggers.
    pub reload: ReloadConfig,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            listener: ListenerConfig::default(),
            zones: default_zones(),
            rate_limit: RateLimitConfig::default(),
            backend: BackendConfig::default(),
            health_check: HealthCheckConfig::default(),
            restart: RestartConfig::default(),
            timeouts: TimeoutConfig::default(),
            buffers: BufferConfig::default(),
            limits: LimitsConfig::default(),
            security: SecurityConfig::default(),
            observability: ObservabilityConfig::default(),
            admin: AdminConfig::default(),
            reload: ReloadConfig::default(),
        }
    }
}

/// Listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Bind address (e.g., "0.0.0.0:8443").
    pub bind_address: String,

    /// Optional TLS configuration.
    pub tls: Option<TlsConfig>,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:8080".to_string(),
            tls: None,
        }
    }
}

/// TLS configuration for the listener.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct TlsConfig {
    /// Certificates selected by SNI. The first one also serves clients that
    /// send no server name.
    pub certificates: Vec<CertificateConfig>,
}

/// One certificate chain and its key.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct CertificateConfig {
    /// Server names (exact or `*.example.com`) this certificate answers for.
    #[serde(default)]
    pub server_names: Vec<String>,

    /// Path to certificate chain (PEM).
    pub cert_path: PathBuf,

    /// Path to private key (PEM).
    pub key_path: PathBuf,

    /// Optional DER-encoded OCSP response to staple.
    #[serde(default)]
    pub ocsp_path: Option<PathBuf>,
}

/// A token bucket rate.
///
/// Either a number of requests per second, or an expression such as
/// `"5/min"`, `"20/hour"`, `"10/s"`.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(untagged)]
pub enum RateSpec {
    PerSecond(f64),
    Expression(String),
}

impl RateSpec {
    /// Resolve to events per second.
    pub fn per_second(&self) -> Result<f64, String> {
        let rate = match self {
            RateSpec::PerSecond(rate) => *rate,
            RateSpec::Expression(expr) => parse_rate(expr)?,
        };
        if !rate.is_finite() || rate <= 0.0 {
            return Err(format!("rate must be positive, got {rate}"));
        }
        if rate < MIN_RATE_PER_SECOND {
            return Err(format!("rate must be at least 1/day, got {rate}/s"));
        }
        Ok(rate)
    }
}

/// Slowest accepted rate: one request per day.
pub const MIN_RATE_PER_SECOND: f64 = 1.0 / 86_400.0;

fn parse_rate(expr: &str) -> Result<f64, String> {
    let (count, unit) = expr
        .split_once('/')
        .ok_or_else(|| format!("rate '{expr}' must look like '<count>/<unit>'"))?;
    let count: f64 = count
        .trim()
        .parse()
        .map_err(|_| format!("rate '{expr}' has a non-numeric count"))?;
    let period = match unit.trim() {
        "s" | "sec" | "second" => 1.0,
        "m" | "min" | "minute" => 60.0,
        "h" | "hour" => 3600.0,
        "d" | "day" => 86_400.0,
        other => return Err(format!("unknown rate unit '{other}'")),
    };
    Ok(count / period)
}

/// How the client key for a zone is derived from the request.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum KeySource {
    /// TCP peer address.
    #[default]
    RemoteIp,
    /// Left-most `X-Forwarded-For` entry, falling back to the peer address.
    ForwardedFor,
    /// Value of the named header, falling back to the peer address.
    Header(String),
}

/// A named rate-limit zone.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct ZoneConfig {
    /// Zone identifier (e.g. "login").
    pub name: String,

    /// Sustained rate.
    pub rate: RateSpec,

    /// Maximum accumulated tokens.
    pub burst: u32,

    /// Client key derivation.
    #[serde(default)]
    pub key: KeySource,

    /// Requests that fall into this zone.
    #[serde(default)]
    pub rules: Vec<RuleConfig>,
}

/// A request rule. Exactly one of `exact` or `prefix` must be set.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct RuleConfig {
    /// Path that must match exactly.
    pub exact: Option<String>,

    /// Path prefix.
    pub prefix: Option<String>,

    /// Methods this rule applies to. Empty means any method.
    pub methods: Vec<String>,
}

impl RuleConfig {
    fn exact(path: &str, methods: &[&str]) -> Self {
        Self {
            exact: Some(path.to_string()),
            prefix: None,
            methods: methods.iter().map(|m| m.to_string()).collect(),
        }
    }

    fn prefix(path: &str, methods: &[&str]) -> Self {
        Self {
            exact: None,
            prefix: Some(path.to_string()),
            methods: methods.iter().map(|m| m.to_string()).collect(),
        }
    }
}

/// The zones applied when the config file defines none.
pub fn default_zones() -> Vec<ZoneConfig> {
    vec![
        ZoneConfig {
            name: "login".to_string(),
            rate: RateSpec::Expression("5/min".to_string()),
            burst: 2,
            key: KeySource::RemoteIp,
            rules: vec![RuleConfig::exact("/api/auth/admin-login/", &["POST"])],
        },
        ZoneConfig {
            name: "upload".to_string(),
            rate: RateSpec::Expression("20/hour".to_string()),
            burst: 5,
            key: KeySource::RemoteIp,
            rules: vec![
                RuleConfig::prefix("/api/memory-photos/bulk_upload/", &["POST"]),
                RuleConfig::prefix("/api/meeting-photos/bulk_upload/", &["POST"]),
            ],
        },
        ZoneConfig {
            name: "admin".to_string(),
            rate: RateSpec::PerSecond(2.0),
            burst: 10,
            key: KeySource::RemoteIp,
            rules: vec![RuleConfig::prefix("/admin/", &[])],
        },
        ZoneConfig {
            name: "api".to_string(),
            rate: RateSpec::PerSecond(10.0),
            burst: 20,
            key: KeySource::RemoteIp,
            rules: vec![RuleConfig::prefix("/api/", &[])],
        },
    ]
}

/// Rate limiting configuration.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Enable rate limiting.
    pub enabled: bool,

    /// Idle time after which a refilled bucket may be evicted.
    pub idle_ttl_secs: u64,

    /// How often the eviction sweep runs.
    pub sweep_interval_secs: u64,

    /// Zone for requests no rule matches. `None` leaves them unlimited.
    pub default_zone: Option<String>,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            idle_ttl_secs: 600,
            sweep_interval_secs: 60,
            default_zone: None,
        }
    }
}

impl RateLimitConfig {
    pub fn idle_ttl(&self) -> Duration {
        Duration::from_secs(self.idle_ttl_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }
}

/// Backend process and its activation socket.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct BackendConfig {
    /// Program to run.
    pub command: String,

    /// Program arguments.
    pub args: Vec<String>,

    /// Extra environment variables.
    pub env: BTreeMap<String, String>,

    /// Working directory for the process.
    pub working_dir: Option<PathBuf>,

    /// Filesystem path of the listening socket shared with the backend.
    pub socket_path: PathBuf,

    /// Socket file permissions.
    pub socket_mode: u32,

    /// Listen backlog; connections queue here while the backend starts.
    pub socket_backlog: u32,

    /// Timeout for connecting to the socket, in milliseconds.
    pub connect_timeout_ms: u64,

    /// Grace period between SIGTERM and SIGKILL, in seconds.
    pub shutdown_grace_secs: u64,

    /// Restart the backend even when it exits with status 0.
    pub restart_on_clean_exit: bool,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            command: "gunicorn".to_string(),
            args: vec![
                "--bind".to_string(),
                "fd://3".to_string(),
                "config.wsgi:application".to_string(),
            ],
            env: BTreeMap::new(),
            working_dir: None,
            socket_path: PathBuf::from("/run/edge-proxy/backend.sock"),
            socket_mode: 0o600,
            socket_backlog: 2048,
            connect_timeout_ms: 1000,
            shutdown_grace_secs: 30,
            restart_on_clean_exit: false,
        }
    }
}

impl BackendConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

/// Health check configuration.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct HealthCheckConfig {
    /// Enable active health checks.
    pub enabled: bool,

    /// Probe interval in milliseconds.
    pub interval_ms: u64,

    /// Probe timeout in milliseconds.
    pub timeout_ms: u64,

    /// Path to probe on the backend.
    pub path: String,

    /// Host header sent with probes.
    pub host: String,

    /// Consecutive failures before Healthy becomes Unhealthy.
    pub unhealthy_threshold: u32,

    /// Consecutive failures after which the backend is treated as crashed.
    pub failure_ceiling: u32,

    /// Also check that the public listener accepts connections.
    pub probe_router: bool,
}

impl Default for HealthCheckConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_ms: 5000,
            timeout_ms: 2000,
            path: "/api/health/".to_string(),
            host: "localhost".to_string(),
            unhealthy_threshold: 3,
            failure_ceiling: 6,
            probe_router: true,
        }
    }
}

impl HealthCheckConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms.max(1))
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

/// Restart backoff configuration.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct RestartConfig {
    /// Delay before the first restart, in milliseconds.
    pub base_delay_ms: u64,

    /// Upper bound on the restart delay, in milliseconds.
    pub max_delay_ms: u64,

    /// Growth factor per consecutive crash.
    pub multiplier: f64,

    /// Healthy time after which the backoff resets, in seconds.
    pub healthy_reset_secs: u64,
}

impl Default for RestartConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 500,
            max_delay_ms: 60_000,
            multiplier: 2.0,
            healthy_reset_secs: 60,
        }
    }
}

/// Timeout configuration for various operations.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Total time for a request to produce response headers, in seconds.
    pub request_secs: u64,

    /// Time the backend has to send response headers, in seconds.
    pub backend_response_secs: u64,

    /// Maximum gap between body chunks in either direction, in seconds.
    pub idle_secs: u64,

    /// Time a client has to send request headers, in seconds.
    pub header_read_secs: u64,

    /// How long in-flight requests may drain on shutdown, in seconds.
    pub shutdown_grace_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            request_secs: 310,
            backend_response_secs: 300,
            idle_secs: 60,
            header_read_secs: 30,
            shutdown_grace_secs: 30,
        }
    }
}

impl TimeoutConfig {
    pub fn request(&self) -> Duration {
        Duration::from_secs(self.request_secs)
    }

    pub fn backend_response(&self) -> Duration {
        Duration::from_secs(self.backend_response_secs)
    }

    pub fn idle(&self) -> Duration {
        Duration::from_secs(self.idle_secs)
    }

    pub fn header_read(&self) -> Duration {
        Duration::from_secs(self.header_read_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

/// Streaming buffer limits.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct BufferConfig {
    /// Per-connection read/write buffer ceiling in bytes (min 8192).
    pub max_buf_size: usize,

    /// Maximum request body size in bytes.
    pub max_body_size: usize,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            max_buf_size: 64 * 1024,
            max_body_size: 50 * 1024 * 1024,
        }
    }
}

/// Request line and header limits.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// Longest accepted request line (method, target, version).
    pub max_request_line: usize,

    /// Most header fields per request.
    pub max_headers: usize,

    /// Longest single header field (name and value).
    pub max_header_size: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_request_line: 4094,
            max_headers: 100,
            max_header_size: 8190,
        }
    }
}

/// Security hardening configuration.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct SecurityConfig {
    /// Enable security headers.
    pub enable_headers: bool,

    /// Header values.
    pub headers: SecurityHeadersConfig,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            enable_headers: true,
            headers: SecurityHeadersConfig::default(),
        }
    }
}

/// Values for the injected response headers.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct SecurityHeadersConfig {
    pub content_type_options: String,
    pub frame_options: String,
    pub strict_transport_security: String,
    pub referrer_policy: String,
    pub permissions_policy: String,
    pub content_security_policy: String,
}

impl Default for SecurityHeadersConfig {
    fn default() -> Self {
        Self {
            content_type_options: "nosniff".to_string(),
            frame_options: "DENY".to_string(),
            strict_transport_security: "max-age=31536000; includeSubDomains".to_string(),
            referrer_policy: "strict-origin-when-cross-origin".to_string(),
            permissions_policy: "camera=(), microphone=(), geolocation=()".to_string(),
            content_security_policy: "default-src 'self'; img-src 'self' data: blob:; frame-ancestors 'none'"
                .to_string(),
        }
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Observability configuration.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Log line format.
    pub log_format: LogFormat,

    /// Enable metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_format: LogFormat::Pretty,
            metrics_enabled: false,
            metrics_address: "127.0.0.1:9090".to_string(),
        }
    }
}

/// Admin API configuration.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct AdminConfig {
    /// Enable the admin API.
    pub enabled: bool,

    /// API key for authentication (Bearer token).
    pub api_key: String,

    /// Admin API bind address.
    pub bind_address: String,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            // WARNING: This is a placeholder! Change this in production.
            api_key: "CHANGE_ME_IN_PRODUCTION".to_string(),
            bind_address: "127.0.0.1:8081".to_string(),
        }
    }
}

/// Reload triggers besides SIGHUP and the admin API.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct ReloadConfig {
    /// Reload automatically when the config file changes.
    pub watch_file: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_expressions() {
        let rate = RateSpec::Expression("5/min".into()).per_second().unwrap();
        assert!((rate - 5.0 / 60.0).abs() < 1e-12);
        let rate = RateSpec::Expression("20/hour".into()).per_second().unwrap();
        assert!((rate - 20.0 / 3600.0).abs() < 1e-12);
        assert_eq!(RateSpec::Expression("10/s".into()).per_second().unwrap(), 10.0);
        assert_eq!(RateSpec::PerSecond(0.5).per_second().unwrap(), 0.5);
    }

    #[test]
    fn bad_rates_are_rejected() {
        assert!(RateSpec::Expression("fast".into()).per_second().is_err());
        assert!(RateSpec::Expression("5/fortnight".into()).per_second().is_err());
        assert!(RateSpec::PerSecond(0.0).per_second().is_err());
        assert!(RateSpec::PerSecond(-1.0).per_second().is_err());
        assert!(RateSpec::PerSecond(1e-20).per_second().is_err());
        assert!(RateSpec::Expression("1/day".into()).per_second().is_ok());
    }

    #[test]
    fn zones_parse_from_toml() {
        let config: ProxyConfig = toml::from_str(
            r#"
            [[zones]]
            name = "login"
            rate = "5/min"
            burst = 2

            [[zones.rules]]
            exact = "/api/auth/admin-login/"
            methods = ["POST"]

            [[zones]]
            name = "partner"
            rate = 3.5
            burst = 7
            key = { header = "x-api-key" }

            [[zones.rules]]
            prefix = "/api/partner/"
            "#,
        )
        .unwrap();

        assert_eq!(config.zones.len(), 2);
        assert_eq!(config.zones[0].key, KeySource::RemoteIp);
        assert_eq!(config.zones[1].key, KeySource::Header("x-api-key".into()));
        assert_eq!(config.zones[1].rate, RateSpec::PerSecond(3.5));
        assert_eq!(config.zones[1].rules[0].prefix.as_deref(), Some("/api/partner/"));
    }

    #[test]
    fn empty_file_uses_defaults() {
        let config: ProxyConfig = toml::from_str("").unwrap();
        let names: Vec<_> = config.zones.iter().map(|z| z.name.as_str()).collect();
        assert_eq!(names, ["login", "upload", "admin", "api"]);
        assert_eq!(config.health_check.unhealthy_threshold, 3);
        assert_eq!(config.limits.max_request_line, 4094);
    }
}
