//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! config file (TOML)
//!     → loader.rs (parse & deserialize)
//!     → validation.rs (semantic checks)
//!     → ProxyConfig (validated, immutable)
//!     → compiled into admission snapshot, supervisor policy, TLS config
//!
//! On reload signal (SIGHUP, admin API, watcher.rs):
//!     → loader.rs loads new config
//!     → validation.rs validates
//!     → lifecycle::reload swaps snapshots atomically
//! ```
//!
//! # Design Decisions
//! - Config is immutable once loaded; changes require full reload
//! - All fields have defaults to allow minimal configs
//! - Validation separates syntactic (serde) from semantic checks
//! - An invalid file never replaces a running configuration

pub mod loader;
pub mod schema;
pub mod validation;
pub mod watcher;

pub use loader::{load_config, parse_config, ConfigError};
pub use schema::{
    BackendConfig, BufferConfig, CertificateConfig, HealthCheckConfig, KeySource, LimitsConfig,
    ListenerConfig, ProxyConfig, RateLimitConfig, RateSpec, RestartConfig, RuleConfig,
    SecurityConfig, TimeoutConfig, TlsConfig, ZoneConfig,
};
