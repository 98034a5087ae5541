//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Check referential integrity (default zone exists, rules are well formed)
//! - Validate value ranges (rate > 0, burst >= 1, thresholds ordered)
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: ProxyConfig → Result<(), Vec<ValidationError>>
//! - Runs before config is accepted into the system

use std::collections::HashSet;
use std::fmt;
use std::net::SocketAddr;

use axum::http::{HeaderValue, Method};

use crate::config::schema::ProxyConfig;

/// Smallest buffer hyper accepts for HTTP/1 connections.
pub const MIN_BUF_SIZE: usize = 8192;

/// A single semantic problem in the configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    pub field: String,
    pub message: String,
}

impl ValidationError {
    fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Check every semantic constraint and collect all violations.
pub fn validate_config(config: &ProxyConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if config.listener.bind_address.parse::<SocketAddr>().is_err() {
        errors.push(ValidationError::new(
            "listener.bind_address",
            format!("'{}' is not a socket address", config.listener.bind_address),
        ));
    }
    if let Some(tls) = &config.listener.tls {
        if tls.certificates.is_empty() {
            errors.push(ValidationError::new(
                "listener.tls.certificates",
                "at least one certificate is required",
            ));
        }
    }

    validate_zones(config, &mut errors);

    if config.backend.command.trim().is_empty() {
        errors.push(ValidationError::new("backend.command", "must not be empty"));
    }
    if config.backend.socket_path.as_os_str().is_empty() {
        errors.push(ValidationError::new("backend.socket_path", "must not be empty"));
    }
    if config.backend.socket_mode > 0o777 {
        errors.push(ValidationError::new(
            "backend.socket_mode",
            format!("{:o} is not a permission mode", config.backend.socket_mode),
        ));
    }
    if config.backend.socket_backlog == 0 {
        errors.push(ValidationError::new("backend.socket_backlog", "must be at least 1"));
    }

    let health = &config.health_check;
    if health.interval_ms == 0 {
        errors.push(ValidationError::new("health_check.interval_ms", "must be positive"));
    }
    if health.timeout_ms == 0 {
        errors.push(ValidationError::new("health_check.timeout_ms", "must be positive"));
    }
    if !health.path.starts_with('/') {
        errors.push(ValidationError::new("health_check.path", "must start with '/'"));
    }
    if health.unhealthy_threshold == 0 {
        errors.push(ValidationError::new(
            "health_check.unhealthy_threshold",
            "must be at least 1",
        ));
    }
    if health.failure_ceiling < health.unhealthy_threshold {
        errors.push(ValidationError::new(
            "health_check.failure_ceiling",
            "must not be lower than unhealthy_threshold",
        ));
    }

    let restart = &config.restart;
    if restart.base_delay_ms > restart.max_delay_ms {
        errors.push(ValidationError::new(
            "restart.base_delay_ms",
            "must not exceed restart.max_delay_ms",
        ));
    }
    if !restart.multiplier.is_finite() || restart.multiplier < 1.0 {
        errors.push(ValidationError::new("restart.multiplier", "must be >= 1.0"));
    }

    if config.timeouts.backend_response_secs == 0 || config.timeouts.request_secs == 0 {
        errors.push(ValidationError::new("timeouts", "request timeouts must be positive"));
    }
    if config.buffers.max_buf_size < MIN_BUF_SIZE {
        errors.push(ValidationError::new(
            "buffers.max_buf_size",
            format!("must be at least {MIN_BUF_SIZE}"),
        ));
    }

    if config.security.enable_headers {
        let headers = &config.security.headers;
        for (field, value) in [
            ("content_type_options", &headers.content_type_options),
            ("frame_options", &headers.frame_options),
            ("strict_transport_security", &headers.strict_transport_security),
            ("referrer_policy", &headers.referrer_policy),
            ("permissions_policy", &headers.permissions_policy),
            ("content_security_policy", &headers.content_security_policy),
        ] {
            if HeaderValue::from_str(value).is_err() {
                errors.push(ValidationError::new(
                    format!("security.headers.{field}"),
                    "is not a valid header value",
                ));
            }
        }
    }

    if config.admin.enabled && config.admin.bind_address.parse::<SocketAddr>().is_err() {
        errors.push(ValidationError::new(
            "admin.bind_address",
            format!("'{}' is not a socket address", config.admin.bind_address),
        ));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}

fn validate_zones(config: &ProxyConfig, errors: &mut Vec<ValidationError>) {
    let mut names = HashSet::new();

    for (i, zone) in config.zones.iter().enumerate() {
        let field = format!("zones[{i}]");
        if zone.name.trim().is_empty() {
            errors.push(ValidationError::new(format!("{field}.name"), "must not be empty"));
        } else if !names.insert(zone.name.as_str()) {
            errors.push(ValidationError::new(
                format!("{field}.name"),
                format!("duplicate zone '{}'", zone.name),
            ));
        }
        if let Err(message) = zone.rate.per_second() {
            errors.push(ValidationError::new(format!("{field}.rate"), message));
        }
        if zone.burst < 1 {
            errors.push(ValidationError::new(format!("{field}.burst"), "must be at least 1"));
        }

        for (j, rule) in zone.rules.iter().enumerate() {
            let rule_field = format!("{field}.rules[{j}]");
            match (&rule.exact, &rule.prefix) {
                (Some(path), None) | (None, Some(path)) => {
                    if !path.starts_with('/') {
                        errors.push(ValidationError::new(rule_field.clone(), "path must start with '/'"));
                    }
                }
                _ => errors.push(ValidationError::new(
                    rule_field.clone(),
                    "exactly one of 'exact' or 'prefix' is required",
                )),
            }
            for method in &rule.methods {
                if Method::from_bytes(method.to_ascii_uppercase().as_bytes()).is_err() {
                    errors.push(ValidationError::new(
                        format!("{rule_field}.methods"),
                        format!("'{method}' is not an HTTP method"),
                    ));
                }
            }
        }
    }

    if let Some(default_zone) = &config.rate_limit.default_zone {
        if !names.contains(default_zone.as_str()) {
            errors.push(ValidationError::new(
                "rate_limit.default_zone",
                format!("unknown zone '{default_zone}'"),
            ));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::schema::{RateSpec, RuleConfig, ZoneConfig};

    #[test]
    fn default_config_is_valid() {
        assert_eq!(validate_config(&ProxyConfig::default()), Ok(()));
    }

    #[test]
    fn vanishing_rate_is_rejected() {
        let mut config = ProxyConfig::default();
        config.zones[0].rate = RateSpec::PerSecond(1e-20);
        let errors = validate_config(&config).unwrap_err();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].field, "zones[0].rate");
    }

    #[test]
    fn collects_every_zone_error() {
        let mut config = ProxyConfig::default();
        config.zones.push(ZoneConfig {
            name: "login".into(),
            rate: RateSpec::PerSecond(0.0),
            burst: 0,
            key: Default::default(),
            rules: vec![RuleConfig {
                exact: Some("/a".into()),
                prefix: Some("/b".into()),
                methods: vec!["NOT A METHOD".into()],
            }],
        });
        config.rate_limit.default_zone = Some("missing".into());

        let errors = validate_config(&config).unwrap_err();
        let fields: Vec<_> = errors.iter().map(|e| e.field.as_str()).collect();
        assert!(fields.contains(&"zones[4].name"));
        assert!(fields.contains(&"zones[4].rate"));
        assert!(fields.contains(&"zones[4].burst"));
        assert!(fields.contains(&"zones[4].rules[0]"));
        assert!(fields.contains(&"zones[4].rules[0].methods"));
        assert!(fields.contains(&"rate_limit.default_zone"));
    }

    #[test]
    fn thresholds_must_be_ordered() {
        let mut config = ProxyConfig::default();
        config.health_check.unhealthy_threshold = 5;
        config.health_check.failure_ceiling = 2;
        config.restart.base_delay_ms = 10_000;
        config.restart.max_delay_ms = 1_000;
        config.buffers.max_buf_size = 1024;

        let errors = validate_config(&config).unwrap_err();
        assert_eq!(errors.len(), 3, "{errors:?}");
    }
}
