//! Admission control: classify, then rate limit.
//!
//! # Responsibilities
//! - Hold the classifier and zone registry as one immutable snapshot
//! - Decide admit / deny for a request before it reaches the backend
//! - Swap the snapshot atomically on reload
//!
//! # Design Decisions
//! - `ArcSwap` snapshot: readers never see a classifier from one
//!   configuration paired with zones from another
//! - Client keys derived per zone, so a zone keyed by header does not
//!   share buckets with IP-keyed zones

use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use axum::http::{HeaderMap, Method};

use crate::config::{KeySource, ProxyConfig};
use crate::routing::RequestClassifier;
use crate::security::rate_limit::Decision;
use crate::security::zones::{ZoneName, ZoneRegistry, ZoneSummary};

/// Who is asking: the TCP peer plus request headers for key derivation.
#[derive(Debug, Clone, Copy)]
pub struct ClientIdentity<'a> {
    pub peer: IpAddr,
    pub headers: &'a HeaderMap,
}

impl<'a> ClientIdentity<'a> {
    pub fn new(peer: IpAddr, headers: &'a HeaderMap) -> Self {
        Self { peer, headers }
    }

    /// Bucket key for a zone keyed by `source`.
    pub fn key(&self, source: &KeySource) -> String {
        let from_header = match source {
            KeySource::RemoteIp => None,
            KeySource::ForwardedFor => self
                .headers
                .get("x-forwarded-for")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.split(',').next())
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map(ToOwned::to_owned),
            KeySource::Header(name) => self
                .headers
                .get(name.as_str())
                .and_then(|v| v.to_str().ok())
                .filter(|v| !v.is_empty())
                .map(|v| format!("{name}:{v}")),
        };
        from_header.unwrap_or_else(|| self.peer.to_string())
    }
}

/// Result of admission for one request.
#[derive(Debug, Clone, PartialEq)]
pub enum Admission {
    /// No zone applies; the request is not limited here.
    Unclassified,
    /// Admitted by the zone's limiter.
    Admitted { zone: ZoneName },
    /// The zone's bucket for this client is empty.
    Denied { zone: ZoneName, retry_after: Duration },
}

/// Immutable admission state built from one configuration.
#[derive(Debug, Default)]
pub struct AdmissionPolicy {
    pub classifier: RequestClassifier,
    pub zones: ZoneRegistry,
    pub enabled: bool,
    pub idle_ttl: Duration,
}

impl AdmissionPolicy {
    pub fn from_config(config: &ProxyConfig) -> Self {
        Self::build(config, ZoneRegistry::from_config(&config.zones))
    }

    /// A policy for `config` that keeps the buckets held by `self`.
    pub fn reload(&self, config: &ProxyConfig) -> Self {
        Self::build(config, self.zones.reload(&config.zones))
    }

    fn build(config: &ProxyConfig, zones: ZoneRegistry) -> Self {
        Self {
            classifier: RequestClassifier::from_config(
                &config.zones,
                config.rate_limit.default_zone.as_deref(),
            ),
            zones,
            enabled: config.rate_limit.enabled,
            idle_ttl: config.rate_limit.idle_ttl(),
        }
    }

    pub fn check(&self, method: &Method, path: &str, client: &ClientIdentity<'_>) -> Admission {
        self.check_at(method, path, client, Instant::now())
    }

    pub fn check_at(
        &self,
        method: &Method,
        path: &str,
        client: &ClientIdentity<'_>,
        now: Instant,
    ) -> Admission {
        if !self.enabled {
            return Admission::Unclassified;
        }
        let Some(zone_name) = self.classifier.classify(method, path) else {
            return Admission::Unclassified;
        };
        let Some(zone) = self.zones.get(zone_name) else {
            return Admission::Unclassified;
        };

        let key = client.key(&zone.key);
        match zone.limiter.check_at(&key, now) {
            Decision::Allowed { .. } => Admission::Admitted {
                zone: zone.name.clone(),
            },
            Decision::Denied { retry_after } => {
                tracing::debug!(zone = %zone.name, client = %key, ?retry_after, "Rate limited");
                Admission::Denied {
                    zone: zone.name.clone(),
                    retry_after,
                }
            }
        }
    }
}

/// Shared handle to the current admission policy.
#[derive(Debug)]
pub struct AdmissionControl {
    policy: ArcSwap<AdmissionPolicy>,
}

impl AdmissionControl {
    pub fn new(config: &ProxyConfig) -> Self {
        Self {
            policy: ArcSwap::from_pointee(AdmissionPolicy::from_config(config)),
        }
    }

    /// Current snapshot.
    pub fn policy(&self) -> Arc<AdmissionPolicy> {
        self.policy.load_full()
    }

    pub fn check(&self, method: &Method, path: &str, client: &ClientIdentity<'_>) -> Admission {
        self.policy.load().check(method, path, client)
    }

    /// Swap in a policy for `config`, carrying over bucket state.
    pub fn reload(&self, config: &ProxyConfig) {
        let next = self.policy.load().reload(config);
        tracing::info!(zones = next.zones.len(), "Admission policy reloaded");
        self.policy.store(Arc::new(next));
    }

    /// Evict idle buckets using the snapshot's TTL.
    pub fn evict_idle(&self, now: Instant) -> usize {
        let policy = self.policy.load();
        policy.zones.evict_idle(now, policy.idle_ttl)
    }

    pub fn zone_summaries(&self) -> Vec<ZoneSummary> {
        self.policy.load().zones.summaries()
    }
}
