//! Rate-limit zones.
//!
//! A zone pairs a named policy (rate, burst, key source) with the limiter
//! holding its per-client buckets. The registry is immutable once built;
//! reload produces a new registry.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::config::{KeySource, ZoneConfig};
use crate::security::rate_limit::TokenBucketLimiter;

/// Zone identifier, cheap to clone into logs and errors.
pub type ZoneName = Arc<str>;

/// A named rate-limit policy and its limiter.
#[derive(Debug, Clone)]
pub struct Zone {
    pub name: ZoneName,
    /// Tokens per second.
    pub rate: f64,
    pub burst: u32,
    pub key: KeySource,
    pub limiter: Arc<TokenBucketLimiter>,
}

impl Zone {
    fn from_config(config: &ZoneConfig, rate: f64) -> Self {
        Self {
            name: config.name.as_str().into(),
            rate,
            burst: config.burst,
            key: config.key.clone(),
            limiter: Arc::new(TokenBucketLimiter::new(rate, config.burst)),
        }
    }

    fn same_policy(&self, rate: f64, burst: u32) -> bool {
        (self.rate - rate).abs() < f64::EPSILON && self.burst == burst
    }
}

/// Read-only view of a zone for the admin API.
#[derive(Debug, Clone, Serialize)]
pub struct ZoneSummary {
    pub name: String,
    pub rate_per_second: f64,
    pub burst: u32,
    pub tracked_keys: usize,
}

/// Zones by name.
#[derive(Debug, Clone, Default)]
pub struct ZoneRegistry {
    zones: HashMap<ZoneName, Zone>,
    /// Configuration order, for stable listings.
    order: Vec<ZoneName>,
}

impl ZoneRegistry {
    /// Build a registry with fresh limiters. Zones with an unusable rate are
    /// skipped; validation rejects those before this point.
    pub fn from_config(configs: &[ZoneConfig]) -> Self {
        Self::rebuild(configs, None)
    }

    /// Build a registry for new configuration, keeping the limiters (and so
    /// the accumulated tokens) of `previous` where possible.
    ///
    /// An unchanged zone shares its limiter with `previous`. A zone whose
    /// rate or burst changed gets a limiter carrying over its buckets.
    pub fn reload(&self, configs: &[ZoneConfig]) -> Self {
        Self::rebuild(configs, Some(self))
    }

    fn rebuild(configs: &[ZoneConfig], previous: Option<&Self>) -> Self {
        let mut registry = Self::default();
        for config in configs {
            let rate = match config.rate.per_second() {
                Ok(rate) => rate,
                Err(reason) => {
                    tracing::warn!(zone = %config.name, %reason, "Skipping zone with invalid rate");
                    continue;
                }
            };

            let zone = match previous.and_then(|p| p.get(&config.name)) {
                Some(old) if old.same_policy(rate, config.burst) => Zone {
                    key: config.key.clone(),
                    ..old.clone()
                },
                Some(old) => {
                    tracing::info!(
                        zone = %config.name,
                        old_rate = old.rate,
                        new_rate = rate,
                        old_burst = old.burst,
                        new_burst = config.burst,
                        "Zone policy changed"
                    );
                    Zone {
                        limiter: Arc::new(old.limiter.reconfigured(rate, config.burst)),
                        ..Zone::from_config(config, rate)
                    }
                }
                None => Zone::from_config(config, rate),
            };

            registry.order.push(zone.name.clone());
            registry.zones.insert(zone.name.clone(), zone);
        }
        registry
    }

    pub fn get(&self, name: &str) -> Option<&Zone> {
        self.zones.get(name)
    }

    /// Zones in configuration order.
    pub fn iter(&self) -> impl Iterator<Item = &Zone> {
        self.order.iter().filter_map(|name| self.zones.get(name))
    }

    pub fn len(&self) -> usize {
        self.zones.len()
    }

    pub fn is_empty(&self) -> bool {
        self.zones.is_empty()
    }

    /// Evict idle, refilled buckets from every zone.
    pub fn evict_idle(&self, now: Instant, ttl: Duration) -> usize {
        self.iter()
            .map(|zone| zone.limiter.evict_idle(now, ttl))
            .sum()
    }

    pub fn summaries(&self) -> Vec<ZoneSummary> {
        self.iter()
            .map(|zone| ZoneSummary {
                name: zone.name.to_string(),
                rate_per_second: zone.rate,
                burst: zone.burst,
                tracked_keys: zone.limiter.tracked_keys(),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::schema::default_zones;
    use crate::config::RateSpec;

    #[test]
    fn builds_default_zones_in_order() {
        let registry = ZoneRegistry::from_config(&default_zones());
        let names: Vec<_> = registry.iter().map(|z| z.name.to_string()).collect();
        assert_eq!(names, ["login", "upload", "admin", "api"]);

        let login = registry.get("login").unwrap();
        assert_eq!(login.burst, 2);
        assert!((login.rate - 5.0 / 60.0).abs() < 1e-12);
    }

    #[test]
    fn reload_shares_unchanged_limiters() {
        let registry = ZoneRegistry::from_config(&default_zones());
        let mut changed = default_zones();
        changed[3].rate = RateSpec::PerSecond(50.0);

        let next = registry.reload(&changed);

        assert!(Arc::ptr_eq(
            &registry.get("login").unwrap().limiter,
            &next.get("login").unwrap().limiter
        ));
        assert!(!Arc::ptr_eq(
            &registry.get("api").unwrap().limiter,
            &next.get("api").unwrap().limiter
        ));
        assert_eq!(next.get("api").unwrap().limiter.rate(), 50.0);
    }

    #[test]
    fn changed_zone_keeps_its_buckets() {
        let registry = ZoneRegistry::from_config(&default_zones());
        let now = Instant::now();
        let api = &registry.get("api").unwrap().limiter;
        for _ in 0..5 {
            assert!(api.check_at("10.0.0.1", now).is_allowed());
        }

        let mut changed = default_zones();
        changed[3].rate = RateSpec::PerSecond(1.0);
        let next = registry.reload(&changed);

        let tokens = next.get("api").unwrap().limiter.tokens("10.0.0.1").unwrap();
        assert!((tokens - 15.0).abs() < 1e-9);
    }

    #[test]
    fn removed_zone_disappears() {
        let registry = ZoneRegistry::from_config(&default_zones());
        let next = registry.reload(&default_zones()[..2]);
        assert_eq!(next.len(), 2);
        assert!(next.get("api").is_none());
    }
}
