//! Request classification into rate-limit zones.
//!
//! # Responsibilities
//! - Compile zone rules from configuration
//! - Assign a method + normalized path to at most one zone
//!
//! # Design Decisions
//! - Immutable after construction (thread-safe without locks)
//! - Rules sorted once, most specific first; first match wins
//! - Unmatched requests fall to the default zone, or are not limited here

use axum::http::Method;

use crate::config::ZoneConfig;
use crate::routing::matcher::{PathMatch, ZoneRule};
use crate::security::zones::ZoneName;

/// Maps requests to zone names.
#[derive(Debug, Clone, Default)]
pub struct RequestClassifier {
    rules: Vec<ZoneRule>,
    default_zone: Option<ZoneName>,
}

impl RequestClassifier {
    /// Compile rules from validated zone configuration.
    pub fn from_config(zones: &[ZoneConfig], default_zone: Option<&str>) -> Self {
        let mut rules = Vec::new();
        for zone in zones {
            let name: ZoneName = zone.name.as_str().into();
            for rule in &zone.rules {
                let path = match (&rule.exact, &rule.prefix) {
                    (Some(exact), _) => PathMatch::Exact(exact.clone()),
                    (None, Some(prefix)) => PathMatch::Prefix(prefix.clone()),
                    (None, None) => continue,
                };
                let methods = rule
                    .methods
                    .iter()
                    .filter_map(|m| Method::from_bytes(m.to_ascii_uppercase().as_bytes()).ok())
                    .collect();
                rules.push(ZoneRule {
                    zone: name.clone(),
                    path,
                    methods,
                    order: rules.len(),
                });
            }
        }
        Self::new(rules, default_zone.map(Into::into))
    }

    /// Build a classifier from already compiled rules.
    pub fn new(mut rules: Vec<ZoneRule>, default_zone: Option<ZoneName>) -> Self {
        rules.sort_by(|a, b| a.precedence(b));
        Self { rules, default_zone }
    }

    /// Zone for this request, if any.
    pub fn classify(&self, method: &Method, path: &str) -> Option<&ZoneName> {
        self.rules
            .iter()
            .find(|rule| rule.matches(method, path))
            .map(|rule| &rule.zone)
            .or(self.default_zone.as_ref())
    }

    /// Rules in evaluation order.
    pub fn rules(&self) -> &[ZoneRule] {
        &self.rules
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::schema::default_zones;

    fn zone_of<'a>(c: &'a RequestClassifier, method: Method, path: &str) -> Option<&'a str> {
        c.classify(&method, path).map(|z| &**z)
    }

    #[test]
    fn default_zones_classify_deployment_paths() {
        let c = RequestClassifier::from_config(&default_zones(), None);

        assert_eq!(zone_of(&c, Method::POST, "/api/auth/admin-login/"), Some("login"));
        assert_eq!(zone_of(&c, Method::GET, "/api/auth/admin-login/"), Some("api"));
        assert_eq!(zone_of(&c, Method::POST, "/api/memory-photos/bulk_upload/"), Some("upload"));
        assert_eq!(zone_of(&c, Method::GET, "/admin/api/colleague/"), Some("admin"));
        assert_eq!(zone_of(&c, Method::GET, "/api/colleagues/"), Some("api"));
        assert_eq!(zone_of(&c, Method::GET, "/static/app.js"), None);
        assert_eq!(zone_of(&c, Method::GET, "/"), None);
    }

    #[test]
    fn default_zone_catches_unmatched() {
        let c = RequestClassifier::from_config(&default_zones(), Some("api"));
        assert_eq!(zone_of(&c, Method::GET, "/static/app.js"), Some("api"));
    }

    #[test]
    fn exact_rule_beats_earlier_prefix_rule() {
        let zones: Vec<ZoneConfig> = toml::from_str::<crate::config::ProxyConfig>(
            r#"
            [[zones]]
            name = "broad"
            rate = 1.0
            burst = 1
            [[zones.rules]]
            prefix = "/api/"

            [[zones]]
            name = "narrow"
            rate = 1.0
            burst = 1
            [[zones.rules]]
            exact = "/api/special/"
            "#,
        )
        .unwrap()
        .zones;

        let c = RequestClassifier::from_config(&zones, None);
        assert_eq!(zone_of(&c, Method::GET, "/api/special/"), Some("narrow"));
        assert_eq!(zone_of(&c, Method::GET, "/api/special/x"), Some("broad"));
    }
}
