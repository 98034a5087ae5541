//! Zone rule matching.
//!
//! # Responsibilities
//! - Match a normalized path exactly or by prefix (case-sensitive)
//! - Restrict a rule to a set of methods
//! - Define the precedence between rules
//!
//! # Design Decisions
//! - Exact beats prefix, longer prefix beats shorter prefix
//! - Ties keep configuration order
//! - No regex to guarantee predictable matching cost

use std::cmp::Ordering;

use axum::http::Method;

use crate::security::zones::ZoneName;

/// How a rule matches the request path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathMatch {
    Exact(String),
    Prefix(String),
}

impl PathMatch {
    pub fn matches(&self, path: &str) -> bool {
        match self {
            PathMatch::Exact(expected) => path == expected,
            PathMatch::Prefix(prefix) => path.starts_with(prefix.as_str()),
        }
    }

    /// Specificity rank: exact paths first, then prefixes by length.
    fn specificity(&self) -> (u8, usize) {
        match self {
            PathMatch::Exact(p) => (1, p.len()),
            PathMatch::Prefix(p) => (0, p.len()),
        }
    }
}

/// A compiled rule assigning matching requests to a zone.
#[derive(Debug, Clone)]
pub struct ZoneRule {
    pub zone: ZoneName,
    pub path: PathMatch,
    /// Empty means any method.
    pub methods: Vec<Method>,
    /// Position in the configuration, used to break ties.
    pub order: usize,
}

impl ZoneRule {
    pub fn matches(&self, method: &Method, path: &str) -> bool {
        (self.methods.is_empty() || self.methods.contains(method)) && self.path.matches(path)
    }

    /// Ordering used to sort rules most-specific first.
    pub fn precedence(&self, other: &Self) -> Ordering {
        other
            .path
            .specificity()
            .cmp(&self.path.specificity())
            // A method-restricted rule is more specific than an any-method rule.
            .then_with(|| self.methods.is_empty().cmp(&other.methods.is_empty()))
            .then_with(|| self.order.cmp(&other.order))
    }
}
