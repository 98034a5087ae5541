//! Request classification subsystem.
//!
//! # Data Flow
//! ```text
//! Incoming Request (method, normalized path)
//!     → classifier.rs (ordered rule lookup)
//!     → matcher.rs (evaluate path/method conditions)
//!     → Return: zone name or unclassified
//!
//! Rule Compilation (at load and reload):
//!     ZoneConfig[].rules
//!     → Sort by precedence (exact > longest prefix > config order)
//!     → Freeze as immutable RequestClassifier
//! ```
//!
//! # Design Decisions
//! - Rules compiled at load, immutable at runtime
//! - No regex in hot path (exact and prefix matching only)
//! - Deterministic: same input always matches same zone
//! - First match wins (ordered by precedence)

pub mod classifier;
pub mod matcher;

pub use classifier::RequestClassifier;
