//! Domain layer containing the event core's value types and rules.
//!
//! # Module Organization
//!
//! - `foundation` - Shared primitives (event model, ids, errors, timestamps)
//! - `delivery` - Pure retry and dead-letter decisions
//! - `schema` - Versioned schemas, compatibility rules, and the registry
//! - `outbox` - Outbox rows and their status lifecycle

pub mod delivery;
pub mod foundation;
pub mod outbox;
pub mod schema;
