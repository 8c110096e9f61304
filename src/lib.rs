//! Cross-project IAM fan-out engine
//!
//! Provisions one service identity in an anchor project, replicates
//! project-bound custom roles into every sibling project of its enclosing
//! folder or organization, reconciles the role bindings there, and manages
//! the identity's keyed credential. The persisted integration record is the
//! only durable state between invocations.

pub mod bindings;
pub mod config;
pub mod engine;
pub mod keys;
pub mod provider;
pub mod provision;
pub mod record;
pub mod retry;
pub mod roles;
pub mod scopes;
pub mod teardown;

pub use config::IntegrationSpec;
pub use engine::IntegrationEngine;
pub use record::{IntegrationRecord, Phase};
