//! IAM policy reconciliation
//!
//! Provides concurrency-safe policy updates with:
//! - A generic policy model (bindings, audit configs, etag)
//! - Merge algorithms keyed by role+condition and service+log type
//! - Idempotent modify-functions
//! - A read-modify-write engine with conflict retry and propagation checks

mod engine;
pub mod merge;
pub mod modifiers;
mod policy;
mod updater;

pub use engine::{Phase, PolicyEngine, Propagation, WriteReport};
pub use merge::{merge_audit_configs, merge_bindings, overwrite_binding};
pub use modifiers::ModifyFn;
pub use policy::{AuditConfig, AuditLogConfig, Binding, Etag, Expr, Policy, IAM_POLICY_VERSION};
pub use updater::ResourceIamUpdater;
