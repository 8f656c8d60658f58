//! # iam-reconcile - IAM Policy Reconciliation Engine
//!
//! `iam-reconcile` applies caller-supplied mutations to the IAM policy of a
//! cloud resource, coping with concurrent writers, quota limits and
//! eventually-consistent propagation:
//!
//! - **Read-modify-write** under a per-resource mutex, with 409 conflict
//!   retry that re-reads and re-applies the (idempotent) mutation
//! - **Propagation checks** that re-read until the change is visible
//! - **Merge algorithms** for bindings and audit configs
//! - **Request batching** that coalesces concurrent mutations of the same
//!   resource into one cycle
//!
//! Resources plug in through [`ResourceIamUpdater`], which owns the
//! resource-specific transport.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use iam_reconcile::modifiers::add_member;
//! use iam_reconcile::{PolicyEngine, ResourceIamUpdater, Result};
//!
//! # fn run(updater: &dyn ResourceIamUpdater) -> Result<()> {
//! let engine = PolicyEngine::new_default();
//!
//! let grant = add_member("roles/viewer", "user:alice@example.com", None);
//! let report = engine.read_modify_write(updater, grant.as_ref())?;
//! println!("written after {} conflicts", report.conflicts);
//! # Ok(())
//! # }
//! ```
//!
//! ## Batching
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use iam_reconcile::modifiers::add_member;
//! use iam_reconcile::{IamConfig, IamRequestBatcher, PolicyEngine, ResourceIamUpdater, Result};
//!
//! # fn run(updater: Arc<dyn ResourceIamUpdater>) -> Result<()> {
//! let config = IamConfig::default();
//! let engine = Arc::new(PolicyEngine::new(config.retry.clone()));
//! let batcher = IamRequestBatcher::new(engine, &config.batching);
//!
//! // Requests for the same resource within the batch window share one write
//! batcher.modify_iam_policy(
//!     updater,
//!     add_member("roles/viewer", "user:alice@example.com", None),
//!     "grant alice viewer",
//! )?;
//! # Ok(())
//! # }
//! ```

pub mod core;

// Re-export core modules internally so crate:: paths in core still work
#[allow(unused_imports)]
pub(crate) use crate::core::{batch, config, error, iam, mutex, retry};

pub use crate::core::{
    batch::iam::{batch_key, IamRequestBatcher},
    batch::{BatchRequest, CombineFn, RequestBatcher, SendFn},
    config::{BatchingConfig, IamConfig, RetryConfig},
    error::{IamError, Result},
    iam::{
        merge, merge_audit_configs, merge_bindings, modifiers, overwrite_binding, AuditConfig,
        AuditLogConfig, Binding, Etag, Expr, ModifyFn, Phase, Policy, PolicyEngine, Propagation,
        ResourceIamUpdater, WriteReport, IAM_POLICY_VERSION,
    },
    mutex::MutexKv,
    retry::{Backoff, RetryPolicy},
};
