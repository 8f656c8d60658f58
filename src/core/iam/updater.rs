//! Per-resource IAM transport
//!
//! Every IAM-capable resource type (project, service account, topic, crypto
//! key, ...) supplies an implementation that translates the generic
//! [`Policy`] into its API-specific shape and back. The engine only ever
//! talks to this trait.

use super::Policy;
use crate::error::Result;

/// IAM policy access for one concrete resource
///
/// Implementations keep track of the resource identifier and must be safe to
/// share between threads.
pub trait ResourceIamUpdater: Send + Sync {
    /// Fetch the existing IAM policy attached to the resource
    ///
    /// `Ok(None)` is an empty answer from the API; callers treat it as
    /// transient, not as "no policy".
    fn get_resource_iam_policy(&self) -> Result<Option<Policy>>;

    /// Replace the IAM policy attached to the resource
    ///
    /// The policy's etag is the base the write was computed from; a stale
    /// etag must surface as a 409 conflict.
    fn set_resource_iam_policy(&self, policy: &Policy) -> Result<()>;

    /// Key serializing read-modify-write cycles, e.g. `iam-project-{id}`
    fn mutex_key(&self) -> String;

    /// Unique resource identifier
    fn resource_id(&self) -> String;

    /// Description used in log and error messages; includes the identifier
    fn describe_resource(&self) -> String;
}

impl<U: ResourceIamUpdater + ?Sized> ResourceIamUpdater for std::sync::Arc<U> {
    fn get_resource_iam_policy(&self) -> Result<Option<Policy>> {
        (**self).get_resource_iam_policy()
    }

    fn set_resource_iam_policy(&self, policy: &Policy) -> Result<()> {
        (**self).set_resource_iam_policy(policy)
    }

    fn mutex_key(&self) -> String {
        (**self).mutex_key()
    }

    fn resource_id(&self) -> String {
        (**self).resource_id()
    }

    fn describe_resource(&self) -> String {
        (**self).describe_resource()
    }
}
