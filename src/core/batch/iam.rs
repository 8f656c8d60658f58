//! Batched IAM policy mutations
//!
//! Modify-functions for the same resource submitted within one batch window
//! are appended to a single list and applied in sequence by one
//! read-modify-write cycle: one read, one write and one propagation check for
//! the whole batch.

use super::{BatchRequest, CombineFn, RequestBatcher, SendFn};
use crate::config::BatchingConfig;
use crate::error::Result;
use crate::iam::modifiers::chain;
use crate::iam::{ModifyFn, PolicyEngine, ResourceIamUpdater, WriteReport};
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Key grouping requests that mutate the same resource's policy
pub fn batch_key(updater: &dyn ResourceIamUpdater) -> String {
    format!("{} modifyIamPolicy", updater.mutex_key())
}

/// Append the new request's modify-functions to the batch's
///
/// Duplicates are kept; applying an identical idempotent mutation twice is
/// harmless.
pub fn combine_modifiers(existing: &[ModifyFn], to_add: &[ModifyFn]) -> Result<Vec<ModifyFn>> {
    Ok(existing.iter().chain(to_add).cloned().collect())
}

/// Batches policy mutations per resource and runs them through a [`PolicyEngine`]
pub struct IamRequestBatcher {
    engine: Arc<PolicyEngine>,
    batcher: RequestBatcher<Vec<ModifyFn>, WriteReport>,
    timeout: Duration,
}

impl IamRequestBatcher {
    pub fn new(engine: Arc<PolicyEngine>, config: &BatchingConfig) -> Self {
        IamRequestBatcher {
            engine,
            batcher: RequestBatcher::new("IAM", config),
            timeout: config.request_timeout(),
        }
    }

    pub fn engine(&self) -> &Arc<PolicyEngine> {
        &self.engine
    }

    /// Apply `modify` to the updater's resource, sharing a read-modify-write
    /// cycle with any other request for the same resource in the same window
    ///
    /// Returns once the batch this request joined has been written, failed,
    /// or exceeded the request timeout.
    pub fn modify_iam_policy(
        &self,
        updater: Arc<dyn ResourceIamUpdater>,
        modify: ModifyFn,
        request_desc: &str,
    ) -> Result<WriteReport> {
        let key = batch_key(updater.as_ref());
        let resource_name = updater.resource_id();
        debug!("Submitting {:?} to batch {:?}", request_desc, key);

        let engine = Arc::clone(&self.engine);
        let send_f: SendFn<Vec<ModifyFn>, WriteReport> =
            Arc::new(move |_resource: &str, modifiers: &Vec<ModifyFn>| {
                let combined = chain(modifiers.clone());
                engine.read_modify_write(updater.as_ref(), combined.as_ref())
            });
        let combine_f: CombineFn<Vec<ModifyFn>> =
            Arc::new(|existing: &Vec<ModifyFn>, to_add: &Vec<ModifyFn>| {
                combine_modifiers(existing, to_add)
            });

        let request = BatchRequest {
            resource_name,
            body: vec![modify],
            combine_f,
            send_f,
            debug_id: request_desc.to_string(),
        };
        self.batcher
            .send_request_with_timeout(&key, request, self.timeout)
    }

    /// Send the open batch for the updater's resource immediately
    pub fn flush(&self, updater: &dyn ResourceIamUpdater) -> bool {
        self.batcher.flush(&batch_key(updater))
    }

    /// Number of batches waiting to be sent
    pub fn pending(&self) -> usize {
        self.batcher.pending()
    }

    /// Cancel open batches and refuse new requests
    pub fn stop(&self) {
        self.batcher.stop();
    }
}
