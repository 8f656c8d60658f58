//! Policy read-modify-write engine
//!
//! Runs the update protocol for one resource while holding its mutex:
//!
//! 1. Read the current policy (429s and empty answers back off and re-read).
//! 2. Apply the caller's modify-function in memory; an error aborts before
//!    any write.
//! 3. Write. A 429 backs off and restarts from the read. A 409 means another
//!    writer got in first: back off, re-read and re-apply the (idempotent)
//!    modify-function. Conflicts are bounded by cumulative backoff.
//! 4. Confirm propagation: re-read until re-applying the modify-function is
//!    a no-op. Failing to confirm within the attempt budget is logged, not
//!    returned, since the API already accepted the write.

use super::merge::{compare_audit_configs, compare_bindings};
use super::{Policy, ResourceIamUpdater};
use crate::config::RetryConfig;
use crate::error::{IamError, Result};
use crate::mutex::MutexKv;
use crate::retry::{retry, DEFAULT_RETRY_PREDICATES};
use std::fmt;
use std::sync::Arc;
use std::thread;
use tracing::{debug, info, warn};

/// Step of the read-modify-write protocol, used in log fields
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Reading,
    Modifying,
    Writing,
    ConflictBackoff,
    ConfirmingPropagation,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Reading => "reading",
            Phase::Modifying => "modifying",
            Phase::Writing => "writing",
            Phase::ConflictBackoff => "conflict-backoff",
            Phase::ConfirmingPropagation => "confirming-propagation",
        };
        f.write_str(name)
    }
}

/// Whether the written change was observed on a later read
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Propagation {
    Confirmed,
    #[default]
    Unconfirmed,
}

/// Outcome of a successful read-modify-write cycle
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriteReport {
    /// Policy reads, including propagation checks
    pub reads: u32,
    /// Write attempts
    pub writes: u32,
    /// 409 conflicts that restarted the cycle
    pub conflicts: u32,
    /// Quota errors (or empty reads) that were backed off
    pub quota_retries: u32,
    pub propagation: Propagation,
}

/// Reconciles IAM policies through [`ResourceIamUpdater`]s
#[derive(Debug, Clone)]
pub struct PolicyEngine {
    config: RetryConfig,
    mutexes: Arc<MutexKv>,
}

impl PolicyEngine {
    /// Create an engine using the process-wide mutex registry
    pub fn new(config: RetryConfig) -> Self {
        PolicyEngine {
            config,
            mutexes: MutexKv::global(),
        }
    }

    /// Create an engine with default budgets
    pub fn new_default() -> Self {
        Self::new(RetryConfig::default())
    }

    /// Use a private mutex registry instead of the process-wide one
    pub fn with_mutexes(mut self, mutexes: Arc<MutexKv>) -> Self {
        self.mutexes = mutexes;
        self
    }

    pub fn config(&self) -> &RetryConfig {
        &self.config
    }

    pub fn mutexes(&self) -> &Arc<MutexKv> {
        &self.mutexes
    }

    /// Read a resource's policy under its mutex, retrying transient errors
    /// up to the configured attempt budget
    pub fn read_with_retry(&self, updater: &dyn ResourceIamUpdater) -> Result<Policy> {
        let key = updater.mutex_key();
        self.mutexes
            .with_lock(&key, || self.read_with_retry_unlocked(updater))
    }

    fn read_with_retry_unlocked(&self, updater: &dyn ResourceIamUpdater) -> Result<Policy> {
        let resource = updater.describe_resource();
        debug!("Retrieving policy for {}", resource);
        let policy = retry(&self.config.read_policy(), DEFAULT_RETRY_PREDICATES, || {
            fetch(updater)
        })
        .map_err(|err| IamError::Read {
            resource: resource.clone(),
            source: Box::new(err),
        })?;
        debug!("Retrieved policy for {}: {:?}", resource, policy);
        Ok(policy)
    }

    /// Apply `modify` to the resource's policy and write it back
    ///
    /// `modify` must be idempotent; it may run several times against
    /// different base policies.
    pub fn read_modify_write<F>(
        &self,
        updater: &dyn ResourceIamUpdater,
        modify: &F,
    ) -> Result<WriteReport>
    where
        F: Fn(&mut Policy) -> Result<()> + ?Sized,
    {
        let key = updater.mutex_key();
        self.mutexes
            .with_lock(&key, || self.read_modify_write_unlocked(updater, modify))
    }

    fn read_modify_write_unlocked<F>(
        &self,
        updater: &dyn ResourceIamUpdater,
        modify: &F,
    ) -> Result<WriteReport>
    where
        F: Fn(&mut Policy) -> Result<()> + ?Sized,
    {
        let resource = updater.describe_resource();
        let mut report = WriteReport::default();
        let mut quota_backoff = self.config.quota_policy().backoff();
        let mut conflict_backoff = self.config.conflict_policy().backoff();

        loop {
            debug!(phase = %Phase::Reading, "Retrieving policy for {}", resource);
            report.reads += 1;
            let mut policy = match fetch(updater) {
                Ok(policy) => policy,
                Err(err) if is_read_backoff(&err) => {
                    report.quota_retries += 1;
                    match quota_backoff.next_delay() {
                        Some(delay) => {
                            debug!(
                                "{} while attempting to read policy for {}, waiting {:?} before attempting again",
                                err, resource, delay
                            );
                            thread::sleep(delay);
                            continue;
                        }
                        None => {
                            return Err(IamError::Read {
                                resource,
                                source: Box::new(err),
                            })
                        }
                    }
                }
                Err(err) => {
                    return Err(IamError::Read {
                        resource,
                        source: Box::new(err),
                    })
                }
            };
            debug!("Retrieved policy for {}: {:?}", resource, policy);

            debug!(phase = %Phase::Modifying, "Modifying policy for {}", resource);
            let base_etag = policy.etag.clone();
            modify(&mut policy)?;

            debug!(phase = %Phase::Writing, "Setting policy for {} to {:?}", resource, policy);
            report.writes += 1;
            let err = match updater.set_resource_iam_policy(&policy) {
                Ok(()) => {
                    let propagation = self.confirm_propagation(updater, modify, &mut report)?;
                    report.propagation = propagation;
                    info!("Set policy for {}", resource);
                    return Ok(report);
                }
                Err(err) => err,
            };

            if err.is_quota() {
                report.quota_retries += 1;
                if let Some(delay) = quota_backoff.next_delay() {
                    debug!(
                        "{} while setting policy for {}, waiting {:?} before reading again",
                        err, resource, delay
                    );
                    thread::sleep(delay);
                    continue;
                }
                return Err(IamError::Apply {
                    resource,
                    source: Box::new(err),
                });
            }

            if err.is_conflict() {
                report.conflicts += 1;
                match conflict_backoff.next_delay() {
                    Some(delay) => {
                        debug!(
                            phase = %Phase::ConflictBackoff,
                            "Concurrent policy changes, restarting read-modify-write for {} after {:?}",
                            resource, delay
                        );
                        thread::sleep(delay);
                        continue;
                    }
                    None => {
                        return Err(IamError::TooManyConflicts {
                            resource,
                            source: Box::new(err),
                        })
                    }
                }
            }

            // A member naming a service account deleted out of band. If the
            // policy moved on meanwhile, there is newer state to apply.
            if err.is_service_account_not_found() {
                report.reads += 1;
                match self.read_with_retry_unlocked(updater) {
                    Ok(current) if current.etag != base_etag => {
                        if let Some(delay) = conflict_backoff.next_delay() {
                            debug!(
                                "Current and old etag did not match for {}, retrying after {:?}",
                                resource, delay
                            );
                            thread::sleep(delay);
                            continue;
                        }
                    }
                    Ok(_) => debug!("Current and old etag matched for {}, not retrying", resource),
                    Err(read_err) => {
                        debug!("Error checking etag for policy {}: {}", resource, read_err)
                    }
                }
            }

            debug!("Not retrying IAM policy for {}: {}", resource, err);
            return Err(IamError::Apply {
                resource,
                source: Box::new(err),
            });
        }
    }

    /// Re-read until the change is visible; see the module docs
    fn confirm_propagation<F>(
        &self,
        updater: &dyn ResourceIamUpdater,
        modify: &F,
        report: &mut WriteReport,
    ) -> Result<Propagation>
    where
        F: Fn(&mut Policy) -> Result<()> + ?Sized,
    {
        let resource = updater.describe_resource();
        let mut backoff = self.config.propagation_policy().backoff();
        let mut mismatches = 0;

        while mismatches < self.config.confirm_attempts {
            let Some(delay) = backoff.next_delay() else {
                return Err(IamError::PropagationTimeout { resource });
            };
            thread::sleep(delay);

            debug!(phase = %Phase::ConfirmingPropagation, "Retrieving policy for {}", resource);
            report.reads += 1;
            let fresh = match fetch(updater) {
                Ok(policy) => policy,
                Err(err) if is_read_backoff(&err) => {
                    report.quota_retries += 1;
                    debug!("{} while confirming policy for {}, backing off", err, resource);
                    continue;
                }
                Err(err) => {
                    return Err(IamError::Read {
                        resource,
                        source: Box::new(err),
                    })
                }
            };

            // Other writers may have changed the policy since; all that
            // matters is that our change is part of it.
            let mut reapplied = fresh.clone();
            modify(&mut reapplied)?;
            if is_reflected(&reapplied, &fresh) {
                debug!("Confirmed policy propagation for {}", resource);
                return Ok(Propagation::Confirmed);
            }

            mismatches += 1;
            debug!(
                "Policy for {} does not reflect the change yet ({}/{})",
                resource, mismatches, self.config.confirm_attempts
            );
        }

        warn!(
            "Could not confirm propagation of IAM policy for {} after {} reads; the write was accepted",
            resource, mismatches
        );
        Ok(Propagation::Unconfirmed)
    }
}

impl Default for PolicyEngine {
    fn default() -> Self {
        Self::new_default()
    }
}

fn fetch(updater: &dyn ResourceIamUpdater) -> Result<Policy> {
    updater
        .get_resource_iam_policy()?
        .ok_or_else(|| IamError::EmptyPolicy(updater.describe_resource()))
}

/// Re-applying the change left the bindings and audit configs as read
///
/// The version is not compared: APIs report version 1 for policies without
/// conditions even after a version 3 write.
fn is_reflected(reapplied: &Policy, fresh: &Policy) -> bool {
    compare_bindings(&reapplied.bindings, &fresh.bindings)
        && compare_audit_configs(&reapplied.audit_configs, &fresh.audit_configs)
}

/// Read failures that are waited out rather than surfaced
fn is_read_backoff(err: &IamError) -> bool {
    err.is_quota() || matches!(err, IamError::EmptyPolicy(_))
}
