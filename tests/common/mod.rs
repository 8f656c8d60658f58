//! Scripted in-memory IAM backend shared by the integration tests

#![allow(dead_code)]

use iam_reconcile::{merge_bindings, Binding, Etag, IamError, Policy, ResourceIamUpdater, Result, RetryConfig};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Once;
use std::time::Duration;

/// One injected failure, consumed by the next matching call
#[derive(Debug, Clone)]
pub enum Fault {
    Api(u16, String),
    Timeout,
    /// Read answers with no policy at all
    Empty,
}

impl Fault {
    pub fn quota() -> Self {
        Fault::Api(429, "Quota exceeded for quota metric 'Write requests'".to_string())
    }

    pub fn conflict() -> Self {
        Fault::Api(409, "There were concurrent policy changes".to_string())
    }

    pub fn service_account_not_found() -> Self {
        Fault::Api(
            400,
            "Service account svc@proj.iam.gserviceaccount.com does not exist.".to_string(),
        )
    }

    fn into_error(self) -> IamError {
        match self {
            Fault::Api(code, message) => IamError::api(code, message),
            Fault::Timeout => IamError::Timeout("context deadline exceeded".to_string()),
            Fault::Empty => IamError::EmptyPolicy("fake".to_string()),
        }
    }
}

#[derive(Debug)]
struct Backend {
    policy: Policy,
    generation: u64,
    /// Policy as it was before the last accepted write
    previous: Policy,
    lagging_reads: u32,
    /// Version stamped on every read, as APIs that downgrade it do
    reported_version: Option<i32>,
    read_faults: VecDeque<Fault>,
    write_faults: VecDeque<Fault>,
    /// Read faults armed by the next accepted write
    post_write_read_faults: VecDeque<Fault>,
    /// Changes made by some other writer right after a read is served
    interleaved: VecDeque<Binding>,
}

impl Backend {
    fn commit(&mut self, mut policy: Policy) {
        self.generation += 1;
        policy.etag = etag_for(self.generation);
        self.previous = std::mem::replace(&mut self.policy, policy);
        let armed = std::mem::take(&mut self.post_write_read_faults);
        self.read_faults.extend(armed);
    }
}

fn etag_for(generation: u64) -> Etag {
    Etag::new(generation.to_be_bytes().to_vec())
}

/// In-memory resource enforcing etag preconditions
///
/// A write whose etag does not match the stored one fails with 409; an
/// accepted write bumps the etag.
#[derive(Debug)]
pub struct FakeUpdater {
    id: String,
    backend: Mutex<Backend>,
    reads: AtomicU32,
    writes: AtomicU32,
}

impl FakeUpdater {
    pub fn new(id: &str) -> Self {
        Self::with_policy(id, Policy::new())
    }

    pub fn with_policy(id: &str, mut policy: Policy) -> Self {
        policy.etag = etag_for(1);
        FakeUpdater {
            id: id.to_string(),
            backend: Mutex::new(Backend {
                previous: policy.clone(),
                policy,
                generation: 1,
                lagging_reads: 0,
                reported_version: None,
                read_faults: VecDeque::new(),
                write_faults: VecDeque::new(),
                post_write_read_faults: VecDeque::new(),
                interleaved: VecDeque::new(),
            }),
            reads: AtomicU32::new(0),
            writes: AtomicU32::new(0),
        }
    }

    pub fn fail_read(&self, fault: Fault) -> &Self {
        self.backend.lock().read_faults.push_back(fault);
        self
    }

    pub fn fail_write(&self, fault: Fault) -> &Self {
        self.backend.lock().write_faults.push_back(fault);
        self
    }

    /// Fail the first `count` reads that follow the next accepted write
    pub fn fail_reads_after_write(&self, fault: Fault, count: usize) -> &Self {
        let mut backend = self.backend.lock();
        for _ in 0..count {
            backend.post_write_read_faults.push_back(fault.clone());
        }
        drop(backend);
        self
    }

    /// Serve the pre-write policy for the next `reads` reads after a write
    pub fn lag_reads(&self, reads: u32) -> &Self {
        self.backend.lock().lagging_reads = reads;
        self
    }

    /// Report `version` on every read regardless of what was written
    pub fn report_version(&self, version: i32) -> &Self {
        self.backend.lock().reported_version = Some(version);
        self
    }

    /// Have another writer add `binding` right after the next read
    pub fn interleave(&self, binding: Binding) -> &Self {
        self.backend.lock().interleaved.push_back(binding);
        self
    }

    pub fn policy(&self) -> Policy {
        self.backend.lock().policy.clone()
    }

    pub fn reads(&self) -> u32 {
        self.reads.load(Ordering::SeqCst)
    }

    pub fn writes(&self) -> u32 {
        self.writes.load(Ordering::SeqCst)
    }

    /// Members bound to `role` without a condition
    pub fn members(&self, role: &str) -> Vec<String> {
        self.policy()
            .bindings
            .iter()
            .filter(|b| b.role == role && b.condition.is_none())
            .flat_map(|b| b.members.clone())
            .collect()
    }
}

impl ResourceIamUpdater for FakeUpdater {
    fn get_resource_iam_policy(&self) -> Result<Option<Policy>> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        let mut backend = self.backend.lock();
        match backend.read_faults.pop_front() {
            Some(Fault::Empty) => return Ok(None),
            Some(fault) => return Err(fault.into_error()),
            None => {}
        }

        let mut served = if backend.lagging_reads > 0 {
            backend.lagging_reads -= 1;
            backend.previous.clone()
        } else {
            backend.policy.clone()
        };
        if let Some(version) = backend.reported_version {
            served.version = version;
        }

        if let Some(binding) = backend.interleaved.pop_front() {
            let mut changed = backend.policy.clone();
            changed.bindings.push(binding);
            changed.bindings = merge_bindings(&changed.bindings);
            backend.commit(changed);
        }
        Ok(Some(served))
    }

    fn set_resource_iam_policy(&self, policy: &Policy) -> Result<()> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        let mut backend = self.backend.lock();
        if let Some(fault) = backend.write_faults.pop_front() {
            return Err(fault.into_error());
        }
        if policy.etag != backend.policy.etag {
            return Err(IamError::api(
                409,
                "There were concurrent policy changes. Please retry the whole read-modify-write with exponential backoff.",
            ));
        }
        backend.commit(policy.clone());
        Ok(())
    }

    fn mutex_key(&self) -> String {
        format!("iam-fake-{}", self.id)
    }

    fn resource_id(&self) -> String {
        self.id.clone()
    }

    fn describe_resource(&self) -> String {
        format!("fake resource {:?}", self.id)
    }
}

/// Millisecond-scale budgets with the default ratios
pub fn fast_retry() -> RetryConfig {
    RetryConfig::default().with_initial_backoff(Duration::from_millis(1))
}

pub fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}
