//! Keyed mutex registry
//!
//! Serializes policy read-modify-write cycles per resource within the process.
//! Entries are created on first use and never removed; the key space is the
//! set of resources actually touched.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::{Arc, OnceLock};
use tracing::debug;

/// Process-wide map from mutex key to lock
#[derive(Debug, Default)]
pub struct MutexKv {
    store: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl MutexKv {
    /// Create an empty registry
    pub fn new() -> Self {
        MutexKv {
            store: Mutex::new(HashMap::new()),
        }
    }

    /// Registry shared by every engine in the process
    pub fn global() -> Arc<MutexKv> {
        static GLOBAL: OnceLock<Arc<MutexKv>> = OnceLock::new();
        Arc::clone(GLOBAL.get_or_init(|| Arc::new(MutexKv::new())))
    }

    /// Lock for `key`, created lazily
    ///
    /// The registry lock is only held for the lookup; callers hold the
    /// returned lock for as long as they need exclusive access.
    pub fn get(&self, key: &str) -> Arc<Mutex<()>> {
        let mut store = self.store.lock();
        if let Some(lock) = store.get(key) {
            return Arc::clone(lock);
        }
        debug!("Creating mutex for key {:?}", key);
        let lock = Arc::new(Mutex::new(()));
        store.insert(key.to_string(), Arc::clone(&lock));
        lock
    }

    /// Run `f` while holding the lock for `key`
    pub fn with_lock<T>(&self, key: &str, f: impl FnOnce() -> T) -> T {
        let lock = self.get(key);
        debug!("Locking {:?}", key);
        let _guard = lock.lock();
        let result = f();
        debug!("Unlocking {:?}", key);
        result
    }

    /// Number of keys seen so far
    pub fn len(&self) -> usize {
        self.store.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.store.lock().is_empty()
    }
}
