//! Request batching
//!
//! Coalesces requests that share a batch key into a single call. The first
//! request for a key opens a batch and starts its timer; requests arriving
//! before the timer fires are folded into the batch body with the batch's
//! combine function. When the batch closes (timer or explicit flush) the send
//! function runs exactly once with the combined body, and every subscriber
//! receives the same response.
//!
//! If a combined send fails and more than one request took part, each
//! request is retried once on its own so one bad request cannot fail the
//! others.

pub mod iam;

use crate::config::BatchingConfig;
use crate::error::{IamError, Result};
use crossbeam::channel::{self, select, Receiver, RecvTimeoutError, Sender};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Folds a new request body into an open batch's body
pub type CombineFn<T> = Arc<dyn Fn(&T, &T) -> Result<T> + Send + Sync>;

/// Executes a (possibly combined) body against a resource
pub type SendFn<T, R> = Arc<dyn Fn(&str, &T) -> Result<R> + Send + Sync>;

/// One logical request submitted to a [`RequestBatcher`]
pub struct BatchRequest<T, R> {
    /// Resource the body is sent to
    pub resource_name: String,
    pub body: T,
    pub combine_f: CombineFn<T>,
    pub send_f: SendFn<T, R>,
    /// Shown in logs and errors for this request
    pub debug_id: String,
}

type BatchResponse<R> = std::result::Result<R, Arc<IamError>>;

struct Subscriber<T, R> {
    request: BatchRequest<T, R>,
    respond: Sender<BatchResponse<R>>,
}

struct StartedBatch<T, R> {
    id: u64,
    resource_name: String,
    body: T,
    combine_f: CombineFn<T>,
    send_f: SendFn<T, R>,
    debug_id: String,
    subscribers: Vec<Subscriber<T, R>>,
    /// Dropped with the batch, which wakes its timer thread
    _cancel: Sender<()>,
}

struct BatcherState<T, R> {
    batches: HashMap<String, StartedBatch<T, R>>,
    stopped: bool,
}

struct Shared<T, R> {
    debug_id: String,
    config: BatchingConfig,
    state: Mutex<BatcherState<T, R>>,
    next_id: AtomicU64,
}

/// Groups concurrent requests by batch key
pub struct RequestBatcher<T, R> {
    shared: Arc<Shared<T, R>>,
}

impl<T, R> RequestBatcher<T, R>
where
    T: Clone + Send + 'static,
    R: Clone + Send + 'static,
{
    pub fn new(debug_id: impl Into<String>, config: &BatchingConfig) -> Self {
        RequestBatcher {
            shared: Arc::new(Shared {
                debug_id: debug_id.into(),
                config: config.clone(),
                state: Mutex::new(BatcherState {
                    batches: HashMap::new(),
                    stopped: false,
                }),
                next_id: AtomicU64::new(0),
            }),
        }
    }

    /// Submit a request and block until its batch has been sent, or until
    /// `timeout` elapses
    ///
    /// With batching disabled the request is sent immediately on the calling
    /// thread.
    pub fn send_request_with_timeout(
        &self,
        batch_key: &str,
        request: BatchRequest<T, R>,
        timeout: Duration,
    ) -> Result<R> {
        if !self.shared.config.enable_batching {
            debug!(
                "Batching disabled for {:?}, sending request {:?} directly",
                self.shared.debug_id, request.debug_id
            );
            return (request.send_f)(&request.resource_name, &request.body);
        }

        let debug_id = request.debug_id.clone();
        let response = self.register(batch_key, request)?;
        match response.recv_timeout(timeout) {
            Ok(Ok(resp)) => Ok(resp),
            Ok(Err(err)) => Err(IamError::Batch {
                batch_key: batch_key.to_string(),
                debug_id,
                source: err,
            }),
            Err(RecvTimeoutError::Timeout) => Err(IamError::BatchTimeout {
                batch_key: batch_key.to_string(),
                timeout,
            }),
            Err(RecvTimeoutError::Disconnected) => {
                Err(IamError::BatcherStopped(self.shared.debug_id.clone()))
            }
        }
    }

    fn register(
        &self,
        batch_key: &str,
        request: BatchRequest<T, R>,
    ) -> Result<Receiver<BatchResponse<R>>> {
        let (respond, response) = channel::bounded(1);
        let mut state = self.shared.state.lock();
        if state.stopped {
            return Err(IamError::BatcherStopped(self.shared.debug_id.clone()));
        }

        if let Some(batch) = state.batches.get_mut(batch_key) {
            let body = (batch.combine_f)(&batch.body, &request.body).map_err(|err| {
                IamError::Combine {
                    batch_key: batch_key.to_string(),
                    debug_id: request.debug_id.clone(),
                    source: Box::new(err),
                }
            })?;
            batch.body = body;
            debug!(
                "Added request {:?} to batch {:?} ({} requests)",
                request.debug_id,
                batch_key,
                batch.subscribers.len() + 1
            );
            batch.subscribers.push(Subscriber { request, respond });
            return Ok(response);
        }

        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        debug!(
            "Starting batch {:?} with request {:?}, sending after {:?}",
            batch_key,
            request.debug_id,
            self.shared.config.send_after()
        );
        let (cancel, cancelled) = channel::bounded(0);
        let batch = StartedBatch {
            id,
            resource_name: request.resource_name.clone(),
            body: request.body.clone(),
            combine_f: Arc::clone(&request.combine_f),
            send_f: Arc::clone(&request.send_f),
            debug_id: format!("Combined batch for started batch {:?}", batch_key),
            subscribers: vec![Subscriber { request, respond }],
            _cancel: cancel,
        };
        state.batches.insert(batch_key.to_string(), batch);
        drop(state);

        if let Err(err) = self.start_timer(batch_key, id, cancelled) {
            self.shared.pop_batch(batch_key, Some(id));
            return Err(err.into());
        }
        Ok(response)
    }

    /// Send the batch once its window closes, unless it is flushed or
    /// cancelled first
    fn start_timer(&self, batch_key: &str, id: u64, cancelled: Receiver<()>) -> std::io::Result<()> {
        let shared = Arc::clone(&self.shared);
        let batch_key = batch_key.to_string();
        let window = channel::after(shared.config.send_after());
        thread::Builder::new()
            .name(format!("batch-timer-{}", id))
            .spawn(move || {
                select! {
                    recv(cancelled) -> _ => return,
                    recv(window) -> _ => {}
                }
                if let Some(batch) = shared.pop_batch(&batch_key, Some(id)) {
                    shared.send_batch_with_single_retry(&batch_key, batch);
                }
            })
            .map(|_| ())
    }

    /// Close and send the open batch for `batch_key` now, on this thread
    ///
    /// Returns false if no batch was open.
    pub fn flush(&self, batch_key: &str) -> bool {
        match self.shared.pop_batch(batch_key, None) {
            Some(batch) => {
                debug!("Flushing batch {:?}", batch_key);
                self.shared.send_batch_with_single_retry(batch_key, batch);
                true
            }
            None => false,
        }
    }

    /// Number of batches waiting to be sent
    pub fn pending(&self) -> usize {
        self.shared.state.lock().batches.len()
    }

    /// Cancel every open batch and refuse new requests
    ///
    /// Waiting subscribers receive [`IamError::BatcherStopped`].
    pub fn stop(&self) {
        let mut state = self.shared.state.lock();
        if state.stopped {
            return;
        }
        info!("Stopping batcher {:?}", self.shared.debug_id);
        state.stopped = true;
        for (batch_key, batch) in state.batches.drain() {
            debug!(
                "Cancelling started batch {:?} with {} requests",
                batch_key,
                batch.subscribers.len()
            );
        }
    }
}

impl<T, R> Shared<T, R>
where
    R: Clone,
{
    /// Remove the batch for `batch_key`; with an id, only if it is still
    /// that batch
    fn pop_batch(&self, batch_key: &str, id: Option<u64>) -> Option<StartedBatch<T, R>> {
        let mut state = self.state.lock();
        let matches = match (state.batches.get(batch_key), id) {
            (Some(batch), Some(id)) => batch.id == id,
            (Some(_), None) => true,
            (None, _) => false,
        };
        if matches {
            state.batches.remove(batch_key)
        } else {
            None
        }
    }

    fn send_batch_with_single_retry(&self, batch_key: &str, batch: StartedBatch<T, R>) {
        let StartedBatch {
            resource_name,
            body,
            send_f,
            debug_id,
            subscribers,
            ..
        } = batch;

        debug!(
            "Sending {} for batch {:?} ({} requests)",
            debug_id,
            batch_key,
            subscribers.len()
        );
        let err = match send_f(&resource_name, &body) {
            Ok(resp) => {
                for sub in subscribers {
                    let _ = sub.respond.send(Ok(resp.clone()));
                }
                return;
            }
            Err(err) => err,
        };

        if subscribers.len() == 1 {
            let err = Arc::new(err);
            for sub in subscribers {
                let _ = sub.respond.send(Err(Arc::clone(&err)));
            }
            return;
        }

        warn!(
            "Error sending batch {:?}, retrying {} requests individually: {}",
            batch_key,
            subscribers.len(),
            err
        );
        for sub in subscribers {
            let request = &sub.request;
            debug!("Retrying request {:?} on its own", request.debug_id);
            let resp = (request.send_f)(&request.resource_name, &request.body).map_err(Arc::new);
            let _ = sub.respond.send(resp);
        }
    }
}

impl<T, R> Drop for RequestBatcher<T, R> {
    fn drop(&mut self) {
        let mut state = self.shared.state.lock();
        state.stopped = true;
        state.batches.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Instant;

    fn config(send_after_ms: u64) -> BatchingConfig {
        BatchingConfig::default().with_send_after(Duration::from_millis(send_after_ms))
    }

    fn append() -> CombineFn<Vec<u32>> {
        Arc::new(|a: &Vec<u32>, b: &Vec<u32>| {
            if b.contains(&0) {
                return Err(IamError::InvalidPolicy("zero cannot be batched".to_string()));
            }
            Ok(a.iter().chain(b.iter()).copied().collect())
        })
    }

    fn summing(sends: Arc<AtomicUsize>) -> SendFn<Vec<u32>, u32> {
        Arc::new(move |_resource: &str, body: &Vec<u32>| {
            sends.fetch_add(1, Ordering::SeqCst);
            Ok(body.iter().sum())
        })
    }

    fn request(body: Vec<u32>, send_f: SendFn<Vec<u32>, u32>) -> BatchRequest<Vec<u32>, u32> {
        BatchRequest {
            resource_name: "projects/p".to_string(),
            body,
            combine_f: append(),
            send_f,
            debug_id: "test request".to_string(),
        }
    }

    fn wait_for_pending(batcher: &RequestBatcher<Vec<u32>, u32>, n: usize) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while batcher.pending() < n && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(1));
        }
    }

    #[test]
    fn test_concurrent_requests_share_one_send() {
        let batcher = Arc::new(RequestBatcher::new("test", &config(100)));
        let sends = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (1..=4)
            .map(|n| {
                let batcher = Arc::clone(&batcher);
                let send_f = summing(Arc::clone(&sends));
                thread::spawn(move || {
                    batcher.send_request_with_timeout(
                        "key",
                        request(vec![n], send_f),
                        Duration::from_secs(10),
                    )
                })
            })
            .collect();

        for h in handles {
            assert_eq!(h.join().unwrap().unwrap(), 10);
        }
        assert_eq!(sends.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_different_keys_are_separate_batches() {
        let batcher = Arc::new(RequestBatcher::new("test", &config(50)));
        let sends = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = ["a", "b"]
            .into_iter()
            .map(|key| {
                let batcher = Arc::clone(&batcher);
                let send_f = summing(Arc::clone(&sends));
                thread::spawn(move || {
                    batcher.send_request_with_timeout(key, request(vec![5], send_f), Duration::from_secs(10))
                })
            })
            .collect();

        for h in handles {
            assert_eq!(h.join().unwrap().unwrap(), 5);
        }
        assert_eq!(sends.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_disabled_batching_sends_directly() {
        let batcher = RequestBatcher::new("test", &BatchingConfig::disabled());
        let sends = Arc::new(AtomicUsize::new(0));

        for n in 1..=3 {
            let resp = batcher
                .send_request_with_timeout("key", request(vec![n], summing(Arc::clone(&sends))), Duration::from_secs(1))
                .unwrap();
            assert_eq!(resp, n);
        }
        assert_eq!(sends.load(Ordering::SeqCst), 3);
        assert_eq!(batcher.pending(), 0);
    }

    #[test]
    fn test_timeout() {
        let batcher = RequestBatcher::new("test", &config(10));
        let slow: SendFn<Vec<u32>, u32> = Arc::new(|_resource: &str, _body: &Vec<u32>| {
            thread::sleep(Duration::from_millis(300));
            Ok(0)
        });

        let err = batcher
            .send_request_with_timeout("key", request(vec![1], slow), Duration::from_millis(50))
            .unwrap_err();
        assert!(matches!(err, IamError::BatchTimeout { .. }));
    }

    #[test]
    fn test_failed_batch_retries_individually() {
        let batcher = Arc::new(RequestBatcher::new("test", &config(100)));
        let sends = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = [1u32, 7]
            .into_iter()
            .map(|n| {
                let batcher = Arc::clone(&batcher);
                let sends = Arc::clone(&sends);
                // Combined bodies fail, and so does any body containing 7
                let send_f: SendFn<Vec<u32>, u32> = Arc::new(move |_resource: &str, body: &Vec<u32>| {
                    sends.fetch_add(1, Ordering::SeqCst);
                    if body.len() > 1 || body.contains(&7) {
                        return Err(IamError::api(400, "bad body"));
                    }
                    Ok(body[0])
                });
                thread::spawn(move || {
                    batcher.send_request_with_timeout("key", request(vec![n], send_f), Duration::from_secs(10))
                })
            })
            .collect();

        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        let ok: Vec<_> = results.iter().filter_map(|r| r.as_ref().ok()).collect();
        assert_eq!(ok, vec![&1]);

        let err = results.into_iter().find_map(|r| r.err()).unwrap();
        assert!(matches!(err, IamError::Batch { .. }));
        assert_eq!(err.code(), Some(400));

        // one combined send plus one retry per request
        assert_eq!(sends.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_combine_failure_only_affects_new_request() {
        let batcher = Arc::new(RequestBatcher::new("test", &config(10_000)));
        let sends = Arc::new(AtomicUsize::new(0));

        let first = {
            let batcher = Arc::clone(&batcher);
            let send_f = summing(Arc::clone(&sends));
            thread::spawn(move || {
                batcher.send_request_with_timeout("key", request(vec![3], send_f), Duration::from_secs(10))
            })
        };
        wait_for_pending(&batcher, 1);

        let err = batcher
            .send_request_with_timeout("key", request(vec![0], summing(Arc::clone(&sends))), Duration::from_secs(10))
            .unwrap_err();
        assert!(matches!(err, IamError::Combine { .. }));

        assert!(batcher.flush("key"));
        assert_eq!(first.join().unwrap().unwrap(), 3);
        assert!(!batcher.flush("key"));
    }

    #[test]
    fn test_stop_cancels_waiting_requests() {
        let batcher = Arc::new(RequestBatcher::new("test", &config(10_000)));
        let sends = Arc::new(AtomicUsize::new(0));

        let waiting = {
            let batcher = Arc::clone(&batcher);
            let send_f = summing(Arc::clone(&sends));
            thread::spawn(move || {
                batcher.send_request_with_timeout("key", request(vec![1], send_f), Duration::from_secs(10))
            })
        };
        wait_for_pending(&batcher, 1);

        batcher.stop();
        assert!(matches!(waiting.join().unwrap().unwrap_err(), IamError::BatcherStopped(_)));
        assert_eq!(sends.load(Ordering::SeqCst), 0);

        let err = batcher
            .send_request_with_timeout("key", request(vec![1], summing(sends)), Duration::from_secs(1))
            .unwrap_err();
        assert!(matches!(err, IamError::BatcherStopped(_)));
    }

    /// Timer threads hold a reference to the shared state until they exit
    fn wait_for_timers_to_exit(batcher: &RequestBatcher<Vec<u32>, u32>) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Arc::strong_count(&batcher.shared) > 1 {
            if Instant::now() >= deadline {
                return false;
            }
            thread::sleep(Duration::from_millis(1));
        }
        true
    }

    #[test]
    fn test_flush_releases_timer_thread() {
        let batcher = Arc::new(RequestBatcher::new("test", &config(600_000)));
        let sends = Arc::new(AtomicUsize::new(0));

        let waiting = {
            let batcher = Arc::clone(&batcher);
            let send_f = summing(Arc::clone(&sends));
            thread::spawn(move || {
                batcher.send_request_with_timeout("key", request(vec![2], send_f), Duration::from_secs(10))
            })
        };
        wait_for_pending(&batcher, 1);

        assert!(batcher.flush("key"));
        assert_eq!(waiting.join().unwrap().unwrap(), 2);
        assert!(wait_for_timers_to_exit(&batcher));
        assert_eq!(sends.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_stop_releases_timer_threads() {
        let batcher = Arc::new(RequestBatcher::new("test", &config(600_000)));
        let sends = Arc::new(AtomicUsize::new(0));

        let waiters: Vec<_> = ["a", "b"]
            .into_iter()
            .map(|key| {
                let batcher = Arc::clone(&batcher);
                let send_f = summing(Arc::clone(&sends));
                thread::spawn(move || {
                    batcher.send_request_with_timeout(key, request(vec![1], send_f), Duration::from_secs(10))
                })
            })
            .collect();
        wait_for_pending(&batcher, 2);

        batcher.stop();
        for waiter in waiters {
            assert!(matches!(waiter.join().unwrap().unwrap_err(), IamError::BatcherStopped(_)));
        }
        assert!(wait_for_timers_to_exit(&batcher));
        assert_eq!(sends.load(Ordering::SeqCst), 0);
    }
}
