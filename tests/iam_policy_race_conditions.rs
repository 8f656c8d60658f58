//! IAM policy race condition tests
//!
//! Many threads mutating the same resource through one engine are serialized
//! by the per-resource mutex; writers on separate resources run in parallel.

mod common;

use common::{fast_retry, init_tracing, FakeUpdater};
use iam_reconcile::modifiers::{add_member, remove_member};
use iam_reconcile::{MutexKv, PolicyEngine};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

fn engine() -> Arc<PolicyEngine> {
    init_tracing();
    Arc::new(PolicyEngine::new(fast_retry()).with_mutexes(Arc::new(MutexKv::new())))
}

#[test]
fn test_same_resource_writers_never_conflict() {
    let engine = engine();
    let updater = Arc::new(FakeUpdater::new("race-same"));

    let handles: Vec<_> = (0..10)
        .map(|i| {
            let engine = Arc::clone(&engine);
            let updater = Arc::clone(&updater);
            thread::spawn(move || {
                let grant = add_member("roles/viewer", format!("user:u{}@x.com", i), None);
                engine.read_modify_write(&*updater, grant.as_ref()).unwrap()
            })
        })
        .collect();

    for h in handles {
        assert_eq!(h.join().unwrap().conflicts, 0);
    }
    assert_eq!(updater.members("roles/viewer").len(), 10);
    assert_eq!(updater.writes(), 10);
}

#[test]
fn test_grant_and_revoke_interleaving() {
    let engine = engine();
    let updater = Arc::new(FakeUpdater::new("race-revoke"));

    // Every thread grants then revokes its own member; the end state is empty
    let handles: Vec<_> = (0..6)
        .map(|i| {
            let engine = Arc::clone(&engine);
            let updater = Arc::clone(&updater);
            thread::spawn(move || {
                let member = format!("user:tmp{}@x.com", i);
                for _ in 0..3 {
                    thread::sleep(Duration::from_millis(rand::random::<u64>() % 3));
                    engine
                        .read_modify_write(&*updater, add_member("roles/editor", member.clone(), None).as_ref())
                        .unwrap();
                    engine
                        .read_modify_write(&*updater, remove_member("roles/editor", member.clone(), None).as_ref())
                        .unwrap();
                }
            })
        })
        .collect();

    for h in handles {
        h.join().unwrap();
    }
    assert!(updater.members("roles/editor").is_empty());
    assert!(updater.policy().bindings.is_empty());
}

#[test]
fn test_separate_resources_do_not_block_each_other() {
    let engine = engine();
    let updaters: Vec<_> = (0..4)
        .map(|i| Arc::new(FakeUpdater::new(&format!("race-parallel-{}", i))))
        .collect();
    let in_flight = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));

    let handles: Vec<_> = updaters
        .iter()
        .map(|updater| {
            let engine = Arc::clone(&engine);
            let updater = Arc::clone(updater);
            let in_flight = Arc::clone(&in_flight);
            let peak = Arc::clone(&peak);
            thread::spawn(move || {
                let observe = iam_reconcile::modifiers::modify_fn(move |policy| {
                    let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    thread::sleep(Duration::from_millis(20));
                    in_flight.fetch_sub(1, Ordering::SeqCst);
                    add_member("roles/viewer", "user:a@x.com", None)(policy)
                });
                engine.read_modify_write(&*updater, observe.as_ref()).unwrap();
            })
        })
        .collect();

    for h in handles {
        h.join().unwrap();
    }
    assert!(peak.load(Ordering::SeqCst) > 1);
    for updater in &updaters {
        assert_eq!(updater.members("roles/viewer"), vec!["user:a@x.com"]);
    }
}
