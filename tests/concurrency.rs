//! Coalescing of concurrent requests, cancellation and cycle detection.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::{Duration, Instant};

use memograph::{
    CancellationToken, ComputeError, ErrorKind, EvaluationListener, Evaluator, FunctionTag, Key,
    NodeState, RequestError, Value,
};
use parking_lot::Mutex;

const LEAF: FunctionTag = FunctionTag::new("leaf");
const ROOT: FunctionTag = FunctionTag::new("root");
const FAN: FunctionTag = FunctionTag::new("fan");
const SLOW: FunctionTag = FunctionTag::new("slow");
const INPUT: FunctionTag = FunctionTag::new("input");

// ============================================================================
// Coalescing
// ============================================================================

#[test]
fn test_concurrent_callers_share_one_evaluation() {
    let leaf_runs = Arc::new(AtomicU32::new(0));
    let evaluator = Evaluator::builder().worker_threads(4).build().unwrap();

    let counter = Arc::clone(&leaf_runs);
    evaluator.register_fn(LEAF, move |_key, _env| {
        counter.fetch_add(1, Ordering::SeqCst);
        thread::sleep(Duration::from_millis(50));
        Ok(Value::new(7u64))
    });
    evaluator.register_fn(ROOT, |_key, env| {
        let leaf = env.value(&Key::new(LEAF, ()))?;
        Ok(Value::new(*leaf.downcast_ref::<u64>().unwrap() + 1))
    });

    let callers = 8;
    let barrier = Arc::new(Barrier::new(callers));
    let results: Vec<Value> = thread::scope(|scope| {
        let handles: Vec<_> = (0..callers)
            .map(|_| {
                let evaluator = evaluator.clone();
                let barrier = Arc::clone(&barrier);
                scope.spawn(move || {
                    barrier.wait();
                    evaluator.evaluate_one(Key::new(ROOT, ())).unwrap()
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    assert_eq!(leaf_runs.load(Ordering::SeqCst), 1);
    assert!(results.iter().all(|v| *v == Value::new(8u64)));
}

#[test]
fn test_concurrent_callers_share_one_rebuild_of_a_dirty_key() {
    let leaf_runs = Arc::new(AtomicU32::new(0));
    let root_runs = Arc::new(AtomicU32::new(0));
    let evaluator = Evaluator::builder().worker_threads(4).build().unwrap();

    let counter = Arc::clone(&leaf_runs);
    evaluator.register_fn(LEAF, move |_key, env| {
        if env.restart_count() == 0 {
            counter.fetch_add(1, Ordering::SeqCst);
        }
        let n = env.value(&Key::new(INPUT, ()))?;
        thread::sleep(Duration::from_millis(50));
        Ok(Value::new(*n.downcast_ref::<u64>().unwrap() * 10))
    });
    let counter = Arc::clone(&root_runs);
    evaluator.register_fn(ROOT, move |_key, env| {
        if env.restart_count() == 0 {
            counter.fetch_add(1, Ordering::SeqCst);
        }
        let leaf = env.value(&Key::new(LEAF, ()))?;
        Ok(Value::new(*leaf.downcast_ref::<u64>().unwrap() + 1))
    });

    let root = Key::new(ROOT, ());
    evaluator.inject(Key::new(INPUT, ()), Value::new(1u64));
    assert_eq!(evaluator.evaluate_one(root.clone()).unwrap(), Value::new(11u64));

    evaluator.inject(Key::new(INPUT, ()), Value::new(2u64));
    assert_eq!(evaluator.graph().state(&root), Some(NodeState::Dirty));

    let callers = 8;
    let barrier = Arc::new(Barrier::new(callers));
    let results: Vec<Value> = thread::scope(|scope| {
        let handles: Vec<_> = (0..callers)
            .map(|_| {
                let evaluator = evaluator.clone();
                let barrier = Arc::clone(&barrier);
                let root = root.clone();
                scope.spawn(move || {
                    barrier.wait();
                    evaluator.evaluate_one(root).unwrap()
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    assert!(results.iter().all(|v| *v == Value::new(21u64)));
    assert_eq!(leaf_runs.load(Ordering::SeqCst), 2);
    assert_eq!(root_runs.load(Ordering::SeqCst), 2);
}

#[test]
fn test_shared_dependency_of_many_parents() {
    let leaf_runs = Arc::new(AtomicU32::new(0));
    let fan_runs = Arc::new(AtomicU32::new(0));
    let evaluator = Evaluator::builder().worker_threads(4).build().unwrap();

    let counter = Arc::clone(&leaf_runs);
    evaluator.register_fn(LEAF, move |_key, _env| {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(Value::new(1u64))
    });
    let counter = Arc::clone(&fan_runs);
    evaluator.register_fn(FAN, move |key, env| {
        let shared = env.value(&Key::new(LEAF, ()))?;
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(Value::new(*shared.downcast_ref::<u64>().unwrap() + key.argument::<u64>().unwrap()))
    });
    evaluator.register_fn(ROOT, |_key, env| {
        let keys: Vec<Key> = (0..32u64).map(|i| Key::new(FAN, i)).collect();
        let values = env.get_values(&keys)?;
        let Some(values) = values.values() else {
            return Err(ComputeError::Incomplete);
        };
        let total: u64 = values.iter().map(|v| *v.downcast_ref::<u64>().unwrap()).sum();
        Ok(Value::new(total))
    });

    let total = evaluator.evaluate_one(Key::new(ROOT, ())).unwrap();
    assert_eq!(total, Value::new((0..32u64).map(|i| i + 1).sum::<u64>()));
    assert_eq!(leaf_runs.load(Ordering::SeqCst), 1);
    assert_eq!(fan_runs.load(Ordering::SeqCst), 32);
    evaluator.graph().check_consistency().unwrap();
}

#[test]
fn test_deep_chain_does_not_overflow() {
    let evaluator = Evaluator::builder().worker_threads(2).build().unwrap();
    evaluator.register_fn(LEAF, |key, env| {
        let depth = *key.argument::<u32>().unwrap();
        if depth == 0 {
            return Ok(Value::new(0u32));
        }
        let below = env.value(&Key::new(LEAF, depth - 1))?;
        Ok(Value::new(*below.downcast_ref::<u32>().unwrap() + 1))
    });
    let top = Key::new(LEAF, 2_000u32);
    assert_eq!(evaluator.evaluate_one(top).unwrap(), Value::new(2_000u32));
}

// ============================================================================
// Cancellation
// ============================================================================

/// Blocks until the evaluation is cancelled, unless `release` is set.
fn register_slow(evaluator: &Evaluator, release: Arc<AtomicBool>, started: mpsc::Sender<()>) {
    let started = Mutex::new(started);
    evaluator.register_fn(SLOW, move |_key, env| {
        if release.load(Ordering::SeqCst) {
            return Ok(Value::new("done"));
        }
        let _ = started.lock().send(());
        env.block_on(std::future::pending::<()>())?;
        unreachable!("pending future completed")
    });
}

#[test]
fn test_cancel_with_token() {
    let evaluator = Evaluator::builder().worker_threads(2).build().unwrap();
    let release = Arc::new(AtomicBool::new(false));
    let (tx, rx) = mpsc::channel();
    register_slow(&evaluator, Arc::clone(&release), tx);

    let slow = Key::new(SLOW, ());
    let token = CancellationToken::new();
    let worker = {
        let evaluator = evaluator.clone();
        let token = token.clone();
        let slow = slow.clone();
        thread::spawn(move || evaluator.evaluate_with_cancellation([slow], &token))
    };
    rx.recv_timeout(Duration::from_secs(10)).unwrap();
    token.cancel();

    let result = worker.join().unwrap();
    assert!(result.is_cancelled());
    assert_eq!(result.incomplete(), &[slow.clone()]);
    assert!(result.get(&slow).is_none());

    // Nothing was committed; a later evaluation builds the node afresh.
    release.store(true, Ordering::SeqCst);
    assert_eq!(evaluator.evaluate_one(slow.clone()).unwrap(), Value::new("done"));
    assert_eq!(evaluator.graph().state(&slow), Some(NodeState::Done));
}

#[test]
fn test_evaluator_cancel() {
    let evaluator = Evaluator::builder().worker_threads(2).build().unwrap();
    let release = Arc::new(AtomicBool::new(false));
    let (tx, rx) = mpsc::channel();
    register_slow(&evaluator, Arc::clone(&release), tx);
    evaluator.register_fn(ROOT, |_key, env| env.value(&Key::new(SLOW, ())));

    let root = Key::new(ROOT, ());
    let worker = {
        let evaluator = evaluator.clone();
        let root = root.clone();
        thread::spawn(move || evaluator.evaluate_one(root))
    };
    rx.recv_timeout(Duration::from_secs(10)).unwrap();
    evaluator.cancel();

    assert!(matches!(worker.join().unwrap(), Err(RequestError::Cancelled)));
    assert!(!evaluator.cancellation_token().is_cancelled());

    release.store(true, Ordering::SeqCst);
    assert_eq!(evaluator.evaluate_one(root).unwrap(), Value::new("done"));
}

#[test]
fn test_done_nodes_survive_cancellation() {
    let evaluator = Evaluator::builder().worker_threads(2).build().unwrap();
    let release = Arc::new(AtomicBool::new(false));
    let (tx, rx) = mpsc::channel();
    register_slow(&evaluator, Arc::clone(&release), tx);
    evaluator.register_fn(LEAF, |_key, _env| Ok(Value::new(1u8)));
    evaluator.register_fn(ROOT, |_key, env| {
        let leaf = env.value(&Key::new(LEAF, ()))?;
        env.value(&Key::new(SLOW, ()))?;
        Ok(leaf)
    });

    let token = CancellationToken::new();
    let worker = {
        let evaluator = evaluator.clone();
        let token = token.clone();
        thread::spawn(move || evaluator.evaluate_with_cancellation([Key::new(ROOT, ())], &token))
    };
    rx.recv_timeout(Duration::from_secs(10)).unwrap();
    token.cancel();
    assert!(worker.join().unwrap().is_cancelled());

    assert_eq!(evaluator.graph().state(&Key::new(LEAF, ())), Some(NodeState::Done));
    assert_ne!(evaluator.graph().state(&Key::new(ROOT, ())), Some(NodeState::Done));
}

// ============================================================================
// Cycles
// ============================================================================

const PING: FunctionTag = FunctionTag::new("ping");
const PONG: FunctionTag = FunctionTag::new("pong");
const SELF: FunctionTag = FunctionTag::new("self");

#[derive(Default)]
struct CycleLog(Mutex<Vec<Vec<Key>>>);

impl EvaluationListener for CycleLog {
    fn on_cycle(&self, path: &[Key]) {
        self.0.lock().push(path.to_vec());
    }
}

fn register_ping_pong(evaluator: &Evaluator) {
    evaluator.register_fn(PING, |_key, env| env.value(&Key::new(PONG, ())));
    evaluator.register_fn(PONG, |_key, env| env.value(&Key::new(PING, ())));
}

#[test]
fn test_two_node_cycle_fails_both() {
    let log = Arc::new(CycleLog::default());
    let evaluator = Evaluator::builder()
        .worker_threads(2)
        .shared_listener(log.clone())
        .build()
        .unwrap();
    register_ping_pong(&evaluator);

    let ping = Key::new(PING, ());
    let pong = Key::new(PONG, ());
    let error = evaluator
        .evaluate_one(ping.clone())
        .unwrap_err()
        .evaluation_error()
        .cloned()
        .unwrap();
    assert!(error.is_cycle());
    assert_eq!(error.key(), &ping);
    assert_eq!(error.cycle_path().unwrap(), &[ping.clone(), pong.clone(), ping.clone()]);
    assert!(error.to_string().contains("ping(())"));
    assert!(error.to_string().contains("pong(())"));

    // The other member failed too, with the cycle seen from its side.
    let pong_error = evaluator.graph().get(&pong).unwrap().error.unwrap();
    assert_eq!(pong_error.cycle_path().unwrap(), &[pong.clone(), ping.clone(), pong]);
    assert_eq!(log.0.lock().len(), 1);

    // Cycle errors are cached like any other error.
    assert!(evaluator.evaluate_one(ping).is_err());
    assert_eq!(log.0.lock().len(), 1);
    evaluator.graph().check_consistency().unwrap();
}

#[test]
fn test_self_cycle() {
    let evaluator = Evaluator::builder().worker_threads(1).build().unwrap();
    evaluator.register_fn(SELF, |key, env| env.value(key));

    let key = Key::new(SELF, 1u8);
    let result = evaluator.evaluate([key.clone()]);
    let error = result.error(&key).unwrap();
    assert!(matches!(error.kind(), ErrorKind::Cycle { path } if path == &[key.clone(), key.clone()]));
}

#[test]
fn test_dependent_of_cycle_gets_dependency_error() {
    let evaluator = Evaluator::builder().worker_threads(3).build().unwrap();
    register_ping_pong(&evaluator);
    evaluator.register_fn(ROOT, |_key, env| env.value(&Key::new(PING, ())));

    let root = Key::new(ROOT, ());
    let result = evaluator.evaluate([root.clone()]);
    let error = result.error(&root).unwrap();
    assert!(matches!(error.kind(), ErrorKind::Dependency(_)));
    // Not a member itself, but it fails because of the cycle.
    assert!(error.is_cycle());
    assert!(error.root_cause().is_cycle());
    assert_eq!(error.root_cause().key(), &Key::new(PING, ()));
}

const LONG: FunctionTag = FunctionTag::new("long");

#[test]
fn test_cycle_fails_while_unrelated_work_runs() {
    let evaluator = Evaluator::builder().worker_threads(4).build().unwrap();
    register_ping_pong(&evaluator);
    let release = Arc::new(AtomicBool::new(false));
    let (tx, rx) = mpsc::channel();
    let started = Mutex::new(tx);
    let flag = Arc::clone(&release);
    evaluator.register_fn(LONG, move |_key, _env| {
        let _ = started.lock().send(());
        let deadline = Instant::now() + Duration::from_secs(10);
        while !flag.load(Ordering::SeqCst) && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        Ok(Value::new(()))
    });

    let long = Key::new(LONG, ());
    let worker = {
        let evaluator = evaluator.clone();
        let long = long.clone();
        thread::spawn(move || evaluator.evaluate_one(long))
    };
    rx.recv_timeout(Duration::from_secs(10)).unwrap();

    let error = evaluator.evaluate_one(Key::new(PING, ())).unwrap_err();
    assert!(error.evaluation_error().unwrap().is_cycle());
    // Reported before the unrelated node finished.
    assert_eq!(evaluator.graph().state(&long), Some(NodeState::Evaluating));

    release.store(true, Ordering::SeqCst);
    assert_eq!(worker.join().unwrap().unwrap(), Value::new(()));
}

#[test]
fn test_cycle_is_detected_from_either_entry_point() {
    let evaluator = Evaluator::builder().worker_threads(4).build().unwrap();
    register_ping_pong(&evaluator);

    let ping = Key::new(PING, ());
    let pong = Key::new(PONG, ());
    let result = evaluator.evaluate([ping.clone(), pong.clone()]);
    assert!(result.error(&ping).unwrap().root_cause().is_cycle());
    assert!(result.error(&pong).unwrap().root_cause().is_cycle());
    assert!(!result.is_cancelled());
}
