//! Memoization, change pruning and dependency recording.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use anyhow::anyhow;
use memograph::{
    ComputeError, DirtyKind, EvaluationListener, Evaluator, FunctionTag, Key, NodeOutcome,
    NodeState, Projection, Value,
};
use parking_lot::Mutex;

const INPUT: FunctionTag = FunctionTag::new("input");
const DOUBLE: FunctionTag = FunctionTag::new("double");
const SUM: FunctionTag = FunctionTag::new("sum");
const PARITY: FunctionTag = FunctionTag::new("parity");
const REPORT: FunctionTag = FunctionTag::new("report");

fn input(name: &str) -> Key {
    Key::new(INPUT, name.to_string())
}

fn as_i64(value: &Value) -> Result<i64, ComputeError> {
    value
        .downcast_ref::<i64>()
        .copied()
        .ok_or_else(|| anyhow!("expected i64, got {}", value.type_name()).into())
}

fn evaluator() -> Evaluator {
    Evaluator::builder().worker_threads(4).build().unwrap()
}

// ============================================================================
// Memoization
// ============================================================================

#[test]
fn test_diamond_is_computed_once() {
    let doubles = Arc::new(AtomicU32::new(0));
    let evaluator = evaluator();

    let counter = Arc::clone(&doubles);
    evaluator.register_fn(DOUBLE, move |key, env| {
        counter.fetch_add(1, Ordering::SeqCst);
        let name = key.argument::<String>().unwrap();
        let n = as_i64(&env.value(&input(name))?)?;
        Ok(Value::new(n * 2))
    });
    evaluator.register_fn(SUM, |_key, env| {
        let deps = env.get_values(&[
            Key::new(DOUBLE, "a".to_string()),
            Key::new(DOUBLE, "b".to_string()),
        ])?;
        let Some(values) = deps.values() else {
            return Err(ComputeError::Incomplete);
        };
        let mut total = 0;
        for value in &values {
            total += as_i64(value)?;
        }
        Ok(Value::new(total))
    });

    evaluator.inject_all([
        (input("a"), Value::new(3i64)),
        (input("b"), Value::new(4i64)),
    ]);

    let sum = Key::new(SUM, ());
    assert_eq!(evaluator.evaluate_one(sum.clone()).unwrap(), Value::new(14i64));
    assert_eq!(doubles.load(Ordering::SeqCst), 2);

    // Cached.
    assert_eq!(evaluator.evaluate_one(sum.clone()).unwrap(), Value::new(14i64));
    assert_eq!(doubles.load(Ordering::SeqCst), 2);

    evaluator.inject(input("a"), Value::new(10i64));
    assert_eq!(evaluator.evaluate_one(sum).unwrap(), Value::new(28i64));
    assert_eq!(doubles.load(Ordering::SeqCst), 3);
    evaluator.graph().check_consistency().unwrap();
}

#[test]
fn test_evaluate_many_roots() {
    let evaluator = evaluator();
    evaluator.register_fn(DOUBLE, |key, env| {
        let name = key.argument::<String>().unwrap();
        let n = as_i64(&env.value(&input(name))?)?;
        Ok(Value::new(n * 2))
    });
    let names = ["x", "y", "z"];
    evaluator.inject_all(
        names
            .iter()
            .enumerate()
            .map(|(i, n)| (input(n), Value::new(i as i64))),
    );

    let keys: Vec<Key> = names.iter().map(|n| Key::new(DOUBLE, n.to_string())).collect();
    let result = evaluator.evaluate(keys.clone());
    assert!(!result.has_errors());
    assert!(!result.is_cancelled());
    for (i, key) in keys.iter().enumerate() {
        assert_eq!(result.get_as::<i64>(key), Some(&(i as i64 * 2)));
    }
}

#[test]
fn test_equal_injection_is_a_no_op() {
    let runs = Arc::new(AtomicU32::new(0));
    let evaluator = evaluator();
    let counter = Arc::clone(&runs);
    evaluator.register_fn(DOUBLE, move |key, env| {
        counter.fetch_add(1, Ordering::SeqCst);
        let n = as_i64(&env.value(&input(key.argument::<String>().unwrap()))?)?;
        Ok(Value::new(n * 2))
    });
    evaluator.inject(input("a"), Value::new(1i64));
    let key = Key::new(DOUBLE, "a".to_string());
    evaluator.evaluate_one(key.clone()).unwrap();

    let summary = evaluator.inject(input("a"), Value::new(1i64));
    assert!(summary.changed.is_empty());
    assert_eq!(summary.dirtied, 0);
    assert_eq!(evaluator.graph().state(&key), Some(NodeState::Done));

    evaluator.evaluate_one(key).unwrap();
    assert_eq!(runs.load(Ordering::SeqCst), 1);
}

// ============================================================================
// Change pruning
// ============================================================================

#[derive(Default)]
struct Outcomes(Mutex<Vec<(Key, NodeOutcome)>>);

impl Outcomes {
    fn of(&self, key: &Key) -> Vec<NodeOutcome> {
        self.0
            .lock()
            .iter()
            .filter(|(k, _)| k == key)
            .map(|(_, o)| *o)
            .collect()
    }
}

impl EvaluationListener for Outcomes {
    fn on_node_done(&self, key: &Key, outcome: NodeOutcome) {
        self.0.lock().push((key.clone(), outcome));
    }
}

#[test]
fn test_equal_value_stops_propagation() {
    let parity_runs = Arc::new(AtomicU32::new(0));
    let report_runs = Arc::new(AtomicU32::new(0));
    let outcomes = Arc::new(Outcomes::default());
    let evaluator = Evaluator::builder()
        .worker_threads(2)
        .shared_listener(outcomes.clone())
        .build()
        .unwrap();

    let counter = Arc::clone(&parity_runs);
    evaluator.register_fn(PARITY, move |_key, env| {
        counter.fetch_add(1, Ordering::SeqCst);
        let n = as_i64(&env.value(&input("n"))?)?;
        Ok(Value::new(n % 2 == 0))
    });
    let counter = Arc::clone(&report_runs);
    evaluator.register_fn(REPORT, move |_key, env| {
        // Restarts while PARITY is pending belong to the same evaluation.
        if env.restart_count() == 0 {
            counter.fetch_add(1, Ordering::SeqCst);
        }
        let even = env.value(&Key::new(PARITY, ()))?;
        let even = *even.downcast_ref::<bool>().unwrap();
        Ok(Value::new(if even { "even" } else { "odd" }.to_string()))
    });

    let report = Key::new(REPORT, ());
    let parity = Key::new(PARITY, ());
    evaluator.inject(input("n"), Value::new(1i64));
    assert_eq!(
        evaluator.evaluate_one(report.clone()).unwrap().downcast_ref::<String>(),
        Some(&"odd".to_string())
    );

    let summary = evaluator.inject(input("n"), Value::new(3i64));
    assert_eq!(summary.dirtied, 2);
    let snapshot = evaluator.graph().get(&report).unwrap();
    assert_eq!(snapshot.state, NodeState::Dirty);
    assert_eq!(snapshot.dirty, Some(DirtyKind::Check));

    assert_eq!(
        evaluator.evaluate_one(report.clone()).unwrap().downcast_ref::<String>(),
        Some(&"odd".to_string())
    );
    assert_eq!(parity_runs.load(Ordering::SeqCst), 2);
    assert_eq!(report_runs.load(Ordering::SeqCst), 1);
    assert_eq!(outcomes.of(&parity), vec![NodeOutcome::Changed, NodeOutcome::Unchanged]);
    assert_eq!(outcomes.of(&report), vec![NodeOutcome::Changed, NodeOutcome::Verified]);

    // A real change re-runs the whole chain.
    evaluator.inject(input("n"), Value::new(4i64));
    assert_eq!(
        evaluator.evaluate_one(report).unwrap().downcast_ref::<String>(),
        Some(&"even".to_string())
    );
    assert_eq!(parity_runs.load(Ordering::SeqCst), 3);
    assert_eq!(report_runs.load(Ordering::SeqCst), 2);
}

#[test]
fn test_invalidate_reruns_even_without_input_change() {
    let runs = Arc::new(AtomicU32::new(0));
    let evaluator = evaluator();
    let counter = Arc::clone(&runs);
    evaluator.register_fn(PARITY, move |_key, env| {
        counter.fetch_add(1, Ordering::SeqCst);
        let n = as_i64(&env.value(&input("n"))?)?;
        Ok(Value::new(n % 2 == 0))
    });
    evaluator.inject(input("n"), Value::new(2i64));
    let parity = Key::new(PARITY, ());
    evaluator.evaluate_one(parity.clone()).unwrap();

    let summary = evaluator.invalidate([parity.clone()]);
    assert_eq!(summary.changed, vec![parity.clone()]);
    assert_eq!(
        evaluator.graph().get(&parity).unwrap().dirty,
        Some(DirtyKind::Changed)
    );
    evaluator.evaluate_one(parity.clone()).unwrap();
    assert_eq!(runs.load(Ordering::SeqCst), 2);

    // Inputs are only changed by injection.
    let summary = evaluator.invalidate([input("n")]);
    assert!(summary.changed.is_empty());
}

// ============================================================================
// Projection
// ============================================================================

const MODULES: FunctionTag = FunctionTag::new("modules");
const USERS_OF: FunctionTag = FunctionTag::new("users_of");
const LINK: FunctionTag = FunctionTag::new("link");

/// Which extension each module uses.
type ModuleTable = BTreeMap<String, String>;

struct UsersOf;

impl Projection for UsersOf {
    type Discriminator = String;
    type Source = ModuleTable;
    type Output = BTreeSet<String>;

    fn source_key(&self, _extension: &String) -> Key {
        Key::new(MODULES, ())
    }

    fn project(&self, table: &ModuleTable, extension: &String) -> Result<BTreeSet<String>, ComputeError> {
        Ok(table
            .iter()
            .filter(|(_, ext)| *ext == extension)
            .map(|(module, _)| module.clone())
            .collect())
    }
}

fn table(entries: &[(&str, &str)]) -> Value {
    Value::new(
        entries
            .iter()
            .map(|(m, e)| (m.to_string(), e.to_string()))
            .collect::<ModuleTable>(),
    )
}

#[test]
fn test_projection_shields_unrelated_changes() {
    let links = Arc::new(AtomicU32::new(0));
    let evaluator = evaluator();
    evaluator.register_projection(USERS_OF, UsersOf);
    let counter = Arc::clone(&links);
    evaluator.register_fn(LINK, move |key, env| {
        if env.restart_count() == 0 {
            counter.fetch_add(1, Ordering::SeqCst);
        }
        let extension = key.argument::<String>().unwrap().clone();
        let users = env.value(&Key::new(USERS_OF, extension))?;
        let users = users.downcast_ref::<BTreeSet<String>>().unwrap();
        Ok(Value::new(users.iter().cloned().collect::<Vec<_>>().join(",")))
    });

    let modules = Key::new(MODULES, ());
    evaluator.inject(modules.clone(), table(&[("A", "E1"), ("B", "E2"), ("C", "E1")]));

    let link_e1 = Key::new(LINK, "E1".to_string());
    let link_e2 = Key::new(LINK, "E2".to_string());
    let result = evaluator.evaluate([link_e1.clone(), link_e2.clone()]);
    assert_eq!(result.get_as::<String>(&link_e1), Some(&"A,C".to_string()));
    assert_eq!(result.get_as::<String>(&link_e2), Some(&"B".to_string()));
    assert_eq!(links.load(Ordering::SeqCst), 2);

    // B moves from E2 to E3: the E1 projection is unchanged.
    evaluator.inject(modules, table(&[("A", "E1"), ("B", "E3"), ("C", "E1")]));
    let link_e3 = Key::new(LINK, "E3".to_string());
    let result = evaluator.evaluate([link_e1.clone(), link_e2.clone(), link_e3.clone()]);
    assert_eq!(result.get_as::<String>(&link_e1), Some(&"A,C".to_string()));
    assert_eq!(result.get_as::<String>(&link_e2), Some(&String::new()));
    assert_eq!(result.get_as::<String>(&link_e3), Some(&"B".to_string()));
    // E2 re-ran, E3 ran for the first time, E1 was verified.
    assert_eq!(links.load(Ordering::SeqCst), 4);
    evaluator.graph().check_consistency().unwrap();
}

// ============================================================================
// Dependency recording
// ============================================================================

const LEAF: FunctionTag = FunctionTag::new("leaf");
const PICKY: FunctionTag = FunctionTag::new("picky");

#[test]
fn test_only_final_pass_dependencies_are_recorded() {
    let evaluator = evaluator();
    evaluator.register_fn(LEAF, |key, _env| {
        Ok(Value::new(*key.argument::<u32>().unwrap()))
    });
    evaluator.register_fn(PICKY, |_key, env| {
        let first = Key::new(LEAF, 1u32);
        if env.restart_count() == 0 {
            // Asks for more than it needs on the first pass.
            env.get_values(&[first, Key::new(LEAF, 2u32)])?;
            return Err(ComputeError::Incomplete);
        }
        let value = env.value(&first)?;
        Ok(value)
    });

    let picky = Key::new(PICKY, ());
    assert_eq!(evaluator.evaluate_one(picky.clone()).unwrap(), Value::new(1u32));

    let deps = evaluator.graph().dependencies(&picky).unwrap();
    assert_eq!(deps.as_slice(), &[Key::new(LEAF, 1u32)]);
    assert!(evaluator.graph().reverse_deps(&Key::new(LEAF, 2u32)).is_empty());
    assert_eq!(
        evaluator.graph().reverse_deps(&Key::new(LEAF, 1u32)),
        vec![picky]
    );
    evaluator.graph().check_consistency().unwrap();
}

#[test]
fn test_batched_requests_form_one_group() {
    let evaluator = evaluator();
    evaluator.register_fn(LEAF, |key, _env| {
        Ok(Value::new(*key.argument::<u32>().unwrap()))
    });
    evaluator.register_fn(SUM, |_key, env| {
        let a = env.value(&Key::new(LEAF, 1u32))?;
        let rest = env.get_values(&[Key::new(LEAF, 2u32), Key::new(LEAF, 3u32)])?;
        let Some(rest) = rest.values() else {
            return Err(ComputeError::Incomplete);
        };
        let mut total = *a.downcast_ref::<u32>().unwrap();
        for value in rest {
            total += *value.downcast_ref::<u32>().unwrap();
        }
        Ok(Value::new(total))
    });

    let sum = Key::new(SUM, ());
    assert_eq!(evaluator.evaluate_one(sum.clone()).unwrap(), Value::new(6u32));
    let deps = evaluator.graph().dependencies(&sum).unwrap();
    assert_eq!(deps.len(), 3);
    assert_eq!(deps.group_count(), 2);
}

// ============================================================================
// Graph maintenance
// ============================================================================

#[test]
fn test_eviction_and_removal() {
    let evaluator = evaluator();
    evaluator.register_fn(DOUBLE, |key, env| {
        let n = as_i64(&env.value(&input(key.argument::<String>().unwrap()))?)?;
        Ok(Value::new(n * 2))
    });
    evaluator.inject_all([
        (input("kept"), Value::new(1i64)),
        (input("dropped"), Value::new(2i64)),
    ]);
    let kept = Key::new(DOUBLE, "kept".to_string());
    let dropped = Key::new(DOUBLE, "dropped".to_string());
    evaluator.evaluate([kept.clone(), dropped.clone()]);
    assert_eq!(evaluator.graph().len(), 4);

    // Still depended on.
    assert!(!evaluator.remove_if_unused(&input("kept")));

    assert_eq!(evaluator.evict_unreachable(&[kept.clone()]), 2);
    assert!(evaluator.graph().contains(&kept));
    assert!(evaluator.graph().contains(&input("kept")));
    assert!(!evaluator.graph().contains(&dropped));
    evaluator.graph().check_consistency().unwrap();

    assert!(evaluator.remove_if_unused(&kept));
    assert!(evaluator.remove_if_unused(&input("kept")));
    assert!(evaluator.graph().is_empty());
}

#[test]
fn test_snapshot_serializes() {
    let evaluator = evaluator();
    evaluator.register_fn(DOUBLE, |key, env| {
        let n = as_i64(&env.value(&input(key.argument::<String>().unwrap()))?)?;
        Ok(Value::new(n * 2))
    });
    evaluator.inject(input("a"), Value::new(21i64));
    evaluator.evaluate_one(Key::new(DOUBLE, "a".to_string())).unwrap();

    let snapshot = evaluator.graph().snapshot();
    assert_eq!(snapshot.nodes.len(), 2);
    let json = serde_json::to_value(&snapshot).unwrap();
    assert_eq!(json["version"], snapshot.version);
    assert!(json["nodes"].as_array().unwrap().iter().any(|n| n["value"] == "42"));
}
