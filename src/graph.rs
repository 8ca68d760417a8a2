//! Concurrent node storage with mirrored forward and reverse edges.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use ahash::{HashMap as AHashMap, HashSet};
use papaya::{Compute, HashMap, Operation};
use serde::Serialize;

use crate::key::Key;
use crate::node::{Dependencies, DirtyKind, NodeEntry, NodeSnapshot, NodeState, Version};

/// The dependency graph: every node the evaluator has seen, by key.
///
/// Nodes are created on first request and individually locked. No code path
/// holds two node locks at once; edge updates touch one node at a time.
pub struct Graph {
    nodes: HashMap<Key, Arc<NodeEntry>, ahash::RandomState>,
    version: AtomicU64,
}

#[test]
fn test_send_sync() {
    fn assert_send<T: Send>() {}
    fn assert_sync<T: Sync>() {}
    assert_send::<Graph>();
    assert_sync::<Graph>();
}

impl Default for Graph {
    fn default() -> Self {
        Self::new()
    }
}

/// Outcome of marking one node dirty.
pub(crate) enum DirtyMark {
    /// The node was newly dirtied; its dependents should be marked too.
    Marked(Vec<Key>),
    /// The node was already dirty, so its dependents already are.
    AlreadyDirty,
    /// Unknown or never-built node.
    Skipped,
}

impl Graph {
    pub fn new() -> Self {
        Self {
            nodes: HashMap::with_hasher(ahash::RandomState::new()),
            version: AtomicU64::new(0),
        }
    }

    /// Current graph version.
    pub fn version(&self) -> Version {
        Version(self.version.load(Ordering::SeqCst))
    }

    pub(crate) fn bump_version(&self) -> Version {
        Version(self.version.fetch_add(1, Ordering::SeqCst) + 1)
    }

    pub(crate) fn entry(&self, key: &Key) -> Option<Arc<NodeEntry>> {
        self.nodes.pin().get(key).cloned()
    }

    /// Get the node for `key`, creating an `Unbuilt` one if absent.
    pub(crate) fn get_or_create_node(&self, key: &Key) -> Arc<NodeEntry> {
        let pinned = self.nodes.pin();
        if let Some(entry) = pinned.get(key) {
            return entry.clone();
        }
        pinned
            .get_or_insert_with(key.clone(), || Arc::new(NodeEntry::new(key.clone())))
            .clone()
    }

    /// Point-in-time copy of one node.
    pub fn get(&self, key: &Key) -> Option<NodeSnapshot> {
        self.entry(key).map(|entry| entry.snapshot())
    }

    pub fn state(&self, key: &Key) -> Option<NodeState> {
        self.entry(key).map(|entry| entry.lock().state)
    }

    pub fn contains(&self, key: &Key) -> bool {
        self.nodes.pin().contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.nodes.pin().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn keys(&self) -> Vec<Key> {
        self.nodes.pin().keys().cloned().collect()
    }

    /// Forward edges recorded for `key`.
    pub fn dependencies(&self, key: &Key) -> Option<Dependencies> {
        self.entry(key).map(|entry| entry.lock().deps.clone())
    }

    /// Keys whose last evaluation read `key`.
    pub fn reverse_deps(&self, key: &Key) -> Vec<Key> {
        self.entry(key)
            .map(|entry| entry.lock().rdeps.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Replace the forward edges of `dependent` and mirror the change onto
    /// each dependency's reverse edges. Returns the previous edges.
    ///
    /// Callers publish the node as done only after this returns.
    pub(crate) fn record_dependencies(&self, dependent: &Key, deps: Dependencies) -> Dependencies {
        let entry = self.get_or_create_node(dependent);
        let old = std::mem::replace(&mut entry.lock().deps, deps.clone());

        let new_keys: HashSet<&Key> = deps.iter().collect();
        let old_keys: HashSet<&Key> = old.iter().collect();
        for removed in old_keys.difference(&new_keys) {
            if let Some(dep) = self.entry(removed) {
                dep.lock().rdeps.remove(dependent);
            }
        }
        for added in new_keys.difference(&old_keys) {
            self.get_or_create_node(added)
                .lock()
                .rdeps
                .insert(dependent.clone());
        }
        old
    }

    /// Drop every forward edge of `dependent`.
    pub(crate) fn detach_dependencies(&self, dependent: &Key) {
        let old = self.record_dependencies(dependent, Dependencies::default());
        if !old.is_empty() {
            tracing::trace!(key = %dependent, edges = old.len(), "detached dependencies");
        }
    }

    /// Mark one node dirty, returning its dependents if marking is new.
    ///
    /// An evaluating node is flagged so that its in-flight evaluation does not
    /// short-circuit on a stale verification.
    pub(crate) fn mark_dirty(&self, key: &Key, kind: DirtyKind) -> DirtyMark {
        let Some(entry) = self.entry(key) else {
            return DirtyMark::Skipped;
        };
        let mut record = entry.lock();
        match record.state {
            NodeState::Unbuilt => DirtyMark::Skipped,
            NodeState::Done => {
                record.state = NodeState::Dirty;
                record.dirty = Some(kind);
                DirtyMark::Marked(record.rdeps.iter().cloned().collect())
            }
            NodeState::Dirty => {
                if kind > record.dirty.unwrap_or(DirtyKind::Check) {
                    record.dirty = Some(kind);
                }
                DirtyMark::AlreadyDirty
            }
            NodeState::Evaluating => {
                record.dirty = record.dirty.max(Some(kind));
                record.invalidated_while_evaluating = true;
                DirtyMark::Marked(record.rdeps.iter().cloned().collect())
            }
        }
    }

    /// Remove `key` if nothing depends on it and it is not being evaluated.
    pub(crate) fn remove_if_unused(&self, key: &Key) -> bool {
        let pinned = self.nodes.pin();
        let result = pinned.compute(key.clone(), |entry| {
            let Some((_, entry)) = entry else {
                return Operation::Abort(());
            };
            let record = entry.lock();
            if record.rdeps.is_empty() && record.state != NodeState::Evaluating {
                Operation::Remove
            } else {
                Operation::Abort(())
            }
        });
        match result {
            Compute::Removed(_, removed) => {
                let deps = removed.lock().deps.clone();
                for dep in deps.iter() {
                    if let Some(dep) = self.entry(dep) {
                        dep.lock().rdeps.remove(key);
                    }
                }
                true
            }
            _ => false,
        }
    }

    /// Remove every node not reachable from `roots` over forward edges.
    ///
    /// Evaluating nodes are kept along with everything they reach.
    pub(crate) fn evict_unreachable(&self, roots: &[Key]) -> usize {
        let mut stack: Vec<Key> = roots.to_vec();
        for key in self.keys() {
            if self.state(&key) == Some(NodeState::Evaluating) {
                stack.push(key);
            }
        }

        let mut reachable: HashSet<Key> = HashSet::default();
        while let Some(key) = stack.pop() {
            if !reachable.insert(key.clone()) {
                continue;
            }
            if let Some(deps) = self.dependencies(&key) {
                stack.extend(deps.iter().filter(|d| !reachable.contains(*d)).cloned());
            }
        }

        let pinned = self.nodes.pin();
        let mut evicted = Vec::new();
        for key in self.keys() {
            if !reachable.contains(&key) {
                if let Some(entry) = pinned.remove(&key) {
                    evicted.push(entry.clone());
                }
            }
        }
        // Reachable dependencies of evicted nodes lose those reverse edges.
        for entry in &evicted {
            let deps = entry.lock().deps.clone();
            for dep in deps.iter().filter(|d| reachable.contains(*d)) {
                if let Some(dep) = self.entry(dep) {
                    dep.lock().rdeps.remove(&entry.key);
                }
            }
        }
        if !evicted.is_empty() {
            tracing::debug!(evicted = evicted.len(), "evicted unreachable nodes");
        }
        evicted.len()
    }

    /// Serializable summary of the whole graph, sorted by key.
    pub fn snapshot(&self) -> GraphSnapshot {
        let mut nodes: Vec<NodeSummary> = self
            .nodes
            .pin()
            .values()
            .map(|entry| NodeSummary::from(entry.snapshot()))
            .collect();
        nodes.sort_by(|a, b| a.key.cmp(&b.key));
        GraphSnapshot {
            version: self.version().0,
            nodes,
        }
    }

    /// Verify edge mirroring and that done nodes form no cycle.
    ///
    /// Only meaningful while no evaluation is running.
    pub fn check_consistency(&self) -> Result<(), GraphInconsistency> {
        let mut forward: AHashMap<Key, (NodeState, Dependencies)> = AHashMap::default();
        let mut reverse: AHashMap<Key, Vec<Key>> = AHashMap::default();
        for (key, entry) in self.nodes.pin().iter() {
            let record = entry.lock();
            forward.insert(key.clone(), (record.state, record.deps.clone()));
            reverse.insert(key.clone(), record.rdeps.iter().cloned().collect());
        }

        for (key, (_, deps)) in &forward {
            for dep in deps.iter() {
                let mirrored = reverse.get(dep).is_some_and(|r| r.contains(key));
                if !mirrored {
                    return Err(GraphInconsistency::MissingReverseEdge {
                        dependent: key.clone(),
                        dependency: dep.clone(),
                    });
                }
            }
        }
        for (key, rdeps) in &reverse {
            for rdep in rdeps {
                let mirrored = forward.get(rdep).is_some_and(|(_, d)| d.contains(key));
                if !mirrored {
                    return Err(GraphInconsistency::DanglingReverseEdge {
                        dependency: key.clone(),
                        dependent: rdep.clone(),
                    });
                }
            }
        }

        // Iterative three-color DFS over done nodes.
        #[derive(Clone, Copy, PartialEq)]
        enum Mark {
            Open,
            Closed,
        }
        let mut marks: AHashMap<&Key, Mark> = AHashMap::default();
        for start in forward.keys() {
            if marks.contains_key(start) || forward[start].0 != NodeState::Done {
                continue;
            }
            let mut path: Vec<&Key> = vec![start];
            let mut cursors: Vec<usize> = vec![0];
            marks.insert(start, Mark::Open);
            while let (Some(&node), Some(cursor)) = (path.last(), cursors.last_mut()) {
                let deps = forward[node].1.as_slice();
                if *cursor < deps.len() {
                    let next = &deps[*cursor];
                    *cursor += 1;
                    let Some((next, (state, _))) = forward.get_key_value(next) else {
                        continue;
                    };
                    if *state != NodeState::Done {
                        continue;
                    }
                    match marks.get(next) {
                        Some(Mark::Open) => {
                            let from = path.iter().position(|k| *k == next).unwrap_or(0);
                            let mut cycle: Vec<Key> =
                                path[from..].iter().map(|k| (*k).clone()).collect();
                            cycle.push(next.clone());
                            return Err(GraphInconsistency::CycleAmongDone { path: cycle });
                        }
                        Some(Mark::Closed) => {}
                        None => {
                            marks.insert(next, Mark::Open);
                            path.push(next);
                            cursors.push(0);
                        }
                    }
                } else {
                    marks.insert(node, Mark::Closed);
                    path.pop();
                    cursors.pop();
                }
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GraphInconsistency {
    #[error("{dependent} depends on {dependency} but the reverse edge is missing")]
    MissingReverseEdge { dependent: Key, dependency: Key },

    #[error("{dependency} lists {dependent} as a dependent but no forward edge exists")]
    DanglingReverseEdge { dependency: Key, dependent: Key },

    #[error("done nodes form a cycle: {path:?}")]
    CycleAmongDone { path: Vec<Key> },
}

/// Serializable view of the graph for debugging and inspection tools.
#[derive(Debug, Clone, Serialize)]
pub struct GraphSnapshot {
    pub version: u64,
    pub nodes: Vec<NodeSummary>,
}

#[derive(Debug, Clone, Serialize)]
pub struct NodeSummary {
    pub key: String,
    pub state: NodeState,
    pub dirty: Option<DirtyKind>,
    pub value: Option<String>,
    pub error: Option<String>,
    pub dependencies: Vec<String>,
    pub dependents: Vec<String>,
    pub changed_at: u64,
    pub verified_at: u64,
    pub is_input: bool,
}

impl From<NodeSnapshot> for NodeSummary {
    fn from(node: NodeSnapshot) -> Self {
        let mut dependents: Vec<String> = node.dependents.iter().map(Key::debug_repr).collect();
        dependents.sort();
        Self {
            key: node.key.debug_repr(),
            state: node.state,
            dirty: node.dirty,
            value: node.value.map(|v| format!("{:?}", v)),
            error: node.error.map(|e| e.to_string()),
            dependencies: node.dependencies.iter().map(Key::debug_repr).collect(),
            dependents,
            changed_at: node.changed_at.0,
            verified_at: node.verified_at.0,
            is_input: node.is_input,
        }
    }
}
