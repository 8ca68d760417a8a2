//! Per-key node records.

use std::sync::Arc;

use ahash::HashSet;
use parking_lot::{Mutex, MutexGuard};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::error::EvaluationError;
use crate::key::Key;
use crate::scheduler::Waiter;
use crate::value::Value;

/// Graph version. Bumped once per invalidation pass.
///
/// A node's `changed_at` is the version at which its output last actually
/// changed, and `verified_at` the version at which it was last known to be
/// up to date. A dependent re-verifies by comparing a dependency's
/// `changed_at` with its own `verified_at`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
pub struct Version(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeState {
    /// Created (usually as a dependency) but never evaluated.
    Unbuilt,
    /// Claimed by a worker; queued, running or waiting on dependencies.
    Evaluating,
    /// Holds a value or an error that is current for the graph version.
    Done,
    /// Holds a prior result that may be stale.
    Dirty,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum DirtyKind {
    /// A transitive dependency changed; re-verify dependencies before running.
    Check,
    /// The node itself was invalidated; it must run again.
    Changed,
}

/// Scheduling phase of an evaluating node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Phase {
    Idle,
    Queued,
    Running,
    Waiting,
}

#[derive(Debug, Clone)]
pub(crate) enum NodeOutput {
    Value(Value),
    Error(EvaluationError),
}

impl NodeOutput {
    pub(crate) fn to_result(&self) -> Result<Value, EvaluationError> {
        match self {
            NodeOutput::Value(value) => Ok(value.clone()),
            NodeOutput::Error(error) => Err(error.clone()),
        }
    }
}

/// Keys a node read during its last completed evaluation, in request order,
/// split into the groups they were requested in.
///
/// Clone is cheap as vectors are wrapped by `Arc`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Dependencies {
    keys: Arc<Vec<Key>>,
    groups: Arc<Vec<usize>>,
}

impl Dependencies {
    /// `groups` holds the length of each consecutive request batch.
    pub fn new(keys: Vec<Key>, groups: Vec<usize>) -> Self {
        debug_assert_eq!(groups.iter().sum::<usize>(), keys.len());
        Self {
            keys: Arc::new(keys),
            groups: Arc::new(groups),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Key> + '_ {
        self.keys.iter()
    }

    pub fn contains(&self, key: &Key) -> bool {
        self.keys.contains(key)
    }

    pub fn as_slice(&self) -> &[Key] {
        &self.keys
    }

    /// Iterate over request batches in the order they were made.
    pub fn groups(&self) -> impl Iterator<Item = &[Key]> + '_ {
        let mut start = 0;
        self.groups.iter().map(move |&len| {
            let group = &self.keys[start..start + len];
            start += len;
            group
        })
    }

    pub fn group_count(&self) -> usize {
        self.groups.len()
    }
}

/// Every key in its own group.
impl FromIterator<Key> for Dependencies {
    fn from_iter<T: IntoIterator<Item = Key>>(iter: T) -> Self {
        let keys: Vec<Key> = iter.into_iter().collect();
        let groups = vec![1; keys.len()];
        Self::new(keys, groups)
    }
}

/// Mutable state of one node, guarded by the node's mutex.
#[derive(Debug)]
pub(crate) struct NodeRecord {
    pub state: NodeState,
    pub dirty: Option<DirtyKind>,
    pub phase: Phase,
    pub output: Option<NodeOutput>,
    pub deps: Dependencies,
    pub rdeps: HashSet<Key>,
    pub changed_at: Version,
    pub verified_at: Version,
    pub is_input: bool,

    // Evaluation bookkeeping, reset whenever the node leaves `Evaluating`.
    pub token: Option<CancellationToken>,
    pub waiters: Vec<Waiter>,
    pub waiting_on: HashSet<Key>,
    pub force_wake: bool,
    pub check_cursor: usize,
    pub attempts: u32,
    pub last_requested: Vec<Key>,
    pub invalidated_while_evaluating: bool,
}

impl Default for NodeRecord {
    fn default() -> Self {
        Self {
            state: NodeState::Unbuilt,
            dirty: None,
            phase: Phase::Idle,
            output: None,
            deps: Dependencies::default(),
            rdeps: HashSet::default(),
            changed_at: Version::default(),
            verified_at: Version::default(),
            is_input: false,
            token: None,
            waiters: Vec::new(),
            waiting_on: HashSet::default(),
            force_wake: false,
            check_cursor: 0,
            attempts: 0,
            last_requested: Vec::new(),
            invalidated_while_evaluating: false,
        }
    }
}

impl NodeRecord {
    /// The node's result if it is `Done`.
    pub fn done_result(&self) -> Option<Result<Value, EvaluationError>> {
        match (self.state, &self.output) {
            (NodeState::Done, Some(output)) => Some(output.to_result()),
            _ => None,
        }
    }

    /// Claim the node for evaluation under `token`.
    pub fn begin_evaluation(&mut self, token: CancellationToken) {
        if self.dirty.is_none() && self.output.is_some() {
            self.dirty = Some(DirtyKind::Changed);
        }
        self.state = NodeState::Evaluating;
        self.phase = Phase::Queued;
        self.token = Some(token);
        self.waiting_on.clear();
        self.force_wake = false;
        self.check_cursor = 0;
        self.attempts = 0;
        self.last_requested.clear();
        self.invalidated_while_evaluating = false;
    }

    /// Drop evaluation bookkeeping and hand back the waiters to signal.
    pub fn finish_evaluation(&mut self, state: NodeState) -> Vec<Waiter> {
        self.state = state;
        if state == NodeState::Done {
            self.dirty = None;
        }
        self.phase = Phase::Idle;
        self.token = None;
        self.waiting_on.clear();
        self.force_wake = false;
        self.check_cursor = 0;
        self.attempts = 0;
        self.last_requested.clear();
        self.invalidated_while_evaluating = false;
        std::mem::take(&mut self.waiters)
    }

    /// True when a `Check`-dirty node can try to re-verify its dependencies
    /// instead of running.
    pub fn can_verify(&self) -> bool {
        self.dirty == Some(DirtyKind::Check) && self.output.is_some() && !self.is_input
    }
}

pub(crate) struct NodeEntry {
    pub key: Key,
    record: Mutex<NodeRecord>,
}

impl NodeEntry {
    pub fn new(key: Key) -> Self {
        Self {
            key,
            record: Mutex::new(NodeRecord::default()),
        }
    }

    pub fn lock(&self) -> MutexGuard<'_, NodeRecord> {
        self.record.lock()
    }

    pub fn snapshot(&self) -> NodeSnapshot {
        let record = self.lock();
        let (value, error) = match &record.output {
            Some(NodeOutput::Value(v)) => (Some(v.clone()), None),
            Some(NodeOutput::Error(e)) => (None, Some(e.clone())),
            None => (None, None),
        };
        NodeSnapshot {
            key: self.key.clone(),
            state: record.state,
            dirty: record.dirty,
            value,
            error,
            dependencies: record.deps.clone(),
            dependents: record.rdeps.iter().cloned().collect(),
            changed_at: record.changed_at,
            verified_at: record.verified_at,
            is_input: record.is_input,
        }
    }
}

/// Point-in-time copy of a node.
#[derive(Debug, Clone)]
pub struct NodeSnapshot {
    pub key: Key,
    pub state: NodeState,
    pub dirty: Option<DirtyKind>,
    /// The current value, or the prior value of a dirty node.
    pub value: Option<Value>,
    pub error: Option<EvaluationError>,
    pub dependencies: Dependencies,
    pub dependents: Vec<Key>,
    pub changed_at: Version,
    pub verified_at: Version,
    pub is_input: bool,
}
