//! Invalidation passes: injecting input values and dirtying dependents.

use std::collections::VecDeque;

use tracing::{debug, trace, warn};

use crate::graph::{DirtyMark, Graph};
use crate::key::Key;
use crate::listener::EvaluationListener;
use crate::node::{DirtyKind, NodeOutput, NodeState, Version};
use crate::value::Value;

/// Why a node was dirtied.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum InvalidationReason {
    /// A new value was injected for this key.
    Injected,
    /// The key was invalidated explicitly.
    Invalidated,
    /// A transitive dependency was injected or invalidated.
    DependencyDirty { source: Key },
}

/// What one invalidation pass touched.
#[derive(Debug, Clone, Default)]
pub struct InvalidationSummary {
    /// Graph version the pass ran at.
    pub version: Version,
    /// Keys whose own value changed or that were invalidated directly.
    pub changed: Vec<Key>,
    /// Number of dependents newly marked for re-verification.
    pub dirtied: usize,
}

pub(crate) struct Invalidator<'a> {
    graph: &'a Graph,
    listener: &'a dyn EvaluationListener,
}

impl<'a> Invalidator<'a> {
    pub fn new(graph: &'a Graph, listener: &'a dyn EvaluationListener) -> Self {
        Self { graph, listener }
    }

    /// Set input values. An input whose value is unchanged is left alone and
    /// dirties nothing.
    pub fn inject(&self, entries: Vec<(Key, Value)>) -> InvalidationSummary {
        let version = self.graph.bump_version();
        let mut summary = InvalidationSummary {
            version,
            ..Default::default()
        };
        for (key, value) in entries {
            let entry = self.graph.get_or_create_node(&key);
            let rdeps: Vec<Key> = {
                let mut record = entry.lock();
                let unchanged = record.is_input
                    && matches!(&record.output, Some(NodeOutput::Value(old)) if *old == value);
                if unchanged {
                    trace!(key = %key, "injected value unchanged");
                    continue;
                }
                record.is_input = true;
                record.output = Some(NodeOutput::Value(value));
                record.changed_at = version;
                record.verified_at = version;
                if record.state == NodeState::Evaluating {
                    // The queued evaluation publishes the injected value.
                    debug!(key = %key, "injected into an evaluating node");
                } else {
                    record.state = NodeState::Done;
                    record.dirty = None;
                }
                record.rdeps.iter().cloned().collect()
            };
            self.graph.detach_dependencies(&key);
            self.listener.on_dirty(&key, &InvalidationReason::Injected);
            summary.dirtied += self.propagate(&key, rdeps);
            summary.changed.push(key);
        }
        debug!(
            version = version.0,
            changed = summary.changed.len(),
            dirtied = summary.dirtied,
            "injected values"
        );
        summary
    }

    /// Force the given keys to re-run on their next evaluation.
    pub fn invalidate(&self, keys: Vec<Key>) -> InvalidationSummary {
        let version = self.graph.bump_version();
        let mut summary = InvalidationSummary {
            version,
            ..Default::default()
        };
        for key in keys {
            let is_input = self
                .graph
                .entry(&key)
                .is_some_and(|entry| entry.lock().is_input);
            if is_input {
                warn!(key = %key, "cannot invalidate an injected input; inject a new value instead");
                continue;
            }
            match self.graph.mark_dirty(&key, DirtyKind::Changed) {
                DirtyMark::Marked(rdeps) => {
                    self.listener.on_dirty(&key, &InvalidationReason::Invalidated);
                    summary.dirtied += self.propagate(&key, rdeps);
                    summary.changed.push(key);
                }
                DirtyMark::AlreadyDirty => summary.changed.push(key),
                DirtyMark::Skipped => trace!(key = %key, "nothing to invalidate"),
            }
        }
        debug!(
            version = version.0,
            changed = summary.changed.len(),
            dirtied = summary.dirtied,
            "invalidated keys"
        );
        summary
    }

    /// Mark every transitive dependent `Check`-dirty. Returns how many nodes
    /// were newly marked.
    fn propagate(&self, source: &Key, rdeps: Vec<Key>) -> usize {
        let reason = InvalidationReason::DependencyDirty {
            source: source.clone(),
        };
        let mut queue: VecDeque<Key> = rdeps.into();
        let mut marked = 0;
        while let Some(key) = queue.pop_front() {
            if let DirtyMark::Marked(rdeps) = self.graph.mark_dirty(&key, DirtyKind::Check) {
                marked += 1;
                self.listener.on_dirty(&key, &reason);
                queue.extend(rdeps);
            }
        }
        marked
    }
}
