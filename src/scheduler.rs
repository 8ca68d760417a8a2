//! Worker-pool scheduling, the suspend/restart protocol and cycle detection.
//!
//! A node is claimed by the first request that finds it `Unbuilt` or `Dirty`;
//! later requests attach as waiters, so each key is evaluated at most once at
//! a time. A running compute function that asks for unfinished dependencies
//! returns `Incomplete`; the node then sits in the `Waiting` phase with the
//! set of keys it waits on, and the last of those to finish requeues it.
//!
//! A node that parks on a key which is itself waiting starts a bounded search
//! for a cycle through the wait-for edges. When the pool goes idle while
//! requests are outstanding, the waiting nodes reachable from the pending
//! roots are searched without a bound. Every node on a cycle fails with a
//! cycle error.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use ahash::{HashMap as AHashMap, HashSet};
use parking_lot::{Mutex, RwLock};
use slab::Slab;
use tokio::runtime::Handle;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};

use crate::environment::{Environment, Finished};
use crate::error::{ComputeError, ErrorKind, EvaluationError};
use crate::evaluator::ErrorComparator;
use crate::function::FunctionRegistry;
use crate::graph::Graph;
use crate::key::Key;
use crate::listener::{EvaluationListener, NodeOutcome};
use crate::node::{Dependencies, DirtyKind, NodeEntry, NodeOutput, NodeState, Phase, Version};
use crate::value::Value;

/// Who to notify when a node leaves `Evaluating`.
#[derive(Debug)]
pub(crate) enum Waiter {
    /// Another node waiting on this one.
    Parent(Key),
    /// A top-level request.
    Root { latch: Arc<RequestLatch>, key: Key },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Signal {
    Done,
    Cancelled,
}

pub(crate) enum Requested {
    Done {
        result: Result<Value, EvaluationError>,
        changed_at: Version,
    },
    Pending,
}

enum Verification {
    Clean,
    Changed,
    Pending,
}

/// Most wait-for edges followed by the search started from `suspend`.
const EAGER_CYCLE_SEARCH_LIMIT: usize = 256;

/// Wakes a thread blocked on top-level requests.
#[derive(Debug, Default)]
pub(crate) struct RequestLatch {
    signaled: Mutex<Vec<Key>>,
    notify: Notify,
}

impl RequestLatch {
    pub fn signal(&self, key: Key) {
        self.signaled.lock().push(key);
        self.notify.notify_one();
    }

    /// Block until something is signalled or `token` is cancelled, and drain
    /// the signalled keys. May return empty.
    pub fn wait(&self, token: &CancellationToken) -> Vec<Key> {
        let signaled = std::mem::take(&mut *self.signaled.lock());
        if !signaled.is_empty() {
            return signaled;
        }
        futures::executor::block_on(async {
            tokio::select! {
                biased;
                _ = token.cancelled() => {}
                _ = self.notify.notified() => {}
            }
        });
        std::mem::take(&mut *self.signaled.lock())
    }
}

pub(crate) struct SchedulerConfig {
    pub pool: rayon::ThreadPool,
    pub listener: Arc<dyn EvaluationListener>,
    pub error_comparator: ErrorComparator,
    pub io_runtime: Option<Handle>,
}

pub(crate) struct Scheduler {
    pub graph: Graph,
    pub registry: FunctionRegistry,
    pub listener: Arc<dyn EvaluationListener>,
    /// Held shared by evaluations and exclusively by invalidation passes.
    pub gate: RwLock<()>,
    pool: rayon::ThreadPool,
    active: AtomicUsize,
    stall_lock: Mutex<()>,
    roots: Mutex<Slab<Vec<Key>>>,
    error_comparator: ErrorComparator,
    io_runtime: Option<Handle>,
}

impl Scheduler {
    pub fn new(config: SchedulerConfig) -> Self {
        Self {
            graph: Graph::new(),
            registry: FunctionRegistry::default(),
            listener: config.listener,
            gate: RwLock::new(()),
            pool: config.pool,
            active: AtomicUsize::new(0),
            stall_lock: Mutex::new(()),
            roots: Mutex::new(Slab::new()),
            error_comparator: config.error_comparator,
            io_runtime: config.io_runtime,
        }
    }

    pub fn io_runtime(&self) -> Option<&Handle> {
        self.io_runtime.as_ref()
    }

    pub fn worker_count(&self) -> usize {
        self.pool.current_num_threads()
    }

    pub fn is_idle(&self) -> bool {
        self.active.load(Ordering::SeqCst) == 0
    }

    pub fn register_roots(&self, keys: Vec<Key>) -> usize {
        self.roots.lock().insert(keys)
    }

    pub fn unregister_roots(&self, slot: usize) {
        self.roots.lock().try_remove(slot);
    }

    /// Ask for `key` on behalf of `waiter`.
    ///
    /// A parent records the key as awaited before the node is inspected, so a
    /// completion that races with this call is never lost.
    pub fn request(
        self: &Arc<Self>,
        key: &Key,
        waiter: Waiter,
        token: &CancellationToken,
    ) -> Requested {
        let parent = match &waiter {
            Waiter::Parent(parent) => self.graph.entry(parent),
            Waiter::Root { .. } => None,
        };
        if let Some(parent) = &parent {
            parent.lock().waiting_on.insert(key.clone());
        }

        let entry = self.graph.get_or_create_node(key);
        let (requested, claimed) = {
            let mut record = entry.lock();
            if let Some(result) = record.done_result() {
                let changed_at = record.changed_at;
                (Requested::Done { result, changed_at }, false)
            } else if record.state == NodeState::Evaluating {
                record.waiters.push(waiter);
                (Requested::Pending, false)
            } else {
                record.begin_evaluation(token.clone());
                record.waiters.push(waiter);
                (Requested::Pending, true)
            }
        };

        if claimed {
            trace!(key = %key, "scheduled");
            self.enqueue(key.clone());
        }
        if let (Requested::Done { .. }, Some(parent)) = (&requested, &parent) {
            parent.lock().waiting_on.remove(key);
        }
        requested
    }

    fn enqueue(self: &Arc<Self>, key: Key) {
        self.active.fetch_add(1, Ordering::SeqCst);
        let scheduler = Arc::clone(self);
        self.pool.spawn(move || {
            scheduler.run_node(&key);
            if scheduler.active.fetch_sub(1, Ordering::SeqCst) == 1 {
                scheduler.check_stalled();
            }
        });
    }

    fn run_node(self: &Arc<Self>, key: &Key) {
        let Some(entry) = self.graph.entry(key) else {
            return;
        };
        let _round = self.gate.read_recursive();

        enum Mode {
            Verify {
                deps: Dependencies,
                cursor: usize,
                verified_at: Version,
            },
            Build,
        }

        let (token, mode) = {
            let mut record = entry.lock();
            if record.state != NodeState::Evaluating || record.phase != Phase::Queued {
                return;
            }
            if record.is_input && record.output.is_some() {
                // A value was injected while the node was queued.
                let waiters = record.finish_evaluation(NodeState::Done);
                drop(record);
                self.listener.on_node_done(key, NodeOutcome::Changed);
                self.signal_all(key, waiters, Signal::Done);
                return;
            }
            record.phase = Phase::Running;
            record.waiting_on.clear();
            record.force_wake = false;
            if record.invalidated_while_evaluating {
                record.invalidated_while_evaluating = false;
                record.check_cursor = 0;
            }
            let token = record.token.clone().unwrap_or_default();
            let mode = if record.can_verify() {
                Mode::Verify {
                    deps: record.deps.clone(),
                    cursor: record.check_cursor,
                    verified_at: record.verified_at,
                }
            } else {
                Mode::Build
            };
            (token, mode)
        };

        if token.is_cancelled() {
            return self.cancel_node(&entry);
        }
        if let Mode::Verify {
            deps,
            cursor,
            verified_at,
        } = mode
        {
            match self.verify_dependencies(&entry, &deps, cursor, verified_at, &token) {
                Verification::Clean => return self.publish_verified(&entry),
                Verification::Pending => return self.suspend(&entry, &[]),
                Verification::Changed => {}
            }
        }
        self.build(&entry, &token);
    }

    /// Walk the previous dependency groups in order. A group is requested
    /// only after every earlier group finished unchanged.
    fn verify_dependencies(
        self: &Arc<Self>,
        entry: &NodeEntry,
        deps: &Dependencies,
        cursor: usize,
        verified_at: Version,
        token: &CancellationToken,
    ) -> Verification {
        let key = &entry.key;
        let mut requested: Vec<Key> = Vec::new();
        for (index, group) in deps.groups().enumerate() {
            requested.extend(group.iter().cloned());
            if index < cursor {
                continue;
            }
            let mut pending = false;
            for dep in group {
                match self.request(dep, Waiter::Parent(key.clone()), token) {
                    Requested::Done { changed_at, .. } if changed_at > verified_at => {
                        trace!(key = %key, dependency = %dep, "dependency changed");
                        return Verification::Changed;
                    }
                    Requested::Done { .. } => {}
                    Requested::Pending => pending = true,
                }
            }
            if pending {
                let mut record = entry.lock();
                record.check_cursor = index;
                record.last_requested = requested;
                return Verification::Pending;
            }
        }
        Verification::Clean
    }

    fn build(self: &Arc<Self>, entry: &NodeEntry, token: &CancellationToken) {
        let key = &entry.key;
        let Some(function) = self.registry.get(key.tag()) else {
            return self.fail(
                entry,
                ErrorKind::UnregisteredFunction(key.tag()),
                Dependencies::default(),
            );
        };
        let attempt = {
            let mut record = entry.lock();
            record.waiting_on.clear();
            record.force_wake = false;
            record.attempts += 1;
            record.attempts
        };

        self.listener.on_compute(key, attempt);
        trace!(key = %key, attempt, "computing");
        let mut env = Environment::new(self, key, token, attempt);
        let result = panic::catch_unwind(AssertUnwindSafe(|| function.compute(key, &mut env)));
        let Finished {
            deps,
            missing,
            failed,
            uncaught,
        } = env.finish();

        match result {
            Err(payload) => {
                let message = panic_message(&*payload);
                error!(key = %key, panic = %message, "compute function panicked");
                self.fail(entry, ErrorKind::Panicked(message), deps)
            }
            Ok(Err(ComputeError::Cancelled)) => self.cancel_node(entry),
            Ok(Ok(value)) if missing.is_empty() && uncaught.is_empty() => {
                self.commit(entry, NodeOutput::Value(value), deps)
            }
            Ok(Ok(_)) if missing.is_empty() => {
                debug!(key = %key, "value computed over a failed dependency");
                self.incomplete(entry, token, deps, missing, uncaught)
            }
            Ok(Ok(_)) => {
                warn!(key = %key, "compute function returned a value while dependencies were missing");
                self.incomplete(entry, token, deps, missing, failed)
            }
            Ok(Err(ComputeError::Incomplete)) => {
                let failed = if uncaught.is_empty() { failed } else { uncaught };
                self.incomplete(entry, token, deps, missing, failed)
            }
            Ok(Err(ComputeError::Failed(error))) => {
                self.fail(entry, ErrorKind::Computation(error), deps)
            }
            Ok(Err(ComputeError::Dependency(error))) => {
                self.fail(entry, ErrorKind::Dependency(Box::new(error)), deps)
            }
        }
    }

    fn incomplete(
        self: &Arc<Self>,
        entry: &NodeEntry,
        token: &CancellationToken,
        deps: Dependencies,
        missing: Vec<Key>,
        failed: Vec<EvaluationError>,
    ) {
        if token.is_cancelled() {
            return self.cancel_node(entry);
        }
        if !missing.is_empty() {
            entry.lock().last_requested = deps.as_slice().to_vec();
            return self.suspend(entry, &missing);
        }
        match failed.into_iter().next() {
            Some(error) => self.fail(entry, ErrorKind::Dependency(Box::new(error)), deps),
            None => self.fail(
                entry,
                ErrorKind::Computation(Arc::new(anyhow::anyhow!(
                    "compute function reported missing dependencies but none were pending"
                ))),
                deps,
            ),
        }
    }

    /// Park the node until everything it waits on is done, or requeue it
    /// right away if that already happened.
    fn suspend(self: &Arc<Self>, entry: &NodeEntry, missing: &[Key]) {
        let parked_on = {
            let mut record = entry.lock();
            if record.state != NodeState::Evaluating {
                return;
            }
            if record.waiting_on.is_empty() || record.force_wake {
                record.force_wake = false;
                record.phase = Phase::Queued;
                None
            } else {
                record.phase = Phase::Waiting;
                Some(record.waiting_on.iter().cloned().collect::<Vec<_>>())
            }
        };
        if !missing.is_empty() {
            trace!(key = %entry.key, missing = missing.len(), "suspended");
            self.listener.on_restart(&entry.key, missing);
        }
        match parked_on {
            None => self.enqueue(entry.key.clone()),
            Some(keys) if keys.iter().any(|k| self.waiting_edges(k).is_some()) => {
                self.check_cycle_from(&entry.key);
            }
            Some(_) => {}
        }
    }

    /// Bounded search for a cycle among waiting nodes reachable from `key`.
    fn check_cycle_from(self: &Arc<Self>, key: &Key) {
        let _guard = self.stall_lock.lock();
        if let Some(cycle) = self.find_cycle(key, EAGER_CYCLE_SEARCH_LIMIT) {
            if self.confirm_cycle(&cycle) {
                self.break_cycle(cycle);
            }
        }
    }

    /// Re-read every member under all of their locks at once: each must
    /// still be waiting on the next one.
    fn confirm_cycle(&self, cycle: &[Key]) -> bool {
        let entries: Option<Vec<_>> = cycle.iter().map(|k| self.graph.entry(k)).collect();
        let Some(entries) = entries else {
            return false;
        };
        let records: Vec<_> = entries.iter().map(|e| e.lock()).collect();
        let confirmed = records.iter().enumerate().all(|(index, record)| {
            let next = &cycle[(index + 1) % cycle.len()];
            record.state == NodeState::Evaluating
                && record.phase == Phase::Waiting
                && record.waiting_on.contains(next)
        });
        confirmed
    }

    fn fail(self: &Arc<Self>, entry: &NodeEntry, kind: ErrorKind, deps: Dependencies) {
        let error = EvaluationError::new(entry.key.clone(), kind);
        self.commit(entry, NodeOutput::Error(error), deps);
    }

    fn commit(self: &Arc<Self>, entry: &NodeEntry, output: NodeOutput, deps: Dependencies) {
        if let Some((outcome, waiters)) = self.publish(entry, output, deps) {
            self.listener.on_node_done(&entry.key, outcome);
            self.signal_all(&entry.key, waiters, Signal::Done);
        }
    }

    /// Record edges, then store the output and mark the node done. An output
    /// equal to the previous one keeps `changed_at`, so dependents verify
    /// without running.
    fn publish(
        &self,
        entry: &NodeEntry,
        output: NodeOutput,
        deps: Dependencies,
    ) -> Option<(NodeOutcome, Vec<Waiter>)> {
        let key = &entry.key;
        if entry.lock().state != NodeState::Evaluating {
            return None;
        }
        self.graph.record_dependencies(key, deps);

        let mut record = entry.lock();
        if record.state != NodeState::Evaluating {
            return None;
        }
        let now = self.graph.version();
        let changed = match (&record.output, &output) {
            (Some(NodeOutput::Value(old)), NodeOutput::Value(new)) => old != new,
            (Some(NodeOutput::Error(old)), NodeOutput::Error(new)) => {
                !(self.error_comparator)(old, new)
            }
            _ => true,
        };
        let outcome = match (&output, changed) {
            (NodeOutput::Error(_), _) => NodeOutcome::Failed,
            (NodeOutput::Value(_), true) => NodeOutcome::Changed,
            (NodeOutput::Value(_), false) => NodeOutcome::Unchanged,
        };
        if let NodeOutput::Error(error) = &output {
            debug!(key = %key, error = %error, "evaluation failed");
        }
        if changed {
            record.output = Some(output);
            record.changed_at = now;
        }
        record.verified_at = now;
        trace!(key = %key, ?outcome, version = now.0, "published");
        Some((outcome, record.finish_evaluation(NodeState::Done)))
    }

    fn publish_verified(self: &Arc<Self>, entry: &NodeEntry) {
        let waiters = {
            let mut record = entry.lock();
            if record.state != NodeState::Evaluating {
                return;
            }
            record.verified_at = self.graph.version();
            record.finish_evaluation(NodeState::Done)
        };
        trace!(key = %entry.key, "verified unchanged");
        self.listener.on_node_done(&entry.key, NodeOutcome::Verified);
        self.signal_all(&entry.key, waiters, Signal::Done);
    }

    /// Abandon an evaluation. The node returns to its prior state and keeps
    /// its prior edges.
    fn cancel_node(self: &Arc<Self>, entry: &NodeEntry) {
        if let Some((signal, waiters)) = self.revert(entry) {
            self.listener.on_node_done(&entry.key, NodeOutcome::Cancelled);
            self.signal_all(&entry.key, waiters, signal);
        }
    }

    fn revert(&self, entry: &NodeEntry) -> Option<(Signal, Vec<Waiter>)> {
        let mut record = entry.lock();
        if record.state != NodeState::Evaluating {
            return None;
        }
        debug!(key = %entry.key, "evaluation cancelled");
        let reverted = if record.is_input && record.output.is_some() {
            (Signal::Done, record.finish_evaluation(NodeState::Done))
        } else if record.output.is_some() {
            record.dirty.get_or_insert(DirtyKind::Changed);
            (Signal::Cancelled, record.finish_evaluation(NodeState::Dirty))
        } else {
            (Signal::Cancelled, record.finish_evaluation(NodeState::Unbuilt))
        };
        Some(reverted)
    }

    fn signal_all(self: &Arc<Self>, from: &Key, waiters: Vec<Waiter>, signal: Signal) {
        for waiter in waiters {
            match waiter {
                Waiter::Parent(parent) => self.wake_parent(&parent, from, signal),
                Waiter::Root { latch, key } => latch.signal(key),
            }
        }
    }

    /// A cancelled dependency wakes its parent even if the parent still waits
    /// on others, so the parent can observe its own cancellation or re-claim
    /// the dependency.
    fn wake_parent(self: &Arc<Self>, parent: &Key, from: &Key, signal: Signal) {
        let Some(entry) = self.graph.entry(parent) else {
            return;
        };
        let requeue = {
            let mut record = entry.lock();
            if record.state != NodeState::Evaluating || !record.waiting_on.remove(from) {
                return;
            }
            if signal == Signal::Cancelled {
                record.force_wake = true;
            }
            if record.phase == Phase::Waiting && (record.waiting_on.is_empty() || record.force_wake) {
                record.force_wake = false;
                record.phase = Phase::Queued;
                true
            } else {
                false
            }
        };
        if requeue {
            self.enqueue(parent.clone());
        }
    }

    /// Look for cycles among waiting nodes once no work is queued or running.
    pub fn check_stalled(self: &Arc<Self>) {
        let _guard = self.stall_lock.lock();
        if !self.is_idle() {
            return;
        }
        let roots: Vec<Key> = self
            .roots
            .lock()
            .iter()
            .flat_map(|(_, keys)| keys.iter().cloned())
            .collect();

        let mut stuck = Vec::new();
        for root in roots {
            if let Some(cycle) = self.find_cycle(&root, usize::MAX) {
                self.break_cycle(cycle);
            } else if self.waiting_edges(&root).is_some() {
                stuck.push(root);
            }
        }
        if !stuck.is_empty() && self.is_idle() {
            error!(roots = ?stuck, "evaluation stalled without a cycle");
        }
    }

    /// Keys a waiting node is blocked on, or `None` if it is not waiting.
    fn waiting_edges(&self, key: &Key) -> Option<Vec<Key>> {
        let entry = self.graph.entry(key)?;
        let record = entry.lock();
        (record.state == NodeState::Evaluating && record.phase == Phase::Waiting)
            .then(|| record.waiting_on.iter().cloned().collect())
    }

    /// Iterative depth-first search over wait-for edges, giving up after
    /// `limit` edges.
    fn find_cycle(&self, root: &Key, limit: usize) -> Option<Vec<Key>> {
        let edges = self.waiting_edges(root)?;
        let mut followed = 0usize;
        let mut path: Vec<Key> = vec![root.clone()];
        let mut on_path: AHashMap<Key, usize> = AHashMap::default();
        on_path.insert(root.clone(), 0);
        let mut finished: HashSet<Key> = HashSet::default();
        let mut stack: Vec<(Vec<Key>, usize)> = vec![(edges, 0)];

        while let Some((edges, cursor)) = stack.last_mut() {
            let Some(next) = edges.get(*cursor).cloned() else {
                stack.pop();
                if let Some(done) = path.pop() {
                    on_path.remove(&done);
                    finished.insert(done);
                }
                continue;
            };
            *cursor += 1;
            followed += 1;
            if followed > limit {
                return None;
            }
            if let Some(&start) = on_path.get(&next) {
                return Some(path[start..].to_vec());
            }
            if finished.contains(&next) {
                continue;
            }
            match self.waiting_edges(&next) {
                Some(edges) => {
                    on_path.insert(next.clone(), path.len());
                    path.push(next);
                    stack.push((edges, 0));
                }
                None => {
                    finished.insert(next);
                }
            }
        }
        None
    }

    /// Fail every member of `cycle` with a cycle error whose path starts and
    /// ends at that member. Members are all published before any waiter is
    /// woken.
    fn break_cycle(self: &Arc<Self>, cycle: Vec<Key>) {
        let mut full = cycle.clone();
        full.extend(cycle.first().cloned());
        warn!(cycle = ?full, "dependency cycle detected");
        self.listener.on_cycle(&full);

        let members: HashSet<&Key> = cycle.iter().collect();
        let mut wakeups = Vec::new();
        for (index, key) in cycle.iter().enumerate() {
            let Some(entry) = self.graph.entry(key) else {
                continue;
            };
            let (requested, cancelled) = {
                let record = entry.lock();
                let cancelled = record.token.as_ref().is_some_and(|t| t.is_cancelled());
                (record.last_requested.clone(), cancelled)
            };
            if cancelled {
                if let Some((signal, waiters)) = self.revert(&entry) {
                    wakeups.push((key.clone(), NodeOutcome::Cancelled, signal, waiters));
                }
                continue;
            }

            let deps: Dependencies = requested
                .into_iter()
                .filter(|dep| {
                    !members.contains(dep) && self.graph.state(dep) == Some(NodeState::Done)
                })
                .collect();
            let mut path: Vec<Key> = cycle[index..].iter().chain(&cycle[..index]).cloned().collect();
            path.push(key.clone());
            let error = EvaluationError::new(key.clone(), ErrorKind::Cycle { path });
            if let Some((outcome, waiters)) = self.publish(&entry, NodeOutput::Error(error), deps) {
                wakeups.push((key.clone(), outcome, Signal::Done, waiters));
            }
        }

        for (key, outcome, signal, waiters) in wakeups {
            self.listener.on_node_done(&key, outcome);
            self.signal_all(&key, waiters, signal);
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string panic payload".to_string())
}
