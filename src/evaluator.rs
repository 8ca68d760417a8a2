//! The evaluator: registration, invalidation and top-level requests.

use std::sync::Arc;

use ahash::{HashMap, HashSet};
use parking_lot::Mutex;
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::environment::Environment;
use crate::error::{ComputeError, EngineError, EvaluationError, RequestError};
use crate::function::{ComputeFunction, FnFunction};
use crate::graph::Graph;
use crate::invalidation::{InvalidationSummary, Invalidator};
use crate::key::{FunctionTag, Key};
use crate::listener::{EvaluationListener, NoopListener};
use crate::node::Version;
use crate::projection::{Projection, ProjectionFunction};
use crate::scheduler::{RequestLatch, Requested, Scheduler, SchedulerConfig, Waiter};
use crate::value::Value;

/// Decides whether a node's new error equals its previous one. Equal errors
/// prune like equal values.
pub type ErrorComparator = fn(&EvaluationError, &EvaluationError) -> bool;

fn default_error_comparator(_a: &EvaluationError, _b: &EvaluationError) -> bool {
    false
}

/// Builder for an [`Evaluator`].
pub struct EvaluatorBuilder {
    worker_threads: Option<usize>,
    thread_name: String,
    keep_going: bool,
    error_comparator: ErrorComparator,
    listener: Arc<dyn EvaluationListener>,
    io_runtime: Option<Handle>,
}

impl Default for EvaluatorBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl EvaluatorBuilder {
    pub fn new() -> Self {
        Self {
            worker_threads: None,
            thread_name: "memograph-worker".to_string(),
            keep_going: true,
            error_comparator: default_error_comparator,
            listener: Arc::new(NoopListener),
            io_runtime: None,
        }
    }

    /// Size of the worker pool. Defaults to the number of available CPUs.
    pub fn worker_threads(mut self, threads: usize) -> Self {
        self.worker_threads = Some(threads);
        self
    }

    /// Prefix for worker thread names.
    pub fn thread_name(mut self, prefix: impl Into<String>) -> Self {
        self.thread_name = prefix.into();
        self
    }

    /// When `false`, the first error in a request cancels the rest of it.
    /// Defaults to `true`: every requested key is evaluated as far as it can be.
    pub fn keep_going(mut self, keep_going: bool) -> Self {
        self.keep_going = keep_going;
        self
    }

    /// Set the error comparator used for change pruning of errors.
    ///
    /// The default treats every error as changed.
    ///
    /// ```ignore
    /// let evaluator = Evaluator::builder()
    ///     .error_comparator(|a, b| a.to_string() == b.to_string())
    ///     .build()?;
    /// ```
    pub fn error_comparator(mut self, f: ErrorComparator) -> Self {
        self.error_comparator = f;
        self
    }

    pub fn listener(mut self, listener: impl EvaluationListener) -> Self {
        self.listener = Arc::new(listener);
        self
    }

    pub fn shared_listener(mut self, listener: Arc<dyn EvaluationListener>) -> Self {
        self.listener = listener;
        self
    }

    /// Runtime that [`Environment::block_on`] drives futures on. Without one,
    /// futures run on the worker thread with a local executor, which suits
    /// futures that do not need a tokio reactor.
    pub fn io_runtime(mut self, handle: Handle) -> Self {
        self.io_runtime = Some(handle);
        self
    }

    pub fn build(self) -> Result<Evaluator, EngineError> {
        if self.worker_threads == Some(0) {
            return Err(EngineError::NoWorkers);
        }
        let prefix = self.thread_name;
        let mut pool = rayon::ThreadPoolBuilder::new()
            .thread_name(move |index| format!("{}-{}", prefix, index));
        if let Some(threads) = self.worker_threads {
            pool = pool.num_threads(threads);
        }
        let pool = pool.build()?;
        info!(workers = pool.current_num_threads(), keep_going = self.keep_going, "evaluator started");

        let scheduler = Scheduler::new(SchedulerConfig {
            pool,
            listener: self.listener,
            error_comparator: self.error_comparator,
            io_runtime: self.io_runtime,
        });
        Ok(Evaluator {
            scheduler: Arc::new(scheduler),
            keep_going: self.keep_going,
            cancellation: Arc::new(Mutex::new(CancellationToken::new())),
        })
    }
}

/// Incremental evaluator over a dependency graph of keyed computations.
///
/// Cheap to clone; clones share the graph, the functions and the pool.
///
/// Evaluations may run concurrently with each other. [`inject`](Self::inject)
/// and [`invalidate`](Self::invalidate) wait for running evaluations to
/// finish, so they must not be called from inside a compute function.
#[derive(Clone)]
pub struct Evaluator {
    scheduler: Arc<Scheduler>,
    keep_going: bool,
    cancellation: Arc<Mutex<CancellationToken>>,
}

impl Evaluator {
    /// Evaluator with default settings.
    pub fn new() -> Result<Self, EngineError> {
        EvaluatorBuilder::new().build()
    }

    pub fn builder() -> EvaluatorBuilder {
        EvaluatorBuilder::new()
    }

    /// Register the compute function for `tag`, replacing any previous one.
    pub fn register(&self, tag: FunctionTag, function: impl ComputeFunction) {
        self.scheduler.registry.register(tag, Arc::new(function));
    }

    /// Register a closure as the compute function for `tag`.
    pub fn register_fn<F>(&self, tag: FunctionTag, f: F)
    where
        F: Fn(&Key, &mut Environment<'_>) -> Result<Value, ComputeError> + Send + Sync + 'static,
    {
        self.register(tag, FnFunction(f));
    }

    /// Register a projection for keys `Key::new(tag, discriminator)`.
    pub fn register_projection<P: Projection>(&self, tag: FunctionTag, projection: P) {
        self.register(tag, ProjectionFunction::new(projection));
    }

    pub fn is_registered(&self, tag: FunctionTag) -> bool {
        self.scheduler.registry.contains(tag)
    }

    /// Set the value of an input key.
    pub fn inject(&self, key: Key, value: Value) -> InvalidationSummary {
        self.inject_all([(key, value)])
    }

    /// Set several input values in one invalidation pass.
    pub fn inject_all(&self, entries: impl IntoIterator<Item = (Key, Value)>) -> InvalidationSummary {
        let entries: Vec<(Key, Value)> = entries.into_iter().collect();
        let _pass = self.scheduler.gate.write();
        Invalidator::new(&self.scheduler.graph, self.scheduler.listener.as_ref()).inject(entries)
    }

    /// Force computed keys to re-run on their next evaluation.
    pub fn invalidate(&self, keys: impl IntoIterator<Item = Key>) -> InvalidationSummary {
        let keys: Vec<Key> = keys.into_iter().collect();
        let _pass = self.scheduler.gate.write();
        Invalidator::new(&self.scheduler.graph, self.scheduler.listener.as_ref()).invalidate(keys)
    }

    /// Evaluate `keys`, blocking until each is done or the evaluation is
    /// cancelled with [`cancel`](Self::cancel).
    pub fn evaluate(&self, keys: impl IntoIterator<Item = Key>) -> EvaluationResult {
        let token = self.cancellation.lock().clone();
        self.evaluate_with_cancellation(keys, &token)
    }

    /// Evaluate `keys` until done or until `token` is cancelled.
    pub fn evaluate_with_cancellation(
        &self,
        keys: impl IntoIterator<Item = Key>,
        token: &CancellationToken,
    ) -> EvaluationResult {
        let mut seen = HashSet::default();
        let keys: Vec<Key> = keys.into_iter().filter(|k| seen.insert(k.clone())).collect();
        let round = token.child_token();
        let _round = self.scheduler.gate.read_recursive();
        let latch = Arc::new(RequestLatch::default());
        let slot = self.scheduler.register_roots(keys.clone());
        debug!(roots = keys.len(), "evaluation started");

        let mut result = EvaluationResult::default();
        let mut outstanding: HashSet<Key> = HashSet::default();
        for key in &keys {
            self.request_root(key, &latch, &round, &mut result, &mut outstanding);
        }

        while !outstanding.is_empty() && !round.is_cancelled() {
            if self.scheduler.is_idle() {
                self.scheduler.check_stalled();
            }
            for key in latch.wait(&round) {
                if outstanding.contains(&key) {
                    outstanding.remove(&key);
                    self.request_root(&key, &latch, &round, &mut result, &mut outstanding);
                }
            }
        }

        self.scheduler.unregister_roots(slot);
        if !outstanding.is_empty() {
            result.cancelled = true;
            result.incomplete = keys.into_iter().filter(|k| outstanding.contains(k)).collect();
        }
        debug!(
            values = result.values.len(),
            errors = result.errors.len(),
            cancelled = result.cancelled,
            "evaluation finished"
        );
        result
    }

    /// A signalled root is requested again: a done node reports its result,
    /// and a node reverted by someone else's cancellation is claimed anew.
    fn request_root(
        &self,
        key: &Key,
        latch: &Arc<RequestLatch>,
        round: &CancellationToken,
        result: &mut EvaluationResult,
        outstanding: &mut HashSet<Key>,
    ) {
        let waiter = Waiter::Root {
            latch: Arc::clone(latch),
            key: key.clone(),
        };
        match self.scheduler.request(key, waiter, round) {
            Requested::Done { result: Ok(value), .. } => {
                result.values.insert(key.clone(), value);
            }
            Requested::Done {
                result: Err(error), ..
            } => {
                result.errors.insert(key.clone(), error);
                if !self.keep_going {
                    round.cancel();
                }
            }
            Requested::Pending => {
                outstanding.insert(key.clone());
            }
        }
    }

    /// Evaluate a single key.
    pub fn evaluate_one(&self, key: Key) -> Result<Value, RequestError> {
        let mut result = self.evaluate([key.clone()]);
        if let Some(value) = result.values.remove(&key) {
            return Ok(value);
        }
        match result.errors.remove(&key) {
            Some(error) => Err(RequestError::Failed(error)),
            None => Err(RequestError::Cancelled),
        }
    }

    /// Cancel every evaluation started through [`evaluate`](Self::evaluate).
    /// Later calls start with a fresh token.
    pub fn cancel(&self) {
        let mut token = self.cancellation.lock();
        token.cancel();
        *token = CancellationToken::new();
        info!("evaluations cancelled");
    }

    /// The token [`evaluate`](Self::evaluate) currently runs under.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancellation.lock().clone()
    }

    pub fn graph(&self) -> &Graph {
        &self.scheduler.graph
    }

    pub fn version(&self) -> Version {
        self.scheduler.graph.version()
    }

    pub fn worker_threads(&self) -> usize {
        self.scheduler.worker_count()
    }

    /// Remove `key` from the graph if nothing depends on it.
    pub fn remove_if_unused(&self, key: &Key) -> bool {
        let _pass = self.scheduler.gate.write();
        self.scheduler.graph.remove_if_unused(key)
    }

    /// Remove every node not reachable from `roots`. Returns how many were
    /// removed.
    pub fn evict_unreachable(&self, roots: &[Key]) -> usize {
        let _pass = self.scheduler.gate.write();
        self.scheduler.graph.evict_unreachable(roots)
    }
}

/// Outcome of one [`Evaluator::evaluate`] call.
#[derive(Debug, Default)]
pub struct EvaluationResult {
    values: HashMap<Key, Value>,
    errors: HashMap<Key, EvaluationError>,
    incomplete: Vec<Key>,
    cancelled: bool,
}

impl EvaluationResult {
    pub fn get(&self, key: &Key) -> Option<&Value> {
        self.values.get(key)
    }

    /// The value of `key` downcast to `T`.
    pub fn get_as<T: 'static>(&self, key: &Key) -> Option<&T> {
        self.get(key).and_then(Value::downcast_ref)
    }

    pub fn error(&self, key: &Key) -> Option<&EvaluationError> {
        self.errors.get(key)
    }

    pub fn values(&self) -> impl Iterator<Item = (&Key, &Value)> + '_ {
        self.values.iter()
    }

    pub fn errors(&self) -> impl Iterator<Item = (&Key, &EvaluationError)> + '_ {
        self.errors.iter()
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    /// Requested keys left unfinished by cancellation.
    pub fn incomplete(&self) -> &[Key] {
        &self.incomplete
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled
    }

    /// Result for `key`, `None` if it did not finish.
    pub fn result(&self, key: &Key) -> Option<Result<&Value, &EvaluationError>> {
        match (self.values.get(key), self.errors.get(key)) {
            (Some(value), _) => Some(Ok(value)),
            (None, Some(error)) => Some(Err(error)),
            (None, None) => None,
        }
    }
}
