//! The dependency-access handle passed to compute functions.

use std::future::Future;
use std::sync::Arc;

use ahash::{HashMap, HashSet};
use tokio_util::sync::CancellationToken;

use crate::error::{ComputeError, EvaluationError, TypedErr};
use crate::key::Key;
use crate::node::Dependencies;
use crate::scheduler::{Requested, Scheduler, Waiter};
use crate::value::Value;

#[derive(Clone)]
enum Lookup {
    Ready(Value),
    Failed(EvaluationError),
    Missing,
}

/// Handle a compute function uses to read other keys.
///
/// Every key read through the environment is recorded, in order, as a
/// dependency of the node being computed. A key that is not ready yet reads
/// as `None` and is scheduled; when anything is missing the function should
/// return [`ComputeError::Incomplete`] and will be run again from the start.
///
/// ```ignore
/// fn compute(&self, key: &Key, env: &mut Environment<'_>) -> Result<Value, ComputeError> {
///     let deps = env.get_values(&[a.clone(), b.clone()])?;
///     if env.values_missing() {
///         return Err(ComputeError::Incomplete);
///     }
///     ...
/// }
/// ```
pub struct Environment<'a> {
    scheduler: &'a Arc<Scheduler>,
    key: &'a Key,
    token: &'a CancellationToken,
    attempt: u32,
    requested: Vec<Key>,
    groups: Vec<usize>,
    lookups: HashMap<Key, Lookup>,
    missing: Vec<Key>,
    failed: Vec<EvaluationError>,
    /// Failed keys whose error was handed to the function.
    caught: HashSet<Key>,
}

/// What one run of a compute function asked for.
pub(crate) struct Finished {
    pub deps: Dependencies,
    pub missing: Vec<Key>,
    pub failed: Vec<EvaluationError>,
    /// Dependency errors the function never asked to see.
    pub uncaught: Vec<EvaluationError>,
}

impl<'a> Environment<'a> {
    pub(crate) fn new(
        scheduler: &'a Arc<Scheduler>,
        key: &'a Key,
        token: &'a CancellationToken,
        attempt: u32,
    ) -> Self {
        Self {
            scheduler,
            key,
            token,
            attempt,
            requested: Vec::new(),
            groups: Vec::new(),
            lookups: HashMap::default(),
            missing: Vec::new(),
            failed: Vec::new(),
            caught: HashSet::default(),
        }
    }

    /// The key being computed.
    pub fn key(&self) -> &Key {
        self.key
    }

    /// How many times this evaluation was restarted before the current run.
    pub fn restart_count(&self) -> u32 {
        self.attempt.saturating_sub(1)
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// True if any key requested in this run is not ready, or finished with
    /// an error that was not read through
    /// [`get_value_or_throw`](Self::get_value_or_throw) or
    /// [`get_value_or_catch`](Self::get_value_or_catch).
    pub fn values_missing(&self) -> bool {
        !self.missing.is_empty()
            || self.failed.iter().any(|e| !self.caught.contains(e.key()))
    }

    /// Request keys not seen yet in this run as one group.
    fn request_all<'k>(&mut self, keys: impl IntoIterator<Item = &'k Key>) -> Result<(), ComputeError> {
        if self.token.is_cancelled() {
            return Err(ComputeError::Cancelled);
        }
        let mut group = 0;
        for key in keys {
            if self.lookups.contains_key(key) {
                continue;
            }
            let waiter = Waiter::Parent(self.key.clone());
            let lookup = match self.scheduler.request(key, waiter, self.token) {
                Requested::Done { result: Ok(value), .. } => Lookup::Ready(value),
                Requested::Done {
                    result: Err(error), ..
                } => {
                    self.failed.push(error.clone());
                    Lookup::Failed(error)
                }
                Requested::Pending => {
                    self.missing.push(key.clone());
                    Lookup::Missing
                }
            };
            self.lookups.insert(key.clone(), lookup);
            self.requested.push(key.clone());
            group += 1;
        }
        if group > 0 {
            self.groups.push(group);
        }
        Ok(())
    }

    fn ready(&self, key: &Key) -> Option<Value> {
        match self.lookups.get(key) {
            Some(Lookup::Ready(value)) => Some(value.clone()),
            _ => None,
        }
    }

    /// Value of `key`, or `None` if it is not ready or finished with an error.
    ///
    /// A dependency error read this way is not raised, but it is not
    /// recovered either: whether the function then returns `Incomplete` or a
    /// value, the node fails with that dependency error.
    pub fn get_value(&mut self, key: &Key) -> Result<Option<Value>, ComputeError> {
        self.request_all(std::iter::once(key))?;
        Ok(self.ready(key))
    }

    /// Request several keys at once, so they are scheduled in parallel.
    pub fn get_values(&mut self, keys: &[Key]) -> Result<DependencyValues, ComputeError> {
        self.request_all(keys)?;
        let entries = keys.iter().map(|k| (k.clone(), self.ready(k))).collect();
        Ok(DependencyValues { entries })
    }

    /// Like [`get_value`](Self::get_value), but a dependency error is returned
    /// as [`ComputeError::Dependency`].
    pub fn get_value_or_throw(&mut self, key: &Key) -> Result<Option<Value>, ComputeError> {
        self.request_all(std::iter::once(key))?;
        match self.lookups.get(key) {
            Some(Lookup::Ready(value)) => Ok(Some(value.clone())),
            Some(Lookup::Failed(error)) => {
                let error = error.clone();
                self.caught.insert(key.clone());
                Err(ComputeError::Dependency(error))
            }
            Some(Lookup::Missing) | None => Ok(None),
        }
    }

    /// Catch a dependency's computation error of type `E`; any other error
    /// is returned as [`ComputeError::Dependency`].
    pub fn get_value_or_catch<E: std::error::Error + Send + Sync + 'static>(
        &mut self,
        key: &Key,
    ) -> Result<Result<Option<Value>, TypedErr<E>>, ComputeError> {
        match self.get_value_or_throw(key) {
            Ok(value) => Ok(Ok(value)),
            Err(ComputeError::Dependency(error)) => match TypedErr::new(error.clone()) {
                Some(typed) => Ok(Err(typed)),
                None => Err(ComputeError::Dependency(error)),
            },
            Err(other) => Err(other),
        }
    }

    /// Value of `key`, with `Incomplete` if it is not ready and
    /// `Dependency` if it failed. Suits the `?` operator.
    pub fn value(&mut self, key: &Key) -> Result<Value, ComputeError> {
        self.get_value_or_throw(key)?
            .ok_or(ComputeError::Incomplete)
    }

    /// Run a future to completion on the evaluator's I/O runtime, or on the
    /// current thread if none was configured. Returns `Cancelled` as soon as
    /// the evaluation is cancelled.
    pub fn block_on<F: Future>(&self, future: F) -> Result<F::Output, ComputeError> {
        if self.token.is_cancelled() {
            return Err(ComputeError::Cancelled);
        }
        let token = self.token.clone();
        let guarded = async move {
            tokio::select! {
                biased;
                _ = token.cancelled() => None,
                output = future => Some(output),
            }
        };
        let output = match self.scheduler.io_runtime() {
            Some(handle) => handle.block_on(guarded),
            None => futures::executor::block_on(guarded),
        };
        output.ok_or(ComputeError::Cancelled)
    }

    pub(crate) fn finish(self) -> Finished {
        let uncaught = self
            .failed
            .iter()
            .filter(|e| !self.caught.contains(e.key()))
            .cloned()
            .collect();
        Finished {
            deps: Dependencies::new(self.requested, self.groups),
            missing: self.missing,
            failed: self.failed,
            uncaught,
        }
    }
}

/// Values of a batch request, in request order.
#[derive(Debug, Clone)]
pub struct DependencyValues {
    entries: Vec<(Key, Option<Value>)>,
}

impl DependencyValues {
    pub fn get(&self, key: &Key) -> Option<&Value> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .and_then(|(_, v)| v.as_ref())
    }

    /// True if every requested key has a value.
    pub fn is_complete(&self) -> bool {
        self.entries.iter().all(|(_, v)| v.is_some())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Key, Option<&Value>)> + '_ {
        self.entries.iter().map(|(k, v)| (k, v.as_ref()))
    }

    /// All values in request order, if every one is present.
    pub fn values(&self) -> Option<Vec<Value>> {
        self.entries.iter().map(|(_, v)| v.clone()).collect()
    }
}
