//! Error types for evaluation.

use std::fmt;
use std::marker::PhantomData;
use std::ops::Deref;
use std::sync::Arc;

use crate::key::{FunctionTag, Key};

/// What a compute function may return instead of a value.
///
/// Any `Into<anyhow::Error>` converts into [`ComputeError::Failed`], so `?`
/// works on ordinary fallible code inside a compute function.
#[derive(Debug, Clone)]
pub enum ComputeError {
    /// Some requested dependency is not ready yet. The function will be
    /// restarted from the beginning once everything it asked for is done.
    Incomplete,

    /// The computation itself failed. The error is cached like a value.
    Failed(Arc<anyhow::Error>),

    /// A dependency's error, rethrown as-is.
    Dependency(EvaluationError),

    /// The evaluation this function belongs to was cancelled. Nothing is
    /// recorded for the node.
    Cancelled,
}

impl fmt::Display for ComputeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ComputeError::Incomplete => write!(f, "dependencies missing"),
            ComputeError::Failed(e) => write!(f, "computation failed: {}", e),
            ComputeError::Dependency(e) => write!(f, "dependency failed: {}", e),
            ComputeError::Cancelled => write!(f, "evaluation cancelled"),
        }
    }
}

impl<T: Into<anyhow::Error>> From<T> for ComputeError {
    fn from(err: T) -> Self {
        ComputeError::Failed(Arc::new(err.into()))
    }
}

/// The error recorded on a node that finished without a value.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{key}: {kind}")]
pub struct EvaluationError {
    key: Key,
    kind: ErrorKind,
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum ErrorKind {
    #[error("{0}")]
    Computation(Arc<anyhow::Error>),

    #[error("dependency failed: {0}")]
    Dependency(#[source] Box<EvaluationError>),

    #[error("dependency cycle: {}", format_path(.path))]
    Cycle { path: Vec<Key> },

    #[error("no compute function registered for `{0}`")]
    UnregisteredFunction(FunctionTag),

    #[error("compute function panicked: {0}")]
    Panicked(String),
}

fn format_path(path: &[Key]) -> String {
    path.iter()
        .map(Key::debug_repr)
        .collect::<Vec<_>>()
        .join(" -> ")
}

impl EvaluationError {
    pub fn new(key: Key, kind: ErrorKind) -> Self {
        Self { key, kind }
    }

    /// The key whose node carries this error.
    pub fn key(&self) -> &Key {
        &self.key
    }

    pub fn kind(&self) -> &ErrorKind {
        &self.kind
    }

    /// Follow `Dependency` links down to the node where the failure started.
    pub fn root_cause(&self) -> &EvaluationError {
        let mut current = self;
        while let ErrorKind::Dependency(inner) = &current.kind {
            current = inner;
        }
        current
    }

    /// The cycle this error originates from, if any.
    pub fn cycle_path(&self) -> Option<&[Key]> {
        match &self.root_cause().kind {
            ErrorKind::Cycle { path } => Some(path),
            _ => None,
        }
    }

    pub fn is_cycle(&self) -> bool {
        self.cycle_path().is_some()
    }

    /// The computation error this error originates from, if any.
    pub fn computation_error(&self) -> Option<&Arc<anyhow::Error>> {
        match &self.root_cause().kind {
            ErrorKind::Computation(e) => Some(e),
            _ => None,
        }
    }

    /// Attempts to downcast the originating computation error to `E`.
    pub fn downcast_ref<E: std::error::Error + Send + Sync + 'static>(&self) -> Option<&E> {
        self.computation_error().and_then(|e| e.downcast_ref::<E>())
    }

    /// Returns `true` if the originating computation error is an `E`.
    pub fn is<E: std::error::Error + Send + Sync + 'static>(&self) -> bool {
        self.downcast_ref::<E>().is_some()
    }
}

/// Result of a single-key request from outside the engine.
#[derive(Debug, Clone, thiserror::Error)]
pub enum RequestError {
    #[error(transparent)]
    Failed(#[from] EvaluationError),

    #[error("evaluation cancelled before completion")]
    Cancelled,
}

impl RequestError {
    pub fn evaluation_error(&self) -> Option<&EvaluationError> {
        match self {
            RequestError::Failed(e) => Some(e),
            RequestError::Cancelled => None,
        }
    }
}

/// Failures constructing an [`Evaluator`](crate::Evaluator).
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("failed to build worker pool: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),

    #[error("worker_threads must be at least 1")]
    NoWorkers,
}

/// A typed view of a dependency's computation error, dereferencing to `E`.
///
/// ```ignore
/// match env.get_value_or_catch::<ManifestError>(&manifest_key)? {
///     Ok(Some(manifest)) => { /* use it */ }
///     Ok(None) => return Err(ComputeError::Incomplete),
///     Err(e) => eprintln!("bad manifest at line {}", e.line),
/// }
/// ```
#[derive(Clone)]
pub struct TypedErr<E> {
    error: EvaluationError,
    _marker: PhantomData<E>,
}

impl<E: std::error::Error + Send + Sync + 'static> TypedErr<E> {
    pub(crate) fn new(error: EvaluationError) -> Option<Self> {
        error.is::<E>().then_some(Self {
            error,
            _marker: PhantomData,
        })
    }

    pub fn get(&self) -> &E {
        // Checked in `new`.
        self.error
            .downcast_ref::<E>()
            .expect("TypedErr holds an error of type E")
    }

    /// The full evaluation error, including the failing key.
    pub fn evaluation_error(&self) -> &EvaluationError {
        &self.error
    }

    pub fn into_inner(self) -> EvaluationError {
        self.error
    }
}

impl<E: std::error::Error + Send + Sync + 'static> Deref for TypedErr<E> {
    type Target = E;

    fn deref(&self) -> &E {
        self.get()
    }
}

impl<E: std::error::Error + Send + Sync + 'static> fmt::Debug for TypedErr<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self.get(), f)
    }
}

impl<E: std::error::Error + Send + Sync + 'static> fmt::Display for TypedErr<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self.get(), f)
    }
}

/// Extension trait for splitting a typed computation error out of a result.
pub trait EvaluationResultExt<T> {
    /// - `Ok(Ok(value))`: success
    /// - `Ok(Err(typed))`: failed with a computation error of type `E`
    /// - `Err(error)`: any other failure
    fn downcast_err<E: std::error::Error + Send + Sync + 'static>(
        self,
    ) -> Result<Result<T, TypedErr<E>>, EvaluationError>;
}

impl<T> EvaluationResultExt<T> for Result<T, EvaluationError> {
    fn downcast_err<E: std::error::Error + Send + Sync + 'static>(
        self,
    ) -> Result<Result<T, TypedErr<E>>, EvaluationError> {
        match self {
            Ok(value) => Ok(Ok(value)),
            Err(error) => match TypedErr::new(error.clone()) {
                Some(typed) => Ok(Err(typed)),
                None => Err(error),
            },
        }
    }
}
