//! Compute functions and the tag registry.

use std::sync::Arc;

use papaya::HashMap;
use tracing::warn;

use crate::environment::Environment;
use crate::error::ComputeError;
use crate::key::{FunctionTag, Key};
use crate::value::Value;

/// Computes the value for keys of one tag.
///
/// A compute function may be abandoned and re-run from the start any number
/// of times, so it must not have side effects outside what it returns. When
/// [`Environment::values_missing`] is true after requesting dependencies, it
/// should return [`ComputeError::Incomplete`] (or propagate the error from
/// [`Environment::value`]) and will be called again once they are ready.
pub trait ComputeFunction: Send + Sync + 'static {
    fn compute(&self, key: &Key, env: &mut Environment<'_>) -> Result<Value, ComputeError>;
}

/// Adapter running a closure as a [`ComputeFunction`].
pub struct FnFunction<F>(pub F);

impl<F> ComputeFunction for FnFunction<F>
where
    F: Fn(&Key, &mut Environment<'_>) -> Result<Value, ComputeError> + Send + Sync + 'static,
{
    fn compute(&self, key: &Key, env: &mut Environment<'_>) -> Result<Value, ComputeError> {
        (self.0)(key, env)
    }
}

/// Map from tag to compute function.
pub(crate) struct FunctionRegistry {
    functions: HashMap<FunctionTag, Arc<dyn ComputeFunction>, ahash::RandomState>,
}

impl Default for FunctionRegistry {
    fn default() -> Self {
        Self {
            functions: HashMap::with_hasher(ahash::RandomState::new()),
        }
    }
}

impl FunctionRegistry {
    pub fn register(&self, tag: FunctionTag, function: Arc<dyn ComputeFunction>) {
        if self.functions.pin().insert(tag, function).is_some() {
            warn!(tag = %tag, "replaced previously registered compute function");
        }
    }

    pub fn get(&self, tag: FunctionTag) -> Option<Arc<dyn ComputeFunction>> {
        self.functions.pin().get(&tag).cloned()
    }

    pub fn contains(&self, tag: FunctionTag) -> bool {
        self.functions.pin().contains_key(&tag)
    }
}
