//! memograph: an incremental, memoized dependency-graph evaluation engine.
//!
//! Compute functions are registered per [`FunctionTag`] and read other keys
//! through an [`Environment`]. Every read is recorded as a dependency, so a
//! later evaluation re-runs only what an upstream change actually reaches.
//!
//! # Key Features
//!
//! - **Restart-based suspension**: a function that reads an unfinished key
//!   returns [`ComputeError::Incomplete`] and is re-run once the key is done
//! - **Change pruning**: an equal re-computed value stops propagation
//! - **Projections**: narrow slices of a broad value via [`Projection`]
//! - **Coalescing**: concurrent requests for one key share one evaluation
//! - **Cycle detection** and cooperative cancellation via [`CancellationToken`]
//! - **Remote cache contract** behind the `remote-cache` feature
//!
//! # Example
//!
//! ```ignore
//! use memograph::{Evaluator, FunctionTag, Key, Value};
//!
//! const SOURCE: FunctionTag = FunctionTag::new("source");
//! const LENGTH: FunctionTag = FunctionTag::new("length");
//!
//! let evaluator = Evaluator::new()?;
//! evaluator.register_fn(LENGTH, |key, env| {
//!     let name = key.argument::<String>().expect("keyed by a name");
//!     let text = env.value(&Key::new(SOURCE, name.clone()))?;
//!     Ok(Value::new(text.downcast_ref::<String>().map_or(0, String::len)))
//! });
//!
//! evaluator.inject(Key::new(SOURCE, "a".to_string()), Value::new("hello".to_string()));
//! let len = evaluator.evaluate_one(Key::new(LENGTH, "a".to_string()))?;
//! assert_eq!(len.downcast_ref::<usize>(), Some(&5));
//! ```

mod environment;
mod error;
mod evaluator;
mod function;
mod graph;
mod invalidation;
mod key;
pub mod listener;
mod node;
mod projection;
mod scheduler;
mod value;

#[cfg(feature = "remote-cache")]
pub mod remote;

pub use environment::{DependencyValues, Environment};
pub use error::{
    ComputeError, EngineError, ErrorKind, EvaluationError, EvaluationResultExt, RequestError,
    TypedErr,
};
pub use evaluator::{ErrorComparator, EvaluationResult, Evaluator, EvaluatorBuilder};
pub use function::{ComputeFunction, FnFunction};
pub use graph::{Graph, GraphInconsistency, GraphSnapshot, NodeSummary};
pub use invalidation::{InvalidationReason, InvalidationSummary};
pub use key::{Cachable, CacheKey, DynEq, FunctionTag, Key};
pub use listener::{EvaluationListener, NodeOutcome, NoopListener};
pub use node::{Dependencies, DirtyKind, NodeSnapshot, NodeState, Version};
pub use projection::{Projection, ProjectionFunction};
pub use value::{Value, ValueData};

pub use tokio_util::sync::CancellationToken;
