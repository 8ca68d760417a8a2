//! Listener hooks for observing evaluation.
//!
//! The engine logs through `tracing` on its own; an [`EvaluationListener`] is
//! for callers that want structured events, such as tests counting compute
//! calls or tools building a progress display.
//!
//! ```ignore
//! struct Progress(AtomicUsize);
//!
//! impl EvaluationListener for Progress {
//!     fn on_node_done(&self, _key: &Key, _outcome: NodeOutcome) {
//!         self.0.fetch_add(1, Ordering::Relaxed);
//!     }
//! }
//!
//! let evaluator = Evaluator::builder().listener(Progress(AtomicUsize::new(0))).build()?;
//! ```

use crate::invalidation::InvalidationReason;
use crate::key::Key;

/// How a node left the `Evaluating` state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeOutcome {
    /// Computed a value different from the previous one.
    Changed,
    /// Computed a value equal to the previous one; dependents are not dirtied.
    Unchanged,
    /// Dependencies verified unchanged; the function did not run.
    Verified,
    /// Finished with an error.
    Failed,
    /// Evaluation was abandoned by cancellation.
    Cancelled,
}

/// Observer of evaluation events.
///
/// All methods have default empty implementations. Implementations must be
/// `Send + Sync` as they are called from worker threads concurrently.
pub trait EvaluationListener: Send + Sync + 'static {
    /// A compute function is about to run. `attempt` starts at 1 and counts
    /// restarts within one evaluation.
    #[inline]
    fn on_compute(&self, _key: &Key, _attempt: u32) {}

    /// A compute function suspended on missing dependencies.
    #[inline]
    fn on_restart(&self, _key: &Key, _missing: &[Key]) {}

    #[inline]
    fn on_node_done(&self, _key: &Key, _outcome: NodeOutcome) {}

    /// A node was marked dirty by an invalidation pass.
    #[inline]
    fn on_dirty(&self, _key: &Key, _reason: &InvalidationReason) {}

    /// A cycle was detected. `path` starts and ends with the same key.
    #[inline]
    fn on_cycle(&self, _path: &[Key]) {}
}

/// Listener that ignores every event. The default for
/// [`Evaluator`](crate::Evaluator).
pub struct NoopListener;

impl EvaluationListener for NoopListener {}
