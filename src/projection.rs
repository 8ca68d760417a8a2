//! Projection functions: narrow views over a broad value.
//!
//! A projection reads one wide, frequently changing value and keeps only the
//! part selected by its discriminator. When the wide value changes in a way
//! that leaves the projected part equal, change pruning stops there and
//! consumers of the projection are not re-run.

use std::fmt::Debug;

use anyhow::anyhow;

use crate::environment::Environment;
use crate::error::ComputeError;
use crate::function::ComputeFunction;
use crate::key::{Cachable, Key};
use crate::value::Value;

pub trait Projection: Send + Sync + 'static {
    /// Selects which part of the source to keep; the projection key's argument.
    type Discriminator: Cachable;
    /// Value type stored under the source key.
    type Source: PartialEq + Debug + Send + Sync + 'static;
    type Output: PartialEq + Debug + Send + Sync + 'static;

    fn source_key(&self, discriminator: &Self::Discriminator) -> Key;

    fn project(
        &self,
        source: &Self::Source,
        discriminator: &Self::Discriminator,
    ) -> Result<Self::Output, ComputeError>;
}

/// Runs a [`Projection`] as a compute function. A source that is not ready
/// yields `Incomplete`; a failed source fails the projection with it.
pub struct ProjectionFunction<P> {
    projection: P,
}

impl<P: Projection> ProjectionFunction<P> {
    pub fn new(projection: P) -> Self {
        Self { projection }
    }
}

impl<P: Projection> ComputeFunction for ProjectionFunction<P> {
    fn compute(&self, key: &Key, env: &mut Environment<'_>) -> Result<Value, ComputeError> {
        let discriminator = key.argument::<P::Discriminator>().ok_or_else(|| {
            anyhow!(
                "{} is not keyed by {}",
                key,
                std::any::type_name::<P::Discriminator>()
            )
        })?;
        let source_key = self.projection.source_key(discriminator);
        let source = env.value(&source_key)?;
        let source = source.downcast_ref::<P::Source>().ok_or_else(|| {
            anyhow!(
                "{} holds {} rather than {}",
                source_key,
                source.type_name(),
                std::any::type_name::<P::Source>()
            )
        })?;
        let output = self.projection.project(source, discriminator)?;
        Ok(Value::new(output))
    }
}
