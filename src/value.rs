//! Type-erased node values.

use std::any::Any;
use std::fmt::{self, Debug};
use std::sync::Arc;

/// Object-safe view of a computed value.
///
/// Implemented for every `PartialEq + Debug + Send + Sync + 'static` type.
/// Equality across trait objects is what drives change pruning, so it must
/// be a faithful equivalence on the concrete type.
pub trait ValueData: Any + Debug + Send + Sync {
    fn as_any(&self) -> &dyn Any;

    /// Returns `true` if `other` has the same concrete type and is equal.
    fn value_eq(&self, other: &dyn ValueData) -> bool;

    fn type_name(&self) -> &'static str;
}

impl<T: PartialEq + Debug + Send + Sync + 'static> ValueData for T {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn value_eq(&self, other: &dyn ValueData) -> bool {
        other.as_any().downcast_ref::<T>().is_some_and(|o| self == o)
    }

    fn type_name(&self) -> &'static str {
        std::any::type_name::<T>()
    }
}

/// Immutable, shareable result of a compute function.
#[derive(Clone)]
pub struct Value(Arc<dyn ValueData>);

impl Value {
    pub fn new<T: PartialEq + Debug + Send + Sync + 'static>(value: T) -> Self {
        Self(Arc::new(value))
    }

    /// Wrap an already shared value without copying it.
    pub fn from_arc<T: PartialEq + Debug + Send + Sync + 'static>(value: Arc<T>) -> Self {
        Self(value)
    }

    pub fn downcast_ref<T: 'static>(&self) -> Option<&T> {
        self.0.as_any().downcast_ref()
    }

    pub fn is<T: 'static>(&self) -> bool {
        self.downcast_ref::<T>().is_some()
    }

    pub fn type_name(&self) -> &'static str {
        self.0.type_name()
    }

    /// Returns `true` if both values share one allocation.
    pub fn ptr_eq(&self, other: &Value) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other) || self.0.value_eq(&*other.0)
    }
}

impl Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        Debug::fmt(&*self.0, f)
    }
}
