//! Key types identifying units of computation.

use std::any::{Any, TypeId};
use std::fmt::{self, Debug, Display};
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use dyn_hash::DynHash;

/// Object-safe equality comparison.
///
/// Two trait objects compare equal only when they share a concrete type and
/// that type's `Eq` says so.
pub trait DynEq: Any {
    /// Returns `true` if `other` is the same concrete type and equal to `self`.
    fn dyn_eq(&self, other: &dyn Any) -> bool;
}

impl<T: Eq + 'static> DynEq for T {
    fn dyn_eq(&self, other: &dyn Any) -> bool {
        other.downcast_ref::<T>().is_some_and(|o| self == o)
    }
}

/// Trait for types usable as a key argument.
///
/// Implemented for every `Hash + Eq + Debug + Send + Sync + 'static` type, and
/// object-safe so arguments can be stored as `Arc<dyn CacheKey>`.
pub trait CacheKey: DynHash + DynEq + Debug + Send + Sync {
    /// Get the argument as `Any` for downcasting.
    fn as_any(&self) -> &dyn Any;

    /// Get the type name of the argument.
    fn type_name(&self) -> &'static str;
}

impl<T: Hash + Eq + Debug + Send + Sync + 'static> CacheKey for T {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn type_name(&self) -> &'static str {
        std::any::type_name::<T>()
    }
}

dyn_hash::hash_trait_object!(CacheKey);

/// Names the compute function responsible for a family of keys.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FunctionTag(&'static str);

impl FunctionTag {
    pub const fn new(name: &'static str) -> Self {
        Self(name)
    }

    pub fn name(&self) -> &'static str {
        self.0
    }
}

impl Debug for FunctionTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.0)
    }
}

impl Display for FunctionTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.0)
    }
}

/// Identity of one unit of computation: a function tag plus an argument.
///
/// Keys are immutable and cheap to clone. Equality and hashing cover the tag,
/// the argument's concrete type and the argument's value, so two keys that
/// print the same but carry differently-typed arguments are distinct.
#[derive(Clone)]
pub struct Key {
    tag: FunctionTag,
    argument_type: TypeId,
    argument: Arc<dyn CacheKey>,
}

impl Key {
    pub fn new<A: CacheKey + 'static>(tag: FunctionTag, argument: A) -> Self {
        Self {
            tag,
            argument_type: TypeId::of::<A>(),
            argument: Arc::new(argument),
        }
    }

    pub fn tag(&self) -> FunctionTag {
        self.tag
    }

    /// Downcast the argument to its original type.
    pub fn argument<A: 'static>(&self) -> Option<&A> {
        self.argument.as_any().downcast_ref()
    }

    /// Get a reference to the type-erased argument.
    pub fn argument_dyn(&self) -> &Arc<dyn CacheKey> {
        &self.argument
    }

    pub fn argument_type_name(&self) -> &'static str {
        self.argument.type_name()
    }

    /// Get the debug representation of this key, `tag(argument)`.
    pub fn debug_repr(&self) -> String {
        format!("{:?}", self)
    }
}

impl Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({:?})", self.tag, self.argument)
    }
}

impl Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        Debug::fmt(self, f)
    }
}

impl Hash for Key {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.tag.hash(state);
        self.argument_type.hash(state);
        self.argument.hash(state);
    }
}

impl PartialEq for Key {
    fn eq(&self, other: &Self) -> bool {
        self.tag == other.tag
            && self.argument_type == other.argument_type
            && (Arc::ptr_eq(&self.argument, &other.argument)
                || self.argument.dyn_eq(other.argument.as_any()))
    }
}

impl Eq for Key {}

/// Convenience trait for types used as key arguments or projection
/// discriminators: `Hash + Eq + Clone + Debug + Send + Sync + 'static`.
pub trait Cachable: Hash + Eq + Clone + Debug + Send + Sync + 'static {}
impl<T: Hash + Eq + Clone + Debug + Send + Sync + 'static> Cachable for T {}
