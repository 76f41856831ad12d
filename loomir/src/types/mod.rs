//! Types module
//!
//! This module contains the canonical representation of type references used
//! by the `loomir` crate. Type signatures are interned by a [`TypeRegistry`]
//! which hands out small, copyable [`Typeref`] handles:
//!
//! - Primitive types (see `primitive.rs`), interned first so that their
//!   handles are constants (e.g. [`Typeref::VOID`]).
//! - Named types, referring to a type definition by full name.
//! - Generic instances (`List<i32>`), open generic parameters (`!0`, `!!0`)
//!   and single-dimensional arrays.
//!
//! Substitution of open generic parameters ([`TypeRegistry::substitute`]) is
//! the primitive used by generic member resolution in
//! [`crate::program::ProgramUnit`].
use std::{
    collections::BTreeMap,
    hash::{DefaultHasher, Hash, Hasher},
};

use log::{debug, info};
use parking_lot::{MappedRwLockReadGuard, RwLock, RwLockReadGuard, RwLockUpgradableReadGuard};
#[cfg(feature = "serde")]
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use smallvec::{SmallVec, smallvec};
use strum::{EnumIs, IntoEnumIterator};

pub use primitive::Primitive;

pub mod primitive;

/// A stable reference to a type stored inside a [`TypeRegistry`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Typeref(u32);

impl Typeref {
    pub const VOID: Typeref = Typeref::of(Primitive::Void);
    pub const BOOL: Typeref = Typeref::of(Primitive::Bool);
    pub const I32: Typeref = Typeref::of(Primitive::I32);
    pub const I64: Typeref = Typeref::of(Primitive::I64);

    /// Handle of a primitive type. Valid in every registry.
    pub const fn of(primitive: Primitive) -> Typeref {
        Typeref(primitive as u32)
    }

    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl From<Primitive> for Typeref {
    fn from(value: Primitive) -> Self {
        Typeref::of(value)
    }
}

/// Whether a generic parameter belongs to a type or to a method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, EnumIs)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum GenericScope {
    Type,
    Method,
}

/// A type referred to by its full name (`Namespace.Name`).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct NamedType {
    pub full_name: String,
    pub value_type: bool,
}

/// A closed or partially closed instantiation of a generic type.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct GenericInstance {
    pub base: Typeref,
    pub args: SmallVec<[Typeref; 2]>,
}

/// An open generic parameter, identified by its scope and position.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct GenericParam {
    pub scope: GenericScope,
    pub position: u16,
    pub name: String,
}

/// A sum-type representing any type signature that can be interned.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, EnumIs)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum AnyType {
    Primitive(Primitive),
    Named(NamedType),
    GenericInstance(GenericInstance),
    GenericParam(GenericParam),
    /// Single-dimensional, zero-based array of the element type.
    Array(Typeref),
}

impl From<Primitive> for AnyType {
    fn from(value: Primitive) -> Self {
        AnyType::Primitive(value)
    }
}

#[derive(Default)]
struct RegistryInner {
    types: Vec<AnyType>,
    inverse_lookup: BTreeMap<u64, SmallVec<[Typeref; 1]>>,
}

impl RegistryInner {
    fn write_type(&self, typeref: Typeref, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.types.get(typeref.index()) {
            Some(AnyType::Primitive(primitive)) => write!(f, "{}", primitive),
            Some(AnyType::Named(named)) => write!(f, "{}", named.full_name),
            Some(AnyType::GenericInstance(instance)) => {
                self.write_type(instance.base, f)?;
                write!(f, "<")?;
                for (i, arg) in instance.args.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    self.write_type(*arg, f)?;
                }
                write!(f, ">")
            }
            Some(AnyType::GenericParam(param)) => match param.scope {
                GenericScope::Type => write!(f, "!{}", param.name),
                GenericScope::Method => write!(f, "!!{}", param.name),
            },
            Some(AnyType::Array(element)) => {
                self.write_type(*element, f)?;
                write!(f, "[]")
            }
            None => write!(f, "<unknown type #{}>", typeref.0),
        }
    }
}

/// A central registry that stores and deduplicates [`AnyType`] values.
///
/// The registry provides fast lookup by [`Typeref`] and ensures identical
/// type signatures map to the same handle. Insertion only needs a shared
/// reference, so code holding `&ProgramUnit` can still create the
/// instantiations it needs.
///
/// ```rust
/// # use loomir::types::{TypeRegistry, Typeref, Primitive};
/// let reg = TypeRegistry::new();
/// let list = reg.named("System.Collections.List`1", false);
/// let list_i32 = reg.instance(list, [Typeref::I32]);
/// assert_eq!(reg.instance(list, [Typeref::I32]), list_i32);
/// assert_eq!(reg.fmt(list_i32).to_string(), "System.Collections.List`1<i32>");
/// ```
pub struct TypeRegistry {
    inner: RwLock<RegistryInner>,
}

impl TypeRegistry {
    fn hash_ty(ty: &AnyType) -> u64 {
        let mut hasher = DefaultHasher::new();
        ty.hash(&mut hasher);
        hasher.finish()
    }

    /// Create a new registry holding the primitive types only.
    pub fn new() -> Self {
        Self::from_types(Primitive::iter().map(AnyType::Primitive).collect())
    }

    fn from_types(types: Vec<AnyType>) -> Self {
        let mut inverse_lookup: BTreeMap<u64, SmallVec<[Typeref; 1]>> = BTreeMap::new();
        for (index, ty) in types.iter().enumerate() {
            inverse_lookup
                .entry(Self::hash_ty(ty))
                .or_default()
                .push(Typeref(index as u32));
        }

        Self {
            inner: RwLock::new(RegistryInner {
                types,
                inverse_lookup,
            }),
        }
    }

    /// Number of interned types.
    pub fn len(&self) -> usize {
        self.inner.read().types.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Retrieve a borrowed [`AnyType`] for the given `typeref`.
    ///
    /// # A note on concurrency
    /// The returned guard keeps a read lock. You mustn't hold it while
    /// calling [`Self::search_or_insert`] (or any helper that interns), as the
    /// insertion needs to upgrade to a write lock.
    pub fn get(&self, typeref: Typeref) -> Option<MappedRwLockReadGuard<'_, AnyType>> {
        let guard = self.inner.read_recursive();
        RwLockReadGuard::try_map(guard, |inner| inner.types.get(typeref.index())).ok()
    }

    /// Same as [`Self::get`] but clones the type out, releasing the lock.
    pub fn get_cloned(&self, typeref: Typeref) -> Option<AnyType> {
        self.get(typeref).map(|ty| ty.clone())
    }

    /// Insert `ty` into the registry if an equivalent type doesn't already
    /// exist and return the [`Typeref`] for it.
    pub fn search_or_insert(&self, ty: AnyType) -> Typeref {
        let h = Self::hash_ty(&ty);

        let guard = self.inner.upgradable_read();
        if let Some(candidates) = guard.inverse_lookup.get(&h) {
            for typeref in candidates {
                if guard.types[typeref.index()] == ty {
                    return *typeref;
                }
            }
        }

        let mut guard = RwLockUpgradableReadGuard::upgrade(guard);
        let inner: &mut RegistryInner = &mut guard;
        let typeref = Typeref(inner.types.len() as u32);
        inner.types.push(ty);

        if let Some(list) = inner.inverse_lookup.get_mut(&h) {
            info!(
                "Detected a hash collision on hash 0x{:016x} ({} types share it)",
                h,
                list.len() + 1
            );
            list.push(typeref);
        } else {
            inner.inverse_lookup.insert(h, smallvec![typeref]);
        }

        debug!("New type registered as #{}", typeref.0);
        typeref
    }

    pub fn named(&self, full_name: impl Into<String>, value_type: bool) -> Typeref {
        self.search_or_insert(AnyType::Named(NamedType {
            full_name: full_name.into(),
            value_type,
        }))
    }

    pub fn instance(&self, base: Typeref, args: impl IntoIterator<Item = Typeref>) -> Typeref {
        self.search_or_insert(AnyType::GenericInstance(GenericInstance {
            base,
            args: args.into_iter().collect(),
        }))
    }

    pub fn generic_param(&self, scope: GenericScope, position: u16, name: impl Into<String>) -> Typeref {
        self.search_or_insert(AnyType::GenericParam(GenericParam {
            scope,
            position,
            name: name.into(),
        }))
    }

    pub fn array(&self, element: Typeref) -> Typeref {
        self.search_or_insert(AnyType::Array(element))
    }

    /// Full name of the named type behind `typeref`, looking through generic
    /// instances. Returns [`None`] for primitives, parameters and arrays.
    pub fn full_name(&self, typeref: Typeref) -> Option<String> {
        match self.get_cloned(typeref)? {
            AnyType::Named(named) => Some(named.full_name),
            AnyType::GenericInstance(instance) => self.full_name(instance.base),
            _ => None,
        }
    }

    /// Generic arguments of an instance, empty for any other type.
    pub fn generic_args(&self, typeref: Typeref) -> SmallVec<[Typeref; 2]> {
        match self.get(typeref).as_deref() {
            Some(AnyType::GenericInstance(instance)) => instance.args.clone(),
            _ => SmallVec::new(),
        }
    }

    /// Whether values of this type live inline (and must be boxed to become
    /// an object reference). Open generic parameters answer true since `box`
    /// is a no-op on reference types.
    pub fn needs_boxing(&self, typeref: Typeref) -> bool {
        match self.get_cloned(typeref) {
            Some(AnyType::Primitive(primitive)) => !primitive.is_void(),
            Some(AnyType::Named(named)) => named.value_type,
            Some(AnyType::GenericInstance(instance)) => self.needs_boxing(instance.base),
            Some(AnyType::GenericParam(_)) => true,
            Some(AnyType::Array(_)) | None => false,
        }
    }

    /// Substitute open generic parameters: type-scope parameters by
    /// `type_args`, method-scope ones by `method_args`. Parameters without a
    /// matching argument are left as themselves.
    pub fn substitute(&self, typeref: Typeref, type_args: &[Typeref], method_args: &[Typeref]) -> Typeref {
        let Some(ty) = self.get_cloned(typeref) else {
            return typeref;
        };

        match ty {
            AnyType::GenericParam(param) => {
                let args = match param.scope {
                    GenericScope::Type => type_args,
                    GenericScope::Method => method_args,
                };
                args.get(param.position as usize).copied().unwrap_or(typeref)
            }
            AnyType::GenericInstance(instance) => {
                let args: SmallVec<[Typeref; 2]> = instance
                    .args
                    .iter()
                    .map(|arg| self.substitute(*arg, type_args, method_args))
                    .collect();
                if args == instance.args {
                    typeref
                } else {
                    self.instance(instance.base, args)
                }
            }
            AnyType::Array(element) => {
                let substituted = self.substitute(element, type_args, method_args);
                if substituted == element {
                    typeref
                } else {
                    self.array(substituted)
                }
            }
            AnyType::Primitive(_) | AnyType::Named(_) => typeref,
        }
    }

    /// Format a given [`Typeref`] using this registry.
    pub fn fmt(&self, typeref: Typeref) -> impl std::fmt::Display + '_ {
        struct Fmt<'a> {
            registry: &'a TypeRegistry,
            typeref: Typeref,
        }

        impl std::fmt::Display for Fmt<'_> {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                let inner = self.registry.inner.read_recursive();
                inner.write_type(self.typeref, f)
            }
        }

        Fmt {
            registry: self,
            typeref,
        }
    }
}

impl Clone for TypeRegistry {
    fn clone(&self) -> Self {
        Self::from_types(self.inner.read().types.clone())
    }
}

impl std::fmt::Debug for TypeRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TypeRegistry")
            .field("types", &self.inner.read().types)
            .finish()
    }
}

#[cfg(feature = "serde")]
impl Serialize for TypeRegistry {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.inner.read().types.serialize(serializer)
    }
}

#[cfg(feature = "serde")]
impl<'de> Deserialize<'de> for TypeRegistry {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let types = Vec::<AnyType>::deserialize(deserializer)?;
        Ok(Self::from_types(types))
    }
}
