//! Program units
//!
//! A [`ProgramUnit`] is the in-memory view of one compiled unit: every type
//! definition (plus metadata stubs for the external types it refers to),
//! their methods and fields, and the [`TypeRegistry`] interning the type
//! signatures used by all of them.
//!
//! Definitions live in slot maps and are addressed by [`TypeId`],
//! [`MethodId`] and [`FieldId`]. Handles stay valid across unrelated
//! insertions and removals, and a handle whose element was removed is simply
//! rejected by lookups.
use std::collections::BTreeMap;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use slotmap::{SlotMap, new_key_type};
use smallvec::SmallVec;
use uuid::Uuid;

use crate::{
    types::{GenericScope, TypeRegistry, Typeref},
    utils::Error,
};

pub use attribute::{AttributeArg, CustomAttribute, NamedArg};
pub use member::{FieldDef, MethodDef, MethodKind, Modifiers, Parameter, TypeDef, TypeKind, TypeOrigin};
pub use query::{AttributedMethod, AttributedType, Hierarchy};

pub mod attribute;
pub mod member;
pub mod query;

new_key_type! {
    /// Handle of a [`TypeDef`].
    pub struct TypeId;
    /// Handle of a [`MethodDef`].
    pub struct MethodId;
    /// Handle of a [`FieldDef`].
    pub struct FieldId;
}

/// Name of the continuation method of a compiler-generated state machine.
pub const MOVE_NEXT: &str = "MoveNext";

/// A field as seen from a (possibly generic) declaring type instantiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct FieldRef {
    pub field: FieldId,
    pub declaring: Typeref,
}

/// A method as seen from a (possibly generic) declaring type instantiation.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct MethodRef {
    pub method: MethodId,
    pub declaring: Typeref,
    pub generic_args: SmallVec<[Typeref; 2]>,
}

#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct ProgramUnit {
    pub name: String,
    /// Module version identifier, regenerated whenever the unit is rewritten.
    pub mvid: Uuid,
    pub registry: TypeRegistry,
    types: SlotMap<TypeId, TypeDef>,
    methods: SlotMap<MethodId, MethodDef>,
    fields: SlotMap<FieldId, FieldDef>,
    /// Definition order of the types.
    type_order: Vec<TypeId>,
    type_names: BTreeMap<String, TypeId>,
}

impl ProgramUnit {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            mvid: Uuid::new_v4(),
            registry: TypeRegistry::new(),
            types: SlotMap::with_key(),
            methods: SlotMap::with_key(),
            fields: SlotMap::with_key(),
            type_order: Vec::new(),
            type_names: BTreeMap::new(),
        }
    }

    /// Add a type definition. Its method and field lists are expected to be
    /// empty; members are added through [`Self::add_method`] and
    /// [`Self::add_field`].
    pub fn add_type(&mut self, def: TypeDef) -> Result<TypeId, Error> {
        if self.type_names.contains_key(&def.full_name) {
            return Err(Error::DuplicateType {
                name: def.full_name,
            });
        }

        self.registry.named(def.full_name.clone(), def.is_value_type());
        let name = def.full_name.clone();
        let id = self.types.insert(def);
        self.type_order.push(id);
        self.type_names.insert(name, id);
        Ok(id)
    }

    pub fn add_method(&mut self, ty: TypeId, mut def: MethodDef) -> Result<MethodId, Error> {
        let owner = self
            .types
            .get_mut(ty)
            .ok_or(Error::InvalidHandle { kind: "type" })?;
        def.declaring_type = ty;
        let id = self.methods.insert(def);
        owner.methods.push(id);
        Ok(id)
    }

    pub fn add_field(&mut self, ty: TypeId, mut def: FieldDef) -> Result<FieldId, Error> {
        let owner = self
            .types
            .get_mut(ty)
            .ok_or(Error::InvalidHandle { kind: "type" })?;
        def.declaring_type = ty;
        let id = self.fields.insert(def);
        owner.fields.push(id);
        Ok(id)
    }

    /// Remove a method from the unit. Returns the removed definition.
    pub fn remove_method(&mut self, method: MethodId) -> Result<MethodDef, Error> {
        let def = self
            .methods
            .remove(method)
            .ok_or(Error::InvalidHandle { kind: "method" })?;
        if let Some(owner) = self.types.get_mut(def.declaring_type) {
            owner.methods.retain(|m| *m != method);
        }
        Ok(def)
    }

    pub fn type_def(&self, ty: TypeId) -> Option<&TypeDef> {
        self.types.get(ty)
    }

    pub fn type_def_mut(&mut self, ty: TypeId) -> Option<&mut TypeDef> {
        self.types.get_mut(ty)
    }

    pub fn method(&self, method: MethodId) -> Option<&MethodDef> {
        self.methods.get(method)
    }

    pub fn method_mut(&mut self, method: MethodId) -> Option<&mut MethodDef> {
        self.methods.get_mut(method)
    }

    pub fn field(&self, field: FieldId) -> Option<&FieldDef> {
        self.fields.get(field)
    }

    pub fn field_mut(&mut self, field: FieldId) -> Option<&mut FieldDef> {
        self.fields.get_mut(field)
    }

    /// Types in definition order.
    pub fn types(&self) -> impl Iterator<Item = (TypeId, &TypeDef)> + '_ {
        self.type_order
            .iter()
            .filter_map(|id| self.types.get(*id).map(|def| (*id, def)))
    }

    /// Methods of a type in declaration order.
    pub fn methods_of(&self, ty: TypeId) -> impl Iterator<Item = (MethodId, &MethodDef)> + '_ {
        self.types
            .get(ty)
            .into_iter()
            .flat_map(|def| def.methods.iter())
            .filter_map(|id| self.methods.get(*id).map(|def| (*id, def)))
    }

    /// Fields of a type in declaration order.
    pub fn fields_of(&self, ty: TypeId) -> impl Iterator<Item = (FieldId, &FieldDef)> + '_ {
        self.types
            .get(ty)
            .into_iter()
            .flat_map(|def| def.fields.iter())
            .filter_map(|id| self.fields.get(*id).map(|def| (*id, def)))
    }

    pub fn type_by_name(&self, full_name: &str) -> Option<TypeId> {
        self.type_names.get(full_name).copied()
    }

    /// Definition behind a type reference, looking through generic instances.
    pub fn type_of_ref(&self, typeref: Typeref) -> Option<TypeId> {
        let name = self.registry.full_name(typeref)?;
        self.type_by_name(&name)
    }

    /// Open type reference of a definition (`List`1`, not `List`1<!T>`).
    pub fn type_ref(&self, ty: TypeId) -> Result<Typeref, Error> {
        let def = self.types.get(ty).ok_or(Error::InvalidHandle { kind: "type" })?;
        Ok(self.registry.named(def.full_name.clone(), def.is_value_type()))
    }

    /// Self-instantiation of a definition: the open reference for non generic
    /// types, `Name<!0, .., !n>` otherwise.
    pub fn self_instance(&self, ty: TypeId) -> Result<Typeref, Error> {
        let base = self.type_ref(ty)?;
        let def = &self.types[ty];
        if def.generic_params.is_empty() {
            return Ok(base);
        }

        let args: SmallVec<[Typeref; 2]> = def
            .generic_params
            .iter()
            .enumerate()
            .map(|(position, name)| {
                self.registry
                    .generic_param(GenericScope::Type, position as u16, name.clone())
            })
            .collect();
        Ok(self.registry.instance(base, args))
    }

    /// `Namespace.Type::Method`, used in messages.
    pub fn method_display(&self, method: MethodId) -> String {
        match self.methods.get(method) {
            Some(def) => {
                let owner = self
                    .types
                    .get(def.declaring_type)
                    .map_or("<unknown>", |t| t.full_name.as_str());
                format!("{}::{}", owner, def.name)
            }
            None => "<removed method>".to_string(),
        }
    }

    /// `Namespace.Type::Method(i32, System.String)`, used in progress logs.
    pub fn method_signature(&self, method: MethodId) -> String {
        let Some(def) = self.methods.get(method) else {
            return self.method_display(method);
        };
        let params = def
            .params
            .iter()
            .map(|p| self.registry.fmt(p.ty).to_string())
            .collect::<Vec<_>>()
            .join(", ");
        format!("{}({})", self.method_display(method), params)
    }

    /// Number of types, including external stubs.
    pub fn type_count(&self) -> usize {
        self.types.len()
    }

    /// Number of live methods.
    pub fn method_count(&self) -> usize {
        self.methods.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_type_names_are_rejected() {
        let mut unit = ProgramUnit::new("test");
        unit.add_type(TypeDef::new("A.B", TypeKind::Class)).unwrap();
        let err = unit.add_type(TypeDef::new("A.B", TypeKind::Class)).unwrap_err();
        assert_eq!(err, Error::DuplicateType { name: "A.B".into() });
    }

    #[test]
    fn removed_methods_leave_their_type() {
        let mut unit = ProgramUnit::new("test");
        let ty = unit.add_type(TypeDef::new("A.B", TypeKind::Class)).unwrap();
        let m1 = unit.add_method(ty, MethodDef::ordinary("M1", Typeref::VOID)).unwrap();
        let m2 = unit.add_method(ty, MethodDef::ordinary("M2", Typeref::VOID)).unwrap();

        unit.remove_method(m1).unwrap();
        assert!(unit.method(m1).is_none());
        assert_eq!(unit.methods_of(ty).map(|(id, _)| id).collect::<Vec<_>>(), vec![m2]);
        assert_eq!(unit.remove_method(m1).unwrap_err(), Error::InvalidHandle { kind: "method" });
    }

    #[test]
    fn self_instance_of_generic_type_uses_its_parameters() {
        let mut unit = ProgramUnit::new("test");
        let ty = unit
            .add_type(TypeDef::new("C.Box`1", TypeKind::Class).with_generic_params(["T"]))
            .unwrap();
        let inst = unit.self_instance(ty).unwrap();
        assert_eq!(unit.registry.fmt(inst).to_string(), "C.Box`1<!T>");
        assert_eq!(unit.type_of_ref(inst), Some(ty));
    }
}
