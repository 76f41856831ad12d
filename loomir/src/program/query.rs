//! Read-only queries over a [`ProgramUnit`]: attribute scans, hierarchy
//! walks and generic member resolution.
use std::collections::BTreeSet;

use smallvec::SmallVec;

use crate::{
    program::{FieldRef, MOVE_NEXT, MethodDef, MethodId, MethodKind, MethodRef, ProgramUnit, TypeId, TypeDef, FieldId},
    types::Typeref,
    utils::Error,
};

/// A type carrying one of the requested attributes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AttributedType {
    pub ty: TypeId,
    /// Index of the attribute in the type's attribute list.
    pub attribute: usize,
}

/// A method carrying one of the requested attributes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AttributedMethod {
    pub method: MethodId,
    /// Continuation method when `method` was lowered into a state machine.
    pub async_method: Option<MethodId>,
    /// Index of the attribute in the method's attribute list.
    pub attribute: usize,
}

/// Pre-order walk over a type and everything it derives from or implements.
///
/// The walk keeps an explicit stack: the most derived type comes first, then
/// its base type (and the base's own ancestors), then its interfaces. Every
/// ancestor is yielded as seen from the starting instantiation, so generic
/// arguments flow down the hierarchy. A type reachable through several paths
/// is yielded once.
pub struct Hierarchy<'a> {
    unit: &'a ProgramUnit,
    stack: Vec<Typeref>,
    visited: BTreeSet<Typeref>,
}

impl Iterator for Hierarchy<'_> {
    type Item = Typeref;

    fn next(&mut self) -> Option<Self::Item> {
        while let Some(current) = self.stack.pop() {
            if !self.visited.insert(current) {
                continue;
            }

            if let Some(def) = self.unit.type_of_ref(current).and_then(|id| self.unit.type_def(id)) {
                let args = self.unit.registry.generic_args(current);
                for interface in def.interfaces.iter().rev() {
                    self.stack.push(self.unit.registry.substitute(*interface, &args, &[]));
                }
                if let Some(base) = def.base_type {
                    self.stack.push(self.unit.registry.substitute(base, &args, &[]));
                }
            }

            return Some(current);
        }
        None
    }
}

impl ProgramUnit {
    /// Types carrying an attribute whose type is in `attr_types`, in
    /// definition order, one entry per matching attribute.
    pub fn find_types_by_attributes(&self, attr_types: &[TypeId]) -> Vec<AttributedType> {
        self.types()
            .flat_map(|(ty, def)| {
                def.attributes
                    .iter()
                    .enumerate()
                    .filter(|(_, attr)| attr_types.contains(&attr.attribute_type))
                    .map(move |(attribute, _)| AttributedType { ty, attribute })
            })
            .collect()
    }

    /// Methods carrying an attribute whose type is in `attr_types`, in
    /// definition order (types, then methods, then attributes), together
    /// with their continuation method when they have one.
    pub fn find_methods_by_attributes(&self, attr_types: &[TypeId]) -> Vec<AttributedMethod> {
        let mut found = Vec::new();
        for (ty, _) in self.types() {
            for (method, def) in self.methods_of(ty) {
                for (attribute, attr) in def.attributes.iter().enumerate() {
                    if attr_types.contains(&attr.attribute_type) {
                        found.push(AttributedMethod {
                            method,
                            async_method: self.async_method(method),
                            attribute,
                        });
                    }
                }
            }
        }
        found
    }

    /// Walk the hierarchy of `ty`, starting with `ty` itself.
    pub fn hierarchy(&self, ty: Typeref) -> Hierarchy<'_> {
        Hierarchy {
            unit: self,
            stack: vec![ty],
            visited: BTreeSet::new(),
        }
    }

    /// Whether `ty` is, derives from or implements the type named
    /// `full_name`.
    pub fn implements(&self, ty: TypeId, full_name: &str) -> bool {
        let Ok(start) = self.self_instance(ty) else {
            return false;
        };
        self.hierarchy(start)
            .any(|t| self.registry.full_name(t).as_deref() == Some(full_name))
    }

    /// Same as [`Self::implements`] for a type reference.
    pub fn ref_implements(&self, ty: Typeref, full_name: &str) -> bool {
        self.hierarchy(ty)
            .any(|t| self.registry.full_name(t).as_deref() == Some(full_name))
    }

    /// Instantiation of `declaring` as seen from `instantiating`, i.e. the
    /// first entry of the hierarchy of `instantiating` whose definition is
    /// `declaring`.
    pub fn instantiation_of(&self, declaring: TypeId, instantiating: Typeref) -> Option<Typeref> {
        let name = &self.type_def(declaring)?.full_name;
        self.hierarchy(instantiating)
            .find(|t| self.registry.full_name(*t).as_deref() == Some(name.as_str()))
    }

    /// Resolve a type used by a member of `declaring` against the concrete
    /// `instantiating` type. Parameters that cannot be matched stay open.
    pub fn resolve_type(&self, ty: Typeref, declaring: TypeId, instantiating: Typeref) -> Typeref {
        match self.instantiation_of(declaring, instantiating) {
            Some(instance) => {
                let args = self.registry.generic_args(instance);
                self.registry.substitute(ty, &args, &[])
            }
            None => ty,
        }
    }

    /// Reference to `field` seen from `instantiating`, or from the
    /// self-instantiation of its declaring type when `None`.
    pub fn field_ref(&self, field: FieldId, instantiating: Option<Typeref>) -> Result<FieldRef, Error> {
        let def = self.field(field).ok_or(Error::InvalidHandle { kind: "field" })?;
        let declaring = self.declaring_instance(def.declaring_type, instantiating)?;
        Ok(FieldRef { field, declaring })
    }

    /// Reference to `method` seen from `instantiating`, or from the
    /// self-instantiation of its declaring type when `None`.
    pub fn method_ref(&self, method: MethodId, instantiating: Option<Typeref>) -> Result<MethodRef, Error> {
        let def = self.method(method).ok_or(Error::InvalidHandle { kind: "method" })?;
        let declaring = self.declaring_instance(def.declaring_type, instantiating)?;
        Ok(MethodRef {
            method,
            declaring,
            generic_args: SmallVec::new(),
        })
    }

    fn declaring_instance(&self, declaring: TypeId, instantiating: Option<Typeref>) -> Result<Typeref, Error> {
        match instantiating.and_then(|t| self.instantiation_of(declaring, t)) {
            Some(instance) => Ok(instance),
            None => self.self_instance(declaring),
        }
    }

    /// Field type as seen through a reference.
    pub fn field_type(&self, field: &FieldRef) -> Result<Typeref, Error> {
        let def = self.field(field.field).ok_or(Error::InvalidHandle { kind: "field" })?;
        let args = self.registry.generic_args(field.declaring);
        Ok(self.registry.substitute(def.field_type, &args, &[]))
    }

    /// Parameter types and return type of a method as seen through a
    /// reference.
    pub fn signature(&self, method: &MethodRef) -> Result<(SmallVec<[Typeref; 4]>, Typeref), Error> {
        let def = self.method(method.method).ok_or(Error::InvalidHandle { kind: "method" })?;
        let args = self.registry.generic_args(method.declaring);
        let params = def
            .params
            .iter()
            .map(|p| self.registry.substitute(p.ty, &args, &method.generic_args))
            .collect();
        let ret = self.registry.substitute(def.return_type, &args, &method.generic_args);
        Ok((params, ret))
    }

    /// Continuation method of an asynchronous method.
    pub fn async_method(&self, method: MethodId) -> Option<MethodId> {
        let machine = self.method(method)?.async_state_machine?;
        self.methods_of(machine)
            .find(|(_, def)| def.name == MOVE_NEXT)
            .map(|(id, _)| id)
    }

    /// The type that owns the source of `ty`: the declaring type of the
    /// asynchronous method for a state machine, `ty` itself otherwise.
    pub fn origin_type(&self, ty: TypeId) -> TypeId {
        self.type_def(ty)
            .and_then(|def| def.state_machine_of)
            .and_then(|m| self.method(m))
            .map_or(ty, |def| def.declaring_type)
    }

    pub fn field_by_name(&self, ty: TypeId, name: &str) -> Option<FieldId> {
        self.fields_of(ty).find(|(_, def)| def.name == name).map(|(id, _)| id)
    }

    /// First method of `ty` named `name` with `param_count` parameters.
    pub fn method_by_name(&self, ty: TypeId, name: &str, param_count: usize) -> Option<MethodId> {
        self.methods_of(ty)
            .find(|(_, def)| def.name == name && def.params.len() == param_count)
            .map(|(id, _)| id)
    }

    /// Search `name`/`param_count` in `ty` and then its base types.
    pub fn find_method_in_hierarchy(&self, ty: TypeId, name: &str, param_count: usize) -> Option<MethodId> {
        let start = self.self_instance(ty).ok()?;
        self.hierarchy(start)
            .filter_map(|t| self.type_of_ref(t))
            .find_map(|t| self.method_by_name(t, name, param_count))
    }

    /// Instance constructors in declaration order.
    pub fn constructors(&self, ty: TypeId) -> Vec<MethodId> {
        self.methods_of(ty)
            .filter(|(_, def)| def.kind == MethodKind::Constructor)
            .map(|(id, _)| id)
            .collect()
    }

    pub fn static_constructor(&self, ty: TypeId) -> Option<MethodId> {
        self.methods_of(ty)
            .find(|(_, def)| def.kind == MethodKind::StaticConstructor)
            .map(|(id, _)| id)
    }

    /// Return the type initializer of `ty`, adding an empty one when the type
    /// has none.
    pub fn get_or_create_static_constructor(&mut self, ty: TypeId) -> Result<MethodId, Error> {
        if let Some(existing) = self.static_constructor(ty) {
            return Ok(existing);
        }

        let mut body = crate::body::MethodBody::new();
        body.push(crate::body::Instr::Ret);
        let def = MethodDef::static_constructor().with_body(body);
        log::debug!(
            "Creating a type initializer for `{}`",
            self.type_def(ty).map_or("<unknown>", |t| t.full_name.as_str())
        );
        self.add_method(ty, def)
    }

    /// Whether `ty` is the state machine of an asynchronous method.
    pub fn is_state_machine(&self, ty: TypeId) -> bool {
        self.type_def(ty).is_some_and(|def: &TypeDef| def.state_machine_of.is_some())
    }
}
