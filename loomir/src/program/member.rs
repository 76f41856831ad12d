//! Type, method and field definitions.
use bitflags::bitflags;
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use strum::{Display, EnumIs};

use crate::{
    body::MethodBody,
    program::{MethodId, TypeId, attribute::CustomAttribute},
    types::Typeref,
};

bitflags! {
    /// Access and storage modifiers shared by types, methods and fields.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    #[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
    pub struct Modifiers: u32 {
        const PUBLIC = 1 << 0;
        const PRIVATE = 1 << 1;
        const STATIC = 1 << 2;
        const VIRTUAL = 1 << 3;
        const ABSTRACT = 1 << 4;
        const SEALED = 1 << 5;
        /// Field may only be assigned from a constructor.
        const INIT_ONLY = 1 << 6;
        /// Field is skipped by serializers.
        const NOT_SERIALIZED = 1 << 7;
        /// Member was emitted by a compiler rather than written by a user.
        const COMPILER_GENERATED = 1 << 8;
    }
}

impl Modifiers {
    /// Modifiers for a private, non-serialized synthetic field.
    pub fn synthetic_field(is_static: bool) -> Self {
        let base = Modifiers::PRIVATE | Modifiers::NOT_SERIALIZED | Modifiers::COMPILER_GENERATED;
        if is_static {
            base | Modifiers::STATIC
        } else {
            base
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumIs, Display)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[strum(serialize_all = "lowercase")]
pub enum TypeKind {
    Class,
    Struct,
    Interface,
}

/// Whether a type is part of the unit being woven or only describes a
/// referenced type from another unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumIs)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum TypeOrigin {
    Defined,
    External,
}

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct TypeDef {
    pub full_name: String,
    pub kind: TypeKind,
    pub origin: TypeOrigin,
    pub modifiers: Modifiers,
    /// Names of the generic parameters, by position.
    pub generic_params: Vec<String>,
    pub base_type: Option<Typeref>,
    pub interfaces: Vec<Typeref>,
    pub methods: Vec<MethodId>,
    pub fields: Vec<crate::program::FieldId>,
    pub attributes: Vec<CustomAttribute>,
    /// Set on the synthetic state machine produced for an asynchronous
    /// method; points back at that method.
    pub state_machine_of: Option<MethodId>,
}

impl TypeDef {
    pub fn new(full_name: impl Into<String>, kind: TypeKind) -> Self {
        Self {
            full_name: full_name.into(),
            kind,
            origin: TypeOrigin::Defined,
            modifiers: Modifiers::PUBLIC,
            generic_params: Vec::new(),
            base_type: None,
            interfaces: Vec::new(),
            methods: Vec::new(),
            fields: Vec::new(),
            attributes: Vec::new(),
            state_machine_of: None,
        }
    }

    /// Metadata-only description of a type defined elsewhere.
    pub fn external(full_name: impl Into<String>, kind: TypeKind) -> Self {
        Self {
            origin: TypeOrigin::External,
            ..Self::new(full_name, kind)
        }
    }

    pub fn with_base(mut self, base: Typeref) -> Self {
        self.base_type = Some(base);
        self
    }

    pub fn with_interface(mut self, interface: Typeref) -> Self {
        self.interfaces.push(interface);
        self
    }

    pub fn with_generic_params<S: Into<String>>(mut self, params: impl IntoIterator<Item = S>) -> Self {
        self.generic_params = params.into_iter().map(Into::into).collect();
        self
    }

    pub fn is_value_type(&self) -> bool {
        self.kind.is_struct()
    }

    /// Simple name, without namespace.
    pub fn name(&self) -> &str {
        self.full_name
            .rsplit_once('.')
            .map_or(self.full_name.as_str(), |(_, name)| name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, EnumIs, Display)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum MethodKind {
    Ordinary,
    Constructor,
    StaticConstructor,
    PropertyGetter,
    PropertySetter,
}

impl MethodKind {
    pub fn is_accessor(self) -> bool {
        matches!(self, MethodKind::PropertyGetter | MethodKind::PropertySetter)
    }

    pub fn is_any_constructor(self) -> bool {
        matches!(self, MethodKind::Constructor | MethodKind::StaticConstructor)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Parameter {
    pub name: String,
    pub ty: Typeref,
}

impl Parameter {
    pub fn new(name: impl Into<String>, ty: Typeref) -> Self {
        Self { name: name.into(), ty }
    }
}

#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct MethodDef {
    pub name: String,
    /// Filled in by [`crate::program::ProgramUnit::add_method`].
    pub declaring_type: TypeId,
    pub kind: MethodKind,
    pub modifiers: Modifiers,
    pub params: Vec<Parameter>,
    pub return_type: Typeref,
    pub generic_params: Vec<String>,
    pub attributes: Vec<CustomAttribute>,
    pub body: Option<MethodBody>,
    /// State machine type the body was lowered into, for asynchronous
    /// methods.
    pub async_state_machine: Option<TypeId>,
}

impl MethodDef {
    pub fn new(name: impl Into<String>, kind: MethodKind, return_type: Typeref) -> Self {
        let modifiers = match kind {
            MethodKind::StaticConstructor => Modifiers::PRIVATE | Modifiers::STATIC,
            _ => Modifiers::PUBLIC,
        };
        Self {
            name: name.into(),
            declaring_type: TypeId::default(),
            kind,
            modifiers,
            params: Vec::new(),
            return_type,
            generic_params: Vec::new(),
            attributes: Vec::new(),
            body: None,
            async_state_machine: None,
        }
    }

    pub fn ordinary(name: impl Into<String>, return_type: Typeref) -> Self {
        Self::new(name, MethodKind::Ordinary, return_type)
    }

    pub fn constructor() -> Self {
        Self::new(".ctor", MethodKind::Constructor, Typeref::VOID)
    }

    pub fn static_constructor() -> Self {
        Self::new(".cctor", MethodKind::StaticConstructor, Typeref::VOID)
    }

    pub fn with_modifiers(mut self, modifiers: Modifiers) -> Self {
        self.modifiers = modifiers;
        self
    }

    pub fn with_param(mut self, name: impl Into<String>, ty: Typeref) -> Self {
        self.params.push(Parameter::new(name, ty));
        self
    }

    pub fn with_body(mut self, body: MethodBody) -> Self {
        self.body = Some(body);
        self
    }

    pub fn is_static(&self) -> bool {
        self.modifiers.contains(Modifiers::STATIC)
    }

    pub fn returns_value(&self) -> bool {
        self.return_type != Typeref::VOID
    }

    /// Number of argument slots, counting `this` for instance methods.
    pub fn arg_slots(&self) -> usize {
        self.params.len() + usize::from(!self.is_static())
    }
}

#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct FieldDef {
    pub name: String,
    pub declaring_type: TypeId,
    pub field_type: Typeref,
    pub modifiers: Modifiers,
    pub attributes: Vec<CustomAttribute>,
}

impl FieldDef {
    pub fn new(name: impl Into<String>, field_type: Typeref, modifiers: Modifiers) -> Self {
        Self {
            name: name.into(),
            declaring_type: TypeId::default(),
            field_type,
            modifiers,
            attributes: Vec::new(),
        }
    }

    pub fn is_static(&self) -> bool {
        self.modifiers.contains(Modifiers::STATIC)
    }
}
