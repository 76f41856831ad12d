//! Custom attributes attached to types, methods and fields.
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use strum::{EnumIs, EnumTryAs};

use crate::{
    program::{FieldId, MethodId, TypeId},
    types::Typeref,
};

/// Constant argument stored in attribute metadata.
#[derive(Debug, Clone, PartialEq, Eq, Hash, EnumIs, EnumTryAs)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum AttributeArg {
    Null,
    Bool(bool),
    I32(i32),
    I64(i64),
    Str(String),
    Type(Typeref),
}

/// Assignment of a constant to a field of the attribute instance, performed
/// right after construction.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct NamedArg {
    pub field: FieldId,
    pub value: AttributeArg,
}

/// One application of an attribute type.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct CustomAttribute {
    pub attribute_type: TypeId,
    /// Constructor selected by the positional arguments.
    pub constructor: MethodId,
    pub args: Vec<AttributeArg>,
    pub named: Vec<NamedArg>,
}

impl CustomAttribute {
    pub fn new(attribute_type: TypeId, constructor: MethodId) -> Self {
        Self {
            attribute_type,
            constructor,
            args: Vec::new(),
            named: Vec::new(),
        }
    }

    pub fn with_arg(mut self, arg: AttributeArg) -> Self {
        self.args.push(arg);
        self
    }

    pub fn with_named(mut self, field: FieldId, value: AttributeArg) -> Self {
        self.named.push(NamedArg { field, value });
        self
    }
}
