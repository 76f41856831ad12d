//! Runtime values of the reference interpreter.
use std::{cell::RefCell, collections::HashMap, rc::Rc};

use strum::{EnumIs, EnumTryAs};

use crate::{
    program::{FieldId, MethodId, TypeId},
    types::Typeref,
};

/// A heap object: its runtime type and the fields assigned so far.
#[derive(Debug)]
pub struct Object {
    pub ty: TypeId,
    pub fields: HashMap<FieldId, Value>,
}

pub type ObjRef = Rc<RefCell<Object>>;
pub type ArrayRef = Rc<RefCell<Vec<Value>>>;

/// Argument or local slot of the current frame, as loaded by `ldarga` and
/// `ldloca`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Slot {
    Arg(u16),
    Local(u16),
}

#[derive(Debug, Clone, EnumIs, EnumTryAs)]
pub enum Value {
    Null,
    I32(i32),
    I64(i64),
    Str(Rc<str>),
    Obj(ObjRef),
    Array(ArrayRef),
    /// Runtime type object, as pushed by `ldtoken`.
    Type(Typeref),
    /// Runtime method object, as pushed by `ldtoken`.
    Method(MethodId),
    Addr(Slot),
}

impl Value {
    pub fn str(s: &str) -> Self {
        Value::Str(Rc::from(s))
    }

    pub fn bool(b: bool) -> Self {
        Value::I32(i32::from(b))
    }

    /// Truthiness as seen by `brtrue`.
    pub fn truthy(&self) -> bool {
        match self {
            Value::Null => false,
            Value::I32(v) => *v != 0,
            Value::I64(v) => *v != 0,
            _ => true,
        }
    }

    /// Identity for references, equality for scalars.
    pub fn same(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::I32(a), Value::I32(b)) => a == b,
            (Value::I64(a), Value::I64(b)) => a == b,
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::Obj(a), Value::Obj(b)) => Rc::ptr_eq(a, b),
            (Value::Array(a), Value::Array(b)) => Rc::ptr_eq(a, b),
            (Value::Type(a), Value::Type(b)) => a == b,
            (Value::Method(a), Value::Method(b)) => a == b,
            (Value::Addr(a), Value::Addr(b)) => a == b,
            _ => false,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::I32(v) => Some(i64::from(*v)),
            Value::I64(v) => Some(*v),
            _ => None,
        }
    }

    /// Runtime type of an object value.
    pub fn object_type(&self) -> Option<TypeId> {
        match self {
            Value::Obj(o) => Some(o.borrow().ty),
            _ => None,
        }
    }

    /// Field of an object value, if assigned.
    pub fn field(&self, field: FieldId) -> Option<Value> {
        match self {
            Value::Obj(o) => o.borrow().fields.get(&field).cloned(),
            _ => None,
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        self.same(other)
    }
}
