//! Built-in primitive types.
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, EnumString, IntoStaticStr};

/// Primitive element types known to every program unit.
///
/// The registry interns these first, in declaration order, so that the
/// [`crate::types::Typeref`] of a primitive is a compile-time constant.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Display,
    EnumString,
    EnumIter,
    IntoStaticStr,
)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[strum(serialize_all = "lowercase")]
pub enum Primitive {
    Void,
    Bool,
    Char,
    I8,
    U8,
    I16,
    U16,
    I32,
    U32,
    I64,
    U64,
    F32,
    F64,
    #[strum(serialize = "nint")]
    IntPtr,
}

impl Primitive {
    /// Returns true for `void`, the only primitive that has no value.
    pub fn is_void(self) -> bool {
        self == Primitive::Void
    }

    /// Primitives stored in 64 bits on the evaluation stack.
    pub fn is_wide(self) -> bool {
        matches!(
            self,
            Primitive::I64 | Primitive::U64 | Primitive::F64 | Primitive::IntPtr
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn names_round_trip_through_strum() {
        assert_eq!(Primitive::I32.to_string(), "i32");
        assert_eq!(Primitive::IntPtr.to_string(), "nint");
        assert_eq!(Primitive::from_str("bool").unwrap(), Primitive::Bool);
    }
}
