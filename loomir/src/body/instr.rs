//! Stack machine instructions.
#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use strum::{EnumDiscriminants, EnumIs, EnumTryAs};

use crate::{
    body::{InstrId, LocalId},
    program::{FieldRef, MethodDef, MethodId, MethodRef, ProgramUnit},
    types::Typeref,
    utils::Error,
};

/// Metadata token loaded by `ldtoken`. In this IR the instruction pushes
/// the reflection object directly.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum Token {
    Type(Typeref),
    Method(MethodId),
}

/// A single instruction of a method body.
///
/// Argument slots are numbered as in the runtime: slot 0 is `this` for
/// instance methods. Jump targets are instruction handles, never offsets.
#[derive(Debug, Clone, PartialEq, Eq, Hash, EnumIs, EnumTryAs, EnumDiscriminants)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[strum_discriminants(name(InstrOp))]
#[strum_discriminants(derive(Hash))]
pub enum Instr {
    Nop,

    LdArg(u16),
    StArg(u16),
    LdArgA(u16),
    LdLoc(LocalId),
    StLoc(LocalId),
    LdLocA(LocalId),

    LdNull,
    LdcI4(i32),
    LdcI8(i64),
    LdStr(String),
    LdToken(Token),

    LdFld(FieldRef),
    StFld(FieldRef),
    LdSFld(FieldRef),
    StSFld(FieldRef),

    Call(MethodRef),
    CallVirt(MethodRef),
    NewObj(MethodRef),

    CastClass(Typeref),
    IsInst(Typeref),
    Box(Typeref),
    UnboxAny(Typeref),
    NewArr(Typeref),
    StElemRef,
    LdElemRef,
    /// Zero-initialize the value type at the address on the stack.
    InitObj(Typeref),

    Dup,
    Pop,

    Ceq,
    Cgt,
    Clt,
    And,
    Or,
    Xor,
    Not,
    Add,
    Sub,

    Br(InstrId),
    BrTrue(InstrId),
    BrFalse(InstrId),
    /// Exit a protected region, emptying the evaluation stack and running
    /// the enclosing finally handlers on the way out.
    Leave(InstrId),
    EndFinally,

    Throw,
    Rethrow,
    Ret,
}

/// How control leaves an instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumIs)]
pub enum Flow {
    /// Continues with the next instruction.
    Next,
    /// Unconditional jump.
    Jump(InstrId),
    /// Jump or continue with the next instruction.
    Branch(InstrId),
    /// Exit a protected region.
    Leave(InstrId),
    Return,
    /// Throw, rethrow, or end of a finally handler.
    Stop,
}

impl InstrOp {
    /// Dotted mnemonic, as printed in listings.
    pub fn opname(self) -> &'static str {
        match self {
            InstrOp::Nop => "nop",
            InstrOp::LdArg => "ldarg",
            InstrOp::StArg => "starg",
            InstrOp::LdArgA => "ldarga",
            InstrOp::LdLoc => "ldloc",
            InstrOp::StLoc => "stloc",
            InstrOp::LdLocA => "ldloca",
            InstrOp::LdNull => "ldnull",
            InstrOp::LdcI4 => "ldc.i4",
            InstrOp::LdcI8 => "ldc.i8",
            InstrOp::LdStr => "ldstr",
            InstrOp::LdToken => "ldtoken",
            InstrOp::LdFld => "ldfld",
            InstrOp::StFld => "stfld",
            InstrOp::LdSFld => "ldsfld",
            InstrOp::StSFld => "stsfld",
            InstrOp::Call => "call",
            InstrOp::CallVirt => "callvirt",
            InstrOp::NewObj => "newobj",
            InstrOp::CastClass => "castclass",
            InstrOp::IsInst => "isinst",
            InstrOp::Box => "box",
            InstrOp::UnboxAny => "unbox.any",
            InstrOp::NewArr => "newarr",
            InstrOp::StElemRef => "stelem.ref",
            InstrOp::LdElemRef => "ldelem.ref",
            InstrOp::InitObj => "initobj",
            InstrOp::Dup => "dup",
            InstrOp::Pop => "pop",
            InstrOp::Ceq => "ceq",
            InstrOp::Cgt => "cgt",
            InstrOp::Clt => "clt",
            InstrOp::And => "and",
            InstrOp::Or => "or",
            InstrOp::Xor => "xor",
            InstrOp::Not => "not",
            InstrOp::Add => "add",
            InstrOp::Sub => "sub",
            InstrOp::Br => "br",
            InstrOp::BrTrue => "brtrue",
            InstrOp::BrFalse => "brfalse",
            InstrOp::Leave => "leave",
            InstrOp::EndFinally => "endfinally",
            InstrOp::Throw => "throw",
            InstrOp::Rethrow => "rethrow",
            InstrOp::Ret => "ret",
        }
    }
}

impl Instr {
    pub fn op(&self) -> InstrOp {
        InstrOp::from(self)
    }

    /// Jump target, if any.
    pub fn target(&self) -> Option<InstrId> {
        match self {
            Instr::Br(t) | Instr::BrTrue(t) | Instr::BrFalse(t) | Instr::Leave(t) => Some(*t),
            _ => None,
        }
    }

    pub(crate) fn target_mut(&mut self) -> Option<&mut InstrId> {
        match self {
            Instr::Br(t) | Instr::BrTrue(t) | Instr::BrFalse(t) | Instr::Leave(t) => Some(t),
            _ => None,
        }
    }

    pub fn flow(&self) -> Flow {
        match self {
            Instr::Br(t) => Flow::Jump(*t),
            Instr::BrTrue(t) | Instr::BrFalse(t) => Flow::Branch(*t),
            Instr::Leave(t) => Flow::Leave(*t),
            Instr::Ret => Flow::Return,
            Instr::Throw | Instr::Rethrow | Instr::EndFinally => Flow::Stop,
            _ => Flow::Next,
        }
    }

    /// Number of values popped and pushed by this instruction when executed
    /// inside `current`.
    pub fn stack_effect(&self, unit: &ProgramUnit, current: &MethodDef) -> Result<(u16, u16), Error> {
        let callee = |m: &MethodRef| {
            unit.method(m.method)
                .ok_or(Error::InvalidHandle { kind: "method" })
        };

        Ok(match self {
            Instr::Nop
            | Instr::Br(_)
            | Instr::Leave(_)
            | Instr::EndFinally
            | Instr::Rethrow => (0, 0),

            Instr::LdArg(_)
            | Instr::LdArgA(_)
            | Instr::LdLoc(_)
            | Instr::LdLocA(_)
            | Instr::LdNull
            | Instr::LdcI4(_)
            | Instr::LdcI8(_)
            | Instr::LdStr(_)
            | Instr::LdToken(_)
            | Instr::LdSFld(_) => (0, 1),

            Instr::StArg(_)
            | Instr::StLoc(_)
            | Instr::StSFld(_)
            | Instr::Pop
            | Instr::InitObj(_)
            | Instr::BrTrue(_)
            | Instr::BrFalse(_)
            | Instr::Throw => (1, 0),

            Instr::LdFld(_)
            | Instr::CastClass(_)
            | Instr::IsInst(_)
            | Instr::Box(_)
            | Instr::UnboxAny(_)
            | Instr::NewArr(_)
            | Instr::Not => (1, 1),

            Instr::StFld(_) => (2, 0),
            Instr::StElemRef => (3, 0),
            Instr::LdElemRef => (2, 1),
            Instr::Dup => (1, 2),

            Instr::Ceq
            | Instr::Cgt
            | Instr::Clt
            | Instr::And
            | Instr::Or
            | Instr::Xor
            | Instr::Add
            | Instr::Sub => (2, 1),

            Instr::Call(m) | Instr::CallVirt(m) => {
                let def = callee(m)?;
                (def.arg_slots() as u16, u16::from(def.returns_value()))
            }
            Instr::NewObj(m) => (callee(m)?.params.len() as u16, 1),

            Instr::Ret => (u16::from(current.returns_value()), 0),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mnemonics_are_dotted() {
        assert_eq!(Instr::LdcI4(3).op().opname(), "ldc.i4");
        assert_eq!(Instr::UnboxAny(Typeref::I32).op().opname(), "unbox.any");
        assert!(Instr::Ret.flow().is_return());
        assert_eq!(Instr::Nop.target(), None);
    }
}
