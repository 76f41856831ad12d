//! Conditional blocks and boolean expressions.
use crate::{
    body::{Instr, InstrId},
    coder::{Coder, CoderError, Operand},
    program::MethodRef,
};

/// An open `if` block. Created by the `is_*` tests of [`Coder`] or by
/// [`BoolExpr::is_true`]/[`BoolExpr::is_false`]; must be closed with
/// [`IfCoder::end_if`].
pub struct IfCoder<'c, 'a> {
    coder: &'c mut Coder<'a>,
    else_label: InstrId,
    end_label: Option<InstrId>,
}

impl<'a> Coder<'a> {
    fn open_if(&mut self, skip: fn(InstrId) -> Instr) -> IfCoder<'_, 'a> {
        let else_label = self.label();
        self.emit(skip(else_label));
        self.open_blocks += 1;
        IfCoder {
            coder: self,
            else_label,
            end_label: None,
        }
    }

    /// `if op is null`.
    pub fn is_null(&mut self, op: Operand) -> Result<IfCoder<'_, 'a>, CoderError> {
        self.load(&op)?;
        Ok(self.open_if(Instr::BrTrue))
    }

    /// `if op is not null`.
    pub fn is_not_null(&mut self, op: Operand) -> Result<IfCoder<'_, 'a>, CoderError> {
        self.load(&op)?;
        Ok(self.open_if(Instr::BrFalse))
    }

    /// `if op`.
    pub fn is_true(&mut self, op: Operand) -> Result<IfCoder<'_, 'a>, CoderError> {
        self.load(&op)?;
        Ok(self.open_if(Instr::BrFalse))
    }

    /// `if !op`.
    pub fn is_false(&mut self, op: Operand) -> Result<IfCoder<'_, 'a>, CoderError> {
        self.load(&op)?;
        Ok(self.open_if(Instr::BrTrue))
    }

    /// Start a boolean expression.
    pub fn condition(&mut self) -> BoolExpr<'_, 'a> {
        BoolExpr {
            coder: self,
            has_operand: false,
            pending_end: None,
        }
    }
}

impl<'c, 'a> IfCoder<'c, 'a> {
    /// Code run when the condition holds.
    pub fn then(mut self, f: impl FnOnce(&mut Coder<'a>) -> Result<(), CoderError>) -> Result<Self, CoderError> {
        f(&mut *self.coder)?;
        Ok(self)
    }

    /// Code run when the condition does not hold.
    pub fn else_(mut self, f: impl FnOnce(&mut Coder<'a>) -> Result<(), CoderError>) -> Result<Self, CoderError> {
        if self.end_label.is_some() {
            return Err(CoderError::DuplicateElse);
        }
        let end = self.coder.label();
        self.coder.emit(Instr::Br(end));
        self.coder.mark(self.else_label)?;
        self.end_label = Some(end);
        f(&mut *self.coder)?;
        Ok(self)
    }

    pub fn end_if(mut self) -> Result<&'c mut Coder<'a>, CoderError> {
        let label = self.end_label.unwrap_or(self.else_label);
        self.coder.mark(label)?;
        self.coder.open_blocks -= 1;
        Ok(self.coder)
    }
}

/// A boolean expression under construction.
///
/// The first operand is pushed with [`BoolExpr::load`] or
/// [`BoolExpr::call`]; every further operand comes through a combinator,
/// whose closure must push exactly one value. Short-circuit combinators
/// leave an end label pending; the next combinator (or the test closing the
/// expression) places it first, so no sub-expression is left with a jump
/// past code appended after it.
pub struct BoolExpr<'c, 'a> {
    coder: &'c mut Coder<'a>,
    has_operand: bool,
    pending_end: Option<InstrId>,
}

impl<'c, 'a> BoolExpr<'c, 'a> {
    fn first(&mut self) -> Result<(), CoderError> {
        if self.has_operand {
            return Err(CoderError::DanglingOperand);
        }
        self.has_operand = true;
        Ok(())
    }

    fn settle(&mut self) -> Result<(), CoderError> {
        if !self.has_operand {
            return Err(CoderError::MissingLeftOperand);
        }
        if let Some(end) = self.pending_end.take() {
            self.coder.mark(end)?;
        }
        Ok(())
    }

    pub fn load(mut self, op: Operand) -> Result<Self, CoderError> {
        self.first()?;
        self.coder.load(&op)?;
        Ok(self)
    }

    /// Start from a constant.
    pub fn value(self, value: bool) -> Result<Self, CoderError> {
        self.load(Operand::Bool(value))
    }

    pub fn call(mut self, instance: Option<Operand>, method: MethodRef, args: &[Operand]) -> Result<Self, CoderError> {
        self.first()?;
        self.coder.push_call(instance, method, args)?;
        Ok(self)
    }

    fn combine(
        mut self,
        op: Instr,
        right: impl FnOnce(&mut Coder<'a>) -> Result<(), CoderError>,
    ) -> Result<Self, CoderError> {
        self.settle()?;
        right(&mut *self.coder)?;
        self.coder.emit(op);
        Ok(self)
    }

    fn short_circuit(
        mut self,
        exit: fn(InstrId) -> Instr,
        right: impl FnOnce(&mut Coder<'a>) -> Result<(), CoderError>,
    ) -> Result<Self, CoderError> {
        self.settle()?;
        let end = self.coder.label();
        self.coder.emit(Instr::Dup);
        self.coder.emit(exit(end));
        self.coder.emit(Instr::Pop);
        right(&mut *self.coder)?;
        self.pending_end = Some(end);
        Ok(self)
    }

    /// Bitwise and; both sides are evaluated.
    pub fn and(self, right: impl FnOnce(&mut Coder<'a>) -> Result<(), CoderError>) -> Result<Self, CoderError> {
        self.combine(Instr::And, right)
    }

    /// Bitwise or; both sides are evaluated.
    pub fn or(self, right: impl FnOnce(&mut Coder<'a>) -> Result<(), CoderError>) -> Result<Self, CoderError> {
        self.combine(Instr::Or, right)
    }

    /// Logical and; `right` only runs when the left side is true.
    pub fn and_also(self, right: impl FnOnce(&mut Coder<'a>) -> Result<(), CoderError>) -> Result<Self, CoderError> {
        self.short_circuit(Instr::BrFalse, right)
    }

    /// Logical or; `right` only runs when the left side is false.
    pub fn or_else(self, right: impl FnOnce(&mut Coder<'a>) -> Result<(), CoderError>) -> Result<Self, CoderError> {
        self.short_circuit(Instr::BrTrue, right)
    }

    pub fn invert(mut self) -> Result<Self, CoderError> {
        self.settle()?;
        self.coder.emit(Instr::LdcI4(0));
        self.coder.emit(Instr::Ceq);
        Ok(self)
    }

    /// Open an `if` taken when the expression is true.
    pub fn is_true(mut self) -> Result<IfCoder<'c, 'a>, CoderError> {
        self.settle()?;
        Ok(self.into_if(Instr::BrFalse))
    }

    /// Open an `if` taken when the expression is false.
    pub fn is_false(mut self) -> Result<IfCoder<'c, 'a>, CoderError> {
        self.settle()?;
        Ok(self.into_if(Instr::BrTrue))
    }

    fn into_if(self, skip: fn(InstrId) -> Instr) -> IfCoder<'c, 'a> {
        let coder = self.coder;
        let else_label = coder.label();
        coder.emit(skip(else_label));
        coder.open_blocks += 1;
        IfCoder {
            coder,
            else_label,
            end_label: None,
        }
    }

    /// Close the expression, leaving its value on the stack.
    pub fn finish(mut self) -> Result<&'c mut Coder<'a>, CoderError> {
        self.settle()?;
        Ok(self.coder)
    }
}

#[cfg(test)]
mod tests {
    use crate::{
        analysis::analyze_method,
        body::{Instr, MethodBody},
        coder::{CoderError, InsertionPosition, Operand},
        fmt::opcodes,
        program::{MethodDef, MethodId, Modifiers, ProgramUnit, TypeDef, TypeKind},
        types::Typeref,
    };

    fn fixture() -> (ProgramUnit, MethodId) {
        let mut unit = ProgramUnit::new("test");
        let ty = unit.add_type(TypeDef::new("N.T", TypeKind::Class)).unwrap();
        let (body, _) = MethodBody::from_instrs([Instr::LdcI4(0), Instr::Ret]);
        let m = unit
            .add_method(
                ty,
                MethodDef::ordinary("M", Typeref::I32)
                    .with_modifiers(Modifiers::PUBLIC | Modifiers::STATIC)
                    .with_param("a", Typeref::BOOL)
                    .with_param("b", Typeref::BOOL)
                    .with_body(body),
            )
            .unwrap();
        (unit, m)
    }

    #[test]
    fn combinator_without_left_operand_is_a_defect() {
        let (mut unit, m) = fixture();
        let err = unit.with_coder(m, |c| {
            c.condition().or(|c| c.load(&Operand::Arg(0)).map(|_| ()))?;
            Ok(())
        });
        assert_eq!(err, Err(CoderError::MissingLeftOperand));

        let err = unit.with_coder(m, |c| {
            c.condition().load(Operand::Arg(0))?.load(Operand::Arg(1))?;
            Ok(())
        });
        assert_eq!(err, Err(CoderError::DanglingOperand));
    }

    #[test]
    fn short_circuit_chain_settles_pending_labels() {
        let (mut unit, m) = fixture();
        unit.with_coder(m, |c| {
            c.condition()
                .load(Operand::Arg(0))?
                .or_else(|c| c.load(&Operand::Arg(1)).map(|_| ()))?
                .and_also(|c| c.load(&Operand::Bool(true)).map(|_| ()))?
                .is_true()?
                .then(|c| c.return_value(&Operand::I32(1)).map(|_| ()))?
                .end_if()?;
            c.insert(InsertionPosition::Beginning)
        })
        .unwrap_err();

        // A return inside the `if` is rejected; leave through the default
        // path instead.
        unit.with_coder(m, |c| {
            c.condition()
                .load(Operand::Arg(0))?
                .or_else(|c| c.load(&Operand::Arg(1)).map(|_| ()))?
                .and_also(|c| c.load(&Operand::Bool(true)).map(|_| ()))?
                .invert()?
                .is_false()?
                .then(|c| c.assign(Operand::Arg(0)).value(Operand::Bool(false)))?
                .else_(|c| c.assign(Operand::Arg(1)).value(Operand::Bool(false)))?
                .end_if()?;
            c.insert(InsertionPosition::Beginning)
        })
        .unwrap();

        let body = unit.method(m).unwrap().body.as_ref().unwrap();
        assert_eq!(
            opcodes(body),
            vec![
                "ldarg", "dup", "brtrue", "pop", "ldarg", "nop", "dup", "brfalse", "pop", "ldc.i4", "nop",
                "ldc.i4", "ceq", "brtrue", "ldc.i4", "starg", "br", "nop", "ldc.i4", "starg", "nop", "ldc.i4",
                "ret"
            ]
        );
        analyze_method(&unit, m).unwrap();
    }

    #[test]
    fn finished_expression_leaves_one_value() {
        let (mut unit, m) = fixture();
        unit.with_coder(m, |c| {
            c.condition()
                .value(false)?
                .or(|c| c.load(&Operand::Arg(0)).map(|_| ()))?
                .and(|c| c.load(&Operand::Arg(1)).map(|_| ()))?
                .finish()?
                .pop();
            c.insert(InsertionPosition::Beginning)
        })
        .unwrap();
        let body = unit.method(m).unwrap().body.as_ref().unwrap();
        assert_eq!(
            opcodes(body),
            vec!["ldc.i4", "ldarg", "or", "ldarg", "and", "pop", "ldc.i4", "ret"]
        );
        analyze_method(&unit, m).unwrap();
    }

    #[test]
    fn null_tests_branch_around_the_then_block() {
        let (mut unit, m) = fixture();
        unit.with_coder(m, |c| {
            c.is_not_null(Operand::Str("x".into()))?
                .then(|c| c.assign(Operand::Arg(0)).value(Operand::Bool(true)))?
                .end_if()?;
            c.insert(InsertionPosition::Beginning)
        })
        .unwrap();
        let body = unit.method(m).unwrap().body.as_ref().unwrap();
        assert_eq!(
            opcodes(body),
            vec!["ldstr", "brfalse", "ldc.i4", "starg", "nop", "ldc.i4", "ret"]
        );
        analyze_method(&unit, m).unwrap();
    }
}
