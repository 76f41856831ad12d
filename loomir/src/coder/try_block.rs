//! Protected regions.
use crate::{
    body::{ExceptionHandler, HandlerKind, Instr, InstrId},
    coder::{Coder, CoderError},
    types::Typeref,
};

/// An open try block. Add a [`TryCoder::catch`] and/or a
/// [`TryCoder::finally`] handler, then close it with [`TryCoder::end_try`].
///
/// With both handlers the layout is
///
/// ```text
/// try_start:  <body>          leave end
/// catch:      stloc ex <..>   leave end
/// finally:    <..>            endfinally
/// end:
/// ```
///
/// and two regions are recorded: the catch region covering the body, and
/// the finally region covering body and catch handler together.
pub struct TryCoder<'c, 'a> {
    coder: &'c mut Coder<'a>,
    try_start: InstrId,
    end: InstrId,
    catch: Option<(InstrId, Typeref)>,
    finally: Option<InstrId>,
}

impl<'a> Coder<'a> {
    /// Open a try block whose protected code is built by `f`.
    pub fn try_(
        &mut self,
        f: impl FnOnce(&mut Coder<'a>) -> Result<(), CoderError>,
    ) -> Result<TryCoder<'_, 'a>, CoderError> {
        let try_start = self.label();
        self.mark(try_start)?;
        self.open_blocks += 1;

        let before = self.emitted.len();
        f(self)?;
        if self.emitted.len() == before {
            return Err(CoderError::EmptyTry);
        }

        let end = self.label();
        self.emit(Instr::Leave(end));
        Ok(TryCoder {
            coder: self,
            try_start,
            end,
            catch: None,
            finally: None,
        })
    }
}

impl<'c, 'a> TryCoder<'c, 'a> {
    /// Handle exceptions of type `ty`. Inside `f` the caught exception is
    /// available as [`crate::coder::Operand::Exception`]; falling off the
    /// end of `f` leaves the block.
    pub fn catch(
        mut self,
        ty: Typeref,
        f: impl FnOnce(&mut Coder<'a>) -> Result<(), CoderError>,
    ) -> Result<Self, CoderError> {
        if self.finally.is_some() {
            return Err(CoderError::CatchAfterFinally);
        }
        if self.catch.is_some() {
            return Err(CoderError::DuplicateCatch);
        }

        let start = self.coder.label();
        self.coder.mark(start)?;
        let local = self.coder.declare_local(ty, Some("<>exception"));
        self.coder.emit(Instr::StLoc(local));

        self.coder.exception_locals.push(local);
        let built = f(&mut *self.coder);
        self.coder.exception_locals.pop();
        built?;

        self.coder.emit(Instr::Leave(self.end));
        self.catch = Some((start, ty));
        Ok(self)
    }

    /// Code run whenever control leaves the block.
    pub fn finally(mut self, f: impl FnOnce(&mut Coder<'a>) -> Result<(), CoderError>) -> Result<Self, CoderError> {
        if self.finally.is_some() {
            return Err(CoderError::DuplicateFinally);
        }

        let start = self.coder.label();
        self.coder.mark(start)?;
        f(&mut *self.coder)?;
        self.coder.emit(Instr::EndFinally);
        self.finally = Some(start);
        Ok(self)
    }

    pub fn end_try(self) -> Result<&'c mut Coder<'a>, CoderError> {
        if self.catch.is_none() && self.finally.is_none() {
            return Err(CoderError::TryWithoutHandler);
        }

        let coder = self.coder;
        coder.mark(self.end)?;

        if let Some((start, ty)) = self.catch {
            coder.handlers.push(ExceptionHandler {
                kind: HandlerKind::Catch(ty),
                try_start: self.try_start,
                try_end: start,
                handler_start: start,
                handler_end: Some(self.finally.unwrap_or(self.end)),
            });
        }
        if let Some(start) = self.finally {
            coder.handlers.push(ExceptionHandler {
                kind: HandlerKind::Finally,
                try_start: self.try_start,
                try_end: start,
                handler_start: start,
                handler_end: Some(self.end),
            });
        }

        coder.open_blocks -= 1;
        Ok(coder)
    }
}

#[cfg(test)]
mod tests {
    use crate::{
        analysis::analyze_method,
        body::{HandlerKind, Instr, MethodBody},
        coder::{CoderError, Operand},
        fmt::opcodes,
        program::{MethodDef, MethodId, ProgramUnit, TypeDef, TypeKind},
        types::Typeref,
    };

    fn fixture(ret: Typeref, instrs: Vec<Instr>) -> (ProgramUnit, MethodId, Typeref) {
        let mut unit = ProgramUnit::new("test");
        let exception = unit.add_type(TypeDef::external("System.Exception", TypeKind::Class)).unwrap();
        let exception = unit.type_ref(exception).unwrap();
        let ty = unit.add_type(TypeDef::new("N.T", TypeKind::Class)).unwrap();
        let (body, _) = MethodBody::from_instrs(instrs);
        let m = unit
            .add_method(ty, MethodDef::ordinary("M", ret).with_body(body))
            .unwrap();
        (unit, m, exception)
    }

    #[test]
    fn try_catch_finally_nests_the_catch_region_in_the_finally_region() {
        let (mut unit, m, exception) = fixture(Typeref::I32, vec![Instr::LdcI4(5), Instr::Ret]);
        unit.with_coder(m, |c| {
            c.try_(|c| c.original_body().map(|_| ()))?
                .catch(exception, |c| {
                    c.is_null(Operand::Exception)?.then(|c| c.rethrow())?.end_if()?;
                    c.return_default().map(|_| ())
                })?
                .finally(|c| c.load(&Operand::I32(1)).map(|c| {
                    c.pop();
                }))?
                .end_try()?;
            c.return_()?;
            c.replace()
        })
        .unwrap();

        let body = unit.method(m).unwrap().body.as_ref().unwrap();
        assert_eq!(
            opcodes(body),
            vec![
                "nop", "ldc.i4", "stloc", "leave", "leave", // try
                "nop", "stloc", "ldloc", "brtrue", "rethrow", "nop", "ldc.i4", "stloc", "leave", "leave", // catch
                "nop", "ldc.i4", "pop", "endfinally", // finally
                "nop", "nop", "ldloc", "ret",
            ]
        );
        assert_eq!(body.handlers.len(), 2);
        assert!(body.handlers[0].kind.is_catch());
        assert_eq!(body.handlers[1].kind, HandlerKind::Finally);
        assert_eq!(body.handlers[0].try_start, body.handlers[1].try_start);
        analyze_method(&unit, m).unwrap();
    }

    #[test]
    fn empty_and_handlerless_blocks_are_rejected() {
        let (mut unit, m, exception) = fixture(Typeref::VOID, vec![Instr::Ret]);
        let err = unit.with_coder(m, |c| c.try_(|_| Ok(())).map(|_| ()));
        assert_eq!(err, Err(CoderError::EmptyTry));

        let err = unit.with_coder(m, |c| {
            c.try_(|c| c.load(&Operand::I32(0)).map(|c| {
                c.pop();
            }))?
            .end_try()
            .map(|_| ())
        });
        assert_eq!(err, Err(CoderError::TryWithoutHandler));

        let err = unit.with_coder(m, |c| {
            c.try_(|c| c.load(&Operand::I32(0)).map(|c| {
                c.pop();
            }))?
            .finally(|_| Ok(()))?
            .catch(exception, |_| Ok(()))
            .map(|_| ())
        });
        assert_eq!(err, Err(CoderError::CatchAfterFinally));
    }
}
