//! Pretty-print helpers for instructions, method bodies and types.
//!
//! Listings are IL-like: one instruction per line prefixed with its position
//! (`IL_0004: ldarg 0`), jump targets printed as positions, and exception
//! regions listed after the instructions.
use crate::{
    body::{HandlerKind, Instr, InstrId, MethodBody, Token},
    program::{AttributeArg, FieldRef, MethodId, MethodRef, ProgramUnit, TypeId},
};

fn label(body: &MethodBody, id: InstrId) -> String {
    match body.position(id) {
        Some(pos) => format!("IL_{:04}", pos),
        None => "IL_????".to_string(),
    }
}

fn field_name(unit: &ProgramUnit, field: &FieldRef) -> String {
    let name = unit.field(field.field).map_or("<removed>", |f| f.name.as_str());
    format!("{}::{}", unit.registry.fmt(field.declaring), name)
}

fn method_name(unit: &ProgramUnit, method: &MethodRef) -> String {
    let name = unit.method(method.method).map_or("<removed>", |m| m.name.as_str());
    format!("{}::{}", unit.registry.fmt(method.declaring), name)
}

impl Instr {
    /// Build a formatting helper that renders the instruction with names
    /// resolved through `unit` and jump targets through `body`.
    pub fn fmt<'a>(&'a self, unit: &'a ProgramUnit, body: &'a MethodBody) -> impl std::fmt::Display + 'a {
        struct Fmt<'a> {
            instr: &'a Instr,
            unit: &'a ProgramUnit,
            body: &'a MethodBody,
        }

        impl std::fmt::Display for Fmt<'_> {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.instr.op().opname())?;
                match self.instr {
                    Instr::LdArg(i) | Instr::StArg(i) | Instr::LdArgA(i) => write!(f, " {}", i),
                    Instr::LdLoc(l) | Instr::StLoc(l) | Instr::LdLocA(l) => write!(f, " V_{}", l.0),
                    Instr::LdcI4(v) => write!(f, " {}", v),
                    Instr::LdcI8(v) => write!(f, " {}", v),
                    Instr::LdStr(s) => write!(f, " {:?}", s),
                    Instr::LdToken(Token::Type(t)) => write!(f, " {}", self.unit.registry.fmt(*t)),
                    Instr::LdToken(Token::Method(m)) => write!(f, " {}", self.unit.method_display(*m)),
                    Instr::LdFld(fr) | Instr::StFld(fr) | Instr::LdSFld(fr) | Instr::StSFld(fr) => {
                        write!(f, " {}", field_name(self.unit, fr))
                    }
                    Instr::Call(m) | Instr::CallVirt(m) | Instr::NewObj(m) => {
                        write!(f, " {}", method_name(self.unit, m))
                    }
                    Instr::CastClass(t)
                    | Instr::IsInst(t)
                    | Instr::Box(t)
                    | Instr::UnboxAny(t)
                    | Instr::NewArr(t)
                    | Instr::InitObj(t) => write!(f, " {}", self.unit.registry.fmt(*t)),
                    Instr::Br(t) | Instr::BrTrue(t) | Instr::BrFalse(t) | Instr::Leave(t) => {
                        write!(f, " {}", label(self.body, *t))
                    }
                    _ => Ok(()),
                }
            }
        }

        Fmt {
            instr: self,
            unit,
            body,
        }
    }
}

impl ProgramUnit {
    /// Render the listing of a method: signature, locals, instructions and
    /// exception regions.
    pub fn fmt_method(&self, method: MethodId) -> impl std::fmt::Display + '_ {
        struct Fmt<'a> {
            unit: &'a ProgramUnit,
            method: MethodId,
        }

        impl std::fmt::Display for Fmt<'_> {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                let Some(def) = self.unit.method(self.method) else {
                    return writeln!(f, "// removed method");
                };

                let static_kw = if def.is_static() { "static " } else { "" };
                writeln!(
                    f,
                    ".method {}{} {}",
                    static_kw,
                    self.unit.registry.fmt(def.return_type),
                    self.unit.method_signature(self.method)
                )?;
                for attr in &def.attributes {
                    let name = self
                        .unit
                        .type_def(attr.attribute_type)
                        .map_or("<removed>", |t| t.full_name.as_str());
                    write!(f, "  .custom {}(", name)?;
                    for (i, arg) in attr.args.iter().enumerate() {
                        if i > 0 {
                            write!(f, ", ")?;
                        }
                        match arg {
                            AttributeArg::Null => write!(f, "null")?,
                            AttributeArg::Bool(b) => write!(f, "{}", b)?,
                            AttributeArg::I32(v) => write!(f, "{}", v)?,
                            AttributeArg::I64(v) => write!(f, "{}", v)?,
                            AttributeArg::Str(s) => write!(f, "{:?}", s)?,
                            AttributeArg::Type(t) => write!(f, "typeof({})", self.unit.registry.fmt(*t))?,
                        }
                    }
                    writeln!(f, ")")?;
                }

                let Some(body) = def.body.as_ref() else {
                    return Ok(());
                };
                writeln!(f, "{{")?;
                for (i, local) in body.locals.iter().enumerate() {
                    write!(f, "  .local V_{}: {}", i, self.unit.registry.fmt(local.ty))?;
                    match &local.name {
                        Some(name) => writeln!(f, " // {}", name)?,
                        None => writeln!(f)?,
                    }
                }
                for (pos, (_, instr)) in body.iter().enumerate() {
                    writeln!(f, "  IL_{:04}: {}", pos, instr.fmt(self.unit, body))?;
                }
                for handler in &body.handlers {
                    let kind = match handler.kind {
                        HandlerKind::Catch(t) => format!("catch {}", self.unit.registry.fmt(t)),
                        HandlerKind::Finally => "finally".to_string(),
                        HandlerKind::Fault => "fault".to_string(),
                    };
                    let end = match handler.handler_end {
                        Some(end) => label(body, end),
                        None => "end".to_string(),
                    };
                    writeln!(
                        f,
                        "  .try {} to {} {} handler {} to {}",
                        label(body, handler.try_start),
                        label(body, handler.try_end),
                        kind,
                        label(body, handler.handler_start),
                        end
                    )?;
                }
                writeln!(f, "}}")
            }
        }

        Fmt { unit: self, method }
    }

    /// Render a type with its fields and method listings.
    pub fn fmt_type(&self, ty: TypeId) -> impl std::fmt::Display + '_ {
        struct Fmt<'a> {
            unit: &'a ProgramUnit,
            ty: TypeId,
        }

        impl std::fmt::Display for Fmt<'_> {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                let Some(def) = self.unit.type_def(self.ty) else {
                    return writeln!(f, "// removed type");
                };
                write!(f, ".{} {}", def.kind, def.full_name)?;
                if let Some(base) = def.base_type {
                    write!(f, " extends {}", self.unit.registry.fmt(base))?;
                }
                for (i, iface) in def.interfaces.iter().enumerate() {
                    let sep = if i == 0 { " implements " } else { ", " };
                    write!(f, "{}{}", sep, self.unit.registry.fmt(*iface))?;
                }
                writeln!(f)?;
                for (_, field) in self.unit.fields_of(self.ty) {
                    let static_kw = if field.is_static() { "static " } else { "" };
                    writeln!(
                        f,
                        "  .field {}{} {}",
                        static_kw,
                        self.unit.registry.fmt(field.field_type),
                        field.name
                    )?;
                }
                for method in &def.methods {
                    write!(f, "{}", self.unit.fmt_method(*method))?;
                }
                Ok(())
            }
        }

        Fmt { unit: self, ty }
    }
}

/// Mnemonics of a body in order. Handy for shape assertions.
pub fn opcodes(body: &MethodBody) -> Vec<&'static str> {
    body.iter().map(|(_, instr)| instr.op().opname()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        program::{MethodDef, TypeDef, TypeKind},
        types::Typeref,
    };

    #[test]
    fn listing_prints_positions_and_targets() {
        let mut unit = ProgramUnit::new("test");
        let ty = unit.add_type(TypeDef::new("N.T", TypeKind::Class)).unwrap();
        let mut body = MethodBody::new();
        let end = body.alloc(Instr::Ret);
        body.push(Instr::LdArg(0));
        body.push(Instr::BrFalse(end));
        body.splice_at(2, &[end]).unwrap();
        let m = unit
            .add_method(
                ty,
                MethodDef::ordinary("M", Typeref::VOID)
                    .with_param("flag", Typeref::BOOL)
                    .with_modifiers(crate::program::Modifiers::STATIC)
                    .with_body(body),
            )
            .unwrap();

        let text = unit.fmt_method(m).to_string();
        assert!(text.contains(".method static void N.T::M(bool)"));
        assert!(text.contains("IL_0001: brfalse IL_0002"));
        assert_eq!(opcodes(unit.method(m).unwrap().body.as_ref().unwrap()), vec!["ldarg", "brfalse", "ret"]);
    }
}
