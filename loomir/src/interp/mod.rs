//! Reference interpreter
//!
//! Executes method bodies of a [`ProgramUnit`] directly on the IR. It is not
//! meant to be fast; it exists to observe what code does: return values,
//! thrown exceptions, field writes and the order of calls into methods that
//! have no body, which are served by registered natives.
//!
//! Supported semantics: objects and arrays, statics with lazily run type
//! initializers (before the first static access or instance creation),
//! virtual dispatch by name and arity along the runtime type's hierarchy,
//! and exception regions with catch, finally, fault, `leave` and `rethrow`.
use std::{
    cell::RefCell,
    collections::{HashMap, HashSet},
    rc::Rc,
};

use crate::{
    body::{HandlerKind, Instr, InstrId, MethodBody, RegionSpan, Token},
    program::{FieldId, FieldRef, MethodDef, MethodId, MethodRef, ProgramUnit, TypeId},
    types::{AnyType, Primitive, Typeref},
    utils::Error,
};

pub use value::{ArrayRef, ObjRef, Object, Slot, Value};

pub mod value;

const MAX_CALL_DEPTH: usize = 256;

/// Abrupt completion of a call.
#[derive(Debug, Clone)]
pub enum Unwind {
    /// A managed exception, catchable by exception regions.
    Throw(Value),
    /// An interpreter failure; never caught.
    Fault(Error),
}

impl From<Error> for Unwind {
    fn from(value: Error) -> Self {
        Unwind::Fault(value)
    }
}

/// Outcome of a top-level call.
#[derive(Debug, Clone)]
pub enum Completion {
    Returned(Value),
    Threw(Value),
}

impl Completion {
    pub fn returned(self) -> Option<Value> {
        match self {
            Completion::Returned(v) => Some(v),
            Completion::Threw(_) => None,
        }
    }

    pub fn threw(self) -> Option<Value> {
        match self {
            Completion::Threw(v) => Some(v),
            Completion::Returned(_) => None,
        }
    }
}

/// Implementation of a body-less method. Receives `this` first for
/// instance methods.
pub type Native = Rc<dyn Fn(&mut Interpreter<'_>, &[Value]) -> Result<Value, Unwind>>;

enum Step {
    Next,
    Jump(usize),
    Leave(usize),
    Return(Value),
    EndFinally,
}

enum Exit {
    Return(Value),
    EndFinally,
}

struct BodyCtx<'b> {
    name: String,
    returns_value: bool,
    instrs: Vec<&'b Instr>,
    positions: HashMap<InstrId, usize>,
    spans: Vec<RegionSpan>,
}

impl BodyCtx<'_> {
    fn pos(&self, id: InstrId, at: usize) -> Result<usize, Unwind> {
        self.positions
            .get(&id)
            .copied()
            .ok_or(Unwind::Fault(Error::UnlinkedTarget { at }))
    }

    fn fault(&self, at: usize, reason: impl Into<String>) -> Unwind {
        Unwind::Fault(Error::InterpreterFault {
            method: self.name.clone(),
            at,
            reason: reason.into(),
        })
    }
}

struct Frame {
    args: Vec<Value>,
    locals: Vec<Value>,
    stack: Vec<Value>,
    caught: Vec<Value>,
}

impl Frame {
    fn pop(&mut self, ctx: &BodyCtx<'_>, at: usize) -> Result<Value, Unwind> {
        self.stack.pop().ok_or_else(|| ctx.fault(at, "stack underflow"))
    }

    fn pop_n(&mut self, n: usize, ctx: &BodyCtx<'_>, at: usize) -> Result<Vec<Value>, Unwind> {
        if self.stack.len() < n {
            return Err(ctx.fault(at, "stack underflow"));
        }
        Ok(self.stack.split_off(self.stack.len() - n))
    }
}

pub struct Interpreter<'u> {
    unit: &'u ProgramUnit,
    statics: HashMap<FieldId, Value>,
    initialized: HashSet<TypeId>,
    natives: HashMap<(String, String), Native>,
    depth: usize,
}

impl<'u> Interpreter<'u> {
    pub fn new(unit: &'u ProgramUnit) -> Self {
        Self {
            unit,
            statics: HashMap::new(),
            initialized: HashSet::new(),
            natives: HashMap::new(),
            depth: 0,
        }
    }

    pub fn unit(&self) -> &'u ProgramUnit {
        self.unit
    }

    /// Serve calls to `type_name::method_name` (any arity) with `native`.
    pub fn register_native(
        &mut self,
        type_name: &str,
        method_name: &str,
        native: impl Fn(&mut Interpreter<'_>, &[Value]) -> Result<Value, Unwind> + 'static,
    ) {
        self.natives
            .insert((type_name.to_string(), method_name.to_string()), Rc::new(native));
    }

    /// Call `method` with `args` (`this` first for instance methods).
    pub fn call(&mut self, method: MethodId, args: Vec<Value>) -> Result<Completion, Error> {
        match self.invoke(method, args) {
            Ok(v) => Ok(Completion::Returned(v)),
            Err(Unwind::Throw(ex)) => Ok(Completion::Threw(ex)),
            Err(Unwind::Fault(err)) => Err(err),
        }
    }

    /// Create an instance of the type declaring `ctor` and run `ctor` on it.
    pub fn construct(&mut self, ctor: MethodId, args: Vec<Value>) -> Result<Completion, Error> {
        let ty = self
            .unit
            .method(ctor)
            .ok_or(Error::InvalidHandle { kind: "method" })?
            .declaring_type;
        match self.new_object(ty, ctor, args) {
            Ok(v) => Ok(Completion::Returned(v)),
            Err(Unwind::Throw(ex)) => Ok(Completion::Threw(ex)),
            Err(Unwind::Fault(err)) => Err(err),
        }
    }

    /// Allocate an object without running any constructor.
    pub fn alloc_object(&self, ty: TypeId) -> Value {
        Value::Obj(Rc::new(RefCell::new(Object {
            ty,
            fields: HashMap::new(),
        })))
    }

    /// Current value of a static field, if the type was initialized or the
    /// field assigned.
    pub fn static_value(&self, field: FieldId) -> Option<Value> {
        self.statics.get(&field).cloned()
    }

    /// Build an exception of the type named `type_name`, for natives that
    /// want to throw.
    pub fn exception(&self, type_name: &str) -> Unwind {
        match self.unit.type_by_name(type_name) {
            Some(ty) => Unwind::Throw(self.alloc_object(ty)),
            None => Unwind::Fault(Error::UnresolvedType {
                name: type_name.to_string(),
            }),
        }
    }

    /// Whether `value` is an instance of `ty`.
    pub fn is_instance(&self, value: &Value, ty: Typeref) -> bool {
        let (Some(runtime), Some(name)) = (value.object_type(), self.unit.registry.full_name(ty)) else {
            return false;
        };
        self.unit.implements(runtime, &name)
    }

    fn default_value(&self, ty: Typeref) -> Value {
        match self.unit.registry.get_cloned(ty) {
            Some(AnyType::Primitive(Primitive::Void)) => Value::Null,
            Some(AnyType::Primitive(Primitive::I64 | Primitive::U64)) => Value::I64(0),
            Some(AnyType::Primitive(_)) => Value::I32(0),
            Some(AnyType::Named(named)) if named.value_type => match self.unit.type_by_name(&named.full_name) {
                Some(def) => self.alloc_object(def),
                None => Value::Null,
            },
            _ => Value::Null,
        }
    }

    fn ensure_initialized(&mut self, ty: TypeId) -> Result<(), Unwind> {
        if !self.initialized.insert(ty) {
            return Ok(());
        }
        if let Some(cctor) = self.unit.static_constructor(ty) {
            log::trace!("Running type initializer of {}", self.unit.method_display(cctor));
            self.invoke(cctor, Vec::new())?;
        }
        Ok(())
    }

    fn new_object(&mut self, ty: TypeId, ctor: MethodId, args: Vec<Value>) -> Result<Value, Unwind> {
        self.ensure_initialized(ty)?;
        let obj = self.alloc_object(ty);
        let mut full = Vec::with_capacity(args.len() + 1);
        full.push(obj.clone());
        full.extend(args);
        self.invoke(ctor, full)?;
        Ok(obj)
    }

    fn invoke(&mut self, method: MethodId, args: Vec<Value>) -> Result<Value, Unwind> {
        let unit = self.unit;
        let def = unit.method(method).ok_or(Error::InvalidHandle { kind: "method" })?;
        if def.is_static() {
            self.ensure_initialized(def.declaring_type)?;
        }

        if self.depth >= MAX_CALL_DEPTH {
            return Err(Unwind::Fault(Error::InterpreterFault {
                method: unit.method_display(method),
                at: 0,
                reason: "call depth exceeded".to_string(),
            }));
        }

        self.depth += 1;
        let result = match &def.body {
            Some(body) => self.run_body(method, def, body, args),
            None => self.invoke_native(method, def, &args),
        };
        self.depth -= 1;
        result
    }

    fn invoke_native(&mut self, method: MethodId, def: &MethodDef, args: &[Value]) -> Result<Value, Unwind> {
        let owner = self
            .unit
            .type_def(def.declaring_type)
            .map(|t| t.full_name.clone())
            .unwrap_or_default();
        match self.natives.get(&(owner, def.name.clone())).cloned() {
            Some(native) => native(self, args),
            None if def.kind.is_any_constructor() => Ok(Value::Null),
            None => Err(Unwind::Fault(Error::NoImplementation {
                method: self.unit.method_display(method),
            })),
        }
    }

    fn run_body(&mut self, method: MethodId, def: &MethodDef, body: &MethodBody, args: Vec<Value>) -> Result<Value, Unwind> {
        let ctx = BodyCtx {
            name: self.unit.method_display(method),
            returns_value: def.returns_value(),
            instrs: body.iter().map(|(_, i)| i).collect(),
            positions: body.iter().enumerate().map(|(pos, (id, _))| (id, pos)).collect(),
            spans: body.region_spans()?,
        };
        if ctx.instrs.is_empty() {
            return Err(Error::EmptyBody { method: ctx.name }.into());
        }

        let mut frame = Frame {
            args,
            locals: body.locals.iter().map(|l| self.default_value(l.ty)).collect(),
            stack: Vec::new(),
            caught: Vec::new(),
        };

        match self.exec(&ctx, &mut frame, 0)? {
            Exit::Return(v) => Ok(v),
            Exit::EndFinally => Err(ctx.fault(0, "endfinally outside of a finally handler")),
        }
    }

    fn exec(&mut self, ctx: &BodyCtx<'_>, frame: &mut Frame, start: usize) -> Result<Exit, Unwind> {
        let mut pc = start;
        loop {
            if pc >= ctx.instrs.len() {
                return Err(ctx.fault(pc, "control ran past the last instruction"));
            }

            match self.step(ctx, frame, pc) {
                Ok(Step::Next) => pc += 1,
                Ok(Step::Jump(target)) => pc = target,
                Ok(Step::Leave(target)) => {
                    self.run_finally_handlers(ctx, frame, pc, Some(target))?;
                    frame.stack.clear();
                    pc = target;
                }
                Ok(Step::Return(v)) => {
                    self.run_finally_handlers(ctx, frame, pc, None)?;
                    return Ok(Exit::Return(v));
                }
                Ok(Step::EndFinally) => return Ok(Exit::EndFinally),
                Err(Unwind::Throw(ex)) => pc = self.dispatch(ctx, frame, pc, ex)?,
                Err(fault) => return Err(fault),
            }
        }
    }

    /// Run the finally handlers exited when control moves from `from` to
    /// `to` (`None` when leaving the method), innermost first.
    fn run_finally_handlers(&mut self, ctx: &BodyCtx<'_>, frame: &mut Frame, from: usize, to: Option<usize>) -> Result<(), Unwind> {
        for span in &ctx.spans {
            let exited = span.in_try(from) && !to.is_some_and(|t| span.in_try(t));
            if exited && span.kind == HandlerKind::Finally {
                self.run_handler(ctx, frame, span)?;
            }
        }
        Ok(())
    }

    fn run_handler(&mut self, ctx: &BodyCtx<'_>, frame: &mut Frame, span: &RegionSpan) -> Result<(), Unwind> {
        let saved = std::mem::take(&mut frame.stack);
        match self.exec(ctx, frame, span.handler_range.0)? {
            Exit::EndFinally => {
                frame.stack = saved;
                Ok(())
            }
            Exit::Return(_) => Err(ctx.fault(span.handler_range.0, "return from a finally handler")),
        }
    }

    /// Find the handler for an exception thrown at `at`, running finally
    /// and fault handlers on the way. Returns the position to resume at.
    fn dispatch(&mut self, ctx: &BodyCtx<'_>, frame: &mut Frame, at: usize, ex: Value) -> Result<usize, Unwind> {
        for span in &ctx.spans {
            if !span.in_try(at) {
                continue;
            }
            match span.kind {
                HandlerKind::Catch(ty) => {
                    if self.is_instance(&ex, ty) {
                        frame.stack.clear();
                        frame.stack.push(ex.clone());
                        frame.caught.push(ex);
                        return Ok(span.handler_range.0);
                    }
                }
                HandlerKind::Finally | HandlerKind::Fault => self.run_handler(ctx, frame, span)?,
            }
        }
        Err(Unwind::Throw(ex))
    }

    fn null_reference(&self, ctx: &BodyCtx<'_>, at: usize) -> Unwind {
        match self.unit.type_by_name("System.NullReferenceException") {
            Some(ty) => Unwind::Throw(self.alloc_object(ty)),
            None => ctx.fault(at, "null reference"),
        }
    }

    fn object<'v>(&self, value: &'v Value, ctx: &BodyCtx<'_>, at: usize) -> Result<&'v ObjRef, Unwind> {
        match value {
            Value::Obj(o) => Ok(o),
            Value::Null => Err(self.null_reference(ctx, at)),
            other => Err(ctx.fault(at, format!("expected an object, found {:?}", other))),
        }
    }

    fn field_default(&self, field: &FieldRef) -> Value {
        match self.unit.field_type(field) {
            Ok(ty) => self.default_value(ty),
            Err(_) => Value::Null,
        }
    }

    fn int_binop(&self, ctx: &BodyCtx<'_>, at: usize, a: Value, b: Value, op: &Instr) -> Result<Value, Unwind> {
        let wide = matches!(a, Value::I64(_)) || matches!(b, Value::I64(_));
        let (Some(x), Some(y)) = (a.as_i64(), b.as_i64()) else {
            return Err(ctx.fault(at, format!("{} expects integers", op.op().opname())));
        };
        let r = match op {
            Instr::And => x & y,
            Instr::Or => x | y,
            Instr::Xor => x ^ y,
            Instr::Add => x.wrapping_add(y),
            Instr::Sub => x.wrapping_sub(y),
            Instr::Cgt => i64::from(x > y),
            Instr::Clt => i64::from(x < y),
            _ => return Err(ctx.fault(at, "not a binary integer operation")),
        };
        Ok(if wide && !matches!(op, Instr::Cgt | Instr::Clt) {
            Value::I64(r)
        } else {
            Value::I32(r as i32)
        })
    }

    fn call_instr(&mut self, ctx: &BodyCtx<'_>, frame: &mut Frame, at: usize, target: &MethodRef, virtual_call: bool) -> Result<(), Unwind> {
        let unit = self.unit;
        let def = unit.method(target.method).ok_or(Error::InvalidHandle { kind: "method" })?;
        let mut args = frame.pop_n(def.params.len(), ctx, at)?;

        let mut resolved = target.method;
        if !def.is_static() {
            let this = frame.pop(ctx, at)?;
            let runtime = self.object(&this, ctx, at)?.borrow().ty;
            if virtual_call
                && let Some(found) = unit.find_method_in_hierarchy(runtime, &def.name, def.params.len())
            {
                resolved = found;
            }
            args.insert(0, this);
        }

        let result = self.invoke(resolved, args)?;
        if def.returns_value() {
            frame.stack.push(result);
        }
        Ok(())
    }

    fn step(&mut self, ctx: &BodyCtx<'_>, frame: &mut Frame, at: usize) -> Result<Step, Unwind> {
        let instr = ctx.instrs[at];
        match instr {
            Instr::Nop => {}
            Instr::LdArg(i) => {
                let v = frame
                    .args
                    .get(usize::from(*i))
                    .cloned()
                    .ok_or_else(|| ctx.fault(at, "argument out of range"))?;
                frame.stack.push(v);
            }
            Instr::StArg(i) => {
                let v = frame.pop(ctx, at)?;
                let slot = frame
                    .args
                    .get_mut(usize::from(*i))
                    .ok_or_else(|| ctx.fault(at, "argument out of range"))?;
                *slot = v;
            }
            Instr::LdArgA(i) => frame.stack.push(Value::Addr(Slot::Arg(*i))),
            Instr::LdLoc(l) => {
                let v = frame
                    .locals
                    .get(usize::from(l.0))
                    .cloned()
                    .ok_or_else(|| ctx.fault(at, "local out of range"))?;
                frame.stack.push(v);
            }
            Instr::StLoc(l) => {
                let v = frame.pop(ctx, at)?;
                let slot = frame
                    .locals
                    .get_mut(usize::from(l.0))
                    .ok_or_else(|| ctx.fault(at, "local out of range"))?;
                *slot = v;
            }
            Instr::LdLocA(l) => frame.stack.push(Value::Addr(Slot::Local(l.0))),
            Instr::LdNull => frame.stack.push(Value::Null),
            Instr::LdcI4(v) => frame.stack.push(Value::I32(*v)),
            Instr::LdcI8(v) => frame.stack.push(Value::I64(*v)),
            Instr::LdStr(s) => frame.stack.push(Value::str(s)),
            Instr::LdToken(Token::Type(t)) => frame.stack.push(Value::Type(*t)),
            Instr::LdToken(Token::Method(m)) => frame.stack.push(Value::Method(*m)),

            Instr::LdFld(fr) => {
                let target = frame.pop(ctx, at)?;
                let v = self
                    .object(&target, ctx, at)?
                    .borrow()
                    .fields
                    .get(&fr.field)
                    .cloned();
                let v = v.unwrap_or_else(|| self.field_default(fr));
                frame.stack.push(v);
            }
            Instr::StFld(fr) => {
                let v = frame.pop(ctx, at)?;
                let target = frame.pop(ctx, at)?;
                self.object(&target, ctx, at)?
                    .borrow_mut()
                    .fields
                    .insert(fr.field, v);
            }
            Instr::LdSFld(fr) => {
                let owner = self.field_owner(fr)?;
                self.ensure_initialized(owner)?;
                let v = match self.statics.get(&fr.field) {
                    Some(v) => v.clone(),
                    None => self.field_default(fr),
                };
                frame.stack.push(v);
            }
            Instr::StSFld(fr) => {
                let owner = self.field_owner(fr)?;
                self.ensure_initialized(owner)?;
                let v = frame.pop(ctx, at)?;
                self.statics.insert(fr.field, v);
            }

            Instr::Call(m) => self.call_instr(ctx, frame, at, m, false)?,
            Instr::CallVirt(m) => self.call_instr(ctx, frame, at, m, true)?,
            Instr::NewObj(m) => {
                let def = self.unit.method(m.method).ok_or(Error::InvalidHandle { kind: "method" })?;
                let args = frame.pop_n(def.params.len(), ctx, at)?;
                let obj = self.new_object(def.declaring_type, m.method, args)?;
                frame.stack.push(obj);
            }

            Instr::CastClass(t) => {
                let v = frame.pop(ctx, at)?;
                if v.is_obj() && !self.is_instance(&v, *t) {
                    return Err(match self.unit.type_by_name("System.InvalidCastException") {
                        Some(ty) => Unwind::Throw(self.alloc_object(ty)),
                        None => ctx.fault(at, "invalid cast"),
                    });
                }
                frame.stack.push(v);
            }
            Instr::IsInst(t) => {
                let v = frame.pop(ctx, at)?;
                let keep = !v.is_obj() || self.is_instance(&v, *t);
                frame.stack.push(if keep { v } else { Value::Null });
            }
            Instr::Box(_) | Instr::UnboxAny(_) => {}
            Instr::NewArr(_) => {
                let len = frame.pop(ctx, at)?;
                let len = len
                    .as_i64()
                    .and_then(|l| usize::try_from(l).ok())
                    .ok_or_else(|| ctx.fault(at, "invalid array length"))?;
                frame
                    .stack
                    .push(Value::Array(Rc::new(RefCell::new(vec![Value::Null; len]))));
            }
            Instr::StElemRef => {
                let v = frame.pop(ctx, at)?;
                let index = frame.pop(ctx, at)?;
                let array = frame.pop(ctx, at)?;
                let (Value::Array(array), Some(index)) = (array, index.as_i64()) else {
                    return Err(ctx.fault(at, "stelem.ref expects an array and an index"));
                };
                let mut array = array.borrow_mut();
                let slot = usize::try_from(index)
                    .ok()
                    .and_then(|i| array.get_mut(i))
                    .ok_or_else(|| ctx.fault(at, "index out of range"))?;
                *slot = v;
            }
            Instr::LdElemRef => {
                let index = frame.pop(ctx, at)?;
                let array = frame.pop(ctx, at)?;
                let (Value::Array(array), Some(index)) = (array, index.as_i64()) else {
                    return Err(ctx.fault(at, "ldelem.ref expects an array and an index"));
                };
                let v = usize::try_from(index)
                    .ok()
                    .and_then(|i| array.borrow().get(i).cloned())
                    .ok_or_else(|| ctx.fault(at, "index out of range"))?;
                frame.stack.push(v);
            }
            Instr::InitObj(t) => {
                let addr = frame.pop(ctx, at)?;
                let v = self.default_value(*t);
                let slot = match addr {
                    Value::Addr(Slot::Local(l)) => frame.locals.get_mut(usize::from(l)),
                    Value::Addr(Slot::Arg(a)) => frame.args.get_mut(usize::from(a)),
                    _ => None,
                };
                *slot.ok_or_else(|| ctx.fault(at, "initobj expects an address"))? = v;
            }

            Instr::Dup => {
                let v = frame.stack.last().cloned().ok_or_else(|| ctx.fault(at, "stack underflow"))?;
                frame.stack.push(v);
            }
            Instr::Pop => {
                frame.pop(ctx, at)?;
            }
            Instr::Ceq => {
                let b = frame.pop(ctx, at)?;
                let a = frame.pop(ctx, at)?;
                let eq = match (a.as_i64(), b.as_i64()) {
                    (Some(x), Some(y)) => x == y,
                    _ => a.same(&b),
                };
                frame.stack.push(Value::bool(eq));
            }
            Instr::Cgt | Instr::Clt | Instr::And | Instr::Or | Instr::Xor | Instr::Add | Instr::Sub => {
                let b = frame.pop(ctx, at)?;
                let a = frame.pop(ctx, at)?;
                let v = self.int_binop(ctx, at, a, b, instr)?;
                frame.stack.push(v);
            }
            Instr::Not => {
                let v = match frame.pop(ctx, at)? {
                    Value::I32(v) => Value::I32(!v),
                    Value::I64(v) => Value::I64(!v),
                    _ => return Err(ctx.fault(at, "not expects an integer")),
                };
                frame.stack.push(v);
            }

            Instr::Br(t) => return Ok(Step::Jump(ctx.pos(*t, at)?)),
            Instr::BrTrue(t) => {
                if frame.pop(ctx, at)?.truthy() {
                    return Ok(Step::Jump(ctx.pos(*t, at)?));
                }
            }
            Instr::BrFalse(t) => {
                if !frame.pop(ctx, at)?.truthy() {
                    return Ok(Step::Jump(ctx.pos(*t, at)?));
                }
            }
            Instr::Leave(t) => return Ok(Step::Leave(ctx.pos(*t, at)?)),
            Instr::EndFinally => return Ok(Step::EndFinally),
            Instr::Throw => {
                let ex = frame.pop(ctx, at)?;
                return Err(match ex {
                    Value::Null => self.null_reference(ctx, at),
                    Value::Obj(_) => Unwind::Throw(ex),
                    other => ctx.fault(at, format!("cannot throw {:?}", other)),
                });
            }
            Instr::Rethrow => {
                let ex = frame
                    .caught
                    .last()
                    .cloned()
                    .ok_or_else(|| ctx.fault(at, "rethrow outside of a catch handler"))?;
                return Err(Unwind::Throw(ex));
            }
            Instr::Ret => {
                let v = if ctx.returns_value {
                    frame.pop(ctx, at)?
                } else {
                    Value::Null
                };
                return Ok(Step::Return(v));
            }
        }
        Ok(Step::Next)
    }

    fn field_owner(&self, field: &FieldRef) -> Result<TypeId, Unwind> {
        self.unit
            .field(field.field)
            .map(|f| f.declaring_type)
            .ok_or(Unwind::Fault(Error::InvalidHandle { kind: "field" }))
    }
}
