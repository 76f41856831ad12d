//! Code builder
//!
//! A [`Coder`] builds a sequence of instructions for one method body and
//! then commits it, either by inserting it at an explicit
//! [`InsertionPosition`] or by replacing the whole body. Callers never deal
//! with offsets or stack depth: loads and stores are expressed with
//! [`Operand`]s, jumps with labels, and structured blocks (if/else,
//! try/catch/finally, boolean expressions) track their own markers.
//!
//! ```rust
//! # use loomir::{coder::{InsertionPosition, Operand}, program::*, body::*, types::Typeref};
//! let mut unit = ProgramUnit::new("doc");
//! let ty = unit.add_type(TypeDef::new("N.T", TypeKind::Class)).unwrap();
//! let (body, _) = MethodBody::from_instrs([Instr::Ret]);
//! let m = unit.add_method(ty, MethodDef::ordinary("M", Typeref::VOID).with_body(body)).unwrap();
//!
//! unit.with_coder(m, |c| {
//!     c.is_null(Operand::This)?.then(|c| c.throw_null())?.end_if()?;
//!     c.insert(InsertionPosition::Beginning)
//! }).unwrap();
//! ```
//!
//! Misuse (an unclosed block, a combinator without a left operand, a label
//! placed twice, ...) is reported immediately as a [`CoderError`].
use std::collections::HashSet;

use smallvec::SmallVec;
use thiserror::Error;

use crate::{
    body::{ExceptionHandler, Instr, InstrId, LocalId, MethodBody, Token},
    program::{FieldRef, MethodDef, MethodId, MethodRef, ProgramUnit},
    types::{AnyType, Primitive, Typeref},
    utils::Error,
};

pub use condition::{BoolExpr, IfCoder};
pub use try_block::TryCoder;

pub mod condition;
pub mod try_block;

/// Root type of every reference type, used for boxed argument arrays.
pub const OBJECT_TYPE: &str = "System.Object";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CoderError {
    #[error("A boolean combinator was used without a left operand.")]
    MissingLeftOperand,

    #[error("A boolean expression already has an operand; combine it before loading another one.")]
    DanglingOperand,

    #[error("{open} block(s) are still open; close them before committing the code.")]
    UnclosedBlock { open: usize },

    #[error("The label was already placed.")]
    LabelAlreadyPlaced,

    #[error("A try block must contain at least one instruction.")]
    EmptyTry,

    #[error("A try block needs a catch or a finally handler.")]
    TryWithoutHandler,

    #[error("A try block can have at most one catch handler.")]
    DuplicateCatch,

    #[error("A try block can have at most one finally handler.")]
    DuplicateFinally,

    #[error("The catch handler must come before the finally handler.")]
    CatchAfterFinally,

    #[error("An if block can have at most one else branch.")]
    DuplicateElse,

    #[error("Method `{method}` returns void and cannot return a value.")]
    ReturnValueOnVoid { method: String },

    #[error("A return cannot be emitted inside an open block; use return_default or leave instead.")]
    ReturnInsideBlock,

    #[error("Static method `{method}` has no `this`.")]
    NoThisInStatic { method: String },

    #[error("Instance field `{field}` cannot be reached from a static method without an explicit instance.")]
    InstanceFieldFromStatic { field: String },

    #[error("Argument {index} is out of range.")]
    ArgumentOutOfRange { index: u16 },

    #[error("Method `{method}` expects {expected} argument(s) but {found} were given.")]
    ArgumentCount {
        method: String,
        expected: usize,
        found: usize,
    },

    #[error("Instance method `{method}` needs an instance to be called on.")]
    MissingInstance { method: String },

    #[error("Static method `{method}` cannot be called on an instance.")]
    UnexpectedInstance { method: String },

    #[error("The current exception can only be loaded inside a catch handler.")]
    NoExceptionInScope,

    #[error("The original body was already spliced in.")]
    OriginalBodyTwice,

    #[error("The original body can only be spliced in when replacing the body.")]
    OriginalBodyOutsideReplace,

    #[error("There is no default value of type void.")]
    NoDefaultForVoid,

    #[error("The operand cannot be assigned to.")]
    NotAssignable,

    #[error(transparent)]
    Ir(#[from] Error),
}

/// A value the coder knows how to load (and for some variants, store).
#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    /// `this` of the current instance method.
    This,
    /// Parameter by position, not counting `this`.
    Arg(u16),
    Local(LocalId),
    /// Static field, or instance field of `this`.
    Field(FieldRef),
    /// Instance field of the object loaded by the inner operand.
    FieldOf(Box<Operand>, FieldRef),
    Null,
    I32(i32),
    I64(i64),
    Bool(bool),
    Str(String),
    TypeOf(Typeref),
    MethodOf(MethodId),
    /// Exception caught by the innermost enclosing catch handler.
    Exception,
    /// Object array holding every parameter, boxed where needed.
    Arguments,
    /// Default value of a type (zero, null, or a zeroed struct).
    Default(Typeref),
}

/// Where committed code goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertionPosition {
    Beginning,
    End,
    Before(InstrId),
    After(InstrId),
}

#[derive(Debug, Clone, Copy)]
struct ReturnSlot {
    local: Option<LocalId>,
    label: InstrId,
}

pub struct Coder<'a> {
    unit: &'a ProgramUnit,
    method: MethodId,
    def: &'a MethodDef,
    body: &'a mut MethodBody,
    emitted: Vec<InstrId>,
    handlers: Vec<ExceptionHandler>,
    placed: HashSet<InstrId>,
    ret: Option<ReturnSlot>,
    original_spliced: bool,
    open_blocks: usize,
    exception_locals: Vec<LocalId>,
}

impl ProgramUnit {
    /// Run `f` with a coder over the body of `method`. The body is detached
    /// from the method while `f` runs and put back afterwards, whether `f`
    /// succeeded or not.
    pub fn with_coder<R>(
        &mut self,
        method: MethodId,
        f: impl FnOnce(&mut Coder<'_>) -> Result<R, CoderError>,
    ) -> Result<R, CoderError> {
        let def = self
            .method_mut(method)
            .ok_or(Error::InvalidHandle { kind: "method" })?;
        let Some(mut body) = def.body.take() else {
            return Err(Error::MissingBody {
                method: self.method_display(method),
            }
            .into());
        };

        let result = match self.method(method) {
            Some(def) => {
                let mut coder = Coder::new(self, method, def, &mut body);
                f(&mut coder)
            }
            None => Err(Error::InvalidHandle { kind: "method" }.into()),
        };

        if let Some(def) = self.method_mut(method) {
            def.body = Some(body);
        }
        result
    }
}

impl<'a> Coder<'a> {
    fn new(unit: &'a ProgramUnit, method: MethodId, def: &'a MethodDef, body: &'a mut MethodBody) -> Self {
        Self {
            unit,
            method,
            def,
            body,
            emitted: Vec::new(),
            handlers: Vec::new(),
            placed: HashSet::new(),
            ret: None,
            original_spliced: false,
            open_blocks: 0,
            exception_locals: Vec::new(),
        }
    }

    pub fn unit(&self) -> &'a ProgramUnit {
        self.unit
    }

    pub fn method(&self) -> MethodId {
        self.method
    }

    /// Current state of the body being edited. While the original body is
    /// spliced in, its instructions are not linked.
    pub fn body(&self) -> &MethodBody {
        self.body
    }

    fn method_name(&self) -> String {
        self.unit.method_display(self.method)
    }

    pub(crate) fn emit(&mut self, instr: Instr) -> InstrId {
        let id = self.body.alloc(instr);
        self.emitted.push(id);
        id
    }

    /// Allocate a label to be placed later with [`Self::mark`].
    pub fn label(&mut self) -> InstrId {
        self.body.alloc(Instr::Nop)
    }

    /// Place a label at the current position.
    pub fn mark(&mut self, label: InstrId) -> Result<&mut Self, CoderError> {
        if !self.placed.insert(label) {
            return Err(CoderError::LabelAlreadyPlaced);
        }
        self.emitted.push(label);
        Ok(self)
    }

    pub fn declare_local(&mut self, ty: Typeref, name: Option<&str>) -> LocalId {
        self.body.declare_local(ty, name.map(str::to_string))
    }

    fn arg_offset(&self) -> u16 {
        u16::from(!self.def.is_static())
    }

    fn require_instance(&self) -> Result<(), CoderError> {
        if self.def.is_static() {
            return Err(CoderError::NoThisInStatic {
                method: self.method_name(),
            });
        }
        Ok(())
    }

    fn operand_type(&self, op: &Operand) -> Option<Typeref> {
        match op {
            Operand::This => self.unit.self_instance(self.def.declaring_type).ok(),
            Operand::Arg(i) => self.def.params.get(usize::from(*i)).map(|p| p.ty),
            Operand::Local(l) => self.body.locals.get(usize::from(l.0)).map(|l| l.ty),
            Operand::Field(fr) | Operand::FieldOf(_, fr) => self.unit.field_type(fr).ok(),
            Operand::I32(_) => Some(Typeref::I32),
            Operand::I64(_) => Some(Typeref::I64),
            Operand::Bool(_) => Some(Typeref::BOOL),
            Operand::Default(t) => Some(*t),
            Operand::Null
            | Operand::Str(_)
            | Operand::TypeOf(_)
            | Operand::MethodOf(_)
            | Operand::Exception
            | Operand::Arguments => None,
        }
    }

    fn object_type(&self) -> Typeref {
        self.unit.registry.named(OBJECT_TYPE, false)
    }

    /// Push the value of `op`.
    pub fn load(&mut self, op: &Operand) -> Result<&mut Self, CoderError> {
        match op {
            Operand::This => {
                self.require_instance()?;
                self.emit(Instr::LdArg(0));
            }
            Operand::Arg(i) => {
                if usize::from(*i) >= self.def.params.len() {
                    return Err(CoderError::ArgumentOutOfRange { index: *i });
                }
                self.emit(Instr::LdArg(i + self.arg_offset()));
            }
            Operand::Local(l) => {
                self.emit(Instr::LdLoc(*l));
            }
            Operand::Field(fr) => {
                let field = self.unit.field(fr.field).ok_or(Error::InvalidHandle { kind: "field" })?;
                if field.is_static() {
                    self.emit(Instr::LdSFld(*fr));
                } else {
                    if self.def.is_static() {
                        return Err(CoderError::InstanceFieldFromStatic {
                            field: field.name.clone(),
                        });
                    }
                    self.emit(Instr::LdArg(0));
                    self.emit(Instr::LdFld(*fr));
                }
            }
            Operand::FieldOf(base, fr) => {
                self.load(base)?;
                self.emit(Instr::LdFld(*fr));
            }
            Operand::Null => {
                self.emit(Instr::LdNull);
            }
            Operand::I32(v) => {
                self.emit(Instr::LdcI4(*v));
            }
            Operand::I64(v) => {
                self.emit(Instr::LdcI8(*v));
            }
            Operand::Bool(b) => {
                self.emit(Instr::LdcI4(i32::from(*b)));
            }
            Operand::Str(s) => {
                self.emit(Instr::LdStr(s.clone()));
            }
            Operand::TypeOf(t) => {
                self.emit(Instr::LdToken(Token::Type(*t)));
            }
            Operand::MethodOf(m) => {
                self.emit(Instr::LdToken(Token::Method(*m)));
            }
            Operand::Exception => {
                let local = *self.exception_locals.last().ok_or(CoderError::NoExceptionInScope)?;
                self.emit(Instr::LdLoc(local));
            }
            Operand::Arguments => self.load_arguments(),
            Operand::Default(t) => self.load_default(*t)?,
        }
        Ok(self)
    }

    /// Load `op` for a slot of type `expected`, boxing value types passed
    /// where a reference is expected.
    fn load_as(&mut self, op: &Operand, expected: Typeref) -> Result<(), CoderError> {
        self.load(op)?;
        if let Some(actual) = self.operand_type(op)
            && actual != expected
            && self.unit.registry.needs_boxing(actual)
            && !self.unit.registry.needs_boxing(expected)
        {
            self.emit(Instr::Box(actual));
        }
        Ok(())
    }

    fn load_arguments(&mut self) {
        let object = self.object_type();
        let offset = self.arg_offset();
        let params: SmallVec<[Typeref; 4]> = self.def.params.iter().map(|p| p.ty).collect();

        self.emit(Instr::LdcI4(params.len() as i32));
        self.emit(Instr::NewArr(object));
        for (i, ty) in params.into_iter().enumerate() {
            self.emit(Instr::Dup);
            self.emit(Instr::LdcI4(i as i32));
            self.emit(Instr::LdArg(i as u16 + offset));
            if self.unit.registry.needs_boxing(ty) {
                self.emit(Instr::Box(ty));
            }
            self.emit(Instr::StElemRef);
        }
    }

    fn load_default(&mut self, ty: Typeref) -> Result<(), CoderError> {
        match self.unit.registry.get_cloned(ty) {
            Some(AnyType::Primitive(Primitive::Void)) => return Err(CoderError::NoDefaultForVoid),
            Some(AnyType::Primitive(Primitive::I64 | Primitive::U64)) => {
                self.emit(Instr::LdcI8(0));
            }
            Some(AnyType::Primitive(_)) => {
                self.emit(Instr::LdcI4(0));
            }
            _ if self.unit.registry.needs_boxing(ty) => {
                let tmp = self.declare_local(ty, None);
                self.emit(Instr::LdLocA(tmp));
                self.emit(Instr::InitObj(ty));
                self.emit(Instr::LdLoc(tmp));
            }
            _ => {
                self.emit(Instr::LdNull);
            }
        }
        Ok(())
    }

    /// Start an assignment to `target`.
    pub fn assign(&mut self, target: Operand) -> Assign<'_, 'a> {
        Assign { coder: self, target }
    }

    fn push_args(&mut self, method: &MethodRef, args: &[Operand]) -> Result<(), CoderError> {
        let (params, _) = self.unit.signature(method)?;
        if params.len() != args.len() {
            return Err(CoderError::ArgumentCount {
                method: self.unit.method_display(method.method),
                expected: params.len(),
                found: args.len(),
            });
        }
        for (arg, ty) in args.iter().zip(params) {
            self.load_as(arg, ty)?;
        }
        Ok(())
    }

    /// Push a new object built by `ctor`.
    pub fn new_obj(&mut self, ctor: MethodRef, args: &[Operand]) -> Result<&mut Self, CoderError> {
        self.push_args(&ctor, args)?;
        self.emit(Instr::NewObj(ctor));
        Ok(self)
    }

    /// Call `method` and leave its result, if any, on the stack. Instance
    /// methods are called with `callvirt`, static ones with `call`.
    pub fn push_call(
        &mut self,
        instance: Option<Operand>,
        method: MethodRef,
        args: &[Operand],
    ) -> Result<&mut Self, CoderError> {
        let def = self
            .unit
            .method(method.method)
            .ok_or(Error::InvalidHandle { kind: "method" })?;

        match (def.is_static(), instance) {
            (true, Some(_)) => {
                return Err(CoderError::UnexpectedInstance {
                    method: self.unit.method_display(method.method),
                });
            }
            (false, None) => {
                return Err(CoderError::MissingInstance {
                    method: self.unit.method_display(method.method),
                });
            }
            (true, None) => {
                self.push_args(&method, args)?;
                self.emit(Instr::Call(method));
            }
            (false, Some(instance)) => {
                self.load(&instance)?;
                self.push_args(&method, args)?;
                self.emit(Instr::CallVirt(method));
            }
        }
        Ok(self)
    }

    /// Call `method` as a statement, discarding its result.
    pub fn call(&mut self, instance: Option<Operand>, method: MethodRef, args: &[Operand]) -> Result<&mut Self, CoderError> {
        let returns = self
            .unit
            .method(method.method)
            .is_some_and(|def| def.returns_value());
        self.push_call(instance, method, args)?;
        if returns {
            self.emit(Instr::Pop);
        }
        Ok(self)
    }

    pub fn cast_class(&mut self, ty: Typeref) -> &mut Self {
        self.emit(Instr::CastClass(ty));
        self
    }

    pub fn pop(&mut self) -> &mut Self {
        self.emit(Instr::Pop);
        self
    }

    pub fn leave(&mut self, label: InstrId) -> &mut Self {
        self.emit(Instr::Leave(label));
        self
    }

    /// Throw the object on top of the stack.
    pub fn throw_(&mut self) -> &mut Self {
        self.emit(Instr::Throw);
        self
    }

    /// Throw `null`, which surfaces as a null reference failure at runtime.
    pub fn throw_null(&mut self) -> Result<(), CoderError> {
        self.emit(Instr::LdNull);
        self.emit(Instr::Throw);
        Ok(())
    }

    /// Rethrow the exception of the enclosing catch handler, preserving its
    /// identity.
    pub fn rethrow(&mut self) -> Result<(), CoderError> {
        if self.exception_locals.is_empty() {
            return Err(CoderError::NoExceptionInScope);
        }
        self.emit(Instr::Rethrow);
        Ok(())
    }

    fn return_slot(&mut self) -> ReturnSlot {
        if let Some(slot) = self.ret {
            return slot;
        }
        let local = self
            .def
            .returns_value()
            .then(|| self.body.declare_local(self.def.return_type, Some("<>returnValue".to_string())));
        let slot = ReturnSlot {
            local,
            label: self.label(),
        };
        self.ret = Some(slot);
        slot
    }

    /// Splice the original body in at the current position. Its `ret`s turn
    /// into a store of the return value and a `leave` to the shared return
    /// point placed by [`Self::return_`]; the `ret` handle is kept so jumps
    /// to it stay valid. The original exception regions are carried over; a
    /// handler that ran up to the end of the body now ends right after the
    /// spliced code.
    pub fn original_body(&mut self) -> Result<&mut Self, CoderError> {
        if self.original_spliced {
            return Err(CoderError::OriginalBodyTwice);
        }
        self.original_spliced = true;

        let slot = self.return_slot();
        let original = self.body.take_order();
        let mut handlers = std::mem::take(&mut self.body.handlers);

        for id in original {
            if matches!(self.body.get(id), Some(Instr::Ret)) {
                match slot.local {
                    Some(local) => {
                        self.body.replace(id, Instr::StLoc(local))?;
                        self.emitted.push(id);
                        self.emit(Instr::Leave(slot.label));
                    }
                    None => {
                        self.body.replace(id, Instr::Leave(slot.label))?;
                        self.emitted.push(id);
                    }
                }
            } else {
                self.emitted.push(id);
            }
        }

        if handlers.iter().any(|h| h.handler_end.is_none()) {
            let end = self.label();
            self.mark(end)?;
            for handler in handlers.iter_mut().filter(|h| h.handler_end.is_none()) {
                handler.handler_end = Some(end);
            }
        }

        self.handlers.extend(handlers);
        Ok(self)
    }

    /// Place the shared return point (if any) and return the stored return
    /// value.
    pub fn return_(&mut self) -> Result<&mut Self, CoderError> {
        if self.open_blocks > 0 {
            return Err(CoderError::ReturnInsideBlock);
        }
        if let Some(slot) = self.ret {
            self.mark(slot.label)?;
        }
        if self.def.returns_value() {
            if let Some(local) = self.return_slot().local {
                self.emit(Instr::LdLoc(local));
            }
        }
        self.emit(Instr::Ret);
        Ok(self)
    }

    /// Return `op` directly.
    pub fn return_value(&mut self, op: &Operand) -> Result<&mut Self, CoderError> {
        if !self.def.returns_value() {
            return Err(CoderError::ReturnValueOnVoid {
                method: self.method_name(),
            });
        }
        if self.open_blocks > 0 {
            return Err(CoderError::ReturnInsideBlock);
        }
        let ret = self.def.return_type;
        self.load_as(op, ret)?;
        self.emit(Instr::Ret);
        Ok(self)
    }

    /// Return the default value of the return type. Inside a block this
    /// stores the value and leaves to the shared return point.
    pub fn return_default(&mut self) -> Result<&mut Self, CoderError> {
        let ret = self.def.return_type;
        if self.open_blocks > 0 {
            let slot = self.return_slot();
            if let Some(local) = slot.local {
                self.load_default(ret)?;
                self.emit(Instr::StLoc(local));
            }
            self.emit(Instr::Leave(slot.label));
        } else {
            if self.def.returns_value() {
                self.load_default(ret)?;
            }
            self.emit(Instr::Ret);
        }
        Ok(self)
    }

    fn check_closed(&self) -> Result<(), CoderError> {
        if self.open_blocks > 0 {
            return Err(CoderError::UnclosedBlock {
                open: self.open_blocks,
            });
        }
        Ok(())
    }

    /// Link the built code into the body at `position`. New exception
    /// regions are listed before the existing ones.
    pub fn insert(&mut self, position: InsertionPosition) -> Result<(), CoderError> {
        self.check_closed()?;
        if self.original_spliced {
            return Err(CoderError::OriginalBodyOutsideReplace);
        }

        let index = match position {
            InsertionPosition::Beginning => 0,
            InsertionPosition::End => self.body.len(),
            InsertionPosition::Before(anchor) => self.body.position(anchor).ok_or(Error::UnlinkedInstruction)?,
            InsertionPosition::After(anchor) => {
                self.body.position(anchor).ok_or(Error::UnlinkedInstruction)? + 1
            }
        };

        let emitted = std::mem::take(&mut self.emitted);
        if index == self.body.len()
            && let Some(first) = emitted.first()
        {
            for handler in self.body.handlers.iter_mut().filter(|h| h.handler_end.is_none()) {
                handler.handler_end = Some(*first);
            }
        }
        self.body.splice_at(index, &emitted)?;

        let mut handlers = std::mem::take(&mut self.handlers);
        handlers.append(&mut self.body.handlers);
        self.body.handlers = handlers;

        self.body.validate(&self.method_name())?;
        Ok(())
    }

    /// Swap the whole body for the built code. Exception regions of the old
    /// body survive only if it was spliced in with [`Self::original_body`].
    pub fn replace(&mut self) -> Result<(), CoderError> {
        self.check_closed()?;

        let emitted = std::mem::take(&mut self.emitted);
        self.body.set_order(emitted);
        self.body.handlers = std::mem::take(&mut self.handlers);
        self.body.retain_linked();
        self.original_spliced = false;

        self.body.validate(&self.method_name())?;
        Ok(())
    }
}

/// Pending assignment, completed by one of [`Assign::value`],
/// [`Assign::new_obj`] or [`Assign::call`].
pub struct Assign<'c, 'a> {
    coder: &'c mut Coder<'a>,
    target: Operand,
}

impl<'a> Assign<'_, 'a> {
    fn target_type(&self) -> Option<Typeref> {
        self.coder.operand_type(&self.target)
    }

    fn store_with(self, value: impl FnOnce(&mut Coder<'a>) -> Result<(), CoderError>) -> Result<(), CoderError> {
        let coder = self.coder;
        let store = match &self.target {
            Operand::Field(fr) => {
                let field = coder.unit.field(fr.field).ok_or(Error::InvalidHandle { kind: "field" })?;
                if field.is_static() {
                    Instr::StSFld(*fr)
                } else {
                    if coder.def.is_static() {
                        return Err(CoderError::InstanceFieldFromStatic {
                            field: field.name.clone(),
                        });
                    }
                    coder.emit(Instr::LdArg(0));
                    Instr::StFld(*fr)
                }
            }
            Operand::FieldOf(base, fr) => {
                coder.load(base)?;
                Instr::StFld(*fr)
            }
            Operand::Local(l) => Instr::StLoc(*l),
            Operand::Arg(i) => {
                if usize::from(*i) >= coder.def.params.len() {
                    return Err(CoderError::ArgumentOutOfRange { index: *i });
                }
                Instr::StArg(i + coder.arg_offset())
            }
            _ => return Err(CoderError::NotAssignable),
        };

        value(coder)?;
        coder.emit(store);
        Ok(())
    }

    pub fn value(self, op: Operand) -> Result<(), CoderError> {
        let expected = self.target_type();
        self.store_with(|c| match expected {
            Some(ty) => c.load_as(&op, ty),
            None => c.load(&op).map(|_| ()),
        })
    }

    pub fn new_obj(self, ctor: MethodRef, args: &[Operand]) -> Result<(), CoderError> {
        self.store_with(|c| c.new_obj(ctor, args).map(|_| ()))
    }

    pub fn call(self, instance: Option<Operand>, method: MethodRef, args: &[Operand]) -> Result<(), CoderError> {
        self.store_with(|c| c.push_call(instance, method, args).map(|_| ()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        analysis::analyze_method,
        fmt::opcodes,
        program::{FieldDef, Modifiers, TypeDef, TypeKind},
    };

    fn fixture(ret: Typeref, body: MethodBody) -> (ProgramUnit, MethodId) {
        let mut unit = ProgramUnit::new("test");
        let ty = unit.add_type(TypeDef::new("N.T", TypeKind::Class)).unwrap();
        let m = unit
            .add_method(
                ty,
                MethodDef::ordinary("M", ret)
                    .with_param("x", Typeref::I32)
                    .with_body(body),
            )
            .unwrap();
        (unit, m)
    }

    #[test]
    fn insert_at_beginning_keeps_original_code() {
        let (body, ids) = MethodBody::from_instrs([Instr::LdArg(1), Instr::Ret]);
        let (mut unit, m) = fixture(Typeref::I32, body);
        unit.with_coder(m, |c| {
            c.assign(Operand::Arg(0)).value(Operand::I32(7))?;
            c.insert(InsertionPosition::Beginning)
        })
        .unwrap();

        let body = unit.method(m).unwrap().body.as_ref().unwrap();
        assert_eq!(opcodes(body), vec!["ldc.i4", "starg", "ldarg", "ret"]);
        assert_eq!(body.position(ids[0]), Some(2));
        analyze_method(&unit, m).unwrap();
    }

    #[test]
    fn replace_with_original_body_routes_returns_through_the_slot() {
        let mut body = MethodBody::new();
        let second = body.alloc(Instr::LdcI4(2));
        body.push(Instr::LdArg(1));
        body.push(Instr::BrFalse(second));
        body.push(Instr::LdcI4(1));
        let first_ret = body.push(Instr::Ret);
        body.splice_at(4, &[second]).unwrap();
        body.push(Instr::Ret);
        let (mut unit, m) = fixture(Typeref::I32, body);

        unit.with_coder(m, |c| {
            c.original_body()?;
            c.return_()?;
            c.replace()
        })
        .unwrap();

        let body = unit.method(m).unwrap().body.as_ref().unwrap();
        assert_eq!(
            opcodes(body),
            vec!["ldarg", "brfalse", "ldc.i4", "stloc", "leave", "ldc.i4", "stloc", "leave", "nop", "ldloc", "ret"]
        );
        assert!(matches!(body.get(first_ret), Some(Instr::StLoc(_))));
        analyze_method(&unit, m).unwrap();
    }

    /// `br Ltry; Lret: ldc.i4 7; ret; Ltry: nop; leave Lret; catch { pop; leave Lret }`
    /// with the catch running up to the end of the body.
    fn tail_catch_body() -> MethodBody {
        let (mut body, ids) = MethodBody::from_instrs([
            Instr::Br(InstrId::default()),
            Instr::LdcI4(7),
            Instr::Ret,
            Instr::Nop,
            Instr::Leave(InstrId::default()),
            Instr::Pop,
            Instr::Leave(InstrId::default()),
        ]);
        *body.get_mut(ids[0]).unwrap() = Instr::Br(ids[3]);
        *body.get_mut(ids[4]).unwrap() = Instr::Leave(ids[1]);
        *body.get_mut(ids[6]).unwrap() = Instr::Leave(ids[1]);
        body.handlers.push(ExceptionHandler {
            kind: crate::body::HandlerKind::Catch(Typeref::I32),
            try_start: ids[3],
            try_end: ids[5],
            handler_start: ids[5],
            handler_end: None,
        });
        body
    }

    #[test]
    fn spliced_tail_handler_stops_before_the_generated_handlers() {
        let (mut unit, m) = fixture(Typeref::I32, tail_catch_body());
        analyze_method(&unit, m).unwrap();

        unit.with_coder(m, |c| {
            c.try_(|c| {
                c.original_body()?;
                Ok(())
            })?
            .finally(|_| Ok(()))?
            .end_try()?;
            c.return_()?;
            c.replace()
        })
        .unwrap();

        let body = unit.method(m).unwrap().body.as_ref().unwrap();
        assert!(body.handlers[0].handler_end.is_some());
        let spans = body.region_spans().unwrap();
        assert_eq!(spans[1].kind, crate::body::HandlerKind::Finally);
        assert!(spans[0].handler_range.1 <= spans[1].try_range.1);
        assert!(spans[1].in_try(spans[0].handler_range.0));
        analyze_method(&unit, m).unwrap();
    }

    #[test]
    fn code_appended_after_a_tail_handler_stays_outside_it() {
        let (mut unit, m) = fixture(Typeref::I32, tail_catch_body());
        unit.with_coder(m, |c| {
            c.return_value(&Operand::I32(1))?;
            c.insert(InsertionPosition::End)
        })
        .unwrap();

        let body = unit.method(m).unwrap().body.as_ref().unwrap();
        let spans = body.region_spans().unwrap();
        assert_eq!(spans[0].handler_range, (5, 7));
        assert_eq!(opcodes(body)[7..], ["ldc.i4", "ret"]);
        analyze_method(&unit, m).unwrap();
    }

    #[test]
    fn unclosed_blocks_cannot_be_committed() {
        let (body, _) = MethodBody::from_instrs([Instr::Ret]);
        let (mut unit, m) = fixture(Typeref::VOID, body);
        let err = unit.with_coder(m, |c| {
            drop(c.is_true(Operand::Bool(true))?);
            c.insert(InsertionPosition::End)
        });
        assert_eq!(err, Err(CoderError::UnclosedBlock { open: 1 }));
    }

    #[test]
    fn contract_violations_fail_fast() {
        let (body, _) = MethodBody::from_instrs([Instr::Ret]);
        let (mut unit, m) = fixture(Typeref::VOID, body);
        let ty = unit.method(m).unwrap().declaring_type;
        let counter = unit
            .add_field(ty, FieldDef::new("count", Typeref::I32, Modifiers::PRIVATE))
            .unwrap();
        let counter = unit.field_ref(counter, None).unwrap();

        assert_eq!(
            unit.with_coder(m, |c| c.return_value(&Operand::I32(1)).map(|_| ())),
            Err(CoderError::ReturnValueOnVoid { method: "N.T::M".into() })
        );
        assert_eq!(
            unit.with_coder(m, |c| c.load(&Operand::Arg(3)).map(|_| ())),
            Err(CoderError::ArgumentOutOfRange { index: 3 })
        );
        assert_eq!(
            unit.with_coder(m, |c| {
                let label = c.label();
                c.mark(label)?;
                c.mark(label).map(|_| ())
            }),
            Err(CoderError::LabelAlreadyPlaced)
        );
        assert_eq!(
            unit.with_coder(m, |c| c.rethrow()),
            Err(CoderError::NoExceptionInScope)
        );
        unit.with_coder(m, |c| {
            c.assign(Operand::Field(counter)).value(Operand::I32(3))?;
            c.insert(InsertionPosition::Beginning)
        })
        .unwrap();
        analyze_method(&unit, m).unwrap();
    }
}
